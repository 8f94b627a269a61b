// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Authoritative map from RDM UID to the device's UDP endpoint.
//!
//! Each entry records which peer the knowledge came from: `local` entries
//! belong to devices whose TCP session this controller owns; remote
//! entries were learned from peer-controller gossip. The registry is a
//! pure data structure; gossip emission is the mesh's job.
//!
//! Invariants:
//! - at most one entry per UID;
//! - remote entries always carry the peer they were learned via, and are
//!   bulk-removed when that peer's session closes.

use std::collections::BTreeMap;
use std::net::SocketAddrV4;

use log::{info, warn};

use crate::acn::controller::DeviceTuple;
use crate::core::uid::RdmUid;

/// One known device.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct DeviceRegistryEntry {
    /// Where the device listens for RDM over UDP.
    pub udp_endpoint: SocketAddrV4,

    /// The TCP peer this knowledge arrived on: the device itself for
    /// local entries, the gossiping controller for remote ones.
    pub learned_via: SocketAddrV4,

    /// Whether this controller owns the device's TCP session.
    pub local: bool,
}

/// Result of an owner-checked release.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ReleaseOutcome {
    Removed,
    /// The sender does not own the entry; nothing was removed.
    OwnerMismatch,
    NotFound,
}

#[derive(Debug, Default)]
pub struct DeviceRegistry {
    entries: BTreeMap<RdmUid, DeviceRegistryEntry>,
}

impl DeviceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn get(&self, uid: &RdmUid) -> Option<&DeviceRegistryEntry> {
        self.entries.get(uid)
    }

    /// Record a device we own, replacing any prior entry for the UID.
    pub fn upsert_local(
        &mut self,
        uid: RdmUid,
        udp_endpoint: SocketAddrV4,
        owner_session: SocketAddrV4,
    ) -> Option<DeviceRegistryEntry> {
        self.entries.insert(
            uid,
            DeviceRegistryEntry {
                udp_endpoint,
                learned_via: owner_session,
                local: true,
            },
        )
    }

    /// Record a device learned via gossip, replacing any prior entry.
    pub fn upsert_remote(
        &mut self,
        uid: RdmUid,
        udp_endpoint: SocketAddrV4,
        learned_via: SocketAddrV4,
    ) -> Option<DeviceRegistryEntry> {
        self.entries.insert(
            uid,
            DeviceRegistryEntry {
                udp_endpoint,
                learned_via,
                local: false,
            },
        )
    }

    /// Remove a local entry (the device's session closed or it deregistered).
    pub fn release_local(&mut self, uid: &RdmUid) -> Option<DeviceRegistryEntry> {
        self.entries.remove(uid)
    }

    /// Remove an entry on behalf of `sender`, but only if the sender owns
    /// it.
    pub fn release_from(&mut self, uid: &RdmUid, sender: SocketAddrV4) -> ReleaseOutcome {
        let Some(entry) = self.entries.get(uid) else {
            warn!("release for {} but UID not in map, inconsistent state", uid);
            return ReleaseOutcome::NotFound;
        };
        if entry.learned_via != sender {
            warn!(
                "release for {}, owner mismatch {} != {}",
                uid, entry.learned_via, sender
            );
            return ReleaseOutcome::OwnerMismatch;
        }
        self.entries.remove(uid);
        ReleaseOutcome::Removed
    }

    /// Drop every entry learned via `peer`. Returns what was removed.
    pub fn forget_peer(&mut self, peer: SocketAddrV4) -> Vec<(RdmUid, DeviceRegistryEntry)> {
        let uids: Vec<RdmUid> = self
            .entries
            .iter()
            .filter(|(_, entry)| entry.learned_via == peer)
            .map(|(uid, _)| *uid)
            .collect();
        let mut removed = Vec::with_capacity(uids.len());
        for uid in uids {
            info!("removed UID {}", uid);
            if let Some(entry) = self.entries.remove(&uid) {
                removed.push((uid, entry));
            }
        }
        removed
    }

    /// The local entries, as device tuples, for `FETCH_DEVICES` replies.
    pub fn snapshot_local(&self) -> Vec<DeviceTuple> {
        self.entries
            .iter()
            .filter(|(_, entry)| entry.local)
            .map(|(uid, entry)| DeviceTuple::new(entry.udp_endpoint, *uid))
            .collect()
    }

    /// Iterate all entries in UID order.
    pub fn iter(&self) -> impl Iterator<Item = (&RdmUid, &DeviceRegistryEntry)> {
        self.entries.iter()
    }
}

// ============================================================================
// Tests
// ============================================================================
