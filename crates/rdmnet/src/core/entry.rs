// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Controller and distributor entries as discovered (or advertised) via
//! DNS-SD.
//!
//! The fields mirror the A and TXT records of a resolved service. Equality
//! compares the advertised fields only, which is what DNS-SD update
//! suppression needs; the *actual* registered service name (which may have
//! been renamed after a collision) is carried separately and survives
//! [`ControllerEntry::update_from`].

use std::fmt;
use std::net::{Ipv4Addr, SocketAddrV4};

use crate::core::uid::RdmUid;

/// The E1.33 version this implementation speaks.
pub const E133_VERSION: u8 = 1;

fn wildcard() -> SocketAddrV4 {
    SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, 0)
}

/// A controller discovered using DNS-SD, or one we are advertising.
#[derive(Clone, Debug)]
pub struct ControllerEntry {
    /// The requested service name; empty means "derive from the port".
    pub service_name: String,

    /// The controller's TCP address.
    pub address: SocketAddrV4,

    /// The controller's priority (TXT `priority`, 0..=255).
    pub priority: u8,

    /// The controller's UID; the zero sentinel when not advertised.
    pub uid: RdmUid,

    /// The controller's scope (TXT `confScope`).
    pub scope: String,

    /// The version of E1.33 this controller is using.
    pub e133_version: u8,

    /// The controller's model (TXT `model`, optional).
    pub model: String,

    /// The controller's manufacturer (TXT `manuf`, optional).
    pub manufacturer: String,

    pub actual_service_name: String,
}

impl Default for ControllerEntry {
    fn default() -> Self {
        Self {
            service_name: String::new(),
            address: wildcard(),
            priority: 0,
            uid: RdmUid::zero(),
            scope: crate::discovery::DEFAULT_SCOPE.to_string(),
            e133_version: E133_VERSION,
            model: String::new(),
            manufacturer: String::new(),
            actual_service_name: String::new(),
        }
    }
}

impl PartialEq for ControllerEntry {
    fn eq(&self, other: &Self) -> bool {
        self.service_name == other.service_name
            && self.address == other.address
            && self.priority == other.priority
            && self.uid == other.uid
            && self.scope == other.scope
            && self.e133_version == other.e133_version
            && self.model == other.model
            && self.manufacturer == other.manufacturer
    }
}

impl Eq for ControllerEntry {}

impl ControllerEntry {
    /// The name this entry is (or would be) registered under.
    ///
    /// Falls back to the requested name, then to a deterministic name
    /// derived from the port.
    pub fn effective_service_name(&self) -> String {
        if !self.actual_service_name.is_empty() {
            return self.actual_service_name.clone();
        }
        if !self.service_name.is_empty() {
            return self.service_name.clone();
        }
        format!("RDMnet Controller {}", self.address.port())
    }

    /// Record the name the DNS-SD registration actually ended up with.
    pub fn set_actual_service_name(&mut self, name: &str) {
        self.actual_service_name = name.to_string();
    }

    /// Copy all advertised fields from `other`, preserving the actual
    /// registered service name.
    pub fn update_from(&mut self, other: &ControllerEntry) {
        let actual = std::mem::take(&mut self.actual_service_name);
        *self = other.clone();
        self.actual_service_name = actual;
    }
}

impl fmt::Display for ControllerEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} @ {} (scope {}, priority {})",
            self.effective_service_name(),
            self.address,
            self.scope,
            self.priority
        )
    }
}

/// A distributor discovered using DNS-SD, or one we are advertising.
///
/// Same shape as [`ControllerEntry`] minus the priority and UID, which only
/// controllers advertise.
#[derive(Clone, Debug)]
pub struct DistributorEntry {
    pub service_name: String,
    pub address: SocketAddrV4,
    pub scope: String,
    pub e133_version: u8,
    pub model: String,
    pub manufacturer: String,

    pub actual_service_name: String,
}

impl Default for DistributorEntry {
    fn default() -> Self {
        Self {
            service_name: String::new(),
            address: wildcard(),
            scope: crate::discovery::DEFAULT_SCOPE.to_string(),
            e133_version: E133_VERSION,
            model: String::new(),
            manufacturer: String::new(),
            actual_service_name: String::new(),
        }
    }
}

impl PartialEq for DistributorEntry {
    fn eq(&self, other: &Self) -> bool {
        self.service_name == other.service_name
            && self.address == other.address
            && self.scope == other.scope
            && self.e133_version == other.e133_version
            && self.model == other.model
            && self.manufacturer == other.manufacturer
    }
}

impl Eq for DistributorEntry {}

impl DistributorEntry {
    pub fn effective_service_name(&self) -> String {
        if !self.actual_service_name.is_empty() {
            return self.actual_service_name.clone();
        }
        if !self.service_name.is_empty() {
            return self.service_name.clone();
        }
        format!("RDMnet Distributor {}", self.address.port())
    }

    pub fn set_actual_service_name(&mut self, name: &str) {
        self.actual_service_name = name.to_string();
    }
}

impl fmt::Display for DistributorEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} @ {} (scope {})",
            self.effective_service_name(),
            self.address,
            self.scope
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(port: u16, priority: u8) -> ControllerEntry {
        ControllerEntry {
            address: SocketAddrV4::new(Ipv4Addr::new(192, 0, 2, 1), port),
            priority,
            scope: "default".to_string(),
            ..ControllerEntry::default()
        }
    }

    #[test]
    fn test_default_entry() {
        let e = ControllerEntry::default();
        assert_eq!(e.priority, 0);
        assert_eq!(e.e133_version, E133_VERSION);
        assert_eq!(e.scope, "default");
        assert!(!e.uid.is_valid());
    }

    #[test]
    fn test_derived_service_name_is_deterministic() {
        let e = entry(5569, 100);
        assert_eq!(e.effective_service_name(), "RDMnet Controller 5569");
        assert_eq!(e.effective_service_name(), entry(5569, 50).effective_service_name());
    }

    #[test]
    fn test_actual_name_wins() {
        let mut e = entry(5569, 100);
        e.set_actual_service_name("RDMnet Controller 5569 (2)");
        assert_eq!(e.effective_service_name(), "RDMnet Controller 5569 (2)");
    }

    #[test]
    fn test_equality_ignores_actual_name() {
        let mut a = entry(5569, 100);
        let b = entry(5569, 100);
        a.set_actual_service_name("renamed");
        assert_eq!(a, b);
    }

    #[test]
    fn test_update_from_preserves_actual_name() {
        let mut a = entry(5569, 100);
        a.set_actual_service_name("renamed");

        let mut b = entry(5569, 42);
        b.model = "m1".to_string();
        a.update_from(&b);

        assert_eq!(a.priority, 42);
        assert_eq!(a.model, "m1");
        assert_eq!(a.effective_service_name(), "renamed");
    }
}
