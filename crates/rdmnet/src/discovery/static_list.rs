// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! A [`DiscoveryAgent`] backed by a fixed entry list.
//!
//! Used when an operator pins the controller address on the command line
//! (discovery bypass) and by tests that need deterministic candidates.

use std::net::SocketAddrV4;

use super::{DiscoveryAgent, DEFAULT_SCOPE};
use crate::core::entry::{ControllerEntry, DistributorEntry};
use crate::Result;

pub struct StaticDiscoveryAgent {
    scope: String,
    controllers: Vec<ControllerEntry>,
    distributors: Vec<DistributorEntry>,
}

impl StaticDiscoveryAgent {
    pub fn new(scope: &str) -> Self {
        Self {
            scope: if scope.is_empty() {
                DEFAULT_SCOPE.to_string()
            } else {
                scope.to_string()
            },
            controllers: Vec::new(),
            distributors: Vec::new(),
        }
    }

    /// A static agent advertising exactly one controller at `address`.
    pub fn with_controller(address: SocketAddrV4, priority: u8) -> Self {
        let mut agent = Self::new(DEFAULT_SCOPE);
        agent.controllers.push(ControllerEntry {
            address,
            priority,
            scope: DEFAULT_SCOPE.to_string(),
            ..ControllerEntry::default()
        });
        agent
    }
}

impl DiscoveryAgent for StaticDiscoveryAgent {
    fn start(&mut self) -> Result<()> {
        Ok(())
    }

    fn stop(&mut self) {}

    fn set_scope(&mut self, scope: &str) {
        self.scope = scope.to_string();
        self.controllers.retain(|e| e.scope == scope);
        self.distributors.retain(|e| e.scope == scope);
    }

    fn list_controllers(&self, out: &mut Vec<ControllerEntry>) {
        out.extend(self.controllers.iter().cloned());
    }

    fn list_distributors(&self, out: &mut Vec<DistributorEntry>) {
        out.extend(self.distributors.iter().cloned());
    }

    fn register_controller(&mut self, entry: ControllerEntry) {
        match self
            .controllers
            .iter_mut()
            .find(|e| e.address == entry.address)
        {
            Some(existing) => existing.update_from(&entry),
            None => self.controllers.push(entry),
        }
    }

    fn register_distributor(&mut self, entry: DistributorEntry) {
        match self
            .distributors
            .iter_mut()
            .find(|e| e.address == entry.address)
        {
            Some(existing) => *existing = entry,
            None => self.distributors.push(entry),
        }
    }

    fn deregister(&mut self, address: SocketAddrV4) {
        self.controllers.retain(|e| e.address != address);
        self.distributors.retain(|e| e.address != address);
    }
}

// ============================================================================
// Tests
// ============================================================================
