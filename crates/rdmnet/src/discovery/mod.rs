// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! DNS-SD discovery and registration of E1.33 controllers and
//! distributors.
//!
//! The [`DiscoveryAgent`] trait is the seam between the control plane and
//! the platform's DNS-SD machinery. Two implementations exist:
//!
//! - [`MdnsDiscoveryAgent`]: the production backend, driving an mDNS
//!   daemon on a dedicated discovery thread.
//! - [`StaticDiscoveryAgent`]: a fixed entry list for deployments that
//!   bypass discovery (`--controller-address`) and for tests.
//!
//! Scopes partition the namespace: scope `X` browses and registers the
//! DNS-SD subtype `_X._sub.<service>`. Entries whose TXT record fails the
//! version checks are dropped before consumers ever see them.

pub mod mdns;
pub mod static_list;
pub mod txt;

pub use mdns::MdnsDiscoveryAgent;
pub use static_list::StaticDiscoveryAgent;

use std::net::SocketAddrV4;

use crate::core::entry::{ControllerEntry, DistributorEntry};
use crate::Result;

// ============================================================================
// Service types and TXT keys
// ============================================================================

// TODO(e133): change to _rdmnet-ctrl._tcp once the service name is
// finalised in the standard.
/// DNS-SD service type for controllers.
pub const E133_CONTROLLER_SERVICE: &str = "_draft-e133-cntrl._tcp.local.";

/// DNS-SD service type for distributors.
pub const E133_DISTRIBUTOR_SERVICE: &str = "_draft-e133-dist._tcp.local.";

/// The scope browsed and registered when none is configured.
pub const DEFAULT_SCOPE: &str = "default";

/// TXT record version expected in `txtvers`.
pub const TXT_VERSION: u8 = 1;

pub const TXT_VERSION_KEY: &str = "txtvers";
pub const E133_VERSION_KEY: &str = "e133vers";
pub const PRIORITY_KEY: &str = "priority";
pub const SCOPE_KEY: &str = "confScope";
pub const UID_KEY: &str = "uid";
pub const MODEL_KEY: &str = "model";
pub const MANUFACTURER_KEY: &str = "manuf";

/// The full service type browsed/registered for a scope.
///
/// Scope `X` maps to the DNS-SD subtype `_X._sub.<service>`; an empty
/// scope uses the bare service type.
pub fn scoped_service_type(service: &str, scope: &str) -> String {
    if scope.is_empty() {
        service.to_string()
    } else {
        format!("_{}._sub.{}", scope, service)
    }
}

// ============================================================================
// The agent seam
// ============================================================================

/// DNS-SD operations the control plane consumes.
///
/// All operations are non-blocking: registration and scope changes are
/// queued to the backend, and the `list_*` snapshots return only entries
/// that are fully resolved (name, address and validated TXT record).
pub trait DiscoveryAgent {
    /// Start the backend. Idempotent.
    fn start(&mut self) -> Result<()>;

    /// Stop the backend and join any internal thread. Idempotent and safe
    /// to call from `Drop`.
    fn stop(&mut self);

    /// Switch scopes. On return, `list_controllers` no longer yields
    /// entries from the old scope; their teardown completes asynchronously
    /// on the backend thread.
    fn set_scope(&mut self, scope: &str);

    /// Snapshot the fully resolved controllers.
    fn list_controllers(&self, out: &mut Vec<ControllerEntry>);

    /// Snapshot the fully resolved distributors.
    fn list_distributors(&self, out: &mut Vec<DistributorEntry>);

    /// Advertise a controller. Re-registering with identical TXT data is a
    /// no-op; a changed scope re-registers from scratch.
    fn register_controller(&mut self, entry: ControllerEntry);

    /// Advertise a distributor.
    fn register_distributor(&mut self, entry: DistributorEntry);

    /// Withdraw whatever is advertised at `address`.
    fn deregister(&mut self, address: SocketAddrV4);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scoped_service_type() {
        assert_eq!(
            scoped_service_type(E133_CONTROLLER_SERVICE, "default"),
            "_default._sub._draft-e133-cntrl._tcp.local."
        );
        assert_eq!(
            scoped_service_type(E133_CONTROLLER_SERVICE, ""),
            E133_CONTROLLER_SERVICE
        );
    }
}
