// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! TXT record construction and validation.
//!
//! Building keeps the key order stable so identical entries produce
//! byte-identical records (that is what registration dedup compares).
//! Parsing is strict about the version keys: a missing or mismatched
//! `txtvers`/`e133vers` silently drops the entry, which is how a
//! registrant with a newer record format coexists with us.

use std::collections::HashMap;
use std::net::SocketAddrV4;

use log::warn;

use super::*;
use crate::core::entry::{ControllerEntry, DistributorEntry};
use crate::core::uid::RdmUid;

/// An ordered key=value TXT record.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TxtRecord {
    pairs: Vec<(String, String)>,
}

impl TxtRecord {
    /// The TXT record advertised for a controller.
    pub fn for_controller(entry: &ControllerEntry) -> Self {
        let mut pairs = vec![
            (TXT_VERSION_KEY.to_string(), TXT_VERSION.to_string()),
            (PRIORITY_KEY.to_string(), entry.priority.to_string()),
            (SCOPE_KEY.to_string(), entry.scope.clone()),
            (E133_VERSION_KEY.to_string(), entry.e133_version.to_string()),
        ];
        if entry.uid.is_valid() {
            pairs.push((UID_KEY.to_string(), entry.uid.to_string()));
        }
        if !entry.model.is_empty() {
            pairs.push((MODEL_KEY.to_string(), entry.model.clone()));
        }
        if !entry.manufacturer.is_empty() {
            pairs.push((MANUFACTURER_KEY.to_string(), entry.manufacturer.clone()));
        }
        Self { pairs }
    }

    /// The TXT record advertised for a distributor: no priority, no UID.
    pub fn for_distributor(entry: &DistributorEntry) -> Self {
        let mut pairs = vec![
            (TXT_VERSION_KEY.to_string(), TXT_VERSION.to_string()),
            (SCOPE_KEY.to_string(), entry.scope.clone()),
            (E133_VERSION_KEY.to_string(), entry.e133_version.to_string()),
        ];
        if !entry.model.is_empty() {
            pairs.push((MODEL_KEY.to_string(), entry.model.clone()));
        }
        if !entry.manufacturer.is_empty() {
            pairs.push((MANUFACTURER_KEY.to_string(), entry.manufacturer.clone()));
        }
        Self { pairs }
    }

    pub fn pairs(&self) -> &[(String, String)] {
        &self.pairs
    }

    /// Key/value map for handing to the mDNS daemon.
    pub fn to_map(&self) -> HashMap<String, String> {
        self.pairs.iter().cloned().collect()
    }
}

// ============================================================================
// Parsing
// ============================================================================

fn check_version(
    props: &HashMap<String, String>,
    service_name: &str,
    key: &str,
    expected: u8,
) -> bool {
    let Some(value) = props.get(key) else {
        warn!("{} is missing {} from the TXT record", service_name, key);
        return false;
    };
    match value.parse::<u32>() {
        Ok(version) if version == u32::from(expected) => true,
        Ok(version) => {
            warn!(
                "unknown version for {} : {} for {}",
                key, version, service_name
            );
            false
        }
        Err(_) => {
            warn!(
                "{} has an invalid value of {} for {}",
                service_name, value, key
            );
            false
        }
    }
}

fn extract_string(props: &HashMap<String, String>, key: &str) -> String {
    props.get(key).cloned().unwrap_or_default()
}

/// Validate a controller's TXT record and build its entry.
///
/// Returns `None` (after logging) when the versions mismatch, the scope is
/// missing, or the mandatory priority is absent or out of range.
pub fn parse_controller(
    props: &HashMap<String, String>,
    service_name: &str,
    address: SocketAddrV4,
) -> Option<ControllerEntry> {
    if !check_version(props, service_name, TXT_VERSION_KEY, TXT_VERSION) {
        return None;
    }
    if !check_version(props, service_name, E133_VERSION_KEY, crate::core::entry::E133_VERSION) {
        return None;
    }

    let Some(priority_str) = props.get(PRIORITY_KEY) else {
        warn!(
            "{} is missing {} from the TXT record",
            service_name, PRIORITY_KEY
        );
        return None;
    };
    let priority = match priority_str.parse::<u16>() {
        Ok(p) if p <= u16::from(u8::MAX) => p as u8,
        _ => {
            warn!(
                "{} has an invalid value of {} for {}",
                service_name, priority_str, PRIORITY_KEY
            );
            return None;
        }
    };

    let Some(scope) = props.get(SCOPE_KEY) else {
        warn!(
            "{} is missing {} from the TXT record",
            service_name, SCOPE_KEY
        );
        return None;
    };

    let uid = props
        .get(UID_KEY)
        .and_then(|s| s.parse::<RdmUid>().ok())
        .unwrap_or_else(RdmUid::zero);

    let mut entry = ControllerEntry {
        service_name: service_name.to_string(),
        address,
        priority,
        uid,
        scope: scope.clone(),
        e133_version: crate::core::entry::E133_VERSION,
        model: extract_string(props, MODEL_KEY),
        manufacturer: extract_string(props, MANUFACTURER_KEY),
        ..ControllerEntry::default()
    };
    entry.set_actual_service_name(service_name);
    Some(entry)
}

/// Validate a distributor's TXT record and build its entry.
pub fn parse_distributor(
    props: &HashMap<String, String>,
    service_name: &str,
    address: SocketAddrV4,
) -> Option<DistributorEntry> {
    if !check_version(props, service_name, TXT_VERSION_KEY, TXT_VERSION) {
        return None;
    }
    if !check_version(props, service_name, E133_VERSION_KEY, crate::core::entry::E133_VERSION) {
        return None;
    }
    let Some(scope) = props.get(SCOPE_KEY) else {
        warn!(
            "{} is missing {} from the TXT record",
            service_name, SCOPE_KEY
        );
        return None;
    };

    let mut entry = DistributorEntry {
        service_name: service_name.to_string(),
        address,
        scope: scope.clone(),
        e133_version: crate::core::entry::E133_VERSION,
        model: extract_string(props, MODEL_KEY),
        manufacturer: extract_string(props, MANUFACTURER_KEY),
        ..DistributorEntry::default()
    };
    entry.set_actual_service_name(service_name);
    Some(entry)
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    fn address() -> SocketAddrV4 {
        SocketAddrV4::new(Ipv4Addr::new(192, 0, 2, 1), 5569)
    }

    fn valid_props() -> HashMap<String, String> {
        let mut props = HashMap::new();
        props.insert("txtvers".into(), "1".into());
        props.insert("e133vers".into(), "1".into());
        props.insert("priority".into(), "100".into());
        props.insert("confScope".into(), "default".into());
        props
    }

    #[test]
    fn test_build_controller_record_order() {
        let entry = ControllerEntry {
            address: address(),
            priority: 100,
            scope: "default".into(),
            uid: RdmUid::new(0x7a70, 1),
            model: "m".into(),
            manufacturer: "acme".into(),
            ..ControllerEntry::default()
        };
        let record = TxtRecord::for_controller(&entry);
        let keys: Vec<&str> = record.pairs().iter().map(|(k, _)| k.as_str()).collect();
        assert_eq!(
            keys,
            vec![
                "txtvers",
                "priority",
                "confScope",
                "e133vers",
                "uid",
                "model",
                "manuf"
            ]
        );
    }

    #[test]
    fn test_invalid_uid_omitted_from_record() {
        let entry = ControllerEntry {
            address: address(),
            priority: 100,
            ..ControllerEntry::default()
        };
        let record = TxtRecord::for_controller(&entry);
        assert!(!record.pairs().iter().any(|(k, _)| k == "uid"));
    }

    #[test]
    fn test_identical_entries_build_identical_records() {
        let entry = ControllerEntry {
            address: address(),
            priority: 7,
            ..ControllerEntry::default()
        };
        assert_eq!(
            TxtRecord::for_controller(&entry),
            TxtRecord::for_controller(&entry.clone())
        );
    }

    #[test]
    fn test_parse_valid_controller() {
        let mut props = valid_props();
        props.insert("uid".into(), "7a70:00000001".into());
        props.insert("model".into(), "dimmer".into());

        let entry = parse_controller(&props, "svc", address()).unwrap();
        assert_eq!(entry.priority, 100);
        assert_eq!(entry.scope, "default");
        assert_eq!(entry.uid, RdmUid::new(0x7a70, 1));
        assert_eq!(entry.model, "dimmer");
        assert_eq!(entry.effective_service_name(), "svc");
    }

    #[test]
    fn test_txt_version_mismatch_drops_entry() {
        let mut props = valid_props();
        props.insert("txtvers".into(), "2".into());
        assert!(parse_controller(&props, "svc", address()).is_none());
    }

    #[test]
    fn test_e133_version_mismatch_drops_entry() {
        let mut props = valid_props();
        props.insert("e133vers".into(), "9".into());
        assert!(parse_controller(&props, "svc", address()).is_none());
    }

    #[test]
    fn test_missing_priority_drops_controller() {
        let mut props = valid_props();
        props.remove("priority");
        assert!(parse_controller(&props, "svc", address()).is_none());
    }

    #[test]
    fn test_oversized_priority_drops_controller() {
        let mut props = valid_props();
        props.insert("priority".into(), "300".into());
        assert!(parse_controller(&props, "svc", address()).is_none());
    }

    #[test]
    fn test_malformed_uid_falls_back_to_sentinel() {
        let mut props = valid_props();
        props.insert("uid".into(), "not-a-uid".into());
        let entry = parse_controller(&props, "svc", address()).unwrap();
        assert!(!entry.uid.is_valid());
    }

    #[test]
    fn test_parse_distributor_needs_no_priority() {
        let mut props = valid_props();
        props.remove("priority");
        let entry = parse_distributor(&props, "dist", address()).unwrap();
        assert_eq!(entry.scope, "default");
    }

    #[test]
    fn test_distributor_record_has_no_priority() {
        let entry = DistributorEntry {
            address: address(),
            ..DistributorEntry::default()
        };
        let record = TxtRecord::for_distributor(&entry);
        assert!(!record.pairs().iter().any(|(k, _)| k == "priority"));
        assert!(record.pairs().iter().any(|(k, _)| k == "txtvers"));
    }
}
