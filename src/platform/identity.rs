//! Stable device identity used at registration
//!
//! Preference order: explicit override from the environment, then the
//! hardware MAC addresses, then the hostname.

use mac_address::MacAddressIterator;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// Environment variable that overrides the detected identity
pub const IDENTITY_ENV: &str = "FIELDSYNC_IDENTITY";

/// One identity claim submitted at registration
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct IdentityEntry {
    #[serde(rename = "type")]
    pub kind: String,
    pub value: String,
}

impl IdentityEntry {
    fn new(kind: &str, value: impl Into<String>) -> Self {
        Self {
            kind: kind.to_string(),
            value: value.into(),
        }
    }
}

/// Collect the identity of this device
pub fn collect_identity() -> Vec<IdentityEntry> {
    let override_value = std::env::var(IDENTITY_ENV).ok();
    let macs = collect_mac_addresses();
    resolve_identity(override_value, macs, hostname())
}

/// Label presented alongside the identity
pub fn device_label() -> String {
    hostname().unwrap_or_else(|| "unknown".to_string())
}

/// System hostname, if known
pub fn hostname() -> Option<String> {
    sysinfo::System::host_name().filter(|h| !h.is_empty())
}

fn resolve_identity(
    override_value: Option<String>,
    macs: Vec<String>,
    hostname: Option<String>,
) -> Vec<IdentityEntry> {
    if let Some(value) = override_value.map(|v| v.trim().to_string()).filter(|v| !v.is_empty()) {
        return vec![IdentityEntry::new("custom", value)];
    }

    if !macs.is_empty() {
        return macs
            .into_iter()
            .map(|mac| IdentityEntry::new("mac", mac))
            .collect();
    }

    match hostname {
        Some(name) => vec![IdentityEntry::new("hostname", name)],
        None => Vec::new(),
    }
}

fn collect_mac_addresses() -> Vec<String> {
    let iter = match MacAddressIterator::new() {
        Ok(iter) => iter,
        Err(e) => {
            tracing::warn!("Failed to enumerate network interfaces: {}", e);
            return Vec::new();
        }
    };

    // BTreeSet keeps the ordering stable between runs
    let mut macs = BTreeSet::new();
    for mac in iter {
        let bytes = mac.bytes();
        if bytes == [0, 0, 0, 0, 0, 0] {
            continue;
        }

        let mac_str = bytes
            .iter()
            .map(|b| format!("{:02x}", b))
            .collect::<Vec<_>>()
            .join(":");
        macs.insert(mac_str);
    }

    macs.into_iter().collect()
}
