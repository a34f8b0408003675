//! The lost-cleanup client record.
//!
//! One well-known document per collection tracks every client running lost
//! cleanup against it. Clients heartbeat into their own entry and read the
//! full record to learn how many peers are active, which determines the ATR
//! shards each one owns.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use txnkv_kv::Cas;

/// Key of the client record document.
pub const CLIENT_RECORD_KEY: &str = "_txn:client-record";

/// Root xattr holding the record.
pub const RECORDS_PATH: &str = "records";

/// Path of the per-client map.
pub const CLIENTS_PATH: &str = "records.clients";

/// Path of the override block.
pub const OVERRIDE_PATH: &str = "records.override";

/// Wire field names within a client entry.
pub mod fields {
    /// Heartbeat CAS (server macro).
    pub const HEARTBEAT: &str = "heartbeat_ms";
    /// Liveness window in milliseconds.
    pub const EXPIRES: &str = "expires_ms";
    /// Number of ATRs the client scans.
    pub const NUM_ATRS: &str = "num_atrs";
}

/// Path of a single client's entry.
pub fn client_path(client_uuid: &str) -> String {
    format!("{CLIENTS_PATH}.{client_uuid}")
}

/// Path of a field within a single client's entry.
pub fn client_field(client_uuid: &str, field: &str) -> String {
    format!("{CLIENTS_PATH}.{client_uuid}.{field}")
}

/// One client's entry in the record.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ClientRecordEntry {
    /// CAS hex string of the client's last heartbeat.
    #[serde(
        rename = "heartbeat_ms",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub heartbeat: Option<String>,
    /// How long after the heartbeat the client stays live.
    #[serde(
        rename = "expires_ms",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub expires_ms: Option<u64>,
    /// Number of ATRs the client scans.
    #[serde(rename = "num_atrs", default, skip_serializing_if = "Option::is_none")]
    pub num_atrs: Option<usize>,
}

impl ClientRecordEntry {
    /// The wall-clock milliseconds encoded in the heartbeat CAS.
    pub fn heartbeat_millis(&self) -> Option<u64> {
        self.heartbeat
            .as_deref()
            .and_then(Cas::from_hex)
            .map(|cas| cas.as_millis())
    }

    /// Whether this client's liveness window has lapsed at server time
    /// `hlc_millis`.
    pub fn is_expired(&self, hlc_millis: u64) -> bool {
        let heartbeat = match self.heartbeat_millis() {
            Some(ms) => ms,
            // No parseable heartbeat means no proof of life.
            None => return true,
        };
        let expires = self.expires_ms.unwrap_or(0);
        hlc_millis.saturating_sub(heartbeat) >= expires
    }
}

/// The override block, letting an external agent suspend all clients.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ClientOverride {
    /// Whether the override is switched on.
    #[serde(default)]
    pub enabled: bool,
    /// Server nanosecond timestamp the override lapses at.
    #[serde(default)]
    pub expires: u64,
}

impl ClientOverride {
    /// Whether the override currently suppresses cleanup.
    pub fn is_active(&self, hlc_nanos: u64) -> bool {
        self.enabled && self.expires > hlc_nanos
    }
}

/// The full client record.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ClientRecords {
    /// Per-client entries, keyed by client UUID.
    #[serde(default)]
    pub clients: HashMap<String, ClientRecordEntry>,
    /// Optional override block.
    #[serde(rename = "override", default, skip_serializing_if = "Option::is_none")]
    pub override_config: Option<ClientOverride>,
}

/// The `$vbucket.HLC` virtual xattr payload.
#[derive(Debug, Clone, Deserialize)]
pub struct HlcPayload {
    /// Server time in whole seconds, as a decimal string.
    pub now: String,
}

impl HlcPayload {
    /// Server time in whole seconds.
    pub fn now_secs(&self) -> Option<u64> {
        self.now.parse().ok()
    }

    /// Server time in milliseconds.
    pub fn now_millis(&self) -> Option<u64> {
        self.now_secs().map(|s| s * 1_000)
    }

    /// Server time in nanoseconds.
    pub fn now_nanos(&self) -> Option<u64> {
        self.now_secs().map(|s| s * 1_000_000_000)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn record_round_trips() {
        let mut records = ClientRecords::default();
        records.clients.insert(
            "uuid-1".to_string(),
            ClientRecordEntry {
                heartbeat: Some(Cas::new(60_000_000_000).to_hex()),
                expires_ms: Some(80_000),
                num_atrs: Some(1024),
            },
        );
        let json = serde_json::to_value(&records).unwrap();
        assert_eq!(json["clients"]["uuid-1"]["expires_ms"], 80_000);
        assert!(json.get("override").is_none());
        let back: ClientRecords = serde_json::from_value(json).unwrap();
        assert_eq!(back.clients["uuid-1"].heartbeat_millis(), Some(60_000));
    }

    #[test]
    fn expiry_is_relative_to_heartbeat() {
        let entry = ClientRecordEntry {
            heartbeat: Some(Cas::new(10_000 * 1_000_000).to_hex()),
            expires_ms: Some(5_000),
            num_atrs: Some(1024),
        };
        assert!(!entry.is_expired(14_999));
        assert!(entry.is_expired(15_000));
    }

    #[test]
    fn missing_heartbeat_counts_as_expired() {
        let entry = ClientRecordEntry::default();
        assert!(entry.is_expired(0));
    }

    #[test]
    fn override_requires_enabled_and_unexpired() {
        let over = ClientOverride {
            enabled: true,
            expires: 1_000,
        };
        assert!(over.is_active(999));
        assert!(!over.is_active(1_000));
        let off = ClientOverride {
            enabled: false,
            expires: u64::MAX,
        };
        assert!(!off.is_active(0));
    }

    #[test]
    fn hlc_parses_decimal_seconds() {
        let hlc: HlcPayload = serde_json::from_str(r#"{"now":"1700000000","mode":"real"}"#).unwrap();
        assert_eq!(hlc.now_secs(), Some(1_700_000_000));
        assert_eq!(hlc.now_millis(), Some(1_700_000_000_000));
    }
}
