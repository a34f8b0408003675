//! The serialized-attempt envelope.
//!
//! A pending attempt can be packed into JSON, shipped to another process,
//! and resumed there. The envelope carries the attempt's identity, its ATR
//! location, the configuration the resuming side must honour, the remaining
//! time budget, and every staged mutation with its CAS.

use serde::{Deserialize, Serialize};

/// Identity of the serialized attempt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SerializedId {
    /// Transaction ID.
    #[serde(rename = "txn")]
    pub transaction_id: String,
    /// Attempt ID.
    #[serde(rename = "atmpt")]
    pub attempt_id: String,
}

/// Location of the attempt's ATR, if one has been selected.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SerializedAtr {
    /// Bucket name.
    #[serde(rename = "bkt", default, skip_serializing_if = "Option::is_none")]
    pub bucket: Option<String>,
    /// Scope name.
    #[serde(rename = "scp", default, skip_serializing_if = "Option::is_none")]
    pub scope: Option<String>,
    /// Collection name.
    #[serde(rename = "coll", default, skip_serializing_if = "Option::is_none")]
    pub collection: Option<String>,
    /// ATR document key.
    #[serde(rename = "id", default, skip_serializing_if = "Option::is_none")]
    pub key: Option<String>,
}

/// Configuration the resuming side must honour.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SerializedConfig {
    /// Per-operation KV timeout in milliseconds.
    #[serde(
        rename = "kvTimeoutMs",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub kv_timeout_ms: Option<u64>,
    /// Number of ATRs per collection.
    #[serde(rename = "numAtrs", default, skip_serializing_if = "Option::is_none")]
    pub num_atrs: Option<usize>,
    /// Durability shorthand.
    #[serde(
        rename = "durabilityLevel",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub durability: Option<String>,
}

/// Remaining time budget.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SerializedState {
    /// Milliseconds left before the attempt expires.
    #[serde(rename = "timeLeftMs", default)]
    pub time_left_ms: u64,
}

/// One staged mutation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SerializedMutation {
    /// Bucket name.
    #[serde(rename = "bkt")]
    pub bucket: String,
    /// Scope name.
    #[serde(rename = "scp")]
    pub scope: String,
    /// Collection name.
    #[serde(rename = "coll")]
    pub collection: String,
    /// Document key.
    #[serde(rename = "id")]
    pub key: String,
    /// CAS of the staged document, hex form.
    pub cas: String,
    /// Staged operation kind (`insert`, `replace`, `remove`).
    #[serde(rename = "type")]
    pub op_type: String,
}

/// The full envelope.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SerializedAttempt {
    /// Identity.
    pub id: SerializedId,
    /// ATR location.
    #[serde(default)]
    pub atr: SerializedAtr,
    /// Configuration to honour on resume.
    #[serde(default)]
    pub config: SerializedConfig,
    /// Remaining time budget.
    #[serde(default)]
    pub state: SerializedState,
    /// Staged mutations.
    #[serde(default)]
    pub mutations: Vec<SerializedMutation>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn envelope_round_trips() {
        let env = SerializedAttempt {
            id: SerializedId {
                transaction_id: "t-1".to_string(),
                attempt_id: "a-1".to_string(),
            },
            atr: SerializedAtr {
                bucket: Some("main".to_string()),
                scope: Some("_default".to_string()),
                collection: Some("_default".to_string()),
                key: Some("_txn:atr-3".to_string()),
            },
            config: SerializedConfig {
                kv_timeout_ms: Some(2500),
                num_atrs: Some(1024),
                durability: Some("m".to_string()),
            },
            state: SerializedState { time_left_ms: 9000 },
            mutations: vec![SerializedMutation {
                bucket: "main".to_string(),
                scope: "_default".to_string(),
                collection: "_default".to_string(),
                key: "doc-1".to_string(),
                cas: "0x0000000000000010".to_string(),
                op_type: "replace".to_string(),
            }],
        };
        let json = serde_json::to_value(&env).unwrap();
        assert_eq!(json["id"]["atmpt"], "a-1");
        assert_eq!(json["config"]["kvTimeoutMs"], 2500);
        assert_eq!(json["state"]["timeLeftMs"], 9000);
        assert_eq!(json["mutations"][0]["type"], "replace");
        let back: SerializedAttempt = serde_json::from_value(json).unwrap();
        assert_eq!(back.mutations.len(), 1);
        assert_eq!(back.state.time_left_ms, 9000);
    }

    #[test]
    fn minimal_envelope_parses() {
        let back: SerializedAttempt =
            serde_json::from_str(r#"{"id":{"txn":"t","atmpt":"a"}}"#).unwrap();
        assert!(back.atr.key.is_none());
        assert!(back.mutations.is_empty());
    }
}
