//! The hidden `txn` xattr block staged onto documents.
//!
//! While an attempt is in flight, every document it touches carries this
//! block: who staged it, where the governing ATR entry lives, the staged
//! operation and value, and enough metadata to detect interference.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::forward_compat::ForwardCompatMap;

/// Name of the xattr the block lives under.
pub const TXN_XATTR: &str = "txn";

/// Wire paths within the block, rooted at the document.
pub mod paths {
    /// The whole block.
    pub const ROOT: &str = "txn";
    /// Identity of the staging attempt.
    pub const ID: &str = "txn.id";
    /// The staging attempt's ID.
    pub const ATTEMPT_ID: &str = "txn.id.atmpt";
    /// The staged operation.
    pub const OP: &str = "txn.op";
    /// The staged value.
    pub const STAGED: &str = "txn.op.stgd";
    /// CRC32 of the visible body at staging time (server macro).
    pub const CRC32: &str = "txn.op.crc32";
}

/// Identity of the transaction and attempt that staged the block.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TxnXattrId {
    /// Transaction ID.
    #[serde(rename = "txn")]
    pub transaction_id: String,
    /// Attempt ID.
    #[serde(rename = "atmpt")]
    pub attempt_id: String,
}

/// Location of the ATR entry governing the staged mutation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TxnXattrAtr {
    /// ATR document key.
    #[serde(rename = "id")]
    pub key: String,
    /// Bucket holding the ATR.
    #[serde(rename = "bkt")]
    pub bucket: String,
    /// Scope holding the ATR.
    #[serde(rename = "scp")]
    pub scope: String,
    /// Collection holding the ATR.
    #[serde(rename = "coll")]
    pub collection: String,
}

/// Kind of a staged mutation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StagedOpType {
    /// The document did not exist; the staged value creates it.
    Insert,
    /// The staged value replaces the current body.
    Replace,
    /// Commit deletes the document.
    Remove,
}

/// The staged operation itself.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TxnXattrOp {
    /// Operation kind.
    #[serde(rename = "type")]
    pub op_type: StagedOpType,
    /// Staged value; absent for removes.
    #[serde(rename = "stgd", default, skip_serializing_if = "Option::is_none")]
    pub staged: Option<Value>,
    /// CRC32 of the visible body at staging time.
    #[serde(rename = "crc32", default, skip_serializing_if = "Option::is_none")]
    pub crc32: Option<String>,
}

/// Pre-transaction document metadata, kept so an interrupted remove can be
/// distinguished from unrelated writes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TxnXattrRestore {
    /// CAS before staging.
    #[serde(rename = "CAS")]
    pub cas: String,
    /// Expiry before staging.
    #[serde(rename = "exptime")]
    pub exptime: u64,
    /// Revision ID before staging, when the store exposes one.
    #[serde(rename = "revid", default, skip_serializing_if = "Option::is_none")]
    pub revid: Option<String>,
}

/// The complete staged block.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TxnXattr {
    /// Who staged the block.
    pub id: TxnXattrId,
    /// Where the governing ATR entry lives.
    pub atr: TxnXattrAtr,
    /// The staged operation.
    pub op: TxnXattrOp,
    /// Pre-transaction metadata, when the document existed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub restore: Option<TxnXattrRestore>,
    /// Forward-compatibility requirements, keyed by stage.
    #[serde(rename = "fc", default, skip_serializing_if = "Option::is_none")]
    pub forward_compat: Option<ForwardCompatMap>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> TxnXattr {
        TxnXattr {
            id: TxnXattrId {
                transaction_id: "t-9".to_string(),
                attempt_id: "a-1".to_string(),
            },
            atr: TxnXattrAtr {
                key: "_txn:atr-12".to_string(),
                bucket: "main".to_string(),
                scope: "_default".to_string(),
                collection: "_default".to_string(),
            },
            op: TxnXattrOp {
                op_type: StagedOpType::Replace,
                staged: Some(serde_json::json!({"balance": 90})),
                crc32: Some("0x1a2b3c4d".to_string()),
            },
            restore: Some(TxnXattrRestore {
                cas: "0x0000000000000001".to_string(),
                exptime: 0,
                revid: None,
            }),
            forward_compat: None,
        }
    }

    #[test]
    fn block_round_trips_with_wire_names() {
        let json = serde_json::to_value(sample()).unwrap();
        assert_eq!(json["id"]["txn"], "t-9");
        assert_eq!(json["id"]["atmpt"], "a-1");
        assert_eq!(json["atr"]["coll"], "_default");
        assert_eq!(json["op"]["type"], "replace");
        assert_eq!(json["op"]["stgd"]["balance"], 90);
        assert_eq!(json["restore"]["CAS"], "0x0000000000000001");
        assert!(json["restore"].get("revid").is_none());
        let back: TxnXattr = serde_json::from_value(json).unwrap();
        assert_eq!(back.op.op_type, StagedOpType::Replace);
    }

    #[test]
    fn remove_block_omits_staged_value() {
        let mut block = sample();
        block.op = TxnXattrOp {
            op_type: StagedOpType::Remove,
            staged: None,
            crc32: None,
        };
        let json = serde_json::to_value(block).unwrap();
        assert_eq!(json["op"]["type"], "remove");
        assert!(json["op"].get("stgd").is_none());
    }

    #[test]
    fn op_type_wire_names_are_lowercase() {
        assert_eq!(
            serde_json::to_string(&StagedOpType::Insert).unwrap(),
            "\"insert\""
        );
        assert_eq!(
            serde_json::to_string(&StagedOpType::Remove).unwrap(),
            "\"remove\""
        );
    }
}
