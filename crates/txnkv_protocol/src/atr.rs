//! Active Transaction Record entries.
//!
//! An ATR document carries one entry per attempt under the `attempts` xattr,
//! keyed by attempt ID. Entries are written field-by-field with sub-document
//! mutations, so alongside the serde type this module exposes the wire field
//! names and path builders the engine and cleanup use.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use txnkv_kv::Cas;

use crate::forward_compat::ForwardCompatMap;

/// Root xattr holding all attempt entries on an ATR document.
pub const ATTEMPTS_PATH: &str = "attempts";

/// Wire field names within an ATR entry.
pub mod fields {
    /// Transaction ID.
    pub const TRANSACTION_ID: &str = "tid";
    /// Attempt state.
    pub const STATE: &str = "st";
    /// CAS at the pending transition (server macro).
    pub const PENDING_CAS: &str = "tst";
    /// CAS at the commit transition (server macro).
    pub const COMMIT_CAS: &str = "tsc";
    /// CAS at the rollback transition (server macro).
    pub const ROLLBACK_CAS: &str = "tsrs";
    /// Expiry window in milliseconds, relative to the pending CAS.
    pub const EXPIRY_MS: &str = "exp";
    /// Durability shorthand the attempt mutates with.
    pub const DURABILITY: &str = "d";
    /// Staged inserts.
    pub const INSERTS: &str = "ins";
    /// Staged replaces.
    pub const REPLACES: &str = "rep";
    /// Staged removes.
    pub const REMOVES: &str = "rem";
    /// Forward-compatibility requirements.
    pub const FORWARD_COMPAT: &str = "fc";
    /// Placeholder written before deleting a still-pending entry.
    pub const PENDING_SENTINEL: &str = "p";
}

/// Path of an attempt's entry within the ATR xattrs.
pub fn attempt_path(attempt_id: &str) -> String {
    format!("{ATTEMPTS_PATH}.{attempt_id}")
}

/// Path of a single field within an attempt's entry.
pub fn attempt_field(attempt_id: &str, field: &str) -> String {
    format!("{ATTEMPTS_PATH}.{attempt_id}.{field}")
}

/// State recorded in an ATR entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AtrState {
    /// Attempt is staging mutations.
    #[serde(rename = "PENDING")]
    Pending,
    /// Commit point passed; staged values are authoritative.
    #[serde(rename = "COMMITTED")]
    Committed,
    /// All staged values unstaged.
    #[serde(rename = "COMPLETED")]
    Completed,
    /// Rollback decided; staged values must be discarded.
    #[serde(rename = "ABORTED")]
    Aborted,
    /// All staged metadata removed after rollback.
    #[serde(rename = "ROLLED_BACK")]
    RolledBack,
    /// A state written by a newer client this one does not know.
    #[serde(other)]
    Unknown,
}

/// Reference to a staged document recorded in an ATR entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AtrMutationRef {
    /// Bucket name.
    #[serde(rename = "bkt")]
    pub bucket: String,
    /// Scope name.
    #[serde(rename = "scp")]
    pub scope: String,
    /// Collection name.
    #[serde(rename = "col")]
    pub collection: String,
    /// Document key.
    #[serde(rename = "id")]
    pub key: String,
}

/// A parsed ATR entry.
///
/// Every field is optional: cleanup reads entries written by crashed or
/// foreign clients and must tolerate any subset being present.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AtrEntry {
    /// Transaction ID.
    #[serde(rename = "tid", default, skip_serializing_if = "Option::is_none")]
    pub transaction_id: Option<String>,
    /// Attempt state.
    #[serde(rename = "st", default, skip_serializing_if = "Option::is_none")]
    pub state: Option<AtrState>,
    /// CAS hex string written at the pending transition.
    #[serde(rename = "tst", default, skip_serializing_if = "Option::is_none")]
    pub pending_cas: Option<String>,
    /// CAS hex string written at the commit transition.
    #[serde(rename = "tsc", default, skip_serializing_if = "Option::is_none")]
    pub commit_cas: Option<String>,
    /// CAS hex string written at the rollback transition.
    #[serde(rename = "tsrs", default, skip_serializing_if = "Option::is_none")]
    pub rollback_cas: Option<String>,
    /// Expiry window in milliseconds.
    #[serde(rename = "exp", default, skip_serializing_if = "Option::is_none")]
    pub expiry_ms: Option<u64>,
    /// Durability shorthand.
    #[serde(rename = "d", default, skip_serializing_if = "Option::is_none")]
    pub durability: Option<String>,
    /// Staged inserts.
    #[serde(rename = "ins", default, skip_serializing_if = "Option::is_none")]
    pub inserts: Option<Vec<AtrMutationRef>>,
    /// Staged replaces.
    #[serde(rename = "rep", default, skip_serializing_if = "Option::is_none")]
    pub replaces: Option<Vec<AtrMutationRef>>,
    /// Staged removes.
    #[serde(rename = "rem", default, skip_serializing_if = "Option::is_none")]
    pub removes: Option<Vec<AtrMutationRef>>,
    /// Forward-compatibility requirements, keyed by stage.
    #[serde(rename = "fc", default, skip_serializing_if = "Option::is_none")]
    pub forward_compat: Option<ForwardCompatMap>,
}

impl AtrEntry {
    /// The wall-clock milliseconds encoded in the pending-transition CAS,
    /// if present and well-formed.
    pub fn pending_cas_millis(&self) -> Option<u64> {
        self.pending_cas
            .as_deref()
            .and_then(Cas::from_hex)
            .map(|cas| cas.as_millis())
    }
}

/// The full `attempts` xattr of an ATR document.
pub type AtrAttempts = HashMap<String, AtrEntry>;
