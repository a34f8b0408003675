//! Forward-compatibility requirement entries.
//!
//! Records written by newer clients may carry requirements keyed by
//! interaction stage: "to interact with this record at this stage you must
//! support protocol version X or extension E, otherwise fail or retry".
//! Older clients honour the requirement rather than misinterpreting state
//! they do not understand.

use std::collections::HashMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Protocol version this client implements.
pub const PROTOCOL_VERSION: (u64, u64) = (2, 0);

/// Extension codes this client implements.
pub const SUPPORTED_EXTENSIONS: &[&str] = &["TI", "MO", "CO", "UA", "CM", "SD", "RC"];

/// Behaviour code: fail the interaction.
pub const BEHAVIOUR_FAIL: &str = "f";
/// Behaviour code: retry the transaction.
pub const BEHAVIOUR_RETRY: &str = "r";

/// A single requirement entry.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ForwardCompatEntry {
    /// Required protocol version, `"major.minor"`.
    #[serde(rename = "p", default, skip_serializing_if = "Option::is_none")]
    pub protocol_version: Option<String>,
    /// Required extension code.
    #[serde(rename = "e", default, skip_serializing_if = "Option::is_none")]
    pub extension: Option<String>,
    /// Behaviour when the requirement is unmet.
    #[serde(rename = "b", default, skip_serializing_if = "Option::is_none")]
    pub behaviour: Option<String>,
    /// Retry backoff in milliseconds, for retry behaviour.
    #[serde(rename = "ra", default, skip_serializing_if = "Option::is_none")]
    pub retry_interval_ms: Option<u64>,
}

/// Requirements keyed by stage code.
pub type ForwardCompatMap = HashMap<String, Vec<ForwardCompatEntry>>;

/// The interaction stages requirements can be keyed by.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ForwardCompatStage {
    /// Reading a document carrying a foreign staged mutation.
    Gets,
    /// Reading the ATR entry behind a foreign staged mutation.
    GetsReadingAtr,
    /// Resolving a write-write conflict before replacing.
    WriteWriteConflictReplacing,
    /// Resolving a write-write conflict before removing.
    WriteWriteConflictRemoving,
    /// Resolving a write-write conflict before inserting.
    WriteWriteConflictInserting,
    /// Reading the ATR entry during write-write conflict resolution.
    WriteWriteConflictReadingAtr,
    /// Cleaning up an ATR entry.
    CleanupEntry,
}

impl ForwardCompatStage {
    /// The wire code of this stage.
    pub fn as_str(&self) -> &'static str {
        match self {
            ForwardCompatStage::Gets => "G",
            ForwardCompatStage::GetsReadingAtr => "G_A",
            ForwardCompatStage::WriteWriteConflictReplacing => "WW_RP",
            ForwardCompatStage::WriteWriteConflictRemoving => "WW_RM",
            ForwardCompatStage::WriteWriteConflictInserting => "WW_I",
            ForwardCompatStage::WriteWriteConflictReadingAtr => "WW_R",
            ForwardCompatStage::CleanupEntry => "CL_E",
        }
    }
}

/// Outcome of checking requirements at a stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ForwardCompatDecision {
    /// All requirements met; proceed.
    Ok,
    /// Unmet requirement; fail the interaction.
    Fail,
    /// Unmet requirement; retry the transaction, optionally after a backoff.
    Retry {
        /// Backoff before retrying, if the record specified one.
        after: Option<Duration>,
    },
}

fn version_supported(required: &str) -> bool {
    let mut parts = required.splitn(2, '.');
    let major: u64 = match parts.next().and_then(|p| p.parse().ok()) {
        Some(v) => v,
        // Unparseable requirement: assume it is from a future scheme we do
        // not support.
        None => return false,
    };
    let minor: u64 = parts.next().and_then(|p| p.parse().ok()).unwrap_or(0);
    (major, minor) <= PROTOCOL_VERSION
}

fn entry_met(entry: &ForwardCompatEntry) -> bool {
    if let Some(version) = &entry.protocol_version {
        if !version_supported(version) {
            return false;
        }
    }
    if let Some(ext) = &entry.extension {
        if !SUPPORTED_EXTENSIONS.contains(&ext.as_str()) {
            return false;
        }
    }
    true
}

/// Check the requirements for `stage` in `map`.
///
/// A missing map or missing stage key means no requirements. The first
/// unmet entry decides the outcome; an unmet entry without a behaviour code
/// fails.
pub fn check_forward_compat(
    stage: ForwardCompatStage,
    map: Option<&ForwardCompatMap>,
) -> ForwardCompatDecision {
    let entries = match map.and_then(|m| m.get(stage.as_str())) {
        Some(entries) => entries,
        None => return ForwardCompatDecision::Ok,
    };
    for entry in entries {
        if entry_met(entry) {
            continue;
        }
        if entry.behaviour.as_deref() == Some(BEHAVIOUR_RETRY) {
            return ForwardCompatDecision::Retry {
                after: entry.retry_interval_ms.map(Duration::from_millis),
            };
        }
        return ForwardCompatDecision::Fail;
    }
    ForwardCompatDecision::Ok
}

#[cfg(test)]
mod tests {
    use super::*;

    fn map_with(stage: ForwardCompatStage, entry: ForwardCompatEntry) -> ForwardCompatMap {
        let mut map = ForwardCompatMap::new();
        map.insert(stage.as_str().to_string(), vec![entry]);
        map
    }

    #[test]
    fn empty_map_is_ok() {
        assert_eq!(
            check_forward_compat(ForwardCompatStage::Gets, None),
            ForwardCompatDecision::Ok
        );
        let map = ForwardCompatMap::new();
        assert_eq!(
            check_forward_compat(ForwardCompatStage::Gets, Some(&map)),
            ForwardCompatDecision::Ok
        );
    }

    #[test]
    fn met_version_requirement_is_ok() {
        let map = map_with(
            ForwardCompatStage::Gets,
            ForwardCompatEntry {
                protocol_version: Some("2.0".to_string()),
                ..Default::default()
            },
        );
        assert_eq!(
            check_forward_compat(ForwardCompatStage::Gets, Some(&map)),
            ForwardCompatDecision::Ok
        );
    }

    #[test]
    fn future_version_fails_by_default() {
        let map = map_with(
            ForwardCompatStage::Gets,
            ForwardCompatEntry {
                protocol_version: Some("2.1".to_string()),
                ..Default::default()
            },
        );
        assert_eq!(
            check_forward_compat(ForwardCompatStage::Gets, Some(&map)),
            ForwardCompatDecision::Fail
        );
    }

    #[test]
    fn unknown_extension_with_retry_behaviour_retries() {
        let map = map_with(
            ForwardCompatStage::CleanupEntry,
            ForwardCompatEntry {
                extension: Some("ZZ".to_string()),
                behaviour: Some(BEHAVIOUR_RETRY.to_string()),
                retry_interval_ms: Some(250),
                ..Default::default()
            },
        );
        assert_eq!(
            check_forward_compat(ForwardCompatStage::CleanupEntry, Some(&map)),
            ForwardCompatDecision::Retry {
                after: Some(Duration::from_millis(250))
            }
        );
    }

    #[test]
    fn requirements_only_apply_to_their_stage() {
        let map = map_with(
            ForwardCompatStage::Gets,
            ForwardCompatEntry {
                protocol_version: Some("99.0".to_string()),
                ..Default::default()
            },
        );
        assert_eq!(
            check_forward_compat(ForwardCompatStage::CleanupEntry, Some(&map)),
            ForwardCompatDecision::Ok
        );
    }
}
