//! The attempt's staged-mutation list.

use serde_json::Value;
use txnkv_kv::{Cas, KeySpace};
use txnkv_protocol::{AtrMutationRef, StagedOpType};

/// One staged mutation held by an attempt.
#[derive(Debug, Clone)]
pub struct StagedMutation {
    /// Operation kind.
    pub op_type: StagedOpType,
    /// Keyspace of the target document.
    pub keyspace: KeySpace,
    /// Key of the target document.
    pub key: String,
    /// CAS produced by the staging mutation.
    pub cas: Cas,
    /// CAS of the document before this attempt first staged onto it;
    /// `None` when the attempt created the document.
    pub restore_cas: Option<Cas>,
    /// Staged body; `None` for removes and for resumed attempts whose
    /// staged bodies must be re-fetched at unstage time.
    pub staged_value: Option<Value>,
}

impl StagedMutation {
    /// The document reference recorded in ATR entry lists.
    pub fn atr_ref(&self) -> AtrMutationRef {
        AtrMutationRef {
            bucket: self.keyspace.bucket.clone(),
            scope: self.keyspace.scope.clone(),
            collection: self.keyspace.collection.clone(),
            key: self.key.clone(),
        }
    }

    /// Whether this mutation targets the given document.
    pub fn targets(&self, keyspace: &KeySpace, key: &str) -> bool {
        self.keyspace == *keyspace && self.key == key
    }
}

/// Split a staged-mutation list into the three ATR entry arrays.
pub fn atr_lists(
    staged: &[StagedMutation],
) -> (
    Vec<AtrMutationRef>,
    Vec<AtrMutationRef>,
    Vec<AtrMutationRef>,
) {
    let mut inserts = Vec::new();
    let mut replaces = Vec::new();
    let mut removes = Vec::new();
    for mutation in staged {
        let target = match mutation.op_type {
            StagedOpType::Insert => &mut inserts,
            StagedOpType::Replace => &mut replaces,
            StagedOpType::Remove => &mut removes,
        };
        target.push(mutation.atr_ref());
    }
    (inserts, replaces, removes)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn staged(op_type: StagedOpType, key: &str) -> StagedMutation {
        StagedMutation {
            op_type,
            keyspace: KeySpace::default_for_bucket("main"),
            key: key.to_string(),
            cas: Cas::new(1),
            restore_cas: None,
            staged_value: None,
        }
    }

    #[test]
    fn lists_split_by_op_type() {
        let mutations = vec![
            staged(StagedOpType::Insert, "a"),
            staged(StagedOpType::Remove, "b"),
            staged(StagedOpType::Insert, "c"),
        ];
        let (ins, rep, rem) = atr_lists(&mutations);
        assert_eq!(ins.len(), 2);
        assert!(rep.is_empty());
        assert_eq!(rem[0].key, "b");
    }

    #[test]
    fn targets_matches_keyspace_and_key() {
        let m = staged(StagedOpType::Replace, "a");
        assert!(m.targets(&KeySpace::default_for_bucket("main"), "a"));
        assert!(!m.targets(&KeySpace::default_for_bucket("other"), "a"));
        assert!(!m.targets(&KeySpace::default_for_bucket("main"), "b"));
    }
}
