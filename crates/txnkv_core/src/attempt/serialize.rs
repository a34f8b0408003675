//! Packing a pending attempt for resumption elsewhere.

use txnkv_protocol::{
    SerializedAtr, SerializedAttempt, SerializedConfig, SerializedId, SerializedMutation,
    SerializedState, StagedOpType,
};

use crate::attempt::{Attempt, AttemptState};
use crate::error::{ErrorCause, Failure, TxnError, TxnResult};

impl Attempt {
    /// Pack the attempt into a JSON envelope another process can resume.
    ///
    /// Only legal while the attempt is pending with no operation in flight;
    /// after the envelope is handed out this process must not drive the
    /// attempt further.
    pub fn serialize(&self) -> TxnResult<Vec<u8>> {
        let inner = self.lock();
        if inner.draining
            || inner.ops_in_flight > 0
            || !matches!(
                inner.state,
                AttemptState::NothingWritten | AttemptState::Pending
            )
        {
            return Err(Failure::new(ErrorCause::IllegalState(format!(
                "cannot serialize {} attempt with {} operations in flight",
                inner.state, inner.ops_in_flight
            )))
            .no_retry()
            .into());
        }

        let atr = match &inner.atr {
            Some(atr) => SerializedAtr {
                bucket: Some(atr.keyspace.bucket.clone()),
                scope: Some(atr.keyspace.scope.clone()),
                collection: Some(atr.keyspace.collection.clone()),
                key: Some(atr.key.clone()),
            },
            None => SerializedAtr::default(),
        };
        let mutations = inner
            .staged
            .iter()
            .map(|m| SerializedMutation {
                bucket: m.keyspace.bucket.clone(),
                scope: m.keyspace.scope.clone(),
                collection: m.keyspace.collection.clone(),
                key: m.key.clone(),
                cas: m.cas.to_hex(),
                op_type: match m.op_type {
                    StagedOpType::Insert => "insert",
                    StagedOpType::Replace => "replace",
                    StagedOpType::Remove => "remove",
                }
                .to_string(),
            })
            .collect();
        let time_left = self
            .expiry_time()
            .saturating_duration_since(std::time::Instant::now());

        let envelope = SerializedAttempt {
            id: SerializedId {
                transaction_id: self.transaction_id().to_string(),
                attempt_id: self.id().to_string(),
            },
            atr,
            config: SerializedConfig {
                kv_timeout_ms: Some(self.kv_timeout().as_millis() as u64),
                num_atrs: Some(self.num_atrs()),
                durability: Some(self.durability().shorthand().to_string()),
            },
            state: SerializedState {
                time_left_ms: time_left.as_millis() as u64,
            },
            mutations,
        };
        serde_json::to_vec(&envelope).map_err(|err| TxnError::Serialization(err.to_string()))
    }
}
