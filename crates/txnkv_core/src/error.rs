//! Error classification and attempt-level failures.
//!
//! Every failure the engine sees, from the KV layer or from an injected test
//! hook, is folded into a small set of [`ErrorClass`]es; all retry and
//! rollback decisions are driven by the class alone. Attempt-level failures
//! ([`Failure`]) additionally carry the three decisions the application
//! needs: whether the transaction may be retried, whether rollback is still
//! allowed, and which reason to surface.

use thiserror::Error;
use txnkv_kv::KvError;

/// Coarse classification of any failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Worth retrying the operation after a backoff.
    Transient,
    /// The document does not exist.
    DocNotFound,
    /// The document already exists.
    DocExists,
    /// A sub-document path does not exist.
    PathNotFound,
    /// A sub-document path already exists.
    PathExists,
    /// CAS-guarded mutation lost a race.
    CasMismatch,
    /// Another attempt holds a staged mutation on the document.
    WriteWriteConflict,
    /// Unrecoverable failure; give up immediately.
    Hard,
    /// The outcome of a write is unknown (lost acknowledgment).
    Ambiguous,
    /// The attempt's time budget is exhausted.
    Expiry,
    /// The server rejected the write for lack of space.
    OutOfSpace,
    /// Anything else.
    Other,
}

/// Classify a KV-layer error.
pub fn classify_kv(err: &KvError) -> ErrorClass {
    match err {
        KvError::DocumentNotFound => ErrorClass::DocNotFound,
        KvError::DocumentExists => ErrorClass::DocExists,
        KvError::PathNotFound(_) => ErrorClass::PathNotFound,
        KvError::PathExists(_) => ErrorClass::PathExists,
        KvError::CasMismatch => ErrorClass::CasMismatch,
        KvError::Temporary | KvError::DocumentLocked => ErrorClass::Transient,
        KvError::Timeout => ErrorClass::Expiry,
        KvError::DurabilityAmbiguous => ErrorClass::Ambiguous,
        KvError::OutOfSpace => ErrorClass::OutOfSpace,
        KvError::AccessDenied(_) | KvError::BucketNotFound(_) => ErrorClass::Hard,
        KvError::CollectionNotFound(_)
        | KvError::InvalidArgument(_)
        | KvError::Encoding(_)
        | KvError::Server(_) => ErrorClass::Other,
    }
}

/// Underlying cause of an attempt-level failure.
#[derive(Debug, Clone, Error)]
pub enum ErrorCause {
    /// A KV operation failed.
    #[error(transparent)]
    Kv(#[from] KvError),
    /// The attempt's time budget is exhausted.
    #[error("attempt expired")]
    AttemptExpired,
    /// A bounded operation kept failing after the attempt entered expiry
    /// overtime.
    #[error("attempt expired and gave up during {0}")]
    ExpiredInOvertime(&'static str),
    /// Another attempt holds an unresolved staged mutation on the document.
    #[error("write-write conflict on {key}")]
    WriteWriteConflict {
        /// The contended document key.
        key: String,
    },
    /// The ATR document rejected the entry for lack of space.
    #[error("active transaction record is full")]
    AtrFull,
    /// The ATR document has gone missing mid-attempt.
    #[error("active transaction record not found")]
    AtrNotFound,
    /// The attempt's ATR entry has gone missing mid-attempt.
    #[error("active transaction record entry not found")]
    AtrEntryNotFound,
    /// An operation was issued against an attempt in the wrong state.
    #[error("illegal state: {0}")]
    IllegalState(String),
    /// A previous operation already failed this attempt.
    #[error("previous operation failed")]
    PreviousOperationFailed,
    /// A persisted record demands a capability this client lacks.
    #[error("forward compatibility requirement unmet at stage {stage}")]
    ForwardCompat {
        /// The interaction stage the requirement was keyed by.
        stage: &'static str,
    },
}

/// Classify an attempt-level cause.
pub fn classify_cause(cause: &ErrorCause) -> ErrorClass {
    match cause {
        ErrorCause::Kv(err) => classify_kv(err),
        ErrorCause::AttemptExpired | ErrorCause::ExpiredInOvertime(_) => ErrorClass::Expiry,
        ErrorCause::WriteWriteConflict { .. } => ErrorClass::WriteWriteConflict,
        ErrorCause::AtrFull => ErrorClass::OutOfSpace,
        ErrorCause::AtrNotFound | ErrorCause::AtrEntryNotFound => ErrorClass::Hard,
        ErrorCause::IllegalState(_) | ErrorCause::PreviousOperationFailed => ErrorClass::Other,
        ErrorCause::ForwardCompat { .. } => ErrorClass::Other,
    }
}

/// The application-visible reason of a failed attempt.
///
/// Ordered by severity; merging concurrent failures keeps the worst.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum FailureReason {
    /// The attempt failed before its commit point; nothing committed.
    Failed,
    /// The attempt ran out of time before its commit point.
    Expired,
    /// The commit write's outcome could not be determined.
    CommitAmbiguous,
    /// The commit point passed but unstaging did not fully complete.
    FailedPostCommit,
}

/// Retry/rollback restrictions carried by a failure.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FailureFlags {
    /// The transaction must not be retried as a new attempt.
    pub should_not_retry: bool,
    /// The attempt must not be rolled back.
    pub should_not_rollback: bool,
}

impl FailureFlags {
    /// Take the union of restrictions with another set.
    pub fn merge(&mut self, other: FailureFlags) {
        self.should_not_retry |= other.should_not_retry;
        self.should_not_rollback |= other.should_not_rollback;
    }
}

/// An attempt-level failure.
#[derive(Debug, Clone, Error)]
#[error("transaction operation failed ({reason:?}): {cause}")]
pub struct Failure {
    /// Underlying cause.
    pub cause: ErrorCause,
    /// Classification of the cause.
    pub class: ErrorClass,
    /// Retry/rollback restrictions.
    pub flags: FailureFlags,
    /// Application-visible reason.
    pub reason: FailureReason,
}

impl Failure {
    /// A failure with default restrictions (retryable, rollback allowed).
    pub fn new(cause: ErrorCause) -> Self {
        let class = classify_cause(&cause);
        Failure {
            cause,
            class,
            flags: FailureFlags::default(),
            reason: FailureReason::Failed,
        }
    }

    /// Forbid retrying the transaction.
    pub fn no_retry(mut self) -> Self {
        self.flags.should_not_retry = true;
        self
    }

    /// Forbid rolling back the attempt.
    pub fn no_rollback(mut self) -> Self {
        self.flags.should_not_rollback = true;
        self
    }

    /// Set the application-visible reason.
    pub fn with_reason(mut self, reason: FailureReason) -> Self {
        self.reason = reason;
        self
    }

    /// Whether the cause is a missing document.
    pub fn is_doc_not_found(&self) -> bool {
        self.class == ErrorClass::DocNotFound
    }

    /// Whether the cause is a pre-existing document.
    pub fn is_doc_exists(&self) -> bool {
        self.class == ErrorClass::DocExists
    }
}

/// Merge failures from concurrent sub-operations into one.
///
/// The worst reason wins; restrictions are unioned; the surviving cause is
/// the first one carrying the worst reason.
pub fn merge_failures(failures: Vec<Failure>) -> Option<Failure> {
    let mut iter = failures.into_iter();
    let mut merged = iter.next()?;
    for failure in iter {
        merged.flags.merge(failure.flags);
        if failure.reason > merged.reason {
            merged.cause = failure.cause;
            merged.class = failure.class;
            merged.reason = failure.reason;
        }
    }
    Some(merged)
}

/// Top-level errors surfaced by the public API.
#[derive(Debug, Error)]
pub enum TxnError {
    /// An attempt-level operation failed.
    #[error(transparent)]
    Failed(#[from] Failure),
    /// The requested document does not exist.
    ///
    /// Deliberately not a [`Failure`]: reading a missing document is a
    /// normal outcome and does not poison the attempt.
    #[error("document not found")]
    DocumentNotFound,
    /// The configuration is invalid.
    #[error("invalid configuration: {0}")]
    Config(String),
    /// A serialized attempt could not be parsed or is incomplete.
    #[error("serialized attempt malformed: {0}")]
    Serialization(String),
}

/// Result alias for the public API.
pub type TxnResult<T> = Result<T, TxnError>;

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn kv_errors_classify_into_taxonomy() {
        assert_eq!(classify_kv(&KvError::Temporary), ErrorClass::Transient);
        assert_eq!(classify_kv(&KvError::DocumentLocked), ErrorClass::Transient);
        assert_eq!(
            classify_kv(&KvError::DurabilityAmbiguous),
            ErrorClass::Ambiguous
        );
        assert_eq!(classify_kv(&KvError::Timeout), ErrorClass::Expiry);
        assert_eq!(classify_kv(&KvError::OutOfSpace), ErrorClass::OutOfSpace);
        assert_eq!(
            classify_kv(&KvError::AccessDenied("no".to_string())),
            ErrorClass::Hard
        );
        assert_eq!(
            classify_kv(&KvError::Server("hiccup".to_string())),
            ErrorClass::Other
        );
    }

    #[test]
    fn failure_reasons_order_by_severity() {
        assert!(FailureReason::Failed < FailureReason::Expired);
        assert!(FailureReason::Expired < FailureReason::CommitAmbiguous);
        assert!(FailureReason::CommitAmbiguous < FailureReason::FailedPostCommit);
    }

    #[test]
    fn merge_keeps_worst_reason_and_unions_flags() {
        let a = Failure::new(ErrorCause::Kv(KvError::Temporary));
        let b = Failure::new(ErrorCause::Kv(KvError::CasMismatch))
            .no_retry()
            .with_reason(FailureReason::FailedPostCommit);
        let c = Failure::new(ErrorCause::AttemptExpired).with_reason(FailureReason::Expired);
        let merged = merge_failures(vec![a, b, c]).unwrap();
        assert_eq!(merged.reason, FailureReason::FailedPostCommit);
        assert!(merged.flags.should_not_retry);
        assert!(!merged.flags.should_not_rollback);
        assert_eq!(merged.class, ErrorClass::CasMismatch);
    }

    #[test]
    fn merge_of_nothing_is_nothing() {
        assert!(merge_failures(Vec::new()).is_none());
    }

    #[test]
    fn builders_compose() {
        let failure = Failure::new(ErrorCause::AtrFull)
            .no_retry()
            .with_reason(FailureReason::Expired);
        assert_eq!(failure.class, ErrorClass::OutOfSpace);
        assert!(failure.flags.should_not_retry);
        assert!(!failure.flags.should_not_rollback);
        assert_eq!(failure.reason, FailureReason::Expired);
    }

    fn arb_failure() -> impl Strategy<Value = Failure> {
        let reasons = prop_oneof![
            Just(FailureReason::Failed),
            Just(FailureReason::Expired),
            Just(FailureReason::CommitAmbiguous),
            Just(FailureReason::FailedPostCommit),
        ];
        (reasons, any::<bool>(), any::<bool>()).prop_map(|(reason, no_retry, no_rollback)| {
            let mut failure = Failure::new(ErrorCause::Kv(KvError::Temporary)).with_reason(reason);
            if no_retry {
                failure = failure.no_retry();
            }
            if no_rollback {
                failure = failure.no_rollback();
            }
            failure
        })
    }

    proptest! {
        #[test]
        fn merge_never_loses_severity_or_restrictions(
            failures in proptest::collection::vec(arb_failure(), 1..8),
        ) {
            let worst = failures.iter().map(|f| f.reason).max().unwrap();
            let no_retry = failures.iter().any(|f| f.flags.should_not_retry);
            let no_rollback = failures.iter().any(|f| f.flags.should_not_rollback);
            let merged = merge_failures(failures).unwrap();
            prop_assert_eq!(merged.reason, worst);
            prop_assert_eq!(merged.flags.should_not_retry, no_retry);
            prop_assert_eq!(merged.flags.should_not_rollback, no_rollback);
        }
    }
}
