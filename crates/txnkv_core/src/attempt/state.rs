//! Attempt lifecycle states.

use std::fmt;

use txnkv_kv::KeySpace;

/// The lifecycle of one attempt.
///
/// States only advance forward:
/// `NothingWritten → Pending → Committing → Committed → Completed` on the
/// commit path, `Pending → Aborted → RolledBack` on the rollback path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttemptState {
    /// No ATR entry exists yet; rollback is trivial.
    NothingWritten,
    /// The ATR entry is written; mutations are being staged.
    Pending,
    /// Commit has been requested; the committed transition is in flight.
    Committing,
    /// The commit point passed; staged values are authoritative.
    Committed,
    /// Every staged mutation was unstaged and the ATR entry deleted.
    Completed,
    /// Rollback decided; staged metadata is being removed.
    Aborted,
    /// All staged metadata removed and the ATR entry deleted.
    RolledBack,
}

impl AttemptState {
    /// Whether application document operations may run in this state.
    pub fn accepts_user_ops(&self) -> bool {
        matches!(self, AttemptState::NothingWritten | AttemptState::Pending)
    }

    /// Whether this is a terminal state.
    pub fn is_terminal(&self) -> bool {
        matches!(self, AttemptState::Completed | AttemptState::RolledBack)
    }
}

impl fmt::Display for AttemptState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            AttemptState::NothingWritten => "nothing-written",
            AttemptState::Pending => "pending",
            AttemptState::Committing => "committing",
            AttemptState::Committed => "committed",
            AttemptState::Completed => "completed",
            AttemptState::Aborted => "aborted",
            AttemptState::RolledBack => "rolled-back",
        };
        f.write_str(name)
    }
}

/// Where an attempt's ATR entry lives.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AtrLocation {
    /// Keyspace holding the ATR document.
    pub keyspace: KeySpace,
    /// ATR document key.
    pub key: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn user_ops_only_before_commit_or_rollback() {
        assert!(AttemptState::NothingWritten.accepts_user_ops());
        assert!(AttemptState::Pending.accepts_user_ops());
        assert!(!AttemptState::Committing.accepts_user_ops());
        assert!(!AttemptState::Committed.accepts_user_ops());
        assert!(!AttemptState::Aborted.accepts_user_ops());
    }

    #[test]
    fn only_completed_and_rolled_back_are_terminal() {
        assert!(AttemptState::Completed.is_terminal());
        assert!(AttemptState::RolledBack.is_terminal());
        assert!(!AttemptState::Committed.is_terminal());
        assert!(!AttemptState::NothingWritten.is_terminal());
    }
}
