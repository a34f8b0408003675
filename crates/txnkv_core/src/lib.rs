//! # txnkv transaction engine
//!
//! Client-side multi-document transactions over a distributed KV store that
//! offers only per-document compare-and-swap. Mutations are staged invisibly
//! in a hidden xattr block on each target document, an Active Transaction
//! Record (ATR) entry serves as the atomic commit point, and readers resolve
//! in-flight documents through that entry for monotonic-atomic-view reads.
//!
//! Entry point is [`Transactions`]: configure it with
//! [`TransactionsConfig`], begin a [`Transaction`], run your logic against an
//! [`Attempt`], and commit or roll back. Attempts that fail retryably are
//! discarded and retried from a fresh [`Attempt`] under the same transaction
//! time budget.
//!
//! Background cleanup comes in two flavours: a regular queue finishing this
//! client's own failed attempts, and a lost-cleanup scanner that cooperates
//! with other clients through a shared client record to finish attempts
//! whose owner died.

#![deny(unsafe_code)]
#![warn(missing_docs)]

pub mod attempt;
pub mod cleanup;
pub mod config;
pub mod error;
pub mod hooks;
pub mod lost;
pub mod manager;

pub use attempt::{Attempt, AtrLocation, AttemptState, StagedMutation, TxnGetResult};
pub use cleanup::{Cleaner, CleanupRequest, DocRecord};
pub use config::{PerTransactionConfig, TransactionsConfig};
pub use error::{
    ErrorCause, ErrorClass, Failure, FailureFlags, FailureReason, TxnError, TxnResult,
};
pub use hooks::{CleanupHooks, ClientRecordHooks, DefaultHooks, TransactionHooks};
pub use lost::{LostCleaner, Sharding};
pub use manager::{Transaction, Transactions};
