//! # txnkv testkit
//!
//! Test utilities for txnkv:
//! - [`fixtures`]: an in-memory cluster harness with document seeding and
//!   xattr inspection helpers
//! - [`faults`]: programmable hooks that inject KV errors or forced expiry
//!   at precise protocol steps
//!
//! The workspace's cross-crate integration tests live in this crate's
//! `tests/` directory.

#![deny(unsafe_code)]
#![warn(missing_docs)]

pub mod faults;
pub mod fixtures;

pub use faults::FailpointHooks;
pub use fixtures::{fast_config, init_logging, TestCluster};
