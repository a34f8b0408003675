//! # txnkv KV client abstraction
//!
//! The capability surface the transaction engine consumes from a distributed
//! document store:
//! - whole-document get / add / set / delete with CAS
//! - sub-document lookups and mutations, including xattr paths
//! - durability levels on mutations
//! - server macro expansion (`${Mutation.CAS}`, `${Mutation.value_crc32c}`)
//!
//! This crate provides:
//! - [`KvClient`] and [`BucketProvider`] traits
//! - [`KvError`] covering the failure surface the engine classifies
//! - [`MemoryCluster`], an in-memory implementation with a logical clock
//!
//! No transaction semantics live here.

#![deny(unsafe_code)]
#![warn(missing_docs)]

pub mod client;
pub mod error;
pub mod memory;
pub mod types;

pub use client::{
    BucketProvider, DeleteOptions, DocFlags, GetOptions, GetResult, KvClient, LookupInOp,
    LookupInOptions, LookupInResult, MutateInOp, MutateInOpType, MutateInOptions, MutateInResult,
    StoreOptions, StoreResult, MACRO_CAS, MACRO_VALUE_CRC32C, VATTR_DOCUMENT, VATTR_HLC,
};
pub use error::{KvError, KvResult};
pub use memory::{LogicalClock, MemoryBucket, MemoryCluster};
pub use types::{Cas, DurabilityLevel, KeySpace, ResourceUnits};
