//! # txnkv wire and record formats
//!
//! Every record the transaction engine persists into the cluster:
//! - [`atr`]: Active Transaction Record entries and their field layout
//! - [`doc`]: the hidden `txn` xattr block staged onto documents
//! - [`client_record`]: the lost-cleanup client record
//! - [`forward_compat`]: forward-compatibility requirement entries
//! - [`serialized`]: the serialized-attempt envelope
//! - [`keys`]: the ATR key namespace and its CRC32 partitioning
//!
//! Field names here are wire names. They are deliberately terse (`st`,
//! `tst`, `tid`) because they are written into every transactional document
//! and every ATR entry; the serde types give them readable Rust names.

#![deny(unsafe_code)]
#![warn(missing_docs)]

pub mod atr;
pub mod client_record;
pub mod doc;
pub mod forward_compat;
pub mod keys;
pub mod serialized;

pub use atr::{AtrAttempts, AtrEntry, AtrMutationRef, AtrState};
pub use client_record::{ClientOverride, ClientRecordEntry, ClientRecords, HlcPayload};
pub use doc::{StagedOpType, TxnXattr, TxnXattrAtr, TxnXattrId, TxnXattrOp, TxnXattrRestore};
pub use forward_compat::{
    check_forward_compat, ForwardCompatDecision, ForwardCompatEntry, ForwardCompatMap,
    ForwardCompatStage,
};
pub use keys::{
    all_atr_keys, atr_index_for_key, atr_key_for_doc, atr_key_for_index, shards_for_client,
    ATR_KEY_PREFIX, DEFAULT_NUM_ATRS,
};
pub use serialized::{
    SerializedAttempt, SerializedAtr, SerializedConfig, SerializedId, SerializedMutation,
    SerializedState,
};
