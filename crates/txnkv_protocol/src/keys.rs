//! ATR key namespace and partitioning.
//!
//! ATRs are a fixed set of documents per collection, named
//! `_txn:atr-<index>`. A document key is mapped onto one of them with the
//! same CRC32C-based partitioning the cluster uses for vbuckets, so
//! co-located documents tend to share an ATR.

/// Number of ATR documents per collection unless configured otherwise.
pub const DEFAULT_NUM_ATRS: usize = 1024;

/// Prefix of every ATR document key.
pub const ATR_KEY_PREFIX: &str = "_txn:atr-";

/// Map a document key onto an ATR index.
pub fn atr_index_for_key(key: &[u8], num_atrs: usize) -> usize {
    let crc = crc32fast::hash(key);
    (((crc >> 16) & 0x7fff) as usize) % num_atrs.max(1)
}

/// The ATR document key for an index.
pub fn atr_key_for_index(index: usize) -> String {
    format!("{ATR_KEY_PREFIX}{index}")
}

/// The ATR document key a document key maps onto.
pub fn atr_key_for_doc(key: &[u8], num_atrs: usize) -> String {
    atr_key_for_index(atr_index_for_key(key, num_atrs))
}

/// All ATR document keys for a collection.
pub fn all_atr_keys(num_atrs: usize) -> Vec<String> {
    (0..num_atrs).map(atr_key_for_index).collect()
}

/// The ATR indexes a lost-cleanup client is responsible for.
///
/// Client `client_index` of `num_active` active clients owns every
/// `num_active`-th ATR starting at its own index. The shards of all active
/// clients partition `0..num_atrs` exactly.
pub fn shards_for_client(
    client_index: usize,
    num_active: usize,
    num_atrs: usize,
) -> Vec<usize> {
    if num_active == 0 {
        return Vec::new();
    }
    (client_index..num_atrs).step_by(num_active).collect()
}
