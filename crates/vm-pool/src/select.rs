//! Hash-based IP selection
//!
//! Concurrent replicas picking from the same available list would all grab
//! index 0 and conflict on every write. Deriving the index from a digest of
//! the allocation ID spreads simultaneous allocators across the pool, and
//! the same ID under an identical view re-picks the same address, which
//! keeps retried allocations idempotent.

use md5::{Digest, Md5};

/// Picks an index into `available` for `allocation_id`: the first 32 bits
/// of the ID's MD5 digest, taken big-endian, modulo the list length.
pub fn select_ip_index(available: &[String], allocation_id: &str) -> usize {
    if available.len() <= 1 {
        return 0;
    }

    let digest = Md5::digest(allocation_id.as_bytes());
    let seed = u32::from_be_bytes([digest[0], digest[1], digest[2], digest[3]]);

    seed as usize % available.len()
}
