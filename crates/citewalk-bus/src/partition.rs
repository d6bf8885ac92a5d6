//! Partition selection for appends.

use std::sync::atomic::{AtomicU32, Ordering};

use sha2::{Digest, Sha256};

/// Picks the partition for each publish.
///
/// Keyed records hash to a fixed partition so the mapping is identical in
/// every process. Unkeyed records rotate round-robin.
#[derive(Debug, Default)]
pub struct Partitioner {
    next: AtomicU32,
}

impl Partitioner {
    pub fn select(&self, key: Option<&str>, partitions: u32) -> u32 {
        let partitions = partitions.max(1);
        match key {
            Some(k) => key_hash(k) % partitions,
            None => self.next.fetch_add(1, Ordering::Relaxed) % partitions,
        }
    }
}

fn key_hash(key: &str) -> u32 {
    let digest = Sha256::digest(key.as_bytes());
    u32::from_be_bytes([digest[0], digest[1], digest[2], digest[3]])
}
