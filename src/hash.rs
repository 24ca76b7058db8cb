use sha2::{Digest, Sha256};

use crate::types::Checksum;

/// Build a SHA-256 digest by feeding length-delimited parts into the hasher.
pub fn checksum_with(f: impl FnOnce(&mut ChecksumBuilder)) -> Checksum {
    let mut builder = ChecksumBuilder {
        hasher: Sha256::new(),
    };
    f(&mut builder);
    builder.finish()
}

/// Incremental checksum helper; every part is length-prefixed so `("ab", "c")`
/// and `("a", "bc")` hash differently.
pub struct ChecksumBuilder {
    hasher: Sha256,
}

impl ChecksumBuilder {
    /// Append one length-delimited part.
    pub fn part(&mut self, value: impl AsRef<[u8]>) -> &mut Self {
        let bytes = value.as_ref();
        self.hasher.update((bytes.len() as u64).to_le_bytes());
        self.hasher.update(bytes);
        self
    }

    fn finish(self) -> Checksum {
        to_hex(&self.hasher.finalize())
    }
}

/// Stable shard index for `key` in `0..shard_count`.
///
/// Placement is persisted on disk, so this must stay independent of the
/// std hasher implementation.
pub fn shard_index(key: &str, shard_count: u16) -> u16 {
    let digest = Sha256::digest(key.as_bytes());
    let mut prefix = [0u8; 8];
    prefix.copy_from_slice(&digest[..8]);
    (u64::from_be_bytes(prefix) % u64::from(shard_count.max(1))) as u16
}

fn to_hex(bytes: &[u8]) -> String {
    use std::fmt::Write;
    let mut out = String::with_capacity(bytes.len() * 2);
    for byte in bytes {
        let _ = write!(out, "{byte:02x}");
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parts_are_length_delimited() {
        let left = checksum_with(|b| {
            b.part("ab").part("c");
        });
        let right = checksum_with(|b| {
            b.part("a").part("bc");
        });
        assert_ne!(left, right);
        assert_eq!(left.len(), 64);
    }

    #[test]
    fn shard_index_is_stable_and_in_range() {
        let first = shard_index("news_ko:17", 16);
        assert_eq!(first, shard_index("news_ko:17", 16));
        assert!(first < 16);
        assert_eq!(shard_index("anything", 1), 0);
        assert_eq!(shard_index("anything", 0), 0);
    }
}
