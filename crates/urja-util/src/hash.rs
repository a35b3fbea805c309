//! BLAKE3 digests for cache keys and content hashes.

/// Length of the truncated digests used for cache keys and file names.
pub const SHORT_HASH_LEN: usize = 8;

/// Hex BLAKE3 digest of `data`.
#[must_use]
pub fn blake3_bytes(data: &[u8]) -> String {
    blake3::hash(data).to_hex().to_string()
}

/// First [`SHORT_HASH_LEN`] hex characters of the BLAKE3 digest of `data`.
#[must_use]
pub fn short_hash(data: &[u8]) -> String {
    let mut hex = blake3_bytes(data);
    hex.truncate(SHORT_HASH_LEN);
    hex
}

/// Incremental hasher over several labelled inputs.
///
/// Each part is length-prefixed so `("ab", "c")` and `("a", "bc")` differ.
#[derive(Debug, Default)]
pub struct ContentHasher {
    inner: blake3::Hasher,
}

impl ContentHasher {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed one part.
    pub fn update(&mut self, part: &[u8]) -> &mut Self {
        self.inner.update(&(part.len() as u64).to_le_bytes());
        self.inner.update(part);
        self
    }

    /// Feed a string part.
    pub fn update_str(&mut self, part: &str) -> &mut Self {
        self.update(part.as_bytes())
    }

    /// Hex digest truncated to [`SHORT_HASH_LEN`].
    #[must_use]
    pub fn finish_short(&self) -> String {
        let mut hex = self.inner.finalize().to_hex().to_string();
        hex.truncate(SHORT_HASH_LEN);
        hex
    }

    /// Full hex digest.
    #[must_use]
    pub fn finish(&self) -> String {
        self.inner.finalize().to_hex().to_string()
    }
}
