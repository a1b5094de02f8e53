//! Fixed-size secret buffers that are wiped on every exit path.

use zeroize::{Zeroize, ZeroizeOnDrop};

/// Length of conditioner keys, residuals and output digests.
pub const SECRET_LEN: usize = 32;

/// A 32-byte secret zeroised when dropped.
///
/// Deliberately not `Clone`: a secret lives in exactly one place.
#[derive(Zeroize, ZeroizeOnDrop)]
pub struct SecretBlock([u8; SECRET_LEN]);

impl SecretBlock {
    pub fn zeroed() -> Self {
        Self([0u8; SECRET_LEN])
    }

    /// Build from a digest-sized slice. Shorter input is zero-padded, longer
    /// input is truncated.
    pub fn from_slice(bytes: &[u8]) -> Self {
        let mut block = Self::zeroed();
        block.overwrite(bytes);
        block
    }

    pub fn as_bytes(&self) -> &[u8; SECRET_LEN] {
        &self.0
    }

    pub fn as_mut_bytes(&mut self) -> &mut [u8; SECRET_LEN] {
        &mut self.0
    }

    /// Replace the contents in place.
    pub fn overwrite(&mut self, bytes: &[u8]) {
        let n = bytes.len().min(SECRET_LEN);
        self.0[..n].copy_from_slice(&bytes[..n]);
        self.0[n..].fill(0);
    }

    /// XOR `bytes` into the block in place.
    pub fn xor_in(&mut self, bytes: &[u8]) {
        for (dst, src) in self.0.iter_mut().zip(bytes) {
            *dst ^= src;
        }
    }

    pub fn is_zero(&self) -> bool {
        self.0.iter().all(|&b| b == 0)
    }

    /// Constant-time equality.
    pub fn ct_eq(&self, other: &SecretBlock) -> bool {
        self.0
            .iter()
            .zip(other.0.iter())
            .fold(0u8, |acc, (a, b)| acc | (a ^ b))
            == 0
    }

    pub fn wipe(&mut self) {
        self.0.zeroize();
    }
}

impl std::fmt::Debug for SecretBlock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("SecretBlock(..)")
    }
}
