use sha2::{Digest, Sha256};

/// A single block hash: the low 63 bits of a SHA-256 digest over a
/// fixed-size run of token ids, sign-bit masked off so the value fits a
/// signed 64-bit integer in any downstream store.
pub type BlockHash = u64;

const SIGN_MASK: u64 = 0x7FFF_FFFF_FFFF_FFFF;

/// Hash one block of token ids. Tokens are serialized as big-endian u32
/// before hashing so the digest is architecture-independent.
pub fn hash_block(tokens: &[u32]) -> BlockHash {
    let mut hasher = Sha256::new();
    for tok in tokens {
        hasher.update(tok.to_be_bytes());
    }
    let digest = hasher.finalize();
    let mut low8 = [0u8; 8];
    low8.copy_from_slice(&digest[24..32]);
    u64::from_be_bytes(low8) & SIGN_MASK
}

/// Split a token sequence into fixed-size blocks and hash each one, up to
/// `max_blocks`. A trailing partial block shorter than `block_size` is
/// still hashed as a "short block" (the caller decides whether to keep it -
/// the prefix store only counts it if it collides with an existing hash).
pub fn hash_token_blocks(tokens: &[u32], block_size: usize, max_blocks: usize) -> Vec<BlockHash> {
    if block_size == 0 || tokens.is_empty() {
        return Vec::new();
    }

    tokens
        .chunks(block_size)
        .take(max_blocks)
        .map(hash_block)
        .collect()
}
