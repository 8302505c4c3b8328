//! Prompt hashing.
//!
//! The cache key is XXH64 (seed 0) over the prompt's token stream as
//! little-endian 32-bit integers. Update clients and readers must agree
//! on this bit-for-bit, since the hash travels over the wire.

use std::hash::Hasher;

use twox_hash::XxHash64;

/// 64-bit hash identifying a prompt's family of completions.
pub fn prompt_hash(tokens: &[i32]) -> u64 {
    let mut hasher = XxHash64::with_seed(0);
    for &token in tokens {
        hasher.write(&token.to_le_bytes());
    }
    hasher.finish()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hash_is_deterministic() {
        assert_eq!(prompt_hash(&[1, 2, 3]), prompt_hash(&[1, 2, 3]));
    }

    #[test]
    fn hash_depends_on_order_and_content() {
        assert_ne!(prompt_hash(&[1, 2, 3]), prompt_hash(&[3, 2, 1]));
        assert_ne!(prompt_hash(&[1, 2, 3]), prompt_hash(&[1, 2]));
    }

    #[test]
    fn empty_prompt_hashes_to_the_xxh64_seed_value() {
        // XXH64 of zero bytes with seed 0 is a fixed constant.
        assert_eq!(prompt_hash(&[]), 0xef46_db37_51d8_e999);
    }

    #[test]
    fn negative_tokens_hash_via_twos_complement_bytes() {
        assert_ne!(prompt_hash(&[-1]), prompt_hash(&[1]));
        assert_eq!(prompt_hash(&[-1]), prompt_hash(&[-1]));
    }
}
