//! Build-and-publish path: turns an update request into a published tree.
//!
//! Each update carries a prompt and the responses sampled from it. They
//! are flattened into one composite sequence, indexed by a fresh suffix
//! tree, and published under the prompt hash. A superseded tree is
//! destroyed by the publishing thread after the registry lock is released,
//! so lookups always observe either the old tree or the new one.

use std::sync::Arc;

use crate::arena::SharedArena;
use crate::error::CacheError;
use crate::tree::{self, TERMINATOR};

/// How many trailing prompt tokens are repeated in front of every
/// response, letting a pattern that ends in prompt context match into the
/// start of a generation without duplicating the whole prompt.
pub const PREFIX_BRIDGE: usize = 5;

/// Flatten a prompt and its responses into the composite sequence fed to
/// one suffix tree:
///
/// ```text
/// [ prompt ] -1 [ bridge response_0 ] -1 [ bridge response_1 ] -1 ...
/// ```
///
/// where `bridge` is the last `min(PREFIX_BRIDGE, |prompt|)` prompt
/// tokens. The `-1` separators stop matches from leaping across
/// responses.
pub fn build_composite(prompt: &[i32], responses: &[Vec<i32>]) -> Vec<i32> {
    let bridge_len = prompt.len().min(PREFIX_BRIDGE);
    let bridge = &prompt[prompt.len() - bridge_len..];

    let response_tokens: usize = responses.iter().map(|r| r.len() + bridge_len + 1).sum();
    let mut tokens = Vec::with_capacity(prompt.len() + 1 + response_tokens);

    if !prompt.is_empty() {
        tokens.extend_from_slice(prompt);
        tokens.push(TERMINATOR);
    }
    for response in responses {
        tokens.extend_from_slice(bridge);
        tokens.extend_from_slice(response);
        tokens.push(TERMINATOR);
    }
    tokens
}

/// Host-side update service: one per update server process.
pub struct UpdateService {
    arena: Arc<SharedArena>,
}

impl UpdateService {
    pub fn new(arena: Arc<SharedArena>) -> Self {
        Self { arena }
    }

    pub fn arena(&self) -> &Arc<SharedArena> {
        &self.arena
    }

    /// Build a tree for `(prompt, responses)` and publish it under
    /// `prompt_hash`, replacing and destroying any previous tree for the
    /// same hash. Nothing is published if allocation fails.
    pub fn apply(
        &self,
        prompt_hash: u64,
        prompt: &[i32],
        responses: &[Vec<i32>],
    ) -> Result<(), CacheError> {
        let tokens = build_composite(prompt, responses);
        let tree_off = tree::build_in(&self.arena, &tokens)?;

        let superseded = {
            let lock = self.arena.lock();
            match self.arena.registry().publish(&lock, prompt_hash, tree_off) {
                Ok(old) => old,
                Err(err) => {
                    drop(lock);
                    self.arena.free(tree_off);
                    return Err(err);
                }
            }
        };
        if let Some(old) = superseded {
            self.arena.free(old);
            tracing::debug!(prompt_hash, "replaced previously published tree");
        }
        tracing::debug!(
            prompt_hash,
            tokens = tokens.len(),
            responses = responses.len(),
            "published suffix tree"
        );
        Ok(())
    }

    /// Unpublish and destroy the tree for `prompt_hash`. Returns whether
    /// a tree was evicted.
    pub fn evict_tree(&self, prompt_hash: u64) -> bool {
        let removed = {
            let lock = self.arena.lock();
            self.arena.registry().remove(&lock, prompt_hash)
        };
        match removed {
            Some(off) => {
                self.arena.free(off);
                true
            }
            None => false,
        }
    }

    /// Destroy every published tree and clear the registry. Called on
    /// server shutdown.
    pub fn drain(&self) {
        let trees = {
            let lock = self.arena.lock();
            self.arena.registry().drain(&lock)
        };
        let count = trees.len();
        for off in trees {
            self.arena.free(off);
        }
        tracing::info!(trees = count, "drained tree registry");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arena::test_support::small_arena;

    #[test]
    fn composite_layout_is_exact() {
        let tokens = build_composite(&[1, 2, 3], &[vec![20, 21], vec![30]]);
        assert_eq!(
            tokens,
            vec![1, 2, 3, -1, 1, 2, 3, 20, 21, -1, 1, 2, 3, 30, -1]
        );
    }

    #[test]
    fn composite_bridge_caps_at_five_prompt_tokens() {
        let prompt = vec![1, 2, 3, 4, 5, 6, 7];
        let tokens = build_composite(&prompt, &[vec![9]]);
        assert_eq!(
            tokens,
            vec![1, 2, 3, 4, 5, 6, 7, -1, 3, 4, 5, 6, 7, 9, -1]
        );
    }

    #[test]
    fn composite_with_empty_prompt_has_no_leading_block() {
        let tokens = build_composite(&[], &[vec![8, 9]]);
        assert_eq!(tokens, vec![8, 9, -1]);
    }

    #[test]
    fn composite_with_no_responses_is_just_the_prompt() {
        let tokens = build_composite(&[4, 5], &[]);
        assert_eq!(tokens, vec![4, 5, -1]);
    }

    #[test]
    fn apply_publishes_and_replaces() {
        let arena = Arc::new(small_arena("update-apply"));
        let service = UpdateService::new(arena.clone());

        service.apply(77, &[1, 2, 3], &[vec![5, 6]]).unwrap();
        let first = {
            let lock = arena.lock();
            arena.registry().lookup(&lock, 77).unwrap()
        };

        service.apply(77, &[1, 2, 3], &[vec![5, 7]]).unwrap();
        let second = {
            let lock = arena.lock();
            arena.registry().lookup(&lock, 77).unwrap()
        };
        assert_ne!(first, second);

        // The superseded block was freed: an equally sized allocation
        // gets it back.
        let reused = arena.alloc_bulk(16).unwrap();
        assert_eq!(reused, first);
    }

    #[test]
    fn evict_tree_unpublishes() {
        let arena = Arc::new(small_arena("update-evict"));
        let service = UpdateService::new(arena.clone());
        service.apply(5, &[1, 2, 3], &[vec![4]]).unwrap();
        assert!(service.evict_tree(5));
        assert!(!service.evict_tree(5));
        let lock = arena.lock();
        assert_eq!(arena.registry().lookup(&lock, 5), None);
    }

    #[test]
    fn drain_destroys_everything() {
        let arena = Arc::new(small_arena("update-drain"));
        let service = UpdateService::new(arena.clone());
        for hash in 0..5u64 {
            service.apply(hash, &[1, 2, 3], &[vec![4, 5]]).unwrap();
        }
        service.drain();
        let lock = arena.lock();
        assert!(arena.registry().is_empty(&lock));
    }

    #[test]
    fn failed_allocation_publishes_nothing() {
        let arena = Arc::new(small_arena("update-oom"));
        let service = UpdateService::new(arena.clone());
        let huge = vec![vec![0i32; 3 * 1024 * 1024]];
        let err = service.apply(9, &[1, 2], &huge).unwrap_err();
        assert!(matches!(err, CacheError::OutOfSpace { .. }));
        let lock = arena.lock();
        assert_eq!(arena.registry().lookup(&lock, 9), None);
    }
}
