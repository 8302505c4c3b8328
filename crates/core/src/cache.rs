//! Reader-side query API: per-request tree fetches and batched
//! speculation.
//!
//! A [`SuffixCache`] lives in each decoder process. It caches, per active
//! request, the tree published for the request's prompt and an adaptive
//! speculation-length budget. Speculation itself is read-only: published
//! trees never change, so a batch fans out across a fixed worker pool
//! with no shared mutable state.
//!
//! Lifecycle protocol: callers must `evict_responses` for a request
//! before its prompt family can receive another publish while the request
//! is live; otherwise a cached tree reference could outlive the tree it
//! points to.

use std::collections::HashMap;
use std::sync::Arc;

use rayon::prelude::*;

use crate::arena::SharedArena;
use crate::error::CacheError;
use crate::hash::prompt_hash;
use crate::tree::SuffixTree;

/// Initial (and minimum) speculation-length budget per request.
pub const SPEC_MIN: usize = 2;

/// Maximum speculation-length budget per request.
pub const SPEC_MAX: usize = 16;

/// Workers in the speculation pool.
pub const SPEC_WORKERS: usize = 8;

pub struct SuffixCache {
    arena: Arc<SharedArena>,
    /// Tree fetched for each active request; `None` caches a miss.
    responses: HashMap<String, Option<u64>>,
    /// Current speculation-length budget per request.
    spec_lens: HashMap<String, usize>,
    pool: rayon::ThreadPool,
}

impl SuffixCache {
    /// Attach to the host arena by name and set up the worker pool.
    pub fn open(arena_name: &str) -> Result<Self, CacheError> {
        Self::new(Arc::new(SharedArena::open(arena_name)?))
    }

    pub fn new(arena: Arc<SharedArena>) -> Result<Self, CacheError> {
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(SPEC_WORKERS)
            .thread_name(|i| format!("specache-spec-{i}"))
            .build()
            .map_err(|e| CacheError::WorkerPool(e.to_string()))?;
        Ok(Self {
            arena,
            responses: HashMap::new(),
            spec_lens: HashMap::new(),
            pool,
        })
    }

    /// Resolve trees for every request in the batch that has no cached
    /// entry yet, under a single acquisition of the arena lock.
    ///
    /// New requests start with `spec_len = SPEC_MIN`. A prompt with no
    /// published tree caches a miss; that is not an error.
    pub fn fetch_responses_by_prompts_batch(
        &mut self,
        req_ids: &[String],
        prompts: &[Vec<i32>],
    ) -> Result<(), CacheError> {
        if req_ids.len() != prompts.len() {
            return Err(CacheError::InputMismatch {
                reason: format!(
                    "{} request ids but {} prompts",
                    req_ids.len(),
                    prompts.len()
                ),
            });
        }

        let mut to_fetch: Vec<(usize, u64)> = Vec::new();
        for (i, req_id) in req_ids.iter().enumerate() {
            if !self.responses.contains_key(req_id) {
                self.spec_lens.insert(req_id.clone(), SPEC_MIN);
                to_fetch.push((i, prompt_hash(&prompts[i])));
            }
        }
        if to_fetch.is_empty() {
            return Ok(());
        }

        let lock = self.arena.lock();
        let registry = self.arena.registry();
        for (i, hash) in to_fetch {
            let tree_off = registry.lookup(&lock, hash);
            self.responses.insert(req_ids[i].clone(), tree_off);
        }
        Ok(())
    }

    /// Speculate for every request in the batch, in parallel.
    ///
    /// Returns one token list per request. Requests with no published
    /// tree, an empty pattern, or missing per-request state produce an
    /// empty list; state problems are logged per slot and never abort the
    /// batch.
    pub fn speculate(
        &self,
        req_ids: &[String],
        patterns: &[Vec<i32>],
        min_token_prob: f32,
        use_tree_spec: bool,
    ) -> Result<Vec<Vec<i32>>, CacheError> {
        if req_ids.len() != patterns.len() {
            return Err(CacheError::InputMismatch {
                reason: format!(
                    "{} request ids but {} patterns",
                    req_ids.len(),
                    patterns.len()
                ),
            });
        }

        let results = self.pool.install(|| {
            req_ids
                .par_iter()
                .zip(patterns.par_iter())
                .map(|(req_id, pattern)| self.speculate_one(req_id, pattern, min_token_prob, use_tree_spec))
                .collect()
        });
        Ok(results)
    }

    fn speculate_one(
        &self,
        req_id: &str,
        pattern: &[i32],
        min_token_prob: f32,
        use_tree_spec: bool,
    ) -> Vec<i32> {
        if pattern.is_empty() {
            return Vec::new();
        }
        let Some(tree_off) = self.responses.get(req_id) else {
            tracing::warn!(req_id, "speculate called before fetch for request");
            return Vec::new();
        };
        let Some(tree_off) = tree_off else {
            // No tree was published for this prompt family.
            return Vec::new();
        };
        let Some(&spec_len) = self.spec_lens.get(req_id) else {
            tracing::warn!(req_id, "speculation length missing for request");
            return Vec::new();
        };

        // SAFETY: the offset came from a registry lookup and the eviction
        // protocol (module docs) keeps the tree alive while cached here.
        let tree = unsafe { SuffixTree::from_offset(&self.arena, *tree_off) };
        tree.speculate(pattern, spec_len, min_token_prob, use_tree_spec)
            .token_ids
    }

    /// Multiplicative-increase / multiplicative-decrease controller for
    /// the per-request speculation budget.
    pub fn update_spec_len(&mut self, req_id: &str, valid_len: usize) {
        let Some(current) = self.spec_lens.get_mut(req_id) else {
            tracing::warn!(req_id, "spec length update for unknown request");
            return;
        };
        *current = if valid_len > *current {
            (*current * 2).min(SPEC_MAX)
        } else {
            (*current / 2).max(SPEC_MIN)
        };
    }

    /// Current speculation budget for a request, if fetched.
    pub fn spec_len(&self, req_id: &str) -> Option<usize> {
        self.spec_lens.get(req_id).copied()
    }

    /// Drop all per-request state. The arena is untouched.
    pub fn evict_responses(&mut self, req_id: &str) {
        self.responses.remove(req_id);
        self.spec_lens.remove(req_id);
    }

    /// Whether a fetch has been performed for `req_id`.
    pub fn has_request(&self, req_id: &str) -> bool {
        self.responses.contains_key(req_id)
    }
}
