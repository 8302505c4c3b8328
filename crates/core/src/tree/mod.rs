//! Suffix tree over integer tokens, stored in shared memory.
//!
//! A tree is built once per publish from a composite token sequence
//! (prompt, responses, and `-1` separators, see [`crate::update`]) and is
//! immutable afterwards, so readers in any process can traverse it without
//! locking. Queries find the longest suffix of a recent token pattern that
//! occurs in the tree and propose the tokens most likely to follow, either
//! as a single greedy path or as a branching token tree.

mod build;
mod node;

use std::collections::BinaryHeap;
use std::marker::PhantomData;

use crate::arena::SharedArena;

pub use build::build_in;
pub(crate) use node::{Node, NIL, ROOT};

use node::{nodes_offset, tokens_offset, TreeHeader};

/// Sentinel token separating concatenated responses in a composite
/// sequence. Matches never extend across it and it is never proposed.
pub const TERMINATOR: i32 = -1;

/// Patterns shorter than this never produce a speculation; the top-level
/// search only tries suffixes of at least this length, so that trivially
/// short matches do not generate noise proposals.
pub const MIN_SPECULATE_PATTERN_LEN: usize = 4;

/// A speculation result: a linear path or a branching token tree.
///
/// `parents[i]` is the index of token `i`'s parent within `token_ids`
/// (`-1` for roots of the proposal). For path speculation this is always
/// `[−1, 0, 1, ...]`; tree speculation may propose several children under
/// one parent.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Candidate {
    pub token_ids: Vec<i32>,
    pub parents: Vec<i32>,
    pub probs: Vec<f32>,
    /// Sum of the per-token probabilities; 0.0 means "no proposal".
    pub score: f32,
    /// How many pattern tokens the returned speculation was matched on.
    pub match_len: i32,
}

impl Candidate {
    pub fn is_empty(&self) -> bool {
        self.token_ids.is_empty()
    }
}

/// Read-only view of a published tree inside the arena.
pub struct SuffixTree<'a> {
    base: *const u8,
    _arena: PhantomData<&'a SharedArena>,
}

impl<'a> SuffixTree<'a> {
    /// Attach a view to the tree block at `off`.
    ///
    /// # Safety
    /// `off` must be the offset of a fully built tree block in `arena`
    /// that is not destroyed while the view is alive. The embedding
    /// protocol guarantees this by evicting per-request state before a
    /// prompt family can be republished (see [`crate::cache`]).
    pub unsafe fn from_offset(arena: &'a SharedArena, off: u64) -> Self {
        Self {
            base: arena.ptr_at(off) as *const u8,
            _arena: PhantomData,
        }
    }

    /// Number of tokens in the composite sequence.
    pub fn len(&self) -> usize {
        self.header().seq_len as usize
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// The composite token sequence this tree indexes.
    pub fn tokens(&self) -> &[i32] {
        unsafe {
            std::slice::from_raw_parts(
                self.base.add(tokens_offset()) as *const i32,
                self.len(),
            )
        }
    }

    /// Number of nodes, root included.
    pub fn node_count(&self) -> usize {
        self.header().node_len as usize
    }

    /// Find the node and edge offset reached by matching
    /// `pattern[start_idx..]` from the root, or `None` on any mismatch.
    pub fn match_pattern(&self, pattern: &[i32], start_idx: usize) -> Option<(u32, i32)> {
        let mut node = ROOT;
        let mut edge_idx: i32 = 0;

        for &c in &pattern[start_idx..] {
            // Advance to a child when at the root or at the end of the
            // current edge, otherwise stay inside the edge.
            loop {
                if node == ROOT {
                    node = self.find_child(node, c)?;
                    edge_idx = 0;
                    break;
                }
                if edge_idx >= self.edge_length(node) {
                    node = self.find_child(node, c)?;
                    edge_idx = 0;
                    continue;
                }
                break;
            }

            let pos = self.node(node).start + edge_idx;
            debug_assert!((pos as u32) < self.header().seq_len);
            if self.token(pos) != c {
                return None;
            }
            edge_idx += 1;
        }
        Some((node, edge_idx))
    }

    /// Propose up to `max_spec_tokens` tokens continuing the longest
    /// matching suffix of `pattern`.
    ///
    /// Starting points are tried longest-first; the first candidate with a
    /// positive score wins. Suffixes shorter than
    /// [`MIN_SPECULATE_PATTERN_LEN`] are never tried.
    pub fn speculate(
        &self,
        pattern: &[i32],
        max_spec_tokens: usize,
        min_token_prob: f32,
        use_tree_spec: bool,
    ) -> Candidate {
        if pattern.len() < MIN_SPECULATE_PATTERN_LEN {
            return Candidate::default();
        }
        for start_idx in 0..=pattern.len() - MIN_SPECULATE_PATTERN_LEN {
            let Some((node, idx)) = self.match_pattern(pattern, start_idx) else {
                continue;
            };
            let mut candidate = if use_tree_spec {
                self.speculate_tree(node, idx, max_spec_tokens, min_token_prob)
            } else {
                self.speculate_path(node, idx, max_spec_tokens, min_token_prob)
            };
            if candidate.score > 0.0 {
                candidate.match_len = (pattern.len() - start_idx) as i32;
                return candidate;
            }
        }
        Candidate::default()
    }

    /// Greedy path speculation: emit the rest of the current edge, then
    /// descend into the child with the highest count. On equal counts the
    /// lower first token wins (children iterate in ascending token order).
    fn speculate_path(
        &self,
        mut node: u32,
        mut idx: i32,
        max_spec_tokens: usize,
        min_token_prob: f32,
    ) -> Candidate {
        let mut ret = Candidate::default();
        let mut prob = 1.0f32;
        while ret.token_ids.len() < max_spec_tokens && prob >= min_token_prob {
            if idx < self.edge_length(node) {
                let token = self.token(self.node(node).start + idx);
                if token == TERMINATOR {
                    break;
                }
                ret.parents.push(ret.token_ids.len() as i32 - 1);
                ret.token_ids.push(token);
                ret.probs.push(prob);
                ret.score += prob;
                idx += 1;
            } else {
                let mut best = NIL;
                let mut best_count = 0i32;
                for child in self.children(node) {
                    let count = self.node(child).count;
                    if count > best_count {
                        best = child;
                        best_count = count;
                    }
                }
                if best == NIL {
                    break;
                }
                prob *= best_count as f32 / self.node(node).count as f32;
                node = best;
                idx = 0;
            }
        }
        ret
    }

    /// Best-first tree speculation: a max-heap on cumulative branching
    /// probability expands the most likely continuations first, producing
    /// a branching proposal tree via the `parents` indices.
    fn speculate_tree(
        &self,
        node: u32,
        idx: i32,
        max_spec_tokens: usize,
        min_token_prob: f32,
    ) -> Candidate {
        let mut ret = Candidate::default();
        let mut queue = BinaryHeap::new();
        queue.push(HeapItem {
            prob: 1.0,
            node,
            idx,
            parent: -1,
        });
        while ret.token_ids.len() < max_spec_tokens {
            let Some(item) = queue.pop() else { break };
            if item.idx < self.edge_length(item.node) {
                let token = self.token(self.node(item.node).start + item.idx);
                if token == TERMINATOR {
                    continue;
                }
                ret.token_ids.push(token);
                ret.parents.push(item.parent);
                ret.probs.push(item.prob);
                ret.score += item.prob;
                queue.push(HeapItem {
                    prob: item.prob,
                    node: item.node,
                    idx: item.idx + 1,
                    parent: ret.token_ids.len() as i32 - 1,
                });
            } else {
                let node_count = self.node(item.node).count;
                for child in self.children(item.node) {
                    let prob = item.prob * self.node(child).count as f32 / node_count as f32;
                    if prob >= min_token_prob {
                        queue.push(HeapItem {
                            prob,
                            node: child,
                            idx: 0,
                            parent: item.parent,
                        });
                    }
                }
            }
        }
        ret
    }

    // ─── Node access ──────────────────────────────────────────────────

    fn header(&self) -> &TreeHeader {
        unsafe { &*(self.base as *const TreeHeader) }
    }

    fn token(&self, pos: i32) -> i32 {
        debug_assert!(pos >= 0 && (pos as u32) < self.header().seq_len);
        unsafe {
            std::ptr::read((self.base.add(tokens_offset()) as *const i32).add(pos as usize))
        }
    }

    pub(crate) fn node(&self, r: u32) -> &Node {
        debug_assert!(r < self.header().node_len);
        unsafe {
            &*(self.base.add(nodes_offset(self.header().seq_cap as usize)) as *const Node)
                .add(r as usize)
        }
    }

    fn first_token(&self, r: u32) -> i32 {
        self.token(self.node(r).start)
    }

    /// Effective edge length: leaf edges extend to the sequence end.
    fn edge_length(&self, r: u32) -> i32 {
        let n = self.node(r);
        if n.length == -1 {
            self.header().seq_len as i32 - n.start
        } else {
            n.length
        }
    }

    fn find_child(&self, parent: u32, token: i32) -> Option<u32> {
        let mut cur = self.node(parent).first_child;
        while cur != NIL {
            let t = self.first_token(cur);
            if t == token {
                return Some(cur);
            }
            if t > token {
                return None;
            }
            cur = self.node(cur).next_sibling;
        }
        None
    }

    /// Children of `r` in ascending first-token order.
    pub(crate) fn children(&self, r: u32) -> ChildIter<'_, 'a> {
        ChildIter {
            tree: self,
            cur: self.node(r).first_child,
        }
    }
}

pub(crate) struct ChildIter<'t, 'a> {
    tree: &'t SuffixTree<'a>,
    cur: u32,
}

impl Iterator for ChildIter<'_, '_> {
    type Item = u32;

    fn next(&mut self) -> Option<u32> {
        if self.cur == NIL {
            return None;
        }
        let node = self.cur;
        self.cur = self.tree.node(node).next_sibling;
        Some(node)
    }
}

#[derive(Debug)]
struct HeapItem {
    prob: f32,
    node: u32,
    idx: i32,
    parent: i32,
}

impl PartialEq for HeapItem {
    fn eq(&self, other: &Self) -> bool {
        self.prob.total_cmp(&other.prob).is_eq()
    }
}

impl Eq for HeapItem {}

impl PartialOrd for HeapItem {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for HeapItem {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.prob.total_cmp(&other.prob)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arena::test_support::small_arena;
    use crate::update::build_composite;

    fn tree_of<'a>(arena: &'a SharedArena, tokens: &[i32]) -> SuffixTree<'a> {
        let off = build_in(arena, tokens).expect("build tree");
        unsafe { SuffixTree::from_offset(arena, off) }
    }

    /// Walk all nodes checking `count(v) = Σ count(child)` and leaf = 1.
    fn assert_count_invariant(tree: &SuffixTree<'_>) {
        let mut stack = vec![ROOT];
        while let Some(n) = stack.pop() {
            let children: Vec<u32> = tree.children(n).collect();
            if children.is_empty() {
                assert_eq!(tree.node(n).count, 1, "leaf count");
            } else {
                let sum: i32 = children.iter().map(|&c| tree.node(c).count).sum();
                assert_eq!(tree.node(n).count, sum, "internal count");
                stack.extend(children);
            }
        }
    }

    // ─── Construction invariants ──────────────────────────────────────

    #[test]
    fn every_suffix_is_reachable_from_root() {
        let arena = small_arena("tree-suffixes");
        let tokens = build_composite(&[1, 2, 3], &[vec![5, 6], vec![5, 7], vec![2, 3, 5]]);
        let tree = tree_of(&arena, &tokens);
        for start in 0..tokens.len() {
            assert!(
                tree.match_pattern(&tokens, start).is_some(),
                "suffix at {start} must match"
            );
        }
        assert_count_invariant(&tree);
    }

    #[test]
    fn counts_sum_over_children() {
        let arena = small_arena("tree-counts");
        let tokens = build_composite(&[10, 20, 30, 40, 50], &[vec![1, 2, 3], vec![1, 2, 4]]);
        let tree = tree_of(&arena, &tokens);
        assert_count_invariant(&tree);
    }

    #[test]
    fn repeated_tokens_build_a_compact_tree() {
        let arena = small_arena("tree-repeat");
        let tokens = vec![5, 5, 5, 5, 5, 5];
        let tree = tree_of(&arena, &tokens);
        assert_count_invariant(&tree);
        // Node bound: at most 2n + slack.
        assert!(tree.node_count() <= 2 * tokens.len() + 30);
        assert!(tree.match_pattern(&[5, 5, 5], 0).is_some());
        assert!(tree.match_pattern(&[5, 6], 0).is_none());
    }

    #[test]
    fn empty_sequence_builds_root_only() {
        let arena = small_arena("tree-empty");
        let tree = tree_of(&arena, &[]);
        assert_eq!(tree.node_count(), 1);
        assert!(tree.speculate(&[1, 2, 3, 4], 8, 0.0, false).is_empty());
    }

    #[test]
    fn mismatch_returns_none() {
        let arena = small_arena("tree-mismatch");
        let tree = tree_of(&arena, &[1, 2, 3, 4]);
        assert!(tree.match_pattern(&[1, 2, 9], 0).is_none());
        assert!(tree.match_pattern(&[9], 0).is_none());
        assert!(tree.match_pattern(&[2, 3, 4], 0).is_some());
    }

    // ─── Path speculation ─────────────────────────────────────────────

    #[test]
    fn basic_path_speculation_follows_the_response() {
        let arena = small_arena("spec-basic");
        let tokens = build_composite(&[10, 11, 12], &[vec![20, 21, 22, 23]]);
        let tree = tree_of(&arena, &tokens);
        let cand = tree.speculate(&[10, 11, 12, 20], 4, 0.0, false);
        assert_eq!(cand.token_ids, vec![21, 22, 23]);
        assert_eq!(cand.parents, vec![-1, 0, 1]);
        assert!(cand.score > 0.0);
        assert_eq!(cand.match_len, 4);
    }

    #[test]
    fn path_speculation_prefers_the_most_frequent_child() {
        let arena = small_arena("spec-counts");
        // "9" follows [.., 5] twice, "7" once. The tie-break alone would
        // pick 7, so this only passes if counts drive the choice.
        let tokens = build_composite(&[1, 2, 3], &[vec![5, 9], vec![5, 9], vec![5, 7]]);
        let tree = tree_of(&arena, &tokens);
        let cand = tree.speculate(&[1, 2, 3, 5], 1, 0.0, false);
        assert_eq!(cand.token_ids, vec![9]);
    }

    #[test]
    fn path_speculation_breaks_count_ties_toward_lower_token() {
        let arena = small_arena("spec-ties");
        let tokens = build_composite(&[1, 2, 3], &[vec![5, 7], vec![5, 6]]);
        let tree = tree_of(&arena, &tokens);
        let cand = tree.speculate(&[1, 2, 3, 5], 1, 0.0, false);
        assert_eq!(cand.token_ids, vec![6]);
    }

    #[test]
    fn terminator_stops_path_speculation() {
        let arena = small_arena("spec-term");
        let tokens = build_composite(&[7, 8, 9], &[vec![99, 100]]);
        let tree = tree_of(&arena, &tokens);
        // Nothing can be proposed past the end of the response.
        let at_end = tree.speculate(&[8, 9, 99, 100], 8, 0.0, false);
        assert!(at_end.is_empty());
        // One token earlier, only `100` comes back.
        let before_end = tree.speculate(&[7, 8, 9, 99], 8, 0.0, false);
        assert_eq!(before_end.token_ids, vec![100]);
    }

    #[test]
    fn min_token_prob_cuts_off_unlikely_branches() {
        let arena = small_arena("spec-prob");
        // After [..,5]: 9 with p=2/3; the terminator right after it ends
        // the path before anything less likely can be proposed.
        let tokens = build_composite(&[1, 2, 3], &[vec![5, 9], vec![5, 9], vec![5, 7]]);
        let tree = tree_of(&arena, &tokens);
        let cand = tree.speculate(&[1, 2, 3, 5], 8, 0.5, false);
        assert_eq!(cand.token_ids, vec![9]);
        assert!((cand.probs[0] - 2.0 / 3.0).abs() < 1e-6);
    }

    #[test]
    fn falls_back_to_shorter_suffix_when_longer_fails() {
        let arena = small_arena("spec-fallback");
        let tokens = build_composite(&[1, 2, 3], &[vec![5, 9, 9], vec![5, 9, 9], vec![5, 7]]);
        let tree = tree_of(&arena, &tokens);
        // Token 42 never occurs, so the full pattern cannot match; the
        // next starting point drops it and matches [1, 2, 3, 5].
        let cand = tree.speculate(&[42, 1, 2, 3, 5], 1, 0.0, false);
        assert_eq!(cand.token_ids, vec![9]);
        assert_eq!(cand.match_len, 4);
    }

    #[test]
    fn short_patterns_never_speculate() {
        let arena = small_arena("spec-short");
        let tokens = build_composite(&[1, 2, 3], &[vec![5, 6]]);
        let tree = tree_of(&arena, &tokens);
        assert!(tree.speculate(&[], 8, 0.0, false).is_empty());
        assert!(tree.speculate(&[3, 5], 8, 0.0, false).is_empty());
        assert!(tree
            .speculate(&[2, 3, 5], 8, 0.0, false)
            .is_empty());
    }

    // ─── Tree speculation ─────────────────────────────────────────────

    #[test]
    fn tree_speculation_branches_over_both_continuations() {
        let arena = small_arena("spec-tree");
        let tokens = build_composite(&[1, 2, 3], &[vec![5, 9], vec![5, 9], vec![5, 7]]);
        let tree = tree_of(&arena, &tokens);
        let cand = tree.speculate(&[1, 2, 3, 5], 2, 0.0, true);
        // Highest-probability child first, both under the same parent.
        assert_eq!(cand.token_ids, vec![9, 7]);
        assert_eq!(cand.parents, vec![-1, -1]);
        assert!((cand.probs[0] - 2.0 / 3.0).abs() < 1e-6);
        assert!((cand.probs[1] - 1.0 / 3.0).abs() < 1e-6);
    }

    #[test]
    fn tree_speculation_never_emits_the_terminator() {
        let arena = small_arena("spec-tree-term");
        let tokens = build_composite(&[1, 2, 3], &[vec![5, 6], vec![5, 7]]);
        let tree = tree_of(&arena, &tokens);
        let cand = tree.speculate(&[1, 2, 3, 5], 16, 0.0, true);
        assert!(!cand.token_ids.contains(&TERMINATOR));
        assert!(!cand.is_empty());
    }

    #[test]
    fn tree_speculation_respects_min_prob() {
        let arena = small_arena("spec-tree-prob");
        let tokens = build_composite(&[1, 2, 3], &[vec![5, 9], vec![5, 9], vec![5, 7]]);
        let tree = tree_of(&arena, &tokens);
        let cand = tree.speculate(&[1, 2, 3, 5], 8, 0.5, true);
        // The 1/3-probability branch is pruned.
        assert!(cand.token_ids.contains(&9));
        assert!(!cand.token_ids.contains(&7));
    }

    #[test]
    fn random_sequences_uphold_the_invariants() {
        use rand::{Rng, SeedableRng};
        let mut rng = rand::rngs::StdRng::seed_from_u64(0x5eed);
        let arena = small_arena("tree-random");
        for round in 0..20 {
            let len = rng.gen_range(1..=120);
            // Small alphabet to force heavy sharing and edge splits.
            let tokens: Vec<i32> = (0..len).map(|_| rng.gen_range(0..6)).collect();
            let off = build_in(&arena, &tokens).expect("build random tree");
            let tree = unsafe { SuffixTree::from_offset(&arena, off) };
            assert!(tree.node_count() <= 2 * len + 30, "round {round}");
            for start in 0..tokens.len() {
                assert!(tree.match_pattern(&tokens, start).is_some(), "round {round}");
            }
            assert_count_invariant(&tree);
            arena.free(off);
        }
    }

    #[test]
    fn path_and_tree_speculation_agree_on_unambiguous_input() {
        let arena = small_arena("spec-agree");
        let tokens = build_composite(&[10, 11, 12], &[vec![20, 21, 22, 23]]);
        let tree = tree_of(&arena, &tokens);
        let path = tree.speculate(&[10, 11, 12, 20], 3, 0.0, false);
        let spec_tree = tree.speculate(&[10, 11, 12, 20], 3, 0.0, true);
        assert_eq!(path.token_ids, spec_tree.token_ids);
    }
}
