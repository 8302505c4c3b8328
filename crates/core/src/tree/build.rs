//! Online suffix-tree construction (Ukkonen's algorithm) into an arena
//! block.
//!
//! The builder appends tokens one at a time, maintaining the classic
//! active point `(active_node, active_edge, active_length)` plus the count
//! of suffixes not yet explicitly inserted. All nodes for one tree come
//! from a single bulk allocation sized up front (`2n + slack` nodes for a
//! length-`n` input), so destroying the tree later frees one block.
//!
//! Node counts are *not* maintained during construction; a single
//! post-order pass fills them in afterwards and is the only authoritative
//! source.

use std::marker::PhantomData;
use std::ptr;

use crate::arena::SharedArena;
use crate::error::CacheError;

use super::node::{nodes_offset, tokens_offset, tree_block_size, Node, TreeHeader, NIL, ROOT};

/// Extra node slots beyond the `2n` worst-case Ukkonen bound.
const NODE_SLACK: usize = 30;

/// Build a suffix tree over `tokens` inside a fresh arena block and
/// return the block's offset. The block is freed again if construction
/// fails.
pub fn build_in(arena: &SharedArena, tokens: &[i32]) -> Result<u64, CacheError> {
    let node_cap = 2 * tokens.len() + NODE_SLACK;
    let bytes = tree_block_size(tokens.len(), node_cap);
    let off = arena.alloc_bulk(bytes)?;
    let result = TreeBuilder::init(arena, off, tokens.len(), node_cap)
        .and_then(|mut builder| {
            builder.extend(tokens)?;
            builder.update_node_counts();
            Ok(())
        });
    match result {
        Ok(()) => Ok(off),
        Err(err) => {
            arena.free(off);
            Err(err)
        }
    }
}

struct TreeBuilder<'a> {
    base: *mut u8,
    seq_cap: u32,
    node_cap: u32,
    active_node: u32,
    active_edge: i32,
    active_length: i32,
    remaining_suffixes: i32,
    _arena: PhantomData<&'a SharedArena>,
}

impl<'a> TreeBuilder<'a> {
    fn init(
        arena: &'a SharedArena,
        off: u64,
        seq_cap: usize,
        node_cap: usize,
    ) -> Result<Self, CacheError> {
        // SAFETY: `off` is a fresh allocation of `tree_block_size` bytes.
        let base = unsafe { arena.ptr_at(off) };
        unsafe {
            ptr::write(
                base as *mut TreeHeader,
                TreeHeader {
                    seq_len: 0,
                    seq_cap: seq_cap as u32,
                    node_len: 0,
                    node_cap: node_cap as u32,
                    root: ROOT,
                    _reserved: 0,
                },
            );
        }
        let mut builder = Self {
            base,
            seq_cap: seq_cap as u32,
            node_cap: node_cap as u32,
            active_node: ROOT,
            active_edge: -1,
            active_length: 0,
            remaining_suffixes: 0,
            _arena: PhantomData,
        };
        let root = builder.push_node(Node {
            count: 0,
            seq_id: -1,
            start: 0,
            length: 0,
            parent: NIL,
            suffix_link: ROOT,
            first_child: NIL,
            next_sibling: NIL,
        })?;
        debug_assert_eq!(root, ROOT);
        Ok(builder)
    }

    /// Append `tokens` to the sequence, updating the tree per token.
    fn extend(&mut self, tokens: &[i32]) -> Result<(), CacheError> {
        for &token in tokens {
            let pos = self.push_token(token);
            self.extend_tree(pos)?;
        }
        Ok(())
    }

    /// One Ukkonen extension step for the token at `pos`.
    fn extend_tree(&mut self, pos: i32) -> Result<(), CacheError> {
        let current = self.token(pos);
        let mut last_new_node: u32 = NIL;
        self.remaining_suffixes += 1;

        while self.remaining_suffixes > 0 {
            if self.active_length == 0 {
                self.active_edge = pos;
            }
            let search = self.token(self.active_edge);

            match self.find_child(self.active_node, search) {
                None => {
                    let leaf = self.push_node(Node::leaf(pos, self.active_node))?;
                    self.insert_child(self.active_node, leaf);
                    if last_new_node != NIL {
                        self.set_suffix_link(last_new_node, self.active_node);
                        last_new_node = NIL;
                    }
                }
                Some(child) => {
                    // Skip/count: the active length spans the whole edge.
                    let edge_length = self.edge_length(child, pos);
                    if self.active_length >= edge_length {
                        self.active_edge += edge_length;
                        self.active_length -= edge_length;
                        self.active_node = child;
                        continue;
                    }

                    let edge_char = self.token(self.node(child).start + self.active_length);
                    if edge_char == current {
                        // Showstopper rule: the suffix is already implicit.
                        self.active_length += 1;
                        if last_new_node != NIL && self.active_node != ROOT {
                            self.set_suffix_link(last_new_node, self.active_node);
                            last_new_node = NIL;
                        }
                        break;
                    }

                    let split = self.split_edge(child, self.active_length)?;
                    let leaf = self.push_node(Node::leaf(pos, split))?;
                    self.insert_child(split, leaf);
                    if last_new_node != NIL {
                        self.set_suffix_link(last_new_node, split);
                    }
                    last_new_node = split;
                }
            }

            self.remaining_suffixes -= 1;
            if self.active_node == ROOT && self.active_length > 0 {
                self.active_length -= 1;
                self.active_edge = pos - self.remaining_suffixes + 1;
            } else if self.active_node != ROOT {
                let link = self.node(self.active_node).suffix_link;
                self.active_node = if link != NIL { link } else { ROOT };
            }
        }

        if last_new_node != NIL {
            self.set_suffix_link(last_new_node, ROOT);
        }
        Ok(())
    }

    /// Split the edge into `child` at `split_pos` tokens, returning the
    /// new internal node. The split node keeps the edge's first token, so
    /// it takes the child's position in the parent's sibling list.
    fn split_edge(&mut self, child: u32, split_pos: i32) -> Result<u32, CacheError> {
        let child_node = self.node(child);
        let split = self.push_node(Node {
            count: 0,
            seq_id: child_node.seq_id,
            start: child_node.start,
            length: split_pos,
            parent: child_node.parent,
            suffix_link: NIL,
            first_child: NIL,
            next_sibling: NIL,
        })?;
        self.replace_child(child_node.parent, child, split);
        self.with_node(child, |n| {
            n.start += split_pos;
            if n.length != -1 {
                n.length -= split_pos;
            }
            n.parent = split;
            n.next_sibling = NIL;
        });
        self.with_node(split, |n| n.first_child = child);
        Ok(split)
    }

    /// Post-order count fill: leaves count 1, internal nodes the sum of
    /// their children, root the total number of inserted suffixes.
    fn update_node_counts(&mut self) {
        let mut order = Vec::with_capacity(self.header().node_len as usize);
        let mut stack = vec![ROOT];
        while let Some(n) = stack.pop() {
            order.push(n);
            let mut child = self.node(n).first_child;
            while child != NIL {
                stack.push(child);
                child = self.node(child).next_sibling;
            }
        }
        for &n in &order {
            let is_leaf = self.node(n).first_child == NIL;
            self.with_node(n, |node| node.count = i32::from(is_leaf));
        }
        // Children precede their parent in reversed preorder.
        for &n in order.iter().rev() {
            let node = self.node(n);
            if node.parent != NIL {
                let count = node.count;
                self.with_node(node.parent, |p| p.count += count);
            }
        }
    }

    // ─── Block accessors ──────────────────────────────────────────────

    fn header(&self) -> &TreeHeader {
        unsafe { &*(self.base as *const TreeHeader) }
    }

    fn header_mut(&mut self) -> &mut TreeHeader {
        unsafe { &mut *(self.base as *mut TreeHeader) }
    }

    fn token(&self, pos: i32) -> i32 {
        debug_assert!(pos >= 0 && (pos as u32) < self.header().seq_len);
        unsafe { ptr::read((self.base.add(tokens_offset()) as *const i32).add(pos as usize)) }
    }

    fn push_token(&mut self, token: i32) -> i32 {
        let len = self.header().seq_len;
        debug_assert!(len < self.seq_cap);
        unsafe {
            ptr::write(
                (self.base.add(tokens_offset()) as *mut i32).add(len as usize),
                token,
            );
        }
        self.header_mut().seq_len = len + 1;
        len as i32
    }

    fn node_ptr(&self, r: u32) -> *mut Node {
        debug_assert!(r < self.header().node_len);
        unsafe {
            (self.base.add(nodes_offset(self.seq_cap as usize)) as *mut Node).add(r as usize)
        }
    }

    fn node(&self, r: u32) -> Node {
        unsafe { ptr::read(self.node_ptr(r)) }
    }

    fn with_node(&mut self, r: u32, f: impl FnOnce(&mut Node)) {
        unsafe { f(&mut *self.node_ptr(r)) }
    }

    fn push_node(&mut self, node: Node) -> Result<u32, CacheError> {
        let len = self.header().node_len;
        if len >= self.node_cap {
            return Err(CacheError::OutOfSpace {
                requested: std::mem::size_of::<Node>(),
            });
        }
        unsafe {
            let dst = (self.base.add(nodes_offset(self.seq_cap as usize)) as *mut Node)
                .add(len as usize);
            ptr::write(dst, node);
        }
        self.header_mut().node_len = len + 1;
        Ok(len)
    }

    fn set_suffix_link(&mut self, from: u32, to: u32) {
        self.with_node(from, |n| n.suffix_link = to);
    }

    // ─── Child list maintenance ───────────────────────────────────────

    fn first_token(&self, r: u32) -> i32 {
        self.token(self.node(r).start)
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

    /// Insert `child` keeping siblings sorted ascending by first token.
    fn insert_child(&mut self, parent: u32, child: u32) {
        let token = self.first_token(child);
        let mut prev = NIL;
        let mut cur = self.node(parent).first_child;
        while cur != NIL && self.first_token(cur) < token {
            prev = cur;
            cur = self.node(cur).next_sibling;
        }
        debug_assert!(cur == NIL || self.first_token(cur) != token);
        self.with_node(child, |n| {
            n.parent = parent;
            n.next_sibling = cur;
        });
        if prev == NIL {
            self.with_node(parent, |n| n.first_child = child);
        } else {
            self.with_node(prev, |n| n.next_sibling = child);
        }
    }

    /// Splice `new_child` into the exact list position of `old_child`.
    fn replace_child(&mut self, parent: u32, old_child: u32, new_child: u32) {
        let next = self.node(old_child).next_sibling;
        self.with_node(new_child, |n| {
            n.parent = parent;
            n.next_sibling = next;
        });
        if self.node(parent).first_child == old_child {
            self.with_node(parent, |n| n.first_child = new_child);
            return;
        }
        let mut cur = self.node(parent).first_child;
        while cur != NIL {
            if self.node(cur).next_sibling == old_child {
                self.with_node(cur, |n| n.next_sibling = new_child);
                return;
            }
            cur = self.node(cur).next_sibling;
        }
        debug_assert!(false, "child to replace not found under parent");
    }

    /// Edge length while the sequence is still growing: leaf edges run to
    /// the position currently being inserted.
    fn edge_length(&self, r: u32, pos: i32) -> i32 {
        let n = self.node(r);
        if n.length == -1 {
            pos - n.start + 1
        } else {
            n.length
        }
    }
}
