//! Arena-backed trie over tokenized words.
//!
//! Nodes live in a `Vec<Option<SearchNode>>` addressed by `u32` index. Pruned
//! nodes leave a `None` tombstone and their index goes on a free list, which
//! later inserts draw from before growing the arena. A first-character
//! inverted index maps each character to every node reached through an edge
//! labeled with it, which lets substring queries start mid-word.

use std::collections::{BTreeMap, BTreeSet};

use ahash::{AHashMap, AHashSet};
use replica_core::Key;
use serde::{Deserialize, Serialize};

use super::tokenize::{tokenize, word_set};

/// Index of the root node. The root is never pruned.
pub const ROOT: u32 = 0;

/// One trie node, persisted individually.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SearchNode {
    pub idx: u32,
    pub children: BTreeMap<char, u32>,
    /// Rows containing the word that ends at this node.
    #[serde(default, skip_serializing_if = "BTreeSet::is_empty")]
    pub keys: BTreeSet<Key>,
}

impl SearchNode {
    fn new(idx: u32) -> Self {
        Self {
            idx,
            children: BTreeMap::new(),
            keys: BTreeSet::new(),
        }
    }

    fn is_empty(&self) -> bool {
        self.keys.is_empty() && self.children.is_empty()
    }
}

/// Text of one row's search field before and after a change.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TextChange {
    pub key: Key,
    pub old: Option<String>,
    pub new: Option<String>,
}

/// What an update did to the arena.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UpdateStats {
    /// Live nodes created or modified.
    pub touched: BTreeSet<u32>,
    /// Nodes pruned and not reused.
    pub freed: BTreeSet<u32>,
    pub free_list_changed: bool,
}

impl UpdateStats {
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.touched.is_empty() && self.freed.is_empty() && !self.free_list_changed
    }
}

#[derive(Debug, Clone)]
pub struct SearchTrie {
    nodes: Vec<Option<SearchNode>>,
    free: Vec<u32>,
    by_char: AHashMap<char, AHashSet<u32>>,
}

impl Default for SearchTrie {
    fn default() -> Self {
        Self::new()
    }
}

impl SearchTrie {
    #[must_use]
    pub fn new() -> Self {
        Self {
            nodes: vec![Some(SearchNode::new(ROOT))],
            free: Vec::new(),
            by_char: AHashMap::new(),
        }
    }

    /// Rebuilds the arena, free list and inverted index from persisted nodes.
    #[must_use]
    pub fn from_parts(nodes: Vec<SearchNode>, free: Vec<u32>) -> Self {
        let len = nodes.iter().map(|n| n.idx as usize + 1).max().unwrap_or(1);
        let mut arena: Vec<Option<SearchNode>> = vec![None; len];
        for node in nodes {
            let idx = node.idx as usize;
            arena[idx] = Some(node);
        }
        if arena[ROOT as usize].is_none() {
            arena[ROOT as usize] = Some(SearchNode::new(ROOT));
        }

        // Every tombstone must be reusable exactly once.
        let mut listed: BTreeSet<u32> = free
            .into_iter()
            .filter(|&idx| arena.get(idx as usize).is_some_and(Option::is_none))
            .collect();
        for (idx, slot) in arena.iter().enumerate() {
            if slot.is_none() {
                listed.insert(u32::try_from(idx).unwrap_or(u32::MAX));
            }
        }

        let mut by_char: AHashMap<char, AHashSet<u32>> = AHashMap::new();
        for node in arena.iter().flatten() {
            for (&ch, &child) in &node.children {
                by_char.entry(ch).or_default().insert(child);
            }
        }

        Self {
            nodes: arena,
            free: listed.into_iter().rev().collect(),
            by_char,
        }
    }

    #[must_use]
    pub fn node(&self, idx: u32) -> Option<&SearchNode> {
        self.nodes.get(idx as usize).and_then(Option::as_ref)
    }

    /// Live nodes, root included.
    #[must_use]
    pub fn node_count(&self) -> usize {
        self.nodes.iter().flatten().count()
    }

    /// Allocated slots, live or free.
    #[must_use]
    pub fn arena_len(&self) -> usize {
        self.nodes.len()
    }

    #[must_use]
    pub fn free_list(&self) -> &[u32] {
        &self.free
    }

    /// Applies per-row text changes by word-set difference.
    pub fn update(&mut self, changes: &[TextChange]) -> UpdateStats {
        let mut stats = UpdateStats::default();
        for change in changes {
            let old = change.old.as_deref().map(word_set).unwrap_or_default();
            let new = change.new.as_deref().map(word_set).unwrap_or_default();
            for word in old.difference(&new) {
                self.remove_word(word, &change.key, &mut stats);
            }
            for word in new.difference(&old) {
                self.insert_word(word, &change.key, &mut stats);
            }
        }
        stats
    }

    /// Rows with a word starting with each query word.
    #[must_use]
    pub fn starts_with(&self, query: &str) -> BTreeSet<Key> {
        self.per_word(query, |word| {
            let chars: Vec<char> = word.chars().collect();
            let mut out = BTreeSet::new();
            if let Some(end) = self.walk(ROOT, &chars) {
                self.collect_keys(end, &mut out);
            }
            out
        })
    }

    /// Rows with a word containing each query word as a substring.
    #[must_use]
    pub fn contains_text(&self, query: &str) -> BTreeSet<Key> {
        self.per_word(query, |word| {
            let chars: Vec<char> = word.chars().collect();
            let mut out = BTreeSet::new();
            let Some((first, rest)) = chars.split_first() else {
                return out;
            };
            for &start in self.by_char.get(first).into_iter().flatten() {
                if let Some(end) = self.walk(start, rest) {
                    self.collect_keys(end, &mut out);
                }
            }
            out
        })
    }

    /// Approximate match: rows reached by the longest common character runs
    /// with any query word, longest runs first, up to `limit` keys.
    #[must_use]
    pub fn closest(&self, query: &str, limit: usize) -> Vec<Key> {
        let mut by_len: BTreeMap<usize, BTreeSet<u32>> = BTreeMap::new();
        for word in tokenize(query) {
            let chars: Vec<char> = word.chars().collect();
            for (i, ch) in chars.iter().enumerate() {
                for &start in self.by_char.get(ch).into_iter().flatten() {
                    let (run, end) = self.longest_run(start, &chars[i + 1..]);
                    by_len.entry(run + 1).or_default().insert(end);
                }
            }
        }

        let mut out = Vec::new();
        let mut seen = AHashSet::new();
        for nodes in by_len.values().rev() {
            let mut group = BTreeSet::new();
            for &node in nodes {
                self.collect_keys(node, &mut group);
            }
            for key in group {
                if out.len() >= limit {
                    return out;
                }
                if seen.insert(key.clone()) {
                    out.push(key);
                }
            }
        }
        out
    }

    // -- internals ---------------------------------------------------------

    fn per_word(&self, query: &str, lookup: impl Fn(&str) -> BTreeSet<Key>) -> BTreeSet<Key> {
        let mut result: Option<BTreeSet<Key>> = None;
        for word in tokenize(query) {
            let found = lookup(&word);
            result = Some(match result {
                Some(acc) => acc.intersection(&found).cloned().collect(),
                None => found,
            });
            if result.as_ref().is_some_and(BTreeSet::is_empty) {
                break;
            }
        }
        result.unwrap_or_default()
    }

    fn node_mut(&mut self, idx: u32) -> Option<&mut SearchNode> {
        self.nodes.get_mut(idx as usize).and_then(Option::as_mut)
    }

    fn child(&self, idx: u32, ch: char) -> Option<u32> {
        self.node(idx).and_then(|n| n.children.get(&ch).copied())
    }

    fn walk(&self, from: u32, chars: &[char]) -> Option<u32> {
        chars.iter().try_fold(from, |cur, &ch| self.child(cur, ch))
    }

    fn longest_run(&self, from: u32, chars: &[char]) -> (usize, u32) {
        let mut cur = from;
        for (matched, &ch) in chars.iter().enumerate() {
            match self.child(cur, ch) {
                Some(next) => cur = next,
                None => return (matched, cur),
            }
        }
        (chars.len(), cur)
    }

    fn collect_keys(&self, from: u32, out: &mut BTreeSet<Key>) {
        let mut stack = vec![from];
        while let Some(idx) = stack.pop() {
            if let Some(node) = self.node(idx) {
                out.extend(node.keys.iter().cloned());
                stack.extend(node.children.values().copied());
            }
        }
    }

    fn alloc(&mut self, stats: &mut UpdateStats) -> u32 {
        if let Some(idx) = self.free.pop() {
            self.nodes[idx as usize] = Some(SearchNode::new(idx));
            stats.freed.remove(&idx);
            stats.free_list_changed = true;
            idx
        } else {
            let idx = u32::try_from(self.nodes.len()).unwrap_or(u32::MAX);
            self.nodes.push(Some(SearchNode::new(idx)));
            idx
        }
    }

    fn release(&mut self, idx: u32, stats: &mut UpdateStats) {
        self.nodes[idx as usize] = None;
        self.free.push(idx);
        stats.touched.remove(&idx);
        stats.freed.insert(idx);
        stats.free_list_changed = true;
    }

    fn insert_word(&mut self, word: &str, key: &Key, stats: &mut UpdateStats) {
        let mut cur = ROOT;
        for ch in word.chars() {
            cur = if let Some(next) = self.child(cur, ch) {
                next
            } else {
                let child = self.alloc(stats);
                if let Some(parent) = self.node_mut(cur) {
                    parent.children.insert(ch, child);
                }
                self.by_char.entry(ch).or_default().insert(child);
                stats.touched.insert(cur);
                stats.touched.insert(child);
                child
            };
        }
        if let Some(node) = self.node_mut(cur) {
            if node.keys.insert(key.clone()) {
                stats.touched.insert(cur);
            }
        }
    }

    fn remove_word(&mut self, word: &str, key: &Key, stats: &mut UpdateStats) {
        let mut path: Vec<(u32, char)> = Vec::new();
        let mut cur = ROOT;
        for ch in word.chars() {
            let Some(next) = self.child(cur, ch) else {
                return;
            };
            path.push((cur, ch));
            cur = next;
        }
        if !self.node_mut(cur).is_some_and(|node| node.keys.remove(key)) {
            return;
        }
        stats.touched.insert(cur);

        while let Some((parent, ch)) = path.pop() {
            if !self.node(cur).is_some_and(SearchNode::is_empty) {
                break;
            }
            self.release(cur, stats);
            if let Some(p) = self.node_mut(parent) {
                p.children.remove(&ch);
            }
            if let Some(targets) = self.by_char.get_mut(&ch) {
                targets.remove(&cur);
                if targets.is_empty() {
                    self.by_char.remove(&ch);
                }
            }
            stats.touched.insert(parent);
            cur = parent;
        }
    }
}
