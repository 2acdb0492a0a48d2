//! Incrementally maintained full-text index over one text field per table.

pub mod index;
pub mod tokenize;
pub mod trie;

pub use index::{SearchIndex, SearchMode, FREE_LIST_NODE};
pub use tokenize::{tokenize, word_set};
pub use trie::{SearchNode, SearchTrie, TextChange, UpdateStats};
