pub mod avl;
pub mod chunk_buffer;
pub mod cmdline;
pub mod string_trie;
