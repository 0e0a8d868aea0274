//! 存储层：已接受语料（追加式）与引擎状态持久化

pub mod corpus;
pub mod persistence;

pub use corpus::{Corpus, CorpusEntry, CorpusRecord};
pub use persistence::{InMemoryStore, JsonFileStore, StateStore};
