//! Docucache - semantic document cache
//!
//! Stores embedded document chunks in a keyed store and answers
//! natural-language queries with the most similar chunks, through the
//! store's vector index when it has one and a brute-force scan otherwise.

pub mod cli;
pub mod config;
pub mod embedding;
pub mod error;
pub mod search;
pub mod service;
pub mod storage;
pub mod vector;

pub use error::{DocCacheError, Result};
pub use search::{SearchFilters, SearchQuery, SearchResponse};
pub use service::{DocumentCache, IndexReport};
