//! Idempotent, time-indexed storage of crawled posts

pub mod store;
pub mod types;

pub use store::{InsertReceipt, PostStore};
pub use types::CrawledPost;
