//! Durable state: entity models and the SQLite store.

pub mod models;
pub mod store;

pub use models::*;
pub use store::{AssetDraft, ContentUpdate, StageCommit, Store};
