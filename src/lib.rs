//! Storage orchestration engine: chunked client uploads, resumable moves
//! between storage providers, and reconciliation of provider trees into a
//! unified virtual file tree.

pub mod activity;
pub mod api;
pub mod cache;
pub mod config;
pub mod crypto;
pub mod engine;
pub mod error;
pub mod events;
pub mod files;
pub mod inventory;
pub mod logging;
pub mod providers;
pub mod sync;
pub mod tasks;
pub mod transfer;
pub mod uploader;
pub mod utils;

pub use engine::Engine;
pub use error::{EngineError, EngineResult, ProviderError, ProviderResult};
