mod db;
mod models;
pub(crate) mod schema;

pub use db::{ChunkReceipt, EnqueueOutcome, InventoryDb};
pub use models::{FileNode, FolderNode, StorageProviderRecord};

#[cfg(test)]
pub(crate) use db::test_support;
