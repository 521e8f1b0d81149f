//! Partition catalog: maps a partition key to its storage location so
//! query engines can discover data. Only two operations matter to the
//! engine: idempotent registration and listing.

mod file;
mod memory;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use crate::error::CatalogError;
use crate::record::PartitionKey;

pub use file::FileCatalog;
pub use memory::InMemoryCatalog;

/// One registered partition
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartitionEntry {
    pub key: PartitionKey,
    pub location: PathBuf,
}

#[async_trait]
pub trait Catalog: Send + Sync {
    /// Register a partition unless it already exists.
    /// Returns `true` when a new entry was created.
    async fn add_partition_if_absent(
        &self,
        table: &str,
        key: PartitionKey,
        location: PathBuf,
    ) -> Result<bool, CatalogError>;

    /// All partitions of a table, ordered by key
    async fn list_partitions(&self, table: &str) -> Result<Vec<PartitionEntry>, CatalogError>;

    /// Persist any buffered state. Called once during shutdown.
    async fn flush(&self) -> Result<(), CatalogError> {
        Ok(())
    }
}
