use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use tokio::sync::RwLock;

use super::{Catalog, PartitionEntry};
use crate::error::CatalogError;
use crate::record::PartitionKey;

type TableData = BTreeMap<PartitionKey, PathBuf>;

/// Catalog held in process memory. Counts registrations that actually
/// created an entry.
pub struct InMemoryCatalog {
    tables: RwLock<HashMap<String, TableData>>,
    registrations: AtomicUsize,
}

impl InMemoryCatalog {
    pub fn new() -> Self {
        Self {
            tables: RwLock::new(HashMap::new()),
            registrations: AtomicUsize::new(0),
        }
    }

    pub fn registrations(&self) -> usize {
        self.registrations.load(Ordering::SeqCst)
    }

    pub async fn clear(&self) {
        self.tables.write().await.clear();
    }
}

impl Default for InMemoryCatalog {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Catalog for InMemoryCatalog {
    async fn add_partition_if_absent(
        &self,
        table: &str,
        key: PartitionKey,
        location: PathBuf,
    ) -> Result<bool, CatalogError> {
        let mut tables = self.tables.write().await;
        let partitions = tables.entry(table.to_string()).or_default();
        if partitions.contains_key(&key) {
            return Ok(false);
        }
        partitions.insert(key, location);
        self.registrations.fetch_add(1, Ordering::SeqCst);
        Ok(true)
    }

    async fn list_partitions(&self, table: &str) -> Result<Vec<PartitionEntry>, CatalogError> {
        let tables = self.tables.read().await;
        Ok(tables
            .get(table)
            .map(|t| {
                t.iter()
                    .map(|(key, location)| PartitionEntry {
                        key: *key,
                        location: location.clone(),
                    })
                    .collect()
            })
            .unwrap_or_default())
    }
}
