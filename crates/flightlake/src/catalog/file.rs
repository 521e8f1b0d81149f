use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tokio::sync::Mutex;
use tracing::info;

use super::{Catalog, PartitionEntry};
use crate::error::CatalogError;
use crate::record::PartitionKey;

#[derive(Debug, Default, Serialize, Deserialize)]
struct CatalogDocument {
    tables: BTreeMap<String, Vec<PartitionEntry>>,
}

/// Catalog persisted as a single JSON document. Every new registration
/// rewrites the document atomically (tmp file + rename).
pub struct FileCatalog {
    path: PathBuf,
    doc: Mutex<CatalogDocument>,
}

impl FileCatalog {
    /// Open the catalog at `path`, starting empty if the file does not exist
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, CatalogError> {
        let path = path.into();
        let doc = if path.exists() {
            serde_json::from_slice(&std::fs::read(&path)?)?
        } else {
            CatalogDocument::default()
        };
        Ok(Self {
            path,
            doc: Mutex::new(doc),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Drop every table and remove the backing file
    pub async fn clear(&self) -> Result<(), CatalogError> {
        let mut doc = self.doc.lock().await;
        doc.tables.clear();
        if self.path.exists() {
            std::fs::remove_file(&self.path)?;
        }
        info!(path = ?self.path, "Catalog cleared");
        Ok(())
    }

    fn persist(&self, doc: &CatalogDocument) -> Result<(), CatalogError> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let json = serde_json::to_vec_pretty(doc)?;
        let tmp_path = self.path.with_extension("json.tmp");
        std::fs::write(&tmp_path, json)?;
        std::fs::rename(&tmp_path, &self.path)?;
        Ok(())
    }
}

#[async_trait]
impl Catalog for FileCatalog {
    async fn add_partition_if_absent(
        &self,
        table: &str,
        key: PartitionKey,
        location: PathBuf,
    ) -> Result<bool, CatalogError> {
        let mut doc = self.doc.lock().await;
        let entries = doc.tables.entry(table.to_string()).or_default();
        if entries.iter().any(|e| e.key == key) {
            return Ok(false);
        }
        let pos = entries.partition_point(|e| e.key < key);
        entries.insert(pos, PartitionEntry { key, location });

        if let Err(e) = self.persist(&doc) {
            // Keep memory in step with disk
            if let Some(entries) = doc.tables.get_mut(table) {
                entries.retain(|e| e.key != key);
            }
            return Err(CatalogError::RegistrationFailed(format!(
                "{} partition {}: {}",
                table, key, e
            )));
        }
        Ok(true)
    }

    async fn list_partitions(&self, table: &str) -> Result<Vec<PartitionEntry>, CatalogError> {
        let doc = self.doc.lock().await;
        Ok(doc.tables.get(table).cloned().unwrap_or_default())
    }

    async fn flush(&self) -> Result<(), CatalogError> {
        let doc = self.doc.lock().await;
        self.persist(&doc)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn key(day: u32) -> PartitionKey {
        PartitionKey { year: 2008, month: 1, day }
    }

    #[tokio::test]
    async fn test_registrations_survive_reopen() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("catalog.json");

        let catalog = FileCatalog::open(&path).unwrap();
        assert!(catalog
            .add_partition_if_absent("flights", key(2), tmp.path().join("2008-01-02"))
            .await
            .unwrap());
        assert!(catalog
            .add_partition_if_absent("flights", key(1), tmp.path().join("2008-01-01"))
            .await
            .unwrap());
        assert!(!path.with_extension("json.tmp").exists());
        drop(catalog);

        let reopened = FileCatalog::open(&path).unwrap();
        let entries = reopened.list_partitions("flights").await.unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].key, key(1));
        assert!(!reopened
            .add_partition_if_absent("flights", key(1), tmp.path().join("2008-01-01"))
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn test_clear_removes_file() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("nested").join("catalog.json");
        let catalog = FileCatalog::open(&path).unwrap();
        assert_eq!(catalog.path(), path.as_path());
        catalog
            .add_partition_if_absent("flights", key(1), PathBuf::from("x"))
            .await
            .unwrap();
        assert!(catalog.path().exists());

        catalog.clear().await.unwrap();
        assert!(!path.exists());
        assert!(catalog.list_partitions("flights").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_open_rejects_corrupt_document() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("catalog.json");
        std::fs::write(&path, b"not json").unwrap();
        assert!(matches!(
            FileCatalog::open(&path),
            Err(CatalogError::Serialization(_))
        ));
    }
}
