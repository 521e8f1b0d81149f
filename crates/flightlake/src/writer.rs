use std::collections::HashSet;
use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::PathBuf;
use std::sync::Arc;

use tracing::{debug, info};

use crate::batch::PartitionedBatch;
use crate::catalog::Catalog;
use crate::error::WriterError;
use crate::metrics::PipelineMetrics;
use crate::record::{ParsedRecord, PartitionKey};

/// A registered partition and where its files live
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Partition {
    pub key: PartitionKey,
    pub location: PathBuf,
}

/// Outcome of writing one micro-batch
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct BatchWriteSummary {
    pub partitions: usize,
    pub records: u64,
    pub new_registrations: usize,
}

/// Registers partitions with the catalog and writes their records as
/// pipe-delimited text under `{base_dir}/{yyyy}-{mm}-{dd}/`.
pub struct PartitionWriter {
    base_dir: PathBuf,
    table: String,
    catalog: Arc<dyn Catalog>,
    registered: HashSet<PartitionKey>,
    verify: bool,
    metrics: PipelineMetrics,
}

impl PartitionWriter {
    pub fn new(
        base_dir: impl Into<PathBuf>,
        table: impl Into<String>,
        catalog: Arc<dyn Catalog>,
        metrics: PipelineMetrics,
    ) -> Self {
        Self {
            base_dir: base_dir.into(),
            table: table.into(),
            catalog,
            registered: HashSet::new(),
            verify: false,
            metrics,
        }
    }

    /// List catalog partitions after each batch (logged, never affects results)
    pub fn with_verification(mut self, verify: bool) -> Self {
        self.verify = verify;
        self
    }

    pub fn location(&self, key: &PartitionKey) -> PathBuf {
        self.base_dir.join(key.dir_name())
    }

    /// Register `key` with the catalog if this writer has not done so yet
    pub async fn ensure_partition(&mut self, key: PartitionKey) -> Result<Partition, WriterError> {
        self.register(key).await.map(|(partition, _)| partition)
    }

    /// Like `ensure_partition`, also reporting whether the catalog created a new entry
    async fn register(&mut self, key: PartitionKey) -> Result<(Partition, bool), WriterError> {
        let location = self.location(&key);
        let mut created = false;
        if !self.registered.contains(&key) {
            created = self
                .catalog
                .add_partition_if_absent(&self.table, key, location.clone())
                .await?;
            if created {
                info!(table = %self.table, partition = %key, location = ?location, "Registered partition");
                self.metrics.inc_partitions_registered();
            }
            self.registered.insert(key);
        }
        Ok((Partition { key, location }, created))
    }

    /// Write `records` to the partition's file for `batch_id`.
    /// The file appears atomically; a rerun of the same batch id replaces it.
    pub fn write_partition_records(
        &self,
        partition: &Partition,
        batch_id: u64,
        records: &[ParsedRecord],
    ) -> Result<PathBuf, WriterError> {
        if !self.registered.contains(&partition.key) {
            return Err(WriterError::WriteFailed(format!(
                "partition {} written before registration",
                partition.key
            )));
        }

        fs::create_dir_all(&partition.location)?;

        let filename = format!("batch-{:010}.txt", batch_id);
        let path = partition.location.join(&filename);
        let tmp_path = partition.location.join(format!(".{}.tmp", filename));

        let mut out = BufWriter::new(File::create(&tmp_path)?);
        for record in records {
            writeln!(out, "{}", record.to_row())?;
        }
        let file = out
            .into_inner()
            .map_err(|e| WriterError::WriteFailed(e.to_string()))?;
        file.sync_all()?;
        fs::rename(&tmp_path, &path)?;

        self.metrics
            .inc_records_written(&partition.key.dir_name(), records.len() as u64);
        Ok(path)
    }

    /// Register then write every partition present in the batch
    pub async fn write_batch(&mut self, batch: &PartitionedBatch) -> Result<BatchWriteSummary, WriterError> {
        let mut summary = BatchWriteSummary::default();

        for (key, records) in &batch.partitions {
            let (partition, created) = self.register(*key).await?;
            if created {
                summary.new_registrations += 1;
            }
            let path = self.write_partition_records(&partition, batch.batch_id, records)?;
            debug!(batch_id = batch.batch_id, partition = %key, records = records.len(), path = ?path, "Wrote partition file");
            summary.partitions += 1;
            summary.records += records.len() as u64;
        }

        if self.verify {
            let listed = self.catalog.list_partitions(&self.table).await?;
            debug!(table = %self.table, partitions = listed.len(), "Catalog partitions after batch");
        }

        Ok(summary)
    }
}
