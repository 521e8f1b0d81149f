use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use tracing::debug;

use crate::record::{ParsedRecord, PartitionKey, RecordParser};

/// A single text line as received, tagged with the micro-batch it landed in
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawLine {
    pub batch_id: u64,
    pub text: String,
}

/// Lines received during one batch interval
#[derive(Debug, Clone)]
pub struct MicroBatch {
    pub id: u64,
    pub timestamp: DateTime<Utc>,
    pub lines: Vec<RawLine>,
}

impl MicroBatch {
    pub fn new(id: u64, timestamp: DateTime<Utc>, lines: Vec<String>) -> Self {
        let lines = lines
            .into_iter()
            .map(|text| RawLine { batch_id: id, text })
            .collect();
        Self { id, timestamp, lines }
    }

    pub fn len(&self) -> usize {
        self.lines.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lines.is_empty()
    }
}

/// Result of partitioning one batch: records grouped by key, arrival order
/// preserved within each group
#[derive(Debug, Default)]
pub struct PartitionedBatch {
    pub batch_id: u64,
    pub partitions: BTreeMap<PartitionKey, Vec<ParsedRecord>>,
    pub parsed: usize,
    pub dropped: usize,
}

impl PartitionedBatch {
    pub fn keys(&self) -> impl Iterator<Item = &PartitionKey> {
        self.partitions.keys()
    }
}

/// Parses every line of a batch and groups survivors by partition key
#[derive(Debug, Clone, Default)]
pub struct BatchPartitioner {
    parser: RecordParser,
}

impl BatchPartitioner {
    pub fn new(parser: RecordParser) -> Self {
        Self { parser }
    }

    /// Consumes the batch. Unparsable lines are dropped and counted.
    pub fn partition(&self, batch: MicroBatch) -> PartitionedBatch {
        let mut out = PartitionedBatch {
            batch_id: batch.id,
            ..Default::default()
        };

        for line in batch.lines {
            match self.parser.parse(&line.text) {
                Ok(record) => {
                    out.partitions
                        .entry(PartitionKey::of(&record))
                        .or_default()
                        .push(record);
                    out.parsed += 1;
                }
                Err(e) => {
                    debug!(batch_id = line.batch_id, error = %e, line = %line.text, "Dropping unparsable line");
                    out.dropped += 1;
                }
            }
        }

        out
    }
}
