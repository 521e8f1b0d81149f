//! Prometheus metrics for the streaming pipeline
//!
//! Dropped-line counts are exported alongside written records so the parse
//! failure rate is observable.

use once_cell::sync::Lazy;
use prometheus::{
    register_int_counter_vec, register_int_gauge_vec, Encoder, IntCounterVec, IntGaugeVec,
    TextEncoder,
};

const LABEL_TABLE: &str = "table";
const LABEL_PARTITION: &str = "partition";

static LINES_RECEIVED_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        "flightlake_lines_received_total",
        "Total raw lines admitted into micro-batches",
        &[LABEL_TABLE]
    )
    .expect("Failed to register lines_received_total metric")
});

static LINES_DROPPED_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        "flightlake_lines_dropped_total",
        "Total raw lines dropped because they failed to parse",
        &[LABEL_TABLE]
    )
    .expect("Failed to register lines_dropped_total metric")
});

static RECORDS_WRITTEN_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        "flightlake_records_written_total",
        "Total records written per partition",
        &[LABEL_TABLE, LABEL_PARTITION]
    )
    .expect("Failed to register records_written_total metric")
});

static BATCHES_COMMITTED_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        "flightlake_batches_committed_total",
        "Total micro-batches committed to the checkpoint",
        &[LABEL_TABLE]
    )
    .expect("Failed to register batches_committed_total metric")
});

static PARTITIONS_REGISTERED_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        "flightlake_partitions_registered_total",
        "Total partitions newly registered with the catalog",
        &[LABEL_TABLE]
    )
    .expect("Failed to register partitions_registered_total metric")
});

static LAST_COMMITTED_BATCH: Lazy<IntGaugeVec> = Lazy::new(|| {
    register_int_gauge_vec!(
        "flightlake_last_committed_batch",
        "Id of the last committed micro-batch",
        &[LABEL_TABLE]
    )
    .expect("Failed to register last_committed_batch metric")
});

/// Handle for recording metrics for one output table
#[derive(Clone, Debug)]
pub struct PipelineMetrics {
    table: String,
}

impl PipelineMetrics {
    pub fn new(table: impl Into<String>) -> Self {
        Self {
            table: table.into(),
        }
    }

    pub fn inc_lines_received(&self, n: u64) {
        LINES_RECEIVED_TOTAL.with_label_values(&[&self.table]).inc_by(n);
    }

    pub fn inc_lines_dropped(&self, n: u64) {
        LINES_DROPPED_TOTAL.with_label_values(&[&self.table]).inc_by(n);
    }

    pub fn inc_records_written(&self, partition: &str, n: u64) {
        RECORDS_WRITTEN_TOTAL
            .with_label_values(&[&self.table, partition])
            .inc_by(n);
    }

    pub fn inc_batches_committed(&self) {
        BATCHES_COMMITTED_TOTAL.with_label_values(&[&self.table]).inc();
    }

    pub fn inc_partitions_registered(&self) {
        PARTITIONS_REGISTERED_TOTAL
            .with_label_values(&[&self.table])
            .inc();
    }

    pub fn set_last_committed_batch(&self, batch_id: u64) {
        LAST_COMMITTED_BATCH
            .with_label_values(&[&self.table])
            .set(batch_id as i64);
    }

    pub fn get_lines_dropped(&self) -> u64 {
        LINES_DROPPED_TOTAL.with_label_values(&[&self.table]).get()
    }

    pub fn get_records_written(&self, partition: &str) -> u64 {
        RECORDS_WRITTEN_TOTAL
            .with_label_values(&[&self.table, partition])
            .get()
    }
}

/// Encode all metrics to Prometheus text format
pub fn encode_metrics() -> Result<String, prometheus::Error> {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();
    encoder.encode(&metric_families, &mut buffer)?;
    String::from_utf8(buffer).map_err(|e| {
        prometheus::Error::Msg(format!("Failed to encode metrics as UTF-8: {}", e))
    })
}
