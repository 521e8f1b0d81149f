use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::select;
use tokio::time::{interval_at, sleep_until, Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::batch::{BatchPartitioner, MicroBatch};
use crate::catalog::Catalog;
use crate::checkpoint::{BatchStats, CheckpointManager};
use crate::error::{ConfigError, EngineError, IngestError};
use crate::ingest::LineSource;
use crate::listener::{FailureListener, ShutdownSignal, StopReason};
use crate::metrics::PipelineMetrics;
use crate::writer::{BatchWriteSummary, PartitionWriter};

/// Orchestrator lifecycle: `Starting -> Running -> Stopping -> Stopped`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum EngineState {
    Starting = 0,
    Running = 1,
    Stopping = 2,
    Stopped = 3,
}

impl EngineState {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => EngineState::Starting,
            1 => EngineState::Running,
            2 => EngineState::Stopping,
            _ => EngineState::Stopped,
        }
    }
}

impl fmt::Display for EngineState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            EngineState::Starting => "starting",
            EngineState::Running => "running",
            EngineState::Stopping => "stopping",
            EngineState::Stopped => "stopped",
        };
        f.write_str(s)
    }
}

/// Read-only view of the orchestrator, shared with the health server
#[derive(Clone)]
pub struct EngineStatus {
    state: Arc<AtomicU8>,
    connected: Arc<AtomicBool>,
}

impl EngineStatus {
    pub fn new(connected: Arc<AtomicBool>) -> Self {
        Self {
            state: Arc::new(AtomicU8::new(EngineState::Starting as u8)),
            connected,
        }
    }

    pub fn state(&self) -> EngineState {
        EngineState::from_u8(self.state.load(Ordering::SeqCst))
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    /// Running and attached to the source
    pub fn is_ready(&self) -> bool {
        self.state() == EngineState::Running && self.is_connected()
    }

    fn set(&self, state: EngineState) {
        self.state.store(state as u8, Ordering::SeqCst);
    }
}

/// How a run that did not fail came to an end
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunOutcome {
    pub reason: StopReason,
    /// Batches committed during this run only
    pub batches_committed: u64,
    pub last_committed_batch: Option<u64>,
    /// Lines received but never admitted into a batch
    pub lines_discarded: usize,
}

/// Drives the source through micro-batches into the partition writer,
/// committing each batch to the checkpoint before the next one starts.
pub struct Orchestrator<S: LineSource> {
    source: S,
    catalog: Arc<dyn Catalog>,
    checkpoint: CheckpointManager,
    partitioner: BatchPartitioner,
    writer: PartitionWriter,
    shutdown: ShutdownSignal,
    status: EngineStatus,
    metrics: PipelineMetrics,
    batch_interval: Duration,
    run_duration: Option<Duration>,
    next_batch_id: u64,
    batches_committed: u64,
}

impl<S: LineSource> Orchestrator<S> {
    /// Build the pipeline from the checkpoint's configuration, which is the
    /// launch configuration on a fresh start and the recorded one on resume.
    pub fn new(
        source: S,
        catalog: Arc<dyn Catalog>,
        checkpoint: CheckpointManager,
        shutdown: ShutdownSignal,
    ) -> Result<Self, EngineError> {
        let config = checkpoint.config().clone();
        let batch_interval = config.batch_interval()?;
        let run_duration = config.run_duration()?;
        let metrics = PipelineMetrics::new(&config.table_name);

        let writer = PartitionWriter::new(
            &config.output_dir,
            &config.table_name,
            Arc::clone(&catalog),
            metrics.clone(),
        )
        .with_verification(config.verify_partitions);

        let status = EngineStatus::new(source.connected_handle());
        let next_batch_id = checkpoint.next_batch_id();

        Ok(Self {
            source,
            catalog,
            checkpoint,
            partitioner: BatchPartitioner::default(),
            writer,
            shutdown,
            status,
            metrics,
            batch_interval,
            run_duration,
            next_batch_id,
            batches_committed: 0,
        })
    }

    /// Override the configured run duration for this process only
    pub fn with_run_duration(mut self, run_duration: Option<Duration>) -> Self {
        self.run_duration = run_duration;
        self
    }

    pub fn status(&self) -> EngineStatus {
        self.status.clone()
    }

    pub fn shutdown_signal(&self) -> ShutdownSignal {
        self.shutdown.clone()
    }

    pub fn checkpoint(&self) -> &CheckpointManager {
        &self.checkpoint
    }

    fn transition(&self, to: EngineState) {
        let from = self.status.state();
        if from != to {
            info!(from = %from, to = %to, "Orchestrator state change");
            self.status.set(to);
        }
    }

    /// Run until a stop is requested. Returns `Err` for a failed startup or
    /// a fatal batch error, always after shutdown has completed.
    pub async fn run(&mut self) -> Result<RunOutcome, EngineError> {
        self.transition(EngineState::Starting);

        let start = Instant::now();
        let Some(first_tick) = start.checked_add(self.batch_interval) else {
            let e = ConfigError::Invalid(format!("batch interval too large: {:?}", self.batch_interval));
            error!(error = %e, "Invalid batch interval, aborting startup");
            self.shutdown.request(StopReason::Fatal(e.to_string()));
            self.transition(EngineState::Stopped);
            return Err(e.into());
        };
        // Unbounded when the deadline is past what the clock can represent
        let deadline = self.run_duration.and_then(|d| start.checked_add(d));

        let listener = Arc::new(FailureListener::new(self.shutdown.clone()));
        self.source.add_listener(listener);

        if let Err(e) = self.source.connect().await {
            error!(source = %self.source.name(), error = %e, "Could not connect to source, aborting startup");
            self.shutdown.request(StopReason::Fatal(e.to_string()));
            self.transition(EngineState::Stopped);
            return Err(e.into());
        }
        let mut rx = match self.source.lines() {
            Some(rx) => rx,
            None => {
                self.shutdown.request(StopReason::Fatal(IngestError::AlreadyStarted.to_string()));
                self.source.close().await;
                self.transition(EngineState::Stopped);
                return Err(IngestError::AlreadyStarted.into());
            }
        };

        self.checkpoint.mark_running();
        self.transition(EngineState::Running);
        info!(
            source = %self.source.name(),
            interval = ?self.batch_interval,
            run_duration = ?self.run_duration,
            next_batch_id = self.next_batch_id,
            "Streaming started"
        );

        let shutdown = self.shutdown.clone();
        let mut ticker = interval_at(first_tick, self.batch_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let timeout = async move {
            match deadline {
                Some(at) => sleep_until(at).await,
                None => std::future::pending::<()>().await,
            }
        };
        tokio::pin!(timeout);

        let mut pending: Vec<String> = Vec::new();
        let mut source_open = true;
        let mut failure: Option<EngineError> = None;

        loop {
            select! {
                biased;

                _ = shutdown.requested() => break,
                _ = &mut timeout => {
                    shutdown.request(StopReason::Timeout);
                    break;
                }
                _ = ticker.tick() => {
                    if pending.is_empty() {
                        continue;
                    }
                    let batch = self.admit(std::mem::take(&mut pending));
                    if let Err(e) = self.process_batch(batch).await {
                        error!(error = %e, "Batch processing failed, shutting down");
                        shutdown.request(StopReason::Fatal(e.to_string()));
                        failure = Some(e);
                        break;
                    }
                }
                line = rx.recv(), if source_open => {
                    match line {
                        Some(line) => pending.push(line),
                        None => {
                            debug!("Line channel closed");
                            source_open = false;
                        }
                    }
                }
            }
        }

        // Stopping: interrupt ingestion, refuse further batches, finalize the catalog
        self.transition(EngineState::Stopping);
        self.source.close().await;

        let mut discarded = pending.len();
        drop(pending);
        while rx.try_recv().is_ok() {
            discarded += 1;
        }
        drop(rx);
        if discarded > 0 {
            warn!(lines = discarded, "Discarding lines not admitted into a batch");
        }

        if let Err(e) = self.catalog.flush().await {
            error!(error = %e, "Failed to finalize catalog");
            if failure.is_none() {
                failure = Some(e.into());
            }
        }

        self.checkpoint.mark_stopped();
        self.transition(EngineState::Stopped);

        if let Some(e) = failure {
            return Err(e);
        }

        Ok(RunOutcome {
            reason: self.shutdown.reason().unwrap_or(StopReason::SourceStopped),
            batches_committed: self.batches_committed,
            last_committed_batch: self.checkpoint.last_committed_batch(),
            lines_discarded: discarded,
        })
    }

    fn admit(&mut self, lines: Vec<String>) -> MicroBatch {
        let id = self.next_batch_id;
        self.next_batch_id += 1;
        MicroBatch::new(id, Utc::now(), lines)
    }

    /// Partition, register, write and commit one batch. A batch the
    /// checkpoint already covers is skipped and returns `None`.
    pub async fn process_batch(
        &mut self,
        batch: MicroBatch,
    ) -> Result<Option<BatchWriteSummary>, EngineError> {
        let batch_id = batch.id;
        if self.checkpoint.is_committed(batch_id) {
            info!(batch_id, "Batch already committed, skipping");
            return Ok(None);
        }

        let received = batch.len() as u64;
        self.metrics.inc_lines_received(received);

        let partitioned = self.partitioner.partition(batch);
        let dropped = partitioned.dropped as u64;
        if dropped > 0 {
            self.metrics.inc_lines_dropped(dropped);
        }

        let summary = self.writer.write_batch(&partitioned).await?;

        self.checkpoint.commit(
            batch_id,
            BatchStats {
                lines_received: received,
                lines_dropped: dropped,
                records_written: summary.records,
            },
        )?;
        self.metrics.inc_batches_committed();
        self.metrics.set_last_committed_batch(batch_id);
        self.batches_committed += 1;
        if batch_id >= self.next_batch_id {
            self.next_batch_id = batch_id + 1;
        }

        info!(
            batch_id,
            lines = received,
            dropped,
            partitions = summary.partitions,
            new_partitions = summary.new_registrations,
            records = summary.records,
            "Committed micro-batch"
        );
        Ok(Some(summary))
    }
}
