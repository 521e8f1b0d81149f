//! flightlake: micro-batch streaming ETL for flight records
//!
//! Lines arrive over TCP, are grouped into fixed-interval micro-batches,
//! partitioned by flight date, registered with a catalog and written as
//! pipe-delimited text. Every committed batch is checkpointed so a restart
//! resumes without redoing committed work.

pub mod batch;
pub mod catalog;
pub mod checkpoint;
pub mod config;
pub mod error;
pub mod ingest;
pub mod listener;
pub mod metrics;
pub mod record;
pub mod runner;
pub mod server;
pub mod writer;

pub use batch::{BatchPartitioner, MicroBatch, PartitionedBatch, RawLine};
pub use catalog::{Catalog, FileCatalog, InMemoryCatalog, PartitionEntry};
pub use checkpoint::{Checkpoint, CheckpointManager, CheckpointState};
pub use config::EngineConfig;
pub use error::{
    CatalogError, CheckpointError, ConfigError, EngineError, IngestError, WriterError,
};
pub use ingest::{LineSource, TcpLineSource};
pub use listener::{FailureListener, ShutdownSignal, SourceEvent, SourceListener, StopReason};
pub use record::{FlightDate, ParseFailure, ParsedRecord, PartitionKey, RecordParser};
pub use runner::{EngineState, EngineStatus, Orchestrator, RunOutcome};
pub use server::{create_router, run_server, ServerState};
pub use writer::{BatchWriteSummary, Partition, PartitionWriter};
