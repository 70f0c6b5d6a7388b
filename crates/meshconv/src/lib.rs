//! Mesh-to-STEP conversion jobs with bounded workers, TTL expiry and a
//! client polling protocol.

pub mod broadcast;
pub mod config;
pub mod converter;
pub mod db;
pub mod error;
pub mod job;
pub mod poll;
pub mod queue;
pub mod service;
pub mod storage;
pub mod store;
pub mod sweeper;
pub mod telemetry;
pub mod worker;

pub use broadcast::{JobEvent, JobEventBroadcaster, JobEventKind};
pub use config::{default_config, load_config, Config};
pub use converter::{ConversionRequest, Converter, ExternalConverter};
pub use db::Database;
pub use error::{
    ConversionError, MeshconvError, QueueError, Result, ServiceError, StoreError,
    ValidationError,
};
pub use job::{ConversionOptions, Job, JobStatus, JobUpdate, NewJob, SourceFormat};
pub use poll::{ClientCache, FetchError, JobSnapshot, PollIntervals, PollScheduler, PollState, StatusSource};
pub use queue::{WorkQueue, WorkQueueConfig};
pub use service::{ConversionService, SubmitReceipt, SubmitRequest};
pub use storage::ArtifactStore;
pub use store::{JobRecordStore, MemoryJobStore, SqliteJobStore};
pub use sweeper::{CleanupSweeper, SweepPolicy, SweepReport};
pub use telemetry::init_logging;
pub use worker::{WorkerContext, WorkerPool, WorkerPoolConfig};
