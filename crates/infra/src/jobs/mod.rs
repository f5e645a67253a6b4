//! Persisted job queue and the worker that drains it.
//!
//! All pipeline work flows through here:
//!
//! - `types`: job model, priorities, retention and retry policy
//! - `payload`: topic names and their typed payloads
//! - `store`: the `JobStore` trait and an in-memory implementation
//! - `postgres`: the `fhir.jobs` implementation
//! - `worker`: polling loop with per-topic handlers

pub mod payload;
pub mod postgres;
pub mod store;
pub mod types;
pub mod worker;

pub use payload::{
    AllFromUpstream, EntireResource, FromUpstream, JobPayload, PayloadError,
    RESOLVER_DISCRIMINANT, UpstreamOp, topics,
};
pub use postgres::PostgresJobStore;
pub use store::{InMemoryJobStore, JobStats, JobStore, JobStoreError};
pub use types::{
    BackoffStrategy, Job, JobId, JobPriority, JobRetention, JobStatus, RetryPolicy, SubmitOptions,
};
pub use worker::{
    HandlerContext, HandlerError, HandlerFuture, JobHandler, Worker, WorkerConfig, WorkerHandle,
    WorkerStats,
};
