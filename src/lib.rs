#![warn(clippy::pedantic, clippy::nursery, clippy::cargo, clippy::perf)]

//! # `metrics_shm_repository`
//!
//! A shared-memory counter repository. A provider process registers
//! categories of counters, creates instances of them and updates their
//! values in place; collector processes attach to the same memory and read
//! every instance on demand as a self-describing binary stream.
//!
//! - [`PerfProvider`] owns the repository: schema registration, instance
//!   creation, lookup and release under a timed lock, collection and XML
//!   export/import.
//! - [`PerfCollector`] attaches read-only to a published repository.
//! - [`CollectServer`] and [`CollectClient`] carry collect calls over a
//!   local socket.
//!
//! Memory is provided by a [`SegmentStore`]: [`MemoryStore`] for a single
//! process, [`MappedFileStore`] for memory-mapped files shared between
//! processes.
//!
//! ## Async Support
//!
//! Async support is available via the `tokio` feature flag. When enabled, the collect endpoint runs as a Tokio task and requires a Tokio runtime. Enable with:
//!
//! ```toml
//! [dependencies]
//! metrics_shm_repository = { version = "...", features = ["tokio"] }
//! ```
//!
//! If the `tokio` feature is not enabled, the endpoint uses threads and blocking IO.
//!
//! See README and demos for details.

mod block;
mod collect;
mod config;
mod directory;
mod error;
mod provider;
mod reader;
mod schema;
mod segment;
mod snapshot;
mod telemetry;
mod transport;

pub use collect::{
    CollectFilter, CollectOutcome, CollectStatus, DecodedCounter, DecodedInstance, DecodedObject,
    decode_objects,
};
pub use config::RepositoryConfig;
pub use directory::{InstanceHandle, InstanceInfo};
pub use error::{RepositoryError, Result};
pub use provider::{PerfProvider, RepositoryGuard};
pub use reader::{BlockUsage, PerfCollector};
pub use schema::{
    CategoryBuilder, CategoryDefinition, CounterDefinition, CounterType, SchemaRegistry,
    SizeClass, detail,
};
pub use segment::{MappedFileStore, MemoryStore, Segment, SegmentStore, StoreLock};
pub use snapshot::{Snapshot, SnapshotCategory, SnapshotInstance};
pub use telemetry::describe_metrics;
pub use transport::{
    CollectClient, CollectReply, CollectRequest, CollectResponse, CollectServer, DEFAULT_SOCKET,
    MAX_BUFFER_SIZE,
};
