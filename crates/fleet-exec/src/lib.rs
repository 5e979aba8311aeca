//! Fans a single command out to many remote hosts over SSH.
//!
//! The core pieces, leaf first: a fingerprint-keyed [`pool`] of
//! authenticated connections, a deadline-bound [`executor`] running one
//! command per session, a [`service`] orchestrating bounded-concurrency
//! batches with cancellable jobs, and an [`audit`] pipe persisting
//! execution history without ever stalling the hot path.

pub mod audit;
pub mod config;
pub mod executor;
pub mod inventory;
pub mod pool;
pub mod service;
pub mod store;

pub use audit::AuditWriter;
pub use config::{load_config, AuditConfig, ExecConfig};
pub use executor::{ChunkSink, CommandRunner, RunOutput, RunSpec, SshExecutor, StreamRunner};
pub use inventory::{MachineDirectory, SharedKeySource, StaticDirectory};
pub use pool::{ConnectionPool, PooledConnection};
pub use service::ExecService;
pub use store::{AuditStore, FileAuditStore};

pub use fleet_types::{AuditRecord, AuthMode, ExecError, ExecResult, ExecTask, Machine};
