//! Core types and the package backend for pakt.
//!
//! This crate provides the backend façade, the package cache and search
//! index behind it, and the protocol spoken with the privileged worker.
//! Database implementations live in `pakt-alpm`; the worker itself in
//! `pakt-worker`.

pub mod backend;
pub mod cache;
pub mod codes;
pub mod config;
pub mod database;
pub mod error;
pub mod package;
pub mod protocol;
pub mod search;
pub mod transport;

pub use backend::{Backend, BackendEvent};
pub use codes::{Details, ErrorCode, FetchType, WarningCode, WorkerEvent, WorkerQuestion};
pub use config::{BackendConfig, DatabaseConfig};
pub use database::{MemoryDatabase, PackageDatabase};
pub use error::{Error, Result};
pub use package::{Group, InstallReason, Mark, Package, PackageState, Version};
pub use protocol::{ChangeSet, WorkerMessage, WorkerRequest};
pub use transport::{ProcessTransport, WorkerSession, WorkerTransport};
