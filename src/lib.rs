//! # rnsync
//!
//! Shared-state synchronization core for a release-note issue tracker.
//!
//! ## Core Concepts
//!
//! - **Records**: field maps identified by `issue_number`, persisted in a
//!   key-value store
//! - **Tables**: whole spreadsheet snapshots (styled cells plus merge regions)
//! - **Service**: every mutation runs read-diff-write-publish under one
//!   process-wide exclusive lock
//! - **Change bus**: fire-and-forget broadcasts on `rn_channel` and
//!   `table_updates`, each subscriber with its own bounded buffer
//! - **Client cache**: per-client mirror patched from broadcasts, then
//!   resynced from the service
//!
//! ## Example
//!
//! ```ignore
//! use rnsync::{Actor, ClientId, Record, RecordService, SubscriptionConfig};
//!
//! let service = RecordService::in_memory();
//! let events = service.bus().subscribe(SubscriptionConfig::default());
//!
//! let actor = Actor::new(ClientId::random(), "ann");
//! let outcome = service.save(&actor, Record::with_issue_number("1001"), None)?;
//! assert_eq!(outcome.operation, Operation::Post);
//! ```

pub mod api;
pub mod bus;
pub mod client;
pub mod config;
pub mod diff;
pub mod error;
pub mod filter;
pub mod guard;
pub mod http;
pub mod service;
pub mod store;
pub mod telemetry;
pub mod types;

// Re-exports
pub use api::{RecordApi, SaveOutcome};
pub use bus::{
    BusMessage, ChangeBus, DropReason, SubscriptionConfig, SubscriptionHandle, SubscriptionId,
    Topic,
};
pub use client::{
    BroadcastListener, ClientCache, Effect, EventSource, HttpClient, Reconciliation,
    RecordSession, RemoteSubscription, TableSession, TableUpdate,
};
pub use config::{ClientConfig, LogFormat, SeedUser, ServerConfig};
pub use diff::{diff, summarize, FieldChange};
pub use error::{Result, SyncError};
pub use filter::{Clause, SearchFilter};
pub use guard::{ConcurrencyGuard, GuardStats};
pub use service::RecordService;
pub use store::{FileBackend, KvBackend, MemoryBackend, RecordStore, StoreConfig};
pub use types::*;
