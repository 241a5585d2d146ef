//! Local-first sync engine for TillSync.
//!
//! Keeps a device's embedded store consistent with the shared multi-tenant
//! remote store while connectivity comes and goes.
//!
//! # Architecture
//!
//! ## Components
//!
//! - **Transform**: camelCase/snake_case and date conversion between the
//!   local and remote row shapes, driven by each table's [`TableSpec`]
//! - **Tagger**: stamps records with the active tenant and rejects records
//!   owned by another tenant
//! - **Healer**: repairs dangling foreign keys and consolidates duplicates
//!   sharing a natural key
//! - **Push / Pull**: per-table pipelines; push never deletes remotely, pull
//!   never wipes local rows the remote side does not know about
//! - **Handshake**: migrations, then a full restore, then `ready`
//! - **Realtime**: one live channel per table applying remote changes locally
//! - **Scheduler**: coalesces local mutations into one debounced push
//!
//! ## Data flow
//!
//! 1. A caller saves a record through [`SyncEngine::save`]
//! 2. The record is tagged, written locally and a `Mutated` command is queued
//! 3. The scheduler waits out the debounce window and runs `push_all`
//! 4. Each table is consolidated, tagged, healed, transformed and upserted
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use tillsync_model::TableRegistry;
//! use tillsync_storage::LocalStore;
//! use tillsync_sync::{SyncConfig, SyncEngine, remote::memory::MemoryRemoteStore};
//!
//! # async fn run() -> tillsync_sync::SyncResult<()> {
//! let store = LocalStore::open_in_memory(Arc::new(TableRegistry::standard()))?;
//! let remote = Arc::new(MemoryRemoteStore::new());
//! let engine = Arc::new(SyncEngine::new(store, remote, SyncConfig::default()));
//!
//! engine.start_session().await;
//! engine.start_scheduler().await?;
//! # Ok(())
//! # }
//! ```
//!
//! [`TableSpec`]: tillsync_model::TableSpec

mod config;
mod connectivity;
mod engine;
mod error;
pub mod handshake;
pub mod healer;
mod health;
pub mod pull;
pub mod push;
pub mod realtime;
pub mod remote;
pub mod scheduler;
pub mod tagger;
pub mod transform;

pub use config::{RealtimeConfig, SyncConfig};
pub use engine::{SyncEngine, SyncStatus};
pub use error::{SyncError, SyncResult};
pub use handshake::{HandshakeReport, HandshakeState};
pub use healer::{ConsolidationReport, HealReport};
pub use health::BindingCheck;
pub use pull::{PullOutcome, RestoreReport};
pub use push::{PushAllReport, PushReport};
pub use realtime::{ChangeEvent, ChannelState, ChannelStatus, RealtimeTransport};
pub use remote::{Profile, RemoteStore};
pub use scheduler::SyncCommand;
