//! Space state synchronization engine.
//!
//! Tracks host windows as named spaces and keeps their identity and tabs
//! across window close, restore and process restarts. A single actor owns
//! the authoritative record; UI surfaces reach it through a cloneable
//! [`EngineHandle`].
//!
//! ## Usage
//!
//! ```rust,ignore
//! let storage = Arc::new(FileStorage::new(default_storage_root(), "default".into()));
//! let host = Arc::new(MirrorHost::new());
//! let (engine, task) = spawn(EngineConfig::default(), storage, host.clone())?;
//!
//! // The host connection receives window commands here and reports its
//! // windows with a `startup` event before the first reconciliation runs
//! let commands = host.attach();
//!
//! // Rename the space in window 1, read against version 3
//! engine
//!     .request(Request::RenameSpace {
//!         window_id: WindowId(1),
//!         name: "Focus".into(),
//!         expected_version: Some(3),
//!     })
//!     .await?;
//!
//! // Write everything out before the process goes away
//! engine.suspend().await?;
//! engine.shutdown().await?;
//! ```

pub mod broadcast;
pub mod cache;
pub mod config;
pub mod conflict;
pub mod debounce;
pub mod engine;
pub mod error;
pub mod host;
pub mod model;
pub mod persistence;
pub mod protocol;
pub mod queue;
pub mod reconcile;
pub mod storage;
pub mod store;

pub use broadcast::SurfaceId;
pub use config::{EngineConfig, default_config_path};
pub use engine::{EngineHandle, ReconcileSummary, Reply, Subscription, spawn};
pub use error::{ConfigError, SpaceError, SpaceResult, StorageError, StorageResult};
pub use host::{HostWindows, MirrorHost, WindowOpening};
pub use model::{ClosedSpace, HostWindow, PermanentId, Space, SpaceRecord, StoredSpaces, WindowId};
pub use protocol::{
    AllSpaces, BroadcastAction, BroadcastMessage, EngineStatus, HostCommand, HostCommandMessage,
    HostEvent, Inbound, Request, Response,
};
pub use queue::MutationOutcome;
pub use storage::{FileStorage, MemoryStorage, SpaceStorage, default_storage_root};
pub use store::{Mutation, MutationRequest};
