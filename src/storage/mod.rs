//! # Storage Module
//!
//! The durable store: an indexed, transactional SQLite database holding
//! every entity the client owns locally, plus the encrypted backup boundary
//! and session diagnostics.
//!
//! ## Storage Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                         STORAGE SYSTEM                                  │
//! ├─────────────────────────────────────────────────────────────────────────┤
//! │                                                                         │
//! │  ┌─────────────────────────────────────────────────────────────────┐   │
//! │  │  SQLite Database (single source of truth)                       │   │
//! │  │  ────────────────────────────────────────                        │   │
//! │  │                                                                 │   │
//! │  │  • messages / conversations    cursor pagination, read markers  │   │
//! │  │  • deleted_messages            tombstones against re-sync       │   │
//! │  │  • encryption_states           ratchet history (opaque blobs)   │   │
//! │  │  • latest_states               first-establishment projection   │   │
//! │  │  • spaces / space_keys / space_members / conversation_users     │   │
//! │  │  • bookmarks (ceiling-capped) / muted_users / user_config       │   │
//! │  │  • action_queue                crash-safe deferred mutations    │   │
//! │  └─────────────────────────────────────────────────────────────────┘   │
//! │                                                                         │
//! │  ┌───────────────────────────┐  ┌─────────────────────────────────┐    │
//! │  │  Backup (backup.rs)       │  │  Diagnostics (diagnostics.rs)   │    │
//! │  │  AES-256-GCM export of    │  │  Bloat classification of        │    │
//! │  │  DM data, keyed off the   │  │  ratchet sessions, read-only    │    │
//! │  │  user's private key       │  │                                 │    │
//! │  └───────────────────────────┘  └─────────────────────────────────┘    │
//! │                                                                         │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

mod backup;
mod database;
mod diagnostics;
mod schema;

pub use backup::{BackupFile, BackupPayload, BackupService, ImportSummary};
pub use database::{
    Bookmark, BookmarkPreview, BookmarkSource, Database, DatabaseConfig, EncryptionState,
    MutedUserRecord, SpaceKeyRecord, SpaceMemberRecord, StoreObserver, UserConfig, MAX_BOOKMARKS,
};
pub use diagnostics::{
    BloatedState, EncryptionStateReport, StateIntrospection, BLOAT_THRESHOLD_BYTES,
};

use crate::error::Result;

/// Storage configuration
#[derive(Debug, Clone, Default)]
pub struct StorageConfig {
    /// Path to the database file (None for in-memory)
    pub database_path: Option<String>,
}

/// Initialize the storage system
pub async fn init(config: StorageConfig) -> Result<Database> {
    Database::open(config.database_path.as_deref()).await
}
