//! # Quorum Core
//!
//! The offline-first local core of the Quorum encrypted messenger: a
//! durable, indexed store and a crash-safe background action queue. The UI
//! layer and the cryptographic channel protocol live elsewhere; this crate
//! owns everything the client must remember and everything it has promised
//! to do once the network cooperates.
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                        QUORUM CORE MODULES                              │
//! ├─────────────────────────────────────────────────────────────────────────┤
//! │                                                                         │
//! │   user action                        inbound envelope                  │
//! │        │                                    │                           │
//! │        ▼                                    ▼                           │
//! │  ┌───────────────┐  drains   ┌───────────────────────────────┐         │
//! │  │ Action Queue  │◄──────────│  Queue Processor / Online Gate │         │
//! │  │ (persistent,  │           │  transport AND host signals    │         │
//! │  │  deduplicated)│           └──────────────┬────────────────┘         │
//! │  └──────┬────────┘                          │ handlers                 │
//! │         │ rows                              ▼                           │
//! │  ┌──────▼──────────────────────────────────────────────────┐           │
//! │  │                    Durable Store (SQLite)               │           │
//! │  │  messages · conversations · spaces · encryption states  │           │
//! │  │  bookmarks · mutes · tombstones · action_queue          │           │
//! │  └──────┬──────────────────────────────────┬───────────────┘           │
//! │         │ commit notifications             │ counts                    │
//! │         ▼                                  ▼                           │
//! │  ┌───────────────┐           ┌───────────────────────────────┐         │
//! │  │ Search Index  │           │  Sync Seam (external delta    │         │
//! │  │ (per scope,   │           │  algorithm answers from our   │         │
//! │  │  in memory)   │           │  message/member counts)       │         │
//! │  └───────────────┘           └───────────────────────────────┘         │
//! │                                                                         │
//! │  ┌─────────────────────────────────────────────────────────┐           │
//! │  │  Transport Mailbox: inbound grouped by inbox address,   │           │
//! │  │  outbound buffered until the link is open               │           │
//! │  └─────────────────────────────────────────────────────────┘           │
//! │                                                                         │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Module Hierarchy
//!
//! - [`error`] - Error types for the entire library
//! - [`messaging`] - Message and conversation domain types
//! - [`spaces`] - Space aggregate types and invariants
//! - [`storage`] - The durable store, backup boundary and diagnostics
//! - [`search`] - Per-scope in-memory search indices
//! - [`queue`] - Persistent action queue, handlers and processor
//! - [`mailbox`] - Inbound/outbound buffering around the transport
//! - [`sync`] - Narrow seam to the external sync collaborator

#![warn(missing_docs)]
#![warn(rustdoc::missing_crate_level_docs)]
#![cfg_attr(docsrs, feature(doc_cfg))]

// ============================================================================
// MODULE DECLARATIONS
// ============================================================================

pub mod error;
pub mod mailbox;
pub mod messaging;
pub mod queue;
pub mod search;
pub mod spaces;
pub mod storage;
pub mod sync;
/// Clock utilities shared across modules.
pub mod time;

// ============================================================================
// RE-EXPORTS
// ============================================================================

pub use error::{Error, Result};
pub use messaging::{Conversation, ConversationType, Message, MessagePage, PaginationDirection};
pub use queue::{ActionQueue, EnqueueOutcome, QueueProcessor, QueueStats, TaskPayload, TaskType};
pub use search::{SearchIndex, SearchScope};
pub use storage::{BackupService, Database};

use std::sync::Arc;

use mailbox::TransportMailbox;
use queue::{wire_default_handlers, OfflineStatus};
use storage::EncryptionStateReport;

// ============================================================================
// CORE CONTEXT
// ============================================================================

/// Configuration for initializing Quorum Core
#[derive(Debug, Clone, Default)]
pub struct CoreConfig {
    /// Database path (in-memory if None)
    pub database_path: Option<String>,
    /// Enable verbose logging
    pub verbose_logging: bool,
}

/// The owned application context coordinating all modules.
///
/// Construction is two-phase: every service is built first, then a single
/// dependency-ordered wiring pass connects them (store observer, task
/// handlers). There is no global instance and no "not yet initialized"
/// runtime state — whoever owns the context passes it by reference to
/// whatever needs it, and diagnostics are ordinary methods.
pub struct QuorumCore {
    database: Arc<Database>,
    search: Arc<SearchIndex>,
    queue: Arc<ActionQueue>,
    processor: Arc<QueueProcessor>,
    mailbox: Arc<TransportMailbox>,
}

impl QuorumCore {
    /// Build and wire all services.
    pub async fn initialize(config: CoreConfig) -> Result<Self> {
        tracing::info!("Initializing Quorum Core v{}", env!("CARGO_PKG_VERSION"));

        let database = Arc::new(Database::open(config.database_path.as_deref()).await?);
        let search = Arc::new(SearchIndex::new());
        let mailbox = Arc::new(TransportMailbox::new());
        let queue = Arc::new(ActionQueue::new(database.clone()));

        // Wiring pass: dependency order, no placeholder left behind
        database.set_observer(search.clone());
        let handlers = wire_default_handlers(database.clone(), mailbox.clone());
        let processor = Arc::new(QueueProcessor::new(queue.clone(), handlers));

        tracing::info!("Quorum Core initialized");

        Ok(Self {
            database,
            search,
            queue,
            processor,
            mailbox,
        })
    }

    /// Spawn the queue processor loop (stuck-task recovery runs first).
    pub fn start(&self) -> tokio::task::JoinHandle<()> {
        tokio::spawn(self.processor.clone().run())
    }

    /// The durable store.
    pub fn database(&self) -> &Arc<Database> {
        &self.database
    }

    /// The search indices.
    pub fn search(&self) -> &Arc<SearchIndex> {
        &self.search
    }

    /// The action queue engine.
    pub fn queue(&self) -> &Arc<ActionQueue> {
        &self.queue
    }

    /// The queue processor and online gate.
    pub fn processor(&self) -> &Arc<QueueProcessor> {
        &self.processor
    }

    /// The transport mailbox.
    pub fn mailbox(&self) -> &Arc<TransportMailbox> {
        &self.mailbox
    }

    /// Queue counts per status, for a debug CLI or admin endpoint.
    pub fn queue_stats(&self) -> Result<QueueStats> {
        self.queue.get_stats()
    }

    /// Offline-indicator data: gate state plus pending-task count.
    pub fn offline_status(&self) -> Result<OfflineStatus> {
        self.processor.status()
    }

    /// Scan stored ratchet sessions for bloat, read-only.
    pub fn analyze_encryption_states(&self) -> Result<EncryptionStateReport> {
        self.database.analyze_encryption_states()
    }
}

// ============================================================================
// VERSION INFO
// ============================================================================

/// Returns the version of Quorum Core
pub fn version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}

// ============================================================================
// TESTS
// ============================================================================
