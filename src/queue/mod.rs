//! # Action Queue Module
//!
//! Persistent, deduplicated, retryable background task queue.
//!
//! ## Task Lifecycle
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                        TASK LIFECYCLE                                   │
//! ├─────────────────────────────────────────────────────────────────────────┤
//! │                                                                         │
//! │   enqueue(payload, key)                                                │
//! │        │                                                                │
//! │        ├─ same key processing? ──► Skipped (no row written)            │
//! │        ├─ same key pending?    ──► Coalesced (old row replaced)        │
//! │        └─ otherwise            ──► Queued                               │
//! │                 │                                                       │
//! │                 ▼                                                       │
//! │   ┌─────────┐  claim   ┌────────────┐  handler ok   ┌───────────┐      │
//! │   │ pending │─────────►│ processing │──────────────►│ completed │      │
//! │   └─────────┘          └────────────┘               └───────────┘      │
//! │        ▲                 │        │                    (pruned by       │
//! │        │ retryable error │        │ permanent error     age later)      │
//! │        │ + backoff       │        │ or retries spent                    │
//! │        └─────────────────┘        ▼                                     │
//! │        ▲                      ┌────────┐                                │
//! │        │ crash recovery       │ failed │  (kept for inspection)         │
//! │        └──────────────────────┴────────┘                                │
//! │          resetStuckProcessingTasks: only stamps older than the          │
//! │          timeout; retry_count += 1                                      │
//! │                                                                         │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Every user-initiated mutation becomes durable here before any network
//! attempt, and idempotent under retry via the dedup key.

mod handlers;
mod processor;

pub use handlers::{wire_default_handlers, HandlerRegistry, TaskHandler};
pub use processor::{OfflineStatus, QueueProcessor};

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::Notify;

use crate::error::{Error, Result};
use crate::messaging::Message;
use crate::spaces::Space;
use crate::storage::Database;

// ============================================================================
// TASK MODEL
// ============================================================================

/// The kinds of deferred mutation the queue carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TaskType {
    /// Send a channel or direct message
    #[serde(rename = "send-message")]
    SendMessage,
    /// Persist and upload the user config
    #[serde(rename = "save-config")]
    SaveConfig,
    /// Push updated space settings
    #[serde(rename = "update-space")]
    UpdateSpace,
    /// Send a space invite
    #[serde(rename = "send-invite")]
    SendInvite,
    /// Kick a member from a space
    #[serde(rename = "kick-user")]
    KickUser,
    /// Mute a member
    #[serde(rename = "mute-user")]
    MuteUser,
    /// Unmute a member
    #[serde(rename = "unmute-user")]
    UnmuteUser,
    /// Add or remove a reaction
    #[serde(rename = "reaction")]
    Reaction,
    /// Pin a message
    #[serde(rename = "pin-message")]
    PinMessage,
    /// Unpin a message
    #[serde(rename = "unpin-message")]
    UnpinMessage,
    /// Delete a message
    #[serde(rename = "delete-message")]
    DeleteMessage,
}

impl TaskType {
    /// Database string representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::SendMessage => "send-message",
            Self::SaveConfig => "save-config",
            Self::UpdateSpace => "update-space",
            Self::SendInvite => "send-invite",
            Self::KickUser => "kick-user",
            Self::MuteUser => "mute-user",
            Self::UnmuteUser => "unmute-user",
            Self::Reaction => "reaction",
            Self::PinMessage => "pin-message",
            Self::UnpinMessage => "unpin-message",
            Self::DeleteMessage => "delete-message",
        }
    }

    /// Parse from the database string representation.
    pub fn from_str_opt(s: &str) -> Option<Self> {
        match s {
            "send-message" => Some(Self::SendMessage),
            "save-config" => Some(Self::SaveConfig),
            "update-space" => Some(Self::UpdateSpace),
            "send-invite" => Some(Self::SendInvite),
            "kick-user" => Some(Self::KickUser),
            "mute-user" => Some(Self::MuteUser),
            "unmute-user" => Some(Self::UnmuteUser),
            "reaction" => Some(Self::Reaction),
            "pin-message" => Some(Self::PinMessage),
            "unpin-message" => Some(Self::UnpinMessage),
            "delete-message" => Some(Self::DeleteMessage),
            _ => None,
        }
    }
}

/// Task status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    /// Waiting to be claimed
    Pending,
    /// Claimed by the processor, attempt in flight
    Processing,
    /// Handler succeeded; retained until pruned by age
    Completed,
    /// Handler failed permanently or retries were exhausted
    Failed,
}

impl TaskStatus {
    /// Database string representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Processing => "processing",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }

    /// Parse from the database string representation.
    pub fn from_str_opt(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(Self::Pending),
            "processing" => Some(Self::Processing),
            "completed" => Some(Self::Completed),
            "failed" => Some(Self::Failed),
            _ => None,
        }
    }
}

/// The payload union: one variant per [`TaskType`], so handler dispatch is
/// exhaustive and compiler-checked.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum TaskPayload {
    /// Deliver a composed message
    SendMessage {
        /// Target space
        space_id: String,
        /// Target channel
        channel_id: String,
        /// The fully composed message to persist and send
        message: Box<Message>,
    },
    /// Upload the config stored for an address
    SaveConfig {
        /// Whose config to push
        address: String,
    },
    /// Push updated space settings
    UpdateSpace {
        /// The updated space aggregate
        space: Box<Space>,
    },
    /// Deliver a space invite
    SendInvite {
        /// Space being shared
        space_id: String,
        /// Invitee address
        invitee_address: String,
        /// Invite URL to deliver
        invite_url: String,
    },
    /// Remove a member from a space
    KickUser {
        /// Space to kick from
        space_id: String,
        /// Member being removed
        target_user_id: String,
    },
    /// Mute a member in a space
    MuteUser {
        /// Space the mute applies to
        space_id: String,
        /// Channel the moderation message goes to
        channel_id: String,
        /// Member being muted
        target_user_id: String,
        /// Unique id of this mute action, for replay dedup
        mute_id: String,
        /// Expiry (ms); None = permanent
        expires_at: Option<i64>,
        /// Moderator address
        muted_by: String,
    },
    /// Lift a mute
    UnmuteUser {
        /// Space the mute applies to
        space_id: String,
        /// Channel the moderation message goes to
        channel_id: String,
        /// Member being unmuted
        target_user_id: String,
        /// Unique id of this unmute action
        mute_id: String,
    },
    /// Add or remove a reaction
    Reaction {
        /// Target space
        space_id: String,
        /// Target channel
        channel_id: String,
        /// Message being reacted to
        target_message_id: String,
        /// Emoji id
        emoji: String,
        /// False to remove a previous reaction
        add: bool,
        /// Reacting member
        sender_id: String,
    },
    /// Pin a message
    PinMessage {
        /// Target space
        space_id: String,
        /// Target channel
        channel_id: String,
        /// Message being pinned
        target_message_id: String,
        /// Member pinning it
        pinned_by: String,
    },
    /// Unpin a message
    UnpinMessage {
        /// Target space
        space_id: String,
        /// Target channel
        channel_id: String,
        /// Message being unpinned
        target_message_id: String,
    },
    /// Delete a message
    DeleteMessage {
        /// Target space
        space_id: String,
        /// Target channel
        channel_id: String,
        /// Message being deleted
        target_message_id: String,
    },
}

impl TaskPayload {
    /// The task type this payload belongs to.
    pub fn task_type(&self) -> TaskType {
        match self {
            Self::SendMessage { .. } => TaskType::SendMessage,
            Self::SaveConfig { .. } => TaskType::SaveConfig,
            Self::UpdateSpace { .. } => TaskType::UpdateSpace,
            Self::SendInvite { .. } => TaskType::SendInvite,
            Self::KickUser { .. } => TaskType::KickUser,
            Self::MuteUser { .. } => TaskType::MuteUser,
            Self::UnmuteUser { .. } => TaskType::UnmuteUser,
            Self::Reaction { .. } => TaskType::Reaction,
            Self::PinMessage { .. } => TaskType::PinMessage,
            Self::UnpinMessage { .. } => TaskType::UnpinMessage,
            Self::DeleteMessage { .. } => TaskType::DeleteMessage,
        }
    }
}

/// A persisted queue task.
#[derive(Debug, Clone, PartialEq)]
pub struct QueueTask {
    /// Autoincrement id
    pub id: i64,
    /// Kind of deferred work
    pub task_type: TaskType,
    /// Typed payload
    pub payload: TaskPayload,
    /// Application-chosen dedup key
    pub key: String,
    /// Lifecycle status
    pub status: TaskStatus,
    /// Attempts so far
    pub retry_count: u32,
    /// Retry budget
    pub max_retries: u32,
    /// Earliest time (ms) the next attempt may run
    pub next_retry_at: i64,
    /// When the task was enqueued (ms)
    pub created_at: i64,
    /// When the current attempt was claimed (ms)
    pub processing_started_at: Option<i64>,
    /// When the task finished, completed or failed (ms)
    pub processed_at: Option<i64>,
    /// Last failure text
    pub error: Option<String>,
}

/// Fields of a task being inserted; the store assigns the id.
#[derive(Debug, Clone)]
pub struct NewQueueTask {
    /// Kind of deferred work
    pub task_type: TaskType,
    /// Typed payload
    pub payload: TaskPayload,
    /// Application-chosen dedup key
    pub key: String,
    /// Retry budget
    pub max_retries: u32,
    /// Earliest time (ms) the first attempt may run
    pub next_retry_at: i64,
    /// Enqueue time (ms)
    pub created_at: i64,
}

/// Counts per status. Gates no logic; consumed by UI-adjacent observers.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct QueueStats {
    /// Tasks waiting
    pub pending: usize,
    /// Attempts in flight
    pub processing: usize,
    /// Finished successfully, awaiting prune
    pub completed: usize,
    /// Failed permanently, kept for inspection
    pub failed: usize,
    /// All of the above
    pub total: usize,
}

/// Outcome of an enqueue call. `Skipped` is a normal no-op, not an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnqueueOutcome {
    /// A new task row was inserted
    Queued(i64),
    /// An existing pending task with the same key was replaced
    Coalesced(i64),
    /// An attempt with this key is already in flight; nothing was written
    Skipped,
}

impl EnqueueOutcome {
    /// The inserted task id, if a row was written.
    pub fn task_id(&self) -> Option<i64> {
        match self {
            Self::Queued(id) | Self::Coalesced(id) => Some(*id),
            Self::Skipped => None,
        }
    }
}

// ============================================================================
// ENGINE
// ============================================================================

/// Engine tuning knobs.
#[derive(Debug, Clone)]
pub struct ActionQueueConfig {
    /// Retry budget per task
    pub max_retries: u32,
    /// First retry delay (ms); doubles per attempt
    pub base_retry_delay_ms: i64,
    /// Backoff ceiling (ms)
    pub max_retry_delay_ms: i64,
    /// Tasks claimed per drain pass
    pub batch_size: usize,
    /// Hard cap on stored tasks
    pub max_queue_size: usize,
    /// Completed/failed tasks older than this are pruned (ms)
    pub max_task_age_ms: i64,
    /// A processing stamp older than this marks a crash-abandoned task (ms)
    pub stuck_timeout_ms: i64,
}

impl Default for ActionQueueConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_retry_delay_ms: 2_000,
            max_retry_delay_ms: 5 * 60 * 1000,
            batch_size: 10,
            max_queue_size: 1_000,
            max_task_age_ms: 7 * 24 * 60 * 60 * 1000,
            stuck_timeout_ms: 60_000,
        }
    }
}

/// The persistent action queue engine.
///
/// Makes every user-initiated mutation durable before it is attempted over
/// the network, and idempotent under retry. The engine owns deduplication
/// and bookkeeping; draining is the
/// [`QueueProcessor`]'s job.
pub struct ActionQueue {
    database: Arc<Database>,
    config: ActionQueueConfig,
    updates: Arc<Notify>,
}

impl ActionQueue {
    /// Create an engine over the store with default tuning.
    pub fn new(database: Arc<Database>) -> Self {
        Self::with_config(database, ActionQueueConfig::default())
    }

    /// Create an engine with explicit tuning.
    pub fn with_config(database: Arc<Database>, config: ActionQueueConfig) -> Self {
        Self {
            database,
            config,
            updates: Arc::new(Notify::new()),
        }
    }

    /// The engine's tuning knobs.
    pub fn config(&self) -> &ActionQueueConfig {
        &self.config
    }

    /// Notified after every enqueue; the processor waits on this.
    pub fn updates(&self) -> Arc<Notify> {
        self.updates.clone()
    }

    /// Enqueue a deferred mutation.
    ///
    /// The core deduplication contract:
    /// - an existing `processing` task with the same key means an attempt
    ///   is already in flight — the enqueue is skipped entirely;
    /// - existing `pending` tasks with the same key are coalesced: replaced
    ///   by this newer payload, never duplicated.
    ///
    /// Violating either causes duplicate sends on retry storms.
    pub fn enqueue(&self, payload: TaskPayload, key: &str) -> Result<EnqueueOutcome> {
        let stats = self.database.get_queue_stats()?;
        if stats.total >= self.config.max_queue_size {
            self.prune_old_tasks()?;

            let stats = self.database.get_queue_stats()?;
            if stats.pending >= self.config.max_queue_size / 2 {
                return Err(Error::QueueFull);
            }
        }

        if self.database.has_processing_task_with_key(key)? {
            tracing::debug!("Enqueue skipped, attempt in flight for key {}", key);
            return Ok(EnqueueOutcome::Skipped);
        }

        let existing = self.database.get_pending_tasks_by_key(key)?;
        let coalesced = !existing.is_empty();
        for task in &existing {
            self.database.delete_queue_task(task.id)?;
        }

        let now = crate::time::now_timestamp_millis();
        let id = self.database.add_queue_task(&NewQueueTask {
            task_type: payload.task_type(),
            payload,
            key: key.to_string(),
            max_retries: self.config.max_retries,
            next_retry_at: now,
            created_at: now,
        })?;

        self.updates.notify_one();

        if coalesced {
            tracing::debug!("Coalesced pending task(s) for key {} into {}", key, id);
            Ok(EnqueueOutcome::Coalesced(id))
        } else {
            Ok(EnqueueOutcome::Queued(id))
        }
    }

    /// Exponential backoff: `base * 2^retry_count`, capped.
    pub fn backoff_delay_ms(&self, retry_count: u32) -> i64 {
        let exp = retry_count.min(30);
        let delay = self.config.base_retry_delay_ms.saturating_mul(1_i64 << exp);
        delay.min(self.config.max_retry_delay_ms)
    }

    /// Repair crash-abandoned tasks; runs once at processor start.
    pub fn reset_stuck_tasks(&self) -> Result<usize> {
        self.database
            .reset_stuck_processing_tasks(self.config.stuck_timeout_ms)
    }

    /// Age out completed and failed tasks past the retention window.
    pub fn prune_old_tasks(&self) -> Result<usize> {
        let completed = self.database.prune_completed_tasks(self.config.max_task_age_ms)?;
        let failed = self.database.prune_failed_tasks(self.config.max_task_age_ms)?;
        if completed + failed > 0 {
            tracing::debug!("Pruned {} completed and {} failed task(s)", completed, failed);
        }
        Ok(completed + failed)
    }

    /// Counts per status.
    pub fn get_stats(&self) -> Result<QueueStats> {
        self.database.get_queue_stats()
    }

    /// The store this engine persists into.
    pub fn database(&self) -> &Arc<Database> {
        &self.database
    }
}

// ============================================================================
// TESTS
// ============================================================================
