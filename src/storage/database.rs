//! # Database
//!
//! SQLite-backed durable store: the single source of truth for messages,
//! conversations, spaces, encryption sessions, bookmarks, mutes, deletion
//! tombstones and queued actions.
//!
//! ## Database Operations
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                      DATABASE OPERATIONS                                │
//! ├─────────────────────────────────────────────────────────────────────────┤
//! │                                                                         │
//! │  ┌─────────────────┐                                                   │
//! │  │  Queue engine / │                                                   │
//! │  │  handlers / UI  │                                                   │
//! │  └────────┬────────┘                                                   │
//! │           │                                                             │
//! │           ▼                                                             │
//! │  ┌─────────────────┐   High-level API                                  │
//! │  │    Database     │   - Message storage + cursor pagination           │
//! │  │   (this file)   │   - Conversation upserts                          │
//! │  │                 │   - Tombstones, bookmarks, mutes                  │
//! │  │                 │   - Encryption-state history + latest projection  │
//! │  │                 │   - Action-queue persistence                      │
//! │  └────────┬────────┘                                                   │
//! │           │ commit notifications (best effort)                         │
//! │           ├────────────────────► StoreObserver (search index)          │
//! │           ▼                                                             │
//! │  ┌─────────────────┐                                                   │
//! │  │    rusqlite     │   - Single connection behind a lock               │
//! │  │                 │   - Explicit transactions where multi-row         │
//! │  └────────┬────────┘                                                   │
//! │           ▼                                                             │
//! │  ┌─────────────────┐                                                   │
//! │  │   SQLite DB     │   - In-memory for tests                           │
//! │  │                 │   - File for production                           │
//! │  └─────────────────┘                                                   │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use parking_lot::{Mutex, RwLock};
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use super::schema;
use crate::error::{Error, Result};
use crate::messaging::{
    Conversation, ConversationType, Message, MessagePage, PaginationDirection,
};
use crate::queue::{NewQueueTask, QueueStats, QueueTask, TaskPayload, TaskStatus, TaskType};
use crate::spaces::Space;

/// Maximum number of bookmarks per user
pub const MAX_BOOKMARKS: usize = 200;

/// Database configuration
#[derive(Debug, Clone, Default)]
pub struct DatabaseConfig {
    /// Path to the database file (None for in-memory)
    pub path: Option<String>,
}

/// Observer notified after store commits.
///
/// The search index registers here; notifications fire after the
/// transaction has committed and are best effort — an observer must log
/// its own failures, never surface them to the writer.
pub trait StoreObserver: Send + Sync {
    /// A message row was written.
    fn message_saved(&self, message: &Message);
    /// A message row was removed.
    fn message_deleted(&self, message_id: &str, space_id: &str, channel_id: &str);
}

// ============================================================================
// RECORD TYPES
// ============================================================================

/// Opaque ratchet session material for a (conversation, inbox) pair.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct EncryptionState {
    /// Conversation id
    pub conversation_id: String,
    /// Inbox id within the conversation
    pub inbox_id: String,
    /// Opaque serialized ratchet state (JSON from the secure-channel SDK)
    pub state: String,
    /// Establishment timestamp (ms)
    pub timestamp: i64,
    /// Whether our accept was sent
    pub sent_accept: bool,
}

/// Key material row for a space.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct SpaceKeyRecord {
    /// Owning space
    pub space_id: String,
    /// Key slot ("config", "inbox", "owner", or a channel id)
    pub key_id: String,
    /// Derived address, when the key has one
    #[serde(skip_serializing_if = "Option::is_none")]
    pub address: Option<String>,
    /// Public key (hex)
    pub public_key: String,
    /// Private key (hex)
    pub private_key: String,
}

/// Space membership row with cached display profile.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct SpaceMemberRecord {
    /// Owning space
    pub space_id: String,
    /// Member address
    pub user_address: String,
    /// Cached display name
    pub display_name: String,
    /// Cached avatar URL
    pub user_icon: String,
    /// Member's inbox address for direct delivery
    pub inbox_address: String,
}

/// Per-user configuration blob, synced through the user-settings endpoint.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct UserConfig {
    /// Owning address
    pub address: String,
    /// Joined space ids, in sidebar order
    pub space_ids: Vec<String>,
    /// Display name
    #[serde(skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,
    /// Avatar URL
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_icon: Option<String>,
    /// Bookmarks included when the config is synced to other devices
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bookmarks: Option<Vec<Bookmark>>,
}

/// Where a bookmarked message lives.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum BookmarkSource {
    /// A space channel
    Channel,
    /// A direct conversation
    Dm,
}

impl BookmarkSource {
    fn as_str(&self) -> &'static str {
        match self {
            Self::Channel => "channel",
            Self::Dm => "dm",
        }
    }

    fn from_str_opt(s: &str) -> Option<Self> {
        match s {
            "channel" => Some(Self::Channel),
            "dm" => Some(Self::Dm),
            _ => None,
        }
    }
}

/// Cached preview stored at bookmark creation time.
///
/// Avoids cross-context message resolution when rendering the bookmark
/// list; acceptable if slightly stale.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct BookmarkPreview {
    /// Sender address, for avatar/name lookup
    pub sender_address: String,
    /// Sender display name at bookmark time
    pub sender_name: String,
    /// First ~150 chars, markdown stripped (empty for media-only)
    pub text_snippet: String,
    /// Original message timestamp (ms)
    pub message_date: i64,
    /// "Space Name > #channel" or "Contact Name"
    pub source_name: String,
    /// "text", "image" or "sticker"
    pub content_type: String,
    /// Embed image URL
    #[serde(skip_serializing_if = "Option::is_none")]
    pub image_url: Option<String>,
    /// Embed thumbnail URL
    #[serde(skip_serializing_if = "Option::is_none")]
    pub thumbnail_url: Option<String>,
    /// Sticker id, resolved at render time
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sticker_id: Option<String>,
}

/// A saved message reference.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Bookmark {
    /// Bookmark id (UUID)
    pub bookmark_id: String,
    /// Referenced message id
    pub message_id: String,
    /// For channel messages
    #[serde(skip_serializing_if = "Option::is_none")]
    pub space_id: Option<String>,
    /// For channel messages
    #[serde(skip_serializing_if = "Option::is_none")]
    pub channel_id: Option<String>,
    /// For DM messages
    #[serde(skip_serializing_if = "Option::is_none")]
    pub conversation_id: Option<String>,
    /// Channel or DM
    pub source_type: BookmarkSource,
    /// Creation timestamp (ms), drives list ordering
    pub created_at: i64,
    /// Cached preview
    pub cached_preview: BookmarkPreview,
}

impl Bookmark {
    /// Build a bookmark for a message with a freshly minted id.
    pub fn for_message(message: &Message, cached_preview: BookmarkPreview) -> Self {
        let (space_id, channel_id, conversation_id, source_type) = if message.is_direct() {
            (None, None, Some(message.conversation_id()), BookmarkSource::Dm)
        } else {
            (
                Some(message.space_id.clone()),
                Some(message.channel_id.clone()),
                None,
                BookmarkSource::Channel,
            )
        };
        Self {
            bookmark_id: uuid::Uuid::new_v4().to_string(),
            message_id: message.message_id.clone(),
            space_id,
            channel_id,
            conversation_id,
            source_type,
            created_at: crate::time::now_timestamp_millis(),
            cached_preview,
        }
    }
}

/// A per-space mute entry.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct MutedUserRecord {
    /// Space the mute applies to
    pub space_id: String,
    /// Muted user
    pub target_user_id: String,
    /// Expiry (ms); None = permanent
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<i64>,
    /// Id of the mute action that produced this row, for replay dedup
    pub last_mute_id: String,
    /// When the mute was applied (ms)
    pub muted_at: i64,
    /// Moderator who applied the mute
    pub muted_by: String,
}

// ============================================================================
// DATABASE
// ============================================================================

const MESSAGE_COLUMNS: &str = "message_id, space_id, channel_id, created_date, modified_date, \
     sender_id, nonce, digest_algorithm, last_modified_hash, content, reactions, mentions, \
     reply_metadata, is_pinned, pinned_at, pinned_by";

fn collect_rows<T>(
    rows: impl Iterator<Item = rusqlite::Result<T>>,
    what: &str,
) -> Result<Vec<T>> {
    let mut out = Vec::new();
    for row in rows {
        out.push(row.map_err(|e| Error::DatabaseError(format!("Failed to read {}: {}", what, e)))?);
    }
    Ok(out)
}

/// The main database handle
///
/// Wraps a SQLite connection and provides high-level methods for storing
/// and retrieving Quorum data. All cross-component consistency (search
/// index, queue stats, tombstones) is achieved by observers watching
/// commits, not by locks held across components.
pub struct Database {
    /// The underlying SQLite connection
    conn: Arc<Mutex<Connection>>,
    /// Post-commit observer (search index); absent until wired
    observer: RwLock<Option<Arc<dyn StoreObserver>>>,
}

impl Database {
    /// Open or create a database
    ///
    /// If path is None, creates an in-memory database (useful for testing).
    pub async fn open(path: Option<&str>) -> Result<Self> {
        let conn = match path {
            Some(p) => Connection::open(p)
                .map_err(|e| Error::DatabaseError(format!("Failed to open database: {}", e)))?,
            None => Connection::open_in_memory().map_err(|e| {
                Error::DatabaseError(format!("Failed to create in-memory database: {}", e))
            })?,
        };

        let db = Self {
            conn: Arc::new(Mutex::new(conn)),
            observer: RwLock::new(None),
        };

        db.init_schema()?;

        Ok(db)
    }

    /// Register the post-commit observer.
    ///
    /// Wired once during context construction, after the search index
    /// exists. Before that, commits simply go unobserved.
    pub fn set_observer(&self, observer: Arc<dyn StoreObserver>) {
        *self.observer.write() = Some(observer);
    }

    /// Initialize the database schema
    fn init_schema(&self) -> Result<()> {
        let conn = self.conn.lock();

        let version: Option<i32> = conn
            .query_row("SELECT version FROM schema_version LIMIT 1", [], |row| {
                row.get(0)
            })
            .ok();

        match version {
            None => {
                // Fresh database, create all tables
                conn.execute_batch(schema::CREATE_TABLES)
                    .map_err(|e| Error::DatabaseError(format!("Failed to create tables: {}", e)))?;
                conn.execute_batch(schema::MIGRATE_V1_TO_V2).map_err(|e| {
                    Error::DatabaseError(format!("Failed to create v2 tables: {}", e))
                })?;

                conn.execute(
                    "INSERT OR REPLACE INTO schema_version (version) VALUES (?)",
                    params![schema::SCHEMA_VERSION],
                )
                .map_err(|e| {
                    Error::DatabaseError(format!("Failed to set schema version: {}", e))
                })?;

                tracing::info!("Database schema created (version {})", schema::SCHEMA_VERSION);
            }
            Some(v) if v < schema::SCHEMA_VERSION => {
                tracing::info!(
                    "Database schema version {} is older than current {}, running migrations",
                    v,
                    schema::SCHEMA_VERSION
                );

                if v < 2 {
                    tracing::info!("Running migration v1 → v2 (bookmarks, mutes, tombstones, action queue)");
                    conn.execute_batch(schema::MIGRATE_V1_TO_V2)
                        .map_err(|e| Error::DatabaseError(format!("Migration v1→v2 failed: {}", e)))?;
                }

                tracing::info!("All migrations complete (now at version {})", schema::SCHEMA_VERSION);
            }
            Some(v) => {
                tracing::debug!("Database schema version: {}", v);
            }
        }

        Ok(())
    }

    fn notify_saved(&self, message: &Message) {
        if let Some(observer) = self.observer.read().as_ref() {
            observer.message_saved(message);
        }
    }

    fn notify_deleted(&self, message_id: &str, space_id: &str, channel_id: &str) {
        if let Some(observer) = self.observer.read().as_ref() {
            observer.message_deleted(message_id, space_id, channel_id);
        }
    }

    // ========================================================================
    // MESSAGE OPERATIONS
    // ========================================================================

    /// Save a message and upsert its conversation row in one transaction.
    ///
    /// The conversation upsert is read-modify-write: unrelated fields of an
    /// existing row (most importantly `last_read_timestamp`) survive. Only
    /// when the message is the current user's own does the read marker
    /// advance, so a self-sent message never shows as unread.
    ///
    /// Completion triggers an asynchronous search-index update through the
    /// registered observer; indexing is best effort and never fails a save.
    #[allow(clippy::too_many_arguments)]
    pub fn save_message(
        &self,
        message: &Message,
        last_message_timestamp: i64,
        address: &str,
        conversation_type: ConversationType,
        icon: &str,
        display_name: &str,
        current_user_address: Option<&str>,
    ) -> Result<()> {
        {
            let mut conn = self.conn.lock();
            let tx = conn
                .transaction()
                .map_err(|e| Error::DatabaseError(format!("Failed to begin transaction: {}", e)))?;

            Self::insert_message_row(&tx, message)?;

            let conversation_id = message.conversation_id();
            let existing: Option<(Option<i64>,)> = tx
                .query_row(
                    "SELECT last_read_timestamp FROM conversations WHERE conversation_id = ?",
                    params![conversation_id],
                    |row| Ok((row.get(0)?,)),
                )
                .optional()
                .map_err(|e| Error::DatabaseError(format!("Failed to read conversation: {}", e)))?;

            let mut last_read = existing.and_then(|(ts,)| ts);
            let is_own_message = current_user_address
                .map(|addr| message.content.sender_id() == addr)
                .unwrap_or(false);
            if is_own_message {
                let advanced = last_message_timestamp.max(message.created_date);
                last_read = Some(last_read.map_or(advanced, |prev| prev.max(advanced)));
            }

            tx.execute(
                "INSERT INTO conversations
                     (conversation_id, type, timestamp, address, icon, display_name,
                      last_read_timestamp, last_message_id)
                 VALUES (?, ?, ?, ?, ?, ?, ?, ?)
                 ON CONFLICT(conversation_id) DO UPDATE SET
                     type = excluded.type,
                     timestamp = excluded.timestamp,
                     address = excluded.address,
                     icon = excluded.icon,
                     display_name = excluded.display_name,
                     last_read_timestamp = excluded.last_read_timestamp,
                     last_message_id = excluded.last_message_id",
                params![
                    conversation_id,
                    conversation_type.as_str(),
                    message.created_date,
                    address,
                    icon,
                    display_name,
                    last_read,
                    message.message_id,
                ],
            )
            .map_err(|e| Error::DatabaseError(format!("Failed to upsert conversation: {}", e)))?;

            tx.commit()
                .map_err(|e| Error::DatabaseError(format!("Failed to commit save: {}", e)))?;
        }

        self.notify_saved(message);
        Ok(())
    }

    /// Insert a message row only if neither the row nor a tombstone for it
    /// exists. Used by backup import and sync restore paths.
    pub fn insert_message_if_absent(&self, message: &Message) -> Result<bool> {
        let inserted = {
            let mut conn = self.conn.lock();
            let tx = conn
                .transaction()
                .map_err(|e| Error::DatabaseError(format!("Failed to begin transaction: {}", e)))?;

            let tombstoned: bool = tx
                .query_row(
                    "SELECT 1 FROM deleted_messages WHERE message_id = ?",
                    params![message.message_id],
                    |_| Ok(true),
                )
                .optional()
                .map_err(|e| Error::DatabaseError(format!("Failed to check tombstone: {}", e)))?
                .unwrap_or(false);

            let exists: bool = tx
                .query_row(
                    "SELECT 1 FROM messages WHERE message_id = ?",
                    params![message.message_id],
                    |_| Ok(true),
                )
                .optional()
                .map_err(|e| Error::DatabaseError(format!("Failed to check message: {}", e)))?
                .unwrap_or(false);

            let inserted = if tombstoned || exists {
                false
            } else {
                Self::insert_message_row(&tx, message)?;
                true
            };

            tx.commit()
                .map_err(|e| Error::DatabaseError(format!("Failed to commit insert: {}", e)))?;
            inserted
        };

        if inserted {
            self.notify_saved(message);
        }
        Ok(inserted)
    }

    fn insert_message_row(tx: &rusqlite::Transaction<'_>, message: &Message) -> Result<()> {
        let content = serde_json::to_string(&message.content)?;
        let reactions = serde_json::to_string(&message.reactions)?;
        let mentions = serde_json::to_string(&message.mentions)?;
        let reply_metadata = message
            .reply_metadata
            .as_ref()
            .map(serde_json::to_string)
            .transpose()?;

        tx.execute(
            "INSERT OR REPLACE INTO messages
                 (message_id, space_id, channel_id, created_date, modified_date, sender_id,
                  nonce, digest_algorithm, last_modified_hash, content, reactions, mentions,
                  reply_metadata, is_pinned, pinned_at, pinned_by)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
            params![
                message.message_id,
                message.space_id,
                message.channel_id,
                message.created_date,
                message.modified_date,
                message.content.sender_id(),
                message.nonce,
                message.digest_algorithm,
                message.last_modified_hash,
                content,
                reactions,
                mentions,
                reply_metadata,
                message.is_pinned.unwrap_or(false) as i32,
                message.pinned_at,
                message.pinned_by,
            ],
        )
        .map_err(|e| Error::DatabaseError(format!("Failed to save message: {}", e)))?;
        Ok(())
    }

    fn row_to_message(row: &rusqlite::Row<'_>) -> rusqlite::Result<Message> {
        fn parse<T: serde::de::DeserializeOwned>(
            idx: usize,
            raw: String,
        ) -> rusqlite::Result<T> {
            serde_json::from_str(&raw).map_err(|e| {
                rusqlite::Error::FromSqlConversionFailure(
                    idx,
                    rusqlite::types::Type::Text,
                    Box::new(e),
                )
            })
        }

        let content = parse(9, row.get::<_, String>(9)?)?;
        let reactions = parse(10, row.get::<_, String>(10)?)?;
        let mentions = parse(11, row.get::<_, String>(11)?)?;
        let reply_metadata = match row.get::<_, Option<String>>(12)? {
            Some(raw) => Some(parse(12, raw)?),
            None => None,
        };
        let is_pinned = row.get::<_, i32>(13)? != 0;

        Ok(Message {
            message_id: row.get(0)?,
            space_id: row.get(1)?,
            channel_id: row.get(2)?,
            created_date: row.get(3)?,
            modified_date: row.get(4)?,
            nonce: row.get(6)?,
            digest_algorithm: row.get(7)?,
            last_modified_hash: row.get(8)?,
            content,
            reactions,
            mentions,
            reply_metadata,
            is_pinned: is_pinned.then_some(true),
            pinned_at: row.get(14)?,
            pinned_by: row.get(15)?,
        })
    }

    /// Get a message by id, validated against its space and channel.
    pub fn get_message(
        &self,
        space_id: &str,
        channel_id: &str,
        message_id: &str,
    ) -> Result<Option<Message>> {
        let message = self.get_message_by_id(message_id)?;
        Ok(message.filter(|m| m.space_id == space_id && m.channel_id == channel_id))
    }

    /// Get a message by id alone.
    pub fn get_message_by_id(&self, message_id: &str) -> Result<Option<Message>> {
        let conn = self.conn.lock();
        conn.query_row(
            &format!("SELECT {} FROM messages WHERE message_id = ?", MESSAGE_COLUMNS),
            params![message_id],
            Self::row_to_message,
        )
        .optional()
        .map_err(|e| Error::DatabaseError(format!("Failed to get message: {}", e)))
    }

    /// Cursor pagination over the `(space_id, channel_id, created_date)`
    /// index.
    ///
    /// With no cursor the latest `limit` messages are collected in
    /// descending order; backward pagination likewise collects descending
    /// with timestamps strictly below the cursor. Both are reversed before
    /// return so the caller always receives chronological order. Forward
    /// pagination collects ascending, strictly above the cursor, with no
    /// reverse.
    ///
    /// `next_cursor` continues the requested direction and is only set when
    /// the page came back full; `prev_cursor` is the boundary of the
    /// returned page. Infinite-scroll continuity depends on exactly this
    /// assignment.
    pub fn get_messages(
        &self,
        space_id: &str,
        channel_id: &str,
        cursor: Option<i64>,
        direction: PaginationDirection,
        limit: usize,
    ) -> Result<MessagePage> {
        let conn = self.conn.lock();

        let forward = cursor.is_some() && direction == PaginationDirection::Forward;
        let (sql, bind_cursor) = match (cursor, direction) {
            (Some(_), PaginationDirection::Forward) => (
                format!(
                    "SELECT {} FROM messages
                     WHERE space_id = ? AND channel_id = ? AND created_date > ?
                     ORDER BY created_date ASC LIMIT ?",
                    MESSAGE_COLUMNS
                ),
                true,
            ),
            (Some(_), PaginationDirection::Backward) => (
                format!(
                    "SELECT {} FROM messages
                     WHERE space_id = ? AND channel_id = ? AND created_date < ?
                     ORDER BY created_date DESC LIMIT ?",
                    MESSAGE_COLUMNS
                ),
                true,
            ),
            (None, _) => (
                format!(
                    "SELECT {} FROM messages
                     WHERE space_id = ? AND channel_id = ?
                     ORDER BY created_date DESC LIMIT ?",
                    MESSAGE_COLUMNS
                ),
                false,
            ),
        };

        let mut stmt = conn
            .prepare(&sql)
            .map_err(|e| Error::DatabaseError(format!("Failed to prepare query: {}", e)))?;

        let mut messages = if bind_cursor {
            let rows = stmt
                .query_map(
                    params![space_id, channel_id, cursor.unwrap(), limit as i64],
                    Self::row_to_message,
                )
                .map_err(|e| Error::DatabaseError(format!("Failed to query messages: {}", e)))?;
            collect_rows(rows, "message")?
        } else {
            let rows = stmt
                .query_map(params![space_id, channel_id, limit as i64], Self::row_to_message)
                .map_err(|e| Error::DatabaseError(format!("Failed to query messages: {}", e)))?;
            collect_rows(rows, "message")?
        };

        // Cursors are computed in collection order: the last element is the
        // continuation edge in the requested direction, the first is the
        // boundary of the page.
        let next_cursor = if messages.len() == limit {
            messages.last().map(|m| m.created_date)
        } else {
            None
        };
        let prev_cursor = messages.first().map(|m| m.created_date);

        // Descending collections (initial load, backward) flip to
        // chronological order before returning.
        if !forward {
            messages.reverse();
        }

        Ok(MessagePage {
            messages,
            next_cursor,
            prev_cursor,
        })
    }

    /// All messages in a space across all of its channels, ascending by
    /// channel then time. Search-index build input.
    pub fn get_all_space_messages(&self, space_id: &str) -> Result<Vec<Message>> {
        let conn = self.conn.lock();
        let mut stmt = conn
            .prepare(&format!(
                "SELECT {} FROM messages WHERE space_id = ?
                 ORDER BY channel_id ASC, created_date ASC",
                MESSAGE_COLUMNS
            ))
            .map_err(|e| Error::DatabaseError(format!("Failed to prepare query: {}", e)))?;

        let rows = stmt
            .query_map(params![space_id], Self::row_to_message)
            .map_err(|e| Error::DatabaseError(format!("Failed to query messages: {}", e)))?;

        let mut messages = Vec::new();
        for row in rows {
            messages
                .push(row.map_err(|e| Error::DatabaseError(format!("Failed to read message: {}", e)))?);
        }
        Ok(messages)
    }

    /// Messages of one direct conversation in chronological order.
    pub fn get_direct_messages(&self, conversation_id: &str) -> Result<Vec<Message>> {
        let Some((space_id, channel_id)) = conversation_id.split_once('/') else {
            return Ok(Vec::new());
        };
        let page = self.get_messages(space_id, channel_id, None, PaginationDirection::Backward, 1000)?;
        Ok(page.messages)
    }

    /// All messages belonging to direct conversations. Backup export input.
    pub fn get_all_direct_messages(&self) -> Result<Vec<Message>> {
        let conn = self.conn.lock();
        let mut stmt = conn
            .prepare(&format!(
                "SELECT {} FROM messages WHERE space_id = channel_id
                 ORDER BY created_date ASC",
                MESSAGE_COLUMNS
            ))
            .map_err(|e| Error::DatabaseError(format!("Failed to prepare query: {}", e)))?;

        let rows = stmt
            .query_map([], Self::row_to_message)
            .map_err(|e| Error::DatabaseError(format!("Failed to query messages: {}", e)))?;

        let mut messages = Vec::new();
        for row in rows {
            messages
                .push(row.map_err(|e| Error::DatabaseError(format!("Failed to read message: {}", e)))?);
        }
        Ok(messages)
    }

    /// Delete a message.
    ///
    /// One transaction: remove the row, write a deletion tombstone (channel
    /// messages only — direct messages are exempt since no sync pass
    /// re-adds them), and cascade-remove any bookmark pointing at the
    /// message. Search-index removal happens after commit.
    pub fn delete_message(&self, message_id: &str) -> Result<()> {
        let Some(message) = self.get_message_by_id(message_id)? else {
            return Err(Error::MessageNotFound);
        };

        {
            let mut conn = self.conn.lock();
            let tx = conn
                .transaction()
                .map_err(|e| Error::DatabaseError(format!("Failed to begin transaction: {}", e)))?;

            tx.execute("DELETE FROM messages WHERE message_id = ?", params![message_id])
                .map_err(|e| Error::DatabaseError(format!("Failed to delete message: {}", e)))?;

            if !message.is_direct() {
                tx.execute(
                    "INSERT OR REPLACE INTO deleted_messages
                         (message_id, space_id, channel_id, deleted_at)
                     VALUES (?, ?, ?, ?)",
                    params![
                        message_id,
                        message.space_id,
                        message.channel_id,
                        crate::time::now_timestamp_millis(),
                    ],
                )
                .map_err(|e| Error::DatabaseError(format!("Failed to write tombstone: {}", e)))?;
            }

            tx.execute("DELETE FROM bookmarks WHERE message_id = ?", params![message_id])
                .map_err(|e| {
                    Error::DatabaseError(format!("Failed to cascade bookmark delete: {}", e))
                })?;

            tx.commit()
                .map_err(|e| Error::DatabaseError(format!("Failed to commit delete: {}", e)))?;
        }

        self.notify_deleted(message_id, &message.space_id, &message.channel_id);
        Ok(())
    }

    /// Tombstone existence check.
    ///
    /// Callers receiving a synced message MUST consult this before
    /// re-inserting, otherwise a deleted message can resurrect.
    pub fn is_message_deleted(&self, message_id: &str) -> Result<bool> {
        let conn = self.conn.lock();
        let found: Option<bool> = conn
            .query_row(
                "SELECT 1 FROM deleted_messages WHERE message_id = ?",
                params![message_id],
                |_| Ok(true),
            )
            .optional()
            .map_err(|e| Error::DatabaseError(format!("Failed to check tombstone: {}", e)))?;
        Ok(found.unwrap_or(false))
    }

    /// Age out tombstones older than the given age. Returns rows removed.
    pub fn prune_tombstones(&self, older_than_ms: i64) -> Result<usize> {
        let cutoff = crate::time::now_timestamp_millis() - older_than_ms;
        let conn = self.conn.lock();
        let removed = conn
            .execute(
                "DELETE FROM deleted_messages WHERE deleted_at < ?",
                params![cutoff],
            )
            .map_err(|e| Error::DatabaseError(format!("Failed to prune tombstones: {}", e)))?;
        Ok(removed)
    }

    /// Pin a message: `unpinned → pinned`, recording who and when.
    pub fn set_message_pinned(&self, message_id: &str, pinned_by: &str, pinned_at: i64) -> Result<bool> {
        let conn = self.conn.lock();
        let rows = conn
            .execute(
                "UPDATE messages SET is_pinned = 1, pinned_by = ?, pinned_at = ? WHERE message_id = ?",
                params![pinned_by, pinned_at, message_id],
            )
            .map_err(|e| Error::DatabaseError(format!("Failed to pin message: {}", e)))?;
        Ok(rows > 0)
    }

    /// Unpin a message: `pinned → unpinned`, clearing both pin fields.
    pub fn set_message_unpinned(&self, message_id: &str) -> Result<bool> {
        let conn = self.conn.lock();
        let rows = conn
            .execute(
                "UPDATE messages SET is_pinned = 0, pinned_by = NULL, pinned_at = NULL WHERE message_id = ?",
                params![message_id],
            )
            .map_err(|e| Error::DatabaseError(format!("Failed to unpin message: {}", e)))?;
        Ok(rows > 0)
    }

    /// Pinned messages of a channel, newest pin first.
    pub fn get_pinned_messages(&self, space_id: &str, channel_id: &str) -> Result<Vec<Message>> {
        let conn = self.conn.lock();
        let mut stmt = conn
            .prepare(&format!(
                "SELECT {} FROM messages
                 WHERE space_id = ? AND channel_id = ? AND is_pinned = 1
                 ORDER BY pinned_at DESC",
                MESSAGE_COLUMNS
            ))
            .map_err(|e| Error::DatabaseError(format!("Failed to prepare query: {}", e)))?;

        let rows = stmt
            .query_map(params![space_id, channel_id], Self::row_to_message)
            .map_err(|e| Error::DatabaseError(format!("Failed to query pinned messages: {}", e)))?;

        let mut messages = Vec::new();
        for row in rows {
            messages
                .push(row.map_err(|e| Error::DatabaseError(format!("Failed to read message: {}", e)))?);
        }
        Ok(messages)
    }

    /// Number of messages stored for a space. Answers the sync collaborator.
    pub fn count_messages(&self, space_id: &str) -> Result<usize> {
        let conn = self.conn.lock();
        let count: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM messages WHERE space_id = ?",
                params![space_id],
                |row| row.get(0),
            )
            .map_err(|e| Error::DatabaseError(format!("Failed to count messages: {}", e)))?;
        Ok(count as usize)
    }

    // ========================================================================
    // CONVERSATION OPERATIONS
    // ========================================================================

    fn row_to_conversation(row: &rusqlite::Row<'_>) -> rusqlite::Result<Conversation> {
        let type_str: String = row.get(1)?;
        let conversation_type = ConversationType::from_str_opt(&type_str).ok_or_else(|| {
            rusqlite::Error::FromSqlConversionFailure(
                1,
                rusqlite::types::Type::Text,
                format!("unknown conversation type: {}", type_str).into(),
            )
        })?;
        Ok(Conversation {
            conversation_id: row.get(0)?,
            conversation_type,
            timestamp: row.get(2)?,
            address: row.get(3)?,
            icon: row.get(4)?,
            display_name: row.get(5)?,
            last_read_timestamp: row.get(6)?,
            last_message_id: row.get(7)?,
        })
    }

    /// Get a conversation by id.
    pub fn get_conversation(&self, conversation_id: &str) -> Result<Option<Conversation>> {
        let conn = self.conn.lock();
        conn.query_row(
            "SELECT conversation_id, type, timestamp, address, icon, display_name,
                    last_read_timestamp, last_message_id
             FROM conversations WHERE conversation_id = ?",
            params![conversation_id],
            Self::row_to_conversation,
        )
        .optional()
        .map_err(|e| Error::DatabaseError(format!("Failed to get conversation: {}", e)))
    }

    /// Save a conversation row verbatim.
    pub fn save_conversation(&self, conversation: &Conversation) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT OR REPLACE INTO conversations
                 (conversation_id, type, timestamp, address, icon, display_name,
                  last_read_timestamp, last_message_id)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
            params![
                conversation.conversation_id,
                conversation.conversation_type.as_str(),
                conversation.timestamp,
                conversation.address,
                conversation.icon,
                conversation.display_name,
                conversation.last_read_timestamp,
                conversation.last_message_id,
            ],
        )
        .map_err(|e| Error::DatabaseError(format!("Failed to save conversation: {}", e)))?;
        Ok(())
    }

    /// List conversations of a type, most recent first, over the
    /// `by_type_time` index. `cursor` is a strict upper bound on
    /// `timestamp`; `next_cursor` is returned when the page came back full.
    pub fn get_conversations(
        &self,
        conversation_type: ConversationType,
        cursor: Option<i64>,
        limit: usize,
    ) -> Result<(Vec<Conversation>, Option<i64>)> {
        let conn = self.conn.lock();

        let sql = if cursor.is_some() {
            "SELECT conversation_id, type, timestamp, address, icon, display_name,
                    last_read_timestamp, last_message_id
             FROM conversations WHERE type = ? AND timestamp < ?
             ORDER BY timestamp DESC LIMIT ?"
        } else {
            "SELECT conversation_id, type, timestamp, address, icon, display_name,
                    last_read_timestamp, last_message_id
             FROM conversations WHERE type = ?
             ORDER BY timestamp DESC LIMIT ?"
        };

        let mut stmt = conn
            .prepare(sql)
            .map_err(|e| Error::DatabaseError(format!("Failed to prepare query: {}", e)))?;

        let conversations = if let Some(c) = cursor {
            let rows = stmt
                .query_map(
                    params![conversation_type.as_str(), c, limit as i64],
                    Self::row_to_conversation,
                )
                .map_err(|e| Error::DatabaseError(format!("Failed to query conversations: {}", e)))?;
            collect_rows(rows, "conversation")?
        } else {
            let rows = stmt
                .query_map(
                    params![conversation_type.as_str(), limit as i64],
                    Self::row_to_conversation,
                )
                .map_err(|e| Error::DatabaseError(format!("Failed to query conversations: {}", e)))?;
            collect_rows(rows, "conversation")?
        };

        let next_cursor = if conversations.len() == limit {
            conversations.last().map(|c| c.timestamp)
        } else {
            None
        };

        Ok((conversations, next_cursor))
    }

    /// Advance the read marker of an existing conversation, preserving the
    /// rest of the row. Missing conversations are a no-op.
    pub fn save_read_time(&self, conversation_id: &str, last_message_timestamp: i64) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "UPDATE conversations SET last_read_timestamp = ? WHERE conversation_id = ?",
            params![last_message_timestamp, conversation_id],
        )
        .map_err(|e| Error::DatabaseError(format!("Failed to save read time: {}", e)))?;
        Ok(())
    }

    /// Record the participants of a conversation.
    pub fn save_conversation_users(&self, conversation_id: &str, addresses: &[String]) -> Result<()> {
        let mut conn = self.conn.lock();
        let tx = conn
            .transaction()
            .map_err(|e| Error::DatabaseError(format!("Failed to begin transaction: {}", e)))?;
        for address in addresses {
            tx.execute(
                "INSERT OR REPLACE INTO conversation_users (address, conversation_id) VALUES (?, ?)",
                params![address, conversation_id],
            )
            .map_err(|e| Error::DatabaseError(format!("Failed to save conversation user: {}", e)))?;
        }
        tx.commit()
            .map_err(|e| Error::DatabaseError(format!("Failed to commit users: {}", e)))?;
        Ok(())
    }

    /// Participants of a conversation.
    pub fn get_conversation_users(&self, conversation_id: &str) -> Result<Vec<String>> {
        let conn = self.conn.lock();
        let mut stmt = conn
            .prepare("SELECT address FROM conversation_users WHERE conversation_id = ?")
            .map_err(|e| Error::DatabaseError(format!("Failed to prepare query: {}", e)))?;
        let rows = stmt
            .query_map(params![conversation_id], |row| row.get::<_, String>(0))
            .map_err(|e| Error::DatabaseError(format!("Failed to query users: {}", e)))?;
        let mut addresses = Vec::new();
        for row in rows {
            addresses
                .push(row.map_err(|e| Error::DatabaseError(format!("Failed to read user: {}", e)))?);
        }
        Ok(addresses)
    }

    // ========================================================================
    // SPACE OPERATIONS
    // ========================================================================

    /// All spaces, most recently modified first.
    pub fn get_spaces(&self) -> Result<Vec<Space>> {
        let conn = self.conn.lock();
        let mut stmt = conn
            .prepare("SELECT data FROM spaces ORDER BY modified_date DESC")
            .map_err(|e| Error::DatabaseError(format!("Failed to prepare query: {}", e)))?;
        let rows = stmt
            .query_map([], |row| row.get::<_, String>(0))
            .map_err(|e| Error::DatabaseError(format!("Failed to query spaces: {}", e)))?;

        let mut spaces = Vec::new();
        for row in rows {
            let data =
                row.map_err(|e| Error::DatabaseError(format!("Failed to read space: {}", e)))?;
            spaces.push(
                serde_json::from_str(&data)
                    .map_err(|e| Error::StorageCorrupted(format!("Invalid space data: {}", e)))?,
            );
        }
        Ok(spaces)
    }

    /// Get a space by id.
    pub fn get_space(&self, space_id: &str) -> Result<Option<Space>> {
        let conn = self.conn.lock();
        let data: Option<String> = conn
            .query_row("SELECT data FROM spaces WHERE space_id = ?", params![space_id], |row| {
                row.get(0)
            })
            .optional()
            .map_err(|e| Error::DatabaseError(format!("Failed to get space: {}", e)))?;
        match data {
            Some(raw) => Ok(Some(serde_json::from_str(&raw).map_err(|e| {
                Error::StorageCorrupted(format!("Invalid space data: {}", e))
            })?)),
            None => Ok(None),
        }
    }

    /// Save a space after checking its structural invariants
    /// (`default_channel_id` must resolve to an existing channel).
    pub fn save_space(&self, space: &Space) -> Result<()> {
        space.validate()?;
        let data = serde_json::to_string(space)?;
        let conn = self.conn.lock();
        conn.execute(
            "INSERT OR REPLACE INTO spaces (space_id, space_name, modified_date, data)
             VALUES (?, ?, ?, ?)",
            params![space.space_id, space.space_name, space.modified_date, data],
        )
        .map_err(|e| Error::DatabaseError(format!("Failed to save space: {}", e)))?;
        Ok(())
    }

    /// Delete a space, returning the removed row if it existed.
    pub fn delete_space(&self, space_id: &str) -> Result<Option<Space>> {
        let space = self.get_space(space_id)?;
        if space.is_some() {
            let conn = self.conn.lock();
            conn.execute("DELETE FROM spaces WHERE space_id = ?", params![space_id])
                .map_err(|e| Error::DatabaseError(format!("Failed to delete space: {}", e)))?;
        }
        Ok(space)
    }

    /// Upsert a space member row.
    pub fn save_space_member(&self, member: &SpaceMemberRecord) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT OR REPLACE INTO space_members
                 (space_id, user_address, display_name, user_icon, inbox_address)
             VALUES (?, ?, ?, ?, ?)",
            params![
                member.space_id,
                member.user_address,
                member.display_name,
                member.user_icon,
                member.inbox_address,
            ],
        )
        .map_err(|e| Error::DatabaseError(format!("Failed to save space member: {}", e)))?;
        Ok(())
    }

    fn row_to_member(row: &rusqlite::Row<'_>) -> rusqlite::Result<SpaceMemberRecord> {
        Ok(SpaceMemberRecord {
            space_id: row.get(0)?,
            user_address: row.get(1)?,
            display_name: row.get(2)?,
            user_icon: row.get(3)?,
            inbox_address: row.get(4)?,
        })
    }

    /// Get one space member.
    pub fn get_space_member(&self, space_id: &str, user_address: &str) -> Result<Option<SpaceMemberRecord>> {
        let conn = self.conn.lock();
        conn.query_row(
            "SELECT space_id, user_address, display_name, user_icon, inbox_address
             FROM space_members WHERE space_id = ? AND user_address = ?",
            params![space_id, user_address],
            Self::row_to_member,
        )
        .optional()
        .map_err(|e| Error::DatabaseError(format!("Failed to get space member: {}", e)))
    }

    /// All members of a space.
    pub fn get_space_members(&self, space_id: &str) -> Result<Vec<SpaceMemberRecord>> {
        let conn = self.conn.lock();
        let mut stmt = conn
            .prepare(
                "SELECT space_id, user_address, display_name, user_icon, inbox_address
                 FROM space_members WHERE space_id = ? ORDER BY display_name",
            )
            .map_err(|e| Error::DatabaseError(format!("Failed to prepare query: {}", e)))?;
        let rows = stmt
            .query_map(params![space_id], Self::row_to_member)
            .map_err(|e| Error::DatabaseError(format!("Failed to query members: {}", e)))?;
        let mut members = Vec::new();
        for row in rows {
            members
                .push(row.map_err(|e| Error::DatabaseError(format!("Failed to read member: {}", e)))?);
        }
        Ok(members)
    }

    /// Remove a space member.
    pub fn delete_space_member(&self, space_id: &str, user_address: &str) -> Result<bool> {
        let conn = self.conn.lock();
        let rows = conn
            .execute(
                "DELETE FROM space_members WHERE space_id = ? AND user_address = ?",
                params![space_id, user_address],
            )
            .map_err(|e| Error::DatabaseError(format!("Failed to delete space member: {}", e)))?;
        Ok(rows > 0)
    }

    /// Number of members in a space. Answers the sync collaborator.
    pub fn count_space_members(&self, space_id: &str) -> Result<usize> {
        let conn = self.conn.lock();
        let count: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM space_members WHERE space_id = ?",
                params![space_id],
                |row| row.get(0),
            )
            .map_err(|e| Error::DatabaseError(format!("Failed to count members: {}", e)))?;
        Ok(count as usize)
    }

    /// Save space key material.
    pub fn save_space_key(&self, key: &SpaceKeyRecord) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT OR REPLACE INTO space_keys (space_id, key_id, address, public_key, private_key)
             VALUES (?, ?, ?, ?, ?)",
            params![key.space_id, key.key_id, key.address, key.public_key, key.private_key],
        )
        .map_err(|e| Error::DatabaseError(format!("Failed to save space key: {}", e)))?;
        Ok(())
    }

    fn row_to_space_key(row: &rusqlite::Row<'_>) -> rusqlite::Result<SpaceKeyRecord> {
        Ok(SpaceKeyRecord {
            space_id: row.get(0)?,
            key_id: row.get(1)?,
            address: row.get(2)?,
            public_key: row.get(3)?,
            private_key: row.get(4)?,
        })
    }

    /// Get one space key.
    pub fn get_space_key(&self, space_id: &str, key_id: &str) -> Result<Option<SpaceKeyRecord>> {
        let conn = self.conn.lock();
        conn.query_row(
            "SELECT space_id, key_id, address, public_key, private_key
             FROM space_keys WHERE space_id = ? AND key_id = ?",
            params![space_id, key_id],
            Self::row_to_space_key,
        )
        .optional()
        .map_err(|e| Error::DatabaseError(format!("Failed to get space key: {}", e)))
    }

    /// All keys of a space.
    pub fn get_space_keys(&self, space_id: &str) -> Result<Vec<SpaceKeyRecord>> {
        let conn = self.conn.lock();
        let mut stmt = conn
            .prepare(
                "SELECT space_id, key_id, address, public_key, private_key
                 FROM space_keys WHERE space_id = ?",
            )
            .map_err(|e| Error::DatabaseError(format!("Failed to prepare query: {}", e)))?;
        let rows = stmt
            .query_map(params![space_id], Self::row_to_space_key)
            .map_err(|e| Error::DatabaseError(format!("Failed to query space keys: {}", e)))?;
        let mut keys = Vec::new();
        for row in rows {
            keys.push(row.map_err(|e| Error::DatabaseError(format!("Failed to read key: {}", e)))?);
        }
        Ok(keys)
    }

    /// Remove one space key.
    pub fn delete_space_key(&self, space_id: &str, key_id: &str) -> Result<bool> {
        let conn = self.conn.lock();
        let rows = conn
            .execute(
                "DELETE FROM space_keys WHERE space_id = ? AND key_id = ?",
                params![space_id, key_id],
            )
            .map_err(|e| Error::DatabaseError(format!("Failed to delete space key: {}", e)))?;
        Ok(rows > 0)
    }

    /// Get a user's config blob.
    pub fn get_user_config(&self, address: &str) -> Result<Option<UserConfig>> {
        let conn = self.conn.lock();
        let raw: Option<String> = conn
            .query_row(
                "SELECT config FROM user_config WHERE address = ?",
                params![address],
                |row| row.get(0),
            )
            .optional()
            .map_err(|e| Error::DatabaseError(format!("Failed to get user config: {}", e)))?;
        match raw {
            Some(raw) => Ok(Some(serde_json::from_str(&raw).map_err(|e| {
                Error::StorageCorrupted(format!("Invalid user config: {}", e))
            })?)),
            None => Ok(None),
        }
    }

    /// Save a user's config blob.
    pub fn save_user_config(&self, config: &UserConfig) -> Result<()> {
        let raw = serde_json::to_string(config)?;
        let conn = self.conn.lock();
        conn.execute(
            "INSERT OR REPLACE INTO user_config (address, config, updated_at) VALUES (?, ?, ?)",
            params![config.address, raw, crate::time::now_timestamp_millis()],
        )
        .map_err(|e| Error::DatabaseError(format!("Failed to save user config: {}", e)))?;
        Ok(())
    }

    // ========================================================================
    // ENCRYPTION STATE OPERATIONS
    // ========================================================================

    /// Save an encryption state into the history table and, only on the
    /// first-attempt path, into the latest-state projection.
    ///
    /// `was_first_attempt` is supplied by the caller (the session
    /// establishment code knows whether this was the first successful
    /// attempt); it is recorded as given and not re-derived here. A caller
    /// passing it incorrectly will leave the projection stale — the flag is
    /// a contract, not a hint.
    pub fn save_encryption_state(&self, state: &EncryptionState, was_first_attempt: bool) -> Result<()> {
        let mut conn = self.conn.lock();
        let tx = conn
            .transaction()
            .map_err(|e| Error::DatabaseError(format!("Failed to begin transaction: {}", e)))?;

        tx.execute(
            "INSERT OR REPLACE INTO encryption_states
                 (conversation_id, inbox_id, state, timestamp, sent_accept)
             VALUES (?, ?, ?, ?, ?)",
            params![
                state.conversation_id,
                state.inbox_id,
                state.state,
                state.timestamp,
                state.sent_accept as i32,
            ],
        )
        .map_err(|e| Error::DatabaseError(format!("Failed to save encryption state: {}", e)))?;

        if was_first_attempt {
            tx.execute(
                "INSERT OR REPLACE INTO latest_states
                     (conversation_id, inbox_id, state, timestamp, sent_accept)
                 VALUES (?, ?, ?, ?, ?)",
                params![
                    state.conversation_id,
                    state.inbox_id,
                    state.state,
                    state.timestamp,
                    state.sent_accept as i32,
                ],
            )
            .map_err(|e| Error::DatabaseError(format!("Failed to save latest state: {}", e)))?;
        }

        tx.commit()
            .map_err(|e| Error::DatabaseError(format!("Failed to commit state: {}", e)))?;
        Ok(())
    }

    fn row_to_state(row: &rusqlite::Row<'_>) -> rusqlite::Result<EncryptionState> {
        Ok(EncryptionState {
            conversation_id: row.get(0)?,
            inbox_id: row.get(1)?,
            state: row.get(2)?,
            timestamp: row.get(3)?,
            sent_accept: row.get::<_, i32>(4)? != 0,
        })
    }

    /// History states for a conversation.
    pub fn get_encryption_states(&self, conversation_id: &str) -> Result<Vec<EncryptionState>> {
        let conn = self.conn.lock();
        let mut stmt = conn
            .prepare(
                "SELECT conversation_id, inbox_id, state, timestamp, sent_accept
                 FROM encryption_states WHERE conversation_id = ?",
            )
            .map_err(|e| Error::DatabaseError(format!("Failed to prepare query: {}", e)))?;
        let rows = stmt
            .query_map(params![conversation_id], Self::row_to_state)
            .map_err(|e| Error::DatabaseError(format!("Failed to query states: {}", e)))?;
        let mut states = Vec::new();
        for row in rows {
            states.push(row.map_err(|e| Error::DatabaseError(format!("Failed to read state: {}", e)))?);
        }
        Ok(states)
    }

    /// Every history state in the store. Diagnostic and backup input.
    pub fn get_all_encryption_states(&self) -> Result<Vec<EncryptionState>> {
        let conn = self.conn.lock();
        let mut stmt = conn
            .prepare(
                "SELECT conversation_id, inbox_id, state, timestamp, sent_accept
                 FROM encryption_states",
            )
            .map_err(|e| Error::DatabaseError(format!("Failed to prepare query: {}", e)))?;
        let rows = stmt
            .query_map([], Self::row_to_state)
            .map_err(|e| Error::DatabaseError(format!("Failed to query states: {}", e)))?;
        let mut states = Vec::new();
        for row in rows {
            states.push(row.map_err(|e| Error::DatabaseError(format!("Failed to read state: {}", e)))?);
        }
        Ok(states)
    }

    /// The first-successful-establishment state for a conversation.
    pub fn get_latest_state(&self, conversation_id: &str) -> Result<Option<EncryptionState>> {
        let conn = self.conn.lock();
        conn.query_row(
            "SELECT conversation_id, inbox_id, state, timestamp, sent_accept
             FROM latest_states WHERE conversation_id = ?",
            params![conversation_id],
            Self::row_to_state,
        )
        .optional()
        .map_err(|e| Error::DatabaseError(format!("Failed to get latest state: {}", e)))
    }

    /// Remove a single history state.
    pub fn delete_encryption_state(&self, state: &EncryptionState) -> Result<bool> {
        let conn = self.conn.lock();
        let rows = conn
            .execute(
                "DELETE FROM encryption_states WHERE conversation_id = ? AND inbox_id = ?",
                params![state.conversation_id, state.inbox_id],
            )
            .map_err(|e| Error::DatabaseError(format!("Failed to delete state: {}", e)))?;
        Ok(rows > 0)
    }

    /// Remove all states for a conversation, including the latest-state
    /// projection. Manual cleanup path for bloated sessions.
    pub fn delete_encryption_states(&self, conversation_id: &str) -> Result<usize> {
        let mut conn = self.conn.lock();
        let tx = conn
            .transaction()
            .map_err(|e| Error::DatabaseError(format!("Failed to begin transaction: {}", e)))?;
        let removed = tx
            .execute(
                "DELETE FROM encryption_states WHERE conversation_id = ?",
                params![conversation_id],
            )
            .map_err(|e| Error::DatabaseError(format!("Failed to delete states: {}", e)))?;
        tx.execute(
            "DELETE FROM latest_states WHERE conversation_id = ?",
            params![conversation_id],
        )
        .map_err(|e| Error::DatabaseError(format!("Failed to delete latest state: {}", e)))?;
        tx.commit()
            .map_err(|e| Error::DatabaseError(format!("Failed to commit delete: {}", e)))?;
        Ok(removed)
    }

    // ========================================================================
    // BOOKMARK OPERATIONS
    // ========================================================================

    /// Add a bookmark, atomically enforcing the ceiling.
    ///
    /// The count check and the insert run in one transaction: concurrent
    /// adds can never push the stored total past [`MAX_BOOKMARKS`]. At the
    /// ceiling this fails with [`Error::BookmarkLimitExceeded`] and writes
    /// nothing.
    pub fn add_bookmark(&self, bookmark: &Bookmark) -> Result<()> {
        let preview = serde_json::to_string(&bookmark.cached_preview)?;
        let mut conn = self.conn.lock();
        let tx = conn
            .transaction()
            .map_err(|e| Error::DatabaseError(format!("Failed to begin transaction: {}", e)))?;

        let count: i64 = tx
            .query_row("SELECT COUNT(*) FROM bookmarks", [], |row| row.get(0))
            .map_err(|e| Error::DatabaseError(format!("Failed to count bookmarks: {}", e)))?;
        if count as usize >= MAX_BOOKMARKS {
            return Err(Error::BookmarkLimitExceeded(MAX_BOOKMARKS));
        }

        tx.execute(
            "INSERT INTO bookmarks
                 (bookmark_id, message_id, space_id, channel_id, conversation_id,
                  source_type, created_at, cached_preview)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
            params![
                bookmark.bookmark_id,
                bookmark.message_id,
                bookmark.space_id,
                bookmark.channel_id,
                bookmark.conversation_id,
                bookmark.source_type.as_str(),
                bookmark.created_at,
                preview,
            ],
        )
        .map_err(|e| Error::DatabaseError(format!("Failed to add bookmark: {}", e)))?;

        tx.commit()
            .map_err(|e| Error::DatabaseError(format!("Failed to commit bookmark: {}", e)))?;
        Ok(())
    }

    fn row_to_bookmark(row: &rusqlite::Row<'_>) -> rusqlite::Result<Bookmark> {
        let source_str: String = row.get(5)?;
        let source_type = BookmarkSource::from_str_opt(&source_str).ok_or_else(|| {
            rusqlite::Error::FromSqlConversionFailure(
                5,
                rusqlite::types::Type::Text,
                format!("unknown bookmark source: {}", source_str).into(),
            )
        })?;
        let preview_raw: String = row.get(7)?;
        let cached_preview = serde_json::from_str(&preview_raw).map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(7, rusqlite::types::Type::Text, Box::new(e))
        })?;
        Ok(Bookmark {
            bookmark_id: row.get(0)?,
            message_id: row.get(1)?,
            space_id: row.get(2)?,
            channel_id: row.get(3)?,
            conversation_id: row.get(4)?,
            source_type,
            created_at: row.get(6)?,
            cached_preview,
        })
    }

    /// Remove a bookmark by id.
    pub fn remove_bookmark(&self, bookmark_id: &str) -> Result<bool> {
        let conn = self.conn.lock();
        let rows = conn
            .execute("DELETE FROM bookmarks WHERE bookmark_id = ?", params![bookmark_id])
            .map_err(|e| Error::DatabaseError(format!("Failed to remove bookmark: {}", e)))?;
        Ok(rows > 0)
    }

    /// All bookmarks, newest first.
    pub fn get_bookmarks(&self) -> Result<Vec<Bookmark>> {
        let conn = self.conn.lock();
        let mut stmt = conn
            .prepare(
                "SELECT bookmark_id, message_id, space_id, channel_id, conversation_id,
                        source_type, created_at, cached_preview
                 FROM bookmarks ORDER BY created_at DESC",
            )
            .map_err(|e| Error::DatabaseError(format!("Failed to prepare query: {}", e)))?;
        let rows = stmt
            .query_map([], Self::row_to_bookmark)
            .map_err(|e| Error::DatabaseError(format!("Failed to query bookmarks: {}", e)))?;
        let mut bookmarks = Vec::new();
        for row in rows {
            bookmarks
                .push(row.map_err(|e| Error::DatabaseError(format!("Failed to read bookmark: {}", e)))?);
        }
        Ok(bookmarks)
    }

    /// O(1) lookup through the `by_message` index.
    pub fn get_bookmark_for_message(&self, message_id: &str) -> Result<Option<Bookmark>> {
        let conn = self.conn.lock();
        conn.query_row(
            "SELECT bookmark_id, message_id, space_id, channel_id, conversation_id,
                    source_type, created_at, cached_preview
             FROM bookmarks WHERE message_id = ? LIMIT 1",
            params![message_id],
            Self::row_to_bookmark,
        )
        .optional()
        .map_err(|e| Error::DatabaseError(format!("Failed to get bookmark: {}", e)))
    }

    /// Whether any bookmark points at the message.
    pub fn is_message_bookmarked(&self, message_id: &str) -> Result<bool> {
        Ok(self.get_bookmark_for_message(message_id)?.is_some())
    }

    // ========================================================================
    // MUTED USER OPERATIONS
    // ========================================================================

    /// Apply a mute, deduplicating replays.
    ///
    /// The same mute action can arrive twice (live + sync). When the stored
    /// `last_mute_id` already equals the incoming one the write is skipped
    /// and `false` is returned.
    pub fn save_muted_user(&self, record: &MutedUserRecord) -> Result<bool> {
        let conn = self.conn.lock();

        let existing: Option<String> = conn
            .query_row(
                "SELECT last_mute_id FROM muted_users WHERE space_id = ? AND target_user_id = ?",
                params![record.space_id, record.target_user_id],
                |row| row.get(0),
            )
            .optional()
            .map_err(|e| Error::DatabaseError(format!("Failed to read mute: {}", e)))?;

        if existing.as_deref() == Some(record.last_mute_id.as_str()) {
            tracing::debug!(
                "Skipping replayed mute {} for {} in {}",
                record.last_mute_id,
                record.target_user_id,
                record.space_id
            );
            return Ok(false);
        }

        conn.execute(
            "INSERT OR REPLACE INTO muted_users
                 (space_id, target_user_id, expires_at, last_mute_id, muted_at, muted_by)
             VALUES (?, ?, ?, ?, ?, ?)",
            params![
                record.space_id,
                record.target_user_id,
                record.expires_at,
                record.last_mute_id,
                record.muted_at,
                record.muted_by,
            ],
        )
        .map_err(|e| Error::DatabaseError(format!("Failed to save mute: {}", e)))?;
        Ok(true)
    }

    /// Lift a mute.
    pub fn remove_muted_user(&self, space_id: &str, target_user_id: &str) -> Result<bool> {
        let conn = self.conn.lock();
        let rows = conn
            .execute(
                "DELETE FROM muted_users WHERE space_id = ? AND target_user_id = ?",
                params![space_id, target_user_id],
            )
            .map_err(|e| Error::DatabaseError(format!("Failed to remove mute: {}", e)))?;
        Ok(rows > 0)
    }

    /// Mutes in a space.
    pub fn get_muted_users(&self, space_id: &str) -> Result<Vec<MutedUserRecord>> {
        let conn = self.conn.lock();
        let mut stmt = conn
            .prepare(
                "SELECT space_id, target_user_id, expires_at, last_mute_id, muted_at, muted_by
                 FROM muted_users WHERE space_id = ?",
            )
            .map_err(|e| Error::DatabaseError(format!("Failed to prepare query: {}", e)))?;
        let rows = stmt
            .query_map(params![space_id], |row| {
                Ok(MutedUserRecord {
                    space_id: row.get(0)?,
                    target_user_id: row.get(1)?,
                    expires_at: row.get(2)?,
                    last_mute_id: row.get(3)?,
                    muted_at: row.get(4)?,
                    muted_by: row.get(5)?,
                })
            })
            .map_err(|e| Error::DatabaseError(format!("Failed to query mutes: {}", e)))?;
        let mut mutes = Vec::new();
        for row in rows {
            mutes.push(row.map_err(|e| Error::DatabaseError(format!("Failed to read mute: {}", e)))?);
        }
        Ok(mutes)
    }

    /// Whether a user is muted in a space at `now_ms`. Expired mutes read
    /// as unmuted.
    pub fn is_user_muted(&self, space_id: &str, target_user_id: &str, now_ms: i64) -> Result<bool> {
        let conn = self.conn.lock();
        let expires_at: Option<Option<i64>> = conn
            .query_row(
                "SELECT expires_at FROM muted_users WHERE space_id = ? AND target_user_id = ?",
                params![space_id, target_user_id],
                |row| row.get(0),
            )
            .optional()
            .map_err(|e| Error::DatabaseError(format!("Failed to check mute: {}", e)))?;
        Ok(match expires_at {
            None => false,
            Some(None) => true,
            Some(Some(expiry)) => expiry > now_ms,
        })
    }

    // ========================================================================
    // ACTION QUEUE PERSISTENCE
    // ========================================================================

    /// Insert a new queue task, returning its id.
    pub fn add_queue_task(&self, task: &NewQueueTask) -> Result<i64> {
        let payload = serde_json::to_string(&task.payload)?;
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO action_queue
                 (task_type, payload, key, status, retry_count, max_retries,
                  next_retry_at, created_at)
             VALUES (?, ?, ?, 'pending', 0, ?, ?, ?)",
            params![
                task.task_type.as_str(),
                payload,
                task.key,
                task.max_retries,
                task.next_retry_at,
                task.created_at,
            ],
        )
        .map_err(|e| Error::DatabaseError(format!("Failed to add queue task: {}", e)))?;
        Ok(conn.last_insert_rowid())
    }

    fn row_to_task(row: &rusqlite::Row<'_>) -> rusqlite::Result<QueueTask> {
        let type_str: String = row.get(1)?;
        let task_type = TaskType::from_str_opt(&type_str).ok_or_else(|| {
            rusqlite::Error::FromSqlConversionFailure(
                1,
                rusqlite::types::Type::Text,
                format!("unknown task type: {}", type_str).into(),
            )
        })?;
        let payload_raw: String = row.get(2)?;
        let payload: TaskPayload = serde_json::from_str(&payload_raw).map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(2, rusqlite::types::Type::Text, Box::new(e))
        })?;
        let status_str: String = row.get(4)?;
        let status = TaskStatus::from_str_opt(&status_str).ok_or_else(|| {
            rusqlite::Error::FromSqlConversionFailure(
                4,
                rusqlite::types::Type::Text,
                format!("unknown task status: {}", status_str).into(),
            )
        })?;
        Ok(QueueTask {
            id: row.get(0)?,
            task_type,
            payload,
            key: row.get(3)?,
            status,
            retry_count: row.get(5)?,
            max_retries: row.get(6)?,
            next_retry_at: row.get(7)?,
            created_at: row.get(8)?,
            processing_started_at: row.get(9)?,
            processed_at: row.get(10)?,
            error: row.get(11)?,
        })
    }

    const TASK_COLUMNS: &'static str = "id, task_type, payload, key, status, retry_count, \
         max_retries, next_retry_at, created_at, processing_started_at, processed_at, error";

    /// Get a queue task by id.
    pub fn get_queue_task(&self, id: i64) -> Result<Option<QueueTask>> {
        let conn = self.conn.lock();
        conn.query_row(
            &format!("SELECT {} FROM action_queue WHERE id = ?", Self::TASK_COLUMNS),
            params![id],
            Self::row_to_task,
        )
        .optional()
        .map_err(|e| Error::DatabaseError(format!("Failed to get queue task: {}", e)))
    }

    /// Pending tasks sharing a dedup key.
    pub fn get_pending_tasks_by_key(&self, key: &str) -> Result<Vec<QueueTask>> {
        let conn = self.conn.lock();
        let mut stmt = conn
            .prepare(&format!(
                "SELECT {} FROM action_queue WHERE key = ? AND status = 'pending'",
                Self::TASK_COLUMNS
            ))
            .map_err(|e| Error::DatabaseError(format!("Failed to prepare query: {}", e)))?;
        let rows = stmt
            .query_map(params![key], Self::row_to_task)
            .map_err(|e| Error::DatabaseError(format!("Failed to query tasks: {}", e)))?;
        let mut tasks = Vec::new();
        for row in rows {
            tasks.push(row.map_err(|e| Error::DatabaseError(format!("Failed to read task: {}", e)))?);
        }
        Ok(tasks)
    }

    /// Whether an attempt with this key is currently in flight.
    pub fn has_processing_task_with_key(&self, key: &str) -> Result<bool> {
        let conn = self.conn.lock();
        let found: Option<bool> = conn
            .query_row(
                "SELECT 1 FROM action_queue WHERE key = ? AND status = 'processing' LIMIT 1",
                params![key],
                |_| Ok(true),
            )
            .optional()
            .map_err(|e| Error::DatabaseError(format!("Failed to check processing: {}", e)))?;
        Ok(found.unwrap_or(false))
    }

    /// Persist a task's mutable fields (status, retries, stamps, error).
    pub fn update_queue_task(&self, task: &QueueTask) -> Result<()> {
        let payload = serde_json::to_string(&task.payload)?;
        let conn = self.conn.lock();
        let rows = conn
            .execute(
                "UPDATE action_queue SET
                     task_type = ?, payload = ?, key = ?, status = ?, retry_count = ?,
                     max_retries = ?, next_retry_at = ?, processing_started_at = ?,
                     processed_at = ?, error = ?
                 WHERE id = ?",
                params![
                    task.task_type.as_str(),
                    payload,
                    task.key,
                    task.status.as_str(),
                    task.retry_count,
                    task.max_retries,
                    task.next_retry_at,
                    task.processing_started_at,
                    task.processed_at,
                    task.error,
                    task.id,
                ],
            )
            .map_err(|e| Error::DatabaseError(format!("Failed to update queue task: {}", e)))?;
        if rows == 0 {
            return Err(Error::TaskNotFound(task.id));
        }
        Ok(())
    }

    /// Remove a task outright.
    pub fn delete_queue_task(&self, id: i64) -> Result<bool> {
        let conn = self.conn.lock();
        let rows = conn
            .execute("DELETE FROM action_queue WHERE id = ?", params![id])
            .map_err(|e| Error::DatabaseError(format!("Failed to delete queue task: {}", e)))?;
        Ok(rows > 0)
    }

    /// Tasks in a given status, oldest first.
    pub fn get_queue_tasks_by_status(&self, status: TaskStatus, limit: usize) -> Result<Vec<QueueTask>> {
        let conn = self.conn.lock();
        let mut stmt = conn
            .prepare(&format!(
                "SELECT {} FROM action_queue WHERE status = ? ORDER BY id ASC LIMIT ?",
                Self::TASK_COLUMNS
            ))
            .map_err(|e| Error::DatabaseError(format!("Failed to prepare query: {}", e)))?;
        let rows = stmt
            .query_map(params![status.as_str(), limit as i64], Self::row_to_task)
            .map_err(|e| Error::DatabaseError(format!("Failed to query tasks: {}", e)))?;
        let mut tasks = Vec::new();
        for row in rows {
            tasks.push(row.map_err(|e| Error::DatabaseError(format!("Failed to read task: {}", e)))?);
        }
        Ok(tasks)
    }

    /// Counts per status. Consumed by UI-adjacent observers; gates nothing.
    pub fn get_queue_stats(&self) -> Result<QueueStats> {
        let conn = self.conn.lock();
        let mut stmt = conn
            .prepare("SELECT status, COUNT(*) FROM action_queue GROUP BY status")
            .map_err(|e| Error::DatabaseError(format!("Failed to prepare query: {}", e)))?;
        let rows = stmt
            .query_map([], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?))
            })
            .map_err(|e| Error::DatabaseError(format!("Failed to query stats: {}", e)))?;

        let mut stats = QueueStats::default();
        for row in rows {
            let (status, count) =
                row.map_err(|e| Error::DatabaseError(format!("Failed to read stats: {}", e)))?;
            let count = count as usize;
            match status.as_str() {
                "pending" => stats.pending = count,
                "processing" => stats.processing = count,
                "completed" => stats.completed = count,
                "failed" => stats.failed = count,
                _ => {}
            }
        }
        stats.total = stats.pending + stats.processing + stats.completed + stats.failed;
        Ok(stats)
    }

    /// Garbage-collect completed tasks older than the given age. Never
    /// touches pending, processing or failed tasks.
    pub fn prune_completed_tasks(&self, older_than_ms: i64) -> Result<usize> {
        let cutoff = crate::time::now_timestamp_millis() - older_than_ms;
        let conn = self.conn.lock();
        let removed = conn
            .execute(
                "DELETE FROM action_queue
                 WHERE status = 'completed' AND processed_at IS NOT NULL AND processed_at < ?",
                params![cutoff],
            )
            .map_err(|e| Error::DatabaseError(format!("Failed to prune tasks: {}", e)))?;
        Ok(removed)
    }

    /// Garbage-collect failed tasks past the same age threshold. Separate
    /// from [`Self::prune_completed_tasks`] so failed tasks stay inspectable
    /// until explicitly aged out.
    pub fn prune_failed_tasks(&self, older_than_ms: i64) -> Result<usize> {
        let cutoff = crate::time::now_timestamp_millis() - older_than_ms;
        let conn = self.conn.lock();
        let removed = conn
            .execute(
                "DELETE FROM action_queue
                 WHERE status = 'failed' AND processed_at IS NOT NULL AND processed_at < ?",
                params![cutoff],
            )
            .map_err(|e| Error::DatabaseError(format!("Failed to prune failed tasks: {}", e)))?;
        Ok(removed)
    }

    /// Repair crash-abandoned tasks.
    ///
    /// Only `processing` tasks whose `processing_started_at` is older than
    /// the timeout are reset — genuinely in-flight tasks are protected from
    /// double processing. Each reset goes back to `pending` with
    /// `retry_count` incremented and the processing stamp cleared. Runs
    /// once at processor start.
    pub fn reset_stuck_processing_tasks(&self, stuck_timeout_ms: i64) -> Result<usize> {
        let cutoff = crate::time::now_timestamp_millis() - stuck_timeout_ms;
        let conn = self.conn.lock();
        let reset = conn
            .execute(
                "UPDATE action_queue SET
                     status = 'pending',
                     retry_count = retry_count + 1,
                     processing_started_at = NULL
                 WHERE status = 'processing'
                   AND processing_started_at IS NOT NULL
                   AND processing_started_at < ?",
                params![cutoff],
            )
            .map_err(|e| Error::DatabaseError(format!("Failed to reset stuck tasks: {}", e)))?;
        if reset > 0 {
            tracing::info!("Recovered {} stuck processing task(s)", reset);
        }
        Ok(reset)
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messaging::{Mentions, MessageContent};
    use crate::queue::TaskPayload;

    async fn open_db() -> Database {
        Database::open(None).await.unwrap()
    }

    fn make_message(space: &str, channel: &str, id: &str, ts: i64, text: &str) -> Message {
        Message {
            message_id: id.to_string(),
            space_id: space.to_string(),
            channel_id: channel.to_string(),
            created_date: ts,
            modified_date: ts,
            nonce: "00".into(),
            digest_algorithm: "sha-256".into(),
            last_modified_hash: String::new(),
            content: MessageContent::Post {
                sender_id: "addr-sender".into(),
                text: text.into(),
                replies_to_message_id: None,
            },
            reactions: vec![],
            mentions: Mentions::default(),
            reply_metadata: None,
            is_pinned: None,
            pinned_at: None,
            pinned_by: None,
        }
    }

    fn save(db: &Database, msg: &Message) {
        db.save_message(msg, msg.created_date, "addr-peer", ConversationType::Group, "", "Peer", None)
            .unwrap();
    }

    fn make_bookmark(id: &str, message_id: &str, created_at: i64) -> Bookmark {
        Bookmark {
            bookmark_id: id.to_string(),
            message_id: message_id.to_string(),
            space_id: Some("space-1".into()),
            channel_id: Some("chan-1".into()),
            conversation_id: None,
            source_type: BookmarkSource::Channel,
            created_at,
            cached_preview: BookmarkPreview {
                sender_address: "addr-sender".into(),
                sender_name: "Sender".into(),
                text_snippet: "snippet".into(),
                message_date: created_at,
                source_name: "Space > #chan".into(),
                content_type: "text".into(),
                image_url: None,
                thumbnail_url: None,
                sticker_id: None,
            },
        }
    }

    // ── Pagination ──────────────────────────────────────────────────────

    #[tokio::test]
    async fn test_initial_page_is_latest_in_chronological_order() {
        let db = open_db().await;
        for (i, ts) in [100, 200, 300, 400, 500].iter().enumerate() {
            save(&db, &make_message("s", "c", &format!("m{}", i), *ts, "hi"));
        }

        let page = db
            .get_messages("s", "c", None, PaginationDirection::Backward, 2)
            .unwrap();
        let times: Vec<i64> = page.messages.iter().map(|m| m.created_date).collect();
        assert_eq!(times, vec![400, 500]);
        assert_eq!(page.next_cursor, Some(400));
        assert_eq!(page.prev_cursor, Some(500));
    }

    #[tokio::test]
    async fn test_backward_page_from_cursor() {
        let db = open_db().await;
        for (i, ts) in [100, 200, 300, 400, 500].iter().enumerate() {
            save(&db, &make_message("s", "c", &format!("m{}", i), *ts, "hi"));
        }

        let page = db
            .get_messages("s", "c", Some(400), PaginationDirection::Backward, 2)
            .unwrap();
        let times: Vec<i64> = page.messages.iter().map(|m| m.created_date).collect();
        assert_eq!(times, vec![200, 300]);
        assert_eq!(page.next_cursor, Some(200));
        assert_eq!(page.prev_cursor, Some(300));
    }

    #[tokio::test]
    async fn test_forward_page_is_strictly_greater() {
        let db = open_db().await;
        for (i, ts) in [100, 200, 300, 400, 500].iter().enumerate() {
            save(&db, &make_message("s", "c", &format!("m{}", i), *ts, "hi"));
        }

        let page = db
            .get_messages("s", "c", Some(300), PaginationDirection::Forward, 2)
            .unwrap();
        let times: Vec<i64> = page.messages.iter().map(|m| m.created_date).collect();
        assert_eq!(times, vec![400, 500]);
        // Full page: continuation in the forward direction
        assert_eq!(page.next_cursor, Some(500));
        assert_eq!(page.prev_cursor, Some(400));
    }

    #[tokio::test]
    async fn test_forward_then_backward_reconstructs_boundary() {
        let db = open_db().await;
        for (i, ts) in [100, 200, 300, 400, 500].iter().enumerate() {
            save(&db, &make_message("s", "c", &format!("m{}", i), *ts, "hi"));
        }

        let forward = db
            .get_messages("s", "c", Some(100), PaginationDirection::Forward, 2)
            .unwrap();
        let edge = forward.next_cursor.unwrap();
        assert_eq!(edge, 300);

        let back = db
            .get_messages("s", "c", Some(edge), PaginationDirection::Backward, 2)
            .unwrap();
        let times: Vec<i64> = back.messages.iter().map(|m| m.created_date).collect();
        assert_eq!(times, vec![100, 200]);
    }

    #[tokio::test]
    async fn test_partial_page_has_no_next_cursor() {
        let db = open_db().await;
        save(&db, &make_message("s", "c", "m1", 100, "hi"));

        let page = db
            .get_messages("s", "c", None, PaginationDirection::Backward, 10)
            .unwrap();
        assert_eq!(page.messages.len(), 1);
        assert_eq!(page.next_cursor, None);
        assert_eq!(page.prev_cursor, Some(100));
    }

    // ── Save semantics ──────────────────────────────────────────────────

    #[tokio::test]
    async fn test_save_message_upserts_conversation() {
        let db = open_db().await;
        let msg = make_message("s", "c", "m1", 100, "hi");
        save(&db, &msg);

        let conv = db.get_conversation("s/c").unwrap().unwrap();
        assert_eq!(conv.timestamp, 100);
        assert_eq!(conv.last_message_id.as_deref(), Some("m1"));
        assert_eq!(conv.last_read_timestamp, None);
    }

    #[tokio::test]
    async fn test_save_preserves_read_marker_for_foreign_messages() {
        let db = open_db().await;
        save(&db, &make_message("s", "c", "m1", 100, "hi"));
        db.save_read_time("s/c", 100).unwrap();

        // A peer's message must not move our read marker
        save(&db, &make_message("s", "c", "m2", 200, "again"));
        let conv = db.get_conversation("s/c").unwrap().unwrap();
        assert_eq!(conv.last_read_timestamp, Some(100));
        assert_eq!(conv.timestamp, 200);
    }

    #[tokio::test]
    async fn test_own_message_advances_read_marker() {
        let db = open_db().await;
        let msg = make_message("s", "c", "m1", 300, "mine");
        db.save_message(
            &msg,
            300,
            "addr-peer",
            ConversationType::Group,
            "",
            "Peer",
            Some("addr-sender"),
        )
        .unwrap();

        let conv = db.get_conversation("s/c").unwrap().unwrap();
        assert_eq!(conv.last_read_timestamp, Some(300));
    }

    // ── Deletion & tombstones ───────────────────────────────────────────

    #[tokio::test]
    async fn test_delete_channel_message_writes_tombstone() {
        let db = open_db().await;
        save(&db, &make_message("space-1", "chan-1", "m1", 100, "hi"));

        db.delete_message("m1").unwrap();
        assert!(db.get_message_by_id("m1").unwrap().is_none());
        assert!(db.is_message_deleted("m1").unwrap());
    }

    #[tokio::test]
    async fn test_delete_direct_message_leaves_no_tombstone() {
        let db = open_db().await;
        let msg = make_message("addr-bob", "addr-bob", "dm1", 100, "hi");
        db.save_message(&msg, 100, "addr-bob", ConversationType::Direct, "", "Bob", None)
            .unwrap();

        db.delete_message("dm1").unwrap();
        assert!(db.get_message_by_id("dm1").unwrap().is_none());
        assert!(!db.is_message_deleted("dm1").unwrap());
    }

    #[tokio::test]
    async fn test_delete_cascades_bookmarks() {
        let db = open_db().await;
        save(&db, &make_message("space-1", "chan-1", "m1", 100, "hi"));
        db.add_bookmark(&make_bookmark("b1", "m1", 100)).unwrap();
        assert!(db.is_message_bookmarked("m1").unwrap());

        db.delete_message("m1").unwrap();
        assert!(!db.is_message_bookmarked("m1").unwrap());
    }

    #[tokio::test]
    async fn test_insert_message_if_absent_respects_tombstone() {
        let db = open_db().await;
        let msg = make_message("space-1", "chan-1", "m1", 100, "hi");
        save(&db, &msg);
        db.delete_message("m1").unwrap();

        // A later sync pass must not resurrect the message
        assert!(!db.insert_message_if_absent(&msg).unwrap());
        assert!(db.get_message_by_id("m1").unwrap().is_none());
    }

    #[tokio::test]
    async fn test_prune_tombstones() {
        let db = open_db().await;
        save(&db, &make_message("space-1", "chan-1", "m1", 100, "hi"));
        db.delete_message("m1").unwrap();

        assert_eq!(db.prune_tombstones(1000 * 60).unwrap(), 0);
        assert_eq!(db.prune_tombstones(-1000).unwrap(), 1);
        assert!(!db.is_message_deleted("m1").unwrap());
    }

    // ── Pinning ─────────────────────────────────────────────────────────

    #[tokio::test]
    async fn test_pin_state_machine() {
        let db = open_db().await;
        save(&db, &make_message("s", "c", "m1", 100, "hi"));

        assert!(db.set_message_pinned("m1", "addr-mod", 111).unwrap());
        let pinned = db.get_pinned_messages("s", "c").unwrap();
        assert_eq!(pinned.len(), 1);
        assert_eq!(pinned[0].pinned_by.as_deref(), Some("addr-mod"));
        assert_eq!(pinned[0].pinned_at, Some(111));

        assert!(db.set_message_unpinned("m1").unwrap());
        assert!(db.get_pinned_messages("s", "c").unwrap().is_empty());
        let msg = db.get_message_by_id("m1").unwrap().unwrap();
        assert_eq!(msg.pinned_at, None);
        assert_eq!(msg.pinned_by, None);
    }

    // ── Bookmarks ───────────────────────────────────────────────────────

    #[tokio::test]
    async fn test_bookmark_ceiling_is_atomic() {
        let db = open_db().await;
        for i in 0..MAX_BOOKMARKS {
            db.add_bookmark(&make_bookmark(&format!("b{}", i), &format!("m{}", i), i as i64))
                .unwrap();
        }

        let err = db
            .add_bookmark(&make_bookmark("b-over", "m-over", 9999))
            .unwrap_err();
        assert!(matches!(err, Error::BookmarkLimitExceeded(n) if n == MAX_BOOKMARKS));
        assert_eq!(db.get_bookmarks().unwrap().len(), MAX_BOOKMARKS);
    }

    #[tokio::test]
    async fn test_bookmark_for_message_routes_by_source() {
        let db = open_db().await;
        let channel_msg = make_message("space-1", "chan-1", "m1", 100, "hi");
        let preview = make_bookmark("x", "x", 0).cached_preview;
        let bookmark = Bookmark::for_message(&channel_msg, preview.clone());
        assert_eq!(bookmark.source_type, BookmarkSource::Channel);
        assert_eq!(bookmark.space_id.as_deref(), Some("space-1"));
        assert!(bookmark.conversation_id.is_none());
        db.add_bookmark(&bookmark).unwrap();

        let dm_msg = make_message("addr-bob", "addr-bob", "m2", 100, "hi");
        let dm_bookmark = Bookmark::for_message(&dm_msg, preview);
        assert_eq!(dm_bookmark.source_type, BookmarkSource::Dm);
        assert_eq!(dm_bookmark.conversation_id.as_deref(), Some("addr-bob/addr-bob"));
        assert!(dm_bookmark.space_id.is_none());
    }

    #[tokio::test]
    async fn test_file_backed_database_persists() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("quorum.db");
        let path_str = path.to_str().unwrap().to_string();

        {
            let db = Database::open(Some(&path_str)).await.unwrap();
            save(&db, &make_message("s", "c", "m1", 100, "hi"));
        }

        // Reopen: schema detection is a no-op, the data survives
        let db = Database::open(Some(&path_str)).await.unwrap();
        assert!(db.get_message_by_id("m1").unwrap().is_some());
    }

    #[tokio::test]
    async fn test_bookmark_lookup_by_message() {
        let db = open_db().await;
        db.add_bookmark(&make_bookmark("b1", "m1", 100)).unwrap();

        let found = db.get_bookmark_for_message("m1").unwrap().unwrap();
        assert_eq!(found.bookmark_id, "b1");
        assert!(db.get_bookmark_for_message("m2").unwrap().is_none());
    }

    #[tokio::test]
    async fn test_bookmarks_ordered_newest_first() {
        let db = open_db().await;
        db.add_bookmark(&make_bookmark("b1", "m1", 100)).unwrap();
        db.add_bookmark(&make_bookmark("b2", "m2", 300)).unwrap();
        db.add_bookmark(&make_bookmark("b3", "m3", 200)).unwrap();

        let ids: Vec<String> = db
            .get_bookmarks()
            .unwrap()
            .into_iter()
            .map(|b| b.bookmark_id)
            .collect();
        assert_eq!(ids, vec!["b2", "b3", "b1"]);
    }

    // ── Muted users ─────────────────────────────────────────────────────

    fn make_mute(mute_id: &str, expires_at: Option<i64>) -> MutedUserRecord {
        MutedUserRecord {
            space_id: "space-1".into(),
            target_user_id: "addr-target".into(),
            expires_at,
            last_mute_id: mute_id.to_string(),
            muted_at: 100,
            muted_by: "addr-mod".into(),
        }
    }

    #[tokio::test]
    async fn test_mute_replay_is_deduplicated() {
        let db = open_db().await;
        assert!(db.save_muted_user(&make_mute("mute-1", None)).unwrap());
        // Same action arriving again via sync
        assert!(!db.save_muted_user(&make_mute("mute-1", None)).unwrap());
        // A genuinely new action applies
        assert!(db.save_muted_user(&make_mute("mute-2", None)).unwrap());
    }

    #[tokio::test]
    async fn test_mute_expiry() {
        let db = open_db().await;
        db.save_muted_user(&make_mute("mute-1", Some(1000))).unwrap();
        assert!(db.is_user_muted("space-1", "addr-target", 500).unwrap());
        assert!(!db.is_user_muted("space-1", "addr-target", 1500).unwrap());

        db.save_muted_user(&make_mute("mute-2", None)).unwrap();
        assert!(db.is_user_muted("space-1", "addr-target", i64::MAX - 1).unwrap());
    }

    // ── Encryption states ───────────────────────────────────────────────

    fn make_state(inbox: &str, blob: &str) -> EncryptionState {
        EncryptionState {
            conversation_id: "conv-1".into(),
            inbox_id: inbox.to_string(),
            state: blob.to_string(),
            timestamp: 100,
            sent_accept: false,
        }
    }

    #[tokio::test]
    async fn test_latest_state_projection_keeps_first_attempt() {
        let db = open_db().await;
        db.save_encryption_state(&make_state("inbox-1", "{\"v\":1}"), true)
            .unwrap();
        db.save_encryption_state(&make_state("inbox-2", "{\"v\":2}"), false)
            .unwrap();

        // History holds both; the projection reflects only the first write
        assert_eq!(db.get_encryption_states("conv-1").unwrap().len(), 2);
        let latest = db.get_latest_state("conv-1").unwrap().unwrap();
        assert_eq!(latest.state, "{\"v\":1}");
        assert_eq!(latest.inbox_id, "inbox-1");
    }

    #[tokio::test]
    async fn test_delete_encryption_states_clears_projection() {
        let db = open_db().await;
        db.save_encryption_state(&make_state("inbox-1", "{}"), true).unwrap();

        assert_eq!(db.delete_encryption_states("conv-1").unwrap(), 1);
        assert!(db.get_encryption_states("conv-1").unwrap().is_empty());
        assert!(db.get_latest_state("conv-1").unwrap().is_none());
    }

    // ── Conversations ───────────────────────────────────────────────────

    #[tokio::test]
    async fn test_conversation_listing_desc_with_cursor() {
        let db = open_db().await;
        for (i, ts) in [100, 300, 200].iter().enumerate() {
            db.save_conversation(&Conversation {
                conversation_id: format!("conv-{}", i),
                conversation_type: ConversationType::Direct,
                timestamp: *ts,
                address: format!("addr-{}", i),
                icon: String::new(),
                display_name: String::new(),
                last_read_timestamp: None,
                last_message_id: None,
            })
            .unwrap();
        }

        let (page, next) = db.get_conversations(ConversationType::Direct, None, 2).unwrap();
        let times: Vec<i64> = page.iter().map(|c| c.timestamp).collect();
        assert_eq!(times, vec![300, 200]);
        assert_eq!(next, Some(200));

        let (rest, next) = db
            .get_conversations(ConversationType::Direct, next, 2)
            .unwrap();
        assert_eq!(rest.len(), 1);
        assert_eq!(rest[0].timestamp, 100);
        assert_eq!(next, None);
    }

    // ── Spaces ──────────────────────────────────────────────────────────

    #[tokio::test]
    async fn test_save_space_validates_default_channel() {
        use crate::spaces::{Channel, Group};

        let db = open_db().await;
        let mut space = Space {
            space_id: "space-1".into(),
            space_name: "Test".into(),
            description: None,
            vanity_url: "t".into(),
            invite_url: String::new(),
            icon_url: String::new(),
            banner_url: String::new(),
            default_channel_id: "missing".into(),
            hub_address: String::new(),
            created_date: 0,
            modified_date: 0,
            is_repudiable: false,
            is_public: false,
            groups: vec![Group {
                group_name: "g".into(),
                channels: vec![Channel {
                    channel_id: "chan-1".into(),
                    space_id: "space-1".into(),
                    channel_name: "general".into(),
                    channel_topic: String::new(),
                    created_date: 0,
                    modified_date: 0,
                    is_read_only: None,
                    is_pinned: None,
                    pinned_at: None,
                }],
                icon: None,
            }],
            roles: vec![],
            emojis: vec![],
            stickers: vec![],
        };

        assert!(db.save_space(&space).is_err());
        space.default_channel_id = "chan-1".into();
        db.save_space(&space).unwrap();
        assert_eq!(db.get_space("space-1").unwrap().unwrap().space_name, "Test");
    }

    #[tokio::test]
    async fn test_space_members_roundtrip_and_count() {
        let db = open_db().await;
        for i in 0..3 {
            db.save_space_member(&SpaceMemberRecord {
                space_id: "space-1".into(),
                user_address: format!("addr-{}", i),
                display_name: format!("User {}", i),
                user_icon: String::new(),
                inbox_address: format!("inbox-{}", i),
            })
            .unwrap();
        }

        assert_eq!(db.count_space_members("space-1").unwrap(), 3);
        assert!(db.delete_space_member("space-1", "addr-1").unwrap());
        assert_eq!(db.count_space_members("space-1").unwrap(), 2);
        let member = db.get_space_member("space-1", "addr-0").unwrap().unwrap();
        assert_eq!(member.inbox_address, "inbox-0");
    }

    // ── Queue primitives ────────────────────────────────────────────────

    fn new_task(key: &str) -> NewQueueTask {
        NewQueueTask {
            task_type: TaskType::SaveConfig,
            payload: TaskPayload::SaveConfig {
                address: "addr-me".into(),
            },
            key: key.to_string(),
            max_retries: 3,
            next_retry_at: 0,
            created_at: crate::time::now_timestamp_millis(),
        }
    }

    #[tokio::test]
    async fn test_queue_task_roundtrip() {
        let db = open_db().await;
        let id = db.add_queue_task(&new_task("config:addr-me")).unwrap();

        let task = db.get_queue_task(id).unwrap().unwrap();
        assert_eq!(task.status, TaskStatus::Pending);
        assert_eq!(task.key, "config:addr-me");
        assert_eq!(task.retry_count, 0);
        assert!(task.processing_started_at.is_none());
    }

    #[tokio::test]
    async fn test_pending_lookup_and_processing_check() {
        let db = open_db().await;
        let id = db.add_queue_task(&new_task("k1")).unwrap();

        assert_eq!(db.get_pending_tasks_by_key("k1").unwrap().len(), 1);
        assert!(!db.has_processing_task_with_key("k1").unwrap());

        let mut task = db.get_queue_task(id).unwrap().unwrap();
        task.status = TaskStatus::Processing;
        task.processing_started_at = Some(crate::time::now_timestamp_millis());
        db.update_queue_task(&task).unwrap();

        assert!(db.get_pending_tasks_by_key("k1").unwrap().is_empty());
        assert!(db.has_processing_task_with_key("k1").unwrap());
    }

    #[tokio::test]
    async fn test_prune_completed_only_touches_completed() {
        let db = open_db().await;
        let done = db.add_queue_task(&new_task("k-done")).unwrap();
        let failed = db.add_queue_task(&new_task("k-failed")).unwrap();
        let pending = db.add_queue_task(&new_task("k-pending")).unwrap();

        let mut task = db.get_queue_task(done).unwrap().unwrap();
        task.status = TaskStatus::Completed;
        task.processed_at = Some(crate::time::now_timestamp_millis() - 10_000);
        db.update_queue_task(&task).unwrap();

        let mut task = db.get_queue_task(failed).unwrap().unwrap();
        task.status = TaskStatus::Failed;
        task.processed_at = Some(crate::time::now_timestamp_millis() - 10_000);
        db.update_queue_task(&task).unwrap();

        assert_eq!(db.prune_completed_tasks(1000).unwrap(), 1);
        assert!(db.get_queue_task(done).unwrap().is_none());
        assert!(db.get_queue_task(failed).unwrap().is_some());
        assert!(db.get_queue_task(pending).unwrap().is_some());
    }

    #[tokio::test]
    async fn test_reset_stuck_respects_timeout() {
        let db = open_db().await;
        let now = crate::time::now_timestamp_millis();

        let fresh = db.add_queue_task(&new_task("k-fresh")).unwrap();
        let stale = db.add_queue_task(&new_task("k-stale")).unwrap();

        let mut task = db.get_queue_task(fresh).unwrap().unwrap();
        task.status = TaskStatus::Processing;
        task.processing_started_at = Some(now - 1_000);
        db.update_queue_task(&task).unwrap();

        let mut task = db.get_queue_task(stale).unwrap().unwrap();
        task.status = TaskStatus::Processing;
        task.processing_started_at = Some(now - 120_000);
        db.update_queue_task(&task).unwrap();

        // 60 s timeout: only the stale task comes back
        assert_eq!(db.reset_stuck_processing_tasks(60_000).unwrap(), 1);

        let fresh = db.get_queue_task(fresh).unwrap().unwrap();
        assert_eq!(fresh.status, TaskStatus::Processing);
        assert_eq!(fresh.retry_count, 0);

        let stale = db.get_queue_task(stale).unwrap().unwrap();
        assert_eq!(stale.status, TaskStatus::Pending);
        assert_eq!(stale.retry_count, 1);
        assert!(stale.processing_started_at.is_none());
    }

    #[tokio::test]
    async fn test_queue_stats() {
        let db = open_db().await;
        db.add_queue_task(&new_task("k1")).unwrap();
        db.add_queue_task(&new_task("k2")).unwrap();
        let id = db.add_queue_task(&new_task("k3")).unwrap();

        let mut task = db.get_queue_task(id).unwrap().unwrap();
        task.status = TaskStatus::Failed;
        db.update_queue_task(&task).unwrap();

        let stats = db.get_queue_stats().unwrap();
        assert_eq!(stats.pending, 2);
        assert_eq!(stats.failed, 1);
        assert_eq!(stats.total, 3);
    }
}
