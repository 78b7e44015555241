//! # Database Schema
//!
//! SQL schema definitions for the Quorum database.
//!
//! ## Schema Overview
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                         DATABASE SCHEMA                                 │
//! ├─────────────────────────────────────────────────────────────────────────┤
//! │                                                                         │
//! │  ┌─────────────────┐    ┌──────────────────┐    ┌──────────────────┐   │
//! │  │    messages     │    │  conversations   │    │ deleted_messages │   │
//! │  ├─────────────────┤    ├──────────────────┤    ├──────────────────┤   │
//! │  │ message_id  PK  │    │ conversation_id  │    │ message_id   PK  │   │
//! │  │ space_id        │───►│ type             │    │ space_id         │   │
//! │  │ channel_id      │    │ timestamp        │    │ channel_id       │   │
//! │  │ created_date    │    │ address          │    │ deleted_at       │   │
//! │  │ sender_id       │    │ last_read_ts     │    └──────────────────┘   │
//! │  │ content (JSON)  │    └──────────────────┘     Tombstones block      │
//! │  │ pin fields      │     by_type_time index      re-sync resurrection  │
//! │  └─────────────────┘                                                   │
//! │   by_conversation_time = (space_id, channel_id, created_date)          │
//! │   by_channel_pinned    = (space_id, channel_id, is_pinned, pinned_at)  │
//! │                                                                         │
//! │  ┌─────────────────┐    ┌──────────────────┐    ┌──────────────────┐   │
//! │  │ encryption_     │    │  latest_states   │    │   action_queue   │   │
//! │  │ states          │    ├──────────────────┤    ├──────────────────┤   │
//! │  ├─────────────────┤    │ conversation_id  │    │ id AUTOINCREMENT │   │
//! │  │ conversation_id │    │ inbox_id         │    │ task_type        │   │
//! │  │ inbox_id        │    │ state (opaque)   │    │ payload (JSON)   │   │
//! │  │ state (opaque)  │    └──────────────────┘    │ key / status     │   │
//! │  │ timestamp       │     First successful       │ retry bookkeeping│   │
//! │  │ sent_accept     │     establishment only     └──────────────────┘   │
//! │  └─────────────────┘                                                   │
//! │                                                                         │
//! │  spaces · space_keys · space_members · conversation_users ·            │
//! │  user_config · bookmarks · muted_users                                 │
//! │                                                                         │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

/// Current schema version
pub const SCHEMA_VERSION: i32 = 2;

/// SQL to create all tables
pub const CREATE_TABLES: &str = r#"
-- Schema version tracking
CREATE TABLE IF NOT EXISTS schema_version (
    version INTEGER PRIMARY KEY
);

-- Messages table
-- One row per content envelope. The content union, reactions and mentions
-- are stored as JSON; everything the range indices need is a real column.
CREATE TABLE IF NOT EXISTS messages (
    message_id TEXT PRIMARY KEY,
    -- Owning space (== channel_id for direct conversations)
    space_id TEXT NOT NULL,
    -- Channel within the space
    channel_id TEXT NOT NULL,
    -- Logical timestamp (ms), monotonic per sender
    created_date INTEGER NOT NULL,
    modified_date INTEGER NOT NULL,
    -- Sender address, denormalized out of content for search indexing
    sender_id TEXT NOT NULL,
    -- Secure-channel envelope metadata
    nonce TEXT NOT NULL,
    digest_algorithm TEXT NOT NULL,
    last_modified_hash TEXT NOT NULL,
    -- Tagged content union (JSON)
    content TEXT NOT NULL,
    -- Aggregated reactions (JSON array)
    reactions TEXT NOT NULL DEFAULT '[]',
    -- Mention metadata (JSON)
    mentions TEXT NOT NULL DEFAULT '{}',
    -- Reply linkage (JSON, nullable)
    reply_metadata TEXT,
    -- Pinning support
    is_pinned INTEGER NOT NULL DEFAULT 0,
    pinned_at INTEGER,
    pinned_by TEXT
);
CREATE INDEX IF NOT EXISTS idx_messages_by_conversation_time
    ON messages(space_id, channel_id, created_date);
CREATE INDEX IF NOT EXISTS idx_messages_by_channel_pinned
    ON messages(space_id, channel_id, is_pinned, pinned_at);

-- Conversations table
-- One row per conversation id; by_type_time must stay consistent with
-- the timestamp column on every write.
CREATE TABLE IF NOT EXISTS conversations (
    conversation_id TEXT PRIMARY KEY,
    -- 'direct' or 'group'
    type TEXT NOT NULL CHECK (type IN ('direct', 'group')),
    -- Last-message timestamp (ms), drives sidebar ordering
    timestamp INTEGER NOT NULL,
    -- Counterparty or space address
    address TEXT NOT NULL,
    icon TEXT NOT NULL DEFAULT '',
    display_name TEXT NOT NULL DEFAULT '',
    -- Read marker (ms)
    last_read_timestamp INTEGER,
    -- Most recent message id, for previews
    last_message_id TEXT
);
CREATE INDEX IF NOT EXISTS idx_conversations_by_type_time
    ON conversations(type, timestamp);

-- Encryption state history
-- Opaque ratchet-state blobs from the secure-channel SDK, one row per
-- (conversation, inbox) pair. History accumulates for audit/debug.
CREATE TABLE IF NOT EXISTS encryption_states (
    conversation_id TEXT NOT NULL,
    inbox_id TEXT NOT NULL,
    -- Opaque serialized ratchet state (JSON from the SDK)
    state TEXT NOT NULL,
    timestamp INTEGER NOT NULL,
    sent_accept INTEGER NOT NULL DEFAULT 0,
    PRIMARY KEY (conversation_id, inbox_id)
);

-- Latest-state projection
-- Only the state from the FIRST successful establishment per conversation.
-- Overwritten exclusively on the was-first-attempt write path.
CREATE TABLE IF NOT EXISTS latest_states (
    conversation_id TEXT PRIMARY KEY,
    inbox_id TEXT NOT NULL,
    state TEXT NOT NULL,
    timestamp INTEGER NOT NULL,
    sent_accept INTEGER NOT NULL DEFAULT 0
);

-- Conversation participants
CREATE TABLE IF NOT EXISTS conversation_users (
    address TEXT PRIMARY KEY,
    conversation_id TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_conversation_users_by_conversation
    ON conversation_users(conversation_id);

-- Spaces table
-- The full aggregate (groups, roles, emoji/sticker sets) as JSON;
-- name and modification time extracted for listing.
CREATE TABLE IF NOT EXISTS spaces (
    space_id TEXT PRIMARY KEY,
    space_name TEXT NOT NULL,
    modified_date INTEGER NOT NULL,
    data TEXT NOT NULL
);

-- Space key material (hex encoded)
CREATE TABLE IF NOT EXISTS space_keys (
    space_id TEXT NOT NULL,
    key_id TEXT NOT NULL,
    address TEXT,
    public_key TEXT NOT NULL,
    private_key TEXT NOT NULL,
    PRIMARY KEY (space_id, key_id)
);

-- Space membership with cached display profile
CREATE TABLE IF NOT EXISTS space_members (
    space_id TEXT NOT NULL,
    user_address TEXT NOT NULL,
    display_name TEXT NOT NULL DEFAULT '',
    user_icon TEXT NOT NULL DEFAULT '',
    inbox_address TEXT NOT NULL DEFAULT '',
    PRIMARY KEY (space_id, user_address)
);
CREATE INDEX IF NOT EXISTS idx_space_members_by_address
    ON space_members(user_address);

-- Per-user config blob (folders, sidebar order, space list, synced bookmarks)
CREATE TABLE IF NOT EXISTS user_config (
    address TEXT PRIMARY KEY,
    config TEXT NOT NULL,
    updated_at INTEGER NOT NULL
);
"#;

/// Migration SQL from schema version 1 → 2
///
/// Adds the offline-first machinery: bookmarks, muted users, deletion
/// tombstones, and the persistent action queue.
pub const MIGRATE_V1_TO_V2: &str = r#"
-- Bookmarks with cached preview (JSON)
CREATE TABLE IF NOT EXISTS bookmarks (
    bookmark_id TEXT PRIMARY KEY,
    message_id TEXT NOT NULL,
    space_id TEXT,
    channel_id TEXT,
    conversation_id TEXT,
    source_type TEXT NOT NULL CHECK (source_type IN ('channel', 'dm')),
    created_at INTEGER NOT NULL,
    cached_preview TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_bookmarks_by_message ON bookmarks(message_id);
CREATE INDEX IF NOT EXISTS idx_bookmarks_by_created ON bookmarks(created_at);

-- Muted users per space
-- last_mute_id deduplicates replay of the same mute action via sync.
CREATE TABLE IF NOT EXISTS muted_users (
    space_id TEXT NOT NULL,
    target_user_id TEXT NOT NULL,
    -- NULL = permanent
    expires_at INTEGER,
    last_mute_id TEXT NOT NULL,
    muted_at INTEGER NOT NULL,
    muted_by TEXT NOT NULL,
    PRIMARY KEY (space_id, target_user_id)
);
CREATE INDEX IF NOT EXISTS idx_muted_users_by_space ON muted_users(space_id);
CREATE INDEX IF NOT EXISTS idx_muted_users_by_mute_id ON muted_users(last_mute_id);

-- Deletion tombstones (channel messages only)
-- Block re-insertion of deliberately deleted messages by a later sync pass.
CREATE TABLE IF NOT EXISTS deleted_messages (
    message_id TEXT PRIMARY KEY,
    space_id TEXT NOT NULL,
    channel_id TEXT NOT NULL,
    deleted_at INTEGER NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_deleted_messages_by_space_channel
    ON deleted_messages(space_id, channel_id);
CREATE INDEX IF NOT EXISTS idx_deleted_messages_by_deleted_at
    ON deleted_messages(deleted_at);

-- Persistent action queue
-- Every user-initiated mutation is durable here before any network attempt.
CREATE TABLE IF NOT EXISTS action_queue (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    task_type TEXT NOT NULL,
    -- Tagged payload union (JSON), one variant per task_type
    payload TEXT NOT NULL,
    -- Application-chosen dedup key
    key TEXT NOT NULL,
    status TEXT NOT NULL DEFAULT 'pending'
        CHECK (status IN ('pending', 'processing', 'completed', 'failed')),
    retry_count INTEGER NOT NULL DEFAULT 0,
    max_retries INTEGER NOT NULL DEFAULT 3,
    next_retry_at INTEGER NOT NULL,
    created_at INTEGER NOT NULL,
    processing_started_at INTEGER,
    processed_at INTEGER,
    -- Last failure text, kept for inspection
    error TEXT
);
CREATE INDEX IF NOT EXISTS idx_action_queue_status ON action_queue(status);
CREATE INDEX IF NOT EXISTS idx_action_queue_task_type ON action_queue(task_type);
CREATE INDEX IF NOT EXISTS idx_action_queue_key ON action_queue(key);
CREATE INDEX IF NOT EXISTS idx_action_queue_next_retry_at ON action_queue(next_retry_at);

-- Update schema version
UPDATE schema_version SET version = 2;
"#;

/// SQL to drop all tables (for testing/reset)
pub const DROP_TABLES: &str = r#"
DROP TABLE IF EXISTS action_queue;
DROP TABLE IF EXISTS deleted_messages;
DROP TABLE IF EXISTS muted_users;
DROP TABLE IF EXISTS bookmarks;
DROP TABLE IF EXISTS user_config;
DROP TABLE IF EXISTS space_members;
DROP TABLE IF EXISTS space_keys;
DROP TABLE IF EXISTS spaces;
DROP TABLE IF EXISTS conversation_users;
DROP TABLE IF EXISTS latest_states;
DROP TABLE IF EXISTS encryption_states;
DROP TABLE IF EXISTS conversations;
DROP TABLE IF EXISTS messages;
DROP TABLE IF EXISTS schema_version;
"#;
