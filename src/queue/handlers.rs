//! # Task Handlers
//!
//! One handler per task type, dispatched by the queue processor.
//!
//! Each handler decides two things: how to perform the deferred mutation
//! (against the durable store and, where messaging is involved, the
//! transport mailbox), and which errors are permanent. Permanent errors
//! fail the task immediately; everything else retries with backoff.
//!
//! Preconditions are re-checked at execution time, not enqueue time: a
//! space deleted while offline silently discards its queued messages, a
//! deleted message discards its queued pin, and a delete finding nothing
//! left to delete counts as success. A task that waited out a network
//! partition must not fail loudly because the world moved on.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;

use super::{TaskPayload, TaskType};
use crate::error::{Error, Result};
use crate::mailbox::TransportMailbox;
use crate::messaging::ConversationType;
use crate::storage::{Database, MutedUserRecord};

/// A registered executor for one or more task types.
#[async_trait]
pub trait TaskHandler: Send + Sync {
    /// Perform the deferred work.
    async fn execute(&self, payload: &TaskPayload) -> Result<()>;

    /// Whether an error is permanent (fail now) or retryable (backoff).
    fn is_permanent_error(&self, error: &Error) -> bool {
        !error.is_recoverable()
    }
}

/// Handler lookup table keyed by task type.
///
/// Built in a single dependency-ordered wiring pass after every service
/// exists; the processor treats a missing entry as a permanent task
/// failure, so there is no "not yet initialized" runtime state to hit.
#[derive(Default)]
pub struct HandlerRegistry {
    handlers: HashMap<TaskType, Arc<dyn TaskHandler>>,
}

impl HandlerRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler for a task type, replacing any previous one.
    pub fn register(&mut self, task_type: TaskType, handler: Arc<dyn TaskHandler>) {
        self.handlers.insert(task_type, handler);
    }

    /// Look up the handler for a task type.
    pub fn get(&self, task_type: TaskType) -> Option<Arc<dyn TaskHandler>> {
        self.handlers.get(&task_type).cloned()
    }

    /// Number of registered handlers.
    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    /// Whether no handlers are registered.
    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

// ============================================================================
// DEFAULT HANDLERS
// ============================================================================

/// Sends a composed message: persists it locally, then queues the frame.
struct SendMessageHandler {
    database: Arc<Database>,
    mailbox: Arc<TransportMailbox>,
}

#[async_trait]
impl TaskHandler for SendMessageHandler {
    async fn execute(&self, payload: &TaskPayload) -> Result<()> {
        let TaskPayload::SendMessage {
            space_id,
            channel_id,
            message,
        } = payload
        else {
            return Err(Error::Internal("send-message handler got foreign payload".into()));
        };

        let is_direct = space_id == channel_id;
        if !is_direct {
            // The space or channel may have been deleted while this task
            // waited offline; discard silently rather than fail.
            let Some(space) = self.database.get_space(space_id)? else {
                tracing::info!("Discarding message for deleted space {}", space_id);
                return Ok(());
            };
            if space.find_channel(channel_id).is_none() {
                tracing::info!("Discarding message for deleted channel {}", channel_id);
                return Ok(());
            }
        }

        let conversation_type = if is_direct {
            ConversationType::Direct
        } else {
            ConversationType::Group
        };
        self.database.save_message(
            message,
            message.created_date,
            space_id,
            conversation_type,
            "",
            "",
            Some(message.content.sender_id()),
        )?;

        let frame = serde_json::json!({
            "type": "message",
            "spaceId": space_id,
            "channelId": channel_id,
            "message": message,
        })
        .to_string();
        self.mailbox.send_or_buffer(frame).await
    }

    fn is_permanent_error(&self, error: &Error) -> bool {
        matches!(error, Error::InvalidSpace(_) | Error::MessageNotFound)
            || !error.is_recoverable()
    }
}

/// Uploads the config stored for an address.
struct SaveConfigHandler {
    database: Arc<Database>,
    mailbox: Arc<TransportMailbox>,
}

#[async_trait]
impl TaskHandler for SaveConfigHandler {
    async fn execute(&self, payload: &TaskPayload) -> Result<()> {
        let TaskPayload::SaveConfig { address } = payload else {
            return Err(Error::Internal("save-config handler got foreign payload".into()));
        };

        // Load at execution time: coalesced saves all push the newest blob
        let Some(config) = self.database.get_user_config(address)? else {
            return Err(Error::StorageNotFound(format!("config for {}", address)));
        };

        let frame = serde_json::json!({
            "type": "config",
            "address": address,
            "config": config,
        })
        .to_string();
        self.mailbox.send_or_buffer(frame).await
    }
}

/// Pushes updated space settings.
struct UpdateSpaceHandler {
    database: Arc<Database>,
    mailbox: Arc<TransportMailbox>,
}

#[async_trait]
impl TaskHandler for UpdateSpaceHandler {
    async fn execute(&self, payload: &TaskPayload) -> Result<()> {
        let TaskPayload::UpdateSpace { space } = payload else {
            return Err(Error::Internal("update-space handler got foreign payload".into()));
        };

        if self.database.get_space(&space.space_id)?.is_none() {
            tracing::info!("Discarding update for deleted space {}", space.space_id);
            return Ok(());
        }

        self.database.save_space(space)?;

        let frame = serde_json::json!({
            "type": "space-update",
            "space": space,
        })
        .to_string();
        self.mailbox.send_or_buffer(frame).await
    }

    fn is_permanent_error(&self, error: &Error) -> bool {
        matches!(error, Error::InvalidSpace(_)) || !error.is_recoverable()
    }
}

/// Delivers a space invite.
struct SendInviteHandler {
    mailbox: Arc<TransportMailbox>,
}

#[async_trait]
impl TaskHandler for SendInviteHandler {
    async fn execute(&self, payload: &TaskPayload) -> Result<()> {
        let TaskPayload::SendInvite {
            space_id,
            invitee_address,
            invite_url,
        } = payload
        else {
            return Err(Error::Internal("send-invite handler got foreign payload".into()));
        };

        let frame = serde_json::json!({
            "type": "invite",
            "spaceId": space_id,
            "invitee": invitee_address,
            "inviteUrl": invite_url,
        })
        .to_string();
        self.mailbox.send_or_buffer(frame).await
    }
}

/// Moderation actions: kick, mute, unmute.
struct ModerationHandler {
    database: Arc<Database>,
    mailbox: Arc<TransportMailbox>,
}

#[async_trait]
impl TaskHandler for ModerationHandler {
    async fn execute(&self, payload: &TaskPayload) -> Result<()> {
        match payload {
            TaskPayload::KickUser {
                space_id,
                target_user_id,
            } => {
                // The member may have left while this task waited offline
                if self.database.get_space_member(space_id, target_user_id)?.is_none() {
                    tracing::info!("User {} already left space {}, skipping kick", target_user_id, space_id);
                    return Ok(());
                }
                self.database.delete_space_member(space_id, target_user_id)?;

                let frame = serde_json::json!({
                    "type": "kick",
                    "spaceId": space_id,
                    "target": target_user_id,
                })
                .to_string();
                self.mailbox.send_or_buffer(frame).await
            }
            TaskPayload::MuteUser {
                space_id,
                channel_id,
                target_user_id,
                mute_id,
                expires_at,
                muted_by,
            } => {
                self.database.save_muted_user(&MutedUserRecord {
                    space_id: space_id.clone(),
                    target_user_id: target_user_id.clone(),
                    expires_at: *expires_at,
                    last_mute_id: mute_id.clone(),
                    muted_at: crate::time::now_timestamp_millis(),
                    muted_by: muted_by.clone(),
                })?;

                let frame = serde_json::json!({
                    "type": "mute",
                    "spaceId": space_id,
                    "channelId": channel_id,
                    "target": target_user_id,
                    "muteId": mute_id,
                    "action": "mute",
                })
                .to_string();
                self.mailbox.send_or_buffer(frame).await
            }
            TaskPayload::UnmuteUser {
                space_id,
                channel_id,
                target_user_id,
                mute_id,
            } => {
                self.database.remove_muted_user(space_id, target_user_id)?;

                let frame = serde_json::json!({
                    "type": "mute",
                    "spaceId": space_id,
                    "channelId": channel_id,
                    "target": target_user_id,
                    "muteId": mute_id,
                    "action": "unmute",
                })
                .to_string();
                self.mailbox.send_or_buffer(frame).await
            }
            _ => Err(Error::Internal("moderation handler got foreign payload".into())),
        }
    }

    fn is_permanent_error(&self, error: &Error) -> bool {
        matches!(error, Error::StorageNotFound(_)) || !error.is_recoverable()
    }
}

/// Message actions: reaction, pin, unpin, delete.
struct MessageActionHandler {
    database: Arc<Database>,
    mailbox: Arc<TransportMailbox>,
}

#[async_trait]
impl TaskHandler for MessageActionHandler {
    async fn execute(&self, payload: &TaskPayload) -> Result<()> {
        match payload {
            TaskPayload::Reaction {
                space_id,
                channel_id,
                target_message_id,
                emoji,
                add,
                sender_id,
            } => {
                // Target deleted while offline: skip silently
                if self.database.get_message_by_id(target_message_id)?.is_none() {
                    return Ok(());
                }

                let frame = serde_json::json!({
                    "type": if *add { "reaction" } else { "remove-reaction" },
                    "spaceId": space_id,
                    "channelId": channel_id,
                    "messageId": target_message_id,
                    "emoji": emoji,
                    "senderId": sender_id,
                })
                .to_string();
                self.mailbox.send_or_buffer(frame).await
            }
            TaskPayload::PinMessage {
                space_id,
                channel_id,
                target_message_id,
                pinned_by,
            } => {
                if self.database.get_message_by_id(target_message_id)?.is_none() {
                    return Ok(());
                }
                self.database.set_message_pinned(
                    target_message_id,
                    pinned_by,
                    crate::time::now_timestamp_millis(),
                )?;

                let frame = serde_json::json!({
                    "type": "pin",
                    "spaceId": space_id,
                    "channelId": channel_id,
                    "messageId": target_message_id,
                    "action": "pin",
                })
                .to_string();
                self.mailbox.send_or_buffer(frame).await
            }
            TaskPayload::UnpinMessage {
                space_id,
                channel_id,
                target_message_id,
            } => {
                self.database.set_message_unpinned(target_message_id)?;

                let frame = serde_json::json!({
                    "type": "pin",
                    "spaceId": space_id,
                    "channelId": channel_id,
                    "messageId": target_message_id,
                    "action": "unpin",
                })
                .to_string();
                self.mailbox.send_or_buffer(frame).await
            }
            TaskPayload::DeleteMessage {
                space_id,
                channel_id,
                target_message_id,
            } => {
                // Idempotent: already deleted counts as success
                match self.database.delete_message(target_message_id) {
                    Ok(()) => {}
                    Err(Error::MessageNotFound) => return Ok(()),
                    Err(e) => return Err(e),
                }

                let frame = serde_json::json!({
                    "type": "remove-message",
                    "spaceId": space_id,
                    "channelId": channel_id,
                    "messageId": target_message_id,
                })
                .to_string();
                self.mailbox.send_or_buffer(frame).await
            }
            _ => Err(Error::Internal("message-action handler got foreign payload".into())),
        }
    }
}

/// Build the registry with the store-backed default handlers.
///
/// The match is exhaustive over [`TaskType`]: adding a task type without
/// deciding its handler does not compile.
pub fn wire_default_handlers(
    database: Arc<Database>,
    mailbox: Arc<TransportMailbox>,
) -> HandlerRegistry {
    let send_message = Arc::new(SendMessageHandler {
        database: database.clone(),
        mailbox: mailbox.clone(),
    });
    let save_config = Arc::new(SaveConfigHandler {
        database: database.clone(),
        mailbox: mailbox.clone(),
    });
    let update_space = Arc::new(UpdateSpaceHandler {
        database: database.clone(),
        mailbox: mailbox.clone(),
    });
    let send_invite = Arc::new(SendInviteHandler {
        mailbox: mailbox.clone(),
    });
    let moderation = Arc::new(ModerationHandler {
        database: database.clone(),
        mailbox: mailbox.clone(),
    });
    let message_action = Arc::new(MessageActionHandler { database, mailbox });

    let mut registry = HandlerRegistry::new();
    for task_type in [
        TaskType::SendMessage,
        TaskType::SaveConfig,
        TaskType::UpdateSpace,
        TaskType::SendInvite,
        TaskType::KickUser,
        TaskType::MuteUser,
        TaskType::UnmuteUser,
        TaskType::Reaction,
        TaskType::PinMessage,
        TaskType::UnpinMessage,
        TaskType::DeleteMessage,
    ] {
        let handler: Arc<dyn TaskHandler> = match task_type {
            TaskType::SendMessage => send_message.clone(),
            TaskType::SaveConfig => save_config.clone(),
            TaskType::UpdateSpace => update_space.clone(),
            TaskType::SendInvite => send_invite.clone(),
            TaskType::KickUser | TaskType::MuteUser | TaskType::UnmuteUser => moderation.clone(),
            TaskType::Reaction
            | TaskType::PinMessage
            | TaskType::UnpinMessage
            | TaskType::DeleteMessage => message_action.clone(),
        };
        registry.register(task_type, handler);
    }
    registry
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messaging::{Mentions, Message, MessageContent};

    fn make_message(space: &str, channel: &str, id: &str) -> Message {
        Message {
            message_id: id.to_string(),
            space_id: space.to_string(),
            channel_id: channel.to_string(),
            created_date: 100,
            modified_date: 100,
            nonce: "00".into(),
            digest_algorithm: "sha-256".into(),
            last_modified_hash: String::new(),
            content: MessageContent::Post {
                sender_id: "addr-me".into(),
                text: "hello".into(),
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

    async fn fixtures() -> (Arc<Database>, Arc<TransportMailbox>, HandlerRegistry) {
        let database = Arc::new(Database::open(None).await.unwrap());
        let mailbox = Arc::new(TransportMailbox::new());
        let registry = wire_default_handlers(database.clone(), mailbox.clone());
        (database, mailbox, registry)
    }

    #[tokio::test]
    async fn test_registry_covers_every_task_type() {
        let (_db, _mailbox, registry) = fixtures().await;
        for task_type in [
            TaskType::SendMessage,
            TaskType::SaveConfig,
            TaskType::UpdateSpace,
            TaskType::SendInvite,
            TaskType::KickUser,
            TaskType::MuteUser,
            TaskType::UnmuteUser,
            TaskType::Reaction,
            TaskType::PinMessage,
            TaskType::UnpinMessage,
            TaskType::DeleteMessage,
        ] {
            assert!(registry.get(task_type).is_some(), "missing {:?}", task_type);
        }
    }

    #[tokio::test]
    async fn test_send_message_discards_for_deleted_space() {
        let (db, mailbox, registry) = fixtures().await;
        let handler = registry.get(TaskType::SendMessage).unwrap();

        let payload = TaskPayload::SendMessage {
            space_id: "space-gone".into(),
            channel_id: "chan-1".into(),
            message: Box::new(make_message("space-gone", "chan-1", "m1")),
        };

        // No space row: the task succeeds without writing or sending
        handler.execute(&payload).await.unwrap();
        assert!(db.get_message_by_id("m1").unwrap().is_none());
        assert_eq!(mailbox.outbound_len(), 0);
    }

    #[tokio::test]
    async fn test_send_direct_message_buffers_frame() {
        let (db, mailbox, registry) = fixtures().await;
        let handler = registry.get(TaskType::SendMessage).unwrap();

        let payload = TaskPayload::SendMessage {
            space_id: "addr-bob".into(),
            channel_id: "addr-bob".into(),
            message: Box::new(make_message("addr-bob", "addr-bob", "dm1")),
        };

        // No transport wired: the frame accumulates for the next open
        handler.execute(&payload).await.unwrap();
        assert!(db.get_message_by_id("dm1").unwrap().is_some());
        assert_eq!(mailbox.outbound_len(), 1);
    }

    #[tokio::test]
    async fn test_delete_message_is_idempotent() {
        let (_db, mailbox, registry) = fixtures().await;
        let handler = registry.get(TaskType::DeleteMessage).unwrap();

        let payload = TaskPayload::DeleteMessage {
            space_id: "s".into(),
            channel_id: "c".into(),
            target_message_id: "m-gone".into(),
        };

        // Nothing to delete: success, no frame
        handler.execute(&payload).await.unwrap();
        assert_eq!(mailbox.outbound_len(), 0);
    }

    #[tokio::test]
    async fn test_pin_skips_deleted_target() {
        let (_db, mailbox, registry) = fixtures().await;
        let handler = registry.get(TaskType::PinMessage).unwrap();

        let payload = TaskPayload::PinMessage {
            space_id: "s".into(),
            channel_id: "c".into(),
            target_message_id: "m-gone".into(),
            pinned_by: "addr-mod".into(),
        };

        handler.execute(&payload).await.unwrap();
        assert_eq!(mailbox.outbound_len(), 0);
    }

    #[tokio::test]
    async fn test_mute_writes_row_and_frame() {
        let (db, mailbox, registry) = fixtures().await;
        let handler = registry.get(TaskType::MuteUser).unwrap();

        let payload = TaskPayload::MuteUser {
            space_id: "space-1".into(),
            channel_id: "chan-1".into(),
            target_user_id: "addr-bad".into(),
            mute_id: "mute-1".into(),
            expires_at: None,
            muted_by: "addr-mod".into(),
        };

        handler.execute(&payload).await.unwrap();
        assert!(db.is_user_muted("space-1", "addr-bad", 0).unwrap());
        assert_eq!(mailbox.outbound_len(), 1);
    }

    #[tokio::test]
    async fn test_save_config_missing_is_permanent() {
        let (_db, _mailbox, registry) = fixtures().await;
        let handler = registry.get(TaskType::SaveConfig).unwrap();

        let payload = TaskPayload::SaveConfig {
            address: "addr-unknown".into(),
        };

        let err = handler.execute(&payload).await.unwrap_err();
        assert!(handler.is_permanent_error(&err));
    }
}
