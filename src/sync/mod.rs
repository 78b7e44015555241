//! # Sync Seam
//!
//! Narrow interface to the external sync collaborator.
//!
//! The manifest/delta algorithm itself lives outside this crate; what the
//! store owes it is an answer to "here is what I hold" reports from peers.
//! [`SyncResponder::inform_sync_data`] compares a peer's reported message
//! and member counts against our own and decides one of three things:
//! request a sync (they hold more), offer ours (we hold more), or do
//! nothing (in sync). Matching summaries short-circuit the comparison.

use async_trait::async_trait;
use std::sync::Arc;

use crate::error::Result;
use crate::storage::Database;

/// The external sync/delta collaborator.
#[async_trait]
pub trait SyncCollaborator: Send + Sync {
    /// Ask the collaborator to pull a space from peers.
    async fn request_sync(&self, space_id: &str) -> Result<()>;

    /// Offer our data for a space to a specific peer inbox.
    async fn offer_sync(&self, space_id: &str, inbox_address: &str) -> Result<()>;
}

/// What `inform_sync_data` decided to do.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncDecision {
    /// The peer holds more; a sync was requested
    RequestedSync,
    /// We hold more; our data was offered to the peer
    OfferedSync,
    /// Nothing to exchange
    InSync,
}

/// Answers peer sync reports from the store's own counts.
pub struct SyncResponder {
    database: Arc<Database>,
    collaborator: Arc<dyn SyncCollaborator>,
}

impl SyncResponder {
    /// Create a responder over the store and collaborator.
    pub fn new(database: Arc<Database>, collaborator: Arc<dyn SyncCollaborator>) -> Self {
        Self {
            database,
            collaborator,
        }
    }

    /// Our side of the comparison, as an opaque summary string.
    pub fn local_summary(&self, space_id: &str) -> Result<String> {
        let messages = self.database.count_messages(space_id)?;
        let members = self.database.count_space_members(space_id)?;
        Ok(format!("m{}:u{}", messages, members))
    }

    /// Handle a peer's "here is what I hold" report for a space.
    ///
    /// The store answers from its own message and member counts; the
    /// actual data exchange is the collaborator's business.
    pub async fn inform_sync_data(
        &self,
        space_id: &str,
        inbox_address: &str,
        message_count: usize,
        member_count: usize,
        summary: Option<&str>,
    ) -> Result<SyncDecision> {
        let our_messages = self.database.count_messages(space_id)?;
        let our_members = self.database.count_space_members(space_id)?;

        if let Some(summary) = summary {
            if summary == self.local_summary(space_id)? {
                tracing::debug!("Space {} already in sync (summary match)", space_id);
                return Ok(SyncDecision::InSync);
            }
        }

        tracing::debug!(
            "Sync report for {}: peer has {} messages / {} members, we have {} / {}",
            space_id,
            message_count,
            member_count,
            our_messages,
            our_members
        );

        if message_count > our_messages || member_count > our_members {
            self.collaborator.request_sync(space_id).await?;
            return Ok(SyncDecision::RequestedSync);
        }

        if our_messages > message_count || our_members > member_count {
            self.collaborator.offer_sync(space_id, inbox_address).await?;
            return Ok(SyncDecision::OfferedSync);
        }

        Ok(SyncDecision::InSync)
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messaging::{ConversationType, Mentions, Message, MessageContent};
    use parking_lot::Mutex;

    #[derive(Default)]
    struct RecordingCollaborator {
        requests: Mutex<Vec<String>>,
        offers: Mutex<Vec<(String, String)>>,
    }

    #[async_trait]
    impl SyncCollaborator for RecordingCollaborator {
        async fn request_sync(&self, space_id: &str) -> Result<()> {
            self.requests.lock().push(space_id.to_string());
            Ok(())
        }

        async fn offer_sync(&self, space_id: &str, inbox_address: &str) -> Result<()> {
            self.offers
                .lock()
                .push((space_id.to_string(), inbox_address.to_string()));
            Ok(())
        }
    }

    async fn fixture(message_count: usize) -> (Arc<RecordingCollaborator>, SyncResponder) {
        let db = Arc::new(Database::open(None).await.unwrap());
        for i in 0..message_count {
            let msg = Message {
                message_id: format!("m{}", i),
                space_id: "space-1".into(),
                channel_id: "chan-1".into(),
                created_date: 100 + i as i64,
                modified_date: 100 + i as i64,
                nonce: "00".into(),
                digest_algorithm: "sha-256".into(),
                last_modified_hash: String::new(),
                content: MessageContent::Post {
                    sender_id: "addr-a".into(),
                    text: "hi".into(),
                    replies_to_message_id: None,
                },
                reactions: vec![],
                mentions: Mentions::default(),
                reply_metadata: None,
                is_pinned: None,
                pinned_at: None,
                pinned_by: None,
            };
            db.save_message(&msg, msg.created_date, "a", ConversationType::Group, "", "", None)
                .unwrap();
        }

        let collaborator = Arc::new(RecordingCollaborator::default());
        let responder = SyncResponder::new(db, collaborator.clone());
        (collaborator, responder)
    }

    #[tokio::test]
    async fn test_peer_with_more_triggers_request() {
        let (collaborator, responder) = fixture(2).await;

        let decision = responder
            .inform_sync_data("space-1", "inbox-peer", 5, 0, None)
            .await
            .unwrap();

        assert_eq!(decision, SyncDecision::RequestedSync);
        assert_eq!(collaborator.requests.lock().as_slice(), ["space-1"]);
    }

    #[tokio::test]
    async fn test_peer_with_less_gets_offer() {
        let (collaborator, responder) = fixture(3).await;

        let decision = responder
            .inform_sync_data("space-1", "inbox-peer", 1, 0, None)
            .await
            .unwrap();

        assert_eq!(decision, SyncDecision::OfferedSync);
        assert_eq!(
            collaborator.offers.lock().as_slice(),
            [("space-1".to_string(), "inbox-peer".to_string())]
        );
    }

    #[tokio::test]
    async fn test_equal_counts_are_in_sync() {
        let (collaborator, responder) = fixture(2).await;

        let decision = responder
            .inform_sync_data("space-1", "inbox-peer", 2, 0, None)
            .await
            .unwrap();

        assert_eq!(decision, SyncDecision::InSync);
        assert!(collaborator.requests.lock().is_empty());
        assert!(collaborator.offers.lock().is_empty());
    }

    #[tokio::test]
    async fn test_summary_match_short_circuits() {
        let (collaborator, responder) = fixture(2).await;
        let summary = responder.local_summary("space-1").unwrap();

        // Counts disagree but the summary matches: no exchange
        let decision = responder
            .inform_sync_data("space-1", "inbox-peer", 99, 99, Some(&summary))
            .await
            .unwrap();

        assert_eq!(decision, SyncDecision::InSync);
        assert!(collaborator.requests.lock().is_empty());
    }
}
