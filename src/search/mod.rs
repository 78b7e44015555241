//! # Search Module
//!
//! In-memory full-text search over the message store.
//!
//! One inverted index is kept per scope — `space:<spaceId>` for a space,
//! `dm:<conversationId>` for a direct conversation — built from the
//! extracted plain text of post/event content plus the sender id. Indices
//! are built lazily from the durable store, then kept current incrementally
//! by observing store commits.
//!
//! Search is strictly best effort: index build failures are logged and
//! swallowed, never blocking a write, and a hit whose underlying message
//! has disappeared (e.g. concurrently deleted) is silently dropped rather
//! than surfaced as an error. Relevance ranking is deliberately simple term
//! frequency with a content-over-sender boost; anything fancier belongs in
//! a dedicated index service behind this same contract.

use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};

use crate::error::Result;
use crate::messaging::{ConversationType, Message};
use crate::storage::{Database, StoreObserver};

/// Boost applied to matches in message content, relative to sender matches.
const CONTENT_BOOST: f64 = 2.0;

/// Weight of a prefix match relative to an exact term match.
const PREFIX_WEIGHT: f64 = 0.5;

/// Scope of a search: one index per value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SearchScope {
    /// All channels of a space
    Space {
        /// Space id
        space_id: String,
    },
    /// One direct conversation
    Dm {
        /// Conversation id ("address/address")
        conversation_id: String,
    },
}

impl SearchScope {
    fn key(&self) -> String {
        match self {
            Self::Space { space_id } => format!("space:{}", space_id),
            Self::Dm { conversation_id } => format!("dm:{}", conversation_id),
        }
    }
}

/// A ranked search hit joined back to the full message.
#[derive(Debug, Clone)]
pub struct SearchResult {
    /// The matching message
    pub message: Message,
    /// Relevance score (higher is better)
    pub score: f64,
}

#[derive(Debug, Clone)]
struct DocRef {
    space_id: String,
    channel_id: String,
}

/// Inverted index for one scope.
#[derive(Default)]
struct ScopeIndex {
    /// term → message id → term frequency, over content text
    content_postings: HashMap<String, HashMap<String, usize>>,
    /// term → message id → term frequency, over sender ids
    sender_postings: HashMap<String, HashMap<String, usize>>,
    /// message id → location, for the join back to the store
    docs: HashMap<String, DocRef>,
}

fn tokenize(text: &str) -> Vec<String> {
    text.to_lowercase()
        .split(|c: char| !c.is_alphanumeric())
        .filter(|t| !t.is_empty())
        .map(|t| t.to_string())
        .collect()
}

impl ScopeIndex {
    fn add(&mut self, message: &Message) {
        let Some(text) = message.content.searchable_text() else {
            return;
        };

        self.docs.insert(
            message.message_id.clone(),
            DocRef {
                space_id: message.space_id.clone(),
                channel_id: message.channel_id.clone(),
            },
        );

        for token in tokenize(&text) {
            *self
                .content_postings
                .entry(token)
                .or_default()
                .entry(message.message_id.clone())
                .or_insert(0) += 1;
        }
        for token in tokenize(message.content.sender_id()) {
            *self
                .sender_postings
                .entry(token)
                .or_default()
                .entry(message.message_id.clone())
                .or_insert(0) += 1;
        }
    }

    fn remove(&mut self, message_id: &str) {
        if self.docs.remove(message_id).is_none() {
            return;
        }
        self.content_postings.retain(|_, docs| {
            docs.remove(message_id);
            !docs.is_empty()
        });
        self.sender_postings.retain(|_, docs| {
            docs.remove(message_id);
            !docs.is_empty()
        });
    }

    fn score(&self, query: &str) -> Vec<(String, f64)> {
        let tokens = tokenize(query);
        if tokens.is_empty() {
            return Vec::new();
        }

        let mut scores: HashMap<String, f64> = HashMap::new();
        let accumulate =
            |postings: &HashMap<String, HashMap<String, usize>>, boost: f64, scores: &mut HashMap<String, f64>| {
                for token in &tokens {
                    for (term, docs) in postings {
                        let weight = if term == token {
                            1.0
                        } else if term.starts_with(token.as_str()) {
                            PREFIX_WEIGHT
                        } else {
                            continue;
                        };
                        for (doc, tf) in docs {
                            *scores.entry(doc.clone()).or_insert(0.0) +=
                                boost * weight * *tf as f64;
                        }
                    }
                }
            };

        accumulate(&self.content_postings, CONTENT_BOOST, &mut scores);
        accumulate(&self.sender_postings, 1.0, &mut scores);

        let mut ranked: Vec<(String, f64)> = scores.into_iter().collect();
        ranked.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
        ranked
    }
}

/// Per-scope inverted indices over the message store.
pub struct SearchIndex {
    indices: RwLock<HashMap<String, ScopeIndex>>,
    initialized: AtomicBool,
}

impl Default for SearchIndex {
    fn default() -> Self {
        Self::new()
    }
}

impl SearchIndex {
    /// Create an empty, unbuilt index set.
    pub fn new() -> Self {
        Self {
            indices: RwLock::new(HashMap::new()),
            initialized: AtomicBool::new(false),
        }
    }

    /// Build every scope index from the store.
    ///
    /// Idempotent: the second and later calls are no-ops. Per-scope build
    /// failures are logged and skipped — a space that fails to index must
    /// not take the rest of search down with it.
    pub fn initialize(&self, database: &Database) -> Result<()> {
        if self.initialized.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        let mut indices = HashMap::new();

        match database.get_spaces() {
            Ok(spaces) => {
                for space in spaces {
                    let mut index = ScopeIndex::default();
                    match database.get_all_space_messages(&space.space_id) {
                        Ok(messages) => {
                            for message in &messages {
                                index.add(message);
                            }
                            indices.insert(format!("space:{}", space.space_id), index);
                        }
                        Err(e) => {
                            tracing::warn!("Failed to index space {}: {}", space.space_id, e);
                        }
                    }
                }
            }
            Err(e) => tracing::warn!("Failed to list spaces for indexing: {}", e),
        }

        match database.get_conversations(ConversationType::Direct, None, 1000) {
            Ok((conversations, _)) => {
                for conversation in conversations {
                    let mut index = ScopeIndex::default();
                    match database.get_direct_messages(&conversation.conversation_id) {
                        Ok(messages) => {
                            for message in &messages {
                                index.add(message);
                            }
                            indices.insert(format!("dm:{}", conversation.conversation_id), index);
                        }
                        Err(e) => {
                            tracing::warn!(
                                "Failed to index conversation {}: {}",
                                conversation.conversation_id,
                                e
                            );
                        }
                    }
                }
            }
            Err(e) => tracing::warn!("Failed to list conversations for indexing: {}", e),
        }

        let built = indices.len();
        *self.indices.write() = indices;
        tracing::info!("Search indices built: {} scopes", built);
        Ok(())
    }

    /// Incrementally index a single message.
    ///
    /// Safe to call before [`Self::initialize`]: a scope whose index has
    /// not been built yet is simply skipped.
    pub fn add_message_to_index(&self, message: &Message) {
        let mut indices = self.indices.write();

        if let Some(index) = indices.get_mut(&format!("space:{}", message.space_id)) {
            index.add(message);
        }
        if let Some(index) = indices.get_mut(&format!("dm:{}", message.conversation_id())) {
            index.add(message);
        }
    }

    /// Incrementally remove a single message.
    pub fn remove_message_from_index(&self, message_id: &str, space_id: &str, channel_id: &str) {
        let mut indices = self.indices.write();

        if let Some(index) = indices.get_mut(&format!("space:{}", space_id)) {
            index.remove(message_id);
        }
        let conversation_id = crate::messaging::conversation_id(space_id, channel_id);
        if let Some(index) = indices.get_mut(&format!("dm:{}", conversation_id)) {
            index.remove(message_id);
        }
    }

    /// Search one scope, ranked by relevance.
    ///
    /// Hits are joined back to the full message through the store; a hit
    /// whose message can no longer be found is dropped, not an error.
    pub fn search(
        &self,
        database: &Database,
        query: &str,
        scope: &SearchScope,
        limit: usize,
    ) -> Result<Vec<SearchResult>> {
        if !self.initialized.load(Ordering::SeqCst) {
            self.initialize(database)?;
        }

        let ranked = {
            let indices = self.indices.read();
            let Some(index) = indices.get(&scope.key()) else {
                return Ok(Vec::new());
            };
            let mut ranked = Vec::new();
            for (message_id, score) in index.score(query) {
                if let Some(doc) = index.docs.get(&message_id) {
                    ranked.push((message_id, doc.clone(), score));
                }
            }
            ranked
        };

        let mut results = Vec::new();
        for (message_id, doc, score) in ranked {
            if results.len() >= limit {
                break;
            }
            match database.get_message(&doc.space_id, &doc.channel_id, &message_id) {
                Ok(Some(message)) => results.push(SearchResult { message, score }),
                Ok(None) => {
                    tracing::debug!("Dropping stale search hit {}", message_id);
                }
                Err(e) => {
                    tracing::warn!("Failed to resolve search hit {}: {}", message_id, e);
                }
            }
        }

        Ok(results)
    }
}

// The index observes store commits to stay consistent. Both callbacks are
// infallible by contract; indexing problems stay inside the index.
impl StoreObserver for SearchIndex {
    fn message_saved(&self, message: &Message) {
        self.add_message_to_index(message);
    }

    fn message_deleted(&self, message_id: &str, space_id: &str, channel_id: &str) {
        self.remove_message_from_index(message_id, space_id, channel_id);
    }
}

// ============================================================================
// TESTS
// ============================================================================
