//! # Encryption-State Diagnostics
//!
//! Read-only analysis of stored ratchet sessions.
//!
//! Ratchet state grows when a peer's messages keep arriving out of order:
//! the skipped-key map and per-peer sub-states accumulate until the
//! serialized blob reaches hundreds of kilobytes and every save/load pays
//! for it. The scan classifies each state by serialized size and, for
//! bloated entries only, introspects the opaque JSON for the map sizes that
//! usually explain the growth. Bloat is diagnosed here, never auto-repaired;
//! cleanup is a deliberate manual call to
//! [`Database::delete_encryption_states`](super::Database::delete_encryption_states).

use serde::Serialize;

use super::database::Database;
use crate::error::Result;

/// A state larger than this is classified as bloated (100 KB).
pub const BLOAT_THRESHOLD_BYTES: usize = 100 * 1024;

/// Structural measurements of a bloated state blob.
#[derive(Debug, Clone, Default, Serialize, PartialEq, Eq)]
pub struct StateIntrospection {
    /// Total entries across skipped-message-key maps
    pub skipped_key_entries: usize,
    /// Total entries across peer-state maps
    pub peer_entries: usize,
}

/// One bloated state found by the scan.
#[derive(Debug, Clone, Serialize)]
pub struct BloatedState {
    /// Owning conversation
    pub conversation_id: String,
    /// Inbox within the conversation
    pub inbox_id: String,
    /// Serialized size of the state blob
    pub size_bytes: usize,
    /// Map sizes parsed out of the blob; None when the blob is not JSON
    pub introspection: Option<StateIntrospection>,
}

/// Result of a full encryption-state scan.
#[derive(Debug, Clone, Default, Serialize)]
pub struct EncryptionStateReport {
    /// States examined
    pub total: usize,
    /// States at or under the threshold
    pub healthy: usize,
    /// States over the threshold
    pub bloated: usize,
    /// Sum of serialized sizes across all states
    pub total_bytes: usize,
    /// Per-state findings, bloated entries only
    pub bloated_states: Vec<BloatedState>,
}

/// Recursively totals the entry counts of maps whose key names match the
/// given fragment. The ratchet blob is opaque, so this is a shape-agnostic
/// walk rather than a schema.
fn count_map_entries(value: &serde_json::Value, key_fragment: &str) -> usize {
    match value {
        serde_json::Value::Object(map) => {
            let mut count = 0;
            for (key, child) in map {
                if key.to_ascii_lowercase().contains(key_fragment) {
                    count += match child {
                        serde_json::Value::Object(inner) => inner.len(),
                        serde_json::Value::Array(inner) => inner.len(),
                        _ => 0,
                    };
                }
                count += count_map_entries(child, key_fragment);
            }
            count
        }
        serde_json::Value::Array(items) => {
            items.iter().map(|v| count_map_entries(v, key_fragment)).sum()
        }
        _ => 0,
    }
}

fn introspect(state_blob: &str) -> Option<StateIntrospection> {
    let value: serde_json::Value = serde_json::from_str(state_blob).ok()?;
    Some(StateIntrospection {
        skipped_key_entries: count_map_entries(&value, "skipped"),
        peer_entries: count_map_entries(&value, "peer"),
    })
}

impl Database {
    /// Scan every stored encryption state and classify it by serialized
    /// size.
    ///
    /// Structural introspection runs for bloated entries only, so the cost
    /// of the scan stays proportional to the number of states rather than
    /// their total size.
    pub fn analyze_encryption_states(&self) -> Result<EncryptionStateReport> {
        let states = self.get_all_encryption_states()?;

        let mut report = EncryptionStateReport {
            total: states.len(),
            ..Default::default()
        };

        for state in &states {
            let size = state.state.len();
            report.total_bytes += size;

            if size > BLOAT_THRESHOLD_BYTES {
                report.bloated += 1;
                let introspection = introspect(&state.state);
                tracing::warn!(
                    "Bloated encryption state: {}/{} ({} KB)",
                    state.conversation_id,
                    state.inbox_id,
                    size / 1024
                );
                report.bloated_states.push(BloatedState {
                    conversation_id: state.conversation_id.clone(),
                    inbox_id: state.inbox_id.clone(),
                    size_bytes: size,
                    introspection,
                });
            } else {
                report.healthy += 1;
            }
        }

        tracing::info!(
            "Encryption state scan: {} total, {} bloated, {} KB overall",
            report.total,
            report.bloated,
            report.total_bytes / 1024
        );

        Ok(report)
    }
}

// ============================================================================
// TESTS
// ============================================================================
