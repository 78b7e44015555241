//! # Encrypted Backup
//!
//! Export and import of direct-conversation data as an encrypted file.
//!
//! ## File Format
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                        BACKUP FILE (.qmbak)                             │
//! ├─────────────────────────────────────────────────────────────────────────┤
//! │                                                                         │
//! │  {                                                                      │
//! │    "version": 1,                                                        │
//! │    "iv": "<hex>",            12-byte AES-GCM IV                         │
//! │    "ciphertext": "<hex>",    AES-256-GCM over the payload JSON          │
//! │    "createdAt": 1712345678901                                           │
//! │  }                                                                      │
//! │                                                                         │
//! │  Payload (after decryption):                                            │
//! │  { "messages": [...], "conversations": [...],                           │
//! │    "encryption_states": [...], "user_config": {...}? }                  │
//! │                                                                         │
//! │  Key derivation (domain separated):                                     │
//! │  SHA-512("quorum-backup-v1" || user_private_key_bytes)[0..32]           │
//! │                                                                         │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Import distinguishes a structurally broken file ([`Error::InvalidFormat`])
//! from an authentication failure ([`Error::DecryptionFailed`]) so the UI can
//! tell "corrupt file" apart from "wrong account".

use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Key, Nonce};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha512};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use super::database::{Database, EncryptionState, UserConfig};
use crate::error::{Error, Result};
use crate::messaging::{Conversation, ConversationType, Message};

/// Domain-separation prefix for the backup key
const BACKUP_DOMAIN_PREFIX: &str = "quorum-backup-v1";

/// Supported backup file version
const BACKUP_VERSION: u32 = 1;

/// AES-GCM IV length in bytes
const IV_LEN: usize = 12;

/// The outer, unencrypted backup file structure.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackupFile {
    /// Format version; always 1
    pub version: u32,
    /// Hex-encoded AES-GCM IV
    pub iv: String,
    /// Hex-encoded encrypted payload
    pub ciphertext: String,
    /// Export timestamp (ms)
    #[serde(rename = "createdAt")]
    pub created_at: i64,
}

/// The decrypted backup payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackupPayload {
    /// All direct-conversation messages
    pub messages: Vec<Message>,
    /// All direct conversations
    pub conversations: Vec<Conversation>,
    /// Encryption-state history (export only; skipped on import)
    pub encryption_states: Vec<EncryptionState>,
    /// User config blob (export only; skipped on import)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_config: Option<UserConfig>,
}

/// Counts of rows restored by an import.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ImportSummary {
    /// Messages written (tombstoned and already-present ids skipped)
    pub messages_written: usize,
    /// Conversations written (existing rows preserved)
    pub conversations_written: usize,
}

/// Derives the AES-256 backup key from the user's private key bytes.
///
/// `SHA-512(prefix || private_key)` truncated to 32 bytes; the prefix
/// separates this key from every other derivation over the same material.
fn derive_backup_key(private_key: &[u8]) -> [u8; 32] {
    let mut hasher = Sha512::new();
    hasher.update(BACKUP_DOMAIN_PREFIX.as_bytes());
    hasher.update(private_key);
    let digest = hasher.finalize();

    let mut key = [0u8; 32];
    key.copy_from_slice(&digest[..32]);
    key
}

/// Encrypted backup export/import over the durable store.
pub struct BackupService {
    database: Arc<Database>,
    in_progress: AtomicBool,
}

/// Clears the in-progress flag when an operation unwinds early.
struct ProgressGuard<'a>(&'a AtomicBool);

impl Drop for ProgressGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

impl BackupService {
    /// Create a new backup service over the store.
    pub fn new(database: Arc<Database>) -> Self {
        Self {
            database,
            in_progress: AtomicBool::new(false),
        }
    }

    fn begin(&self) -> Result<ProgressGuard<'_>> {
        if self
            .in_progress
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Err(Error::BackupInProgress);
        }
        Ok(ProgressGuard(&self.in_progress))
    }

    /// Export all direct-conversation data as an encrypted backup file,
    /// returned as the serialized JSON document.
    pub fn export_backup(&self, user_private_key: &[u8], address: &str) -> Result<String> {
        let _guard = self.begin()?;

        tracing::info!("Starting backup export");

        let payload = BackupPayload {
            messages: self.database.get_all_direct_messages()?,
            conversations: self
                .database
                .get_conversations(ConversationType::Direct, None, 100_000)?
                .0,
            encryption_states: self.database.get_all_encryption_states()?,
            user_config: self.database.get_user_config(address)?,
        };

        tracing::debug!(
            "Collected backup data: {} messages, {} conversations, {} encryption states",
            payload.messages.len(),
            payload.conversations.len(),
            payload.encryption_states.len()
        );

        let key_bytes = derive_backup_key(user_private_key);
        let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&key_bytes));

        let mut iv = [0u8; IV_LEN];
        rand::thread_rng().fill_bytes(&mut iv);

        let plaintext = serde_json::to_vec(&payload)?;
        let ciphertext = cipher
            .encrypt(Nonce::from_slice(&iv), plaintext.as_slice())
            .map_err(|e| Error::EncryptionFailed(e.to_string()))?;

        let file = BackupFile {
            version: BACKUP_VERSION,
            iv: hex::encode(iv),
            ciphertext: hex::encode(ciphertext),
            created_at: crate::time::now_timestamp_millis(),
        };

        tracing::info!("Backup export complete");

        Ok(serde_json::to_string(&file)?)
    }

    /// Validate a raw file as a [`BackupFile`] structure.
    ///
    /// Every structural problem is an [`Error::InvalidFormat`], never a
    /// generic parse failure.
    fn parse_backup_file(raw: &str) -> Result<BackupFile> {
        let value: serde_json::Value = serde_json::from_str(raw)
            .map_err(|_| Error::InvalidFormat("File is not valid JSON".into()))?;

        let obj = value
            .as_object()
            .ok_or_else(|| Error::InvalidFormat("File is not a valid backup".into()))?;

        match obj.get("version").and_then(|v| v.as_u64()) {
            Some(v) if v == BACKUP_VERSION as u64 => {}
            other => {
                return Err(Error::InvalidFormat(format!(
                    "Unknown backup version: {:?}",
                    other
                )))
            }
        }

        let iv = obj
            .get("iv")
            .and_then(|v| v.as_str())
            .ok_or_else(|| Error::InvalidFormat("Backup file is missing required fields".into()))?;
        let ciphertext = obj
            .get("ciphertext")
            .and_then(|v| v.as_str())
            .ok_or_else(|| Error::InvalidFormat("Backup file is missing required fields".into()))?;
        let created_at = obj
            .get("createdAt")
            .and_then(|v| v.as_i64())
            .ok_or_else(|| Error::InvalidFormat("Backup file is missing required fields".into()))?;

        Ok(BackupFile {
            version: BACKUP_VERSION,
            iv: iv.to_string(),
            ciphertext: ciphertext.to_string(),
            created_at,
        })
    }

    /// Import an encrypted backup file.
    ///
    /// Restores messages and conversations only; encryption states and the
    /// user config are skipped since the importing account has live
    /// sessions. Existing conversation rows are preserved, and tombstoned
    /// message ids stay deleted.
    pub fn import_backup(&self, user_private_key: &[u8], file_content: &str) -> Result<ImportSummary> {
        let _guard = self.begin()?;

        tracing::info!("Starting backup import");

        let file = Self::parse_backup_file(file_content)?;

        let iv = hex::decode(&file.iv)
            .map_err(|_| Error::InvalidFormat("IV is not valid hex".into()))?;
        if iv.len() != IV_LEN {
            return Err(Error::InvalidFormat(format!(
                "IV must be {} bytes, got {}",
                IV_LEN,
                iv.len()
            )));
        }
        let ciphertext = hex::decode(&file.ciphertext)
            .map_err(|_| Error::InvalidFormat("Ciphertext is not valid hex".into()))?;

        let key_bytes = derive_backup_key(user_private_key);
        let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&key_bytes));

        let plaintext = cipher
            .decrypt(Nonce::from_slice(&iv), ciphertext.as_slice())
            .map_err(|_| Error::DecryptionFailed("Wrong account or corrupted backup file".into()))?;

        let payload: BackupPayload = serde_json::from_slice(&plaintext)
            .map_err(|_| Error::DecryptionFailed("Decrypted data is not valid JSON".into()))?;

        tracing::debug!(
            "Decrypted backup payload: {} messages, {} conversations",
            payload.messages.len(),
            payload.conversations.len()
        );

        let mut summary = ImportSummary::default();

        for conversation in &payload.conversations {
            if self
                .database
                .get_conversation(&conversation.conversation_id)?
                .is_none()
            {
                self.database.save_conversation(conversation)?;
                summary.conversations_written += 1;
            }
        }

        for message in &payload.messages {
            if self.database.insert_message_if_absent(message)? {
                summary.messages_written += 1;
            }
        }

        tracing::info!(
            "Backup import complete: {} messages, {} conversations",
            summary.messages_written,
            summary.conversations_written
        );

        Ok(summary)
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messaging::{Mentions, MessageContent};

    const TEST_KEY: &[u8] = b"test-private-key-material-57-bytes-long-for-ed448-keys...";

    fn dm_message(id: &str, peer: &str, ts: i64) -> Message {
        Message {
            message_id: id.to_string(),
            space_id: peer.to_string(),
            channel_id: peer.to_string(),
            created_date: ts,
            modified_date: ts,
            nonce: "00".into(),
            digest_algorithm: "sha-256".into(),
            last_modified_hash: String::new(),
            content: MessageContent::Post {
                sender_id: peer.to_string(),
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

    async fn seeded_service() -> (Arc<Database>, BackupService) {
        let db = Arc::new(Database::open(None).await.unwrap());
        for i in 0..3 {
            let msg = dm_message(&format!("m{}", i), "addr-peer", 100 + i);
            db.save_message(&msg, msg.created_date, "addr-peer", ConversationType::Direct, "", "Peer", None)
                .unwrap();
        }
        let service = BackupService::new(db.clone());
        (db, service)
    }

    #[tokio::test]
    async fn test_export_import_roundtrip() {
        let (_db, service) = seeded_service().await;
        let file = service.export_backup(TEST_KEY, "addr-me").unwrap();

        let fresh = Arc::new(Database::open(None).await.unwrap());
        let importer = BackupService::new(fresh.clone());
        let summary = importer.import_backup(TEST_KEY, &file).unwrap();

        assert_eq!(summary.messages_written, 3);
        assert_eq!(summary.conversations_written, 1);
        assert!(fresh.get_message_by_id("m0").unwrap().is_some());
    }

    #[tokio::test]
    async fn test_flipped_ciphertext_byte_is_decryption_failure() {
        let (_db, service) = seeded_service().await;
        let file = service.export_backup(TEST_KEY, "addr-me").unwrap();

        let mut parsed: serde_json::Value = serde_json::from_str(&file).unwrap();
        let ciphertext = parsed["ciphertext"].as_str().unwrap().to_string();
        let mut bytes = hex::decode(&ciphertext).unwrap();
        bytes[0] ^= 0x01;
        parsed["ciphertext"] = serde_json::Value::String(hex::encode(bytes));

        let err = service
            .import_backup(TEST_KEY, &parsed.to_string())
            .unwrap_err();
        assert!(matches!(err, Error::DecryptionFailed(_)));
    }

    #[tokio::test]
    async fn test_wrong_key_is_decryption_failure() {
        let (_db, service) = seeded_service().await;
        let file = service.export_backup(TEST_KEY, "addr-me").unwrap();

        let err = service.import_backup(b"another-key", &file).unwrap_err();
        assert!(matches!(err, Error::DecryptionFailed(_)));
    }

    #[tokio::test]
    async fn test_wrong_version_is_invalid_format() {
        let (_db, service) = seeded_service().await;
        let file = service.export_backup(TEST_KEY, "addr-me").unwrap();

        let mut parsed: serde_json::Value = serde_json::from_str(&file).unwrap();
        parsed["version"] = serde_json::Value::from(2);

        let err = service
            .import_backup(TEST_KEY, &parsed.to_string())
            .unwrap_err();
        assert!(matches!(err, Error::InvalidFormat(_)));
    }

    #[tokio::test]
    async fn test_malformed_hex_is_invalid_format() {
        let (_db, service) = seeded_service().await;
        let file = service.export_backup(TEST_KEY, "addr-me").unwrap();

        let mut parsed: serde_json::Value = serde_json::from_str(&file).unwrap();
        parsed["iv"] = serde_json::Value::String("not-hex!".into());

        let err = service
            .import_backup(TEST_KEY, &parsed.to_string())
            .unwrap_err();
        assert!(matches!(err, Error::InvalidFormat(_)));
    }

    #[tokio::test]
    async fn test_non_json_is_invalid_format() {
        let (_db, service) = seeded_service().await;
        let err = service.import_backup(TEST_KEY, "definitely not json").unwrap_err();
        assert!(matches!(err, Error::InvalidFormat(_)));
    }

    #[tokio::test]
    async fn test_import_skips_tombstoned_messages() {
        let (db, service) = seeded_service().await;
        let file = service.export_backup(TEST_KEY, "addr-me").unwrap();

        // A DM delete leaves no tombstone, so fabricate a channel-style
        // deletion by writing the message as a channel message first.
        let fresh = Arc::new(Database::open(None).await.unwrap());
        let channel_msg = Message {
            space_id: "space-x".into(),
            channel_id: "chan-x".into(),
            ..dm_message("m0", "addr-peer", 100)
        };
        fresh
            .save_message(&channel_msg, 100, "a", ConversationType::Group, "", "", None)
            .unwrap();
        fresh.delete_message("m0").unwrap();

        let importer = BackupService::new(fresh.clone());
        let summary = importer.import_backup(TEST_KEY, &file).unwrap();

        // m0 is tombstoned and stays deleted; m1 and m2 restore
        assert_eq!(summary.messages_written, 2);
        assert!(fresh.get_message_by_id("m0").unwrap().is_none());
        drop(db);
    }

    #[test]
    fn test_key_derivation_is_domain_separated() {
        let a = derive_backup_key(b"key");
        let mut hasher = Sha512::new();
        hasher.update(b"key");
        let undomained = hasher.finalize();
        assert_ne!(&a[..], &undomained[..32]);
        // Deterministic
        assert_eq!(a, derive_backup_key(b"key"));
    }
}
