//! # Spaces Module
//!
//! Domain types for spaces: persistent group containers aggregating named
//! groups of channels, roles, emoji/sticker sets and privacy flags.
//!
//! A channel belongs to exactly one group, and a space's `defaultChannelId`
//! must always resolve to an existing channel — [`Space::validate`] enforces
//! this and every store write goes through it.

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// A permission grantable through a role.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum Permission {
    /// Delete other members' messages
    #[serde(rename = "message:delete")]
    MessageDelete,
    /// Pin messages
    #[serde(rename = "message:pin")]
    MessagePin,
    /// Use @everyone
    #[serde(rename = "mention:everyone")]
    MentionEveryone,
    /// Mute members
    #[serde(rename = "user:mute")]
    UserMute,
}

/// A named role with members and permissions.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Role {
    /// Role id
    pub role_id: String,
    /// Display name
    pub display_name: String,
    /// Short tag shown next to member names
    pub role_tag: String,
    /// Display color
    pub color: String,
    /// Member addresses holding this role
    pub members: Vec<String>,
    /// Permissions granted by this role
    pub permissions: Vec<Permission>,
}

/// A custom emoji registered in a space.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Emoji {
    /// Display name
    pub name: String,
    /// Emoji id
    pub id: String,
    /// Image URL
    pub img_url: String,
}

/// A custom sticker registered in a space.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Sticker {
    /// Display name
    pub name: String,
    /// Sticker id
    pub id: String,
    /// Image URL
    pub img_url: String,
}

/// A named sub-conversation within a space.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Channel {
    /// Channel id
    pub channel_id: String,
    /// Owning space id
    pub space_id: String,
    /// Display name
    pub channel_name: String,
    /// Topic line
    pub channel_topic: String,
    /// Creation timestamp (ms)
    pub created_date: i64,
    /// Last modification timestamp (ms)
    pub modified_date: i64,
    /// Whether only managers may post
    #[serde(skip_serializing_if = "Option::is_none")]
    pub is_read_only: Option<bool>,
    /// Whether the channel is pinned to the top of its group
    #[serde(skip_serializing_if = "Option::is_none")]
    pub is_pinned: Option<bool>,
    /// When the channel was pinned, for stack ordering
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pinned_at: Option<i64>,
}

/// A named group of channels. Channels belong to exactly one group.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Group {
    /// Group display name
    pub group_name: String,
    /// Channels in this group
    pub channels: Vec<Channel>,
    /// Optional icon name
    #[serde(skip_serializing_if = "Option::is_none")]
    pub icon: Option<String>,
}

/// A persistent group container with named channel groups, roles, and
/// privacy settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Space {
    /// Space id (content address)
    pub space_id: String,
    /// Display name
    pub space_name: String,
    /// Description shown on the invite page
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Vanity URL slug
    pub vanity_url: String,
    /// Invite URL
    pub invite_url: String,
    /// Icon URL
    pub icon_url: String,
    /// Banner URL
    pub banner_url: String,
    /// The channel opened when entering the space; must exist in `groups`
    pub default_channel_id: String,
    /// Hub address serving this space
    pub hub_address: String,
    /// Creation timestamp (ms)
    pub created_date: i64,
    /// Last modification timestamp (ms)
    pub modified_date: i64,
    /// Whether messages are repudiable (no signatures kept)
    pub is_repudiable: bool,
    /// Whether the space is publicly joinable
    pub is_public: bool,
    /// Channel groups
    pub groups: Vec<Group>,
    /// Roles
    pub roles: Vec<Role>,
    /// Custom emoji set
    pub emojis: Vec<Emoji>,
    /// Custom sticker set
    pub stickers: Vec<Sticker>,
}

impl Space {
    /// All channel ids across every group, in declaration order.
    pub fn channel_ids(&self) -> Vec<String> {
        self.groups
            .iter()
            .flat_map(|g| g.channels.iter().map(|c| c.channel_id.clone()))
            .collect()
    }

    /// Look up a channel anywhere in the space.
    pub fn find_channel(&self, channel_id: &str) -> Option<&Channel> {
        self.groups
            .iter()
            .flat_map(|g| g.channels.iter())
            .find(|c| c.channel_id == channel_id)
    }

    /// Check structural invariants before persisting.
    ///
    /// The default channel must resolve to an existing channel; a space
    /// with no channels at all is equally unusable.
    pub fn validate(&self) -> Result<()> {
        if self.groups.iter().all(|g| g.channels.is_empty()) {
            return Err(Error::InvalidSpace(format!(
                "space {} has no channels",
                self.space_id
            )));
        }
        if self.find_channel(&self.default_channel_id).is_none() {
            return Err(Error::InvalidSpace(format!(
                "default channel {} does not exist in space {}",
                self.default_channel_id, self.space_id
            )));
        }
        Ok(())
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn test_space() -> Space {
        Space {
            space_id: "space-1".into(),
            space_name: "Test Space".into(),
            description: None,
            vanity_url: "test".into(),
            invite_url: "https://example.com/invite/test".into(),
            icon_url: String::new(),
            banner_url: String::new(),
            default_channel_id: "chan-general".into(),
            hub_address: "hub-1".into(),
            created_date: 1_700_000_000_000,
            modified_date: 1_700_000_000_000,
            is_repudiable: false,
            is_public: true,
            groups: vec![Group {
                group_name: "Text".into(),
                channels: vec![
                    Channel {
                        channel_id: "chan-general".into(),
                        space_id: "space-1".into(),
                        channel_name: "general".into(),
                        channel_topic: String::new(),
                        created_date: 1_700_000_000_000,
                        modified_date: 1_700_000_000_000,
                        is_read_only: None,
                        is_pinned: None,
                        pinned_at: None,
                    },
                    Channel {
                        channel_id: "chan-random".into(),
                        space_id: "space-1".into(),
                        channel_name: "random".into(),
                        channel_topic: String::new(),
                        created_date: 1_700_000_000_000,
                        modified_date: 1_700_000_000_000,
                        is_read_only: None,
                        is_pinned: None,
                        pinned_at: None,
                    },
                ],
                icon: None,
            }],
            roles: vec![],
            emojis: vec![],
            stickers: vec![],
        }
    }

    #[test]
    fn test_channel_ids_flattened() {
        let space = test_space();
        assert_eq!(space.channel_ids(), vec!["chan-general", "chan-random"]);
    }

    #[test]
    fn test_validate_ok() {
        assert!(test_space().validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_dangling_default_channel() {
        let mut space = test_space();
        space.default_channel_id = "chan-missing".into();
        let err = space.validate().unwrap_err();
        assert!(matches!(err, Error::InvalidSpace(_)));
    }

    #[test]
    fn test_validate_rejects_empty_space() {
        let mut space = test_space();
        space.groups[0].channels.clear();
        assert!(space.validate().is_err());
    }

    #[test]
    fn test_permission_wire_names() {
        let json = serde_json::to_string(&Permission::MessageDelete).unwrap();
        assert_eq!(json, r#""message:delete""#);
    }
}
