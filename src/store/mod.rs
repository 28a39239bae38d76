//! Chat data model and the store trait.
//!
//! The store is the single mutable source of truth. Rendered view state is a
//! disposable projection of it; when a write fails, callers reload from the
//! store rather than trusting in-memory state.

pub mod sqlite;
pub mod transfer;

use std::collections::{HashMap, HashSet};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::config::Settings;
use crate::error::ChatError;
use crate::persona::Persona;

/// Hidden-message payload signalling "user skipped their turn". Shared by the
/// skip action and the turn-resolution filter; must never change once chats
/// containing it exist.
pub const SKIP_TURN_MARKER: &str = "[[skip-turn]]";

/// The user's slot in an RPG turn order.
pub const USER_SLOT: &str = "user";

pub const MIN_GROUP_PARTICIPANTS: usize = 2;
pub const MAX_GROUP_PARTICIPANTS: usize = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Model,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Attachment {
    pub name: String,
    pub mime_type: String,
    /// Base64-encoded payload.
    pub data: String,
}

impl Attachment {
    pub fn from_bytes(
        name: impl Into<String>,
        mime_type: impl Into<String>,
        bytes: &[u8],
    ) -> Self {
        use base64::Engine;
        Self {
            name: name.into(),
            mime_type: mime_type.into(),
            data: base64::engine::general_purpose::STANDARD.encode(bytes),
        }
    }

    pub fn bytes(&self) -> Result<Vec<u8>, ChatError> {
        use base64::Engine;
        base64::engine::general_purpose::STANDARD
            .decode(&self.data)
            .map_err(|e| ChatError::Config(format!("attachment {} is not valid base64: {}", self.name, e)))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessagePart {
    pub text: String,
    #[serde(default)]
    pub attachments: Vec<Attachment>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GeneratedImage {
    pub mime_type: String,
    /// Base64-encoded payload.
    pub data: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    pub role: Role,
    pub parts: Vec<MessagePart>,
    /// Absent on messages authored by the human user.
    #[serde(default)]
    pub persona_id: Option<String>,
    /// Present only in RPG group chats; groups messages of one turn cycle.
    #[serde(default)]
    pub round_index: Option<u32>,
    /// Structural markers (e.g. the skip sentinel). Excluded from rendering,
    /// included in turn-resolution bookkeeping.
    #[serde(default)]
    pub hidden: bool,
    #[serde(default)]
    pub thinking: Option<String>,
    #[serde(default)]
    pub generated_images: Vec<GeneratedImage>,
    #[serde(default)]
    pub grounding_html: Option<String>,
    #[serde(default)]
    pub created_at: u64,
}

impl Message {
    pub fn user(text: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            parts: vec![MessagePart {
                text: text.into(),
                attachments: Vec::new(),
            }],
            persona_id: None,
            round_index: None,
            hidden: false,
            thinking: None,
            generated_images: Vec::new(),
            grounding_html: None,
            created_at: crate::utils::now_millis(),
        }
    }

    pub fn model(persona_id: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            role: Role::Model,
            parts: vec![MessagePart {
                text: text.into(),
                attachments: Vec::new(),
            }],
            persona_id: Some(persona_id.into()),
            round_index: None,
            hidden: false,
            thinking: None,
            generated_images: Vec::new(),
            grounding_html: None,
            created_at: crate::utils::now_millis(),
        }
    }

    pub fn with_round(mut self, round: u32) -> Self {
        self.round_index = Some(round);
        self
    }

    /// Concatenated text of all parts.
    pub fn text(&self) -> String {
        if self.parts.len() == 1 {
            return self.parts[0].text.clone();
        }
        self.parts
            .iter()
            .map(|p| p.text.as_str())
            .collect::<Vec<_>>()
            .join("\n")
    }

    /// Speaker slot for turn bookkeeping: `"user"` when no persona authored it.
    pub fn speaker(&self) -> &str {
        self.persona_id.as_deref().unwrap_or(USER_SLOT)
    }

    pub fn is_skip_marker(&self) -> bool {
        self.hidden && self.role == Role::User && self.text() == SKIP_TURN_MARKER
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GroupMode {
    Dynamic,
    Rpg,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RpgConfig {
    /// Permutation of `participant_ids` plus the user slot. Empty means
    /// "derive from the participant list".
    #[serde(default)]
    pub turn_order: Vec<String>,
    #[serde(default)]
    pub scenario_prompt: Option<String>,
    #[serde(default)]
    pub narrator_enabled: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DynamicConfig {
    /// Per-participant soft cap on consecutive replies; a capped participant
    /// is skipped by heuristic selection until someone else speaks.
    #[serde(default)]
    pub max_message_guard_by_id: HashMap<String, u32>,
    /// Whether @mentions may force a specific participant.
    #[serde(default)]
    pub allow_pings: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GroupChatConfig {
    pub mode: GroupMode,
    pub participant_ids: Vec<String>,
    #[serde(default)]
    pub rpg: Option<RpgConfig>,
    #[serde(default)]
    pub dynamic: Option<DynamicConfig>,
}

impl GroupChatConfig {
    /// Stored turn order if non-empty, else participants followed by the user.
    pub fn effective_turn_order(&self) -> Vec<String> {
        if let Some(rpg) = &self.rpg {
            if !rpg.turn_order.is_empty() {
                return rpg.turn_order.clone();
            }
        }
        let mut order = self.participant_ids.clone();
        order.push(USER_SLOT.to_string());
        order
    }

    pub fn validate(&self) -> Result<(), ChatError> {
        let unique: HashSet<&String> = self.participant_ids.iter().collect();
        if unique.len() != self.participant_ids.len() {
            return Err(ChatError::Config(
                "group participants must be unique".to_string(),
            ));
        }
        if self.participant_ids.len() < MIN_GROUP_PARTICIPANTS
            || self.participant_ids.len() > MAX_GROUP_PARTICIPANTS
        {
            return Err(ChatError::Config(format!(
                "group chats take {}-{} participants, got {}",
                MIN_GROUP_PARTICIPANTS,
                MAX_GROUP_PARTICIPANTS,
                self.participant_ids.len()
            )));
        }
        if self.participant_ids.iter().any(|id| id == USER_SLOT) {
            return Err(ChatError::Config(
                "the user slot is implicit and cannot be a participant id".to_string(),
            ));
        }

        if let Some(rpg) = &self.rpg {
            if !rpg.turn_order.is_empty() {
                let user_slots = rpg.turn_order.iter().filter(|s| *s == USER_SLOT).count();
                if user_slots != 1 {
                    return Err(ChatError::Config(format!(
                        "turn order must contain the user exactly once, found {}",
                        user_slots
                    )));
                }
                let mut expected: HashSet<&str> =
                    self.participant_ids.iter().map(|s| s.as_str()).collect();
                expected.insert(USER_SLOT);
                let actual: HashSet<&str> = rpg.turn_order.iter().map(|s| s.as_str()).collect();
                if actual != expected || rpg.turn_order.len() != expected.len() {
                    return Err(ChatError::Config(
                        "turn order must be a permutation of participants plus the user"
                            .to_string(),
                    ));
                }
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Chat {
    /// Assigned by the store on creation; empty on not-yet-persisted chats and
    /// stripped on export.
    #[serde(default)]
    pub id: String,
    pub title: String,
    #[serde(default)]
    pub created_at: u64,
    #[serde(default)]
    pub last_modified: Option<u64>,
    /// Append-only; array position is the canonical message address.
    #[serde(default)]
    pub messages: Vec<Message>,
    /// Persona pinned for plain 1:1 chats. Group chats carry `group` instead.
    #[serde(default)]
    pub persona_id: Option<String>,
    #[serde(default)]
    pub group: Option<GroupChatConfig>,
}

impl Chat {
    pub fn new(title: impl Into<String>) -> Self {
        Self {
            id: String::new(),
            title: title.into(),
            created_at: crate::utils::now_millis(),
            last_modified: None,
            messages: Vec::new(),
            persona_id: None,
            group: None,
        }
    }

    pub fn with_group(mut self, group: GroupChatConfig) -> Self {
        self.group = Some(group);
        self
    }

    pub fn max_round_index(&self) -> u32 {
        self.messages
            .iter()
            .filter_map(|m| m.round_index)
            .max()
            .unwrap_or(0)
    }

    pub fn validate(&self) -> Result<(), ChatError> {
        if let Some(group) = &self.group {
            group.validate()?;
        }
        Ok(())
    }
}

/// Persistence contract. Chats are written whole (`put_chat` overwrites by id);
/// ordering of appends is the caller's responsibility — never issue the write
/// for message N+1 before the write for message N has resolved.
#[async_trait]
pub trait ChatStore: Send + Sync {
    async fn create_chat(&self, chat: Chat) -> Result<String, ChatError>;
    async fn get_chat(&self, id: &str) -> Result<Option<Chat>, ChatError>;
    async fn put_chat(&self, chat: &Chat) -> Result<(), ChatError>;
    /// Sorted most-recently-modified first. A derived view; message order
    /// inside each chat is untouched.
    async fn list_chats(&self) -> Result<Vec<Chat>, ChatError>;
    async fn delete_chat(&self, id: &str) -> Result<(), ChatError>;

    async fn put_persona(&self, persona: &Persona) -> Result<(), ChatError>;
    async fn get_persona(&self, id: &str) -> Result<Option<Persona>, ChatError>;
    async fn list_personas(&self) -> Result<Vec<Persona>, ChatError>;
    async fn delete_persona(&self, id: &str) -> Result<(), ChatError>;

    async fn read_settings(&self) -> Result<Settings, ChatError>;
    async fn write_settings(&self, settings: &Settings) -> Result<(), ChatError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rpg_config(order: &[&str]) -> GroupChatConfig {
        GroupChatConfig {
            mode: GroupMode::Rpg,
            participant_ids: vec!["a".to_string(), "b".to_string()],
            rpg: Some(RpgConfig {
                turn_order: order.iter().map(|s| s.to_string()).collect(),
                scenario_prompt: None,
                narrator_enabled: false,
            }),
            dynamic: None,
        }
    }

    #[test]
    fn effective_order_falls_back_to_participants_plus_user() {
        let config = rpg_config(&[]);
        assert_eq!(config.effective_turn_order(), vec!["a", "b", "user"]);
    }

    #[test]
    fn stored_order_wins_when_present() {
        let config = rpg_config(&["b", "user", "a"]);
        assert_eq!(config.effective_turn_order(), vec!["b", "user", "a"]);
    }

    #[test]
    fn validate_rejects_missing_user_slot() {
        let config = rpg_config(&["a", "b"]);
        assert!(matches!(config.validate(), Err(ChatError::Config(_))));
    }

    #[test]
    fn validate_rejects_duplicate_user_slot() {
        let config = rpg_config(&["a", "user", "b", "user"]);
        assert!(matches!(config.validate(), Err(ChatError::Config(_))));
    }

    #[test]
    fn validate_rejects_stranger_in_turn_order() {
        let config = rpg_config(&["a", "c", "user"]);
        assert!(matches!(config.validate(), Err(ChatError::Config(_))));
    }

    #[test]
    fn validate_rejects_too_many_participants() {
        let config = GroupChatConfig {
            mode: GroupMode::Dynamic,
            participant_ids: (0..6).map(|i| format!("p{}", i)).collect(),
            rpg: None,
            dynamic: None,
        };
        assert!(matches!(config.validate(), Err(ChatError::Config(_))));
    }

    #[test]
    fn skip_marker_detection_requires_hidden_user_exact_text() {
        let mut m = Message::user(SKIP_TURN_MARKER);
        assert!(!m.is_skip_marker());
        m.hidden = true;
        assert!(m.is_skip_marker());
        let mut other = Message::user("not a skip");
        other.hidden = true;
        assert!(!other.is_skip_marker());
    }

    #[test]
    fn message_speaker_defaults_to_user_slot() {
        assert_eq!(Message::user("hi").speaker(), "user");
        assert_eq!(Message::model("p1", "hello").speaker(), "p1");
    }
}
