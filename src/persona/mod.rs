//! Persona records and the directory that resolves them.
//!
//! Two sentinel ids never hit the store: `"-1"` is the built-in default
//! persona, `"__narrator__"` is the RPG narrative voice. Everything else is a
//! user-created persona persisted through the chat store.

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::error::ChatError;
use crate::store::ChatStore;
use crate::utils::now_millis;

/// Built-in default persona; always resolvable, never stored.
pub const DEFAULT_PERSONA_ID: &str = "-1";

/// Non-participant narrative voice for RPG group chats. Narrator messages are
/// transparent to turn rotation.
pub const NARRATOR_PERSONA_ID: &str = "__narrator__";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToneExample {
    pub user: String,
    pub reply: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Persona {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub image: Option<String>,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub prompt: String,
    /// Behavioral trait bands, 0-3. The band-to-instruction mapping lives in
    /// the prompt builder and is a fixed content contract.
    #[serde(default)]
    pub aggressiveness: u8,
    #[serde(default)]
    pub sensuality: u8,
    #[serde(default)]
    pub independence: u8,
    #[serde(default)]
    pub nsfw: bool,
    #[serde(default)]
    pub internet_enabled: bool,
    #[serde(default)]
    pub roleplay_enabled: bool,
    #[serde(default)]
    pub tone_examples: Vec<ToneExample>,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub category: Option<String>,
    #[serde(default)]
    pub created_at: u64,
    #[serde(default)]
    pub updated_at: u64,
}

pub fn default_persona() -> Persona {
    let now = now_millis();
    Persona {
        id: DEFAULT_PERSONA_ID.to_string(),
        name: "Assistant".to_string(),
        image: None,
        description: "A helpful, grounded conversational partner.".to_string(),
        prompt: "You are a helpful assistant. Answer plainly and stay on topic.".to_string(),
        aggressiveness: 0,
        sensuality: 0,
        independence: 1,
        nsfw: false,
        internet_enabled: false,
        roleplay_enabled: false,
        tone_examples: Vec::new(),
        tags: Vec::new(),
        category: None,
        created_at: now,
        updated_at: now,
    }
}

pub fn narrator_persona() -> Persona {
    let now = now_millis();
    Persona {
        id: NARRATOR_PERSONA_ID.to_string(),
        name: "Narrator".to_string(),
        image: None,
        description: "Omniscient narrative voice describing the scene.".to_string(),
        prompt: "You are the narrator. Describe scenes and consequences in third person. \
                 Never speak for the user's character and never take a turn in the conversation."
            .to_string(),
        aggressiveness: 0,
        sensuality: 0,
        independence: 0,
        nsfw: false,
        internet_enabled: false,
        roleplay_enabled: true,
        tone_examples: Vec::new(),
        tags: Vec::new(),
        category: None,
        created_at: now,
        updated_at: now,
    }
}

/// Resolves persona ids to full records, short-circuiting the sentinels.
#[derive(Clone)]
pub struct PersonaDirectory {
    store: Arc<dyn ChatStore>,
}

impl PersonaDirectory {
    pub fn new(store: Arc<dyn ChatStore>) -> Self {
        Self { store }
    }

    pub async fn resolve(&self, id: &str) -> Result<Persona, ChatError> {
        match id {
            DEFAULT_PERSONA_ID => Ok(default_persona()),
            NARRATOR_PERSONA_ID => Ok(narrator_persona()),
            _ => self
                .store
                .get_persona(id)
                .await?
                .ok_or_else(|| ChatError::Config(format!("persona {} not found", id))),
        }
    }

    /// Like `resolve`, but stale ids degrade to `None` instead of an error.
    /// Used by rendering and dynamic selection, where a deleted participant
    /// must not take the session down.
    pub async fn resolve_opt(&self, id: &str) -> Option<Persona> {
        match id {
            DEFAULT_PERSONA_ID => Some(default_persona()),
            NARRATOR_PERSONA_ID => Some(narrator_persona()),
            _ => self.store.get_persona(id).await.ok().flatten(),
        }
    }
}
