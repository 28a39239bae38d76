//! Headless core of a multi-persona AI chat client.
//!
//! - `store`: chat/message/group data model, the `ChatStore` trait, and a
//!   SQLite implementation. Single source of truth.
//! - `persona`: persona records and sentinel-aware resolution.
//! - `group`: RPG turn rotation, dynamic speaker selection, auto-advance.
//! - `view`: transcript pagination with round-block grouping.
//! - `pipeline`: the send/skip/regenerate exchange with streaming merge.
//! - `model`: the model-invocation seam and abort registry.
//!
//! The UI, provider wire protocols, auth, and billing all live outside this
//! crate; they plug in through `ChatStore`, `ModelClient`, `StreamObserver`,
//! and the event emitter.

pub mod config;
pub mod error;
pub mod events;
pub mod group;
pub mod model;
pub mod persona;
pub mod pipeline;
pub mod store;
pub mod utils;
pub mod view;

pub use config::Settings;
pub use error::ChatError;
pub use events::{ChatEvent, ChatEventListener, EventEmitter};
pub use group::turns::{resolve_turn, Speaker, TurnResolution};
pub use model::{FinishReason, GenerationConfig, ModelClient, ModelContext, StreamEvent};
pub use persona::{Persona, PersonaDirectory, DEFAULT_PERSONA_ID, NARRATOR_PERSONA_ID};
pub use pipeline::{ChatPipeline, GenerationState, MessageDraft, SendOutcome, StreamObserver};
pub use store::sqlite::SqliteChatStore;
pub use store::{
    Chat, ChatStore, GroupChatConfig, GroupMode, Message, Role, SKIP_TURN_MARKER,
};
pub use view::{ChatView, DefaultRenderer, LoadOutcome, MessageRenderer, RoundBlock, PAGE_SIZE};
