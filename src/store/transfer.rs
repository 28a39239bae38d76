//! Chat export/import.
//!
//! The wire format is a flat JSON array of chat objects. Store-assigned ids
//! are stripped on export; import always assigns fresh ids, so the same file
//! can be imported twice without collisions.

use std::sync::Arc;

use tracing::info;

use super::{Chat, ChatStore};
use crate::error::ChatError;

/// Serialize chats to the interchange format, ids stripped.
pub fn export_chats(chats: &[Chat]) -> Result<String, ChatError> {
    let mut stripped: Vec<Chat> = chats.to_vec();
    for chat in stripped.iter_mut() {
        chat.id = String::new();
    }
    Ok(serde_json::to_string_pretty(&stripped)?)
}

/// Parse and persist an exported array. Each chat is validated before any
/// insert; a bad document fails the whole import rather than half-applying.
/// Returns the fresh ids in input order.
pub async fn import_chats(
    store: &Arc<dyn ChatStore>,
    json: &str,
) -> Result<Vec<String>, ChatError> {
    let mut chats: Vec<Chat> = serde_json::from_str(json)?;

    for chat in chats.iter() {
        chat.validate()?;
    }

    let mut ids = Vec::with_capacity(chats.len());
    for mut chat in chats.drain(..) {
        chat.id = String::new();
        ids.push(store.create_chat(chat).await?);
    }
    info!(target: "transfer", count = ids.len(), "imported chats");
    Ok(ids)
}
