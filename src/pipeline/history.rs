//! Translation of persisted history into model turns.
//!
//! In a group chat the model only ever "is" one participant: the active
//! persona's messages keep the model role, everyone else's speech (user,
//! other participants, narrator) is presented as labelled user-role turns.

use std::collections::HashMap;

use crate::model::{ModelPart, ModelTurn};
use crate::store::{Message, Role};

const FALLBACK_SPEAKER_LABEL: &str = "Unknown";

fn parts_for(message: &Message, prefix: Option<&str>) -> Vec<ModelPart> {
    let mut parts = Vec::new();
    let text = message.text();
    let labelled = match prefix {
        Some(name) => format!("[{}]: {}", name, text),
        None => text,
    };
    if !labelled.is_empty() {
        parts.push(ModelPart::Text(labelled));
    }
    for part in &message.parts {
        for attachment in &part.attachments {
            parts.push(ModelPart::InlineData {
                mime_type: attachment.mime_type.clone(),
                data: attachment.data.clone(),
            });
        }
    }
    parts
}

/// Convert prior messages into model turns.
///
/// `active_persona_id` is `Some` for group chats (the participant about to
/// speak); `None` for plain 1:1 chats, where roles map directly and no
/// speaker prefixes are added. Hidden messages never reach the model.
pub fn build_history_turns(
    messages: &[Message],
    active_persona_id: Option<&str>,
    labels: &HashMap<String, String>,
    user_label: &str,
) -> Vec<ModelTurn> {
    let mut turns = Vec::new();

    for message in messages {
        if message.hidden {
            continue;
        }

        let (role, prefix) = match (message.role, active_persona_id) {
            (Role::User, None) => (Role::User, None),
            (Role::User, Some(_)) => (Role::User, Some(user_label)),
            (Role::Model, None) => (Role::Model, None),
            (Role::Model, Some(active)) => {
                if message.persona_id.as_deref() == Some(active) {
                    (Role::Model, None)
                } else {
                    let label = message
                        .persona_id
                        .as_deref()
                        .and_then(|id| labels.get(id))
                        .map(|s| s.as_str())
                        .unwrap_or(FALLBACK_SPEAKER_LABEL);
                    (Role::User, Some(label))
                }
            }
        };

        let parts = parts_for(message, prefix);
        if parts.is_empty() {
            continue;
        }
        turns.push(ModelTurn { role, parts });
    }

    turns
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{Attachment, SKIP_TURN_MARKER};

    fn labels() -> HashMap<String, String> {
        let mut map = HashMap::new();
        map.insert("p1".to_string(), "Alice".to_string());
        map.insert("p2".to_string(), "Bob".to_string());
        map
    }

    #[test]
    fn one_to_one_roles_map_directly_without_prefixes() {
        let messages = vec![Message::user("hi"), Message::model("p1", "hello")];
        let turns = build_history_turns(&messages, None, &labels(), "You");
        assert_eq!(turns.len(), 2);
        assert_eq!(turns[0].role, Role::User);
        assert_eq!(turns[0].parts, vec![ModelPart::Text("hi".to_string())]);
        assert_eq!(turns[1].role, Role::Model);
        assert_eq!(turns[1].parts, vec![ModelPart::Text("hello".to_string())]);
    }

    #[test]
    fn group_history_keeps_only_the_active_persona_as_model() {
        let messages = vec![
            Message::user("onward"),
            Message::model("p1", "I scout ahead"),
            Message::model("p2", "I guard the rear"),
        ];
        let turns = build_history_turns(&messages, Some("p2"), &labels(), "You");

        assert_eq!(turns[0].role, Role::User);
        assert_eq!(
            turns[0].parts,
            vec![ModelPart::Text("[You]: onward".to_string())]
        );
        assert_eq!(turns[1].role, Role::User);
        assert_eq!(
            turns[1].parts,
            vec![ModelPart::Text("[Alice]: I scout ahead".to_string())]
        );
        assert_eq!(turns[2].role, Role::Model);
        assert_eq!(
            turns[2].parts,
            vec![ModelPart::Text("I guard the rear".to_string())]
        );
    }

    #[test]
    fn unknown_speakers_get_a_fallback_label() {
        let messages = vec![Message::model("deleted", "echo")];
        let turns = build_history_turns(&messages, Some("p1"), &labels(), "You");
        assert_eq!(
            turns[0].parts,
            vec![ModelPart::Text("[Unknown]: echo".to_string())]
        );
    }

    #[test]
    fn hidden_messages_and_skip_markers_never_reach_the_model() {
        let mut skip = Message::user(SKIP_TURN_MARKER);
        skip.hidden = true;
        let messages = vec![Message::user("real"), skip];
        let turns = build_history_turns(&messages, Some("p1"), &labels(), "You");
        assert_eq!(turns.len(), 1);
    }

    #[test]
    fn attachments_become_inline_parts_after_the_text() {
        let mut message = Message::user("look at this");
        message.parts[0].attachments.push(Attachment {
            name: "pic.png".to_string(),
            mime_type: "image/png".to_string(),
            data: "aGVsbG8=".to_string(),
        });
        let turns = build_history_turns(&[message], None, &labels(), "You");
        assert_eq!(turns[0].parts.len(), 2);
        assert_eq!(
            turns[0].parts[1],
            ModelPart::InlineData {
                mime_type: "image/png".to_string(),
                data: "aGVsbG8=".to_string(),
            }
        );
    }
}
