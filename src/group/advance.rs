//! Auto-advance decision.
//!
//! When an RPG chat resolves to an AI participant's turn and auto-progress is
//! on, the pipeline triggers a synthetic empty send. The decision reads the
//! persisted chat, never view state, and the pipeline only consults it after
//! the previous generation has fully committed — one completion, at most one
//! trigger, no timers.

use super::turns::{resolve_turn, Speaker, TurnResolution};
use crate::config::Settings;
use crate::store::{Chat, GroupMode};

/// Returns the persona that should speak next automatically, if any.
pub fn auto_advance_target(chat: &Chat, settings: &Settings) -> Option<(String, TurnResolution)> {
    if !settings.auto_progress {
        return None;
    }
    let group = chat.group.as_ref()?;
    if group.mode != GroupMode::Rpg {
        return None;
    }
    let resolution = resolve_turn(group, &chat.messages);
    match &resolution.next_speaker {
        Speaker::Persona(id) => Some((id.clone(), resolution)),
        Speaker::User => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{GroupChatConfig, Message, RpgConfig};

    fn rpg_chat() -> Chat {
        Chat::new("quest").with_group(GroupChatConfig {
            mode: GroupMode::Rpg,
            participant_ids: vec!["a".to_string(), "b".to_string()],
            rpg: Some(RpgConfig {
                turn_order: vec!["a".to_string(), "b".to_string(), "user".to_string()],
                scenario_prompt: None,
                narrator_enabled: false,
            }),
            dynamic: None,
        })
    }

    fn settings(auto: bool) -> Settings {
        Settings {
            auto_progress: auto,
            ..Settings::default()
        }
    }

    #[test]
    fn advances_to_ai_participant_when_enabled() {
        let mut chat = rpg_chat();
        chat.messages.push(Message::model("a", "hi").with_round(1));
        let (id, resolution) = auto_advance_target(&chat, &settings(true)).unwrap();
        assert_eq!(id, "b");
        assert!(!resolution.starts_new_round);
    }

    #[test]
    fn never_advances_onto_the_user_turn() {
        let mut chat = rpg_chat();
        chat.messages.push(Message::model("a", "hi").with_round(1));
        chat.messages.push(Message::model("b", "ho").with_round(1));
        assert!(auto_advance_target(&chat, &settings(true)).is_none());
    }

    #[test]
    fn disabled_setting_means_no_advance() {
        let chat = rpg_chat();
        assert!(auto_advance_target(&chat, &settings(false)).is_none());
    }

    #[test]
    fn non_group_chats_never_auto_advance() {
        let chat = Chat::new("plain");
        assert!(auto_advance_target(&chat, &settings(true)).is_none());
    }
}
