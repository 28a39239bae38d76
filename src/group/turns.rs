//! RPG turn rotation.
//!
//! Rotation is derived purely from message history: skipping a turn appends a
//! hidden marker message instead of mutating the turn order, so regeneration
//! and undo keep the rotation consistent. Narrator messages never occupy a
//! turn slot.

use serde::{Deserialize, Serialize};

use crate::persona::NARRATOR_PERSONA_ID;
use crate::store::{GroupChatConfig, Message, USER_SLOT};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", tag = "kind", content = "id")]
pub enum Speaker {
    User,
    Persona(String),
}

impl Speaker {
    fn from_slot(slot: &str) -> Self {
        if slot == USER_SLOT {
            Speaker::User
        } else {
            Speaker::Persona(slot.to_string())
        }
    }

    pub fn slot(&self) -> &str {
        match self {
            Speaker::User => USER_SLOT,
            Speaker::Persona(id) => id.as_str(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TurnResolution {
    pub next_speaker: Speaker,
    pub starts_new_round: bool,
    /// Round number to display: the current round normally, the upcoming one
    /// when a new round is starting.
    pub round_number: u32,
    pub is_user_turn: bool,
}

/// A message counts toward rotation unless hidden — except the skip marker,
/// which is hidden but still consumes a turn.
fn is_turn_relevant(message: &Message) -> bool {
    !message.hidden || message.is_skip_marker()
}

fn max_round_index(messages: &[Message]) -> u32 {
    messages
        .iter()
        .filter_map(|m| m.round_index)
        .max()
        .unwrap_or(0)
}

/// Compute whose turn is next for an RPG group chat.
///
/// Idempotent: calling twice without new messages yields the same resolution.
pub fn resolve_turn(config: &GroupChatConfig, messages: &[Message]) -> TurnResolution {
    let order = config.effective_turn_order();
    let max_round = max_round_index(messages);

    // Last turn-relevant speaker, walking past narrator interjections.
    let last_speaker = messages
        .iter()
        .rev()
        .filter(|m| is_turn_relevant(m))
        .map(|m| m.speaker())
        .find(|slot| *slot != NARRATOR_PERSONA_ID);

    let Some(last) = last_speaker else {
        // Empty history: the first slot opens round one.
        let next = Speaker::from_slot(&order[0]);
        let is_user_turn = next == Speaker::User;
        return TurnResolution {
            next_speaker: next,
            starts_new_round: true,
            round_number: max_round + 1,
            is_user_turn,
        };
    };

    let Some(position) = order.iter().position(|slot| slot == last) else {
        // Stale or unknown speaker (e.g. participant removed from the
        // roster): fail safe to the user's turn without opening a round.
        return TurnResolution {
            next_speaker: Speaker::User,
            starts_new_round: false,
            round_number: max_round.max(1),
            is_user_turn: true,
        };
    };

    let next_slot = &order[(position + 1) % order.len()];
    let starts_new_round = next_slot == &order[0];
    let next = Speaker::from_slot(next_slot);
    let is_user_turn = next == Speaker::User;

    TurnResolution {
        next_speaker: next,
        starts_new_round,
        round_number: if starts_new_round {
            max_round + 1
        } else {
            max_round.max(1)
        },
        is_user_turn,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{GroupMode, RpgConfig, SKIP_TURN_MARKER};

    fn config(order: &[&str]) -> GroupChatConfig {
        GroupChatConfig {
            mode: GroupMode::Rpg,
            participant_ids: vec!["a".to_string(), "b".to_string()],
            rpg: Some(RpgConfig {
                turn_order: order.iter().map(|s| s.to_string()).collect(),
                scenario_prompt: None,
                narrator_enabled: true,
            }),
            dynamic: None,
        }
    }

    fn persona_msg(id: &str, round: u32) -> Message {
        Message::model(id, format!("{} speaks", id)).with_round(round)
    }

    fn user_msg(round: u32) -> Message {
        Message::user("user speaks").with_round(round)
    }

    fn skip_msg(round: u32) -> Message {
        let mut m = Message::user(SKIP_TURN_MARKER).with_round(round);
        m.hidden = true;
        m
    }

    #[test]
    fn empty_history_opens_round_one_at_first_slot() {
        let cfg = config(&["a", "b", "user"]);
        let r = resolve_turn(&cfg, &[]);
        assert_eq!(r.next_speaker, Speaker::Persona("a".to_string()));
        assert!(r.starts_new_round);
        assert_eq!(r.round_number, 1);
        assert!(!r.is_user_turn);
    }

    #[test]
    fn rotation_walks_order_and_wraps_into_next_round() {
        let cfg = config(&["a", "b", "user"]);
        let mut messages = vec![persona_msg("a", 1)];

        let r = resolve_turn(&cfg, &messages);
        assert_eq!(r.next_speaker, Speaker::Persona("b".to_string()));
        assert!(!r.starts_new_round);
        assert_eq!(r.round_number, 1);

        messages.push(persona_msg("b", 1));
        let r = resolve_turn(&cfg, &messages);
        assert_eq!(r.next_speaker, Speaker::User);
        assert!(r.is_user_turn);
        assert!(!r.starts_new_round);

        messages.push(user_msg(1));
        let r = resolve_turn(&cfg, &messages);
        assert_eq!(r.next_speaker, Speaker::Persona("a".to_string()));
        assert!(r.starts_new_round);
        assert_eq!(r.round_number, 2);
    }

    #[test]
    fn resolution_is_idempotent() {
        let cfg = config(&["a", "b", "user"]);
        let messages = vec![persona_msg("a", 1), persona_msg("b", 1)];
        assert_eq!(resolve_turn(&cfg, &messages), resolve_turn(&cfg, &messages));
    }

    #[test]
    fn narrator_is_transparent_to_rotation() {
        let cfg = config(&["a", "b", "user"]);
        let messages = vec![
            persona_msg("a", 1),
            persona_msg(NARRATOR_PERSONA_ID, 1),
        ];
        let r = resolve_turn(&cfg, &messages);
        assert_eq!(r.next_speaker, Speaker::Persona("b".to_string()));
        assert!(!r.starts_new_round);
    }

    #[test]
    fn narrator_only_history_behaves_like_empty_history() {
        let cfg = config(&["a", "b", "user"]);
        let messages = vec![persona_msg(NARRATOR_PERSONA_ID, 1)];
        let r = resolve_turn(&cfg, &messages);
        assert_eq!(r.next_speaker, Speaker::Persona("a".to_string()));
        assert!(r.starts_new_round);
    }

    #[test]
    fn skip_marker_consumes_the_user_turn() {
        let cfg = config(&["a", "b", "user"]);
        let messages = vec![persona_msg("a", 1), persona_msg("b", 1), skip_msg(1)];
        let r = resolve_turn(&cfg, &messages);
        assert_eq!(r.next_speaker, Speaker::Persona("a".to_string()));
        assert!(r.starts_new_round);
        assert_eq!(r.round_number, 2);
    }

    #[test]
    fn ordinary_hidden_messages_do_not_consume_turns() {
        let cfg = config(&["a", "b", "user"]);
        let mut hidden = Message::user("structural note");
        hidden.hidden = true;
        let messages = vec![persona_msg("a", 1), hidden];
        let r = resolve_turn(&cfg, &messages);
        assert_eq!(r.next_speaker, Speaker::Persona("b".to_string()));
    }

    #[test]
    fn unknown_speaker_fails_safe_to_user_turn() {
        let cfg = config(&["a", "b", "user"]);
        let messages = vec![persona_msg("deleted-participant", 3)];
        let r = resolve_turn(&cfg, &messages);
        assert_eq!(r.next_speaker, Speaker::User);
        assert!(!r.starts_new_round);
        assert_eq!(r.round_number, 3);
    }

    #[test]
    fn derived_order_used_when_no_stored_order() {
        let cfg = GroupChatConfig {
            mode: GroupMode::Rpg,
            participant_ids: vec!["a".to_string(), "b".to_string()],
            rpg: Some(RpgConfig::default()),
            dynamic: None,
        };
        let r = resolve_turn(&cfg, &[persona_msg("b", 1)]);
        assert_eq!(r.next_speaker, Speaker::User);
    }

    #[test]
    fn user_first_order_marks_user_turn_on_empty_history() {
        let cfg = config(&["user", "a", "b"]);
        let r = resolve_turn(&cfg, &[]);
        assert!(r.is_user_turn);
        assert!(r.starts_new_round);
    }
}
