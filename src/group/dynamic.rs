//! Dynamic-mode speaker choice.
//!
//! Resolution order: an explicit @ping wins (when pings are allowed), then a
//! balance heuristic over the remaining candidates. Guard caps bound how many
//! replies a participant gets between user messages; a ping overrides the cap.

use crate::store::{DynamicConfig, Message, Role};

#[derive(Debug, Clone)]
pub struct CandidateInfo {
    pub id: String,
    pub name: String,
}

/// Parse the user message for an @mention of a candidate.
///
/// `@"Quoted Name"` matches names with spaces; bare `@Name` matches a single
/// word, exact name first, then prefix. Matching is case-insensitive.
pub fn parse_ping(message: &str, candidates: &[CandidateInfo]) -> Option<String> {
    let mut rest = message;
    while let Some(at) = rest.find("@\"") {
        let quoted = &rest[at + 2..];
        if let Some(close) = quoted.find('"') {
            let name = quoted[..close].to_lowercase();
            if let Some(c) = candidates.iter().find(|c| c.name.to_lowercase() == name) {
                return Some(c.id.clone());
            }
            rest = &quoted[close + 1..];
        } else {
            break;
        }
    }

    for word in message.split_whitespace() {
        let Some(name) = word.strip_prefix('@') else {
            continue;
        };
        if name.is_empty() {
            continue;
        }
        let name = name.to_lowercase();
        if let Some(c) = candidates.iter().find(|c| c.name.to_lowercase() == name) {
            return Some(c.id.clone());
        }
        if let Some(c) = candidates
            .iter()
            .find(|c| c.name.to_lowercase().starts_with(&name))
        {
            return Some(c.id.clone());
        }
    }

    None
}

/// Replies a participant has produced since the user's latest visible message.
fn replies_since_last_user_message(messages: &[Message], candidate_id: &str) -> u32 {
    let mut count = 0;
    for m in messages.iter().rev() {
        if m.role == Role::User && !m.hidden {
            break;
        }
        if m.persona_id.as_deref() == Some(candidate_id) {
            count += 1;
        }
    }
    count
}

struct SpeakStats {
    count: u32,
    last_index: Option<usize>,
}

fn speak_stats(messages: &[Message], candidate_id: &str) -> SpeakStats {
    let mut count = 0;
    let mut last_index = None;
    for (i, m) in messages.iter().enumerate() {
        if m.persona_id.as_deref() == Some(candidate_id) {
            count += 1;
            last_index = Some(i);
        }
    }
    SpeakStats { count, last_index }
}

/// Pick the participant who should answer the given user message.
///
/// Returns `None` only when no candidate survives the guard filter (callers
/// fall back to the first participant).
pub fn choose_speaker(
    config: &DynamicConfig,
    candidates: &[CandidateInfo],
    messages: &[Message],
    user_text: &str,
) -> Option<String> {
    if candidates.is_empty() {
        return None;
    }

    if config.allow_pings {
        if let Some(pinged) = parse_ping(user_text, candidates) {
            return Some(pinged);
        }
    }

    let eligible: Vec<&CandidateInfo> = candidates
        .iter()
        .filter(|c| match config.max_message_guard_by_id.get(&c.id) {
            Some(cap) => replies_since_last_user_message(messages, &c.id) < *cap,
            None => true,
        })
        .collect();
    if eligible.is_empty() {
        return None;
    }

    let total_spoken: u32 = eligible
        .iter()
        .map(|c| speak_stats(messages, &c.id).count)
        .sum();
    let current_index = messages.len();
    let user_text_lower = user_text.to_lowercase();

    let mut best: Option<(f32, &CandidateInfo)> = None;
    for &candidate in &eligible {
        let stats = speak_stats(messages, &candidate.id);
        let mut score = 100.0f32;

        // Participation balance: boost the under-represented, dampen the loud.
        if total_spoken > 0 {
            let rate = stats.count as f32 / total_spoken as f32;
            let expected = 1.0 / eligible.len() as f32;
            if rate < expected {
                score += (expected - rate) * 200.0;
            } else if rate > expected * 1.5 {
                score -= 20.0;
            }
        }

        match stats.last_index {
            None => score += 50.0,
            Some(last) => {
                let messages_ago = current_index.saturating_sub(last);
                if messages_ago <= 1 {
                    score -= 30.0;
                } else if messages_ago == 2 {
                    score -= 15.0;
                } else if messages_ago >= 4 {
                    score += 10.0;
                }
            }
        }

        if user_text_lower.contains(&candidate.name.to_lowercase()) {
            score += 80.0;
        }

        match best {
            Some((top, _)) if top >= score => {}
            _ => best = Some((score, candidate)),
        }
    }

    best.map(|(_, c)| c.id.clone())
}
