//! System-instruction construction.
//!
//! The trait-band tables are a content contract: a persona's numeric bands map
//! to these exact sentences, with no paraphrase at runtime. Tests pin them.

use crate::model::ModelTurn;
use crate::persona::Persona;
use crate::store::GroupMode;

const AGGRESSIVENESS_BANDS: [&str; 4] = [
    "Stay calm and measured; never provoke or escalate conflict.",
    "Hold your ground when challenged, but do not seek out conflict.",
    "Be assertive and direct; push back readily when you disagree.",
    "Be confrontational and forceful; challenge others head-on when crossed.",
];

const SENSUALITY_BANDS: [&str; 4] = [
    "Keep every interaction strictly platonic; deflect flirtation.",
    "Allow light warmth and the occasional compliment, nothing more.",
    "Be openly flirtatious and affectionate when the moment invites it.",
    "Lean into sensual, suggestive undertones whenever context allows.",
];

const INDEPENDENCE_BANDS: [&str; 4] = [
    "Follow the user's lead in every exchange; never steer the conversation.",
    "Mostly follow the user's lead, offering suggestions of your own sparingly.",
    "Drive the conversation forward with your own goals and opinions.",
    "Act with full autonomy; pursue your own agenda even against the user's lead.",
];

fn band(table: &[&'static str; 4], level: u8) -> &'static str {
    table[level.min(3) as usize]
}

/// One behavioral instruction per trait, selected by band.
pub fn trait_band_instructions(persona: &Persona) -> [&'static str; 3] {
    [
        band(&AGGRESSIVENESS_BANDS, persona.aggressiveness),
        band(&SENSUALITY_BANDS, persona.sensuality),
        band(&INDEPENDENCE_BANDS, persona.independence),
    ]
}

/// Group framing for the persona currently speaking.
pub struct GroupFraming<'a> {
    pub mode: GroupMode,
    /// Display round for RPG mode; `None` in dynamic mode.
    pub round_number: Option<u32>,
    pub scenario_prompt: Option<&'a str>,
    /// (name, description) of the other AI participants.
    pub others: Vec<(&'a str, &'a str)>,
    pub narrator_enabled: bool,
}

pub fn build_system_instruction(persona: &Persona, framing: Option<&GroupFraming<'_>>) -> String {
    let mut out = String::new();

    if !persona.prompt.trim().is_empty() {
        out.push_str(persona.prompt.trim());
        out.push_str("\n\n");
    }
    out.push_str(&format!("You are {}.", persona.name));
    if !persona.description.trim().is_empty() {
        out.push(' ');
        out.push_str(persona.description.trim());
    }
    out.push_str("\n\nBehavior:\n");
    for instruction in trait_band_instructions(persona) {
        out.push_str("- ");
        out.push_str(instruction);
        out.push('\n');
    }
    if persona.roleplay_enabled {
        out.push_str("- Embody the character naturally without breaking immersion.\n");
        out.push_str(
            "- You may voice background characters in the scene, but never speak for the user.\n",
        );
    }
    if !persona.nsfw {
        out.push_str("- Keep all interactions appropriate and respectful; avoid sexual or explicit content.\n");
    }

    if let Some(framing) = framing {
        out.push('\n');
        match framing.mode {
            GroupMode::Rpg => {
                out.push_str(
                    "This is a turn-based group roleplay. Speak only on your turn, as your character alone.\n",
                );
                if let Some(round) = framing.round_number {
                    out.push_str(&format!("The story is in round {}.\n", round));
                }
            }
            GroupMode::Dynamic => {
                out.push_str(
                    "This is a free-flowing group conversation. Reply as your character when addressed or when you have something to add.\n",
                );
            }
        }
        if let Some(scenario) = framing.scenario_prompt {
            if !scenario.trim().is_empty() {
                out.push_str("\nScenario:\n");
                out.push_str(scenario.trim());
                out.push('\n');
            }
        }
        if !framing.others.is_empty() {
            out.push_str("\nThe other characters present:\n");
            for (name, description) in &framing.others {
                if description.is_empty() {
                    out.push_str(&format!("- {}\n", name));
                } else {
                    out.push_str(&format!("- {}: {}\n", name, description));
                }
            }
        }
        if framing.narrator_enabled {
            out.push_str(
                "\nA narrator may interject scene descriptions; treat them as ground truth, not as another character's dialogue.\n",
            );
        }
    }

    out.trim_end().to_string()
}

/// Tone examples become priming turns ahead of the real history.
pub fn tone_priming_turns(persona: &Persona) -> Vec<ModelTurn> {
    let mut turns = Vec::with_capacity(persona.tone_examples.len() * 2);
    for example in &persona.tone_examples {
        turns.push(ModelTurn::user(example.user.clone()));
        turns.push(ModelTurn::model(example.reply.clone()));
    }
    turns
}
