use serde::{Deserialize, Serialize};

/// Global settings document, persisted as a single JSON row by the store.
/// Written back with defaults on first read.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Settings {
    /// Invocation credential for the model service. Sends are rejected with a
    /// configuration error while this is unset.
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default = "default_model")]
    pub model: String,
    /// When an RPG group chat resolves to an AI participant's turn, trigger the
    /// synthetic empty send automatically after the current generation commits.
    #[serde(default)]
    pub auto_progress: bool,
    /// Persona used for plain 1:1 chats that do not pin one themselves.
    #[serde(default)]
    pub default_persona_id: Option<String>,
    /// Override for the pagination window size.
    #[serde(default)]
    pub page_size: Option<usize>,
}

fn default_model() -> String {
    "troupe-default".to_string()
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            api_key: None,
            model: default_model(),
            auto_progress: false,
            default_persona_id: None,
            page_size: None,
        }
    }
}
