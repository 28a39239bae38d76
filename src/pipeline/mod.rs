//! Message exchange pipeline.
//!
//! Turns a user action (send, skip, synthetic AI trigger, regenerate) into
//! appended store messages, a model invocation with constructed context, a
//! progressively-updated draft, and a final persisted message. One generation
//! per chat at a time; the persisted message list is re-read before every
//! turn decision.

pub mod history;
pub mod prompt;

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::{debug, error, warn};

use crate::config::Settings;
use crate::error::ChatError;
use crate::events::{ChatEvent, EventEmitter};
use crate::group::dynamic::{choose_speaker, CandidateInfo};
use crate::group::turns::{resolve_turn, Speaker};
use crate::model::abort::AbortRegistry;
use crate::model::{FinishReason, GenerationConfig, ModelClient, ModelContext, StreamEvent};
use crate::persona::{Persona, PersonaDirectory, DEFAULT_PERSONA_ID, NARRATOR_PERSONA_ID};
use crate::store::{
    Chat, ChatStore, GroupMode, Message, MessagePart, Role, SKIP_TURN_MARKER,
};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GenerationState {
    Idle,
    Sending,
    Streaming,
    Committed,
    Aborted,
    Blocked,
    Failed,
}

/// Accumulated in-progress response; what the UI paints while streaming.
#[derive(Debug, Clone, Default)]
pub struct MessageDraft {
    pub persona_id: Option<String>,
    pub round_index: Option<u32>,
    pub text: String,
    pub thinking: String,
    pub images: Vec<crate::store::GeneratedImage>,
    pub grounding: Option<String>,
}

impl MessageDraft {
    fn has_content(&self) -> bool {
        !self.text.is_empty() || !self.images.is_empty()
    }

    fn into_message(self) -> Message {
        Message {
            role: Role::Model,
            parts: vec![MessagePart {
                text: self.text,
                attachments: Vec::new(),
            }],
            persona_id: self.persona_id,
            round_index: self.round_index,
            hidden: false,
            thinking: if self.thinking.is_empty() {
                None
            } else {
                Some(self.thinking)
            },
            generated_images: self.images,
            grounding_html: self.grounding,
            created_at: crate::utils::now_millis(),
        }
    }
}

/// Streaming callbacks, decoupled from any rendering layer.
pub trait StreamObserver: Send + Sync {
    fn on_delta(&self, _chat_id: &str, _draft: &MessageDraft) {}
    fn on_complete(&self, _chat_id: &str, _message_index: usize) {}
    fn on_error(&self, _chat_id: &str, _error: &ChatError) {}
}

pub struct NoopObserver;

impl StreamObserver for NoopObserver {}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SendOutcome {
    /// Empty send outside a group chat; nothing happened.
    Ignored,
    /// The message was appended but the rotation now waits on the user.
    UserTurn,
    Generated {
        state: GenerationState,
        /// Index of the committed model message; `None` when an abort landed
        /// before any content arrived.
        message_index: Option<usize>,
    },
}

pub struct ChatPipeline {
    store: Arc<dyn ChatStore>,
    model: Arc<dyn ModelClient>,
    directory: PersonaDirectory,
    events: EventEmitter,
    observer: Arc<dyn StreamObserver>,
    aborts: AbortRegistry,
}

impl ChatPipeline {
    pub fn new(
        store: Arc<dyn ChatStore>,
        model: Arc<dyn ModelClient>,
        events: EventEmitter,
        observer: Arc<dyn StreamObserver>,
    ) -> Self {
        let directory = PersonaDirectory::new(store.clone());
        Self {
            store,
            model,
            directory,
            events,
            observer,
            aborts: AbortRegistry::new(),
        }
    }

    pub fn events(&self) -> &EventEmitter {
        &self.events
    }

    /// Cancel the in-flight generation for a chat, if any. The partial output
    /// streamed so far is committed, not discarded.
    pub fn abort(&self, chat_id: &str) -> bool {
        self.aborts.abort(chat_id)
    }

    /// Send a user message (or, with empty text and no attachments in a group
    /// chat, trigger the next AI turn).
    pub async fn send(
        &self,
        chat_id: &str,
        text: &str,
        attachments: Vec<crate::store::Attachment>,
    ) -> Result<SendOutcome, ChatError> {
        if self.aborts.is_in_flight(chat_id) {
            return Err(ChatError::Busy);
        }

        let mut chat = self.require_chat(chat_id).await?;
        let settings = self.store.read_settings().await?;
        if settings.api_key.is_none() {
            return Err(ChatError::Config("no API key configured".to_string()));
        }

        let trimmed = text.trim();
        if trimmed.is_empty() && attachments.is_empty() {
            if chat.group.is_none() {
                return Ok(SendOutcome::Ignored);
            }
            // Synthetic empty send: let the AI side speak without a user turn.
            return self.generation_loop(chat_id, &settings, None, true).await;
        }

        for attachment in &attachments {
            attachment.bytes()?;
        }

        let mut message = Message::user(trimmed);
        message.parts[0].attachments = attachments;
        if let Some(group) = &chat.group {
            if group.mode == GroupMode::Rpg {
                let resolution = resolve_turn(group, &chat.messages);
                message.round_index = Some(if resolution.is_user_turn {
                    resolution.round_number
                } else {
                    chat.max_round_index().max(1)
                });
            }
        }

        chat.messages.push(message);
        let appended_index = chat.messages.len() - 1;
        self.store.put_chat(&chat).await?;
        self.events.emit(&ChatEvent::MessageAppended {
            chat_id: chat_id.to_string(),
            index: appended_index,
        });

        let user_text = trimmed.to_string();
        self.generation_loop(chat_id, &settings, Some(&user_text), false)
            .await
    }

    /// Skip the user's RPG turn: a hidden marker message consumes the slot
    /// and rotation moves on.
    pub async fn skip_turn(&self, chat_id: &str) -> Result<SendOutcome, ChatError> {
        if self.aborts.is_in_flight(chat_id) {
            return Err(ChatError::Busy);
        }

        let mut chat = self.require_chat(chat_id).await?;
        let settings = self.store.read_settings().await?;
        let Some(group) = chat.group.clone() else {
            return Err(ChatError::Config(
                "skip turn only applies to group chats".to_string(),
            ));
        };
        if group.mode != GroupMode::Rpg {
            return Err(ChatError::Config(
                "skip turn only applies to RPG mode".to_string(),
            ));
        }

        let resolution = resolve_turn(&group, &chat.messages);
        let mut marker = Message::user(SKIP_TURN_MARKER);
        marker.hidden = true;
        marker.round_index = Some(resolution.round_number);
        chat.messages.push(marker);
        self.store.put_chat(&chat).await?;

        if settings.api_key.is_none() {
            // The skip itself is valid without a credential; the follow-up
            // generation is not.
            return Ok(SendOutcome::UserTurn);
        }
        self.generation_loop(chat_id, &settings, None, true).await
    }

    /// Synthetic empty send: make the resolved AI participant speak.
    pub async fn trigger_ai_turn(&self, chat_id: &str) -> Result<SendOutcome, ChatError> {
        if self.aborts.is_in_flight(chat_id) {
            return Err(ChatError::Busy);
        }
        let settings = self.store.read_settings().await?;
        if settings.api_key.is_none() {
            return Err(ChatError::Config("no API key configured".to_string()));
        }
        self.require_chat(chat_id).await?;
        self.generation_loop(chat_id, &settings, None, true).await
    }

    /// Insert a narrator interjection. Narration is transparent to rotation,
    /// so this never changes whose turn is next.
    pub async fn narrate(&self, chat_id: &str) -> Result<SendOutcome, ChatError> {
        if self.aborts.is_in_flight(chat_id) {
            return Err(ChatError::Busy);
        }
        let chat = self.require_chat(chat_id).await?;
        let settings = self.store.read_settings().await?;
        if settings.api_key.is_none() {
            return Err(ChatError::Config("no API key configured".to_string()));
        }
        let enabled = chat
            .group
            .as_ref()
            .and_then(|g| g.rpg.as_ref())
            .map(|r| r.narrator_enabled)
            .unwrap_or(false);
        if !enabled {
            return Err(ChatError::Config(
                "narrator is not enabled for this chat".to_string(),
            ));
        }

        let round = chat.max_round_index().max(1);
        let (state, index) = self
            .run_generation(chat_id, &settings, NARRATOR_PERSONA_ID, Some(round))
            .await?;
        Ok(SendOutcome::Generated {
            state,
            message_index: index,
        })
    }

    /// Re-run the exchange that produced the model message at `index`:
    /// truncate to just before its paired user prompt, persist, and re-enter
    /// the normal send path with the original text and attachments.
    pub async fn regenerate(&self, chat_id: &str, index: usize) -> Result<SendOutcome, ChatError> {
        if self.aborts.is_in_flight(chat_id) {
            return Err(ChatError::Busy);
        }

        let mut chat = self.require_chat(chat_id).await?;
        let target = chat
            .messages
            .get(index)
            .ok_or_else(|| ChatError::Config(format!("no message at index {}", index)))?;
        if target.role != Role::Model {
            return Err(ChatError::Config(
                "regenerate targets a model message".to_string(),
            ));
        }

        let paired_prompt = chat.messages[..index]
            .iter()
            .rposition(|m| m.role == Role::User && !m.hidden);

        match paired_prompt {
            Some(prompt_index) => {
                let prompt = chat.messages[prompt_index].clone();
                let text = prompt.text();
                let attachments = prompt
                    .parts
                    .iter()
                    .flat_map(|p| p.attachments.iter().cloned())
                    .collect();

                chat.messages.truncate(prompt_index);
                self.store.put_chat(&chat).await?;
                self.send(chat_id, &text, attachments).await
            }
            None => {
                // A turn the AI opened on its own; there is no prompt to
                // replay, so drop the message and re-trigger.
                chat.messages.truncate(index);
                self.store.put_chat(&chat).await?;
                self.trigger_ai_turn(chat_id).await
            }
        }
    }

    async fn require_chat(&self, chat_id: &str) -> Result<Chat, ChatError> {
        self.store
            .get_chat(chat_id)
            .await?
            .ok_or_else(|| ChatError::Config(format!("chat {} not found", chat_id)))
    }

    /// Run generations until the rotation waits on the user (or, outside
    /// auto-progress, after the first one). Each iteration re-reads the
    /// persisted chat: the next-speaker decision is never made on a stale
    /// in-memory copy, and each trigger waits for the previous completion.
    async fn generation_loop(
        &self,
        chat_id: &str,
        settings: &Settings,
        user_text: Option<&str>,
        synthetic: bool,
    ) -> Result<SendOutcome, ChatError> {
        let mut first = true;
        let mut last = SendOutcome::UserTurn;

        loop {
            let chat = self.require_chat(chat_id).await?;

            let speaker = match &chat.group {
                Some(group) if group.mode == GroupMode::Rpg => {
                    let resolution = resolve_turn(group, &chat.messages);
                    match resolution.next_speaker {
                        Speaker::User => break,
                        Speaker::Persona(id) => (id, Some(resolution.round_number)),
                    }
                }
                Some(group) => {
                    if !first {
                        break;
                    }
                    let candidates = self.dynamic_candidates(group).await;
                    let config = group.dynamic.clone().unwrap_or_default();
                    let chosen = choose_speaker(
                        &config,
                        &candidates,
                        &chat.messages,
                        user_text.unwrap_or(""),
                    )
                    .or_else(|| group.participant_ids.first().cloned())
                    .ok_or_else(|| {
                        ChatError::Config("group chat has no participants".to_string())
                    })?;
                    (chosen, None)
                }
                None => {
                    if !first {
                        break;
                    }
                    if synthetic {
                        return Ok(SendOutcome::Ignored);
                    }
                    let persona_id = chat
                        .persona_id
                        .clone()
                        .or_else(|| settings.default_persona_id.clone())
                        .unwrap_or_else(|| DEFAULT_PERSONA_ID.to_string());
                    (persona_id, None)
                }
            };

            let (state, index) = self
                .run_generation(chat_id, settings, &speaker.0, speaker.1)
                .await?;
            let terminal = state.clone();
            last = SendOutcome::Generated {
                state,
                message_index: index,
            };

            // Aborts stop the cascade: the user reached for the brakes.
            if terminal == GenerationState::Aborted {
                break;
            }
            first = false;

            let is_rpg = self
                .store
                .get_chat(chat_id)
                .await?
                .and_then(|c| c.group)
                .map(|g| g.mode == GroupMode::Rpg)
                .unwrap_or(false);
            if !(is_rpg && settings.auto_progress) {
                break;
            }
        }

        Ok(last)
    }

    async fn dynamic_candidates(
        &self,
        group: &crate::store::GroupChatConfig,
    ) -> Vec<CandidateInfo> {
        let mut out = Vec::new();
        for id in &group.participant_ids {
            // A deleted participant drops out of selection; its history stays.
            if let Some(persona) = self.directory.resolve_opt(id).await {
                out.push(CandidateInfo {
                    id: id.clone(),
                    name: persona.name,
                });
            }
        }
        out
    }

    async fn resolve_cast(
        &self,
        chat: &Chat,
        active_id: &str,
    ) -> (HashMap<String, String>, Vec<Persona>) {
        let mut ids: Vec<String> = chat
            .group
            .iter()
            .flat_map(|g| g.participant_ids.iter().cloned())
            .collect();
        for message in &chat.messages {
            if let Some(id) = &message.persona_id {
                if !ids.contains(id) {
                    ids.push(id.clone());
                }
            }
        }

        let mut labels = HashMap::new();
        let mut others = Vec::new();
        for id in ids {
            let Some(persona) = self.directory.resolve_opt(&id).await else {
                continue;
            };
            labels.insert(id.clone(), persona.name.clone());
            let in_roster = chat
                .group
                .as_ref()
                .map(|g| g.participant_ids.contains(&id))
                .unwrap_or(false);
            if id != active_id && in_roster {
                others.push(persona);
            }
        }
        (labels, others)
    }

    /// One full generation: register the flight slot, build context, stream
    /// into a draft, commit the terminal state.
    async fn run_generation(
        &self,
        chat_id: &str,
        settings: &Settings,
        persona_id: &str,
        round: Option<u32>,
    ) -> Result<(GenerationState, Option<usize>), ChatError> {
        let mut abort_rx = self.aborts.try_register(chat_id)?;

        let result = async {
            let chat = self.require_chat(chat_id).await?;
            let persona = self.directory.resolve(persona_id).await?;
            let (labels, others) = self.resolve_cast(&chat, persona_id).await;

            let framing = chat.group.as_ref().map(|group| prompt::GroupFraming {
                mode: group.mode,
                round_number: round,
                scenario_prompt: group
                    .rpg
                    .as_ref()
                    .and_then(|r| r.scenario_prompt.as_deref()),
                others: others
                    .iter()
                    .map(|p| (p.name.as_str(), p.description.as_str()))
                    .collect(),
                narrator_enabled: group
                    .rpg
                    .as_ref()
                    .map(|r| r.narrator_enabled)
                    .unwrap_or(false),
            });

            let system_instruction = prompt::build_system_instruction(&persona, framing.as_ref());
            let mut turns = prompt::tone_priming_turns(&persona);
            let active = chat.group.as_ref().map(|_| persona_id);
            turns.extend(history::build_history_turns(
                &chat.messages,
                active,
                &labels,
                "You",
            ));

            let context = ModelContext {
                system_instruction,
                turns,
            };
            let config = GenerationConfig {
                model: settings.model.clone(),
                api_key: settings
                    .api_key
                    .clone()
                    .ok_or_else(|| ChatError::Config("no API key configured".to_string()))?,
                thinking_enabled: true,
            };

            self.set_state(chat_id, GenerationState::Sending);
            debug!(target: "pipeline", chat_id, persona_id, "starting generation");

            let (tx, mut rx) = mpsc::channel::<StreamEvent>(32);
            let client = self.model.clone();
            tokio::spawn(async move {
                if let Err(err) = client.generate(context, config, tx.clone()).await {
                    let _ = tx
                        .send(StreamEvent::Finished(FinishReason::Error(err.to_string())))
                        .await;
                }
            });

            let mut draft = MessageDraft {
                persona_id: Some(persona_id.to_string()),
                round_index: round,
                ..MessageDraft::default()
            };
            let mut streaming = false;
            let terminal;

            loop {
                tokio::select! {
                    _ = &mut abort_rx => {
                        terminal = GenerationState::Aborted;
                        break;
                    }
                    event = rx.recv() => {
                        let Some(event) = event else {
                            terminal = GenerationState::Failed;
                            break;
                        };
                        if !streaming {
                            streaming = true;
                            self.set_state(chat_id, GenerationState::Streaming);
                        }
                        match event {
                            StreamEvent::Text(delta) => {
                                draft.text.push_str(&delta);
                                self.observer.on_delta(chat_id, &draft);
                            }
                            StreamEvent::Thinking(delta) => {
                                draft.thinking.push_str(&delta);
                                self.observer.on_delta(chat_id, &draft);
                            }
                            StreamEvent::Image(image) => {
                                draft.images.push(image);
                                self.observer.on_delta(chat_id, &draft);
                            }
                            StreamEvent::Grounding(html) => {
                                draft.grounding = Some(html);
                                self.observer.on_delta(chat_id, &draft);
                            }
                            StreamEvent::Finished(FinishReason::Stop) => {
                                terminal = GenerationState::Committed;
                                break;
                            }
                            StreamEvent::Finished(FinishReason::Blocked(reason)) => {
                                self.set_state(chat_id, GenerationState::Blocked);
                                let err = ChatError::Blocked(reason);
                                self.observer.on_error(chat_id, &err);
                                return Err(err);
                            }
                            StreamEvent::Finished(FinishReason::Error(message)) => {
                                self.set_state(chat_id, GenerationState::Failed);
                                let err = ChatError::Transport(message);
                                self.observer.on_error(chat_id, &err);
                                return Err(err);
                            }
                        }
                    }
                }
            }

            if terminal == GenerationState::Failed {
                self.set_state(chat_id, GenerationState::Failed);
                let err = ChatError::Transport("stream ended without a finish reason".to_string());
                self.observer.on_error(chat_id, &err);
                return Err(err);
            }

            // Committed, or aborted with partial output: either way what we
            // have is the authoritative message now.
            let committed_index = if draft.has_content() {
                let mut chat = self.require_chat(chat_id).await?;
                chat.messages.push(draft.into_message());
                let index = chat.messages.len() - 1;
                if let Err(err) = self.store.put_chat(&chat).await {
                    // Do not pretend the write happened; callers reload from
                    // the store rather than trusting this in-memory copy.
                    error!(target: "pipeline", chat_id, "failed to persist model message: {}", err);
                    self.observer.on_error(chat_id, &err);
                    return Err(err);
                }
                self.events.emit(&ChatEvent::MessageAppended {
                    chat_id: chat_id.to_string(),
                    index,
                });
                self.observer.on_complete(chat_id, index);
                Some(index)
            } else {
                warn!(target: "pipeline", chat_id, "generation ended with no content");
                None
            };

            self.set_state(chat_id, terminal.clone());
            self.emit_round_state(chat_id).await;
            Ok((terminal, committed_index))
        }
        .await;

        self.aborts.release(chat_id);
        if result.is_err() {
            self.emit_round_state(chat_id).await;
        }
        result
    }

    fn set_state(&self, chat_id: &str, state: GenerationState) {
        self.events.emit(&ChatEvent::GenerationStateChanged {
            chat_id: chat_id.to_string(),
            state,
        });
    }

    async fn emit_round_state(&self, chat_id: &str) {
        let Ok(Some(chat)) = self.store.get_chat(chat_id).await else {
            return;
        };
        let Some(group) = &chat.group else {
            return;
        };
        if group.mode != GroupMode::Rpg {
            return;
        }
        let resolution = resolve_turn(group, &chat.messages);
        self.events.emit(&ChatEvent::RoundStateChanged {
            chat_id: chat_id.to_string(),
            round_number: resolution.round_number,
            next_speaker: resolution.next_speaker,
            starts_new_round: resolution.starts_new_round,
        });
    }
}
