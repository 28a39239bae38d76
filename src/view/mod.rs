//! Transcript pagination and round-block projection.
//!
//! The view is a disposable projection of the store: it holds the full message
//! array of the open chat plus a rendered window over its tail, and loads
//! older pages by prepending. It never writes back; anything here can be
//! rebuilt from the store at any time.

use std::collections::HashMap;
use std::sync::Arc;

use tracing::warn;

use crate::error::ChatError;
use crate::persona::PersonaDirectory;
use crate::store::{Chat, ChatStore, GeneratedImage, Message, Role};

/// Messages per page. A tunable constant, not a protocol contract.
pub const PAGE_SIZE: usize = 50;

const UNKNOWN_SPEAKER_LABEL: &str = "Unknown";
const USER_LABEL: &str = "You";

#[derive(Debug, Clone)]
pub struct RenderedMessage {
    /// Canonical position in the chat's message array.
    pub index: usize,
    pub role: Role,
    pub persona_id: Option<String>,
    pub label: String,
    pub text: String,
    pub thinking: Option<String>,
    pub images: Vec<GeneratedImage>,
}

/// Consecutive messages sharing a `round_index` collapse into one block.
#[derive(Debug, Clone)]
pub struct RoundBlock {
    pub round_index: Option<u32>,
    pub messages: Vec<RenderedMessage>,
}

pub trait MessageRenderer: Send + Sync {
    fn render(
        &self,
        index: usize,
        message: &Message,
        label: &str,
    ) -> Result<RenderedMessage, ChatError>;
}

pub struct DefaultRenderer;

impl MessageRenderer for DefaultRenderer {
    fn render(
        &self,
        index: usize,
        message: &Message,
        label: &str,
    ) -> Result<RenderedMessage, ChatError> {
        Ok(RenderedMessage {
            index,
            role: message.role,
            persona_id: message.persona_id.clone(),
            label: label.to_string(),
            text: message.text(),
            thinking: message.thinking.clone(),
            images: message.generated_images.clone(),
        })
    }
}

/// Preserves the visual scroll position across a prepend: record the content
/// height before inserting, then shift the scroll offset by the growth.
#[derive(Debug, Clone, Copy)]
pub struct ScrollAnchor {
    height_before: f64,
}

impl ScrollAnchor {
    pub fn record(height_before: f64) -> Self {
        Self { height_before }
    }

    pub fn adjusted_top(&self, height_after: f64, scroll_top: f64) -> f64 {
        scroll_top + (height_after - self.height_before)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadOutcome {
    Loaded { count: usize },
    NoMoreOlder,
    AlreadyLoading,
}

pub struct ChatView {
    page_size: usize,
    chat_id: Option<String>,
    messages: Vec<Message>,
    labels: HashMap<String, String>,
    loaded_start: usize,
    loaded_end: usize,
    has_more_older: bool,
    loading_older: bool,
    blocks: Vec<RoundBlock>,
}

impl ChatView {
    pub fn new(page_size: usize) -> Self {
        Self {
            page_size: page_size.max(1),
            chat_id: None,
            messages: Vec::new(),
            labels: HashMap::new(),
            loaded_start: 0,
            loaded_end: 0,
            has_more_older: false,
            loading_older: false,
            blocks: Vec::new(),
        }
    }

    pub fn chat_id(&self) -> Option<&str> {
        self.chat_id.as_deref()
    }

    pub fn blocks(&self) -> &[RoundBlock] {
        &self.blocks
    }

    pub fn loaded_range(&self) -> (usize, usize) {
        (self.loaded_start, self.loaded_end)
    }

    pub fn has_more_older(&self) -> bool {
        self.has_more_older
    }

    pub fn close(&mut self) {
        self.chat_id = None;
        self.messages.clear();
        self.labels.clear();
        self.loaded_start = 0;
        self.loaded_end = 0;
        self.has_more_older = false;
        self.loading_older = false;
        self.blocks.clear();
    }

    /// Open a chat and render the newest page. A missing chat id clears the
    /// view and returns cleanly.
    pub async fn open(
        &mut self,
        store: &Arc<dyn ChatStore>,
        directory: &PersonaDirectory,
        renderer: &dyn MessageRenderer,
        chat_id: &str,
    ) -> Result<(), ChatError> {
        self.close();

        let Some(chat) = store.get_chat(chat_id).await? else {
            warn!(target: "view", chat_id, "open on unknown chat; view cleared");
            return Ok(());
        };

        self.labels = resolve_labels(directory, &chat).await;
        let total = chat.messages.len();
        self.chat_id = Some(chat.id.clone());
        self.messages = chat.messages;
        self.loaded_start = total.saturating_sub(self.page_size);
        self.loaded_end = total;
        self.has_more_older = self.loaded_start > 0;
        self.blocks = self.render_slice(self.loaded_start, self.loaded_end, renderer);
        Ok(())
    }

    /// Prepend the next older page, merging adjacent same-round blocks.
    pub fn load_older(&mut self, renderer: &dyn MessageRenderer) -> LoadOutcome {
        if self.loading_older {
            return LoadOutcome::AlreadyLoading;
        }
        let next_start = self.loaded_start.saturating_sub(self.page_size);
        if next_start == self.loaded_start {
            self.has_more_older = false;
            return LoadOutcome::NoMoreOlder;
        }

        self.loading_older = true;
        let mut page = self.render_slice(next_start, self.loaded_start, renderer);
        let count = self.loaded_start - next_start;

        // A page boundary can split a round; stitch the trailing new block
        // onto the leading old block instead of leaving two for one round.
        let should_merge = match (page.last(), self.blocks.first()) {
            (Some(last_new), Some(first_old)) => {
                last_new.round_index.is_some() && last_new.round_index == first_old.round_index
            }
            _ => false,
        };
        if should_merge {
            let mut merged = page.pop().expect("trailing block checked above");
            let old_first = self.blocks.remove(0);
            merged.messages.extend(old_first.messages);
            page.push(merged);
        }

        page.extend(self.blocks.drain(..));
        self.blocks = page;
        self.loaded_start = next_start;
        self.has_more_older = self.loaded_start > 0;
        self.loading_older = false;
        LoadOutcome::Loaded { count }
    }

    /// Reflect a message appended to the open chat while its tail is loaded.
    pub fn append_live(&mut self, message: &Message, renderer: &dyn MessageRenderer) {
        if self.chat_id.is_none() || self.loaded_end != self.messages.len() {
            return;
        }
        let index = self.messages.len();
        self.messages.push(message.clone());
        self.loaded_end = self.messages.len();

        if message.hidden {
            return;
        }
        let label = self.label_for(message);
        match renderer.render(index, message, &label) {
            Ok(rendered) => {
                let merge = self
                    .blocks
                    .last()
                    .map(|b| b.round_index.is_some() && b.round_index == message.round_index)
                    .unwrap_or(false);
                if merge {
                    self.blocks
                        .last_mut()
                        .expect("merge checked a last block exists")
                        .messages
                        .push(rendered);
                } else {
                    self.blocks.push(RoundBlock {
                        round_index: message.round_index,
                        messages: vec![rendered],
                    });
                }
            }
            Err(err) => warn!(target: "view", index, "failed to render appended message: {}", err),
        }
    }

    fn label_for(&self, message: &Message) -> String {
        match &message.persona_id {
            None => USER_LABEL.to_string(),
            Some(id) => self
                .labels
                .get(id)
                .cloned()
                .unwrap_or_else(|| UNKNOWN_SPEAKER_LABEL.to_string()),
        }
    }

    fn render_slice(
        &self,
        start: usize,
        end: usize,
        renderer: &dyn MessageRenderer,
    ) -> Vec<RoundBlock> {
        let mut blocks: Vec<RoundBlock> = Vec::new();
        for (offset, message) in self.messages[start..end].iter().enumerate() {
            if message.hidden {
                continue;
            }
            let index = start + offset;
            let label = self.label_for(message);
            let rendered = match renderer.render(index, message, &label) {
                Ok(r) => r,
                Err(err) => {
                    // One bad message must not abort the rest of the slice.
                    warn!(target: "view", index, "failed to render message: {}", err);
                    continue;
                }
            };

            let merge = blocks
                .last()
                .map(|b| b.round_index.is_some() && b.round_index == message.round_index)
                .unwrap_or(false);
            if merge {
                blocks
                    .last_mut()
                    .expect("merge checked a last block exists")
                    .messages
                    .push(rendered);
            } else {
                blocks.push(RoundBlock {
                    round_index: message.round_index,
                    messages: vec![rendered],
                });
            }
        }
        blocks
    }
}

impl Default for ChatView {
    fn default() -> Self {
        Self::new(PAGE_SIZE)
    }
}

async fn resolve_labels(directory: &PersonaDirectory, chat: &Chat) -> HashMap<String, String> {
    let mut ids: Vec<String> = Vec::new();
    if let Some(group) = &chat.group {
        ids.extend(group.participant_ids.iter().cloned());
    }
    if let Some(persona_id) = &chat.persona_id {
        ids.push(persona_id.clone());
    }
    for message in &chat.messages {
        if let Some(id) = &message.persona_id {
            if !ids.contains(id) {
                ids.push(id.clone());
            }
        }
    }

    let mut labels = HashMap::new();
    for id in ids {
        if labels.contains_key(&id) {
            continue;
        }
        match directory.resolve_opt(&id).await {
            Some(persona) => {
                labels.insert(id, persona.name);
            }
            None => {
                labels.insert(id, UNKNOWN_SPEAKER_LABEL.to_string());
            }
        }
    }
    labels
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::sqlite::SqliteChatStore;
    use crate::store::SKIP_TURN_MARKER;

    struct FailOn(usize);

    impl MessageRenderer for FailOn {
        fn render(
            &self,
            index: usize,
            message: &Message,
            label: &str,
        ) -> Result<RenderedMessage, ChatError> {
            if index == self.0 {
                return Err(ChatError::Store("render exploded".to_string()));
            }
            DefaultRenderer.render(index, message, label)
        }
    }

    fn fixtures() -> (Arc<dyn ChatStore>, PersonaDirectory) {
        let store: Arc<dyn ChatStore> = Arc::new(SqliteChatStore::open_in_memory().unwrap());
        let directory = PersonaDirectory::new(store.clone());
        (store, directory)
    }

    async fn seed_chat(store: &Arc<dyn ChatStore>, count: usize) -> String {
        let mut chat = Chat::new("long");
        for i in 0..count {
            chat.messages.push(Message::user(format!("m{}", i)));
        }
        store.create_chat(chat).await.unwrap()
    }

    #[tokio::test]
    async fn open_renders_the_newest_page() {
        let (store, directory) = fixtures();
        let id = seed_chat(&store, 120).await;

        let mut view = ChatView::new(50);
        view.open(&store, &directory, &DefaultRenderer, &id)
            .await
            .unwrap();

        assert_eq!(view.loaded_range(), (70, 120));
        assert!(view.has_more_older());
        let first = &view.blocks()[0].messages[0];
        assert_eq!(first.index, 70);
        assert_eq!(first.text, "m70");
    }

    #[tokio::test]
    async fn load_older_pages_backwards_until_exhausted() {
        let (store, directory) = fixtures();
        let id = seed_chat(&store, 120).await;

        let mut view = ChatView::new(50);
        view.open(&store, &directory, &DefaultRenderer, &id)
            .await
            .unwrap();

        assert_eq!(
            view.load_older(&DefaultRenderer),
            LoadOutcome::Loaded { count: 50 }
        );
        assert_eq!(view.loaded_range(), (20, 120));

        assert_eq!(
            view.load_older(&DefaultRenderer),
            LoadOutcome::Loaded { count: 20 }
        );
        assert_eq!(view.loaded_range(), (0, 120));
        assert!(!view.has_more_older());

        assert_eq!(view.load_older(&DefaultRenderer), LoadOutcome::NoMoreOlder);
        // Oldest-to-newest across the whole window.
        let texts: Vec<&str> = view
            .blocks()
            .iter()
            .flat_map(|b| b.messages.iter().map(|m| m.text.as_str()))
            .collect();
        assert_eq!(texts[0], "m0");
        assert_eq!(texts[119], "m119");
    }

    #[tokio::test]
    async fn prepend_merges_blocks_that_share_a_round() {
        let (store, directory) = fixtures();
        let mut chat = Chat::new("rounds");
        // Rounds 1..=4, three messages each; page size 5 splits round 3.
        for round in 1..=4u32 {
            chat.messages
                .push(Message::user(format!("u r{}", round)).with_round(round));
            chat.messages
                .push(Message::model("a", format!("a r{}", round)).with_round(round));
            chat.messages
                .push(Message::model("b", format!("b r{}", round)).with_round(round));
        }
        let id = store.create_chat(chat).await.unwrap();

        let mut view = ChatView::new(5);
        view.open(&store, &directory, &DefaultRenderer, &id)
            .await
            .unwrap();
        // Window [7,12): tail of round 3 plus round 4.
        assert_eq!(view.blocks()[0].round_index, Some(3));

        view.load_older(&DefaultRenderer);
        // The prepended page ends inside round 3; exactly one block for it.
        let round3_blocks: Vec<_> = view
            .blocks()
            .iter()
            .filter(|b| b.round_index == Some(3))
            .collect();
        assert_eq!(round3_blocks.len(), 1);
        let texts: Vec<&str> = round3_blocks[0]
            .messages
            .iter()
            .map(|m| m.text.as_str())
            .collect();
        assert_eq!(texts, vec!["u r3", "a r3", "b r3"]);
    }

    #[tokio::test]
    async fn missing_chat_clears_the_view_without_error() {
        let (store, directory) = fixtures();
        let mut view = ChatView::new(50);
        view.open(&store, &directory, &DefaultRenderer, "ghost")
            .await
            .unwrap();
        assert!(view.chat_id().is_none());
        assert!(view.blocks().is_empty());
    }

    #[tokio::test]
    async fn renderer_failure_skips_only_that_message() {
        let _ = tracing_subscriber::fmt().with_test_writer().try_init();
        let (store, directory) = fixtures();
        let id = seed_chat(&store, 3).await;

        let mut view = ChatView::new(50);
        view.open(&store, &directory, &FailOn(1), &id).await.unwrap();

        let texts: Vec<&str> = view
            .blocks()
            .iter()
            .flat_map(|b| b.messages.iter().map(|m| m.text.as_str()))
            .collect();
        assert_eq!(texts, vec!["m0", "m2"]);
    }

    #[tokio::test]
    async fn hidden_skip_markers_never_render() {
        let (store, directory) = fixtures();
        let mut chat = Chat::new("skips");
        chat.messages.push(Message::user("visible"));
        let mut skip = Message::user(SKIP_TURN_MARKER);
        skip.hidden = true;
        chat.messages.push(skip);
        let id = store.create_chat(chat).await.unwrap();

        let mut view = ChatView::new(50);
        view.open(&store, &directory, &DefaultRenderer, &id)
            .await
            .unwrap();
        let count: usize = view.blocks().iter().map(|b| b.messages.len()).sum();
        assert_eq!(count, 1);
    }

    #[tokio::test]
    async fn append_live_extends_the_trailing_round_block() {
        let (store, directory) = fixtures();
        let mut chat = Chat::new("live");
        chat.messages.push(Message::user("u").with_round(1));
        let id = store.create_chat(chat).await.unwrap();

        let mut view = ChatView::new(50);
        view.open(&store, &directory, &DefaultRenderer, &id)
            .await
            .unwrap();
        view.append_live(&Message::model("a", "reply").with_round(1), &DefaultRenderer);

        assert_eq!(view.blocks().len(), 1);
        assert_eq!(view.blocks()[0].messages.len(), 2);
        assert_eq!(view.loaded_range(), (0, 2));
    }

    #[test]
    fn scroll_anchor_shifts_by_inserted_height() {
        let anchor = ScrollAnchor::record(400.0);
        assert_eq!(anchor.adjusted_top(1000.0, 12.0), 612.0);
    }
}
