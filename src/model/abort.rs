use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tokio::sync::oneshot;

use crate::error::ChatError;

#[derive(Debug)]
struct AbortHandle {
    tx: Option<oneshot::Sender<()>>,
}

impl AbortHandle {
    fn fire(&mut self) {
        if let Some(tx) = self.tx.take() {
            let _ = tx.send(());
        }
    }
}

/// Tracks the in-flight generation per chat. Registration doubles as the
/// single-flight gate: a chat with a live handle rejects a second send.
#[derive(Clone, Default)]
pub struct AbortRegistry {
    inner: Arc<Mutex<HashMap<String, AbortHandle>>>,
}

impl AbortRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Claim the chat's generation slot. Fails with `Busy` while a previous
    /// registration has not been released.
    pub fn try_register(&self, chat_id: &str) -> Result<oneshot::Receiver<()>, ChatError> {
        let mut map = self
            .inner
            .lock()
            .map_err(|_| ChatError::Store("abort registry lock poisoned".to_string()))?;
        if map.contains_key(chat_id) {
            return Err(ChatError::Busy);
        }
        let (tx, rx) = oneshot::channel();
        map.insert(chat_id.to_string(), AbortHandle { tx: Some(tx) });
        Ok(rx)
    }

    /// Signal the in-flight generation, if any. Returns whether one was hit.
    pub fn abort(&self, chat_id: &str) -> bool {
        if let Ok(mut map) = self.inner.lock() {
            if let Some(mut handle) = map.remove(chat_id) {
                handle.fire();
                return true;
            }
        }
        false
    }

    pub fn release(&self, chat_id: &str) {
        if let Ok(mut map) = self.inner.lock() {
            map.remove(chat_id);
        }
    }

    pub fn is_in_flight(&self, chat_id: &str) -> bool {
        self.inner
            .lock()
            .map(|map| map.contains_key(chat_id))
            .unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn second_registration_is_busy_until_released() {
        let registry = AbortRegistry::new();
        let _rx = registry.try_register("c1").unwrap();
        assert!(matches!(registry.try_register("c1"), Err(ChatError::Busy)));

        registry.release("c1");
        assert!(registry.try_register("c1").is_ok());
    }

    #[tokio::test]
    async fn abort_fires_the_receiver() {
        let registry = AbortRegistry::new();
        let rx = registry.try_register("c1").unwrap();
        assert!(registry.abort("c1"));
        assert!(rx.await.is_ok());
        assert!(!registry.is_in_flight("c1"));
    }

    #[tokio::test]
    async fn abort_without_registration_reports_miss() {
        let registry = AbortRegistry::new();
        assert!(!registry.abort("nope"));
    }

    #[tokio::test]
    async fn chats_do_not_share_slots() {
        let registry = AbortRegistry::new();
        let _a = registry.try_register("a").unwrap();
        assert!(registry.try_register("b").is_ok());
    }
}
