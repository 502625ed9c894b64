//! Conversation transcripts keyed by thread id.

use crate::llm::ChatMessage;
use dashmap::DashMap;
use uuid::Uuid;

/// Mint a fresh thread id. Every compiler invocation and every new chat
/// gets its own.
pub fn new_thread_id() -> String {
    Uuid::new_v4().to_string()
}

/// Concurrent map of thread id to transcript. Cheap to clone handles via
/// the caller holding it in an `Arc`.
#[derive(Default)]
pub struct SessionStore {
    sessions: DashMap<String, Vec<ChatMessage>>,
}

impl SessionStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn append(&self, thread_id: &str, message: ChatMessage) {
        self.sessions
            .entry(thread_id.to_string())
            .or_default()
            .push(message);
    }

    /// Snapshot of one transcript, oldest message first. Unknown threads
    /// read as empty.
    pub fn history(&self, thread_id: &str) -> Vec<ChatMessage> {
        self.sessions
            .get(thread_id)
            .map(|entry| entry.value().clone())
            .unwrap_or_default()
    }

    pub fn contains(&self, thread_id: &str) -> bool {
        self.sessions.contains_key(thread_id)
    }

    /// Drop a transcript once its conversation is over.
    pub fn discard(&self, thread_id: &str) {
        self.sessions.remove(thread_id);
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn append_and_history_preserve_order() {
        let store = SessionStore::new();
        store.append("t-1", ChatMessage::user("first"));
        store.append("t-1", ChatMessage::assistant("second"));

        let history = store.history("t-1");
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].content.as_deref(), Some("first"));
        assert_eq!(history[1].content.as_deref(), Some("second"));
    }

    #[test]
    fn threads_are_isolated() {
        let store = SessionStore::new();
        store.append("t-1", ChatMessage::user("one"));
        store.append("t-2", ChatMessage::user("two"));

        assert_eq!(store.history("t-1").len(), 1);
        assert_eq!(store.history("t-2").len(), 1);
        assert!(store.history("t-3").is_empty());
    }

    #[test]
    fn discard_removes_thread() {
        let store = SessionStore::new();
        store.append("t-1", ChatMessage::user("hello"));
        store.discard("t-1");
        assert!(!store.contains("t-1"));
        assert!(store.is_empty());
    }

    #[test]
    fn thread_ids_are_unique() {
        assert_ne!(new_thread_id(), new_thread_id());
    }
}
