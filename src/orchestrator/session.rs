//! Per-session conversation history
//!
//! Sessions carry the last N turns for synthesis context; only the current
//! turn's normalized query drives retrieval. Locking is per session so
//! concurrent sessions never contend on one lock.

use crate::config::SessionConfig;
use crate::llm::ChatMessage;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};

#[derive(Default)]
struct SessionHistory {
    messages: Vec<ChatMessage>,
}

pub struct SessionStore {
    sessions: RwLock<HashMap<String, Arc<Mutex<SessionHistory>>>>,
    max_turns: usize,
}

impl SessionStore {
    pub fn new(config: &SessionConfig) -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
            max_turns: config.max_turns,
        }
    }

    async fn session(&self, session_id: &str) -> Arc<Mutex<SessionHistory>> {
        {
            let sessions = self.sessions.read().await;
            if let Some(session) = sessions.get(session_id) {
                return session.clone();
            }
        }
        let mut sessions = self.sessions.write().await;
        sessions
            .entry(session_id.to_string())
            .or_default()
            .clone()
    }

    /// Snapshot of the session's recent messages
    pub async fn history(&self, session_id: &str) -> Vec<ChatMessage> {
        let session = self.session(session_id).await;
        let history = session.lock().await;
        history.messages.clone()
    }

    /// Record one completed turn, trimming to the configured window
    pub async fn record_turn(&self, session_id: &str, user: ChatMessage, assistant: ChatMessage) {
        let session = self.session(session_id).await;
        let mut history = session.lock().await;
        history.messages.push(user);
        history.messages.push(assistant);

        // Two messages per turn
        let max_messages = self.max_turns * 2;
        if history.messages.len() > max_messages {
            let excess = history.messages.len() - max_messages;
            history.messages.drain(..excess);
        }
    }

    pub async fn session_count(&self) -> usize {
        self.sessions.read().await.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_history_trimmed_to_window() {
        let store = SessionStore::new(&SessionConfig { max_turns: 2 });

        for i in 0..5 {
            store
                .record_turn(
                    "s1",
                    ChatMessage::user(format!("q{}", i)),
                    ChatMessage::assistant(format!("a{}", i)),
                )
                .await;
        }

        let history = store.history("s1").await;
        assert_eq!(history.len(), 4);
        assert_eq!(history[0].content, "q3");
        assert_eq!(history[3].content, "a4");
    }

    #[tokio::test]
    async fn test_sessions_isolated() {
        let store = SessionStore::new(&SessionConfig::default());
        store
            .record_turn("s1", ChatMessage::user("q"), ChatMessage::assistant("a"))
            .await;

        assert_eq!(store.history("s1").await.len(), 2);
        assert!(store.history("s2").await.is_empty());
        assert_eq!(store.session_count().await, 2);
    }
}
