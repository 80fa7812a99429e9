//! Session persistence seam. The orchestrator only needs get/put by session id.

use anyhow::Result;
use async_trait::async_trait;
use dashmap::DashMap;

use super::state::ConversationState;

#[async_trait]
pub trait SessionStore: Send + Sync {
    async fn load(&self, session_id: &str) -> Result<Option<ConversationState>>;
    async fn save(&self, state: ConversationState) -> Result<()>;
}

/// Process-local store; sessions live until the process exits.
#[derive(Default)]
pub struct InMemorySessionStore {
    sessions: DashMap<String, ConversationState>,
}

impl InMemorySessionStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}

#[async_trait]
impl SessionStore for InMemorySessionStore {
    async fn load(&self, session_id: &str) -> Result<Option<ConversationState>> {
        Ok(self.sessions.get(session_id).map(|s| s.value().clone()))
    }

    async fn save(&self, state: ConversationState) -> Result<()> {
        self.sessions.insert(state.session_id.clone(), state);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Channel;

    #[tokio::test]
    async fn test_save_then_load() {
        let store = InMemorySessionStore::new();
        assert!(store.load("s1").await.unwrap().is_none());

        let mut state = ConversationState::new("s1", "u1", Channel::Telegram);
        state.add_message(crate::conversation::Role::User, "hola");
        store.save(state).await.unwrap();

        let loaded = store.load("s1").await.unwrap().unwrap();
        assert_eq!(loaded.turn_count, 1);
        assert_eq!(loaded.channel, Channel::Telegram);
        assert_eq!(store.len(), 1);
    }
}
