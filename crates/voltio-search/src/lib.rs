pub mod backend;
pub mod chat;
pub mod config;
pub mod conversation;
pub mod error;
pub mod escalation;
pub mod llm;
pub mod search;
pub mod synonyms;
pub mod text;
pub mod types;

#[cfg(test)]
mod testing;

// Re-export primary types for convenience
pub use chat::engine::SearchOrchestrator;
pub use chat::TurnResponse;
pub use config::AssistantConfig;
pub use conversation::{ConversationState, InMemorySessionStore, SearchState, SessionStore};
pub use error::{OrchestratorError, SessionStateError};
pub use escalation::{EscalationDecision, EscalationDetector, EscalationReason};
pub use synonyms::SynonymIndex;
pub use types::{Channel, Intent, ItemDetail, OrderDetail, RankedItem, SearchFilters};

// Re-export collaborator seams and adapters
pub use backend::{
    CachedCatalog, CatalogService, EscalationSink, HttpCatalogService, HttpSearchService,
    LogEscalationSink, SearchService, WebhookEscalationSink,
};

// Re-export LLM types
pub use llm::{ApiProvider, GenerationConfig, LLMConfig, LLMManager, LLMMode, LLMProvider, ProviderInfo};

// Re-export common types
pub use anyhow::{Error, Result};
pub use uuid::Uuid;
