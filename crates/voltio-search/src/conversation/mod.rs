pub mod state;
pub mod store;

pub use state::{
    ContextOpening, ConversationState, Message, Role, SearchAttempt, SearchContext, SearchState,
};
pub use store::{InMemorySessionStore, SessionStore};
