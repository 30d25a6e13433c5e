//! Shared domain types for Parlor.
//!
//! Everything the adapter crates and the engine agree on lives here:
//! message and conversation types, the shared error taxonomy, the engine
//! configuration, and structured trace events.

pub mod config;
pub mod conversation;
pub mod error;
pub mod message;
pub mod trace;

pub use config::EngineConfig;
pub use conversation::Conversation;
pub use error::{Error, Result};
pub use message::{Attachment, ConversationId, Message, MessageId, Role};
pub use trace::TraceEvent;
