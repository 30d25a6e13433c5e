//! Conversation synchronization & AI-response orchestration for Parlor.
//!
//! Keeps one per-conversation timeline correct while three asynchronous
//! sources mutate it — local optimistic inserts, the store's push feed,
//! and the automatic reply trigger — with strict conversation isolation,
//! an at-most-once trigger guarantee, and an inactivity auto-expiry that
//! cannot race user interaction.

pub mod engine;
pub mod session;
pub mod timeline;
pub mod trigger;

pub use engine::{Engine, EngineEvent};
pub use timeline::{PushOutcome, Timeline};
pub use trigger::{GenerationState, TriggerRegistry};
