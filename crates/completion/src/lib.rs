//! Completion Client for Parlor.
//!
//! The engine submits `(conversation id, prompt, model)` and gets back
//! text plus optional attachments, or a typed failure.  The transport is
//! a collaborator: [`HttpCompletionClient`] speaks the OpenAI-compatible
//! chat completions contract, and test suites script their own
//! [`CompletionClient`] implementations.

pub mod http;
pub mod traits;

pub use http::HttpCompletionClient;
pub use traits::{CompletionClient, CompletionReply, CompletionRequest};
