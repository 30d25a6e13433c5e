use async_trait::async_trait;

use parlor_domain::{Attachment, ConversationId, Result};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Request / Reply types
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// A completion request for one user message.
#[derive(Debug, Clone)]
pub struct CompletionRequest {
    /// The conversation the reply belongs to.  Carried so the service can
    /// attribute usage; the engine also uses it as the origin id for the
    /// whole round-trip.
    pub conversation_id: ConversationId,
    /// The user message content to answer.
    pub prompt: String,
    /// Model identifier to generate with.
    pub model: String,
}

/// A successful completion.
#[derive(Debug, Clone)]
pub struct CompletionReply {
    pub text: String,
    /// Attachments produced by the service (generated files, citations).
    pub attachments: Vec<Attachment>,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Client trait
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// The external text-generation service.
///
/// Failures are reported through the shared error taxonomy; the engine
/// treats [`parlor_domain::Error::AuthRequired`] specially (no synthetic
/// failure message, re-authentication surfaced to the UI).
#[async_trait]
pub trait CompletionClient: Send + Sync {
    async fn complete(&self, request: CompletionRequest) -> Result<CompletionReply>;
}
