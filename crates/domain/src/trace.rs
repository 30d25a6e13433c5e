use serde::Serialize;

use crate::message::ConversationId;

/// Structured trace events emitted across all Parlor crates.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event")]
pub enum TraceEvent {
    SessionBound {
        conversation_id: ConversationId,
        snapshot_len: usize,
    },
    SessionUnbound {
        conversation_id: ConversationId,
    },
    /// A push event tagged with a different conversation id reached an
    /// open session.  Dropped, never applied to the active timeline.
    CrossConversationDropped {
        open_conversation_id: ConversationId,
        event_conversation_id: ConversationId,
    },
    /// A push insert collapsed into an existing timeline entry.
    DuplicateCollapsed {
        conversation_id: ConversationId,
        surviving_key: uuid::Uuid,
    },
    /// A provisional entry was rewritten to its server identity in place.
    MessagePromoted {
        conversation_id: ConversationId,
        provisional_key: uuid::Uuid,
        server_id: uuid::Uuid,
    },
    TriggerFired {
        conversation_id: ConversationId,
        message_key: uuid::Uuid,
        model: String,
    },
    CompletionFinished {
        conversation_id: ConversationId,
        message_key: uuid::Uuid,
        ok: bool,
        still_viewing: bool,
        duration_ms: u64,
    },
    ConversationExpired {
        conversation_id: ConversationId,
    },
}

impl TraceEvent {
    pub fn emit(&self) {
        let json = serde_json::to_string(self).unwrap_or_default();
        tracing::info!(trace_event = %json, "parlor_event");
    }
}
