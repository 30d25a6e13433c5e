use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Identifiers
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Opaque, stable conversation identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConversationId(pub Uuid);

impl ConversationId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ConversationId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for ConversationId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

/// Message identity, tagged by persistence state.
///
/// A message minted locally starts `Provisional` with a client-generated
/// id; once the store acknowledges persistence it is promoted in place to
/// `Confirmed` with the server-assigned id. A message that arrives purely
/// from the push channel is `Confirmed` from the start.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "state", content = "id", rename_all = "snake_case")]
pub enum MessageId {
    Provisional(Uuid),
    Confirmed(Uuid),
}

impl MessageId {
    /// Mint a fresh provisional id for a message awaiting persistence.
    pub fn provisional() -> Self {
        Self::Provisional(Uuid::new_v4())
    }

    /// The inner id, regardless of persistence state.  Used for set
    /// membership and timeline lookups.
    pub fn key(&self) -> Uuid {
        match self {
            Self::Provisional(id) | Self::Confirmed(id) => *id,
        }
    }

    pub fn is_provisional(&self) -> bool {
        matches!(self, Self::Provisional(_))
    }

    pub fn is_confirmed(&self) -> bool {
        matches!(self, Self::Confirmed(_))
    }
}

impl std::fmt::Display for MessageId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Provisional(id) => write!(f, "provisional:{id}"),
            Self::Confirmed(id) => write!(f, "confirmed:{id}"),
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Message
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Who authored a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
}

/// A file attached to a message.  Content extraction is out of scope; the
/// engine only carries the descriptor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Attachment {
    pub name: String,
    pub size: u64,
    pub mime_type: String,
    /// Where the attachment bytes live (URL, storage key — opaque here).
    pub locator: String,
}

/// A single message in a conversation timeline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub id: MessageId,
    pub conversation_id: ConversationId,
    pub role: Role,
    pub content: String,
    #[serde(default)]
    pub attachments: Vec<Attachment>,
    pub created_at: DateTime<Utc>,
    /// The model that produced this message (assistant messages only).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
}

// ── Convenience constructors ───────────────────────────────────────

impl Message {
    /// A provisional user message, stamped now.
    pub fn user(conversation_id: ConversationId, content: impl Into<String>) -> Self {
        Self {
            id: MessageId::provisional(),
            conversation_id,
            role: Role::User,
            content: content.into(),
            attachments: Vec::new(),
            created_at: Utc::now(),
            model: None,
        }
    }

    /// A provisional assistant message, stamped now.
    pub fn assistant(
        conversation_id: ConversationId,
        content: impl Into<String>,
        model: impl Into<String>,
    ) -> Self {
        Self {
            id: MessageId::provisional(),
            conversation_id,
            role: Role::Assistant,
            content: content.into(),
            attachments: Vec::new(),
            created_at: Utc::now(),
            model: Some(model.into()),
        }
    }

    pub fn with_attachments(mut self, attachments: Vec<Attachment>) -> Self {
        self.attachments = attachments;
        self
    }

    pub fn with_created_at(mut self, created_at: DateTime<Utc>) -> Self {
        self.created_at = created_at;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn provisional_and_confirmed_share_key_space() {
        let id = Uuid::new_v4();
        assert_eq!(MessageId::Provisional(id).key(), id);
        assert_eq!(MessageId::Confirmed(id).key(), id);
        assert_ne!(MessageId::Provisional(id), MessageId::Confirmed(id));
    }

    #[test]
    fn user_constructor_is_provisional() {
        let conv = ConversationId::new();
        let msg = Message::user(conv, "hello");
        assert!(msg.id.is_provisional());
        assert_eq!(msg.role, Role::User);
        assert!(msg.attachments.is_empty());
        assert!(msg.model.is_none());
    }

    #[test]
    fn assistant_constructor_carries_model() {
        let conv = ConversationId::new();
        let msg = Message::assistant(conv, "hi", "gpt-4o");
        assert_eq!(msg.role, Role::Assistant);
        assert_eq!(msg.model.as_deref(), Some("gpt-4o"));
    }

    #[test]
    fn message_serde_round_trip() {
        let conv = ConversationId::new();
        let msg = Message::user(conv, "payload").with_attachments(vec![Attachment {
            name: "notes.txt".into(),
            size: 42,
            mime_type: "text/plain".into(),
            locator: "blob://abc".into(),
        }]);

        let json = serde_json::to_string(&msg).unwrap();
        let back: Message = serde_json::from_str(&json).unwrap();
        assert_eq!(back, msg);
        assert!(back.id.is_provisional());
    }
}
