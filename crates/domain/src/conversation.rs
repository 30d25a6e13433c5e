use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::message::ConversationId;

/// A conversation record.
///
/// The engine holds exactly one active subscription and one inactivity
/// timer per conversation per client session; the record itself is just
/// the durable header.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Conversation {
    pub id: ConversationId,
    pub title: String,
    pub created_at: DateTime<Utc>,
}

impl Conversation {
    pub fn new(title: impl Into<String>) -> Self {
        Self {
            id: ConversationId::new(),
            title: title.into(),
            created_at: Utc::now(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_conversations_get_distinct_ids() {
        let a = Conversation::new("First");
        let b = Conversation::new("Second");
        assert_ne!(a.id, b.id);
        assert_eq!(a.title, "First");
    }

    #[test]
    fn conversation_serde_round_trip() {
        let conv = Conversation::new("Weekly sync");
        let json = serde_json::to_string(&conv).unwrap();
        let back: Conversation = serde_json::from_str(&json).unwrap();
        assert_eq!(back, conv);
    }
}
