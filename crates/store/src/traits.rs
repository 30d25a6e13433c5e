use async_trait::async_trait;
use tokio::sync::broadcast;
use uuid::Uuid;

use parlor_domain::{ConversationId, Message, Result};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Push events
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Fields of a persisted message that can change after insertion.
#[derive(Debug, Clone, Default)]
pub struct MessageUpdate {
    pub content: Option<String>,
    pub model: Option<String>,
}

/// A notification delivered on the store's realtime channel.
///
/// Events may arrive out of order or duplicated; the reconciler is the
/// one place that makes them safe to apply.
#[derive(Debug, Clone)]
pub enum StoreEvent {
    Inserted(Message),
    Updated {
        conversation_id: ConversationId,
        id: Uuid,
        update: MessageUpdate,
    },
    Deleted {
        conversation_id: ConversationId,
        id: Uuid,
    },
}

impl StoreEvent {
    /// The conversation this event belongs to — checked against the open
    /// conversation before the event is allowed anywhere near a timeline.
    pub fn conversation_id(&self) -> ConversationId {
        match self {
            StoreEvent::Inserted(msg) => msg.conversation_id,
            StoreEvent::Updated {
                conversation_id, ..
            }
            | StoreEvent::Deleted {
                conversation_id, ..
            } => *conversation_id,
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Subscription handle
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// A live push subscription.  Dropping the handle unsubscribes.
pub struct Subscription {
    rx: broadcast::Receiver<StoreEvent>,
}

impl Subscription {
    pub fn new(rx: broadcast::Receiver<StoreEvent>) -> Self {
        Self { rx }
    }

    /// Receive the next event.  Returns `None` once the channel is closed
    /// (store dropped or conversation deleted).  A lagged receiver skips
    /// the overwritten events and keeps going.
    pub async fn recv(&mut self) -> Option<StoreEvent> {
        loop {
            match self.rx.recv().await {
                Ok(event) => return Some(event),
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::warn!(skipped, "push subscription lagged; events dropped");
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription").finish()
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Store trait
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// The persistent message log the engine writes through.
///
/// Implementations are backend adapters (a realtime database, a sync
/// service, [`crate::MemoryStore`]) that translate between the engine's
/// types and whatever the backend speaks.
#[async_trait]
pub trait MessageStore: Send + Sync {
    /// Fetch the full message list for a conversation, oldest first.
    async fn fetch_snapshot(&self, conversation_id: ConversationId) -> Result<Vec<Message>>;

    /// Persist a message.  Returns the server-assigned id; the caller is
    /// responsible for promoting its provisional entry.
    async fn insert(&self, message: &Message) -> Result<Uuid>;

    /// Update fields of a persisted message.
    async fn update(
        &self,
        conversation_id: ConversationId,
        id: Uuid,
        update: MessageUpdate,
    ) -> Result<()>;

    /// Delete a conversation and every message in it.
    async fn delete_conversation(&self, conversation_id: ConversationId) -> Result<()>;

    /// Open a push subscription for one conversation.
    async fn subscribe(&self, conversation_id: ConversationId) -> Result<Subscription>;
}
