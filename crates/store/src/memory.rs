//! In-process reference implementation of [`MessageStore`].
//!
//! Messages live in a `RwLock<HashMap>` keyed by conversation; each
//! conversation gets a broadcast channel that replays every mutation to
//! subscribers, which makes the push path behave like a realtime backend
//! (including the echo of your own inserts).

use std::collections::HashMap;

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use tokio::sync::broadcast;
use uuid::Uuid;

use parlor_domain::{ConversationId, Error, Message, MessageId, Result};

use crate::traits::{MessageStore, MessageUpdate, StoreEvent, Subscription};

/// Broadcast buffer per conversation.  Subscribers slower than this lag
/// and skip, same as a real push channel under backpressure.
const CHANNEL_CAPACITY: usize = 64;

pub struct MemoryStore {
    messages: RwLock<HashMap<ConversationId, Vec<Message>>>,
    channels: Mutex<HashMap<ConversationId, broadcast::Sender<StoreEvent>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            messages: RwLock::new(HashMap::new()),
            channels: Mutex::new(HashMap::new()),
        }
    }

    fn sender(&self, conversation_id: ConversationId) -> broadcast::Sender<StoreEvent> {
        self.channels
            .lock()
            .entry(conversation_id)
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0)
            .clone()
    }

    fn publish(&self, event: StoreEvent) {
        let sender = self.sender(event.conversation_id());
        // No receivers is fine — nobody has the conversation open.
        let _ = sender.send(event);
    }

    /// Number of messages currently held for a conversation.
    pub fn len(&self, conversation_id: ConversationId) -> usize {
        self.messages
            .read()
            .get(&conversation_id)
            .map_or(0, Vec::len)
    }

    pub fn is_empty(&self, conversation_id: ConversationId) -> bool {
        self.len(conversation_id) == 0
    }

    /// Whether the conversation still exists (has ever been written and
    /// was not deleted).
    pub fn contains(&self, conversation_id: ConversationId) -> bool {
        self.messages.read().contains_key(&conversation_id)
    }

    /// Inject an externally-authored event, as if another client wrote to
    /// the backend.  Persists inserts/updates/deletes and pushes them.
    pub fn inject(&self, event: StoreEvent) {
        match &event {
            StoreEvent::Inserted(msg) => {
                self.messages
                    .write()
                    .entry(msg.conversation_id)
                    .or_default()
                    .push(msg.clone());
            }
            StoreEvent::Updated {
                conversation_id,
                id,
                update,
            } => {
                self.apply_update(*conversation_id, *id, update);
            }
            StoreEvent::Deleted {
                conversation_id,
                id,
            } => {
                if let Some(list) = self.messages.write().get_mut(conversation_id) {
                    list.retain(|m| m.id.key() != *id);
                }
            }
        }
        self.publish(event);
    }

    fn apply_update(&self, conversation_id: ConversationId, id: Uuid, update: &MessageUpdate) {
        if let Some(list) = self.messages.write().get_mut(&conversation_id) {
            if let Some(msg) = list.iter_mut().find(|m| m.id.key() == id) {
                if let Some(content) = &update.content {
                    msg.content = content.clone();
                }
                if let Some(model) = &update.model {
                    msg.model = Some(model.clone());
                }
            }
        }
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl MessageStore for MemoryStore {
    async fn fetch_snapshot(&self, conversation_id: ConversationId) -> Result<Vec<Message>> {
        let mut snapshot = self
            .messages
            .read()
            .get(&conversation_id)
            .cloned()
            .unwrap_or_default();
        snapshot.sort_by_key(|m| m.created_at);
        Ok(snapshot)
    }

    async fn insert(&self, message: &Message) -> Result<Uuid> {
        let server_id = Uuid::new_v4();
        let mut confirmed = message.clone();
        confirmed.id = MessageId::Confirmed(server_id);

        self.messages
            .write()
            .entry(message.conversation_id)
            .or_default()
            .push(confirmed.clone());

        tracing::debug!(
            conversation_id = %message.conversation_id,
            server_id = %server_id,
            "message persisted"
        );

        // Echo the confirmed record on the push channel, like a realtime
        // backend notifying the writer of its own insert.
        self.publish(StoreEvent::Inserted(confirmed));
        Ok(server_id)
    }

    async fn update(
        &self,
        conversation_id: ConversationId,
        id: Uuid,
        update: MessageUpdate,
    ) -> Result<()> {
        let found = {
            let mut tables = self.messages.write();
            match tables
                .get_mut(&conversation_id)
                .and_then(|list| list.iter_mut().find(|m| m.id.key() == id))
            {
                Some(msg) => {
                    if let Some(content) = &update.content {
                        msg.content = content.clone();
                    }
                    if let Some(model) = &update.model {
                        msg.model = Some(model.clone());
                    }
                    true
                }
                None => false,
            }
        };

        if !found {
            return Err(Error::PersistenceFailed(format!(
                "update target {id} not found in {conversation_id}"
            )));
        }

        self.publish(StoreEvent::Updated {
            conversation_id,
            id,
            update,
        });
        Ok(())
    }

    async fn delete_conversation(&self, conversation_id: ConversationId) -> Result<()> {
        let removed = self.messages.write().remove(&conversation_id);
        self.channels.lock().remove(&conversation_id);
        tracing::debug!(
            conversation_id = %conversation_id,
            messages = removed.map_or(0, |list| list.len()),
            "conversation deleted"
        );
        Ok(())
    }

    async fn subscribe(&self, conversation_id: ConversationId) -> Result<Subscription> {
        Ok(Subscription::new(self.sender(conversation_id).subscribe()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn insert_assigns_server_id_and_echoes() {
        let store = MemoryStore::new();
        let conv = ConversationId::new();
        let mut sub = store.subscribe(conv).await.unwrap();

        let msg = Message::user(conv, "hello");
        let server_id = store.insert(&msg).await.unwrap();
        assert_ne!(server_id, msg.id.key());

        let event = sub.recv().await.unwrap();
        match event {
            StoreEvent::Inserted(echoed) => {
                assert_eq!(echoed.id, MessageId::Confirmed(server_id));
                assert_eq!(echoed.content, "hello");
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[tokio::test]
    async fn snapshot_is_sorted_by_created_at() {
        let store = MemoryStore::new();
        let conv = ConversationId::new();
        let now = chrono::Utc::now();

        let late = Message::user(conv, "late").with_created_at(now);
        let early =
            Message::user(conv, "early").with_created_at(now - chrono::Duration::seconds(10));
        store.insert(&late).await.unwrap();
        store.insert(&early).await.unwrap();

        let snapshot = store.fetch_snapshot(conv).await.unwrap();
        assert_eq!(snapshot.len(), 2);
        assert_eq!(snapshot[0].content, "early");
        assert_eq!(snapshot[1].content, "late");
    }

    #[tokio::test]
    async fn update_missing_message_is_persistence_failure() {
        let store = MemoryStore::new();
        let conv = ConversationId::new();
        let err = store
            .update(conv, Uuid::new_v4(), MessageUpdate::default())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::PersistenceFailed(_)));
    }

    #[tokio::test]
    async fn delete_conversation_drops_messages_and_channel() {
        let store = MemoryStore::new();
        let conv = ConversationId::new();
        store.insert(&Message::user(conv, "a")).await.unwrap();
        assert!(store.contains(conv));

        store.delete_conversation(conv).await.unwrap();
        assert!(!store.contains(conv));
        assert!(store.fetch_snapshot(conv).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn injected_events_persist_and_push() {
        let store = MemoryStore::new();
        let conv = ConversationId::new();
        let mut sub = store.subscribe(conv).await.unwrap();

        // Another client writes to the backend.
        let mut foreign = Message::user(conv, "from elsewhere");
        foreign.id = MessageId::Confirmed(Uuid::new_v4());
        store.inject(StoreEvent::Inserted(foreign.clone()));

        let event = sub.recv().await.unwrap();
        assert!(matches!(event, StoreEvent::Inserted(m) if m.content == "from elsewhere"));
        assert_eq!(store.fetch_snapshot(conv).await.unwrap().len(), 1);

        store.inject(StoreEvent::Deleted {
            conversation_id: conv,
            id: foreign.id.key(),
        });
        assert!(store.fetch_snapshot(conv).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn subscriptions_are_per_conversation() {
        let store = MemoryStore::new();
        let conv_a = ConversationId::new();
        let conv_b = ConversationId::new();
        let mut sub_a = store.subscribe(conv_a).await.unwrap();

        store.insert(&Message::user(conv_b, "other")).await.unwrap();
        store.insert(&Message::user(conv_a, "mine")).await.unwrap();

        // The first event seen on A's subscription is A's own insert.
        let event = sub_a.recv().await.unwrap();
        assert_eq!(event.conversation_id(), conv_a);
    }
}
