//! The reconciler — one ordered, duplicate-free timeline per conversation.
//!
//! Three sources mutate a timeline: the local user's optimistic inserts,
//! the snapshot fetched at open, and the store's push channel.  All three
//! funnel through here so ordering and identity are decided in one place.
//!
//! Ordering: totally ordered by `created_at`, ties broken by insertion
//! order.  Identity: a provisional entry and its push-delivered
//! confirmation are the same logical message and collapse to one entry
//! (promoted in place, position preserved).

use chrono::Duration;
use uuid::Uuid;

use parlor_domain::{ConversationId, Message, MessageId, Role};
use parlor_store::{MessageUpdate, StoreEvent};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Push outcomes
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// What applying a push event did to the timeline.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PushOutcome {
    /// A new entry was inserted.
    Inserted,
    /// The insert collapsed into an existing provisional entry, which was
    /// promoted to the incoming confirmed identity.
    Collapsed { old_key: Uuid, new_key: Uuid },
    /// The insert matched an existing confirmed entry and was dropped.
    DuplicateDropped { existing_key: Uuid },
    /// An existing entry was updated in place.
    Updated,
    /// An entry was removed.
    Removed,
    /// The event referenced nothing we hold; nothing changed.
    Ignored,
}

impl PushOutcome {
    /// Whether the timeline visible to the UI changed.
    pub fn changed(&self) -> bool {
        !matches!(
            self,
            PushOutcome::DuplicateDropped { .. } | PushOutcome::Ignored
        )
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Timeline
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub struct Timeline {
    conversation_id: ConversationId,
    entries: Vec<Message>,
    dedup_window: Duration,
}

impl Timeline {
    pub fn new(conversation_id: ConversationId, dedup_window_secs: i64) -> Self {
        Self {
            conversation_id,
            entries: Vec::new(),
            dedup_window: Duration::seconds(dedup_window_secs),
        }
    }

    pub fn conversation_id(&self) -> ConversationId {
        self.conversation_id
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// A cloned snapshot of the visible timeline, oldest first.
    pub fn messages(&self) -> Vec<Message> {
        self.entries.clone()
    }

    pub fn last(&self) -> Option<&Message> {
        self.entries.last()
    }

    pub fn get(&self, key: Uuid) -> Option<&Message> {
        self.entries.iter().find(|m| m.id.key() == key)
    }

    // ── Ingestion ──────────────────────────────────────────────────

    /// Replace the timeline wholesale with a store snapshot.  Used once
    /// per conversation-open.
    pub fn ingest_snapshot(&mut self, messages: Vec<Message>) {
        self.entries.clear();
        for message in messages {
            self.insert_ordered(message);
        }
    }

    /// Append a provisional message immediately, before any network
    /// confirmation, so the UI stays responsive.  The entry lands in its
    /// correct chronological slot.
    pub fn ingest_optimistic(&mut self, message: Message) {
        self.insert_ordered(message);
    }

    /// Apply an insert/update/delete delivered by the push channel.  The
    /// caller has already verified the event belongs to this conversation.
    pub fn ingest_push(&mut self, event: StoreEvent) -> PushOutcome {
        debug_assert_eq!(event.conversation_id(), self.conversation_id);
        match event {
            StoreEvent::Inserted(message) => self.ingest_insert(message),
            StoreEvent::Updated { id, update, .. } => self.apply_update(id, &update),
            StoreEvent::Deleted { id, .. } => self.remove(id),
        }
    }

    fn ingest_insert(&mut self, message: Message) -> PushOutcome {
        let key = message.id.key();
        if self.get(key).is_some() {
            return PushOutcome::DuplicateDropped { existing_key: key };
        }

        // A provisional entry and its own push-delivered confirmation are
        // two identities for the same logical event: same role and content
        // within the tolerance window collapse to one visible entry.
        if let Some(idx) = self.find_logical_match(&message) {
            let existing = &mut self.entries[idx];
            if existing.id.is_provisional() {
                let old_key = existing.id.key();
                existing.id = message.id;
                existing.model = message.model;
                return PushOutcome::Collapsed {
                    old_key,
                    new_key: key,
                };
            }
            return PushOutcome::DuplicateDropped {
                existing_key: existing.id.key(),
            };
        }

        self.insert_ordered(message);
        PushOutcome::Inserted
    }

    fn find_logical_match(&self, incoming: &Message) -> Option<usize> {
        self.entries.iter().position(|m| {
            m.role == incoming.role
                && m.content == incoming.content
                && (m.created_at - incoming.created_at).abs() <= self.dedup_window
        })
    }

    fn apply_update(&mut self, id: Uuid, update: &MessageUpdate) -> PushOutcome {
        let Some(msg) = self.entries.iter_mut().find(|m| m.id.key() == id) else {
            return PushOutcome::Ignored;
        };
        if let Some(content) = &update.content {
            msg.content = content.clone();
        }
        if let Some(model) = &update.model {
            msg.model = Some(model.clone());
        }
        PushOutcome::Updated
    }

    fn remove(&mut self, id: Uuid) -> PushOutcome {
        let before = self.entries.len();
        self.entries.retain(|m| m.id.key() != id);
        if self.entries.len() < before {
            PushOutcome::Removed
        } else {
            PushOutcome::Ignored
        }
    }

    /// In-place identity rewrite once the store acknowledges persistence.
    /// Position is preserved; only the identity class changes.
    pub fn promote(&mut self, temp_key: Uuid, server_id: Uuid) -> bool {
        match self
            .entries
            .iter_mut()
            .find(|m| m.id.key() == temp_key && m.id.is_provisional())
        {
            Some(msg) => {
                msg.id = MessageId::Confirmed(server_id);
                true
            }
            None => false,
        }
    }

    /// Rewrite the content and model of an entry in place (regeneration).
    pub fn rewrite(&mut self, key: Uuid, content: String, model: Option<String>) -> bool {
        match self.entries.iter_mut().find(|m| m.id.key() == key) {
            Some(msg) => {
                msg.content = content;
                if model.is_some() {
                    msg.model = model;
                }
                true
            }
            None => false,
        }
    }

    // ── Queries for the trigger gate ───────────────────────────────

    /// Whether any assistant entry sits after the entry identified by
    /// `anchor_key`, excluding at most one key (the message being
    /// regenerated).  Position order equals `(created_at, arrival)` order.
    pub fn has_assistant_after(&self, anchor_key: Uuid, exclude: Option<Uuid>) -> bool {
        let Some(anchor_idx) = self.entries.iter().position(|m| m.id.key() == anchor_key) else {
            return false;
        };
        self.entries[anchor_idx + 1..]
            .iter()
            .any(|m| m.role == Role::Assistant && Some(m.id.key()) != exclude)
    }

    /// The nearest user message strictly before the entry at `key`.
    pub fn nearest_user_before(&self, key: Uuid) -> Option<&Message> {
        let idx = self.entries.iter().position(|m| m.id.key() == key)?;
        self.entries[..idx]
            .iter()
            .rev()
            .find(|m| m.role == Role::User)
    }

    // ── Internal ───────────────────────────────────────────────────

    fn insert_ordered(&mut self, message: Message) {
        // Equal timestamps keep arrival order: new entries go after.
        let pos = self
            .entries
            .partition_point(|m| m.created_at <= message.created_at);
        self.entries.insert(pos, message);
    }
}

impl std::fmt::Debug for Timeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Timeline")
            .field("conversation_id", &self.conversation_id)
            .field("len", &self.entries.len())
            .finish()
    }
}
