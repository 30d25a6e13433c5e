//! The trigger engine — decides, after every timeline mutation, whether
//! an automatic completion request must be issued, and issues it at most
//! once per qualifying message.
//!
//! All volatile per-conversation state (the processed set, the generation
//! state, the interaction flag) lives in one conversation-keyed registry
//! behind a single mutex.  The gate check and the processed-set insert
//! happen under one lock acquisition — recording the intent to answer
//! comes before the network round-trip, which is what makes the guarantee
//! hold under re-renders and rapid repeated mutations.

use std::collections::{HashMap, HashSet};

use parking_lot::Mutex;
use serde::Serialize;
use uuid::Uuid;

use parlor_domain::{ConversationId, Role};

use crate::timeline::Timeline;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Generation state
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Per-conversation completion state.  At most one transition into
/// `Generating` may occur without an intervening return to `Idle`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum GenerationState {
    #[default]
    Idle,
    Generating,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Decisions
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// A gate pass for an automatic completion.  The message key is already
/// in the processed set and the state is `Generating` by the time the
/// caller sees this.
#[derive(Debug, Clone)]
pub struct TriggerDecision {
    pub message_key: Uuid,
    pub prompt: String,
}

/// A gate pass for a regeneration request.
#[derive(Debug, Clone)]
pub struct RegenDecision {
    /// The assistant message to rewrite in place.
    pub target_key: Uuid,
    /// Content of the nearest preceding user message.
    pub prompt: String,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Registry
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Default)]
struct ConversationRecord {
    /// Message keys a completion request was issued for (or is in flight
    /// for).  Append-only for the life of the process, except under the
    /// retry-on-failure policy.
    processed: HashSet<Uuid>,
    /// Provisional key → server key, recorded on promotion.  An in-flight
    /// task still holds the provisional key it triggered on; withdrawing
    /// its mark must reach the promoted identity too.
    aliases: HashMap<Uuid, Uuid>,
    generation: GenerationState,
    /// Set the first time the user performs a content-producing action in
    /// this conversation; permanently disarms the inactivity timer.
    interacted: bool,
}

/// Conversation-keyed trigger state, resident for the life of the client
/// process.  Switching conversations never reads or writes another
/// conversation's record.
#[derive(Debug, Default)]
pub struct TriggerRegistry {
    records: Mutex<HashMap<ConversationId, ConversationRecord>>,
}

impl TriggerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    // ── Gate evaluation ────────────────────────────────────────────

    /// Evaluate the automatic-trigger gate against the latest timeline
    /// state.  On a pass, the message key is recorded and the state moves
    /// to `Generating` before this returns — the gate is closed for any
    /// re-entrant check the moment the decision exists.
    pub fn try_begin(
        &self,
        conversation_id: ConversationId,
        timeline: &Timeline,
    ) -> Option<TriggerDecision> {
        // Gate 1: non-empty timeline, most recent entry is the user's.
        let last = timeline.last()?;
        if last.role != Role::User {
            return None;
        }
        let key = last.id.key();

        // Gate 3: attachment-bearing messages are answered by a separate
        // analysis path, which marks them processed itself.
        if !last.attachments.is_empty() {
            return None;
        }

        // Gate 4: not already answered.
        if timeline.has_assistant_after(key, None) {
            return None;
        }

        let mut records = self.records.lock();
        let record = records.entry(conversation_id).or_default();

        // Gate 2: never re-answer a message an attempt was made for.
        if record.processed.contains(&key) {
            return None;
        }

        // Gate 5: at most one in-flight completion per conversation.
        if record.generation == GenerationState::Generating {
            return None;
        }

        record.processed.insert(key);
        record.generation = GenerationState::Generating;

        Some(TriggerDecision {
            message_key: key,
            prompt: last.content.clone(),
        })
    }

    /// Evaluate the regeneration gate.  Gates 1–3 are bypassed (the
    /// target is already known); gate 4 excludes the message being
    /// regenerated, gate 5 applies unchanged.
    pub fn try_begin_regeneration(
        &self,
        conversation_id: ConversationId,
        timeline: &Timeline,
        assistant_key: Uuid,
    ) -> Option<RegenDecision> {
        let target = timeline.get(assistant_key)?;
        if target.role != Role::Assistant {
            return None;
        }
        let anchor = timeline.nearest_user_before(assistant_key)?;
        let anchor_key = anchor.id.key();
        let prompt = anchor.content.clone();

        if timeline.has_assistant_after(anchor_key, Some(assistant_key)) {
            return None;
        }

        let mut records = self.records.lock();
        let record = records.entry(conversation_id).or_default();
        if record.generation == GenerationState::Generating {
            return None;
        }
        record.generation = GenerationState::Generating;

        Some(RegenDecision {
            target_key: assistant_key,
            prompt,
        })
    }

    // ── State transitions ──────────────────────────────────────────

    pub fn generation_state(&self, conversation_id: ConversationId) -> GenerationState {
        self.records
            .lock()
            .get(&conversation_id)
            .map_or(GenerationState::Idle, |r| r.generation)
    }

    /// Release the conversation back to `Idle`.  Called in the cleanup
    /// step of every completion, success or failure.
    pub fn set_idle(&self, conversation_id: ConversationId) {
        if let Some(record) = self.records.lock().get_mut(&conversation_id) {
            record.generation = GenerationState::Idle;
        }
    }

    /// Reset the in-memory generation view when a conversation is opened.
    /// The processed set is deliberately left intact — it cannot be
    /// re-derived from the timeline while a reply is still in flight.
    pub fn reset_on_open(&self, conversation_id: ConversationId) {
        let mut records = self.records.lock();
        records.entry(conversation_id).or_default().generation = GenerationState::Idle;
    }

    // ── Processed set ──────────────────────────────────────────────

    /// Record that an attempt was made for a message.  Exposed so the
    /// out-of-band attachment-analysis path can mark its own targets.
    pub fn mark_processed(&self, conversation_id: ConversationId, key: Uuid) {
        self.records
            .lock()
            .entry(conversation_id)
            .or_default()
            .processed
            .insert(key);
    }

    /// Withdraw a mark after a failed attempt (retry-on-failure policy).
    /// The key may have been promoted while the attempt was in flight;
    /// the withdrawal follows the alias.
    pub fn unmark_processed(&self, conversation_id: ConversationId, key: Uuid) {
        if let Some(record) = self.records.lock().get_mut(&conversation_id) {
            record.processed.remove(&key);
            if let Some(promoted) = record.aliases.get(&key).copied() {
                record.processed.remove(&promoted);
            }
        }
    }

    /// Follow an identity promotion: a mark recorded against a
    /// provisional key must keep gating the message under its server
    /// identity, or the promoted message would trigger a second time.
    pub fn rename_processed(&self, conversation_id: ConversationId, old_key: Uuid, new_key: Uuid) {
        if let Some(record) = self.records.lock().get_mut(&conversation_id) {
            if record.processed.remove(&old_key) {
                record.processed.insert(new_key);
            }
            record.aliases.insert(old_key, new_key);
        }
    }

    pub fn is_processed(&self, conversation_id: ConversationId, key: Uuid) -> bool {
        self.records
            .lock()
            .get(&conversation_id)
            .is_some_and(|r| r.processed.contains(&key))
    }

    // ── Interaction flag ───────────────────────────────────────────

    pub fn note_interaction(&self, conversation_id: ConversationId) {
        self.records
            .lock()
            .entry(conversation_id)
            .or_default()
            .interacted = true;
    }

    pub fn interacted(&self, conversation_id: ConversationId) -> bool {
        self.records
            .lock()
            .get(&conversation_id)
            .is_some_and(|r| r.interacted)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parlor_domain::Message;

    fn setup() -> (TriggerRegistry, Timeline, ConversationId) {
        let conv = ConversationId::new();
        (TriggerRegistry::new(), Timeline::new(conv, 5), conv)
    }

    #[test]
    fn gate_passes_for_unanswered_user_message() {
        let (reg, mut tl, conv) = setup();
        tl.ingest_optimistic(Message::user(conv, "Hello"));

        let decision = reg.try_begin(conv, &tl).expect("gate should pass");
        assert_eq!(decision.prompt, "Hello");
        assert_eq!(reg.generation_state(conv), GenerationState::Generating);
        assert!(reg.is_processed(conv, decision.message_key));
    }

    #[test]
    fn gate_blocks_empty_timeline_and_assistant_tail() {
        let (reg, mut tl, conv) = setup();
        assert!(reg.try_begin(conv, &tl).is_none());

        tl.ingest_optimistic(Message::user(conv, "q"));
        tl.ingest_optimistic(Message::assistant(conv, "a", "gpt-4o"));
        assert!(reg.try_begin(conv, &tl).is_none());
    }

    #[test]
    fn gate_blocks_processed_message_forever() {
        let (reg, mut tl, conv) = setup();
        tl.ingest_optimistic(Message::user(conv, "Hello"));

        let first = reg.try_begin(conv, &tl).unwrap();
        reg.set_idle(conv);

        // Re-render: same timeline, state back to Idle — still blocked.
        assert!(reg.try_begin(conv, &tl).is_none());
        assert!(reg.is_processed(conv, first.message_key));
    }

    #[test]
    fn gate_blocks_while_generating() {
        let (reg, mut tl, conv) = setup();
        tl.ingest_optimistic(Message::user(conv, "one"));
        reg.try_begin(conv, &tl).unwrap();

        // A second user message arrives while the first is in flight.
        tl.ingest_optimistic(Message::user(conv, "two"));
        assert!(reg.try_begin(conv, &tl).is_none());

        // Released: the new message may now trigger.
        reg.set_idle(conv);
        let decision = reg.try_begin(conv, &tl).unwrap();
        assert_eq!(decision.prompt, "two");
    }

    #[test]
    fn gate_skips_attachment_bearing_messages() {
        let (reg, mut tl, conv) = setup();
        let msg = Message::user(conv, "see attached").with_attachments(vec![
            parlor_domain::Attachment {
                name: "a.pdf".into(),
                size: 10,
                mime_type: "application/pdf".into(),
                locator: "blob://a".into(),
            },
        ]);
        let key = msg.id.key();
        tl.ingest_optimistic(msg);

        assert!(reg.try_begin(conv, &tl).is_none());
        // The analysis path marks it itself.
        reg.mark_processed(conv, key);
        assert!(reg.is_processed(conv, key));
    }

    #[test]
    fn processed_set_is_keyed_per_conversation() {
        let (reg, mut tl_a, conv_a) = setup();
        let conv_b = ConversationId::new();
        let mut tl_b = Timeline::new(conv_b, 5);

        let msg = Message::user(conv_a, "same text");
        tl_a.ingest_optimistic(msg.clone());
        let mut msg_b = msg.clone();
        msg_b.conversation_id = conv_b;
        tl_b.ingest_optimistic(msg_b);

        reg.try_begin(conv_a, &tl_a).unwrap();
        // Conversation B has its own record; the same key is not marked there.
        let decision_b = reg.try_begin(conv_b, &tl_b).expect("b gates independently");
        assert_eq!(decision_b.prompt, "same text");
    }

    #[test]
    fn rename_keeps_gate_closed_across_promotion() {
        let (reg, mut tl, conv) = setup();
        let msg = Message::user(conv, "Hello");
        let temp_key = msg.id.key();
        tl.ingest_optimistic(msg);

        reg.try_begin(conv, &tl).unwrap();
        reg.set_idle(conv);

        // The store acknowledges: identity rewritten in place.
        let server_id = Uuid::new_v4();
        tl.promote(temp_key, server_id);
        reg.rename_processed(conv, temp_key, server_id);

        // The promoted message must not pass the gate again.
        assert!(reg.try_begin(conv, &tl).is_none());
    }

    #[test]
    fn reset_on_open_keeps_processed_set() {
        let (reg, mut tl, conv) = setup();
        tl.ingest_optimistic(Message::user(conv, "Hello"));
        let decision = reg.try_begin(conv, &tl).unwrap();

        reg.reset_on_open(conv);
        assert_eq!(reg.generation_state(conv), GenerationState::Idle);
        assert!(reg.is_processed(conv, decision.message_key));
    }

    #[test]
    fn unmark_allows_retry() {
        let (reg, mut tl, conv) = setup();
        tl.ingest_optimistic(Message::user(conv, "flaky"));
        let decision = reg.try_begin(conv, &tl).unwrap();

        // Failure under retry-on-failure: withdraw the mark, release.
        reg.unmark_processed(conv, decision.message_key);
        reg.set_idle(conv);

        assert!(reg.try_begin(conv, &tl).is_some());
    }

    #[test]
    fn unmark_follows_promotion_alias() {
        let (reg, mut tl, conv) = setup();
        let msg = Message::user(conv, "flaky");
        let temp_key = msg.id.key();
        tl.ingest_optimistic(msg);
        let decision = reg.try_begin(conv, &tl).unwrap();
        assert_eq!(decision.message_key, temp_key);

        // The message is promoted while the attempt is in flight.
        let server_id = Uuid::new_v4();
        tl.promote(temp_key, server_id);
        reg.rename_processed(conv, temp_key, server_id);

        // The failing task only knows the provisional key; withdrawing by
        // it must unblock the promoted identity.
        reg.unmark_processed(conv, temp_key);
        reg.set_idle(conv);

        let retry = reg.try_begin(conv, &tl).expect("promoted message retries");
        assert_eq!(retry.message_key, server_id);
    }

    #[test]
    fn regeneration_gate_excludes_its_own_target() {
        let (reg, mut tl, conv) = setup();
        let now = chrono::Utc::now();
        let user = Message::user(conv, "question").with_created_at(now);
        let reply = Message::assistant(conv, "answer", "gpt-4o")
            .with_created_at(now + chrono::Duration::seconds(1));
        let reply_key = reply.id.key();
        tl.ingest_optimistic(user);
        tl.ingest_optimistic(reply);

        let decision = reg
            .try_begin_regeneration(conv, &tl, reply_key)
            .expect("regeneration should pass");
        assert_eq!(decision.prompt, "question");
        assert_eq!(decision.target_key, reply_key);
        assert_eq!(reg.generation_state(conv), GenerationState::Generating);
    }

    #[test]
    fn regeneration_blocked_while_generating_or_superseded() {
        let (reg, mut tl, conv) = setup();
        let now = chrono::Utc::now();
        let user = Message::user(conv, "q").with_created_at(now);
        let old = Message::assistant(conv, "a1", "gpt-4o")
            .with_created_at(now + chrono::Duration::seconds(1));
        let newer = Message::assistant(conv, "a2", "gpt-4o")
            .with_created_at(now + chrono::Duration::seconds(3));
        let old_key = old.id.key();
        tl.ingest_optimistic(user);
        tl.ingest_optimistic(old);

        // In-flight completion blocks regeneration (gate 5).
        tl.ingest_optimistic(
            Message::user(conv, "next").with_created_at(now + chrono::Duration::seconds(2)),
        );
        reg.try_begin(conv, &tl).unwrap();
        assert!(reg.try_begin_regeneration(conv, &tl, old_key).is_none());
        reg.set_idle(conv);

        // A newer reply after the anchor blocks the redo (gate 4).
        tl.ingest_optimistic(newer);
        assert!(reg.try_begin_regeneration(conv, &tl, old_key).is_none());
    }

    #[test]
    fn regeneration_rejects_non_assistant_target() {
        let (reg, mut tl, conv) = setup();
        let user = Message::user(conv, "q");
        let key = user.id.key();
        tl.ingest_optimistic(user);
        assert!(reg.try_begin_regeneration(conv, &tl, key).is_none());
    }
}
