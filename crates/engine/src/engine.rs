//! The engine facade — wires the reconciler, the trigger engine, and the
//! session lifecycle to the store and completion collaborators, and
//! exposes the surface the UI layer consumes.
//!
//! Every in-flight completion is a spawned task carrying the conversation
//! id captured at trigger time (the origin id).  A task persists under
//! the origin id no matter what; it only touches the visible timeline
//! after consulting the active-conversation cell.

use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::broadcast;
use uuid::Uuid;

use parlor_completion::{CompletionClient, CompletionRequest};
use parlor_domain::{
    Attachment, ConversationId, EngineConfig, Error, Message, MessageId, Result, TraceEvent,
};
use parlor_store::{MessageStore, MessageUpdate, StoreEvent, Subscription};

use crate::session::{ActiveCell, BoundSession};
use crate::timeline::{PushOutcome, Timeline};
use crate::trigger::{GenerationState, RegenDecision, TriggerDecision, TriggerRegistry};

/// Buffered events before slow UI subscribers start lagging.
const EVENT_CAPACITY: usize = 64;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// EngineEvent — the stream the UI renders from
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Events emitted to the UI layer.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type")]
pub enum EngineEvent {
    /// The visible timeline of the open conversation changed.
    #[serde(rename = "timeline")]
    TimelineChanged {
        conversation_id: ConversationId,
        messages: Vec<Message>,
    },

    /// The generation state of a conversation changed.
    #[serde(rename = "generation")]
    GenerationChanged {
        conversation_id: ConversationId,
        state: GenerationState,
    },

    /// A collaborator rejected our credentials; the UI should prompt for
    /// re-authentication.  No synthetic failure message accompanies this.
    #[serde(rename = "auth_required")]
    AuthRequired { conversation_id: ConversationId },

    /// An untouched conversation expired and was deleted; the UI should
    /// navigate to its default view.
    #[serde(rename = "expired")]
    ConversationExpired { conversation_id: ConversationId },
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Engine
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub struct Engine {
    store: Arc<dyn MessageStore>,
    completion: Arc<dyn CompletionClient>,
    config: EngineConfig,
    registry: TriggerRegistry,
    active: ActiveCell,
    session: Mutex<Option<BoundSession>>,
    events: broadcast::Sender<EngineEvent>,
    /// Handle to ourselves for spawning tasks that must not keep the
    /// engine alive on their own.
    self_weak: Weak<Engine>,
}

impl Engine {
    pub fn new(
        store: Arc<dyn MessageStore>,
        completion: Arc<dyn CompletionClient>,
        config: EngineConfig,
    ) -> Arc<Self> {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Arc::new_cyclic(|self_weak| Self {
            store,
            completion,
            config,
            registry: TriggerRegistry::new(),
            active: ActiveCell::new(),
            session: Mutex::new(None),
            events,
            self_weak: self_weak.clone(),
        })
    }

    // ── Lifecycle ──────────────────────────────────────────────────

    /// Bind the engine to a conversation: subscribe, ingest the snapshot,
    /// arm the inactivity timer.  Any previously bound conversation is
    /// torn down first — there is never more than one live subscription.
    ///
    /// A snapshot fetch failure leaves the timeline empty and returns
    /// `StoreUnavailable`; the session stays bound (push events still
    /// flow) and the caller may close and reopen to retry.
    pub async fn open_conversation(&self, id: ConversationId) -> Result<()> {
        self.close_current();
        self.registry.reset_on_open(id);

        let subscription = self
            .store
            .subscribe(id)
            .await
            .map_err(|error| Error::StoreUnavailable(format!("subscribe to {id}: {error}")))?;

        let mut timeline = Timeline::new(id, self.config.dedup_window_secs);
        let snapshot_error = match self.store.fetch_snapshot(id).await {
            Ok(messages) => {
                timeline.ingest_snapshot(messages);
                None
            }
            Err(error) => {
                tracing::warn!(
                    conversation_id = %id,
                    %error,
                    "snapshot fetch failed; timeline starts empty"
                );
                Some(Error::StoreUnavailable(format!("snapshot for {id}: {error}")))
            }
        };

        let weak = self.self_weak.clone();
        let timer = if self.registry.interacted(id) {
            None
        } else {
            Some(tokio::spawn(run_inactivity_timer(
                weak.clone(),
                id,
                Duration::from_secs(self.config.inactivity_secs),
            )))
        };

        let snapshot_len = timeline.len();
        {
            // Spawn the reader under the session lock: a push event landing
            // before the bind completes waits on the lock instead of being
            // dropped against an unbound session.
            let mut guard = self.session.lock();
            let reader = tokio::spawn(run_subscription(weak, id, subscription));
            *guard = Some(BoundSession {
                conversation_id: id,
                timeline,
                reader,
                timer,
            });
        }
        self.active.set(Some(id));
        TraceEvent::SessionBound {
            conversation_id: id,
            snapshot_len,
        }
        .emit();

        self.emit_timeline(id);
        self.emit(EngineEvent::GenerationChanged {
            conversation_id: id,
            state: self.registry.generation_state(id),
        });
        // The snapshot itself is a timeline mutation: a conversation that
        // ends on an unanswered user message may trigger right away.
        self.maybe_trigger();

        match snapshot_error {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }

    /// Unbind `id` if it is the open conversation.  In-flight completion
    /// requests keep running; only their UI-visible effects are
    /// suppressed.
    pub fn close_conversation(&self, id: ConversationId) {
        let session = {
            let mut guard = self.session.lock();
            match guard.as_ref() {
                Some(s) if s.conversation_id == id => guard.take(),
                _ => None,
            }
        };
        if let Some(mut session) = session {
            session.teardown();
            self.active.set(None);
            TraceEvent::SessionUnbound {
                conversation_id: id,
            }
            .emit();
        }
    }

    fn close_current(&self) {
        let session = self.session.lock().take();
        if let Some(mut session) = session {
            session.teardown();
            self.active.set(None);
            TraceEvent::SessionUnbound {
                conversation_id: session.conversation_id,
            }
            .emit();
        }
    }

    // ── User actions ───────────────────────────────────────────────

    /// Optimistically insert a user message, evaluate the trigger, and
    /// persist.  Persistence failure is logged, not fatal — the user
    /// keeps seeing the message, it is just not guaranteed durable.
    pub async fn send_user_message(
        &self,
        text: impl Into<String>,
        attachments: Vec<Attachment>,
    ) -> Result<MessageId> {
        let Some(conv) = self.active.current() else {
            return Err(Error::Other("no conversation is open".into()));
        };

        // Sending is a content-producing interaction: the inactivity
        // timer is disarmed for good.
        self.note_interaction(conv);

        let message = Message::user(conv, text).with_attachments(attachments);
        let provisional_id = message.id;
        let temp_key = provisional_id.key();
        {
            let mut guard = self.session.lock();
            let Some(session) = guard.as_mut() else {
                return Err(Error::Other("no conversation is open".into()));
            };
            if session.conversation_id != conv {
                return Err(Error::Other("conversation changed while sending".into()));
            }
            session.timeline.ingest_optimistic(message.clone());
        }
        self.emit_timeline(conv);
        self.maybe_trigger();

        match self.store.insert(&message).await {
            Ok(server_id) => {
                self.registry.rename_processed(conv, temp_key, server_id);
                self.finish_promotion(conv, temp_key, server_id);
                Ok(MessageId::Confirmed(server_id))
            }
            Err(error) => {
                tracing::warn!(
                    conversation_id = %conv,
                    %error,
                    "user message not durably persisted"
                );
                Ok(provisional_id)
            }
        }
    }

    /// Redo an assistant reply in place.  Reuses the mutual-exclusion
    /// gate; on success the existing message keeps its id and gets new
    /// content, persisted as an update.
    pub async fn regenerate(&self, assistant_message_id: Uuid) -> Result<()> {
        let Some(conv) = self.active.current() else {
            return Err(Error::Other("no conversation is open".into()));
        };
        let decision = {
            let guard = self.session.lock();
            let Some(session) = guard.as_ref() else {
                return Err(Error::Other("no conversation is open".into()));
            };
            if session.conversation_id != conv {
                return Err(Error::Other("conversation changed while regenerating".into()));
            }
            self.registry
                .try_begin_regeneration(conv, &session.timeline, assistant_message_id)
        };
        let Some(decision) = decision else {
            return Err(Error::Other(
                "regeneration is not possible for this message right now".into(),
            ));
        };

        // Redoing a reply is a user action; it disarms the timer too.
        self.note_interaction(conv);

        self.emit(EngineEvent::GenerationChanged {
            conversation_id: conv,
            state: GenerationState::Generating,
        });
        if let Some(engine) = self.self_weak.upgrade() {
            tokio::spawn(engine.run_regeneration(conv, decision));
        }
        Ok(())
    }

    /// Record a content-producing interaction (typing) for the open
    /// conversation, permanently disarming its inactivity timer.
    pub fn note_user_interaction(&self) {
        if let Some(conv) = self.active.current() {
            self.note_interaction(conv);
        }
    }

    /// Mark a message as handled by an out-of-band path (the attachment
    /// analysis flow), closing the automatic-trigger gate for it.
    pub fn mark_processed(&self, conversation_id: ConversationId, message_key: Uuid) {
        self.registry.mark_processed(conversation_id, message_key);
    }

    // ── Read surface ───────────────────────────────────────────────

    /// A cloned snapshot of the open conversation's timeline.
    pub fn timeline(&self) -> Vec<Message> {
        self.session
            .lock()
            .as_ref()
            .map_or_else(Vec::new, |s| s.timeline.messages())
    }

    pub fn open_conversation_id(&self) -> Option<ConversationId> {
        self.active.current()
    }

    pub fn generation_state(&self, conversation_id: ConversationId) -> GenerationState {
        self.registry.generation_state(conversation_id)
    }

    /// Subscribe to the engine's event stream.
    pub fn events(&self) -> broadcast::Receiver<EngineEvent> {
        self.events.subscribe()
    }

    // ── Push handling ──────────────────────────────────────────────

    fn handle_push(&self, bound_id: ConversationId, event: StoreEvent) {
        let event_conv = event.conversation_id();
        if event_conv != bound_id {
            tracing::warn!(
                open_conversation_id = %bound_id,
                event_conversation_id = %event_conv,
                "cross-conversation push event dropped"
            );
            TraceEvent::CrossConversationDropped {
                open_conversation_id: bound_id,
                event_conversation_id: event_conv,
            }
            .emit();
            return;
        }

        let changed = {
            let mut guard = self.session.lock();
            let Some(session) = guard.as_mut() else {
                return;
            };
            if session.conversation_id != bound_id {
                // Stale reader racing a conversation switch.
                return;
            }
            let outcome = session.timeline.ingest_push(event);
            match &outcome {
                PushOutcome::Collapsed { old_key, new_key } => {
                    // The gate must keep blocking the message under its
                    // new identity.
                    self.registry.rename_processed(bound_id, *old_key, *new_key);
                    TraceEvent::MessagePromoted {
                        conversation_id: bound_id,
                        provisional_key: *old_key,
                        server_id: *new_key,
                    }
                    .emit();
                }
                PushOutcome::DuplicateDropped { existing_key } => {
                    TraceEvent::DuplicateCollapsed {
                        conversation_id: bound_id,
                        surviving_key: *existing_key,
                    }
                    .emit();
                }
                _ => {}
            }
            outcome.changed()
        };

        if changed {
            self.emit_timeline(bound_id);
            self.maybe_trigger();
        }
    }

    /// The push channel closed under a still-bound session — resubscribe.
    async fn handle_disconnect(self: Arc<Self>, id: ConversationId) {
        if !self.active.is_open(id) {
            return;
        }
        match self.store.subscribe(id).await {
            Ok(subscription) => {
                tracing::info!(conversation_id = %id, "push channel re-established");
                let weak = self.self_weak.clone();
                let reader = tokio::spawn(run_subscription(weak, id, subscription));
                let mut guard = self.session.lock();
                match guard.as_mut() {
                    Some(session) if session.conversation_id == id => {
                        // The old reader (us) is finishing on its own.
                        let _ = std::mem::replace(&mut session.reader, reader);
                    }
                    _ => reader.abort(),
                }
            }
            Err(error) => {
                tracing::warn!(
                    conversation_id = %id,
                    %error,
                    "push channel lost and resubscribe failed"
                );
            }
        }
    }

    // ── Trigger & completion ───────────────────────────────────────

    /// Evaluate the trigger gate against the latest timeline state and,
    /// on a pass, spawn the completion round-trip.
    fn maybe_trigger(&self) {
        let decision = {
            let guard = self.session.lock();
            let Some(session) = guard.as_ref() else {
                return;
            };
            self.registry
                .try_begin(session.conversation_id, &session.timeline)
                .map(|decision| (session.conversation_id, decision))
        };
        let Some((origin, decision)) = decision else {
            return;
        };

        self.emit(EngineEvent::GenerationChanged {
            conversation_id: origin,
            state: GenerationState::Generating,
        });
        TraceEvent::TriggerFired {
            conversation_id: origin,
            message_key: decision.message_key,
            model: self.config.default_model.clone(),
        }
        .emit();
        if let Some(engine) = self.self_weak.upgrade() {
            tokio::spawn(engine.run_completion(origin, decision));
        }
    }

    async fn run_completion(self: Arc<Self>, origin: ConversationId, decision: TriggerDecision) {
        let started = Instant::now();
        let request = CompletionRequest {
            conversation_id: origin,
            prompt: decision.prompt.clone(),
            model: self.config.default_model.clone(),
        };
        let result = self.completion.complete(request).await;
        let ok = result.is_ok();
        let still_viewing = self.active.is_open(origin);

        match result {
            Ok(reply) => {
                let message =
                    Message::assistant(origin, reply.text, self.config.default_model.clone())
                        .with_attachments(reply.attachments);
                self.deliver_assistant_message(origin, message, still_viewing)
                    .await;
            }
            Err(error) if error.is_auth() => {
                tracing::warn!(
                    conversation_id = %origin,
                    %error,
                    "completion requires re-authentication"
                );
                self.emit(EngineEvent::AuthRequired {
                    conversation_id: origin,
                });
            }
            Err(error) => {
                tracing::warn!(conversation_id = %origin, %error, "completion failed");
                if self.config.retry_on_failure {
                    // Withdraw the mark so a later timeline change may
                    // attempt this message again.
                    self.registry.unmark_processed(origin, decision.message_key);
                } else if still_viewing {
                    let notice = Message::assistant(
                        origin,
                        format!("The assistant was unable to reply: {error}"),
                        self.config.default_model.clone(),
                    );
                    self.append_local(origin, notice);
                }
            }
        }

        // Cleanup runs regardless of outcome so the conversation is never
        // permanently wedged.
        self.registry.set_idle(origin);
        self.emit(EngineEvent::GenerationChanged {
            conversation_id: origin,
            state: GenerationState::Idle,
        });
        TraceEvent::CompletionFinished {
            conversation_id: origin,
            message_key: decision.message_key,
            ok,
            still_viewing,
            duration_ms: started.elapsed().as_millis() as u64,
        }
        .emit();
    }

    async fn run_regeneration(self: Arc<Self>, origin: ConversationId, decision: RegenDecision) {
        let started = Instant::now();
        let request = CompletionRequest {
            conversation_id: origin,
            prompt: decision.prompt,
            model: self.config.default_model.clone(),
        };
        let result = self.completion.complete(request).await;
        let ok = result.is_ok();
        let still_viewing = self.active.is_open(origin);

        match result {
            Ok(reply) => {
                let model = self.config.default_model.clone();
                if still_viewing {
                    let rewritten = {
                        let mut guard = self.session.lock();
                        match guard.as_mut() {
                            Some(session) if session.conversation_id == origin => session
                                .timeline
                                .rewrite(decision.target_key, reply.text.clone(), Some(model.clone())),
                            _ => false,
                        }
                    };
                    if rewritten {
                        self.emit_timeline(origin);
                    }
                }
                let update = MessageUpdate {
                    content: Some(reply.text),
                    model: Some(model),
                };
                if let Err(error) = self.store.update(origin, decision.target_key, update).await {
                    tracing::warn!(
                        conversation_id = %origin,
                        %error,
                        "regenerated reply not durably persisted"
                    );
                }
            }
            Err(error) if error.is_auth() => {
                tracing::warn!(
                    conversation_id = %origin,
                    %error,
                    "regeneration requires re-authentication"
                );
                self.emit(EngineEvent::AuthRequired {
                    conversation_id: origin,
                });
            }
            Err(error) => {
                // The original reply is still on screen; nothing synthetic
                // to add.
                tracing::warn!(conversation_id = %origin, %error, "regeneration failed");
            }
        }

        self.registry.set_idle(origin);
        self.emit(EngineEvent::GenerationChanged {
            conversation_id: origin,
            state: GenerationState::Idle,
        });
        TraceEvent::CompletionFinished {
            conversation_id: origin,
            message_key: decision.target_key,
            ok,
            still_viewing,
            duration_ms: started.elapsed().as_millis() as u64,
        }
        .emit();
    }

    /// Append a reply to the visible timeline (still-viewing path), then
    /// persist it under the origin id.  When the user has navigated away
    /// the append is skipped but persistence still happens, so the reply
    /// is waiting on return.
    async fn deliver_assistant_message(
        &self,
        origin: ConversationId,
        message: Message,
        still_viewing: bool,
    ) {
        let temp_key = message.id.key();
        if still_viewing {
            self.append_local(origin, message.clone());
        }

        match self.store.insert(&message).await {
            Ok(server_id) => self.finish_promotion(origin, temp_key, server_id),
            Err(error) => {
                // The user sees the reply if it was appended; it is just
                // not guaranteed durable.
                tracing::warn!(
                    conversation_id = %origin,
                    %error,
                    "assistant reply not durably persisted"
                );
            }
        }
    }

    /// Insert into the timeline if — checked again under the lock — the
    /// origin conversation is still the bound one.
    fn append_local(&self, origin: ConversationId, message: Message) {
        let appended = {
            let mut guard = self.session.lock();
            match guard.as_mut() {
                Some(session) if session.conversation_id == origin => {
                    session.timeline.ingest_optimistic(message);
                    true
                }
                _ => false,
            }
        };
        if appended {
            self.emit_timeline(origin);
        }
    }

    /// Promote a provisional timeline entry after the store acknowledged
    /// the insert.  A no-op when the push echo collapsed it first.
    fn finish_promotion(&self, origin: ConversationId, temp_key: Uuid, server_id: Uuid) {
        let promoted = {
            let mut guard = self.session.lock();
            match guard.as_mut() {
                Some(session) if session.conversation_id == origin => {
                    session.timeline.promote(temp_key, server_id)
                }
                _ => false,
            }
        };
        if promoted {
            TraceEvent::MessagePromoted {
                conversation_id: origin,
                provisional_key: temp_key,
                server_id,
            }
            .emit();
            self.emit_timeline(origin);
        }
    }

    // ── Inactivity expiry ──────────────────────────────────────────

    async fn fire_inactivity(self: Arc<Self>, id: ConversationId) {
        let session = {
            let mut guard = self.session.lock();
            match guard.as_ref() {
                Some(session) if session.conversation_id == id => {}
                _ => return,
            }
            // Interaction at any point after arming disarms permanently.
            if self.registry.interacted(id) {
                return;
            }
            guard.take()
        };
        let Some(mut session) = session else {
            return;
        };
        // We *are* the timer task; only the reader needs stopping.
        session.reader.abort();
        session.timer = None;
        self.active.set(None);

        if let Err(error) = self.store.delete_conversation(id).await {
            tracing::warn!(conversation_id = %id, %error, "expiry delete failed");
        }
        TraceEvent::ConversationExpired {
            conversation_id: id,
        }
        .emit();
        self.emit(EngineEvent::ConversationExpired {
            conversation_id: id,
        });
    }

    // ── Internal helpers ───────────────────────────────────────────

    fn note_interaction(&self, conv: ConversationId) {
        self.registry.note_interaction(conv);
        if let Some(session) = self.session.lock().as_mut() {
            if session.conversation_id == conv {
                session.cancel_timer();
            }
        }
    }

    fn emit(&self, event: EngineEvent) {
        let _ = self.events.send(event);
    }

    fn emit_timeline(&self, id: ConversationId) {
        let messages = {
            let guard = self.session.lock();
            match guard.as_ref() {
                Some(session) if session.conversation_id == id => session.timeline.messages(),
                _ => return,
            }
        };
        self.emit(EngineEvent::TimelineChanged {
            conversation_id: id,
            messages,
        });
    }
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("open", &self.active.current())
            .finish()
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Spawned tasks
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Pump push events from a subscription into the engine.  Holds only a
/// weak handle so a dropped engine ends the task.
///
/// Returns a boxed future: this task and [`Engine::handle_disconnect`] are
/// mutually recursive (a dropped channel re-subscribes and spawns a fresh
/// reader), and boxing breaks the `Send` auto-trait inference cycle that
/// the recursion would otherwise create.
fn run_subscription(
    weak: Weak<Engine>,
    id: ConversationId,
    mut subscription: Subscription,
) -> Pin<Box<dyn Future<Output = ()> + Send>> {
    Box::pin(async move {
        while let Some(event) = subscription.recv().await {
            let Some(engine) = weak.upgrade() else {
                return;
            };
            engine.handle_push(id, event);
        }
        tracing::debug!(conversation_id = %id, "push channel closed");
        if let Some(engine) = weak.upgrade() {
            engine.handle_disconnect(id).await;
        }
    })
}

/// Fire the inactivity expiry once, unless the session was interacted
/// with or unbound first.
async fn run_inactivity_timer(weak: Weak<Engine>, id: ConversationId, delay: Duration) {
    tokio::time::sleep(delay).await;
    if let Some(engine) = weak.upgrade() {
        engine.fire_inactivity(id).await;
    }
}
