//! Session binding — the engine is bound to at most one conversation at a
//! time, and every long-running task carries the conversation id it was
//! started for.
//!
//! The "still viewing" problem (a completion resolving after the user has
//! navigated away) is solved by one cell: [`ActiveCell`] holds the
//! currently-open conversation id, and every completing task consults it
//! once before applying UI-visible effects.

use parking_lot::Mutex;
use tokio::task::JoinHandle;

use parlor_domain::ConversationId;

use crate::timeline::Timeline;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Active-conversation cell
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// The single source of truth for "which conversation is open right now".
#[derive(Debug, Default)]
pub struct ActiveCell {
    current: Mutex<Option<ConversationId>>,
}

impl ActiveCell {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self, id: Option<ConversationId>) {
        *self.current.lock() = id;
    }

    pub fn current(&self) -> Option<ConversationId> {
        *self.current.lock()
    }

    /// Whether `id` is the conversation the user is viewing.  Consulted
    /// once, atomically, by completing tasks before they touch the UI.
    pub fn is_open(&self, id: ConversationId) -> bool {
        *self.current.lock() == Some(id)
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Bound session
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Everything tied to the currently-open conversation: its timeline, the
/// push-subscription reader, and the inactivity timer.
///
/// Exactly one of these exists at a time; binding a new conversation
/// tears the previous one down first.
pub struct BoundSession {
    pub conversation_id: ConversationId,
    pub timeline: Timeline,
    pub reader: JoinHandle<()>,
    pub timer: Option<JoinHandle<()>>,
}

impl BoundSession {
    /// Stop the subscription reader and the inactivity timer.  In-flight
    /// completion requests are left alone — only their UI-visible effects
    /// are suppressed, via [`ActiveCell`].
    pub fn teardown(&mut self) {
        self.reader.abort();
        self.cancel_timer();
    }

    /// Disarm the inactivity timer task, if one is still pending.
    pub fn cancel_timer(&mut self) {
        if let Some(timer) = self.timer.take() {
            timer.abort();
        }
    }
}

impl std::fmt::Debug for BoundSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BoundSession")
            .field("conversation_id", &self.conversation_id)
            .field("timeline", &self.timeline)
            .field("timer_armed", &self.timer.is_some())
            .finish()
    }
}
