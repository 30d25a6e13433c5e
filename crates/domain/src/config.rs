use serde::{Deserialize, Serialize};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Engine configuration
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Tunables for the synchronization and trigger engine.
///
/// All fields have serde defaults so an empty TOML table (or a partial
/// one) deserializes to a working configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Seconds an untouched, empty conversation may stay open before it is
    /// auto-deleted.  Any content-producing interaction disarms the timer
    /// permanently for that conversation.
    #[serde(default = "d_inactivity_secs")]
    pub inactivity_secs: u64,

    /// Tolerance window (seconds) for collapsing a provisional message
    /// with its own push-delivered confirmation.  Two entries with the
    /// same role and content whose timestamps differ by at most this much
    /// are the same logical message.
    #[serde(default = "d_dedup_window_secs")]
    pub dedup_window_secs: i64,

    /// What a failed completion leaves behind.  `false`: the triggering
    /// message stays marked processed and a synthetic assistant failure
    /// message is appended (no double-posting; manual regeneration still
    /// works).  `true`: the mark is withdrawn and nothing is appended, so
    /// a later timeline change may retry automatically.
    #[serde(default)]
    pub retry_on_failure: bool,

    /// Model requested from the completion service when the caller does
    /// not specify one.
    #[serde(default = "d_default_model")]
    pub default_model: String,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            inactivity_secs: d_inactivity_secs(),
            dedup_window_secs: d_dedup_window_secs(),
            retry_on_failure: false,
            default_model: d_default_model(),
        }
    }
}

fn d_inactivity_secs() -> u64 {
    120
}

fn d_dedup_window_secs() -> i64 {
    5
}

fn d_default_model() -> String {
    "gpt-4o".into()
}
