//! Notifications from the engine to its host.

use serde::Serialize;

use crate::region::ActiveRegion;
use crate::wave::CorrectionWave;

/// What the scheduler is doing, for the caret marker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SchedulerStatus {
    /// No text seen yet.
    Dormant,
    Idle,
    /// Typing burst in progress.
    Listening,
    /// Pause detected, catching up or running a wave.
    Thinking,
    /// Applying a wave.
    Sweeping,
    /// Last wave finished.
    Complete,
    /// Secure field or IME composition.
    Suspended,
    /// Turned off by the user.
    Disabled,
    /// No working generation adapter. Stays until one is attached.
    Unavailable,
}

impl SchedulerStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            SchedulerStatus::Dormant => "dormant",
            SchedulerStatus::Idle => "idle",
            SchedulerStatus::Listening => "listening",
            SchedulerStatus::Thinking => "thinking",
            SchedulerStatus::Sweeping => "sweeping",
            SchedulerStatus::Complete => "complete",
            SchedulerStatus::Suspended => "suspended",
            SchedulerStatus::Disabled => "disabled",
            SchedulerStatus::Unavailable => "corrections unavailable",
        }
    }
}

/// Host callbacks. Every method defaults to doing nothing.
///
/// Called from the scheduler's task; implementations should return quickly
/// and hand heavy work to their own threads.
pub trait CorrectionObserver: Send + Sync {
    fn on_status(&self, _status: SchedulerStatus) {}

    fn on_active_region(&self, _region: ActiveRegion) {}

    /// The engine edited the text. The host should replace its buffer.
    fn on_text_changed(&self, _text: &str, _caret: usize) {}

    fn on_wave_complete(&self, _wave: &CorrectionWave) {}

    fn on_rollback(&self, _wave: &CorrectionWave, _text: &str) {}

    fn on_unavailable(&self, _reason: &str) {}
}

/// Observer that ignores everything.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopObserver;

impl CorrectionObserver for NoopObserver {}
