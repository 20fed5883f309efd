//! Confidence gate for proposed edits.
//!
//! `factors` scores a proposal, `gate` combines the scores and decides
//! whether the edit is committed, held or discarded.

pub mod factors;
pub mod gate;

use serde::{Deserialize, Serialize};

pub use factors::{
    compute_input_fidelity, context_coherence, temporal_decay, transformation_quality,
    ValidationLimits,
};
pub use gate::{
    apply_thresholds, compute_confidence, compute_dynamic_thresholds, Confidence,
    ConfidenceFactors, Decision, GateOptions, ThresholdContext,
};

/// Decision thresholds, each in `[0, 1]`.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq)]
pub struct ConfidenceThresholds {
    /// Minimum input fidelity before the context stage runs at all.
    #[serde(default = "default_input")]
    pub input: f64,
    #[serde(default = "default_commit")]
    pub commit: f64,
    /// Extra bar a tone rewrite must clear on top of `commit`.
    #[serde(default = "default_tone")]
    pub tone: f64,
    #[serde(default = "default_discard")]
    pub discard: f64,
}

fn default_input() -> f64 {
    0.5
}

fn default_commit() -> f64 {
    0.8
}

fn default_tone() -> f64 {
    0.85
}

fn default_discard() -> f64 {
    0.3
}

impl Default for ConfidenceThresholds {
    fn default() -> Self {
        Self {
            input: default_input(),
            commit: default_commit(),
            tone: default_tone(),
            discard: default_discard(),
        }
    }
}

impl ConfidenceThresholds {
    /// Copy with every threshold clamped into `[0, 1]`; non-finite values
    /// fall back to their defaults.
    pub fn clamped(self) -> Self {
        fn clamp(v: f64, fallback: f64) -> f64 {
            if v.is_finite() {
                v.clamp(0.0, 1.0)
            } else {
                fallback
            }
        }
        Self {
            input: clamp(self.input, default_input()),
            commit: clamp(self.commit, default_commit()),
            tone: clamp(self.tone, default_tone()),
            discard: clamp(self.discard, default_discard()),
        }
    }
}
