//! Correction waves: one pause-triggered Noise → Context → Tone pass and the
//! history that makes each pass reversible as a unit.

pub mod history;
pub mod orchestrator;

use serde::{Deserialize, Serialize};
use std::fmt;

pub use history::{
    apply_revert_ops, generate_revert_ops, CorrectionWave, RevertOp, WaveDiff, WaveHistory,
};
pub use orchestrator::{StageReport, StageStatus, WaveOrchestrator, WaveOutcome, WaveSnapshot};

/// Correction stages, in the order a wave runs them.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "lowercase")]
pub enum Stage {
    /// Typos and spacing inside the Active Region.
    Noise,
    /// Grammar and coherence, informed by the read-only context window.
    Context,
    /// Optional rewrite toward a configured tone.
    Tone,
}

impl Stage {
    pub const ALL: [Stage; 3] = [Stage::Noise, Stage::Context, Stage::Tone];

    pub fn as_str(self) -> &'static str {
        match self {
            Stage::Noise => "noise",
            Stage::Context => "context",
            Stage::Tone => "tone",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A proposed replacement of `start..end` with `text`.
///
/// Offsets are byte offsets into the text the diff was computed against.
/// Diffs never outlive the wave that produced them.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CorrectionDiff {
    pub start: usize,
    pub end: usize,
    pub text: String,
    pub stage: Stage,
    pub confidence: f64,
}

impl CorrectionDiff {
    /// Change in text length once applied.
    pub fn delta(&self) -> isize {
        self.text.len() as isize - (self.end as isize - self.start as isize)
    }

    /// Apply to `text`, returning `None` when the range is out of bounds or
    /// not on char boundaries.
    pub fn apply_to(&self, text: &str) -> Option<String> {
        if self.start > self.end || self.end > text.len() {
            return None;
        }
        if !text.is_char_boundary(self.start) || !text.is_char_boundary(self.end) {
            return None;
        }
        let mut out = String::with_capacity(text.len() + self.text.len());
        out.push_str(&text[..self.start]);
        out.push_str(&self.text);
        out.push_str(&text[self.end..]);
        Some(out)
    }
}

/// Shift `pos` past an edit of `start..end` that changed length by `delta`.
///
/// Positions before the edit are unchanged, positions after it move with
/// the delta, positions inside it collapse to the edit's new end.
pub(crate) fn shift_offset(pos: usize, start: usize, end: usize, delta: isize) -> usize {
    if pos < end {
        if pos <= start {
            return pos;
        }
        return (end as isize + delta).max(start as isize) as usize;
    }
    (pos as isize + delta).max(0) as usize
}
