//! Combination of confidence factors and the commit/hold/discard decision.
//!
//! Everything here is deterministic: the same factors and thresholds always
//! produce the same decision. Time only enters through the caller-supplied
//! `temporal_decay` factor.

use serde::Serialize;

use super::ConfidenceThresholds;
use crate::wave::Stage;

// Geometric-mean weights, summing to 1.
const W_INPUT: f64 = 0.25;
const W_TRANSFORM: f64 = 0.35;
const W_COHERENCE: f64 = 0.25;
const W_TEMPORAL: f64 = 0.15;

/// Edits ending this close to the caret need a slightly higher commit score.
const NEAR_CARET_BYTES: usize = 8;
const NEAR_CARET_PENALTY: f64 = 0.02;

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct ConfidenceFactors {
    pub input_fidelity: f64,
    pub transformation_quality: f64,
    pub context_coherence: f64,
    pub temporal_decay: f64,
}

impl Default for ConfidenceFactors {
    fn default() -> Self {
        Self {
            input_fidelity: 1.0,
            transformation_quality: 1.0,
            context_coherence: 1.0,
            temporal_decay: 1.0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Confidence {
    pub combined: f64,
    pub factors: ConfidenceFactors,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Decision {
    Commit,
    /// Not applied this cycle. Nothing is queued; the next wave starts over.
    Hold,
    Discard,
}

/// Where the edit sits and what kind of edit it is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ThresholdContext {
    pub caret: usize,
    pub start: usize,
    pub end: usize,
    pub edit_type: Stage,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct GateOptions {
    /// Also require `combined >= tone`.
    pub require_tone: bool,
}

fn unit(v: f64) -> f64 {
    if v.is_finite() {
        v.clamp(0.0, 1.0)
    } else {
        0.0
    }
}

/// Weighted geometric mean of the four factors.
///
/// Non-decreasing in every factor; any zero factor yields zero.
pub fn compute_confidence(factors: ConfidenceFactors) -> Confidence {
    let factors = ConfidenceFactors {
        input_fidelity: unit(factors.input_fidelity),
        transformation_quality: unit(factors.transformation_quality),
        context_coherence: unit(factors.context_coherence),
        temporal_decay: unit(factors.temporal_decay),
    };

    let combined = factors.input_fidelity.powf(W_INPUT)
        * factors.transformation_quality.powf(W_TRANSFORM)
        * factors.context_coherence.powf(W_COHERENCE)
        * factors.temporal_decay.powf(W_TEMPORAL);

    Confidence {
        combined: unit(combined),
        factors,
    }
}

/// Adjust `base` for the kind of edit, its distance from the caret and the
/// session sensitivity.
///
/// Noise edits get a slightly lower bar, tone rewrites a higher one. Higher
/// sensitivity divides the input, commit and tone thresholds; `discard`
/// never exceeds `commit`.
pub fn compute_dynamic_thresholds(
    ctx: ThresholdContext,
    base: &ConfidenceThresholds,
    sensitivity: f64,
) -> ConfidenceThresholds {
    let mut t = base.clamped();

    match ctx.edit_type {
        Stage::Noise => {
            t.input -= 0.05;
            t.commit -= 0.05;
        }
        Stage::Context => {}
        Stage::Tone => {
            t.input += 0.05;
            t.commit += 0.05;
        }
    }

    if ctx.start < ctx.end && ctx.caret.saturating_sub(ctx.end) < NEAR_CARET_BYTES {
        t.commit += NEAR_CARET_PENALTY;
    }

    let sensitivity = if sensitivity.is_finite() && sensitivity > 0.0 {
        sensitivity
    } else {
        1.0
    };
    t.input /= sensitivity;
    t.commit /= sensitivity;
    t.tone /= sensitivity;

    let mut t = t.clamped();
    t.discard = t.discard.min(t.commit);
    t
}

/// Classify a scored proposal.
pub fn apply_thresholds(
    confidence: &Confidence,
    thresholds: &ConfidenceThresholds,
    opts: GateOptions,
) -> Decision {
    let c = confidence.combined;
    if c < thresholds.discard {
        return Decision::Discard;
    }
    if c >= thresholds.commit && (!opts.require_tone || c >= thresholds.tone) {
        return Decision::Commit;
    }
    Decision::Hold
}
