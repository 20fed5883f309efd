//! Correction wave orchestration.
//!
//! A wave takes one snapshot of the text at a pause, computes the Active
//! Region once and runs Noise, Context and Tone over it in order. Each
//! accepted stage edits a working copy so later stages see earlier fixes.
//! Nothing touches the live text here: the caller applies the returned
//! diffs, re-checking the caret as it goes.

use futures_util::StreamExt;
use log::{debug, info, warn};
use serde::Serialize;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use super::{shift_offset, CorrectionDiff, Stage};
use crate::confidence::{
    apply_thresholds, compute_confidence, compute_dynamic_thresholds, compute_input_fidelity,
    context_coherence, temporal_decay, transformation_quality, ConfidenceFactors,
    ConfidenceThresholds, Decision, GateOptions, ThresholdContext, ValidationLimits,
};
use crate::error::{CorrectionError, Result};
use crate::generation::device::estimate_tokens;
use crate::generation::{DeviceTierPolicy, GenerationAdapter, StageSettings, StreamParams};
use crate::region::safety::is_grapheme_boundary;
use crate::region::{count_words, floor_boundary, is_caret_safe, ActiveRegion, RegionPolicy};
use crate::settings::{CorrectionSettings, ToneTarget};
use crate::streaming::{BurstState, DiffusionState};

/// Proposal age at which the temporal factor halves.
const DECAY_HALF_LIFE_MS: u64 = 10_000;

/// A verdict is one word; leave a little room for chatter around it.
const REVIEW_MAX_TOKENS: u32 = 20;

/// Text and caret captured when the pause was detected.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct WaveSnapshot {
    pub text: String,
    pub caret: usize,
    pub burst: BurstState,
    pub at_ms: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StageStatus {
    Applied,
    NoChange,
    Skipped,
    Held,
    Discarded,
    Failed,
    TimedOut,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StageReport {
    pub stage: Stage,
    pub status: StageStatus,
    pub confidence: Option<f64>,
}

#[derive(Debug)]
pub struct WaveOutcome {
    /// Accepted diffs in stage order. Each is in the coordinates left by the
    /// one before it, starting from `snapshot_text`.
    pub diffs: Vec<CorrectionDiff>,
    pub snapshot_text: String,
    /// `snapshot_text` with every diff applied.
    pub final_text: String,
    pub region: ActiveRegion,
    pub stages: Vec<StageReport>,
    /// Set when the session cannot correct at all.
    pub error: Option<CorrectionError>,
    /// Cancelled or overtaken by the caret; `diffs` is empty.
    pub aborted: bool,
    pub elapsed_ms: u64,
}

impl WaveOutcome {
    fn new(snapshot: &WaveSnapshot) -> Self {
        Self {
            diffs: Vec::new(),
            snapshot_text: snapshot.text.clone(),
            final_text: snapshot.text.clone(),
            region: ActiveRegion::empty(snapshot.caret),
            stages: Vec::new(),
            error: None,
            aborted: false,
            elapsed_ms: 0,
        }
    }

    fn abort(mut self, started: Instant) -> Self {
        self.diffs.clear();
        self.final_text = self.snapshot_text.clone();
        self.aborted = true;
        self.finish(started)
    }

    fn finish(mut self, started: Instant) -> Self {
        self.elapsed_ms = started.elapsed().as_millis() as u64;
        self
    }

    fn report(&mut self, stage: Stage, status: StageStatus, confidence: Option<f64>) {
        self.stages.push(StageReport {
            stage,
            status,
            confidence,
        });
    }

    pub fn status_of(&self, stage: Stage) -> Option<StageStatus> {
        self.stages
            .iter()
            .find(|r| r.stage == stage)
            .map(|r| r.status)
    }
}

/// The working copy a wave edits.
struct Working {
    text: String,
    caret: usize,
    region: ActiveRegion,
}

impl Working {
    fn span(&self) -> &str {
        self.region.slice(&self.text).unwrap_or("")
    }

    fn apply(&mut self, diff: &CorrectionDiff) -> bool {
        let Some(next) = diff.apply_to(&self.text) else {
            return false;
        };
        let delta = diff.delta();
        self.region.end = shift_offset(self.region.end, diff.start, diff.end, delta);
        self.caret = shift_offset(self.caret, diff.start, diff.end, delta);
        self.text = next;
        true
    }
}

enum Verdict {
    Accept(CorrectionDiff),
    Reject(StageStatus, Option<f64>),
}

pub struct WaveOrchestrator {
    policy: RegionPolicy,
    thresholds: ConfidenceThresholds,
    sensitivity: f64,
    tone_target: ToneTarget,
    limits: ValidationLimits,
    tier: DeviceTierPolicy,
    min_words: usize,
    min_chars: usize,
    stage_timeout: Duration,
    skip_tone: bool,
    self_review: bool,
}

impl WaveOrchestrator {
    pub fn new(settings: &CorrectionSettings, tier: DeviceTierPolicy) -> Self {
        Self {
            policy: RegionPolicy::from_settings(settings),
            thresholds: settings.thresholds,
            sensitivity: settings.sensitivity,
            tone_target: settings.tone_target,
            limits: ValidationLimits::from_settings(settings),
            tier,
            min_words: settings.min_words,
            min_chars: settings.min_chars,
            stage_timeout: Duration::from_millis(settings.stage_timeout_ms),
            skip_tone: false,
            self_review: settings.enable_self_review,
        }
    }

    /// Use a different region size for this wave.
    pub fn with_region_words(mut self, words: usize) -> Self {
        self.policy = self.policy.with_base_words(words);
        self
    }

    pub fn skip_tone(mut self, skip: bool) -> Self {
        self.skip_tone = skip;
        self
    }

    /// Run one wave.
    ///
    /// `caret` follows the live caret; the wave aborts as soon as it enters
    /// the region. Stage failures are reported per stage and do not stop
    /// the wave, except when the adapter is unavailable.
    pub async fn run(
        &self,
        snapshot: &WaveSnapshot,
        adapter: Option<Arc<dyn GenerationAdapter>>,
        caret: &watch::Receiver<usize>,
        cancel: &CancellationToken,
    ) -> WaveOutcome {
        let started = Instant::now();
        let mut outcome = WaveOutcome::new(snapshot);

        let Some(adapter) = adapter else {
            warn!("Wave requested without a generation adapter");
            outcome.error = Some(CorrectionError::AdapterMissing);
            return outcome.finish(started);
        };

        let mut state = DiffusionState::new(&snapshot.text, snapshot.caret);
        state.burst = snapshot.burst;
        let region = self.policy.compute_render_range(&state, snapshot.at_ms);
        outcome.region = region;

        let span = region.slice(&snapshot.text).unwrap_or("");
        if count_words(&snapshot.text, region) < self.min_words
            || span.trim().chars().count() < self.min_chars
        {
            debug!(
                "Region {}..{} too small for a wave, need more text",
                region.start, region.end
            );
            for stage in Stage::ALL {
                outcome.report(stage, StageStatus::Skipped, None);
            }
            return outcome.finish(started);
        }

        if !is_caret_safe(region.start, region.end, *caret.borrow()) {
            debug!("Caret entered region {}..{} before the wave began", region.start, region.end);
            return outcome.abort(started);
        }

        info!(
            "Wave over {}..{} ({} words) with {}",
            region.start,
            region.end,
            count_words(&snapshot.text, region),
            adapter.name()
        );

        let mut working = Working {
            text: snapshot.text.clone(),
            caret: state.caret,
            region,
        };

        for stage in Stage::ALL {
            if cancel.is_cancelled() {
                debug!("Wave cancelled before {} stage", stage);
                return outcome.abort(started);
            }

            match self
                .run_stage(stage, &working, adapter.as_ref(), snapshot, cancel, started)
                .await
            {
                Ok(Verdict::Accept(diff)) => {
                    if working.apply(&diff) {
                        debug!(
                            "{} stage accepted {}..{} (confidence {:.2})",
                            stage, diff.start, diff.end, diff.confidence
                        );
                        outcome.report(stage, StageStatus::Applied, Some(diff.confidence));
                        outcome.diffs.push(diff);
                    } else {
                        outcome.report(stage, StageStatus::Failed, None);
                    }
                }
                Ok(Verdict::Reject(status, confidence)) => {
                    debug!("{} stage: {:?}", stage, status);
                    outcome.report(stage, status, confidence);
                }
                Err(CorrectionError::Cancelled) => return outcome.abort(started),
                Err(e) if e.is_unavailable() => {
                    warn!("{} stage failed, adapter unavailable: {}", stage, e);
                    outcome.report(stage, StageStatus::Failed, None);
                    outcome.error = Some(e);
                    break;
                }
                Err(e @ CorrectionError::Timeout { .. }) => {
                    warn!("{}", e);
                    outcome.report(stage, StageStatus::TimedOut, None);
                }
                Err(e) => {
                    warn!("{} stage produced no diff: {}", stage, e);
                    outcome.report(stage, StageStatus::Failed, None);
                }
            }

            if !is_caret_safe(region.start, region.end, *caret.borrow()) {
                debug!("Caret entered region during {} stage, discarding wave", stage);
                return outcome.abort(started);
            }
        }

        if cancel.is_cancelled() || !is_caret_safe(region.start, region.end, *caret.borrow()) {
            return outcome.abort(started);
        }

        outcome.final_text = working.text;
        let outcome = outcome.finish(started);
        info!(
            "Wave finished in {}ms with {} diff(s)",
            outcome.elapsed_ms,
            outcome.diffs.len()
        );
        outcome
    }

    async fn run_stage(
        &self,
        stage: Stage,
        working: &Working,
        adapter: &dyn GenerationAdapter,
        snapshot: &WaveSnapshot,
        cancel: &CancellationToken,
        started: Instant,
    ) -> Result<Verdict> {
        let span = working.span();
        let region = working.region;
        let thresholds = compute_dynamic_thresholds(
            ThresholdContext {
                caret: working.caret,
                start: region.start,
                end: region.end,
                edit_type: stage,
            },
            &self.thresholds,
            self.sensitivity,
        );

        let fidelity = compute_input_fidelity(span);
        let settings = match stage {
            Stage::Noise => StageSettings::Noise {
                max_tokens: self.max_tokens(span),
            },
            Stage::Context => {
                if fidelity < thresholds.input {
                    debug!(
                        "Input fidelity {:.2} below {:.2}, skipping context stage",
                        fidelity, thresholds.input
                    );
                    return Ok(Verdict::Reject(StageStatus::Skipped, None));
                }
                let mut state = DiffusionState::new(&working.text, working.caret);
                state.burst = snapshot.burst;
                StageSettings::Context {
                    max_tokens: self.max_tokens(span),
                    context: self.policy.compute_context_range(&state, region),
                }
            }
            Stage::Tone => {
                if self.tone_target.is_none() || self.skip_tone {
                    return Ok(Verdict::Reject(StageStatus::Skipped, None));
                }
                StageSettings::Tone {
                    max_tokens: self.max_tokens(span),
                    target: self.tone_target,
                }
            }
        };
        let context_start = match &settings {
            StageSettings::Context { context, .. } => context.start.min(region.start),
            _ => region.start,
        };

        let params = StreamParams {
            text: working.text.clone(),
            caret: working.caret,
            active_region: region,
            settings,
        };

        let proposal = tokio::select! {
            _ = cancel.cancelled() => return Err(CorrectionError::Cancelled),
            collected = tokio::time::timeout(
                self.stage_timeout,
                collect(adapter, params, cancel.child_token()),
            ) => match collected {
                Ok(result) => result?,
                Err(_) => {
                    adapter.abort();
                    return Err(CorrectionError::Timeout {
                        stage,
                        ms: self.stage_timeout.as_millis() as u64,
                    });
                }
            },
        };

        let core = proposal.trim();
        if core.is_empty() {
            return Ok(Verdict::Reject(StageStatus::NoChange, None));
        }
        let lead = &span[..span.len() - span.trim_start().len()];
        let trail = &span[span.trim_end().len()..];
        let replacement = format!("{}{}{}", lead, core, trail);
        if replacement == span {
            return Ok(Verdict::Reject(StageStatus::NoChange, None));
        }

        let quality = transformation_quality(span, &replacement, &self.limits);
        let confidence = match stage {
            Stage::Noise => {
                if quality <= 0.0 {
                    return Ok(Verdict::Reject(StageStatus::Discarded, Some(0.0)));
                }
                quality
            }
            Stage::Context | Stage::Tone => {
                let before = working.text.get(context_start..region.start).unwrap_or("");
                let age_ms = started.elapsed().as_millis() as u64;
                let confidence = compute_confidence(ConfidenceFactors {
                    input_fidelity: fidelity,
                    transformation_quality: quality,
                    context_coherence: context_coherence(before, core),
                    temporal_decay: temporal_decay(age_ms, DECAY_HALF_LIFE_MS),
                });
                let decision = apply_thresholds(
                    &confidence,
                    &thresholds,
                    GateOptions {
                        require_tone: stage == Stage::Tone,
                    },
                );
                match decision {
                    Decision::Commit => confidence.combined,
                    Decision::Hold => {
                        return Ok(Verdict::Reject(StageStatus::Held, Some(confidence.combined)))
                    }
                    Decision::Discard => {
                        return Ok(Verdict::Reject(
                            StageStatus::Discarded,
                            Some(confidence.combined),
                        ))
                    }
                }
            }
        };

        if stage != Stage::Noise
            && self.self_review
            && !self.review(stage, working, core, adapter, cancel).await?
        {
            return Ok(Verdict::Reject(StageStatus::Discarded, Some(confidence)));
        }

        Ok(match minimal_diff(span, &replacement) {
            Some((from, to, text)) => Verdict::Accept(CorrectionDiff {
                start: region.start + from,
                end: region.start + to,
                text: text.to_string(),
                stage,
                confidence,
            }),
            None => Verdict::Reject(StageStatus::NoChange, None),
        })
    }

    /// Ask the model whether `proposal` is a fair reading of the region.
    ///
    /// Only an explicit "UNREASONABLE" rejects; a review that fails or
    /// times out keeps the edit.
    async fn review(
        &self,
        stage: Stage,
        working: &Working,
        proposal: &str,
        adapter: &dyn GenerationAdapter,
        cancel: &CancellationToken,
    ) -> Result<bool> {
        let params = StreamParams {
            text: working.text.clone(),
            caret: working.caret,
            active_region: working.region,
            settings: StageSettings::Review {
                max_tokens: REVIEW_MAX_TOKENS,
                reviewing: stage,
                proposal: proposal.to_string(),
            },
        };

        let reply = tokio::select! {
            _ = cancel.cancelled() => return Err(CorrectionError::Cancelled),
            collected = tokio::time::timeout(
                self.stage_timeout,
                collect(adapter, params, cancel.child_token()),
            ) => collected,
        };
        match reply {
            Ok(Ok(verdict)) => {
                let reasonable = !verdict.to_uppercase().contains("UNREASONABLE");
                if !reasonable {
                    debug!("Review rejected {} rewrite {:?}", stage, proposal);
                }
                Ok(reasonable)
            }
            Ok(Err(CorrectionError::Cancelled)) => Err(CorrectionError::Cancelled),
            Ok(Err(e)) => {
                warn!("Review of {} rewrite failed, keeping it: {}", stage, e);
                Ok(true)
            }
            Err(_) => {
                adapter.abort();
                warn!("Review of {} rewrite timed out, keeping it", stage);
                Ok(true)
            }
        }
    }

    fn max_tokens(&self, span: &str) -> u32 {
        self.tier.token_budget(estimate_tokens(span))
    }
}

async fn collect(
    adapter: &dyn GenerationAdapter,
    params: StreamParams,
    token: CancellationToken,
) -> Result<String> {
    let mut chunks = adapter.stream(params, token.clone()).await?;
    let mut out = String::new();
    while let Some(chunk) = chunks.next().await {
        out.push_str(&chunk?);
    }
    if token.is_cancelled() {
        return Err(CorrectionError::Cancelled);
    }
    Ok(out)
}

/// Smallest grapheme-aligned replacement turning `old` into `new`: the
/// changed range in `old` and its replacement text.
fn minimal_diff<'a>(old: &str, new: &'a str) -> Option<(usize, usize, &'a str)> {
    if old == new {
        return None;
    }
    let mut prefix = old
        .bytes()
        .zip(new.bytes())
        .take_while(|(a, b)| a == b)
        .count();
    while !old.is_char_boundary(prefix) || !new.is_char_boundary(prefix) {
        prefix -= 1;
    }
    prefix = floor_boundary(old, prefix).min(floor_boundary(new, prefix));

    let max_suffix = old.len().min(new.len()) - prefix;
    let mut suffix = old
        .bytes()
        .rev()
        .zip(new.bytes().rev())
        .take(max_suffix)
        .take_while(|(a, b)| a == b)
        .count();
    loop {
        let old_end = old.len() - suffix;
        let new_end = new.len() - suffix;
        if suffix == 0
            || (is_grapheme_boundary(old, old_end) && is_grapheme_boundary(new, new_end))
        {
            break;
        }
        suffix -= 1;
    }

    Some((prefix, old.len() - suffix, &new[prefix..new.len() - suffix]))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{Script, ScriptedAdapter};

    const TYPED: &str = "I was writting a lettr";

    fn snapshot(text: &str) -> WaveSnapshot {
        WaveSnapshot {
            text: text.to_string(),
            caret: text.len(),
            burst: BurstState::default(),
            at_ms: 10_000,
        }
    }

    fn orchestrator(settings: &CorrectionSettings) -> WaveOrchestrator {
        WaveOrchestrator::new(settings, DeviceTierPolicy::default())
    }

    async fn run(
        orch: &WaveOrchestrator,
        snap: &WaveSnapshot,
        adapter: &Arc<ScriptedAdapter>,
    ) -> WaveOutcome {
        let (_tx, caret) = watch::channel(snap.caret);
        let adapter = adapter.clone() as Arc<dyn GenerationAdapter>;
        orch.run(snap, Some(adapter), &caret, &CancellationToken::new())
            .await
    }

    fn apply_all(text: &str, diffs: &[CorrectionDiff]) -> String {
        diffs
            .iter()
            .fold(text.to_string(), |t, d| d.apply_to(&t).unwrap())
    }

    #[tokio::test]
    async fn noise_stage_fixes_both_typos() {
        let adapter = Arc::new(ScriptedAdapter::new());
        adapter.reply(Stage::Noise, "I was writing a letter");
        let snap = snapshot(TYPED);

        let outcome = run(&orchestrator(&CorrectionSettings::default()), &snap, &adapter).await;
        assert!(!outcome.aborted);
        assert!(outcome.error.is_none());
        assert_eq!(outcome.diffs.len(), 1);
        assert_eq!(outcome.diffs[0].stage, Stage::Noise);
        assert!(outcome.diffs[0].end <= snap.caret);
        assert_eq!(apply_all(TYPED, &outcome.diffs), "I was writing a letter");
        assert_eq!(outcome.final_text, "I was writing a letter");
        assert_eq!(outcome.status_of(Stage::Context), Some(StageStatus::NoChange));
        assert_eq!(outcome.status_of(Stage::Tone), Some(StageStatus::Skipped));
        assert_eq!(adapter.stages_requested(), vec![Stage::Noise, Stage::Context]);
    }

    #[tokio::test]
    async fn later_stages_see_earlier_fixes() {
        let adapter = Arc::new(ScriptedAdapter::new());
        adapter.reply(Stage::Noise, "I was writing a letter");
        let snap = snapshot(TYPED);

        run(&orchestrator(&CorrectionSettings::default()), &snap, &adapter).await;
        let requests = adapter.requests();
        assert_eq!(requests[1].region_text(), "I was writing a letter");
    }

    #[tokio::test]
    async fn missing_adapter_fails_fast() {
        let snap = snapshot(TYPED);
        let (_tx, caret) = watch::channel(snap.caret);
        let outcome = orchestrator(&CorrectionSettings::default())
            .run(&snap, None, &caret, &CancellationToken::new())
            .await;
        assert!(matches!(outcome.error, Some(CorrectionError::AdapterMissing)));
        assert!(outcome.diffs.is_empty());
        assert_eq!(outcome.final_text, TYPED);
    }

    #[tokio::test]
    async fn caret_inside_region_aborts_the_wave() {
        let adapter = Arc::new(ScriptedAdapter::new());
        adapter.reply(Stage::Noise, "I was writing a letter");
        let snap = snapshot(TYPED);
        let (_tx, caret) = watch::channel(5usize);

        let outcome = orchestrator(&CorrectionSettings::default())
            .run(
                &snap,
                Some(adapter.clone() as Arc<dyn GenerationAdapter>),
                &caret,
                &CancellationToken::new(),
            )
            .await;
        assert!(outcome.aborted);
        assert!(outcome.diffs.is_empty());
        assert!(adapter.requests().is_empty());
    }

    #[tokio::test]
    async fn cancelled_wave_discards_everything() {
        let adapter = Arc::new(ScriptedAdapter::new());
        adapter.reply(Stage::Noise, "I was writing a letter");
        let snap = snapshot(TYPED);
        let (_tx, caret) = watch::channel(snap.caret);
        let cancel = CancellationToken::new();
        cancel.cancel();

        let outcome = orchestrator(&CorrectionSettings::default())
            .run(
                &snap,
                Some(adapter as Arc<dyn GenerationAdapter>),
                &caret,
                &cancel,
            )
            .await;
        assert!(outcome.aborted);
        assert!(outcome.diffs.is_empty());
        assert_eq!(outcome.final_text, TYPED);
    }

    #[tokio::test]
    async fn conversational_context_reply_is_discarded() {
        let adapter = Arc::new(ScriptedAdapter::new());
        adapter.reply(Stage::Context, "Sorry, could you clarify what you mean?");
        let snap = snapshot("We went to the park and it were very sunny");

        let outcome = run(&orchestrator(&CorrectionSettings::default()), &snap, &adapter).await;
        assert!(outcome.diffs.is_empty());
        assert_eq!(outcome.status_of(Stage::Context), Some(StageStatus::Discarded));
        assert_eq!(outcome.final_text, snap.text);
    }

    #[tokio::test]
    async fn failing_stage_does_not_stop_the_wave() {
        let adapter = Arc::new(ScriptedAdapter::new());
        adapter.push(Stage::Noise, Script::Fail("model crashed".into()));
        let snap = snapshot(TYPED);

        let outcome = run(&orchestrator(&CorrectionSettings::default()), &snap, &adapter).await;
        assert_eq!(outcome.status_of(Stage::Noise), Some(StageStatus::Failed));
        assert_eq!(outcome.status_of(Stage::Context), Some(StageStatus::NoChange));
        assert!(outcome.error.is_none());
        assert!(!outcome.aborted);
    }

    #[tokio::test]
    async fn unavailable_adapter_is_surfaced() {
        let adapter = Arc::new(ScriptedAdapter::new());
        adapter.push(Stage::Noise, Script::Unavailable);
        let snap = snapshot(TYPED);

        let outcome = run(&orchestrator(&CorrectionSettings::default()), &snap, &adapter).await;
        assert!(outcome.error.as_ref().is_some_and(|e| e.is_unavailable()));
        assert_eq!(outcome.status_of(Stage::Context), None);
    }

    #[tokio::test(start_paused = true)]
    async fn stalled_stage_times_out() {
        let adapter = Arc::new(ScriptedAdapter::new());
        adapter.push(Stage::Noise, Script::Stall);
        let snap = snapshot(TYPED);

        let outcome = run(&orchestrator(&CorrectionSettings::default()), &snap, &adapter).await;
        assert_eq!(outcome.status_of(Stage::Noise), Some(StageStatus::TimedOut));
        assert_eq!(outcome.status_of(Stage::Context), Some(StageStatus::NoChange));
    }

    #[tokio::test]
    async fn short_region_needs_more_text() {
        let adapter = Arc::new(ScriptedAdapter::new());
        let snap = snapshot("hi there");

        let outcome = run(&orchestrator(&CorrectionSettings::default()), &snap, &adapter).await;
        assert!(outcome.diffs.is_empty());
        assert!(adapter.requests().is_empty());
        assert_eq!(outcome.status_of(Stage::Noise), Some(StageStatus::Skipped));
    }

    #[tokio::test]
    async fn tone_runs_only_with_a_target() {
        let mut settings = CorrectionSettings::default();
        settings.tone_target = ToneTarget::Professional;
        let adapter = Arc::new(ScriptedAdapter::new());
        let snap = snapshot(TYPED);

        run(&orchestrator(&settings), &snap, &adapter).await;
        assert_eq!(
            adapter.stages_requested(),
            vec![Stage::Noise, Stage::Context, Stage::Tone]
        );

        let adapter = Arc::new(ScriptedAdapter::new());
        run(&orchestrator(&settings).skip_tone(true), &snap, &adapter).await;
        assert_eq!(adapter.stages_requested(), vec![Stage::Noise, Stage::Context]);
    }

    #[tokio::test]
    async fn region_whitespace_is_preserved() {
        let adapter = Arc::new(ScriptedAdapter::new());
        adapter.reply(Stage::Noise, "  I was writing a letter\n");
        let text = format!("{} ", TYPED);
        let snap = snapshot(&text);

        let outcome = run(&orchestrator(&CorrectionSettings::default()), &snap, &adapter).await;
        assert_eq!(outcome.final_text, "I was writing a letter ");
    }

    fn permissive() -> CorrectionSettings {
        let mut settings = CorrectionSettings::default();
        settings.thresholds.commit = 0.5;
        settings.thresholds.discard = 0.1;
        settings
    }

    const PARK: &str = "We went to the park and it were very sunny";
    const PARK_FIXED: &str = "We went to the park and it was very sunny";

    #[tokio::test]
    async fn reviewed_context_rewrite_is_applied() {
        let adapter = Arc::new(ScriptedAdapter::new());
        adapter.reply(Stage::Context, PARK_FIXED);
        adapter.reply_review("REASONABLE");
        let snap = snapshot(PARK);

        let outcome = run(&orchestrator(&permissive()), &snap, &adapter).await;
        assert_eq!(outcome.status_of(Stage::Context), Some(StageStatus::Applied));
        assert_eq!(outcome.final_text, PARK_FIXED);

        let reviews = adapter.review_requests();
        assert_eq!(reviews.len(), 1);
        assert_eq!(
            reviews[0].settings,
            StageSettings::Review {
                max_tokens: REVIEW_MAX_TOKENS,
                reviewing: Stage::Context,
                proposal: PARK_FIXED.to_string(),
            }
        );
    }

    #[tokio::test]
    async fn unreasonable_rewrite_is_discarded() {
        let adapter = Arc::new(ScriptedAdapter::new());
        adapter.reply(Stage::Context, PARK_FIXED);
        adapter.reply_review("Unreasonable.");
        let snap = snapshot(PARK);

        let outcome = run(&orchestrator(&permissive()), &snap, &adapter).await;
        assert_eq!(outcome.status_of(Stage::Context), Some(StageStatus::Discarded));
        assert!(outcome.diffs.is_empty());
        assert_eq!(outcome.final_text, PARK);
    }

    #[tokio::test]
    async fn failed_review_keeps_the_rewrite() {
        let adapter = Arc::new(ScriptedAdapter::new());
        adapter.reply(Stage::Context, PARK_FIXED);
        adapter.push_review(Script::Fail("model crashed".into()));
        let snap = snapshot(PARK);

        let outcome = run(&orchestrator(&permissive()), &snap, &adapter).await;
        assert_eq!(outcome.status_of(Stage::Context), Some(StageStatus::Applied));
        assert_eq!(outcome.final_text, PARK_FIXED);
    }

    #[tokio::test]
    async fn review_can_be_turned_off() {
        let mut settings = permissive();
        settings.enable_self_review = false;
        let adapter = Arc::new(ScriptedAdapter::new());
        adapter.reply(Stage::Context, PARK_FIXED);
        adapter.reply_review("UNREASONABLE");
        let snap = snapshot(PARK);

        let outcome = run(&orchestrator(&settings), &snap, &adapter).await;
        assert_eq!(outcome.status_of(Stage::Context), Some(StageStatus::Applied));
        assert!(adapter.review_requests().is_empty());
    }

    #[tokio::test]
    async fn noise_rewrites_are_not_reviewed() {
        let adapter = Arc::new(ScriptedAdapter::new());
        adapter.reply(Stage::Noise, "I was writing a letter");
        adapter.reply_review("UNREASONABLE");
        let snap = snapshot(TYPED);

        let outcome = run(&orchestrator(&CorrectionSettings::default()), &snap, &adapter).await;
        assert_eq!(outcome.status_of(Stage::Noise), Some(StageStatus::Applied));
        assert!(adapter.review_requests().is_empty());
    }

    #[tokio::test]
    async fn stream_error_after_partial_reply_drops_the_stage() {
        let adapter = Arc::new(ScriptedAdapter::new());
        adapter.push(
            Stage::Noise,
            Script::FailAfter(
                vec!["I was ".into(), "writing ".into()],
                "decoder crashed".into(),
            ),
        );
        let snap = snapshot(TYPED);

        let outcome = run(&orchestrator(&CorrectionSettings::default()), &snap, &adapter).await;
        assert_eq!(outcome.status_of(Stage::Noise), Some(StageStatus::Failed));
        assert!(outcome.diffs.is_empty());
        assert!(outcome.error.is_none());
        assert!(!outcome.aborted);
        // the context stage still runs, over the untouched text
        assert_eq!(outcome.status_of(Stage::Context), Some(StageStatus::NoChange));
        assert_eq!(adapter.requests()[1].region_text(), TYPED);
        assert_eq!(outcome.final_text, TYPED);
    }

    #[test]
    fn minimal_diff_trims_common_ends() {
        assert_eq!(
            minimal_diff("I was writting a lettr", "I was writing a letter"),
            Some((10, 21, "ing a lette"))
        );
        assert_eq!(minimal_diff("same", "same"), None);
        // combining accent stays with its base letter
        assert_eq!(minimal_diff("cafe\u{301}s", "cafe\u{300}s"), Some((3, 6, "e\u{300}")));
    }
}
