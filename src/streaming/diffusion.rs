//! Diffusion controller.
//!
//! Streams noise corrections into the text behind the caret word by word.
//! A frontier marks how far the trailing text has been confirmed; it only
//! ever moves forward while typing continues and is pulled back when the
//! user edits before it.

use futures_util::{FutureExt, StreamExt};
use log::{debug, trace, warn};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use strsim::normalized_levenshtein;
use tokio_util::sync::CancellationToken;

use super::pause_detector::BurstState;
use crate::confidence::{transformation_quality, ValidationLimits};
use crate::error::{CorrectionError, Result};
use crate::generation::device::estimate_tokens;
use crate::generation::{ChunkStream, DeviceTierPolicy, GenerationAdapter, StageSettings, StreamParams};
use crate::region::safety::is_grapheme_boundary;
use crate::region::{is_caret_safe, ActiveRegion, RegionPolicy};
use crate::settings::CorrectionSettings;
use crate::wave::{shift_offset, CorrectionDiff, Stage, WaveDiff};

/// Upper bound on catch-up steps for one pause.
pub const MAX_CATCH_UP_ITERATIONS: usize = 200;

/// Streamed words less similar than this to what was typed are held back
/// until the whole proposal has arrived and been validated.
const MIN_WORD_SIMILARITY: f64 = 0.5;

/// Session text as the controller sees it.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DiffusionState {
    pub text: String,
    pub caret: usize,
    /// Confirmed up to here. Always `<= caret`.
    pub frontier: usize,
    pub burst: BurstState,
}

impl DiffusionState {
    pub fn new(text: &str, caret: usize) -> Self {
        let caret = caret.min(text.len());
        Self {
            text: text.to_string(),
            caret,
            frontier: caret,
            burst: BurstState::default(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum DiffusionPhase {
    /// Frontier has reached the caret.
    Idle,
    /// Frontier is behind the caret and advances on ticks.
    Streaming,
    /// A pause forced the frontier forward.
    CatchingUp,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickOutcome {
    /// Nothing to confirm.
    Idle,
    /// A stream is open but has no usable output yet.
    Waiting,
    Advanced { words: usize, applied: usize },
}

/// One in-flight noise stream over `start..start + current.len()`.
struct ActiveStream {
    chunks: ChunkStream,
    token: CancellationToken,
    start: usize,
    /// Span text when the stream began.
    original: String,
    /// Span text now, with confirmed edits applied.
    current: String,
    /// Word spans of `original`.
    words: Vec<(usize, usize)>,
    /// Length change of `current` relative to `original` so far.
    shift: isize,
    proposal: String,
    confirmed: usize,
    done: bool,
    quality: Option<f64>,
}

impl ActiveStream {
    fn end(&self) -> usize {
        self.start + self.current.len()
    }

    fn locate(&self, rel: usize) -> usize {
        (rel as isize + self.shift) as usize
    }
}

struct Confirmed {
    words: usize,
    applied: usize,
    finished: bool,
}

pub struct DiffusionController {
    state: DiffusionState,
    phase: DiffusionPhase,
    policy: RegionPolicy,
    limits: ValidationLimits,
    tier: DeviceTierPolicy,
    max_words_per_tick: usize,
    burst_gap_ms: u64,
    step_timeout: Duration,
    adapter: Option<Arc<dyn GenerationAdapter>>,
    active: Option<ActiveStream>,
    /// Edits made since the last `take_applied`.
    applied: Vec<WaveDiff>,
}

impl DiffusionController {
    pub fn new(settings: &CorrectionSettings) -> Self {
        Self {
            state: DiffusionState::new("", 0),
            phase: DiffusionPhase::Idle,
            policy: RegionPolicy::from_settings(settings),
            limits: ValidationLimits::from_settings(settings),
            tier: DeviceTierPolicy::default(),
            max_words_per_tick: settings.max_words_per_tick.max(1),
            burst_gap_ms: settings.burst_recent_key_ms,
            step_timeout: Duration::from_millis(settings.stage_timeout_ms),
            adapter: None,
            active: None,
            applied: Vec::new(),
        }
    }

    pub fn set_adapter(&mut self, adapter: Option<Arc<dyn GenerationAdapter>>) {
        self.abort();
        self.adapter = adapter;
    }

    pub fn set_tier(&mut self, tier: DeviceTierPolicy) {
        self.tier = tier;
    }

    pub fn set_policy(&mut self, policy: RegionPolicy) {
        self.policy = policy;
    }

    pub fn state(&self) -> &DiffusionState {
        &self.state
    }

    pub fn text(&self) -> &str {
        &self.state.text
    }

    pub fn caret(&self) -> usize {
        self.state.caret
    }

    pub fn frontier(&self) -> usize {
        self.state.frontier
    }

    pub fn phase(&self) -> DiffusionPhase {
        self.phase
    }

    pub fn is_streaming(&self) -> bool {
        self.active.is_some()
    }

    /// Track the latest host snapshot. Never edits the text itself.
    pub fn update(&mut self, text: &str, caret: usize, at_ms: u64) {
        if self.state.text != text {
            let prefix = common_prefix(&self.state.text, text);
            self.state.frontier = self.state.frontier.min(prefix);
            self.state.burst.record_key(at_ms, self.burst_gap_ms);
            self.state.text = text.to_string();
        }
        self.state.caret = caret.min(text.len());
        self.state.frontier = self.state.frontier.min(self.state.caret);

        if let Some(stream) = self.active.take() {
            if self.is_current(&stream) {
                self.active = Some(stream);
            } else {
                debug!(
                    "Dropping stale stream over {}..{} (caret {})",
                    stream.start,
                    stream.end(),
                    self.state.caret
                );
                stream.token.cancel();
            }
        }
        self.refresh_phase();
    }

    /// Replace the text outright, e.g. after a rollback. Everything up to the
    /// caret counts as confirmed.
    pub fn reset(&mut self, text: &str, caret: usize) {
        self.abort();
        let burst = self.state.burst;
        self.state = DiffusionState::new(text, caret);
        self.state.burst = burst;
        self.refresh_phase();
    }

    /// Advance the frontier with whatever output is ready right now.
    ///
    /// Never waits on the model. Errors leave the controller without a
    /// stream and the frontier past the failed span.
    pub async fn tick_once(&mut self, now_ms: u64) -> Result<TickOutcome> {
        if self.active.is_none() {
            if self.state.frontier >= self.state.caret {
                self.refresh_phase();
                return Ok(TickOutcome::Idle);
            }
            if !self.start_stream(now_ms, false).await? {
                self.refresh_phase();
                return Ok(TickOutcome::Idle);
            }
        }

        let Some(mut stream) = self.active.take() else {
            return Ok(TickOutcome::Idle);
        };
        if !self.is_current(&stream) {
            stream.token.cancel();
            self.refresh_phase();
            return Ok(TickOutcome::Idle);
        }

        if let Err(e) = drain_ready(&mut stream) {
            self.fail_stream(stream);
            return Err(e);
        }
        if stream.done && !self.validate(&mut stream) {
            self.finish_stream(stream);
            self.refresh_phase();
            return Ok(TickOutcome::Idle);
        }

        let confirmed = self.confirm_words(&mut stream, self.max_words_per_tick);
        if confirmed.finished {
            self.finish_stream(stream);
        } else {
            self.active = Some(stream);
        }
        self.refresh_phase();

        if confirmed.words == 0 && !confirmed.finished {
            return Ok(TickOutcome::Waiting);
        }
        Ok(TickOutcome::Advanced {
            words: confirmed.words,
            applied: confirmed.applied,
        })
    }

    /// Wait for one step of the current stream, starting one over the rest
    /// of the region (including a partly typed last word) if needed.
    pub async fn catch_up(&mut self, now_ms: u64) -> Result<()> {
        self.phase = DiffusionPhase::CatchingUp;

        if self.active.is_none() {
            if self.state.frontier >= self.state.caret {
                return Ok(());
            }
            if !self.start_stream(now_ms, true).await? {
                self.state.frontier = self.state.caret;
                return Ok(());
            }
        }

        let Some(mut stream) = self.active.take() else {
            return Ok(());
        };
        if !self.is_current(&stream) {
            stream.token.cancel();
            self.state.frontier = self.state.caret;
            return Ok(());
        }

        if !stream.done {
            match tokio::time::timeout(self.step_timeout, stream.chunks.next()).await {
                Err(_) => {
                    let ms = self.step_timeout.as_millis() as u64;
                    self.fail_stream(stream);
                    return Err(CorrectionError::Timeout {
                        stage: Stage::Noise,
                        ms,
                    });
                }
                Ok(None) => stream.done = true,
                Ok(Some(Ok(chunk))) => stream.proposal.push_str(&chunk),
                Ok(Some(Err(e))) => {
                    self.fail_stream(stream);
                    return Err(e);
                }
            }
            if let Err(e) = drain_ready(&mut stream) {
                self.fail_stream(stream);
                return Err(e);
            }
        }

        if stream.done && !self.validate(&mut stream) {
            self.finish_stream(stream);
            return Ok(());
        }

        let confirmed = self.confirm_words(&mut stream, usize::MAX);
        if confirmed.finished {
            self.finish_stream(stream);
        } else {
            self.active = Some(stream);
        }
        Ok(())
    }

    /// Run [`catch_up`](Self::catch_up) until the frontier reaches the caret.
    ///
    /// Stops after [`MAX_CATCH_UP_ITERATIONS`] steps and forces the frontier
    /// to the caret, so a pause always resolves. Returns the steps taken.
    pub async fn catch_up_all(&mut self, now_ms: u64) -> Result<usize> {
        let mut iterations = 0;
        while self.state.frontier < self.state.caret {
            if iterations >= MAX_CATCH_UP_ITERATIONS {
                warn!(
                    "Catch-up hit {} iterations with frontier {} < caret {}, forcing",
                    MAX_CATCH_UP_ITERATIONS, self.state.frontier, self.state.caret
                );
                self.abort();
                self.state.frontier = self.state.caret;
                break;
            }
            iterations += 1;
            if let Err(e) = self.catch_up(now_ms).await {
                self.abort();
                self.state.frontier = self.state.caret;
                self.refresh_phase();
                return Err(e);
            }
        }
        self.refresh_phase();
        Ok(iterations)
    }

    /// Apply a finished diff to the text, re-checking caret safety against
    /// the caret as it is now. Returns whether the diff was applied.
    pub fn apply_external(&mut self, diff: &CorrectionDiff) -> bool {
        let text = &self.state.text;
        if !is_caret_safe(diff.start, diff.end, self.state.caret) {
            debug!(
                "Diff {}..{} reaches caret {}, not applied",
                diff.start, diff.end, self.state.caret
            );
            return false;
        }
        if !is_grapheme_boundary(text, diff.start) || !is_grapheme_boundary(text, diff.end) {
            debug!("Diff {}..{} is off grapheme boundaries, not applied", diff.start, diff.end);
            return false;
        }
        let Some(next) = diff.apply_to(text) else {
            return false;
        };

        // The edit may sit inside a span a stream is still working on.
        self.abort();

        let before = &self.state.text[diff.start..diff.end];
        self.applied.push(WaveDiff::new(
            diff.start,
            before,
            &diff.text,
            diff.stage,
            diff.confidence,
        ));

        let delta = diff.delta();
        self.state.caret = shift_offset(self.state.caret, diff.start, diff.end, delta);
        self.state.frontier = shift_offset(self.state.frontier, diff.start, diff.end, delta)
            .min(self.state.caret);
        self.state.text = next;
        self.refresh_phase();
        true
    }

    /// Apply a wave's diffs in order, all or none.
    ///
    /// Each diff is in the coordinates left by the one before it. Returns
    /// the number applied: either all of them or zero.
    pub fn apply_wave(&mut self, diffs: &[CorrectionDiff]) -> usize {
        let mut text = self.state.text.clone();
        let mut caret = self.state.caret;
        for diff in diffs {
            let fits = is_caret_safe(diff.start, diff.end, caret)
                && is_grapheme_boundary(&text, diff.start)
                && is_grapheme_boundary(&text, diff.end);
            let next = if fits { diff.apply_to(&text) } else { None };
            let Some(next) = next else {
                debug!(
                    "Wave diff {}..{} no longer fits (caret {}), dropping the wave",
                    diff.start, diff.end, caret
                );
                return 0;
            };
            caret = shift_offset(caret, diff.start, diff.end, diff.delta());
            text = next;
        }

        let mut applied = 0;
        for diff in diffs {
            if self.apply_external(diff) {
                applied += 1;
            }
        }
        applied
    }

    /// Edits made since the last call, oldest first.
    pub fn take_applied(&mut self) -> Vec<WaveDiff> {
        std::mem::take(&mut self.applied)
    }

    /// Stop the in-flight stream, if any.
    pub fn abort(&mut self) {
        if let Some(stream) = self.active.take() {
            trace!("Aborting stream over {}..{}", stream.start, stream.end());
            stream.token.cancel();
        }
    }

    fn refresh_phase(&mut self) {
        self.phase = if self.active.is_none() && self.state.frontier >= self.state.caret {
            DiffusionPhase::Idle
        } else {
            DiffusionPhase::Streaming
        };
    }

    fn is_current(&self, stream: &ActiveStream) -> bool {
        let end = stream.end();
        end <= self.state.caret && self.state.text.get(stream.start..end) == Some(stream.current.as_str())
    }

    /// Open a noise stream over the unconfirmed part of the region.
    ///
    /// Without `include_partial` the word touching the end of the region is
    /// left alone, since it may still be being typed. Returns false when
    /// there is nothing to stream.
    async fn start_stream(&mut self, now_ms: u64, include_partial: bool) -> Result<bool> {
        let Some(adapter) = self.adapter.clone() else {
            return Err(CorrectionError::AdapterMissing);
        };

        let render = self.policy.compute_render_range(&self.state, now_ms);
        if render.is_empty() {
            return Ok(false);
        }
        let from = self.state.frontier.max(render.start);
        if from >= render.end {
            return Ok(false);
        }

        let text = self.state.text.as_str();
        let span = &text[from..render.end];
        let lead = span.len() - span.trim_start().len();
        let body_end = if include_partial {
            span.trim_end().len()
        } else {
            match span.rfind(char::is_whitespace) {
                Some(ws) => span[..ws].trim_end().len(),
                None => return Ok(false),
            }
        };
        let start = from + lead;
        let end = from + body_end;
        if start >= end || !is_grapheme_boundary(text, start) || !is_grapheme_boundary(text, end) {
            return Ok(false);
        }

        let original = text[start..end].to_string();
        let params = StreamParams {
            text: self.state.text.clone(),
            caret: self.state.caret,
            active_region: ActiveRegion::new(start, end),
            settings: StageSettings::Noise {
                max_tokens: self.tier.token_budget(estimate_tokens(&original)),
            },
        };

        let token = CancellationToken::new();
        let chunks = adapter.stream(params, token.clone()).await?;
        debug!(
            "Streaming {} over {}..{} ({} words)",
            adapter.name(),
            start,
            end,
            word_spans(&original).len()
        );

        self.state.frontier = start.min(self.state.caret);
        self.active = Some(ActiveStream {
            chunks,
            token,
            start,
            words: word_spans(&original),
            current: original.clone(),
            original,
            shift: 0,
            proposal: String::new(),
            confirmed: 0,
            done: false,
            quality: None,
        });
        Ok(true)
    }

    /// Score a finished proposal once. Returns false if it must be rejected.
    fn validate(&self, stream: &mut ActiveStream) -> bool {
        if stream.quality.is_some() {
            return true;
        }
        let quality = transformation_quality(&stream.original, &stream.proposal, &self.limits);
        if quality <= 0.0 {
            debug!(
                "Rejecting streamed proposal for {}..{}: failed structural validation",
                stream.start,
                stream.end()
            );
            return false;
        }
        stream.quality = Some(quality);
        true
    }

    fn confirm_words(&mut self, stream: &mut ActiveStream, limit: usize) -> Confirmed {
        let mut words = 0;
        let mut applied = 0;

        while words < limit && stream.confirmed < stream.words.len() {
            let i = stream.confirmed;
            let tokens: Vec<String> = stream.proposal.split_whitespace().map(str::to_string).collect();

            let ready = if stream.done || stream.proposal.ends_with(char::is_whitespace) {
                tokens.len()
            } else {
                tokens.len().saturating_sub(1)
            };
            let (rel_start, rel_end) = stream.words[i];
            let unchanged = i < ready && stream.original[rel_start..rel_end] == tokens[i];

            if !unchanged && stream.done && tokens.len() != stream.words.len() {
                // Words were split or merged: replace the rest as one edit.
                let tail_end = stream.words[stream.words.len() - 1].1;
                let replacement = tokens.get(i..).map(|t| t.join(" ")).unwrap_or_default();
                let confidence = stream.quality.unwrap_or(0.0);
                if stream.original[rel_start..tail_end] != replacement
                    && self.apply_stream_edit(stream, rel_start, tail_end, &replacement, confidence)
                {
                    applied += 1;
                }
                let tail = stream.start + stream.locate(tail_end);
                self.state.frontier = self.state.frontier.max(tail).min(self.state.caret);
                words += stream.words.len() - i;
                stream.confirmed = stream.words.len();
                break;
            }

            if i >= ready {
                break;
            }

            let typed = &stream.original[rel_start..rel_end];
            let token = &tokens[i];
            if typed != token {
                let similarity = normalized_levenshtein(typed, token);
                if !stream.done && similarity < MIN_WORD_SIMILARITY {
                    break;
                }
                let confidence = stream.quality.unwrap_or(similarity);
                if self.apply_stream_edit(stream, rel_start, rel_end, token, confidence) {
                    applied += 1;
                }
            }

            let word_end = stream.start + stream.locate(rel_end);
            self.state.frontier = self.state.frontier.max(word_end).min(self.state.caret);
            stream.confirmed += 1;
            words += 1;
        }

        Confirmed {
            words,
            applied,
            finished: stream.done && stream.confirmed >= stream.words.len(),
        }
    }

    /// Replace `rel_start..rel_end` (offsets into the stream's original
    /// span) in the live text.
    fn apply_stream_edit(
        &mut self,
        stream: &mut ActiveStream,
        rel_start: usize,
        rel_end: usize,
        replacement: &str,
        confidence: f64,
    ) -> bool {
        let cur_start = stream.locate(rel_start);
        let cur_end = stream.locate(rel_end);
        let abs_start = stream.start + cur_start;
        let abs_end = stream.start + cur_end;

        if !is_caret_safe(abs_start, abs_end, self.state.caret) {
            debug!(
                "Streamed edit {}..{} reaches caret {}, skipped",
                abs_start, abs_end, self.state.caret
            );
            return false;
        }
        let Some(before) = stream.current.get(cur_start..cur_end).map(str::to_string) else {
            return false;
        };
        if self.state.text.get(abs_start..abs_end) != Some(before.as_str()) {
            return false;
        }

        trace!("Streamed edit {}..{}: {:?} -> {:?}", abs_start, abs_end, before, replacement);
        self.state.text.replace_range(abs_start..abs_end, replacement);
        stream.current.replace_range(cur_start..cur_end, replacement);

        let delta = replacement.len() as isize - before.len() as isize;
        stream.shift += delta;
        self.state.caret = shift_offset(self.state.caret, abs_start, abs_end, delta);
        self.applied.push(WaveDiff::new(
            abs_start,
            &before,
            replacement,
            Stage::Noise,
            confidence,
        ));
        true
    }

    fn finish_stream(&mut self, stream: ActiveStream) {
        self.state.frontier = self.state.frontier.max(stream.end()).min(self.state.caret);
        stream.token.cancel();
    }

    fn fail_stream(&mut self, stream: ActiveStream) {
        warn!("Stream over {}..{} failed, skipping it", stream.start, stream.end());
        self.finish_stream(stream);
        self.refresh_phase();
    }
}

/// Pull every chunk that is ready without waiting.
fn drain_ready(stream: &mut ActiveStream) -> Result<()> {
    while !stream.done {
        match stream.chunks.next().now_or_never() {
            None => break,
            Some(None) => stream.done = true,
            Some(Some(Ok(chunk))) => stream.proposal.push_str(&chunk),
            Some(Some(Err(e))) => return Err(e),
        }
    }
    Ok(())
}

/// Byte spans of whitespace-separated words.
fn word_spans(text: &str) -> Vec<(usize, usize)> {
    let mut spans = Vec::new();
    let mut start = None;
    for (i, c) in text.char_indices() {
        if c.is_whitespace() {
            if let Some(s) = start.take() {
                spans.push((s, i));
            }
        } else if start.is_none() {
            start = Some(i);
        }
    }
    if let Some(s) = start {
        spans.push((s, text.len()));
    }
    spans
}

fn common_prefix(a: &str, b: &str) -> usize {
    let mut n = a.bytes().zip(b.bytes()).take_while(|(x, y)| x == y).count();
    while !a.is_char_boundary(n) || !b.is_char_boundary(n) {
        n -= 1;
    }
    n
}
