//! Bounded history of completed correction waves.
//!
//! Each wave keeps enough before/after text to be reverted as one unit.
//! Rollback lives entirely here and never touches the host's own undo stack.

use log::{debug, warn};
use serde::Serialize;
use std::collections::VecDeque;

use super::Stage;

/// One recorded edit inside a wave.
///
/// While the wave is open, `start..end` is the span of `after` in the wave's
/// working text. Once the wave completes the offsets are final-text
/// coordinates. Overlapping edits are merged so spans never intersect.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct WaveDiff {
    pub start: usize,
    pub end: usize,
    pub before: String,
    pub after: String,
    pub stage: Stage,
    pub confidence: f64,
}

impl WaveDiff {
    /// A diff replacing `before` (at `start` in the current text) with `after`.
    pub fn new(start: usize, before: &str, after: &str, stage: Stage, confidence: f64) -> Self {
        Self {
            start,
            end: start + after.len(),
            before: before.to_string(),
            after: after.to_string(),
            stage,
            confidence,
        }
    }

    fn delta(&self) -> isize {
        self.after.len() as isize - self.before.len() as isize
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CorrectionWave {
    pub id: u64,
    /// Unix milliseconds.
    pub started_at: i64,
    pub completed_at: i64,
    pub diffs: Vec<WaveDiff>,
    pub original_text: String,
    pub final_text: String,
}

/// Restores `text` over `start..end` of the current text.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RevertOp {
    pub start: usize,
    pub end: usize,
    pub text: String,
    /// What must currently occupy `start..end` for the op to be valid.
    pub expected: String,
}

struct PendingWave {
    id: u64,
    started_at: i64,
    original_text: String,
    working_text: String,
    diffs: Vec<WaveDiff>,
}

pub struct WaveHistory {
    /// Completed waves, oldest first.
    waves: VecDeque<CorrectionWave>,

    max_waves: usize,

    pending: Option<PendingWave>,

    next_id: u64,
}

impl WaveHistory {
    /// Create a history holding at most `max_waves` waves (at least one).
    pub fn new(max_waves: usize) -> Self {
        let max_waves = max_waves.max(1);
        Self {
            waves: VecDeque::with_capacity(max_waves),
            max_waves,
            pending: None,
            next_id: 1,
        }
    }

    /// Open a new wave over `original_text`, discarding any wave still open.
    pub fn start_wave(&mut self, original_text: &str) -> u64 {
        if let Some(stale) = self.pending.take() {
            debug!("Discarding unfinished wave {}", stale.id);
        }
        let id = self.next_id;
        self.next_id += 1;
        self.pending = Some(PendingWave {
            id,
            started_at: chrono::Utc::now().timestamp_millis(),
            original_text: original_text.to_string(),
            working_text: original_text.to_string(),
            diffs: Vec::new(),
        });
        debug!("Wave {} started", id);
        id
    }

    pub fn has_open_wave(&self) -> bool {
        self.pending.is_some()
    }

    /// Record an edit applied to the open wave's current text.
    ///
    /// `diff.start` and `diff.before` must describe the text as it is right
    /// now. Returns false when no wave is open or the diff does not match.
    pub fn add_diff(&mut self, diff: WaveDiff) -> bool {
        let Some(pending) = self.pending.as_mut() else {
            warn!("add_diff called with no open wave");
            return false;
        };

        let cut_end = diff.start + diff.before.len();
        if pending.working_text.get(diff.start..cut_end) != Some(diff.before.as_str()) {
            warn!(
                "Wave {}: diff at {}..{} does not match working text, not recorded",
                pending.id, diff.start, cut_end
            );
            return false;
        }

        let mut next_text = String::with_capacity(pending.working_text.len() + diff.after.len());
        next_text.push_str(&pending.working_text[..diff.start]);
        next_text.push_str(&diff.after);
        next_text.push_str(&pending.working_text[cut_end..]);

        let Some(merged) = merge_into(
            &mut pending.diffs,
            &pending.working_text,
            &next_text,
            diff.start,
            cut_end,
            &diff,
        ) else {
            warn!("Wave {}: could not merge diff at {}", pending.id, diff.start);
            return false;
        };

        if merged.before != merged.after {
            let idx = pending.diffs.partition_point(|d| d.start < merged.start);
            pending.diffs.insert(idx, merged);
        }
        pending.working_text = next_text;
        true
    }

    /// Follow edits the user made while the wave is open.
    ///
    /// Recorded diffs the user typed over leave the wave (their text stays),
    /// the rest are rebased onto `text`. The original text is then rebuilt
    /// by reverting the remaining diffs, so a rollback keeps the user's own
    /// typing.
    pub fn observe_text(&mut self, text: &str) {
        let Some(pending) = self.pending.as_mut() else {
            return;
        };
        if pending.working_text == text {
            return;
        }

        let (old_start, old_end, new_end) = changed_span(&pending.working_text, text);
        let delta = new_end as isize - old_end as isize;
        let recorded = pending.diffs.len();

        pending.diffs = pending
            .diffs
            .drain(..)
            .filter_map(|mut d| {
                if d.end <= old_start {
                    Some(d)
                } else if d.start >= old_end {
                    d.start = (d.start as isize + delta) as usize;
                    d.end = (d.end as isize + delta) as usize;
                    Some(d)
                } else {
                    None
                }
            })
            .collect();
        if pending.diffs.len() != recorded {
            debug!(
                "Wave {}: {} diff(s) edited by the user, no longer revertible",
                pending.id,
                recorded - pending.diffs.len()
            );
        }

        pending.working_text = text.to_string();
        match apply_revert_ops(text, &revert_ops_for(&pending.diffs)) {
            Some(original) => pending.original_text = original,
            None => {
                warn!("Wave {}: lost track of recorded diffs, clearing", pending.id);
                pending.diffs.clear();
                pending.original_text = text.to_string();
            }
        }
    }

    /// Close the open wave. Waves without diffs are dropped and never stored.
    pub fn complete_wave(&mut self) -> Option<CorrectionWave> {
        let pending = self.pending.take()?;
        if pending.diffs.is_empty() {
            debug!("Wave {} produced no diffs, dropped", pending.id);
            return None;
        }

        let wave = CorrectionWave {
            id: pending.id,
            started_at: pending.started_at,
            completed_at: chrono::Utc::now().timestamp_millis(),
            diffs: pending.diffs,
            original_text: pending.original_text,
            final_text: pending.working_text,
        };

        if self.waves.len() >= self.max_waves {
            if let Some(evicted) = self.waves.pop_front() {
                debug!("History full, evicting wave {}", evicted.id);
            }
        }
        self.waves.push_back(wave.clone());
        debug!("Wave {} stored with {} diff(s)", wave.id, wave.diffs.len());
        Some(wave)
    }

    pub fn last_wave(&self) -> Option<&CorrectionWave> {
        self.waves.back()
    }

    /// Remove and return the newest wave. Each wave comes out exactly once.
    pub fn pop_last_wave(&mut self) -> Option<CorrectionWave> {
        self.waves.pop_back()
    }

    pub fn len(&self) -> usize {
        self.waves.len()
    }

    pub fn is_empty(&self) -> bool {
        self.waves.is_empty()
    }

    pub fn clear(&mut self) {
        self.waves.clear();
        self.pending = None;
    }
}

/// Fold `diff` (replacing `start..cut_end` of `current`) into `diffs`.
///
/// Existing diffs that overlap the edit are removed and absorbed into the
/// returned merged diff; diffs to the right are shifted by the delta.
fn merge_into(
    diffs: &mut Vec<WaveDiff>,
    current: &str,
    next: &str,
    start: usize,
    cut_end: usize,
    diff: &WaveDiff,
) -> Option<WaveDiff> {
    let overlaps = |d: &WaveDiff| start < d.end && d.start < cut_end;

    let (absorbed, kept): (Vec<WaveDiff>, Vec<WaveDiff>) =
        diffs.drain(..).partition(|d| overlaps(d));

    let delta = diff.delta();
    *diffs = kept
        .into_iter()
        .map(|mut d| {
            if d.start >= cut_end {
                d.start = (d.start as isize + delta) as usize;
                d.end = (d.end as isize + delta) as usize;
            }
            d
        })
        .collect();

    if absorbed.is_empty() {
        return Some(WaveDiff::new(
            start,
            &diff.before,
            &diff.after,
            diff.stage,
            diff.confidence,
        ));
    }

    let lo = absorbed.iter().map(|d| d.start).min()?.min(start);
    let hi = absorbed.iter().map(|d| d.end).max()?.max(cut_end);

    // Rebuild the pre-wave text of lo..hi: untouched stretches of the
    // current text plus the `before` of every absorbed diff.
    let mut before = String::new();
    let mut pos = lo;
    for d in &absorbed {
        before.push_str(current.get(pos..d.start)?);
        before.push_str(&d.before);
        pos = d.end;
    }
    before.push_str(current.get(pos..hi)?);

    let new_hi = (hi as isize + delta) as usize;
    let after = next.get(lo..new_hi)?;
    let confidence = absorbed
        .iter()
        .map(|d| d.confidence)
        .fold(diff.confidence, f64::min);

    Some(WaveDiff::new(lo, &before, after, diff.stage, confidence))
}

/// Byte span that differs between `old` and `new`: returns
/// `(start, old_end, new_end)`, all on char boundaries.
fn changed_span(old: &str, new: &str) -> (usize, usize, usize) {
    let mut prefix = old
        .bytes()
        .zip(new.bytes())
        .take_while(|(a, b)| a == b)
        .count();
    while !old.is_char_boundary(prefix) || !new.is_char_boundary(prefix) {
        prefix -= 1;
    }

    let max_suffix = old.len().min(new.len()) - prefix;
    let mut suffix = old
        .bytes()
        .rev()
        .zip(new.bytes().rev())
        .take(max_suffix)
        .take_while(|(a, b)| a == b)
        .count();
    while !old.is_char_boundary(old.len() - suffix) || !new.is_char_boundary(new.len() - suffix) {
        suffix -= 1;
    }

    (prefix, old.len() - suffix, new.len() - suffix)
}

/// Revert operations for `wave`, ordered right to left so applying them in
/// sequence never invalidates a later op's offsets.
pub fn generate_revert_ops(wave: &CorrectionWave) -> Vec<RevertOp> {
    revert_ops_for(&wave.diffs)
}

fn revert_ops_for(diffs: &[WaveDiff]) -> Vec<RevertOp> {
    let mut ops: Vec<RevertOp> = diffs
        .iter()
        .map(|d| RevertOp {
            start: d.start,
            end: d.end,
            text: d.before.clone(),
            expected: d.after.clone(),
        })
        .collect();
    ops.sort_by(|a, b| b.start.cmp(&a.start).then(b.end.cmp(&a.end)));
    ops
}

/// Apply revert ops to `text`.
///
/// Returns `None` without a partial result if any op no longer matches the
/// text, for example because the user edited inside a corrected span.
pub fn apply_revert_ops(text: &str, ops: &[RevertOp]) -> Option<String> {
    let mut out = text.to_string();
    for op in ops {
        if out.get(op.start..op.end) != Some(op.expected.as_str()) {
            debug!("Revert op at {}..{} no longer matches", op.start, op.end);
            return None;
        }
        out.replace_range(op.start..op.end, &op.text);
    }
    Some(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(h: &mut WaveHistory, text: &mut String, start: usize, before: &str, after: &str) {
        assert_eq!(&text[start..start + before.len()], before);
        assert!(h.add_diff(WaveDiff::new(start, before, after, Stage::Noise, 1.0)));
        text.replace_range(start..start + before.len(), after);
    }

    #[test]
    fn empty_wave_is_never_stored() {
        let mut h = WaveHistory::new(10);
        h.start_wave("hello");
        assert!(h.complete_wave().is_none());
        assert!(h.last_wave().is_none());
        assert!(h.pop_last_wave().is_none());
    }

    #[test]
    fn revert_restores_original_text() {
        let original = "I was writting a lettr";
        let mut text = original.to_string();
        let mut h = WaveHistory::new(10);
        h.start_wave(&text);
        record(&mut h, &mut text, 6, "writting", "writing");
        record(&mut h, &mut text, 16, "lettr", "letter");
        assert_eq!(text, "I was writing a letter");

        let wave = h.complete_wave().unwrap();
        assert_eq!(wave.final_text, text);
        let ops = generate_revert_ops(&wave);
        assert!(ops.windows(2).all(|w| w[0].start >= w[1].start));
        assert_eq!(apply_revert_ops(&text, &ops).as_deref(), Some(original));
    }

    #[test]
    fn left_edit_rebases_earlier_right_edit() {
        let original = "teh cat adn dog";
        let mut text = original.to_string();
        let mut h = WaveHistory::new(10);
        h.start_wave(&text);
        record(&mut h, &mut text, 8, "adn", "and");
        record(&mut h, &mut text, 0, "teh", "the big");
        assert_eq!(text, "the big cat and dog");

        let wave = h.complete_wave().unwrap();
        assert_eq!(wave.diffs[1].start, 12);
        assert_eq!(&wave.final_text[12..15], "and");
        let reverted = apply_revert_ops(&text, &generate_revert_ops(&wave));
        assert_eq!(reverted.as_deref(), Some(original));
    }

    #[test]
    fn overlapping_edits_merge() {
        let original = "I goed to teh shop";
        let mut text = original.to_string();
        let mut h = WaveHistory::new(10);
        h.start_wave(&text);
        record(&mut h, &mut text, 10, "teh", "the");
        // later stage rewrites a span covering the first edit
        record(&mut h, &mut text, 2, "goed to the", "went to the");
        assert_eq!(text, "I went to the shop");

        let wave = h.complete_wave().unwrap();
        assert_eq!(wave.diffs.len(), 1);
        assert_eq!(wave.diffs[0].before, "goed to teh");
        let reverted = apply_revert_ops(&text, &generate_revert_ops(&wave));
        assert_eq!(reverted.as_deref(), Some(original));
    }

    #[test]
    fn edit_that_undoes_itself_leaves_no_diff() {
        let mut text = "abc def".to_string();
        let mut h = WaveHistory::new(10);
        h.start_wave(&text);
        record(&mut h, &mut text, 4, "def", "xyz");
        record(&mut h, &mut text, 4, "xyz", "def");
        assert!(h.complete_wave().is_none());
    }

    #[test]
    fn mismatched_diff_is_rejected() {
        let mut h = WaveHistory::new(10);
        h.start_wave("hello world");
        assert!(!h.add_diff(WaveDiff::new(0, "jello", "hello", Stage::Noise, 1.0)));
        assert!(!WaveHistory::new(1).add_diff(WaveDiff::new(0, "", "x", Stage::Noise, 1.0)));
    }

    #[test]
    fn history_is_bounded_and_pops_once() {
        let mut h = WaveHistory::new(2);
        for i in 0..3 {
            let text = format!("wave {}", i);
            h.start_wave(&text);
            h.add_diff(WaveDiff::new(0, "wave", "Wave", Stage::Noise, 1.0));
            h.complete_wave();
        }
        assert_eq!(h.len(), 2);
        assert_eq!(h.last_wave().unwrap().original_text, "wave 2");
        let popped = h.pop_last_wave().unwrap();
        assert_eq!(popped.original_text, "wave 2");
        assert_eq!(h.last_wave().unwrap().original_text, "wave 1");
        h.pop_last_wave();
        assert!(h.pop_last_wave().is_none());
    }

    #[test]
    fn rollback_of_second_wave_keeps_first() {
        let mut h = WaveHistory::new(10);
        let mut text = "teh cat and teh dog".to_string();

        h.start_wave(&text);
        record(&mut h, &mut text, 0, "teh", "the");
        h.complete_wave().unwrap();

        h.start_wave(&text);
        record(&mut h, &mut text, 12, "teh", "the");
        h.complete_wave().unwrap();
        assert_eq!(text, "the cat and the dog");

        let wave = h.pop_last_wave().unwrap();
        let reverted = apply_revert_ops(&text, &generate_revert_ops(&wave)).unwrap();
        assert_eq!(reverted, "the cat and teh dog");
    }

    #[test]
    fn typing_after_a_correction_keeps_it_revertible() {
        let mut h = WaveHistory::new(10);
        let mut text = "teh cat".to_string();
        h.start_wave(&text);
        record(&mut h, &mut text, 0, "teh", "the");

        h.observe_text("the cat sat");
        let wave = h.complete_wave().unwrap();
        assert_eq!(wave.original_text, "teh cat sat");
        let reverted = apply_revert_ops("the cat sat", &generate_revert_ops(&wave));
        assert_eq!(reverted.as_deref(), Some("teh cat sat"));
    }

    #[test]
    fn typing_before_a_correction_rebases_it() {
        let mut h = WaveHistory::new(10);
        let mut text = "so teh cat".to_string();
        h.start_wave(&text);
        record(&mut h, &mut text, 3, "teh", "the");

        h.observe_text("and so the cat");
        let wave = h.complete_wave().unwrap();
        assert_eq!(wave.diffs[0].start, 7);
        assert_eq!(wave.original_text, "and so teh cat");
    }

    #[test]
    fn editing_inside_a_correction_drops_it() {
        let mut h = WaveHistory::new(10);
        let mut text = "teh cat".to_string();
        h.start_wave(&text);
        record(&mut h, &mut text, 0, "teh", "the");

        h.observe_text("tha cat");
        assert!(h.complete_wave().is_none());
    }

    #[test]
    fn changed_span_handles_multibyte() {
        assert_eq!(changed_span("abc", "abXc"), (2, 2, 3));
        assert_eq!(changed_span("café", "cafè"), (3, 5, 5));
        assert_eq!(changed_span("same", "same"), (4, 4, 4));
    }

    #[test]
    fn revert_refuses_when_text_changed() {
        let mut h = WaveHistory::new(10);
        let mut text = "teh cat".to_string();
        h.start_wave(&text);
        record(&mut h, &mut text, 0, "teh", "the");
        let wave = h.complete_wave().unwrap();
        assert!(apply_revert_ops("THE cat", &generate_revert_ops(&wave)).is_none());
    }
}
