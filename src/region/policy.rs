//! Active Region policy.
//!
//! Computes the editable trailing window behind the caret and the wider
//! read-only context window handed to generation.

use log::trace;
use serde::Serialize;
use unicode_segmentation::UnicodeSegmentation;

use super::safety::{align_range, floor_boundary, is_caret_safe, is_grapheme_boundary};
use crate::settings::CorrectionSettings;
use crate::streaming::{BurstState, DiffusionState};

/// A half-open byte range `start..end` of the session text.
///
/// Regions handed out by the policy always satisfy `end <= caret` and sit on
/// grapheme boundaries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct ActiveRegion {
    pub start: usize,
    pub end: usize,
}

impl ActiveRegion {
    pub fn new(start: usize, end: usize) -> Self {
        Self { start, end }
    }

    /// The explicit no-op region.
    pub fn empty(at: usize) -> Self {
        Self { start: at, end: at }
    }

    pub fn is_empty(&self) -> bool {
        self.start >= self.end
    }

    pub fn len(&self) -> usize {
        self.end.saturating_sub(self.start)
    }

    pub fn slice<'a>(&self, text: &'a str) -> Option<&'a str> {
        text.get(self.start..self.end)
    }

    pub fn contains(&self, pos: usize) -> bool {
        pos >= self.start && pos < self.end
    }
}

/// Tunables for the region computation, derived from the session settings.
#[derive(Debug, Clone, PartialEq)]
pub struct RegionPolicy {
    pub base_words: usize,
    pub search_window_chars: usize,
    pub burst_recent_key_ms: u64,
    pub burst_min_duration_ms: u64,
    pub burst_min_keys: u32,
    pub burst_growth: f64,
    pub burst_word_cap: usize,
    pub context_left_chars: usize,
    pub context_right_chars: usize,
}

impl Default for RegionPolicy {
    fn default() -> Self {
        Self::from_settings(&CorrectionSettings::default())
    }
}

impl RegionPolicy {
    pub fn from_settings(settings: &CorrectionSettings) -> Self {
        Self {
            base_words: settings.active_region_words,
            search_window_chars: settings.search_window_chars,
            burst_recent_key_ms: settings.burst_recent_key_ms,
            burst_min_duration_ms: settings.burst_min_duration_ms,
            burst_min_keys: settings.burst_min_keys,
            burst_growth: settings.burst_growth,
            burst_word_cap: settings.burst_word_cap,
            context_left_chars: settings.context_left_chars,
            context_right_chars: settings.context_right_chars,
        }
    }

    /// Same policy with a different base word count (used by the latency
    /// fallback to shrink the region).
    pub fn with_base_words(mut self, words: usize) -> Self {
        self.base_words = words;
        self
    }

    /// Whether `burst` describes sustained rapid typing at `now_ms`.
    pub fn is_sustained_burst(&self, burst: &BurstState, now_ms: u64) -> bool {
        if burst.key_count == 0 {
            return false;
        }
        let since_last = now_ms.saturating_sub(burst.last_key_ms);
        let duration = burst.last_key_ms.saturating_sub(burst.burst_start_ms);
        since_last < self.burst_recent_key_ms
            && duration > self.burst_min_duration_ms
            && burst.key_count > self.burst_min_keys
    }

    /// Number of trailing words the region may cover.
    pub fn word_budget(&self, burst: &BurstState, now_ms: u64) -> usize {
        if self.is_sustained_burst(burst, now_ms) {
            let grown = (self.base_words as f64 * self.burst_growth).floor() as usize;
            grown.min(self.burst_word_cap)
        } else {
            self.base_words
        }
    }

    /// Compute the editable render range behind the caret.
    ///
    /// Returns an empty range at the caret when nothing safe can be edited.
    pub fn compute_render_range(&self, state: &DiffusionState, now_ms: u64) -> ActiveRegion {
        let text = state.text.as_str();
        let caret = state.caret.min(text.len());
        if caret == 0 {
            return ActiveRegion::empty(0);
        }

        let scan_end = if is_grapheme_boundary(text, caret) {
            caret
        } else {
            floor_boundary(text, caret)
        };
        let window_start = floor_boundary(text, scan_end.saturating_sub(self.search_window_chars));
        let window = &text[window_start..scan_end];

        let words: Vec<usize> = window
            .split_word_bound_indices()
            .filter(|(_, w)| w.chars().any(char::is_alphanumeric))
            .map(|(i, _)| window_start + i)
            .collect();
        if words.is_empty() {
            return ActiveRegion::empty(caret);
        }

        let budget = self.word_budget(&state.burst, now_ms).max(1);
        let natural_start = words[words.len().saturating_sub(budget)];

        // Never reach back across the most recent line break.
        let line_start = window
            .rfind('\n')
            .map(|nl| window_start + nl + 1)
            .unwrap_or(window_start);
        let start = natural_start.max(line_start).min(scan_end);

        let (start, end) = align_range(text, start, scan_end);
        if !is_caret_safe(start, end, state.caret) {
            trace!(
                "Render range {}..{} crosses caret {}, returning empty",
                start,
                end,
                state.caret
            );
            return ActiveRegion::empty(caret);
        }

        ActiveRegion::new(start, end)
    }

    /// Widen `render` by the configured margins, clamped to `0..=caret`.
    ///
    /// The result is read-only context for generation and is never mutated.
    pub fn compute_context_range(&self, state: &DiffusionState, render: ActiveRegion) -> ActiveRegion {
        let text = state.text.as_str();
        let caret = floor_boundary(text, state.caret.min(text.len()));
        let start = floor_boundary(
            text,
            render.start.min(caret).saturating_sub(self.context_left_chars),
        );
        let end = floor_boundary(
            text,
            render.end.saturating_add(self.context_right_chars).min(caret),
        );
        ActiveRegion::new(start, end.max(start))
    }
}

/// Number of words inside `region` of `text`.
pub fn count_words(text: &str, region: ActiveRegion) -> usize {
    region
        .slice(text)
        .map(|s| s.unicode_words().count())
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn state(text: &str, caret: usize) -> DiffusionState {
        DiffusionState::new(text, caret)
    }

    fn bursting(text: &str) -> DiffusionState {
        let mut s = state(text, text.len());
        s.burst = BurstState {
            last_key_ms: 10_000,
            burst_start_ms: 9_000,
            key_count: 40,
        };
        s
    }

    fn numbered_words(n: usize) -> String {
        (0..n).map(|i| format!("w{}", i)).collect::<Vec<_>>().join(" ")
    }

    #[test]
    fn short_text_takes_all_words() {
        let text = "I was writting a lettr";
        let region = RegionPolicy::default().compute_render_range(&state(text, text.len()), 0);
        assert_eq!(region, ActiveRegion::new(0, text.len()));
    }

    #[test]
    fn caret_at_zero_is_empty() {
        let region = RegionPolicy::default().compute_render_range(&state("hello", 0), 0);
        assert!(region.is_empty());
        assert_eq!(region.start, 0);
    }

    #[test]
    fn takes_last_n_words() {
        let text = numbered_words(30);
        let policy = RegionPolicy::default();
        let region = policy.compute_render_range(&state(&text, text.len()), 0);
        assert_eq!(count_words(&text, region), 20);
        assert!(region.slice(&text).unwrap().starts_with("w10"));
    }

    #[test]
    fn region_ends_at_caret_not_text_end() {
        let text = "first words here and more after";
        let caret = "first words here".len();
        let region = RegionPolicy::default().compute_render_range(&state(text, caret), 0);
        assert_eq!(region.end, caret);
        assert_eq!(region.slice(text), Some("first words here"));
    }

    #[test]
    fn burst_grows_region_up_to_cap() {
        let text = numbered_words(60);
        let policy = RegionPolicy::default();
        let region = policy.compute_render_range(&bursting(&text), 10_050);
        assert_eq!(count_words(&text, region), 30);

        let small = policy.clone().with_base_words(10);
        let region = small.compute_render_range(&bursting(&text), 10_050);
        assert_eq!(count_words(&text, region), 15);
    }

    #[test]
    fn stale_burst_does_not_grow() {
        let text = numbered_words(60);
        let policy = RegionPolicy::default();
        // 500ms since the last key, burst is over
        let region = policy.compute_render_range(&bursting(&text), 10_500);
        assert_eq!(count_words(&text, region), 20);
    }

    #[test]
    fn region_does_not_cross_newline() {
        let text = "older paragraph words\nnew line";
        let region = RegionPolicy::default().compute_render_range(&state(text, text.len()), 0);
        assert_eq!(region.slice(text), Some("new line"));
    }

    #[test]
    fn caret_right_after_newline_is_empty() {
        let text = "line one\n";
        let region = RegionPolicy::default().compute_render_range(&state(text, text.len()), 0);
        assert!(region.is_empty());
    }

    #[test]
    fn search_window_bounds_scan() {
        let long = "x".repeat(1500);
        let text = format!("{} tail words", long);
        let region = RegionPolicy::default().compute_render_range(&state(&text, text.len()), 0);
        assert!(text.len() - region.start <= 1000);
    }

    #[test]
    fn context_range_widens_within_caret() {
        let text = "alpha beta gamma delta epsilon";
        let caret = text.len();
        let policy = RegionPolicy {
            context_left_chars: 6,
            context_right_chars: 50,
            ..RegionPolicy::default()
        };
        let render = ActiveRegion::new(11, 22);
        let ctx = policy.compute_context_range(&state(text, caret), render);
        assert_eq!(ctx.start, 5);
        assert_eq!(ctx.end, caret);
    }

    #[test]
    fn context_range_never_passes_caret() {
        let text = "alpha beta gamma delta";
        let caret = 10;
        let ctx = RegionPolicy::default()
            .compute_context_range(&state(text, caret), ActiveRegion::new(6, 10));
        assert!(ctx.end <= caret);
        assert_eq!(ctx.start, 0);
    }

    proptest! {
        #[test]
        fn regions_are_caret_safe_and_aligned(
            text in "[a-z \\n\u{e9}\u{301}]{0,120}",
            caret_seed in 0usize..200,
            burst in any::<bool>(),
        ) {
            let caret = caret_seed.min(text.len());
            let mut s = state(&text, caret);
            if burst {
                s.burst = BurstState { last_key_ms: 1_000, burst_start_ms: 0, key_count: 99 };
            }
            let region = RegionPolicy::default().compute_render_range(&s, 1_050);
            prop_assert!(region.end <= caret);
            prop_assert!(region.start <= region.end);
            if !region.is_empty() {
                prop_assert!(is_grapheme_boundary(&text, region.start));
                prop_assert!(is_grapheme_boundary(&text, region.end));
            }
        }

        #[test]
        fn burst_budget_never_exceeds_cap(base in 5usize..=50) {
            let policy = RegionPolicy::default().with_base_words(base);
            let burst = BurstState { last_key_ms: 1_000, burst_start_ms: 0, key_count: 99 };
            let budget = policy.word_budget(&burst, 1_010);
            let limit = ((base as f64 * 1.5).floor() as usize).min(30);
            prop_assert!(budget <= limit);
        }
    }
}
