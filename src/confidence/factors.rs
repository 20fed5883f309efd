//! Individual confidence factors.
//!
//! Each factor is a pure function returning a score in `[0, 1]`.

use log::error;
use once_cell::sync::Lazy;
use regex::Regex;
use strsim::normalized_levenshtein;
use unicode_segmentation::UnicodeSegmentation;

use crate::settings::CorrectionSettings;

/// Words longer than this are treated as keyboard mashing.
const MAX_WORD_CHARS: usize = 20;

/// More all-consonant runs than this means the model echoed garbage back.
const MAX_GARBLED_RUNS: usize = 2;

// Replies that talk to the user instead of returning the corrected text.
const CONVERSATIONAL: [&str; 13] = [
    r"^i'?m not sure",
    r"^i don'?t understand",
    r"^i can'?t",
    r"^sorry",
    r"^please provide",
    r"^what do you mean",
    r"^could you",
    r"^can you",
    r"^it seems like",
    r"^i think you",
    r"^this (text|input|message)",
    r"^the (text|input|message)",
    r"^here is",
];

const GARBLED_RUN_PATTERN: &str = r"\b[bcdfghjklmnpqrstvwxz]{4,}\b";
const SENTENCE_END_PATTERN: &str = r"[.!?]+";

fn compile(pattern: &str) -> Option<Regex> {
    match Regex::new(pattern) {
        Ok(re) => Some(re),
        Err(e) => {
            error!("Built-in pattern '{}' does not compile: {}", pattern, e);
            None
        }
    }
}

static CONVERSATIONAL_PATTERNS: Lazy<Vec<Regex>> =
    Lazy::new(|| CONVERSATIONAL.iter().filter_map(|p| compile(p)).collect());

static GARBLED_RUN: Lazy<Option<Regex>> = Lazy::new(|| compile(GARBLED_RUN_PATTERN));

static SENTENCE_END: Lazy<Option<Regex>> = Lazy::new(|| compile(SENTENCE_END_PATTERN));

/// Structural limits a proposal must respect.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ValidationLimits {
    pub length_ratio_min: f64,
    pub length_ratio_max: f64,
    pub sentence_tolerance: usize,
}

impl Default for ValidationLimits {
    fn default() -> Self {
        Self::from_settings(&CorrectionSettings::default())
    }
}

impl ValidationLimits {
    pub fn from_settings(settings: &CorrectionSettings) -> Self {
        Self {
            length_ratio_min: settings.length_ratio_min,
            length_ratio_max: settings.length_ratio_max,
            sentence_tolerance: settings.sentence_tolerance,
        }
    }
}

fn is_vowel(c: char) -> bool {
    matches!(c.to_ascii_lowercase(), 'a' | 'e' | 'i' | 'o' | 'u' | 'y')
}

/// Whether a single word looks like something a person meant to type.
fn is_recognizable(word: &str) -> bool {
    if word.chars().count() > MAX_WORD_CHARS {
        return false;
    }
    if word.chars().any(|c| c.is_numeric()) {
        return true;
    }
    // Non-ASCII scripts are not judged by English vowel rules.
    if word.chars().any(|c| c.is_alphabetic() && !c.is_ascii()) {
        return true;
    }
    word.chars().any(is_vowel)
}

/// Fraction of recognizable words in `span`, the raw text before correction.
///
/// An empty span scores 0.0.
pub fn compute_input_fidelity(span: &str) -> f64 {
    let mut total = 0usize;
    let mut recognizable = 0usize;
    for word in span.unicode_words() {
        total += 1;
        if is_recognizable(word) {
            recognizable += 1;
        }
    }
    if total == 0 {
        return 0.0;
    }
    recognizable as f64 / total as f64
}

/// Count sentences by runs of terminal punctuation; unpunctuated text is one
/// sentence.
pub fn count_sentences(text: &str) -> usize {
    let explicit = SENTENCE_END
        .as_ref()
        .map(|re| re.find_iter(text).count())
        .unwrap_or(0);
    explicit.max(1)
}

fn garbled_runs(text: &str) -> usize {
    let lower = text.to_lowercase();
    GARBLED_RUN
        .as_ref()
        .map(|re| re.find_iter(&lower).count())
        .unwrap_or(0)
}

fn is_conversational(text: &str) -> bool {
    let lower = text.to_lowercase();
    CONVERSATIONAL_PATTERNS.iter().any(|re| re.is_match(&lower))
}

/// Score how well `proposal` preserves the structure of `original`.
///
/// Returns 0.0 for empty output, conversational replies, length ratios
/// outside the limits, sentence-count drift beyond the tolerance, or output
/// that is still garbled. Otherwise blends a structural score with edit
/// similarity.
pub fn transformation_quality(original: &str, proposal: &str, limits: &ValidationLimits) -> f64 {
    let original = original.trim();
    let proposal = proposal.trim();

    if proposal.is_empty() || is_conversational(proposal) {
        return 0.0;
    }

    let original_len = original.chars().count();
    let proposal_len = proposal.chars().count();
    let length_score = if original_len > 0 {
        let ratio = proposal_len as f64 / original_len as f64;
        if ratio > limits.length_ratio_max || ratio < limits.length_ratio_min {
            return 0.0;
        }
        1.0 - (1.0 - ratio).abs() * 0.5
    } else {
        0.5
    };

    let sentence_diff = count_sentences(original).abs_diff(count_sentences(proposal));
    if sentence_diff > limits.sentence_tolerance {
        return 0.0;
    }

    if garbled_runs(proposal) > MAX_GARBLED_RUNS {
        return 0.0;
    }

    let sentence_score = if sentence_diff == 0 { 1.0 } else { 0.7 };
    let structural = (length_score + sentence_score) / 2.0;
    let similarity = normalized_levenshtein(original, proposal);

    ((structural + similarity) / 2.0).clamp(0.0, 1.0)
}

fn ends_sentence(context: &str) -> bool {
    match context.trim_end().chars().next_back() {
        None => true,
        Some(c) => matches!(c, '.' | '!' | '?' | '\n'),
    }
}

fn starts_upper(text: &str) -> Option<bool> {
    text.chars()
        .find(|c| c.is_alphabetic())
        .map(|c| c.is_uppercase())
}

/// Score how well `proposal` fits after `context_before`.
///
/// Weighted blend of the recognizable-word ratio of the proposal and whether
/// its capitalization agrees with the sentence position the context implies.
pub fn context_coherence(context_before: &str, proposal: &str) -> f64 {
    let words = compute_input_fidelity(proposal);
    if proposal.trim().is_empty() {
        return 0.0;
    }

    let first_word = proposal.unicode_words().next().unwrap_or("");
    let casing = match (ends_sentence(context_before), starts_upper(proposal)) {
        (_, None) => 1.0,
        (true, Some(true)) => 1.0,
        (true, Some(false)) => 0.5,
        (false, Some(false)) => 1.0,
        // "I" and its contractions are capitalized anywhere.
        (false, Some(true)) if first_word == "I" || first_word.starts_with("I'") => 1.0,
        (false, Some(true)) => 0.7,
    };

    (0.7 * words + 0.3 * casing).clamp(0.0, 1.0)
}

/// Exponential decay with the given half-life. A zero half-life disables
/// decay.
pub fn temporal_decay(age_ms: u64, half_life_ms: u64) -> f64 {
    if half_life_ms == 0 {
        return 1.0;
    }
    0.5f64.powf(age_ms as f64 / half_life_ms as f64)
}
