use log::{debug, warn};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

use crate::confidence::ConfidenceThresholds;
use crate::error::Result;

pub const MIN_REGION_WORDS: usize = 5;
pub const MAX_REGION_WORDS: usize = 50;
pub const MIN_SENSITIVITY: f64 = 0.1;
pub const MAX_SENSITIVITY: f64 = 5.0;

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum ToneTarget {
    #[default]
    None,
    Casual,
    Professional,
    Friendly,
    Concise,
}

impl ToneTarget {
    pub fn is_none(self) -> bool {
        matches!(self, ToneTarget::None)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ToneTarget::None => "none",
            ToneTarget::Casual => "casual",
            ToneTarget::Professional => "professional",
            ToneTarget::Friendly => "friendly",
            ToneTarget::Concise => "concise",
        }
    }
}

impl std::str::FromStr for ToneTarget {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "none" | "" => Ok(ToneTarget::None),
            "casual" => Ok(ToneTarget::Casual),
            "professional" => Ok(ToneTarget::Professional),
            "friendly" => Ok(ToneTarget::Friendly),
            "concise" => Ok(ToneTarget::Concise),
            other => Err(format!("unknown tone target '{}'", other)),
        }
    }
}

/// Named bundles of validation and sensitivity settings.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Preset {
    /// More validation, less hallucination risk.
    Strict,
    Balanced,
    /// Trust the model more.
    Lenient,
}

impl std::str::FromStr for Preset {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "strict" => Ok(Preset::Strict),
            "balanced" => Ok(Preset::Balanced),
            "lenient" => Ok(Preset::Lenient),
            other => Err(format!("unknown preset '{}'", other)),
        }
    }
}

/// Per-session correction configuration.
///
/// Owned by the session and passed by reference to the region policy, the
/// confidence gate and the scheduler. Setters clamp into the documented
/// bounds instead of rejecting values.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct CorrectionSettings {
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(default = "default_active_region_words")]
    pub active_region_words: usize,
    #[serde(default = "default_context_left_chars")]
    pub context_left_chars: usize,
    #[serde(default = "default_context_right_chars")]
    pub context_right_chars: usize,
    #[serde(default = "default_search_window_chars")]
    pub search_window_chars: usize,
    #[serde(default = "default_burst_recent_key_ms")]
    pub burst_recent_key_ms: u64,
    #[serde(default = "default_burst_min_duration_ms")]
    pub burst_min_duration_ms: u64,
    #[serde(default = "default_burst_min_keys")]
    pub burst_min_keys: u32,
    #[serde(default = "default_burst_growth")]
    pub burst_growth: f64,
    #[serde(default = "default_burst_word_cap")]
    pub burst_word_cap: usize,
    #[serde(default)]
    pub thresholds: ConfidenceThresholds,
    #[serde(default = "default_sensitivity")]
    pub sensitivity: f64,
    #[serde(default)]
    pub tone_target: ToneTarget,
    /// Ask the model to vet context and tone rewrites before they commit.
    #[serde(default = "default_enable_self_review")]
    pub enable_self_review: bool,
    #[serde(default = "default_pause_ms")]
    pub pause_ms: u64,
    #[serde(default = "default_tick_interval_ms")]
    pub tick_interval_ms: u64,
    #[serde(default = "default_max_words_per_tick")]
    pub max_words_per_tick: usize,
    #[serde(default = "default_min_words")]
    pub min_words: usize,
    #[serde(default = "default_min_chars")]
    pub min_chars: usize,
    #[serde(default = "default_length_ratio_min")]
    pub length_ratio_min: f64,
    #[serde(default = "default_length_ratio_max")]
    pub length_ratio_max: f64,
    #[serde(default = "default_sentence_tolerance")]
    pub sentence_tolerance: usize,
    #[serde(default = "default_latency_shrink_ms")]
    pub latency_shrink_ms: u64,
    #[serde(default = "default_latency_skip_tone_ms")]
    pub latency_skip_tone_ms: u64,
    #[serde(default = "default_stage_timeout_ms")]
    pub stage_timeout_ms: u64,
    #[serde(default = "default_abort_ack_timeout_ms")]
    pub abort_ack_timeout_ms: u64,
    #[serde(default = "default_history_cap")]
    pub history_cap: usize,
}

impl Default for CorrectionSettings {
    fn default() -> Self {
        get_default_settings()
    }
}

impl CorrectionSettings {
    pub fn from_preset(preset: Preset) -> Self {
        let mut settings = get_default_settings();
        settings.apply_preset(preset);
        settings
    }

    /// Overwrite the validation and sensitivity fields with a preset.
    pub fn apply_preset(&mut self, preset: Preset) {
        match preset {
            Preset::Strict => {
                self.min_words = 4;
                self.length_ratio_min = 0.6;
                self.length_ratio_max = 1.5;
                self.sensitivity = 0.8;
                self.enable_self_review = true;
            }
            Preset::Balanced => {
                self.min_words = default_min_words();
                self.length_ratio_min = default_length_ratio_min();
                self.length_ratio_max = default_length_ratio_max();
                self.sensitivity = default_sensitivity();
                self.enable_self_review = default_enable_self_review();
            }
            Preset::Lenient => {
                self.min_words = 2;
                self.length_ratio_min = 0.4;
                self.length_ratio_max = 2.0;
                self.sensitivity = 1.25;
                self.enable_self_review = false;
            }
        }
        self.normalize();
    }

    pub fn set_active_region_words(&mut self, words: usize) {
        self.active_region_words = words.clamp(MIN_REGION_WORDS, MAX_REGION_WORDS);
    }

    pub fn set_sensitivity(&mut self, sensitivity: f64) {
        self.sensitivity = clamp_finite(sensitivity, MIN_SENSITIVITY, MAX_SENSITIVITY, 1.0);
    }

    pub fn set_thresholds(&mut self, thresholds: ConfidenceThresholds) {
        self.thresholds = thresholds.clamped();
    }

    pub fn set_tone_target(&mut self, target: ToneTarget) {
        self.tone_target = target;
    }

    pub fn set_enabled(&mut self, enabled: bool) {
        self.enabled = enabled;
    }

    /// Clamp every field into its documented bounds.
    pub fn normalize(&mut self) {
        self.active_region_words = self
            .active_region_words
            .clamp(MIN_REGION_WORDS, MAX_REGION_WORDS);
        self.sensitivity = clamp_finite(
            self.sensitivity,
            MIN_SENSITIVITY,
            MAX_SENSITIVITY,
            default_sensitivity(),
        );
        self.thresholds = self.thresholds.clamped();
        self.search_window_chars = self.search_window_chars.clamp(64, 1000);
        self.burst_growth = clamp_finite(self.burst_growth, 1.0, 3.0, default_burst_growth());
        self.burst_word_cap = self.burst_word_cap.clamp(MIN_REGION_WORDS, MAX_REGION_WORDS);
        self.tick_interval_ms = self.tick_interval_ms.max(10);
        self.max_words_per_tick = self.max_words_per_tick.max(1);
        self.length_ratio_min = clamp_finite(self.length_ratio_min, 0.0, 1.0, 0.5);
        self.length_ratio_max =
            clamp_finite(self.length_ratio_max, self.length_ratio_min.max(1.0), 10.0, 1.8);
        self.history_cap = self.history_cap.max(1);
        if self.latency_skip_tone_ms < self.latency_shrink_ms {
            self.latency_skip_tone_ms = self.latency_shrink_ms;
        }
    }
}

fn clamp_finite(value: f64, min: f64, max: f64, fallback: f64) -> f64 {
    if value.is_finite() {
        value.clamp(min, max)
    } else {
        fallback
    }
}

fn default_enabled() -> bool {
    true
}

fn default_enable_self_review() -> bool {
    true
}

fn default_active_region_words() -> usize {
    20
}

fn default_context_left_chars() -> usize {
    240
}

fn default_context_right_chars() -> usize {
    80
}

fn default_search_window_chars() -> usize {
    1000
}

fn default_burst_recent_key_ms() -> u64 {
    200
}

fn default_burst_min_duration_ms() -> u64 {
    500
}

fn default_burst_min_keys() -> u32 {
    5
}

fn default_burst_growth() -> f64 {
    1.5
}

fn default_burst_word_cap() -> usize {
    30
}

fn default_sensitivity() -> f64 {
    1.0
}

fn default_pause_ms() -> u64 {
    600
}

fn default_tick_interval_ms() -> u64 {
    75
}

fn default_max_words_per_tick() -> usize {
    1
}

fn default_min_words() -> usize {
    3
}

fn default_min_chars() -> usize {
    10
}

fn default_length_ratio_min() -> f64 {
    0.5
}

fn default_length_ratio_max() -> f64 {
    1.8
}

fn default_sentence_tolerance() -> usize {
    1
}

fn default_latency_shrink_ms() -> u64 {
    400
}

fn default_latency_skip_tone_ms() -> u64 {
    900
}

fn default_stage_timeout_ms() -> u64 {
    2000
}

fn default_abort_ack_timeout_ms() -> u64 {
    250
}

fn default_history_cap() -> usize {
    10
}

pub fn get_default_settings() -> CorrectionSettings {
    CorrectionSettings {
        enabled: default_enabled(),
        active_region_words: default_active_region_words(),
        context_left_chars: default_context_left_chars(),
        context_right_chars: default_context_right_chars(),
        search_window_chars: default_search_window_chars(),
        burst_recent_key_ms: default_burst_recent_key_ms(),
        burst_min_duration_ms: default_burst_min_duration_ms(),
        burst_min_keys: default_burst_min_keys(),
        burst_growth: default_burst_growth(),
        burst_word_cap: default_burst_word_cap(),
        thresholds: ConfidenceThresholds::default(),
        sensitivity: default_sensitivity(),
        tone_target: ToneTarget::None,
        enable_self_review: default_enable_self_review(),
        pause_ms: default_pause_ms(),
        tick_interval_ms: default_tick_interval_ms(),
        max_words_per_tick: default_max_words_per_tick(),
        min_words: default_min_words(),
        min_chars: default_min_chars(),
        length_ratio_min: default_length_ratio_min(),
        length_ratio_max: default_length_ratio_max(),
        sentence_tolerance: default_sentence_tolerance(),
        latency_shrink_ms: default_latency_shrink_ms(),
        latency_skip_tone_ms: default_latency_skip_tone_ms(),
        stage_timeout_ms: default_stage_timeout_ms(),
        abort_ack_timeout_ms: default_abort_ack_timeout_ms(),
        history_cap: default_history_cap(),
    }
}

/// Load settings from a JSON file, writing defaults when the file is missing
/// or cannot be parsed.
pub fn load_or_create_settings(path: &Path) -> Result<CorrectionSettings> {
    let mut settings = match fs::read_to_string(path) {
        Ok(raw) => match serde_json::from_str::<CorrectionSettings>(&raw) {
            Ok(settings) => {
                debug!("Loaded settings from {:?}", path);
                settings
            }
            Err(e) => {
                warn!("Failed to parse settings at {:?}: {}", path, e);
                let defaults = get_default_settings();
                write_settings(path, &defaults)?;
                defaults
            }
        },
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            debug!("No settings at {:?}, creating defaults", path);
            let defaults = get_default_settings();
            write_settings(path, &defaults)?;
            defaults
        }
        Err(e) => return Err(e.into()),
    };

    settings.normalize();
    Ok(settings)
}

pub fn write_settings(path: &Path, settings: &CorrectionSettings) -> Result<()> {
    let mut normalized = settings.clone();
    normalized.normalize();

    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)?;
        }
    }
    fs::write(path, serde_json::to_string_pretty(&normalized)?)?;
    Ok(())
}
