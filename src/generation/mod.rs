//! Generation adapter boundary.
//!
//! The engine consumes a language model only through [`GenerationAdapter`]:
//! a cancellable stream of text chunks per request. It never assumes a
//! specific model or runtime.

pub mod device;
pub mod guard;
pub mod prompts;
pub mod sidecar;

use async_trait::async_trait;
use futures_util::stream::BoxStream;
use serde::Serialize;
use std::path::PathBuf;
use tokio_util::sync::CancellationToken;

use crate::error::Result;
use crate::region::ActiveRegion;
use crate::settings::ToneTarget;
use crate::wave::Stage;

pub use device::{DeviceTier, DeviceTierPolicy};
pub use guard::StreamGuard;
pub use sidecar::SidecarAdapter;

/// Generated text, delivered chunk by chunk.
pub type ChunkStream = BoxStream<'static, Result<String>>;

#[derive(Debug, Clone, Default)]
pub struct InitOptions {
    pub model_path: Option<PathBuf>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Capabilities {
    pub tier: DeviceTier,
    pub max_tokens: u32,
    pub model: Option<String>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct GenerationStats {
    pub runs: u64,
    /// Streams cancelled because a newer one started.
    pub stale_drops: u64,
}

/// Per-stage generation settings. Each stage carries only what it uses.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "stage", rename_all = "lowercase")]
pub enum StageSettings {
    Noise {
        max_tokens: u32,
    },
    Context {
        max_tokens: u32,
        /// Read-only window around the Active Region.
        context: ActiveRegion,
    },
    Tone {
        max_tokens: u32,
        target: ToneTarget,
    },
    /// Second pass over an accepted rewrite of the Active Region.
    Review {
        max_tokens: u32,
        reviewing: Stage,
        proposal: String,
    },
}

impl StageSettings {
    pub fn stage(&self) -> Stage {
        match self {
            StageSettings::Noise { .. } => Stage::Noise,
            StageSettings::Context { .. } => Stage::Context,
            StageSettings::Tone { .. } => Stage::Tone,
            StageSettings::Review { reviewing, .. } => *reviewing,
        }
    }

    pub fn is_review(&self) -> bool {
        matches!(self, StageSettings::Review { .. })
    }

    pub fn max_tokens(&self) -> u32 {
        match self {
            StageSettings::Noise { max_tokens }
            | StageSettings::Context { max_tokens, .. }
            | StageSettings::Tone { max_tokens, .. }
            | StageSettings::Review { max_tokens, .. } => *max_tokens,
        }
    }
}

/// One generation request.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StreamParams {
    pub text: String,
    pub caret: usize,
    pub active_region: ActiveRegion,
    pub settings: StageSettings,
}

impl StreamParams {
    /// The span the stage is asked to rewrite.
    pub fn region_text(&self) -> &str {
        self.active_region.slice(&self.text).unwrap_or("")
    }

    /// Read-only text preceding the region, if the stage carries a window.
    pub fn context_before(&self) -> &str {
        match &self.settings {
            StageSettings::Context { context, .. } => self
                .text
                .get(context.start.min(self.active_region.start)..self.active_region.start)
                .unwrap_or(""),
            _ => "",
        }
    }
}

/// A local, swappable text generator.
///
/// Implementations must be single-flight per consumer: starting a stream
/// cancels the previous one (see [`StreamGuard`]).
#[async_trait]
pub trait GenerationAdapter: Send + Sync {
    async fn init(&self, opts: &InitOptions) -> Result<Capabilities>;

    /// Start generating. The stream ends early, without an error, once
    /// `cancel` fires or a newer stream starts.
    async fn stream(&self, params: StreamParams, cancel: CancellationToken) -> Result<ChunkStream>;

    /// Cancel whatever stream is in flight.
    fn abort(&self);

    fn stats(&self) -> GenerationStats;

    /// Name used in logs.
    fn name(&self) -> &str;
}
