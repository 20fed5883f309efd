//! Test doubles shared by the unit tests.

use async_trait::async_trait;
use futures_util::stream;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use crate::error::{CorrectionError, Result};
use crate::generation::guard::guarded;
use crate::generation::{
    Capabilities, ChunkStream, DeviceTier, GenerationAdapter, GenerationStats, InitOptions,
    StreamGuard, StreamParams,
};
use crate::input::SecurityGate;
use crate::region::ActiveRegion;
use crate::streaming::{CorrectionObserver, SchedulerStatus};
use crate::wave::{CorrectionWave, Stage};

/// What the adapter does for one request.
#[derive(Debug, Clone)]
pub(crate) enum Script {
    /// Yield these chunks, then end.
    Chunks(Vec<String>),
    /// Refuse to start the stream.
    Fail(String),
    /// Yield these chunks, then an error.
    FailAfter(Vec<String>, String),
    /// Never yield anything.
    Stall,
    /// Report the backend as gone.
    Unavailable,
}

/// Adapter that replays queued scripts per stage.
///
/// With nothing queued for a stage it echoes the requested span back, which
/// the engine treats as "no change". Reviews have their own queue and pass
/// by default.
pub(crate) struct ScriptedAdapter {
    guard: StreamGuard,
    scripts: Mutex<HashMap<Stage, VecDeque<Script>>>,
    reviews: Mutex<VecDeque<Script>>,
    requests: Mutex<Vec<StreamParams>>,
    tier: DeviceTier,
}

impl ScriptedAdapter {
    pub(crate) fn new() -> Self {
        Self::with_tier(DeviceTier::WebGpu)
    }

    pub(crate) fn with_tier(tier: DeviceTier) -> Self {
        Self {
            guard: StreamGuard::new(Duration::from_millis(50)),
            scripts: Mutex::new(HashMap::new()),
            reviews: Mutex::new(VecDeque::new()),
            requests: Mutex::new(Vec::new()),
            tier,
        }
    }

    pub(crate) fn push(&self, stage: Stage, script: Script) {
        self.scripts
            .lock()
            .unwrap()
            .entry(stage)
            .or_default()
            .push_back(script);
    }

    /// Queue `text` for `stage`, delivered one word per chunk.
    pub(crate) fn reply(&self, stage: Stage, text: &str) {
        let chunks = text.split_inclusive(' ').map(str::to_string).collect();
        self.push(stage, Script::Chunks(chunks));
    }

    pub(crate) fn push_review(&self, script: Script) {
        self.reviews.lock().unwrap().push_back(script);
    }

    pub(crate) fn reply_review(&self, verdict: &str) {
        self.push_review(Script::Chunks(vec![verdict.to_string()]));
    }

    /// Every request except reviews, in order.
    pub(crate) fn requests(&self) -> Vec<StreamParams> {
        self.requests
            .lock()
            .unwrap()
            .iter()
            .filter(|p| !p.settings.is_review())
            .cloned()
            .collect()
    }

    pub(crate) fn review_requests(&self) -> Vec<StreamParams> {
        self.requests
            .lock()
            .unwrap()
            .iter()
            .filter(|p| p.settings.is_review())
            .cloned()
            .collect()
    }

    pub(crate) fn stages_requested(&self) -> Vec<Stage> {
        self.requests()
            .iter()
            .map(|p| p.settings.stage())
            .collect()
    }
}

#[async_trait]
impl GenerationAdapter for ScriptedAdapter {
    async fn init(&self, _opts: &InitOptions) -> Result<Capabilities> {
        Ok(Capabilities {
            tier: self.tier,
            max_tokens: 64,
            model: Some("scripted".to_string()),
        })
    }

    async fn stream(&self, params: StreamParams, cancel: CancellationToken) -> Result<ChunkStream> {
        let lease = self.guard.begin(&cancel).await;
        let stage = params.settings.stage();
        let review = params.settings.is_review();
        let echo = params.region_text().to_string();
        self.requests.lock().unwrap().push(params);

        let script = if review {
            self.reviews
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or(Script::Chunks(vec!["REASONABLE".to_string()]))
        } else {
            self.scripts
                .lock()
                .unwrap()
                .get_mut(&stage)
                .and_then(VecDeque::pop_front)
                .unwrap_or(Script::Chunks(vec![echo]))
        };

        match script {
            Script::Chunks(chunks) => Ok(guarded(stream::iter(chunks.into_iter().map(Ok)), lease)),
            Script::FailAfter(chunks, message) => {
                let items = chunks
                    .into_iter()
                    .map(Ok)
                    .chain(std::iter::once(Err(CorrectionError::Generation(message))));
                Ok(guarded(stream::iter(items), lease))
            }
            Script::Fail(message) => Err(CorrectionError::Generation(message)),
            Script::Stall => Ok(guarded(stream::pending(), lease)),
            Script::Unavailable => Err(CorrectionError::AdapterUnavailable(
                "scripted backend stopped".to_string(),
            )),
        }
    }

    fn abort(&self) {
        self.guard.abort();
    }

    fn stats(&self) -> GenerationStats {
        self.guard.stats()
    }

    fn name(&self) -> &str {
        "scripted"
    }
}

/// Observer that keeps everything it is told.
#[derive(Default)]
pub(crate) struct RecordingObserver {
    statuses: Mutex<Vec<SchedulerStatus>>,
    texts: Mutex<Vec<String>>,
    waves: Mutex<Vec<u64>>,
    rollbacks: Mutex<Vec<u64>>,
    unavailable: Mutex<Vec<String>>,
}

impl RecordingObserver {
    pub(crate) fn statuses(&self) -> Vec<SchedulerStatus> {
        self.statuses.lock().unwrap().clone()
    }

    pub(crate) fn last_text(&self) -> Option<String> {
        self.texts.lock().unwrap().last().cloned()
    }

    pub(crate) fn waves(&self) -> usize {
        self.waves.lock().unwrap().len()
    }

    pub(crate) fn rollbacks(&self) -> usize {
        self.rollbacks.lock().unwrap().len()
    }

    pub(crate) fn unavailable(&self) -> Vec<String> {
        self.unavailable.lock().unwrap().clone()
    }
}

impl CorrectionObserver for RecordingObserver {
    fn on_status(&self, status: SchedulerStatus) {
        self.statuses.lock().unwrap().push(status);
    }

    fn on_active_region(&self, _region: ActiveRegion) {}

    fn on_text_changed(&self, text: &str, _caret: usize) {
        self.texts.lock().unwrap().push(text.to_string());
    }

    fn on_wave_complete(&self, wave: &CorrectionWave) {
        self.waves.lock().unwrap().push(wave.id);
    }

    fn on_rollback(&self, wave: &CorrectionWave, _text: &str) {
        self.rollbacks.lock().unwrap().push(wave.id);
    }

    fn on_unavailable(&self, reason: &str) {
        self.unavailable.lock().unwrap().push(reason.to_string());
    }
}

/// Security gate flipped by the test.
#[derive(Default)]
pub(crate) struct FlagGate {
    secure: AtomicBool,
    composing: AtomicBool,
}

impl FlagGate {
    pub(crate) fn set_secure(&self, secure: bool) {
        self.secure.store(secure, Ordering::SeqCst);
    }

    pub(crate) fn set_composing(&self, composing: bool) {
        self.composing.store(composing, Ordering::SeqCst);
    }
}

impl SecurityGate for FlagGate {
    fn is_secure(&self) -> bool {
        self.secure.load(Ordering::SeqCst)
    }

    fn is_ime_composing(&self) -> bool {
        self.composing.load(Ordering::SeqCst)
    }
}
