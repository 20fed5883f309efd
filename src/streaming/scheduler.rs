//! Correction scheduler.
//!
//! Owns one editing session: it feeds typing events to the diffusion
//! controller, streams corrections on a fixed tick while the user types and
//! runs one correction wave per pause. At most one wave is in flight; any
//! new keystroke cancels it.

use log::{debug, error, info, warn};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use super::diffusion::{DiffusionController, TickOutcome};
use super::observer::{CorrectionObserver, SchedulerStatus};
use super::pause_detector::PauseDetector;
use crate::error::CorrectionError;
use crate::generation::{DeviceTierPolicy, GenerationAdapter, InitOptions};
use crate::input::{now_ms, SecurityGate, TypingEvent};
use crate::region::RegionPolicy;
use crate::settings::{CorrectionSettings, MIN_REGION_WORDS};
use crate::wave::{
    apply_revert_ops, generate_revert_ops, CorrectionWave, WaveHistory, WaveOrchestrator,
    WaveOutcome, WaveSnapshot,
};

/// Smoothing factor for the wave latency average.
const LATENCY_EMA_ALPHA: f64 = 0.3;

/// Messages a host sends to a running scheduler.
pub enum SchedulerCommand {
    Typing(TypingEvent),
    SetEnabled(bool),
    /// Revert the most recent wave.
    Rollback,
    /// Swap the generation adapter, initializing it first.
    SetAdapter(Option<Arc<dyn GenerationAdapter>>),
}

/// A wave ready to run off the scheduler's task.
pub struct WaveJob {
    id: u64,
    orchestrator: WaveOrchestrator,
    snapshot: WaveSnapshot,
    adapter: Option<Arc<dyn GenerationAdapter>>,
    caret: watch::Receiver<usize>,
    cancel: CancellationToken,
}

impl WaveJob {
    pub async fn run(self) -> WaveResult {
        let outcome = self
            .orchestrator
            .run(&self.snapshot, self.adapter, &self.caret, &self.cancel)
            .await;
        WaveResult {
            id: self.id,
            outcome,
        }
    }
}

pub struct WaveResult {
    id: u64,
    pub outcome: WaveOutcome,
}

struct InFlightWave {
    id: u64,
    cancel: CancellationToken,
}

pub struct Scheduler {
    settings: CorrectionSettings,
    controller: DiffusionController,
    history: WaveHistory,
    detector: PauseDetector,
    tier: DeviceTierPolicy,
    adapter: Option<Arc<dyn GenerationAdapter>>,
    observer: Arc<dyn CorrectionObserver>,
    security: Arc<dyn SecurityGate>,
    status: SchedulerStatus,
    unavailable: bool,
    suspended: bool,
    caret_tx: watch::Sender<usize>,
    in_flight: Option<InFlightWave>,
    next_wave_id: u64,
    latency_ema_ms: Option<f64>,
    last_stream_ms: u64,
}

impl Scheduler {
    pub fn new(
        settings: CorrectionSettings,
        observer: Arc<dyn CorrectionObserver>,
        security: Arc<dyn SecurityGate>,
    ) -> Self {
        let mut settings = settings;
        settings.normalize();
        let (caret_tx, _) = watch::channel(0);
        let status = if settings.enabled {
            SchedulerStatus::Dormant
        } else {
            SchedulerStatus::Disabled
        };

        Self {
            controller: DiffusionController::new(&settings),
            history: WaveHistory::new(settings.history_cap),
            detector: PauseDetector::new(settings.pause_ms, settings.burst_recent_key_ms),
            tier: DeviceTierPolicy::default(),
            adapter: None,
            observer,
            security,
            status,
            unavailable: false,
            suspended: false,
            caret_tx,
            in_flight: None,
            next_wave_id: 1,
            latency_ema_ms: None,
            last_stream_ms: 0,
            settings,
        }
    }

    /// Initialize `adapter` and use it for this session.
    ///
    /// A failed init leaves the session in the unavailable state.
    pub async fn attach_adapter(&mut self, adapter: Arc<dyn GenerationAdapter>, opts: &InitOptions) {
        match adapter.init(opts).await {
            Ok(caps) => {
                info!(
                    "Generation adapter {} ready on {} (max {} tokens)",
                    adapter.name(),
                    caps.tier.as_str(),
                    caps.max_tokens
                );
                let mut tier = DeviceTierPolicy::for_tier(caps.tier);
                tier.token_cap = tier.token_cap.min(caps.max_tokens.max(1));
                self.tier = tier;
                self.controller.set_tier(tier);
                self.set_adapter(Some(adapter));
            }
            Err(e) => {
                error!("Failed to initialize {}: {}", adapter.name(), e);
                self.set_adapter(None);
                self.mark_unavailable(&e);
            }
        }
    }

    /// Use `adapter` as-is, without initializing it.
    pub fn set_adapter(&mut self, adapter: Option<Arc<dyn GenerationAdapter>>) {
        self.cancel_wave();
        self.controller.set_adapter(adapter.clone());
        self.adapter = adapter;
        if self.adapter.is_some() && self.unavailable {
            self.unavailable = false;
            self.set_status(SchedulerStatus::Idle);
        }
    }

    pub fn status(&self) -> SchedulerStatus {
        self.status
    }

    pub fn text(&self) -> &str {
        self.controller.text()
    }

    pub fn caret(&self) -> usize {
        self.controller.caret()
    }

    pub fn history(&self) -> &WaveHistory {
        &self.history
    }

    pub fn settings(&self) -> &CorrectionSettings {
        &self.settings
    }

    pub fn is_wave_in_flight(&self) -> bool {
        self.in_flight.is_some()
    }

    pub fn set_enabled(&mut self, enabled: bool) {
        self.settings.set_enabled(enabled);
        if enabled {
            info!("Corrections enabled");
            self.set_status(self.resting_status());
        } else {
            info!("Corrections disabled");
            self.cancel_wave();
            self.controller.abort();
            self.set_status(SchedulerStatus::Disabled);
        }
    }

    /// Feed one typing snapshot.
    pub fn handle_typing(&mut self, event: TypingEvent) {
        // A keystroke always invalidates the wave in flight.
        self.cancel_wave();

        if self.check_security() {
            return;
        }
        if self.suspended {
            debug!("Resuming after suspension");
            self.suspended = false;
        }

        let TypingEvent { text, caret, at_ms } = event;
        self.detector.on_key(at_ms);
        self.controller.update(&text, caret, at_ms);
        self.caret_tx.send_replace(self.controller.caret());

        if self.history.has_open_wave() {
            self.history.observe_text(self.controller.text());
        } else {
            self.history.start_wave(self.controller.text());
        }

        if !self.settings.enabled {
            return;
        }
        let region = RegionPolicy::from_settings(&self.settings)
            .compute_render_range(self.controller.state(), at_ms);
        self.observer.on_active_region(region);

        if !self.unavailable {
            self.set_status(SchedulerStatus::Listening);
        }
    }

    /// One streaming tick. Returns true when it edited the text.
    pub async fn tick(&mut self, now_ms: u64) -> bool {
        if self.check_security() || !self.can_correct() || self.in_flight.is_some() {
            return false;
        }
        if !self.controller.is_streaming()
            && now_ms.saturating_sub(self.last_stream_ms) < self.tier.cooldown_ms
        {
            return false;
        }

        let was_streaming = self.controller.is_streaming();
        let result = self.controller.tick_once(now_ms).await;
        if !was_streaming && self.controller.is_streaming() {
            self.last_stream_ms = now_ms;
        }

        match result {
            Ok(TickOutcome::Advanced { applied, .. }) if applied > 0 => {
                self.record_applied();
                self.publish_text();
                true
            }
            Ok(_) => false,
            Err(e) if e.is_unavailable() => {
                self.mark_unavailable(&e);
                false
            }
            Err(e) => {
                // Streaming is best effort; stop and let the next pause retry.
                debug!("Streaming tick failed, stopping stream: {}", e);
                self.controller.abort();
                false
            }
        }
    }

    /// Whether the typist has just paused.
    pub fn poll_pause(&mut self, now_ms: u64) -> bool {
        if self.check_security() || !self.can_correct() || self.in_flight.is_some() {
            return false;
        }
        self.detector.poll(now_ms, self.tier.debounce_scale)
    }

    /// Catch up to the caret and set up the wave for this pause.
    ///
    /// Returns `None` when no wave should run.
    pub async fn prepare_wave(&mut self, now_ms: u64) -> Option<WaveJob> {
        if self.check_security() || !self.can_correct() || self.in_flight.is_some() {
            return None;
        }
        if self.adapter.is_none() {
            self.mark_unavailable(&CorrectionError::AdapterMissing);
            return None;
        }

        self.set_status(SchedulerStatus::Thinking);
        match self.controller.catch_up_all(now_ms).await {
            Ok(steps) => debug!("Caught up in {} step(s)", steps),
            Err(e) if e.is_unavailable() => {
                self.record_applied();
                self.publish_text();
                self.mark_unavailable(&e);
                return None;
            }
            Err(e) => warn!("Catch-up stopped early: {}", e),
        }
        if self.record_applied() > 0 {
            self.publish_text();
        }

        let id = self.next_wave_id;
        self.next_wave_id += 1;
        let cancel = CancellationToken::new();
        self.in_flight = Some(InFlightWave {
            id,
            cancel: cancel.clone(),
        });

        let state = self.controller.state();
        Some(WaveJob {
            id,
            orchestrator: self.next_orchestrator(),
            snapshot: WaveSnapshot {
                text: state.text.clone(),
                caret: state.caret,
                burst: state.burst,
                at_ms: now_ms,
            },
            adapter: self.adapter.clone(),
            caret: self.caret_tx.subscribe(),
            cancel,
        })
    }

    /// Apply a finished wave and close it in the history.
    pub fn finish_wave(&mut self, result: WaveResult) -> Option<CorrectionWave> {
        if self.check_security() {
            debug!("Dropping result of wave {} while suspended", result.id);
            return None;
        }
        match &self.in_flight {
            Some(current) if current.id == result.id => {}
            _ => {
                debug!("Ignoring result of superseded wave {}", result.id);
                return None;
            }
        }
        self.in_flight = None;

        let outcome = result.outcome;
        self.observe_latency(outcome.elapsed_ms);

        if let Some(e) = &outcome.error {
            if e.is_unavailable() {
                self.mark_unavailable(e);
            }
        }
        if outcome.aborted {
            debug!("Wave {} aborted", result.id);
            self.set_status(self.resting_status());
            return None;
        }
        if self.controller.text() != outcome.snapshot_text {
            debug!("Text changed while wave {} ran, dropping its diffs", result.id);
            self.set_status(self.resting_status());
            return None;
        }

        if !outcome.diffs.is_empty() {
            self.set_status(SchedulerStatus::Sweeping);
            let applied = self.controller.apply_wave(&outcome.diffs);
            if applied > 0 {
                self.record_applied();
                self.publish_text();
            } else {
                debug!("Wave {} no longer fits the text, nothing applied", result.id);
            }
        }

        let wave = self.history.complete_wave();
        match &wave {
            Some(wave) => {
                info!("Wave {} complete with {} diff(s)", wave.id, wave.diffs.len());
                self.observer.on_wave_complete(wave);
                self.set_status(SchedulerStatus::Complete);
            }
            None => self.set_status(self.resting_status()),
        }
        wave
    }

    /// Catch up, run the wave and apply it, all on this task.
    pub async fn run_pause(&mut self, now_ms: u64) -> Option<CorrectionWave> {
        let job = self.prepare_wave(now_ms).await?;
        let result = job.run().await;
        self.finish_wave(result)
    }

    /// Revert the most recent wave. Returns the restored text.
    ///
    /// The wave is consumed even if the text has since changed under it.
    pub fn rollback_last_wave(&mut self) -> Option<String> {
        self.cancel_wave();
        let wave = self.history.pop_last_wave()?;

        let current = self.controller.text().to_string();
        let ops = generate_revert_ops(&wave);
        let Some(restored) = apply_revert_ops(&current, &ops) else {
            warn!("Wave {} no longer matches the text, cannot roll back", wave.id);
            return None;
        };

        let delta = restored.len() as isize - current.len() as isize;
        let caret = (self.controller.caret() as isize + delta).clamp(0, restored.len() as isize);
        self.controller.reset(&restored, caret as usize);
        self.caret_tx.send_replace(self.controller.caret());
        self.history.observe_text(&restored);

        info!("Rolled back wave {} ({} diff(s))", wave.id, wave.diffs.len());
        self.observer.on_rollback(&wave, &restored);
        self.publish_text();
        Some(restored)
    }

    /// Drive the session until `shutdown` fires or the command channel
    /// closes.
    pub async fn run(mut self, mut commands: mpsc::Receiver<SchedulerCommand>, shutdown: CancellationToken) {
        let mut ticker =
            tokio::time::interval(Duration::from_millis(self.settings.tick_interval_ms.max(1)));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let (wave_tx, mut wave_rx) = mpsc::channel::<WaveResult>(4);

        info!("Scheduler started");
        loop {
            tokio::select! {
                () = shutdown.cancelled() => break,
                command = commands.recv() => {
                    match command {
                        Some(command) => self.handle_command(command).await,
                        None => break,
                    }
                }
                Some(result) = wave_rx.recv() => {
                    self.finish_wave(result);
                }
                _ = ticker.tick() => {
                    let now = now_ms();
                    self.tick(now).await;
                    if self.poll_pause(now) {
                        // Typing resumed while we were busy.
                        if !commands.is_empty() {
                            continue;
                        }
                        // Catch-up can wait on the model; input takes priority.
                        let prepared = tokio::select! {
                            job = self.prepare_wave(now) => Ok(job),
                            command = commands.recv() => Err(command),
                        };
                        match prepared {
                            Ok(Some(job)) => {
                                let tx = wave_tx.clone();
                                tokio::spawn(async move {
                                    let _ = tx.send(job.run().await).await;
                                });
                            }
                            Ok(None) => {}
                            Err(command) => {
                                self.interrupt_catch_up();
                                match command {
                                    Some(command) => self.handle_command(command).await,
                                    None => break,
                                }
                            }
                        }
                    }
                }
            }
        }

        self.cancel_wave();
        self.controller.abort();
        info!("Scheduler stopped");
    }

    async fn handle_command(&mut self, command: SchedulerCommand) {
        match command {
            SchedulerCommand::Typing(event) => self.handle_typing(event),
            SchedulerCommand::SetEnabled(enabled) => self.set_enabled(enabled),
            SchedulerCommand::Rollback => {
                self.rollback_last_wave();
            }
            SchedulerCommand::SetAdapter(Some(adapter)) => {
                self.attach_adapter(adapter, &InitOptions::default()).await
            }
            SchedulerCommand::SetAdapter(None) => self.set_adapter(None),
        }
    }

    /// Suspend as soon as the host reports a secure field or an IME
    /// composition. Returns true while suspended that way.
    fn check_security(&mut self) -> bool {
        if !self.security.should_suspend() {
            return false;
        }
        if !self.suspended {
            debug!("Secure field or IME composition, suspending");
            self.suspended = true;
            self.cancel_wave();
            self.controller.abort();
            self.detector.reset();
        }
        self.set_status(SchedulerStatus::Suspended);
        true
    }

    /// Stop a catch-up that lost the race against new input. Edits it
    /// already made stay and belong to the open wave.
    fn interrupt_catch_up(&mut self) {
        debug!("Input arrived during catch-up, stopping it");
        self.controller.abort();
        if self.record_applied() > 0 {
            self.publish_text();
        }
        self.set_status(self.resting_status());
    }

    fn can_correct(&self) -> bool {
        self.settings.enabled && !self.suspended && !self.unavailable
    }

    fn resting_status(&self) -> SchedulerStatus {
        if !self.settings.enabled {
            SchedulerStatus::Disabled
        } else if self.unavailable {
            SchedulerStatus::Unavailable
        } else if self.suspended {
            SchedulerStatus::Suspended
        } else if self.controller.text().is_empty() {
            SchedulerStatus::Dormant
        } else {
            SchedulerStatus::Idle
        }
    }

    fn set_status(&mut self, status: SchedulerStatus) {
        if self.status != status {
            debug!("Status {} -> {}", self.status.as_str(), status.as_str());
            self.status = status;
            self.observer.on_status(status);
        }
    }

    fn mark_unavailable(&mut self, reason: &CorrectionError) {
        if !self.unavailable {
            warn!("Corrections unavailable: {}", reason);
            self.unavailable = true;
            self.controller.abort();
            self.observer.on_unavailable(&reason.to_string());
        }
        self.set_status(SchedulerStatus::Unavailable);
    }

    fn cancel_wave(&mut self) {
        if let Some(wave) = self.in_flight.take() {
            debug!("Cancelling wave {}", wave.id);
            wave.cancel.cancel();
        }
    }

    /// Move the controller's edits into the open history wave.
    fn record_applied(&mut self) -> usize {
        let applied = self.controller.take_applied();
        if applied.is_empty() {
            return 0;
        }
        if !self.history.has_open_wave() {
            warn!("Edits applied with no open wave, they cannot be rolled back");
            return applied.len();
        }
        let count = applied.len();
        for diff in applied {
            self.history.add_diff(diff);
        }
        count
    }

    fn publish_text(&self) {
        self.observer
            .on_text_changed(self.controller.text(), self.controller.caret());
    }

    fn observe_latency(&mut self, elapsed_ms: u64) {
        let sample = elapsed_ms as f64;
        self.latency_ema_ms = Some(match self.latency_ema_ms {
            Some(ema) => ema + LATENCY_EMA_ALPHA * (sample - ema),
            None => sample,
        });
    }

    /// Orchestrator for the next wave, scaled back when waves run slow.
    fn next_orchestrator(&self) -> WaveOrchestrator {
        let latency = self.latency_ema_ms.unwrap_or(0.0);
        let mut words = self.settings.active_region_words;
        if latency > self.settings.latency_shrink_ms as f64 {
            words = (words / 2).max(MIN_REGION_WORDS);
            debug!("Wave latency {:.0}ms, shrinking region to {} words", latency, words);
        }
        let skip_tone = latency > self.settings.latency_skip_tone_ms as f64;
        if skip_tone {
            debug!("Wave latency {:.0}ms, skipping tone stage", latency);
        }
        WaveOrchestrator::new(&self.settings, self.tier)
            .with_region_words(words)
            .skip_tone(skip_tone)
    }
}
