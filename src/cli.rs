use anyhow::Context;
use clap::Parser;
use log::{debug, info, warn};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};

use crate::generation::{GenerationAdapter, InitOptions, SidecarAdapter};
use crate::input::{now_ms, OpenGate, TypingEvent};
use crate::region::ActiveRegion;
use crate::settings::{get_default_settings, load_or_create_settings, Preset, ToneTarget};
use crate::streaming::{CorrectionObserver, Scheduler, SchedulerStatus};
use crate::wave::CorrectionWave;

/// Simulated gap between typed words, short enough to count as a burst.
const WORD_GAP_MS: u64 = 120;

/// Simulated quiet time after each line, longer than any debounce.
const LINE_PAUSE_MS: u64 = 2_500;

#[derive(Parser, Debug, Clone, Default)]
#[command(name = "mindtype", about = "MindType - caret-safe text correction")]
pub struct CliArgs {
    /// Generation sidecar executable
    #[arg(long)]
    pub sidecar: Option<PathBuf>,

    /// Model file for the sidecar to load
    #[arg(long)]
    pub model: Option<PathBuf>,

    /// Settings JSON file, created with defaults if missing
    #[arg(long)]
    pub settings: Option<PathBuf>,

    /// Tone target (none, casual, professional, friendly, concise)
    #[arg(long)]
    pub tone: Option<ToneTarget>,

    /// Validation preset (strict, balanced, lenient)
    #[arg(long)]
    pub preset: Option<Preset>,

    /// Enable debug mode with verbose logging
    #[arg(long)]
    pub debug: bool,
}

/// Logs what the engine reports.
struct ConsoleObserver;

impl CorrectionObserver for ConsoleObserver {
    fn on_status(&self, status: SchedulerStatus) {
        debug!("[{}]", status.as_str());
    }

    fn on_active_region(&self, region: ActiveRegion) {
        debug!("Active region {}..{}", region.start, region.end);
    }

    fn on_wave_complete(&self, wave: &CorrectionWave) {
        info!("Wave {} applied {} correction(s)", wave.id, wave.diffs.len());
    }

    fn on_rollback(&self, wave: &CorrectionWave, _text: &str) {
        info!("Wave {} rolled back", wave.id);
    }

    fn on_unavailable(&self, reason: &str) {
        warn!("Corrections unavailable: {}", reason);
    }
}

/// Drives a scheduler from whole lines of input, on a simulated clock.
pub struct DemoSession {
    scheduler: Scheduler,
    clock_ms: u64,
}

impl DemoSession {
    pub fn new(scheduler: Scheduler) -> Self {
        Self {
            scheduler,
            clock_ms: now_ms(),
        }
    }

    pub fn scheduler(&self) -> &Scheduler {
        &self.scheduler
    }

    /// Handle one input line and return what to print.
    pub async fn feed_line(&mut self, line: &str) -> String {
        let line = line.trim_end_matches(['\r', '\n']);
        if line.trim() == ":undo" {
            if self.scheduler.rollback_last_wave().is_none() {
                debug!("Nothing to undo");
            }
            return self.render();
        }
        if line.trim().is_empty() {
            return self.render();
        }

        let mut buffer = self.scheduler.text().to_string();
        for word in line.split_whitespace() {
            if !buffer.is_empty() && !buffer.ends_with(char::is_whitespace) {
                buffer.push(' ');
            }
            buffer.push_str(word);
            self.clock_ms += WORD_GAP_MS;
            self.scheduler
                .handle_typing(TypingEvent::new(buffer.clone(), buffer.len(), self.clock_ms));
            self.scheduler.tick(self.clock_ms).await;
            // Ticks may have corrected earlier words.
            buffer = self.scheduler.text().to_string();
        }

        self.clock_ms += LINE_PAUSE_MS;
        if self.scheduler.poll_pause(self.clock_ms) {
            self.scheduler.run_pause(self.clock_ms).await;
        }
        self.render()
    }

    fn render(&self) -> String {
        match self.scheduler.status() {
            SchedulerStatus::Unavailable => {
                format!("[{}] {}", SchedulerStatus::Unavailable.as_str(), self.scheduler.text())
            }
            _ => self.scheduler.text().to_string(),
        }
    }
}

/// Run the interactive demo on stdin/stdout.
pub async fn run(args: CliArgs) -> anyhow::Result<()> {
    let mut settings = match &args.settings {
        Some(path) => load_or_create_settings(path)
            .with_context(|| format!("Failed to load settings from {:?}", path))?,
        None => get_default_settings(),
    };
    if let Some(preset) = args.preset {
        settings.apply_preset(preset);
    }
    if let Some(tone) = args.tone {
        settings.set_tone_target(tone);
    }
    let abort_ack = Duration::from_millis(settings.abort_ack_timeout_ms);

    let mut scheduler = Scheduler::new(settings, Arc::new(ConsoleObserver), Arc::new(OpenGate));
    match &args.sidecar {
        Some(program) => {
            let adapter: Arc<dyn GenerationAdapter> = Arc::new(SidecarAdapter::new(program, abort_ack));
            let opts = InitOptions {
                model_path: args.model.clone(),
            };
            scheduler.attach_adapter(adapter, &opts).await;
        }
        None => info!("No sidecar given, running without corrections"),
    }
    if scheduler.status() == SchedulerStatus::Unavailable {
        println!("[{}]", SchedulerStatus::Unavailable.as_str());
    }

    let mut session = DemoSession::new(scheduler);
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines
        .next_line()
        .await
        .context("Failed to read from stdin")?
    {
        println!("{}", session.feed_line(&line).await);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::settings::CorrectionSettings;
    use crate::testing::ScriptedAdapter;

    fn session(adapter: Option<Arc<dyn GenerationAdapter>>) -> DemoSession {
        let mut scheduler = Scheduler::new(
            CorrectionSettings::default(),
            Arc::new(ConsoleObserver),
            Arc::new(OpenGate),
        );
        scheduler.set_adapter(adapter);
        DemoSession::new(scheduler)
    }

    #[test]
    fn parses_all_flags() {
        let args = CliArgs::parse_from([
            "mindtype",
            "--sidecar",
            "/opt/sidecar",
            "--model",
            "model.gguf",
            "--tone",
            "casual",
            "--preset",
            "strict",
            "--debug",
        ]);
        assert_eq!(args.sidecar, Some(PathBuf::from("/opt/sidecar")));
        assert_eq!(args.model, Some(PathBuf::from("model.gguf")));
        assert_eq!(args.tone, Some(ToneTarget::Casual));
        assert_eq!(args.preset, Some(Preset::Strict));
        assert!(args.debug);
        assert!(args.settings.is_none());
    }

    #[test]
    fn rejects_unknown_tone() {
        assert!(CliArgs::try_parse_from(["mindtype", "--tone", "sarcastic"]).is_err());
    }

    #[tokio::test]
    async fn without_adapter_text_is_echoed_as_unavailable() {
        let mut session = session(None);
        let out = session.feed_line("I was writting a lettr").await;
        assert_eq!(out, "[corrections unavailable] I was writting a lettr");

        let out = session.feed_line("to you").await;
        assert_eq!(out, "[corrections unavailable] I was writting a lettr to you");
    }

    #[tokio::test]
    async fn lines_accumulate_and_undo_without_waves_is_harmless() {
        let adapter = Arc::new(ScriptedAdapter::new());
        let mut session = session(Some(adapter.clone() as Arc<dyn GenerationAdapter>));

        assert_eq!(session.feed_line("hello there my friend").await, "hello there my friend");
        assert_eq!(session.feed_line(":undo").await, "hello there my friend");
        assert_eq!(
            session.feed_line("how are you").await,
            "hello there my friend how are you"
        );
        assert!(!adapter.requests().is_empty());
        assert_ne!(session.scheduler().status(), SchedulerStatus::Unavailable);
    }
}
