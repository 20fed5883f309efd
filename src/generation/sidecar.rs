//! Generation adapter backed by a local model sidecar process.
//!
//! The model runs in a separate process and streams over JSON lines on
//! stdin/stdout. Nothing here touches the network.

use async_trait::async_trait;
use futures_util::stream;
use log::{debug, error, info, warn};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Lines};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tokio_util::sync::CancellationToken;

use super::guard::{guarded, StreamGuard};
use super::{
    prompts, Capabilities, ChunkStream, DeviceTier, DeviceTierPolicy, GenerationAdapter,
    GenerationStats, InitOptions, StreamParams,
};
use crate::error::{CorrectionError, Result};

/// Debug output lines tolerated between two protocol messages.
const MAX_SKIPPED_LINES: usize = 64;

const READY_TIMEOUT: Duration = Duration::from_secs(30);
const LOAD_TIMEOUT: Duration = Duration::from_secs(120);
const LOCK_TIMEOUT: Duration = Duration::from_secs(2);

/// Request types sent to the sidecar
#[derive(Debug, Serialize)]
#[serde(tag = "type", rename_all = "lowercase")]
enum SidecarRequest {
    Load {
        model_path: String,
    },
    Stream {
        system_prompt: String,
        user_message: String,
        max_tokens: u32,
    },
    Abort,
}

/// Response types from the sidecar
#[derive(Debug, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "lowercase")]
enum SidecarResponse {
    Ready {
        #[serde(default)]
        backend: Option<String>,
    },
    Ok {
        #[serde(default)]
        message: String,
    },
    Chunk {
        text: String,
    },
    Done,
    Error {
        message: String,
    },
}

/// Parse one stdout line. `Ok(None)` means the line is not a protocol
/// message (model runtimes print debug output) and should be skipped.
fn parse_line(line: &str) -> Result<Option<SidecarResponse>> {
    let trimmed = line.trim();
    if trimmed.is_empty() {
        return Ok(None);
    }
    match serde_json::from_str::<SidecarResponse>(trimmed) {
        Ok(response) => Ok(Some(response)),
        Err(e) => {
            if !trimmed.starts_with('{') {
                debug!("Skipping non-JSON sidecar output: {}", trimmed);
                return Ok(None);
            }
            Err(CorrectionError::Generation(format!(
                "Invalid sidecar response: {}",
                e
            )))
        }
    }
}

struct SidecarProcess {
    child: Child,
    stdin: ChildStdin,
    stdout: Lines<BufReader<ChildStdout>>,
    /// A stream request was sent and its `done` has not been read yet.
    busy: bool,
    backend: Option<DeviceTier>,
}

impl SidecarProcess {
    async fn spawn(program: &Path, args: &[String]) -> Result<Self> {
        info!("Spawning generation sidecar from: {:?}", program);

        let mut child = Command::new(program)
            .args(args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .env("LLAMA_LOG_DISABLE", "1")
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                CorrectionError::AdapterUnavailable(format!("Failed to spawn sidecar: {}", e))
            })?;

        let stdin = child.stdin.take().ok_or_else(|| {
            CorrectionError::AdapterUnavailable("Sidecar stdin not available".into())
        })?;
        let stdout = child.stdout.take().ok_or_else(|| {
            CorrectionError::AdapterUnavailable("Sidecar stdout not available".into())
        })?;

        let mut process = Self {
            child,
            stdin,
            stdout: BufReader::new(stdout).lines(),
            busy: false,
            backend: None,
        };

        let ready = tokio::time::timeout(READY_TIMEOUT, process.next_response()).await;
        match ready {
            Ok(Ok(Some(SidecarResponse::Ready { backend }))) => {
                process.backend = backend.and_then(|b| b.parse().ok());
                info!("Sidecar ready (backend: {:?})", process.backend);
                Ok(process)
            }
            Ok(Ok(Some(SidecarResponse::Error { message }))) => Err(
                CorrectionError::AdapterUnavailable(format!("Sidecar failed to start: {}", message)),
            ),
            Ok(Ok(Some(other))) => Err(CorrectionError::AdapterUnavailable(format!(
                "Unexpected response from sidecar: {:?}",
                other
            ))),
            Ok(Ok(None)) => Err(CorrectionError::AdapterUnavailable(
                "Sidecar exited before becoming ready".into(),
            )),
            Ok(Err(e)) => Err(CorrectionError::AdapterUnavailable(e.to_string())),
            Err(_) => Err(CorrectionError::AdapterUnavailable(format!(
                "Sidecar not ready after {}s",
                READY_TIMEOUT.as_secs()
            ))),
        }
    }

    async fn send(&mut self, request: &SidecarRequest) -> Result<()> {
        let mut json = serde_json::to_string(request)?;
        json.push('\n');
        self.stdin.write_all(json.as_bytes()).await?;
        self.stdin.flush().await?;
        Ok(())
    }

    /// Next protocol message, or `None` once stdout is closed.
    async fn next_response(&mut self) -> Result<Option<SidecarResponse>> {
        for _ in 0..MAX_SKIPPED_LINES {
            let Some(line) = self.stdout.next_line().await? else {
                return Ok(None);
            };
            if let Some(response) = parse_line(&line)? {
                return Ok(Some(response));
            }
        }
        Err(CorrectionError::Generation(
            "Too many non-JSON lines from sidecar, giving up".into(),
        ))
    }

    fn is_alive(&mut self) -> bool {
        matches!(self.child.try_wait(), Ok(None))
    }

    /// Abort an unfinished request and discard its remaining output.
    async fn drain_pending(&mut self, wait: Duration) -> Result<()> {
        if !self.busy {
            return Ok(());
        }
        debug!("Draining unfinished sidecar request");
        self.send(&SidecarRequest::Abort).await?;

        match tokio::time::timeout(wait, self.read_until_done()).await {
            Ok(result) => result?,
            Err(_) => warn!(
                "Sidecar did not acknowledge abort within {}ms",
                wait.as_millis()
            ),
        }
        self.busy = false;
        Ok(())
    }

    async fn read_until_done(&mut self) -> Result<()> {
        loop {
            match self.next_response().await? {
                Some(SidecarResponse::Done) | Some(SidecarResponse::Error { .. }) => return Ok(()),
                Some(_) => continue,
                None => {
                    return Err(CorrectionError::AdapterUnavailable(
                        "Sidecar exited while aborting".into(),
                    ))
                }
            }
        }
    }

    async fn load_model(&mut self, model_path: &Path) -> Result<()> {
        self.send(&SidecarRequest::Load {
            model_path: model_path.to_string_lossy().into_owned(),
        })
        .await?;

        let response = tokio::time::timeout(LOAD_TIMEOUT, self.next_response())
            .await
            .map_err(|_| CorrectionError::AdapterUnavailable("Model load timed out".into()))??;
        match response {
            Some(SidecarResponse::Ok { message }) => {
                debug!("Model loaded: {}", message);
                Ok(())
            }
            Some(SidecarResponse::Ready { .. }) => Ok(()),
            Some(SidecarResponse::Error { message }) => {
                Err(CorrectionError::AdapterUnavailable(message))
            }
            Some(other) => Err(CorrectionError::AdapterUnavailable(format!(
                "Unexpected response from sidecar: {:?}",
                other
            ))),
            None => Err(CorrectionError::AdapterUnavailable(
                "Sidecar exited while loading model".into(),
            )),
        }
    }
}

type ProcessSlot = Arc<tokio::sync::Mutex<Option<SidecarProcess>>>;

/// Streams corrections from a local sidecar process.
pub struct SidecarAdapter {
    program: PathBuf,
    args: Vec<String>,
    process: ProcessSlot,
    /// Remembered so a crashed sidecar can be respawned with the same model
    model_path: Mutex<Option<PathBuf>>,
    guard: StreamGuard,
    default_tier: DeviceTier,
    abort_ack_timeout: Duration,
}

impl SidecarAdapter {
    pub fn new(program: impl Into<PathBuf>, abort_ack_timeout: Duration) -> Self {
        Self::with_args(program, Vec::new(), abort_ack_timeout)
    }

    pub fn with_args(
        program: impl Into<PathBuf>,
        args: Vec<String>,
        abort_ack_timeout: Duration,
    ) -> Self {
        Self {
            program: program.into(),
            args,
            process: Arc::new(tokio::sync::Mutex::new(None)),
            model_path: Mutex::new(None),
            guard: StreamGuard::new(abort_ack_timeout),
            default_tier: DeviceTier::Cpu,
            abort_ack_timeout,
        }
    }

    /// Tier to report when the sidecar does not announce its backend.
    pub fn with_default_tier(mut self, tier: DeviceTier) -> Self {
        self.default_tier = tier;
        self
    }

    fn remembered_model(&self) -> Option<PathBuf> {
        self.model_path
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// Spawn the sidecar if it is missing or has crashed, reloading the
    /// remembered model after a crash.
    async fn ensure_process(&self, slot: &mut Option<SidecarProcess>) -> Result<()> {
        let was_running = slot.is_some();
        let alive = slot.as_mut().map(|p| p.is_alive()).unwrap_or(false);
        if alive {
            return Ok(());
        }
        if was_running {
            warn!("Generation sidecar exited, respawning");
        }
        *slot = None;

        let mut process = SidecarProcess::spawn(&self.program, &self.args).await?;
        if let Some(model_path) = self.remembered_model() {
            if was_running {
                info!("Reloading model after crash: {:?}", model_path);
            }
            process.load_model(&model_path).await?;
        }
        *slot = Some(process);
        Ok(())
    }
}

#[async_trait]
impl GenerationAdapter for SidecarAdapter {
    async fn init(&self, opts: &InitOptions) -> Result<Capabilities> {
        if let Some(path) = &opts.model_path {
            if !path.exists() {
                let err = format!("Model file does not exist: {:?}", path);
                error!("{}", err);
                return Err(CorrectionError::AdapterUnavailable(err));
            }
        }

        let mut slot = self.process.lock().await;
        self.ensure_process(&mut slot).await?;
        let process = slot
            .as_mut()
            .ok_or_else(|| CorrectionError::AdapterUnavailable("Sidecar not available".into()))?;

        if let Some(path) = &opts.model_path {
            process.load_model(path).await?;
            *self.model_path.lock().unwrap_or_else(|e| e.into_inner()) = Some(path.clone());
        }

        let tier = process.backend.unwrap_or(self.default_tier);
        let caps = Capabilities {
            tier,
            max_tokens: DeviceTierPolicy::for_tier(tier).token_cap,
            model: opts
                .model_path
                .as_ref()
                .map(|p| p.to_string_lossy().into_owned()),
        };
        info!("Sidecar adapter initialized: {:?}", caps);
        Ok(caps)
    }

    async fn stream(&self, params: StreamParams, cancel: CancellationToken) -> Result<ChunkStream> {
        let lease = self.guard.begin(&cancel).await;

        let mut slot = tokio::time::timeout(LOCK_TIMEOUT, self.process.clone().lock_owned())
            .await
            .map_err(|_| {
                CorrectionError::Generation("Sidecar still busy with a previous stream".into())
            })?;
        self.ensure_process(&mut slot).await?;
        let process = slot
            .as_mut()
            .ok_or_else(|| CorrectionError::AdapterUnavailable("Sidecar not available".into()))?;

        process.drain_pending(self.abort_ack_timeout).await?;
        process
            .send(&SidecarRequest::Stream {
                system_prompt: prompts::system_prompt(&params.settings),
                user_message: prompts::user_message(&params),
                max_tokens: params.settings.max_tokens(),
            })
            .await?;
        process.busy = true;
        debug!(
            "Sidecar stream {} started for {} stage",
            lease.id(),
            params.settings.stage()
        );

        let chunks = stream::unfold(Some(slot), |state| async move {
            let mut slot = state?;
            let process = slot.as_mut()?;
            loop {
                match process.next_response().await {
                    Ok(Some(SidecarResponse::Chunk { text })) => return Some((Ok(text), Some(slot))),
                    Ok(Some(SidecarResponse::Done)) => {
                        process.busy = false;
                        return None;
                    }
                    Ok(Some(SidecarResponse::Error { message })) => {
                        process.busy = false;
                        return Some((Err(CorrectionError::Generation(message)), None));
                    }
                    Ok(Some(other)) => {
                        debug!("Ignoring sidecar message mid-stream: {:?}", other);
                    }
                    Ok(None) => {
                        return Some((
                            Err(CorrectionError::AdapterUnavailable(
                                "Sidecar exited mid-stream".into(),
                            )),
                            None,
                        ))
                    }
                    Err(e) => return Some((Err(e), None)),
                }
            }
        });

        Ok(guarded(chunks, lease))
    }

    fn abort(&self) {
        self.guard.abort();
    }

    fn stats(&self) -> GenerationStats {
        self.guard.stats()
    }

    fn name(&self) -> &str {
        "sidecar"
    }
}
