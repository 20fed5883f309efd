//! MindType: a caret-safe correction engine for live typing.
//!
//! Hosts push [`input::TypingEvent`] snapshots into a
//! [`streaming::Scheduler`]. While the user types, the diffusion controller
//! fixes words just behind the caret; on each pause a correction wave runs
//! the Noise, Context and Tone stages over the active region through a
//! [`generation::GenerationAdapter`]. Every wave can be rolled back as one
//! unit, and nothing is ever written at or after the caret.

pub mod cli;
pub mod confidence;
pub mod error;
pub mod generation;
pub mod input;
pub mod logging;
pub mod region;
pub mod settings;
pub mod streaming;
pub mod wave;

#[cfg(test)]
mod testing;

pub use error::{CorrectionError, Result};
pub use input::{SecurityGate, TypingEvent, TypingEventBus};
pub use settings::{CorrectionSettings, Preset, ToneTarget};
pub use streaming::{CorrectionObserver, Scheduler, SchedulerCommand, SchedulerStatus};

/// Parse the command line and run the demo host until stdin closes.
pub async fn run() -> anyhow::Result<()> {
    use clap::Parser;

    let args = cli::CliArgs::parse();
    if let Err(e) = logging::init_logging(args.debug) {
        eprintln!("Failed to install logger: {}", e);
    }
    cli::run(args).await
}
