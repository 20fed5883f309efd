//! Live correction while the user types: pause detection, word-by-word
//! diffusion behind the caret, and the scheduler that drives both.

pub mod diffusion;
pub mod observer;
pub mod pause_detector;
pub mod scheduler;

pub use diffusion::{
    DiffusionController, DiffusionPhase, DiffusionState, TickOutcome, MAX_CATCH_UP_ITERATIONS,
};
pub use observer::{CorrectionObserver, NoopObserver, SchedulerStatus};
pub use pause_detector::{AdaptiveDebounce, BurstState, PauseDetector};
pub use scheduler::{Scheduler, SchedulerCommand, WaveJob, WaveResult};
