//! Typing input boundary.
//!
//! The engine never captures input itself. Hosts push [`TypingEvent`]
//! snapshots through a [`TypingEventBus`] (or straight into the scheduler's
//! command channel) and report secure fields through a [`SecurityGate`].

use log::{debug, trace};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};

/// Full snapshot of the text field after a keystroke.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct TypingEvent {
    pub text: String,
    /// Byte offset of the caret in `text`.
    pub caret: usize,
    /// Milliseconds on the session clock.
    pub at_ms: u64,
}

impl TypingEvent {
    pub fn new(text: impl Into<String>, caret: usize, at_ms: u64) -> Self {
        Self {
            text: text.into(),
            caret,
            at_ms,
        }
    }

    /// Event with the caret at the end of `text`, stamped now.
    pub fn at_end(text: impl Into<String>) -> Self {
        let text = text.into();
        let caret = text.len();
        Self::new(text, caret, now_ms())
    }
}

/// Session clock in milliseconds.
pub fn now_ms() -> u64 {
    chrono::Utc::now().timestamp_millis().max(0) as u64
}

/// Tells the scheduler when it must not look at the text at all.
pub trait SecurityGate: Send + Sync {
    /// Password or otherwise sensitive field.
    fn is_secure(&self) -> bool;

    fn is_ime_composing(&self) -> bool;

    fn should_suspend(&self) -> bool {
        self.is_secure() || self.is_ime_composing()
    }
}

/// Gate for hosts without secure fields or IME.
#[derive(Debug, Clone, Copy, Default)]
pub struct OpenGate;

impl SecurityGate for OpenGate {
    fn is_secure(&self) -> bool {
        false
    }

    fn is_ime_composing(&self) -> bool {
        false
    }
}

type Listener = Arc<dyn Fn(&TypingEvent) + Send + Sync>;

/// Fan-out of typing events to any number of listeners.
#[derive(Default)]
pub struct TypingEventBus {
    listeners: Mutex<Vec<(u64, Listener)>>,
    next_id: AtomicU64,
}

/// Returned by [`TypingEventBus::on`]; call [`unsubscribe`](Self::unsubscribe)
/// to stop receiving events.
#[must_use = "the listener stays registered until unsubscribe is called"]
pub struct Unsubscribe {
    bus: Weak<TypingEventBus>,
    id: u64,
}

impl Unsubscribe {
    pub fn unsubscribe(self) {
        if let Some(bus) = self.bus.upgrade() {
            let mut listeners = bus.listeners.lock().unwrap_or_else(|e| e.into_inner());
            listeners.retain(|(id, _)| *id != self.id);
            debug!("Typing listener {} removed", self.id);
        }
    }
}

impl TypingEventBus {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn on<F>(self: &Arc<Self>, listener: F) -> Unsubscribe
    where
        F: Fn(&TypingEvent) + Send + Sync + 'static,
    {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.listeners
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push((id, Arc::new(listener)));
        Unsubscribe {
            bus: Arc::downgrade(self),
            id,
        }
    }

    pub fn emit(&self, event: &TypingEvent) {
        // Listeners run without the lock held so they may subscribe or
        // unsubscribe themselves.
        let listeners: Vec<Listener> = self
            .listeners
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .map(|(_, l)| l.clone())
            .collect();
        trace!("Emitting typing event to {} listener(s)", listeners.len());
        for listener in listeners {
            listener(event);
        }
    }

    pub fn listener_count(&self) -> usize {
        self.listeners
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .len()
    }
}
