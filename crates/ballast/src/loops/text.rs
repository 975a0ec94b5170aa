//! Timer-driven loop detection over streamed model text.
//!
//! One [`TextLoopDetector`] watches one stream (thinking or response). The
//! host appends chunks as they arrive; the detector checks the accumulated
//! text on a timer and fires its callback at most once per session.
//!
//! ```text
//!          first non-blank chunk             pattern match
//!   Idle ─────────────────────────▶ Monitoring ─────────────▶ Detected
//!    ▲                                  │                        │
//!    └──────────── stop() / reset() ◀───┴────────────────────────┘
//! ```
//!
//! The first check runs `warmup_period` after monitoring starts, then every
//! `check_interval` until a pattern matches or the detector is stopped.
//! Timers run on the ambient tokio runtime, so chunks must be appended from
//! within one.

use super::patterns::{LoopDetection, LoopPattern, builtin_patterns, evaluate_patterns};
use crate::config::TextLoopConfig;
use crate::events::{EventHandler, GuardEvent, NoopHandler, emit};
use serde::Serialize;
use std::sync::{Arc, Mutex};
use tokio::task::AbortHandle;
use tracing::{debug, info, warn};

/// Which stream a detector watches.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum StreamKind {
    Thinking,
    Response,
}

/// Lifecycle of a detector.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DetectorState {
    Idle,
    Monitoring,
    Detected,
}

/// Invoked once when a loop is confirmed.
pub type LoopCallback = Arc<dyn Fn(LoopDetection) + Send + Sync>;

/// Fixed at construction; shared with the timer task.
struct Shared {
    kind: StreamKind,
    config: TextLoopConfig,
    patterns: Vec<Box<dyn LoopPattern>>,
    callback: Option<LoopCallback>,
    handler: Arc<dyn EventHandler>,
}

struct Session {
    state: DetectorState,
    text: String,
    /// Bumped on every arm/stop so a timer from an old session never fires.
    generation: u64,
    timer: Option<AbortHandle>,
}

/// Watches one text stream for repetitive reasoning.
///
/// # Example
///
/// ```ignore
/// let detector = TextLoopDetector::new(StreamKind::Thinking, config.text_loops.clone())
///     .with_callback(move |detection| {
///         tracing::warn!("{}: {}", detection.pattern_name, detection.reason);
///         abort.notify_one();
///     });
///
/// while let Some(chunk) = stream.next().await {
///     detector.append(&chunk);
/// }
/// detector.stop();
/// ```
pub struct TextLoopDetector {
    shared: Arc<Shared>,
    session: Arc<Mutex<Session>>,
}

impl TextLoopDetector {
    /// A detector running the built-in patterns.
    pub fn new(kind: StreamKind, config: TextLoopConfig) -> Self {
        let patterns = builtin_patterns(&config);
        Self {
            shared: Arc::new(Shared {
                kind,
                config,
                patterns,
                callback: None,
                handler: Arc::new(NoopHandler),
            }),
            session: Arc::new(Mutex::new(Session {
                state: DetectorState::Idle,
                text: String::new(),
                generation: 0,
                timer: None,
            })),
        }
    }

    /// Set the callback invoked when a loop is confirmed.
    pub fn with_callback(self, callback: impl Fn(LoopDetection) + Send + Sync + 'static) -> Self {
        self.configure(|shared| shared.callback = Some(Arc::new(callback)))
    }

    /// Also emit a `loop-detected` event on confirmation.
    pub fn with_event_handler(self, handler: Arc<dyn EventHandler>) -> Self {
        self.configure(|shared| shared.handler = handler)
    }

    /// Register an additional pattern. Patterns run by ascending priority;
    /// ties keep registration order, so built-ins run before custom patterns
    /// of equal priority.
    pub fn with_pattern(self, pattern: impl LoopPattern + 'static) -> Self {
        self.configure(|shared| {
            shared.patterns.push(Box::new(pattern));
            shared.patterns.sort_by_key(|p| p.priority());
        })
    }

    fn configure(mut self, f: impl FnOnce(&mut Shared)) -> Self {
        match Arc::get_mut(&mut self.shared) {
            Some(shared) => f(shared),
            None => warn!("text loop detector is already monitoring; configuration ignored"),
        }
        self
    }

    pub fn kind(&self) -> StreamKind {
        self.shared.kind
    }

    pub fn state(&self) -> DetectorState {
        self.lock().state
    }

    /// Bytes of text accumulated in the current (or last stopped) session.
    pub fn accumulated_len(&self) -> usize {
        self.lock().text.len()
    }

    /// Feed a streamed chunk.
    ///
    /// While idle, blank chunks are dropped and the first non-blank chunk
    /// starts a new session. After detection, text is still accumulated but
    /// no further checks run until [`reset()`](Self::reset).
    pub fn append(&self, chunk: &str) {
        let mut session = self.lock();
        match session.state {
            DetectorState::Idle => {
                if chunk.trim().is_empty() {
                    return;
                }
                session.text.clear();
                session.text.push_str(chunk);
                session.state = DetectorState::Monitoring;
                self.arm(&mut session);
                debug!("{:?} loop monitoring started", self.shared.kind);
            }
            DetectorState::Monitoring | DetectorState::Detected => session.text.push_str(chunk),
        }
    }

    /// Cancel pending checks and return to idle without firing. The
    /// accumulated text is kept until the next session starts. Safe to call
    /// any number of times.
    pub fn stop(&self) {
        let mut session = self.lock();
        Self::disarm(&mut session);
        session.state = DetectorState::Idle;
    }

    /// [`stop()`](Self::stop) and discard the accumulated text.
    pub fn reset(&self) {
        let mut session = self.lock();
        Self::disarm(&mut session);
        session.state = DetectorState::Idle;
        session.text.clear();
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Session> {
        self.session.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn disarm(session: &mut Session) {
        session.generation += 1;
        if let Some(timer) = session.timer.take() {
            timer.abort();
        }
    }

    fn arm(&self, session: &mut Session) {
        Self::disarm(session);
        let generation = session.generation;
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            warn!("no tokio runtime; text loop checks will not run");
            return;
        };

        let shared = self.shared.clone();
        let state = self.session.clone();
        let task = runtime.spawn(async move {
            tokio::time::sleep(shared.config.warmup_period()).await;
            while check(&shared, &state, generation) {
                tokio::time::sleep(shared.config.check_interval()).await;
            }
        });
        session.timer = Some(task.abort_handle());
    }
}

impl Drop for TextLoopDetector {
    fn drop(&mut self) {
        Self::disarm(&mut self.lock());
    }
}

/// One scheduled check. Returns whether the timer should keep going.
fn check(shared: &Shared, session: &Mutex<Session>, generation: u64) -> bool {
    let text = {
        let s = session.lock().unwrap_or_else(|e| e.into_inner());
        if s.generation != generation || s.state != DetectorState::Monitoring {
            return false;
        }
        s.text.clone()
    };

    let Some(detection) = evaluate_patterns(&shared.patterns, &text) else {
        return true;
    };

    {
        let mut s = session.lock().unwrap_or_else(|e| e.into_inner());
        if s.generation != generation || s.state != DetectorState::Monitoring {
            return false;
        }
        s.state = DetectorState::Detected;
        s.timer = None;
    }

    info!(
        "{:?} loop detected by {}: {}",
        shared.kind, detection.pattern_name, detection.reason
    );
    emit(
        shared.handler.as_ref(),
        GuardEvent::LoopDetected {
            stream: shared.kind,
            pattern_name: detection.pattern_name.clone(),
            reason: detection.reason.clone(),
            match_count: detection.match_count,
        },
    );
    if let Some(callback) = &shared.callback {
        callback(detection);
    }
    false
}
