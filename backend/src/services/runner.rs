//! # Processor Runner
//!
//! Generic lifecycle for the engine's polling loops.
//!
//! ## Lifecycle
//!
//! ```text
//! ProcessorHandle::start()
//!              ↓
//! spawn loop on a child CancellationToken
//!              ↓
//! ┌─► wait for next interval tick (or cancellation → exit)
//! │            ↓
//! │   take tick guard, run Processor::tick() in a span
//! │            ↓
//! └── record outcome in the status board
//!
//! ProcessorHandle::stop() → cancel token, await the task
//! ```
//!
//! Cancellation is only observed between ticks. A tick that has started
//! always runs to completion, so a stop never interrupts a half-finished
//! mint, transfer or order.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::errors::EngineError;
use crate::models::ProcessorStatus;

/// What caused a tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Trigger {
    /// The loop's own interval.
    Scheduled,
    /// An operator request through the control plane.
    Manual,
}

/// One reconciliation loop.
#[async_trait]
pub trait Processor: Send + Sync + 'static {
    /// Stable identifier used in logs and control plane paths.
    fn name(&self) -> &'static str;

    fn interval(&self) -> Duration;

    /// Run one reconciliation pass. The `Ok` value is a short summary.
    async fn tick(&self, trigger: Trigger) -> Result<String, EngineError>;

    /// Processor-specific status fields.
    fn details(&self) -> serde_json::Value;
}

#[derive(Debug, Default)]
struct StatusBoard {
    iterations: u64,
    last_run: Option<DateTime<Utc>>,
    last_action: Option<String>,
    last_error: Option<String>,
}

impl StatusBoard {
    fn record(&mut self, outcome: &Result<String, EngineError>) {
        self.iterations += 1;
        self.last_run = Some(Utc::now());
        match outcome {
            Ok(summary) => {
                self.last_action = Some(summary.clone());
                self.last_error = None;
            }
            Err(e) => {
                self.last_action = Some(format!("ERROR: {}", e));
                self.last_error = Some(format!("[{}] {}", e.category(), e));
            }
        }
    }
}

struct Shared {
    processor: Arc<dyn Processor>,
    board: Mutex<StatusBoard>,
    /// Serializes loop ticks with manual ticks.
    tick_guard: tokio::sync::Mutex<()>,
}

impl Shared {
    async fn execute(&self, trigger: Trigger) -> Result<String, EngineError> {
        let _guard = self.tick_guard.lock().await;
        let name = self.processor.name();
        let span = info_span!("tick", processor = name, run_id = %Uuid::new_v4());

        let outcome = self.processor.tick(trigger).instrument(span.clone()).await;

        span.in_scope(|| match &outcome {
            Ok(summary) => debug!("{}", summary),
            Err(e @ EngineError::SafetyRule(_)) => info!("⏸️  Skipped: {}", e),
            Err(e @ EngineError::Capability(_)) => debug!("Unavailable: {}", e),
            Err(e) => warn!("⚠️  Tick failed: {}", e),
        });

        self.board.lock().record(&outcome);
        outcome
    }
}

/// Owner of one processor and its background loop.
pub struct ProcessorHandle {
    shared: Arc<Shared>,
    /// Engine-wide token; each run gets a child of it.
    parent: CancellationToken,
    task: Mutex<Option<(CancellationToken, JoinHandle<()>)>>,
}

impl ProcessorHandle {
    pub fn new(processor: Arc<dyn Processor>, parent: CancellationToken) -> Self {
        Self {
            shared: Arc::new(Shared {
                processor,
                board: Mutex::new(StatusBoard::default()),
                tick_guard: tokio::sync::Mutex::new(()),
            }),
            parent,
            task: Mutex::new(None),
        }
    }

    pub fn name(&self) -> &'static str {
        self.shared.processor.name()
    }

    /// Whether the loop task is alive.
    pub fn is_running(&self) -> bool {
        self.task
            .lock()
            .as_ref()
            .map(|(_, handle)| !handle.is_finished())
            .unwrap_or(false)
    }

    /// Spawn the polling loop.
    ///
    /// ## Returns
    ///
    /// `false` if the loop was already running.
    pub fn start(&self) -> bool {
        let mut slot = self.task.lock();
        if let Some((_, handle)) = slot.as_ref() {
            if !handle.is_finished() {
                return false;
            }
        }

        let token = self.parent.child_token();
        let loop_token = token.clone();
        let shared = self.shared.clone();
        let period = shared.processor.interval();

        let handle = tokio::spawn(async move {
            info!(
                "▶️  {} started (every {}s)",
                shared.processor.name(),
                period.as_secs()
            );

            let mut ticker = interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = loop_token.cancelled() => break,
                    _ = ticker.tick() => {}
                }
                // Errors are recorded on the board, the loop keeps going
                let _ = shared.execute(Trigger::Scheduled).await;
            }

            info!("⏹️  {} stopped", shared.processor.name());
        });

        *slot = Some((token, handle));
        true
    }

    /// Cancel the loop and wait for the current tick to finish.
    ///
    /// ## Returns
    ///
    /// `false` if the loop was not running.
    pub async fn stop(&self) -> bool {
        let Some((token, handle)) = self.task.lock().take() else {
            return false;
        };
        token.cancel();
        if let Err(e) = handle.await {
            error!("{} loop task failed: {}", self.name(), e);
        }
        true
    }

    /// Run one tick now, outside the schedule.
    pub async fn run_once(&self) -> Result<String, EngineError> {
        self.shared.execute(Trigger::Manual).await
    }

    /// Record the outcome of an operation run outside `tick`.
    pub fn record(&self, outcome: &Result<String, EngineError>) {
        self.shared.board.lock().record(outcome);
    }

    pub fn status(&self) -> ProcessorStatus {
        let board = self.shared.board.lock();
        ProcessorStatus {
            name: self.name().to_string(),
            running: self.is_running(),
            iterations: board.iterations,
            interval_secs: self.shared.processor.interval().as_secs(),
            last_run: board.last_run,
            last_action: board.last_action.clone(),
            last_error: board.last_error.clone(),
            details: self.shared.processor.details(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU64, Ordering};

    struct Counter {
        ticks: AtomicU64,
        fail: bool,
    }

    #[async_trait]
    impl Processor for Counter {
        fn name(&self) -> &'static str {
            "counter"
        }

        fn interval(&self) -> Duration {
            Duration::from_millis(10)
        }

        async fn tick(&self, _trigger: Trigger) -> Result<String, EngineError> {
            let n = self.ticks.fetch_add(1, Ordering::SeqCst) + 1;
            if self.fail {
                Err(EngineError::Transient("gateway down".into()))
            } else {
                Ok(format!("tick {}", n))
            }
        }

        fn details(&self) -> serde_json::Value {
            serde_json::json!({ "ticks": self.ticks.load(Ordering::SeqCst) })
        }
    }

    #[tokio::test]
    async fn test_start_stop_lifecycle() {
        let counter = Arc::new(Counter { ticks: AtomicU64::new(0), fail: false });
        let handle = ProcessorHandle::new(counter.clone(), CancellationToken::new());

        assert!(handle.start());
        assert!(!handle.start());
        assert!(handle.is_running());

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(handle.stop().await);
        assert!(!handle.is_running());
        assert!(!handle.stop().await);

        let ticks = counter.ticks.load(Ordering::SeqCst);
        assert!(ticks >= 1);

        // No ticks after stop returned
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(counter.ticks.load(Ordering::SeqCst), ticks);

        let status = handle.status();
        assert_eq!(status.iterations, ticks);
        assert!(!status.running);
    }

    #[tokio::test]
    async fn test_failures_surface_in_status() {
        let counter = Arc::new(Counter { ticks: AtomicU64::new(0), fail: true });
        let handle = ProcessorHandle::new(counter, CancellationToken::new());

        let result = handle.run_once().await;
        assert!(matches!(result, Err(EngineError::Transient(_))));

        let status = handle.status();
        assert_eq!(status.iterations, 1);
        assert!(status.last_action.unwrap().starts_with("ERROR"));
        assert!(status.last_error.unwrap().starts_with("[transient]"));
    }

    #[tokio::test]
    async fn test_parent_cancellation_stops_loop() {
        let parent = CancellationToken::new();
        let counter = Arc::new(Counter { ticks: AtomicU64::new(0), fail: false });
        let handle = ProcessorHandle::new(counter, parent.clone());

        handle.start();
        parent.cancel();
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(!handle.is_running());
    }
}
