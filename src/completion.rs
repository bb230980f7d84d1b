//! Single-assignment outcome of one pipeline run.

use crate::error::{Result, StreamError};
use crate::metrics::{MetricsSnapshot, StageMetrics};
use crate::protocol::{Subscription, Value};
use parking_lot::{Condvar, Mutex};
use std::any::Any;
use std::fmt;
use std::marker::PhantomData;
use std::sync::{Arc, OnceLock};
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// Lifecycle of one run
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunState {
    /// Executors are being instantiated and linked
    Built,
    Running,
    Completed,
    Failed,
    /// The consumer cancelled before the stream terminated
    Cancelled,
}

impl RunState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            RunState::Completed | RunState::Failed | RunState::Cancelled
        )
    }
}

/// Shared state behind a [`PipelineResult`]; written by the terminal stage
pub(crate) struct RunCell {
    id: u64,
    outcome: OnceLock<Result<Value>>,
    state: Mutex<RunState>,
    ready: Condvar,
    canceller: Mutex<Option<Arc<dyn Subscription>>>,
    metrics: Mutex<Vec<StageMetrics>>,
}

impl RunCell {
    pub(crate) fn new(id: u64) -> Arc<Self> {
        Arc::new(Self {
            id,
            outcome: OnceLock::new(),
            state: Mutex::new(RunState::Built),
            ready: Condvar::new(),
            canceller: Mutex::new(None),
            metrics: Mutex::new(Vec::new()),
        })
    }

    pub(crate) fn id(&self) -> u64 {
        self.id
    }

    /// Move from `Built` to `Running`; no-op once the run has moved on
    pub(crate) fn start(&self) {
        let mut state = self.state.lock();
        if *state == RunState::Built {
            *state = RunState::Running;
        }
    }

    pub(crate) fn state(&self) -> RunState {
        *self.state.lock()
    }

    pub(crate) fn register_metrics(&self, metrics: StageMetrics) {
        self.metrics.lock().push(metrics);
    }

    /// Install the handle used by [`RunCell::cancel`]
    ///
    /// The state is read under the canceller lock, so a concurrent `cancel`
    /// either finds the handle or the handle sees the terminal state.
    pub(crate) fn set_canceller(&self, subscription: Arc<dyn Subscription>) {
        let mut canceller = self.canceller.lock();
        if !self.state().is_terminal() {
            *canceller = Some(subscription);
            return;
        }
        drop(canceller);
        subscription.cancel();
    }

    /// Store the outcome. Only the first call has any effect.
    pub(crate) fn resolve(&self, outcome: Result<Value>) -> bool {
        let next = if outcome.is_ok() {
            RunState::Completed
        } else {
            RunState::Failed
        };
        if !self.settle(next, outcome) {
            return false;
        }
        self.canceller.lock().take();
        true
    }

    /// Cancel a run that has not terminated yet
    pub(crate) fn cancel(&self) -> bool {
        if !self.settle(RunState::Cancelled, Err(StreamError::Cancelled)) {
            return false;
        }
        let canceller = self.canceller.lock().take();
        if let Some(subscription) = canceller {
            subscription.cancel();
        }
        true
    }

    fn settle(&self, next: RunState, outcome: Result<Value>) -> bool {
        let mut state = self.state.lock();
        if state.is_terminal() {
            if let Err(error) = &outcome {
                warn!(run = self.id, %error, "discarding signal for an already terminated run");
            }
            return false;
        }
        if self.outcome.set(outcome).is_err() {
            return false;
        }
        *state = next;
        debug!(run = self.id, state = ?next, "run terminated");
        self.ready.notify_all();
        true
    }

    pub(crate) fn try_get(&self) -> Option<&Result<Value>> {
        self.outcome.get()
    }

    pub(crate) fn wait(&self) -> &Result<Value> {
        let mut state = self.state.lock();
        loop {
            if let Some(outcome) = self.outcome.get() {
                return outcome;
            }
            self.ready.wait(&mut state);
        }
    }

    pub(crate) fn wait_timeout(&self, timeout: Duration) -> Option<&Result<Value>> {
        let deadline = Instant::now() + timeout;
        let mut state = self.state.lock();
        loop {
            if let Some(outcome) = self.outcome.get() {
                return Some(outcome);
            }
            if self.ready.wait_until(&mut state, deadline).timed_out() {
                return self.outcome.get();
            }
        }
    }
}

/// Deferred outcome of running a closed graph once
///
/// Observing the result never consumes it: every call to [`wait`] after
/// termination returns the same value or the same error.
///
/// [`wait`]: PipelineResult::wait
pub struct PipelineResult<R> {
    cell: Arc<RunCell>,
    _marker: PhantomData<fn() -> R>,
}

impl<R> Clone for PipelineResult<R> {
    fn clone(&self) -> Self {
        Self {
            cell: Arc::clone(&self.cell),
            _marker: PhantomData,
        }
    }
}

impl<R> fmt::Debug for PipelineResult<R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PipelineResult")
            .field("run", &self.cell.id())
            .field("state", &self.cell.state())
            .finish()
    }
}

impl<R: Any> PipelineResult<R> {
    pub(crate) fn new(cell: Arc<RunCell>) -> Self {
        Self {
            cell,
            _marker: PhantomData,
        }
    }

    fn view(outcome: &Result<Value>) -> Result<&R> {
        match outcome {
            Ok(value) => value
                .downcast_ref::<R>()
                .ok_or_else(StreamError::type_mismatch::<R>),
            Err(error) => Err(error.clone()),
        }
    }

    /// Block until the run terminates
    pub fn wait(&self) -> Result<&R> {
        Self::view(self.cell.wait())
    }

    /// Block until the run terminates or `timeout` elapses
    pub fn wait_timeout(&self, timeout: Duration) -> Option<Result<&R>> {
        self.cell.wait_timeout(timeout).map(Self::view)
    }

    /// The outcome, if the run has already terminated
    pub fn try_get(&self) -> Option<Result<&R>> {
        self.cell.try_get().map(Self::view)
    }

    pub fn is_done(&self) -> bool {
        self.cell.try_get().is_some()
    }

    pub fn state(&self) -> RunState {
        self.cell.state()
    }

    /// Cancel the run; returns `false` if it had already terminated
    pub fn cancel(&self) -> bool {
        self.cell.cancel()
    }

    /// Per-stage counters, source first
    pub fn metrics(&self) -> Vec<MetricsSnapshot> {
        self.cell
            .metrics
            .lock()
            .iter()
            .map(StageMetrics::snapshot)
            .collect()
    }

    /// Get a summary of all stage metrics
    pub fn metrics_summary(&self) -> String {
        let mut summary = format!("Run {} Metrics Summary:\n", self.cell.id());
        for (i, snapshot) in self.metrics().iter().enumerate() {
            summary.push_str(&format!("  Stage {}: {}\n", i, snapshot.format()));
        }
        summary
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::thread;

    struct Flag(AtomicBool);

    impl Subscription for Flag {
        fn request(&self, _n: u64) {}

        fn cancel(&self) {
            self.0.store(true, Ordering::SeqCst);
        }
    }

    #[test]
    fn test_first_outcome_wins() {
        let cell = RunCell::new(1);
        cell.start();
        assert!(cell.resolve(Ok(Box::new(5u32))));
        assert!(!cell.resolve(Err(StreamError::EmptyStream)));

        let result = PipelineResult::<u32>::new(cell);
        assert_eq!(result.wait().unwrap(), &5);
        assert_eq!(result.wait().unwrap(), &5);
        assert_eq!(result.state(), RunState::Completed);
    }

    #[test]
    fn test_cancel_racing_set_canceller_always_reaches_handle() {
        for id in 0..200 {
            let cell = RunCell::new(id);
            cell.start();
            let flag = Arc::new(Flag(AtomicBool::new(false)));

            let installer = {
                let cell = Arc::clone(&cell);
                let flag = Arc::clone(&flag);
                thread::spawn(move || cell.set_canceller(flag))
            };
            assert!(cell.cancel());
            installer.join().unwrap();

            assert!(flag.0.load(Ordering::SeqCst), "run {id} lost its cancel");
        }
    }

    #[test]
    fn test_cancel_before_termination() {
        let cell = RunCell::new(2);
        cell.start();
        let flag = Arc::new(Flag(AtomicBool::new(false)));
        cell.set_canceller(flag.clone());

        let result = PipelineResult::<u32>::new(Arc::clone(&cell));
        assert!(result.cancel());
        assert!(flag.0.load(Ordering::SeqCst));
        assert!(matches!(result.wait(), Err(StreamError::Cancelled)));
        assert_eq!(result.state(), RunState::Cancelled);
        assert!(!cell.resolve(Ok(Box::new(1u32))));
        assert!(!result.cancel());
    }

    #[test]
    fn test_wait_across_threads() {
        let cell = RunCell::new(3);
        let result = PipelineResult::<String>::new(Arc::clone(&cell));
        let writer = thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            cell.resolve(Ok(Box::new("done".to_string())));
        });
        assert_eq!(result.wait().unwrap(), "done");
        writer.join().unwrap();
    }

    #[test]
    fn test_wait_timeout_pending() {
        let result = PipelineResult::<u32>::new(RunCell::new(4));
        assert!(result.wait_timeout(Duration::from_millis(10)).is_none());
        assert!(result.try_get().is_none());
        assert_eq!(result.state(), RunState::Built);
    }

    #[test]
    fn test_wrong_result_type() {
        let cell = RunCell::new(5);
        cell.resolve(Ok(Box::new(1u8)));
        let result = PipelineResult::<String>::new(cell);
        assert!(matches!(result.wait(), Err(StreamError::TypeMismatch { .. })));
    }
}
