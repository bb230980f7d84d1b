//! Executor for terminal stages.
//!
//! The sink is where demand originates. Collecting terminals keep up to
//! `terminal_prefetch` elements requested and top up through the engine's
//! [`RefillController`]; `find_first` asks for exactly one element; an
//! external subscriber drives demand itself. Whatever the terminal, its
//! outcome lands in the run's [`RunCell`] exactly once.

use crate::backpressure::RefillController;
use crate::collector::Accumulator;
use crate::completion::RunCell;
use crate::config::EngineConfig;
use crate::demand::DemandTracker;
use crate::error::{ProtocolViolation, Result, StreamError};
use crate::graph::{FirstFn, ForEachFn, Stage};
use crate::metrics::StageMetrics;
use crate::protocol::{Element, Subscriber, Subscription, Value};
use crate::serial::{Signal, SignalQueue};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use tracing::{debug, trace, warn};

enum SinkKind {
    Collect(Box<dyn Accumulator>),
    ForEach(ForEachFn),
    FindFirst(FirstFn),
    Cancel,
    /// Hands every signal to an external subscriber, which owns demand
    Forward(Arc<dyn Subscriber<Element>>),
}

struct SinkState {
    kind: Option<SinkKind>,
    upstream: Option<Arc<dyn Subscription>>,
    /// Requested from upstream, not yet received
    outstanding: DemandTracker,
    done: bool,
    metrics: StageMetrics,
}

pub(crate) struct SinkStage {
    name: &'static str,
    queue: SignalQueue<Signal>,
    /// Set by `cancel` before the signal is queued; nothing reaches a
    /// forwarded subscriber afterwards
    cancelled: AtomicBool,
    state: Mutex<SinkState>,
    cell: Arc<RunCell>,
    prefetch: u64,
    refill: RefillController,
    this: Weak<SinkStage>,
}

impl SinkStage {
    /// Instantiate the terminal for one run; `None` if `stage` is not a terminal
    pub(crate) fn new(
        stage: &Stage,
        cell: Arc<RunCell>,
        config: &EngineConfig,
        metrics: StageMetrics,
    ) -> Option<Arc<Self>> {
        let kind = match stage {
            Stage::Collect(factory) => SinkKind::Collect(factory()),
            Stage::ForEach(f) => SinkKind::ForEach(Arc::clone(f)),
            Stage::FindFirst(f) => SinkKind::FindFirst(Arc::clone(f)),
            Stage::Cancel => SinkKind::Cancel,
            Stage::Subscriber(subscriber) => SinkKind::Forward(Arc::clone(subscriber)),
            _ => return None,
        };
        Some(Arc::new_cyclic(|this| Self {
            name: stage.name(),
            queue: SignalQueue::new(),
            cancelled: AtomicBool::new(false),
            state: Mutex::new(SinkState {
                kind: Some(kind),
                upstream: None,
                outstanding: DemandTracker::new(),
                done: false,
                metrics,
            }),
            cell,
            prefetch: config.terminal_prefetch,
            refill: config.refill,
            this: this.clone(),
        }))
    }

    fn signal(&self, signal: Signal) {
        self.queue.submit(signal, |signal| {
            let mut state = self.state.lock();
            self.dispatch(&mut state, signal);
        });
    }

    fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }

    fn dispatch(&self, st: &mut SinkState, signal: Signal) {
        trace!(stage = self.name, run = self.cell.id(), signal = signal.kind(), "sink signal");
        match signal {
            Signal::Subscribed(subscription) => self.on_subscribed(st, subscription),
            Signal::Next(item) => self.on_next_item(st, item),
            Signal::Error(error) => self.on_upstream_error(st, error),
            Signal::Complete => self.on_upstream_complete(st),
            Signal::Request(n) => self.on_forward_request(st, n),
            Signal::Cancel => self.on_cancel(st),
            Signal::Attach(_) | Signal::Inner(_, _) => {}
        }
    }

    fn on_subscribed(&self, st: &mut SinkState, subscription: Arc<dyn Subscription>) {
        if st.upstream.is_some() || st.done {
            if st.upstream.is_some() {
                warn!(
                    stage = self.name,
                    violation = %ProtocolViolation::DuplicateSubscription,
                    "cancelling extra subscription"
                );
            }
            subscription.cancel();
            return;
        }
        st.upstream = Some(Arc::clone(&subscription));
        if let Some(this) = self.this.upgrade() {
            self.cell.set_canceller(this);
        }

        let initial = match &st.kind {
            Some(SinkKind::Cancel) => {
                subscription.cancel();
                self.finish(st, Ok(Box::new(())));
                return;
            }
            Some(SinkKind::Forward(subscriber)) => {
                if let Some(this) = self.this.upgrade() {
                    subscriber.on_subscribe(this);
                }
                return;
            }
            Some(SinkKind::FindFirst(_)) => 1,
            Some(SinkKind::Collect(_)) | Some(SinkKind::ForEach(_)) => {
                self.refill.refill(self.prefetch, 0)
            }
            None => return,
        };
        self.request_upstream(st, initial);
    }

    fn request_upstream(&self, st: &mut SinkState, n: u64) {
        if n == 0 {
            return;
        }
        let Some(upstream) = st.upstream.clone() else {
            return;
        };
        if st.outstanding.request(n).is_ok() {
            st.metrics.record_request();
            self.queue.defer_request(upstream, n);
        }
    }

    fn on_next_item(&self, st: &mut SinkState, item: Element) {
        if st.done || self.is_cancelled() {
            return;
        }
        st.metrics.record_received();
        if !st.outstanding.consume_one() {
            warn!(stage = self.name, "upstream delivered without demand");
            self.abort(st, ProtocolViolation::DeliveryWithoutDemand.into());
            return;
        }

        let failure = match &mut st.kind {
            Some(SinkKind::Collect(accumulator)) => accumulator.accumulate(item).err(),
            Some(SinkKind::ForEach(f)) => f(item).err(),
            Some(SinkKind::FindFirst(f)) => {
                let outcome = f(Some(item));
                self.cancel_upstream(st);
                self.finish(st, outcome);
                return;
            }
            Some(SinkKind::Forward(subscriber)) => {
                subscriber.on_next(item);
                None
            }
            Some(SinkKind::Cancel) | None => None,
        };
        if let Some(error) = failure {
            self.abort(st, error);
            return;
        }

        if matches!(st.kind, Some(SinkKind::Collect(_)) | Some(SinkKind::ForEach(_))) {
            let outstanding = st.outstanding.current().remaining().unwrap_or(u64::MAX);
            let more = self.refill.refill(self.prefetch, outstanding);
            self.request_upstream(st, more);
        }
    }

    fn on_upstream_error(&self, st: &mut SinkState, error: StreamError) {
        if st.done || self.is_cancelled() {
            warn!(stage = self.name, %error, "dropping error after termination");
            return;
        }
        st.upstream = None;
        if let Some(SinkKind::Forward(subscriber)) = &st.kind {
            subscriber.on_error(error.clone());
        }
        self.finish(st, Err(error));
    }

    fn on_upstream_complete(&self, st: &mut SinkState) {
        if st.done || self.is_cancelled() {
            return;
        }
        st.upstream = None;
        let outcome = match st.kind.take() {
            Some(SinkKind::Collect(accumulator)) => accumulator.finish(),
            Some(SinkKind::FindFirst(f)) => f(None),
            Some(SinkKind::Forward(subscriber)) => {
                subscriber.on_complete();
                Ok(Box::new(()) as Value)
            }
            Some(SinkKind::ForEach(_)) | Some(SinkKind::Cancel) | None => Ok(Box::new(()) as Value),
        };
        self.finish(st, outcome);
    }

    /// Demand granted by an external subscriber
    fn on_forward_request(&self, st: &mut SinkState, n: u64) {
        if st.done {
            return;
        }
        if n == 0 {
            let error: StreamError = ProtocolViolation::NonPositiveRequest.into();
            warn!(stage = self.name, violation = %error, "subscriber broke the protocol");
            self.abort(st, error);
            return;
        }
        self.request_upstream(st, n);
    }

    fn on_cancel(&self, st: &mut SinkState) {
        if st.done {
            return;
        }
        debug!(stage = self.name, run = self.cell.id(), "terminal cancelled");
        st.done = true;
        st.kind = None;
        self.cancel_upstream(st);
        if !self.cell.state().is_terminal() {
            self.cell.cancel();
        }
    }

    fn cancel_upstream(&self, st: &mut SinkState) {
        st.outstanding.clear();
        if let Some(upstream) = st.upstream.take() {
            upstream.cancel();
        }
    }

    /// Terminal-side failure: cancel upstream and fail the run
    fn abort(&self, st: &mut SinkState, error: StreamError) {
        self.cancel_upstream(st);
        if let Some(SinkKind::Forward(subscriber)) = &st.kind {
            subscriber.on_error(error.clone());
        }
        self.finish(st, Err(error));
    }

    fn finish(&self, st: &mut SinkState, outcome: Result<Value>) {
        if st.done {
            return;
        }
        st.done = true;
        st.kind = None;
        st.upstream = None;
        self.cell.resolve(outcome);
    }
}

impl Subscriber<Element> for SinkStage {
    fn on_subscribe(&self, subscription: Arc<dyn Subscription>) {
        self.signal(Signal::Subscribed(subscription));
    }

    fn on_next(&self, item: Element) {
        self.signal(Signal::Next(item));
    }

    fn on_error(&self, error: StreamError) {
        self.signal(Signal::Error(error));
    }

    fn on_complete(&self) {
        self.signal(Signal::Complete);
    }
}

/// Handed to the run cell as canceller and to forwarded subscribers
impl Subscription for SinkStage {
    fn request(&self, n: u64) {
        self.signal(Signal::Request(n));
    }

    fn cancel(&self) {
        self.cancelled.store(true, Ordering::Release);
        self.signal(Signal::Cancel);
    }
}
