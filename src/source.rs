//! Executors for source stages.

use crate::demand::DemandTracker;
use crate::error::{ProtocolViolation, StreamError};
use crate::graph::ElementIter;
use crate::metrics::StageMetrics;
use crate::protocol::{reject, Element, Publisher, Subscriber, Subscription};
use crate::serial::{Signal, SignalQueue};
use parking_lot::Mutex;
use std::iter::Peekable;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use tracing::{debug, trace, warn};

enum Origin {
    Iter(Peekable<ElementIter>),
    /// Holds the error until the subscriber attaches
    Failed(Option<StreamError>),
}

struct SourceState {
    origin: Origin,
    downstream: Option<Arc<dyn Subscriber<Element>>>,
    attached: bool,
    demand: DemandTracker,
    done: bool,
    metrics: StageMetrics,
}

/// Unicast publisher over an iterator or a fixed failure
pub(crate) struct SourceStage {
    name: &'static str,
    queue: SignalQueue<Signal>,
    cancelled: AtomicBool,
    state: Mutex<SourceState>,
    this: Weak<SourceStage>,
}

impl SourceStage {
    pub(crate) fn from_iter(iter: ElementIter, metrics: StageMetrics) -> Arc<Self> {
        Self::new("of", Origin::Iter(iter.peekable()), metrics)
    }

    pub(crate) fn failed(error: StreamError, metrics: StageMetrics) -> Arc<Self> {
        Self::new("failed", Origin::Failed(Some(error)), metrics)
    }

    fn new(name: &'static str, origin: Origin, metrics: StageMetrics) -> Arc<Self> {
        Arc::new_cyclic(|this| Self {
            name,
            queue: SignalQueue::new(),
            cancelled: AtomicBool::new(false),
            state: Mutex::new(SourceState {
                origin,
                downstream: None,
                attached: false,
                demand: DemandTracker::new(),
                done: false,
                metrics,
            }),
            this: this.clone(),
        })
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

    fn dispatch(&self, st: &mut SourceState, signal: Signal) {
        trace!(stage = self.name, signal = signal.kind(), "source signal");
        match signal {
            Signal::Attach(subscriber) => self.on_attach(st, subscriber),
            Signal::Request(n) => self.on_request(st, n),
            Signal::Cancel => {
                if !st.done {
                    debug!(stage = self.name, "source cancelled");
                }
                st.done = true;
                st.downstream = None;
            }
            // Sources have no upstream
            _ => {}
        }
    }

    fn on_attach(&self, st: &mut SourceState, subscriber: Arc<dyn Subscriber<Element>>) {
        if st.attached {
            warn!(stage = self.name, "rejecting second subscriber");
            reject(&subscriber, ProtocolViolation::AlreadySubscribed.into());
            return;
        }
        st.attached = true;
        let Some(this) = self.this.upgrade() else {
            return;
        };
        subscriber.on_subscribe(this);
        st.downstream = Some(subscriber);
        if self.is_cancelled() {
            return;
        }

        match &mut st.origin {
            Origin::Failed(error) => {
                let error = error
                    .take()
                    .unwrap_or_else(|| StreamError::msg("source failure already delivered"));
                self.finish(st, Err(error));
            }
            Origin::Iter(iter) => {
                if iter.peek().is_none() {
                    self.finish(st, Ok(()));
                }
            }
        }
    }

    fn on_request(&self, st: &mut SourceState, n: u64) {
        if st.done {
            return;
        }
        if let Err(violation) = st.demand.request(n) {
            warn!(stage = self.name, %violation, "downstream broke the protocol");
            self.finish(st, Err(violation.into()));
            return;
        }

        while !st.done && st.demand.has_demand() && !self.is_cancelled() {
            let next = match &mut st.origin {
                Origin::Iter(iter) => iter.next(),
                Origin::Failed(_) => None,
            };
            let Some(item) = next else {
                self.finish(st, Ok(()));
                break;
            };
            let _ = st.demand.consume_one();
            if let Some(downstream) = &st.downstream {
                st.metrics.record_emitted();
                downstream.on_next(item);
            }
            if self.is_cancelled() {
                break;
            }
            let exhausted = match &mut st.origin {
                Origin::Iter(iter) => iter.peek().is_none(),
                Origin::Failed(_) => true,
            };
            if exhausted {
                self.finish(st, Ok(()));
            }
        }
    }

    fn finish(&self, st: &mut SourceState, outcome: Result<(), StreamError>) {
        if st.done {
            return;
        }
        st.done = true;
        if let Some(downstream) = st.downstream.take() {
            debug!(stage = self.name, failed = outcome.is_err(), "source terminated");
            match outcome {
                Ok(()) => downstream.on_complete(),
                Err(error) => downstream.on_error(error),
            }
        }
    }
}

impl Publisher<Element> for SourceStage {
    fn subscribe(&self, subscriber: Arc<dyn Subscriber<Element>>) {
        self.signal(Signal::Attach(subscriber));
    }
}

impl Subscription for SourceStage {
    fn request(&self, n: u64) {
        self.signal(Signal::Request(n));
    }

    fn cancel(&self) {
        self.cancelled.store(true, Ordering::Release);
        self.signal(Signal::Cancel);
    }
}
