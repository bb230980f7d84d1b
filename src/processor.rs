//! Executor for intermediate stages.
//!
//! A [`ProcessorStage`] subscribes to one upstream, publishes to one
//! downstream and runs one [`Operator`] in between. All of its protocol
//! signals, from either side and from any thread, go through a single
//! [`SignalQueue`], so the operator state is only ever touched by the thread
//! currently draining that queue.
//!
//! Demand is propagated, never invented: the stage keeps at most as much
//! outstanding upstream demand as its downstream has granted, adjusted per
//! operator (limit caps it, buffers refill ahead, flat-maps take one outer
//! element at a time).

use crate::config::EngineConfig;
use crate::demand::{Demand, DemandTracker};
use crate::error::{ProtocolViolation, StreamError};
use crate::graph::Graph;
use crate::metrics::StageMetrics;
use crate::protocol::{reject, Element, Publisher, Subscriber, Subscription};
use crate::serial::{InnerSignal, Signal, SignalQueue};
use crate::stage::{InnerLink, Operator, Step};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use tracing::{debug, trace, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Active,
    Terminated,
}

struct ProcessorState {
    operator: Operator,
    upstream: Option<Arc<dyn Subscription>>,
    downstream: Option<Arc<dyn Subscriber<Element>>>,
    /// Whether a downstream has ever attached
    attached: bool,
    /// Downstream has granted demand at least once; nothing is pulled before
    primed: bool,
    /// Granted by downstream, not yet delivered
    demand: DemandTracker,
    /// Requested from upstream, not yet received
    in_flight: DemandTracker,
    /// Upstream completed; remaining buffered or nested elements still drain
    upstream_done: bool,
    /// Terminal signal that arrived before any downstream attached
    pending: Option<Result<(), StreamError>>,
    phase: Phase,
    metrics: StageMetrics,
}

/// A running intermediate stage
pub(crate) struct ProcessorStage {
    name: &'static str,
    queue: SignalQueue<Signal>,
    cancelled: AtomicBool,
    state: Mutex<ProcessorState>,
    config: Arc<EngineConfig>,
    this: Weak<ProcessorStage>,
}

impl ProcessorStage {
    pub(crate) fn new(
        name: &'static str,
        operator: Operator,
        config: Arc<EngineConfig>,
        metrics: StageMetrics,
    ) -> Arc<Self> {
        Arc::new_cyclic(|this| Self {
            name,
            queue: SignalQueue::new(),
            cancelled: AtomicBool::new(false),
            state: Mutex::new(ProcessorState {
                operator,
                upstream: None,
                downstream: None,
                attached: false,
                primed: false,
                demand: DemandTracker::new(),
                in_flight: DemandTracker::new(),
                upstream_done: false,
                pending: None,
                phase: Phase::Active,
                metrics,
            }),
            config,
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

    fn dispatch(&self, st: &mut ProcessorState, signal: Signal) {
        trace!(stage = self.name, signal = signal.kind(), "processor signal");
        match signal {
            Signal::Attach(subscriber) => self.on_attach(st, subscriber),
            Signal::Subscribed(subscription) => self.on_upstream_subscribed(st, subscription),
            Signal::Next(item) => self.on_upstream_next(st, item),
            Signal::Error(error) => self.on_upstream_error(st, error),
            Signal::Complete => self.on_upstream_complete(st),
            Signal::Request(n) => self.on_request(st, n),
            Signal::Cancel => self.on_cancel(st),
            Signal::Inner(generation, inner) => self.on_inner(st, generation, inner),
        }
    }

    fn on_attach(&self, st: &mut ProcessorState, subscriber: Arc<dyn Subscriber<Element>>) {
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

        if let Some(outcome) = st.pending.take() {
            if let Some(downstream) = st.downstream.take() {
                match outcome {
                    Ok(()) => downstream.on_complete(),
                    Err(error) => downstream.on_error(error),
                }
            }
            return;
        }
        let exhausted = st
            .operator
            .transform()
            .is_some_and(|transform| transform.is_exhausted());
        if exhausted && st.phase == Phase::Active {
            self.complete(st);
        }
    }

    fn on_upstream_subscribed(&self, st: &mut ProcessorState, subscription: Arc<dyn Subscription>) {
        if st.upstream.is_some() {
            warn!(
                stage = self.name,
                violation = %ProtocolViolation::DuplicateSubscription,
                "cancelling extra subscription"
            );
            subscription.cancel();
            return;
        }
        if st.phase == Phase::Terminated || st.upstream_done || self.is_cancelled() {
            subscription.cancel();
            return;
        }
        st.upstream = Some(subscription);
        self.replenish(st);
    }

    fn on_upstream_next(&self, st: &mut ProcessorState, item: Element) {
        if st.phase == Phase::Terminated || self.is_cancelled() {
            // In flight when we cancelled
            return;
        }
        st.metrics.record_received();
        if !st.in_flight.consume_one() {
            warn!(stage = self.name, "upstream delivered without demand");
            self.fail(st, ProtocolViolation::DeliveryWithoutDemand.into());
            return;
        }

        let step = match &mut st.operator {
            Operator::Transform(transform) => transform.apply(item),
            Operator::Buffer(buffer) => {
                let evicted = buffer.queue.dropped_count();
                if buffer.queue.push(item).is_err() {
                    self.fail(st, ProtocolViolation::DeliveryWithoutDemand.into());
                    return;
                }
                if buffer.queue.dropped_count() > evicted {
                    st.metrics.record_dropped();
                }
                self.emit_ready(st);
                self.replenish(st);
                return;
            }
            Operator::FlatMap(flat_map) => match (flat_map.f)(item) {
                Ok(graph) => {
                    self.open_inner(st, graph);
                    return;
                }
                Err(error) => Step::Fail(error),
            },
            Operator::FlatMapIter(flat_map) => match (flat_map.f)(item) {
                Ok(iter) => {
                    flat_map.current = Some(iter.peekable());
                    self.emit_ready(st);
                    self.replenish(st);
                    return;
                }
                Err(error) => Step::Fail(error),
            },
        };
        self.on_step(st, step);
    }

    fn on_step(&self, st: &mut ProcessorState, step: Step) {
        match step {
            Step::Emit(item) => {
                self.emit(st, item);
                self.replenish(st);
            }
            Step::Drop => {
                st.metrics.record_dropped();
                self.replenish(st);
            }
            Step::EmitLast(item) => {
                self.emit(st, item);
                self.complete(st);
            }
            Step::Complete => self.complete(st),
            Step::Fail(error) => self.fail(st, error),
        }
    }

    fn on_upstream_error(&self, st: &mut ProcessorState, error: StreamError) {
        if st.phase == Phase::Terminated {
            warn!(stage = self.name, %error, "dropping error after termination");
            return;
        }
        st.upstream = None;
        st.in_flight.clear();
        self.cancel_inner(st);
        self.finish(st, Err(error));
    }

    fn on_upstream_complete(&self, st: &mut ProcessorState) {
        if st.phase == Phase::Terminated {
            return;
        }
        st.upstream = None;
        st.upstream_done = true;
        st.in_flight.clear();
        if Self::drained(st) {
            self.finish(st, Ok(()));
        }
    }

    fn on_request(&self, st: &mut ProcessorState, n: u64) {
        if st.phase == Phase::Terminated {
            return;
        }
        if let Err(violation) = st.demand.request(n) {
            warn!(stage = self.name, %violation, "downstream broke the protocol");
            self.fail(st, violation.into());
            return;
        }
        st.primed = true;
        self.emit_ready(st);
        self.replenish(st);
    }

    fn on_cancel(&self, st: &mut ProcessorState) {
        if st.phase == Phase::Terminated {
            return;
        }
        debug!(stage = self.name, "cancelled by downstream");
        st.phase = Phase::Terminated;
        st.downstream = None;
        self.cancel_upstream(st);
        self.cancel_inner(st);
        match &mut st.operator {
            Operator::Transform(transform) => transform.on_cancel(),
            Operator::Buffer(buffer) => buffer.queue.clear(),
            Operator::FlatMapIter(flat_map) => flat_map.current = None,
            Operator::FlatMap(_) => {}
        }
    }

    fn on_inner(&self, st: &mut ProcessorState, generation: u64, signal: InnerSignal) {
        let current = match &st.operator {
            Operator::FlatMap(flat_map) => flat_map
                .inner
                .as_ref()
                .is_some_and(|inner| inner.generation == generation),
            _ => false,
        };
        if !current || st.phase == Phase::Terminated {
            if let InnerSignal::Subscribed(subscription) = signal {
                subscription.cancel();
            }
            return;
        }

        match signal {
            InnerSignal::Subscribed(subscription) => {
                if let Some(inner) = Self::inner_mut(st) {
                    if inner.subscription.is_some() {
                        subscription.cancel();
                        return;
                    }
                    inner.subscription = Some(subscription);
                }
                self.emit_ready(st);
            }
            InnerSignal::Next(item) => {
                let accepted =
                    Self::inner_mut(st).is_some_and(|inner| inner.outstanding.consume_one());
                if !accepted {
                    warn!(stage = self.name, "nested publisher delivered without demand");
                    self.fail(st, ProtocolViolation::DeliveryWithoutDemand.into());
                    return;
                }
                self.emit(st, item);
            }
            InnerSignal::Error(error) => {
                if let Operator::FlatMap(flat_map) = &mut st.operator {
                    flat_map.inner = None;
                }
                self.fail(st, error);
            }
            InnerSignal::Complete => {
                if let Operator::FlatMap(flat_map) = &mut st.operator {
                    flat_map.inner = None;
                }
                if st.upstream_done {
                    self.finish(st, Ok(()));
                } else {
                    self.replenish(st);
                }
            }
        }
    }

    fn inner_mut(st: &mut ProcessorState) -> Option<&mut InnerLink> {
        match &mut st.operator {
            Operator::FlatMap(flat_map) => flat_map.inner.as_mut(),
            _ => None,
        }
    }

    fn open_inner(&self, st: &mut ProcessorState, graph: Graph) {
        let publisher = match crate::pipeline::materialize_publisher(&graph, &self.config, None) {
            Ok(publisher) => publisher,
            Err(error) => {
                self.fail(st, error);
                return;
            }
        };
        let generation = match &mut st.operator {
            Operator::FlatMap(flat_map) => {
                flat_map.generation += 1;
                flat_map.inner = Some(InnerLink {
                    generation: flat_map.generation,
                    subscription: None,
                    outstanding: DemandTracker::new(),
                });
                flat_map.generation
            }
            _ => return,
        };
        trace!(stage = self.name, generation, "subscribing nested publisher");
        publisher.subscribe(Arc::new(InnerSubscriber {
            parent: self.this.clone(),
            generation,
        }));
    }

    /// Deliver one element downstream, consuming one unit of demand
    fn emit(&self, st: &mut ProcessorState, item: Element) {
        if !st.demand.consume_one() {
            self.fail(st, ProtocolViolation::DeliveryWithoutDemand.into());
            return;
        }
        if let Some(downstream) = &st.downstream {
            st.metrics.record_emitted();
            downstream.on_next(item);
        }
    }

    /// Push out whatever the operator holds, as far as demand allows
    fn emit_ready(&self, st: &mut ProcessorState) {
        loop {
            if st.phase == Phase::Terminated || self.is_cancelled() || !st.demand.has_demand() {
                break;
            }
            let next = match &mut st.operator {
                Operator::Buffer(buffer) => buffer.queue.pop(),
                Operator::FlatMapIter(flat_map) => {
                    flat_map.current.as_mut().and_then(Iterator::next)
                }
                _ => None,
            };
            match next {
                Some(item) => self.emit(st, item),
                None => break,
            }
        }

        match &mut st.operator {
            Operator::FlatMapIter(flat_map) => {
                let exhausted = flat_map
                    .current
                    .as_mut()
                    .is_some_and(|iter| iter.peek().is_none());
                if exhausted {
                    flat_map.current = None;
                }
            }
            Operator::FlatMap(flat_map) => {
                if let Some(inner) = flat_map.inner.as_mut() {
                    if let Some(subscription) = &inner.subscription {
                        if let Some(n) = inner.outstanding.raise_to(st.demand.current()) {
                            self.queue.defer_request(Arc::clone(subscription), n);
                        }
                    }
                }
            }
            _ => {}
        }

        if st.phase == Phase::Active && st.upstream_done && Self::drained(st) {
            self.finish(st, Ok(()));
        }
    }

    /// Nothing left to emit once upstream has completed
    fn drained(st: &ProcessorState) -> bool {
        match &st.operator {
            Operator::Transform(_) => true,
            Operator::Buffer(buffer) => buffer.queue.is_empty(),
            Operator::FlatMap(flat_map) => flat_map.inner.is_none(),
            Operator::FlatMapIter(flat_map) => flat_map.current.is_none(),
        }
    }

    /// Top up upstream demand to what the operator can currently absorb
    ///
    /// The request itself leaves once the current drain is over.
    fn replenish(&self, st: &mut ProcessorState) {
        if !st.primed || st.phase != Phase::Active || st.upstream_done || self.is_cancelled() {
            return;
        }
        let Some(upstream) = st.upstream.clone() else {
            return;
        };

        let target = match &st.operator {
            Operator::Transform(transform) => match transform.upstream_cap() {
                Some(cap) => st.demand.current().min(Demand::Finite(cap)),
                None => st.demand.current(),
            },
            Operator::Buffer(_) if st.operator.drops_oldest() => Demand::Unbounded,
            Operator::Buffer(buffer) => {
                let in_flight = st.in_flight.current().remaining().unwrap_or(0);
                let committed = buffer.queue.len() as u64 + in_flight;
                let extra = buffer.refill.refill(buffer.queue.capacity() as u64, committed);
                Demand::Finite(in_flight + extra)
            }
            Operator::FlatMap(flat_map) => {
                let idle = flat_map.inner.is_none();
                Demand::Finite(u64::from(idle && st.demand.has_demand()))
            }
            Operator::FlatMapIter(flat_map) => {
                let idle = flat_map.current.is_none();
                Demand::Finite(u64::from(idle && st.demand.has_demand()))
            }
        };

        if let Some(n) = st.in_flight.raise_to(target) {
            trace!(stage = self.name, n, "requesting upstream");
            st.metrics.record_request();
            self.queue.defer_request(upstream, n);
        }
    }

    /// The stage itself decided to stop: cancel upstream, complete downstream
    fn complete(&self, st: &mut ProcessorState) {
        self.cancel_upstream(st);
        self.finish(st, Ok(()));
    }

    /// The stage itself failed: cancel both upstream and nested publisher
    fn fail(&self, st: &mut ProcessorState, error: StreamError) {
        self.cancel_upstream(st);
        self.cancel_inner(st);
        self.finish(st, Err(error));
    }

    fn cancel_upstream(&self, st: &mut ProcessorState) {
        st.in_flight.clear();
        if let Some(upstream) = st.upstream.take() {
            upstream.cancel();
        }
    }

    fn cancel_inner(&self, st: &mut ProcessorState) {
        if let Operator::FlatMap(flat_map) = &mut st.operator {
            if let Some(subscription) = flat_map.inner.take().and_then(|inner| inner.subscription) {
                subscription.cancel();
            }
        }
    }

    /// Signal exactly one terminal event downstream
    fn finish(&self, st: &mut ProcessorState, outcome: Result<(), StreamError>) {
        if st.phase == Phase::Terminated {
            return;
        }
        st.phase = Phase::Terminated;
        st.upstream = None;

        let outcome = match (&mut st.operator, outcome) {
            (Operator::Transform(transform), Ok(())) => transform.on_complete(),
            (Operator::Transform(transform), Err(error)) => {
                transform.on_error(&error);
                Err(error)
            }
            (Operator::Buffer(buffer), Err(error)) => {
                buffer.queue.clear();
                Err(error)
            }
            (_, outcome) => outcome,
        };

        match st.downstream.take() {
            Some(downstream) => {
                debug!(stage = self.name, failed = outcome.is_err(), "stage terminated");
                match outcome {
                    Ok(()) => downstream.on_complete(),
                    Err(error) => downstream.on_error(error),
                }
            }
            None => st.pending = Some(outcome),
        }
    }
}

impl Subscriber<Element> for ProcessorStage {
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

impl Publisher<Element> for ProcessorStage {
    fn subscribe(&self, subscriber: Arc<dyn Subscriber<Element>>) {
        self.signal(Signal::Attach(subscriber));
    }
}

impl Subscription for ProcessorStage {
    fn request(&self, n: u64) {
        self.signal(Signal::Request(n));
    }

    fn cancel(&self) {
        self.cancelled.store(true, Ordering::Release);
        self.signal(Signal::Cancel);
    }
}

/// Forwards the signals of a nested flat-map publisher to its parent stage
struct InnerSubscriber {
    parent: Weak<ProcessorStage>,
    generation: u64,
}

impl InnerSubscriber {
    fn forward(&self, signal: InnerSignal) {
        match self.parent.upgrade() {
            Some(parent) => parent.signal(Signal::Inner(self.generation, signal)),
            None => {
                if let InnerSignal::Subscribed(subscription) = signal {
                    subscription.cancel();
                }
            }
        }
    }
}

impl Subscriber<Element> for InnerSubscriber {
    fn on_subscribe(&self, subscription: Arc<dyn Subscription>) {
        self.forward(InnerSignal::Subscribed(subscription));
    }

    fn on_next(&self, item: Element) {
        self.forward(InnerSignal::Next(item));
    }

    fn on_error(&self, error: StreamError) {
        self.forward(InnerSignal::Error(error));
    }

    fn on_complete(&self) {
        self.forward(InnerSignal::Complete);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::OverflowPolicy;
    use crate::error::Result;
    use crate::graph::{ElementIter, Stage};
    use crate::testing::{ManualPublisher, ManualSubscriber};

    fn stage(stage: Stage) -> Arc<ProcessorStage> {
        let config = Arc::new(EngineConfig::default());
        let operator = Operator::from_stage(&stage, &config).unwrap();
        ProcessorStage::new(stage.name(), operator, config, StageMetrics::new(stage.name()))
    }

    fn doubled() -> Stage {
        Stage::Map(Arc::new(|e: Element| -> Result<Element> {
            Ok(Box::new(*e.downcast::<i32>().unwrap() * 2))
        }))
    }

    fn wire(
        processor: &Arc<ProcessorStage>,
    ) -> (Arc<ManualPublisher<Element>>, Arc<ManualSubscriber<Element>>) {
        let source = ManualPublisher::<Element>::new();
        let sink = ManualSubscriber::<Element>::new();
        source.subscribe(processor.clone());
        processor.subscribe(sink.clone());
        (source, sink)
    }

    fn ints(sink: &ManualSubscriber<Element>) -> Vec<i32> {
        sink.take_items()
            .into_iter()
            .map(|e| *e.downcast::<i32>().unwrap())
            .collect()
    }

    #[test]
    fn test_demand_passes_through_map() {
        let map = stage(doubled());
        let (source, sink) = wire(&map);
        assert_eq!(source.requested(), 0);

        sink.request(3);
        assert_eq!(source.requested(), 3);
        source.emit(Box::new(1));
        source.emit(Box::new(2));
        assert_eq!(ints(&sink), vec![2, 4]);
    }

    #[test]
    fn test_dropped_element_is_replaced() {
        let filter = stage(Stage::Filter(Arc::new(|e: &Element| -> Result<bool> {
            Ok(*e.downcast_ref::<i32>().unwrap() % 2 == 0)
        })));
        let (source, sink) = wire(&filter);
        sink.request(1);
        source.emit(Box::new(1));
        assert_eq!(source.requested(), 2);
        source.emit(Box::new(2));
        assert_eq!(ints(&sink), vec![2]);
        assert_eq!(source.requested(), 2);
    }

    #[test]
    fn test_limit_caps_upstream_demand_and_cancels() {
        let limit = stage(Stage::Limit(2));
        let (source, sink) = wire(&limit);
        sink.request(10);
        assert_eq!(source.requested(), 2);
        source.emit(Box::new(1));
        source.emit(Box::new(2));
        assert!(source.is_cancelled());
        assert!(sink.is_completed());
        assert_eq!(ints(&sink), vec![1, 2]);
    }

    #[test]
    fn test_limit_zero_completes_without_demand() {
        let limit = stage(Stage::Limit(0));
        let (source, sink) = wire(&limit);
        assert!(sink.is_completed());
        assert!(source.is_cancelled());
        assert_eq!(source.requested(), 0);
    }

    #[test]
    fn test_zero_request_fails_both_ways() {
        let map = stage(doubled());
        let (source, sink) = wire(&map);
        sink.request(0);
        assert!(source.is_cancelled());
        assert_eq!(
            sink.error().and_then(|e| e.violation()),
            Some(ProtocolViolation::NonPositiveRequest)
        );
    }

    #[test]
    fn test_over_delivery_is_violation() {
        let map = stage(doubled());
        let (source, sink) = wire(&map);
        sink.request(1);
        source.emit(Box::new(1));
        source.emit_unchecked(Box::new(2));
        assert!(source.is_cancelled());
        assert_eq!(
            sink.error().and_then(|e| e.violation()),
            Some(ProtocolViolation::DeliveryWithoutDemand)
        );
    }

    #[test]
    fn test_second_subscriber_rejected() {
        let map = stage(doubled());
        let (_source, _sink) = wire(&map);
        let late = ManualSubscriber::<Element>::new();
        map.subscribe(late.clone());
        assert_eq!(
            late.error().and_then(|e| e.violation()),
            Some(ProtocolViolation::AlreadySubscribed)
        );
    }

    #[test]
    fn test_error_before_attach_is_held() {
        let map = stage(doubled());
        let source = ManualPublisher::<Element>::new();
        source.subscribe(map.clone());
        source.fail(StreamError::msg("early"));

        let sink = ManualSubscriber::<Element>::new();
        map.subscribe(sink.clone());
        assert!(sink.is_subscribed());
        assert_eq!(sink.error().map(|e| e.to_string()), Some("early".to_string()));
    }

    #[test]
    fn test_cancel_propagates_upstream() {
        let map = stage(doubled());
        let (source, sink) = wire(&map);
        sink.request(5);
        sink.cancel();
        assert!(source.is_cancelled());
        source.emit(Box::new(1));
        assert!(ints(&sink).is_empty());
        assert!(!sink.is_terminated());
    }

    #[test]
    fn test_buffer_prefetches_and_drains_before_completing() {
        let buffer = stage(Stage::Buffer {
            capacity: Some(4),
            policy: OverflowPolicy::Backpressure,
        });
        let (source, sink) = wire(&buffer);
        assert_eq!(source.requested(), 0);

        // The first grant fills the whole queue
        sink.request(1);
        assert_eq!(source.requested(), 4);
        for n in 0..4 {
            source.emit(Box::new(n));
        }
        source.complete();
        assert!(!sink.is_completed());

        sink.request(10);
        assert_eq!(ints(&sink), vec![0, 1, 2, 3]);
        assert!(sink.is_completed());
        assert_eq!(source.requested(), 4);
    }

    #[test]
    fn test_drop_oldest_buffer_waits_for_first_demand() {
        let buffer = stage(Stage::Buffer {
            capacity: Some(2),
            policy: OverflowPolicy::DropOldest,
        });
        let (source, sink) = wire(&buffer);
        assert_eq!(source.requested(), 0);

        sink.request(1);
        assert_eq!(source.requested(), u64::MAX);
        for n in 0..5 {
            source.emit(Box::new(n));
        }
        source.complete();
        sink.request(5);
        assert_eq!(ints(&sink), vec![0, 3, 4]);
        assert!(sink.is_completed());
    }

    #[test]
    fn test_cancel_before_demand_pulls_nothing() {
        let buffer = stage(Stage::Buffer {
            capacity: None,
            policy: OverflowPolicy::Backpressure,
        });
        let (source, sink) = wire(&buffer);
        sink.cancel();
        assert!(source.is_cancelled());
        assert_eq!(source.requested(), 0);
    }

    struct WarnCounter(Arc<std::sync::atomic::AtomicUsize>);

    impl<S: tracing::Subscriber> tracing_subscriber::Layer<S> for WarnCounter {
        fn on_event(
            &self,
            event: &tracing::Event<'_>,
            _ctx: tracing_subscriber::layer::Context<'_, S>,
        ) {
            if *event.metadata().level() == tracing::Level::WARN {
                self.0.fetch_add(1, Ordering::SeqCst);
            }
        }
    }

    #[test]
    fn test_error_after_termination_is_logged_as_warning() {
        use tracing_subscriber::layer::SubscriberExt;

        let warnings = Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let collector = tracing_subscriber::registry().with(WarnCounter(Arc::clone(&warnings)));
        tracing::subscriber::with_default(collector, || {
            let map = stage(doubled());
            let (source, sink) = wire(&map);
            source.complete();
            assert!(sink.is_completed());
            assert_eq!(warnings.load(Ordering::SeqCst), 0);

            source.fail(StreamError::msg("late"));
            assert_eq!(warnings.load(Ordering::SeqCst), 1);
            assert!(sink.error().is_none());
        });
    }

    #[test]
    fn test_flat_map_iter_respects_downstream_demand() {
        let flat = stage(Stage::FlatMapIter(Arc::new(|e: Element| -> Result<ElementIter> {
            let n = *e.downcast::<i32>().unwrap();
            Ok(Box::new((0..n).map(|x| Box::new(x) as Element)) as ElementIter)
        })));
        let (source, sink) = wire(&flat);
        sink.request(2);
        assert_eq!(source.requested(), 1);
        source.emit(Box::new(3));
        assert_eq!(ints(&sink), vec![0, 1]);
        assert_eq!(source.requested(), 1);

        sink.request(5);
        assert_eq!(ints(&sink), vec![2]);
        assert_eq!(source.requested(), 2);
    }
}
