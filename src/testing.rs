//! Probes for checking publish/subscribe conformance.
//!
//! [`ManualSubscriber`] records every signal it receives and flags anything
//! the protocol forbids: overlapping callbacks, delivery beyond the demand it
//! granted, signals after termination, a second `on_subscribe`.
//! [`ManualPublisher`] is the mirror image: the test decides exactly when
//! each element, error or completion is sent, and can deliberately ignore
//! demand to see how a subscriber copes.

use crate::demand::DemandTracker;
use crate::error::{ProtocolViolation, StreamError};
use crate::protocol::{reject, Publisher, Subscriber, Subscription};
use parking_lot::{Condvar, Mutex};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

struct Recorded<T> {
    items: Vec<T>,
    error: Option<StreamError>,
    completed: bool,
    subscriptions: usize,
    /// Granted by this subscriber, not yet delivered
    outstanding: DemandTracker,
    violations: Vec<String>,
}

/// Subscriber driven by the test: it never requests on its own
pub struct ManualSubscriber<T> {
    subscription: Mutex<Option<Arc<dyn Subscription>>>,
    recorded: Mutex<Recorded<T>>,
    terminated: Condvar,
    in_callback: AtomicBool,
    /// Cancel once this many elements have arrived; zero disables
    cancel_after: AtomicUsize,
}

impl<T: Send + 'static> ManualSubscriber<T> {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            subscription: Mutex::new(None),
            recorded: Mutex::new(Recorded {
                items: Vec::new(),
                error: None,
                completed: false,
                subscriptions: 0,
                outstanding: DemandTracker::new(),
                violations: Vec::new(),
            }),
            terminated: Condvar::new(),
            in_callback: AtomicBool::new(false),
            cancel_after: AtomicUsize::new(0),
        })
    }

    /// Grant `n` more elements. Zero is passed through unchanged.
    pub fn request(&self, n: u64) {
        if n > 0 {
            let _ = self.recorded.lock().outstanding.request(n);
        }
        let subscription = self.subscription.lock().clone();
        match subscription {
            Some(subscription) => subscription.request(n),
            None => self.violation("request before on_subscribe".into()),
        }
    }

    pub fn cancel(&self) {
        let subscription = self.subscription.lock().clone();
        if let Some(subscription) = subscription {
            subscription.cancel();
        }
    }

    /// Cancel from inside `on_next` once `n` elements have been received
    pub fn cancel_after(&self, n: usize) {
        self.cancel_after.store(n, Ordering::SeqCst);
    }

    /// Remove and return the elements received so far
    pub fn take_items(&self) -> Vec<T> {
        std::mem::take(&mut self.recorded.lock().items)
    }

    pub fn received(&self) -> usize {
        self.recorded.lock().items.len()
    }

    pub fn error(&self) -> Option<StreamError> {
        self.recorded.lock().error.clone()
    }

    pub fn is_completed(&self) -> bool {
        self.recorded.lock().completed
    }

    pub fn is_terminated(&self) -> bool {
        let recorded = self.recorded.lock();
        recorded.completed || recorded.error.is_some()
    }

    pub fn is_subscribed(&self) -> bool {
        self.recorded.lock().subscriptions > 0
    }

    /// Everything this subscriber saw that the protocol forbids
    pub fn violations(&self) -> Vec<String> {
        self.recorded.lock().violations.clone()
    }

    /// Block until a terminal signal arrives; `false` on timeout
    pub fn await_termination(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut recorded = self.recorded.lock();
        while !(recorded.completed || recorded.error.is_some()) {
            if self.terminated.wait_until(&mut recorded, deadline).timed_out() {
                return recorded.completed || recorded.error.is_some();
            }
        }
        true
    }

    fn violation(&self, message: String) {
        self.recorded.lock().violations.push(message);
    }

    fn enter(&self, signal: &str) {
        if self.in_callback.swap(true, Ordering::AcqRel) {
            self.violation(format!("{signal} overlapped another callback"));
        }
    }

    fn exit(&self) {
        self.in_callback.store(false, Ordering::Release);
    }
}

impl<T: Send + 'static> Subscriber<T> for ManualSubscriber<T> {
    fn on_subscribe(&self, subscription: Arc<dyn Subscription>) {
        self.enter("on_subscribe");
        let first = {
            let mut recorded = self.recorded.lock();
            if recorded.subscriptions == 0 {
                // Stored before the count moves so `is_subscribed` implies a usable handle
                *self.subscription.lock() = Some(Arc::clone(&subscription));
            }
            recorded.subscriptions += 1;
            recorded.subscriptions == 1
        };
        if !first {
            self.violation(ProtocolViolation::DuplicateSubscription.to_string());
            subscription.cancel();
        }
        self.exit();
    }

    fn on_next(&self, item: T) {
        self.enter("on_next");
        let cancel = {
            let mut recorded = self.recorded.lock();
            if recorded.completed || recorded.error.is_some() {
                recorded.violations.push("on_next after termination".into());
            }
            if !recorded.outstanding.consume_one() {
                recorded
                    .violations
                    .push(ProtocolViolation::DeliveryWithoutDemand.to_string());
            }
            recorded.items.push(item);
            let limit = self.cancel_after.load(Ordering::SeqCst);
            limit > 0 && recorded.items.len() >= limit
        };
        self.exit();
        if cancel {
            self.cancel_after.store(0, Ordering::SeqCst);
            self.cancel();
        }
    }

    fn on_error(&self, error: StreamError) {
        self.enter("on_error");
        {
            let mut recorded = self.recorded.lock();
            if recorded.completed || recorded.error.is_some() {
                recorded.violations.push(format!("on_error after termination: {error}"));
            } else {
                recorded.error = Some(error);
            }
        }
        self.terminated.notify_all();
        self.exit();
    }

    fn on_complete(&self) {
        self.enter("on_complete");
        {
            let mut recorded = self.recorded.lock();
            if recorded.completed || recorded.error.is_some() {
                recorded.violations.push("on_complete after termination".into());
            } else {
                recorded.completed = true;
            }
        }
        self.terminated.notify_all();
        self.exit();
    }
}

/// Counters shared between a [`ManualPublisher`] and the subscription it hands out
#[derive(Default)]
struct Ledger {
    requested: AtomicU64,
    outstanding: AtomicU64,
    cancelled: AtomicBool,
    zero_requests: AtomicUsize,
}

impl Subscription for Ledger {
    fn request(&self, n: u64) {
        if n == 0 {
            self.zero_requests.fetch_add(1, Ordering::SeqCst);
            return;
        }
        let add = |current: u64| Some(current.saturating_add(n));
        let _ = self.requested.fetch_update(Ordering::SeqCst, Ordering::SeqCst, add);
        let _ = self.outstanding.fetch_update(Ordering::SeqCst, Ordering::SeqCst, add);
    }

    fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }
}

/// Unicast publisher whose signals are sent by the test
pub struct ManualPublisher<T> {
    subscriber: Mutex<Option<Arc<dyn Subscriber<T>>>>,
    ledger: Arc<Ledger>,
}

impl<T: Send + 'static> ManualPublisher<T> {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            subscriber: Mutex::new(None),
            ledger: Arc::new(Ledger::default()),
        })
    }

    fn subscriber(&self) -> Option<Arc<dyn Subscriber<T>>> {
        self.subscriber.lock().clone()
    }

    /// Total demand granted so far, saturating at `u64::MAX`
    pub fn requested(&self) -> u64 {
        self.ledger.requested.load(Ordering::SeqCst)
    }

    /// Demand granted and not yet used by `emit`
    pub fn outstanding(&self) -> u64 {
        self.ledger.outstanding.load(Ordering::SeqCst)
    }

    pub fn zero_requests(&self) -> usize {
        self.ledger.zero_requests.load(Ordering::SeqCst)
    }

    pub fn is_cancelled(&self) -> bool {
        self.ledger.cancelled.load(Ordering::SeqCst)
    }

    pub fn is_subscribed(&self) -> bool {
        self.subscriber.lock().is_some()
    }

    /// Send `item` if the subscriber has demand and has not cancelled
    pub fn emit(&self, item: T) -> bool {
        if self.is_cancelled() {
            return false;
        }
        let taken = self
            .ledger
            .outstanding
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| match n {
                0 => None,
                u64::MAX => Some(u64::MAX),
                n => Some(n - 1),
            })
            .is_ok();
        if !taken {
            return false;
        }
        self.emit_unchecked(item);
        true
    }

    /// Send `item` regardless of demand or cancellation
    pub fn emit_unchecked(&self, item: T) {
        if let Some(subscriber) = self.subscriber() {
            subscriber.on_next(item);
        }
    }

    pub fn complete(&self) {
        if let Some(subscriber) = self.subscriber() {
            subscriber.on_complete();
        }
    }

    pub fn fail(&self, error: StreamError) {
        if let Some(subscriber) = self.subscriber() {
            subscriber.on_error(error);
        }
    }
}

impl<T: Send + 'static> Publisher<T> for ManualPublisher<T> {
    fn subscribe(&self, subscriber: Arc<dyn Subscriber<T>>) {
        {
            let mut slot = self.subscriber.lock();
            if slot.is_some() {
                drop(slot);
                reject(&subscriber, ProtocolViolation::AlreadySubscribed.into());
                return;
            }
            *slot = Some(Arc::clone(&subscriber));
        }
        subscriber.on_subscribe(self.ledger.clone());
    }
}
