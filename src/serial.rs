//! Serialized signal delivery.
//!
//! Every executor receives its protocol signals through a [`SignalQueue`].
//! Whichever thread moves the work counter away from zero becomes the drainer
//! and handles queued signals one at a time; every other caller only enqueues.
//! Signals sent re-entrantly from inside a handler are therefore processed
//! after the current one returns, which keeps delivery to a subscriber
//! serialized and bounds recursion by the length of the chain.
//!
//! Requests towards upstream are never issued from inside a drain. Handlers
//! park them with [`SignalQueue::defer_request`] and the drainer sends them
//! once its inbox is empty. An inline upstream then emits into an idle
//! executor, so every element is handled (and every cancel observed) as it
//! arrives instead of piling up behind the request that produced it.

use crate::error::StreamError;
use crate::protocol::{Element, Subscriber, Subscription};
use crossbeam::queue::SegQueue;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

/// Protocol signals as they are queued inside an executor
pub(crate) enum Signal {
    /// A downstream subscriber attaches (`Publisher::subscribe`)
    Attach(Arc<dyn Subscriber<Element>>),
    /// Upstream hands over its subscription (`on_subscribe`)
    Subscribed(Arc<dyn Subscription>),
    Next(Element),
    Error(StreamError),
    Complete,
    /// Downstream grants demand
    Request(u64),
    /// Downstream, or the run handle, cancels
    Cancel,
    /// A signal from the nested publisher of a flat-map, tagged with its generation
    Inner(u64, InnerSignal),
}

pub(crate) enum InnerSignal {
    Subscribed(Arc<dyn Subscription>),
    Next(Element),
    Error(StreamError),
    Complete,
}

impl Signal {
    pub(crate) fn kind(&self) -> &'static str {
        match self {
            Signal::Attach(_) => "attach",
            Signal::Subscribed(_) => "on_subscribe",
            Signal::Next(_) => "on_next",
            Signal::Error(_) => "on_error",
            Signal::Complete => "on_complete",
            Signal::Request(_) => "request",
            Signal::Cancel => "cancel",
            Signal::Inner(_, _) => "inner",
        }
    }
}

pub(crate) struct SignalQueue<S> {
    inbox: SegQueue<S>,
    outbox: SegQueue<(Arc<dyn Subscription>, u64)>,
    wip: AtomicUsize,
}

impl<S> SignalQueue<S> {
    pub(crate) fn new() -> Self {
        Self {
            inbox: SegQueue::new(),
            outbox: SegQueue::new(),
            wip: AtomicUsize::new(0),
        }
    }

    /// Enqueue `signal`; drain with `handle` unless another call is draining
    pub(crate) fn submit(&self, signal: S, mut handle: impl FnMut(S)) {
        self.inbox.push(signal);
        if self.wip.fetch_add(1, Ordering::AcqRel) != 0 {
            return;
        }

        let mut missed = 1;
        loop {
            while let Some(signal) = self.inbox.pop() {
                handle(signal);
            }
            let remaining = self.wip.fetch_sub(missed, Ordering::AcqRel) - missed;
            if remaining == 0 {
                break;
            }
            missed = remaining;
        }

        while let Some((subscription, n)) = self.outbox.pop() {
            subscription.request(n);
        }
    }

    /// Send `request(n)` to `subscription` once the current drain finishes
    pub(crate) fn defer_request(&self, subscription: Arc<dyn Subscription>, n: u64) {
        self.outbox.push((subscription, n));
    }

    /// Number of signals waiting to be handled
    #[cfg(test)]
    pub(crate) fn pending(&self) -> usize {
        self.inbox.len()
    }
}
