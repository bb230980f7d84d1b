//! The publish/subscribe contract every stage speaks.
//!
//! A [`Publisher`] hands each [`Subscriber`] exactly one [`Subscription`].
//! The subscriber grants demand through [`Subscription::request`]; the
//! publisher never calls [`Subscriber::on_next`] more often than the demand
//! granted so far, never calls it concurrently, and ends with at most one of
//! [`Subscriber::on_error`] or [`Subscriber::on_complete`].

use crate::error::StreamError;
use std::any::Any;
use std::sync::Arc;

/// An element travelling through an erased stage chain
pub type Element = Box<dyn Any + Send>;

/// A terminal value produced by an erased stage chain
pub type Value = Box<dyn Any + Send + Sync>;

/// Link between one subscriber and one publisher
pub trait Subscription: Send + Sync {
    /// Grant `n` more elements. Zero is a protocol violation.
    fn request(&self, n: u64);

    /// Stop the flow. Idempotent.
    fn cancel(&self);
}

/// Consumer side of the protocol
pub trait Subscriber<T>: Send + Sync {
    fn on_subscribe(&self, subscription: Arc<dyn Subscription>);

    fn on_next(&self, item: T);

    fn on_error(&self, error: StreamError);

    fn on_complete(&self);
}

/// Producer side of the protocol
pub trait Publisher<T>: Send + Sync {
    fn subscribe(&self, subscriber: Arc<dyn Subscriber<T>>);
}

/// A stage that is both a subscriber of `T` and a publisher of `R`
pub trait Processor<T, R>: Subscriber<T> + Publisher<R> {}

impl<T, R, P> Processor<T, R> for P where P: Subscriber<T> + Publisher<R> {}

/// Subscription handed out when a subscribe call is rejected
#[derive(Debug, Default, Clone, Copy)]
pub struct CancelledSubscription;

impl Subscription for CancelledSubscription {
    fn request(&self, _n: u64) {}

    fn cancel(&self) {}
}

/// Reject a subscriber: hand it an inert subscription, then fail it
pub(crate) fn reject<T>(subscriber: &Arc<dyn Subscriber<T>>, error: StreamError) {
    subscriber.on_subscribe(Arc::new(CancelledSubscription));
    subscriber.on_error(error);
}
