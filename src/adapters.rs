//! Bridges between typed protocol endpoints and the engine's erased ones.
//!
//! Inside the engine every element is an [`Element`]. These wrappers box
//! elements on the way in and downcast them on the way out; a downcast that
//! fails cancels upstream and surfaces [`StreamError::TypeMismatch`].

use crate::error::StreamError;
use crate::protocol::{Element, Processor, Publisher, Subscriber, Subscription};
use parking_lot::Mutex;
use std::marker::PhantomData;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Presents a typed subscriber to an erased publisher
pub(crate) struct TypedSubscriber<T> {
    inner: Arc<dyn Subscriber<T>>,
    guard: DowncastGuard,
}

impl<T: Send + 'static> TypedSubscriber<T> {
    pub(crate) fn new(inner: Arc<dyn Subscriber<T>>) -> Self {
        Self {
            inner,
            guard: DowncastGuard::default(),
        }
    }
}

impl<T: Send + 'static> Subscriber<Element> for TypedSubscriber<T> {
    fn on_subscribe(&self, subscription: Arc<dyn Subscription>) {
        self.guard.remember(&subscription);
        self.inner.on_subscribe(subscription);
    }

    fn on_next(&self, item: Element) {
        match self.guard.admit::<T>(item) {
            Ok(Some(item)) => self.inner.on_next(item),
            Ok(None) => {}
            Err(error) => self.inner.on_error(error),
        }
    }

    fn on_error(&self, error: StreamError) {
        if !self.guard.has_failed() {
            self.inner.on_error(error);
        }
    }

    fn on_complete(&self) {
        if !self.guard.has_failed() {
            self.inner.on_complete();
        }
    }
}

/// Presents an erased subscriber to a typed publisher
pub(crate) struct ErasingSubscriber<T> {
    inner: Arc<dyn Subscriber<Element>>,
    _marker: PhantomData<fn(T)>,
}

impl<T> ErasingSubscriber<T> {
    pub(crate) fn new(inner: Arc<dyn Subscriber<Element>>) -> Self {
        Self {
            inner,
            _marker: PhantomData,
        }
    }
}

impl<T: Send + 'static> Subscriber<T> for ErasingSubscriber<T> {
    fn on_subscribe(&self, subscription: Arc<dyn Subscription>) {
        self.inner.on_subscribe(subscription);
    }

    fn on_next(&self, item: T) {
        self.inner.on_next(Box::new(item));
    }

    fn on_error(&self, error: StreamError) {
        self.inner.on_error(error);
    }

    fn on_complete(&self) {
        self.inner.on_complete();
    }
}

/// A typed publisher usable as a graph source
pub(crate) struct ErasedPublisher<T> {
    inner: Arc<dyn Publisher<T>>,
}

impl<T> ErasedPublisher<T> {
    pub(crate) fn new(inner: Arc<dyn Publisher<T>>) -> Self {
        Self { inner }
    }
}

impl<T: Send + 'static> Publisher<Element> for ErasedPublisher<T> {
    fn subscribe(&self, subscriber: Arc<dyn Subscriber<Element>>) {
        self.inner
            .subscribe(Arc::new(ErasingSubscriber::<T>::new(subscriber)));
    }
}

/// An erased publisher handed out with its element type restored
pub(crate) struct TypedPublisher<T> {
    inner: Arc<dyn Publisher<Element>>,
    _marker: PhantomData<fn() -> T>,
}

impl<T> TypedPublisher<T> {
    pub(crate) fn new(inner: Arc<dyn Publisher<Element>>) -> Self {
        Self {
            inner,
            _marker: PhantomData,
        }
    }
}

impl<T: Send + 'static> Publisher<T> for TypedPublisher<T> {
    fn subscribe(&self, subscriber: Arc<dyn Subscriber<T>>) {
        self.inner.subscribe(Arc::new(TypedSubscriber::new(subscriber)));
    }
}

/// A typed processor spliced into an erased chain
pub(crate) struct ErasedProcessor<T, R> {
    inner: Arc<dyn Processor<T, R>>,
    guard: DowncastGuard,
}

impl<T, R> ErasedProcessor<T, R> {
    pub(crate) fn new(inner: Arc<dyn Processor<T, R>>) -> Self {
        Self {
            inner,
            guard: DowncastGuard::default(),
        }
    }
}

impl<T: Send + 'static, R: Send + 'static> Subscriber<Element> for ErasedProcessor<T, R> {
    fn on_subscribe(&self, subscription: Arc<dyn Subscription>) {
        self.guard.remember(&subscription);
        self.inner.on_subscribe(subscription);
    }

    fn on_next(&self, item: Element) {
        match self.guard.admit::<T>(item) {
            Ok(Some(item)) => self.inner.on_next(item),
            Ok(None) => {}
            Err(error) => self.inner.on_error(error),
        }
    }

    fn on_error(&self, error: StreamError) {
        if !self.guard.has_failed() {
            self.inner.on_error(error);
        }
    }

    fn on_complete(&self) {
        if !self.guard.has_failed() {
            self.inner.on_complete();
        }
    }
}

impl<T: Send + 'static, R: Send + 'static> Publisher<Element> for ErasedProcessor<T, R> {
    fn subscribe(&self, subscriber: Arc<dyn Subscriber<Element>>) {
        self.inner
            .subscribe(Arc::new(ErasingSubscriber::<R>::new(subscriber)));
    }
}

/// An erased processor handed out with its element types restored
pub(crate) struct TypedProcessor<T, R> {
    inner: Arc<dyn Processor<Element, Element>>,
    _marker: PhantomData<fn(T) -> R>,
}

impl<T, R> TypedProcessor<T, R> {
    pub(crate) fn new(inner: Arc<dyn Processor<Element, Element>>) -> Self {
        Self {
            inner,
            _marker: PhantomData,
        }
    }
}

impl<T: Send + 'static, R> Subscriber<T> for TypedProcessor<T, R> {
    fn on_subscribe(&self, subscription: Arc<dyn Subscription>) {
        self.inner.on_subscribe(subscription);
    }

    fn on_next(&self, item: T) {
        self.inner.on_next(Box::new(item));
    }

    fn on_error(&self, error: StreamError) {
        self.inner.on_error(error);
    }

    fn on_complete(&self) {
        self.inner.on_complete();
    }
}

impl<T, R: Send + 'static> Publisher<R> for TypedProcessor<T, R> {
    fn subscribe(&self, subscriber: Arc<dyn Subscriber<R>>) {
        self.inner.subscribe(Arc::new(TypedSubscriber::new(subscriber)));
    }
}

/// Downcasts incoming elements; on the first mismatch cancels upstream
#[derive(Default)]
struct DowncastGuard {
    upstream: Mutex<Option<Arc<dyn Subscription>>>,
    failed: AtomicBool,
}

impl DowncastGuard {
    fn remember(&self, subscription: &Arc<dyn Subscription>) {
        *self.upstream.lock() = Some(Arc::clone(subscription));
    }

    fn has_failed(&self) -> bool {
        self.failed.load(Ordering::Acquire)
    }

    /// `Ok(None)` once failed; `Err` exactly once, on the first mismatch
    fn admit<T: 'static>(&self, item: Element) -> Result<Option<T>, StreamError> {
        if self.has_failed() {
            return Ok(None);
        }
        match item.downcast::<T>() {
            Ok(item) => Ok(Some(*item)),
            Err(_) => {
                self.failed.store(true, Ordering::Release);
                let upstream = self.upstream.lock().take();
                if let Some(upstream) = upstream {
                    upstream.cancel();
                }
                Err(StreamError::type_mismatch::<T>())
            }
        }
    }
}
