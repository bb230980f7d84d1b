//! Terminal accumulation.
//!
//! A [`Collector`] describes how to fold a stream into one value: a supplier
//! for fresh per-run state, an accumulator, and a finisher. The engine only
//! sees the erased [`Accumulator`] produced for each run.

use crate::error::{Result, StreamError};
use crate::protocol::{Element, Value};
use std::marker::PhantomData;
use std::sync::Arc;

/// Erased per-run accumulation state
pub trait Accumulator: Send {
    fn accumulate(&mut self, item: Element) -> Result<()>;

    fn finish(self: Box<Self>) -> Result<Value>;
}

/// Creates a fresh accumulator for every run
pub type CollectorFactory = Arc<dyn Fn() -> Box<dyn Accumulator> + Send + Sync>;

type AccumulateFn<A, T> = Arc<dyn Fn(&mut A, T) -> Result<()> + Send + Sync>;
type FinishFn<A, R> = Arc<dyn Fn(A) -> Result<R> + Send + Sync>;

struct TypedAccumulator<T, A, R> {
    state: A,
    accumulate: AccumulateFn<A, T>,
    finish: FinishFn<A, R>,
}

impl<T, A, R> Accumulator for TypedAccumulator<T, A, R>
where
    T: 'static,
    A: Send + 'static,
    R: Send + Sync + 'static,
{
    fn accumulate(&mut self, item: Element) -> Result<()> {
        let item = item
            .downcast::<T>()
            .map_err(|_| StreamError::type_mismatch::<T>())?;
        (self.accumulate)(&mut self.state, *item)
    }

    fn finish(self: Box<Self>) -> Result<Value> {
        let this = *self;
        let result = (this.finish)(this.state)?;
        Ok(Box::new(result))
    }
}

/// Folds elements of type `T` into a result of type `R`
pub struct Collector<T, R> {
    factory: CollectorFactory,
    _marker: PhantomData<fn(T) -> R>,
}

impl<T, R> Clone for Collector<T, R> {
    fn clone(&self) -> Self {
        Self {
            factory: Arc::clone(&self.factory),
            _marker: PhantomData,
        }
    }
}

impl<T, R> Collector<T, R>
where
    T: Send + 'static,
    R: Send + Sync + 'static,
{
    /// Assemble a collector from a state supplier, an accumulator and a finisher
    pub fn of<A, S, F, G>(supplier: S, accumulate: F, finish: G) -> Self
    where
        A: Send + 'static,
        S: Fn() -> A + Send + Sync + 'static,
        F: Fn(&mut A, T) -> Result<()> + Send + Sync + 'static,
        G: Fn(A) -> Result<R> + Send + Sync + 'static,
    {
        let accumulate: AccumulateFn<A, T> = Arc::new(accumulate);
        let finish: FinishFn<A, R> = Arc::new(finish);
        let factory: CollectorFactory = Arc::new(move || {
            Box::new(TypedAccumulator {
                state: supplier(),
                accumulate: Arc::clone(&accumulate),
                finish: Arc::clone(&finish),
            }) as Box<dyn Accumulator>
        });
        Self {
            factory,
            _marker: PhantomData,
        }
    }

    pub(crate) fn factory(&self) -> CollectorFactory {
        Arc::clone(&self.factory)
    }
}

impl<T> Collector<T, Vec<T>>
where
    T: Send + Sync + 'static,
{
    /// Collect every element in arrival order
    pub fn to_list() -> Self {
        Collector::of(
            Vec::new,
            |list: &mut Vec<T>, item| {
                list.push(item);
                Ok(())
            },
            Ok,
        )
    }
}

impl<T> Collector<T, u64>
where
    T: Send + 'static,
{
    pub fn counting() -> Self {
        Collector::of(
            || 0u64,
            |count: &mut u64, _item: T| {
                *count += 1;
                Ok(())
            },
            Ok,
        )
    }
}

impl<T, R> Collector<T, R>
where
    T: Send + 'static,
    R: Clone + Send + Sync + 'static,
{
    /// Fold from `identity`; an empty stream yields `identity`
    pub fn folding<F>(identity: R, f: F) -> Self
    where
        F: Fn(R, T) -> R + Send + Sync + 'static,
    {
        Collector::of(
            move || Some(identity.clone()),
            move |acc: &mut Option<R>, item| {
                if let Some(current) = acc.take() {
                    *acc = Some(f(current, item));
                }
                Ok(())
            },
            |acc| acc.ok_or_else(|| StreamError::msg("fold state lost")),
        )
    }
}

impl<T> Collector<T, T>
where
    T: Send + Sync + 'static,
{
    /// Combine elements pairwise; an empty stream fails with [`StreamError::EmptyStream`]
    pub fn reducing<F>(f: F) -> Self
    where
        F: Fn(T, T) -> T + Send + Sync + 'static,
    {
        Collector::of(
            || None,
            move |acc: &mut Option<T>, item| {
                *acc = Some(match acc.take() {
                    Some(current) => f(current, item),
                    None => item,
                });
                Ok(())
            },
            |acc| acc.ok_or(StreamError::EmptyStream),
        )
    }
}
