//! Typed, append-only construction of stage graphs.
//!
//! Every builder call returns a new value over a shared persistent
//! [`Graph`]; nothing is ever mutated, so a partially built pipeline can be
//! extended in several directions and each result run independently.
//!
//! ```
//! use reactive_pipeline::{Engine, ReactiveStreams};
//!
//! let engine = Engine::default();
//! let evens = ReactiveStreams::of(1..=10)
//!     .filter(|n| n % 2 == 0)
//!     .map(|n| n * 10)
//!     .to_list();
//! assert_eq!(evens.run(&engine).wait().unwrap(), &vec![20, 40, 60, 80, 100]);
//! ```

use crate::adapters::{
    ErasedProcessor, ErasedPublisher, ErasingSubscriber, TypedProcessor, TypedPublisher,
    TypedSubscriber,
};
use crate::buffer::OverflowPolicy;
use crate::collector::Collector;
use crate::completion::PipelineResult;
use crate::error::{Result, StreamError};
use crate::graph::{
    ElementIter, ErrorHookFn, ExternalProcessor, FirstFn, FlatMapFn, FlatMapIterFn, ForEachFn,
    Graph, HookFn, MapFn, PeekFn, PredicateFn, SeenFilter, SeenFilterFactory, Stage,
};
use crate::pipeline::Engine;
use crate::protocol::{Element, Processor, Publisher, Subscriber, Value};
use std::collections::HashSet;
use std::fmt;
use std::hash::Hash;
use std::marker::PhantomData;
use std::sync::Arc;

/// Shape marker: the graph starts with a source
#[derive(Debug, Clone, Copy)]
pub struct Sourced;

/// Shape marker: the graph expects elements of type `In` from outside
pub struct Inlet<In>(PhantomData<fn(In)>);

/// A graph under construction whose current output type is `T`
pub struct Flow<S, T> {
    graph: Graph,
    _marker: PhantomData<(fn() -> S, fn() -> T)>,
}

/// Builds a publisher of `T`
pub type PublisherBuilder<T> = Flow<Sourced, T>;
/// Builds a processor from `In` to `T`
pub type ProcessorBuilder<In, T> = Flow<Inlet<In>, T>;

/// A graph that ends in a terminal producing `R`
pub struct Terminated<S, R> {
    graph: Graph,
    _marker: PhantomData<(fn() -> S, fn() -> R)>,
}

/// A closed graph, ready to run
pub type CompletionRunner<R> = Terminated<Sourced, R>;
/// A subscriber of `In` whose run produces `R`
pub type SubscriberBuilder<In, R> = Terminated<Inlet<In>, R>;

impl<S, T> Clone for Flow<S, T> {
    fn clone(&self) -> Self {
        Self {
            graph: self.graph.clone(),
            _marker: PhantomData,
        }
    }
}

impl<S, T> fmt::Debug for Flow<S, T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Flow").field(&self.graph).finish()
    }
}

impl<S, R> Clone for Terminated<S, R> {
    fn clone(&self) -> Self {
        Self {
            graph: self.graph.clone(),
            _marker: PhantomData,
        }
    }
}

impl<S, R> fmt::Debug for Terminated<S, R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Terminated").field(&self.graph).finish()
    }
}

fn downcast<T: 'static>(item: Element) -> Result<T> {
    item.downcast::<T>()
        .map(|item| *item)
        .map_err(|_| StreamError::type_mismatch::<T>())
}

fn downcast_ref<T: 'static>(item: &Element) -> Result<&T> {
    item.downcast_ref::<T>()
        .ok_or_else(StreamError::type_mismatch::<T>)
}

fn source<T, I>(iterable: I) -> Stage
where
    T: Send + 'static,
    I: IntoIterator<Item = T> + Clone + Send + Sync + 'static,
    I::IntoIter: Send + 'static,
{
    Stage::Of(Arc::new(move || {
        Box::new(iterable.clone().into_iter().map(|item| Box::new(item) as Element)) as ElementIter
    }))
}

/// Entry points for building graphs
pub struct ReactiveStreams;

impl ReactiveStreams {
    /// Publish the items of `iterable`, re-enumerated on every run
    pub fn of<T, I>(iterable: I) -> PublisherBuilder<T>
    where
        T: Send + 'static,
        I: IntoIterator<Item = T> + Clone + Send + Sync + 'static,
        I::IntoIter: Send + 'static,
    {
        Flow::wrap(Graph::new().append(source(iterable)))
    }

    pub fn empty<T: Send + 'static>() -> PublisherBuilder<T> {
        Flow::wrap(Graph::new().append(source(std::iter::empty::<T>())))
    }

    /// A publisher that fails with `error` as soon as it is subscribed
    pub fn failed<T: Send + 'static>(error: StreamError) -> PublisherBuilder<T> {
        Flow::wrap(Graph::new().append(Stage::Failed(error)))
    }

    /// Infinite publisher calling `supplier` for every element
    pub fn generate<T, F>(supplier: F) -> PublisherBuilder<T>
    where
        T: Send + 'static,
        F: Fn() -> T + Send + Sync + 'static,
    {
        let supplier = Arc::new(supplier);
        let stage = Stage::Of(Arc::new(move || {
            let supplier = Arc::clone(&supplier);
            Box::new(std::iter::repeat_with(move || Box::new(supplier()) as Element)) as ElementIter
        }));
        Flow::wrap(Graph::new().append(stage))
    }

    /// Infinite publisher of `seed`, `f(seed)`, `f(f(seed))`, ...
    pub fn iterate<T, F>(seed: T, f: F) -> PublisherBuilder<T>
    where
        T: Clone + Send + Sync + 'static,
        F: Fn(&T) -> T + Send + Sync + 'static,
    {
        let f = Arc::new(f);
        let stage = Stage::Of(Arc::new(move || {
            let f = Arc::clone(&f);
            let values = std::iter::successors(Some(seed.clone()), move |current| Some(f(current)));
            Box::new(values.map(|value| Box::new(value) as Element)) as ElementIter
        }));
        Flow::wrap(Graph::new().append(stage))
    }

    /// Use an external publisher as the source
    pub fn from_publisher<T: Send + 'static>(
        publisher: Arc<dyn Publisher<T>>,
    ) -> PublisherBuilder<T> {
        let erased: Arc<dyn Publisher<Element>> = Arc::new(ErasedPublisher::new(publisher));
        Flow::wrap(Graph::new().append(Stage::Publisher(erased)))
    }

    /// An empty processor graph: elements pass through unchanged
    pub fn builder<T: Send + 'static>() -> ProcessorBuilder<T, T> {
        Flow::wrap(Graph::new())
    }

    /// Use an external processor as a processor graph
    pub fn from_processor<T, R>(processor: Arc<dyn Processor<T, R>>) -> ProcessorBuilder<T, R>
    where
        T: Send + 'static,
        R: Send + 'static,
    {
        ReactiveStreams::builder::<T>().via_processor(processor)
    }

    /// Use an external subscriber as a subscriber graph
    pub fn from_subscriber<T: Send + 'static>(
        subscriber: Arc<dyn Subscriber<T>>,
    ) -> SubscriberBuilder<T, ()> {
        ReactiveStreams::builder::<T>().to_subscriber(subscriber)
    }
}

impl<S, T: Send + 'static> Flow<S, T> {
    fn wrap(graph: Graph) -> Self {
        Self {
            graph,
            _marker: PhantomData,
        }
    }

    fn then<R>(&self, stage: Stage) -> Flow<S, R> {
        Flow {
            graph: self.graph.append(stage),
            _marker: PhantomData,
        }
    }

    fn terminate<R>(&self, stage: Stage) -> Terminated<S, R> {
        Terminated {
            graph: self.graph.append(stage),
            _marker: PhantomData,
        }
    }

    /// The erased description built so far
    pub fn graph(&self) -> &Graph {
        &self.graph
    }

    pub fn map<R, F>(&self, f: F) -> Flow<S, R>
    where
        R: Send + 'static,
        F: Fn(T) -> R + Send + Sync + 'static,
    {
        let map: MapFn = Arc::new(move |item: Element| -> Result<Element> {
            Ok(Box::new(f(downcast::<T>(item)?)) as Element)
        });
        self.then(Stage::Map(map))
    }

    /// Map with a fallible function; an error fails the stream
    pub fn try_map<R, E, F>(&self, f: F) -> Flow<S, R>
    where
        R: Send + 'static,
        E: std::error::Error + Send + Sync + 'static,
        F: Fn(T) -> std::result::Result<R, E> + Send + Sync + 'static,
    {
        let map: MapFn = Arc::new(move |item: Element| -> Result<Element> {
            let mapped = f(downcast::<T>(item)?).map_err(StreamError::stage)?;
            Ok(Box::new(mapped) as Element)
        });
        self.then(Stage::Map(map))
    }

    pub fn filter<F>(&self, predicate: F) -> Flow<S, T>
    where
        F: Fn(&T) -> bool + Send + Sync + 'static,
    {
        self.then(Stage::Filter(predicate_fn(predicate)))
    }

    pub fn try_filter<E, F>(&self, predicate: F) -> Flow<S, T>
    where
        E: std::error::Error + Send + Sync + 'static,
        F: Fn(&T) -> std::result::Result<bool, E> + Send + Sync + 'static,
    {
        let predicate: PredicateFn = Arc::new(move |item: &Element| -> Result<bool> {
            predicate(downcast_ref::<T>(item)?).map_err(StreamError::stage)
        });
        self.then(Stage::Filter(predicate))
    }

    /// Replace every element with the elements of a nested publisher, in order
    pub fn flat_map<R, F>(&self, f: F) -> Flow<S, R>
    where
        R: Send + 'static,
        F: Fn(T) -> PublisherBuilder<R> + Send + Sync + 'static,
    {
        let flat_map: FlatMapFn =
            Arc::new(move |item: Element| -> Result<Graph> { Ok(f(downcast::<T>(item)?).graph) });
        self.then(Stage::FlatMap(flat_map))
    }

    /// Replace every element with the items of an iterator, in order
    pub fn flat_map_iter<R, I, F>(&self, f: F) -> Flow<S, R>
    where
        R: Send + 'static,
        I: IntoIterator<Item = R>,
        I::IntoIter: Send + 'static,
        F: Fn(T) -> I + Send + Sync + 'static,
    {
        let flat_map: FlatMapIterFn = Arc::new(move |item: Element| -> Result<ElementIter> {
            let items = f(downcast::<T>(item)?).into_iter();
            Ok(Box::new(items.map(|item| Box::new(item) as Element)) as ElementIter)
        });
        self.then(Stage::FlatMapIter(flat_map))
    }

    /// Observe every element without changing the stream
    pub fn peek<F>(&self, f: F) -> Flow<S, T>
    where
        F: Fn(&T) + Send + Sync + 'static,
    {
        let peek: PeekFn = Arc::new(move |item: &Element| -> Result<()> {
            f(downcast_ref::<T>(item)?);
            Ok(())
        });
        self.then(Stage::Peek(peek))
    }

    pub fn skip(&self, n: u64) -> Flow<S, T> {
        self.then(Stage::Skip(n))
    }

    /// Pass at most `n` elements, then cancel upstream and complete
    pub fn limit(&self, n: u64) -> Flow<S, T> {
        self.then(Stage::Limit(n))
    }

    pub fn drop_while<F>(&self, predicate: F) -> Flow<S, T>
    where
        F: Fn(&T) -> bool + Send + Sync + 'static,
    {
        self.then(Stage::DropWhile(predicate_fn(predicate)))
    }

    pub fn take_while<F>(&self, predicate: F) -> Flow<S, T>
    where
        F: Fn(&T) -> bool + Send + Sync + 'static,
    {
        self.then(Stage::TakeWhile(predicate_fn(predicate)))
    }

    /// Drop elements equal to one already passed in this run
    pub fn distinct(&self) -> Flow<S, T>
    where
        T: Hash + Eq + Clone,
    {
        let factory: SeenFilterFactory = Arc::new(|| {
            let mut seen = HashSet::<T>::new();
            Box::new(move |item: &Element| -> Result<bool> {
                Ok(seen.insert(downcast_ref::<T>(item)?.clone()))
            }) as SeenFilter
        });
        self.then(Stage::Distinct(factory))
    }

    /// Buffer with the engine's default capacity and backpressure
    pub fn buffer(&self) -> Flow<S, T> {
        self.then(Stage::Buffer {
            capacity: None,
            policy: OverflowPolicy::Backpressure,
        })
    }

    pub fn buffer_with(&self, capacity: usize, policy: OverflowPolicy) -> Flow<S, T> {
        self.then(Stage::Buffer {
            capacity: Some(capacity),
            policy,
        })
    }

    /// Run `hook` when the stream completes; a hook error fails the stream instead
    pub fn on_complete<F>(&self, hook: F) -> Flow<S, T>
    where
        F: Fn() -> Result<()> + Send + Sync + 'static,
    {
        let hook: HookFn = Arc::new(hook);
        self.then(Stage::OnComplete(hook))
    }

    pub fn on_error<F>(&self, hook: F) -> Flow<S, T>
    where
        F: Fn(&StreamError) + Send + Sync + 'static,
    {
        let hook: ErrorHookFn = Arc::new(hook);
        self.then(Stage::OnError(hook))
    }

    /// Run `hook` on completion, failure or downstream cancellation
    pub fn on_terminate<F>(&self, hook: F) -> Flow<S, T>
    where
        F: Fn() + Send + Sync + 'static,
    {
        let hook: HookFn = Arc::new(move || -> Result<()> {
            hook();
            Ok(())
        });
        self.then(Stage::OnTerminate(hook))
    }

    /// Append every stage of a processor graph
    pub fn via<R>(&self, processor: &ProcessorBuilder<T, R>) -> Flow<S, R> {
        Flow {
            graph: self.graph.concat(&processor.graph),
            _marker: PhantomData,
        }
    }

    /// Splice an external processor into the chain
    pub fn via_processor<R: Send + 'static>(
        &self,
        processor: Arc<dyn Processor<T, R>>,
    ) -> Flow<S, R> {
        let erased = Arc::new(ErasedProcessor::new(processor));
        self.then(Stage::Processor(ExternalProcessor {
            subscriber: erased.clone(),
            publisher: erased,
        }))
    }

    pub fn to_list(&self) -> Terminated<S, Vec<T>>
    where
        T: Sync,
    {
        self.collect(Collector::to_list())
    }

    pub fn collect<R: Send + Sync + 'static>(
        &self,
        collector: Collector<T, R>,
    ) -> Terminated<S, R> {
        self.terminate(Stage::Collect(collector.factory()))
    }

    /// Fold from `identity`; an empty stream yields `identity`
    pub fn fold<R, F>(&self, identity: R, f: F) -> Terminated<S, R>
    where
        R: Clone + Send + Sync + 'static,
        F: Fn(R, T) -> R + Send + Sync + 'static,
    {
        self.collect(Collector::folding(identity, f))
    }

    /// Combine elements pairwise; fails with [`StreamError::EmptyStream`] when empty
    pub fn reduce<F>(&self, f: F) -> Terminated<S, T>
    where
        T: Sync,
        F: Fn(T, T) -> T + Send + Sync + 'static,
    {
        self.collect(Collector::reducing(f))
    }

    pub fn count(&self) -> Terminated<S, u64> {
        self.collect(Collector::counting())
    }

    /// The first element, or `None` for an empty stream
    pub fn find_first(&self) -> Terminated<S, Option<T>>
    where
        T: Sync,
    {
        let first: FirstFn = Arc::new(|item: Option<Element>| -> Result<Value> {
            let first = item.map(downcast::<T>).transpose()?;
            Ok(Box::new(first) as Value)
        });
        self.terminate(Stage::FindFirst(first))
    }

    pub fn for_each<F>(&self, f: F) -> Terminated<S, ()>
    where
        F: Fn(T) + Send + Sync + 'static,
    {
        let for_each: ForEachFn = Arc::new(move |item: Element| -> Result<()> {
            f(downcast::<T>(item)?);
            Ok(())
        });
        self.terminate(Stage::ForEach(for_each))
    }

    /// Consume and discard every element
    pub fn ignore(&self) -> Terminated<S, ()> {
        let for_each: ForEachFn = Arc::new(|_item: Element| -> Result<()> { Ok(()) });
        self.terminate(Stage::ForEach(for_each))
    }

    /// Cancel the upstream as soon as it is subscribed
    pub fn cancel(&self) -> Terminated<S, ()> {
        self.terminate(Stage::Cancel)
    }

    /// Hand every signal to an external subscriber
    pub fn to_subscriber(&self, subscriber: Arc<dyn Subscriber<T>>) -> Terminated<S, ()> {
        let erased: Arc<dyn Subscriber<Element>> = Arc::new(TypedSubscriber::new(subscriber));
        self.terminate(Stage::Subscriber(erased))
    }

    /// Append every stage of a subscriber graph
    pub fn to<R>(&self, subscriber: &SubscriberBuilder<T, R>) -> Terminated<S, R> {
        Terminated {
            graph: self.graph.concat(&subscriber.graph),
            _marker: PhantomData,
        }
    }
}

fn predicate_fn<T, F>(predicate: F) -> PredicateFn
where
    T: 'static,
    F: Fn(&T) -> bool + Send + Sync + 'static,
{
    Arc::new(move |item: &Element| -> Result<bool> { Ok(predicate(downcast_ref::<T>(item)?)) })
}

impl<T: Send + 'static> PublisherBuilder<T> {
    /// Materialize as a publisher of `T`
    pub fn build_rs(&self, engine: &Engine) -> Result<Arc<dyn Publisher<T>>> {
        let erased = engine.build_publisher(&self.graph)?;
        let publisher: Arc<dyn Publisher<T>> = Arc::new(TypedPublisher::new(erased));
        Ok(publisher)
    }
}

impl<In: Send + 'static, T: Send + 'static> ProcessorBuilder<In, T> {
    /// Materialize as a processor from `In` to `T`
    pub fn build_rs(&self, engine: &Engine) -> Result<Arc<dyn Processor<In, T>>> {
        let erased = engine.build_processor(&self.graph)?;
        let processor: Arc<dyn Processor<In, T>> = Arc::new(TypedProcessor::<In, T>::new(erased));
        Ok(processor)
    }
}

impl<S, R> Terminated<S, R> {
    pub fn graph(&self) -> &Graph {
        &self.graph
    }
}

impl<R: 'static> CompletionRunner<R> {
    /// Run the closed graph once
    pub fn run(&self, engine: &Engine) -> PipelineResult<R> {
        engine.run(&self.graph)
    }
}

/// A materialized subscriber together with the outcome of the run it drives
pub struct CompletionSubscriber<In, R> {
    pub subscriber: Arc<dyn Subscriber<In>>,
    pub result: PipelineResult<R>,
}

impl<In: Send + 'static, R: 'static> SubscriberBuilder<In, R> {
    pub fn build(&self, engine: &Engine) -> Result<CompletionSubscriber<In, R>> {
        let (erased, result) = engine.build_subscriber::<R>(&self.graph)?;
        let subscriber: Arc<dyn Subscriber<In>> =
            Arc::new(ErasingSubscriber::<In>::new(erased));
        Ok(CompletionSubscriber { subscriber, result })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{ManualPublisher, ManualSubscriber};

    #[test]
    fn test_builder_calls_do_not_mutate() {
        let base = ReactiveStreams::of(vec![1, 2, 3]);
        let skipped = base.skip(1);
        let limited = base.limit(1);
        assert_eq!(base.graph().len(), 1);
        assert_eq!(skipped.graph().len(), 2);
        assert_eq!(format!("{limited:?}"), "Flow([of, limit(1)])");
    }

    #[test]
    fn test_processor_builder_shape() {
        let doubler = ReactiveStreams::builder::<i32>().map(|n| n * 2);
        assert_eq!(
            doubler.graph().shape().unwrap(),
            crate::graph::Shape::Processor
        );
        let engine = Engine::default();
        let result = ReactiveStreams::of(vec![1, 2]).via(&doubler).to_list().run(&engine);
        assert_eq!(result.wait().unwrap(), &vec![2, 4]);
    }

    #[test]
    fn test_peek_on_mislabeled_element_fails_run() {
        let engine = Engine::default();
        let seen = Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let counter = Arc::clone(&seen);
        let mislabeled: PublisherBuilder<String> =
            Flow::wrap(ReactiveStreams::of(vec![1i32]).graph().clone());
        let result = mislabeled
            .peek(move |_: &String| {
                counter.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            })
            .to_list()
            .run(&engine);
        assert!(matches!(result.wait(), Err(StreamError::TypeMismatch { .. })));
        assert_eq!(seen.load(std::sync::atomic::Ordering::SeqCst), 0);
    }

    #[test]
    fn test_empty_publisher_completes() {
        let engine = Engine::default();
        // Neither Clone nor Sync
        struct Unshared(#[allow(dead_code)] std::cell::Cell<u8>);
        let result = ReactiveStreams::empty::<Unshared>().count().run(&engine);
        assert_eq!(result.wait().unwrap(), &0);
    }

    #[test]
    fn test_build_rs_publisher_is_typed() {
        let engine = Engine::default();
        let publisher = ReactiveStreams::of(vec!["a", "b"]).build_rs(&engine).unwrap();
        let probe = ManualSubscriber::<&'static str>::new();
        publisher.subscribe(probe.clone());
        probe.request(2);
        assert_eq!(probe.take_items(), vec!["a", "b"]);
        assert!(probe.is_completed());
    }

    #[test]
    fn test_subscriber_builder_collects() {
        let engine = Engine::default();
        let built = ReactiveStreams::builder::<i32>()
            .filter(|n| *n > 1)
            .to_list()
            .build(&engine)
            .unwrap();
        let source = ManualPublisher::<i32>::new();
        source.subscribe(built.subscriber.clone());
        for n in 0..4 {
            source.emit(n);
        }
        source.complete();
        assert_eq!(built.result.wait().unwrap(), &vec![2, 3]);
    }
}
