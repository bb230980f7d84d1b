//! Immutable description of a linear stage pipeline.
//!
//! A [`Graph`] is a persistent singly linked list of [`Stage`] nodes that
//! only ever grows at its tail. Appending returns a new graph sharing every
//! existing node, so one description can be extended in several directions
//! and run any number of times: running never touches the graph, it
//! instantiates fresh executor state from it.

use crate::buffer::OverflowPolicy;
use crate::collector::CollectorFactory;
use crate::error::{Result, StreamError};
use crate::protocol::{Element, Publisher, Subscriber, Value};
use std::fmt;
use std::sync::Arc;

/// Boxed iterator of erased elements
pub type ElementIter = Box<dyn Iterator<Item = Element> + Send>;
/// Produces a fresh element iterator for every run
pub type IterFactory = Arc<dyn Fn() -> ElementIter + Send + Sync>;
pub type MapFn = Arc<dyn Fn(Element) -> Result<Element> + Send + Sync>;
pub type PredicateFn = Arc<dyn Fn(&Element) -> Result<bool> + Send + Sync>;
pub type PeekFn = Arc<dyn Fn(&Element) -> Result<()> + Send + Sync>;
pub type FlatMapFn = Arc<dyn Fn(Element) -> Result<Graph> + Send + Sync>;
pub type FlatMapIterFn = Arc<dyn Fn(Element) -> Result<ElementIter> + Send + Sync>;
/// Per-run filter that remembers what it has seen
pub type SeenFilter = Box<dyn FnMut(&Element) -> Result<bool> + Send>;
pub type SeenFilterFactory = Arc<dyn Fn() -> SeenFilter + Send + Sync>;
pub type HookFn = Arc<dyn Fn() -> Result<()> + Send + Sync>;
pub type ErrorHookFn = Arc<dyn Fn(&StreamError) + Send + Sync>;
pub type ForEachFn = Arc<dyn Fn(Element) -> Result<()> + Send + Sync>;
/// Converts the first element (or its absence) into the terminal value
pub type FirstFn = Arc<dyn Fn(Option<Element>) -> Result<Value> + Send + Sync>;

/// A processor supplied from outside the engine, split into its two halves
#[derive(Clone)]
pub struct ExternalProcessor {
    pub subscriber: Arc<dyn Subscriber<Element>>,
    pub publisher: Arc<dyn Publisher<Element>>,
}

/// One node of a stage graph
#[derive(Clone)]
pub enum Stage {
    /// Finite or infinite sequence, re-enumerated on every run
    Of(IterFactory),
    /// Source that fails immediately
    Failed(StreamError),
    /// Source backed by an external publisher
    Publisher(Arc<dyn Publisher<Element>>),

    Map(MapFn),
    Filter(PredicateFn),
    FlatMap(FlatMapFn),
    FlatMapIter(FlatMapIterFn),
    Peek(PeekFn),
    Skip(u64),
    Limit(u64),
    DropWhile(PredicateFn),
    /// Passes elements while the predicate holds, then completes
    TakeWhile(PredicateFn),
    Distinct(SeenFilterFactory),
    /// Queue of `capacity` elements, or the engine default when `None`
    Buffer {
        capacity: Option<usize>,
        policy: OverflowPolicy,
    },
    OnComplete(HookFn),
    OnError(ErrorHookFn),
    /// Runs on completion, failure or downstream cancellation
    OnTerminate(HookFn),
    /// External processor spliced into the chain
    Processor(ExternalProcessor),

    Collect(CollectorFactory),
    ForEach(ForEachFn),
    FindFirst(FirstFn),
    /// Cancels as soon as it is subscribed
    Cancel,
    /// External subscriber receiving every signal
    Subscriber(Arc<dyn Subscriber<Element>>),
}

/// Where a stage may appear in a chain
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Source,
    Intermediate,
    Terminal,
}

impl Stage {
    pub fn name(&self) -> &'static str {
        match self {
            Stage::Of(_) => "of",
            Stage::Failed(_) => "failed",
            Stage::Publisher(_) => "publisher",
            Stage::Map(_) => "map",
            Stage::Filter(_) => "filter",
            Stage::FlatMap(_) => "flat_map",
            Stage::FlatMapIter(_) => "flat_map_iter",
            Stage::Peek(_) => "peek",
            Stage::Skip(_) => "skip",
            Stage::Limit(_) => "limit",
            Stage::DropWhile(_) => "drop_while",
            Stage::TakeWhile(_) => "take_while",
            Stage::Distinct(_) => "distinct",
            Stage::Buffer { .. } => "buffer",
            Stage::OnComplete(_) => "on_complete",
            Stage::OnError(_) => "on_error",
            Stage::OnTerminate(_) => "on_terminate",
            Stage::Processor(_) => "processor",
            Stage::Collect(_) => "collect",
            Stage::ForEach(_) => "for_each",
            Stage::FindFirst(_) => "find_first",
            Stage::Cancel => "cancel",
            Stage::Subscriber(_) => "subscriber",
        }
    }

    pub fn role(&self) -> Role {
        match self {
            Stage::Of(_) | Stage::Failed(_) | Stage::Publisher(_) => Role::Source,
            Stage::Collect(_)
            | Stage::ForEach(_)
            | Stage::FindFirst(_)
            | Stage::Cancel
            | Stage::Subscriber(_) => Role::Terminal,
            _ => Role::Intermediate,
        }
    }
}

impl fmt::Debug for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Stage::Skip(n) => write!(f, "skip({n})"),
            Stage::Limit(n) => write!(f, "limit({n})"),
            Stage::Buffer { capacity, policy } => write!(f, "buffer({capacity:?}, {policy:?})"),
            Stage::Failed(error) => write!(f, "failed({error})"),
            other => f.write_str(other.name()),
        }
    }
}

/// What a graph can be materialized as
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Shape {
    /// Source, no terminal
    Publisher,
    /// Neither source nor terminal
    Processor,
    /// Terminal, no source
    Subscriber,
    /// Source and terminal: runnable
    Closed,
}

struct GraphNode {
    stage: Stage,
    previous: Option<Arc<GraphNode>>,
}

/// Persistent, append-only chain of stages
#[derive(Clone, Default)]
pub struct Graph {
    tail: Option<Arc<GraphNode>>,
    len: usize,
}

impl Graph {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a graph from stages listed source first
    pub fn from_stages(stages: impl IntoIterator<Item = Stage>) -> Self {
        stages
            .into_iter()
            .fold(Graph::new(), |graph, stage| graph.append(stage))
    }

    /// A new graph with `stage` appended; `self` is left untouched
    pub fn append(&self, stage: Stage) -> Graph {
        Graph {
            tail: Some(Arc::new(GraphNode {
                stage,
                previous: self.tail.clone(),
            })),
            len: self.len + 1,
        }
    }

    /// A new graph with every stage of `other` appended after this one's
    pub fn concat(&self, other: &Graph) -> Graph {
        other
            .stages()
            .into_iter()
            .fold(self.clone(), |graph, stage| graph.append(stage.clone()))
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Stages in flow order, source first
    pub fn stages(&self) -> Vec<&Stage> {
        let mut stages = Vec::with_capacity(self.len);
        let mut node = self.tail.as_deref();
        while let Some(current) = node {
            stages.push(&current.stage);
            node = current.previous.as_deref();
        }
        stages.reverse();
        stages
    }

    /// Validate stage placement and classify the graph
    pub fn shape(&self) -> Result<Shape> {
        let stages = self.stages();
        let last = stages.len().saturating_sub(1);
        for (index, stage) in stages.iter().enumerate() {
            match stage.role() {
                Role::Source if index != 0 => {
                    return Err(StreamError::InvalidGraph(format!(
                        "source stage '{}' at position {index}",
                        stage.name()
                    )));
                }
                Role::Terminal if index != last => {
                    return Err(StreamError::InvalidGraph(format!(
                        "terminal stage '{}' at position {index} is followed by more stages",
                        stage.name()
                    )));
                }
                Role::Intermediate => {
                    if let Stage::Buffer {
                        capacity: Some(0), ..
                    } = stage
                    {
                        return Err(StreamError::InvalidGraph(
                            "buffer capacity must be greater than zero".into(),
                        ));
                    }
                }
                _ => {}
            }
        }

        let sourced = stages.first().is_some_and(|s| s.role() == Role::Source);
        let terminated = stages.last().is_some_and(|s| s.role() == Role::Terminal);
        Ok(match (sourced, terminated) {
            (true, true) => Shape::Closed,
            (true, false) => Shape::Publisher,
            (false, true) => Shape::Subscriber,
            (false, false) => Shape::Processor,
        })
    }

    /// Like [`Graph::shape`], but insists on a particular shape
    pub fn expect_shape(&self, expected: Shape) -> Result<()> {
        let shape = self.shape()?;
        if shape != expected {
            return Err(StreamError::InvalidGraph(format!(
                "expected a {expected:?} graph, got {shape:?}"
            )));
        }
        Ok(())
    }
}

impl fmt::Debug for Graph {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.stages()).finish()
    }
}
