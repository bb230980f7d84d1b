//! Turns stage graphs into running executor chains.
//!
//! The [`Engine`] instantiates one executor per graph node, links adjacent
//! executors source first, and lets the terminal stage start demand. Nothing
//! flows until the terminal requests, so linking order never loses elements.

use crate::completion::{PipelineResult, RunCell};
use crate::config::{EngineConfig, Execution};
use crate::error::{Result, StreamError};
use crate::graph::{Graph, Shape, Stage};
use crate::metrics::StageMetrics;
use crate::processor::ProcessorStage;
use crate::protocol::{Element, Processor, Publisher, Subscriber, Subscription};
use crate::sink::SinkStage;
use crate::source::SourceStage;
use crate::stage::Operator;
use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;
use tracing::{debug, error, warn};

/// Runs stage graphs
pub struct Engine {
    config: Arc<EngineConfig>,
    next_run: AtomicU64,
}

impl Engine {
    /// Create an engine with a validated configuration
    pub fn new(config: EngineConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            config: Arc::new(config),
            next_run: AtomicU64::new(1),
        })
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    fn next_run_id(&self) -> u64 {
        self.next_run.fetch_add(1, Ordering::Relaxed)
    }

    /// Run a closed graph once
    ///
    /// Every call builds fresh executor state, so the same graph can be run
    /// any number of times. A graph that is not closed resolves the result
    /// with [`StreamError::InvalidGraph`].
    pub fn run<R: Any>(&self, graph: &Graph) -> PipelineResult<R> {
        let cell = RunCell::new(self.next_run_id());
        let result = PipelineResult::new(Arc::clone(&cell));

        match self.config.execution {
            Execution::Inline => start(graph, &self.config, cell),
            Execution::Spawned => {
                let graph = graph.clone();
                let config = Arc::clone(&self.config);
                let worker_cell = Arc::clone(&cell);
                let spawned = thread::Builder::new()
                    .name(format!("{}-{}", config.thread_name, cell.id()))
                    .spawn(move || {
                        let cell = Arc::clone(&worker_cell);
                        let run = AssertUnwindSafe(|| start(&graph, &config, cell));
                        if let Err(payload) = panic::catch_unwind(run) {
                            let message = panic_message(&*payload);
                            error!(run = worker_cell.id(), %message, "run thread panicked");
                            worker_cell.resolve(Err(StreamError::msg(format!(
                                "run panicked: {message}"
                            ))));
                        }
                    });
                if let Err(e) = spawned {
                    warn!(run = cell.id(), error = %e, "failed to spawn run thread");
                    cell.resolve(Err(StreamError::stage(e)));
                }
            }
        }
        result
    }

    /// Materialize a graph that has a source and no terminal
    pub fn build_publisher(&self, graph: &Graph) -> Result<Arc<dyn Publisher<Element>>> {
        materialize_publisher(graph, &self.config, None)
    }

    /// Materialize a graph with neither source nor terminal
    pub fn build_processor(&self, graph: &Graph) -> Result<Arc<dyn Processor<Element, Element>>> {
        graph.expect_shape(Shape::Processor)?;
        let inlet = ProcessorStage::new(
            "inlet",
            Operator::identity(),
            Arc::clone(&self.config),
            StageMetrics::new("inlet"),
        );
        let stages = graph.stages();
        let outlet = link(inlet.clone(), &stages, &self.config, None)?;
        let processor: Arc<dyn Processor<Element, Element>> =
            Arc::new(ChainProcessor { inlet, outlet });
        Ok(processor)
    }

    /// Materialize a graph that has a terminal and no source
    ///
    /// The result resolves once the returned subscriber has been driven to
    /// termination by whatever publisher it is handed to.
    pub fn build_subscriber<R: Any>(
        &self,
        graph: &Graph,
    ) -> Result<(Arc<dyn Subscriber<Element>>, PipelineResult<R>)> {
        graph.expect_shape(Shape::Subscriber)?;
        let cell = RunCell::new(self.next_run_id());
        let inlet = ProcessorStage::new(
            "inlet",
            Operator::identity(),
            Arc::clone(&self.config),
            StageMetrics::new("inlet"),
        );
        let stages = graph.stages();
        let Some((terminal, body)) = stages.split_last() else {
            return Err(StreamError::InvalidGraph("subscriber graph has no terminal".into()));
        };
        let outlet = link(inlet.clone(), body, &self.config, Some(&cell))?;
        let sink = terminal_stage(terminal, &cell, &self.config)?;
        cell.start();
        outlet.subscribe(sink);
        debug!(run = cell.id(), stages = graph.len(), "built subscriber");
        let subscriber: Arc<dyn Subscriber<Element>> = inlet;
        Ok((subscriber, PipelineResult::new(cell)))
    }
}

impl Default for Engine {
    fn default() -> Self {
        Self {
            config: Arc::new(EngineConfig::default()),
            next_run: AtomicU64::new(1),
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    payload
        .downcast_ref::<&str>()
        .map(|s| (*s).to_owned())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic payload".to_owned())
}

fn start(graph: &Graph, config: &Arc<EngineConfig>, cell: Arc<RunCell>) {
    debug!(run = cell.id(), stages = graph.len(), "starting run");
    if let Err(error) = link_closed(graph, config, &cell) {
        warn!(run = cell.id(), %error, "run rejected");
        cell.resolve(Err(error));
    }
}

fn link_closed(graph: &Graph, config: &Arc<EngineConfig>, cell: &Arc<RunCell>) -> Result<()> {
    graph.expect_shape(Shape::Closed)?;
    let stages = graph.stages();
    let Some((terminal, body)) = stages.split_last() else {
        return Err(StreamError::InvalidGraph("closed graph has no terminal".into()));
    };
    let publisher = materialize_stages(body, config, Some(cell))?;
    let sink = terminal_stage(terminal, cell, config)?;
    cell.start();
    publisher.subscribe(sink);
    Ok(())
}

fn terminal_stage(
    stage: &Stage,
    cell: &Arc<RunCell>,
    config: &EngineConfig,
) -> Result<Arc<SinkStage>> {
    let metrics = StageMetrics::new(stage.name());
    cell.register_metrics(metrics.clone());
    SinkStage::new(stage, Arc::clone(cell), config, metrics).ok_or_else(|| {
        StreamError::InvalidGraph(format!("'{}' is not a terminal stage", stage.name()))
    })
}

/// Materialize a publisher-shaped graph, e.g. a flat-map's nested source
pub(crate) fn materialize_publisher(
    graph: &Graph,
    config: &Arc<EngineConfig>,
    cell: Option<&Arc<RunCell>>,
) -> Result<Arc<dyn Publisher<Element>>> {
    graph.expect_shape(Shape::Publisher)?;
    materialize_stages(&graph.stages(), config, cell)
}

/// Source first, then every intermediate stage linked behind it
fn materialize_stages(
    stages: &[&Stage],
    config: &Arc<EngineConfig>,
    cell: Option<&Arc<RunCell>>,
) -> Result<Arc<dyn Publisher<Element>>> {
    let Some((source, rest)) = stages.split_first() else {
        return Err(StreamError::InvalidGraph("graph has no source".into()));
    };
    let metrics = StageMetrics::new(source.name());
    if let Some(cell) = cell {
        cell.register_metrics(metrics.clone());
    }
    let head: Arc<dyn Publisher<Element>> = match source {
        Stage::Of(factory) => SourceStage::from_iter(factory(), metrics),
        Stage::Failed(error) => SourceStage::failed(error.clone(), metrics),
        Stage::Publisher(publisher) => Arc::clone(publisher),
        other => {
            return Err(StreamError::InvalidGraph(format!(
                "'{}' is not a source stage",
                other.name()
            )))
        }
    };
    link(head, rest, config, cell)
}

/// Subscribe each intermediate stage to the one before it; returns the last
fn link(
    head: Arc<dyn Publisher<Element>>,
    stages: &[&Stage],
    config: &Arc<EngineConfig>,
    cell: Option<&Arc<RunCell>>,
) -> Result<Arc<dyn Publisher<Element>>> {
    let mut upstream = head;
    for stage in stages {
        let (subscriber, publisher) = match stage {
            Stage::Processor(external) => (
                Arc::clone(&external.subscriber),
                Arc::clone(&external.publisher),
            ),
            other => {
                let operator = Operator::from_stage(other, config).ok_or_else(|| {
                    StreamError::InvalidGraph(format!(
                        "'{}' cannot be used as an intermediate stage",
                        other.name()
                    ))
                })?;
                let metrics = StageMetrics::new(other.name());
                if let Some(cell) = cell {
                    cell.register_metrics(metrics.clone());
                }
                let executor =
                    ProcessorStage::new(other.name(), operator, Arc::clone(config), metrics);
                let subscriber: Arc<dyn Subscriber<Element>> = executor.clone();
                let publisher: Arc<dyn Publisher<Element>> = executor;
                (subscriber, publisher)
            }
        };
        debug!(stage = stage.name(), "linking stage");
        upstream.subscribe(subscriber);
        upstream = publisher;
    }
    Ok(upstream)
}

/// A processor-shaped graph: an identity inlet followed by the linked stages
struct ChainProcessor {
    inlet: Arc<ProcessorStage>,
    outlet: Arc<dyn Publisher<Element>>,
}

impl Subscriber<Element> for ChainProcessor {
    fn on_subscribe(&self, subscription: Arc<dyn Subscription>) {
        self.inlet.on_subscribe(subscription);
    }

    fn on_next(&self, item: Element) {
        self.inlet.on_next(item);
    }

    fn on_error(&self, error: StreamError) {
        self.inlet.on_error(error);
    }

    fn on_complete(&self) {
        self.inlet.on_complete();
    }
}

impl Publisher<Element> for ChainProcessor {
    fn subscribe(&self, subscriber: Arc<dyn Subscriber<Element>>) {
        self.outlet.subscribe(subscriber);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collector::Collector;
    use crate::completion::RunState;
    use crate::graph::ElementIter;
    use crate::testing::{ManualPublisher, ManualSubscriber};
    use std::time::Duration;

    fn of(items: Vec<i32>) -> Stage {
        Stage::Of(Arc::new(move || {
            Box::new(items.clone().into_iter().map(|x| Box::new(x) as Element)) as ElementIter
        }))
    }

    fn to_list() -> Stage {
        Stage::Collect(Collector::<i32, Vec<i32>>::to_list().factory())
    }

    #[test]
    fn test_run_closed_graph() {
        let engine = Engine::default();
        let graph = Graph::from_stages([of(vec![1, 2, 3]), Stage::Skip(1), to_list()]);
        let result = engine.run::<Vec<i32>>(&graph);
        assert_eq!(result.wait().unwrap(), &vec![2, 3]);
        assert_eq!(result.state(), RunState::Completed);
    }

    #[test]
    fn test_open_graph_is_rejected() {
        let engine = Engine::default();
        let graph = Graph::from_stages([of(vec![1])]);
        let result = engine.run::<Vec<i32>>(&graph);
        assert!(matches!(result.wait(), Err(StreamError::InvalidGraph(_))));
        assert_eq!(result.state(), RunState::Failed);
    }

    #[test]
    fn test_metrics_registered_per_stage() {
        let engine = Engine::default();
        let graph = Graph::from_stages([of(vec![1, 2, 3, 4]), Stage::Limit(2), to_list()]);
        let result = engine.run::<Vec<i32>>(&graph);
        result.wait().unwrap();
        let metrics = result.metrics();
        let names: Vec<_> = metrics.iter().map(|m| m.stage).collect();
        assert_eq!(names, vec!["of", "limit", "collect"]);
        assert_eq!(metrics[1].emitted, 2);
        assert!(result.metrics_summary().contains("limit"));
    }

    #[test]
    fn test_spawned_run_uses_named_thread() {
        let config = EngineConfig::default()
            .with_execution(Execution::Spawned)
            .with_thread_name("worker");
        let engine = Engine::new(config).unwrap();
        let graph = Graph::from_stages([
            of(vec![5]),
            Stage::ForEach(Arc::new(|_item: Element| {
                let name = thread::current().name().map(str::to_owned);
                if name.as_deref().is_some_and(|n| n.starts_with("worker-")) {
                    Ok(())
                } else {
                    Err(StreamError::msg("ran on the wrong thread"))
                }
            })),
        ]);
        let result = engine.run::<()>(&graph);
        assert!(result.wait_timeout(Duration::from_secs(5)).unwrap().is_ok());
    }

    #[test]
    fn test_panicking_spawned_run_fails() {
        let config = EngineConfig::default().with_execution(Execution::Spawned);
        let engine = Engine::new(config).unwrap();
        let graph = Graph::from_stages([
            of(vec![1]),
            Stage::ForEach(Arc::new(|_item: Element| -> Result<()> {
                panic!("sensor driver crashed")
            })),
        ]);
        let result = engine.run::<()>(&graph);
        let outcome = result.wait_timeout(Duration::from_secs(5)).expect("run never resolved");
        let error = outcome.unwrap_err();
        assert!(error.to_string().contains("sensor driver crashed"));
        assert_eq!(result.state(), RunState::Failed);
    }

    #[test]
    fn test_build_publisher_for_external_subscriber() {
        let engine = Engine::default();
        let publisher = engine.build_publisher(&Graph::from_stages([of(vec![1, 2])])).unwrap();
        let probe = ManualSubscriber::<Element>::new();
        publisher.subscribe(probe.clone());
        probe.request(5);
        assert_eq!(probe.take_items().len(), 2);
        assert!(probe.is_completed());
        assert!(probe.violations().is_empty());
    }

    #[test]
    fn test_build_processor_between_manual_endpoints() {
        let engine = Engine::default();
        let processor = engine.build_processor(&Graph::from_stages([Stage::Limit(1)])).unwrap();
        let source = ManualPublisher::<Element>::new();
        let probe = ManualSubscriber::<Element>::new();
        source.subscribe(processor.clone());
        processor.subscribe(probe.clone());

        probe.request(3);
        assert_eq!(source.requested(), 1);
        source.emit(Box::new(1));
        assert!(probe.is_completed());
        assert!(source.is_cancelled());
    }

    #[test]
    fn test_build_subscriber_resolves_on_completion() {
        let engine = Engine::default();
        let (subscriber, result) = engine
            .build_subscriber::<Vec<i32>>(&Graph::from_stages([Stage::Skip(1), to_list()]))
            .unwrap();
        let source = ManualPublisher::<Element>::new();
        source.subscribe(subscriber);
        for n in 0..3 {
            assert!(source.emit(Box::new(n)));
        }
        source.complete();
        assert_eq!(result.wait().unwrap(), &vec![1, 2]);
    }
}
