//! A backpressure-aware reactive streams engine.
//!
//! Pipelines are described as immutable stage graphs (source, intermediate
//! operations, terminal) and run by an [`Engine`] that links one executor per
//! stage through a demand-driven publish/subscribe protocol. Nothing flows
//! until the terminal stage requests it, and every stage forwards only as
//! much demand upstream as it can absorb.
//!
//! # Features
//!
//! - Typed, append-only builders over a reusable graph description
//! - Demand signalling with saturating, unbounded-aware accounting
//! - Bounded buffers with watermark refill or drop-oldest overflow
//! - Cancellation that reaches the source promptly
//! - Per-stage metrics for every run
//! - Conformance probes ([`testing`]) for any publisher or subscriber
//! - CloudEvents-style event envelopes ([`event`])
//!
//! # Example
//!
//! ```
//! use reactive_pipeline::{Engine, EngineConfig, ReactiveStreams};
//!
//! let engine = Engine::new(EngineConfig::default())?;
//! let words = ReactiveStreams::of(vec!["alpha", "beta", "gamma", "delta"])
//!     .filter(|w| w.len() == 5)
//!     .map(|w| w.to_uppercase())
//!     .to_list();
//!
//! let result = words.run(&engine);
//! let expected: Vec<String> = vec!["ALPHA".into(), "GAMMA".into(), "DELTA".into()];
//! assert_eq!(result.wait()?, &expected);
//! # Ok::<(), reactive_pipeline::StreamError>(())
//! ```

mod adapters;
pub mod backpressure;
pub mod buffer;
pub mod builder;
pub mod collector;
pub mod completion;
pub mod config;
pub mod demand;
pub mod error;
pub mod event;
pub mod graph;
pub mod metrics;
pub mod pipeline;
mod processor;
pub mod protocol;
mod serial;
mod sink;
mod source;
mod stage;
pub mod testing;

// Re-exports for convenience
pub use backpressure::RefillController;
pub use buffer::OverflowPolicy;
pub use builder::{
    CompletionRunner, CompletionSubscriber, Flow, Inlet, ProcessorBuilder, PublisherBuilder,
    ReactiveStreams, Sourced, SubscriberBuilder, Terminated,
};
pub use collector::Collector;
pub use completion::{PipelineResult, RunState};
pub use config::{EngineConfig, Execution};
pub use demand::Demand;
pub use error::{Cause, ProtocolViolation, Result, StreamError};
pub use event::{Event, EventBuilder, EventError, Message};
pub use graph::{Graph, Shape, Stage};
pub use metrics::{MetricsSnapshot, StageMetrics};
pub use pipeline::Engine;
pub use protocol::{Element, Processor, Publisher, Subscriber, Subscription};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
