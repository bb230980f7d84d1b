//! Number processing pipeline demonstrating filtering and transformations
//!
//! Pipeline:
//! 1. Generate: Wraps the numbers 1-100 in event envelopes
//! 2. Filter: Keep only even numbers
//! 3. Transform: Multiply by 10
//! 4. Aggregate: Sum all numbers
//!
//! Usage: RUST_LOG=reactive_pipeline=debug cargo run --example filter_pipeline --release

use reactive_pipeline::{
    Collector, Engine, EngineConfig, Event, Execution, Message, ReactiveStreams, RunState,
};
use std::time::{Duration, Instant};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Default)]
struct Totals {
    sum: u64,
    count: u64,
}

fn reading(n: u32) -> Result<Event<u32>, reactive_pipeline::EventError> {
    Event::<u32>::builder()
        .event_type("demo.number")
        .source("/demos/filter_pipeline")
        .event_id(format!("n-{n}"))
        .now()
        .data(n)
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    println!("Number Processing Pipeline");
    println!("==========================");
    println!("Generating numbers 1-100, filtering evens, multiplying by 10, and summing");
    println!();

    let events = (1..=100).map(reading).collect::<Result<Vec<_>, _>>()?;
    let summing = Collector::of(
        Totals::default,
        |totals: &mut Totals, n: u64| {
            totals.sum += n;
            totals.count += 1;
            if totals.count % 10 == 0 {
                println!("Running sum: {} (count: {})", totals.sum, totals.count);
            }
            Ok(())
        },
        Ok,
    );

    let pipeline = ReactiveStreams::of(events)
        .filter(|event| event.payload() % 2 == 0)
        .map(|event| event.map_payload(|n| u64::from(n) * 10))
        .buffer()
        .map(|event| event.into_payload())
        .collect(summing);

    let engine = Engine::new(EngineConfig::default().with_execution(Execution::Spawned))?;
    let start = Instant::now();
    let result = pipeline.run(&engine);
    let totals = match result.wait_timeout(Duration::from_secs(10)) {
        Some(outcome) => outcome?,
        None => {
            result.cancel();
            return Err("pipeline did not finish within 10s".into());
        }
    };

    println!("\n=== Final Results ===");
    println!("Total numbers processed: {}", totals.count);
    println!("Sum of all numbers: {}", totals.sum);
    if totals.count > 0 {
        println!("Average: {:.2}", totals.sum as f64 / totals.count as f64);
    }
    assert_eq!(result.state(), RunState::Completed);

    println!("\n{}", result.metrics_summary());
    println!("Pipeline execution time: {:.3}s", start.elapsed().as_secs_f64());

    Ok(())
}
