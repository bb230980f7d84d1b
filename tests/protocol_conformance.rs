use reactive_pipeline::testing::{ManualPublisher, ManualSubscriber};
use reactive_pipeline::{
    Engine, EngineConfig, Execution, OverflowPolicy, ProtocolViolation, Publisher,
    ReactiveStreams, RunState, StreamError,
};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

fn engine() -> Engine {
    Engine::default()
}

// Publisher side

#[test]
fn test_publisher_respects_demand() {
    let publisher = ReactiveStreams::of(0..10)
        .map(|n| n * 2)
        .build_rs(&engine())
        .expect("Build failed");
    let probe = ManualSubscriber::<i32>::new();
    publisher.subscribe(probe.clone());
    assert!(probe.is_subscribed());
    assert_eq!(probe.received(), 0);

    probe.request(3);
    assert_eq!(probe.take_items(), vec![0, 2, 4]);
    assert!(!probe.is_terminated());

    probe.request(100);
    assert_eq!(probe.take_items(), vec![6, 8, 10, 12, 14, 16, 18]);
    assert!(probe.is_completed());
    assert!(probe.violations().is_empty());
}

#[test]
fn test_publisher_stops_after_cancel() {
    let publisher = ReactiveStreams::generate(|| 1u64)
        .filter(|n| *n > 0)
        .build_rs(&engine())
        .expect("Build failed");
    let probe = ManualSubscriber::<u64>::new();
    probe.cancel_after(4);
    publisher.subscribe(probe.clone());
    probe.request(u64::MAX);

    assert_eq!(probe.received(), 4);
    assert!(!probe.is_terminated());
    probe.request(10);
    assert_eq!(probe.received(), 4);
    assert!(probe.violations().is_empty());
}

#[test]
fn test_cancel_halts_infinite_source_promptly() {
    let calls = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&calls);
    let publisher = ReactiveStreams::generate(move || counter.fetch_add(1, Ordering::SeqCst))
        .filter(|n| *n % 2 == 0)
        .build_rs(&engine())
        .expect("Build failed");
    let probe = ManualSubscriber::<usize>::new();
    probe.cancel_after(4);
    publisher.subscribe(probe.clone());
    probe.request(1000);

    assert_eq!(probe.take_items(), vec![0, 2, 4, 6]);
    assert!(calls.load(Ordering::SeqCst) <= 9);
    assert!(probe.violations().is_empty());
}

#[test]
fn test_publisher_rejects_zero_request() {
    let publisher = ReactiveStreams::of(vec![1, 2, 3])
        .build_rs(&engine())
        .expect("Build failed");
    let probe = ManualSubscriber::<i32>::new();
    publisher.subscribe(probe.clone());
    probe.request(0);
    assert_eq!(
        probe.error().and_then(|e| e.violation()),
        Some(ProtocolViolation::NonPositiveRequest)
    );
    probe.request(5);
    assert_eq!(probe.received(), 0);
}

#[test]
fn test_publisher_is_unicast() {
    let publisher = ReactiveStreams::of(vec![1])
        .skip(0)
        .build_rs(&engine())
        .expect("Build failed");
    let first = ManualSubscriber::<i32>::new();
    let second = ManualSubscriber::<i32>::new();
    publisher.subscribe(first.clone());
    publisher.subscribe(second.clone());

    assert!(second.is_subscribed());
    assert_eq!(
        second.error().and_then(|e| e.violation()),
        Some(ProtocolViolation::AlreadySubscribed)
    );
    first.request(1);
    assert_eq!(first.take_items(), vec![1]);
    assert!(first.is_completed());
}

#[test]
fn test_empty_publisher_completes_without_request() {
    let publisher = ReactiveStreams::empty::<String>()
        .build_rs(&engine())
        .expect("Build failed");
    let probe = ManualSubscriber::<String>::new();
    publisher.subscribe(probe.clone());
    assert!(probe.is_completed());
    assert!(probe.violations().is_empty());
}

#[test]
fn test_failed_publisher_errors_without_request() {
    let publisher = ReactiveStreams::failed::<i32>(StreamError::msg("broken"))
        .map(|n| n + 1)
        .build_rs(&engine())
        .expect("Build failed");
    let probe = ManualSubscriber::<i32>::new();
    publisher.subscribe(probe.clone());
    assert_eq!(probe.error().map(|e| e.to_string()), Some("broken".into()));
    assert!(probe.violations().is_empty());
}

// Processor side

#[test]
fn test_processor_propagates_demand_and_errors() {
    let processor = ReactiveStreams::builder::<i32>()
        .filter(|n| n % 2 == 0)
        .build_rs(&engine())
        .expect("Build failed");
    let upstream = ManualPublisher::<i32>::new();
    let probe = ManualSubscriber::<i32>::new();
    upstream.subscribe(processor.clone());
    processor.subscribe(probe.clone());
    assert_eq!(upstream.requested(), 0);

    probe.request(2);
    assert_eq!(upstream.requested(), 2);
    assert!(upstream.emit(1));
    // The dropped element is replaced upstream
    assert_eq!(upstream.requested(), 3);
    assert!(upstream.emit(2));
    assert_eq!(probe.take_items(), vec![2]);

    upstream.fail(StreamError::msg("upstream failed"));
    assert_eq!(
        probe.error().map(|e| e.to_string()),
        Some("upstream failed".into())
    );
    assert!(probe.violations().is_empty());
}

#[test]
fn test_processor_cancel_reaches_upstream() {
    let processor = ReactiveStreams::builder::<i32>()
        .map(|n| n + 1)
        .build_rs(&engine())
        .expect("Build failed");
    let upstream = ManualPublisher::<i32>::new();
    let probe = ManualSubscriber::<i32>::new();
    upstream.subscribe(processor.clone());
    processor.subscribe(probe.clone());
    probe.request(1);
    probe.cancel();
    assert!(upstream.is_cancelled());
    assert!(!upstream.emit(1));
}

#[test]
fn test_external_processor_spliced_into_graph() {
    let engine = engine();
    let external = ReactiveStreams::builder::<i32>()
        .map(|n| format!("#{n}"))
        .build_rs(&engine)
        .expect("Build failed");
    let result = ReactiveStreams::of(1..=3)
        .via_processor(external)
        .to_list()
        .run(&engine);
    assert_eq!(
        result.wait().expect("Run failed"),
        &vec!["#1".to_string(), "#2".into(), "#3".into()]
    );
}

// Subscriber side

#[test]
fn test_external_publisher_sees_terminal_demand() {
    let engine =
        Engine::new(EngineConfig::default().with_terminal_prefetch(8)).expect("Invalid config");
    let source = ManualPublisher::<i32>::new();
    let result = ReactiveStreams::from_publisher::<i32>(source.clone())
        .map(|n| n * 10)
        .to_list()
        .run(&engine);

    assert_eq!(source.requested(), 8);
    for n in 1..=3 {
        assert!(source.emit(n));
    }
    source.complete();
    assert_eq!(result.wait().expect("Run failed"), &vec![10, 20, 30]);
}

#[test]
fn test_subscriber_detects_over_delivery() {
    let engine = engine();
    let probe = ManualSubscriber::<i32>::new();
    let built = ReactiveStreams::builder::<i32>()
        .to_subscriber(probe.clone())
        .build(&engine)
        .expect("Build failed");
    let source = ManualPublisher::<i32>::new();
    source.subscribe(built.subscriber.clone());

    source.emit_unchecked(1);
    assert!(source.is_cancelled());
    assert_eq!(probe.received(), 0);
    assert_eq!(
        probe.error().and_then(|e| e.violation()),
        Some(ProtocolViolation::DeliveryWithoutDemand)
    );
    let error = built.result.wait().expect_err("Run should fail");
    assert_eq!(error.violation(), Some(ProtocolViolation::DeliveryWithoutDemand));
}

#[test]
fn test_forwarded_subscriber_drives_demand() {
    let engine = engine();
    let probe = ManualSubscriber::<i32>::new();
    let result = ReactiveStreams::of(1..=5)
        .to_subscriber(probe.clone())
        .run(&engine);

    assert!(probe.is_subscribed());
    assert_eq!(probe.received(), 0);
    probe.request(2);
    assert_eq!(probe.take_items(), vec![1, 2]);
    assert_eq!(result.state(), RunState::Running);

    probe.request(10);
    assert_eq!(probe.take_items(), vec![3, 4, 5]);
    assert!(probe.is_completed());
    assert!(result.wait().is_ok());
    assert!(probe.violations().is_empty());
}

#[test]
fn test_forwarded_zero_request_fails_run() {
    let engine = engine();
    let probe = ManualSubscriber::<i32>::new();
    let result = ReactiveStreams::of(1..=5)
        .to_subscriber(probe.clone())
        .run(&engine);
    probe.request(0);
    assert_eq!(
        result.wait().expect_err("Run should fail").violation(),
        Some(ProtocolViolation::NonPositiveRequest)
    );
    assert!(probe.error().is_some());
}

#[test]
fn test_forwarded_subscriber_cancel_cancels_run() {
    let engine = engine();
    let probe = ManualSubscriber::<u8>::new();
    probe.cancel_after(2);
    let result = ReactiveStreams::generate(|| 9u8)
        .to_subscriber(probe.clone())
        .run(&engine);
    probe.request(5);
    assert_eq!(probe.received(), 2);
    assert!(matches!(result.wait(), Err(StreamError::Cancelled)));
    assert_eq!(result.state(), RunState::Cancelled);
}

// Serialized delivery

#[test]
fn test_concurrent_requests_are_serialized() {
    let engine = Engine::new(EngineConfig::default().with_execution(Execution::Spawned))
        .expect("Invalid config");
    let probe = ManualSubscriber::<u32>::new();
    let result = ReactiveStreams::of(0..1000u32)
        .buffer_with(8, OverflowPolicy::Backpressure)
        .map(|n| n + 1)
        .to_subscriber(probe.clone())
        .run(&engine);

    while !probe.is_subscribed() {
        thread::sleep(Duration::from_millis(1));
    }
    let requests = Arc::new(AtomicUsize::new(0));
    let requesters: Vec<_> = (0..4)
        .map(|_| {
            let probe = Arc::clone(&probe);
            let requests = Arc::clone(&requests);
            thread::spawn(move || {
                for _ in 0..250 {
                    probe.request(1);
                    requests.fetch_add(1, Ordering::SeqCst);
                }
            })
        })
        .collect();
    for requester in requesters {
        requester.join().expect("Requester panicked");
    }

    assert!(probe.await_termination(Duration::from_secs(10)));
    assert_eq!(requests.load(Ordering::SeqCst), 1000);
    assert_eq!(probe.take_items(), (1..=1000).collect::<Vec<u32>>());
    assert!(probe.violations().is_empty(), "{:?}", probe.violations());
    assert!(result.wait().is_ok());
}
