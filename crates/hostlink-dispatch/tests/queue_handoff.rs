#![allow(clippy::expect_used, clippy::panic)]

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use hostlink_dispatch::{
    CommandParams, CommandQueue, DesignatedThread, DispatchConfig, FailureKind, HandlerError,
    handler_fn,
};
use quickcheck::{QuickCheck, TestResult};
use serde_json::{Value, json};

fn eager_config() -> DispatchConfig {
    DispatchConfig {
        min_drain_interval: Duration::ZERO,
        ..DispatchConfig::default()
    }
}

/// Queue whose main thread is the calling test thread.
fn bound_queue() -> Arc<CommandQueue> {
    let main = Arc::new(DesignatedThread::new());
    main.bind_current();
    CommandQueue::new(eager_config(), main)
}

fn params(pairs: &[(&str, Value)]) -> CommandParams {
    pairs
        .iter()
        .map(|(key, value)| ((*key).to_string(), value.clone()))
        .collect()
}

fn drain_until(queue: &CommandQueue, deadline: Duration, mut done: impl FnMut() -> bool) {
    let started = Instant::now();
    while !done() {
        assert!(started.elapsed() < deadline, "drain loop did not settle");
        queue.drain(8);
        thread::sleep(Duration::from_millis(1));
    }
}

#[test]
fn ping_handoff_returns_pong_to_the_waiting_thread() {
    let queue = bound_queue();
    queue.set_handler(handler_fn(|action, _| match action {
        "ping" => Ok(json!("pong")),
        other => Err(HandlerError::UnknownAction(other.to_string())),
    }));

    let producer_queue = Arc::clone(&queue);
    let producer = thread::spawn(move || {
        producer_queue.enqueue_and_wait("ping", CommandParams::new(), Duration::from_secs(5))
    });

    drain_until(&queue, Duration::from_secs(5), || producer.is_finished());
    let result = producer.join().expect("producer thread");
    assert!(result.success);
    assert_eq!(result.data, Some(json!("pong")));
    assert_eq!(queue.waiting_len(), 0);
}

fn single_producer_order_is_preserved(labels: Vec<u16>) -> TestResult {
    if labels.len() > 64 {
        return TestResult::discard();
    }
    let queue = bound_queue();
    let seen = Arc::new(Mutex::new(Vec::new()));
    let recorder = Arc::clone(&seen);
    queue.set_handler(handler_fn(move |_, params| {
        recorder
            .lock()
            .expect("seen lock")
            .push(params.get("label").cloned().unwrap_or(Value::Null));
        Ok(Value::Null)
    }));

    for label in &labels {
        queue.enqueue("record", params(&[("label", json!(label))]));
    }
    while queue.pending_len() > 0 {
        queue.drain(3);
    }

    let expected = labels.iter().map(|label| json!(label)).collect::<Vec<_>>();
    let seen = seen.lock().expect("seen lock").clone();
    TestResult::from_bool(seen == expected)
}

#[test]
fn drained_commands_follow_enqueue_order() {
    QuickCheck::new()
        .tests(64)
        .quickcheck(single_producer_order_is_preserved as fn(Vec<u16>) -> TestResult);
}

#[test]
fn each_producer_sees_its_own_commands_in_order() {
    let queue = bound_queue();
    let seen = Arc::new(Mutex::new(Vec::<(u64, u64)>::new()));
    let recorder = Arc::clone(&seen);
    queue.set_handler(handler_fn(move |_, params| {
        let producer = params.get("producer").and_then(Value::as_u64).unwrap_or_default();
        let seq = params.get("seq").and_then(Value::as_u64).unwrap_or_default();
        recorder.lock().expect("seen lock").push((producer, seq));
        Ok(Value::Null)
    }));

    let producers = (0..3_u64)
        .map(|producer| {
            let queue = Arc::clone(&queue);
            thread::spawn(move || {
                for seq in 0..20_u64 {
                    let result = queue.enqueue_and_wait(
                        "record",
                        params(&[("producer", json!(producer)), ("seq", json!(seq))]),
                        Duration::from_secs(5),
                    );
                    assert!(result.success, "producer {producer} seq {seq} failed");
                }
            })
        })
        .collect::<Vec<_>>();

    drain_until(&queue, Duration::from_secs(10), || {
        producers.iter().all(thread::JoinHandle::is_finished)
    });
    for producer in producers {
        producer.join().expect("producer thread");
    }

    let seen = seen.lock().expect("seen lock").clone();
    assert_eq!(seen.len(), 60);
    for producer in 0..3_u64 {
        let order = seen
            .iter()
            .filter(|(owner, _)| *owner == producer)
            .map(|(_, seq)| *seq)
            .collect::<Vec<_>>();
        assert_eq!(order, (0..20_u64).collect::<Vec<_>>());
    }
}

#[test]
fn every_command_runs_at_most_once_even_when_handlers_panic() {
    let queue = bound_queue();
    let runs = Arc::new(Mutex::new(HashMap::<u64, usize>::new()));
    let recorder = Arc::clone(&runs);
    queue.set_handler(handler_fn(move |_, params| {
        let seq = params.get("seq").and_then(Value::as_u64).unwrap_or_default();
        *recorder.lock().expect("runs lock").entry(seq).or_default() += 1;
        if seq % 3 == 0 {
            panic!("handler blew up on {seq}");
        }
        Ok(json!(seq))
    }));

    for seq in 0..12_u64 {
        queue.enqueue("work", params(&[("seq", json!(seq))]));
    }
    let mut executed = 0;
    while queue.pending_len() > 0 {
        executed += queue.drain(5);
    }
    assert_eq!(queue.drain(5), 0);

    assert_eq!(executed, 12);
    let runs = runs.lock().expect("runs lock").clone();
    assert_eq!(runs.len(), 12);
    assert!(runs.values().all(|count| *count == 1));
    let stats = queue.stats();
    assert_eq!(stats.executed, 12);
    assert_eq!(stats.handler_failures, 4);
}

#[test]
fn panicking_handler_reports_failure_to_the_waiter() {
    let queue = bound_queue();
    queue.set_handler(handler_fn(|_, _| panic!("scene graph corrupted")));

    let producer_queue = Arc::clone(&queue);
    let producer = thread::spawn(move || {
        producer_queue.enqueue_and_wait("select", CommandParams::new(), Duration::from_secs(5))
    });
    drain_until(&queue, Duration::from_secs(5), || producer.is_finished());

    let result = producer.join().expect("producer thread");
    assert!(!result.success);
    assert_eq!(result.failure, Some(FailureKind::Handler));
    assert!(
        result
            .error
            .as_deref()
            .is_some_and(|error| error.contains("scene graph corrupted"))
    );
    assert!(queue.has_handler(), "a panic leaves the handler registered");
}

#[test]
fn timed_out_wait_is_cleaned_up_and_late_drain_is_harmless() {
    let queue = bound_queue();
    queue.set_handler(handler_fn(|_, _| Ok(json!("too late"))));

    let producer_queue = Arc::clone(&queue);
    let started = Instant::now();
    let result = thread::spawn(move || {
        producer_queue.enqueue_and_wait("slow", CommandParams::new(), Duration::from_millis(50))
    })
    .join()
    .expect("producer thread");

    let elapsed = started.elapsed();
    assert!(elapsed >= Duration::from_millis(50));
    assert!(elapsed < Duration::from_millis(550), "wait overshot its bound: {elapsed:?}");
    assert!(!result.success);
    assert_eq!(result.failure, Some(FailureKind::Timeout));
    assert_eq!(result.error.as_deref(), Some("timed out after 50ms"));
    assert_eq!(queue.waiting_len(), 0);
    assert_eq!(queue.pending_len(), 1);

    assert_eq!(queue.drain(8), 1);
    let stats = queue.stats();
    assert_eq!(stats.timeouts, 1);
    assert_eq!(stats.executed, 1);
    assert_eq!(queue.waiting_len(), 0);
}

#[test]
fn result_delivered_before_the_deadline_wins() {
    let queue = bound_queue();
    queue.set_handler(handler_fn(|_, _| Ok(json!("done"))));

    let producer_queue = Arc::clone(&queue);
    let producer = thread::spawn(move || {
        producer_queue.enqueue_and_wait("quick", CommandParams::new(), Duration::from_secs(2))
    });
    drain_until(&queue, Duration::from_secs(5), || producer.is_finished());

    let result = producer.join().expect("producer thread");
    assert!(result.success);
    assert_eq!(queue.stats().timeouts, 0);
}
