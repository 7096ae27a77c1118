//! Integration tests for `ListenerRunner` against the in-memory broker
//!
//! All tests run with paused tokio time so ack-wait redelivery is
//! deterministic.

#![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)] // Test code can use unwrap/expect/panic

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use ticketbus_core::events::StreamHealthPing;
use ticketbus_core::{
    Broker, HandlerError, Listener, MessageMetadata, QueueGroup, Subject, SubscriptionOptions,
    async_trait,
};
use ticketbus_runtime::{ListenerError, ListenerRunner, Publisher, Shutdown};
use ticketbus_testing::{InMemoryBroker, fixtures};

// ============================================================================
// Test Fixtures
// ============================================================================

const GROUP: &str = "recording-service";
const ACK_WAIT: Duration = Duration::from_secs(5);

/// Records every message it sees and fails the first `failures` calls.
struct RecordingListener {
    seen: Mutex<Vec<(String, MessageMetadata)>>,
    failures: AtomicUsize,
    in_flight: AtomicUsize,
    peak_in_flight: AtomicUsize,
    hold: Duration,
    max_in_flight: usize,
}

impl RecordingListener {
    fn new() -> Self {
        Self {
            seen: Mutex::new(Vec::new()),
            failures: AtomicUsize::new(0),
            in_flight: AtomicUsize::new(0),
            peak_in_flight: AtomicUsize::new(0),
            hold: Duration::ZERO,
            max_in_flight: 1,
        }
    }

    fn failing(self, failures: usize) -> Self {
        self.failures.store(failures, Ordering::SeqCst);
        self
    }

    fn slow(mut self, hold: Duration, max_in_flight: usize) -> Self {
        self.hold = hold;
        self.max_in_flight = max_in_flight;
        self
    }

    fn seen(&self) -> Vec<(String, MessageMetadata)> {
        self.seen.lock().unwrap().clone()
    }
}

#[async_trait]
impl Listener for RecordingListener {
    type Event = StreamHealthPing;

    fn queue_group(&self) -> QueueGroup {
        QueueGroup::new(GROUP)
    }

    fn subscription_options(&self) -> SubscriptionOptions {
        SubscriptionOptions::new(self.queue_group())
            .with_durable_name(self.durable_name())
            .with_ack_wait(ACK_WAIT)
            .with_max_in_flight(self.max_in_flight)
    }

    async fn on_message(&self, data: StreamHealthPing, msg: &MessageMetadata) -> Result<(), HandlerError> {
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak_in_flight.fetch_max(now, Ordering::SeqCst);
        self.seen.lock().unwrap().push((data.message, msg.clone()));
        if !self.hold.is_zero() {
            tokio::time::sleep(self.hold).await;
        }
        self.in_flight.fetch_sub(1, Ordering::SeqCst);

        let remaining = self.failures.load(Ordering::SeqCst);
        if remaining > 0 {
            self.failures.store(remaining - 1, Ordering::SeqCst);
            return Err("downstream unavailable".into());
        }
        Ok(())
    }
}

fn group() -> QueueGroup {
    QueueGroup::new(GROUP)
}

async fn publish_pings(broker: &Arc<InMemoryBroker>, messages: &[&str]) {
    let publisher = Publisher::<StreamHealthPing>::new(broker.clone());
    for message in messages {
        publisher.publish(&fixtures::health_ping(message)).await.unwrap();
    }
}

/// Yield to the runtime until `condition` holds, advancing paused time in
/// small steps.
async fn eventually(mut condition: impl FnMut() -> bool) {
    for _ in 0..1_000 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not reached");
}

// ============================================================================
// Acknowledgment
// ============================================================================

#[tokio::test(start_paused = true)]
async fn successful_handler_acks_every_message() {
    let broker = Arc::new(InMemoryBroker::new());
    publish_pings(&broker, &["one", "two", "three"]).await;

    let listener = Arc::new(RecordingListener::new());
    let shutdown = Shutdown::new();
    let handle = ListenerRunner::from_arc(listener.clone(), broker.clone(), shutdown.subscribe()).spawn();

    eventually(|| broker.acked(Subject::StreamHealthPing, &group()) == 3).await;
    shutdown.trigger();
    let report = handle.await.unwrap().unwrap();

    assert_eq!(report.acked, 3);
    assert_eq!(report.handler_errors, 0);
    assert_eq!(broker.outstanding(Subject::StreamHealthPing, &group()), 0);
    let messages: Vec<String> = listener.seen().into_iter().map(|(m, _)| m).collect();
    assert_eq!(messages, ["one", "two", "three"]);
}

#[tokio::test(start_paused = true)]
async fn replays_messages_published_before_subscribing() {
    let broker = Arc::new(InMemoryBroker::new());
    publish_pings(&broker, &["early"]).await;

    let listener = Arc::new(RecordingListener::new());
    let shutdown = Shutdown::new();
    let handle = ListenerRunner::from_arc(listener.clone(), broker.clone(), shutdown.subscribe()).spawn();

    eventually(|| listener.seen().len() == 1).await;
    shutdown.trigger();
    handle.await.unwrap().unwrap();

    let (message, metadata) = &listener.seen()[0];
    assert_eq!(message, "early");
    assert_eq!(metadata.sequence, 1);
    assert!(!metadata.redelivered);
}

#[tokio::test(start_paused = true)]
async fn failed_handler_is_redelivered_after_ack_wait() {
    let broker = Arc::new(InMemoryBroker::new());
    publish_pings(&broker, &["flaky"]).await;

    let listener = Arc::new(RecordingListener::new().failing(1));
    let shutdown = Shutdown::new();
    let handle = ListenerRunner::from_arc(listener.clone(), broker.clone(), shutdown.subscribe()).spawn();

    eventually(|| listener.seen().len() == 1).await;
    assert_eq!(broker.acked(Subject::StreamHealthPing, &group()), 0);

    let started = tokio::time::Instant::now();
    eventually(|| broker.acked(Subject::StreamHealthPing, &group()) == 1).await;
    assert!(started.elapsed() >= ACK_WAIT - Duration::from_millis(20));

    shutdown.trigger();
    let report = handle.await.unwrap().unwrap();
    assert_eq!(report.handler_errors, 1);
    assert_eq!(report.acked, 1);

    let seen = listener.seen();
    assert_eq!(seen.len(), 2);
    assert_eq!(seen[1].1.sequence, seen[0].1.sequence);
    assert!(seen[1].1.redelivered);
    assert_eq!(seen[1].1.delivery_attempt, 2);
}

#[tokio::test(start_paused = true)]
async fn poison_message_is_left_unacknowledged() {
    ticketbus_testing::init_tracing();
    let broker = Arc::new(InMemoryBroker::new());
    broker
        .publish(Subject::StreamHealthPing, b"not json".to_vec())
        .await
        .unwrap();
    publish_pings(&broker, &["fine"]).await;

    // One slot: the poison message waits for redelivery behind "fine".
    let listener = Arc::new(RecordingListener::new());
    let shutdown = Shutdown::new();
    let handle = ListenerRunner::from_arc(listener.clone(), broker.clone(), shutdown.subscribe()).spawn();

    eventually(|| broker.acked(Subject::StreamHealthPing, &group()) == 1).await;
    // Past at least one redelivery of the poison message.
    tokio::time::sleep(ACK_WAIT * 2).await;
    shutdown.trigger();
    let report = handle.await.unwrap().unwrap();

    assert!(report.poison >= 2, "poison message should be redelivered: {report:?}");
    assert_eq!(report.acked, 1);
    assert_eq!(broker.outstanding(Subject::StreamHealthPing, &group()), 1);
    let messages: Vec<String> = listener.seen().into_iter().map(|(m, _)| m).collect();
    assert_eq!(messages, ["fine"]);
}

// ============================================================================
// Queue groups
// ============================================================================

#[tokio::test(start_paused = true)]
async fn queue_group_members_share_the_work() {
    let broker = Arc::new(InMemoryBroker::new());
    let first = Arc::new(RecordingListener::new());
    let second = Arc::new(RecordingListener::new());
    let shutdown = Shutdown::new();
    let handles = [
        ListenerRunner::from_arc(first.clone(), broker.clone(), shutdown.subscribe()).spawn(),
        ListenerRunner::from_arc(second.clone(), broker.clone(), shutdown.subscribe()).spawn(),
    ];
    eventually(|| broker.members(Subject::StreamHealthPing, &group()) == 2).await;

    publish_pings(&broker, &["a", "b", "c", "d"]).await;
    eventually(|| broker.acked(Subject::StreamHealthPing, &group()) == 4).await;
    shutdown.trigger();

    let mut total = 0;
    for handle in handles {
        total += handle.await.unwrap().unwrap().acked;
    }
    assert_eq!(total, 4);
    assert_eq!(first.seen().len() + second.seen().len(), 4);
    assert!(!first.seen().is_empty());
    assert!(!second.seen().is_empty());
}

#[tokio::test(start_paused = true)]
async fn max_in_flight_bounds_concurrent_handlers() {
    let broker = Arc::new(InMemoryBroker::new());
    publish_pings(&broker, &["1", "2", "3", "4", "5", "6"]).await;

    let listener = Arc::new(RecordingListener::new().slow(Duration::from_secs(1), 3));
    let shutdown = Shutdown::new();
    let handle = ListenerRunner::from_arc(listener.clone(), broker.clone(), shutdown.subscribe()).spawn();

    eventually(|| broker.acked(Subject::StreamHealthPing, &group()) == 6).await;
    shutdown.trigger();
    handle.await.unwrap().unwrap();

    let peak = listener.peak_in_flight.load(Ordering::SeqCst);
    assert!(peak > 1, "handlers should overlap, peak was {peak}");
    assert!(peak <= 3, "at most 3 handlers in flight, peak was {peak}");
}

// ============================================================================
// Lifecycle
// ============================================================================

#[tokio::test(start_paused = true)]
async fn shutdown_closes_the_subscription() {
    let broker = Arc::new(InMemoryBroker::new());
    let shutdown = Shutdown::new();
    let handle = ListenerRunner::new(RecordingListener::new(), broker.clone(), shutdown.subscribe()).spawn();

    eventually(|| broker.members(Subject::StreamHealthPing, &group()) == 1).await;
    shutdown.trigger();
    let report = handle.await.unwrap().unwrap();

    assert_eq!(report.acked, 0);
    assert_eq!(broker.members(Subject::StreamHealthPing, &group()), 0);
}

#[tokio::test(start_paused = true)]
async fn durable_group_resumes_after_restart() {
    let broker = Arc::new(InMemoryBroker::new());
    publish_pings(&broker, &["before"]).await;

    let first = Arc::new(RecordingListener::new());
    let shutdown = Shutdown::new();
    let handle = ListenerRunner::from_arc(first.clone(), broker.clone(), shutdown.subscribe()).spawn();
    eventually(|| broker.acked(Subject::StreamHealthPing, &group()) == 1).await;
    shutdown.trigger();
    handle.await.unwrap().unwrap();

    publish_pings(&broker, &["while down"]).await;

    let second = Arc::new(RecordingListener::new());
    let shutdown = Shutdown::new();
    let handle = ListenerRunner::from_arc(second.clone(), broker.clone(), shutdown.subscribe()).spawn();
    eventually(|| broker.acked(Subject::StreamHealthPing, &group()) == 2).await;
    shutdown.trigger();
    handle.await.unwrap().unwrap();

    let messages: Vec<String> = second.seen().into_iter().map(|(m, _)| m).collect();
    assert_eq!(messages, ["while down"]);
}

#[tokio::test(start_paused = true)]
async fn shutdown_before_start_does_not_subscribe() {
    let broker = Arc::new(InMemoryBroker::new());
    let shutdown = Shutdown::new();
    shutdown.trigger();

    let report = ListenerRunner::new(RecordingListener::new(), broker.clone(), shutdown.subscribe())
        .run()
        .await
        .unwrap();

    assert_eq!(report, ticketbus_runtime::ListenerReport::default());
    assert_eq!(broker.members(Subject::StreamHealthPing, &group()), 0);
}

#[tokio::test(start_paused = true)]
async fn subscribe_failure_is_returned() {
    let broker = Arc::new(InMemoryBroker::new());
    broker.disconnect();
    let shutdown = Shutdown::new();

    let err = ListenerRunner::new(RecordingListener::new(), broker, shutdown.subscribe())
        .run()
        .await
        .unwrap_err();

    let ListenerError::Subscribe {
        subject, queue_group, ..
    } = err;
    assert_eq!(subject, Subject::StreamHealthPing);
    assert_eq!(queue_group, group());
}
