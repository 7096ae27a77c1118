//! Redpanda broker for the ticketbus messaging core.
//!
//! Implements [`Broker`] over any Kafka-compatible cluster (Redpanda, Apache
//! Kafka, MSK) with rdkafka.
//!
//! # Mapping
//!
//! | Messaging core            | Kafka                                             |
//! |---------------------------|---------------------------------------------------|
//! | subject `ticket:created`  | topic `{cluster_id}.ticket.created`               |
//! | queue group + durable name| consumer group `{cluster_id}.{group}[.{durable}]` |
//! | sequence                  | partition offset                                  |
//! | ack                       | offset commit                                     |
//! | deliver all available     | `auto.offset.reset = earliest`                    |
//!
//! # Delivery Semantics
//!
//! **At-least-once delivery** with manual offset commits:
//! - A publish resolves once every in-sync replica has the message
//!   (`acks=all` by default).
//! - The consumer keeps fetching while fewer than `max_in_flight` deliveries
//!   are unacknowledged, so one slow or failing message does not hold back
//!   the messages stored after it.
//! - An acked offset is committed once every earlier fetched offset of its
//!   partition is acked too. Acked offsets above an open one are delivered
//!   again after a restart or rebalance.
//! - If no ack arrives within the subscription's ack wait, the message is
//!   delivered again from memory, after any newly fetched messages.
//! - Closing a subscription leaves the consumer group; uncommitted messages
//!   go to the remaining members after the rebalance.
//!
//! # Example
//!
//! ```no_run
//! use ticketbus_core::{Broker, ConsumerGroupIdentity, QueueGroup, Subject, SubscriptionOptions};
//! use ticketbus_redpanda::RedpandaBroker;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let identity = ConsumerGroupIdentity::new("ticketing", "orders-1", "orders-service")?;
//! let broker = RedpandaBroker::builder()
//!     .brokers("localhost:9092")
//!     .identity(&identity)
//!     .build()?;
//! broker.ping().await?;
//!
//! broker.publish(Subject::StreamHealthPing, br#"{"message":"hi"}"#.to_vec()).await?;
//! let subscription = broker
//!     .subscribe(Subject::StreamHealthPing, SubscriptionOptions::new(QueueGroup::new("orders-service")))
//!     .await?;
//! # Ok(())
//! # }
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]

use chrono::{DateTime, Utc};
use futures::StreamExt;
use rdkafka::config::ClientConfig;
use rdkafka::consumer::{CommitMode, Consumer, StreamConsumer};
use rdkafka::error::{KafkaError, RDKafkaErrorCode};
use rdkafka::message::Message;
use rdkafka::producer::{FutureProducer, FutureRecord, Producer};
use rdkafka::util::Timeout;
use rdkafka::{Offset, TopicPartitionList};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::time::Duration;
use ticketbus_core::{
    AckHandle, Acknowledger, Broker, BrokerError, BrokerFuture, ConsumerGroupIdentity, Delivery,
    MessageMetadata, PublishAck, Subject, Subscription, SubscriptionControl, SubscriptionOptions,
};
use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;

const DEFAULT_CLUSTER_ID: &str = "ticketbus";
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5);

/// Redpanda broker.
///
/// Holds one producer shared by every publish; each subscription creates its
/// own consumer.
///
/// # Example
///
/// ```no_run
/// use ticketbus_redpanda::RedpandaBroker;
///
/// # fn example() -> Result<(), Box<dyn std::error::Error>> {
/// // Basic configuration
/// let broker = RedpandaBroker::new("localhost:9092")?;
///
/// // Custom configuration
/// let broker = RedpandaBroker::builder()
///     .brokers("localhost:9092,localhost:9093")
///     .cluster_id("ticketing")
///     .compression("lz4")
///     .build()?;
/// # Ok(())
/// # }
/// ```
pub struct RedpandaBroker {
    producer: FutureProducer,
    brokers: String,
    cluster_id: String,
    client_id: Option<String>,
    timeout: Duration,
}

impl RedpandaBroker {
    /// Create a broker with default configuration.
    ///
    /// # Errors
    ///
    /// Returns [`BrokerError::ConnectionFailed`] if the producer cannot be
    /// created from the given addresses.
    pub fn new(brokers: &str) -> Result<Self, BrokerError> {
        Self::builder().brokers(brokers).build()
    }

    /// Create a new builder for configuring the broker.
    #[must_use]
    pub fn builder() -> RedpandaBrokerBuilder {
        RedpandaBrokerBuilder::default()
    }

    /// Bootstrap servers.
    #[must_use]
    pub fn brokers(&self) -> &str {
        &self.brokers
    }

    /// Topic backing `subject`.
    #[must_use]
    pub fn topic(&self, subject: Subject) -> String {
        topic_name(&self.cluster_id, subject)
    }

    /// Check that the cluster answers a metadata request.
    ///
    /// rdkafka connects lazily; call this at startup to fail fast when the
    /// cluster is unreachable.
    ///
    /// # Errors
    ///
    /// Returns [`BrokerError::ConnectionFailed`] if no broker responds within
    /// the configured timeout.
    pub async fn ping(&self) -> Result<(), BrokerError> {
        let producer = self.producer.clone();
        let timeout = self.timeout;
        let result = tokio::task::spawn_blocking(move || {
            producer
                .client()
                .fetch_metadata(None, timeout)
                .map(|metadata| metadata.brokers().len())
        })
        .await
        .map_err(|e| BrokerError::ConnectionFailed(format!("Metadata task failed: {e}")))?;

        match result {
            Ok(brokers) => {
                tracing::info!(brokers = %self.brokers, reachable = brokers, "Redpanda cluster reachable");
                Ok(())
            }
            Err(e) => Err(BrokerError::ConnectionFailed(format!(
                "Cannot reach {}: {e}",
                self.brokers
            ))),
        }
    }

    fn consumer_config(&self, group_id: &str, options: &SubscriptionOptions) -> ClientConfig {
        let mut config = ClientConfig::new();
        config
            .set("bootstrap.servers", &self.brokers)
            .set("group.id", group_id)
            .set("enable.auto.commit", "false")
            .set(
                "auto.offset.reset",
                if options.deliver_all_available { "earliest" } else { "latest" },
            )
            .set("session.timeout.ms", "6000")
            .set("enable.partition.eof", "false");
        if let Some(client_id) = &self.client_id {
            config.set("client.id", client_id);
        }
        config
    }
}

impl std::fmt::Debug for RedpandaBroker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedpandaBroker")
            .field("brokers", &self.brokers)
            .field("cluster_id", &self.cluster_id)
            .field("client_id", &self.client_id)
            .field("timeout", &self.timeout)
            .finish_non_exhaustive()
    }
}

/// Builder for configuring a [`RedpandaBroker`].
///
/// # Example
///
/// ```no_run
/// use ticketbus_redpanda::RedpandaBroker;
/// use std::time::Duration;
///
/// # fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let broker = RedpandaBroker::builder()
///     .brokers("localhost:9092")
///     .producer_acks("all")
///     .timeout(Duration::from_secs(10))
///     .build()?;
/// # Ok(())
/// # }
/// ```
#[derive(Default)]
pub struct RedpandaBrokerBuilder {
    brokers: Option<String>,
    cluster_id: Option<String>,
    client_id: Option<String>,
    producer_acks: Option<String>,
    compression: Option<String>,
    timeout: Option<Duration>,
}

impl RedpandaBrokerBuilder {
    /// Set the broker addresses (comma separated).
    #[must_use]
    pub fn brokers(mut self, brokers: impl Into<String>) -> Self {
        self.brokers = Some(brokers.into());
        self
    }

    /// Namespace for topics and consumer groups.
    ///
    /// Default: `"ticketbus"`
    #[must_use]
    pub fn cluster_id(mut self, cluster_id: impl Into<String>) -> Self {
        self.cluster_id = Some(cluster_id.into());
        self
    }

    /// Client id reported to the cluster.
    #[must_use]
    pub fn client_id(mut self, client_id: impl Into<String>) -> Self {
        self.client_id = Some(client_id.into());
        self
    }

    /// Take cluster id and client id from a validated identity.
    #[must_use]
    pub fn identity(self, identity: &ConsumerGroupIdentity) -> Self {
        self.cluster_id(identity.cluster_id())
            .client_id(identity.client_id())
    }

    /// Set the producer acknowledgment mode: `"1"` or `"all"`.
    ///
    /// Default: `"all"`. `"0"` is rejected because a publish must not resolve
    /// before the message is stored.
    #[must_use]
    pub fn producer_acks(mut self, acks: impl Into<String>) -> Self {
        self.producer_acks = Some(acks.into());
        self
    }

    /// Set the compression codec: `"none"`, `"gzip"`, `"snappy"`, `"lz4"`, `"zstd"`.
    ///
    /// Default: `"none"`
    #[must_use]
    pub fn compression(mut self, compression: impl Into<String>) -> Self {
        self.compression = Some(compression.into());
        self
    }

    /// Set the producer delivery timeout and the metadata timeout of
    /// [`RedpandaBroker::ping`].
    ///
    /// Default: 5 seconds
    #[must_use]
    pub const fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Build the [`RedpandaBroker`].
    ///
    /// # Errors
    ///
    /// Returns [`BrokerError::ConnectionFailed`] if:
    /// - Brokers not set
    /// - `producer_acks` is `"0"`
    /// - The producer cannot be created
    pub fn build(self) -> Result<RedpandaBroker, BrokerError> {
        let brokers = self
            .brokers
            .ok_or_else(|| BrokerError::ConnectionFailed("Brokers not configured".to_string()))?;
        let acks = self.producer_acks.unwrap_or_else(|| "all".to_string());
        if acks == "0" {
            return Err(BrokerError::ConnectionFailed(
                "producer_acks=0 cannot confirm durable storage".to_string(),
            ));
        }
        let compression = self.compression.unwrap_or_else(|| "none".to_string());
        let timeout = self.timeout.unwrap_or(DEFAULT_TIMEOUT);
        let cluster_id = self
            .cluster_id
            .unwrap_or_else(|| DEFAULT_CLUSTER_ID.to_string());

        let mut producer_config = ClientConfig::new();
        producer_config
            .set("bootstrap.servers", &brokers)
            .set("message.timeout.ms", timeout.as_millis().to_string())
            .set("acks", &acks)
            .set("enable.idempotence", if acks == "all" { "true" } else { "false" })
            .set("compression.type", &compression);
        if let Some(client_id) = &self.client_id {
            producer_config.set("client.id", client_id);
        }

        let producer: FutureProducer = producer_config.create().map_err(|e| {
            BrokerError::ConnectionFailed(format!("Failed to create producer: {e}"))
        })?;

        tracing::info!(
            brokers = %brokers,
            cluster_id = %cluster_id,
            acks = %acks,
            compression = %compression,
            "RedpandaBroker created"
        );

        Ok(RedpandaBroker {
            producer,
            brokers,
            cluster_id,
            client_id: self.client_id,
            timeout,
        })
    }
}

impl Broker for RedpandaBroker {
    fn publish(&self, subject: Subject, payload: Vec<u8>) -> BrokerFuture<'_, PublishAck> {
        let topic = self.topic(subject);
        let timeout = self.timeout;

        Box::pin(async move {
            let record = FutureRecord::<(), _>::to(&topic).payload(&payload);

            match self.producer.send(record, Timeout::After(timeout)).await {
                Ok((partition, offset)) => {
                    tracing::debug!(
                        subject = %subject,
                        topic = %topic,
                        partition,
                        offset,
                        "Message stored"
                    );
                    Ok(PublishAck {
                        subject,
                        sequence: sequence_of(offset),
                    })
                }
                Err((kafka_error, _)) => {
                    tracing::error!(subject = %subject, topic = %topic, error = %kafka_error, "Failed to store message");
                    Err(publish_error(subject, &kafka_error, timeout))
                }
            }
        })
    }

    fn subscribe(
        &self,
        subject: Subject,
        options: SubscriptionOptions,
    ) -> BrokerFuture<'_, Subscription> {
        let topic = self.topic(subject);
        let group_id = consumer_group_id(&self.cluster_id, &options);
        let config = self.consumer_config(&group_id, &options);

        Box::pin(async move {
            if !options.manual_ack {
                return Err(BrokerError::SubscriptionFailed {
                    subject,
                    reason: "manual acknowledgment is required".to_string(),
                });
            }

            let consumer: StreamConsumer =
                config
                    .create()
                    .map_err(|e| BrokerError::SubscriptionFailed {
                        subject,
                        reason: format!("Failed to create consumer: {e}"),
                    })?;
            consumer
                .subscribe(&[topic.as_str()])
                .map_err(|e| BrokerError::SubscriptionFailed {
                    subject,
                    reason: format!("Failed to subscribe to topic '{topic}': {e}"),
                })?;

            tracing::info!(
                subject = %subject,
                topic = %topic,
                consumer_group = %group_id,
                deliver_all_available = options.deliver_all_available,
                ack_wait_ms = u64::try_from(options.ack_wait.as_millis()).unwrap_or(u64::MAX),
                max_in_flight = options.max_in_flight,
                "Subscribed to topic"
            );

            let (tx, rx) = mpsc::unbounded_channel();
            let (close_tx, close_rx) = oneshot::channel();
            let (done_tx, done_rx) = oneshot::channel();

            let task = ConsumerTask {
                consumer,
                subject,
                topic,
                ack_wait: options.ack_wait,
                max_in_flight: options.max_in_flight.max(1),
            };
            tokio::spawn(task.run(tx, close_rx, done_tx));

            let deliveries = async_stream::stream! {
                let mut rx = rx;
                while let Some(result) = rx.recv().await {
                    yield result;
                }
            };

            Ok(Subscription::new(
                subject,
                options,
                Box::pin(deliveries),
                Box::new(RedpandaControl { close_tx, done_rx }),
            ))
        })
    }
}

/// Topic backing `subject` in `cluster_id`.
///
/// Kafka topic names allow only `[A-Za-z0-9._-]`; anything else becomes `.`
/// in the subject and `-` in the cluster id.
#[must_use]
pub fn topic_name(cluster_id: &str, subject: Subject) -> String {
    let subject = subject.as_str().replace(':', ".");
    format!("{}.{subject}", sanitize(cluster_id))
}

/// Consumer group for a durable queue-group subscription.
///
/// Members sharing cluster id, queue group and durable name share one
/// committed position.
#[must_use]
pub fn consumer_group_id(cluster_id: &str, options: &SubscriptionOptions) -> String {
    let cluster_id = sanitize(cluster_id);
    let group = options.queue_group.as_str();
    if options.durable_name == group {
        format!("{cluster_id}.{group}")
    } else {
        format!("{cluster_id}.{group}.{}", options.durable_name)
    }
}

fn sanitize(name: &str) -> String {
    name.chars()
        .map(|c| if c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-') { c } else { '-' })
        .collect()
}

fn sequence_of(offset: i64) -> u64 {
    u64::try_from(offset).unwrap_or_default()
}

fn publish_error(subject: Subject, error: &KafkaError, timeout: Duration) -> BrokerError {
    match error.rdkafka_error_code() {
        Some(RDKafkaErrorCode::MessageTimedOut | RDKafkaErrorCode::RequestTimedOut) => {
            BrokerError::Timeout {
                operation: format!("storing message on '{subject}'"),
                after_ms: u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX),
            }
        }
        Some(RDKafkaErrorCode::AllBrokersDown | RDKafkaErrorCode::BrokerTransportFailure) => {
            BrokerError::ConnectionFailed(error.to_string())
        }
        _ => BrokerError::PublishFailed {
            subject,
            reason: error.to_string(),
        },
    }
}

/// Reply channel handed from an ack to the consumer task.
type AckReply = oneshot::Sender<Result<(), BrokerError>>;

/// Ack of one delivery, forwarded to the consumer task.
struct AckRequest {
    partition: i32,
    offset: i64,
    token: u64,
    reply: AckReply,
}

/// Ack that asks the consumer task to settle the delivered offset.
struct RedpandaAck {
    sequence: u64,
    partition: i32,
    offset: i64,
    token: u64,
    tx: mpsc::UnboundedSender<AckRequest>,
}

impl Acknowledger for RedpandaAck {
    fn ack(self: Box<Self>) -> BrokerFuture<'static, ()> {
        Box::pin(async move {
            let sequence = self.sequence;
            let (reply, reply_rx) = oneshot::channel();
            let request = AckRequest {
                partition: self.partition,
                offset: self.offset,
                token: self.token,
                reply,
            };
            self.tx.send(request).map_err(|_| BrokerError::AckFailed {
                sequence,
                reason: "subscription closed".to_string(),
            })?;
            reply_rx.await.map_err(|_| BrokerError::Closed)?
        })
    }
}

struct RedpandaControl {
    close_tx: oneshot::Sender<()>,
    done_rx: oneshot::Receiver<()>,
}

impl SubscriptionControl for RedpandaControl {
    fn close(self: Box<Self>) -> BrokerFuture<'static, ()> {
        Box::pin(async move {
            // The task may already be gone if the cluster ended the stream.
            let _ = self.close_tx.send(());
            let _ = self.done_rx.await;
            Ok(())
        })
    }
}

// ============================================================================
// Delivery window
// ============================================================================

/// Payload of a fetched message, kept until it is acknowledged.
struct Fetched {
    payload: Vec<u8>,
    published_at: DateTime<Utc>,
}

enum Held {
    Pending {
        message: Fetched,
        attempt: u32,
        token: u64,
        deadline: Instant,
    },
    Waiting {
        message: Fetched,
        attempt: u32,
    },
    Acked,
}

/// A delivery ready to hand to the subscriber.
struct Outgoing {
    partition: i32,
    offset: i64,
    attempt: u32,
    token: u64,
    payload: Vec<u8>,
    published_at: DateTime<Utc>,
}

#[derive(Debug, PartialEq, Eq)]
enum AckOutcome {
    /// The delivery was redelivered or is unknown.
    Stale,
    /// Acked, but an earlier offset of the partition is still open.
    Held,
    /// Acked; everything below this offset is settled.
    Commit(i64),
}

/// Every fetched offset that is not yet committed, per partition.
///
/// Offsets commit as a contiguous acked prefix. An offset whose ack wait
/// elapses waits for redelivery without holding back the ones after it.
#[derive(Default)]
struct Window {
    partitions: HashMap<i32, BTreeMap<i64, Held>>,
    waiting: BTreeSet<(i32, i64)>,
    in_flight: usize,
    next_token: u64,
}

impl Window {
    /// Deliveries handed out and neither acked nor expired.
    const fn in_flight(&self) -> usize {
        self.in_flight
    }

    fn has_waiting(&self) -> bool {
        !self.waiting.is_empty()
    }

    /// Track a freshly fetched message.
    ///
    /// A message fetched again after a rebalance continues its attempt count.
    fn deliver(
        &mut self,
        partition: i32,
        offset: i64,
        message: Fetched,
        ack_wait: Duration,
        now: Instant,
    ) -> Outgoing {
        let previous = self
            .partitions
            .get_mut(&partition)
            .and_then(|held| held.remove(&offset));
        let attempt = match previous {
            Some(Held::Pending { attempt, .. }) => {
                self.in_flight -= 1;
                attempt + 1
            }
            Some(Held::Waiting { attempt, .. }) => {
                self.waiting.remove(&(partition, offset));
                attempt + 1
            }
            Some(Held::Acked) | None => 1,
        };
        self.hand(partition, offset, message, attempt, ack_wait, now)
    }

    /// Hand out the oldest delivery waiting for redelivery.
    fn redeliver_next(&mut self, ack_wait: Duration, now: Instant) -> Option<Outgoing> {
        let (partition, offset) = self.waiting.pop_first()?;
        let held = self.partitions.get_mut(&partition)?;
        if !matches!(held.get(&offset), Some(Held::Waiting { .. })) {
            return None;
        }
        let Some(Held::Waiting { message, attempt }) = held.remove(&offset) else {
            return None;
        };
        Some(self.hand(partition, offset, message, attempt + 1, ack_wait, now))
    }

    fn hand(
        &mut self,
        partition: i32,
        offset: i64,
        message: Fetched,
        attempt: u32,
        ack_wait: Duration,
        now: Instant,
    ) -> Outgoing {
        let token = self.next_token;
        self.next_token += 1;
        let outgoing = Outgoing {
            partition,
            offset,
            attempt,
            token,
            payload: message.payload.clone(),
            published_at: message.published_at,
        };
        self.partitions.entry(partition).or_default().insert(
            offset,
            Held::Pending {
                message,
                attempt,
                token,
                deadline: now + ack_wait,
            },
        );
        self.in_flight += 1;
        outgoing
    }

    /// Move overdue deliveries to the redelivery queue.
    ///
    /// Returns `(partition, offset, attempt)` of each expired delivery.
    fn expire(&mut self, now: Instant) -> Vec<(i32, i64, u32)> {
        let mut expired = Vec::new();
        for (partition, held) in &mut self.partitions {
            for (offset, entry) in held.iter_mut() {
                if !matches!(entry, Held::Pending { deadline, .. } if *deadline <= now) {
                    continue;
                }
                if let Held::Pending { message, attempt, .. } = std::mem::replace(entry, Held::Acked) {
                    *entry = Held::Waiting { message, attempt };
                    self.waiting.insert((*partition, *offset));
                    self.in_flight -= 1;
                    expired.push((*partition, *offset, attempt));
                }
            }
        }
        expired
    }

    fn next_deadline(&self) -> Option<Instant> {
        self.partitions
            .values()
            .flat_map(BTreeMap::values)
            .filter_map(|held| match held {
                Held::Pending { deadline, .. } => Some(*deadline),
                _ => None,
            })
            .min()
    }

    fn ack(&mut self, partition: i32, offset: i64, token: u64) -> AckOutcome {
        let Some(held) = self.partitions.get_mut(&partition) else {
            return AckOutcome::Stale;
        };
        match held.get(&offset) {
            Some(Held::Pending { token: current, .. }) if *current == token => {}
            _ => return AckOutcome::Stale,
        }
        held.insert(offset, Held::Acked);
        self.in_flight -= 1;

        let mut settled = None;
        while let Some(entry) = held.first_entry() {
            if !matches!(entry.get(), Held::Acked) {
                break;
            }
            settled = Some(*entry.key() + 1);
            entry.remove();
        }
        settled.map_or(AckOutcome::Held, AckOutcome::Commit)
    }
}

// ============================================================================
// Consumer task
// ============================================================================

type DeliverySender = mpsc::UnboundedSender<Result<Delivery, BrokerError>>;

/// Owns one consumer and feeds its subscription.
struct ConsumerTask {
    consumer: StreamConsumer,
    subject: Subject,
    topic: String,
    ack_wait: Duration,
    max_in_flight: usize,
}

impl ConsumerTask {
    async fn run(
        self,
        tx: DeliverySender,
        mut close_rx: oneshot::Receiver<()>,
        done_tx: oneshot::Sender<()>,
    ) {
        let (ack_tx, mut ack_rx) = mpsc::unbounded_channel::<AckRequest>();
        let mut window = Window::default();

        {
            let mut stream = self.consumer.stream();

            loop {
                let now = Instant::now();
                for (partition, offset, attempt) in window.expire(now) {
                    tracing::debug!(
                        subject = %self.subject,
                        partition,
                        sequence = sequence_of(offset),
                        attempt,
                        "Ack wait elapsed, scheduling redelivery"
                    );
                }
                let has_room = window.in_flight() < self.max_in_flight;
                let next_deadline = window.next_deadline();
                let wake_at = next_deadline.unwrap_or(now + self.ack_wait);

                tokio::select! {
                    biased;
                    _ = &mut close_rx => break,
                    Some(request) = ack_rx.recv() => self.settle(&mut window, request),
                    next = stream.next(), if has_room => {
                        let message = match next {
                            None => break,
                            Some(Err(e)) => {
                                tracing::warn!(subject = %self.subject, error = %e, "Failed to receive message");
                                let err = BrokerError::ConnectionFailed(format!("Failed to receive message: {e}"));
                                if tx.send(Err(err)).is_err() {
                                    break;
                                }
                                continue;
                            }
                            Some(Ok(message)) => message,
                        };
                        let fetched = Fetched {
                            payload: message.payload().map(<[u8]>::to_vec).unwrap_or_default(),
                            published_at: message
                                .timestamp()
                                .to_millis()
                                .and_then(DateTime::from_timestamp_millis)
                                .unwrap_or_else(Utc::now),
                        };
                        let outgoing = window.deliver(
                            message.partition(),
                            message.offset(),
                            fetched,
                            self.ack_wait,
                            Instant::now(),
                        );
                        if !self.hand_out(&tx, &ack_tx, outgoing) {
                            break;
                        }
                    }
                    () = std::future::ready(()), if has_room && window.has_waiting() => {
                        if let Some(outgoing) = window.redeliver_next(self.ack_wait, Instant::now()) {
                            if !self.hand_out(&tx, &ack_tx, outgoing) {
                                break;
                            }
                        }
                    }
                    () = tokio::time::sleep_until(wake_at), if next_deadline.is_some() => {}
                }
            }
        }

        self.consumer.unsubscribe();
        tracing::debug!(
            subject = %self.subject,
            topic = %self.topic,
            in_flight = window.in_flight(),
            "Consumer task exiting"
        );
        let _ = done_tx.send(());
    }

    /// Send one delivery to the subscriber. `false` once it is gone.
    fn hand_out(
        &self,
        tx: &DeliverySender,
        ack_tx: &mpsc::UnboundedSender<AckRequest>,
        outgoing: Outgoing,
    ) -> bool {
        let sequence = sequence_of(outgoing.offset);
        let metadata = MessageMetadata {
            subject: self.subject,
            sequence,
            redelivered: outgoing.attempt > 1,
            delivery_attempt: outgoing.attempt,
            published_at: outgoing.published_at,
        };
        let ack = AckHandle::new(
            sequence,
            Box::new(RedpandaAck {
                sequence,
                partition: outgoing.partition,
                offset: outgoing.offset,
                token: outgoing.token,
                tx: ack_tx.clone(),
            }),
        );
        if tx.send(Ok(Delivery::new(metadata, outgoing.payload, ack))).is_err() {
            tracing::debug!(subject = %self.subject, "Subscriber dropped, exiting consumer task");
            return false;
        }
        true
    }

    fn settle(&self, window: &mut Window, request: AckRequest) {
        let sequence = sequence_of(request.offset);
        let result = match window.ack(request.partition, request.offset, request.token) {
            AckOutcome::Stale => Err(BrokerError::AckFailed {
                sequence,
                reason: "ack wait elapsed before acknowledgment".to_string(),
            }),
            AckOutcome::Held => Ok(()),
            AckOutcome::Commit(next_offset) => self.commit(request.partition, next_offset, sequence),
        };
        let _ = request.reply.send(result);
    }

    fn commit(&self, partition: i32, next_offset: i64, sequence: u64) -> Result<(), BrokerError> {
        let mut offsets = TopicPartitionList::new();
        offsets
            .add_partition_offset(&self.topic, partition, Offset::Offset(next_offset))
            .and_then(|()| self.consumer.commit(&offsets, CommitMode::Async))
            .map_err(|e| {
                tracing::warn!(
                    subject = %self.subject,
                    partition,
                    offset = next_offset,
                    error = %e,
                    "Failed to commit offset"
                );
                BrokerError::AckFailed {
                    sequence,
                    reason: e.to_string(),
                }
            })
    }
}
