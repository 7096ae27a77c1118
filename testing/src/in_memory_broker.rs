//! In-memory [`Broker`] with durable, queue-group and ack-wait semantics.
//!
//! Behaves like a streaming broker as far as the messaging core can tell:
//!
//! - Every subject has an append-only log; sequences start at 1.
//! - A subscription is identified by `(subject, queue group, durable name)`.
//!   All subscribers sharing that key form one group with one delivery
//!   cursor, so each message goes to exactly one member at a time.
//! - A new group starts at the beginning of the log (or at its end with
//!   [`SubscriptionOptions::only_new_messages`]). A group outlives its
//!   members, so resubscribing resumes where the group left off.
//! - Deliveries stay pending until acknowledged. A pending delivery is
//!   redelivered once the member's ack wait elapses, or immediately when its
//!   member closes the subscription.
//! - A member never holds more than `max_in_flight` pending deliveries.
//! - Messages never handed out go ahead of redeliveries, so a message
//!   waiting for redelivery does not hold back the ones stored after it.
//!
//! Deadlines use [`tokio::time`], so tests can run with paused time.
//!
//! # Example
//!
//! ```
//! use futures::StreamExt;
//! use ticketbus_core::{Broker, QueueGroup, Subject, SubscriptionOptions};
//! use ticketbus_testing::InMemoryBroker;
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let broker = InMemoryBroker::new();
//! broker.publish(Subject::StreamHealthPing, br#"{"message":"hi"}"#.to_vec()).await?;
//!
//! let options = SubscriptionOptions::new(QueueGroup::new("orders"));
//! let mut subscription = broker.subscribe(Subject::StreamHealthPing, options).await?;
//! let delivery = subscription.next().await.unwrap()?;
//! assert_eq!(delivery.metadata().sequence, 1);
//!
//! let (_, _, ack) = delivery.into_parts();
//! ack.ack().await?;
//! assert_eq!(broker.outstanding(Subject::StreamHealthPing, &QueueGroup::new("orders")), 0);
//! # Ok(())
//! # }
//! ```
//!
//! [`SubscriptionOptions::only_new_messages`]: ticketbus_core::SubscriptionOptions::only_new_messages

use chrono::{DateTime, Utc};
use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;
use ticketbus_core::{
    AckHandle, Acknowledger, Broker, BrokerError, BrokerFuture, Delivery, Event, MessageMetadata,
    PublishAck, QueueGroup, Subject, Subscription, SubscriptionControl, SubscriptionOptions,
};
use tokio::sync::{Notify, mpsc};
use tokio::time::Instant;

type DeliverySender = mpsc::UnboundedSender<Result<Delivery, BrokerError>>;

struct StoredMessage {
    data: Vec<u8>,
    published_at: DateTime<Utc>,
}

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
struct GroupKey {
    subject: Subject,
    queue_group: QueueGroup,
    durable_name: String,
}

struct Member {
    id: u64,
    tx: DeliverySender,
    in_flight: usize,
    max_in_flight: usize,
    ack_wait: Duration,
}

struct Pending {
    member: u64,
    token: u64,
    deadline: Instant,
}

struct Group {
    /// Index of the first log entry never handed out
    cursor: usize,
    pending: HashMap<u64, Pending>,
    redeliver: BTreeSet<u64>,
    attempts: HashMap<u64, u32>,
    members: Vec<Member>,
    round_robin: usize,
    acked: u64,
    notify: Arc<Notify>,
}

impl Group {
    fn new(cursor: usize) -> Self {
        Self {
            cursor,
            pending: HashMap::new(),
            redeliver: BTreeSet::new(),
            attempts: HashMap::new(),
            members: Vec::new(),
            round_robin: 0,
            acked: 0,
            notify: Arc::new(Notify::new()),
        }
    }

    fn next_sequence(&self, log_len: usize) -> Option<u64> {
        if self.cursor < log_len {
            Some(self.cursor as u64 + 1)
        } else {
            self.redeliver.first().copied()
        }
    }

    fn take_sequence(&mut self, sequence: u64) {
        if sequence == self.cursor as u64 + 1 {
            self.cursor += 1;
        } else {
            self.redeliver.remove(&sequence);
        }
    }

    fn member_with_capacity(&mut self) -> Option<usize> {
        let count = self.members.len();
        for offset in 0..count {
            let index = (self.round_robin + offset) % count;
            let member = &self.members[index];
            if member.in_flight < member.max_in_flight {
                self.round_robin = (index + 1) % count;
                return Some(index);
            }
        }
        None
    }

    fn release(&mut self, member_id: u64) {
        if let Some(member) = self.members.iter_mut().find(|m| m.id == member_id) {
            member.in_flight = member.in_flight.saturating_sub(1);
        }
    }

    fn remove_member(&mut self, member_id: u64) {
        self.members.retain(|m| m.id != member_id);
        let orphaned: Vec<u64> = self
            .pending
            .iter()
            .filter(|(_, p)| p.member == member_id)
            .map(|(sequence, _)| *sequence)
            .collect();
        for sequence in orphaned {
            self.pending.remove(&sequence);
            self.redeliver.insert(sequence);
        }
        if self.round_robin >= self.members.len() {
            self.round_robin = 0;
        }
    }

    fn outstanding(&self, log_len: usize) -> usize {
        self.pending.len() + self.redeliver.len() + log_len.saturating_sub(self.cursor)
    }
}

struct State {
    connected: bool,
    logs: HashMap<Subject, Vec<StoredMessage>>,
    groups: HashMap<GroupKey, Group>,
    next_id: u64,
}

struct Inner {
    state: Mutex<State>,
}

impl Inner {
    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// In-memory streaming broker for tests.
///
/// Cheap to clone; clones share the same logs and groups.
#[derive(Clone)]
pub struct InMemoryBroker {
    inner: Arc<Inner>,
}

impl InMemoryBroker {
    /// Create a connected, empty broker.
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                state: Mutex::new(State {
                    connected: true,
                    logs: HashMap::new(),
                    groups: HashMap::new(),
                    next_id: 1,
                }),
            }),
        }
    }

    /// Simulate the broker becoming unreachable.
    ///
    /// Publishes, subscribes and acknowledgments fail and nothing is
    /// delivered until [`InMemoryBroker::reconnect`].
    pub fn disconnect(&self) {
        self.inner.state().connected = false;
    }

    /// Make the broker reachable again and resume deliveries.
    pub fn reconnect(&self) {
        let mut state = self.inner.state();
        state.connected = true;
        for group in state.groups.values() {
            group.notify.notify_one();
        }
    }

    /// Raw payloads stored under `subject`, in sequence order.
    #[must_use]
    pub fn published(&self, subject: Subject) -> Vec<Vec<u8>> {
        self.inner
            .state()
            .logs
            .get(&subject)
            .map(|log| log.iter().map(|m| m.data.clone()).collect())
            .unwrap_or_default()
    }

    /// Decoded payloads stored under `E::SUBJECT`, skipping undecodable ones.
    #[must_use]
    pub fn published_events<E: Event>(&self) -> Vec<E> {
        self.published(E::SUBJECT)
            .iter()
            .filter_map(|bytes| E::decode(bytes).ok())
            .collect()
    }

    /// Messages of `subject` not yet acknowledged by `queue_group`:
    /// never delivered, pending, or waiting for redelivery.
    ///
    /// Before the group first subscribes, the whole log is outstanding.
    #[must_use]
    pub fn outstanding(&self, subject: Subject, queue_group: &QueueGroup) -> usize {
        let state = self.inner.state();
        let log_len = state.logs.get(&subject).map_or(0, Vec::len);
        let mut groups = state
            .groups
            .iter()
            .filter(|(key, _)| key.subject == subject && key.queue_group == *queue_group)
            .peekable();
        if groups.peek().is_none() {
            return log_len;
        }
        groups.map(|(_, group)| group.outstanding(log_len)).sum()
    }

    /// Messages of `subject` acknowledged by `queue_group`.
    #[must_use]
    pub fn acked(&self, subject: Subject, queue_group: &QueueGroup) -> u64 {
        self.inner
            .state()
            .groups
            .iter()
            .filter(|(key, _)| key.subject == subject && key.queue_group == *queue_group)
            .map(|(_, group)| group.acked)
            .sum()
    }

    /// Live subscribers of `subject` in `queue_group`.
    #[must_use]
    pub fn members(&self, subject: Subject, queue_group: &QueueGroup) -> usize {
        self.inner
            .state()
            .groups
            .iter()
            .filter(|(key, _)| key.subject == subject && key.queue_group == *queue_group)
            .map(|(_, group)| group.members.len())
            .sum()
    }
}

impl Default for InMemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for InMemoryBroker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.inner.state();
        f.debug_struct("InMemoryBroker")
            .field("connected", &state.connected)
            .field("subjects", &state.logs.len())
            .field("groups", &state.groups.len())
            .finish()
    }
}

impl Broker for InMemoryBroker {
    fn publish(&self, subject: Subject, payload: Vec<u8>) -> BrokerFuture<'_, PublishAck> {
        Box::pin(async move {
            let mut state = self.inner.state();
            if !state.connected {
                return Err(BrokerError::ConnectionFailed("broker unreachable".to_string()));
            }

            let log = state.logs.entry(subject).or_default();
            log.push(StoredMessage {
                data: payload,
                published_at: Utc::now(),
            });
            let sequence = log.len() as u64;

            for (key, group) in &state.groups {
                if key.subject == subject {
                    group.notify.notify_one();
                }
            }

            Ok(PublishAck { subject, sequence })
        })
    }

    fn subscribe(
        &self,
        subject: Subject,
        options: SubscriptionOptions,
    ) -> BrokerFuture<'_, Subscription> {
        Box::pin(async move {
            if !options.manual_ack {
                return Err(BrokerError::SubscriptionFailed {
                    subject,
                    reason: "only manual acknowledgment is supported".to_string(),
                });
            }

            let key = GroupKey {
                subject,
                queue_group: options.queue_group.clone(),
                durable_name: options.durable_name.clone(),
            };
            let (tx, rx) = mpsc::unbounded_channel();

            let (member_id, notify, created) = {
                let mut state = self.inner.state();
                if !state.connected {
                    return Err(BrokerError::ConnectionFailed("broker unreachable".to_string()));
                }
                let log_len = state.logs.get(&subject).map_or(0, Vec::len);
                let member_id = state.next_id;
                state.next_id += 1;

                let created = !state.groups.contains_key(&key);
                let group = state.groups.entry(key.clone()).or_insert_with(|| {
                    Group::new(if options.deliver_all_available { 0 } else { log_len })
                });
                group.members.push(Member {
                    id: member_id,
                    tx,
                    in_flight: 0,
                    max_in_flight: options.max_in_flight.max(1),
                    ack_wait: options.ack_wait,
                });
                group.notify.notify_one();
                (member_id, Arc::clone(&group.notify), created)
            };

            if created {
                tokio::spawn(dispatch_loop(Arc::downgrade(&self.inner), key.clone(), notify));
            }

            tracing::debug!(
                subject = %subject,
                queue_group = %key.queue_group,
                durable_name = %key.durable_name,
                member_id,
                "In-memory subscription joined"
            );

            let deliveries = async_stream::stream! {
                let mut rx = rx;
                while let Some(item) = rx.recv().await {
                    yield item;
                }
            };
            let control = MemberControl {
                inner: Arc::downgrade(&self.inner),
                key,
                member_id,
            };

            Ok(Subscription::new(
                subject,
                options,
                Box::pin(deliveries),
                Box::new(control),
            ))
        })
    }
}

/// Hands out deliveries for one group until the broker is dropped.
async fn dispatch_loop(inner: Weak<Inner>, key: GroupKey, notify: Arc<Notify>) {
    loop {
        let next_deadline = {
            let Some(inner) = inner.upgrade() else {
                return;
            };
            pump(&inner, &key, Instant::now())
        };

        match next_deadline {
            Some(deadline) => {
                tokio::select! {
                    () = notify.notified() => {}
                    () = tokio::time::sleep_until(deadline) => {}
                }
            }
            None => notify.notified().await,
        }
    }
}

/// Expire overdue deliveries and hand out as many as capacity allows.
///
/// Returns the earliest pending deadline.
fn pump(inner: &Arc<Inner>, key: &GroupKey, now: Instant) -> Option<Instant> {
    let mut guard = inner.state();
    let State {
        connected,
        logs,
        groups,
        next_id,
    } = &mut *guard;
    let group = groups.get_mut(key)?;

    let expired: Vec<u64> = group
        .pending
        .iter()
        .filter(|(_, p)| p.deadline <= now)
        .map(|(sequence, _)| *sequence)
        .collect();
    for sequence in expired {
        if let Some(pending) = group.pending.remove(&sequence) {
            group.release(pending.member);
            group.redeliver.insert(sequence);
            tracing::debug!(subject = %key.subject, sequence, "Ack wait elapsed, scheduling redelivery");
        }
    }

    if *connected {
        let log: &[StoredMessage] = logs
            .get(&key.subject)
            .map(Vec::as_slice)
            .unwrap_or_default();

        while let Some(sequence) = group.next_sequence(log.len()) {
            let Some(index) = group.member_with_capacity() else {
                break;
            };
            group.take_sequence(sequence);

            let Some(message) = usize::try_from(sequence - 1).ok().and_then(|i| log.get(i)) else {
                continue;
            };
            let attempt = {
                let attempts = group.attempts.entry(sequence).or_insert(0);
                *attempts += 1;
                *attempts
            };
            let token = *next_id;
            *next_id += 1;

            let metadata = MessageMetadata {
                subject: key.subject,
                sequence,
                redelivered: attempt > 1,
                delivery_attempt: attempt,
                published_at: message.published_at,
            };
            let ack = AckHandle::new(
                sequence,
                Box::new(MemoryAck {
                    inner: Arc::downgrade(inner),
                    key: key.clone(),
                    sequence,
                    token,
                }),
            );
            let delivery = Delivery::new(metadata, message.data.clone(), ack);

            let member = &mut group.members[index];
            if member.tx.send(Ok(delivery)).is_err() {
                // Subscriber dropped without closing.
                let member_id = member.id;
                group.remove_member(member_id);
                group.redeliver.insert(sequence);
                if let Some(attempts) = group.attempts.get_mut(&sequence) {
                    *attempts -= 1;
                }
                continue;
            }
            member.in_flight += 1;
            let deadline = now + member.ack_wait;
            let member_id = member.id;
            group.pending.insert(
                sequence,
                Pending {
                    member: member_id,
                    token,
                    deadline,
                },
            );
        }
    }

    group.pending.values().map(|p| p.deadline).min()
}

struct MemoryAck {
    inner: Weak<Inner>,
    key: GroupKey,
    sequence: u64,
    token: u64,
}

impl Acknowledger for MemoryAck {
    fn ack(self: Box<Self>) -> BrokerFuture<'static, ()> {
        Box::pin(async move {
            let inner = self.inner.upgrade().ok_or(BrokerError::Closed)?;
            let mut state = inner.state();
            if !state.connected {
                return Err(BrokerError::ConnectionFailed("broker unreachable".to_string()));
            }
            let group = state.groups.get_mut(&self.key).ok_or(BrokerError::Closed)?;

            match group.pending.get(&self.sequence) {
                Some(pending) if pending.token == self.token => {
                    let member = pending.member;
                    group.pending.remove(&self.sequence);
                    group.release(member);
                    group.attempts.remove(&self.sequence);
                    group.acked += 1;
                    group.notify.notify_one();
                    Ok(())
                }
                _ => Err(BrokerError::AckFailed {
                    sequence: self.sequence,
                    reason: "ack wait elapsed before acknowledgment".to_string(),
                }),
            }
        })
    }
}

struct MemberControl {
    inner: Weak<Inner>,
    key: GroupKey,
    member_id: u64,
}

impl SubscriptionControl for MemberControl {
    fn close(self: Box<Self>) -> BrokerFuture<'static, ()> {
        Box::pin(async move {
            let Some(inner) = self.inner.upgrade() else {
                return Ok(());
            };
            let mut state = inner.state();
            if let Some(group) = state.groups.get_mut(&self.key) {
                group.remove_member(self.member_id);
                group.notify.notify_one();
            }
            tracing::debug!(
                subject = %self.key.subject,
                queue_group = %self.key.queue_group,
                member_id = self.member_id,
                "In-memory subscription closed"
            );
            Ok(())
        })
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use futures::StreamExt;

    fn options(group: &str) -> SubscriptionOptions {
        SubscriptionOptions::new(QueueGroup::new(group)).with_ack_wait(Duration::from_secs(30))
    }

    async fn next(subscription: &mut Subscription) -> Delivery {
        tokio::time::timeout(Duration::from_secs(60), subscription.next())
            .await
            .unwrap()
            .unwrap()
            .unwrap()
    }

    #[tokio::test(start_paused = true)]
    async fn sequences_increase_per_subject() {
        let broker = InMemoryBroker::new();
        let a = broker.publish(Subject::TicketCreated, b"1".to_vec()).await.unwrap();
        let b = broker.publish(Subject::TicketCreated, b"2".to_vec()).await.unwrap();
        let c = broker.publish(Subject::TicketUpdated, b"3".to_vec()).await.unwrap();
        assert_eq!((a.sequence, b.sequence, c.sequence), (1, 2, 1));
    }

    #[tokio::test(start_paused = true)]
    async fn new_group_replays_from_start() {
        let broker = InMemoryBroker::new();
        broker.publish(Subject::TicketCreated, b"old".to_vec()).await.unwrap();

        let mut sub = broker.subscribe(Subject::TicketCreated, options("g")).await.unwrap();
        let delivery = next(&mut sub).await;
        assert_eq!(delivery.data(), b"old");
        assert!(!delivery.metadata().redelivered);
    }

    #[tokio::test(start_paused = true)]
    async fn only_new_messages_skips_history() {
        let broker = InMemoryBroker::new();
        broker.publish(Subject::TicketCreated, b"old".to_vec()).await.unwrap();

        let mut sub = broker
            .subscribe(Subject::TicketCreated, options("g").only_new_messages())
            .await
            .unwrap();
        broker.publish(Subject::TicketCreated, b"new".to_vec()).await.unwrap();

        assert_eq!(next(&mut sub).await.metadata().sequence, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn unacked_delivery_is_redelivered_after_ack_wait() {
        let broker = InMemoryBroker::new();
        broker.publish(Subject::TicketCreated, b"x".to_vec()).await.unwrap();
        let mut sub = broker.subscribe(Subject::TicketCreated, options("g")).await.unwrap();

        let first = next(&mut sub).await;
        let started = Instant::now();
        drop(first);

        let second = next(&mut sub).await;
        assert!(started.elapsed() >= Duration::from_secs(30));
        assert_eq!(second.metadata().sequence, 1);
        assert!(second.metadata().redelivered);
        assert_eq!(second.metadata().delivery_attempt, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn acked_delivery_is_not_redelivered() {
        let broker = InMemoryBroker::new();
        let group = QueueGroup::new("g");
        broker.publish(Subject::TicketCreated, b"x".to_vec()).await.unwrap();
        let mut sub = broker.subscribe(Subject::TicketCreated, options("g")).await.unwrap();

        let (_, _, ack) = next(&mut sub).await.into_parts();
        ack.ack().await.unwrap();

        let more = tokio::time::timeout(Duration::from_secs(120), sub.next()).await;
        assert!(more.is_err());
        assert_eq!(broker.outstanding(Subject::TicketCreated, &group), 0);
        assert_eq!(broker.acked(Subject::TicketCreated, &group), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn late_ack_after_redelivery_fails() {
        let broker = InMemoryBroker::new();
        broker.publish(Subject::TicketCreated, b"x".to_vec()).await.unwrap();
        let mut sub = broker.subscribe(Subject::TicketCreated, options("g")).await.unwrap();

        let (_, _, stale) = next(&mut sub).await.into_parts();
        let _redelivered = next(&mut sub).await;

        assert!(matches!(
            stale.ack().await,
            Err(BrokerError::AckFailed { sequence: 1, .. })
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn queue_group_members_share_deliveries() {
        let broker = InMemoryBroker::new();
        let mut a = broker.subscribe(Subject::TicketCreated, options("g")).await.unwrap();
        let mut b = broker.subscribe(Subject::TicketCreated, options("g")).await.unwrap();

        broker.publish(Subject::TicketCreated, b"1".to_vec()).await.unwrap();
        broker.publish(Subject::TicketCreated, b"2".to_vec()).await.unwrap();

        let first = next(&mut a).await;
        let second = next(&mut b).await;
        let mut sequences = vec![first.metadata().sequence, second.metadata().sequence];
        sequences.sort_unstable();
        assert_eq!(sequences, vec![1, 2]);
    }

    #[tokio::test(start_paused = true)]
    async fn separate_groups_each_get_every_message() {
        let broker = InMemoryBroker::new();
        let mut orders = broker.subscribe(Subject::TicketCreated, options("orders")).await.unwrap();
        let mut payments = broker.subscribe(Subject::TicketCreated, options("payments")).await.unwrap();

        broker.publish(Subject::TicketCreated, b"1".to_vec()).await.unwrap();

        assert_eq!(next(&mut orders).await.metadata().sequence, 1);
        assert_eq!(next(&mut payments).await.metadata().sequence, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn close_hands_pending_to_remaining_member_immediately() {
        let broker = InMemoryBroker::new();
        broker.publish(Subject::TicketCreated, b"1".to_vec()).await.unwrap();

        let mut a = broker.subscribe(Subject::TicketCreated, options("g")).await.unwrap();
        let held = next(&mut a).await;
        let mut b = broker.subscribe(Subject::TicketCreated, options("g")).await.unwrap();

        let started = Instant::now();
        a.close().await.unwrap();
        drop(held);

        let moved = next(&mut b).await;
        assert_eq!(moved.metadata().sequence, 1);
        assert!(started.elapsed() < Duration::from_secs(30));
        assert_eq!(broker.members(Subject::TicketCreated, &QueueGroup::new("g")), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn resubscribing_resumes_durable_progress() {
        let broker = InMemoryBroker::new();
        broker.publish(Subject::TicketCreated, b"1".to_vec()).await.unwrap();
        broker.publish(Subject::TicketCreated, b"2".to_vec()).await.unwrap();

        let mut sub = broker.subscribe(Subject::TicketCreated, options("g")).await.unwrap();
        let (_, _, ack) = next(&mut sub).await.into_parts();
        ack.ack().await.unwrap();
        sub.close().await.unwrap();

        let mut again = broker.subscribe(Subject::TicketCreated, options("g")).await.unwrap();
        assert_eq!(next(&mut again).await.metadata().sequence, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn max_in_flight_limits_pending_per_member() {
        let broker = InMemoryBroker::new();
        for i in 0..3u8 {
            broker.publish(Subject::TicketCreated, vec![i]).await.unwrap();
        }
        let mut sub = broker
            .subscribe(Subject::TicketCreated, options("g").with_max_in_flight(2))
            .await
            .unwrap();

        let first = next(&mut sub).await;
        let _second = next(&mut sub).await;
        let third = tokio::time::timeout(Duration::from_secs(1), sub.next()).await;
        assert!(third.is_err());

        let (_, _, ack) = first.into_parts();
        ack.ack().await.unwrap();
        assert_eq!(next(&mut sub).await.metadata().sequence, 3);
    }

    #[tokio::test(start_paused = true)]
    async fn waiting_redelivery_does_not_hold_back_later_messages() {
        let broker = InMemoryBroker::new();
        broker.publish(Subject::TicketUpdated, b"1".to_vec()).await.unwrap();
        broker.publish(Subject::TicketUpdated, b"2".to_vec()).await.unwrap();
        let mut sub = broker
            .subscribe(Subject::TicketUpdated, options("g").with_max_in_flight(1))
            .await
            .unwrap();

        let first = next(&mut sub).await;
        assert_eq!(first.metadata().sequence, 1);
        drop(first);

        let second = next(&mut sub).await;
        assert_eq!(second.metadata().sequence, 2);
        assert!(!second.metadata().redelivered);
        let (_, _, ack) = second.into_parts();
        ack.ack().await.unwrap();

        let again = next(&mut sub).await;
        assert_eq!(again.metadata().sequence, 1);
        assert_eq!(again.metadata().delivery_attempt, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn whole_log_is_outstanding_before_the_group_subscribes() {
        let broker = InMemoryBroker::new();
        let group = QueueGroup::new("g");
        broker.publish(Subject::TicketCreated, b"1".to_vec()).await.unwrap();
        broker.publish(Subject::TicketCreated, b"2".to_vec()).await.unwrap();
        assert_eq!(broker.outstanding(Subject::TicketCreated, &group), 2);

        let mut sub = broker.subscribe(Subject::TicketCreated, options("g")).await.unwrap();
        for _ in 0..2 {
            let (_, _, ack) = next(&mut sub).await.into_parts();
            ack.ack().await.unwrap();
        }
        assert_eq!(broker.outstanding(Subject::TicketCreated, &group), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn disconnected_broker_refuses_publish() {
        let broker = InMemoryBroker::new();
        broker.disconnect();
        assert!(matches!(
            broker.publish(Subject::TicketCreated, b"x".to_vec()).await,
            Err(BrokerError::ConnectionFailed(_))
        ));
        assert!(broker.published(Subject::TicketCreated).is_empty());

        broker.reconnect();
        broker.publish(Subject::TicketCreated, b"x".to_vec()).await.unwrap();
        assert_eq!(broker.published(Subject::TicketCreated).len(), 1);
    }
}
