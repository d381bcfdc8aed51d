use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use crate::queue::{
    subject_matches, Broker, Consumer, Publisher, QueueError, QueueMessage, StreamConfig,
};

struct Stored {
    subject: String,
    payload: Vec<u8>,
    published: Instant,
}

#[derive(Default)]
struct ConsumerState {
    filter: String,
    ready: VecDeque<u64>,
    /// sequence -> (delivery count, ack deadline)
    in_flight: HashMap<u64, (u32, Instant)>,
    deliveries: HashMap<u64, u32>,
    dead: Vec<u64>,
}

#[derive(Default)]
struct State {
    next_sequence: u64,
    messages: BTreeMap<u64, Stored>,
    consumers: HashMap<String, ConsumerState>,
}

struct Shared {
    config: StreamConfig,
    state: Mutex<State>,
    available: Condvar,
}

/// In-process stream with durable pull consumers
#[derive(Clone)]
pub struct MemoryQueue {
    shared: Arc<Shared>,
}

impl Default for MemoryQueue {
    fn default() -> MemoryQueue {
        MemoryQueue::new(StreamConfig::default())
    }
}

impl MemoryQueue {
    pub fn new(config: StreamConfig) -> MemoryQueue {
        MemoryQueue {
            shared: Arc::new(Shared {
                config,
                state: Mutex::new(State::default()),
                available: Condvar::new(),
            }),
        }
    }

    fn lock(&self) -> Result<MutexGuard<'_, State>, QueueError> {
        self.shared.state.lock().map_err(|_| QueueError::LockPoisoned)
    }

    /// Bind to the durable consumer `durable`, creating it if needed. A new
    /// consumer starts with every stored message matching `filter`.
    pub fn durable(&self, durable: &str, filter: &str) -> Result<MemoryConsumer, QueueError> {
        let mut state = self.lock()?;
        if !state.consumers.contains_key(durable) {
            let ready = state
                .messages
                .iter()
                .filter(|(_, m)| subject_matches(filter, &m.subject))
                .map(|(seq, _)| *seq)
                .collect();
            debug!("(queue) created consumer {} on {}", durable, filter);
            state.consumers.insert(
                durable.to_owned(),
                ConsumerState {
                    filter: filter.to_owned(),
                    ready,
                    ..Default::default()
                },
            );
        }
        Ok(MemoryConsumer {
            queue: self.clone(),
            durable: durable.to_owned(),
        })
    }

    /// Messages a consumer gave up on after `max_deliver` deliveries
    pub fn dead_letters(&self, durable: &str) -> Result<Vec<QueueMessage>, QueueError> {
        let state = self.lock()?;
        let consumer = state
            .consumers
            .get(durable)
            .ok_or_else(|| QueueError::UnknownConsumer(durable.to_owned()))?;
        Ok(consumer
            .dead
            .iter()
            .filter_map(|seq| {
                state.messages.get(seq).map(|m| QueueMessage {
                    sequence: *seq,
                    subject: m.subject.clone(),
                    payload: m.payload.clone(),
                    delivered: consumer.deliveries.get(seq).cloned().unwrap_or(0),
                })
            })
            .collect())
    }

    /// Messages waiting for or held by a consumer
    pub fn pending(&self, durable: &str) -> Result<usize, QueueError> {
        let state = self.lock()?;
        let consumer = state
            .consumers
            .get(durable)
            .ok_or_else(|| QueueError::UnknownConsumer(durable.to_owned()))?;
        Ok(consumer.ready.len() + consumer.in_flight.len())
    }

    fn expire(&self, state: &mut State) {
        let max_age = self.shared.config.max_age;
        let expired: Vec<u64> = state
            .messages
            .iter()
            .take_while(|(_, m)| m.published.elapsed() > max_age)
            .map(|(seq, _)| *seq)
            .collect();
        for seq in expired {
            state.messages.remove(&seq);
        }
    }

    // Hand unacked messages past their ack deadline back for redelivery.
    // Returns the earliest deadline still pending.
    fn reclaim(&self, durable: &str, consumer: &mut ConsumerState) -> Option<Instant> {
        let now = Instant::now();
        let overdue: Vec<(u64, u32)> = consumer
            .in_flight
            .iter()
            .filter(|(_, pending)| pending.1 <= now)
            .map(|(seq, pending)| (*seq, pending.0))
            .collect();
        for (seq, delivered) in overdue {
            consumer.in_flight.remove(&seq);
            if delivered < self.shared.config.max_deliver {
                debug!("(queue) {} did not ack message {}, redelivering", durable, seq);
                consumer.ready.push_back(seq);
            } else {
                warn!(
                    "(queue) {} dead-lettered unacked message {} after {} deliveries",
                    durable, seq, delivered
                );
                consumer.dead.push(seq);
            }
        }
        consumer.in_flight.values().map(|pending| pending.1).min()
    }

    fn fetch(
        &self,
        durable: &str,
        max: usize,
        wait: Duration,
    ) -> Result<Vec<QueueMessage>, QueueError> {
        let deadline = Instant::now() + wait;
        let ack_wait = self.shared.config.ack_wait;
        let mut state = self.lock()?;
        loop {
            self.expire(&mut state);
            let current = &mut *state;
            let messages = &current.messages;
            let consumer = current
                .consumers
                .get_mut(durable)
                .ok_or_else(|| QueueError::UnknownConsumer(durable.to_owned()))?;
            let next_ack_deadline = self.reclaim(durable, consumer);

            let mut batch = Vec::new();
            while batch.len() < max {
                let seq = match consumer.ready.pop_front() {
                    Some(seq) => seq,
                    None => break,
                };
                // expired while waiting
                let stored = match messages.get(&seq) {
                    Some(stored) => stored,
                    None => continue,
                };
                let delivered = consumer.deliveries.entry(seq).or_insert(0);
                *delivered += 1;
                consumer
                    .in_flight
                    .insert(seq, (*delivered, Instant::now() + ack_wait));
                batch.push(QueueMessage {
                    sequence: seq,
                    subject: stored.subject.clone(),
                    payload: stored.payload.clone(),
                    delivered: *delivered,
                });
            }

            let now = Instant::now();
            if !batch.is_empty() || now >= deadline {
                return Ok(batch);
            }
            let wake = match next_ack_deadline {
                Some(ack_by) if ack_by < deadline => ack_by.max(now),
                _ => deadline,
            };
            state = self
                .shared
                .available
                .wait_timeout(state, wake - now)
                .map_err(|_| QueueError::LockPoisoned)?
                .0;
        }
    }

    fn settle(
        &self,
        durable: &str,
        message: &QueueMessage,
        redeliver: bool,
        dead: bool,
    ) -> Result<(), QueueError> {
        let mut state = self.lock()?;
        let consumer = state
            .consumers
            .get_mut(durable)
            .ok_or_else(|| QueueError::UnknownConsumer(durable.to_owned()))?;
        let (delivered, _) = consumer
            .in_flight
            .remove(&message.sequence)
            .ok_or(QueueError::NotInFlight(message.sequence))?;

        if redeliver && delivered < self.shared.config.max_deliver {
            consumer.ready.push_back(message.sequence);
            drop(state);
            self.shared.available.notify_all();
        } else if redeliver || dead {
            warn!(
                "(queue) {} dead-lettered message {} after {} deliveries",
                durable, message.sequence, delivered
            );
            consumer.dead.push(message.sequence);
        } else {
            consumer.deliveries.remove(&message.sequence);
        }
        Ok(())
    }
}

impl Publisher for MemoryQueue {
    fn publish(&self, subject: &str, data: &[u8]) -> Result<(), QueueError> {
        if !self
            .shared
            .config
            .subjects
            .iter()
            .any(|filter| subject_matches(filter, subject))
        {
            return Err(QueueError::NoStream(subject.to_owned()));
        }

        let mut state = self.lock()?;
        state.next_sequence += 1;
        let seq = state.next_sequence;
        state.messages.insert(
            seq,
            Stored {
                subject: subject.to_owned(),
                payload: data.to_vec(),
                published: Instant::now(),
            },
        );
        for consumer in state.consumers.values_mut() {
            if subject_matches(&consumer.filter, subject) {
                consumer.ready.push_back(seq);
            }
        }
        trace!("(queue) published {} on {}", seq, subject);
        drop(state);
        self.shared.available.notify_all();
        Ok(())
    }
}

impl Broker for MemoryQueue {
    fn consumer(&self, durable: &str, filter: &str) -> Result<Box<dyn Consumer>, QueueError> {
        Ok(Box::new(self.durable(durable, filter)?))
    }
}

/// Handle on one durable consumer of a [`MemoryQueue`]
pub struct MemoryConsumer {
    queue: MemoryQueue,
    durable: String,
}

impl Consumer for MemoryConsumer {
    fn fetch(&self, max: usize, wait: Duration) -> Result<Vec<QueueMessage>, QueueError> {
        self.queue.fetch(&self.durable, max, wait)
    }

    fn ack(&self, message: &QueueMessage) -> Result<(), QueueError> {
        self.queue.settle(&self.durable, message, false, false)
    }

    fn nak(&self, message: &QueueMessage) -> Result<(), QueueError> {
        self.queue.settle(&self.durable, message, true, false)
    }

    fn term(&self, message: &QueueMessage) -> Result<(), QueueError> {
        self.queue.settle(&self.durable, message, false, true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::SENDING_SUBJECT;
    use std::thread;

    const NO_WAIT: Duration = Duration::from_millis(0);

    #[test]
    fn consumers_only_see_their_subjects() {
        let queue = MemoryQueue::default();
        let sending = queue.durable("sender", SENDING_SUBJECT).unwrap();
        let errors = queue.durable("errors", "kannon.stats.error").unwrap();

        queue.publish(SENDING_SUBJECT, b"one").unwrap();
        queue.publish("kannon.stats.error", b"two").unwrap();

        let got = sending.fetch(10, NO_WAIT).unwrap();
        assert_eq!(got.len(), 1);
        assert_eq!(got[0].payload, b"one".to_vec());
        let got = errors.fetch(10, NO_WAIT).unwrap();
        assert_eq!(got.len(), 1);
        assert_eq!(got[0].subject, "kannon.stats.error");
    }

    #[test]
    fn unknown_subjects_are_refused() {
        let queue = MemoryQueue::default();
        assert_eq!(
            queue.publish("other.subject", b"x"),
            Err(QueueError::NoStream("other.subject".to_owned()))
        );
    }

    #[test]
    fn new_durable_backfills() {
        let queue = MemoryQueue::default();
        queue.publish(SENDING_SUBJECT, b"early").unwrap();
        let consumer = queue.durable("late", SENDING_SUBJECT).unwrap();
        assert_eq!(consumer.fetch(10, NO_WAIT).unwrap().len(), 1);
    }

    #[test]
    fn acked_messages_are_gone() {
        let queue = MemoryQueue::default();
        let consumer = queue.durable("sender", SENDING_SUBJECT).unwrap();
        queue.publish(SENDING_SUBJECT, b"x").unwrap();

        let msg = consumer.fetch(1, NO_WAIT).unwrap().remove(0);
        consumer.ack(&msg).unwrap();
        assert!(consumer.fetch(1, NO_WAIT).unwrap().is_empty());
        assert_eq!(consumer.ack(&msg), Err(QueueError::NotInFlight(msg.sequence)));
        assert_eq!(queue.pending("sender").unwrap(), 0);
    }

    #[test]
    fn nak_redelivers_until_dead_letter() {
        let queue = MemoryQueue::new(StreamConfig {
            max_deliver: 3,
            ..Default::default()
        });
        let consumer = queue.durable("errors", "kannon.stats.error").unwrap();
        queue.publish("kannon.stats.error", b"poison").unwrap();

        for attempt in 1..=3 {
            let msg = consumer.fetch(1, NO_WAIT).unwrap().remove(0);
            assert_eq!(msg.delivered, attempt);
            consumer.nak(&msg).unwrap();
        }
        assert!(consumer.fetch(1, NO_WAIT).unwrap().is_empty());

        let dead = queue.dead_letters("errors").unwrap();
        assert_eq!(dead.len(), 1);
        assert_eq!(dead[0].payload, b"poison".to_vec());
    }

    #[test]
    fn unacked_messages_come_back_after_ack_wait() {
        let queue = MemoryQueue::new(StreamConfig {
            ack_wait: Duration::from_millis(20),
            max_deliver: 2,
            ..Default::default()
        });
        let consumer = queue.durable("delivered", "kannon.stats.delivered").unwrap();
        queue.publish("kannon.stats.delivered", b"x").unwrap();

        let first = consumer.fetch(1, NO_WAIT).unwrap().remove(0);
        assert!(consumer.fetch(1, NO_WAIT).unwrap().is_empty());

        // a waiting fetch picks it up once the ack deadline passes
        let again = consumer.fetch(1, Duration::from_secs(5)).unwrap().remove(0);
        assert_eq!(again.sequence, first.sequence);
        assert_eq!(again.delivered, 2);

        // out of deliveries: the next expiry dead-letters it
        thread::sleep(Duration::from_millis(40));
        assert!(consumer.fetch(1, NO_WAIT).unwrap().is_empty());
        assert_eq!(queue.dead_letters("delivered").unwrap().len(), 1);
        assert_eq!(queue.pending("delivered").unwrap(), 0);
    }

    #[test]
    fn term_drops_without_redelivery() {
        let queue = MemoryQueue::default();
        let consumer = queue.durable("sender", SENDING_SUBJECT).unwrap();
        queue.publish(SENDING_SUBJECT, b"x").unwrap();
        let msg = consumer.fetch(1, NO_WAIT).unwrap().remove(0);
        consumer.term(&msg).unwrap();
        assert!(consumer.fetch(1, NO_WAIT).unwrap().is_empty());
        assert_eq!(queue.dead_letters("sender").unwrap().len(), 1);
    }

    #[test]
    fn fetch_wakes_on_publish() {
        let queue = MemoryQueue::default();
        let consumer = queue.durable("sender", SENDING_SUBJECT).unwrap();
        let publisher = queue.clone();
        let handle = thread::spawn(move || {
            thread::sleep(Duration::from_millis(50));
            publisher.publish(SENDING_SUBJECT, b"late").unwrap();
        });
        let got = consumer.fetch(1, Duration::from_secs(5)).unwrap();
        handle.join().unwrap();
        assert_eq!(got.len(), 1);
    }

    #[test]
    fn fetch_times_out_empty() {
        let queue = MemoryQueue::default();
        let consumer = queue.durable("sender", SENDING_SUBJECT).unwrap();
        let started = Instant::now();
        assert!(consumer.fetch(1, Duration::from_millis(30)).unwrap().is_empty());
        assert!(started.elapsed() >= Duration::from_millis(30));
    }
}
