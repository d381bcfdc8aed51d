use std::sync::mpsc::{self, Receiver};
use std::sync::{Arc, Mutex};
use std::thread;

use crate::config::SenderConfig;
use crate::delivery_result::DeliveryResult;
use crate::email_id::EmailId;
use crate::error::Error;
use crate::lifecycle::Shutdown;
use crate::prepared_email::EmailToSend;
use crate::queue::{Consumer, Publisher, QueueMessage};
use crate::smtp::Mailer;
use crate::stats::Stats;

/// Delivers queued emails with at most `max_jobs` SMTP transactions in flight
pub struct Sender {
    mailer: Arc<dyn Mailer>,
    publisher: Arc<dyn Publisher>,
    config: SenderConfig,
}

impl Sender {
    pub fn new(
        mailer: Arc<dyn Mailer>,
        publisher: Arc<dyn Publisher>,
        config: SenderConfig,
    ) -> Sender {
        Sender {
            mailer,
            publisher,
            config,
        }
    }

    /// Pull from `consumer` until shutdown, then wait for in-flight sends
    pub fn run(&self, consumer: &dyn Consumer, shutdown: &Shutdown) -> Result<(), Error> {
        let max_jobs = self.config.max_jobs.max(1);
        info!("(sender) started with {} jobs", max_jobs);

        let (jobs, receiver) = mpsc::sync_channel::<QueueMessage>(max_jobs);
        let receiver = Mutex::new(receiver);

        thread::scope(|scope| -> Result<(), Error> {
            for n in 0..max_jobs {
                let receiver = &receiver;
                thread::Builder::new()
                    .name(format!("sender-{}", n))
                    .spawn_scoped(scope, move || self.work(consumer, receiver))?;
            }

            let mut result: Result<(), Error> = Ok(());
            while !shutdown.is_triggered() {
                let messages = match consumer.fetch(max_jobs, self.config.fetch_wait()) {
                    Ok(messages) => messages,
                    Err(e) => {
                        error!("(sender) fetch failed: {}", e);
                        shutdown.wait_timeout(self.config.fetch_wait());
                        continue;
                    }
                };
                for message in messages {
                    if jobs.send(message).is_err() {
                        result = Err(Error::TaskPanicked("sender worker".to_owned()));
                        break;
                    }
                }
                if result.is_err() {
                    break;
                }
            }

            // workers finish what is queued, then see the channel close
            drop(jobs);
            info!("(sender) draining");
            result
        })?;

        info!("(sender) terminated");
        Ok(())
    }

    fn work(&self, consumer: &dyn Consumer, receiver: &Mutex<Receiver<QueueMessage>>) {
        loop {
            let next = match receiver.lock() {
                Ok(guard) => guard.recv(),
                Err(_) => return,
            };
            let message = match next {
                Ok(message) => message,
                Err(_) => return,
            };
            if let Err(e) = self.process(consumer, &message) {
                error!("(sender) message {}: {}", message.sequence, e);
            }
        }
    }

    /// Deliver one queued email and publish the outcome. The queue message is
    /// acked whatever the SMTP result; retries go through the pool.
    pub fn process(&self, consumer: &dyn Consumer, message: &QueueMessage) -> Result<(), Error> {
        let email = match EmailToSend::decode(&message.payload) {
            Ok(email) => email,
            Err(e) => {
                error!("(sender) dropping undecodable email {}: {}", message.sequence, e);
                consumer.term(message)?;
                return Ok(());
            }
        };
        let id: EmailId = match email.email_id.parse() {
            Ok(id) => id,
            Err(e) => {
                error!("(sender) dropping email to {}: {}", email.to, e);
                consumer.term(message)?;
                return Ok(());
            }
        };

        let result = self.mailer.send(&email.return_path, &email.to, &email.body);
        let outcome = DeliveryResult::from_send(result, email.should_retry);
        match outcome {
            DeliveryResult::Delivered => {
                info!("(sender) delivered {} of {}", id.email, id.message_id)
            }
            DeliveryResult::Deferred { code, ref message } => warn!(
                "(sender) deferred {} of {}: {} {}",
                id.email, id.message_id, code, message
            ),
            DeliveryResult::Failed { code, ref message, .. } => warn!(
                "(sender) bounced {} of {}: {} {}",
                id.email, id.message_id, code, message
            ),
        }

        let stats = Stats::for_email_id(&id, outcome.into_stats_data());
        if let Err(e) = stats.publish(&*self.publisher) {
            error!(
                "(sender) cannot publish outcome for {} of {}: {}",
                id.email, id.message_id, e
            );
        }
        consumer.ack(message)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::{MemoryConsumer, MemoryQueue, ALL_STATS_SUBJECTS, SENDING_SUBJECT};
    use crate::smtp::demo::DemoMailer;
    use crate::smtp::SenderError;
    use crate::stats::StatsData;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    /// Records how many sends overlap
    #[derive(Default)]
    struct CountingMailer {
        current: AtomicUsize,
        peak: AtomicUsize,
    }

    impl Mailer for CountingMailer {
        fn send(&self, _from: &str, _to: &str, _body: &[u8]) -> Result<(), SenderError> {
            let now = self.current.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            thread::sleep(Duration::from_millis(20));
            self.current.fetch_sub(1, Ordering::SeqCst);
            Ok(())
        }
    }

    fn run_until_drained(sender: &Sender, queue: &MemoryQueue, consumer: &MemoryConsumer) {
        let shutdown = Shutdown::new();
        thread::scope(|scope| {
            let handle = scope.spawn(|| sender.run(consumer, &shutdown));
            for _ in 0..500 {
                if queue.pending("sender").unwrap() == 0 {
                    break;
                }
                thread::sleep(Duration::from_millis(10));
            }
            shutdown.trigger();
            handle.join().unwrap().unwrap();
        });
    }

    fn queue_email(queue: &MemoryQueue, to: &str, should_retry: bool) {
        let email = EmailToSend {
            to: to.to_owned(),
            return_path: "news@sender.example.com".to_owned(),
            body: b"Subject: hi\r\n\r\nhello".to_vec(),
            email_id: EmailId::new(to, "msg_1@sender.example.com", "sender.example.com")
                .to_string(),
            should_retry,
        };
        queue.publish(SENDING_SUBJECT, &email.encode().unwrap()).unwrap();
    }

    fn outcomes(queue: &MemoryQueue) -> Vec<Stats> {
        let stats = queue.durable("outcomes", ALL_STATS_SUBJECTS).unwrap();
        stats
            .fetch(100, Duration::from_millis(0))
            .unwrap()
            .iter()
            .map(|m| Stats::decode(&m.payload).unwrap())
            .collect()
    }

    #[test]
    fn outcomes_are_classified_and_everything_is_acked() {
        let queue = MemoryQueue::default();
        let consumer = queue.durable("sender", SENDING_SUBJECT).unwrap();
        queue_email(&queue, "ok@example.org", true);
        queue_email(&queue, "error@example.org", true);
        queue_email(&queue, "error-final@example.org", false);
        queue.publish(SENDING_SUBJECT, b"junk").unwrap();

        let config = SenderConfig::default();
        let sender = Sender::new(Arc::new(DemoMailer), Arc::new(queue.clone()), config);
        for message in consumer.fetch(10, Duration::from_millis(0)).unwrap() {
            sender.process(&consumer, &message).unwrap();
        }
        assert_eq!(queue.pending("sender").unwrap(), 0);
        assert_eq!(queue.dead_letters("sender").unwrap().len(), 1);

        let kinds: Vec<(String, &str)> = outcomes(&queue)
            .iter()
            .map(|s| (s.email.clone(), s.data.kind()))
            .collect();
        assert_eq!(
            kinds,
            vec![
                ("ok@example.org".to_owned(), "delivered"),
                ("error@example.org".to_owned(), "error"),
                ("error-final@example.org".to_owned(), "bounced"),
            ]
        );
    }

    #[test]
    fn run_drains_before_returning() {
        let queue = MemoryQueue::default();
        let consumer = queue.durable("sender", SENDING_SUBJECT).unwrap();
        for n in 0..25 {
            queue_email(&queue, &format!("user{}@example.org", n), true);
        }

        let config = SenderConfig {
            max_jobs: 4,
            fetch_wait_ms: 20,
        };
        let sender = Sender::new(Arc::new(DemoMailer), Arc::new(queue.clone()), config);
        run_until_drained(&sender, &queue, &consumer);

        let delivered = outcomes(&queue)
            .iter()
            .filter(|s| s.data == StatsData::Delivered)
            .count();
        assert_eq!(delivered, 25);
    }

    #[test]
    fn never_more_than_max_jobs_in_flight() {
        let queue = MemoryQueue::default();
        let consumer = queue.durable("sender", SENDING_SUBJECT).unwrap();
        for n in 0..20 {
            queue_email(&queue, &format!("user{}@example.org", n), true);
        }

        let mailer = Arc::new(CountingMailer::default());
        let config = SenderConfig {
            max_jobs: 3,
            fetch_wait_ms: 20,
        };
        let sender = Sender::new(mailer.clone(), Arc::new(queue.clone()), config);
        run_until_drained(&sender, &queue, &consumer);

        let peak = mailer.peak.load(Ordering::SeqCst);
        assert!(peak <= 3, "{} sends overlapped", peak);
        assert!(peak > 1);
        let delivered = outcomes(&queue)
            .iter()
            .filter(|s| s.data == StatsData::Delivered)
            .count();
        assert_eq!(delivered, 20);
    }
}
