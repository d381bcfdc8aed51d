extern crate env_logger;

use std::sync::{Arc, RwLock};
use std::thread;
use std::time::Duration;

use chrono::Utc;

use crate::builder::{
    DomainKeys, MemoryMessageStore, MessageData, MessageStore, TemplateMailBuilder,
};
use crate::config::Config;
use crate::dispatcher::{Dispatcher, Feedback};
use crate::pool_entry::new_message_id;
use crate::queue::{Consumer, MemoryConsumer, MemoryQueue, ALL_STATS_SUBJECTS, SENDING_SUBJECT};
use crate::sender::Sender;
use crate::service;
use crate::smtp::{DemoMailer, Mailer, SenderError};
use crate::stats::{MemoryStatsSink, Stats, StatsData};
use crate::storage::{MemoryStorage, PoolStorage};
use crate::validator::Validator;
use crate::{PoolStatus, Recipient, Shutdown};

const MESSAGE_ID: &str = "msg_7f3a@sender.example.com";
const DOMAIN: &str = "sender.example.com";

fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

struct ReplyMailer(Result<(), SenderError>);

impl Mailer for ReplyMailer {
    fn send(&self, _from: &str, _to: &str, _body: &[u8]) -> Result<(), SenderError> {
        self.0.clone()
    }
}

fn message_store() -> MemoryMessageStore {
    let store = MemoryMessageStore::new();
    store.add_message(
        MESSAGE_ID,
        MessageData {
            sender_email: "news@sender.example.com".to_owned(),
            sender_alias: "Sender News".to_owned(),
            subject: "Monthly update".to_owned(),
            html: "<p>Hi {{ name }}</p>".to_owned(),
            attachments: vec![],
        },
    );
    store.add_domain(
        DOMAIN,
        DomainKeys {
            dkim_selector: "kannon".to_owned(),
            dkim_private_key: None,
        },
    );
    store
}

fn submit(config: &Config, emails: &[&str]) -> Arc<RwLock<MemoryStorage>> {
    let mut storage = MemoryStorage::new(config.pool.clone());
    let recipients = emails
        .iter()
        .map(|e| Recipient::new(e).with_field("name", "Reader"))
        .collect();
    storage
        .add_recipients(MESSAGE_ID, DOMAIN, recipients, Utc::now())
        .unwrap();
    storage.release_message(MESSAGE_ID).unwrap();
    Arc::new(RwLock::new(storage))
}

fn validator(
    config: &Config,
    storage: &Arc<RwLock<MemoryStorage>>,
    queue: &MemoryQueue,
) -> Validator<MemoryStorage> {
    Validator::new(storage.clone(), Arc::new(queue.clone()), config.validator.clone())
}

fn drain_stats(consumer: &MemoryConsumer) -> Vec<Stats> {
    let messages = consumer.fetch(100, Duration::from_millis(0)).unwrap();
    messages
        .iter()
        .map(|m| {
            consumer.ack(m).unwrap();
            Stats::decode(&m.payload).unwrap()
        })
        .collect()
}

#[test]
fn accepted_flow() {
    init_logging();
    let config = Config::default();
    let storage = submit(&config, &["valid@example.com"]);
    let queue = MemoryQueue::default();
    let stats = queue.durable("observer", ALL_STATS_SUBJECTS).unwrap();

    let validator = validator(&config, &storage, &queue);
    assert_eq!(validator.cycle().unwrap(), 1);

    let entry = storage.read().unwrap().retrieve(MESSAGE_ID, "valid@example.com").unwrap();
    assert_eq!(entry.status, PoolStatus::Scheduled);

    let events = drain_stats(&stats);
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].email, "valid@example.com");
    assert_eq!(events[0].data, StatsData::Accepted);

    // already scheduled, nothing to claim
    assert_eq!(validator.cycle().unwrap(), 0);
}

#[test]
fn rejected_flow() {
    init_logging();
    let config = Config::default();
    let storage = submit(&config, &["not-an-email"]);
    let queue = MemoryQueue::default();
    let stats = queue.durable("observer", ALL_STATS_SUBJECTS).unwrap();

    let validator = validator(&config, &storage, &queue);
    validator.cycle().unwrap();

    assert!(storage.read().unwrap().is_empty());
    let events = drain_stats(&stats);
    assert_eq!(events.len(), 1);
    match events[0].data {
        StatsData::Rejected { ref reason } => assert!(reason.contains("valid email")),
        ref other => panic!("expected a rejection, got {:?}", other),
    }
}

struct Pipeline {
    storage: Arc<RwLock<MemoryStorage>>,
    queue: MemoryQueue,
    validator: Validator<MemoryStorage>,
    dispatcher: Dispatcher<MemoryStorage, TemplateMailBuilder<MemoryMessageStore>>,
    sender: Sender,
}

fn pipeline(emails: &[&str], mailer: Arc<dyn Mailer>) -> Pipeline {
    let config = Config::default();
    let storage = submit(&config, emails);
    let queue = MemoryQueue::default();
    let builder = TemplateMailBuilder::new(message_store(), config.pool.max_send_attempts);
    Pipeline {
        validator: validator(&config, &storage, &queue),
        dispatcher: Dispatcher::new(
            storage.clone(),
            Arc::new(builder),
            Arc::new(queue.clone()),
            config.dispatcher.clone(),
            config.pool.stuck_ttl(),
        ),
        sender: Sender::new(mailer, Arc::new(queue.clone()), config.sender.clone()),
        storage,
        queue,
    }
}

impl Pipeline {
    // One pass through every stage, applying `kind` feedback at the end
    fn step(&self, kind: Feedback) -> usize {
        let sending = self.queue.durable("kannon-sender", SENDING_SUBJECT).unwrap();
        let feedback = self.queue.durable(&kind.durable_name(), &kind.subject()).unwrap();

        self.validator.cycle().unwrap();
        assert_eq!(self.dispatcher.dispatch_cycle().unwrap(), 1);
        for message in sending.fetch(10, Duration::from_millis(0)).unwrap() {
            self.sender.process(&sending, &message).unwrap();
        }
        assert_eq!(self.queue.pending("kannon-sender").unwrap(), 0);
        self.dispatcher
            .consume_batch(kind, &feedback, Duration::from_millis(0))
            .unwrap()
    }
}

#[test]
fn successful_delivery() {
    init_logging();
    let pipeline = pipeline(&["reader@example.org"], Arc::new(ReplyMailer(Ok(()))));
    let stats = pipeline.queue.durable("observer", ALL_STATS_SUBJECTS).unwrap();

    assert_eq!(pipeline.step(Feedback::Delivered), 1);
    assert!(pipeline.storage.read().unwrap().is_empty());

    let kinds: Vec<&str> = drain_stats(&stats).iter().map(|s| s.data.kind()).collect();
    assert_eq!(kinds, vec!["accepted", "delivered"]);
}

#[test]
fn transient_failure_is_rescheduled() {
    init_logging();
    let failure = SenderError::transient(421, "too many connections");
    let pipeline = pipeline(&["reader@example.org"], Arc::new(ReplyMailer(Err(failure))));

    let before = Utc::now();
    assert_eq!(pipeline.step(Feedback::Error), 1);

    let entry = pipeline
        .storage
        .read()
        .unwrap()
        .retrieve(MESSAGE_ID, "reader@example.org")
        .unwrap();
    assert_eq!(entry.status, PoolStatus::Scheduled);
    assert_eq!(entry.send_attempts_count, 1);
    assert!(entry.scheduled_time > before);
    assert!(entry.scheduled_time > Utc::now());

    // not due yet
    assert_eq!(pipeline.dispatcher.dispatch_cycle().unwrap(), 0);
}

#[test]
fn permanent_failure_is_removed() {
    init_logging();
    let failure = SenderError::from_reply(550, "mailbox unavailable");
    let pipeline = pipeline(&["reader@example.org"], Arc::new(ReplyMailer(Err(failure))));
    let stats = pipeline.queue.durable("observer", ALL_STATS_SUBJECTS).unwrap();

    assert_eq!(pipeline.step(Feedback::Bounced), 1);
    assert!(pipeline.storage.read().unwrap().is_empty());

    let events = drain_stats(&stats);
    assert_eq!(
        events.last().map(|s| s.data.clone()),
        Some(StatsData::Bounced {
            permanent: true,
            code: 550,
            message: "mailbox unavailable".to_owned(),
        })
    );
}

#[test]
fn unbuildable_email_is_bounced() {
    init_logging();
    let config = Config::default();
    let storage = submit(&config, &["reader@example.org"]);
    let queue = MemoryQueue::default();
    let stats = queue.durable("observer", ALL_STATS_SUBJECTS).unwrap();

    // the template was never stored
    let store = MemoryMessageStore::new();
    let builder = TemplateMailBuilder::new(store, config.pool.max_send_attempts);
    let dispatcher = Dispatcher::new(
        storage.clone(),
        Arc::new(builder),
        Arc::new(queue.clone()),
        config.dispatcher.clone(),
        config.pool.stuck_ttl(),
    );

    validator(&config, &storage, &queue).cycle().unwrap();
    assert_eq!(dispatcher.dispatch_cycle().unwrap(), 0);
    assert!(storage.read().unwrap().is_empty());

    let kinds: Vec<&str> = drain_stats(&stats).iter().map(|s| s.data.kind()).collect();
    assert_eq!(kinds, vec!["accepted", "bounced"]);
    assert_eq!(dispatcher.dispatch_cycle().unwrap(), 0);
}

#[test]
fn service_runs_until_the_pool_is_empty() {
    init_logging();
    let mut config = Config::default();
    config.validator.interval_ms = 10;
    config.dispatcher.interval_ms = 10;
    config.dispatcher.fetch_wait_ms = 20;
    config.sender.fetch_wait_ms = 20;
    config.sender.max_jobs = 3;

    // a second message from the same tenant shares the template
    let second = new_message_id(DOMAIN);
    let store = message_store();
    store.add_message(&second, store.message(MESSAGE_ID).unwrap());

    let storage = submit(
        &config,
        &["one@example.org", "two@example.org", "three@example.org", "broken address"],
    );
    {
        let mut pool = storage.write().unwrap();
        pool.add_recipients(&second, DOMAIN, vec![Recipient::new("one@example.org")], Utc::now())
            .unwrap();
        pool.release_message(&second).unwrap();
    }
    let builder = Arc::new(TemplateMailBuilder::new(store, config.pool.max_send_attempts));
    let queue = Arc::new(MemoryQueue::default());
    let sink = Arc::new(MemoryStatsSink::new());
    let shutdown = Shutdown::new();

    let runner = {
        let (config, storage, queue, sink, shutdown) =
            (config.clone(), storage.clone(), queue.clone(), sink.clone(), shutdown.clone());
        thread::spawn(move || {
            service::run(&config, storage, builder, Arc::new(DemoMailer), queue, sink, shutdown)
        })
    };

    for _ in 0..500 {
        if storage.read().unwrap().is_empty() && sink.count("delivered") == 4 {
            break;
        }
        thread::sleep(Duration::from_millis(10));
    }
    shutdown.trigger();
    runner.join().unwrap().unwrap();

    assert!(storage.read().unwrap().is_empty());
    assert_eq!(sink.count("accepted"), 4);
    assert_eq!(sink.count("rejected"), 1);
    assert_eq!(sink.count("delivered"), 4);
}
