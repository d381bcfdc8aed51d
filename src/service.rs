//! Composition root: every stage loop on its own thread, sharing one pool,
//! one broker and one shutdown signal.

use std::sync::{Arc, RwLock};

use crate::builder::MailBuilder;
use crate::config::Config;
use crate::dispatcher::{Dispatcher, Feedback};
use crate::error::Error;
use crate::lifecycle::{Shutdown, TaskGroup};
use crate::queue::{Broker, Publisher, ALL_STATS_SUBJECTS, SENDING_SUBJECT};
use crate::sender::Sender;
use crate::smtp::Mailer;
use crate::stats::{StatsSink, StatsWriter};
use crate::storage::PoolStorage;
use crate::validator::Validator;

pub const SENDER_DURABLE: &str = "kannon-sender";
pub const STATS_DURABLE: &str = "kannon-stats";

/// Run the whole pipeline until `shutdown` is triggered or a stage fails.
/// Returns the first stage error, after every stage has stopped.
pub fn run<S, B, Q>(
    config: &Config,
    storage: Arc<RwLock<S>>,
    builder: Arc<B>,
    mailer: Arc<dyn Mailer>,
    broker: Arc<Q>,
    sink: Arc<dyn StatsSink>,
    shutdown: Shutdown,
) -> Result<(), Error>
where
    S: PoolStorage + 'static,
    B: MailBuilder + 'static,
    Q: Broker + 'static,
{
    if !config.is_valid() {
        return Err(Error::Config("refusing to start with an invalid configuration".to_owned()));
    }
    let publisher: Arc<dyn Publisher> = broker.clone();

    // Consumers are bound before anything starts so a broker problem fails fast
    let sending = broker.consumer(SENDER_DURABLE, SENDING_SUBJECT)?;
    let stats = broker.consumer(STATS_DURABLE, ALL_STATS_SUBJECTS)?;
    let mut feedback = Vec::with_capacity(Feedback::ALL.len());
    for kind in Feedback::ALL.iter() {
        feedback.push((*kind, broker.consumer(&kind.durable_name(), &kind.subject())?));
    }

    let validator = Validator::new(storage.clone(), publisher.clone(), config.validator.clone());
    let dispatcher = Arc::new(Dispatcher::new(
        storage,
        builder,
        publisher.clone(),
        config.dispatcher.clone(),
        config.pool.stuck_ttl(),
    ));
    let sender = Sender::new(mailer, publisher, config.sender.clone());
    let writer = StatsWriter::new(sink, config.dispatcher.clone());

    let mut group = TaskGroup::new(shutdown.clone());
    let started = (|| -> Result<(), Error> {
        group.spawn("validator", move |shutdown| validator.run(&shutdown))?;

        let d = dispatcher.clone();
        group.spawn("dispatcher", move |shutdown| d.run_dispatch(&shutdown))?;

        for (kind, consumer) in feedback {
            let d = dispatcher.clone();
            group.spawn(&format!("dispatcher-{}", kind.kind()), move |shutdown| {
                d.run_consumer(kind, &*consumer, &shutdown)
            })?;
        }

        group.spawn("sender", move |shutdown| sender.run(&*sending, &shutdown))?;
        group.spawn("stats", move |shutdown| writer.run(&*stats, &shutdown))?;
        Ok(())
    })();

    if let Err(e) = started {
        error!("(service) cannot start: {}", e);
        shutdown.trigger();
        if let Err(stage) = group.wait() {
            warn!("(service) stage failed while aborting: {}", stage);
        }
        return Err(e);
    }

    info!("(service) all stages running");
    let result = group.wait();
    info!("(service) stopped");
    result
}
