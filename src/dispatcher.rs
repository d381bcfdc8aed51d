use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};

use crate::builder::{BuildError, MailBuilder};
use crate::config::DispatcherConfig;
use crate::error::Error;
use crate::lifecycle::Shutdown;
use crate::pool_entry::PoolEntry;
use crate::prepared_email::EmailToSend;
use crate::queue::{Consumer, Publisher, QueueError, QueueMessage, SENDING_SUBJECT};
use crate::smtp::codes;
use crate::stats::{stats_subject, Stats, StatsData};
use crate::storage::{self, PoolStorage, StuckTtl};

/// Delivery feedback the dispatcher applies to the pool
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Feedback {
    /// Transient failure, try again later
    Error,
    Delivered,
    /// Permanent failure, or out of retries
    Bounced,
}

impl Feedback {
    pub const ALL: [Feedback; 3] = [Feedback::Error, Feedback::Delivered, Feedback::Bounced];

    pub fn kind(self) -> &'static str {
        match self {
            Feedback::Error => "error",
            Feedback::Delivered => "delivered",
            Feedback::Bounced => "bounced",
        }
    }

    pub fn subject(self) -> String {
        stats_subject(self.kind())
    }

    pub fn durable_name(self) -> String {
        format!("kannon-dispatcher-{}", self.kind())
    }
}

/// Hands due pool entries to the sender and applies its feedback
pub struct Dispatcher<S: PoolStorage, B: MailBuilder> {
    storage: Arc<RwLock<S>>,
    builder: Arc<B>,
    publisher: Arc<dyn Publisher>,
    config: DispatcherConfig,
    stuck_ttl: StuckTtl,
}

impl<S: PoolStorage, B: MailBuilder> Dispatcher<S, B> {
    pub fn new(
        storage: Arc<RwLock<S>>,
        builder: Arc<B>,
        publisher: Arc<dyn Publisher>,
        config: DispatcherConfig,
        stuck_ttl: StuckTtl,
    ) -> Dispatcher<S, B> {
        Dispatcher {
            storage,
            builder,
            publisher,
            config,
            stuck_ttl,
        }
    }

    /// The dispatch loop. Also releases stuck rows every sweep interval.
    pub fn run_dispatch(&self, shutdown: &Shutdown) -> Result<(), Error> {
        info!("(dispatcher) started");
        let mut last_sweep = Instant::now();
        loop {
            match self.dispatch_cycle() {
                Ok(0) => {}
                Ok(n) => debug!("(dispatcher) dispatched {} emails", n),
                Err(e) if e.is_fatal() => return Err(e),
                Err(e) => error!("(dispatcher) cycle failed: {}", e),
            }

            if last_sweep.elapsed() >= self.config.sweep_interval() {
                last_sweep = Instant::now();
                if let Err(e) = self.sweep() {
                    if e.is_fatal() {
                        return Err(e);
                    }
                    error!("(dispatcher) sweep failed: {}", e);
                }
            }

            if shutdown.wait_timeout(self.config.interval()) {
                break;
            }
        }
        info!("(dispatcher) terminated");
        Ok(())
    }

    /// Claim due entries, build them and publish them for sending.
    ///
    /// An entry that cannot be built is bounced and removed, since building
    /// it again gives the same result. An entry whose publish fails stays in
    /// `Sending` until the sweep releases it.
    pub fn dispatch_cycle(&self) -> Result<usize, Error> {
        let entries = storage::lock(&self.storage)?.prepare_for_send(self.config.batch_size)?;
        let mut dispatched = 0;
        for entry in &entries {
            let email = match self.builder.build_email(entry) {
                Ok(email) => email,
                Err(cause) => {
                    match self.bounce_unbuildable(entry, cause) {
                        Ok(()) => {}
                        Err(e) if e.is_fatal() => return Err(e),
                        Err(e) => error!(
                            "(dispatcher) cannot remove {} of {}: {}",
                            entry.email, entry.message_id, e
                        ),
                    }
                    continue;
                }
            };
            match self.dispatch(entry, &email) {
                Ok(()) => dispatched += 1,
                Err(e) if e.is_fatal() => return Err(e),
                Err(e) => error!(
                    "(dispatcher) cannot dispatch {} of {}: {}",
                    entry.email, entry.message_id, e
                ),
            }
        }
        Ok(dispatched)
    }

    fn dispatch(&self, entry: &PoolEntry, email: &EmailToSend) -> Result<(), Error> {
        self.publisher.publish(SENDING_SUBJECT, &email.encode()?)?;
        trace!("(dispatcher) queued {} of {}", entry.email, entry.message_id);
        Ok(())
    }

    fn bounce_unbuildable(&self, entry: &PoolEntry, cause: BuildError) -> Result<(), Error> {
        error!(
            "(dispatcher) cannot build {} of {}, bouncing: {}",
            entry.email, entry.message_id, cause
        );
        let cleaned = storage::lock(&self.storage)?.clean_email(&entry.message_id, &entry.email);
        if let Err(e) = cleaned.map_err(Error::from) {
            if !e.is_not_found() {
                return Err(e);
            }
        }
        let data = StatsData::Bounced {
            permanent: true,
            code: codes::BUILD,
            message: cause.to_string(),
        };
        let stats = Stats::new(&entry.message_id, &entry.domain, &entry.email, data);
        if let Err(e) = stats.publish(&*self.publisher) {
            error!(
                "(dispatcher) cannot publish bounce for {} of {}: {}",
                entry.email, entry.message_id, e
            );
        }
        Ok(())
    }

    pub fn sweep(&self) -> Result<usize, Error> {
        let released = storage::lock(&self.storage)?.release_stuck(self.stuck_ttl)?;
        if released > 0 {
            warn!("(dispatcher) released {} stuck entries", released);
        }
        Ok(released)
    }

    /// Event loop for one kind of feedback
    pub fn run_consumer(
        &self,
        kind: Feedback,
        consumer: &dyn Consumer,
        shutdown: &Shutdown,
    ) -> Result<(), Error> {
        info!("(dispatcher) {} consumer started", kind.kind());
        while !shutdown.is_triggered() {
            if let Err(e) = self.consume_batch(kind, consumer, self.config.fetch_wait()) {
                if e.is_fatal() {
                    return Err(e);
                }
                error!("(dispatcher) {} consumer: {}", kind.kind(), e);
                shutdown.wait_timeout(self.config.interval());
            }
        }
        info!("(dispatcher) {} consumer terminated", kind.kind());
        Ok(())
    }

    /// Fetch and apply one batch of events. Returns how many were acked.
    pub fn consume_batch(
        &self,
        kind: Feedback,
        consumer: &dyn Consumer,
        wait: Duration,
    ) -> Result<usize, Error> {
        let messages = consumer.fetch(self.config.event_batch_size, wait)?;
        let mut acked = 0;
        for (n, message) in messages.iter().enumerate() {
            match self.apply(kind, message) {
                Ok(()) => match consumer.ack(message) {
                    Ok(()) => acked += 1,
                    Err(e) => error!("(dispatcher) cannot ack event {}: {}", message.sequence, e),
                },
                Err(e) if e.is_fatal() => {
                    // hand back everything not yet applied
                    for rest in &messages[n..] {
                        warn_on_nak_failure(consumer.nak(rest), rest);
                    }
                    return Err(e);
                }
                Err(e) => {
                    error!(
                        "(dispatcher) cannot apply {} event {}: {}",
                        kind.kind(),
                        message.sequence,
                        e
                    );
                    warn_on_nak_failure(consumer.nak(message), message);
                }
            }
        }
        Ok(acked)
    }

    fn apply(&self, kind: Feedback, message: &QueueMessage) -> Result<(), Error> {
        let stats = Stats::decode(&message.payload)?;
        let (message_id, email) = (&stats.message_id, &stats.email);

        let mut guard = storage::lock(&self.storage)?;
        let result = match (kind, &stats.data) {
            (Feedback::Error, &StatsData::Error { code, message: ref reason }) => guard
                .reschedule_email(message_id, email)
                .map(|entry| {
                    info!(
                        "(dispatcher) {} of {} deferred ({} {}), attempts {}, next at {}",
                        email,
                        message_id,
                        code,
                        reason,
                        entry.send_attempts_count,
                        entry.scheduled_time
                    );
                }),
            (Feedback::Delivered, &StatsData::Delivered) => {
                debug!("(dispatcher) {} of {} delivered", email, message_id);
                guard.clean_email(message_id, email)
            }
            (Feedback::Bounced, &StatsData::Bounced { permanent, code, .. }) => {
                info!(
                    "(dispatcher) {} of {} bounced (code {}, permanent {})",
                    email, message_id, code, permanent
                );
                guard.clean_email(message_id, email)
            }
            (kind, data) => {
                warn!(
                    "(dispatcher) ignoring {} event on the {} subject",
                    data.kind(),
                    kind.kind()
                );
                Ok(())
            }
        };

        match result {
            Ok(()) => Ok(()),
            Err(e) => {
                let e = Error::from(e);
                if e.is_not_found() {
                    warn!(
                        "(dispatcher) {} of {} is no longer in the pool",
                        email, message_id
                    );
                    Ok(())
                } else {
                    Err(e)
                }
            }
        }
    }
}

fn warn_on_nak_failure(result: Result<(), QueueError>, message: &QueueMessage) {
    if let Err(e) = result {
        // redelivered after the ack wait
        warn!("(dispatcher) cannot nak event {}: {}", message.sequence, e);
    }
}
