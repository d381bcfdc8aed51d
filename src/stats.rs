use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};

use crate::config::DispatcherConfig;
use crate::email_id::EmailId;
use crate::error::Error;
use crate::lifecycle::Shutdown;
use crate::queue::{self, Consumer, Publisher, QueueMessage};

/// What happened to a recipient
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StatsData {
    Accepted,
    Rejected { reason: String },
    Delivered,
    Opened { ip: String, user_agent: String },
    Clicked { ip: String, user_agent: String, url: String },
    Bounced { permanent: bool, code: u16, message: String },
    Error { code: u16, message: String },
}

impl StatsData {
    /// Last token of the subject this event is published on
    pub fn kind(&self) -> &'static str {
        match *self {
            StatsData::Accepted => "accepted",
            StatsData::Rejected { .. } => "rejected",
            StatsData::Delivered => "delivered",
            StatsData::Opened { .. } => "opened",
            StatsData::Clicked { .. } => "clicked",
            StatsData::Bounced { .. } => "bounced",
            StatsData::Error { .. } => "error",
        }
    }
}

/// One lifecycle event of one recipient
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Stats {
    pub message_id: String,
    pub domain: String,
    pub email: String,
    pub timestamp: DateTime<Utc>,
    pub data: StatsData,
}

impl Stats {
    pub fn new(message_id: &str, domain: &str, email: &str, data: StatsData) -> Stats {
        Stats {
            message_id: message_id.to_owned(),
            domain: domain.to_owned(),
            email: email.to_owned(),
            timestamp: Utc::now(),
            data,
        }
    }

    pub fn for_email_id(id: &EmailId, data: StatsData) -> Stats {
        Stats::new(&id.message_id, &id.domain, &id.email, data)
    }

    pub fn subject(&self) -> String {
        stats_subject(self.data.kind())
    }

    pub fn publish(&self, publisher: &dyn Publisher) -> Result<(), Error> {
        queue::publish_json(publisher, &self.subject(), self)
    }

    pub fn decode(payload: &[u8]) -> Result<Stats, Error> {
        Ok(serde_json::from_slice(payload)?)
    }
}

pub fn stats_subject(kind: &str) -> String {
    format!("{}.{}", queue::STATS_SUBJECT_PREFIX, kind)
}

/// Where stats events end up for reporting
pub trait StatsSink: Send + Sync {
    fn store(&self, stats: Stats) -> Result<(), Error>;
}

#[derive(Default)]
pub struct MemoryStatsSink {
    events: Mutex<Vec<Stats>>,
}

impl MemoryStatsSink {
    pub fn new() -> MemoryStatsSink {
        MemoryStatsSink::default()
    }

    pub fn events(&self) -> Vec<Stats> {
        match self.events.lock() {
            Ok(events) => events.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    pub fn count(&self, kind: &str) -> usize {
        self.events().iter().filter(|s| s.data.kind() == kind).count()
    }
}

impl StatsSink for MemoryStatsSink {
    fn store(&self, stats: Stats) -> Result<(), Error> {
        self.events.lock().map_err(|_| Error::LockPoisoned)?.push(stats);
        Ok(())
    }
}

/// Copies every stats event from the stream into a [`StatsSink`]
pub struct StatsWriter {
    sink: Arc<dyn StatsSink>,
    config: DispatcherConfig,
}

impl StatsWriter {
    pub fn new(sink: Arc<dyn StatsSink>, config: DispatcherConfig) -> StatsWriter {
        StatsWriter { sink, config }
    }

    /// Copy events until shutdown. Only a fatal error stops the loop; an
    /// event that could not be settled is redelivered by the queue.
    pub fn run(&self, consumer: &dyn Consumer, shutdown: &Shutdown) -> Result<(), Error> {
        info!("(stats) writer started");
        while !shutdown.is_triggered() {
            let fetched = consumer.fetch(self.config.event_batch_size, self.config.fetch_wait());
            let messages = match fetched {
                Ok(messages) => messages,
                Err(e) => {
                    let e = Error::from(e);
                    if e.is_fatal() {
                        return Err(e);
                    }
                    error!("(stats) fetch failed: {}", e);
                    shutdown.wait_timeout(self.config.interval());
                    continue;
                }
            };
            for message in &messages {
                match self.handle(consumer, message) {
                    Ok(()) => {}
                    Err(e) if e.is_fatal() => return Err(e),
                    Err(e) => error!("(stats) event {}: {}", message.sequence, e),
                }
            }
        }
        info!("(stats) writer terminated");
        Ok(())
    }

    pub fn handle(&self, consumer: &dyn Consumer, message: &QueueMessage) -> Result<(), Error> {
        let stats = match Stats::decode(&message.payload) {
            Ok(stats) => stats,
            Err(e) => {
                error!("(stats) dropping undecodable event on {}: {}", message.subject, e);
                consumer.term(message)?;
                return Ok(());
            }
        };
        match self.sink.store(stats) {
            Ok(()) => consumer.ack(message)?,
            Err(e) => {
                error!("(stats) cannot store event: {}", e);
                consumer.nak(message)?;
            }
        }
        Ok(())
    }
}
