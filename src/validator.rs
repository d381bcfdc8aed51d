use std::sync::{Arc, OnceLock, RwLock};

use regex::Regex;

use crate::config::ValidatorConfig;
use crate::error::Error;
use crate::lifecycle::Shutdown;
use crate::pool_entry::PoolEntry;
use crate::queue::Publisher;
use crate::stats::{Stats, StatsData};
use crate::storage::{self, PoolStorage};

const REJECT_REASON: &str = "not a valid email address";

fn email_pattern() -> &'static Regex {
    static EMAIL: OnceLock<Regex> = OnceLock::new();
    EMAIL.get_or_init(|| {
        Regex::new(concat!(
            r"^[a-zA-Z0-9.!#$%&'*+/=?^_`{|}~-]+",
            r"@[a-zA-Z0-9](?:[a-zA-Z0-9-]{0,61}[a-zA-Z0-9])?",
            r"(?:\.[a-zA-Z0-9](?:[a-zA-Z0-9-]{0,61}[a-zA-Z0-9])?)*$",
        ))
        .expect("email pattern is valid")
    })
}

/// Syntax check only. No DNS lookup or mailbox check happens here.
pub fn is_valid_email(email: &str) -> bool {
    email.len() <= 254 && email_pattern().is_match(email)
}

/// Moves claimed `ToValidate` rows to `Scheduled`, or deletes them if the
/// address is unusable.
pub struct Validator<S: PoolStorage> {
    storage: Arc<RwLock<S>>,
    publisher: Arc<dyn Publisher>,
    config: ValidatorConfig,
}

impl<S: PoolStorage> Validator<S> {
    pub fn new(
        storage: Arc<RwLock<S>>,
        publisher: Arc<dyn Publisher>,
        config: ValidatorConfig,
    ) -> Validator<S> {
        Validator {
            storage,
            publisher,
            config,
        }
    }

    pub fn run(&self, shutdown: &Shutdown) -> Result<(), Error> {
        info!("(validator) started");
        loop {
            match self.cycle() {
                Ok(0) => {}
                Ok(n) => debug!("(validator) processed {} entries", n),
                Err(e) if e.is_fatal() => return Err(e),
                Err(e) => error!("(validator) cycle failed: {}", e),
            }
            if shutdown.wait_timeout(self.config.interval()) {
                break;
            }
        }
        info!("(validator) terminated");
        Ok(())
    }

    /// Claim one batch and validate it. Returns how many entries were claimed.
    pub fn cycle(&self) -> Result<usize, Error> {
        let entries = storage::lock(&self.storage)?.prepare_for_validate(self.config.batch_size)?;
        for entry in &entries {
            if let Err(e) = self.handle(entry) {
                if e.is_fatal() {
                    return Err(e);
                }
                error!(
                    "(validator) cannot handle {} of {}: {}",
                    entry.email, entry.message_id, e
                );
            }
        }
        Ok(entries.len())
    }

    fn handle(&self, entry: &PoolEntry) -> Result<(), Error> {
        let (present, data) = if is_valid_email(&entry.email) {
            let present =
                self.transition(entry, |s| s.set_scheduled(&entry.message_id, &entry.email))?;
            (present, StatsData::Accepted)
        } else {
            info!("(validator) rejecting {} of {}", entry.email, entry.message_id);
            let present =
                self.transition(entry, |s| s.clean_email(&entry.message_id, &entry.email))?;
            let reason = REJECT_REASON.to_owned();
            (present, StatsData::Rejected { reason })
        };
        if !present {
            return Ok(());
        }
        Stats::new(&entry.message_id, &entry.domain, &entry.email, data)
            .publish(&*self.publisher)
    }

    // Ok(false) when the row is gone
    fn transition<F>(&self, entry: &PoolEntry, f: F) -> Result<bool, Error>
    where
        F: FnOnce(&mut S) -> Result<(), S::Error>,
    {
        let mut guard = storage::lock(&self.storage)?;
        match f(&mut *guard) {
            Ok(()) => Ok(true),
            Err(e) => {
                let e = Error::from(e);
                if e.is_not_found() {
                    warn!(
                        "(validator) {} of {} vanished while validating",
                        entry.email, entry.message_id
                    );
                    Ok(false)
                } else {
                    Err(e)
                }
            }
        }
    }
}
