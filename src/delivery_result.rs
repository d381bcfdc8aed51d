use crate::smtp::SenderError;
use crate::stats::StatsData;

/// The result of one delivery attempt to one recipient
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeliveryResult {
    /// The receiving server accepted the mail
    Delivered,

    /// Mail sending has been deferred due to a transient error. The pool entry
    /// will be rescheduled.
    Deferred { code: u16, message: String },

    /// Mail sending has failed for good, either because the receiver refused it
    /// or because no retries are left.
    Failed { permanent: bool, code: u16, message: String },
}

impl DeliveryResult {
    /// Classify a send outcome. `should_retry` comes from the builder; when it
    /// is false even a transient error is final.
    pub fn from_send(result: Result<(), SenderError>, should_retry: bool) -> DeliveryResult {
        match result {
            Ok(()) => DeliveryResult::Delivered,
            Err(e) if e.permanent || !should_retry => DeliveryResult::Failed {
                permanent: e.permanent,
                code: e.code,
                message: e.message,
            },
            Err(e) => DeliveryResult::Deferred {
                code: e.code,
                message: e.message,
            },
        }
    }

    pub fn completed(&self) -> bool {
        !matches!(*self, DeliveryResult::Deferred { .. })
    }

    pub fn into_stats_data(self) -> StatsData {
        match self {
            DeliveryResult::Delivered => StatsData::Delivered,
            DeliveryResult::Deferred { code, message } => StatsData::Error { code, message },
            DeliveryResult::Failed {
                permanent,
                code,
                message,
            } => StatsData::Bounced {
                permanent,
                code,
                message,
            },
        }
    }
}
