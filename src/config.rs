use std::fs;
use std::path::Path;
use std::time::Duration;

use crate::error::Error;
use crate::storage::StuckTtl;

/// Which nameservers MX lookups are sent to
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ResolverSetup {
    SystemConf,
    Google,
    Cloudflare,
    Quad9,
}

/// Direct-to-MX delivery settings
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct SmtpConfig {
    pub port: u16,
    /// Bound on connecting and on every single read/write with a host
    pub connect_timeout_secs: u64,
    /// Bound on a whole send, across all MX hosts tried
    pub send_deadline_secs: u64,
    pub max_mx_hosts: usize,
    /// Retry a host without certificate verification when its TLS handshake fails
    pub insecure_tls_fallback: bool,
    pub resolver_setup: ResolverSetup,
}

impl Default for SmtpConfig {
    fn default() -> SmtpConfig {
        SmtpConfig {
            port: 25,
            connect_timeout_secs: 15,
            send_deadline_secs: 120,
            max_mx_hosts: 5,
            insecure_tls_fallback: true,
            resolver_setup: ResolverSetup::SystemConf,
        }
    }
}

impl SmtpConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn send_deadline(&self) -> Duration {
        Duration::from_secs(self.send_deadline_secs)
    }
}

/// Sending pool retry policy
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    pub base_resend_delay_secs: u64,
    pub max_resend_delay_secs: u64,
    /// Total delivery attempts before a transient failure becomes a bounce
    pub max_send_attempts: u32,
    /// A row left in `Validating` this long is handed back for validation.
    /// Validation is local, so only a crashed cycle leaves one behind.
    pub validating_stuck_ttl_secs: u64,
    /// A row left in `Sending` this long is scheduled again. The sending
    /// queue may legitimately hold a backlog for up to its max age (24h), so
    /// anything shorter risks sending twice.
    pub sending_stuck_ttl_secs: u64,
}

impl Default for PoolConfig {
    fn default() -> PoolConfig {
        PoolConfig {
            base_resend_delay_secs: 300,
            max_resend_delay_secs: 6 * 60 * 60,
            max_send_attempts: 3,
            validating_stuck_ttl_secs: 15 * 60,
            sending_stuck_ttl_secs: 25 * 60 * 60,
        }
    }
}

impl PoolConfig {
    /// Exponential backoff: base * 3^attempts, capped.
    pub fn resend_delay(&self, attempts: u32) -> Duration {
        let factor = 3u64.checked_pow(attempts).unwrap_or(u64::MAX);
        let secs = self
            .base_resend_delay_secs
            .saturating_mul(factor)
            .min(self.max_resend_delay_secs);
        Duration::from_secs(secs)
    }

    pub fn stuck_ttl(&self) -> StuckTtl {
        StuckTtl {
            validating: Duration::from_secs(self.validating_stuck_ttl_secs),
            sending: Duration::from_secs(self.sending_stuck_ttl_secs),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct ValidatorConfig {
    pub batch_size: usize,
    pub interval_ms: u64,
}

impl Default for ValidatorConfig {
    fn default() -> ValidatorConfig {
        ValidatorConfig {
            batch_size: 100,
            interval_ms: 1000,
        }
    }
}

impl ValidatorConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct DispatcherConfig {
    pub batch_size: usize,
    pub interval_ms: u64,
    pub sweep_interval_secs: u64,
    pub event_batch_size: usize,
    pub fetch_wait_ms: u64,
}

impl Default for DispatcherConfig {
    fn default() -> DispatcherConfig {
        DispatcherConfig {
            batch_size: 20,
            interval_ms: 1000,
            sweep_interval_secs: 60,
            event_batch_size: 10,
            fetch_wait_ms: 10_000,
        }
    }
}

impl DispatcherConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }

    pub fn fetch_wait(&self) -> Duration {
        Duration::from_millis(self.fetch_wait_ms)
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct SenderConfig {
    pub max_jobs: usize,
    pub fetch_wait_ms: u64,
}

impl Default for SenderConfig {
    fn default() -> SenderConfig {
        SenderConfig {
            max_jobs: 10,
            fetch_wait_ms: 10_000,
        }
    }
}

impl SenderConfig {
    pub fn fetch_wait(&self) -> Duration {
        Duration::from_millis(self.fetch_wait_ms)
    }
}

/// Send pipeline configuration settings
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Name announced in EHLO
    pub helo_name: String,
    pub smtp: SmtpConfig,
    pub pool: PoolConfig,
    pub validator: ValidatorConfig,
    pub dispatcher: DispatcherConfig,
    pub sender: SenderConfig,
}

impl Default for Config {
    fn default() -> Config {
        Config {
            helo_name: "localhost".to_string(),
            smtp: SmtpConfig::default(),
            pool: PoolConfig::default(),
            validator: ValidatorConfig::default(),
            dispatcher: DispatcherConfig::default(),
            sender: SenderConfig::default(),
        }
    }
}

impl Config {
    pub fn from_toml_str(s: &str) -> Result<Config, Error> {
        let config: Config = toml::from_str(s)?;
        if !config.is_valid() {
            return Err(Error::Config(
                "helo_name must be set and batch sizes, max_jobs, max_mx_hosts non-zero".to_owned(),
            ));
        }
        Ok(config)
    }

    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Config, Error> {
        let contents = fs::read_to_string(path)?;
        Config::from_toml_str(&contents)
    }

    pub fn is_valid(&self) -> bool {
        !self.helo_name.is_empty()
            && self.smtp.max_mx_hosts > 0
            && self.validator.batch_size > 0
            && self.dispatcher.batch_size > 0
            && self.dispatcher.event_batch_size > 0
            && self.sender.max_jobs > 0
    }
}
