//! Direct delivery to a recipient's MX hosts.

pub mod demo;
pub mod mx;
pub mod transport;

pub use self::demo::DemoMailer;
pub use self::mx::{DnsError, DnsResolver, MxAnswer, MxResolver};
pub use self::transport::LettreConnector;

use std::fmt;
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use crate::config::{Config, SmtpConfig};
use crate::error::Error;

/// Codes for failures that happen before any SMTP reply. They never collide
/// with reply codes, which start at 200.
pub mod codes {
    pub const INVALID_ADDRESS: u16 = 1;
    pub const DNS: u16 = 2;
    pub const NULL_MX: u16 = 3;
    pub const CONNECT: u16 = 10;
    pub const TLS: u16 = 11;
    pub const TIMEOUT: u16 = 12;
    pub const PROTOCOL: u16 = 13;
    pub const DEADLINE: u16 = 14;
    /// The email could not be rendered, so it never reached the sender
    pub const BUILD: u16 = 20;
}

/// Why a send did not succeed
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SenderError {
    pub permanent: bool,
    pub code: u16,
    pub message: String,
}

impl SenderError {
    pub fn permanent(code: u16, message: &str) -> SenderError {
        SenderError {
            permanent: true,
            code,
            message: message.to_owned(),
        }
    }

    pub fn transient(code: u16, message: &str) -> SenderError {
        SenderError {
            permanent: false,
            code,
            message: message.to_owned(),
        }
    }

    /// 5xx is permanent, everything else transient
    pub fn from_reply(code: u16, message: &str) -> SenderError {
        SenderError {
            permanent: (500..600).contains(&code),
            code,
            message: message.to_owned(),
        }
    }

    /// The host never answered the transaction, so another MX may do better.
    /// Address and DNS failures are the same whichever host is tried.
    pub fn try_next_host(&self) -> bool {
        match self.code {
            codes::INVALID_ADDRESS | codes::DNS | codes::NULL_MX => false,
            code => code < 100,
        }
    }
}

impl fmt::Display for SenderError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let kind = if self.permanent { "permanent" } else { "transient" };
        write!(f, "{} error {}: {}", kind, self.code, self.message)
    }
}

impl std::error::Error for SenderError {}

/// Delivers one rendered message to one recipient
pub trait Mailer: Send + Sync {
    fn send(&self, from: &str, to: &str, body: &[u8]) -> Result<(), SenderError>;
}

/// One SMTP transaction against one host
#[derive(Debug, Clone)]
pub struct DeliveryRequest {
    pub host: String,
    pub port: u16,
    pub from: String,
    pub to: String,
    pub body: Arc<[u8]>,
    pub timeout: Duration,
    pub verify_tls: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AttemptError {
    Address(String),
    Connect(String),
    Tls(String),
    Timeout(String),
    Protocol(String),
    Reply { code: u16, message: String },
}

impl From<AttemptError> for SenderError {
    fn from(e: AttemptError) -> SenderError {
        match e {
            AttemptError::Address(m) => SenderError::permanent(codes::INVALID_ADDRESS, &m),
            AttemptError::Connect(m) => SenderError::transient(codes::CONNECT, &m),
            AttemptError::Tls(m) => SenderError::transient(codes::TLS, &m),
            AttemptError::Timeout(m) => SenderError::transient(codes::TIMEOUT, &m),
            AttemptError::Protocol(m) => SenderError::transient(codes::PROTOCOL, &m),
            AttemptError::Reply { code, message } => SenderError::from_reply(code, &message),
        }
    }
}

/// Runs an SMTP transaction with a single host
pub trait HostConnector: Send + Sync {
    /// Reject an envelope the transport could never send, before any host
    /// is contacted
    fn check_envelope(&self, _from: &str, _to: &str) -> Result<(), AttemptError> {
        Ok(())
    }

    fn deliver(&self, request: &DeliveryRequest) -> Result<(), AttemptError>;
}

/// Split an address at its last `@`
pub fn split_address(address: &str) -> Result<(&str, &str), SenderError> {
    match address.rsplit_once('@') {
        Some((local, domain))
            if !local.is_empty() && !domain.is_empty() && !domain.contains(' ') =>
        {
            Ok((local, domain))
        }
        _ => Err(SenderError::permanent(
            codes::INVALID_ADDRESS,
            &format!("invalid recipient address {:?}", address),
        )),
    }
}

/// Delivers straight to the recipient domain's MX hosts
pub struct DirectSender<R: MxResolver, C: HostConnector> {
    resolver: R,
    connector: Arc<C>,
    config: SmtpConfig,
}

impl DirectSender<DnsResolver, LettreConnector> {
    pub fn from_config(
        config: &Config,
    ) -> Result<DirectSender<DnsResolver, LettreConnector>, Error> {
        let resolver = DnsResolver::new(config.smtp.resolver_setup)?;
        let connector = LettreConnector::new(&config.helo_name);
        Ok(DirectSender::new(resolver, connector, config.smtp.clone()))
    }
}

impl<R: MxResolver, C: HostConnector> DirectSender<R, C> {
    pub fn new(resolver: R, connector: C, config: SmtpConfig) -> DirectSender<R, C> {
        DirectSender {
            resolver,
            connector: Arc::new(connector),
            config,
        }
    }
}

impl<R: MxResolver, C: HostConnector + 'static> DirectSender<R, C> {
    /// Run one host transaction on its own thread and give up on it once
    /// `remaining` has passed. An abandoned transaction ends on its own I/O
    /// timeout.
    fn attempt_within(
        &self,
        request: DeliveryRequest,
        remaining: Duration,
    ) -> Result<(), SenderError> {
        let connector = self.connector.clone();
        let insecure_fallback = self.config.insecure_tls_fallback;
        let host = request.host.clone();
        let (done, outcome) = mpsc::channel();
        thread::Builder::new()
            .name(format!("smtp-{}", host))
            .spawn(move || {
                let _ = done.send(attempt(&*connector, request, insecure_fallback));
            })
            .map_err(|e| {
                SenderError::transient(codes::CONNECT, &format!("cannot start transaction: {}", e))
            })?;

        match outcome.recv_timeout(remaining) {
            Ok(result) => result,
            Err(RecvTimeoutError::Timeout) => {
                warn!("(smtp) abandoning transaction with {}: deadline exceeded", host);
                Err(SenderError::transient(codes::DEADLINE, "send deadline exceeded"))
            }
            Err(RecvTimeoutError::Disconnected) => Err(SenderError::transient(
                codes::PROTOCOL,
                &format!("transaction with {} panicked", host),
            )),
        }
    }
}

fn attempt<C: HostConnector>(
    connector: &C,
    mut request: DeliveryRequest,
    insecure_fallback: bool,
) -> Result<(), SenderError> {
    match connector.deliver(&request) {
        Err(AttemptError::Tls(reason)) if insecure_fallback => {
            warn!(
                "(smtp) TLS with {} failed ({}), retrying without verification",
                request.host, reason
            );
            request.verify_tls = false;
            connector.deliver(&request).map_err(SenderError::from)
        }
        result => result.map_err(SenderError::from),
    }
}

impl<R: MxResolver, C: HostConnector + 'static> Mailer for DirectSender<R, C> {
    fn send(&self, from: &str, to: &str, body: &[u8]) -> Result<(), SenderError> {
        let (_, domain) = split_address(to)?;
        self.connector.check_envelope(from, to).map_err(SenderError::from)?;
        let hosts = mx::resolve_hosts(&self.resolver, domain, self.config.max_mx_hosts)?;
        let deadline = Instant::now() + self.config.send_deadline();
        let body: Arc<[u8]> = Arc::from(body);

        let mut last_error = SenderError::transient(codes::CONNECT, "no MX host attempted");
        for host in &hosts {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                last_error = SenderError::transient(codes::DEADLINE, "send deadline exceeded");
                break;
            }

            debug!("(smtp) delivering to {} via {}", to, host);
            let request = DeliveryRequest {
                host: host.clone(),
                port: self.config.port,
                from: from.to_owned(),
                to: to.to_owned(),
                body: body.clone(),
                timeout: remaining.min(self.config.connect_timeout()),
                verify_tls: true,
            };
            match self.attempt_within(request, remaining) {
                Ok(()) => {
                    info!("(smtp) delivered to {} via {}", to, host);
                    return Ok(());
                }
                Err(e) if e.try_next_host() => {
                    info!("(smtp) {} unreachable for {}: {}", host, to, e);
                    last_error = e;
                }
                Err(e) => {
                    info!("(smtp) {} refused {}: {}", host, to, e);
                    return Err(e);
                }
            }
        }

        // every host failed to connect: a later attempt may succeed
        last_error.permanent = false;
        Err(last_error)
    }
}
