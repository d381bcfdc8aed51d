use lettre::address::{Address, Envelope};
use lettre::transport::smtp::client::{Tls, TlsParameters};
use lettre::transport::smtp::extension::ClientId;
use lettre::transport::smtp::Error as LettreSmtpError;
use lettre::transport::smtp::SmtpTransport;
use lettre::Transport;

use crate::smtp::{AttemptError, DeliveryRequest, HostConnector};

/// SMTP transactions through lettre, with opportunistic STARTTLS
pub struct LettreConnector {
    helo_name: String,
}

impl LettreConnector {
    pub fn new(helo_name: &str) -> LettreConnector {
        LettreConnector {
            helo_name: helo_name.to_owned(),
        }
    }
}

fn envelope(from: &str, to: &str) -> Result<Envelope, AttemptError> {
    let from: Address = from
        .parse()
        .map_err(|e| AttemptError::Address(format!("return path {:?}: {}", from, e)))?;
    let to: Address = to
        .parse()
        .map_err(|e| AttemptError::Address(format!("recipient {:?}: {}", to, e)))?;
    Envelope::new(Some(from), vec![to]).map_err(|e| AttemptError::Address(format!("{}", e)))
}

fn classify(e: LettreSmtpError) -> AttemptError {
    if let Some(code) = e.status() {
        let fallback = if e.is_permanent() { 550 } else { 451 };
        let code = format!("{}", code).parse().unwrap_or(fallback);
        return AttemptError::Reply {
            code,
            message: format!("{}", e),
        };
    }
    if e.is_tls() {
        AttemptError::Tls(format!("{}", e))
    } else if e.is_timeout() {
        AttemptError::Timeout(format!("{}", e))
    } else if e.is_response() || e.is_client() {
        AttemptError::Protocol(format!("{}", e))
    } else {
        AttemptError::Connect(format!("{}", e))
    }
}

impl HostConnector for LettreConnector {
    fn check_envelope(&self, from: &str, to: &str) -> Result<(), AttemptError> {
        envelope(from, to).map(|_| ())
    }

    fn deliver(&self, request: &DeliveryRequest) -> Result<(), AttemptError> {
        let envelope = envelope(&request.from, &request.to)?;

        let tls = TlsParameters::builder(request.host.clone())
            .dangerous_accept_invalid_certs(!request.verify_tls)
            .dangerous_accept_invalid_hostnames(!request.verify_tls)
            .build()
            .map_err(|e| AttemptError::Tls(format!("failed to create TLS parameters: {}", e)))?;

        let mailer = SmtpTransport::builder_dangerous(&request.host)
            .port(request.port)
            .tls(Tls::Opportunistic(tls))
            .hello_name(ClientId::Domain(self.helo_name.clone()))
            .timeout(Some(request.timeout))
            .build();

        debug!(
            "(smtp) starting transaction for {} at {}:{} (verify tls: {})",
            request.to, request.host, request.port, request.verify_tls
        );

        match mailer.send_raw(&envelope, &request.body) {
            Ok(response) => {
                debug!("(smtp) {} accepted: {:?}", request.host, response);
                Ok(())
            }
            Err(e) => Err(classify(e)),
        }
    }
}
