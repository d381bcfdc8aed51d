use trust_dns_resolver::config::{ResolverConfig, ResolverOpts};
use trust_dns_resolver::error::{ResolveError, ResolveErrorKind};
use trust_dns_resolver::Resolver;

use crate::config::ResolverSetup;
use crate::smtp::{codes, SenderError};

/// Result of an MX query that got an answer
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MxAnswer {
    /// (preference, exchange) pairs, in whatever order the resolver gave them
    Records(Vec<(u16, String)>),
    /// NXDOMAIN, or the domain has no MX records
    NotFound,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DnsError {
    /// Worth asking again later
    pub temporary: bool,
    pub message: String,
}

pub trait MxResolver: Send + Sync {
    fn lookup_mx(&self, domain: &str) -> Result<MxAnswer, DnsError>;
}

/// MX lookups over DNS
pub struct DnsResolver {
    resolver: Resolver,
}

impl DnsResolver {
    pub fn new(setup: ResolverSetup) -> Result<DnsResolver, ResolveError> {
        let resolver = match setup {
            ResolverSetup::SystemConf => Resolver::from_system_conf()?,
            ResolverSetup::Google => {
                Resolver::new(ResolverConfig::google(), ResolverOpts::default())?
            }
            ResolverSetup::Cloudflare => {
                Resolver::new(ResolverConfig::cloudflare(), ResolverOpts::default())?
            }
            ResolverSetup::Quad9 => {
                Resolver::new(ResolverConfig::quad9(), ResolverOpts::default())?
            }
        };
        Ok(DnsResolver { resolver })
    }
}

impl MxResolver for DnsResolver {
    fn lookup_mx(&self, domain: &str) -> Result<MxAnswer, DnsError> {
        match self.resolver.mx_lookup(domain) {
            Ok(response) => Ok(MxAnswer::Records(
                response
                    .iter()
                    .map(|mx| (mx.preference(), mx.exchange().to_utf8()))
                    .collect(),
            )),
            Err(e) => {
                let temporary = match e.kind() {
                    ResolveErrorKind::NoRecordsFound { .. } => return Ok(MxAnswer::NotFound),
                    ResolveErrorKind::Timeout
                    | ResolveErrorKind::NoConnections
                    | ResolveErrorKind::Io(_)
                    | ResolveErrorKind::Proto(_) => true,
                    _ => false,
                };
                Err(DnsError {
                    temporary,
                    message: format!("{}", e),
                })
            }
        }
    }
}

/// Hosts to try for `domain`, most preferred first, at most `max` of them
pub fn resolve_hosts<R: MxResolver + ?Sized>(
    resolver: &R,
    domain: &str,
    max: usize,
) -> Result<Vec<String>, SenderError> {
    let mut records = match resolver.lookup_mx(domain) {
        Ok(MxAnswer::Records(records)) => records,
        Ok(MxAnswer::NotFound) => {
            // fallback to the domain (RFC 5321)
            debug!("(smtp) no MX for {}, using the domain itself", domain);
            return Ok(vec![domain.to_owned()]);
        }
        Err(e) => {
            let message = format!("MX lookup for {} failed: {}", domain, e.message);
            return Err(if e.temporary {
                SenderError::transient(codes::DNS, &message)
            } else {
                SenderError::permanent(codes::DNS, &message)
            });
        }
    };

    // Sort by priority
    records.sort_by_key(|r| r.0);

    let mut hosts: Vec<String> = Vec::with_capacity(records.len());
    for (_, exchange) in records {
        let host = exchange.trim_end_matches('.').to_owned();
        // "." is a null MX (RFC 7505)
        if !host.is_empty() && !hosts.contains(&host) {
            hosts.push(host);
        }
    }
    if hosts.is_empty() {
        return Err(SenderError::permanent(
            codes::NULL_MX,
            &format!("{} does not accept mail", domain),
        ));
    }

    hosts.truncate(max);
    Ok(hosts)
}
