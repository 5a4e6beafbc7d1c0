use std::net::{IpAddr, SocketAddr};
use std::str::FromStr;
use std::time::Duration;

use async_trait::async_trait;
use prometheus::Registry;
use trust_dns_resolver::TokioAsyncResolver;
use trust_dns_resolver::error::ResolveErrorKind;
use trust_dns_resolver::proto::op::ResponseCode;
use trust_dns_resolver::proto::rr::RecordType;

use super::Prober;
use crate::config::Module;
use crate::config::app_config::resolver_for_servers;
use crate::metrics::{PROBE_DNS_ANSWER_RRS_METRIC, record_gauge};

/// Resolves a name and checks the response code.
///
/// A target that is a name server address (`1.1.1.1` or `1.1.1.1:5353`) is asked for
/// the module's `query_name`. Any other target is itself the name to resolve, through
/// the configured upstream servers.
pub struct DnsProber {
    resolver: TokioAsyncResolver,
}

impl DnsProber {
    pub fn new(resolver: TokioAsyncResolver) -> Self {
        Self { resolver }
    }
}

#[async_trait]
impl Prober for DnsProber {
    async fn probe(
        &self,
        target: &str,
        module: &Module,
        deadline: Duration,
        registry: &Registry,
    ) -> bool {
        let conf = &module.dns;
        let record_type = match RecordType::from_str(&conf.query_type.to_uppercase()) {
            Ok(record_type) => record_type,
            Err(e) => {
                tracing::error!(query_type = %conf.query_type, error = %e, "Invalid query type");
                return false;
            }
        };

        let server = name_server(target);
        let query_name = match (&server, conf.query_name.is_empty()) {
            (Some(_), true) => {
                tracing::error!(server = target, "No query_name configured for name server target");
                return false;
            }
            (_, false) => conf.query_name.as_str(),
            (None, true) => target,
        };

        let lookup = match server {
            Some(server) => {
                let resolver = resolver_for_servers(&[server]);
                tokio::time::timeout(deadline, resolver.lookup(query_name, record_type)).await
            }
            None => {
                tokio::time::timeout(deadline, self.resolver.lookup(query_name, record_type)).await
            }
        };

        let (rcode, answers) = match lookup {
            Ok(Ok(lookup)) => (ResponseCode::NoError, lookup.record_iter().count()),
            Ok(Err(e)) => match e.kind() {
                ResolveErrorKind::NoRecordsFound { response_code, .. } => (*response_code, 0),
                _ => {
                    tracing::error!(query_name, error = %e, "Error while sending a DNS query");
                    return false;
                }
            },
            Err(_) => {
                tracing::error!(query_name, "DNS query timed out");
                return false;
            }
        };

        record_gauge(
            registry,
            PROBE_DNS_ANSWER_RRS_METRIC,
            "Returns number of entries in the answer resource record list",
            answers as f64,
        );

        let rcode = rcode_name(rcode);
        let valid = conf
            .valid_rcodes
            .iter()
            .any(|valid| valid.eq_ignore_ascii_case(&rcode));
        if !valid {
            tracing::error!(query_name, rcode = %rcode, valid_rcodes = ?conf.valid_rcodes, "Rcode is not one of the valid rcodes");
        }
        valid
    }
}

/// Interprets `target` as a name server address, defaulting the port to 53.
fn name_server(target: &str) -> Option<SocketAddr> {
    if let Ok(addr) = target.parse::<SocketAddr>() {
        return Some(addr);
    }
    target
        .parse::<IpAddr>()
        .ok()
        .map(|ip| SocketAddr::new(ip, 53))
}

fn rcode_name(code: ResponseCode) -> String {
    match code {
        ResponseCode::NoError => "NOERROR".to_string(),
        ResponseCode::FormErr => "FORMERR".to_string(),
        ResponseCode::ServFail => "SERVFAIL".to_string(),
        ResponseCode::NXDomain => "NXDOMAIN".to_string(),
        ResponseCode::NotImp => "NOTIMP".to_string(),
        ResponseCode::Refused => "REFUSED".to_string(),
        other => u16::from(other).to_string(),
    }
}
