use std::fmt;
use std::net::IpAddr;
use std::time::Instant;

use async_trait::async_trait;
use hickory_resolver::config::{NameServerConfigGroup, ResolverConfig};
use hickory_resolver::name_server::TokioConnectionProvider;
use hickory_resolver::proto::rr::{RData, RecordType};
use hickory_resolver::{ResolveError, TokioResolver};
use url::Url;

use crate::address::{Scheme, Separator, host_of, percent_decode, query_value};
use crate::context::ProbeContext;
use crate::error::ProbeError;
use crate::probe::{DNS_TIMEOUT, Prober, report_single};
use crate::record::{Record, Status};
use crate::reporter::Reporter;

/// Record type a DNS check asks for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DnsType {
    /// A and AAAA together
    Ip,
    A,
    Aaaa,
    Cname,
    Mx,
    Ns,
    Txt,
}

impl DnsType {
    pub fn parse(text: &str) -> Result<Self, ProbeError> {
        match text.to_ascii_uppercase().as_str() {
            "" => Ok(DnsType::Ip),
            "A" => Ok(DnsType::A),
            "AAAA" => Ok(DnsType::Aaaa),
            "CNAME" => Ok(DnsType::Cname),
            "MX" => Ok(DnsType::Mx),
            "NS" => Ok(DnsType::Ns),
            "TXT" => Ok(DnsType::Txt),
            _ => Err(ProbeError::UnsupportedDnsType(text.to_string())),
        }
    }
}

impl fmt::Display for DnsType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            DnsType::Ip => "A/AAAA",
            DnsType::A => "A",
            DnsType::Aaaa => "AAAA",
            DnsType::Cname => "CNAME",
            DnsType::Mx => "MX",
            DnsType::Ns => "NS",
            DnsType::Txt => "TXT",
        })
    }
}

/// Type implied by the scheme: `dns4`, `dns6` or `dns-<type>`.
fn scheme_type(scheme: &str) -> Result<Option<DnsType>, ProbeError> {
    match scheme {
        "dns" => return Ok(None),
        "dns4" => return Ok(Some(DnsType::A)),
        "dns6" => return Ok(Some(DnsType::Aaaa)),
        _ => {}
    }
    let parsed = Scheme::parse(scheme);
    if parsed.base != "dns" {
        return Err(ProbeError::UnsupportedScheme(scheme.to_string()));
    }
    match parsed.variant_for(Separator::Mode, scheme)? {
        "" => Err(ProbeError::UnsupportedScheme(scheme.to_string())),
        variant => DnsType::parse(variant).map(Some),
    }
}

/// Server to send queries to, from the authority part of the address.
#[derive(Debug, Clone, PartialEq, Eq)]
struct Nameserver {
    host: String,
    port: u16,
}

/// Checks that a name resolves.
///
/// `dns:example.com`, `dns-mx:example.com`, `dns:example.com?type=txt`, or
/// `dns://1.1.1.1/example.com` to use a specific resolver.
pub struct DnsProbe {
    target: Url,
    name: String,
    kind: DnsType,
    nameserver: Option<Nameserver>,
}

impl DnsProbe {
    pub fn new(target: Url) -> Result<Self, ProbeError> {
        let from_scheme = scheme_type(target.scheme())?;
        let from_query = query_value(&target, "type").map(|t| DnsType::parse(&t)).transpose()?;

        let kind = match (from_scheme, from_query) {
            (Some(s), Some(q)) if s != q => {
                return Err(ProbeError::ConflictingDnsType {
                    scheme: s.to_string(),
                    query: q.to_string(),
                });
            }
            (Some(t), _) | (None, Some(t)) => t,
            (None, None) => DnsType::Ip,
        };

        let (name, nameserver) = if target.cannot_be_a_base() {
            (target.path().to_string(), None)
        } else {
            let name = target.path().trim_start_matches('/').to_string();
            let port = target.port().unwrap_or(53);
            let nameserver = host_of(&target).map(|host| Nameserver { host, port });
            (name, nameserver)
        };
        let name = percent_decode(&name);
        if name.is_empty() {
            return Err(ProbeError::MissingHost);
        }

        Ok(Self { target, name, kind, nameserver })
    }

    async fn resolver(&self) -> Result<TokioResolver, String> {
        let Some(ns) = &self.nameserver else {
            return TokioResolver::builder_tokio()
                .map(|builder| builder.build())
                .map_err(|e| format!("failed to load system resolver: {e}"));
        };

        let ip = match ns.host.parse::<IpAddr>() {
            Ok(ip) => ip,
            Err(_) => tokio::net::lookup_host((ns.host.as_str(), ns.port))
                .await
                .ok()
                .and_then(|mut addrs| addrs.next())
                .map(|addr| addr.ip())
                .ok_or_else(|| format!("failed to resolve nameserver {}", ns.host))?,
        };

        let group = NameServerConfigGroup::from_ips_clear(&[ip], ns.port, true);
        let config = ResolverConfig::from_parts(None, vec![], group);
        Ok(TokioResolver::builder_with_config(config, TokioConnectionProvider::default()).build())
    }

    async fn lookup(&self, resolver: &TokioResolver) -> Result<Vec<String>, ResolveError> {
        let name = self.name.as_str();
        let answers: Vec<String> = match self.kind {
            DnsType::Ip => {
                resolver.lookup_ip(name).await?.iter().map(|ip| ip.to_string()).collect()
            }
            DnsType::A => resolver.ipv4_lookup(name).await?.iter().map(|a| a.to_string()).collect(),
            DnsType::Aaaa => {
                resolver.ipv6_lookup(name).await?.iter().map(|a| a.to_string()).collect()
            }
            DnsType::Cname => resolver
                .lookup(name, RecordType::CNAME)
                .await?
                .iter()
                .filter_map(|rdata| match rdata {
                    RData::CNAME(cname) => Some(cname.0.to_string()),
                    _ => None,
                })
                .collect(),
            DnsType::Mx => resolver
                .mx_lookup(name)
                .await?
                .iter()
                .map(|mx| format!("{} {}", mx.preference(), mx.exchange()))
                .collect(),
            DnsType::Ns => {
                resolver.ns_lookup(name).await?.iter().map(|ns| ns.to_string()).collect()
            }
            DnsType::Txt => resolver
                .txt_lookup(name)
                .await?
                .iter()
                .map(|txt| {
                    txt.txt_data().iter().map(|d| String::from_utf8_lossy(d)).collect::<String>()
                })
                .collect(),
        };
        Ok(answers)
    }

    async fn check(&self) -> Record {
        let mut record = Record::new(self.target.clone(), Status::Unknown)
            .with_extra("type", self.kind.to_string());
        if let Some(ns) = &self.nameserver {
            record = record.with_extra("nameserver", format!("{}:{}", ns.host, ns.port));
        }

        let started = Instant::now();
        let resolver = match self.resolver().await {
            Ok(resolver) => resolver,
            Err(message) => return record.with_latency(started.elapsed()).with_message(message),
        };

        let started = Instant::now();
        let result = self.lookup(&resolver).await;
        let record = record.with_latency(started.elapsed());

        match result {
            Ok(answers) if answers.is_empty() => record.with_message("not found"),
            Ok(answers) => record.with_status(Status::Healthy).with_message(answers.join(", ")),
            Err(e) if e.is_nx_domain() || e.is_no_records_found() => {
                record.with_message("not found")
            }
            Err(e) => record.with_message(e.to_string()),
        }
    }
}

#[async_trait]
impl Prober for DnsProbe {
    fn target(&self) -> &Url {
        &self.target
    }

    async fn probe(&self, ctx: &ProbeContext, reporter: &dyn Reporter) {
        report_single(ctx, DNS_TIMEOUT, &self.target, reporter, self.check()).await;
    }
}
