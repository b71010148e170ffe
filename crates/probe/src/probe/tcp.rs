use std::net::SocketAddr;
use std::time::Instant;

use async_trait::async_trait;
use tokio::net::TcpStream;
use url::Url;

use crate::address::host_of;
use crate::context::ProbeContext;
use crate::error::ProbeError;
use crate::probe::{Prober, TCP_TIMEOUT, report_single};
use crate::record::{Record, Status};
use crate::reporter::Reporter;

/// Address family restriction carried by the scheme suffix.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Family {
    Any,
    V4,
    V6,
}

impl Family {
    pub fn from_suffix(scheme: &str, base: &str) -> Option<Self> {
        match scheme.strip_prefix(base)? {
            "" => Some(Family::Any),
            "4" => Some(Family::V4),
            "6" => Some(Family::V6),
            _ => None,
        }
    }

    pub fn accepts(&self, addr: &SocketAddr) -> bool {
        match self {
            Family::Any => true,
            Family::V4 => addr.is_ipv4(),
            Family::V6 => addr.is_ipv6(),
        }
    }
}

/// Resolve `host:port`, keeping only addresses of `family`.
pub(crate) async fn resolve(
    host: &str,
    port: u16,
    family: Family,
) -> Result<Vec<SocketAddr>, String> {
    let addrs: Vec<SocketAddr> = tokio::net::lookup_host((host, port))
        .await
        .map_err(|e| format!("failed to resolve {host}: {e}"))?
        .filter(|a| family.accepts(a))
        .collect();

    if addrs.is_empty() {
        return Err(format!("no suitable address for {host}"));
    }
    Ok(addrs)
}

/// Checks that a TCP port accepts connections.
pub struct TcpProbe {
    target: Url,
    host: String,
    port: u16,
    family: Family,
}

impl TcpProbe {
    pub fn new(target: Url) -> Result<Self, ProbeError> {
        let family = Family::from_suffix(target.scheme(), "tcp")
            .ok_or_else(|| ProbeError::UnsupportedScheme(target.scheme().to_string()))?;
        let host = host_of(&target).ok_or(ProbeError::MissingHost)?;
        let port = target.port().ok_or(ProbeError::MissingPort)?;

        // Path, query and fragment carry no meaning for a connect check.
        let mut normalized = target.clone();
        normalized.set_path("");
        normalized.set_query(None);
        normalized.set_fragment(None);

        Ok(Self { target: normalized, host, port, family })
    }

    async fn check(&self) -> Record {
        let started = Instant::now();
        let record = Record::new(self.target.clone(), Status::Unknown);

        let addrs = match resolve(&self.host, self.port, self.family).await {
            Ok(addrs) => addrs,
            Err(message) => return record.with_latency(started.elapsed()).with_message(message),
        };

        let started = Instant::now();
        match TcpStream::connect(&addrs[..]).await {
            Ok(stream) => {
                let latency = started.elapsed();
                let mut record = record.with_status(Status::Healthy).with_latency(latency);
                if let Ok(local) = stream.local_addr() {
                    record = record.with_extra("source_addr", local.to_string());
                }
                if let Ok(peer) = stream.peer_addr() {
                    record = record.with_extra("target_addr", peer.to_string());
                }
                record.with_message("succeed to connect")
            }
            Err(e) => record
                .with_status(Status::Failure)
                .with_latency(started.elapsed())
                .with_extra("target_addr", addrs[0].to_string())
                .with_message(e.to_string()),
        }
    }
}

#[async_trait]
impl Prober for TcpProbe {
    fn target(&self) -> &Url {
        &self.target
    }

    async fn probe(&self, ctx: &ProbeContext, reporter: &dyn Reporter) {
        report_single(ctx, TCP_TIMEOUT, &self.target, reporter, self.check()).await;
    }
}
