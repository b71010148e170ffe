//! Aggregation of target lists.
//!
//! A source address points at a plain text list of addresses, one per line.
//! Lists can include other sources; they are expanded recursively while
//! keeping the chain of lists currently being read, so a list that includes
//! itself is reported instead of followed forever.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use futures::future::{BoxFuture, FutureExt, join_all};
use tracing::{debug, warn};
use url::Url;

use crate::address::{Scheme, Separator, parse_target, percent_decode, replace_scheme};
use crate::context::ProbeContext;
use crate::error::ProbeError;
use crate::probe::exec::ExecProbe;
use crate::probe::{HTTP_TIMEOUT, Prober, new_direct_prober};
use crate::record::{Record, Status};
use crate::reporter::{ReportComposer, Reporter, lock};
use crate::tracker::TargetTracker;
use crate::util::exit_status_message;

/// Where a list is read from.
#[derive(Debug, Clone)]
pub(crate) enum SourceList {
    File(PathBuf),
    Http(Url),
    Exec(Url),
}

impl SourceList {
    pub fn parse(target: &Url) -> Result<Self, ProbeError> {
        let scheme = target.scheme();
        let parsed = Scheme::parse(scheme);
        if parsed.base != "source" {
            return Err(ProbeError::UnsupportedScheme(scheme.to_string()));
        }

        match parsed.variant_for(Separator::SubProtocol, scheme)? {
            "" | "file" => {
                let path = if target.cannot_be_a_base() {
                    percent_decode(target.path())
                } else {
                    let host = target.host_str().unwrap_or_default();
                    percent_decode(&format!("{host}{}", target.path()))
                };
                if path.is_empty() {
                    return Err(ProbeError::MissingFile);
                }
                Ok(SourceList::File(PathBuf::from(path)))
            }
            "http" | "https" => {
                if target.host_str().is_none_or(str::is_empty) {
                    return Err(ProbeError::MissingHost);
                }
                let mut url = replace_scheme(target, parsed.variant)?;
                url.set_fragment(None);
                Ok(SourceList::Http(url))
            }
            "exec" => {
                let url = replace_scheme(target, "exec")?;
                ExecProbe::new(url.clone())?;
                Ok(SourceList::Exec(url))
            }
            _ => Err(ProbeError::UnsupportedScheme(scheme.to_string())),
        }
    }

    /// Fetch the raw list text.
    pub async fn read(&self) -> Result<String, String> {
        match self {
            SourceList::File(path) => tokio::fs::read(path)
                .await
                .map(|bytes| String::from_utf8_lossy(&bytes).into_owned())
                .map_err(|e| format!("failed to read {}: {e}", path.display())),
            SourceList::Http(url) => {
                let response = reqwest::get(url.clone())
                    .await
                    .map_err(|e| format!("failed to fetch {url}: {e}"))?;
                let status = response.status();
                if status != reqwest::StatusCode::OK {
                    return Err(format!("failed to fetch {url}: status {status}"));
                }
                response.text().await.map_err(|e| format!("failed to fetch {url}: {e}"))
            }
            SourceList::Exec(url) => {
                let exec = ExecProbe::new(url.clone()).map_err(|e| e.to_string())?;
                let output = exec
                    .to_command()
                    .output()
                    .await
                    .map_err(|e| format!("failed to run {}: {e}", exec.command()))?;
                let stderr = String::from_utf8_lossy(&output.stderr);
                let stderr = stderr.trim();
                if !output.status.success() {
                    let status = exit_status_message(&output.status);
                    return Err(if stderr.is_empty() {
                        format!("{}: {status}", exec.command())
                    } else {
                        format!("{}: {status}: {stderr}", exec.command())
                    });
                }
                if !stderr.is_empty() {
                    return Err(format!("{}: {stderr}", exec.command()));
                }
                Ok(String::from_utf8_lossy(&output.stdout).into_owned())
            }
        }
    }
}

/// Everything found while expanding a source.
pub(crate) struct Expansion<T> {
    /// Leaves keyed by normalized target, so each one is checked once
    pub leaves: BTreeMap<String, T>,
    /// Lines that could not be turned into a leaf
    pub invalid: Vec<ProbeError>,
    /// Why loading stopped early, if it did
    pub failure: Option<String>,
}

impl<T> Default for Expansion<T> {
    fn default() -> Self {
        Self { leaves: BTreeMap::new(), invalid: Vec::new(), failure: None }
    }
}

impl<T> Expansion<T> {
    /// Leaves, or the reason the list cannot be used.
    pub fn into_leaves(self) -> Result<BTreeMap<String, T>, String> {
        if let Some(failure) = self.failure {
            return Err(failure);
        }
        if !self.invalid.is_empty() {
            return Err(ProbeError::Multiple(self.invalid).to_string());
        }
        Ok(self.leaves)
    }
}

/// Builds a leaf for one address, returning it with its normalized key.
pub(crate) type LeafBuilder<'a, T> =
    dyn Fn(Url) -> Result<(String, T), ProbeError> + Send + Sync + 'a;

/// Expand `list` and every source it includes.
pub(crate) async fn expand<T: Send>(list: &Url, build: &LeafBuilder<'_, T>) -> Expansion<T> {
    let mut out = Expansion::default();
    let mut path = Vec::new();
    expand_into(list, &mut path, build, &mut out).await;
    out
}

fn expand_into<'a, T: Send>(
    list: &'a Url,
    path: &'a mut Vec<String>,
    build: &'a LeafBuilder<'_, T>,
    out: &'a mut Expansion<T>,
) -> BoxFuture<'a, ()> {
    async move {
        if out.failure.is_some() {
            return;
        }

        let key = list.to_string();
        if path.contains(&key) {
            let chain: Vec<&str> = path.iter().map(String::as_str).chain([key.as_str()]).collect();
            out.failure = Some(format!("source loop detected: {}", chain.join(" -> ")));
            return;
        }

        let text = match SourceList::parse(list) {
            Ok(source) => source.read().await,
            Err(e) => Err(e.to_string()),
        };
        let text = match text {
            Ok(text) => text,
            Err(message) => {
                out.failure = Some(message);
                return;
            }
        };

        path.push(key);
        for (idx, raw) in text.lines().enumerate() {
            let line = raw.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }

            let invalid = |error: ProbeError| ProbeError::InvalidLine {
                line: idx + 1,
                text: line.to_string(),
                error: Box::new(error),
            };

            let url = match parse_target(line) {
                Ok(url) => url,
                Err(e) => {
                    out.invalid.push(invalid(e));
                    continue;
                }
            };

            if Scheme::parse(url.scheme()).base == "source" {
                expand_into(&url, path, build, out).await;
                continue;
            }

            match build(url) {
                Ok((key, leaf)) => {
                    if out.leaves.contains_key(&key) {
                        debug!(target_url = %key, "duplicate target merged");
                    } else {
                        out.leaves.insert(key, leaf);
                    }
                }
                Err(e) => out.invalid.push(invalid(e)),
            }
        }
        path.pop();
    }
    .boxed()
}

pub(crate) const LOAD_TIMEOUT: Duration = HTTP_TIMEOUT;

/// Checks every target listed by a source.
///
/// Each invocation reloads the list, reports a summary record for the source
/// itself, then checks all leaves concurrently. Targets that disappeared from
/// the list since the previous invocation are deactivated.
pub struct SourceProbe {
    target: Url,
    tracker: TargetTracker,
    cache: Mutex<BTreeMap<String, Arc<dyn Prober>>>,
}

impl SourceProbe {
    /// Prepare without reading the list.
    pub fn new(target: Url) -> Result<Self, ProbeError> {
        SourceList::parse(&target)?;
        Ok(Self { target, tracker: TargetTracker::new(), cache: Mutex::new(BTreeMap::new()) })
    }

    /// Prepare and read the list once, rejecting malformed lines.
    ///
    /// Lists that cannot be read right now are accepted; the failure is
    /// reported when the source is probed.
    pub async fn load(target: Url) -> Result<Self, ProbeError> {
        let probe = Self::new(target)?;
        let ctx = ProbeContext::with_timeout(LOAD_TIMEOUT);

        let Ok(expansion) = ctx.run(probe.expand()).await else {
            warn!(source = %probe.target, "timed out loading source");
            return Ok(probe);
        };

        if let Some(failure) = &expansion.failure {
            warn!(source = %probe.target, error = %failure, "failed to load source");
        } else if !expansion.invalid.is_empty() {
            return Err(ProbeError::Multiple(expansion.invalid));
        }

        *lock(&probe.cache) = expansion.leaves;
        Ok(probe)
    }

    async fn expand(&self) -> Expansion<Arc<dyn Prober>> {
        let cache = lock(&self.cache).clone();
        let build = move |url: Url| -> Result<(String, Arc<dyn Prober>), ProbeError> {
            if let Some(cached) = cache.get(url.as_str()) {
                return Ok((cached.target().to_string(), cached.clone()));
            }
            let prober: Arc<dyn Prober> = Arc::from(new_direct_prober(url)?);
            Ok((prober.target().to_string(), prober))
        };
        expand(&self.target, &build).await
    }
}

#[async_trait]
impl Prober for SourceProbe {
    fn target(&self) -> &Url {
        &self.target
    }

    async fn probe(&self, ctx: &ProbeContext, reporter: &dyn Reporter) {
        let started = Instant::now();
        let inner = ctx.narrow(LOAD_TIMEOUT);

        let leaves = match inner.run(self.expand()).await {
            Ok(expansion) => expansion.into_leaves(),
            Err(interruption) => {
                let record = interruption.into_record(self.target.clone(), started.elapsed());
                return reporter.report(&self.target, ctx.classify(record));
            }
        };
        let leaves = match leaves {
            Ok(leaves) => leaves,
            Err(message) => {
                let record = Record::new(self.target.clone(), Status::Failure)
                    .with_latency(started.elapsed())
                    .with_message(message);
                return reporter.report(&self.target, ctx.classify(record));
            }
        };

        let count = leaves.len();
        reporter.report(
            &self.target,
            Record::new(self.target.clone(), Status::Healthy)
                .with_latency(started.elapsed())
                .with_message(format!("target count: {count}"))
                .with_extra("target_count", count),
        );

        let tracking = self.tracker.prepare(reporter);
        let composer = ReportComposer::new(self.target.clone(), vec![&tracking as &dyn Reporter]);
        join_all(leaves.values().map(|leaf| leaf.probe(ctx, &composer))).await;

        let inactives = self.tracker.inactives();
        if !inactives.is_empty() {
            reporter.deactivate_target(&self.target, &inactives);
        }

        *lock(&self.cache) = leaves;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_list_kinds() {
        let parse = |s: &str| SourceList::parse(&Url::parse(s).unwrap());

        let file = |s: &str| match parse(s) {
            Ok(SourceList::File(p)) => Some(p),
            _ => None,
        };
        assert_eq!(file("source:./targets.txt"), Some(PathBuf::from("./targets.txt")));
        assert_eq!(file("source+file:/etc/ayd/list"), Some(PathBuf::from("/etc/ayd/list")));

        let Ok(SourceList::Http(url)) = parse("source+https://example.com/list.txt") else {
            panic!("expected an http list");
        };
        assert_eq!(url.as_str(), "https://example.com/list.txt");

        assert!(matches!(parse("source+exec:/usr/bin/list-targets"), Ok(SourceList::Exec(_))));
        let unsupported = |s: &str| matches!(parse(s), Err(ProbeError::UnsupportedScheme(_)));
        assert!(unsupported("source+ftp://example.com/list"));
        assert!(unsupported("source-http://example.com/list"));
    }

    #[test]
    fn test_into_leaves_prefers_failure() {
        let mut expansion: Expansion<()> = Expansion::default();
        expansion.invalid.push(ProbeError::MissingPort);
        assert!(expansion.into_leaves().unwrap_err().contains("port number required"));

        let expansion: Expansion<()> =
            Expansion { failure: Some("source loop detected".into()), ..Default::default() };
        assert_eq!(expansion.into_leaves().unwrap_err(), "source loop detected");
    }
}
