//! Alert delivery through the regular checkers.
//!
//! An alerter runs a checker against its address enriched with the record
//! that triggered the alert. Network checkers receive the record as `ayd_*`
//! query parameters, commands and plugins as `ayd_*` environment variables.
//! Every resulting record is reported under an `alert:` address so a failed
//! delivery never looks like a failed health check.

use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use chrono::SecondsFormat;
use futures::future::join_all;
use tracing::{debug, warn};
use url::Url;

use crate::address::{Scheme, Separator, alert_target, parse_target};
use crate::context::ProbeContext;
use crate::error::ProbeError;
use crate::probe::exec::ExecProbe;
use crate::probe::plugin::PluginRunner;
use crate::probe::source::{LOAD_TIMEOUT, SourceList, expand};
use crate::probe::ssh::RemoteExecProbe;
use crate::probe::{Prober, new_direct_prober};
use crate::record::{Record, Status};
use crate::reporter::{AlertReporter, Reporter};
use crate::tracker::TargetTracker;

/// Delivers an alert about one record.
#[async_trait]
pub trait Alerter: Send + Sync {
    fn target(&self) -> &Url;

    async fn alert(&self, ctx: &ProbeContext, reporter: &dyn Reporter, record: &Record);
}

/// The `ayd_*` values describing `record`.
pub fn alert_params(record: &Record) -> Vec<(String, String)> {
    vec![
        ("ayd_status".into(), record.status.to_string()),
        ("ayd_target".into(), record.target.to_string()),
        ("ayd_latency".into(), format!("{:.3}", record.latency_ms())),
        ("ayd_message".into(), record.message.clone()),
        ("ayd_checked_at".into(), record.time.to_rfc3339_opts(SecondsFormat::Secs, true)),
    ]
}

/// Build an alerter for a raw address.
///
/// Source lists are read once so that malformed lines are rejected here.
pub async fn new_alerter(raw: &str) -> Result<Box<dyn Alerter>, ProbeError> {
    let url = parse_target(raw)?;
    if Scheme::parse(url.scheme()).base == "source" {
        return Ok(Box::new(SourceAlerter::load(url).await?));
    }
    new_direct_alerter(url)
}

/// Build an alerter without reading any source list.
pub fn new_direct_alerter(url: Url) -> Result<Box<dyn Alerter>, ProbeError> {
    let scheme = url.scheme().to_string();
    let parsed = Scheme::parse(&scheme);

    let alerter: Box<dyn Alerter> = match parsed.base {
        "exec" => Box::new(ExecAlerter::new(url)?),
        "source" => Box::new(SourceAlerter::new(url)?),
        "http" | "https" | "tcp" | "tcp4" | "tcp6" | "dns" | "dns4" | "dns6" | "ping" | "ping4"
        | "ping6" | "ssh" | "sftp" | "ftp" | "ftps" | "file" | "dummy" => {
            Box::new(ProbeAlerter::new(url)?)
        }
        _ => Box::new(PluginAlerter::new(url)),
    };

    debug!(alert = %alerter.target(), "prepared alerter");
    Ok(alerter)
}

fn delivery_failure(target: &Url, error: &ProbeError) -> Record {
    Record::new(alert_target(target), Status::Unknown).with_message(error.to_string())
}

/// Runs a built-in network checker against the enriched address.
pub struct ProbeAlerter {
    target: Url,
}

impl ProbeAlerter {
    pub fn new(target: Url) -> Result<Self, ProbeError> {
        new_direct_prober(target.clone())?;
        Ok(Self { target })
    }

    fn enrich(&self, record: &Record) -> Url {
        let mut url = self.target.clone();
        url.query_pairs_mut().extend_pairs(alert_params(record));
        url
    }
}

#[async_trait]
impl Alerter for ProbeAlerter {
    fn target(&self) -> &Url {
        &self.target
    }

    async fn alert(&self, ctx: &ProbeContext, reporter: &dyn Reporter, record: &Record) {
        let prober = match new_direct_prober(self.enrich(record)) {
            Ok(prober) => prober,
            Err(e) => {
                let failed = delivery_failure(&self.target, &e);
                return reporter.report(&self.target, ctx.classify(failed));
            }
        };

        let alerting = AlertReporter::new(prober.target().clone(), self.target.clone(), reporter);
        prober.probe(ctx, &alerting).await;
    }
}

enum CommandKind {
    Local(ExecProbe),
    Remote(RemoteExecProbe),
}

/// Runs a local or remote command with the record in its environment.
pub struct ExecAlerter {
    target: Url,
    command: CommandKind,
}

impl ExecAlerter {
    pub fn new(target: Url) -> Result<Self, ProbeError> {
        let scheme = target.scheme().to_string();
        let command = match Scheme::parse(&scheme).variant_for(Separator::SubProtocol, &scheme)? {
            "" => CommandKind::Local(ExecProbe::new(target.clone())?),
            "ssh" => CommandKind::Remote(RemoteExecProbe::new(target.clone())?),
            _ => return Err(ProbeError::UnsupportedScheme(scheme)),
        };
        Ok(Self { target, command })
    }
}

#[async_trait]
impl Alerter for ExecAlerter {
    fn target(&self) -> &Url {
        &self.target
    }

    async fn alert(&self, ctx: &ProbeContext, reporter: &dyn Reporter, record: &Record) {
        let alerting = AlertReporter::new(self.target.clone(), self.target.clone(), reporter);
        let env = alert_params(record);

        match &self.command {
            CommandKind::Local(exec) => exec.with_env(env).probe(ctx, &alerting).await,
            CommandKind::Remote(exec) => exec.with_env(env).probe(ctx, &alerting).await,
        }
    }
}

/// Hands the alert to a `<scheme>-alert` plugin.
///
/// The plugin gets the alert address and the triggering record as arguments.
pub struct PluginAlerter {
    target: Url,
    runner: PluginRunner,
    tracker: TargetTracker,
}

impl PluginAlerter {
    pub fn new(target: Url) -> Self {
        let runner = PluginRunner::alert(target.scheme());
        Self { target, runner, tracker: TargetTracker::new() }
    }
}

#[async_trait]
impl Alerter for PluginAlerter {
    fn target(&self) -> &Url {
        &self.target
    }

    async fn alert(&self, ctx: &ProbeContext, reporter: &dyn Reporter, record: &Record) {
        let alerting = AlertReporter::new(self.target.clone(), self.target.clone(), reporter);
        let args = [self.target.to_string(), record.to_string()];
        let env = alert_params(record);
        self.runner.run(ctx, &self.target, &args, &env, &self.tracker, &alerting).await;
    }
}

/// Sends the alert to every alert address listed by a source.
pub struct SourceAlerter {
    target: Url,
}

impl SourceAlerter {
    pub fn new(target: Url) -> Result<Self, ProbeError> {
        SourceList::parse(&target)?;
        Ok(Self { target })
    }

    /// Prepare and read the list once, rejecting malformed lines.
    pub async fn load(target: Url) -> Result<Self, ProbeError> {
        let alerter = Self::new(target)?;
        let ctx = ProbeContext::with_timeout(LOAD_TIMEOUT);

        match ctx.run(alerter.expand()).await {
            Ok(expansion) if expansion.failure.is_none() && !expansion.invalid.is_empty() => {
                Err(ProbeError::Multiple(expansion.invalid))
            }
            Ok(expansion) => {
                if let Some(failure) = expansion.failure {
                    warn!(
                        source = %alerter.target,
                        error = %failure,
                        "failed to load alert source"
                    );
                }
                Ok(alerter)
            }
            Err(_) => {
                warn!(source = %alerter.target, "timed out loading alert source");
                Ok(alerter)
            }
        }
    }

    async fn expand(&self) -> crate::probe::source::Expansion<Arc<dyn Alerter>> {
        let build = |url: Url| -> Result<(String, Arc<dyn Alerter>), ProbeError> {
            let alerter: Arc<dyn Alerter> = Arc::from(new_direct_alerter(url)?);
            Ok((alerter.target().to_string(), alerter))
        };
        expand(&self.target, &build).await
    }
}

#[async_trait]
impl Alerter for SourceAlerter {
    fn target(&self) -> &Url {
        &self.target
    }

    async fn alert(&self, ctx: &ProbeContext, reporter: &dyn Reporter, record: &Record) {
        let started = Instant::now();
        let inner = ctx.narrow(LOAD_TIMEOUT);

        let alerters = match inner.run(self.expand()).await {
            Ok(expansion) => expansion.into_leaves(),
            Err(interruption) => {
                let failed =
                    interruption.into_record(alert_target(&self.target), started.elapsed());
                return reporter.report(&self.target, ctx.classify(failed));
            }
        };
        let alerters = match alerters {
            Ok(alerters) => alerters,
            Err(message) => {
                let failed = Record::new(alert_target(&self.target), Status::Failure)
                    .with_latency(started.elapsed())
                    .with_message(message);
                return reporter.report(&self.target, ctx.classify(failed));
            }
        };

        join_all(alerters.values().map(|alerter| alerter.alert(ctx, reporter, record))).await;
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::reporter::MemoryReporter;

    fn url(s: &str) -> Url {
        Url::parse(s).unwrap()
    }

    fn incident() -> Record {
        Record::new(url("https://example.com/health"), Status::Failure)
            .with_latency(Duration::from_micros(12_345))
            .with_message("connection refused")
    }

    #[test]
    fn test_alert_params() {
        let record = incident();
        let params = alert_params(&record);

        let get = |key: &str| params.iter().find(|(k, _)| k == key).map(|(_, v)| v.as_str());
        assert_eq!(get("ayd_status"), Some("FAILURE"));
        assert_eq!(get("ayd_target"), Some("https://example.com/health"));
        assert_eq!(get("ayd_latency"), Some("12.345"));
        assert_eq!(get("ayd_message"), Some("connection refused"));
        assert!(get("ayd_checked_at").is_some_and(|t| t.ends_with('Z')));
    }

    #[test]
    fn test_enriched_address() {
        let alerter =
            ProbeAlerter::new(url("https://hooks.example.com/notify?channel=ops")).unwrap();
        let enriched = alerter.enrich(&incident());

        assert_eq!(enriched.host_str(), Some("hooks.example.com"));
        let pairs: Vec<(String, String)> = enriched.query_pairs().into_owned().collect();
        assert_eq!(pairs[0], ("channel".into(), "ops".into()));
        assert!(pairs.contains(&("ayd_status".into(), "FAILURE".into())));
    }

    #[test]
    fn test_dispatch() {
        assert!(new_direct_alerter(url("exec:/usr/bin/notify-send")).is_ok());
        assert!(new_direct_alerter(url("slack:ops")).is_ok());
        assert!(matches!(
            new_direct_alerter(url("tcp://example.com")),
            Err(ProbeError::MissingPort)
        ));
        assert!(matches!(
            new_direct_alerter(url("exec+ftp:/usr/bin/notify")),
            Err(ProbeError::UnsupportedScheme(_))
        ));
    }

    #[tokio::test]
    async fn test_dummy_alert_is_prefixed() {
        let alerter = new_alerter("dummy:healthy").await.unwrap();
        let reporter = MemoryReporter::new();

        alerter.alert(&ProbeContext::new(), &reporter, &incident()).await;

        let records = reporter.records();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].target.as_str(), "alert:dummy:healthy");
        assert_eq!(records[0].status, Status::Healthy);
    }
}
