use std::sync::{Arc, Mutex};

use tracing::debug;
use url::Url;

use crate::address::alert_target;
use crate::record::Record;

/// Sink for probe results.
///
/// `source` is the address of the checker that produced the record, which
/// differs from `record.target` for aggregating checkers.
pub trait Reporter: Send + Sync {
    fn report(&self, source: &Url, record: Record);

    /// Tell the sink that `targets` were not seen in the latest cycle of `source`.
    fn deactivate_target(&self, source: &Url, targets: &[Url]);
}

impl<R: Reporter + ?Sized> Reporter for Arc<R> {
    fn report(&self, source: &Url, record: Record) {
        (**self).report(source, record)
    }

    fn deactivate_target(&self, source: &Url, targets: &[Url]) {
        (**self).deactivate_target(source, targets)
    }
}

impl<R: Reporter + ?Sized> Reporter for &R {
    fn report(&self, source: &Url, record: Record) {
        (**self).report(source, record)
    }

    fn deactivate_target(&self, source: &Url, targets: &[Url]) {
        (**self).deactivate_target(source, targets)
    }
}

/// Reporter keeping everything in memory.
#[derive(Debug, Default)]
pub struct MemoryReporter {
    records: Mutex<Vec<(Url, Record)>>,
    deactivated: Mutex<Vec<(Url, Vec<Url>)>>,
}

impl MemoryReporter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records reported so far, in arrival order.
    pub fn records(&self) -> Vec<Record> {
        lock(&self.records).iter().map(|(_, r)| r.clone()).collect()
    }

    /// Records together with the source they were reported under.
    pub fn entries(&self) -> Vec<(Url, Record)> {
        lock(&self.records).clone()
    }

    pub fn deactivations(&self) -> Vec<(Url, Vec<Url>)> {
        lock(&self.deactivated).clone()
    }

    pub fn clear(&self) {
        lock(&self.records).clear();
        lock(&self.deactivated).clear();
    }
}

impl Reporter for MemoryReporter {
    fn report(&self, source: &Url, record: Record) {
        lock(&self.records).push((source.clone(), record));
    }

    fn deactivate_target(&self, source: &Url, targets: &[Url]) {
        lock(&self.deactivated).push((source.clone(), targets.to_vec()));
    }
}

pub(crate) fn lock<T>(m: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Forwards every call to all upstreams, replacing the source address.
pub struct ReportComposer<'a> {
    source: Url,
    upstreams: Vec<&'a dyn Reporter>,
}

impl<'a> ReportComposer<'a> {
    pub fn new(source: Url, upstreams: Vec<&'a dyn Reporter>) -> Self {
        Self { source, upstreams }
    }
}

impl Reporter for ReportComposer<'_> {
    fn report(&self, _source: &Url, record: Record) {
        for upstream in &self.upstreams {
            upstream.report(&self.source, record.clone());
        }
    }

    fn deactivate_target(&self, _source: &Url, targets: &[Url]) {
        for upstream in &self.upstreams {
            upstream.deactivate_target(&self.source, targets);
        }
    }
}

/// Rewrites records produced while delivering an alert.
///
/// The enriched address the underlying prober ran against is replaced by
/// the alert address, which is then prefixed with `alert:`.
pub struct AlertReporter<'a> {
    probe_target: Url,
    alert_target: Url,
    upstream: &'a dyn Reporter,
}

impl<'a> AlertReporter<'a> {
    pub fn new(probe_target: Url, alert_target: Url, upstream: &'a dyn Reporter) -> Self {
        Self { probe_target, alert_target, upstream }
    }
}

impl Reporter for AlertReporter<'_> {
    fn report(&self, source: &Url, mut record: Record) {
        if record.target == self.probe_target {
            record.target = self.alert_target.clone();
        }
        record.target = alert_target(&record.target);
        debug!(alert = %record.target, status = %record.status, "alert delivery result");
        self.upstream.report(source, record);
    }

    fn deactivate_target(&self, source: &Url, targets: &[Url]) {
        let targets: Vec<Url> = targets.iter().map(alert_target).collect();
        self.upstream.deactivate_target(source, &targets);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::Status;

    fn url(s: &str) -> Url {
        Url::parse(s).unwrap()
    }

    #[test]
    fn test_composer_rewrites_source_for_every_upstream() {
        let a = MemoryReporter::new();
        let b = MemoryReporter::new();
        let composer = ReportComposer::new(url("source:list.txt"), vec![&a as &dyn Reporter, &b]);

        composer.report(&url("dummy:healthy"), Record::new(url("dummy:healthy"), Status::Healthy));
        composer.deactivate_target(&url("dummy:healthy"), &[url("dummy:failure")]);

        for r in [&a, &b] {
            let entries = r.entries();
            assert_eq!(entries.len(), 1);
            assert_eq!(entries[0].0.as_str(), "source:list.txt");
            assert_eq!(entries[0].1.target.as_str(), "dummy:healthy");
            assert_eq!(r.deactivations()[0].0.as_str(), "source:list.txt");
        }
    }

    #[test]
    fn test_alert_reporter_rewrites_targets() {
        let upstream = MemoryReporter::new();
        let reporter = AlertReporter::new(
            url("exec:/bin/notify?ayd_status=FAILURE"),
            url("exec:/bin/notify"),
            &upstream,
        );

        let source = url("exec:/bin/notify");
        let delivered = Record::new(url("exec:/bin/notify?ayd_status=FAILURE"), Status::Healthy);
        reporter.report(&source, delivered);
        reporter.report(&source, Record::new(url("alert:foo:bar"), Status::Failure));
        reporter.report(&source, Record::new(url("ayd:alert:failed"), Status::Failure));

        let targets: Vec<String> =
            upstream.records().iter().map(|r| r.target.to_string()).collect();
        assert_eq!(targets, vec!["alert:exec:/bin/notify", "alert:foo:bar", "ayd:alert:failed"]);
    }
}
