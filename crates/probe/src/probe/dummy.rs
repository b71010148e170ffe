use std::time::Duration;

use async_trait::async_trait;
use rand::Rng;
use url::Url;

use crate::address::query_value;
use crate::context::ProbeContext;
use crate::error::ProbeError;
use crate::probe::{Prober, report_single};
use crate::record::{Record, Status};
use crate::reporter::Reporter;
use crate::util::parse_duration;

/// Status requested by a `dummy:` address.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Outcome {
    Fixed(Status),
    Random,
}

/// Reports whatever the address asks for, after sleeping for `latency`.
///
/// `dummy:healthy?latency=10ms&message=hello`
pub struct DummyProbe {
    target: Url,
    outcome: Outcome,
    latency: Duration,
    message: Option<String>,
}

impl DummyProbe {
    pub fn new(target: Url) -> Result<Self, ProbeError> {
        let name = if target.cannot_be_a_base() {
            target.path().to_string()
        } else {
            target.host_str().unwrap_or_default().to_string()
        };

        let outcome = match name.to_ascii_lowercase().as_str() {
            "" | "healthy" => Outcome::Fixed(Status::Healthy),
            "random" => Outcome::Random,
            other => Outcome::Fixed(
                other.parse().map_err(|_| ProbeError::invalid("dummy status", other.to_string()))?,
            ),
        };

        let latency = match query_value(&target, "latency") {
            Some(text) => {
                parse_duration(&text).ok_or_else(|| ProbeError::invalid("latency", text))?
            }
            None => Duration::ZERO,
        };

        let message = query_value(&target, "message");

        Ok(Self { target, outcome, latency, message })
    }

    fn status(&self) -> Status {
        match self.outcome {
            Outcome::Fixed(status) => status,
            Outcome::Random => {
                const CHOICES: [Status; 3] = [Status::Healthy, Status::Degrade, Status::Failure];
                CHOICES[rand::thread_rng().gen_range(0..CHOICES.len())]
            }
        }
    }
}

#[async_trait]
impl Prober for DummyProbe {
    fn target(&self) -> &Url {
        &self.target
    }

    async fn probe(&self, ctx: &ProbeContext, reporter: &dyn Reporter) {
        let status = self.status();
        let message = self.message.clone().unwrap_or_else(|| match status {
            Status::Healthy => "healthy".to_string(),
            other => other.as_str().to_ascii_lowercase(),
        });

        let work = async {
            tokio::time::sleep(self.latency).await;
            Record::new(self.target.clone(), status)
                .with_latency(self.latency)
                .with_message(message)
        };
        let timeout = self.latency + Duration::from_secs(60);
        report_single(ctx, timeout, &self.target, reporter, work).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reporter::MemoryReporter;

    #[tokio::test]
    async fn test_reports_requested_status() {
        let probe = DummyProbe::new(Url::parse("dummy:degrade?message=slow").unwrap()).unwrap();
        let reporter = MemoryReporter::new();
        probe.probe(&ProbeContext::new(), &reporter).await;

        let records = reporter.records();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].status, Status::Degrade);
        assert_eq!(records[0].message, "slow");
        assert_eq!(records[0].target.as_str(), "dummy:degrade?message=slow");
    }

    #[test]
    fn test_rejects_unknown_status() {
        assert!(DummyProbe::new(Url::parse("dummy:sleepy").unwrap()).is_err());
        assert!(DummyProbe::new(Url::parse("dummy:healthy?latency=forever").unwrap()).is_err());
    }
}
