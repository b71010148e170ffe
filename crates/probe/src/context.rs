use std::future::Future;
use std::time::Duration;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::record::{Record, Status};

/// Why a probe stopped before finishing its work.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Interruption {
    Cancelled,
    TimedOut,
}

/// Cancellation and deadline handed to every probe.
///
/// Checkers layer their own protocol deadline on top of the caller's with
/// [`ProbeContext::narrow`]. Only the caller's signals decide whether a record
/// is overridden with ABORTED or "probe timed out".
#[derive(Debug, Clone, Default)]
pub struct ProbeContext {
    token: CancellationToken,
    deadline: Option<Instant>,
}

impl ProbeContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_timeout(timeout: Duration) -> Self {
        Self { token: CancellationToken::new(), deadline: Some(Instant::now() + timeout) }
    }

    pub fn with_deadline(mut self, deadline: Instant) -> Self {
        self.deadline = Some(match self.deadline {
            Some(current) => current.min(deadline),
            None => deadline,
        });
        self
    }

    pub fn with_token(mut self, token: CancellationToken) -> Self {
        self.token = token;
        self
    }

    pub fn token(&self) -> &CancellationToken {
        &self.token
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    pub fn cancel(&self) {
        self.token.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Time left before the deadline, `None` without one.
    pub fn remaining(&self) -> Option<Duration> {
        self.deadline.map(|d| d.saturating_duration_since(Instant::now()))
    }

    /// Child context bounded by `timeout`, cancelled along with `self`.
    pub fn narrow(&self, timeout: Duration) -> Self {
        Self { token: self.token.child_token(), deadline: None }
            .with_deadline(Instant::now() + timeout)
            .with_deadline_opt(self.deadline)
    }

    fn with_deadline_opt(self, deadline: Option<Instant>) -> Self {
        match deadline {
            Some(d) => self.with_deadline(d),
            None => self,
        }
    }

    /// Which signal, if any, has fired. Cancellation wins over the deadline.
    pub fn interruption(&self) -> Option<Interruption> {
        if self.token.is_cancelled() {
            return Some(Interruption::Cancelled);
        }
        match self.deadline {
            Some(d) if Instant::now() >= d => Some(Interruption::TimedOut),
            _ => None,
        }
    }

    /// Drive `fut` until it completes or one of the signals fires.
    pub async fn run<F>(&self, fut: F) -> Result<F::Output, Interruption>
    where
        F: Future,
    {
        let sleep = async {
            match self.deadline {
                Some(d) => tokio::time::sleep_until(d).await,
                None => std::future::pending().await,
            }
        };

        tokio::select! {
            biased;
            _ = self.token.cancelled() => Err(Interruption::Cancelled),
            _ = sleep => Err(Interruption::TimedOut),
            out = fut => Ok(out),
        }
    }

    /// Override `record` when this context was interrupted.
    pub fn classify(&self, record: Record) -> Record {
        match self.interruption() {
            Some(Interruption::Cancelled) => {
                record.with_status(Status::Aborted).with_message("probe aborted")
            }
            Some(Interruption::TimedOut) => {
                record.with_status(Status::Failure).with_message("probe timed out")
            }
            None => record,
        }
    }
}

impl Interruption {
    /// Record describing the interruption of a check against `target`.
    pub fn into_record(self, target: url::Url, latency: Duration) -> Record {
        let record = Record::new(target, Status::Failure).with_latency(latency);
        match self {
            Interruption::Cancelled => {
                record.with_status(Status::Aborted).with_message("probe aborted")
            }
            Interruption::TimedOut => record.with_message("probe timed out"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_cancelled_context_aborts() {
        let ctx = ProbeContext::new();
        ctx.cancel();

        let out = ctx.run(tokio::time::sleep(Duration::from_secs(5))).await;
        assert_eq!(out, Err(Interruption::Cancelled));
        assert_eq!(ctx.interruption(), Some(Interruption::Cancelled));
    }

    #[tokio::test]
    async fn test_deadline_times_out() {
        let ctx = ProbeContext::with_timeout(Duration::from_millis(20));

        let out = ctx.run(tokio::time::sleep(Duration::from_secs(5))).await;
        assert_eq!(out, Err(Interruption::TimedOut));
    }

    #[tokio::test]
    async fn test_narrow_keeps_earlier_deadline_and_parent_cancel() {
        let parent = ProbeContext::with_timeout(Duration::from_millis(50));
        let child = parent.narrow(Duration::from_secs(60));
        assert!(child.remaining().unwrap() <= Duration::from_millis(50));

        let child = parent.narrow(Duration::from_millis(1));
        assert!(child.remaining().unwrap() <= Duration::from_millis(1));

        parent.cancel();
        assert!(child.is_cancelled());
    }

    #[tokio::test]
    async fn test_classify_only_touches_interrupted_contexts() {
        let target = url::Url::parse("dummy:healthy").unwrap();
        let record = Record::new(target, Status::Healthy);

        assert_eq!(ProbeContext::new().classify(record.clone()).status, Status::Healthy);

        let ctx = ProbeContext::with_timeout(Duration::ZERO);
        let out = ctx.classify(record);
        assert_eq!(out.status, Status::Failure);
        assert_eq!(out.message, "probe timed out");
    }
}
