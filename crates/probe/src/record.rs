use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use url::Url;

/// Outcome of a single check.
///
/// Variants are declared from least to most severe so that `Ord` gives the
/// worst-status aggregation used by dashboards and alerting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Status {
    Healthy,
    Aborted,
    Unknown,
    Degrade,
    Failure,
}

impl Status {
    pub fn as_str(&self) -> &'static str {
        match self {
            Status::Healthy => "HEALTHY",
            Status::Aborted => "ABORTED",
            Status::Unknown => "UNKNOWN",
            Status::Degrade => "DEGRADE",
            Status::Failure => "FAILURE",
        }
    }

    /// Most severe status of the given set, `None` when empty.
    pub fn worst(statuses: impl IntoIterator<Item = Status>) -> Option<Status> {
        statuses.into_iter().max()
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Status {
    type Err = RecordParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "HEALTHY" => Ok(Status::Healthy),
            "ABORTED" => Ok(Status::Aborted),
            "UNKNOWN" => Ok(Status::Unknown),
            "DEGRADE" => Ok(Status::Degrade),
            "FAILURE" => Ok(Status::Failure),
            _ => Err(RecordParseError::Status(s.to_string())),
        }
    }
}

/// Error raised when a line is not a valid record.
#[derive(Debug, Error)]
pub enum RecordParseError {
    #[error("invalid record: {0}")]
    Json(#[from] serde_json::Error),

    #[error("invalid time: {0}")]
    Time(#[from] chrono::ParseError),

    #[error("invalid status: {0:?}")]
    Status(String),

    #[error("invalid latency: {0}")]
    Latency(f64),

    #[error("invalid target: {0}")]
    Target(#[from] url::ParseError),
}

/// Result of one check against one target.
#[derive(Debug, Clone, PartialEq)]
pub struct Record {
    /// When the check completed
    pub time: DateTime<Utc>,

    /// Status of the target
    pub status: Status,

    /// How long the check took
    pub latency: Duration,

    /// Address that was checked
    pub target: Url,

    /// Human readable description of the outcome
    pub message: String,

    /// Protocol specific diagnostics
    pub extra: BTreeMap<String, Value>,
}

impl Record {
    /// Create a record stamped with the current time
    pub fn new(target: Url, status: Status) -> Self {
        Self {
            time: Utc::now(),
            status,
            latency: Duration::ZERO,
            target,
            message: String::new(),
            extra: BTreeMap::new(),
        }
    }

    pub fn with_status(mut self, status: Status) -> Self {
        self.status = status;
        self
    }

    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = message.into();
        self
    }

    pub fn with_extra(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.extra.insert(key.into(), value.into());
        self
    }

    pub fn with_time(mut self, time: DateTime<Utc>) -> Self {
        self.time = time;
        self
    }

    /// Latency in milliseconds, rounded to microseconds.
    pub fn latency_ms(&self) -> f64 {
        (self.latency.as_secs_f64() * 1_000_000.0).round() / 1_000.0
    }
}

#[derive(Serialize)]
struct RecordLineRef<'a> {
    time: String,
    status: Status,
    latency: f64,
    target: &'a str,
    message: &'a str,
    #[serde(flatten)]
    extra: &'a BTreeMap<String, Value>,
}

#[derive(Deserialize)]
struct RecordLine {
    time: String,
    status: String,
    #[serde(default)]
    latency: f64,
    target: String,
    #[serde(default)]
    message: String,
    #[serde(flatten)]
    extra: BTreeMap<String, Value>,
}

/// Canonical one-line form: a JSON object with the fixed keys first.
impl fmt::Display for Record {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let line = RecordLineRef {
            time: self.time.to_rfc3339_opts(SecondsFormat::Secs, true),
            status: self.status,
            latency: self.latency_ms(),
            target: self.target.as_str(),
            message: &self.message,
            extra: &self.extra,
        };
        let text = serde_json::to_string(&line).map_err(|_| fmt::Error)?;
        f.write_str(&text)
    }
}

impl FromStr for Record {
    type Err = RecordParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let line: RecordLine = serde_json::from_str(s.trim())?;

        let time = DateTime::parse_from_rfc3339(&line.time)?.with_timezone(&Utc);
        let status = line.status.parse()?;
        if line.latency < 0.0 {
            return Err(RecordParseError::Latency(line.latency));
        }
        let latency = Duration::try_from_secs_f64(line.latency / 1_000.0)
            .map_err(|_| RecordParseError::Latency(line.latency))?;
        let target = Url::parse(&line.target)?;

        Ok(Self {
            time,
            status,
            latency,
            target,
            message: line.message,
            extra: line.extra,
        })
    }
}
