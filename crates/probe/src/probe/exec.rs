use std::io;
use std::process::Stdio;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::process::Command;
use tracing::debug;
use url::Url;

use crate::address::percent_decode;
use crate::context::ProbeContext;
use crate::error::ProbeError;
use crate::probe::{EXEC_TIMEOUT, Prober, report_single};
use crate::record::{Record, Status};
use crate::reporter::Reporter;

const STATUS_DIRECTIVE: &str = "::status::";
const LATENCY_DIRECTIVE: &str = "::latency::";

/// Apply `::status::` and `::latency::` lines found in `output`.
///
/// The last valid occurrence of each directive wins, and every valid
/// directive line is removed from the returned message.
pub fn apply_directives(
    output: &str,
    status: Status,
    latency: Duration,
) -> (Status, Duration, String) {
    let mut status = status;
    let mut latency = latency;
    let mut kept = Vec::new();

    for line in output.lines() {
        let trimmed = line.trim();
        if let Some(value) = trimmed.strip_prefix(STATUS_DIRECTIVE) {
            if let Ok(s) = value.parse::<Status>() {
                status = s;
                continue;
            }
        } else if let Some(value) = trimmed.strip_prefix(LATENCY_DIRECTIVE) {
            if let Ok(ms) = value.trim().parse::<f64>() {
                if ms.is_finite() && ms >= 0.0 {
                    latency = Duration::from_nanos((ms * 1_000_000.0).round() as u64);
                    continue;
                }
            }
        }
        kept.push(line);
    }

    (status, latency, kept.join("\n").trim().to_string())
}

/// Record for a finished command: exit code 0 is healthy, directives in the
/// output may override status and latency.
pub(crate) fn command_record(
    target: Url,
    exit_code: Option<i32>,
    output: &str,
    latency: Duration,
) -> Record {
    let initial = if exit_code == Some(0) { Status::Healthy } else { Status::Failure };
    let (status, latency, mut message) = apply_directives(output, initial, latency);

    if message.is_empty() && initial == Status::Failure {
        message = match exit_code {
            Some(code) => format!("exit status {code}"),
            None => "terminated by signal".to_string(),
        };
    }

    let mut record = Record::new(target, status).with_latency(latency).with_message(message);
    if let Some(code) = exit_code {
        record = record.with_extra("exit_code", code);
    }
    record
}

/// Record for a command that could not be started.
pub(crate) fn spawn_error_record(target: Url, command: &str, err: &io::Error) -> Record {
    let message = match err.kind() {
        io::ErrorKind::NotFound => format!("{command}: no such file or directory"),
        io::ErrorKind::PermissionDenied => format!("{command}: permission denied"),
        _ => format!("{command}: {err}"),
    };
    Record::new(target, Status::Unknown).with_message(message)
}

/// Runs a local command: `exec:/path/to/cmd?ENV=value#argument`.
#[derive(Clone)]
pub struct ExecProbe {
    target: Url,
    command: String,
    argument: Option<String>,
    env: Vec<(String, String)>,
}

impl ExecProbe {
    pub fn new(target: Url) -> Result<Self, ProbeError> {
        let command = percent_decode(target.path());
        if command.is_empty() {
            return Err(ProbeError::MissingCommand);
        }

        let argument = target.fragment().map(percent_decode);
        let env = target.query_pairs().map(|(k, v)| (k.into_owned(), v.into_owned())).collect();

        Ok(Self { target, command, argument, env })
    }

    /// Same command with additional environment variables.
    pub fn with_env(&self, extra: impl IntoIterator<Item = (String, String)>) -> Self {
        let mut probe = self.clone();
        probe.env.extend(extra);
        probe
    }

    pub fn command(&self) -> &str {
        &self.command
    }

    /// Command ready to spawn, with stdout and stderr captured.
    pub(crate) fn to_command(&self) -> Command {
        let mut cmd = Command::new(&self.command);
        cmd.args(self.argument.iter())
            .envs(self.env.iter().map(|(k, v)| (k, v)))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        cmd
    }

    async fn check(&self) -> Record {
        let started = Instant::now();
        let output = match self.to_command().output().await {
            Ok(output) => output,
            Err(e) => {
                debug!(command = %self.command, error = %e, "failed to run command");
                return spawn_error_record(self.target.clone(), &self.command, &e)
                    .with_latency(started.elapsed());
            }
        };
        let latency = started.elapsed();

        let mut text = String::from_utf8_lossy(&output.stdout).into_owned();
        if !output.stderr.is_empty() {
            if !text.is_empty() && !text.ends_with('\n') {
                text.push('\n');
            }
            text.push_str(&String::from_utf8_lossy(&output.stderr));
        }

        command_record(self.target.clone(), output.status.code(), &text, latency)
    }
}

#[async_trait]
impl Prober for ExecProbe {
    fn target(&self) -> &Url {
        &self.target
    }

    async fn probe(&self, ctx: &ProbeContext, reporter: &dyn Reporter) {
        report_single(ctx, EXEC_TIMEOUT, &self.target, reporter, self.check()).await;
    }
}
