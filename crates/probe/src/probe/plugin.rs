//! External plugins.
//!
//! A plugin is an executable named after the scheme it handles, such as
//! `foo-probe` for `foo:` addresses or `foo-alert` for alerts. It gets the
//! address as its first argument and prints one record per line.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Instant;

use async_trait::async_trait;
use tokio::process::Command;
use tracing::{debug, warn};
use url::Url;

use crate::address::plugin_candidates;
use crate::context::ProbeContext;
use crate::error::ProbeError;
use crate::probe::exec::spawn_error_record;
use crate::probe::{EXEC_TIMEOUT, Prober};
use crate::record::{Record, Status};
use crate::reporter::Reporter;
use crate::settings;
use crate::tracker::TargetTracker;
use crate::util::exit_status_message;

/// Locates and runs the plugin for one scheme.
#[derive(Debug, Clone)]
pub(crate) struct PluginRunner {
    scheme: String,
    suffix: &'static str,
}

#[cfg(unix)]
fn is_executable(path: &Path) -> bool {
    use std::os::unix::fs::PermissionsExt;
    std::fs::metadata(path)
        .is_ok_and(|meta| meta.is_file() && meta.permissions().mode() & 0o111 != 0)
}

#[cfg(not(unix))]
fn is_executable(path: &Path) -> bool {
    std::fs::metadata(path).is_ok_and(|meta| meta.is_file())
}

impl PluginRunner {
    pub fn probe(scheme: &str) -> Self {
        Self { scheme: scheme.to_string(), suffix: "probe" }
    }

    pub fn alert(scheme: &str) -> Self {
        Self { scheme: scheme.to_string(), suffix: "alert" }
    }

    pub fn candidates(&self) -> Vec<String> {
        plugin_candidates(&self.scheme, self.suffix)
    }

    /// Most specific candidate found in the plugin directories or on `PATH`.
    pub fn find(&self) -> Option<PathBuf> {
        let mut dirs = settings::current().plugin_dirs.clone();
        if let Some(path) = std::env::var_os("PATH") {
            dirs.extend(std::env::split_paths(&path));
        }

        self.candidates()
            .iter()
            .find_map(|name| dirs.iter().map(|dir| dir.join(name)).find(|p| is_executable(p)))
    }

    /// Run the plugin and report what it prints under `target`.
    pub async fn run(
        &self,
        ctx: &ProbeContext,
        target: &Url,
        args: &[String],
        env: &[(String, String)],
        tracker: &TargetTracker,
        reporter: &dyn Reporter,
    ) {
        let started = Instant::now();

        let Some(program) = self.find() else {
            let record = Record::new(target.clone(), Status::Unknown)
                .with_message(format!("plugin not found: {}", self.candidates().join(", ")));
            return reporter.report(target, ctx.classify(record));
        };
        debug!(plugin = %program.display(), target_url = %target, "running plugin");

        let mut cmd = Command::new(&program);
        cmd.args(args)
            .envs(env.iter().map(|(k, v)| (k, v)))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let inner = ctx.narrow(EXEC_TIMEOUT);
        let output = match inner.run(cmd.output()).await {
            Ok(Ok(output)) => output,
            Ok(Err(e)) => {
                let record = spawn_error_record(target.clone(), &program.display().to_string(), &e);
                let record = record.with_latency(started.elapsed());
                return reporter.report(target, ctx.classify(record));
            }
            Err(interruption) => {
                let record = interruption.into_record(target.clone(), started.elapsed());
                return reporter.report(target, ctx.classify(record));
            }
        };
        let latency = started.elapsed();

        let tracking = tracker.prepare(reporter);
        let stdout = String::from_utf8_lossy(&output.stdout);
        let mut reported = 0;
        let mut invalid = Vec::new();

        for line in stdout.lines().map(str::trim).filter(|l| !l.is_empty()) {
            match line.parse::<Record>() {
                Ok(record) => {
                    tracking.report(target, record);
                    reported += 1;
                }
                Err(e) => {
                    debug!(plugin = %program.display(), error = %e, "invalid plugin output");
                    invalid.push(line);
                }
            }
        }

        if !invalid.is_empty() {
            warn!(
                plugin = %program.display(),
                lines = invalid.len(),
                "plugin printed invalid records"
            );
            let record = Record::new(target.clone(), Status::Unknown)
                .with_latency(latency)
                .with_message("the plugin reported invalid records")
                .with_extra("raw_message", invalid.join("\n"));
            tracking.report(target, ctx.classify(record));
        } else if reported == 0 {
            let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
            let record = if output.status.success() {
                Record::new(target.clone(), Status::Healthy).with_message(stderr)
            } else {
                let status = exit_status_message(&output.status);
                let message =
                    if stderr.is_empty() { status } else { format!("{stderr}: {status}") };
                Record::new(target.clone(), Status::Failure).with_message(message)
            };
            tracking.report(target, ctx.classify(record.with_latency(latency)));
        }

        let inactives = tracker.inactives();
        if !inactives.is_empty() {
            reporter.deactivate_target(target, &inactives);
        }
    }
}

/// Prober for any scheme without a built-in checker.
pub struct PluginProbe {
    target: Url,
    runner: PluginRunner,
    tracker: TargetTracker,
}

impl PluginProbe {
    pub fn new(target: Url) -> Result<Self, ProbeError> {
        let runner = PluginRunner::probe(target.scheme());
        Ok(Self { target, runner, tracker: TargetTracker::new() })
    }
}

#[async_trait]
impl Prober for PluginProbe {
    fn target(&self) -> &Url {
        &self.target
    }

    async fn probe(&self, ctx: &ProbeContext, reporter: &dyn Reporter) {
        let args = [self.target.to_string()];
        self.runner.run(ctx, &self.target, &args, &[], &self.tracker, reporter).await;
    }
}
