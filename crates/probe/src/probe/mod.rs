//! Protocol checkers and address dispatch.

use std::future::Future;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tracing::debug;
use url::Url;

use crate::address::{Scheme, parse_target};
use crate::context::ProbeContext;
use crate::error::ProbeError;
use crate::record::Record;
use crate::reporter::Reporter;

pub mod dns;
pub mod dummy;
pub mod exec;
pub mod file;
pub mod ftp;
pub mod http;
pub mod ping;
pub mod plugin;
pub mod sftp;
pub mod source;
pub mod ssh;
pub mod tcp;

pub use dns::DnsProbe;
pub use dummy::DummyProbe;
pub use exec::ExecProbe;
pub use file::FileProbe;
pub use ftp::FtpProbe;
pub use http::HttpProbe;
pub use ping::PingProbe;
pub use plugin::PluginProbe;
pub use sftp::SftpProbe;
pub use source::SourceProbe;
pub use ssh::{RemoteExecProbe, SshProbe};
pub use tcp::TcpProbe;

pub const TCP_TIMEOUT: Duration = Duration::from_secs(10);
pub const DNS_TIMEOUT: Duration = Duration::from_secs(10);
pub const HTTP_TIMEOUT: Duration = Duration::from_secs(10 * 60);
pub const FTP_TIMEOUT: Duration = Duration::from_secs(10 * 60);
pub const SSH_TIMEOUT: Duration = Duration::from_secs(10 * 60);
pub const SFTP_TIMEOUT: Duration = SSH_TIMEOUT;
pub const EXEC_TIMEOUT: Duration = Duration::from_secs(60 * 60);

/// A check against one target address.
#[async_trait]
pub trait Prober: Send + Sync {
    /// Address this prober checks. Parsing it again yields an equivalent prober.
    fn target(&self) -> &Url;

    /// Perform the check, writing every result to `reporter`.
    async fn probe(&self, ctx: &ProbeContext, reporter: &dyn Reporter);
}

/// Build a prober for a raw address.
///
/// Sources are loaded once here so that malformed lists are rejected up front.
pub async fn new_prober(raw: &str) -> Result<Box<dyn Prober>, ProbeError> {
    new_prober_from_url(parse_target(raw)?).await
}

pub async fn new_prober_from_url(url: Url) -> Result<Box<dyn Prober>, ProbeError> {
    let scheme = url.scheme().to_string();
    if Scheme::parse(&scheme).base == "source" {
        return Ok(Box::new(SourceProbe::load(url).await?));
    }
    new_direct_prober(url)
}

/// Build a prober without any I/O apart from the ICMP permission check.
///
/// Unknown schemes are handed to plugins.
pub fn new_direct_prober(url: Url) -> Result<Box<dyn Prober>, ProbeError> {
    let scheme = url.scheme().to_string();
    let parsed = Scheme::parse(&scheme);

    let prober: Box<dyn Prober> = match parsed.base {
        "http" | "https" => Box::new(HttpProbe::new(url)?),
        "tcp" | "tcp4" | "tcp6" => Box::new(TcpProbe::new(url)?),
        "dns" | "dns4" | "dns6" => Box::new(DnsProbe::new(url)?),
        "ping" | "ping4" | "ping6" => Box::new(PingProbe::new(url)?),
        "ssh" => Box::new(SshProbe::new(url)?),
        "sftp" => Box::new(SftpProbe::new(url)?),
        "ftp" | "ftps" => Box::new(FtpProbe::new(url)?),
        "file" => Box::new(FileProbe::new(url)?),
        "exec" => match parsed.variant_for(crate::address::Separator::SubProtocol, &scheme)? {
            "" => Box::new(ExecProbe::new(url)?),
            "ssh" => Box::new(RemoteExecProbe::new(url)?),
            _ => return Err(ProbeError::UnsupportedScheme(scheme)),
        },
        "dummy" => Box::new(DummyProbe::new(url)?),
        "source" => Box::new(SourceProbe::new(url)?),
        _ => Box::new(PluginProbe::new(url)?),
    };

    debug!(target_url = %prober.target(), "prepared prober");
    Ok(prober)
}

/// Run the single-record check `work` under `timeout` and report its outcome.
///
/// The record is overridden when the caller's context was cancelled or ran
/// out of time; the protocol deadline alone yields a plain timeout failure.
pub(crate) async fn report_single<F>(
    ctx: &ProbeContext,
    timeout: Duration,
    target: &Url,
    reporter: &dyn Reporter,
    work: F,
) where
    F: Future<Output = Record>,
{
    let started = Instant::now();
    let inner = ctx.narrow(timeout);

    let record = match inner.run(work).await {
        Ok(record) => record,
        Err(interruption) => interruption.into_record(target.clone(), started.elapsed()),
    };

    reporter.report(target, ctx.classify(record));
}

/// Run a blocking check on the blocking pool.
pub(crate) async fn blocking<F>(target: &Url, f: F) -> Record
where
    F: FnOnce() -> Record + Send + 'static,
{
    match tokio::task::spawn_blocking(f).await {
        Ok(record) => record,
        Err(e) => Record::new(target.clone(), crate::record::Status::Unknown)
            .with_message(format!("check task failed: {e}")),
    }
}
