use std::net::{SocketAddr, ToSocketAddrs};
use std::str::FromStr;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use suppaftp::list::File as ListEntry;
use suppaftp::native_tls::TlsConnector;
use suppaftp::{FtpError, NativeTlsConnector, NativeTlsFtpStream};
use url::Url;

use crate::address::{host_of, percent_decode};
use crate::context::ProbeContext;
use crate::error::ProbeError;
use crate::probe::file::{FileInfo, FileType, system_time};
use crate::probe::{FTP_TIMEOUT, Prober, blocking, report_single};
use crate::record::{Record, Status};
use crate::reporter::Reporter;

const FILE_UNAVAILABLE: u32 = 550;

/// Checks that a path exists on an FTP or FTPS server.
///
/// Without credentials in the address the anonymous account is used.
pub struct FtpProbe {
    target: Url,
    host: String,
    port: u16,
    secure: bool,
    username: String,
    password: String,
    path: String,
    required: Option<FileType>,
}

impl FtpProbe {
    pub fn new(target: Url) -> Result<Self, ProbeError> {
        let secure = match target.scheme() {
            "ftp" => false,
            "ftps" => true,
            other => return Err(ProbeError::UnsupportedScheme(other.to_string())),
        };
        let host = host_of(&target).ok_or(ProbeError::MissingHost)?;
        let port = target.port().unwrap_or(21);

        let (username, password) = match percent_decode(target.username()) {
            user if user.is_empty() => ("anonymous".to_string(), "anonymous@".to_string()),
            user => {
                let password =
                    target.password().map(percent_decode).ok_or(ProbeError::MissingCredential)?;
                (user, password)
            }
        };

        let path = match percent_decode(target.path()) {
            p if p.is_empty() => "/".to_string(),
            p => p,
        };
        let required = FileType::from_query(&target)?;

        Ok(Self { target, host, port, secure, username, password, path, required })
    }
}

struct Listing {
    target_addr: SocketAddr,
    lines: Vec<String>,
}

enum FtpFailure {
    Unknown(String),
    Failure(String),
    NotFound,
}

fn list(settings: &FtpSettings, timeout: Duration) -> Result<Listing, FtpFailure> {
    let addr = (settings.host.as_str(), settings.port)
        .to_socket_addrs()
        .map_err(|e| FtpFailure::Unknown(format!("failed to resolve {}: {e}", settings.host)))?
        .next()
        .ok_or_else(|| FtpFailure::Unknown(format!("no address for {}", settings.host)))?;

    let mut ftp = NativeTlsFtpStream::connect_timeout(addr, timeout)
        .map_err(|e| FtpFailure::Failure(format!("failed to connect: {e}")))?;
    let _ = ftp.get_ref().set_read_timeout(Some(timeout));

    if settings.secure {
        let connector = TlsConnector::new().map_err(|e| FtpFailure::Unknown(e.to_string()))?;
        ftp = ftp
            .into_secure(NativeTlsConnector::from(connector), &settings.host)
            .map_err(|e| FtpFailure::Failure(format!("TLS negotiation failed: {e}")))?;
    }

    ftp.login(&settings.username, &settings.password)
        .map_err(|e| FtpFailure::Failure(format!("login failed: {e}")))?;

    let lines = match ftp.list(Some(&settings.path)) {
        Ok(lines) => lines,
        Err(FtpError::UnexpectedResponse(resp)) if resp.status.code() == FILE_UNAVAILABLE => {
            let _ = ftp.quit();
            return Err(FtpFailure::NotFound);
        }
        Err(e) => return Err(FtpFailure::Failure(format!("failed to list: {e}"))),
    };
    let _ = ftp.quit();

    Ok(Listing { target_addr: addr, lines })
}

/// Decide between a single file and a directory from a LIST response.
fn classify_listing(path: &str, lines: &[String]) -> FileInfo {
    let entries: Vec<ListEntry> =
        lines.iter().filter_map(|line| ListEntry::from_str(line).ok()).collect();
    let basename = path.trim_end_matches('/').rsplit('/').next().unwrap_or_default();

    match entries.as_slice() {
        [entry]
            if !entry.is_directory() && (entry.name() == basename || entry.name() == path) =>
        {
            FileInfo {
                is_dir: false,
                mode: None,
                size: Some(entry.size() as u64),
                mtime: Some(system_time(entry.modified())),
            }
        }
        _ => FileInfo { is_dir: true, mode: None, size: None, mtime: None },
    }
}

/// Owned copy of what the blocking worker needs.
struct FtpSettings {
    host: String,
    port: u16,
    secure: bool,
    username: String,
    password: String,
    path: String,
}

#[async_trait]
impl Prober for FtpProbe {
    fn target(&self) -> &Url {
        &self.target
    }

    async fn probe(&self, ctx: &ProbeContext, reporter: &dyn Reporter) {
        let settings = FtpSettings {
            host: self.host.clone(),
            port: self.port,
            secure: self.secure,
            username: self.username.clone(),
            password: self.password.clone(),
            path: self.path.clone(),
        };
        let target = self.target.clone();
        let required = self.required;
        let timeout = ctx.narrow(FTP_TIMEOUT).remaining().unwrap_or(FTP_TIMEOUT);

        let work = blocking(&self.target, move || {
            let started = Instant::now();
            let result = list(&settings, timeout);
            let latency = started.elapsed();

            let record = match result {
                Ok(listing) => classify_listing(&settings.path, &listing.lines)
                    .into_record(target, required)
                    .with_extra("target_addr", listing.target_addr.to_string()),
                Err(FtpFailure::NotFound) => {
                    Record::new(target, Status::Failure).with_message("no such file or directory")
                }
                Err(FtpFailure::Failure(message)) => {
                    Record::new(target, Status::Failure).with_message(message)
                }
                Err(FtpFailure::Unknown(message)) => {
                    Record::new(target, Status::Unknown).with_message(message)
                }
            };
            record.with_latency(latency)
        });
        report_single(ctx, FTP_TIMEOUT, &self.target, reporter, work).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_anonymous_by_default() {
        let probe = FtpProbe::new(Url::parse("ftp://ftp.example.com/pub").unwrap()).unwrap();
        assert_eq!(probe.username, "anonymous");
        assert_eq!(probe.port, 21);
        assert_eq!(probe.path, "/pub");
        assert!(!probe.secure);

        let url = Url::parse("ftps://alice:pw@ftp.example.com:990").unwrap();
        let probe = FtpProbe::new(url).unwrap();
        assert_eq!(probe.username, "alice");
        assert_eq!(probe.password, "pw");
        assert_eq!(probe.path, "/");
        assert!(probe.secure);
    }

    #[test]
    fn test_user_without_password() {
        assert!(matches!(
            FtpProbe::new(Url::parse("ftp://alice@ftp.example.com/").unwrap()),
            Err(ProbeError::MissingCredential)
        ));
    }

    #[test]
    fn test_classify_listing() {
        let file = vec!["-rw-r--r-- 1 ftp ftp 1234 Jan 01 2024 readme.txt".to_string()];
        let info = classify_listing("/pub/readme.txt", &file);
        assert!(!info.is_dir);
        assert_eq!(info.size, Some(1234));

        let dir = vec![
            "-rw-r--r-- 1 ftp ftp 1234 Jan 01 2024 a.txt".to_string(),
            "drwxr-xr-x 2 ftp ftp 4096 Jan 01 2024 sub".to_string(),
        ];
        assert!(classify_listing("/pub", &dir).is_dir);
        assert!(classify_listing("/pub", &file).is_dir);
        assert!(classify_listing("/empty", &[]).is_dir);
    }
}
