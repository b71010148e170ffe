use std::io;
use std::path::PathBuf;
use std::time::{Duration, Instant, SystemTime};

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use url::Url;

use crate::address::query_value;
use crate::context::ProbeContext;
use crate::error::ProbeError;
use crate::probe::{Prober, report_single};
use crate::record::{Record, Status};
use crate::reporter::Reporter;

const STAT_TIMEOUT: Duration = Duration::from_secs(10);

/// Kind of filesystem entry an address may require with `?type=`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileType {
    File,
    Directory,
}

impl FileType {
    pub fn as_str(&self) -> &'static str {
        match self {
            FileType::File => "file",
            FileType::Directory => "directory",
        }
    }

    /// Parse the `type` query parameter of `target`.
    pub fn from_query(target: &Url) -> Result<Option<Self>, ProbeError> {
        match query_value(target, "type").as_deref() {
            None | Some("") => Ok(None),
            Some("file") => Ok(Some(FileType::File)),
            Some("directory") | Some("dir") => Ok(Some(FileType::Directory)),
            Some(other) => {
                Err(ProbeError::invalid("type", format!("{other:?} is neither file nor directory")))
            }
        }
    }
}

/// What a stat call learned about one path. Shared by local and SFTP checks.
#[derive(Debug, Clone, PartialEq)]
pub struct FileInfo {
    pub is_dir: bool,
    pub mode: Option<u32>,
    pub size: Option<u64>,
    pub mtime: Option<DateTime<Utc>>,
}

impl FileInfo {
    pub fn kind(&self) -> FileType {
        if self.is_dir { FileType::Directory } else { FileType::File }
    }

    /// Grade the entry against the required type and build the record.
    pub fn into_record(self, target: Url, required: Option<FileType>) -> Record {
        let kind = self.kind();
        let mut record = Record::new(target, Status::Healthy).with_extra("type", kind.as_str());

        if let Some(mode) = self.mode {
            record = record.with_extra("mode", format_mode(mode, self.is_dir));
        }
        if let Some(size) = self.size.filter(|_| !self.is_dir) {
            record = record.with_extra("size", size);
        }
        if let Some(mtime) = self.mtime {
            record = record.with_extra("mtime", mtime.to_rfc3339_opts(SecondsFormat::Secs, true));
        }

        match required {
            Some(want) if want != kind => record
                .with_status(Status::Failure)
                .with_message(format!("{} is not a {}", kind.as_str(), want.as_str())),
            _ => record.with_message(format!("{} exists", kind.as_str())),
        }
    }
}

/// `ls -l` style permission string such as `drwxr-xr-x`.
pub fn format_mode(mode: u32, is_dir: bool) -> String {
    const BITS: [(u32, char); 9] = [
        (0o400, 'r'),
        (0o200, 'w'),
        (0o100, 'x'),
        (0o040, 'r'),
        (0o020, 'w'),
        (0o010, 'x'),
        (0o004, 'r'),
        (0o002, 'w'),
        (0o001, 'x'),
    ];
    let mut text = String::with_capacity(10);
    text.push(if is_dir { 'd' } else { '-' });
    for (bit, c) in BITS {
        text.push(if mode & bit != 0 { c } else { '-' });
    }
    text
}

pub(crate) fn system_time(t: SystemTime) -> DateTime<Utc> {
    DateTime::<Utc>::from(t)
}

/// Record for a failed stat: missing entries are unhealthy, anything else
/// means the state could not be determined.
pub(crate) fn stat_error_record(target: Url, err: &io::Error) -> Record {
    match err.kind() {
        io::ErrorKind::NotFound => {
            Record::new(target, Status::Failure).with_message("no such file or directory")
        }
        io::ErrorKind::PermissionDenied => {
            Record::new(target, Status::Unknown).with_message("permission denied")
        }
        _ => Record::new(target, Status::Unknown).with_message(err.to_string()),
    }
}

/// Checks that a local path exists.
pub struct FileProbe {
    target: Url,
    path: PathBuf,
    required: Option<FileType>,
}

impl FileProbe {
    pub fn new(target: Url) -> Result<Self, ProbeError> {
        let path = target.to_file_path().map_err(|_| ProbeError::MissingFile)?;
        let required = FileType::from_query(&target)?;

        let mut target = target;
        target.set_fragment(None);

        Ok(Self { target, path, required })
    }

    async fn check(&self) -> Record {
        let started = Instant::now();
        let record = match tokio::fs::metadata(&self.path).await {
            Ok(meta) => {
                #[cfg(unix)]
                let mode = {
                    use std::os::unix::fs::PermissionsExt;
                    Some(meta.permissions().mode())
                };
                #[cfg(not(unix))]
                let mode = None;

                FileInfo {
                    is_dir: meta.is_dir(),
                    mode,
                    size: Some(meta.len()),
                    mtime: meta.modified().ok().map(system_time),
                }
                .into_record(self.target.clone(), self.required)
            }
            Err(e) => stat_error_record(self.target.clone(), &e),
        };
        record.with_latency(started.elapsed())
    }
}

#[async_trait]
impl Prober for FileProbe {
    fn target(&self) -> &Url {
        &self.target
    }

    async fn probe(&self, ctx: &ProbeContext, reporter: &dyn Reporter) {
        report_single(ctx, STAT_TIMEOUT, &self.target, reporter, self.check()).await;
    }
}
