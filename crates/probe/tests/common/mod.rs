#![allow(dead_code)]

use std::fs;
use std::net::SocketAddr;
#[cfg(unix)]
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;
use std::time::Duration;

use probe::settings::{self, Settings};
use probe::{MemoryReporter, ProbeContext, Record, new_prober};
use tempfile::TempDir;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream, UdpSocket};

/// Small HTTP/1.1 server answering a fixed set of paths:
///
/// - `/ok` 200
/// - `/created` 201
/// - `/fail` 500
/// - `/redirect` 302 to `/ok`
/// - `/loop` 302 to itself
/// - `/slow` 200 after five seconds
///
/// Anything else is a 404.
pub struct MockServer {
    pub addr: SocketAddr,
}

impl MockServer {
    pub async fn start() -> anyhow::Result<Self> {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;

        tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                tokio::spawn(handle(stream));
            }
        });

        Ok(Self { addr })
    }

    pub fn url(&self, path: &str) -> String {
        format!("http://{}{}", self.addr, path)
    }
}

async fn handle(mut stream: TcpStream) {
    let mut buf = vec![0u8; 4096];
    let mut read = 0;
    loop {
        match stream.read(&mut buf[read..]).await {
            Ok(0) | Err(_) => return,
            Ok(n) => read += n,
        }
        if buf[..read].windows(4).any(|w| w == b"\r\n\r\n") || read == buf.len() {
            break;
        }
    }

    let request = String::from_utf8_lossy(&buf[..read]);
    let target = request.split_whitespace().nth(1).unwrap_or("/");
    let path = target.split('?').next().unwrap_or(target);

    let (status, location) = match path {
        "/ok" => ("200 OK", None),
        "/created" => ("201 Created", None),
        "/fail" => ("500 Internal Server Error", None),
        "/redirect" => ("302 Found", Some("/ok")),
        "/loop" => ("302 Found", Some("/loop")),
        "/slow" => {
            tokio::time::sleep(Duration::from_secs(5)).await;
            ("200 OK", None)
        }
        _ => ("404 Not Found", None),
    };

    let body = "hello";
    let mut response = format!(
        "HTTP/1.1 {status}\r\nContent-Length: {}\r\nConnection: close\r\n",
        body.len()
    );
    if let Some(location) = location {
        response.push_str(&format!("Location: {location}\r\n"));
    }
    response.push_str("\r\n");
    response.push_str(body);

    let _ = stream.write_all(response.as_bytes()).await;
    let _ = stream.shutdown().await;
}

/// Authoritative-looking DNS responder on UDP.
///
/// Names starting with `nx` get NXDOMAIN, names starting with `empty` get an
/// answer without records, anything else gets an A record for `192.0.2.1`.
pub struct MockDns {
    pub addr: SocketAddr,
}

impl MockDns {
    pub async fn start() -> anyhow::Result<Self> {
        let socket = UdpSocket::bind("127.0.0.1:0").await?;
        let addr = socket.local_addr()?;

        tokio::spawn(async move {
            let mut buf = [0u8; 512];
            while let Ok((len, peer)) = socket.recv_from(&mut buf).await {
                if let Some(reply) = dns_reply(&buf[..len]) {
                    let _ = socket.send_to(&reply, peer).await;
                }
            }
        });

        Ok(Self { addr })
    }
}

fn dns_reply(query: &[u8]) -> Option<Vec<u8>> {
    let mut pos = 12;
    let mut first_label = Vec::new();
    loop {
        let len = usize::from(*query.get(pos)?);
        pos += 1;
        if len == 0 {
            break;
        }
        if first_label.is_empty() {
            first_label = query.get(pos..pos + len)?.to_ascii_lowercase();
        }
        pos += len;
    }
    let question_end = pos + 4;
    let question = query.get(12..question_end)?;

    let (rcode, answer) = if first_label.starts_with(b"nx") {
        (3, false)
    } else if first_label.starts_with(b"empty") {
        (0, false)
    } else {
        (0, true)
    };

    let mut reply = Vec::with_capacity(64);
    reply.extend_from_slice(&query[..2]);
    reply.push(0x84 | (query[2] & 0x01));
    reply.push(0x80 | rcode);
    reply.extend_from_slice(&[0, 1, 0, u8::from(answer), 0, 0, 0, 0]);
    reply.extend_from_slice(question);
    if answer {
        reply.extend_from_slice(&[0xc0, 0x0c, 0, 1, 0, 1, 0, 0, 0, 60, 0, 4, 192, 0, 2, 1]);
    }
    Some(reply)
}

/// Write a `/bin/sh` script and make it executable.
#[cfg(unix)]
pub fn write_script(dir: &Path, name: &str, body: &str) -> anyhow::Result<PathBuf> {
    let path = dir.join(name);
    fs::write(&path, format!("#!/bin/sh\n{body}\n"))?;
    fs::set_permissions(&path, fs::Permissions::from_mode(0o755))?;
    Ok(path)
}

/// Plugin executables shared by every test in one binary.
///
/// Created once and installed as the plugin directory before any test
/// spawns a plugin.
#[cfg(unix)]
pub fn plugin_dir() -> &'static Path {
    static DIR: OnceLock<TempDir> = OnceLock::new();

    DIR.get_or_init(|| {
        let dir = tempfile::tempdir().expect("create plugin dir");
        let path = dir.path();

        write_script(
            path,
            "fixture-probe",
            r#"echo "{\"time\":\"2024-01-02T03:04:05Z\",\"status\":\"HEALTHY\",\"latency\":1.5,\"target\":\"$1\",\"message\":\"generic\"}""#,
        )
        .expect("write fixture-probe");

        write_script(
            path,
            "fixture-special-probe",
            r#"echo "{\"time\":\"2024-01-02T03:04:05Z\",\"status\":\"DEGRADE\",\"latency\":2,\"target\":\"$1\",\"message\":\"special\"}""#,
        )
        .expect("write fixture-special-probe");

        write_script(
            path,
            "garbled-probe",
            r#"echo "{\"time\":\"2024-01-02T03:04:05Z\",\"status\":\"HEALTHY\",\"latency\":1,\"target\":\"$1\",\"message\":\"ok\"}"
echo "this is not a record""#,
        )
        .expect("write garbled-probe");

        write_script(path, "junk-probe", "echo 'no records here'").expect("write junk-probe");

        write_script(
            path,
            "overflow-probe",
            r#"echo "{\"time\":\"2024-01-02T03:04:05Z\",\"status\":\"HEALTHY\",\"latency\":1e30,\"target\":\"$1\"}""#,
        )
        .expect("write overflow-probe");

        write_script(path, "crash-probe", "echo 'something broke' >&2\nexit 3")
            .expect("write crash-probe");

        write_script(path, "quiet-probe", "exit 0").expect("write quiet-probe");

        write_script(path, "listing-probe", r#"cat "$(dirname "$0")/listing.txt""#)
            .expect("write listing-probe");

        write_script(
            path,
            "notify-alert",
            r#"echo "{\"time\":\"2024-01-02T03:04:05Z\",\"status\":\"HEALTHY\",\"latency\":1,\"target\":\"$1\",\"message\":\"$ayd_status $ayd_target\"}""#,
        )
        .expect("write notify-alert");

        settings::install(Settings { plugin_dirs: vec![path.to_path_buf()], ..Default::default() });
        dir
    })
    .path()
}

/// Build a prober for `raw`, run it once and return what it reported.
pub async fn probe_once(raw: &str) -> anyhow::Result<Vec<Record>> {
    let prober = new_prober(raw).await?;
    let reporter = MemoryReporter::new();
    prober.probe(&ProbeContext::new(), &reporter).await;
    Ok(reporter.records())
}

/// Run `raw` once and return its only record.
pub async fn probe_single(raw: &str) -> anyhow::Result<Record> {
    let mut records = probe_once(raw).await?;
    anyhow::ensure!(records.len() == 1, "expected one record, got {records:?}");
    Ok(records.remove(0))
}
