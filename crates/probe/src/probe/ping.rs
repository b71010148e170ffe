//! ICMP echo checks over a process-wide client per address family.

use std::io;
use std::net::IpAddr;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use surge_ping::{Client, Config, ICMP, PingIdentifier, PingSequence};
use tracing::{debug, warn};
use url::Url;

use crate::address::host_of;
use crate::context::{Interruption, ProbeContext};
use crate::error::ProbeError;
use crate::probe::Prober;
use crate::probe::tcp::Family;
use crate::record::{Record, Status};
use crate::reporter::Reporter;
use crate::resource::{Lifecycle, ResourceError, ResourceManager};
use crate::settings::{self, PingSettings};

const PAYLOAD: [u8; 56] = [0; 56];

/// Running ICMP client together with the settings it was started with.
#[derive(Clone)]
pub struct IcmpHandle {
    client: Client,
    settings: PingSettings,
}

pub struct IcmpLifecycle {
    v6: bool,
    name: &'static str,
}

impl Lifecycle for IcmpLifecycle {
    type Output = IcmpHandle;

    fn name(&self) -> &str {
        self.name
    }

    fn start(&self) -> io::Result<IcmpHandle> {
        let settings = settings::current().ping.clone();
        let sock_type = if settings.privileged { socket2::Type::RAW } else { socket2::Type::DGRAM };
        let kind = if self.v6 { ICMP::V6 } else { ICMP::V4 };
        let config = Config::builder().kind(kind).sock_type_hint(sock_type).build();
        let client = Client::new(&config)?;
        debug!(resource = self.name, privileged = settings.privileged, "opened ICMP socket");
        Ok(IcmpHandle { client, settings })
    }

    fn stop(&self, handle: IcmpHandle) {
        drop(handle);
    }
}

pub static ICMP_V4: ResourceManager<IcmpLifecycle> =
    ResourceManager::new(IcmpLifecycle { v6: false, name: "ICMPv4 client" });

pub static ICMP_V6: ResourceManager<IcmpLifecycle> =
    ResourceManager::new(IcmpLifecycle { v6: true, name: "ICMPv6 client" });

fn manager_for(ip: &IpAddr) -> &'static ResourceManager<IcmpLifecycle> {
    if ip.is_ipv4() { &ICMP_V4 } else { &ICMP_V6 }
}

/// Clients a check against `host` may use.
fn candidate_managers(host: &str, family: Family) -> Vec<&'static ResourceManager<IcmpLifecycle>> {
    if let Ok(ip) = host.parse::<IpAddr>() {
        return vec![manager_for(&ip)];
    }
    match family {
        Family::V4 => vec![&ICMP_V4],
        Family::V6 => vec![&ICMP_V6],
        Family::Any => vec![&ICMP_V4, &ICMP_V6],
    }
}

/// Fails only when no candidate client can be opened.
fn check_permission(host: &str, family: Family) -> Result<(), ResourceError> {
    let mut first_error = None;
    for manager in candidate_managers(host, family) {
        match manager.test() {
            Ok(()) => return Ok(()),
            Err(e) => {
                debug!(host, error = %e, "ICMP client unavailable");
                first_error.get_or_insert(e);
            }
        }
    }
    first_error.map_or(Ok(()), Err)
}

/// Sends echo requests and grades the target by packet loss.
pub struct PingProbe {
    target: Url,
    host: String,
    family: Family,
}

impl PingProbe {
    pub fn new(target: Url) -> Result<Self, ProbeError> {
        let family = Family::from_suffix(target.scheme(), "ping")
            .ok_or_else(|| ProbeError::UnsupportedScheme(target.scheme().to_string()))?;

        let host = if target.cannot_be_a_base() {
            target.path().trim_matches(['[', ']']).to_string()
        } else {
            host_of(&target).unwrap_or_default()
        };
        if host.is_empty() {
            return Err(ProbeError::MissingHost);
        }

        // Sockets need a reactor; without one the permission check waits for
        // the first probe.
        if tokio::runtime::Handle::try_current().is_ok() {
            check_permission(&host, family)?;
        }

        Ok(Self { target, host, family })
    }

    async fn resolve(&self) -> Result<IpAddr, String> {
        if let Ok(ip) = self.host.parse::<IpAddr>() {
            return Ok(ip);
        }
        let addrs = crate::probe::tcp::resolve(&self.host, 0, self.family).await?;
        let preferred = addrs.iter().find(|a| a.is_ipv4()).or_else(|| addrs.first());
        preferred.map(|a| a.ip()).ok_or_else(|| format!("no suitable address for {}", self.host))
    }
}

#[derive(Debug, Default)]
struct PingStats {
    sent: u32,
    rtts: Vec<Duration>,
}

impl PingStats {
    fn into_record(self, target: Url, ip: IpAddr) -> Record {
        let recv = self.rtts.len() as u32;
        let ms = |d: Duration| (d.as_secs_f64() * 1_000_000.0).round() / 1_000.0;
        let min = self.rtts.iter().min().copied().unwrap_or_default();
        let max = self.rtts.iter().max().copied().unwrap_or_default();
        let avg = if self.rtts.is_empty() {
            Duration::ZERO
        } else {
            self.rtts.iter().sum::<Duration>() / recv
        };

        let (status, message) = if self.sent > 0 && recv == self.sent {
            (Status::Healthy, "all packets came back".to_string())
        } else if recv == 0 {
            (Status::Failure, "all packets have been lost".to_string())
        } else {
            let loss = 100.0 * f64::from(self.sent - recv) / f64::from(self.sent);
            (Status::Degrade, format!("{loss:.1}% packet loss"))
        };

        Record::new(target, status)
            .with_latency(avg)
            .with_message(message)
            .with_extra("target_addr", ip.to_string())
            .with_extra("packets_sent", self.sent)
            .with_extra("packets_recv", recv)
            .with_extra("rtt_min", ms(min))
            .with_extra("rtt_avg", ms(avg))
            .with_extra("rtt_max", ms(max))
    }
}

#[async_trait]
impl Prober for PingProbe {
    fn target(&self) -> &Url {
        &self.target
    }

    async fn probe(&self, ctx: &ProbeContext, reporter: &dyn Reporter) {
        let started = Instant::now();
        let unknown = |message: String| {
            Record::new(self.target.clone(), Status::Unknown)
                .with_latency(started.elapsed())
                .with_message(message)
        };

        let ip = match ctx.run(self.resolve()).await {
            Ok(Ok(ip)) => ip,
            Ok(Err(message)) => {
                return reporter.report(&self.target, ctx.classify(unknown(message)));
            }
            Err(i) => {
                let record = i.into_record(self.target.clone(), started.elapsed());
                return reporter.report(&self.target, record);
            }
        };

        let guard = match manager_for(&ip).acquire_guard() {
            Ok(guard) => guard,
            Err(e) => {
                warn!(error = %e, "ICMP client unavailable");
                return reporter.report(&self.target, ctx.classify(unknown(e.to_string())));
            }
        };
        let handle = guard.get();
        let settings = &handle.settings;
        let inner = ctx.narrow(settings.timeout);

        let mut pinger = handle.client.pinger(ip, PingIdentifier(rand::random())).await;
        pinger.timeout(settings.timeout);

        let mut stats = PingStats::default();
        let mut interrupted = None;
        for seq in 0..settings.packets {
            if seq > 0 && inner.run(tokio::time::sleep(settings.period)).await.is_err() {
                break;
            }
            stats.sent += 1;
            match inner.run(pinger.ping(PingSequence(seq as u16), &PAYLOAD)).await {
                Ok(Ok((_, rtt))) => stats.rtts.push(rtt),
                Ok(Err(e)) => debug!(ip = %ip, seq, error = %e, "echo request lost"),
                Err(i) => {
                    interrupted = Some(i);
                    break;
                }
            }
        }
        drop(guard);

        let record = match (interrupted, ctx.interruption()) {
            (_, Some(outer)) => outer.into_record(self.target.clone(), started.elapsed()),
            (Some(Interruption::Cancelled), None) => {
                Interruption::Cancelled.into_record(self.target.clone(), started.elapsed())
            }
            _ => stats.into_record(self.target.clone(), ip),
        };
        reporter.report(&self.target, record);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn target() -> Url {
        Url::parse("ping:example.com").unwrap()
    }

    #[test]
    fn test_grading_by_loss() {
        let ip: IpAddr = "127.0.0.1".parse().unwrap();
        let ms = Duration::from_millis;

        let all = PingStats { sent: 3, rtts: vec![ms(1), ms(2), ms(3)] }.into_record(target(), ip);
        assert_eq!(all.status, Status::Healthy);
        assert_eq!(all.latency, ms(2));
        assert_eq!(all.extra["rtt_min"], serde_json::json!(1.0));
        assert_eq!(all.extra["rtt_max"], serde_json::json!(3.0));

        let some = PingStats { sent: 4, rtts: vec![ms(1)] }.into_record(target(), ip);
        assert_eq!(some.status, Status::Degrade);
        assert_eq!(some.message, "75.0% packet loss");
        assert_eq!(some.extra["packets_recv"], serde_json::json!(1));

        let none = PingStats { sent: 3, rtts: vec![] }.into_record(target(), ip);
        assert_eq!(none.status, Status::Failure);
        assert_eq!(none.extra["packets_sent"], serde_json::json!(3));
    }

    #[test]
    fn test_permission_checked_on_matching_family() {
        let names = |host: &str, family: Family| -> Vec<String> {
            candidate_managers(host, family).iter().map(|m| m.name().to_string()).collect()
        };

        assert_eq!(names("2001:db8::1", Family::Any), vec!["ICMPv6 client"]);
        assert_eq!(names("192.0.2.1", Family::Any), vec!["ICMPv4 client"]);
        assert_eq!(names("example.com", Family::V6), vec!["ICMPv6 client"]);
        assert_eq!(names("example.com", Family::Any), vec!["ICMPv4 client", "ICMPv6 client"]);
    }

    #[test]
    fn test_requires_host() {
        assert!(matches!(
            PingProbe::new(Url::parse("ping:").unwrap()),
            Err(ProbeError::MissingHost)
        ));
        assert!(matches!(
            PingProbe::new(Url::parse("ping-fast:example.com").unwrap()),
            Err(ProbeError::UnsupportedScheme(_))
        ));
    }
}
