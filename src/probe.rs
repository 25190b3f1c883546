use crate::model::{parse_host_port, CheckKind, Target};
use once_cell::sync::Lazy;
use std::net::IpAddr;
use tokio::net::TcpStream;
use tokio::time::{Duration, Instant};
use trust_dns_resolver::TokioAsyncResolver;

/// Uniform outcome of a single probe. Failures are data, never errors.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProbeOutcome {
    pub ok: bool,
    pub latency_ms: u64,
    pub code: u16,
    pub message: String,
}

impl ProbeOutcome {
    fn failed(started: Instant, message: impl Into<String>) -> Self {
        Self {
            ok: false,
            latency_ms: elapsed_ms(started),
            code: 0,
            message: message.into(),
        }
    }
}

fn elapsed_ms(started: Instant) -> u64 {
    started.elapsed().as_millis() as u64
}

/// Runs the check for a target. Implementations must not share mutable state
/// between calls.
#[async_trait::async_trait]
pub trait Prober: Send + Sync {
    async fn run(&self, target: &Target) -> ProbeOutcome;
}

/// Probes over the real network, picking the strategy from the target kind.
#[derive(Debug, Default, Clone, Copy)]
pub struct NetProber;

#[async_trait::async_trait]
impl Prober for NetProber {
    async fn run(&self, target: &Target) -> ProbeOutcome {
        let timeout = Duration::from_millis(target.timeout_ms);
        match target.kind {
            CheckKind::Http => http_probe(&target.endpoint, timeout, target.expected_code).await,
            CheckKind::Tcp => tcp_probe(&target.endpoint, timeout).await,
            CheckKind::Icmp => icmp_probe(&target.endpoint, timeout).await,
        }
    }
}

static HTTP_CLIENT: Lazy<reqwest::Client> = Lazy::new(|| {
    reqwest::Client::builder()
        .redirect(reqwest::redirect::Policy::limited(5))
        .danger_accept_invalid_certs(true) // Allow self-signed certs for monitoring flexibility
        .user_agent(concat!("upwatch/", env!("CARGO_PKG_VERSION")))
        .build()
        .unwrap_or_default()
});

/// GET the URL. Any HTTP response counts as a completed probe; `ok` follows
/// `expected_code` when set, otherwise the `[200, 400)` range.
pub async fn http_probe(url: &str, timeout: Duration, expected_code: Option<u16>) -> ProbeOutcome {
    let started = Instant::now();
    match HTTP_CLIENT.get(url).timeout(timeout).send().await {
        Ok(res) => {
            let status = res.status();
            let code = status.as_u16();
            let ok = match expected_code {
                Some(expected) => code == expected,
                None => (200..400).contains(&code),
            };
            let message = status
                .canonical_reason()
                .map(str::to_string)
                .unwrap_or_else(|| format!("HTTP {}", code));
            ProbeOutcome {
                ok,
                latency_ms: elapsed_ms(started),
                code,
                message,
            }
        }
        Err(e) if e.is_timeout() => ProbeOutcome::failed(started, "timeout"),
        Err(e) => ProbeOutcome::failed(started, e.to_string()),
    }
}

/// Opens and immediately closes a TCP connection to `host:port`.
pub async fn tcp_probe(endpoint: &str, timeout: Duration) -> ProbeOutcome {
    let started = Instant::now();
    let (host, port) = match parse_host_port(endpoint) {
        Ok(hp) => hp,
        Err(reason) => {
            return ProbeOutcome::failed(started, format!("invalid endpoint '{}': {}", endpoint, reason))
        }
    };

    // On timeout the connect future is dropped, which closes the half-open socket.
    match tokio::time::timeout(timeout, TcpStream::connect((host.as_str(), port))).await {
        Ok(Ok(stream)) => {
            let latency_ms = elapsed_ms(started);
            // RST instead of FIN so frequent probes don't pile up TIME_WAIT sockets.
            if let Err(e) = socket2::SockRef::from(&stream).set_linger(Some(Duration::ZERO)) {
                tracing::debug!("set_linger failed for {}: {}", endpoint, e);
            }
            drop(stream);
            ProbeOutcome {
                ok: true,
                latency_ms,
                code: 1,
                message: "connected".to_string(),
            }
        }
        Ok(Err(e)) => ProbeOutcome::failed(started, e.to_string()),
        Err(_) => ProbeOutcome::failed(started, "timeout"),
    }
}

/// Whole seconds, rounded up, that the ICMP echo waits for a reply.
pub fn icmp_timeout_secs(timeout: Duration) -> u64 {
    let ms = timeout.as_millis() as u64;
    ms.div_ceil(1000).max(1)
}

/// Sends one echo request. Raw ICMP needs privileges; where the socket cannot
/// be opened the probe reports a labelled failure.
pub async fn icmp_probe(host: &str, timeout: Duration) -> ProbeOutcome {
    let started = Instant::now();

    let ip = match resolve_host(host, timeout).await {
        Ok(ip) => ip,
        Err(message) => return ProbeOutcome::failed(started, message),
    };

    let config = match ip {
        IpAddr::V4(_) => surge_ping::Config::default(),
        IpAddr::V6(_) => surge_ping::Config::builder().kind(surge_ping::ICMP::V6).build(),
    };
    let client = match surge_ping::Client::new(&config) {
        Ok(client) => client,
        Err(e) => return ProbeOutcome::failed(started, format!("ICMP unavailable: {}", e)),
    };

    let identifier = surge_ping::PingIdentifier(uuid::Uuid::new_v4().as_u128() as u16);
    let mut pinger = client.pinger(ip, identifier).await;
    pinger.timeout(Duration::from_secs(icmp_timeout_secs(timeout)));

    let payload = [0; 8];
    match pinger.ping(surge_ping::PingSequence(0), &payload).await {
        Ok((_, rtt)) => ProbeOutcome {
            ok: true,
            latency_ms: rtt.as_millis() as u64,
            code: 0,
            message: "reply".to_string(),
        },
        Err(surge_ping::SurgeError::Timeout { .. }) => ProbeOutcome::failed(started, "timeout"),
        Err(e) => ProbeOutcome::failed(started, e.to_string()),
    }
}

/// Resolution shares the probe's timeout; the resolver's own retries would
/// otherwise stretch a short check to many seconds.
async fn resolve_host(host: &str, timeout: Duration) -> Result<IpAddr, String> {
    if let Ok(ip) = host.parse::<IpAddr>() {
        return Ok(ip);
    }

    let resolver = TokioAsyncResolver::tokio_from_system_conf()
        .map_err(|e| format!("Resolver init failed: {}", e))?;
    let ips = tokio::time::timeout(timeout, resolver.lookup_ip(host))
        .await
        .map_err(|_| "DNS timeout".to_string())?
        .map_err(|e| format!("DNS error: {}", e))?;
    ips.iter()
        .next()
        .ok_or_else(|| "DNS resolution failed".to_string())
}
