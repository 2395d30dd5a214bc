use serde::Serialize;
use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::OnceLock;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};
use thiserror::Error;
use tokio::net::UdpSocket;
use tokio::task::JoinSet;
use tokio::time;
use tracing::warn;

use super::{ProbeDetail, ProbeKind, ProbeResult};

const DNS_PORT: u16 = 53;

#[derive(Debug, Clone, Serialize)]
pub struct ResolverTiming {
    pub server: String,
    pub succeeded: bool,
    pub latency_ms: Option<f64>,
    pub answers: u16,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct DnsDetail {
    pub hostname: String,
    pub resolvers: Vec<ResolverTiming>,
}

#[derive(Debug, Error, PartialEq)]
pub enum DnsQueryError {
    #[error("invalid resolver address {0}")]
    BadServer(String),
    #[error("hostname label too long")]
    BadHostname,
    #[error("socket error: {0}")]
    Socket(String),
    #[error("timeout")]
    Timeout,
    #[error("truncated response")]
    Truncated,
    #[error("response is not an answer")]
    NotAResponse,
    #[error("resolver returned {0}")]
    Rcode(&'static str),
}

/// Times one A query per resolver, all in parallel. The numeric value is
/// the mean latency of the resolvers that answered.
pub async fn run(hostname: &str, resolvers: &[String], query_timeout: Duration) -> ProbeResult {
    let mut tasks = JoinSet::new();
    for (index, server) in resolvers.iter().cloned().enumerate() {
        let hostname = hostname.to_string();
        tasks.spawn(async move {
            let outcome = query_resolver(&server, &hostname, query_timeout).await;
            (index, server, outcome)
        });
    }

    let mut timings = Vec::with_capacity(resolvers.len());
    while let Some(joined) = tasks.join_next().await {
        let (index, server, outcome) = match joined {
            Ok(done) => done,
            Err(err) => {
                warn!(error = %err, "dns task failed");
                continue;
            }
        };
        let timing = match outcome {
            Ok((latency, answers)) => ResolverTiming {
                server,
                succeeded: true,
                latency_ms: Some(latency.as_secs_f64() * 1000.0),
                answers,
                error: None,
            },
            Err(err) => {
                warn!(server = %server, error = %err, "dns query failed");
                ResolverTiming {
                    server,
                    succeeded: false,
                    latency_ms: None,
                    answers: 0,
                    error: Some(err.to_string()),
                }
            }
        };
        timings.push((index, timing));
    }
    timings.sort_by_key(|(index, _)| *index);

    let detail = DnsDetail {
        hostname: hostname.to_string(),
        resolvers: timings.into_iter().map(|(_, timing)| timing).collect(),
    };
    let latencies: Vec<f64> = detail.resolvers.iter().filter_map(|r| r.latency_ms).collect();
    if latencies.is_empty() {
        return ProbeResult::failure_with_detail(
            ProbeKind::DnsLatency,
            None,
            "no resolver answered",
            ProbeDetail::DnsLatency(detail),
        );
    }

    let mean = latencies.iter().sum::<f64>() / latencies.len() as f64;
    ProbeResult::success(
        ProbeKind::DnsLatency,
        None,
        Some(mean),
        ProbeDetail::DnsLatency(detail),
    )
}

async fn query_resolver(
    server: &str,
    hostname: &str,
    timeout: Duration,
) -> Result<(Duration, u16), DnsQueryError> {
    let ip: IpAddr = server
        .parse()
        .map_err(|_| DnsQueryError::BadServer(server.to_string()))?;
    exchange(SocketAddr::new(ip, DNS_PORT), hostname, timeout).await
}

async fn exchange(
    addr: SocketAddr,
    hostname: &str,
    timeout: Duration,
) -> Result<(Duration, u16), DnsQueryError> {
    let ip = addr.ip();
    let bind = if ip.is_ipv4() { "0.0.0.0:0" } else { "[::]:0" };
    let socket = UdpSocket::bind(bind)
        .await
        .map_err(|err| DnsQueryError::Socket(err.to_string()))?;

    let tx_id = transaction_id();
    let query = build_dns_query(tx_id, hostname)?;

    let start = Instant::now();
    socket
        .send_to(&query, addr)
        .await
        .map_err(|err| DnsQueryError::Socket(err.to_string()))?;

    let reply = async {
        let mut buf = [0_u8; 1232];
        loop {
            let (n, from) = socket
                .recv_from(&mut buf)
                .await
                .map_err(|err| DnsQueryError::Socket(err.to_string()))?;
            // Ignore strays from other peers or stale transactions.
            if from.ip() != ip || n < 2 || u16::from_be_bytes([buf[0], buf[1]]) != tx_id {
                continue;
            }
            return parse_response_header(&buf[..n], tx_id);
        }
    };

    let answers = time::timeout(timeout, reply)
        .await
        .map_err(|_| DnsQueryError::Timeout)??;
    Ok((start.elapsed(), answers))
}

static NEXT_TX_ID: AtomicU16 = AtomicU16::new(0);
static TX_ID_SEED: OnceLock<u16> = OnceLock::new();

/// Distinct for 65536 consecutive queries in the process. The clock only
/// picks where the sequence starts.
fn transaction_id() -> u16 {
    let seed = *TX_ID_SEED.get_or_init(|| {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.subsec_nanos() as u16)
            .unwrap_or(0)
    });
    seed.wrapping_add(NEXT_TX_ID.fetch_add(1, Ordering::Relaxed))
}

fn encode_dns_name(hostname: &str) -> Result<Vec<u8>, DnsQueryError> {
    let mut out = Vec::with_capacity(hostname.len() + 2);
    for label in hostname.trim_end_matches('.').split('.') {
        if label.len() > 63 {
            return Err(DnsQueryError::BadHostname);
        }
        out.push(label.len() as u8);
        out.extend_from_slice(label.as_bytes());
    }
    out.push(0);
    Ok(out)
}

/// Minimal recursive A query.
pub fn build_dns_query(tx_id: u16, hostname: &str) -> Result<Vec<u8>, DnsQueryError> {
    let mut pkt = Vec::with_capacity(32 + hostname.len());
    pkt.extend_from_slice(&tx_id.to_be_bytes());
    pkt.extend_from_slice(&[0x01, 0x00]); // RD
    pkt.extend_from_slice(&[0x00, 0x01]); // QDCOUNT
    pkt.extend_from_slice(&[0x00, 0x00, 0x00, 0x00, 0x00, 0x00]);
    pkt.extend_from_slice(&encode_dns_name(hostname)?);
    pkt.extend_from_slice(&[0x00, 0x01]); // A
    pkt.extend_from_slice(&[0x00, 0x01]); // IN
    Ok(pkt)
}

/// Validates the header of a reply and returns its answer count.
pub fn parse_response_header(buf: &[u8], tx_id: u16) -> Result<u16, DnsQueryError> {
    if buf.len() < 12 {
        return Err(DnsQueryError::Truncated);
    }
    if u16::from_be_bytes([buf[0], buf[1]]) != tx_id || buf[2] & 0x80 == 0 {
        return Err(DnsQueryError::NotAResponse);
    }
    let rcode = match buf[3] & 0x0F {
        0 => None,
        1 => Some("FORMERR"),
        2 => Some("SERVFAIL"),
        3 => Some("NXDOMAIN"),
        4 => Some("NOTIMP"),
        5 => Some("REFUSED"),
        _ => Some("an error rcode"),
    };
    if let Some(name) = rcode {
        return Err(DnsQueryError::Rcode(name));
    }
    Ok(u16::from_be_bytes([buf[6], buf[7]]))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn reply(tx_id: u16, flags_lo: u8, answers: u16) -> Vec<u8> {
        let mut buf = tx_id.to_be_bytes().to_vec();
        buf.extend_from_slice(&[0x81, flags_lo, 0x00, 0x01]);
        buf.extend_from_slice(&answers.to_be_bytes());
        buf.extend_from_slice(&[0, 0, 0, 0]);
        buf
    }

    #[test]
    fn transaction_ids_differ_between_queries() {
        let ids: std::collections::HashSet<u16> = (0..512).map(|_| transaction_id()).collect();
        assert_eq!(ids.len(), 512);
    }

    #[test]
    fn query_encodes_labels() {
        let pkt = build_dns_query(0xBEEF, "google.com").expect("query");
        assert_eq!(&pkt[..2], &[0xBE, 0xEF]);
        assert_eq!(&pkt[12..24], b"\x06google\x03com\x00");
        assert_eq!(&pkt[24..], &[0, 1, 0, 1]);
    }

    #[test]
    fn overlong_label_is_rejected() {
        let name = format!("{}.com", "a".repeat(64));
        assert_eq!(build_dns_query(1, &name), Err(DnsQueryError::BadHostname));
    }

    #[test]
    fn header_parsing_checks_id_and_rcode() {
        assert_eq!(parse_response_header(&reply(7, 0x80, 2), 7), Ok(2));
        assert_eq!(
            parse_response_header(&reply(7, 0x83, 0), 7),
            Err(DnsQueryError::Rcode("NXDOMAIN"))
        );
        assert_eq!(
            parse_response_header(&reply(8, 0x80, 1), 7),
            Err(DnsQueryError::NotAResponse)
        );
        assert_eq!(parse_response_header(&[0, 7], 7), Err(DnsQueryError::Truncated));
    }

    #[tokio::test]
    async fn bad_resolver_fails_alone() {
        let result = run(
            "example.com",
            &["not-an-ip".to_string()],
            Duration::from_millis(200),
        )
        .await;
        assert!(!result.succeeded);
        assert_eq!(result.numeric_value, None);
        let ProbeDetail::DnsLatency(detail) = &result.detail else {
            panic!("expected dns detail");
        };
        assert_eq!(detail.resolvers.len(), 1);
        assert!(!detail.resolvers[0].succeeded);
        assert_eq!(
            detail.resolvers[0].error.as_deref(),
            Some("invalid resolver address not-an-ip")
        );
    }

    #[tokio::test]
    async fn local_resolver_is_timed() {
        let server = UdpSocket::bind("127.0.0.1:0").await.expect("bind");
        let port = server.local_addr().expect("addr").port();
        tokio::spawn(async move {
            let mut buf = [0_u8; 512];
            if let Ok((n, peer)) = server.recv_from(&mut buf).await {
                let mut answer = buf[..n].to_vec();
                answer[2] |= 0x80;
                answer[7] = 1;
                let _ = server.send_to(&answer, peer).await;
            }
        });

        let (latency, answers) = exchange(
            SocketAddr::new("127.0.0.1".parse().expect("ip"), port),
            "example.com",
            Duration::from_secs(2),
        )
        .await
        .expect("answer");
        assert_eq!(answers, 1);
        assert!(latency < Duration::from_secs(2));
    }
}
