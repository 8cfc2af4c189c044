use std::io;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::time::{self, Instant};
use tracing::trace;

use crate::types::{ProbeFailure, ProbeResult, ScanTarget};

/// Attempt one TCP connect to `target`, bounded by `timeout`.
///
/// A successful connection is dropped straight away. Any failure is folded
/// into the returned result; this function never errors.
pub async fn probe(target: ScanTarget, timeout: Duration) -> ProbeResult {
    let start = Instant::now();
    let outcome = time::timeout(timeout, TcpStream::connect(target.addr())).await;
    let elapsed_ms = start.elapsed().as_millis() as u64;

    let failure = match outcome {
        Ok(Ok(stream)) => {
            drop(stream);
            None
        }
        Ok(Err(e)) => Some(classify(&e)),
        Err(_elapsed) => Some(ProbeFailure::Timeout),
    };
    trace!(%target, open = failure.is_none(), elapsed_ms, "probe finished");

    ProbeResult {
        target,
        open: failure.is_none(),
        failure,
        elapsed_ms,
    }
}

fn classify(e: &io::Error) -> ProbeFailure {
    match e.kind() {
        io::ErrorKind::ConnectionRefused => ProbeFailure::Refused,
        io::ErrorKind::TimedOut => ProbeFailure::Timeout,
        io::ErrorKind::HostUnreachable
        | io::ErrorKind::NetworkUnreachable
        | io::ErrorKind::AddrNotAvailable => ProbeFailure::Unreachable(e.to_string()),
        _ => ProbeFailure::Other(e.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{IpAddr, Ipv4Addr};
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn listening_port_is_open() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let target = ScanTarget::new(IpAddr::V4(Ipv4Addr::LOCALHOST), port);

        let result = probe(target, Duration::from_secs(5)).await;
        assert!(result.open);
        assert_eq!(result.failure, None);
        assert_eq!(result.target, target);
    }

    #[tokio::test]
    async fn closed_port_is_refused() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);
        let target = ScanTarget::new(IpAddr::V4(Ipv4Addr::LOCALHOST), port);

        let result = probe(target, Duration::from_secs(5)).await;
        assert!(!result.open);
        assert_eq!(result.failure, Some(ProbeFailure::Refused));
    }

    #[test]
    fn io_errors_are_classified() {
        let refused = io::Error::from(io::ErrorKind::ConnectionRefused);
        let timed_out = io::Error::from(io::ErrorKind::TimedOut);
        let other = io::Error::new(io::ErrorKind::Other, "boom");
        assert_eq!(classify(&refused), ProbeFailure::Refused);
        assert_eq!(classify(&timed_out), ProbeFailure::Timeout);
        assert_eq!(classify(&other), ProbeFailure::Other("boom".into()));
    }
}
