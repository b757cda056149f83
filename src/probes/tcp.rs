//! TCP connection probe implementation.

use std::io::ErrorKind;
use std::net::SocketAddr;
use std::time::{Duration, Instant};

use tokio::net::TcpStream;

/// What a single connect attempt observed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "lowercase")]
pub enum PortState {
    Open,
    /// The host answered with a reset.
    Closed,
    /// No answer within the timeout, or the network refused to route.
    Filtered,
}

impl PortState {
    pub fn as_str(&self) -> &'static str {
        match self {
            PortState::Open => "open",
            PortState::Closed => "closed",
            PortState::Filtered => "filtered",
        }
    }
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct TcpResult {
    pub addr: SocketAddr,
    pub state: PortState,
    pub latency_ms: Option<f64>,
}

impl TcpResult {
    /// A closed port still proves the host is alive.
    pub fn host_alive(&self) -> bool {
        matches!(self.state, PortState::Open | PortState::Closed)
    }
}

/// Run a TCP connection probe to the specified address.
pub async fn probe(addr: SocketAddr, timeout: Duration) -> TcpResult {
    let start = Instant::now();
    let outcome = tokio::time::timeout(timeout, TcpStream::connect(addr)).await;
    let elapsed_ms = start.elapsed().as_secs_f64() * 1000.0;

    let (state, latency_ms) = match outcome {
        Ok(Ok(_stream)) => (PortState::Open, Some(elapsed_ms)),
        Ok(Err(e)) if e.kind() == ErrorKind::ConnectionRefused => {
            (PortState::Closed, Some(elapsed_ms))
        }
        Ok(Err(e)) => {
            tracing::trace!(%addr, error = %e, "TCP connect failed");
            (PortState::Filtered, None)
        }
        Err(_) => (PortState::Filtered, None),
    };

    TcpResult {
        addr,
        state,
        latency_ms,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_open_port() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let result = probe(addr, Duration::from_secs(2)).await;
        assert_eq!(result.state, PortState::Open);
        assert!(result.latency_ms.is_some());
        assert!(result.host_alive());
    }

    #[tokio::test]
    async fn test_closed_port() {
        // Bind then drop to get a port nothing listens on
        let addr = {
            let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
            listener.local_addr().unwrap()
        };

        let result = probe(addr, Duration::from_secs(2)).await;
        assert_eq!(result.state, PortState::Closed);
        assert!(result.host_alive());
    }
}
