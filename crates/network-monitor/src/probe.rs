//! Reachability probes.

use crate::{NetworkError, NetworkResult};
use async_trait::async_trait;
use std::time::{Duration, Instant};
use tokio::net::TcpStream;

/// A single lightweight reachability check.
#[async_trait]
pub trait Probe: Send + Sync {
    /// Human-readable target, used in logs.
    fn endpoint(&self) -> &str;

    /// Reach the endpoint once and report the round-trip latency.
    async fn probe(&self) -> NetworkResult<Duration>;
}

/// `HEAD` request against a URL. Any HTTP response counts as reachable.
pub struct HttpProbe {
    client: reqwest::Client,
    url: String,
}

impl HttpProbe {
    pub fn new(client: reqwest::Client, url: impl Into<String>) -> Self {
        Self {
            client,
            url: url.into(),
        }
    }
}

#[async_trait]
impl Probe for HttpProbe {
    fn endpoint(&self) -> &str {
        &self.url
    }

    async fn probe(&self) -> NetworkResult<Duration> {
        let started = Instant::now();
        self.client
            .head(&self.url)
            .header("Cache-Control", "no-cache")
            .send()
            .await?;
        Ok(started.elapsed())
    }
}

/// TCP connect to `host:port`.
pub struct TcpProbe {
    addr: String,
}

impl TcpProbe {
    pub fn new(addr: impl Into<String>) -> Self {
        Self { addr: addr.into() }
    }
}

#[async_trait]
impl Probe for TcpProbe {
    fn endpoint(&self) -> &str {
        &self.addr
    }

    async fn probe(&self) -> NetworkResult<Duration> {
        let started = Instant::now();
        TcpStream::connect(&self.addr)
            .await
            .map_err(|e| NetworkError::Unreachable {
                endpoint: self.addr.clone(),
                message: e.to_string(),
            })?;
        Ok(started.elapsed())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn tcp_probe_reaches_local_listener() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();

        let probe = TcpProbe::new(addr.clone());
        assert_eq!(probe.endpoint(), addr);
        assert!(probe.probe().await.is_ok());
    }

    #[tokio::test]
    async fn tcp_probe_reports_unreachable() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        drop(listener);

        let err = TcpProbe::new(addr).probe().await.unwrap_err();
        assert!(matches!(err, NetworkError::Unreachable { .. }));
    }
}
