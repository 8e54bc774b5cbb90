//! Probe implementations.
//!
//! A probe answers one question about one endpoint: is it up right now. The
//! monitor owns scheduling, timeouts and debounce; probes stay stateless.

use std::fmt::Debug;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio::net::TcpStream;

use crate::config::{HealthCheckConfig, ProbeKind};
use crate::load_balancer::Endpoint;

/// Why a single probe counted as a failure.
#[derive(Debug, Error)]
pub enum ProbeError {
    #[error("probe timed out after {0:?}")]
    Timeout(Duration),

    #[error("connect failed: {0}")]
    Connect(#[from] std::io::Error),

    #[error("request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("unexpected status {0}")]
    Status(u16),
}

/// Capability to check one endpoint.
#[async_trait]
pub trait Probe: Send + Sync + Debug {
    /// True when the endpoint is considered up.
    async fn probe(&self, endpoint: Endpoint) -> bool;

    fn name(&self) -> &'static str;
}

/// Up when a TCP handshake completes within the timeout.
#[derive(Debug, Clone)]
pub struct TcpConnectProbe {
    timeout: Duration,
}

impl TcpConnectProbe {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }

    pub async fn check(&self, endpoint: Endpoint) -> Result<(), ProbeError> {
        let stream = tokio::time::timeout(self.timeout, TcpStream::connect(endpoint.socket_addr()))
            .await
            .map_err(|_| ProbeError::Timeout(self.timeout))??;
        drop(stream);
        Ok(())
    }
}

#[async_trait]
impl Probe for TcpConnectProbe {
    async fn probe(&self, endpoint: Endpoint) -> bool {
        match self.check(endpoint).await {
            Ok(()) => true,
            Err(e) => {
                tracing::debug!(backend = %endpoint, error = %e, "TCP probe failed");
                false
            }
        }
    }

    fn name(&self) -> &'static str {
        "tcp"
    }
}

/// Up when `GET http://{endpoint}{path}` answers with a 2xx status.
#[derive(Debug, Clone)]
pub struct HttpProbe {
    client: reqwest::Client,
    path: String,
}

impl HttpProbe {
    pub fn new(path: impl Into<String>, timeout: Duration) -> Result<Self, ProbeError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .user_agent("tcp-balancer-health-check")
            .no_proxy()
            .build()?;
        Ok(Self {
            client,
            path: path.into(),
        })
    }

    fn url(&self, endpoint: Endpoint) -> String {
        let path = self.path.trim_start_matches('/');
        format!("http://{}/{}", endpoint, path)
    }

    pub async fn check(&self, endpoint: Endpoint) -> Result<(), ProbeError> {
        let response = self.client.get(self.url(endpoint)).send().await?;
        let status = response.status();
        if status.is_success() {
            Ok(())
        } else {
            Err(ProbeError::Status(status.as_u16()))
        }
    }
}

#[async_trait]
impl Probe for HttpProbe {
    async fn probe(&self, endpoint: Endpoint) -> bool {
        match self.check(endpoint).await {
            Ok(()) => true,
            Err(e) => {
                tracing::debug!(backend = %endpoint, error = %e, "HTTP probe failed");
                false
            }
        }
    }

    fn name(&self) -> &'static str {
        "http"
    }
}

/// Build the probe selected in configuration.
pub fn from_config(config: &HealthCheckConfig) -> Result<Arc<dyn Probe>, ProbeError> {
    Ok(match config.kind {
        ProbeKind::Tcp => Arc::new(TcpConnectProbe::new(config.timeout())),
        ProbeKind::Http => Arc::new(HttpProbe::new(config.path.clone(), config.timeout())?),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn tcp_probe_sees_listener() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let endpoint = Endpoint::from(listener.local_addr().unwrap());
        let probe = TcpConnectProbe::new(Duration::from_millis(500));
        assert!(probe.probe(endpoint).await);
    }

    #[tokio::test]
    async fn tcp_probe_fails_on_closed_port() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let endpoint = Endpoint::from(listener.local_addr().unwrap());
        drop(listener);
        let probe = TcpConnectProbe::new(Duration::from_millis(500));
        assert!(!probe.probe(endpoint).await);
    }

    #[tokio::test]
    async fn http_probe_checks_status() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let endpoint = Endpoint::from(listener.local_addr().unwrap());
        tokio::spawn(async move {
            let mut first = true;
            while let Ok((mut socket, _)) = listener.accept().await {
                let mut request = [0u8; 1024];
                let _ = socket.read(&mut request).await;
                let status = if first { "200 OK" } else { "503 Service Unavailable" };
                first = false;
                let response =
                    format!("HTTP/1.1 {status}\r\nContent-Length: 0\r\nConnection: close\r\n\r\n");
                let _ = socket.write_all(response.as_bytes()).await;
                let _ = socket.shutdown().await;
            }
        });

        let probe = HttpProbe::new("/health", Duration::from_secs(2)).unwrap();
        assert!(probe.check(endpoint).await.is_ok());
        assert!(matches!(probe.check(endpoint).await, Err(ProbeError::Status(503))));
    }

    #[test]
    fn http_url_normalises_path() {
        let probe = HttpProbe::new("health", Duration::from_secs(1)).unwrap();
        assert_eq!(
            probe.url("10.0.0.1:80".parse().unwrap()),
            "http://10.0.0.1:80/health"
        );
    }
}
