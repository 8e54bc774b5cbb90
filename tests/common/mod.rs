//! Shared utilities for integration and load testing.
#![allow(dead_code)]

use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tcp_balancer::config::{BackendConfig, BalancerConfig};
use tcp_balancer::health::Probe;
use tcp_balancer::load_balancer::Endpoint;
use tcp_balancer::Service;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;

/// Start a backend that echoes every byte until the client closes.
pub async fn start_echo_backend() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        while let Ok((mut socket, _)) = listener.accept().await {
            tokio::spawn(async move {
                let (mut rd, mut wr) = socket.split();
                let _ = tokio::io::copy(&mut rd, &mut wr).await;
                let _ = wr.shutdown().await;
            });
        }
    });
    addr
}

/// Start a backend that writes its name to every client and closes.
pub async fn start_named_backend(name: &'static str) -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        while let Ok((mut socket, _)) = listener.accept().await {
            tokio::spawn(async move {
                let _ = socket.write_all(name.as_bytes()).await;
                let _ = socket.shutdown().await;
            });
        }
    });
    addr
}

/// A backend that reports what it sees.
pub struct RecordingBackend {
    pub addr: SocketAddr,
    pub accepted: Arc<AtomicUsize>,
    /// Every chunk read from any client, in arrival order.
    pub chunks: mpsc::UnboundedReceiver<Vec<u8>>,
}

/// Start a backend that records each read, and after the client half-closes
/// replies with `received <n>` before closing.
pub async fn start_recording_backend() -> RecordingBackend {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let accepted = Arc::new(AtomicUsize::new(0));
    let (tx, chunks) = mpsc::unbounded_channel();

    let count = accepted.clone();
    tokio::spawn(async move {
        while let Ok((mut socket, _)) = listener.accept().await {
            count.fetch_add(1, Ordering::SeqCst);
            let tx = tx.clone();
            tokio::spawn(async move {
                let mut total = 0;
                let mut buf = [0u8; 1024];
                loop {
                    match socket.read(&mut buf).await {
                        Ok(0) | Err(_) => break,
                        Ok(n) => {
                            total += n;
                            let _ = tx.send(buf[..n].to_vec());
                        }
                    }
                }
                let _ = socket.write_all(format!("received {total}").as_bytes()).await;
                let _ = socket.shutdown().await;
            });
        }
    });

    RecordingBackend {
        addr,
        accepted,
        chunks,
    }
}

/// Start a backend that reads in small slices with pauses, then sends back
/// everything it read once the client half-closes.
pub async fn start_slow_backend(slice: usize, pause: Duration) -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        while let Ok((mut socket, _)) = listener.accept().await {
            tokio::spawn(async move {
                let mut received = Vec::new();
                let mut buf = vec![0u8; slice];
                loop {
                    match socket.read(&mut buf).await {
                        Ok(0) | Err(_) => break,
                        Ok(n) => received.extend_from_slice(&buf[..n]),
                    }
                    tokio::time::sleep(pause).await;
                }
                let _ = socket.write_all(&received).await;
                let _ = socket.shutdown().await;
            });
        }
    });
    addr
}

/// An address nothing listens on.
pub async fn closed_port() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    listener.local_addr().unwrap()
}

/// A backend whose accept queue is full, so new connects never complete.
pub struct StalledBackend {
    pub addr: SocketAddr,
    _listener: socket2::Socket,
    _queued: Vec<std::net::TcpStream>,
}

/// Listen with a zero backlog and fill the queue without ever accepting.
pub fn start_stalled_backend() -> StalledBackend {
    use socket2::{Domain, Socket, Type};

    let listener = Socket::new(Domain::IPV4, Type::STREAM, None).unwrap();
    let bind: SocketAddr = "127.0.0.1:0".parse().unwrap();
    listener.bind(&bind.into()).unwrap();
    listener.listen(0).unwrap();
    let addr = listener.local_addr().unwrap().as_socket().unwrap();

    let mut queued = Vec::new();
    loop {
        match std::net::TcpStream::connect_timeout(&addr, Duration::from_millis(200)) {
            Ok(stream) => queued.push(stream),
            Err(_) => break,
        }
        assert!(queued.len() < 16, "accept queue never filled");
    }
    assert!(!queued.is_empty());

    StalledBackend {
        addr,
        _listener: listener,
        _queued: queued,
    }
}

/// Loopback config on an ephemeral port with a fast loop and no background probing.
pub fn test_config(backends: &[SocketAddr]) -> BalancerConfig {
    let mut config = BalancerConfig::default();
    config.listener.address = "127.0.0.1".into();
    config.listener.port = 0;
    config.timeouts.poll_interval_ms = 10;
    config.timeouts.connect_ms = 1000;
    config.timeouts.drain_secs = 5;
    config.health_check.enabled = false;
    config.backends = backends
        .iter()
        .map(|addr| BackendConfig::new(addr.to_string()))
        .collect();
    config
}

pub fn start_service(config: BalancerConfig) -> (Service, SocketAddr) {
    let mut service = Service::new(config).unwrap();
    let addr = service.start().unwrap();
    (service, addr)
}

/// Send `payload`, half-close, and read the reply until EOF.
pub async fn roundtrip(addr: SocketAddr, payload: &[u8]) -> Vec<u8> {
    let mut stream = TcpStream::connect(addr).await.unwrap();
    stream.write_all(payload).await.unwrap();
    stream.shutdown().await.unwrap();
    read_to_end(&mut stream).await
}

/// Read until EOF, treating a reset as EOF.
pub async fn read_to_end(stream: &mut TcpStream) -> Vec<u8> {
    let mut out = Vec::new();
    let mut buf = [0u8; 4096];
    loop {
        match tokio::time::timeout(Duration::from_secs(5), stream.read(&mut buf)).await {
            Ok(Ok(0)) | Ok(Err(_)) => return out,
            Ok(Ok(n)) => out.extend_from_slice(&buf[..n]),
            Err(_) => panic!("read timed out after {} bytes", out.len()),
        }
    }
}

/// Poll `cond` until it holds or `timeout` passes.
pub async fn wait_for(timeout: Duration, mut cond: impl FnMut() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    while tokio::time::Instant::now() < deadline {
        if cond() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    cond()
}

/// Probe whose verdict is flipped by the test.
#[derive(Debug, Default)]
pub struct SwitchProbe {
    down: std::sync::Mutex<Vec<Endpoint>>,
}

impl SwitchProbe {
    pub fn set_down(&self, endpoint: Endpoint) {
        self.down.lock().unwrap().push(endpoint);
    }

    pub fn set_up(&self, endpoint: Endpoint) {
        self.down.lock().unwrap().retain(|e| *e != endpoint);
    }
}

#[async_trait]
impl Probe for SwitchProbe {
    async fn probe(&self, endpoint: Endpoint) -> bool {
        !self.down.lock().unwrap().contains(&endpoint)
    }

    fn name(&self) -> &'static str {
        "switch"
    }
}
