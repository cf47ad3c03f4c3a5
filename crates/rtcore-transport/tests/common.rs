//! Shared fixtures for multiplexer integration tests.

#![allow(dead_code)]

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use rtcore_transport::socket::peer_identity;
use rtcore_transport::{
    Context, DnsResolver, HostResolver, Message, Multiplexer, MultiplexerConfig, RouterSocket,
    UuidRouting,
};

/// Stand-in for the upstream cluster transport.
pub struct TestBackend {
    pub socket: RouterSocket,
    pub rt: tokio::runtime::Runtime,
}

impl TestBackend {
    pub fn bind_tcp(ctx: &Context) -> Self {
        let rt = tokio::runtime::Runtime::new().unwrap();
        let socket = rt
            .block_on(RouterSocket::bind(ctx, "tcp://127.0.0.1:0"))
            .unwrap();
        Self { socket, rt }
    }

    pub fn endpoint(&self) -> String {
        self.socket.endpoint().to_string()
    }

    /// Identity of the first peer to attach, which is the multiplexer.
    pub fn mux_identity(&self) -> bytes::Bytes {
        assert!(wait_until(Duration::from_secs(5), || self.socket.peer_count() == 1));
        peer_identity(1)
    }

    pub fn send(&self, message: Message) {
        self.rt.block_on(self.socket.send(message)).unwrap();
    }

    pub fn recv(&mut self, timeout: Duration) -> Option<Message> {
        let socket = &mut self.socket;
        self.rt
            .block_on(async { tokio::time::timeout(timeout, socket.recv()).await.ok().flatten() })
    }
}

/// Resolver that fails a fixed number of times before resolving.
pub struct FlakyResolver {
    failures: u32,
    calls: AtomicU32,
}

impl FlakyResolver {
    pub fn failing(failures: u32) -> Arc<Self> {
        Arc::new(Self {
            failures,
            calls: AtomicU32::new(0),
        })
    }

    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl HostResolver for FlakyResolver {
    async fn resolve(&self, authority: &str) -> std::io::Result<Vec<std::net::SocketAddr>> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst);
        if call < self.failures {
            return Err(std::io::Error::new(
                std::io::ErrorKind::NotFound,
                format!("unknown host {}", authority),
            ));
        }
        DnsResolver.resolve(authority).await
    }
}

pub fn fast_config(connect_addr: String) -> MultiplexerConfig {
    MultiplexerConfig {
        connect_addr,
        resolve_retry_attempts: 60,
        resolve_retry_interval_ms: 20,
        poll_timeout_ms: 50,
        ..Default::default()
    }
}

pub fn multiplexer(ctx: &Context, backend: &TestBackend) -> Multiplexer {
    Multiplexer::new(
        ctx.clone(),
        Arc::new(UuidRouting::default()),
        fast_config(backend.endpoint()),
    )
}

/// Strips the `inproc://` scheme from an address.
pub fn inproc_name(address: &str) -> &str {
    address.trim_start_matches("inproc://")
}

pub fn wait_until(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(5));
    }
    condition()
}
