//! Message sockets.
//!
//! Two socket kinds cover everything the multiplexer needs:
//!
//! - [`DealerSocket`] connects to one endpoint and exchanges whole messages
//!   with the peer bound there.
//! - [`RouterSocket`] binds an endpoint and accepts any number of peers. Each
//!   inbound message is prefixed with a 4-byte peer identity frame; outbound
//!   messages must start with one. Sending to an identity that is not
//!   attached fails with [`TransportError::HostUnreachable`] instead of being
//!   dropped silently.
//!
//! Endpoints are `tcp://host:port` or `inproc://name`. In-process endpoints
//! live in the [`Context`] registry and move messages over bounded channels
//! without copying; TCP endpoints use the framing in [`crate::message`].

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use dashmap::DashMap;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tracing::{debug, trace, warn};

use crate::connection::Connection;
use crate::context::{Context, SocketKind};
use crate::error::{Result, TransportError};
use crate::message::{read_message, write_message, Message};
use crate::routing::HostResolver;

/// Per-pipe queue depth used when none is given.
pub const DEFAULT_PIPE_CAPACITY: usize = 1000;

/// Identity the router assigns to an attached peer.
pub type PeerId = u32;

/// Size of a peer identity frame.
pub const PEER_ID_SIZE: usize = 4;

/// Encodes a peer identity frame.
pub fn peer_identity(peer: PeerId) -> Bytes {
    Bytes::copy_from_slice(&peer.to_be_bytes())
}

/// Decodes a peer identity frame.
pub fn decode_peer_id(frame: &[u8]) -> Result<PeerId> {
    let bytes: [u8; PEER_ID_SIZE] = frame.try_into().map_err(|_| TransportError::InvalidFrame {
        reason: format!("peer identity must be {} bytes, got {}", PEER_ID_SIZE, frame.len()),
    })?;
    Ok(u32::from_be_bytes(bytes))
}

/// A parsed socket endpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Endpoint {
    /// `tcp://host:port`, stored as `host:port`.
    Tcp(String),
    /// `inproc://name`, stored as `name`.
    Inproc(String),
}

impl Endpoint {
    /// Parses an endpoint address.
    pub fn parse(addr: &str) -> Result<Self> {
        let invalid = |reason: &str| TransportError::InvalidEndpoint {
            addr: addr.to_string(),
            reason: reason.to_string(),
        };
        if let Some(authority) = addr.strip_prefix("tcp://") {
            match authority.rsplit_once(':') {
                Some((host, port)) if !host.is_empty() && port.parse::<u16>().is_ok() => {
                    Ok(Endpoint::Tcp(authority.to_string()))
                }
                _ => Err(invalid("expected host:port")),
            }
        } else if let Some(name) = addr.strip_prefix("inproc://") {
            if name.is_empty() {
                Err(invalid("empty inproc name"))
            } else {
                Ok(Endpoint::Inproc(name.to_string()))
            }
        } else {
            Err(invalid("unsupported scheme"))
        }
    }
}

impl std::fmt::Display for Endpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Endpoint::Tcp(authority) => write!(f, "tcp://{}", authority),
            Endpoint::Inproc(name) => write!(f, "inproc://{}", name),
        }
    }
}

/// Bidirectional message channel between two sockets.
pub(crate) struct Pipe {
    tx: mpsc::Sender<Message>,
    rx: mpsc::Receiver<Message>,
    io: Option<JoinSet<()>>,
}

impl Pipe {
    /// Two cross-wired in-process ends.
    pub(crate) fn pair(capacity: usize) -> (Pipe, Pipe) {
        let (a_tx, b_rx) = mpsc::channel(capacity);
        let (b_tx, a_rx) = mpsc::channel(capacity);
        (
            Pipe { tx: a_tx, rx: a_rx, io: None },
            Pipe { tx: b_tx, rx: b_rx, io: None },
        )
    }

    /// Wraps a TCP stream in reader and writer tasks.
    fn tcp(stream: TcpStream, capacity: usize) -> Pipe {
        if let Err(e) = stream.set_nodelay(true) {
            debug!(error = %e, "failed to set TCP_NODELAY");
        }
        let (mut read, mut write) = stream.into_split();
        let (out_tx, mut out_rx) = mpsc::channel::<Message>(capacity);
        let (in_tx, in_rx) = mpsc::channel::<Message>(capacity);
        let mut io = JoinSet::new();

        io.spawn(async move {
            while let Some(message) = out_rx.recv().await {
                if let Err(e) = write_message(&mut write, &message).await {
                    debug!(error = %e, "tcp pipe write failed");
                    break;
                }
            }
        });

        io.spawn(async move {
            loop {
                match read_message(&mut read).await {
                    Ok(Some(message)) => {
                        if in_tx.send(message).await.is_err() {
                            break;
                        }
                    }
                    Ok(None) => break,
                    Err(e) => {
                        debug!(error = %e, "tcp pipe read failed");
                        break;
                    }
                }
            }
        });

        Pipe {
            tx: out_tx,
            rx: in_rx,
            io: Some(io),
        }
    }

    fn into_parts(self) -> (mpsc::Sender<Message>, mpsc::Receiver<Message>, Option<JoinSet<()>>) {
        (self.tx, self.rx, self.io)
    }
}

/// A socket connected to a single peer.
pub struct DealerSocket {
    tx: mpsc::Sender<Message>,
    rx: mpsc::Receiver<Message>,
    _io: Option<JoinSet<()>>,
    conn: Connection,
}

impl DealerSocket {
    /// Connects to `addr`, resolving TCP hosts through `resolver`.
    ///
    /// Resolution failures surface as [`TransportError::HostResolution`] so
    /// callers can tell them apart from a refused connection.
    pub async fn connect(
        ctx: &Context,
        addr: &str,
        resolver: &dyn HostResolver,
        capacity: usize,
    ) -> Result<Self> {
        match Endpoint::parse(addr)? {
            Endpoint::Inproc(_) => Self::connect_inproc(ctx, addr, capacity),
            Endpoint::Tcp(authority) => {
                let addrs = resolver
                    .resolve(&authority)
                    .await
                    .map_err(|e| TransportError::HostResolution {
                        host: authority.clone(),
                        reason: e.to_string(),
                    })?;
                if addrs.is_empty() {
                    return Err(TransportError::HostResolution {
                        host: authority,
                        reason: "no addresses".to_string(),
                    });
                }
                let stream = TcpStream::connect(&addrs[..]).await.map_err(|e| {
                    if e.kind() == std::io::ErrorKind::ConnectionRefused {
                        TransportError::ConnectionRefused {
                            addr: addr.to_string(),
                        }
                    } else {
                        TransportError::IoError(e)
                    }
                })?;
                let (tx, rx, io) = Pipe::tcp(stream, capacity).into_parts();
                debug!(addr, "dealer connected");
                Ok(Self {
                    tx,
                    rx,
                    _io: io,
                    conn: Connection::open(ctx, SocketKind::Dealer, addr),
                })
            }
        }
    }

    /// Connects to an in-process endpoint. Does not need a runtime.
    pub fn connect_inproc(ctx: &Context, addr: &str, capacity: usize) -> Result<Self> {
        let name = match Endpoint::parse(addr)? {
            Endpoint::Inproc(name) => name,
            Endpoint::Tcp(_) => {
                return Err(TransportError::InvalidEndpoint {
                    addr: addr.to_string(),
                    reason: "not an inproc endpoint".to_string(),
                })
            }
        };
        let (local, remote) = Pipe::pair(capacity);
        ctx.connect_inproc(&name, remote)?;
        let (tx, rx, io) = local.into_parts();
        Ok(Self {
            tx,
            rx,
            _io: io,
            conn: Connection::open(ctx, SocketKind::Dealer, addr),
        })
    }

    /// Sends a message, waiting for queue space.
    pub async fn send(&self, message: Message) -> Result<()> {
        self.tx
            .send(message)
            .await
            .map_err(|_| TransportError::ConnectionReset)
    }

    /// Sends a message without waiting.
    pub fn try_send(&self, message: Message) -> Result<()> {
        self.tx.try_send(message).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => TransportError::QueueFull {
                endpoint: self.conn.endpoint().to_string(),
            },
            mpsc::error::TrySendError::Closed(_) => TransportError::ConnectionReset,
        })
    }

    pub(crate) fn sender(&self) -> mpsc::Sender<Message> {
        self.tx.clone()
    }

    /// Receives the next message; fails once the peer has gone away.
    pub async fn recv(&mut self) -> Result<Message> {
        self.rx.recv().await.ok_or(TransportError::ConnectionReset)
    }

    /// Takes a message that has already arrived, if any.
    pub fn try_recv(&mut self) -> Option<Message> {
        self.rx.try_recv().ok()
    }

    /// Endpoint this socket connected to.
    pub fn endpoint(&self) -> &str {
        self.conn.endpoint()
    }

    /// Closes the socket.
    pub fn close(self) {}
}

enum Acceptor {
    Inproc(mpsc::UnboundedReceiver<Pipe>),
    Tcp(TcpListener, usize),
}

impl Acceptor {
    async fn accept(&mut self) -> Option<Pipe> {
        match self {
            Acceptor::Inproc(rx) => rx.recv().await,
            Acceptor::Tcp(listener, capacity) => loop {
                match listener.accept().await {
                    Ok((stream, peer)) => {
                        trace!(%peer, "tcp peer accepted");
                        return Some(Pipe::tcp(stream, *capacity));
                    }
                    Err(e) => {
                        warn!(error = %e, "accept failed");
                        tokio::time::sleep(Duration::from_millis(10)).await;
                    }
                }
            },
        }
    }
}

type PeerTable = Arc<DashMap<PeerId, mpsc::Sender<Message>>>;

/// Sending half of a router; owns the bind and the peer table.
pub struct RouterSender {
    peers: PeerTable,
    _tasks: JoinSet<()>,
    conn: Connection,
}

impl RouterSender {
    fn route(&self, mut message: Message) -> Result<(PeerId, mpsc::Sender<Message>, Message)> {
        let identity = message.pop_front().ok_or_else(|| TransportError::InvalidFrame {
            reason: "missing peer identity".to_string(),
        })?;
        let peer = decode_peer_id(&identity)?;
        if message.is_empty() {
            return Err(TransportError::InvalidFrame {
                reason: "message has no body".to_string(),
            });
        }
        let tx = self
            .peers
            .get(&peer)
            .map(|entry| entry.value().clone())
            .ok_or(TransportError::HostUnreachable { peer })?;
        Ok((peer, tx, message))
    }

    /// Routes a message to the peer named by its first frame, waiting for
    /// queue space.
    pub async fn send(&self, message: Message) -> Result<()> {
        let (peer, tx, message) = self.route(message)?;
        if tx.send(message).await.is_err() {
            self.peers.remove(&peer);
            return Err(TransportError::HostUnreachable { peer });
        }
        Ok(())
    }

    /// Routes a message without waiting. A peer whose queue is full fails
    /// with [`TransportError::QueueFull`].
    pub fn try_send(&self, message: Message) -> Result<()> {
        let (peer, tx, message) = self.route(message)?;
        match tx.try_send(message) {
            Ok(()) => Ok(()),
            Err(mpsc::error::TrySendError::Full(_)) => Err(TransportError::QueueFull {
                endpoint: format!("{}#{}", self.conn.endpoint(), peer),
            }),
            Err(mpsc::error::TrySendError::Closed(_)) => {
                self.peers.remove(&peer);
                Err(TransportError::HostUnreachable { peer })
            }
        }
    }

    /// Number of attached peers.
    pub fn peer_count(&self) -> usize {
        self.peers.len()
    }

    /// Bound endpoint. For `tcp://host:0` this carries the assigned port.
    pub fn endpoint(&self) -> &str {
        self.conn.endpoint()
    }
}

/// Receiving half of a router.
pub struct RouterReceiver {
    inbound: mpsc::Receiver<Message>,
}

impl RouterReceiver {
    /// Next message, prefixed with the sender's identity frame. `None` once
    /// the sending half has been dropped.
    pub async fn recv(&mut self) -> Option<Message> {
        self.inbound.recv().await
    }
}

/// A bound socket that routes by peer identity.
pub struct RouterSocket {
    sender: RouterSender,
    receiver: RouterReceiver,
}

impl RouterSocket {
    /// Binds `addr` with the default pipe capacity.
    pub async fn bind(ctx: &Context, addr: &str) -> Result<Self> {
        Self::bind_with_capacity(ctx, addr, DEFAULT_PIPE_CAPACITY).await
    }

    /// Binds `addr`. `tcp://*:port` binds all interfaces.
    pub async fn bind_with_capacity(ctx: &Context, addr: &str, capacity: usize) -> Result<Self> {
        let (acceptor, conn) = match Endpoint::parse(addr)? {
            Endpoint::Inproc(name) => {
                let (tx, rx) = mpsc::unbounded_channel();
                ctx.bind_inproc(&name, tx)?;
                let mut conn = Connection::open(ctx, SocketKind::Router, addr);
                conn.own_inproc_bind(&name);
                (Acceptor::Inproc(rx), conn)
            }
            Endpoint::Tcp(authority) => {
                let authority = match authority.strip_prefix("*:") {
                    Some(port) => format!("0.0.0.0:{}", port),
                    None => authority,
                };
                let listener = TcpListener::bind(&authority).await.map_err(|e| {
                    if e.kind() == std::io::ErrorKind::AddrInUse {
                        TransportError::EndpointInUse {
                            addr: addr.to_string(),
                        }
                    } else {
                        TransportError::IoError(e)
                    }
                })?;
                let endpoint = format!("tcp://{}", listener.local_addr()?);
                let conn = Connection::open(ctx, SocketKind::Router, &endpoint);
                (Acceptor::Tcp(listener, capacity), conn)
            }
        };

        let peers: PeerTable = Arc::new(DashMap::new());
        let (inbound_tx, inbound_rx) = mpsc::channel(capacity);
        let mut tasks = JoinSet::new();
        tasks.spawn(accept_loop(
            acceptor,
            peers.clone(),
            inbound_tx,
            conn.endpoint().to_string(),
        ));
        debug!(endpoint = conn.endpoint(), "router bound");

        Ok(Self {
            sender: RouterSender {
                peers,
                _tasks: tasks,
                conn,
            },
            receiver: RouterReceiver {
                inbound: inbound_rx,
            },
        })
    }

    /// See [`RouterSender::send`].
    pub async fn send(&self, message: Message) -> Result<()> {
        self.sender.send(message).await
    }

    /// See [`RouterSender::try_send`].
    pub fn try_send(&self, message: Message) -> Result<()> {
        self.sender.try_send(message)
    }

    /// See [`RouterReceiver::recv`].
    pub async fn recv(&mut self) -> Option<Message> {
        self.receiver.recv().await
    }

    /// Number of attached peers.
    pub fn peer_count(&self) -> usize {
        self.sender.peer_count()
    }

    /// Bound endpoint.
    pub fn endpoint(&self) -> &str {
        self.sender.endpoint()
    }

    /// Splits into independently owned halves.
    pub fn split(self) -> (RouterSender, RouterReceiver) {
        (self.sender, self.receiver)
    }

    /// Unbinds and releases the socket.
    pub fn close(self) {}
}

async fn accept_loop(
    mut acceptor: Acceptor,
    peers: PeerTable,
    inbound: mpsc::Sender<Message>,
    endpoint: String,
) {
    let mut readers = JoinSet::new();
    let mut next_peer: PeerId = 1;
    loop {
        tokio::select! {
            pipe = acceptor.accept() => {
                let Some(pipe) = pipe else { break };
                let peer = next_peer;
                next_peer = next_peer.wrapping_add(1).max(1);
                let (tx, rx, io) = pipe.into_parts();
                peers.insert(peer, tx);
                trace!(endpoint = %endpoint, peer, "router peer attached");
                readers.spawn(read_peer(peer, rx, io, inbound.clone(), peers.clone()));
            }
            Some(_) = readers.join_next(), if !readers.is_empty() => {}
        }
    }
    while readers.join_next().await.is_some() {}
}

async fn read_peer(
    peer: PeerId,
    mut rx: mpsc::Receiver<Message>,
    _io: Option<JoinSet<()>>,
    inbound: mpsc::Sender<Message>,
    peers: PeerTable,
) {
    while let Some(mut message) = rx.recv().await {
        message.push_front(peer_identity(peer));
        if inbound.send(message).await.is_err() {
            break;
        }
    }
    peers.remove(&peer);
    trace!(peer, "router peer detached");
}
