//! Shared socket context.
//!
//! A [`Context`] is the scope every socket is opened in. It owns the
//! in-process endpoint registry and tracks which sockets are still open, so
//! a leaked socket is visible to its owner. Contexts are explicit values
//! passed to whoever opens sockets; there is no process-wide default.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::mpsc;

use crate::error::{Result, TransportError};
use crate::socket::Pipe;

/// Kind of socket registered with a context.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SocketKind {
    /// Connecting socket with a single peer.
    Dealer,
    /// Binding socket addressing peers by identity.
    Router,
}

/// Details recorded for each open socket.
#[derive(Debug, Clone)]
pub struct ConnectionInfo {
    /// Socket kind.
    pub kind: SocketKind,
    /// Endpoint the socket was bound or connected to.
    pub endpoint: String,
}

#[derive(Default)]
struct ContextInner {
    inproc: DashMap<String, mpsc::UnboundedSender<Pipe>>,
    connections: DashMap<u64, ConnectionInfo>,
    next_id: AtomicU64,
}

/// Cheaply cloneable handle to a shared socket scope.
#[derive(Clone, Default)]
pub struct Context {
    inner: Arc<ContextInner>,
}

impl Context {
    /// Creates an empty context.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of sockets opened in this context and not yet released.
    pub fn open_connections(&self) -> usize {
        self.inner.connections.len()
    }

    /// Snapshot of all open sockets.
    pub fn connections(&self) -> Vec<ConnectionInfo> {
        self.inner
            .connections
            .iter()
            .map(|entry| entry.value().clone())
            .collect()
    }

    /// True if an in-process endpoint is currently bound under `name`.
    pub fn is_bound(&self, name: &str) -> bool {
        self.inner.inproc.contains_key(name)
    }

    pub(crate) fn register(&self, kind: SocketKind, endpoint: &str) -> u64 {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        self.inner.connections.insert(
            id,
            ConnectionInfo {
                kind,
                endpoint: endpoint.to_string(),
            },
        );
        id
    }

    pub(crate) fn release(&self, id: u64) {
        self.inner.connections.remove(&id);
    }

    pub(crate) fn bind_inproc(&self, name: &str, acceptor: mpsc::UnboundedSender<Pipe>) -> Result<()> {
        match self.inner.inproc.entry(name.to_string()) {
            dashmap::mapref::entry::Entry::Occupied(_) => Err(TransportError::EndpointInUse {
                addr: format!("inproc://{name}"),
            }),
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                slot.insert(acceptor);
                Ok(())
            }
        }
    }

    pub(crate) fn unbind_inproc(&self, name: &str) {
        self.inner.inproc.remove(name);
    }

    pub(crate) fn connect_inproc(&self, name: &str, pipe: Pipe) -> Result<()> {
        let acceptor = self
            .inner
            .inproc
            .get(name)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| TransportError::ConnectionRefused {
                addr: format!("inproc://{name}"),
            })?;
        acceptor
            .send(pipe)
            .map_err(|_| TransportError::ConnectionRefused {
                addr: format!("inproc://{name}"),
            })
    }
}

impl std::fmt::Debug for Context {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Context")
            .field("open_connections", &self.open_connections())
            .field("inproc_endpoints", &self.inner.inproc.len())
            .finish()
    }
}
