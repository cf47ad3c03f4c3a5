//! Transport connection lease.
//!
//! Every socket holds exactly one [`Connection`]. The lease records the
//! socket in its [`Context`] and, for in-process binds, owns the endpoint
//! name. Dropping the lease (explicitly through `close` or implicitly when the
//! socket goes out of scope) releases both, whatever path the owner exits by.

use tracing::trace;

use crate::context::{Context, SocketKind};

/// Registration of one open socket with its context.
pub struct Connection {
    ctx: Context,
    id: u64,
    kind: SocketKind,
    endpoint: String,
    inproc_bind: Option<String>,
}

impl Connection {
    pub(crate) fn open(ctx: &Context, kind: SocketKind, endpoint: &str) -> Self {
        let id = ctx.register(kind, endpoint);
        trace!(id, ?kind, endpoint, "socket opened");
        Self {
            ctx: ctx.clone(),
            id,
            kind,
            endpoint: endpoint.to_string(),
            inproc_bind: None,
        }
    }

    /// Marks the lease as the owner of an in-process bind.
    pub(crate) fn own_inproc_bind(&mut self, name: &str) {
        self.inproc_bind = Some(name.to_string());
    }

    /// Context-unique id of this socket.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Socket kind.
    pub fn kind(&self) -> SocketKind {
        self.kind
    }

    /// Endpoint this socket is bound or connected to.
    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    /// Context the socket belongs to.
    pub fn context(&self) -> &Context {
        &self.ctx
    }

    /// Releases the socket now.
    pub fn close(self) {}
}

impl Drop for Connection {
    fn drop(&mut self) {
        if let Some(name) = self.inproc_bind.take() {
            self.ctx.unbind_inproc(&name);
        }
        self.ctx.release(self.id);
        trace!(id = self.id, endpoint = %self.endpoint, "socket released");
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("kind", &self.kind)
            .field("endpoint", &self.endpoint)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc;

    #[test]
    fn test_drop_releases_registration_and_bind() {
        let ctx = Context::new();
        let (tx, _rx) = mpsc::unbounded_channel();
        ctx.bind_inproc("svc", tx).unwrap();

        let mut conn = Connection::open(&ctx, SocketKind::Router, "inproc://svc");
        conn.own_inproc_bind("svc");
        assert_eq!(ctx.open_connections(), 1);
        assert!(ctx.is_bound("svc"));

        conn.close();
        assert_eq!(ctx.open_connections(), 0);
        assert!(!ctx.is_bound("svc"));
    }

    #[test]
    fn test_dealer_lease_has_no_bind() {
        let ctx = Context::new();
        {
            let conn = Connection::open(&ctx, SocketKind::Dealer, "tcp://127.0.0.1:1");
            assert_eq!(conn.kind(), SocketKind::Dealer);
            assert_eq!(conn.endpoint(), "tcp://127.0.0.1:1");
        }
        assert_eq!(ctx.open_connections(), 0);
    }
}
