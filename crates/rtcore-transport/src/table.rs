//! Routing table and frontend poller.
//!
//! The table is owned by the multiplexer's poll loop and only ever touched
//! from that one task: every method takes `&mut self` or `&self` and nothing
//! is shared, so there is no lock.

use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::task::{AbortHandle, JoinSet};
use tracing::{debug, trace};

use crate::codec::{RoutingAction, RoutingCommand};
use crate::context::Context;
use crate::error::Result;
use crate::message::Message;
use crate::routing::{InstanceId, Routing};
use crate::socket::{RouterReceiver, RouterSender, RouterSocket};

const POLL_QUEUE_CAPACITY: usize = 1024;

/// Fans messages from many receivers into one queue tagged by index.
pub struct Poller {
    tx: mpsc::Sender<(usize, Message)>,
    rx: mpsc::Receiver<(usize, Message)>,
    tasks: JoinSet<()>,
    handles: HashMap<usize, AbortHandle>,
    next_index: usize,
}

impl Poller {
    /// Creates an empty poller.
    pub fn new() -> Self {
        let (tx, rx) = mpsc::channel(POLL_QUEUE_CAPACITY);
        Self {
            tx,
            rx,
            tasks: JoinSet::new(),
            handles: HashMap::new(),
            next_index: 0,
        }
    }

    /// Starts polling `source`; returns its index.
    pub fn register(&mut self, mut source: RouterReceiver) -> usize {
        while self.tasks.try_join_next().is_some() {}

        let index = self.next_index;
        self.next_index += 1;
        let tx = self.tx.clone();
        let handle = self.tasks.spawn(async move {
            while let Some(message) = source.recv().await {
                if tx.send((index, message)).await.is_err() {
                    break;
                }
            }
        });
        self.handles.insert(index, handle);
        index
    }

    /// Stops polling the source at `index`.
    pub fn unregister(&mut self, index: usize) -> bool {
        match self.handles.remove(&index) {
            Some(handle) => {
                handle.abort();
                true
            }
            None => false,
        }
    }

    /// Number of registered sources.
    pub fn len(&self) -> usize {
        self.handles.len()
    }

    /// True when nothing is registered.
    pub fn is_empty(&self) -> bool {
        self.handles.is_empty()
    }

    /// Waits for the next message from any source.
    pub async fn poll(&mut self) -> Option<(usize, Message)> {
        self.rx.recv().await
    }
}

impl Default for Poller {
    fn default() -> Self {
        Self::new()
    }
}

/// One bound destination.
pub struct RoutingEntry {
    /// Destination id.
    pub destination: InstanceId,
    /// Sending half of the frontend socket.
    pub socket: RouterSender,
    /// Index of the receiving half in the poller.
    pub poller_index: usize,
}

/// Per-destination frontend sockets keyed by destination id.
pub struct RoutingTable {
    ctx: Context,
    routing: Arc<dyn Routing>,
    entries: HashMap<InstanceId, RoutingEntry>,
    destinations: HashMap<usize, InstanceId>,
    poller: Poller,
}

impl RoutingTable {
    /// Creates an empty table binding sockets in `ctx`.
    pub fn new(ctx: Context, routing: Arc<dyn Routing>) -> Self {
        Self {
            ctx,
            routing,
            entries: HashMap::new(),
            destinations: HashMap::new(),
            poller: Poller::new(),
        }
    }

    /// Frontend socket for `destination`, binding it on first use.
    pub async fn get_socket(&mut self, destination: InstanceId) -> Result<&RouterSender> {
        match self.entries.entry(destination) {
            Entry::Occupied(entry) => Ok(&entry.into_mut().socket),
            Entry::Vacant(slot) => {
                let address = self.routing.multiplexed_address(destination);
                let (socket, receiver) = RouterSocket::bind(&self.ctx, &address).await?.split();
                let poller_index = self.poller.register(receiver);
                self.destinations.insert(poller_index, destination);
                debug!(%destination, address, poller_index, "destination opened");
                let entry = slot.insert(RoutingEntry {
                    destination,
                    socket,
                    poller_index,
                });
                Ok(&entry.socket)
            }
        }
    }

    /// Destination whose frontend is registered at `poller_index`.
    pub fn get_destination(&self, poller_index: usize) -> Option<InstanceId> {
        self.destinations.get(&poller_index).copied()
    }

    /// Applies an OPEN or CLOSE.
    pub async fn process(&mut self, command: &RoutingCommand) -> Result<()> {
        match command.action {
            RoutingAction::Open => {
                self.get_socket(command.destination).await?;
            }
            RoutingAction::Close => {
                if !self.close(command.destination) {
                    trace!(destination = %command.destination, "close for unknown destination");
                }
            }
        }
        Ok(())
    }

    /// Unregisters and releases the frontend for `destination`.
    pub fn close(&mut self, destination: InstanceId) -> bool {
        match self.entries.remove(&destination) {
            Some(entry) => {
                self.poller.unregister(entry.poller_index);
                self.destinations.remove(&entry.poller_index);
                debug!(%destination, poller_index = entry.poller_index, "destination closed");
                true
            }
            None => false,
        }
    }

    /// True if `destination` has a frontend.
    pub fn contains(&self, destination: InstanceId) -> bool {
        self.entries.contains_key(&destination)
    }

    /// Number of open destinations.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// True when no destination is open.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Next message from any frontend, tagged with its poller index.
    pub async fn poll(&mut self) -> Option<(usize, Message)> {
        self.poller.poll().await
    }
}
