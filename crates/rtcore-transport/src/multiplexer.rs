//! Connection multiplexer.
//!
//! The multiplexer sits between this node's local destinations and the
//! upstream cluster transport. It runs one poll loop on a dedicated thread
//! (a current-thread tokio runtime) which exclusively owns:
//!
//! - the backend dealer connected to the upstream address,
//! - the control router bound at `inproc://{uuid}.control`,
//! - the [`RoutingTable`] of per-destination frontend routers.
//!
//! Other threads talk to the loop only through the control socket. Messages
//! arriving on the backend carry a routing header naming the destination;
//! the loop strips it and forwards the remaining frames to that destination's
//! frontend. Messages arriving on a frontend get a fresh CONTINUE header for
//! that destination and go to the backend. Delivery is at most once: a
//! message for a peer that is not attached is dropped with a warning.

use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, oneshot, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};
use uuid::Uuid;

use crate::codec::{
    insert_routing_header, strip_routing_header, ControlMessage, RoutingCommand, RoutingHeader,
    RoutingStatus, StatusResponse,
};
use crate::context::Context;
use crate::error::{Result, TransportError};
use crate::message::Message;
use crate::routing::{DnsResolver, HostResolver, InstanceId, Routing};
use crate::socket::{DealerSocket, RouterSocket, DEFAULT_PIPE_CAPACITY};
use crate::table::RoutingTable;

/// Multiplexer configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MultiplexerConfig {
    /// Upstream address the backend connects to.
    pub connect_addr: String,
    /// Host resolution attempts before startup fails.
    pub resolve_retry_attempts: u32,
    /// Delay between resolution attempts in milliseconds.
    pub resolve_retry_interval_ms: u64,
    /// Upper bound on one poll iteration in milliseconds.
    pub poll_timeout_ms: u64,
    /// Depth of the control queue.
    pub control_queue_capacity: usize,
    /// Depth of the backend pipe.
    pub pipe_capacity: usize,
}

impl Default for MultiplexerConfig {
    fn default() -> Self {
        Self {
            connect_addr: "tcp://127.0.0.1:9000".to_string(),
            resolve_retry_attempts: 60,
            resolve_retry_interval_ms: 5000,
            poll_timeout_ms: 5000,
            control_queue_capacity: 1024,
            pipe_capacity: DEFAULT_PIPE_CAPACITY,
        }
    }
}

impl MultiplexerConfig {
    fn resolve_retry_interval(&self) -> Duration {
        Duration::from_millis(self.resolve_retry_interval_ms)
    }

    fn poll_timeout(&self) -> Duration {
        Duration::from_millis(self.poll_timeout_ms)
    }
}

/// Lifecycle of the poll loop, published on a watch channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LoopState {
    /// Not started, or stopped cleanly.
    Stopped,
    /// Connecting the backend.
    Starting,
    /// Polling.
    Running,
    /// Terminated by a fatal error.
    Failed(String),
}

/// Client end of the control channel. Replies come back in request order,
/// so `unanswered` counts replies owed to requests that timed out.
struct ControlClient {
    socket: DealerSocket,
    unanswered: usize,
}

struct Running {
    thread: JoinHandle<()>,
    cancel: CancellationToken,
    control_addr: String,
    control_tx: mpsc::Sender<Message>,
    control: Arc<tokio::sync::Mutex<ControlClient>>,
}

/// Routes traffic between local destinations and the upstream transport.
pub struct Multiplexer {
    config: MultiplexerConfig,
    ctx: Context,
    routing: Arc<dyn Routing>,
    resolver: Arc<dyn HostResolver>,
    instance: InstanceId,
    state: Arc<watch::Sender<LoopState>>,
    running: Mutex<Option<Running>>,
}

impl Multiplexer {
    /// Creates a stopped multiplexer.
    pub fn new(ctx: Context, routing: Arc<dyn Routing>, config: MultiplexerConfig) -> Self {
        let (state, _) = watch::channel(LoopState::Stopped);
        Self {
            config,
            ctx,
            routing,
            resolver: Arc::new(DnsResolver),
            instance: InstanceId::new_random(),
            state: Arc::new(state),
            running: Mutex::new(None),
        }
    }

    /// Replaces the host resolver used for the backend address.
    pub fn with_resolver(mut self, resolver: Arc<dyn HostResolver>) -> Self {
        self.resolver = resolver;
        self
    }

    /// Id reported in status responses.
    pub fn instance_id(&self) -> InstanceId {
        self.instance
    }

    /// Starts the poll loop and blocks until the backend is connected.
    ///
    /// Startup errors are returned here. This blocks the calling thread and
    /// must not be called from inside an async task.
    pub fn start(&self) -> Result<()> {
        let mut running = self.running.lock();
        if running.is_some() {
            return Err(TransportError::AlreadyStarted);
        }

        let cancel = CancellationToken::new();
        let control_addr = format!("inproc://{}.control", Uuid::new_v4());
        let (ready_tx, ready_rx) = oneshot::channel();
        let poll_loop = PollLoop {
            config: self.config.clone(),
            ctx: self.ctx.clone(),
            routing: self.routing.clone(),
            resolver: self.resolver.clone(),
            instance: self.instance,
            control_addr: control_addr.clone(),
            cancel: cancel.clone(),
            state: self.state.clone(),
        };

        self.state.send_replace(LoopState::Starting);
        let thread = std::thread::Builder::new()
            .name(format!("multiplexer-{}", self.instance))
            .spawn(move || poll_loop.run_blocking(ready_tx))
            .map_err(|e| TransportError::Internal(format!("failed to spawn poll thread: {}", e)))?;

        let startup = ready_rx.blocking_recv().unwrap_or_else(|_| {
            Err(TransportError::Internal(
                "poll thread exited before signalling readiness".to_string(),
            ))
        });
        if let Err(e) = startup {
            if thread.join().is_err() {
                warn!("poll thread panicked during startup");
            }
            return Err(e);
        }

        let control = match DealerSocket::connect_inproc(
            &self.ctx,
            &control_addr,
            self.config.control_queue_capacity,
        ) {
            Ok(control) => control,
            Err(e) => {
                cancel.cancel();
                let _ = thread.join();
                return Err(e);
            }
        };

        info!(
            instance = %self.instance,
            connect_addr = %self.config.connect_addr,
            control_addr = %control_addr,
            "multiplexer started"
        );
        *running = Some(Running {
            thread,
            cancel,
            control_addr,
            control_tx: control.sender(),
            control: Arc::new(tokio::sync::Mutex::new(ControlClient {
                socket: control,
                unanswered: 0,
            })),
        });
        Ok(())
    }

    /// Stops the poll loop and joins its thread.
    pub fn stop(&self) -> Result<()> {
        let running = self.running.lock().take().ok_or(TransportError::NotRunning)?;
        let Running {
            thread,
            cancel,
            control_tx,
            control,
            ..
        } = running;
        cancel.cancel();
        drop(control_tx);
        drop(control);
        thread
            .join()
            .map_err(|_| TransportError::Internal("poll thread panicked".to_string()))?;
        info!(instance = %self.instance, "multiplexer stopped");
        Ok(())
    }

    /// True between a successful `start` and `stop`.
    pub fn is_started(&self) -> bool {
        self.running.lock().is_some()
    }

    /// Asks the loop to bind `destination`. Does not wait for it.
    pub fn open(&self, destination: InstanceId) -> Result<()> {
        self.send_control(ControlMessage::Routing(RoutingCommand::open(destination)))
    }

    /// Asks the loop to release `destination`. Does not wait for it.
    pub fn close(&self, destination: InstanceId) -> Result<()> {
        self.send_control(ControlMessage::Routing(RoutingCommand::close(destination)))
    }

    fn send_control(&self, command: ControlMessage) -> Result<()> {
        let running = self.running.lock();
        let running = running.as_ref().ok_or(TransportError::NotRunning)?;
        trace!(?command, "queueing control command");
        running
            .control_tx
            .try_send(command.to_message())
            .map_err(|e| match e {
                mpsc::error::TrySendError::Full(_) => TransportError::QueueFull {
                    endpoint: running.control_addr.clone(),
                },
                mpsc::error::TrySendError::Closed(_) => TransportError::NotRunning,
            })
    }

    /// Round-trips a status request through the control channel.
    pub async fn status(&self) -> Result<StatusResponse> {
        let control = {
            let running = self.running.lock();
            running.as_ref().ok_or(TransportError::NotRunning)?.control.clone()
        };
        let mut control = control.lock().await;
        while control.socket.try_recv().is_some() {
            control.unanswered = control.unanswered.saturating_sub(1);
            debug!("discarding late status reply");
        }
        control
            .socket
            .send(ControlMessage::StatusRequest.to_message())
            .await?;

        let timeout = self.config.poll_timeout() * 2;
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let mut reply = match tokio::time::timeout_at(deadline, control.socket.recv()).await {
                Ok(reply) => reply?,
                Err(_) => {
                    control.unanswered += 1;
                    return Err(TransportError::Timeout {
                        timeout_ms: timeout.as_millis() as u64,
                    });
                }
            };
            if control.unanswered > 0 {
                control.unanswered -= 1;
                debug!("discarding late status reply");
                continue;
            }
            return match ControlMessage::decode(&mut reply)? {
                ControlMessage::StatusResponse(status) => Ok(status),
                other => Err(TransportError::InvalidFrame {
                    reason: format!("unexpected control reply {:?}", other),
                }),
            };
        }
    }

    /// Subscribes to loop state changes.
    pub fn state(&self) -> watch::Receiver<LoopState> {
        self.state.subscribe()
    }

    /// Destination id for a name.
    pub fn resolve_destination(&self, name: &str) -> InstanceId {
        self.routing.destination_id(name)
    }

    /// Frontend address of a destination.
    pub fn address_for(&self, destination: InstanceId) -> String {
        self.routing.multiplexed_address(destination)
    }
}

impl Drop for Multiplexer {
    fn drop(&mut self) {
        if let Some(running) = self.running.get_mut().take() {
            running.cancel.cancel();
            if running.thread.join().is_err() {
                error!(instance = %self.instance, "poll thread panicked");
            }
        }
    }
}

struct PollLoop {
    config: MultiplexerConfig,
    ctx: Context,
    routing: Arc<dyn Routing>,
    resolver: Arc<dyn HostResolver>,
    instance: InstanceId,
    control_addr: String,
    cancel: CancellationToken,
    state: Arc<watch::Sender<LoopState>>,
}

impl PollLoop {
    fn run_blocking(self, ready: oneshot::Sender<Result<()>>) {
        let runtime = match tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
        {
            Ok(runtime) => runtime,
            Err(e) => {
                self.state.send_replace(LoopState::Failed(e.to_string()));
                let _ = ready.send(Err(e.into()));
                return;
            }
        };
        runtime.block_on(self.run(ready));
    }

    async fn run(self, ready: oneshot::Sender<Result<()>>) {
        let startup = async {
            let backend = self.connect_backend().await?;
            let control = RouterSocket::bind_with_capacity(
                &self.ctx,
                &self.control_addr,
                self.config.control_queue_capacity,
            )
            .await?;
            Ok::<_, TransportError>((backend, control))
        }
        .await;

        let (mut backend, mut control) = match startup {
            Ok(sockets) => sockets,
            Err(e) => {
                error!(error = %e, "multiplexer failed to start");
                self.state.send_replace(LoopState::Failed(e.to_string()));
                let _ = ready.send(Err(e));
                return;
            }
        };

        let mut table = RoutingTable::new(self.ctx.clone(), self.routing.clone());
        self.state.send_replace(LoopState::Running);
        if ready.send(Ok(())).is_err() {
            warn!("starter went away before the loop was ready");
            self.cancel.cancel();
        }

        let outcome = self.poll(&mut backend, &mut control, &mut table).await;
        let open_destinations = table.len();
        drop(table);
        drop(control);
        drop(backend);

        match outcome {
            Ok(()) => {
                info!(open_destinations, "poll loop exited");
                self.state.send_replace(LoopState::Stopped);
            }
            Err(e) => {
                error!(error = %e, open_destinations, "poll loop terminated");
                self.state.send_replace(LoopState::Failed(e.to_string()));
            }
        }
    }

    async fn connect_backend(&self) -> Result<DealerSocket> {
        let addr = &self.config.connect_addr;
        let attempts = self.config.resolve_retry_attempts.max(1);
        for attempt in 1..=attempts {
            match DealerSocket::connect(&self.ctx, addr, self.resolver.as_ref(), self.config.pipe_capacity)
                .await
            {
                Ok(socket) => {
                    info!(addr = %addr, attempt, "backend connected");
                    return Ok(socket);
                }
                Err(TransportError::HostResolution { host, reason }) if attempt < attempts => {
                    info!(
                        host = %host,
                        reason = %reason,
                        attempt,
                        retry_in_ms = self.config.resolve_retry_interval_ms,
                        "could not resolve backend host, retrying"
                    );
                    tokio::select! {
                        _ = self.cancel.cancelled() => {
                            return Err(TransportError::Internal(
                                "interrupted while resolving backend".to_string(),
                            ));
                        }
                        _ = tokio::time::sleep(self.config.resolve_retry_interval()) => {}
                    }
                }
                Err(TransportError::HostResolution { .. }) => break,
                Err(e) => return Err(e),
            }
        }
        Err(TransportError::ResolveExhausted {
            host: addr.clone(),
            attempts,
        })
    }

    async fn poll(
        &self,
        backend: &mut DealerSocket,
        control: &mut RouterSocket,
        table: &mut RoutingTable,
    ) -> Result<()> {
        let poll_timeout = self.config.poll_timeout();
        loop {
            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => {
                    info!("interrupted, exiting gracefully");
                    return Ok(());
                }
                message = backend.recv() => {
                    self.send_to_frontend(table, message?).await?;
                }
                message = control.recv() => {
                    let message = message.ok_or_else(|| {
                        TransportError::Internal("control socket closed".to_string())
                    })?;
                    self.handle_control(control, table, message).await?;
                }
                Some((index, message)) = table.poll() => {
                    self.send_to_backend(table, backend, index, message).await?;
                }
                _ = tokio::time::sleep(poll_timeout) => {
                    trace!("poll timeout");
                }
            }
        }
    }

    async fn send_to_frontend(&self, table: &mut RoutingTable, mut message: Message) -> Result<()> {
        let header = match strip_routing_header(&mut message) {
            Ok(header) => header,
            Err(e) => {
                warn!(error = %e, "dropping backend message without a valid routing header");
                return Ok(());
            }
        };

        if header.status != RoutingStatus::Continue {
            error!(
                status = ?header.status,
                destination = %header.destination,
                "received non-continue route, dropping"
            );
            return Ok(());
        }

        let frontend = table.get_socket(header.destination).await?;
        match frontend.try_send(message) {
            Ok(()) => Ok(()),
            Err(TransportError::HostUnreachable { peer }) => {
                warn!(destination = %header.destination, peer, "host unreachable, dropping message");
                Ok(())
            }
            Err(TransportError::QueueFull { endpoint }) => {
                warn!(destination = %header.destination, endpoint = %endpoint, "peer queue full, dropping message");
                Ok(())
            }
            Err(TransportError::InvalidFrame { reason }) => {
                warn!(destination = %header.destination, reason = %reason, "dropping malformed message");
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    async fn send_to_backend(
        &self,
        table: &RoutingTable,
        backend: &DealerSocket,
        index: usize,
        mut message: Message,
    ) -> Result<()> {
        let Some(destination) = table.get_destination(index) else {
            debug!(poller_index = index, "dropping message from closed destination");
            return Ok(());
        };
        insert_routing_header(&mut message, &RoutingHeader::continue_to(destination));
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => {
                debug!(%destination, "interrupted while the backend was full, dropping message");
                Ok(())
            }
            sent = backend.send(message) => sent,
        }
    }

    async fn handle_control(
        &self,
        control: &RouterSocket,
        table: &mut RoutingTable,
        mut message: Message,
    ) -> Result<()> {
        let Some(peer) = message.pop_front() else {
            return Ok(());
        };
        match ControlMessage::decode(&mut message) {
            Ok(ControlMessage::StatusRequest) => {
                let status = StatusResponse {
                    instance: self.instance,
                    open_destinations: u32::try_from(table.len()).unwrap_or(u32::MAX),
                };
                let mut reply = ControlMessage::StatusResponse(status).to_message();
                reply.push_front(peer);
                if let Err(e) = control.try_send(reply) {
                    warn!(error = %e, "failed to answer status request");
                }
            }
            Ok(ControlMessage::Routing(command)) => {
                table.process(&command).await?;
            }
            Ok(other) => {
                error!(command = ?other, "unexpected command");
            }
            Err(e) => {
                error!(error = %e, "unexpected command");
            }
        }
        Ok(())
    }
}
