//! Connection lifecycle over TCP, with an optional simulated route.
//!
//! A [`ConnectionManager`] holds at most one active connection. Client roles
//! call [`ConnectionManager::connect`]; server roles call
//! [`ConnectionManager::listen`], and each accepted peer preempts the previous
//! one. Nothing here blocks the caller: socket work runs on tokio tasks and
//! every outcome (connected, disconnected, message) arrives as a
//! [`ConnectionEvent`] on one queue.
//!
//! Every connection gets a generation-checked [`ConnectionId`]. Background
//! tasks tag their events with the id they were started for, and events whose
//! id is no longer current are dropped under the manager lock, so a consumer
//! never sees traffic from a connection it already tore down.

use crate::codec::{encode_frame, FrameDecoder};
use crate::config::NetConfig;
use crate::error::NetError;
use crate::protocol::NetworkMessage;
use factoryforge_core::{EntityAllocator, EntityHandle};
use std::fmt;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

const READ_CHUNK: usize = 16 * 1024;

/// Destination for outgoing frames when the real socket is bypassed.
pub trait FrameSink: Send + Sync {
    /// Accept one complete length-prefixed frame.
    fn send_frame(&self, frame: Vec<u8>);
}

/// Identifies one connection for the lifetime of the manager.
///
/// Ids are recycled with a bumped generation, so an id from a torn-down
/// connection never equals the id of its successor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(EntityHandle);

impl ConnectionId {
    /// Underlying slot handle.
    pub fn handle(self) -> EntityHandle {
        self.0
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn{}", self.0)
    }
}

/// Where the manager currently is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// No connection and no listener.
    Disconnected,
    /// A connection is being established.
    Connecting,
    /// A connection is up.
    Connected,
    /// Bound and waiting for a peer, with no active connection.
    Listening,
    /// The last connection attempt or connection ended with an error.
    Failed,
}

/// Something that happened on the transport.
#[derive(Debug)]
pub enum ConnectionEvent {
    /// The listener is bound.
    Listening {
        /// Bound address (port 0 resolves to the chosen port).
        local_addr: SocketAddr,
    },
    /// Binding the listener failed.
    ListenFailed {
        /// Underlying error.
        cause: NetError,
    },
    /// A connection is established.
    Connected {
        /// The new connection.
        connection: ConnectionId,
        /// Remote address, `None` on the simulated route.
        peer: Option<SocketAddr>,
    },
    /// A connection ended without the local side calling `disconnect`.
    Disconnected {
        /// The connection that ended.
        connection: ConnectionId,
        /// Why it ended; `None` when a newer peer preempted it.
        cause: Option<NetError>,
    },
    /// A complete message arrived.
    Message {
        /// Connection it arrived on.
        connection: ConnectionId,
        /// Decoded message.
        message: NetworkMessage,
    },
    /// One or more frames were dropped because they did not decode.
    DecodeFailed {
        /// Connection the frames arrived on.
        connection: ConnectionId,
        /// Undecodable frames since the last good one.
        consecutive: u32,
    },
}

/// Receiving end of a manager's event queue.
#[derive(Debug)]
pub struct ConnectionEvents {
    rx: mpsc::UnboundedReceiver<ConnectionEvent>,
}

impl ConnectionEvents {
    /// Wait for the next event. `None` once the manager and all of its tasks
    /// are gone.
    pub async fn recv(&mut self) -> Option<ConnectionEvent> {
        self.rx.recv().await
    }

    /// Next event if one is already queued.
    pub fn try_recv(&mut self) -> Option<ConnectionEvent> {
        self.rx.try_recv().ok()
    }

    /// Every event currently queued.
    pub fn drain(&mut self) -> Vec<ConnectionEvent> {
        let mut events = Vec::new();
        while let Some(event) = self.try_recv() {
            events.push(event);
        }
        events
    }
}

enum Route {
    Tcp {
        outgoing: mpsc::UnboundedSender<Vec<u8>>,
        task: JoinHandle<()>,
    },
    Simulated {
        sink: Arc<dyn FrameSink>,
        decoder: FrameDecoder,
    },
}

struct Active {
    id: ConnectionId,
    route: Route,
}

struct Listener {
    epoch: u64,
    task: JoinHandle<()>,
    local_addr: Option<SocketAddr>,
}

struct Inner {
    state: ConnectionState,
    ids: EntityAllocator,
    current: Option<Active>,
    listener: Option<Listener>,
    next_listener_epoch: u64,
}

impl Inner {
    fn allocate(&mut self) -> ConnectionId {
        ConnectionId(self.ids.create())
    }

    fn is_current(&self, id: ConnectionId) -> bool {
        self.current.as_ref().is_some_and(|active| active.id == id)
    }

    /// Drop the active connection, if any, and invalidate its id.
    fn teardown(&mut self) -> Option<ConnectionId> {
        let active = self.current.take()?;
        if let Route::Tcp { task, .. } = active.route {
            task.abort();
        }
        self.ids.destroy(active.id.0);
        self.state = self.idle_state();
        Some(active.id)
    }

    fn stop_listener(&mut self) {
        if let Some(listener) = self.listener.take() {
            listener.task.abort();
        }
    }

    fn idle_state(&self) -> ConnectionState {
        match &self.listener {
            Some(listener) if listener.local_addr.is_some() => ConnectionState::Listening,
            _ => ConnectionState::Disconnected,
        }
    }
}

struct Shared {
    inner: Mutex<Inner>,
    events: mpsc::UnboundedSender<ConnectionEvent>,
    config: NetConfig,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Callers hold the lock so staleness checks and emission are atomic.
    fn emit(&self, event: ConnectionEvent) {
        if self.events.send(event).is_err() {
            trace!("event receiver dropped");
        }
    }

    fn mark_connected(&self, id: ConnectionId, peer: Option<SocketAddr>) -> bool {
        let mut inner = self.lock();
        if !inner.is_current(id) {
            debug!(connection = %id, "stale connection established; closing");
            return false;
        }
        inner.state = ConnectionState::Connected;
        info!(connection = %id, ?peer, "connected");
        self.emit(ConnectionEvent::Connected {
            connection: id,
            peer,
        });
        true
    }

    fn deliver(
        &self,
        id: ConnectionId,
        messages: Vec<NetworkMessage>,
        new_failures: u32,
        consecutive: u32,
    ) -> bool {
        let inner = self.lock();
        if !inner.is_current(id) {
            debug!(
                connection = %id,
                dropped = messages.len(),
                "dropping traffic from stale connection"
            );
            return false;
        }
        if new_failures > 0 {
            self.emit(ConnectionEvent::DecodeFailed {
                connection: id,
                consecutive,
            });
        }
        for message in messages {
            self.emit(ConnectionEvent::Message {
                connection: id,
                message,
            });
        }
        true
    }

    fn finish(&self, id: ConnectionId, cause: Option<NetError>) {
        let mut inner = self.lock();
        if !inner.is_current(id) {
            trace!(connection = %id, "stale connection finished");
            return;
        }
        inner.teardown();
        match &cause {
            Some(NetError::PeerClosed) | None => {
                info!(connection = %id, "connection closed");
            }
            Some(err) => {
                warn!(connection = %id, %err, "connection failed");
                if inner.state == ConnectionState::Disconnected {
                    inner.state = ConnectionState::Failed;
                }
            }
        }
        self.emit(ConnectionEvent::Disconnected {
            connection: id,
            cause,
        });
    }

    fn listening(&self, epoch: u64, local_addr: SocketAddr) -> bool {
        let mut inner = self.lock();
        let Some(listener) = inner.listener.as_mut().filter(|l| l.epoch == epoch) else {
            return false;
        };
        listener.local_addr = Some(local_addr);
        if inner.current.is_none() {
            inner.state = ConnectionState::Listening;
        }
        info!(%local_addr, "listening");
        self.emit(ConnectionEvent::Listening { local_addr });
        true
    }

    fn listen_failed(&self, epoch: u64, err: std::io::Error) {
        let mut inner = self.lock();
        if inner.listener.as_ref().map(|l| l.epoch) != Some(epoch) {
            return;
        }
        inner.listener = None;
        if inner.current.is_none() {
            inner.state = ConnectionState::Failed;
        }
        warn!(%err, "listen failed");
        self.emit(ConnectionEvent::ListenFailed { cause: err.into() });
    }

    /// Make an accepted stream the active connection, preempting the old one.
    fn adopt(self: &Arc<Self>, epoch: u64, stream: TcpStream, peer: SocketAddr) -> bool {
        let mut inner = self.lock();
        if inner.listener.as_ref().map(|l| l.epoch) != Some(epoch) {
            return false;
        }
        if let Some(old) = inner.teardown() {
            info!(connection = %old, %peer, "preempted by new peer");
            self.emit(ConnectionEvent::Disconnected {
                connection: old,
                cause: None,
            });
        }

        let id = inner.allocate();
        let (outgoing, rx) = mpsc::unbounded_channel();
        let task = tokio::spawn(run_connection(Arc::clone(self), id, stream, rx));
        inner.current = Some(Active {
            id,
            route: Route::Tcp { outgoing, task },
        });
        inner.state = ConnectionState::Connecting;
        true
    }
}

/// Owns at most one connection and reports everything through
/// [`ConnectionEvents`].
pub struct ConnectionManager {
    shared: Arc<Shared>,
    runtime: Option<Handle>,
}

impl fmt::Debug for ConnectionManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionManager")
            .field("state", &self.state())
            .field("current", &self.current_connection())
            .finish_non_exhaustive()
    }
}

impl ConnectionManager {
    /// Create a manager and its event queue.
    ///
    /// Captures the ambient tokio runtime if there is one; without it only
    /// the simulated route is available.
    pub fn new(config: NetConfig) -> (Self, ConnectionEvents) {
        let (events, rx) = mpsc::unbounded_channel();
        let manager = Self {
            shared: Arc::new(Shared {
                inner: Mutex::new(Inner {
                    state: ConnectionState::Disconnected,
                    ids: EntityAllocator::new(),
                    current: None,
                    listener: None,
                    next_listener_epoch: 0,
                }),
                events,
                config,
            }),
            runtime: Handle::try_current().ok(),
        };
        (manager, ConnectionEvents { rx })
    }

    /// Active configuration.
    pub fn config(&self) -> &NetConfig {
        &self.shared.config
    }

    /// Start connecting to `host:port`, dropping any existing connection.
    ///
    /// Returns the id the connection will carry. Success arrives as
    /// [`ConnectionEvent::Connected`]; failure or timeout as
    /// [`ConnectionEvent::Disconnected`] with a cause. Messages sent while
    /// connecting are queued and flushed once the stream is up.
    pub fn connect(&self, host: &str, port: u16) -> Result<ConnectionId, NetError> {
        let runtime = self.runtime.as_ref().ok_or(NetError::NoRuntime)?;
        let mut inner = self.shared.lock();
        if let Some(old) = inner.teardown() {
            debug!(connection = %old, "replacing connection");
        }

        let id = inner.allocate();
        let (outgoing, rx) = mpsc::unbounded_channel();
        let shared = Arc::clone(&self.shared);
        let addr = format!("{host}:{port}");
        let timeout_ms = self.shared.config.connect_timeout_ms;
        info!(connection = %id, %addr, "connecting");

        let task = runtime.spawn(async move {
            let attempt = tokio::time::timeout(
                Duration::from_millis(timeout_ms),
                TcpStream::connect(addr.as_str()),
            )
            .await;
            match attempt {
                Ok(Ok(stream)) => run_connection(shared, id, stream, rx).await,
                Ok(Err(err)) => shared.finish(id, Some(err.into())),
                Err(_) => shared.finish(id, Some(NetError::ConnectTimeout { addr, timeout_ms })),
            }
        });

        inner.current = Some(Active {
            id,
            route: Route::Tcp { outgoing, task },
        });
        inner.state = ConnectionState::Connecting;
        Ok(id)
    }

    /// Bind `0.0.0.0:port` and accept peers, one active at a time.
    ///
    /// Replaces any previous listener; the bound address is reported as
    /// [`ConnectionEvent::Listening`].
    pub fn listen(&self, port: u16) -> Result<(), NetError> {
        let runtime = self.runtime.as_ref().ok_or(NetError::NoRuntime)?;
        let mut inner = self.shared.lock();
        inner.stop_listener();

        let epoch = inner.next_listener_epoch;
        inner.next_listener_epoch += 1;
        let shared = Arc::clone(&self.shared);
        let task = runtime.spawn(accept_loop(shared, epoch, port));
        inner.listener = Some(Listener {
            epoch,
            task,
            local_addr: None,
        });
        Ok(())
    }

    /// Close the listener and the active connection. Emits no events.
    pub fn stop_listening(&self) {
        let mut inner = self.shared.lock();
        inner.stop_listener();
        if let Some(id) = inner.teardown() {
            debug!(connection = %id, "closed with listener");
        }
        inner.state = ConnectionState::Disconnected;
    }

    /// Drop the active connection and anything partially received. Emits no
    /// events; a listener keeps accepting.
    pub fn disconnect(&self) {
        let mut inner = self.shared.lock();
        if let Some(id) = inner.teardown() {
            info!(connection = %id, "disconnected locally");
        }
    }

    /// Frame `message` and queue it on the active connection.
    ///
    /// Without a connection the message is dropped. Encoding and oversize
    /// errors are returned to the caller.
    pub fn send(&self, message: &NetworkMessage) -> Result<(), NetError> {
        let config = &self.shared.config;
        let frame = encode_frame(message, config.encoding, config.max_frame_len)?;

        let sink = {
            let inner = self.shared.lock();
            let Some(active) = inner.current.as_ref() else {
                debug!(kind = message.kind(), "not connected; dropping message");
                return Ok(());
            };
            trace!(connection = %active.id, kind = message.kind(), bytes = frame.len(), "send");
            match &active.route {
                Route::Tcp { outgoing, .. } => {
                    if outgoing.send(frame).is_err() {
                        debug!(connection = %active.id, "connection task gone; dropping frame");
                    }
                    return Ok(());
                }
                Route::Simulated { sink, .. } => Arc::clone(sink),
            }
        };
        sink.send_frame(frame);
        Ok(())
    }

    /// Current lifecycle state.
    pub fn state(&self) -> ConnectionState {
        self.shared.lock().state
    }

    /// Id of the active connection.
    pub fn current_connection(&self) -> Option<ConnectionId> {
        self.shared.lock().current.as_ref().map(|active| active.id)
    }

    /// Address the listener is bound to.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.shared
            .lock()
            .listener
            .as_ref()
            .and_then(|listener| listener.local_addr)
    }

    /// Replace the active connection with one whose frames go to `sink`.
    ///
    /// Incoming bytes for it are fed through [`Self::receive_simulated`].
    /// Emits [`ConnectionEvent::Connected`] with no peer address.
    pub fn install_simulated_transport(&self, sink: Arc<dyn FrameSink>) -> ConnectionId {
        let config = &self.shared.config;
        let mut inner = self.shared.lock();
        if let Some(old) = inner.teardown() {
            debug!(connection = %old, "replaced by simulated transport");
        }
        let id = inner.allocate();
        inner.current = Some(Active {
            id,
            route: Route::Simulated {
                sink,
                decoder: FrameDecoder::new(config.encoding, config.max_frame_len),
            },
        });
        inner.state = ConnectionState::Connected;
        info!(connection = %id, "simulated transport installed");
        self.shared.emit(ConnectionEvent::Connected {
            connection: id,
            peer: None,
        });
        id
    }

    /// Tear down the simulated connection, if that is what is active.
    pub fn remove_simulated_transport(&self) {
        let mut inner = self.shared.lock();
        let simulated = inner
            .current
            .as_ref()
            .is_some_and(|active| matches!(active.route, Route::Simulated { .. }));
        if simulated {
            inner.teardown();
        }
    }

    /// Feed bytes that arrived over the simulated route.
    ///
    /// Ignored unless a simulated connection is active.
    pub fn receive_simulated(&self, bytes: &[u8]) {
        let mut inner = self.shared.lock();
        let Some(Active {
            id,
            route: Route::Simulated { decoder, .. },
        }) = inner.current.as_mut()
        else {
            debug!(bytes = bytes.len(), "no simulated connection; dropping bytes");
            return;
        };
        let id = *id;

        decoder.extend(bytes);
        let before = decoder.decode_failures();
        let (messages, failure) = decoder.drain_received_messages();
        let new_failures = (decoder.decode_failures() - before) as u32;
        let consecutive = decoder.consecutive_failures();

        if new_failures > 0 {
            self.shared.emit(ConnectionEvent::DecodeFailed {
                connection: id,
                consecutive,
            });
        }
        for message in messages {
            self.shared.emit(ConnectionEvent::Message {
                connection: id,
                message,
            });
        }
        if let Some(err) = failure {
            warn!(connection = %id, %err, "closing simulated connection");
            inner.teardown();
            inner.state = ConnectionState::Failed;
            self.shared.emit(ConnectionEvent::Disconnected {
                connection: id,
                cause: Some(err.into()),
            });
        }
    }
}

impl Drop for ConnectionManager {
    fn drop(&mut self) {
        let mut inner = self.shared.lock();
        inner.stop_listener();
        inner.teardown();
    }
}

async fn accept_loop(shared: Arc<Shared>, epoch: u64, port: u16) {
    let listener = match TcpListener::bind(("0.0.0.0", port)).await {
        Ok(listener) => listener,
        Err(err) => return shared.listen_failed(epoch, err),
    };
    let local_addr = match listener.local_addr() {
        Ok(addr) => addr,
        Err(err) => return shared.listen_failed(epoch, err),
    };
    if !shared.listening(epoch, local_addr) {
        return;
    }

    loop {
        match listener.accept().await {
            Ok((stream, peer)) => {
                debug!(%peer, "accepted");
                if !shared.adopt(epoch, stream, peer) {
                    return;
                }
            }
            Err(err) => {
                warn!(%err, "accept failed");
                tokio::time::sleep(Duration::from_millis(50)).await;
            }
        }
    }
}

/// Pump one TCP connection until it closes, fails, or is torn down.
async fn run_connection(
    shared: Arc<Shared>,
    id: ConnectionId,
    stream: TcpStream,
    mut outgoing: mpsc::UnboundedReceiver<Vec<u8>>,
) {
    if let Err(err) = stream.set_nodelay(true) {
        debug!(connection = %id, %err, "failed to set TCP_NODELAY");
    }
    let peer = stream.peer_addr().ok();
    if !shared.mark_connected(id, peer) {
        return;
    }

    let (mut reader, mut writer) = stream.into_split();
    let mut decoder = FrameDecoder::new(shared.config.encoding, shared.config.max_frame_len);
    let mut buf = vec![0u8; READ_CHUNK];

    let cause = loop {
        tokio::select! {
            read = reader.read(&mut buf) => match read {
                Ok(0) => break Some(NetError::PeerClosed),
                Ok(n) => {
                    trace!(connection = %id, bytes = n, "recv");
                    decoder.extend(&buf[..n]);
                    let before = decoder.decode_failures();
                    let (messages, failure) = decoder.drain_received_messages();
                    let new_failures = (decoder.decode_failures() - before) as u32;
                    if !shared.deliver(id, messages, new_failures, decoder.consecutive_failures()) {
                        return;
                    }
                    if let Some(err) = failure {
                        break Some(err.into());
                    }
                }
                Err(err) => break Some(err.into()),
            },
            frame = outgoing.recv() => match frame {
                Some(frame) => {
                    if let Err(err) = writer.write_all(&frame).await {
                        break Some(err.into());
                    }
                }
                None => return,
            },
        }
    };

    shared.finish(id, cause);
}
