//! Plugin framework for the realtime namespaces.
//!
//! A plugin owns one namespace (`/devices`, `/clients`): it decides who may
//! connect, keeps its own live state, and maps inbound event names to handler
//! functions. Each plugin runs inside a [`PluginHost`], a single tokio task
//! that drains one inbox, so every registry read and write for a namespace
//! happens on one sequential path without locks.
//!
//! Plugins reach each other through [`Siblings`], a name → [`PluginHandle`]
//! table filled once at startup by [`PluginHost::connect`]. A handle offers two
//! things: a non-blocking [`Signal`] into the sibling's inbox, and a read of the
//! sibling's last published live set. Neither plugin type knows the other.

pub mod browser;
pub mod device;
pub mod registry;

use std::collections::HashMap;
use std::ops::ControlFlow;
use std::sync::Arc;

use fleet_common::{DispatchInstruction, Frame, LiveEntry, RpcResponse};
use serde::Deserialize;
use serde_json::Value;
use tokio::sync::{Notify, mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::errors::RealtimeError;

pub use registry::{ConnectionId, ConnectionRegistry};

/// Frames that may queue for one socket before further sends to it are dropped.
pub const OUTBOUND_CAPACITY: usize = 64;

/// Published live set of a plugin.
pub type LiveSet = Arc<Vec<LiveEntry>>;

// ── Connections ───────────────────────────────────────────────────────

/// Credentials presented when a socket opens (query string on upgrade).
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Handshake {
    #[serde(default)]
    pub token: Option<String>,
    /// Identity of a device agent; ignored by the observer namespace.
    #[serde(default)]
    pub device_id: Option<String>,
}

/// Server-side end of a socket as seen by plugins.
///
/// Sends never wait: a slow or dead recipient only loses its own frames.
#[derive(Debug, Clone)]
pub struct Connection {
    id: ConnectionId,
    outbound: mpsc::Sender<Frame>,
    close: Arc<Notify>,
}

/// Transport-side end of a socket: what the plugin wants written out.
#[derive(Debug)]
pub struct Mailbox {
    frames: mpsc::Receiver<Frame>,
    close: Arc<Notify>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Delivery {
    Frame(Frame),
    Close,
}

impl Connection {
    pub fn new() -> (Self, Mailbox) {
        Self::with_capacity(OUTBOUND_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> (Self, Mailbox) {
        let (tx, rx) = mpsc::channel(capacity);
        let close = Arc::new(Notify::new());
        (
            Self {
                id: ConnectionId::new(),
                outbound: tx,
                close: close.clone(),
            },
            Mailbox { frames: rx, close },
        )
    }

    pub fn id(&self) -> &ConnectionId {
        &self.id
    }

    /// Queue a frame. Returns `false` if the frame was dropped.
    pub fn emit(&self, frame: Frame) -> bool {
        match self.outbound.try_send(frame) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(frame)) => {
                warn!(connection = %self.id, event = %frame.event, "outbound queue full, dropping frame");
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        }
    }

    /// Ask the transport to terminate the socket.
    pub fn close(&self) {
        self.close.notify_one();
    }
}

impl Mailbox {
    /// Next thing to do with the socket. A close request wins over queued frames.
    pub async fn recv(&mut self) -> Delivery {
        tokio::select! {
            biased;
            _ = self.close.notified() => Delivery::Close,
            frame = self.frames.recv() => match frame {
                Some(frame) => Delivery::Frame(frame),
                None => Delivery::Close,
            },
        }
    }

    pub fn try_recv(&mut self) -> Option<Frame> {
        self.frames.try_recv().ok()
    }
}

// ── Plugin contract ───────────────────────────────────────────────────

/// A message handler bound to one event name.
pub type Handler<P> =
    fn(&mut P, &mut PluginContext<'_>, &ConnectionId, Value) -> Result<(), RealtimeError>;

/// Event name → handler table of a plugin.
pub struct HandlerTable<P> {
    handlers: HashMap<&'static str, Handler<P>>,
}

impl<P> Default for HandlerTable<P> {
    fn default() -> Self {
        Self {
            handlers: HashMap::new(),
        }
    }
}

impl<P> HandlerTable<P> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on(mut self, event: &'static str, handler: Handler<P>) -> Self {
        self.handlers.insert(event, handler);
        self
    }

    pub fn get(&self, event: &str) -> Option<Handler<P>> {
        self.handlers.get(event).copied()
    }

    pub fn events(&self) -> Vec<&'static str> {
        let mut events: Vec<_> = self.handlers.keys().copied().collect();
        events.sort_unstable();
        events
    }
}

/// Cross-plugin operations.
#[derive(Debug)]
pub enum Signal {
    /// The device set changed; observers should be refreshed from it.
    DevicesChanged(LiveSet),
    /// Deliver an instruction to one device, at most once.
    Dispatch {
        device_id: String,
        instruction: DispatchInstruction,
        reply: oneshot::Sender<Result<(), RealtimeError>>,
    },
    /// Relay an observer's command to one device.
    Rpc(RpcCall),
    /// Route a device's answer (or a delivery failure) back to the observer.
    RpcResult {
        observer: ConnectionId,
        response: RpcResponse,
    },
}

/// An observer's `rpc-command`, addressed to one device.
#[derive(Debug, Clone, PartialEq)]
pub struct RpcCall {
    pub observer: ConnectionId,
    /// The observer's own correlation id, echoed in the response.
    pub request_id: String,
    pub device_id: String,
    pub command: String,
    pub args: Value,
}

/// Capability interface every namespace plugin implements.
pub trait Plugin: Send + Sized + 'static {
    fn name(&self) -> &'static str;

    fn authenticate(&self, handshake: &Handshake) -> bool;

    /// Called after the connection is registered and before any of its
    /// messages reach a handler.
    fn on_authenticated(
        &mut self,
        ctx: &mut PluginContext<'_>,
        connection: &Connection,
        handshake: &Handshake,
    );

    fn on_rejected(&mut self, _connection: &Connection, _handshake: &Handshake) {}

    /// Called once per registered connection, unless the plugin closed it
    /// itself through [`PluginContext::close`].
    fn on_disconnect(&mut self, ctx: &mut PluginContext<'_>, id: &ConnectionId);

    fn on_signal(&mut self, _ctx: &mut PluginContext<'_>, signal: Signal) {
        debug!(?signal, "plugin ignores signal");
    }

    fn handlers(&self) -> HandlerTable<Self>;

    /// Release plugin-owned state; connections are already closed.
    fn on_shutdown(&mut self) {}
}

// ── Sibling lookup ────────────────────────────────────────────────────

/// Cloneable address of a running plugin.
#[derive(Debug, Clone)]
pub struct PluginHandle {
    name: &'static str,
    tx: mpsc::UnboundedSender<PluginEvent>,
    live: watch::Receiver<LiveSet>,
}

impl PluginHandle {
    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Last published live set. May be stale by one event.
    pub fn live(&self) -> LiveSet {
        self.live.borrow().clone()
    }

    pub fn connect(&self, connection: Connection, handshake: Handshake) -> Result<(), RealtimeError> {
        self.send(PluginEvent::Connected {
            connection,
            handshake,
        })
    }

    pub fn message(&self, id: ConnectionId, frame: Frame) -> Result<(), RealtimeError> {
        self.send(PluginEvent::Message { id, frame })
    }

    pub fn disconnect(&self, id: ConnectionId) -> Result<(), RealtimeError> {
        self.send(PluginEvent::Disconnected { id })
    }

    pub fn signal(&self, signal: Signal) -> Result<(), RealtimeError> {
        self.send(PluginEvent::Signal(signal))
    }

    /// Ask a device namespace to deliver `instruction` to `device_id` and wait
    /// for the verdict (not for the device to apply it).
    pub async fn dispatch(
        &self,
        device_id: &str,
        instruction: DispatchInstruction,
    ) -> Result<(), RealtimeError> {
        let (reply, verdict) = oneshot::channel();
        self.signal(Signal::Dispatch {
            device_id: device_id.to_string(),
            instruction,
            reply,
        })?;
        verdict
            .await
            .map_err(|_| RealtimeError::PluginStopped { name: self.name })?
    }

    pub fn shutdown(&self) {
        let _ = self.tx.send(PluginEvent::Shutdown);
    }

    fn send(&self, event: PluginEvent) -> Result<(), RealtimeError> {
        self.tx
            .send(event)
            .map_err(|_| RealtimeError::PluginStopped { name: self.name })
    }
}

/// Name → handle table of the other plugins, excluding the owner.
#[derive(Debug, Default)]
pub struct Siblings {
    plugins: HashMap<&'static str, PluginHandle>,
}

impl Siblings {
    pub fn get(&self, name: &'static str) -> Result<&PluginHandle, RealtimeError> {
        self.plugins
            .get(name)
            .ok_or(RealtimeError::MissingSibling { name })
    }

    pub fn names(&self) -> Vec<&'static str> {
        let mut names: Vec<_> = self.plugins.keys().copied().collect();
        names.sort_unstable();
        names
    }
}

// ── Host ──────────────────────────────────────────────────────────────

/// Everything a plugin may touch while handling one event.
pub struct PluginContext<'a> {
    namespace: &'static str,
    connections: &'a mut ConnectionRegistry<Connection>,
    siblings: &'a Siblings,
    live: &'a watch::Sender<LiveSet>,
}

impl PluginContext<'_> {
    pub fn namespace(&self) -> &'static str {
        self.namespace
    }

    /// Send to one registered connection. `false` if it is gone or saturated.
    pub fn emit(&self, id: &ConnectionId, frame: Frame) -> bool {
        match self.connections.get(id) {
            Some(connection) => connection.emit(frame),
            None => false,
        }
    }

    /// Unregister and terminate a connection. Its later disconnect event is
    /// not forwarded to the plugin.
    pub fn close(&mut self, id: &ConnectionId) -> Option<Connection> {
        let connection = self.connections.unregister(id)?;
        connection.close();
        Some(connection)
    }

    pub fn sibling(&self, name: &'static str) -> Result<&PluginHandle, RealtimeError> {
        self.siblings.get(name)
    }

    /// Replace the live set readable through this plugin's handle.
    pub fn publish(&self, entries: Vec<LiveEntry>) -> LiveSet {
        let set = Arc::new(entries);
        self.live.send_replace(set.clone());
        set
    }
}

#[derive(Debug)]
pub enum PluginEvent {
    Connected {
        connection: Connection,
        handshake: Handshake,
    },
    Message {
        id: ConnectionId,
        frame: Frame,
    },
    Disconnected {
        id: ConnectionId,
    },
    Signal(Signal),
    Shutdown,
}

/// Runs one plugin: owns its authenticated connections and its inbox.
pub struct PluginHost<P: Plugin> {
    name: &'static str,
    plugin: P,
    handlers: HandlerTable<P>,
    connections: ConnectionRegistry<Connection>,
    siblings: Siblings,
    live: watch::Sender<LiveSet>,
    inbox: mpsc::UnboundedReceiver<PluginEvent>,
}

/// Create the host for `plugin` and the handle other components address it by.
pub fn plugin_channel<P: Plugin>(plugin: P) -> (PluginHost<P>, PluginHandle) {
    let name = plugin.name();
    let handlers = plugin.handlers();
    let (tx, inbox) = mpsc::unbounded_channel();
    let (live, live_rx) = watch::channel(LiveSet::default());
    let host = PluginHost {
        name,
        plugin,
        handlers,
        connections: ConnectionRegistry::new(),
        siblings: Siblings::default(),
        live,
        inbox,
    };
    let handle = PluginHandle {
        name,
        tx,
        live: live_rx,
    };
    (host, handle)
}

impl<P: Plugin> PluginHost<P> {
    /// Record every other plugin in `plugins` as a sibling.
    pub fn connect(&mut self, plugins: &[PluginHandle]) {
        for handle in plugins {
            if handle.name != self.name {
                self.siblings.plugins.insert(handle.name, handle.clone());
            }
        }
    }

    pub fn plugin(&self) -> &P {
        &self.plugin
    }

    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(self.run())
    }

    async fn run(mut self) {
        info!(
            namespace = self.name,
            events = ?self.handlers.events(),
            siblings = ?self.siblings.names(),
            "plugin started"
        );
        while let Some(event) = self.inbox.recv().await {
            if self.handle_event(event).is_break() {
                break;
            }
        }
        self.stop();
        info!(namespace = self.name, "plugin stopped");
    }

    fn split(&mut self) -> (&mut P, PluginContext<'_>) {
        (
            &mut self.plugin,
            PluginContext {
                namespace: self.name,
                connections: &mut self.connections,
                siblings: &self.siblings,
                live: &self.live,
            },
        )
    }

    pub(crate) fn handle_event(&mut self, event: PluginEvent) -> ControlFlow<()> {
        match event {
            PluginEvent::Connected {
                connection,
                handshake,
            } => self.admit(connection, handshake),
            PluginEvent::Message { id, frame } => self.route(id, frame),
            PluginEvent::Disconnected { id } => {
                if self.connections.unregister(&id).is_some() {
                    debug!(namespace = self.name, connection = %id, "connection closed");
                    let (plugin, mut ctx) = self.split();
                    plugin.on_disconnect(&mut ctx, &id);
                }
            }
            PluginEvent::Signal(signal) => {
                let (plugin, mut ctx) = self.split();
                plugin.on_signal(&mut ctx, signal);
            }
            PluginEvent::Shutdown => return ControlFlow::Break(()),
        }
        ControlFlow::Continue(())
    }

    fn admit(&mut self, connection: Connection, handshake: Handshake) {
        if self.plugin.authenticate(&handshake) {
            info!(namespace = self.name, connection = %connection.id(), "client authenticated");
            self.connections
                .register(connection.id().clone(), connection.clone());
            let (plugin, mut ctx) = self.split();
            plugin.on_authenticated(&mut ctx, &connection, &handshake);
        } else {
            let err = RealtimeError::AuthenticationFailure {
                namespace: self.name,
                connection: connection.id().to_string(),
            };
            warn!(namespace = self.name, "{}, dropping connection", err);
            self.plugin.on_rejected(&connection, &handshake);
            connection.close();
        }
    }

    fn route(&mut self, id: ConnectionId, frame: Frame) {
        if !self.connections.contains(&id) {
            debug!(namespace = self.name, connection = %id, event = %frame.event, "frame from unregistered connection ignored");
            return;
        }
        let result = match self.handlers.get(&frame.event) {
            Some(handler) => {
                let (plugin, mut ctx) = self.split();
                handler(plugin, &mut ctx, &id, frame.data)
            }
            None => Err(RealtimeError::UnknownEvent { event: frame.event }),
        };
        if let Err(err) = result {
            warn!(namespace = self.name, connection = %id, "{}", err);
            if let Some(connection) = self.connections.get(&id) {
                connection.emit(Frame::error(err.to_string()));
            }
        }
    }

    fn stop(&mut self) {
        for (_, connection) in self.connections.drain() {
            connection.close();
        }
        self.plugin.on_shutdown();
        self.live.send_replace(LiveSet::default());
    }
}

/// Decode a handler payload, naming the event on failure.
pub fn decode<T: serde::de::DeserializeOwned>(event: &str, data: Value) -> Result<T, RealtimeError> {
    serde_json::from_value(data).map_err(|source| RealtimeError::MalformedPayload {
        event: event.to_string(),
        source,
    })
}
