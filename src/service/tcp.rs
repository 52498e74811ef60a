//! Generic byte-stream service
//!
//! Exposes accepted connections as `(channel, bytes)` pairs. A channel is
//! torn down as soon as one send completes, so the service fits single
//! request/response or fire-and-forget exchanges.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::common::{ConnectionId, Endpoint};
use crate::error::{Error, Result};
use crate::transport::{
    ClientTransport, EventChannel, ServerState, ServerTransport, TransportConfig, TransportEvent,
};

/// Read timeout of channels served by `TcpServer` (100 seconds)
pub const DEFAULT_TCP_READ_TIMEOUT: Duration = Duration::from_millis(100_000);

/// Application callbacks of a `TcpServer`
pub trait TcpServerListener: Send + Sync {
    fn on_channel_open(&self, _server: &TcpServer, _channel: ConnectionId, _remote: &Endpoint) {}

    fn on_data_received(&self, server: &TcpServer, channel: ConnectionId, data: &[u8]);

    fn on_send_complete(&self, _server: &TcpServer, _channel: ConnectionId) {}

    fn on_channel_closed(&self, _server: &TcpServer, _channel: ConnectionId) {}
}

struct State {
    server: Option<ServerTransport>,
    channels: HashMap<ConnectionId, ClientTransport>,
}

struct Inner {
    listener: Arc<dyn TcpServerListener>,
    config: TransportConfig,
    state: Mutex<State>,
}

/// Byte-stream server. Cloning is cheap.
#[derive(Clone)]
pub struct TcpServer {
    inner: Arc<Inner>,
}

impl TcpServer {
    pub fn new(listener: Arc<dyn TcpServerListener>) -> Self {
        Self::with_config(
            listener,
            TransportConfig::default().with_read_timeout(Some(DEFAULT_TCP_READ_TIMEOUT)),
        )
    }

    pub fn with_config(listener: Arc<dyn TcpServerListener>, config: TransportConfig) -> Self {
        Self {
            inner: Arc::new(Inner {
                listener,
                config,
                state: Mutex::new(State {
                    server: None,
                    channels: HashMap::new(),
                }),
            }),
        }
    }

    /// Listen on `endpoint` and start serving
    pub fn start(&self, endpoint: Endpoint) -> Result<()> {
        let mut state = self.inner.state.lock();
        if state.server.is_some() {
            error!("TcpServer already started, ignoring start on {}", endpoint);
            return Err(Error::AlreadyStarted);
        }

        let server = ServerTransport::new(endpoint.clone(), self.inner.config.clone());
        let (events, rx) = EventChannel::new();
        server.start(Arc::new(events.clone()))?;
        if server.state() == ServerState::Closed {
            return Err(Error::Transport(format!("Cannot listen on {}", endpoint)));
        }

        state.server = Some(server.clone());
        drop(state);

        tokio::spawn(service_loop(self.clone(), server, events, rx));
        Ok(())
    }

    /// Stop every channel, then the acceptor. Idempotent.
    pub fn stop(&self) {
        let (server, channels) = {
            let mut state = self.inner.state.lock();
            let channels: Vec<_> = state.channels.drain().map(|(_, c)| c).collect();
            (state.server.take(), channels)
        };

        let Some(server) = server else {
            return;
        };
        info!("Stopping TcpServer on {} ({} open channels)", server.endpoint(), channels.len());

        for client in channels {
            server.reclaim_client(client.id());
            client.stop();
        }
        server.stop_clients();
        server.stop();
    }

    /// Queue `data` on `channel`.
    ///
    /// The channel's send queue is small; wait for `on_send_complete`
    /// before sending again.
    pub fn send_data(&self, channel: ConnectionId, data: Bytes) -> Result<()> {
        let client = self
            .inner
            .state
            .lock()
            .channels
            .get(&channel)
            .cloned()
            .ok_or(Error::UnknownChannel(channel))?;
        client.send(&[data])
    }

    pub fn local_endpoint(&self) -> Option<Endpoint> {
        self.inner
            .state
            .lock()
            .server
            .as_ref()
            .and_then(|s| s.local_endpoint())
    }

    /// Open channels
    pub fn channel_count(&self) -> usize {
        self.inner.state.lock().channels.len()
    }

    fn is_serving(&self, server: &ServerTransport) -> bool {
        self.inner.state.lock().server.as_ref() == Some(server)
    }

    fn is_tracked(&self, channel: ConnectionId) -> bool {
        self.inner.state.lock().channels.contains_key(&channel)
    }

    /// Untrack, reclaim and stop. Safe to call repeatedly.
    fn remove(&self, server: &ServerTransport, client: &ClientTransport) {
        if self.inner.state.lock().channels.remove(&client.id()).is_some() {
            debug!("Removing channel {}", client.id());
        }
        server.reclaim_client(client.id());
        client.stop();
    }
}

async fn service_loop(
    service: TcpServer,
    server: ServerTransport,
    events: EventChannel,
    mut rx: mpsc::UnboundedReceiver<TransportEvent>,
) {
    let listener = service.inner.listener.clone();

    while let Some(event) = rx.recv().await {
        match event {
            TransportEvent::Spawned(client) => {
                if !service.is_serving(&server) {
                    server.reclaim_client(client.id());
                    client.stop();
                    continue;
                }
                service
                    .inner
                    .state
                    .lock()
                    .channels
                    .insert(client.id(), client.clone());
                if let Err(e) = client.start(Arc::new(events.clone())) {
                    warn!("Cannot start channel {}: {}", client.id(), e);
                    service.remove(&server, &client);
                }
            }
            TransportEvent::Connected(client, remote) => {
                if service.is_tracked(client.id()) {
                    listener.on_channel_open(&service, client.id(), &remote);
                }
            }
            TransportEvent::DataReceived(client, data) => {
                if service.is_tracked(client.id()) {
                    listener.on_data_received(&service, client.id(), &data);
                }
            }
            TransportEvent::SendComplete(client) => {
                if service.is_tracked(client.id()) {
                    listener.on_send_complete(&service, client.id());
                }
                service.remove(&server, &client);
            }
            TransportEvent::Disconnected(client, e) => {
                debug!("Channel {} disconnected: {}", client.id(), e);
                if service.is_tracked(client.id()) {
                    listener.on_channel_closed(&service, client.id());
                }
                service.remove(&server, &client);
            }
            TransportEvent::ReadTimeout(client) => {
                debug!("Channel {} timed out", client.id());
                service.remove(&server, &client);
            }
            TransportEvent::Terminated(client) => {
                service.remove(&server, &client);
            }
            TransportEvent::ConnectFailed(..) => {}
            TransportEvent::ServerTerminated => break,
        }
    }

    debug!("TcpServer loop on {} finished", server.endpoint());
}
