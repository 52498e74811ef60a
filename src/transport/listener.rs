//! Listener contracts and the event-channel adapter
//!
//! Transports report everything through these callbacks. Callbacks are
//! always invoked from the transport's own task, never from inside a call
//! made into the transport, so a listener may call back into the transport
//! (e.g. `send` or `stop`) without re-entrancy concerns.

use std::io;

use bytes::Bytes;
use tokio::sync::mpsc;

use crate::common::Endpoint;

use super::{ClientTransport, ServerTransport};

/// Callbacks of one client transport
pub trait ClientListener: Send + Sync {
    /// Connection established (accepted or connected)
    fn on_connected(&self, client: &ClientTransport, remote: &Endpoint);

    /// One outbound connect attempt failed
    fn on_connect_failed(&self, _client: &ClientTransport, _error: io::Error) {}

    /// Connection lost; the socket has already been released
    fn on_disconnected(&self, client: &ClientTransport, error: io::Error);

    /// Bytes read into the receive buffer
    fn on_data_received(&self, client: &ClientTransport, data: &[u8]);

    /// One `send` call has been fully written
    fn on_send_complete(&self, client: &ClientTransport);

    /// Nothing was read for the configured read timeout
    fn on_read_timeout(&self, _client: &ClientTransport) {}

    /// Last callback; fired exactly once after `stop`
    fn on_terminated(&self, client: &ClientTransport);
}

/// Callbacks of one server transport
pub trait ServerListener: Send + Sync {
    /// A connection was accepted. The client is not started yet.
    fn on_spawned(&self, server: &ServerTransport, client: ClientTransport);

    /// Acceptor closed (after `stop` or a bind failure)
    fn on_terminated(&self, server: &ServerTransport);
}

/// Tagged transport events, one variant per listener callback
#[derive(Debug)]
pub enum TransportEvent {
    Spawned(ClientTransport),
    ServerTerminated,
    Connected(ClientTransport, Endpoint),
    ConnectFailed(ClientTransport, io::Error),
    Disconnected(ClientTransport, io::Error),
    DataReceived(ClientTransport, Bytes),
    SendComplete(ClientTransport),
    ReadTimeout(ClientTransport),
    Terminated(ClientTransport),
}

impl TransportEvent {
    /// Client the event refers to, if any
    pub fn client(&self) -> Option<&ClientTransport> {
        match self {
            TransportEvent::Spawned(c)
            | TransportEvent::Connected(c, _)
            | TransportEvent::ConnectFailed(c, _)
            | TransportEvent::Disconnected(c, _)
            | TransportEvent::DataReceived(c, _)
            | TransportEvent::SendComplete(c)
            | TransportEvent::ReadTimeout(c)
            | TransportEvent::Terminated(c) => Some(c),
            TransportEvent::ServerTerminated => None,
        }
    }
}

/// Listener that turns callbacks into `TransportEvent`s on a channel.
///
/// Implements both listener traits so a single task can consume the events
/// of a server transport and of every client it spawned, in order.
#[derive(Clone)]
pub struct EventChannel {
    tx: mpsc::UnboundedSender<TransportEvent>,
}

impl EventChannel {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<TransportEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    fn emit(&self, event: TransportEvent) {
        // Receiver gone means the consumer shut down; nothing left to notify.
        let _ = self.tx.send(event);
    }
}

impl ClientListener for EventChannel {
    fn on_connected(&self, client: &ClientTransport, remote: &Endpoint) {
        self.emit(TransportEvent::Connected(client.clone(), remote.clone()));
    }

    fn on_connect_failed(&self, client: &ClientTransport, error: io::Error) {
        self.emit(TransportEvent::ConnectFailed(client.clone(), error));
    }

    fn on_disconnected(&self, client: &ClientTransport, error: io::Error) {
        self.emit(TransportEvent::Disconnected(client.clone(), error));
    }

    fn on_data_received(&self, client: &ClientTransport, data: &[u8]) {
        self.emit(TransportEvent::DataReceived(
            client.clone(),
            Bytes::copy_from_slice(data),
        ));
    }

    fn on_send_complete(&self, client: &ClientTransport) {
        self.emit(TransportEvent::SendComplete(client.clone()));
    }

    fn on_read_timeout(&self, client: &ClientTransport) {
        self.emit(TransportEvent::ReadTimeout(client.clone()));
    }

    fn on_terminated(&self, client: &ClientTransport) {
        self.emit(TransportEvent::Terminated(client.clone()));
    }
}

impl ServerListener for EventChannel {
    fn on_spawned(&self, _server: &ServerTransport, client: ClientTransport) {
        self.emit(TransportEvent::Spawned(client));
    }

    fn on_terminated(&self, _server: &ServerTransport) {
        self.emit(TransportEvent::ServerTerminated);
    }
}
