//! HTTP service on top of the transports

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::app::metrics;
use crate::common::{ConnectionId, Endpoint};
use crate::error::{Error, Result};
use crate::transport::{
    ClientTransport, EventChannel, ServerState, ServerTransport, TransportConfig, TransportEvent,
};

use super::message::{HttpRequest, HttpResponse};
use super::session::{HttpLimits, HttpSession, SessionState};

/// Application side of an `HttpServer`
pub trait HttpServerListener: Send + Sync {
    /// A complete request arrived on `client`.
    ///
    /// Answer with `HttpServer::send_response`, now or later. No service
    /// lock is held during the call.
    fn on_http_request_received(&self, server: &HttpServer, client: ConnectionId, request: HttpRequest);
}

struct Connection {
    client: ClientTransport,
    session: HttpSession,
}

struct State {
    server: Option<ServerTransport>,
    sessions: HashMap<ConnectionId, Connection>,
}

struct Inner {
    handler: Arc<dyn HttpServerListener>,
    config: TransportConfig,
    limits: HttpLimits,
    state: Mutex<State>,
}

/// HTTP server. Cloning is cheap.
#[derive(Clone)]
pub struct HttpServer {
    inner: Arc<Inner>,
}

impl HttpServer {
    pub fn new(handler: Arc<dyn HttpServerListener>) -> Self {
        Self::build(handler, TransportConfig::default(), HttpLimits::default())
    }

    pub fn with_config(handler: Arc<dyn HttpServerListener>, config: TransportConfig) -> Self {
        Self::build(handler, config, HttpLimits::default())
    }

    pub fn with_limits(self, limits: HttpLimits) -> Self {
        Self::build(self.inner.handler.clone(), self.inner.config.clone(), limits)
    }

    fn build(handler: Arc<dyn HttpServerListener>, config: TransportConfig, limits: HttpLimits) -> Self {
        Self {
            inner: Arc::new(Inner {
                handler,
                config,
                limits,
                state: Mutex::new(State {
                    server: None,
                    sessions: HashMap::new(),
                }),
            }),
        }
    }

    pub fn start(&self, endpoint: Endpoint) -> Result<()> {
        let mut state = self.inner.state.lock();
        if state.server.is_some() {
            error!("HttpServer already started, ignoring start on {}", endpoint);
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

    /// Drop every session and stop the acceptor. Idempotent.
    pub fn stop(&self) {
        let (server, connections) = {
            let mut state = self.inner.state.lock();
            let connections: Vec<_> = state.sessions.drain().map(|(_, c)| c).collect();
            (state.server.take(), connections)
        };

        let Some(server) = server else {
            return;
        };
        info!("Stopping HttpServer on {} ({} open sessions)", server.endpoint(), connections.len());

        for connection in connections {
            server.reclaim_client(connection.client.id());
            connection.client.stop();
        }
        server.stop_clients();
        server.stop();
    }

    /// Answer the request pending on `client`.
    ///
    /// Only legal once per request, after `on_http_request_received`.
    pub fn send_response(&self, client: ConnectionId, response: HttpResponse) -> Result<()> {
        let (transport, server) = {
            let mut state = self.inner.state.lock();
            let server = state.server.clone();
            let connection = state
                .sessions
                .get_mut(&client)
                .ok_or(Error::UnknownChannel(client))?;

            if connection.session.state() != SessionState::WaitingForOurResponse {
                error!(
                    "[{}] Response sent in state {:?}",
                    client,
                    connection.session.state()
                );
            }
            connection.session.prepare_response(&response)?;
            (connection.client.clone(), server)
        };

        let result = if transport.config().send_buffer_count >= 2 {
            transport.send(&[response.head(), response.body.clone()])
        } else {
            transport.send(&[response.to_bytes()])
        };

        // No completion will ever arrive for a failed send
        if let Err(e) = &result {
            warn!("[{}] Response not sent, closing: {}", client, e);
            match server {
                Some(server) => self.remove(&server, &transport),
                None => self.forget(&transport),
            }
        }
        result
    }

    pub fn local_endpoint(&self) -> Option<Endpoint> {
        self.inner
            .state
            .lock()
            .server
            .as_ref()
            .and_then(|s| s.local_endpoint())
    }

    /// Connections currently being served
    pub fn session_count(&self) -> usize {
        self.inner.state.lock().sessions.len()
    }

    fn is_serving(&self, server: &ServerTransport) -> bool {
        self.inner.state.lock().server.as_ref() == Some(server)
    }

    fn remove(&self, server: &ServerTransport, client: &ClientTransport) {
        server.reclaim_client(client.id());
        self.forget(client);
    }

    fn forget(&self, client: &ClientTransport) {
        if self.inner.state.lock().sessions.remove(&client.id()).is_some() {
            debug!("[{}] HTTP session removed", client.id());
        }
        client.stop();
    }

    fn on_data(&self, server: &ServerTransport, client: &ClientTransport, data: &[u8]) {
        let outcome = {
            let mut state = self.inner.state.lock();
            let Some(connection) = state.sessions.get_mut(&client.id()) else {
                return;
            };
            match connection.session.on_data(data) {
                Ok(SessionState::RequestReady) => connection.session.take_request().map(Some),
                Ok(SessionState::Error) => {
                    Err(Error::Protocol("malformed request".into()))
                }
                Ok(_) => Ok(None),
                Err(e) => Err(e),
            }
        };

        match outcome {
            Ok(Some(request)) => {
                metrics::HTTP_REQUESTS.inc();
                debug!("[{}] {:?} {}", client.id(), request.method, request.uri);
                self.inner
                    .handler
                    .on_http_request_received(self, client.id(), request);
            }
            Ok(None) => {}
            Err(e) => {
                warn!("[{}] Closing connection: {}", client.id(), e);
                metrics::PROTOCOL_ERRORS.inc();
                self.remove(server, client);
            }
        }
    }

    fn on_send_complete(&self, server: &ServerTransport, client: &ClientTransport) {
        let result = self
            .inner
            .state
            .lock()
            .sessions
            .get_mut(&client.id())
            .map(|c| c.session.on_send_complete());
        if let Some(Err(e)) = result {
            warn!("[{}] {}", client.id(), e);
            metrics::PROTOCOL_ERRORS.inc();
        }
        self.remove(server, client);
    }
}

async fn service_loop(
    service: HttpServer,
    server: ServerTransport,
    events: EventChannel,
    mut rx: mpsc::UnboundedReceiver<TransportEvent>,
) {
    while let Some(event) = rx.recv().await {
        match event {
            TransportEvent::Spawned(client) => {
                if !service.is_serving(&server) {
                    server.reclaim_client(client.id());
                    client.stop();
                    continue;
                }
                let session = HttpSession::new(client.id(), service.inner.limits);
                service.inner.state.lock().sessions.insert(
                    client.id(),
                    Connection {
                        client: client.clone(),
                        session,
                    },
                );
                if let Err(e) = client.start(Arc::new(events.clone())) {
                    warn!("[{}] Cannot start HTTP session: {}", client.id(), e);
                    service.remove(&server, &client);
                }
            }
            TransportEvent::Connected(client, remote) => {
                debug!("[{}] HTTP connection from {}", client.id(), remote);
            }
            TransportEvent::DataReceived(client, data) => {
                service.on_data(&server, &client, &data);
            }
            TransportEvent::SendComplete(client) => {
                service.on_send_complete(&server, &client);
            }
            TransportEvent::Disconnected(client, e) => {
                debug!("[{}] HTTP connection lost: {}", client.id(), e);
                service.remove(&server, &client);
            }
            TransportEvent::ReadTimeout(client) | TransportEvent::Terminated(client) => {
                service.remove(&server, &client);
            }
            TransportEvent::ConnectFailed(..) => {}
            TransportEvent::ServerTerminated => break,
        }
    }

    debug!("HttpServer loop on {} finished", server.endpoint());
}
