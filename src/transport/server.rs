//! Server transport - TCP acceptor
//!
//! Accepts connections and hands each one to the listener as an accepted
//! `ClientTransport`. Spawned clients stay in a registry until the owner
//! reclaims them; the acceptor never starts or stops them on its own.

use std::collections::HashMap;
use std::fmt;
use std::net::{SocketAddr, ToSocketAddrs};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::net::TcpListener;
use tokio::sync::{broadcast, watch};
use tracing::{debug, error, info, warn};

use crate::common::{ConnectionId, Endpoint};
use crate::error::{Error, Result};

use super::{ClientTransport, ServerListener, ServerState, TransportConfig};

struct Shared {
    state: ServerState,
    local: Option<Endpoint>,
    /// Spawned clients not yet reclaimed
    clients: HashMap<ConnectionId, ClientTransport>,
    shutdown_tx: Option<broadcast::Sender<()>>,
    spawned: u64,
}

struct Inner {
    endpoint: Endpoint,
    client_config: TransportConfig,
    shared: Mutex<Shared>,
    state_tx: watch::Sender<ServerState>,
}

impl Drop for Inner {
    fn drop(&mut self) {
        let clients: Vec<_> = self.shared.get_mut().clients.drain().map(|(_, c)| c).collect();
        if !clients.is_empty() {
            warn!(
                "[{}] Server dropped with {} unreclaimed clients, stopping them",
                self.endpoint,
                clients.len()
            );
            for client in clients {
                client.stop();
            }
        }
    }
}

/// Handle to a TCP acceptor. Cloning is cheap.
#[derive(Clone)]
pub struct ServerTransport {
    inner: Arc<Inner>,
}

impl ServerTransport {
    /// Acceptor for `endpoint`; spawned clients get `client_config`
    pub fn new(endpoint: Endpoint, client_config: TransportConfig) -> Self {
        let (state_tx, _) = watch::channel(ServerState::Idle);
        Self {
            inner: Arc::new(Inner {
                endpoint,
                client_config,
                shared: Mutex::new(Shared {
                    state: ServerState::Idle,
                    local: None,
                    clients: HashMap::new(),
                    shutdown_tx: None,
                    spawned: 0,
                }),
                state_tx,
            }),
        }
    }

    pub fn state(&self) -> ServerState {
        self.inner.shared.lock().state
    }

    /// Configured listen endpoint
    pub fn endpoint(&self) -> &Endpoint {
        &self.inner.endpoint
    }

    /// Bound address, including an ephemeral port, once listening
    pub fn local_endpoint(&self) -> Option<Endpoint> {
        self.inner.shared.lock().local.clone()
    }

    /// Connections accepted since construction
    pub fn spawned_count(&self) -> u64 {
        self.inner.shared.lock().spawned
    }

    /// Spawned clients not reclaimed yet
    pub fn client_count(&self) -> usize {
        self.inner.shared.lock().clients.len()
    }

    /// Bind and start accepting.
    ///
    /// A bind failure is not returned: the server goes straight to `Closed`
    /// and `on_terminated` is reported from a separate task.
    pub fn start(&self, listener: Arc<dyn ServerListener>) -> Result<()> {
        self.ensure_idle()?;

        // Name resolution may block; keep it outside the lock.
        let bound = resolve(&self.inner.endpoint).and_then(listen);

        let mut shared = self.inner.shared.lock();
        if shared.state != ServerState::Idle {
            warn!("[{}] start called in state {:?}", self.inner.endpoint, shared.state);
            return Err(Error::AlreadyStarted);
        }

        match bound {
            Ok(acceptor) => {
                shared.local = acceptor.local_addr().ok().map(Endpoint::from);
                let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
                shared.shutdown_tx = Some(shutdown_tx);
                self.set_state(&mut shared, ServerState::Listening);
                info!(
                    "[{}] Listening on {}",
                    self.inner.endpoint,
                    shared.local.as_ref().unwrap_or(&self.inner.endpoint)
                );
                drop(shared);

                tokio::spawn(accept_loop(self.clone(), acceptor, listener, shutdown_rx));
            }
            Err(e) => {
                error!("[{}] Bind failed: {}", self.inner.endpoint, e);
                self.set_state(&mut shared, ServerState::Closed);
                drop(shared);

                let server = self.clone();
                tokio::spawn(async move {
                    listener.on_terminated(&server);
                });
            }
        }
        Ok(())
    }

    fn ensure_idle(&self) -> Result<()> {
        let state = self.state();
        if state != ServerState::Idle {
            warn!("[{}] start called in state {:?}", self.inner.endpoint, state);
            return Err(Error::AlreadyStarted);
        }
        Ok(())
    }

    /// Stop accepting. Idempotent. Spawned clients are left running.
    pub fn stop(&self) {
        let mut shared = self.inner.shared.lock();
        match shared.state {
            ServerState::Idle => self.set_state(&mut shared, ServerState::Closed),
            ServerState::Listening => {
                debug!("[{}] Stop requested", self.inner.endpoint);
                self.set_state(&mut shared, ServerState::Terminating);
                if let Some(tx) = shared.shutdown_tx.take() {
                    let _ = tx.send(());
                }
            }
            ServerState::Terminating | ServerState::Closed => {}
        }
    }

    /// Take ownership of a spawned client back from the registry.
    /// The client is not stopped.
    pub fn reclaim_client(&self, id: ConnectionId) -> Option<ClientTransport> {
        self.inner.shared.lock().clients.remove(&id)
    }

    /// Stop and forget every spawned client still registered
    pub fn stop_clients(&self) {
        let clients: Vec<_> = self
            .inner
            .shared
            .lock()
            .clients
            .drain()
            .map(|(_, c)| c)
            .collect();
        for client in clients {
            client.stop();
        }
    }

    pub fn reset(&self) -> Result<()> {
        let mut shared = self.inner.shared.lock();
        if shared.state != ServerState::Closed {
            return Err(Error::invalid_state("Closed", shared.state));
        }
        shared.local = None;
        self.set_state(&mut shared, ServerState::Idle);
        Ok(())
    }

    /// Resolves once the acceptor is `Closed`
    pub async fn closed(&self) {
        let mut rx = self.inner.state_tx.subscribe();
        let _ = rx.wait_for(|state| *state == ServerState::Closed).await;
    }

    fn set_state(&self, shared: &mut Shared, state: ServerState) {
        shared.state = state;
        self.inner.state_tx.send_replace(state);
    }
}

impl PartialEq for ServerTransport {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl Eq for ServerTransport {}

impl fmt::Debug for ServerTransport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServerTransport")
            .field("endpoint", &self.inner.endpoint)
            .finish()
    }
}

fn resolve(endpoint: &Endpoint) -> Result<SocketAddr> {
    match endpoint {
        Endpoint::Socket(addr) => Ok(*addr),
        Endpoint::Host(host, port) => (host.as_str(), *port)
            .to_socket_addrs()?
            .next()
            .ok_or_else(|| Error::Config(format!("Cannot resolve listen address {}", endpoint))),
    }
}

/// Bind synchronously so the bound port is known when `start` returns
fn listen(addr: SocketAddr) -> Result<TcpListener> {
    let std_listener = std::net::TcpListener::bind(addr)?;
    std_listener.set_nonblocking(true)?;
    Ok(TcpListener::from_std(std_listener)?)
}

async fn accept_loop(
    server: ServerTransport,
    acceptor: TcpListener,
    listener: Arc<dyn ServerListener>,
    mut shutdown_rx: broadcast::Receiver<()>,
) {
    let tag = server.inner.endpoint.clone();

    loop {
        tokio::select! {
            result = acceptor.accept() => match result {
                Ok((stream, peer)) => {
                    let client = ClientTransport::accepted(stream, server.inner.client_config.clone());
                    debug!("[{}] New connection {} from {}", tag, client.id(), peer);
                    {
                        let mut shared = server.inner.shared.lock();
                        shared.clients.insert(client.id(), client.clone());
                        shared.spawned += 1;
                    }
                    listener.on_spawned(&server, client);
                }
                Err(e) => {
                    error!("[{}] Accept error: {}", tag, e);
                }
            },
            _ = shutdown_rx.recv() => break,
        }
    }

    drop(acceptor);
    let spawned = {
        let mut shared = server.inner.shared.lock();
        server.set_state(&mut shared, ServerState::Closed);
        shared.spawned
    };
    info!("[{}] Shutting down (accepted {} connections)", tag, spawned);
    listener.on_terminated(&server);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::{EventChannel, TransportEvent, TransportState};
    use bytes::Bytes;
    use std::time::Duration;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpStream;
    use tokio::sync::mpsc::UnboundedReceiver;

    async fn next_event(rx: &mut UnboundedReceiver<TransportEvent>) -> TransportEvent {
        tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("timed out waiting for event")
            .expect("event channel closed")
    }

    fn started_server() -> (ServerTransport, EventChannel, UnboundedReceiver<TransportEvent>) {
        let server = ServerTransport::new(Endpoint::localhost(0), TransportConfig::default());
        let (events, rx) = EventChannel::new();
        server.start(Arc::new(events.clone())).unwrap();
        (server, events, rx)
    }

    #[tokio::test]
    async fn test_listen_on_ephemeral_port() {
        let (server, _events, mut rx) = started_server();
        assert_eq!(server.state(), ServerState::Listening);
        let local = server.local_endpoint().unwrap();
        assert_ne!(local.port(), 0);

        let (events, _rx2) = EventChannel::new();
        assert!(matches!(
            server.start(Arc::new(events)),
            Err(Error::AlreadyStarted)
        ));

        server.stop();
        server.stop();
        assert!(matches!(next_event(&mut rx).await, TransportEvent::ServerTerminated));
        assert_eq!(server.state(), ServerState::Closed);

        server.reset().unwrap();
        assert_eq!(server.state(), ServerState::Idle);
    }

    #[tokio::test]
    async fn test_bind_failure_reports_terminated() {
        let (first, _events, _rx) = started_server();
        let taken = first.local_endpoint().unwrap();

        let second = ServerTransport::new(taken, TransportConfig::default());
        let (events, mut rx) = EventChannel::new();
        second.start(Arc::new(events)).unwrap();
        assert_eq!(second.state(), ServerState::Closed);
        assert!(matches!(next_event(&mut rx).await, TransportEvent::ServerTerminated));

        first.stop();
        first.closed().await;
    }

    #[tokio::test]
    async fn test_spawned_client_delivers_bytes_in_order() {
        let (server, events, mut rx) = started_server();
        let addr = server.local_endpoint().unwrap().as_socket().unwrap();

        let mut peer = TcpStream::connect(addr).await.unwrap();

        let client = match next_event(&mut rx).await {
            TransportEvent::Spawned(client) => client,
            other => panic!("unexpected event: {:?}", other),
        };
        assert!(!client.is_initiator());
        assert_eq!(client.state(), TransportState::Idle);
        assert_eq!(server.client_count(), 1);
        assert_eq!(server.spawned_count(), 1);

        client.start(Arc::new(events.clone())).unwrap();
        assert!(matches!(next_event(&mut rx).await, TransportEvent::Connected(..)));

        peer.write_all(b"0123456789").await.unwrap();
        let mut received = Vec::new();
        while received.len() < 10 {
            match next_event(&mut rx).await {
                TransportEvent::DataReceived(c, data) => {
                    assert_eq!(c, client);
                    received.extend_from_slice(&data);
                }
                other => panic!("unexpected event: {:?}", other),
            }
        }
        assert_eq!(received, b"0123456789");

        client.send(&[Bytes::from_static(b"ack")]).unwrap();
        let mut reply = [0u8; 3];
        peer.read_exact(&mut reply).await.unwrap();
        assert_eq!(&reply, b"ack");

        let reclaimed = server.reclaim_client(client.id()).unwrap();
        assert_eq!(reclaimed, client);
        assert!(server.reclaim_client(client.id()).is_none());
        assert_eq!(server.client_count(), 0);

        reclaimed.stop();
        reclaimed.closed().await;
        server.stop();
        server.closed().await;
    }

    #[tokio::test]
    async fn test_initiator_to_spawned_client() {
        let (server, events, mut rx) = started_server();
        let local = server.local_endpoint().unwrap();

        let initiator = ClientTransport::initiator(local, TransportConfig::default());
        let (initiator_events, mut initiator_rx) = EventChannel::new();
        initiator.start(Arc::new(initiator_events)).unwrap();

        let spawned = match next_event(&mut rx).await {
            TransportEvent::Spawned(client) => client,
            other => panic!("unexpected event: {:?}", other),
        };
        spawned.start(Arc::new(events.clone())).unwrap();
        assert!(matches!(next_event(&mut rx).await, TransportEvent::Connected(..)));
        assert!(matches!(
            next_event(&mut initiator_rx).await,
            TransportEvent::Connected(..)
        ));

        initiator.send(&[Bytes::from_static(b"0123456789")]).unwrap();

        let mut received = Vec::new();
        while received.len() < 10 {
            match next_event(&mut rx).await {
                TransportEvent::DataReceived(c, data) => {
                    assert_eq!(c, spawned);
                    received.extend_from_slice(&data);
                }
                other => panic!("unexpected event: {:?}", other),
            }
        }
        assert_eq!(received, b"0123456789");

        initiator.stop();
        assert!(matches!(
            next_event(&mut rx).await,
            TransportEvent::Disconnected(..)
        ));

        server.stop_clients();
        assert!(matches!(next_event(&mut rx).await, TransportEvent::Terminated(c) if c == spawned));
        initiator.closed().await;
        server.stop();
        server.closed().await;
    }

    #[tokio::test]
    async fn test_stop_clients() {
        let (server, _events, mut rx) = started_server();
        let addr = server.local_endpoint().unwrap().as_socket().unwrap();

        let _peer = TcpStream::connect(addr).await.unwrap();
        let client = match next_event(&mut rx).await {
            TransportEvent::Spawned(client) => client,
            other => panic!("unexpected event: {:?}", other),
        };

        server.stop_clients();
        assert_eq!(server.client_count(), 0);
        assert_eq!(client.state(), TransportState::Closed);

        server.stop();
        server.closed().await;
    }

    #[tokio::test]
    async fn test_drop_stops_unreclaimed_clients() {
        let (server, events, mut rx) = started_server();
        let addr = server.local_endpoint().unwrap().as_socket().unwrap();

        let _peer = TcpStream::connect(addr).await.unwrap();
        let client = match next_event(&mut rx).await {
            TransportEvent::Spawned(client) => client,
            other => panic!("unexpected event: {:?}", other),
        };
        assert_eq!(server.client_count(), 1);

        server.stop();
        server.closed().await;
        assert!(matches!(next_event(&mut rx).await, TransportEvent::ServerTerminated));
        assert_eq!(client.state(), TransportState::Idle);

        // The accept task holds the last other handle until it returns
        drop(server);
        drop(events);
        for _ in 0..500 {
            if client.state() == TransportState::Closed {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(client.state(), TransportState::Closed);
    }
}
