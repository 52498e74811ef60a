//! Client transport - one TCP connection
//!
//! A client transport is either *accepted* (handed over by a server
//! transport with the socket already open) or an *initiator* that connects,
//! and reconnects, to a target endpoint.
//!
//! ```text
//! Idle ─start─> Connecting ─> Connected ─error─> Disconnected
//!   │               │             │                   │
//!   └──stop──┐      └────stop─────┴───────stop────────┘
//!            v                    v
//!          Closed <─drained── Terminating
//! ```
//!
//! The driver task is the only owner of the socket. It runs the reader and
//! the read timer inline and the writer as a child task; teardown waits for
//! both before `on_terminated` is reported.

use std::fmt;
use std::io::{self, ErrorKind};
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::Mutex;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tokio::time::Instant;
use tracing::{debug, trace, warn};

use crate::app::metrics;
use crate::common::{ConnectionId, Endpoint};
use crate::error::{Error, Result};

use super::{ClientListener, TransportConfig, TransportState};

/// Requests from the handle to the driver task
enum Command {
    Send(Vec<Bytes>),
    Stop,
}

/// State shared between the handle and the driver
struct Shared {
    state: TransportState,
    listener: Option<Arc<dyn ClientListener>>,
    /// Accepted socket, parked here until `start`
    stream: Option<TcpStream>,
    local: Option<Endpoint>,
    remote: Option<Endpoint>,
    /// Send-queue slots taken by writes not yet completed
    slots_in_use: usize,
    commands: Option<mpsc::UnboundedSender<Command>>,
}

struct Inner {
    id: ConnectionId,
    /// Connect target; `None` for accepted connections
    target: Option<Endpoint>,
    config: TransportConfig,
    shared: Mutex<Shared>,
    state_tx: watch::Sender<TransportState>,
}

/// Handle to one TCP connection. Cloning is cheap; all clones refer to the
/// same connection.
#[derive(Clone)]
pub struct ClientTransport {
    inner: Arc<Inner>,
}

impl ClientTransport {
    /// Wrap an already-accepted connection
    pub fn accepted(stream: TcpStream, config: TransportConfig) -> Self {
        let remote = stream.peer_addr().ok().map(Endpoint::from);
        let local = stream.local_addr().ok().map(Endpoint::from);
        Self::build(None, Some(stream), local, remote, config)
    }

    /// Create an outbound connector for `target`
    pub fn initiator(target: Endpoint, config: TransportConfig) -> Self {
        Self::build(Some(target), None, None, None, config)
    }

    fn build(
        target: Option<Endpoint>,
        stream: Option<TcpStream>,
        local: Option<Endpoint>,
        remote: Option<Endpoint>,
        config: TransportConfig,
    ) -> Self {
        let (state_tx, _) = watch::channel(TransportState::Idle);
        Self {
            inner: Arc::new(Inner {
                id: ConnectionId::next(),
                target,
                config,
                shared: Mutex::new(Shared {
                    state: TransportState::Idle,
                    listener: None,
                    stream,
                    local,
                    remote,
                    slots_in_use: 0,
                    commands: None,
                }),
                state_tx,
            }),
        }
    }

    pub fn id(&self) -> ConnectionId {
        self.inner.id
    }

    pub fn is_initiator(&self) -> bool {
        self.inner.target.is_some()
    }

    pub fn state(&self) -> TransportState {
        self.inner.shared.lock().state
    }

    pub fn config(&self) -> &TransportConfig {
        &self.inner.config
    }

    /// Connect target of an initiator
    pub fn target(&self) -> Option<&Endpoint> {
        self.inner.target.as_ref()
    }

    pub fn local_endpoint(&self) -> Option<Endpoint> {
        self.inner.shared.lock().local.clone()
    }

    pub fn remote_endpoint(&self) -> Option<Endpoint> {
        self.inner.shared.lock().remote.clone()
    }

    /// Register the listener and start the connection driver.
    ///
    /// Must be called inside a tokio runtime. Fails with
    /// `Error::AlreadyStarted` unless the transport is `Idle`.
    pub fn start(&self, listener: Arc<dyn ClientListener>) -> Result<()> {
        let (tx, rx) = mpsc::unbounded_channel();

        let accepted = {
            let mut shared = self.inner.shared.lock();
            if shared.state != TransportState::Idle {
                warn!("[{}] start called in state {:?}", self.id(), shared.state);
                return Err(Error::AlreadyStarted);
            }

            let accepted = if self.is_initiator() {
                None
            } else {
                let stream = shared
                    .stream
                    .take()
                    .ok_or_else(|| Error::invalid_state("accepted socket", "no socket"))?;
                Some(stream)
            };

            shared.listener = Some(listener.clone());
            shared.commands = Some(tx);
            shared.slots_in_use = 0;
            let next = if accepted.is_some() {
                TransportState::Connected
            } else {
                TransportState::Connecting
            };
            self.set_state(&mut shared, next);
            accepted
        };

        debug!("[{}] Starting transport (initiator: {})", self.id(), self.is_initiator());

        let driver = Driver {
            client: self.clone(),
            listener,
            commands: rx,
            stopping: false,
        };
        tokio::spawn(driver.run(accepted));
        Ok(())
    }

    /// Queue one write made of `buffers`, written in order.
    ///
    /// Each buffer takes one send-queue slot until the write completes and
    /// `on_send_complete` is reported. Fails with `Error::SendQueueFull`
    /// when the buffers do not fit into the free slots; nothing is queued
    /// in that case.
    pub fn send(&self, buffers: &[Bytes]) -> Result<()> {
        if buffers.is_empty() {
            return Err(Error::Transport("empty send".into()));
        }

        let mut shared = self.inner.shared.lock();
        if shared.state != TransportState::Connected {
            return Err(Error::NotConnected);
        }

        let capacity = self.inner.config.send_buffer_count;
        if shared.slots_in_use + buffers.len() > capacity {
            return Err(Error::SendQueueFull { capacity });
        }

        let commands = shared.commands.as_ref().ok_or(Error::NotConnected)?;
        commands
            .send(Command::Send(buffers.to_vec()))
            .map_err(|_| Error::NotConnected)?;
        shared.slots_in_use += buffers.len();
        Ok(())
    }

    /// Request teardown. Idempotent.
    ///
    /// Returns immediately; the transport stays alive until its running
    /// objects have drained and `on_terminated` has been reported.
    pub fn stop(&self) {
        let mut shared = self.inner.shared.lock();
        match shared.state {
            TransportState::Idle => {
                self.set_state(&mut shared, TransportState::Closed);
            }
            TransportState::Connecting
            | TransportState::Connected
            | TransportState::Disconnected => {
                debug!("[{}] Stop requested in state {:?}", self.id(), shared.state);
                self.set_state(&mut shared, TransportState::Terminating);
                if let Some(commands) = &shared.commands {
                    let _ = commands.send(Command::Stop);
                }
            }
            TransportState::Terminating | TransportState::Closed => {}
        }
    }

    /// Return a closed transport to `Idle` so it can be started again
    pub fn reset(&self) -> Result<()> {
        let mut shared = self.inner.shared.lock();
        if shared.state != TransportState::Closed {
            return Err(Error::invalid_state("Closed", shared.state));
        }
        shared.listener = None;
        shared.commands = None;
        shared.local = None;
        shared.remote = None;
        shared.slots_in_use = 0;
        self.set_state(&mut shared, TransportState::Idle);
        Ok(())
    }

    /// Resolves once the transport is `Closed`
    pub async fn closed(&self) {
        let mut rx = self.inner.state_tx.subscribe();
        let _ = rx.wait_for(|state| *state == TransportState::Closed).await;
    }

    fn set_state(&self, shared: &mut Shared, state: TransportState) {
        trace!("[{}] {:?} -> {:?}", self.id(), shared.state, state);
        shared.state = state;
        self.inner.state_tx.send_replace(state);
    }

    /// Move to `state` unless a stop is already in progress
    fn advance(&self, state: TransportState) {
        let mut shared = self.inner.shared.lock();
        if shared.state != TransportState::Terminating {
            self.set_state(&mut shared, state);
        }
    }

    fn release_slots(&self, count: usize) {
        let mut shared = self.inner.shared.lock();
        shared.slots_in_use = shared.slots_in_use.saturating_sub(count);
    }
}

impl PartialEq for ClientTransport {
    fn eq(&self, other: &Self) -> bool {
        self.inner.id == other.inner.id
    }
}

impl Eq for ClientTransport {}

impl fmt::Debug for ClientTransport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientTransport")
            .field("id", &self.inner.id)
            .field("target", &self.inner.target)
            .finish()
    }
}

// ============================================================================
// Driver
// ============================================================================

/// How one connected phase ended
enum Served {
    Stopped,
    Lost,
}

/// How a connect sequence ended
enum Connect {
    Established(TcpStream),
    Stopped,
    GaveUp,
}

struct Driver {
    client: ClientTransport,
    listener: Arc<dyn ClientListener>,
    commands: mpsc::UnboundedReceiver<Command>,
    /// Set once a `Stop` command has been consumed
    stopping: bool,
}

impl Driver {
    async fn run(mut self, accepted: Option<TcpStream>) {
        let mut next = accepted;

        loop {
            let stream = match next.take() {
                Some(stream) => stream,
                None => match self.connect().await {
                    Connect::Established(stream) => stream,
                    Connect::Stopped => break,
                    Connect::GaveUp => {
                        debug!("[{}] Giving up connecting", self.client.id());
                        self.client.advance(TransportState::Disconnected);
                        self.wait_for_stop().await;
                        break;
                    }
                },
            };

            match self.serve(stream).await {
                Served::Stopped => break,
                Served::Lost if !self.client.is_initiator() => {
                    self.wait_for_stop().await;
                    break;
                }
                Served::Lost => {
                    let delay = self.client.inner.config.restart_delay;
                    if !self.pause(delay).await {
                        break;
                    }
                }
            }
        }

        self.finish();
    }

    /// Connect to the target, retrying after the restart delay
    async fn connect(&mut self) -> Connect {
        let Some(target) = self.client.target().cloned() else {
            return Connect::GaveUp;
        };
        let config = self.client.inner.config.clone();
        let mut failures: u32 = 0;

        loop {
            if self.stopping {
                return Connect::Stopped;
            }
            self.client.advance(TransportState::Connecting);
            debug!("[{}] Connecting to {}", self.client.id(), target);

            let attempt = tokio::time::timeout(config.connect_timeout, connect_endpoint(&target));
            let error = tokio::select! {
                result = attempt => match result {
                    Ok(Ok(stream)) => return Connect::Established(stream),
                    Ok(Err(e)) => e,
                    Err(_) => io::Error::new(ErrorKind::TimedOut, "connect timed out"),
                },
                _ = wait_for_stop(&mut self.commands, &mut self.stopping) => {
                    return Connect::Stopped;
                }
            };

            debug!("[{}] Connect to {} failed: {}", self.client.id(), target, error);
            metrics::CONNECTIONS_FAILED.inc();
            self.listener.on_connect_failed(&self.client, error);

            failures += 1;
            if let Some(max) = config.max_connect_retries {
                if failures > max {
                    return Connect::GaveUp;
                }
            }

            if !self.pause(config.restart_delay).await {
                return Connect::Stopped;
            }
        }
    }

    /// Serve one established connection until it is lost or stopped
    async fn serve(&mut self, stream: TcpStream) -> Served {
        let id = self.client.id();
        let config = self.client.inner.config.clone();

        if let Err(e) = stream.set_nodelay(config.nodelay) {
            trace!("[{}] set_nodelay failed: {}", id, e);
        }
        let local = stream.local_addr().ok().map(Endpoint::from);
        let remote = stream
            .peer_addr()
            .ok()
            .map(Endpoint::from)
            .unwrap_or_else(Endpoint::unspecified);
        {
            let mut shared = self.client.inner.shared.lock();
            shared.local = local;
            shared.remote = Some(remote.clone());
            shared.slots_in_use = 0;
        }
        self.client.advance(TransportState::Connected);

        metrics::CONNECTIONS_TOTAL.inc();
        metrics::CONNECTIONS_ACTIVE.inc();
        debug!("[{}] Connected to {}", id, remote);
        self.listener.on_connected(&self.client, &remote);

        let (mut reader, writer) = stream.into_split();
        let (write_tx, write_rx) = mpsc::unbounded_channel::<Vec<Bytes>>();
        let (done_tx, mut done_rx) = mpsc::unbounded_channel::<io::Result<usize>>();
        let mut writer_task = tokio::spawn(write_loop(writer, write_rx, done_tx));

        let mut inbuf = vec![0u8; config.inbuf_size.max(1)];
        let read_timeout = config.read_timeout;
        let timer = tokio::time::sleep(read_timeout.unwrap_or_default());
        tokio::pin!(timer);

        let outcome: io::Result<()> = loop {
            tokio::select! {
                result = reader.read(&mut inbuf) => match result {
                    Ok(0) => {
                        break Err(io::Error::new(ErrorKind::UnexpectedEof, "connection closed by peer"));
                    }
                    Ok(n) => {
                        trace!("[{}] Read {} bytes", id, n);
                        metrics::BYTES_RECEIVED.inc_by(n as u64);
                        self.listener.on_data_received(&self.client, &inbuf[..n]);
                        if let Some(period) = read_timeout {
                            timer.as_mut().reset(Instant::now() + period);
                        }
                    }
                    Err(e) => break Err(e),
                },
                Some(done) = done_rx.recv() => match done {
                    Ok(spans) => {
                        self.client.release_slots(spans);
                        self.listener.on_send_complete(&self.client);
                    }
                    Err(e) => break Err(e),
                },
                command = self.commands.recv() => match command {
                    Some(Command::Send(buffers)) => {
                        let _ = write_tx.send(buffers);
                    }
                    Some(Command::Stop) | None => {
                        self.stopping = true;
                        break Ok(());
                    }
                },
                () = &mut timer, if read_timeout.is_some() => {
                    debug!("[{}] Read timeout", id);
                    self.listener.on_read_timeout(&self.client);
                    if let Some(period) = read_timeout {
                        timer.as_mut().reset(Instant::now() + period);
                    }
                }
            }
        };

        metrics::CONNECTIONS_ACTIVE.dec();

        match outcome {
            Ok(()) => {
                // Graceful bye: flush what is queued, then half-close.
                drop(write_tx);
                drop(reader);
                if tokio::time::timeout(config.close_grace, &mut writer_task)
                    .await
                    .is_err()
                {
                    debug!("[{}] Close grace period elapsed, aborting writer", id);
                    writer_task.abort();
                    let _ = writer_task.await;
                }
                while let Ok(done) = done_rx.try_recv() {
                    if let Ok(spans) = done {
                        self.client.release_slots(spans);
                        self.listener.on_send_complete(&self.client);
                    }
                }
                Served::Stopped
            }
            Err(error) => {
                writer_task.abort();
                let _ = writer_task.await;
                drop(reader);

                {
                    let mut shared = self.client.inner.shared.lock();
                    shared.slots_in_use = 0;
                    if shared.state != TransportState::Terminating {
                        self.client.set_state(&mut shared, TransportState::Disconnected);
                    }
                }
                self.discard_stale_commands();

                debug!("[{}] Disconnected: {}", id, error);
                self.listener.on_disconnected(&self.client, error);
                Served::Lost
            }
        }
    }

    /// Drop writes queued for a connection that is gone, remembering a stop
    fn discard_stale_commands(&mut self) {
        while let Ok(command) = self.commands.try_recv() {
            match command {
                Command::Send(_) => trace!("[{}] Dropping stale write", self.client.id()),
                Command::Stop => self.stopping = true,
            }
        }
    }

    async fn wait_for_stop(&mut self) {
        wait_for_stop(&mut self.commands, &mut self.stopping).await;
    }

    /// Sleep for `delay`; returns false if stopped meanwhile
    async fn pause(&mut self, delay: std::time::Duration) -> bool {
        if self.stopping {
            return false;
        }
        tokio::select! {
            _ = tokio::time::sleep(delay) => true,
            _ = wait_for_stop(&mut self.commands, &mut self.stopping) => false,
        }
    }

    fn finish(self) {
        {
            let mut shared = self.client.inner.shared.lock();
            shared.listener = None;
            shared.commands = None;
            shared.slots_in_use = 0;
            self.client.set_state(&mut shared, TransportState::Closed);
        }
        debug!("[{}] Terminated", self.client.id());
        self.listener.on_terminated(&self.client);
    }
}

/// Wait until a `Stop` arrives, discarding writes meant for a dead socket
async fn wait_for_stop(commands: &mut mpsc::UnboundedReceiver<Command>, stopping: &mut bool) {
    if *stopping {
        return;
    }
    loop {
        match commands.recv().await {
            Some(Command::Send(_)) => continue,
            Some(Command::Stop) | None => {
                *stopping = true;
                return;
            }
        }
    }
}

async fn connect_endpoint(endpoint: &Endpoint) -> io::Result<TcpStream> {
    match endpoint {
        Endpoint::Socket(addr) => TcpStream::connect(addr).await,
        Endpoint::Host(host, port) => TcpStream::connect((host.as_str(), *port)).await,
    }
}

/// Writer half: one batch per `send` call, then half-close when the batch
/// channel is closed
async fn write_loop(
    mut writer: OwnedWriteHalf,
    mut batches: mpsc::UnboundedReceiver<Vec<Bytes>>,
    done: mpsc::UnboundedSender<io::Result<usize>>,
) {
    while let Some(buffers) = batches.recv().await {
        let mut result = Ok(buffers.len());
        for buffer in &buffers {
            if let Err(e) = writer.write_all(buffer).await {
                result = Err(e);
                break;
            }
            metrics::BYTES_SENT.inc_by(buffer.len() as u64);
        }
        let failed = result.is_err();
        let _ = done.send(result);
        if failed {
            return;
        }
    }

    let _ = writer.shutdown().await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::{EventChannel, TransportEvent};
    use std::time::Duration;
    use tokio::net::TcpListener;
    use tokio::sync::mpsc::UnboundedReceiver;

    async fn next_event(rx: &mut UnboundedReceiver<TransportEvent>) -> TransportEvent {
        tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("timed out waiting for event")
            .expect("event channel closed")
    }

    /// Initiator connected to a plain tokio listener; returns the peer socket
    async fn connected_pair(
        config: TransportConfig,
    ) -> (ClientTransport, UnboundedReceiver<TransportEvent>, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let client = ClientTransport::initiator(Endpoint::from(addr), config);
        let (events, mut rx) = EventChannel::new();
        client.start(Arc::new(events)).unwrap();

        let (peer, _) = listener.accept().await.unwrap();
        match next_event(&mut rx).await {
            TransportEvent::Connected(c, remote) => {
                assert_eq!(c, client);
                assert_eq!(remote, Endpoint::from(addr));
            }
            other => panic!("unexpected event: {:?}", other),
        }
        (client, rx, peer)
    }

    #[tokio::test]
    async fn test_start_twice_fails() {
        let (client, _rx, _peer) = connected_pair(TransportConfig::default()).await;
        let (events, _rx2) = EventChannel::new();
        assert!(matches!(
            client.start(Arc::new(events)),
            Err(Error::AlreadyStarted)
        ));
        client.stop();
        client.closed().await;
    }

    #[tokio::test]
    async fn test_stop_idle_and_reset() {
        let client = ClientTransport::initiator(Endpoint::localhost(1), TransportConfig::default());
        assert_eq!(client.state(), TransportState::Idle);
        assert!(client.reset().is_err());

        client.stop();
        assert_eq!(client.state(), TransportState::Closed);
        client.stop();
        assert_eq!(client.state(), TransportState::Closed);

        client.reset().unwrap();
        assert_eq!(client.state(), TransportState::Idle);
        assert_eq!(client.target(), Some(&Endpoint::localhost(1)));
    }

    #[tokio::test]
    async fn test_send_requires_connection() {
        let client = ClientTransport::initiator(Endpoint::localhost(1), TransportConfig::default());
        let result = client.send(&[Bytes::from_static(b"x")]);
        assert!(matches!(result, Err(Error::NotConnected)));
    }

    #[tokio::test]
    async fn test_send_queue_capacity() {
        let (client, mut rx, mut peer) = connected_pair(TransportConfig::default()).await;

        // Three spans never fit into two slots
        let three = [
            Bytes::from_static(b"a"),
            Bytes::from_static(b"b"),
            Bytes::from_static(b"c"),
        ];
        assert!(matches!(
            client.send(&three),
            Err(Error::SendQueueFull { capacity: 2 })
        ));

        // The driver cannot run between these calls on the test runtime
        client.send(&[Bytes::from_static(b"one")]).unwrap();
        client.send(&[Bytes::from_static(b"two")]).unwrap();
        assert!(matches!(
            client.send(&[Bytes::from_static(b"three")]),
            Err(Error::SendQueueFull { capacity: 2 })
        ));

        let mut completed = 0;
        while completed < 2 {
            if let TransportEvent::SendComplete(_) = next_event(&mut rx).await {
                completed += 1;
            }
        }

        let mut buf = [0u8; 6];
        peer.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"onetwo");

        // Slots are free again
        client.send(&[Bytes::from_static(b"x")]).unwrap();

        client.stop();
        client.closed().await;
    }

    #[tokio::test]
    async fn test_send_queue_depth_one() {
        let config = TransportConfig::default().with_send_buffer_count(1);
        let (client, _rx, _peer) = connected_pair(config).await;

        client.send(&[Bytes::from_static(b"one")]).unwrap();
        assert!(matches!(
            client.send(&[Bytes::from_static(b"two")]),
            Err(Error::SendQueueFull { capacity: 1 })
        ));

        client.stop();
        client.closed().await;
    }

    #[tokio::test]
    async fn test_stop_terminates_exactly_once() {
        let (client, mut rx, _peer) = connected_pair(TransportConfig::default()).await;

        client.send(&[Bytes::from_static(b"in flight")]).unwrap();
        client.stop();
        client.stop();
        assert_eq!(client.state(), TransportState::Terminating);

        let mut terminated = 0;
        loop {
            match next_event(&mut rx).await {
                TransportEvent::Terminated(_) => {
                    terminated += 1;
                    break;
                }
                TransportEvent::SendComplete(_) => {}
                other => panic!("unexpected event: {:?}", other),
            }
        }
        assert_eq!(client.state(), TransportState::Closed);

        client.stop();
        tokio::time::sleep(Duration::from_millis(50)).await;
        while let Ok(event) = rx.try_recv() {
            if let TransportEvent::Terminated(_) = event {
                terminated += 1;
            }
        }
        assert_eq!(terminated, 1);
    }

    #[tokio::test]
    async fn test_graceful_stop_flushes_and_half_closes() {
        let (client, mut rx, mut peer) = connected_pair(TransportConfig::default()).await;

        client.send(&[Bytes::from_static(b"bye")]).unwrap();
        client.stop();

        let mut received = Vec::new();
        peer.read_to_end(&mut received).await.unwrap();
        assert_eq!(received, b"bye");

        loop {
            if let TransportEvent::Terminated(_) = next_event(&mut rx).await {
                break;
            }
        }
    }

    #[tokio::test]
    async fn test_peer_close_disconnects_until_stopped() {
        let (client, mut rx, peer) = connected_pair(
            TransportConfig::default().with_max_connect_retries(Some(0)),
        )
        .await;
        drop(peer);

        match next_event(&mut rx).await {
            TransportEvent::Disconnected(_, error) => {
                assert_eq!(error.kind(), ErrorKind::UnexpectedEof);
            }
            other => panic!("unexpected event: {:?}", other),
        }
        assert!(client.send(&[Bytes::from_static(b"late")]).is_err());

        client.stop();
        loop {
            if let TransportEvent::Terminated(_) = next_event(&mut rx).await {
                break;
            }
        }
        assert_eq!(client.state(), TransportState::Closed);
    }

    #[tokio::test]
    async fn test_initiator_reconnects_after_lost_connection() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let config = TransportConfig::default().with_restart_delay(Duration::from_millis(20));
        let client = ClientTransport::initiator(Endpoint::from(addr), config);
        let (events, mut rx) = EventChannel::new();
        client.start(Arc::new(events)).unwrap();

        let (first, _) = listener.accept().await.unwrap();
        assert!(matches!(next_event(&mut rx).await, TransportEvent::Connected(..)));
        drop(first);
        assert!(matches!(next_event(&mut rx).await, TransportEvent::Disconnected(..)));

        let (mut second, _) = tokio::time::timeout(Duration::from_secs(5), listener.accept())
            .await
            .unwrap()
            .unwrap();
        match next_event(&mut rx).await {
            TransportEvent::Connected(c, remote) => {
                assert_eq!(c, client);
                assert_eq!(remote, Endpoint::from(addr));
            }
            other => panic!("unexpected event: {:?}", other),
        }
        assert_eq!(client.state(), TransportState::Connected);

        client.send(&[Bytes::from_static(b"again")]).unwrap();
        let mut received = [0u8; 5];
        second.read_exact(&mut received).await.unwrap();
        assert_eq!(&received, b"again");

        client.stop();
        client.closed().await;
    }

    #[tokio::test]
    async fn test_read_timeout_keeps_connection() {
        let config = TransportConfig::default().with_read_timeout(Some(Duration::from_millis(50)));
        let (client, mut rx, _peer) = connected_pair(config).await;

        match next_event(&mut rx).await {
            TransportEvent::ReadTimeout(c) => assert_eq!(c, client),
            other => panic!("unexpected event: {:?}", other),
        }
        assert_eq!(client.state(), TransportState::Connected);

        client.stop();
        client.closed().await;
    }

    #[tokio::test]
    async fn test_initiator_retries_then_gives_up() {
        // Grab a free port and release it so connects are refused
        let port = {
            let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
            listener.local_addr().unwrap().port()
        };

        let config = TransportConfig::default()
            .with_restart_delay(Duration::from_millis(10))
            .with_max_connect_retries(Some(1));
        let client = ClientTransport::initiator(Endpoint::localhost(port), config);
        let (events, mut rx) = EventChannel::new();
        client.start(Arc::new(events)).unwrap();

        for _ in 0..2 {
            match next_event(&mut rx).await {
                TransportEvent::ConnectFailed(c, _) => assert_eq!(c, client),
                other => panic!("unexpected event: {:?}", other),
            }
        }

        let mut rx_state = client.inner.state_tx.subscribe();
        let _ = tokio::time::timeout(
            Duration::from_secs(5),
            rx_state.wait_for(|s| *s == TransportState::Disconnected),
        )
        .await
        .unwrap();

        client.stop();
        match next_event(&mut rx).await {
            TransportEvent::Terminated(c) => assert_eq!(c, client),
            other => panic!("unexpected event: {:?}", other),
        }

        client.reset().unwrap();
        assert_eq!(client.state(), TransportState::Idle);
        assert!(client.remote_endpoint().is_none());
    }
}
