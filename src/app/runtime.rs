//! Runtime - configuration-driven service lifecycle
//!
//! Builds the services named in the configuration, starts them and keeps
//! them running until Ctrl-C or `shutdown`.

use std::sync::Arc;

use bytes::Bytes;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use crate::common::{ConnectionId, Endpoint};
use crate::config::Config;
use crate::error::Result;
use crate::service::http::{HttpMethod, HttpRequest, HttpResponse};
use crate::service::{HttpServer, HttpServerListener, TcpServer, TcpServerListener};

use super::metrics;

/// Runtime manages the service lifecycle
pub struct Runtime {
    http: Option<(Endpoint, HttpServer)>,
    tcp: Option<(Endpoint, TcpServer)>,
    shutdown_tx: broadcast::Sender<()>,
}

impl Runtime {
    /// Build runtime from configuration
    pub fn from_config(config: Config) -> Result<Self> {
        let (shutdown_tx, _) = broadcast::channel(1);

        let http = match &config.http {
            Some(http) => {
                let server = HttpServer::with_config(Arc::new(StatusHandler), http.transport_config())
                    .with_limits(http.limits());
                Some((http.listen_endpoint()?, server))
            }
            None => None,
        };

        let tcp = match &config.tcp {
            Some(tcp) => {
                let server = TcpServer::with_config(Arc::new(EchoHandler), tcp.transport_config());
                Some((tcp.listen_endpoint()?, server))
            }
            None => None,
        };

        Ok(Self {
            http,
            tcp,
            shutdown_tx,
        })
    }

    /// Start every configured service
    pub fn start(&self) -> Result<()> {
        metrics::init_metrics();

        if let Some((endpoint, server)) = &self.http {
            server.start(endpoint.clone())?;
            info!("[http] Listening on {}", server.local_endpoint().unwrap_or_else(|| endpoint.clone()));
        }
        if let Some((endpoint, server)) = &self.tcp {
            if let Err(e) = server.start(endpoint.clone()) {
                self.stop();
                return Err(e);
            }
            info!("[tcp] Listening on {}", server.local_endpoint().unwrap_or_else(|| endpoint.clone()));
        }
        Ok(())
    }

    /// Stop every service. Idempotent.
    pub fn stop(&self) {
        if let Some((_, server)) = &self.http {
            server.stop();
        }
        if let Some((_, server)) = &self.tcp {
            server.stop();
        }
    }

    /// Make `run` return
    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(());
    }

    pub fn http_endpoint(&self) -> Option<Endpoint> {
        self.http.as_ref().and_then(|(_, s)| s.local_endpoint())
    }

    pub fn tcp_endpoint(&self) -> Option<Endpoint> {
        self.tcp.as_ref().and_then(|(_, s)| s.local_endpoint())
    }

    /// Start services and wait for Ctrl-C or `shutdown`
    pub async fn run(&self) -> Result<()> {
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        self.start()?;

        tokio::select! {
            result = tokio::signal::ctrl_c() => {
                if let Err(e) = result {
                    warn!("Failed to listen for Ctrl-C: {}", e);
                }
                info!("Received Ctrl-C, shutting down...");
            }
            _ = shutdown_rx.recv() => {
                info!("Shutdown requested");
            }
        }

        self.stop();
        info!(
            "Traffic: {} received, {} sent",
            metrics::format_bytes(metrics::BYTES_RECEIVED.get()),
            metrics::format_bytes(metrics::BYTES_SENT.get())
        );
        Ok(())
    }
}

/// Status endpoints: `/`, `/health` and `/metrics`
struct StatusHandler;

impl HttpServerListener for StatusHandler {
    fn on_http_request_received(&self, server: &HttpServer, client: ConnectionId, request: HttpRequest) {
        let response = match (request.method, request.uri.as_str()) {
            (HttpMethod::Get, "/") => {
                HttpResponse::ok(format!("tcpnet v{}\n", env!("CARGO_PKG_VERSION")))
            }
            (HttpMethod::Get, "/health") => HttpResponse::ok("OK"),
            (HttpMethod::Get, "/metrics") => HttpResponse::ok(metrics::gather_text()),
            (HttpMethod::Get, _) => {
                HttpResponse::new(request.version, "404 Not Found", Bytes::new())
            }
            (HttpMethod::Unexpected, _) => {
                HttpResponse::new(request.version, "405 Method Not Allowed", Bytes::new())
            }
        };

        if let Err(e) = server.send_response(client, response) {
            warn!("[{}] Failed to send response: {}", client, e);
        }
    }
}

/// Echoes the received bytes; the channel closes once the echo is written
struct EchoHandler;

impl TcpServerListener for EchoHandler {
    fn on_channel_open(&self, _server: &TcpServer, channel: ConnectionId, remote: &Endpoint) {
        debug!("[{}] Echo channel from {}", channel, remote);
    }

    fn on_data_received(&self, server: &TcpServer, channel: ConnectionId, data: &[u8]) {
        if let Err(e) = server.send_data(channel, Bytes::copy_from_slice(data)) {
            warn!("[{}] Echo failed: {}", channel, e);
        }
    }
}
