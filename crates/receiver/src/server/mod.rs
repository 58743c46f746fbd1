//! Built-in mirroring protocol server.
//!
//! [`MirrorServer`] accepts TCP connections and runs one connection worker
//! per device. [`BuiltinBackend`] wraps it as a [`MirroringBackend`].

pub mod http;

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use protocol::{LongTermIdentity, PairingStore};
use tokio::net::{TcpListener, ToSocketAddrs};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::Instrument;

use crate::backend::MirroringBackend;
use crate::config::ReceiverConfig;
use crate::registry::StreamRegistry;
use crate::session::{serve_connection, SessionContext, SessionController, SessionEnd};

pub use http::{HttpError, Request, RequestCodec, Response};

/// Pause after a failed accept, so a full file table does not spin the loop.
const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

/// TCP listener for mirroring devices.
pub struct MirrorServer {
    listener: TcpListener,
    ctx: Arc<SessionContext>,
    max_request_size: usize,
    tracker: TaskTracker,
}

impl MirrorServer {
    /// Binds the listener.
    pub async fn bind<A: ToSocketAddrs>(
        addr: A,
        ctx: Arc<SessionContext>,
        max_request_size: usize,
    ) -> io::Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        Ok(Self {
            listener,
            ctx,
            max_request_size,
            tracker: TaskTracker::new(),
        })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Returns the number of live connections.
    pub fn active_connections(&self) -> usize {
        self.tracker.len()
    }

    /// Accepts connections until `shutdown` is cancelled, then waits for
    /// every connection worker to finish.
    pub async fn serve(self, shutdown: CancellationToken) -> io::Result<()> {
        tracing::info!(addr = %self.local_addr()?, "Mirroring server listening");

        loop {
            let accepted = tokio::select! {
                _ = shutdown.cancelled() => break,
                accepted = self.listener.accept() => accepted,
            };

            let (stream, peer) = match accepted {
                Ok(accepted) => accepted,
                Err(e) => {
                    tracing::warn!(error = %e, "Failed to accept connection");
                    tokio::time::sleep(ACCEPT_BACKOFF).await;
                    continue;
                }
            };
            if let Err(e) = stream.set_nodelay(true) {
                tracing::debug!(peer = %peer, error = %e, "Failed to set TCP_NODELAY");
            }

            let controller = SessionController::new(Arc::clone(&self.ctx));
            let span = tracing::info_span!("session", session_id = %controller.id(), peer = %peer);
            let shutdown = shutdown.child_token();
            let max_request_size = self.max_request_size;

            self.tracker.spawn(
                async move {
                    tracing::debug!("Connection accepted");
                    match serve_connection(stream, controller, shutdown, max_request_size).await {
                        Ok(SessionEnd::Rejected { reason }) => {
                            tracing::info!(reason = %reason, "Session rejected")
                        }
                        Ok(end) => tracing::info!(?end, "Session ended"),
                        Err(e) => tracing::warn!(error = %e, "Session failed"),
                    }
                }
                .instrument(span),
            );
        }

        self.tracker.close();
        tracing::info!(connections = self.tracker.len(), "Waiting for sessions to end");
        self.tracker.wait().await;
        Ok(())
    }
}

/// The built-in protocol implementation as a backend.
pub struct BuiltinBackend {
    config: ReceiverConfig,
    identity: Arc<LongTermIdentity>,
    store: Arc<dyn PairingStore>,
}

impl BuiltinBackend {
    pub fn new(
        config: ReceiverConfig,
        identity: Arc<LongTermIdentity>,
        store: Arc<dyn PairingStore>,
    ) -> Self {
        Self {
            config,
            identity,
            store,
        }
    }
}

#[async_trait]
impl MirroringBackend for BuiltinBackend {
    fn name(&self) -> &'static str {
        "builtin"
    }

    async fn run(
        &self,
        registry: Arc<StreamRegistry>,
        shutdown: CancellationToken,
    ) -> anyhow::Result<()> {
        let ctx = Arc::new(SessionContext::new(
            &self.config,
            Arc::clone(&self.identity),
            Arc::clone(&self.store),
            registry,
        ));
        let server = MirrorServer::bind(
            ("0.0.0.0", self.config.port),
            ctx,
            self.config.max_request_size,
        )
        .await
        .with_context(|| format!("Failed to bind port {}", self.config.port))?;

        server.serve(shutdown).await.context("Mirroring server failed")
    }
}
