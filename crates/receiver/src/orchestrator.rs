//! Receiver runtime wiring.
//!
//! [`ReceiverRuntime`] owns the long-lived pieces of a receiver: its
//! identity, the paired-device store, the stream registry, the mirroring
//! backend, the service advertisement and the viewer reporter. It starts
//! them together and stops them together.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use protocol::{LongTermIdentity, PairingStore};
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};

use crate::backend::select_backend;
use crate::config::Config;
use crate::devices::TrustStore;
use crate::discovery::{LoggingAdvertiser, ServiceAdvertiser, PROTOCOL_IDENTIFIERS};
use crate::registry::StreamRegistry;
use crate::viewer::{run_snapshot_reporter, GridLayout};

/// File name of the receiver identity inside the data directory.
pub const IDENTITY_FILE: &str = "identity.key";

/// Longest wait for background tasks during shutdown.
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(10);

/// Runtime state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RuntimeState {
    /// Initial state, not started.
    Stopped,
    /// Starting up, initializing components.
    Starting,
    /// Running and accepting devices.
    Running,
    /// Shutting down gracefully.
    ShuttingDown,
}

/// A receiver and everything it runs.
pub struct ReceiverRuntime {
    config: Config,
    identity: Arc<LongTermIdentity>,
    trust_store: Arc<TrustStore>,
    registry: Arc<StreamRegistry>,
    advertiser: Arc<dyn ServiceAdvertiser>,
    state: RwLock<RuntimeState>,
    shutdown_token: CancellationToken,
    tracker: TaskTracker,
}

impl ReceiverRuntime {
    /// Loads the identity and paired devices from the data directory.
    pub fn new(config: Config) -> Result<Self> {
        let data_dir = &config.receiver.data_dir;
        let identity = load_or_generate_identity(&data_dir.join(IDENTITY_FILE))?;
        info!("Receiver identity: {}", identity.identifier());

        let trust_store = TrustStore::open(data_dir).context("Failed to load trust store")?;
        let registry = StreamRegistry::new(config.registry.max_feeds);

        Ok(Self {
            config,
            identity: Arc::new(identity),
            trust_store: Arc::new(trust_store),
            registry: Arc::new(registry),
            advertiser: Arc::new(LoggingAdvertiser::new()),
            state: RwLock::new(RuntimeState::Stopped),
            shutdown_token: CancellationToken::new(),
            tracker: TaskTracker::new(),
        })
    }

    /// Replaces the service advertiser.
    pub fn with_advertiser(mut self, advertiser: Arc<dyn ServiceAdvertiser>) -> Self {
        self.advertiser = advertiser;
        self
    }

    pub fn identity(&self) -> &LongTermIdentity {
        &self.identity
    }

    pub fn registry(&self) -> Arc<StreamRegistry> {
        Arc::clone(&self.registry)
    }

    pub fn trust_store(&self) -> Arc<TrustStore> {
        Arc::clone(&self.trust_store)
    }

    pub async fn state(&self) -> RuntimeState {
        *self.state.read().await
    }

    /// Returns a token cancelled when the runtime stops or its backend fails.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown_token.clone()
    }

    /// Starts the backend, the advertisement and the viewer reporter.
    pub async fn start(&self) -> Result<()> {
        {
            let mut state = self.state.write().await;
            if *state != RuntimeState::Stopped {
                anyhow::bail!("Receiver is already running");
            }
            if self.shutdown_token.is_cancelled() {
                anyhow::bail!("Receiver cannot be restarted after stopping");
            }
            *state = RuntimeState::Starting;
        }
        info!("Starting receiver...");

        let store: Arc<dyn PairingStore> = self.trust_store.clone();
        let backend = select_backend(&self.config, Arc::clone(&self.identity), store);
        info!(backend = backend.name(), "Selected mirroring backend");

        let registry = Arc::clone(&self.registry);
        let token = self.shutdown_token.clone();
        self.tracker.spawn(async move {
            if let Err(e) = backend.run(registry, token.child_token()).await {
                error!("Mirroring backend failed: {:#}", e);
                token.cancel();
            }
        });

        let receiver = &self.config.receiver;
        if let Err(e) = self
            .advertiser
            .start(&receiver.display_name, receiver.port, PROTOCOL_IDENTIFIERS)
        {
            warn!("Failed to advertise receiver: {:#}", e);
        }

        let viewer = &self.config.viewer;
        self.tracker.spawn(run_snapshot_reporter(
            Arc::clone(&self.registry),
            GridLayout::new(viewer.grid_rows, viewer.grid_cols),
            viewer.poll_interval(),
            self.shutdown_token.child_token(),
        ));
        debug!("Started viewer reporter");

        *self.state.write().await = RuntimeState::Running;
        info!("Receiver started");
        Ok(())
    }

    /// Stops everything and waits for sessions to end.
    pub async fn stop(&self) -> Result<()> {
        {
            let mut state = self.state.write().await;
            if *state == RuntimeState::Stopped {
                return Ok(());
            }
            if *state == RuntimeState::ShuttingDown {
                anyhow::bail!("Receiver is already shutting down");
            }
            *state = RuntimeState::ShuttingDown;
        }
        info!("Stopping receiver...");

        self.advertiser.stop();
        self.shutdown_token.cancel();
        self.tracker.close();
        if tokio::time::timeout(SHUTDOWN_TIMEOUT, self.tracker.wait())
            .await
            .is_err()
        {
            warn!("Timed out waiting for receiver tasks");
        }

        if let Err(e) = self.trust_store.save() {
            warn!("Failed to save trust store: {}", e);
        }

        *self.state.write().await = RuntimeState::Stopped;
        info!("Receiver stopped");
        Ok(())
    }
}

/// Loads the receiver identity, generating and saving one on first start.
pub fn load_or_generate_identity(path: &Path) -> Result<LongTermIdentity> {
    if path.exists() {
        let bytes = std::fs::read(path)
            .with_context(|| format!("Failed to read identity file: {}", path.display()))?;
        let key: [u8; 32] = bytes.as_slice().try_into().map_err(|_| {
            anyhow::anyhow!(
                "Invalid identity file: expected 32 bytes, got {}",
                bytes.len()
            )
        })?;
        return Ok(LongTermIdentity::from_secret_key_bytes(&key));
    }

    let identity = LongTermIdentity::generate();
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create directory: {}", parent.display()))?;
    }
    std::fs::write(path, identity.secret_key_bytes())
        .with_context(|| format!("Failed to write identity file: {}", path.display()))?;

    info!("Generated new receiver identity and saved to {:?}", path);
    Ok(identity)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn test_config(dir: &TempDir) -> Config {
        let mut config = Config::default();
        config.receiver.data_dir = dir.path().to_path_buf();
        config.receiver.port = 0;
        config
    }

    #[test]
    fn test_identity_persists() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("nested").join(IDENTITY_FILE);

        let first = load_or_generate_identity(&path).unwrap();
        let second = load_or_generate_identity(&path).unwrap();
        assert_eq!(first.identifier(), second.identifier());
        assert_eq!(std::fs::read(&path).unwrap().len(), 32);
    }

    #[test]
    fn test_identity_rejects_bad_length() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join(IDENTITY_FILE);
        std::fs::write(&path, [0u8; 7]).unwrap();

        let err = load_or_generate_identity(&path).unwrap_err();
        assert!(err.to_string().contains("expected 32 bytes"));
    }

    #[tokio::test]
    async fn test_start_and_stop() {
        let dir = TempDir::new().unwrap();
        let advertiser = Arc::new(LoggingAdvertiser::new());
        let runtime = ReceiverRuntime::new(test_config(&dir))
            .unwrap()
            .with_advertiser(advertiser.clone());
        assert_eq!(runtime.state().await, RuntimeState::Stopped);

        runtime.start().await.unwrap();
        assert_eq!(runtime.state().await, RuntimeState::Running);
        assert!(runtime.start().await.is_err());
        assert_eq!(advertiser.current().unwrap().port, 0);

        runtime.stop().await.unwrap();
        assert_eq!(runtime.state().await, RuntimeState::Stopped);
        assert!(advertiser.current().is_none());
        assert!(runtime.shutdown_token().is_cancelled());
        assert!(runtime.registry().is_empty());

        // Stopping twice is fine; restarting is not
        runtime.stop().await.unwrap();
        assert!(runtime.start().await.is_err());
    }

    #[tokio::test]
    async fn test_runtime_loads_paired_devices() {
        let dir = TempDir::new().unwrap();
        {
            let store = TrustStore::open(dir.path()).unwrap();
            store.add_device(crate::devices::PairedDevice::new("phone", [3u8; 32]));
            store.save().unwrap();
        }

        let runtime = ReceiverRuntime::new(test_config(&dir)).unwrap();
        assert!(runtime.trust_store().is_trusted("phone"));
        assert_eq!(runtime.registry().capacity(), 8);
    }
}
