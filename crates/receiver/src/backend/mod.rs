//! Mirroring backends.
//!
//! A backend accepts devices and publishes their frames into the
//! [`StreamRegistry`]. Two exist: the built-in protocol server
//! ([`BuiltinBackend`](crate::server::BuiltinBackend)) and an adapter around
//! an external receiver process ([`ExternalProcessBackend`]). One of them is
//! chosen at startup by a single availability probe and used for the whole
//! run.

pub mod external;

use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use protocol::{LongTermIdentity, PairingStore};
use tokio_util::sync::CancellationToken;

use crate::config::{BackendConfig, Config};
use crate::registry::StreamRegistry;
use crate::server::BuiltinBackend;

pub use external::{BackendEvent, ExternalFeeds, ExternalProcessBackend, LogEventParser};

/// A source of mirrored feeds.
#[async_trait]
pub trait MirroringBackend: Send + Sync {
    /// Short name for logs.
    fn name(&self) -> &'static str;

    /// Runs until `shutdown` is cancelled or the backend fails.
    ///
    /// Every feed the backend registered is unregistered before this returns.
    async fn run(
        &self,
        registry: Arc<StreamRegistry>,
        shutdown: CancellationToken,
    ) -> anyhow::Result<()>;
}

/// Outcome of the availability probe.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BackendChoice {
    Builtin,
    /// External receiver found at this path.
    External(PathBuf),
}

/// Decides which backend to run.
///
/// The external receiver is used only when preferred and found on `PATH`.
pub fn probe_backend(config: &BackendConfig) -> BackendChoice {
    if !config.prefer_external {
        return BackendChoice::Builtin;
    }
    match which::which(&config.external_binary) {
        Ok(path) => BackendChoice::External(path),
        Err(e) => {
            tracing::info!(
                binary = %config.external_binary,
                error = %e,
                "External receiver not available, using built-in backend"
            );
            BackendChoice::Builtin
        }
    }
}

/// Builds the backend chosen by [`probe_backend`].
pub fn select_backend(
    config: &Config,
    identity: Arc<LongTermIdentity>,
    store: Arc<dyn PairingStore>,
) -> Box<dyn MirroringBackend> {
    match probe_backend(&config.backend) {
        BackendChoice::External(path) => Box::new(ExternalProcessBackend::new(
            path,
            config.receiver.display_name.clone(),
            config.backend.external_args.clone(),
        )),
        BackendChoice::Builtin => Box::new(BuiltinBackend::new(
            config.receiver.clone(),
            identity,
            store,
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use protocol::MemoryPairingStore;

    #[test]
    fn test_probe_defaults_to_builtin() {
        let config = BackendConfig::default();
        assert!(!config.prefer_external);
        assert_eq!(probe_backend(&config), BackendChoice::Builtin);
    }

    #[test]
    fn test_probe_missing_binary_falls_back() {
        let config = BackendConfig {
            prefer_external: true,
            external_binary: "mirrorwall-no-such-receiver-binary".to_string(),
            external_args: Vec::new(),
        };
        assert_eq!(probe_backend(&config), BackendChoice::Builtin);
    }

    #[test]
    fn test_probe_finds_external_binary() {
        let config = BackendConfig {
            prefer_external: true,
            external_binary: "sh".to_string(),
            external_args: Vec::new(),
        };
        assert!(matches!(probe_backend(&config), BackendChoice::External(_)));
    }

    #[test]
    fn test_select_backend_builtin() {
        let backend = select_backend(
            &Config::default(),
            Arc::new(LongTermIdentity::generate()),
            Arc::new(MemoryPairingStore::new()),
        );
        assert_eq!(backend.name(), "builtin");
    }
}
