//! Service advertisement.
//!
//! The receiver does not implement local-network discovery itself; it hands
//! its name, port and protocol identifiers to a [`ServiceAdvertiser`].

use parking_lot::Mutex;

/// Service types the receiver answers to.
pub const PROTOCOL_IDENTIFIERS: &[&str] = &["_airplay._tcp", "_raop._tcp"];

/// A live advertisement.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Advertisement {
    pub display_name: String,
    pub port: u16,
    pub protocol_identifiers: Vec<String>,
}

/// Starts and stops a local-network advertisement.
pub trait ServiceAdvertiser: Send + Sync {
    fn start(
        &self,
        display_name: &str,
        port: u16,
        protocol_identifiers: &[&str],
    ) -> anyhow::Result<()>;

    /// Withdraws the advertisement. Stopping twice is a no-op.
    fn stop(&self);
}

/// Advertiser that only records the advertisement in the log.
#[derive(Debug, Default)]
pub struct LoggingAdvertiser {
    current: Mutex<Option<Advertisement>>,
}

impl LoggingAdvertiser {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the advertisement in effect, if any.
    pub fn current(&self) -> Option<Advertisement> {
        self.current.lock().clone()
    }
}

impl ServiceAdvertiser for LoggingAdvertiser {
    fn start(
        &self,
        display_name: &str,
        port: u16,
        protocol_identifiers: &[&str],
    ) -> anyhow::Result<()> {
        let advertisement = Advertisement {
            display_name: display_name.to_string(),
            port,
            protocol_identifiers: protocol_identifiers.iter().map(|s| s.to_string()).collect(),
        };
        tracing::info!(
            name = %display_name,
            port,
            services = ?advertisement.protocol_identifiers,
            "Advertising receiver"
        );
        *self.current.lock() = Some(advertisement);
        Ok(())
    }

    fn stop(&self) {
        if let Some(advertisement) = self.current.lock().take() {
            tracing::info!(name = %advertisement.display_name, "Advertisement withdrawn");
        }
    }
}
