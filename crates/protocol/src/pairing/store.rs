//! Storage seam for long-term keys of paired devices.

use std::collections::HashMap;

use parking_lot::RwLock;

use crate::crypto::PeerKey;
use crate::error::Result;

/// Looks up and records the long-term keys of devices that completed
/// pair-setup.
///
/// A device found here may skip pair-setup and go straight to pair-verify.
pub trait PairingStore: Send + Sync {
    /// Returns the stored key for `identifier`.
    fn lookup(&self, identifier: &str) -> Option<PeerKey>;

    /// Records the key a device proved during pair-setup, replacing any
    /// earlier key for the same identifier.
    fn remember(&self, identifier: &str, key: PeerKey) -> Result<()>;

    /// Called when a paired device starts streaming. Stores that keep
    /// bookkeeping override this; the default does nothing.
    fn record_seen(&self, _identifier: &str, _display_name: &str) {}
}

/// A [`PairingStore`] that forgets everything when dropped.
#[derive(Debug, Default)]
pub struct MemoryPairingStore {
    devices: RwLock<HashMap<String, PeerKey>>,
}

impl MemoryPairingStore {
    /// Creates an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Removes a device. Returns true if it was present.
    pub fn forget(&self, identifier: &str) -> bool {
        self.devices.write().remove(identifier).is_some()
    }

    /// Returns the number of stored devices.
    pub fn len(&self) -> usize {
        self.devices.read().len()
    }

    /// Returns true if no device is stored.
    pub fn is_empty(&self) -> bool {
        self.devices.read().is_empty()
    }
}

impl PairingStore for MemoryPairingStore {
    fn lookup(&self, identifier: &str) -> Option<PeerKey> {
        self.devices.read().get(identifier).copied()
    }

    fn remember(&self, identifier: &str, key: PeerKey) -> Result<()> {
        self.devices.write().insert(identifier.to_string(), key);
        Ok(())
    }
}
