//! Persistent store of paired devices.
//!
//! Every device that completes pair-setup is recorded here with its
//! long-term Ed25519 key, so it can skip pair-setup on later connections.
//! The store persists to JSON at `<data_dir>/paired_devices.json`.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use parking_lot::{Mutex, RwLock};
use protocol::{PairingStore, PeerKey, ProtocolError};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// File name of the store inside the data directory.
pub const PAIRED_DEVICES_FILE: &str = "paired_devices.json";

/// Current on-disk format version.
const STORE_VERSION: u32 = 1;

/// Errors raised by the trust store.
#[derive(Debug, Error)]
pub enum TrustStoreError {
    #[error("failed to {action} {path}: {source}")]
    Io {
        action: &'static str,
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse trust store {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("failed to serialize trust store: {0}")]
    Serialize(#[source] serde_json::Error),

    #[error("unsupported trust store version {0}")]
    UnsupportedVersion(u32),

    #[error("device {0} not found in trust store")]
    UnknownDevice(String),
}

/// Trust level of a paired device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum TrustLevel {
    /// May use the pair-verify fast path.
    #[default]
    Trusted,
    /// Pairing withdrawn; the device must pair again with the PIN.
    Revoked,
}

/// A paired device entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PairedDevice {
    /// Identifier the device pairs as.
    pub identifier: String,
    /// Last name the device announced, if any.
    #[serde(default)]
    pub display_name: Option<String>,
    /// The device's long-term public key (32 bytes, Ed25519).
    #[serde(with = "public_key_serde")]
    pub public_key: [u8; 32],
    /// Trust level of this device.
    pub trust_level: TrustLevel,
    /// When pair-setup completed.
    pub paired_at: SystemTime,
    /// When the device last started streaming.
    pub last_seen: SystemTime,
}

impl PairedDevice {
    /// Creates a trusted entry for a freshly paired device.
    pub fn new(identifier: impl Into<String>, public_key: [u8; 32]) -> Self {
        let now = SystemTime::now();
        Self {
            identifier: identifier.into(),
            display_name: None,
            public_key,
            trust_level: TrustLevel::Trusted,
            paired_at: now,
            last_seen: now,
        }
    }

    /// Returns a short hex fingerprint of the device key for display.
    pub fn fingerprint(&self) -> String {
        hex::encode(&self.public_key[..8])
    }
}

/// Serde support for public key (serializes as base64).
mod public_key_serde {
    use base64::Engine;
    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    pub fn serialize<S>(key: &[u8; 32], serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        base64::engine::general_purpose::STANDARD
            .encode(key)
            .serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<[u8; 32], D::Error>
    where
        D: Deserializer<'de>,
    {
        let encoded: String = Deserialize::deserialize(deserializer)?;
        let bytes = base64::engine::general_purpose::STANDARD
            .decode(&encoded)
            .map_err(serde::de::Error::custom)?;
        bytes.try_into().map_err(|bytes: Vec<u8>| {
            serde::de::Error::custom(format!(
                "invalid public key length: expected 32, got {}",
                bytes.len()
            ))
        })
    }
}

/// On-disk layout of the store.
#[derive(Debug, Serialize, Deserialize)]
struct TrustStoreData {
    /// Version of the store format.
    version: u32,
    /// The devices in the store.
    devices: Vec<PairedDevice>,
}

/// Thread-safe store of paired devices.
///
/// Changes made through [`PairingStore::remember`] are saved immediately;
/// the other mutators leave saving to the caller.
pub struct TrustStore {
    path: PathBuf,
    devices: RwLock<HashMap<String, PairedDevice>>,
    /// Held across serialize, write and rename so saves never share the temp file.
    save_lock: Mutex<()>,
}

impl TrustStore {
    /// Creates an empty store that will persist to `path`.
    ///
    /// This does not load the file; call [`TrustStore::load`] to read
    /// existing data.
    pub fn new<P: AsRef<Path>>(path: P) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            devices: RwLock::new(HashMap::new()),
            save_lock: Mutex::new(()),
        }
    }

    /// Creates a store at the standard location inside `data_dir` and loads it.
    pub fn open(data_dir: &Path) -> Result<Self, TrustStoreError> {
        let store = Self::new(data_dir.join(PAIRED_DEVICES_FILE));
        store.load()?;
        Ok(store)
    }

    /// Returns the path to the store file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Loads the store from disk, replacing the in-memory contents.
    ///
    /// A missing file leaves the store empty.
    pub fn load(&self) -> Result<(), TrustStoreError> {
        if !self.path.exists() {
            tracing::debug!("Trust store not found at {:?}, starting empty", self.path);
            return Ok(());
        }

        let contents = fs::read_to_string(&self.path).map_err(|source| TrustStoreError::Io {
            action: "read",
            path: self.path.clone(),
            source,
        })?;
        let data: TrustStoreData =
            serde_json::from_str(&contents).map_err(|source| TrustStoreError::Parse {
                path: self.path.clone(),
                source,
            })?;
        if data.version != STORE_VERSION {
            return Err(TrustStoreError::UnsupportedVersion(data.version));
        }

        let mut devices = self.devices.write();
        devices.clear();
        for device in data.devices {
            devices.insert(device.identifier.clone(), device);
        }

        tracing::info!("Loaded {} paired devices from {:?}", devices.len(), self.path);
        Ok(())
    }

    /// Saves the store to disk.
    ///
    /// Writes a temp file and renames it over the store so a crash never
    /// leaves a truncated file behind.
    pub fn save(&self) -> Result<(), TrustStoreError> {
        let _guard = self.save_lock.lock();

        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).map_err(|source| TrustStoreError::Io {
                action: "create directory",
                path: parent.to_path_buf(),
                source,
            })?;
        }

        let contents = {
            let devices = self.devices.read();
            let mut list: Vec<PairedDevice> = devices.values().cloned().collect();
            list.sort_by(|a, b| a.identifier.cmp(&b.identifier));
            let data = TrustStoreData {
                version: STORE_VERSION,
                devices: list,
            };
            serde_json::to_string_pretty(&data).map_err(TrustStoreError::Serialize)?
        };

        let temp_path = self.path.with_extension("json.tmp");
        fs::write(&temp_path, &contents).map_err(|source| TrustStoreError::Io {
            action: "write",
            path: temp_path.clone(),
            source,
        })?;
        fs::rename(&temp_path, &self.path).map_err(|source| TrustStoreError::Io {
            action: "replace",
            path: self.path.clone(),
            source,
        })?;

        tracing::debug!("Saved paired devices to {:?}", self.path);
        Ok(())
    }

    /// Adds or replaces a device entry.
    pub fn add_device(&self, device: PairedDevice) {
        tracing::info!(
            identifier = %device.identifier,
            fingerprint = %device.fingerprint(),
            "Pairing recorded"
        );
        self.devices.write().insert(device.identifier.clone(), device);
    }

    /// Gets a device by identifier.
    pub fn get_device(&self, identifier: &str) -> Option<PairedDevice> {
        self.devices.read().get(identifier).cloned()
    }

    /// Returns true if the device is paired and not revoked.
    pub fn is_trusted(&self, identifier: &str) -> bool {
        self.devices
            .read()
            .get(identifier)
            .is_some_and(|d| d.trust_level == TrustLevel::Trusted)
    }

    /// Marks a device revoked. It must pair again with the PIN.
    pub fn revoke(&self, identifier: &str) -> Result<(), TrustStoreError> {
        let mut devices = self.devices.write();
        let device = devices
            .get_mut(identifier)
            .ok_or_else(|| TrustStoreError::UnknownDevice(identifier.to_string()))?;
        device.trust_level = TrustLevel::Revoked;
        tracing::info!(identifier = %identifier, "Pairing revoked");
        Ok(())
    }

    /// Removes a device entry. Returns the removed entry, if any.
    pub fn remove_device(&self, identifier: &str) -> Option<PairedDevice> {
        self.devices.write().remove(identifier)
    }

    /// Updates last-seen time and name of a paired device.
    ///
    /// Returns false if the device is not in the store.
    pub fn mark_seen(&self, identifier: &str, display_name: &str) -> bool {
        let mut devices = self.devices.write();
        match devices.get_mut(identifier) {
            Some(device) => {
                device.last_seen = SystemTime::now();
                device.display_name = Some(display_name.to_string());
                true
            }
            None => false,
        }
    }

    /// Lists all devices, sorted by identifier.
    pub fn list_devices(&self) -> Vec<PairedDevice> {
        let mut devices: Vec<PairedDevice> = self.devices.read().values().cloned().collect();
        devices.sort_by(|a, b| a.identifier.cmp(&b.identifier));
        devices
    }

    /// Returns the number of devices in the store.
    pub fn len(&self) -> usize {
        self.devices.read().len()
    }

    /// Returns true if the store is empty.
    pub fn is_empty(&self) -> bool {
        self.devices.read().is_empty()
    }
}

impl PairingStore for TrustStore {
    fn lookup(&self, identifier: &str) -> Option<PeerKey> {
        let devices = self.devices.read();
        let device = devices
            .get(identifier)
            .filter(|d| d.trust_level == TrustLevel::Trusted)?;
        match PeerKey::from_bytes(&device.public_key) {
            Ok(key) => Some(key),
            Err(e) => {
                tracing::warn!(identifier = %identifier, error = %e, "Stored device key is invalid");
                None
            }
        }
    }

    fn remember(&self, identifier: &str, key: PeerKey) -> protocol::Result<()> {
        let mut device = PairedDevice::new(identifier, key.to_bytes());
        if let Some(existing) = self.get_device(identifier) {
            device.display_name = existing.display_name;
        }
        self.add_device(device);
        self.save()
            .map_err(|e| ProtocolError::Store(e.to_string()))
    }

    fn record_seen(&self, identifier: &str, display_name: &str) {
        if !self.mark_seen(identifier, display_name) {
            return;
        }
        if let Err(e) = self.save() {
            tracing::warn!(identifier = %identifier, error = %e, "Failed to save trust store");
        }
    }
}

impl std::fmt::Debug for TrustStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TrustStore")
            .field("path", &self.path)
            .field("devices", &self.len())
            .finish()
    }
}
