//! Paired device management.
//!
//! This module persists the long-term keys of paired devices and serves
//! them to the pairing state machine through [`protocol::PairingStore`].

pub mod trust_store;

pub use trust_store::{PairedDevice, TrustLevel, TrustStore, TrustStoreError, PAIRED_DEVICES_FILE};
