//! # Mirrorwall Receiver Library
//!
//! This crate runs the receiving side of Mirrorwall: it accepts
//! screen-mirroring devices, authenticates them, decrypts and decodes their
//! streams, and keeps the newest frame of every device ready for a
//! multi-stream viewer.
//!
//! ## Overview
//!
//! - **Sessions**: One controller per device connection drives pairing,
//!   stream decryption and decoding
//! - **Stream Registry**: Fixed-capacity map of live feeds, shared by every
//!   session and read by the viewer
//! - **Backends**: The built-in protocol server or an external receiver
//!   process, chosen once at startup
//! - **Paired Devices**: Persistent store of device keys for the pair-verify
//!   fast path
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                        Receiver Runtime                         │
//! ├─────────────────────────────────────────────────────────────────┤
//! │                                                                 │
//! │  ┌──────────────────────────────┐   ┌───────────────────────┐  │
//! │  │      Mirroring Backend       │   │  Service Advertiser   │  │
//! │  │  (built-in server | external)│   └───────────────────────┘  │
//! │  └──────────────┬───────────────┘                              │
//! │                 │ one worker per connection                    │
//! │  ┌──────────────▼───────────────┐   ┌───────────────────────┐  │
//! │  │      Session Controller      │──▶│  Paired Device Store  │  │
//! │  │ pairing → decrypt → decode   │   └───────────────────────┘  │
//! │  └──────────────┬───────────────┘                              │
//! │                 │ register / update_frame / unregister         │
//! │  ┌──────────────▼───────────────┐   ┌───────────────────────┐  │
//! │  │       Stream Registry        │◀──│   Viewer (snapshot)   │  │
//! │  └──────────────────────────────┘   └───────────────────────┘  │
//! └─────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use receiver::{Config, ReceiverRuntime};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = Config::load_default()?;
//!
//!     let runtime = ReceiverRuntime::new(config)?;
//!     runtime.start().await?;
//!
//!     // Devices can now connect; wait for a shutdown signal...
//!
//!     runtime.stop().await?;
//!     Ok(())
//! }
//! ```
//!
//! ## Modules
//!
//! - [`config`]: Configuration loading and defaults
//! - [`registry`]: Latest frame of every live feed
//! - [`decode`]: Compressed payload to BGR frame
//! - [`session`]: Per-connection controller and worker
//! - [`server`]: TCP listener and request framing
//! - [`backend`]: Backend trait and external receiver adapter
//! - [`devices`]: Paired device store
//! - [`discovery`]: Service advertisement seam
//! - [`viewer`]: Grid layout of registry snapshots
//! - [`orchestrator`]: Receiver runtime

pub mod backend;
pub mod config;
pub mod decode;
pub mod devices;
pub mod discovery;
pub mod orchestrator;
pub mod registry;
pub mod server;
pub mod session;
pub mod viewer;

// Re-export protocol for convenience
pub use protocol;

pub use backend::{select_backend, BackendEvent, MirroringBackend};
pub use config::{Config, DecodeFailurePolicy};
pub use decode::{DecodeError, DecodedFrame, FrameDecoder, PixelFormat};
pub use devices::{PairedDevice, TrustLevel, TrustStore};
pub use discovery::{LoggingAdvertiser, ServiceAdvertiser};
pub use orchestrator::{ReceiverRuntime, RuntimeState};
pub use registry::{FeedId, FeedSnapshot, RegistryError, StreamRegistry};
pub use server::{BuiltinBackend, MirrorServer};
pub use session::{
    serve_connection, IngestOutcome, SessionContext, SessionController, SessionEnd, SessionError,
    SessionId,
};
pub use viewer::GridLayout;
