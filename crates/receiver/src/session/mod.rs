//! Mirroring sessions.
//!
//! A session is one device connection: [`SessionController`] holds its
//! protocol state and [`serve_connection`] drives it over a socket.

pub mod controller;
pub mod worker;

pub use controller::{
    IngestOutcome, SessionContext, SessionController, SessionError, SessionId,
    DEFAULT_DEVICE_NAME,
};
pub use worker::{serve_connection, SessionEnd, CLOSE_GRACE_PERIOD};
