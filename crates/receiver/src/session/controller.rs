//! Per-connection session controller.
//!
//! A [`SessionController`] owns everything one mirroring connection needs:
//! the pairing state machine, the stream decryptor and a decode pipeline.
//! Nothing in it is shared; the [`StreamRegistry`] is the only state it
//! touches that other sessions also see.
//!
//! The controller is synchronous. The connection worker feeds it parsed
//! requests through [`SessionController::handle`] and, once streaming,
//! raw bytes through [`SessionController::ingest_stream`].

use std::sync::Arc;
use std::time::{Duration, Instant};

use protocol::{
    DecryptOutcome, LongTermIdentity, PairingMachine, PairingState, PairingStore,
    PasswordVerifier, ProtocolError, StreamDecryptor, StreamError, Tlv8,
};
use serde::Serialize;
use thiserror::Error;
use uuid::Uuid;

use crate::config::{DecodeFailurePolicy, ReceiverConfig};
use crate::decode::{DecodeError, FrameDecoder};
use crate::registry::{FeedId, RegistryError, StreamRegistry};
use crate::server::http::{HttpError, Request, Response};

/// Unique identifier for a session.
pub type SessionId = String;

/// Name used when a device does not announce one.
pub const DEFAULT_DEVICE_NAME: &str = "Mirroring device";

/// Model string reported by `/info`.
const RECEIVER_MODEL: &str = "Mirrorwall1,1";

/// Protocol version reported by `/info`.
const PROTOCOL_VERSION: &str = "1.1";

/// Feature bits reported by `/info`: screen mirroring and pairing.
const RECEIVER_FEATURES: u64 = (1 << 7) | (1 << 27);

const TLV_CONTENT_TYPE: &str = "application/pairing+tlv8";

/// Errors that end a session.
#[derive(Error, Debug)]
pub enum SessionError {
    /// Wrong PIN or forged credentials.
    #[error("authentication failed: {0}")]
    Authentication(String),

    /// Malformed or out-of-sequence handshake message.
    #[error("handshake failed: {0}")]
    Handshake(String),

    /// A stream frame failed authentication or arrived out of order.
    #[error("stream decryption failed: {0}")]
    Decryption(#[from] StreamError),

    /// A frame could not be decoded and the policy is to abort.
    #[error("frame decode failed: {0}")]
    Decode(#[from] DecodeError),

    /// The registry had no free slot for this feed.
    #[error("registry full: {capacity} feeds already active")]
    CapacityExceeded { capacity: usize },

    /// No frame arrived within the idle window.
    #[error("no frame received for {0:?}")]
    IdleTimeout(Duration),

    /// Stream data arrived before the stream was started.
    #[error("session is not streaming")]
    NotStreaming,

    /// Request framing failed.
    #[error("request error: {0}")]
    Http(#[from] HttpError),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Controller work on the blocking pool panicked or was cancelled.
    #[error("session task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
}

impl From<ProtocolError> for SessionError {
    fn from(err: ProtocolError) -> Self {
        match err {
            ProtocolError::Stream(e) => SessionError::Decryption(e),
            e if e.is_authentication() => SessionError::Authentication(e.to_string()),
            e => SessionError::Handshake(e.to_string()),
        }
    }
}

/// State shared by every session of one receiver.
#[derive(Clone)]
pub struct SessionContext {
    pub identity: Arc<LongTermIdentity>,
    pub verifier: Arc<PasswordVerifier>,
    pub store: Arc<dyn PairingStore>,
    pub registry: Arc<StreamRegistry>,
    /// Name this receiver advertises.
    pub receiver_name: String,
    pub idle_timeout: Duration,
    pub decode_failure_policy: DecodeFailurePolicy,
}

impl SessionContext {
    /// Builds a context from the receiver configuration.
    pub fn new(
        config: &ReceiverConfig,
        identity: Arc<LongTermIdentity>,
        store: Arc<dyn PairingStore>,
        registry: Arc<StreamRegistry>,
    ) -> Self {
        Self {
            identity,
            verifier: Arc::new(PasswordVerifier::new(config.pairing_pin.as_bytes())),
            store,
            registry,
            receiver_name: config.display_name.clone(),
            idle_timeout: config.idle_timeout(),
            decode_failure_policy: config.decode_failure_policy,
        }
    }
}

/// What happened to a chunk of stream bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IngestOutcome {
    /// No complete frame yet.
    NeedMoreData,
    /// A frame was decoded and published.
    Displayed {
        counter: u64,
        /// Older frames superseded by this one.
        dropped: usize,
        placeholder: bool,
    },
    /// The frame could not be decoded; the previous frame stays visible.
    Skipped { counter: u64 },
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct ReceiverInfo<'a> {
    device_id: &'a str,
    name: &'a str,
    model: &'static str,
    features: u64,
    protocol_version: &'static str,
    source_version: &'static str,
    pk: String,
    status_flags: u32,
    feeds: usize,
    max_feeds: usize,
}

/// Drives one mirroring connection.
pub struct SessionController {
    id: SessionId,
    ctx: Arc<SessionContext>,
    machine: PairingMachine,
    device_name: String,
    feed_id: Option<FeedId>,
    decryptor: Option<StreamDecryptor>,
    decoder: FrameDecoder,
    last_frame_at: Option<Instant>,
}

impl SessionController {
    /// Creates a controller in `AWAITING_SETUP`.
    pub fn new(ctx: Arc<SessionContext>) -> Self {
        let machine = PairingMachine::new(
            Arc::clone(&ctx.identity),
            Arc::clone(&ctx.verifier),
            Arc::clone(&ctx.store),
        );
        Self {
            id: Uuid::new_v4().to_string(),
            ctx,
            machine,
            device_name: DEFAULT_DEVICE_NAME.to_string(),
            feed_id: None,
            decryptor: None,
            decoder: FrameDecoder::new(),
            last_frame_at: None,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn state(&self) -> PairingState {
        self.machine.state()
    }

    /// Returns the feed this session publishes to while streaming.
    pub fn feed_id(&self) -> Option<FeedId> {
        self.feed_id
    }

    pub fn device_name(&self) -> &str {
        &self.device_name
    }

    pub fn is_streaming(&self) -> bool {
        self.decryptor.is_some()
    }

    /// Returns why the session failed, if it did.
    pub fn failure_reason(&self) -> Option<&str> {
        self.machine.failure_reason()
    }

    /// Handles a framed request.
    ///
    /// Picks up the device name from the request headers, maps `RECORD` to
    /// `/stream` and dispatches on the path.
    pub fn handle(&mut self, request: &Request) -> Response {
        if let Some(name) = request
            .header("X-Apple-Device-Name")
            .or_else(|| request.header("X-Apple-Device-ID"))
            .filter(|n| !n.trim().is_empty())
        {
            self.device_name = name.trim().to_string();
        }

        let path = if request.method.eq_ignore_ascii_case("RECORD") {
            "/stream"
        } else {
            request.endpoint()
        };
        self.handle_request(path, &request.body)
    }

    /// Handles one protocol message addressed to `path`.
    pub fn handle_request(&mut self, path: &str, body: &[u8]) -> Response {
        tracing::debug!(session_id = %self.id, path = %path, state = %self.state(), "Request");
        match path {
            "/pair-setup" => self.handle_pairing(body, PairingMachine::handle_pair_setup),
            "/pair-verify" => self.handle_pairing(body, PairingMachine::handle_pair_verify),
            "/stream" => self.start_stream(),
            "/info" | "/server-info" => self.info(),
            "/fp-setup" | "/feedback" => Response::empty(200),
            "/teardown" => {
                self.close();
                Response::empty(200).closing()
            }
            _ => {
                tracing::debug!(session_id = %self.id, path = %path, "Unknown endpoint");
                Response::text(404, "unknown endpoint")
            }
        }
    }

    fn handle_pairing(
        &mut self,
        body: &[u8],
        step: fn(&mut PairingMachine, &Tlv8) -> protocol::Result<Tlv8>,
    ) -> Response {
        let request = match Tlv8::decode(body) {
            Ok(request) => request,
            Err(e) => {
                self.machine.fail(&e);
                return self.pairing_error(&Tlv8::new(), &e);
            }
        };

        match step(&mut self.machine, &request) {
            Ok(reply) => {
                if self.state() == PairingState::Verified {
                    tracing::info!(
                        session_id = %self.id,
                        device = ?self.machine.peer_identifier(),
                        fast_path = self.machine.used_fast_path(),
                        "Device verified"
                    );
                }
                Response::with_body(TLV_CONTENT_TYPE, reply.encode())
            }
            Err(e) => self.pairing_error(&request, &e),
        }
    }

    fn pairing_error(&mut self, request: &Tlv8, error: &ProtocolError) -> Response {
        tracing::warn!(session_id = %self.id, error = %error, "Pairing failed");
        self.release_feed();
        let reply = PairingMachine::error_reply(request, error);
        Response::with_body(TLV_CONTENT_TYPE, reply.encode()).closing()
    }

    fn start_stream(&mut self) -> Response {
        let keys = match self.machine.start_streaming() {
            Ok(keys) => keys,
            Err(e) => {
                tracing::warn!(session_id = %self.id, error = %e, "Stream start rejected");
                return Response::text(470, "pairing required").closing();
            }
        };

        let registry = &self.ctx.registry;
        let feed_id = registry.next_feed_id();
        if let Err(e) = registry.register(feed_id, &self.device_name) {
            tracing::warn!(session_id = %self.id, feed_id = %feed_id, error = %e, "Refusing stream");
            self.machine.fail(&e);
            return match e {
                RegistryError::CapacityExceeded { .. } => {
                    Response::text(503, "receiver is full").closing()
                }
                RegistryError::DuplicateFeed(_) => Response::text(500, "feed conflict").closing(),
            };
        }

        self.feed_id = Some(feed_id);
        self.decryptor = Some(StreamDecryptor::new(keys));
        self.last_frame_at = Some(Instant::now());
        if let Some(identifier) = self.machine.peer_identifier() {
            self.ctx.store.record_seen(identifier, &self.device_name);
        }

        tracing::info!(
            session_id = %self.id,
            feed_id = %feed_id,
            name = %self.device_name,
            "Streaming started"
        );
        Response::empty(200)
    }

    fn info(&self) -> Response {
        let pk = hex::encode(self.ctx.identity.public_key_bytes());
        let info = ReceiverInfo {
            device_id: self.ctx.identity.identifier(),
            name: &self.ctx.receiver_name,
            model: RECEIVER_MODEL,
            features: RECEIVER_FEATURES,
            protocol_version: PROTOCOL_VERSION,
            source_version: env!("CARGO_PKG_VERSION"),
            pk,
            status_flags: if self.ctx.registry.len() >= self.ctx.registry.capacity() {
                0x2
            } else {
                0x4
            },
            feeds: self.ctx.registry.len(),
            max_feeds: self.ctx.registry.capacity(),
        };
        match serde_json::to_vec(&info) {
            Ok(body) => Response::with_body("application/json", body),
            Err(e) => {
                tracing::error!(error = %e, "Failed to serialize receiver info");
                Response::empty(500)
            }
        }
    }

    /// Feeds raw stream bytes through decryption and decoding.
    ///
    /// Decryption failures end the session. Decode failures follow the
    /// configured policy.
    pub fn ingest_stream(&mut self, data: &[u8]) -> Result<IngestOutcome, SessionError> {
        let decryptor = self.decryptor.as_mut().ok_or(SessionError::NotStreaming)?;

        let chunk = match decryptor.decrypt_next(data) {
            Ok(DecryptOutcome::NeedMoreData) => return Ok(IngestOutcome::NeedMoreData),
            Ok(DecryptOutcome::Frame(chunk)) => chunk,
            Err(e) => {
                tracing::warn!(session_id = %self.id, error = %e, "Stream rejected");
                self.machine.fail(&e);
                self.release_feed();
                return Err(SessionError::Decryption(e));
            }
        };
        self.last_frame_at = Some(Instant::now());

        if chunk.dropped > 0 {
            tracing::trace!(session_id = %self.id, dropped = chunk.dropped, "Superseded frames dropped");
        }

        match self.decoder.decode(&chunk.payload) {
            Ok(frame) => {
                let placeholder = frame.is_placeholder();
                if let Some(feed_id) = self.feed_id {
                    self.ctx.registry.update_frame(feed_id, frame);
                }
                Ok(IngestOutcome::Displayed {
                    counter: chunk.counter,
                    dropped: chunk.dropped,
                    placeholder,
                })
            }
            Err(e) => match self.ctx.decode_failure_policy {
                DecodeFailurePolicy::Skip => {
                    tracing::warn!(session_id = %self.id, counter = chunk.counter, error = %e, "Skipping undecodable frame");
                    Ok(IngestOutcome::Skipped {
                        counter: chunk.counter,
                    })
                }
                DecodeFailurePolicy::Abort => {
                    self.machine.fail(&e);
                    self.release_feed();
                    Err(SessionError::Decode(e))
                }
            },
        }
    }

    /// Returns how long the session may sit without progress.
    pub fn idle_timeout(&self) -> Duration {
        self.ctx.idle_timeout
    }

    /// Returns when the session times out if no frame arrives first.
    pub fn idle_deadline(&self) -> Option<Instant> {
        self.last_frame_at.map(|at| at + self.ctx.idle_timeout)
    }

    /// Tears the session down if its idle deadline has passed at `now`.
    pub fn check_idle(&mut self, now: Instant) -> Result<(), SessionError> {
        match self.idle_deadline() {
            Some(deadline) if now >= deadline => {
                tracing::info!(session_id = %self.id, feed_id = ?self.feed_id, "Session idle, closing");
                self.close();
                Err(SessionError::IdleTimeout(self.ctx.idle_timeout))
            }
            _ => Ok(()),
        }
    }

    /// Ends the session and releases its feed.
    pub fn close(&mut self) {
        self.machine.close();
        self.release_feed();
    }

    /// Fails the session and releases its feed.
    pub fn fail(&mut self, reason: impl std::fmt::Display) {
        self.machine.fail(reason);
        self.release_feed();
    }

    fn release_feed(&mut self) {
        self.decryptor = None;
        self.last_frame_at = None;
        if let Some(feed_id) = self.feed_id.take() {
            self.ctx.registry.unregister(feed_id);
        }
    }
}

impl Drop for SessionController {
    fn drop(&mut self) {
        self.release_feed();
    }
}

impl std::fmt::Debug for SessionController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionController")
            .field("id", &self.id)
            .field("state", &self.state())
            .field("device_name", &self.device_name)
            .field("feed_id", &self.feed_id)
            .finish()
    }
}
