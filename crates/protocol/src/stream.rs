//! Encrypted mirroring stream.
//!
//! # Frame Format
//!
//! Each frame consists of:
//! - 4 bytes: length of everything after this field (big-endian)
//! - 8 bytes: frame counter (big-endian)
//! - N bytes: ChaCha20-Poly1305 ciphertext of the compressed video payload
//! - 16 bytes: Poly1305 tag
//!
//! The 12 header bytes are authenticated as associated data. The nonce is
//! the 4-byte per-session prefix followed by the counter, so a counter may
//! be used exactly once per session. Counters start at zero and must
//! increase by exactly one per frame; a gap or a replay kills the stream.
//!
//! # Backpressure
//!
//! [`StreamDecryptor::decrypt_next`] authenticates every complete frame in
//! its buffer, in order, but returns only the newest plaintext. Older
//! plaintexts are dropped and counted. Mirroring favours freshness.

use bytes::{Buf, BytesMut};
use thiserror::Error;
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::crypto::aead::{aead_open, aead_seal, counter_nonce, TAG_LENGTH};
use crate::crypto::ecdh::SharedSecret;
use crate::crypto::kdf::{hkdf, SessionKey, KEY_LENGTH, MIRROR_STREAM};
use crate::error::ProtocolError;

/// Size of the length prefix.
pub const FRAME_LENGTH_SIZE: usize = 4;

/// Size of the authenticated header: length prefix + counter.
pub const FRAME_HEADER_SIZE: usize = FRAME_LENGTH_SIZE + 8;

/// Maximum value of the length prefix (8 MB).
pub const MAX_STREAM_FRAME_SIZE: usize = 8 * 1024 * 1024;

/// Smallest legal value of the length prefix: counter + empty payload + tag.
const MIN_STREAM_FRAME_SIZE: usize = 8 + TAG_LENGTH;

/// Length of the per-session nonce prefix.
const NONCE_PREFIX_LENGTH: usize = 4;

/// Errors that end an encrypted stream. None of them are recoverable.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StreamError {
    /// A frame's counter was not the next expected value.
    #[error("frame out of order: expected counter {expected}, got {got}")]
    OutOfOrder {
        /// The only counter that would have been accepted.
        expected: u64,
        /// The counter carried by the frame.
        got: u64,
    },

    /// A frame's tag did not verify.
    #[error("frame {counter} failed authentication")]
    Decryption {
        /// Counter of the rejected frame.
        counter: u64,
    },

    /// A frame declared a length above the maximum.
    #[error("frame too large: {size} bytes exceeds maximum of {max} bytes")]
    FrameTooLarge {
        /// Declared frame length.
        size: usize,
        /// Maximum allowed length.
        max: usize,
    },

    /// A frame declared a length too small to hold a counter and tag.
    #[error("frame too short: {size} bytes")]
    FrameTooShort {
        /// Declared frame length.
        size: usize,
    },

    /// The counter space is exhausted; the stream must be re-keyed.
    #[error("frame counter exhausted")]
    CounterExhausted,

    /// An earlier error already ended this stream.
    #[error("stream already failed")]
    Poisoned,
}

/// Key and nonce prefix for one mirroring stream. Zeroized on drop.
///
/// Derived from the pair-verify shared secret with the stream label, so it
/// never equals any handshake key.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct StreamKeys {
    key: [u8; KEY_LENGTH],
    nonce_prefix: [u8; NONCE_PREFIX_LENGTH],
}

impl StreamKeys {
    /// Derives stream keys from the pair-verify shared secret.
    pub fn derive(shared: &SharedSecret) -> crate::Result<Self> {
        let material = hkdf(
            shared.as_bytes(),
            MIRROR_STREAM.salt,
            MIRROR_STREAM.info,
            KEY_LENGTH + NONCE_PREFIX_LENGTH,
        )?;
        let mut key = [0u8; KEY_LENGTH];
        let mut nonce_prefix = [0u8; NONCE_PREFIX_LENGTH];
        key.copy_from_slice(&material[..KEY_LENGTH]);
        nonce_prefix.copy_from_slice(&material[KEY_LENGTH..]);
        Ok(Self { key, nonce_prefix })
    }

    /// Returns the AEAD key bytes.
    pub fn key_bytes(&self) -> &[u8; KEY_LENGTH] {
        &self.key
    }

    fn session_key(&self) -> SessionKey {
        SessionKey::from_bytes(self.key)
    }

    fn nonce(&self, counter: u64) -> [u8; 12] {
        counter_nonce(&self.nonce_prefix, counter)
    }
}

impl std::fmt::Debug for StreamKeys {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("StreamKeys([REDACTED])")
    }
}

/// A decrypted compressed payload, ready for the decoder.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecryptedChunk {
    /// Counter of the frame this payload came from.
    pub counter: u64,
    /// Plaintext payload.
    pub payload: Vec<u8>,
    /// Older frames authenticated in the same call but superseded by this one.
    pub dropped: usize,
}

/// Result of feeding bytes to the decryptor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DecryptOutcome {
    /// At least one complete frame was authenticated; this is the newest.
    Frame(DecryptedChunk),
    /// The buffer holds no complete frame yet.
    NeedMoreData,
}

/// Reassembles and decrypts the receive side of a mirroring stream.
pub struct StreamDecryptor {
    keys: StreamKeys,
    buffer: BytesMut,
    next_counter: u64,
    poisoned: bool,
    frames_accepted: u64,
    frames_dropped: u64,
}

impl StreamDecryptor {
    /// Creates a decryptor expecting counter 0 first.
    pub fn new(keys: StreamKeys) -> Self {
        Self {
            keys,
            buffer: BytesMut::with_capacity(64 * 1024),
            next_counter: 0,
            poisoned: false,
            frames_accepted: 0,
            frames_dropped: 0,
        }
    }

    /// Appends `raw` to the receive buffer and authenticates every complete
    /// frame in it.
    ///
    /// Any error poisons the decryptor: the buffer is discarded and every
    /// later call returns [`StreamError::Poisoned`].
    pub fn decrypt_next(&mut self, raw: &[u8]) -> Result<DecryptOutcome, StreamError> {
        if self.poisoned {
            return Err(StreamError::Poisoned);
        }
        self.buffer.extend_from_slice(raw);

        let mut newest: Option<(u64, Vec<u8>)> = None;
        let mut dropped = 0;
        loop {
            match self.open_next() {
                Ok(Some(frame)) => {
                    if newest.replace(frame).is_some() {
                        dropped += 1;
                    }
                }
                Ok(None) => break,
                Err(e) => {
                    self.poisoned = true;
                    self.buffer.clear();
                    return Err(e);
                }
            }
        }

        self.frames_dropped += dropped as u64;
        Ok(match newest {
            Some((counter, payload)) => DecryptOutcome::Frame(DecryptedChunk {
                counter,
                payload,
                dropped,
            }),
            None => DecryptOutcome::NeedMoreData,
        })
    }

    /// Opens the frame at the head of the buffer, if it is complete.
    fn open_next(&mut self) -> Result<Option<(u64, Vec<u8>)>, StreamError> {
        if self.buffer.len() < FRAME_LENGTH_SIZE {
            return Ok(None);
        }
        let declared = u32::from_be_bytes([
            self.buffer[0],
            self.buffer[1],
            self.buffer[2],
            self.buffer[3],
        ]) as usize;

        if declared > MAX_STREAM_FRAME_SIZE {
            return Err(StreamError::FrameTooLarge {
                size: declared,
                max: MAX_STREAM_FRAME_SIZE,
            });
        }
        if declared < MIN_STREAM_FRAME_SIZE {
            return Err(StreamError::FrameTooShort { size: declared });
        }
        if self.buffer.len() < FRAME_LENGTH_SIZE + declared {
            return Ok(None);
        }

        let mut frame = self.buffer.split_to(FRAME_LENGTH_SIZE + declared);
        let header = frame.split_to(FRAME_HEADER_SIZE);
        let counter = (&header[FRAME_LENGTH_SIZE..]).get_u64();

        if counter != self.next_counter {
            return Err(StreamError::OutOfOrder {
                expected: self.next_counter,
                got: counter,
            });
        }

        let payload = aead_open(
            &self.keys.session_key(),
            &self.keys.nonce(counter),
            &frame,
            &header,
        )
        .map_err(|_| StreamError::Decryption { counter })?;

        self.next_counter = counter
            .checked_add(1)
            .ok_or(StreamError::CounterExhausted)?;
        self.frames_accepted += 1;
        Ok(Some((counter, payload)))
    }

    /// Returns the only counter the next frame may carry.
    pub fn expected_counter(&self) -> u64 {
        self.next_counter
    }

    /// Returns the number of bytes waiting for a complete frame.
    pub fn buffered_len(&self) -> usize {
        self.buffer.len()
    }

    /// Returns the number of frames authenticated so far.
    pub fn frames_accepted(&self) -> u64 {
        self.frames_accepted
    }

    /// Returns the number of authenticated frames superseded before decoding.
    pub fn frames_dropped(&self) -> u64 {
        self.frames_dropped
    }

    /// Returns true once an error has ended the stream.
    pub fn is_poisoned(&self) -> bool {
        self.poisoned
    }
}

impl std::fmt::Debug for StreamDecryptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamDecryptor")
            .field("next_counter", &self.next_counter)
            .field("buffered", &self.buffer.len())
            .field("poisoned", &self.poisoned)
            .finish()
    }
}

/// Send side of a mirroring stream.
pub struct StreamEncryptor {
    keys: StreamKeys,
    next_counter: u64,
}

impl StreamEncryptor {
    /// Creates an encryptor starting at counter 0.
    pub fn new(keys: StreamKeys) -> Self {
        Self {
            keys,
            next_counter: 0,
        }
    }

    /// Seals `payload` as the next frame.
    pub fn seal_frame(&mut self, payload: &[u8]) -> crate::Result<Vec<u8>> {
        let counter = self.next_counter;
        let frame = self.seal_frame_with_counter(counter, payload)?;
        self.next_counter = counter
            .checked_add(1)
            .ok_or(StreamError::CounterExhausted)?;
        Ok(frame)
    }

    /// Seals `payload` under an explicit counter without advancing the
    /// encryptor. Reusing a counter reuses a nonce; only use this to build
    /// frames a receiver must reject.
    pub fn seal_frame_with_counter(&self, counter: u64, payload: &[u8]) -> crate::Result<Vec<u8>> {
        let declared = 8 + payload.len() + TAG_LENGTH;
        if declared > MAX_STREAM_FRAME_SIZE {
            return Err(ProtocolError::Stream(StreamError::FrameTooLarge {
                size: declared,
                max: MAX_STREAM_FRAME_SIZE,
            }));
        }

        let mut frame = Vec::with_capacity(FRAME_LENGTH_SIZE + declared);
        frame.extend_from_slice(&(declared as u32).to_be_bytes());
        frame.extend_from_slice(&counter.to_be_bytes());
        let sealed = aead_seal(
            &self.keys.session_key(),
            &self.keys.nonce(counter),
            payload,
            &frame,
        )?;
        frame.extend_from_slice(&sealed);
        Ok(frame)
    }

    /// Returns the counter the next sealed frame will carry.
    pub fn next_counter(&self) -> u64 {
        self.next_counter
    }
}
