//! Typed request/response protocol over the framed TLS stream.
//!
//! One connection multiplexes three frame kinds, discriminated by the first
//! payload byte:
//!
//! - `Request` (client to server): a JSON envelope with the evaluation
//!   flags followed by the wire-encoded promise tree.
//! - `Output` (server to client): raw reporter output produced while the
//!   request evaluates - the back-channel tee.
//! - `Response` (server to client): a JSON envelope with the terminal
//!   status; exactly one per request and always the final frame for it.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use pledge_core::Promise;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::wire::{self, WireError};

/// Terminal status of a successfully evaluated request.
pub const STATUS_OK: &str = "execution successfull";
/// Terminal status when the evaluation aborted with an error.
pub const STATUS_ABORTED: &str = "execution aborted with error";
/// Terminal status when the request could not be decoded.
pub const STATUS_DECODE: &str = "error decoding command";

const KIND_REQUEST: u8 = 1;
const KIND_OUTPUT: u8 = 2;
const KIND_RESPONSE: u8 = 3;

/// Transport-level failure: framing, encoding or IO.
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("frame of {size} bytes exceeds the {max} byte limit")]
    FrameTooLarge { size: usize, max: usize },

    #[error("message truncated while reading {0}")]
    Truncated(&'static str),

    #[error("unknown message kind {0}")]
    UnknownKind(u8),

    #[error(transparent)]
    Wire(#[from] WireError),

    #[error("envelope: {0}")]
    Envelope(#[from] serde_json::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// A client's evaluation request.
#[derive(Debug, Clone, PartialEq)]
pub struct Request {
    pub verbose: bool,
    pub debug: bool,
    pub client_version: String,
    pub tree: Promise,
}

#[derive(Debug, Serialize, Deserialize)]
struct RequestEnvelope {
    verbose: bool,
    debug: bool,
    client_version: String,
}

/// The server's terminal answer to one request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Response {
    pub server_version: String,
    pub status: String,
    /// Empty on success, otherwise the surfaced error message.
    pub error: String,
}

impl Response {
    /// A success response.
    #[must_use]
    pub fn ok(server_version: impl Into<String>) -> Self {
        Self {
            server_version: server_version.into(),
            status: STATUS_OK.to_string(),
            error: String::new(),
        }
    }

    /// An aborted-evaluation response carrying the error message.
    #[must_use]
    pub fn aborted(server_version: impl Into<String>, error: impl Into<String>) -> Self {
        Self {
            server_version: server_version.into(),
            status: STATUS_ABORTED.to_string(),
            error: error.into(),
        }
    }

    /// A decode-failure response carrying the error message.
    #[must_use]
    pub fn decode_failure(server_version: impl Into<String>, error: impl Into<String>) -> Self {
        Self {
            server_version: server_version.into(),
            status: STATUS_DECODE.to_string(),
            error: error.into(),
        }
    }
}

/// One protocol message, as carried in a frame payload.
#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    Request(Request),
    Output(Bytes),
    Response(Response),
}

impl Message {
    /// Encode this message into a frame payload.
    ///
    /// # Errors
    ///
    /// Returns a [`ProtocolError`] when the JSON envelope cannot be
    /// serialized.
    pub fn encode(&self) -> Result<Bytes, ProtocolError> {
        let mut buf = BytesMut::new();
        match self {
            Self::Request(request) => {
                buf.put_u8(KIND_REQUEST);
                let envelope = serde_json::to_vec(&RequestEnvelope {
                    verbose: request.verbose,
                    debug: request.debug,
                    client_version: request.client_version.clone(),
                })?;
                #[allow(clippy::cast_possible_truncation)] // envelope is tiny
                buf.put_u32(envelope.len() as u32);
                buf.extend_from_slice(&envelope);
                buf.extend_from_slice(&wire::encode_promise(&request.tree));
            },
            Self::Output(chunk) => {
                buf.put_u8(KIND_OUTPUT);
                buf.extend_from_slice(chunk);
            },
            Self::Response(response) => {
                buf.put_u8(KIND_RESPONSE);
                buf.extend_from_slice(&serde_json::to_vec(response)?);
            },
        }
        Ok(buf.freeze())
    }

    /// Decode a frame payload into a message.
    ///
    /// # Errors
    ///
    /// Returns a [`ProtocolError`] on unknown kinds, truncation or a
    /// malformed envelope/tree.
    pub fn decode(mut payload: Bytes) -> Result<Self, ProtocolError> {
        if !payload.has_remaining() {
            return Err(ProtocolError::Truncated("message kind"));
        }
        match payload.get_u8() {
            KIND_REQUEST => {
                if payload.remaining() < 4 {
                    return Err(ProtocolError::Truncated("request envelope length"));
                }
                let envelope_len = payload.get_u32() as usize;
                if payload.remaining() < envelope_len {
                    return Err(ProtocolError::Truncated("request envelope"));
                }
                let envelope: RequestEnvelope =
                    serde_json::from_slice(&payload.split_to(envelope_len))?;
                let tree = wire::decode_promise(payload)?;
                Ok(Self::Request(Request {
                    verbose: envelope.verbose,
                    debug: envelope.debug,
                    client_version: envelope.client_version,
                    tree,
                }))
            },
            KIND_OUTPUT => Ok(Self::Output(payload)),
            KIND_RESPONSE => Ok(Self::Response(serde_json::from_slice(&payload)?)),
            kind => Err(ProtocolError::UnknownKind(kind)),
        }
    }
}
