//! pledge-daemon - remote-execution transport and server lifecycle.
//!
//! This crate carries the networked half of pledge: the persistent
//! certificate store with per-peer pinning, the mutually-authenticated TLS
//! configuration, the length-prefixed frame codec with its typed
//! request/response protocol, the tag-discriminated wire encoding of the
//! promise algebra, and the server accept loop with its SIGUSR2
//! live-upgrade lifecycle.

pub mod framing;
pub mod proto;
pub mod server;
pub mod store;
pub mod tls;
pub mod upgrade;
pub mod wire;

pub use framing::FrameCodec;
pub use proto::{
    Message, ProtocolError, Request, Response, STATUS_ABORTED, STATUS_DECODE, STATUS_OK,
};
pub use server::{RequestHandler, Server, ServerError, ServerSettings};
pub use store::{CertStore, StoreError};
pub use tls::{client_config, server_config, CertificateSource, PemFileSource, TlsError, TlsIdentity};
pub use wire::{decode_promise, encode_promise, WireError};
