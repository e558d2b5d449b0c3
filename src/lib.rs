#![forbid(unsafe_code)]
#![warn(clippy::all)]

//! TLS and DTLS sessions over abstract transports.
//!
//! This crate wraps a real crypto engine around any byte transport the
//! caller supplies: `tls://host:port` runs a stream handshake, `dtls://`
//! a datagram one. It covers self-signed ephemeral credentials with
//! colon-hex fingerprints, strict hostname/SNI verification, HTTP-proxy
//! tunnel rewriting, MTU-disciplined datagram handshakes and SRTP
//! keying-material export for opportunistic encryption.
//!
//! The underlying transport is abstract: implement [`Transport`] and
//! [`TransportProvider`] over your sockets (or anything else duplex) and
//! hand them to [`Session::connect`]. All progress is driven by caller
//! calls; nothing here spawns threads.

mod bio;
mod config;
mod credentials;
mod error;
mod handshake;
mod opener;
mod session;
mod transport;

pub use config::{TlsConfig, TlsConfigBuilder};
pub use credentials::Credential;
pub use error::Error;
pub use handshake::SRTP_EXPORT_LABEL;
pub use session::{HandshakeStatus, Session, SessionState};
pub use transport::{Interrupt, OpenOptions, Transport, TransportProvider};
