//! Secure session lifecycle and post-handshake I/O.
//!
//! A [`Session`] owns one underlying transport, one credential and one
//! crypto-engine context, and moves through
//! `Unopened → Connecting → Handshaking → Established → {Closed | Failed}`.
//! Stream sessions handshake in a single blocking call at open time;
//! datagram sessions are stepped from an external readiness loop.
//!
//! Sessions are not internally synchronized. A caller using one session
//! across threads must serialize access externally; nothing here spawns
//! threads or tasks.

use std::fmt;
use std::io;
use std::mem;
use std::net::IpAddr;

use log::{debug, trace, warn};
use openssl::ssl::{ErrorCode, HandshakeError, MidHandshakeSslStream, SslStream};
use openssl::x509::X509VerifyResult;

use crate::bio::BioStream;
use crate::config::TlsConfig;
use crate::credentials::Credential;
use crate::error::{crypto_error, describe_engine_errors, drain_engine_errors};
use crate::handshake::{self, SRTP_EXPORT_LABEL};
use crate::opener;
use crate::transport::{Transport, TransportProvider};
use crate::Error;

/// Result of one datagram handshake step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeStatus {
    /// More input or output flushing is needed; call [`Session::step`]
    /// again when the transport is ready.
    InProgress,
    /// The engine reports the handshake fully finished.
    Complete,
}

/// Observable session lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Unopened,
    Connecting,
    Handshaking,
    Established,
    Closed,
    Failed,
}

enum State {
    Unopened,
    Connecting {
        ssl: openssl::ssl::Ssl,
        bio: BioStream,
    },
    Handshaking(MidHandshakeSslStream<BioStream>),
    Established(SslStream<BioStream>),
    Closed,
    Failed,
}

/// A TLS (stream) or DTLS (datagram) session over an abstract transport.
pub struct Session {
    config: TlsConfig,
    datagram: bool,
    host: String,
    port: u16,
    numeric_host: bool,
    credential: Option<Credential>,
    nonblocking: bool,
    external: bool,
    state: State,
}

impl Session {
    /// Open a session for `tls://host:port[?options]` or
    /// `dtls://host:port[?options]`.
    ///
    /// Stream sessions block until the handshake completes, fails, or the
    /// configured interrupt callback cancels the wait. Datagram sessions
    /// send their first flight here and are then driven with
    /// [`step`](Session::step).
    pub fn connect(
        uri: &str,
        config: TlsConfig,
        provider: &dyn TransportProvider,
    ) -> Result<Session, Error> {
        let datagram = scheme_is_datagram(uri)?;
        let mut config = config;
        let endpoint = opener::open_underlying(uri, datagram, &mut config, provider)?;

        let mut session = Session::start(
            config,
            datagram,
            endpoint.host,
            endpoint.port,
            endpoint.numeric_host,
            endpoint.transport,
            false,
        )?;
        session.step()?;
        Ok(session)
    }

    /// Open a session over a transport the caller owns and will close.
    ///
    /// The handshake is not started here; the caller drives it with
    /// [`step`](Session::step) once the transport is ready for the first
    /// flight. Ownership of the underlying resource stays with the caller:
    /// the handle passed in must keep it alive independently (for example
    /// through shared ownership), and the session's teardown only drops its
    /// own reference.
    pub fn with_external_transport(
        uri: &str,
        config: TlsConfig,
        transport: Box<dyn Transport>,
    ) -> Result<Session, Error> {
        let datagram = scheme_is_datagram(uri)?;
        let mut config = config;

        let parsed = opener::parse_uri(uri)?;
        if let Some(query) = parsed.query {
            config.apply_query(query)?;
        }
        let host = parsed.host.to_string();
        let port = parsed.port;
        let numeric_host = host.parse::<IpAddr>().is_ok();

        Session::start(config, datagram, host, port, numeric_host, transport, true)
    }

    fn start(
        mut config: TlsConfig,
        datagram: bool,
        host: String,
        port: u16,
        numeric_host: bool,
        transport: Box<dyn Transport>,
        external: bool,
    ) -> Result<Session, Error> {
        if datagram {
            config.default_mtu_if_unset();
        }

        let credential = handshake::select_credential(&config)?;
        let context = handshake::build_context(&config, credential.as_ref(), datagram)?;
        let ssl = handshake::build_ssl(&context, &config, datagram, &host, numeric_host)?;

        let pin_peer = datagram && config.listen();
        let bio = BioStream::new(transport, pin_peer);

        Ok(Session {
            config,
            datagram,
            host,
            port,
            numeric_host,
            credential,
            nonblocking: false,
            external,
            state: State::Connecting { ssl, bio },
        })
    }

    /// Drive the handshake one step.
    ///
    /// For datagram sessions this is re-invoked from the caller's readiness
    /// loop; each step forces the transport to blocking mode so a
    /// partially-sent flight is never abandoned mid-write. "Need more
    /// input" and "need to flush" are reported as
    /// [`HandshakeStatus::InProgress`], as is a clean-shutdown signal
    /// observed mid-handshake. Anything else fails the session.
    ///
    /// Stream sessions complete their handshake inside
    /// [`connect`](Session::connect); calling this afterwards just reports
    /// [`HandshakeStatus::Complete`].
    pub fn step(&mut self) -> Result<HandshakeStatus, Error> {
        match mem::replace(&mut self.state, State::Unopened) {
            State::Connecting { ssl, mut bio } => {
                bio.apply_nonblocking(false);
                trace!(
                    "Starting {} handshake with {}",
                    if self.datagram { "datagram" } else { "stream" },
                    self.host
                );
                let result = if self.config.listen() {
                    ssl.accept(bio)
                } else {
                    ssl.connect(bio)
                };
                self.resolve_handshake(result)
            }
            State::Handshaking(mut mid) => {
                mid.get_mut().apply_nonblocking(false);
                let result = mid.handshake();
                self.resolve_handshake(result)
            }
            State::Established(stream) => {
                self.state = State::Established(stream);
                Ok(HandshakeStatus::Complete)
            }
            other => {
                self.state = other;
                Err(Error::Protocol("handshake on a finished session".into()))
            }
        }
    }

    fn resolve_handshake(
        &mut self,
        result: Result<SslStream<BioStream>, HandshakeError<BioStream>>,
    ) -> Result<HandshakeStatus, Error> {
        match result {
            Ok(stream) => {
                debug!(
                    "Handshake complete, state {}",
                    stream.ssl().state_string_long()
                );
                self.state = State::Established(stream);
                Ok(HandshakeStatus::Complete)
            }
            Err(HandshakeError::WouldBlock(mid)) => {
                if self.datagram {
                    self.state = State::Handshaking(mid);
                    Ok(HandshakeStatus::InProgress)
                } else {
                    // Stream handshakes run on a blocking transport; a
                    // would-block here means the transport ignored the
                    // blocking-mode switch.
                    self.state = State::Failed;
                    Err(Error::Io(io::Error::new(
                        io::ErrorKind::WouldBlock,
                        "stream handshake would block",
                    )))
                }
            }
            Err(HandshakeError::Failure(mut mid)) => {
                if self.datagram && mid.error().code() == ErrorCode::ZERO_RETURN {
                    // Clean-shutdown signal mid-handshake; try again.
                    self.state = State::Handshaking(mid);
                    return Ok(HandshakeStatus::InProgress);
                }
                let bio_err = mid.get_mut().take_io_error();
                let verify = mid.ssl().verify_result();
                let err = handshake_failure(mid.error(), bio_err, verify);
                self.state = State::Failed;
                Err(err)
            }
            Err(HandshakeError::SetupFailure(stack)) => {
                self.state = State::Failed;
                Err(crypto_error("handshake setup", stack))
            }
        }
    }

    /// Read decrypted application data.
    ///
    /// The caller's blocking preference is reapplied to the transport
    /// before every call. `Ok(0)` means the peer shut the session down.
    pub fn read(&mut self, buf: &mut [u8]) -> Result<usize, Error> {
        let nonblocking = self.nonblocking;
        let stream = self.established_mut()?;
        stream.get_mut().apply_nonblocking(nonblocking);

        match stream.ssl_read(buf) {
            Ok(n) => Ok(n),
            Err(e) => {
                let bio_err = stream.get_mut().take_io_error();
                classify_data_error(e, bio_err, nonblocking)
            }
        }
    }

    /// Write application data.
    ///
    /// Datagram payloads longer than the session MTU are silently clamped
    /// to it; chunking larger payloads is the caller's responsibility.
    pub fn write(&mut self, buf: &[u8]) -> Result<usize, Error> {
        let nonblocking = self.nonblocking;
        let len = if self.datagram {
            buf.len().min(self.config.mtu())
        } else {
            buf.len()
        };

        let stream = self.established_mut()?;
        stream.get_mut().apply_nonblocking(nonblocking);

        match stream.ssl_write(&buf[..len]) {
            Ok(n) => Ok(n),
            Err(e) => {
                let bio_err = stream.get_mut().take_io_error();
                classify_data_error(e, bio_err, nonblocking)
            }
        }
    }

    /// Export keying material from the established session.
    ///
    /// Uses the handshake extractor construction with the given label.
    /// Fails with [`Error::Protocol`] before the session is established or
    /// when the negotiated session does not support export.
    pub fn export_keying_material(&self, label: &str, out: &mut [u8]) -> Result<(), Error> {
        let State::Established(stream) = &self.state else {
            return Err(Error::Protocol("session not established".into()));
        };
        stream
            .ssl()
            .export_keying_material(out, label, None)
            .map_err(|e| Error::Protocol(describe_engine_errors("export keying material", &e)))
    }

    /// Export SRTP keying material under the fixed extractor label.
    pub fn export_srtp_keying_material(&self, out: &mut [u8]) -> Result<(), Error> {
        self.export_keying_material(SRTP_EXPORT_LABEL, out)
    }

    /// Set the blocking preference applied to subsequent reads and writes.
    pub fn set_nonblocking(&mut self, nonblocking: bool) {
        self.nonblocking = nonblocking;
    }

    /// The local credential presented in the handshake, if any.
    ///
    /// Listening sessions without configured material carry a generated
    /// ephemeral credential from open time.
    pub fn credential(&self) -> Option<&Credential> {
        self.credential.as_ref()
    }

    /// Colon-hex SHA-256 fingerprint of the local certificate, for
    /// out-of-band exchange with the peer.
    pub fn fingerprint(&self) -> Option<&str> {
        self.credential.as_ref().map(|c| c.fingerprint())
    }

    /// Negotiated MTU. Zero for stream sessions.
    pub fn mtu(&self) -> usize {
        self.config.mtu()
    }

    /// Whether the requested host was a literal IP address.
    pub fn numeric_host(&self) -> bool {
        self.numeric_host
    }

    /// The hostname requested at open time.
    pub fn host(&self) -> &str {
        &self.host
    }

    /// The port requested at open time.
    pub fn port(&self) -> u16 {
        self.port
    }

    /// Raw descriptor of the underlying transport for event-loop
    /// integration.
    pub fn descriptor(&self) -> Option<i64> {
        match &self.state {
            State::Connecting { bio, .. } => bio.descriptor(),
            State::Handshaking(mid) => mid.get_ref().descriptor(),
            State::Established(stream) => stream.get_ref().descriptor(),
            _ => None,
        }
    }

    /// Observable lifecycle state.
    pub fn state(&self) -> SessionState {
        match &self.state {
            State::Unopened => SessionState::Unopened,
            State::Connecting { .. } => SessionState::Connecting,
            State::Handshaking(_) => SessionState::Handshaking,
            State::Established(_) => SessionState::Established,
            State::Closed => SessionState::Closed,
            State::Failed => SessionState::Failed,
        }
    }

    /// Shut the session down.
    ///
    /// Sends a best-effort shutdown notification, then releases the engine
    /// context and, if owned, the transport. Idempotent; never surfaces an
    /// error. The state slot is replaced before resources drop so a repeat
    /// call is a detectable no-op.
    pub fn close(&mut self) {
        let prev = mem::replace(&mut self.state, State::Closed);
        match prev {
            State::Established(mut stream) => {
                if let Err(e) = stream.shutdown() {
                    debug!("Shutdown notification failed: {e}");
                }
                drain_engine_errors("close");
                if self.external {
                    trace!("Leaving external transport to its owner");
                }
            }
            State::Failed => {
                // Failed is terminal; keep it observable.
                self.state = State::Failed;
            }
            _ => {}
        }
    }

    fn established_mut(&mut self) -> Result<&mut SslStream<BioStream>, Error> {
        match &mut self.state {
            State::Established(stream) => Ok(stream),
            _ => Err(Error::Protocol("session not established".into())),
        }
    }
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("datagram", &self.datagram)
            .field("state", &self.state())
            .finish()
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.close();
    }
}

fn scheme_is_datagram(uri: &str) -> Result<bool, Error> {
    match opener::parse_uri(uri)?.scheme {
        "tls" => Ok(false),
        "dtls" => Ok(true),
        other => Err(Error::Config(format!("unsupported scheme: {other}"))),
    }
}

/// Collapse a data-path engine error into the public taxonomy.
///
/// Retry signals map to [`Error::WouldBlock`] only when the caller asked
/// for non-blocking semantics on this call; a clean shutdown maps to
/// `Ok(0)`.
fn classify_data_error(
    err: openssl::ssl::Error,
    bio_err: Option<io::Error>,
    nonblocking: bool,
) -> Result<usize, Error> {
    let code = err.code();
    if code == ErrorCode::ZERO_RETURN {
        return Ok(0);
    }
    if nonblocking && (code == ErrorCode::WANT_READ || code == ErrorCode::WANT_WRITE) {
        return Err(Error::WouldBlock);
    }
    // End of stream without a close_notify from the peer.
    if code == ErrorCode::SYSCALL && bio_err.is_none() && err.io_error().is_none() {
        return Ok(0);
    }
    Err(hard_io_error(err, bio_err))
}

fn hard_io_error(err: openssl::ssl::Error, bio_err: Option<io::Error>) -> Error {
    if let Some(stack) = err.ssl_error() {
        let _ = describe_engine_errors("secure channel", stack);
    }
    drain_engine_errors("secure channel");

    if let Some(io_err) = bio_err {
        warn!("Transport error: {io_err}");
        return Error::Io(io_err);
    }
    match err.into_io_error() {
        Ok(io_err) => Error::Io(io_err),
        Err(_) => Error::Io(io::Error::new(io::ErrorKind::Other, "secure channel failure")),
    }
}

fn handshake_failure(
    err: &openssl::ssl::Error,
    bio_err: Option<io::Error>,
    verify: X509VerifyResult,
) -> Error {
    if let Some(stack) = err.ssl_error() {
        let _ = describe_engine_errors("handshake", stack);
    }
    drain_engine_errors("handshake");

    if let Some(io_err) = bio_err {
        warn!("Handshake transport error: {io_err}");
        return Error::Io(io_err);
    }
    if verify != X509VerifyResult::OK {
        return Error::Protocol(format!(
            "certificate verification failed: {}",
            verify.error_string()
        ));
    }
    Error::Protocol(format!("handshake rejected: {err}"))
}
