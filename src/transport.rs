//! The underlying-transport contract.
//!
//! Secure sessions run on top of an abstract byte transport supplied by the
//! caller. A [`TransportProvider`] resolves plain transport URLs (`tcp`,
//! `udp`, and the HTTP-CONNECT tunnel scheme `httpproxy`) into open
//! [`Transport`] handles; the session never touches sockets directly.

use std::fmt;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;

use crate::Error;

/// An open duplex transport.
///
/// I/O semantics follow `std::io`:
///
/// * `Ok(0)` from [`read`](Transport::read) means end of stream.
/// * [`io::ErrorKind::WouldBlock`] is the retry signal when the transport is
///   in non-blocking mode.
/// * [`io::ErrorKind::Interrupted`] means the caller-supplied interrupt
///   callback fired during a blocking wait.
///
/// Dropping the handle releases the transport. A handle shared with the
/// caller (an external transport) must keep the underlying resource alive
/// independently, typically through shared ownership.
pub trait Transport {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize>;

    fn write(&mut self, buf: &[u8]) -> io::Result<usize>;

    /// Switch the transport between blocking and non-blocking mode.
    fn set_nonblocking(&mut self, nonblocking: bool) -> io::Result<()>;

    /// Raw descriptor for external event-loop integration, if there is one.
    fn descriptor(&self) -> Option<i64> {
        None
    }

    /// Source address of the most recently received datagram.
    ///
    /// Only meaningful for unconnected datagram transports.
    fn last_peer_addr(&self) -> Option<SocketAddr> {
        None
    }

    /// Restrict a connectionless transport to a single remote peer.
    fn set_peer_addr(&mut self, _addr: SocketAddr) -> io::Result<()> {
        Err(io::Error::new(
            io::ErrorKind::Unsupported,
            "transport does not support peer pinning",
        ))
    }
}

/// Opens transports by URL.
///
/// The session layer hands the provider URLs of the form
/// `scheme://host:port?query`. At minimum the `tcp`, `udp` and `httpproxy`
/// schemes must be handled for stream, datagram and proxy-tunneled sessions
/// respectively.
pub trait TransportProvider {
    fn open(&self, url: &str, options: &OpenOptions) -> Result<Box<dyn Transport>, Error>;
}

/// Options passed to [`TransportProvider::open`].
#[derive(Clone, Default)]
pub struct OpenOptions {
    /// Local address to bind (datagram listeners).
    pub local_addr: Option<String>,

    /// Local port to bind. Zero forces an ephemeral port.
    pub local_port: Option<u16>,

    /// Treat the datagram socket as explicitly connected to the remote.
    pub connect: bool,

    /// Inbound queuing depth. Zero disables buffering.
    pub recv_queue: Option<usize>,

    /// Maximum packet size the transport should accept.
    pub max_packet: Option<usize>,

    /// Polled by the transport during blocking open/connect waits.
    pub interrupt: Interrupt,
}

impl fmt::Debug for OpenOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OpenOptions")
            .field("local_addr", &self.local_addr)
            .field("local_port", &self.local_port)
            .field("connect", &self.connect)
            .field("recv_queue", &self.recv_queue)
            .field("max_packet", &self.max_packet)
            .finish()
    }
}

/// Caller-supplied cancellation callback.
///
/// Transports poll this periodically while blocked in open or connect. Once
/// a session is established there is no cooperative cancellation; closing
/// the transport is the only way to abort an in-flight blocking call.
#[derive(Clone, Default)]
pub struct Interrupt(Option<Arc<dyn Fn() -> bool + Send + Sync>>);

impl Interrupt {
    pub fn new(f: impl Fn() -> bool + Send + Sync + 'static) -> Self {
        Interrupt(Some(Arc::new(f)))
    }

    /// True once the callback requests cancellation. Never true when no
    /// callback was supplied.
    pub fn is_interrupted(&self) -> bool {
        self.0.as_ref().map(|f| f()).unwrap_or(false)
    }
}

impl fmt::Debug for Interrupt {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Interrupt").field(&self.0.is_some()).finish()
    }
}
