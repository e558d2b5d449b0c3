//! Adapter between the abstract transport and the crypto engine.
//!
//! The engine drives all of its record I/O through one duplex byte stream.
//! [`BioStream`] implements that shape over a [`Transport`] and performs the
//! three-way classification the engine relies on: end-of-stream becomes a
//! clean zero-byte result, would-block becomes a retry signal that does not
//! abort the in-flight operation, and anything else is latched in the
//! last-I/O-error slot as a hard failure.

use std::io::{self, Read, Write};
use std::net::SocketAddr;

use log::{trace, warn};

use crate::transport::Transport;

pub(crate) struct BioStream {
    transport: Box<dyn Transport>,
    /// Latch the first datagram sender as the sole remote peer.
    pin_peer: bool,
    peer: Option<SocketAddr>,
    /// Last hard transport error, for sessions to collapse into their
    /// public error taxonomy.
    io_err: Option<io::Error>,
}

impl BioStream {
    pub fn new(transport: Box<dyn Transport>, pin_peer: bool) -> Self {
        BioStream {
            transport,
            pin_peer,
            peer: None,
            io_err: None,
        }
    }

    /// Reapply the caller's blocking preference to the transport.
    pub fn apply_nonblocking(&mut self, nonblocking: bool) {
        if let Err(e) = self.transport.set_nonblocking(nonblocking) {
            warn!("Failed to switch transport blocking mode: {e}");
        }
    }

    pub fn take_io_error(&mut self) -> Option<io::Error> {
        self.io_err.take()
    }

    pub fn descriptor(&self) -> Option<i64> {
        self.transport.descriptor()
    }

    /// The pinned remote peer, once learned.
    pub fn peer(&self) -> Option<SocketAddr> {
        self.peer
    }

    fn record(&mut self, e: io::Error) -> io::Error {
        self.io_err = Some(io::Error::new(e.kind(), e.to_string()));
        e
    }

    /// Pin the transport to the sender of the first received datagram.
    fn pin_first_sender(&mut self) -> io::Result<()> {
        if !self.pin_peer || self.peer.is_some() {
            return Ok(());
        }
        let Some(addr) = self.transport.last_peer_addr() else {
            return Ok(());
        };
        self.transport.set_peer_addr(addr)?;
        self.peer = Some(addr);
        trace!("Pinned remote peer {addr}, transport now connected");
        Ok(())
    }
}

impl Read for BioStream {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self.transport.read(buf) {
            Ok(n) => {
                if let Err(e) = self.pin_first_sender() {
                    warn!("Failed to pin remote peer: {e}");
                    return Err(self.record(e));
                }
                Ok(n)
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => Err(e),
            // Cancellation surfaces as a clean shutdown, not a hard error.
            Err(e) if e.kind() == io::ErrorKind::Interrupted => Ok(0),
            Err(e) => Err(self.record(e)),
        }
    }
}

impl Write for BioStream {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self.transport.write(buf) {
            Ok(n) => Ok(n),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => Err(e),
            Err(e) if e.kind() == io::ErrorKind::Interrupted => Ok(0),
            Err(e) => Err(self.record(e)),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}
