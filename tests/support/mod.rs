#![allow(unused)]

//! Transports for driving sessions in tests: in-memory packet queues for
//! single-threaded stepping and `std::net` sockets for loopback pairs.

use std::cell::RefCell;
use std::collections::VecDeque;
use std::io::{self, Read, Write};
use std::net::{SocketAddr, TcpListener, TcpStream, ToSocketAddrs, UdpSocket};
use std::rc::Rc;
use std::thread;
use std::time::Duration;

use tlswrap::{Error, OpenOptions, Session, TlsConfig, Transport, TransportProvider};

pub fn init_log() {
    let _ = env_logger::try_init();
}

/// A free TCP port on loopback.
pub fn free_tcp_port() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    listener.local_addr().unwrap().port()
}

/// A free UDP port on loopback.
pub fn free_udp_port() -> u16 {
    let socket = UdpSocket::bind("127.0.0.1:0").unwrap();
    socket.local_addr().unwrap().port()
}

/// Connect, retrying while the listener side is still coming up.
pub fn connect_when_listening(uri: &str, config: TlsConfig) -> Result<Session, Error> {
    let mut refused = None;
    for _ in 0..50 {
        match Session::connect(uri, config.clone(), &StdProvider) {
            Ok(session) => return Ok(session),
            Err(Error::Io(e)) if e.kind() == io::ErrorKind::ConnectionRefused => {
                refused = Some(Error::Io(e));
                thread::sleep(Duration::from_millis(100));
            }
            Err(e) => return Err(e),
        }
    }
    Err(refused.unwrap_or_else(|| Error::Config("listener never came up".into())))
}

/// One end of an in-memory packet pipe.
///
/// Reads pop whole packets; an empty queue reads as would-block, which is
/// what a datagram socket with nothing pending looks like.
pub struct MemTransport {
    rx: Rc<RefCell<VecDeque<Vec<u8>>>>,
    tx: Rc<RefCell<VecDeque<Vec<u8>>>>,
}

/// A connected pair of in-memory transports.
pub fn mem_pair() -> (MemTransport, MemTransport) {
    let ab = Rc::new(RefCell::new(VecDeque::new()));
    let ba = Rc::new(RefCell::new(VecDeque::new()));
    (
        MemTransport {
            rx: ba.clone(),
            tx: ab.clone(),
        },
        MemTransport { rx: ab, tx: ba },
    )
}

impl Transport for MemTransport {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self.rx.borrow_mut().pop_front() {
            Some(packet) => {
                let n = packet.len().min(buf.len());
                buf[..n].copy_from_slice(&packet[..n]);
                Ok(n)
            }
            None => Err(io::ErrorKind::WouldBlock.into()),
        }
    }

    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.tx.borrow_mut().push_back(buf.to_vec());
        Ok(buf.len())
    }

    fn set_nonblocking(&mut self, _nonblocking: bool) -> io::Result<()> {
        // Queues never block; the mode switch is a no-op.
        Ok(())
    }
}

/// Opens `tcp` and `udp` URLs over `std::net`.
pub struct StdProvider;

impl TransportProvider for StdProvider {
    fn open(&self, url: &str, options: &OpenOptions) -> Result<Box<dyn Transport>, Error> {
        let (scheme, rest) = url
            .split_once("://")
            .ok_or_else(|| Error::Config(format!("bad transport url: {url}")))?;
        let (authority, query) = match rest.split_once('?') {
            Some((a, q)) => (a, Some(q)),
            None => (rest, None),
        };
        match scheme {
            "tcp" => open_tcp(authority, query, options),
            "udp" => open_udp(authority, options),
            other => Err(Error::Config(format!("unsupported scheme: {other}"))),
        }
    }
}

fn open_tcp(
    authority: &str,
    query: Option<&str>,
    options: &OpenOptions,
) -> Result<Box<dyn Transport>, Error> {
    let listen = query
        .map(|q| q.split('&').any(|p| p == "listen=1"))
        .unwrap_or(false);

    if listen {
        let listener = TcpListener::bind(authority).map_err(Error::Io)?;
        listener.set_nonblocking(true).map_err(Error::Io)?;
        loop {
            match listener.accept() {
                Ok((stream, _)) => {
                    stream.set_nonblocking(false).map_err(Error::Io)?;
                    return Ok(Box::new(TcpTransport { stream }));
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    if options.interrupt.is_interrupted() {
                        return Err(Error::Io(io::Error::new(
                            io::ErrorKind::TimedOut,
                            "accept interrupted",
                        )));
                    }
                    thread::sleep(Duration::from_millis(20));
                }
                Err(e) => return Err(Error::Io(e)),
            }
        }
    }

    let addrs: Vec<SocketAddr> = authority
        .to_socket_addrs()
        .map_err(Error::Io)?
        .collect();
    let mut last = io::Error::new(io::ErrorKind::AddrNotAvailable, "no addresses resolved");
    loop {
        if options.interrupt.is_interrupted() {
            return Err(Error::Io(io::Error::new(
                io::ErrorKind::TimedOut,
                "connect interrupted",
            )));
        }
        for addr in &addrs {
            match TcpStream::connect_timeout(addr, Duration::from_millis(250)) {
                Ok(stream) => return Ok(Box::new(TcpTransport { stream })),
                Err(e) => last = e,
            }
        }
        // Keep waiting only while the network is slow, not when it said no.
        if last.kind() != io::ErrorKind::TimedOut {
            return Err(Error::Io(last));
        }
    }
}

fn open_udp(authority: &str, options: &OpenOptions) -> Result<Box<dyn Transport>, Error> {
    if options.connect {
        let local = ("0.0.0.0", options.local_port.unwrap_or(0));
        let socket = UdpSocket::bind(local).map_err(Error::Io)?;
        socket.connect(authority).map_err(Error::Io)?;
        Ok(Box::new(UdpTransport {
            socket,
            connected: true,
            last_peer: None,
        }))
    } else {
        let host = options.local_addr.clone().unwrap_or_else(|| "0.0.0.0".into());
        let port = options.local_port.unwrap_or(0);
        let socket = UdpSocket::bind((host.as_str(), port)).map_err(Error::Io)?;
        Ok(Box::new(UdpTransport {
            socket,
            connected: false,
            last_peer: None,
        }))
    }
}

pub struct TcpTransport {
    stream: TcpStream,
}

impl Transport for TcpTransport {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.stream.read(buf)
    }

    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.stream.write(buf)
    }

    fn set_nonblocking(&mut self, nonblocking: bool) -> io::Result<()> {
        self.stream.set_nonblocking(nonblocking)
    }

    fn descriptor(&self) -> Option<i64> {
        raw_descriptor_tcp(&self.stream)
    }
}

pub struct UdpTransport {
    socket: UdpSocket,
    connected: bool,
    last_peer: Option<SocketAddr>,
}

impl Transport for UdpTransport {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if self.connected {
            self.socket.recv(buf)
        } else {
            let (n, addr) = self.socket.recv_from(buf)?;
            self.last_peer = Some(addr);
            Ok(n)
        }
    }

    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if self.connected {
            self.socket.send(buf)
        } else if let Some(peer) = self.last_peer {
            self.socket.send_to(buf, peer)
        } else {
            Err(io::ErrorKind::NotConnected.into())
        }
    }

    fn set_nonblocking(&mut self, nonblocking: bool) -> io::Result<()> {
        self.socket.set_nonblocking(nonblocking)
    }

    fn descriptor(&self) -> Option<i64> {
        raw_descriptor_udp(&self.socket)
    }

    fn last_peer_addr(&self) -> Option<SocketAddr> {
        self.last_peer
    }

    fn set_peer_addr(&mut self, addr: SocketAddr) -> io::Result<()> {
        self.socket.connect(addr)?;
        self.connected = true;
        Ok(())
    }
}

#[cfg(unix)]
fn raw_descriptor_tcp(stream: &TcpStream) -> Option<i64> {
    use std::os::unix::io::AsRawFd;
    Some(stream.as_raw_fd() as i64)
}

#[cfg(not(unix))]
fn raw_descriptor_tcp(_stream: &TcpStream) -> Option<i64> {
    None
}

#[cfg(unix)]
fn raw_descriptor_udp(socket: &UdpSocket) -> Option<i64> {
    use std::os::unix::io::AsRawFd;
    Some(socket.as_raw_fd() as i64)
}

#[cfg(not(unix))]
fn raw_descriptor_udp(_socket: &UdpSocket) -> Option<i64> {
    None
}
