//! TLS stream transport.
//!
//! The handshake, certificate checks and CRL policy are the embedder's
//! business; a session receives a finished `rustls` stream and only moves
//! bytes. Polling happens on the underlying socket, exactly like the file
//! descriptor transport.

use std::io::{Read, Write};
use std::net::TcpStream;
use std::os::fd::{AsRawFd, RawFd};
use std::time::Duration;

use rustls::{ClientConnection, ServerConnection, StreamOwned};

use super::TransportIo;
use crate::error::{Error, Result};

/// Established TLS stream of either side.
pub enum TlsStream {
    Client(StreamOwned<ClientConnection, TcpStream>),
    Server(StreamOwned<ServerConnection, TcpStream>),
}

impl TlsStream {
    fn sock(&self) -> &TcpStream {
        match self {
            TlsStream::Client(s) => &s.sock,
            TlsStream::Server(s) => &s.sock,
        }
    }

    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        match self {
            TlsStream::Client(s) => s.read(buf),
            TlsStream::Server(s) => s.read(buf),
        }
    }

    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        match self {
            TlsStream::Client(s) => s.write(buf),
            TlsStream::Server(s) => s.write(buf),
        }
    }
}

pub struct TlsTransport {
    stream: TlsStream,
}

impl TlsTransport {
    /// Takes over a finished TLS stream; the socket is switched to
    /// non-blocking mode so reads can report "no data yet".
    pub fn new(stream: TlsStream) -> std::io::Result<TlsTransport> {
        stream.sock().set_nonblocking(true)?;
        Ok(TlsTransport { stream })
    }
}

impl TransportIo for TlsTransport {
    fn read(&mut self, buf: &mut [u8], _step: Duration) -> Result<usize> {
        match self.stream.read(buf) {
            // orderly close_notify from the peer
            Ok(0) => Err(Error::PeerClosed),
            Ok(n) => Ok(n),
            Err(err) if err.kind() == std::io::ErrorKind::WouldBlock => Ok(0),
            Err(err) => Err(Error::TransportBroken(format!(
                "reading from the TLS session failed ({err})"
            ))),
        }
    }

    fn write(&mut self, buf: &[u8]) -> Result<usize> {
        match self.stream.write(buf) {
            Ok(n) => Ok(n),
            Err(err) if err.kind() == std::io::ErrorKind::WouldBlock => Ok(0),
            Err(err) => Err(Error::TransportBroken(format!("TLS write failed ({err})"))),
        }
    }

    fn raw_fd(&self) -> RawFd {
        self.stream.sock().as_raw_fd()
    }
}
