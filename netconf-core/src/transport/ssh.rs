//! SSH channel transport.
//!
//! Authentication, key exchange and channel/subsystem setup happen in the
//! embedder; this module only moves bytes over an established channel.
//! Several NETCONF sessions may multiplex over one SSH session on distinct
//! channels; they all share one [`SshConnection`] and with it one
//! transport-access lock, so only one sibling touches the socket at a time.

use std::io::{Read, Write};
use std::net::TcpStream;
use std::os::fd::{AsRawFd, RawFd};
use std::sync::Arc;
use std::time::Duration;

use super::{poll_readable, Poll, TransportIo};
use crate::error::{Error, Result};
use crate::session::IoLock;

/// Shared owner of one SSH session: the `ssh2` session handle, the TCP
/// socket it was handshaken over, and the transport-access lock every
/// sibling NETCONF session on this connection shares. libssh2 sessions
/// must not be driven from two threads at once, which is exactly what the
/// shared lock serializes.
pub struct SshConnection {
    session: std::sync::Mutex<ssh2::Session>,
    stream: TcpStream,
    lock: Arc<IoLock>,
}

impl SshConnection {
    /// Takes over an authenticated session and the stream it runs on.
    /// The session is switched to non-blocking mode; channels must be
    /// opened by the embedder before or after this call.
    pub fn new(session: ssh2::Session, stream: TcpStream) -> Arc<SshConnection> {
        session.set_blocking(false);
        Arc::new(SshConnection {
            session: std::sync::Mutex::new(session),
            stream,
            lock: Arc::new(IoLock::new()),
        })
    }

    /// Run `f` against the underlying `ssh2` session, e.g. to open another
    /// channel for a sibling NETCONF session.
    pub fn with_session<R>(&self, f: impl FnOnce(&ssh2::Session) -> R) -> R {
        let session = self.session.lock().unwrap_or_else(|e| e.into_inner());
        f(&session)
    }

    /// The transport-access lock shared by all sessions on this connection.
    pub(crate) fn io_lock(&self) -> Arc<IoLock> {
        Arc::clone(&self.lock)
    }
}

pub struct SshTransport {
    conn: Arc<SshConnection>,
    channel: ssh2::Channel,
    /// Byte the poll-set probed off the channel, handed back on next read.
    pending: Option<u8>,
}

impl SshTransport {
    pub fn new(conn: Arc<SshConnection>, channel: ssh2::Channel) -> SshTransport {
        SshTransport {
            conn,
            channel,
            pending: None,
        }
    }

    pub(crate) fn connection(&self) -> &Arc<SshConnection> {
        &self.conn
    }

    fn has_buffered(&self) -> bool {
        self.pending.is_some()
    }

    fn at_eof(&self) -> bool {
        self.channel.eof()
    }

    pub(crate) fn push_back(&mut self, byte: u8) {
        debug_assert!(self.pending.is_none());
        self.pending = Some(byte);
    }
}

impl TransportIo for SshTransport {
    fn read(&mut self, buf: &mut [u8], _step: Duration) -> Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        if let Some(byte) = self.pending.take() {
            buf[0] = byte;
            return Ok(1);
        }
        match self.channel.read(buf) {
            Ok(0) => {
                if self.channel.eof() {
                    Err(Error::PeerClosed)
                } else {
                    Ok(0)
                }
            }
            Ok(n) => Ok(n),
            Err(err) if err.kind() == std::io::ErrorKind::WouldBlock => Ok(0),
            Err(err) => Err(Error::TransportBroken(format!(
                "reading from the SSH channel failed ({err})"
            ))),
        }
    }

    fn write(&mut self, buf: &[u8]) -> Result<usize> {
        if self.channel.eof() {
            return Err(Error::PeerClosed);
        }
        match self.channel.write(buf) {
            Ok(n) => Ok(n),
            Err(err) if err.kind() == std::io::ErrorKind::WouldBlock => Ok(0),
            Err(err) => Err(Error::TransportBroken(format!(
                "SSH channel write failed ({err})"
            ))),
        }
    }

    fn raw_fd(&self) -> RawFd {
        self.conn.stream.as_raw_fd()
    }

    /// The channel may hold a probed byte, and channel EOF is not visible
    /// on the socket; both are checked before waiting on the descriptor.
    fn poll(&mut self, timeout: Option<Duration>) -> Result<Poll> {
        if self.has_buffered() {
            return Ok(Poll::Readable);
        }
        if self.at_eof() {
            return Err(Error::PeerClosed);
        }
        poll_readable(self.raw_fd(), timeout)
    }
}
