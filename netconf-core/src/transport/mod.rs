//! Byte-level transports under a NETCONF session.
//!
//! Each variant implements [`TransportIo`], the one contract the rest of
//! the crate sees: `read` returns `Ok(0)` for "no data available right
//! now" (never EOF), short reads are allowed, `write_all` loops until
//! everything is on the wire, and `poll` waits for readability with every
//! signal blocked so the wait cannot be interrupted.

use std::io;
use std::os::fd::{AsRawFd, OwnedFd, RawFd};
use std::time::{Duration, Instant};

use crate::error::{Error, Result};

pub mod ssh;
pub mod tls;

pub use ssh::{SshConnection, SshTransport};
pub use tls::{TlsStream, TlsTransport};

/// Outcome of waiting for inbound data.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Poll {
    Readable,
    TimedOut,
}

/// Per-message read budget.
///
/// Constructed once when a message read starts; every empty read on any
/// transport charges it one sleep step. The budget is a monotonic deadline,
/// so a read started with budget `T` fails with [`Error::ReadTimeout`] no
/// later than `T` plus one step after it started.
pub(crate) struct Ticker {
    deadline: Instant,
    step: Duration,
}

impl Ticker {
    pub(crate) fn new(budget: Duration, step: Duration) -> Ticker {
        Ticker {
            deadline: Instant::now() + budget,
            step,
        }
    }

    pub(crate) fn step(&self) -> Duration {
        self.step
    }

    /// Sleep one step; fail once the deadline has passed.
    pub(crate) fn tick(&mut self) -> Result<()> {
        std::thread::sleep(self.step);
        if Instant::now() >= self.deadline {
            return Err(Error::ReadTimeout);
        }
        Ok(())
    }
}

/// Which transport a session runs on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportKind {
    Fd,
    Ssh,
    Tls,
}

/// Byte-level contract every transport implements.
pub trait TransportIo: Send {
    /// One read attempt. `Ok(0)` means no data is available now; EOF and
    /// hard failures come back as [`Error::PeerClosed`] and
    /// [`Error::TransportBroken`].
    fn read(&mut self, buf: &mut [u8], step: Duration) -> Result<usize>;

    /// One write attempt; `Ok(0)` means the transport cannot take data yet.
    fn write(&mut self, buf: &[u8]) -> Result<usize>;

    /// Descriptor a poll-set watches for this transport.
    fn raw_fd(&self) -> RawFd;

    /// Write all of `buf`, sleeping one step whenever the transport cannot
    /// make progress. Partial writes never leak out of this call.
    fn write_all(&mut self, buf: &[u8], step: Duration) -> Result<()> {
        let mut written = 0;
        while written < buf.len() {
            let n = self.write(&buf[written..])?;
            if n == 0 {
                std::thread::sleep(step);
            }
            written += n;
        }
        Ok(())
    }

    /// Wait for inbound data. The calling thread's signal mask is fully
    /// blocked for the duration of the wait and restored before returning.
    fn poll(&mut self, timeout: Option<Duration>) -> Result<Poll> {
        poll_readable(self.raw_fd(), timeout)
    }
}

/// Transport handle of one session. The variant is fixed for the whole
/// session lifetime.
pub enum Transport {
    /// Raw file descriptor pair (in, out).
    Fd(FdTransport),
    /// Channel of a (possibly shared) SSH session.
    Ssh(SshTransport),
    /// TLS stream over a TCP socket.
    Tls(TlsTransport),
}

impl Transport {
    pub(crate) fn kind(&self) -> TransportKind {
        match self {
            Transport::Fd(_) => TransportKind::Fd,
            Transport::Ssh(_) => TransportKind::Ssh,
            Transport::Tls(_) => TransportKind::Tls,
        }
    }

    fn io(&self) -> &dyn TransportIo {
        match self {
            Transport::Fd(t) => t,
            Transport::Ssh(t) => t,
            Transport::Tls(t) => t,
        }
    }

    fn io_mut(&mut self) -> &mut dyn TransportIo {
        match self {
            Transport::Fd(t) => t,
            Transport::Ssh(t) => t,
            Transport::Tls(t) => t,
        }
    }

    pub(crate) fn read(&mut self, buf: &mut [u8], step: Duration) -> Result<usize> {
        self.io_mut().read(buf, step)
    }

    pub(crate) fn write_all(&mut self, buf: &[u8], step: Duration) -> Result<()> {
        self.io_mut().write_all(buf, step)
    }

    pub(crate) fn poll(&mut self, timeout: Option<Duration>) -> Result<Poll> {
        self.io_mut().poll(timeout)
    }

    /// Non-blocking liveness check: a zero-timeout poll with no HUP/ERR
    /// condition present. Used before every write to avoid feeding a dead
    /// socket (and the SIGPIPE that would follow).
    pub(crate) fn is_connected(&self) -> bool {
        let mut pfd = libc::pollfd {
            fd: self.raw_fd(),
            events: libc::POLLIN,
            revents: 0,
        };
        loop {
            let ret = unsafe { libc::poll(&mut pfd, 1, 0) };
            if ret == -1 {
                if io::Error::last_os_error().kind() == io::ErrorKind::Interrupted {
                    continue;
                }
                return false;
            }
            return ret == 0 || pfd.revents & (libc::POLLHUP | libc::POLLERR) == 0;
        }
    }

    pub(crate) fn raw_fd(&self) -> RawFd {
        self.io().raw_fd()
    }

    /// Returns a byte to the head of the stream. Only one byte may be
    /// pending; the poll-set uses this after probing an SSH channel.
    pub(crate) fn push_back(&mut self, byte: u8) {
        match self {
            Transport::Ssh(t) => t.push_back(byte),
            Transport::Fd(_) | Transport::Tls(_) => unreachable!("push_back on unprobed transport"),
        }
    }
}

/// Wait for readability on one descriptor and map the revents the same
/// way for every transport.
pub(crate) fn poll_readable(fd: RawFd, timeout: Option<Duration>) -> Result<Poll> {
    let revents = poll_masked(fd, timeout_ms(timeout))?;
    if revents == 0 {
        return Ok(Poll::TimedOut);
    }
    if revents & (libc::POLLHUP | libc::POLLNVAL) != 0 {
        return Err(Error::PeerClosed);
    }
    if revents & libc::POLLERR != 0 {
        return Err(Error::TransportBroken("poll reported a socket error".into()));
    }
    Ok(Poll::Readable)
}

/// `poll(2)` on one descriptor with every signal blocked for the wait.
/// Returns the revents, 0 on timeout.
fn poll_masked(fd: RawFd, timeout_ms: i32) -> Result<i16> {
    let mut pfd = libc::pollfd {
        fd,
        events: libc::POLLIN,
        revents: 0,
    };
    let mut mask: libc::sigset_t = unsafe { std::mem::zeroed() };
    let mut orig: libc::sigset_t = unsafe { std::mem::zeroed() };
    let (ret, err) = unsafe {
        libc::sigfillset(&mut mask);
        libc::pthread_sigmask(libc::SIG_SETMASK, &mask, &mut orig);
        let ret = libc::poll(&mut pfd, 1, timeout_ms);
        let err = io::Error::last_os_error();
        libc::pthread_sigmask(libc::SIG_SETMASK, &orig, std::ptr::null_mut());
        (ret, err)
    };
    if ret < 0 {
        return Err(Error::TransportBroken(format!("poll failed ({err})")));
    }
    if ret == 0 {
        return Ok(0);
    }
    Ok(pfd.revents)
}

pub(crate) fn timeout_ms(timeout: Option<Duration>) -> i32 {
    match timeout {
        None => -1,
        Some(t) => t.as_millis().min(i32::MAX as u128) as i32,
    }
}

/// Transport over a caller-provided descriptor pair. The descriptors are
/// owned by the transport, switched to non-blocking mode and closed when
/// the session goes away.
pub struct FdTransport {
    fd_in: OwnedFd,
    fd_out: OwnedFd,
}

impl FdTransport {
    pub fn new(fd_in: OwnedFd, fd_out: OwnedFd) -> io::Result<FdTransport> {
        set_nonblocking(fd_in.as_raw_fd())?;
        if fd_out.as_raw_fd() != fd_in.as_raw_fd() {
            set_nonblocking(fd_out.as_raw_fd())?;
        }
        Ok(FdTransport { fd_in, fd_out })
    }
}

impl TransportIo for FdTransport {
    fn read(&mut self, buf: &mut [u8], step: Duration) -> Result<usize> {
        loop {
            let ret = unsafe {
                libc::read(
                    self.fd_in.as_raw_fd(),
                    buf.as_mut_ptr() as *mut libc::c_void,
                    buf.len(),
                )
            };
            if ret < 0 {
                let err = io::Error::last_os_error();
                return match err.kind() {
                    io::ErrorKind::WouldBlock => Ok(0),
                    io::ErrorKind::Interrupted => {
                        std::thread::sleep(step);
                        continue;
                    }
                    _ => Err(Error::TransportBroken(format!(
                        "reading from file descriptor {} failed ({err})",
                        self.fd_in.as_raw_fd()
                    ))),
                };
            }
            if ret == 0 {
                return Err(Error::PeerClosed);
            }
            return Ok(ret as usize);
        }
    }

    fn write(&mut self, buf: &[u8]) -> Result<usize> {
        loop {
            let ret = unsafe {
                libc::write(
                    self.fd_out.as_raw_fd(),
                    buf.as_ptr() as *const libc::c_void,
                    buf.len(),
                )
            };
            if ret < 0 {
                let err = io::Error::last_os_error();
                return match err.kind() {
                    io::ErrorKind::WouldBlock => Ok(0),
                    io::ErrorKind::Interrupted => continue,
                    io::ErrorKind::BrokenPipe => Err(Error::PeerClosed),
                    _ => Err(Error::TransportBroken(format!("socket error ({err})"))),
                };
            }
            return Ok(ret as usize);
        }
    }

    fn raw_fd(&self) -> RawFd {
        self.fd_in.as_raw_fd()
    }
}

fn set_nonblocking(fd: RawFd) -> io::Result<()> {
    unsafe {
        let flags = libc::fcntl(fd, libc::F_GETFL);
        if flags == -1 {
            return Err(io::Error::last_os_error());
        }
        if libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) == -1 {
            return Err(io::Error::last_os_error());
        }
    }
    Ok(())
}
