//! NETCONF session: state machine, transport-access locking, hello
//! handshake and the message read/write operations.
//!
//! A session is shared between threads behind an [`Arc`]; every read or
//! write takes the transport-access lock for the duration of one whole
//! message, so concurrent callers serialize and the wire never carries
//! interleaved bytes. Sessions multiplexed over one SSH connection share
//! that lock.

use std::os::fd::OwnedFd;
use std::sync::atomic::{AtomicU32, AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;

use crate::config::{self, Config};
use crate::error::{Error, Result};
use crate::framer::WriteBuffer;
use crate::message::{self, Message, MsgKind, RootInfo, RpcError, ServerReply};
use crate::transport::{
    FdTransport, Poll, SshConnection, Ticker, TlsStream, TlsTransport, Transport,
};
use crate::{Context, NC_CAP_BASE_10, NC_CAP_BASE_11, NC_NS_BASE, NC_NS_NOTIF};

/// Which end of the conversation this session is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Side {
    Client,
    Server,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Status {
    /// Constructed, hello exchange not finished.
    Starting = 0,
    /// Hello done, transport healthy.
    Running = 1,
    /// Terminal; the termination reason is set.
    Invalid = 2,
    /// Caller-initiated graceful close in progress.
    Closing = 3,
}

impl Status {
    fn from_u8(value: u8) -> Status {
        match value {
            0 => Status::Starting,
            1 => Status::Running,
            2 => Status::Invalid,
            _ => Status::Closing,
        }
    }
}

/// Why a session became [`Status::Invalid`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum TermReason {
    None = 0,
    Closed = 1,
    Killed = 2,
    Dropped = 3,
    Timeout = 4,
    Other = 5,
}

impl TermReason {
    fn from_u8(value: u8) -> TermReason {
        match value {
            0 => TermReason::None,
            1 => TermReason::Closed,
            2 => TermReason::Killed,
            3 => TermReason::Dropped,
            4 => TermReason::Timeout,
            _ => TermReason::Other,
        }
    }
}

/// NETCONF protocol version, fixed once the hello exchange completes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum Version {
    /// NETCONF 1.0 - RFC 4741, 4742
    V10 = 0,
    /// NETCONF 1.1 - RFC 6241, 6242
    V11 = 1,
}

impl Version {
    fn from_u8(value: u8) -> Version {
        if value == 0 {
            Version::V10
        } else {
            Version::V11
        }
    }
}

/// Whether a session status still admits transport I/O.
pub(crate) fn io_allowed(status: &AtomicU8) -> bool {
    matches!(
        Status::from_u8(status.load(Ordering::SeqCst)),
        Status::Starting | Status::Running
    )
}

/// Transport-access lock of one session.
///
/// A mutex-protected in-use flag with a condition variable, acquired with
/// a timeout: exceeding it reports [`Error::Busy`] instead of deadlocking.
/// SSH-multiplexed sibling sessions share one of these via [`Arc`], so
/// only one channel drives the socket at a time.
pub(crate) struct IoLock {
    in_use: Mutex<bool>,
    cond: Condvar,
}

pub(crate) struct IoGuard<'a> {
    lock: &'a IoLock,
}

impl IoLock {
    pub(crate) fn new() -> IoLock {
        IoLock {
            in_use: Mutex::new(false),
            cond: Condvar::new(),
        }
    }

    /// `None` waits forever, zero tries once; both paths hand back a guard
    /// that releases on drop.
    pub(crate) fn acquire(&self, timeout: Option<Duration>) -> Result<IoGuard<'_>> {
        let mut in_use = self
            .in_use
            .lock()
            .map_err(|_| Error::Internal("session lock poisoned".to_string()))?;
        match timeout {
            Some(timeout) if timeout.is_zero() => {
                if *in_use {
                    return Err(Error::Busy);
                }
            }
            Some(timeout) => {
                let deadline = Instant::now() + timeout;
                while *in_use {
                    let remaining = deadline.saturating_duration_since(Instant::now());
                    if remaining.is_zero() {
                        return Err(Error::Busy);
                    }
                    in_use = self
                        .cond
                        .wait_timeout(in_use, remaining)
                        .map_err(|_| Error::Internal("session lock poisoned".to_string()))?
                        .0;
                }
            }
            None => {
                while *in_use {
                    in_use = self
                        .cond
                        .wait(in_use)
                        .map_err(|_| Error::Internal("session lock poisoned".to_string()))?;
                }
            }
        }
        *in_use = true;
        Ok(IoGuard { lock: self })
    }
}

impl Drop for IoGuard<'_> {
    fn drop(&mut self) {
        if let Ok(mut in_use) = self.lock.in_use.lock() {
            *in_use = false;
        }
        self.lock.cond.notify_one();
    }
}

/// One NETCONF conversation over one transport.
///
/// `Debug` is implemented manually (rather than derived) because the
/// underlying transport types (ssh2/rustls) don't implement it.
pub struct Session {
    id: AtomicU32,
    side: Side,
    status: AtomicU8,
    term_reason: AtomicU8,
    version: AtomicU8,
    config: Config,
    context: Arc<Context>,
    io_lock: Arc<IoLock>,
    transport: Mutex<Transport>,
    /// Next outbound message id minus one; the first RPC goes out as 1.
    msgid: AtomicU64,
    /// Peer capabilities learned from its hello (client side).
    capabilities: Mutex<Vec<String>>,
    session_start: SystemTime,
    /// Unix seconds of the last RPC received (server side), 0 before any.
    last_rpc: AtomicU64,
}

impl Session {
    pub fn id(&self) -> u32 {
        self.id.load(Ordering::SeqCst)
    }

    pub fn side(&self) -> Side {
        self.side
    }

    pub fn status(&self) -> Status {
        Status::from_u8(self.status.load(Ordering::SeqCst))
    }

    pub fn term_reason(&self) -> TermReason {
        TermReason::from_u8(self.term_reason.load(Ordering::SeqCst))
    }

    pub fn version(&self) -> Version {
        Version::from_u8(self.version.load(Ordering::SeqCst))
    }

    pub fn transport_kind(&self) -> crate::transport::TransportKind {
        self.transport_guard().kind()
    }

    /// Capabilities the peer advertised in its hello.
    pub fn capabilities(&self) -> Vec<String> {
        self.capabilities
            .lock()
            .map(|caps| caps.clone())
            .unwrap_or_default()
    }

    pub fn session_start(&self) -> SystemTime {
        self.session_start
    }

    pub fn context(&self) -> &Arc<Context> {
        &self.context
    }

    /// Force the session invalid from any thread; in-flight operations
    /// notice on their next transport round.
    pub fn kill(&self) {
        log::warn!("Session {}: killed.", self.id());
        self.invalidate(TermReason::Killed);
    }

    pub(crate) fn invalidate(&self, reason: TermReason) {
        if self.status() != Status::Invalid {
            self.term_reason.store(reason as u8, Ordering::SeqCst);
            self.status.store(Status::Invalid as u8, Ordering::SeqCst);
        }
    }

    pub(crate) fn config(&self) -> &Config {
        &self.config
    }

    pub(crate) fn io_lock(&self) -> &Arc<IoLock> {
        &self.io_lock
    }

    pub(crate) fn transport_guard(&self) -> MutexGuard<'_, Transport> {
        self.transport.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub(crate) fn idle_expired(&self, now: u64) -> bool {
        let idle = match self.config.idle_timeout {
            Some(idle) => idle.as_secs(),
            None => return false,
        };
        let last = self.last_rpc.load(Ordering::SeqCst);
        last != 0 && now >= last + idle
    }

    fn touch_last_rpc(&self) {
        self.last_rpc.store(unix_now(), Ordering::SeqCst);
    }

    fn check_io_status(&self) -> Result<()> {
        if io_allowed(&self.status) {
            Ok(())
        } else {
            Err(Error::Invalidated)
        }
    }

    /// Record a terminal failure on this session and hand the error back.
    pub(crate) fn fatal_from(&self, err: Error) -> Error {
        if !err.is_fatal() {
            return err;
        }
        let reason = match &err {
            Error::PeerClosed => TermReason::Dropped,
            _ => TermReason::Other,
        };
        log::error!("Session {}: {err}", self.id());
        self.invalidate(reason);
        err
    }

    /// Read one complete message, blocking until it arrives or the
    /// per-message budget runs out.
    pub fn read_msg(&self) -> Result<Message> {
        self.check_io_status()?;
        let _io = self.io_lock.acquire(Some(self.config.read_timeout))?;
        let mut transport = self.transport_guard();
        self.read_msg_locked(&mut transport)
    }

    /// Wait up to `timeout` for inbound data and read one message.
    /// `Ok(None)` means nothing arrived in time; `None` as timeout waits
    /// forever.
    pub fn read_msg_poll(&self, timeout: Option<Duration>) -> Result<Option<Message>> {
        self.check_io_status()?;
        let _io = self.io_lock.acquire(Some(self.config.read_timeout))?;
        let mut transport = self.transport_guard();
        match transport.poll(timeout) {
            Ok(Poll::TimedOut) => Ok(None),
            Ok(Poll::Readable) => self.read_msg_locked(&mut transport).map(Some),
            Err(err) => Err(self.fatal_from(err)),
        }
    }

    /// Read one message with the transport-access lock already held.
    pub(crate) fn read_msg_locked(&self, transport: &mut Transport) -> Result<Message> {
        self.check_io_status()?;
        let mut ticker = Ticker::new(self.config.read_timeout, self.config.timeout_step);
        let body = match crate::framer::read_msg_body(
            transport,
            &self.status,
            self.version(),
            self.config.framing_buf_size,
            &mut ticker,
            None,
        ) {
            Ok(body) => body,
            Err(err @ Error::Framing(_)) => return Err(self.reject_malformed(transport, err)),
            Err(err) => return Err(self.fatal_from(err)),
        };
        log::debug!(
            "Session {}: received message:\n{}",
            self.id(),
            String::from_utf8_lossy(&body)
        );

        let text = match String::from_utf8(body) {
            Ok(text) => text,
            Err(_) => return Err(self.reject_malformed(transport, Error::MalformedMessage)),
        };
        let (kind, root) = match message::classify(&text) {
            Ok(classified) => classified,
            Err(err) => return Err(self.reject_malformed(transport, err)),
        };

        if self.side == Side::Server && kind == MsgKind::Rpc {
            self.touch_last_rpc();
        }
        Ok(Message {
            kind,
            root,
            body: text,
        })
    }

    /// Malformed input: a 1.1 server owes the peer an error reply before
    /// the session goes down; everyone else tears down silently.
    fn reject_malformed(&self, transport: &mut Transport, err: Error) -> Error {
        log::error!("Session {}: malformed message received.", self.id());
        if self.side == Side::Server && self.version() == Version::V11 {
            let reply = ServerReply::error(vec![RpcError::malformed_message()]);
            if self.write_reply_locked(transport, None, &reply).is_err() {
                log::error!(
                    "Session {}: unable to send a \"Malformed message\" error reply, terminating session.",
                    self.id()
                );
            }
        }
        self.fatal_from(err)
    }

    fn with_write<F>(&self, emit: F) -> Result<()>
    where
        F: FnOnce(&mut WriteBuffer) -> Result<()>,
    {
        self.check_io_status()?;
        let _io = self.io_lock.acquire(Some(self.config.read_timeout))?;
        let mut transport = self.transport_guard();
        self.write_locked(&mut transport, emit)
    }

    pub(crate) fn write_locked<F>(&self, transport: &mut Transport, emit: F) -> Result<()>
    where
        F: FnOnce(&mut WriteBuffer) -> Result<()>,
    {
        self.check_io_status()?;
        let mut out = WriteBuffer::new(
            transport,
            &self.status,
            self.version(),
            self.config.write_buf_size,
            self.config.timeout_step,
        );
        match emit(&mut out).and_then(|()| out.finish()) {
            Ok(()) => Ok(()),
            Err(err) => Err(self.fatal_from(err)),
        }
    }

    /// Send one `<rpc>` carrying the serialized operation. Returns the
    /// message-id it went out with; ids start at 1 and increase by one per
    /// RPC.
    pub fn write_rpc(&self, operation: &str, attrs: Option<&str>) -> Result<u64> {
        self.check_io_status()?;
        let _io = self.io_lock.acquire(Some(self.config.read_timeout))?;
        let mut transport = self.transport_guard();
        // allocated under the lock, so ids hit the wire in order
        let msgid = self.msgid.fetch_add(1, Ordering::SeqCst) + 1;
        self.write_locked(&mut transport, |out| {
            let start = format!(
                "<rpc xmlns=\"{NC_NS_BASE}\" message-id=\"{msgid}\"{}>",
                attrs.unwrap_or("")
            );
            out.write(start.as_bytes())?;
            out.write(operation.as_bytes())?;
            out.write(b"</rpc>")
        })?;
        Ok(msgid)
    }

    /// Send one `<rpc-reply>`, mirroring the originating rpc's prefix and
    /// attributes. `rpc_root` may be absent only for a malformed-message
    /// reply, in which case just the base namespace is written.
    pub fn write_reply(&self, rpc_root: Option<&RootInfo>, reply: &ServerReply) -> Result<()> {
        self.with_write(|out| emit_reply(out, rpc_root, reply))
    }

    pub(crate) fn write_reply_locked(
        &self,
        transport: &mut Transport,
        rpc_root: Option<&RootInfo>,
        reply: &ServerReply,
    ) -> Result<()> {
        self.write_locked(transport, |out| emit_reply(out, rpc_root, reply))
    }

    /// Send one `<notification>` with the given event time and serialized
    /// payload tree.
    pub fn write_notif(&self, event_time: OffsetDateTime, tree: &str) -> Result<()> {
        let stamp = event_time
            .format(&Rfc3339)
            .map_err(|err| Error::Internal(format!("formatting eventTime failed ({err})")))?;
        self.with_write(|out| {
            out.write(format!("<notification xmlns=\"{NC_NS_NOTIF}\">").as_bytes())?;
            out.write(b"<eventTime>")?;
            out.write(stamp.as_bytes())?;
            out.write(b"</eventTime>")?;
            out.write(tree.as_bytes())?;
            out.write(b"</notification>")
        })
    }

    /// Send the `<hello>` message. Hello always travels in 1.0 framing, so
    /// this refuses sessions already upgraded to 1.1. The session id is
    /// only written by servers.
    pub fn write_hello(&self, capabilities: &[&str], session_id: Option<u32>) -> Result<()> {
        if self.version() != Version::V10 {
            return Err(Error::Internal(
                "<hello> must be sent with NETCONF 1.0 framing".to_string(),
            ));
        }
        self.with_write(|out| {
            out.write(format!("<hello xmlns=\"{NC_NS_BASE}\"><capabilities>").as_bytes())?;
            for capability in capabilities {
                out.write(b"<capability>")?;
                out.write_escaped(capability.as_bytes())?;
                out.write(b"</capability>")?;
            }
            match session_id {
                Some(session_id) => {
                    out.write(
                        format!("</capabilities><session-id>{session_id}</session-id></hello>")
                            .as_bytes(),
                    )
                }
                None => out.write(b"</capabilities></hello>"),
            }
        })
    }

    /// Drive the hello exchange with the base capabilities and move the
    /// session from [`Status::Starting`] to [`Status::Running`].
    pub fn handshake(&self) -> Result<()> {
        self.handshake_with(&[])
    }

    /// Like [`handshake`](Self::handshake), advertising `extra`
    /// capabilities on top of the base ones.
    pub fn handshake_with(&self, extra: &[&str]) -> Result<()> {
        if self.status() != Status::Starting {
            return Err(Error::Invalidated);
        }

        let mut capabilities = Vec::with_capacity(2 + extra.len());
        if self.config.version_floor == Version::V10 {
            capabilities.push(NC_CAP_BASE_10);
        }
        capabilities.push(NC_CAP_BASE_11);
        capabilities.extend_from_slice(extra);

        match self.side {
            Side::Client => {
                self.write_hello(&capabilities, None)?;
                self.recv_hello_as_client()?;
            }
            Side::Server => {
                self.write_hello(&capabilities, Some(self.id()))?;
                self.recv_hello_as_server()?;
            }
        }

        self.status.store(Status::Running as u8, Ordering::SeqCst);
        if self.side == Side::Server {
            self.touch_last_rpc();
        }
        log::debug!(
            "Session {}: established at NETCONF version 1.{}.",
            self.id(),
            self.version() as u8
        );
        Ok(())
    }

    fn recv_hello_as_client(&self) -> Result<()> {
        let msg = match self.read_msg_poll(Some(config::CLIENT_HELLO_TIMEOUT))? {
            Some(msg) => msg,
            None => {
                log::error!("Server's <hello> timeout elapsed.");
                return Err(self.fatal_from(Error::ReadTimeout));
            }
        };
        if msg.kind != MsgKind::Hello {
            return Err(self.fatal_from(Error::BadHello(
                "unexpected message received instead of <hello>".to_string(),
            )));
        }
        let (capabilities, session_id) = match message::parse_hello(&msg.body) {
            Ok(parsed) => parsed,
            Err(err) => return Err(self.fatal_from(err)),
        };
        let session_id = match session_id {
            Some(session_id) => session_id,
            None => {
                return Err(self.fatal_from(Error::BadHello(
                    "missing <session-id> in server's <hello>".to_string(),
                )))
            }
        };
        let version = match self.negotiate_version(&capabilities) {
            Ok(version) => version,
            Err(err) => return Err(self.fatal_from(err)),
        };

        self.id.store(session_id, Ordering::SeqCst);
        self.version.store(version as u8, Ordering::SeqCst);
        if let Ok(mut stored) = self.capabilities.lock() {
            *stored = capabilities;
        }
        Ok(())
    }

    fn recv_hello_as_server(&self) -> Result<()> {
        let msg = match self.read_msg_poll(self.config.hello_timeout)? {
            Some(msg) => msg,
            None => {
                log::error!("Client's <hello> timeout elapsed.");
                return Err(self.fatal_from(Error::ReadTimeout));
            }
        };
        if msg.kind != MsgKind::Hello {
            return Err(self.fatal_from(Error::BadHello(
                "unexpected message received instead of <hello>".to_string(),
            )));
        }
        let (capabilities, session_id) = match message::parse_hello(&msg.body) {
            Ok(parsed) => parsed,
            Err(err) => return Err(self.fatal_from(err)),
        };
        if session_id.is_some() {
            return Err(self.fatal_from(Error::BadHello(
                "unexpected <session-id> element in client's <hello>".to_string(),
            )));
        }
        let version = match self.negotiate_version(&capabilities) {
            Ok(version) => version,
            Err(err) => return Err(self.fatal_from(err)),
        };
        self.version.store(version as u8, Ordering::SeqCst);
        Ok(())
    }

    fn negotiate_version(&self, peer_capabilities: &[String]) -> Result<Version> {
        match message::base_version(peer_capabilities) {
            Some(version) if version >= self.config.version_floor => Ok(version),
            _ => Err(Error::BadHello(
                "peer does not support a compatible NETCONF version".to_string(),
            )),
        }
    }

    /// Graceful close. A running client sends `<close-session>` and waits
    /// briefly for the `<ok/>` reply; either way the session ends up
    /// [`Status::Invalid`] with reason [`TermReason::Closed`].
    pub fn close(&self) -> Result<()> {
        if self.status() == Status::Invalid {
            return Ok(());
        }
        if self.side == Side::Client && self.status() == Status::Running {
            match self.write_rpc("<close-session/>", None) {
                Ok(_) => match self.read_msg_poll(Some(config::CLOSE_REPLY_TIMEOUT)) {
                    Ok(Some(msg)) if msg.kind == MsgKind::Reply => {
                        if !msg.body.contains("<ok") {
                            log::warn!(
                                "Session {}: the reply to <close-session> was not <ok> as expected.",
                                self.id()
                            );
                        }
                    }
                    Ok(Some(_)) => {
                        log::warn!(
                            "Session {}: unexpected message while closing.",
                            self.id()
                        );
                    }
                    Ok(None) => {
                        log::warn!(
                            "Session {}: timeout for receiving a reply to <close-session> elapsed.",
                            self.id()
                        );
                    }
                    Err(err) => {
                        log::error!(
                            "Session {}: failed to receive a reply to <close-session> ({err}).",
                            self.id()
                        );
                    }
                },
                Err(err) => {
                    log::warn!(
                        "Session {}: unable to send <close-session> ({err}).",
                        self.id()
                    );
                }
            }
        }
        if self.status() != Status::Invalid {
            self.status.store(Status::Closing as u8, Ordering::SeqCst);
            self.term_reason
                .store(TermReason::Closed as u8, Ordering::SeqCst);
            self.status.store(Status::Invalid as u8, Ordering::SeqCst);
        }
        Ok(())
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id())
            .field("side", &self.side())
            .field("status", &self.status())
            .field("term_reason", &self.term_reason())
            .field("version", &self.version())
            .finish_non_exhaustive()
    }
}

fn emit_reply(out: &mut WriteBuffer, rpc_root: Option<&RootInfo>, reply: &ServerReply) -> Result<()> {
    let prefix = rpc_root.and_then(|root| root.prefix.as_deref());
    match prefix {
        Some(prefix) => {
            out.write(b"<")?;
            out.write(prefix.as_bytes())?;
            out.write(b":rpc-reply")?;
        }
        None => out.write(b"<rpc-reply")?,
    }
    match rpc_root {
        Some(root) => {
            out.write(root.attrs.as_bytes())?;
            out.write(b">")?;
        }
        // no originating rpc to mirror, put there at least the namespace
        None => out.write(format!(" xmlns=\"{NC_NS_BASE}\">").as_bytes())?,
    }

    match reply {
        ServerReply::Ok => out.write(b"<ok/>")?,
        ServerReply::Data { tree, .. } => out.write(tree.as_bytes())?,
        ServerReply::Error(errors) => {
            for error in errors {
                error.write_into(out)?;
            }
        }
    }

    match prefix {
        Some(prefix) => {
            out.write(b"</")?;
            out.write(prefix.as_bytes())?;
            out.write(b":rpc-reply>")
        }
        None => out.write(b"</rpc-reply>"),
    }
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

/// Assembles a [`Session`] around an established transport. Accepting
/// connections, SSH authentication and the TLS handshake happen before
/// this point, in the embedder.
pub struct SessionBuilder {
    side: Side,
    id: u32,
    version: Version,
    running: bool,
    config: Option<Config>,
}

impl SessionBuilder {
    pub fn new(side: Side) -> SessionBuilder {
        SessionBuilder {
            side,
            id: 0,
            version: Version::V10,
            running: false,
            config: None,
        }
    }

    pub fn id(mut self, id: u32) -> SessionBuilder {
        self.id = id;
        self
    }

    pub fn version(mut self, version: Version) -> SessionBuilder {
        self.version = version;
        self
    }

    /// Mark the session established, skipping the hello exchange. For
    /// embedders that negotiated capabilities themselves.
    pub fn running(mut self) -> SessionBuilder {
        self.running = true;
        self
    }

    pub fn config(mut self, config: Config) -> SessionBuilder {
        self.config = Some(config);
        self
    }

    /// Session over a raw descriptor pair.
    pub fn build_fd(
        self,
        context: Arc<Context>,
        fd_in: OwnedFd,
        fd_out: OwnedFd,
    ) -> Result<Arc<Session>> {
        let transport = Transport::Fd(FdTransport::new(fd_in, fd_out)?);
        Ok(self.build(context, transport, Arc::new(IoLock::new())))
    }

    /// Session over a channel of a (possibly shared) SSH connection. The
    /// transport-access lock is the connection's, shared with any sibling
    /// sessions.
    pub fn build_ssh(
        self,
        context: Arc<Context>,
        connection: Arc<SshConnection>,
        channel: ssh2::Channel,
    ) -> Arc<Session> {
        let io_lock = connection.io_lock();
        let transport = Transport::Ssh(crate::transport::SshTransport::new(connection, channel));
        self.build(context, transport, io_lock)
    }

    /// Session over an established TLS stream.
    pub fn build_tls(self, context: Arc<Context>, stream: TlsStream) -> Result<Arc<Session>> {
        let transport = Transport::Tls(TlsTransport::new(stream)?);
        Ok(self.build(context, transport, Arc::new(IoLock::new())))
    }

    fn build(self, context: Arc<Context>, transport: Transport, io_lock: Arc<IoLock>) -> Arc<Session> {
        let id = match (self.id, self.side) {
            (0, Side::Server) => context.server().next_session_id(),
            (id, _) => id,
        };
        let status = if self.running {
            Status::Running
        } else {
            Status::Starting
        };
        let config = self.config.unwrap_or_else(|| context.config().clone());
        Arc::new(Session {
            id: AtomicU32::new(id),
            side: self.side,
            status: AtomicU8::new(status as u8),
            term_reason: AtomicU8::new(TermReason::None as u8),
            version: AtomicU8::new(self.version as u8),
            config,
            context,
            io_lock,
            transport: Mutex::new(transport),
            msgid: AtomicU64::new(0),
            capabilities: Mutex::new(Vec::new()),
            session_start: SystemTime::now(),
            last_rpc: AtomicU64::new(0),
        })
    }
}
