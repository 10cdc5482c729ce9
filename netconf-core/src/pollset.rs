//! Multi-session poller.
//!
//! Workers calling [`PollSet::poll`] take turns: each joins a bounded
//! FIFO of worker ids and proceeds only when its id reaches the head, so
//! wakeups happen in arrival order and at most `queue_depth` workers wait
//! at once. The turn holder polls every session descriptor, grabs the
//! transport-access lock of one readable session and reads a single
//! message from it.

use std::collections::VecDeque;
use std::os::fd::RawFd;
use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use bitflags::bitflags;

use crate::config::Config;
use crate::error::{Error, Result};
use crate::message::{Message, MsgKind};
use crate::session::{Session, Status, TermReason};
use crate::transport::{timeout_ms, TransportKind};

bitflags! {
    /// What a poll call observed.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct PollFlags: u16 {
        const TIMEOUT       = 0x0001;
        const RPC           = 0x0002;
        const REPLY         = 0x0004;
        const HELLO         = 0x0008;
        const NOTIF         = 0x0010;
        /// Another session sharing the readable SSH socket owns the data.
        const PENDING       = 0x0020;
        const SESSION_TERM  = 0x0040;
        const SESSION_ERROR = 0x0080;
        const SSH_MSG       = 0x0100;
        const SSH_CHANNEL   = 0x0200;
        const ERROR         = 0x0400;
        /// A session's transport lock was contended.
        const BUSY          = 0x0800;
    }
}

/// Result of one [`PollSet::poll`] call: the status bits, the session
/// they concern (if any) and the message that was read (if one was).
#[derive(Debug)]
pub struct PollOutcome {
    pub flags: PollFlags,
    pub session: Option<Arc<Session>>,
    pub message: Option<Message>,
}

impl PollOutcome {
    fn status(flags: PollFlags) -> PollOutcome {
        PollOutcome {
            flags,
            session: None,
            message: None,
        }
    }

    fn on_session(flags: PollFlags, session: &Arc<Session>) -> PollOutcome {
        PollOutcome {
            flags,
            session: Some(Arc::clone(session)),
            message: None,
        }
    }
}

struct PsEntry {
    session: Arc<Session>,
    fd: RawFd,
    /// Events left over from an earlier poll round, served before polling
    /// again.
    revents: i16,
}

struct PsState {
    entries: Vec<PsEntry>,
    /// Waiting worker ids, head holds the turn.
    queue: VecDeque<u8>,
}

/// A set of sessions polled together by any number of worker threads.
pub struct PollSet {
    state: Mutex<PsState>,
    cond: Condvar,
    queue_depth: usize,
    lock_timeout: Duration,
}

impl Default for PollSet {
    fn default() -> Self {
        PollSet::new(&Config::default())
    }
}

impl PollSet {
    pub fn new(config: &Config) -> PollSet {
        PollSet {
            state: Mutex::new(PsState {
                entries: Vec::new(),
                queue: VecDeque::new(),
            }),
            cond: Condvar::new(),
            queue_depth: config.queue_depth,
            lock_timeout: config.read_timeout,
        }
    }

    pub fn add_session(&self, session: Arc<Session>) -> Result<()> {
        let fd = session.transport_guard().raw_fd();
        let turn = self.turn_acquire()?;
        let ret = {
            let mut state = self.state_guard();
            state.entries.push(PsEntry {
                session,
                fd,
                revents: 0,
            });
            Ok(())
        };
        self.turn_release(turn);
        ret
    }

    pub fn del_session(&self, session: &Arc<Session>) -> Result<()> {
        let turn = self.turn_acquire()?;
        let ret = {
            let mut state = self.state_guard();
            match state
                .entries
                .iter()
                .position(|e| Arc::ptr_eq(&e.session, session))
            {
                Some(pos) => {
                    state.entries.swap_remove(pos);
                    Ok(())
                }
                None => Err(Error::Internal(
                    "session is not part of the poll set".to_string(),
                )),
            }
        };
        self.turn_release(turn);
        ret
    }

    pub fn session_count(&self) -> usize {
        self.state_guard().entries.len()
    }

    /// Drop every session that is no longer running; with `all`, drop
    /// every session unconditionally.
    pub fn clear(&self, all: bool) -> Result<()> {
        let turn = self.turn_acquire()?;
        {
            let mut state = self.state_guard();
            if all {
                state.entries.clear();
            } else {
                state
                    .entries
                    .retain(|e| e.session.status() == Status::Running);
            }
        }
        self.turn_release(turn);
        Ok(())
    }

    /// Wait up to `timeout` for anything to happen on any session and
    /// serve one event. `None` waits forever.
    pub fn poll(&self, timeout: Option<Duration>) -> Result<PollOutcome> {
        let turn = self.turn_acquire()?;
        let ret = self.poll_turn(timeout);
        self.turn_release(turn);
        ret
    }

    fn poll_turn(&self, timeout: Option<Duration>) -> Result<PollOutcome> {
        let (sessions, fds, mut revents): (Vec<Arc<Session>>, Vec<RawFd>, Vec<i16>) = {
            let state = self.state_guard();
            (
                state.entries.iter().map(|e| Arc::clone(&e.session)).collect(),
                state.entries.iter().map(|e| e.fd).collect(),
                state.entries.iter().map(|e| e.revents).collect(),
            )
        };
        if sessions.is_empty() {
            return Err(Error::Internal("poll set has no sessions".to_string()));
        }

        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs();
        for session in &sessions {
            if session.status() != Status::Running {
                log::error!("Session {}: session not running.", session.id());
                return Ok(PollOutcome::on_session(PollFlags::ERROR, session));
            }
            if session.idle_expired(now) {
                log::error!("Session {}: session idle timeout elapsed.", session.id());
                session.invalidate(TermReason::Timeout);
                self.store_revents(&revents);
                return Ok(PollOutcome::on_session(
                    PollFlags::SESSION_TERM | PollFlags::SESSION_ERROR,
                    session,
                ));
            }
        }

        // poll only when no leftover event is waiting to be served
        if revents.iter().all(|&r| r == 0) {
            let mut pfds: Vec<libc::pollfd> = fds
                .iter()
                .map(|&fd| libc::pollfd {
                    fd,
                    events: libc::POLLIN,
                    revents: 0,
                })
                .collect();
            let ret = unsafe { libc::poll(pfds.as_mut_ptr(), pfds.len() as libc::nfds_t, timeout_ms(timeout)) };
            if ret < 0 {
                let err = std::io::Error::last_os_error();
                log::error!("Poll failed ({err}).");
                return Ok(PollOutcome::status(PollFlags::ERROR));
            }
            if ret == 0 {
                return Ok(PollOutcome::status(PollFlags::TIMEOUT));
            }
            for (slot, pfd) in revents.iter_mut().zip(&pfds) {
                *slot = pfd.revents;
            }
        }

        let mut busy: Option<Arc<Session>> = None;
        let mut pending = false;
        for i in 0..sessions.len() {
            let rev = revents[i];
            if rev == 0 {
                continue;
            }
            let session = &sessions[i];
            if rev & (libc::POLLHUP | libc::POLLNVAL) != 0 {
                log::error!(
                    "Session {}: communication socket unexpectedly closed.",
                    session.id()
                );
                session.invalidate(TermReason::Dropped);
                revents[i] = 0;
                self.store_revents(&revents);
                return Ok(PollOutcome::on_session(
                    PollFlags::SESSION_TERM | PollFlags::SESSION_ERROR,
                    session,
                ));
            }
            if rev & libc::POLLERR != 0 {
                log::error!("Session {}: communication socket error.", session.id());
                session.invalidate(TermReason::Other);
                revents[i] = 0;
                self.store_revents(&revents);
                return Ok(PollOutcome::on_session(
                    PollFlags::SESSION_TERM | PollFlags::SESSION_ERROR,
                    session,
                ));
            }
            if rev & libc::POLLIN == 0 {
                revents[i] = 0;
                continue;
            }

            // reading one message and reacting to it must be atomic
            let io_guard = match session.io_lock().acquire(timeout) {
                Ok(guard) => guard,
                Err(Error::Busy) => {
                    busy = Some(Arc::clone(session));
                    continue;
                }
                Err(err) => return Err(err),
            };
            let mut transport = session.transport_guard();

            if transport.kind() == TransportKind::Ssh {
                // the socket is readable, but the data may belong to a
                // sibling channel; probe the channel itself
                let mut probe = [0u8; 1];
                match transport.read(&mut probe, session.config().timeout_step) {
                    Ok(0) => {
                        revents[i] = 0;
                        pending = true;
                        continue;
                    }
                    Ok(_) => transport.push_back(probe[0]),
                    Err(err) => {
                        drop(transport);
                        drop(io_guard);
                        let err = session.fatal_from(err);
                        revents[i] = 0;
                        self.store_revents(&revents);
                        return Ok(self.terminated(session, err));
                    }
                }
            }

            let result = session.read_msg_locked(&mut transport);
            drop(transport);
            drop(io_guard);

            revents[i] = 0;
            // siblings polling the same socket already had their event
            // consumed by this read
            for j in 0..revents.len() {
                if j != i && fds[j] == fds[i] {
                    revents[j] = 0;
                }
            }
            let remaining = revents.iter().any(|&r| r != 0);
            self.store_revents(&revents);

            return match result {
                Ok(message) => {
                    let mut flags = match message.kind {
                        MsgKind::Rpc => PollFlags::RPC,
                        MsgKind::Reply => PollFlags::REPLY,
                        MsgKind::Hello => PollFlags::HELLO,
                        MsgKind::Notif => PollFlags::NOTIF,
                    };
                    if remaining || pending {
                        flags |= PollFlags::PENDING;
                    }
                    Ok(PollOutcome {
                        flags,
                        session: Some(Arc::clone(session)),
                        message: Some(message),
                    })
                }
                Err(err) => Ok(self.terminated(session, err)),
            };
        }

        self.store_revents(&revents);
        if let Some(session) = busy {
            return Ok(PollOutcome {
                flags: PollFlags::BUSY,
                session: Some(session),
                message: None,
            });
        }
        if pending {
            return Ok(PollOutcome::status(PollFlags::PENDING));
        }
        Ok(PollOutcome::status(PollFlags::TIMEOUT))
    }

    fn terminated(&self, session: &Arc<Session>, err: Error) -> PollOutcome {
        log::error!("Session {}: {err}", session.id());
        let mut flags = PollFlags::SESSION_TERM;
        if !matches!(
            session.term_reason(),
            TermReason::Closed | TermReason::Killed
        ) {
            flags |= PollFlags::SESSION_ERROR;
        }
        PollOutcome::on_session(flags, session)
    }

    fn store_revents(&self, revents: &[i16]) {
        let mut state = self.state_guard();
        for (entry, &rev) in state.entries.iter_mut().zip(revents) {
            entry.revents = rev;
        }
    }

    fn state_guard(&self) -> std::sync::MutexGuard<'_, PsState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Join the fair queue and wait for our turn. Fails fast with
    /// [`Error::Busy`] when the queue is already full.
    fn turn_acquire(&self) -> Result<u8> {
        let mut state = self.state_guard();
        if state.queue.len() == self.queue_depth {
            log::error!("Poll set queue too small.");
            return Err(Error::Busy);
        }
        let id = state
            .queue
            .back()
            .map(|last| last.wrapping_add(1))
            .unwrap_or(0);
        state.queue.push_back(id);

        let deadline = Instant::now() + self.lock_timeout;
        while *state.queue.front().unwrap_or(&id) != id {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                if let Some(pos) = state.queue.iter().position(|&q| q == id) {
                    state.queue.remove(pos);
                }
                return Err(Error::Internal(
                    "timed out waiting for the poll set queue".to_string(),
                ));
            }
            state = self
                .cond
                .wait_timeout(state, remaining)
                .unwrap_or_else(|e| e.into_inner())
                .0;
        }
        Ok(id)
    }

    fn turn_release(&self, id: u8) {
        let mut state = self.state_guard();
        debug_assert_eq!(state.queue.front(), Some(&id));
        if let Some(pos) = state.queue.iter().position(|&q| q == id) {
            state.queue.remove(pos);
        }
        // everyone re-checks whether the head moved to them
        self.cond.notify_all();
    }
}
