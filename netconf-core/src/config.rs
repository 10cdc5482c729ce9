use std::time::Duration;

/// Partial message read budget in seconds, also used as the transport-access
/// lock timeout.
pub const READ_TIMEOUT: Duration = Duration::from_secs(30);

/// Sleep between two empty transport reads.
pub const TIMEOUT_STEP: Duration = Duration::from_micros(100);

/// Growth step of the inbound framing buffer.
pub const FRAMING_BUF_SIZE: usize = 512;

/// Outbound write buffer, two framing buffers worth.
pub const WRITE_BUF_SIZE: usize = 2 * FRAMING_BUF_SIZE;

/// Waiting workers a poll-set queues before refusing further ones.
pub const POLL_QUEUE_DEPTH: usize = 6;

/// How long a client waits for the server's `<hello>`.
pub const CLIENT_HELLO_TIMEOUT: Duration = Duration::from_secs(60);

/// How long a client waits for the `<ok/>` reply to `<close-session>`.
pub const CLOSE_REPLY_TIMEOUT: Duration = Duration::from_millis(200);

/// Embedder-tunable knobs. `Config::default()` matches the protocol
/// constants above; sessions copy the config they were built with, so
/// changing a [`Config`] never affects live sessions.
#[derive(Debug, Clone)]
pub struct Config {
    /// Per-message read budget.
    pub read_timeout: Duration,
    /// Sleep step between empty reads.
    pub timeout_step: Duration,
    /// Inbound framing buffer growth step.
    pub framing_buf_size: usize,
    /// Outbound write buffer capacity.
    pub write_buf_size: usize,
    /// Poll-set fair-queue depth.
    pub queue_depth: usize,
    /// Server-side wait for the client's `<hello>`. `None` waits forever.
    pub hello_timeout: Option<Duration>,
    /// Server-side idle cutoff since the last RPC. `None` disables it.
    pub idle_timeout: Option<Duration>,
    /// Lowest protocol version this peer is willing to negotiate.
    pub version_floor: crate::session::Version,
}

impl Default for Config {
    fn default() -> Config {
        Config {
            read_timeout: READ_TIMEOUT,
            timeout_step: TIMEOUT_STEP,
            framing_buf_size: FRAMING_BUF_SIZE,
            write_buf_size: WRITE_BUF_SIZE,
            queue_depth: POLL_QUEUE_DEPTH,
            hello_timeout: None,
            idle_timeout: None,
            version_floor: crate::session::Version::V10,
        }
    }
}

impl Config {
    pub fn read_timeout(mut self, timeout: Duration) -> Config {
        self.read_timeout = timeout;
        self
    }

    pub fn timeout_step(mut self, step: Duration) -> Config {
        self.timeout_step = step;
        self
    }

    pub fn hello_timeout(mut self, timeout: Duration) -> Config {
        self.hello_timeout = Some(timeout);
        self
    }

    pub fn idle_timeout(mut self, timeout: Duration) -> Config {
        self.idle_timeout = Some(timeout);
        self
    }

    pub fn version_floor(mut self, floor: crate::session::Version) -> Config {
        self.version_floor = floor;
        self
    }
}
