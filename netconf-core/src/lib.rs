//! # netconf-core
//!
//! Transport-agnostic NETCONF session core: message framing for both
//! NETCONF 1.0 end-tag and NETCONF 1.1 chunked framing ([RFC6242]),
//! uniform byte transports (file descriptor pair, SSH channel, TLS
//! stream), the session state machine and a multi-session poller.
//!
//! XML bodies are handed over as UTF-8 text; parsing and serializing the
//! payload trees is left to the embedder.
//!
//! [RFC6242]: https://www.rfc-editor.org/rfc/rfc6242.html

use std::sync::Arc;

pub mod config;
pub mod error;
pub mod framer;
pub mod message;
pub mod pollset;
pub mod server;
pub mod session;
pub mod transport;

pub use config::Config;
pub use error::{Error, Result};
pub use message::{Message, MsgKind};
pub use session::{Session, SessionBuilder, Side, Status, TermReason, Version};

pub const NC_NS_BASE: &str = "urn:ietf:params:xml:ns:netconf:base:1.0";
pub const NC_NS_NOTIF: &str = "urn:ietf:params:xml:ns:netconf:notification:1.0";
pub const NC_CAP_BASE_10: &str = "urn:ietf:params:netconf:base:1.0";
pub const NC_CAP_BASE_11: &str = "urn:ietf:params:netconf:base:1.1";

/// Process-wide library context.
///
/// Owns the configuration defaults and the server-side registry. Create one
/// per process and hand an [`Arc<Context>`] to every session; the last
/// clone dropping releases the shared state.
pub struct Context {
    config: Config,
    server: server::ServerState,
}

impl Context {
    pub fn new(config: Config) -> Arc<Context> {
        Arc::new(Context {
            server: server::ServerState::new(&config),
            config,
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn server(&self) -> &server::ServerState {
        &self.server
    }
}

impl Default for Context {
    fn default() -> Self {
        let config = Config::default();
        Context {
            server: server::ServerState::new(&config),
            config,
        }
    }
}
