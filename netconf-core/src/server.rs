//! Server-side registry shared by every server session of one
//! [`Context`](crate::Context): named endpoints and the session-id
//! counter.
//!
//! Listening sockets and connection acceptance live in the embedder; an
//! endpoint here is the configuration record the embedder's listener is
//! built from. Adding or removing endpoints takes the registry write
//! lock; mutating one takes the read lock plus that endpoint's own mutex,
//! so unrelated endpoints never contend.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Mutex, RwLock};
use std::time::Duration;

use crate::config::Config;
use crate::error::{Error, Result};
use crate::transport::TransportKind;

/// Connection settings of one endpoint.
#[derive(Debug, Clone, Default)]
pub struct EndpointOpts {
    pub address: Option<String>,
    pub port: u16,
}

struct Endpoint {
    name: String,
    kind: TransportKind,
    opts: Mutex<EndpointOpts>,
}

pub struct ServerState {
    endpoints: RwLock<Vec<Endpoint>>,
    next_sid: AtomicU32,
    hello_timeout: Option<Duration>,
    idle_timeout: Option<Duration>,
}

impl ServerState {
    pub(crate) fn new(config: &Config) -> ServerState {
        ServerState {
            endpoints: RwLock::new(Vec::new()),
            next_sid: AtomicU32::new(1),
            hello_timeout: config.hello_timeout,
            idle_timeout: config.idle_timeout,
        }
    }

    /// Allocate the id for a new server session. Ids are process-unique
    /// and monotonically increasing.
    pub fn next_session_id(&self) -> u32 {
        self.next_sid.fetch_add(1, Ordering::Relaxed)
    }

    pub fn hello_timeout(&self) -> Option<Duration> {
        self.hello_timeout
    }

    pub fn idle_timeout(&self) -> Option<Duration> {
        self.idle_timeout
    }

    pub fn add_endpoint(&self, name: &str, kind: TransportKind) -> Result<()> {
        let mut endpoints = self.endpoints.write().unwrap_or_else(|e| e.into_inner());
        if endpoints.iter().any(|e| e.name == name) {
            log::error!("Endpoint \"{name}\" already exists.");
            return Err(Error::Internal(format!("endpoint \"{name}\" already exists")));
        }
        endpoints.push(Endpoint {
            name: name.to_string(),
            kind,
            opts: Mutex::new(EndpointOpts::default()),
        });
        Ok(())
    }

    pub fn del_endpoint(&self, name: &str) -> Result<()> {
        let mut endpoints = self.endpoints.write().unwrap_or_else(|e| e.into_inner());
        match endpoints.iter().position(|e| e.name == name) {
            Some(pos) => {
                endpoints.remove(pos);
                Ok(())
            }
            None => Err(Error::Internal(format!("no endpoint \"{name}\""))),
        }
    }

    pub fn endpoint_count(&self) -> usize {
        self.endpoints
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .len()
    }

    pub fn endpoint_kind(&self, name: &str) -> Option<TransportKind> {
        self.endpoints
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .find(|e| e.name == name)
            .map(|e| e.kind)
    }

    /// Inspect or mutate one endpoint's settings under its own lock.
    pub fn with_endpoint<R>(
        &self,
        name: &str,
        f: impl FnOnce(&mut EndpointOpts) -> R,
    ) -> Result<R> {
        let endpoints = self.endpoints.read().unwrap_or_else(|e| e.into_inner());
        let endpoint = endpoints
            .iter()
            .find(|e| e.name == name)
            .ok_or_else(|| Error::Internal(format!("no endpoint \"{name}\"")))?;
        let mut opts = endpoint.opts.lock().unwrap_or_else(|e| e.into_inner());
        Ok(f(&mut opts))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_session_ids_increase() {
        let state = ServerState::new(&Config::default());
        assert_eq!(state.next_session_id(), 1);
        assert_eq!(state.next_session_id(), 2);
        assert_eq!(state.next_session_id(), 3);
    }

    #[test]
    fn test_endpoint_names_are_unique() {
        let state = ServerState::new(&Config::default());
        state.add_endpoint("main", TransportKind::Ssh).unwrap();
        assert!(state.add_endpoint("main", TransportKind::Tls).is_err());
        assert_eq!(state.endpoint_count(), 1);
        assert_eq!(state.endpoint_kind("main"), Some(TransportKind::Ssh));

        state
            .with_endpoint("main", |opts| {
                opts.address = Some("::".to_string());
                opts.port = 830;
            })
            .unwrap();
        let port = state.with_endpoint("main", |opts| opts.port).unwrap();
        assert_eq!(port, 830);

        state.del_endpoint("main").unwrap();
        assert_eq!(state.endpoint_count(), 0);
    }
}
