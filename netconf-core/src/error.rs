use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Ssh(#[from] ssh2::Error),
    #[error(transparent)]
    Tls(#[from] rustls::Error),
    #[error(transparent)]
    Xml(#[from] quick_xml::Error),
    #[error(transparent)]
    SerializingFailure(#[from] quick_xml::DeError),
    #[error("transport failed: {0}")]
    TransportBroken(String),
    #[error("peer closed the connection")]
    PeerClosed,
    #[error("reading a full NETCONF message timeout elapsed")]
    ReadTimeout,
    #[error("invalid message framing: {0}")]
    Framing(&'static str),
    #[error("malformed message root element")]
    MalformedMessage,
    #[error("invalid <hello> message: {0}")]
    BadHello(String),
    #[error("session is not in a usable state")]
    Invalidated,
    #[error("session is busy")]
    Busy,
    #[error("internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Whether this failure invalidates the session it occurred on.
    /// [`Error::Busy`] and [`Error::Invalidated`] leave the session state
    /// untouched; everything else is terminal for the session.
    pub fn is_fatal(&self) -> bool {
        !matches!(self, Error::Busy | Error::Invalidated)
    }
}
