//! Message classification and the server reply model.
//!
//! A deframed body is classified by its root element: the base namespace
//! carries `rpc`, `rpc-reply` and `hello`, the notification namespace
//! carries `notification`; everything else is malformed. The root's
//! prefix and attribute text are kept verbatim so a server reply can
//! mirror them.

use quick_xml::events::Event;
use quick_xml::name::ResolveResult;
use quick_xml::NsReader;
use serde_derive::Deserialize;

use crate::error::{Error, Result};
use crate::framer::WriteBuffer;
use crate::{NC_CAP_BASE_10, NC_CAP_BASE_11, NC_NS_BASE, NC_NS_NOTIF};

/// Kind of a received message, decided by the root element.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MsgKind {
    Hello,
    Rpc,
    Reply,
    Notif,
}

/// Root element facts a reply needs to mirror: prefix and the verbatim
/// attribute text (notably `message-id`).
#[derive(Debug, Clone)]
pub struct RootInfo {
    pub name: String,
    pub namespace: String,
    pub prefix: Option<String>,
    /// Attributes re-serialized from the root start tag, each with a
    /// leading space, escaping untouched.
    pub attrs: String,
}

/// One complete received message. The body is the full message text as it
/// came off the wire (terminator stripped), ready for the embedder's XML
/// layer.
#[derive(Debug, Clone)]
pub struct Message {
    pub kind: MsgKind,
    pub root: RootInfo,
    pub body: String,
}

/// Determine the message kind from the root element's namespace and local
/// name. Anything unexpected, including an unbound root namespace, is a
/// malformed message.
pub fn classify(body: &str) -> Result<(MsgKind, RootInfo)> {
    let mut reader = NsReader::from_str(body);
    loop {
        let (resolve, event) = match reader.read_resolved_event() {
            Ok(ev) => ev,
            Err(err) => {
                log::error!("Invalid message ({err}).");
                return Err(Error::MalformedMessage);
            }
        };
        let start = match event {
            Event::Start(e) => e,
            Event::Empty(e) => e,
            Event::Decl(_) | Event::Text(_) | Event::Comment(_) | Event::PI(_) => continue,
            _ => return Err(Error::MalformedMessage),
        };

        let namespace = match resolve {
            ResolveResult::Bound(ns) => String::from_utf8_lossy(ns.into_inner()).into_owned(),
            _ => {
                log::error!("Invalid message root element (missing namespace).");
                return Err(Error::MalformedMessage);
            }
        };
        let name = String::from_utf8_lossy(start.local_name().into_inner()).into_owned();
        let prefix = start
            .name()
            .prefix()
            .map(|p| String::from_utf8_lossy(p.into_inner()).into_owned());

        let mut attrs = String::new();
        for attr in start.attributes() {
            let attr = attr.map_err(|_| Error::MalformedMessage)?;
            attrs.push(' ');
            attrs.push_str(&String::from_utf8_lossy(attr.key.into_inner()));
            attrs.push('=');
            attrs.push('"');
            attrs.push_str(&String::from_utf8_lossy(&attr.value));
            attrs.push('"');
        }

        let kind = match (namespace.as_str(), name.as_str()) {
            (NC_NS_BASE, "rpc") => MsgKind::Rpc,
            (NC_NS_BASE, "rpc-reply") => MsgKind::Reply,
            (NC_NS_BASE, "hello") => MsgKind::Hello,
            (NC_NS_NOTIF, "notification") => MsgKind::Notif,
            _ => {
                log::error!("Invalid message root element (<{name}> in \"{namespace}\").");
                return Err(Error::MalformedMessage);
            }
        };

        return Ok((
            kind,
            RootInfo {
                name,
                namespace,
                prefix,
                attrs,
            },
        ));
    }
}

#[derive(Debug, Deserialize)]
struct HelloMsg {
    capabilities: Capabilities,
    #[serde(rename = "session-id")]
    session_id: Option<u32>,
}

#[derive(Debug, Deserialize)]
struct Capabilities {
    capability: Vec<String>,
}

/// Parse a `<hello>` body into its capability list and optional
/// session-id. Capabilities are whitespace-trimmed; an empty one is a
/// protocol violation.
pub(crate) fn parse_hello(body: &str) -> Result<(Vec<String>, Option<u32>)> {
    let hello: HelloMsg =
        quick_xml::de::from_str(body).map_err(|err| Error::BadHello(err.to_string()))?;
    let mut capabilities = Vec::with_capacity(hello.capabilities.capability.len());
    for capability in &hello.capabilities.capability {
        let trimmed = capability.trim();
        if trimmed.is_empty() {
            return Err(Error::BadHello("empty capability received".to_string()));
        }
        capabilities.push(trimmed.to_string());
    }
    Ok((capabilities, hello.session_id))
}

/// Highest NETCONF version both base capabilities admit, or none.
pub(crate) fn base_version(capabilities: &[String]) -> Option<crate::session::Version> {
    let mut version = None;
    for capability in capabilities {
        if capability == NC_CAP_BASE_11 {
            return Some(crate::session::Version::V11);
        }
        if capability == NC_CAP_BASE_10 {
            version = Some(crate::session::Version::V10);
        }
    }
    version
}

/// With-defaults rendering mode of a data reply, as the embedder's
/// serializer produced it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum WithDefaultsMode {
    #[default]
    Explicit,
    Trim,
    All,
    AllTag,
}

/// Server reply payload for [`write_reply`](crate::session::Session::write_reply).
#[derive(Debug)]
pub enum ServerReply {
    Ok,
    Data {
        tree: String,
        with_defaults: WithDefaultsMode,
    },
    Error(Vec<RpcError>),
}

impl ServerReply {
    pub fn ok() -> ServerReply {
        ServerReply::Ok
    }

    pub fn data(tree: impl Into<String>) -> ServerReply {
        ServerReply::Data {
            tree: tree.into(),
            with_defaults: WithDefaultsMode::default(),
        }
    }

    pub fn data_with_defaults(tree: impl Into<String>, mode: WithDefaultsMode) -> ServerReply {
        ServerReply::Data {
            tree: tree.into(),
            with_defaults: mode,
        }
    }

    pub fn error(errors: Vec<RpcError>) -> ServerReply {
        ServerReply::Error(errors)
    }
}

/// `<error-type>` values of RFC 6241 §4.3.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorType {
    Transport,
    Rpc,
    Protocol,
    Application,
}

impl ErrorType {
    fn as_str(self) -> &'static str {
        match self {
            ErrorType::Transport => "transport",
            ErrorType::Rpc => "rpc",
            ErrorType::Protocol => "protocol",
            ErrorType::Application => "application",
        }
    }
}

/// `<error-tag>` values of RFC 6241 §4.3.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorTag {
    InUse,
    InvalidValue,
    TooBig,
    MissingAttribute,
    BadAttribute,
    UnknownAttribute,
    MissingElement,
    BadElement,
    UnknownElement,
    UnknownNamespace,
    AccessDenied,
    LockDenied,
    ResourceDenied,
    RollbackFailed,
    DataExists,
    DataMissing,
    OperationNotSupported,
    OperationFailed,
    MalformedMessage,
}

impl ErrorTag {
    fn as_str(self) -> &'static str {
        match self {
            ErrorTag::InUse => "in-use",
            ErrorTag::InvalidValue => "invalid-value",
            ErrorTag::TooBig => "too-big",
            ErrorTag::MissingAttribute => "missing-attribute",
            ErrorTag::BadAttribute => "bad-attribute",
            ErrorTag::UnknownAttribute => "unknown-attribute",
            ErrorTag::MissingElement => "missing-element",
            ErrorTag::BadElement => "bad-element",
            ErrorTag::UnknownElement => "unknown-element",
            ErrorTag::UnknownNamespace => "unknown-namespace",
            ErrorTag::AccessDenied => "access-denied",
            ErrorTag::LockDenied => "lock-denied",
            ErrorTag::ResourceDenied => "resource-denied",
            ErrorTag::RollbackFailed => "rollback-failed",
            ErrorTag::DataExists => "data-exists",
            ErrorTag::DataMissing => "data-missing",
            ErrorTag::OperationNotSupported => "operation-not-supported",
            ErrorTag::OperationFailed => "operation-failed",
            ErrorTag::MalformedMessage => "malformed-message",
        }
    }
}

/// One `<rpc-error>` of an error reply. Children are emitted in the fixed
/// RFC 6241 order; free-text fields go through the escaping write path.
#[derive(Debug, Default)]
pub struct RpcError {
    typ: Option<ErrorType>,
    tag: Option<ErrorTag>,
    app_tag: Option<String>,
    path: Option<String>,
    message: Option<String>,
    message_lang: Option<String>,
    session_id: Option<u32>,
    bad_attributes: Vec<String>,
    bad_elements: Vec<String>,
    bad_namespaces: Vec<String>,
    /// Caller-supplied `<error-info>` subtrees, written as-is.
    other: Vec<String>,
}

impl RpcError {
    pub fn new(typ: ErrorType, tag: ErrorTag) -> RpcError {
        RpcError {
            typ: Some(typ),
            tag: Some(tag),
            ..RpcError::default()
        }
    }

    /// The reply a 1.1 server sends back for an unparsable message.
    pub fn malformed_message() -> RpcError {
        RpcError::new(ErrorType::Rpc, ErrorTag::MalformedMessage)
    }

    pub fn app_tag(mut self, app_tag: impl Into<String>) -> RpcError {
        self.app_tag = Some(app_tag.into());
        self
    }

    pub fn path(mut self, path: impl Into<String>) -> RpcError {
        self.path = Some(path.into());
        self
    }

    pub fn message(mut self, message: impl Into<String>, lang: Option<&str>) -> RpcError {
        self.message = Some(message.into());
        self.message_lang = lang.map(str::to_string);
        self
    }

    pub fn session_id(mut self, session_id: u32) -> RpcError {
        self.session_id = Some(session_id);
        self
    }

    pub fn bad_attribute(mut self, attribute: impl Into<String>) -> RpcError {
        self.bad_attributes.push(attribute.into());
        self
    }

    pub fn bad_element(mut self, element: impl Into<String>) -> RpcError {
        self.bad_elements.push(element.into());
        self
    }

    pub fn bad_namespace(mut self, namespace: impl Into<String>) -> RpcError {
        self.bad_namespaces.push(namespace.into());
        self
    }

    pub fn info_xml(mut self, xml: impl Into<String>) -> RpcError {
        self.other.push(xml.into());
        self
    }

    pub(crate) fn write_into(&self, out: &mut WriteBuffer) -> Result<()> {
        let (typ, tag) = match (self.typ, self.tag) {
            (Some(typ), Some(tag)) => (typ, tag),
            _ => {
                return Err(Error::Internal(
                    "rpc-error is missing its type or tag".to_string(),
                ))
            }
        };

        out.write(b"<rpc-error>")?;
        out.write(b"<error-type>")?;
        out.write(typ.as_str().as_bytes())?;
        out.write(b"</error-type>")?;
        out.write(b"<error-tag>")?;
        out.write(tag.as_str().as_bytes())?;
        out.write(b"</error-tag>")?;
        out.write(b"<error-severity>error</error-severity>")?;

        if let Some(app_tag) = &self.app_tag {
            out.write(b"<error-app-tag>")?;
            out.write_escaped(app_tag.as_bytes())?;
            out.write(b"</error-app-tag>")?;
        }
        if let Some(path) = &self.path {
            out.write(b"<error-path>")?;
            out.write_escaped(path.as_bytes())?;
            out.write(b"</error-path>")?;
        }
        if let Some(message) = &self.message {
            out.write(b"<error-message")?;
            if let Some(lang) = &self.message_lang {
                out.write(b" xml:lang=\"")?;
                out.write_escaped(lang.as_bytes())?;
                out.write(b"\"")?;
            }
            out.write(b">")?;
            out.write_escaped(message.as_bytes())?;
            out.write(b"</error-message>")?;
        }

        if self.session_id.is_some()
            || !self.bad_attributes.is_empty()
            || !self.bad_elements.is_empty()
            || !self.bad_namespaces.is_empty()
            || !self.other.is_empty()
        {
            out.write(b"<error-info>")?;
            if let Some(session_id) = self.session_id {
                out.write(b"<session-id>")?;
                out.write(session_id.to_string().as_bytes())?;
                out.write(b"</session-id>")?;
            }
            for attribute in &self.bad_attributes {
                out.write(b"<bad-attribute>")?;
                out.write_escaped(attribute.as_bytes())?;
                out.write(b"</bad-attribute>")?;
            }
            for element in &self.bad_elements {
                out.write(b"<bad-element>")?;
                out.write_escaped(element.as_bytes())?;
                out.write(b"</bad-element>")?;
            }
            for namespace in &self.bad_namespaces {
                out.write(b"<bad-namespace>")?;
                out.write_escaped(namespace.as_bytes())?;
                out.write(b"</bad-namespace>")?;
            }
            for xml in &self.other {
                out.write(xml.as_bytes())?;
            }
            out.write(b"</error-info>")?;
        }

        out.write(b"</rpc-error>")
    }
}
