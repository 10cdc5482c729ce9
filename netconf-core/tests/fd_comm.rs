//! Basic RPC communication between a client and a server session over a
//! socketpair, in both framing dialects.

use std::io::Read;
use std::os::fd::OwnedFd;
use std::os::unix::net::UnixStream;
use std::sync::Arc;
use std::time::{Duration, Instant};

use env_logger::{Builder, Env, Target};
use pretty_assertions::assert_eq;

use netconf_core::message::{ErrorTag, ErrorType, MsgKind, RpcError, ServerReply};
use netconf_core::pollset::{PollFlags, PollSet};
use netconf_core::{
    Config, Context, Error, Session, SessionBuilder, Side, Status, TermReason, Version, NC_NS_BASE,
};

fn init_logging() {
    let env = Env::default().filter_or("NETCONF_LOG", "debug");
    let mut builder = Builder::new();
    builder.target(Target::Stdout);
    builder.parse_env(env);
    builder.is_test(true);
    let _ = builder.try_init();
}

fn fd_session(
    ctx: &Arc<Context>,
    side: Side,
    version: Version,
    stream: UnixStream,
) -> Arc<Session> {
    init_logging();
    let fd_in = OwnedFd::from(stream.try_clone().unwrap());
    let fd_out = OwnedFd::from(stream);
    SessionBuilder::new(side)
        .id(1)
        .version(version)
        .running()
        .build_fd(Arc::clone(ctx), fd_in, fd_out)
        .unwrap()
}

fn session_pair(version: Version) -> (Arc<Session>, Arc<Session>) {
    let ctx = Context::new(Config::default());
    let (client_end, server_end) = UnixStream::pair().unwrap();
    let client = fd_session(&ctx, Side::Client, version, client_end);
    let server = fd_session(&ctx, Side::Server, version, server_end);
    (client, server)
}

fn send_recv_ok(version: Version) {
    let (client, server) = session_pair(version);

    let msgid = client.write_rpc("<get/>", None).unwrap();
    assert_eq!(msgid, 1);

    let ps = PollSet::new(&Config::default());
    ps.add_session(Arc::clone(&server)).unwrap();
    let outcome = ps.poll(Some(Duration::from_secs(2))).unwrap();
    assert!(outcome.flags.contains(PollFlags::RPC));
    let rpc = outcome.message.unwrap();
    assert_eq!(rpc.kind, MsgKind::Rpc);
    assert!(rpc.body.contains("<get/>"));

    server.write_reply(Some(&rpc.root), &ServerReply::ok()).unwrap();

    let reply = client.read_msg().unwrap();
    assert_eq!(reply.kind, MsgKind::Reply);
    assert!(reply.body.contains("<ok/>"));
    assert!(reply.root.attrs.contains("message-id=\"1\""));
}

#[test]
fn test_send_recv_ok_10() {
    send_recv_ok(Version::V10);
}

#[test]
fn test_send_recv_ok_11() {
    send_recv_ok(Version::V11);
}

fn send_recv_error(version: Version) {
    let (client, server) = session_pair(version);

    client
        .write_rpc("<kill-session><session-id>1</session-id></kill-session>", None)
        .unwrap();

    let rpc = server.read_msg().unwrap();
    assert_eq!(rpc.kind, MsgKind::Rpc);

    let reply = ServerReply::error(vec![RpcError::new(
        ErrorType::Protocol,
        ErrorTag::OperationNotSupported,
    )
    .message("Requested operation is not supported.", Some("en"))]);
    server.write_reply(Some(&rpc.root), &reply).unwrap();

    let reply = client.read_msg().unwrap();
    assert_eq!(reply.kind, MsgKind::Reply);
    assert!(reply
        .body
        .contains("<error-tag>operation-not-supported</error-tag>"));
    assert!(reply
        .body
        .contains("<error-message xml:lang=\"en\">Requested operation is not supported.</error-message>"));
}

#[test]
fn test_send_recv_error_10() {
    send_recv_error(Version::V10);
}

#[test]
fn test_send_recv_error_11() {
    send_recv_error(Version::V11);
}

fn send_recv_data(version: Version) {
    let (client, server) = session_pair(version);

    client.write_rpc("<get-config><source><running/></source></get-config>", None)
        .unwrap();

    let rpc = server.read_msg().unwrap();
    assert_eq!(rpc.kind, MsgKind::Rpc);

    let data = "<data><interface><name>eth0</name></interface></data>";
    server
        .write_reply(Some(&rpc.root), &ServerReply::data(data))
        .unwrap();

    let reply = client.read_msg().unwrap();
    assert_eq!(reply.kind, MsgKind::Reply);
    assert!(reply.body.contains(data));
}

#[test]
fn test_send_recv_data_10() {
    send_recv_data(Version::V10);
}

#[test]
fn test_send_recv_data_11() {
    send_recv_data(Version::V11);
}

#[test]
fn test_msgid_increases_per_rpc() {
    let (client, server) = session_pair(Version::V11);

    for expected in 1..=3u64 {
        let msgid = client.write_rpc("<get/>", None).unwrap();
        assert_eq!(msgid, expected);

        let rpc = server.read_msg().unwrap();
        assert!(rpc
            .root
            .attrs
            .contains(&format!("message-id=\"{expected}\"")));
    }
}

#[test]
fn test_first_rpc_wire_format() {
    let ctx = Context::new(Config::default());
    let (client_end, mut peer) = UnixStream::pair().unwrap();
    let client = fd_session(&ctx, Side::Client, Version::V11, client_end);

    client.write_rpc("<get/>", None).unwrap();

    let fragment = format!("<rpc xmlns=\"{NC_NS_BASE}\" message-id=\"1\"><get/></rpc>");
    let expected = format!("\n#{}\n{fragment}\n##\n", fragment.len());
    let mut wire = vec![0u8; expected.len()];
    peer.read_exact(&mut wire).unwrap();
    assert_eq!(String::from_utf8(wire).unwrap(), expected);
}

#[test]
fn test_notification_wire_format() {
    let ctx = Context::new(Config::default());
    let (server_end, mut peer) = UnixStream::pair().unwrap();
    let server = fd_session(&ctx, Side::Server, Version::V10, server_end);

    let stamp = time::macros::datetime!(2024-06-01 12:00:00 UTC);
    server
        .write_notif(stamp, "<event><severity>major</severity></event>")
        .unwrap();

    let expected = "<notification xmlns=\"urn:ietf:params:xml:ns:netconf:notification:1.0\">\
                    <eventTime>2024-06-01T12:00:00Z</eventTime>\
                    <event><severity>major</severity></event>\
                    </notification>]]>]]>";
    let mut wire = vec![0u8; expected.len()];
    peer.read_exact(&mut wire).unwrap();
    assert_eq!(String::from_utf8(wire).unwrap(), expected);
}

#[test]
fn test_dead_peer_write_fails_without_bytes() {
    let ctx = Context::new(Config::default());
    let (client_end, peer) = UnixStream::pair().unwrap();
    let client = fd_session(&ctx, Side::Client, Version::V11, client_end);
    drop(peer);

    match client.write_rpc("<get/>", None) {
        Err(Error::PeerClosed) => {}
        other => panic!("expected peer-closed failure, got {other:?}"),
    }
    assert_eq!(client.status(), Status::Invalid);
    assert_eq!(client.term_reason(), TermReason::Dropped);
}

#[test]
fn test_server_replies_to_malformed_message() {
    let ctx = Context::new(Config::default());
    let (server_end, mut peer) = UnixStream::pair().unwrap();
    let server = fd_session(&ctx, Side::Server, Version::V11, server_end);

    use std::io::Write;
    peer.write_all(b"\n#6\n<foo/>\n##\n").unwrap();

    match server.read_msg() {
        Err(Error::MalformedMessage) => {}
        other => panic!("expected malformed message, got {other:?}"),
    }
    assert_eq!(server.status(), Status::Invalid);
    assert_eq!(server.term_reason(), TermReason::Other);

    let fragment = format!(
        "<rpc-reply xmlns=\"{NC_NS_BASE}\">\
         <rpc-error>\
         <error-type>rpc</error-type>\
         <error-tag>malformed-message</error-tag>\
         <error-severity>error</error-severity>\
         </rpc-error>\
         </rpc-reply>"
    );
    let expected = format!("\n#{}\n{fragment}\n##\n", fragment.len());
    let mut wire = vec![0u8; expected.len()];
    peer.read_exact(&mut wire).unwrap();
    assert_eq!(String::from_utf8(wire).unwrap(), expected);
}

#[test]
fn test_client_drops_malformed_message_silently() {
    let ctx = Context::new(Config::default());
    let (client_end, mut peer) = UnixStream::pair().unwrap();
    let client = fd_session(&ctx, Side::Client, Version::V10, client_end);

    use std::io::Write;
    peer.write_all(b"<foo/>]]>]]>").unwrap();

    match client.read_msg() {
        Err(Error::MalformedMessage) => {}
        other => panic!("expected malformed message, got {other:?}"),
    }
    assert_eq!(client.status(), Status::Invalid);
    assert_eq!(client.term_reason(), TermReason::Other);

    // no error reply comes back on a client session
    peer.set_read_timeout(Some(Duration::from_millis(100))).unwrap();
    let mut buf = [0u8; 1];
    assert!(peer.read(&mut buf).is_err());
}

#[test]
fn test_chunked_hello_reassembled_across_chunks() {
    let ctx = Context::new(Config::default());
    let (server_end, mut peer) = UnixStream::pair().unwrap();
    let server = fd_session(&ctx, Side::Server, Version::V11, server_end);

    let body = format!("<hello xmlns=\"{NC_NS_BASE}\"></hello>");
    let (first, second) = body.split_at(20);
    use std::io::Write;
    peer.write_all(
        format!(
            "\n#{}\n{first}\n#{}\n{second}\n##\n",
            first.len(),
            second.len()
        )
        .as_bytes(),
    )
    .unwrap();

    let msg = server.read_msg().unwrap();
    assert_eq!(msg.kind, MsgKind::Hello);
    assert_eq!(msg.body, body);
}

#[test]
fn test_read_budget_is_honored() {
    init_logging();
    let ctx = Context::new(Config::default());
    let config = Config::default().read_timeout(Duration::from_millis(200));
    let (client_end, _peer) = UnixStream::pair().unwrap();
    let client = SessionBuilder::new(Side::Client)
        .id(1)
        .version(Version::V11)
        .running()
        .config(config)
        .build_fd(
            Arc::clone(&ctx),
            OwnedFd::from(client_end.try_clone().unwrap()),
            OwnedFd::from(client_end),
        )
        .unwrap();

    let started = Instant::now();
    match client.read_msg() {
        Err(Error::ReadTimeout) => {}
        other => panic!("expected read timeout, got {other:?}"),
    }
    // budget plus a step plus scheduling slack
    assert!(started.elapsed() < Duration::from_secs(1));
    assert_eq!(client.status(), Status::Invalid);
    assert_eq!(client.term_reason(), TermReason::Other);
}

#[test]
fn test_hello_handshake_negotiates_v11() {
    init_logging();
    let ctx = Context::new(Config::default());
    let (client_end, server_end) = UnixStream::pair().unwrap();
    let client = SessionBuilder::new(Side::Client)
        .build_fd(
            Arc::clone(&ctx),
            OwnedFd::from(client_end.try_clone().unwrap()),
            OwnedFd::from(client_end),
        )
        .unwrap();
    let server = SessionBuilder::new(Side::Server)
        .build_fd(
            Arc::clone(&ctx),
            OwnedFd::from(server_end.try_clone().unwrap()),
            OwnedFd::from(server_end),
        )
        .unwrap();

    let server_thread = {
        let server = Arc::clone(&server);
        std::thread::spawn(move || server.handshake())
    };
    client.handshake().unwrap();
    server_thread.join().unwrap().unwrap();

    assert_eq!(client.status(), Status::Running);
    assert_eq!(server.status(), Status::Running);
    assert_eq!(client.version(), Version::V11);
    assert_eq!(server.version(), Version::V11);
    assert_eq!(client.id(), server.id());
    assert!(client
        .capabilities()
        .contains(&"urn:ietf:params:netconf:base:1.1".to_string()));
}

#[test]
fn test_close_marks_session_closed() {
    let (client, server) = session_pair(Version::V11);

    let closer = {
        let client = Arc::clone(&client);
        std::thread::spawn(move || client.close())
    };

    let rpc = server.read_msg().unwrap();
    assert!(rpc.body.contains("<close-session/>"));
    server.write_reply(Some(&rpc.root), &ServerReply::ok()).unwrap();

    closer.join().unwrap().unwrap();
    assert_eq!(client.status(), Status::Invalid);
    assert_eq!(client.term_reason(), TermReason::Closed);
}
