//! NETCONF message framing.
//!
//! Inbound: assembles one complete message body from either dialect,
//! NETCONF 1.0 end-tag framing (`]]>]]>`) or NETCONF 1.1 chunked framing.
//! See [RFC6242](https://tools.ietf.org/html/rfc6242#section-4.1).
//!
//! Outbound: [`WriteBuffer`] is the write-callback target external XML
//! serializers stream into; it buffers, emits chunk headers, escapes
//! character data on request and terminates the message on `finish`.
//!
//! Every read of one message shares a single [`Ticker`] budget, so a
//! message that trickles in byte by byte still completes or times out as
//! one unit.

use std::sync::atomic::AtomicU8;

use memmem::{Searcher, TwoWaySearcher};

use crate::error::{Error, Result};
use crate::session::{io_allowed, Version};
use crate::transport::{Ticker, Transport};

pub(crate) const ENDTAG_10: &[u8] = b"]]>]]>";
pub(crate) const ENDTAG_11: &[u8] = b"\n##\n";

/// Read exactly `buf.len()` bytes, charging the ticker for every empty
/// round. The session status is rechecked per round so another thread
/// invalidating the session interrupts the read.
fn read_full(
    t: &mut Transport,
    status: &AtomicU8,
    buf: &mut [u8],
    ticker: &mut Ticker,
) -> Result<()> {
    let step = ticker.step();
    let mut readd = 0;
    while readd < buf.len() {
        if !io_allowed(status) {
            return Err(Error::Invalidated);
        }
        let r = t.read(&mut buf[readd..], step)?;
        if r == 0 {
            ticker.tick()?;
            continue;
        }
        readd += r;
    }
    Ok(())
}

/// Read byte by byte until `endtag` terminates the accumulated data and
/// return the data including the tag. Reading one byte at a time keeps the
/// stream positioned exactly after the tag, which the chunked dialect
/// depends on. `limit` bounds the accumulated size.
fn read_until(
    t: &mut Transport,
    status: &AtomicU8,
    endtag: &[u8],
    limit: Option<usize>,
    buf_size: usize,
    ticker: &mut Ticker,
) -> Result<Vec<u8>> {
    let search = TwoWaySearcher::new(endtag);
    let mut buf: Vec<u8> = Vec::with_capacity(buf_size);
    let mut byte = [0u8; 1];
    loop {
        if let Some(limit) = limit {
            if buf.len() == limit {
                log::warn!("Reading limit ({limit}) reached.");
                return Err(Error::Framing("missing end sequence"));
            }
        }
        read_full(t, status, &mut byte, ticker)?;
        buf.push(byte[0]);
        if buf.len() >= endtag.len() && search.search_in(&buf[buf.len() - endtag.len()..]).is_some()
        {
            return Ok(buf);
        }
    }
}

/// Assemble one message body from the wire. The terminator (either
/// dialect) is consumed and stripped; the returned bytes are exactly the
/// payload the peer framed.
pub(crate) fn read_msg_body(
    t: &mut Transport,
    status: &AtomicU8,
    version: Version,
    buf_size: usize,
    ticker: &mut Ticker,
    limit: Option<usize>,
) -> Result<Vec<u8>> {
    match version {
        Version::V10 => {
            let mut msg = read_until(t, status, ENDTAG_10, limit, buf_size, ticker)?;
            msg.truncate(msg.len() - ENDTAG_10.len());
            Ok(msg)
        }
        Version::V11 => {
            let mut msg: Vec<u8> = Vec::new();
            let mut chunks = 0usize;
            loop {
                read_until(t, status, b"\n#", None, buf_size, ticker)?;
                let header = read_until(t, status, b"\n", None, buf_size, ticker)?;

                if header == b"#\n" {
                    // end of chunked framing message
                    if chunks == 0 {
                        return Err(Error::Framing("invalid frame chunk delimiters"));
                    }
                    return Ok(msg);
                }

                let digits = &header[..header.len() - 1];
                if digits.is_empty() || !digits.iter().all(|b| b.is_ascii_digit()) {
                    return Err(Error::Framing("invalid chunk size"));
                }
                let chunk_len: u64 = std::str::from_utf8(digits)
                    .expect("ascii digits")
                    .parse()
                    .map_err(|_| Error::Framing("invalid chunk size"))?;
                if chunk_len == 0 {
                    return Err(Error::Framing("invalid chunk size"));
                }

                let mut chunk = vec![0u8; chunk_len as usize];
                read_full(t, status, &mut chunk, ticker)?;
                msg.extend_from_slice(&chunk);
                chunks += 1;
            }
        }
    }
}

/// Buffered, framing-aware write sink for one outbound message.
///
/// External serializers stream into it through [`write`](Self::write) and
/// [`write_escaped`](Self::write_escaped); [`finish`](Self::finish) is the
/// mandatory end-of-message call that flushes the tail and emits the
/// dialect terminator. On the 1.1 dialect every flush becomes one chunk
/// with its `\n#<len>\n` header; on 1.0 bytes go out as they are.
pub(crate) struct WriteBuffer<'a> {
    t: &'a mut Transport,
    status: &'a AtomicU8,
    version: Version,
    step: std::time::Duration,
    buf: Vec<u8>,
    cap: usize,
}

impl<'a> WriteBuffer<'a> {
    pub(crate) fn new(
        t: &'a mut Transport,
        status: &'a AtomicU8,
        version: Version,
        cap: usize,
        step: std::time::Duration,
    ) -> WriteBuffer<'a> {
        WriteBuffer {
            t,
            status,
            version,
            step,
            buf: Vec::with_capacity(cap),
            cap,
        }
    }

    /// Queue raw bytes. Oversize writes bypass the buffer and go out as
    /// their own chunk.
    pub(crate) fn write(&mut self, data: &[u8]) -> Result<()> {
        if !self.buf.is_empty() && self.buf.len() + data.len() > self.cap {
            self.flush()?;
        }
        if data.len() > self.cap {
            return self.write_frame(data);
        }
        self.buf.extend_from_slice(data);
        Ok(())
    }

    /// Queue character data, escaping `&`, `<` and `>` on the way.
    pub(crate) fn write_escaped(&mut self, data: &[u8]) -> Result<()> {
        for &b in data {
            if self.buf.len() + 5 >= self.cap {
                self.flush()?;
            }
            match b {
                b'&' => self.buf.extend_from_slice(b"&amp;"),
                b'<' => self.buf.extend_from_slice(b"&lt;"),
                b'>' => self.buf.extend_from_slice(b"&gt;"),
                _ => self.buf.push(b),
            }
        }
        Ok(())
    }

    /// End of message: flush what is buffered and emit the terminator.
    pub(crate) fn finish(&mut self) -> Result<()> {
        self.flush()?;
        match self.version {
            Version::V11 => self.wire(ENDTAG_11),
            Version::V10 => self.wire(ENDTAG_10),
        }
    }

    fn flush(&mut self) -> Result<()> {
        if self.buf.is_empty() {
            return Ok(());
        }
        let data = std::mem::take(&mut self.buf);
        let ret = self.write_frame(&data);
        self.buf = data;
        self.buf.clear();
        ret
    }

    fn write_frame(&mut self, data: &[u8]) -> Result<()> {
        if self.version == Version::V11 {
            let header = format!("\n#{}\n", data.len());
            self.wire(header.as_bytes())?;
        }
        self.wire(data)
    }

    fn wire(&mut self, data: &[u8]) -> Result<()> {
        if !io_allowed(self.status) {
            return Err(Error::Invalidated);
        }
        if !self.t.is_connected() {
            return Err(Error::PeerClosed);
        }
        self.t.write_all(data, self.step)
    }
}

#[cfg(test)]
mod tests {
    use std::io::{Read, Write};
    use std::os::fd::OwnedFd;
    use std::os::unix::net::UnixStream;
    use std::time::Duration;

    use pretty_assertions::assert_eq;

    use super::*;
    use crate::session::Status;
    use crate::transport::FdTransport;

    fn fd_pair() -> (Transport, UnixStream) {
        let (ours, theirs) = UnixStream::pair().unwrap();
        let fd_in = OwnedFd::from(ours.try_clone().unwrap());
        let fd_out = OwnedFd::from(ours);
        (
            Transport::Fd(FdTransport::new(fd_in, fd_out).unwrap()),
            theirs,
        )
    }

    fn ticker() -> Ticker {
        Ticker::new(Duration::from_secs(5), Duration::from_micros(100))
    }

    fn running() -> AtomicU8 {
        AtomicU8::new(Status::Running as u8)
    }

    fn read_body(
        t: &mut Transport,
        version: Version,
        ticker: &mut Ticker,
        limit: Option<usize>,
    ) -> Result<Vec<u8>> {
        let status = running();
        read_msg_body(t, &status, version, crate::config::FRAMING_BUF_SIZE, ticker, limit)
    }

    #[test]
    fn test_chunked_read() {
        let framed = "\n#38\n<?xml version=\"1.0\" encoding=\"UTF-8\"?>\n#1\n\n\
                      \n#10\n<rpc-reply\n#48\n xmlns=\"urn:ietf:params:xml:ns:netconf:base:1.0\"\
                      \n#1\n>\n#25\n<ok xmlns:a=\"b\">&</ok>\n\n\n\n#12\n</rpc-reply>\n##\n";
        let (mut t, mut peer) = fd_pair();
        peer.write_all(framed.as_bytes()).unwrap();

        let body = read_body(&mut t, Version::V11, &mut ticker(), None).unwrap();
        let expected = "<?xml version=\"1.0\" encoding=\"UTF-8\"?>\n<rpc-reply \
                        xmlns=\"urn:ietf:params:xml:ns:netconf:base:1.0\">\
                        <ok xmlns:a=\"b\">&</ok>\n\n\n</rpc-reply>";
        assert_eq!(String::from_utf8(body).unwrap(), expected);
    }

    #[test]
    fn test_endtag_read() {
        let (mut t, mut peer) = fd_pair();
        peer.write_all(b"<hello xmlns=\"urn:ietf:params:xml:ns:netconf:base:1.0\"/>]]>]]>")
            .unwrap();

        let body = read_body(&mut t, Version::V10, &mut ticker(), None).unwrap();
        assert_eq!(
            String::from_utf8(body).unwrap(),
            "<hello xmlns=\"urn:ietf:params:xml:ns:netconf:base:1.0\"/>"
        );
    }

    #[test]
    fn test_endtag_read_stops_at_terminator() {
        let (mut t, mut peer) = fd_pair();
        peer.write_all(b"<a/>]]>]]><b/>]]>]]>").unwrap();

        let first = read_body(&mut t, Version::V10, &mut ticker(), None).unwrap();
        let second = read_body(&mut t, Version::V10, &mut ticker(), None).unwrap();
        assert_eq!(first, b"<a/>");
        assert_eq!(second, b"<b/>");
    }

    #[test]
    fn test_chunked_zero_size_rejected() {
        let (mut t, mut peer) = fd_pair();
        peer.write_all(b"\n#0\ndata\n##\n").unwrap();

        match read_body(&mut t, Version::V11, &mut ticker(), None) {
            Err(Error::Framing(reason)) => assert_eq!(reason, "invalid chunk size"),
            other => panic!("expected framing violation, got {other:?}"),
        }
    }

    #[test]
    fn test_chunked_empty_message_rejected() {
        let (mut t, mut peer) = fd_pair();
        peer.write_all(b"\n##\n").unwrap();

        match read_body(&mut t, Version::V11, &mut ticker(), None) {
            Err(Error::Framing(reason)) => assert_eq!(reason, "invalid frame chunk delimiters"),
            other => panic!("expected framing violation, got {other:?}"),
        }
    }

    #[test]
    fn test_endtag_limit_enforced() {
        let (mut t, mut peer) = fd_pair();
        peer.write_all(b"0123456789no terminator here").unwrap();

        match read_body(&mut t, Version::V10, &mut ticker(), Some(8)) {
            Err(Error::Framing(reason)) => assert_eq!(reason, "missing end sequence"),
            other => panic!("expected framing violation, got {other:?}"),
        }
    }

    #[test]
    fn test_truncated_chunked_input_times_out() {
        let (mut t, mut peer) = fd_pair();
        peer.write_all(b"\n#6\n<hello").unwrap();

        let mut short = Ticker::new(Duration::from_millis(50), Duration::from_micros(100));
        match read_body(&mut t, Version::V11, &mut short, None) {
            Err(Error::ReadTimeout) => {}
            other => panic!("expected read timeout, got {other:?}"),
        }
    }

    fn wire_bytes(t: Transport, mut peer: UnixStream) -> Vec<u8> {
        drop(t);
        let mut wire = Vec::new();
        peer.read_to_end(&mut wire).unwrap();
        wire
    }

    #[test]
    fn test_chunked_round_trip() {
        let payload = "<rpc xmlns=\"urn:ietf:params:xml:ns:netconf:base:1.0\" \
                       message-id=\"1\"><get/></rpc>";
        let (mut t, peer) = fd_pair();
        let step = Duration::from_micros(100);
        {
            let status = running();
            let mut out = WriteBuffer::new(&mut t, &status, Version::V11, 1024, step);
            out.write(payload.as_bytes()).unwrap();
            out.finish().unwrap();
        }

        // loop the emitted frames straight back in
        let (mut rt, mut rpeer) = fd_pair();
        rpeer.write_all(&wire_bytes(t, peer)).unwrap();
        let body = read_body(&mut rt, Version::V11, &mut ticker(), None).unwrap();
        assert_eq!(String::from_utf8(body).unwrap(), payload);
    }

    #[test]
    fn test_chunk_boundaries_do_not_change_payload() {
        let payload = b"<hello></hello>";
        let (mut t, peer) = fd_pair();
        let step = Duration::from_micros(100);
        {
            let status = running();
            let mut out = WriteBuffer::new(&mut t, &status, Version::V11, 1024, step);
            // force one flush per fragment, yielding two chunks on the wire
            out.write(&payload[..7]).unwrap();
            out.flush().unwrap();
            out.write(&payload[7..]).unwrap();
            out.finish().unwrap();
        }

        let wire = wire_bytes(t, peer);
        assert_eq!(
            String::from_utf8_lossy(&wire),
            "\n#7\n<hello>\n#8\n</hello>\n##\n"
        );

        let (mut rt, mut rpeer) = fd_pair();
        rpeer.write_all(&wire).unwrap();
        let body = read_body(&mut rt, Version::V11, &mut ticker(), None).unwrap();
        assert_eq!(body, payload);
    }

    #[test]
    fn test_endtag_round_trip() {
        let payload = b"<rpc-reply><ok/></rpc-reply>";
        let (mut t, peer) = fd_pair();
        let step = Duration::from_micros(100);
        {
            let status = running();
            let mut out = WriteBuffer::new(&mut t, &status, Version::V10, 1024, step);
            out.write(payload).unwrap();
            out.finish().unwrap();
        }

        let (mut rt, mut rpeer) = fd_pair();
        rpeer.write_all(&wire_bytes(t, peer)).unwrap();
        let body = read_body(&mut rt, Version::V10, &mut ticker(), None).unwrap();
        assert_eq!(body, payload);
    }

    #[test]
    fn test_escaped_write() {
        let (mut t, peer) = fd_pair();
        let step = Duration::from_micros(100);
        {
            let status = running();
            let mut out = WriteBuffer::new(&mut t, &status, Version::V10, 1024, step);
            out.write_escaped(b"if a < b && b > c \"quote\"").unwrap();
            out.finish().unwrap();
        }

        assert_eq!(
            String::from_utf8_lossy(&wire_bytes(t, peer)),
            "if a &lt; b &amp;&amp; b &gt; c \"quote\"]]>]]>"
        );
    }

    #[test]
    fn test_oversize_write_bypasses_buffer() {
        let big = "x".repeat(40);
        let (mut t, peer) = fd_pair();
        let step = Duration::from_micros(100);
        {
            let status = running();
            let mut out = WriteBuffer::new(&mut t, &status, Version::V11, 16, step);
            out.write(b"<data>").unwrap();
            out.write(big.as_bytes()).unwrap();
            out.write(b"</data>").unwrap();
            out.finish().unwrap();
        }

        let wire = String::from_utf8(wire_bytes(t, peer)).unwrap();
        assert_eq!(wire, format!("\n#6\n<data>\n#40\n{big}\n#7\n</data>\n##\n"));
    }
}
