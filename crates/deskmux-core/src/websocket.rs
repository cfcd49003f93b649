//! A minimal RFC 6455 server-side WebSocket framer.
//!
//! This is not a general WebSocket library: it performs the opening
//! handshake on a buffer the caller has already started reading, then
//! presents inbound/outbound framing as plain `read`/`write`/`writev`
//! methods over binary frames only. Continuation frames are promoted to
//! binary rather than reassembled (see the module-level note below); text,
//! ping and pong frames are accepted on the wire but discarded with a
//! warning. None of this is spec-compliant streaming semantics — it is the
//! exact, deliberate subset this server's transport layer needs.
//!
//! ## Known, preserved quirks
//!
//! - A non-final continuation frame (opcode `0x0`) is reinterpreted as a
//!   binary frame and delivered immediately rather than assembled with the
//!   frames that follow. This violates RFC 6455 §5.4 on purpose: the caller
//!   only ever wants a byte stream, not message boundaries, so there is
//!   nothing to gain by buffering.
//! - [`WebSocketTransport::new`] performs the handshake read exactly once
//!   after the caller-supplied initial bytes. A `GET` request fragmented
//!   across more than two reads is misrecognized as malformed. In practice
//!   a handshake is a few hundred bytes and arrives in one segment; this is
//!   a known, accepted limitation rather than an oversight.
//! - Ping frames are not answered. A client relying on ping/pong keepalive
//!   will eventually be dropped by its own idle timeout.

use std::io::{self, IoSlice, Read, Write};

use base64::Engine;
use sha1::{Digest, Sha1};

use crate::error::WebSocketError;

const FIN_FLAG: u8 = 0x80;
const RSV_MASK: u8 = 0x70;
const TYPE_MASK: u8 = 0x0F;
const CONTROL_FRAME_MASK: u8 = 0x8;

const OPCODE_CONTINUATION: u8 = 0x0;
const OPCODE_BINARY: u8 = 0x2;
const OPCODE_CLOSE: u8 = 0x8;

const LENGTH_MASK: u8 = 0x7F;
const LENGTH_16BIT: u8 = 0x7E;
const LENGTH_64BIT: u8 = 0x7F;
const MASK_FLAG: u8 = 0x80;

const WEBSOCKET_GUID: &str = "258EAFA5-E914-47DA-95CA-C5AB0DC85B11";

/// `1` FIN/opcode byte + up to `9` length bytes + `4` mask bytes.
const MAX_HEADER_SIZE: usize = 1 + 9 + 4;

/// Size of the scratch buffer used to collect the opening HTTP request.
const HANDSHAKE_BUF_LEN: usize = 4096;

#[derive(Debug, Default)]
struct ReadFrame {
    opcode: u8,
    header: [u8; MAX_HEADER_SIZE],
    header_pos: usize,
    frame_ready: bool,
    masked: bool,
    mask: [u8; 4],
    relayed: u64,
    expected_len: u64,
}

impl ReadFrame {
    fn clear(&mut self) {
        *self = ReadFrame::default();
    }

    /// How many more header bytes must be read before the header can be
    /// (re-)parsed. Zero means enough bytes are present.
    fn bytes_needed(&self) -> usize {
        let mut needed = 2usize;
        if self.header_pos < needed {
            return needed - self.header_pos;
        }
        match self.header[1] & LENGTH_MASK {
            LENGTH_64BIT => needed += 8,
            LENGTH_16BIT => needed += 2,
            _ => {}
        }
        if self.header[1] & MASK_FLAG != 0 {
            needed += 4;
        }
        needed - self.header_pos
    }

    /// Attempt to interpret the buffered header bytes as a complete frame
    /// header. A no-op (returns `Ok(())` without setting `frame_ready`) if
    /// not enough bytes have arrived yet.
    fn try_parse(&mut self) -> Result<(), WebSocketError> {
        if self.bytes_needed() > 0 {
            return Ok(());
        }

        let fin = self.header[0] & FIN_FLAG != 0;
        let mut opcode = self.header[0] & TYPE_MASK;

        if self.header[0] & RSV_MASK != 0 {
            return Err(WebSocketError::Protocol("reserved bits set"));
        }
        if !fin && (opcode & CONTROL_FRAME_MASK) != 0 {
            return Err(WebSocketError::Protocol("fragmented control frame"));
        }
        if (opcode & !CONTROL_FRAME_MASK) >= 3 {
            return Err(WebSocketError::Protocol("unknown opcode"));
        }

        self.masked = self.header[1] & MASK_FLAG != 0;

        // Spec-divergent optimization: treat an in-flight continuation as a
        // finished binary frame instead of assembling it with its siblings.
        if !fin && opcode == OPCODE_CONTINUATION {
            opcode = OPCODE_BINARY;
        }
        self.opcode = opcode;

        let mut used = 1usize;
        self.expected_len = extract_length(&self.header, &mut used);

        if self.masked {
            self.mask.copy_from_slice(&self.header[used..used + 4]);
        }

        if (opcode & CONTROL_FRAME_MASK) != 0 && self.expected_len >= LENGTH_16BIT as u64 {
            return Err(WebSocketError::Protocol("oversize control frame"));
        }

        self.relayed = 0;
        self.frame_ready = true;
        Ok(())
    }

    /// XOR-unmask (if masked) up to `buf.len()` bytes of already-read body
    /// data in place. Returns the number of bytes consumed, which is capped
    /// by how much of the frame's payload remains.
    fn relay(&mut self, buf: &mut [u8]) -> usize {
        let remaining = (self.expected_len - self.relayed) as usize;
        let n = buf.len().min(remaining);
        if self.masked {
            for (i, byte) in buf[..n].iter_mut().enumerate() {
                *byte ^= self.mask[(self.relayed as usize + i) % 4];
            }
        }
        self.relayed += n as u64;
        n
    }
}

/// Extract a WebSocket-style payload length starting at `header[*used]`,
/// advancing `*used` past however many bytes the length occupied (1, 3, or
/// 9 depending on the 7-bit length field).
fn extract_length(header: &[u8], used: &mut usize) -> u64 {
    let first = header[*used];
    let mut outlen = (first & LENGTH_MASK) as u64;
    *used += 1;

    match first & LENGTH_MASK {
        LENGTH_64BIT => {
            outlen = 0;
            for i in 0..8 {
                outlen = (outlen << 8) | header[*used + i] as u64;
            }
            *used += 8;
        }
        LENGTH_16BIT => {
            outlen = ((header[*used] as u64) << 8) | header[*used + 1] as u64;
            *used += 2;
        }
        _ => {}
    }
    outlen
}

fn fill_header(header: &mut [u8; MAX_HEADER_SIZE], len: u64) -> usize {
    header[0] = FIN_FLAG | OPCODE_BINARY;
    header[1] = 0;
    if len > 65535 {
        header[1] |= LENGTH_64BIT;
        let mut v = len;
        for i in (2..=9).rev() {
            header[i] = (v & 0xFF) as u8;
            v >>= 8;
        }
        10
    } else if len >= LENGTH_16BIT as u64 {
        header[1] |= LENGTH_16BIT;
        header[2] = (len >> 8) as u8;
        header[3] = (len & 0xFF) as u8;
        4
    } else {
        header[1] |= len as u8;
        2
    }
}

/// Trim an iovec to at most `maxlen` total bytes, cutting only the final
/// contributing segment so prior segments survive untouched.
fn constrain_iov<'a>(iov: &'a [IoSlice<'a>], maxlen: u64) -> Vec<IoSlice<'a>> {
    let mut out = Vec::with_capacity(iov.len());
    let mut remaining = maxlen;
    for seg in iov {
        if remaining == 0 {
            break;
        }
        if seg.len() as u64 > remaining {
            out.push(IoSlice::new(&seg[..remaining as usize]));
            return out;
        }
        out.push(IoSlice::new(seg));
        remaining -= seg.len() as u64;
    }
    out
}

fn find_header_value<'a>(text: &'a str, name: &str) -> Option<&'a str> {
    let needle = format!("\n{name}");
    let lower_text = text.to_ascii_lowercase();
    let lower_needle = needle.to_ascii_lowercase();
    let idx = lower_text.find(&lower_needle)?;
    Some(&text[idx + needle.len()..])
}

fn header_line(rest: &str) -> &str {
    match rest.find('\r') {
        Some(i) => &rest[..i],
        None => rest,
    }
}

fn is_handshake_start(text: &str) -> bool {
    if !text.starts_with("GET ") || !text.ends_with("\r\n\r\n") {
        return false;
    }
    let Some(protocol_rest) = find_header_value(text, "Sec-WebSocket-Protocol:") else {
        return false;
    };
    if find_header_value(text, "Sec-WebSocket-Key:").is_none() {
        return false;
    }
    header_line(protocol_rest).trim() == "binary"
}

fn extract_key(text: &str) -> Option<String> {
    let rest = find_header_value(text, "Sec-WebSocket-Key:")?;
    Some(header_line(rest).trim().to_string())
}

fn compute_accept(key: &str) -> String {
    let mut hasher = Sha1::new();
    hasher.update(key.as_bytes());
    hasher.update(WEBSOCKET_GUID.as_bytes());
    base64::engine::general_purpose::STANDARD.encode(hasher.finalize())
}

fn would_block_or_interrupted(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted
    )
}

fn broken_pipe() -> io::Error {
    io::Error::new(io::ErrorKind::BrokenPipe, "websocket closed")
}

/// A server-side WebSocket connection framing binary messages over a raw
/// byte stream.
///
/// `S` is any non-blocking-capable stream implementing [`Read`] + [`Write`]
/// (a `TcpStream`, a TLS stream, or a test double). Short reads/writes and
/// `WouldBlock`/`Interrupted` errors are expected and handled; the framer
/// never blocks on its own.
pub struct WebSocketTransport<S> {
    stream: S,
    closed: bool,
    close_pending: bool,
    read_frame: ReadFrame,
    write_header: [u8; MAX_HEADER_SIZE],
    write_header_pos: u8,
    write_header_len: u8,
    write_remainder: u64,
}

impl<S: Read + Write> WebSocketTransport<S> {
    /// Perform the opening handshake and return a ready-to-use transport.
    ///
    /// `initial` is whatever bytes the caller has already read off the raw
    /// stream while sniffing for an HTTP request; this copies them into a
    /// scratch buffer, performs exactly one additional raw read to fill in
    /// the rest of the request, then validates and responds.
    pub fn new(initial: &[u8], mut stream: S) -> Result<Self, WebSocketError> {
        if initial.len() >= HANDSHAKE_BUF_LEN - 1 {
            return Err(WebSocketError::HandshakeRejected);
        }

        let mut buf = vec![0u8; HANDSHAKE_BUF_LEN];
        buf[..initial.len()].copy_from_slice(initial);
        let mut len = initial.len();

        let n = stream.read(&mut buf[len..HANDSHAKE_BUF_LEN - 1])?;
        if n == 0 {
            return Err(WebSocketError::HandshakeRejected);
        }
        len += n;
        buf[len] = 0;

        let text =
            std::str::from_utf8(&buf[..len]).map_err(|_| WebSocketError::HandshakeRejected)?;
        if !is_handshake_start(text) {
            return Err(WebSocketError::HandshakeRejected);
        }

        let key = extract_key(text).ok_or(WebSocketError::HandshakeRejected)?;
        let accept = compute_accept(&key);
        let response = format!(
            "HTTP/1.1 101 Switching Protocols\r\n\
             Upgrade: websocket\r\n\
             Connection: Upgrade\r\n\
             Sec-WebSocket-Accept: {accept}\r\n\
             Sec-WebSocket-Protocol: binary\r\n\r\n"
        );
        let written = stream.write(response.as_bytes())?;
        if written != response.len() {
            return Err(WebSocketError::HandshakeRejected);
        }

        tracing::debug!("websocket handshake accepted");

        Ok(Self {
            stream,
            closed: false,
            close_pending: false,
            read_frame: ReadFrame::default(),
            write_header: [0; MAX_HEADER_SIZE],
            write_header_pos: 0,
            write_header_len: 0,
            write_remainder: 0,
        })
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    pub fn close_pending(&self) -> bool {
        self.close_pending
    }

    /// Read up to `buf.len()` bytes of unmasked application data.
    ///
    /// Returns `Ok(0)` once the connection is closed or a close frame has
    /// been observed (close-pending). A reserved-bit violation, a
    /// fragmented control frame, an unknown opcode, or an oversize control
    /// frame mark the connection closed and surface as an `Err`.
    pub fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if self.closed || self.close_pending {
            let mut discard = [0u8; 128];
            let _ = self.stream.read(&mut discard);
            return Ok(0);
        }

        let mut delivered = 0usize;
        let mut remaining = buf;

        while !remaining.is_empty() {
            if !self.read_frame.frame_ready {
                let needed = self.read_frame.bytes_needed();
                let pos = self.read_frame.header_pos;
                match self.stream.read(&mut self.read_frame.header[pos..pos + needed]) {
                    Ok(0) => {
                        self.closed = true;
                        return Ok(0);
                    }
                    Ok(n) => {
                        self.read_frame.header_pos += n;
                        if let Err(e) = self.read_frame.try_parse() {
                            self.closed = true;
                            return Err(io::Error::new(io::ErrorKind::InvalidData, e));
                        }
                    }
                    Err(e) if would_block_or_interrupted(&e) => {
                        if delivered > 0 {
                            return Ok(delivered);
                        }
                        return Err(e);
                    }
                    Err(e) => return Err(e),
                }
            } else if self.read_frame.opcode == OPCODE_CLOSE {
                self.close_pending = true;
                self.read_frame.clear();
                let _ = self.send_pending_data();
                return Ok(0);
            } else if self.read_frame.opcode == OPCODE_BINARY {
                let remaining_in_frame =
                    (self.read_frame.expected_len - self.read_frame.relayed) as usize;
                let want = remaining.len().min(remaining_in_frame);
                match self.stream.read(&mut remaining[..want]) {
                    Ok(0) => {
                        self.closed = true;
                        return Ok(0);
                    }
                    Ok(n) => {
                        let consumed = self.read_frame.relay(&mut remaining[..n]);
                        debug_assert_eq!(consumed, n);
                        delivered += n;
                        remaining = &mut remaining[n..];
                        if self.read_frame.relayed >= self.read_frame.expected_len {
                            self.read_frame.clear();
                        }
                    }
                    Err(e) if would_block_or_interrupted(&e) => {
                        if delivered > 0 {
                            return Ok(delivered);
                        }
                        return Err(e);
                    }
                    Err(e) => return Err(e),
                }
            } else {
                tracing::warn!(opcode = self.read_frame.opcode, "discarding unsupported websocket frame");
                self.read_frame.clear();
                continue;
            }
        }

        Ok(delivered)
    }

    fn send_data_header_left(&mut self) -> io::Result<()> {
        let pos = self.write_header_pos as usize;
        let len = self.write_header_len as usize;
        let rc = self.stream.write(&self.write_header[pos..len])?;
        if rc == 0 {
            return Err(io::Error::new(io::ErrorKind::WriteZero, "short header write"));
        }
        self.write_header_pos += rc as u8;
        if (self.write_header_pos as usize) >= len {
            let mut used = 1usize;
            self.write_remainder = extract_length(&self.write_header, &mut used);
            Ok(())
        } else {
            Err(io::Error::new(io::ErrorKind::WouldBlock, "header partially sent"))
        }
    }

    fn send_data_header(&mut self, len: u64) -> io::Result<()> {
        debug_assert!(self.write_header_pos as usize >= self.write_header_len as usize);
        debug_assert_eq!(self.write_remainder, 0);
        self.write_header_pos = 0;
        self.write_header_len = fill_header(&mut self.write_header, len) as u8;
        self.send_data_header_left()
    }

    fn ack_close(&mut self) -> io::Result<()> {
        let header = [FIN_FLAG | OPCODE_CLOSE, 0u8];
        let rc = self.stream.write(&header)?;
        if rc == header.len() {
            self.close_pending = false;
            self.closed = true;
            Ok(())
        } else {
            Err(io::Error::new(io::ErrorKind::WouldBlock, "close ack partially sent"))
        }
    }

    /// Flush any residual outbound header or a pending close ack before new
    /// application data may be framed.
    fn send_pending_data(&mut self) -> io::Result<()> {
        if self.write_remainder > 0 {
            return Ok(());
        }
        if (self.write_header_pos as usize) < (self.write_header_len as usize) {
            return self.send_data_header_left();
        }
        if self.close_pending {
            self.ack_close()?;
        }
        Ok(())
    }

    /// Write `buf` framed as (part of) a binary message.
    pub fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if self.closed {
            return Err(broken_pipe());
        }
        self.send_pending_data()?;
        if self.closed {
            // A pending close ack was just flushed in full.
            return Err(broken_pipe());
        }

        let len = if self.write_remainder == 0 {
            self.send_data_header(buf.len() as u64)?;
            self.write_remainder
        } else {
            self.write_remainder.min(buf.len() as u64)
        };

        let rc = self.stream.write(&buf[..len as usize])?;
        self.write_remainder -= rc as u64;
        Ok(rc)
    }

    /// Write scattered application data framed as a single binary message.
    pub fn writev(&mut self, bufs: &[IoSlice<'_>]) -> io::Result<usize> {
        if self.closed {
            return Err(broken_pipe());
        }
        self.send_pending_data()?;
        if self.closed {
            return Err(broken_pipe());
        }

        if self.write_remainder > 0 {
            let constrained = constrain_iov(bufs, self.write_remainder);
            let rc = self.stream.write_vectored(&constrained)?;
            self.write_remainder -= rc as u64;
            return Ok(rc);
        }

        let total: u64 = bufs.iter().map(|b| b.len() as u64).sum();
        self.write_header_pos = 0;
        self.write_header_len = fill_header(&mut self.write_header, total) as u8;

        let header_copy = self.write_header;
        let mut iov_out = Vec::with_capacity(bufs.len() + 1);
        iov_out.push(IoSlice::new(&header_copy[..self.write_header_len as usize]));
        iov_out.extend_from_slice(bufs);

        let rc = self.stream.write_vectored(&iov_out)?;
        if rc < self.write_header_len as usize {
            self.write_header_pos = rc as u8;
            return Err(io::Error::new(io::ErrorKind::WouldBlock, "header partially sent (writev)"));
        }

        self.write_header_pos = self.write_header_len;
        let body_written = rc - self.write_header_len as usize;
        self.write_remainder = total - body_written as u64;
        Ok(body_written)
    }
}

/// Lets a `WebSocketTransport` stand in anywhere a plain byte stream is
/// expected — in particular as a [`crate::channel_client::ClientStream`] —
/// so a channel-client's `receive`/`push` never need to know whether the
/// bytes underneath are framed.
impl<S: Read + Write> Read for WebSocketTransport<S> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        WebSocketTransport::read(self, buf)
    }
}

impl<S: Read + Write> Write for WebSocketTransport<S> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        WebSocketTransport::write(self, buf)
    }

    fn write_vectored(&mut self, bufs: &[IoSlice<'_>]) -> io::Result<usize> {
        WebSocketTransport::writev(self, bufs)
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

#[cfg(unix)]
impl<S: Read + Write + std::os::fd::AsRawFd> std::os::fd::AsRawFd for WebSocketTransport<S> {
    fn as_raw_fd(&self) -> std::os::fd::RawFd {
        self.stream.as_raw_fd()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;

    /// An in-memory duplex stream whose raw read/write can be capped to
    /// simulate short, non-blocking I/O.
    struct MockStream {
        inbound: VecDeque<u8>,
        outbound: Vec<u8>,
        read_cap: Option<usize>,
        write_cap: Option<usize>,
        /// Whether an empty `inbound` means "peer closed" (`Ok(0)`) or
        /// "no data right now" (`WouldBlock`). Real non-blocking sockets
        /// distinguish these; a fixed-size test buffer needs to be told.
        eof: bool,
    }

    impl MockStream {
        fn new(inbound: &[u8]) -> Self {
            Self {
                inbound: inbound.iter().copied().collect(),
                outbound: Vec::new(),
                read_cap: None,
                write_cap: None,
                eof: false,
            }
        }
    }

    impl Read for MockStream {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            if self.inbound.is_empty() {
                return if self.eof {
                    Ok(0)
                } else {
                    Err(io::Error::new(io::ErrorKind::WouldBlock, "no data"))
                };
            }
            let cap = self.read_cap.unwrap_or(usize::MAX);
            let n = buf.len().min(cap).min(self.inbound.len());
            for slot in buf.iter_mut().take(n) {
                *slot = self.inbound.pop_front().unwrap();
            }
            Ok(n)
        }
    }

    impl Write for MockStream {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            let cap = self.write_cap.unwrap_or(usize::MAX);
            let n = buf.len().min(cap);
            self.outbound.extend_from_slice(&buf[..n]);
            Ok(n)
        }

        fn write_vectored(&mut self, bufs: &[IoSlice<'_>]) -> io::Result<usize> {
            let cap = self.write_cap.unwrap_or(usize::MAX);
            let mut written = 0;
            for seg in bufs {
                if written >= cap {
                    break;
                }
                let take = seg.len().min(cap - written);
                self.outbound.extend_from_slice(&seg[..take]);
                written += take;
                if take < seg.len() {
                    break;
                }
            }
            Ok(written)
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    fn handshake_request() -> Vec<u8> {
        b"GET /x HTTP/1.1\r\n\
          Host: h\r\n\
          Upgrade: websocket\r\n\
          Sec-WebSocket-Key: dGhlIHNhbXBsZSBub25jZQ==\r\n\
          Sec-WebSocket-Protocol: binary\r\n\r\n"
            .to_vec()
    }

    #[test]
    fn handshake_produces_expected_accept_token() {
        let request = handshake_request();
        let stream = MockStream::new(b"");
        let mut stream = stream;
        // Feed the whole request as the "initial bytes" and let the extra
        // read return 0 additional bytes naturally via an empty inbound.
        let ws = WebSocketTransport::new(&request, &mut stream);
        // The extra read returns 0 bytes (empty inbound) which the real
        // implementation treats as handshake failure, so drive it through
        // a stream that still has at least one more byte available -
        // feed a single trailing byte that is irrelevant to parsing.
        assert!(ws.is_err());

        let mut stream2 = MockStream::new(b" ");
        let mut initial = request.clone();
        initial.truncate(initial.len() - 1);
        let last_byte = *request.last().unwrap();
        stream2.inbound.push_back(last_byte);
        let ws = WebSocketTransport::new(&initial, stream2).expect("handshake should succeed");
        let response = String::from_utf8(ws.stream.outbound.clone()).unwrap();
        assert!(response.contains("Sec-WebSocket-Accept: s3pPLMBiTxaQ9kYGzzhZRbK+xOo="));
        assert!(response.contains("Sec-WebSocket-Protocol: binary"));
    }

    fn connected(extra_inbound: &[u8]) -> WebSocketTransport<MockStream> {
        let request = handshake_request();
        let mut initial = request.clone();
        initial.truncate(initial.len() - 1);
        let mut stream = MockStream::new(&[&request[request.len() - 1..], extra_inbound].concat());
        // Cap the handshake's one extra read to exactly the missing byte so
        // the frame bytes that follow stay buffered for later `read` calls.
        stream.read_cap = Some(1);
        let mut ws = WebSocketTransport::new(&initial, stream).expect("handshake should succeed");
        ws.stream.read_cap = None;
        ws
    }

    #[test]
    fn masked_frame_decodes_to_hello() {
        let frame = [0x82, 0x85, 0x37, 0xfa, 0x21, 0x3d, 0x7f, 0x9f, 0x4d, 0x51, 0x58];
        let mut ws = connected(&frame);

        let mut buf = [0u8; 16];
        let n = ws.read(&mut buf).unwrap();
        assert_eq!(&buf[..n], b"Hello");
        assert!(!ws.is_closed());
    }

    #[test]
    fn close_frame_triggers_ack_and_close() {
        let mut ws = connected(&[0x88, 0x00]);
        // Refuse the ack write during `read` so close-pending survives it;
        // otherwise `read`'s own `send_pending_data` call flushes the ack
        // immediately (the stream is otherwise always writable here) and
        // there is nothing left to observe on the next `write`.
        ws.stream.write_cap = Some(0);

        let mut buf = [0u8; 16];
        let n = ws.read(&mut buf).unwrap();
        assert_eq!(n, 0);
        assert!(ws.close_pending());
        assert!(ws.stream.outbound.is_empty());

        ws.stream.write_cap = None;
        let err = ws.write(b"data").unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::BrokenPipe);
        assert!(ws.is_closed());
        assert_eq!(ws.stream.outbound, vec![0x88, 0x00]);
    }

    #[test]
    fn partial_header_write_resumes_before_body() {
        let mut ws = connected(&[]);
        ws.stream.write_cap = Some(2);

        let n = ws.write(b"ABC").unwrap();
        assert_eq!(ws.write_header_pos, ws.write_header_len);
        assert_eq!(ws.write_remainder, 3 - n as u64);

        ws.stream.write_cap = None;
        let n2 = ws.write(&b"ABC"[n..]).unwrap();
        assert_eq!(n + n2, 3);
        assert_eq!(ws.write_remainder, 0);
    }

    #[test]
    fn header_round_trip_for_boundary_lengths() {
        for len in [0u64, 1, 125, 126, 65535, 65536, 1 << 32, 1 << 40] {
            let mut header = [0u8; MAX_HEADER_SIZE];
            let used = fill_header(&mut header, len);
            let mut pos = 1usize;
            let parsed = extract_length(&header, &mut pos);
            assert_eq!(parsed, len);
            assert_eq!(pos, used);
        }
    }
}
