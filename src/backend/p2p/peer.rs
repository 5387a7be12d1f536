//! Per-connection state for the point-to-point backend (spec.md §4.G.3):
//! one `Peer` per other process in the group, tracking its address, its
//! live socket (once connected), outstanding send credit, and any
//! in-progress inbound transfer.
//!
//! Grounded on `server/src/lib.rs`'s per-session state struct pattern
//! (a small bag of fields updated as commands arrive, no separate state
//! machine type).

use std::collections::VecDeque;
use std::io::Write;
use std::net::ToSocketAddrs;

use mio::net::TcpStream;

use crate::error::{PartgridError, TransportError};
use crate::index::Slice;
use crate::reduce::ReduceOp;

use super::protocol::{encode_hex, Command};

/// One element of a queued transfer: its position within the transfer
/// (`seq`, shared by every element of one `queue_send` call) and its
/// lex-order index within the slice being sent, plus the formatted wire
/// line once built and how much of it has been written so far.
struct OutboundElement {
    seq: u64,
    index: i64,
    bytes: Vec<u8>,
    line: Option<Vec<u8>>,
    written: usize,
}

/// How many bytes of line-oriented command text this crate buffers per
/// peer connection before treating an unterminated line as a protocol
/// error. Raised from spec.md's illustrative 256 (explicitly permitted:
/// "implementations may raise this limit without changing semantics").
pub const LINE_BUFFER_BYTES: usize = 4096;

/// Bookkeeping for a `data` payload currently being received from this
/// peer, one element at a time: the target region, how many elements have
/// arrived so far, and whether arriving elements must be combined into
/// what's already there (`Reduce`) or simply written.
pub struct RecvWindow {
    /// The region this payload will be unpacked into.
    pub slice: Slice,
    /// Size in bytes of one element of `slice`.
    pub elem_size: usize,
    /// The combining operator, if any.
    pub reduce: Option<ReduceOp>,
    /// Bytes received so far, laid out by lex-order index.
    pub buffer: Vec<u8>,
    /// Elements received so far.
    received: usize,
    /// Total elements expected (`slice.len()`).
    expected_count: usize,
}

impl RecvWindow {
    /// True once every expected element has arrived.
    pub fn is_complete(&self) -> bool { self.received >= self.expected_count }
}

/// One other process in the group, as seen by this process's p2p backend.
pub struct Peer {
    lid: i64,
    host: String,
    port: u16,
    stream: Option<TcpStream>,
    send_credit: u64,
    recv_window: Option<RecvWindow>,
    outbound: VecDeque<OutboundElement>,
    next_send_seq: u64,
    read_buffer: Vec<u8>,
}

impl Peer {
    /// A not-yet-connected peer record, known only by address.
    pub fn new(lid: i64, host: impl Into<String>, port: u16) -> Self {
        Peer {
            lid,
            host: host.into(),
            port,
            stream: None,
            send_credit: 0,
            recv_window: None,
            outbound: VecDeque::new(),
            next_send_seq: 0,
            read_buffer: Vec::new(),
        }
    }

    /// This peer's location-ID.
    pub fn lid(&self) -> i64 { self.lid }
    /// This peer's advertised host.
    pub fn host(&self) -> &str { &self.host }
    /// This peer's advertised port.
    pub fn port(&self) -> u16 { self.port }

    /// True if a live connection is established (lazily — spec.md §4.G.3
    /// only dials a peer the first time data actually needs to move).
    pub fn is_connected(&self) -> bool { self.stream.is_some() }

    /// Dials this peer if not already connected. The connect itself is
    /// non-blocking (it completes once the event loop sees this peer's
    /// token become writable); callers only need the `TcpStream` to
    /// register it with `mio::Poll`.
    pub fn ensure_connected(&mut self) -> Result<&mut TcpStream, PartgridError> {
        if self.stream.is_none() {
            let addr = (self.host.as_str(), self.port)
                .to_socket_addrs()
                .map_err(|source| {
                    PartgridError::Transport(TransportError::Io {
                        context: format!("resolving address of lid {}", self.lid),
                        source,
                    })
                })?
                .next()
                .ok_or_else(|| PartgridError::config(format!("no address for lid {}", self.lid)))?;
            let stream = TcpStream::connect(addr).map_err(|source| {
                PartgridError::Transport(TransportError::Io {
                    context: format!("connecting to lid {}", self.lid),
                    source,
                })
            })?;
            self.stream = Some(stream);
        }
        Ok(self.stream.as_mut().expect("just set"))
    }

    /// Adopts an already-accepted inbound connection for this peer (the
    /// home process, and any process accepting a late-joining peer's
    /// connection, learns the peer's identity only after the socket is
    /// already open).
    pub fn adopt_stream(&mut self, stream: TcpStream) {
        stream.set_nodelay(true).ok();
        self.stream = Some(stream);
    }

    /// The live stream, if connected.
    pub fn stream_mut(&mut self) -> Option<&mut TcpStream> { self.stream.as_mut() }

    /// Drops the connection (spec.md §4.G.6 resize: a removed peer's
    /// socket is torn down once its buffered lines are drained).
    pub fn disconnect(&mut self) { self.stream = None; }

    /// Grants `count` further elements of send credit (`allowsend`
    /// received from this peer).
    pub fn grant_send_credit(&mut self, count: u64) { self.send_credit += count; }

    /// Consumes `count` elements of send credit, failing if insufficient
    /// credit has been granted — spec.md's invariant that a sender never
    /// sends more than it has been allowed is enforced here as a `Logic`
    /// panic, since a violation means this crate's own bookkeeping is
    /// wrong, not that the peer misbehaved.
    pub fn take_send_credit(&mut self, count: u64) {
        assert!(
            self.send_credit >= count,
            "attempted to send {count} elements to lid {} with only {} elements of credit",
            self.lid,
            self.send_credit
        );
        self.send_credit -= count;
    }

    /// Available send credit.
    pub fn send_credit(&self) -> u64 { self.send_credit }

    /// Begins tracking an inbound payload for `slice`.
    pub fn begin_recv(&mut self, slice: Slice, elem_size: usize, reduce: Option<ReduceOp>) {
        let expected_count = slice.len();
        self.recv_window = Some(RecvWindow {
            slice,
            elem_size,
            reduce,
            buffer: vec![0u8; expected_count * elem_size],
            received: 0,
            expected_count,
        });
    }

    /// True if a `data` payload is currently being accumulated.
    pub fn is_receiving(&self) -> bool { self.recv_window.is_some() }

    /// Places one received element at `index` within the active recv
    /// window, returning the window (and clearing the in-progress state)
    /// once every element has arrived.
    pub fn receive_element(&mut self, index: i64, bytes: Vec<u8>) -> Result<Option<RecvWindow>, PartgridError> {
        let window = self
            .recv_window
            .as_mut()
            .ok_or_else(|| PartgridError::protocol(format!("data element from lid {} with no open recv window", self.lid)))?;
        if bytes.len() != window.elem_size {
            return Err(PartgridError::protocol(format!(
                "data element from lid {} is {} bytes, expected {}",
                self.lid,
                bytes.len(),
                window.elem_size
            )));
        }
        if index < 0 || index as usize >= window.expected_count {
            return Err(PartgridError::protocol(format!("data element index {index} out of range for lid {}", self.lid)));
        }
        let offset = index as usize * window.elem_size;
        window.buffer[offset..offset + window.elem_size].copy_from_slice(&bytes);
        window.received += 1;
        if window.is_complete() {
            Ok(self.recv_window.take())
        } else {
            Ok(None)
        }
    }

    /// Queues one slice's worth of already-packed `payload` bytes for
    /// transmission, split into `count` per-element `data` commands (one
    /// per lex-order index) to be written out as credit allows.
    pub fn queue_send(&mut self, elem_size: usize, count: u64, payload: Vec<u8>) {
        let seq = self.next_send_seq;
        self.next_send_seq += 1;
        for i in 0..count as usize {
            let bytes = payload[i * elem_size..(i + 1) * elem_size].to_vec();
            self.outbound.push_back(OutboundElement { seq, index: i as i64, bytes, line: None, written: 0 });
        }
    }

    /// True if every queued send has been fully written to the socket.
    pub fn outbound_drained(&self) -> bool { self.outbound.is_empty() }

    /// Writes as much of the head-of-queue outbound element as credit and
    /// socket readiness allow. Each element is a single self-contained
    /// `data` line; one element consumes one unit of send credit.
    pub fn try_flush(&mut self) -> Result<(), PartgridError> {
        loop {
            if self.send_credit < 1 || self.outbound.is_empty() {
                return Ok(());
            }
            let item = self.outbound.front_mut().expect("checked above");
            if item.line.is_none() {
                let cmd = Command::Data {
                    bytelen: item.bytes.len() as u64,
                    seq: item.seq,
                    index: item.index,
                    hex: encode_hex(&item.bytes),
                };
                item.line = Some(format!("{}\n", cmd.format()).into_bytes());
            }
            let line = item.line.as_ref().expect("just set");
            let stream = self
                .stream
                .as_mut()
                .ok_or_else(|| PartgridError::config(format!("no connection to lid {}", self.lid)))?;
            match stream.write(&line[item.written..]) {
                Ok(0) => return Err(PartgridError::Transport(TransportError::PeerGone { lid: self.lid })),
                Ok(n) => {
                    item.written += n;
                    if item.written >= line.len() {
                        self.outbound.pop_front().expect("checked above");
                        self.send_credit -= 1;
                    }
                }
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => return Ok(()),
                Err(source) => {
                    return Err(PartgridError::Transport(TransportError::Io {
                        context: format!("writing to lid {}", self.lid),
                        source,
                    }))
                }
            }
        }
    }

    /// Appends freshly-read bytes to this peer's carry buffer (bytes read
    /// off the socket that haven't yet been consumed as a complete line).
    pub fn buffer_read(&mut self, bytes: &[u8]) {
        self.read_buffer.extend_from_slice(bytes);
    }

    /// Pulls one complete line (without its newline) out of the carry
    /// buffer, if a newline is present. The wire protocol is entirely
    /// line-oriented, `data` commands included, so no other mode of
    /// consuming the carry buffer exists.
    pub fn take_line(&mut self) -> Option<String> {
        let newline = self.read_buffer.iter().position(|&b| b == b'\n')?;
        let line: Vec<u8> = self.read_buffer.drain(..=newline).collect();
        Some(String::from_utf8_lossy(&line[..line.len() - 1]).into_owned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn send_credit_accumulates_and_depletes() {
        let mut peer = Peer::new(1, "127.0.0.1", 9000);
        peer.grant_send_credit(10);
        peer.grant_send_credit(5);
        assert_eq!(peer.send_credit(), 15);
        peer.take_send_credit(12);
        assert_eq!(peer.send_credit(), 3);
    }

    #[test]
    #[should_panic]
    fn take_more_credit_than_granted_panics() {
        let mut peer = Peer::new(1, "127.0.0.1", 9000);
        peer.grant_send_credit(1);
        peer.take_send_credit(2);
    }

    #[test]
    fn recv_window_completes_across_multiple_elements() {
        let mut peer = Peer::new(2, "127.0.0.1", 9001);
        let slice = Slice::new(&[(0, 2)]).unwrap();
        peer.begin_recv(slice, 8, None);
        assert!(peer.receive_element(0, vec![0u8; 8]).unwrap().is_none());
        let complete = peer.receive_element(1, vec![1u8; 8]).unwrap();
        assert!(complete.is_some());
        assert!(!peer.is_receiving());
    }

    #[test]
    fn receive_element_rejects_wrong_size() {
        let mut peer = Peer::new(2, "127.0.0.1", 9001);
        let slice = Slice::new(&[(0, 2)]).unwrap();
        peer.begin_recv(slice, 8, None);
        assert!(peer.receive_element(0, vec![0u8; 4]).is_err());
    }
}
