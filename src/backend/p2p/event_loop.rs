//! `P2pBackend`, the point-to-point backend of spec.md §4.G: a single
//! readiness-driven event loop (§4.G.5) over `mio`, one socket per peer,
//! credit-based flow control (§4.G.3's `allowsend`), and elastic resize
//! (§4.G.6).
//!
//! Grounded on `server/src/bin/server.rs`'s command-dispatch loop for the
//! per-line handling, generalized from a single stdin stream to many
//! socket streams multiplexed by a readiness poller — the shape design
//! note §9 asks for explicitly ("a state machine driven by a readiness
//! poller... is the idiomatic choice for a systems language").

use std::collections::HashMap;
use std::io::{Read, Write};
use std::net::{SocketAddr, ToSocketAddrs};
use std::time::Duration;

use mio::net::{TcpListener, TcpStream};
use mio::{Events, Interest, Poll, Token};
use tracing::{debug, warn};

use crate::backend::{Backend, TransferId};
use crate::error::{PartgridError, TransportError};
use crate::group::Group;
use crate::index::Slice;
use crate::logging;
use crate::mapping::Mapping;
use crate::partitioning::AccessIntent;
use crate::reduce::ReduceOp;
use crate::transition::Transition;

use super::peer::Peer;
use super::protocol::{decode_hex, Command};

const LISTENER_TOKEN: Token = Token(0);

fn peer_token(lid: i64) -> Token { Token(lid as usize + 1) }

fn resolve_addr(host: &str, port: u16) -> Result<SocketAddr, PartgridError> {
    (host, port)
        .to_socket_addrs()
        .map_err(|source| PartgridError::Transport(TransportError::Io { context: "resolving address".into(), source }))?
        .next()
        .ok_or_else(|| PartgridError::config(format!("{host}:{port} resolved to no address")))
}

struct PendingInbound {
    from: i64,
    slice: Slice,
    reduce: Option<ReduceOp>,
    /// Index into this transfer's `fanouts`, if completing this entry is
    /// one of the contributions a manual subgroup reduce (spec.md §4.H) is
    /// waiting on before it can broadcast its combined result onward.
    fanout: Option<usize>,
}

/// A `Reduce`-region broadcast this rank owes once every contribution named
/// by `remaining` has arrived: the lowest-ranked member of a reduce
/// record's output subgroup accumulates every other input member's
/// contribution into `new_mapping`, then forwards the combined region to
/// the rest of the output subgroup. Point-to-point has no native
/// all-reduce to delegate to (unlike `CollectiveBackend`), so every
/// `ReduceRecord` takes this path regardless of group shape.
struct ReduceFanout {
    slice: Slice,
    remaining: usize,
    to: Vec<i64>,
    sent: bool,
}

struct PendingTransfer {
    transition: Transition,
    inbound: Vec<PendingInbound>,
    outbound_peers: Vec<i64>,
    fanouts: Vec<ReduceFanout>,
}

/// The point-to-point backend: every rank dials (or is dialed by) every
/// other rank it exchanges data with, lazily, the first time a transition
/// actually needs to move bytes between the two.
pub struct P2pBackend {
    rank: i64,
    poll: Poll,
    events: Events,
    listener: Option<TcpListener>,
    peers: HashMap<i64, Peer>,
    pending: HashMap<TransferId, PendingTransfer>,
    next_id: TransferId,
}

impl P2pBackend {
    /// Builds a backend for `rank`, listening on `listen_host`/
    /// `listen_port` for inbound connections from peers that dial this
    /// rank first.
    pub fn new(rank: i64, listen_host: &str, listen_port: u16) -> Result<Self, PartgridError> {
        let poll = Poll::new().map_err(|source| {
            PartgridError::Transport(TransportError::Io { context: "creating mio poll".into(), source })
        })?;
        let addr = resolve_addr(listen_host, listen_port)?;
        let mut listener = TcpListener::bind(addr).map_err(|source| {
            PartgridError::Transport(TransportError::Io {
                context: format!("binding p2p listener on {listen_host}:{listen_port}"),
                source,
            })
        })?;
        poll.registry()
            .register(&mut listener, LISTENER_TOKEN, Interest::READABLE)
            .map_err(|source| {
                PartgridError::Transport(TransportError::Io { context: "registering p2p listener".into(), source })
            })?;
        Ok(P2pBackend {
            rank,
            poll,
            events: Events::with_capacity(128),
            listener: Some(listener),
            peers: HashMap::new(),
            pending: HashMap::new(),
            next_id: 0,
        })
    }

    fn peer_mut(&mut self, lid: i64) -> Option<&mut Peer> { self.peers.get_mut(&lid) }

    /// Ensures exactly one connection exists between this process and
    /// `lid`: the lower-ranked side dials, the higher-ranked side waits
    /// for `accept_pending` to deliver it. Without this convention both
    /// sides would independently dial each other, leaving two redundant
    /// sockets where the protocol expects one.
    fn ensure_registered(&mut self, lid: i64) -> Result<(), PartgridError> {
        let already_connected = match self.peers.get(&lid) {
            Some(peer) => peer.is_connected(),
            None => return Err(PartgridError::config(format!("unknown peer lid {lid}"))),
        };
        if already_connected {
            return Ok(());
        }

        if self.rank < lid {
            let peer = self.peers.get_mut(&lid).expect("checked above");
            let stream = peer.ensure_connected()?;
            self.poll
                .registry()
                .register(stream, peer_token(lid), Interest::READABLE | Interest::WRITABLE)
                .map_err(|source| {
                    PartgridError::Transport(TransportError::Io {
                        context: format!("registering connection to lid {lid}"),
                        source,
                    })
                })?;
            // Identify ourselves to the far end so its `accept_pending` can
            // route this socket to the right `Peer` entry.
            write_line_spinning(stream, &Command::MyId { lid: self.rank }.format())?;
            Ok(())
        } else {
            loop {
                self.accept_pending()?;
                if self.peers.get(&lid).map(|p| p.is_connected()).unwrap_or(false) {
                    return Ok(());
                }
                std::thread::sleep(Duration::from_millis(5));
            }
        }
    }

    /// Accepts any inbound connections from peers that dialed this rank
    /// before we dialed them, identifying them from their first `myid`
    /// line.
    fn accept_pending(&mut self) -> Result<(), PartgridError> {
        loop {
            let accepted = match &mut self.listener {
                Some(listener) => listener.accept(),
                None => return Ok(()),
            };
            match accepted {
                Ok((mut stream, _addr)) => {
                    let lid = read_myid_line(&mut stream)?;
                    if let Some(peer) = self.peers.get_mut(&lid) {
                        peer.adopt_stream(stream);
                        let stream = peer.stream_mut().expect("just adopted");
                        self.poll
                            .registry()
                            .register(stream, peer_token(lid), Interest::READABLE | Interest::WRITABLE)
                            .map_err(|source| {
                                PartgridError::Transport(TransportError::Io {
                                    context: format!("registering accepted connection from lid {lid}"),
                                    source,
                                })
                            })?;
                    } else {
                        warn!(lid, "accepted connection from unknown peer, dropping");
                    }
                }
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => return Ok(()),
                Err(source) => {
                    return Err(PartgridError::Transport(TransportError::Io {
                        context: "accepting p2p connection".into(),
                        source,
                    }))
                }
            }
        }
    }

    /// Packs and queues `slice` from `new_mapping` to every peer in a
    /// fan-in reduction's output subgroup whose last contribution has just
    /// arrived (or that never needed any, e.g. a single-member input
    /// subgroup). A fanout only fires once, guarded by `sent`.
    fn flush_ready_fanouts(&mut self, id: TransferId, new_mapping: &mut Mapping) -> Result<(), PartgridError> {
        let ready: Vec<(usize, Slice, Vec<i64>)> = match self.pending.get(&id) {
            Some(transfer) => transfer
                .fanouts
                .iter()
                .enumerate()
                .filter(|(_, f)| f.remaining == 0 && !f.sent)
                .map(|(i, f)| (i, f.slice, f.to.clone()))
                .collect(),
            None => return Ok(()),
        };
        let elem_size = new_mapping.elem_size();
        for (idx, slice, to) in ready {
            let bytes = new_mapping.pack(&slice);
            for peer_lid in to {
                self.ensure_registered(peer_lid)?;
                let peer = self.peer_mut(peer_lid).expect("just ensured");
                peer.queue_send(elem_size, slice.len() as u64, bytes.clone());
                peer.try_flush()?;
            }
            if let Some(transfer) = self.pending.get_mut(&id) {
                transfer.fanouts[idx].sent = true;
            }
        }
        Ok(())
    }
}

/// Reads the one-line `myid <lid>` handshake a freshly accepted connection
/// sends before anything else. The connection is not yet registered with
/// the poller at this point, so this spins on `WouldBlock` rather than
/// waiting for a readiness event — acceptable since this happens once, at
/// connection setup, not on the steady-state data path.
fn read_myid_line(stream: &mut TcpStream) -> Result<i64, PartgridError> {
    let mut buf = Vec::new();
    let mut byte = [0u8; 1];
    loop {
        match stream.read(&mut byte) {
            Ok(0) => return Err(PartgridError::protocol("connection closed before myid line")),
            Ok(_) => {
                if byte[0] == b'\n' {
                    break;
                }
                buf.push(byte[0]);
            }
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => continue,
            Err(source) => {
                return Err(PartgridError::Transport(TransportError::Io {
                    context: "reading myid handshake line".into(),
                    source,
                }))
            }
        }
    }
    match Command::parse(&String::from_utf8_lossy(&buf))? {
        Command::MyId { lid } => Ok(lid),
        other => Err(PartgridError::protocol(format!("expected myid handshake, got {other:?}"))),
    }
}

fn write_line_spinning(stream: &mut TcpStream, line: &str) -> Result<(), PartgridError> {
    let bytes = format!("{line}\n").into_bytes();
    let mut written = 0;
    while written < bytes.len() {
        match stream.write(&bytes[written..]) {
            Ok(0) => return Err(PartgridError::Transport(TransportError::PeerGone { lid: -1 })),
            Ok(n) => written += n,
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => continue,
            Err(source) => {
                return Err(PartgridError::Transport(TransportError::Io {
                    context: "writing protocol line".into(),
                    source,
                }))
            }
        }
    }
    Ok(())
}

impl Backend for P2pBackend {
    fn finalize(&mut self, group: &Group) -> Result<(), PartgridError> {
        self.update_group(group)
    }

    fn update_group(&mut self, group: &Group) -> Result<(), PartgridError> {
        for (rank, location) in group.locations().iter().enumerate() {
            let lid = rank as i64;
            if lid == self.rank {
                continue;
            }
            self.peers.entry(lid).or_insert_with(|| Peer::new(lid, location.host(), location.port()));
        }
        let known: Vec<i64> = self.peers.keys().copied().collect();
        for lid in known {
            if group.location(lid as usize).is_none() {
                if let Some(mut peer) = self.peers.remove(&lid) {
                    if let Some(stream) = peer.stream_mut() {
                        let _ = self.poll.registry().deregister(stream);
                    }
                    peer.disconnect();
                    logging::peer_lost(lid);
                }
            }
        }
        Ok(())
    }

    fn prepare(&mut self, plan: Transition) -> Result<TransferId, PartgridError> {
        let id = self.next_id;
        self.next_id += 1;
        let rank = self.rank as usize;

        let mut inbound: Vec<PendingInbound> = plan
            .recvs
            .iter()
            .filter(|r| r.to_rank == rank)
            .map(|r| PendingInbound { from: r.from_rank as i64, slice: r.slice, reduce: r.reduce, fanout: None })
            .collect();
        let mut outbound_peers: Vec<i64> =
            plan.sends.iter().filter(|s| s.from_rank == rank).map(|s| s.to_rank as i64).collect();
        let mut fanouts: Vec<ReduceFanout> = Vec::new();

        for record in &plan.red {
            let lowest = *record.output_group.iter().min().expect("red record has an empty output group");
            if rank == lowest {
                let contributors: Vec<usize> = record.input_group.iter().copied().filter(|&r| r != rank).collect();
                let to: Vec<i64> = record.output_group.iter().copied().filter(|&r| r != lowest).map(|r| r as i64).collect();
                let fanout_idx = fanouts.len();
                outbound_peers.extend(to.iter().copied());
                fanouts.push(ReduceFanout { slice: record.slice, remaining: contributors.len(), to, sent: false });
                for input in contributors {
                    inbound.push(PendingInbound {
                        from: input as i64,
                        slice: record.slice,
                        reduce: Some(record.op),
                        fanout: Some(fanout_idx),
                    });
                }
            } else if record.input_group.contains(&rank) {
                outbound_peers.push(lowest as i64);
            } else if record.output_group.contains(&rank) {
                inbound.push(PendingInbound { from: lowest as i64, slice: record.slice, reduce: None, fanout: None });
            }
        }
        outbound_peers.sort_unstable();
        outbound_peers.dedup();

        self.pending.insert(id, PendingTransfer { transition: plan, inbound, outbound_peers, fanouts });
        Ok(id)
    }

    fn exec(
        &mut self,
        id: TransferId,
        old_mapping: &Mapping,
        new_mapping: &mut Mapping,
        elem_size: usize,
    ) -> Result<(), PartgridError> {
        let rank = self.rank as usize;

        let (locals, inits, mut sends, recvs) = {
            let transfer = self
                .pending
                .get(&id)
                .ok_or_else(|| PartgridError::config(format!("no such transfer {id}")))?;
            let locals: Vec<_> = transfer.transition.locals.iter().filter(|l| l.rank == rank).cloned().collect();
            let inits: Vec<_> = transfer.transition.inits.iter().filter(|i| i.rank == rank).cloned().collect();
            let mut sends: Vec<(i64, Slice)> = transfer
                .transition
                .sends
                .iter()
                .filter(|s| s.from_rank == rank)
                .map(|s| (s.to_rank as i64, s.slice))
                .collect();
            let recvs: Vec<(i64, Slice, Option<ReduceOp>)> =
                transfer.inbound.iter().map(|r| (r.from, r.slice, r.reduce)).collect();

            for record in &transfer.transition.red {
                let lowest = *record.output_group.iter().min().expect("red record has an empty output group");
                if rank != lowest && record.input_group.contains(&rank) {
                    sends.push((lowest as i64, record.slice));
                }
            }
            (locals, inits, sends, recvs)
        };

        for local in &locals {
            let bytes = old_mapping.pack(&local.slice);
            new_mapping.unpack(&local.slice, &bytes);
        }
        for init in &inits {
            let bytes = match init.intent {
                AccessIntent::Reduce(op) => match new_mapping.primitive() {
                    Some(p) => p.identity(op).repeat(init.slice.len()),
                    None => vec![0u8; init.slice.len() * elem_size],
                },
                _ => vec![0u8; init.slice.len() * elem_size],
            };
            new_mapping.unpack(&init.slice, &bytes);
        }

        // Seed every reduce record this rank is the fan-in point for: its
        // own contribution if it makes one, the operator's identity
        // otherwise. Further contributions arrive and combine in via
        // `service_peer` as `data` elements complete.
        {
            let transfer = self
                .pending
                .get(&id)
                .ok_or_else(|| PartgridError::config(format!("no such transfer {id}")))?;
            let seeds: Vec<(Slice, bool, ReduceOp)> = transfer
                .transition
                .red
                .iter()
                .filter(|r| *r.output_group.iter().min().expect("red record has an empty output group") == rank)
                .map(|r| (r.slice, r.input_group.contains(&rank), r.op))
                .collect();
            for (slice, contributes, op) in seeds {
                let seed = if contributes {
                    old_mapping.pack(&slice)
                } else if let Some(primitive) = new_mapping.primitive() {
                    primitive.identity(op).repeat(slice.len())
                } else {
                    vec![0u8; slice.len() * elem_size]
                };
                new_mapping.unpack(&slice, &seed);
            }
        }

        for (peer_lid, slice, _reduce) in recvs {
            self.ensure_registered(peer_lid)?;
            let peer = self.peer_mut(peer_lid).expect("just ensured");
            let stream = peer.stream_mut().ok_or_else(|| PartgridError::config("peer not connected"))?;
            write_line_spinning(stream, &Command::AllowSend { count: slice.len() as u64, elemsize: elem_size as u64 }.format())?;
        }

        for (peer_lid, slice) in sends {
            self.ensure_registered(peer_lid)?;
            let bytes = old_mapping.pack(&slice);
            let peer = self.peer_mut(peer_lid).expect("just ensured");
            peer.queue_send(elem_size, slice.len() as u64, bytes);
        }

        // A fanout with no contributions left to wait for (an empty or
        // self-only input subgroup) would otherwise never fire: nothing
        // will complete to trigger it from `service_peer`.
        self.flush_ready_fanouts(id, new_mapping)?;

        Ok(())
    }

    fn wait(&mut self, id: TransferId, new_mapping: &mut Mapping) -> Result<(), PartgridError> {
        loop {
            let (recv_done, send_done) = {
                let transfer = self
                    .pending
                    .get(&id)
                    .ok_or_else(|| PartgridError::config(format!("no such transfer {id}")))?;
                let recv_done = transfer.inbound.is_empty();
                let send_done = transfer.fanouts.iter().all(|f| f.sent)
                    && transfer
                        .outbound_peers
                        .iter()
                        .all(|lid| self.peers.get(lid).map(|p| p.outbound_drained()).unwrap_or(true));
                (recv_done, send_done)
            };
            if recv_done && send_done {
                return Ok(());
            }

            self.accept_pending()?;
            self.poll.poll(&mut self.events, Some(Duration::from_millis(50))).map_err(|source| {
                PartgridError::Transport(TransportError::Io { context: "polling p2p event loop".into(), source })
            })?;

            let tokens: Vec<Token> = self.events.iter().map(|e| e.token()).collect();
            for token in tokens {
                if token == LISTENER_TOKEN {
                    continue;
                }
                let lid = token.0 as i64 - 1;
                self.service_peer(lid, id, new_mapping)?;
            }
        }
    }

    fn probe(&mut self, id: TransferId) -> Result<bool, PartgridError> {
        let transfer = match self.pending.get(&id) {
            Some(t) => t,
            None => return Ok(true),
        };
        Ok(transfer.inbound.is_empty()
            && transfer.fanouts.iter().all(|f| f.sent)
            && transfer
                .outbound_peers
                .iter()
                .all(|lid| self.peers.get(lid).map(|p| p.outbound_drained()).unwrap_or(true)))
    }

    fn cleanup(&mut self, id: TransferId) -> Result<(), PartgridError> {
        self.pending.remove(&id);
        Ok(())
    }
}

impl P2pBackend {
    fn service_peer(&mut self, lid: i64, id: TransferId, new_mapping: &mut Mapping) -> Result<(), PartgridError> {
        let mut buf = [0u8; 4096];
        let mut read_bytes = Vec::new();
        if let Some(peer) = self.peers.get_mut(&lid) {
            if let Some(stream) = peer.stream_mut() {
                loop {
                    match stream.read(&mut buf) {
                        Ok(0) => break,
                        Ok(n) => read_bytes.extend_from_slice(&buf[..n]),
                        Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => break,
                        Err(source) => {
                            return Err(PartgridError::Transport(TransportError::Io {
                                context: format!("reading from lid {lid}"),
                                source,
                            }))
                        }
                    }
                }
            }
            if !read_bytes.is_empty() {
                peer.buffer_read(&read_bytes);
            }
        }

        loop {
            let line = match self.peers.get_mut(&lid).and_then(|p| p.take_line()) {
                Some(l) => l,
                None => break,
            };
            match Command::parse(&line) {
                Ok(Command::AllowSend { count, .. }) => {
                    if let Some(peer) = self.peers.get_mut(&lid) {
                        peer.grant_send_credit(count);
                        peer.try_flush()?;
                    }
                }
                Ok(Command::Data { index, hex, .. }) => {
                    let elem_size = new_mapping.elem_size();
                    let needs_window = self.peers.get(&lid).map(|p| !p.is_receiving()).unwrap_or(true);
                    if needs_window {
                        let next_entry = self
                            .pending
                            .get(&id)
                            .and_then(|t| t.inbound.iter().find(|r| r.from == lid).map(|r| (r.slice, r.reduce)));
                        match next_entry {
                            Some((slice, reduce)) => {
                                if let Some(peer) = self.peers.get_mut(&lid) {
                                    peer.begin_recv(slice, elem_size, reduce);
                                }
                            }
                            None => {
                                warn!(lid, "data element with no matching pending recv entry");
                                continue;
                            }
                        }
                    }

                    let bytes = match decode_hex(&hex) {
                        Ok(b) => b,
                        Err(e) => {
                            warn!(lid, error = %e, "dropping malformed data element");
                            continue;
                        }
                    };
                    let completed = match self.peers.get_mut(&lid) {
                        Some(peer) => peer.receive_element(index, bytes),
                        None => continue,
                    };
                    match completed {
                        Ok(Some(window)) => {
                            let fanout = self
                                .pending
                                .get_mut(&id)
                                .and_then(|t| {
                                    let pos = t.inbound.iter().position(|r| r.from == lid && r.slice == window.slice);
                                    pos.map(|i| t.inbound.remove(i))
                                })
                                .and_then(|entry| entry.fanout);

                            match window.reduce {
                                None => new_mapping.unpack(&window.slice, &window.buffer),
                                Some(op) => {
                                    if let Some(primitive) = new_mapping.primitive() {
                                        let mut current = new_mapping.pack(&window.slice);
                                        primitive.reduce(op, &mut current, &window.buffer, window.slice.len());
                                        new_mapping.unpack(&window.slice, &current);
                                    } else {
                                        new_mapping.unpack(&window.slice, &window.buffer);
                                    }
                                }
                            }

                            if let Some(idx) = fanout {
                                if let Some(transfer) = self.pending.get_mut(&id) {
                                    transfer.fanouts[idx].remaining = transfer.fanouts[idx].remaining.saturating_sub(1);
                                }
                                self.flush_ready_fanouts(id, new_mapping)?;
                            }
                        }
                        Ok(None) => {}
                        Err(e) => warn!(lid, error = %e, "dropping malformed data element"),
                    }
                }
                Ok(other) => debug!(lid, ?other, "unhandled p2p command"),
                Err(e) => warn!(lid, error = %e, "dropping malformed p2p line"),
            }
        }

        if let Some(peer) = self.peers.get_mut(&lid) {
            peer.try_flush()?;
        }
        Ok(())
    }
}
