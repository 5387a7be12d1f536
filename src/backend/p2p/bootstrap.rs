//! The home-process rendezvous protocol (spec.md §4.G.1): how a set of
//! independently-launched processes, each knowing only the home process's
//! address and the intended world size, discover each other's addresses,
//! agree on location-IDs, and later renegotiate membership (§4.G.6).
//!
//! Grounded on `server/src/bin/server.rs`'s plain blocking `TcpListener`
//! accept loop: rendezvous happens once, at startup (and again, briefly,
//! at each resize boundary), well before the steady-state data-exchange
//! loop where a readiness poller (`event_loop`) actually earns its keep.

use std::collections::HashSet;
use std::io::{BufRead, BufReader, Write};
use std::net::{TcpListener, TcpStream};

use tracing::info;

use crate::error::{PartgridError, TransportError};
use crate::group::{Group, Location};
use crate::logging;

use super::protocol::Command;

fn io_err(context: impl Into<String>) -> impl FnOnce(std::io::Error) -> PartgridError {
    let context = context.into();
    move |source| PartgridError::Transport(TransportError::Io { context, source })
}

fn write_line(stream: &mut TcpStream, command: &Command) -> Result<(), PartgridError> {
    writeln!(stream, "{}", command.format()).map_err(io_err("writing rendezvous line"))
}

fn read_line(reader: &mut BufReader<TcpStream>) -> Result<Command, PartgridError> {
    let mut line = String::new();
    let n = reader.read_line(&mut line).map_err(io_err("reading rendezvous line"))?;
    if n == 0 {
        return Err(PartgridError::Transport(TransportError::PeerGone { lid: -1 }));
    }
    Command::parse(line.trim_end())
}

/// The outcome of racing for the home role (spec.md §4.G.1 step 1): the
/// process that wins binds the well-known rendezvous port and becomes
/// home; every other process instead needs an OS-chosen port of its own
/// before registering as a peer.
pub enum HomeElection {
    /// This process won the race; `listener` is already bound and
    /// listening on the configured home port.
    Home(TcpListener),
    /// This process lost the race. `chosen_port` is free at the moment of
    /// the call (the probing listener used to find it has already been
    /// dropped), and should be bound for real by this process's own
    /// `P2pBackend` listener before anything else can take it.
    Peer { chosen_port: u16 },
}

/// Attempts to bind `home_host`/`home_port`. Success wins the home role
/// outright; any failure — the port is already taken by whichever process
/// got there first — loses it, in which case an OS-chosen port is probed
/// and handed back for this process's own listening socket.
pub fn elect_home(home_host: &str, home_port: u16) -> Result<HomeElection, PartgridError> {
    match TcpListener::bind((home_host, home_port)) {
        Ok(listener) => Ok(HomeElection::Home(listener)),
        Err(_) => {
            let probe = TcpListener::bind((home_host, 0)).map_err(io_err("binding fallback listener"))?;
            let chosen_port = probe.local_addr().map_err(io_err("reading fallback listener port"))?.port();
            drop(probe);
            Ok(HomeElection::Peer { chosen_port })
        }
    }
}

/// Live state the home process keeps around after initial rendezvous so it
/// can later run a resize (spec.md §4.G.6): the still-open listener (for
/// late registrants), one still-open stream per non-home member, and the
/// address/location-id table broadcast so far, both indexed by lid (index
/// 0 is home itself and has no stream).
pub struct HomeSession {
    listener: TcpListener,
    streams: Vec<TcpStream>,
    locations: Vec<Location>,
    location_ids: Vec<i64>,
    group: Group,
}

impl HomeSession {
    /// Runs the initial rendezvous as home (rank 0): binds
    /// `listen_host`/`listen_port`, accepts `world_size - 1` registrations,
    /// assigns location-IDs in arrival order starting from 1, broadcasts
    /// the complete address table to every registrant, and finally sends
    /// `phase 0` — the signal that bootstrap is complete and steady-state
    /// phase advancement can begin.
    pub fn bootstrap(listen_host: &str, listen_port: u16, world_size: usize, location: i64) -> Result<Self, PartgridError> {
        let listener = TcpListener::bind((listen_host, listen_port))
            .map_err(io_err(format!("binding home listener on {listen_host}:{listen_port}")))?;
        Self::bootstrap_on(listener, listen_host, listen_port, world_size, location)
    }

    /// As `bootstrap`, but over a listener this process has already won
    /// via `elect_home` rather than binding one fresh.
    pub fn bootstrap_on(
        listener: TcpListener,
        listen_host: &str,
        listen_port: u16,
        world_size: usize,
        location: i64,
    ) -> Result<Self, PartgridError> {
        let mut locations = vec![Location::new(listen_host, listen_port)];
        let mut location_ids = vec![location];
        let mut streams: Vec<TcpStream> = Vec::new();

        while locations.len() < world_size {
            let (stream, _addr) = listener.accept().map_err(io_err("accepting registrant"))?;
            let mut reader = BufReader::new(stream.try_clone().map_err(io_err("cloning registrant socket"))?);
            match read_line(&mut reader)? {
                Command::Register { location, host, port } => {
                    info!(lid = locations.len() as i64, %host, port, "peer registered");
                    locations.push(Location::new(host, port));
                    location_ids.push(location);
                    streams.push(stream);
                }
                other => return Err(PartgridError::protocol(format!("expected register, got {other:?}"))),
            }
        }

        for stream in streams.iter_mut() {
            for (peer_lid, loc) in locations.iter().enumerate() {
                write_line(
                    stream,
                    &Command::Id {
                        lid: peer_lid as i64,
                        location: location_ids[peer_lid],
                        host: loc.host().to_string(),
                        port: loc.port(),
                    },
                )?;
            }
        }
        for stream in streams.iter_mut() {
            write_line(stream, &Command::Phase { phase: 0 })?;
        }

        let group = Group::new(locations.clone(), Some(0))?;
        logging::bootstrap(&group);
        Ok(HomeSession { listener, streams, locations, location_ids, group })
    }

    /// This process's current view of the group.
    pub fn group(&self) -> &Group { &self.group }

    /// Runs one resize round (spec.md §4.G.6): drains any registrations
    /// that arrived since the last rendezvous, assigns them the next lids,
    /// broadcasts the updated table plus a `remove` line for every lid in
    /// `removed`, and a final `done`. Returns the resulting `Group`,
    /// derived from the current one via `Group::derive_shrink` so removed
    /// members leave no gap in rank numbering.
    pub fn resize(&mut self, removed: &[i64]) -> Result<Group, PartgridError> {
        self.listener.set_nonblocking(true).map_err(io_err("setting home listener nonblocking"))?;
        loop {
            match self.listener.accept() {
                Ok((stream, _addr)) => {
                    stream.set_nonblocking(false).map_err(io_err("clearing nonblocking on registrant socket"))?;
                    let mut reader = BufReader::new(stream.try_clone().map_err(io_err("cloning registrant socket"))?);
                    match read_line(&mut reader)? {
                        Command::Register { location, host, port } => {
                            let lid = self.locations.len() as i64;
                            info!(lid, %host, port, "peer registered during resize");
                            self.locations.push(Location::new(host, port));
                            self.location_ids.push(location);
                            self.streams.push(stream);
                        }
                        other => return Err(PartgridError::protocol(format!("expected register, got {other:?}"))),
                    }
                }
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => break,
                Err(source) => {
                    self.listener.set_nonblocking(false).ok();
                    return Err(PartgridError::Transport(TransportError::Io {
                        context: "accepting resize registrant".into(),
                        source,
                    }));
                }
            }
        }
        self.listener.set_nonblocking(false).map_err(io_err("restoring home listener blocking mode"))?;

        for stream in self.streams.iter_mut() {
            for (peer_lid, loc) in self.locations.iter().enumerate() {
                write_line(
                    stream,
                    &Command::Id {
                        lid: peer_lid as i64,
                        location: self.location_ids[peer_lid],
                        host: loc.host().to_string(),
                        port: loc.port(),
                    },
                )?;
            }
            for &lid in removed {
                write_line(stream, &Command::Remove { lid })?;
            }
            write_line(stream, &Command::Done)?;
        }

        let old_size = self.group.size();
        let next = derive_resized_group(&self.group, &self.locations, removed)?;
        logging::resize(old_size, &next);

        let removed_set: HashSet<i64> = removed.iter().copied().collect();
        let mut kept_streams = Vec::with_capacity(self.streams.len());
        let mut kept_locations = vec![self.locations[0].clone()];
        let mut kept_location_ids = vec![self.location_ids[0]];
        for (index, stream) in self.streams.drain(..).enumerate() {
            let lid = (index + 1) as i64;
            if removed_set.contains(&lid) {
                continue;
            }
            kept_streams.push(stream);
            kept_locations.push(self.locations[lid as usize].clone());
            kept_location_ids.push(self.location_ids[lid as usize]);
        }
        self.streams = kept_streams;
        self.locations = kept_locations;
        self.location_ids = kept_location_ids;
        self.group = next.clone();
        Ok(next)
    }
}

/// Runs rendezvous as the home process (rank 0), with no provision for a
/// later resize. Equivalent to
/// `HomeSession::bootstrap(..).map(|s| s.group().clone())`; kept as the
/// simple entry point most callers (and the test suite) want.
pub fn run_home(listen_host: &str, listen_port: u16, world_size: usize, location: i64) -> Result<Group, PartgridError> {
    Ok(HomeSession::bootstrap(listen_host, listen_port, world_size, location)?.group().clone())
}

/// Runs rendezvous as a non-home process, keeping the rendezvous
/// connection open afterward so a later `resize_peer` call can reuse it.
pub fn run_peer_session(
    home_host: &str,
    home_port: u16,
    my_host: &str,
    my_port: u16,
    world_size: usize,
    location: i64,
) -> Result<(Group, TcpStream), PartgridError> {
    let stream = TcpStream::connect((home_host, home_port))
        .map_err(io_err(format!("connecting to home at {home_host}:{home_port}")))?;
    let mut writer = stream.try_clone().map_err(io_err("cloning home socket"))?;
    write_line(&mut writer, &Command::Register { location, host: my_host.to_string(), port: my_port })?;

    let mut reader = BufReader::new(stream.try_clone().map_err(io_err("cloning home socket"))?);
    let mut locations: Vec<Option<Location>> = (0..world_size).map(|_| None).collect();
    let mut myid = None;

    loop {
        match read_line(&mut reader)? {
            Command::Id { lid, host, port, .. } => {
                let index = usize::try_from(lid).map_err(|_| PartgridError::protocol(format!("negative lid {lid}")))?;
                if index >= world_size {
                    return Err(PartgridError::protocol(format!("lid {lid} exceeds world size {world_size}")));
                }
                locations[index] = Some(Location::new(host, port));
            }
            Command::MyId { lid } => {
                myid = Some(usize::try_from(lid).map_err(|_| PartgridError::protocol(format!("negative lid {lid}")))?);
            }
            Command::Phase { phase: 0 } => break,
            other => return Err(PartgridError::protocol(format!("unexpected rendezvous line {other:?}"))),
        }
    }

    let locations = locations
        .into_iter()
        .enumerate()
        .map(|(lid, loc)| loc.ok_or_else(|| PartgridError::protocol(format!("home never sent lid {lid}"))))
        .collect::<Result<Vec<_>, _>>()?;

    let group = Group::new(locations, myid)?;
    logging::bootstrap(&group);
    Ok((group, stream))
}

/// Runs rendezvous as a non-home process: connects to `home_host`/
/// `home_port`, announces `my_host`/`my_port`, and reads back the address
/// table broadcast by the home process.
pub fn run_peer(
    home_host: &str,
    home_port: u16,
    my_host: &str,
    my_port: u16,
    world_size: usize,
    location: i64,
) -> Result<Group, PartgridError> {
    Ok(run_peer_session(home_host, home_port, my_host, my_port, world_size, location)?.0)
}

/// Requests a resize from the home process over `stream` (the still-open
/// connection `run_peer_session` returned): sends `resize` (the requested
/// size is advisory — spec.md leaves the exact negotiation ordering
/// underspecified, so the actual resulting membership is whatever the
/// home's reply names), then reads the reply — a full `id` table, zero or
/// more `remove` lines, and a final `done` — deriving the resulting
/// `Group` from `parent` the same way `HomeSession::resize` does.
pub fn resize_peer(stream: &mut TcpStream, parent: &Group, requested_size: usize) -> Result<Group, PartgridError> {
    let mut writer = stream.try_clone().map_err(io_err("cloning rendezvous socket for resize"))?;
    write_line(&mut writer, &Command::Resize { size: requested_size })?;

    let mut reader = BufReader::new(stream.try_clone().map_err(io_err("cloning rendezvous socket for resize"))?);
    let mut locations: Vec<Location> = Vec::new();
    let mut removed: Vec<i64> = Vec::new();

    loop {
        match read_line(&mut reader)? {
            Command::Id { lid, host, port, .. } => {
                let index = usize::try_from(lid).map_err(|_| PartgridError::protocol(format!("negative lid {lid}")))?;
                if index >= locations.len() {
                    locations.resize(index + 1, Location::new("", 0));
                }
                locations[index] = Location::new(host, port);
            }
            Command::Remove { lid } => removed.push(lid),
            Command::Done => break,
            other => return Err(PartgridError::protocol(format!("unexpected resize reply {other:?}"))),
        }
    }

    let next = derive_resized_group(parent, &locations, &removed)?;
    logging::resize(parent.size(), &next);
    Ok(next)
}

/// Shared by `HomeSession::resize` and `resize_peer`: both sides observe
/// the same lid-indexed address table and removal list, so both derive
/// the same child `Group` from the same parent — surviving parent ranks
/// keep their relative order (via `Group::derive_shrink`), and any lids
/// beyond the parent's old size are freshly-registered members appended
/// at the end, in lid order.
fn derive_resized_group(parent: &Group, full_table: &[Location], removed: &[i64]) -> Result<Group, PartgridError> {
    let removed_set: HashSet<i64> = removed.iter().copied().collect();
    let old_size = parent.size();
    let mut from_parent: Vec<Option<usize>> = Vec::with_capacity(old_size);
    let mut next_rank = 0usize;
    for old_rank in 0..old_size {
        if removed_set.contains(&(old_rank as i64)) {
            from_parent.push(None);
        } else {
            from_parent.push(Some(next_rank));
            next_rank += 1;
        }
    }
    let survivors = parent.derive_shrink(&from_parent)?;
    let mut locations = survivors.locations().to_vec();
    if full_table.len() > old_size {
        locations.extend_from_slice(&full_table[old_size..]);
    }
    let myid = survivors.myid().map(|id| id as usize);
    Group::new(locations, myid)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn two_process_rendezvous_agrees_on_group() {
        // Bind the home listener on an ephemeral port up front so the peer
        // thread has a real port to dial.
        let listener = TcpListener::bind(("127.0.0.1", 0)).unwrap();
        let home_port = listener.local_addr().unwrap().port();
        drop(listener);

        let home = thread::spawn(move || run_home("127.0.0.1", home_port, 2, 0).unwrap());
        // Give the home listener a moment to bind before the peer dials.
        thread::sleep(std::time::Duration::from_millis(50));
        let peer = thread::spawn(move || run_peer("127.0.0.1", home_port, "127.0.0.1", 9999, 2, 1).unwrap());

        let home_group = home.join().unwrap();
        let peer_group = peer.join().unwrap();

        assert_eq!(home_group.size(), 2);
        assert_eq!(home_group.myid(), Some(0));
        assert_eq!(peer_group.myid(), Some(1));
        assert_eq!(home_group.location(1).unwrap().port(), 9999);
        assert_eq!(peer_group.location(0).unwrap().port(), home_port);
    }

    #[test]
    fn bind_race_elects_exactly_one_home() {
        let listener = TcpListener::bind(("127.0.0.1", 0)).unwrap();
        let home_port = listener.local_addr().unwrap().port();
        drop(listener);

        match elect_home("127.0.0.1", home_port).unwrap() {
            HomeElection::Home(_) => {}
            HomeElection::Peer { .. } => panic!("expected to win an uncontested race"),
        }

        let _winner = TcpListener::bind(("127.0.0.1", home_port)).unwrap();
        match elect_home("127.0.0.1", home_port).unwrap() {
            HomeElection::Peer { chosen_port } => assert_ne!(chosen_port, home_port),
            HomeElection::Home(_) => panic!("expected to lose a contested race"),
        }
    }

    #[test]
    fn resize_drops_a_member_without_leaving_a_gap() {
        let listener = TcpListener::bind(("127.0.0.1", 0)).unwrap();
        let home_port = listener.local_addr().unwrap().port();
        drop(listener);

        let home = thread::spawn(move || {
            let mut session = HomeSession::bootstrap("127.0.0.1", home_port, 3, 0).unwrap();
            // Rank 1 is leaving.
            let resized = session.resize(&[1]).unwrap();
            (session.group().clone(), resized)
        });
        thread::sleep(std::time::Duration::from_millis(50));
        let peer1 = thread::spawn(move || run_peer("127.0.0.1", home_port, "127.0.0.1", 9001, 3, 1).unwrap());
        thread::sleep(std::time::Duration::from_millis(20));
        let peer2 = thread::spawn(move || run_peer("127.0.0.1", home_port, "127.0.0.1", 9002, 3, 2).unwrap());

        let _peer1_group = peer1.join().unwrap();
        let _peer2_group = peer2.join().unwrap();
        let (original_home_group, resized_home_group) = home.join().unwrap();

        assert_eq!(original_home_group.size(), 3);
        assert_eq!(resized_home_group.size(), 2);
        // Rank 2 shifts down to rank 1 once rank 1 is removed.
        assert_eq!(resized_home_group.location(1).unwrap().port(), 9002);
    }

    #[test]
    fn resize_peer_applies_an_id_and_remove_reply() {
        let listener = TcpListener::bind(("127.0.0.1", 0)).unwrap();
        let fake_home_port = listener.local_addr().unwrap().port();

        let fake_home = thread::spawn(move || {
            let (stream, _addr) = listener.accept().unwrap();
            let mut reader = BufReader::new(stream.try_clone().unwrap());
            match read_line(&mut reader).unwrap() {
                Command::Resize { .. } => {}
                other => panic!("expected a resize request, got {other:?}"),
            }
            let mut writer = stream;
            // New member at lid 2, and lid 1 is leaving.
            write_line(&mut writer, &Command::Id { lid: 0, location: 0, host: "127.0.0.1".into(), port: fake_home_port }).unwrap();
            write_line(&mut writer, &Command::Id { lid: 2, location: 2, host: "127.0.0.1".into(), port: 9100 }).unwrap();
            write_line(&mut writer, &Command::Remove { lid: 1 }).unwrap();
            write_line(&mut writer, &Command::Done).unwrap();
        });

        let mut stream = TcpStream::connect(("127.0.0.1", fake_home_port)).unwrap();
        let parent = Group::new(
            vec![Location::new("127.0.0.1", fake_home_port), Location::new("127.0.0.1", 9001)],
            Some(1),
        )
        .unwrap();

        let resized = resize_peer(&mut stream, &parent, 2).unwrap();
        fake_home.join().unwrap();

        assert_eq!(resized.size(), 2);
        assert_eq!(resized.myid(), None, "rank 1 was removed, so it is no longer a member");
        assert_eq!(resized.location(1).unwrap().port(), 9100);
    }
}
