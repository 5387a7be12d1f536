//! The wire protocol (spec.md §4.G.2): one ASCII line per command, the
//! verb set `register`/`id`/`myid`/`phase`/`allowsend`/`data`/`help`/
//! `status`/`quit`/`kill`, plus `resize`/`remove`/`done` for elastic
//! membership changes (§4.G.6).
//!
//! Grounded on `server/src/bin/server.rs`'s `match command.as_str()`
//! stdin command loop: one line in, one parsed command out, no partial
//! parsing state kept across lines.

use crate::error::PartgridError;

/// One parsed protocol line.
#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    /// `register <location> <host> <port>` — a not-yet-placed process
    /// announcing itself to the home process.
    Register { location: i64, host: String, port: u16 },
    /// `id <lid> <location> <host> <port>` — the home process assigning a
    /// location-ID to a registrant (and, broadcast, informing every member
    /// of a new peer's address).
    Id { lid: i64, location: i64, host: String, port: u16 },
    /// `myid <lid>` — telling a registrant its own assigned location-ID.
    MyId { lid: i64 },
    /// `phase <n>` — advancing the double-sweep schedule to phase `n`.
    Phase { phase: u64 },
    /// `allowsend <count> <elemsize>` — granting the peer permission to
    /// send `count` further elements of `elemsize` bytes each before the
    /// next grant (credit-based flow control).
    AllowSend { count: u64, elemsize: u64 },
    /// `data <bytelen> (<seq>:<index>) <hexbytes>` — one element's worth of
    /// payload, `bytelen` bytes encoded as ASCII hex, tagged with the
    /// sending transfer's sequence number and this element's lex-order
    /// traversal index within its slice.
    Data { bytelen: u64, seq: u64, index: i64, hex: String },
    /// `help` — request for the verb list.
    Help,
    /// `status` — request for a connection/credit summary.
    Status,
    /// `quit` — graceful disconnect of this connection only.
    Quit,
    /// `kill` — shut down the whole run.
    Kill,
    /// `resize <n>` — the group is growing to `n` members.
    Resize { size: usize },
    /// `remove <lid>` — the member at `lid` is leaving the group.
    Remove { lid: i64 },
    /// `done` — this process has finished draining its removal.
    Done,
}

impl Command {
    /// Parses one line (without its trailing newline). Unknown verbs and
    /// malformed argument lists are both `Protocol` errors; the caller
    /// (spec.md §4.G.4) logs and drops these rather than treating them as
    /// fatal, except where it has explicitly asked otherwise.
    pub fn parse(line: &str) -> Result<Self, PartgridError> {
        let mut parts = line.split_whitespace();
        let verb = parts.next().ok_or_else(|| PartgridError::protocol("empty line"))?;
        match verb {
            "register" => {
                let location = next_i64(&mut parts, "register")?;
                let host = next(&mut parts, "register")?.to_string();
                let port = next_u16(&mut parts, "register")?;
                Ok(Command::Register { location, host, port })
            }
            "id" => {
                let lid = next_i64(&mut parts, "id")?;
                let location = next_i64(&mut parts, "id")?;
                let host = next(&mut parts, "id")?.to_string();
                let port = next_u16(&mut parts, "id")?;
                Ok(Command::Id { lid, location, host, port })
            }
            "myid" => Ok(Command::MyId { lid: next_i64(&mut parts, "myid")? }),
            "phase" => Ok(Command::Phase { phase: next_u64(&mut parts, "phase")? }),
            "allowsend" => {
                let count = next_u64(&mut parts, "allowsend")?;
                let elemsize = next_u64(&mut parts, "allowsend")?;
                Ok(Command::AllowSend { count, elemsize })
            }
            "data" => {
                let bytelen = next_u64(&mut parts, "data")?;
                let tag = next(&mut parts, "data")?;
                let (seq, index) = parse_tag(tag)?;
                let hex = next(&mut parts, "data")?.to_string();
                Ok(Command::Data { bytelen, seq, index, hex })
            }
            "help" => Ok(Command::Help),
            "status" => Ok(Command::Status),
            "quit" => Ok(Command::Quit),
            "kill" => Ok(Command::Kill),
            "resize" => Ok(Command::Resize { size: next_u64(&mut parts, "resize")? as usize }),
            "remove" => Ok(Command::Remove { lid: next_i64(&mut parts, "remove")? }),
            "done" => Ok(Command::Done),
            other => Err(PartgridError::protocol(format!("unknown verb {other:?}"))),
        }
    }

    /// Formats this command back into its wire line (no trailing newline;
    /// the connection writer appends one).
    pub fn format(&self) -> String {
        match self {
            Command::Register { location, host, port } => format!("register {location} {host} {port}"),
            Command::Id { lid, location, host, port } => format!("id {lid} {location} {host} {port}"),
            Command::MyId { lid } => format!("myid {lid}"),
            Command::Phase { phase } => format!("phase {phase}"),
            Command::AllowSend { count, elemsize } => format!("allowsend {count} {elemsize}"),
            Command::Data { bytelen, seq, index, hex } => format!("data {bytelen} ({seq}:{index}) {hex}"),
            Command::Help => "help".to_string(),
            Command::Status => "status".to_string(),
            Command::Quit => "quit".to_string(),
            Command::Kill => "kill".to_string(),
            Command::Resize { size } => format!("resize {size}"),
            Command::Remove { lid } => format!("remove {lid}"),
            Command::Done => "done".to_string(),
        }
    }
}

fn next<'a>(parts: &mut impl Iterator<Item = &'a str>, verb: &str) -> Result<&'a str, PartgridError> {
    parts.next().ok_or_else(|| PartgridError::protocol(format!("{verb}: missing argument")))
}

fn next_u16<'a>(parts: &mut impl Iterator<Item = &'a str>, verb: &str) -> Result<u16, PartgridError> {
    next(parts, verb)?
        .parse()
        .map_err(|_| PartgridError::protocol(format!("{verb}: expected a port number")))
}

fn next_u64<'a>(parts: &mut impl Iterator<Item = &'a str>, verb: &str) -> Result<u64, PartgridError> {
    next(parts, verb)?
        .parse()
        .map_err(|_| PartgridError::protocol(format!("{verb}: expected an integer")))
}

fn next_i64<'a>(parts: &mut impl Iterator<Item = &'a str>, verb: &str) -> Result<i64, PartgridError> {
    next(parts, verb)?
        .parse()
        .map_err(|_| PartgridError::protocol(format!("{verb}: expected an integer")))
}

/// Splits a `(seq:index)` tag into its two integers.
fn parse_tag(tag: &str) -> Result<(u64, i64), PartgridError> {
    let inner = tag
        .strip_prefix('(')
        .and_then(|s| s.strip_suffix(')'))
        .ok_or_else(|| PartgridError::protocol(format!("data: malformed tag {tag:?}")))?;
    let (seq, index) = inner
        .split_once(':')
        .ok_or_else(|| PartgridError::protocol(format!("data: malformed tag {tag:?}")))?;
    let seq = seq.parse().map_err(|_| PartgridError::protocol(format!("data: bad seq {seq:?}")))?;
    let index = index.parse().map_err(|_| PartgridError::protocol(format!("data: bad index {index:?}")))?;
    Ok((seq, index))
}

/// Encodes `bytes` as lowercase ASCII hex, two characters per byte.
pub fn encode_hex(bytes: &[u8]) -> String {
    let mut out = String::with_capacity(bytes.len() * 2);
    for b in bytes {
        out.push_str(&format!("{b:02x}"));
    }
    out
}

/// Decodes a lowercase ASCII hex string back into bytes.
pub fn decode_hex(hex: &str) -> Result<Vec<u8>, PartgridError> {
    if hex.len() % 2 != 0 {
        return Err(PartgridError::protocol(format!("data: odd-length hex {hex:?}")));
    }
    (0..hex.len())
        .step_by(2)
        .map(|i| {
            u8::from_str_radix(&hex[i..i + 2], 16)
                .map_err(|_| PartgridError::protocol(format!("data: bad hex byte in {hex:?}")))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_every_verb() {
        let commands = vec![
            Command::Register { location: 0, host: "10.0.0.1".into(), port: 9000 },
            Command::Id { lid: 3, location: 0, host: "10.0.0.2".into(), port: 9001 },
            Command::MyId { lid: 3 },
            Command::Phase { phase: 7 },
            Command::AllowSend { count: 128, elemsize: 8 },
            Command::Data { bytelen: 8, seq: 1, index: 5, hex: "0011223344556677".into() },
            Command::Help,
            Command::Status,
            Command::Quit,
            Command::Kill,
            Command::Resize { size: 5 },
            Command::Remove { lid: 2 },
            Command::Done,
        ];
        for cmd in commands {
            let line = cmd.format();
            assert_eq!(Command::parse(&line).unwrap(), cmd);
        }
    }

    #[test]
    fn rejects_unknown_verb_and_missing_args() {
        assert!(Command::parse("frobnicate").is_err());
        assert!(Command::parse("register 0 10.0.0.1").is_err());
        assert!(Command::parse("").is_err());
    }

    #[test]
    fn hex_round_trips_arbitrary_bytes() {
        let bytes = [0u8, 1, 255, 128, 17];
        let hex = encode_hex(&bytes);
        assert_eq!(decode_hex(&hex).unwrap(), bytes);
    }

    #[test]
    fn rejects_malformed_tag() {
        assert!(Command::parse("data 8 5:1 0011223344556677").is_err());
        assert!(Command::parse("data 8 (5) 0011223344556677").is_err());
    }
}
