//! Process bootstrap configuration (spec.md §6, §9.3; SPEC_FULL.md §2.3):
//! the external inputs every `partgrid` process needs before it can join a
//! `Group` — home address, world size, which backend to run, and a couple
//! of tuning knobs — gathered from `PARTGRID_*` environment variables and
//! overridden by `getopts`-parsed CLI flags.
//!
//! Grounded on the teacher's own `default = ["timely/getopts"]` feature:
//! the teacher already opts a worker's bootstrap into `getopts`-based
//! argument parsing, generalized here to this crate's own process
//! bootstrap instead of timely's `-w`/`-n`/`-h` worker flags.

use std::env;
use std::time::Duration;

use getopts::Options;

use crate::error::PartgridError;

/// Which backend a bootstrapped process should run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendKind {
    /// The double-sweep backend over an in-process `Collective`.
    Collective,
    /// The socket-based point-to-point backend.
    P2p,
}

impl BackendKind {
    fn parse(s: &str) -> Result<Self, PartgridError> {
        match s {
            "collective" => Ok(BackendKind::Collective),
            "p2p" => Ok(BackendKind::P2p),
            other => Err(PartgridError::config(format!("unknown backend {other:?}, expected collective or p2p"))),
        }
    }
}

/// Bootstrap configuration for one process. `from_args` layers defaults,
/// then `PARTGRID_*` environment variables, then CLI flags, in that
/// increasing order of precedence.
#[derive(Debug, Clone)]
pub struct Config {
    /// Address of the home process other processes rendezvous through.
    pub home_host: String,
    /// Port of the home process.
    pub home_port: u16,
    /// This process's own listen host (for the p2p backend and for
    /// rendezvous registration).
    pub my_host: String,
    /// This process's own listen port.
    pub my_port: u16,
    /// Total number of processes expected to join the group.
    pub world_size: usize,
    /// Which backend this process runs.
    pub backend: BackendKind,
    /// Per-connection line buffer size, in bytes, for the p2p backend.
    pub recv_buffer_bytes: usize,
    /// If set, this rank blocks at bootstrap until a debugger attaches
    /// (spec.md §6's "optional debug-rank pause").
    pub debug_rank: Option<usize>,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            home_host: "localhost".to_string(),
            home_port: 7777,
            my_host: "localhost".to_string(),
            my_port: 7777,
            world_size: 1,
            backend: BackendKind::Collective,
            recv_buffer_bytes: crate::backend::p2p::peer::LINE_BUFFER_BYTES,
            debug_rank: None,
        }
    }
}

impl Config {
    /// Parses `args` (typically `std::env::args().skip(1)`) over a base of
    /// defaults overridden by `PARTGRID_*` environment variables.
    pub fn from_args(args: &[String]) -> Result<Self, PartgridError> {
        let mut config = Config::default();
        config.apply_env()?;

        let mut opts = Options::new();
        opts.optopt("", "home-host", "home process address", "HOST");
        opts.optopt("", "home-port", "home process port", "PORT");
        opts.optopt("", "my-host", "this process's own address", "HOST");
        opts.optopt("", "my-port", "this process's own port", "PORT");
        opts.optopt("", "world-size", "number of processes in the group", "N");
        opts.optopt("", "backend", "collective or p2p", "BACKEND");
        opts.optopt("", "recv-buffer-bytes", "p2p per-connection line buffer size", "BYTES");
        opts.optopt("", "debug-rank", "rank to pause at bootstrap for debugger attach", "RANK");

        let matches = opts
            .parse(args)
            .map_err(|e| PartgridError::config(format!("invalid command-line arguments: {e}")))?;

        if let Some(v) = matches.opt_str("home-host") {
            config.home_host = v;
        }
        if let Some(v) = matches.opt_str("home-port") {
            config.home_port = parse_u16(&v, "--home-port")?;
        }
        if let Some(v) = matches.opt_str("my-host") {
            config.my_host = v;
        }
        if let Some(v) = matches.opt_str("my-port") {
            config.my_port = parse_u16(&v, "--my-port")?;
        }
        if let Some(v) = matches.opt_str("world-size") {
            config.world_size = parse_usize(&v, "--world-size")?;
        }
        if let Some(v) = matches.opt_str("backend") {
            config.backend = BackendKind::parse(&v)?;
        }
        if let Some(v) = matches.opt_str("recv-buffer-bytes") {
            config.recv_buffer_bytes = parse_usize(&v, "--recv-buffer-bytes")?;
        }
        if let Some(v) = matches.opt_str("debug-rank") {
            config.debug_rank = Some(parse_usize(&v, "--debug-rank")?);
        }

        Ok(config)
    }

    fn apply_env(&mut self) -> Result<(), PartgridError> {
        if let Ok(v) = env::var("PARTGRID_HOME_HOST") {
            self.home_host = v;
        }
        if let Ok(v) = env::var("PARTGRID_HOME_PORT") {
            self.home_port = parse_u16(&v, "PARTGRID_HOME_PORT")?;
        }
        if let Ok(v) = env::var("PARTGRID_MY_HOST") {
            self.my_host = v;
        }
        if let Ok(v) = env::var("PARTGRID_MY_PORT") {
            self.my_port = parse_u16(&v, "PARTGRID_MY_PORT")?;
        }
        if let Ok(v) = env::var("PARTGRID_WORLD_SIZE") {
            self.world_size = parse_usize(&v, "PARTGRID_WORLD_SIZE")?;
        }
        if let Ok(v) = env::var("PARTGRID_BACKEND") {
            self.backend = BackendKind::parse(&v)?;
        }
        if let Ok(v) = env::var("PARTGRID_RECV_BUFFER_BYTES") {
            self.recv_buffer_bytes = parse_usize(&v, "PARTGRID_RECV_BUFFER_BYTES")?;
        }
        if let Ok(v) = env::var("PARTGRID_DEBUG_RANK") {
            self.debug_rank = Some(parse_usize(&v, "PARTGRID_DEBUG_RANK")?);
        }
        Ok(())
    }

    /// If `debug_rank` names `rank`, blocks until a debugger attaches
    /// (polling `/proc/self/status` for a non-zero `TracerPid` on Linux) or
    /// until a fixed fallback timeout elsewhere.
    pub fn maybe_pause_for_debugger(&self, rank: usize) {
        if self.debug_rank != Some(rank) {
            return;
        }
        tracing::info!(rank, "paused for debugger attach");
        #[cfg(target_os = "linux")]
        {
            loop {
                if tracer_pid_is_set() {
                    break;
                }
                std::thread::sleep(Duration::from_millis(100));
            }
        }
        #[cfg(not(target_os = "linux"))]
        {
            std::thread::sleep(Duration::from_secs(5));
        }
    }
}

#[cfg(target_os = "linux")]
fn tracer_pid_is_set() -> bool {
    std::fs::read_to_string("/proc/self/status")
        .ok()
        .and_then(|status| {
            status
                .lines()
                .find_map(|line| line.strip_prefix("TracerPid:"))
                .map(|v| v.trim())
                .map(|v| v != "0")
        })
        .unwrap_or(false)
}

fn parse_u16(value: &str, name: &str) -> Result<u16, PartgridError> {
    value.parse().map_err(|_| PartgridError::config(format!("{name}: expected a port number, got {value:?}")))
}

fn parse_usize(value: &str, name: &str) -> Result<usize, PartgridError> {
    value.parse().map_err(|_| PartgridError::config(format!("{name}: expected an integer, got {value:?}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        let config = Config::default();
        assert_eq!(config.world_size, 1);
        assert_eq!(config.backend, BackendKind::Collective);
    }

    #[test]
    fn cli_overrides_default() {
        let args = vec!["--world-size".to_string(), "4".to_string(), "--backend".to_string(), "p2p".to_string()];
        let config = Config::from_args(&args).unwrap();
        assert_eq!(config.world_size, 4);
        assert_eq!(config.backend, BackendKind::P2p);
    }

    #[test]
    fn rejects_unknown_backend() {
        let args = vec!["--backend".to_string(), "carrier-pigeon".to_string()];
        assert!(Config::from_args(&args).is_err());
    }
}
