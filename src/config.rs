//! Boot configuration: a small `clap`-derived CLI, in the
//! style of `wormhole`'s `dctl` binary, selecting the bridge transport and
//! the logging/policy posture for this run.

use std::path::PathBuf;

use clap::Parser;

/// Transport the bridge listens on.
#[derive(Debug, Clone)]
pub enum Transport {
    /// `AF_VSOCK`, guest-side. Requires the `vsock` cargo feature.
    Vsock { port: u32 },
    /// A Unix domain socket path, for development and testing off a real VM.
    Unix { path: PathBuf },
}

#[derive(Parser, Debug)]
#[command(version, about = "Guest compute service: in-guest init agent for hosted containers", long_about = None)]
pub struct Config {
    /// vsock port to listen on. Mutually exclusive with `--socket-path`;
    /// requires the `vsock` feature.
    #[arg(long, value_name = "PORT")]
    pub vsock_port: Option<u32>,

    /// Unix domain socket path to listen on instead of vsock.
    #[arg(long, value_name = "PATH")]
    pub socket_path: Option<PathBuf>,

    /// Log level passed to `tracing_subscriber`'s `EnvFilter` when
    /// `RUST_LOG` is unset.
    #[arg(long, default_value = "info")]
    pub log_level: String,

    /// Refuse every mutating request until a security policy has been
    /// loaded via `ModifySettings`.
    #[arg(long)]
    pub require_policy: bool,

    /// Name or path of the OCI runtime binary container operations shell
    /// out to.
    #[arg(long, default_value = "runc")]
    pub runtime_binary: String,
}

impl Config {
    pub fn parse_args() -> Config {
        Config::parse()
    }

    /// Resolves the configured transport, preferring an explicit vsock port.
    pub fn transport(&self) -> Transport {
        match (&self.vsock_port, &self.socket_path) {
            (Some(port), _) => Transport::Vsock { port: *port },
            (None, Some(path)) => Transport::Unix { path: path.clone() },
            (None, None) => Transport::Unix { path: PathBuf::from("/run/gcs/gcs.sock") },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_config(vsock_port: Option<u32>, socket_path: Option<PathBuf>) -> Config {
        Config { vsock_port, socket_path, log_level: "info".into(), require_policy: false, runtime_binary: "runc".into() }
    }

    #[test]
    fn vsock_port_wins_over_socket_path() {
        let cfg = test_config(Some(1024), Some(PathBuf::from("/run/gcs/gcs.sock")));
        assert!(matches!(cfg.transport(), Transport::Vsock { port: 1024 }));
    }

    #[test]
    fn defaults_to_unix_socket_when_unset() {
        let cfg = test_config(None, None);
        match cfg.transport() {
            Transport::Unix { path } => assert_eq!(path, PathBuf::from("/run/gcs/gcs.sock")),
            _ => panic!("expected unix transport"),
        }
    }
}
