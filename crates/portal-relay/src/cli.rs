use std::path::PathBuf;

use clap::Parser;
use portal_config::{LogLevel, RelayConfig, StoreBackend};

/// Pairing and message relay between a desktop and its mobile companions.
#[derive(Parser, Debug)]
#[command(name = "portal-relay", version, about)]
pub struct Args {
    /// Config file path override.
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Port to listen on.
    #[arg(short, long)]
    pub port: Option<u16>,

    /// Interface to bind.
    #[arg(long)]
    pub bind: Option<String>,

    /// Directory for session records.
    #[arg(long)]
    pub data_dir: Option<PathBuf>,

    /// Keep sessions in memory only.
    #[arg(long)]
    pub in_memory: bool,

    /// Log level override (trace, debug, info, warn, error).
    #[arg(long)]
    pub log_level: Option<LogLevel>,

    /// Print the effective config as JSON and exit.
    #[arg(long)]
    pub print_config: bool,
}

impl Args {
    /// Flags win over file values.
    pub fn apply(&self, config: &mut RelayConfig) {
        if let Some(port) = self.port {
            config.server.port = port;
        }
        if let Some(bind) = &self.bind {
            config.server.bind = bind.clone();
        }
        if let Some(dir) = &self.data_dir {
            config.store.data_dir = dir.display().to_string();
        }
        if self.in_memory {
            config.store.backend = StoreBackend::Memory;
        }
        if let Some(level) = self.log_level {
            config.logging.level = level;
        }
    }
}

pub fn parse() -> Args {
    Args::parse()
}

/// Filter directive for this binary's crates at `level`.
pub fn log_directive(level: LogLevel) -> String {
    let level = level.as_str();
    format!("portal_relay={level},portal_config={level}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flags_override_config() {
        let args = Args::parse_from([
            "portal-relay",
            "--port",
            "9000",
            "--bind",
            "127.0.0.1",
            "--in-memory",
            "--log-level",
            "debug",
        ]);
        let mut config = RelayConfig::default();
        args.apply(&mut config);

        assert_eq!(config.server.port, 9000);
        assert_eq!(config.server.bind, "127.0.0.1");
        assert_eq!(config.store.backend, StoreBackend::Memory);
        assert_eq!(config.logging.level, LogLevel::Debug);
    }

    #[test]
    fn no_flags_leave_config_alone() {
        let args = Args::parse_from(["portal-relay"]);
        let mut config = RelayConfig::default();
        args.apply(&mut config);
        assert_eq!(config.server.port, 8787);
        assert_eq!(config.store.backend, StoreBackend::File);
    }

    #[test]
    fn log_directive_covers_both_crates() {
        let directive = log_directive(LogLevel::Debug);
        assert_eq!(directive, "portal_relay=debug,portal_config=debug");
        assert!(tracing_subscriber::EnvFilter::try_new(&directive).is_ok());
    }

    #[test]
    fn bad_log_level_is_rejected() {
        assert!(Args::try_parse_from(["portal-relay", "--log-level", "loud"]).is_err());
    }
}
