//! Command-line argument parsing for the Strata server.

use std::path::PathBuf;

use clap::Parser;

use crate::Config;

/// Strata server command-line arguments.
///
/// CLI values override settings loaded from `config.ron`.
#[derive(Parser, Debug, Default)]
#[command(name = "strata-server", about = "Strata voxel world server")]
pub struct CliArgs {
    /// Address to bind to.
    #[arg(long)]
    pub bind: Option<String>,

    /// Port to listen on.
    #[arg(long)]
    pub port: Option<u16>,

    /// World height in blocks (multiple of 16).
    #[arg(long)]
    pub height: Option<u32>,

    /// Default chunk loading distance in chunks.
    #[arg(long)]
    pub loading_distance: Option<u32>,

    /// World tick rate in Hz.
    #[arg(long)]
    pub tick_rate: Option<u32>,

    /// Log level (error, warn, info, debug, trace).
    #[arg(long)]
    pub log_level: Option<String>,

    /// Path to config directory (overrides default location).
    #[arg(long)]
    pub config: Option<PathBuf>,
}

impl Config {
    /// Overwrites every setting that was given on the command line.
    pub fn apply_cli_overrides(&mut self, args: &CliArgs) {
        let CliArgs {
            bind,
            port,
            height,
            loading_distance,
            tick_rate,
            log_level,
            config: _,
        } = args;
        if let Some(bind) = bind {
            self.network.bind_address.clone_from(bind);
        }
        if let Some(level) = log_level {
            self.debug.log_level.clone_from(level);
        }
        self.network.port = port.unwrap_or(self.network.port);
        self.world.height = height.unwrap_or(self.world.height);
        self.world.chunk_loading_distance =
            loading_distance.unwrap_or(self.world.chunk_loading_distance);
        self.world.tick_rate_hz = tick_rate.unwrap_or(self.world.tick_rate_hz);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::NetworkConfig;

    #[test]
    fn test_flags_override_file_values() {
        let args = CliArgs::parse_from([
            "strata-server",
            "--bind",
            "127.0.0.1",
            "--height",
            "128",
            "--loading-distance",
            "12",
        ]);
        let mut config = Config::default();
        config.apply_cli_overrides(&args);
        assert_eq!(config.network.bind_address, "127.0.0.1");
        assert_eq!(config.world.height, 128);
        assert_eq!(config.world.chunk_loading_distance, 12);
        assert_eq!(config.network.port, NetworkConfig::default().port);
    }

    #[test]
    fn test_no_flags_changes_nothing() {
        let mut config = Config::default();
        config.world.tick_rate_hz = 5;
        let before = config.clone();
        config.apply_cli_overrides(&CliArgs::parse_from(["strata-server"]));
        assert_eq!(config, before);
    }

    #[test]
    fn test_config_dir_flag_is_not_a_setting() {
        let args = CliArgs::parse_from([
            "strata-server",
            "--config",
            "/tmp/strata",
            "--log-level",
            "trace",
        ]);
        assert_eq!(args.config.as_deref(), Some(std::path::Path::new("/tmp/strata")));
        let mut config = Config::default();
        config.apply_cli_overrides(&args);
        assert_eq!(config.debug.log_level, "trace");
    }
}
