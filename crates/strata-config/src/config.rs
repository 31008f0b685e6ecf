//! Configuration structs with sensible defaults and RON persistence.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// Height of one chunk section in blocks. World heights must be a multiple of it.
const SECTION_HEIGHT: u32 = 16;

/// Top-level server configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct Config {
    /// World simulation settings.
    pub world: WorldConfig,
    /// Mesh rebuild pipeline settings.
    pub mesh: MeshConfig,
    /// Network settings.
    pub network: NetworkConfig,
    /// Debug/development settings.
    pub debug: DebugConfig,
}

/// World simulation configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct WorldConfig {
    /// World height in blocks (multiple of 16).
    pub height: u32,
    /// World tick rate in Hz.
    pub tick_rate_hz: u32,
    /// Default chunk loading distance, in chunks.
    pub chunk_loading_distance: u32,
    /// Largest loading distance a client may request.
    pub max_chunk_loading_distance: u32,
    /// Extra chunks beyond the loading distance before a chunk is unloaded.
    pub unload_hysteresis: u32,
    /// Maximum chunk creation requests issued per tick.
    pub creates_per_tick: u32,
    /// Worker threads producing new chunks.
    pub creator_threads: usize,
}

/// Mesh rebuild pipeline configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct MeshConfig {
    /// Worker threads for section meshing (0 = one per CPU).
    pub worker_threads: usize,
}

/// Network configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct NetworkConfig {
    /// Address the server binds to.
    pub bind_address: String,
    /// Server port.
    pub port: u16,
    /// Maximum concurrent connections.
    pub max_connections: usize,
    /// Maximum frame payload in bytes.
    pub max_frame_size: u32,
    /// Payloads at least this large are LZ4-compressed.
    pub compression_threshold: usize,
}

/// Debug/development configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct DebugConfig {
    /// Log level override (e.g., "debug", "info", "warn").
    pub log_level: String,
    /// Also write JSON logs to the log directory.
    pub log_to_file: bool,
}

impl Default for WorldConfig {
    fn default() -> Self {
        Self {
            height: 256,
            tick_rate_hz: 20,
            chunk_loading_distance: 8,
            max_chunk_loading_distance: 32,
            unload_hysteresis: 2,
            creates_per_tick: 8,
            creator_threads: 2,
        }
    }
}

impl Default for MeshConfig {
    fn default() -> Self {
        Self { worker_threads: 0 }
    }
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            bind_address: "0.0.0.0".to_string(),
            port: 25600,
            max_connections: 64,
            max_frame_size: 4 * 1_048_576,
            compression_threshold: 256,
        }
    }
}

impl Default for DebugConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            log_to_file: false,
        }
    }
}

/// Name of the config file inside the config directory.
pub const CONFIG_FILE: &str = "config.ron";

/// Default directory holding [`CONFIG_FILE`]: `<platform config dir>/strata`.
///
/// Falls back to the working directory when the platform has no config dir.
pub fn default_config_dir() -> PathBuf {
    dirs::config_dir()
        .map(|d| d.join("strata"))
        .unwrap_or_else(|| PathBuf::from("."))
}

fn read_config(path: &Path) -> Result<Config, ConfigError> {
    let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    ron::from_str(&text).map_err(|source| ConfigError::Parse {
        path: path.to_path_buf(),
        source,
    })
}

impl Config {
    /// Reads `config.ron` from `config_dir`. A missing file is replaced by
    /// the defaults, which are written back so the operator has something to
    /// edit.
    pub fn load_or_create(config_dir: &Path) -> Result<Self, ConfigError> {
        let path = config_dir.join(CONFIG_FILE);
        if !path.exists() {
            let config = Config::default();
            config.save(config_dir)?;
            log::info!("Wrote default config to {}", path.display());
            return Ok(config);
        }
        let config = read_config(&path)?;
        log::info!("Loaded config from {}", path.display());
        Ok(config)
    }

    pub fn save(&self, config_dir: &Path) -> Result<(), ConfigError> {
        let path = config_dir.join(CONFIG_FILE);
        let write_err = |source| ConfigError::Write {
            path: path.clone(),
            source,
        };
        std::fs::create_dir_all(config_dir).map_err(write_err)?;
        let text = ron::ser::to_string_pretty(
            self,
            ron::ser::PrettyConfig::new().depth_limit(2).struct_names(false),
        )?;
        std::fs::write(&path, text).map_err(write_err)
    }

    /// Re-reads the file. Returns the new config only when it differs from `self`.
    pub fn reload(&self, config_dir: &Path) -> Result<Option<Self>, ConfigError> {
        let fresh = read_config(&config_dir.join(CONFIG_FILE))?;
        if fresh == *self {
            return Ok(None);
        }
        log::info!("Config file changed on disk");
        Ok(Some(fresh))
    }

    /// Checks the values the world cannot run without.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let world = &self.world;
        if world.height == 0 || world.height % SECTION_HEIGHT != 0 {
            return Err(ConfigError::Invalid {
                field: "world.height",
                reason: format!("{} is not a positive multiple of {SECTION_HEIGHT}", world.height),
            });
        }
        if world.tick_rate_hz == 0 {
            return Err(ConfigError::Invalid {
                field: "world.tick_rate_hz",
                reason: "must be at least 1".to_string(),
            });
        }
        if world.chunk_loading_distance > world.max_chunk_loading_distance {
            return Err(ConfigError::Invalid {
                field: "world.chunk_loading_distance",
                reason: format!(
                    "{} exceeds max_chunk_loading_distance {}",
                    world.chunk_loading_distance, world.max_chunk_loading_distance
                ),
            });
        }
        if world.creator_threads == 0 {
            return Err(ConfigError::Invalid {
                field: "world.creator_threads",
                reason: "at least one creator thread is needed".to_string(),
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_survive_the_file() {
        let dir = tempfile::tempdir().unwrap();
        let first = Config::load_or_create(dir.path()).unwrap();
        assert_eq!(first, Config::default());

        let text = std::fs::read_to_string(dir.path().join(CONFIG_FILE)).unwrap();
        assert!(text.contains("height: 256"));
        assert!(text.contains("port: 25600"));

        let second = Config::load_or_create(dir.path()).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn test_partial_file_fills_in_defaults() {
        let config: Config = ron::from_str("(world: (height: 128), unknown_section: 3)").unwrap();
        assert_eq!(config.world.height, 128);
        assert_eq!(config.world.tick_rate_hz, WorldConfig::default().tick_rate_hz);
        assert_eq!(config.network, NetworkConfig::default());
    }

    #[test]
    fn test_edited_values_are_loaded() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = Config::default();
        config.world.max_chunk_loading_distance = 12;
        config.network.bind_address = "127.0.0.1".to_string();
        config.save(dir.path()).unwrap();
        assert_eq!(Config::load_or_create(dir.path()).unwrap(), config);
    }

    #[test]
    fn test_reload_reports_only_changes() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config::default();
        config.save(dir.path()).unwrap();
        assert!(config.reload(dir.path()).unwrap().is_none());

        std::fs::write(
            dir.path().join(CONFIG_FILE),
            "(world: (tick_rate_hz: 10))",
        )
        .unwrap();
        let changed = config.reload(dir.path()).unwrap().unwrap();
        assert_eq!(changed.world.tick_rate_hz, 10);
    }

    #[test]
    fn test_broken_file_names_its_path() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join(CONFIG_FILE), "(world: [oops").unwrap();
        let err = Config::load_or_create(dir.path()).unwrap_err();
        assert!(matches!(err, ConfigError::Parse { .. }));
        assert!(err.to_string().contains(CONFIG_FILE));
    }

    #[test]
    fn test_validate_world_section() {
        let mut config = Config::default();
        assert!(config.validate().is_ok());

        config.world.height = 100;
        assert!(matches!(
            config.validate(),
            Err(ConfigError::Invalid { field: "world.height", .. })
        ));
        config.world.height = 64;

        config.world.tick_rate_hz = 0;
        assert!(matches!(
            config.validate(),
            Err(ConfigError::Invalid { field: "world.tick_rate_hz", .. })
        ));
        config.world.tick_rate_hz = 20;

        config.world.chunk_loading_distance = 40;
        assert!(matches!(
            config.validate(),
            Err(ConfigError::Invalid { field: "world.chunk_loading_distance", .. })
        ));
        config.world.chunk_loading_distance = 8;

        config.world.creator_threads = 0;
        assert!(config.validate().is_err());
    }
}
