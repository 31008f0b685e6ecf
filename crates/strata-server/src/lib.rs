//! Strata world server: wires configuration, the world thread and the TCP
//! server together.

pub mod blocks;
pub mod session;
pub mod world_server;

use std::net::{IpAddr, SocketAddr};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use strata_config::{Config, ConfigError};
use strata_net::{CompressionConfig, FrameConfig, GameServer, ServerConfig};
use strata_voxel::{
    BlockRegistry, ChunkFragmenter, ChunkLoadConfig, FlatGenerator, RegistryError, World,
    WorldError, WorldSettings, WorldThread,
};
use thiserror::Error;
use tracing::info;

pub use world_server::{ChunkDelivery, SessionError, WorldServer};

/// Queue depth of chunk creation requests waiting for a worker.
const CREATOR_QUEUE: usize = 1024;

#[derive(Debug, Error)]
pub enum ServerError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Registry(#[from] RegistryError),
    #[error(transparent)]
    World(#[from] WorldError),
    #[error("failed to parse {path}: {source}")]
    BlockFile {
        path: PathBuf,
        #[source]
        source: ron::error::SpannedError,
    },
    #[error("invalid bind address {0:?}")]
    InvalidAddress(String),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// World construction parameters from the `world` config section.
pub fn world_settings(config: &Config) -> WorldSettings {
    let world = &config.world;
    WorldSettings {
        height: i32::try_from(world.height).unwrap_or(i32::MAX),
        loading: ChunkLoadConfig {
            chunk_loading_distance: world.chunk_loading_distance,
            max_chunk_loading_distance: world.max_chunk_loading_distance,
            unload_hysteresis: world.unload_hysteresis,
            creates_per_tick: world.creates_per_tick,
        },
        creator_threads: world.creator_threads,
        creator_queue: CREATOR_QUEUE,
    }
}

/// Builds a flat world from `registry`. Returns it with the spawn point on
/// top of the terrain at the world origin.
pub fn build_world(
    config: &Config,
    registry: &BlockRegistry,
) -> Result<(World, [f64; 3]), ServerError> {
    let settings = world_settings(config);
    let layers = blocks::flat_layers(registry, settings.height);
    let generator = FlatGenerator::new(layers);
    let spawn = [0.5, f64::from(generator.surface_height()), 0.5];
    let world = World::new(settings, Arc::new(generator))?;
    Ok((world, spawn))
}

/// TCP server parameters from the `network` config section.
pub fn server_config(config: &Config) -> Result<ServerConfig, ServerError> {
    let network = &config.network;
    let ip: IpAddr = network
        .bind_address
        .parse()
        .map_err(|_| ServerError::InvalidAddress(network.bind_address.clone()))?;
    Ok(ServerConfig {
        bind_addr: SocketAddr::from((ip, network.port)),
        max_connections: network.max_connections,
        frame: FrameConfig {
            max_payload_size: network.max_frame_size,
        },
    })
}

pub fn compression_config(config: &Config) -> CompressionConfig {
    CompressionConfig {
        threshold: config.network.compression_threshold,
        enabled: true,
    }
}

/// Everything a running server owns.
pub struct ServerParts {
    pub world_thread: WorldThread,
    pub handler: Arc<WorldServer>,
    pub server: GameServer,
}

/// Loads block types, starts the world thread and prepares the TCP server.
pub fn start(config: &Config, config_dir: &Path) -> Result<ServerParts, ServerError> {
    let registry = blocks::load_registry(config_dir)?;
    let (mut world, spawn) = build_world(config, &registry)?;

    let delivery = Arc::new(ChunkDelivery::new(
        ChunkFragmenter::new(Arc::new(registry.global_palette())),
        compression_config(config),
    ));
    world.add_creation_listener(delivery.clone());

    let tick_interval = Duration::from_secs(1) / config.world.tick_rate_hz.max(1);
    let world_thread = WorldThread::spawn(world, tick_interval)?;
    let handler = Arc::new(WorldServer::new(
        Arc::clone(world_thread.world()),
        delivery,
        spawn,
    ));
    let server = GameServer::new(server_config(config)?, handler.clone());
    info!(
        height = config.world.height,
        tick_rate_hz = config.world.tick_rate_hz,
        block_types = registry.len(),
        "World ready"
    );
    Ok(ServerParts {
        world_thread,
        handler,
        server,
    })
}

/// Runs the server until the accept loop fails or Ctrl-C is received.
pub async fn run(config: &Config, config_dir: &Path) -> Result<(), ServerError> {
    let ServerParts {
        mut world_thread,
        server,
        ..
    } = start(config, config_dir)?;

    let result = tokio::select! {
        result = server.run() => result,
        signal = tokio::signal::ctrl_c() => {
            info!("Shutdown requested");
            signal
        }
    };
    server.shutdown();
    world_thread.shutdown();
    Ok(result?)
}
