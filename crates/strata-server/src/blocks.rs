//! Block definitions loaded from `blocks.ron` and the flat terrain built from them.

use std::path::Path;

use strata_voxel::{BlockDef, BlockRegistry, BlockState, Transparency};

use crate::ServerError;

/// File inside the config directory listing the block types.
pub const BLOCKS_FILE: &str = "blocks.ron";

/// Block types used when no `blocks.ron` exists.
pub fn default_block_defs() -> Vec<BlockDef> {
    vec![
        BlockDef::opaque("bedrock"),
        BlockDef::opaque("stone"),
        BlockDef::opaque("dirt"),
        BlockDef::opaque("grass"),
        BlockDef::opaque("glass").with_transparency(Transparency::FullyTransparent),
        BlockDef::opaque("water").with_transparency(Transparency::SemiTransparent),
    ]
}

/// Reads `<config_dir>/blocks.ron`, falling back to [`default_block_defs`]
/// when the file is absent.
pub fn load_registry(config_dir: &Path) -> Result<BlockRegistry, ServerError> {
    let path = config_dir.join(BLOCKS_FILE);
    let defs = if path.exists() {
        let contents = std::fs::read_to_string(&path)?;
        let defs: Vec<BlockDef> =
            ron::from_str(&contents).map_err(|source| ServerError::BlockFile {
                path: path.clone(),
                source,
            })?;
        tracing::info!("Loaded {} block types from {}", defs.len(), path.display());
        defs
    } else {
        tracing::info!("No {BLOCKS_FILE} found, using built-in block types");
        default_block_defs()
    };
    Ok(BlockRegistry::from_defs(defs)?)
}

/// Terrain layers for the flat generator, bottom first.
///
/// Uses whichever of bedrock, stone, dirt and grass the registry knows.
pub fn flat_layers(registry: &BlockRegistry, height: i32) -> Vec<(i32, BlockState)> {
    let stone = (height / 4 - 5).max(1);
    [("bedrock", 1), ("stone", stone), ("dirt", 3), ("grass", 1)]
        .into_iter()
        .filter_map(|(name, thickness)| Some((thickness, registry.default_state(name)?)))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_file_uses_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let registry = load_registry(dir.path()).unwrap();
        assert_eq!(registry.len(), default_block_defs().len());
        assert!(registry.lookup_by_name("grass").is_some());
    }

    #[test]
    fn test_file_overrides_defaults() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join(BLOCKS_FILE),
            r#"[
                (name: "marble", transparency: Opaque),
                (name: "leaves", transparency: SemiTransparent, variants: 4),
            ]"#,
        )
        .unwrap();
        let registry = load_registry(dir.path()).unwrap();
        assert_eq!(registry.len(), 2);
        assert!(registry.lookup_by_name("stone").is_none());
        let leaves = registry.lookup_by_name("leaves").unwrap();
        assert_eq!(registry.get(leaves).unwrap().variants, 4);
    }

    #[test]
    fn test_bad_file_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join(BLOCKS_FILE), "not ron").unwrap();
        assert!(matches!(
            load_registry(dir.path()),
            Err(ServerError::BlockFile { .. })
        ));
    }

    #[test]
    fn test_flat_layers_fit_height() {
        let registry = BlockRegistry::from_defs(default_block_defs()).unwrap();
        let layers = flat_layers(&registry, 256);
        assert_eq!(layers.len(), 4);
        let surface: i32 = layers.iter().map(|(t, _)| t).sum();
        assert_eq!(surface, 64);
        assert_eq!(layers[3].1, registry.default_state("grass").unwrap());
    }
}
