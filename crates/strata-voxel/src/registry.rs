//! Block type registry: maps compact [`BlockId`] values to [`BlockDef`] metadata.
//!
//! The registry is built once during server startup and shared read-only
//! afterwards. It is the source of the global block state palette that the
//! wire format indexes into.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::block::{BlockId, BlockState};
use crate::palette::IndexedBlockStatePalette;

// ---------------------------------------------------------------------------
// Types
// ---------------------------------------------------------------------------

/// Transparency mode for a block type.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Transparency {
    /// Fully blocks visibility.
    Opaque,
    /// Partially transparent (e.g. water, glass).
    SemiTransparent,
    /// Completely transparent.
    FullyTransparent,
}

/// Full descriptor for a block type.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct BlockDef {
    /// Unique name (e.g. "stone", "log").
    pub name: String,
    /// Transparency mode.
    pub transparency: Transparency,
    /// Number of variants. Always at least 1.
    #[serde(default = "default_variants")]
    pub variants: u8,
}

fn default_variants() -> u8 {
    1
}

impl BlockDef {
    /// An opaque single-variant block.
    pub fn opaque(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            transparency: Transparency::Opaque,
            variants: 1,
        }
    }

    /// Builder-style variant count.
    pub fn with_variants(mut self, variants: u8) -> Self {
        self.variants = variants;
        self
    }

    /// Builder-style transparency.
    pub fn with_transparency(mut self, transparency: Transparency) -> Self {
        self.transparency = transparency;
        self
    }
}

/// Errors that can occur during block registration.
#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("duplicate block name: {0}")]
    DuplicateName(String),
    #[error("block {0} declares zero variants")]
    NoVariants(String),
    #[error("block registry is full (max 65536 types)")]
    RegistryFull,
}

// ---------------------------------------------------------------------------
// Registry
// ---------------------------------------------------------------------------

/// Maps [`BlockId`] → [`BlockDef`] with O(1) lookup by id and by name.
#[derive(Debug, Default)]
pub struct BlockRegistry {
    /// Dense array where `index == BlockId.0`.
    blocks: Vec<BlockDef>,
    name_to_id: HashMap<String, BlockId>,
}

impl BlockRegistry {
    /// Creates an empty registry. Air is implicit and never registered.
    pub fn new() -> Self {
        Self::default()
    }

    /// Builds a registry from definitions in order.
    pub fn from_defs(defs: impl IntoIterator<Item = BlockDef>) -> Result<Self, RegistryError> {
        let mut registry = Self::new();
        for def in defs {
            registry.register(def)?;
        }
        Ok(registry)
    }

    /// Registers a new block type and returns its assigned ID.
    ///
    /// IDs are assigned sequentially starting from 0.
    pub fn register(&mut self, def: BlockDef) -> Result<BlockId, RegistryError> {
        if self.name_to_id.contains_key(&def.name) {
            return Err(RegistryError::DuplicateName(def.name));
        }
        if def.variants == 0 {
            return Err(RegistryError::NoVariants(def.name));
        }
        if self.blocks.len() > u16::MAX as usize {
            return Err(RegistryError::RegistryFull);
        }

        let id = BlockId(self.blocks.len() as u16);
        self.name_to_id.insert(def.name.clone(), id);
        self.blocks.push(def);
        Ok(id)
    }

    /// Returns the definition for a given ID.
    pub fn get(&self, id: BlockId) -> Option<&BlockDef> {
        self.blocks.get(id.0 as usize)
    }

    /// Returns the ID for a named block, or `None` if not found.
    pub fn lookup_by_name(&self, name: &str) -> Option<BlockId> {
        self.name_to_id.get(name).copied()
    }

    /// Default state of the named block.
    pub fn default_state(&self, name: &str) -> Option<BlockState> {
        self.lookup_by_name(name).map(BlockState::of)
    }

    pub fn len(&self) -> usize {
        self.blocks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }

    /// Whether light and sight pass through `state`. Air and unknown blocks do.
    pub fn is_see_through(&self, state: Option<BlockState>) -> bool {
        match state.and_then(|s| self.get(s.block)) {
            Some(def) => def.transparency != Transparency::Opaque,
            None => true,
        }
    }

    /// Whether `state` names a registered block with a valid variant.
    pub fn is_valid(&self, state: BlockState) -> bool {
        self.get(state.block)
            .is_some_and(|def| state.variant < def.variants)
    }

    /// Every state of every block, air first, in registration order.
    ///
    /// Indices into this palette are what chunk data on the wire refers to,
    /// so both ends must build it from identically ordered registries.
    pub fn global_palette(&self) -> IndexedBlockStatePalette {
        let states = self.blocks.iter().enumerate().flat_map(|(id, def)| {
            (0..def.variants).map(move |variant| Some(BlockState::new(BlockId(id as u16), variant)))
        });
        IndexedBlockStatePalette::new(std::iter::once(None).chain(states))
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
