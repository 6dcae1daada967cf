//! Glyph and variation-index remapping applied while splitting tables.
//!
//! When the engine synthesizes new coverage, class-definition, or
//! VariationIndex tables it consults these maps, so that a caller packing a
//! subset font gets tables in the subset's glyph and delta-set numbering.
//! Both maps default to the identity.

use std::collections::HashMap;

use font_types::GlyphId16;

/// Remapping tables consulted when new subtables are synthesized.
///
/// The glyph map must be monotonic over the glyphs it retains; coverage
/// tables record glyphs in ascending order and the records that parallel
/// them are not reordered.
#[derive(Clone, Debug, Default)]
pub struct Remaps {
    glyphs: Option<HashMap<u16, u16>>,
    var_indices: Option<HashMap<u32, u32>>,
}

impl Remaps {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the glyph-id map, as (old, new) pairs.
    pub fn set_glyph_map(&mut self, map: impl IntoIterator<Item = (u16, u16)>) {
        self.glyphs = Some(map.into_iter().collect());
    }

    /// Set the variation-index map, as (old, new) pairs of packed
    /// `(outer << 16) | inner` delta-set indices.
    pub fn set_var_index_map(&mut self, map: impl IntoIterator<Item = (u32, u32)>) {
        self.var_indices = Some(map.into_iter().collect());
    }

    pub(crate) fn glyph(&self, gid: GlyphId16) -> GlyphId16 {
        match &self.glyphs {
            Some(map) => map
                .get(&gid.to_u16())
                .map(|new| GlyphId16::new(*new))
                .unwrap_or(gid),
            None => gid,
        }
    }

    pub(crate) fn var_index(&self, index: u32) -> u32 {
        match &self.var_indices {
            Some(map) => map.get(&index).copied().unwrap_or(index),
            None => index,
        }
    }

    pub(crate) fn has_var_indices(&self) -> bool {
        self.var_indices.is_some()
    }
}
