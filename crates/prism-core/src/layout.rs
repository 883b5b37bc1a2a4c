//! Block-linear (GOB) texel-layout math.
//!
//! Tiled GPU surfaces are organized in fixed-size GOBs (64 bytes wide, 8
//! rows) grouped into blocks of a selectable height and depth. Storage
//! sizing for such surfaces cannot be derived from a linear pitch; the
//! helpers here compute tile selection and per-layer byte sizes for them.

use crate::util::{align_up, div_ceil};

/// Width of a GOB in bytes.
pub const GOB_WIDTH_BYTES: u64 = 64;
/// Height of a GOB in rows.
pub const GOB_HEIGHT: u64 = 8;
/// Total size of a GOB in bytes.
pub const GOB_SIZE: u64 = GOB_WIDTH_BYTES * GOB_HEIGHT;

/// Maximum block height in GOBs.
const MAX_TILE_HEIGHT: u64 = 16;
/// Maximum block depth in slices.
const MAX_TILE_DEPTH: u64 = 32;

/// A three-dimensional surface extent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Extent3d {
    pub width: u32,
    pub height: u32,
    pub depth: u32,
}

impl Extent3d {
    pub const fn new(width: u32, height: u32, depth: u32) -> Self {
        Self {
            width,
            height,
            depth,
        }
    }

    /// The extent of mip level `level`, clamped to 1 per axis.
    pub const fn mip_level(self, level: u32) -> Self {
        Self {
            width: max_u32(self.width >> level, 1),
            height: max_u32(self.height >> level, 1),
            depth: max_u32(self.depth >> level, 1),
        }
    }
}

const fn max_u32(a: u32, b: u32) -> u32 {
    if a > b {
        a
    } else {
        b
    }
}

/// Select the block height in GOBs for a surface of the given height.
///
/// Returns the smallest power of two (up to 16) whose tile covers the
/// surface height, in rows of format blocks.
pub fn select_tile_height(height: u32, format_block_height: u32) -> u8 {
    let block_rows = div_ceil(u64::from(height), u64::from(format_block_height));

    let mut tile = MAX_TILE_HEIGHT;
    while tile > 1 && block_rows <= (tile / 2) * GOB_HEIGHT {
        tile /= 2;
    }

    tile as u8
}

/// Select the block depth in slices for a 3D surface of the given depth.
pub fn select_tile_depth(depth: u32) -> u8 {
    let mut tile = MAX_TILE_DEPTH;
    while tile > 1 && u64::from(depth) <= tile / 2 {
        tile /= 2;
    }

    tile as u8
}

/// Size in bytes of one layer of a block-linear surface.
///
/// Sums the GOB-aligned slices of every mip level; the tile height/depth
/// shrink per level once a mip no longer fills the selected block. When the
/// surface has more than one layer the total is aligned to a whole block so
/// layers start on block boundaries.
#[allow(clippy::too_many_arguments)]
pub fn block_linear_layer_size(
    extent: Extent3d,
    format_block_width: u32,
    format_block_height: u32,
    bytes_per_block: u32,
    tile_height: u8,
    tile_depth: u8,
    levels: u32,
    is_multi_layer: bool,
) -> u64 {
    let mut size = 0u64;

    for level in 0..levels {
        let mip = extent.mip_level(level);

        let width_blocks = div_ceil(u64::from(mip.width), u64::from(format_block_width));
        let row_bytes = width_blocks * u64::from(bytes_per_block);
        let width_gobs = div_ceil(row_bytes, GOB_WIDTH_BYTES);

        let height_blocks = div_ceil(u64::from(mip.height), u64::from(format_block_height));
        let height_gobs = div_ceil(height_blocks, GOB_HEIGHT);

        let level_tile_height =
            u64::from(select_tile_height(mip.height, format_block_height).min(tile_height));
        let level_tile_depth = u64::from(select_tile_depth(mip.depth).min(tile_depth));

        let aligned_height_gobs = align_up(height_gobs, level_tile_height);
        let aligned_depth = align_up(u64::from(mip.depth), level_tile_depth);

        size += width_gobs * aligned_height_gobs * aligned_depth * GOB_SIZE;
    }

    if is_multi_layer {
        size = align_up(
            size,
            GOB_SIZE * u64::from(tile_height) * u64::from(tile_depth),
        );
    }

    size
}

/// Size in bytes of a linear (pitch) surface.
pub const fn pitch_size(stride: u64, height: u32) -> u64 {
    stride * height as u64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tile_height_selection() {
        // 8 rows fit a single GOB
        assert_eq!(select_tile_height(8, 1), 1);
        // 64 rows need a block of 8 GOBs
        assert_eq!(select_tile_height(64, 1), 8);
        // One row past the 8-GOB block jumps to the maximum
        assert_eq!(select_tile_height(65, 1), 16);
        // Compressed formats count rows of blocks, not texels
        assert_eq!(select_tile_height(32, 4), 1);
        assert_eq!(select_tile_height(64, 4), 2);
    }

    #[test]
    fn tile_depth_selection() {
        assert_eq!(select_tile_depth(1), 1);
        assert_eq!(select_tile_depth(16), 16);
        assert_eq!(select_tile_depth(17), 32);
    }

    #[test]
    fn layer_size_single_gob() {
        // 16x8 RGBA8: one 64-byte row per GOB row, 8 rows -> exactly one GOB
        let size = block_linear_layer_size(Extent3d::new(16, 8, 1), 1, 1, 4, 1, 1, 1, false);
        assert_eq!(size, GOB_SIZE);
    }

    #[test]
    fn layer_size_matches_linear_for_aligned_surface() {
        // 64x64 RGBA8 fills its GOBs exactly: block-linear size == linear size
        let size = block_linear_layer_size(Extent3d::new(64, 64, 1), 1, 1, 4, 8, 1, 1, false);
        assert_eq!(size, 64 * 64 * 4);
    }

    #[test]
    fn layer_size_sums_mip_levels() {
        let base = Extent3d::new(64, 64, 1);
        let l0 = block_linear_layer_size(base, 1, 1, 4, 8, 1, 1, false);
        let both = block_linear_layer_size(base, 1, 1, 4, 8, 1, 2, false);
        // 32x32 mip: 2 GOBs wide, 4 GOB rows aligned to a 4-GOB tile
        assert_eq!(both - l0, 2 * 4 * GOB_SIZE);
    }

    #[test]
    fn layer_size_compressed_format() {
        // BC1-style 4x4 blocks at 8 bytes per block
        let size = block_linear_layer_size(Extent3d::new(64, 64, 1), 4, 4, 8, 2, 1, 1, false);
        assert_eq!(size, 16 * 16 * 8);
    }

    #[test]
    fn multi_layer_aligns_to_block() {
        let size = block_linear_layer_size(Extent3d::new(16, 8, 1), 1, 1, 4, 16, 1, 1, true);
        assert_eq!(size, GOB_SIZE * 16);
    }

    #[test]
    fn mip_extents_clamp_to_one() {
        let e = Extent3d::new(64, 4, 1).mip_level(4);
        assert_eq!(e, Extent3d::new(4, 1, 1));
    }
}
