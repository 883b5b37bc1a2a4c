//! Shared foundation for the Prism graphics shim.
//!
//! This crate provides the dependency-light pieces used across the
//! workspace:
//! - Integer alignment helpers
//! - Block-linear (GOB) texel-layout math for tiled GPU surfaces

pub mod layout;
pub mod util;

pub use layout::{
    block_linear_layer_size, pitch_size, select_tile_depth, select_tile_height, Extent3d,
};
pub use util::{align_down, align_up, div_ceil, is_aligned};
