//! Guest samplers.

use crate::device::Device;
use crate::error::{HleError, Result};
use ash::vk;
use std::sync::Arc;

/// Minification filter, including the mip filter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MinFilter {
    #[default]
    Nearest,
    Linear,
    NearestMipmapNearest,
    LinearMipmapNearest,
    NearestMipmapLinear,
    LinearMipmapLinear,
}

impl MinFilter {
    fn vk_filter(self) -> vk::Filter {
        match self {
            Self::Nearest | Self::NearestMipmapNearest | Self::NearestMipmapLinear => {
                vk::Filter::NEAREST
            }
            Self::Linear | Self::LinearMipmapNearest | Self::LinearMipmapLinear => {
                vk::Filter::LINEAR
            }
        }
    }

    fn vk_mipmap_mode(self) -> vk::SamplerMipmapMode {
        match self {
            Self::NearestMipmapLinear | Self::LinearMipmapLinear => {
                vk::SamplerMipmapMode::LINEAR
            }
            _ => vk::SamplerMipmapMode::NEAREST,
        }
    }
}

/// Magnification filter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MagFilter {
    #[default]
    Nearest,
    Linear,
}

impl MagFilter {
    fn vk_filter(self) -> vk::Filter {
        match self {
            Self::Nearest => vk::Filter::NEAREST,
            Self::Linear => vk::Filter::LINEAR,
        }
    }
}

/// Texture coordinate wrap mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum WrapMode {
    Clamp,
    #[default]
    Repeat,
    MirrorClamp,
    MirrorClampToEdge,
    MirrorClampToBorder,
    ClampToBorder,
    MirroredRepeat,
    ClampToEdge,
}

impl WrapMode {
    fn to_vk(self) -> vk::SamplerAddressMode {
        match self {
            Self::Clamp | Self::ClampToEdge => vk::SamplerAddressMode::CLAMP_TO_EDGE,
            Self::Repeat => vk::SamplerAddressMode::REPEAT,
            Self::MirrorClamp | Self::MirrorClampToEdge => {
                vk::SamplerAddressMode::MIRROR_CLAMP_TO_EDGE
            }
            Self::MirrorClampToBorder | Self::ClampToBorder => {
                vk::SamplerAddressMode::CLAMP_TO_BORDER
            }
            Self::MirroredRepeat => vk::SamplerAddressMode::MIRRORED_REPEAT,
        }
    }
}

/// Depth-compare enable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CompareMode {
    #[default]
    None,
    CompareRToTexture,
}

/// Depth-compare function.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CompareFunc {
    Never,
    #[default]
    Less,
    Equal,
    LEqual,
    Greater,
    NotEqual,
    GEqual,
    Always,
}

impl CompareFunc {
    fn to_vk(self) -> vk::CompareOp {
        match self {
            Self::Never => vk::CompareOp::NEVER,
            Self::Less => vk::CompareOp::LESS,
            Self::Equal => vk::CompareOp::EQUAL,
            Self::LEqual => vk::CompareOp::LESS_OR_EQUAL,
            Self::Greater => vk::CompareOp::GREATER,
            Self::NotEqual => vk::CompareOp::NOT_EQUAL,
            Self::GEqual => vk::CompareOp::GREATER_OR_EQUAL,
            Self::Always => vk::CompareOp::ALWAYS,
        }
    }
}

/// Builder for creating a guest sampler.
pub struct SamplerBuilder {
    device: Option<Arc<Device>>,
    min_filter: MinFilter,
    mag_filter: MagFilter,
    wrap_mode: [WrapMode; 3],
    lod_clamp_min: f32,
    lod_clamp_max: f32,
    lod_bias: f32,
    compare_mode: CompareMode,
    compare_func: CompareFunc,
    max_anisotropy: f32,
}

impl Default for SamplerBuilder {
    fn default() -> Self {
        Self {
            device: None,
            min_filter: MinFilter::default(),
            mag_filter: MagFilter::default(),
            wrap_mode: [WrapMode::Repeat; 3],
            lod_clamp_min: 0.0,
            lod_clamp_max: 1000.0,
            lod_bias: 0.0,
            compare_mode: CompareMode::default(),
            compare_func: CompareFunc::default(),
            max_anisotropy: 1.0,
        }
    }
}

impl SamplerBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_device(&mut self, device: Arc<Device>) {
        self.device = Some(device);
    }

    pub fn set_min_mag_filter(&mut self, min: MinFilter, mag: MagFilter) {
        self.min_filter = min;
        self.mag_filter = mag;
    }

    pub fn set_wrap_mode(&mut self, s: WrapMode, t: WrapMode, r: WrapMode) {
        self.wrap_mode = [s, t, r];
    }

    pub fn set_lod_clamp(&mut self, min: f32, max: f32) {
        self.lod_clamp_min = min;
        self.lod_clamp_max = max;
    }

    pub fn set_lod_bias(&mut self, bias: f32) {
        self.lod_bias = bias;
    }

    pub fn set_compare(&mut self, mode: CompareMode, func: CompareFunc) {
        self.compare_mode = mode;
        self.compare_func = func;
    }

    pub fn set_max_anisotropy(&mut self, max_anisotropy: f32) {
        self.max_anisotropy = max_anisotropy;
    }

    pub fn min_mag_filter(&self) -> (MinFilter, MagFilter) {
        (self.min_filter, self.mag_filter)
    }

    pub fn wrap_mode(&self) -> (WrapMode, WrapMode, WrapMode) {
        (self.wrap_mode[0], self.wrap_mode[1], self.wrap_mode[2])
    }

    pub fn lod_clamp(&self) -> (f32, f32) {
        (self.lod_clamp_min, self.lod_clamp_max)
    }

    pub fn lod_bias(&self) -> f32 {
        self.lod_bias
    }

    pub fn compare(&self) -> (CompareMode, CompareFunc) {
        (self.compare_mode, self.compare_func)
    }

    pub fn max_anisotropy(&self) -> f32 {
        self.max_anisotropy
    }
}

/// A guest sampler backed by one host sampler object.
pub struct Sampler {
    device: Arc<Device>,
    sampler: vk::Sampler,
    debug_label: Option<String>,
}

impl Sampler {
    /// Create the host sampler described by the builder.
    pub fn new(builder: &SamplerBuilder) -> Result<Self> {
        let device = builder
            .device
            .clone()
            .ok_or(HleError::InvalidArgument("sampler has no device"))?;

        let create_info = vk::SamplerCreateInfo::default()
            .min_filter(builder.min_filter.vk_filter())
            .mag_filter(builder.mag_filter.vk_filter())
            .mipmap_mode(builder.min_filter.vk_mipmap_mode())
            .address_mode_u(builder.wrap_mode[0].to_vk())
            .address_mode_v(builder.wrap_mode[1].to_vk())
            .address_mode_w(builder.wrap_mode[2].to_vk())
            .min_lod(builder.lod_clamp_min)
            .max_lod(builder.lod_clamp_max)
            .mip_lod_bias(builder.lod_bias)
            .anisotropy_enable(builder.max_anisotropy > 1.0)
            .max_anisotropy(builder.max_anisotropy)
            .compare_enable(builder.compare_mode == CompareMode::CompareRToTexture)
            .compare_op(builder.compare_func.to_vk());

        let sampler = unsafe {
            device
                .context()
                .device()
                .create_sampler(&create_info, None)
                .map_err(|e| HleError::Gpu(e.into()))?
        };

        Ok(Self {
            device,
            sampler,
            debug_label: None,
        })
    }

    pub fn set_debug_label(&mut self, label: impl Into<String>) {
        self.debug_label = Some(label.into());
    }

    pub fn debug_label(&self) -> Option<&str> {
        self.debug_label.as_deref()
    }

    /// The host sampler handle.
    pub fn handle(&self) -> vk::Sampler {
        self.sampler
    }
}

impl Drop for Sampler {
    fn drop(&mut self) {
        unsafe {
            self.device
                .context()
                .device()
                .destroy_sampler(self.sampler, None);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn min_filter_splits_into_filter_and_mip_mode() {
        assert_eq!(
            MinFilter::LinearMipmapLinear.vk_filter(),
            vk::Filter::LINEAR
        );
        assert_eq!(
            MinFilter::LinearMipmapLinear.vk_mipmap_mode(),
            vk::SamplerMipmapMode::LINEAR
        );
        assert_eq!(
            MinFilter::NearestMipmapNearest.vk_mipmap_mode(),
            vk::SamplerMipmapMode::NEAREST
        );
    }

    #[test]
    fn wrap_modes_map_onto_host_address_modes() {
        assert_eq!(WrapMode::Repeat.to_vk(), vk::SamplerAddressMode::REPEAT);
        assert_eq!(
            WrapMode::Clamp.to_vk(),
            vk::SamplerAddressMode::CLAMP_TO_EDGE
        );
        assert_eq!(
            WrapMode::ClampToBorder.to_vk(),
            vk::SamplerAddressMode::CLAMP_TO_BORDER
        );
    }

    #[test]
    fn builder_defaults_match_guest_defaults() {
        let builder = SamplerBuilder::new();
        assert_eq!(builder.min_mag_filter(), (MinFilter::Nearest, MagFilter::Nearest));
        assert_eq!(builder.lod_clamp(), (0.0, 1000.0));
        assert_eq!(builder.max_anisotropy(), 1.0);
    }
}
