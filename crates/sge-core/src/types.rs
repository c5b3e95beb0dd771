//! Image and texture description types.

use bitflags::bitflags;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Pixel format of an image, independent of the graphics API.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ImageFormat {
    /// 8-bit RGB, stored with a padding alpha channel.
    Rgb8Unorm,
    /// 8-bit sRGB, stored with a padding alpha channel.
    Rgb8Srgb,
    Rgba8Unorm,
    Rgba8Srgb,
    Bgra8Unorm,
    Bgra8Srgb,
    /// 32-bit float depth.
    Depth32Float,
    /// 24-bit depth with 8-bit stencil.
    Depth24Stencil8,
}

impl ImageFormat {
    /// Size in bytes of one texel as laid out in host memory.
    ///
    /// The 3-channel formats are expanded to 4 channels on the device, so they
    /// occupy 4 bytes as well.
    pub const fn bytes_per_pixel(self) -> u32 {
        match self {
            Self::Rgb8Unorm
            | Self::Rgb8Srgb
            | Self::Rgba8Unorm
            | Self::Rgba8Srgb
            | Self::Bgra8Unorm
            | Self::Bgra8Srgb
            | Self::Depth32Float
            | Self::Depth24Stencil8 => 4,
        }
    }

    /// Returns true for depth (and depth-stencil) formats.
    pub const fn is_depth(self) -> bool {
        matches!(self, Self::Depth32Float | Self::Depth24Stencil8)
    }

    /// Returns true if the format carries a stencil aspect.
    pub const fn has_stencil(self) -> bool {
        matches!(self, Self::Depth24Stencil8)
    }

    /// Returns true for sRGB-encoded color formats.
    pub const fn is_srgb(self) -> bool {
        matches!(self, Self::Rgb8Srgb | Self::Rgba8Srgb | Self::Bgra8Srgb)
    }
}

bitflags! {
    /// How an image is going to be used.
    ///
    /// At least one flag must be set when creating an image.
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
    pub struct ImageUsage: u32 {
        /// Sampled from shaders.
        const TEXTURE = 1 << 0;
        /// Rendered to as a color or depth attachment.
        const ATTACHMENT = 1 << 1;
        /// Read and written as a storage image.
        const STORAGE = 1 << 2;
        /// Source of device-to-host readback.
        const TRANSFER_SRC = 1 << 3;
        /// Destination of host-to-device uploads.
        const TRANSFER_DST = 1 << 4;
        /// Both transfer directions.
        const TRANSFER = Self::TRANSFER_SRC.bits() | Self::TRANSFER_DST.bits();
    }
}

/// Description of a 2D image.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ImageSpec {
    pub width: u32,
    pub height: u32,
    pub mip_levels: u32,
    pub array_layers: u32,
    pub format: ImageFormat,
    pub usage: ImageUsage,
}

impl ImageSpec {
    /// Create a single-mip, single-layer image description.
    pub fn new(width: u32, height: u32, format: ImageFormat, usage: ImageUsage) -> Self {
        Self {
            width,
            height,
            mip_levels: 1,
            array_layers: 1,
            format,
            usage,
        }
    }

    /// Set the number of mip levels.
    pub fn with_mip_levels(mut self, mip_levels: u32) -> Self {
        self.mip_levels = mip_levels;
        self
    }

    /// Set the number of array layers.
    pub fn with_array_layers(mut self, array_layers: u32) -> Self {
        self.array_layers = array_layers;
        self
    }

    /// Size in bytes of mip level 0 across all array layers.
    pub fn byte_size(&self) -> u64 {
        u64::from(self.width)
            * u64::from(self.height)
            * u64::from(self.format.bytes_per_pixel())
            * u64::from(self.array_layers)
    }

    /// Size in bytes of mip level 0 of a single layer.
    pub fn layer_byte_size(&self) -> u64 {
        u64::from(self.width) * u64::from(self.height) * u64::from(self.format.bytes_per_pixel())
    }

    /// Check the description for values no graphics API accepts.
    pub fn validate(&self) -> Result<()> {
        if self.width == 0 || self.height == 0 {
            return Err(Error::InvalidData(format!(
                "image extent must be non-zero, got {}x{}",
                self.width, self.height
            )));
        }
        if self.mip_levels == 0 || self.array_layers == 0 {
            return Err(Error::InvalidData(
                "image needs at least one mip level and one array layer".to_string(),
            ));
        }
        if self.usage.is_empty() {
            return Err(Error::InvalidData("must provide usage flags".to_string()));
        }
        Ok(())
    }
}

/// Addressing mode outside the [0, 1] texture coordinate range.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TextureWrap {
    Clamp,
    #[default]
    Repeat,
}

/// Texel filtering mode.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TextureFilter {
    #[default]
    Linear,
    Nearest,
}

/// Sampling settings persisted alongside a texture asset.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TextureSettings {
    pub wrap: TextureWrap,
    pub filter: TextureFilter,
}

impl TextureSettings {
    pub fn new(wrap: TextureWrap, filter: TextureFilter) -> Self {
        Self { wrap, filter }
    }

    /// Encode the settings for the asset layer.
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        Ok(bincode::serialize(self)?)
    }

    /// Decode settings previously produced by [`TextureSettings::to_bytes`].
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        Ok(bincode::deserialize(bytes)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn image_byte_size_counts_layers() {
        let spec = ImageSpec::new(4, 2, ImageFormat::Rgba8Unorm, ImageUsage::TEXTURE)
            .with_array_layers(3);
        assert_eq!(spec.layer_byte_size(), 32);
        assert_eq!(spec.byte_size(), 96);
    }

    #[test]
    fn rgb_formats_are_padded() {
        assert_eq!(ImageFormat::Rgb8Srgb.bytes_per_pixel(), 4);
        assert!(ImageFormat::Rgb8Srgb.is_srgb());
        assert!(!ImageFormat::Rgb8Unorm.is_srgb());
    }

    #[test]
    fn empty_usage_is_rejected() {
        let spec = ImageSpec::new(1, 1, ImageFormat::Rgba8Unorm, ImageUsage::empty());
        assert!(matches!(spec.validate(), Err(Error::InvalidData(_))));
    }

    #[test]
    fn zero_extent_is_rejected() {
        let spec = ImageSpec::new(0, 16, ImageFormat::Rgba8Unorm, ImageUsage::TEXTURE);
        assert!(spec.validate().is_err());
        let spec = ImageSpec::new(16, 16, ImageFormat::Rgba8Unorm, ImageUsage::TEXTURE)
            .with_mip_levels(0);
        assert!(spec.validate().is_err());
    }

    #[test]
    fn transfer_covers_both_directions() {
        assert!(ImageUsage::TRANSFER.contains(ImageUsage::TRANSFER_SRC));
        assert!(ImageUsage::TRANSFER.contains(ImageUsage::TRANSFER_DST));
    }

    #[test]
    fn settings_survive_encoding() {
        let settings = TextureSettings::new(TextureWrap::Clamp, TextureFilter::Nearest);
        let bytes = settings.to_bytes().unwrap();
        assert_eq!(TextureSettings::from_bytes(&bytes).unwrap(), settings);
    }

    #[test]
    fn truncated_settings_fail_to_decode() {
        assert!(matches!(
            TextureSettings::from_bytes(&[1]),
            Err(Error::Serialization(_))
        ));
    }
}
