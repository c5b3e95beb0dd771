//! Sampled 2D textures.
//!
//! A [`Texture2D`] owns an [`Image2D`], a sampler built from its
//! [`TextureSettings`], and a cached descriptor. The texture registers itself
//! as a weak [`LayoutObserver`] of its image so the cached descriptor is
//! dropped whenever the image changes layout.

use std::path::Path;
use std::sync::{Arc, Weak};

use ash::vk;
use parking_lot::{Mutex, RwLock};
use sge_core::{ImageFormat, ImageSpec, ImageUsage, TextureFilter, TextureSettings, TextureWrap};

use crate::backend::SamplerDesc;
use crate::context::GpuContext;
use crate::error::{GpuError, Result};
use crate::image::{Image2D, ImageId, LayoutObserver};

const MAX_ANISOTROPY: f32 = 16.0;

fn sampler_desc(ctx: &GpuContext, settings: &TextureSettings) -> SamplerDesc {
    let filter = match settings.filter {
        TextureFilter::Linear => vk::Filter::LINEAR,
        TextureFilter::Nearest => vk::Filter::NEAREST,
    };
    let address_mode = match settings.wrap {
        TextureWrap::Clamp => vk::SamplerAddressMode::CLAMP_TO_EDGE,
        TextureWrap::Repeat => vk::SamplerAddressMode::REPEAT,
    };
    let anisotropy = ctx.logical_device().features().sampler_anisotropy
        && settings.filter == TextureFilter::Linear;
    SamplerDesc {
        filter,
        address_mode,
        max_anisotropy: anisotropy.then_some(MAX_ANISOTROPY),
    }
}

/// A sampled texture shared between the asset layer and the renderer.
pub struct Texture2D {
    name: String,
    image: Mutex<Image2D>,
    sampler: Mutex<vk::Sampler>,
    settings: RwLock<TextureSettings>,
    descriptor: Mutex<Option<vk::DescriptorImageInfo>>,
}

impl Texture2D {
    /// Create an empty texture in the UNDEFINED layout.
    pub fn create(
        ctx: &GpuContext,
        width: u32,
        height: u32,
        format: ImageFormat,
        settings: TextureSettings,
        name: &str,
    ) -> Result<Arc<Self>> {
        let spec = ImageSpec::new(width, height, format, ImageUsage::TEXTURE | ImageUsage::TRANSFER);
        let mut image = Image2D::new(ctx, &spec, name)?;
        let sampler = match ctx.device().create_sampler(&sampler_desc(ctx, &settings)) {
            Ok(sampler) => sampler,
            Err(err) => {
                image.destroy(ctx)?;
                return Err(err);
            }
        };

        let texture = Arc::new(Self {
            name: name.to_string(),
            image: Mutex::new(image),
            sampler: Mutex::new(sampler),
            settings: RwLock::new(settings),
            descriptor: Mutex::new(None),
        });
        texture.observe_image();
        Ok(texture)
    }

    /// Create a texture and upload `pixels` into it.
    pub fn create_with_pixels(
        ctx: &GpuContext,
        width: u32,
        height: u32,
        format: ImageFormat,
        settings: TextureSettings,
        pixels: &[u8],
        name: &str,
    ) -> Result<Arc<Self>> {
        let texture = Self::create(ctx, width, height, format, settings, name)?;
        let uploaded = texture.image.lock().copy_from(ctx, pixels);
        if let Err(err) = uploaded {
            texture.destroy(ctx)?;
            return Err(err);
        }
        Ok(texture)
    }

    /// Decode an image file and upload it as an sRGB texture.
    pub fn load(
        ctx: &GpuContext,
        path: impl AsRef<Path>,
        settings: TextureSettings,
    ) -> Result<Arc<Self>> {
        let path = path.as_ref();
        let decoded = ::image::open(path)
            .map_err(|e| GpuError::Asset(format!("{}: {}", path.display(), e)))?
            .to_rgba8();
        let (width, height) = decoded.dimensions();
        tracing::info!("Loaded texture {} ({}x{})", path.display(), width, height);
        Self::create_with_pixels(
            ctx,
            width,
            height,
            ImageFormat::Rgba8Srgb,
            settings,
            decoded.as_raw(),
            &path.display().to_string(),
        )
    }

    fn observe_image(self: &Arc<Self>) {
        let weak: Weak<dyn LayoutObserver> = Arc::downgrade(self) as Weak<dyn LayoutObserver>;
        self.image.lock().add_observer(weak);
    }

    /// Current sampling settings.
    pub fn settings(&self) -> TextureSettings {
        *self.settings.read()
    }

    /// Encode the sampling settings. Failures are logged and yield `None`.
    pub fn serialize_settings(&self) -> Option<Vec<u8>> {
        match self.settings().to_bytes() {
            Ok(bytes) => Some(bytes),
            Err(err) => {
                tracing::error!("Failed to serialize settings of texture '{}': {}", self.name, err);
                None
            }
        }
    }

    /// Apply encoded sampling settings and rebuild the sampler.
    ///
    /// Returns `false` (after logging) when the bytes do not decode or the
    /// sampler cannot be rebuilt; the previous settings stay in effect.
    pub fn deserialize_settings(&self, ctx: &GpuContext, bytes: &[u8]) -> bool {
        let settings = match TextureSettings::from_bytes(bytes) {
            Ok(settings) => settings,
            Err(err) => {
                tracing::error!("Failed to deserialize settings of texture '{}': {}", self.name, err);
                return false;
            }
        };
        match self.apply_settings(ctx, settings) {
            Ok(()) => true,
            Err(err) => {
                tracing::error!("Failed to apply settings to texture '{}': {}", self.name, err);
                false
            }
        }
    }

    fn apply_settings(&self, ctx: &GpuContext, settings: TextureSettings) -> Result<()> {
        let sampler = ctx.device().create_sampler(&sampler_desc(ctx, &settings))?;
        // The old sampler may still be referenced by in-flight frames.
        ctx.wait_idle()?;
        let old = std::mem::replace(&mut *self.sampler.lock(), sampler);
        ctx.device().destroy_sampler(old);
        *self.settings.write() = settings;
        self.descriptor.lock().take();
        Ok(())
    }

    /// Replace the image contents, possibly with a new size.
    ///
    /// Waits for the device to go idle before the old image is released.
    pub fn reload(
        self: &Arc<Self>,
        ctx: &GpuContext,
        width: u32,
        height: u32,
        pixels: &[u8],
    ) -> Result<()> {
        let mut image = self.image.lock();
        let spec = ImageSpec::new(width, height, image.format(), image.usage());
        let mut replacement = Image2D::new(ctx, &spec, &self.name)?;
        if let Err(err) = replacement.copy_from(ctx, pixels) {
            replacement.destroy(ctx)?;
            return Err(err);
        }

        ctx.wait_idle()?;
        let mut old = std::mem::replace(&mut *image, replacement);
        old.destroy(ctx)?;
        drop(image);

        self.descriptor.lock().take();
        self.observe_image();
        tracing::debug!("Reloaded texture '{}' at {}x{}", self.name, width, height);
        Ok(())
    }

    /// Descriptor for binding the texture to a shader, cached until the
    /// image changes layout.
    pub fn descriptor_info(&self) -> vk::DescriptorImageInfo {
        if let Some(info) = *self.descriptor.lock() {
            return info;
        }
        // Image before descriptor, the order layout notifications take them in.
        let (image_view, image_layout) = {
            let image = self.image.lock();
            (image.view(), image.layout())
        };
        let info = vk::DescriptorImageInfo {
            sampler: *self.sampler.lock(),
            image_view,
            image_layout,
        };
        *self.descriptor.lock() = Some(info);
        info
    }

    pub fn has_cached_descriptor(&self) -> bool {
        self.descriptor.lock().is_some()
    }

    /// Exclusive access to the underlying image.
    pub fn image(&self) -> parking_lot::MutexGuard<'_, Image2D> {
        self.image.lock()
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn sampler(&self) -> vk::Sampler {
        *self.sampler.lock()
    }

    /// Release the image and sampler. The device must be done with them.
    pub fn destroy(&self, ctx: &GpuContext) -> Result<()> {
        self.image.lock().destroy(ctx)?;
        let sampler = std::mem::replace(&mut *self.sampler.lock(), vk::Sampler::null());
        if sampler != vk::Sampler::null() {
            ctx.device().destroy_sampler(sampler);
        }
        self.descriptor.lock().take();
        Ok(())
    }
}

impl LayoutObserver for Texture2D {
    fn on_layout_transition(&self, _image: ImageId, _old: vk::ImageLayout, _new: vk::ImageLayout) {
        self.descriptor.lock().take();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::soft::SoftInstance;
    use crate::context::GpuContextBuilder;

    fn context() -> (Arc<SoftInstance>, GpuContext) {
        let instance = Arc::new(SoftInstance::single());
        let ctx = GpuContextBuilder::new()
            .headless(true)
            .build_with(instance.clone())
            .unwrap();
        (instance, ctx)
    }

    fn checker(width: u32, height: u32) -> Vec<u8> {
        (0..width * height)
            .flat_map(|i| if i % 2 == 0 { [255, 255, 255, 255] } else { [0, 0, 0, 255] })
            .collect()
    }

    #[test]
    fn pixels_are_uploaded_and_readable() {
        let (_instance, mut ctx) = context();
        let pixels = checker(4, 4);
        let texture = Texture2D::create_with_pixels(
            &ctx,
            4,
            4,
            ImageFormat::Rgba8Unorm,
            TextureSettings::default(),
            &pixels,
            "checker",
        )
        .unwrap();

        let mut out = vec![0; pixels.len()];
        assert!(texture.image().copy_to(&ctx, &mut out).unwrap());
        assert_eq!(out, pixels);
        assert_eq!(
            texture.descriptor_info().image_layout,
            vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL
        );

        texture.destroy(&ctx).unwrap();
        ctx.shutdown().unwrap();
    }

    #[test]
    fn layout_transition_invalidates_cached_descriptor() {
        let (_instance, mut ctx) = context();
        let texture = Texture2D::create(
            &ctx,
            2,
            2,
            ImageFormat::Rgba8Srgb,
            TextureSettings::default(),
            "cached",
        )
        .unwrap();

        let info = texture.descriptor_info();
        assert_eq!(info.image_layout, vk::ImageLayout::UNDEFINED);
        assert_eq!(info.sampler, texture.sampler());
        assert!(texture.has_cached_descriptor());

        texture
            .image()
            .set_layout(&ctx, vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL, None)
            .unwrap();
        assert!(!texture.has_cached_descriptor());
        assert_eq!(
            texture.descriptor_info().image_layout,
            vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL
        );

        texture.destroy(&ctx).unwrap();
        ctx.shutdown().unwrap();
    }

    #[test]
    fn settings_survive_a_round_trip() {
        let (instance, mut ctx) = context();
        let texture = Texture2D::create(
            &ctx,
            2,
            2,
            ImageFormat::Rgba8Unorm,
            TextureSettings::new(TextureWrap::Clamp, TextureFilter::Nearest),
            "source",
        )
        .unwrap();
        let other = Texture2D::create(&ctx, 2, 2, ImageFormat::Rgba8Unorm, TextureSettings::default(), "target")
            .unwrap();

        let bytes = texture.serialize_settings().unwrap();
        let old_sampler = other.sampler();
        assert!(other.deserialize_settings(&ctx, &bytes));
        assert_eq!(other.settings(), texture.settings());
        assert_ne!(other.sampler(), old_sampler);

        texture.destroy(&ctx).unwrap();
        other.destroy(&ctx).unwrap();
        ctx.shutdown().unwrap();
        assert_eq!(instance.device().unwrap().live_objects(), 0);
    }

    #[test]
    fn corrupt_settings_are_reported_not_applied() {
        let (_instance, mut ctx) = context();
        let texture = Texture2D::create(&ctx, 2, 2, ImageFormat::Rgba8Unorm, TextureSettings::default(), "t")
            .unwrap();
        assert!(!texture.deserialize_settings(&ctx, &[0xff]));
        assert_eq!(texture.settings(), TextureSettings::default());
        texture.destroy(&ctx).unwrap();
        ctx.shutdown().unwrap();
    }

    #[test]
    fn reload_replaces_image_and_keeps_observing() {
        let (_instance, mut ctx) = context();
        let texture = Texture2D::create_with_pixels(
            &ctx,
            2,
            2,
            ImageFormat::Rgba8Unorm,
            TextureSettings::default(),
            &checker(2, 2),
            "reloaded",
        )
        .unwrap();
        let old_id = texture.image().id();

        let pixels = checker(8, 4);
        texture.reload(&ctx, 8, 4, &pixels).unwrap();
        assert_ne!(texture.image().id(), old_id);
        assert_eq!(texture.image().extent(), vk::Extent2D { width: 8, height: 4 });

        let info = texture.descriptor_info();
        assert_eq!(info.image_layout, vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL);
        assert!(texture.has_cached_descriptor());
        texture
            .image()
            .set_layout(&ctx, vk::ImageLayout::GENERAL, None)
            .unwrap();
        assert!(!texture.has_cached_descriptor());

        let mut out = vec![0; pixels.len()];
        assert!(texture.image().copy_to(&ctx, &mut out).unwrap());
        assert_eq!(out, pixels);

        texture.destroy(&ctx).unwrap();
        ctx.shutdown().unwrap();
    }

    #[test]
    fn load_decodes_png_files() {
        let (_instance, mut ctx) = context();
        let path = std::env::temp_dir().join(format!("sge-texture-{}.png", std::process::id()));
        ::image::RgbaImage::from_pixel(3, 2, ::image::Rgba([10, 20, 30, 255]))
            .save(&path)
            .unwrap();

        let texture = Texture2D::load(&ctx, &path, TextureSettings::default()).unwrap();
        std::fs::remove_file(&path).unwrap();
        assert_eq!(texture.image().extent(), vk::Extent2D { width: 3, height: 2 });
        assert_eq!(texture.image().format(), ImageFormat::Rgba8Srgb);

        let mut out = vec![0; 24];
        assert!(texture.image().copy_to(&ctx, &mut out).unwrap());
        assert_eq!(&out[..4], &[10, 20, 30, 255]);

        texture.destroy(&ctx).unwrap();
        ctx.shutdown().unwrap();
    }

    #[test]
    fn missing_file_is_an_asset_error() {
        let (_instance, mut ctx) = context();
        let result = Texture2D::load(&ctx, "does/not/exist.png", TextureSettings::default());
        assert!(matches!(result, Err(GpuError::Asset(_))));
        ctx.shutdown().unwrap();
    }
}
