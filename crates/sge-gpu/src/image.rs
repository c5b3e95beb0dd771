//! 2D images and the layout transition protocol.
//!
//! An [`Image2D`] always has exactly one tracked layout, and the only way to
//! change it is [`Image2D::set_layout`] (or a render pass ending, which moves
//! attachments to their final layouts). Every change is broadcast to the
//! image's [`LayoutObserver`]s.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Weak;

use ash::vk;
use gpu_allocator::MemoryLocation;
use sge_core::{ImageFormat, ImageSpec, ImageUsage};

use crate::backend::{ImageBarrier, ImageDesc, ImageViewDesc};
use crate::buffer::GpuBuffer;
use crate::command::{CommandList, QueueKind};
use crate::context::GpuContext;
use crate::error::{GpuError, Result};
use crate::memory::Allocation;

/// Process-unique image identifier.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ImageId(u64);

impl ImageId {
    fn next() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(1);
        Self(NEXT.fetch_add(1, Ordering::Relaxed))
    }

    pub fn raw(self) -> u64 {
        self.0
    }
}

/// Something that caches state derived from an image's layout.
pub trait LayoutObserver: Send + Sync {
    /// Called after the image moved from `old` to `new`.
    fn on_layout_transition(&self, image: ImageId, old: vk::ImageLayout, new: vk::ImageLayout);
}

/// Device format for an [`ImageFormat`].
///
/// Three-channel formats are stored with a padding alpha channel.
pub fn vk_format(format: ImageFormat) -> vk::Format {
    match format {
        ImageFormat::Rgb8Unorm | ImageFormat::Rgba8Unorm => vk::Format::R8G8B8A8_UNORM,
        ImageFormat::Rgb8Srgb | ImageFormat::Rgba8Srgb => vk::Format::R8G8B8A8_SRGB,
        ImageFormat::Bgra8Unorm => vk::Format::B8G8R8A8_UNORM,
        ImageFormat::Bgra8Srgb => vk::Format::B8G8R8A8_SRGB,
        ImageFormat::Depth32Float => vk::Format::D32_SFLOAT,
        ImageFormat::Depth24Stencil8 => vk::Format::D24_UNORM_S8_UINT,
    }
}

/// Device usage flags for an [`ImageUsage`].
pub fn vk_usage(usage: ImageUsage, format: ImageFormat) -> vk::ImageUsageFlags {
    let mut flags = vk::ImageUsageFlags::empty();
    if usage.contains(ImageUsage::TEXTURE) {
        flags |= vk::ImageUsageFlags::SAMPLED;
    }
    if usage.contains(ImageUsage::ATTACHMENT) {
        flags |= if format.is_depth() {
            vk::ImageUsageFlags::DEPTH_STENCIL_ATTACHMENT
        } else {
            vk::ImageUsageFlags::COLOR_ATTACHMENT
        };
    }
    if usage.contains(ImageUsage::STORAGE) {
        flags |= vk::ImageUsageFlags::STORAGE;
    }
    if usage.contains(ImageUsage::TRANSFER_SRC) {
        flags |= vk::ImageUsageFlags::TRANSFER_SRC;
    }
    if usage.contains(ImageUsage::TRANSFER_DST) {
        flags |= vk::ImageUsageFlags::TRANSFER_DST;
    }
    flags
}

fn aspect_for(format: ImageFormat) -> vk::ImageAspectFlags {
    if format.has_stencil() {
        vk::ImageAspectFlags::DEPTH | vk::ImageAspectFlags::STENCIL
    } else if format.is_depth() {
        vk::ImageAspectFlags::DEPTH
    } else {
        vk::ImageAspectFlags::COLOR
    }
}

/// Pipeline stage and access mask that bracket work done in `layout`.
///
/// Layouts outside the table are a fatal [`GpuError::UnsupportedLayout`].
pub fn stage_and_mask(layout: vk::ImageLayout) -> Result<(vk::PipelineStageFlags, vk::AccessFlags)> {
    let pair = match layout {
        vk::ImageLayout::UNDEFINED => (vk::PipelineStageFlags::TOP_OF_PIPE, vk::AccessFlags::empty()),
        vk::ImageLayout::TRANSFER_SRC_OPTIMAL => {
            (vk::PipelineStageFlags::TRANSFER, vk::AccessFlags::TRANSFER_READ)
        }
        vk::ImageLayout::TRANSFER_DST_OPTIMAL => {
            (vk::PipelineStageFlags::TRANSFER, vk::AccessFlags::TRANSFER_WRITE)
        }
        vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL => {
            (vk::PipelineStageFlags::FRAGMENT_SHADER, vk::AccessFlags::SHADER_READ)
        }
        vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL => (
            vk::PipelineStageFlags::ALL_GRAPHICS,
            vk::AccessFlags::COLOR_ATTACHMENT_WRITE | vk::AccessFlags::SHADER_READ,
        ),
        vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL => (
            vk::PipelineStageFlags::ALL_GRAPHICS,
            vk::AccessFlags::DEPTH_STENCIL_ATTACHMENT_WRITE
                | vk::AccessFlags::DEPTH_STENCIL_ATTACHMENT_READ
                | vk::AccessFlags::SHADER_READ,
        ),
        vk::ImageLayout::GENERAL => (
            vk::PipelineStageFlags::ALL_GRAPHICS | vk::PipelineStageFlags::ALL_COMMANDS,
            vk::AccessFlags::SHADER_READ | vk::AccessFlags::SHADER_WRITE,
        ),
        other => return Err(GpuError::UnsupportedLayout(other)),
    };
    Ok(pair)
}

/// Replace graphics-only stages with ALL_COMMANDS when the recording queue
/// family cannot do graphics.
pub fn widen_for_family(
    stage: vk::PipelineStageFlags,
    family_flags: vk::QueueFlags,
) -> vk::PipelineStageFlags {
    let graphics_only = vk::PipelineStageFlags::ALL_GRAPHICS
        | vk::PipelineStageFlags::VERTEX_INPUT
        | vk::PipelineStageFlags::VERTEX_SHADER
        | vk::PipelineStageFlags::FRAGMENT_SHADER
        | vk::PipelineStageFlags::EARLY_FRAGMENT_TESTS
        | vk::PipelineStageFlags::LATE_FRAGMENT_TESTS
        | vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT;
    if family_flags.contains(vk::QueueFlags::GRAPHICS) || !stage.intersects(graphics_only) {
        stage
    } else {
        (stage & !graphics_only) | vk::PipelineStageFlags::ALL_COMMANDS
    }
}

/// A GPU image with one mip chain and a tracked layout.
pub struct Image2D {
    id: ImageId,
    spec: ImageSpec,
    image: vk::Image,
    view: vk::ImageView,
    allocation: Option<Allocation>,
    format: vk::Format,
    usage: vk::ImageUsageFlags,
    aspect: vk::ImageAspectFlags,
    layout: vk::ImageLayout,
    observers: Vec<Weak<dyn LayoutObserver>>,
}

impl Image2D {
    /// Create an image in the UNDEFINED layout.
    ///
    /// Images are shared concurrently between all distinct queue families
    /// of the context.
    pub fn new(ctx: &GpuContext, spec: &ImageSpec, name: &str) -> Result<Self> {
        spec.validate()?;
        let format = vk_format(spec.format);
        let usage = vk_usage(spec.usage, spec.format);
        let aspect = aspect_for(spec.format);
        let families = ctx.unique_queue_families();

        let desc = ImageDesc {
            name,
            extent: vk::Extent2D {
                width: spec.width,
                height: spec.height,
            },
            mip_levels: spec.mip_levels,
            array_layers: spec.array_layers,
            format,
            usage,
            queue_families: &families,
        };
        let (image, allocation) = ctx
            .allocator()
            .lock()
            .alloc_image(&desc, MemoryLocation::GpuOnly)?;

        let view = ctx.device().create_image_view(&ImageViewDesc {
            image,
            format,
            aspect,
            mip_levels: spec.mip_levels,
            array_layers: spec.array_layers,
        });
        let view = match view {
            Ok(view) => view,
            Err(err) => {
                ctx.allocator().lock().free_image(image, allocation)?;
                return Err(err);
            }
        };

        tracing::debug!(
            "Created image '{}' {}x{} {:?} ({:?})",
            name,
            spec.width,
            spec.height,
            spec.format,
            spec.usage
        );

        Ok(Self {
            id: ImageId::next(),
            spec: *spec,
            image,
            view,
            allocation: Some(allocation),
            format,
            usage,
            aspect,
            layout: vk::ImageLayout::UNDEFINED,
            observers: Vec::new(),
        })
    }

    /// Register a non-owning observer of layout transitions.
    pub fn add_observer(&mut self, observer: Weak<dyn LayoutObserver>) {
        self.observers.push(observer);
    }

    /// Number of observers still alive.
    pub fn observer_count(&self) -> usize {
        self.observers
            .iter()
            .filter(|observer| observer.strong_count() > 0)
            .count()
    }

    fn notify(&mut self, old: vk::ImageLayout, new: vk::ImageLayout) {
        let id = self.id;
        self.observers.retain(|observer| match observer.upgrade() {
            Some(observer) => {
                observer.on_layout_transition(id, old, new);
                true
            }
            None => false,
        });
    }

    fn full_range(&self) -> vk::ImageSubresourceRange {
        vk::ImageSubresourceRange {
            aspect_mask: self.aspect,
            base_mip_level: 0,
            level_count: self.spec.mip_levels,
            base_array_layer: 0,
            layer_count: self.spec.array_layers,
        }
    }

    /// The layout this image rests in between uses, derived from its usage.
    pub fn resting_layout(&self) -> vk::ImageLayout {
        let usage = self.spec.usage;
        if usage.contains(ImageUsage::TEXTURE) {
            vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL
        } else if usage.contains(ImageUsage::STORAGE) {
            vk::ImageLayout::GENERAL
        } else if usage.contains(ImageUsage::ATTACHMENT) {
            if self.spec.format.is_depth() {
                vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL
            } else {
                vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL
            }
        } else {
            vk::ImageLayout::TRANSFER_DST_OPTIMAL
        }
    }

    /// Barrier moving the whole image from `old` to `new` on a queue of
    /// `family`. Fails before anything is recorded if either layout is
    /// unsupported.
    fn barrier(
        &self,
        old: vk::ImageLayout,
        new: vk::ImageLayout,
        family: vk::QueueFlags,
    ) -> Result<ImageBarrier> {
        let (src_stage, src_access) = stage_and_mask(old)?;
        let (dst_stage, dst_access) = stage_and_mask(new)?;
        Ok(ImageBarrier {
            image: self.image,
            old_layout: old,
            new_layout: new,
            src_stage: widen_for_family(src_stage, family),
            dst_stage: widen_for_family(dst_stage, family),
            src_access,
            dst_access,
            range: self.full_range(),
        })
    }

    fn commit_layout(&mut self, old: vk::ImageLayout, new: vk::ImageLayout) {
        self.layout = new;
        self.notify(old, new);
    }

    /// Record a transition into `list` and update the tracked layout.
    fn record_transition(&mut self, list: &mut CommandList, new: vk::ImageLayout) -> Result<()> {
        let old = self.layout;
        let barrier = self.barrier(old, new, list.family_flags())?;
        list.image_barrier(&barrier);
        self.commit_layout(old, new);
        Ok(())
    }

    /// Run `before`, `copy` and `after` as one blocking transfer submission.
    ///
    /// Every barrier is built before a context is checked out, and the tracked
    /// layout only follows the transitions once the submission has executed.
    fn run_transfer(
        &mut self,
        ctx: &GpuContext,
        before: &[(vk::ImageLayout, vk::ImageLayout)],
        copy: impl FnOnce(&mut CommandList),
        after: &[(vk::ImageLayout, vk::ImageLayout)],
    ) -> Result<()> {
        let family = ctx.queue(QueueKind::Transfer).lock().family_flags();
        let barriers = |steps: &[(vk::ImageLayout, vk::ImageLayout)]| {
            steps
                .iter()
                .map(|&(old, new)| self.barrier(old, new, family))
                .collect::<Result<Vec<_>>>()
        };
        let before_barriers = barriers(before)?;
        let after_barriers = barriers(after)?;

        let mut list = ctx.get(QueueKind::Transfer)?;
        for barrier in &before_barriers {
            list.image_barrier(barrier);
        }
        copy(&mut list);
        for barrier in &after_barriers {
            list.image_barrier(barrier);
        }
        ctx.submit(list, true)?;

        for &(old, new) in before.iter().chain(after) {
            self.commit_layout(old, new);
        }
        Ok(())
    }

    /// Transition the image to `layout`.
    ///
    /// With a list the barrier is recorded into it. Without one a transfer
    /// context is checked out, the barrier recorded and submitted, and the
    /// call blocks until it has executed.
    #[cfg_attr(
        feature = "profiling-tracy",
        tracing::instrument(level = "trace", skip_all)
    )]
    pub fn set_layout(
        &mut self,
        ctx: &GpuContext,
        layout: vk::ImageLayout,
        list: Option<&mut CommandList>,
    ) -> Result<()> {
        match list {
            Some(list) => self.record_transition(list, layout),
            None => {
                let current = self.layout;
                self.run_transfer(ctx, &[(current, layout)], |_| {}, &[])
            }
        }
    }

    /// Record that the device moved the image to `layout` on its own, as a
    /// render pass does for its attachments.
    pub(crate) fn assume_layout(&mut self, layout: vk::ImageLayout) {
        let old = self.layout;
        self.layout = layout;
        if old != layout {
            self.notify(old, layout);
        }
    }

    /// Buffer copies address one aspect; depth-stencil images move their
    /// depth plane.
    fn copy_aspect(&self) -> vk::ImageAspectFlags {
        if self.aspect.contains(vk::ImageAspectFlags::DEPTH) {
            vk::ImageAspectFlags::DEPTH
        } else {
            self.aspect
        }
    }

    fn copy_region(&self, layers: u32) -> vk::BufferImageCopy {
        vk::BufferImageCopy {
            buffer_offset: 0,
            buffer_row_length: 0,
            buffer_image_height: 0,
            image_subresource: vk::ImageSubresourceLayers {
                aspect_mask: self.copy_aspect(),
                mip_level: 0,
                base_array_layer: 0,
                layer_count: layers,
            },
            image_offset: vk::Offset3D::default(),
            image_extent: vk::Extent3D {
                width: self.spec.width,
                height: self.spec.height,
                depth: 1,
            },
        }
    }

    /// Upload mip level 0 of every layer from host memory.
    ///
    /// Blocks until the upload has executed. Images with more than one mip
    /// level are rejected before any device work.
    #[cfg_attr(
        feature = "profiling-tracy",
        tracing::instrument(level = "trace", skip_all)
    )]
    pub fn copy_from(&mut self, ctx: &GpuContext, data: &[u8]) -> Result<()> {
        if self.spec.mip_levels > 1 {
            return Err(GpuError::MultiMipCopy(self.spec.mip_levels));
        }
        let expected = self.spec.byte_size();
        if data.len() as u64 != expected {
            return Err(GpuError::InvalidDescription(format!(
                "image upload needs {expected} bytes, got {}",
                data.len()
            )));
        }

        let mut staging = GpuBuffer::new(
            ctx,
            expected,
            vk::BufferUsageFlags::TRANSFER_SRC,
            MemoryLocation::CpuToGpu,
            "image upload staging",
        )?;
        let result = staging
            .write_bytes(0, data)
            .and_then(|()| self.upload_from(ctx, &staging));
        staging.destroy(ctx)?;
        result
    }

    fn upload_from(&mut self, ctx: &GpuContext, staging: &GpuBuffer) -> Result<()> {
        let dst = vk::ImageLayout::TRANSFER_DST_OPTIMAL;
        let mut before = Vec::new();
        let mut prior = self.layout;
        if prior == vk::ImageLayout::UNDEFINED {
            before.push((prior, self.resting_layout()));
            prior = self.resting_layout();
        }
        let mut after = Vec::new();
        if prior != dst {
            before.push((prior, dst));
            after.push((dst, prior));
        }

        let (image, region) = (self.image, self.copy_region(self.spec.array_layers));
        self.run_transfer(
            ctx,
            &before,
            |list| list.copy_buffer_to_image(staging.handle(), image, dst, region),
            &after,
        )
    }

    /// Read mip level 0 of layer 0 back into `out`.
    ///
    /// Returns `Ok(false)` without touching the device when the image was not
    /// created with [`ImageUsage::TRANSFER_SRC`]. Blocks until the readback
    /// has executed.
    #[cfg_attr(
        feature = "profiling-tracy",
        tracing::instrument(level = "trace", skip_all)
    )]
    pub fn copy_to(&mut self, ctx: &GpuContext, out: &mut [u8]) -> Result<bool> {
        if !self.spec.usage.contains(ImageUsage::TRANSFER_SRC) {
            tracing::debug!("copy_to on image {:?} without TRANSFER_SRC usage", self.id);
            return Ok(false);
        }
        let expected = self.spec.layer_byte_size();
        if out.len() as u64 != expected {
            return Err(GpuError::InvalidDescription(format!(
                "image readback needs {expected} bytes, got {}",
                out.len()
            )));
        }

        let mut staging = GpuBuffer::new(
            ctx,
            expected,
            vk::BufferUsageFlags::TRANSFER_DST,
            MemoryLocation::GpuToCpu,
            "image readback staging",
        )?;
        let result = self
            .readback_into(ctx, &staging)
            .and_then(|()| staging.read_bytes(0, out));
        staging.destroy(ctx)?;
        result.map(|()| true)
    }

    fn readback_into(&mut self, ctx: &GpuContext, staging: &GpuBuffer) -> Result<()> {
        let src = vk::ImageLayout::TRANSFER_SRC_OPTIMAL;
        let prior = self.layout;
        let restore = if prior == vk::ImageLayout::UNDEFINED {
            self.resting_layout()
        } else {
            prior
        };
        let mut before = Vec::new();
        if prior != src {
            before.push((prior, src));
        }
        let mut after = Vec::new();
        if restore != src {
            after.push((src, restore));
        }

        let (image, region) = (self.image, self.copy_region(1));
        self.run_transfer(
            ctx,
            &before,
            |list| list.copy_image_to_buffer(image, src, staging.handle(), region),
            &after,
        )
    }

    pub fn id(&self) -> ImageId {
        self.id
    }

    pub fn width(&self) -> u32 {
        self.spec.width
    }

    pub fn height(&self) -> u32 {
        self.spec.height
    }

    pub fn extent(&self) -> vk::Extent2D {
        vk::Extent2D {
            width: self.spec.width,
            height: self.spec.height,
        }
    }

    pub fn format(&self) -> ImageFormat {
        self.spec.format
    }

    pub fn vk_format(&self) -> vk::Format {
        self.format
    }

    pub fn mip_levels(&self) -> u32 {
        self.spec.mip_levels
    }

    pub fn array_layers(&self) -> u32 {
        self.spec.array_layers
    }

    /// Current tracked layout.
    pub fn layout(&self) -> vk::ImageLayout {
        self.layout
    }

    pub fn usage(&self) -> ImageUsage {
        self.spec.usage
    }

    pub fn vk_usage(&self) -> vk::ImageUsageFlags {
        self.usage
    }

    pub fn spec(&self) -> &ImageSpec {
        &self.spec
    }

    /// Raw image handle.
    pub fn handle(&self) -> vk::Image {
        self.image
    }

    pub fn view(&self) -> vk::ImageView {
        self.view
    }

    /// Destroy the view and release the image memory.
    ///
    /// The device must no longer use the image. Calling this twice is a no-op.
    pub fn destroy(&mut self, ctx: &GpuContext) -> Result<()> {
        let Some(allocation) = self.allocation.take() else {
            return Ok(());
        };
        ctx.device().destroy_image_view(self.view);
        self.view = vk::ImageView::null();
        ctx.allocator().lock().free_image(self.image, allocation)?;
        self.image = vk::Image::null();
        Ok(())
    }
}

impl Drop for Image2D {
    fn drop(&mut self) {
        if self.allocation.is_some() {
            tracing::warn!("Image {:?} dropped without destroy; its memory leaks", self.id);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use parking_lot::Mutex;

    use super::*;
    use crate::backend::soft::{SoftAdapter, SoftInstance};
    use crate::context::GpuContextBuilder;

    fn context() -> (Arc<SoftInstance>, GpuContext) {
        let instance = Arc::new(SoftInstance::single());
        let ctx = GpuContextBuilder::new()
            .headless(true)
            .build_with(instance.clone())
            .unwrap();
        (instance, ctx)
    }

    fn pattern(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i * 7 % 251) as u8).collect()
    }

    #[derive(Default)]
    struct Recorder(Mutex<Vec<(vk::ImageLayout, vk::ImageLayout)>>);

    impl LayoutObserver for Recorder {
        fn on_layout_transition(&self, _image: ImageId, old: vk::ImageLayout, new: vk::ImageLayout) {
            self.0.lock().push((old, new));
        }
    }

    #[test]
    fn layout_table() {
        use vk::AccessFlags as A;
        use vk::ImageLayout as L;
        use vk::PipelineStageFlags as S;

        let cases = [
            (L::UNDEFINED, S::TOP_OF_PIPE, A::empty()),
            (L::TRANSFER_SRC_OPTIMAL, S::TRANSFER, A::TRANSFER_READ),
            (L::TRANSFER_DST_OPTIMAL, S::TRANSFER, A::TRANSFER_WRITE),
            (L::SHADER_READ_ONLY_OPTIMAL, S::FRAGMENT_SHADER, A::SHADER_READ),
            (
                L::COLOR_ATTACHMENT_OPTIMAL,
                S::ALL_GRAPHICS,
                A::COLOR_ATTACHMENT_WRITE | A::SHADER_READ,
            ),
            (
                L::DEPTH_STENCIL_ATTACHMENT_OPTIMAL,
                S::ALL_GRAPHICS,
                A::DEPTH_STENCIL_ATTACHMENT_WRITE
                    | A::DEPTH_STENCIL_ATTACHMENT_READ
                    | A::SHADER_READ,
            ),
            (
                L::GENERAL,
                S::ALL_GRAPHICS | S::ALL_COMMANDS,
                A::SHADER_READ | A::SHADER_WRITE,
            ),
        ];
        for (layout, stage, access) in cases {
            assert_eq!(stage_and_mask(layout).unwrap(), (stage, access), "{layout:?}");
        }
    }

    #[test]
    fn unlisted_layouts_are_fatal() {
        for layout in [
            vk::ImageLayout::PRESENT_SRC_KHR,
            vk::ImageLayout::PREINITIALIZED,
            vk::ImageLayout::DEPTH_READ_ONLY_OPTIMAL,
        ] {
            let err = stage_and_mask(layout).unwrap_err();
            assert!(matches!(err, GpuError::UnsupportedLayout(l) if l == layout));
            assert!(err.is_fatal());
        }
    }

    #[test]
    fn graphics_stages_widen_on_transfer_queues() {
        let fragment = vk::PipelineStageFlags::FRAGMENT_SHADER;
        assert_eq!(
            widen_for_family(fragment, vk::QueueFlags::TRANSFER),
            vk::PipelineStageFlags::ALL_COMMANDS
        );
        assert_eq!(widen_for_family(fragment, vk::QueueFlags::GRAPHICS), fragment);
        assert_eq!(
            widen_for_family(vk::PipelineStageFlags::TRANSFER, vk::QueueFlags::TRANSFER),
            vk::PipelineStageFlags::TRANSFER
        );
    }

    #[test]
    fn format_and_usage_mapping() {
        assert_eq!(vk_format(ImageFormat::Rgb8Unorm), vk::Format::R8G8B8A8_UNORM);
        assert_eq!(vk_format(ImageFormat::Rgb8Srgb), vk::Format::R8G8B8A8_SRGB);
        assert_eq!(
            vk_usage(ImageUsage::TEXTURE | ImageUsage::TRANSFER, ImageFormat::Rgba8Unorm),
            vk::ImageUsageFlags::SAMPLED
                | vk::ImageUsageFlags::TRANSFER_SRC
                | vk::ImageUsageFlags::TRANSFER_DST
        );
        assert_eq!(
            vk_usage(ImageUsage::ATTACHMENT, ImageFormat::Depth32Float),
            vk::ImageUsageFlags::DEPTH_STENCIL_ATTACHMENT
        );
    }

    #[test]
    fn empty_usage_is_rejected() {
        let (_instance, mut ctx) = context();
        let spec = ImageSpec::new(4, 4, ImageFormat::Rgba8Unorm, ImageUsage::empty());
        assert!(matches!(
            Image2D::new(&ctx, &spec, "bad"),
            Err(GpuError::InvalidDescription(msg)) if msg.contains("must provide usage flags")
        ));
        ctx.shutdown().unwrap();
    }

    #[test]
    fn upload_then_readback_is_identical() {
        let (instance, mut ctx) = context();
        let spec = ImageSpec::new(8, 4, ImageFormat::Rgba8Unorm, ImageUsage::TEXTURE | ImageUsage::TRANSFER);
        let mut image = Image2D::new(&ctx, &spec, "roundtrip").unwrap();
        let data = pattern(spec.byte_size() as usize);

        image.copy_from(&ctx, &data).unwrap();
        assert_eq!(image.layout(), vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL);

        let mut out = vec![0; data.len()];
        assert!(image.copy_to(&ctx, &mut out).unwrap());
        assert_eq!(out, data);
        assert_eq!(image.layout(), vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL);

        image.destroy(&ctx).unwrap();
        ctx.shutdown().unwrap();
        let soft = instance.device().unwrap();
        assert!(soft.validation_errors().is_empty(), "{:?}", soft.validation_errors());
    }

    #[test]
    fn upload_records_the_expected_barriers() {
        let (instance, mut ctx) = context();
        let soft = instance.device().unwrap();
        let spec = ImageSpec::new(2, 2, ImageFormat::Rgba8Srgb, ImageUsage::TEXTURE | ImageUsage::TRANSFER_DST);
        let mut image = Image2D::new(&ctx, &spec, "traced").unwrap();
        soft.take_trace();

        image.copy_from(&ctx, &[0; 16]).unwrap();
        insta::assert_debug_snapshot!(soft.take_trace(), @r###"
        [
            "barrier UNDEFINED -> SHADER_READ_ONLY_OPTIMAL",
            "barrier SHADER_READ_ONLY_OPTIMAL -> TRANSFER_DST_OPTIMAL",
            "copy buffer -> image 2x2 layers 1",
            "barrier TRANSFER_DST_OPTIMAL -> SHADER_READ_ONLY_OPTIMAL",
            "submit",
        ]
        "###);

        image.destroy(&ctx).unwrap();
        ctx.shutdown().unwrap();
    }

    #[test]
    fn readback_without_transfer_src_is_a_no_op() {
        let (instance, mut ctx) = context();
        let soft = instance.device().unwrap();
        let spec = ImageSpec::new(4, 4, ImageFormat::Rgba8Unorm, ImageUsage::TEXTURE);
        let mut image = Image2D::new(&ctx, &spec, "sampled").unwrap();

        let calls = soft.device_calls();
        let mut out = vec![0; 64];
        assert!(!image.copy_to(&ctx, &mut out).unwrap());
        assert_eq!(soft.device_calls(), calls);
        assert_eq!(image.layout(), vk::ImageLayout::UNDEFINED);

        image.destroy(&ctx).unwrap();
        ctx.shutdown().unwrap();
    }

    #[test]
    fn readback_from_undefined_restores_resting_layout() {
        let (_instance, mut ctx) = context();
        let spec = ImageSpec::new(2, 2, ImageFormat::Rgba8Unorm, ImageUsage::STORAGE | ImageUsage::TRANSFER_SRC);
        let mut image = Image2D::new(&ctx, &spec, "storage").unwrap();
        let mut out = vec![0; 16];
        assert!(image.copy_to(&ctx, &mut out).unwrap());
        assert_eq!(image.layout(), vk::ImageLayout::GENERAL);
        image.destroy(&ctx).unwrap();
        ctx.shutdown().unwrap();
    }

    #[test]
    fn multi_mip_upload_fails_before_device_work() {
        let (instance, mut ctx) = context();
        let soft = instance.device().unwrap();
        let spec = ImageSpec::new(4, 4, ImageFormat::Rgba8Unorm, ImageUsage::TEXTURE | ImageUsage::TRANSFER)
            .with_mip_levels(3);
        let mut image = Image2D::new(&ctx, &spec, "mipped").unwrap();

        let calls = soft.device_calls();
        let err = image.copy_from(&ctx, &[0; 64]).unwrap_err();
        assert!(matches!(err, GpuError::MultiMipCopy(3)));
        assert!(err.is_fatal());
        assert_eq!(soft.device_calls(), calls);

        image.destroy(&ctx).unwrap();
        ctx.shutdown().unwrap();
    }

    #[test]
    fn upload_size_mismatch_is_rejected() {
        let (_instance, mut ctx) = context();
        let spec = ImageSpec::new(4, 4, ImageFormat::Rgba8Unorm, ImageUsage::TEXTURE | ImageUsage::TRANSFER);
        let mut image = Image2D::new(&ctx, &spec, "sized").unwrap();
        assert!(matches!(
            image.copy_from(&ctx, &[0; 10]),
            Err(GpuError::InvalidDescription(_))
        ));
        image.destroy(&ctx).unwrap();
        ctx.shutdown().unwrap();
    }

    #[test]
    fn observers_are_notified_and_pruned() {
        let (_instance, mut ctx) = context();
        let spec = ImageSpec::new(2, 2, ImageFormat::Rgba8Unorm, ImageUsage::STORAGE);
        let mut image = Image2D::new(&ctx, &spec, "observed").unwrap();

        let kept = Arc::new(Recorder::default());
        let dropped = Arc::new(Recorder::default());
        let kept_weak: Weak<dyn LayoutObserver> = Arc::downgrade(&kept) as Weak<dyn LayoutObserver>;
        let dropped_weak: Weak<dyn LayoutObserver> = Arc::downgrade(&dropped) as Weak<dyn LayoutObserver>;
        image.add_observer(kept_weak);
        image.add_observer(dropped_weak);
        drop(dropped);

        image.set_layout(&ctx, vk::ImageLayout::GENERAL, None).unwrap();
        assert_eq!(
            *kept.0.lock(),
            vec![(vk::ImageLayout::UNDEFINED, vk::ImageLayout::GENERAL)]
        );
        assert_eq!(image.observer_count(), 1);
        assert_eq!(image.observers.len(), 1);

        image.destroy(&ctx).unwrap();
        ctx.shutdown().unwrap();
    }

    #[test]
    fn recorded_transition_lands_in_the_given_list() {
        let (instance, mut ctx) = context();
        let soft = instance.device().unwrap();
        let spec = ImageSpec::new(2, 2, ImageFormat::Rgba8Unorm, ImageUsage::ATTACHMENT);
        let mut image = Image2D::new(&ctx, &spec, "attachment").unwrap();

        let mut list = ctx.get(QueueKind::Graphics).unwrap();
        image
            .set_layout(&ctx, vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL, Some(&mut list))
            .unwrap();
        // Tracked immediately, executed once submitted.
        assert_eq!(image.layout(), vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL);
        assert_eq!(soft.image_layout(image.handle()), Some(vk::ImageLayout::UNDEFINED));
        ctx.submit(list, true).unwrap();
        assert_eq!(
            soft.image_layout(image.handle()),
            Some(vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL)
        );

        image.destroy(&ctx).unwrap();
        ctx.shutdown().unwrap();
    }

    #[test]
    fn rejected_standalone_transition_changes_nothing() {
        let (instance, mut ctx) = context();
        let soft = instance.device().unwrap();
        let spec = ImageSpec::new(2, 2, ImageFormat::Rgba8Unorm, ImageUsage::STORAGE);
        let mut image = Image2D::new(&ctx, &spec, "rejected").unwrap();
        let recorder = Arc::new(Recorder::default());
        image.add_observer(Arc::downgrade(&recorder) as Weak<dyn LayoutObserver>);

        let calls = soft.device_calls();
        for _ in 0..3 {
            let err = image
                .set_layout(&ctx, vk::ImageLayout::PRESENT_SRC_KHR, None)
                .unwrap_err();
            assert!(matches!(err, GpuError::UnsupportedLayout(vk::ImageLayout::PRESENT_SRC_KHR)));
        }
        assert_eq!(soft.device_calls(), calls);
        assert_eq!(image.layout(), vk::ImageLayout::UNDEFINED);
        assert!(recorder.0.lock().is_empty());
        assert!(ctx.queue(QueueKind::Transfer).lock().is_empty());

        image.set_layout(&ctx, vk::ImageLayout::GENERAL, None).unwrap();
        let transfer = ctx.queue(QueueKind::Transfer).lock();
        assert_eq!((transfer.len(), transfer.free_count()), (1, 1));
        drop(transfer);

        image.destroy(&ctx).unwrap();
        ctx.shutdown().unwrap();
        assert!(soft.validation_errors().is_empty());
    }

    #[test]
    fn depth_stencil_copies_address_the_depth_aspect() {
        let (instance, mut ctx) = context();
        let soft = instance.device().unwrap();
        let spec = ImageSpec::new(
            2,
            2,
            ImageFormat::Depth24Stencil8,
            ImageUsage::ATTACHMENT | ImageUsage::TRANSFER,
        );
        let mut image = Image2D::new(&ctx, &spec, "depth").unwrap();
        assert_eq!(
            image.copy_region(1).image_subresource.aspect_mask,
            vk::ImageAspectFlags::DEPTH
        );

        let data = pattern(16);
        image.copy_from(&ctx, &data).unwrap();
        let mut out = vec![0; 16];
        assert!(image.copy_to(&ctx, &mut out).unwrap());
        assert_eq!(out, data);
        assert_eq!(image.layout(), vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL);

        image.destroy(&ctx).unwrap();
        ctx.shutdown().unwrap();
        assert!(soft.validation_errors().is_empty());
    }

    #[test]
    fn transfer_only_family_gets_widened_barriers() {
        let instance = Arc::new(SoftInstance::new(vec![SoftAdapter::new("gpu")
            .with_queue_families(vec![vk::QueueFlags::GRAPHICS, vk::QueueFlags::TRANSFER])]));
        let mut ctx = GpuContextBuilder::new()
            .headless(true)
            .build_with(instance.clone())
            .unwrap();
        assert_eq!(ctx.transfer_queue_family(), 1);

        let spec = ImageSpec::new(2, 2, ImageFormat::Rgba8Unorm, ImageUsage::TEXTURE | ImageUsage::TRANSFER);
        let mut image = Image2D::new(&ctx, &spec, "shared").unwrap();
        let data = pattern(16);
        image.copy_from(&ctx, &data).unwrap();
        let mut out = vec![0; 16];
        assert!(image.copy_to(&ctx, &mut out).unwrap());
        assert_eq!(out, data);

        image.destroy(&ctx).unwrap();
        ctx.shutdown().unwrap();
        assert!(instance.device().unwrap().validation_errors().is_empty());
    }
}
