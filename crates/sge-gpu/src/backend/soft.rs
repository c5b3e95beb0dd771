//! Software device backend.
//!
//! Emulates the device contract on the CPU: memory is plain byte storage,
//! recorded commands are replayed when a fence is waited on, and image
//! layouts are tracked so that barrier mismatches show up in
//! [`SoftDevice::validation_errors`]. Presentation goes to virtual surfaces
//! whose size a test can change to force swapchain recreation.
//!
//! Submissions from every queue land in one FIFO and only execute on
//! [`DeviceBackend::wait_for_fence`], [`DeviceBackend::wait_idle`],
//! presentation or [`SoftDevice::complete`]. Until then their fences stay
//! unsignaled, which lets tests observe in-flight state deterministically.

use std::collections::{HashMap, HashSet, VecDeque};
use std::ffi::CStr;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use ash::vk::{self, Handle};
use gpu_allocator::MemoryLocation;
use parking_lot::Mutex;

use super::{
    AcquiredImage, AllocationId, BufferDesc, DeviceBackend, FramebufferDesc,
    GraphicsPipelineDesc, ImageBarrier, ImageDesc, ImageViewDesc, InstanceBackend, MemoryBlock,
    RenderPassBegin, RenderPassDesc, SamplerDesc, SubmitDesc, SurfaceCapabilities,
    SwapchainDesc, WindowHandles,
};
use crate::device::{DeviceCreateDesc, DeviceRequest, SWAPCHAIN_EXTENSION};
use crate::error::{GpuError, Result};
use crate::physical_device::{GpuVendor, PhysicalDevice};

const SPIRV_MAGIC: u32 = 0x0723_0203;

static NEXT_HANDLE: AtomicU64 = AtomicU64::new(1);

fn next_raw() -> u64 {
    NEXT_HANDLE.fetch_add(1, Ordering::Relaxed)
}

fn new_handle<T: Handle>() -> T {
    T::from_raw(next_raw())
}

/// Description of one emulated adapter.
#[derive(Clone, Debug)]
pub struct SoftAdapter {
    pub name: String,
    pub vendor_id: u32,
    pub device_type: vk::PhysicalDeviceType,
    pub queue_families: Vec<vk::QueueFlags>,
    pub extensions: Vec<String>,
    pub layers: Vec<String>,
    pub features: vk::PhysicalDeviceFeatures,
    pub device_local_mb: u64,
    /// Device functions that fail to resolve.
    pub missing_functions: Vec<String>,
}

impl SoftAdapter {
    /// A discrete adapter with one universal queue family and swapchain support.
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            vendor_id: 0x10005,
            device_type: vk::PhysicalDeviceType::DISCRETE_GPU,
            queue_families: vec![
                vk::QueueFlags::GRAPHICS | vk::QueueFlags::COMPUTE | vk::QueueFlags::TRANSFER,
            ],
            extensions: vec![SWAPCHAIN_EXTENSION.to_string()],
            layers: Vec::new(),
            features: vk::PhysicalDeviceFeatures {
                geometry_shader: vk::TRUE,
                sampler_anisotropy: vk::TRUE,
                ..Default::default()
            },
            device_local_mb: 4096,
            missing_functions: Vec::new(),
        }
    }

    pub fn with_device_type(mut self, device_type: vk::PhysicalDeviceType) -> Self {
        self.device_type = device_type;
        self
    }

    pub fn with_queue_families(mut self, families: Vec<vk::QueueFlags>) -> Self {
        self.queue_families = families;
        self
    }

    pub fn with_extensions(mut self, extensions: &[&str]) -> Self {
        self.extensions = extensions.iter().map(ToString::to_string).collect();
        self
    }

    pub fn with_layers(mut self, layers: &[&str]) -> Self {
        self.layers = layers.iter().map(ToString::to_string).collect();
        self
    }

    /// Report no optional base features.
    pub fn without_features(mut self) -> Self {
        self.features = vk::PhysicalDeviceFeatures::default();
        self
    }

    pub fn with_missing_function(mut self, name: &str) -> Self {
        self.missing_functions.push(name.to_string());
        self
    }
}

type SurfaceMap = Arc<Mutex<HashMap<u64, vk::Extent2D>>>;

/// Software instance.
pub struct SoftInstance {
    adapters: Vec<(vk::PhysicalDevice, SoftAdapter)>,
    surfaces: SurfaceMap,
    devices: Mutex<Vec<Arc<SoftDevice>>>,
}

impl SoftInstance {
    pub fn new(adapters: Vec<SoftAdapter>) -> Self {
        Self {
            adapters: adapters
                .into_iter()
                .map(|adapter| (new_handle(), adapter))
                .collect(),
            surfaces: Arc::new(Mutex::new(HashMap::new())),
            devices: Mutex::new(Vec::new()),
        }
    }

    /// Instance with one default adapter.
    pub fn single() -> Self {
        Self::new(vec![SoftAdapter::new("Soft GPU")])
    }

    /// Create a device on the first adapter with every family and no extras.
    pub fn create_default_device(&self) -> Arc<dyn DeviceBackend> {
        let (handle, adapter) = &self.adapters[0];
        let family_count = u32::try_from(adapter.queue_families.len()).unwrap_or(u32::MAX);
        let desc = DeviceCreateDesc {
            queue_families: (0..family_count).collect(),
            extensions: adapter.extensions.clone(),
            layers: Vec::new(),
            features: Default::default(),
        };
        let device = Arc::new(SoftDevice::new(adapter.clone(), *handle, desc, self.surfaces.clone()));
        self.devices.lock().push(device.clone());
        device
    }

    /// Request that makes the default renderer configuration work here.
    pub fn default_request() -> DeviceRequest {
        DeviceRequest {
            queue_flags: vk::QueueFlags::GRAPHICS | vk::QueueFlags::TRANSFER,
            required_extensions: vec![SWAPCHAIN_EXTENSION.to_string()],
            ..Default::default()
        }
    }

    /// Most recently created device.
    pub fn device(&self) -> Option<Arc<SoftDevice>> {
        self.devices.lock().last().cloned()
    }

    /// Create a surface not backed by any window.
    pub fn create_virtual_surface(&self, width: u32, height: u32) -> vk::SurfaceKHR {
        let surface: vk::SurfaceKHR = new_handle();
        self.surfaces
            .lock()
            .insert(surface.as_raw(), vk::Extent2D { width, height });
        surface
    }

    /// Simulate the window behind `surface` being resized.
    pub fn set_surface_extent(&self, surface: vk::SurfaceKHR, width: u32, height: u32) {
        self.surfaces
            .lock()
            .insert(surface.as_raw(), vk::Extent2D { width, height });
    }

    /// Number of surfaces not yet destroyed.
    pub fn live_surfaces(&self) -> usize {
        self.surfaces.lock().len()
    }
}

impl InstanceBackend for SoftInstance {
    fn name(&self) -> &'static str {
        "soft"
    }

    fn enumerate_physical_devices(&self) -> Result<Vec<PhysicalDevice>> {
        Ok(self
            .adapters
            .iter()
            .map(|(handle, adapter)| PhysicalDevice {
                handle: *handle,
                name: adapter.name.clone(),
                vendor: GpuVendor::from_vendor_id(adapter.vendor_id),
                device_type: adapter.device_type,
                api_version: vk::API_VERSION_1_3,
                queue_families: adapter
                    .queue_families
                    .iter()
                    .map(|&queue_flags| vk::QueueFamilyProperties {
                        queue_flags,
                        queue_count: 1,
                        ..Default::default()
                    })
                    .collect(),
                extensions: adapter.extensions.iter().cloned().collect(),
                layers: adapter.layers.iter().cloned().collect(),
                features: adapter.features,
                device_local_mb: adapter.device_local_mb,
            })
            .collect())
    }

    fn create_device(
        &self,
        physical: &PhysicalDevice,
        desc: &DeviceCreateDesc,
    ) -> Result<Arc<dyn DeviceBackend>> {
        let (handle, adapter) = self
            .adapters
            .iter()
            .find(|(handle, _)| *handle == physical.handle)
            .ok_or_else(|| GpuError::DeviceCreation(format!("unknown adapter {}", physical.name)))?;
        let device = Arc::new(SoftDevice::new(
            adapter.clone(),
            *handle,
            desc.clone(),
            self.surfaces.clone(),
        ));
        self.devices.lock().push(device.clone());
        Ok(device as Arc<dyn DeviceBackend>)
    }

    fn create_surface(&self, _window: &dyn WindowHandles) -> Result<vk::SurfaceKHR> {
        Err(GpuError::SurfaceCreation(
            "the software backend has no window system; use a virtual surface".to_string(),
        ))
    }

    fn destroy_surface(&self, surface: vk::SurfaceKHR) {
        self.surfaces.lock().remove(&surface.as_raw());
    }
}

#[derive(Clone, Debug)]
enum Command {
    Barrier(ImageBarrier),
    CopyBuffer {
        src: u64,
        dst: u64,
        region: vk::BufferCopy,
    },
    CopyBufferToImage {
        src: u64,
        dst: u64,
        layout: vk::ImageLayout,
        region: vk::BufferImageCopy,
    },
    CopyImageToBuffer {
        src: u64,
        layout: vk::ImageLayout,
        dst: u64,
        region: vk::BufferImageCopy,
    },
    BeginRenderPass(RenderPassBegin),
    EndRenderPass,
    Draw,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum RecordState {
    Initial,
    Recording,
    Executable,
}

struct Recording {
    pool: u64,
    state: RecordState,
    commands: Vec<Command>,
}

struct Memory {
    location: MemoryLocation,
    data: Vec<u8>,
}

struct SoftImage {
    extent: vk::Extent2D,
    format: vk::Format,
    array_layers: u32,
    layout: vk::ImageLayout,
    data: Vec<u8>,
    owned: bool,
}

impl SoftImage {
    fn layer_bytes(&self) -> usize {
        self.extent.width as usize * self.extent.height as usize * 4
    }
}

struct Pending {
    command_buffer: u64,
    commands: Vec<Command>,
    fence: u64,
}

struct SoftSwapchain {
    surface: u64,
    extent: vk::Extent2D,
    images: Vec<u64>,
    next: u32,
}

#[derive(Default)]
struct State {
    queues: HashMap<u32, vk::Queue>,
    memory: HashMap<AllocationId, Memory>,
    buffers: HashMap<u64, AllocationId>,
    images: HashMap<u64, SoftImage>,
    views: HashMap<u64, u64>,
    samplers: HashSet<u64>,
    pools: HashSet<u64>,
    command_buffers: HashMap<u64, Recording>,
    fences: HashMap<u64, bool>,
    semaphores: HashSet<u64>,
    pending: VecDeque<Pending>,
    render_passes: HashMap<u64, RenderPassDesc>,
    framebuffers: HashMap<u64, Vec<u64>>,
    shader_modules: HashSet<u64>,
    pipelines: HashSet<u64>,
    swapchains: HashMap<u64, SoftSwapchain>,
    trace: Vec<String>,
    validation_errors: Vec<String>,
    next_allocation: u64,
    presents: usize,
    draws: usize,
}

impl State {
    fn invalid(&mut self, message: String) {
        tracing::warn!("soft validation: {}", message);
        self.validation_errors.push(message);
    }

    fn record(&mut self, cmd: vk::CommandBuffer, command: Command, trace: String) {
        let accepted = match self.command_buffers.get_mut(&cmd.as_raw()) {
            Some(recording) if recording.state == RecordState::Recording => {
                recording.commands.push(command);
                true
            }
            _ => false,
        };
        if accepted {
            self.trace.push(trace);
        } else {
            self.invalid(format!("command recorded into {cmd:?} outside of recording"));
        }
    }

    fn run_front(&mut self) -> bool {
        let Some(pending) = self.pending.pop_front() else {
            return false;
        };
        self.execute(pending.commands);
        if let Some(signaled) = self.fences.get_mut(&pending.fence) {
            *signaled = true;
        }
        true
    }

    fn run_all(&mut self) {
        while self.run_front() {}
    }

    fn execute(&mut self, commands: Vec<Command>) {
        let mut active: Option<RenderPassBegin> = None;
        for command in commands {
            match command {
                Command::Barrier(barrier) => self.execute_barrier(&barrier),
                Command::CopyBuffer { src, dst, region } => {
                    let Some(bytes) = self.buffer_bytes(src, region.src_offset, region.size) else {
                        continue;
                    };
                    self.write_buffer(dst, region.dst_offset, &bytes);
                }
                Command::CopyBufferToImage {
                    src,
                    dst,
                    layout,
                    region,
                } => self.execute_upload(src, dst, layout, &region),
                Command::CopyImageToBuffer {
                    src,
                    layout,
                    dst,
                    region,
                } => self.execute_readback(src, layout, dst, &region),
                Command::BeginRenderPass(begin) => {
                    if active.is_some() {
                        self.invalid("render pass begun inside another".to_string());
                    }
                    active = Some(begin);
                }
                Command::EndRenderPass => match active.take() {
                    Some(begin) => self.resolve_render_pass(&begin),
                    None => self.invalid("render pass ended while none is active".to_string()),
                },
                Command::Draw => self.draws += 1,
            }
        }
    }

    fn execute_barrier(&mut self, barrier: &ImageBarrier) {
        let raw = barrier.image.as_raw();
        let Some(image) = self.images.get_mut(&raw) else {
            self.invalid(format!("barrier on unknown image {raw:#x}"));
            return;
        };
        let current = image.layout;
        image.layout = barrier.new_layout;
        if barrier.old_layout != vk::ImageLayout::UNDEFINED && barrier.old_layout != current {
            self.invalid(format!(
                "image {raw:#x}: barrier from {:?} but image is in {current:?}",
                barrier.old_layout
            ));
        }
    }

    fn buffer_bytes(&mut self, buffer: u64, offset: u64, size: u64) -> Option<Vec<u8>> {
        let range = to_range(offset, size);
        let bytes = self
            .buffers
            .get(&buffer)
            .and_then(|id| self.memory.get(id))
            .and_then(|memory| memory.data.get(range.clone()))
            .map(<[u8]>::to_vec);
        if bytes.is_none() {
            self.invalid(format!("read of {range:?} from buffer {buffer:#x} out of bounds"));
        }
        bytes
    }

    fn write_buffer(&mut self, buffer: u64, offset: u64, bytes: &[u8]) {
        let range = to_range(offset, bytes.len() as u64);
        let target = self
            .buffers
            .get(&buffer)
            .and_then(|id| self.memory.get_mut(id))
            .and_then(|memory| memory.data.get_mut(range.clone()));
        match target {
            Some(target) => target.copy_from_slice(bytes),
            None => self.invalid(format!("write of {range:?} to buffer {buffer:#x} out of bounds")),
        }
    }

    /// Byte range of the image layers a copy region touches.
    fn image_range(
        &mut self,
        image: u64,
        layout: vk::ImageLayout,
        expected: vk::ImageLayout,
        region: &vk::BufferImageCopy,
    ) -> Option<std::ops::Range<usize>> {
        let Some(target) = self.images.get(&image) else {
            self.invalid(format!("copy with unknown image {image:#x}"));
            return None;
        };
        let (current, extent, layer_bytes, layers) =
            (target.layout, target.extent, target.layer_bytes(), target.array_layers);
        if layout != expected || current != layout {
            self.invalid(format!(
                "image {image:#x}: copy expects {expected:?}, recorded {layout:?}, image is in {current:?}"
            ));
        }
        let sub = region.image_subresource;
        if region.image_extent.width != extent.width
            || region.image_extent.height != extent.height
            || sub.mip_level != 0
            || sub.base_array_layer + sub.layer_count > layers
        {
            self.invalid(format!("image {image:#x}: partial copies are not emulated"));
            return None;
        }
        let start = sub.base_array_layer as usize * layer_bytes;
        Some(start..start + sub.layer_count as usize * layer_bytes)
    }

    fn execute_upload(
        &mut self,
        src: u64,
        dst: u64,
        layout: vk::ImageLayout,
        region: &vk::BufferImageCopy,
    ) {
        let Some(range) =
            self.image_range(dst, layout, vk::ImageLayout::TRANSFER_DST_OPTIMAL, region)
        else {
            return;
        };
        let Some(bytes) = self.buffer_bytes(src, region.buffer_offset, range.len() as u64) else {
            return;
        };
        if let Some(image) = self.images.get_mut(&dst) {
            image.data[range].copy_from_slice(&bytes);
        }
    }

    fn execute_readback(
        &mut self,
        src: u64,
        layout: vk::ImageLayout,
        dst: u64,
        region: &vk::BufferImageCopy,
    ) {
        let Some(range) =
            self.image_range(src, layout, vk::ImageLayout::TRANSFER_SRC_OPTIMAL, region)
        else {
            return;
        };
        let bytes = match self.images.get(&src) {
            Some(image) => image.data[range].to_vec(),
            None => return,
        };
        self.write_buffer(dst, region.buffer_offset, &bytes);
    }

    /// Apply the effect of a whole render pass: attachments are cleared and
    /// left in their final layouts.
    fn resolve_render_pass(&mut self, begin: &RenderPassBegin) {
        let Some(desc) = self.render_passes.get(&begin.render_pass.as_raw()).cloned() else {
            self.invalid(format!("unknown render pass {:?}", begin.render_pass));
            return;
        };
        let Some(views) = self.framebuffers.get(&begin.framebuffer.as_raw()).cloned() else {
            self.invalid(format!("unknown framebuffer {:?}", begin.framebuffer));
            return;
        };
        let depth = desc.depth.iter();
        for (view, attachment) in views.iter().zip(desc.color.iter().chain(depth)) {
            let Some(image_raw) = self.views.get(view).copied() else {
                self.invalid(format!("framebuffer references unknown view {view:#x}"));
                continue;
            };
            let Some(image) = self.images.get_mut(&image_raw) else {
                continue;
            };
            let texel = if is_depth_format(attachment.format) {
                1.0f32.to_le_bytes()
            } else {
                encode_clear(image.format, begin.clear_color)
            };
            for chunk in image.data.chunks_exact_mut(4) {
                chunk.copy_from_slice(&texel);
            }
            image.layout = attachment.final_layout;
        }
    }

    fn live_objects(&self) -> usize {
        self.buffers.len()
            + self.images.len()
            + self.views.len()
            + self.samplers.len()
            + self.pools.len()
            + self.fences.len()
            + self.semaphores.len()
            + self.render_passes.len()
            + self.framebuffers.len()
            + self.shader_modules.len()
            + self.pipelines.len()
            + self.swapchains.len()
    }
}

fn to_range(offset: u64, size: u64) -> std::ops::Range<usize> {
    let start = usize::try_from(offset).unwrap_or(usize::MAX);
    let len = usize::try_from(size).unwrap_or(usize::MAX);
    start..start.saturating_add(len)
}

fn is_depth_format(format: vk::Format) -> bool {
    matches!(
        format,
        vk::Format::D32_SFLOAT | vk::Format::D24_UNORM_S8_UINT | vk::Format::D16_UNORM
    )
}

fn linear_to_srgb(value: f32) -> f32 {
    if value <= 0.003_130_8 {
        value * 12.92
    } else {
        1.055 * value.powf(1.0 / 2.4) - 0.055
    }
}

#[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
fn unorm(value: f32) -> u8 {
    (value.clamp(0.0, 1.0) * 255.0).round() as u8
}

/// Texel bytes a color attachment of `format` holds after being cleared.
pub fn encode_clear(format: vk::Format, [r, g, b, a]: [f32; 4]) -> [u8; 4] {
    match format {
        vk::Format::R8G8B8A8_SRGB => [
            unorm(linear_to_srgb(r)),
            unorm(linear_to_srgb(g)),
            unorm(linear_to_srgb(b)),
            unorm(a),
        ],
        vk::Format::B8G8R8A8_UNORM => [unorm(b), unorm(g), unorm(r), unorm(a)],
        vk::Format::B8G8R8A8_SRGB => [
            unorm(linear_to_srgb(b)),
            unorm(linear_to_srgb(g)),
            unorm(linear_to_srgb(r)),
            unorm(a),
        ],
        _ => [unorm(r), unorm(g), unorm(b), unorm(a)],
    }
}

/// Software logical device.
pub struct SoftDevice {
    adapter: SoftAdapter,
    physical: vk::PhysicalDevice,
    desc: DeviceCreateDesc,
    surfaces: SurfaceMap,
    state: Mutex<State>,
    calls: AtomicU64,
    lost: AtomicBool,
}

impl SoftDevice {
    fn new(
        adapter: SoftAdapter,
        physical: vk::PhysicalDevice,
        desc: DeviceCreateDesc,
        surfaces: SurfaceMap,
    ) -> Self {
        let queues: HashMap<u32, vk::Queue> = desc
            .queue_families
            .iter()
            .map(|&family| (family, new_handle()))
            .collect();
        Self {
            adapter,
            physical,
            desc,
            surfaces,
            state: Mutex::new(State {
                queues,
                ..Default::default()
            }),
            calls: AtomicU64::new(0),
            lost: AtomicBool::new(false),
        }
    }

    fn call(&self) {
        self.calls.fetch_add(1, Ordering::Relaxed);
    }

    fn family_flags(&self, family: u32) -> vk::QueueFlags {
        self.adapter
            .queue_families
            .get(family as usize)
            .copied()
            .unwrap_or_else(vk::QueueFlags::empty)
    }

    /// Physical device this device was created on.
    pub fn physical(&self) -> vk::PhysicalDevice {
        self.physical
    }

    /// Parameters the device was created with.
    pub fn create_desc(&self) -> &DeviceCreateDesc {
        &self.desc
    }

    /// Number of backend calls made so far.
    pub fn device_calls(&self) -> u64 {
        self.calls.load(Ordering::Relaxed)
    }

    /// Make device-wide waits fail with `ERROR_DEVICE_LOST` until cleared.
    pub fn set_lost(&self, lost: bool) {
        self.lost.store(lost, Ordering::Relaxed);
    }

    /// Drain the trace of recorded commands, submissions and presents.
    pub fn take_trace(&self) -> Vec<String> {
        std::mem::take(&mut self.state.lock().trace)
    }

    /// Contract violations observed so far.
    pub fn validation_errors(&self) -> Vec<String> {
        self.state.lock().validation_errors.clone()
    }

    /// Submissions that have not executed yet.
    pub fn pending_submissions(&self) -> usize {
        self.state.lock().pending.len()
    }

    /// Execute up to `count` pending submissions in order, signalling their
    /// fences. Returns how many ran.
    pub fn complete(&self, count: usize) -> usize {
        let mut state = self.state.lock();
        (0..count).take_while(|_| state.run_front()).count()
    }

    /// Tracked layout of an image, swapchain images included.
    pub fn image_layout(&self, image: vk::Image) -> Option<vk::ImageLayout> {
        self.state.lock().images.get(&image.as_raw()).map(|image| image.layout)
    }

    /// Contents of mip 0 across all layers.
    pub fn image_bytes(&self, image: vk::Image) -> Option<Vec<u8>> {
        self.state
            .lock()
            .images
            .get(&image.as_raw())
            .map(|image| image.data.clone())
    }

    /// Number of device objects not yet destroyed.
    pub fn live_objects(&self) -> usize {
        self.state.lock().live_objects()
    }

    /// Number of images created through [`DeviceBackend::create_image`] still alive.
    pub fn live_images(&self) -> usize {
        self.state.lock().images.values().filter(|image| image.owned).count()
    }

    pub fn present_count(&self) -> usize {
        self.state.lock().presents
    }

    pub fn draw_count(&self) -> usize {
        self.state.lock().draws
    }
}

/// A buffer-image copy names exactly one aspect.
fn check_copy_aspect(state: &mut State, region: &vk::BufferImageCopy) {
    let aspect = region.image_subresource.aspect_mask;
    if aspect.as_raw().count_ones() != 1 {
        state.invalid(format!("buffer-image copy with aspect {aspect:?}"));
    }
}

impl DeviceBackend for SoftDevice {
    fn has_function(&self, name: &CStr) -> bool {
        self.call();
        let name = name.to_string_lossy();
        !self.adapter.missing_functions.iter().any(|missing| *missing == name)
    }

    fn get_queue(&self, family: u32) -> vk::Queue {
        self.call();
        let mut state = self.state.lock();
        match state.queues.get(&family).copied() {
            Some(queue) => queue,
            None => {
                state.invalid(format!("queue requested for uncreated family {family}"));
                vk::Queue::null()
            }
        }
    }

    fn wait_idle(&self) -> Result<()> {
        self.call();
        if self.lost.load(Ordering::Relaxed) {
            return Err(GpuError::Vulkan(vk::Result::ERROR_DEVICE_LOST));
        }
        self.state.lock().run_all();
        Ok(())
    }

    fn create_buffer(
        &self,
        desc: &BufferDesc<'_>,
        location: MemoryLocation,
    ) -> Result<(vk::Buffer, MemoryBlock)> {
        self.call();
        let mut state = self.state.lock();
        state.next_allocation += 1;
        let id = AllocationId(state.next_allocation);
        let buffer: vk::Buffer = new_handle();
        state.memory.insert(
            id,
            Memory {
                location,
                data: vec![0; to_range(0, desc.size).len()],
            },
        );
        state.buffers.insert(buffer.as_raw(), id);
        Ok((buffer, MemoryBlock { id, size: desc.size }))
    }

    fn destroy_buffer(&self, buffer: vk::Buffer, allocation: AllocationId) -> Result<()> {
        self.call();
        let mut state = self.state.lock();
        if state.buffers.remove(&buffer.as_raw()) != Some(allocation) {
            state.invalid(format!("buffer {buffer:?} destroyed with wrong allocation"));
        }
        state.memory.remove(&allocation);
        Ok(())
    }

    fn create_image(
        &self,
        desc: &ImageDesc<'_>,
        location: MemoryLocation,
    ) -> Result<(vk::Image, MemoryBlock)> {
        self.call();
        if desc.extent.width == 0 || desc.extent.height == 0 || desc.usage.is_empty() {
            return Err(GpuError::Vulkan(vk::Result::ERROR_VALIDATION_FAILED_EXT));
        }
        let mut state = self.state.lock();
        state.next_allocation += 1;
        let id = AllocationId(state.next_allocation);
        let image: vk::Image = new_handle();
        let soft = SoftImage {
            extent: desc.extent,
            format: desc.format,
            array_layers: desc.array_layers,
            layout: vk::ImageLayout::UNDEFINED,
            data: Vec::new(),
            owned: true,
        };
        let bytes = soft.layer_bytes() * desc.array_layers as usize;
        state.images.insert(
            image.as_raw(),
            SoftImage {
                data: vec![0; bytes],
                ..soft
            },
        );
        state.memory.insert(
            id,
            Memory {
                location,
                data: Vec::new(),
            },
        );
        Ok((
            image,
            MemoryBlock {
                id,
                size: bytes as u64,
            },
        ))
    }

    fn destroy_image(&self, image: vk::Image, allocation: AllocationId) -> Result<()> {
        self.call();
        let mut state = self.state.lock();
        if state.images.remove(&image.as_raw()).is_none() {
            state.invalid(format!("destroy of unknown image {image:?}"));
        }
        state.memory.remove(&allocation);
        Ok(())
    }

    fn mapped_ptr(&self, allocation: AllocationId) -> Option<NonNull<u8>> {
        self.call();
        let mut state = self.state.lock();
        let memory = state.memory.get_mut(&allocation)?;
        if memory.location == MemoryLocation::GpuOnly || memory.data.is_empty() {
            return None;
        }
        NonNull::new(memory.data.as_mut_ptr())
    }

    fn create_image_view(&self, desc: &ImageViewDesc) -> Result<vk::ImageView> {
        self.call();
        let mut state = self.state.lock();
        if !state.images.contains_key(&desc.image.as_raw()) {
            state.invalid(format!("view of unknown image {:?}", desc.image));
        }
        let view: vk::ImageView = new_handle();
        state.views.insert(view.as_raw(), desc.image.as_raw());
        Ok(view)
    }

    fn destroy_image_view(&self, view: vk::ImageView) {
        self.call();
        self.state.lock().views.remove(&view.as_raw());
    }

    fn create_sampler(&self, _desc: &SamplerDesc) -> Result<vk::Sampler> {
        self.call();
        let sampler: vk::Sampler = new_handle();
        self.state.lock().samplers.insert(sampler.as_raw());
        Ok(sampler)
    }

    fn destroy_sampler(&self, sampler: vk::Sampler) {
        self.call();
        self.state.lock().samplers.remove(&sampler.as_raw());
    }

    fn create_command_pool(&self, _family: u32) -> Result<vk::CommandPool> {
        self.call();
        let pool: vk::CommandPool = new_handle();
        self.state.lock().pools.insert(pool.as_raw());
        Ok(pool)
    }

    fn destroy_command_pool(&self, pool: vk::CommandPool) {
        self.call();
        let mut state = self.state.lock();
        state.pools.remove(&pool.as_raw());
        state
            .command_buffers
            .retain(|_, recording| recording.pool != pool.as_raw());
    }

    fn allocate_command_buffer(&self, pool: vk::CommandPool) -> Result<vk::CommandBuffer> {
        self.call();
        let cmd: vk::CommandBuffer = new_handle();
        self.state.lock().command_buffers.insert(
            cmd.as_raw(),
            Recording {
                pool: pool.as_raw(),
                state: RecordState::Initial,
                commands: Vec::new(),
            },
        );
        Ok(cmd)
    }

    fn begin_command_buffer(&self, cmd: vk::CommandBuffer) -> Result<()> {
        self.call();
        let mut state = self.state.lock();
        let raw = cmd.as_raw();
        if state.pending.iter().any(|pending| pending.command_buffer == raw) {
            state.invalid(format!("command buffer {cmd:?} reset while in flight"));
        }
        match state.command_buffers.get_mut(&raw) {
            Some(recording) => {
                recording.state = RecordState::Recording;
                recording.commands.clear();
                Ok(())
            }
            None => Err(GpuError::Vulkan(vk::Result::ERROR_UNKNOWN)),
        }
    }

    fn end_command_buffer(&self, cmd: vk::CommandBuffer) -> Result<()> {
        self.call();
        let mut state = self.state.lock();
        match state.command_buffers.get_mut(&cmd.as_raw()) {
            Some(recording) if recording.state == RecordState::Recording => {
                recording.state = RecordState::Executable;
                Ok(())
            }
            _ => Err(GpuError::Vulkan(vk::Result::ERROR_UNKNOWN)),
        }
    }

    fn cmd_image_barrier(&self, cmd: vk::CommandBuffer, barrier: &ImageBarrier) {
        self.call();
        let trace = format!("barrier {:?} -> {:?}", barrier.old_layout, barrier.new_layout);
        self.state.lock().record(cmd, Command::Barrier(*barrier), trace);
    }

    fn cmd_copy_buffer(
        &self,
        cmd: vk::CommandBuffer,
        src: vk::Buffer,
        dst: vk::Buffer,
        region: vk::BufferCopy,
    ) {
        self.call();
        let trace = format!("copy buffer -> buffer {}", region.size);
        let command = Command::CopyBuffer {
            src: src.as_raw(),
            dst: dst.as_raw(),
            region,
        };
        self.state.lock().record(cmd, command, trace);
    }

    fn cmd_copy_buffer_to_image(
        &self,
        cmd: vk::CommandBuffer,
        src: vk::Buffer,
        dst: vk::Image,
        layout: vk::ImageLayout,
        region: vk::BufferImageCopy,
    ) {
        self.call();
        check_copy_aspect(&mut self.state.lock(), &region);
        let trace = format!(
            "copy buffer -> image {}x{} layers {}",
            region.image_extent.width, region.image_extent.height, region.image_subresource.layer_count
        );
        let command = Command::CopyBufferToImage {
            src: src.as_raw(),
            dst: dst.as_raw(),
            layout,
            region,
        };
        self.state.lock().record(cmd, command, trace);
    }

    fn cmd_copy_image_to_buffer(
        &self,
        cmd: vk::CommandBuffer,
        src: vk::Image,
        layout: vk::ImageLayout,
        dst: vk::Buffer,
        region: vk::BufferImageCopy,
    ) {
        self.call();
        check_copy_aspect(&mut self.state.lock(), &region);
        let trace = format!(
            "copy image -> buffer {}x{} layers {}",
            region.image_extent.width, region.image_extent.height, region.image_subresource.layer_count
        );
        let command = Command::CopyImageToBuffer {
            src: src.as_raw(),
            layout,
            dst: dst.as_raw(),
            region,
        };
        self.state.lock().record(cmd, command, trace);
    }

    fn cmd_begin_render_pass(&self, cmd: vk::CommandBuffer, begin: &RenderPassBegin) {
        self.call();
        let trace = format!("begin render pass {}x{}", begin.extent.width, begin.extent.height);
        self.state
            .lock()
            .record(cmd, Command::BeginRenderPass(*begin), trace);
    }

    fn cmd_end_render_pass(&self, cmd: vk::CommandBuffer) {
        self.call();
        self.state
            .lock()
            .record(cmd, Command::EndRenderPass, "end render pass".to_string());
    }

    fn cmd_bind_pipeline(&self, _cmd: vk::CommandBuffer, pipeline: vk::Pipeline) {
        self.call();
        let mut state = self.state.lock();
        if !state.pipelines.contains(&pipeline.as_raw()) {
            state.invalid(format!("bind of unknown pipeline {pipeline:?}"));
        }
        state.trace.push("bind pipeline".to_string());
    }

    fn cmd_set_viewport(&self, _cmd: vk::CommandBuffer, extent: vk::Extent2D) {
        self.call();
        self.state
            .lock()
            .trace
            .push(format!("set viewport {}x{}", extent.width, extent.height));
    }

    fn cmd_bind_vertex_buffer(&self, _cmd: vk::CommandBuffer, buffer: vk::Buffer, _offset: u64) {
        self.call();
        let mut state = self.state.lock();
        if !state.buffers.contains_key(&buffer.as_raw()) {
            state.invalid(format!("bind of unknown vertex buffer {buffer:?}"));
        }
        state.trace.push("bind vertex buffer".to_string());
    }

    fn cmd_bind_index_buffer(&self, _cmd: vk::CommandBuffer, buffer: vk::Buffer, _offset: u64) {
        self.call();
        let mut state = self.state.lock();
        if !state.buffers.contains_key(&buffer.as_raw()) {
            state.invalid(format!("bind of unknown index buffer {buffer:?}"));
        }
        state.trace.push("bind index buffer".to_string());
    }

    fn cmd_push_constants(&self, _cmd: vk::CommandBuffer, _layout: vk::PipelineLayout, data: &[u8]) {
        self.call();
        self.state
            .lock()
            .trace
            .push(format!("push constants {} bytes", data.len()));
    }

    fn cmd_draw(&self, cmd: vk::CommandBuffer, vertex_count: u32, instance_count: u32) {
        self.call();
        let trace = format!("draw {vertex_count} x{instance_count}");
        self.state.lock().record(cmd, Command::Draw, trace);
    }

    fn cmd_draw_indexed(&self, cmd: vk::CommandBuffer, index_count: u32, instance_count: u32) {
        self.call();
        let trace = format!("draw indexed {index_count} x{instance_count}");
        self.state.lock().record(cmd, Command::Draw, trace);
    }

    fn create_fence(&self, signaled: bool) -> Result<vk::Fence> {
        self.call();
        let fence: vk::Fence = new_handle();
        self.state.lock().fences.insert(fence.as_raw(), signaled);
        Ok(fence)
    }

    fn destroy_fence(&self, fence: vk::Fence) {
        self.call();
        let mut state = self.state.lock();
        if state.pending.iter().any(|pending| pending.fence == fence.as_raw()) {
            state.invalid(format!("fence {fence:?} destroyed while in flight"));
        }
        state.fences.remove(&fence.as_raw());
    }

    fn fence_signaled(&self, fence: vk::Fence) -> Result<bool> {
        self.call();
        self.state
            .lock()
            .fences
            .get(&fence.as_raw())
            .copied()
            .ok_or(GpuError::Vulkan(vk::Result::ERROR_UNKNOWN))
    }

    fn wait_for_fence(&self, fence: vk::Fence) -> Result<()> {
        self.call();
        let raw = fence.as_raw();
        let mut state = self.state.lock();
        if state.fences.get(&raw) == Some(&true) {
            return Ok(());
        }
        if !state.pending.iter().any(|pending| pending.fence == raw) {
            state.invalid(format!("wait on fence {fence:?} that was never submitted"));
            return Err(GpuError::Vulkan(vk::Result::TIMEOUT));
        }
        while state.fences.get(&raw) != Some(&true) && state.run_front() {}
        Ok(())
    }

    fn reset_fence(&self, fence: vk::Fence) -> Result<()> {
        self.call();
        let raw = fence.as_raw();
        let mut state = self.state.lock();
        if state.pending.iter().any(|pending| pending.fence == raw) {
            state.invalid(format!("fence {fence:?} reset while in flight"));
        }
        match state.fences.get_mut(&raw) {
            Some(signaled) => {
                *signaled = false;
                Ok(())
            }
            None => Err(GpuError::Vulkan(vk::Result::ERROR_UNKNOWN)),
        }
    }

    fn create_semaphore(&self) -> Result<vk::Semaphore> {
        self.call();
        let semaphore: vk::Semaphore = new_handle();
        self.state.lock().semaphores.insert(semaphore.as_raw());
        Ok(semaphore)
    }

    fn destroy_semaphore(&self, semaphore: vk::Semaphore) {
        self.call();
        self.state.lock().semaphores.remove(&semaphore.as_raw());
    }

    fn queue_submit(
        &self,
        queue: vk::Queue,
        submit: &SubmitDesc<'_>,
        fence: vk::Fence,
    ) -> Result<()> {
        self.call();
        let mut state = self.state.lock();
        if !state.queues.values().any(|&known| known == queue) {
            state.invalid(format!("submit to unknown queue {queue:?}"));
        }
        for semaphore in submit.wait_semaphores.iter().chain(submit.signal_semaphores) {
            if !state.semaphores.contains(&semaphore.as_raw()) {
                state.invalid(format!("submit references unknown semaphore {semaphore:?}"));
            }
        }
        if submit.wait_semaphores.len() != submit.wait_stages.len() {
            state.invalid("wait semaphores and stages differ in length".to_string());
        }

        let raw_fence = fence.as_raw();
        if state.fences.get(&raw_fence) == Some(&true)
            || state.pending.iter().any(|pending| pending.fence == raw_fence)
        {
            state.invalid(format!("fence {fence:?} submitted while signaled or in flight"));
        }

        let raw_cmd = submit.command_buffer.as_raw();
        let recorded = state
            .command_buffers
            .get(&raw_cmd)
            .filter(|recording| recording.state == RecordState::Executable)
            .map(|recording| recording.commands.clone());
        let commands = recorded.unwrap_or_else(|| {
            state.invalid(format!(
                "submit of {:?} which is not executable",
                submit.command_buffer
            ));
            Vec::new()
        });
        state.pending.push_back(Pending {
            command_buffer: raw_cmd,
            commands,
            fence: raw_fence,
        });
        state.trace.push("submit".to_string());
        Ok(())
    }

    fn create_render_pass(&self, desc: &RenderPassDesc) -> Result<vk::RenderPass> {
        self.call();
        let render_pass: vk::RenderPass = new_handle();
        self.state
            .lock()
            .render_passes
            .insert(render_pass.as_raw(), desc.clone());
        Ok(render_pass)
    }

    fn destroy_render_pass(&self, render_pass: vk::RenderPass) {
        self.call();
        self.state.lock().render_passes.remove(&render_pass.as_raw());
    }

    fn create_framebuffer(&self, desc: &FramebufferDesc<'_>) -> Result<vk::Framebuffer> {
        self.call();
        let mut state = self.state.lock();
        let expected = state
            .render_passes
            .get(&desc.render_pass.as_raw())
            .map(|pass| pass.color.len() + usize::from(pass.depth.is_some()));
        if expected != Some(desc.attachments.len()) {
            state.invalid(format!(
                "framebuffer has {} attachments, render pass expects {expected:?}",
                desc.attachments.len()
            ));
        }
        let framebuffer: vk::Framebuffer = new_handle();
        state.framebuffers.insert(
            framebuffer.as_raw(),
            desc.attachments.iter().map(|view| view.as_raw()).collect(),
        );
        Ok(framebuffer)
    }

    fn destroy_framebuffer(&self, framebuffer: vk::Framebuffer) {
        self.call();
        self.state.lock().framebuffers.remove(&framebuffer.as_raw());
    }

    fn create_shader_module(&self, code: &[u32]) -> Result<vk::ShaderModule> {
        self.call();
        if code.first() != Some(&SPIRV_MAGIC) {
            return Err(GpuError::ShaderCompilation("invalid SPIR-V magic number".to_string()));
        }
        let module: vk::ShaderModule = new_handle();
        self.state.lock().shader_modules.insert(module.as_raw());
        Ok(module)
    }

    fn destroy_shader_module(&self, module: vk::ShaderModule) {
        self.call();
        self.state.lock().shader_modules.remove(&module.as_raw());
    }

    fn create_graphics_pipeline(
        &self,
        desc: &GraphicsPipelineDesc<'_>,
    ) -> Result<(vk::Pipeline, vk::PipelineLayout)> {
        self.call();
        let mut state = self.state.lock();
        let modules_known = state.shader_modules.contains(&desc.vertex_module.as_raw())
            && state.shader_modules.contains(&desc.fragment_module.as_raw());
        let pass = state.render_passes.get(&desc.render_pass.as_raw());
        if !modules_known || pass.is_none() {
            return Err(GpuError::PipelineCreation(
                "pipeline references unknown shader modules or render pass".to_string(),
            ));
        }
        if pass.map(|pass| pass.color.len()) != Some(desc.color_attachments as usize) {
            return Err(GpuError::PipelineCreation(
                "color attachment count does not match the render pass".to_string(),
            ));
        }
        let pipeline: vk::Pipeline = new_handle();
        state.pipelines.insert(pipeline.as_raw());
        Ok((pipeline, new_handle()))
    }

    fn destroy_pipeline(&self, pipeline: vk::Pipeline, _layout: vk::PipelineLayout) {
        self.call();
        self.state.lock().pipelines.remove(&pipeline.as_raw());
    }

    fn surface_support(&self, family: u32, surface: vk::SurfaceKHR) -> Result<bool> {
        self.call();
        let known = self.surfaces.lock().contains_key(&surface.as_raw());
        Ok(known && self.family_flags(family).contains(vk::QueueFlags::GRAPHICS))
    }

    fn surface_capabilities(&self, surface: vk::SurfaceKHR) -> Result<SurfaceCapabilities> {
        self.call();
        let extent = self
            .surfaces
            .lock()
            .get(&surface.as_raw())
            .copied()
            .ok_or_else(|| GpuError::SurfaceCreation(format!("unknown surface {surface:?}")))?;
        Ok(SurfaceCapabilities {
            capabilities: vk::SurfaceCapabilitiesKHR {
                min_image_count: 2,
                max_image_count: 3,
                current_extent: extent,
                min_image_extent: vk::Extent2D {
                    width: 1,
                    height: 1,
                },
                max_image_extent: vk::Extent2D {
                    width: 16384,
                    height: 16384,
                },
                max_image_array_layers: 1,
                supported_transforms: vk::SurfaceTransformFlagsKHR::IDENTITY,
                current_transform: vk::SurfaceTransformFlagsKHR::IDENTITY,
                supported_composite_alpha: vk::CompositeAlphaFlagsKHR::OPAQUE,
                supported_usage_flags: vk::ImageUsageFlags::COLOR_ATTACHMENT
                    | vk::ImageUsageFlags::TRANSFER_SRC
                    | vk::ImageUsageFlags::TRANSFER_DST,
                ..Default::default()
            },
            formats: vec![
                vk::SurfaceFormatKHR {
                    format: vk::Format::B8G8R8A8_UNORM,
                    color_space: vk::ColorSpaceKHR::SRGB_NONLINEAR,
                },
                vk::SurfaceFormatKHR {
                    format: vk::Format::B8G8R8A8_SRGB,
                    color_space: vk::ColorSpaceKHR::SRGB_NONLINEAR,
                },
            ],
            present_modes: vec![vk::PresentModeKHR::FIFO, vk::PresentModeKHR::MAILBOX],
        })
    }

    fn create_swapchain(
        &self,
        desc: &SwapchainDesc<'_>,
    ) -> Result<(vk::SwapchainKHR, Vec<vk::Image>)> {
        self.call();
        if !self.surfaces.lock().contains_key(&desc.surface.as_raw()) {
            return Err(GpuError::SwapchainCreation(format!(
                "unknown surface {:?}",
                desc.surface
            )));
        }
        let mut state = self.state.lock();
        let images: Vec<vk::Image> = (0..desc.min_image_count).map(|_| new_handle()).collect();
        for image in &images {
            let soft = SoftImage {
                extent: desc.extent,
                format: desc.format.format,
                array_layers: 1,
                layout: vk::ImageLayout::UNDEFINED,
                data: Vec::new(),
                owned: false,
            };
            let bytes = soft.layer_bytes();
            state.images.insert(
                image.as_raw(),
                SoftImage {
                    data: vec![0; bytes],
                    ..soft
                },
            );
        }
        let swapchain: vk::SwapchainKHR = new_handle();
        state.swapchains.insert(
            swapchain.as_raw(),
            SoftSwapchain {
                surface: desc.surface.as_raw(),
                extent: desc.extent,
                images: images.iter().map(|image| image.as_raw()).collect(),
                next: 0,
            },
        );
        Ok((swapchain, images))
    }

    fn destroy_swapchain(&self, swapchain: vk::SwapchainKHR) {
        self.call();
        let mut state = self.state.lock();
        if let Some(removed) = state.swapchains.remove(&swapchain.as_raw()) {
            for image in removed.images {
                state.images.remove(&image);
            }
        }
    }

    fn acquire_next_image(
        &self,
        swapchain: vk::SwapchainKHR,
        _semaphore: vk::Semaphore,
    ) -> Result<AcquiredImage> {
        self.call();
        let surfaces = self.surfaces.lock();
        let mut state = self.state.lock();
        let chain = state
            .swapchains
            .get_mut(&swapchain.as_raw())
            .ok_or(GpuError::Vulkan(vk::Result::ERROR_UNKNOWN))?;
        if surfaces.get(&chain.surface) != Some(&chain.extent) {
            return Err(GpuError::SwapchainOutOfDate);
        }
        let index = chain.next;
        let count = u32::try_from(chain.images.len()).unwrap_or(1).max(1);
        chain.next = (chain.next + 1) % count;
        Ok(AcquiredImage {
            index,
            suboptimal: false,
        })
    }

    fn queue_present(
        &self,
        _queue: vk::Queue,
        swapchain: vk::SwapchainKHR,
        image_index: u32,
        _wait_semaphores: &[vk::Semaphore],
    ) -> Result<bool> {
        self.call();
        let surfaces = self.surfaces.lock();
        let mut state = self.state.lock();
        // Presentation waits on the frame's semaphores; emulate by draining.
        state.run_all();
        let Some(chain) = state.swapchains.get(&swapchain.as_raw()) else {
            return Err(GpuError::Vulkan(vk::Result::ERROR_UNKNOWN));
        };
        let stale = surfaces.get(&chain.surface) != Some(&chain.extent);
        let image = chain.images.get(image_index as usize).copied();
        let layout = image.and_then(|image| state.images.get(&image)).map(|image| image.layout);
        if layout != Some(vk::ImageLayout::PRESENT_SRC_KHR) {
            state.invalid(format!("presented image {image_index} is in {layout:?}"));
        }
        state.presents += 1;
        state.trace.push(format!("present {image_index}"));
        Ok(stale)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clear_encoding_respects_channel_order() {
        let color = [1.0, 0.5, 0.0, 1.0];
        assert_eq!(encode_clear(vk::Format::R8G8B8A8_UNORM, color), [255, 128, 0, 255]);
        assert_eq!(encode_clear(vk::Format::B8G8R8A8_UNORM, color), [0, 128, 255, 255]);
        assert_eq!(encode_clear(vk::Format::R8G8B8A8_SRGB, color), [255, 188, 0, 255]);
    }

    #[test]
    fn submissions_run_in_order_on_wait() {
        let instance = SoftInstance::single();
        let device = instance.create_default_device();
        let soft = instance.device().unwrap();
        let pool = device.create_command_pool(0).unwrap();
        let queue = device.get_queue(0);

        let mut fences = Vec::new();
        for _ in 0..3 {
            let cmd = device.allocate_command_buffer(pool).unwrap();
            device.begin_command_buffer(cmd).unwrap();
            device.end_command_buffer(cmd).unwrap();
            let fence = device.create_fence(false).unwrap();
            let submit = SubmitDesc {
                command_buffer: cmd,
                wait_semaphores: &[],
                wait_stages: &[],
                signal_semaphores: &[],
            };
            device.queue_submit(queue, &submit, fence).unwrap();
            fences.push(fence);
        }
        assert_eq!(soft.pending_submissions(), 3);

        device.wait_for_fence(fences[1]).unwrap();
        assert!(device.fence_signaled(fences[0]).unwrap());
        assert!(device.fence_signaled(fences[1]).unwrap());
        assert!(!device.fence_signaled(fences[2]).unwrap());
        assert_eq!(soft.complete(5), 1);
        assert!(soft.validation_errors().is_empty());
    }

    #[test]
    fn waiting_on_unsubmitted_fence_is_reported() {
        let instance = SoftInstance::single();
        let device = instance.create_default_device();
        let fence = device.create_fence(false).unwrap();
        assert!(device.wait_for_fence(fence).is_err());
        assert_eq!(instance.device().unwrap().validation_errors().len(), 1);
    }
}
