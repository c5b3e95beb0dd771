//! Pipeline creation and draw recording.

use std::io::Cursor;

use ash::vk;

use crate::backend::{GraphicsPipelineDesc, VertexAttribute};
use crate::buffer::GpuBuffer;
use crate::command::CommandList;
use crate::context::GpuContext;
use crate::error::{GpuError, Result};
use crate::render_pass::RenderPass;

const SPIRV_MAGIC: u32 = 0x0723_0203;

/// Decode SPIR-V bytes into words, checking alignment and the magic number.
pub fn read_spirv(bytes: &[u8]) -> Result<Vec<u32>> {
    if bytes.len() % 4 != 0 {
        return Err(GpuError::ShaderCompilation(format!(
            "SPIR-V length {} is not a multiple of 4",
            bytes.len()
        )));
    }
    let words = ash::util::read_spv(&mut Cursor::new(bytes))
        .map_err(|e| GpuError::ShaderCompilation(e.to_string()))?;
    if words.first() != Some(&SPIRV_MAGIC) {
        return Err(GpuError::ShaderCompilation(
            "invalid SPIR-V magic number".to_string(),
        ));
    }
    Ok(words)
}

/// A vertex and fragment shader pair.
pub struct Shader {
    vertex: vk::ShaderModule,
    fragment: vk::ShaderModule,
}

impl Shader {
    /// Load a shader pair from SPIR-V bytes.
    pub fn from_spirv(ctx: &GpuContext, vertex: &[u8], fragment: &[u8]) -> Result<Self> {
        let vertex = read_spirv(vertex)?;
        let fragment = read_spirv(fragment)?;
        Self::from_words(ctx, &vertex, &fragment)
    }

    /// Load a shader pair from SPIR-V words.
    pub fn from_words(ctx: &GpuContext, vertex: &[u32], fragment: &[u32]) -> Result<Self> {
        let device = ctx.device();
        let vertex = device.create_shader_module(vertex)?;
        let fragment = match device.create_shader_module(fragment) {
            Ok(module) => module,
            Err(err) => {
                device.destroy_shader_module(vertex);
                return Err(err);
            }
        };
        Ok(Self { vertex, fragment })
    }

    pub fn vertex_module(&self) -> vk::ShaderModule {
        self.vertex
    }

    pub fn fragment_module(&self) -> vk::ShaderModule {
        self.fragment
    }

    pub fn destroy(&mut self, ctx: &GpuContext) {
        for module in [&mut self.vertex, &mut self.fragment] {
            if *module != vk::ShaderModule::null() {
                ctx.device().destroy_shader_module(*module);
                *module = vk::ShaderModule::null();
            }
        }
    }
}

/// Fixed-function state of a graphics pipeline.
#[derive(Clone, Debug)]
pub struct PipelineSpec {
    pub vertex_stride: u32,
    pub vertex_attributes: Vec<VertexAttribute>,
    pub topology: vk::PrimitiveTopology,
    pub cull_mode: vk::CullModeFlags,
    pub front_face: vk::FrontFace,
    pub depth_test: bool,
    pub depth_write: bool,
    pub blend: bool,
    pub push_constant_size: u32,
}

impl Default for PipelineSpec {
    fn default() -> Self {
        Self {
            vertex_stride: 0,
            vertex_attributes: Vec::new(),
            topology: vk::PrimitiveTopology::TRIANGLE_LIST,
            cull_mode: vk::CullModeFlags::BACK,
            front_face: vk::FrontFace::COUNTER_CLOCKWISE,
            depth_test: false,
            depth_write: false,
            blend: false,
            push_constant_size: 0,
        }
    }
}

impl PipelineSpec {
    /// Append a vertex attribute at the next location.
    pub fn attribute(mut self, format: vk::Format, offset: u32) -> Self {
        let location = u32::try_from(self.vertex_attributes.len()).unwrap_or(u32::MAX);
        self.vertex_attributes.push(VertexAttribute {
            location,
            format,
            offset,
        });
        self
    }

    pub fn stride(mut self, stride: u32) -> Self {
        self.vertex_stride = stride;
        self
    }

    pub fn depth(mut self, test: bool, write: bool) -> Self {
        self.depth_test = test;
        self.depth_write = write;
        self
    }

    pub fn blend(mut self, blend: bool) -> Self {
        self.blend = blend;
        self
    }

    pub fn cull(mut self, cull_mode: vk::CullModeFlags) -> Self {
        self.cull_mode = cull_mode;
        self
    }

    pub fn push_constants(mut self, size: u32) -> Self {
        self.push_constant_size = size;
        self
    }
}

/// A graphics pipeline bound to one render pass layout.
pub struct Pipeline {
    handle: vk::Pipeline,
    layout: vk::PipelineLayout,
    push_constant_size: u32,
}

impl Pipeline {
    /// Build a pipeline drawing into `render_pass`. Viewport and scissor
    /// are dynamic.
    pub fn new(
        ctx: &GpuContext,
        shader: &Shader,
        render_pass: &RenderPass,
        spec: &PipelineSpec,
    ) -> Result<Self> {
        if spec.depth_test && !render_pass.has_depth() {
            return Err(GpuError::PipelineCreation(
                "depth test requires a render pass with a depth attachment".to_string(),
            ));
        }
        let (handle, layout) = ctx.device().create_graphics_pipeline(&GraphicsPipelineDesc {
            vertex_module: shader.vertex_module(),
            fragment_module: shader.fragment_module(),
            render_pass: render_pass.handle(),
            color_attachments: render_pass.color_attachment_count(),
            vertex_stride: spec.vertex_stride,
            vertex_attributes: &spec.vertex_attributes,
            topology: spec.topology,
            cull_mode: spec.cull_mode,
            front_face: spec.front_face,
            depth_test: spec.depth_test,
            depth_write: spec.depth_write,
            blend: spec.blend,
            push_constant_size: spec.push_constant_size,
        })?;
        tracing::debug!("Created graphics pipeline for {:?} pass", render_pass.parent());
        Ok(Self {
            handle,
            layout,
            push_constant_size: spec.push_constant_size,
        })
    }

    pub fn handle(&self) -> vk::Pipeline {
        self.handle
    }

    pub fn layout(&self) -> vk::PipelineLayout {
        self.layout
    }

    pub fn push_constant_size(&self) -> u32 {
        self.push_constant_size
    }

    /// Destroy the pipeline. It must not be in use.
    pub fn destroy(&mut self, ctx: &GpuContext) {
        if self.handle != vk::Pipeline::null() {
            ctx.device().destroy_pipeline(self.handle, self.layout);
            self.handle = vk::Pipeline::null();
            self.layout = vk::PipelineLayout::null();
        }
    }
}

/// One draw submitted by the scene layer.
pub struct DrawCall<'a> {
    pub pipeline: &'a Pipeline,
    pub vertex_buffer: &'a GpuBuffer,
    /// 32-bit indices; `count` then counts indices instead of vertices.
    pub index_buffer: Option<&'a GpuBuffer>,
    pub count: u32,
    pub instances: u32,
    pub push_constants: &'a [u8],
}

impl<'a> DrawCall<'a> {
    /// A non-indexed single-instance draw.
    pub fn new(pipeline: &'a Pipeline, vertex_buffer: &'a GpuBuffer, count: u32) -> Self {
        Self {
            pipeline,
            vertex_buffer,
            index_buffer: None,
            count,
            instances: 1,
            push_constants: &[],
        }
    }

    pub fn indexed(mut self, index_buffer: &'a GpuBuffer) -> Self {
        self.index_buffer = Some(index_buffer);
        self
    }

    pub fn instances(mut self, instances: u32) -> Self {
        self.instances = instances;
        self
    }

    pub fn push_constants(mut self, data: &'a [u8]) -> Self {
        self.push_constants = data;
        self
    }

    /// Record the draw. The list must be inside a render pass.
    pub fn record(&self, list: &mut CommandList) -> Result<()> {
        if self.push_constants.len() > self.pipeline.push_constant_size() as usize {
            return Err(GpuError::InvalidDescription(format!(
                "{} push constant bytes exceed the pipeline's {}",
                self.push_constants.len(),
                self.pipeline.push_constant_size()
            )));
        }
        list.bind_pipeline(self.pipeline.handle(), self.pipeline.layout())?;
        list.bind_vertex_buffer(self.vertex_buffer.handle(), 0);
        if !self.push_constants.is_empty() {
            list.push_constants(self.push_constants)?;
        }
        match self.index_buffer {
            Some(indices) => {
                list.bind_index_buffer(indices.handle(), 0);
                list.draw_indexed(self.count, self.instances)
            }
            None => list.draw(self.count, self.instances),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use glam::Vec4;
    use gpu_allocator::MemoryLocation;

    use super::*;
    use crate::backend::soft::SoftInstance;
    use crate::command::QueueKind;
    use crate::context::GpuContextBuilder;
    use crate::framebuffer::{Framebuffer, FramebufferSpec};

    /// Smallest word stream the device accepts as SPIR-V.
    fn spirv_bytes() -> Vec<u8> {
        [SPIRV_MAGIC, 0x0001_0000, 0, 1, 0]
            .iter()
            .flat_map(|word| word.to_le_bytes())
            .collect()
    }

    #[test]
    fn spirv_is_validated() {
        assert_eq!(read_spirv(&spirv_bytes()).unwrap()[0], SPIRV_MAGIC);
        assert!(matches!(
            read_spirv(&[3, 2, 35, 7, 0]),
            Err(GpuError::ShaderCompilation(_))
        ));
        assert!(matches!(
            read_spirv(&[0; 8]),
            Err(GpuError::ShaderCompilation(msg)) if msg.contains("magic")
        ));
    }

    #[test]
    fn draws_are_recorded_inside_a_pass() {
        let instance = Arc::new(SoftInstance::single());
        let mut ctx = GpuContextBuilder::new()
            .headless(true)
            .build_with(instance.clone())
            .unwrap();
        let soft = instance.device().unwrap();

        let mut framebuffer = Framebuffer::new(&ctx, FramebufferSpec::new(4, 4), "target").unwrap();
        let mut shader = Shader::from_spirv(&ctx, &spirv_bytes(), &spirv_bytes()).unwrap();
        let spec = PipelineSpec::default()
            .stride(8)
            .attribute(vk::Format::R32G32_SFLOAT, 0)
            .push_constants(16);
        let mut pipeline = Pipeline::new(&ctx, &shader, framebuffer.render_pass(), &spec).unwrap();
        let mut vertices = GpuBuffer::new(
            &ctx,
            24,
            vk::BufferUsageFlags::VERTEX_BUFFER,
            MemoryLocation::CpuToGpu,
            "triangle",
        )
        .unwrap();
        vertices
            .write(0, &[0.0f32, -0.5, 0.5, 0.5, -0.5, 0.5])
            .unwrap();
        let tint = Vec4::ONE.to_array();

        let mut list = ctx.get(QueueKind::Graphics).unwrap();
        let call = DrawCall::new(&pipeline, &vertices, 3).push_constants(bytemuck::bytes_of(&tint));
        assert!(matches!(call.record(&mut list), Err(GpuError::InvalidState(_))));

        soft.take_trace();
        framebuffer.begin_render_pass(&mut list, Vec4::ZERO).unwrap();
        call.record(&mut list).unwrap();
        framebuffer.end_render_pass(&mut list).unwrap();
        ctx.submit(list, true).unwrap();
        insta::assert_debug_snapshot!(soft.take_trace(), @r###"
        [
            "begin render pass 4x4",
            "set viewport 4x4",
            "bind pipeline",
            "bind vertex buffer",
            "push constants 16 bytes",
            "draw 3 x1",
            "end render pass",
            "submit",
        ]
        "###);
        assert_eq!(soft.draw_count(), 1);

        vertices.destroy(&ctx).unwrap();
        pipeline.destroy(&ctx);
        shader.destroy(&ctx);
        framebuffer.destroy(&ctx).unwrap();
        ctx.shutdown().unwrap();
        assert!(soft.validation_errors().is_empty(), "{:?}", soft.validation_errors());
    }

    #[test]
    fn depth_test_needs_a_depth_attachment() {
        let mut ctx = GpuContextBuilder::new()
            .headless(true)
            .build_with(Arc::new(SoftInstance::single()))
            .unwrap();
        let mut framebuffer = Framebuffer::new(&ctx, FramebufferSpec::new(2, 2), "flat").unwrap();
        let mut shader = Shader::from_spirv(&ctx, &spirv_bytes(), &spirv_bytes()).unwrap();
        let spec = PipelineSpec::default().depth(true, true);
        assert!(matches!(
            Pipeline::new(&ctx, &shader, framebuffer.render_pass(), &spec),
            Err(GpuError::PipelineCreation(_))
        ));
        shader.destroy(&ctx);
        framebuffer.destroy(&ctx).unwrap();
        ctx.shutdown().unwrap();
    }
}
