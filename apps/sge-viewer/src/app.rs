//! Viewer application.

use std::path::{Path, PathBuf};

use ash::vk;
use bytemuck::{Pod, Zeroable};
use sge_app::{AppContext, FrameContext, SgeApp};
use sge_gpu::{DrawCall, GpuBuffer, Pipeline, PipelineSpec, Renderer, Shader};
use tracing::{info, warn};
use winit::event::{ElementState, WindowEvent};
use winit::keyboard::{KeyCode, PhysicalKey};

/// Command line options of the viewer.
#[derive(Clone, Debug)]
pub struct ViewerOptions {
    pub vertex: Option<PathBuf>,
    pub fragment: Option<PathBuf>,
    pub frames_in_flight: usize,
    pub no_vsync: bool,
    pub target_fps: Option<u32>,
}

impl Default for ViewerOptions {
    fn default() -> Self {
        Self {
            vertex: None,
            fragment: None,
            frames_in_flight: 2,
            no_vsync: false,
            target_fps: None,
        }
    }
}

impl ViewerOptions {
    /// Parse from command line arguments.
    pub fn from_args() -> Self {
        Self::parse(std::env::args().skip(1))
    }

    fn parse(args: impl IntoIterator<Item = String>) -> Self {
        let mut options = Self::default();
        let mut args = args.into_iter();
        while let Some(arg) = args.next() {
            match arg.as_str() {
                "--vertex" => options.vertex = args.next().map(PathBuf::from),
                "--fragment" => options.fragment = args.next().map(PathBuf::from),
                "--frames-in-flight" => {
                    if let Some(n) = args.next().and_then(|s| s.parse().ok()) {
                        options.frames_in_flight = n;
                    }
                }
                "--target-fps" => options.target_fps = args.next().and_then(|s| s.parse().ok()),
                "--no-vsync" => options.no_vsync = true,
                other => warn!("Ignoring unknown argument '{other}'"),
            }
        }
        options
    }
}

#[repr(C)]
#[derive(Clone, Copy, Debug, Pod, Zeroable)]
struct Vertex {
    position: [f32; 2],
    color: [f32; 3],
}

const TRIANGLE: [Vertex; 3] = [
    Vertex {
        position: [0.0, -0.6],
        color: [1.0, 0.2, 0.2],
    },
    Vertex {
        position: [0.6, 0.6],
        color: [0.2, 1.0, 0.2],
    },
    Vertex {
        position: [-0.6, 0.6],
        color: [0.2, 0.2, 1.0],
    },
];

fn triangle_spec() -> PipelineSpec {
    PipelineSpec::default()
        .stride(std::mem::size_of::<Vertex>() as u32)
        .attribute(vk::Format::R32G32_SFLOAT, 0)
        .attribute(vk::Format::R32G32B32_SFLOAT, 8)
        .cull(vk::CullModeFlags::NONE)
        .push_constants(4)
}

/// Shader, pipeline and vertex data of the triangle.
struct Triangle {
    shader: Shader,
    pipeline: Pipeline,
    vertices: GpuBuffer,
}

impl Triangle {
    fn load(renderer: &Renderer, vertex: &Path, fragment: &Path) -> anyhow::Result<Self> {
        let ctx = renderer.context();
        let vertex_code = std::fs::read(vertex)?;
        let fragment_code = std::fs::read(fragment)?;
        let mut shader = Shader::from_spirv(ctx, &vertex_code, &fragment_code)?;

        let mut pipeline = match renderer
            .present_render_pass()
            .and_then(|pass| Pipeline::new(ctx, &shader, pass, &triangle_spec()))
        {
            Ok(pipeline) => pipeline,
            Err(e) => {
                shader.destroy(ctx);
                return Err(e.into());
            }
        };
        let vertices = match GpuBuffer::with_data(
            ctx,
            bytemuck::cast_slice(&TRIANGLE),
            vk::BufferUsageFlags::VERTEX_BUFFER,
            "triangle vertices",
        ) {
            Ok(vertices) => vertices,
            Err(e) => {
                pipeline.destroy(ctx);
                shader.destroy(ctx);
                return Err(e.into());
            }
        };

        Ok(Self {
            shader,
            pipeline,
            vertices,
        })
    }
}

/// Demo viewer state.
pub struct Viewer {
    triangle: Option<Triangle>,
    elapsed: f32,
    paused: bool,
}

impl SgeApp for Viewer {
    fn init(ctx: &mut AppContext) -> anyhow::Result<Self> {
        let options = ViewerOptions::from_args();

        let triangle = match (&options.vertex, &options.fragment) {
            (Some(vertex), Some(fragment)) => {
                let triangle = Triangle::load(ctx.renderer(), vertex, fragment)?;
                info!("Loaded triangle shaders {:?} and {:?}", vertex, fragment);
                Some(triangle)
            }
            (None, None) => None,
            _ => {
                warn!("Both --vertex and --fragment are needed to draw; clearing only");
                None
            }
        };

        info!(
            "Viewer ready: {}x{}, press Space to pause the animation",
            ctx.width(),
            ctx.height()
        );

        Ok(Self {
            triangle,
            elapsed: 0.0,
            paused: false,
        })
    }

    fn update(&mut self, _ctx: &AppContext, dt: f32) {
        if !self.paused {
            self.elapsed += dt;
        }
    }

    fn render(&mut self, ctx: &AppContext, frame: &mut FrameContext) -> anyhow::Result<()> {
        let renderer = ctx.renderer();
        renderer.begin_present_pass(frame.frame())?;

        if let Some(triangle) = &self.triangle {
            let time = [self.elapsed];
            let call = DrawCall::new(&triangle.pipeline, &triangle.vertices, 3)
                .push_constants(bytemuck::cast_slice(&time));
            renderer.draw(frame.frame(), &call)?;
        }

        renderer.end_present_pass(frame.frame())?;
        Ok(())
    }

    fn on_resize(&mut self, ctx: &mut AppContext, _width: u32, _height: u32) -> anyhow::Result<()> {
        // Rebuild against the new present pass; frames in flight may still use the old one.
        if let Some(triangle) = &mut self.triangle {
            let renderer = ctx.renderer_mut();
            let pipeline = Pipeline::new(
                renderer.context(),
                &triangle.shader,
                renderer.present_render_pass()?,
                &triangle_spec(),
            )?;
            let old = std::mem::replace(&mut triangle.pipeline, pipeline);
            renderer.retire(old);
        }
        Ok(())
    }

    fn on_event(&mut self, event: &WindowEvent) -> bool {
        if let WindowEvent::KeyboardInput { event, .. } = event {
            if event.state == ElementState::Pressed
                && event.physical_key == PhysicalKey::Code(KeyCode::Space)
            {
                self.paused = !self.paused;
                return true;
            }
        }
        false
    }

    fn cleanup(&mut self, ctx: &mut AppContext) {
        if let Some(mut triangle) = self.triangle.take() {
            let renderer = ctx.renderer_mut();
            triangle.shader.destroy(renderer.context());
            renderer.retire(triangle.pipeline);
            renderer.retire(triangle.vertices);
        }
        info!("Viewer shut down after {:.1}s", self.elapsed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn parses_viewer_options() {
        let options = ViewerOptions::parse(args(&[
            "--vertex",
            "tri.vert.spv",
            "--fragment",
            "tri.frag.spv",
            "--frames-in-flight",
            "3",
            "--no-vsync",
        ]));
        assert_eq!(options.vertex, Some(PathBuf::from("tri.vert.spv")));
        assert_eq!(options.fragment, Some(PathBuf::from("tri.frag.spv")));
        assert_eq!(options.frames_in_flight, 3);
        assert!(options.no_vsync);
        assert_eq!(options.target_fps, None);
    }

    #[test]
    fn bad_numbers_keep_defaults() {
        let options = ViewerOptions::parse(args(&["--frames-in-flight", "many"]));
        assert_eq!(options.frames_in_flight, 2);
    }

    #[test]
    fn vertex_layout_matches_pipeline() {
        let spec = triangle_spec();
        assert_eq!(spec.vertex_stride, 20);
        assert_eq!(spec.vertex_attributes.len(), 2);
        assert_eq!(spec.vertex_attributes[1].offset, 8);
    }
}
