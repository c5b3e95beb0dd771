//! Application framework for the SGE renderer.
//!
//! This crate provides a trait-based application framework that handles
//! common boilerplate like:
//! - Logging setup
//! - Window creation and management
//! - Renderer initialization and shutdown
//! - Swapchain recreation on resize
//! - Event loop handling
//!
//! # Example
//!
//! ```no_run
//! use sge_app::{run_app, AppConfig, AppContext, FrameContext, SgeApp};
//!
//! struct MyApp {
//!     // Application state
//! }
//!
//! impl SgeApp for MyApp {
//!     fn init(ctx: &mut AppContext) -> anyhow::Result<Self> {
//!         Ok(MyApp {})
//!     }
//!
//!     fn update(&mut self, ctx: &AppContext, dt: f32) {
//!         // Update logic
//!     }
//!
//!     fn render(&mut self, ctx: &AppContext, frame: &mut FrameContext) -> anyhow::Result<()> {
//!         ctx.renderer().begin_present_pass(frame.frame())?;
//!         ctx.renderer().end_present_pass(frame.frame())?;
//!         Ok(())
//!     }
//! }
//!
//! fn main() -> anyhow::Result<()> {
//!     run_app::<MyApp>(AppConfig::default())
//! }
//! ```

mod app;
mod context;
mod frame;
mod runner;

pub use app::SgeApp;
pub use context::AppContext;
pub use frame::FrameContext;
pub use runner::{init_logging, run_app, AppConfig};

// Re-export commonly used types for convenience
pub use sge_gpu::{GpuContext, Renderer, RendererConfig};
pub use winit::event::{DeviceEvent, DeviceId, WindowEvent};
