//! SGE Demo Viewer
//!
//! Clears the window and, when given a SPIR-V shader pair, draws a colored
//! triangle with it. Space pauses the time passed to the shader.
//!
//! ## Usage
//!
//! ```bash
//! cargo run -p sge-viewer -- [OPTIONS]
//! ```
//!
//! ## Environment Variables
//!
//! - `RUST_LOG`: Set log level (e.g., info, debug, trace)

mod app;

use glam::Vec4;
use sge_app::{run_app, AppConfig};

use crate::app::Viewer;

const WIDTH: u32 = 1280;
const HEIGHT: u32 = 720;

fn main() -> anyhow::Result<()> {
    // Check for help flag before starting the app
    if std::env::args().any(|arg| arg == "-h" || arg == "--help") {
        print_help();
        return Ok(());
    }

    let options = app::ViewerOptions::from_args();
    let mut config = AppConfig::new("SGE Viewer")
        .with_size(WIDTH, HEIGHT)
        .with_vsync(!options.no_vsync)
        .with_frames_in_flight(options.frames_in_flight)
        .with_clear_color(Vec4::new(0.05, 0.07, 0.12, 1.0));
    if let Some(fps) = options.target_fps {
        config = config.with_target_fps(fps);
    }

    run_app::<Viewer>(config)
}

fn print_help() {
    eprintln!(
        "SGE Demo Viewer

USAGE:
    cargo run -p sge-viewer -- [OPTIONS]

SHADER OPTIONS:
    --vertex <PATH>         SPIR-V vertex shader for the triangle
    --fragment <PATH>       SPIR-V fragment shader for the triangle
                            The vertex shader reads vec2 position (location 0)
                            and vec3 color (location 1); one float of push
                            constants carries the elapsed time.

RENDERING OPTIONS:
    --frames-in-flight <N>  Frames recorded ahead of the GPU (default: 2)
    --no-vsync              Present without waiting for vertical blank
    --target-fps <N>        Sleep to cap the frame rate

OTHER:
    -h, --help              Print this help message

ENVIRONMENT VARIABLES:
    RUST_LOG                Set log level (e.g., info, debug, trace)"
    );
}
