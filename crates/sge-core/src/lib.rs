//! Core types for the SGE engine.
//!
//! This crate provides the value types shared by the renderer core and the
//! layers that sit on top of it (assets, editor, scene):
//! - Image formats, usage flags and image descriptions
//! - Texture sampling settings and their persisted form
//! - The engine-wide error type

pub mod error;
pub mod types;

pub use error::{Error, Result};
pub use types::{ImageFormat, ImageSpec, ImageUsage, TextureFilter, TextureSettings, TextureWrap};
