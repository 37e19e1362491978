//! # ra-av
//!
//! External media tooling for the render step.
//!
//! This crate provides:
//!
//! - **Tool discovery** ([`ToolRegistry`]) -- find and cache paths to ffmpeg
//!   and ffprobe.
//! - **Command execution** ([`ToolCommand`]) -- async builder with timeout
//!   support for running external processes.
//! - **Duration probing** ([`probe_duration`]) -- container duration via ffprobe.
//! - **Scene detection** ([`SceneDetector`]) -- visual cut timestamps from
//!   ffmpeg's scene filter, degrading to a two-point list on failure.
//! - **Rendering** ([`Renderer`]) -- mux video with narration, retiming the
//!   video track when the narration is much longer.
//! - **Media layout** ([`MediaLayout`]) -- per-video input/output paths.

pub mod command;
pub mod media;
pub mod probe;
pub mod render;
pub mod scene;
pub mod tools;

// ---- Re-exports for convenience ----

pub use command::{ToolCommand, ToolOutput};
pub use media::MediaLayout;
pub use probe::probe_duration;
pub use render::{RenderPlan, RenderResult, RenderSettings, Renderer};
pub use scene::{CutKind, SceneCut, SceneDetection, SceneDetector};
pub use tools::{ToolConfig, ToolInfo, ToolRegistry};
