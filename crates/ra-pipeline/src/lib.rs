//! # ra-pipeline
//!
//! Orchestration of the eight-step recap pipeline.
//!
//! This crate provides:
//!
//! - **[`Stage`]** trait -- a single pipeline step returning a typed
//!   [`StepSummary`](ra_core::StepSummary).
//! - **[`CommandStage`]** -- collaborator steps run as configured external
//!   commands.
//! - **[`RenderStage`]** -- scene detection, narration alignment and the
//!   final mux.
//! - **[`alignment`]** -- the narration-to-scene alignment engine.
//! - **[`Orchestrator`]** -- the durable job state machine.
//! - **[`JobService`]** -- create / get / list / cancel, backed by the
//!   [`CancelRegistry`] of live jobs.

pub mod alignment;
pub mod command_stage;
pub mod orchestrator;
pub mod registry;
pub mod render_stage;
pub mod service;
pub mod stage;

// Re-export key types at the crate root.
pub use alignment::{AlignmentEngine, AlignmentMapping, AlignmentReport, NarrationSegment};
pub use command_stage::CommandStage;
pub use orchestrator::Orchestrator;
pub use registry::{CancelRegistry, Registration};
pub use render_stage::RenderStage;
pub use service::{build_stages, JobService};
pub use stage::{Stage, StageContext, StageSet};
