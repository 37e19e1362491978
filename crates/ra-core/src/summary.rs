//! Step summaries: a closed union keyed by step name.
//!
//! The orchestrator treats summaries as opaque, but each variant is tied to
//! exactly one [`Step`], so a render summary can never be stored under the
//! upload step by mistake.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::job::Step;
use crate::{Error, Result};

/// Free-form key/value summary returned by an external collaborator stage.
pub type OpaqueSummary = Map<String, Value>;

/// Result digest of a successful step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "step", content = "data", rename_all = "snake_case")]
pub enum StepSummary {
    Discover(DiscoverSummary),
    Ingest(OpaqueSummary),
    Script(OpaqueSummary),
    Voice(OpaqueSummary),
    Render(RenderSummary),
    Thumbnail(OpaqueSummary),
    Upload(OpaqueSummary),
    Distribute(OpaqueSummary),
}

impl StepSummary {
    /// The step this summary belongs to.
    pub fn step(&self) -> Step {
        match self {
            Self::Discover(_) => Step::Discover,
            Self::Ingest(_) => Step::Ingest,
            Self::Script(_) => Step::Script,
            Self::Voice(_) => Step::Voice,
            Self::Render(_) => Step::Render,
            Self::Thumbnail(_) => Step::Thumbnail,
            Self::Upload(_) => Step::Upload,
            Self::Distribute(_) => Step::Distribute,
        }
    }

    /// Build a summary for `step` from an external stage's JSON output.
    ///
    /// `discover` output must carry a non-empty string `video_id`. `render`
    /// has a typed summary and cannot be built from opaque output.
    pub fn opaque(step: Step, map: OpaqueSummary) -> Result<Self> {
        Ok(match step {
            Step::Discover => Self::Discover(DiscoverSummary::from_map(map)?),
            Step::Ingest => Self::Ingest(map),
            Step::Script => Self::Script(map),
            Step::Voice => Self::Voice(map),
            Step::Thumbnail => Self::Thumbnail(map),
            Step::Upload => Self::Upload(map),
            Step::Distribute => Self::Distribute(map),
            Step::Render => {
                return Err(Error::stage(
                    step.as_str(),
                    "render summaries are produced by the render stage only",
                ))
            }
        })
    }

    /// The video id selected by discovery, if this is a discover summary.
    pub fn discovered_video_id(&self) -> Option<&str> {
        match self {
            Self::Discover(d) => Some(&d.video_id),
            _ => None,
        }
    }
}

/// Output of the discovery stage: the selected source video.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DiscoverSummary {
    pub video_id: String,
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub details: OpaqueSummary,
}

impl DiscoverSummary {
    fn from_map(mut map: OpaqueSummary) -> Result<Self> {
        let video_id = match map.remove("video_id") {
            Some(Value::String(s)) if !s.trim().is_empty() => s,
            _ => {
                return Err(Error::stage(
                    Step::Discover.as_str(),
                    "discovery output has no video_id",
                ))
            }
        };
        Ok(Self {
            video_id,
            details: map,
        })
    }
}

/// Output of the render stage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RenderSummary {
    pub output_path: PathBuf,
    /// Duration of the rendered output in seconds.
    pub duration: f64,
    pub alignment_score: f64,
    pub quality_passed: bool,
    pub scene_count: usize,
    pub segment_count: usize,
    /// Playback speed (`video / narration`) applied to the video track, if it was retimed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retime_factor: Option<f64>,
    /// Scene detection fell back to the two-point `{0, duration}` cut list.
    #[serde(default)]
    pub alignment_degraded: bool,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub warnings: Vec<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn map(v: Value) -> OpaqueSummary {
        v.as_object().cloned().unwrap()
    }

    #[test]
    fn summary_is_tagged_by_step() {
        let s = StepSummary::opaque(Step::Upload, map(json!({"youtube_id": "yt1"}))).unwrap();
        let v = serde_json::to_value(&s).unwrap();
        assert_eq!(v, json!({"step": "upload", "data": {"youtube_id": "yt1"}}));
        assert_eq!(s.step(), Step::Upload);
    }

    #[test]
    fn discover_requires_video_id() {
        let ok = StepSummary::opaque(
            Step::Discover,
            map(json!({"video_id": "v42", "score": 0.9})),
        )
        .unwrap();
        assert_eq!(ok.discovered_video_id(), Some("v42"));

        let missing = StepSummary::opaque(Step::Discover, map(json!({"score": 0.9})));
        assert!(matches!(missing, Err(Error::Stage { .. })));
    }

    #[test]
    fn render_cannot_be_opaque() {
        assert!(StepSummary::opaque(Step::Render, Map::new()).is_err());
    }

    #[test]
    fn render_summary_roundtrip() {
        let s = StepSummary::Render(RenderSummary {
            output_path: PathBuf::from("/media/output/v1/final_video.mp4"),
            duration: 12.0,
            alignment_score: 0.98,
            quality_passed: true,
            scene_count: 3,
            segment_count: 2,
            retime_factor: Some(0.5),
            alignment_degraded: false,
            warnings: Vec::new(),
        });
        let json = serde_json::to_string(&s).unwrap();
        let back: StepSummary = serde_json::from_str(&json).unwrap();
        assert_eq!(back, s);
        assert_eq!(back.step(), Step::Render);
    }
}
