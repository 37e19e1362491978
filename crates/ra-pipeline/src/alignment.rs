//! Narration-to-scene alignment.
//!
//! Narration segments live on the narration clock. They are projected onto
//! the video clock by `video_duration / narration_duration`, each projected
//! start is snapped to the nearest scene cut, and the mean snap distance
//! becomes a 0..1 score. The mapping is informational: it is logged and
//! summarized but does not steer the encode.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use ra_av::{SceneCut, ToolCommand};
use ra_core::{Error, Result};

/// Mean offset (seconds) at which the score reaches zero.
pub const MAX_MEAN_OFFSET: f64 = 5.0;

/// Score reported when there are no narration segments to align.
pub const EMPTY_SCORE: f64 = 0.5;

/// Durations below this are treated as zero.
const EPSILON: f64 = 1e-6;

/// Script segment length used when the script omits `estimated_duration`.
const DEFAULT_SEGMENT_SECS: f64 = 30.0;

/// Script text is cut to this many characters in fallback segments.
const SEGMENT_TEXT_CHARS: usize = 50;

/// One timed span of narration, on the narration clock.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NarrationSegment {
    pub start: f64,
    pub end: f64,
    #[serde(default)]
    pub text: String,
}

/// Where one narration segment lands on the video clock.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct AlignmentMapping {
    pub video_start: f64,
    pub video_end: f64,
    /// Timestamp of the scene cut closest to `video_start`.
    pub nearest_cut: f64,
    /// `|nearest_cut - video_start|`.
    pub offset: f64,
}

/// Result of [`align`].
#[derive(Debug, Clone, PartialEq)]
pub struct AlignmentReport {
    pub mappings: Vec<AlignmentMapping>,
    pub scale: f64,
    pub score: f64,
    pub quality_passed: bool,
}

/// Narration-to-video time scale. A zero narration length scales by 1.
pub fn compute_scale(video_duration: f64, narration_duration: f64) -> f64 {
    if narration_duration.abs() < EPSILON || !narration_duration.is_finite() {
        1.0
    } else {
        video_duration / narration_duration
    }
}

/// Timestamp of the cut closest to `t`; ties go to the earlier cut.
///
/// `cuts` must be sorted by timestamp, which [`ra_av::SceneDetector`] guarantees.
pub fn nearest_cut(cuts: &[SceneCut], t: f64) -> Option<f64> {
    cuts.iter()
        .map(|c| c.timestamp)
        .fold(None, |best: Option<f64>, ts| match best {
            Some(b) if (b - t).abs() <= (ts - t).abs() => Some(b),
            _ => Some(ts),
        })
}

/// `clamp(1 - mean_offset / 5, 0, 1)`, rounded to two decimals.
///
/// The quality threshold is compared against the rounded value.
pub fn score_from_offsets(offsets: &[f64]) -> f64 {
    if offsets.is_empty() {
        return EMPTY_SCORE;
    }
    let mean = offsets.iter().sum::<f64>() / offsets.len() as f64;
    let raw = (1.0 - mean / MAX_MEAN_OFFSET).clamp(0.0, 1.0);
    (raw * 100.0).round() / 100.0
}

/// Map `segments` onto `cuts` and score the fit.
///
/// Deterministic, and the score never increases as segments drift further
/// from the cuts. An empty cut list snaps every segment to 0.
pub fn align(
    segments: &[NarrationSegment],
    cuts: &[SceneCut],
    video_duration: f64,
    narration_duration: f64,
    quality_threshold: f64,
) -> AlignmentReport {
    let scale = compute_scale(video_duration, narration_duration);

    let mappings: Vec<AlignmentMapping> = segments
        .iter()
        .map(|seg| {
            let video_start = seg.start * scale;
            let cut = nearest_cut(cuts, video_start).unwrap_or(0.0);
            AlignmentMapping {
                video_start,
                video_end: seg.end * scale,
                nearest_cut: cut,
                offset: (cut - video_start).abs(),
            }
        })
        .collect();

    let offsets: Vec<f64> = mappings.iter().map(|m| m.offset).collect();
    let score = score_from_offsets(&offsets);

    AlignmentReport {
        mappings,
        scale,
        score,
        quality_passed: score >= quality_threshold,
    }
}

// ---------------------------------------------------------------------------
// Segment sources
// ---------------------------------------------------------------------------

/// Synthesize segments from a script's `main_recap_segments`.
///
/// Each entry contributes `estimated_duration` seconds (default 30) laid end
/// to end from 0. A missing or malformed list yields no segments.
pub fn segments_from_script(script: &serde_json::Value) -> Vec<NarrationSegment> {
    let entries = match script.get("main_recap_segments") {
        Some(serde_json::Value::Array(a)) => a.clone(),
        // Some writers store the list as an embedded JSON string.
        Some(serde_json::Value::String(s)) => match serde_json::from_str(s) {
            Ok(serde_json::Value::Array(a)) => a,
            _ => return Vec::new(),
        },
        _ => return Vec::new(),
    };

    let mut cursor = 0.0;
    entries
        .iter()
        .map(|entry| {
            let duration = entry
                .get("estimated_duration")
                .and_then(|d| d.as_f64())
                .filter(|d| d.is_finite() && *d >= 0.0)
                .unwrap_or(DEFAULT_SEGMENT_SECS);
            let text: String = entry
                .get("text")
                .and_then(|t| t.as_str())
                .unwrap_or_default()
                .chars()
                .take(SEGMENT_TEXT_CHARS)
                .collect();
            let seg = NarrationSegment {
                start: cursor,
                end: cursor + duration,
                text,
            };
            cursor += duration;
            seg
        })
        .collect()
}

/// Parse a forced aligner's stdout: a JSON array of `{start, end, text}`.
pub fn parse_aligner_output(stdout: &str) -> Result<Vec<NarrationSegment>> {
    let mut segments: Vec<NarrationSegment> = serde_json::from_str(stdout.trim())?;
    segments.retain(|s| s.start.is_finite() && s.end.is_finite());
    segments.sort_by(|a, b| a.start.total_cmp(&b.start));
    Ok(segments)
}

/// Where a set of narration segments came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SegmentSource {
    Aligner,
    Script,
    None,
}

/// Loads narration segments and aligns them against scene cuts.
#[derive(Debug, Clone)]
pub struct AlignmentEngine {
    aligner: Vec<String>,
    timeout: Duration,
    quality_threshold: f64,
}

impl AlignmentEngine {
    pub fn new(aligner: Vec<String>, timeout: Duration, quality_threshold: f64) -> Self {
        Self {
            aligner,
            timeout,
            quality_threshold,
        }
    }

    pub fn quality_threshold(&self) -> f64 {
        self.quality_threshold
    }

    /// Segments from the forced aligner, else from the script estimates.
    ///
    /// Never fails: each unavailable source is logged and the next is tried.
    pub async fn load_segments(
        &self,
        audio: &Path,
        video_id: &str,
        script_path: &Path,
    ) -> (Vec<NarrationSegment>, SegmentSource) {
        if !self.aligner.is_empty() {
            match self.run_aligner(audio, video_id).await {
                Ok(segments) => return (segments, SegmentSource::Aligner),
                Err(e) => {
                    tracing::warn!(video_id, "Forced alignment failed, using script estimates: {e}")
                }
            }
        }

        match read_script(script_path).await {
            Ok(script) => (segments_from_script(&script), SegmentSource::Script),
            Err(e) => {
                tracing::warn!(video_id, "No narration segments available: {e}");
                (Vec::new(), SegmentSource::None)
            }
        }
    }

    async fn run_aligner(&self, audio: &Path, video_id: &str) -> Result<Vec<NarrationSegment>> {
        let audio_str = audio.to_string_lossy();
        let mut parts = self
            .aligner
            .iter()
            .map(|a| a.replace("{audio}", &audio_str).replace("{video_id}", video_id));
        let program = parts
            .next()
            .ok_or_else(|| Error::Validation("aligner command is empty".into()))?;

        let output = ToolCommand::new(PathBuf::from(program))
            .args(parts)
            .timeout(self.timeout)
            .execute()
            .await?;
        parse_aligner_output(&output.stdout)
    }

    pub fn align(
        &self,
        segments: &[NarrationSegment],
        cuts: &[SceneCut],
        video_duration: f64,
        narration_duration: f64,
    ) -> AlignmentReport {
        align(
            segments,
            cuts,
            video_duration,
            narration_duration,
            self.quality_threshold,
        )
    }
}

async fn read_script(path: &Path) -> Result<serde_json::Value> {
    let raw = tokio::fs::read_to_string(path).await?;
    Ok(serde_json::from_str(&raw)?)
}
