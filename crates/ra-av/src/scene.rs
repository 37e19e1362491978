//! Visual scene-cut detection with ffmpeg's `scene` filter.
//!
//! The detector runs `select='gt(scene,T)',showinfo` over the video and reads
//! the `pts_time:` of each selected frame from stderr. The resulting cut list
//! always spans `[0, duration]` with explicit start/end markers. If ffmpeg
//! fails or times out, detection degrades to the two-point list instead of
//! failing the caller.

use std::path::{Path, PathBuf};
use std::sync::OnceLock;
use std::time::Duration;

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::command::ToolCommand;

/// Cuts closer than this (seconds) are treated as the same cut.
const DEDUP_EPSILON: f64 = 1e-3;

/// Role of a timestamp in the cut list.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CutKind {
    Start,
    Cut,
    End,
}

/// A timestamp at which the visual content changes.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SceneCut {
    /// Seconds from the start of the video.
    pub timestamp: f64,
    pub kind: CutKind,
}

impl SceneCut {
    pub fn new(timestamp: f64, kind: CutKind) -> Self {
        Self { timestamp, kind }
    }
}

/// Output of [`SceneDetector::detect`].
#[derive(Debug, Clone, PartialEq)]
pub struct SceneDetection {
    /// Ordered cuts, first `start` at 0, last `end` at the duration.
    pub cuts: Vec<SceneCut>,
    /// The probe failed and `cuts` is the two-point fallback.
    pub degraded: bool,
}

fn pts_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"pts_time:(\d+(?:\.\d+)?)").expect("valid pts_time regex"))
}

/// Extract every `pts_time:` value from ffmpeg `showinfo` output.
pub fn parse_showinfo(stderr: &str) -> Vec<f64> {
    pts_regex()
        .captures_iter(stderr)
        .filter_map(|c| c.get(1))
        .filter_map(|m| m.as_str().parse::<f64>().ok())
        .collect()
}

/// Normalize raw cut times into a cut list spanning `[0, duration]`.
///
/// Raw times are sorted and de-duplicated; anything at or outside the
/// boundaries is dropped in favour of the explicit start/end markers.
pub fn build_cut_list(raw: &[f64], duration: f64) -> Vec<SceneCut> {
    let duration = if duration.is_finite() { duration.max(0.0) } else { 0.0 };

    let mut times: Vec<f64> = raw
        .iter()
        .copied()
        .filter(|t| t.is_finite() && *t > DEDUP_EPSILON && *t < duration - DEDUP_EPSILON)
        .collect();
    times.sort_by(f64::total_cmp);
    times.dedup_by(|a, b| (*a - *b).abs() < DEDUP_EPSILON);

    let mut cuts = Vec::with_capacity(times.len() + 2);
    cuts.push(SceneCut::new(0.0, CutKind::Start));
    cuts.extend(times.into_iter().map(|t| SceneCut::new(t, CutKind::Cut)));
    cuts.push(SceneCut::new(duration, CutKind::End));
    cuts
}

/// Runs ffmpeg scene detection over a video file.
#[derive(Debug, Clone)]
pub struct SceneDetector {
    ffmpeg: PathBuf,
    threshold: f64,
    timeout: Duration,
}

impl SceneDetector {
    pub fn new(ffmpeg: PathBuf, threshold: f64, timeout: Duration) -> Self {
        Self {
            ffmpeg,
            threshold,
            timeout,
        }
    }

    fn command(&self, video: &Path) -> ToolCommand {
        let mut cmd = ToolCommand::new(self.ffmpeg.clone());
        cmd.args(["-hide_banner", "-nostats", "-i"])
            .arg(video.to_string_lossy())
            .arg("-vf")
            .arg(format!("select='gt(scene,{})',showinfo", self.threshold))
            .args(["-f", "null", "-"])
            .timeout(self.timeout);
        cmd
    }

    /// Detect cuts in `video`, whose duration the caller already probed.
    ///
    /// Never fails: on any probe error the result is the degraded two-point
    /// list `{0 start, duration end}`.
    pub async fn detect(&self, video: &Path, duration: f64) -> SceneDetection {
        match self.command(video).execute().await {
            Ok(output) => {
                let raw = parse_showinfo(&output.stderr);
                let cuts = build_cut_list(&raw, duration);
                tracing::debug!(
                    video = %video.display(),
                    raw = raw.len(),
                    cuts = cuts.len(),
                    "Scene detection complete"
                );
                SceneDetection {
                    cuts,
                    degraded: false,
                }
            }
            Err(e) => {
                tracing::warn!(
                    video = %video.display(),
                    "Scene detection failed, using start/end only: {e}"
                );
                SceneDetection {
                    cuts: build_cut_list(&[], duration),
                    degraded: true,
                }
            }
        }
    }
}
