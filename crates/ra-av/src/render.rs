//! Final render: mux the source video with the narration track.
//!
//! The narration always replaces the original audio. When the narration is
//! longer than the video by more than the retime threshold, the video track is
//! slowed down with `setpts` so its length approaches the narration length;
//! otherwise both streams are muxed at native rate and `-shortest` bounds the
//! output.

use std::path::{Path, PathBuf};
use std::time::Duration;

use ra_core::config::RenderConfig;
use ra_core::{Error, Result};

use crate::command::ToolCommand;
use crate::probe::probe_duration;

/// Encoder settings for the final render.
#[derive(Debug, Clone)]
pub struct RenderSettings {
    /// Video codec (default: libx264).
    pub video_codec: String,
    /// Encoder preset (default: medium).
    pub preset: String,
    /// Constant rate factor (default: 23).
    pub crf: u32,
    /// Audio codec (default: aac).
    pub audio_codec: String,
    /// Audio bitrate (default: 192k).
    pub audio_bitrate: String,
    /// Duration gap in seconds above which the video is retimed (default: 5).
    pub retime_threshold: f64,
}

impl Default for RenderSettings {
    fn default() -> Self {
        Self::from(&RenderConfig::default())
    }
}

impl From<&RenderConfig> for RenderSettings {
    fn from(cfg: &RenderConfig) -> Self {
        Self {
            video_codec: cfg.video_codec.clone(),
            preset: cfg.preset.clone(),
            crf: cfg.crf,
            audio_codec: cfg.audio_codec.clone(),
            audio_bitrate: cfg.audio_bitrate.clone(),
            retime_threshold: cfg.retime_threshold,
        }
    }
}

/// The retiming decision for one render.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RenderPlan {
    /// Playback speed `video / narration` (< 1 slows down), if retiming.
    pub speed: Option<f64>,
}

impl RenderPlan {
    /// Retime only when the gap exceeds `threshold` **and** narration is longer.
    pub fn decide(video_duration: f64, narration_duration: f64, threshold: f64) -> Self {
        let gap = (video_duration - narration_duration).abs();
        let speed = (gap > threshold
            && narration_duration > video_duration
            && video_duration > 0.0)
            .then(|| video_duration / narration_duration);
        Self { speed }
    }

    /// `setpts` filter for the video track, if retiming.
    pub fn video_filter(&self) -> Option<String> {
        self.speed.map(|s| format!("setpts={:.6}*PTS", 1.0 / s))
    }

    /// Output length the plan aims for.
    pub fn expected_duration(&self, video_duration: f64, narration_duration: f64) -> f64 {
        match self.speed {
            Some(_) => narration_duration,
            None => video_duration.min(narration_duration),
        }
    }
}

/// Outcome of a successful render.
#[derive(Debug, Clone, PartialEq)]
pub struct RenderResult {
    pub output_path: PathBuf,
    /// Duration of the written file in seconds.
    pub duration: f64,
    pub plan: RenderPlan,
}

/// Runs the final ffmpeg mux.
#[derive(Debug, Clone)]
pub struct Renderer {
    ffmpeg: PathBuf,
    ffprobe: PathBuf,
    settings: RenderSettings,
    render_timeout: Duration,
    probe_timeout: Duration,
}

impl Renderer {
    pub fn new(
        ffmpeg: PathBuf,
        ffprobe: PathBuf,
        settings: RenderSettings,
        render_timeout: Duration,
        probe_timeout: Duration,
    ) -> Self {
        Self {
            ffmpeg,
            ffprobe,
            settings,
            render_timeout,
            probe_timeout,
        }
    }

    /// Build the ffmpeg argument list for `plan`.
    pub fn build_args(
        &self,
        video: &Path,
        narration: &Path,
        output: &Path,
        plan: &RenderPlan,
    ) -> Vec<String> {
        let s = &self.settings;
        let mut args: Vec<String> = vec![
            "-hide_banner".into(),
            "-i".into(),
            video.to_string_lossy().to_string(),
            "-i".into(),
            narration.to_string_lossy().to_string(),
        ];

        if let Some(filter) = plan.video_filter() {
            args.extend(["-filter:v".into(), filter]);
        }

        args.extend([
            "-map".into(),
            "0:v".into(),
            "-map".into(),
            "1:a".into(),
            "-c:v".into(),
            s.video_codec.clone(),
            "-preset".into(),
            s.preset.clone(),
            "-crf".into(),
            s.crf.to_string(),
            "-c:a".into(),
            s.audio_codec.clone(),
            "-b:a".into(),
            s.audio_bitrate.clone(),
            "-shortest".into(),
            "-y".into(),
            output.to_string_lossy().to_string(),
        ]);

        args
    }

    /// Render `video` + `narration` into `output`.
    ///
    /// # Errors
    ///
    /// [`Error::RenderFailed`] if ffmpeg exits non-zero, times out, or the
    /// output file is missing afterwards.
    pub async fn render(
        &self,
        video: &Path,
        narration: &Path,
        output: &Path,
        video_duration: f64,
        narration_duration: f64,
    ) -> Result<RenderResult> {
        let plan = RenderPlan::decide(
            video_duration,
            narration_duration,
            self.settings.retime_threshold,
        );
        if let Some(speed) = plan.speed {
            tracing::info!(
                "Retiming video {video_duration:.2}s -> {narration_duration:.2}s (speed {speed:.3})"
            );
        }

        if let Some(parent) = output.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let args = self.build_args(video, narration, output, &plan);
        tracing::debug!("FFmpeg args: {:?}", args);

        ToolCommand::new(self.ffmpeg.clone())
            .args(args)
            .timeout(self.render_timeout)
            .execute()
            .await
            .map_err(|e| Error::RenderFailed(e.to_string()))?;

        if !tokio::fs::try_exists(output).await.unwrap_or(false) {
            return Err(Error::RenderFailed(format!(
                "encoder reported success but {} is missing",
                output.display()
            )));
        }

        let duration = match probe_duration(&self.ffprobe, output, self.probe_timeout).await {
            Ok(d) => d,
            Err(e) => {
                let expected = plan.expected_duration(video_duration, narration_duration);
                tracing::warn!("Could not probe rendered output, assuming {expected:.2}s: {e}");
                expected
            }
        };

        Ok(RenderResult {
            output_path: output.to_path_buf(),
            duration,
            plan,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn renderer(ffmpeg: &str, ffprobe: &str) -> Renderer {
        Renderer::new(
            PathBuf::from(ffmpeg),
            PathBuf::from(ffprobe),
            RenderSettings::default(),
            Duration::from_secs(120),
            Duration::from_secs(30),
        )
    }

    #[test]
    fn test_default_settings() {
        let s = RenderSettings::default();
        assert_eq!(s.video_codec, "libx264");
        assert_eq!(s.preset, "medium");
        assert_eq!(s.crf, 23);
        assert_eq!(s.audio_codec, "aac");
        assert_eq!(s.audio_bitrate, "192k");
        assert_eq!(s.retime_threshold, 5.0);
    }

    #[test]
    fn retimes_when_narration_much_longer() {
        let plan = RenderPlan::decide(2.0, 12.0, 5.0);
        let speed = plan.speed.unwrap();
        assert!((speed - 2.0 / 12.0).abs() < 1e-9);
        assert_eq!(plan.video_filter().unwrap(), "setpts=6.000000*PTS");
        assert_eq!(plan.expected_duration(2.0, 12.0), 12.0);
    }

    #[test]
    fn no_retime_within_threshold() {
        let plan = RenderPlan::decide(2.0, 2.5, 5.0);
        assert_eq!(plan.speed, None);
        assert_eq!(plan.video_filter(), None);
        assert_eq!(plan.expected_duration(2.0, 2.5), 2.0);
    }

    #[test]
    fn no_retime_when_video_longer() {
        assert_eq!(RenderPlan::decide(60.0, 20.0, 5.0).speed, None);
    }

    #[test]
    fn no_retime_at_exact_threshold() {
        assert_eq!(RenderPlan::decide(10.0, 15.0, 5.0).speed, None);
    }

    #[test]
    fn args_map_narration_as_only_audio() {
        let r = renderer("ffmpeg", "ffprobe");
        let plan = RenderPlan::decide(2.0, 12.0, 5.0);
        let args = r.build_args(
            Path::new("/in.mp4"),
            Path::new("/narr.mp3"),
            Path::new("/out.mp4"),
            &plan,
        );
        let joined = args.join(" ");
        assert!(joined.contains("-filter:v setpts=6.000000*PTS"));
        assert!(joined.contains("-map 0:v -map 1:a"));
        assert!(joined.contains("-c:v libx264 -preset medium -crf 23"));
        assert!(joined.contains("-c:a aac -b:a 192k -shortest -y /out.mp4"));

        let plain = r.build_args(
            Path::new("/in.mp4"),
            Path::new("/narr.mp3"),
            Path::new("/out.mp4"),
            &RenderPlan { speed: None },
        );
        assert!(!plain.iter().any(|a| a.starts_with("setpts")));
    }

    #[tokio::test]
    async fn encoder_failure_is_render_failed() {
        let dir = tempfile::tempdir().unwrap();
        let r = renderer("nonexistent_ffmpeg_xyz", "nonexistent_ffprobe_xyz");
        let result = r
            .render(
                Path::new("/in.mp4"),
                Path::new("/narr.mp3"),
                &dir.path().join("out/final_video.mp4"),
                2.0,
                2.5,
            )
            .await;
        assert!(matches!(result, Err(Error::RenderFailed(_))));
    }

    #[tokio::test]
    async fn missing_output_is_render_failed() {
        // `true` exits 0 without writing anything.
        let Ok(true_bin) = which::which("true") else {
            return;
        };
        let dir = tempfile::tempdir().unwrap();
        let r = Renderer::new(
            true_bin,
            PathBuf::from("ffprobe"),
            RenderSettings::default(),
            Duration::from_secs(10),
            Duration::from_secs(10),
        );
        let err = r
            .render(
                Path::new("/in.mp4"),
                Path::new("/narr.mp3"),
                &dir.path().join("final_video.mp4"),
                2.0,
                2.5,
            )
            .await
            .unwrap_err();
        assert!(err.to_string().contains("missing"), "unexpected: {err}");
    }

    /// Full encode with real tools: 2s video + 12s narration is retimed to ~12s.
    #[tokio::test]
    async fn retimed_render_matches_narration_length() {
        let (Ok(ffmpeg), Ok(ffprobe)) = (which::which("ffmpeg"), which::which("ffprobe")) else {
            return;
        };
        let dir = tempfile::tempdir().unwrap();
        let video = dir.path().join("video.mp4");
        let audio = dir.path().join("narration.m4a");

        ToolCommand::new(ffmpeg.clone())
            .args(["-f", "lavfi", "-i", "testsrc=duration=2:size=320x240:rate=25"])
            .args(["-c:v", "libx264", "-y"])
            .arg(video.to_string_lossy())
            .execute()
            .await
            .unwrap();
        ToolCommand::new(ffmpeg.clone())
            .args(["-f", "lavfi", "-i", "sine=frequency=440:duration=12"])
            .args(["-c:a", "aac", "-y"])
            .arg(audio.to_string_lossy())
            .execute()
            .await
            .unwrap();

        let r = Renderer::new(
            ffmpeg,
            ffprobe,
            RenderSettings {
                preset: "ultrafast".into(),
                ..RenderSettings::default()
            },
            Duration::from_secs(300),
            Duration::from_secs(30),
        );
        let out = dir.path().join("output/final_video.mp4");
        let result = r.render(&video, &audio, &out, 2.0, 12.0).await.unwrap();

        assert!(result.plan.speed.is_some());
        assert!(out.exists());
        assert!(result.duration > 9.0, "duration {}", result.duration);
    }
}
