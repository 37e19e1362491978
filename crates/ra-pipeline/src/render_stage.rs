//! The render step: scene detection, alignment, and the final mux.

use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;

use ra_av::{probe_duration, MediaLayout, RenderSettings, Renderer, SceneDetector, ToolRegistry};
use ra_core::config::Config;
use ra_core::{Error, RenderSummary, Result, Step, StepSummary};

use crate::alignment::{AlignmentEngine, SegmentSource};
use crate::stage::{Stage, StageContext};

/// Composes [`SceneDetector`], [`AlignmentEngine`] and [`Renderer`] over the
/// per-video media layout.
#[derive(Debug, Clone)]
pub struct RenderStage {
    layout: MediaLayout,
    ffprobe: PathBuf,
    probe_timeout: Duration,
    detector: SceneDetector,
    engine: AlignmentEngine,
    renderer: Renderer,
}

impl RenderStage {
    pub fn new(
        layout: MediaLayout,
        ffprobe: PathBuf,
        probe_timeout: Duration,
        detector: SceneDetector,
        engine: AlignmentEngine,
        renderer: Renderer,
    ) -> Self {
        Self {
            layout,
            ffprobe,
            probe_timeout,
            detector,
            engine,
            renderer,
        }
    }

    pub fn from_config(config: &Config, tools: &ToolRegistry) -> Self {
        let ffmpeg = tools.path_or_name("ffmpeg");
        let ffprobe = tools.path_or_name("ffprobe");
        let t = &config.timeouts;

        Self::new(
            MediaLayout::new(&config.media.media_dir),
            ffprobe.clone(),
            t.probe(),
            SceneDetector::new(ffmpeg.clone(), config.render.scene_threshold, t.scene_detect()),
            AlignmentEngine::new(
                config.aligner.command.clone(),
                t.align(),
                config.render.quality_threshold,
            ),
            Renderer::new(
                ffmpeg,
                ffprobe,
                RenderSettings::from(&config.render),
                t.render(),
                t.probe(),
            ),
        )
    }
}

#[async_trait]
impl Stage for RenderStage {
    fn step(&self) -> Step {
        Step::Render
    }

    async fn run(&self, ctx: &StageContext) -> Result<StepSummary> {
        let video_id = ctx.require_video_id(Step::Render)?;

        let source = self.layout.find_source_video(video_id)?;
        let narration = self.layout.find_narration(video_id)?;
        let video_duration = probe_duration(&self.ffprobe, &source, self.probe_timeout).await?;
        let narration_duration =
            probe_duration(&self.ffprobe, &narration, self.probe_timeout).await?;
        tracing::info!(
            video_id,
            video_duration,
            narration_duration,
            "Render inputs resolved"
        );

        let mut warnings = Vec::new();

        let detection = self.detector.detect(&source, video_duration).await;
        if detection.degraded {
            warnings.push("scene detection failed; aligned against start/end only".to_string());
        }

        let script_path = self.layout.script_path(video_id)?;
        let (segments, segment_source) = self
            .engine
            .load_segments(&narration, video_id, &script_path)
            .await;
        if segment_source == SegmentSource::None {
            warnings.push("no narration segments available".to_string());
        }

        let report =
            self.engine
                .align(&segments, &detection.cuts, video_duration, narration_duration);
        for m in &report.mappings {
            tracing::debug!(
                video_start = m.video_start,
                nearest_cut = m.nearest_cut,
                offset = m.offset,
                "Segment mapped"
            );
        }
        if !report.quality_passed {
            warnings.push(format!(
                "alignment score {:.3} below threshold {:.2}",
                report.score,
                self.engine.quality_threshold()
            ));
        }

        if ctx.cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }

        let output = self.layout.output_path(video_id)?;
        let rendered = self
            .renderer
            .render(&source, &narration, &output, video_duration, narration_duration)
            .await?;

        tracing::info!(
            video_id,
            score = report.score,
            duration = rendered.duration,
            "Render complete: {}",
            rendered.output_path.display()
        );

        Ok(StepSummary::Render(RenderSummary {
            output_path: rendered.output_path,
            duration: rendered.duration,
            alignment_score: report.score,
            quality_passed: report.quality_passed,
            scene_count: detection.cuts.len(),
            segment_count: segments.len(),
            retime_factor: rendered.plan.speed,
            alignment_degraded: detection.degraded,
            warnings,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ra_av::ToolCommand;
    use tokio_util::sync::CancellationToken;

    fn ctx(video_id: &str) -> StageContext {
        StageContext::new(None, Some(video_id.into()), CancellationToken::new())
    }

    fn config(media_dir: &std::path::Path) -> Config {
        let mut config = Config::default();
        config.media.media_dir = media_dir.to_path_buf();
        config.render.preset = "ultrafast".into();
        config
    }

    #[tokio::test]
    async fn missing_source_video_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let stage = RenderStage::from_config(&config(dir.path()), &ToolRegistry::default());
        let err = stage.run(&ctx("v1")).await.unwrap_err();
        assert!(matches!(err, Error::NotFound { .. }), "got {err}");
    }

    #[tokio::test]
    async fn renders_with_script_alignment() {
        let (Ok(ffmpeg), Ok(ffprobe)) = (which::which("ffmpeg"), which::which("ffprobe")) else {
            return;
        };
        let dir = tempfile::tempdir().unwrap();
        let cfg = config(dir.path());
        let layout = MediaLayout::new(dir.path());

        let video_dir = layout.video_dir("v1").unwrap();
        let audio_dir = layout.audio_dir("v1").unwrap();
        let script = layout.script_path("v1").unwrap();
        for d in [&video_dir, &audio_dir, &script.parent().unwrap().to_path_buf()] {
            std::fs::create_dir_all(d).unwrap();
        }
        std::fs::write(
            &script,
            r#"{"main_recap_segments": [{"text": "one", "estimated_duration": 1}, {"text": "two", "estimated_duration": 1}]}"#,
        )
        .unwrap();

        ToolCommand::new(ffmpeg.clone())
            .args(["-f", "lavfi", "-i", "testsrc=duration=2:size=160x120:rate=25"])
            .args(["-c:v", "libx264", "-y"])
            .arg(video_dir.join("source.mp4").to_string_lossy())
            .execute()
            .await
            .unwrap();
        ToolCommand::new(ffmpeg.clone())
            .args(["-f", "lavfi", "-i", "sine=frequency=440:duration=2"])
            .args(["-c:a", "aac", "-y"])
            .arg(audio_dir.join("narration.m4a").to_string_lossy())
            .execute()
            .await
            .unwrap();

        let tools = ToolRegistry::with_paths([
            ("ffmpeg".to_string(), ffmpeg),
            ("ffprobe".to_string(), ffprobe),
        ]);
        let summary = RenderStage::from_config(&cfg, &tools)
            .run(&ctx("v1"))
            .await
            .unwrap();

        let StepSummary::Render(render) = summary else {
            panic!("expected a render summary");
        };
        assert_eq!(render.output_path, layout.output_path("v1").unwrap());
        assert!(render.output_path.exists());
        assert_eq!(render.segment_count, 2);
        assert!(render.scene_count >= 2);
        assert_eq!(render.retime_factor, None);
        assert!((0.0..=1.0).contains(&render.alignment_score));
    }
}
