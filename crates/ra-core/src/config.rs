//! Application configuration types.
//!
//! The top-level [`Config`] struct is deserialized from TOML and carries all
//! sub-configs for the server, media layout, tools, timeouts, rendering, and
//! external stage commands. Every section defaults sensibly so an empty file
//! is valid.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::job::Step;
use crate::Error;

/// Environment variable that overrides `media.media_dir`.
pub const MEDIA_DIR_ENV: &str = "MEDIA_DIR";

/// Locations searched when no config path is given.
const DEFAULT_PATHS: &[&str] = &[
    "./config.toml",
    "./recap-autopilot.toml",
    "~/.config/recap-autopilot/config.toml",
    "/etc/recap-autopilot/config.toml",
];

// ---------------------------------------------------------------------------
// Top-level Config
// ---------------------------------------------------------------------------

/// Root application configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub server: ServerConfig,
    pub media: MediaConfig,
    pub tools: ToolsConfig,
    pub timeouts: TimeoutsConfig,
    pub render: RenderConfig,
    pub aligner: AlignerConfig,
    /// External collaborator commands keyed by step name.
    pub stages: BTreeMap<String, StageCommand>,
}

impl Config {
    /// Deserialize a `Config` from a TOML string.
    pub fn from_toml(toml_str: &str) -> Result<Self> {
        toml::from_str(toml_str).map_err(|e| Error::Validation(format!("config parse error: {e}")))
    }

    /// Load configuration from a TOML file.
    pub fn load(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let mut config = Self::from_toml(&contents)?;
        config.apply_env_overrides();
        Ok(config)
    }

    /// Load from `custom_path`, else the first default location that exists,
    /// else defaults.
    ///
    /// An explicit path that cannot be read or parsed is an error; the default
    /// locations are only probed for existence.
    pub fn load_or_default(custom_path: Option<&Path>) -> Result<Self> {
        if let Some(path) = custom_path {
            return Self::load(path);
        }

        for path_str in DEFAULT_PATHS {
            let expanded = shellexpand::tilde(path_str);
            let path = Path::new(expanded.as_ref());
            if path.exists() {
                tracing::info!("Loading config from {}", path.display());
                return Self::load(path);
            }
        }

        tracing::info!("No config file found; using defaults");
        let mut config = Self::default();
        config.apply_env_overrides();
        Ok(config)
    }

    /// Apply environment variable overrides.
    pub fn apply_env_overrides(&mut self) {
        if let Ok(dir) = std::env::var(MEDIA_DIR_ENV) {
            if !dir.is_empty() {
                self.media.media_dir = PathBuf::from(dir);
            }
        }
    }

    /// Command configured for an external stage, if any.
    pub fn stage(&self, step: Step) -> Option<&StageCommand> {
        self.stages.get(step.as_str())
    }

    /// Return a list of validation warnings (non-fatal issues).
    pub fn validate(&self) -> Vec<String> {
        let mut warnings = Vec::new();

        if self.server.port == 0 {
            warnings.push("server.port is 0; a random port will be assigned".into());
        }

        if self.media.media_dir.as_os_str().is_empty() {
            warnings.push("media.media_dir is empty".into());
        }

        let r = &self.render;
        if !(0.0..=1.0).contains(&r.scene_threshold) {
            warnings.push(format!(
                "render.scene_threshold {} is outside 0..=1",
                r.scene_threshold
            ));
        }
        if !(0.0..=1.0).contains(&r.quality_threshold) {
            warnings.push(format!(
                "render.quality_threshold {} is outside 0..=1",
                r.quality_threshold
            ));
        }
        if r.retime_threshold < 0.0 {
            warnings.push("render.retime_threshold is negative".into());
        }

        for name in self.stages.keys() {
            match name.parse::<Step>() {
                Ok(Step::Render) => warnings.push(
                    "stages.render is ignored; rendering is built in".into(),
                ),
                Ok(_) => {}
                Err(_) => warnings.push(format!("stages.{name} is not a known step")),
            }
        }

        for (name, stage) in &self.stages {
            if stage.command.is_empty() {
                warnings.push(format!("stages.{name}.command is empty"));
            }
        }

        for step in Step::ALL {
            if step != Step::Render && self.stage(step).is_none() {
                warnings.push(format!(
                    "stages.{step} is not configured; jobs will fail at that step"
                ));
            }
        }

        if self.aligner.command.is_empty() {
            warnings.push(
                "aligner.command is not set; narration timing falls back to script estimates"
                    .into(),
            );
        }

        warnings
    }
}

// ---------------------------------------------------------------------------
// Sub-configs
// ---------------------------------------------------------------------------

/// HTTP server settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub db_path: PathBuf,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".into(),
            port: 8000,
            db_path: PathBuf::from("data/recap-autopilot.db"),
        }
    }
}

/// Media directory layout root.
///
/// Source videos live in `videos/<id>`, narration in `audio/<id>`, scripts in
/// `scripts/<id>/script.json`, and renders are written to `output/<id>`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MediaConfig {
    pub media_dir: PathBuf,
}

impl Default for MediaConfig {
    fn default() -> Self {
        Self {
            media_dir: PathBuf::from("/app/media"),
        }
    }
}

/// Optional explicit paths for external tools.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ToolsConfig {
    pub ffmpeg_path: Option<PathBuf>,
    pub ffprobe_path: Option<PathBuf>,
}

/// Timeout ceilings for external calls, in seconds.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TimeoutsConfig {
    pub probe: u64,
    pub scene_detect: u64,
    pub align: u64,
    pub render: u64,
    pub stage: u64,
}

impl Default for TimeoutsConfig {
    fn default() -> Self {
        Self {
            probe: 30,
            scene_detect: 600,
            align: 600,
            render: 1800,
            stage: 3600,
        }
    }
}

impl TimeoutsConfig {
    pub fn probe(&self) -> Duration {
        Duration::from_secs(self.probe)
    }

    pub fn scene_detect(&self) -> Duration {
        Duration::from_secs(self.scene_detect)
    }

    pub fn align(&self) -> Duration {
        Duration::from_secs(self.align)
    }

    pub fn render(&self) -> Duration {
        Duration::from_secs(self.render)
    }

    pub fn stage(&self) -> Duration {
        Duration::from_secs(self.stage)
    }
}

/// Render-step tuning: scene sensitivity, retime and quality thresholds, and
/// encoder settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RenderConfig {
    pub scene_threshold: f64,
    /// Duration gap (seconds) above which a shorter video is slowed down.
    pub retime_threshold: f64,
    pub quality_threshold: f64,
    pub video_codec: String,
    pub preset: String,
    pub crf: u32,
    pub audio_codec: String,
    pub audio_bitrate: String,
}

impl Default for RenderConfig {
    fn default() -> Self {
        Self {
            scene_threshold: 0.3,
            retime_threshold: 5.0,
            quality_threshold: 0.7,
            video_codec: "libx264".into(),
            preset: "medium".into(),
            crf: 23,
            audio_codec: "aac".into(),
            audio_bitrate: "192k".into(),
        }
    }
}

/// Forced-alignment command. Empty means "use script estimates".
///
/// The command receives `{audio}` and `{video_id}` substitutions and must
/// print a JSON array of `{start, end, text}` segments.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AlignerConfig {
    pub command: Vec<String>,
}

/// External command for one collaborator stage.
///
/// Arguments may contain `{video_id}`. The command must print a JSON object
/// to stdout, which becomes the step summary.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StageCommand {
    pub command: Vec<String>,
    /// Overrides `timeouts.stage` for this command.
    #[serde(default)]
    pub timeout_secs: Option<u64>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_toml_is_valid() {
        let config = Config::from_toml("").unwrap();
        assert_eq!(config.server.port, 8000);
        assert_eq!(config.timeouts.render, 1800);
        assert_eq!(config.render.crf, 23);
        assert!(config.stages.is_empty());
    }

    #[test]
    fn parses_stage_commands() {
        let config = Config::from_toml(
            r#"
            [stages.ingest]
            command = ["ingest-cli", "{video_id}"]

            [stages.upload]
            command = ["upload-cli", "--id", "{video_id}"]
            timeout_secs = 120
            "#,
        )
        .unwrap();

        let ingest = config.stage(Step::Ingest).unwrap();
        assert_eq!(ingest.command, vec!["ingest-cli", "{video_id}"]);
        assert_eq!(ingest.timeout_secs, None);
        assert_eq!(config.stage(Step::Upload).unwrap().timeout_secs, Some(120));
        assert!(config.stage(Step::Voice).is_none());
    }

    #[test]
    fn partial_sections_keep_defaults() {
        let config = Config::from_toml(
            r#"
            [render]
            crf = 18
            "#,
        )
        .unwrap();
        assert_eq!(config.render.crf, 18);
        assert_eq!(config.render.preset, "medium");
        assert_eq!(config.render.quality_threshold, 0.7);
    }

    #[test]
    fn invalid_toml_is_validation_error() {
        let err = Config::from_toml("[server\nport = 1").unwrap_err();
        assert!(matches!(err, Error::Validation(_)));
    }

    #[test]
    fn load_reads_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "[server]\nport = 9100\n").unwrap();
        let config = Config::load(&path).unwrap();
        assert_eq!(config.server.port, 9100);
    }

    #[test]
    fn load_missing_explicit_path_fails() {
        let dir = tempfile::tempdir().unwrap();
        let result = Config::load_or_default(Some(&dir.path().join("nope.toml")));
        assert!(matches!(result, Err(Error::Io { .. })));
    }

    #[test]
    fn validate_flags_problems() {
        let mut config = Config::default();
        config.server.port = 0;
        config.render.scene_threshold = 1.5;
        config.stages.insert(
            "encode".into(),
            StageCommand {
                command: vec!["x".into()],
                timeout_secs: None,
            },
        );

        let warnings = config.validate();
        assert!(warnings.iter().any(|w| w.contains("server.port")));
        assert!(warnings.iter().any(|w| w.contains("scene_threshold")));
        assert!(warnings.iter().any(|w| w.contains("stages.encode")));
        assert!(warnings.iter().any(|w| w.contains("stages.ingest is not configured")));
        assert!(!warnings.iter().any(|w| w.contains("stages.render is not configured")));
    }

    #[test]
    fn timeouts_as_durations() {
        let t = TimeoutsConfig::default();
        assert_eq!(t.probe(), Duration::from_secs(30));
        assert_eq!(t.scene_detect(), Duration::from_secs(600));
    }
}
