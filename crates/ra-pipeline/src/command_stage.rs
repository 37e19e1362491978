//! Collaborator stages run as configured external commands.

use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;

use ra_av::ToolCommand;
use ra_core::config::StageCommand;
use ra_core::{Error, OpaqueSummary, Result, Step, StepSummary};

use crate::stage::{Stage, StageContext};

/// Runs `[stages.<step>].command`, substituting `{video_id}` in each
/// argument. The command's stdout must be a JSON object, which becomes the
/// step summary. Blank stdout is an empty summary.
#[derive(Debug, Clone)]
pub struct CommandStage {
    step: Step,
    command: Option<StageCommand>,
    default_timeout: Duration,
}

impl CommandStage {
    pub fn new(step: Step, command: Option<StageCommand>, default_timeout: Duration) -> Self {
        Self {
            step,
            command,
            default_timeout,
        }
    }

    fn build(&self, video_id: Option<&str>) -> Result<ToolCommand> {
        let cfg = self
            .command
            .as_ref()
            .filter(|c| !c.command.is_empty())
            .ok_or_else(|| Error::stage(self.step.as_str(), "stage not configured"))?;

        let video_id = video_id.unwrap_or_default();
        let mut parts = cfg.command.iter().map(|a| a.replace("{video_id}", video_id));
        let program = parts
            .next()
            .ok_or_else(|| Error::stage(self.step.as_str(), "stage not configured"))?;

        let timeout = cfg
            .timeout_secs
            .map(Duration::from_secs)
            .unwrap_or(self.default_timeout);

        let mut cmd = ToolCommand::new(PathBuf::from(program));
        cmd.args(parts).timeout(timeout);
        Ok(cmd)
    }
}

fn parse_summary(stdout: &str) -> Result<OpaqueSummary> {
    let trimmed = stdout.trim();
    if trimmed.is_empty() {
        return Ok(OpaqueSummary::new());
    }
    match serde_json::from_str(trimmed)? {
        serde_json::Value::Object(map) => Ok(map),
        other => Err(Error::Validation(format!(
            "expected a JSON object on stdout, got {other}"
        ))),
    }
}

#[async_trait]
impl Stage for CommandStage {
    fn step(&self) -> Step {
        self.step
    }

    async fn run(&self, ctx: &StageContext) -> Result<StepSummary> {
        let video_id = match self.step {
            Step::Discover => ctx.video_id.as_deref(),
            step => Some(ctx.require_video_id(step)?),
        };
        let cmd = self.build(video_id)?;
        tracing::info!(step = %self.step, "exec: {} {}", cmd.program_name(), cmd.get_args().join(" "));

        let run = async {
            let output = cmd.execute().await?;
            let map = parse_summary(&output.stdout)?;
            StepSummary::opaque(self.step, map)
        };
        run.await
            .map_err(|e| Error::wrap_stage(self.step.as_str(), e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use tokio_util::sync::CancellationToken;

    fn ctx(video_id: Option<&str>) -> StageContext {
        StageContext::new(None, video_id.map(String::from), CancellationToken::new())
    }

    fn stage(step: Step, command: &[&str]) -> CommandStage {
        CommandStage::new(
            step,
            Some(StageCommand {
                command: command.iter().map(|s| s.to_string()).collect(),
                timeout_secs: None,
            }),
            Duration::from_secs(10),
        )
    }

    #[tokio::test]
    async fn unconfigured_stage_fails() {
        let stage = CommandStage::new(Step::Voice, None, Duration::from_secs(1));
        let err = stage.run(&ctx(Some("v1"))).await.unwrap_err();
        assert_matches!(err, Error::Stage { ref step, ref message, .. } => {
            assert_eq!(step, "voice");
            assert_eq!(message, "stage not configured");
        });
    }

    #[test]
    fn substitutes_video_id() {
        let cmd = stage(Step::Ingest, &["ingest", "--id", "{video_id}", "x{video_id}"])
            .build(Some("abc"))
            .unwrap();
        assert_eq!(cmd.program_name(), "ingest");
        assert_eq!(cmd.get_args(), ["--id", "abc", "xabc"]);
    }

    #[test]
    fn parses_object_summaries() {
        assert!(parse_summary("  \n").unwrap().is_empty());
        assert_eq!(parse_summary(r#"{"a": 1}"#).unwrap()["a"], 1);
        assert_matches!(parse_summary("[1, 2]"), Err(Error::Validation(_)));
    }

    #[tokio::test]
    async fn stdout_becomes_summary() {
        if which::which("echo").is_err() {
            return;
        }
        let summary = stage(Step::Upload, &["echo", r#"{"youtube_id": "{video_id}"}"#])
            .run(&ctx(Some("v9")))
            .await
            .unwrap();
        assert_matches!(summary, StepSummary::Upload(map) => {
            assert_eq!(map["youtube_id"], "v9");
        });
    }

    #[tokio::test]
    async fn discover_reports_selected_video() {
        if which::which("echo").is_err() {
            return;
        }
        let summary = stage(Step::Discover, &["echo", r#"{"video_id": "picked", "score": 3}"#])
            .run(&ctx(None))
            .await
            .unwrap();
        assert_eq!(summary.discovered_video_id(), Some("picked"));
    }

    #[tokio::test]
    async fn tool_failure_is_wrapped_as_stage_error() {
        let err = stage(Step::Script, &["nonexistent_stage_cli_xyz"])
            .run(&ctx(Some("v1")))
            .await
            .unwrap_err();
        assert_matches!(err, Error::Stage { ref step, source: Some(_), .. } if step == "script");
        assert!(err.trace().contains("caused by"));
    }

    #[tokio::test]
    async fn non_discover_stage_needs_video_id() {
        let err = stage(Step::Ingest, &["echo", "{}"]).run(&ctx(None)).await.unwrap_err();
        assert!(err.to_string().contains("no video_id"));
    }
}
