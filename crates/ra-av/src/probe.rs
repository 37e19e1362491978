//! Container duration probing via ffprobe.

use std::path::Path;
use std::time::Duration;

use ra_core::{Error, Result};

use crate::command::ToolCommand;

/// Return the container duration of `file` in seconds.
///
/// Runs `ffprobe -v error -show_entries format=duration -of
/// default=noprint_wrappers=1:nokey=1 <file>` under `timeout`.
pub async fn probe_duration(ffprobe: &Path, file: &Path, timeout: Duration) -> Result<f64> {
    let output = ToolCommand::new(ffprobe.to_path_buf())
        .args([
            "-v",
            "error",
            "-show_entries",
            "format=duration",
            "-of",
            "default=noprint_wrappers=1:nokey=1",
        ])
        .arg(file.to_string_lossy())
        .timeout(timeout)
        .execute()
        .await?;

    parse_duration(&output.stdout).ok_or_else(|| {
        Error::tool(
            "ffprobe",
            format!(
                "no duration for {}: {:?}",
                file.display(),
                output.stdout.trim()
            ),
        )
    })
}

/// Parse ffprobe's bare duration output. `N/A` and negatives are rejected.
fn parse_duration(stdout: &str) -> Option<f64> {
    stdout
        .lines()
        .map(str::trim)
        .find(|l| !l.is_empty())
        .and_then(|l| l.parse::<f64>().ok())
        .filter(|d| d.is_finite() && *d >= 0.0)
}
