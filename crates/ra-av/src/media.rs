//! Per-video media directory layout.
//!
//! ```text
//! <media_dir>/videos/<video_id>/<source>.{mp4,mkv,webm}
//! <media_dir>/audio/<video_id>/<narration>.{mp3,wav,m4a,aac,ogg}
//! <media_dir>/scripts/<video_id>/script.json
//! <media_dir>/output/<video_id>/final_video.mp4
//! ```

use std::path::{Path, PathBuf};

use ra_core::{Error, Result};

const VIDEO_EXTENSIONS: &[&str] = &["mp4", "mkv", "webm"];
const AUDIO_EXTENSIONS: &[&str] = &["mp3", "wav", "m4a", "aac", "ogg"];

/// File name of the rendered output.
pub const FINAL_VIDEO: &str = "final_video.mp4";

/// Resolves input and output paths for a video id under one media root.
#[derive(Debug, Clone)]
pub struct MediaLayout {
    root: PathBuf,
}

impl MediaLayout {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Reject ids that would escape the media root.
    fn checked(video_id: &str) -> Result<&str> {
        let ok = !video_id.is_empty()
            && video_id != "."
            && video_id != ".."
            && !video_id.contains(&['/', '\\', '\0'][..]);
        if ok {
            Ok(video_id)
        } else {
            Err(Error::Validation(format!("invalid video_id: {video_id:?}")))
        }
    }

    pub fn video_dir(&self, video_id: &str) -> Result<PathBuf> {
        Ok(self.root.join("videos").join(Self::checked(video_id)?))
    }

    pub fn audio_dir(&self, video_id: &str) -> Result<PathBuf> {
        Ok(self.root.join("audio").join(Self::checked(video_id)?))
    }

    pub fn script_path(&self, video_id: &str) -> Result<PathBuf> {
        Ok(self
            .root
            .join("scripts")
            .join(Self::checked(video_id)?)
            .join("script.json"))
    }

    pub fn output_path(&self, video_id: &str) -> Result<PathBuf> {
        Ok(self
            .root
            .join("output")
            .join(Self::checked(video_id)?)
            .join(FINAL_VIDEO))
    }

    /// First source video in `videos/<id>` by file name.
    pub fn find_source_video(&self, video_id: &str) -> Result<PathBuf> {
        find_with_extension(&self.video_dir(video_id)?, VIDEO_EXTENSIONS)
            .ok_or_else(|| Error::not_found("source video", video_id))
    }

    /// First narration track in `audio/<id>` by file name.
    pub fn find_narration(&self, video_id: &str) -> Result<PathBuf> {
        find_with_extension(&self.audio_dir(video_id)?, AUDIO_EXTENSIONS)
            .ok_or_else(|| Error::not_found("narration audio", video_id))
    }
}

fn find_with_extension(dir: &Path, extensions: &[&str]) -> Option<PathBuf> {
    let entries = std::fs::read_dir(dir).ok()?;
    let mut matches: Vec<PathBuf> = entries
        .filter_map(|e| e.ok())
        .map(|e| e.path())
        .filter(|p| p.is_file())
        .filter(|p| {
            p.extension()
                .and_then(|e| e.to_str())
                .map(|e| extensions.contains(&e.to_ascii_lowercase().as_str()))
                .unwrap_or(false)
        })
        .collect();
    matches.sort();
    matches.into_iter().next()
}
