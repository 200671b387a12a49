//! Collaborators that turn a media identifier into probed metadata.

use std::path::{Path, PathBuf};

use ffmpeg_hls::metadata::MediaInfo;

use crate::{error::PlaybackError, playback::manifest::is_safe_path_component};

pub trait MediaProber: Send + Sync {
    fn probe(&self, path: &Path) -> anyhow::Result<MediaInfo>;
}

pub trait FileResolver: Send + Sync {
    /// Absolute path of the file behind `media_id`. A malformed id fails
    /// with [`PlaybackError::InvalidPath`].
    fn resolve(&self, media_id: &str) -> anyhow::Result<PathBuf>;
}

/// Probes with the in-process FFmpeg demuxer.
#[derive(Debug, Default, Clone, Copy)]
pub struct FfmpegProber;

impl MediaProber for FfmpegProber {
    fn probe(&self, path: &Path) -> anyhow::Result<MediaInfo> {
        ffmpeg_hls::metadata::probe(path)
    }
}

/// Media identifiers are paths relative to a library root.
#[derive(Debug, Clone)]
pub struct LibraryResolver {
    root: PathBuf,
}

impl LibraryResolver {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }
}

impl FileResolver for LibraryResolver {
    fn resolve(&self, media_id: &str) -> anyhow::Result<PathBuf> {
        let mut path = self.root.clone();
        for component in media_id.split('/') {
            if !is_safe_path_component(component) {
                return Err(PlaybackError::InvalidPath(media_id.to_string()).into());
            }
            path.push(component);
        }
        let metadata = std::fs::metadata(&path)
            .map_err(|e| anyhow::anyhow!("media {} not found: {}", media_id, e))?;
        if !metadata.is_file() {
            anyhow::bail!("media {} is not a file", media_id);
        }
        Ok(std::path::absolute(&path)?)
    }
}
