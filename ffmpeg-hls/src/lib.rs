//! In-process FFmpeg work for HLS playback: probing, segmenting jobs and
//! subtitle extraction.

/// Registers FFmpeg components. Call once at startup before opening any input.
pub fn init() -> anyhow::Result<()> {
    ffmpeg_next::init().map_err(|e| anyhow::anyhow!("ffmpeg_next init: {}", e))
}

pub mod decoder;
pub mod encoder;
pub mod filter;
pub mod frame;
pub mod input;
pub mod job;
pub mod metadata;
pub mod output;
pub mod side_data;
pub mod stream;
pub mod subtitle;
