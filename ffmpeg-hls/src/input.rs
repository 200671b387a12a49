use std::path::Path;

use ffmpeg_next::codec::packet::Packet;
use tokio_util::sync::CancellationToken;

use crate::stream::AvStream;

/// FFmpeg timestamps at container level are expressed in 1/AV_TIME_BASE seconds.
pub const AV_TIME_BASE: i64 = 1_000_000;

/// A demuxer whose blocking I/O aborts as soon as `cancel` fires.
pub struct AvInput {
    inner: ffmpeg_next::format::context::Input,
    streams: Vec<AvStream>,
}

impl AvInput {
    pub fn open(path: &Path, cancel: &CancellationToken) -> anyhow::Result<Self> {
        let interrupt = cancel.clone();
        let input =
            ffmpeg_next::format::input_with_interrupt(path, move || interrupt.is_cancelled())
                .map_err(|e| anyhow::anyhow!("open input {}: {}", path.display(), e))?;

        let streams = input.streams().map(AvStream::from).collect();
        Ok(Self {
            inner: input,
            streams,
        })
    }

    pub fn streams(&self) -> &[AvStream] {
        &self.streams
    }

    pub fn stream(&self, index: usize) -> Option<&AvStream> {
        self.streams.iter().find(|s| s.index() == index)
    }

    pub fn format_name(&self) -> String {
        self.inner.format().name().to_string()
    }

    /// Container duration in seconds, `None` when the demuxer cannot tell.
    pub fn duration_seconds(&self) -> Option<f64> {
        let d = self.inner.duration();
        if d == ffmpeg_next::ffi::AV_NOPTS_VALUE as i64 || d <= 0 {
            None
        } else {
            Some(d as f64 / AV_TIME_BASE as f64)
        }
    }

    /// Overall bitrate in bits per second, 0 if unknown.
    pub fn bit_rate(&self) -> i64 {
        self.inner.bit_rate()
    }

    /// Seeks to the closest keyframe at or before `seconds`.
    pub fn seek_seconds(&mut self, seconds: f64) -> anyhow::Result<()> {
        if seconds <= 0.0 {
            return Ok(());
        }
        let ts = (seconds * AV_TIME_BASE as f64) as i64;
        self.inner
            .seek(ts, ..ts)
            .map_err(|e| anyhow::anyhow!("seek to {:.3}s: {}", seconds, e))
    }

    /// Picks the video stream to process. A selector that does not point at a
    /// video stream falls back to the first video stream of the container.
    pub fn select_video(&self, selector: Option<usize>) -> Option<&AvStream> {
        let index = selector?;
        self.stream(index)
            .filter(|s| s.is_video())
            .or_else(|| self.streams.iter().find(|s| s.is_video()))
    }

    /// Picks an audio stream by its position among the container's audio streams.
    pub fn select_audio(&self, ordinal: Option<usize>) -> Option<&AvStream> {
        let ordinal = ordinal?;
        self.streams.iter().filter(|s| s.is_audio()).nth(ordinal)
    }

    /// Reads the next packet; `Ok(None)` at end of input.
    pub fn read_packet(&mut self) -> Result<Option<Packet>, ffmpeg_next::Error> {
        let mut packet = Packet::empty();
        match packet.read(&mut self.inner) {
            Ok(()) => Ok(Some(packet)),
            Err(ffmpeg_next::Error::Eof) => Ok(None),
            Err(err) => Err(err),
        }
    }
}
