//! Media file metadata (similar to ffprobe), shaped for playback decisions.

use std::path::Path;

use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::input::AvInput;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AudioStreamInfo {
    /// Position among the container's audio streams.
    pub index: usize,
    /// Absolute stream index in the container.
    pub stream_index: usize,
    pub codec: String,
    pub channels: u32,
    pub sample_rate: u32,
    pub language: String,
    pub title: String,
    pub is_default: bool,
    /// 0 if unknown.
    pub bitrate_kbps: u32,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SubtitleStreamInfo {
    /// Position among the container's subtitle streams.
    pub index: usize,
    pub stream_index: usize,
    pub codec: String,
    pub language: String,
    pub title: String,
    pub is_default: bool,
    pub is_forced: bool,
}

/// Probe result. Video fields are empty/zero when the file has no video.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MediaInfo {
    pub container: String,
    pub duration_seconds: f64,
    /// Overall bitrate in kbps; 0 if unknown.
    pub bitrate_kbps: u32,
    pub video_codec: String,
    pub width: u32,
    pub height: u32,
    /// Video stream bitrate in kbps; 0 if unknown.
    pub video_bitrate_kbps: u32,
    pub frame_rate: f64,
    pub audio_streams: Vec<AudioStreamInfo>,
    pub subtitle_streams: Vec<SubtitleStreamInfo>,
}

impl MediaInfo {
    /// Best known video bitrate: the stream's own, else the container's.
    pub fn source_video_bitrate_kbps(&self) -> u32 {
        if self.video_bitrate_kbps > 0 {
            self.video_bitrate_kbps
        } else {
            self.bitrate_kbps
        }
    }
}

/// Opens a file and returns its playback-relevant metadata.
pub fn probe(path: &Path) -> anyhow::Result<MediaInfo> {
    let input = AvInput::open(path, &CancellationToken::new())?;

    let mut info = MediaInfo {
        container: input.format_name(),
        duration_seconds: input.duration_seconds().unwrap_or(0.0),
        bitrate_kbps: kbps(input.bit_rate()),
        ..Default::default()
    };

    if let Some(video) = input.streams().iter().find(|s| s.is_video()) {
        info.video_codec = video.codec_name().to_string();
        info.width = video.width();
        info.height = video.height();
        info.video_bitrate_kbps = kbps(parameters_bit_rate(video.parameters()));
        let rate = video.rate();
        if rate.numerator() > 0 && rate.denominator() > 0 {
            info.frame_rate = rate.numerator() as f64 / rate.denominator() as f64;
        }
    }

    for (ordinal, stream) in input.streams().iter().filter(|s| s.is_audio()).enumerate() {
        let (sample_rate, channels) = audio_params_from_parameters(stream.parameters());
        info.audio_streams.push(AudioStreamInfo {
            index: ordinal,
            stream_index: stream.index(),
            codec: stream.codec_name().to_string(),
            channels,
            sample_rate,
            language: stream.language().to_string(),
            title: stream.title().to_string(),
            is_default: stream.is_default(),
            bitrate_kbps: kbps(parameters_bit_rate(stream.parameters())),
        });
    }
    for (ordinal, stream) in input
        .streams()
        .iter()
        .filter(|s| s.is_subtitle())
        .enumerate()
    {
        info.subtitle_streams.push(SubtitleStreamInfo {
            index: ordinal,
            stream_index: stream.index(),
            codec: stream.codec_name().to_string(),
            language: stream.language().to_string(),
            title: stream.title().to_string(),
            is_default: stream.is_default(),
            is_forced: stream.is_forced(),
        });
    }

    Ok(info)
}

fn kbps(bits_per_second: i64) -> u32 {
    (bits_per_second.max(0) / 1000) as u32
}

/// Reads the declared stream bitrate from codec parameters (not exposed by ffmpeg-next).
fn parameters_bit_rate(params: &ffmpeg_next::codec::Parameters) -> i64 {
    unsafe {
        let ptr = params.as_ptr();
        (*ptr).bit_rate
    }
}

/// Reads audio sample rate and channel count from codec parameters.
fn audio_params_from_parameters(params: &ffmpeg_next::codec::Parameters) -> (u32, u32) {
    unsafe {
        let ptr = params.as_ptr();
        let sr = (*ptr).sample_rate;
        let ch = (*ptr).ch_layout.nb_channels;
        (sr.max(0) as u32, ch.max(0) as u32)
    }
}
