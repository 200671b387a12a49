//! Per-profile remux/transcode decisions.

use ffmpeg_hls::{encoder::scaled_dimensions, job::COPY, metadata::MediaInfo};
use serde::{Deserialize, Serialize};

pub const VIDEO_ENCODER: &str = "libx264";
pub const AUDIO_ENCODER: &str = "aac";

const REMUX_VIDEO_CODECS: &[&str] = &["h264"];
const REMUX_AUDIO_CODECS: &[&str] = &["aac", "mp3", "ac3", "eac3"];
const ORIGINAL_MAX_BITRATE_KBPS: u32 = 20_000;
const ORIGINAL_AUDIO_BITRATE_KBPS: u32 = 192;
const RENDITION_AUDIO_BITRATE_KBPS: u32 = 256;

/// A named output target. Zero max dimensions mean "source size".
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QualityProfile {
    pub name: &'static str,
    pub max_width: u32,
    pub max_height: u32,
    pub video_bitrate_kbps: u32,
    pub audio_bitrate_kbps: u32,
    pub video_codec: &'static str,
    pub audio_codec: &'static str,
}

impl QualityProfile {
    const fn sized(name: &'static str, width: u32, height: u32, video: u32, audio: u32) -> Self {
        Self {
            name,
            max_width: width,
            max_height: height,
            video_bitrate_kbps: video,
            audio_bitrate_kbps: audio,
            video_codec: VIDEO_ENCODER,
            audio_codec: AUDIO_ENCODER,
        }
    }

    pub fn is_original(&self) -> bool {
        self.max_width == 0 && self.max_height == 0
    }
}

pub const PROFILES: &[QualityProfile] = &[
    QualityProfile::sized("original", 0, 0, 0, 0),
    QualityProfile::sized("2160p", 3840, 2160, 15_000, 192),
    QualityProfile::sized("1440p", 2560, 1440, 10_000, 192),
    QualityProfile::sized("1080p", 1920, 1080, 5_000, 192),
    QualityProfile::sized("720p", 1280, 720, 2_800, 128),
    QualityProfile::sized("480p", 854, 480, 1_400, 96),
    QualityProfile::sized("360p", 640, 360, 800, 96),
];

/// Profiles named in `names`, in that order. Unknown names are skipped.
pub fn enabled_profiles<S: AsRef<str>>(names: &[S]) -> Vec<QualityProfile> {
    names
        .iter()
        .filter_map(|name| PROFILES.iter().find(|p| p.name == name.as_ref()).copied())
        .collect()
}

pub fn profile_names() -> impl Iterator<Item = &'static str> {
    PROFILES.iter().map(|p| p.name)
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProfileDecision {
    pub name: String,
    pub width: u32,
    pub height: u32,
    /// 0 when the video is copied.
    pub video_bitrate_kbps: u32,
    /// 0 when the audio is copied.
    pub audio_bitrate_kbps: u32,
    /// `copy` or an encoder name.
    pub video_codec: String,
    pub audio_codec: String,
    pub needs_transcode: bool,
}

impl ProfileDecision {
    pub fn copies_video(&self) -> bool {
        self.video_codec == COPY
    }

    pub fn copies_audio(&self) -> bool {
        self.audio_codec == COPY
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TranscodeDecision {
    pub can_remux: bool,
    pub source_video_codec: String,
    pub source_audio_codec: String,
    pub source_width: u32,
    pub source_height: u32,
    /// 0 if unknown.
    pub source_bitrate_kbps: u32,
    pub profiles: Vec<ProfileDecision>,
}

/// Pure: the same inputs always give the same decision.
pub fn analyze_media(info: &MediaInfo, profiles: &[QualityProfile]) -> TranscodeDecision {
    let video_codec = info.video_codec.to_ascii_lowercase();
    let audio_codec = info
        .audio_streams
        .first()
        .map(|a| a.codec.to_ascii_lowercase())
        .unwrap_or_default();
    let can_remux_video = REMUX_VIDEO_CODECS.contains(&video_codec.as_str());
    let can_remux_audio = REMUX_AUDIO_CODECS.contains(&audio_codec.as_str());
    let source_bitrate_kbps = info.source_video_bitrate_kbps();

    let profiles = profiles
        .iter()
        .map(|profile| {
            if profile.is_original() {
                original_decision(profile, info, source_bitrate_kbps, can_remux_video, can_remux_audio)
            } else {
                sized_decision(profile, info, can_remux_video, can_remux_audio)
            }
        })
        .collect();

    TranscodeDecision {
        can_remux: can_remux_video && can_remux_audio,
        source_video_codec: video_codec,
        source_audio_codec: audio_codec,
        source_width: info.width,
        source_height: info.height,
        source_bitrate_kbps,
        profiles,
    }
}

fn original_decision(
    profile: &QualityProfile,
    info: &MediaInfo,
    source_bitrate_kbps: u32,
    can_remux_video: bool,
    can_remux_audio: bool,
) -> ProfileDecision {
    let (video_codec, video_bitrate_kbps) = if can_remux_video {
        (COPY.to_string(), 0)
    } else if source_bitrate_kbps > 0 {
        (
            profile.video_codec.to_string(),
            source_bitrate_kbps.min(ORIGINAL_MAX_BITRATE_KBPS),
        )
    } else {
        (
            profile.video_codec.to_string(),
            default_bitrate_for_height(info.height),
        )
    };
    let (audio_codec, audio_bitrate_kbps) = if can_remux_audio {
        (COPY.to_string(), 0)
    } else {
        (profile.audio_codec.to_string(), ORIGINAL_AUDIO_BITRATE_KBPS)
    };

    ProfileDecision {
        name: profile.name.to_string(),
        width: info.width,
        height: info.height,
        video_bitrate_kbps,
        audio_bitrate_kbps,
        needs_transcode: video_codec != COPY || audio_codec != COPY,
        video_codec,
        audio_codec,
    }
}

fn sized_decision(
    profile: &QualityProfile,
    info: &MediaInfo,
    can_remux_video: bool,
    can_remux_audio: bool,
) -> ProfileDecision {
    let fits_source = info.height > 0 && info.height <= profile.max_height;
    // Same dimensions the encoder's scaler produces for this profile.
    let (width, height) = if fits_source {
        (info.width, info.height)
    } else if info.height > 0 && info.width > 0 {
        scaled_dimensions(info.width, info.height, profile.max_height)
    } else {
        (profile.max_width, profile.max_height)
    };

    let transcode_video = !(fits_source && can_remux_video);
    let (video_codec, video_bitrate_kbps) = if transcode_video {
        (profile.video_codec.to_string(), profile.video_bitrate_kbps)
    } else {
        (COPY.to_string(), 0)
    };
    let (audio_codec, audio_bitrate_kbps) = if can_remux_audio && !transcode_video {
        (COPY.to_string(), 0)
    } else {
        (profile.audio_codec.to_string(), profile.audio_bitrate_kbps)
    };

    ProfileDecision {
        name: profile.name.to_string(),
        width,
        height,
        video_bitrate_kbps,
        audio_bitrate_kbps,
        needs_transcode: video_codec != COPY || audio_codec != COPY,
        video_codec,
        audio_codec,
    }
}

/// Fallback bitrate when an original-quality transcode has no source bitrate.
pub fn default_bitrate_for_height(height: u32) -> u32 {
    match height {
        h if h >= 2160 => 15_000,
        h if h >= 1440 => 10_000,
        h if h >= 1080 => 5_000,
        h if h >= 720 => 2_800,
        _ => 1_400,
    }
}

/// Codec and bitrate for a standalone audio rendition. HLS-friendly codecs are copied.
pub fn audio_rendition_codec(source_codec: &str) -> (&'static str, u32) {
    if REMUX_AUDIO_CODECS.contains(&source_codec.to_ascii_lowercase().as_str()) {
        (COPY, 0)
    } else {
        (AUDIO_ENCODER, RENDITION_AUDIO_BITRATE_KBPS)
    }
}

#[cfg(test)]
#[path = "decision_test.rs"]
mod decision_test;
