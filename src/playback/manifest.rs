//! Playlist text, RFC 6381 codec strings and on-disk playlist lookup.

use std::{
    fmt::Write as _,
    path::{Component, Path, PathBuf},
};

use ffmpeg_hls::output::PLAYLIST_NAME;
use tokio_util::sync::CancellationToken;

use crate::{
    config::PlaylistWait,
    error::{PlaybackError, PlaybackResult},
    playback::decision::ProfileDecision,
};

pub const AUDIO_GROUP: &str = "audio";
pub const SUBTITLE_GROUP: &str = "subs";
pub const AUDIO_DIR: &str = "audio";
pub const SUBTITLE_DIR: &str = "subs";

const UNKNOWN_AUDIO_BITRATE_KBPS: u64 = 192;
const BANDWIDTH_OVERHEAD: f64 = 1.10;
const DEFAULT_AUDIO_CODEC_STRING: &str = "mp4a.40.2";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProfileVariant {
    pub name: String,
    pub width: u32,
    pub height: u32,
    /// Bits per second.
    pub bandwidth: u64,
    /// Codec actually delivered: the source codec for copies, else the encoder.
    pub video_codec: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AudioVariant {
    pub index: usize,
    pub name: String,
    pub language: String,
    pub channels: u32,
    pub is_default: bool,
    pub codec: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubtitleVariant {
    pub index: usize,
    pub name: String,
    pub language: String,
    pub is_default: bool,
}

/// Title, else language, else `Track {index}`.
pub fn display_name(title: &str, language: &str, index: usize) -> String {
    if !title.is_empty() {
        title.to_string()
    } else if !language.is_empty() {
        language.to_string()
    } else {
        format!("Track {}", index)
    }
}

fn default_video_kbps_for_height(height: u32) -> u64 {
    match height {
        h if h >= 2160 => 40_000,
        h if h >= 1440 => 20_000,
        h if h >= 1080 => 10_000,
        h if h >= 720 => 5_000,
        _ => 2_000,
    }
}

/// Peak bits per second advertised for a variant.
pub fn estimate_bandwidth(
    profile: &ProfileDecision,
    source_video_kbps: u32,
    source_audio_kbps: u32,
) -> u64 {
    let video_kbps = match (profile.video_bitrate_kbps, source_video_kbps) {
        (0, 0) => default_video_kbps_for_height(profile.height),
        (0, source) => source as u64,
        (explicit, _) => explicit as u64,
    };
    let audio_kbps = match (profile.audio_bitrate_kbps, source_audio_kbps) {
        (0, 0) => UNKNOWN_AUDIO_BITRATE_KBPS,
        (0, source) => source as u64,
        (explicit, _) => explicit as u64,
    };
    (((video_kbps + audio_kbps) * 1000) as f64 * BANDWIDTH_OVERHEAD) as u64
}

pub fn profile_variants_from_decision(
    profiles: &[ProfileDecision],
    source_video_codec: &str,
    source_video_kbps: u32,
    source_audio_kbps: u32,
) -> Vec<ProfileVariant> {
    profiles
        .iter()
        .map(|profile| ProfileVariant {
            name: profile.name.clone(),
            width: profile.width,
            height: profile.height,
            bandwidth: estimate_bandwidth(profile, source_video_kbps, source_audio_kbps),
            video_codec: if profile.copies_video() {
                source_video_codec.to_string()
            } else {
                profile.video_codec.clone()
            },
        })
        .collect()
}

pub fn h264_codec_string(height: u32) -> String {
    let level: u8 = match height {
        h if h >= 2160 => 0x33,
        h if h >= 1440 => 0x32,
        h if h >= 1080 => 0x28,
        h if h >= 720 => 0x1f,
        _ => 0x1e,
    };
    format!("avc1.6400{:02x}", level)
}

/// Main 10 tier string without constraint bytes.
pub fn hevc_codec_string(height: u32) -> String {
    let level = match height {
        h if h >= 2160 => 150,
        h if h >= 1080 => 120,
        h if h >= 720 => 93,
        _ => 90,
    };
    format!("hvc1.2.4.L{}", level)
}

pub fn av1_codec_string(height: u32) -> String {
    let level = match height {
        h if h >= 2160 => 13,
        h if h >= 1440 => 12,
        h if h >= 1080 => 9,
        h if h >= 720 => 8,
        _ => 4,
    };
    format!("av01.0.{:02}M.10", level)
}

/// Accepts codec names as probed (`h264`) or as encoder names (`libx264`).
pub fn video_codec_string(codec: &str, height: u32) -> String {
    match codec.to_ascii_lowercase().as_str() {
        "hevc" | "h265" | "libx265" | "hvc1" | "hev1" => hevc_codec_string(height),
        "av1" | "av01" | "libaom-av1" | "libsvtav1" | "libdav1d" => av1_codec_string(height),
        _ => h264_codec_string(height),
    }
}

pub fn audio_codec_string(codec: &str) -> &'static str {
    match codec.to_ascii_lowercase().as_str() {
        "aac" => "mp4a.40.2",
        "ac3" => "ac-3",
        "eac3" => "ec-3",
        "opus" => "Opus",
        "flac" => "fLaC",
        "mp3" => "mp4a.40.34",
        "dts" => "dtsc",
        "dts-hd" | "dtshd" | "dts_hd_ma" => "dtsh",
        "dts-x" | "dtsx" => "dtsx",
        "truehd" | "mlp" => "mlpa",
        _ => DEFAULT_AUDIO_CODEC_STRING,
    }
}

/// Keeps the first four dot components of an HEVC codec string. Media source
/// implementations reject the trailing constraint bytes.
pub fn clean_hevc_codec_string(codec: &str) -> String {
    if !(codec.starts_with("hvc1.") || codec.starts_with("hev1.")) {
        return codec.to_string();
    }
    codec.split('.').take(4).collect::<Vec<_>>().join(".")
}

fn yes_no(flag: bool) -> &'static str {
    if flag { "YES" } else { "NO" }
}

fn quoted(value: &str) -> String {
    value.replace('"', "'")
}

pub fn generate_master_playlist(
    profiles: &[ProfileVariant],
    audio: &[AudioVariant],
    subtitles: &[SubtitleVariant],
) -> String {
    let mut out = String::from("#EXTM3U\n#EXT-X-VERSION:3\n#EXT-X-INDEPENDENT-SEGMENTS\n");

    for track in audio {
        let _ = write!(
            out,
            "#EXT-X-MEDIA:TYPE=AUDIO,GROUP-ID=\"{}\",NAME=\"{}\",DEFAULT={},AUTOSELECT={}",
            AUDIO_GROUP,
            quoted(&track.name),
            yes_no(track.is_default),
            yes_no(track.is_default),
        );
        if !track.language.is_empty() {
            let _ = write!(out, ",LANGUAGE=\"{}\"", quoted(&track.language));
        }
        if track.channels > 0 {
            let _ = write!(out, ",CHANNELS=\"{}\"", track.channels);
        }
        let _ = writeln!(out, ",URI=\"{}/{}/{}\"", AUDIO_DIR, track.index, PLAYLIST_NAME);
    }

    for track in subtitles {
        let _ = write!(
            out,
            "#EXT-X-MEDIA:TYPE=SUBTITLES,GROUP-ID=\"{}\",NAME=\"{}\",DEFAULT={}",
            SUBTITLE_GROUP,
            quoted(&track.name),
            yes_no(track.is_default),
        );
        if !track.language.is_empty() {
            let _ = write!(out, ",LANGUAGE=\"{}\"", quoted(&track.language));
        }
        let _ = writeln!(out, ",URI=\"{}/{}.vtt\"", SUBTITLE_DIR, track.index);
    }

    let audio_codec = audio
        .iter()
        .find(|a| a.is_default)
        .or_else(|| audio.first())
        .map(|a| audio_codec_string(&a.codec));

    for profile in profiles {
        let _ = write!(out, "#EXT-X-STREAM-INF:BANDWIDTH={}", profile.bandwidth);
        if profile.width > 0 && profile.height > 0 {
            let _ = write!(out, ",RESOLUTION={}x{}", profile.width, profile.height);
        }
        let video_codec =
            clean_hevc_codec_string(&video_codec_string(&profile.video_codec, profile.height));
        match audio_codec {
            Some(audio_codec) => {
                let _ = write!(out, ",CODECS=\"{},{}\"", video_codec, audio_codec);
            }
            None => {
                let _ = write!(out, ",CODECS=\"{}\"", video_codec);
            }
        }
        if !audio.is_empty() {
            let _ = write!(out, ",AUDIO=\"{}\"", AUDIO_GROUP);
        }
        if !subtitles.is_empty() {
            let _ = write!(out, ",SUBTITLES=\"{}\"", SUBTITLE_GROUP);
        }
        let _ = writeln!(out, "\n{}/{}", profile.name, PLAYLIST_NAME);
    }

    out
}

/// A single path component that cannot climb out of or span directories.
pub fn is_safe_path_component(name: &str) -> bool {
    !name.is_empty()
        && name != "."
        && name != ".."
        && !name.contains('/')
        && !name.contains('\\')
        && !name.contains('\0')
}

fn is_segment_file_name(name: &str) -> bool {
    is_safe_path_component(name) && name.starts_with("seg-") && name.ends_with(".ts")
}

fn ensure_under(base: &Path, path: &Path) -> PlaybackResult<()> {
    let escapes = path
        .strip_prefix(base)
        .map(|rest| {
            rest.components()
                .any(|c| !matches!(c, Component::Normal(_)))
        })
        .unwrap_or(true);
    if escapes {
        return Err(PlaybackError::InvalidPath(path.display().to_string()));
    }
    Ok(())
}

pub fn segment_path(segment_dir: &Path, profile: &str, file: &str) -> PlaybackResult<PathBuf> {
    if !is_safe_path_component(profile) || !is_segment_file_name(file) {
        return Err(PlaybackError::InvalidPath(format!("{}/{}", profile, file)));
    }
    let path = segment_dir.join(profile).join(file);
    ensure_under(segment_dir, &path)?;
    Ok(path)
}

pub fn audio_rendition_dir(segment_dir: &Path, track: usize) -> PathBuf {
    segment_dir.join(AUDIO_DIR).join(track.to_string())
}

pub fn audio_segment_path(segment_dir: &Path, track: usize, file: &str) -> PlaybackResult<PathBuf> {
    if !is_segment_file_name(file) {
        return Err(PlaybackError::InvalidPath(file.to_string()));
    }
    Ok(audio_rendition_dir(segment_dir, track).join(file))
}

pub fn subtitle_path(segment_dir: &Path, track: usize) -> PathBuf {
    segment_dir.join(SUBTITLE_DIR).join(format!("{}.vtt", track))
}

/// Reads `{segment_dir}/{profile}/index.m3u8`, waiting for the job to produce it.
pub async fn read_media_playlist(
    segment_dir: &Path,
    profile: &str,
    wait: PlaylistWait,
    cancel: &CancellationToken,
) -> PlaybackResult<String> {
    if !is_safe_path_component(profile) {
        return Err(PlaybackError::InvalidPath(profile.to_string()));
    }
    let path = segment_dir.join(profile).join(PLAYLIST_NAME);
    ensure_under(segment_dir, &path)?;
    wait_for_playlist(&path, wait, cancel).await
}

pub async fn read_audio_playlist(
    segment_dir: &Path,
    track: usize,
    wait: PlaylistWait,
    cancel: &CancellationToken,
) -> PlaybackResult<String> {
    let path = audio_rendition_dir(segment_dir, track).join(PLAYLIST_NAME);
    wait_for_playlist(&path, wait, cancel).await
}

async fn wait_for_playlist(
    path: &Path,
    wait: PlaylistWait,
    cancel: &CancellationToken,
) -> PlaybackResult<String> {
    for attempt in 0..=wait.retries {
        match tokio::fs::read_to_string(path).await {
            Ok(content) if !content.is_empty() => return Ok(content),
            Ok(_) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        if attempt == wait.retries {
            break;
        }
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = tokio::time::sleep(wait.interval) => {}
        }
    }
    Err(PlaybackError::NotReady(path.display().to_string()))
}

#[cfg(test)]
#[path = "manifest_test.rs"]
mod manifest_test;
