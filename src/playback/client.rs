//! What a client can decode and display.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientProfile {
    pub name: String,
    pub video_codecs: Vec<String>,
    pub audio_codecs: Vec<String>,
    pub supports_hdr10: bool,
    pub supports_hlg: bool,
    pub supports_dolby_vision: bool,
    /// 0 = unlimited.
    pub max_width: u32,
    pub max_height: u32,
    pub max_bitrate_kbps: u32,
    pub max_audio_channels: u32,
}

fn strings(values: &[&str]) -> Vec<String> {
    values.iter().map(|v| v.to_string()).collect()
}

impl ClientProfile {
    /// Fallback for unrecognised clients: H.264, common audio, SDR, stereo.
    pub fn conservative() -> Self {
        Self {
            name: "conservative".to_string(),
            video_codecs: strings(&["h264"]),
            audio_codecs: strings(&["aac", "mp3"]),
            max_audio_channels: 2,
            ..Default::default()
        }
    }

    fn safari() -> Self {
        Self {
            name: "safari".to_string(),
            video_codecs: strings(&["h264", "hevc", "av1"]),
            audio_codecs: strings(&["aac", "mp3", "ac3", "eac3", "flac", "alac"]),
            supports_hdr10: true,
            supports_hlg: true,
            supports_dolby_vision: true,
            ..Default::default()
        }
    }

    fn firefox() -> Self {
        Self {
            name: "firefox".to_string(),
            video_codecs: strings(&["h264", "av1", "vp9"]),
            audio_codecs: strings(&["aac", "mp3", "opus", "flac"]),
            max_audio_channels: 2,
            ..Default::default()
        }
    }

    fn chromium() -> Self {
        Self {
            name: "chromium".to_string(),
            video_codecs: strings(&["h264", "hevc", "av1", "vp9"]),
            audio_codecs: strings(&["aac", "mp3", "opus", "flac"]),
            supports_hdr10: true,
            supports_hlg: true,
            ..Default::default()
        }
    }

    /// Case-insensitive; an empty list counts as unsupported.
    pub fn can_decode_video(&self, codec: &str) -> bool {
        self.video_codecs.iter().any(|c| c.eq_ignore_ascii_case(codec))
    }

    pub fn can_decode_audio(&self, codec: &str) -> bool {
        self.audio_codecs.iter().any(|c| c.eq_ignore_ascii_case(codec))
    }

    /// SDR and unknown labels are assumed displayable.
    pub fn can_display_dynamic_range(&self, range: &str) -> bool {
        match range.to_ascii_lowercase().as_str() {
            "sdr" => true,
            "hdr10" | "hdr" => self.supports_hdr10,
            "hlg" => self.supports_hlg,
            "dolby vision" | "dolby-vision" | "dolbyvision" | "dv" | "dovi" => {
                self.supports_dolby_vision
            }
            _ => true,
        }
    }
}

/// Classifies a browser by its user agent. `None` when nothing matches.
pub fn detect_client_profile(user_agent: &str) -> Option<ClientProfile> {
    let is_chromium = user_agent.contains("Chrome") || user_agent.contains("Chromium");
    if user_agent.contains("Safari") && !is_chromium {
        return Some(ClientProfile::safari());
    }
    if user_agent.contains("Firefox") {
        return Some(ClientProfile::firefox());
    }
    if is_chromium || user_agent.contains("Edg") {
        return Some(ClientProfile::chromium());
    }
    None
}
