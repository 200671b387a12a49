use std::ops::{Deref, DerefMut};

use ffmpeg_next::{Frame, frame, media};

/// Reusable decoded/filtered frame buffer of either medium.
pub enum MediaFrame {
    Video(frame::Video),
    Audio(frame::Audio),
}

impl MediaFrame {
    pub fn empty(medium: media::Type) -> anyhow::Result<Self> {
        match medium {
            media::Type::Video => Ok(Self::Video(frame::Video::empty())),
            media::Type::Audio => Ok(Self::Audio(frame::Audio::empty())),
            other => anyhow::bail!("no frame buffer for {:?} streams", other),
        }
    }

    /// Clears the picture type chosen by the decoder so the encoder places keyframes itself.
    pub fn reset_picture_type(&mut self) {
        if let Self::Video(frame) = self {
            frame.set_kind(ffmpeg_next::picture::Type::None);
        }
    }
}

impl Deref for MediaFrame {
    type Target = Frame;

    fn deref(&self) -> &Frame {
        match self {
            Self::Video(frame) => frame,
            Self::Audio(frame) => frame,
        }
    }
}

impl DerefMut for MediaFrame {
    fn deref_mut(&mut self) -> &mut Frame {
        match self {
            Self::Video(frame) => frame,
            Self::Audio(frame) => frame,
        }
    }
}
