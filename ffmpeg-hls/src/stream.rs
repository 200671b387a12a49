use ffmpeg_next::{
    Rational,
    codec::Parameters,
    format::stream::{self, Disposition},
    media,
};

unsafe impl Send for AvStream {}
unsafe impl Sync for AvStream {}

/// Snapshot of an input stream that outlives the borrow of its format context.
pub struct AvStream {
    index: usize,
    parameters: Parameters,
    time_base: Rational,
    rate: Rational,
    disposition: Disposition,
    language: String,
    title: String,
}

impl AvStream {
    pub fn index(&self) -> usize {
        self.index
    }

    pub fn parameters(&self) -> &Parameters {
        &self.parameters
    }

    pub fn time_base(&self) -> Rational {
        self.time_base
    }

    /// Average frame rate as reported by the demuxer; `0/0` when unknown.
    pub fn rate(&self) -> Rational {
        self.rate
    }

    pub fn medium(&self) -> media::Type {
        self.parameters.medium()
    }

    pub fn is_video(&self) -> bool {
        self.medium() == media::Type::Video && !self.disposition.contains(Disposition::ATTACHED_PIC)
    }

    pub fn is_audio(&self) -> bool {
        self.medium() == media::Type::Audio
    }

    pub fn is_subtitle(&self) -> bool {
        self.medium() == media::Type::Subtitle
    }

    pub fn is_default(&self) -> bool {
        self.disposition.contains(Disposition::DEFAULT)
    }

    pub fn is_forced(&self) -> bool {
        self.disposition.contains(Disposition::FORCED)
    }

    /// Language tag; empty when missing or undetermined.
    pub fn language(&self) -> &str {
        &self.language
    }

    pub fn title(&self) -> &str {
        &self.title
    }

    pub fn codec_name(&self) -> &'static str {
        self.parameters.id().name()
    }

    pub fn width(&self) -> u32 {
        unsafe {
            let ptr = self.parameters.as_ptr() as *const ffmpeg_next::ffi::AVCodecParameters;
            (*ptr).width.max(0) as u32
        }
    }

    pub fn height(&self) -> u32 {
        unsafe {
            let ptr = self.parameters.as_ptr() as *const ffmpeg_next::ffi::AVCodecParameters;
            (*ptr).height.max(0) as u32
        }
    }

    /// Frames per second rounded to the nearest integer, or `None` if the rate is unknown.
    pub fn fps(&self) -> Option<u32> {
        if self.rate.numerator() <= 0 || self.rate.denominator() <= 0 {
            return None;
        }
        let fps = self.rate.numerator() as f64 / self.rate.denominator() as f64;
        Some(fps.round().max(1.0) as u32)
    }
}

impl From<stream::Stream<'_>> for AvStream {
    fn from(stream: stream::Stream<'_>) -> Self {
        let metadata = stream.metadata();
        let language = metadata
            .get("language")
            .filter(|l| *l != "und")
            .unwrap_or_default()
            .to_string();
        let title = metadata.get("title").unwrap_or_default().to_string();
        Self {
            index: stream.index(),
            parameters: stream.parameters(),
            time_base: stream.time_base(),
            rate: stream.avg_frame_rate(),
            disposition: stream.disposition(),
            language,
            title,
        }
    }
}

impl Clone for AvStream {
    fn clone(&self) -> Self {
        Self {
            index: self.index,
            parameters: self.parameters.clone(),
            time_base: self.time_base,
            rate: self.rate,
            disposition: self.disposition,
            language: self.language.clone(),
            title: self.title.clone(),
        }
    }
}
