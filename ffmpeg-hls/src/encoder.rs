use ffmpeg_next::{
    ChannelLayout, Dictionary, Frame, Rational,
    codec::{self, Parameters, packet::Packet},
    format::{Pixel, Sample},
};

use crate::{decoder::Decoder, stream::AvStream};

const FALLBACK_FPS: u32 = 30;

enum EncoderType {
    Video(ffmpeg_next::codec::encoder::Video),
    Audio(ffmpeg_next::codec::encoder::Audio),
}

/// Video encode target for one transcoded rendition.
#[derive(Debug, Clone)]
pub struct VideoTarget {
    pub codec: String,
    /// Output height; 0 keeps the source height.
    pub height: u32,
    pub bitrate_kbps: u32,
    pub crf: u32,
    pub preset: String,
    pub segment_duration: u32,
}

#[derive(Debug, Clone)]
pub struct AudioTarget {
    pub codec: String,
    pub bitrate_kbps: u32,
}

/// Maps the codec names used in renditions (encoder names and short aliases) to a codec id.
pub fn codec_id_for_name(name: &str) -> Option<codec::Id> {
    let id = match name.to_ascii_lowercase().as_str() {
        "libx264" | "h264" | "avc" => codec::Id::H264,
        "libx265" | "hevc" | "h265" => codec::Id::HEVC,
        "vp9" | "libvpx-vp9" => codec::Id::VP9,
        "av1" | "libaom-av1" | "libsvtav1" => codec::Id::AV1,
        "aac" => codec::Id::AAC,
        "mp3" | "libmp3lame" => codec::Id::MP3,
        "ac3" => codec::Id::AC3,
        "eac3" => codec::Id::EAC3,
        "opus" | "libopus" => codec::Id::OPUS,
        _ => return None,
    };
    Some(id)
}

/// Finds an encoder by name, then by the codec id the name stands for.
pub fn find_encoder(name: &str) -> anyhow::Result<ffmpeg_next::Codec> {
    if let Some(codec) = ffmpeg_next::encoder::find_by_name(name) {
        return Ok(codec);
    }
    codec_id_for_name(name)
        .and_then(ffmpeg_next::encoder::find)
        .ok_or_else(|| anyhow::anyhow!("encoder not found: {}", name))
}

fn even(value: u32) -> u32 {
    (value + 1) & !1
}

/// Output size for a target height, keeping the source aspect ratio. Both sides are even.
pub fn scaled_dimensions(src_width: u32, src_height: u32, target_height: u32) -> (u32, u32) {
    if target_height == 0 || src_height == 0 || src_width == 0 {
        return (even(src_width), even(src_height));
    }
    let width = (src_width as u64 * target_height as u64 / src_height as u64) as u32;
    (even(width), even(target_height))
}

/// One keyframe per segment.
pub fn gop_size(fps: Option<u32>, segment_duration: u32) -> u32 {
    fps.unwrap_or(FALLBACK_FPS) * segment_duration.max(1)
}

pub struct Encoder {
    inner: EncoderType,
    time_base: Rational,
    codec: ffmpeg_next::Codec,
}

impl Encoder {
    pub fn video(
        stream: &AvStream,
        decoder: &Decoder,
        target: &VideoTarget,
        global_header: bool,
    ) -> anyhow::Result<Self> {
        let source = decoder
            .video()
            .ok_or_else(|| anyhow::anyhow!("stream {} has no video decoder", stream.index()))?;
        let codec = find_encoder(&target.codec)?;

        let (width, height) = scaled_dimensions(source.width(), source.height(), target.height);
        let pixel_format = codec
            .video()?
            .formats()
            .and_then(|mut formats| formats.next())
            .unwrap_or(Pixel::YUV420P);

        let rate = stream.rate();
        let (frame_rate, time_base) = if stream.fps().is_some() {
            (Some(rate), rate.invert())
        } else {
            (None, decoder.stream_time_base())
        };

        let mut encoder = ffmpeg_next::codec::Context::new_with_codec(codec)
            .encoder()
            .video()?;
        encoder.set_width(width);
        encoder.set_height(height);
        encoder.set_format(pixel_format);
        encoder.set_aspect_ratio(source.aspect_ratio());
        encoder.set_frame_rate(frame_rate);
        encoder.set_time_base(time_base);
        encoder.set_gop(gop_size(stream.fps(), target.segment_duration));
        if global_header {
            encoder.set_flags(codec::Flags::GLOBAL_HEADER);
        }

        let mut opts = Dictionary::new();
        opts.set("preset", &target.preset);
        opts.set("crf", &target.crf.to_string());
        if target.bitrate_kbps > 0 {
            let bits = target.bitrate_kbps as usize * 1000;
            encoder.set_bit_rate(bits);
            encoder.set_max_bit_rate(bits);
            opts.set("bufsize", &(target.bitrate_kbps as u64 * 2000).to_string());
        }

        let encoder = encoder.open_with(opts)?;
        log::debug!(
            "video encoder {} opened: {}x{} {:?} tb={}",
            codec.name(),
            width,
            height,
            pixel_format,
            time_base
        );

        Ok(Self {
            inner: EncoderType::Video(encoder),
            time_base,
            codec,
        })
    }

    pub fn audio(
        decoder: &Decoder,
        target: &AudioTarget,
        global_header: bool,
    ) -> anyhow::Result<Self> {
        let source = decoder
            .audio()
            .ok_or_else(|| anyhow::anyhow!("no audio decoder"))?;
        let codec = find_encoder(&target.codec)?;
        let audio_codec = codec.audio()?;

        let source_layout = source_channel_layout(source);
        let channel_layout = audio_codec
            .channel_layouts()
            .map(|layouts| layouts.best(source_layout.channels()))
            .unwrap_or(source_layout);
        let sample_format = audio_codec
            .formats()
            .and_then(|mut formats| formats.next())
            .unwrap_or(source.format());
        let source_rate = source.rate() as i32;
        let sample_rate = match audio_codec.rates() {
            Some(rates) => {
                let rates: Vec<i32> = rates.collect();
                if rates.is_empty() || rates.contains(&source_rate) {
                    source_rate
                } else {
                    rates[0]
                }
            }
            None => source_rate,
        };
        let time_base = Rational::new(1, sample_rate);

        let mut encoder = ffmpeg_next::codec::Context::new_with_codec(codec)
            .encoder()
            .audio()?;
        encoder.set_rate(sample_rate);
        encoder.set_channel_layout(channel_layout);
        encoder.set_format(sample_format);
        encoder.set_time_base(time_base);
        if target.bitrate_kbps > 0 {
            encoder.set_bit_rate(target.bitrate_kbps as usize * 1000);
        }
        if global_header {
            encoder.set_flags(codec::Flags::GLOBAL_HEADER);
        }

        let encoder = encoder.open_as(codec)?;
        log::debug!(
            "audio encoder {} opened: {} Hz {:?} {} ch",
            codec.name(),
            sample_rate,
            sample_format,
            channel_layout.channels()
        );

        Ok(Self {
            inner: EncoderType::Audio(encoder),
            time_base,
            codec,
        })
    }

    pub fn time_base(&self) -> Rational {
        self.time_base
    }

    pub fn parameters(&self) -> Parameters {
        match &self.inner {
            EncoderType::Video(encoder) => Parameters::from(encoder),
            EncoderType::Audio(encoder) => Parameters::from(encoder),
        }
    }

    pub fn pixel_format(&self) -> Option<Pixel> {
        match &self.inner {
            EncoderType::Video(encoder) => Some(encoder.format()),
            EncoderType::Audio(_) => None,
        }
    }

    pub fn dimensions(&self) -> Option<(u32, u32)> {
        match &self.inner {
            EncoderType::Video(encoder) => Some((encoder.width(), encoder.height())),
            EncoderType::Audio(_) => None,
        }
    }

    pub fn sample_format(&self) -> Option<Sample> {
        match &self.inner {
            EncoderType::Audio(encoder) => Some(encoder.format()),
            EncoderType::Video(_) => None,
        }
    }

    pub fn channel_layout(&self) -> Option<ChannelLayout> {
        match &self.inner {
            EncoderType::Audio(encoder) => Some(encoder.channel_layout()),
            EncoderType::Video(_) => None,
        }
    }

    pub fn sample_rate(&self) -> Option<u32> {
        match &self.inner {
            EncoderType::Audio(encoder) => Some(encoder.rate()),
            EncoderType::Video(_) => None,
        }
    }

    /// Samples per frame the encoder insists on, `None` for video or variable-size encoders.
    pub fn fixed_frame_size(&self) -> Option<u32> {
        match &self.inner {
            EncoderType::Audio(encoder) => {
                let variable = self
                    .codec
                    .capabilities()
                    .contains(codec::capabilities::Capabilities::VARIABLE_FRAME_SIZE);
                (!variable && encoder.frame_size() > 0).then(|| encoder.frame_size())
            }
            EncoderType::Video(_) => None,
        }
    }

    pub fn send_frame(&mut self, frame: &Frame) -> anyhow::Result<()> {
        match &mut self.inner {
            EncoderType::Video(encoder) => encoder.send_frame(frame)?,
            EncoderType::Audio(encoder) => encoder.send_frame(frame)?,
        }
        Ok(())
    }

    pub fn send_eof(&mut self) -> anyhow::Result<()> {
        match &mut self.inner {
            EncoderType::Video(encoder) => encoder.send_eof()?,
            EncoderType::Audio(encoder) => encoder.send_eof()?,
        }
        Ok(())
    }

    /// Pulls the next encoded packet; `false` when the encoder needs more frames.
    pub fn receive_packet(&mut self, packet: &mut Packet) -> anyhow::Result<bool> {
        let result = match &mut self.inner {
            EncoderType::Video(encoder) => encoder.receive_packet(packet),
            EncoderType::Audio(encoder) => encoder.receive_packet(packet),
        };
        match result {
            Ok(()) => Ok(true),
            Err(ffmpeg_next::Error::Other { errno }) if errno == ffmpeg_next::util::error::EAGAIN => {
                Ok(false)
            }
            Err(ffmpeg_next::Error::Eof) => Ok(false),
            Err(err) => Err(err.into()),
        }
    }
}

/// Decoded channel layout, or the default layout for the channel count when the
/// stream does not declare one.
pub fn source_channel_layout(decoder: &ffmpeg_next::codec::decoder::Audio) -> ChannelLayout {
    let layout = decoder.channel_layout();
    if layout.bits() != 0 {
        layout
    } else {
        ChannelLayout::default(decoder.channels().max(1) as i32)
    }
}
