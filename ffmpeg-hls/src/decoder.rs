use ffmpeg_next::{Frame, Rational, codec::packet::Packet};

use crate::stream::AvStream;

enum DecoderType {
    Video(ffmpeg_next::codec::decoder::Video),
    Audio(ffmpeg_next::codec::decoder::Audio),
}

/// Decoder for one selected input stream. Packets are fed in the stream's own
/// time base, so decoded frames carry timestamps in that time base too.
pub struct Decoder {
    inner: DecoderType,
    stream_time_base: Rational,
}

impl Decoder {
    pub fn new(stream: &AvStream) -> anyhow::Result<Self> {
        let mut decoder_ctx = ffmpeg_next::codec::Context::new();
        decoder_ctx.set_parameters(stream.parameters().clone())?;
        unsafe {
            (*decoder_ctx.as_mut_ptr()).time_base = stream.time_base().into();
            (*decoder_ctx.as_mut_ptr()).pkt_timebase = stream.time_base().into();
        }

        let inner = if stream.is_video() {
            let video_decoder = decoder_ctx.decoder().video()?;
            if video_decoder.format() == ffmpeg_next::format::Pixel::None
                || video_decoder.width() == 0
                || video_decoder.height() == 0
            {
                anyhow::bail!("missing codec parameters for stream {}", stream.index());
            }
            DecoderType::Video(video_decoder)
        } else if stream.is_audio() {
            DecoderType::Audio(decoder_ctx.decoder().audio()?)
        } else {
            anyhow::bail!("unsupported stream type for stream {}", stream.index());
        };

        Ok(Self {
            inner,
            stream_time_base: stream.time_base(),
        })
    }

    pub fn video(&self) -> Option<&ffmpeg_next::codec::decoder::Video> {
        match &self.inner {
            DecoderType::Video(decoder) => Some(decoder),
            DecoderType::Audio(_) => None,
        }
    }

    pub fn audio(&self) -> Option<&ffmpeg_next::codec::decoder::Audio> {
        match &self.inner {
            DecoderType::Audio(decoder) => Some(decoder),
            DecoderType::Video(_) => None,
        }
    }

    pub fn stream_time_base(&self) -> Rational {
        self.stream_time_base
    }

    /// Feeds one packet. Returns `false` when the packet was corrupt and skipped.
    pub fn send_packet(&mut self, packet: &Packet) -> anyhow::Result<bool> {
        let result = match &mut self.inner {
            DecoderType::Video(decoder) => decoder.send_packet(packet),
            DecoderType::Audio(decoder) => decoder.send_packet(packet),
        };
        match result {
            Ok(()) => Ok(true),
            Err(ffmpeg_next::Error::InvalidData) => Ok(false),
            Err(err) => Err(err.into()),
        }
    }

    pub fn send_eof(&mut self) -> anyhow::Result<()> {
        match &mut self.inner {
            DecoderType::Video(decoder) => decoder.send_eof()?,
            DecoderType::Audio(decoder) => decoder.send_eof()?,
        }
        Ok(())
    }

    /// Pulls the next decoded frame into `frame`; `false` when the decoder needs more input.
    pub fn receive_frame(&mut self, frame: &mut Frame) -> anyhow::Result<bool> {
        let result = match &mut self.inner {
            DecoderType::Video(decoder) => decoder.receive_frame(frame),
            DecoderType::Audio(decoder) => decoder.receive_frame(frame),
        };
        match result {
            Ok(()) => {
                let best_effort = frame.timestamp();
                frame.set_pts(best_effort);
                Ok(true)
            }
            Err(ffmpeg_next::Error::Eof) => Ok(false),
            Err(ffmpeg_next::Error::Other { errno }) if errno == ffmpeg_next::util::error::EAGAIN => {
                Ok(false)
            }
            Err(err) => Err(err.into()),
        }
    }
}
