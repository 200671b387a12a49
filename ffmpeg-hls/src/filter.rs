use ffmpeg_next::{Frame, Rational, filter};

use crate::{
    decoder::Decoder,
    encoder::{Encoder, source_channel_layout},
};

/// Filter graph between a decoder and an encoder: `in` (buffer source) → chain → `out` (sink).
pub struct FilterChain {
    graph: filter::Graph,
    output_time_base: Rational,
}

/// Video chain: optional scale to the encoder size, then conversion to the encoder pixel format.
pub fn video_filter_spec(source: (u32, u32), target: (u32, u32), pixel_format: &str) -> String {
    if source == target {
        format!("format=pix_fmts={}", pixel_format)
    } else {
        format!(
            "scale={}:{},format=pix_fmts={}",
            target.0, target.1, pixel_format
        )
    }
}

/// Audio chain: resample with timestamp drift compensation, convert to the encoder
/// sample format and layout, and regenerate timestamps from the sample count.
pub fn audio_filter_spec(sample_format: &str, channel_layout_bits: u64) -> String {
    format!(
        "aresample=async=1,aformat=sample_fmts={}:channel_layouts=0x{:x},asetpts=N/SR/TB",
        sample_format, channel_layout_bits
    )
}

impl FilterChain {
    pub fn video(decoder: &Decoder, encoder: &Encoder) -> anyhow::Result<Self> {
        let source = decoder
            .video()
            .ok_or_else(|| anyhow::anyhow!("video filter needs a video decoder"))?;
        let pixel_format = encoder
            .pixel_format()
            .ok_or_else(|| anyhow::anyhow!("video filter needs a video encoder"))?;
        let target = encoder
            .dimensions()
            .ok_or_else(|| anyhow::anyhow!("video filter needs a video encoder"))?;

        let aspect = source.aspect_ratio();
        let aspect = if aspect.numerator() > 0 && aspect.denominator() > 0 {
            aspect
        } else {
            Rational::new(1, 1)
        };
        let source_format: ffmpeg_next::ffi::AVPixelFormat = source.format().into();
        let args = format!(
            "video_size={}x{}:pix_fmt={}:time_base={}:pixel_aspect={}",
            source.width(),
            source.height(),
            source_format as i32,
            decoder.stream_time_base(),
            aspect
        );

        let pixel_format_name = pixel_format
            .descriptor()
            .map(|d| d.name().to_string())
            .ok_or_else(|| anyhow::anyhow!("unknown pixel format {:?}", pixel_format))?;
        let spec = video_filter_spec(
            (source.width(), source.height()),
            target,
            &pixel_format_name,
        );

        let mut graph = filter::Graph::new();
        graph.add(&find_filter("buffer")?, "in", &args)?;
        graph.add(&find_filter("buffersink")?, "out", "")?;
        graph
            .get("out")
            .ok_or_else(|| anyhow::anyhow!("buffersink missing"))?
            .set_pixel_format(pixel_format);
        graph.output("in", 0)?.input("out", 0)?.parse(&spec)?;
        graph.validate()?;
        log::debug!("video filter graph: [{}] {}", args, spec);

        Self::finish(graph)
    }

    pub fn audio(decoder: &Decoder, encoder: &Encoder) -> anyhow::Result<Self> {
        let source = decoder
            .audio()
            .ok_or_else(|| anyhow::anyhow!("audio filter needs an audio decoder"))?;
        let (sample_format, channel_layout, sample_rate) = match (
            encoder.sample_format(),
            encoder.channel_layout(),
            encoder.sample_rate(),
        ) {
            (Some(format), Some(layout), Some(rate)) => (format, layout, rate),
            _ => anyhow::bail!("audio filter needs an audio encoder"),
        };

        let args = format!(
            "time_base={}:sample_rate={}:sample_fmt={}:channel_layout=0x{:x}",
            decoder.stream_time_base(),
            source.rate(),
            source.format().name(),
            source_channel_layout(source).bits()
        );
        let spec = audio_filter_spec(sample_format.name(), channel_layout.bits());

        let mut graph = filter::Graph::new();
        graph.add(&find_filter("abuffer")?, "in", &args)?;
        graph.add(&find_filter("abuffersink")?, "out", "")?;
        {
            let mut out = graph
                .get("out")
                .ok_or_else(|| anyhow::anyhow!("abuffersink missing"))?;
            out.set_sample_format(sample_format);
            out.set_channel_layout(channel_layout);
            out.set_sample_rate(sample_rate);
        }
        graph.output("in", 0)?.input("out", 0)?.parse(&spec)?;
        graph.validate()?;

        if let Some(frame_size) = encoder.fixed_frame_size() {
            graph
                .get("out")
                .ok_or_else(|| anyhow::anyhow!("abuffersink missing"))?
                .sink()
                .set_frame_size(frame_size);
        }
        log::debug!("audio filter graph: [{}] {}", args, spec);

        Self::finish(graph)
    }

    fn finish(mut graph: filter::Graph) -> anyhow::Result<Self> {
        let output_time_base: Rational = {
            let sink = graph
                .get("out")
                .ok_or_else(|| anyhow::anyhow!("filter sink missing"))?;
            unsafe { ffmpeg_next::ffi::av_buffersink_get_time_base(sink.as_ptr()).into() }
        };
        Ok(Self {
            graph,
            output_time_base,
        })
    }

    /// Time base of frames leaving the chain.
    pub fn output_time_base(&self) -> Rational {
        self.output_time_base
    }

    pub fn push(&mut self, frame: &Frame) -> anyhow::Result<()> {
        self.graph
            .get("in")
            .ok_or_else(|| anyhow::anyhow!("filter source missing"))?
            .source()
            .add(frame)?;
        Ok(())
    }

    /// Signals end of stream to the chain so buffered frames can be drained.
    pub fn flush(&mut self) -> anyhow::Result<()> {
        self.graph
            .get("in")
            .ok_or_else(|| anyhow::anyhow!("filter source missing"))?
            .source()
            .flush()?;
        Ok(())
    }

    /// Pulls the next filtered frame into `frame`; `false` when nothing is ready.
    pub fn pull(&mut self, frame: &mut Frame) -> anyhow::Result<bool> {
        let mut sink = self
            .graph
            .get("out")
            .ok_or_else(|| anyhow::anyhow!("filter sink missing"))?;
        match sink.sink().frame(frame) {
            Ok(()) => Ok(true),
            Err(ffmpeg_next::Error::Eof) => Ok(false),
            Err(ffmpeg_next::Error::Other { errno }) if errno == ffmpeg_next::util::error::EAGAIN => {
                Ok(false)
            }
            Err(err) => Err(err.into()),
        }
    }
}

fn find_filter(name: &str) -> anyhow::Result<filter::Filter> {
    filter::find(name).ok_or_else(|| anyhow::anyhow!("filter {} not available", name))
}
