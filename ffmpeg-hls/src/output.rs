use std::{ffi::CString, path::Path, ptr};

use ffmpeg_next::{Dictionary, Rational, codec::packet::Packet, format};

use crate::{
    encoder::Encoder,
    side_data::{SideDataKind, strip_side_data},
    stream::AvStream,
};

pub const PLAYLIST_NAME: &str = "index.m3u8";
pub const SEGMENT_PATTERN: &str = "seg-%05d.ts";

/// Segmenting options handed to the HLS muxer at header time.
#[derive(Debug, Clone)]
pub struct SegmentOptions {
    pub segment_duration: u32,
    pub segment_filename: String,
}

impl SegmentOptions {
    pub fn to_dictionary(&self) -> Dictionary<'static> {
        let mut opts = Dictionary::new();
        opts.set("hls_time", &self.segment_duration.to_string());
        opts.set("hls_playlist_type", "event");
        opts.set("hls_list_size", "0");
        opts.set("start_number", "0");
        opts.set("hls_segment_filename", &self.segment_filename);
        opts
    }
}

/// HLS muxer writing `index.m3u8` and numbered segments into one directory.
pub struct SegmentedOutput {
    inner: format::context::Output,
    options: SegmentOptions,
    have_written_header: bool,
    have_written_trailer: bool,
}

impl SegmentedOutput {
    pub fn create(dir: &Path, segment_duration: u32) -> anyhow::Result<Self> {
        let playlist = dir.join(PLAYLIST_NAME);
        let options = SegmentOptions {
            segment_duration,
            segment_filename: dir.join(SEGMENT_PATTERN).to_string_lossy().into_owned(),
        };
        Ok(Self {
            inner: alloc_output(&playlist, "hls")?,
            options,
            have_written_header: false,
            have_written_trailer: false,
        })
    }

    pub fn needs_global_header(&self) -> bool {
        self.inner
            .format()
            .flags()
            .contains(format::Flags::GLOBAL_HEADER)
    }

    /// Adds a stream that carries the input's packets unchanged.
    pub fn add_copy_stream(
        &mut self,
        input: &AvStream,
        strip_dolby_vision: bool,
    ) -> anyhow::Result<usize> {
        let mut ost = self
            .inner
            .add_stream(ffmpeg_next::encoder::find(ffmpeg_next::codec::Id::None))?;
        ost.set_parameters(input.parameters().clone());
        unsafe {
            (*ost.parameters().as_mut_ptr()).codec_tag = 0;
        }
        ost.set_time_base(input.time_base());

        if strip_dolby_vision {
            let mut params = ost.parameters();
            if strip_side_data(&mut params, SideDataKind::DolbyVisionConfig) {
                log::info!(
                    "stripped dolby vision configuration from stream {}",
                    input.index()
                );
            }
        }
        Ok(ost.index())
    }

    /// Adds a stream fed by `encoder`.
    pub fn add_encoded_stream(&mut self, encoder: &Encoder) -> anyhow::Result<usize> {
        let mut ost = self.inner.add_stream(ffmpeg_next::encoder::find(
            ffmpeg_next::codec::Id::None,
        ))?;
        ost.set_parameters(encoder.parameters());
        ost.set_time_base(encoder.time_base());
        Ok(ost.index())
    }

    pub fn write_header(&mut self) -> anyhow::Result<()> {
        if !self.have_written_header {
            self.inner.write_header_with(self.options.to_dictionary())?;
            self.have_written_header = true;
        }
        Ok(())
    }

    /// Time base the muxer settled on for a stream; only final after the header.
    pub fn stream_time_base(&self, index: usize) -> anyhow::Result<Rational> {
        self.inner
            .stream(index)
            .map(|s| s.time_base())
            .ok_or_else(|| anyhow::anyhow!("output stream {} not found", index))
    }

    pub fn write_packet(
        &mut self,
        packet: &mut Packet,
        source_time_base: Rational,
        stream_index: usize,
        output_time_base: Rational,
    ) -> anyhow::Result<()> {
        packet.set_stream(stream_index);
        packet.set_position(-1);
        packet.rescale_ts(source_time_base, output_time_base);
        packet.write_interleaved(&mut self.inner)?;
        Ok(())
    }

    pub fn finish(&mut self) -> anyhow::Result<()> {
        if self.have_written_header && !self.have_written_trailer {
            self.have_written_trailer = true;
            self.inner.write_trailer()?;
        }
        Ok(())
    }
}

/// Allocates an output context for `format_name`, opening a file handle only when
/// the muxer does not manage its own I/O (HLS opens playlist and segments itself).
fn alloc_output(path: &Path, format_name: &str) -> anyhow::Result<format::context::Output> {
    let c_path = CString::new(path.to_string_lossy().as_bytes())?;
    let c_format = CString::new(format_name)?;
    unsafe {
        let mut ctx = ptr::null_mut();
        let ret = ffmpeg_next::ffi::avformat_alloc_output_context2(
            &mut ctx,
            ptr::null(),
            c_format.as_ptr(),
            c_path.as_ptr(),
        );
        if ret < 0 || ctx.is_null() {
            anyhow::bail!(
                "allocate {} output for {}: {}",
                format_name,
                path.display(),
                ffmpeg_next::Error::from(ret)
            );
        }

        let flags = (*(*ctx).oformat).flags;
        if flags & ffmpeg_next::ffi::AVFMT_NOFILE as i32 == 0 {
            let ret = ffmpeg_next::ffi::avio_open(
                &mut (*ctx).pb,
                c_path.as_ptr(),
                ffmpeg_next::ffi::AVIO_FLAG_WRITE as i32,
            );
            if ret < 0 {
                ffmpeg_next::ffi::avformat_free_context(ctx);
                anyhow::bail!("open {}: {}", path.display(), ffmpeg_next::Error::from(ret));
            }
        }
        Ok(format::context::Output::wrap(ctx))
    }
}
