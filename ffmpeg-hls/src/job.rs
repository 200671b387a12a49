use std::{
    path::PathBuf,
    sync::{
        Mutex,
        atomic::{AtomicBool, Ordering},
    },
};

use ffmpeg_next::{Rational, Rescale, codec::packet::Packet};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use crate::{
    decoder::Decoder,
    encoder::{AudioTarget, Encoder, VideoTarget},
    filter::FilterChain,
    frame::MediaFrame,
    input::AvInput,
    output::{PLAYLIST_NAME, SegmentedOutput},
    stream::AvStream,
};

/// Codec target meaning "pass the stream through unchanged".
pub const COPY: &str = "copy";
pub const DEFAULT_CRF: u32 = 23;
pub const DEFAULT_PRESET: &str = "veryfast";
pub const DEFAULT_SEGMENT_DURATION: u32 = 6;

/// Everything one segmenting run needs.
#[derive(Debug, Clone, PartialEq)]
pub struct JobConfig {
    pub input: PathBuf,
    /// Receives `index.m3u8` and `seg-NNNNN.ts`.
    pub output_dir: PathBuf,
    /// `copy` or an encoder name.
    pub video_codec: String,
    pub audio_codec: String,
    /// Target height; width follows the source aspect ratio. 0 keeps the source size.
    pub height: u32,
    pub video_bitrate_kbps: u32,
    pub audio_bitrate_kbps: u32,
    pub crf: u32,
    pub preset: String,
    pub segment_duration: u32,
    /// Absolute index of the video stream; `None` disables video.
    pub video_stream: Option<usize>,
    /// Position among audio streams; `None` disables audio.
    pub audio_stream: Option<usize>,
    pub seek_seconds: f64,
    /// Drop Dolby Vision configuration records from copied video.
    pub strip_dolby_vision: bool,
}

impl Default for JobConfig {
    fn default() -> Self {
        Self {
            input: PathBuf::new(),
            output_dir: PathBuf::new(),
            video_codec: COPY.to_string(),
            audio_codec: COPY.to_string(),
            height: 0,
            video_bitrate_kbps: 0,
            audio_bitrate_kbps: 0,
            crf: DEFAULT_CRF,
            preset: DEFAULT_PRESET.to_string(),
            segment_duration: DEFAULT_SEGMENT_DURATION,
            video_stream: Some(0),
            audio_stream: Some(0),
            seek_seconds: 0.0,
            strip_dolby_vision: false,
        }
    }
}

impl JobConfig {
    /// Replaces unset encoding knobs with the defaults.
    pub fn normalized(mut self) -> Self {
        if self.crf == 0 {
            self.crf = DEFAULT_CRF;
        }
        if self.preset.is_empty() {
            self.preset = DEFAULT_PRESET.to_string();
        }
        if self.segment_duration == 0 {
            self.segment_duration = DEFAULT_SEGMENT_DURATION;
        }
        if self.seek_seconds < 0.0 {
            self.seek_seconds = 0.0;
        }
        self
    }

    pub fn is_transcode(&self) -> bool {
        (self.video_stream.is_some() && self.video_codec != COPY)
            || (self.audio_stream.is_some() && self.audio_codec != COPY)
    }
}

/// One input segmented into one HLS rendition. `run` blocks and belongs on a
/// blocking thread; `stop` and `wait` may be called from anywhere.
pub struct MediaPipelineJob {
    config: JobConfig,
    cancel: CancellationToken,
    started: AtomicBool,
    done: watch::Sender<bool>,
    error: Mutex<Option<String>>,
}

impl MediaPipelineJob {
    pub fn new(config: JobConfig) -> Self {
        let (done, _) = watch::channel(false);
        Self {
            config: config.normalized(),
            cancel: CancellationToken::new(),
            started: AtomicBool::new(false),
            done,
            error: Mutex::new(None),
        }
    }

    pub fn config(&self) -> &JobConfig {
        &self.config
    }

    pub fn playlist_path(&self) -> PathBuf {
        self.config.output_dir.join(PLAYLIST_NAME)
    }

    pub fn is_transcode(&self) -> bool {
        self.config.is_transcode()
    }

    /// Requests cancellation and interrupts blocking demuxer I/O. Idempotent.
    pub fn stop(&self) {
        if self.cancel.is_cancelled() {
            return;
        }
        self.cancel.cancel();
        // A job that never ran has nothing to wind down.
        if !self.started.load(Ordering::SeqCst) {
            self.done.send_replace(true);
        }
    }

    pub fn is_stopped(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub fn is_done(&self) -> bool {
        *self.done.borrow()
    }

    /// Resolves once the job has finished (or was stopped before it started).
    pub async fn wait(&self) {
        let mut rx = self.done.subscribe();
        let _ = rx.wait_for(|done| *done).await;
    }

    /// Terminal error of a failed run.
    pub fn error(&self) -> Option<String> {
        match self.error.lock() {
            Ok(slot) => slot.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    /// Runs the pipeline to completion. A run ended by `stop` returns `Ok`.
    pub fn run(&self) -> anyhow::Result<()> {
        if self.started.swap(true, Ordering::SeqCst) {
            anyhow::bail!("job for {} already started", self.config.output_dir.display());
        }

        let result = if self.cancel.is_cancelled() {
            Ok(())
        } else {
            self.execute()
        };
        let result = match result {
            Err(e) if self.cancel.is_cancelled() => {
                log::debug!(
                    "job {} ended by cancellation: {:#}",
                    self.config.output_dir.display(),
                    e
                );
                Ok(())
            }
            other => other,
        };

        if let Err(e) = &result {
            let mut slot = match self.error.lock() {
                Ok(slot) => slot,
                Err(poisoned) => poisoned.into_inner(),
            };
            *slot = Some(format!("{:#}", e));
        }
        self.done.send_replace(true);
        result
    }

    fn execute(&self) -> anyhow::Result<()> {
        let cfg = &self.config;
        let mut input = AvInput::open(&cfg.input, &self.cancel)?;
        input.seek_seconds(cfg.seek_seconds)?;

        let mut selected: Vec<(AvStream, &str)> = Vec::with_capacity(2);
        if let Some(stream) = input.select_video(cfg.video_stream) {
            selected.push((stream.clone(), cfg.video_codec.as_str()));
        }
        if let Some(stream) = input.select_audio(cfg.audio_stream) {
            selected.push((stream.clone(), cfg.audio_codec.as_str()));
        }
        if selected.is_empty() {
            anyhow::bail!("no selectable stream in {}", cfg.input.display());
        }

        let mut output = SegmentedOutput::create(&cfg.output_dir, cfg.segment_duration)?;
        let global_header = output.needs_global_header();
        let mut mappings = Vec::with_capacity(selected.len());
        for (stream, codec) in &selected {
            mappings.push(StreamMapping::new(
                stream,
                codec,
                cfg,
                &mut output,
                global_header,
            )?);
        }

        output.write_header()?;
        for mapping in mappings.iter_mut() {
            mapping.output_time_base = output.stream_time_base(mapping.output_index)?;
        }
        log::info!(
            "job started: {} -> {} ({})",
            cfg.input.display(),
            cfg.output_dir.display(),
            mappings
                .iter()
                .map(|m| m.describe())
                .collect::<Vec<_>>()
                .join(", ")
        );

        while !self.cancel.is_cancelled() {
            let mut packet = match input.read_packet() {
                Ok(Some(packet)) => packet,
                Ok(None) => break,
                Err(_) if self.cancel.is_cancelled() => break,
                Err(e) => return Err(anyhow::anyhow!("read packet: {}", e)),
            };
            let Some(mapping) = mappings
                .iter_mut()
                .find(|m| m.input_index == packet.stream())
            else {
                continue;
            };
            mapping.process(&mut packet, &mut output)?;
        }

        let cancelled = self.cancel.is_cancelled();
        for mapping in mappings.iter_mut() {
            if let Err(e) = mapping.flush(&mut output) {
                if !cancelled {
                    return Err(e);
                }
            }
        }
        match output.finish() {
            Err(e) if cancelled => {
                log::debug!("trailer skipped after cancellation: {:#}", e);
            }
            other => other?,
        }

        log::info!(
            "job finished: {}{}",
            cfg.output_dir.display(),
            if cancelled { " (stopped)" } else { "" }
        );
        Ok(())
    }
}

/// Association of one selected input stream with its output stream.
struct StreamMapping {
    input_index: usize,
    input_time_base: Rational,
    output_index: usize,
    output_time_base: Rational,
    /// `None` for streams that are copied.
    transcoder: Option<Transcoder>,
}

impl StreamMapping {
    fn new(
        stream: &AvStream,
        codec: &str,
        cfg: &JobConfig,
        output: &mut SegmentedOutput,
        global_header: bool,
    ) -> anyhow::Result<Self> {
        let (output_index, transcoder) = if codec == COPY {
            let strip = cfg.strip_dolby_vision && stream.is_video();
            (output.add_copy_stream(stream, strip)?, None)
        } else {
            let transcoder = Transcoder::new(stream, codec, cfg, global_header)?;
            (output.add_encoded_stream(&transcoder.encoder)?, Some(transcoder))
        };

        Ok(Self {
            input_index: stream.index(),
            input_time_base: stream.time_base(),
            output_index,
            output_time_base: stream.time_base(),
            transcoder,
        })
    }

    fn needs_decode(&self) -> bool {
        self.transcoder.is_some()
    }

    fn describe(&self) -> String {
        format!(
            "#{}->#{} {}",
            self.input_index,
            self.output_index,
            if self.needs_decode() { "transcode" } else { "copy" }
        )
    }

    fn process(&mut self, packet: &mut Packet, output: &mut SegmentedOutput) -> anyhow::Result<()> {
        match &mut self.transcoder {
            None => output.write_packet(
                packet,
                self.input_time_base,
                self.output_index,
                self.output_time_base,
            ),
            Some(transcoder) => {
                if !transcoder.decoder.send_packet(packet)? {
                    log::debug!("skipped corrupt packet on stream {}", self.input_index);
                    return Ok(());
                }
                transcoder.drain_decoder(output, self.output_index, self.output_time_base)
            }
        }
    }

    fn flush(&mut self, output: &mut SegmentedOutput) -> anyhow::Result<()> {
        match &mut self.transcoder {
            None => Ok(()),
            Some(transcoder) => transcoder.flush(output, self.output_index, self.output_time_base),
        }
    }
}

struct Transcoder {
    decoder: Decoder,
    filter: FilterChain,
    encoder: Encoder,
    decoded: MediaFrame,
    filtered: MediaFrame,
    encoded: Packet,
}

impl Transcoder {
    fn new(
        stream: &AvStream,
        codec: &str,
        cfg: &JobConfig,
        global_header: bool,
    ) -> anyhow::Result<Self> {
        let decoder = Decoder::new(stream)?;
        let (encoder, filter) = if stream.is_video() {
            let target = VideoTarget {
                codec: codec.to_string(),
                height: cfg.height,
                bitrate_kbps: cfg.video_bitrate_kbps,
                crf: cfg.crf,
                preset: cfg.preset.clone(),
                segment_duration: cfg.segment_duration,
            };
            let encoder = Encoder::video(stream, &decoder, &target, global_header)?;
            let filter = FilterChain::video(&decoder, &encoder)?;
            (encoder, filter)
        } else {
            let target = AudioTarget {
                codec: codec.to_string(),
                bitrate_kbps: cfg.audio_bitrate_kbps,
            };
            let encoder = Encoder::audio(&decoder, &target, global_header)?;
            let filter = FilterChain::audio(&decoder, &encoder)?;
            (encoder, filter)
        };

        Ok(Self {
            decoder,
            filter,
            encoder,
            decoded: MediaFrame::empty(stream.medium())?,
            filtered: MediaFrame::empty(stream.medium())?,
            encoded: Packet::empty(),
        })
    }

    fn drain_decoder(
        &mut self,
        output: &mut SegmentedOutput,
        output_index: usize,
        output_time_base: Rational,
    ) -> anyhow::Result<()> {
        while self.decoder.receive_frame(&mut self.decoded)? {
            self.filter.push(&self.decoded)?;
            self.drain_filter(output, output_index, output_time_base)?;
        }
        Ok(())
    }

    fn drain_filter(
        &mut self,
        output: &mut SegmentedOutput,
        output_index: usize,
        output_time_base: Rational,
    ) -> anyhow::Result<()> {
        let filter_time_base = self.filter.output_time_base();
        let encoder_time_base = self.encoder.time_base();
        while self.filter.pull(&mut self.filtered)? {
            self.filtered.reset_picture_type();
            let pts = self
                .filtered
                .pts()
                .map(|pts| pts.rescale(filter_time_base, encoder_time_base));
            self.filtered.set_pts(pts);
            self.encoder.send_frame(&self.filtered)?;
            self.drain_encoder(output, output_index, output_time_base)?;
        }
        Ok(())
    }

    fn drain_encoder(
        &mut self,
        output: &mut SegmentedOutput,
        output_index: usize,
        output_time_base: Rational,
    ) -> anyhow::Result<()> {
        let encoder_time_base = self.encoder.time_base();
        while self.encoder.receive_packet(&mut self.encoded)? {
            output.write_packet(
                &mut self.encoded,
                encoder_time_base,
                output_index,
                output_time_base,
            )?;
        }
        Ok(())
    }

    fn flush(
        &mut self,
        output: &mut SegmentedOutput,
        output_index: usize,
        output_time_base: Rational,
    ) -> anyhow::Result<()> {
        self.decoder.send_eof()?;
        self.drain_decoder(output, output_index, output_time_base)?;
        self.filter.flush()?;
        self.drain_filter(output, output_index, output_time_base)?;
        self.encoder.send_eof()?;
        self.drain_encoder(output, output_index, output_time_base)
    }
}

#[cfg(test)]
#[path = "job_test.rs"]
mod job_test;
