use std::{
    path::{Path, PathBuf},
    time::Duration,
};

use ffmpeg_next::{
    ChannelLayout, Dictionary, Rational, codec,
    format::{self, Pixel, Sample, sample},
    frame,
};

use crate::{
    encoder::find_encoder,
    input::AvInput,
    job::{COPY, DEFAULT_CRF, DEFAULT_PRESET, DEFAULT_SEGMENT_DURATION, JobConfig, MediaPipelineJob},
    output::PLAYLIST_NAME,
    side_data::{SideDataKind, has_side_data, strip_side_data},
};

const SAMPLE_WIDTH: u32 = 1920;
const SAMPLE_HEIGHT: u32 = 1080;
const SAMPLE_FPS: i32 = 10;
const SAMPLE_SECONDS: i32 = 3;
const SAMPLE_RATE: i32 = 48_000;

fn drain(
    encoder: &mut codec::encoder::Encoder,
    output: &mut format::context::Output,
    stream_index: usize,
    encoder_time_base: Rational,
) -> anyhow::Result<()> {
    let output_time_base = output
        .stream(stream_index)
        .map(|s| s.time_base())
        .ok_or_else(|| anyhow::anyhow!("sample stream {} missing", stream_index))?;
    let mut packet = codec::packet::Packet::empty();
    while encoder.receive_packet(&mut packet).is_ok() {
        packet.set_stream(stream_index);
        packet.rescale_ts(encoder_time_base, output_time_base);
        packet.write_interleaved(output)?;
    }
    Ok(())
}

/// Writes a short 1080p H.264 + stereo AAC MP4 (moving gradient and a 440 Hz tone).
fn write_sample(dir: &Path) -> anyhow::Result<PathBuf> {
    crate::init()?;
    let path = dir.join("sample.mp4");
    let mut output = format::output(&path)?;
    let global_header = output
        .format()
        .flags()
        .contains(format::Flags::GLOBAL_HEADER);

    let video_time_base = Rational::new(1, SAMPLE_FPS);
    let video_codec = find_encoder("libx264")?;
    let mut video = codec::Context::new_with_codec(video_codec)
        .encoder()
        .video()?;
    video.set_width(SAMPLE_WIDTH);
    video.set_height(SAMPLE_HEIGHT);
    video.set_format(Pixel::YUV420P);
    video.set_time_base(video_time_base);
    video.set_frame_rate(Some(Rational::new(SAMPLE_FPS, 1)));
    video.set_gop(SAMPLE_FPS as u32);
    if global_header {
        video.set_flags(codec::Flags::GLOBAL_HEADER);
    }
    let mut opts = Dictionary::new();
    opts.set("preset", "ultrafast");
    let mut video = video.open_with(opts)?;
    let mut ost = output.add_stream(video_codec)?;
    ost.set_parameters(&video);
    ost.set_time_base(video_time_base);
    let video_index = ost.index();

    let audio_time_base = Rational::new(1, SAMPLE_RATE);
    let audio_codec = find_encoder("aac")?;
    let mut audio = codec::Context::new_with_codec(audio_codec)
        .encoder()
        .audio()?;
    audio.set_rate(SAMPLE_RATE);
    audio.set_channel_layout(ChannelLayout::STEREO);
    audio.set_format(Sample::F32(sample::Type::Planar));
    audio.set_bit_rate(128_000);
    audio.set_time_base(audio_time_base);
    if global_header {
        audio.set_flags(codec::Flags::GLOBAL_HEADER);
    }
    let mut audio = audio.open_as(audio_codec)?;
    let mut ost = output.add_stream(audio_codec)?;
    ost.set_parameters(&audio);
    ost.set_time_base(audio_time_base);
    let audio_index = ost.index();

    output.write_header()?;

    let frame_size = audio.frame_size().max(1) as usize;
    let samples_per_video_frame = (SAMPLE_RATE / SAMPLE_FPS) as i64;
    let mut audio_pts: i64 = 0;
    let mut picture = frame::Video::new(Pixel::YUV420P, SAMPLE_WIDTH, SAMPLE_HEIGHT);
    for i in 0..(SAMPLE_FPS * SAMPLE_SECONDS) as usize {
        let stride = picture.stride(0);
        let luma = picture.data_mut(0);
        for y in 0..SAMPLE_HEIGHT as usize {
            for x in 0..SAMPLE_WIDTH as usize {
                luma[y * stride + x] = ((x + y + i * 8) & 0xff) as u8;
            }
        }
        picture.data_mut(1).fill(128);
        picture.data_mut(2).fill(128);
        picture.set_pts(Some(i as i64));
        video.send_frame(&picture)?;
        drain(&mut video, &mut output, video_index, video_time_base)?;

        while audio_pts < (i as i64 + 1) * samples_per_video_frame {
            let mut tone = frame::Audio::new(
                Sample::F32(sample::Type::Planar),
                frame_size,
                ChannelLayout::STEREO,
            );
            tone.set_rate(SAMPLE_RATE as u32);
            for channel in 0..2 {
                for (n, value) in tone.plane_mut::<f32>(channel).iter_mut().enumerate() {
                    let t = (audio_pts + n as i64) as f32 / SAMPLE_RATE as f32;
                    *value = 0.2 * (2.0 * std::f32::consts::PI * 440.0 * t).sin();
                }
            }
            tone.set_pts(Some(audio_pts));
            audio.send_frame(&tone)?;
            drain(&mut audio, &mut output, audio_index, audio_time_base)?;
            audio_pts += frame_size as i64;
        }
    }

    video.send_eof()?;
    drain(&mut video, &mut output, video_index, video_time_base)?;
    audio.send_eof()?;
    drain(&mut audio, &mut output, audio_index, audio_time_base)?;
    output.write_trailer()?;
    Ok(path)
}

fn segment_streams(path: &Path) -> anyhow::Result<AvInput> {
    AvInput::open(path, &Default::default())
}

fn job_for(input: &Path, output_dir: &Path) -> MediaPipelineJob {
    MediaPipelineJob::new(JobConfig {
        input: input.to_path_buf(),
        output_dir: output_dir.to_path_buf(),
        ..Default::default()
    })
}

#[test]
fn test_config_defaults() {
    let cfg = JobConfig::default();
    assert_eq!(cfg.video_codec, COPY);
    assert_eq!(cfg.audio_codec, COPY);
    assert_eq!(cfg.crf, DEFAULT_CRF);
    assert_eq!(cfg.preset, DEFAULT_PRESET);
    assert_eq!(cfg.segment_duration, DEFAULT_SEGMENT_DURATION);
    assert!(!cfg.is_transcode());

    let normalized = JobConfig {
        crf: 0,
        preset: String::new(),
        segment_duration: 0,
        seek_seconds: -3.0,
        ..Default::default()
    }
    .normalized();
    assert_eq!(normalized.crf, DEFAULT_CRF);
    assert_eq!(normalized.preset, DEFAULT_PRESET);
    assert_eq!(normalized.segment_duration, DEFAULT_SEGMENT_DURATION);
    assert_eq!(normalized.seek_seconds, 0.0);
}

#[test]
fn test_disabled_stream_does_not_count_as_transcode() {
    let cfg = JobConfig {
        video_stream: None,
        video_codec: "libx264".to_string(),
        ..Default::default()
    };
    assert!(!cfg.is_transcode());

    let cfg = JobConfig {
        audio_codec: "aac".to_string(),
        ..Default::default()
    };
    assert!(cfg.is_transcode());
}

#[tokio::test]
async fn test_stop_is_idempotent() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let job = job_for(Path::new("/nonexistent/input.mkv"), dir.path());

    job.stop();
    job.stop();
    assert!(job.is_stopped());

    // Never started: the completion signal fires on stop.
    tokio::time::timeout(Duration::from_secs(1), job.wait()).await?;
    assert!(job.is_done());
    assert!(job.error().is_none());
    Ok(())
}

#[test]
fn test_run_after_stop_is_not_a_failure() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let job = job_for(Path::new("/nonexistent/input.mkv"), dir.path());
    job.stop();
    job.run()?;
    assert!(job.is_done());
    assert!(job.error().is_none());
    Ok(())
}

#[tokio::test]
async fn test_failed_run_records_error_and_fires_done() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let job = job_for(Path::new("/nonexistent/input.mkv"), dir.path());

    assert!(job.run().is_err());
    assert!(job.is_done());
    let error = job.error().unwrap_or_default();
    assert!(error.contains("open input"), "unexpected error: {}", error);

    tokio::time::timeout(Duration::from_secs(1), job.wait()).await?;
    Ok(())
}

#[test]
fn test_run_twice_fails() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let job = job_for(Path::new("/nonexistent/input.mkv"), dir.path());
    let _ = job.run();
    let second = job.run();
    assert!(second.is_err());
    Ok(())
}

#[test]
fn test_remux_writes_playlist_and_segments() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let input_path = write_sample(dir.path())?;
    let out = dir.path().join("original");
    std::fs::create_dir(&out)?;

    let job = MediaPipelineJob::new(JobConfig {
        input: input_path,
        output_dir: out.clone(),
        segment_duration: 2,
        ..Default::default()
    });
    job.run()?;
    assert!(job.is_done());
    assert!(job.error().is_none());

    let playlist = std::fs::read_to_string(out.join(PLAYLIST_NAME))?;
    assert!(playlist.starts_with("#EXTM3U"));
    assert!(playlist.contains("seg-00000.ts"));
    assert!(playlist.contains("#EXT-X-PLAYLIST-TYPE:EVENT"));
    assert!(playlist.contains("#EXT-X-ENDLIST"));
    assert!(out.join("seg-00000.ts").metadata()?.len() > 0);

    let segment = segment_streams(&out.join("seg-00000.ts"))?;
    let video = segment
        .select_video(Some(0))
        .ok_or_else(|| anyhow::anyhow!("segment has no video"))?;
    assert_eq!((video.width(), video.height()), (SAMPLE_WIDTH, SAMPLE_HEIGHT));
    assert!(segment.streams().iter().any(|s| s.is_audio()));
    Ok(())
}

#[test]
fn test_transcode_downscales_to_720p() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let input_path = write_sample(dir.path())?;
    let out = dir.path().join("720p");
    std::fs::create_dir(&out)?;

    let job = MediaPipelineJob::new(JobConfig {
        input: input_path,
        output_dir: out.clone(),
        video_codec: "libx264".to_string(),
        height: 720,
        video_bitrate_kbps: 2_800,
        preset: "ultrafast".to_string(),
        audio_codec: "aac".to_string(),
        audio_bitrate_kbps: 128,
        segment_duration: 2,
        ..Default::default()
    });
    job.run()?;

    assert!(out.join(PLAYLIST_NAME).exists());
    let segment = segment_streams(&out.join("seg-00000.ts"))?;
    let video = segment
        .streams()
        .iter()
        .find(|s| s.is_video())
        .ok_or_else(|| anyhow::anyhow!("segment has no video"))?;
    assert_eq!((video.width(), video.height()), (1280, 720));
    let audio = segment
        .streams()
        .iter()
        .find(|s| s.is_audio())
        .ok_or_else(|| anyhow::anyhow!("segment has no audio"))?;
    assert_eq!(audio.codec_name(), "aac");
    Ok(())
}

#[test]
fn test_audio_only_rendition() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let input_path = write_sample(dir.path())?;
    let out = dir.path().join("audio").join("0");
    std::fs::create_dir_all(&out)?;

    let job = MediaPipelineJob::new(JobConfig {
        input: input_path,
        output_dir: out.clone(),
        video_stream: None,
        audio_stream: Some(0),
        audio_codec: "aac".to_string(),
        audio_bitrate_kbps: 128,
        segment_duration: 2,
        ..Default::default()
    });
    job.run()?;

    let playlist = std::fs::read_to_string(out.join(PLAYLIST_NAME))?;
    assert!(playlist.contains("seg-00000.ts"));
    let segment = segment_streams(&out.join("seg-00000.ts"))?;
    assert!(segment.streams().iter().any(|s| s.is_audio()));
    assert!(segment.streams().iter().all(|s| !s.is_video()));
    Ok(())
}

#[test]
fn test_strip_on_real_stream_parameters() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let input_path = write_sample(dir.path())?;

    let input = AvInput::open(&input_path, &Default::default())?;
    let video = input
        .select_video(Some(0))
        .ok_or_else(|| anyhow::anyhow!("sample has no video"))?;
    let mut params = video.parameters().clone();
    assert!(!has_side_data(&params, SideDataKind::DolbyVisionConfig));
    unsafe {
        let ptr = params.as_mut_ptr();
        let entry = ffmpeg_next::ffi::av_packet_side_data_new(
            &mut (*ptr).coded_side_data,
            &mut (*ptr).nb_coded_side_data,
            ffmpeg_next::ffi::AVPacketSideDataType::AV_PKT_DATA_DOVI_CONF,
            24,
            0,
        );
        assert!(!entry.is_null());
    }
    assert!(has_side_data(&params, SideDataKind::DolbyVisionConfig));
    assert!(strip_side_data(&mut params, SideDataKind::DolbyVisionConfig));
    assert!(!has_side_data(&params, SideDataKind::DolbyVisionConfig));
    // The codec itself is untouched.
    assert_eq!(params.id(), video.parameters().id());
    Ok(())
}

#[tokio::test]
async fn test_stop_while_running() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let input_path = write_sample(dir.path())?;
    let out = dir.path().join("720p");
    std::fs::create_dir(&out)?;

    let job = std::sync::Arc::new(MediaPipelineJob::new(JobConfig {
        input: input_path,
        output_dir: out,
        video_codec: "libx264".to_string(),
        height: 720,
        ..Default::default()
    }));
    let runner = std::sync::Arc::clone(&job);
    let handle = tokio::task::spawn_blocking(move || runner.run());

    job.stop();
    job.stop();
    tokio::time::timeout(Duration::from_secs(30), job.wait()).await?;
    handle.await??;
    assert!(job.is_stopped());
    assert!(job.error().is_none());
    Ok(())
}
