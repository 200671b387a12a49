use std::{sync::Arc, time::Duration};

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::{
    config::ServerConfig,
    handler::stream::StreamHandler,
    playback::{
        pipeline::{EncodeSettings, PipelineManager},
        service::PlaybackService,
        session::SessionManager,
        source::{FfmpegProber, LibraryResolver},
    },
};

mod api;
mod config;
mod error;
mod handler;
mod playback;

const REAPER_INTERVAL: Duration = Duration::from_secs(1);

fn init_logging() {
    env_logger::Builder::from_default_env()
        .filter_level(log::LevelFilter::Info)
        .filter_module("ffmpeg_hls", log::LevelFilter::Info)
        .filter_module("abr_stream", log::LevelFilter::Debug)
        .init();
}

#[tokio::main]
async fn main() -> ! {
    init_logging();
    let config = ServerConfig::load().unwrap_or_else(|e| {
        log::error!("load config: {:#}", e);
        std::process::exit(1);
    });
    if let Err(e) = ffmpeg_hls::init() {
        log::error!("ffmpeg init: {:#}", e);
        std::process::exit(1);
    }

    let cancel = CancellationToken::new();

    let (evicted_tx, evicted_rx) = mpsc::unbounded_channel();
    let sessions = Arc::new(SessionManager::new(
        config.max_sessions,
        config.session_ttl(),
        Some(evicted_tx),
    ));
    let pipelines = Arc::new(PipelineManager::new(
        config.max_pipelines,
        EncodeSettings {
            crf: config.crf,
            preset: config.preset.clone(),
            segment_duration: config.segment_duration,
        },
    ));
    let service = Arc::new(PlaybackService::new(
        &config,
        Arc::clone(&sessions),
        Arc::clone(&pipelines),
        Arc::new(FfmpegProber),
        Arc::new(LibraryResolver::new(&config.library_root)),
        cancel.clone(),
    ));
    service.spawn_reaper(evicted_rx, REAPER_INTERVAL);

    let stream = Arc::new(StreamHandler::new(
        Arc::clone(&sessions),
        config.playlist_wait(),
        cancel.clone(),
    ));
    log::info!(
        "segments in {}, library at {}, max {} sessions",
        config.segment_dir.display(),
        config.library_root.display(),
        config.max_sessions
    );
    api::start_api_server(config.listen, api::app(service, stream), cancel.clone());

    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                break;
            },
            _ = tokio::signal::ctrl_c() => {
                cancel.cancel();
            },
        }
    }

    let stopped = pipelines.stop_all().await;
    log::info!("{} pipelines stopped, exiting", stopped);
    std::process::exit(0);
}
