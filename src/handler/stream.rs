//! Serves the HLS tree of a playback session: master and media playlists,
//! transport-stream segments and WebVTT subtitles.

use std::{path::PathBuf, sync::Arc, time::Duration};

use axum::{
    Router,
    extract::{Path, Request, State},
    http::{
        HeaderValue, Method, StatusCode,
        header::{CACHE_CONTROL, CONTENT_TYPE},
    },
    response::{IntoResponse, Response},
    routing::any,
};
use ffmpeg_hls::{job::COPY, output::PLAYLIST_NAME};
use moka::future::Cache;
use tokio_util::sync::CancellationToken;
use tower_http::{
    cors::{Any, CorsLayer},
    services::ServeFile,
};
use uuid::Uuid;

use crate::{
    config::PlaylistWait,
    error::PlaybackError,
    handler::ApiResult,
    playback::{
        decision::audio_rendition_codec,
        manifest::{
            AUDIO_DIR, AudioVariant, SUBTITLE_DIR, SubtitleVariant, audio_segment_path,
            display_name, generate_master_playlist, profile_variants_from_decision,
            read_audio_playlist, read_media_playlist, segment_path, subtitle_path,
        },
        session::{AudioTrackInfo, Session, SessionManager},
    },
};

pub const PLAYLIST_CONTENT_TYPE: &str = "application/vnd.apple.mpegurl";
pub const SEGMENT_CONTENT_TYPE: &str = "video/mp2t";
pub const SUBTITLE_CONTENT_TYPE: &str = "text/vtt";

const MASTER_PLAYLIST: &str = "master.m3u8";
const PLAYLIST_CACHE_CONTROL: &str = "no-cache";
const SEGMENT_CACHE_CONTROL: &str = "public, max-age=31536000, immutable";
const SUBTITLE_CACHE_CONTROL: &str = "public, max-age=3600";

const MASTER_CACHE_CAPACITY: u64 = 1000;
const MASTER_CACHE_TTL: Duration = Duration::from_secs(30 * 60);
const MEDIA_CACHE_CAPACITY: u64 = 5000;
const MEDIA_CACHE_TTL: Duration = Duration::from_secs(2);

pub struct StreamHandler {
    sessions: Arc<SessionManager>,
    masters: Cache<Uuid, String>,
    media: Cache<String, String>,
    wait: PlaylistWait,
    cancel: CancellationToken,
}

impl StreamHandler {
    pub fn new(sessions: Arc<SessionManager>, wait: PlaylistWait, cancel: CancellationToken) -> Self {
        Self {
            sessions,
            masters: Cache::builder()
                .max_capacity(MASTER_CACHE_CAPACITY)
                .time_to_live(MASTER_CACHE_TTL)
                .build(),
            media: Cache::builder()
                .max_capacity(MEDIA_CACHE_CAPACITY)
                .time_to_live(MEDIA_CACHE_TTL)
                .build(),
            wait,
            cancel,
        }
    }

    async fn dispatch(&self, path: &str, request: Request) -> ApiResult<Response> {
        let Some((id, rest)) = path.split_once('/') else {
            return Err(PlaybackError::NotFound(path.to_string()).into());
        };
        let id = Uuid::parse_str(id)?;
        let session = self
            .sessions
            .get(&id)
            .await
            .ok_or(PlaybackError::SessionNotFound(id))?;

        let sessions = Arc::clone(&self.sessions);
        tokio::spawn(async move {
            sessions.touch(id).await;
        });

        if rest == MASTER_PLAYLIST {
            let playlist = self
                .masters
                .get_with(id, async { build_master_playlist(&session) })
                .await;
            return Ok(playlist_response(playlist));
        }

        if let Some(name) = rest.strip_prefix(SUBTITLE_DIR).and_then(|r| r.strip_prefix('/')) {
            let track = name
                .strip_suffix(".vtt")
                .and_then(|n| n.parse::<usize>().ok())
                .ok_or_else(|| PlaybackError::NotFound(rest.to_string()))?;
            let path = subtitle_path(&session.segment_dir, track);
            return serve_file(path, request, SUBTITLE_CONTENT_TYPE, SUBTITLE_CACHE_CONTROL).await;
        }

        if let Some(rendition) = rest.strip_prefix(AUDIO_DIR).and_then(|r| r.strip_prefix('/')) {
            let (track, file) = rendition
                .split_once('/')
                .and_then(|(t, f)| Some((t.parse::<usize>().ok()?, f)))
                .ok_or_else(|| PlaybackError::NotFound(rest.to_string()))?;
            if file == PLAYLIST_NAME {
                let key = format!("{}:{}/{}", id, AUDIO_DIR, track);
                if let Some(playlist) = self.media.get(&key).await {
                    return Ok(playlist_response(playlist));
                }
                let playlist =
                    read_audio_playlist(&session.segment_dir, track, self.wait, &self.cancel)
                        .await?;
                self.media.insert(key, playlist.clone()).await;
                return Ok(playlist_response(playlist));
            }
            if file.ends_with(".ts") {
                let path = audio_segment_path(&session.segment_dir, track, file)?;
                return serve_file(path, request, SEGMENT_CONTENT_TYPE, SEGMENT_CACHE_CONTROL)
                    .await;
            }
            return Err(PlaybackError::NotFound(rest.to_string()).into());
        }

        if let Some(profile) = rest
            .strip_suffix(PLAYLIST_NAME)
            .and_then(|r| r.strip_suffix('/'))
        {
            let key = format!("{}:{}", id, profile);
            if let Some(playlist) = self.media.get(&key).await {
                return Ok(playlist_response(playlist));
            }
            let playlist =
                read_media_playlist(&session.segment_dir, profile, self.wait, &self.cancel).await?;
            self.media.insert(key, playlist.clone()).await;
            return Ok(playlist_response(playlist));
        }

        if let Some((profile, file)) = rest.split_once('/') {
            if file.ends_with(".ts") {
                let path = segment_path(&session.segment_dir, profile, file)?;
                return serve_file(path, request, SEGMENT_CONTENT_TYPE, SEGMENT_CACHE_CONTROL)
                    .await;
            }
        }

        Err(PlaybackError::NotFound(rest.to_string()).into())
    }
}

pub fn stream_router(handler: Arc<StreamHandler>) -> Router {
    Router::new()
        .route("/{*path}", any(serve_stream))
        .with_state(handler)
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods([Method::GET]),
        )
}

async fn serve_stream(
    State(handler): State<Arc<StreamHandler>>,
    Path(path): Path<String>,
    request: Request,
) -> Response {
    if request.method() != Method::GET {
        return StatusCode::METHOD_NOT_ALLOWED.into_response();
    }
    match handler.dispatch(&path, request).await {
        Ok(response) => response,
        Err(e) => e.into_response(),
    }
}

/// Codec and bitrate the client actually receives for an audio rendition.
fn effective_audio(track: &AudioTrackInfo) -> (String, u32) {
    match audio_rendition_codec(&track.codec) {
        (COPY, _) => (track.codec.clone(), track.bitrate_kbps),
        (codec, bitrate) => (codec.to_string(), bitrate),
    }
}

pub fn build_master_playlist(session: &Session) -> String {
    let decision = &session.decision;
    let audio_kbps = session
        .default_audio_track()
        .map(|t| effective_audio(t).1)
        .unwrap_or(0);
    let profiles = profile_variants_from_decision(
        &decision.profiles,
        &decision.source_video_codec,
        decision.source_bitrate_kbps,
        audio_kbps,
    );
    let audio: Vec<AudioVariant> = session
        .audio_tracks
        .iter()
        .map(|t| AudioVariant {
            index: t.index,
            name: display_name(&t.title, &t.language, t.index),
            language: t.language.clone(),
            channels: t.channels,
            is_default: t.is_default,
            codec: effective_audio(t).0,
        })
        .collect();
    let subtitles: Vec<SubtitleVariant> = session
        .subtitle_tracks
        .iter()
        .map(|t| SubtitleVariant {
            index: t.index,
            name: display_name(&t.title, &t.language, t.index),
            language: t.language.clone(),
            is_default: t.is_default,
        })
        .collect();
    generate_master_playlist(&profiles, &audio, &subtitles)
}

fn playlist_response(playlist: String) -> Response {
    (
        [
            (CONTENT_TYPE, PLAYLIST_CONTENT_TYPE),
            (CACHE_CONTROL, PLAYLIST_CACHE_CONTROL),
        ],
        playlist,
    )
        .into_response()
}

async fn serve_file(
    path: PathBuf,
    request: Request,
    content_type: &'static str,
    cache_control: &'static str,
) -> ApiResult<Response> {
    let mut response = ServeFile::new(&path).try_call(request).await?.into_response();
    if response.status().is_success() {
        let headers = response.headers_mut();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static(content_type));
        headers.insert(CACHE_CONTROL, HeaderValue::from_static(cache_control));
    }
    Ok(response)
}

#[cfg(test)]
#[path = "stream_test.rs"]
mod stream_test;
