use std::{
    collections::HashMap,
    path::{Path, PathBuf},
    sync::{Arc, Mutex},
    time::Duration,
};

use chrono::{DateTime, Utc};
use ffmpeg_hls::{metadata::MediaInfo, subtitle::extract_webvtt};
use moka::future::Cache;
use serde::{Deserialize, Serialize};
use tokio::{sync::mpsc, task::JoinHandle};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::{
    config::ServerConfig,
    error::{PlaybackError, PlaybackResult},
    playback::{
        client::{ClientProfile, detect_client_profile},
        decision::{QualityProfile, analyze_media, audio_rendition_codec, enabled_profiles},
        manifest::{SUBTITLE_DIR, subtitle_path},
        pipeline::{MAX_AUDIO_TRACKS, PipelineManager},
        session::{
            AudioTrackInfo, Session, SessionManager, SubtitleTrackInfo,
            audio_tracks_from_media_info, subtitle_tracks_from_media_info,
        },
        source::{FileResolver, MediaProber},
    },
};

pub const STREAM_BASE_PATH: &str = "/api/v1/playback/stream";

const PROBE_CACHE_CAPACITY: u64 = 500;
const PROBE_CACHE_TTL: Duration = Duration::from_secs(60 * 60);
const DOLBY_VISION: &str = "dolby vision";

#[derive(Debug, Clone, Default, Deserialize)]
pub struct StartPlaybackRequest {
    pub media_id: String,
    #[serde(default)]
    pub user_id: Option<Uuid>,
    #[serde(default)]
    pub audio_track: Option<usize>,
    #[serde(default)]
    pub subtitle_track: Option<usize>,
    #[serde(default)]
    pub start_position: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProfileInfo {
    pub name: String,
    pub width: u32,
    pub height: u32,
    pub bitrate_kbps: u32,
    pub is_original: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlaybackSessionResponse {
    pub session_id: Uuid,
    pub master_playlist_url: String,
    pub duration_seconds: f64,
    pub profiles: Vec<ProfileInfo>,
    pub audio_tracks: Vec<AudioTrackInfo>,
    pub subtitle_tracks: Vec<SubtitleTrackInfo>,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

pub fn session_to_response(session: &Session) -> PlaybackSessionResponse {
    PlaybackSessionResponse {
        session_id: session.id,
        master_playlist_url: format!("{}/{}/master.m3u8", STREAM_BASE_PATH, session.id),
        duration_seconds: session.duration_seconds,
        profiles: session
            .decision
            .profiles
            .iter()
            .map(|p| ProfileInfo {
                name: p.name.clone(),
                width: p.width,
                height: p.height,
                bitrate_kbps: p.video_bitrate_kbps,
                is_original: p.copies_video() && p.copies_audio(),
            })
            .collect(),
        audio_tracks: session.audio_tracks.clone(),
        subtitle_tracks: session.subtitle_tracks.clone(),
        created_at: session.created_at,
        expires_at: session.expires_at,
    }
}

/// Background subtitle extraction owned by one session.
struct SubtitleTask {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

/// Session orchestration: probing, decisions, job launch and teardown.
pub struct PlaybackService {
    sessions: Arc<SessionManager>,
    pipelines: Arc<PipelineManager>,
    prober: Arc<dyn MediaProber>,
    resolver: Arc<dyn FileResolver>,
    profiles: Vec<QualityProfile>,
    probe_cache: Cache<PathBuf, Arc<MediaInfo>>,
    segment_root: PathBuf,
    subtitle_tasks: Mutex<HashMap<Uuid, SubtitleTask>>,
    cancel: CancellationToken,
}

impl PlaybackService {
    pub fn new(
        config: &ServerConfig,
        sessions: Arc<SessionManager>,
        pipelines: Arc<PipelineManager>,
        prober: Arc<dyn MediaProber>,
        resolver: Arc<dyn FileResolver>,
        cancel: CancellationToken,
    ) -> Self {
        let profiles = enabled_profiles(&config.profiles);
        if profiles.is_empty() {
            log::warn!("no known quality profile enabled in {:?}", config.profiles);
        }
        Self {
            sessions,
            pipelines,
            prober,
            resolver,
            profiles,
            probe_cache: Cache::builder()
                .max_capacity(PROBE_CACHE_CAPACITY)
                .time_to_live(PROBE_CACHE_TTL)
                .build(),
            segment_root: config.segment_dir.clone(),
            subtitle_tasks: Mutex::new(HashMap::new()),
            cancel,
        }
    }

    pub fn sessions(&self) -> &Arc<SessionManager> {
        &self.sessions
    }

    pub fn pipelines(&self) -> &Arc<PipelineManager> {
        &self.pipelines
    }

    async fn probe_file(&self, path: &Path) -> PlaybackResult<Arc<MediaInfo>> {
        if let Some(info) = self.probe_cache.get(path).await {
            return Ok(info);
        }
        let prober = Arc::clone(&self.prober);
        let probe_path = path.to_path_buf();
        let info = tokio::task::spawn_blocking(move || prober.probe(&probe_path))
            .await
            .map_err(|e| PlaybackError::Probe(e.into()))?
            .map_err(PlaybackError::Probe)?;
        let info = Arc::new(info);
        self.probe_cache
            .insert(path.to_path_buf(), Arc::clone(&info))
            .await;
        Ok(info)
    }

    pub async fn start_session(
        &self,
        request: &StartPlaybackRequest,
        user_agent: &str,
    ) -> PlaybackResult<Session> {
        let resolver = Arc::clone(&self.resolver);
        let media_id = request.media_id.clone();
        let file_path = tokio::task::spawn_blocking(move || resolver.resolve(&media_id))
            .await
            .map_err(|e| PlaybackError::Resolve(e.into()))?
            .map_err(|e| match e.downcast::<PlaybackError>() {
                Ok(e) => e,
                Err(e) => PlaybackError::Resolve(e),
            })?;
        let info = self.probe_file(&file_path).await?;
        let decision = analyze_media(&info, &self.profiles);
        let client = detect_client_profile(user_agent).unwrap_or_else(ClientProfile::conservative);

        let id = Uuid::new_v4();
        let segment_dir = self.segment_root.join(id.to_string());
        let mut session = Session::new(id, &request.media_id, file_path, segment_dir);
        session.user_id = request.user_id.unwrap_or_else(Uuid::nil);
        session.active_profiles = decision.profiles.iter().map(|p| p.name.clone()).collect();
        session.decision = decision;
        session.audio_track = request.audio_track.unwrap_or(0);
        session.subtitle_track = request.subtitle_track;
        session.start_position = request.start_position.unwrap_or(0.0).max(0.0);
        session.duration_seconds = info.duration_seconds;
        session.audio_tracks = audio_tracks_from_media_info(&info);
        if session.audio_tracks.len() > MAX_AUDIO_TRACKS {
            log::warn!(
                "media {}: only the first {} of {} audio tracks are offered",
                session.media_id,
                MAX_AUDIO_TRACKS,
                session.audio_tracks.len()
            );
            session.audio_tracks.truncate(MAX_AUDIO_TRACKS);
        }
        session.subtitle_tracks = subtitle_tracks_from_media_info(&info);

        let session = self.sessions.create(session).await?;
        if let Err(e) = tokio::fs::create_dir_all(&session.segment_dir).await {
            self.sessions.delete(&session.id).await;
            return Err(e.into());
        }

        let strip_dolby_vision = !client.can_display_dynamic_range(DOLBY_VISION);
        for profile in &session.decision.profiles {
            if let Err(e) = self
                .pipelines
                .start_video_segmenting(
                    session.id,
                    &session.file_path,
                    &session.segment_dir,
                    profile,
                    session.start_position,
                    strip_dolby_vision,
                )
                .await
            {
                log::error!(
                    "session {}: start video {} failed: {:#}",
                    session.id,
                    profile.name,
                    e
                );
            }
        }
        for track in &session.audio_tracks {
            let (codec, bitrate) = audio_rendition_codec(&track.codec);
            if let Err(e) = self
                .pipelines
                .start_audio_rendition(
                    session.id,
                    &session.file_path,
                    &session.segment_dir,
                    track.index,
                    codec,
                    bitrate,
                    session.start_position,
                )
                .await
            {
                log::error!(
                    "session {}: start audio track {} failed: {:#}",
                    session.id,
                    track.index,
                    e
                );
            }
        }
        self.spawn_subtitle_extraction(&session);

        log::info!(
            "playback session {} started: media={} client={} can_remux={} profiles={} audio={} subtitles={}",
            session.id,
            session.media_id,
            client.name,
            session.decision.can_remux,
            session.decision.profiles.len(),
            session.audio_tracks.len(),
            session.subtitle_tracks.len()
        );
        Ok(session)
    }

    fn spawn_subtitle_extraction(&self, session: &Session) {
        if session.subtitle_tracks.is_empty() {
            return;
        }
        let id = session.id;
        let input = session.file_path.clone();
        let segment_dir = session.segment_dir.clone();
        let tracks = session.subtitle_tracks.clone();
        let cancel = self.cancel.child_token();
        let task_cancel = cancel.clone();
        let handle = tokio::task::spawn_blocking(move || {
            // Never recreate a segment directory that teardown already removed.
            match std::fs::create_dir(segment_dir.join(SUBTITLE_DIR)) {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {}
                Err(e) => {
                    log::warn!("session {}: create subtitle dir failed: {}", id, e);
                    return;
                }
            }
            for track in tracks {
                let output = subtitle_path(&segment_dir, track.index);
                match extract_webvtt(&input, track.stream_index, &output, &cancel) {
                    Ok(cues) => log::debug!(
                        "session {}: subtitle {} extracted ({} cues)",
                        id,
                        track.index,
                        cues
                    ),
                    Err(e) => log::warn!(
                        "session {}: subtitle {} extraction failed: {:#}",
                        id,
                        track.index,
                        e
                    ),
                }
            }
        });
        self.subtitle_tasks
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(
                id,
                SubtitleTask {
                    cancel: task_cancel,
                    handle,
                },
            );
    }

    #[cfg(test)]
    pub(crate) fn subtitle_cancel_token(&self, id: &Uuid) -> Option<CancellationToken> {
        self.subtitle_tasks
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(id)
            .map(|task| task.cancel.clone())
    }

    pub async fn get_session(&self, id: &Uuid) -> Option<Session> {
        self.sessions.get(id).await
    }

    pub async fn heartbeat_session(
        &self,
        id: Uuid,
        position_seconds: Option<f64>,
    ) -> PlaybackResult<Session> {
        self.sessions
            .heartbeat(id, position_seconds)
            .await
            .ok_or(PlaybackError::SessionNotFound(id))
    }

    pub async fn stop_session(&self, id: Uuid) -> PlaybackResult<()> {
        let session = self
            .sessions
            .delete(&id)
            .await
            .ok_or(PlaybackError::SessionNotFound(id))?;
        self.teardown(session).await;
        log::info!("playback session {} stopped", id);
        Ok(())
    }

    /// Stops every job and the subtitle extraction of `session`, then removes
    /// its directory in the background.
    async fn teardown(&self, session: Session) {
        let subtitles = self
            .subtitle_tasks
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&session.id);
        if let Some(task) = &subtitles {
            task.cancel.cancel();
        }
        let stopped = self.pipelines.stop_all_for_session(session.id).await;
        log::debug!("session {}: {} pipelines stopped", session.id, stopped);
        tokio::spawn(async move {
            // The extractor writes into the directory until it has returned.
            if let Some(task) = subtitles {
                let _ = task.handle.await;
            }
            if let Err(e) = tokio::fs::remove_dir_all(&session.segment_dir).await {
                if e.kind() != std::io::ErrorKind::NotFound {
                    log::warn!(
                        "session {}: remove {} failed: {}",
                        session.id,
                        session.segment_dir.display(),
                        e
                    );
                }
            }
        });
    }

    /// Tears down sessions dropped by the session cache and keeps its
    /// maintenance running so expirations are observed.
    pub fn spawn_reaper(
        self: &Arc<Self>,
        mut evicted: mpsc::UnboundedReceiver<Session>,
        interval: Duration,
    ) -> JoinHandle<()> {
        let service = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                tokio::select! {
                    _ = service.cancel.cancelled() => break,
                    session = evicted.recv() => match session {
                        Some(session) => {
                            log::info!("session {} expired, tearing down", session.id);
                            service.teardown(session).await;
                        }
                        None => break,
                    },
                    _ = ticker.tick() => {
                        service.sessions.run_pending_tasks().await;
                        service.pipelines.run_pending_tasks().await;
                    }
                }
            }
            log::debug!("session reaper stopped");
        })
    }
}

#[cfg(test)]
#[path = "service_test.rs"]
mod service_test;
