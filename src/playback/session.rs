use std::{
    collections::HashSet,
    path::PathBuf,
    sync::{Arc, Mutex},
    time::Duration,
};

use chrono::{DateTime, Utc};
use ffmpeg_hls::{metadata::MediaInfo, subtitle::is_bitmap_subtitle};
use moka::{
    future::Cache,
    notification::RemovalCause,
    ops::compute::{CompResult, Op},
};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::{
    error::{PlaybackError, PlaybackResult},
    playback::decision::TranscodeDecision,
};

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AudioTrackInfo {
    /// Position among the source's audio streams; also the rendition index.
    pub index: usize,
    pub codec: String,
    pub language: String,
    pub title: String,
    pub channels: u32,
    pub is_default: bool,
    pub bitrate_kbps: u32,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SubtitleTrackInfo {
    /// Position among the extracted text subtitles.
    pub index: usize,
    /// Absolute stream index in the source.
    pub stream_index: usize,
    pub codec: String,
    pub language: String,
    pub title: String,
    pub is_default: bool,
    pub is_forced: bool,
}

/// One audio track per source audio stream. The first becomes default when none is flagged.
pub fn audio_tracks_from_media_info(info: &MediaInfo) -> Vec<AudioTrackInfo> {
    let mut tracks: Vec<AudioTrackInfo> = info
        .audio_streams
        .iter()
        .map(|s| AudioTrackInfo {
            index: s.index,
            codec: s.codec.clone(),
            language: s.language.clone(),
            title: s.title.clone(),
            channels: s.channels,
            is_default: s.is_default,
            bitrate_kbps: s.bitrate_kbps,
        })
        .collect();
    if !tracks.iter().any(|t| t.is_default) {
        if let Some(first) = tracks.first_mut() {
            first.is_default = true;
        }
    }
    tracks
}

/// Text subtitles only, renumbered from 0. The first one is the default.
pub fn subtitle_tracks_from_media_info(info: &MediaInfo) -> Vec<SubtitleTrackInfo> {
    info.subtitle_streams
        .iter()
        .filter(|s| !is_bitmap_subtitle(&s.codec))
        .enumerate()
        .map(|(index, s)| SubtitleTrackInfo {
            index,
            stream_index: s.stream_index,
            codec: s.codec.clone(),
            language: s.language.clone(),
            title: s.title.clone(),
            is_default: index == 0,
            is_forced: s.is_forced,
        })
        .collect()
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Session {
    pub id: Uuid,
    pub user_id: Uuid,
    pub media_id: String,
    pub file_path: PathBuf,
    /// `{segment root}/{id}`; owned by this session alone.
    pub segment_dir: PathBuf,
    pub decision: TranscodeDecision,
    pub active_profiles: Vec<String>,
    pub audio_track: usize,
    pub subtitle_track: Option<usize>,
    pub start_position: f64,
    pub duration_seconds: f64,
    pub audio_tracks: Vec<AudioTrackInfo>,
    pub subtitle_tracks: Vec<SubtitleTrackInfo>,
    pub created_at: DateTime<Utc>,
    pub last_accessed_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl Session {
    pub fn new(id: Uuid, media_id: &str, file_path: PathBuf, segment_dir: PathBuf) -> Self {
        let now = Utc::now();
        Self {
            id,
            user_id: Uuid::nil(),
            media_id: media_id.to_string(),
            file_path,
            segment_dir,
            decision: TranscodeDecision::default(),
            active_profiles: Vec::new(),
            audio_track: 0,
            subtitle_track: None,
            start_position: 0.0,
            duration_seconds: 0.0,
            audio_tracks: Vec::new(),
            subtitle_tracks: Vec::new(),
            created_at: now,
            last_accessed_at: now,
            expires_at: now,
        }
    }

    /// Flagged default track, else the first.
    pub fn default_audio_track(&self) -> Option<&AudioTrackInfo> {
        self.audio_tracks
            .iter()
            .find(|t| t.is_default)
            .or_else(|| self.audio_tracks.first())
    }

    fn refresh(&mut self, ttl: chrono::Duration) {
        let now = Utc::now();
        let mut expires_at = now + ttl;
        if expires_at <= self.expires_at {
            expires_at = self.expires_at + chrono::Duration::milliseconds(1);
        }
        self.last_accessed_at = now;
        self.expires_at = expires_at;
    }
}

/// Releases the slot of `id`. Only the first release of a session succeeds.
fn release(active: &Mutex<HashSet<Uuid>>, id: &Uuid) -> bool {
    active.lock().unwrap_or_else(|e| e.into_inner()).remove(id)
}

/// Live sessions with a TTL and a hard concurrency cap.
///
/// The cache holds twice the cap so that entries awaiting eviction never push
/// live ones out; the separately locked slot set is what enforces the cap.
/// A session's slot is released exactly once, by whichever of `delete` and
/// the eviction listener gets to it first.
pub struct SessionManager {
    cache: Cache<Uuid, Session>,
    active: Arc<Mutex<HashSet<Uuid>>>,
    max_sessions: usize,
    ttl: Duration,
}

impl SessionManager {
    /// Sessions dropped by expiry or capacity are sent to `evicted`, if given.
    pub fn new(
        max_sessions: usize,
        ttl: Duration,
        evicted: Option<mpsc::UnboundedSender<Session>>,
    ) -> Self {
        let active = Arc::new(Mutex::new(HashSet::new()));
        let listener_active = Arc::clone(&active);
        let cache = Cache::builder()
            .max_capacity((max_sessions.max(1) * 2) as u64)
            .time_to_live(ttl)
            .eviction_listener(move |id: Arc<Uuid>, session: Session, cause: RemovalCause| {
                match cause {
                    RemovalCause::Expired | RemovalCause::Size => {
                        // Already released by `delete`, which tears it down itself.
                        if !release(&listener_active, &id) {
                            return;
                        }
                        log::info!("session {} evicted ({:?})", id, cause);
                        if let Some(tx) = &evicted {
                            let _ = tx.send(session);
                        }
                    }
                    // Released by `delete`; replacements are touches.
                    RemovalCause::Explicit | RemovalCause::Replaced => {}
                }
            })
            .build();

        Self {
            cache,
            active,
            max_sessions,
            ttl,
        }
    }

    pub fn max_sessions(&self) -> usize {
        self.max_sessions
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    fn ttl_delta(&self) -> chrono::Duration {
        chrono::Duration::from_std(self.ttl).unwrap_or_else(|_| chrono::Duration::days(1))
    }

    pub fn active_count(&self) -> usize {
        self.active.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    fn try_reserve(&self, id: Uuid) -> bool {
        let mut active = self.active.lock().unwrap_or_else(|e| e.into_inner());
        if active.len() >= self.max_sessions {
            return false;
        }
        active.insert(id)
    }

    /// Registers `session`. Fails without side effects once the cap is reached.
    pub async fn create(&self, mut session: Session) -> PlaybackResult<Session> {
        if !self.try_reserve(session.id) {
            // Expired entries only release their slot once maintenance runs.
            self.cache.run_pending_tasks().await;
            if !self.try_reserve(session.id) {
                return Err(PlaybackError::CapacityReached {
                    max: self.max_sessions,
                });
            }
        }

        let now = Utc::now();
        session.created_at = now;
        session.last_accessed_at = now;
        session.expires_at = now + self.ttl_delta();
        self.cache.insert(session.id, session.clone()).await;
        log::info!(
            "session {} created ({}/{})",
            session.id,
            self.active_count(),
            self.max_sessions
        );
        Ok(session)
    }

    pub async fn get(&self, id: &Uuid) -> Option<Session> {
        self.cache.get(id).await
    }

    async fn update<F>(&self, id: Uuid, f: F) -> Option<Session>
    where
        F: FnOnce(&mut Session) + Send,
    {
        let ttl = self.ttl_delta();
        let result = self
            .cache
            .entry(id)
            .and_compute_with(|entry| {
                let op = match entry {
                    Some(entry) => {
                        let mut session = entry.into_value();
                        f(&mut session);
                        session.refresh(ttl);
                        Op::Put(session)
                    }
                    None => Op::Nop,
                };
                std::future::ready(op)
            })
            .await;
        match result {
            CompResult::ReplacedWith(entry) => Some(entry.into_value()),
            _ => None,
        }
    }

    /// Refreshes the TTL. A session that is already gone stays gone.
    pub async fn touch(&self, id: Uuid) -> Option<Session> {
        self.update(id, |_| {}).await
    }

    pub async fn heartbeat(&self, id: Uuid, position_seconds: Option<f64>) -> Option<Session> {
        self.update(id, move |session| {
            if let Some(position) = position_seconds {
                session.start_position = position.max(0.0);
            }
        })
        .await
    }

    /// Removes the session and hands it back for teardown.
    ///
    /// An entry past its TTL is still removed here, and the caller owns its
    /// teardown; the listener then sees the slot released and stays out.
    pub async fn delete(&self, id: &Uuid) -> Option<Session> {
        let claimed = release(&self.active, id);
        let removed = self.cache.remove(id).await;
        match removed {
            Some(session) if claimed => {
                log::info!("session {} deleted", id);
                Some(session)
            }
            _ => None,
        }
    }

    /// Applies pending expirations so their listeners run.
    pub async fn run_pending_tasks(&self) {
        self.cache.run_pending_tasks().await;
    }
}

#[cfg(test)]
#[path = "session_test.rs"]
mod session_test;
