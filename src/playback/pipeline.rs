use std::{
    path::{Path, PathBuf},
    sync::Arc,
};

use ffmpeg_hls::job::{COPY, JobConfig, MediaPipelineJob};
use moka::{future::Cache, notification::RemovalCause, policy::EvictionPolicy};
use uuid::Uuid;

use crate::playback::{
    decision::{ProfileDecision, profile_names},
    manifest::{AUDIO_DIR, audio_rendition_dir},
};

/// Audio renditions probed by `stop_all_for_session`.
pub const MAX_AUDIO_TRACKS: usize = 16;

pub type PipelineKey = (Uuid, String);

/// Encoding knobs shared by every job this manager starts.
#[derive(Debug, Clone)]
pub struct EncodeSettings {
    pub crf: u32,
    pub preset: String,
    pub segment_duration: u32,
}

pub fn audio_rendition_name(track: usize) -> String {
    format!("{}/{}", AUDIO_DIR, track)
}

/// Registry of running jobs keyed by (session, profile or audio rendition).
/// It is the only place jobs are created or torn down.
pub struct PipelineManager {
    jobs: Cache<PipelineKey, Arc<MediaPipelineJob>>,
    settings: EncodeSettings,
}

impl PipelineManager {
    pub fn new(capacity: u64, settings: EncodeSettings) -> Self {
        let jobs = Cache::builder()
            .max_capacity(capacity.max(1))
            .eviction_policy(EvictionPolicy::lru())
            .eviction_listener(
                |key: Arc<PipelineKey>, job: Arc<MediaPipelineJob>, cause: RemovalCause| {
                    match cause {
                        RemovalCause::Size => {
                            log::warn!("pipeline {}:{} evicted, stopping", key.0, key.1);
                            job.stop();
                        }
                        RemovalCause::Replaced => job.stop(),
                        // Explicit removals are stopped and awaited by the caller.
                        RemovalCause::Explicit | RemovalCause::Expired => {}
                    }
                },
            )
            .build();
        Self { jobs, settings }
    }

    pub fn settings(&self) -> &EncodeSettings {
        &self.settings
    }

    fn base_config(&self, input: &Path, output_dir: PathBuf, seek_seconds: f64) -> JobConfig {
        JobConfig {
            input: input.to_path_buf(),
            output_dir,
            crf: self.settings.crf,
            preset: self.settings.preset.clone(),
            segment_duration: self.settings.segment_duration,
            seek_seconds,
            ..Default::default()
        }
    }

    /// Starts the video-only job for one quality profile.
    pub async fn start_video_segmenting(
        &self,
        session_id: Uuid,
        input: &Path,
        segment_dir: &Path,
        profile: &ProfileDecision,
        seek_seconds: f64,
        strip_dolby_vision: bool,
    ) -> anyhow::Result<Arc<MediaPipelineJob>> {
        let config = JobConfig {
            video_codec: profile.video_codec.clone(),
            height: if profile.copies_video() { 0 } else { profile.height },
            video_bitrate_kbps: profile.video_bitrate_kbps,
            video_stream: Some(0),
            audio_stream: None,
            strip_dolby_vision,
            ..self.base_config(input, segment_dir.join(&profile.name), seek_seconds)
        };
        self.launch((session_id, profile.name.clone()), config).await
    }

    /// Starts the audio-only job for the `track`-th audio stream of the input.
    pub async fn start_audio_rendition(
        &self,
        session_id: Uuid,
        input: &Path,
        segment_dir: &Path,
        track: usize,
        codec: &str,
        bitrate_kbps: u32,
        seek_seconds: f64,
    ) -> anyhow::Result<Arc<MediaPipelineJob>> {
        let config = JobConfig {
            video_codec: COPY.to_string(),
            audio_codec: codec.to_string(),
            audio_bitrate_kbps: bitrate_kbps,
            video_stream: None,
            audio_stream: Some(track),
            ..self.base_config(
                input,
                audio_rendition_dir(segment_dir, track),
                seek_seconds,
            )
        };
        self.launch((session_id, audio_rendition_name(track)), config)
            .await
    }

    async fn launch(
        &self,
        key: PipelineKey,
        config: JobConfig,
    ) -> anyhow::Result<Arc<MediaPipelineJob>> {
        // At most one job per key.
        self.stop_process(key.0, &key.1).await;
        tokio::fs::create_dir_all(&config.output_dir).await?;

        let job = Arc::new(MediaPipelineJob::new(config));
        self.jobs.insert(key.clone(), Arc::clone(&job)).await;

        let runner = Arc::clone(&job);
        tokio::task::spawn_blocking(move || match runner.run() {
            Ok(()) => log::info!("pipeline {}:{} finished", key.0, key.1),
            Err(e) => log::error!("pipeline {}:{} failed: {:#}", key.0, key.1, e),
        });
        Ok(job)
    }

    #[cfg(test)]
    pub(crate) async fn register(&self, key: PipelineKey, job: Arc<MediaPipelineJob>) {
        self.jobs.insert(key, job).await;
    }

    pub async fn get_process(&self, session_id: Uuid, name: &str) -> Option<Arc<MediaPipelineJob>> {
        self.jobs.get(&(session_id, name.to_string())).await
    }

    /// Removes, stops and waits for a job. Returns false if there was none.
    pub async fn stop_process(&self, session_id: Uuid, name: &str) -> bool {
        let Some(job) = self.jobs.remove(&(session_id, name.to_string())).await else {
            return false;
        };
        job.stop();
        job.wait().await;
        log::debug!("pipeline {}:{} stopped", session_id, name);
        true
    }

    pub async fn stop_all_for_session(&self, session_id: Uuid) -> usize {
        let names: Vec<String> = profile_names()
            .map(str::to_string)
            .chain((0..MAX_AUDIO_TRACKS).map(audio_rendition_name))
            .collect();
        let stopped = futures::future::join_all(
            names.iter().map(|name| self.stop_process(session_id, name)),
        )
        .await;
        stopped.into_iter().filter(|s| *s).count()
    }

    /// Stops every registered job. Used on shutdown.
    pub async fn stop_all(&self) -> usize {
        let keys: Vec<PipelineKey> = self.jobs.iter().map(|(key, _)| (*key).clone()).collect();
        let stopped =
            futures::future::join_all(keys.iter().map(|(id, name)| self.stop_process(*id, name)))
                .await;
        stopped.into_iter().filter(|s| *s).count()
    }

    pub async fn run_pending_tasks(&self) {
        self.jobs.run_pending_tasks().await;
    }

    pub fn job_count(&self) -> u64 {
        self.jobs.entry_count()
    }
}

#[cfg(test)]
#[path = "pipeline_test.rs"]
mod pipeline_test;
