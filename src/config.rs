use std::{net::SocketAddr, path::PathBuf, time::Duration};

use serde::Deserialize;

/// Environment variable naming the JSON config file.
pub const CONFIG_ENV: &str = "ABR_STREAM_CONFIG";

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub listen: SocketAddr,
    /// Parent of every session's segment directory.
    pub segment_dir: PathBuf,
    /// Media identifiers are resolved relative to this directory.
    pub library_root: PathBuf,
    pub segment_duration: u32,
    pub max_sessions: usize,
    pub session_ttl_secs: u64,
    /// Upper bound of live pipeline jobs across all sessions.
    pub max_pipelines: u64,
    /// Quality profiles offered to clients, in playlist order.
    pub profiles: Vec<String>,
    pub crf: u32,
    pub preset: String,
    pub playlist_wait_retries: u32,
    pub playlist_wait_interval_ms: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: SocketAddr::from(([0, 0, 0, 0], 8080)),
            segment_dir: std::env::temp_dir().join("abr-stream"),
            library_root: PathBuf::from("media"),
            segment_duration: 6,
            max_sessions: 10,
            session_ttl_secs: 30 * 60,
            max_pipelines: 100,
            profiles: vec![
                "original".to_string(),
                "1080p".to_string(),
                "720p".to_string(),
                "480p".to_string(),
            ],
            crf: 23,
            preset: "veryfast".to_string(),
            playlist_wait_retries: 30,
            playlist_wait_interval_ms: 500,
        }
    }
}

impl ServerConfig {
    /// Reads the file named by `ABR_STREAM_CONFIG`, or returns the defaults when unset.
    pub fn load() -> anyhow::Result<Self> {
        match std::env::var_os(CONFIG_ENV) {
            Some(path) => Self::from_file(&PathBuf::from(path)),
            None => Ok(Self::default()),
        }
    }

    pub fn from_file(path: &std::path::Path) -> anyhow::Result<Self> {
        let raw = std::fs::read_to_string(path)
            .map_err(|e| anyhow::anyhow!("read config {}: {}", path.display(), e))?;
        let config = serde_json::from_str(&raw)
            .map_err(|e| anyhow::anyhow!("parse config {}: {}", path.display(), e))?;
        Ok(config)
    }

    pub fn session_ttl(&self) -> Duration {
        Duration::from_secs(self.session_ttl_secs.max(1))
    }

    pub fn playlist_wait(&self) -> PlaylistWait {
        PlaylistWait {
            retries: self.playlist_wait_retries,
            interval: Duration::from_millis(self.playlist_wait_interval_ms),
        }
    }
}

/// Bounded retry schedule used while a job has not produced its playlist yet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PlaylistWait {
    pub retries: u32,
    pub interval: Duration,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_config_keeps_defaults() -> anyhow::Result<()> {
        let config: ServerConfig =
            serde_json::from_str(r#"{"max_sessions": 3, "profiles": ["720p", "original"]}"#)?;
        assert_eq!(config.max_sessions, 3);
        assert_eq!(config.profiles, vec!["720p", "original"]);
        assert_eq!(config.segment_duration, 6);
        assert_eq!(config.preset, "veryfast");
        Ok(())
    }

    #[test]
    fn test_from_file() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("config.json");
        std::fs::write(&path, r#"{"listen": "127.0.0.1:9000", "session_ttl_secs": 60}"#)?;
        let config = ServerConfig::from_file(&path)?;
        assert_eq!(config.listen.port(), 9000);
        assert_eq!(config.session_ttl(), Duration::from_secs(60));

        assert!(ServerConfig::from_file(&dir.path().join("missing.json")).is_err());
        Ok(())
    }
}
