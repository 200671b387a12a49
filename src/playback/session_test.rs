use std::time::Duration;

use ffmpeg_hls::metadata::{AudioStreamInfo, SubtitleStreamInfo};

use super::*;

fn session() -> Session {
    let id = Uuid::new_v4();
    Session::new(
        id,
        "movies/test.mkv",
        PathBuf::from("/media/movies/test.mkv"),
        PathBuf::from("/segments").join(id.to_string()),
    )
}

#[tokio::test]
async fn test_create_and_delete_counts() -> anyhow::Result<()> {
    let manager = SessionManager::new(8, Duration::from_secs(60), None);
    let mut ids = Vec::new();
    for _ in 0..5 {
        ids.push(manager.create(session()).await?.id);
    }
    assert_eq!(manager.active_count(), 5);

    for id in ids.iter().take(3) {
        assert!(manager.delete(id).await.is_some());
    }
    assert_eq!(manager.active_count(), 2);

    // Deleting again never drives the count below the live sessions.
    for id in ids.iter().take(3) {
        assert!(manager.delete(id).await.is_none());
    }
    assert_eq!(manager.active_count(), 2);

    for id in ids.iter().skip(3) {
        manager.delete(id).await;
    }
    assert_eq!(manager.active_count(), 0);
    assert!(manager.delete(&Uuid::new_v4()).await.is_none());
    assert_eq!(manager.active_count(), 0);
    Ok(())
}

#[tokio::test]
async fn test_create_beyond_cap_fails() -> anyhow::Result<()> {
    let manager = SessionManager::new(2, Duration::from_secs(60), None);
    manager.create(session()).await?;
    manager.create(session()).await?;

    let rejected = session();
    let rejected_id = rejected.id;
    let err = manager.create(rejected).await;
    assert!(matches!(err, Err(PlaybackError::CapacityReached { max: 2 })));
    assert_eq!(manager.active_count(), 2);
    assert!(manager.get(&rejected_id).await.is_none());
    Ok(())
}

#[tokio::test]
async fn test_touch_moves_expiry_forward() -> anyhow::Result<()> {
    let manager = SessionManager::new(4, Duration::from_secs(60), None);
    let created = manager.create(session()).await?;

    let mut previous = created.expires_at;
    for _ in 0..10 {
        let touched = manager.touch(created.id).await.unwrap();
        assert!(touched.expires_at > previous);
        previous = touched.expires_at;
    }
    assert_eq!(manager.get(&created.id).await.unwrap().expires_at, previous);
    assert_eq!(manager.active_count(), 1);
    Ok(())
}

#[tokio::test]
async fn test_touch_does_not_resurrect() -> anyhow::Result<()> {
    let manager = SessionManager::new(4, Duration::from_secs(60), None);
    let created = manager.create(session()).await?;
    manager.delete(&created.id).await;
    assert!(manager.touch(created.id).await.is_none());
    assert!(manager.get(&created.id).await.is_none());
    assert_eq!(manager.active_count(), 0);
    Ok(())
}

#[tokio::test]
async fn test_heartbeat_updates_position() -> anyhow::Result<()> {
    let manager = SessionManager::new(4, Duration::from_secs(60), None);
    let created = manager.create(session()).await?;

    let updated = manager.heartbeat(created.id, Some(42.5)).await.unwrap();
    assert_eq!(updated.start_position, 42.5);
    let updated = manager.heartbeat(created.id, None).await.unwrap();
    assert_eq!(updated.start_position, 42.5);
    assert!(manager.heartbeat(Uuid::new_v4(), Some(1.0)).await.is_none());
    Ok(())
}

#[tokio::test]
async fn test_expired_sessions_are_forwarded_and_release_slots() -> anyhow::Result<()> {
    let (tx, mut rx) = mpsc::unbounded_channel();
    let manager = SessionManager::new(1, Duration::from_millis(50), Some(tx));
    let created = manager.create(session()).await?;

    tokio::time::sleep(Duration::from_millis(150)).await;
    assert!(manager.get(&created.id).await.is_none());

    // The slot frees up once maintenance has observed the expiry.
    manager.create(session()).await?;
    let expired = tokio::time::timeout(Duration::from_secs(1), rx.recv()).await?;
    assert_eq!(expired.map(|s| s.id), Some(created.id));
    assert_eq!(manager.active_count(), 1);
    Ok(())
}

#[tokio::test]
async fn test_delete_of_lapsed_session_releases_one_slot() -> anyhow::Result<()> {
    let (tx, mut rx) = mpsc::unbounded_channel();
    let manager = SessionManager::new(2, Duration::from_millis(400), Some(tx));
    let lapsed = manager.create(session()).await?;
    tokio::time::sleep(Duration::from_millis(250)).await;
    manager.create(session()).await?;
    // `lapsed` is past its TTL but maintenance has not evicted it yet.
    tokio::time::sleep(Duration::from_millis(200)).await;

    assert_eq!(manager.delete(&lapsed.id).await.map(|s| s.id), Some(lapsed.id));
    assert_eq!(manager.active_count(), 1);

    manager.create(session()).await?;
    let err = manager.create(session()).await;
    assert!(matches!(err, Err(PlaybackError::CapacityReached { max: 2 })));
    assert_eq!(manager.active_count(), 2);

    // The caller tears `lapsed` down; the reaper never sees it.
    manager.run_pending_tasks().await;
    assert!(rx.try_recv().is_err());
    Ok(())
}

#[test]
fn test_audio_tracks_default_to_first() {
    let mut info = MediaInfo {
        audio_streams: vec![
            AudioStreamInfo {
                index: 0,
                codec: "dts".to_string(),
                ..Default::default()
            },
            AudioStreamInfo {
                index: 1,
                codec: "aac".to_string(),
                ..Default::default()
            },
        ],
        ..Default::default()
    };
    let tracks = audio_tracks_from_media_info(&info);
    assert!(tracks[0].is_default);
    assert!(!tracks[1].is_default);

    info.audio_streams[1].is_default = true;
    let tracks = audio_tracks_from_media_info(&info);
    assert!(!tracks[0].is_default);
    assert!(tracks[1].is_default);
}

#[test]
fn test_subtitle_tracks_skip_bitmaps() {
    let info = MediaInfo {
        subtitle_streams: vec![
            SubtitleStreamInfo {
                index: 0,
                stream_index: 2,
                codec: "hdmv_pgs_subtitle".to_string(),
                ..Default::default()
            },
            SubtitleStreamInfo {
                index: 1,
                stream_index: 3,
                codec: "subrip".to_string(),
                language: "en".to_string(),
                ..Default::default()
            },
            SubtitleStreamInfo {
                index: 2,
                stream_index: 4,
                codec: "ass".to_string(),
                ..Default::default()
            },
        ],
        ..Default::default()
    };
    let tracks = subtitle_tracks_from_media_info(&info);
    assert_eq!(tracks.len(), 2);
    assert_eq!((tracks[0].index, tracks[0].stream_index), (0, 3));
    assert!(tracks[0].is_default);
    assert_eq!((tracks[1].index, tracks[1].stream_index), (1, 4));
    assert!(!tracks[1].is_default);
}
