use axum::{body::Body, http};
use ffmpeg_hls::metadata::{AudioStreamInfo, MediaInfo, SubtitleStreamInfo};
use tower::ServiceExt;

use super::*;
use crate::playback::{
    decision::{analyze_media, enabled_profiles},
    session::{audio_tracks_from_media_info, subtitle_tracks_from_media_info},
};

const MEDIA_PLAYLIST: &str =
    "#EXTM3U\n#EXT-X-VERSION:3\n#EXT-X-TARGETDURATION:6\n#EXTINF:6.0,\nseg-00000.ts\n";

struct Fixture {
    router: Router,
    sessions: Arc<SessionManager>,
    session: Session,
    _dir: tempfile::TempDir,
}

fn media_info() -> MediaInfo {
    MediaInfo {
        duration_seconds: 60.0,
        video_codec: "h264".to_string(),
        width: 1920,
        height: 1080,
        video_bitrate_kbps: 8_000,
        audio_streams: vec![
            AudioStreamInfo {
                index: 0,
                stream_index: 1,
                codec: "aac".to_string(),
                channels: 2,
                language: "en".to_string(),
                bitrate_kbps: 160,
                ..Default::default()
            },
            AudioStreamInfo {
                index: 1,
                stream_index: 2,
                codec: "dts".to_string(),
                channels: 6,
                ..Default::default()
            },
        ],
        subtitle_streams: vec![SubtitleStreamInfo {
            index: 0,
            stream_index: 3,
            codec: "subrip".to_string(),
            language: "fr".to_string(),
            ..Default::default()
        }],
        ..Default::default()
    }
}

async fn fixture(wait: PlaylistWait) -> anyhow::Result<Fixture> {
    let dir = tempfile::tempdir()?;
    let info = media_info();
    let id = Uuid::new_v4();
    let mut session = Session::new(
        id,
        "movie.mkv",
        PathBuf::from("/m/movie.mkv"),
        dir.path().join(id.to_string()),
    );
    session.decision = analyze_media(&info, &enabled_profiles(&["original", "720p"]));
    session.audio_tracks = audio_tracks_from_media_info(&info);
    session.subtitle_tracks = subtitle_tracks_from_media_info(&info);

    let sessions = Arc::new(SessionManager::new(4, Duration::from_secs(60), None));
    let session = sessions.create(session).await?;
    let handler = Arc::new(StreamHandler::new(
        Arc::clone(&sessions),
        wait,
        CancellationToken::new(),
    ));
    Ok(Fixture {
        router: stream_router(handler),
        sessions,
        session,
        _dir: dir,
    })
}

fn quick_wait() -> PlaylistWait {
    PlaylistWait {
        retries: 1,
        interval: Duration::from_millis(10),
    }
}

fn write(path: PathBuf, contents: &[u8]) -> anyhow::Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(path, contents)?;
    Ok(())
}

async fn get(router: &Router, uri: &str) -> anyhow::Result<Response> {
    Ok(router
        .clone()
        .oneshot(http::Request::builder().uri(uri).body(Body::empty())?)
        .await?)
}

async fn body_string(response: Response) -> anyhow::Result<String> {
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await?;
    Ok(String::from_utf8(bytes.to_vec())?)
}

#[tokio::test]
async fn test_master_playlist() -> anyhow::Result<()> {
    let f = fixture(quick_wait()).await?;
    let response = get(&f.router, &format!("/{}/master.m3u8", f.session.id)).await?;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(response.headers()[CONTENT_TYPE], PLAYLIST_CONTENT_TYPE);
    assert_eq!(response.headers()[CACHE_CONTROL], "no-cache");

    let body = body_string(response).await?;
    assert!(body.starts_with("#EXTM3U\n"));
    assert!(body.contains("URI=\"audio/0/index.m3u8\""));
    assert!(body.contains("URI=\"audio/1/index.m3u8\""));
    assert!(body.contains("URI=\"subs/0.vtt\""));
    assert!(body.contains("\noriginal/index.m3u8\n"));
    assert!(body.contains("\n720p/index.m3u8\n"));
    // Default track is the copied AAC one.
    assert!(body.contains(",mp4a.40.2\""));
    assert!(body.contains("AUDIO=\"audio\""));
    assert!(body.contains("SUBTITLES=\"subs\""));
    Ok(())
}

#[tokio::test]
async fn test_master_playlist_is_cached() -> anyhow::Result<()> {
    let f = fixture(quick_wait()).await?;
    let uri = format!("/{}/master.m3u8", f.session.id);
    let first = body_string(get(&f.router, &uri).await?).await?;
    let second = body_string(get(&f.router, &uri).await?).await?;
    assert_eq!(first, second);
    assert_eq!(first, build_master_playlist(&f.session));
    Ok(())
}

#[tokio::test]
async fn test_media_playlist() -> anyhow::Result<()> {
    let f = fixture(quick_wait()).await?;
    let dir = &f.session.segment_dir;
    write(dir.join("720p").join(PLAYLIST_NAME), MEDIA_PLAYLIST.as_bytes())?;
    write(
        dir.join(AUDIO_DIR).join("1").join(PLAYLIST_NAME),
        MEDIA_PLAYLIST.as_bytes(),
    )?;

    let response = get(&f.router, &format!("/{}/720p/index.m3u8", f.session.id)).await?;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(response.headers()[CONTENT_TYPE], PLAYLIST_CONTENT_TYPE);
    assert_eq!(body_string(response).await?, MEDIA_PLAYLIST);

    let response = get(&f.router, &format!("/{}/audio/1/index.m3u8", f.session.id)).await?;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(body_string(response).await?, MEDIA_PLAYLIST);
    Ok(())
}

#[tokio::test]
async fn test_playlist_not_ready() -> anyhow::Result<()> {
    let f = fixture(quick_wait()).await?;
    let response = get(&f.router, &format!("/{}/original/index.m3u8", f.session.id)).await?;
    assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(response.headers()["retry-after"], "1");

    let response = get(&f.router, &format!("/{}/audio/0/index.m3u8", f.session.id)).await?;
    assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    Ok(())
}

#[tokio::test]
async fn test_segments_and_subtitles() -> anyhow::Result<()> {
    let f = fixture(quick_wait()).await?;
    let dir = &f.session.segment_dir;
    write(dir.join("720p").join("seg-00000.ts"), b"video")?;
    write(dir.join(AUDIO_DIR).join("0").join("seg-00003.ts"), b"audio")?;
    write(
        dir.join(SUBTITLE_DIR).join("0.vtt"),
        b"WEBVTT\n\n00:00:01.000 --> 00:00:02.000\nbonjour\n",
    )?;

    let response = get(&f.router, &format!("/{}/720p/seg-00000.ts", f.session.id)).await?;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(response.headers()[CONTENT_TYPE], SEGMENT_CONTENT_TYPE);
    assert_eq!(response.headers()[CACHE_CONTROL], SEGMENT_CACHE_CONTROL);
    assert_eq!(body_string(response).await?, "video");

    let response = get(&f.router, &format!("/{}/audio/0/seg-00003.ts", f.session.id)).await?;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(response.headers()[CONTENT_TYPE], SEGMENT_CONTENT_TYPE);
    assert_eq!(body_string(response).await?, "audio");

    let response = get(&f.router, &format!("/{}/subs/0.vtt", f.session.id)).await?;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(response.headers()[CONTENT_TYPE], SUBTITLE_CONTENT_TYPE);
    assert_eq!(response.headers()[CACHE_CONTROL], SUBTITLE_CACHE_CONTROL);
    assert!(body_string(response).await?.starts_with("WEBVTT"));

    let response = get(&f.router, &format!("/{}/720p/seg-00009.ts", f.session.id)).await?;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
    Ok(())
}

#[tokio::test]
async fn test_segment_range_request() -> anyhow::Result<()> {
    let f = fixture(quick_wait()).await?;
    write(
        f.session.segment_dir.join("720p").join("seg-00000.ts"),
        b"0123456789",
    )?;
    let request = http::Request::builder()
        .uri(format!("/{}/720p/seg-00000.ts", f.session.id))
        .header("range", "bytes=2-5")
        .body(Body::empty())?;
    let response = f.router.clone().oneshot(request).await?;
    assert_eq!(response.status(), StatusCode::PARTIAL_CONTENT);
    assert_eq!(body_string(response).await?, "2345");
    Ok(())
}

#[tokio::test]
async fn test_rejected_requests() -> anyhow::Result<()> {
    let f = fixture(quick_wait()).await?;
    let id = f.session.id;
    let cases = [
        (format!("/{}/master.m3u8", Uuid::new_v4()), StatusCode::NOT_FOUND),
        ("/not-a-uuid/master.m3u8".to_string(), StatusCode::BAD_REQUEST),
        (format!("/{}", id), StatusCode::NOT_FOUND),
        (format!("/{}/subs/en.vtt", id), StatusCode::NOT_FOUND),
        (format!("/{}/audio/x/index.m3u8", id), StatusCode::NOT_FOUND),
        (format!("/{}/audio/0/other.txt", id), StatusCode::NOT_FOUND),
        (format!("/{}/audio/0/..%2Fseg-1.ts", id), StatusCode::BAD_REQUEST),
        (format!("/{}/720p/other.txt", id), StatusCode::NOT_FOUND),
        (format!("/{}/720p/../seg-00000.ts", id), StatusCode::BAD_REQUEST),
        (format!("/{}/%2E%2E/index.m3u8", id), StatusCode::BAD_REQUEST),
    ];
    for (uri, status) in cases {
        let response = get(&f.router, &uri).await?;
        assert_eq!(response.status(), status, "{}", uri);
    }

    let request = http::Request::builder()
        .method(Method::POST)
        .uri(format!("/{}/master.m3u8", id))
        .body(Body::empty())?;
    let response = f.router.clone().oneshot(request).await?;
    assert_eq!(response.status(), StatusCode::METHOD_NOT_ALLOWED);
    Ok(())
}

#[tokio::test]
async fn test_cors_header() -> anyhow::Result<()> {
    let f = fixture(quick_wait()).await?;
    let request = http::Request::builder()
        .uri(format!("/{}/master.m3u8", f.session.id))
        .header("origin", "https://player.example")
        .body(Body::empty())?;
    let response = f.router.clone().oneshot(request).await?;
    assert_eq!(response.headers()["access-control-allow-origin"], "*");
    Ok(())
}

#[tokio::test]
async fn test_request_refreshes_session() -> anyhow::Result<()> {
    let f = fixture(quick_wait()).await?;
    let response = get(&f.router, &format!("/{}/master.m3u8", f.session.id)).await?;
    assert_eq!(response.status(), StatusCode::OK);

    // The refresh runs on its own task.
    let mut refreshed = false;
    for _ in 0..50 {
        let current = f.sessions.get(&f.session.id).await;
        if current.is_some_and(|s| s.expires_at > f.session.expires_at) {
            refreshed = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert!(refreshed);
    Ok(())
}
