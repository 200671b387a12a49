use std::{net::SocketAddr, sync::Arc};

use axum::Router;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

use crate::{
    handler::{
        playback::playback_router,
        stream::{StreamHandler, stream_router},
    },
    playback::service::PlaybackService,
};

pub const API_BASE_PATH: &str = "/api/v1/playback";

pub(crate) fn app(service: Arc<PlaybackService>, stream: Arc<StreamHandler>) -> Router {
    Router::new().nest(
        API_BASE_PATH,
        playback_router(service).nest("/stream", stream_router(stream)),
    )
}

pub(crate) fn start_api_server(
    listen: SocketAddr,
    app: Router,
    cancel: CancellationToken,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let listener = match TcpListener::bind(listen).await {
            Ok(listener) => listener,
            Err(e) => {
                log::error!("bind {} failed: {}", listen, e);
                cancel.cancel();
                return;
            }
        };
        log::info!("API server listening on {}", listen);
        if let Err(e) = axum::serve(listener, app)
            .with_graceful_shutdown(shutdown_signal(cancel))
            .await
        {
            log::error!("API server error: {}", e);
        }
    })
}

async fn shutdown_signal(cancel: CancellationToken) {
    cancel.cancelled().await;
    log::info!("shutting down API server...");
}
