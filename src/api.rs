use axum::{Json, Router, extract::State, routing::get};
use restream_core::SupervisorStatus;
use tokio::{net::TcpListener, sync::watch};
use tokio_util::sync::CancellationToken;

pub(crate) fn status_router(status: watch::Receiver<SupervisorStatus>) -> Router {
    Router::new()
        .route("/", get(index))
        .route("/status", get(current_status))
        .with_state(status)
}

pub(crate) fn start_status_server(
    addr: String,
    status: watch::Receiver<SupervisorStatus>,
    cancel: CancellationToken,
) {
    tokio::spawn(async move {
        let listener = match TcpListener::bind(&addr).await {
            Ok(listener) => listener,
            Err(e) => {
                log::error!("could not bind status server on {}: {}", addr, e);
                return;
            }
        };
        log::info!("status server listening on {}", addr);
        if let Err(e) = serve(listener, status, cancel).await {
            log::error!("status server error: {}", e);
        }
    });
}

async fn serve(
    listener: TcpListener,
    status: watch::Receiver<SupervisorStatus>,
    cancel: CancellationToken,
) -> std::io::Result<()> {
    axum::serve(listener, status_router(status))
        .with_graceful_shutdown(shutdown_signal(cancel))
        .await
}

async fn shutdown_signal(cancel: CancellationToken) {
    cancel.cancelled().await;
    log::info!("shutting down status server");
}

async fn index() -> &'static str {
    "live-restream"
}

async fn current_status(
    State(status): State<watch::Receiver<SupervisorStatus>>,
) -> Json<SupervisorStatus> {
    Json(status.borrow().clone())
}

#[cfg(test)]
mod tests {
    use restream_core::SupervisorState;

    use super::*;

    #[tokio::test]
    async fn test_status_endpoint_serves_snapshot() -> anyhow::Result<()> {
        let (tx, rx) = watch::channel(SupervisorStatus::default());
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;
        let cancel = CancellationToken::new();
        let server = tokio::spawn(serve(listener, rx, cancel.clone()));

        tx.send_modify(|s| {
            s.state = SupervisorState::Streaming;
            s.width = Some(1280);
            s.video_frames = 42;
        });

        let body: serde_json::Value = reqwest::get(format!("http://{}/status", addr))
            .await?
            .json()
            .await?;
        assert_eq!(body["state"], "streaming");
        assert_eq!(body["width"], 1280);
        assert_eq!(body["video_frames"], 42);

        let index = reqwest::get(format!("http://{}/", addr)).await?.text().await?;
        assert_eq!(index, "live-restream");

        cancel.cancel();
        server.await??;
        Ok(())
    }
}
