//! HTTP observability surface.
//!
//! Read-only operator endpoints: health, the metrics snapshot, the live
//! event feed as server-sent events, and the threat summary. The tool RPC
//! surface lives on stdio; nothing here mutates gateway state.

use crate::pipeline::{RequestPipeline, StatsArgs};
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::sse::{Event as SseEvent, KeepAlive, Sse};
use axum::response::IntoResponse;
use axum::routing::get;
use axum::{Json, Router};
use futures_util::Stream;
use std::convert::Infallible;
use std::sync::Arc;
use tokio::sync::broadcast::error::RecvError;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::info;

pub fn router(pipeline: Arc<RequestPipeline>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/api/stats", get(stats))
        .route("/api/events", get(events))
        .route("/api/threats", get(threats))
        .layer(axum::middleware::from_fn(
            crate::middleware::request_logging,
        ))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(pipeline)
}

/// Bind and serve until the process exits. Disabled entirely when the
/// configured port is zero.
pub async fn serve(pipeline: Arc<RequestPipeline>, port: u16) -> anyhow::Result<()> {
    let addr = std::net::SocketAddr::from(([127, 0, 0, 1], port));
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!("observability listener on http://{addr}");
    axum::serve(listener, router(pipeline)).await?;
    Ok(())
}

async fn health() -> &'static str {
    "ok"
}

async fn stats(State(pipeline): State<Arc<RequestPipeline>>) -> impl IntoResponse {
    // The HTTP surface is read-only; stats are served without reset and
    // without the auth gate the RPC tools use.
    match pipeline.server_stats(StatsArgs::default(), "http") {
        Ok(stats) => Json(stats).into_response(),
        Err(e) => (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response(),
    }
}

async fn threats(State(pipeline): State<Arc<RequestPipeline>>) -> impl IntoResponse {
    match pipeline.threat_analysis(None, "http") {
        Ok(summary) => Json(summary).into_response(),
        Err(e) => (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response(),
    }
}

async fn events(
    State(pipeline): State<Arc<RequestPipeline>>,
) -> Sse<impl Stream<Item = Result<SseEvent, Infallible>>> {
    let rx = pipeline.events.subscribe();
    let events = pipeline.events.clone();

    let stream = futures_util::stream::unfold((rx, events), |(mut rx, events)| async move {
        loop {
            match rx.recv().await {
                Ok(event) => {
                    let sse = match SseEvent::default().json_data(&event) {
                        Ok(sse) => sse,
                        Err(_) => continue,
                    };
                    return Some((Ok(sse), (rx, events)));
                }
                // A lagging consumer skips ahead; the gap is counted, the
                // publisher was never blocked.
                Err(RecvError::Lagged(n)) => {
                    events.note_dropped(n);
                    continue;
                }
                Err(RecvError::Closed) => return None,
            }
        }
    });

    Sse::new(stream).keep_alive(KeepAlive::default())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_router_builds() {
        let dir = tempfile::TempDir::new().unwrap();
        let config = crate::models::Config {
            data_dir: dir.path().join("data"),
            logs_dir: dir.path().join("logs"),
            ..Default::default()
        };
        let pipeline = Arc::new(crate::pipeline::RequestPipeline::new(config).unwrap());
        let _router = router(pipeline);
    }
}
