//! HTTP surface of the development server: client state polling and asset download.

use std::{collections::HashMap, future::Future};

use axum::{
    Json, Router,
    extract::{Path, Query, State},
    http::{HeaderValue, StatusCode, header},
    response::{IntoResponse, Response},
    routing::get,
};
use mime_guess::MimeGuess;
use tokio::net::TcpListener;
use tokio_util::io::ReaderStream;

use crate::{
    dev::{state::ReadOutcome, supervisor::SupervisorHandle},
    foundation::core::AssetKey,
};

pub const PROCESS_STATE_ROUTE: &str = "/api/latestAnimationModule/graphicsRendererProcessState";
const PROCESS_KEY_PARAM: &str = "graphicsRendererProcessKey";

pub fn router(handle: SupervisorHandle) -> Router {
    Router::new()
        .route(PROCESS_STATE_ROUTE, get(process_state))
        .route("/asset/{filename}", get(asset))
        .with_state(handle)
}

/// Serve until `shutdown` resolves.
pub async fn serve(
    listener: TcpListener,
    handle: SupervisorHandle,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> anyhow::Result<()> {
    axum::serve(listener, router(handle))
        .with_graceful_shutdown(shutdown)
        .await?;
    Ok(())
}

async fn process_state(
    State(handle): State<SupervisorHandle>,
    Query(params): Query<HashMap<String, String>>,
) -> Response {
    let Some(raw) = params.get(PROCESS_KEY_PARAM) else {
        return (
            StatusCode::BAD_REQUEST,
            format!("missing query parameter '{PROCESS_KEY_PARAM}'"),
        )
            .into_response();
    };
    let key = match raw.parse::<AssetKey>() {
        Ok(key) => key,
        Err(e) => return (StatusCode::BAD_REQUEST, e.to_string()).into_response(),
    };

    match handle.read_state(key).await {
        Ok(ReadOutcome::NoBuild) => StatusCode::NO_CONTENT.into_response(),
        Ok(ReadOutcome::Snapshot(snapshot)) => Json(snapshot).into_response(),
        Ok(ReadOutcome::InvalidKey(message)) => (StatusCode::BAD_REQUEST, message).into_response(),
        Err(e) => {
            tracing::error!(%key, error = %e, "process state read failed");
            (StatusCode::INTERNAL_SERVER_ERROR, "internal error").into_response()
        }
    }
}

async fn asset(State(handle): State<SupervisorHandle>, Path(filename): Path<String>) -> Response {
    let Some(path) = handle.assets().resolve(&filename) else {
        return (StatusCode::NOT_FOUND, "asset not found").into_response();
    };
    let file = match tokio::fs::File::open(&path).await {
        Ok(f) => f,
        Err(e) => {
            tracing::warn!(path = %path.display(), error = %e, "registered asset is unreadable");
            return (StatusCode::NOT_FOUND, "asset not found").into_response();
        }
    };

    let mime = MimeGuess::from_path(&path).first_or_octet_stream();
    let content_type = HeaderValue::from_str(mime.as_ref())
        .unwrap_or(HeaderValue::from_static("application/octet-stream"));
    (
        [(header::CONTENT_TYPE, content_type)],
        axum::body::Body::from_stream(ReaderStream::new(file)),
    )
        .into_response()
}
