//! HTTP routes serving manifests and segments

use std::sync::Arc;

use axum::{
    extract::{Path, State},
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    routing::get,
    Router,
};
use tower_http::{
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};

use super::SegmentedPublisher;

const PLAYLIST_MIME: &str = "application/vnd.apple.mpegurl";
const MPD_MIME: &str = "application/dash+xml";
const SEGMENT_MIME: &str = "video/mp2t";

/// `/<name>.m3u8`, `/<name>.mpd` and `/<name>/<sequence>.ts`
pub fn create_router(publisher: Arc<SegmentedPublisher>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/:file", get(manifest_handler))
        .route("/:session/:segment", get(segment_handler))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(publisher)
}

fn not_found() -> Response {
    (StatusCode::NOT_FOUND, "Not Found").into_response()
}

fn no_cache(mime: &'static str, body: impl IntoResponse) -> Response {
    (
        [
            (header::CONTENT_TYPE, mime),
            (header::CACHE_CONTROL, "no-cache"),
        ],
        body,
    )
        .into_response()
}

async fn manifest_handler(
    State(publisher): State<Arc<SegmentedPublisher>>,
    Path(file): Path<String>,
) -> Response {
    if let Some(name) = file.strip_suffix(".m3u8") {
        return match publisher.playlist(name) {
            Some(text) => no_cache(PLAYLIST_MIME, text),
            None => not_found(),
        };
    }
    if let Some(name) = file.strip_suffix(".mpd") {
        return match publisher.dash_manifest(name) {
            Some(text) => no_cache(MPD_MIME, text),
            None => not_found(),
        };
    }
    not_found()
}

async fn segment_handler(
    State(publisher): State<Arc<SegmentedPublisher>>,
    Path((session, segment)): Path<(String, String)>,
) -> Response {
    let Some(sequence) = segment
        .strip_suffix(".ts")
        .and_then(|s| s.parse::<u64>().ok())
    else {
        return not_found();
    };
    match publisher.segment(&session, sequence) {
        Some(data) => (
            [
                (header::CONTENT_TYPE, SEGMENT_MIME),
                (header::CACHE_CONTROL, "max-age=60"),
            ],
            data,
        )
            .into_response(),
        None => not_found(),
    }
}
