//! HTTP routes over a [`Coordinator`].
//!
//! - `GET /events/{stream_id}`: the stream as Server-Sent Events. Each frame
//!   carries `id: <eventId>` and `data: <json>`. The resume cursor is the
//!   `lastEventId` query parameter or, failing that, the `Last-Event-ID`
//!   header a browser's `EventSource` sends on reconnect. Every other query
//!   parameter is handed to the producer.
//! - `GET /streams/{stream_id}`: the stream's status as JSON.
//! - `GET /health`: 200 while serving, 503 once shutdown has begun.

use super::{config::Coordinator, error::ApiError};
use crate::server::{
    config::AllowedOrigins,
    telemetry::{
        decrement_subscriptions_inflight, increment_frames_delivered, increment_subscription_errors,
        increment_subscriptions, increment_subscriptions_inflight, record_subscription_duration,
    },
};
use axum::{
    Json, Router,
    extract::{Path, Query, State},
    http::{HeaderMap, HeaderName, HeaderValue, Method, StatusCode, header},
    response::{
        IntoResponse,
        sse::{Event, KeepAlive, Sse},
    },
    routing::get,
};
use core::time::Duration;
use durastream::{Error, GenerationRequest, StreamStatus};
use futures::StreamExt;
use std::{collections::BTreeMap, time::Instant};
use tower::ServiceBuilder;
use tower_http::{
    cors::{self, AllowOrigin, CorsLayer},
    trace::TraceLayer,
};

/// Query parameter carrying the resume cursor.
const LAST_EVENT_ID_PARAM: &str = "lastEventId";
const LAST_EVENT_ID_HEADER: &str = "last-event-id";
const X_ACCEL_BUFFERING: HeaderName = HeaderName::from_static("x-accel-buffering");

#[derive(Clone)]
pub struct AppState {
    coordinator: Coordinator,
    keep_alive: Duration,
}

impl AppState {
    pub const fn new(coordinator: Coordinator, keep_alive: Duration) -> Self {
        Self {
            coordinator,
            keep_alive,
        }
    }
}

/// Builds the application router with tracing and CORS layers.
///
/// # Errors
///
/// Returns an error if a configured origin is not a valid header value.
pub fn router(state: AppState, origins: &AllowedOrigins) -> anyhow::Result<Router> {
    Ok(Router::new()
        .route("/events/{stream_id}", get(stream_events))
        .route("/streams/{stream_id}", get(stream_status))
        .route("/health", get(health))
        .with_state(state)
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(cors_layer(origins)?),
        ))
}

fn cors_layer(origins: &AllowedOrigins) -> anyhow::Result<CorsLayer> {
    let layer = CorsLayer::new()
        .allow_methods([Method::GET])
        .allow_headers(cors::Any);

    Ok(match origins {
        AllowedOrigins::Any => layer.allow_origin(cors::Any),
        AllowedOrigins::List(list) => {
            let values = list
                .iter()
                .map(|origin| HeaderValue::from_str(origin))
                .collect::<Result<Vec<_>, _>>()?;
            layer.allow_origin(AllowOrigin::list(values))
        }
    })
}

/// Streams `stream_id` to the client as Server-Sent Events.
///
/// Rejections (bad id, bad cursor, shutting down) are plain JSON error
/// responses. Once the event stream has started, an error aborts the
/// response body so the client reconnects and resumes.
#[tracing::instrument(skip_all, fields(stream_id = %stream_id))]
async fn stream_events(
    State(state): State<AppState>,
    Path(stream_id): Path<String>,
    Query(mut params): Query<BTreeMap<String, String>>,
    headers: HeaderMap,
) -> Result<impl IntoResponse, ApiError> {
    let start = Instant::now();

    let cursor = match params.remove(LAST_EVENT_ID_PARAM) {
        Some(raw) => parse_cursor(&raw),
        None => match headers.get(LAST_EVENT_ID_HEADER) {
            Some(value) => value
                .to_str()
                .map_err(|_| Error::InvalidRequest {
                    reason: "Last-Event-ID is not valid text".to_string(),
                })
                .and_then(parse_cursor),
            None => Ok(None),
        },
    }
    .inspect_err(|_| increment_subscription_errors())?;

    let request = GenerationRequest { stream_id, params };
    let subscription = state
        .coordinator
        .subscribe(request, cursor)
        .inspect_err(|_| increment_subscription_errors())?;

    tracing::debug!(?cursor, "Subscription opened");
    increment_subscriptions();
    let inflight = InflightGuard::new(start);

    let events = subscription.map(move |item| {
        let _inflight = &inflight;
        let frame = item.inspect_err(|e| {
            tracing::warn!("Aborting event stream: {e}");
            increment_subscription_errors();
        })?;
        increment_frames_delivered();
        Ok::<_, Error>(
            Event::default()
                .id(frame.event_id.to_string())
                .data(frame.to_json()?),
        )
    });

    let headers = [
        (header::CACHE_CONTROL, "no-cache"),
        (header::CONNECTION, "keep-alive"),
        (X_ACCEL_BUFFERING, "no"),
    ];
    let sse = Sse::new(events).keep_alive(KeepAlive::new().interval(state.keep_alive));
    Ok((headers, sse))
}

async fn stream_status(
    State(state): State<AppState>,
    Path(stream_id): Path<String>,
) -> Result<Json<StreamStatus>, ApiError> {
    Ok(Json(state.coordinator.status(&stream_id).await?))
}

async fn health(State(state): State<AppState>) -> impl IntoResponse {
    if state.coordinator.is_shutting_down() {
        (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(serde_json::json!({ "status": "shutting_down" })),
        )
    } else {
        (
            StatusCode::OK,
            Json(serde_json::json!({
                "status": "serving",
                "activeRuns": state.coordinator.active_runs(),
                "activeSubscriptions": state.coordinator.active_subscriptions(),
            })),
        )
    }
}

/// Parses a client-supplied cursor.
///
/// Empty or negative values mean "from the start", so clients may send `-1`
/// for a fresh stream.
fn parse_cursor(raw: &str) -> Result<Option<u64>, Error> {
    let raw = raw.trim();
    if raw.is_empty() {
        return Ok(None);
    }
    if let Ok(sequence) = raw.parse::<u64>() {
        return Ok(Some(sequence));
    }
    match raw.parse::<i64>() {
        Ok(n) if n < 0 => Ok(None),
        _ => Err(Error::InvalidRequest {
            reason: format!("`{raw}` is not a valid event id"),
        }),
    }
}

/// Tracks one streaming response for the in-flight gauge and duration
/// histogram.
struct InflightGuard {
    start: Instant,
}

impl InflightGuard {
    fn new(start: Instant) -> Self {
        increment_subscriptions_inflight();
        Self { start }
    }
}

impl Drop for InflightGuard {
    fn drop(&mut self) {
        decrement_subscriptions_inflight();
        record_subscription_duration(self.start.elapsed().as_secs_f64() * 1000.0);
    }
}
