use super::{
    config::{Backend, Coordinator},
    handler::{AppState, router},
};
use crate::server::config::AllowedOrigins;
use axum::{
    Router,
    body::{Body, to_bytes},
    http::{Request, StatusCode, header},
    response::Response,
};
use core::time::Duration;
use durastream::{
    ChunkStore, CoordinatorConfig, MemoryChunkStore, Payload, ScriptedProducer, StreamCoordinator,
};
use serde_json::Value;
use tower::ServiceExt;

fn coordinator(story: &str) -> Coordinator {
    StreamCoordinator::new(
        Backend::Memory(MemoryChunkStore::new()),
        ScriptedProducer::new(story),
        CoordinatorConfig {
            poll_interval: Duration::from_millis(20),
            ..CoordinatorConfig::default()
        },
    )
}

fn app(coordinator: &Coordinator) -> Router {
    let origins = AllowedOrigins::List(vec!["http://localhost:3000".to_string()]);
    router(
        AppState::new(coordinator.clone(), Duration::from_secs(15)),
        &origins,
    )
    .unwrap()
}

async fn get(app: Router, uri: &str, headers: &[(&str, &str)]) -> Response {
    let mut request = Request::builder().uri(uri);
    for (name, value) in headers {
        request = request.header(*name, *value);
    }
    app.oneshot(request.body(Body::empty()).unwrap())
        .await
        .unwrap()
}

async fn body_text(response: Response) -> String {
    let bytes = tokio::time::timeout(
        Duration::from_secs(5),
        to_bytes(response.into_body(), usize::MAX),
    )
    .await
    .unwrap()
    .unwrap();
    String::from_utf8(bytes.to_vec()).unwrap()
}

async fn body_json(response: Response) -> Value {
    serde_json::from_str(&body_text(response).await).unwrap()
}

/// Parses an SSE body into `(id, data)` pairs, skipping keep-alive comments.
fn sse_events(body: &str) -> Vec<(u64, Value)> {
    body.split("\n\n")
        .filter_map(|block| {
            let mut id = None;
            let mut data = None;
            for line in block.lines() {
                if let Some(value) = line.strip_prefix("id: ") {
                    id = Some(value.parse::<u64>().unwrap());
                } else if let Some(value) = line.strip_prefix("data: ") {
                    data = Some(serde_json::from_str::<Value>(value).unwrap());
                }
            }
            Some((id?, data?))
        })
        .collect()
}

fn ids(events: &[(u64, Value)]) -> Vec<u64> {
    events.iter().map(|(id, _)| *id).collect()
}

#[tokio::test]
async fn streams_events_with_sse_headers() {
    let coordinator = coordinator("Once upon a time");
    let response = get(app(&coordinator), "/events/stream1", &[]).await;

    assert_eq!(response.status(), StatusCode::OK);
    let headers = response.headers();
    assert_eq!(headers[header::CONTENT_TYPE], "text/event-stream");
    assert_eq!(headers[header::CACHE_CONTROL], "no-cache");
    assert_eq!(headers[header::CONNECTION], "keep-alive");
    assert_eq!(headers["x-accel-buffering"], "no");

    let events = sse_events(&body_text(response).await);
    assert_eq!(ids(&events), vec![0, 1, 2, 3, 4]);
    assert_eq!(
        events[1].1,
        serde_json::json!({ "story": " upon", "streamId": "stream1", "eventId": 1, "end": false })
    );
    assert_eq!(
        events[4].1,
        serde_json::json!({ "story": "", "streamId": "stream1", "eventId": 4, "end": true })
    );
}

#[tokio::test]
async fn resumes_from_query_cursor() {
    let coordinator = coordinator("a b c");
    let store = coordinator.store();
    for (seq, word) in ["a", " b", " c"].into_iter().enumerate() {
        store
            .append("s1", seq as u64, Payload::fragment(word))
            .await
            .unwrap();
    }
    store.append("s1", 3, Payload::terminal()).await.unwrap();

    let response = get(app(&coordinator), "/events/s1?lastEventId=1", &[]).await;
    let events = sse_events(&body_text(response).await);
    assert_eq!(ids(&events), vec![2, 3]);
    assert_eq!(events[0].1["story"], " c");
}

#[tokio::test]
async fn resumes_from_last_event_id_header() {
    let coordinator = coordinator("one two three");
    let first = sse_events(&body_text(get(app(&coordinator), "/events/s1", &[]).await).await);
    assert_eq!(ids(&first), vec![0, 1, 2, 3]);

    let response = get(app(&coordinator), "/events/s1", &[("Last-Event-ID", "2")]).await;
    assert_eq!(ids(&sse_events(&body_text(response).await)), vec![3]);

    // The query parameter wins over the header.
    let response = get(
        app(&coordinator),
        "/events/s1?lastEventId=0",
        &[("Last-Event-ID", "2")],
    )
    .await;
    assert_eq!(ids(&sse_events(&body_text(response).await)), vec![1, 2, 3]);

    // `-1` asks for the whole stream.
    let response = get(app(&coordinator), "/events/s1?lastEventId=-1", &[]).await;
    assert_eq!(ids(&sse_events(&body_text(response).await)), vec![0, 1, 2, 3]);
}

#[tokio::test]
async fn rejects_bad_cursor_and_stream_id() {
    let coordinator = coordinator("a");

    let response = get(app(&coordinator), "/events/s1?lastEventId=abc", &[]).await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    let body = body_json(response).await;
    assert!(body["error"].as_str().unwrap().contains("abc"));

    let response = get(app(&coordinator), "/events/bad%0Aid", &[]).await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);

    let long = "x".repeat(200);
    let response = get(app(&coordinator), &format!("/streams/{long}"), &[]).await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn reports_stream_status() {
    let coordinator = coordinator("a b");
    let response = get(app(&coordinator), "/streams/s1", &[]).await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(
        body_json(response).await,
        serde_json::json!({ "streamId": "s1", "lastSequence": null, "complete": false, "live": false })
    );

    body_text(get(app(&coordinator), "/events/s1", &[]).await).await;
    tokio::time::timeout(Duration::from_secs(5), async {
        while coordinator.active_runs() > 0 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .unwrap();

    let response = get(app(&coordinator), "/streams/s1", &[]).await;
    assert_eq!(
        body_json(response).await,
        serde_json::json!({ "streamId": "s1", "lastSequence": 2, "complete": true, "live": false })
    );
}

#[tokio::test]
async fn health_flips_to_unavailable_on_shutdown() {
    let coordinator = coordinator("a");
    let response = get(app(&coordinator), "/health", &[]).await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(body_json(response).await["status"], "serving");

    coordinator.shutdown(Duration::from_millis(100)).await;

    let response = get(app(&coordinator), "/health", &[]).await;
    assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);

    let response = get(app(&coordinator), "/events/s1", &[]).await;
    assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
}

#[tokio::test]
async fn cors_allows_configured_origin() {
    let coordinator = coordinator("a");
    let response = get(
        app(&coordinator),
        "/health",
        &[("Origin", "http://localhost:3000")],
    )
    .await;
    assert_eq!(
        response.headers()[header::ACCESS_CONTROL_ALLOW_ORIGIN],
        "http://localhost:3000"
    );

    let response = get(
        app(&coordinator),
        "/health",
        &[("Origin", "http://evil.test")],
    )
    .await;
    assert!(
        !response
            .headers()
            .contains_key(header::ACCESS_CONTROL_ALLOW_ORIGIN)
    );
}
