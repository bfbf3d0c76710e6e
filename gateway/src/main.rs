use std::convert::Infallible;
use std::{env, net::SocketAddr, sync::Arc};

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::sse::{Event as SseEvent, KeepAlive, Sse},
    routing::{get, post},
    Json, Router,
};
use futures::stream::Stream;
use serde::Deserialize;
use serde_json::{json, Map, Value};
use tetramesh_p2p::{InputEvent, InputSource, MemoryPubSub, PubSub, RoomError, RoomManager};
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

const DEFAULT_BIND_ADDR: &str = "0.0.0.0:8090";
const DEFAULT_APP_ID: &str = "tetris";
const DEFAULT_VERSION: &str = "0.1.0";

#[derive(Clone)]
struct AppState {
    manager: Option<RoomManager>,
}

type ApiError = (StatusCode, Json<Value>);

fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/healthz", get(health))
        .route("/api/tetris/register", post(register))
        .route("/api/tetris/ready", post(ready))
        .route("/api/tetris/player/:player_id", get(get_player))
        .route("/api/tetris/room/:room_id", get(get_room))
        .route("/api/tetris/room/:room_id/state", get(get_room_state))
        .route("/api/tetris/room/:room_id/stream", get(room_stream))
        .route("/api/tetris/room/:room_id/control", post(control))
        .route("/api/tetris/room/:room_id/input", post(input))
        .fallback(not_found)
        .with_state(state)
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    init_tracing();

    let bind_addr = env::var("GATEWAY_ADDR").unwrap_or_else(|_| DEFAULT_BIND_ADDR.to_string());
    let transport = env::var("TRANSPORT").unwrap_or_else(|_| "memory".to_string());
    let socket_addr: SocketAddr = bind_addr.parse()?;

    // The gossip transport lives behind the same PubSub seam but ships
    // separately; this binary only wires the in-process bus.
    let pubsub: Arc<dyn PubSub> = match transport.as_str() {
        "memory" => Arc::new(MemoryPubSub::new()),
        other => return Err(format!("unsupported transport: {other}").into()),
    };
    let manager = RoomManager::new(pubsub);
    let state = AppState {
        manager: Some(manager),
    };

    let app = build_router(state);
    let listener = tokio::net::TcpListener::bind(socket_addr).await?;
    info!(%socket_addr, %transport, "tetramesh gateway listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;
    Ok(())
}

async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
}

fn init_tracing() {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new("tetramesh_gateway=info,tetramesh_p2p=info,tower_http=info")
    });
    tracing_subscriber::registry()
        .with(env_filter)
        .with(tracing_subscriber::fmt::layer().compact().with_target(false))
        .init();
}

// ---------------------------------------------------------------------------
// Error mapping
// ---------------------------------------------------------------------------

fn bad_request(message: &str) -> ApiError {
    (StatusCode::BAD_REQUEST, Json(json!({ "error": message })))
}

fn room_error(error: RoomError) -> ApiError {
    bad_request(&error.to_string())
}

fn unavailable() -> ApiError {
    (
        StatusCode::SERVICE_UNAVAILABLE,
        Json(json!({ "error": "tetris room service unavailable" })),
    )
}

fn manager(state: &AppState) -> Result<&RoomManager, ApiError> {
    state.manager.as_ref().ok_or_else(unavailable)
}

async fn not_found() -> ApiError {
    (
        StatusCode::NOT_FOUND,
        Json(json!({ "error": "route not found" })),
    )
}

// ---------------------------------------------------------------------------
// Handlers
// ---------------------------------------------------------------------------

async fn health() -> Json<Value> {
    Json(json!({ "status": "ok", "service": "tetramesh-gateway" }))
}

#[derive(Debug, Deserialize)]
struct RegisterRequest {
    #[serde(default)]
    player_id: String,
    #[serde(default)]
    app_id: String,
    #[serde(default)]
    version: String,
}

async fn register(
    State(state): State<AppState>,
    Json(req): Json<RegisterRequest>,
) -> Result<Json<Value>, ApiError> {
    let manager = manager(&state)?;
    if req.player_id.is_empty() {
        return Err(bad_request("player_id required"));
    }
    let app_id = if req.app_id.is_empty() {
        DEFAULT_APP_ID
    } else {
        req.app_id.as_str()
    };
    let version = if req.version.is_empty() {
        DEFAULT_VERSION
    } else {
        req.version.as_str()
    };
    let player = manager
        .upsert_player(&req.player_id, app_id, version)
        .await
        .map_err(room_error)?;
    Ok(Json(json!({ "player": player })))
}

#[derive(Debug, Deserialize)]
struct ReadyRequest {
    #[serde(default)]
    player_id: String,
    #[serde(default)]
    ping_ms: i64,
}

async fn ready(
    State(state): State<AppState>,
    Json(req): Json<ReadyRequest>,
) -> Result<Json<Value>, ApiError> {
    let manager = manager(&state)?;
    match manager
        .set_ready(&req.player_id, req.ping_ms)
        .await
        .map_err(room_error)?
    {
        Some(room) => Ok(Json(json!({ "matched": true, "room": room }))),
        None => Ok(Json(json!({ "matched": false }))),
    }
}

async fn get_player(
    State(state): State<AppState>,
    Path(player_id): Path<String>,
) -> Result<Json<Value>, ApiError> {
    let manager = manager(&state)?;
    let player = manager.get_player(&player_id).await.map_err(room_error)?;
    Ok(Json(json!({ "player": player })))
}

async fn get_room(
    State(state): State<AppState>,
    Path(room_id): Path<String>,
) -> Result<Json<Value>, ApiError> {
    let manager = manager(&state)?;
    let room = manager.get_room(&room_id).await.map_err(room_error)?;
    Ok(Json(json!({ "room": room })))
}

async fn get_room_state(
    State(state): State<AppState>,
    Path(room_id): Path<String>,
) -> Result<Json<Value>, ApiError> {
    let manager = manager(&state)?;
    let room = manager.get_room(&room_id).await.map_err(room_error)?;
    let states = manager.get_room_states(&room_id).await.map_err(room_error)?;
    Ok(Json(json!({ "room": room, "states": states })))
}

/// Server-Sent Events feed of the room's bus topic. Each bus message is
/// forwarded verbatim as the data of a `room` event. There is no replay:
/// clients wanting current state fetch `/state` once on open.
async fn room_stream(
    State(state): State<AppState>,
    Path(room_id): Path<String>,
) -> Result<Sse<impl Stream<Item = Result<SseEvent, Infallible>>>, ApiError> {
    let manager = manager(&state)?;
    let sub = manager.subscribe_room(&room_id);
    let stream = futures::stream::unfold(sub, |mut sub| async move {
        let msg = sub.recv().await?;
        let data = String::from_utf8_lossy(&msg.payload).into_owned();
        Some((Ok(SseEvent::default().event("room").data(data)), sub))
    });
    Ok(Sse::new(stream).keep_alive(KeepAlive::default()))
}

#[derive(Debug, Deserialize)]
struct ControlRequest {
    #[serde(default)]
    player_id: String,
    #[serde(default)]
    to_mode: String,
    #[serde(default)]
    agent_id: String,
}

async fn control(
    State(state): State<AppState>,
    Path(room_id): Path<String>,
    Json(req): Json<ControlRequest>,
) -> Result<Json<Value>, ApiError> {
    let manager = manager(&state)?;
    let player = manager
        .toggle_control(&room_id, &req.player_id, &req.to_mode, &req.agent_id)
        .await
        .map_err(room_error)?;
    Ok(Json(json!({ "player": player })))
}

#[derive(Debug, Deserialize)]
struct InputRequest {
    #[serde(default)]
    player_id: String,
    source: InputSource,
    #[serde(default)]
    action: String,
    #[serde(default)]
    payload: Map<String, Value>,
    #[serde(default)]
    tick: i64,
}

async fn input(
    State(state): State<AppState>,
    Path(room_id): Path<String>,
    Json(req): Json<InputRequest>,
) -> Result<Json<Value>, ApiError> {
    let manager = manager(&state)?;
    manager
        .submit_input(
            &room_id,
            InputEvent {
                player_id: req.player_id,
                source: req.source,
                action: req.action,
                payload: req.payload,
                tick: req.tick,
                at: None,
            },
        )
        .await
        .map_err(room_error)?;
    Ok(Json(json!({ "ok": true })))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::Request;
    use http_body_util::BodyExt;
    use std::time::Duration;
    use tokio::time::sleep;
    use tower::ServiceExt;

    fn test_state() -> (MemoryPubSub, AppState) {
        let bus = MemoryPubSub::new();
        let manager = RoomManager::new(Arc::new(bus.clone()));
        (
            bus,
            AppState {
                manager: Some(manager),
            },
        )
    }

    fn get(path: &str) -> Request<Body> {
        Request::get(path).body(Body::empty()).unwrap()
    }

    fn post_json(path: &str, body: &Value) -> Request<Body> {
        Request::post(path)
            .header("content-type", "application/json")
            .body(Body::from(serde_json::to_vec(body).unwrap()))
            .unwrap()
    }

    async fn body_json(body: Body) -> Value {
        let bytes = body.collect().await.unwrap().to_bytes();
        serde_json::from_slice(&bytes).unwrap()
    }

    async fn send(state: &AppState, request: Request<Body>) -> (StatusCode, Value) {
        let resp = build_router(state.clone()).oneshot(request).await.unwrap();
        let status = resp.status();
        (status, body_json(resp.into_body()).await)
    }

    #[tokio::test]
    async fn health_check() {
        let (_bus, state) = test_state();
        let (status, body) = send(&state, get("/healthz")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "ok");
        assert_eq!(body["service"], "tetramesh-gateway");
    }

    #[tokio::test]
    async fn register_applies_defaults() {
        let (_bus, state) = test_state();
        let (status, body) = send(
            &state,
            post_json("/api/tetris/register", &json!({ "player_id": "alice" })),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["player"]["id"], "alice");
        assert_eq!(body["player"]["app_id"], "tetris");
        assert_eq!(body["player"]["version"], "0.1.0");
        assert_eq!(body["player"]["control_mode"], "human");
    }

    #[tokio::test]
    async fn register_requires_player_id() {
        let (_bus, state) = test_state();
        let (status, body) = send(&state, post_json("/api/tetris/register", &json!({}))).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"], "player_id required");
    }

    #[tokio::test]
    async fn register_second_player_rejected() {
        let (_bus, state) = test_state();
        send(
            &state,
            post_json("/api/tetris/register", &json!({ "player_id": "alice" })),
        )
        .await;
        let (status, body) = send(
            &state,
            post_json("/api/tetris/register", &json!({ "player_id": "bob" })),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(
            body["error"],
            "local seat already occupied by another player"
        );
    }

    #[tokio::test]
    async fn ready_without_peer_reports_unmatched() {
        let (_bus, state) = test_state();
        send(
            &state,
            post_json("/api/tetris/register", &json!({ "player_id": "alice" })),
        )
        .await;
        let (status, body) = send(
            &state,
            post_json("/api/tetris/ready", &json!({ "player_id": "alice", "ping_ms": 40 })),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["matched"], false);
    }

    #[tokio::test]
    async fn ready_validation_errors() {
        let (_bus, state) = test_state();
        let (status, body) = send(
            &state,
            post_json("/api/tetris/ready", &json!({ "player_id": "ghost", "ping_ms": 40 })),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"], "player not found");

        send(
            &state,
            post_json("/api/tetris/register", &json!({ "player_id": "alice" })),
        )
        .await;
        let (status, body) = send(
            &state,
            post_json("/api/tetris/ready", &json!({ "player_id": "alice", "ping_ms": -5 })),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"], "ping_ms required and must be >= 0");
    }

    #[tokio::test]
    async fn unknown_player_and_room_are_bad_requests() {
        let (_bus, state) = test_state();
        let (status, body) = send(&state, get("/api/tetris/player/ghost")).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"], "player not found");

        let (status, body) = send(&state, get("/api/tetris/room/room_404")).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"], "room not found");
    }

    #[tokio::test]
    async fn unknown_route_is_json_404() {
        let (_bus, state) = test_state();
        let (status, body) = send(&state, get("/api/tetris/nope")).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["error"], "route not found");
    }

    #[tokio::test]
    async fn absent_manager_is_503() {
        let state = AppState { manager: None };
        let (status, body) = send(
            &state,
            post_json("/api/tetris/register", &json!({ "player_id": "alice" })),
        )
        .await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(body["error"], "tetris room service unavailable");

        let (status, _) = send(&state, get("/api/tetris/player/alice")).await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        let (status, _) = send(&state, get("/api/tetris/room/room_1/stream")).await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    }

    /// Register through HTTP, pair against a second library-level node on
    /// the same bus, then drive the room endpoints end to end.
    async fn matched_room(bus: &MemoryPubSub, state: &AppState) -> String {
        let peer = RoomManager::new(Arc::new(bus.clone()));
        peer.register_player("bob", "tetris", "0.1.0").await.unwrap();

        send(
            state,
            post_json("/api/tetris/register", &json!({ "player_id": "alice" })),
        )
        .await;
        send(
            state,
            post_json("/api/tetris/ready", &json!({ "player_id": "alice", "ping_ms": 60 })),
        )
        .await;
        peer.set_ready("bob", 30).await.unwrap();

        for _ in 0..150 {
            let (_, body) = send(state, get("/api/tetris/player/alice")).await;
            let room_id = body["player"]["room_id"].as_str().unwrap_or_default();
            if !room_id.is_empty() {
                return room_id.to_string();
            }
            sleep(Duration::from_millis(20)).await;
        }
        panic!("alice was never matched");
    }

    #[tokio::test]
    async fn room_lifecycle_over_http() {
        let (bus, state) = test_state();
        let room_id = matched_room(&bus, &state).await;

        let (status, body) = send(&state, get(&format!("/api/tetris/room/{room_id}"))).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["room"]["host_id"], "bob");

        // No snapshots yet: an empty states object, not an error.
        let (status, body) =
            send(&state, get(&format!("/api/tetris/room/{room_id}/state"))).await;
        assert_eq!(status, StatusCode::OK);
        assert!(body["states"].as_object().unwrap().is_empty());

        // Switch alice to agent control, then gate inputs by source.
        let (status, body) = send(
            &state,
            post_json(
                &format!("/api/tetris/room/{room_id}/control"),
                &json!({ "player_id": "alice", "to_mode": "agent", "agent_id": "agent-openclaw-1" }),
            ),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["player"]["control_mode"], "agent");
        assert_eq!(body["player"]["agent_id"], "agent-openclaw-1");

        let (status, body) = send(
            &state,
            post_json(
                &format!("/api/tetris/room/{room_id}/input"),
                &json!({ "player_id": "alice", "source": "agent", "action": "move_left" }),
            ),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["ok"], true);

        let (status, body) = send(
            &state,
            post_json(
                &format!("/api/tetris/room/{room_id}/input"),
                &json!({ "player_id": "alice", "source": "human", "action": "move_left" }),
            ),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"], "input source does not match control mode");
    }

    #[tokio::test]
    async fn state_sync_visible_through_state_endpoint() {
        let (bus, state) = test_state();
        let room_id = matched_room(&bus, &state).await;

        let (status, _) = send(
            &state,
            post_json(
                &format!("/api/tetris/room/{room_id}/input"),
                &json!({
                    "player_id": "alice",
                    "source": "human",
                    "action": "state_sync",
                    "payload": {
                        "board": ["..TT......", "...T......"],
                        "score": 123,
                        "lines": 4,
                        "level": 2,
                        "game_over": false
                    }
                }),
            ),
        )
        .await;
        assert_eq!(status, StatusCode::OK);

        let (status, body) =
            send(&state, get(&format!("/api/tetris/room/{room_id}/state"))).await;
        assert_eq!(status, StatusCode::OK);
        let alice = &body["states"]["alice"];
        assert_eq!(alice["board"][0], "..TT......");
        assert_eq!(alice["score"], 123);
        assert_eq!(alice["lines"], 4);
    }

    #[tokio::test]
    async fn invalid_control_mode_is_rejected() {
        let (bus, state) = test_state();
        let room_id = matched_room(&bus, &state).await;

        let (status, body) = send(
            &state,
            post_json(
                &format!("/api/tetris/room/{room_id}/control"),
                &json!({ "player_id": "alice", "to_mode": "keyboard" }),
            ),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"], "invalid control mode");
    }

    #[tokio::test]
    async fn room_stream_emits_bus_events() {
        let (bus, state) = test_state();

        let resp = build_router(state.clone())
            .oneshot(get("/api/tetris/room/room_9/stream"))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(
            resp.headers()["content-type"].to_str().unwrap(),
            "text/event-stream"
        );

        // The subscription is live once the response exists; anything
        // published on the room topic shows up as a `room` event.
        bus.publish("tetris.room.room_9", br#"{"type":"room_input"}"#)
            .unwrap();

        let mut body = resp.into_body();
        let frame = tokio::time::timeout(Duration::from_secs(3), body.frame())
            .await
            .expect("frame within deadline")
            .expect("body not ended")
            .unwrap();
        let chunk = frame.into_data().unwrap();
        let text = String::from_utf8(chunk.to_vec()).unwrap();
        assert!(text.contains("event: room"));
        assert!(text.contains(r#"data: {"type":"room_input"}"#));
    }
}
