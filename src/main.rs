//! CineSync Rust 시그널링 서버

mod config;
mod handlers;
mod protocol;
mod state;
mod sync;
mod tunnel;

use axum::{
    extract::{
        ws::{Message, WebSocket},
        Path, Query, State, WebSocketUpgrade,
    },
    http::StatusCode,
    response::{Html, IntoResponse, Json},
    routing::get,
    Router,
};
use config::Config;
use futures::{SinkExt, StreamExt};
use protocol::{ClientMessage, ServerMessage};
use state::AppState;
use std::sync::Arc;
use sync::SyncCoordinator;
use tokio::sync::mpsc;
use tower_http::cors::{Any, CorsLayer};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// 라우터와 핸들러가 공유하는 컨텍스트
#[derive(Clone)]
struct ServerContext {
    state: Arc<AppState>,
    sync: Arc<SyncCoordinator>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = Config::from_env();

    // 로깅 초기화
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(&config.log_level))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let state = Arc::new(AppState::new(config.clone()));
    let sync = Arc::new(SyncCoordinator::new(state.clone()));

    // 드리프트 검사 루프
    tokio::spawn(sync.clone().run());

    // 방 정리 스케줄러
    let cleanup_state = state.clone();
    let cleanup_interval = config.room.cleanup_interval_secs;
    tokio::spawn(async move {
        let mut interval =
            tokio::time::interval(tokio::time::Duration::from_secs(cleanup_interval));
        loop {
            interval.tick().await;
            handlers::cleanup_old_rooms(cleanup_state.clone()).await;
        }
    });

    // 터널 탐색
    if config.tunnel.enabled {
        tokio::spawn(tunnel::start_tunnel(state.clone(), config.port));
    }

    // CORS 설정
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    // 라우터 설정
    let ctx = ServerContext {
        state: state.clone(),
        sync,
    };
    let app = Router::new()
        .route("/", get(index_handler))
        .route("/health", get(health_handler))
        .route("/ws", get(ws_handler))
        .route("/api/rooms/:code", get(get_room_handler))
        .route("/api/rooms/:code/ready", get(get_ready_count_handler))
        .route("/api/turn/credentials", get(turn_credentials_handler))
        .route("/api/tunnel", get(tunnel_handler))
        .layer(cors)
        .with_state(ctx);

    let addr = format!("{}:{}", config.host, config.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;

    tracing::info!("🚀 CineSync Rust Signaling Server started");
    tracing::info!("Address: {}", addr);
    tracing::info!("WebSocket: ws://{}/ws", addr);

    axum::serve(listener, app).await?;
    Ok(())
}

async fn index_handler() -> Html<&'static str> {
    Html("<h1>CineSync Signaling Server (Rust)</h1><p>WebSocket endpoint: /ws</p>")
}

async fn health_handler(State(ctx): State<ServerContext>) -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "status": "ok",
        "server": "cinesync-signaling-rs",
        "rooms": ctx.state.rooms.len(),
        "timestamp": sync::now_millis() / 1000
    }))
}

async fn get_room_handler(
    State(ctx): State<ServerContext>,
    Path(code): Path<String>,
) -> impl IntoResponse {
    let Some(room) = ctx.state.rooms.get(&code) else {
        return (
            StatusCode::NOT_FOUND,
            Json(serde_json::json!({"error": "room not found"})),
        );
    };

    let participants: Vec<serde_json::Value> = {
        let inner = room.inner.read().await;
        inner
            .approved_names
            .iter()
            .map(|(id, name)| serde_json::json!({"id": id, "name": name}))
            .collect()
    };

    (
        StatusCode::OK,
        Json(serde_json::json!({
            "code": room.code,
            "host": room.host,
            "participants": participants,
        })),
    )
}

async fn get_ready_count_handler(
    State(ctx): State<ServerContext>,
    Path(code): Path<String>,
) -> impl IntoResponse {
    let Some(room) = ctx.state.rooms.get(&code) else {
        return (
            StatusCode::NOT_FOUND,
            Json(serde_json::json!({"error": "room not found"})),
        );
    };

    let ready_count = room.inner.read().await.ready_viewers.len();
    (
        StatusCode::OK,
        Json(serde_json::json!({"readyCount": ready_count})),
    )
}

#[derive(serde::Deserialize)]
#[serde(rename_all = "camelCase")]
struct TurnQuery {
    current_username: Option<String>,
}

async fn turn_credentials_handler(
    State(ctx): State<ServerContext>,
    Query(query): Query<TurnQuery>,
) -> impl IntoResponse {
    // 아직 유효한 자격증명을 들고 온 갱신 요청은 재발급하지 않는다
    if let Some(username) = query.current_username.as_deref() {
        if handlers::validate_credentials(username) {
            return Json(serde_json::json!({
                "success": true,
                "refreshed": false,
            }))
            .into_response();
        }
    }

    Json(handlers::issue_credentials(&ctx.state.config.turn)).into_response()
}

async fn tunnel_handler(State(ctx): State<ServerContext>) -> Json<serde_json::Value> {
    let tunnel = ctx.state.tunnel_url.read().await.clone();
    Json(serde_json::json!({
        "tunnel": tunnel.clone().unwrap_or_default(),
        "ready": tunnel.is_some(),
    }))
}

async fn ws_handler(
    ws: WebSocketUpgrade,
    State(ctx): State<ServerContext>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, ctx))
}

async fn handle_socket(socket: WebSocket, ctx: ServerContext) {
    let (mut ws_sender, mut ws_receiver) = socket.split();
    let (tx, mut rx) = mpsc::unbounded_channel::<ServerMessage>();

    // 연결 처리
    let conn_id = handlers::handle_connection(ctx.state.clone(), tx).await;

    // 송신 태스크
    let send_task = tokio::spawn(async move {
        while let Some(msg) = rx.recv().await {
            if let Ok(json) = serde_json::to_string(&msg) {
                if ws_sender.send(Message::Text(json)).await.is_err() {
                    break;
                }
            }
        }
    });

    // 수신 처리
    while let Some(result) = ws_receiver.next().await {
        match result {
            Ok(Message::Text(text)) => match serde_json::from_str::<ClientMessage>(&text) {
                Ok(msg) => handle_client_message(&ctx, &conn_id, msg).await,
                Err(err) => {
                    // 파싱 불가 페이로드는 응답 없이 버린다
                    tracing::warn!(conn_id = %conn_id, error = %err, "Malformed event dropped");
                }
            },
            Ok(Message::Close(_)) => break,
            Err(_) => break,
            _ => {}
        }
    }

    // 연결 해제
    handlers::handle_disconnect(ctx.state, &conn_id).await;
    send_task.abort();
}

/// 이벤트 디스패치
///
/// 연결 태스크당 하나의 match로 전체 이벤트 표면을 한 곳에서 처리한다.
async fn handle_client_message(ctx: &ServerContext, conn_id: &str, msg: ClientMessage) {
    let state = ctx.state.clone();
    match msg {
        // Room Lifecycle
        ClientMessage::CreateRoom {
            participant_id,
            name,
            requested_code,
        } => {
            handlers::handle_create_room(state, conn_id, participant_id, name, requested_code)
                .await;
        }
        ClientMessage::JoinRequest {
            code,
            participant_id,
            name,
        } => {
            handlers::handle_join_request(state, conn_id, &code, &participant_id, &name).await;
        }
        ClientMessage::JoinApprove {
            code,
            participant_id,
        } => {
            handlers::handle_join_approve(state, conn_id, &code, &participant_id).await;
        }
        ClientMessage::JoinReject {
            code,
            participant_id,
        } => {
            handlers::handle_join_reject(state, conn_id, &code, &participant_id).await;
        }
        ClientMessage::JoinRoom {
            code,
            participant_id,
            name,
        } => {
            handlers::handle_join_room(state, conn_id, &code, &participant_id, &name).await;
        }
        ClientMessage::LeaveRoom { code } => {
            handlers::handle_leave_room(state, conn_id, &code).await;
        }
        ClientMessage::RegisterParticipant { participant_id } => {
            handlers::handle_register_participant(state, conn_id, &participant_id).await;
        }

        // WebRTC Signaling
        ClientMessage::ReadyForConnection {} => {
            handlers::handle_ready_for_connection(state, conn_id).await;
        }
        ClientMessage::Offer { offer, to } => {
            handlers::handle_offer(state, conn_id, offer, to).await;
        }
        ClientMessage::Answer { answer, to } => {
            handlers::handle_answer(state, conn_id, answer, to).await;
        }
        ClientMessage::IceCandidate { candidate, to } => {
            handlers::handle_ice_candidate(state, conn_id, candidate, to).await;
        }

        // Content & Playback Broadcast
        ClientMessage::TorrentMagnet {
            magnet_uri,
            stream_path,
            name,
        } => {
            handlers::handle_torrent_magnet(state, conn_id, magnet_uri, stream_path, name).await;
        }
        ClientMessage::MovieLoaded { name, duration } => {
            handlers::handle_movie_loaded(state, conn_id, name, duration).await;
        }
        ClientMessage::SyncPlay { time, action_id } => {
            handlers::handle_sync_play(state, conn_id, time, action_id).await;
        }
        ClientMessage::SyncPause { time, action_id } => {
            handlers::handle_sync_pause(state, conn_id, time, action_id).await;
        }
        ClientMessage::SyncSeek { time, action_id } => {
            handlers::handle_sync_seek(state, conn_id, time, action_id).await;
        }
        ClientMessage::ChatMessage { text } => {
            handlers::handle_chat_message(state, conn_id, text).await;
        }

        // Playback Sync Protocol
        ClientMessage::SyncCheck { code } => {
            handlers::handle_sync_check(state, conn_id, &code).await;
        }
        ClientMessage::SyncReport {
            code,
            participant_id,
            time,
            playing,
            buffered,
        } => {
            handlers::handle_sync_report(
                state,
                ctx.sync.clone(),
                conn_id,
                &code,
                participant_id,
                time,
                playing,
                buffered,
            )
            .await;
        }
        ClientMessage::SyncCorrect {
            participant_id,
            time,
            playing,
        } => {
            handlers::handle_sync_correct(state, conn_id, &participant_id, time, playing).await;
        }

        // Ready/Start Gating
        ClientMessage::ReadyToStart { code } => {
            handlers::handle_ready_to_start(state, conn_id, &code).await;
        }
        ClientMessage::StartPlayback { code } => {
            handlers::handle_start_playback(state, conn_id, &code).await;
        }
    }
}
