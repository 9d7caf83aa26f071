//! 연결 핸들러

use crate::protocol::ServerMessage;
use crate::state::{AppState, PeerSession};
use std::sync::Arc;
use uuid::Uuid;

/// 새 연결 처리
///
/// 연결 ID를 발급하고 세션을 등록한 뒤, 자기 연결 ID 그룹에 자동 가입시킨다.
/// 이 그룹이 대상 지정 메시지(offer/answer 등)의 개인 수신함이 된다.
pub async fn handle_connection(
    state: Arc<AppState>,
    sender: tokio::sync::mpsc::UnboundedSender<ServerMessage>,
) -> String {
    let conn_id = Uuid::new_v4().to_string();
    register_session(&state, &conn_id, sender).await;
    tracing::info!(conn_id = %conn_id, "New connection established");
    conn_id
}

/// 세션 등록 (연결 ID는 호출자가 지정)
pub async fn register_session(
    state: &AppState,
    conn_id: &str,
    sender: tokio::sync::mpsc::UnboundedSender<ServerMessage>,
) {
    let session = Arc::new(PeerSession::new(conn_id.to_string(), sender.clone()));
    state.peers.insert(conn_id.to_string(), session);

    state.join_group(conn_id, conn_id).await;

    let _ = sender.send(ServerMessage::Connected {
        connection_id: conn_id.to_string(),
    });
}

/// register-participant 처리
///
/// 안정 참가자 ID 그룹에 가입시켜 재접속 후에도 같은 주소로 메시지를 받게 한다.
pub async fn handle_register_participant(
    state: Arc<AppState>,
    conn_id: &str,
    participant_id: &str,
) {
    if participant_id.is_empty() {
        tracing::warn!(conn_id = %conn_id, "register-participant with empty id, dropped");
        return;
    }

    state.join_group(participant_id, conn_id).await;

    if let Some(session) = state.session(conn_id) {
        *session.participant_id.write().await = Some(participant_id.to_string());
    }

    tracing::info!(
        conn_id = %conn_id,
        participant_id = %participant_id,
        "Participant registered"
    );
}

/// 연결 해제 처리
///
/// 모든 그룹에서 탈퇴시키고, 속해 있던 방 그룹에는 participant-left를 알린다.
pub async fn handle_disconnect(state: Arc<AppState>, conn_id: &str) {
    let participant_id = match state.session(conn_id) {
        Some(session) => session.participant_id.read().await.clone(),
        None => None,
    };
    let left_id = participant_id.unwrap_or_else(|| conn_id.to_string());

    let groups = state.leave_all_groups(conn_id).await;
    for group in &groups {
        if state.rooms.contains(group) {
            state.emit_to_group(
                group,
                &ServerMessage::ParticipantLeft {
                    id: left_id.clone(),
                },
            );
        }
    }

    if let Some((_, session)) = state.peers.remove(conn_id) {
        tracing::info!(
            conn_id = %conn_id,
            connected_secs = session.connected_at.elapsed().as_secs(),
            "Connection closed"
        );
    }
}
