//! 방 생명주기 및 입장 승인 핸들러

use crate::protocol::ServerMessage;
use crate::state::{AppState, SessionError};
use rand::Rng;
use std::sync::Arc;
use std::time::Instant;

const CODE_CHARS: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZ0123456789";
const CODE_LEN: usize = 6;

/// 공유 가능한 방 코드 생성
///
/// 충돌 검사는 하지 않는다 (36^6 공간에서 수용 가능한 위험).
pub fn generate_room_code() -> String {
    let mut rng = rand::thread_rng();
    (0..CODE_LEN)
        .map(|_| CODE_CHARS[rng.gen_range(0..CODE_CHARS.len())] as char)
        .collect()
}

/// create-room 처리
pub async fn handle_create_room(
    state: Arc<AppState>,
    conn_id: &str,
    participant_id: Option<String>,
    name: String,
    requested_code: Option<String>,
) {
    let code = requested_code
        .filter(|c| !c.is_empty())
        .unwrap_or_else(generate_room_code);

    state.rooms.create(&code, conn_id);
    state.join_group(&code, conn_id).await;

    if let Some(session) = state.session(conn_id) {
        *session.name.write().await = Some(name.clone());
        *session.role.write().await = Some("host".to_string());
        if let Some(pid) = participant_id {
            *session.participant_id.write().await = Some(pid);
        }
    }

    let tunnel = state.tunnel_url.read().await.clone();
    state.send_to_conn(
        conn_id,
        ServerMessage::RoomCreated {
            success: true,
            code: code.clone(),
            role: "host".to_string(),
            tunnel,
        },
    );

    tracing::info!(code = %code, conn_id = %conn_id, host = %name, "Room created");
}

/// join-request 처리
///
/// 멤버십 변경이 아니라 요청이다. pending에 올리고 호스트에게 알린다.
pub async fn handle_join_request(
    state: Arc<AppState>,
    conn_id: &str,
    code: &str,
    participant_id: &str,
    name: &str,
) {
    let Some(room) = state.rooms.get(code) else {
        state.send_to_conn(
            conn_id,
            ServerMessage::JoinRequestResult {
                success: false,
                status: None,
                participant_id: None,
                error: Some(SessionError::RoomNotFound.to_string()),
            },
        );
        return;
    };

    let already_approved = {
        let mut inner = room.inner.write().await;
        if inner.approved.contains(participant_id) {
            true
        } else {
            // 재전송은 멱등: 최신 이름으로 갱신될 뿐 항목은 하나
            inner
                .pending
                .insert(participant_id.to_string(), name.to_string());
            false
        }
    };

    if already_approved {
        state.send_to_conn(
            conn_id,
            ServerMessage::JoinRequestResult {
                success: true,
                status: Some("approved".to_string()),
                participant_id: Some(participant_id.to_string()),
                error: None,
            },
        );
        return;
    }

    state.send_to_conn(
        conn_id,
        ServerMessage::JoinRequestResult {
            success: true,
            status: Some("pending".to_string()),
            participant_id: Some(participant_id.to_string()),
            error: None,
        },
    );

    state.emit_to_group(
        &room.host,
        &ServerMessage::JoinRequest {
            participant_id: participant_id.to_string(),
            name: name.to_string(),
            code: code.to_string(),
        },
    );

    tracing::info!(
        code = %code,
        participant_id = %participant_id,
        name = %name,
        "Join request forwarded to host"
    );
}

/// join-approve 처리
///
/// 관례상 호스트만 호출하지만 암호학적으로 강제하지는 않는다.
pub async fn handle_join_approve(
    state: Arc<AppState>,
    conn_id: &str,
    code: &str,
    participant_id: &str,
) {
    let Some(room) = state.rooms.get(code) else {
        state.send_to_conn(
            conn_id,
            ServerMessage::JoinApproveResult {
                success: false,
                participant_id: None,
                error: Some(SessionError::RoomNotFound.to_string()),
            },
        );
        return;
    };

    let approved_name = {
        let mut inner = room.inner.write().await;
        match inner.pending.remove(participant_id) {
            Some(name) => {
                inner.approved.insert(participant_id.to_string());
                inner
                    .approved_names
                    .insert(participant_id.to_string(), name.clone());
                Some(name)
            }
            None => None,
        }
    };

    state.send_to_conn(
        conn_id,
        ServerMessage::JoinApproveResult {
            success: true,
            participant_id: Some(participant_id.to_string()),
            error: None,
        },
    );

    let Some(name) = approved_name else {
        tracing::warn!(
            code = %code,
            participant_id = %participant_id,
            "Approve for participant not in pending list, no state change"
        );
        return;
    };

    // 승인된 참가자의 개인 채널로 통지
    let reached = state.emit_to_group(
        participant_id,
        &ServerMessage::JoinApproved {
            code: code.to_string(),
        },
    );
    if reached == 0 {
        tracing::warn!(
            code = %code,
            participant_id = %participant_id,
            "Approved participant has no registered personal channel"
        );
    }

    state.emit_to_group(
        code,
        &ServerMessage::ParticipantJoined {
            id: participant_id.to_string(),
            name: name.clone(),
        },
    );

    tracing::info!(
        code = %code,
        participant_id = %participant_id,
        name = %name,
        "Participant approved"
    );
}

/// join-reject 처리
pub async fn handle_join_reject(
    state: Arc<AppState>,
    conn_id: &str,
    code: &str,
    participant_id: &str,
) {
    let Some(room) = state.rooms.get(code) else {
        state.send_to_conn(
            conn_id,
            ServerMessage::JoinRejectResult {
                success: false,
                participant_id: None,
                error: Some(SessionError::RoomNotFound.to_string()),
            },
        );
        return;
    };

    room.inner.write().await.pending.remove(participant_id);

    state.send_to_conn(
        conn_id,
        ServerMessage::JoinRejectResult {
            success: true,
            participant_id: Some(participant_id.to_string()),
            error: None,
        },
    );

    state.emit_to_group(
        participant_id,
        &ServerMessage::JoinRejected {
            code: code.to_string(),
        },
    );

    tracing::info!(code = %code, participant_id = %participant_id, "Participant rejected");
}

/// join-room 처리
///
/// 승인이 선행된 경우에만 성공한다. 승인은 유지되므로 재접속 시
/// join-room만 다시 보내면 된다.
pub async fn handle_join_room(
    state: Arc<AppState>,
    conn_id: &str,
    code: &str,
    participant_id: &str,
    name: &str,
) {
    let Some(room) = state.rooms.get(code) else {
        state.send_to_conn(
            conn_id,
            ServerMessage::RoomJoined {
                success: false,
                code: None,
                role: None,
                error: Some(SessionError::RoomNotFound.to_string()),
                requires_approval: None,
            },
        );
        return;
    };

    let approved_name = {
        let inner = room.inner.read().await;
        if inner.approved.contains(participant_id) {
            Some(
                inner
                    .approved_names
                    .get(participant_id)
                    .cloned()
                    .unwrap_or_else(|| name.to_string()),
            )
        } else {
            None
        }
    };

    let Some(display_name) = approved_name else {
        state.send_to_conn(
            conn_id,
            ServerMessage::RoomJoined {
                success: false,
                code: None,
                role: None,
                error: Some(SessionError::ApprovalRequired.to_string()),
                requires_approval: Some(true),
            },
        );
        return;
    };

    state.join_group(code, conn_id).await;

    if let Some(session) = state.session(conn_id) {
        *session.participant_id.write().await = Some(participant_id.to_string());
        *session.name.write().await = Some(display_name.clone());
        *session.role.write().await = Some("viewer".to_string());
    }

    state.send_to_conn(
        conn_id,
        ServerMessage::RoomJoined {
            success: true,
            code: Some(code.to_string()),
            role: Some("viewer".to_string()),
            error: None,
            requires_approval: None,
        },
    );

    state.emit_to_group(
        code,
        &ServerMessage::ParticipantJoined {
            id: participant_id.to_string(),
            name: display_name.clone(),
        },
    );

    tracing::info!(
        code = %code,
        conn_id = %conn_id,
        participant_id = %participant_id,
        name = %display_name,
        "Participant joined room"
    );
}

/// leave-room 처리
pub async fn handle_leave_room(state: Arc<AppState>, conn_id: &str, code: &str) {
    let left_id = match state.session(conn_id) {
        Some(session) => session
            .participant_id
            .read()
            .await
            .clone()
            .unwrap_or_else(|| conn_id.to_string()),
        None => conn_id.to_string(),
    };

    state.leave_group(code, conn_id).await;
    state.emit_to_group(code, &ServerMessage::ParticipantLeft { id: left_id });

    tracing::info!(code = %code, conn_id = %conn_id, "Participant left room");
}

/// ready-to-start 처리
///
/// 합의가 아닌 단순 장벽: 호스트가 ready 수를 보고 시작 시점을 혼자 결정한다.
pub async fn handle_ready_to_start(state: Arc<AppState>, conn_id: &str, code: &str) {
    let Some(room) = state.rooms.get(code) else {
        state.send_to_conn(
            conn_id,
            ServerMessage::Error {
                message: SessionError::RoomNotFound.to_string(),
            },
        );
        return;
    };

    let ready_count = {
        let mut inner = room.inner.write().await;
        inner.ready_viewers.insert(conn_id.to_string());
        inner.ready_viewers.len()
    };

    state.send_to_conn(conn_id, ServerMessage::ReadyConfirmed { success: true });
    state.emit_to_group(&room.host, &ServerMessage::ReadyCountUpdate { ready_count });

    tracing::info!(code = %code, conn_id = %conn_id, ready_count, "Viewer ready to start");
}

/// start-playback 처리
pub async fn handle_start_playback(state: Arc<AppState>, conn_id: &str, code: &str) {
    let Some(room) = state.rooms.get(code) else {
        state.send_to_conn(
            conn_id,
            ServerMessage::Error {
                message: SessionError::RoomNotFound.to_string(),
            },
        );
        return;
    };

    room.inner.write().await.ready_viewers.clear();

    state.emit_to_group(
        code,
        &ServerMessage::PlaybackStarted {
            host_id: conn_id.to_string(),
        },
    );

    tracing::info!(code = %code, host_id = %conn_id, "Playback started");
}

/// 오래된 방 정리
///
/// 방은 멤버십 변화로는 삭제되지 않고, 이 스위퍼가 수명이 지난 방만 회수한다.
pub async fn cleanup_old_rooms(state: Arc<AppState>) {
    let timeout_ms = state.config.room.timeout_ms;
    let now = Instant::now();
    let mut deleted = 0;

    for code in state.rooms.codes() {
        let Some(room) = state.rooms.get(&code) else {
            continue;
        };
        let age = now.duration_since(room.created_at).as_millis() as u64;
        if age > timeout_ms {
            state.rooms.delete(&code);
            tracing::info!(code = %code, age_ms = age, "Cleaned up old room");
            deleted += 1;
        }
    }

    if deleted > 0 {
        tracing::info!(deleted_rooms = deleted, "Cleanup completed");
    }
}
