//! WebRTC 시그널링 및 방 브로드캐스트 핸들러
//!
//! 상태를 갖지 않는 순수 라우팅. 고정된 피어 토폴로지를 가정하지 않고
//! 항상 현재 그룹 멤버십 기준으로 중계한다.

use crate::protocol::ServerMessage;
use crate::state::{AppState, PlaybackState};
use crate::sync::now_millis;
use std::sync::Arc;
use std::time::Instant;
use uuid::Uuid;

/// 발신자의 개인 그룹(연결 ID, 등록된 참가자 ID)을 제외한 그룹 목록
async fn broadcast_groups(state: &AppState, conn_id: &str) -> Vec<String> {
    let participant_id = match state.session(conn_id) {
        Some(session) => session.participant_id.read().await.clone(),
        None => None,
    };

    state
        .groups_of(conn_id)
        .await
        .into_iter()
        .filter(|g| g != conn_id && Some(g.as_str()) != participant_id.as_deref())
        .collect()
}

/// 발신자가 속한 모든 방 그룹에 브로드캐스트 (에코 방지용 개인 그룹 제외)
async fn broadcast_from(state: &AppState, conn_id: &str, message: ServerMessage) {
    let groups = broadcast_groups(state, conn_id).await;
    if groups.is_empty() {
        tracing::debug!(conn_id = %conn_id, "Broadcast from connection with no room groups");
        return;
    }
    for group in &groups {
        state.emit_to_group(group, &message);
    }
}

/// ready-for-connection 처리
///
/// 기존 멤버가 신규 참가자 쪽으로 연결을 시작하는 관례를 만든다.
pub async fn handle_ready_for_connection(state: Arc<AppState>, conn_id: &str) {
    let message = ServerMessage::StartWebrtc {
        peer_id: conn_id.to_string(),
        initiator: true,
    };

    for group in broadcast_groups(&state, conn_id).await {
        state.emit_to_group_except(&group, conn_id, &message);
        tracing::info!(
            group = %group,
            conn_id = %conn_id,
            "Notified group that peer is ready for connection"
        );
    }
}

/// offer 처리
pub async fn handle_offer(
    state: Arc<AppState>,
    conn_id: &str,
    offer: serde_json::Value,
    to: Option<String>,
) {
    let Some(target) = to.filter(|t| !t.is_empty()) else {
        tracing::warn!(from = %conn_id, "Offer missing 'to' field, dropped");
        return;
    };

    let delivered = state.emit_to_group(
        &target,
        &ServerMessage::Offer {
            from: conn_id.to_string(),
            offer,
        },
    );

    if delivered == 0 {
        tracing::warn!(from = %conn_id, to = %target, "Offer target not found");
    } else {
        tracing::debug!(from = %conn_id, to = %target, "Relayed offer");
    }
}

/// answer 처리
pub async fn handle_answer(
    state: Arc<AppState>,
    conn_id: &str,
    answer: serde_json::Value,
    to: Option<String>,
) {
    let Some(target) = to.filter(|t| !t.is_empty()) else {
        tracing::warn!(from = %conn_id, "Answer missing 'to' field, dropped");
        return;
    };

    let delivered = state.emit_to_group(
        &target,
        &ServerMessage::Answer {
            from: conn_id.to_string(),
            answer,
        },
    );

    if delivered == 0 {
        tracing::warn!(from = %conn_id, to = %target, "Answer target not found");
    } else {
        tracing::debug!(from = %conn_id, to = %target, "Relayed answer");
    }
}

/// ICE candidate 처리
pub async fn handle_ice_candidate(
    state: Arc<AppState>,
    conn_id: &str,
    candidate: serde_json::Value,
    to: Option<String>,
) {
    let Some(target) = to.filter(|t| !t.is_empty()) else {
        tracing::warn!(from = %conn_id, "ICE candidate missing 'to' field, dropped");
        return;
    };

    let delivered = state.emit_to_group(
        &target,
        &ServerMessage::IceCandidate {
            from: conn_id.to_string(),
            candidate,
        },
    );

    // candidate는 양이 많아 성공 경로는 로그하지 않는다
    if delivered == 0 {
        tracing::warn!(from = %conn_id, to = %target, "ICE candidate target not found");
    }
}

/// torrent-magnet 처리
pub async fn handle_torrent_magnet(
    state: Arc<AppState>,
    conn_id: &str,
    magnet_uri: String,
    stream_path: Option<String>,
    name: Option<String>,
) {
    tracing::info!(conn_id = %conn_id, name = ?name, "Torrent magnet shared");
    broadcast_from(
        &state,
        conn_id,
        ServerMessage::TorrentMagnet {
            magnet_uri,
            stream_path,
            name,
        },
    )
    .await;
}

/// movie-loaded 처리
pub async fn handle_movie_loaded(
    state: Arc<AppState>,
    conn_id: &str,
    name: Option<String>,
    duration: Option<f64>,
) {
    broadcast_from(&state, conn_id, ServerMessage::MovieLoaded { name, duration }).await;
}

/// sync-play 처리
pub async fn handle_sync_play(
    state: Arc<AppState>,
    conn_id: &str,
    time: f64,
    action_id: Option<String>,
) {
    broadcast_from(&state, conn_id, ServerMessage::SyncPlay { time, action_id }).await;
    record_host_playback(&state, conn_id, time, Some(true)).await;
}

/// sync-pause 처리
pub async fn handle_sync_pause(
    state: Arc<AppState>,
    conn_id: &str,
    time: f64,
    action_id: Option<String>,
) {
    broadcast_from(&state, conn_id, ServerMessage::SyncPause { time, action_id }).await;
    record_host_playback(&state, conn_id, time, Some(false)).await;
}

/// sync-seek 처리
pub async fn handle_sync_seek(
    state: Arc<AppState>,
    conn_id: &str,
    time: f64,
    action_id: Option<String>,
) {
    broadcast_from(&state, conn_id, ServerMessage::SyncSeek { time, action_id }).await;
    // seek은 재생/일시정지 상태를 바꾸지 않는다
    record_host_playback(&state, conn_id, time, None).await;
}

/// 발신자가 호스트인 방의 재생 상태 기록 (드리프트 기준용)
async fn record_host_playback(
    state: &AppState,
    conn_id: &str,
    time: f64,
    playing: Option<bool>,
) {
    for code in state.groups_of(conn_id).await {
        let Some(room) = state.rooms.get(&code) else {
            continue;
        };
        if room.host != conn_id {
            continue;
        }
        let mut inner = room.inner.write().await;
        let playing = playing.unwrap_or_else(|| {
            inner.host_playback.map(|p| p.playing).unwrap_or(false)
        });
        inner.host_playback = Some(PlaybackState {
            time,
            playing,
            observed_at: Instant::now(),
        });
    }
}

/// chat-message 처리
///
/// 발신자 프로필로 채팅 봉투를 채워 방에 브로드캐스트한다.
pub async fn handle_chat_message(state: Arc<AppState>, conn_id: &str, text: String) {
    let (sender_id, sender, sender_role) = match state.session(conn_id) {
        Some(session) => (
            session
                .participant_id
                .read()
                .await
                .clone()
                .unwrap_or_else(|| conn_id.to_string()),
            session
                .name
                .read()
                .await
                .clone()
                .unwrap_or_else(|| conn_id.to_string()),
            session
                .role
                .read()
                .await
                .clone()
                .unwrap_or_else(|| "viewer".to_string()),
        ),
        None => (
            conn_id.to_string(),
            conn_id.to_string(),
            "viewer".to_string(),
        ),
    };

    broadcast_from(
        &state,
        conn_id,
        ServerMessage::ChatMessage {
            id: Uuid::new_v4().to_string(),
            sender_id,
            sender,
            sender_role,
            text,
            timestamp: now_millis(),
        },
    )
    .await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handlers::connection::handle_register_participant;
    use crate::state::testing::{attach_peer, drain, test_state};
    use serde_json::json;

    #[tokio::test]
    async fn offer_reaches_exactly_the_target_personal_channel() {
        let state = test_state();
        let mut a_rx = attach_peer(&state, "conn-a").await;
        let mut b_rx = attach_peer(&state, "conn-b").await;
        let mut c_rx = attach_peer(&state, "conn-c").await;
        drain(&mut a_rx);
        drain(&mut b_rx);
        drain(&mut c_rx);

        handle_offer(
            state.clone(),
            "conn-b",
            json!({"sdp": "v=0...", "type": "offer"}),
            Some("conn-a".to_string()),
        )
        .await;

        let a_msgs = drain(&mut a_rx);
        assert_eq!(a_msgs.len(), 1);
        assert!(matches!(
            &a_msgs[0],
            ServerMessage::Offer { from, offer }
                if from == "conn-b" && offer["type"] == "offer"
        ));
        assert!(drain(&mut b_rx).is_empty());
        assert!(drain(&mut c_rx).is_empty());
    }

    #[tokio::test]
    async fn signaling_without_target_is_dropped() {
        let state = test_state();
        let mut a_rx = attach_peer(&state, "conn-a").await;
        let mut b_rx = attach_peer(&state, "conn-b").await;
        drain(&mut a_rx);
        drain(&mut b_rx);

        handle_offer(state.clone(), "conn-a", json!({}), None).await;
        handle_answer(state.clone(), "conn-a", json!({}), Some(String::new())).await;

        assert!(drain(&mut a_rx).is_empty());
        assert!(drain(&mut b_rx).is_empty());
    }

    #[tokio::test]
    async fn ready_for_connection_tells_other_room_members_to_initiate() {
        let state = test_state();
        let mut a_rx = attach_peer(&state, "conn-a").await;
        let mut b_rx = attach_peer(&state, "conn-b").await;
        drain(&mut a_rx);
        drain(&mut b_rx);

        state.rooms.create("AB12CD", "conn-b");
        state.join_group("AB12CD", "conn-a").await;
        state.join_group("AB12CD", "conn-b").await;

        handle_ready_for_connection(state.clone(), "conn-a").await;

        let b_msgs = drain(&mut b_rx);
        assert!(matches!(
            b_msgs.first(),
            Some(ServerMessage::StartWebrtc { peer_id, initiator: true })
                if peer_id == "conn-a"
        ));
        assert!(drain(&mut a_rx).is_empty());
    }

    #[tokio::test]
    async fn broadcast_skips_sender_personal_groups_but_not_room_groups() {
        let state = test_state();
        let mut a_rx = attach_peer(&state, "conn-a").await;
        let mut b_rx = attach_peer(&state, "conn-b").await;
        drain(&mut a_rx);
        drain(&mut b_rx);

        handle_register_participant(state.clone(), "conn-a", "p-a").await;
        state.rooms.create("AB12CD", "conn-b");
        state.join_group("AB12CD", "conn-a").await;
        state.join_group("AB12CD", "conn-b").await;

        handle_chat_message(state.clone(), "conn-a", "hello".to_string()).await;

        // 개인 그룹으로의 에코는 없고, 방 그룹을 통해 한 번씩만 도착한다
        let a_msgs = drain(&mut a_rx);
        assert_eq!(a_msgs.len(), 1);
        let b_msgs = drain(&mut b_rx);
        assert_eq!(b_msgs.len(), 1);
        assert!(matches!(
            &b_msgs[0],
            ServerMessage::ChatMessage { sender_id, sender, text, .. }
                if sender_id == "p-a" && sender == "conn-a" && text == "hello"
        ));
    }

    #[tokio::test]
    async fn host_sync_traffic_updates_host_playback_state() {
        let state = test_state();
        let mut host_rx = attach_peer(&state, "host-conn").await;
        let mut viewer_rx = attach_peer(&state, "viewer-conn").await;
        drain(&mut host_rx);
        drain(&mut viewer_rx);

        state.rooms.create("AB12CD", "host-conn");
        state.join_group("AB12CD", "host-conn").await;
        state.join_group("AB12CD", "viewer-conn").await;

        handle_sync_play(state.clone(), "host-conn", 30.0, Some("a1".to_string())).await;

        let room = state.rooms.get("AB12CD").unwrap();
        {
            let inner = room.inner.read().await;
            let hp = inner.host_playback.expect("host playback recorded");
            assert_eq!(hp.time, 30.0);
            assert!(hp.playing);
        }

        handle_sync_pause(state.clone(), "host-conn", 42.0, None).await;
        {
            let inner = room.inner.read().await;
            let hp = inner.host_playback.unwrap();
            assert_eq!(hp.time, 42.0);
            assert!(!hp.playing);
        }

        // seek은 일시정지 상태를 유지한다
        handle_sync_seek(state.clone(), "host-conn", 100.0, None).await;
        {
            let inner = room.inner.read().await;
            let hp = inner.host_playback.unwrap();
            assert_eq!(hp.time, 100.0);
            assert!(!hp.playing);
        }

        // 뷰어의 sync 트래픽은 호스트 상태를 건드리지 않는다
        handle_sync_play(state.clone(), "viewer-conn", 7.0, None).await;
        {
            let inner = room.inner.read().await;
            assert_eq!(inner.host_playback.unwrap().time, 100.0);
        }
    }
}
