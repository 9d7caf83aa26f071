//! 재생 동기화 이벤트 핸들러

use crate::protocol::ServerMessage;
use crate::state::{AppState, SessionError};
use crate::sync::{now_millis, PlaybackReport, SyncCoordinator};
use std::sync::Arc;

/// sync-check 처리 (호스트가 즉시 하트비트를 요청하는 경우)
pub async fn handle_sync_check(state: Arc<AppState>, conn_id: &str, code: &str) {
    if !state.rooms.contains(code) {
        state.send_to_conn(
            conn_id,
            ServerMessage::Error {
                message: SessionError::RoomNotFound.to_string(),
            },
        );
        return;
    }

    state.emit_to_group(
        code,
        &ServerMessage::SyncCheck {
            timestamp: now_millis(),
        },
    );
}

/// sync-report 처리
///
/// 보고는 코디네이터 버퍼에 적재되고, 호스트 개인 채널로도 전달된다.
/// 응답 계약이 없는 원격 측정이므로 방이 없으면 조용히 버린다.
pub async fn handle_sync_report(
    state: Arc<AppState>,
    sync: Arc<SyncCoordinator>,
    conn_id: &str,
    code: &str,
    participant_id: Option<String>,
    time: f64,
    playing: bool,
    buffered: Option<f64>,
) {
    let Some(room) = state.rooms.get(code) else {
        tracing::debug!(code = %code, conn_id = %conn_id, "Sync report for unknown room, dropped");
        return;
    };

    let participant_id = match participant_id {
        Some(pid) => pid,
        None => match state.session(conn_id) {
            Some(session) => session
                .participant_id
                .read()
                .await
                .clone()
                .unwrap_or_else(|| conn_id.to_string()),
            None => conn_id.to_string(),
        },
    };

    sync.add_report(
        code,
        PlaybackReport {
            participant_id: participant_id.clone(),
            time,
            playing,
        },
    );

    state.emit_to_group(
        &room.host,
        &ServerMessage::SyncReport {
            participant_id,
            playback_time: time,
            playing,
            buffered,
        },
    );
}

/// sync-correct 처리 (호스트가 직접 특정 참가자를 보정하는 경우)
pub async fn handle_sync_correct(
    state: Arc<AppState>,
    conn_id: &str,
    participant_id: &str,
    time: f64,
    playing: bool,
) {
    let delivered = state.emit_to_group(
        participant_id,
        &ServerMessage::SyncCorrect {
            playback_time: time,
            playing,
            action_id: now_millis(),
        },
    );

    if delivered == 0 {
        tracing::warn!(
            from = %conn_id,
            participant_id = %participant_id,
            "Sync correct target not found"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::testing::{attach_peer, drain, test_state};

    #[tokio::test]
    async fn sync_report_is_buffered_and_forwarded_to_host() {
        let state = test_state();
        let sync = Arc::new(SyncCoordinator::new(state.clone()));

        let mut host_rx = attach_peer(&state, "host-conn").await;
        let mut viewer_rx = attach_peer(&state, "viewer-conn").await;
        drain(&mut host_rx);
        drain(&mut viewer_rx);

        state.rooms.create("AB12CD", "host-conn");
        state.join_group("AB12CD", "host-conn").await;
        state.join_group("AB12CD", "viewer-conn").await;
        state.join_group("p1", "viewer-conn").await;

        handle_sync_report(
            state.clone(),
            sync.clone(),
            "viewer-conn",
            "AB12CD",
            Some("p1".to_string()),
            37.5,
            true,
            Some(42.0),
        )
        .await;

        let host_msgs = drain(&mut host_rx);
        assert!(host_msgs.iter().any(|m| matches!(
            m,
            ServerMessage::SyncReport { participant_id, playback_time, playing: true, buffered }
                if participant_id == "p1" && *playback_time == 37.5 && *buffered == Some(42.0)
        )));

        // 적재된 보고는 다음 틱에서 합의 기준이 된다 (단일 보고이므로 보정 없음)
        sync.tick().await;
        assert!(drain(&mut viewer_rx)
            .iter()
            .all(|m| !matches!(m, ServerMessage::SyncCorrect { .. })));
    }

    #[tokio::test]
    async fn sync_check_broadcasts_heartbeat_to_room() {
        let state = test_state();
        let mut host_rx = attach_peer(&state, "host-conn").await;
        let mut viewer_rx = attach_peer(&state, "viewer-conn").await;
        drain(&mut host_rx);
        drain(&mut viewer_rx);

        state.rooms.create("AB12CD", "host-conn");
        state.join_group("AB12CD", "host-conn").await;
        state.join_group("AB12CD", "viewer-conn").await;

        handle_sync_check(state.clone(), "host-conn", "AB12CD").await;

        assert!(drain(&mut host_rx)
            .iter()
            .any(|m| matches!(m, ServerMessage::SyncCheck { .. })));
        assert!(drain(&mut viewer_rx)
            .iter()
            .any(|m| matches!(m, ServerMessage::SyncCheck { .. })));
    }

    #[tokio::test]
    async fn sync_check_for_unknown_room_reports_not_found() {
        let state = test_state();
        let mut rx = attach_peer(&state, "conn-a").await;
        drain(&mut rx);

        handle_sync_check(state.clone(), "conn-a", "ZZZZZZ").await;

        assert!(drain(&mut rx).iter().any(|m| matches!(
            m,
            ServerMessage::Error { message } if message == "room not found"
        )));
    }

    #[tokio::test]
    async fn manual_sync_correct_reaches_the_participant_only() {
        let state = test_state();
        let mut viewer_rx = attach_peer(&state, "viewer-conn").await;
        let mut other_rx = attach_peer(&state, "other-conn").await;
        drain(&mut viewer_rx);
        drain(&mut other_rx);

        state.join_group("p1", "viewer-conn").await;

        handle_sync_correct(state.clone(), "host-conn", "p1", 77.0, true).await;

        let msgs = drain(&mut viewer_rx);
        assert!(matches!(
            msgs.first(),
            Some(ServerMessage::SyncCorrect { playback_time, playing: true, .. })
                if *playback_time == 77.0
        ));
        assert!(drain(&mut other_rx).is_empty());
    }
}
