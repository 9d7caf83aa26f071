//! 애플리케이션 상태 관리

use crate::config::Config;
use crate::protocol::ServerMessage;
use dashmap::DashMap;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Instant;
use thiserror::Error;
use tokio::sync::{mpsc::UnboundedSender, RwLock};

/// 세션 처리 오류 분류
///
/// 핸들러는 오류를 전파하지 않고 호출자에게 타입화된 응답으로 변환한다.
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("room not found")]
    RoomNotFound,
    #[error("approval required, use join-request")]
    ApprovalRequired,
}

/// 전역 애플리케이션 상태
pub struct AppState {
    /// 방 저장소 (code -> Room)
    pub rooms: RoomStore,
    /// 피어 세션 (connection_id -> PeerSession)
    pub peers: DashMap<String, Arc<PeerSession>>,
    /// 멀티캐스트 그룹 (group name -> connection ids)
    groups: DashMap<String, HashSet<String>>,
    /// 발견된 터널 공개 URL
    pub tunnel_url: RwLock<Option<String>>,
    /// 설정
    pub config: Arc<Config>,
}

impl AppState {
    pub fn new(config: Config) -> Self {
        Self {
            rooms: RoomStore::new(),
            peers: DashMap::new(),
            groups: DashMap::new(),
            tunnel_url: RwLock::new(None),
            config: Arc::new(config),
        }
    }

    pub fn session(&self, conn_id: &str) -> Option<Arc<PeerSession>> {
        self.peers.get(conn_id).map(|s| s.clone())
    }

    /// 그룹 가입
    pub async fn join_group(&self, group: &str, conn_id: &str) {
        {
            let mut members = self.groups.entry(group.to_string()).or_default();
            members.insert(conn_id.to_string());
        }
        if let Some(session) = self.session(conn_id) {
            session.groups.write().await.insert(group.to_string());
        }
    }

    /// 그룹 탈퇴, 빈 그룹은 제거
    pub async fn leave_group(&self, group: &str, conn_id: &str) {
        if let Some(mut members) = self.groups.get_mut(group) {
            members.remove(conn_id);
        }
        self.groups.remove_if(group, |_, members| members.is_empty());
        if let Some(session) = self.session(conn_id) {
            session.groups.write().await.remove(group);
        }
    }

    /// 연결이 속한 모든 그룹에서 탈퇴하고 탈퇴한 그룹 이름을 반환
    pub async fn leave_all_groups(&self, conn_id: &str) -> Vec<String> {
        let joined: Vec<String> = match self.session(conn_id) {
            Some(session) => session.groups.write().await.drain().collect(),
            None => Vec::new(),
        };
        for group in &joined {
            if let Some(mut members) = self.groups.get_mut(group) {
                members.remove(conn_id);
            }
            self.groups.remove_if(group, |_, members| members.is_empty());
        }
        joined
    }

    /// 연결이 현재 속한 그룹 목록
    pub async fn groups_of(&self, conn_id: &str) -> Vec<String> {
        match self.session(conn_id) {
            Some(session) => session.groups.read().await.iter().cloned().collect(),
            None => Vec::new(),
        }
    }

    /// 그룹의 모든 멤버에게 전송, 전달된 수신자 수 반환
    pub fn emit_to_group(&self, group: &str, message: &ServerMessage) -> usize {
        self.emit(group, None, message)
    }

    /// 특정 연결을 제외하고 그룹에 전송
    pub fn emit_to_group_except(
        &self,
        group: &str,
        except_conn_id: &str,
        message: &ServerMessage,
    ) -> usize {
        self.emit(group, Some(except_conn_id), message)
    }

    fn emit(&self, group: &str, except: Option<&str>, message: &ServerMessage) -> usize {
        let Some(members) = self.groups.get(group) else {
            return 0;
        };
        let mut delivered = 0;
        for conn_id in members.iter() {
            if except == Some(conn_id.as_str()) {
                continue;
            }
            if let Some(session) = self.peers.get(conn_id.as_str()) {
                if session.sender.send(message.clone()).is_ok() {
                    delivered += 1;
                }
            }
        }
        delivered
    }

    /// 특정 연결에 직접 전송
    pub fn send_to_conn(&self, conn_id: &str, message: ServerMessage) {
        if let Some(session) = self.peers.get(conn_id) {
            let _ = session.sender.send(message);
        }
    }
}

/// 방 저장소
///
/// 삽입/삭제는 저장소 자체 락, 필드 변경은 각 방의 락으로 분리되어
/// 서로 다른 방끼리는 경합하지 않는다.
pub struct RoomStore {
    rooms: DashMap<String, Arc<Room>>,
}

impl RoomStore {
    pub fn new() -> Self {
        Self {
            rooms: DashMap::new(),
        }
    }

    pub fn create(&self, code: &str, host_conn_id: &str) -> Arc<Room> {
        let room = Arc::new(Room::new(code.to_string(), host_conn_id.to_string()));
        self.rooms.insert(code.to_string(), room.clone());
        room
    }

    pub fn get(&self, code: &str) -> Option<Arc<Room>> {
        self.rooms.get(code).map(|r| r.clone())
    }

    pub fn delete(&self, code: &str) {
        self.rooms.remove(code);
    }

    pub fn contains(&self, code: &str) -> bool {
        self.rooms.contains_key(code)
    }

    pub fn codes(&self) -> Vec<String> {
        self.rooms.iter().map(|r| r.key().clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.rooms.len()
    }
}

/// 방 정보
pub struct Room {
    pub code: String,
    /// 방을 만든 호스트의 연결 ID
    pub host: String,
    pub created_at: Instant,
    pub inner: RwLock<RoomInner>,
}

impl Room {
    pub fn new(code: String, host: String) -> Self {
        Self {
            code,
            host,
            created_at: Instant::now(),
            inner: RwLock::new(RoomInner::default()),
        }
    }
}

/// 방의 가변 상태
///
/// 불변식: participant ID는 pending/approved 중 최대 한 곳에만 존재한다.
/// 호스트 연결 ID는 어느 쪽에도 나타나지 않는다.
#[derive(Default)]
pub struct RoomInner {
    pub approved: HashSet<String>,
    pub approved_names: HashMap<String, String>,
    pub pending: HashMap<String, String>,
    pub ready_viewers: HashSet<String>,
    pub host_playback: Option<PlaybackState>,
}

/// 호스트의 마지막 재생 상태 (드리프트 기준용, 참고 값)
#[derive(Debug, Clone, Copy)]
pub struct PlaybackState {
    pub time: f64,
    pub playing: bool,
    pub observed_at: Instant,
}

impl PlaybackState {
    /// 관측 이후 경과한 실시간을 반영한 예상 재생 위치
    pub fn projected_time(&self) -> f64 {
        if self.playing {
            self.time + self.observed_at.elapsed().as_secs_f64()
        } else {
            self.time
        }
    }
}

/// 피어 세션 정보
pub struct PeerSession {
    #[allow(dead_code)]
    pub id: String,
    pub sender: UnboundedSender<ServerMessage>,
    /// register-participant 또는 join-room으로 알게 된 안정 식별자
    pub participant_id: RwLock<Option<String>>,
    pub name: RwLock<Option<String>>,
    pub role: RwLock<Option<String>>,
    /// 현재 가입한 그룹 (leave-all을 O(그룹 수)로 처리하기 위한 역색인)
    pub groups: RwLock<HashSet<String>>,
    pub connected_at: Instant,
}

impl PeerSession {
    pub fn new(id: String, sender: UnboundedSender<ServerMessage>) -> Self {
        Self {
            id,
            sender,
            participant_id: RwLock::new(None),
            name: RwLock::new(None),
            role: RwLock::new(None),
            groups: RwLock::new(HashSet::new()),
            connected_at: Instant::now(),
        }
    }
}


#[cfg(test)]
mod tests {
    use super::testing::{attach_peer, drain, test_state};
    use super::*;

    #[test]
    fn room_store_create_get_delete() {
        let store = RoomStore::new();
        let room = store.create("AB12CD", "host-conn");
        assert_eq!(room.code, "AB12CD");
        assert_eq!(room.host, "host-conn");

        let found = store.get("AB12CD").expect("room should exist");
        assert_eq!(found.code, "AB12CD");
        assert!(store.get("ZZZZZZ").is_none());

        store.delete("AB12CD");
        assert!(store.get("AB12CD").is_none());
    }

    #[tokio::test]
    async fn group_emit_reaches_current_members_only() {
        let state = test_state();
        let mut a = attach_peer(&state, "conn-a").await;
        let mut b = attach_peer(&state, "conn-b").await;
        let mut c = attach_peer(&state, "conn-c").await;
        drain(&mut a);
        drain(&mut b);
        drain(&mut c);

        state.join_group("ROOM01", "conn-a").await;
        state.join_group("ROOM01", "conn-b").await;

        let delivered = state.emit_to_group(
            "ROOM01",
            &ServerMessage::ParticipantLeft {
                id: "p9".to_string(),
            },
        );
        assert_eq!(delivered, 2);
        assert_eq!(drain(&mut a).len(), 1);
        assert_eq!(drain(&mut b).len(), 1);
        assert!(drain(&mut c).is_empty());
    }

    #[tokio::test]
    async fn group_emit_except_skips_the_sender() {
        let state = test_state();
        let mut a = attach_peer(&state, "conn-a").await;
        let mut b = attach_peer(&state, "conn-b").await;
        drain(&mut a);
        drain(&mut b);

        state.join_group("ROOM01", "conn-a").await;
        state.join_group("ROOM01", "conn-b").await;

        let delivered = state.emit_to_group_except(
            "ROOM01",
            "conn-a",
            &ServerMessage::PlaybackStarted {
                host_id: "conn-a".to_string(),
            },
        );
        assert_eq!(delivered, 1);
        assert!(drain(&mut a).is_empty());
        assert_eq!(drain(&mut b).len(), 1);
    }

    #[tokio::test]
    async fn leave_all_groups_returns_memberships_and_clears_registry() {
        let state = test_state();
        let mut rx = attach_peer(&state, "conn-a").await;
        drain(&mut rx);

        state.join_group("ROOM01", "conn-a").await;
        state.join_group("p1", "conn-a").await;

        let mut left = state.leave_all_groups("conn-a").await;
        left.sort();
        // 연결 시 자동 가입된 자기 연결 ID 그룹 포함
        assert_eq!(left, vec!["ROOM01", "conn-a", "p1"]);

        assert_eq!(
            state.emit_to_group(
                "ROOM01",
                &ServerMessage::ParticipantLeft {
                    id: "p1".to_string()
                }
            ),
            0
        );
        assert!(state.groups_of("conn-a").await.is_empty());
    }

    #[test]
    fn paused_playback_state_does_not_advance() {
        let paused = PlaybackState {
            time: 120.0,
            playing: false,
            observed_at: Instant::now(),
        };
        assert_eq!(paused.projected_time(), 120.0);

        let playing = PlaybackState {
            time: 120.0,
            playing: true,
            observed_at: Instant::now(),
        };
        assert!(playing.projected_time() >= 120.0);
    }
}
