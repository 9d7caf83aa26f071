//! 클라이언트-서버 메시지 프로토콜 정의

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// 클라이언트 → 서버 메시지
///
/// 이벤트 이름은 kebab-case, 필드는 camelCase. 파싱에 실패한 페이로드는
/// 디스패처에서 로그 후 버려진다.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(
    tag = "type",
    content = "payload",
    rename_all = "kebab-case",
    rename_all_fields = "camelCase"
)]
pub enum ClientMessage {
    // Room Lifecycle
    CreateRoom {
        participant_id: Option<String>,
        name: String,
        requested_code: Option<String>,
    },
    JoinRequest {
        code: String,
        participant_id: String,
        name: String,
    },
    JoinApprove {
        code: String,
        participant_id: String,
    },
    JoinReject {
        code: String,
        participant_id: String,
    },
    JoinRoom {
        code: String,
        participant_id: String,
        name: String,
    },
    LeaveRoom {
        code: String,
    },
    RegisterParticipant {
        participant_id: String,
    },

    // WebRTC Signaling
    ReadyForConnection {},
    Offer {
        offer: Value,
        to: Option<String>,
    },
    Answer {
        answer: Value,
        to: Option<String>,
    },
    IceCandidate {
        candidate: Value,
        to: Option<String>,
    },

    // Content & Playback Broadcast
    TorrentMagnet {
        #[serde(rename = "magnetURI")]
        magnet_uri: String,
        stream_path: Option<String>,
        name: Option<String>,
    },
    MovieLoaded {
        name: Option<String>,
        duration: Option<f64>,
    },
    SyncPlay {
        time: f64,
        action_id: Option<String>,
    },
    SyncPause {
        time: f64,
        action_id: Option<String>,
    },
    SyncSeek {
        time: f64,
        action_id: Option<String>,
    },
    ChatMessage {
        text: String,
    },

    // Playback Sync Protocol
    SyncCheck {
        code: String,
    },
    SyncReport {
        code: String,
        participant_id: Option<String>,
        time: f64,
        playing: bool,
        buffered: Option<f64>,
    },
    SyncCorrect {
        participant_id: String,
        time: f64,
        playing: bool,
    },

    // Ready/Start Gating
    ReadyToStart {
        code: String,
    },
    StartPlayback {
        code: String,
    },
}

/// 서버 → 클라이언트 메시지
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(
    tag = "type",
    content = "payload",
    rename_all = "kebab-case",
    rename_all_fields = "camelCase"
)]
pub enum ServerMessage {
    // Connection
    Connected {
        connection_id: String,
    },
    Error {
        message: String,
    },

    // Room Lifecycle Results
    RoomCreated {
        success: bool,
        code: String,
        role: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        tunnel: Option<String>,
    },
    RoomJoined {
        success: bool,
        #[serde(skip_serializing_if = "Option::is_none")]
        code: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        role: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        error: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        requires_approval: Option<bool>,
    },
    JoinRequestResult {
        success: bool,
        #[serde(skip_serializing_if = "Option::is_none")]
        status: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        participant_id: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
    JoinApproveResult {
        success: bool,
        #[serde(skip_serializing_if = "Option::is_none")]
        participant_id: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
    JoinRejectResult {
        success: bool,
        #[serde(skip_serializing_if = "Option::is_none")]
        participant_id: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },

    // Room Events
    JoinRequest {
        participant_id: String,
        name: String,
        code: String,
    },
    JoinApproved {
        code: String,
    },
    JoinRejected {
        code: String,
    },
    ParticipantJoined {
        id: String,
        name: String,
    },
    ParticipantLeft {
        id: String,
    },

    // WebRTC Signaling
    StartWebrtc {
        peer_id: String,
        initiator: bool,
    },
    Offer {
        from: String,
        offer: Value,
    },
    Answer {
        from: String,
        answer: Value,
    },
    IceCandidate {
        from: String,
        candidate: Value,
    },

    // Content & Playback Broadcast
    TorrentMagnet {
        #[serde(rename = "magnetURI")]
        magnet_uri: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        stream_path: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        name: Option<String>,
    },
    MovieLoaded {
        #[serde(skip_serializing_if = "Option::is_none")]
        name: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        duration: Option<f64>,
    },
    SyncPlay {
        time: f64,
        #[serde(skip_serializing_if = "Option::is_none")]
        action_id: Option<String>,
    },
    SyncPause {
        time: f64,
        #[serde(skip_serializing_if = "Option::is_none")]
        action_id: Option<String>,
    },
    SyncSeek {
        time: f64,
        #[serde(skip_serializing_if = "Option::is_none")]
        action_id: Option<String>,
    },
    ChatMessage {
        id: String,
        sender_id: String,
        sender: String,
        sender_role: String,
        text: String,
        timestamp: u64,
    },

    // Playback Sync Protocol
    SyncCheck {
        timestamp: u64,
    },
    SyncReport {
        participant_id: String,
        playback_time: f64,
        playing: bool,
        #[serde(skip_serializing_if = "Option::is_none")]
        buffered: Option<f64>,
    },
    SyncCorrect {
        playback_time: f64,
        playing: bool,
        action_id: u64,
    },

    // Ready/Start Gating
    ReadyConfirmed {
        success: bool,
    },
    ReadyCountUpdate {
        ready_count: usize,
    },
    PlaybackStarted {
        host_id: String,
    },
}

/// ICE 서버 설정 (REST 응답용)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IceServer {
    pub urls: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub credential: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub credential_type: Option<String>,
}

/// TURN 자격증명 REST 응답
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TurnCredentials {
    pub ice_servers: Vec<IceServer>,
    pub ttl: u64,
    pub timestamp: u64,
}
