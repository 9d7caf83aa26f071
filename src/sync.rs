//! 재생 동기화 코디네이터
//!
//! 고정 주기 샘플링 방식: 락스텝 제어 대신 하트비트마다 뷰어 보고를
//! 모아 합의 상태를 계산하고, 기준에서 벗어난 낙오자에게만 보정을 보낸다.

use crate::protocol::ServerMessage;
use crate::state::AppState;
use dashmap::DashMap;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// 현재 시각 (Unix 밀리초)
pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// 한 하트비트 윈도우에 수집된 뷰어 보고
#[derive(Debug, Clone)]
pub struct PlaybackReport {
    pub participant_id: String,
    pub time: f64,
    pub playing: bool,
}

/// 윈도우 합의 상태
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ConsensusState {
    pub time: f64,
    pub playing: bool,
}

/// 합의 계산: 평균 재생 시각, 엄격한 과반수 재생 여부
pub fn calculate_consensus(reports: &[PlaybackReport]) -> Option<ConsensusState> {
    if reports.is_empty() {
        return None;
    }

    let total: f64 = reports.iter().map(|r| r.time).sum();
    let playing_count = reports.iter().filter(|r| r.playing).count();

    Some(ConsensusState {
        time: total / reports.len() as f64,
        playing: playing_count > reports.len() / 2,
    })
}

/// 방별 보고 버퍼를 들고 주기적으로 드리프트를 검사하는 코디네이터
///
/// 프로세스당 하나의 태스크로 돌며 모든 활성 방을 순회한다.
pub struct SyncCoordinator {
    state: Arc<AppState>,
    reports: DashMap<String, Vec<PlaybackReport>>,
    check_interval: Duration,
    drift_threshold: f64,
}

impl SyncCoordinator {
    pub fn new(state: Arc<AppState>) -> Self {
        let check_interval = Duration::from_secs(state.config.sync.check_interval_secs);
        let drift_threshold = state.config.sync.drift_threshold_secs;
        Self {
            state,
            reports: DashMap::new(),
            check_interval,
            drift_threshold,
        }
    }

    /// 뷰어 보고 적재. 다음 틱에서 처리된다.
    pub fn add_report(&self, code: &str, report: PlaybackReport) {
        self.reports
            .entry(code.to_string())
            .or_default()
            .push(report);
    }

    /// 주기 루프
    pub async fn run(self: Arc<Self>) {
        let mut interval = tokio::time::interval(self.check_interval);
        // 기동 직후의 즉시 틱은 건너뛴다
        interval.tick().await;
        loop {
            interval.tick().await;
            self.tick().await;
        }
    }

    /// 한 윈도우 처리
    ///
    /// 직전 윈도우의 보고를 비우면서 집계하고, 각 방 그룹에 새 하트비트를
    /// 브로드캐스트한다. 읽지 않은 보고가 다음 윈도우로 넘어가는 일은 없다.
    pub async fn tick(&self) {
        // 스위퍼가 회수한 방의 버퍼 정리
        self.reports.retain(|code, _| self.state.rooms.contains(code));

        for code in self.state.rooms.codes() {
            let window = self
                .reports
                .remove(&code)
                .map(|(_, reports)| reports)
                .unwrap_or_default();

            if !window.is_empty() {
                self.process_window(&code, &window).await;
            }

            self.state.emit_to_group(
                &code,
                &ServerMessage::SyncCheck {
                    timestamp: now_millis(),
                },
            );
        }
    }

    async fn process_window(&self, code: &str, window: &[PlaybackReport]) {
        let Some(consensus) = calculate_consensus(window) else {
            return;
        };

        // 기준: 호스트의 최근 재생 상태가 있으면 호스트, 없으면 합의
        let (ref_time, ref_playing) = match self.state.rooms.get(code) {
            Some(room) => {
                let inner = room.inner.read().await;
                match inner.host_playback {
                    Some(hp) => (hp.projected_time(), hp.playing),
                    None => (consensus.time, consensus.playing),
                }
            }
            None => return,
        };

        let mut corrected: HashSet<&str> = HashSet::new();
        for report in window {
            if corrected.contains(report.participant_id.as_str()) {
                continue;
            }
            let drift = (report.time - ref_time).abs();
            if drift <= self.drift_threshold {
                continue;
            }
            corrected.insert(report.participant_id.as_str());

            // 낙오자 한 명의 개인 채널로만 보낸다. 브로드캐스트 금지.
            self.state.emit_to_group(
                &report.participant_id,
                &ServerMessage::SyncCorrect {
                    playback_time: ref_time,
                    playing: ref_playing,
                    action_id: now_millis(),
                },
            );

            tracing::info!(
                code = %code,
                participant_id = %report.participant_id,
                drift = drift,
                "Sync correction sent"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::testing::{attach_peer, drain, test_state};
    use crate::state::PlaybackState;
    use std::time::Instant;

    fn report(pid: &str, time: f64, playing: bool) -> PlaybackReport {
        PlaybackReport {
            participant_id: pid.to_string(),
            time,
            playing,
        }
    }

    #[test]
    fn consensus_is_mean_time_and_majority_playing() {
        let reports = vec![
            report("p1", 10.0, true),
            report("p2", 12.0, true),
            report("p3", 50.0, false),
        ];
        let consensus = calculate_consensus(&reports).unwrap();
        assert_eq!(consensus.time, 24.0);
        assert!(consensus.playing);
    }

    #[test]
    fn consensus_playing_requires_strict_majority() {
        let reports = vec![report("p1", 5.0, true), report("p2", 5.0, false)];
        let consensus = calculate_consensus(&reports).unwrap();
        assert!(!consensus.playing);
    }

    #[test]
    fn empty_window_has_no_consensus() {
        assert!(calculate_consensus(&[]).is_none());
    }

    #[tokio::test]
    async fn tick_corrects_only_stragglers_via_personal_channel() {
        let state = test_state();
        let sync = SyncCoordinator::new(state.clone());

        let mut host_rx = attach_peer(&state, "host-conn").await;
        let mut p1_rx = attach_peer(&state, "conn-1").await;
        let mut p2_rx = attach_peer(&state, "conn-2").await;
        drain(&mut host_rx);
        drain(&mut p1_rx);
        drain(&mut p2_rx);

        let room = state.rooms.create("AB12CD", "host-conn");
        state.join_group("AB12CD", "host-conn").await;
        state.join_group("AB12CD", "conn-1").await;
        state.join_group("AB12CD", "conn-2").await;
        state.join_group("p1", "conn-1").await;
        state.join_group("p2", "conn-2").await;

        // 호스트는 100초에서 일시정지 상태
        room.inner.write().await.host_playback = Some(PlaybackState {
            time: 100.0,
            playing: false,
            observed_at: Instant::now(),
        });

        sync.add_report("AB12CD", report("p1", 100.5, false));
        sync.add_report("AB12CD", report("p2", 50.0, true));

        sync.tick().await;

        // 기준 안의 뷰어는 하트비트만 받는다
        let p1_msgs = drain(&mut p1_rx);
        assert!(p1_msgs
            .iter()
            .all(|m| matches!(m, ServerMessage::SyncCheck { .. })));

        // 낙오자는 정확히 한 번 보정을 받는다
        let corrections: Vec<_> = drain(&mut p2_rx)
            .into_iter()
            .filter(|m| matches!(m, ServerMessage::SyncCorrect { .. }))
            .collect();
        assert_eq!(corrections.len(), 1);
        assert!(matches!(
            &corrections[0],
            ServerMessage::SyncCorrect { playback_time, playing: false, .. }
                if *playback_time == 100.0
        ));

        // 호스트로는 보정이 가지 않는다
        let host_msgs = drain(&mut host_rx);
        assert!(host_msgs
            .iter()
            .all(|m| !matches!(m, ServerMessage::SyncCorrect { .. })));
    }

    #[tokio::test]
    async fn consensus_is_reference_when_host_state_is_unknown() {
        let state = test_state();
        let sync = SyncCoordinator::new(state.clone());

        let mut p3_rx = attach_peer(&state, "conn-3").await;
        drain(&mut p3_rx);

        state.rooms.create("AB12CD", "host-conn");
        state.join_group("p3", "conn-3").await;

        sync.add_report("AB12CD", report("p1", 10.0, true));
        sync.add_report("AB12CD", report("p2", 12.0, true));
        sync.add_report("AB12CD", report("p3", 50.0, false));

        sync.tick().await;

        // 합의 시각 24, 재생 중으로 보정된다
        let corrections: Vec<_> = drain(&mut p3_rx)
            .into_iter()
            .filter_map(|m| match m {
                ServerMessage::SyncCorrect {
                    playback_time,
                    playing,
                    ..
                } => Some((playback_time, playing)),
                _ => None,
            })
            .collect();
        assert_eq!(corrections, vec![(24.0, true)]);
    }

    #[tokio::test]
    async fn report_buffers_are_cleared_every_tick() {
        let state = test_state();
        let sync = SyncCoordinator::new(state.clone());

        let mut p1_rx = attach_peer(&state, "conn-1").await;
        drain(&mut p1_rx);

        state.rooms.create("AB12CD", "host-conn");
        state.join_group("p1", "conn-1").await;

        sync.add_report("AB12CD", report("p1", 500.0, true));
        sync.add_report("AB12CD", report("p2", 0.0, true));
        sync.tick().await;
        assert!(drain(&mut p1_rx)
            .iter()
            .any(|m| matches!(m, ServerMessage::SyncCorrect { .. })));

        // 새 보고가 없는 윈도우는 아무 동작도 만들지 않는다
        sync.tick().await;
        assert!(drain(&mut p1_rx)
            .iter()
            .all(|m| !matches!(m, ServerMessage::SyncCorrect { .. })));
    }
}
