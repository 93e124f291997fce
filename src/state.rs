//! 마이그레이션 체크포인트 상태
//!
//! 쓰기(writer) 소비자와 인라인 검증기(inline verifier)가 각자 진행한 위치를 기록하고,
//! 두 소비자 모두가 확실히 처리한 최소 소스 위치를 계산합니다.

use crate::error::Result;
use crate::offset::BinlogPosition;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

/// 영속화 가능한 체크포인트 레코드
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct SerializableState {
    /// 이 상태를 기록한 크레이트 버전
    #[serde(default)]
    pub ferry_version: String,
    /// writer가 타겟에 마지막으로 반영한 소스 위치
    #[serde(default)]
    pub last_written_binlog_position: BinlogPosition,
    /// 인라인 검증기가 마지막으로 기록한 소스 위치
    #[serde(default)]
    pub last_stored_source_binlog_position_for_inline_verifier: BinlogPosition,
    /// 인라인 검증기가 마지막으로 기록한 타겟 위치
    #[serde(default)]
    pub last_stored_target_binlog_position_for_inline_verifier: BinlogPosition,
}

impl SerializableState {
    pub fn new() -> Self {
        SerializableState {
            ferry_version: env!("CARGO_PKG_VERSION").to_string(),
            ..Default::default()
        }
    }

    /// writer와 검증기 중 앞선 소스 위치.
    /// 재개 지점이자 binlog 보존/정리 판단의 안전한 하한입니다.
    pub fn min_source_binlog_position(&self) -> BinlogPosition {
        BinlogPosition::earliest(
            &self.last_written_binlog_position,
            &self.last_stored_source_binlog_position_for_inline_verifier,
        )
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn from_json(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }
}

/// `SerializableState`를 단일 잠금 뒤에 보관하는 추적기.
/// writer 역할과 검증기 역할이 동시에 갱신해도 스냅샷은 항상 일관됩니다.
#[derive(Debug, Default)]
pub struct StateTracker {
    state: RwLock<SerializableState>,
}

impl StateTracker {
    pub fn new() -> Self {
        StateTracker {
            state: RwLock::new(SerializableState::new()),
        }
    }

    /// 영속화된 상태에서 재개
    pub fn from_serialized(state: SerializableState) -> Self {
        StateTracker {
            state: RwLock::new(state),
        }
    }

    pub fn update_last_written_binlog_position(&self, pos: BinlogPosition) {
        let mut state = self.state.write();
        if state.last_written_binlog_position > pos {
            warn!(
                "Last written binlog position moving backwards: {} -> {}",
                state.last_written_binlog_position, pos
            );
        }
        debug!("Updating last written binlog position: {}", pos);
        state.last_written_binlog_position = pos;
    }

    /// 검증기의 소스/타겟 위치는 항상 짝으로 갱신됩니다.
    pub fn update_last_stored_binlog_positions_for_inline_verifier(
        &self,
        source: BinlogPosition,
        target: BinlogPosition,
    ) {
        let mut state = self.state.write();
        debug!(
            "Updating inline verifier binlog positions: source={}, target={}",
            source, target
        );
        state.last_stored_source_binlog_position_for_inline_verifier = source;
        state.last_stored_target_binlog_position_for_inline_verifier = target;
    }

    pub fn last_written_binlog_position(&self) -> BinlogPosition {
        self.state.read().last_written_binlog_position.clone()
    }

    pub fn last_stored_source_binlog_position_for_inline_verifier(&self) -> BinlogPosition {
        self.state
            .read()
            .last_stored_source_binlog_position_for_inline_verifier
            .clone()
    }

    pub fn last_stored_target_binlog_position_for_inline_verifier(&self) -> BinlogPosition {
        self.state
            .read()
            .last_stored_target_binlog_position_for_inline_verifier
            .clone()
    }

    pub fn min_source_binlog_position(&self) -> BinlogPosition {
        self.state.read().min_source_binlog_position()
    }

    /// 체크포인트 영속화용 스냅샷
    pub fn serialize(&self) -> SerializableState {
        self.state.read().clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn state(written: (&str, u64), source: (&str, u64), target: (&str, u64)) -> SerializableState {
        SerializableState {
            last_written_binlog_position: BinlogPosition::new(written.0, written.1),
            last_stored_source_binlog_position_for_inline_verifier: BinlogPosition::new(
                source.0, source.1,
            ),
            last_stored_target_binlog_position_for_inline_verifier: BinlogPosition::new(
                target.0, target.1,
            ),
            ..SerializableState::new()
        }
    }

    #[test]
    fn test_min_binlog_position_same_segment() {
        let s = state(
            ("mysql-bin.00003", 4),
            ("mysql-bin.00003", 10),
            ("mysql-bin.00003", 10),
        );
        assert_eq!(
            s.min_source_binlog_position(),
            BinlogPosition::new("mysql-bin.00003", 4)
        );
        assert_eq!(
            s.last_stored_target_binlog_position_for_inline_verifier,
            BinlogPosition::new("mysql-bin.00003", 10)
        );
    }

    #[test]
    fn test_min_binlog_position_earlier_segment_wins() {
        let s = state(
            ("mysql-bin.00003", 4),
            ("mysql-bin.00002", 10),
            ("mysql-bin.00002", 10),
        );
        assert_eq!(
            s.min_source_binlog_position(),
            BinlogPosition::new("mysql-bin.00002", 10)
        );
    }

    #[test]
    fn test_min_binlog_position_unset_writer() {
        let s = state(("", 0), ("mysql-bin.00002", 10), ("mysql-bin.00002", 10));
        assert_eq!(
            s.min_source_binlog_position(),
            BinlogPosition::new("mysql-bin.00002", 10)
        );
    }

    #[test]
    fn test_min_binlog_position_unset_verifier() {
        let s = state(("mysql-bin.00002", 10), ("", 0), ("mysql-bin.00002", 10));
        assert_eq!(
            s.min_source_binlog_position(),
            BinlogPosition::new("mysql-bin.00002", 10)
        );
    }

    #[test]
    fn test_min_binlog_position_both_unset() {
        assert!(SerializableState::new().min_source_binlog_position().is_unset());
    }

    #[test]
    fn test_tracker_updates_and_snapshot() {
        let tracker = StateTracker::new();
        tracker.update_last_written_binlog_position(BinlogPosition::new("mysql-bin.000004", 120));
        tracker.update_last_stored_binlog_positions_for_inline_verifier(
            BinlogPosition::new("mysql-bin.000004", 90),
            BinlogPosition::new("target-bin.000001", 300),
        );

        assert_eq!(
            tracker.min_source_binlog_position(),
            BinlogPosition::new("mysql-bin.000004", 90)
        );

        let snapshot = tracker.serialize();
        assert_eq!(
            snapshot.last_stored_target_binlog_position_for_inline_verifier,
            BinlogPosition::new("target-bin.000001", 300)
        );
        assert_eq!(snapshot.ferry_version, env!("CARGO_PKG_VERSION"));
    }

    #[test]
    fn test_checkpoint_json_keeps_positions() {
        let s = state(
            ("mysql-bin.000007", 4),
            ("mysql-bin.000006", 1200),
            ("target-bin.000002", 55),
        );
        let json = s.to_json().unwrap();
        assert!(json.contains("LastWrittenBinlogPosition"));
        assert!(json.contains("LastStoredSourceBinlogPositionForInlineVerifier"));

        let restored = StateTracker::from_serialized(SerializableState::from_json(&json).unwrap());
        assert_eq!(restored.serialize(), s);
        assert_eq!(
            restored.min_source_binlog_position(),
            BinlogPosition::new("mysql-bin.000006", 1200)
        );
    }

    #[test]
    fn test_concurrent_roles() {
        let tracker = Arc::new(StateTracker::new());

        let writer = {
            let tracker = tracker.clone();
            std::thread::spawn(move || {
                for i in 1..=100u64 {
                    tracker.update_last_written_binlog_position(BinlogPosition::new(
                        "mysql-bin.000001",
                        i * 10,
                    ));
                }
            })
        };
        let verifier = {
            let tracker = tracker.clone();
            std::thread::spawn(move || {
                for i in 1..=100u64 {
                    tracker.update_last_stored_binlog_positions_for_inline_verifier(
                        BinlogPosition::new("mysql-bin.000001", i * 5),
                        BinlogPosition::new("target-bin.000001", i),
                    );
                }
            })
        };

        writer.join().unwrap();
        verifier.join().unwrap();

        assert_eq!(
            tracker.min_source_binlog_position(),
            BinlogPosition::new("mysql-bin.000001", 500)
        );
    }
}
