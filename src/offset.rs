//! Binlog 처리 위치 (파일명 + 바이트 위치)
//!
//! 예: "mysql-bin.000003" 파일의 4097 바이트 위치
//! 파일명이 비어 있고 위치가 0인 값은 "아직 기록되지 않음"을 뜻하는 미설정 값입니다.

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;
use std::sync::OnceLock;

/// MySQL binlog은 4 바이트 매직 헤더 다음부터 이벤트가 시작됨
pub const BINLOG_START_POSITION: u64 = 4;

fn segment_regex() -> &'static Regex {
    static SEGMENT: OnceLock<Regex> = OnceLock::new();
    SEGMENT.get_or_init(|| Regex::new(r"^(.*)\.(\d+)$").expect("valid segment regex"))
}

/// Binlog 파일 위치 정보
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct BinlogPosition {
    /// 바이너리 로그 파일명 (e.g., "mysql-bin.000001")
    pub filename: String,
    /// 바이트 위치
    pub position: u64,
}

impl BinlogPosition {
    pub fn new(filename: impl Into<String>, position: u64) -> Self {
        BinlogPosition {
            filename: filename.into(),
            position,
        }
    }

    /// 미설정 값
    pub fn unset() -> Self {
        BinlogPosition::default()
    }

    pub fn is_unset(&self) -> bool {
        self.filename.is_empty() && self.position == 0
    }

    /// 파일명 접두사 (e.g., "mysql-bin")
    pub fn file_prefix(&self) -> Option<&str> {
        segment_regex()
            .captures(&self.filename)
            .and_then(|c| c.get(1))
            .map(|m| m.as_str())
    }

    /// 파일명에서 시퀀스 번호 추출
    pub fn file_sequence(&self) -> Option<u64> {
        segment_regex()
            .captures(&self.filename)
            .and_then(|c| c.get(2))
            .and_then(|m| m.as_str().parse().ok())
    }

    /// 같은 파일의 다른 위치
    pub fn with_position(&self, position: u64) -> Self {
        BinlogPosition::new(self.filename.clone(), position)
    }

    fn compare_segments(&self, other: &Self) -> Ordering {
        match (
            self.file_prefix(),
            self.file_sequence(),
            other.file_prefix(),
            other.file_sequence(),
        ) {
            (Some(p1), Some(s1), Some(p2), Some(s2)) if p1 == p2 => s1
                .cmp(&s2)
                .then_with(|| self.filename.cmp(&other.filename)),
            _ => self.filename.cmp(&other.filename),
        }
    }

    /// 두 위치 중 앞선 위치. 미설정 값은 제약이 없는 것으로 간주해 제외됩니다.
    pub fn earliest(a: &BinlogPosition, b: &BinlogPosition) -> BinlogPosition {
        match (a.is_unset(), b.is_unset()) {
            (true, _) => b.clone(),
            (_, true) => a.clone(),
            _ if b < a => b.clone(),
            _ => a.clone(),
        }
    }
}

/// 미설정 값은 실제 위치와 비교할 수 없습니다 (`None`).
impl PartialOrd for BinlogPosition {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        match (self.is_unset(), other.is_unset()) {
            (true, true) => Some(Ordering::Equal),
            (false, false) => Some(
                self.compare_segments(other)
                    .then_with(|| self.position.cmp(&other.position)),
            ),
            _ => None,
        }
    }
}

impl fmt::Display for BinlogPosition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_unset() {
            return write!(f, "<unset>");
        }
        write!(f, "{}:{}", self.filename, self.position)
    }
}
