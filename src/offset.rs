//! Binlog 복제 위치 추적
//!
//! Binlog 파일명 + 바이트 위치로 재시작 지점을 표현합니다.
//! 예: "mysql-bin.000003" 파일의 4097 바이트 위치

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

/// binlog 파일은 4 바이트 매직 넘버 뒤에서 시작한다
pub const BINLOG_START_POSITION: u64 = 4;

/// Binlog 파일 위치 정보
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
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

    /// 파일명에서 시퀀스 번호 추출
    pub fn file_sequence(&self) -> Option<u64> {
        self.filename
            .rsplit('.')
            .next()
            .and_then(|s| s.parse().ok())
    }

    /// 다른 파일로 넘어갔는지 여부
    pub fn is_rotated_from(&self, previous: &BinlogPosition) -> bool {
        self.filename != previous.filename
    }
}

impl fmt::Display for BinlogPosition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.filename, self.position)
    }
}

/// Watchman 별 현재 위치. 회전 모니터와 이벤트 필터(position sync 콜백)가 공유한다.
#[derive(Debug, Clone)]
pub struct PositionTracker {
    inner: Arc<Mutex<BinlogPosition>>,
}

impl PositionTracker {
    pub fn new(position: BinlogPosition) -> Self {
        PositionTracker {
            inner: Arc::new(Mutex::new(position)),
        }
    }

    pub fn get(&self) -> BinlogPosition {
        self.inner.lock().clone()
    }

    pub fn set(&self, position: BinlogPosition) {
        *self.inner.lock() = position;
    }

    /// 현재 위치와 다르면 갱신하고 true 반환
    pub fn update_if_changed(&self, live: &BinlogPosition) -> bool {
        let mut current = self.inner.lock();
        if *current == *live {
            return false;
        }
        *current = live.clone();
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_binlog_position_parse() {
        let pos = BinlogPosition::new("mysql-bin.000123", 4096);
        assert_eq!(pos.file_sequence(), Some(123));
        assert_eq!(pos.to_string(), "mysql-bin.000123:4096");
    }

    #[test]
    fn test_rotation_detected_by_filename() {
        let before = BinlogPosition::new("mysql-bin.000001", 900);
        let same_file = BinlogPosition::new("mysql-bin.000001", 1200);
        let next_file = BinlogPosition::new("mysql-bin.000002", BINLOG_START_POSITION);
        assert!(!same_file.is_rotated_from(&before));
        assert!(next_file.is_rotated_from(&before));
    }

    #[test]
    fn test_tracker_update_if_changed() {
        let tracker = PositionTracker::new(BinlogPosition::new("mysql-bin.000001", 4));
        let shared = tracker.clone();
        assert!(!tracker.update_if_changed(&BinlogPosition::new("mysql-bin.000001", 4)));
        assert!(tracker.update_if_changed(&BinlogPosition::new("mysql-bin.000001", 120)));
        assert_eq!(shared.get().position, 120);
    }
}
