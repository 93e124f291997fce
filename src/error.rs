//! 마이그레이션 코어 에러 타입 및 치명적 에러 처리기

use crate::state::StateTracker;
use std::io;
use std::sync::Arc;
use thiserror::Error;
use tracing::error;

#[derive(Error, Debug)]
pub enum FerryError {
    /// 복제 연결을 맺거나 유지할 수 없음 (닫힌 핸들, 핸드셰이크 거부, 네트워크 장애)
    #[error("MySQL 연결 에러: {0}")]
    ConnectionError(String),

    /// 0이 아닌 복제 식별자(server id)를 만들 수 없음
    #[error("Server ID 생성 에러: {0}")]
    IdentityGenerationError(String),

    /// 등록된 리스너가 반환한 에러
    #[error("리스너 에러: {0}")]
    ListenerError(String),

    /// 원시 이벤트를 DML 이벤트로 변환할 수 없음
    #[error("Binlog 디코딩 에러: {0}")]
    DecodeError(String),

    #[error("쿼리 실행 에러: {0}")]
    QueryError(String),

    #[error("I/O 에러: {0}")]
    IoError(String),

    #[error("프로토콜 에러: {0}")]
    ProtocolError(String),

    #[error("설정 에러: {0}")]
    ConfigError(String),

    #[error("직렬화 에러: {0}")]
    SerializationError(#[from] serde_json::Error),

    #[error("스트리머가 연결되지 않았습니다 (현재 상태: {0})")]
    NotConnected(String),
}

impl FerryError {
    /// 리스너에서 사용할 에러 생성 헬퍼
    pub fn listener(msg: impl Into<String>) -> Self {
        FerryError::ListenerError(msg.into())
    }

    /// 디코딩 단계에서 발생한 I/O(길이 부족) 에러를 DecodeError로 변환
    pub(crate) fn into_decode_error(self) -> Self {
        match self {
            FerryError::IoError(msg) => FerryError::DecodeError(format!("truncated event: {}", msg)),
            other => other,
        }
    }
}

impl From<io::Error> for FerryError {
    fn from(err: io::Error) -> Self {
        FerryError::IoError(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, FerryError>;

/// 실행 루프나 리스너에서 올라온 치명적 에러를 받는 협력자.
/// 프로세스를 중단할지 여부는 구현체가 결정합니다.
pub trait ErrorHandler: Send + Sync {
    fn fatal(&self, from: &str, err: &FerryError);
}

/// 에러를 로그로 남기는 기본 처리기.
/// StateTracker가 주어지면 재시작에 필요한 체크포인트 JSON도 함께 남깁니다.
#[derive(Default)]
pub struct LoggingErrorHandler {
    state_tracker: Option<Arc<StateTracker>>,
}

impl LoggingErrorHandler {
    pub fn new() -> Self {
        LoggingErrorHandler::default()
    }

    pub fn with_state(state_tracker: Arc<StateTracker>) -> Self {
        LoggingErrorHandler {
            state_tracker: Some(state_tracker),
        }
    }
}

impl ErrorHandler for LoggingErrorHandler {
    fn fatal(&self, from: &str, err: &FerryError) {
        error!("Fatal error from {}: {}", from, err);

        if let Some(ref tracker) = self.state_tracker {
            match tracker.serialize().to_json() {
                Ok(json) => error!("Resume from checkpoint: {}", json),
                Err(e) => error!("Failed to dump checkpoint state: {}", e),
            }
        }
    }
}
