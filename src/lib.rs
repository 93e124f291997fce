//! MySQL 라이브 마이그레이션용 Binlog 소비 파이프라인
//!
//! 소스 MySQL의 바이너리 로그를 레플리카처럼 읽어 원본 문장 단위의
//! DML 배치로 묶고, 등록된 리스너에게 순서대로 전달합니다.
//! 주요 기능:
//! - 레플리카 등록 및 Binlog 프로토콜 파싱
//! - 문장 경계(STMT_END_F) 기준 배치
//! - 협조적 종료 (`flush_and_stop`)
//! - 재개용 체크포인트 상태 추적

pub mod auth;
pub mod batcher;
pub mod binlog;
pub mod binlog_client;
pub mod connection;
pub mod error;
pub mod events;
pub mod filter;
pub mod listener;
pub mod marginalia;
pub mod offset;
pub mod protocol;
pub mod schema;
pub mod state;
pub mod streamer;

#[cfg(test)]
mod test_utils;

pub use batcher::BatchBoundary;
pub use binlog_client::BinlogClient;
pub use connection::{ConnectionConfig, MySqlConnection};
pub use error::{ErrorHandler, FerryError, LoggingErrorHandler, Result};
pub use events::{CellValue, DmlEvent, DmlEventBatch, DmlEventKind, OperationType};
pub use filter::{DatabaseTableFilter, TableFilter};
pub use listener::EventListener;
pub use offset::BinlogPosition;
pub use schema::{TableSchema, TableSchemaCache};
pub use state::{SerializableState, StateTracker};
pub use streamer::{
    BinlogStreamer, PartialStatementPolicy, StreamerConfig, StreamerHandle, StreamerState,
};
