//! 원시 binlog 이벤트와, 그로부터 만든 DML 이벤트/배치 타입

use crate::marginalia;
use crate::offset::BinlogPosition;
use crate::schema::TableSchema;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// MySQL Binlog 이벤트 타입
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum EventType {
    Unknown = 0,
    /// 쿼리 이벤트 (BEGIN, DDL 등)
    QueryEvent = 2,
    /// 서버 종료
    StopEvent = 3,
    /// 다음 파일로 전환
    RotateEvent = 4,
    /// 포맷 설명 이벤트 (binlog 버전, 체크섬 알고리즘)
    FormatDescriptionEvent = 15,
    /// 트랜잭션 커밋
    XidEvent = 16,
    /// 뒤따르는 행 이벤트의 테이블 id와 컬럼 레이아웃
    TableMapEvent = 19,
    WriteRowsEventV1 = 23,
    UpdateRowsEventV1 = 24,
    DeleteRowsEventV1 = 25,
    /// 하트비트
    HeartbeatEvent = 27,
    /// 행 이벤트를 만든 문장 텍스트 (binlog_rows_query_log_events)
    RowsQueryEvent = 29,
    WriteRowsEvent = 30,
    UpdateRowsEvent = 31,
    DeleteRowsEvent = 32,
    GtidEvent = 33,
    AnonymousGtidEvent = 34,
    PreviousGtidsEvent = 35,
    /// JSON 부분 업데이트
    PartialUpdateRowsEvent = 39,
    /// 트랜잭션 페이로드 이벤트 (압축)
    TransactionPayloadEvent = 40,
}

impl EventType {
    pub fn from_u8(val: u8) -> Self {
        match val {
            2 => EventType::QueryEvent,
            3 => EventType::StopEvent,
            4 => EventType::RotateEvent,
            15 => EventType::FormatDescriptionEvent,
            16 => EventType::XidEvent,
            19 => EventType::TableMapEvent,
            23 => EventType::WriteRowsEventV1,
            24 => EventType::UpdateRowsEventV1,
            25 => EventType::DeleteRowsEventV1,
            27 => EventType::HeartbeatEvent,
            29 => EventType::RowsQueryEvent,
            30 => EventType::WriteRowsEvent,
            31 => EventType::UpdateRowsEvent,
            32 => EventType::DeleteRowsEvent,
            33 => EventType::GtidEvent,
            34 => EventType::AnonymousGtidEvent,
            35 => EventType::PreviousGtidsEvent,
            39 => EventType::PartialUpdateRowsEvent,
            40 => EventType::TransactionPayloadEvent,
            _ => EventType::Unknown,
        }
    }

    /// 행 변경 이벤트 여부
    pub fn rows_kind(&self) -> Option<RowsEventKind> {
        match self {
            EventType::WriteRowsEventV1 | EventType::WriteRowsEvent => Some(RowsEventKind::Write),
            EventType::UpdateRowsEventV1 | EventType::UpdateRowsEvent => {
                Some(RowsEventKind::Update)
            }
            EventType::DeleteRowsEventV1 | EventType::DeleteRowsEvent => {
                Some(RowsEventKind::Delete)
            }
            _ => None,
        }
    }

    pub fn is_rows_v2(&self) -> bool {
        matches!(
            self,
            EventType::WriteRowsEvent | EventType::UpdateRowsEvent | EventType::DeleteRowsEvent
        )
    }
}

/// 모든 이벤트 앞의 19바이트 공통 헤더
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventHeader {
    /// 유닉스 초
    pub timestamp: u32,
    pub event_type: EventType,
    pub server_id: u32,
    pub event_length: u32,
    /// 다음 이벤트 위치 (0이면 파일 위치와 무관한 인공 이벤트)
    pub next_pos: u32,
    pub flags: u16,
}

/// MySQL 컬럼 타입 (binlog 테이블 맵 기준)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ColumnType {
    Decimal,
    Tiny,
    Short,
    Long,
    Float,
    Double,
    Null,
    Timestamp,
    LongLong,
    Int24,
    Date,
    Time,
    DateTime,
    Year,
    NewDate,
    Varchar,
    Bit,
    Timestamp2,
    DateTime2,
    Time2,
    Json,
    NewDecimal,
    Enum,
    Set,
    TinyBlob,
    MediumBlob,
    LongBlob,
    Blob,
    VarString,
    String,
    Geometry,
    Unknown(u8),
}

impl ColumnType {
    pub fn from_u8(val: u8) -> Self {
        match val {
            0 => ColumnType::Decimal,
            1 => ColumnType::Tiny,
            2 => ColumnType::Short,
            3 => ColumnType::Long,
            4 => ColumnType::Float,
            5 => ColumnType::Double,
            6 => ColumnType::Null,
            7 => ColumnType::Timestamp,
            8 => ColumnType::LongLong,
            9 => ColumnType::Int24,
            10 => ColumnType::Date,
            11 => ColumnType::Time,
            12 => ColumnType::DateTime,
            13 => ColumnType::Year,
            14 => ColumnType::NewDate,
            15 => ColumnType::Varchar,
            16 => ColumnType::Bit,
            17 => ColumnType::Timestamp2,
            18 => ColumnType::DateTime2,
            19 => ColumnType::Time2,
            245 => ColumnType::Json,
            246 => ColumnType::NewDecimal,
            247 => ColumnType::Enum,
            248 => ColumnType::Set,
            249 => ColumnType::TinyBlob,
            250 => ColumnType::MediumBlob,
            251 => ColumnType::LongBlob,
            252 => ColumnType::Blob,
            253 => ColumnType::VarString,
            254 => ColumnType::String,
            255 => ColumnType::Geometry,
            other => ColumnType::Unknown(other),
        }
    }
}

/// TABLE_MAP 본문
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TableMapData {
    pub table_id: u64,
    pub database: String,
    pub table: String,
    pub column_types: Vec<ColumnType>,
    /// 타입별 메타데이터 (길이, 정밀도, fsp 등)
    pub column_meta: Vec<u16>,
    pub nullable_bitmap: Vec<u8>,
}

/// 행 변경 이벤트 종류
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RowsEventKind {
    Write,
    Update,
    Delete,
}

/// 이 플래그가 있는 행 이벤트가 원본 문장의 마지막 조각
pub const STMT_END_F: u16 = 0x0001;

/// WRITE/UPDATE/DELETE_ROWS 이벤트 데이터.
/// 행 본문은 필터링 이후 스키마와 함께 디코딩되므로 원시 바이트로 보관합니다.
#[derive(Debug, Clone)]
pub struct RowsEventData {
    pub kind: RowsEventKind,
    pub table_id: u64,
    pub flags: u16,
    pub column_count: u64,
    /// 이미지에 포함된 컬럼 (FULL이면 전부 1)
    pub columns_present: Vec<u8>,
    /// 변경 후 이미지의 컬럼 비트맵 (UPDATE 전용)
    pub columns_after: Option<Vec<u8>>,
    /// 인코딩된 행 데이터
    pub rows_data: Bytes,
}

impl RowsEventData {
    /// 원본 문장의 마지막 조각인지 여부
    pub fn is_statement_end(&self) -> bool {
        self.flags & STMT_END_F != 0
    }
}

/// 디코딩된 행 하나 (변경 전/후 이미지)
#[derive(Debug, Clone, PartialEq)]
pub struct RowImage {
    pub before: Option<Vec<CellValue>>,
    pub after: Option<Vec<CellValue>>,
}

/// 디코딩된 컬럼 값. 부호 여부와 텍스트/바이너리 구분은 스키마 캐시를 따릅니다.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum CellValue {
    Null,
    Int8(i8),
    Int16(i16),
    Int32(i32),
    Int64(i64),
    UInt8(u8),
    UInt16(u16),
    UInt32(u32),
    UInt64(u64),
    Float(f32),
    Double(f64),
    String(String),
    Bytes(Vec<u8>),
    DateTime(DateTime<Utc>),
    Date(String),
    Time(String),
    Decimal(String),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GtidEventData {
    /// `uuid:sequence`
    pub gtid: String,
    pub committed: bool,
}

/// QUERY (BEGIN, DDL 등)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueryEventData {
    pub thread_id: u32,
    pub exec_time: u32,
    pub database: String,
    pub query: String,
}

/// ROTATE: 다음 파일명과 그 안의 시작 위치
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RotateEventData {
    pub next_binlog_name: String,
    pub position: u64,
}

/// 포맷 설명 이벤트 데이터
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FormatDescriptionData {
    pub binlog_version: u16,
    pub server_version: String,
    /// 0 = NONE, 1 = CRC32
    pub checksum_alg: u8,
}

/// 파서가 이해하는 이벤트 본문
#[derive(Debug, Clone)]
pub enum BinlogEventData {
    FormatDescription(FormatDescriptionData),
    TableMap(TableMapData),
    Rows(RowsEventData),
    Query(QueryEventData),
    Rotate(RotateEventData),
    Gtid(GtidEventData),
    RowsQuery(String),
    Xid(u64),
    Heartbeat,
    Unknown(Bytes),
}

#[derive(Debug, Clone)]
pub struct BinlogEvent {
    pub header: EventHeader,
    pub data: BinlogEventData,
}

/// 변경 연산 타입
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OperationType {
    Insert,
    Update,
    Delete,
}

impl OperationType {
    pub fn as_str(&self) -> &'static str {
        match self {
            OperationType::Insert => "INSERT",
            OperationType::Update => "UPDATE",
            OperationType::Delete => "DELETE",
        }
    }
}

/// 행 단위 변경 내용
#[derive(Debug, Clone, PartialEq)]
pub enum DmlEventKind {
    Insert {
        new_values: Vec<CellValue>,
    },
    Update {
        old_values: Vec<CellValue>,
        new_values: Vec<CellValue>,
    },
    Delete {
        old_values: Vec<CellValue>,
    },
}

/// 행 하나의 변경 이벤트.
/// 자신이 속한 배치의 문장 텍스트를 공유합니다.
#[derive(Debug, Clone)]
pub struct DmlEvent {
    kind: DmlEventKind,
    table: Arc<TableSchema>,
    position: BinlogPosition,
    query: Option<Arc<str>>,
    gtid: Option<Arc<str>>,
}

impl DmlEvent {
    pub fn new(
        kind: DmlEventKind,
        table: Arc<TableSchema>,
        position: BinlogPosition,
        query: Option<Arc<str>>,
        gtid: Option<Arc<str>>,
    ) -> Self {
        DmlEvent {
            kind,
            table,
            position,
            query,
            gtid,
        }
    }

    pub fn kind(&self) -> &DmlEventKind {
        &self.kind
    }

    pub fn op(&self) -> OperationType {
        match self.kind {
            DmlEventKind::Insert { .. } => OperationType::Insert,
            DmlEventKind::Update { .. } => OperationType::Update,
            DmlEventKind::Delete { .. } => OperationType::Delete,
        }
    }

    pub fn table(&self) -> &Arc<TableSchema> {
        &self.table
    }

    pub fn database(&self) -> &str {
        &self.table.database
    }

    pub fn table_name(&self) -> &str {
        &self.table.name
    }

    /// 이 행을 실어 온 원시 이벤트 다음 위치
    pub fn binlog_position(&self) -> &BinlogPosition {
        &self.position
    }

    /// 원본 문장 (추적 주석 포함)
    pub fn query(&self) -> Option<&str> {
        self.query.as_deref()
    }

    pub fn gtid(&self) -> Option<&str> {
        self.gtid.as_deref()
    }

    pub fn old_values(&self) -> Option<&[CellValue]> {
        match &self.kind {
            DmlEventKind::Update { old_values, .. } | DmlEventKind::Delete { old_values } => {
                Some(old_values)
            }
            DmlEventKind::Insert { .. } => None,
        }
    }

    pub fn new_values(&self) -> Option<&[CellValue]> {
        match &self.kind {
            DmlEventKind::Insert { new_values } | DmlEventKind::Update { new_values, .. } => {
                Some(new_values)
            }
            DmlEventKind::Delete { .. } => None,
        }
    }

    /// 컬럼명으로 값 조회 (변경 후 이미지 우선)
    pub fn column_value(&self, column: &str) -> Option<&CellValue> {
        let idx = self.table.column_index(column)?;
        self.new_values()
            .or_else(|| self.old_values())
            .and_then(|values| values.get(idx))
    }
}

/// 하나의 원본 문장에서 나온 DML 이벤트 묶음 (항상 비어 있지 않음)
#[derive(Debug, Clone)]
pub struct DmlEventBatch {
    events: Vec<DmlEvent>,
    query: Option<Arc<str>>,
    position: BinlogPosition,
    resumable_position: BinlogPosition,
}

impl DmlEventBatch {
    /// 이벤트가 없으면 배치를 만들지 않습니다.
    pub fn new(
        events: Vec<DmlEvent>,
        query: Option<Arc<str>>,
        position: BinlogPosition,
        resumable_position: BinlogPosition,
    ) -> Option<Self> {
        if events.is_empty() {
            return None;
        }
        Some(DmlEventBatch {
            events,
            query,
            position,
            resumable_position,
        })
    }

    pub fn events(&self) -> &[DmlEvent] {
        &self.events
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    /// 재구성된 문장: `/*<marginalia>*/ <원본 문장>`
    pub fn query(&self) -> Option<&str> {
        self.query.as_deref()
    }

    /// 추적 주석 (marginalia) 부분
    pub fn trace_tag(&self) -> Option<&str> {
        self.query().and_then(marginalia::split).map(|(tag, _)| tag)
    }

    /// 추적 주석을 뗀 원본 문장
    pub fn original_statement(&self) -> Option<&str> {
        self.query()
            .map(|q| marginalia::split(q).map_or(q, |(_, statement)| statement))
    }

    /// 배치에 기여한 마지막 원시 이벤트의 위치
    pub fn position(&self) -> &BinlogPosition {
        &self.position
    }

    /// 이 문장을 처음부터 다시 읽을 수 있는 재개 위치
    pub fn resumable_position(&self) -> &BinlogPosition {
        &self.resumable_position
    }
}
