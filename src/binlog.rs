//! MySQL Binlog 이벤트 파싱
//!
//! 각 이벤트:
//!   - Timestamp (4 bytes)
//!   - Type (1 byte)
//!   - Server ID (4 bytes)
//!   - Event Length (4 bytes)
//!   - Next Position (4 bytes)
//!   - Flags (2 bytes)
//!   - Event Data (variable)
//!   - CRC32 (4 bytes, 체크섬이 켜진 경우)

use crate::connection::ColumnInfo;
use crate::error::{FerryError, Result};
use crate::events::*;
use crate::schema::TableSchema;
use byteorder::{BigEndian, LittleEndian, ReadBytesExt};
use bytes::Bytes;
use chrono::{TimeZone, Utc};
use std::collections::HashMap;
use std::io::{Cursor, Read};
use tracing::debug;

pub const EVENT_HEADER_SIZE: usize = 19;

pub const CHECKSUM_ALG_OFF: u8 = 0;
pub const CHECKSUM_ALG_CRC32: u8 = 1;
const CHECKSUM_LEN: usize = 4;

/// DECIMAL 자릿수별 바이트 수 (9자리 = 4바이트)
const DIG_TO_BYTES: [usize; 10] = [0, 1, 1, 2, 2, 3, 3, 4, 4, 4];

const DATETIMEF_INT_OFS: i64 = 0x80_0000_0000;
const TIMEF_INT_OFS: i64 = 0x80_0000;
const TIMEF_OFS: i64 = 0x8000_0000_0000;

/// 스트림 파서. 포맷 설명 이벤트의 체크섬 설정과 테이블 맵을 기억합니다.
#[derive(Debug, Default)]
pub struct BinlogParser {
    checksum_alg: u8,
    table_maps: HashMap<u64, TableMapData>,
}

impl BinlogParser {
    pub fn new() -> Self {
        BinlogParser::default()
    }

    /// 포맷 설명 이벤트보다 먼저 오는 인공 ROTATE에도 체크섬이 붙으므로
    /// 서버의 binlog_checksum 값을 미리 알려 줄 수 있습니다.
    pub fn with_checksum(checksum_alg: u8) -> Self {
        BinlogParser {
            checksum_alg,
            table_maps: HashMap::new(),
        }
    }

    pub fn checksum_alg(&self) -> u8 {
        self.checksum_alg
    }

    pub fn table_map(&self, table_id: u64) -> Option<&TableMapData> {
        self.table_maps.get(&table_id)
    }

    /// 이벤트 헤더 파싱
    pub fn parse_header(data: &[u8]) -> Result<EventHeader> {
        if data.len() < EVENT_HEADER_SIZE {
            return Err(FerryError::DecodeError(format!(
                "event header too short: {} bytes",
                data.len()
            )));
        }

        let mut cursor = Cursor::new(data);
        Ok(EventHeader {
            timestamp: cursor.read_u32::<LittleEndian>()?,
            event_type: EventType::from_u8(cursor.read_u8()?),
            server_id: cursor.read_u32::<LittleEndian>()?,
            event_length: cursor.read_u32::<LittleEndian>()?,
            next_pos: cursor.read_u32::<LittleEndian>()?,
            flags: cursor.read_u16::<LittleEndian>()?,
        })
    }

    /// 원시 이벤트 하나를 파싱합니다. 길이가 모자라면 DecodeError.
    pub fn parse(&mut self, data: &[u8]) -> Result<BinlogEvent> {
        self.parse_event(data).map_err(FerryError::into_decode_error)
    }

    fn parse_event(&mut self, data: &[u8]) -> Result<BinlogEvent> {
        let header = Self::parse_header(data)?;

        if header.event_type == EventType::FormatDescriptionEvent {
            let fde = parse_format_description(&data[EVENT_HEADER_SIZE..])?;
            debug!(
                "Format description: binlog v{}, server {}, checksum_alg={}",
                fde.binlog_version, fde.server_version, fde.checksum_alg
            );
            self.checksum_alg = fde.checksum_alg;
            return Ok(BinlogEvent {
                header,
                data: BinlogEventData::FormatDescription(fde),
            });
        }

        let mut end = data.len();
        if self.checksum_alg == CHECKSUM_ALG_CRC32 {
            end = end.checked_sub(CHECKSUM_LEN).filter(|e| *e >= EVENT_HEADER_SIZE).ok_or_else(|| {
                FerryError::DecodeError("event shorter than its checksum".to_string())
            })?;
        }
        let body = &data[EVENT_HEADER_SIZE..end];

        let event_data = match header.event_type {
            EventType::TableMapEvent => {
                let table_map = parse_table_map_event(body)?;
                self.table_maps.insert(table_map.table_id, table_map.clone());
                BinlogEventData::TableMap(table_map)
            }
            event_type if event_type.rows_kind().is_some() => {
                BinlogEventData::Rows(parse_rows_event(body, event_type)?)
            }
            EventType::QueryEvent => BinlogEventData::Query(parse_query_event(body)?),
            EventType::RotateEvent => BinlogEventData::Rotate(parse_rotate_event(body)?),
            EventType::GtidEvent => BinlogEventData::Gtid(parse_gtid_event(body)?),
            EventType::RowsQueryEvent => BinlogEventData::RowsQuery(parse_rows_query_event(body)?),
            EventType::XidEvent => BinlogEventData::Xid(Cursor::new(body).read_u64::<LittleEndian>()?),
            EventType::HeartbeatEvent => BinlogEventData::Heartbeat,
            EventType::TransactionPayloadEvent => {
                return Err(FerryError::DecodeError(
                    "compressed transaction payloads are not supported (binlog_transaction_compression)"
                        .to_string(),
                ))
            }
            EventType::PartialUpdateRowsEvent => {
                return Err(FerryError::DecodeError(
                    "partial JSON updates are not supported (binlog_row_value_options)".to_string(),
                ))
            }
            _ => BinlogEventData::Unknown(Bytes::copy_from_slice(body)),
        };

        Ok(BinlogEvent {
            header,
            data: event_data,
        })
    }

    /// 행 이벤트의 본문을 테이블 맵과 스키마에 맞춰 디코딩
    pub fn decode_rows(
        &self,
        rows: &RowsEventData,
        table_map: &TableMapData,
        schema: &TableSchema,
    ) -> Result<Vec<RowImage>> {
        decode_rows(rows, table_map, schema).map_err(FerryError::into_decode_error)
    }
}

fn parse_format_description(data: &[u8]) -> Result<FormatDescriptionData> {
    let mut cursor = Cursor::new(data);
    let binlog_version = cursor.read_u16::<LittleEndian>()?;

    let mut version_bytes = [0u8; 50];
    cursor.read_exact(&mut version_bytes)?;
    let version_len = version_bytes.iter().position(|b| *b == 0).unwrap_or(version_bytes.len());
    let server_version = String::from_utf8_lossy(&version_bytes[..version_len]).into_owned();

    // 5.6.1부터 이벤트 끝에 체크섬 알고리즘(1) + 체크섬(4)
    let checksum_alg = if version_has_checksum(&server_version) && data.len() >= 5 {
        data[data.len() - 5]
    } else {
        CHECKSUM_ALG_OFF
    };

    Ok(FormatDescriptionData {
        binlog_version,
        server_version,
        checksum_alg,
    })
}

fn version_has_checksum(version: &str) -> bool {
    let mut parts = version
        .split(|c: char| !c.is_ascii_digit())
        .take(3)
        .map(|p| p.parse::<u32>().unwrap_or(0));
    let major = parts.next().unwrap_or(0);
    let minor = parts.next().unwrap_or(0);
    let patch = parts.next().unwrap_or(0);
    (major, minor, patch) >= (5, 6, 1)
}

/// 테이블 맵 이벤트 파싱 (19)
fn parse_table_map_event(data: &[u8]) -> Result<TableMapData> {
    let mut cursor = Cursor::new(data);

    let table_id = cursor.read_u48::<LittleEndian>()?;
    let _flags = cursor.read_u16::<LittleEndian>()?;

    let database = read_length_prefixed_name(&mut cursor)?;
    let table = read_length_prefixed_name(&mut cursor)?;

    let column_count = read_lcb(&mut cursor)? as usize;
    let type_bytes = read_bytes(&mut cursor, column_count)?;
    let column_types: Vec<ColumnType> = type_bytes.into_iter().map(ColumnType::from_u8).collect();

    let metadata_length = read_lcb(&mut cursor)? as usize;
    let metadata = read_bytes(&mut cursor, metadata_length)?;
    let column_meta = parse_column_metadata(&column_types, &metadata)?;

    let nullable_bitmap = read_bytes(&mut cursor, column_count.div_ceil(8))?;

    // 이후의 optional metadata (8.0.1+)는 사용하지 않음
    Ok(TableMapData {
        table_id,
        database,
        table,
        column_types,
        column_meta,
        nullable_bitmap,
    })
}

/// 길이(1) + 이름 + null
fn read_length_prefixed_name(cursor: &mut Cursor<&[u8]>) -> Result<String> {
    let len = cursor.read_u8()? as usize;
    let mut bytes = vec![0u8; len];
    cursor.read_exact(&mut bytes)?;
    cursor.read_u8()?;
    Ok(String::from_utf8_lossy(&bytes).into_owned())
}

fn parse_column_metadata(column_types: &[ColumnType], data: &[u8]) -> Result<Vec<u16>> {
    let mut cursor = Cursor::new(data);
    let mut metadata = Vec::with_capacity(column_types.len());

    for column_type in column_types {
        let meta = match column_type {
            ColumnType::Float
            | ColumnType::Double
            | ColumnType::Blob
            | ColumnType::TinyBlob
            | ColumnType::MediumBlob
            | ColumnType::LongBlob
            | ColumnType::Json
            | ColumnType::Geometry
            | ColumnType::Time2
            | ColumnType::DateTime2
            | ColumnType::Timestamp2 => cursor.read_u8()? as u16,
            ColumnType::Varchar | ColumnType::VarString | ColumnType::Bit => {
                cursor.read_u16::<LittleEndian>()?
            }
            // (precision, scale), (real_type, length)
            ColumnType::NewDecimal | ColumnType::String | ColumnType::Enum | ColumnType::Set => {
                cursor.read_u16::<BigEndian>()?
            }
            _ => 0,
        };
        metadata.push(meta);
    }

    Ok(metadata)
}

/// WRITE/UPDATE/DELETE_ROWS 이벤트 파싱 (v1: 23-25, v2: 30-32)
fn parse_rows_event(data: &[u8], event_type: EventType) -> Result<RowsEventData> {
    let kind = event_type
        .rows_kind()
        .ok_or_else(|| FerryError::DecodeError(format!("{:?} is not a rows event", event_type)))?;

    let mut cursor = Cursor::new(data);
    let table_id = cursor.read_u48::<LittleEndian>()?;
    let flags = cursor.read_u16::<LittleEndian>()?;

    if event_type.is_rows_v2() {
        // extra data 길이는 자기 자신(2바이트)을 포함
        let extra_len = cursor.read_u16::<LittleEndian>()? as u64;
        cursor.set_position(cursor.position() + extra_len.saturating_sub(2));
    }

    let column_count = read_lcb(&mut cursor)?;
    let bitmap_len = (column_count as usize).div_ceil(8);

    let columns_present = read_bytes(&mut cursor, bitmap_len)?;

    let columns_after = if kind == RowsEventKind::Update {
        Some(read_bytes(&mut cursor, bitmap_len)?)
    } else {
        None
    };

    let offset = cursor.position() as usize;
    if offset > data.len() {
        return Err(FerryError::DecodeError("rows event header overruns event".to_string()));
    }

    Ok(RowsEventData {
        kind,
        table_id,
        flags,
        column_count,
        columns_present,
        columns_after,
        rows_data: Bytes::copy_from_slice(&data[offset..]),
    })
}

/// QUERY 이벤트 파싱 (2)
fn parse_query_event(data: &[u8]) -> Result<QueryEventData> {
    let mut cursor = Cursor::new(data);

    let thread_id = cursor.read_u32::<LittleEndian>()?;
    let exec_time = cursor.read_u32::<LittleEndian>()?;
    let db_len = cursor.read_u8()? as usize;
    let _error_code = cursor.read_u16::<LittleEndian>()?;
    let status_len = cursor.read_u16::<LittleEndian>()? as u64;

    cursor.set_position(cursor.position() + status_len);

    let mut db_bytes = vec![0u8; db_len];
    cursor.read_exact(&mut db_bytes)?;
    let database = String::from_utf8_lossy(&db_bytes).into_owned();

    // null terminator
    cursor.read_u8()?;

    let query = String::from_utf8_lossy(&data[cursor.position() as usize..]).into_owned();

    Ok(QueryEventData {
        thread_id,
        exec_time,
        database,
        query,
    })
}

/// ROTATE 이벤트 파싱 (4)
fn parse_rotate_event(data: &[u8]) -> Result<RotateEventData> {
    let mut cursor = Cursor::new(data);
    let position = cursor.read_u64::<LittleEndian>()?;
    let next_binlog_name = String::from_utf8_lossy(&data[8..]).into_owned();

    Ok(RotateEventData {
        next_binlog_name,
        position,
    })
}

/// GTID 이벤트 파싱 (33)
fn parse_gtid_event(data: &[u8]) -> Result<GtidEventData> {
    let mut cursor = Cursor::new(data);

    let flags = cursor.read_u8()?;
    let mut uuid_bytes = [0u8; 16];
    cursor.read_exact(&mut uuid_bytes)?;
    let sequence = cursor.read_i64::<LittleEndian>()?;

    Ok(GtidEventData {
        gtid: format!("{}:{}", format_uuid(&uuid_bytes), sequence),
        committed: flags & 0x01 != 0,
    })
}

/// ROWS_QUERY 이벤트 파싱 (29). 첫 바이트는 잘린 길이라 무시하고 나머지 전체가 문장
fn parse_rows_query_event(data: &[u8]) -> Result<String> {
    if data.is_empty() {
        return Err(FerryError::DecodeError("empty rows query event".to_string()));
    }
    Ok(String::from_utf8_lossy(&data[1..]).into_owned())
}

/// LCB (Length-Coded Binary) 읽기
fn read_lcb(cursor: &mut Cursor<&[u8]>) -> Result<u64> {
    let byte = cursor.read_u8()?;
    match byte {
        0..=0xfa => Ok(byte as u64),
        0xfb => Ok(0),
        0xfc => Ok(cursor.read_u16::<LittleEndian>()? as u64),
        0xfd => Ok(cursor.read_u24::<LittleEndian>()? as u64),
        0xfe => Ok(cursor.read_u64::<LittleEndian>()?),
        0xff => Err(FerryError::DecodeError("Invalid LCB value".to_string())),
    }
}

/// UUID 바이트 배열을 문자열로 변환
fn format_uuid(bytes: &[u8; 16]) -> String {
    format!(
        "{:02x}{:02x}{:02x}{:02x}-{:02x}{:02x}-{:02x}{:02x}-{:02x}{:02x}-{:02x}{:02x}{:02x}{:02x}{:02x}{:02x}",
        bytes[0], bytes[1], bytes[2], bytes[3],
        bytes[4], bytes[5],
        bytes[6], bytes[7],
        bytes[8], bytes[9],
        bytes[10], bytes[11], bytes[12], bytes[13], bytes[14], bytes[15]
    )
}

fn is_bit_set(bitmap: &[u8], idx: usize) -> bool {
    bitmap.get(idx / 8).is_some_and(|b| b & (1 << (idx % 8)) != 0)
}

fn count_set_bits(bitmap: &[u8], column_count: usize) -> usize {
    (0..column_count).filter(|i| is_bit_set(bitmap, *i)).count()
}

fn decode_rows(rows: &RowsEventData, table_map: &TableMapData, schema: &TableSchema) -> Result<Vec<RowImage>> {
    let column_count = rows.column_count as usize;

    if column_count != table_map.column_types.len() {
        return Err(FerryError::DecodeError(format!(
            "rows event for table id {} has {} columns, table map has {}",
            rows.table_id,
            column_count,
            table_map.column_types.len()
        )));
    }
    if column_count != schema.columns.len() {
        return Err(FerryError::DecodeError(format!(
            "{} has {} columns in the binlog but {} in the cached schema",
            schema.qualified_name(),
            column_count,
            schema.columns.len()
        )));
    }

    let bitmaps = std::iter::once(&rows.columns_present).chain(rows.columns_after.as_ref());
    for bitmap in bitmaps {
        if count_set_bits(bitmap, column_count) != column_count {
            return Err(FerryError::DecodeError(format!(
                "{}: row image is not FULL (binlog_row_image must be FULL)",
                schema.qualified_name()
            )));
        }
    }

    let data: &[u8] = &rows.rows_data;
    let mut cursor = Cursor::new(data);
    let mut images = Vec::new();

    while (cursor.position() as usize) < data.len() {
        let image = match rows.kind {
            RowsEventKind::Write => RowImage {
                before: None,
                after: Some(decode_row(&mut cursor, table_map, schema)?),
            },
            RowsEventKind::Delete => RowImage {
                before: Some(decode_row(&mut cursor, table_map, schema)?),
                after: None,
            },
            RowsEventKind::Update => {
                let before = decode_row(&mut cursor, table_map, schema)?;
                let after = decode_row(&mut cursor, table_map, schema)?;
                RowImage {
                    before: Some(before),
                    after: Some(after),
                }
            }
        };
        images.push(image);
    }

    Ok(images)
}

/// FULL 이미지 한 행 (null 비트맵 + 컬럼 값들)
fn decode_row(cursor: &mut Cursor<&[u8]>, table_map: &TableMapData, schema: &TableSchema) -> Result<Vec<CellValue>> {
    let column_count = table_map.column_types.len();
    let null_bitmap = read_bytes(cursor, column_count.div_ceil(8))?;

    let mut values = Vec::with_capacity(column_count);
    for (idx, column) in schema.columns.iter().enumerate() {
        if is_bit_set(&null_bitmap, idx) {
            values.push(CellValue::Null);
            continue;
        }
        let value = decode_value(
            cursor,
            table_map.column_types[idx],
            table_map.column_meta[idx],
            column,
        )
        .map_err(|e| match e {
            FerryError::DecodeError(msg) => {
                FerryError::DecodeError(format!("{}.{}: {}", schema.qualified_name(), column.name, msg))
            }
            other => other,
        })?;
        values.push(value);
    }

    Ok(values)
}

fn decode_value(cursor: &mut Cursor<&[u8]>, column_type: ColumnType, meta: u16, column: &ColumnInfo) -> Result<CellValue> {
    let unsigned = column.is_unsigned();

    let value = match column_type {
        ColumnType::Tiny if unsigned => CellValue::UInt8(cursor.read_u8()?),
        ColumnType::Tiny => CellValue::Int8(cursor.read_i8()?),
        ColumnType::Short if unsigned => CellValue::UInt16(cursor.read_u16::<LittleEndian>()?),
        ColumnType::Short => CellValue::Int16(cursor.read_i16::<LittleEndian>()?),
        ColumnType::Int24 if unsigned => CellValue::UInt32(cursor.read_u24::<LittleEndian>()?),
        ColumnType::Int24 => CellValue::Int32(cursor.read_i24::<LittleEndian>()?),
        ColumnType::Long if unsigned => CellValue::UInt32(cursor.read_u32::<LittleEndian>()?),
        ColumnType::Long => CellValue::Int32(cursor.read_i32::<LittleEndian>()?),
        ColumnType::LongLong if unsigned => CellValue::UInt64(cursor.read_u64::<LittleEndian>()?),
        ColumnType::LongLong => CellValue::Int64(cursor.read_i64::<LittleEndian>()?),
        ColumnType::Float => CellValue::Float(cursor.read_f32::<LittleEndian>()?),
        ColumnType::Double => CellValue::Double(cursor.read_f64::<LittleEndian>()?),
        ColumnType::Year => {
            let year = cursor.read_u8()? as u16;
            CellValue::UInt16(if year == 0 { 0 } else { year + 1900 })
        }
        ColumnType::Date | ColumnType::NewDate => {
            let packed = cursor.read_u24::<LittleEndian>()?;
            CellValue::Date(format!(
                "{:04}-{:02}-{:02}",
                packed >> 9,
                (packed >> 5) & 0x0F,
                packed & 0x1F
            ))
        }
        ColumnType::Time => {
            let packed = cursor.read_i24::<LittleEndian>()?;
            let sign = if packed < 0 { "-" } else { "" };
            let packed = packed.unsigned_abs();
            CellValue::Time(format!(
                "{}{:02}:{:02}:{:02}",
                sign,
                packed / 10000,
                (packed / 100) % 100,
                packed % 100
            ))
        }
        ColumnType::Time2 => CellValue::Time(decode_time2(cursor, meta as u8)?),
        ColumnType::DateTime => {
            let packed = cursor.read_u64::<LittleEndian>()?;
            let date = packed / 1_000_000;
            let time = packed % 1_000_000;
            datetime_value(
                (date / 10000) as i32,
                ((date / 100) % 100) as u32,
                (date % 100) as u32,
                (time / 10000) as u32,
                ((time / 100) % 100) as u32,
                (time % 100) as u32,
                0,
                0,
            )
        }
        ColumnType::DateTime2 => decode_datetime2(cursor, meta as u8)?,
        ColumnType::Timestamp => {
            let seconds = cursor.read_u32::<LittleEndian>()?;
            timestamp_value(seconds, 0)
        }
        ColumnType::Timestamp2 => {
            let seconds = cursor.read_u32::<BigEndian>()?;
            let micros = read_fractional_seconds(cursor, meta as u8)?;
            timestamp_value(seconds, micros)
        }
        ColumnType::Varchar | ColumnType::VarString => {
            let len = if meta < 256 {
                cursor.read_u8()? as usize
            } else {
                cursor.read_u16::<LittleEndian>()? as usize
            };
            text_or_bytes(read_bytes(cursor, len)?, column)
        }
        ColumnType::String => decode_string(cursor, meta, column)?,
        ColumnType::Enum => CellValue::UInt16(read_enum(cursor, meta & 0xFF)?),
        ColumnType::Set => CellValue::UInt64(read_set(cursor, meta & 0xFF)?),
        ColumnType::Blob
        | ColumnType::TinyBlob
        | ColumnType::MediumBlob
        | ColumnType::LongBlob
        | ColumnType::Geometry => {
            let len_bytes = meta as usize;
            if !(1..=4).contains(&len_bytes) {
                return Err(FerryError::DecodeError(format!("invalid blob length size {}", len_bytes)));
            }
            let len = cursor.read_uint::<LittleEndian>(len_bytes)? as usize;
            let bytes = read_bytes(cursor, len)?;
            if column_type == ColumnType::Geometry {
                CellValue::Bytes(bytes)
            } else {
                text_or_bytes(bytes, column)
            }
        }
        ColumnType::NewDecimal => {
            CellValue::Decimal(decode_decimal(cursor, (meta >> 8) as usize, (meta & 0xFF) as usize)?)
        }
        ColumnType::Bit => {
            let nbits = ((meta >> 8) * 8 + (meta & 0xFF)) as usize;
            let len = nbits.div_ceil(8);
            CellValue::UInt64(if len == 0 { 0 } else { cursor.read_uint::<BigEndian>(len)? })
        }
        ColumnType::Null => CellValue::Null,
        ColumnType::Json => {
            return Err(FerryError::DecodeError("JSON columns are not supported".to_string()))
        }
        ColumnType::Decimal => {
            return Err(FerryError::DecodeError(
                "pre-5.0 DECIMAL columns are not supported".to_string(),
            ))
        }
        ColumnType::Unknown(code) => {
            return Err(FerryError::DecodeError(format!("unknown column type {}", code)))
        }
    };

    Ok(value)
}

/// 남은 데이터보다 긴 길이는 할당 전에 거부
fn read_bytes(cursor: &mut Cursor<&[u8]>, len: usize) -> Result<Vec<u8>> {
    let remaining = cursor.get_ref().len().saturating_sub(cursor.position() as usize);
    if len > remaining {
        return Err(FerryError::DecodeError(format!(
            "length {} exceeds the {} bytes left in the event",
            len, remaining
        )));
    }
    let mut bytes = vec![0u8; len];
    cursor.read_exact(&mut bytes)?;
    Ok(bytes)
}

fn text_or_bytes(bytes: Vec<u8>, column: &ColumnInfo) -> CellValue {
    if column.is_binary() {
        return CellValue::Bytes(bytes);
    }
    match String::from_utf8(bytes) {
        Ok(s) => CellValue::String(s),
        Err(e) => CellValue::Bytes(e.into_bytes()),
    }
}

fn read_enum(cursor: &mut Cursor<&[u8]>, size: u16) -> Result<u16> {
    match size {
        1 => Ok(cursor.read_u8()? as u16),
        2 => Ok(cursor.read_u16::<LittleEndian>()?),
        other => Err(FerryError::DecodeError(format!("invalid enum size {}", other))),
    }
}

fn read_set(cursor: &mut Cursor<&[u8]>, size: u16) -> Result<u64> {
    if !(1..=8).contains(&size) {
        return Err(FerryError::DecodeError(format!("invalid set size {}", size)));
    }
    Ok(cursor.read_uint::<LittleEndian>(size as usize)?)
}

/// CHAR/BINARY/ENUM/SET. 메타데이터 상위 바이트가 실제 타입이고
/// 길이가 255를 넘는 CHAR는 상위 비트 일부가 길이에 들어갑니다.
fn decode_string(cursor: &mut Cursor<&[u8]>, meta: u16, column: &ColumnInfo) -> Result<CellValue> {
    let (real_type, length) = if meta >= 256 {
        let byte0 = (meta >> 8) as u8;
        let byte1 = meta & 0xFF;
        if byte0 & 0x30 != 0x30 {
            (byte0 | 0x30, byte1 | ((((byte0 & 0x30) ^ 0x30) as u16) << 4))
        } else {
            (byte0, byte1)
        }
    } else {
        (254u8, meta)
    };

    match ColumnType::from_u8(real_type) {
        ColumnType::Enum => Ok(CellValue::UInt16(read_enum(cursor, length)?)),
        ColumnType::Set => Ok(CellValue::UInt64(read_set(cursor, length)?)),
        _ => {
            let len = if length < 256 {
                cursor.read_u8()? as usize
            } else {
                cursor.read_u16::<LittleEndian>()? as usize
            };
            Ok(text_or_bytes(read_bytes(cursor, len)?, column))
        }
    }
}

/// 소수 초 (fsp 자릿수만큼, 빅엔디안) → 마이크로초
fn read_fractional_seconds(cursor: &mut Cursor<&[u8]>, fsp: u8) -> Result<u32> {
    let fsp = fsp.min(6);
    let len = (fsp as usize).div_ceil(2);
    if len == 0 {
        return Ok(0);
    }
    let value = cursor.read_uint::<BigEndian>(len)? as u32;
    // 홀수 자릿수는 한 자리를 더 저장함
    let stored_digits = (len * 2) as u32;
    Ok(value * 10u32.pow(6 - stored_digits))
}

fn decode_datetime2(cursor: &mut Cursor<&[u8]>, fsp: u8) -> Result<CellValue> {
    let packed = cursor.read_uint::<BigEndian>(5)? as i64 - DATETIMEF_INT_OFS;
    let micros = read_fractional_seconds(cursor, fsp)?;

    let packed = packed.abs();
    let ymd = packed >> 17;
    let ym = ymd >> 5;
    let hms = packed % (1 << 17);

    Ok(datetime_value(
        (ym / 13) as i32,
        (ym % 13) as u32,
        (ymd % (1 << 5)) as u32,
        (hms >> 12) as u32,
        ((hms >> 6) % (1 << 6)) as u32,
        (hms % (1 << 6)) as u32,
        micros,
        fsp,
    ))
}

/// 유효한 날짜는 UTC DateTime, 0000-00-00 같은 값은 문자열로 유지
#[allow(clippy::too_many_arguments)]
fn datetime_value(year: i32, month: u32, day: u32, hour: u32, minute: u32, second: u32, micros: u32, fsp: u8) -> CellValue {
    let naive = chrono::NaiveDate::from_ymd_opt(year, month, day)
        .and_then(|date| date.and_hms_micro_opt(hour, minute, second, micros));
    match naive {
        Some(naive) => CellValue::DateTime(Utc.from_utc_datetime(&naive)),
        None => {
            let mut text = format!(
                "{:04}-{:02}-{:02} {:02}:{:02}:{:02}",
                year, month, day, hour, minute, second
            );
            push_fraction(&mut text, micros, fsp);
            CellValue::String(text)
        }
    }
}

fn timestamp_value(seconds: u32, micros: u32) -> CellValue {
    if seconds == 0 {
        return CellValue::String("0000-00-00 00:00:00".to_string());
    }
    match Utc.timestamp_opt(seconds as i64, micros * 1000).single() {
        Some(dt) => CellValue::DateTime(dt),
        None => CellValue::UInt32(seconds),
    }
}

fn decode_time2(cursor: &mut Cursor<&[u8]>, fsp: u8) -> Result<String> {
    let packed: i64 = match fsp {
        1 | 2 => {
            let mut int_part = cursor.read_uint::<BigEndian>(3)? as i64 - TIMEF_INT_OFS;
            let mut frac = cursor.read_u8()? as i64;
            if int_part < 0 && frac != 0 {
                int_part += 1;
                frac -= 0x100;
            }
            (int_part << 24) + frac * 10000
        }
        3 | 4 => {
            let mut int_part = cursor.read_uint::<BigEndian>(3)? as i64 - TIMEF_INT_OFS;
            let mut frac = cursor.read_u16::<BigEndian>()? as i64;
            if int_part < 0 && frac != 0 {
                int_part += 1;
                frac -= 0x10000;
            }
            (int_part << 24) + frac * 100
        }
        5 | 6 => cursor.read_uint::<BigEndian>(6)? as i64 - TIMEF_OFS,
        _ => (cursor.read_uint::<BigEndian>(3)? as i64 - TIMEF_INT_OFS) << 24,
    };

    let negative = packed < 0;
    let packed = packed.abs();
    let hms = packed >> 24;
    let micros = (packed % (1 << 24)) as u32;

    let mut text = format!(
        "{}{:02}:{:02}:{:02}",
        if negative { "-" } else { "" },
        (hms >> 12) % (1 << 10),
        (hms >> 6) % (1 << 6),
        hms % (1 << 6)
    );
    push_fraction(&mut text, micros, fsp);
    Ok(text)
}

fn push_fraction(text: &mut String, micros: u32, fsp: u8) {
    let fsp = fsp.min(6) as u32;
    if fsp > 0 {
        let value = micros / 10u32.pow(6 - fsp);
        text.push_str(&format!(".{:0width$}", value, width = fsp as usize));
    }
}

/// NEWDECIMAL 바이너리 형식 → 10진 문자열
fn decode_decimal(cursor: &mut Cursor<&[u8]>, precision: usize, scale: usize) -> Result<String> {
    if scale > precision {
        return Err(FerryError::DecodeError(format!(
            "invalid decimal({}, {})",
            precision, scale
        )));
    }

    let integral = precision - scale;
    let (int_words, int_leftover) = (integral / 9, integral % 9);
    let (frac_words, frac_leftover) = (scale / 9, scale % 9);
    let size = int_words * 4 + DIG_TO_BYTES[int_leftover] + frac_words * 4 + DIG_TO_BYTES[frac_leftover];

    let mut buffer = read_bytes(cursor, size)?;
    if buffer.is_empty() {
        return Ok("0".to_string());
    }

    // 부호 비트는 반전 저장, 음수는 나머지 비트도 반전
    let negative = buffer[0] & 0x80 == 0;
    buffer[0] ^= 0x80;
    if negative {
        buffer.iter_mut().for_each(|b| *b = !*b);
    }

    let mut digits = Cursor::new(buffer.as_slice());
    let mut int_part = String::new();
    if int_leftover > 0 {
        let value = digits.read_uint::<BigEndian>(DIG_TO_BYTES[int_leftover])?;
        int_part.push_str(&format!("{:0width$}", value, width = int_leftover));
    }
    for _ in 0..int_words {
        int_part.push_str(&format!("{:09}", digits.read_u32::<BigEndian>()?));
    }

    let mut result = String::new();
    if negative {
        result.push('-');
    }
    let trimmed = int_part.trim_start_matches('0');
    result.push_str(if trimmed.is_empty() { "0" } else { trimmed });

    if scale > 0 {
        result.push('.');
        for _ in 0..frac_words {
            result.push_str(&format!("{:09}", digits.read_u32::<BigEndian>()?));
        }
        if frac_leftover > 0 {
            let value = digits.read_uint::<BigEndian>(DIG_TO_BYTES[frac_leftover])?;
            result.push_str(&format!("{:0width$}", value, width = frac_leftover));
        }
    }

    Ok(result)
}
