//! 테스트용 스키마와 binlog 이벤트 인코더

use crate::connection::ColumnInfo;
use crate::filter::{DatabaseTableFilter, TableFilter};
use crate::schema::{TableSchema, TableSchemaCache};
use byteorder::{LittleEndian, WriteBytesExt};
use std::sync::Arc;

pub(crate) const TEST_TABLE_ID: u64 = 42;
pub(crate) const TEST_SERVER_ID: u32 = 1;

const LOG_EVENT_ARTIFICIAL_F: u16 = 0x0020;

/// gftest.test_table_1 (id INT PRIMARY KEY, data VARCHAR(255))
pub(crate) fn test_table_schema() -> TableSchema {
    TableSchema::new(
        "gftest",
        "test_table_1",
        vec![
            ColumnInfo {
                name: "id".to_string(),
                column_type: "int(11)".to_string(),
                nullable: false,
                column_key: "PRI".to_string(),
                extra: "auto_increment".to_string(),
            },
            ColumnInfo {
                name: "data".to_string(),
                column_type: "varchar(255)".to_string(),
                nullable: true,
                column_key: String::new(),
                extra: String::new(),
            },
        ],
    )
}

pub(crate) fn test_schema_cache() -> TableSchemaCache {
    let mut cache = TableSchemaCache::new();
    cache.insert(test_table_schema());
    cache
}

pub(crate) fn test_filter() -> Arc<dyn TableFilter> {
    Arc::new(DatabaseTableFilter::new(vec!["gftest".to_string()]))
}

/// 헤더의 next_pos를 이어 가며 이벤트를 인코딩합니다.
pub(crate) struct EventBuilder {
    next_pos: u32,
    checksum: bool,
}

impl EventBuilder {
    pub(crate) fn new(start: u32) -> Self {
        EventBuilder {
            next_pos: start,
            checksum: false,
        }
    }

    pub(crate) fn with_checksum(mut self) -> Self {
        self.checksum = true;
        self
    }

    /// 마지막으로 만든 이벤트 다음 위치
    pub(crate) fn position(&self) -> u64 {
        self.next_pos as u64
    }

    pub(crate) fn event(&mut self, event_type: u8, body: &[u8], flags: u16) -> Vec<u8> {
        let length = (19 + body.len() + self.checksum_len()) as u32;
        self.next_pos += length;
        self.encode(event_type, body, self.next_pos, flags)
    }

    /// 파일 위치와 무관한 인공 이벤트 (next_pos = 0)
    pub(crate) fn artificial(&self, event_type: u8, body: &[u8]) -> Vec<u8> {
        self.encode(event_type, body, 0, LOG_EVENT_ARTIFICIAL_F)
    }

    fn checksum_len(&self) -> usize {
        if self.checksum {
            4
        } else {
            0
        }
    }

    fn encode(&self, event_type: u8, body: &[u8], next_pos: u32, flags: u16) -> Vec<u8> {
        let length = (19 + body.len() + self.checksum_len()) as u32;
        let mut data = Vec::with_capacity(length as usize);
        data.write_u32::<LittleEndian>(1_700_000_000).unwrap();
        data.write_u8(event_type).unwrap();
        data.write_u32::<LittleEndian>(TEST_SERVER_ID).unwrap();
        data.write_u32::<LittleEndian>(length).unwrap();
        data.write_u32::<LittleEndian>(next_pos).unwrap();
        data.write_u16::<LittleEndian>(flags).unwrap();
        data.extend_from_slice(body);
        data.extend(std::iter::repeat(0xAB).take(self.checksum_len()));
        data
    }

    pub(crate) fn format_description(&mut self) -> Vec<u8> {
        let mut body = Vec::new();
        body.write_u16::<LittleEndian>(4).unwrap();
        let mut version = b"8.0.36".to_vec();
        version.resize(50, 0);
        body.extend_from_slice(&version);
        body.write_u32::<LittleEndian>(0).unwrap();
        body.push(19);
        body.extend_from_slice(&[0u8; 40]);
        body.push(if self.checksum { 1 } else { 0 });
        if !self.checksum {
            // 체크섬이 꺼져 있어도 자리는 남음
            body.extend_from_slice(&[0u8; 4]);
        }
        self.event(15, &body, 0)
    }

    pub(crate) fn rotate(&mut self, position: u64, filename: &str) -> Vec<u8> {
        let body = rotate_body(position, filename);
        self.event(4, &body, 0)
    }

    /// 덤프 시작 시 서버가 보내는 인공 ROTATE
    pub(crate) fn fake_rotate(&mut self, position: u64, filename: &str) -> Vec<u8> {
        self.next_pos = position as u32;
        self.artificial(4, &rotate_body(position, filename))
    }

    pub(crate) fn heartbeat(&self) -> Vec<u8> {
        self.encode(27, b"mysql-bin.000001", self.next_pos, LOG_EVENT_ARTIFICIAL_F)
    }

    pub(crate) fn rows_query(&mut self, query: &str) -> Vec<u8> {
        let mut body = vec![query.len().min(255) as u8];
        body.extend_from_slice(query.as_bytes());
        self.event(29, &body, 0)
    }

    pub(crate) fn query(&mut self, sql: &str) -> Vec<u8> {
        let mut body = Vec::new();
        body.write_u32::<LittleEndian>(7).unwrap();
        body.write_u32::<LittleEndian>(0).unwrap();
        body.push(0);
        body.write_u16::<LittleEndian>(0).unwrap();
        body.write_u16::<LittleEndian>(0).unwrap();
        body.push(0);
        body.extend_from_slice(sql.as_bytes());
        self.event(2, &body, 0)
    }

    /// test_table_1의 테이블 맵 (LONG, VARCHAR(255) utf8mb4)
    pub(crate) fn table_map(&mut self, table_id: u64) -> Vec<u8> {
        self.table_map_for(table_id, "gftest", "test_table_1")
    }

    pub(crate) fn table_map_for(&mut self, table_id: u64, database: &str, table: &str) -> Vec<u8> {
        let mut body = Vec::new();
        body.write_u48::<LittleEndian>(table_id).unwrap();
        body.write_u16::<LittleEndian>(1).unwrap();
        body.push(database.len() as u8);
        body.extend_from_slice(database.as_bytes());
        body.push(0);
        body.push(table.len() as u8);
        body.extend_from_slice(table.as_bytes());
        body.push(0);
        body.push(2);
        body.extend_from_slice(&[3, 15]);
        body.push(2);
        body.write_u16::<LittleEndian>(1020).unwrap();
        body.push(0b10);
        self.event(19, &body, 0)
    }

    pub(crate) fn write_rows(&mut self, table_id: u64, rows: &[(i32, &str)], statement_end: bool) -> Vec<u8> {
        let mut body = rows_header(table_id, statement_end, false);
        for row in rows {
            encode_row(&mut body, row);
        }
        self.event(30, &body, 0)
    }

    pub(crate) fn update_rows(
        &mut self,
        table_id: u64,
        rows: &[((i32, &str), (i32, &str))],
        statement_end: bool,
    ) -> Vec<u8> {
        let mut body = rows_header(table_id, statement_end, true);
        for (before, after) in rows {
            encode_row(&mut body, before);
            encode_row(&mut body, after);
        }
        self.event(31, &body, 0)
    }

    pub(crate) fn delete_rows(&mut self, table_id: u64, rows: &[(i32, &str)], statement_end: bool) -> Vec<u8> {
        let mut body = rows_header(table_id, statement_end, false);
        for row in rows {
            encode_row(&mut body, row);
        }
        self.event(32, &body, 0)
    }

    pub(crate) fn xid(&mut self, xid: u64) -> Vec<u8> {
        self.event(16, &xid.to_le_bytes(), 0)
    }

    /// ROWS_QUERY + TABLE_MAP + WRITE_ROWS(STMT_END) 한 문장
    pub(crate) fn insert_statement(&mut self, query: &str, rows: &[(i32, &str)]) -> Vec<Vec<u8>> {
        vec![
            self.rows_query(query),
            self.table_map(TEST_TABLE_ID),
            self.write_rows(TEST_TABLE_ID, rows, true),
        ]
    }
}

fn rotate_body(position: u64, filename: &str) -> Vec<u8> {
    let mut body = position.to_le_bytes().to_vec();
    body.extend_from_slice(filename.as_bytes());
    body
}

fn rows_header(table_id: u64, statement_end: bool, update: bool) -> Vec<u8> {
    let mut body = Vec::new();
    body.write_u48::<LittleEndian>(table_id).unwrap();
    body.write_u16::<LittleEndian>(if statement_end { 1 } else { 0 }).unwrap();
    // extra data 길이 (자기 자신만)
    body.write_u16::<LittleEndian>(2).unwrap();
    body.push(2);
    body.push(0b11);
    if update {
        body.push(0b11);
    }
    body
}

fn encode_row(body: &mut Vec<u8>, (id, data): &(i32, &str)) {
    body.push(0);
    body.write_i32::<LittleEndian>(*id).unwrap();
    body.write_u16::<LittleEndian>(data.len() as u16).unwrap();
    body.extend_from_slice(data.as_bytes());
}
