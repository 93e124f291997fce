//! 원시 binlog 이벤트를 문장 단위 DML 배치로 묶는 배처
//!
//! 큰 문장은 여러 행 이벤트로 쪼개져 도착합니다. `STMT_END_F` 플래그가 붙은
//! 마지막 조각이 올 때까지 이벤트를 모았다가 한 배치로 내보냅니다.

use crate::binlog::BinlogParser;
use crate::error::{FerryError, Result};
use crate::events::{
    BinlogEventData, DmlEvent, DmlEventBatch, DmlEventKind, EventHeader, EventType, RowImage,
    RowsEventData, RowsEventKind,
};
use crate::filter::TableFilter;
use crate::offset::BinlogPosition;
use crate::schema::TableSchemaCache;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// 배치를 끊는 기준
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum BatchBoundary {
    /// 원본 문장 하나당 배치 하나
    #[default]
    Statement,
    /// 행 이벤트 하나당 배치 하나 (조각마다 전체 문장 텍스트를 가짐)
    RowsEvent,
}

pub struct EventBatcher {
    parser: BinlogParser,
    schema: Arc<TableSchemaCache>,
    filter: Arc<dyn TableFilter>,
    boundary: BatchBoundary,
    position: BinlogPosition,
    statement_start: BinlogPosition,
    statement_open: bool,
    current_query: Option<Arc<str>>,
    current_gtid: Option<Arc<str>>,
    pending: Vec<DmlEvent>,
}

impl EventBatcher {
    pub fn new(
        parser: BinlogParser,
        schema: Arc<TableSchemaCache>,
        filter: Arc<dyn TableFilter>,
        boundary: BatchBoundary,
        start: BinlogPosition,
    ) -> Self {
        EventBatcher {
            parser,
            schema,
            filter,
            boundary,
            statement_start: start.clone(),
            position: start,
            statement_open: false,
            current_query: None,
            current_gtid: None,
            pending: Vec::new(),
        }
    }

    /// 마지막으로 처리한 원시 이벤트 다음 위치
    pub fn position(&self) -> &BinlogPosition {
        &self.position
    }

    pub fn has_partial(&self) -> bool {
        !self.pending.is_empty()
    }

    /// 원시 이벤트 하나를 처리하고, 경계에 도달했으면 배치를 반환합니다.
    pub fn handle(&mut self, raw: &[u8]) -> Result<Option<DmlEventBatch>> {
        let event = self.parser.parse(raw)?;
        let event_start = self.position.clone();
        self.advance(&event.header);

        match event.data {
            BinlogEventData::Rotate(rotate) => {
                debug!("Rotating to {}:{}", rotate.next_binlog_name, rotate.position);
                self.position = BinlogPosition::new(rotate.next_binlog_name, rotate.position);
                Ok(None)
            }
            BinlogEventData::RowsQuery(query) => {
                if self.has_partial() {
                    warn!(
                        "New statement started before the previous one ended, dropping {} events",
                        self.pending.len()
                    );
                    self.pending.clear();
                }
                self.open_statement(event_start, Some(Arc::from(query)));
                Ok(None)
            }
            BinlogEventData::TableMap(_) => {
                if !self.statement_open {
                    self.open_statement(event_start, None);
                }
                Ok(None)
            }
            BinlogEventData::Gtid(gtid) => {
                self.current_gtid = Some(Arc::from(gtid.gtid));
                Ok(None)
            }
            BinlogEventData::Xid(_) => {
                self.current_gtid = None;
                Ok(None)
            }
            BinlogEventData::Rows(rows) => self.handle_rows(rows),
            _ => Ok(None),
        }
    }

    /// 0이 아닌 다음 위치를 가진 실제 이벤트만 위치를 전진시킵니다.
    fn advance(&mut self, header: &EventHeader) {
        if header.next_pos > 0 && header.event_type != EventType::HeartbeatEvent {
            self.position = self.position.with_position(header.next_pos as u64);
        }
    }

    fn open_statement(&mut self, start: BinlogPosition, query: Option<Arc<str>>) {
        self.statement_start = start;
        self.statement_open = true;
        self.current_query = query;
    }

    fn close_statement(&mut self) {
        self.statement_open = false;
        self.current_query = None;
    }

    fn handle_rows(&mut self, rows: RowsEventData) -> Result<Option<DmlEventBatch>> {
        let table_map = self.parser.table_map(rows.table_id).ok_or_else(|| {
            FerryError::DecodeError(format!("rows event references unknown table id {}", rows.table_id))
        })?;

        if self.filter.applicable_table(&table_map.database, &table_map.table) {
            let schema = self.schema.get(&table_map.database, &table_map.table).ok_or_else(|| {
                FerryError::DecodeError(format!(
                    "no cached schema for {}.{}",
                    table_map.database, table_map.table
                ))
            })?;

            for image in self.parser.decode_rows(&rows, table_map, &schema)? {
                let event = DmlEvent::new(
                    dml_kind(rows.kind, image)?,
                    schema.clone(),
                    self.position.clone(),
                    self.current_query.clone(),
                    self.current_gtid.clone(),
                );
                if self.filter.applicable_event(&event)? {
                    self.pending.push(event);
                }
            }
        } else {
            debug!("Skipping rows event for {}.{}", table_map.database, table_map.table);
        }

        let statement_end = rows.is_statement_end();
        if self.boundary == BatchBoundary::Statement && !statement_end {
            return Ok(None);
        }

        let batch = self.make_batch();
        if statement_end {
            self.close_statement();
        }
        Ok(batch)
    }

    fn make_batch(&mut self) -> Option<DmlEventBatch> {
        DmlEventBatch::new(
            std::mem::take(&mut self.pending),
            self.current_query.clone(),
            self.position.clone(),
            self.statement_start.clone(),
        )
    }

    /// 경계 없이 멈출 때 모인 이벤트를 배치 하나로 내보냄
    pub fn take_partial(&mut self) -> Option<DmlEventBatch> {
        let batch = self.make_batch();
        self.close_statement();
        batch
    }

    /// 모인 이벤트를 버림. 재개 시 statement 시작 위치부터 다시 읽게 됩니다.
    pub fn discard_partial(&mut self) -> usize {
        let dropped = self.pending.len();
        if dropped > 0 {
            info!(
                "Discarding {} events of an unfinished statement, resume from {}",
                dropped, self.statement_start
            );
        }
        self.pending.clear();
        self.close_statement();
        dropped
    }
}

fn dml_kind(kind: RowsEventKind, image: RowImage) -> Result<DmlEventKind> {
    match (kind, image.before, image.after) {
        (RowsEventKind::Write, _, Some(new_values)) => Ok(DmlEventKind::Insert { new_values }),
        (RowsEventKind::Update, Some(old_values), Some(new_values)) => Ok(DmlEventKind::Update {
            old_values,
            new_values,
        }),
        (RowsEventKind::Delete, Some(old_values), _) => Ok(DmlEventKind::Delete { old_values }),
        (kind, _, _) => Err(FerryError::DecodeError(format!("incomplete {:?} row image", kind))),
    }
}
