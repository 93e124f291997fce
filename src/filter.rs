//! 복제 대상 필터
//!
//! 데이터베이스/테이블 단위로 변경 사항을 복제할지 결정합니다.
//! 필요하면 행 단위로도 걸러낼 수 있습니다.

use crate::error::Result;
use crate::events::DmlEvent;

/// 시스템 스키마는 항상 제외
pub const SYSTEM_DATABASES: &[&str] = &["mysql", "information_schema", "performance_schema", "sys"];

pub trait TableFilter: Send + Sync {
    fn applicable_database(&self, database: &str) -> bool;

    fn applicable_table(&self, database: &str, table: &str) -> bool;

    /// 행 단위 필터 (기본값: 모두 포함)
    fn applicable_event(&self, _event: &DmlEvent) -> Result<bool> {
        Ok(true)
    }
}

/// 데이터베이스 목록과 선택적인 테이블 목록으로 거르는 기본 필터
#[derive(Debug, Clone, Default)]
pub struct DatabaseTableFilter {
    pub databases: Vec<String>,
    /// None이면 대상 데이터베이스의 모든 테이블
    pub tables: Option<Vec<String>>,
}

impl DatabaseTableFilter {
    pub fn new(databases: Vec<String>) -> Self {
        DatabaseTableFilter {
            databases,
            tables: None,
        }
    }

    pub fn with_tables(mut self, tables: Vec<String>) -> Self {
        self.tables = Some(tables);
        self
    }
}

impl TableFilter for DatabaseTableFilter {
    fn applicable_database(&self, database: &str) -> bool {
        if SYSTEM_DATABASES.contains(&database) {
            return false;
        }
        self.databases.iter().any(|db| db == database)
    }

    fn applicable_table(&self, database: &str, table: &str) -> bool {
        if !self.applicable_database(database) {
            return false;
        }
        match self.tables {
            Some(ref tables) => tables.iter().any(|t| t == table),
            None => true,
        }
    }
}
