//! 테이블 스키마 캐시
//!
//! 스트리밍 시작 전에 한 번 로드되고, 이후에는 읽기 전용으로 사용됩니다.
//! binlog의 테이블 맵에는 컬럼명과 부호 여부가 없으므로 이 캐시로 보완합니다.

use crate::connection::{ColumnInfo, MySqlConnection};
use crate::error::Result;
use crate::filter::TableFilter;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// 테이블 메타데이터
#[derive(Debug, Clone, PartialEq)]
pub struct TableSchema {
    pub database: String,
    pub name: String,
    pub columns: Vec<ColumnInfo>,
    pub primary_key: Vec<String>,
}

impl TableSchema {
    pub fn new(database: impl Into<String>, name: impl Into<String>, columns: Vec<ColumnInfo>) -> Self {
        let primary_key = columns
            .iter()
            .filter(|c| c.is_primary_key())
            .map(|c| c.name.clone())
            .collect();
        TableSchema {
            database: database.into(),
            name: name.into(),
            columns,
            primary_key,
        }
    }

    /// "database.table"
    pub fn qualified_name(&self) -> String {
        table_key(&self.database, &self.name)
    }

    pub fn column_index(&self, column: &str) -> Option<usize> {
        self.columns.iter().position(|c| c.name == column)
    }
}

fn table_key(database: &str, table: &str) -> String {
    format!("{}.{}", database, table)
}

#[derive(Debug, Clone, Default)]
pub struct TableSchemaCache {
    tables: HashMap<String, Arc<TableSchema>>,
}

impl TableSchemaCache {
    pub fn new() -> Self {
        TableSchemaCache::default()
    }

    pub fn insert(&mut self, schema: TableSchema) {
        self.tables.insert(schema.qualified_name(), Arc::new(schema));
    }

    pub fn get(&self, database: &str, table: &str) -> Option<Arc<TableSchema>> {
        self.tables.get(&table_key(database, table)).cloned()
    }

    pub fn len(&self) -> usize {
        self.tables.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tables.is_empty()
    }

    pub fn table_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.tables.keys().cloned().collect();
        names.sort();
        names
    }

    /// 필터에 해당하는 모든 테이블의 스키마 로드
    pub async fn load_tables(conn: &MySqlConnection, filter: &dyn TableFilter) -> Result<Self> {
        let mut cache = TableSchemaCache::new();

        let databases: Vec<String> = conn
            .get_databases()
            .await?
            .into_iter()
            .filter(|db| filter.applicable_database(db))
            .collect();

        info!("Loading table schemas for databases: {:?}", databases);

        for database in &databases {
            // 데이터베이스에서 테이블 조회
            let tables = match conn.get_tables(database).await {
                Ok(t) => t,
                Err(e) => {
                    warn!("Failed to get tables from {}: {}", database, e);
                    continue;
                }
            };

            for table in tables {
                if !filter.applicable_table(database, &table) {
                    debug!("Skipping {}.{} (filtered)", database, table);
                    continue;
                }

                let columns = conn.get_table_schema(database, &table).await?;
                debug!("Loaded schema for {}.{} ({} columns)", database, table, columns.len());
                cache.insert(TableSchema::new(database.clone(), table, columns));
            }
        }

        info!("Loaded schemas for {} tables", cache.len());
        Ok(cache)
    }
}
