//! MySQL 데이터베이스 연결 관리

use crate::error::{FerryError, Result};
use crate::marginalia;
use crate::offset::BinlogPosition;
use mysql_async::prelude::*;
use mysql_async::{Conn, Opts, OptsBuilder, Pool, Row};
use rand::Rng;
use std::env;
use std::time::Duration;
use tracing::{debug, info, warn};

/// 무작위 server id 생성 시 최대 시도 횟수
const MAX_SERVER_ID_ATTEMPTS: usize = 100;

/// MySQL 연결 설정
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    pub hostname: String,
    pub port: u16,
    pub username: String,
    pub password: String,
    pub database: Option<String>,
    /// 복제 식별자. 0이면 연결 시 무작위로 생성
    pub server_id: u32,
    pub timeout: Duration,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        ConnectionConfig {
            hostname: "localhost".to_string(),
            port: 3306,
            username: "root".to_string(),
            password: String::new(),
            database: None,
            server_id: 0,
            timeout: Duration::from_secs(30),
        }
    }
}

impl ConnectionConfig {
    pub fn new(hostname: impl Into<String>, username: impl Into<String>) -> Self {
        ConnectionConfig {
            hostname: hostname.into(),
            username: username.into(),
            ..Default::default()
        }
    }

    /// DB_HOST, DB_PORT, DB_USER, DB_PASSWORD, DB_NAME, SERVER_ID 환경 변수에서 읽기
    pub fn from_env() -> Result<Self> {
        let defaults = ConnectionConfig::default();

        let port = match env::var("DB_PORT") {
            Ok(p) => p
                .parse()
                .map_err(|_| FerryError::ConfigError(format!("Invalid DB_PORT: {}", p)))?,
            Err(_) => defaults.port,
        };
        let server_id = match env::var("SERVER_ID") {
            Ok(id) => id
                .parse()
                .map_err(|_| FerryError::ConfigError(format!("Invalid SERVER_ID: {}", id)))?,
            Err(_) => defaults.server_id,
        };

        Ok(ConnectionConfig {
            hostname: env::var("DB_HOST").unwrap_or(defaults.hostname),
            port,
            username: env::var("DB_USER").unwrap_or(defaults.username),
            password: env::var("DB_PASSWORD").unwrap_or(defaults.password),
            database: env::var("DB_NAME").ok(),
            server_id,
            timeout: defaults.timeout,
        })
    }

    fn build_opts(&self) -> Opts {
        let builder = OptsBuilder::default()
            .ip_or_hostname(self.hostname.clone())
            .tcp_port(self.port)
            .user(Some(self.username.clone()))
            .pass(Some(self.password.clone()))
            .db_name(self.database.clone());
        Opts::from(builder)
    }
}

/// MySQL 연결 래퍼 (소스 DB 핸들)
pub struct MySqlConnection {
    pool: Option<Pool>,
    config: ConnectionConfig,
}

impl MySqlConnection {
    /// 풀만 만들고 실제 연결은 첫 쿼리 때 맺습니다.
    pub fn new(config: ConnectionConfig) -> Self {
        let pool = Pool::new(config.build_opts());
        MySqlConnection {
            pool: Some(pool),
            config,
        }
    }

    /// 연결 후 서버 응답까지 확인
    pub async fn connect(config: ConnectionConfig) -> Result<Self> {
        let connection = MySqlConnection::new(config);
        let mut conn = connection.conn().await?;
        conn.ping()
            .await
            .map_err(|e| FerryError::ConnectionError(format!("Failed to ping MySQL: {}", e)))?;
        Ok(connection)
    }

    pub fn config(&self) -> &ConnectionConfig {
        &self.config
    }

    pub fn is_closed(&self) -> bool {
        self.pool.is_none()
    }

    async fn conn(&self) -> Result<Conn> {
        let pool = self
            .pool
            .as_ref()
            .ok_or_else(|| FerryError::ConnectionError("connection is closed".to_string()))?;

        tokio::time::timeout(self.config.timeout, pool.get_conn())
            .await
            .map_err(|_| {
                FerryError::ConnectionError(format!(
                    "Timed out connecting to {}:{}",
                    self.config.hostname, self.config.port
                ))
            })?
            .map_err(|e| FerryError::ConnectionError(format!("Failed to connect to MySQL: {}", e)))
    }

    async fn query_rows(&self, query: &str) -> Result<Vec<Row>> {
        let mut conn = self.conn().await?;
        conn.query(query)
            .await
            .map_err(|e| FerryError::QueryError(format!("Failed to run '{}': {}", query, e)))
    }

    /// 현재 binlog 헤드 위치 조회
    pub async fn get_binlog_status(&self) -> Result<BinlogStatus> {
        // MySQL 8.2+는 SHOW BINARY LOG STATUS, 그 이전은 SHOW MASTER STATUS
        let rows = match self.query_rows("SHOW BINARY LOG STATUS").await {
            Ok(rows) => rows,
            Err(FerryError::QueryError(_)) => self.query_rows("SHOW MASTER STATUS").await?,
            Err(e) => return Err(e),
        };

        let row = rows
            .into_iter()
            .next()
            .ok_or_else(|| FerryError::QueryError("No binlog status available".to_string()))?;

        let file: String = row.get(0).unwrap_or_default();
        if file.is_empty() {
            return Err(FerryError::QueryError(
                "Binary logging appears to be disabled on the source".to_string(),
            ));
        }

        Ok(BinlogStatus {
            file,
            position: row.get(1).unwrap_or(0),
            executed_gtid_set: row.get::<Option<String>, _>(4).flatten(),
        })
    }

    /// 소스 서버 자신의 server id
    pub async fn get_server_id(&self) -> Result<u32> {
        let mut conn = self.conn().await?;
        let result: Option<u32> = conn
            .query_first("SELECT @@server_id")
            .await
            .map_err(|e| FerryError::QueryError(format!("Failed to query server_id: {}", e)))?;

        result.ok_or_else(|| FerryError::QueryError("server_id not available".to_string()))
    }

    /// 현재 소스에 등록된 레플리카들의 server id
    pub async fn get_replica_server_ids(&self) -> Result<Vec<u32>> {
        let rows = match self.query_rows("SHOW REPLICAS").await {
            Ok(rows) => rows,
            Err(FerryError::QueryError(_)) => self.query_rows("SHOW SLAVE HOSTS").await?,
            Err(e) => return Err(e),
        };

        Ok(rows.iter().filter_map(|row| row.get::<u32, _>(0)).collect())
    }

    /// 다른 레플리카와 겹치지 않는 0이 아닌 server id 생성
    pub async fn generate_server_id(&self) -> Result<u32> {
        let own = self.get_server_id().await.map_err(identity_error)?;
        let taken = self.get_replica_server_ids().await.map_err(identity_error)?;
        debug!("Server id {} and replica ids {:?} are taken", own, taken);

        let mut rng = rand::thread_rng();
        pick_server_id(&mut rng, own, &taken)
    }

    /// 변수 조회
    pub async fn get_variable(&self, name: &str) -> Result<Option<String>> {
        let mut conn = self.conn().await?;
        let result: Option<(String, String)> = conn
            .exec_first("SHOW GLOBAL VARIABLES LIKE ?", (name,))
            .await
            .map_err(|e| FerryError::QueryError(format!("Failed to query {}: {}", name, e)))?;

        Ok(result.map(|(_, v)| v))
    }

    /// Binlog 형식 확인 (ROW, STATEMENT, MIXED)
    pub async fn get_binlog_format(&self) -> Result<String> {
        self.get_variable("binlog_format")
            .await?
            .ok_or_else(|| FerryError::QueryError("Binlog format not found".to_string()))
    }

    /// 행 이미지 형식 확인 (FULL, MINIMAL, NOBLOB)
    pub async fn get_binlog_row_image(&self) -> Result<String> {
        self.get_variable("binlog_row_image")
            .await?
            .ok_or_else(|| FerryError::QueryError("Binlog row image not found".to_string()))
    }

    /// 스트리밍에 필요한 binlog 설정 검증
    pub async fn verify_binlog_settings(&self) -> Result<()> {
        let format = self.get_binlog_format().await?;
        if !format.eq_ignore_ascii_case("ROW") {
            return Err(FerryError::ConfigError(format!(
                "binlog_format must be ROW, found {}",
                format
            )));
        }

        let row_image = self.get_binlog_row_image().await?;
        if !row_image.eq_ignore_ascii_case("FULL") {
            return Err(FerryError::ConfigError(format!(
                "binlog_row_image must be FULL, found {}",
                row_image
            )));
        }

        match self.get_variable("binlog_rows_query_log_events").await? {
            Some(v) if v.eq_ignore_ascii_case("ON") => {}
            _ => warn!("binlog_rows_query_log_events is not ON, batches will carry no statement text"),
        }

        info!("Binlog settings verified: format={}, row_image={}", format, row_image);
        Ok(())
    }

    /// 테이블 스키마 조회
    pub async fn get_table_schema(&self, database: &str, table: &str) -> Result<Vec<ColumnInfo>> {
        let mut conn = self.conn().await?;
        let result: Vec<(String, String, String, String, String)> = conn
            .exec(
                "SELECT COLUMN_NAME, COLUMN_TYPE, IS_NULLABLE, COLUMN_KEY, EXTRA \
                 FROM INFORMATION_SCHEMA.COLUMNS \
                 WHERE TABLE_SCHEMA = ? AND TABLE_NAME = ? \
                 ORDER BY ORDINAL_POSITION",
                (database, table),
            )
            .await
            .map_err(|e| FerryError::QueryError(format!("Failed to query table schema: {}", e)))?;

        Ok(result
            .into_iter()
            .map(|(name, column_type, is_nullable, column_key, extra)| ColumnInfo {
                name,
                column_type,
                nullable: is_nullable == "YES",
                column_key,
                extra,
            })
            .collect())
    }

    /// 모든 데이터베이스 나열
    pub async fn get_databases(&self) -> Result<Vec<String>> {
        let mut conn = self.conn().await?;
        let result: Vec<String> = conn
            .query("SHOW DATABASES")
            .await
            .map_err(|e| FerryError::QueryError(format!("Failed to query databases: {}", e)))?;

        Ok(result)
    }

    /// 데이터베이스의 모든 테이블 나열
    pub async fn get_tables(&self, database: &str) -> Result<Vec<String>> {
        let mut conn = self.conn().await?;
        let query = format!("SHOW TABLES FROM `{}`", database.replace('`', "``"));
        let result: Vec<String> = conn
            .query(&query)
            .await
            .map_err(|e| FerryError::QueryError(format!("Failed to query tables: {}", e)))?;

        Ok(result)
    }

    /// 추적 주석을 붙여 문장 실행
    pub async fn execute_annotated(&self, marginalia: &str, statement: &str) -> Result<()> {
        let mut conn = self.conn().await?;
        conn.query_drop(marginalia::annotate(marginalia, statement))
            .await
            .map_err(|e| FerryError::QueryError(format!("Failed to execute statement: {}", e)))
    }

    pub async fn close(&mut self) -> Result<()> {
        if let Some(pool) = self.pool.take() {
            pool.disconnect()
                .await
                .map_err(|e| FerryError::ConnectionError(format!("Failed to close pool: {}", e)))?;
        }
        Ok(())
    }
}

fn identity_error(err: FerryError) -> FerryError {
    match err {
        FerryError::ConnectionError(_) => err,
        other => FerryError::IdentityGenerationError(other.to_string()),
    }
}

/// 0, 소스 자신의 id, 이미 등록된 id를 피해 무작위 id 선택
pub fn pick_server_id<R: Rng>(rng: &mut R, own: u32, taken: &[u32]) -> Result<u32> {
    for _ in 0..MAX_SERVER_ID_ATTEMPTS {
        let candidate: u32 = rng.gen();
        if candidate != 0 && candidate != own && !taken.contains(&candidate) {
            return Ok(candidate);
        }
    }

    Err(FerryError::IdentityGenerationError(format!(
        "no free server id after {} attempts",
        MAX_SERVER_ID_ATTEMPTS
    )))
}

/// Binlog 상태
#[derive(Debug, Clone)]
pub struct BinlogStatus {
    pub file: String,
    pub position: u64,
    pub executed_gtid_set: Option<String>,
}

impl BinlogStatus {
    pub fn binlog_position(&self) -> BinlogPosition {
        BinlogPosition::new(self.file.clone(), self.position)
    }
}

/// 테이블 컬럼 정보
#[derive(Debug, Clone, PartialEq)]
pub struct ColumnInfo {
    pub name: String,
    /// INFORMATION_SCHEMA의 COLUMN_TYPE (e.g., "int(10) unsigned")
    pub column_type: String,
    pub nullable: bool,
    pub column_key: String,
    pub extra: String,
}

impl ColumnInfo {
    pub fn is_primary_key(&self) -> bool {
        self.column_key == "PRI"
    }

    pub fn is_unsigned(&self) -> bool {
        self.column_type.to_ascii_lowercase().contains("unsigned")
    }

    /// 문자셋이 없는 바이너리 컬럼 여부
    pub fn is_binary(&self) -> bool {
        let column_type = self.column_type.to_ascii_lowercase();
        column_type.starts_with("binary")
            || column_type.starts_with("varbinary")
            || column_type.ends_with("blob")
            || column_type.starts_with("geometry")
    }
}
