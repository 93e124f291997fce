/// mysql_ferry 스트리머 실행 예제
///
/// 소스의 binlog를 읽어 문장 단위 배치를 로그로 남기고, 처리한 위치를
/// 체크포인트 파일(FERRY_STATE_FILE)에 기록합니다. Ctrl-C로 종료합니다.
use mysql_ferry::{
    BinlogStreamer, ConnectionConfig, DatabaseTableFilter, DmlEventBatch, FerryError,
    LoggingErrorHandler, MySqlConnection, SerializableState, StateTracker, StreamerConfig,
    TableSchemaCache,
};
use std::env;
use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // 로깅 초기화 (RUST_LOG)
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let connection = ConnectionConfig::from_env()?;
    let database = connection
        .database
        .clone()
        .ok_or_else(|| FerryError::ConfigError("DB_NAME is required".to_string()))?;
    let config = StreamerConfig {
        connection,
        ..Default::default()
    };

    let state_file = env::var("FERRY_STATE_FILE").ok();
    let state = match &state_file {
        Some(path) => match tokio::fs::read_to_string(path).await {
            Ok(json) => {
                info!("Loaded checkpoint from {}", path);
                SerializableState::from_json(&json)?
            }
            Err(e) => {
                warn!("No checkpoint at {} ({}), starting from the source head", path, e);
                SerializableState::new()
            }
        },
        None => SerializableState::new(),
    };
    let resume_from = state.min_source_binlog_position();
    let tracker = Arc::new(StateTracker::from_serialized(state));

    info!(
        "Connecting to {}:{}",
        config.connection.hostname, config.connection.port
    );
    let db = MySqlConnection::connect(config.connection.clone()).await?;
    db.verify_binlog_settings().await?;

    let filter = Arc::new(DatabaseTableFilter::new(vec![database]));
    let schema = TableSchemaCache::load_tables(&db, filter.as_ref()).await?;
    info!(
        "Loaded {} table schemas: {}",
        schema.len(),
        schema.table_names().join(", ")
    );

    let mut streamer = BinlogStreamer::new(db, config, Arc::new(schema), filter)
        .with_error_handler(Arc::new(LoggingErrorHandler::with_state(tracker.clone())));

    let progress = tracker.clone();
    streamer.add_event_listener(move |batch: &DmlEventBatch| -> mysql_ferry::Result<()> {
        let first = &batch.events()[0];
        info!(
            "{} {} rows on {}.{} at {}: {}",
            first.op().as_str(),
            batch.len(),
            first.database(),
            first.table_name(),
            batch.position(),
            batch.original_statement().unwrap_or("<no statement text>")
        );
        progress.update_last_written_binlog_position(batch.resumable_position().clone());
        Ok(())
    });

    let start = streamer
        .connect_binlog_streamer_to_mysql_from(resume_from)
        .await?;
    info!("Streaming from {} as server id {}", start, streamer.my_server_id());

    let handle = streamer.handle();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Ctrl-C received");
            handle.flush_and_stop();
        }
    });

    let result = streamer.run().await;

    if let Some(path) = &state_file {
        tokio::fs::write(path, tracker.serialize().to_json()?).await?;
        info!("Checkpoint written to {}", path);
    }

    result?;
    Ok(())
}
