//! Binlog 스트리머 - 연결, 배치, 리스너 전달, 종료 제어
//!
//! 스트리머는 다음 순서로 동작합니다:
//! 1. 레플리카 id 확보 (0이면 생성)
//! 2. 시작 위치 결정 (미설정이면 소스의 현재 head)
//! 3. COM_BINLOG_DUMP로 원시 이벤트 수신 시작
//! 4. `run()`에서 문장 단위 배치를 만들어 리스너에게 전달
//!
//! `StreamerHandle::flush_and_stop()`은 진행 중인 배치 전달을 마친 뒤 루프를 멈춥니다.

use crate::batcher::{BatchBoundary, EventBatcher};
use crate::binlog::{BinlogParser, CHECKSUM_ALG_CRC32, CHECKSUM_ALG_OFF};
use crate::binlog_client::{BinlogClient, RawEventReceiver};
use crate::connection::{ConnectionConfig, MySqlConnection};
use crate::error::{ErrorHandler, FerryError, LoggingErrorHandler, Result};
use crate::filter::TableFilter;
use crate::listener::{EventListener, ListenerSet};
use crate::marginalia;
use crate::offset::BinlogPosition;
use crate::schema::TableSchemaCache;
use parking_lot::{Mutex, RwLock};
use std::fmt;
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// 종료 시 끝나지 않은 문장의 처리 방식
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum PartialStatementPolicy {
    /// 버리고 재개 위치에서 다시 읽음
    #[default]
    Discard,
    /// 모인 이벤트를 마지막 배치로 전달
    Flush,
}

/// 스트리머 설정
#[derive(Debug, Clone)]
pub struct StreamerConfig {
    /// 복제 연결 정보
    pub connection: ConnectionConfig,
    /// writer가 문장에 붙이는 추적 주석
    pub marginalia: String,
    pub batch_boundary: BatchBoundary,
    pub partial_statement_policy: PartialStatementPolicy,
    /// 리더 태스크와 실행 루프 사이 채널 크기
    pub event_buffer_size: usize,
}

impl Default for StreamerConfig {
    fn default() -> Self {
        StreamerConfig {
            connection: ConnectionConfig::default(),
            marginalia: marginalia::DEFAULT_MARGINALIA.to_string(),
            batch_boundary: BatchBoundary::default(),
            partial_statement_policy: PartialStatementPolicy::default(),
            event_buffer_size: 1024,
        }
    }
}

/// 스트리머 상태
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamerState {
    Idle,
    Connected,
    Running,
    Stopping,
    Stopped,
}

impl fmt::Display for StreamerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            StreamerState::Idle => "idle",
            StreamerState::Connected => "connected",
            StreamerState::Running => "running",
            StreamerState::Stopping => "stopping",
            StreamerState::Stopped => "stopped",
        };
        f.write_str(name)
    }
}

/// 실행 루프와 핸들이 공유하는 제어 상태
struct StreamControl {
    state: Mutex<StreamerState>,
    stop_tx: watch::Sender<bool>,
    last_streamed: RwLock<BinlogPosition>,
}

impl StreamControl {
    fn new() -> Self {
        let (stop_tx, _) = watch::channel(false);
        StreamControl {
            state: Mutex::new(StreamerState::Idle),
            stop_tx,
            last_streamed: RwLock::new(BinlogPosition::unset()),
        }
    }

    fn state(&self) -> StreamerState {
        *self.state.lock()
    }

    fn set_state(&self, state: StreamerState) {
        *self.state.lock() = state;
    }

    fn flush_and_stop(&self) {
        {
            let mut state = self.state.lock();
            if *state != StreamerState::Running {
                debug!("flush_and_stop ignored, streamer is {}", state);
                return;
            }
            *state = StreamerState::Stopping;
        }
        info!("Stop requested, finishing the in-flight batch");
        self.stop_tx.send_replace(true);
    }
}

/// 다른 태스크나 리스너 안에서 스트리머를 제어하는 핸들
#[derive(Clone)]
pub struct StreamerHandle {
    control: Arc<StreamControl>,
}

impl StreamerHandle {
    /// 실행 중일 때만 종료를 요청합니다. 그 외 상태에서는 아무 일도 하지 않습니다.
    pub fn flush_and_stop(&self) {
        self.control.flush_and_stop();
    }

    pub fn state(&self) -> StreamerState {
        self.control.state()
    }

    pub fn last_streamed_binlog_position(&self) -> BinlogPosition {
        self.control.last_streamed.read().clone()
    }
}

/// Binlog 스트리머
pub struct BinlogStreamer {
    db: MySqlConnection,
    config: StreamerConfig,
    my_server_id: u32,
    table_schema: Arc<TableSchemaCache>,
    filter: Arc<dyn TableFilter>,
    error_handler: Arc<dyn ErrorHandler>,
    listeners: ListenerSet,
    batcher: Option<EventBatcher>,
    stream: Option<RawEventReceiver>,
    reader: Option<JoinHandle<()>>,
    control: Arc<StreamControl>,
}

impl BinlogStreamer {
    /// 새 스트리머 생성. 레플리카 id는 설정의 server_id에서 시작합니다.
    pub fn new(
        db: MySqlConnection,
        config: StreamerConfig,
        table_schema: Arc<TableSchemaCache>,
        filter: Arc<dyn TableFilter>,
    ) -> Self {
        BinlogStreamer {
            db,
            my_server_id: config.connection.server_id,
            config,
            table_schema,
            filter,
            error_handler: Arc::new(LoggingErrorHandler::new()),
            listeners: ListenerSet::new(),
            batcher: None,
            stream: None,
            reader: None,
            control: Arc::new(StreamControl::new()),
        }
    }

    pub fn with_error_handler(mut self, error_handler: Arc<dyn ErrorHandler>) -> Self {
        self.error_handler = error_handler;
        self
    }

    pub fn handle(&self) -> StreamerHandle {
        StreamerHandle {
            control: self.control.clone(),
        }
    }

    /// 소스에 등록된 레플리카 id (연결 전이면 0일 수 있음)
    pub fn my_server_id(&self) -> u32 {
        self.my_server_id
    }

    pub fn state(&self) -> StreamerState {
        self.control.state()
    }

    pub fn add_event_listener<L: EventListener + 'static>(&mut self, listener: L) {
        self.listeners.add(listener);
    }

    pub fn flush_and_stop(&self) {
        self.control.flush_and_stop();
    }

    /// 마지막으로 처리를 마친 원시 이벤트 다음 위치
    pub fn last_streamed_binlog_position(&self) -> BinlogPosition {
        self.control.last_streamed.read().clone()
    }

    /// 소스의 현재 head부터 스트리밍
    pub async fn connect_binlog_streamer_to_mysql(&mut self) -> Result<BinlogPosition> {
        self.connect_binlog_streamer_to_mysql_from(BinlogPosition::unset())
            .await
    }

    /// 주어진 위치부터 스트리밍. 실제로 사용한 시작 위치를 반환합니다.
    pub async fn connect_binlog_streamer_to_mysql_from(&mut self, start: BinlogPosition) -> Result<BinlogPosition> {
        let state = self.state();
        if matches!(state, StreamerState::Running | StreamerState::Stopping) {
            return Err(FerryError::ConnectionError(format!(
                "cannot reconnect while the streamer is {}",
                state
            )));
        }

        let server_id = if self.my_server_id == 0 {
            let generated = self.db.generate_server_id().await?;
            info!("Generated replica server id {}", generated);
            generated
        } else {
            self.my_server_id
        };

        let start = if start.is_unset() {
            let status = self.db.get_binlog_status().await?;
            debug!(
                "Source binlog head: {}:{} (gtid_executed={})",
                status.file,
                status.position,
                status.executed_gtid_set.as_deref().unwrap_or("-")
            );
            status.binlog_position()
        } else {
            start
        };

        let checksum = self.db.get_variable("binlog_checksum").await?;
        let parser = BinlogParser::with_checksum(checksum_alg(checksum.as_deref()));

        let client = BinlogClient::new(self.config.connection.clone(), server_id);
        let (stream, reader) = client
            .start_streaming(&start, self.config.event_buffer_size)
            .await?;

        self.my_server_id = server_id;
        self.attach_stream(stream, reader, parser, start.clone());
        info!("Binlog streamer connected at {} (server_id={})", start, server_id);
        Ok(start)
    }

    /// 원시 이벤트 채널을 붙이고 Connected 상태로 전환
    pub(crate) fn attach_stream(
        &mut self,
        stream: RawEventReceiver,
        reader: JoinHandle<()>,
        parser: BinlogParser,
        start: BinlogPosition,
    ) {
        if let Some(previous) = self.reader.take() {
            previous.abort();
        }

        self.batcher = Some(EventBatcher::new(
            parser,
            self.table_schema.clone(),
            self.filter.clone(),
            self.config.batch_boundary,
            start.clone(),
        ));
        self.stream = Some(stream);
        self.reader = Some(reader);
        *self.control.last_streamed.write() = start;
        self.control.set_state(StreamerState::Connected);
    }

    /// 종료 요청, 리스너 에러, 연결 또는 디코딩 에러가 날 때까지 배치를 전달합니다.
    pub async fn run(&mut self) -> Result<()> {
        {
            let mut state = self.control.state.lock();
            if *state != StreamerState::Connected {
                return Err(FerryError::NotConnected(state.to_string()));
            }
            *state = StreamerState::Running;
            // 이전 실행의 종료 요청은 새 실행에 남기지 않음
            self.control.stop_tx.send_replace(false);
        }
        info!("Starting binlog streamer at {}", self.last_streamed_binlog_position());
        if self.listeners.is_empty() {
            warn!("No event listeners registered, batches will be dropped");
        }

        let result = self.stream_loop().await;

        if let Some(reader) = self.reader.take() {
            reader.abort();
        }
        self.stream = None;
        self.control.set_state(StreamerState::Stopped);

        match &result {
            Ok(()) => info!(
                "Binlog streamer stopped at {}",
                self.last_streamed_binlog_position()
            ),
            Err(e) => self.error_handler.fatal("binlog_streamer", e),
        }
        result
    }

    async fn stream_loop(&mut self) -> Result<()> {
        let mut stop_rx = self.control.stop_tx.subscribe();
        let (stream, batcher) = match (self.stream.as_mut(), self.batcher.as_mut()) {
            (Some(stream), Some(batcher)) => (stream, batcher),
            _ => return Err(FerryError::NotConnected("no binlog stream attached".to_string())),
        };

        loop {
            if *stop_rx.borrow_and_update() {
                break;
            }

            let item = tokio::select! {
                biased;
                _ = stop_rx.changed() => continue,
                item = stream.recv() => item,
            };

            let raw = match item {
                Some(raw) => raw?,
                None => {
                    return Err(FerryError::ConnectionError(
                        "binlog stream closed".to_string(),
                    ))
                }
            };

            if let Some(batch) = batcher.handle(&raw)? {
                debug!("Dispatching batch of {} events at {}", batch.len(), batch.position());
                self.listeners.dispatch(&batch)?;
            }
            *self.control.last_streamed.write() = batcher.position().clone();
        }

        match self.config.partial_statement_policy {
            PartialStatementPolicy::Flush => {
                if let Some(batch) = batcher.take_partial() {
                    warn!("Flushing {} events of an unfinished statement", batch.len());
                    self.listeners.dispatch(&batch)?;
                }
            }
            PartialStatementPolicy::Discard => {
                batcher.discard_partial();
            }
        }
        Ok(())
    }
}

fn checksum_alg(binlog_checksum: Option<&str>) -> u8 {
    match binlog_checksum {
        Some(value) if value.eq_ignore_ascii_case("CRC32") => CHECKSUM_ALG_CRC32,
        _ => CHECKSUM_ALG_OFF,
    }
}

impl Drop for BinlogStreamer {
    fn drop(&mut self) {
        if let Some(reader) = self.reader.take() {
            reader.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::DmlEventBatch;
    use crate::test_utils::{self, EventBuilder, TEST_TABLE_ID};
    use bytes::Bytes;
    use std::time::Duration;
    use tokio::sync::mpsc;

    const FILE: &str = "mysql-bin.000001";

    #[derive(Default)]
    struct RecordingHandler {
        errors: Mutex<Vec<String>>,
    }

    impl ErrorHandler for RecordingHandler {
        fn fatal(&self, from: &str, err: &FerryError) {
            self.errors.lock().push(format!("{}: {}", from, err));
        }
    }

    fn streamer(boundary: BatchBoundary, policy: PartialStatementPolicy) -> BinlogStreamer {
        let config = StreamerConfig {
            batch_boundary: boundary,
            partial_statement_policy: policy,
            ..Default::default()
        };
        BinlogStreamer::new(
            MySqlConnection::new(config.connection.clone()),
            config,
            Arc::new(test_utils::test_schema_cache()),
            test_utils::test_filter(),
        )
    }

    async fn attach(streamer: &mut BinlogStreamer, events: Vec<Vec<u8>>) -> mpsc::Sender<Result<Bytes>> {
        let (tx, rx) = mpsc::channel(events.len() + 8);
        for event in events {
            tx.send(Ok(Bytes::from(event))).await.unwrap();
        }
        let reader = tokio::spawn(async {});
        streamer.attach_stream(rx, reader, BinlogParser::new(), BinlogPosition::new(FILE, 4));
        tx
    }

    fn collect_batches(streamer: &mut BinlogStreamer) -> Arc<Mutex<Vec<DmlEventBatch>>> {
        let batches = Arc::new(Mutex::new(Vec::new()));
        let sink = batches.clone();
        streamer.add_event_listener(move |batch: &DmlEventBatch| -> Result<()> {
            sink.lock().push(batch.clone());
            Ok(())
        });
        batches
    }

    /// n개 배치를 받으면 스스로 종료 요청
    fn stop_after(streamer: &mut BinlogStreamer, n: usize) {
        let handle = streamer.handle();
        let mut seen = 0;
        streamer.add_event_listener(move |_: &DmlEventBatch| -> Result<()> {
            seen += 1;
            if seen == n {
                handle.flush_and_stop();
            }
            Ok(())
        });
    }

    #[tokio::test]
    async fn test_run_requires_connection() {
        let mut streamer = streamer(BatchBoundary::Statement, PartialStatementPolicy::Discard);
        assert_eq!(streamer.state(), StreamerState::Idle);
        assert!(streamer.last_streamed_binlog_position().is_unset());

        let err = streamer.run().await.unwrap_err();
        assert!(matches!(err, FerryError::NotConnected(_)));
        assert_eq!(streamer.state(), StreamerState::Idle);
    }

    #[tokio::test]
    async fn test_flush_and_stop_when_not_running_is_noop() {
        let mut streamer = streamer(BatchBoundary::Statement, PartialStatementPolicy::Discard);
        streamer.flush_and_stop();
        assert_eq!(streamer.state(), StreamerState::Idle);

        let _tx = attach(&mut streamer, Vec::new()).await;
        streamer.handle().flush_and_stop();
        assert_eq!(streamer.state(), StreamerState::Connected);
        assert_eq!(streamer.last_streamed_binlog_position(), BinlogPosition::new(FILE, 4));
    }

    #[tokio::test]
    async fn test_single_insert_batch() {
        let mut builder = EventBuilder::new(4);
        let mut streamer = streamer(BatchBoundary::Statement, PartialStatementPolicy::Discard);
        let query = marginalia::annotate(
            "application:test",
            "INSERT INTO gftest.test_table_1 (data) VALUES ('hello')",
        );

        let _tx = attach(&mut streamer, builder.insert_statement(&query, &[(1, "hello")])).await;
        let batches = collect_batches(&mut streamer);
        stop_after(&mut streamer, 1);

        streamer.run().await.unwrap();

        let batches = batches.lock();
        assert_eq!(batches.len(), 1);
        assert_eq!(batches[0].len(), 1);
        assert_eq!(batches[0].query(), Some(query.as_str()));
        assert!(!batches[0].position().is_unset());
        assert_eq!(streamer.state(), StreamerState::Stopped);
        assert_eq!(
            streamer.last_streamed_binlog_position(),
            BinlogPosition::new(FILE, builder.position())
        );
    }

    #[tokio::test]
    async fn test_two_inserts_in_order() {
        let mut builder = EventBuilder::new(4);
        let mut streamer = streamer(BatchBoundary::Statement, PartialStatementPolicy::Discard);
        let first = marginalia::annotate("application:test", "INSERT INTO gftest.test_table_1 VALUES (1, 'a')");
        let second = marginalia::annotate("application:test", "INSERT INTO gftest.test_table_1 VALUES (2, 'b')");

        let mut events = builder.insert_statement(&first, &[(1, "a")]);
        events.push(builder.xid(1));
        events.extend(builder.insert_statement(&second, &[(2, "b")]));
        events.push(builder.xid(2));

        let _tx = attach(&mut streamer, events).await;
        let batches = collect_batches(&mut streamer);
        stop_after(&mut streamer, 2);

        streamer.run().await.unwrap();

        let queries: Vec<_> = batches
            .lock()
            .iter()
            .map(|b| b.query().unwrap_or_default().to_string())
            .collect();
        assert_eq!(queries, vec![first, second]);
    }

    #[tokio::test]
    async fn test_fragmented_insert_in_rows_event_mode() {
        const ROWS: usize = 10_000;
        const FRAGMENT: usize = 2_500;

        let mut builder = EventBuilder::new(4);
        let mut streamer = streamer(BatchBoundary::RowsEvent, PartialStatementPolicy::Discard);
        let query = marginalia::annotate("application:test", "INSERT INTO gftest.test_table_1 (data) SELECT ...");

        let values: Vec<(i32, String)> = (0..ROWS).map(|i| (i as i32, format!("row{}", i))).collect();
        let rows: Vec<(i32, &str)> = values.iter().map(|(id, data)| (*id, data.as_str())).collect();

        let mut events = vec![builder.rows_query(&query), builder.table_map(TEST_TABLE_ID)];
        let fragments: Vec<_> = rows.chunks(FRAGMENT).collect();
        for (i, fragment) in fragments.iter().enumerate() {
            events.push(builder.write_rows(TEST_TABLE_ID, fragment, i == fragments.len() - 1));
        }

        let _tx = attach(&mut streamer, events).await;
        let batches = collect_batches(&mut streamer);
        stop_after(&mut streamer, fragments.len());

        streamer.run().await.unwrap();

        let batches = batches.lock();
        assert_eq!(batches.iter().map(|b| b.len()).sum::<usize>(), ROWS);
        assert!(batches.iter().all(|b| b.len() < ROWS));
        assert!(batches.iter().all(|b| b.query() == Some(query.as_str())));
    }

    #[tokio::test]
    async fn test_stop_from_listener_ends_delivery() {
        let mut builder = EventBuilder::new(4);
        let mut streamer = streamer(BatchBoundary::Statement, PartialStatementPolicy::Discard);

        let mut events = builder.insert_statement("INSERT 1", &[(1, "a")]);
        events.extend(builder.insert_statement("INSERT 2", &[(2, "b")]));

        let _tx = attach(&mut streamer, events).await;
        stop_after(&mut streamer, 1);
        let batches = collect_batches(&mut streamer);

        streamer.run().await.unwrap();

        // 종료를 요청한 배치도 뒤에 등록된 리스너까지 전달됨
        let batches = batches.lock();
        assert_eq!(batches.len(), 1);
        assert_eq!(batches[0].query(), Some("INSERT 1"));
    }

    #[tokio::test]
    async fn test_listener_error_stops_run() {
        let mut builder = EventBuilder::new(4);
        let handler = Arc::new(RecordingHandler::default());
        let mut streamer = streamer(BatchBoundary::Statement, PartialStatementPolicy::Discard)
            .with_error_handler(handler.clone());

        let mut events = builder.insert_statement("INSERT 1", &[(1, "a")]);
        events.extend(builder.insert_statement("INSERT 2", &[(2, "b")]));
        let _tx = attach(&mut streamer, events).await;

        let calls = Arc::new(Mutex::new(0));
        let counter = calls.clone();
        streamer.add_event_listener(move |_: &DmlEventBatch| -> Result<()> {
            *counter.lock() += 1;
            Err(FerryError::listener("target rejected the batch"))
        });

        let err = streamer.run().await.unwrap_err();
        assert!(matches!(err, FerryError::ListenerError(ref msg) if msg == "target rejected the batch"));
        assert_eq!(*calls.lock(), 1);
        assert_eq!(streamer.state(), StreamerState::Stopped);
        assert_eq!(handler.errors.lock().len(), 1);
    }

    #[tokio::test]
    async fn test_closed_stream_is_connection_error() {
        let mut builder = EventBuilder::new(4);
        let mut streamer = streamer(BatchBoundary::Statement, PartialStatementPolicy::Discard);

        let tx = attach(&mut streamer, builder.insert_statement("INSERT 1", &[(1, "a")])).await;
        drop(tx);
        let batches = collect_batches(&mut streamer);

        let err = streamer.run().await.unwrap_err();
        assert!(matches!(err, FerryError::ConnectionError(_)));
        assert_eq!(batches.lock().len(), 1);
    }

    #[tokio::test]
    async fn test_reader_error_is_returned() {
        let mut streamer = streamer(BatchBoundary::Statement, PartialStatementPolicy::Discard);
        let tx = attach(&mut streamer, Vec::new()).await;
        tx.send(Err(FerryError::ConnectionError("Binlog stream error: gone".to_string())))
            .await
            .unwrap();

        let err = streamer.run().await.unwrap_err();
        assert_eq!(err.to_string(), FerryError::ConnectionError("Binlog stream error: gone".to_string()).to_string());
    }

    #[tokio::test]
    async fn test_run_again_after_stop_and_reattach() {
        let mut builder = EventBuilder::new(4);
        let mut streamer = streamer(BatchBoundary::Statement, PartialStatementPolicy::Discard);
        let first = builder.insert_statement("INSERT INTO gftest.test_table_1 VALUES (1, 'a')", &[(1, "a")]);

        let _first_tx = attach(&mut streamer, first).await;
        let batches = collect_batches(&mut streamer);
        stop_after(&mut streamer, 1);
        streamer.run().await.unwrap();
        assert_eq!(streamer.state(), StreamerState::Stopped);

        let second = builder.insert_statement("INSERT INTO gftest.test_table_1 VALUES (2, 'b')", &[(2, "b")]);
        let second_tx = attach(&mut streamer, second).await;
        drop(second_tx);

        let err = streamer.run().await.unwrap_err();
        assert!(matches!(err, FerryError::ConnectionError(_)));
        let batches = batches.lock();
        assert_eq!(batches.len(), 2);
        assert_eq!(batches[1].query(), Some("INSERT INTO gftest.test_table_1 VALUES (2, 'b')"));
    }

    #[tokio::test]
    async fn test_drop_aborts_reader_task() {
        let mut streamer = streamer(BatchBoundary::Statement, PartialStatementPolicy::Discard);
        let (_tx, rx) = mpsc::channel(1);
        let (alive_tx, alive_rx) = tokio::sync::oneshot::channel::<()>();
        let reader = tokio::spawn(async move {
            let _alive = alive_tx;
            std::future::pending::<()>().await;
        });
        streamer.attach_stream(rx, reader, BinlogParser::new(), BinlogPosition::new(FILE, 4));

        drop(streamer);
        let closed = tokio::time::timeout(Duration::from_secs(5), alive_rx).await.unwrap();
        assert!(closed.is_err());
    }

    /// 끝나지 않은 문장을 흘려 넣고, 모두 처리된 뒤 종료 요청
    async fn run_with_partial(policy: PartialStatementPolicy) -> Vec<DmlEventBatch> {
        let mut builder = EventBuilder::new(4);
        let mut streamer = streamer(BatchBoundary::Statement, policy);
        let events = vec![
            builder.rows_query("INSERT ..."),
            builder.table_map(TEST_TABLE_ID),
            builder.write_rows(TEST_TABLE_ID, &[(1, "a"), (2, "b")], false),
        ];
        let end = BinlogPosition::new(FILE, builder.position());

        let _tx = attach(&mut streamer, events).await;
        let batches = collect_batches(&mut streamer);
        let handle = streamer.handle();

        let task = tokio::spawn(async move { streamer.run().await });

        tokio::time::timeout(Duration::from_secs(5), async {
            while handle.last_streamed_binlog_position() != end {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();

        handle.flush_and_stop();
        task.await.unwrap().unwrap();
        assert_eq!(handle.state(), StreamerState::Stopped);

        let batches = batches.lock().clone();
        batches
    }

    #[tokio::test]
    async fn test_partial_statement_discarded_on_stop() {
        let batches = run_with_partial(PartialStatementPolicy::Discard).await;
        assert!(batches.is_empty());
    }

    #[tokio::test]
    async fn test_partial_statement_flushed_on_stop() {
        let batches = run_with_partial(PartialStatementPolicy::Flush).await;
        assert_eq!(batches.len(), 1);
        assert_eq!(batches[0].len(), 2);
        assert_eq!(batches[0].query(), Some("INSERT ..."));
        assert_eq!(batches[0].resumable_position(), &BinlogPosition::new(FILE, 4));
    }

    #[tokio::test]
    async fn test_failed_connect_keeps_zero_identity() {
        let mut db = MySqlConnection::new(ConnectionConfig::default());
        db.close().await.unwrap();
        let mut streamer = BinlogStreamer::new(
            db,
            StreamerConfig::default(),
            Arc::new(test_utils::test_schema_cache()),
            test_utils::test_filter(),
        );

        let err = streamer.connect_binlog_streamer_to_mysql().await.unwrap_err();
        assert!(matches!(err, FerryError::ConnectionError(_)));
        assert_eq!(streamer.my_server_id(), 0);
        assert_eq!(streamer.state(), StreamerState::Idle);
    }

    #[tokio::test]
    async fn test_failed_connect_keeps_explicit_identity() {
        let mut db = MySqlConnection::new(ConnectionConfig::default());
        db.close().await.unwrap();
        let config = StreamerConfig {
            connection: ConnectionConfig {
                server_id: 99,
                ..Default::default()
            },
            ..Default::default()
        };
        let mut streamer = BinlogStreamer::new(
            db,
            config,
            Arc::new(test_utils::test_schema_cache()),
            test_utils::test_filter(),
        );

        assert!(streamer.connect_binlog_streamer_to_mysql().await.is_err());
        assert_eq!(streamer.my_server_id(), 99);
    }

    #[test]
    fn test_checksum_alg() {
        assert_eq!(checksum_alg(Some("CRC32")), CHECKSUM_ALG_CRC32);
        assert_eq!(checksum_alg(Some("NONE")), CHECKSUM_ALG_OFF);
        assert_eq!(checksum_alg(None), CHECKSUM_ALG_OFF);
    }

    fn live_config() -> Option<StreamerConfig> {
        let connection = ConnectionConfig::from_env().ok()?;
        std::env::var("DB_HOST").ok()?;
        Some(StreamerConfig {
            connection,
            ..Default::default()
        })
    }

    async fn live_streamer(config: &StreamerConfig) -> BinlogStreamer {
        let db = MySqlConnection::connect(config.connection.clone()).await.unwrap();
        db.execute_annotated(
            &config.marginalia,
            "CREATE DATABASE IF NOT EXISTS gftest",
        )
        .await
        .unwrap();
        db.execute_annotated(
            &config.marginalia,
            "CREATE TABLE IF NOT EXISTS gftest.test_table_1 (id INT AUTO_INCREMENT PRIMARY KEY, data VARCHAR(255))",
        )
        .await
        .unwrap();
        let filter = test_utils::test_filter();
        let schema = TableSchemaCache::load_tables(&db, filter.as_ref()).await.unwrap();
        BinlogStreamer::new(db, config.clone(), Arc::new(schema), filter)
    }

    #[tokio::test]
    #[ignore = "requires a MySQL server with ROW binlog (DB_HOST etc.)"]
    async fn test_live_connect_from_head() {
        let Some(config) = live_config() else { return };
        let mut streamer = live_streamer(&config).await;

        let start = streamer.connect_binlog_streamer_to_mysql().await.unwrap();
        assert!(start.filename.starts_with("mysql-bin."));
        assert_ne!(streamer.my_server_id(), 0);
        assert_eq!(streamer.last_streamed_binlog_position(), start);
        assert_eq!(streamer.state(), StreamerState::Connected);
    }

    #[tokio::test]
    #[ignore = "requires a MySQL server with ROW binlog (DB_HOST etc.)"]
    async fn test_live_connect_keeps_explicit_identity() {
        let Some(mut config) = live_config() else { return };
        config.connection.server_id = 1421;
        let mut streamer = live_streamer(&config).await;

        streamer.connect_binlog_streamer_to_mysql().await.unwrap();
        assert_eq!(streamer.my_server_id(), 1421);
    }

    #[tokio::test]
    #[ignore = "requires a MySQL server with ROW binlog (DB_HOST etc.)"]
    async fn test_live_connect_generates_identity() {
        let Some(mut config) = live_config() else { return };
        config.connection.server_id = 0;
        let mut streamer = live_streamer(&config).await;
        assert_eq!(streamer.my_server_id(), 0);

        streamer.connect_binlog_streamer_to_mysql().await.unwrap();
        assert_ne!(streamer.my_server_id(), 0);
    }

    #[tokio::test]
    #[ignore = "requires a MySQL server with ROW binlog (DB_HOST etc.)"]
    async fn test_live_insert_is_streamed() {
        let Some(config) = live_config() else { return };
        let writer = MySqlConnection::connect(config.connection.clone()).await.unwrap();
        let mut streamer = live_streamer(&config).await;
        streamer.connect_binlog_streamer_to_mysql().await.unwrap();

        let batches = collect_batches(&mut streamer);
        stop_after(&mut streamer, 1);

        let statement = "INSERT INTO gftest.test_table_1 (data) VALUES ('streamed')";
        writer.execute_annotated(&config.marginalia, statement).await.unwrap();

        tokio::time::timeout(Duration::from_secs(10), streamer.run())
            .await
            .unwrap()
            .unwrap();

        let batches = batches.lock();
        assert_eq!(
            batches[0].query(),
            Some(marginalia::annotate(&config.marginalia, statement).as_str())
        );
    }
}
