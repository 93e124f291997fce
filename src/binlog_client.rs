//! MySQL Binlog 클라이언트
//!
//! 레플리카로 등록한 뒤 COM_BINLOG_DUMP로 원시 이벤트를 받아
//! 백그라운드 태스크에서 채널로 흘려보냅니다.

use crate::auth::{self, AuthPlugin, AuthSwitchRequest};
use crate::connection::ConnectionConfig;
use crate::error::{FerryError, Result};
use crate::offset::BinlogPosition;
use crate::protocol::{self, ErrorPacket, GreetingPacket, PacketChannel};
use byteorder::{LittleEndian, WriteBytesExt};
use bytes::Bytes;
use std::io::Write;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// COM_QUERY 명령어 코드
const COM_QUERY: u8 = 0x03;

/// COM_REGISTER_SLAVE 명령어 코드
const COM_REGISTER_SLAVE: u8 = 0x15;

/// COM_BINLOG_DUMP 명령어 코드
const COM_BINLOG_DUMP: u8 = 0x12;

/// 서버가 binlog_checksum 설정대로 체크섬을 붙여 보내도록 요청
const CHECKSUM_QUERY: &str = "SET @master_binlog_checksum = @@global.binlog_checksum, \
                              @source_binlog_checksum = @@global.binlog_checksum";

/// 리더 태스크가 채널로 보내는 원시 이벤트 (OK 바이트를 뗀 이벤트 헤더+본문)
pub type RawEventReceiver = mpsc::Receiver<Result<Bytes>>;

/// Binlog 클라이언트
pub struct BinlogClient {
    config: ConnectionConfig,
    server_id: u32,
}

impl BinlogClient {
    /// 새 Binlog 클라이언트 생성
    pub fn new(config: ConnectionConfig, server_id: u32) -> Self {
        BinlogClient { config, server_id }
    }

    /// 연결, 인증, 덤프 요청까지 마친 뒤 리더 태스크 시작
    pub async fn start_streaming(
        &self,
        start: &BinlogPosition,
        buffer_size: usize,
    ) -> Result<(RawEventReceiver, JoinHandle<()>)> {
        info!(
            "Connecting binlog client to {}:{} (server_id={})",
            self.config.hostname, self.config.port, self.server_id
        );

        let connect = PacketChannel::connect(&self.config.hostname, self.config.port);
        let mut channel = tokio::time::timeout(self.config.timeout, connect)
            .await
            .map_err(|_| {
                FerryError::ConnectionError(format!(
                    "Timed out connecting to {}:{}",
                    self.config.hostname, self.config.port
                ))
            })??;

        self.start_dump_within_timeout(&mut channel, start).await?;
        Ok(spawn_reader(channel, buffer_size))
    }

    /// 서버가 연결만 받고 응답하지 않아도 config.timeout 안에 실패
    pub(crate) async fn start_dump_within_timeout<S>(
        &self,
        channel: &mut PacketChannel<S>,
        start: &BinlogPosition,
    ) -> Result<()>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        tokio::time::timeout(self.config.timeout, self.start_dump(channel, start))
            .await
            .map_err(|_| {
                FerryError::ConnectionError(format!(
                    "Timed out during replication handshake with {}:{}",
                    self.config.hostname, self.config.port
                ))
            })?
    }

    /// 핸드셰이크부터 COM_BINLOG_DUMP 전송까지
    pub(crate) async fn start_dump<S>(&self, channel: &mut PacketChannel<S>, start: &BinlogPosition) -> Result<()>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        self.authenticate(channel).await?;
        Self::negotiate_checksum(channel).await?;

        channel
            .write_command(&self.create_register_slave_command()?)
            .await?;
        channel.read_ok_packet("COM_REGISTER_SLAVE").await?;
        debug!("Registered as replica with server_id={}", self.server_id);

        let dump_command = self.create_binlog_dump_command(start)?;
        channel.write_command(&dump_command).await?;

        info!("Sent COM_BINLOG_DUMP: {}", start);
        Ok(())
    }

    async fn authenticate<S>(&self, channel: &mut PacketChannel<S>) -> Result<()>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let greeting = GreetingPacket::parse(&channel.read_packet().await?)?;
        info!(
            "MySQL Server version: {}, Thread ID: {}",
            greeting.server_version, greeting.thread_id
        );

        let mut plugin = AuthPlugin::from_name(&greeting.auth_plugin_name).unwrap_or(AuthPlugin::NativePassword);
        let response = auth::create_handshake_response(
            &self.config.username,
            &self.config.password,
            self.config.database.as_deref(),
            &greeting.scramble,
            greeting.server_collation,
            plugin,
        )
        .map_err(|e| FerryError::ConnectionError(format!("Failed to create auth response: {}", e)))?;
        channel.write_packet(&response).await?;

        loop {
            let packet = channel.read_packet().await?;
            match packet.first() {
                Some(&0x00) => break,
                Some(&0xFF) => {
                    let err = ErrorPacket::parse(&packet)?;
                    return Err(FerryError::ConnectionError(format!("Authentication failed: {}", err)));
                }
                Some(&auth::AUTH_SWITCH_REQUEST) => {
                    let switch = AuthSwitchRequest::parse(&packet)?;
                    plugin = AuthPlugin::from_name(&switch.plugin_name)?;
                    debug!("Server requested auth switch to {}", plugin.name());
                    channel
                        .write_packet(&plugin.scramble(&self.config.password, &switch.scramble))
                        .await?;
                }
                Some(&auth::AUTH_MORE_DATA) if plugin == AuthPlugin::CachingSha2Password => {
                    match packet.get(1) {
                        // 다음 패킷이 OK
                        Some(&auth::FAST_AUTH_SUCCESS) => continue,
                        Some(&auth::PERFORM_FULL_AUTH) => {
                            return Err(FerryError::ConnectionError(
                                "caching_sha2_password full authentication needs a secure connection; \
                                 log in once with a regular client to warm the server cache"
                                    .to_string(),
                            ))
                        }
                        _ => {
                            return Err(FerryError::ProtocolError(
                                "Unexpected caching_sha2_password response".to_string(),
                            ))
                        }
                    }
                }
                _ => {
                    return Err(FerryError::ProtocolError(format!(
                        "Unexpected packet during authentication: {:02x?}",
                        packet.first()
                    )))
                }
            }
        }

        info!("Authentication successful");
        Ok(())
    }

    async fn negotiate_checksum<S>(channel: &mut PacketChannel<S>) -> Result<()>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let mut query = vec![COM_QUERY];
        query.extend_from_slice(CHECKSUM_QUERY.as_bytes());
        channel.write_command(&query).await?;

        let result = channel.read_packet().await?;
        if protocol::is_error_packet(&result) {
            // binlog_checksum이 없는 오래된 서버는 체크섬 없이 보냄
            let err = ErrorPacket::parse(&result)?;
            warn!("Binlog checksum negotiation failed, continuing without: {}", err);
        } else {
            debug!("Binlog checksum negotiated");
        }
        Ok(())
    }

    /// COM_REGISTER_SLAVE 명령어 생성
    fn create_register_slave_command(&self) -> Result<Vec<u8>> {
        let mut buffer = Vec::new();
        buffer.write_u8(COM_REGISTER_SLAVE)?;
        buffer.write_u32::<LittleEndian>(self.server_id)?;
        // hostname, user, password (길이 접두 문자열, 모두 비움)
        buffer.write_u8(0)?;
        buffer.write_u8(0)?;
        buffer.write_u8(0)?;
        buffer.write_u16::<LittleEndian>(self.config.port)?;
        // replication rank, master id
        buffer.write_u32::<LittleEndian>(0)?;
        buffer.write_u32::<LittleEndian>(0)?;
        Ok(buffer)
    }

    /// COM_BINLOG_DUMP 명령어 생성
    fn create_binlog_dump_command(&self, start: &BinlogPosition) -> Result<Vec<u8>> {
        let position = u32::try_from(start.position).map_err(|_| {
            FerryError::ProtocolError(format!("Binlog position {} does not fit in 4 bytes", start))
        })?;

        let mut buffer = Vec::new();
        buffer.write_u8(COM_BINLOG_DUMP)?;
        buffer.write_u32::<LittleEndian>(position)?;
        // Flags (2 bytes) - 0이면 새 이벤트를 기다림
        buffer.write_u16::<LittleEndian>(0)?;
        buffer.write_u32::<LittleEndian>(self.server_id)?;
        buffer.write_all(start.filename.as_bytes())?;

        debug!(
            "Created COM_BINLOG_DUMP command: server_id={}, position={}",
            self.server_id, start
        );

        Ok(buffer)
    }
}

/// 패킷을 읽어 채널로 보내는 백그라운드 태스크.
/// 스트림이 끊기면 마지막으로 ConnectionError를 보내고 끝납니다.
pub fn spawn_reader<S>(mut channel: PacketChannel<S>, buffer_size: usize) -> (RawEventReceiver, JoinHandle<()>)
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let (tx, rx) = mpsc::channel(buffer_size.max(1));

    let handle = tokio::spawn(async move {
        let mut event_count: u64 = 0;
        loop {
            let item = match channel.read_packet().await {
                Ok(packet) if protocol::is_error_packet(&packet) => {
                    let reason = ErrorPacket::parse(&packet)
                        .map(|e| e.to_string())
                        .unwrap_or_else(|e| e.to_string());
                    Err(FerryError::ConnectionError(format!("Binlog stream aborted: {}", reason)))
                }
                Ok(packet) if protocol::is_eof_packet(&packet) => Err(FerryError::ConnectionError(
                    "Binlog stream closed by server".to_string(),
                )),
                Ok(packet) if packet.first() == Some(&0x00) => {
                    event_count += 1;
                    Ok(Bytes::from(packet).slice(1..))
                }
                Ok(packet) => Err(FerryError::ProtocolError(format!(
                    "Unexpected binlog packet header: {:02x?}",
                    packet.first()
                ))),
                Err(e) => Err(FerryError::ConnectionError(format!("Failed to read binlog packet: {}", e))),
            };

            let done = item.is_err();
            if tx.send(item).await.is_err() {
                debug!("Binlog receiver dropped, stopping reader");
                break;
            }
            if done {
                break;
            }
        }
        info!("Binlog reader ended after {} events", event_count);
    });

    (rx, handle)
}
