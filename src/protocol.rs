//! MySQL 프로토콜 패킷 처리
//!
//! 복제 연결은 일반 클라이언트 연결과 달리 mysql_async를 거치지 않고
//! 패킷 단위로 직접 주고받습니다.

use crate::auth::AuthPlugin;
use crate::error::{FerryError, Result};
use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use std::io::Read;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::debug;

/// 한 패킷에 담을 수 있는 최대 길이. 이 길이의 패킷 뒤에는 이어지는 패킷이 옵니다.
pub const MAX_PACKET_LENGTH: usize = 0xFF_FFFF;

/// 시퀀스 번호를 추적하는 MySQL 패킷 채널
pub struct PacketChannel<S = TcpStream> {
    stream: S,
    sequence: u8,
}

impl PacketChannel<TcpStream> {
    /// TCP 연결 후 채널 생성
    pub async fn connect(hostname: &str, port: u16) -> Result<Self> {
        let addr = format!("{}:{}", hostname, port);
        let stream = TcpStream::connect(&addr)
            .await
            .map_err(|e| FerryError::ConnectionError(format!("Failed to connect to {}: {}", addr, e)))?;
        stream
            .set_nodelay(true)
            .map_err(|e| FerryError::ConnectionError(format!("Failed to set TCP_NODELAY: {}", e)))?;

        debug!("Connected to MySQL at {}", addr);

        Ok(PacketChannel::new(stream))
    }
}

impl<S: AsyncRead + AsyncWrite + Unpin> PacketChannel<S> {
    pub fn new(stream: S) -> Self {
        PacketChannel { stream, sequence: 0 }
    }

    /// 새 명령을 보내기 전에 시퀀스 번호를 0으로 되돌립니다.
    pub fn reset_sequence(&mut self) {
        self.sequence = 0;
    }

    /// 패킷 읽기. 최대 길이로 쪼개진 패킷은 하나로 합쳐 반환합니다.
    pub async fn read_packet(&mut self) -> Result<Vec<u8>> {
        let mut payload = Vec::new();

        loop {
            // 패킷 헤더 읽기 (3 bytes length + 1 byte sequence)
            let mut header = [0u8; 4];
            self.stream
                .read_exact(&mut header)
                .await
                .map_err(|e| FerryError::IoError(format!("Failed to read packet header: {}", e)))?;
            let length = u32::from_le_bytes([header[0], header[1], header[2], 0]) as usize;
            self.sequence = header[3].wrapping_add(1);

            let start = payload.len();
            payload.resize(start + length, 0);
            self.stream
                .read_exact(&mut payload[start..])
                .await
                .map_err(|e| FerryError::IoError(format!("Failed to read packet body: {}", e)))?;

            if length < MAX_PACKET_LENGTH {
                return Ok(payload);
            }
        }
    }

    /// 패킷 쓰기 (현재 시퀀스 번호 사용)
    pub async fn write_packet(&mut self, data: &[u8]) -> Result<()> {
        let mut chunks = data.chunks(MAX_PACKET_LENGTH).peekable();
        let mut buffer = Vec::with_capacity(data.len() + 4);

        // 빈 패킷도 헤더는 보내야 함
        if chunks.peek().is_none() {
            self.write_header(&mut buffer, 0)?;
        }
        while let Some(chunk) = chunks.next() {
            self.write_header(&mut buffer, chunk.len() as u32)?;
            buffer.extend_from_slice(chunk);
            // 최대 길이로 끝나면 빈 패킷으로 마무리
            if chunks.peek().is_none() && chunk.len() == MAX_PACKET_LENGTH {
                self.write_header(&mut buffer, 0)?;
            }
        }

        self.stream
            .write_all(&buffer)
            .await
            .map_err(|e| FerryError::IoError(format!("Failed to write packet: {}", e)))?;
        self.stream
            .flush()
            .await
            .map_err(|e| FerryError::IoError(format!("Failed to flush: {}", e)))?;

        Ok(())
    }

    fn write_header(&mut self, buffer: &mut Vec<u8>, length: u32) -> Result<()> {
        WriteBytesExt::write_u24::<LittleEndian>(buffer, length)
            .map_err(|e| FerryError::IoError(format!("Failed to write length: {}", e)))?;
        WriteBytesExt::write_u8(buffer, self.sequence)
            .map_err(|e| FerryError::IoError(format!("Failed to write sequence: {}", e)))?;
        self.sequence = self.sequence.wrapping_add(1);
        Ok(())
    }

    /// 명령 패킷 전송 (시퀀스 0부터 시작)
    pub async fn write_command(&mut self, command: &[u8]) -> Result<()> {
        self.reset_sequence();
        self.write_packet(command).await
    }

    /// 패킷을 읽고 ERR 패킷이면 에러로 변환
    pub async fn read_ok_packet(&mut self, context: &str) -> Result<Vec<u8>> {
        let packet = self.read_packet().await?;
        if is_error_packet(&packet) {
            let err = ErrorPacket::parse(&packet)?;
            return Err(FerryError::ConnectionError(format!("{} failed: {}", context, err)));
        }
        Ok(packet)
    }
}

/// 접속 직후 서버가 보내는 초기 핸드셰이크
#[derive(Debug, Clone)]
pub struct GreetingPacket {
    pub protocol_version: u8,
    pub server_version: String,
    pub thread_id: u32,
    pub scramble: Vec<u8>,
    pub server_capabilities: u32,
    pub server_collation: u8,
    pub server_status: u16,
    pub auth_plugin_name: String,
}

impl GreetingPacket {
    /// HandshakeV10. 서버가 곧바로 ERR을 보내면 접속 거부로 보고 ConnectionError
    pub fn parse(data: &[u8]) -> Result<Self> {
        if is_error_packet(data) {
            let err = ErrorPacket::parse(data)?;
            return Err(FerryError::ConnectionError(format!("Server refused connection: {}", err)));
        }

        let mut reader = PayloadReader::new(data, "greeting packet");
        let protocol_version = reader.u8()?;
        let server_version = String::from_utf8_lossy(reader.null_terminated()?).into_owned();
        let thread_id = reader.u32()?;
        let mut scramble = reader.take(8)?.to_vec();
        reader.take(1)?;

        let capabilities_low = reader.u16()? as u32;
        let server_collation = reader.u8()?;
        let server_status = reader.u16()?;
        let capabilities_high = reader.u16()? as u32;
        let auth_data_len = reader.u8()? as usize;
        reader.take(10)?;

        // 스크램블 뒷부분은 최소 13바이트이고 null로 끝남
        let tail = reader.take(auth_data_len.saturating_sub(8).max(13))?;
        scramble.extend_from_slice(tail.strip_suffix(&[0]).unwrap_or(tail));

        // 플러그인 이름이 없으면 native password. 끝의 null을 빼먹는 서버도 있음
        let plugin = reader.remaining().split(|b| *b == 0).next().unwrap_or_default();
        let auth_plugin_name = if plugin.is_empty() {
            AuthPlugin::NativePassword.name().to_string()
        } else {
            String::from_utf8_lossy(plugin).into_owned()
        };

        Ok(GreetingPacket {
            protocol_version,
            server_version,
            thread_id,
            scramble,
            server_capabilities: capabilities_high << 16 | capabilities_low,
            server_collation,
            server_status,
            auth_plugin_name,
        })
    }
}

/// 패킷 본문을 앞에서부터 읽습니다. 길이가 모자라면 ProtocolError
struct PayloadReader<'a> {
    data: &'a [u8],
    pos: usize,
    what: &'static str,
}

impl<'a> PayloadReader<'a> {
    fn new(data: &'a [u8], what: &'static str) -> Self {
        PayloadReader { data, pos: 0, what }
    }

    fn take(&mut self, len: usize) -> Result<&'a [u8]> {
        let end = self
            .pos
            .checked_add(len)
            .filter(|end| *end <= self.data.len())
            .ok_or_else(|| {
                FerryError::ProtocolError(format!("Truncated {} at byte {}", self.what, self.pos))
            })?;
        let bytes = &self.data[self.pos..end];
        self.pos = end;
        Ok(bytes)
    }

    fn u8(&mut self) -> Result<u8> {
        Ok(self.take(1)?[0])
    }

    fn u16(&mut self) -> Result<u16> {
        let bytes = self.take(2)?;
        Ok(u16::from_le_bytes([bytes[0], bytes[1]]))
    }

    fn u32(&mut self) -> Result<u32> {
        let bytes = self.take(4)?;
        Ok(u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
    }

    fn null_terminated(&mut self) -> Result<&'a [u8]> {
        let rest = &self.data[self.pos..];
        let len = rest.iter().position(|b| *b == 0).ok_or_else(|| {
            FerryError::ProtocolError(format!("Unterminated string in {}", self.what))
        })?;
        self.pos += len + 1;
        Ok(&rest[..len])
    }

    fn remaining(&self) -> &'a [u8] {
        &self.data[self.pos..]
    }
}

/// ERR 패킷
#[derive(Debug, Clone, PartialEq)]
pub struct ErrorPacket {
    pub code: u16,
    pub sql_state: Option<String>,
    pub message: String,
}

impl ErrorPacket {
    pub fn parse(data: &[u8]) -> Result<Self> {
        if !is_error_packet(data) || data.len() < 3 {
            return Err(FerryError::ProtocolError("Not an error packet".to_string()));
        }

        let code = u16::from_le_bytes([data[1], data[2]]);
        let rest = &data[3..];
        let (sql_state, message) = if rest.first() == Some(&b'#') && rest.len() >= 6 {
            (
                Some(String::from_utf8_lossy(&rest[1..6]).into_owned()),
                &rest[6..],
            )
        } else {
            (None, rest)
        };

        Ok(ErrorPacket {
            code,
            sql_state,
            message: String::from_utf8_lossy(message).into_owned(),
        })
    }
}

impl std::fmt::Display for ErrorPacket {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.sql_state {
            Some(ref state) => write!(f, "ERROR {} ({}): {}", self.code, state, self.message),
            None => write!(f, "ERROR {}: {}", self.code, self.message),
        }
    }
}

/// null로 끝나는 문자열 읽기
pub(crate) fn read_null_terminated_string<R: Read>(reader: &mut R) -> Result<String> {
    let mut bytes = Vec::new();
    loop {
        let byte = ReadBytesExt::read_u8(reader)
            .map_err(|e| FerryError::ProtocolError(format!("Failed to read string byte: {}", e)))?;
        if byte == 0 {
            break;
        }
        bytes.push(byte);
    }
    String::from_utf8(bytes)
        .map_err(|e| FerryError::ProtocolError(format!("Invalid UTF-8 in string: {}", e)))
}

pub fn is_error_packet(data: &[u8]) -> bool {
    data.first() == Some(&0xFF)
}

pub fn is_ok_packet(data: &[u8]) -> bool {
    data.first() == Some(&0x00)
}

/// EOF 패킷 확인 (binlog 덤프 종료)
pub fn is_eof_packet(data: &[u8]) -> bool {
    data.first() == Some(&0xFE) && data.len() < 9
}
