//! MySQL 인증 처리
//!
//! mysql_native_password와 caching_sha2_password(fast auth) 구현

use crate::error::{FerryError, Result};
use crate::protocol::read_null_terminated_string;
use byteorder::{LittleEndian, WriteBytesExt};
use sha1::Sha1;
use sha2::{Digest, Sha256};
use std::io::{Cursor, Write};

/// Client capability flags
pub mod capabilities {
    pub const LONG_PASSWORD: u32 = 1;
    pub const LONG_FLAG: u32 = 4;
    pub const CONNECT_WITH_DB: u32 = 8;
    pub const PROTOCOL_41: u32 = 512;
    pub const TRANSACTIONS: u32 = 8192;
    pub const SECURE_CONNECTION: u32 = 32768;
    pub const MULTI_STATEMENTS: u32 = 1 << 16;
    pub const MULTI_RESULTS: u32 = 1 << 17;
    pub const PLUGIN_AUTH: u32 = 1 << 19;
}

/// caching_sha2_password 응답 상태 바이트
pub const AUTH_MORE_DATA: u8 = 0x01;
pub const AUTH_SWITCH_REQUEST: u8 = 0xFE;
pub const FAST_AUTH_SUCCESS: u8 = 0x03;
pub const PERFORM_FULL_AUTH: u8 = 0x04;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthPlugin {
    NativePassword,
    CachingSha2Password,
}

impl AuthPlugin {
    pub fn from_name(name: &str) -> Result<Self> {
        match name {
            "mysql_native_password" => Ok(AuthPlugin::NativePassword),
            "caching_sha2_password" => Ok(AuthPlugin::CachingSha2Password),
            other => Err(FerryError::ConnectionError(format!(
                "Unsupported auth plugin: {}",
                other
            ))),
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            AuthPlugin::NativePassword => "mysql_native_password",
            AuthPlugin::CachingSha2Password => "caching_sha2_password",
        }
    }

    /// 플러그인에 맞는 스크램블 응답
    pub fn scramble(&self, password: &str, nonce: &[u8]) -> Vec<u8> {
        match self {
            AuthPlugin::NativePassword => create_auth_response(password, nonce),
            AuthPlugin::CachingSha2Password => create_sha2_auth_response(password, nonce),
        }
    }
}

/// mysql_native_password 스크램블
/// XOR(SHA1(password), SHA1(scramble + SHA1(SHA1(password))))
pub fn create_auth_response(password: &str, scramble: &[u8]) -> Vec<u8> {
    if password.is_empty() {
        return Vec::new();
    }

    let hashed = Sha1::digest(password.as_bytes());
    let double_hashed = Sha1::digest(hashed);
    let salted = Sha1::new()
        .chain_update(scramble)
        .chain_update(double_hashed)
        .finalize();
    xor(&hashed, &salted)
}

/// caching_sha2_password 스크램블
/// XOR(SHA256(password), SHA256(SHA256(SHA256(password)) + scramble))
pub fn create_sha2_auth_response(password: &str, scramble: &[u8]) -> Vec<u8> {
    if password.is_empty() {
        return Vec::new();
    }

    let hashed = Sha256::digest(password.as_bytes());
    let double_hashed = Sha256::digest(hashed);
    let salted = Sha256::new()
        .chain_update(double_hashed)
        .chain_update(scramble)
        .finalize();
    xor(&hashed, &salted)
}

fn xor(left: &[u8], right: &[u8]) -> Vec<u8> {
    left.iter().zip(right).map(|(a, b)| a ^ b).collect()
}

fn client_flags(with_database: bool) -> u32 {
    let flags = capabilities::LONG_PASSWORD
        | capabilities::LONG_FLAG
        | capabilities::PROTOCOL_41
        | capabilities::TRANSACTIONS
        | capabilities::SECURE_CONNECTION
        | capabilities::MULTI_STATEMENTS
        | capabilities::MULTI_RESULTS
        | capabilities::PLUGIN_AUTH;
    if with_database {
        flags | capabilities::CONNECT_WITH_DB
    } else {
        flags
    }
}

/// HandshakeResponse41 패킷 본문.
/// 서버가 알려 준 플러그인으로 스크램블하고 플러그인 이름을 끝에 붙입니다.
pub fn create_handshake_response(
    username: &str,
    password: &str,
    database: Option<&str>,
    scramble: &[u8],
    collation: u8,
    plugin: AuthPlugin,
) -> std::io::Result<Vec<u8>> {
    let auth_response = plugin.scramble(password, scramble);
    let mut packet = Vec::with_capacity(64 + username.len() + auth_response.len());

    packet.write_u32::<LittleEndian>(client_flags(database.is_some()))?;
    // max packet size, 0이면 서버 기본값
    packet.write_u32::<LittleEndian>(0)?;
    packet.write_u8(collation)?;
    packet.extend_from_slice(&[0u8; 23]);

    write_null_terminated(&mut packet, username)?;
    packet.write_u8(auth_response.len() as u8)?;
    packet.extend_from_slice(&auth_response);
    if let Some(db) = database {
        write_null_terminated(&mut packet, db)?;
    }
    write_null_terminated(&mut packet, plugin.name())?;

    Ok(packet)
}

fn write_null_terminated(packet: &mut Vec<u8>, value: &str) -> std::io::Result<()> {
    packet.write_all(value.as_bytes())?;
    packet.write_u8(0)
}

/// 서버가 보낸 auth switch 요청 (0xFE + 플러그인 이름 + 새 스크램블)
#[derive(Debug, Clone, PartialEq)]
pub struct AuthSwitchRequest {
    pub plugin_name: String,
    pub scramble: Vec<u8>,
}

impl AuthSwitchRequest {
    pub fn parse(data: &[u8]) -> Result<Self> {
        if data.first() != Some(&AUTH_SWITCH_REQUEST) {
            return Err(FerryError::ProtocolError("Not an auth switch request".to_string()));
        }

        let mut cursor = Cursor::new(&data[1..]);
        let plugin_name = read_null_terminated_string(&mut cursor)?;
        let mut scramble = data[1 + cursor.position() as usize..].to_vec();
        if scramble.last() == Some(&0) {
            scramble.pop();
        }

        Ok(AuthSwitchRequest {
            plugin_name,
            scramble,
        })
    }
}
