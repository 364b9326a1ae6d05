//! MySQL 클라이언트/서버 프로토콜 패킷 처리
//!
//! 패킷: 3 bytes 길이 + 1 byte 시퀀스 + 본문.
//! 본문이 0xFFFFFF 바이트 이상이면 여러 패킷으로 나뉘어 온다.

use crate::auth;
use crate::error::{CdcError, Result};
use byteorder::{LittleEndian, ReadBytesExt};
use bytes::{Bytes, BytesMut};
use std::io::{Cursor, Read};
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tracing::debug;

const MAX_PACKET_SIZE: usize = 0xFF_FFFF;

pub const COM_QUERY: u8 = 0x03;

/// MySQL 패킷 채널
#[derive(Debug)]
pub struct PacketChannel {
    stream: TcpStream,
    sequence: u8,
}

impl PacketChannel {
    pub async fn connect(hostname: &str, port: u16, timeout: Duration) -> Result<Self> {
        let addr = format!("{}:{}", hostname, port);
        let stream = tokio::time::timeout(timeout, TcpStream::connect(&addr))
            .await
            .map_err(|_| CdcError::Timeout)?
            .map_err(|e| CdcError::ConnectionError(format!("Failed to connect to {}: {}", addr, e)))?;
        stream.set_nodelay(true)?;

        debug!("Connected to MySQL at {}", addr);

        Ok(PacketChannel {
            stream,
            sequence: 0,
        })
    }

    /// 패킷 하나(분할된 경우 이어 붙인 전체 본문)를 읽는다
    pub async fn read_packet(&mut self) -> Result<Bytes> {
        // Cursor 파서들의 byteorder 메서드와 겹치지 않게 여기서만 가져온다
        use tokio::io::AsyncReadExt;

        let mut payload = BytesMut::new();
        loop {
            let mut header = [0u8; 4];
            self.stream.read_exact(&mut header).await?;
            let length = u32::from_le_bytes([header[0], header[1], header[2], 0]) as usize;
            self.sequence = header[3].wrapping_add(1);

            let start = payload.len();
            payload.resize(start + length, 0);
            self.stream.read_exact(&mut payload[start..]).await?;

            if length < MAX_PACKET_SIZE {
                return Ok(payload.freeze());
            }
        }
    }

    /// 현재 시퀀스로 패킷을 보낸다
    pub async fn write_packet(&mut self, data: &[u8]) -> Result<()> {
        let mut chunks = data.chunks(MAX_PACKET_SIZE).peekable();
        if chunks.peek().is_none() {
            self.write_chunk(&[]).await?;
        }
        while let Some(chunk) = chunks.next() {
            self.write_chunk(chunk).await?;
            if chunk.len() == MAX_PACKET_SIZE && chunks.peek().is_none() {
                self.write_chunk(&[]).await?;
            }
        }
        self.stream.flush().await?;
        Ok(())
    }

    async fn write_chunk(&mut self, chunk: &[u8]) -> Result<()> {
        let length = (chunk.len() as u32).to_le_bytes();
        let header = [length[0], length[1], length[2], self.sequence];
        self.sequence = self.sequence.wrapping_add(1);
        self.stream.write_all(&header).await?;
        self.stream.write_all(chunk).await?;
        Ok(())
    }

    /// 새 명령은 시퀀스 0부터 시작한다
    pub async fn write_command(&mut self, data: &[u8]) -> Result<()> {
        self.sequence = 0;
        self.write_packet(data).await
    }

    /// 핸드셰이크 + 인증
    pub async fn authenticate(&mut self, username: &str, password: &str) -> Result<GreetingPacket> {
        let greeting = GreetingPacket::parse(&self.read_packet().await?)?;
        debug!(
            "MySQL Server version: {}, Thread ID: {}",
            greeting.server_version, greeting.thread_id
        );

        let response = auth::create_handshake_response(
            username,
            password,
            None,
            &greeting.scramble,
            greeting.server_collation,
        )?;
        self.write_packet(&response).await?;

        let mut reply = self.read_packet().await?;
        if is_auth_switch_packet(&reply) {
            let switch = AuthSwitchRequest::parse(&reply)?;
            if switch.plugin != auth::NATIVE_PASSWORD_PLUGIN {
                return Err(CdcError::ConnectionError(format!(
                    "unsupported auth plugin: {}",
                    switch.plugin
                )));
            }
            let scrambled = auth::create_auth_response(password, &switch.scramble);
            self.write_packet(&scrambled).await?;
            reply = self.read_packet().await?;
        }

        check_ok(&reply).map_err(|e| CdcError::ConnectionError(format!("Authentication failed: {}", e)))?;
        Ok(greeting)
    }

    /// 결과 셋이 없는 문장 실행 (SET 등)
    pub async fn execute(&mut self, sql: &str) -> Result<()> {
        let mut command = Vec::with_capacity(sql.len() + 1);
        command.push(COM_QUERY);
        command.extend_from_slice(sql.as_bytes());
        self.write_command(&command).await?;
        check_ok(&self.read_packet().await?)
    }

    pub async fn shutdown(&mut self) {
        let _ = self.stream.shutdown().await;
    }
}

/// 서버 Greeting (Handshake V10)
#[derive(Debug, Clone)]
pub struct GreetingPacket {
    pub protocol_version: u8,
    pub server_version: String,
    pub thread_id: u32,
    pub scramble: Vec<u8>,
    pub server_capabilities: u32,
    pub server_collation: u8,
    pub server_status: u16,
    pub auth_plugin: String,
}

impl GreetingPacket {
    pub fn parse(data: &[u8]) -> Result<Self> {
        if is_error_packet(data) {
            return Err(CdcError::ConnectionError(ErrPacket::parse(data).to_string()));
        }
        let mut cursor = Cursor::new(data);

        let protocol_version = cursor.read_u8()?;
        let server_version = read_null_terminated_string(&mut cursor)?;
        let thread_id = cursor.read_u32::<LittleEndian>()?;

        let mut scramble = vec![0u8; 8];
        cursor.read_exact(&mut scramble)?;
        cursor.read_u8()?;

        let capabilities_lower = cursor.read_u16::<LittleEndian>()?;
        let server_collation = cursor.read_u8()?;
        let server_status = cursor.read_u16::<LittleEndian>()?;
        let capabilities_upper = cursor.read_u16::<LittleEndian>()?;
        let server_capabilities = (capabilities_upper as u32) << 16 | capabilities_lower as u32;

        let auth_data_len = cursor.read_u8()?;
        cursor.set_position(cursor.position() + 10);

        // part 2 는 최소 13 bytes, 마지막 null 제외
        let part2_len = std::cmp::max(13, auth_data_len.saturating_sub(8)) as usize;
        let mut part2 = vec![0u8; part2_len];
        cursor.read_exact(&mut part2)?;
        if part2.last() == Some(&0) {
            part2.pop();
        }
        scramble.extend_from_slice(&part2);

        let auth_plugin = if server_capabilities & auth::capabilities::PLUGIN_AUTH != 0 {
            read_null_terminated_string(&mut cursor).unwrap_or_default()
        } else {
            String::new()
        };

        Ok(GreetingPacket {
            protocol_version,
            server_version,
            thread_id,
            scramble,
            server_capabilities,
            server_collation,
            server_status,
            auth_plugin,
        })
    }
}

/// 0xFE 로 시작하는 인증 플러그인 전환 요청
#[derive(Debug, Clone)]
pub struct AuthSwitchRequest {
    pub plugin: String,
    pub scramble: Vec<u8>,
}

impl AuthSwitchRequest {
    pub fn parse(data: &[u8]) -> Result<Self> {
        let mut cursor = Cursor::new(data);
        cursor.read_u8()?;
        let plugin = read_null_terminated_string(&mut cursor)?;
        let start = cursor.position() as usize;
        let mut scramble = data[start.min(data.len())..].to_vec();
        if scramble.last() == Some(&0) {
            scramble.pop();
        }
        Ok(AuthSwitchRequest { plugin, scramble })
    }
}

/// ERR 패킷
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ErrPacket {
    pub code: u16,
    pub sql_state: String,
    pub message: String,
}

impl ErrPacket {
    pub fn parse(data: &[u8]) -> Self {
        let code = data
            .get(1..3)
            .map(|b| u16::from_le_bytes([b[0], b[1]]))
            .unwrap_or(0);
        // '#' + 5 bytes SQL state (4.1 프로토콜)
        let (sql_state, message_start) = if data.get(3) == Some(&b'#') && data.len() >= 9 {
            (String::from_utf8_lossy(&data[4..9]).to_string(), 9)
        } else {
            (String::new(), 3)
        };
        let message = data
            .get(message_start..)
            .map(|m| String::from_utf8_lossy(m).to_string())
            .unwrap_or_default();
        ErrPacket {
            code,
            sql_state,
            message,
        }
    }
}

impl std::fmt::Display for ErrPacket {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "ERROR {} ({}): {}", self.code, self.sql_state, self.message)
    }
}

/// OK 가 아니면 에러
pub fn check_ok(data: &[u8]) -> Result<()> {
    if is_error_packet(data) {
        return Err(CdcError::ProtocolError(ErrPacket::parse(data).to_string()));
    }
    if !is_ok_packet(data) {
        return Err(CdcError::ProtocolError(format!(
            "unexpected packet header {:#04x}",
            data.first().copied().unwrap_or(0)
        )));
    }
    Ok(())
}

fn read_null_terminated_string<R: Read>(reader: &mut R) -> Result<String> {
    let mut bytes = Vec::new();
    loop {
        let byte = reader.read_u8()?;
        if byte == 0 {
            break;
        }
        bytes.push(byte);
    }
    String::from_utf8(bytes)
        .map_err(|e| CdcError::ProtocolError(format!("Invalid UTF-8 in string: {}", e)))
}

pub fn is_error_packet(data: &[u8]) -> bool {
    data.first() == Some(&0xFF)
}

pub fn is_ok_packet(data: &[u8]) -> bool {
    data.first() == Some(&0x00)
}

/// 0xFE + 9 bytes 미만
pub fn is_eof_packet(data: &[u8]) -> bool {
    data.first() == Some(&0xFE) && data.len() < 9
}

pub fn is_auth_switch_packet(data: &[u8]) -> bool {
    data.first() == Some(&0xFE)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    fn greeting_bytes() -> Vec<u8> {
        let mut data = vec![10];
        data.extend_from_slice(b"8.0.35\0");
        data.extend_from_slice(&7u32.to_le_bytes());
        data.extend_from_slice(b"abcdefgh");
        data.push(0);
        let caps = auth::capabilities::PROTOCOL_41
            | auth::capabilities::SECURE_CONNECTION
            | auth::capabilities::PLUGIN_AUTH;
        data.extend_from_slice(&((caps & 0xFFFF) as u16).to_le_bytes());
        data.push(33);
        data.extend_from_slice(&2u16.to_le_bytes());
        data.extend_from_slice(&((caps >> 16) as u16).to_le_bytes());
        data.push(21);
        data.extend_from_slice(&[0u8; 10]);
        data.extend_from_slice(b"ijklmnopqrst\0");
        data.extend_from_slice(b"mysql_native_password\0");
        data
    }

    #[test]
    fn test_packet_kinds() {
        assert!(is_error_packet(&[0xFF, 0x01, 0x02]));
        assert!(!is_error_packet(&[]));
        assert!(is_ok_packet(&[0x00, 0x01, 0x02]));
        assert!(is_eof_packet(&[0xFE, 0, 0, 2, 0]));
        assert!(!is_eof_packet(&[0xFE, 1, 2, 3, 4, 5, 6, 7, 8, 9]));
    }

    #[test]
    fn test_parse_greeting() {
        let greeting = GreetingPacket::parse(&greeting_bytes()).unwrap();
        assert_eq!(greeting.server_version, "8.0.35");
        assert_eq!(greeting.thread_id, 7);
        assert_eq!(greeting.scramble, b"abcdefghijklmnopqrst".to_vec());
        assert_eq!(greeting.server_collation, 33);
        assert_eq!(greeting.auth_plugin, "mysql_native_password");
    }

    #[test]
    fn test_parse_err_packet() {
        let mut data = vec![0xFF];
        data.extend_from_slice(&1236u16.to_le_bytes());
        data.extend_from_slice(b"#HY000Could not find first log file name");
        let err = ErrPacket::parse(&data);
        assert_eq!(err.code, 1236);
        assert_eq!(err.sql_state, "HY000");
        assert!(err.message.starts_with("Could not find"));
        assert!(matches!(check_ok(&data), Err(CdcError::ProtocolError(_))));
    }

    #[test]
    fn test_parse_auth_switch() {
        let mut data = vec![0xFE];
        data.extend_from_slice(b"mysql_native_password\0");
        data.extend_from_slice(b"01234567890123456789\0");
        let switch = AuthSwitchRequest::parse(&data).unwrap();
        assert_eq!(switch.plugin, "mysql_native_password");
        assert_eq!(switch.scramble.len(), 20);
    }

    #[tokio::test]
    async fn test_authenticate_and_execute_against_fake_server() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        let server = tokio::spawn(async move {
            let (socket, _) = listener.accept().await.unwrap();
            let mut channel = PacketChannel {
                stream: socket,
                sequence: 0,
            };
            channel.write_packet(&greeting_bytes()).await.unwrap();
            let response = channel.read_packet().await.unwrap();
            channel.write_packet(&[0x00, 0, 0, 2, 0, 0, 0]).await.unwrap();

            let query = channel.read_packet().await.unwrap();
            channel.write_packet(&[0x00, 0, 0, 2, 0, 0, 0]).await.unwrap();
            (response, query)
        });

        let mut client = PacketChannel::connect("127.0.0.1", port, Duration::from_secs(5))
            .await
            .unwrap();
        let greeting = client.authenticate("repl", "secret").await.unwrap();
        assert_eq!(greeting.server_version, "8.0.35");
        client.execute("SET @master_heartbeat_period = 1").await.unwrap();

        let (response, query) = server.await.unwrap();
        // capability(4) + max packet(4) + charset(1) + reserved(23) 뒤에 사용자명
        assert_eq!(&response[32..37], b"repl\0");
        assert_eq!(query[0], COM_QUERY);
        assert_eq!(&query[1..], b"SET @master_heartbeat_period = 1");
    }
}
