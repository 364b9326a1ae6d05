//! MySQL 인증 처리
//!
//! mysql_native_password 스크램블과 HandshakeResponse41 패킷 생성

use byteorder::{LittleEndian, WriteBytesExt};
use sha1::{Digest, Sha1};
use std::io::Write;

pub const NATIVE_PASSWORD_PLUGIN: &str = "mysql_native_password";

/// Client capability flags
pub mod capabilities {
    pub const LONG_PASSWORD: u32 = 1;
    pub const LONG_FLAG: u32 = 4;
    pub const CONNECT_WITH_DB: u32 = 8;
    pub const PROTOCOL_41: u32 = 512;
    pub const TRANSACTIONS: u32 = 8192;
    pub const SECURE_CONNECTION: u32 = 32768;
    pub const MULTI_RESULTS: u32 = 1 << 17;
    pub const PLUGIN_AUTH: u32 = 1 << 19;
}

/// SHA1(password) XOR SHA1(scramble + SHA1(SHA1(password)))
pub fn create_auth_response(password: &str, scramble: &[u8]) -> Vec<u8> {
    if password.is_empty() {
        return Vec::new();
    }

    let stage1 = Sha1::digest(password.as_bytes());
    let stage2 = Sha1::digest(stage1);

    let mut hasher = Sha1::new();
    hasher.update(scramble);
    hasher.update(stage2);
    let stage3 = hasher.finalize();

    stage1.iter().zip(stage3.iter()).map(|(a, b)| a ^ b).collect()
}

/// HandshakeResponse41
pub fn create_handshake_response(
    username: &str,
    password: &str,
    database: Option<&str>,
    scramble: &[u8],
    collation: u8,
) -> Result<Vec<u8>, std::io::Error> {
    let mut buffer = Vec::new();

    let mut capabilities = capabilities::LONG_PASSWORD
        | capabilities::LONG_FLAG
        | capabilities::PROTOCOL_41
        | capabilities::TRANSACTIONS
        | capabilities::SECURE_CONNECTION
        | capabilities::MULTI_RESULTS
        | capabilities::PLUGIN_AUTH;
    if database.is_some() {
        capabilities |= capabilities::CONNECT_WITH_DB;
    }

    buffer.write_u32::<LittleEndian>(capabilities)?;
    // 0 = 서버 기본값 (16MB)
    buffer.write_u32::<LittleEndian>(0)?;
    buffer.write_u8(collation)?;
    buffer.write_all(&[0u8; 23])?;

    buffer.write_all(username.as_bytes())?;
    buffer.write_u8(0)?;

    let auth_response = create_auth_response(password, scramble);
    buffer.write_u8(auth_response.len() as u8)?;
    buffer.write_all(&auth_response)?;

    if let Some(db) = database {
        buffer.write_all(db.as_bytes())?;
        buffer.write_u8(0)?;
    }

    buffer.write_all(NATIVE_PASSWORD_PLUGIN.as_bytes())?;
    buffer.write_u8(0)?;

    Ok(buffer)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_password_sends_no_scramble() {
        assert!(create_auth_response("", &[1, 2, 3, 4]).is_empty());
    }

    #[test]
    fn test_auth_response_is_reversible_with_stored_hash() {
        // 서버는 SHA1(SHA1(password)) 만 알고 있다
        let scramble = b"01234567890123456789";
        let response = create_auth_response("secret", scramble);
        assert_eq!(response.len(), 20);

        let stored = Sha1::digest(Sha1::digest(b"secret"));
        let mut hasher = Sha1::new();
        hasher.update(scramble);
        hasher.update(stored);
        let mask = hasher.finalize();
        let candidate: Vec<u8> = response.iter().zip(mask.iter()).map(|(a, b)| a ^ b).collect();
        assert_eq!(Sha1::digest(&candidate).to_vec(), stored.to_vec());
    }

    #[test]
    fn test_handshake_response_layout() {
        let packet =
            create_handshake_response("root", "password", Some("shop"), b"abcdefgh", 33).unwrap();
        let caps = u32::from_le_bytes([packet[0], packet[1], packet[2], packet[3]]);
        assert!(caps & capabilities::CONNECT_WITH_DB != 0);
        assert_eq!(packet[8], 33);
        assert_eq!(&packet[32..37], b"root\0");
        assert_eq!(packet[37], 20);
        assert!(packet.ends_with(b"shop\0mysql_native_password\0"));
    }
}
