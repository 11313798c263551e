//! Initial handshake and authentication
//!
//! The server opens with a protocol-10 handshake carrying a 20-byte scramble
//! split 8+12; the client answers with capabilities, user, and the
//! mysql_native_password response: `SHA1(pw) XOR SHA1(scramble + SHA1(SHA1(pw)))`.

use rand::Rng;
use sha1::{Digest, Sha1};

use crate::error::{Error, Result};
use crate::protocol::constants::{
    Capabilities, StatusFlags, AUTH_PLUGIN_NAME, CHARSET_UTF8MB4, PROTOCOL_VERSION,
};
use crate::protocol::packet::{put_null_terminated, PayloadReader};

/// Generate the 20-byte auth scramble. Bytes are kept in the printable,
/// non-zero range so null-terminated parsing on the client side is safe.
pub fn generate_scramble() -> [u8; 20] {
    let mut rng = rand::thread_rng();
    let mut scramble = [0u8; 20];
    for b in &mut scramble {
        *b = rng.gen_range(0x21..0x7f);
    }
    scramble
}

/// Build the initial handshake payload.
pub fn build_handshake(server_version: &str, thread_id: u32, scramble: &[u8; 20]) -> Vec<u8> {
    let capabilities = Capabilities::server_default().bits();
    let mut payload = Vec::with_capacity(64 + server_version.len());

    payload.push(PROTOCOL_VERSION);
    put_null_terminated(&mut payload, server_version.as_bytes());
    payload.extend_from_slice(&thread_id.to_le_bytes());
    payload.extend_from_slice(&scramble[..8]);
    payload.push(0); // filler
    payload.extend_from_slice(&(capabilities as u16).to_le_bytes());
    payload.push(CHARSET_UTF8MB4);
    payload.extend_from_slice(&StatusFlags::AUTOCOMMIT.bits().to_le_bytes());
    payload.extend_from_slice(&((capabilities >> 16) as u16).to_le_bytes());
    payload.push(21); // auth data length: 20 bytes of scramble + terminator
    payload.extend_from_slice(&[0u8; 10]);
    payload.extend_from_slice(&scramble[8..20]);
    payload.push(0);
    put_null_terminated(&mut payload, AUTH_PLUGIN_NAME.as_bytes());
    payload
}

/// Parsed client handshake response.
#[derive(Debug, Clone)]
pub struct HandshakeResponse {
    pub capabilities: Capabilities,
    pub max_packet_size: u32,
    pub charset: u8,
    pub username: String,
    pub auth_response: Vec<u8>,
    pub database: Option<String>,
}

/// Parse the client's handshake response packet.
pub fn parse_handshake_response(payload: &[u8]) -> Result<HandshakeResponse> {
    let mut reader = PayloadReader::new(payload);
    let capability_bits = reader.read_u32_le()?;
    let capabilities = Capabilities::from_bits_truncate(capability_bits);
    if !capabilities.contains(Capabilities::PROTOCOL_41) {
        return Err(Error::Protocol(
            "client does not speak protocol 4.1".into(),
        ));
    }
    let max_packet_size = reader.read_u32_le()?;
    let charset = reader.read_u8()?;
    reader.skip(23)?;

    let username = String::from_utf8(reader.read_null_terminated()?.to_vec())
        .map_err(|_| Error::Protocol("username is not valid UTF-8".into()))?;

    let auth_response = if capabilities.contains(Capabilities::SECURE_CONNECTION) {
        let len = reader.read_u8()? as usize;
        reader.read_bytes(len)?.to_vec()
    } else {
        reader.read_null_terminated()?.to_vec()
    };

    let database = if capabilities.contains(Capabilities::CONNECT_WITH_DB) && reader.remaining() > 0
    {
        let raw = reader.read_null_terminated()?;
        if raw.is_empty() {
            None
        } else {
            Some(
                String::from_utf8(raw.to_vec())
                    .map_err(|_| Error::Protocol("database name is not valid UTF-8".into()))?,
            )
        }
    } else {
        None
    };

    Ok(HandshakeResponse {
        capabilities,
        max_packet_size,
        charset,
        username,
        auth_response,
        database,
    })
}

/// Expected mysql_native_password auth response for a cleartext password.
pub fn scramble_password(password: &str, scramble: &[u8; 20]) -> Vec<u8> {
    if password.is_empty() {
        return Vec::new();
    }
    let stage1 = Sha1::digest(password.as_bytes());
    let stage2 = Sha1::digest(stage1);
    let mut hasher = Sha1::new();
    hasher.update(scramble);
    hasher.update(stage2);
    let rhs = hasher.finalize();
    stage1
        .iter()
        .zip(rhs.iter())
        .map(|(a, b)| a ^ b)
        .collect()
}

/// Constant-shape verification of the client's auth response.
pub fn verify_auth(password: &str, scramble: &[u8; 20], auth_response: &[u8]) -> bool {
    let expected = scramble_password(password, scramble);
    if expected.len() != auth_response.len() {
        return false;
    }
    expected
        .iter()
        .zip(auth_response.iter())
        .fold(0u8, |acc, (a, b)| acc | (a ^ b))
        == 0
}

#[cfg(test)]
mod tests {
    use super::*;

    fn response_payload(user: &str, auth: &[u8], db: Option<&str>) -> Vec<u8> {
        let mut caps = Capabilities::PROTOCOL_41 | Capabilities::SECURE_CONNECTION;
        if db.is_some() {
            caps |= Capabilities::CONNECT_WITH_DB;
        }
        let mut payload = Vec::new();
        payload.extend_from_slice(&caps.bits().to_le_bytes());
        payload.extend_from_slice(&(16 * 1024 * 1024u32).to_le_bytes());
        payload.push(CHARSET_UTF8MB4);
        payload.extend_from_slice(&[0u8; 23]);
        put_null_terminated(&mut payload, user.as_bytes());
        payload.push(auth.len() as u8);
        payload.extend_from_slice(auth);
        if let Some(db) = db {
            put_null_terminated(&mut payload, db.as_bytes());
        }
        payload
    }

    #[test]
    fn test_handshake_layout() {
        let scramble = [b'x'; 20];
        let payload = build_handshake("SqlExc", 1, &scramble);
        assert_eq!(payload[0], 10);
        // server version null-terminated right after the protocol byte
        assert_eq!(&payload[1..7], b"SqlExc");
        assert_eq!(payload[7], 0);
        // thread id
        assert_eq!(&payload[8..12], &1u32.to_le_bytes());
        // first scramble chunk
        assert_eq!(&payload[12..20], &scramble[..8]);
        assert_eq!(payload[20], 0);
        // trailing auth plugin name
        assert!(payload.ends_with(b"mysql_native_password\0"));
    }

    #[test]
    fn test_parse_handshake_response() {
        let scramble = generate_scramble();
        let auth = scramble_password("secret", &scramble);
        let payload = response_payload("root", &auth, Some("shop"));
        let parsed = parse_handshake_response(&payload).unwrap();
        assert_eq!(parsed.username, "root");
        assert_eq!(parsed.database.as_deref(), Some("shop"));
        assert!(verify_auth("secret", &scramble, &parsed.auth_response));
        assert!(!verify_auth("wrong", &scramble, &parsed.auth_response));
    }

    #[test]
    fn test_empty_password_empty_auth() {
        let scramble = generate_scramble();
        assert!(scramble_password("", &scramble).is_empty());
        assert!(verify_auth("", &scramble, &[]));
    }

    #[test]
    fn test_rejects_pre_41_clients() {
        let mut payload = Vec::new();
        payload.extend_from_slice(&0u32.to_le_bytes());
        payload.extend_from_slice(&[0u8; 28]);
        assert!(matches!(
            parse_handshake_response(&payload),
            Err(Error::Protocol(_))
        ));
    }
}
