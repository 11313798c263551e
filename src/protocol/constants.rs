//! MySQL protocol constants

use bitflags::bitflags;

/// Protocol version sent in the initial handshake.
pub const PROTOCOL_VERSION: u8 = 10;

/// Auth plugin advertised by the server.
pub const AUTH_PLUGIN_NAME: &str = "mysql_native_password";

/// utf8mb4_general_ci
pub const CHARSET_UTF8MB4: u8 = 45;

/// Payloads above this are protocol violations.
pub const MAX_PAYLOAD_LEN: usize = 16 * 1024 * 1024;

/// Marker byte for NULL in text-protocol rows.
pub const NULL_BYTE: u8 = 0xFB;

/// Client command bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    Quit,
    InitDb,
    Query,
    FieldList,
    Ping,
    StmtPrepare,
    StmtExecute,
    StmtClose,
    Unknown(u8),
}

impl From<u8> for Command {
    fn from(byte: u8) -> Self {
        match byte {
            0x01 => Command::Quit,
            0x02 => Command::InitDb,
            0x03 => Command::Query,
            0x04 => Command::FieldList,
            0x0e => Command::Ping,
            0x16 => Command::StmtPrepare,
            0x17 => Command::StmtExecute,
            0x19 => Command::StmtClose,
            other => Command::Unknown(other),
        }
    }
}

bitflags! {
    /// Capability flags exchanged during the handshake.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Capabilities: u32 {
        const LONG_PASSWORD     = 0x0000_0001;
        const FOUND_ROWS        = 0x0000_0002;
        const LONG_FLAG         = 0x0000_0004;
        const CONNECT_WITH_DB   = 0x0000_0008;
        const PROTOCOL_41       = 0x0000_0200;
        const TRANSACTIONS      = 0x0000_2000;
        const SECURE_CONNECTION = 0x0000_8000;
        const PLUGIN_AUTH       = 0x0008_0000;
        const DEPRECATE_EOF     = 0x0100_0000;
    }
}

impl Capabilities {
    /// Capabilities this server advertises.
    pub fn server_default() -> Self {
        Capabilities::LONG_PASSWORD
            | Capabilities::FOUND_ROWS
            | Capabilities::LONG_FLAG
            | Capabilities::CONNECT_WITH_DB
            | Capabilities::PROTOCOL_41
            | Capabilities::TRANSACTIONS
            | Capabilities::SECURE_CONNECTION
            | Capabilities::PLUGIN_AUTH
    }
}

bitflags! {
    /// Server status flags carried in OK and EOF packets.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct StatusFlags: u16 {
        const IN_TRANSACTION     = 0x0001;
        const AUTOCOMMIT         = 0x0002;
        const MORE_RESULTS_EXIST = 0x0008;
    }
}

/// Column type bytes used in column definitions.
pub mod column_type {
    pub const TINY: u8 = 1;
    pub const LONG: u8 = 3;
    pub const DOUBLE: u8 = 5;
    pub const LONGLONG: u8 = 8;
    pub const DATETIME: u8 = 12;
    pub const VAR_STRING: u8 = 253;
    pub const BLOB: u8 = 252;
    pub const JSON: u8 = 245;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_command_dispatch_bytes() {
        assert_eq!(Command::from(0x01), Command::Quit);
        assert_eq!(Command::from(0x03), Command::Query);
        assert_eq!(Command::from(0x0e), Command::Ping);
        assert_eq!(Command::from(0x16), Command::StmtPrepare);
        assert_eq!(Command::from(0x42), Command::Unknown(0x42));
    }

    #[test]
    fn test_status_flags_are_bits() {
        let s = StatusFlags::AUTOCOMMIT | StatusFlags::MORE_RESULTS_EXIST;
        assert_eq!(s.bits(), 0x000a);
    }
}
