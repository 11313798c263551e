//! Server response packets and result-set framing
//!
//! Framing order for a result set: column-count packet, one column
//! definition per column, EOF, row packets, terminal EOF. Every packet takes
//! the next sequence id from the session's counter.

use tokio::io::AsyncWrite;

use crate::error::{Error, Result};
use crate::protocol::constants::{column_type, StatusFlags, CHARSET_UTF8MB4, NULL_BYTE};
use crate::protocol::packet::{put_lenenc_int, put_lenenc_str, write_packet};
use crate::storage::schema::{ColumnDescriptor, SemanticType};
use crate::storage::value::{Row, Value};

/// Build an OK packet payload.
pub fn build_ok(
    affected_rows: u64,
    last_insert_id: u64,
    status: StatusFlags,
    warnings: u16,
    info: Option<&str>,
) -> Vec<u8> {
    let mut payload = Vec::with_capacity(16);
    payload.push(0x00);
    put_lenenc_int(&mut payload, affected_rows);
    put_lenenc_int(&mut payload, last_insert_id);
    payload.extend_from_slice(&status.bits().to_le_bytes());
    payload.extend_from_slice(&warnings.to_le_bytes());
    if let Some(info) = info {
        payload.extend_from_slice(info.as_bytes());
    }
    payload
}

/// Build an ERR packet payload from a gateway error.
pub fn build_err(err: &Error) -> Vec<u8> {
    let mut payload = Vec::with_capacity(16);
    payload.push(0xff);
    payload.extend_from_slice(&err.mysql_code().to_le_bytes());
    payload.push(b'#');
    payload.extend_from_slice(err.sql_state().as_bytes());
    payload.extend_from_slice(err.to_string().as_bytes());
    payload
}

/// Build an EOF packet payload. Only legal while the payload stays below 9
/// bytes, which this fixed layout guarantees.
pub fn build_eof(warnings: u16, status: StatusFlags) -> Vec<u8> {
    let mut payload = Vec::with_capacity(5);
    payload.push(0xfe);
    payload.extend_from_slice(&warnings.to_le_bytes());
    payload.extend_from_slice(&status.bits().to_le_bytes());
    payload
}

/// Encode a column definition packet payload.
pub fn build_column_definition(schema_name: &str, table: &str, column: &ColumnDescriptor) -> Vec<u8> {
    let mut payload = Vec::with_capacity(64);
    put_lenenc_str(&mut payload, b"def");
    put_lenenc_str(&mut payload, schema_name.as_bytes());
    put_lenenc_str(&mut payload, table.as_bytes());
    put_lenenc_str(&mut payload, table.as_bytes());
    put_lenenc_str(&mut payload, column.name.as_bytes());
    put_lenenc_str(&mut payload, column.name.as_bytes());
    payload.push(0x0c); // fixed-length filler
    payload.extend_from_slice(&u16::from(CHARSET_UTF8MB4).to_le_bytes());
    payload.extend_from_slice(&column.data_type.column_length().to_le_bytes());
    payload.push(column.data_type.mysql_type());
    let mut flags: u16 = 0;
    if !column.nullable {
        flags |= 0x0001; // NOT_NULL
    }
    if column.primary_key {
        flags |= 0x0002; // PRI_KEY
    }
    if column.auto_increment {
        flags |= 0x0200; // AUTO_INCREMENT
    }
    payload.extend_from_slice(&flags.to_le_bytes());
    payload.push(match column.data_type {
        SemanticType::Float => 31,
        _ => 0,
    });
    payload.extend_from_slice(&[0, 0]); // reserved
    payload
}

/// Encode one text-protocol row: lenenc strings, NULL as 0xFB.
pub fn build_text_row(row: &Row) -> Vec<u8> {
    let mut payload = Vec::with_capacity(row.len() * 8);
    for value in row.values() {
        match value {
            Value::Null => payload.push(NULL_BYTE),
            v => put_lenenc_str(&mut payload, v.to_text().as_bytes()),
        }
    }
    payload
}

/// Encode one binary-protocol row (COM_STMT_EXECUTE responses): 0x00 header,
/// a null bitmap with a 2-bit offset, then values in column order.
pub fn build_binary_row(row: &Row, columns: &[ColumnDescriptor]) -> Vec<u8> {
    let mut payload = Vec::with_capacity(row.len() * 8 + 4);
    payload.push(0x00);
    let bitmap_len = (row.len() + 7 + 2) / 8;
    let bitmap_start = payload.len();
    payload.extend(std::iter::repeat(0u8).take(bitmap_len));
    for (i, value) in row.values().iter().enumerate() {
        if value.is_null() {
            let bit = i + 2;
            payload[bitmap_start + bit / 8] |= 1 << (bit % 8);
            continue;
        }
        match (value, columns.get(i).map(|c| c.data_type)) {
            (Value::Int(v), _) => payload.extend_from_slice(&v.to_le_bytes()),
            (Value::Uint(v), _) => payload.extend_from_slice(&v.to_le_bytes()),
            (Value::Float(v), _) => payload.extend_from_slice(&v.to_le_bytes()),
            (Value::Bool(v), _) => payload.push(u8::from(*v)),
            (v, _) => put_lenenc_str(&mut payload, v.to_text().as_bytes()),
        }
    }
    payload
}

/// Column-count packet payload.
pub fn build_column_count(n: usize) -> Vec<u8> {
    let mut payload = Vec::with_capacity(4);
    put_lenenc_int(&mut payload, n as u64);
    payload
}

/// COM_STMT_PREPARE response header payload.
pub fn build_stmt_prepare_ok(stmt_id: u32, num_columns: u16, num_params: u16) -> Vec<u8> {
    let mut payload = Vec::with_capacity(12);
    payload.push(0x00);
    payload.extend_from_slice(&stmt_id.to_le_bytes());
    payload.extend_from_slice(&num_columns.to_le_bytes());
    payload.extend_from_slice(&num_params.to_le_bytes());
    payload.push(0x00); // filler
    payload.extend_from_slice(&0u16.to_le_bytes()); // warnings
    payload
}

/// Streams a complete result set in framing order, pulling sequence ids from
/// the session counter it borrows.
pub struct ResultSetWriter<'a, S> {
    stream: &'a mut S,
    seq: &'a mut u8,
    schema_name: String,
    table: String,
    status: StatusFlags,
}

impl<'a, S> ResultSetWriter<'a, S>
where
    S: AsyncWrite + Unpin + Send,
{
    pub fn new(
        stream: &'a mut S,
        seq: &'a mut u8,
        schema_name: impl Into<String>,
        table: impl Into<String>,
        status: StatusFlags,
    ) -> Self {
        Self {
            stream,
            seq,
            schema_name: schema_name.into(),
            table: table.into(),
            status,
        }
    }

    fn next_seq(&mut self) -> u8 {
        let id = *self.seq;
        *self.seq = self.seq.wrapping_add(1);
        id
    }

    async fn send(&mut self, payload: &[u8]) -> Result<()> {
        let seq = self.next_seq();
        write_packet(self.stream, seq, payload).await
    }

    /// Send the header: column count, column definitions, EOF.
    pub async fn write_header(&mut self, columns: &[ColumnDescriptor]) -> Result<()> {
        self.send(&build_column_count(columns.len())).await?;
        for column in columns {
            let payload = build_column_definition(&self.schema_name, &self.table, column);
            self.send(&payload).await?;
        }
        let eof = build_eof(0, self.status);
        self.send(&eof).await
    }

    /// Send one text-protocol row.
    pub async fn write_row(&mut self, row: &Row) -> Result<()> {
        self.send(&build_text_row(row)).await
    }

    /// Send one binary-protocol row.
    pub async fn write_binary_row(&mut self, row: &Row, columns: &[ColumnDescriptor]) -> Result<()> {
        self.send(&build_binary_row(row, columns)).await
    }

    /// Terminal EOF.
    pub async fn finish(mut self) -> Result<()> {
        let eof = build_eof(0, self.status);
        self.send(&eof).await?;
        crate::protocol::packet::flush(self.stream).await
    }

    /// Abort an in-flight result set with an ERR packet at the current
    /// sequence id. Rows already framed are not recalled.
    pub async fn abort(mut self, err: &Error) -> Result<()> {
        let payload = build_err(err);
        self.send(&payload).await?;
        crate::protocol::packet::flush(self.stream).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::packet::{decode_packet, PayloadReader};
    use bytes::BytesMut;

    fn columns() -> Vec<ColumnDescriptor> {
        vec![
            ColumnDescriptor {
                name: "id".into(),
                data_type: SemanticType::Int,
                nullable: false,
                primary_key: true,
                auto_increment: false,
                default: None,
            },
            ColumnDescriptor::new("name", SemanticType::String),
        ]
    }

    #[test]
    fn test_ok_packet_layout() {
        let payload = build_ok(2, 7, StatusFlags::AUTOCOMMIT, 0, None);
        assert_eq!(payload[0], 0x00);
        let mut reader = PayloadReader::new(&payload[1..]);
        assert_eq!(reader.read_lenenc_int().unwrap(), 2);
        assert_eq!(reader.read_lenenc_int().unwrap(), 7);
        assert_eq!(reader.read_u16_le().unwrap(), 0x0002);
        assert_eq!(reader.read_u16_le().unwrap(), 0);
    }

    #[test]
    fn test_err_packet_layout() {
        let err = Error::TableNotFound("users".into());
        let payload = build_err(&err);
        assert_eq!(payload[0], 0xff);
        assert_eq!(u16::from_le_bytes([payload[1], payload[2]]), 1146);
        assert_eq!(payload[3], b'#');
        assert_eq!(&payload[4..9], b"42S02");
        assert!(String::from_utf8_lossy(&payload[9..]).contains("users"));
    }

    #[test]
    fn test_eof_stays_small() {
        let payload = build_eof(0, StatusFlags::AUTOCOMMIT);
        assert_eq!(payload[0], 0xfe);
        assert!(payload.len() < 9);
    }

    #[test]
    fn test_text_row_null_marker() {
        let row = Row::from_pairs(vec![
            ("a".into(), Value::Int(2)),
            ("b".into(), Value::Null),
            ("c".into(), Value::Str("Bob".into())),
        ]);
        let payload = build_text_row(&row);
        // "2" as lenenc, then 0xFB, then "Bob"
        assert_eq!(payload[0], 1);
        assert_eq!(payload[1], b'2');
        assert_eq!(payload[2], NULL_BYTE);
        assert_eq!(payload[3], 3);
        assert_eq!(&payload[4..7], b"Bob");
    }

    #[tokio::test]
    async fn test_result_set_framing_and_sequence_ids() {
        let (mut server, mut client) = tokio::io::duplex(4096);
        let mut seq: u8 = 1;
        let cols = columns();
        {
            let mut writer = ResultSetWriter::new(
                &mut server,
                &mut seq,
                "default",
                "users",
                StatusFlags::AUTOCOMMIT,
            );
            writer.write_header(&cols).await.unwrap();
            let row = Row::from_pairs(vec![
                ("id".into(), Value::Int(2)),
                ("name".into(), Value::Str("Bob".into())),
            ]);
            writer.write_row(&row).await.unwrap();
            writer.finish().await.unwrap();
        }
        drop(server);

        let mut buf = BytesMut::new();
        let mut chunk = [0u8; 1024];
        use tokio::io::AsyncReadExt;
        loop {
            match client.read(&mut chunk).await {
                Ok(0) | Err(_) => break,
                Ok(n) => buf.extend_from_slice(&chunk[..n]),
            }
        }

        let mut packets = Vec::new();
        while let Some(p) = decode_packet(&mut buf).unwrap() {
            packets.push(p);
        }
        // column count, 2 column defs, EOF, 1 row, EOF
        assert_eq!(packets.len(), 6);
        for (i, p) in packets.iter().enumerate() {
            assert_eq!(p.header.sequence_id, (i + 1) as u8, "packet {i}");
        }
        assert_eq!(packets[0].payload, vec![2]);
        assert_eq!(packets[3].payload[0], 0xfe);
        assert_eq!(packets[5].payload[0], 0xfe);
    }

    #[test]
    fn test_binary_row_null_bitmap() {
        let cols = columns();
        let row = Row::from_pairs(vec![
            ("id".into(), Value::Int(5)),
            ("name".into(), Value::Null),
        ]);
        let payload = build_binary_row(&row, &cols);
        assert_eq!(payload[0], 0x00);
        // second column null: bit index 3 of the bitmap byte
        assert_eq!(payload[1] & (1 << 3), 1 << 3);
        assert_eq!(&payload[2..10], &5i64.to_le_bytes());
    }
}
