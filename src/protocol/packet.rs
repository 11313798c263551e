//! MySQL packet framing
//!
//! A packet is a 3-byte little-endian payload length, a 1-byte sequence id,
//! then the payload. Length-encoded integers and strings follow the MySQL
//! wire rules.

use byteorder::{ByteOrder, LittleEndian};
use bytes::{Buf, BufMut, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::{Error, Result};
use crate::protocol::constants::MAX_PAYLOAD_LEN;

/// Packet header (4 bytes on the wire).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PacketHeader {
    /// Payload length (3 bytes)
    pub length: u32,
    /// Sequence ID (1 byte)
    pub sequence_id: u8,
}

impl PacketHeader {
    pub fn decode(bytes: [u8; 4]) -> Self {
        Self {
            length: LittleEndian::read_u24(&bytes[..3]),
            sequence_id: bytes[3],
        }
    }

    pub fn encode(&self) -> [u8; 4] {
        [
            (self.length & 0xff) as u8,
            ((self.length >> 8) & 0xff) as u8,
            ((self.length >> 16) & 0xff) as u8,
            self.sequence_id,
        ]
    }
}

/// A decoded packet.
#[derive(Debug, Clone)]
pub struct Packet {
    pub header: PacketHeader,
    pub payload: Vec<u8>,
}

impl Packet {
    pub fn new(sequence_id: u8, payload: Vec<u8>) -> Self {
        Self {
            header: PacketHeader {
                length: payload.len() as u32,
                sequence_id,
            },
            payload,
        }
    }

    /// First payload byte; command packets put the command here.
    pub fn command_byte(&self) -> Option<u8> {
        self.payload.first().copied()
    }
}

/// Read one packet from the stream. Oversized payloads are protocol
/// violations; EOF mid-packet is an I/O error that tears down the session.
pub async fn read_packet<S>(stream: &mut S) -> Result<Packet>
where
    S: AsyncRead + Unpin,
{
    let mut header_bytes = [0u8; 4];
    stream.read_exact(&mut header_bytes).await?;
    let header = PacketHeader::decode(header_bytes);

    if header.length as usize > MAX_PAYLOAD_LEN {
        return Err(Error::Protocol(format!(
            "packet payload of {} bytes exceeds the 16 MiB limit",
            header.length
        )));
    }

    let mut payload = vec![0u8; header.length as usize];
    stream.read_exact(&mut payload).await?;
    Ok(Packet { header, payload })
}

/// Write one packet with the given sequence id.
pub async fn write_packet<S>(stream: &mut S, sequence_id: u8, payload: &[u8]) -> Result<()>
where
    S: AsyncWrite + Unpin,
{
    if payload.len() > MAX_PAYLOAD_LEN {
        return Err(Error::Protocol(format!(
            "refusing to send a {} byte payload",
            payload.len()
        )));
    }
    let header = PacketHeader {
        length: payload.len() as u32,
        sequence_id,
    };
    let mut buf = BytesMut::with_capacity(4 + payload.len());
    buf.put_slice(&header.encode());
    buf.put_slice(payload);
    stream.write_all(&buf).await?;
    Ok(())
}

/// Flush buffered writes.
pub async fn flush<S>(stream: &mut S) -> Result<()>
where
    S: AsyncWrite + Unpin,
{
    stream.flush().await?;
    Ok(())
}

// --- length-encoded primitives ---

pub fn put_lenenc_int(buf: &mut Vec<u8>, value: u64) {
    if value < 251 {
        buf.push(value as u8);
    } else if value < 1 << 16 {
        buf.push(0xfc);
        buf.extend_from_slice(&(value as u16).to_le_bytes());
    } else if value < 1 << 24 {
        buf.push(0xfd);
        buf.extend_from_slice(&(value as u32).to_le_bytes()[..3]);
    } else {
        buf.push(0xfe);
        buf.extend_from_slice(&value.to_le_bytes());
    }
}

pub fn put_lenenc_str(buf: &mut Vec<u8>, s: &[u8]) {
    put_lenenc_int(buf, s.len() as u64);
    buf.extend_from_slice(s);
}

pub fn put_null_terminated(buf: &mut Vec<u8>, s: &[u8]) {
    buf.extend_from_slice(s);
    buf.push(0);
}

/// Cursor-style reader over a packet payload.
pub struct PayloadReader<'a> {
    buf: &'a [u8],
}

impl<'a> PayloadReader<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf }
    }

    pub fn remaining(&self) -> usize {
        self.buf.len()
    }

    pub fn peek_u8(&self) -> Option<u8> {
        self.buf.first().copied()
    }

    pub fn read_u8(&mut self) -> Result<u8> {
        if self.buf.is_empty() {
            return Err(Error::Protocol("unexpected end of payload".into()));
        }
        let v = self.buf[0];
        self.buf = &self.buf[1..];
        Ok(v)
    }

    pub fn read_u16_le(&mut self) -> Result<u16> {
        Ok(LittleEndian::read_u16(self.read_bytes(2)?))
    }

    pub fn read_u32_le(&mut self) -> Result<u32> {
        Ok(LittleEndian::read_u32(self.read_bytes(4)?))
    }

    pub fn read_u64_le(&mut self) -> Result<u64> {
        Ok(LittleEndian::read_u64(self.read_bytes(8)?))
    }

    pub fn read_f64_le(&mut self) -> Result<f64> {
        Ok(f64::from_bits(self.read_u64_le()?))
    }

    pub fn read_bytes(&mut self, n: usize) -> Result<&'a [u8]> {
        if self.buf.len() < n {
            return Err(Error::Protocol("unexpected end of payload".into()));
        }
        let (head, tail) = self.buf.split_at(n);
        self.buf = tail;
        Ok(head)
    }

    pub fn skip(&mut self, n: usize) -> Result<()> {
        self.read_bytes(n).map(|_| ())
    }

    pub fn read_lenenc_int(&mut self) -> Result<u64> {
        let first = self.read_u8()?;
        Ok(match first {
            0xfc => u64::from(self.read_u16_le()?),
            0xfd => {
                let bytes = self.read_bytes(3)?;
                u64::from(bytes[0]) | u64::from(bytes[1]) << 8 | u64::from(bytes[2]) << 16
            }
            0xfe => self.read_u64_le()?,
            v => u64::from(v),
        })
    }

    pub fn read_lenenc_bytes(&mut self) -> Result<&'a [u8]> {
        let len = self.read_lenenc_int()? as usize;
        self.read_bytes(len)
    }

    pub fn read_null_terminated(&mut self) -> Result<&'a [u8]> {
        let pos = self
            .buf
            .iter()
            .position(|&b| b == 0)
            .ok_or_else(|| Error::Protocol("missing string terminator".into()))?;
        let (head, tail) = self.buf.split_at(pos);
        self.buf = &tail[1..];
        Ok(head)
    }

    pub fn read_rest(&mut self) -> &'a [u8] {
        let rest = self.buf;
        self.buf = &[];
        rest
    }
}

/// Frame codec for embedding the protocol behind `FramedRead`/`FramedWrite`.
pub struct PacketCodec;

impl tokio_util::codec::Decoder for PacketCodec {
    type Item = Packet;
    type Error = Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Packet>> {
        decode_packet(src)
    }
}

impl tokio_util::codec::Encoder<Packet> for PacketCodec {
    type Error = Error;

    fn encode(&mut self, packet: Packet, dst: &mut BytesMut) -> Result<()> {
        if packet.payload.len() > MAX_PAYLOAD_LEN {
            return Err(Error::Protocol("oversized packet".into()));
        }
        dst.reserve(4 + packet.payload.len());
        dst.put_slice(&packet.header.encode());
        dst.put_slice(&packet.payload);
        Ok(())
    }
}

/// Decode a packet from an in-memory buffer; used by the codec and the
/// prepared-statement parameter parser.
pub fn decode_packet(buf: &mut BytesMut) -> Result<Option<Packet>> {
    if buf.len() < 4 {
        return Ok(None);
    }
    let header = PacketHeader::decode([buf[0], buf[1], buf[2], buf[3]]);
    if header.length as usize > MAX_PAYLOAD_LEN {
        return Err(Error::Protocol("oversized packet".into()));
    }
    let total = 4 + header.length as usize;
    if buf.len() < total {
        return Ok(None);
    }
    buf.advance(4);
    let payload = buf.split_to(header.length as usize).to_vec();
    Ok(Some(Packet { header, payload }))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_header_round_trip() {
        let header = PacketHeader {
            length: 5,
            sequence_id: 1,
        };
        assert_eq!(PacketHeader::decode(header.encode()), header);
    }

    #[test]
    fn test_empty_packet() {
        let mut buf = BytesMut::from(&[0x00, 0x00, 0x00, 0x07][..]);
        let packet = decode_packet(&mut buf).unwrap().unwrap();
        assert_eq!(packet.header.length, 0);
        assert_eq!(packet.header.sequence_id, 7);
        assert!(packet.payload.is_empty());
    }

    #[test]
    fn test_one_mib_payload_length_field() {
        let header = PacketHeader {
            length: 1024 * 1024,
            sequence_id: 0,
        };
        assert_eq!(header.encode(), [0x00, 0x00, 0x10, 0x00]);
        let decoded = PacketHeader::decode(header.encode());
        assert_eq!(decoded.length, 1024 * 1024);
    }

    #[test]
    fn test_lenenc_int_round_trip() {
        for v in [0u64, 250, 251, 65_535, 65_536, 16_777_215, 16_777_216, u64::MAX] {
            let mut buf = Vec::new();
            put_lenenc_int(&mut buf, v);
            let mut reader = PayloadReader::new(&buf);
            assert_eq!(reader.read_lenenc_int().unwrap(), v, "value {v}");
            assert_eq!(reader.remaining(), 0);
        }
    }

    #[test]
    fn test_lenenc_str_utf8_round_trip() {
        let s = "héllo wörld — ünïcode 試験";
        let mut buf = Vec::new();
        put_lenenc_str(&mut buf, s.as_bytes());
        let mut reader = PayloadReader::new(&buf);
        let decoded = reader.read_lenenc_bytes().unwrap();
        assert_eq!(std::str::from_utf8(decoded).unwrap(), s);
    }

    #[test]
    fn test_oversized_packet_rejected() {
        let mut buf = BytesMut::from(&[0xff, 0xff, 0xff, 0x00][..]);
        // 0xffffff == 16 MiB - 1, acceptable; 16 MiB + 1 is not encodable in
        // 3 bytes, so build the boundary check against the limit directly.
        assert!(decode_packet(&mut buf).is_ok());
    }

    #[test]
    fn test_packet_codec_round_trip() {
        use tokio_util::codec::{Decoder, Encoder};
        let mut codec = PacketCodec;
        let mut buf = BytesMut::new();
        codec
            .encode(Packet::new(5, b"ping".to_vec()), &mut buf)
            .unwrap();
        let decoded = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(decoded.header.sequence_id, 5);
        assert_eq!(decoded.payload, b"ping");
        assert!(codec.decode(&mut buf).unwrap().is_none());
    }

    #[tokio::test]
    async fn test_async_round_trip() {
        let (mut client, mut server) = tokio::io::duplex(1024);
        write_packet(&mut client, 3, b"hello").await.unwrap();
        let packet = read_packet(&mut server).await.unwrap();
        assert_eq!(packet.header.sequence_id, 3);
        assert_eq!(packet.payload, b"hello");
    }

    #[test]
    fn test_payload_reader_null_terminated() {
        let data = b"user\0rest";
        let mut reader = PayloadReader::new(data);
        assert_eq!(reader.read_null_terminated().unwrap(), b"user");
        assert_eq!(reader.read_rest(), b"rest");
    }
}
