//! MySQL wire protocol: packet framing, handshake, response encoding.

pub mod constants;
pub mod handshake;
pub mod packet;
pub mod response;

pub use constants::{Capabilities, Command, StatusFlags};
pub use packet::{read_packet, write_packet, Packet, PacketHeader};
