use std::fmt;

use time::OffsetDateTime;

/// A single VBus packet header as received from the record stream.
///
/// Only the addressing facets matter to consolidation: they form the
/// header's identity. The frame payload is opaque until a
/// [`Specification`](crate::specification::Specification) decodes it.
#[derive(Debug, Clone, PartialEq)]
pub struct Header {
    pub channel: u8,
    pub destination_address: u16,
    pub source_address: u16,
    pub protocol_version: u8,
    pub command: u16,
    pub timestamp: OffsetDateTime,
    pub frame_data: Vec<u8>,
}

impl Header {
    /// Stable identity of the packet type, e.g. `00_0010_4278_10_0100`.
    /// Two headers with the same identity carry successive values of the
    /// same packet.
    pub fn id(&self) -> String {
        format!(
            "{:02X}_{}",
            self.channel,
            packet_key(
                self.destination_address,
                self.source_address,
                self.protocol_version,
                self.command
            )
        )
    }

    /// The identity without the channel prefix, used to look up decoding rules.
    pub fn packet_key(&self) -> String {
        packet_key(
            self.destination_address,
            self.source_address,
            self.protocol_version,
            self.command,
        )
    }
}

fn packet_key(destination: u16, source: u16, protocol_version: u8, command: u16) -> String {
    format!(
        "{:04X}_{:04X}_{:02X}_{:04X}",
        destination, source, protocol_version, command
    )
}

impl fmt::Display for Header {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{} @ {}", self.id(), self.timestamp)
    }
}
