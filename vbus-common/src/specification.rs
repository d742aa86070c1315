//! Projection of consolidated headers into named, typed packet fields.
//!
//! Decoding rules are looked up by the channel-agnostic packet key of each
//! header (`DDDD_SSSS_PP_CCCC`). Every rule extracts a little-endian integer
//! from the frame payload and scales it by a factor. Headers without rules
//! contribute no fields.
use std::collections::HashMap;
use std::path::Path;

use serde::Deserialize;
use thiserror::Error;

use crate::header::Header;

const DEFAULT_SPECIFICATION: &str = include_str!("../resources/specification.json");

#[derive(Error, Debug, PartialEq)]
pub enum DecodingError {
    #[error("field {field_id} needs {needed} bytes but packet {packet_id} carries {available}")]
    Truncated {
        packet_id: String,
        field_id: String,
        needed: usize,
        available: usize,
    },
}

#[derive(Error, Debug)]
pub enum SpecificationError {
    #[error("failed to read specification file: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse specification: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("field {name:?} of packet {packet} has unsupported size {size}, expected 1 to 4 bytes")]
    UnsupportedSize {
        packet: String,
        name: String,
        size: usize,
    },
    #[error("field {name:?} of packet {packet} has offset {offset} past any frame")]
    OffsetOutOfRange {
        packet: String,
        name: String,
        offset: usize,
    },
}

/// Formatting metadata carried along with a decoded value.
#[derive(Debug, Clone, PartialEq)]
pub struct FieldType {
    /// Number of decimal places used when the value is rendered as text.
    pub precision: usize,
    pub unit: String,
}

/// A decoded value of one packet field.
#[derive(Debug, Clone, PartialEq)]
pub struct PacketField {
    pub id: String,
    pub name: String,
    pub raw_value: f64,
    pub field_type: FieldType,
}

pub trait Specification: Send + Sync {
    /// Decodes the headers in order. Must not depend on anything but the
    /// headers and the rules the specification was built with.
    fn packet_fields(&self, headers: &[Header]) -> Result<Vec<PacketField>, DecodingError>;
}

#[derive(Debug, Clone, Deserialize)]
pub struct FieldSpec {
    pub offset: usize,
    pub size: usize,
    pub factor: f64,
    #[serde(default)]
    pub signed: bool,
    pub name: String,
    #[serde(default)]
    pub precision: usize,
    #[serde(default)]
    pub unit: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PacketSpec {
    pub name: String,
    pub fields: Vec<FieldSpec>,
}

/// A [`Specification`] backed by a JSON table of packet layouts.
#[derive(Debug, Clone)]
pub struct TableSpecification {
    packets: HashMap<String, PacketSpec>,
}

impl TableSpecification {
    /// The built-in table shipped with the crate.
    pub fn default_specification() -> Result<Self, SpecificationError> {
        Self::from_json(DEFAULT_SPECIFICATION)
    }

    pub fn from_path(path: impl AsRef<Path>) -> Result<Self, SpecificationError> {
        let contents = std::fs::read_to_string(path)?;
        Self::from_json(&contents)
    }

    pub fn from_json(contents: &str) -> Result<Self, SpecificationError> {
        let packets: HashMap<String, PacketSpec> = serde_json::from_str(contents)?;

        for (key, packet) in &packets {
            if let Some(field) = packet.fields.iter().find(|f| !(1..=4).contains(&f.size)) {
                return Err(SpecificationError::UnsupportedSize {
                    packet: key.clone(),
                    name: field.name.clone(),
                    size: field.size,
                });
            }
            if let Some(field) = packet
                .fields
                .iter()
                .find(|f| f.offset.checked_add(f.size).is_none())
            {
                return Err(SpecificationError::OffsetOutOfRange {
                    packet: key.clone(),
                    name: field.name.clone(),
                    offset: field.offset,
                });
            }
        }

        Ok(Self { packets })
    }

    pub fn packet_count(&self) -> usize {
        self.packets.len()
    }

    pub fn packet_name(&self, header: &Header) -> Option<&str> {
        self.packets
            .get(&header.packet_key())
            .map(|packet| packet.name.as_str())
    }
}

impl Specification for TableSpecification {
    fn packet_fields(&self, headers: &[Header]) -> Result<Vec<PacketField>, DecodingError> {
        let mut fields = Vec::new();

        for header in headers {
            let Some(packet) = self.packets.get(&header.packet_key()) else {
                continue;
            };
            let packet_id = header.id();

            for spec in &packet.fields {
                let field_id = format!("{}_{:03}_{}_0", packet_id, spec.offset, spec.size);
                let end = spec.offset.saturating_add(spec.size);
                let Some(bytes) = header.frame_data.get(spec.offset..end) else {
                    return Err(DecodingError::Truncated {
                        packet_id,
                        field_id,
                        needed: end,
                        available: header.frame_data.len(),
                    });
                };

                fields.push(PacketField {
                    id: field_id,
                    name: spec.name.clone(),
                    raw_value: read_integer(bytes, spec.signed) as f64 * spec.factor,
                    field_type: FieldType {
                        precision: spec.precision,
                        unit: spec.unit.clone(),
                    },
                });
            }
        }

        Ok(fields)
    }
}

/// Little-endian integer of up to four bytes, sign-extended when `signed`.
fn read_integer(bytes: &[u8], signed: bool) -> i64 {
    let raw = bytes
        .iter()
        .rev()
        .fold(0u32, |acc, byte| (acc << 8) | u32::from(*byte));

    let bits = bytes.len() * 8;
    if signed && bits < 32 && raw & (1 << (bits - 1)) != 0 {
        i64::from(raw) - (1i64 << bits)
    } else if signed && bits == 32 {
        i64::from(raw as i32)
    } else {
        i64::from(raw)
    }
}
