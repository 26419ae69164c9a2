//! GATT serial transport framing
//!
//! Bean tunnels its command protocol through a single characteristic. A
//! command becomes one message:
//!
//! ```text
//! [len][0x00][cmd hi][cmd lo][payload ...][crc lo][crc hi]
//! ```
//!
//! where `len` counts the command id and payload, and the CRC-16/CCITT covers
//! everything before it. Messages are split into packets of at most 20 bytes,
//! each prefixed with a header byte:
//!
//! ```text
//! bit 7     first packet of a message
//! bits 5-6  rolling message count
//! bits 0-4  packets remaining after this one
//! ```
//!
//! Replies echo the request id with the high bit set.

use crc::{Crc, CRC_16_IBM_3740};
use serde::Serialize;
use thiserror::Error;

use crate::error::{LightBlueError, Result};

// ----------------------------------------------------------------------------
// Command Identifiers
// ----------------------------------------------------------------------------

/// Command identifiers understood by the Bean firmware
pub mod commands {
    pub const SERIAL_DATA: u16 = 0x0000;
    pub const BT_SET_LOCAL_NAME: u16 = 0x0504;
    pub const BT_GET_CONFIG: u16 = 0x0510;
    pub const BL_GET_META: u16 = 0x1003;
    pub const CC_LED_WRITE_ALL: u16 = 0x2001;
    pub const CC_ACCEL_READ: u16 = 0x2010;
}

/// Set on the command id of every reply
pub const RESPONSE_BIT: u16 = 0x8000;

/// Largest packet the characteristic accepts
pub const MAX_PACKET_SIZE: usize = 20;

const PACKET_BODY_SIZE: usize = MAX_PACKET_SIZE - 1;
const MAX_PACKETS_PER_MESSAGE: usize = 32;
const FIRST_PACKET_FLAG: u8 = 0x80;

// ----------------------------------------------------------------------------
// Messages
// ----------------------------------------------------------------------------

/// A decoded serial transport message
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SerialMessage {
    pub command: u16,
    pub payload: Vec<u8>,
}

impl SerialMessage {
    pub fn new(command: u16, payload: impl Into<Vec<u8>>) -> Self {
        Self {
            command,
            payload: payload.into(),
        }
    }

    pub fn is_response(&self) -> bool {
        self.command & RESPONSE_BIT != 0
    }

    /// Command id with the response bit cleared
    pub fn request_id(&self) -> u16 {
        self.command & !RESPONSE_BIT
    }

    /// Encode into the framed byte form, CRC included
    pub fn encode(&self) -> Result<Vec<u8>> {
        let length = u8::try_from(2 + self.payload.len()).map_err(|_| {
            LightBlueError::InvalidArgument(format!(
                "payload of {} bytes exceeds a single message",
                self.payload.len()
            ))
        })?;

        let mut out = Vec::with_capacity(self.payload.len() + 6);
        out.push(length);
        out.push(0x00);
        out.extend_from_slice(&self.command.to_be_bytes());
        out.extend_from_slice(&self.payload);
        let crc = crc16(&out);
        out.extend_from_slice(&crc.to_le_bytes());
        Ok(out)
    }

    /// Split the encoded message into transport packets
    pub fn to_packets(&self, message_count: u8) -> Result<Vec<Vec<u8>>> {
        let encoded = self.encode()?;
        let chunks: Vec<&[u8]> = encoded.chunks(PACKET_BODY_SIZE).collect();
        if chunks.len() > MAX_PACKETS_PER_MESSAGE {
            return Err(LightBlueError::InvalidArgument(format!(
                "message needs {} packets (max: {})",
                chunks.len(),
                MAX_PACKETS_PER_MESSAGE
            )));
        }

        let total = chunks.len();
        Ok(chunks
            .into_iter()
            .enumerate()
            .map(|(i, chunk)| {
                let mut header = ((message_count & 0x03) << 5) | ((total - i - 1) as u8 & 0x1F);
                if i == 0 {
                    header |= FIRST_PACKET_FLAG;
                }
                let mut packet = Vec::with_capacity(chunk.len() + 1);
                packet.push(header);
                packet.extend_from_slice(chunk);
                packet
            })
            .collect())
    }

    fn decode(frame: &[u8]) -> std::result::Result<Self, FrameError> {
        if frame.len() < 6 {
            return Err(FrameError::TooShort(frame.len()));
        }
        let length = usize::from(frame[0]);
        if frame.len() != length + 4 {
            return Err(FrameError::LengthMismatch {
                declared: length,
                actual: frame.len().saturating_sub(4),
            });
        }

        let (body, crc_bytes) = frame.split_at(length + 2);
        let expected = u16::from_le_bytes([crc_bytes[0], crc_bytes[1]]);
        let actual = crc16(body);
        if expected != actual {
            return Err(FrameError::Crc { expected, actual });
        }

        Ok(Self {
            command: u16::from_be_bytes([body[2], body[3]]),
            payload: body[4..].to_vec(),
        })
    }
}

/// Reasons a received frame is dropped
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FrameError {
    #[error("Empty packet")]
    EmptyPacket,

    #[error("Packet out of sequence (expected {expected} remaining, got {actual})")]
    OutOfSequence { expected: u8, actual: u8 },

    #[error("Continuation packet without a first packet")]
    MissingFirstPacket,

    #[error("Frame too short: {0} bytes")]
    TooShort(usize),

    #[error("Frame length mismatch: declared {declared}, got {actual}")]
    LengthMismatch { declared: usize, actual: usize },

    #[error("CRC mismatch: expected 0x{expected:04x}, computed 0x{actual:04x}")]
    Crc { expected: u16, actual: u16 },
}

// ----------------------------------------------------------------------------
// Reassembly
// ----------------------------------------------------------------------------

/// Rebuilds messages from notification packets
#[derive(Debug, Default)]
pub struct Reassembler {
    buffer: Vec<u8>,
    next_remaining: Option<u8>,
}

impl Reassembler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed one packet; yields a message once its final packet arrives
    pub fn push(&mut self, packet: &[u8]) -> std::result::Result<Option<SerialMessage>, FrameError> {
        let (&header, body) = packet.split_first().ok_or(FrameError::EmptyPacket)?;
        let remaining = header & 0x1F;

        if header & FIRST_PACKET_FLAG != 0 {
            // A new first packet discards whatever was partially received
            self.buffer.clear();
        } else {
            match self.next_remaining {
                None => return Err(FrameError::MissingFirstPacket),
                Some(expected) if expected != remaining => {
                    self.reset();
                    return Err(FrameError::OutOfSequence {
                        expected,
                        actual: remaining,
                    });
                }
                Some(_) => {}
            }
        }

        self.buffer.extend_from_slice(body);

        if remaining > 0 {
            self.next_remaining = Some(remaining - 1);
            return Ok(None);
        }

        let frame = std::mem::take(&mut self.buffer);
        self.next_remaining = None;
        SerialMessage::decode(&frame).map(Some)
    }

    pub fn reset(&mut self) {
        self.buffer.clear();
        self.next_remaining = None;
    }
}

const CCITT_FALSE: Crc<u16> = Crc::<u16>::new(&CRC_16_IBM_3740);

/// CRC-16/CCITT-FALSE (poly 0x1021, init 0xFFFF)
pub fn crc16(data: &[u8]) -> u16 {
    CCITT_FALSE.checksum(data)
}

// ----------------------------------------------------------------------------
// Reply Payloads
// ----------------------------------------------------------------------------

struct ByteReader<'a> {
    command: u16,
    buf: &'a [u8],
    pos: usize,
}

impl<'a> ByteReader<'a> {
    fn new(command: u16, buf: &'a [u8]) -> Self {
        Self { command, buf, pos: 0 }
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8]> {
        let end = self.pos + n;
        let buf = self.buf;
        let slice = buf.get(self.pos..end).ok_or_else(|| LightBlueError::InvalidResponse {
            command: self.command,
            reason: format!("expected at least {} bytes, got {}", end, buf.len()),
        })?;
        self.pos = end;
        Ok(slice)
    }

    fn u8(&mut self) -> Result<u8> {
        Ok(self.take(1)?[0])
    }

    fn u16(&mut self) -> Result<u16> {
        let b = self.take(2)?;
        Ok(u16::from_le_bytes([b[0], b[1]]))
    }

    fn i16(&mut self) -> Result<i16> {
        let b = self.take(2)?;
        Ok(i16::from_le_bytes([b[0], b[1]]))
    }

    fn u32(&mut self) -> Result<u32> {
        let b = self.take(4)?;
        Ok(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    fn name(&mut self, field_len: usize, used: u8) -> Result<String> {
        let raw = self.take(field_len)?;
        let used = usize::from(used).min(field_len);
        Ok(String::from_utf8_lossy(&raw[..used]).into_owned())
    }
}

/// Reply to `CC_ACCEL_READ`, axes in g
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct AccelerometerReading {
    pub x_axis: f32,
    pub y_axis: f32,
    pub z_axis: f32,
    /// Full-scale range in g
    pub sensitivity: u8,
}

impl AccelerometerReading {
    pub fn decode(payload: &[u8]) -> Result<Self> {
        let mut r = ByteReader::new(commands::CC_ACCEL_READ, payload);
        let (x, y, z) = (r.i16()?, r.i16()?, r.i16()?);
        let sensitivity = r.u8()?;
        let scale = f32::from(sensitivity) / 512.0;
        Ok(Self {
            x_axis: f32::from(x) * scale,
            y_axis: f32::from(y) * scale,
            z_axis: f32::from(z) * scale,
            sensitivity,
        })
    }
}

/// Reply to `BT_GET_CONFIG`
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BleConfig {
    pub advertising_interval: u16,
    pub connection_interval: u16,
    pub tx_power: u8,
    pub advertising_mode: u8,
    pub ibeacon_uuid: u16,
    pub ibeacon_major_id: u16,
    pub ibeacon_minor_id: u16,
    pub local_name: String,
}

impl BleConfig {
    pub fn decode(payload: &[u8]) -> Result<Self> {
        let mut r = ByteReader::new(commands::BT_GET_CONFIG, payload);
        let advertising_interval = r.u16()?;
        let connection_interval = r.u16()?;
        let tx_power = r.u8()?;
        let advertising_mode = r.u8()?;
        let ibeacon_uuid = r.u16()?;
        let ibeacon_major_id = r.u16()?;
        let ibeacon_minor_id = r.u16()?;
        let used = *payload.get(r.pos + LOCAL_NAME_LEN).ok_or_else(|| {
            LightBlueError::InvalidResponse {
                command: commands::BT_GET_CONFIG,
                reason: "missing local name length".to_string(),
            }
        })?;
        let local_name = r.name(LOCAL_NAME_LEN, used)?;

        Ok(Self {
            advertising_interval,
            connection_interval,
            tx_power,
            advertising_mode,
            ibeacon_uuid,
            ibeacon_major_id,
            ibeacon_minor_id,
            local_name,
        })
    }
}

/// Reply to `BL_GET_META`
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SketchMetadata {
    pub hex_size: u32,
    pub hex_crc: u32,
    pub timestamp: u32,
    pub sketch_name: String,
}

impl SketchMetadata {
    pub fn decode(payload: &[u8]) -> Result<Self> {
        let mut r = ByteReader::new(commands::BL_GET_META, payload);
        let hex_size = r.u32()?;
        let hex_crc = r.u32()?;
        let timestamp = r.u32()?;
        let used = r.u8()?;
        let sketch_name = r.name(LOCAL_NAME_LEN, used)?;

        Ok(Self {
            hex_size,
            hex_crc,
            timestamp,
            sketch_name,
        })
    }
}

/// Fixed width of name fields in Bean replies
pub const LOCAL_NAME_LEN: usize = 20;
