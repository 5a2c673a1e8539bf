//! MPEG-TS frame parsing.
//!
//! A frame is one fixed-size record of the source. Its first 188 bytes are
//! the transport packet proper; longer frames (192, 204, 208) carry a
//! trailer that never belongs to the payload.

use std::fmt;

use serde::Serialize;

use crate::error::DissectError;

/// TS packet size in bytes.
pub const TS_PACKET_SIZE: usize = 188;

/// TS sync byte (0x47).
pub const SYNC_BYTE: u8 = 0x47;

/// Accepted frame lengths, in probing order.
pub const FRAME_SIZES: [usize; 4] = [188, 192, 204, 208];

/// Number of distinct PIDs.
pub const PID_COUNT: usize = 0x2000;

/// A 13-bit Packet Identifier.
///
/// Construction validates the range once, so a `Pid` can index a
/// `PID_COUNT`-sized table directly.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(transparent)]
pub struct Pid(u16);

impl Pid {
    /// Null packet PID.
    pub const NULL: Pid = Pid(0x1FFF);

    /// Create a PID, rejecting values above 0x1FFF.
    pub fn new(value: u16) -> Result<Self, DissectError> {
        if value as usize >= PID_COUNT {
            return Err(DissectError::InvalidPid(value));
        }
        Ok(Pid(value))
    }

    pub(crate) const fn from_masked(value: u16) -> Self {
        Pid(value & 0x1FFF)
    }

    pub fn value(self) -> u16 {
        self.0
    }

    pub fn index(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for Pid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:04X}", self.0)
    }
}

/// Parsed TS packet header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TsHeader {
    /// Transport error indicator.
    pub transport_error: bool,
    /// Payload unit start indicator.
    pub payload_unit_start: bool,
    /// Transport priority.
    pub transport_priority: bool,
    /// Packet Identifier.
    pub pid: Pid,
    /// Transport scrambling control (2 bits).
    pub scrambling_control: u8,
    /// Adaptation field control (2 bits).
    pub adaptation_field_control: u8,
    /// Continuity counter (4 bits).
    pub continuity_counter: u8,
}

impl TsHeader {
    /// Parse the 4-byte header. `data` must hold at least 4 bytes.
    pub fn parse(data: &[u8]) -> Self {
        TsHeader {
            transport_error: data[1] & 0x80 != 0,
            payload_unit_start: data[1] & 0x40 != 0,
            transport_priority: data[1] & 0x20 != 0,
            pid: Pid::from_masked(((data[1] as u16 & 0x1F) << 8) | data[2] as u16),
            scrambling_control: (data[3] >> 6) & 0x03,
            adaptation_field_control: (data[3] >> 4) & 0x03,
            continuity_counter: data[3] & 0x0F,
        }
    }

    /// Check if packet has adaptation field.
    pub fn has_adaptation_field(&self) -> bool {
        self.adaptation_field_control & 0x02 != 0
    }

    /// Check if packet has payload.
    pub fn has_payload(&self) -> bool {
        self.adaptation_field_control & 0x01 != 0
    }

    /// Check if packet is scrambled.
    pub fn is_scrambled(&self) -> bool {
        self.scrambling_control != 0
    }

    /// Pack the flag bits kept in the packet index history.
    pub fn flags(&self) -> u8 {
        (self.transport_error as u8) << 7
            | (self.payload_unit_start as u8) << 6
            | (self.transport_priority as u8) << 5
            | self.scrambling_control << 3
            | self.adaptation_field_control << 1
    }
}

/// A 42-bit program clock reference: 33-bit base at 90 kHz and a 9-bit
/// extension at 27 MHz.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
pub struct ClockReference {
    pub base: u64,
    pub extension: u16,
}

impl ClockReference {
    /// Modulus of the 27 MHz value.
    pub const WRAP: u64 = (1u64 << 33) * 300;

    /// Clock rate of the full value.
    pub const HZ: u64 = 27_000_000;

    /// Decode from the 6-byte adaptation field encoding.
    pub fn parse(data: &[u8]) -> Self {
        let base = ((data[0] as u64) << 25)
            | ((data[1] as u64) << 17)
            | ((data[2] as u64) << 9)
            | ((data[3] as u64) << 1)
            | ((data[4] as u64) >> 7);
        let extension = ((data[4] as u16 & 0x01) << 8) | data[5] as u16;
        ClockReference { base, extension }
    }

    /// Value in 27 MHz ticks.
    pub fn ticks(&self) -> u64 {
        self.base * 300 + self.extension as u64
    }
}

/// Adaptation field data.
#[derive(Debug, Clone, Default)]
pub struct AdaptationField {
    /// Adaptation field length.
    pub length: u8,
    /// Discontinuity indicator.
    pub discontinuity: bool,
    /// Random access indicator.
    pub random_access: bool,
    /// Elementary stream priority indicator.
    pub es_priority: bool,
    /// PCR (if present).
    pub pcr: Option<ClockReference>,
    /// OPCR (if present).
    pub opcr: Option<ClockReference>,
    /// Splice countdown (if present).
    pub splice_countdown: Option<i8>,
    /// Length of transport private data (if present).
    pub private_data_length: Option<u8>,
    /// Length of the adaptation field extension (if present).
    pub extension_length: Option<u8>,
}

impl AdaptationField {
    /// Parse from the bytes following the 4-byte header, starting at the
    /// length byte. Fields that would overrun the declared length are left
    /// unset.
    fn parse(data: &[u8]) -> Self {
        let length = data[0];
        let mut af = AdaptationField {
            length,
            ..Default::default()
        };
        let end = (1 + length as usize).min(data.len());
        if length == 0 || end < 2 {
            return af;
        }

        let flags = data[1];
        af.discontinuity = flags & 0x80 != 0;
        af.random_access = flags & 0x40 != 0;
        af.es_priority = flags & 0x20 != 0;

        let mut offset = 2;
        if flags & 0x10 != 0 && offset + 6 <= end {
            af.pcr = Some(ClockReference::parse(&data[offset..offset + 6]));
            offset += 6;
        }
        if flags & 0x08 != 0 && offset + 6 <= end {
            af.opcr = Some(ClockReference::parse(&data[offset..offset + 6]));
            offset += 6;
        }
        if flags & 0x04 != 0 && offset < end {
            af.splice_countdown = Some(data[offset] as i8);
            offset += 1;
        }
        if flags & 0x02 != 0 && offset < end {
            let len = data[offset];
            af.private_data_length = Some(len);
            offset += 1 + len as usize;
        }
        if flags & 0x01 != 0 && offset < end {
            af.extension_length = Some(data[offset]);
        }

        af
    }
}

/// A parsed TS packet.
#[derive(Debug, Clone)]
pub struct TsPacket<'a> {
    /// Packet header.
    pub header: TsHeader,
    /// Adaptation field (if present).
    pub adaptation_field: Option<AdaptationField>,
    /// Payload data.
    pub payload: &'a [u8],
}

impl<'a> TsPacket<'a> {
    /// Parse a TS packet from the start of a frame.
    ///
    /// Only the first 188 bytes are examined.
    pub fn parse(data: &'a [u8]) -> Result<Self, DissectError> {
        if data.len() < TS_PACKET_SIZE {
            return Err(DissectError::Malformed("packet too short"));
        }

        if data[0] != SYNC_BYTE {
            return Err(DissectError::Malformed("invalid sync byte"));
        }

        let header = TsHeader::parse(data);

        let mut offset = 4;
        let adaptation_field = if header.has_adaptation_field() {
            offset = 5 + data[4] as usize;
            Some(AdaptationField::parse(&data[4..TS_PACKET_SIZE]))
        } else {
            None
        };

        let payload = if header.has_payload() && offset < TS_PACKET_SIZE {
            &data[offset..TS_PACKET_SIZE]
        } else {
            &[]
        };

        Ok(TsPacket {
            header,
            adaptation_field,
            payload,
        })
    }

    /// PCR carried by this packet, if any.
    pub fn pcr(&self) -> Option<ClockReference> {
        self.adaptation_field.as_ref().and_then(|af| af.pcr)
    }

    /// Check the discontinuity indicator.
    pub fn is_discontinuity(&self) -> bool {
        self.adaptation_field
            .as_ref()
            .map(|af| af.discontinuity)
            .unwrap_or(false)
    }
}
