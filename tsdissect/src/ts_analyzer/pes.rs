//! PES (Packetized Elementary Stream) packet reassembly.
//!
//! PES packets are split across the payloads of consecutive TS packets on
//! one PID. A declared length of zero means the packet runs until the next
//! payload unit start (or end of source), so its buffer has to grow.

use std::collections::HashMap;

use log::{debug, warn};
use serde::Serialize;

use super::packet::{ClockReference, Pid};

/// Start code prefix, stream_id and packet length.
pub const PES_PREFIX_SIZE: usize = 6;

/// Initial buffer size for packets of unbounded length.
pub const DEFAULT_UNBOUNDED_CAPACITY: usize = 20_000;

/// PES stream IDs with special framing.
pub mod stream_id {
    pub const PROGRAM_STREAM_MAP: u8 = 0xBC;
    pub const PRIVATE_STREAM_1: u8 = 0xBD;
    pub const PADDING_STREAM: u8 = 0xBE;
    pub const PRIVATE_STREAM_2: u8 = 0xBF;
    pub const ECM_STREAM: u8 = 0xF0;
    pub const EMM_STREAM: u8 = 0xF1;
    pub const DSMCC_STREAM: u8 = 0xF2;
    pub const H222_1_TYPE_E: u8 = 0xF8;
    pub const PROGRAM_STREAM_DIRECTORY: u8 = 0xFF;

    /// Stream ids whose payload follows the 6-byte prefix directly.
    pub fn has_optional_header(id: u8) -> bool {
        !matches!(
            id,
            PROGRAM_STREAM_MAP
                | PADDING_STREAM
                | PRIVATE_STREAM_2
                | ECM_STREAM
                | EMM_STREAM
                | PROGRAM_STREAM_DIRECTORY
                | DSMCC_STREAM
                | H222_1_TYPE_E
        )
    }

    /// Human-readable class of a stream id.
    pub fn name(id: u8) -> &'static str {
        match id {
            PROGRAM_STREAM_MAP => "program stream map",
            PRIVATE_STREAM_1 => "private stream 1",
            PADDING_STREAM => "padding",
            PRIVATE_STREAM_2 => "private stream 2",
            0xC0..=0xDF => "audio",
            0xE0..=0xEF => "video",
            ECM_STREAM => "ECM",
            EMM_STREAM => "EMM",
            DSMCC_STREAM => "DSM-CC",
            H222_1_TYPE_E => "H.222.1 type E",
            PROGRAM_STREAM_DIRECTORY => "program stream directory",
            _ => "other",
        }
    }
}

/// Byte buffer that only ever grows.
///
/// Capacity doubles (or jumps straight to the required size) when an
/// append would overflow it; bytes already written are kept.
#[derive(Debug, Clone, Default)]
pub struct GrowableBuffer {
    data: Vec<u8>,
    capacity: usize,
    growth_events: u32,
}

impl GrowableBuffer {
    pub fn with_capacity(capacity: usize) -> Self {
        GrowableBuffer {
            data: Vec::with_capacity(capacity),
            capacity,
            growth_events: 0,
        }
    }

    pub fn append(&mut self, bytes: &[u8]) {
        let required = self.data.len() + bytes.len();
        if required > self.capacity {
            let new_capacity = (self.capacity * 2).max(required);
            self.data.reserve_exact(new_capacity - self.data.len());
            self.capacity = new_capacity;
            self.growth_events += 1;
        }
        self.data.extend_from_slice(bytes);
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn growth_events(&self) -> u32 {
        self.growth_events
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.data
    }

    pub fn into_vec(self) -> Vec<u8> {
        self.data
    }
}

/// A 33-bit PTS or DTS on the 90 kHz clock.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct PesTimestamp(pub u64);

impl PesTimestamp {
    /// Clock rate (90 kHz).
    pub const CLOCK_RATE: u64 = 90_000;

    /// Decode the 5-byte marker-bit encoding.
    pub fn parse(data: &[u8]) -> Self {
        let value = ((data[0] as u64 & 0x0E) << 29)
            | ((data[1] as u64) << 22)
            | ((data[2] as u64 & 0xFE) << 14)
            | ((data[3] as u64) << 7)
            | ((data[4] as u64) >> 1);
        PesTimestamp(value)
    }

    pub fn as_millis(&self) -> u64 {
        self.0 / 90
    }
}

/// Optional PES header of non-reserved stream ids.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PesOptionalHeader {
    pub scrambling_control: u8,
    pub priority: bool,
    pub data_alignment: bool,
    pub copyright: bool,
    pub original: bool,
    /// PTS_DTS_flags (2 bits): 2 = PTS only, 3 = PTS and DTS.
    pub pts_dts_flags: u8,
    pub escr_flag: bool,
    pub es_rate_flag: bool,
    pub dsm_trick_mode_flag: bool,
    pub additional_copy_info_flag: bool,
    pub crc_flag: bool,
    pub extension_flag: bool,
    pub header_data_length: u8,
    pub pts: Option<PesTimestamp>,
    pub dts: Option<PesTimestamp>,
    pub escr: Option<ClockReference>,
    /// Elementary stream rate in units of 50 bytes/s.
    pub es_rate: Option<u32>,
    pub dsm_trick_mode: Option<u8>,
    pub additional_copy_info: Option<u8>,
    pub previous_pes_crc: Option<u16>,
}

impl PesOptionalHeader {
    /// Parse from a packet buffer starting at the start code prefix.
    ///
    /// Fields lying outside the header data length or the available bytes
    /// are left unset.
    pub fn parse(packet: &[u8]) -> Option<Self> {
        if packet.len() < PES_PREFIX_SIZE + 3 {
            return None;
        }
        let flags1 = packet[6];
        let flags2 = packet[7];
        let mut header = PesOptionalHeader {
            scrambling_control: (flags1 >> 4) & 0x03,
            priority: flags1 & 0x08 != 0,
            data_alignment: flags1 & 0x04 != 0,
            copyright: flags1 & 0x02 != 0,
            original: flags1 & 0x01 != 0,
            pts_dts_flags: (flags2 >> 6) & 0x03,
            escr_flag: flags2 & 0x20 != 0,
            es_rate_flag: flags2 & 0x10 != 0,
            dsm_trick_mode_flag: flags2 & 0x08 != 0,
            additional_copy_info_flag: flags2 & 0x04 != 0,
            crc_flag: flags2 & 0x02 != 0,
            extension_flag: flags2 & 0x01 != 0,
            header_data_length: packet[8],
            ..Default::default()
        };

        let end = (PES_PREFIX_SIZE + 3 + header.header_data_length as usize).min(packet.len());
        let mut fields = Fields {
            data: &packet[..end],
            offset: PES_PREFIX_SIZE + 3,
        };

        if header.pts_dts_flags & 0x02 != 0 {
            header.pts = fields.take(5).map(PesTimestamp::parse);
        }
        if header.pts_dts_flags == 0x03 {
            header.dts = fields.take(5).map(PesTimestamp::parse);
        }
        if header.escr_flag {
            header.escr = fields.take(6).map(parse_escr);
        }
        if header.es_rate_flag {
            header.es_rate = fields
                .take(3)
                .map(|b| ((b[0] as u32 & 0x7F) << 15) | ((b[1] as u32) << 7) | (b[2] as u32 >> 1));
        }
        if header.dsm_trick_mode_flag {
            header.dsm_trick_mode = fields.take(1).map(|b| b[0]);
        }
        if header.additional_copy_info_flag {
            header.additional_copy_info = fields.take(1).map(|b| b[0] & 0x7F);
        }
        if header.crc_flag {
            header.previous_pes_crc = fields.take(2).map(|b| u16::from_be_bytes([b[0], b[1]]));
        }

        Some(header)
    }
}

struct Fields<'a> {
    data: &'a [u8],
    offset: usize,
}

impl<'a> Fields<'a> {
    fn take(&mut self, n: usize) -> Option<&'a [u8]> {
        let field = self.data.get(self.offset..self.offset + n)?;
        self.offset += n;
        Some(field)
    }
}

fn parse_escr(b: &[u8]) -> ClockReference {
    let base = (((b[0] as u64 >> 3) & 0x07) << 30)
        | ((b[0] as u64 & 0x03) << 28)
        | ((b[1] as u64) << 20)
        | (((b[2] as u64 >> 3) & 0x1F) << 15)
        | ((b[2] as u64 & 0x03) << 13)
        | ((b[3] as u64) << 5)
        | (b[4] as u64 >> 3);
    let extension = ((b[4] as u16 & 0x03) << 7) | (b[5] as u16 >> 1);
    ClockReference { base, extension }
}

/// A reassembled PES packet.
#[derive(Debug, Clone, Serialize)]
pub struct ElementaryPacket {
    pub pid: Pid,
    pub stream_id: u8,
    /// PES_packet_length; 0 means unbounded.
    pub declared_length: u16,
    pub header: Option<PesOptionalHeader>,
    /// Packet bytes from the start code prefix on.
    #[serde(skip)]
    pub data: Vec<u8>,
    /// False when the packet ended before its declared length.
    pub complete: bool,
    /// Packet index of the TS packet that started this PES packet.
    pub first_packet: u64,
    /// Buffer growth events while reassembling.
    pub growth_events: u32,
}

impl ElementaryPacket {
    fn build(pid: Pid, buf: PesBuffer, complete: bool) -> Self {
        let growth_events = buf.buffer.growth_events();
        let data = buf.buffer.into_vec();
        let header = if stream_id::has_optional_header(buf.stream_id) {
            PesOptionalHeader::parse(&data)
        } else {
            None
        };
        ElementaryPacket {
            pid,
            stream_id: buf.stream_id,
            declared_length: buf.declared_length,
            header,
            data,
            complete,
            first_packet: buf.first_packet,
            growth_events,
        }
    }

    /// Elementary stream bytes after all headers.
    pub fn payload(&self) -> &[u8] {
        let start = match &self.header {
            Some(h) => PES_PREFIX_SIZE + 3 + h.header_data_length as usize,
            None => PES_PREFIX_SIZE,
        };
        self.data.get(start..).unwrap_or(&[])
    }

    pub fn pts(&self) -> Option<PesTimestamp> {
        self.header.as_ref().and_then(|h| h.pts)
    }

    pub fn dts(&self) -> Option<PesTimestamp> {
        self.header.as_ref().and_then(|h| h.dts)
    }

    pub fn is_unbounded(&self) -> bool {
        self.declared_length == 0
    }
}

/// Receiver for completed PES packets.
pub trait PesHandler {
    fn on_packet(&mut self, packet: &ElementaryPacket);
}

impl<F> PesHandler for F
where
    F: FnMut(&ElementaryPacket),
{
    fn on_packet(&mut self, packet: &ElementaryPacket) {
        self(packet)
    }
}

#[derive(Debug)]
struct PesBuffer {
    stream_id: u8,
    declared_length: u16,
    /// declared_length + prefix, or None when unbounded.
    limit: Option<usize>,
    buffer: GrowableBuffer,
    first_packet: u64,
}

impl PesBuffer {
    /// Append without passing the limit. Returns true once full.
    fn append(&mut self, bytes: &[u8]) -> bool {
        match self.limit {
            Some(limit) => {
                let room = limit - self.buffer.len();
                self.buffer.append(&bytes[..bytes.len().min(room)]);
                self.buffer.len() == limit
            }
            None => {
                self.buffer.append(bytes);
                false
            }
        }
    }
}

#[derive(Debug, Default)]
enum PesState {
    /// Waiting for a payload unit start.
    #[default]
    Idle,
    /// Unit started but the 6-byte prefix is not complete yet.
    Pending { bytes: Vec<u8>, first_packet: u64 },
    Started(PesBuffer),
}

/// Size and growth of an in-progress packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BufferState {
    pub len: usize,
    pub capacity: usize,
    pub growth_events: u32,
}

/// Counters kept by the packet assembler.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PesStats {
    pub completed: u64,
    pub incomplete: u64,
    /// Units that did not begin with 0x000001.
    pub invalid_start: u64,
    /// Payload bytes outside any packet.
    pub stray_bytes: u64,
}

/// Reassembles PES packets from TS payloads.
#[derive(Debug)]
pub struct PacketAssembler {
    states: HashMap<Pid, PesState>,
    unbounded_capacity: usize,
    stats: PesStats,
}

impl Default for PacketAssembler {
    fn default() -> Self {
        Self::new(DEFAULT_UNBOUNDED_CAPACITY)
    }
}

impl PacketAssembler {
    /// Create an assembler whose unbounded buffers start at `unbounded_capacity`.
    pub fn new(unbounded_capacity: usize) -> Self {
        PacketAssembler {
            states: HashMap::new(),
            unbounded_capacity: unbounded_capacity.max(PES_PREFIX_SIZE),
            stats: PesStats::default(),
        }
    }

    /// Feed one TS payload; returns packets completed by it.
    pub fn feed(
        &mut self,
        pid: Pid,
        payload: &[u8],
        unit_start: bool,
        packet_index: u64,
    ) -> Vec<ElementaryPacket> {
        let mut out = Vec::new();
        let state = self.states.entry(pid).or_default();

        if unit_start {
            if let Some(packet) = Self::finalize(pid, std::mem::take(state), &mut self.stats) {
                out.push(packet);
            }
            *state = PesState::Pending {
                bytes: Vec::with_capacity(PES_PREFIX_SIZE),
                first_packet: packet_index,
            };
        }

        match state {
            PesState::Idle => {
                self.stats.stray_bytes += payload.len() as u64;
            }
            PesState::Pending {
                bytes,
                first_packet,
            } => {
                bytes.extend_from_slice(payload);
                if bytes.len() < PES_PREFIX_SIZE {
                    return out;
                }
                if bytes[..3] != [0x00, 0x00, 0x01] {
                    debug!("PID {}: payload unit does not start with a PES start code", pid);
                    self.stats.invalid_start += 1;
                    *state = PesState::Idle;
                    return out;
                }
                let stream_id = bytes[3];
                let declared_length = u16::from_be_bytes([bytes[4], bytes[5]]);
                let limit = (declared_length != 0)
                    .then_some(declared_length as usize + PES_PREFIX_SIZE);
                let mut buf = PesBuffer {
                    stream_id,
                    declared_length,
                    limit,
                    buffer: GrowableBuffer::with_capacity(limit.unwrap_or(self.unbounded_capacity)),
                    first_packet: *first_packet,
                };
                let full = buf.append(&bytes[..]);
                if full {
                    self.stats.completed += 1;
                    out.push(ElementaryPacket::build(pid, buf, true));
                    *state = PesState::Idle;
                } else {
                    *state = PesState::Started(buf);
                }
            }
            PesState::Started(buf) => {
                if buf.append(payload) {
                    if let PesState::Started(buf) = std::mem::take(state) {
                        self.stats.completed += 1;
                        out.push(ElementaryPacket::build(pid, buf, true));
                    }
                }
            }
        }
        out
    }

    fn finalize(pid: Pid, state: PesState, stats: &mut PesStats) -> Option<ElementaryPacket> {
        match state {
            PesState::Idle => None,
            PesState::Pending { bytes, .. } => {
                if !bytes.is_empty() {
                    stats.invalid_start += 1;
                }
                None
            }
            PesState::Started(buf) => {
                let complete = buf.limit.is_none();
                if complete {
                    stats.completed += 1;
                } else {
                    stats.incomplete += 1;
                    warn!(
                        "PID {}: PES packet ended after {} of {} bytes",
                        pid,
                        buf.buffer.len(),
                        buf.limit.unwrap_or_default()
                    );
                }
                Some(ElementaryPacket::build(pid, buf, complete))
            }
        }
    }

    /// Finish every in-progress packet at end of source.
    pub fn flush(&mut self) -> Vec<ElementaryPacket> {
        let mut pids: Vec<Pid> = self.states.keys().copied().collect();
        pids.sort();
        pids.into_iter()
            .filter_map(|pid| {
                let state = self.states.remove(&pid)?;
                Self::finalize(pid, state, &mut self.stats)
            })
            .collect()
    }

    /// Drop the packet in progress on `pid` without emitting it.
    pub fn reset(&mut self, pid: Pid) {
        if let Some(PesState::Started(_)) = self.states.insert(pid, PesState::Idle) {
            self.stats.incomplete += 1;
        }
    }

    /// Size of the packet being assembled on `pid`.
    pub fn buffer_state(&self, pid: Pid) -> Option<BufferState> {
        match self.states.get(&pid)? {
            PesState::Started(buf) => Some(BufferState {
                len: buf.buffer.len(),
                capacity: buf.buffer.capacity(),
                growth_events: buf.buffer.growth_events(),
            }),
            _ => None,
        }
    }

    pub fn stats(&self) -> PesStats {
        self.stats
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pid() -> Pid {
        Pid::new(0x100).unwrap()
    }

    fn encode_timestamp(prefix: u8, ts: u64) -> [u8; 5] {
        [
            (prefix << 4) | (((ts >> 30) as u8 & 0x07) << 1) | 1,
            (ts >> 22) as u8,
            (((ts >> 15) as u8) << 1) | 1,
            (ts >> 7) as u8,
            ((ts as u8) << 1) | 1,
        ]
    }

    fn video_packet(declared: u16, pts: u64, dts: u64, body: &[u8]) -> Vec<u8> {
        let mut data = vec![0x00, 0x00, 0x01, 0xE0];
        data.extend_from_slice(&declared.to_be_bytes());
        data.extend_from_slice(&[0x84, 0xC0, 10]);
        data.extend_from_slice(&encode_timestamp(0x3, pts));
        data.extend_from_slice(&encode_timestamp(0x1, dts));
        data.extend_from_slice(body);
        data
    }

    #[test]
    fn test_timestamp_decoding() {
        let ts = 0x1_2345_6789u64;
        assert_eq!(PesTimestamp::parse(&encode_timestamp(0x2, ts)), PesTimestamp(ts));
    }

    #[test]
    fn test_bounded_packet_across_payloads() {
        let body: Vec<u8> = (0..300u32).map(|i| i as u8).collect();
        let declared = (3 + 10 + body.len()) as u16;
        let data = video_packet(declared, 900_000, 896_400, &body);

        let mut asm = PacketAssembler::default();
        assert!(asm.feed(pid(), &data[..184], true, 0).is_empty());
        // Trailing bytes past the declared length are clipped.
        let mut rest = data[184..].to_vec();
        rest.extend_from_slice(&[0xFF; 40]);
        let packets = asm.feed(pid(), &rest, false, 1);

        assert_eq!(packets.len(), 1);
        let packet = &packets[0];
        assert!(packet.complete);
        assert_eq!(packet.data, data);
        assert_eq!(packet.payload(), &body[..]);
        assert_eq!(packet.pts(), Some(PesTimestamp(900_000)));
        assert_eq!(packet.dts(), Some(PesTimestamp(896_400)));
        let header = packet.header.as_ref().unwrap();
        assert!(header.data_alignment);
        assert_eq!(header.pts_dts_flags, 3);
        assert_eq!(asm.stats().completed, 1);
    }

    #[test]
    fn test_unbounded_packet_ends_at_next_start() {
        let first = video_packet(0, 0, 0, &[0xAA; 100]);
        let second = video_packet(0, 3600, 3600, &[0xBB; 10]);

        let mut asm = PacketAssembler::default();
        assert!(asm.feed(pid(), &first[..60], true, 0).is_empty());
        assert!(asm.feed(pid(), &first[60..], false, 1).is_empty());
        let packets = asm.feed(pid(), &second, true, 2);
        assert_eq!(packets.len(), 1);
        assert!(packets[0].complete);
        assert!(packets[0].is_unbounded());
        assert_eq!(packets[0].data, first);

        let flushed = asm.flush();
        assert_eq!(flushed.len(), 1);
        assert_eq!(flushed[0].data, second);
        assert_eq!(flushed[0].first_packet, 2);
    }

    #[test]
    fn test_short_bounded_packet_is_incomplete() {
        let data = video_packet(500, 0, 0, &[0x11; 50]);
        let mut asm = PacketAssembler::default();
        asm.feed(pid(), &data, true, 0);
        let packets = asm.feed(pid(), &video_packet(0, 0, 0, &[]), true, 1);
        assert_eq!(packets.len(), 1);
        assert!(!packets[0].complete);
        assert_eq!(asm.stats().incomplete, 1);
    }

    #[test]
    fn test_reserved_stream_has_no_optional_header() {
        let mut data = vec![0x00, 0x00, 0x01, stream_id::PADDING_STREAM, 0x00, 0x04];
        data.extend_from_slice(&[0xFF; 4]);
        let mut asm = PacketAssembler::default();
        let packets = asm.feed(pid(), &data, true, 0);
        assert_eq!(packets.len(), 1);
        assert!(packets[0].header.is_none());
        assert_eq!(packets[0].payload(), &[0xFF; 4]);
    }

    #[test]
    fn test_invalid_start_code() {
        let mut asm = PacketAssembler::default();
        assert!(asm.feed(pid(), &[0x00, 0x00, 0x02, 0xE0, 0, 0], true, 0).is_empty());
        assert!(asm.feed(pid(), &[1, 2, 3], false, 1).is_empty());
        assert_eq!(asm.stats().invalid_start, 1);
        assert_eq!(asm.stats().stray_bytes, 3);
    }

    #[test]
    fn test_prefix_split_across_payloads() {
        let data = video_packet(0, 90_000, 90_000, &[0x42; 8]);
        let mut asm = PacketAssembler::default();
        asm.feed(pid(), &data[..4], true, 0);
        asm.feed(pid(), &data[4..], false, 1);
        let flushed = asm.flush();
        assert_eq!(flushed.len(), 1);
        assert_eq!(flushed[0].data, data);
    }

    #[test]
    fn test_escr_and_es_rate() {
        let mut data = vec![0x00, 0x00, 0x01, 0xC0, 0x00, 0x00, 0x80, 0x30, 9];
        // ESCR base = 1, extension = 3
        data.extend_from_slice(&[0x04, 0x00, 0x04, 0x00, 0x0C, 0x07]);
        // ES rate = 1000
        data.extend_from_slice(&[0x80, 0x07, 0xD1]);
        let header = PesOptionalHeader::parse(&data).unwrap();
        assert_eq!(header.escr, Some(ClockReference { base: 1, extension: 3 }));
        assert_eq!(header.es_rate, Some(1000));
    }

    #[test]
    fn test_growable_buffer_keeps_bytes() {
        let mut buf = GrowableBuffer::with_capacity(4);
        buf.append(&[1, 2, 3]);
        buf.append(&[4, 5]);
        assert_eq!(buf.capacity(), 8);
        buf.append(&[0; 20]);
        assert_eq!(buf.capacity(), 25);
        assert_eq!(buf.growth_events(), 2);
        assert_eq!(&buf.as_slice()[..5], &[1, 2, 3, 4, 5]);
    }
}
