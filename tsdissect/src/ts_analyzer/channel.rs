//! Per-PID state of the demultiplexer.

use serde::Serialize;

use super::packet::{ClockReference, Pid, TsPacket, PID_COUNT};
use super::pes::{ElementaryPacket, PesTimestamp};

/// How a PID's payload is reassembled.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ContentKind {
    /// Not bound yet; payload is dropped.
    #[default]
    Unclassified,
    /// PSI/SI sections.
    Sections,
    /// PES packets.
    Packets,
    /// Counted but never reassembled (e.g. null packets).
    Ignored,
}

/// A PCR observation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ClockSample {
    pub packet_index: u64,
    pub pcr: ClockReference,
}

/// Continuity classification of one packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Continuity {
    /// First packet with payload on this PID.
    First,
    /// Counter advanced by one, or discontinuity was signalled.
    InOrder,
    /// Same counter as the previous packet with payload.
    Duplicate,
    /// Counter jumped; packets were lost.
    Gap { expected: u8, found: u8 },
    /// No payload, counter not checked.
    NoPayload,
}

/// Counters and bindings of one PID.
#[derive(Debug, Clone, Serialize)]
pub struct ChannelState {
    pub pid: Pid,
    pub kind: ContentKind,
    pub packets: u64,
    pub duplicates: u64,
    pub continuity_errors: u64,
    pub transport_errors: u64,
    pub scrambled: u64,
    pub unit_starts: u64,
    pub first_packet: u64,
    pub last_packet: u64,
    pub pcr_count: u64,
    pub first_pcr: Option<ClockSample>,
    pub last_pcr: Option<ClockSample>,
    pub pes_packets: u64,
    pub incomplete_pes: u64,
    pub first_pts: Option<PesTimestamp>,
    pub last_pts: Option<PesTimestamp>,
    #[serde(skip)]
    last_cc: Option<u8>,
}

impl ChannelState {
    pub fn new(pid: Pid, kind: ContentKind, packet_index: u64) -> Self {
        ChannelState {
            pid,
            kind,
            packets: 0,
            duplicates: 0,
            continuity_errors: 0,
            transport_errors: 0,
            scrambled: 0,
            unit_starts: 0,
            first_packet: packet_index,
            last_packet: packet_index,
            pcr_count: 0,
            first_pcr: None,
            last_pcr: None,
            pes_packets: 0,
            incomplete_pes: 0,
            first_pts: None,
            last_pts: None,
            last_cc: None,
        }
    }

    /// Update counters for one packet of this PID.
    pub fn observe(&mut self, packet: &TsPacket, packet_index: u64) -> Continuity {
        let header = &packet.header;
        self.packets += 1;
        self.last_packet = packet_index;
        if header.transport_error {
            self.transport_errors += 1;
        }
        if header.is_scrambled() {
            self.scrambled += 1;
        }
        if header.payload_unit_start {
            self.unit_starts += 1;
        }
        if let Some(pcr) = packet.pcr() {
            let sample = ClockSample { packet_index, pcr };
            self.pcr_count += 1;
            self.first_pcr.get_or_insert(sample);
            self.last_pcr = Some(sample);
        }

        if !header.has_payload() || self.pid == Pid::NULL {
            return Continuity::NoPayload;
        }

        let cc = header.continuity_counter;
        let previous = self.last_cc.replace(cc);
        match previous {
            None => Continuity::First,
            Some(_) if packet.is_discontinuity() => Continuity::InOrder,
            Some(last) if last == cc => {
                self.duplicates += 1;
                Continuity::Duplicate
            }
            Some(last) => {
                let expected = (last + 1) & 0x0F;
                if cc == expected {
                    Continuity::InOrder
                } else {
                    self.continuity_errors += 1;
                    Continuity::Gap { expected, found: cc }
                }
            }
        }
    }

    /// Update PES counters for a packet reassembled on this PID.
    pub fn record_pes(&mut self, packet: &ElementaryPacket) {
        self.pes_packets += 1;
        if !packet.complete {
            self.incomplete_pes += 1;
        }
        if let Some(pts) = packet.pts() {
            self.first_pts.get_or_insert(pts);
            self.last_pts = Some(pts);
        }
    }

    /// Transport bitrate in bits/s derived from the first and last PCR.
    pub fn bitrate(&self, frame_size: usize) -> Option<u64> {
        let (first, last) = (self.first_pcr?, self.last_pcr?);
        let packets = last.packet_index.checked_sub(first.packet_index)?;
        let ticks = (last.pcr.ticks() + ClockReference::WRAP - first.pcr.ticks()) % ClockReference::WRAP;
        if packets == 0 || ticks == 0 {
            return None;
        }
        let bits = packets as u128 * frame_size as u128 * 8;
        Some((bits * ClockReference::HZ as u128 / ticks as u128) as u64)
    }
}

/// Fixed table of channel states indexed by PID.
#[derive(Debug)]
pub struct ChannelTable {
    slots: Box<[Option<ChannelState>]>,
}

impl Default for ChannelTable {
    fn default() -> Self {
        ChannelTable {
            slots: (0..PID_COUNT).map(|_| None).collect(),
        }
    }
}

impl ChannelTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, pid: Pid) -> Option<&ChannelState> {
        self.slots[pid.index()].as_ref()
    }

    pub fn get_mut(&mut self, pid: Pid) -> Option<&mut ChannelState> {
        self.slots[pid.index()].as_mut()
    }

    /// State of `pid`, created with `kind` on first sight.
    pub fn get_or_create(&mut self, pid: Pid, kind: ContentKind, packet_index: u64) -> &mut ChannelState {
        self.slots[pid.index()].get_or_insert_with(|| ChannelState::new(pid, kind, packet_index))
    }

    /// Channels seen so far, in PID order.
    pub fn iter(&self) -> impl Iterator<Item = &ChannelState> {
        self.slots.iter().flatten()
    }

    pub fn len(&self) -> usize {
        self.iter().count()
    }

    pub fn is_empty(&self) -> bool {
        self.iter().next().is_none()
    }
}
