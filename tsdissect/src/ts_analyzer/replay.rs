//! Targeted second pass over selected PIDs.
//!
//! After a full pass the [`PacketIndex`] knows where every frame of a PID
//! lives. A replay seeks straight to those frames and reassembles their PES
//! packets again with a fresh assembler, handing each one to the handler
//! registered for its PID.

use std::collections::HashMap;
use std::io::{BufReader, Read, Seek, SeekFrom};

use log::debug;
use serde::Serialize;

use super::demux::{CancelToken, PacketIndex};
use super::packet::{Pid, TsPacket, SYNC_BYTE, TS_PACKET_SIZE};
use super::pes::{ElementaryPacket, PacketAssembler, PesHandler, DEFAULT_UNBOUNDED_CAPACITY};
use crate::error::{DissectError, Result};

/// Counters of one replay.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ReplayStats {
    pub frames_read: u64,
    pub seeks: u64,
    pub duplicates: u64,
    pub packets_delivered: u64,
}

/// Re-reads the frames of selected PIDs.
pub struct Replay<'a> {
    index: &'a PacketIndex,
    handlers: HashMap<Pid, Box<dyn PesHandler + 'a>>,
    unbounded_capacity: usize,
    limit: Option<u64>,
    cancel: Option<CancelToken>,
}

impl<'a> Replay<'a> {
    pub fn new(index: &'a PacketIndex) -> Self {
        Replay {
            index,
            handlers: HashMap::new(),
            unbounded_capacity: DEFAULT_UNBOUNDED_CAPACITY,
            limit: None,
            cancel: None,
        }
    }

    /// Replay `pid` and deliver its packets to `handler`.
    pub fn handler<H: PesHandler + 'a>(mut self, pid: Pid, handler: H) -> Self {
        self.handlers.insert(pid, Box::new(handler));
        self
    }

    pub fn unbounded_capacity(mut self, capacity: usize) -> Self {
        self.unbounded_capacity = capacity;
        self
    }

    /// Stop after this many packets have been delivered.
    pub fn limit(mut self, packets: u64) -> Self {
        self.limit = Some(packets);
        self
    }

    pub fn cancel_token(mut self, token: CancelToken) -> Self {
        self.cancel = Some(token);
        self
    }

    /// Run the replay over the source the index was built from.
    pub fn run<R: Read + Seek>(mut self, source: R) -> Result<ReplayStats> {
        let mut reader = BufReader::new(source);
        let mut assembler = PacketAssembler::new(self.unbounded_capacity);
        let mut last_cc: HashMap<Pid, u8> = HashMap::new();
        let mut stats = ReplayStats::default();
        let mut frame = [0u8; TS_PACKET_SIZE];
        let mut position: Option<u64> = None;
        let index = self.index;

        for (packet_index, entry) in index.iter() {
            if !self.handlers.contains_key(&entry.pid) {
                continue;
            }
            if let Some(token) = &self.cancel {
                if token.is_cancelled() {
                    return Err(DissectError::Cancelled {
                        packets: stats.frames_read,
                    });
                }
            }
            if self.limit.is_some_and(|limit| stats.packets_delivered >= limit) {
                break;
            }

            if position != Some(entry.offset) {
                reader.seek(SeekFrom::Start(entry.offset))?;
                stats.seeks += 1;
            }
            reader.read_exact(&mut frame)?;
            position = Some(entry.offset + TS_PACKET_SIZE as u64);
            stats.frames_read += 1;

            if frame[0] != SYNC_BYTE {
                return Err(DissectError::Malformed("source changed since it was indexed"));
            }
            let packet = TsPacket::parse(&frame)?;
            if !packet.header.has_payload() || packet.payload.is_empty() {
                continue;
            }
            let cc = packet.header.continuity_counter;
            if last_cc.insert(entry.pid, cc) == Some(cc) && !packet.is_discontinuity() {
                stats.duplicates += 1;
                continue;
            }

            let completed = assembler.feed(
                entry.pid,
                packet.payload,
                packet.header.payload_unit_start,
                packet_index,
            );
            self.deliver(completed, &mut stats);
        }

        let pending = assembler.flush();
        self.deliver(pending, &mut stats);
        debug!(
            "Replayed {} frames with {} seeks, {} packets delivered",
            stats.frames_read, stats.seeks, stats.packets_delivered
        );
        Ok(stats)
    }

    fn deliver(&mut self, packets: Vec<ElementaryPacket>, stats: &mut ReplayStats) {
        for packet in packets {
            if self.limit.is_some_and(|limit| stats.packets_delivered >= limit) {
                return;
            }
            if let Some(handler) = self.handlers.get_mut(&packet.pid) {
                handler.on_packet(&packet);
                stats.packets_delivered += 1;
            }
        }
    }
}
