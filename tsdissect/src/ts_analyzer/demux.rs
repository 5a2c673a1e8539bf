//! Sequential demultiplexing pass over a capture.
//!
//! The demultiplexer walks fixed-length frames in order, keeps one
//! [`ChannelState`] per PID and routes payload to the section or PES
//! assembler the PID is bound to. Every frame is recorded in a
//! [`PacketIndex`] so later passes can seek straight to a PID's frames.

use std::collections::HashMap;
use std::fmt;
use std::io::{self, BufReader, ErrorKind, Read, Seek, SeekFrom};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use log::{debug, info, warn};
use serde::Serialize;

use super::channel::{ChannelState, ChannelTable, ContentKind, Continuity};
use super::packet::{Pid, TsPacket, SYNC_BYTE, TS_PACKET_SIZE};
use super::pes::{ElementaryPacket, PacketAssembler, PesHandler, PesStats, DEFAULT_UNBOUNDED_CAPACITY};
use super::psi::{SectionAssembler, SectionStats};
use super::registry::{Insertion, SectionOutcome, TableRegistry};
use super::sync::{detect_frame_size, SyncInfo, DEFAULT_SYNC_WINDOW};
use super::tables::{DecoderRegistry, TableBody};
use super::timing::{TimeRecord, Timeline, TimingModel};
use super::{pid, table_id};
use crate::error::{DissectError, Result};

const READ_BUFFER_SIZE: usize = 1 << 20;

/// Configuration for a demultiplexing pass.
#[derive(Debug, Clone)]
pub struct DemuxConfig {
    /// Bytes searched for the first sync byte.
    pub sync_window: usize,
    /// Bind unclassified PIDs by sniffing their first unit start.
    pub auto_classify: bool,
    /// Initial buffer size of unbounded PES packets.
    pub unbounded_capacity: usize,
    /// Sync losses and record errors logged in detail before only counting.
    pub report_limit: u64,
    /// Packets between progress callbacks (0 = never).
    pub progress_interval: u64,
}

impl Default for DemuxConfig {
    fn default() -> Self {
        Self {
            sync_window: DEFAULT_SYNC_WINDOW,
            auto_classify: true,
            unbounded_capacity: DEFAULT_UNBOUNDED_CAPACITY,
            report_limit: 100,
            progress_interval: 10_000,
        }
    }
}

/// Shared flag used to stop a pass between frames.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Relaxed)
    }
}

/// One frame in the packet index.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct IndexEntry {
    pub pid: Pid,
    /// Header flags, see [`super::packet::TsHeader::flags`].
    pub flags: u8,
    /// Byte offset of the frame in the source.
    pub offset: u64,
}

/// Every frame of a pass, in order; the position is the packet index.
#[derive(Debug, Clone, Default)]
pub struct PacketIndex {
    frame_size: usize,
    entries: Vec<IndexEntry>,
}

impl PacketIndex {
    pub fn new(frame_size: usize) -> Self {
        PacketIndex {
            frame_size,
            entries: Vec::new(),
        }
    }

    pub fn frame_size(&self) -> usize {
        self.frame_size
    }

    pub fn push(&mut self, entry: IndexEntry) {
        self.entries.push(entry);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn get(&self, index: u64) -> Option<&IndexEntry> {
        self.entries.get(usize::try_from(index).ok()?)
    }

    /// Entries with their packet index.
    pub fn iter(&self) -> impl Iterator<Item = (u64, &IndexEntry)> {
        self.entries.iter().enumerate().map(|(i, e)| (i as u64, e))
    }

    /// Packet indices and byte offsets of one PID.
    pub fn frames_of(&self, pid: Pid) -> impl Iterator<Item = (u64, u64)> + '_ {
        self.iter()
            .filter(move |(_, e)| e.pid == pid)
            .map(|(i, e)| (i, e.offset))
    }
}

/// A per-record problem seen during a pass.
#[derive(Debug, Clone, Serialize)]
pub struct Diagnostic {
    pub packet_index: u64,
    pub message: String,
}

/// Summary of a pass.
#[derive(Debug, Clone, Default, Serialize)]
pub struct DemuxReport {
    pub frame_size: usize,
    pub packets: u64,
    pub pids: usize,
    /// Loss-of-sync events, one per run of unaligned bytes.
    pub sync_errors: u64,
    pub bytes_skipped: u64,
    /// Bytes of an incomplete final frame.
    pub trailing_bytes: u64,
    pub duplicates: u64,
    pub continuity_errors: u64,
    pub transport_errors: u64,
    /// Sections that were stored but whose body did not decode.
    pub decode_errors: u64,
    pub sections: SectionStats,
    pub pes: PesStats,
    /// First problems, up to the report limit.
    pub diagnostics: Vec<Diagnostic>,
    /// Problems beyond the report limit.
    pub diagnostics_dropped: u64,
}

impl DemuxReport {
    /// Returns true if anything was lost or rejected.
    pub fn has_errors(&self) -> bool {
        self.sync_errors > 0
            || self.continuity_errors > 0
            || self.transport_errors > 0
            || self.decode_errors > 0
            || self.sections.integrity_errors > 0
            || self.sections.truncated > 0
            || self.sections.malformed > 0
            || self.pes.incomplete > 0
    }
}

/// Demultiplexer for one capture.
pub struct Demultiplexer {
    config: DemuxConfig,
    frame_size: usize,
    channels: ChannelTable,
    bindings: HashMap<Pid, ContentKind>,
    sections: SectionAssembler,
    packets: PacketAssembler,
    decoders: DecoderRegistry,
    subscribers: HashMap<Pid, Vec<Box<dyn PesHandler>>>,
    index: PacketIndex,
    time_records: Vec<TimeRecord>,
    report: DemuxReport,
    cancel: Option<CancelToken>,
    progress: Option<Box<dyn FnMut(u64)>>,
    finished: bool,
}

impl fmt::Debug for Demultiplexer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Demultiplexer")
            .field("frame_size", &self.frame_size)
            .field("packets", &self.report.packets)
            .field("channels", &self.channels.len())
            .field("tables", &self.sections.registry().len())
            .finish_non_exhaustive()
    }
}

impl Demultiplexer {
    /// Create a demultiplexer for a known frame length.
    ///
    /// The PSI/SI PIDs are bound to sections and the null PID is ignored;
    /// [`Demultiplexer::bind`] overrides either.
    pub fn new(frame_size: usize, config: DemuxConfig) -> Self {
        let mut bindings = HashMap::new();
        for value in pid::SECTION_PIDS {
            bindings.insert(Pid::from_masked(value), ContentKind::Sections);
        }
        bindings.insert(Pid::NULL, ContentKind::Ignored);

        let packets = PacketAssembler::new(config.unbounded_capacity);
        Demultiplexer {
            frame_size,
            channels: ChannelTable::new(),
            bindings,
            sections: SectionAssembler::new(),
            packets,
            decoders: DecoderRegistry::default(),
            subscribers: HashMap::new(),
            index: PacketIndex::new(frame_size),
            time_records: Vec::new(),
            report: DemuxReport {
                frame_size,
                ..Default::default()
            },
            cancel: None,
            progress: None,
            finished: false,
            config,
        }
    }

    /// Detect the frame length of `source` and create a demultiplexer for it.
    pub fn open<R: Read + Seek>(source: &mut R, config: DemuxConfig) -> Result<(Self, SyncInfo)> {
        let sync = detect_frame_size(source, config.sync_window)?;
        info!(
            "Detected {}-byte frames, first sync at offset {}",
            sync.frame_size, sync.first_sync
        );
        Ok((Self::new(sync.frame_size, config), sync))
    }

    /// Bind `pid` to a content kind, replacing any earlier binding.
    pub fn bind(&mut self, pid: Pid, kind: ContentKind) {
        self.bindings.insert(pid, kind);
        if let Some(channel) = self.channels.get_mut(pid) {
            channel.kind = kind;
        }
    }

    /// Deliver every completed PES packet on `pid` to `handler`.
    ///
    /// Binds the PID to PES reassembly if it has no binding yet.
    pub fn subscribe<H: PesHandler + 'static>(&mut self, pid: Pid, handler: H) {
        if !self.bindings.contains_key(&pid) {
            self.bind(pid, ContentKind::Packets);
        }
        self.subscribers.entry(pid).or_default().push(Box::new(handler));
    }

    /// Replace the table body decoders.
    pub fn set_decoders(&mut self, decoders: DecoderRegistry) {
        self.decoders = decoders;
    }

    pub fn set_cancel_token(&mut self, token: CancelToken) {
        self.cancel = Some(token);
    }

    /// Called with the current byte offset every `progress_interval` packets.
    pub fn set_progress<F: FnMut(u64) + 'static>(&mut self, callback: F) {
        self.progress = Some(Box::new(callback));
    }

    /// Run the pass from `start_offset` to the end of `source`.
    ///
    /// Sync loss, continuity and record errors are counted in the report.
    /// Only I/O failure and cancellation end the pass early; a cancelled
    /// pass leaves in-progress records unflushed.
    pub fn run<R: Read + Seek>(&mut self, mut source: R, start_offset: u64) -> Result<()> {
        source.seek(SeekFrom::Start(start_offset))?;
        let mut reader = BufReader::with_capacity(READ_BUFFER_SIZE, source);
        let frame_size = self.frame_size;
        let mut frame = vec![0u8; frame_size];
        let mut filled = 0;
        let mut offset = start_offset;
        let mut in_sync = true;

        loop {
            self.check_cancelled()?;
            filled += read_full(&mut reader, &mut frame[filled..])?;
            if filled < frame_size {
                // The last packet of a timestamped capture has no trailer
                // after it.
                if filled >= TS_PACKET_SIZE && frame[0] == SYNC_BYTE {
                    self.process_frame(&frame[..TS_PACKET_SIZE], offset);
                    offset += TS_PACKET_SIZE as u64;
                    filled -= TS_PACKET_SIZE;
                }
                if filled > 0 {
                    self.report.trailing_bytes = filled as u64;
                    warn!(
                        "Ignoring {} trailing bytes at offset {} (incomplete frame)",
                        filled, offset
                    );
                }
                break;
            }

            if frame[0] == SYNC_BYTE {
                in_sync = true;
                self.process_frame(&frame, offset);
                offset += frame_size as u64;
                filled = 0;
                self.report_progress(offset);
            } else {
                if in_sync {
                    in_sync = false;
                    self.record_sync_loss(offset);
                }
                let skip = frame[1..]
                    .iter()
                    .position(|&b| b == SYNC_BYTE)
                    .map_or(frame_size, |p| p + 1);
                frame.copy_within(skip.., 0);
                filled = frame_size - skip;
                offset += skip as u64;
                self.report.bytes_skipped += skip as u64;
            }
        }

        self.finish();
        Ok(())
    }

    /// Flush every in-progress section and PES packet.
    ///
    /// Called by [`Demultiplexer::run`]; further calls do nothing.
    pub fn finish(&mut self) {
        if self.finished {
            return;
        }
        self.finished = true;

        let index = self.report.packets;
        for err in self.sections.flush() {
            self.note(index, &err);
        }
        let pending = self.packets.flush();
        self.deliver(pending);

        let report = self.report();
        info!(
            "Demultiplexed {} packets on {} PIDs: {} sections stored, {} PES packets, {} sync errors",
            report.packets,
            report.pids,
            report.sections.accepted,
            report.pes.completed + report.pes.incomplete,
            report.sync_errors
        );
    }

    fn check_cancelled(&self) -> Result<()> {
        match &self.cancel {
            Some(token) if token.is_cancelled() => Err(DissectError::Cancelled {
                packets: self.report.packets,
            }),
            _ => Ok(()),
        }
    }

    fn report_progress(&mut self, offset: u64) {
        let interval = self.config.progress_interval;
        if interval == 0 || self.report.packets % interval != 0 {
            return;
        }
        if let Some(callback) = self.progress.as_mut() {
            callback(offset);
        }
    }

    fn record_sync_loss(&mut self, offset: u64) {
        self.report.sync_errors += 1;
        let limit = self.config.report_limit;
        if self.report.sync_errors <= limit {
            warn!(
                "Sync lost at offset {} after packet {}",
                offset, self.report.packets
            );
        } else if self.report.sync_errors == limit + 1 {
            warn!("More than {} sync errors; further losses are only counted", limit);
        }
    }

    /// Keep a per-record error for the report.
    fn note(&mut self, packet_index: u64, err: &DissectError) {
        if (self.report.diagnostics.len() as u64) < self.config.report_limit {
            self.report.diagnostics.push(Diagnostic {
                packet_index,
                message: err.to_string(),
            });
        } else {
            self.report.diagnostics_dropped += 1;
        }
    }

    fn process_frame(&mut self, frame: &[u8], offset: u64) {
        let index = self.report.packets;
        let packet = match TsPacket::parse(frame) {
            Ok(packet) => packet,
            Err(err) => {
                self.note(index, &err);
                return;
            }
        };
        self.report.packets += 1;

        let header = packet.header;
        self.index.push(IndexEntry {
            pid: header.pid,
            flags: header.flags(),
            offset,
        });

        let default_kind = self.bindings.get(&header.pid).copied().unwrap_or_default();
        let channel = self.channels.get_or_create(header.pid, default_kind, index);
        match channel.observe(&packet, index) {
            Continuity::NoPayload => return,
            Continuity::Duplicate => {
                self.report.duplicates += 1;
                debug!("PID {}: duplicate packet {} dropped", header.pid, index);
                return;
            }
            Continuity::Gap { expected, found } => {
                self.report.continuity_errors += 1;
                debug!(
                    "PID {}: continuity counter {} where {} was expected (packet {})",
                    header.pid, found, expected, index
                );
            }
            Continuity::First | Continuity::InOrder => {}
        }
        if packet.payload.is_empty() {
            return;
        }

        let unit_start = header.payload_unit_start;
        if channel.kind == ContentKind::Unclassified && unit_start && self.config.auto_classify {
            channel.kind = if packet.payload.starts_with(&[0x00, 0x00, 0x01]) {
                ContentKind::Packets
            } else {
                ContentKind::Sections
            };
            debug!("PID {}: classified as {:?}", header.pid, channel.kind);
        }

        let kind = channel.kind;
        match kind {
            ContentKind::Sections => {
                let results = self.sections.feed(header.pid, packet.payload, unit_start, index);
                for result in results {
                    match result {
                        Ok(outcome) => self.on_section(outcome),
                        Err(err) => self.note(index, &err),
                    }
                }
            }
            ContentKind::Packets => {
                let completed = self.packets.feed(header.pid, packet.payload, unit_start, index);
                self.deliver(completed);
            }
            ContentKind::Unclassified | ContentKind::Ignored => {}
        }
    }

    /// Decode new table versions for PID binding and time records.
    fn on_section(&mut self, outcome: SectionOutcome) {
        let id = outcome.key.table_id;
        let is_time = id == table_id::TDT || id == table_id::TOT;
        if matches!(outcome.insertion, Insertion::Repeat { .. }) && !is_time {
            return;
        }
        let Some(entry) = self.sections.registry().entry(&outcome) else {
            return;
        };

        match self.decoders.decode(&entry.record) {
            Ok(TableBody::Pat(pat)) => {
                for pmt_pid in pat.pmt_pids() {
                    self.bind_discovered(pmt_pid, ContentKind::Sections);
                }
                if let Some(nit) = pat.nit_pid {
                    self.bind_discovered(nit, ContentKind::Sections);
                }
            }
            Ok(TableBody::Pmt(pmt)) => {
                for stream in &pmt.streams {
                    let kind = if stream.carries_sections() {
                        ContentKind::Sections
                    } else {
                        ContentKind::Packets
                    };
                    self.bind_discovered(stream.elementary_pid, kind);
                }
            }
            Ok(TableBody::Time(time)) => {
                self.time_records.push(TimeRecord {
                    packet_index: outcome.packet_index,
                    utc_time: time.utc_time,
                });
            }
            Ok(TableBody::Raw { .. }) => {}
            Err(err) => {
                self.report.decode_errors += 1;
                self.note(outcome.packet_index, &err);
            }
        }
    }

    /// Bind a PID announced by PAT/PMT unless it is already bound.
    fn bind_discovered(&mut self, value: u16, kind: ContentKind) {
        let Ok(pid) = Pid::new(value) else {
            return;
        };
        if pid == Pid::NULL || self.bindings.contains_key(&pid) {
            return;
        }
        debug!("PID {}: bound to {:?} by program tables", pid, kind);
        self.bindings.insert(pid, kind);
        if let Some(channel) = self.channels.get_mut(pid) {
            if channel.kind == ContentKind::Unclassified {
                channel.kind = kind;
            }
        }
    }

    fn deliver(&mut self, packets: Vec<ElementaryPacket>) {
        for packet in packets {
            if let Some(channel) = self.channels.get_mut(packet.pid) {
                channel.record_pes(&packet);
            }
            if let Some(handlers) = self.subscribers.get_mut(&packet.pid) {
                for handler in handlers.iter_mut() {
                    handler.on_packet(&packet);
                }
            }
        }
    }

    pub fn frame_size(&self) -> usize {
        self.frame_size
    }

    pub fn config(&self) -> &DemuxConfig {
        &self.config
    }

    /// Stored sections.
    pub fn registry(&self) -> &TableRegistry {
        self.sections.registry()
    }

    pub fn channels(&self) -> &ChannelTable {
        &self.channels
    }

    pub fn channel(&self, pid: Pid) -> Option<&ChannelState> {
        self.channels.get(pid)
    }

    pub fn index(&self) -> &PacketIndex {
        &self.index
    }

    /// Wall-clock records in packet order.
    pub fn time_records(&self) -> &[TimeRecord] {
        &self.time_records
    }

    /// Bitrate and wall-clock anchor of the pass so far.
    pub fn timeline(&self) -> Timeline {
        let frame_size = self.frame_size;
        TimingModel::estimate(
            self.channels.iter().filter_map(|c| c.bitrate(frame_size)),
            &self.time_records,
            frame_size,
        )
    }

    /// Counters of the pass so far.
    pub fn report(&self) -> DemuxReport {
        let mut report = self.report.clone();
        report.pids = self.channels.len();
        report.transport_errors = self.channels.iter().map(|c| c.transport_errors).sum();
        report.sections = self.sections.stats();
        report.pes = self.packets.stats();
        report
    }
}

/// Read until `buf` is full or the source ends.
fn read_full<R: Read>(reader: &mut R, buf: &mut [u8]) -> io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(filled)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ts_analyzer::psi::build_section;
    use std::cell::RefCell;
    use std::io::Cursor;
    use std::rc::Rc;

    /// One 188-byte frame carrying `payload`, padded with 0xFF.
    fn frame(pid: u16, cc: u8, unit_start: bool, payload: &[u8]) -> Vec<u8> {
        let mut data = vec![SYNC_BYTE, (pid >> 8) as u8 & 0x1F, pid as u8, 0x10 | (cc & 0x0F)];
        if unit_start {
            data[1] |= 0x40;
        }
        data.extend_from_slice(payload);
        data.resize(188, 0xFF);
        data
    }

    fn section_frame(pid: u16, cc: u8, section: &[u8]) -> Vec<u8> {
        let mut payload = vec![0x00];
        payload.extend_from_slice(section);
        frame(pid, cc, true, &payload)
    }

    fn pes_packet(body: &[u8]) -> Vec<u8> {
        let mut data = vec![0x00, 0x00, 0x01, 0xE0];
        data.extend_from_slice(&((3 + body.len()) as u16).to_be_bytes());
        data.extend_from_slice(&[0x80, 0x00, 0x00]);
        data.extend_from_slice(body);
        data
    }

    fn program_stream() -> Vec<u8> {
        let pat = build_section(table_id::PAT, 1, 0, 0, 0, &[0x00, 0x01, 0xE1, 0x00]);
        let pmt = build_section(
            table_id::PMT,
            1,
            0,
            0,
            0,
            &[0xFF, 0xFF, 0xF0, 0x00, 0x1B, 0xE2, 0x00, 0xF0, 0x00],
        );
        let mut ts = Vec::new();
        ts.extend(section_frame(0x0000, 0, &pat));
        ts.extend(section_frame(0x0100, 0, &pmt));
        ts.extend(frame(0x0200, 0, true, &pes_packet(&[0xAB; 20])));
        ts.extend(frame(0x0200, 1, true, &pes_packet(&[0xCD; 30])));
        ts
    }

    fn run(data: Vec<u8>, config: DemuxConfig) -> Demultiplexer {
        let mut demux = Demultiplexer::new(188, config);
        demux.run(Cursor::new(data), 0).unwrap();
        demux
    }

    #[test]
    fn test_program_tables_bind_pes_pid() {
        let config = DemuxConfig {
            auto_classify: false,
            ..Default::default()
        };
        let mut demux = Demultiplexer::new(188, config);
        let received = Rc::new(RefCell::new(Vec::new()));
        let sink = Rc::clone(&received);
        demux.subscribe(Pid::new(0x200).unwrap(), move |p: &ElementaryPacket| {
            sink.borrow_mut().push(p.payload().to_vec());
        });
        demux.run(Cursor::new(program_stream()), 0).unwrap();

        assert_eq!(*received.borrow(), vec![vec![0xAB; 20], vec![0xCD; 30]]);
        let pmt_channel = demux.channel(Pid::new(0x100).unwrap()).unwrap();
        assert_eq!(pmt_channel.kind, ContentKind::Sections);
        assert!(demux.registry().get(table_id::PMT, 1).is_some());
        assert_eq!(demux.channel(Pid::new(0x200).unwrap()).unwrap().pes_packets, 2);
    }

    #[test]
    fn test_program_tables_without_sniffing() {
        let config = DemuxConfig {
            auto_classify: false,
            ..Default::default()
        };
        let demux = run(program_stream(), config);
        let es = demux.channel(Pid::new(0x200).unwrap()).unwrap();
        assert_eq!(es.kind, ContentKind::Packets);
        assert_eq!(es.pes_packets, 2);
    }

    #[test]
    fn test_empty_decoders_skip_discovery() {
        let config = DemuxConfig {
            auto_classify: false,
            ..Default::default()
        };
        let mut demux = Demultiplexer::new(188, config);
        demux.set_decoders(DecoderRegistry::empty());
        demux.run(Cursor::new(program_stream()), 0).unwrap();

        assert!(demux.registry().get(table_id::PAT, 1).is_some());
        assert!(demux.registry().get(table_id::PMT, 1).is_none());
        let pmt_channel = demux.channel(Pid::new(0x100).unwrap()).unwrap();
        assert_eq!(pmt_channel.kind, ContentKind::Unclassified);
        assert_eq!(demux.report().decode_errors, 0);
    }

    #[test]
    fn test_sniffing_classifies_unlisted_pids() {
        let mut ts = Vec::new();
        ts.extend(frame(0x0300, 0, true, &pes_packet(&[1; 4])));
        ts.extend(section_frame(0x0301, 0, &build_section(0x80, 7, 0, 0, 0, &[9])));
        let demux = run(ts, DemuxConfig::default());

        assert_eq!(demux.channel(Pid::new(0x300).unwrap()).unwrap().kind, ContentKind::Packets);
        assert_eq!(demux.channel(Pid::new(0x301).unwrap()).unwrap().kind, ContentKind::Sections);
        assert!(demux.registry().get(0x80, 7).is_some());
    }

    #[test]
    fn test_resync_counts_each_loss_once() {
        let mut ts = Vec::new();
        ts.extend(frame(0x0300, 0, false, &[]));
        ts.extend([0x00; 10]);
        ts.extend(frame(0x0300, 1, false, &[]));
        ts.extend(frame(0x0300, 2, false, &[]));
        ts.extend([0x00; 3]);
        ts.extend(frame(0x0300, 3, false, &[]));
        let demux = run(ts, DemuxConfig::default());
        let report = demux.report();

        assert_eq!(report.packets, 4);
        assert_eq!(report.sync_errors, 2);
        assert_eq!(report.bytes_skipped, 13);
        assert_eq!(demux.index().get(1).unwrap().offset, 198);
        assert_eq!(demux.index().get(3).unwrap().offset, 188 * 3 + 13);
    }

    #[test]
    fn test_trailing_bytes_are_counted() {
        let mut ts = frame(0x0300, 0, false, &[]);
        ts.extend([SYNC_BYTE, 0x00, 0x00]);
        let report = run(ts, DemuxConfig::default()).report();
        assert_eq!(report.packets, 1);
        assert_eq!(report.trailing_bytes, 3);
        assert_eq!(report.sync_errors, 0);
    }

    #[test]
    fn test_duplicate_payload_is_dropped() {
        let body = pes_packet(&[0x55; 8]);
        let mut ts = Vec::new();
        ts.extend(frame(0x0300, 5, true, &body));
        ts.extend(frame(0x0300, 5, true, &body));
        ts.extend(frame(0x0300, 9, true, &body));
        let demux = run(ts, DemuxConfig::default());
        let report = demux.report();

        assert_eq!(report.duplicates, 1);
        assert_eq!(report.continuity_errors, 1);
        assert_eq!(demux.channel(Pid::new(0x300).unwrap()).unwrap().pes_packets, 2);
    }

    #[test]
    fn test_crc_failure_is_reported_not_fatal() {
        let mut pat = build_section(table_id::PAT, 1, 0, 0, 0, &[0x00, 0x01, 0xE1, 0x00]);
        pat[9] ^= 0x01;
        let mut ts = section_frame(0x0000, 0, &pat);
        ts.extend(frame(0x0300, 0, false, &[]));
        let demux = run(ts, DemuxConfig::default());
        let report = demux.report();

        assert_eq!(report.packets, 2);
        assert_eq!(report.sections.integrity_errors, 1);
        assert_eq!(report.diagnostics.len(), 1);
        assert!(demux.registry().is_empty());
        assert!(report.has_errors());
    }

    #[test]
    fn test_report_limit_caps_diagnostics() {
        let mut pat = build_section(table_id::PAT, 1, 0, 0, 0, &[0x00, 0x01, 0xE1, 0x00]);
        pat[9] ^= 0x01;
        let mut ts = section_frame(0x0000, 0, &pat);
        ts.extend(section_frame(0x0000, 1, &pat));
        let config = DemuxConfig {
            report_limit: 1,
            ..Default::default()
        };
        let report = run(ts, config).report();

        assert_eq!(report.sections.integrity_errors, 2);
        assert_eq!(report.diagnostics.len(), 1);
        assert_eq!(report.diagnostics[0].packet_index, 0);
        assert_eq!(report.diagnostics_dropped, 1);
    }

    #[test]
    fn test_time_records_and_timeline() {
        let tdt = |packet_second: u8| vec![0x70, 0x70, 0x05, 0xC0, 0x79, 0x12, 0x00, packet_second];
        let mut ts = Vec::new();
        ts.extend(section_frame(0x0014, 0, &tdt(0x00)));
        for cc in 0..9u8 {
            ts.extend(frame(0x0300, cc, false, &[]));
        }
        ts.extend(section_frame(0x0014, 1, &tdt(0x10)));
        let demux = run(ts, DemuxConfig::default());

        let records = demux.time_records();
        assert_eq!(records.len(), 2);
        assert_eq!(records[1].packet_index, 10);
        let timeline = demux.timeline();
        // 10 packets in 10 s
        assert_eq!(timeline.bitrate, Some(1504));
        assert_eq!(timeline.anchor, Some(records[0].utc_time));
    }

    #[test]
    fn test_cancelled_before_start() {
        let token = CancelToken::new();
        let mut demux = Demultiplexer::new(188, DemuxConfig::default());
        demux.set_cancel_token(token.clone());
        token.cancel();
        let result = demux.run(Cursor::new(program_stream()), 0);
        assert!(matches!(result, Err(DissectError::Cancelled { packets: 0 })));
    }

    #[test]
    fn test_cancel_mid_pass_keeps_committed_tables() {
        let pat = build_section(table_id::PAT, 1, 0, 0, 0, &[0x00, 0x01, 0xE1, 0x00]);
        let sdt = build_section(table_id::SDT_ACTUAL, 1, 0, 0, 0, &[0x5A; 588]);
        let pes = pes_packet(&[0x55; 1000]);
        let mut ts = section_frame(0x0000, 0, &pat);
        ts.extend(section_frame(0x0011, 0, &sdt[..183]));
        ts.extend(frame(0x0300, 0, true, &pes[..184]));
        ts.extend(frame(0x0011, 1, false, &sdt[183..367]));
        ts.extend(frame(0x0300, 1, false, &pes[184..368]));

        let config = DemuxConfig {
            progress_interval: 3,
            ..Default::default()
        };
        let mut demux = Demultiplexer::new(188, config);
        let token = CancelToken::new();
        demux.set_cancel_token(token.clone());
        demux.set_progress(move |_| token.cancel());
        let received = Rc::new(RefCell::new(0));
        let sink = Rc::clone(&received);
        demux.subscribe(Pid::new(0x300).unwrap(), move |_: &ElementaryPacket| {
            *sink.borrow_mut() += 1;
        });

        let result = demux.run(Cursor::new(ts), 0);
        assert!(matches!(result, Err(DissectError::Cancelled { packets: 3 })));

        let report = demux.report();
        assert_eq!(report.packets, 3);
        assert!(demux.registry().get(table_id::PAT, 1).is_some());
        assert!(demux.registry().get(table_id::SDT_ACTUAL, 1).is_none());
        assert_eq!(report.sections.truncated, 0);
        assert_eq!(report.pes.completed, 0);
        assert_eq!(report.pes.incomplete, 0);
        assert_eq!(*received.borrow(), 0);
    }

    #[test]
    fn test_last_timestamped_frame_without_trailer() {
        let pat = build_section(table_id::PAT, 1, 0, 0, 0, &[0x00, 0x01, 0xE1, 0x00]);
        let mut ts = Vec::new();
        for cc in 0..10u8 {
            ts.extend_from_slice(&[0x12, 0x34, 0x00, 0x00]);
            ts.extend(frame(0x1FFF, cc, false, &[]));
        }
        ts.extend_from_slice(&[0x12, 0x34, 0x00, 0x00]);
        ts.extend(section_frame(0x0000, 0, &pat));

        let mut cursor = Cursor::new(ts);
        let (mut demux, sync) = Demultiplexer::open(&mut cursor, DemuxConfig::default()).unwrap();
        assert_eq!(sync.frame_size, 192);
        assert_eq!(sync.first_sync, 4);
        demux.run(&mut cursor, sync.first_sync as u64).unwrap();

        let report = demux.report();
        assert_eq!(report.packets, 11);
        assert_eq!(report.trailing_bytes, 0);
        assert_eq!(report.sync_errors, 0);
        assert!(demux.registry().get(table_id::PAT, 1).is_some());
        assert_eq!(demux.index().get(10).map(|e| e.offset), Some(4 + 10 * 192));
    }

    #[test]
    fn test_progress_callback() {
        let config = DemuxConfig {
            progress_interval: 2,
            ..Default::default()
        };
        let mut demux = Demultiplexer::new(188, config);
        let offsets = Rc::new(RefCell::new(Vec::new()));
        let sink = Rc::clone(&offsets);
        demux.set_progress(move |offset| sink.borrow_mut().push(offset));
        demux.run(Cursor::new(program_stream()), 0).unwrap();
        assert_eq!(*offsets.borrow(), vec![376, 752]);
    }

    #[test]
    fn test_open_detects_offset() {
        let mut data = vec![0x00; 7];
        for cc in 0..8u8 {
            data.extend(frame(0x0300, cc, false, &[]));
        }
        let mut cursor = Cursor::new(data);
        let (mut demux, sync) = Demultiplexer::open(&mut cursor, DemuxConfig::default()).unwrap();
        assert_eq!(sync.first_sync, 7);
        demux.run(&mut cursor, sync.first_sync as u64).unwrap();
        assert_eq!(demux.report().packets, 8);
        assert_eq!(demux.report().sync_errors, 0);
    }
}
