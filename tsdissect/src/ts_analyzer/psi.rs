//! PSI (Program Specific Information) section reassembly.
//!
//! This module handles common PSI section header parsing, CRC validation and
//! the reconstruction of sections that span several TS packets.

use std::collections::HashMap;

use log::{debug, warn};
use serde::Serialize;

use super::packet::Pid;
use super::registry::{SectionOutcome, TableRegistry};
use super::table_id;
use crate::error::DissectError;

/// Size of the short section header (table_id + length).
pub const SHORT_HEADER_SIZE: usize = 3;

/// Size of the long section header.
pub const LONG_HEADER_SIZE: usize = 8;

/// Largest value of the 12-bit section_length field.
pub const MAX_SECTION_LENGTH: usize = 0x0FFF;

/// PSI section header (common to all PSI tables).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PsiHeader {
    /// Table ID.
    pub table_id: u8,
    /// Section syntax indicator.
    pub section_syntax_indicator: bool,
    /// Private indicator.
    pub private_indicator: bool,
    /// Section length (12 bits).
    pub section_length: u16,
    /// Table ID extension (for long sections).
    pub table_id_extension: u16,
    /// Version number (5 bits).
    pub version_number: u8,
    /// Current/next indicator.
    pub current_next_indicator: bool,
    /// Section number.
    pub section_number: u8,
    /// Last section number.
    pub last_section_number: u8,
}

impl PsiHeader {
    /// Parse a section header from raw bytes starting at table_id.
    pub fn parse(data: &[u8]) -> Result<Self, DissectError> {
        if data.len() < SHORT_HEADER_SIZE {
            return Err(DissectError::Malformed("section too short for header"));
        }

        let table_id = data[0];
        let section_syntax_indicator = data[1] & 0x80 != 0;
        let private_indicator = data[1] & 0x40 != 0;
        let section_length = ((data[1] as u16 & 0x0F) << 8) | data[2] as u16;

        if !section_syntax_indicator {
            return Ok(PsiHeader {
                table_id,
                section_syntax_indicator,
                private_indicator,
                section_length,
                table_id_extension: 0,
                version_number: 0,
                current_next_indicator: true,
                section_number: 0,
                last_section_number: 0,
            });
        }

        // Long form: 5 header bytes plus CRC must fit in section_length.
        if data.len() < LONG_HEADER_SIZE || (section_length as usize) < 9 {
            return Err(DissectError::Malformed("section too short for extended header"));
        }

        Ok(PsiHeader {
            table_id,
            section_syntax_indicator,
            private_indicator,
            section_length,
            table_id_extension: ((data[3] as u16) << 8) | data[4] as u16,
            version_number: (data[5] >> 1) & 0x1F,
            current_next_indicator: data[5] & 0x01 != 0,
            section_number: data[6],
            last_section_number: data[7],
        })
    }

    /// Total section size including header and CRC.
    pub fn total_length(&self) -> usize {
        SHORT_HEADER_SIZE + self.section_length as usize
    }

    /// Whether the section ends with a CRC32.
    pub fn has_crc(&self) -> bool {
        self.section_syntax_indicator || self.table_id == table_id::TOT
    }
}

/// A complete, CRC-verified section.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TableRecord {
    /// PID the section was carried on.
    pub pid: Pid,
    /// Parsed header.
    pub header: PsiHeader,
    /// The whole section, table_id through CRC.
    #[serde(skip)]
    pub raw: Vec<u8>,
}

impl TableRecord {
    /// Build a record from the exact bytes of one section.
    pub fn new(pid: Pid, raw: Vec<u8>) -> Result<Self, DissectError> {
        let header = PsiHeader::parse(&raw)?;
        if raw.len() != header.total_length() {
            return Err(DissectError::Malformed("section length mismatch"));
        }
        if header.has_crc() && raw.len() < SHORT_HEADER_SIZE + 4 {
            return Err(DissectError::Malformed("section too short for CRC"));
        }
        Ok(TableRecord { pid, header, raw })
    }

    /// Section data (after header, before CRC).
    pub fn data(&self) -> &[u8] {
        let start = if self.header.section_syntax_indicator {
            LONG_HEADER_SIZE
        } else {
            SHORT_HEADER_SIZE
        };
        let end = if self.header.has_crc() {
            self.raw.len() - 4
        } else {
            self.raw.len()
        };
        self.raw.get(start..end).unwrap_or(&[])
    }

    /// Stored CRC32 value, if the section carries one.
    pub fn crc32(&self) -> Option<u32> {
        if !self.header.has_crc() {
            return None;
        }
        let offset = self.raw.len() - 4;
        Some(u32::from_be_bytes([
            self.raw[offset],
            self.raw[offset + 1],
            self.raw[offset + 2],
            self.raw[offset + 3],
        ]))
    }

    /// CRC residue over the whole section; zero when intact.
    pub fn crc_residue(&self) -> u32 {
        if self.header.has_crc() {
            crc32_mpeg2(&self.raw)
        } else {
            0
        }
    }
}

/// Reassembly state for one PID.
#[derive(Debug, Default)]
struct SectionBuffer {
    /// Bytes of the section in progress.
    buffer: Vec<u8>,
    /// Whether a section start has been seen.
    active: bool,
    /// Packet index where the current section started.
    start_packet: u64,
}

impl SectionBuffer {
    fn clear(&mut self) {
        self.buffer.clear();
        self.active = false;
    }

    fn expected_length(&self) -> Option<usize> {
        if self.buffer.len() < SHORT_HEADER_SIZE {
            return None;
        }
        let section_length = ((self.buffer[1] as usize & 0x0F) << 8) | self.buffer[2] as usize;
        Some(SHORT_HEADER_SIZE + section_length)
    }
}

/// Counters kept by the section assembler.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SectionStats {
    /// Sections that passed CRC and were stored.
    pub accepted: u64,
    /// Sections discarded for a CRC mismatch.
    pub integrity_errors: u64,
    /// Sections abandoned before reaching their declared length.
    pub truncated: u64,
    /// Sections whose header could not be parsed.
    pub malformed: u64,
}

/// Reassembles sections from TS payloads and stores them in a
/// [`TableRegistry`].
#[derive(Debug, Default)]
pub struct SectionAssembler {
    buffers: HashMap<Pid, SectionBuffer>,
    registry: TableRegistry,
    stats: SectionStats,
}

impl SectionAssembler {
    /// Create an empty section assembler.
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed one TS payload.
    ///
    /// Returns an entry per section that completed inside this payload: the
    /// registry outcome when it was stored, or the error that caused it to
    /// be discarded. Errors here never invalidate earlier sections.
    pub fn feed(
        &mut self,
        pid: Pid,
        payload: &[u8],
        unit_start: bool,
        packet_index: u64,
    ) -> Vec<Result<SectionOutcome, DissectError>> {
        let mut results = Vec::new();
        let mut completed = Vec::new();
        let buf = self.buffers.entry(pid).or_default();

        if unit_start {
            let Some((&pointer, body)) = payload.split_first() else {
                return results;
            };
            let pointer = pointer as usize;

            // Bytes before the pointer finish the previous section.
            if buf.active {
                let tail = &body[..pointer.min(body.len())];
                buf.buffer.extend_from_slice(tail);
                Self::drain_complete(buf, &mut completed);
                if buf.active && !buf.buffer.is_empty() {
                    let expected = buf.expected_length().unwrap_or(SHORT_HEADER_SIZE);
                    results.push(Err(DissectError::Truncated {
                        what: "section",
                        pid: pid.value(),
                        expected,
                        actual: buf.buffer.len(),
                    }));
                    self.stats.truncated += 1;
                }
            }

            buf.clear();
            if let Some(rest) = body.get(pointer..) {
                buf.active = true;
                buf.start_packet = packet_index;
                buf.buffer.extend_from_slice(rest);
                Self::drain_complete(buf, &mut completed);
            }
        } else if buf.active {
            buf.buffer.extend_from_slice(payload);
            Self::drain_complete(buf, &mut completed);
        }

        for raw in completed {
            results.push(self.finish(pid, raw, packet_index));
        }
        results
    }

    /// Drop the section in progress on `pid`, e.g. after lost packets.
    pub fn reset(&mut self, pid: Pid) -> Option<DissectError> {
        let buf = self.buffers.get_mut(&pid)?;
        let pending = buf.active && !buf.buffer.is_empty();
        let err = pending.then(|| DissectError::Truncated {
            what: "section",
            pid: pid.value(),
            expected: buf.expected_length().unwrap_or(SHORT_HEADER_SIZE),
            actual: buf.buffer.len(),
        });
        buf.clear();
        if err.is_some() {
            self.stats.truncated += 1;
        }
        err
    }

    /// Report every section still in progress at end of source.
    pub fn flush(&mut self) -> Vec<DissectError> {
        let mut errors = Vec::new();
        let mut pids: Vec<Pid> = self.buffers.keys().copied().collect();
        pids.sort();
        for pid in pids {
            if let Some(err) = self.reset(pid) {
                errors.push(err);
            }
        }
        errors
    }

    /// Split every complete section off the front of the buffer.
    fn drain_complete(buf: &mut SectionBuffer, completed: &mut Vec<Vec<u8>>) {
        loop {
            match buf.buffer.first() {
                None => return,
                // Stuffing: nothing more in this unit.
                Some(0xFF) => {
                    buf.clear();
                    return;
                }
                Some(_) => {}
            }
            let Some(expected) = buf.expected_length() else {
                return;
            };
            if buf.buffer.len() < expected {
                return;
            }
            let rest = buf.buffer.split_off(expected);
            completed.push(std::mem::replace(&mut buf.buffer, rest));
        }
    }

    fn finish(
        &mut self,
        pid: Pid,
        raw: Vec<u8>,
        packet_index: u64,
    ) -> Result<SectionOutcome, DissectError> {
        let record = TableRecord::new(pid, raw).map_err(|e| {
            self.stats.malformed += 1;
            e
        })?;

        let residue = record.crc_residue();
        if residue != 0 {
            self.stats.integrity_errors += 1;
            warn!(
                "Discarding section on PID {}: table_id=0x{:02X} CRC mismatch",
                pid, record.header.table_id
            );
            return Err(DissectError::Integrity {
                pid: pid.value(),
                table_id: record.header.table_id,
                extension: record.header.table_id_extension,
                residue,
            });
        }

        self.stats.accepted += 1;
        let outcome = self.registry.insert(record, packet_index);
        debug!(
            "PID {}: table 0x{:02X}/0x{:04X} part {} -> {:?}",
            pid, outcome.key.table_id, outcome.key.extension, outcome.part, outcome.insertion
        );
        Ok(outcome)
    }

    /// Stored tables.
    pub fn registry(&self) -> &TableRegistry {
        &self.registry
    }

    /// Assembler counters.
    pub fn stats(&self) -> SectionStats {
        self.stats
    }
}

/// Calculate CRC32 for MPEG-2 (polynomial 0x04C11DB7).
pub fn crc32_mpeg2(data: &[u8]) -> u32 {
    // CRC32 lookup table for MPEG-2 polynomial
    static CRC_TABLE: [u32; 256] = {
        let mut table = [0u32; 256];
        let mut i = 0;
        while i < 256 {
            let mut crc = (i as u32) << 24;
            let mut j = 0;
            while j < 8 {
                if crc & 0x80000000 != 0 {
                    crc = (crc << 1) ^ 0x04C11DB7;
                } else {
                    crc <<= 1;
                }
                j += 1;
            }
            table[i] = crc;
            i += 1;
        }
        table
    };

    let mut crc = 0xFFFFFFFFu32;
    for &byte in data {
        let index = ((crc >> 24) ^ byte as u32) as usize;
        crc = (crc << 8) ^ CRC_TABLE[index];
    }
    crc
}

/// Build a long-form section around `body`, appending a valid CRC.
#[cfg(test)]
pub(crate) fn build_section(table_id: u8, extension: u16, version: u8, part: u8, last: u8, body: &[u8]) -> Vec<u8> {
    let section_length = 5 + body.len() + 4;
    let mut raw = vec![
        table_id,
        0xB0 | ((section_length >> 8) as u8 & 0x0F),
        section_length as u8,
        (extension >> 8) as u8,
        extension as u8,
        0xC1 | (version << 1),
        part,
        last,
    ];
    raw.extend_from_slice(body);
    let crc = crc32_mpeg2(&raw);
    raw.extend_from_slice(&crc.to_be_bytes());
    raw
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ts_analyzer::registry::{Insertion, TableKey};

    fn pid(v: u16) -> Pid {
        Pid::new(v).unwrap()
    }

    fn with_pointer(section: &[u8]) -> Vec<u8> {
        let mut payload = vec![0u8];
        payload.extend_from_slice(section);
        payload
    }

    #[test]
    fn test_crc32_empty() {
        // CRC32 of empty data with initial value 0xFFFFFFFF
        let crc = crc32_mpeg2(&[]);
        assert_eq!(crc, 0xFFFFFFFF);
    }

    #[test]
    fn test_crc_residue_is_zero() {
        let section = build_section(0x00, 0x1234, 0, 0, 0, &[0x00, 0x01, 0xE1, 0x00]);
        assert_eq!(crc32_mpeg2(&section), 0);
    }

    #[test]
    fn test_single_packet_section() {
        let section = build_section(0x00, 0x0001, 3, 0, 0, &[0x00, 0x01, 0xE1, 0x00]);
        let mut payload = with_pointer(&section);
        payload.resize(184, 0xFF);

        let mut asm = SectionAssembler::new();
        let results = asm.feed(pid(0), &payload, true, 0);
        assert_eq!(results.len(), 1);
        let outcome = results[0].as_ref().unwrap();
        assert_eq!(outcome.key, TableKey { table_id: 0, extension: 1 });
        assert_eq!(outcome.version, 3);
        assert_eq!(outcome.insertion, Insertion::New);
    }

    #[test]
    fn test_two_sections_in_one_packet() {
        let a = build_section(0x42, 0x0010, 0, 0, 1, &[1, 2, 3]);
        let b = build_section(0x42, 0x0010, 0, 1, 1, &[4, 5, 6]);
        let mut payload = vec![0u8];
        payload.extend_from_slice(&a);
        payload.extend_from_slice(&b);
        payload.resize(184, 0xFF);

        let mut asm = SectionAssembler::new();
        let results = asm.feed(pid(0x11), &payload, true, 7);
        assert_eq!(results.len(), 2);
        assert!(results.iter().all(|r| r.is_ok()));
        let set = asm.registry().get(0x42, 0x0010).unwrap();
        assert!(set.is_complete());
    }

    #[test]
    fn test_pointer_field_finishes_previous_section() {
        let body: Vec<u8> = (0..200u8).collect();
        let first = build_section(0x02, 0x0101, 0, 0, 0, &body);
        let second = build_section(0x02, 0x0102, 0, 0, 0, &[9, 9]);

        let mut asm = SectionAssembler::new();
        let (head, tail) = first.split_at(183);
        assert!(asm.feed(pid(0x100), &with_pointer(head), true, 0).is_empty());

        let mut payload = vec![tail.len() as u8];
        payload.extend_from_slice(tail);
        payload.extend_from_slice(&second);
        payload.resize(184, 0xFF);
        let results = asm.feed(pid(0x100), &payload, true, 1);
        assert_eq!(results.len(), 2);
        assert_eq!(results[0].as_ref().unwrap().key.extension, 0x0101);
        assert_eq!(results[1].as_ref().unwrap().key.extension, 0x0102);
    }

    #[test]
    fn test_header_straddles_packets() {
        let section = build_section(0x02, 0x0005, 0, 0, 0, &[0xAB; 10]);
        let mut asm = SectionAssembler::new();
        assert!(asm.feed(pid(0x20), &with_pointer(&section[..2]), true, 0).is_empty());
        let results = asm.feed(pid(0x20), &section[2..], false, 1);
        assert_eq!(results.len(), 1);
        assert!(results[0].is_ok());
    }

    #[test]
    fn test_continuation_without_start_is_ignored() {
        let mut asm = SectionAssembler::new();
        assert!(asm.feed(pid(0x30), &[0x00, 0xB0, 0x0D], false, 0).is_empty());
        assert_eq!(asm.stats(), SectionStats::default());
    }

    #[test]
    fn test_new_start_truncates_incomplete_section() {
        let body = vec![0u8; 300];
        let section = build_section(0x02, 0x0001, 0, 0, 0, &body);
        let mut asm = SectionAssembler::new();
        asm.feed(pid(0x40), &with_pointer(&section[..183]), true, 0);

        let results = asm.feed(pid(0x40), &[0x00, 0xFF], true, 1);
        assert_eq!(results.len(), 1);
        assert!(matches!(
            results[0],
            Err(DissectError::Truncated { what: "section", .. })
        ));
        assert_eq!(asm.stats().truncated, 1);
    }

    #[test]
    fn test_crc_mismatch_is_discarded() {
        let mut section = build_section(0x00, 0x0001, 0, 0, 0, &[0x00, 0x01, 0xE1, 0x00]);
        section[9] ^= 0x01;
        let mut asm = SectionAssembler::new();
        let results = asm.feed(pid(0), &with_pointer(&section), true, 0);
        assert!(matches!(results[0], Err(DissectError::Integrity { table_id: 0, .. })));
        assert!(asm.registry().get(0x00, 0x0001).is_none());
        assert_eq!(asm.stats().integrity_errors, 1);
    }

    #[test]
    fn test_short_section_without_crc() {
        // TDT: 40-bit UTC time, no CRC
        let tdt = [0x70, 0x70, 0x05, 0xE4, 0x7C, 0x12, 0x34, 0x56];
        let mut asm = SectionAssembler::new();
        let results = asm.feed(pid(0x14), &with_pointer(&tdt), true, 5);
        assert!(results[0].is_ok());
        let set = asm.registry().get(0x70, 0).unwrap();
        let record = &set.chain(0)[0].record;
        assert_eq!(record.data(), &tdt[3..]);
        assert_eq!(record.crc32(), None);
    }

    #[test]
    fn test_flush_reports_pending() {
        let section = build_section(0x02, 0x0001, 0, 0, 0, &[0u8; 400]);
        let mut asm = SectionAssembler::new();
        asm.feed(pid(0x50), &with_pointer(&section[..183]), true, 0);
        let errors = asm.flush();
        assert_eq!(errors.len(), 1);
        assert!(asm.flush().is_empty());
    }
}
