//! Storage of accepted sections with their version history.
//!
//! Sections are grouped by (table_id, table_id_extension). Each part slot
//! of a table keeps an append-only chain: byte-identical repeats only bump
//! a counter, any change appends a new entry after the existing ones.

use std::collections::BTreeMap;

use serde::Serialize;

use super::packet::Pid;
use super::psi::TableRecord;

/// Key of a table set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub struct TableKey {
    pub table_id: u8,
    pub extension: u16,
}

/// One observed version of a section.
#[derive(Debug, Clone, Serialize)]
pub struct SectionEntry {
    pub record: TableRecord,
    /// Times these exact bytes were seen.
    pub occurrences: u32,
    /// Packet index of the first observation.
    pub first_packet: u64,
    /// Packet index of the latest observation.
    pub last_packet: u64,
}

impl SectionEntry {
    /// Average distance in packets between repeats.
    pub fn repetition_interval(&self) -> Option<u64> {
        if self.occurrences < 2 {
            return None;
        }
        Some((self.last_packet - self.first_packet) / (self.occurrences as u64 - 1))
    }
}

/// How a section was stored.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Insertion {
    /// First section for an empty slot.
    New,
    /// Byte-identical to a stored version.
    Repeat { occurrences: u32 },
    /// Differs from every stored version; appended to the chain.
    NewVersion { chain_length: usize },
}

/// Result of storing one section.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct SectionOutcome {
    pub pid: Pid,
    pub key: TableKey,
    pub part: u8,
    pub version: u8,
    pub insertion: Insertion,
    /// Position of the matching entry in the slot's chain.
    pub position: usize,
    pub packet_index: u64,
}

/// All sections seen for one (table_id, extension).
#[derive(Debug, Clone, Default, Serialize)]
pub struct TableSet {
    parts: Vec<Vec<SectionEntry>>,
}

impl TableSet {
    /// Store a section in its part slot.
    ///
    /// A section byte-identical to any stored version of the part, not
    /// only the newest, counts as a repeat of that version. A reverted
    /// version (A, B, A) therefore leaves a chain of two entries.
    fn insert(&mut self, record: TableRecord, packet_index: u64) -> (Insertion, usize) {
        let part = record.header.section_number as usize;
        let needed = (record.header.last_section_number as usize + 1).max(part + 1);
        if self.parts.len() < needed {
            self.parts.resize_with(needed, Vec::new);
        }

        let chain = &mut self.parts[part];
        if chain.is_empty() {
            chain.push(SectionEntry {
                record,
                occurrences: 1,
                first_packet: packet_index,
                last_packet: packet_index,
            });
            return (Insertion::New, 0);
        }

        if let Some(position) = chain.iter().position(|e| e.record.raw == record.raw) {
            let entry = &mut chain[position];
            entry.occurrences += 1;
            entry.last_packet = packet_index;
            return (
                Insertion::Repeat {
                    occurrences: entry.occurrences,
                },
                position,
            );
        }

        chain.push(SectionEntry {
            record,
            occurrences: 1,
            first_packet: packet_index,
            last_packet: packet_index,
        });
        (
            Insertion::NewVersion {
                chain_length: chain.len(),
            },
            chain.len() - 1,
        )
    }

    /// Number of part slots (last_section_number + 1).
    pub fn parts_total(&self) -> usize {
        self.parts.len()
    }

    /// Version chain of one part slot, oldest first.
    pub fn chain(&self, part: usize) -> &[SectionEntry] {
        self.parts.get(part).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Every slot has at least one version.
    pub fn is_complete(&self) -> bool {
        !self.parts.is_empty() && self.parts.iter().all(|c| !c.is_empty())
    }

    /// Latest version of each filled slot, in part order.
    pub fn current(&self) -> impl Iterator<Item = &SectionEntry> {
        self.parts.iter().filter_map(|c| c.last())
    }

    /// Total number of distinct section versions stored.
    pub fn version_count(&self) -> usize {
        self.parts.iter().map(Vec::len).sum()
    }
}

/// Registry of every accepted section, keyed by table.
#[derive(Debug, Clone, Default, Serialize)]
pub struct TableRegistry {
    #[serde(serialize_with = "serialize_sets")]
    sets: BTreeMap<TableKey, TableSet>,
}

impl TableRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store a verified section.
    pub fn insert(&mut self, record: TableRecord, packet_index: u64) -> SectionOutcome {
        let key = TableKey {
            table_id: record.header.table_id,
            extension: record.header.table_id_extension,
        };
        let pid = record.pid;
        let part = record.header.section_number;
        let version = record.header.version_number;
        let (insertion, position) = self
            .sets
            .entry(key)
            .or_default()
            .insert(record, packet_index);
        SectionOutcome {
            pid,
            key,
            part,
            version,
            insertion,
            position,
            packet_index,
        }
    }

    /// Look up a table set.
    pub fn get(&self, table_id: u8, extension: u16) -> Option<&TableSet> {
        self.sets.get(&TableKey {
            table_id,
            extension,
        })
    }

    /// The stored entry an outcome refers to.
    pub fn entry(&self, outcome: &SectionOutcome) -> Option<&SectionEntry> {
        self.sets
            .get(&outcome.key)?
            .chain(outcome.part as usize)
            .get(outcome.position)
    }

    /// All sets in key order.
    pub fn iter(&self) -> impl Iterator<Item = (&TableKey, &TableSet)> {
        self.sets.iter()
    }

    /// All sets of one table_id.
    pub fn by_table_id(&self, table_id: u8) -> impl Iterator<Item = (&TableKey, &TableSet)> {
        self.sets.iter().filter(move |(k, _)| k.table_id == table_id)
    }

    pub fn len(&self) -> usize {
        self.sets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sets.is_empty()
    }
}

fn serialize_sets<S>(sets: &BTreeMap<TableKey, TableSet>, serializer: S) -> Result<S::Ok, S::Error>
where
    S: serde::Serializer,
{
    use serde::ser::SerializeSeq;

    let mut seq = serializer.serialize_seq(Some(sets.len()))?;
    for (key, set) in sets {
        seq.serialize_element(&(key, set))?;
    }
    seq.end()
}
