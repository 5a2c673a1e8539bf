//! Table body decoding.
//!
//! Header fields (version, part index, CRC) are handled uniformly by the
//! section assembler. The body of a section is decoded by a function looked
//! up by table_id; unknown tables stay raw.

use std::collections::HashMap;

use serde::Serialize;

use super::pat::PatTable;
use super::pmt::PmtTable;
use super::psi::TableRecord;
use super::table_id;
use super::tdt::TimeTable;
use crate::error::DissectError;

/// Decoded section body.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TableBody {
    Pat(PatTable),
    Pmt(PmtTable),
    Time(TimeTable),
    /// No decoder registered for this table_id.
    Raw { length: usize },
}

/// Body decoder for one table_id.
pub type DecodeFn = fn(&TableRecord) -> Result<TableBody, DissectError>;

/// Map from table_id to body decoder.
#[derive(Debug, Clone)]
pub struct DecoderRegistry {
    decoders: HashMap<u8, DecodeFn>,
}

impl Default for DecoderRegistry {
    fn default() -> Self {
        let mut registry = DecoderRegistry {
            decoders: HashMap::new(),
        };
        registry.register(table_id::PAT, |r| PatTable::parse(r).map(TableBody::Pat));
        registry.register(table_id::PMT, |r| PmtTable::parse(r).map(TableBody::Pmt));
        registry.register(table_id::TDT, |r| TimeTable::parse(r).map(TableBody::Time));
        registry.register(table_id::TOT, |r| TimeTable::parse(r).map(TableBody::Time));
        registry
    }
}

impl DecoderRegistry {
    /// Registry without any decoder; every body stays raw.
    pub fn empty() -> Self {
        DecoderRegistry {
            decoders: HashMap::new(),
        }
    }

    /// Register or replace the decoder for `table_id`.
    pub fn register(&mut self, table_id: u8, decoder: DecodeFn) {
        self.decoders.insert(table_id, decoder);
    }

    /// Decode a section body.
    pub fn decode(&self, record: &TableRecord) -> Result<TableBody, DissectError> {
        match self.decoders.get(&record.header.table_id) {
            Some(decode) => decode(record),
            None => Ok(TableBody::Raw {
                length: record.data().len(),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ts_analyzer::packet::Pid;
    use crate::ts_analyzer::psi::build_section;

    #[test]
    fn test_dispatch_by_table_id() {
        let registry = DecoderRegistry::default();
        let pat = TableRecord::new(
            Pid::new(0).unwrap(),
            build_section(table_id::PAT, 1, 0, 0, 0, &[0x00, 0x01, 0xE1, 0x00]),
        )
        .unwrap();
        assert!(matches!(registry.decode(&pat), Ok(TableBody::Pat(_))));

        let sdt = TableRecord::new(
            Pid::new(0x11).unwrap(),
            build_section(0x42, 1, 0, 0, 0, &[1, 2, 3]),
        )
        .unwrap();
        assert_eq!(registry.decode(&sdt).unwrap(), TableBody::Raw { length: 3 });
    }

    #[test]
    fn test_empty_registry_keeps_raw() {
        let registry = DecoderRegistry::empty();
        let pat = TableRecord::new(
            Pid::new(0).unwrap(),
            build_section(table_id::PAT, 1, 0, 0, 0, &[]),
        )
        .unwrap();
        assert_eq!(registry.decode(&pat).unwrap(), TableBody::Raw { length: 0 });
    }
}
