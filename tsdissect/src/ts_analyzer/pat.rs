//! PAT (Program Association Table) parsing.
//!
//! The PAT is transmitted on PID 0x0000 and contains a list of programs
//! with their PMT PIDs.

use nom::multi::many0;
use nom::number::complete::be_u16;
use nom::IResult;
use serde::Serialize;

use super::psi::TableRecord;
use super::table_id;
use crate::error::DissectError;

/// One program loop entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PatEntry {
    pub program_number: u16,
    /// PMT PID, or the NIT PID for program 0.
    pub pid: u16,
}

/// Decoded PAT.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PatTable {
    pub transport_stream_id: u16,
    pub version_number: u8,
    /// Programs other than program 0.
    pub programs: Vec<PatEntry>,
    pub nit_pid: Option<u16>,
}

fn pat_entry(input: &[u8]) -> IResult<&[u8], PatEntry> {
    let (input, program_number) = be_u16(input)?;
    let (input, pid) = be_u16(input)?;
    Ok((
        input,
        PatEntry {
            program_number,
            pid: pid & 0x1FFF,
        },
    ))
}

impl PatTable {
    /// Parse a PAT from a verified section.
    pub fn parse(record: &TableRecord) -> Result<Self, DissectError> {
        if record.header.table_id != table_id::PAT {
            return Err(DissectError::Malformed("not a PAT section"));
        }

        let (rest, entries) = many0(pat_entry)(record.data())
            .map_err(|_: nom::Err<nom::error::Error<&[u8]>>| DissectError::Malformed("invalid PAT loop"))?;
        if !rest.is_empty() {
            return Err(DissectError::Malformed("invalid PAT data length"));
        }

        let mut pat = PatTable {
            transport_stream_id: record.header.table_id_extension,
            version_number: record.header.version_number,
            programs: Vec::new(),
            nit_pid: None,
        };
        for entry in entries {
            if entry.program_number == 0 {
                pat.nit_pid = Some(entry.pid);
            } else {
                pat.programs.push(entry);
            }
        }

        Ok(pat)
    }

    /// PMT PIDs of every program, in table order.
    pub fn pmt_pids(&self) -> impl Iterator<Item = u16> + '_ {
        self.programs.iter().map(|p| p.pid)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ts_analyzer::packet::Pid;
    use crate::ts_analyzer::psi::build_section;

    fn record(raw: Vec<u8>) -> TableRecord {
        TableRecord::new(Pid::new(0).unwrap(), raw).unwrap()
    }

    #[test]
    fn test_parse_pat() {
        let data = [
            // Program 1: number=0x0101, PID=0x0100
            0x01, 0x01, 0xE1, 0x00,
            // Program 2: number=0x0102, PID=0x0200
            0x01, 0x02, 0xE2, 0x00,
        ];
        let pat = PatTable::parse(&record(build_section(table_id::PAT, 0x1234, 1, 0, 0, &data))).unwrap();

        assert_eq!(pat.transport_stream_id, 0x1234);
        assert_eq!(pat.version_number, 1);
        assert_eq!(pat.programs.len(), 2);
        assert_eq!(pat.programs[0].program_number, 0x0101);
        assert_eq!(pat.programs[0].pid, 0x0100);
        assert_eq!(pat.pmt_pids().collect::<Vec<_>>(), vec![0x0100, 0x0200]);
    }

    #[test]
    fn test_pat_with_nit() {
        let data = [
            // NIT: number=0x0000, PID=0x0010
            0x00, 0x00, 0xE0, 0x10,
            // Program 1: number=0x0101, PID=0x0100
            0x01, 0x01, 0xE1, 0x00,
        ];
        let pat = PatTable::parse(&record(build_section(table_id::PAT, 0x1234, 0, 0, 0, &data))).unwrap();

        assert_eq!(pat.nit_pid, Some(0x0010));
        assert_eq!(pat.programs.len(), 1);
    }

    #[test]
    fn test_pat_bad_length() {
        let data = [0x01, 0x01, 0xE1];
        let result = PatTable::parse(&record(build_section(table_id::PAT, 1, 0, 0, 0, &data)));
        assert!(result.is_err());
    }
}
