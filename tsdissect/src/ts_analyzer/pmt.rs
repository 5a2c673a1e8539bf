//! PMT (Program Map Table) parsing.
//!
//! The PMT lists the elementary streams of a program. Its stream types tell
//! the demultiplexer which PIDs carry PES packets and which carry sections.

use nom::bytes::complete::take;
use nom::multi::many0;
use nom::number::complete::{be_u16, be_u8};
use nom::IResult;
use serde::Serialize;

use super::psi::TableRecord;
use super::table_id;
use crate::error::DissectError;

/// Stream type constants.
pub mod stream_type {
    /// MPEG-1 Video.
    pub const MPEG1_VIDEO: u8 = 0x01;
    /// MPEG-2 Video.
    pub const MPEG2_VIDEO: u8 = 0x02;
    /// MPEG-1 Audio.
    pub const MPEG1_AUDIO: u8 = 0x03;
    /// MPEG-2 Audio.
    pub const MPEG2_AUDIO: u8 = 0x04;
    /// MPEG-2 Private Sections.
    pub const PRIVATE_SECTIONS: u8 = 0x05;
    /// MPEG-2 PES Private Data.
    pub const PES_PRIVATE_DATA: u8 = 0x06;
    /// DSM-CC multiprotocol encapsulation and carousels.
    pub const DSMCC_A: u8 = 0x0A;
    pub const DSMCC_B: u8 = 0x0B;
    pub const DSMCC_C: u8 = 0x0C;
    pub const DSMCC_D: u8 = 0x0D;
    /// AAC Audio (ADTS).
    pub const AAC_AUDIO: u8 = 0x0F;
    /// AAC Audio (LATM).
    pub const AAC_LATM: u8 = 0x11;
    /// MPEG-4 Video (H.264/AVC).
    pub const H264_VIDEO: u8 = 0x1B;
    /// HEVC Video (H.265).
    pub const H265_VIDEO: u8 = 0x24;
    /// SCTE-35 splice information.
    pub const SCTE35: u8 = 0x86;
}

/// A single elementary stream entry in the PMT.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PmtStream {
    /// Stream type.
    pub stream_type: u8,
    /// Elementary PID.
    pub elementary_pid: u16,
    /// ES info descriptors.
    pub descriptors: Vec<u8>,
}

impl PmtStream {
    /// Whether this stream is carried in sections rather than PES packets.
    pub fn carries_sections(&self) -> bool {
        matches!(
            self.stream_type,
            stream_type::PRIVATE_SECTIONS
                | stream_type::DSMCC_B
                | stream_type::DSMCC_C
                | stream_type::DSMCC_D
                | stream_type::SCTE35
        )
    }

    /// Get a human-readable stream type name.
    pub fn stream_type_name(&self) -> &'static str {
        match self.stream_type {
            stream_type::MPEG1_VIDEO => "MPEG-1 Video",
            stream_type::MPEG2_VIDEO => "MPEG-2 Video",
            stream_type::MPEG1_AUDIO => "MPEG-1 Audio",
            stream_type::MPEG2_AUDIO => "MPEG-2 Audio",
            stream_type::PRIVATE_SECTIONS => "Private Sections",
            stream_type::PES_PRIVATE_DATA => "PES Private Data",
            stream_type::DSMCC_A..=stream_type::DSMCC_D => "DSM-CC",
            stream_type::H264_VIDEO => "H.264/AVC Video",
            stream_type::H265_VIDEO => "H.265/HEVC Video",
            stream_type::AAC_AUDIO => "AAC Audio (ADTS)",
            stream_type::AAC_LATM => "AAC Audio (LATM)",
            stream_type::SCTE35 => "SCTE-35",
            _ => "Unknown",
        }
    }
}

/// Parsed PMT (Program Map Table).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PmtTable {
    /// Program number (service ID).
    pub program_number: u16,
    /// Version number.
    pub version_number: u8,
    /// PCR PID.
    pub pcr_pid: u16,
    /// Program info descriptors.
    pub program_info: Vec<u8>,
    /// Elementary streams.
    pub streams: Vec<PmtStream>,
}

fn pmt_stream(input: &[u8]) -> IResult<&[u8], PmtStream> {
    let (input, stream_type) = be_u8(input)?;
    let (input, pid) = be_u16(input)?;
    let (input, es_info_length) = be_u16(input)?;
    let (input, descriptors) = take((es_info_length & 0x0FFF) as usize)(input)?;
    Ok((
        input,
        PmtStream {
            stream_type,
            elementary_pid: pid & 0x1FFF,
            descriptors: descriptors.to_vec(),
        },
    ))
}

fn pmt_body(input: &[u8]) -> IResult<&[u8], (u16, &[u8], Vec<PmtStream>)> {
    let (input, pcr_pid) = be_u16(input)?;
    let (input, program_info_length) = be_u16(input)?;
    let (input, program_info) = take((program_info_length & 0x0FFF) as usize)(input)?;
    let (input, streams) = many0(pmt_stream)(input)?;
    Ok((input, (pcr_pid & 0x1FFF, program_info, streams)))
}

impl PmtTable {
    /// Parse a PMT from a verified section.
    pub fn parse(record: &TableRecord) -> Result<Self, DissectError> {
        if record.header.table_id != table_id::PMT {
            return Err(DissectError::Malformed("not a PMT section"));
        }

        let (_, (pcr_pid, program_info, streams)) =
            pmt_body(record.data()).map_err(|_| DissectError::Malformed("invalid PMT body"))?;

        Ok(PmtTable {
            program_number: record.header.table_id_extension,
            version_number: record.header.version_number,
            pcr_pid,
            program_info: program_info.to_vec(),
            streams,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ts_analyzer::packet::Pid;
    use crate::ts_analyzer::psi::build_section;

    #[test]
    fn test_parse_pmt() {
        let body = [
            0xE1, 0x00, // PCR PID 0x100
            0xF0, 0x00, // no program info
            0x1B, 0xE1, 0x00, 0xF0, 0x00, // H.264 on 0x100
            0x0F, 0xE1, 0x10, 0xF0, 0x02, 0x0A, 0x00, // AAC on 0x110, 2 bytes ES info
            0x86, 0xE1, 0x20, 0xF0, 0x00, // SCTE-35 on 0x120
        ];
        let raw = build_section(table_id::PMT, 0x0101, 2, 0, 0, &body);
        let record = TableRecord::new(Pid::new(0x1000).unwrap(), raw).unwrap();
        let pmt = PmtTable::parse(&record).unwrap();

        assert_eq!(pmt.program_number, 0x0101);
        assert_eq!(pmt.version_number, 2);
        assert_eq!(pmt.pcr_pid, 0x0100);
        assert_eq!(pmt.streams.len(), 3);
        assert_eq!(pmt.streams[1].elementary_pid, 0x0110);
        assert_eq!(pmt.streams[1].descriptors, vec![0x0A, 0x00]);
        assert!(!pmt.streams[0].carries_sections());
        assert!(pmt.streams[2].carries_sections());
        assert_eq!(pmt.streams[0].stream_type_name(), "H.264/AVC Video");
    }
}
