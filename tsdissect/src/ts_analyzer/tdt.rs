//! TDT / TOT (Time and Date / Time Offset Table) parsing.
//!
//! Both tables are carried on PID 0x0014 and hold the current UTC time as a
//! 16-bit Modified Julian Date followed by six BCD digits.

use chrono::{DateTime, Days, NaiveDate, TimeZone, Utc};
use nom::bytes::complete::take;
use nom::number::complete::be_u16;
use nom::IResult;
use serde::Serialize;

use super::psi::TableRecord;
use super::table_id;
use crate::error::DissectError;

/// Parsed TDT or TOT.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TimeTable {
    pub table_id: u8,
    pub utc_time: DateTime<Utc>,
    /// TOT descriptor loop (raw); empty for TDT.
    pub descriptors: Vec<u8>,
}

/// Decode the 40-bit MJD + BCD time field.
pub fn decode_utc_time(data: &[u8]) -> Option<DateTime<Utc>> {
    if data.len() < 5 {
        return None;
    }
    let mjd = u16::from_be_bytes([data[0], data[1]]);
    let hour = bcd(data[2])?;
    let minute = bcd(data[3])?;
    let second = bcd(data[4])?;

    // MJD 0 is 1858-11-17.
    let date = NaiveDate::from_ymd_opt(1858, 11, 17)?.checked_add_days(Days::new(mjd as u64))?;
    let naive = date.and_hms_opt(hour, minute, second)?;
    Some(Utc.from_utc_datetime(&naive))
}

fn bcd(byte: u8) -> Option<u32> {
    let (hi, lo) = (byte >> 4, byte & 0x0F);
    if hi > 9 || lo > 9 {
        return None;
    }
    Some(hi as u32 * 10 + lo as u32)
}

fn tot_body(input: &[u8]) -> IResult<&[u8], (&[u8], &[u8])> {
    let (input, utc) = take(5usize)(input)?;
    let (input, loop_length) = be_u16(input)?;
    let (input, descriptors) = take((loop_length & 0x0FFF) as usize)(input)?;
    Ok((input, (utc, descriptors)))
}

impl TimeTable {
    /// Parse a TDT or TOT from a verified section.
    pub fn parse(record: &TableRecord) -> Result<Self, DissectError> {
        let id = record.header.table_id;
        let (utc, descriptors) = match id {
            table_id::TDT => (record.data(), &[][..]),
            table_id::TOT => {
                let (_, parts) =
                    tot_body(record.data()).map_err(|_| DissectError::Malformed("invalid TOT body"))?;
                parts
            }
            _ => return Err(DissectError::Malformed("not a TDT/TOT section")),
        };
        let utc_time =
            decode_utc_time(utc).ok_or(DissectError::Malformed("invalid UTC time field"))?;

        Ok(TimeTable {
            table_id: id,
            utc_time,
            descriptors: descriptors.to_vec(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ts_analyzer::packet::Pid;
    use crate::ts_analyzer::psi::crc32_mpeg2;
    use chrono::Timelike;

    #[test]
    fn test_decode_utc_time() {
        // 1993-10-13 12:45:00 (the ETSI EN 300 468 example, MJD 0xC079)
        let time = decode_utc_time(&[0xC0, 0x79, 0x12, 0x45, 0x00]).unwrap();
        assert_eq!(time.to_rfc3339(), "1993-10-13T12:45:00+00:00");
    }

    #[test]
    fn test_invalid_bcd() {
        assert!(decode_utc_time(&[0xC0, 0x79, 0x1A, 0x00, 0x00]).is_none());
        assert!(decode_utc_time(&[0xC0, 0x79, 0x25, 0x00, 0x00]).is_none());
    }

    #[test]
    fn test_parse_tdt() {
        let raw = vec![0x70, 0x70, 0x05, 0xC0, 0x79, 0x12, 0x45, 0x30];
        let record = TableRecord::new(Pid::new(0x14).unwrap(), raw).unwrap();
        let tdt = TimeTable::parse(&record).unwrap();
        assert_eq!(tdt.utc_time.second(), 30);
        assert!(tdt.descriptors.is_empty());
    }

    #[test]
    fn test_parse_tot() {
        let mut raw = vec![0x73, 0x70, 0x00, 0xC0, 0x79, 0x12, 0x45, 0x00, 0xF0, 0x02, 0x58, 0x00];
        raw[2] = (raw.len() - 3 + 4) as u8;
        let crc = crc32_mpeg2(&raw);
        raw.extend_from_slice(&crc.to_be_bytes());
        let record = TableRecord::new(Pid::new(0x14).unwrap(), raw).unwrap();
        assert_eq!(record.crc_residue(), 0);

        let tot = TimeTable::parse(&record).unwrap();
        assert_eq!(tot.table_id, table_id::TOT);
        assert_eq!(tot.descriptors, vec![0x58, 0x00]);
    }
}
