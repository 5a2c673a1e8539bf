//! Mapping from packet index to time.
//!
//! The transport bitrate comes from PCR samples when any channel carries
//! them, otherwise from the distance between two wall-clock time records.
//! A wall-clock record then anchors packet index 0 in absolute time.

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;

/// A wall-clock time seen at a packet index (TDT/TOT).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct TimeRecord {
    pub packet_index: u64,
    pub utc_time: DateTime<Utc>,
}

/// Where the bitrate estimate came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BitrateSource {
    /// Average over channels carrying PCR.
    Pcr { channels: usize },
    /// Derived from two time records.
    WallClock,
    Unknown,
}

/// Time of one packet, as precise as the stream allows.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PacketTime {
    WallClock(DateTime<Utc>),
    /// Offset from the first packet.
    Relative(Duration),
    /// Neither bitrate nor wall clock known.
    Index(u64),
}

/// Bitrate and anchor of one capture.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Timeline {
    pub frame_size: usize,
    /// Bits per second.
    pub bitrate: Option<u64>,
    pub source: BitrateSource,
    /// Wall-clock time of packet index 0.
    pub anchor: Option<DateTime<Utc>>,
}

pub struct TimingModel;

impl TimingModel {
    /// Estimate the timeline of a pass.
    ///
    /// `pcr_bitrates` holds one estimate per channel that carried PCR.
    pub fn estimate<I>(pcr_bitrates: I, records: &[TimeRecord], frame_size: usize) -> Timeline
    where
        I: IntoIterator<Item = u64>,
    {
        let rates: Vec<u64> = pcr_bitrates.into_iter().filter(|&r| r > 0).collect();
        let (bitrate, source) = if !rates.is_empty() {
            let sum: u128 = rates.iter().map(|&r| r as u128).sum();
            let average = (sum / rates.len() as u128) as u64;
            (Some(average), BitrateSource::Pcr { channels: rates.len() })
        } else {
            match Self::wall_clock_bitrate(records, frame_size) {
                Some(rate) => (Some(rate), BitrateSource::WallClock),
                None => (None, BitrateSource::Unknown),
            }
        };

        let anchor = match (bitrate, records.first()) {
            (Some(rate), Some(first)) => {
                let offset = packets_to_millis(first.packet_index, frame_size, rate);
                Some(first.utc_time - Duration::milliseconds(offset as i64))
            }
            _ => None,
        };

        Timeline {
            frame_size,
            bitrate,
            source,
            anchor,
        }
    }

    /// Bitrate from the first and last time record.
    ///
    /// None when fewer than two distinct records exist or time did not
    /// advance.
    pub fn wall_clock_bitrate(records: &[TimeRecord], frame_size: usize) -> Option<u64> {
        let (first, last) = (records.first()?, records.last()?);
        let millis = (last.utc_time - first.utc_time).num_milliseconds();
        let packets = last.packet_index.checked_sub(first.packet_index)?;
        if millis <= 0 || packets == 0 {
            return None;
        }
        let bits = packets as u128 * frame_size as u128 * 8 * 1000;
        Some((bits / millis as u128) as u64)
    }
}

fn packets_to_millis(packets: u64, frame_size: usize, bitrate: u64) -> u64 {
    (packets as u128 * frame_size as u128 * 8 * 1000 / bitrate as u128) as u64
}

impl Timeline {
    /// Milliseconds spanned by `packets` frames.
    pub fn packets_to_millis(&self, packets: u64) -> Option<u64> {
        self.bitrate
            .filter(|&rate| rate > 0)
            .map(|rate| packets_to_millis(packets, self.frame_size, rate))
    }

    /// Time of the packet at `index`.
    pub fn packet_time(&self, index: u64) -> PacketTime {
        match self.packets_to_millis(index) {
            Some(ms) => {
                let offset = Duration::milliseconds(ms as i64);
                match self.anchor {
                    Some(anchor) => PacketTime::WallClock(anchor + offset),
                    None => PacketTime::Relative(offset),
                }
            }
            None => PacketTime::Index(index),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(packet_index: u64, secs: i64) -> TimeRecord {
        TimeRecord {
            packet_index,
            utc_time: Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap(),
        }
    }

    #[test]
    fn test_wall_clock_fallback() {
        let records = [at(1000, 0), at(11000, 10)];
        let timeline = TimingModel::estimate(std::iter::empty(), &records, 188);
        assert_eq!(timeline.bitrate, Some(1_504_000));
        assert_eq!(timeline.source, BitrateSource::WallClock);

        // 1000 packets before the first record took 1 s
        let anchor = timeline.anchor.unwrap();
        assert_eq!(anchor, Utc.timestamp_opt(1_700_000_000 - 1, 0).unwrap());
        assert_eq!(timeline.packet_time(1000), PacketTime::WallClock(records[0].utc_time));
    }

    #[test]
    fn test_pcr_average_wins() {
        let records = [at(0, 0), at(10, 10)];
        let timeline = TimingModel::estimate([10_000_000, 20_000_000], &records, 188);
        assert_eq!(timeline.bitrate, Some(15_000_000));
        assert_eq!(timeline.source, BitrateSource::Pcr { channels: 2 });
        assert_eq!(timeline.anchor, Some(records[0].utc_time));
    }

    #[test]
    fn test_identical_records_give_no_bitrate() {
        let records = [at(0, 5), at(500, 5)];
        let timeline = TimingModel::estimate(std::iter::empty(), &records, 188);
        assert_eq!(timeline.bitrate, None);
        assert_eq!(timeline.anchor, None);
        assert_eq!(timeline.packet_time(42), PacketTime::Index(42));
    }

    #[test]
    fn test_relative_time_without_records() {
        let timeline = TimingModel::estimate([1_504_000], &[], 188);
        assert_eq!(timeline.packets_to_millis(1000), Some(1000));
        assert_eq!(
            timeline.packet_time(1000),
            PacketTime::Relative(Duration::milliseconds(1000))
        );
    }
}
