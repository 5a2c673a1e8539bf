//! MPEG-TS demultiplexing and record reassembly.
//!
//! A pass over a capture goes through these stages:
//! - [`sync`] finds the frame length (188, 192, 204 or 208 bytes)
//! - [`demux`] walks the frames, tracks per-PID state in [`channel`] and
//!   routes payload to [`psi`] (sections) or [`pes`] (PES packets)
//! - [`registry`] keeps every verified section in per-part version chains
//! - [`timing`] maps packet indices to wall-clock time
//! - [`replay`] re-reads selected PIDs from a finished [`demux::PacketIndex`]
//!
//! # Usage
//! ```ignore
//! use tsdissect::ts_analyzer::{Demultiplexer, DemuxConfig};
//!
//! let mut file = std::fs::File::open("capture.ts")?;
//! let (mut demux, sync) = Demultiplexer::open(&mut file, DemuxConfig::default())?;
//! demux.run(&mut file, sync.first_sync as u64)?;
//! for (key, set) in demux.registry().iter() {
//!     println!("{:02X}/{:04X}: {} versions", key.table_id, key.extension, set.version_count());
//! }
//! ```

pub mod channel;
pub mod demux;
pub mod packet;
pub mod pat;
pub mod pes;
pub mod pmt;
pub mod psi;
pub mod registry;
pub mod replay;
pub mod sync;
pub mod tables;
pub mod tdt;
pub mod timing;

pub use channel::{ChannelState, ChannelTable, ContentKind, Continuity};
pub use demux::{CancelToken, Demultiplexer, DemuxConfig, DemuxReport, IndexEntry, PacketIndex};
pub use packet::{ClockReference, Pid, TsHeader, TsPacket, FRAME_SIZES, SYNC_BYTE, TS_PACKET_SIZE};
pub use pat::{PatEntry, PatTable};
pub use pes::{ElementaryPacket, GrowableBuffer, PacketAssembler, PesHandler, PesTimestamp};
pub use pmt::{PmtStream, PmtTable};
pub use psi::{PsiHeader, SectionAssembler, TableRecord};
pub use registry::{Insertion, SectionEntry, SectionOutcome, TableKey, TableRegistry, TableSet};
pub use replay::{Replay, ReplayStats};
pub use sync::{detect_frame_size, SyncInfo};
pub use tables::{DecoderRegistry, TableBody};
pub use tdt::TimeTable;
pub use timing::{BitrateSource, PacketTime, TimeRecord, Timeline, TimingModel};

/// Well-known PIDs in MPEG-TS.
pub mod pid {
    /// Program Association Table PID.
    pub const PAT: u16 = 0x0000;
    /// Conditional Access Table PID.
    pub const CAT: u16 = 0x0001;
    /// Transport Stream Description Table PID.
    pub const TSDT: u16 = 0x0002;
    /// Network Information Table PID.
    pub const NIT: u16 = 0x0010;
    /// Service Description / Bouquet Association Table PID.
    pub const SDT: u16 = 0x0011;
    /// Event Information Table PID.
    pub const EIT: u16 = 0x0012;
    /// Running Status Table PID.
    pub const RST: u16 = 0x0013;
    /// Time and Date / Time Offset Table PID.
    pub const TDT: u16 = 0x0014;
    /// Null packet PID (stuffing).
    pub const NULL: u16 = 0x1FFF;

    /// PIDs that always carry sections.
    pub const SECTION_PIDS: [u16; 8] = [PAT, CAT, TSDT, NIT, SDT, EIT, RST, TDT];
}

/// Table IDs for PSI/SI tables.
pub mod table_id {
    /// Program Association Section.
    pub const PAT: u8 = 0x00;
    /// Conditional Access Section.
    pub const CAT: u8 = 0x01;
    /// Program Map Section.
    pub const PMT: u8 = 0x02;
    /// Transport Stream Description Section.
    pub const TSDT: u8 = 0x03;
    /// Network Information Section - actual.
    pub const NIT_ACTUAL: u8 = 0x40;
    /// Network Information Section - other.
    pub const NIT_OTHER: u8 = 0x41;
    /// Service Description Section - actual.
    pub const SDT_ACTUAL: u8 = 0x42;
    /// Service Description Section - other.
    pub const SDT_OTHER: u8 = 0x46;
    /// Bouquet Association Section.
    pub const BAT: u8 = 0x4A;
    /// Event Information Section - actual, present/following.
    pub const EIT_PF_ACTUAL: u8 = 0x4E;
    /// Event Information Section - other, present/following.
    pub const EIT_PF_OTHER: u8 = 0x4F;
    /// Time and Date Section.
    pub const TDT: u8 = 0x70;
    /// Running Status Section.
    pub const RST: u8 = 0x71;
    /// Time Offset Section.
    pub const TOT: u8 = 0x73;

    /// Short name of a table id.
    pub fn name(id: u8) -> &'static str {
        match id {
            PAT => "PAT",
            CAT => "CAT",
            PMT => "PMT",
            TSDT => "TSDT",
            NIT_ACTUAL | NIT_OTHER => "NIT",
            SDT_ACTUAL | SDT_OTHER => "SDT",
            BAT => "BAT",
            EIT_PF_ACTUAL | EIT_PF_OTHER => "EIT p/f",
            0x50..=0x6F => "EIT schedule",
            TDT => "TDT",
            RST => "RST",
            TOT => "TOT",
            0x80..=0xFE => "private",
            _ => "reserved",
        }
    }
}
