//! Frame length detection.

use std::io::{Read, Seek, SeekFrom};

use log::debug;

use super::packet::{FRAME_SIZES, SYNC_BYTE};
use crate::error::{DissectError, Result};

/// Default number of leading bytes searched for a first sync byte.
pub const DEFAULT_SYNC_WINDOW: usize = 5000;

/// Number of further sync bytes that must line up behind a candidate.
pub const SYNC_PROBES: usize = 5;

/// Result of frame synchronization.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SyncInfo {
    /// Fixed frame length for the whole source.
    pub frame_size: usize,
    /// Offset of the first verified sync byte.
    pub first_sync: usize,
}

/// Determine the frame length of a source.
///
/// The stream position is restored before returning, so repeated calls on
/// the same source give the same answer.
pub fn detect_frame_size<R: Read + Seek>(source: &mut R, window: usize) -> Result<SyncInfo> {
    let start = source.stream_position()?;
    source.seek(SeekFrom::Start(0))?;

    let max_frame = FRAME_SIZES[FRAME_SIZES.len() - 1];
    let wanted = (window + max_frame * SYNC_PROBES) as u64;
    let mut head = Vec::with_capacity(wanted as usize);
    let read = source.by_ref().take(wanted).read_to_end(&mut head);
    source.seek(SeekFrom::Start(start))?;
    read?;

    detect_in(&head, window).ok_or(DissectError::Format { window })
}

/// Determine the frame length from an in-memory prefix of the source.
pub fn detect_in(data: &[u8], window: usize) -> Option<SyncInfo> {
    FRAME_SIZES.iter().find_map(|&frame_size| {
        let first_sync = find_aligned(data, frame_size, window)?;
        debug!(
            "Frame size {} verified at offset {}",
            frame_size, first_sync
        );
        Some(SyncInfo {
            frame_size,
            first_sync,
        })
    })
}

fn find_aligned(data: &[u8], frame_size: usize, window: usize) -> Option<usize> {
    let limit = window.min(data.len());
    (0..limit).find(|&offset| {
        data[offset] == SYNC_BYTE
            && (1..=SYNC_PROBES).all(|k| data.get(offset + k * frame_size) == Some(&SYNC_BYTE))
    })
}
