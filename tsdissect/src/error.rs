//! Error types for transport stream dissection.

use thiserror::Error;

/// Errors raised while opening or demultiplexing a transport stream.
///
/// Only [`DissectError::Format`], [`DissectError::Io`] and
/// [`DissectError::Cancelled`] abort a pass. Integrity and truncation
/// errors are reported per record and the pass carries on.
#[derive(Error, Debug)]
pub enum DissectError {
    /// No candidate frame length could be verified.
    #[error("Not a transport stream: no frame length verified within the first {window} bytes")]
    Format { window: usize },

    /// CRC32 over a completed section did not verify.
    #[error("CRC32 mismatch on PID 0x{pid:04X}: table_id=0x{table_id:02X}, extension=0x{extension:04X} (residue 0x{residue:08X})")]
    Integrity {
        pid: u16,
        table_id: u8,
        extension: u16,
        residue: u32,
    },

    /// A section or packet ended before its declared length.
    #[error("Truncated {what} on PID 0x{pid:04X}: expected {expected} bytes, got {actual}")]
    Truncated {
        what: &'static str,
        pid: u16,
        expected: usize,
        actual: usize,
    },

    /// A PID outside the 13-bit range.
    #[error("Invalid PID: 0x{0:04X}")]
    InvalidPid(u16),

    /// A record whose fixed header could not be read.
    #[error("Malformed record: {0}")]
    Malformed(&'static str),

    /// The caller interrupted the pass.
    #[error("Cancelled after {packets} packets")]
    Cancelled { packets: u64 },

    /// Configuration file could not be used.
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, DissectError>;

impl DissectError {
    /// Returns true if this error aborts the whole pass.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            DissectError::Format { .. } | DissectError::Cancelled { .. } | DissectError::Io(_)
        )
    }
}

impl From<toml::de::Error> for DissectError {
    fn from(value: toml::de::Error) -> Self {
        DissectError::Config(value.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_only_pass_level_errors_are_fatal() {
        assert!(DissectError::Format { window: 5000 }.is_fatal());
        assert!(DissectError::Cancelled { packets: 3 }.is_fatal());
        assert!(DissectError::from(std::io::Error::new(std::io::ErrorKind::Other, "disk")).is_fatal());
        assert!(!DissectError::Integrity {
            pid: 0x10,
            table_id: 0x40,
            extension: 1,
            residue: 0xDEAD,
        }
        .is_fatal());
        assert!(!DissectError::Malformed("short").is_fatal());
    }
}
