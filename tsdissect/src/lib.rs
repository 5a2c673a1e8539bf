//! tsdissect library - MPEG-2 transport stream demultiplexing
//!
//! This library splits recorded transport streams into per-PID channels and
//! reassembles PSI/SI sections and PES packets, keeping every version of
//! every table and a packet index for later random access.

pub mod config;
pub mod error;
pub mod ts_analyzer;

// Re-export commonly used types
pub use config::DissectConfig;
pub use error::{DissectError, Result};
pub use ts_analyzer::{CancelToken, Demultiplexer, DemuxConfig, DemuxReport, Pid};
