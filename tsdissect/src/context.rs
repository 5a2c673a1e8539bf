use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};
use clap_num::maybe_hex;

#[derive(Debug, Parser)]
#[clap(name = "tsdissect")]
#[clap(about = "tsdissect splits recorded MPEG-2 transport streams into tables, PES packets and timing data.", long_about = None)]
#[clap(version)]
pub(crate) struct Cli {
    #[clap(subcommand)]
    pub command: Commands,

    /// Configuration file path.{n}
    /// If not specified, `tsdissect.toml` in the working directory
    /// is used when it exists.
    #[clap(short = 'f', long, global = true, value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Enable verbose logging.
    #[clap(short, long, global = true)]
    pub verbose: bool,
}

/// Output format for reports.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, clap::ValueEnum)]
pub(crate) enum OutputFormat {
    /// Human-readable table format
    #[default]
    Table,
    /// JSON format
    Json,
}

impl OutputFormat {
    /// Parse the `[output] format` value of a configuration file.
    pub fn from_config(value: &str) -> Option<Self> {
        match value.to_ascii_lowercase().as_str() {
            "table" => Some(OutputFormat::Table),
            "json" => Some(OutputFormat::Json),
            _ => None,
        }
    }
}

/// Options shared by every subcommand that runs a full pass.
#[derive(Debug, Args)]
pub(crate) struct PassArgs {
    /// The source file name.
    #[clap(short = 'i', long = "input", value_name = "file", required = true)]
    pub source: PathBuf,

    /// Output format.{n}
    /// Overrides `[output] format` of the configuration file.
    #[clap(value_enum, long)]
    pub format: Option<OutputFormat>,

    /// Bytes searched for the first sync byte.
    #[clap(long, value_name = "BYTES")]
    pub sync_window: Option<usize>,

    /// Disable classification of unlisted PIDs by their first payload.{n}
    /// PIDs are then only bound by PAT/PMT or the options below.
    #[clap(long = "no-classify")]
    pub no_classify: bool,

    /// Reassemble PES packets on this PID (hex with 0x or decimal).
    #[clap(long = "pes-pid", value_name = "PID", value_parser = maybe_hex::<u16>)]
    pub pes_pids: Vec<u16>,

    /// Reassemble sections on this PID (hex with 0x or decimal).
    #[clap(long = "section-pid", value_name = "PID", value_parser = maybe_hex::<u16>)]
    pub section_pids: Vec<u16>,

    /// Hide the progress bar.
    #[clap(short, long)]
    pub quiet: bool,
}

#[derive(Debug, Subcommand)]
pub(crate) enum Commands {
    /// Detect the frame length.{n}
    /// This subcommand probes the start of the source for 188, 192,
    /// 204 and 208-byte frames and prints the first aligned offset.
    #[clap(name = "sync")]
    Sync {
        /// The source file name.
        #[clap(short = 'i', long = "input", value_name = "file", required = true)]
        source: PathBuf,

        /// Bytes searched for the first sync byte.
        #[clap(long, value_name = "BYTES")]
        sync_window: Option<usize>,
    },

    /// Demultiplex a capture and print per-PID statistics.{n}
    /// Prints frame length, sync and continuity errors, the PID table,
    /// stored tables and the estimated bitrate and wall-clock span.
    #[clap(name = "inspect")]
    Inspect {
        #[clap(flatten)]
        pass: PassArgs,
    },

    /// List stored PSI/SI tables with their version history.
    #[clap(name = "tables")]
    Tables {
        #[clap(flatten)]
        pass: PassArgs,

        /// Show only this table id (hex with 0x or decimal).
        #[clap(long, value_parser = maybe_hex::<u8>)]
        table_id: Option<u8>,

        /// Show only this table id extension (hex with 0x or decimal).
        #[clap(long, value_parser = maybe_hex::<u16>)]
        extension: Option<u16>,

        /// Show every stored version instead of the latest of each part.
        #[clap(long)]
        history: bool,
    },

    /// Re-read the PES packets of selected PIDs.{n}
    /// A full pass builds the packet index first; the selected PIDs are
    /// then read again by seeking straight to their frames.
    #[clap(name = "pes")]
    Pes {
        #[clap(flatten)]
        pass: PassArgs,

        /// PID to replay (hex with 0x or decimal). May be repeated.
        #[clap(short, long = "pid", value_name = "PID", required = true, value_parser = maybe_hex::<u16>)]
        pids: Vec<u16>,

        /// Stop after this many packets.
        #[clap(short = 'n', long)]
        limit: Option<u64>,
    },
}
