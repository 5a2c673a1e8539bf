//! Command handlers.
//!
//! Every handler returns the process exit code.

pub(crate) mod inspect;
pub(crate) mod pes;
pub(crate) mod tables;

use std::fs::File;
use std::time::{Duration, Instant};

use indicatif::{ProgressBar, ProgressStyle};
use log::{error, info};

use tsdissect::ts_analyzer::sync::SyncInfo;
use tsdissect::ts_analyzer::ContentKind;
use tsdissect::{CancelToken, Demultiplexer, DemuxConfig, DissectError, Pid};

use crate::context::{OutputFormat, PassArgs};

/// Settings resolved from the configuration file and global flags.
#[derive(Debug, Clone)]
pub(crate) struct RunContext {
    pub demux: DemuxConfig,
    pub format: OutputFormat,
    pub cancel: CancelToken,
}

impl RunContext {
    /// Output format of a command, flag before configuration file.
    pub fn format(&self, flag: Option<OutputFormat>) -> OutputFormat {
        flag.unwrap_or(self.format)
    }
}

/// A finished full pass.
pub(crate) struct Session {
    pub demux: Demultiplexer,
    pub sync: SyncInfo,
    pub file: File,
    pub elapsed: Duration,
}

fn progress_bar(total: u64, hidden: bool) -> ProgressBar {
    if hidden {
        return ProgressBar::hidden();
    }
    let bar = ProgressBar::new(total);
    if let Ok(style) = ProgressStyle::with_template(
        "{spinner:.green} [{elapsed_precise}] [{wide_bar:.cyan/blue}] {bytes}/{total_bytes} ({eta})",
    ) {
        bar.set_style(style.progress_chars("#>-"));
    }
    bar
}

/// Open the source and run a full demultiplexing pass over it.
pub(crate) fn run_pass(pass: &PassArgs, ctx: &RunContext) -> Result<Session, DissectError> {
    let mut file = File::open(&pass.source)?;
    let total = file.metadata()?.len();

    let mut config = ctx.demux.clone();
    if let Some(window) = pass.sync_window {
        config.sync_window = window;
    }
    if pass.no_classify {
        config.auto_classify = false;
    }

    let (mut demux, sync) = Demultiplexer::open(&mut file, config)?;
    for &value in &pass.pes_pids {
        demux.bind(Pid::new(value)?, ContentKind::Packets);
    }
    for &value in &pass.section_pids {
        demux.bind(Pid::new(value)?, ContentKind::Sections);
    }
    demux.set_cancel_token(ctx.cancel.clone());

    let hidden = pass.quiet || ctx.format(pass.format) == OutputFormat::Json;
    let bar = progress_bar(total, hidden);
    let progress = bar.clone();
    demux.set_progress(move |offset| progress.set_position(offset));

    info!("Reading {}", pass.source.display());
    let started = Instant::now();
    let result = demux.run(&mut file, sync.first_sync as u64);
    match result {
        Ok(()) => bar.finish_and_clear(),
        Err(_) => bar.abandon(),
    }
    result?;

    Ok(Session {
        demux,
        sync,
        file,
        elapsed: started.elapsed(),
    })
}

/// Log a failed pass and map it to an exit code.
pub(crate) fn fail(err: DissectError) -> i32 {
    match err {
        DissectError::Cancelled { packets } => {
            error!("Interrupted after {} packets", packets);
            130
        }
        DissectError::Format { .. } => {
            error!("{}", err);
            2
        }
        err => {
            error!("{}", err);
            1
        }
    }
}

/// Print any serializable value as pretty JSON.
pub(crate) fn print_json<T: serde::Serialize>(value: &T) -> i32 {
    match serde_json::to_string_pretty(value) {
        Ok(json) => {
            println!("{}", json);
            0
        }
        Err(e) => {
            error!("Failed to serialize output: {}", e);
            1
        }
    }
}
