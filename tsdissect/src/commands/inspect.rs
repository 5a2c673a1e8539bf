//! `sync` and `inspect` command handlers.

use std::fs::File;
use std::path::PathBuf;

use colored::Colorize;
use log::error;
use serde::Serialize;

use tsdissect::ts_analyzer::pes::stream_id;
use tsdissect::ts_analyzer::{detect_frame_size, ChannelState, ContentKind, PacketTime, Timeline};
use tsdissect::DemuxReport;

use super::tables::{summarize, TableSummary};
use super::{fail, print_json, run_pass, RunContext};
use crate::context::{OutputFormat, PassArgs};

#[derive(Serialize)]
struct SyncOutput {
    source: String,
    frame_size: usize,
    first_sync: usize,
    frames: u64,
}

/// Sync command implementation.
pub fn cmd_sync(source: PathBuf, sync_window: Option<usize>, ctx: &RunContext) -> i32 {
    let mut file = match File::open(&source) {
        Ok(f) => f,
        Err(e) => {
            error!("Failed to open {}: {}", source.display(), e);
            return 1;
        }
    };
    let size = file.metadata().map(|m| m.len()).unwrap_or(0);
    let window = sync_window.unwrap_or(ctx.demux.sync_window);
    let sync = match detect_frame_size(&mut file, window) {
        Ok(sync) => sync,
        Err(e) => return fail(e),
    };

    let output = SyncOutput {
        source: source.display().to_string(),
        frame_size: sync.frame_size,
        first_sync: sync.first_sync,
        frames: size.saturating_sub(sync.first_sync as u64) / sync.frame_size as u64,
    };
    match ctx.format {
        OutputFormat::Json => print_json(&output),
        OutputFormat::Table => {
            println!("Source:       {}", output.source);
            println!("Frame size:   {} bytes", output.frame_size.to_string().green());
            println!("First sync:   offset {}", output.first_sync);
            println!("Frames:       {}", output.frames);
            0
        }
    }
}

#[derive(Serialize)]
struct InspectOutput<'a> {
    source: String,
    first_sync: usize,
    elapsed_ms: u128,
    report: &'a DemuxReport,
    timeline: &'a Timeline,
    channels: Vec<&'a ChannelState>,
    tables: Vec<TableSummary>,
}

/// Inspect command implementation.
pub fn cmd_inspect(pass: PassArgs, ctx: &RunContext) -> i32 {
    let session = match run_pass(&pass, ctx) {
        Ok(s) => s,
        Err(e) => return fail(e),
    };
    let demux = &session.demux;
    let report = demux.report();
    let timeline = demux.timeline();
    let tables = summarize(demux.registry(), &timeline, None, None);

    match ctx.format(pass.format) {
        OutputFormat::Json => print_json(&InspectOutput {
            source: pass.source.display().to_string(),
            first_sync: session.sync.first_sync,
            elapsed_ms: session.elapsed.as_millis(),
            report: &report,
            timeline: &timeline,
            channels: demux.channels().iter().collect(),
            tables,
        }),
        OutputFormat::Table => {
            println!("{}", "Transport Stream:".cyan().bold());
            println!("  Source:        {}", pass.source.display());
            println!(
                "  Frame size:    {} bytes (first sync at offset {})",
                report.frame_size, session.sync.first_sync
            );
            println!(
                "  Packets:       {} on {} PIDs ({:.2}s)",
                report.packets,
                report.pids,
                session.elapsed.as_secs_f64()
            );
            print_timeline(&timeline, report.packets);
            println!();
            print_errors(&report);
            println!();
            print_channels(demux.channels().iter(), report.frame_size);
            println!();
            super::tables::print_summary(&tables);
            0
        }
    }
}

/// Human-readable form of a packet time.
pub(crate) fn format_time(time: PacketTime) -> String {
    match time {
        PacketTime::WallClock(t) => t.format("%Y-%m-%d %H:%M:%S%.3f UTC").to_string(),
        PacketTime::Relative(d) => {
            let ms = d.num_milliseconds();
            format!("+{}.{:03}s", ms / 1000, ms % 1000)
        }
        PacketTime::Index(i) => format!("packet #{}", i),
    }
}

fn print_timeline(timeline: &Timeline, packets: u64) {
    match timeline.bitrate {
        Some(rate) => println!(
            "  Bitrate:       {:.3} Mbit/s ({:?})",
            rate as f64 / 1_000_000.0,
            timeline.source
        ),
        None => println!("  Bitrate:       {}", "unknown".yellow()),
    }
    if packets > 0 {
        println!("  Start:         {}", format_time(timeline.packet_time(0)));
        println!("  End:           {}", format_time(timeline.packet_time(packets - 1)));
    }
}

fn count(value: u64) -> String {
    if value == 0 {
        value.to_string().green().to_string()
    } else {
        value.to_string().red().to_string()
    }
}

fn print_errors(report: &DemuxReport) {
    println!("{}", "Errors:".cyan().bold());
    println!(
        "  Sync losses:         {} ({} bytes skipped, {} trailing)",
        count(report.sync_errors),
        report.bytes_skipped,
        report.trailing_bytes
    );
    println!("  Continuity errors:   {}", count(report.continuity_errors));
    println!("  Duplicate packets:   {}", report.duplicates);
    println!("  Transport errors:    {}", count(report.transport_errors));
    println!(
        "  Sections:            {} stored, {} CRC errors, {} truncated, {} malformed",
        report.sections.accepted,
        count(report.sections.integrity_errors),
        count(report.sections.truncated),
        count(report.sections.malformed)
    );
    println!(
        "  PES packets:         {} complete, {} incomplete, {} invalid starts",
        report.pes.completed,
        count(report.pes.incomplete),
        report.pes.invalid_start
    );
    println!("  Undecodable tables:  {}", count(report.decode_errors));

    for diag in &report.diagnostics {
        println!("    {} {}", format!("#{}", diag.packet_index).yellow(), diag.message);
    }
    if report.diagnostics_dropped > 0 {
        println!("    ... and {} more", report.diagnostics_dropped);
    }
}

fn kind_label(kind: ContentKind) -> &'static str {
    match kind {
        ContentKind::Unclassified => "-",
        ContentKind::Sections => "sections",
        ContentKind::Packets => "pes",
        ContentKind::Ignored => "ignored",
    }
}

fn print_channels<'a>(channels: impl Iterator<Item = &'a ChannelState>, frame_size: usize) {
    println!(
        "{:<8} {:<9} {:>10} {:>7} {:>5} {:>7} {:>12} {:>7} {:<10}",
        "PID", "Kind", "Packets", "CC err", "Dup", "PCRs", "Bitrate", "PES", "PTS span"
    );
    println!("{}", "-".repeat(84));

    for ch in channels {
        let bitrate = ch
            .bitrate(frame_size)
            .map(|r| format!("{:.3}M", r as f64 / 1_000_000.0))
            .unwrap_or_else(|| "-".to_string());
        let pts_span = match (ch.first_pts, ch.last_pts) {
            (Some(first), Some(last)) if last >= first => {
                format!("{:.3}s", (last.0 - first.0) as f64 / 90_000.0)
            }
            _ => "-".to_string(),
        };
        println!(
            "{:<8} {:<9} {:>10} {:>7} {:>5} {:>7} {:>12} {:>7} {:<10}",
            ch.pid.to_string(),
            kind_label(ch.kind),
            ch.packets,
            ch.continuity_errors,
            ch.duplicates,
            ch.pcr_count,
            bitrate,
            ch.pes_packets,
            pts_span
        );
    }
}

/// Short description of a PES stream id.
pub(crate) fn stream_label(id: u8) -> String {
    format!("0x{:02X} {}", id, stream_id::name(id))
}
