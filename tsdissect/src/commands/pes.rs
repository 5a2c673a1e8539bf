//! `pes` command handler.

use std::cell::RefCell;

use log::{error, info};
use serde::Serialize;

use tsdissect::ts_analyzer::{ElementaryPacket, Replay, Timeline};
use tsdissect::Pid;

use super::inspect::{format_time, stream_label};
use super::{fail, print_json, run_pass, RunContext};
use crate::context::{OutputFormat, PassArgs};

#[derive(Serialize)]
struct PesRow {
    pid: u16,
    stream_id: u8,
    length: usize,
    payload_length: usize,
    declared_length: u16,
    complete: bool,
    pts: Option<u64>,
    dts: Option<u64>,
    first_packet: u64,
    time: String,
}

impl PesRow {
    fn new(packet: &ElementaryPacket, timeline: &Timeline) -> Self {
        PesRow {
            pid: packet.pid.value(),
            stream_id: packet.stream_id,
            length: packet.data.len(),
            payload_length: packet.payload().len(),
            declared_length: packet.declared_length,
            complete: packet.complete,
            pts: packet.pts().map(|t| t.0),
            dts: packet.dts().map(|t| t.0),
            first_packet: packet.first_packet,
            time: format_time(timeline.packet_time(packet.first_packet)),
        }
    }
}

/// PES command implementation.
pub fn cmd_pes(pass: PassArgs, pids: Vec<u16>, limit: Option<u64>, ctx: &RunContext) -> i32 {
    let mut selected = Vec::with_capacity(pids.len());
    for value in pids {
        match Pid::new(value) {
            Ok(pid) => selected.push(pid),
            Err(e) => {
                error!("{}", e);
                return 1;
            }
        }
    }

    let mut session = match run_pass(&pass, ctx) {
        Ok(s) => s,
        Err(e) => return fail(e),
    };
    let timeline = session.demux.timeline();
    let rows = RefCell::new(Vec::new());

    let mut replay = Replay::new(session.demux.index())
        .unbounded_capacity(session.demux.config().unbounded_capacity)
        .cancel_token(ctx.cancel.clone());
    for &pid in &selected {
        let (rows, timeline) = (&rows, &timeline);
        replay = replay.handler(pid, move |packet: &ElementaryPacket| {
            rows.borrow_mut().push(PesRow::new(packet, timeline));
        });
    }
    if let Some(limit) = limit {
        replay = replay.limit(limit);
    }

    let stats = match replay.run(&mut session.file) {
        Ok(stats) => stats,
        Err(e) => return fail(e),
    };
    info!(
        "Replayed {} frames ({} seeks), {} packets",
        stats.frames_read, stats.seeks, stats.packets_delivered
    );

    let rows = rows.into_inner();
    match ctx.format(pass.format) {
        OutputFormat::Json => print_json(&rows),
        OutputFormat::Table => {
            if rows.is_empty() {
                println!("No PES packets found on the selected PIDs.");
                return 0;
            }
            println!(
                "{:<8} {:<26} {:>8} {:>8} {:>12} {:>12} {:<9} {}",
                "PID", "Stream", "Length", "Payload", "PTS", "DTS", "Complete", "Time"
            );
            println!("{}", "-".repeat(110));
            for row in &rows {
                println!(
                    "{:<8} {:<26} {:>8} {:>8} {:>12} {:>12} {:<9} {}",
                    format!("0x{:04X}", row.pid),
                    stream_label(row.stream_id),
                    row.length,
                    row.payload_length,
                    row.pts.map(|t| t.to_string()).unwrap_or_else(|| "-".into()),
                    row.dts.map(|t| t.to_string()).unwrap_or_else(|| "-".into()),
                    if row.complete { "yes" } else { "no" },
                    row.time
                );
            }
            println!("\nTotal: {} packets", rows.len());
            0
        }
    }
}
