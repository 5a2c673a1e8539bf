//! `tables` command handler.

use colored::Colorize;
use serde::Serialize;

use tsdissect::ts_analyzer::{
    table_id, DecoderRegistry, SectionEntry, TableBody, TableRegistry, Timeline,
};

use super::{fail, print_json, run_pass, RunContext};
use crate::context::{OutputFormat, PassArgs};

/// One table set in the overview.
#[derive(Debug, Serialize)]
pub(crate) struct TableSummary {
    pub table_id: u8,
    pub name: &'static str,
    pub extension: u16,
    pub pid: u16,
    pub parts: usize,
    pub complete: bool,
    pub versions: usize,
    /// Occurrences of the latest version of each part.
    pub occurrences: u64,
    /// Average repeat distance of part 0's latest version.
    pub repetition_ms: Option<u64>,
}

/// Summarize every stored table, optionally filtered.
pub(crate) fn summarize(
    registry: &TableRegistry,
    timeline: &Timeline,
    only_id: Option<u8>,
    only_extension: Option<u16>,
) -> Vec<TableSummary> {
    registry
        .iter()
        .filter(|(key, _)| only_id.map_or(true, |id| key.table_id == id))
        .filter(|(key, _)| only_extension.map_or(true, |ext| key.extension == ext))
        .filter_map(|(key, set)| {
            let first = set.current().next()?;
            let repetition_ms = first
                .repetition_interval()
                .and_then(|packets| timeline.packets_to_millis(packets));
            Some(TableSummary {
                table_id: key.table_id,
                name: table_id::name(key.table_id),
                extension: key.extension,
                pid: first.record.pid.value(),
                parts: set.parts_total(),
                complete: set.is_complete(),
                versions: set.version_count(),
                occurrences: set.current().map(|e| e.occurrences as u64).sum(),
                repetition_ms,
            })
        })
        .collect()
}

pub(crate) fn print_summary(tables: &[TableSummary]) {
    if tables.is_empty() {
        println!("No tables found.");
        return;
    }

    println!(
        "{:<6} {:<13} {:<8} {:<8} {:>6} {:>9} {:>9} {:>10}",
        "Table", "Name", "Ext", "PID", "Parts", "Versions", "Seen", "Interval"
    );
    println!("{}", "-".repeat(76));

    for t in tables {
        let parts = if t.complete {
            t.parts.to_string().green()
        } else {
            t.parts.to_string().yellow()
        };
        println!(
            "{:<6} {:<13} {:<8} {:<8} {:>6} {:>9} {:>9} {:>10}",
            format!("0x{:02X}", t.table_id),
            t.name,
            format!("0x{:04X}", t.extension),
            format!("0x{:04X}", t.pid),
            parts,
            t.versions,
            t.occurrences,
            t.repetition_ms
                .map(|ms| format!("{}ms", ms))
                .unwrap_or_else(|| "-".to_string())
        );
    }

    println!("\nTotal: {} tables", tables.len());
}

#[derive(Serialize)]
struct VersionView {
    part: usize,
    version_number: u8,
    current_next: bool,
    length: usize,
    crc32: Option<u32>,
    occurrences: u32,
    first_packet: u64,
    last_packet: u64,
    body: Option<TableBody>,
    error: Option<String>,
}

#[derive(Serialize)]
struct TableView {
    #[serde(flatten)]
    summary: TableSummary,
    sections: Vec<VersionView>,
}

fn version_view(decoders: &DecoderRegistry, part: usize, entry: &SectionEntry) -> VersionView {
    let header = &entry.record.header;
    let (body, error) = match decoders.decode(&entry.record) {
        Ok(body) => (Some(body), None),
        Err(e) => (None, Some(e.to_string())),
    };
    VersionView {
        part,
        version_number: header.version_number,
        current_next: header.current_next_indicator,
        length: entry.record.raw.len(),
        crc32: entry.record.crc32(),
        occurrences: entry.occurrences,
        first_packet: entry.first_packet,
        last_packet: entry.last_packet,
        body,
        error,
    }
}

fn describe(body: &TableBody) -> String {
    match body {
        TableBody::Pat(pat) => {
            let programs: Vec<String> = pat
                .programs
                .iter()
                .map(|p| format!("{}->0x{:04X}", p.program_number, p.pid))
                .collect();
            format!("TSID 0x{:04X}, programs {}", pat.transport_stream_id, programs.join(" "))
        }
        TableBody::Pmt(pmt) => {
            let streams: Vec<String> = pmt
                .streams
                .iter()
                .map(|s| format!("0x{:04X} {}", s.elementary_pid, s.stream_type_name()))
                .collect();
            format!("PCR 0x{:04X}, {}", pmt.pcr_pid, streams.join(", "))
        }
        TableBody::Time(time) => time.utc_time.format("%Y-%m-%d %H:%M:%S UTC").to_string(),
        TableBody::Raw { length } => format!("{} bytes", length),
    }
}

/// Tables command implementation.
pub fn cmd_tables(
    pass: PassArgs,
    table_id: Option<u8>,
    extension: Option<u16>,
    history: bool,
    ctx: &RunContext,
) -> i32 {
    let session = match run_pass(&pass, ctx) {
        Ok(s) => s,
        Err(e) => return fail(e),
    };
    let registry = session.demux.registry();
    let timeline = session.demux.timeline();
    let decoders = DecoderRegistry::default();
    let summaries = summarize(registry, &timeline, table_id, extension);

    let views: Vec<TableView> = summaries
        .into_iter()
        .filter_map(|summary| {
            let set = registry.get(summary.table_id, summary.extension)?;
            let sections = (0..set.parts_total())
                .flat_map(|part| {
                    let chain = set.chain(part);
                    let shown = if history { chain } else { &chain[chain.len().saturating_sub(1)..] };
                    shown.iter().map(move |entry| (part, entry))
                })
                .map(|(part, entry)| version_view(&decoders, part, entry))
                .collect();
            Some(TableView { summary, sections })
        })
        .collect();

    match ctx.format(pass.format) {
        OutputFormat::Json => print_json(&views),
        OutputFormat::Table => {
            if views.is_empty() {
                println!("No tables found.");
                return 0;
            }
            for view in &views {
                let s = &view.summary;
                println!(
                    "{} {} ext 0x{:04X} on PID 0x{:04X}: {} parts, {} versions{}",
                    format!("0x{:02X}", s.table_id).cyan().bold(),
                    s.name,
                    s.extension,
                    s.pid,
                    s.parts,
                    s.versions,
                    if s.complete { "" } else { " (incomplete)" }
                );
                for v in &view.sections {
                    let detail = match (&v.body, &v.error) {
                        (Some(body), _) => describe(body),
                        (None, Some(err)) => err.red().to_string(),
                        (None, None) => String::new(),
                    };
                    println!(
                        "  part {:>3} v{:<2} {:>5} bytes  x{:<5} packets {}..{}  {}",
                        v.part,
                        v.version_number,
                        v.length,
                        v.occurrences,
                        v.first_packet,
                        v.last_packet,
                        detail
                    );
                }
            }
            println!("\nTotal: {} tables", views.len());
            0
        }
    }
}
