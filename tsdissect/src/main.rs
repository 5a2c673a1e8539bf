use clap::Parser;
use env_logger::Env;
use log::{debug, error, warn};

use tsdissect::{CancelToken, DissectConfig};

use crate::commands::RunContext;
use crate::context::{Cli, Commands, OutputFormat};

mod commands;
mod context;

fn main() {
    let arg = Cli::parse();

    let config_path = DissectConfig::locate(arg.config.as_deref());
    let (config, config_error) = match config_path.as_deref().map(DissectConfig::load) {
        Some(Ok(config)) => (config, None),
        Some(Err(e)) => (DissectConfig::default(), Some(e)),
        None => (DissectConfig::default(), None),
    };

    let level = if arg.verbose {
        "debug".to_string()
    } else {
        config
            .logging
            .level
            .clone()
            .unwrap_or_else(|| "info".to_string())
    };
    env_logger::Builder::from_env(Env::default().default_filter_or(level)).init();

    if let Some(e) = config_error {
        error!("{}", e);
        std::process::exit(1);
    }
    if let Some(path) = &config_path {
        debug!("Using configuration {}", path.display());
    }

    let format = match config.output.format.as_deref() {
        Some(value) => OutputFormat::from_config(value).unwrap_or_else(|| {
            warn!("Unknown output format {:?}, using table", value);
            OutputFormat::Table
        }),
        None => OutputFormat::Table,
    };

    let cancel = CancelToken::new();
    let handler_token = cancel.clone();
    if let Err(e) = ctrlc::set_handler(move || handler_token.cancel()) {
        warn!("Failed to install the interrupt handler: {}", e);
    }

    let ctx = RunContext {
        demux: config.demux_config(),
        format,
        cancel,
    };

    let code = match arg.command {
        Commands::Sync {
            source,
            sync_window,
        } => commands::inspect::cmd_sync(source, sync_window, &ctx),
        Commands::Inspect { pass } => commands::inspect::cmd_inspect(pass, &ctx),
        Commands::Tables {
            pass,
            table_id,
            extension,
            history,
        } => commands::tables::cmd_tables(pass, table_id, extension, history, &ctx),
        Commands::Pes { pass, pids, limit } => commands::pes::cmd_pes(pass, pids, limit, &ctx),
    };
    std::process::exit(code);
}
