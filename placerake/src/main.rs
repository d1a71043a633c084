use clap::ArgMatches;
use colored::Colorize;
use commands::command_argument_builder;
use indicatif::{ProgressBar, ProgressStyle};
use placerake::handlers::{build_config, format_summary, open_store, print_banner};
use placerake_core::data::{RunLog, RunStatus};
use placerake_core::events::{EventSink, ProgressEmitter, ProgressEvent};
use placerake_core::geo::{GeoPartitioner, NominatimGeocoder};
use placerake_core::run::execute_harvest;
use placerake_harvester::chrome::ChromeEngine;
use std::sync::Arc;
use std::time::Duration;
use tracing::warn;

mod commands;

#[tokio::main]
async fn main() {
    let cmd = command_argument_builder();
    let chosen_command = cmd.get_matches();
    let quiet = chosen_command.get_flag("quiet");

    // Show banner unless --quiet flag is set
    if !quiet {
        print_banner();
    }

    match chosen_command.subcommand() {
        Some(("harvest", primary_command)) => handle_harvest(primary_command, quiet).await,
        None => {}
        _ => unreachable!("clap should ensure we don't get here"),
    }
}

async fn handle_harvest(sub_matches: &ArgMatches, quiet: bool) {
    // Logs go to stderr; stdout carries only the event stream
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let query = sub_matches.get_one::<String>("QUERY").unwrap();
    let place = sub_matches.get_one::<String>("PLACE").unwrap();
    let grid = *sub_matches.get_one::<usize>("grid").unwrap();
    let workers = sub_matches.get_one::<usize>("workers").copied();
    let extraction_workers = sub_matches.get_one::<usize>("extraction-workers").copied();
    let batch_size = sub_matches.get_one::<usize>("batch-size").copied();
    let no_enrich = sub_matches.get_flag("no-enrich");
    let headful = sub_matches.get_flag("headful");
    let show_progress = sub_matches.get_flag("progress");

    let store_path = if sub_matches.get_flag("in-memory") {
        None
    } else {
        sub_matches.get_one::<String>("store").map(String::as_str)
    };
    let choice = open_store(store_path);

    let spinner = if show_progress {
        let pb = ProgressBar::new_spinner();
        pb.set_style(
            ProgressStyle::default_spinner()
                .template("{spinner:.cyan} {msg}")
                .unwrap(),
        );
        pb.enable_steady_tick(Duration::from_millis(100));
        pb.set_message("starting...");
        Some(pb)
    } else {
        None
    };

    // NDJSON event stream on stdout, one line per event
    let sink_spinner = spinner.clone();
    let sink: EventSink = Arc::new(move |envelope| {
        if let Ok(line) = serde_json::to_string(&envelope) {
            match sink_spinner {
                Some(ref pb) => pb.suspend(|| println!("{line}")),
                None => println!("{line}"),
            }
        }
        if let Some(ref pb) = sink_spinner
            && let Some(percent) = envelope.global_percent
        {
            pb.set_message(format!("{percent:.1}%"));
        }
    });
    let emitter = Arc::new(ProgressEmitter::new(sink));

    if let Some(warning) = choice.warning {
        warn!("{}", warning);
        emitter.emit(ProgressEvent::Warning { message: warning });
    }

    let run_log = choice
        .durable_path
        .as_deref()
        .and_then(|path| RunLog::open(path).ok());
    let run_id = run_log
        .as_ref()
        .and_then(|log| log.begin(query, place).ok());

    // A browser that cannot launch at all is the one fatal error
    let engine = match ChromeEngine::launch(!headful).await {
        Ok(engine) => Arc::new(engine),
        Err(e) => {
            emitter.emit(ProgressEvent::Error {
                message: e.to_string(),
            });
            finish_run(&run_log, &run_id, RunStatus::Failed);
            eprintln!("{} {}", "Browser launch failed:".red().bold(), e);
            std::process::exit(1);
        }
    };

    let partitioner =
        GeoPartitioner::new(grid).with_geocoder(Arc::new(NominatimGeocoder::new()));
    let config = build_config(grid, workers, extraction_workers, batch_size, no_enrich);

    let result = execute_harvest(
        engine,
        choice.store,
        emitter,
        partitioner,
        config,
        query,
        place,
    )
    .await;

    if let Some(pb) = spinner {
        pb.finish_and_clear();
    }

    match result {
        Ok(stats) => {
            finish_run(&run_log, &run_id, RunStatus::Completed);
            if !quiet {
                eprint!("{}", format_summary(&stats));
            }
        }
        Err(e) => {
            finish_run(&run_log, &run_id, RunStatus::Failed);
            eprintln!("{} {}", "Harvest failed:".red().bold(), e);
            std::process::exit(1);
        }
    }
}

fn finish_run(run_log: &Option<RunLog>, run_id: &Option<String>, status: RunStatus) {
    if let (Some(log), Some(id)) = (run_log, run_id)
        && let Err(e) = log.finish(id, status)
    {
        warn!("Could not record run status: {}", e);
    }
}

pub const CLAP_STYLING: clap::builder::styling::Styles = clap::builder::styling::Styles::styled()
    .header(clap_cargo::style::HEADER)
    .usage(clap_cargo::style::USAGE)
    .literal(clap_cargo::style::LITERAL)
    .placeholder(clap_cargo::style::PLACEHOLDER)
    .error(clap_cargo::style::ERROR)
    .valid(clap_cargo::style::VALID)
    .invalid(clap_cargo::style::INVALID);
