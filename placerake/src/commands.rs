use crate::CLAP_STYLING;
use clap::{arg, command};

pub(crate) fn command_argument_builder() -> clap::Command {
    clap::Command::new("placerake")
        .version(env!("CARGO_PKG_VERSION"))
        .bin_name("placerake")
        .styles(CLAP_STYLING)
        .arg(arg!(-q --"quiet" "Suppress banner and the end-of-run summary").required(false))
        .subcommand_required(false)
        .subcommand(
            command!("harvest")
                .about(
                    "Sweep a geographic grid for businesses matching a query, extract their \
                records and enrich them with contact emails.",
                )
                .arg(
                    arg!(<QUERY>)
                        .required(true)
                        .help("Activity to search for, e.g. \"boulangerie\""),
                )
                .arg(
                    arg!(<PLACE>)
                        .required(true)
                        .help("Place name to center the sweep on, e.g. \"Paris\""),
                )
                .arg(
                    arg!(-g --"grid" <N>)
                        .required(false)
                        .help("Grid dimension: the area is split into N x N zones (max 55)")
                        .value_parser(clap::value_parser!(usize))
                        .default_value("10"),
                )
                .arg(
                    arg!(-s --"store" <PATH>)
                        .required(false)
                        .help("SQLite work store path; reusing a path resumes the run")
                        .default_value("~/.local/share/placerake/work.db"),
                )
                .arg(
                    arg!(--"in-memory" "Keep all state in memory, nothing written to disk")
                        .required(false)
                        .conflicts_with("store"),
                )
                .arg(
                    arg!(-w --"workers" <N>)
                        .required(false)
                        .help("Discovery workers (concurrent zone sessions)")
                        .value_parser(clap::value_parser!(usize)),
                )
                .arg(
                    arg!(--"extraction-workers" <N>)
                        .required(false)
                        .help("Extraction workers (concurrent detail sessions)")
                        .value_parser(clap::value_parser!(usize)),
                )
                .arg(
                    arg!(--"batch-size" <N>)
                        .required(false)
                        .help("Zones per batch; the engine may be recycled between batches")
                        .value_parser(clap::value_parser!(usize)),
                )
                .arg(
                    arg!(--"no-enrich" "Skip the website email-enrichment phase")
                        .required(false),
                )
                .arg(
                    arg!(--"headful" "Run the browser with a visible window")
                        .required(false),
                )
                .arg(
                    arg!(-p --"progress" "Show a live progress spinner on stderr")
                        .required(false),
                ),
        )
}
