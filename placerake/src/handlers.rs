use colored::Colorize;
use placerake_core::data::SqliteBackend;
use placerake_core::events::HarvestStats;
use placerake_core::run::HarvestConfig;
use placerake_harvester::store::WorkStore;
use std::fs;
use std::path::PathBuf;
use std::sync::Arc;

/// Where the work store ended up, and how.
pub struct StoreChoice {
    pub store: Arc<WorkStore>,
    /// Set when a durable SQLite file is in use.
    pub durable_path: Option<PathBuf>,
    /// Set when a durable store was requested but could not be opened.
    pub warning: Option<String>,
}

pub fn expand_store_path(raw: &str) -> PathBuf {
    PathBuf::from(shellexpand::tilde(raw).as_ref())
}

/// Opens the requested SQLite store, falling back to the in-memory
/// backend with a warning when the file cannot be opened. The run
/// proceeds either way; only resumability is lost.
pub fn open_store(path: Option<&str>) -> StoreChoice {
    let raw = match path {
        Some(raw) => raw,
        None => {
            return StoreChoice {
                store: Arc::new(WorkStore::in_memory()),
                durable_path: None,
                warning: None,
            };
        }
    };

    let expanded = expand_store_path(raw);
    if let Some(parent) = expanded.parent() {
        let _ = fs::create_dir_all(parent);
    }

    match SqliteBackend::open(&expanded) {
        Ok(backend) => StoreChoice {
            store: Arc::new(WorkStore::new(Box::new(backend))),
            durable_path: Some(expanded),
            warning: None,
        },
        Err(e) => StoreChoice {
            store: Arc::new(WorkStore::in_memory()),
            durable_path: None,
            warning: Some(format!(
                "Could not open store at {} ({}), continuing in memory; this run will not be resumable",
                expanded.display(),
                e
            )),
        },
    }
}

/// Applies the optional CLI tuning flags over the defaults.
pub fn build_config(
    grid: usize,
    workers: Option<usize>,
    extraction_workers: Option<usize>,
    batch_size: Option<usize>,
    no_enrich: bool,
) -> HarvestConfig {
    let defaults = HarvestConfig::default();
    HarvestConfig {
        grid_size: grid,
        discovery_workers: workers.unwrap_or(defaults.discovery_workers),
        extraction_workers: extraction_workers.unwrap_or(defaults.extraction_workers),
        batch_size: batch_size.unwrap_or(defaults.batch_size),
        enrich: !no_enrich,
        ..defaults
    }
}

/// End-of-run summary block, printed to stderr unless --quiet.
pub fn format_summary(stats: &HarvestStats) -> String {
    let mut out = String::new();
    out.push_str(&format!("\n{}\n", "Harvest complete".green().bold()));
    out.push_str(&format!(
        "  {} candidate ids discovered\n",
        stats.total_ids.to_string().cyan()
    ));
    out.push_str(&format!(
        "  {} records extracted ({} filtered out)\n",
        stats.total_records.to_string().cyan(),
        stats.filtered_out
    ));
    out.push_str(&format!(
        "  {} emails found\n",
        stats.emails_found.to_string().cyan()
    ));
    out.push_str(&format!("  finished in {}s\n", stats.duration_seconds));
    out
}

pub fn print_banner() {
    eprintln!(
        "{}",
        r#"
        _                    _
  _ __ | | __ _  ___ ___ _ _ __ _| |_____
 | '_ \| |/ _` |/ __/ -_) '_/ _` | / / -_)
 | .__/|_|\__,_|\___\___|_| \__,_|_\_\___|
 |_|      grid in, records out
"#
        .cyan()
    );
}
