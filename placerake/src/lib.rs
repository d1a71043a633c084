// Include handlers module directly from handlers.rs
#[path = "handlers.rs"]
pub mod handlers;

// Re-export commonly used handler functions for convenience
pub use handlers::{build_config, expand_store_path, format_summary, open_store, StoreChoice};

// Re-export the pipeline entry points from placerake-core
pub use placerake_core::run::{execute_harvest, BatchGovernor, HarvestConfig};
