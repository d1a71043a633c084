pub mod data;
pub mod events;
pub mod geo;
pub mod mem;
pub mod run;

pub use data::{RunLog, RunStatus, SqliteBackend};
pub use events::{Envelope, EventSink, HarvestStats, ProgressEmitter, ProgressEvent};
pub use geo::{GeoPartitioner, Geocoder, NominatimGeocoder};
pub use run::{execute_harvest, BatchGovernor, HarvestConfig};
