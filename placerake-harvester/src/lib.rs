pub mod chrome;
pub mod discovery;
pub mod enrichment;
pub mod error;
pub mod extraction;
pub mod id;
pub mod record;
pub mod session;
pub mod store;

pub use chrome::ChromeEngine;
pub use discovery::{DiscoveryWorkerPool, ZoneCallback, ZoneEvent};
pub use enrichment::{EmailRanker, EnrichmentFetcherPool, TokenOverlapRanker};
pub use error::HarvestError;
pub use extraction::{ExtractionStats, ExtractionWorkerPool};
pub use id::CandidateId;
pub use record::Record;
pub use session::{PageSession, SessionEngine, Zone};
pub use store::{StoreBackend, WorkStore};
