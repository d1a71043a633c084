//! Harvest orchestration: geo partitioning, batched phase execution,
//! engine recycling and the final event accounting.

use crate::events::{
    band_percent, HarvestStats, ProgressEmitter, ProgressEvent, DISCOVERY_BAND, ENRICHMENT_BAND,
    EXTRACTION_BAND,
};
use crate::geo::{GeoPartitioner, DEFAULT_GRID_SIZE};
use crate::mem;
use placerake_harvester::discovery::{
    DiscoveryWorkerPool, ZoneEvent, DEFAULT_DISCOVERY_WORKERS, DEFAULT_PAGE_DELAY_MS,
    DEFAULT_SCROLL_COUNT, DEFAULT_SCROLL_DELAY_MS,
};
use placerake_harvester::enrichment::{
    EnrichmentFetcherPool, DEFAULT_ENRICHMENT_CONCURRENCY,
};
use placerake_harvester::error::Result;
use placerake_harvester::extraction::{
    ExtractionWorkerPool, DEFAULT_EXTRACTION_WORKERS, DEFAULT_MAX_ATTEMPTS,
    DEFAULT_SETTLE_DELAY_MS,
};
use placerake_harvester::session::{SessionEngine, Zone};
use placerake_harvester::store::WorkStore;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{info, warn};

/// Tunables for one harvest run. Field-for-field what the pools accept,
/// gathered in one place so callers configure a run, not six components.
#[derive(Debug, Clone)]
pub struct HarvestConfig {
    pub grid_size: usize,
    pub discovery_workers: usize,
    pub extraction_workers: usize,
    pub retry_attempts: usize,
    pub enrichment_concurrency: usize,
    /// Zones per batch; a run under this size is one implicit batch.
    pub batch_size: usize,
    /// Engine recycle cadence in batches.
    pub recycle_interval: usize,
    /// Recycle early when resident memory crosses this, in MB.
    pub memory_ceiling_mb: u64,
    /// Skip the email phase entirely.
    pub enrich: bool,
    /// "Load more" triggers per zone during discovery.
    pub scroll_count: usize,
    pub scroll_delay_ms: u64,
    /// Settle time after opening a zone view.
    pub page_delay_ms: u64,
    /// Settle time after opening a detail view.
    pub detail_settle_ms: u64,
}

impl Default for HarvestConfig {
    fn default() -> Self {
        Self {
            grid_size: DEFAULT_GRID_SIZE,
            discovery_workers: DEFAULT_DISCOVERY_WORKERS,
            extraction_workers: DEFAULT_EXTRACTION_WORKERS,
            retry_attempts: DEFAULT_MAX_ATTEMPTS,
            enrichment_concurrency: DEFAULT_ENRICHMENT_CONCURRENCY,
            batch_size: 50,
            recycle_interval: 3,
            memory_ceiling_mb: 2048,
            enrich: true,
            scroll_count: DEFAULT_SCROLL_COUNT,
            scroll_delay_ms: DEFAULT_SCROLL_DELAY_MS,
            page_delay_ms: DEFAULT_PAGE_DELAY_MS,
            detail_settle_ms: DEFAULT_SETTLE_DELAY_MS,
        }
    }
}

/// Runs discovery and extraction over the zone list in bounded batches,
/// recycling the shared engine between batches on cadence or memory
/// pressure. Recycling never interrupts in-flight workers; both phases
/// of a batch are fully joined first.
pub struct BatchGovernor {
    engine: Arc<dyn SessionEngine>,
    emitter: Arc<ProgressEmitter>,
    config: HarvestConfig,
}

impl BatchGovernor {
    pub fn new(
        engine: Arc<dyn SessionEngine>,
        emitter: Arc<ProgressEmitter>,
        config: HarvestConfig,
    ) -> Self {
        Self {
            engine,
            emitter,
            config,
        }
    }

    pub async fn run(&self, query: &str, zones: &[Zone], store: &Arc<WorkStore>) -> Result<()> {
        let total_zones = zones.len();
        let total_batches = total_zones.div_ceil(self.config.batch_size).max(1);
        let zones_done = Arc::new(AtomicUsize::new(0));

        for (batch_index, batch) in zones.chunks(self.config.batch_size).enumerate() {
            // Batch framing is noise when the whole run fits in one batch.
            if total_batches > 1 {
                self.emitter.emit(ProgressEvent::BatchStart {
                    batch: batch_index + 1,
                    total_batches,
                    zones: batch.len(),
                });
            }

            self.run_discovery(query, batch, store, total_zones, &zones_done)
                .await?;
            self.run_extraction(store, batch_index, total_batches).await?;

            if total_batches > 1 {
                self.emitter.emit(ProgressEvent::BatchComplete {
                    batch: batch_index + 1,
                    total_ids: store.id_count()?,
                    total_records: store.record_count()?,
                });
            }

            if batch_index + 1 < total_batches {
                self.maybe_recycle(batch_index + 1).await?;
            }
        }
        Ok(())
    }

    async fn run_discovery(
        &self,
        query: &str,
        batch: &[Zone],
        store: &Arc<WorkStore>,
        total_zones: usize,
        zones_done: &Arc<AtomicUsize>,
    ) -> Result<()> {
        let emitter = self.emitter.clone();
        let zones_done = zones_done.clone();
        let pool = DiscoveryWorkerPool::new(self.engine.clone(), self.config.discovery_workers)
            .with_scrolling(
                self.config.scroll_count,
                Duration::from_millis(self.config.scroll_delay_ms),
            )
            .with_page_delay(Duration::from_millis(self.config.page_delay_ms))
            .with_callback(Arc::new(move |event| match event {
                ZoneEvent::Started { zone } => {
                    emitter.emit(ProgressEvent::ZoneStart { zone: zone.index });
                }
                ZoneEvent::LinksFound { zone, new_ids } => {
                    emitter.emit(ProgressEvent::ZoneLinks {
                        zone: zone.index,
                        new_ids,
                    });
                }
                ZoneEvent::Completed { zone, failed } => {
                    let done = zones_done.fetch_add(1, Ordering::SeqCst) + 1;
                    emitter.emit_at(
                        ProgressEvent::ZoneComplete {
                            zone: zone.index,
                            failed,
                        },
                        band_percent(DISCOVERY_BAND, done, total_zones),
                    );
                }
            }));

        pool.run(query, batch, store).await?;
        Ok(())
    }

    async fn run_extraction(
        &self,
        store: &Arc<WorkStore>,
        batch_index: usize,
        total_batches: usize,
    ) -> Result<()> {
        // Only what earlier batches have not already claimed. This is
        // what keeps a resumed or later batch from re-attempting ids.
        let pending = store.unprocessed_ids(None)?;
        self.emitter.emit(ProgressEvent::ExtractionStart {
            pending: pending.len(),
        });
        if pending.is_empty() {
            return Ok(());
        }

        let emitter = self.emitter.clone();
        let progress_store = store.clone();
        let batch_total = pending.len();
        let batch_done = Arc::new(AtomicUsize::new(0));
        let extracted = Arc::new(AtomicUsize::new(0));

        let pool = ExtractionWorkerPool::new(self.engine.clone(), self.config.extraction_workers)
            .with_max_attempts(self.config.retry_attempts)
            .with_settle_delay(Duration::from_millis(self.config.detail_settle_ms))
            .with_callback(Arc::new(move |outcome| {
                let done = batch_done.fetch_add(1, Ordering::SeqCst) + 1;
                if outcome.name.is_some() {
                    extracted.fetch_add(1, Ordering::SeqCst);
                    if let Ok(Some(record)) = progress_store.get_record(&outcome.id) {
                        emitter.emit(ProgressEvent::Business { record });
                    }
                }
                // Extraction's share of the band is spread evenly over
                // the batches of the run.
                let run_fraction =
                    (batch_index as f64 + done as f64 / batch_total as f64) / total_batches as f64;
                emitter.emit_at(
                    ProgressEvent::ExtractionProgress {
                        processed: done,
                        total: batch_total,
                        extracted: extracted.load(Ordering::SeqCst),
                    },
                    EXTRACTION_BAND.0 + (EXTRACTION_BAND.1 - EXTRACTION_BAND.0) * run_fraction,
                );
            }));

        pool.run(pending, store).await?;
        Ok(())
    }

    async fn maybe_recycle(&self, batches_completed: usize) -> Result<()> {
        let resident = mem::resident_mb();
        // An interval of zero disables the cadence entirely.
        let on_cadence = self.config.recycle_interval > 0
            && batches_completed % self.config.recycle_interval == 0;
        let over_ceiling = resident > self.config.memory_ceiling_mb;
        if !on_cadence && !over_ceiling {
            return Ok(());
        }

        if over_ceiling {
            warn!(
                "Resident memory {}MB over ceiling {}MB, recycling engine",
                resident, self.config.memory_ceiling_mb
            );
        } else {
            info!("Recycling engine after {} batches", batches_completed);
        }
        self.emitter.emit(ProgressEvent::Status {
            message: format!("recycling engine ({resident}MB resident)"),
        });
        self.engine.recycle().await
    }
}

/// Full pipeline: resolve the place, sweep the grid in batches, enrich,
/// and close with a `complete` event carrying stats and every record.
pub async fn execute_harvest(
    engine: Arc<dyn SessionEngine>,
    store: Arc<WorkStore>,
    emitter: Arc<ProgressEmitter>,
    partitioner: GeoPartitioner,
    config: HarvestConfig,
    query: &str,
    place: &str,
) -> Result<HarvestStats> {
    let started = Instant::now();
    let center = partitioner.resolve_center(place).await;
    let zones = partitioner.grid(center);

    emitter.emit_at(
        ProgressEvent::Start {
            query: query.to_string(),
            place: place.to_string(),
            grid_size: partitioner.grid_size(),
            total_zones: zones.len(),
        },
        0.0,
    );
    emitter.emit(ProgressEvent::Geocoding {
        place: place.to_string(),
        latitude: center.0,
        longitude: center.1,
    });

    let governor = BatchGovernor::new(engine.clone(), emitter.clone(), config.clone());
    let mut failure = None;
    if let Err(e) = governor.run(query, &zones, &store).await {
        emitter.emit(ProgressEvent::Error {
            message: e.to_string(),
        });
        failure = Some(e);
    }

    let mut emails_found = 0;
    if failure.is_none() && config.enrich {
        match run_enrichment(&store, &emitter, config.enrichment_concurrency).await {
            Ok(found) => emails_found = found,
            Err(e) => {
                emitter.emit(ProgressEvent::Error {
                    message: e.to_string(),
                });
                failure = Some(e);
            }
        }
    }

    if let Err(e) = engine.shutdown().await {
        warn!("Engine shutdown failed: {}", e);
        emitter.emit(ProgressEvent::Warning {
            message: format!("engine shutdown failed: {e}"),
        });
    }

    // The terminal event always carries whatever was accumulated, even
    // when a phase failed partway.
    let records = store.all_records()?;
    let processed = store.processed_count()?;
    let stats = HarvestStats {
        total_ids: store.id_count()?,
        processed,
        total_records: records.len(),
        emails_found,
        filtered_out: processed.saturating_sub(records.len()),
        with_phone: records.iter().filter(|r| !r.phone.is_empty()).count(),
        with_email: records.iter().filter(|r| !r.email.is_empty()).count(),
        with_website: records.iter().filter(|r| !r.website.is_empty()).count(),
        with_address: records.iter().filter(|r| !r.address.is_empty()).count(),
        with_category: records.iter().filter(|r| !r.category.is_empty()).count(),
        with_rating: records.iter().filter(|r| r.rating.is_some()).count(),
        duration_seconds: started.elapsed().as_secs(),
    };
    emitter.emit_at(
        ProgressEvent::Complete {
            stats: stats.clone(),
            records,
        },
        100.0,
    );

    match failure {
        Some(e) => Err(e),
        None => Ok(stats),
    }
}

async fn run_enrichment(
    store: &Arc<WorkStore>,
    emitter: &Arc<ProgressEmitter>,
    concurrency: usize,
) -> Result<usize> {
    let candidates = store
        .all_records()?
        .iter()
        .filter(|r| r.email.is_empty() && !r.website.is_empty())
        .count();
    emitter.emit_at(
        ProgressEvent::EmailExtractionStart { candidates },
        ENRICHMENT_BAND.0,
    );
    if candidates == 0 {
        return Ok(0);
    }

    let progress_emitter = emitter.clone();
    let checked = Arc::new(AtomicUsize::new(0));
    let pool = EnrichmentFetcherPool::new(concurrency)?.with_callback(Arc::new(move |outcome| {
        let done = checked.fetch_add(1, Ordering::SeqCst) + 1;
        if let Some(email) = outcome.email {
            progress_emitter.emit(ProgressEvent::EmailFound {
                record_id: outcome.record_id,
                email,
            });
        }
        progress_emitter.emit_at(
            ProgressEvent::EmailExtractionProgress {
                checked: done,
                total: candidates,
            },
            band_percent(ENRICHMENT_BAND, done, candidates),
        );
    }));

    pool.run(store).await
}
