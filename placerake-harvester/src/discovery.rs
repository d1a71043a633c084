//! Discovery phase: sweep the zone grid and collect candidate ids.
//!
//! Zones are split into contiguous shards, one worker per shard, each
//! worker driving its own page session for its whole shard. A zone that
//! fails is logged and skipped; discovery never aborts the sweep.

use crate::error::Result;
use crate::id::extract_candidates;
use crate::session::{SessionEngine, Zone};
use crate::store::WorkStore;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

pub const DEFAULT_DISCOVERY_WORKERS: usize = 15;
pub const DEFAULT_SCROLL_COUNT: usize = 4;
pub const DEFAULT_SCROLL_DELAY_MS: u64 = 200;
pub const DEFAULT_PAGE_DELAY_MS: u64 = 800;

/// Per-zone progress notifications, fired from worker tasks.
#[derive(Debug, Clone)]
pub enum ZoneEvent {
    Started { zone: Zone },
    LinksFound { zone: Zone, new_ids: usize },
    Completed { zone: Zone, failed: bool },
}

pub type ZoneCallback = Arc<dyn Fn(ZoneEvent) + Send + Sync>;

pub struct DiscoveryWorkerPool {
    engine: Arc<dyn SessionEngine>,
    workers: usize,
    scroll_count: usize,
    scroll_delay: Duration,
    page_delay: Duration,
    callback: Option<ZoneCallback>,
}

impl DiscoveryWorkerPool {
    pub fn new(engine: Arc<dyn SessionEngine>, workers: usize) -> Self {
        Self {
            engine,
            workers: workers.max(1),
            scroll_count: DEFAULT_SCROLL_COUNT,
            scroll_delay: Duration::from_millis(DEFAULT_SCROLL_DELAY_MS),
            page_delay: Duration::from_millis(DEFAULT_PAGE_DELAY_MS),
            callback: None,
        }
    }

    pub fn with_callback(mut self, callback: ZoneCallback) -> Self {
        self.callback = Some(callback);
        self
    }

    pub fn with_scrolling(mut self, count: usize, delay: Duration) -> Self {
        self.scroll_count = count;
        self.scroll_delay = delay;
        self
    }

    pub fn with_page_delay(mut self, delay: Duration) -> Self {
        self.page_delay = delay;
        self
    }

    /// Sweeps `zones` for `query`, appending every valid candidate id to
    /// the store. Returns the number of ids not seen before.
    pub async fn run(&self, query: &str, zones: &[Zone], store: &Arc<WorkStore>) -> Result<usize> {
        if zones.is_empty() {
            return Ok(0);
        }

        let workers = self.workers.min(zones.len());
        let shard_size = zones.len().div_ceil(workers);
        info!(
            "Discovery: {} zones across {} workers (shard size {})",
            zones.len(),
            workers,
            shard_size
        );

        let mut tasks = JoinSet::new();
        for (worker_id, shard) in zones.chunks(shard_size).enumerate() {
            let engine = self.engine.clone();
            let store = store.clone();
            let query = query.to_string();
            let shard = shard.to_vec();
            let callback = self.callback.clone();
            let scroll_count = self.scroll_count;
            let scroll_delay = self.scroll_delay;
            let page_delay = self.page_delay;

            tasks.spawn(async move {
                debug!("Discovery worker {} started ({} zones)", worker_id, shard.len());
                let new_ids = discover_shard(
                    worker_id,
                    engine,
                    store,
                    &query,
                    &shard,
                    callback,
                    scroll_count,
                    scroll_delay,
                    page_delay,
                )
                .await;
                debug!("Discovery worker {} finished", worker_id);
                new_ids
            });
        }

        let mut total_new = 0;
        while let Some(joined) = tasks.join_next().await {
            total_new += joined?;
        }
        info!("Discovery complete: {} new candidate ids", total_new);
        Ok(total_new)
    }
}

#[allow(clippy::too_many_arguments)]
async fn discover_shard(
    worker_id: usize,
    engine: Arc<dyn SessionEngine>,
    store: Arc<WorkStore>,
    query: &str,
    shard: &[Zone],
    callback: Option<ZoneCallback>,
    scroll_count: usize,
    scroll_delay: Duration,
    page_delay: Duration,
) -> usize {
    let emit = |event: ZoneEvent| {
        if let Some(ref cb) = callback {
            cb(event);
        }
    };

    let mut session = match engine.new_session().await {
        Ok(s) => s,
        Err(e) => {
            warn!("Worker {}: session open failed, shard skipped: {}", worker_id, e);
            for zone in shard {
                emit(ZoneEvent::Started { zone: *zone });
                emit(ZoneEvent::Completed { zone: *zone, failed: true });
            }
            return 0;
        }
    };

    // Baseline navigation with one consent retry. A session that stays
    // consent-blocked still gets to try its zones; some interstitials
    // only appear on the landing page.
    if let Err(e) = session.prepare().await {
        warn!("Worker {}: prepare failed: {}", worker_id, e);
        if session.needs_consent().await
            && let Err(e) = session.resolve_consent().await
        {
            warn!("Worker {}: consent unresolved: {}", worker_id, e);
        }
    }

    let mut shard_new = 0;
    for zone in shard {
        emit(ZoneEvent::Started { zone: *zone });
        match sweep_zone(
            session.as_mut(),
            &store,
            query,
            zone,
            scroll_count,
            scroll_delay,
            page_delay,
        )
        .await
        {
            Ok(new_ids) => {
                if new_ids > 0 {
                    shard_new += new_ids;
                    emit(ZoneEvent::LinksFound { zone: *zone, new_ids });
                }
                emit(ZoneEvent::Completed { zone: *zone, failed: false });
            }
            Err(e) => {
                warn!("Worker {}: zone {} failed: {}", worker_id, zone.index, e);
                emit(ZoneEvent::Completed { zone: *zone, failed: true });
            }
        }
    }

    session.close().await;
    shard_new
}

async fn sweep_zone(
    session: &mut dyn crate::session::PageSession,
    store: &WorkStore,
    query: &str,
    zone: &Zone,
    scroll_count: usize,
    scroll_delay: Duration,
    page_delay: Duration,
) -> Result<usize> {
    session.open_zone(query, zone).await?;
    tokio::time::sleep(page_delay).await;

    if session.needs_consent().await {
        session.resolve_consent().await?;
    }

    for _ in 0..scroll_count {
        session.trigger_more().await?;
        tokio::time::sleep(scroll_delay).await;
    }

    let payloads = session.drain_payloads().await;
    let mut ids = Vec::new();
    for payload in &payloads {
        ids.extend(extract_candidates(payload));
    }
    debug!(
        "Zone {}: {} payloads, {} candidate tokens",
        zone.index,
        payloads.len(),
        ids.len()
    );

    if ids.is_empty() {
        return Ok(0);
    }
    store.add_ids(&ids)
}
