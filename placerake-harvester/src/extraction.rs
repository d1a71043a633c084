//! Extraction phase: visit each candidate id and pull a business record.
//!
//! Every id gets a fresh, isolated session; nothing leaks between detail
//! pages. An id is marked processed exactly once, whether extraction
//! succeeded or every attempt failed, so a resumed run never revisits it.

use crate::error::Result;
use crate::id::CandidateId;
use crate::record::{name_is_valid, Record};
use crate::session::{default_field_specs, FieldSpec, PageSession, RecordField, SessionEngine};
use crate::store::WorkStore;
use once_cell::sync::Lazy;
use regex::Regex;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

pub const DEFAULT_EXTRACTION_WORKERS: usize = 55;
pub const DEFAULT_MAX_ATTEMPTS: usize = 2;

/// How long a detail page is given to render before field extraction.
pub const DEFAULT_SETTLE_DELAY_MS: u64 = 1500;

/// `@48.85837,2.29448` style viewport coordinates in a detail URL.
static URL_COORDS_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"@(-?\d{1,3}\.\d+),(-?\d{1,3}\.\d+)").unwrap());

/// Outcome of one candidate id, fired after its processed mark is set.
/// `name` is set only when this id actually stored a new record.
#[derive(Debug, Clone)]
pub struct ExtractOutcome {
    pub id: CandidateId,
    pub name: Option<String>,
}

pub type ExtractCallback = Arc<dyn Fn(ExtractOutcome) + Send + Sync>;

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ExtractionStats {
    /// Ids consumed from the queue, successful or not.
    pub processed: usize,
    /// Ids that yielded a stored record.
    pub extracted: usize,
}

pub struct ExtractionWorkerPool {
    engine: Arc<dyn SessionEngine>,
    workers: usize,
    max_attempts: usize,
    settle_delay: Duration,
    field_specs: Arc<Vec<FieldSpec>>,
    callback: Option<ExtractCallback>,
}

impl ExtractionWorkerPool {
    pub fn new(engine: Arc<dyn SessionEngine>, workers: usize) -> Self {
        Self {
            engine,
            workers: workers.max(1),
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            settle_delay: Duration::from_millis(DEFAULT_SETTLE_DELAY_MS),
            field_specs: Arc::new(default_field_specs()),
            callback: None,
        }
    }

    pub fn with_callback(mut self, callback: ExtractCallback) -> Self {
        self.callback = Some(callback);
        self
    }

    pub fn with_max_attempts(mut self, attempts: usize) -> Self {
        self.max_attempts = attempts.max(1);
        self
    }

    pub fn with_settle_delay(mut self, delay: Duration) -> Self {
        self.settle_delay = delay;
        self
    }

    /// Processes `ids`, storing every record whose name survives
    /// validation and marking each id processed exactly once.
    pub async fn run(&self, ids: Vec<CandidateId>, store: &Arc<WorkStore>) -> Result<ExtractionStats> {
        if ids.is_empty() {
            return Ok(ExtractionStats::default());
        }

        let workers = self.workers.min(ids.len());
        let shard_size = ids.len().div_ceil(workers);
        info!(
            "Extraction: {} ids across {} workers (shard size {})",
            ids.len(),
            workers,
            shard_size
        );

        let mut tasks = JoinSet::new();
        for (worker_id, shard) in ids.chunks(shard_size).enumerate() {
            let engine = self.engine.clone();
            let store = store.clone();
            let shard = shard.to_vec();
            let specs = self.field_specs.clone();
            let callback = self.callback.clone();
            let max_attempts = self.max_attempts;
            let settle_delay = self.settle_delay;

            tasks.spawn(async move {
                debug!("Extraction worker {} started ({} ids)", worker_id, shard.len());
                let mut stats = ExtractionStats::default();
                for id in shard {
                    let record =
                        extract_one(worker_id, &engine, &specs, &id, max_attempts, settle_delay)
                            .await;

                    let mut inserted = false;
                    if let Some(ref record) = record {
                        match store.add_record(&id, record) {
                            Ok(fresh) => inserted = fresh,
                            Err(e) => {
                                warn!("Worker {}: store write failed for {}: {}", worker_id, id, e);
                            }
                        }
                    }
                    if let Err(e) = store.mark_processed(std::slice::from_ref(&id)) {
                        warn!("Worker {}: mark failed for {}: {}", worker_id, id, e);
                    }

                    stats.processed += 1;
                    if inserted {
                        stats.extracted += 1;
                    }
                    if let Some(ref cb) = callback {
                        cb(ExtractOutcome {
                            id: id.clone(),
                            name: record.filter(|_| inserted).map(|r| r.name),
                        });
                    }
                }
                debug!("Extraction worker {} finished", worker_id);
                stats
            });
        }

        let mut total = ExtractionStats::default();
        while let Some(joined) = tasks.join_next().await {
            let stats = joined?;
            total.processed += stats.processed;
            total.extracted += stats.extracted;
        }
        info!(
            "Extraction complete: {}/{} ids yielded records",
            total.extracted, total.processed
        );
        Ok(total)
    }
}

/// One id, up to `max_attempts` fresh sessions. Returns `None` when every
/// attempt failed or the page never showed a plausible business name.
async fn extract_one(
    worker_id: usize,
    engine: &Arc<dyn SessionEngine>,
    specs: &[FieldSpec],
    id: &CandidateId,
    max_attempts: usize,
    settle_delay: Duration,
) -> Option<Record> {
    for attempt in 1..=max_attempts {
        match extract_attempt(engine, specs, id, settle_delay).await {
            Ok(Some(record)) => return Some(record),
            Ok(None) => {
                debug!("Worker {}: no valid name for {} (attempt {})", worker_id, id, attempt);
            }
            Err(e) => {
                debug!(
                    "Worker {}: attempt {}/{} failed for {}: {}",
                    worker_id, attempt, max_attempts, id, e
                );
            }
        }
    }
    None
}

async fn extract_attempt(
    engine: &Arc<dyn SessionEngine>,
    specs: &[FieldSpec],
    id: &CandidateId,
    settle_delay: Duration,
) -> Result<Option<Record>> {
    let mut session = engine.new_session().await?;
    let result = drive_detail_page(session.as_mut(), specs, id, settle_delay).await;
    session.close().await;
    result
}

async fn drive_detail_page(
    session: &mut dyn PageSession,
    specs: &[FieldSpec],
    id: &CandidateId,
    settle_delay: Duration,
) -> Result<Option<Record>> {
    session.open_detail(id).await?;
    tokio::time::sleep(settle_delay).await;

    // A consent interstitial swallows the navigation; resolve it and
    // renavigate once.
    if session.needs_consent().await {
        session.resolve_consent().await?;
        session.open_detail(id).await?;
        tokio::time::sleep(settle_delay).await;
    }

    let mut fields = session.extract_fields(specs).await?;
    let name = match fields.remove(&RecordField::Name) {
        Some(name) if name_is_valid(&name) => name,
        _ => return Ok(None),
    };

    let mut record = Record::new(id, name);
    if let Some(phone) = fields.remove(&RecordField::Phone) {
        record.set_phone(&phone);
    }
    if let Some(website) = fields.remove(&RecordField::Website) {
        record.website = website;
    }
    if let Some(address) = fields.remove(&RecordField::Address) {
        record.address = address;
    }
    if let Some(category) = fields.remove(&RecordField::Category) {
        record.category = category;
    }
    record.rating = fields
        .remove(&RecordField::Rating)
        .and_then(|raw| parse_rating(&raw));
    record.review_count = fields
        .remove(&RecordField::ReviewCount)
        .and_then(|raw| parse_review_count(&raw))
        .unwrap_or(0);

    if let Some(url) = session.current_url().await {
        if let Some((lat, lng)) = coords_from_url(&url) {
            record.latitude = Some(lat);
            record.longitude = Some(lng);
        }
        record.source_url = url;
    }

    Ok(Some(record))
}

/// Ratings render locale-dependent ("4,5" in French locales).
fn parse_rating(raw: &str) -> Option<f64> {
    let cleaned: String = raw
        .trim()
        .replace(',', ".")
        .chars()
        .take_while(|c| c.is_ascii_digit() || *c == '.')
        .collect();
    let rating: f64 = cleaned.parse().ok()?;
    (0.0..=5.0).contains(&rating).then_some(rating)
}

/// Review counts render as "(1 234)" or "(1,234)".
fn parse_review_count(raw: &str) -> Option<u32> {
    let digits: String = raw.chars().filter(|c| c.is_ascii_digit()).collect();
    if digits.is_empty() {
        return None;
    }
    digits.parse().ok()
}

pub fn coords_from_url(url: &str) -> Option<(f64, f64)> {
    let caps = URL_COORDS_RE.captures(url)?;
    let lat: f64 = caps.get(1)?.as_str().parse().ok()?;
    let lng: f64 = caps.get(2)?.as_str().parse().ok()?;
    Some((lat, lng))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{HarvestError, Result};
    use crate::session::Zone;
    use async_trait::async_trait;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn rating_parses_french_locale() {
        assert_eq!(parse_rating("4,5"), Some(4.5));
        assert_eq!(parse_rating("3.8 stars"), Some(3.8));
        assert_eq!(parse_rating("9.9"), None);
        assert_eq!(parse_rating("étoiles"), None);
    }

    #[test]
    fn review_count_strips_grouping() {
        assert_eq!(parse_review_count("(1 234)"), Some(1234));
        assert_eq!(parse_review_count("(42)"), Some(42));
        assert_eq!(parse_review_count("()"), None);
    }

    #[test]
    fn coords_parse_from_viewport_url() {
        let url = "https://www.google.com/maps/place/Foo/@48.85837,2.29448,17z/data=x";
        assert_eq!(coords_from_url(url), Some((48.85837, 2.29448)));
        assert_eq!(coords_from_url("https://example.com/no-coords"), None);
    }

    /// Session whose detail pages fail `fail_first` times per run before
    /// serving a record, driven by a shared attempt counter.
    struct FlakySession {
        attempts: Arc<AtomicUsize>,
        fail_first: usize,
        serve_name: Option<String>,
    }

    #[async_trait]
    impl PageSession for FlakySession {
        async fn prepare(&mut self) -> Result<()> {
            Ok(())
        }
        async fn open_zone(&mut self, _query: &str, _zone: &Zone) -> Result<()> {
            Ok(())
        }
        async fn open_detail(&mut self, _id: &CandidateId) -> Result<()> {
            let n = self.attempts.fetch_add(1, Ordering::SeqCst);
            if n < self.fail_first {
                return Err(HarvestError::NavigationTimeout(1));
            }
            Ok(())
        }
        async fn trigger_more(&mut self) -> Result<()> {
            Ok(())
        }
        async fn drain_payloads(&mut self) -> Vec<String> {
            Vec::new()
        }
        async fn needs_consent(&mut self) -> bool {
            false
        }
        async fn resolve_consent(&mut self) -> Result<()> {
            Ok(())
        }
        async fn extract_fields(
            &mut self,
            _specs: &[FieldSpec],
        ) -> Result<HashMap<RecordField, String>> {
            let mut fields = HashMap::new();
            if let Some(ref name) = self.serve_name {
                fields.insert(RecordField::Name, name.clone());
                fields.insert(RecordField::Phone, "01 42 36 00 00".to_string());
                fields.insert(RecordField::Rating, "4,5".to_string());
                fields.insert(RecordField::ReviewCount, "(128)".to_string());
            }
            Ok(fields)
        }
        async fn current_url(&mut self) -> Option<String> {
            Some("https://www.google.com/maps/place/x/@48.8566,2.3522,17z".to_string())
        }
        async fn close(self: Box<Self>) {}
    }

    struct FlakyEngine {
        attempts: Arc<AtomicUsize>,
        fail_first: usize,
        serve_name: Option<String>,
    }

    #[async_trait]
    impl SessionEngine for FlakyEngine {
        async fn new_session(&self) -> Result<Box<dyn PageSession>> {
            Ok(Box::new(FlakySession {
                attempts: self.attempts.clone(),
                fail_first: self.fail_first,
                serve_name: self.serve_name.clone(),
            }))
        }
        async fn recycle(&self) -> Result<()> {
            Ok(())
        }
        async fn shutdown(&self) -> Result<()> {
            Ok(())
        }
    }

    fn ids(n: usize) -> Vec<CandidateId> {
        (0..n)
            .map(|i| CandidateId::parse(&format!("ChIJ{:0>20}", i)).unwrap())
            .collect()
    }

    #[tokio::test]
    async fn retry_recovers_then_stores_record() {
        let attempts = Arc::new(AtomicUsize::new(0));
        let engine = Arc::new(FlakyEngine {
            attempts: attempts.clone(),
            fail_first: 1,
            serve_name: Some("Boulangerie Martin".to_string()),
        });
        let store = Arc::new(WorkStore::in_memory());
        let queue = ids(1);
        store.add_ids(&queue).unwrap();

        let pool = ExtractionWorkerPool::new(engine, 1)
            .with_max_attempts(2)
            .with_settle_delay(Duration::from_millis(0));
        let stats = pool.run(queue, &store).await.unwrap();

        assert_eq!(stats, ExtractionStats { processed: 1, extracted: 1 });
        assert_eq!(attempts.load(Ordering::SeqCst), 2);
        assert_eq!(store.record_count().unwrap(), 1);
        let record = store.all_records().unwrap().remove(0);
        assert_eq!(record.name, "Boulangerie Martin");
        assert_eq!(record.rating, Some(4.5));
        assert_eq!(record.review_count, 128);
        assert_eq!(record.latitude, Some(48.8566));
    }

    #[tokio::test]
    async fn exhausted_retries_still_mark_processed_once() {
        let attempts = Arc::new(AtomicUsize::new(0));
        let engine = Arc::new(FlakyEngine {
            attempts: attempts.clone(),
            fail_first: usize::MAX,
            serve_name: None,
        });
        let store = Arc::new(WorkStore::in_memory());
        let queue = ids(3);
        store.add_ids(&queue).unwrap();

        let pool = ExtractionWorkerPool::new(engine, 2)
            .with_max_attempts(2)
            .with_settle_delay(Duration::from_millis(0));
        let stats = pool.run(queue, &store).await.unwrap();

        assert_eq!(stats, ExtractionStats { processed: 3, extracted: 0 });
        assert_eq!(store.record_count().unwrap(), 0);
        assert_eq!(store.processed_count().unwrap(), 3);
        // Nothing left for a resumed run.
        assert!(store.unprocessed_ids(None).unwrap().is_empty());
    }

    #[tokio::test]
    async fn denylisted_name_is_not_stored() {
        let engine = Arc::new(FlakyEngine {
            attempts: Arc::new(AtomicUsize::new(0)),
            fail_first: 0,
            serve_name: Some("Résultats".to_string()),
        });
        let store = Arc::new(WorkStore::in_memory());
        let queue = ids(1);
        store.add_ids(&queue).unwrap();

        let stats = ExtractionWorkerPool::new(engine, 1)
            .with_settle_delay(Duration::from_millis(0))
            .run(queue, &store)
            .await
            .unwrap();
        assert_eq!(stats, ExtractionStats { processed: 1, extracted: 0 });
        assert_eq!(store.processed_count().unwrap(), 1);
    }
}
