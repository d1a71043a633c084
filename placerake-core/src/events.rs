//! Structured progress event stream.
//!
//! Every consumer-visible happening becomes one tagged event with a
//! timestamp and, where it makes sense, a `global_percent`. The percent
//! is partitioned per phase (discovery 0-40, extraction 40-80,
//! enrichment 80-100) and is clamped through a high-water mark so the
//! stream never reports going backwards, whatever order worker callbacks
//! land in.

use chrono::{DateTime, Utc};
use placerake_harvester::record::Record;
use serde::Serialize;
use std::sync::{Arc, Mutex, PoisonError};

pub const DISCOVERY_BAND: (f64, f64) = (0.0, 40.0);
pub const EXTRACTION_BAND: (f64, f64) = (40.0, 80.0);
pub const ENRICHMENT_BAND: (f64, f64) = (80.0, 100.0);

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ProgressEvent {
    Start {
        query: String,
        place: String,
        grid_size: usize,
        total_zones: usize,
    },
    Status {
        message: String,
    },
    /// How the place name was resolved to a grid center.
    Geocoding {
        place: String,
        latitude: f64,
        longitude: f64,
    },
    BatchStart {
        batch: usize,
        total_batches: usize,
        zones: usize,
    },
    ZoneStart {
        zone: usize,
    },
    ZoneLinks {
        zone: usize,
        new_ids: usize,
    },
    ZoneComplete {
        zone: usize,
        failed: bool,
    },
    ExtractionStart {
        pending: usize,
    },
    ExtractionProgress {
        processed: usize,
        total: usize,
        extracted: usize,
    },
    /// One per newly accepted record.
    Business {
        #[serde(flatten)]
        record: Record,
    },
    BatchComplete {
        batch: usize,
        total_ids: usize,
        total_records: usize,
    },
    EmailExtractionStart {
        candidates: usize,
    },
    EmailExtractionProgress {
        checked: usize,
        total: usize,
    },
    EmailFound {
        record_id: String,
        email: String,
    },
    Complete {
        stats: HarvestStats,
        records: Vec<Record>,
    },
    Error {
        message: String,
    },
    Warning {
        message: String,
    },
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct HarvestStats {
    pub total_ids: usize,
    pub processed: usize,
    pub total_records: usize,
    pub emails_found: usize,
    pub filtered_out: usize,
    pub with_phone: usize,
    pub with_email: usize,
    pub with_website: usize,
    pub with_address: usize,
    pub with_category: usize,
    pub with_rating: usize,
    pub duration_seconds: u64,
}

/// One emitted line: the event plus timestamp and the monotonic percent.
#[derive(Debug, Clone, Serialize)]
pub struct Envelope {
    #[serde(flatten)]
    pub event: ProgressEvent,
    pub timestamp: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub global_percent: Option<f64>,
}

pub type EventSink = Arc<dyn Fn(Envelope) + Send + Sync>;

/// Serializes, stamps and orders the event stream for one run.
pub struct ProgressEmitter {
    sink: EventSink,
    /// Percent high-water mark, scaled by 100. The lock is held across
    /// the sink call so percents are monotone in the order the sink
    /// observes them, not just in update order.
    high_water: Mutex<u32>,
}

impl ProgressEmitter {
    pub fn new(sink: EventSink) -> Self {
        Self {
            sink,
            high_water: Mutex::new(0),
        }
    }

    /// Emitter that drops everything, for callers without a consumer.
    pub fn discard() -> Self {
        Self::new(Arc::new(|_| {}))
    }

    /// Emits an event with no progress attached.
    pub fn emit(&self, event: ProgressEvent) {
        (self.sink)(Envelope {
            event,
            timestamp: Utc::now(),
            global_percent: None,
        });
    }

    /// Emits an event carrying `percent`, clamped to 0..=100 and never
    /// below any percent already reported.
    pub fn emit_at(&self, event: ProgressEvent, percent: f64) {
        let scaled = (percent.clamp(0.0, 100.0) * 100.0).round() as u32;
        let mut high = self
            .high_water
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if scaled > *high {
            *high = scaled;
        }
        let latest = *high;
        (self.sink)(Envelope {
            event,
            timestamp: Utc::now(),
            global_percent: Some(latest as f64 / 100.0),
        });
    }

    pub fn current_percent(&self) -> f64 {
        let high = self
            .high_water
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        *high as f64 / 100.0
    }
}

/// Maps fraction-done within a phase band to a global percent.
pub fn band_percent(band: (f64, f64), done: usize, total: usize) -> f64 {
    if total == 0 {
        return band.1;
    }
    let fraction = (done as f64 / total as f64).clamp(0.0, 1.0);
    band.0 + (band.1 - band.0) * fraction
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    fn collecting_emitter() -> (ProgressEmitter, Arc<Mutex<Vec<Envelope>>>) {
        let seen: Arc<Mutex<Vec<Envelope>>> = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let emitter = ProgressEmitter::new(Arc::new(move |envelope| {
            sink.lock().unwrap().push(envelope);
        }));
        (emitter, seen)
    }

    #[test]
    fn events_serialize_with_snake_case_tag() {
        let envelope = Envelope {
            event: ProgressEvent::ZoneLinks { zone: 3, new_ids: 7 },
            timestamp: Utc::now(),
            global_percent: Some(12.5),
        };
        let json: serde_json::Value = serde_json::to_value(&envelope).unwrap();
        assert_eq!(json["type"], "zone_links");
        assert_eq!(json["zone"], 3);
        assert_eq!(json["new_ids"], 7);
        assert_eq!(json["global_percent"], 12.5);
        assert!(json["timestamp"].is_string());
    }

    #[test]
    fn percent_never_regresses() {
        let (emitter, seen) = collecting_emitter();
        for percent in [10.0, 35.0, 20.0, 35.0, 90.0, 80.0] {
            emitter.emit_at(ProgressEvent::Status { message: "tick".into() }, percent);
        }
        let reported: Vec<f64> = seen
            .lock()
            .unwrap()
            .iter()
            .map(|e| e.global_percent.unwrap())
            .collect();
        assert_eq!(reported, vec![10.0, 35.0, 35.0, 35.0, 90.0, 90.0]);
    }

    #[test]
    fn percent_is_monotone_in_sink_order_under_contention() {
        let (emitter, seen) = collecting_emitter();
        let emitter = Arc::new(emitter);
        let mut handles = Vec::new();
        for worker in 0..4u32 {
            let emitter = emitter.clone();
            handles.push(std::thread::spawn(move || {
                for step in 0..500u32 {
                    let percent = ((worker * 37 + step * 13) % 101) as f64;
                    emitter.emit_at(ProgressEvent::Status { message: "tick".into() }, percent);
                }
            }));
        }
        for handle in handles {
            handle.join().unwrap();
        }
        let reported: Vec<f64> = seen
            .lock()
            .unwrap()
            .iter()
            .map(|e| e.global_percent.unwrap())
            .collect();
        assert_eq!(reported.len(), 2000);
        assert!(reported.windows(2).all(|pair| pair[0] <= pair[1]));
    }

    #[test]
    fn percent_is_bounded() {
        let (emitter, seen) = collecting_emitter();
        emitter.emit_at(ProgressEvent::Status { message: "low".into() }, -5.0);
        emitter.emit_at(ProgressEvent::Status { message: "high".into() }, 400.0);
        let reported: Vec<f64> = seen
            .lock()
            .unwrap()
            .iter()
            .map(|e| e.global_percent.unwrap())
            .collect();
        assert_eq!(reported, vec![0.0, 100.0]);
    }

    #[test]
    fn bands_partition_the_run() {
        assert_eq!(band_percent(DISCOVERY_BAND, 0, 10), 0.0);
        assert_eq!(band_percent(DISCOVERY_BAND, 5, 10), 20.0);
        assert_eq!(band_percent(EXTRACTION_BAND, 5, 10), 60.0);
        assert_eq!(band_percent(ENRICHMENT_BAND, 10, 10), 100.0);
        // Empty phases complete their band immediately.
        assert_eq!(band_percent(EXTRACTION_BAND, 0, 0), 80.0);
    }

    #[test]
    fn events_without_progress_omit_the_field() {
        let (emitter, seen) = collecting_emitter();
        emitter.emit(ProgressEvent::Error { message: "boom".into() });
        let json = serde_json::to_value(&seen.lock().unwrap()[0]).unwrap();
        assert_eq!(json["type"], "error");
        assert!(json.get("global_percent").is_none());
    }
}
