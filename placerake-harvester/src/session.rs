//! Page-session capability consumed by the worker pools.
//!
//! Everything site-specific (URL formats, DOM selectors, consent click
//! sequences, which network endpoints carry candidate data) lives behind
//! these traits. The pools only know how to drive a session; swapping the
//! directory target means swapping the adapter, not the pipeline.

use crate::error::Result;
use crate::id::CandidateId;
use async_trait::async_trait;
use std::collections::HashMap;

/// One grid cell of the search area.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Zone {
    pub center_lat: f64,
    pub center_lng: f64,
    pub index: usize,
}

/// Record fields the extraction pool asks a session for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RecordField {
    Name,
    Phone,
    Website,
    Address,
    Rating,
    ReviewCount,
    Category,
}

/// A single way of pulling one field out of the current page.
#[derive(Debug, Clone)]
pub enum ExtractStrategy {
    /// Inner text of the first element matching the selector.
    Text { css: String },
    /// Attribute value of the first element matching the selector.
    Attr { css: String, attr: String },
    /// Attribute (or text when `attr` is `None`) run through a regex;
    /// the first capture group is the value.
    Pattern {
        css: String,
        attr: Option<String>,
        pattern: String,
    },
}

/// Ordered fallback strategies for one field; the first strategy that
/// yields a plausible value wins.
#[derive(Debug, Clone)]
pub struct FieldSpec {
    pub field: RecordField,
    pub strategies: Vec<ExtractStrategy>,
}

impl FieldSpec {
    pub fn new(field: RecordField, strategies: Vec<ExtractStrategy>) -> Self {
        Self { field, strategies }
    }
}

/// One isolated page session. Sessions are cheap to open and are never
/// reused across candidate ids.
#[async_trait]
pub trait PageSession: Send {
    /// One-time baseline navigation, resolving any consent interstitial
    /// along the way. Called once before a discovery shard starts.
    async fn prepare(&mut self) -> Result<()>;

    /// Navigates to the search view for one zone.
    async fn open_zone(&mut self, query: &str, zone: &Zone) -> Result<()>;

    /// Navigates to the detail view for one candidate id.
    async fn open_detail(&mut self, id: &CandidateId) -> Result<()>;

    /// Triggers one incremental content load (scroll / "load more").
    async fn trigger_more(&mut self) -> Result<()>;

    /// Returns raw bodies observed on recognised network endpoints since
    /// the last call, draining the internal buffer.
    async fn drain_payloads(&mut self) -> Vec<String>;

    /// True when the session is currently parked on a consent or other
    /// interstitial page instead of actual content.
    async fn needs_consent(&mut self) -> bool;

    /// Attempts to click through the consent flow.
    async fn resolve_consent(&mut self) -> Result<()>;

    /// Runs the ordered fallback strategies for each spec and returns the
    /// first plausible value per field. Missing fields are absent from
    /// the map, never empty strings.
    async fn extract_fields(
        &mut self,
        specs: &[FieldSpec],
    ) -> Result<HashMap<RecordField, String>>;

    /// URL the session currently points at, if any.
    async fn current_url(&mut self) -> Option<String>;

    /// Releases the session. Must be called on every exit path.
    async fn close(self: Box<Self>);
}

/// The shared engine behind all sessions in a batch. Recycling tears the
/// underlying browser down and relaunches it; callers must guarantee no
/// session is in flight when they recycle.
#[async_trait]
pub trait SessionEngine: Send + Sync {
    async fn new_session(&self) -> Result<Box<dyn PageSession>>;

    /// Stop-the-world relaunch, releasing accumulated engine memory.
    async fn recycle(&self) -> Result<()>;

    async fn shutdown(&self) -> Result<()>;
}

/// Default field specs for a directory detail page. Selector fallbacks
/// are ordered most-specific first; the adapter applies them verbatim.
pub fn default_field_specs() -> Vec<FieldSpec> {
    vec![
        FieldSpec::new(
            RecordField::Name,
            vec![
                ExtractStrategy::Text {
                    css: "h1.DUwDvf".into(),
                },
                ExtractStrategy::Text { css: "h1".into() },
            ],
        ),
        FieldSpec::new(
            RecordField::Phone,
            vec![
                ExtractStrategy::Pattern {
                    css: r#"button[data-item-id*="phone"]"#.into(),
                    attr: Some("aria-label".into()),
                    pattern: r"([0-9+][0-9+\s\.\-]{8,})".into(),
                },
                ExtractStrategy::Pattern {
                    css: r#"a[href^="tel:"]"#.into(),
                    attr: Some("href".into()),
                    pattern: r"tel:([0-9+\s\.\-]{8,})".into(),
                },
            ],
        ),
        FieldSpec::new(
            RecordField::Website,
            vec![ExtractStrategy::Attr {
                css: r#"a[data-item-id="authority"]"#.into(),
                attr: "href".into(),
            }],
        ),
        FieldSpec::new(
            RecordField::Address,
            vec![ExtractStrategy::Pattern {
                css: r#"button[data-item-id="address"]"#.into(),
                attr: Some("aria-label".into()),
                pattern: r"(?:Adresse|Address)\s*:?\s*(.+)".into(),
            }],
        ),
        FieldSpec::new(
            RecordField::Rating,
            vec![ExtractStrategy::Pattern {
                css: r#"div.F7nice span[aria-hidden="true"]"#.into(),
                attr: None,
                pattern: r"(\d[.,]\d)".into(),
            }],
        ),
        FieldSpec::new(
            RecordField::ReviewCount,
            vec![ExtractStrategy::Pattern {
                css: r#"div.F7nice span[aria-label]"#.into(),
                attr: Some("aria-label".into()),
                pattern: r"([\d\s\u{202f}]+)\s*(?:avis|reviews?)".into(),
            }],
        ),
        FieldSpec::new(
            RecordField::Category,
            vec![ExtractStrategy::Text {
                css: r#"button[jsaction*="category"]"#.into(),
            }],
        ),
    ]
}
