//! Candidate identifier parsing and strict validation.
//!
//! Directory records are addressed by opaque tokens that come in two
//! syntactic families. Loose pattern matching over raw payloads produces
//! garbage tokens that waste extraction attempts, so every captured token
//! is re-checked against the exact length rules of its family before it is
//! allowed into the work store.

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;

/// `ChIJ`-prefixed tokens carry 20 to 50 body characters.
const OPAQUE_BODY_MIN: usize = 20;
const OPAQUE_BODY_MAX: usize = 50;

/// Each half of a hex-pair token carries 8 to 20 hex digits.
const HEX_RUN_MIN: usize = 8;
const HEX_RUN_MAX: usize = 20;

static OPAQUE_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"ChIJ[A-Za-z0-9_-]{20,50}").unwrap());
static HEX_PAIR_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"0x[0-9a-f]{8,20}:0x[0-9a-f]{8,20}").unwrap());

/// The two token families we recognise.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IdFormat {
    /// `ChIJ` + base64url body.
    Opaque,
    /// `0x<hex>:0x<hex>` pair.
    HexPair,
}

/// A validated candidate identifier for one directory record.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CandidateId(String);

impl CandidateId {
    /// Validates a raw token against the known format families.
    pub fn parse(raw: &str) -> Option<Self> {
        classify(raw).map(|_| Self(raw.to_string()))
    }

    /// Wraps a token that is already known to be well-formed, e.g. one
    /// read back from the store.
    pub fn from_trusted(raw: String) -> Self {
        Self(raw)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn format(&self) -> IdFormat {
        classify(&self.0).unwrap_or(IdFormat::Opaque)
    }
}

impl fmt::Display for CandidateId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

fn classify(raw: &str) -> Option<IdFormat> {
    if let Some(body) = raw.strip_prefix("ChIJ") {
        let ok = (OPAQUE_BODY_MIN..=OPAQUE_BODY_MAX).contains(&body.len())
            && body
                .bytes()
                .all(|b| b.is_ascii_alphanumeric() || b == b'_' || b == b'-');
        return ok.then_some(IdFormat::Opaque);
    }

    if raw.starts_with("0x")
        && let Some((left, right)) = raw.split_once(':')
    {
        let ok = hex_run_ok(left) && hex_run_ok(right);
        return ok.then_some(IdFormat::HexPair);
    }

    None
}

fn hex_run_ok(part: &str) -> bool {
    part.strip_prefix("0x")
        .map(|digits| {
            (HEX_RUN_MIN..=HEX_RUN_MAX).contains(&digits.len())
                && digits.bytes().all(|b| b.is_ascii_hexdigit() && !b.is_ascii_uppercase())
        })
        .unwrap_or(false)
}

/// Scans one observed payload body and returns every distinct valid token.
///
/// Both families are matched on the raw text; a match is discarded when it
/// sits inside a longer run of token characters (the regex would otherwise
/// truncate an over-long garbage token into a "valid" one) and the capture
/// is then re-checked with [`CandidateId::parse`].
pub fn extract_candidates(body: &str) -> Vec<CandidateId> {
    let mut seen = HashSet::new();
    let mut out = Vec::new();

    for m in OPAQUE_RE.find_iter(body).chain(HEX_PAIR_RE.find_iter(body)) {
        if !boundary_ok(body, m.start(), m.end()) {
            continue;
        }
        if let Some(id) = CandidateId::parse(m.as_str())
            && seen.insert(id.clone())
        {
            out.push(id);
        }
    }

    out
}

fn boundary_ok(body: &str, start: usize, end: usize) -> bool {
    let is_token_byte =
        |b: u8| b.is_ascii_alphanumeric() || b == b'_' || b == b'-' || b == b':';
    let before = start
        .checked_sub(1)
        .and_then(|i| body.as_bytes().get(i))
        .copied();
    let after = body.as_bytes().get(end).copied();
    !before.is_some_and(is_token_byte) && !after.is_some_and(is_token_byte)
}
