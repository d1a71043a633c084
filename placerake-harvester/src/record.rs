//! Business record model and validation.

use crate::id::CandidateId;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};

/// Titles of navigational and interstitial pages that masquerade as a
/// business name when extraction lands on the wrong view. Matched
/// case-insensitively, exact or as a prefix.
const NAME_DENYLIST: &[&str] = &[
    "résultats",
    "resultats",
    "results",
    "result",
    "sponsored",
    "sponsorisé",
    "avant d'accéder",
    "avant d'acceder",
    "before you continue",
    "accéder à google maps",
    "acceder a google maps",
    "consent",
    "google maps",
];

const NAME_MIN_LEN: usize = 3;

/// Structural junk that sometimes leaks into the name slot: bare numbers,
/// raw identifiers, URLs.
static NAME_JUNK_PATTERNS: Lazy<Vec<Regex>> = Lazy::new(|| {
    [
        r"^[\d\.,\s]+$",
        r"^[a-f0-9]{20,}$",
        r"^0x[a-f0-9]+",
        r"^ChIJ",
        r"^https?://",
        r"^\d+\.\d+$",
    ]
    .iter()
    .map(|p| Regex::new(p).unwrap())
    .collect()
});

static LETTER_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"[a-zA-ZÀ-ÿŒœÆæ]").unwrap());

/// One structured business entity. Assembled during extraction, enriched
/// later; fields are filled in but never overwritten.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Record {
    pub id: String,
    pub name: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub address: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub phone: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub phone_normalized: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub email: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub website: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rating: Option<f64>,
    #[serde(default)]
    pub review_count: u32,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub category: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub source_url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub latitude: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub longitude: Option<f64>,
}

impl Record {
    pub fn new(id: &CandidateId, name: String) -> Self {
        Self {
            id: id.as_str().to_string(),
            name,
            ..Self::default()
        }
    }

    /// Sets the phone and its normalized form in one step.
    pub fn set_phone(&mut self, phone: &str) {
        self.phone = phone.trim().to_string();
        self.phone_normalized = normalize_phone(phone);
    }

    /// A record is valid iff its name looks like an actual business name
    /// rather than a page title or stray token.
    pub fn is_valid(&self) -> bool {
        name_is_valid(&self.name)
    }

    /// Copies missing fields from `other` without overwriting anything
    /// already present.
    pub fn fill_from(&mut self, other: &Record) {
        if self.phone.is_empty() && !other.phone.is_empty() {
            self.phone = other.phone.clone();
            self.phone_normalized = other.phone_normalized.clone();
        }
        if self.email.is_empty() && !other.email.is_empty() {
            self.email = other.email.clone();
        }
        if self.website.is_empty() && !other.website.is_empty() {
            self.website = other.website.clone();
        }
        if self.address.is_empty() && !other.address.is_empty() {
            self.address = other.address.clone();
        }
        if self.category.is_empty() && !other.category.is_empty() {
            self.category = other.category.clone();
        }
        if self.rating.is_none() {
            self.rating = other.rating;
        }
        if self.review_count == 0 {
            self.review_count = other.review_count;
        }
    }
}

/// Validates a candidate business name against length, letter content,
/// the denylist and the junk patterns.
pub fn name_is_valid(name: &str) -> bool {
    let trimmed = name.trim();
    if trimmed.chars().count() < NAME_MIN_LEN {
        return false;
    }
    if !LETTER_RE.is_match(trimmed) {
        return false;
    }

    let lower = trimmed.to_lowercase();
    for phrase in NAME_DENYLIST {
        if lower == *phrase || lower.starts_with(phrase) {
            return false;
        }
    }

    !NAME_JUNK_PATTERNS.iter().any(|re| re.is_match(trimmed))
}

/// Strips spacing and punctuation from a phone number.
pub fn normalize_phone(phone: &str) -> String {
    phone
        .chars()
        .filter(|c| !matches!(c, ' ' | '.' | '-' | '(' | ')'))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_plain_business_name_accepted() {
        assert!(name_is_valid("Boulangerie Martin"));
    }

    #[test]
    fn test_denylisted_title_rejected() {
        assert!(!name_is_valid("Résultats"));
        assert!(!name_is_valid("results"));
        assert!(!name_is_valid("Avant d'accéder à Google Maps"));
    }

    #[test]
    fn test_short_or_letterless_rejected() {
        assert!(!name_is_valid("ab"));
        assert!(!name_is_valid("12345"));
        assert!(!name_is_valid("3.5"));
    }

    #[test]
    fn test_raw_identifier_rejected() {
        assert!(!name_is_valid("ChIJD7fiBh9u5kcRYJSMaMOCCwQ"));
        assert!(!name_is_valid("0x47e66e1f06e6b70f"));
        assert!(!name_is_valid("https://example.com"));
    }

    #[test]
    fn test_accented_name_accepted() {
        assert!(name_is_valid("Épicerie Générale"));
    }

    #[test]
    fn test_normalize_phone() {
        assert_eq!(normalize_phone("01 23 45 67 89"), "0123456789");
        assert_eq!(normalize_phone("+33 (0)1.23-45"), "+33012345");
    }

    #[test]
    fn test_fill_from_never_overwrites() {
        let id = crate::id::CandidateId::parse("ChIJD7fiBh9u5kcRYJSMaMOCCwQ").unwrap();
        let mut a = Record::new(&id, "Boulangerie Martin".into());
        a.set_phone("01 23 45 67 89");

        let mut b = Record::new(&id, "Boulangerie Martin".into());
        b.set_phone("09 99 99 99 99");
        b.website = "https://boulangerie-martin.fr".into();

        a.fill_from(&b);
        assert_eq!(a.phone, "01 23 45 67 89");
        assert_eq!(a.website, "https://boulangerie-martin.fr");
    }
}
