//! Enrichment phase: visit record websites and hunt for a contact email.
//!
//! Plain HTTP, no browser. A semaphore caps in-flight requests so a batch
//! of slow sites cannot pile up connections. Mailto links are trusted
//! first, then emails scraped out of the page text, all filtered through
//! a noise denylist and ranked against the business identity.

use crate::error::Result;
use crate::id::CandidateId;
use crate::record::Record;
use crate::store::WorkStore;
use once_cell::sync::Lazy;
use regex::Regex;
use reqwest::Client;
use scraper::{Html, Selector};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

pub const DEFAULT_ENRICHMENT_CONCURRENCY: usize = 15;
pub const DEFAULT_PAGE_CAP: usize = 4;
const FETCH_TIMEOUT_SECS: u64 = 8;
const MAX_EMAIL_LEN: usize = 64;
/// Anything shorter than `ab.fr` is a sentinel or junk value.
const MIN_DOMAIN_LEN: usize = 5;

/// Paths probed on each site, in order, until the page cap is hit.
pub const CONTACT_PATHS: &[&str] = &[
    "/",
    "/contact",
    "/contact-us",
    "/about",
    "/a-propos",
    "/mentions-legales",
];

static EMAIL_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"[A-Za-z0-9._%+-]+@[A-Za-z0-9.-]+\.[A-Za-z]{2,}").unwrap());

static MAILTO_SELECTOR: Lazy<Selector> =
    Lazy::new(|| Selector::parse(r#"a[href^="mailto:"]"#).unwrap());

static DATA_EMAIL_SELECTOR: Lazy<Selector> =
    Lazy::new(|| Selector::parse("[data-email]").unwrap());

/// `contact [at] example [dot] fr` style spam-proofing.
static OBFUSCATED_AT_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)\s*[\[\(\{]\s*at\s*[\]\)\}]\s*").unwrap());
static OBFUSCATED_DOT_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)\s*[\[\(\{]\s*dot\s*[\]\)\}]\s*").unwrap());

/// Substrings that mark an address as tooling noise or a placeholder
/// rather than a mailbox anyone reads.
const EMAIL_DENYLIST: &[&str] = &[
    "example.com",
    "example.org",
    "domain.com",
    "email.com",
    "yourname",
    "your-email",
    "user@",
    "name@",
    "sentry",
    "google.com",
    "gstatic",
    "wixpress",
    "squarespace",
    "cloudflare",
    "godaddy",
    "jquery",
    "bootstrap",
    "schema.org",
    "placeholder",
    "noreply",
    "no-reply",
    ".png",
    ".jpg",
    ".jpeg",
    ".gif",
    ".svg",
    ".webp",
    ".css",
    ".js",
    "@2x",
    "@3x",
];

pub fn email_is_plausible(email: &str) -> bool {
    let email = email.to_lowercase();
    if email.len() > MAX_EMAIL_LEN || !EMAIL_RE.is_match(&email) {
        return false;
    }
    match email.split('@').nth(1) {
        Some(domain) if domain.len() >= MIN_DOMAIN_LEN => {}
        _ => return false,
    }
    !EMAIL_DENYLIST.iter().any(|junk| email.contains(junk))
}

/// Scores a candidate email against the record it would belong to.
/// Higher wins; ties go to the address sighted most often on the page,
/// then to the earliest-found candidate.
pub trait EmailRanker: Send + Sync {
    fn rank(&self, email: &str, record: &Record) -> i32;
}

/// Default ranking: an email on the record's own website domain beats
/// everything, then shared name tokens, then recognisably human inboxes.
pub struct TokenOverlapRanker;

const GENERIC_INBOXES: &[&str] = &["contact", "info", "bonjour", "hello", "commercial"];

impl EmailRanker for TokenOverlapRanker {
    fn rank(&self, email: &str, record: &Record) -> i32 {
        let email = email.to_lowercase();
        let mut score = 0;

        if let Some(site_domain) = registrable_domain(&record.website)
            && email.ends_with(&format!("@{site_domain}"))
        {
            score += 10;
        }

        let name_tokens: HashSet<String> = tokenize(&record.name);
        for token in tokenize(&email) {
            if token.len() >= 3 && name_tokens.contains(&token) {
                score += 3;
            }
        }

        if let Some(local) = email.split('@').next()
            && GENERIC_INBOXES.contains(&local)
        {
            score += 1;
        }

        score
    }
}

fn tokenize(text: &str) -> HashSet<String> {
    text.to_lowercase()
        .split(|c: char| !c.is_alphanumeric())
        .filter(|t| !t.is_empty())
        .map(str::to_string)
        .collect()
}

/// Host with the leading `www.` shed, e.g. `boulangerie-martin.fr`.
fn registrable_domain(website: &str) -> Option<String> {
    let url = normalize_site_url(website)?;
    let host = url.host_str()?.to_lowercase();
    Some(host.strip_prefix("www.").unwrap_or(&host).to_string())
}

fn normalize_site_url(website: &str) -> Option<url::Url> {
    let with_scheme = if website.contains("://") {
        website.to_string()
    } else {
        format!("https://{website}")
    };
    url::Url::parse(&with_scheme).ok()
}

#[derive(Debug, Clone)]
pub struct EnrichOutcome {
    pub record_id: String,
    pub email: Option<String>,
}

pub type EnrichCallback = Arc<dyn Fn(EnrichOutcome) + Send + Sync>;

pub struct EnrichmentFetcherPool {
    client: Arc<Client>,
    concurrency: usize,
    page_cap: usize,
    ranker: Arc<dyn EmailRanker>,
    callback: Option<EnrichCallback>,
}

impl EnrichmentFetcherPool {
    pub fn new(concurrency: usize) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(FETCH_TIMEOUT_SECS))
            .redirect(reqwest::redirect::Policy::limited(3))
            .user_agent("Mozilla/5.0 (X11; Linux x86_64) AppleWebKit/537.36")
            .build()?;
        Ok(Self {
            client: Arc::new(client),
            concurrency: concurrency.max(1),
            page_cap: DEFAULT_PAGE_CAP,
            ranker: Arc::new(TokenOverlapRanker),
            callback: None,
        })
    }

    pub fn with_ranker(mut self, ranker: Arc<dyn EmailRanker>) -> Self {
        self.ranker = ranker;
        self
    }

    pub fn with_page_cap(mut self, cap: usize) -> Self {
        self.page_cap = cap.max(1);
        self
    }

    pub fn with_callback(mut self, callback: EnrichCallback) -> Self {
        self.callback = Some(callback);
        self
    }

    /// Enriches every stored record that has a website but no email yet.
    /// Returns how many records gained an email.
    pub async fn run(&self, store: &Arc<WorkStore>) -> Result<usize> {
        let targets: Vec<Record> = store
            .all_records()?
            .into_iter()
            .filter(|r| r.email.is_empty() && !r.website.is_empty())
            .collect();
        if targets.is_empty() {
            return Ok(0);
        }
        info!("Enrichment: {} sites to probe", targets.len());

        let semaphore = Arc::new(Semaphore::new(self.concurrency));
        let mut tasks = JoinSet::new();

        for record in targets {
            let client = self.client.clone();
            let semaphore = semaphore.clone();
            let ranker = self.ranker.clone();
            let store = store.clone();
            let callback = self.callback.clone();
            let page_cap = self.page_cap;

            tasks.spawn(async move {
                let _permit = semaphore.acquire().await.unwrap();
                let email = hunt_email(&client, &ranker, &record, page_cap).await;

                let mut enriched = false;
                if let Some(ref email) = email {
                    let id = CandidateId::from_trusted(record.id.clone());
                    let mut updated = record.clone();
                    updated.email = email.clone();
                    match store.update_record(&id, &updated) {
                        Ok(()) => enriched = true,
                        Err(e) => warn!("Email update failed for {}: {}", record.id, e),
                    }
                }
                if let Some(ref cb) = callback {
                    cb(EnrichOutcome {
                        record_id: record.id.clone(),
                        email,
                    });
                }
                enriched
            });
        }

        let mut enriched = 0;
        while let Some(joined) = tasks.join_next().await {
            if joined? {
                enriched += 1;
            }
        }
        info!("Enrichment complete: {} emails found", enriched);
        Ok(enriched)
    }
}

async fn hunt_email(
    client: &Client,
    ranker: &Arc<dyn EmailRanker>,
    record: &Record,
    page_cap: usize,
) -> Option<String> {
    if record.website.is_empty() {
        return None;
    }
    let base = normalize_site_url(&record.website)?;

    let mut candidates: Vec<String> = Vec::new();
    let mut sightings: HashMap<String, usize> = HashMap::new();

    for path in CONTACT_PATHS.iter().take(page_cap) {
        let url = match base.join(path) {
            Ok(url) => url,
            Err(_) => continue,
        };
        let body = match fetch_page(client, url.as_str()).await {
            Some(body) => body,
            None => continue,
        };
        for email in emails_in_page(&body) {
            let key = email.to_lowercase();
            let count = sightings.entry(key.clone()).or_insert(0);
            *count += 1;
            if *count == 1 {
                candidates.push(key);
            }
        }
        // The landing page often carries the mailbox already; stop as
        // soon as anything plausible turned up.
        if !candidates.is_empty() {
            break;
        }
    }

    // Rank decides, then how often the address was sighted, then order
    // of first appearance.
    let mut best: Option<(i32, usize, String)> = None;
    for email in candidates {
        let score = ranker.rank(&email, record);
        let count = sightings[&email];
        if best
            .as_ref()
            .is_none_or(|(s, c, _)| score > *s || (score == *s && count > *c))
        {
            best = Some((score, count, email));
        }
    }
    best.map(|(_, _, email)| email)
}

async fn fetch_page(client: &Client, url: &str) -> Option<String> {
    match client.get(url).send().await {
        Ok(resp) if resp.status().is_success() => match resp.text().await {
            Ok(body) => Some(body),
            Err(e) => {
                debug!("Body read failed for {}: {}", url, e);
                None
            }
        },
        Ok(resp) => {
            debug!("Skipping {} ({})", url, resp.status());
            None
        }
        Err(e) => {
            debug!("Fetch failed for {}: {}", url, e);
            None
        }
    }
}

/// Mailto hrefs first, page text second; both filtered for plausibility.
pub fn emails_in_page(body: &str) -> Vec<String> {
    let mut out = Vec::new();

    let doc = Html::parse_document(body);
    for anchor in doc.select(&MAILTO_SELECTOR) {
        if let Some(href) = anchor.value().attr("href") {
            let addr = href
                .trim_start_matches("mailto:")
                .split('?')
                .next()
                .unwrap_or("")
                .trim();
            if email_is_plausible(addr) {
                out.push(addr.to_string());
            }
        }
    }

    for node in doc.select(&DATA_EMAIL_SELECTOR) {
        if let Some(addr) = node.value().attr("data-email") {
            let addr = addr.trim();
            if email_is_plausible(addr) {
                out.push(addr.to_string());
            }
        }
    }

    for m in EMAIL_RE.find_iter(body) {
        let addr = m.as_str();
        if email_is_plausible(addr) {
            out.push(addr.to_string());
        }
    }

    let deobfuscated = OBFUSCATED_DOT_RE
        .replace_all(&OBFUSCATED_AT_RE.replace_all(body, "@"), ".")
        .into_owned();
    if deobfuscated != body {
        for m in EMAIL_RE.find_iter(&deobfuscated) {
            let addr = m.as_str();
            if email_is_plausible(addr) && !out.iter().any(|e| e == addr) {
                out.push(addr.to_string());
            }
        }
    }

    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::id::CandidateId;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn record(name: &str, website: &str) -> (CandidateId, Record) {
        let id = CandidateId::parse("ChIJtesttesttesttest0001").unwrap();
        let mut r = Record::new(&id, name.to_string());
        r.website = website.to_string();
        (id, r)
    }

    #[test]
    fn denylist_rejects_tooling_noise() {
        assert!(email_is_plausible("contact@boulangerie-martin.fr"));
        assert!(!email_is_plausible("user@example.com"));
        assert!(!email_is_plausible("a1b2c3@sentry.wixpress.com"));
        assert!(!email_is_plausible("logo@2x.png"));
        assert!(!email_is_plausible("noreply@boulangerie-martin.fr"));
    }

    #[test]
    fn stub_domains_are_rejected() {
        assert!(!email_is_plausible("contact@a.fr"));
        assert!(!email_is_plausible("contact@x.io"));
        assert!(email_is_plausible("contact@ab.fr"));
    }

    #[test]
    fn mailto_beats_raw_text_order() {
        let body = r#"
            <html><body>
              <p>infra@cdn-junk.sentry.io</p>
              <a href="mailto:bonjour@martin.fr?subject=hi">Nous contacter</a>
              <p>Ecrivez a commande@martin.fr</p>
            </body></html>
        "#;
        let emails = emails_in_page(body);
        assert_eq!(emails[0], "bonjour@martin.fr");
        assert!(emails.contains(&"commande@martin.fr".to_string()));
        assert!(!emails.iter().any(|e| e.contains("sentry")));
    }

    #[test]
    fn obfuscated_and_data_email_forms_are_recovered() {
        let body = r#"
            <html><body>
              <span data-email="devis@toiture-morel.fr">ecrire</span>
              <p>contact [at] toiture-morel [dot] fr</p>
            </body></html>
        "#;
        let emails = emails_in_page(body);
        assert!(emails.contains(&"devis@toiture-morel.fr".to_string()));
        assert!(emails.contains(&"contact@toiture-morel.fr".to_string()));
    }

    #[test]
    fn ranker_prefers_site_domain() {
        let (_, r) = record("Boulangerie Martin", "https://www.martin-paris.fr");
        let ranker = TokenOverlapRanker;
        let own = ranker.rank("contact@martin-paris.fr", &r);
        let named = ranker.rank("martin@gmail.com", &r);
        let stranger = ranker.rank("webmaster@agency.net", &r);
        assert!(own > named);
        assert!(named > stranger);
    }

    #[tokio::test]
    async fn pool_enriches_from_contact_page() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/"))
            .respond_with(ResponseTemplate::new(200).set_body_string("<html>no email here</html>"))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/contact"))
            .respond_with(ResponseTemplate::new(200).set_body_string(
                r#"<html><a href="mailto:hello@shop.test">mail</a></html>"#,
            ))
            .mount(&server)
            .await;
        // Paths past the hit are never needed; 404 them.
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        let store = Arc::new(WorkStore::in_memory());
        let (id, r) = record("Test Shop", &server.uri());
        store.add_ids(std::slice::from_ref(&id)).unwrap();
        store.add_record(&id, &r).unwrap();

        let enriched = EnrichmentFetcherPool::new(2)
            .unwrap()
            .run(&store)
            .await
            .unwrap();

        assert_eq!(enriched, 1);
        let stored = store.get_record(&id).unwrap().unwrap();
        assert_eq!(stored.email, "hello@shop.test");
    }

    #[tokio::test]
    async fn repeated_sightings_break_rank_ties() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/"))
            .respond_with(ResponseTemplate::new(200).set_body_string(
                r#"<html><body>
                  <p>contact@premiere-adresse.fr</p>
                  <p>contact@seconde-adresse.fr</p>
                  <footer>contact@seconde-adresse.fr</footer>
                </body></html>"#,
            ))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        let store = Arc::new(WorkStore::in_memory());
        let (id, r) = record("Atelier", &server.uri());
        store.add_ids(std::slice::from_ref(&id)).unwrap();
        store.add_record(&id, &r).unwrap();

        EnrichmentFetcherPool::new(1).unwrap().run(&store).await.unwrap();

        let stored = store.get_record(&id).unwrap().unwrap();
        assert_eq!(stored.email, "contact@seconde-adresse.fr");
    }

    #[tokio::test]
    async fn records_with_email_are_skipped() {
        let store = Arc::new(WorkStore::in_memory());
        let (id, mut r) = record("Done Shop", "https://unreachable.invalid");
        r.email = "already@done.fr".to_string();
        store.add_ids(std::slice::from_ref(&id)).unwrap();
        store.add_record(&id, &r).unwrap();

        let enriched = EnrichmentFetcherPool::new(2)
            .unwrap()
            .run(&store)
            .await
            .unwrap();
        assert_eq!(enriched, 0);
    }
}
