//! Chromium-backed implementation of the session capability.
//!
//! This is the replaceable, site-specific edge of the system: URL formats,
//! consent-button texts and the recognised network endpoint classes all
//! live here and nowhere else.

use crate::error::{HarvestError, Result};
use crate::id::CandidateId;
use crate::session::{ExtractStrategy, FieldSpec, PageSession, RecordField, SessionEngine, Zone};
use async_trait::async_trait;
use chromiumoxide::browser::{Browser, BrowserConfig};
use chromiumoxide::cdp::browser_protocol::network::{
    EnableParams, EventResponseReceived, GetResponseBodyParams,
};
use chromiumoxide::Page;
use futures::StreamExt;
use regex::Regex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, warn};
use url::Url;

const BASE_URL: &str = "https://www.google.com/maps";
const NAV_TIMEOUT: Duration = Duration::from_secs(15);
const DETAIL_TIMEOUT: Duration = Duration::from_secs(12);

/// Network endpoint classes that carry candidate tokens.
const OBSERVED_ENDPOINTS: &[&str] = &["/search", "/maps/preview/place", "/place/"];

/// Responses under this size are boilerplate, not result feeds.
const MIN_PAYLOAD_LEN: usize = 500;

const CONSENT_MARKERS: &[&str] = &["consent", "avant d'acc", "before you continue"];

/// Clicks the first visible consent button, if any. Returns whether a
/// click happened.
const CONSENT_CLICK_JS: &str = r#"
(() => {
    const texts = ["tout accepter", "accept all", "accepter tout"];
    const byId = document.querySelector('#L2AGLb');
    if (byId) { byId.click(); return true; }
    for (const btn of document.querySelectorAll('button')) {
        const label = (btn.innerText || '').trim().toLowerCase();
        if (texts.some(t => label.includes(t))) { btn.click(); return true; }
    }
    return false;
})()
"#;

const SCROLL_FEED_JS: &str = r#"
(() => {
    const feed = document.querySelector('div[role="feed"]');
    if (feed) feed.scrollTo(0, feed.scrollHeight);
    return null;
})()
"#;

/// Shared Chromium engine. All sessions in a batch share one browser
/// process; recycling relaunches it to shed accumulated memory.
pub struct ChromeEngine {
    inner: Mutex<Option<EngineInner>>,
    headless: bool,
}

struct EngineInner {
    browser: Browser,
    handler_task: JoinHandle<()>,
}

impl ChromeEngine {
    /// Launches the browser. Failure here is the one fatal error of the
    /// pipeline.
    pub async fn launch(headless: bool) -> Result<Self> {
        let inner = Self::launch_inner(headless).await?;
        Ok(Self {
            inner: Mutex::new(Some(inner)),
            headless,
        })
    }

    async fn launch_inner(headless: bool) -> Result<EngineInner> {
        let mut builder = BrowserConfig::builder()
            .arg("--disable-blink-features=AutomationControlled")
            .arg("--disable-dev-shm-usage")
            .arg("--disable-gpu")
            .arg("--no-sandbox")
            .window_size(1280, 720);
        if !headless {
            builder = builder.with_head();
        }
        let config = builder
            .build()
            .map_err(HarvestError::EngineLaunch)?;

        let (browser, mut handler) = Browser::launch(config)
            .await
            .map_err(|e| HarvestError::EngineLaunch(e.to_string()))?;

        // The handler stream must be polled for the CDP connection to
        // make progress.
        let handler_task = tokio::spawn(async move {
            while let Some(event) = handler.next().await {
                if let Err(e) = event {
                    debug!("CDP handler event error: {}", e);
                }
            }
        });

        Ok(EngineInner {
            browser,
            handler_task,
        })
    }

    async fn teardown(inner: &mut EngineInner) {
        if let Err(e) = inner.browser.close().await {
            warn!("Browser close failed: {}", e);
        }
        let _ = inner.browser.wait().await;
        inner.handler_task.abort();
    }
}

#[async_trait]
impl SessionEngine for ChromeEngine {
    async fn new_session(&self) -> Result<Box<dyn PageSession>> {
        let guard = self.inner.lock().await;
        let inner = guard
            .as_ref()
            .ok_or_else(|| HarvestError::SessionError("engine is shut down".into()))?;

        let page = inner
            .browser
            .new_page("about:blank")
            .await
            .map_err(|e| HarvestError::SessionError(e.to_string()))?;

        ChromeSession::attach(page).await.map(|s| Box::new(s) as Box<dyn PageSession>)
    }

    async fn recycle(&self) -> Result<()> {
        let mut guard = self.inner.lock().await;
        if let Some(ref mut inner) = *guard {
            Self::teardown(inner).await;
        }
        *guard = Some(Self::launch_inner(self.headless).await?);
        Ok(())
    }

    async fn shutdown(&self) -> Result<()> {
        let mut guard = self.inner.lock().await;
        if let Some(ref mut inner) = *guard {
            Self::teardown(inner).await;
        }
        *guard = None;
        Ok(())
    }
}

/// One isolated tab with passive network observation.
pub struct ChromeSession {
    page: Option<Page>,
    payloads: Arc<Mutex<Vec<String>>>,
    observer_task: JoinHandle<()>,
}

impl ChromeSession {
    async fn attach(page: Page) -> Result<Self> {
        page.execute(EnableParams::default())
            .await
            .map_err(|e| HarvestError::SessionError(e.to_string()))?;

        let payloads: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));

        let mut events = page
            .event_listener::<EventResponseReceived>()
            .await
            .map_err(|e| HarvestError::SessionError(e.to_string()))?;

        let observer_page = page.clone();
        let observer_payloads = payloads.clone();
        let observer_task = tokio::spawn(async move {
            while let Some(event) = events.next().await {
                let url = event.response.url.clone();
                if !OBSERVED_ENDPOINTS.iter().any(|ep| url.contains(ep)) {
                    continue;
                }
                let params = GetResponseBodyParams::new(event.request_id.clone());
                match observer_page.execute(params).await {
                    Ok(resp) => {
                        let body = &resp.result.body;
                        if !resp.result.base64_encoded && body.len() > MIN_PAYLOAD_LEN {
                            observer_payloads.lock().await.push(body.clone());
                        }
                    }
                    // Bodies for cancelled or streamed responses are
                    // routinely unavailable; skip them.
                    Err(e) => debug!("response body unavailable for {}: {}", url, e),
                }
            }
        });

        Ok(Self {
            page: Some(page),
            payloads,
            observer_task,
        })
    }

    fn page(&self) -> Result<&Page> {
        self.page
            .as_ref()
            .ok_or_else(|| HarvestError::SessionError("session already closed".into()))
    }

    async fn goto_timed(&self, url: &str, timeout: Duration) -> Result<()> {
        let page = self.page()?;
        match tokio::time::timeout(timeout, page.goto(url)).await {
            Ok(Ok(_)) => Ok(()),
            Ok(Err(e)) => Err(HarvestError::SessionError(e.to_string())),
            Err(_) => Err(HarvestError::NavigationTimeout(timeout.as_millis() as u64)),
        }
    }

    async fn eval_string(&self, js: String) -> Result<Option<String>> {
        let page = self.page()?;
        let result = page
            .evaluate(js)
            .await
            .map_err(|e| HarvestError::SessionError(e.to_string()))?;
        result
            .into_value::<Option<String>>()
            .map_err(|e| HarvestError::ParseError(e.to_string()))
    }

    async fn eval_bool(&self, js: &str) -> Result<bool> {
        let page = self.page()?;
        let result = page
            .evaluate(js)
            .await
            .map_err(|e| HarvestError::SessionError(e.to_string()))?;
        result
            .into_value::<bool>()
            .map_err(|e| HarvestError::ParseError(e.to_string()))
    }

    /// Runs one strategy against the live DOM.
    async fn apply_strategy(&self, strategy: &ExtractStrategy) -> Result<Option<String>> {
        let raw = match strategy {
            ExtractStrategy::Text { css } => self.query_dom(css, None).await?,
            ExtractStrategy::Attr { css, attr } => self.query_dom(css, Some(attr)).await?,
            ExtractStrategy::Pattern { css, attr, pattern } => {
                let source = self.query_dom(css, attr.as_deref()).await?;
                match source {
                    Some(text) => {
                        let re = Regex::new(pattern)
                            .map_err(|e| HarvestError::ParseError(e.to_string()))?;
                        re.captures(&text)
                            .and_then(|c| c.get(1))
                            .map(|m| m.as_str().to_string())
                    }
                    None => None,
                }
            }
        };
        Ok(raw.map(|v| v.trim().to_string()).filter(|v| !v.is_empty()))
    }

    async fn query_dom(&self, css: &str, attr: Option<&str>) -> Result<Option<String>> {
        let css_lit = serde_json::to_string(css)
            .map_err(|e| HarvestError::ParseError(e.to_string()))?;
        let accessor = match attr {
            Some(attr) => {
                let attr_lit = serde_json::to_string(attr)
                    .map_err(|e| HarvestError::ParseError(e.to_string()))?;
                format!("el.getAttribute({attr_lit})")
            }
            None => "el.innerText".to_string(),
        };
        let js = format!(
            r#"(() => {{
                const el = document.querySelector({css_lit});
                if (!el) return null;
                return {accessor} ?? null;
            }})()"#
        );
        self.eval_string(js).await
    }
}

#[async_trait]
impl PageSession for ChromeSession {
    async fn prepare(&mut self) -> Result<()> {
        self.goto_timed(BASE_URL, Duration::from_secs(30)).await?;
        tokio::time::sleep(Duration::from_millis(1200)).await;
        if self.needs_consent().await {
            self.resolve_consent().await?;
        }
        Ok(())
    }

    async fn open_zone(&mut self, query: &str, zone: &Zone) -> Result<()> {
        let raw = format!(
            "{BASE_URL}/search/{query}/@{:.5},{:.5},15z",
            zone.center_lat, zone.center_lng
        );
        // Url::parse percent-encodes the query part of the path.
        let url = Url::parse(&raw).map_err(|e| HarvestError::InvalidUrl(e.to_string()))?;
        self.goto_timed(url.as_str(), NAV_TIMEOUT).await
    }

    async fn open_detail(&mut self, id: &CandidateId) -> Result<()> {
        let url = format!("{BASE_URL}/place/?q=place_id:{id}");
        self.goto_timed(&url, DETAIL_TIMEOUT).await
    }

    async fn trigger_more(&mut self) -> Result<()> {
        self.eval_string(SCROLL_FEED_JS.to_string()).await?;
        Ok(())
    }

    async fn drain_payloads(&mut self) -> Vec<String> {
        std::mem::take(&mut *self.payloads.lock().await)
    }

    async fn needs_consent(&mut self) -> bool {
        let url = self.current_url().await.unwrap_or_default().to_lowercase();
        if CONSENT_MARKERS.iter().any(|m| url.contains(m)) {
            return true;
        }
        match self.eval_string("document.title ?? null".to_string()).await {
            Ok(Some(title)) => {
                let title = title.to_lowercase();
                CONSENT_MARKERS.iter().any(|m| title.contains(m))
            }
            _ => false,
        }
    }

    async fn resolve_consent(&mut self) -> Result<()> {
        let clicked = self.eval_bool(CONSENT_CLICK_JS).await?;
        if clicked {
            tokio::time::sleep(Duration::from_millis(800)).await;
            Ok(())
        } else {
            Err(HarvestError::ConsentBlocked)
        }
    }

    async fn extract_fields(
        &mut self,
        specs: &[FieldSpec],
    ) -> Result<HashMap<RecordField, String>> {
        let mut out = HashMap::new();
        for spec in specs {
            for strategy in &spec.strategies {
                match self.apply_strategy(strategy).await {
                    Ok(Some(value)) => {
                        out.insert(spec.field, value);
                        break;
                    }
                    Ok(None) => {}
                    Err(e) => {
                        debug!("strategy failed for {:?}: {}", spec.field, e);
                    }
                }
            }
        }
        Ok(out)
    }

    async fn current_url(&mut self) -> Option<String> {
        match self.page {
            Some(ref page) => page.url().await.ok().flatten(),
            None => None,
        }
    }

    async fn close(mut self: Box<Self>) {
        self.observer_task.abort();
        if let Some(page) = self.page.take()
            && let Err(e) = page.close().await
        {
            debug!("page close failed: {}", e);
        }
    }
}
