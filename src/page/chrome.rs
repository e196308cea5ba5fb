//! Live page driver over the Chrome DevTools Protocol.

use super::{ElementHandle, PageDriver, PageError, Scope, ScrollMetrics, WaitStrategy};
use crate::config::Config;
use async_trait::async_trait;
use chromiumoxide::cdp::browser_protocol::network::SetUserAgentOverrideParams;
use chromiumoxide::cdp::js_protocol::runtime::ReleaseObjectParams;
use chromiumoxide::error::CdpError;
use chromiumoxide::page::ScreenshotParams;
use chromiumoxide::{Browser, BrowserConfig, Element, Page};
use futures::StreamExt;
use serde::Deserialize;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Common Chrome executable paths to check.
const CHROME_PATHS: &[&str] = &[
    "/usr/bin/google-chrome",
    "/usr/bin/google-chrome-stable",
    "/usr/bin/chromium",
    "/usr/bin/chromium-browser",
    "/snap/bin/chromium",
    "/Applications/Google Chrome.app/Contents/MacOS/Google Chrome",
    "/Applications/Chromium.app/Contents/MacOS/Chromium",
    "/opt/google/chrome/google-chrome",
];

const METRICS_SCRIPT: &str = r#"(() => {
    const el = document.scrollingElement || document.documentElement;
    return { scroll_height: el.scrollHeight, scroll_top: el.scrollTop, viewport_height: window.innerHeight };
})()"#;

const SCROLL_SCRIPT: &str = r#"(() => {
    const el = document.scrollingElement || document.documentElement;
    window.scrollTo(0, el.scrollHeight);
    return el.scrollHeight;
})()"#;

const VISIBLE_FN: &str = r#"function() {
    const r = this.getBoundingClientRect();
    const s = window.getComputedStyle(this);
    return r.width > 0 && r.height > 0 && s.visibility !== 'hidden' && s.display !== 'none';
}"#;

const CLEAR_FN: &str = "function() { this.value = ''; this.dispatchEvent(new Event('input', { bubbles: true })); }";

#[derive(Default)]
struct Arena {
    generation: u64,
    elements: Vec<Element>,
}

/// A single Chrome tab driven over CDP.
pub struct ChromePage {
    browser: Mutex<Option<Browser>>,
    page: Page,
    handler: Mutex<Option<JoinHandle<()>>>,
    arena: Mutex<Arena>,
    timeout: Duration,
}

fn map_cdp(err: CdpError) -> PageError {
    match err {
        CdpError::Timeout => PageError::Timeout { what: "CDP response".into(), timeout_ms: 0 },
        CdpError::NotFound => PageError::NotFound("element".into()),
        other => PageError::Protocol(other.to_string()),
    }
}

fn find_chrome(explicit: Option<&Path>) -> Result<PathBuf, PageError> {
    if let Some(path) = explicit {
        return Ok(path.to_path_buf());
    }

    for path in CHROME_PATHS {
        let p = Path::new(path);
        if p.exists() {
            info!("Found Chrome at: {}", path);
            return Ok(p.to_path_buf());
        }
    }

    Err(PageError::Io(std::io::Error::new(
        std::io::ErrorKind::NotFound,
        "Chrome/Chromium not found; install it or set `chrome_path` in the config",
    )))
}

impl ChromePage {
    /// Launches a browser and opens a blank tab.
    pub async fn launch(config: &Config) -> Result<Self, PageError> {
        let chrome = find_chrome(config.chrome_path.as_deref())?;
        info!("Launching browser (headless={})", config.headless);

        let mut builder = BrowserConfig::builder().chrome_executable(chrome).window_size(1280, 720);
        if !config.headless {
            builder = builder.with_head();
        }
        if let Some(proxy) = &config.proxy {
            builder = builder.arg(format!("--proxy-server={}", proxy));
        }
        builder = builder
            .arg("--disable-blink-features=AutomationControlled")
            .arg("--disable-dev-shm-usage")
            .arg("--no-first-run")
            .arg("--no-default-browser-check")
            .arg("--no-sandbox");

        let browser_config = builder.build().map_err(PageError::Protocol)?;
        let (browser, mut handler) = Browser::launch(browser_config).await.map_err(map_cdp)?;

        let handler_task = tokio::spawn(async move {
            while let Some(event) = handler.next().await {
                if event.is_err() {
                    break;
                }
            }
        });

        let page = browser.new_page("about:blank").await.map_err(map_cdp)?;
        if let Some(user_agent) = &config.user_agent {
            page.execute(SetUserAgentOverrideParams::new(user_agent.clone()))
                .await
                .map_err(map_cdp)?;
        }

        Ok(Self {
            browser: Mutex::new(Some(browser)),
            page,
            handler: Mutex::new(Some(handler_task)),
            arena: Mutex::new(Arena::default()),
            timeout: Duration::from_millis(config.selector_timeout_ms),
        })
    }

    /// Runs a CDP call under the per-call timeout.
    async fn bounded<T>(
        &self,
        what: &str,
        fut: impl Future<Output = Result<T, CdpError>>,
    ) -> Result<T, PageError> {
        match tokio::time::timeout(self.timeout, fut).await {
            Ok(result) => result.map_err(map_cdp),
            Err(_) => Err(PageError::Timeout {
                what: what.to_string(),
                timeout_ms: self.timeout.as_millis() as u64,
            }),
        }
    }

    async fn find_all(&self, scope: Scope, selector: &str) -> Result<Vec<Element>, PageError> {
        let found = match scope {
            Scope::Page => self.bounded(selector, self.page.find_elements(selector)).await,
            Scope::Element(handle) => {
                let arena = self.arena.lock().await;
                let parent = resolve(&arena, handle)?;
                self.bounded(selector, parent.find_elements(selector)).await
            }
        };

        match found {
            Ok(elements) => Ok(elements),
            // An empty querySelectorAll surfaces as NotFound on some Chrome builds.
            Err(PageError::NotFound(_)) => Ok(Vec::new()),
            Err(e) => Err(e),
        }
    }

    /// Starts a new generation and returns the elements it dropped.
    async fn invalidate(&self) -> Vec<Element> {
        let mut arena = self.arena.lock().await;
        arena.generation += 1;
        std::mem::take(&mut arena.elements)
    }

    async fn register(&self, elements: Vec<Element>) -> Vec<ElementHandle> {
        let mut arena = self.arena.lock().await;
        let generation = arena.generation;
        elements
            .into_iter()
            .map(|element| {
                arena.elements.push(element);
                ElementHandle { generation, index: arena.elements.len() - 1 }
            })
            .collect()
    }
}

fn resolve(arena: &Arena, handle: ElementHandle) -> Result<&Element, PageError> {
    if handle.generation != arena.generation {
        return Err(PageError::Detached);
    }
    arena.elements.get(handle.index).ok_or(PageError::Detached)
}

#[derive(Deserialize)]
struct RawMetrics {
    scroll_height: f64,
    scroll_top: f64,
    viewport_height: f64,
}

#[async_trait]
impl PageDriver for ChromePage {
    async fn navigate(&self, url: &str, wait: WaitStrategy) -> Result<(), PageError> {
        debug!("Navigating to {} ({:?})", url, wait);
        self.invalidate().await;

        self.bounded(url, self.page.goto(url)).await.map_err(|e| PageError::Navigation {
            url: url.to_string(),
            reason: e.to_string(),
        })?;

        if wait != WaitStrategy::DomContentLoaded {
            if let Err(e) = self.bounded(url, self.page.wait_for_navigation()).await {
                debug!("wait_for_navigation: {}", e);
            }
        }
        if wait == WaitStrategy::NetworkIdle {
            tokio::time::sleep(Duration::from_millis(500)).await;
        }
        Ok(())
    }

    async fn query_selector(
        &self,
        scope: Scope,
        selector: &str,
    ) -> Result<Option<ElementHandle>, PageError> {
        let mut found = self.find_all(scope, selector).await?;
        found.truncate(1);
        Ok(self.register(found).await.into_iter().next())
    }

    async fn query_selector_all(
        &self,
        scope: Scope,
        selector: &str,
    ) -> Result<Vec<ElementHandle>, PageError> {
        let found = self.find_all(scope, selector).await?;
        Ok(self.register(found).await)
    }

    async fn text(&self, element: ElementHandle) -> Result<String, PageError> {
        let arena = self.arena.lock().await;
        let el = resolve(&arena, element)?;
        Ok(self.bounded("innerText", el.inner_text()).await?.unwrap_or_default())
    }

    async fn attribute(
        &self,
        element: ElementHandle,
        name: &str,
    ) -> Result<Option<String>, PageError> {
        let arena = self.arena.lock().await;
        let el = resolve(&arena, element)?;
        self.bounded(name, el.attribute(name)).await
    }

    async fn is_visible(&self, element: ElementHandle) -> Result<bool, PageError> {
        let arena = self.arena.lock().await;
        let el = resolve(&arena, element)?;
        let returns = self.bounded("visibility", el.call_js_fn(VISIBLE_FN, false)).await?;
        Ok(returns.result.value.and_then(|v| v.as_bool()).unwrap_or(false))
    }

    async fn click(&self, element: ElementHandle) -> Result<(), PageError> {
        let arena = self.arena.lock().await;
        let el = resolve(&arena, element)?;
        self.bounded("click", el.click()).await?;
        Ok(())
    }

    async fn fill(&self, element: ElementHandle, text: &str) -> Result<(), PageError> {
        let arena = self.arena.lock().await;
        let el = resolve(&arena, element)?;
        self.bounded("focus", el.click()).await?;
        self.bounded("clear", el.call_js_fn(CLEAR_FN, false)).await?;
        self.bounded("type", el.type_str(text)).await?;
        Ok(())
    }

    async fn press_key(&self, key: &str) -> Result<(), PageError> {
        let focused = self.bounded(":focus", self.page.find_element(":focus")).await?;
        self.bounded(key, focused.press_key(key)).await?;
        Ok(())
    }

    async fn scroll_to_bottom(&self) -> Result<(), PageError> {
        self.bounded("scroll", self.page.evaluate(SCROLL_SCRIPT)).await?;
        Ok(())
    }

    async fn scroll_metrics(&self) -> Result<ScrollMetrics, PageError> {
        let result = self.bounded("scroll metrics", self.page.evaluate(METRICS_SCRIPT)).await?;
        let raw: RawMetrics = result.into_value().map_err(|e| PageError::Script(e.to_string()))?;
        Ok(ScrollMetrics {
            scroll_height: raw.scroll_height,
            scroll_top: raw.scroll_top,
            viewport_height: raw.viewport_height,
        })
    }

    async fn release_handles(&self) {
        let dropped = self.invalidate().await;
        let count = dropped.len();
        let releases = dropped
            .iter()
            .map(|el| self.page.execute(ReleaseObjectParams::new(el.remote_object_id.clone())));
        let failed =
            futures::future::join_all(releases).await.into_iter().filter(Result::is_err).count();
        if failed > 0 {
            debug!("{} of {} remote objects were already gone", failed, count);
        }
    }

    async fn screenshot(&self, path: &Path) -> Result<(), PageError> {
        let params = ScreenshotParams::builder().full_page(true).build();
        self.bounded("screenshot", self.page.save_screenshot(params, path)).await?;
        Ok(())
    }

    async fn close(&self) -> Result<(), PageError> {
        let Some(mut browser) = self.browser.lock().await.take() else {
            return Ok(());
        };
        info!("Closing browser");

        if let Err(e) = browser.close().await {
            warn!("Browser close failed: {}", e);
        }
        if let Err(e) = browser.wait().await {
            warn!("Browser process wait failed: {}", e);
        }
        if let Some(task) = self.handler.lock().await.take() {
            task.abort();
        }
        Ok(())
    }
}
