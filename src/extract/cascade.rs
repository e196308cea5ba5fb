//! Selector cascades: ordered fallback chains evaluated against the page.
//!
//! A cascade never fails because a strategy missed. Transient automation
//! errors on one strategy are logged and the next strategy is tried; only
//! errors that make the page unusable (closed channel, bad selector) are
//! returned.

use super::catalog::Strategy;
use crate::page::{ElementHandle, PageDriver, PageError, Scope};
use regex_lite::Regex;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, trace};

/// A resolved value and the strategy that produced it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldMatch {
    pub value: String,
    pub source: String,
}

async fn scope_element(
    page: &dyn PageDriver,
    scope: Scope,
) -> Result<Option<ElementHandle>, PageError> {
    match scope {
        Scope::Element(handle) => Ok(Some(handle)),
        Scope::Page => page.query_selector(Scope::Page, "body").await,
    }
}

fn capture(regex: &Regex, text: &str, group: usize) -> Option<String> {
    let caps = regex.captures(text)?;
    let value = caps.get(group)?.as_str().trim();
    (!value.is_empty()).then(|| value.to_string())
}

fn too_long(text: &str, max_len: Option<usize>) -> bool {
    max_len.is_some_and(|max| text.chars().count() > max)
}

/// Elements a pattern strategy scans, in document order.
async fn scan_targets(
    page: &dyn PageDriver,
    scope: Scope,
    within: Option<&str>,
) -> Result<Vec<ElementHandle>, PageError> {
    match within {
        Some(selector) => page.query_selector_all(scope, selector).await,
        None => Ok(scope_element(page, scope).await?.into_iter().collect()),
    }
}

/// Evaluates one strategy to a trimmed, non-empty string.
pub async fn evaluate(
    page: &dyn PageDriver,
    scope: Scope,
    strategy: &Strategy,
) -> Result<Option<String>, PageError> {
    match strategy {
        Strategy::Css { selector, attr } => {
            let element = match selector {
                Some(sel) => page.query_selector(scope, sel).await?,
                None => scope_element(page, scope).await?,
            };
            let Some(element) = element else {
                return Ok(None);
            };

            let raw = match attr {
                Some(name) => page.attribute(element, name).await?,
                None => Some(page.text(element).await?),
            };
            Ok(raw.map(|s| s.trim().to_string()).filter(|s| !s.is_empty()))
        }

        Strategy::Pattern { regex, within, group, max_len } => {
            for element in scan_targets(page, scope, within.as_deref()).await? {
                let text = match page.text(element).await {
                    Ok(text) => text,
                    Err(e) if e.is_transient() => {
                        trace!("pattern scan skipped an element: {}", e);
                        continue;
                    }
                    Err(e) => return Err(e),
                };
                if too_long(&text, *max_len) {
                    continue;
                }
                if let Some(value) = capture(regex, &text, *group) {
                    return Ok(Some(value));
                }
            }
            Ok(None)
        }
    }
}

/// Resolves one field: the first strategy with a non-empty match wins.
///
/// `Ok(None)` means every strategy came up empty, which is ordinary
/// missing data.
pub async fn resolve(
    page: &dyn PageDriver,
    scope: Scope,
    strategies: &[Strategy],
) -> Result<Option<FieldMatch>, PageError> {
    for strategy in strategies {
        match evaluate(page, scope, strategy).await {
            Ok(Some(value)) => {
                return Ok(Some(FieldMatch { value, source: strategy.label() }));
            }
            Ok(None) => trace!("{} matched nothing", strategy.label()),
            Err(e) if e.is_transient() => debug!("{} failed: {}", strategy.label(), e),
            Err(e) => return Err(e),
        }
    }
    Ok(None)
}

/// Elements a strategy selects (used for record roots and controls).
async fn elements(
    page: &dyn PageDriver,
    scope: Scope,
    strategy: &Strategy,
) -> Result<Vec<ElementHandle>, PageError> {
    match strategy {
        Strategy::Css { selector: Some(sel), .. } => page.query_selector_all(scope, sel).await,
        Strategy::Css { selector: None, .. } => {
            Ok(scope_element(page, scope).await?.into_iter().collect())
        }
        Strategy::Pattern { regex, within, max_len, .. } => {
            let mut matched = Vec::new();
            for element in scan_targets(page, scope, within.as_deref()).await? {
                match page.text(element).await {
                    Ok(text) if !too_long(&text, *max_len) && regex.is_match(&text) => {
                        matched.push(element)
                    }
                    Ok(_) => {}
                    Err(e) if e.is_transient() => trace!("element scan skipped: {}", e),
                    Err(e) => return Err(e),
                }
            }
            Ok(matched)
        }
    }
}

/// All elements of the first strategy that selects anything, with its label.
pub async fn resolve_elements(
    page: &dyn PageDriver,
    scope: Scope,
    strategies: &[Strategy],
) -> Result<Option<(Vec<ElementHandle>, String)>, PageError> {
    for strategy in strategies {
        match elements(page, scope, strategy).await {
            Ok(found) if !found.is_empty() => return Ok(Some((found, strategy.label()))),
            Ok(_) => {}
            Err(e) if e.is_transient() => debug!("{} failed: {}", strategy.label(), e),
            Err(e) => return Err(e),
        }
    }
    Ok(None)
}

/// First visible element selected by any strategy.
pub async fn find_visible(
    page: &dyn PageDriver,
    scope: Scope,
    strategies: &[Strategy],
) -> Result<Option<ElementHandle>, PageError> {
    for strategy in strategies {
        let found = match elements(page, scope, strategy).await {
            Ok(found) => found,
            Err(e) if e.is_transient() => {
                debug!("{} failed: {}", strategy.label(), e);
                continue;
            }
            Err(e) => return Err(e),
        };
        for element in found {
            match page.is_visible(element).await {
                Ok(true) => return Ok(Some(element)),
                Ok(false) => {}
                Err(e) if e.is_transient() => trace!("visibility check failed: {}", e),
                Err(e) => return Err(e),
            }
        }
    }
    Ok(None)
}

/// Polls [`find_visible`] until something shows up or `timeout` elapses.
pub async fn wait_for_visible(
    page: &dyn PageDriver,
    scope: Scope,
    strategies: &[Strategy],
    timeout: Duration,
) -> Result<ElementHandle, PageError> {
    let deadline = Instant::now() + timeout;
    loop {
        if let Some(element) = find_visible(page, scope, strategies).await? {
            return Ok(element);
        }
        if Instant::now() >= deadline {
            let what = strategies.first().map_or_else(|| "control".to_string(), Strategy::label);
            return Err(PageError::Timeout { what, timeout_ms: timeout.as_millis() as u64 });
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::page::{SnapshotPage, WaitStrategy};
    use async_trait::async_trait;
    use std::path::Path;
    use std::sync::atomic::{AtomicU32, Ordering};

    const CARD: &str = r#"
        <html><body>
          <div class="card">
            <h3>Pizza Place</h3>
            <p class="info">4,7 • Pizza • 1,2 km</p>
            <a class="go" href="/delivery/pizza-place">Ver</a>
            <span class="empty">   </span>
          </div>
          <button>Ver mais</button>
          <button style="display:none">Carregar mais</button>
        </body></html>
    "#;

    fn css(selector: &str) -> Strategy {
        Strategy::Css { selector: Some(selector.to_string()), attr: None }
    }

    fn pattern(re: &str, within: Option<&str>, group: usize) -> Strategy {
        Strategy::Pattern {
            regex: Regex::new(re).unwrap(),
            within: within.map(String::from),
            group,
            max_len: None,
        }
    }

    async fn card_page() -> (SnapshotPage, Scope) {
        let page = SnapshotPage::single(CARD);
        page.navigate("x", WaitStrategy::Load).await.unwrap();
        let card = page.query_selector(Scope::Page, ".card").await.unwrap().unwrap();
        (page, Scope::Element(card))
    }

    #[tokio::test]
    async fn test_first_matching_strategy_wins() {
        let (page, scope) = card_page().await;
        // A misses, B matches, C would also match.
        let strategies = vec![css(".missing"), css("h3"), css("p.info")];

        let found = resolve(&page, scope, &strategies).await.unwrap().unwrap();
        assert_eq!(found.value, "Pizza Place");
        assert_eq!(found.source, "css `h3`");
    }

    #[tokio::test]
    async fn test_blank_match_falls_through() {
        let (page, scope) = card_page().await;
        let strategies = vec![css(".empty"), css("p.info")];
        let found = resolve(&page, scope, &strategies).await.unwrap().unwrap();
        assert_eq!(found.value, "4,7 • Pizza • 1,2 km");
    }

    #[tokio::test]
    async fn test_exhaustion_is_none() {
        let (page, scope) = card_page().await;
        let strategies = vec![css(".nope"), pattern(r"R\$\s*\d+", None, 0)];
        assert_eq!(resolve(&page, scope, &strategies).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_attribute_and_pattern_strategies() {
        let (page, scope) = card_page().await;

        let link = Strategy::Css { selector: Some("a.go".into()), attr: Some("href".into()) };
        let found = resolve(&page, scope, &[link]).await.unwrap().unwrap();
        assert_eq!(found.value, "/delivery/pizza-place");

        let km = pattern(r"(\d+,\d+)\s*km", Some("p"), 1);
        let found = resolve(&page, scope, &[km]).await.unwrap().unwrap();
        assert_eq!(found.value, "1,2");
    }

    #[tokio::test]
    async fn test_find_visible_skips_hidden() {
        let page = SnapshotPage::single(CARD);
        page.navigate("x", WaitStrategy::Load).await.unwrap();

        let more = pattern(r"(?i)carregar mais", Some("button"), 0);
        assert_eq!(find_visible(&page, Scope::Page, &[more]).await.unwrap(), None);

        let more = pattern(r"(?i)ver mais", Some("button"), 0);
        assert!(find_visible(&page, Scope::Page, &[more]).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_resolve_elements_uses_first_non_empty() {
        let page = SnapshotPage::single(CARD);
        page.navigate("x", WaitStrategy::Load).await.unwrap();

        let (found, source) =
            resolve_elements(&page, Scope::Page, &[css(".nothing"), css("button")])
                .await
                .unwrap()
                .unwrap();
        assert_eq!(found.len(), 2);
        assert_eq!(source, "css `button`");
    }

    /// Page whose queries for one selector always fail with a detached handle.
    struct FlakySelectorPage {
        inner: SnapshotPage,
        broken: &'static str,
        failures: AtomicU32,
    }

    #[async_trait]
    impl PageDriver for FlakySelectorPage {
        async fn navigate(&self, url: &str, wait: WaitStrategy) -> Result<(), PageError> {
            self.inner.navigate(url, wait).await
        }
        async fn query_selector(
            &self,
            scope: Scope,
            selector: &str,
        ) -> Result<Option<ElementHandle>, PageError> {
            if selector == self.broken {
                self.failures.fetch_add(1, Ordering::SeqCst);
                return Err(PageError::Detached);
            }
            self.inner.query_selector(scope, selector).await
        }
        async fn query_selector_all(
            &self,
            scope: Scope,
            selector: &str,
        ) -> Result<Vec<ElementHandle>, PageError> {
            self.inner.query_selector_all(scope, selector).await
        }
        async fn text(&self, element: ElementHandle) -> Result<String, PageError> {
            self.inner.text(element).await
        }
        async fn attribute(
            &self,
            element: ElementHandle,
            name: &str,
        ) -> Result<Option<String>, PageError> {
            self.inner.attribute(element, name).await
        }
        async fn is_visible(&self, element: ElementHandle) -> Result<bool, PageError> {
            self.inner.is_visible(element).await
        }
        async fn click(&self, element: ElementHandle) -> Result<(), PageError> {
            self.inner.click(element).await
        }
        async fn fill(&self, element: ElementHandle, text: &str) -> Result<(), PageError> {
            self.inner.fill(element, text).await
        }
        async fn press_key(&self, key: &str) -> Result<(), PageError> {
            self.inner.press_key(key).await
        }
        async fn scroll_to_bottom(&self) -> Result<(), PageError> {
            self.inner.scroll_to_bottom().await
        }
        async fn scroll_metrics(&self) -> Result<crate::page::ScrollMetrics, PageError> {
            self.inner.scroll_metrics().await
        }
        async fn release_handles(&self) {
            self.inner.release_handles().await
        }
        async fn screenshot(&self, path: &Path) -> Result<(), PageError> {
            self.inner.screenshot(path).await
        }
        async fn close(&self) -> Result<(), PageError> {
            self.inner.close().await
        }
    }

    #[tokio::test]
    async fn test_transient_error_does_not_abort_cascade() {
        let page = FlakySelectorPage {
            inner: SnapshotPage::single(CARD),
            broken: "h3",
            failures: AtomicU32::new(0),
        };
        page.navigate("x", WaitStrategy::Load).await.unwrap();

        let found = resolve(&page, Scope::Page, &[css("h3"), css("p.info")]).await.unwrap();
        assert_eq!(found.unwrap().source, "css `p.info`");
        assert_eq!(page.failures.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_closed_page_is_an_error() {
        let page = SnapshotPage::single(CARD);
        page.navigate("x", WaitStrategy::Load).await.unwrap();
        page.close().await.unwrap();

        let err = resolve(&page, Scope::Page, &[css("h3")]).await.unwrap_err();
        assert!(matches!(err, PageError::Closed));
    }

    #[tokio::test]
    async fn test_wait_for_visible_times_out() {
        let page = SnapshotPage::single(CARD);
        page.navigate("x", WaitStrategy::Load).await.unwrap();

        let err = wait_for_visible(&page, Scope::Page, &[css("input")], Duration::from_millis(10))
            .await
            .unwrap_err();
        assert!(matches!(err, PageError::Timeout { .. }));
    }
}
