//! Page-automation seam: everything the pipeline needs from a browser.
//!
//! The extraction code only talks to [`PageDriver`], so the live Chrome
//! driver and the offline HTML snapshot driver are interchangeable.

#[cfg(feature = "browser")]
pub mod chrome;
pub mod snapshot;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use thiserror::Error;
use tokio::time::Instant;
use tracing::trace;

#[cfg(feature = "browser")]
pub use chrome::ChromePage;
pub use snapshot::SnapshotPage;

/// Errors raised by the page-automation channel.
#[derive(Debug, Error)]
pub enum PageError {
    #[error("timed out after {timeout_ms}ms waiting for {what}")]
    Timeout { what: String, timeout_ms: u64 },

    #[error("no element matches `{0}`")]
    NotFound(String),

    #[error("element handle is detached from the current document")]
    Detached,

    #[error("navigation to {url} failed: {reason}")]
    Navigation { url: String, reason: String },

    #[error("invalid selector `{0}`")]
    InvalidSelector(String),

    #[error("script evaluation failed: {0}")]
    Script(String),

    #[error("browser channel is closed")]
    Closed,

    #[error("browser protocol error: {0}")]
    Protocol(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl PageError {
    /// Transient errors are retried or skipped at the smallest scope; the
    /// rest are surfaced to the caller.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            PageError::Timeout { .. }
                | PageError::NotFound(_)
                | PageError::Detached
                | PageError::Navigation { .. }
                | PageError::Script(_)
                | PageError::Protocol(_)
        )
    }
}

/// Opaque reference to an element of the current document.
///
/// `generation` changes whenever the document is replaced, so handles taken
/// before a navigation or re-render resolve to [`PageError::Detached`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ElementHandle {
    pub generation: u64,
    pub index: usize,
}

/// Where a query starts from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scope {
    Page,
    Element(ElementHandle),
}

/// How long `navigate` waits before handing control back.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WaitStrategy {
    #[default]
    DomContentLoaded,
    Load,
    NetworkIdle,
}

/// Scroll geometry of the page's scrolling container.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct ScrollMetrics {
    /// Total scrollable height.
    pub scroll_height: f64,
    /// Current scroll offset from the top.
    pub scroll_top: f64,
    /// Visible viewport height.
    pub viewport_height: f64,
}

impl ScrollMetrics {
    /// Fraction of the content that has been scrolled past the bottom of
    /// the viewport (1.0 = at the bottom).
    pub fn scrolled_ratio(&self) -> f64 {
        if self.scroll_height <= 0.0 {
            return 1.0;
        }
        ((self.scroll_top + self.viewport_height) / self.scroll_height).min(1.0)
    }

    /// True when the whole document fits in the viewport (with a small slack).
    pub fn fits_viewport(&self) -> bool {
        self.scroll_height <= self.viewport_height * 1.05
    }
}

/// Capability surface the extraction pipeline consumes.
///
/// Every call is expected to fail with a timeout-kind error after a bounded
/// wait; none of them may block indefinitely.
#[async_trait]
pub trait PageDriver: Send + Sync {
    /// Loads `url` and waits according to `wait`.
    async fn navigate(&self, url: &str, wait: WaitStrategy) -> Result<(), PageError>;

    /// First element matching `selector` under `scope`.
    async fn query_selector(
        &self,
        scope: Scope,
        selector: &str,
    ) -> Result<Option<ElementHandle>, PageError>;

    /// All elements matching `selector` under `scope`, in document order.
    async fn query_selector_all(
        &self,
        scope: Scope,
        selector: &str,
    ) -> Result<Vec<ElementHandle>, PageError>;

    /// Rendered text of an element.
    async fn text(&self, element: ElementHandle) -> Result<String, PageError>;

    /// Attribute value of an element, if present.
    async fn attribute(
        &self,
        element: ElementHandle,
        name: &str,
    ) -> Result<Option<String>, PageError>;

    /// Whether the element is rendered with a non-empty box.
    async fn is_visible(&self, element: ElementHandle) -> Result<bool, PageError>;

    async fn click(&self, element: ElementHandle) -> Result<(), PageError>;

    /// Replaces the value of an input element with `text`.
    async fn fill(&self, element: ElementHandle, text: &str) -> Result<(), PageError>;

    /// Sends a key press to the focused element.
    async fn press_key(&self, key: &str) -> Result<(), PageError>;

    async fn scroll_to_bottom(&self) -> Result<(), PageError>;

    async fn scroll_metrics(&self) -> Result<ScrollMetrics, PageError>;

    /// Drops every handle handed out so far; they resolve to
    /// [`PageError::Detached`] afterwards. Called before each extraction pass
    /// so a long scroll run does not accumulate element references.
    async fn release_handles(&self);

    /// Diagnostic capture, only used on unrecoverable failures.
    async fn screenshot(&self, path: &Path) -> Result<(), PageError>;

    /// Releases the underlying browser resource. Idempotent.
    async fn close(&self) -> Result<(), PageError>;
}

/// Polls until `selector` appears under `scope` or `timeout` elapses.
pub async fn wait_for(
    page: &dyn PageDriver,
    scope: Scope,
    selector: &str,
    timeout: Duration,
) -> Result<ElementHandle, PageError> {
    let deadline = Instant::now() + timeout;
    let poll = Duration::from_millis(100).min(timeout.max(Duration::from_millis(1)));

    loop {
        match page.query_selector(scope, selector).await {
            Ok(Some(handle)) => return Ok(handle),
            Ok(None) => {}
            Err(e) if e.is_transient() => trace!("wait_for `{}`: {}", selector, e),
            Err(e) => return Err(e),
        }

        if Instant::now() >= deadline {
            return Err(PageError::Timeout {
                what: format!("selector `{}`", selector),
                timeout_ms: timeout.as_millis() as u64,
            });
        }
        tokio::time::sleep(poll).await;
    }
}

/// Returns the first visible element matching any selector in `selectors`.
///
/// Query errors on a single selector are skipped.
pub async fn first_visible(
    page: &dyn PageDriver,
    scope: Scope,
    selectors: &[String],
) -> Option<ElementHandle> {
    for selector in selectors {
        let Ok(handles) = page.query_selector_all(scope, selector).await else {
            continue;
        };
        for handle in handles {
            if page.is_visible(handle).await.unwrap_or(false) {
                return Some(handle);
            }
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scrolled_ratio() {
        let m = ScrollMetrics { scroll_height: 1000.0, scroll_top: 200.0, viewport_height: 800.0 };
        assert_eq!(m.scrolled_ratio(), 1.0);

        let m = ScrollMetrics { scroll_height: 4000.0, scroll_top: 1000.0, viewport_height: 1000.0 };
        assert_eq!(m.scrolled_ratio(), 0.5);

        let m = ScrollMetrics::default();
        assert_eq!(m.scrolled_ratio(), 1.0);
    }

    #[test]
    fn test_fits_viewport() {
        let short = ScrollMetrics { scroll_height: 820.0, scroll_top: 0.0, viewport_height: 800.0 };
        assert!(short.fits_viewport());

        let long = ScrollMetrics { scroll_height: 3000.0, scroll_top: 0.0, viewport_height: 800.0 };
        assert!(!long.fits_viewport());
    }

    #[test]
    fn test_transient_classification() {
        assert!(PageError::Detached.is_transient());
        assert!(PageError::NotFound("x".into()).is_transient());
        assert!(PageError::Timeout { what: "x".into(), timeout_ms: 1 }.is_transient());
        assert!(!PageError::Closed.is_transient());
        assert!(!PageError::InvalidSelector("[".into()).is_transient());
    }

    #[tokio::test]
    async fn test_wait_for_times_out() {
        let page = SnapshotPage::single("<html><body><p>hi</p></body></html>");
        page.navigate("about:blank", WaitStrategy::Load).await.unwrap();

        let err = wait_for(&page, Scope::Page, "div.missing", Duration::from_millis(20))
            .await
            .unwrap_err();
        assert!(matches!(err, PageError::Timeout { .. }));
    }

    #[tokio::test]
    async fn test_wait_for_finds_element() {
        let page = SnapshotPage::single("<html><body><p class='x'>hi</p></body></html>");
        page.navigate("about:blank", WaitStrategy::Load).await.unwrap();

        let handle =
            wait_for(&page, Scope::Page, "p.x", Duration::from_millis(50)).await.unwrap();
        assert_eq!(page.text(handle).await.unwrap(), "hi");
    }
}
