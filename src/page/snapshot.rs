//! Offline page driver over saved HTML frames.
//!
//! Each URL maps to an ordered list of frames. `scroll_to_bottom` (or a click
//! on the configured advance selector) swaps in the next frame, which is how
//! a lazily loaded list looks to the pipeline. Scroll metrics are synthesized
//! from the frame position.

use super::{ElementHandle, PageDriver, PageError, Scope, ScrollMetrics, WaitStrategy};
use async_trait::async_trait;
use scraper::{ElementRef, Html, Selector};
use std::collections::HashMap;
use std::path::Path;
use std::sync::{LazyLock, Mutex};
use tracing::debug;

static ANY: LazyLock<Selector> = LazyLock::new(|| Selector::parse("*").unwrap());

const WILDCARD: &str = "*";
const DEFAULT_VIEWPORT: f64 = 900.0;

#[derive(Debug, Default)]
struct SnapshotState {
    url: Option<String>,
    frame: usize,
    generation: u64,
    scroll_top: f64,
    closed: bool,
    actions: Vec<String>,
}

/// Replays saved HTML as if it were a live page.
pub struct SnapshotPage {
    frames: HashMap<String, Vec<String>>,
    advance_on_click: Option<Selector>,
    viewport_height: f64,
    state: Mutex<SnapshotState>,
}

impl Default for SnapshotPage {
    fn default() -> Self {
        Self::new()
    }
}

impl SnapshotPage {
    /// Creates a driver with no frames registered.
    pub fn new() -> Self {
        Self {
            frames: HashMap::new(),
            advance_on_click: None,
            viewport_height: DEFAULT_VIEWPORT,
            state: Mutex::new(SnapshotState::default()),
        }
    }

    /// A driver that serves one document for every URL.
    pub fn single(html: impl Into<String>) -> Self {
        Self::new().with_any(vec![html.into()])
    }

    /// Registers frames served for `url`.
    pub fn with_frames(mut self, url: impl Into<String>, frames: Vec<String>) -> Self {
        self.frames.insert(url.into(), frames);
        self
    }

    /// Registers frames served for any URL without its own frames.
    pub fn with_any(mut self, frames: Vec<String>) -> Self {
        self.frames.insert(WILDCARD.to_string(), frames);
        self
    }

    /// Clicking an element matching `selector` reveals the next frame.
    pub fn advance_on_click(mut self, selector: &str) -> Result<Self, PageError> {
        let parsed = Selector::parse(selector)
            .map_err(|_| PageError::InvalidSelector(selector.to_string()))?;
        self.advance_on_click = Some(parsed);
        Ok(self)
    }

    /// Loads every `*.html` file in `dir` (sorted by name) as wildcard frames.
    pub fn from_dir(dir: &Path) -> Result<Self, PageError> {
        let mut paths: Vec<_> = std::fs::read_dir(dir)?
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .filter(|p| p.extension().is_some_and(|ext| ext.eq_ignore_ascii_case("html")))
            .collect();
        paths.sort();

        if paths.is_empty() {
            return Err(PageError::Navigation {
                url: dir.display().to_string(),
                reason: "no .html frames found".to_string(),
            });
        }

        let frames = paths
            .iter()
            .map(std::fs::read_to_string)
            .collect::<Result<Vec<_>, _>>()?;
        debug!("Loaded {} snapshot frames from {}", frames.len(), dir.display());

        Ok(Self::new().with_any(frames))
    }

    /// Actions recorded so far (`click:`, `fill:`, `key:`, `scroll`).
    pub fn actions(&self) -> Vec<String> {
        self.lock().actions.clone()
    }

    /// Index of the frame currently shown.
    pub fn current_frame(&self) -> usize {
        self.lock().frame
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, SnapshotState> {
        // A poisoned lock only means a test panicked mid-call; the state is still usable.
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn frames_for(&self, url: &str) -> Option<&Vec<String>> {
        self.frames.get(url).or_else(|| self.frames.get(WILDCARD)).filter(|f| !f.is_empty())
    }

    /// Current document source and generation.
    fn current(&self) -> Result<(String, u64), PageError> {
        let state = self.lock();
        if state.closed {
            return Err(PageError::Closed);
        }
        let url = state.url.as_deref().ok_or(PageError::Detached)?;
        let frames = self.frames_for(url).ok_or(PageError::Detached)?;
        let html = frames.get(state.frame).or_else(|| frames.last()).ok_or(PageError::Detached)?;
        Ok((html.clone(), state.generation))
    }

    fn frame_count(&self) -> usize {
        let state = self.lock();
        state.url.as_deref().and_then(|u| self.frames_for(u)).map_or(0, Vec::len)
    }

    fn height_for(&self, frame: usize, total: usize) -> f64 {
        let extra = if total > 1 { 2.0 } else { 1.0 };
        self.viewport_height * (frame as f64 + extra)
    }

    fn advance(&self) -> bool {
        let total = self.frame_count();
        let mut state = self.lock();
        if state.frame + 1 < total {
            state.frame += 1;
            state.generation += 1;
            true
        } else {
            false
        }
    }

    fn record(&self, action: String) {
        self.lock().actions.push(action);
    }
}

fn parse_selector(selector: &str) -> Result<Selector, PageError> {
    Selector::parse(selector).map_err(|_| PageError::InvalidSelector(selector.to_string()))
}

fn resolve<'a>(doc: &'a Html, handle: ElementHandle) -> Result<ElementRef<'a>, PageError> {
    doc.select(&ANY).nth(handle.index).ok_or(PageError::Detached)
}

fn handle_of(doc: &Html, element: ElementRef<'_>, generation: u64) -> Option<ElementHandle> {
    doc.select(&ANY)
        .position(|e| e == element)
        .map(|index| ElementHandle { generation, index })
}

/// Approximates `innerText`: trimmed text nodes joined by newlines.
fn inner_text(element: ElementRef<'_>) -> String {
    element.text().map(str::trim).filter(|t| !t.is_empty()).collect::<Vec<_>>().join("\n")
}

fn is_hidden(element: ElementRef<'_>) -> bool {
    let value = element.value();
    if value.attr("hidden").is_some() || value.attr("aria-hidden") == Some("true") {
        return true;
    }
    value.attr("style").is_some_and(|style| {
        let compact: String = style.chars().filter(|c| !c.is_whitespace()).collect();
        compact.contains("display:none") || compact.contains("visibility:hidden")
    })
}

impl SnapshotPage {
    fn query(
        &self,
        scope: Scope,
        selector: &str,
        first_only: bool,
    ) -> Result<Vec<ElementHandle>, PageError> {
        let sel = parse_selector(selector)?;
        let (html, generation) = self.current()?;
        let doc = Html::parse_document(&html);

        let matches: Vec<ElementRef<'_>> = match scope {
            Scope::Page => doc.select(&sel).collect(),
            Scope::Element(handle) => {
                if handle.generation != generation {
                    return Err(PageError::Detached);
                }
                resolve(&doc, handle)?.select(&sel).collect()
            }
        };

        let limit = if first_only { 1 } else { usize::MAX };
        Ok(matches
            .into_iter()
            .take(limit)
            .filter_map(|e| handle_of(&doc, e, generation))
            .collect())
    }

    fn with_element<T>(
        &self,
        handle: ElementHandle,
        f: impl FnOnce(ElementRef<'_>) -> T,
    ) -> Result<T, PageError> {
        let (html, generation) = self.current()?;
        if handle.generation != generation {
            return Err(PageError::Detached);
        }
        let doc = Html::parse_document(&html);
        let element = resolve(&doc, handle)?;
        Ok(f(element))
    }
}

#[async_trait]
impl PageDriver for SnapshotPage {
    async fn navigate(&self, url: &str, _wait: WaitStrategy) -> Result<(), PageError> {
        if self.lock().closed {
            return Err(PageError::Closed);
        }
        if self.frames_for(url).is_none() {
            return Err(PageError::Navigation {
                url: url.to_string(),
                reason: "no snapshot registered".to_string(),
            });
        }

        let mut state = self.lock();
        state.url = Some(url.to_string());
        state.frame = 0;
        state.generation += 1;
        state.scroll_top = 0.0;
        state.actions.push(format!("navigate:{}", url));
        Ok(())
    }

    async fn query_selector(
        &self,
        scope: Scope,
        selector: &str,
    ) -> Result<Option<ElementHandle>, PageError> {
        Ok(self.query(scope, selector, true)?.into_iter().next())
    }

    async fn query_selector_all(
        &self,
        scope: Scope,
        selector: &str,
    ) -> Result<Vec<ElementHandle>, PageError> {
        self.query(scope, selector, false)
    }

    async fn text(&self, element: ElementHandle) -> Result<String, PageError> {
        self.with_element(element, inner_text)
    }

    async fn attribute(
        &self,
        element: ElementHandle,
        name: &str,
    ) -> Result<Option<String>, PageError> {
        self.with_element(element, |e| e.value().attr(name).map(String::from))
    }

    async fn is_visible(&self, element: ElementHandle) -> Result<bool, PageError> {
        self.with_element(element, |e| {
            if is_hidden(e) {
                return false;
            }
            !e.ancestors().filter_map(ElementRef::wrap).any(is_hidden)
        })
    }

    async fn click(&self, element: ElementHandle) -> Result<(), PageError> {
        let advances = self.with_element(element, |e| {
            self.advance_on_click.as_ref().is_some_and(|sel| sel.matches(&e))
        })?;
        self.record(format!("click:{}", element.index));
        if advances {
            self.advance();
        }
        Ok(())
    }

    async fn fill(&self, element: ElementHandle, text: &str) -> Result<(), PageError> {
        self.with_element(element, |_| ())?;
        self.record(format!("fill:{}", text));
        Ok(())
    }

    async fn press_key(&self, key: &str) -> Result<(), PageError> {
        self.current()?;
        self.record(format!("key:{}", key));
        Ok(())
    }

    async fn scroll_to_bottom(&self) -> Result<(), PageError> {
        self.current()?;
        let total = self.frame_count();
        {
            // Land at the bottom of what is rendered now; the next frame then
            // grows the page below the viewport.
            let mut state = self.lock();
            state.scroll_top = self.height_for(state.frame, total) - self.viewport_height;
            state.actions.push("scroll".to_string());
        }
        self.advance();
        Ok(())
    }

    async fn scroll_metrics(&self) -> Result<ScrollMetrics, PageError> {
        self.current()?;
        let total = self.frame_count();
        let state = self.lock();
        Ok(ScrollMetrics {
            scroll_height: self.height_for(state.frame, total),
            scroll_top: state.scroll_top,
            viewport_height: self.viewport_height,
        })
    }

    async fn release_handles(&self) {
        self.lock().generation += 1;
    }

    async fn screenshot(&self, path: &Path) -> Result<(), PageError> {
        let (html, _) = self.current()?;
        tokio::fs::write(path, html).await?;
        Ok(())
    }

    async fn close(&self) -> Result<(), PageError> {
        self.lock().closed = true;
        Ok(())
    }
}
