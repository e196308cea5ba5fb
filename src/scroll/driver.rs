//! Load/extract loop for lazily rendered lists.

use super::convergence::{
    trailing_repeats, ConvergenceDetector, ConvergenceReason, ConvergenceSettings, Observation,
    Verdict,
};
use crate::config::Config;
use crate::dedup::natural_key;
use crate::extract::cascade::find_visible;
use crate::extract::{CandidateRecord, Controls, FieldExtractor, ParentContext};
use crate::page::{PageDriver, PageError, Scope, ScrollMetrics};
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::time::Duration;
use tracing::{debug, trace, warn};

/// Timing and bounds for one scroll run.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ScrollSettings {
    pub settle: Duration,
    pub loading_wait: Duration,
    pub max_attempts: u32,
    pub convergence: ConvergenceSettings,
}

impl ScrollSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            settle: Duration::from_millis(config.settle_ms),
            loading_wait: Duration::from_millis(config.loading_wait_ms),
            max_attempts: config.max_scroll_attempts(),
            convergence: config.convergence,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ScrollState {
    Idle,
    Inspecting,
    LoadMore,
    Scrolling,
    Extracting,
    Converged,
    AttemptCapReached,
}

impl fmt::Display for ScrollState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ScrollState::Idle => "idle",
            ScrollState::Inspecting => "inspecting",
            ScrollState::LoadMore => "load-more",
            ScrollState::Scrolling => "scrolling",
            ScrollState::Extracting => "extracting",
            ScrollState::Converged => "converged",
            ScrollState::AttemptCapReached => "attempt-cap-reached",
        };
        write!(f, "{}", name)
    }
}

/// What a scroll run produced.
#[derive(Debug)]
pub struct ScrollOutcome {
    /// Candidates in first-seen order, one per distinct listing.
    pub candidates: Vec<CandidateRecord>,
    /// Load attempts made after the initial inspection.
    pub attempts: u32,
    /// Attempts whose load action or extraction pass failed.
    pub errors: u32,
    pub state: ScrollState,
    /// `None` when the run was aborted.
    pub reason: Option<ConvergenceReason>,
    /// Non-transient error that stopped the run early. `candidates` still
    /// holds everything collected before it.
    pub aborted: Option<PageError>,
}

/// Drives one list to convergence.
pub struct ScrollDriver<'a> {
    page: &'a dyn PageDriver,
    extractor: &'a FieldExtractor,
    controls: &'a Controls,
    settings: ScrollSettings,
    state: ScrollState,
    /// Highest number of times each key appeared within one pass.
    seen: HashMap<String, usize>,
    candidates: Vec<CandidateRecord>,
}

impl<'a> ScrollDriver<'a> {
    pub fn new(
        page: &'a dyn PageDriver,
        extractor: &'a FieldExtractor,
        controls: &'a Controls,
        settings: ScrollSettings,
    ) -> Self {
        Self {
            page,
            extractor,
            controls,
            settings,
            state: ScrollState::Idle,
            seen: HashMap::new(),
            candidates: Vec::new(),
        }
    }

    pub fn state(&self) -> ScrollState {
        self.state
    }

    fn enter(&mut self, state: ScrollState) {
        trace!("scroll: {} -> {}", self.state, state);
        self.state = state;
    }

    /// Merges a pass into the accumulated set. Returns (new items, trailing repeats).
    ///
    /// A key listed twice in one pass is kept twice, so in-page duplicates
    /// reach the dedup gate; passes that only re-render add nothing.
    fn absorb(&mut self, pass: Vec<CandidateRecord>) -> (usize, usize) {
        let keys: Vec<String> = pass.iter().map(natural_key).collect();
        let before: HashSet<String> = self.seen.keys().cloned().collect();
        let repeats = trailing_repeats(&keys, &before, self.settings.convergence.repeat_window);

        let mut in_pass: HashMap<&str, usize> = HashMap::new();
        let mut new_items = 0;
        for (key, record) in keys.iter().zip(pass) {
            let count = in_pass.entry(key.as_str()).or_insert(0);
            *count += 1;
            let known = self.seen.entry(key.clone()).or_insert(0);
            if *count > *known {
                *known = *count;
                self.candidates.push(record);
                new_items += 1;
            }
        }
        (new_items, repeats)
    }

    async fn control_visible(&self, strategies: &[crate::extract::Strategy]) -> bool {
        match find_visible(self.page, Scope::Page, strategies).await {
            Ok(found) => found.is_some(),
            Err(e) => {
                debug!("control lookup failed: {}", e);
                false
            }
        }
    }

    async fn metrics(&self) -> Option<ScrollMetrics> {
        match self.page.scroll_metrics().await {
            Ok(m) => Some(m),
            Err(e) => {
                debug!("scroll metrics unavailable: {}", e);
                None
            }
        }
    }

    /// One load action: click "load more" when visible, otherwise scroll.
    async fn load(&mut self) -> Result<(), PageError> {
        let button = find_visible(self.page, Scope::Page, &self.controls.load_more).await?;
        match button {
            Some(button) => {
                self.enter(ScrollState::LoadMore);
                self.page.click(button).await
            }
            None => {
                self.enter(ScrollState::Scrolling);
                self.page.scroll_to_bottom().await
            }
        }
    }

    /// Load action, settle, extraction pass.
    async fn attempt(&mut self, parent: &ParentContext) -> Result<(usize, usize), PageError> {
        self.load().await?;
        tokio::time::sleep(self.settings.settle).await;

        self.enter(ScrollState::Extracting);
        let pass = self.extractor.extract_visible(self.page, parent).await?;
        Ok(self.absorb(pass))
    }

    fn finish(
        &mut self,
        detector: &ConvergenceDetector,
        errors: u32,
        reason: Option<ConvergenceReason>,
        aborted: Option<PageError>,
    ) -> ScrollOutcome {
        match reason {
            Some(ConvergenceReason::AttemptCap) => self.enter(ScrollState::AttemptCapReached),
            Some(_) => self.enter(ScrollState::Converged),
            None => {}
        }

        ScrollOutcome {
            candidates: std::mem::take(&mut self.candidates),
            attempts: detector.attempts(),
            errors,
            state: self.state,
            reason,
            aborted,
        }
    }

    /// Inspects the page, then runs the load loop on the current page.
    pub async fn run(&mut self, parent: &ParentContext) -> ScrollOutcome {
        let kind = self.extractor.kind();
        let mut detector = ConvergenceDetector::new(self.settings.convergence);
        let mut errors = 0u32;

        self.enter(ScrollState::Inspecting);
        let metrics = self.metrics().await;
        let load_more = self.control_visible(&self.controls.load_more).await;

        self.enter(ScrollState::Extracting);
        match self.extractor.extract_visible(self.page, parent).await {
            Ok(pass) => {
                self.absorb(pass);
            }
            Err(e) if e.is_transient() => {
                warn!("Initial {} pass failed: {}", kind, e);
                errors += 1;
            }
            Err(e) => return self.finish(&detector, errors + 1, None, Some(e)),
        }

        if !load_more && metrics.is_some_and(|m| m.fits_viewport()) {
            debug!("{} list fits the viewport; no scrolling needed", kind);
            return self.finish(&detector, errors, Some(ConvergenceReason::ShortPage), None);
        }
        if let Some(m) = metrics {
            detector.baseline(m);
        }

        loop {
            let attempt = detector.attempts() + 1;
            let (new_items, tail_repeats) = match self.attempt(parent).await {
                Ok(counts) => counts,
                Err(e) if e.is_transient() => {
                    warn!("Scroll attempt {} failed: {}", attempt, e);
                    errors += 1;
                    (0, 0)
                }
                Err(e) => return self.finish(&detector, errors + 1, None, Some(e)),
            };

            let obs = Observation {
                load_more_visible: self.control_visible(&self.controls.load_more).await,
                loading_visible: self.control_visible(&self.controls.loading).await,
                metrics: self.metrics().await,
                new_items,
                tail_repeats,
            };
            let verdict = detector.observe(&obs);
            debug!(
                "Attempt {}: {} new, {} repeated, {} total -> {:?}",
                attempt,
                new_items,
                tail_repeats,
                self.candidates.len(),
                verdict
            );

            if let Verdict::Converged(reason) = verdict {
                return self.finish(&detector, errors, Some(reason), None);
            }
            if detector.attempts() >= self.settings.max_attempts {
                debug!("{} list still loading after {} attempts", kind, detector.attempts());
                return self.finish(&detector, errors, Some(ConvergenceReason::AttemptCap), None);
            }
            if verdict == Verdict::Wait {
                tokio::time::sleep(self.settings.loading_wait).await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::extract::{RecordKind, SelectorCatalog};
    use crate::page::{SnapshotPage, WaitStrategy};

    const BASE: &str = "https://www.ifood.com.br";

    fn card(name: &str) -> String {
        format!(
            r#"<a class="merchant-v2__link" href="/delivery/x/{slug}">
                 <div class="merchant-v2__header"><span>{name}</span></div>
                 <div class="merchant-v2__info">4,5 • Pizza • 1,0 km</div>
               </a>"#,
            slug = name.to_lowercase().replace(' ', "-"),
            name = name
        )
    }

    fn frame(names: &[&str], button: bool) -> String {
        let cards: String = names.iter().map(|n| card(n)).collect();
        let more = if button { "<button class=\"more\">Ver mais</button>" } else { "" };
        format!("<html><body><main>{}</main>{}</body></html>", cards, more)
    }

    fn settings(max_attempts: u32) -> ScrollSettings {
        ScrollSettings {
            settle: Duration::ZERO,
            loading_wait: Duration::ZERO,
            max_attempts,
            convergence: ConvergenceSettings::default(),
        }
    }

    async fn run(page: &SnapshotPage, max_attempts: u32) -> ScrollOutcome {
        page.navigate(BASE, WaitStrategy::Load).await.unwrap();
        let catalog = SelectorCatalog::embedded().unwrap();
        let extractor =
            FieldExtractor::new(catalog.schema(RecordKind::Merchant).clone(), BASE);
        let mut driver = ScrollDriver::new(page, &extractor, &catalog.controls, settings(max_attempts));
        driver.run(&ParentContext::city("X")).await
    }

    fn names(outcome: &ScrollOutcome) -> Vec<&str> {
        outcome.candidates.iter().map(|c| c.name()).collect()
    }

    #[tokio::test]
    async fn test_short_page_skips_scrolling() {
        let page = SnapshotPage::single(frame(&["Pizza Place", "Burger Place"], false));
        let outcome = run(&page, 10).await;

        assert_eq!(outcome.reason, Some(ConvergenceReason::ShortPage));
        assert_eq!(outcome.state, ScrollState::Converged);
        assert_eq!(outcome.attempts, 0);
        assert_eq!(names(&outcome), vec!["Pizza Place", "Burger Place"]);
        assert!(!page.actions().contains(&"scroll".to_string()));
    }

    #[tokio::test]
    async fn test_scrolls_until_signals_agree() {
        let page = SnapshotPage::new().with_any(vec![
            frame(&["A one", "B two"], false),
            frame(&["A one", "B two", "C three", "D four"], false),
            frame(&["A one", "B two", "C three", "D four", "E five", "F six"], false),
        ]);
        let outcome = run(&page, 20).await;

        assert_eq!(outcome.reason, Some(ConvergenceReason::Signals));
        assert_eq!(outcome.attempts, 3);
        assert_eq!(outcome.errors, 0);
        assert_eq!(outcome.candidates.len(), 6);
        assert_eq!(names(&outcome)[4], "E five");
    }

    #[tokio::test]
    async fn test_clicks_load_more_while_visible() {
        let page = SnapshotPage::new()
            .with_any(vec![
                frame(&["A one"], true),
                frame(&["A one", "B two"], true),
                frame(&["A one", "B two", "C three"], false),
            ])
            .advance_on_click("button.more")
            .unwrap();
        let outcome = run(&page, 20).await;

        let clicks = page.actions().iter().filter(|a| a.starts_with("click:")).count();
        assert_eq!(clicks, 2);
        assert_eq!(outcome.candidates.len(), 3);
        assert_eq!(outcome.state, ScrollState::Converged);
    }

    #[tokio::test]
    async fn test_load_more_never_converges_before_cap() {
        // The button never goes away and clicking it loads nothing.
        let page = SnapshotPage::single(frame(&["A one"], true));
        let outcome = run(&page, 4).await;

        assert_eq!(outcome.reason, Some(ConvergenceReason::AttemptCap));
        assert_eq!(outcome.state, ScrollState::AttemptCapReached);
        assert_eq!(outcome.attempts, 4);
        assert_eq!(outcome.candidates.len(), 1);
    }

    #[tokio::test]
    async fn test_closed_page_aborts_with_partial_results() {
        let page = SnapshotPage::new().with_any(vec![
            frame(&["A one", "B two"], false),
            frame(&["A one", "B two", "C three"], false),
        ]);
        page.navigate(BASE, WaitStrategy::Load).await.unwrap();
        let catalog = SelectorCatalog::embedded().unwrap();
        let extractor =
            FieldExtractor::new(catalog.schema(RecordKind::Merchant).clone(), BASE);
        let mut driver = ScrollDriver::new(&page, &extractor, &catalog.controls, settings(10));

        // Inspection and first pass happen on the open page; then the browser goes away.
        let parent = ParentContext::city("X");
        driver.enter(ScrollState::Inspecting);
        let first = extractor.extract_visible(&page, &parent).await.unwrap();
        driver.absorb(first);
        page.close().await.unwrap();

        let outcome = driver.run(&parent).await;
        assert!(matches!(outcome.aborted, Some(PageError::Closed)));
        assert_eq!(outcome.reason, None);
        assert_eq!(outcome.candidates.len(), 2);
    }
}
