//! One extraction session: location, navigation, scroll-driven extraction,
//! persistence and the final report.
//!
//! A session runs its stages strictly in order. Counters live on the session
//! itself, so a report can be produced even when `run` was cut short by an
//! interrupt or a scope-fatal error.

pub mod location;
pub mod pacing;
pub mod report;

pub use pacing::Pacer;
pub use report::{SessionReport, SessionStats, StageTiming};

use crate::config::Config;
use crate::dedup::{Admission, DedupGate};
use crate::extract::{
    parse, CandidateRecord, FieldExtractor, ParentContext, RecordKind, SelectorCatalog,
};
use crate::page::{PageDriver, PageError};
use crate::retry::RetryPolicy;
use crate::scroll::{ScrollDriver, ScrollSettings};
use crate::store::{InsertOutcome, RecordStore, StoreError};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::fmt;
use std::path::PathBuf;
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, info, warn};

/// What a session extracts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Target {
    /// Categories on the home page.
    Categories,
    /// Merchants listed under one category. Without a URL the stored link
    /// (or the conventional category path) is used.
    Category { name: String, url: Option<String> },
    /// Merchants of every stored category of the city, one after another.
    AllCategories,
    /// Menu items of one merchant.
    Merchant { name: String, url: String },
}

impl Target {
    pub fn kind(&self) -> RecordKind {
        match self {
            Target::Categories => RecordKind::Category,
            Target::Category { .. } | Target::AllCategories => RecordKind::Merchant,
            Target::Merchant { .. } => RecordKind::MenuItem,
        }
    }
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Target::Categories => write!(f, "categories"),
            Target::Category { name, .. } => write!(f, "category:{}", name),
            Target::AllCategories => write!(f, "all-categories"),
            Target::Merchant { name, .. } => write!(f, "merchant:{}", name),
        }
    }
}

/// Whether the session sets the delivery location first.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LocationMode {
    Configure,
    /// For offline replays, where there is no address form.
    Skip,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Init,
    LocationConfigured,
    CategoryNavigated,
    Extracted,
    Persisted,
    Reported,
    Failed,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SessionState::Init => "init",
            SessionState::LocationConfigured => "location_configured",
            SessionState::CategoryNavigated => "category_navigated",
            SessionState::Extracted => "extracted",
            SessionState::Persisted => "persisted",
            SessionState::Reported => "reported",
            SessionState::Failed => "failed",
        };
        write!(f, "{}", name)
    }
}

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("could not set the delivery location to {city}: {source}")]
    Location {
        city: String,
        #[source]
        source: PageError,
    },

    #[error("could not open {url}: {source}")]
    Navigation {
        url: String,
        #[source]
        source: PageError,
    },

    #[error("no categories stored for {0}; run `categories` first")]
    NoCategories(String),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("browser failed: {0}")]
    Page(#[from] PageError),

    #[error("interrupted")]
    Interrupted,
}

/// One page worth of extraction.
#[derive(Debug, Clone)]
struct Listing {
    /// `None` stays on the current page.
    url: Option<String>,
    parent: ParentContext,
    label: String,
}

/// Collaborators and settings for a session.
pub struct ExtractionSession<'a> {
    config: &'a Config,
    catalog: &'a SelectorCatalog,
    page: &'a dyn PageDriver,
    store: &'a dyn RecordStore,
    target: Target,
    location: LocationMode,
    state: SessionState,
    stats: SessionStats,
    stages: Vec<StageTiming>,
    started: Instant,
    started_at: DateTime<Utc>,
    stage_mark: Instant,
    pacer: Pacer,
    inserted: Vec<CandidateRecord>,
}

impl<'a> ExtractionSession<'a> {
    pub fn new(
        config: &'a Config,
        catalog: &'a SelectorCatalog,
        page: &'a dyn PageDriver,
        store: &'a dyn RecordStore,
        target: Target,
    ) -> Self {
        let now = Instant::now();
        Self {
            config,
            catalog,
            page,
            store,
            target,
            location: LocationMode::Configure,
            state: SessionState::Init,
            stats: SessionStats::default(),
            stages: Vec::new(),
            started: now,
            started_at: Utc::now(),
            stage_mark: now,
            pacer: Pacer::from_config(config),
            inserted: Vec::new(),
        }
    }

    pub fn with_location(mut self, mode: LocationMode) -> Self {
        self.location = mode;
        self
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn stats(&self) -> SessionStats {
        self.stats
    }

    /// Records inserted so far, in insertion order.
    pub fn inserted(&self) -> &[CandidateRecord] {
        &self.inserted
    }

    fn advance(&mut self, state: SessionState) {
        let now = Instant::now();
        let seconds = now.duration_since(self.stage_mark).as_secs_f64();
        self.stage_mark = now;

        match self.stages.iter_mut().find(|s| s.state == state) {
            Some(timing) => timing.seconds += seconds,
            None => self.stages.push(StageTiming { state, seconds }),
        }
        debug!("session: {} -> {}", self.state, state);
        self.state = state;
    }

    fn extractor(&self, kind: RecordKind) -> FieldExtractor {
        let extractor =
            FieldExtractor::new(self.catalog.schema(kind).clone(), self.config.base_url.clone());
        if kind == RecordKind::Category {
            extractor.with_blocklist(&self.config.category_blocklist)
        } else {
            extractor
        }
    }

    fn category_url(&self, name: &str, stored: Option<&str>) -> String {
        stored
            .map(str::to_string)
            .unwrap_or_else(|| parse::category_fallback_link(&self.config.base_url, name))
    }

    /// Resolves the target into the pages to visit.
    fn plan(&self) -> Result<Vec<Listing>, SessionError> {
        let city = self.config.city.as_str();
        let listings = match &self.target {
            Target::Categories => {
                // After location setup the browser is already on the home page.
                let url = match self.location {
                    LocationMode::Configure => None,
                    LocationMode::Skip => Some(self.config.base_url.clone()),
                };
                vec![Listing {
                    url,
                    parent: ParentContext::city(city),
                    label: self.target.to_string(),
                }]
            }
            Target::Category { name, url } => {
                let url = match url {
                    Some(url) => url.clone(),
                    None => {
                        let known = self.store.known_categories(city)?;
                        let wanted = name.to_lowercase();
                        let stored = known.iter().find(|c| c.name.to_lowercase() == wanted);
                        self.category_url(name, stored.and_then(|c| c.link.as_deref()))
                    }
                };
                vec![Listing {
                    url: Some(url),
                    parent: ParentContext::city(city).with_category(name.clone()),
                    label: self.target.to_string(),
                }]
            }
            Target::AllCategories => {
                let known = self.store.known_categories(city)?;
                if known.is_empty() {
                    return Err(SessionError::NoCategories(city.to_string()));
                }
                known
                    .iter()
                    .map(|c| Listing {
                        url: Some(self.category_url(&c.name, c.link.as_deref())),
                        parent: ParentContext::city(city).with_category(c.name.clone()),
                        label: format!("category:{}", c.name),
                    })
                    .collect()
            }
            Target::Merchant { name, url } => {
                let id = match self.store.merchant_id(name, city) {
                    Ok(id) => id,
                    Err(e) => {
                        warn!("Could not look up merchant '{}': {}", name, e);
                        None
                    }
                };
                vec![Listing {
                    url: Some(url.clone()),
                    parent: ParentContext::city(city).with_merchant(name.clone(), id),
                    label: self.target.to_string(),
                }]
            }
        };
        Ok(listings)
    }

    async fn navigate(&mut self, url: &str) -> Result<(), PageError> {
        self.pacer.wait().await;
        info!("Opening {}", url);

        let page = self.page;
        let wait = self.config.wait_strategy;
        let policy = RetryPolicy {
            attempt_timeout_ms: self.config.navigation_timeout_ms,
            ..self.config.retry
        };
        policy.run("navigation", |_| page.navigate(url, wait)).await
    }

    /// Saves a diagnostic capture. Best-effort.
    async fn capture(&self, label: &str) -> Option<PathBuf> {
        let dir = &self.config.screenshot_dir;
        if let Err(e) = tokio::fs::create_dir_all(dir).await {
            warn!("Could not create {}: {}", dir.display(), e);
            return None;
        }

        let slug: String = label
            .chars()
            .map(|c| if c.is_alphanumeric() { c.to_ascii_lowercase() } else { '_' })
            .collect();
        let path = dir.join(format!("{}_{}.png", slug, Utc::now().format("%Y%m%d_%H%M%S")));

        match self.page.screenshot(&path).await {
            Ok(()) => {
                info!("Saved diagnostic screenshot to {}", path.display());
                Some(path)
            }
            Err(e) => {
                warn!("Screenshot failed: {}", e);
                None
            }
        }
    }

    async fn configure_location(&mut self) -> Result<(), SessionError> {
        let base = self.config.base_url.clone();
        if let Err(source) = self.navigate(&base).await {
            self.capture("navigation").await;
            return Err(SessionError::Navigation { url: base, source });
        }

        if let Err(source) =
            location::configure(self.page, self.config, &self.catalog.controls).await
        {
            self.capture("location").await;
            return Err(SessionError::Location { city: self.config.city.clone(), source });
        }

        if self.target == Target::Categories {
            let settle = Duration::from_millis(self.config.settle_ms);
            location::open_restaurants(self.page, &self.catalog.controls, settle).await;
        }
        Ok(())
    }

    /// Dedups and inserts one batch, one record at a time.
    fn persist(&mut self, batch: Vec<CandidateRecord>) {
        let store = self.store;
        let mut gate = DedupGate::new(store);
        self.stats.seen += batch.len();

        for record in batch {
            let key = match gate.admit(&record) {
                Ok(Admission::New(key)) => key,
                Ok(Admission::Duplicate(_)) => {
                    self.stats.duplicates += 1;
                    continue;
                }
                Err(e) => {
                    warn!("Lookup failed for '{}': {}", record.name(), e);
                    self.stats.errors += 1;
                    continue;
                }
            };

            match store.insert(&key, &record) {
                Ok(InsertOutcome::Inserted(_)) => {
                    self.stats.inserted += 1;
                    self.inserted.push(record);
                }
                Ok(InsertOutcome::Duplicate) => self.stats.duplicates += 1,
                Err(e) => {
                    warn!("Insert failed for '{}': {}", record.name(), e);
                    self.stats.errors += 1;
                }
            }
        }
    }

    async fn extract_listing(&mut self, listing: &Listing) -> Result<(), SessionError> {
        if let Some(url) = &listing.url {
            if let Err(source) = self.navigate(url).await {
                self.capture(&listing.label).await;
                return Err(SessionError::Navigation { url: url.clone(), source });
            }
        }
        self.advance(SessionState::CategoryNavigated);

        let kind = self.target.kind();
        let extractor = self.extractor(kind);
        let settings = ScrollSettings::from_config(self.config);
        let outcome = {
            let mut driver =
                ScrollDriver::new(self.page, &extractor, &self.catalog.controls, settings);
            driver.run(&listing.parent).await
        };
        info!(
            "{}: {} candidates after {} attempts ({})",
            listing.label,
            outcome.candidates.len(),
            outcome.attempts,
            outcome.reason.map_or_else(|| "aborted".to_string(), |r| r.to_string())
        );
        self.stats.scopes += 1;
        self.stats.scroll_attempts += outcome.attempts;
        self.stats.errors += outcome.errors as usize;
        self.advance(SessionState::Extracted);

        self.persist(outcome.candidates);
        self.advance(SessionState::Persisted);

        match outcome.aborted {
            Some(e) => Err(SessionError::Page(e)),
            None => Ok(()),
        }
    }

    /// Runs every stage. On error the session stays in the failing stage
    /// until [`finish`](Self::finish) is called.
    pub async fn run(&mut self) -> Result<(), SessionError> {
        info!("Starting {} session for {}", self.target, self.config.city);
        let listings = self.plan()?;

        if self.location == LocationMode::Configure {
            self.configure_location().await?;
        }
        self.advance(SessionState::LocationConfigured);

        let nested = listings.len() > 1;
        for listing in &listings {
            match self.extract_listing(listing).await {
                Ok(()) => {}
                Err(SessionError::Navigation { url, source }) if nested => {
                    warn!("Skipping {} ({}): {}", listing.label, url, source);
                    self.stats.errors += 1;
                }
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }

    /// Closes the session and builds the report.
    ///
    /// The session log row is written best-effort.
    pub fn finish(&mut self, result: Result<(), SessionError>) -> SessionReport {
        let failure = result.err().map(|e| e.to_string());
        match &failure {
            None => self.advance(SessionState::Reported),
            Some(reason) => {
                warn!("{} session failed in {}: {}", self.target, self.state, reason);
                self.advance(SessionState::Failed);
            }
        }

        let report = SessionReport::new(
            self.target.to_string(),
            self.config.city.clone(),
            self.state,
            self.started_at,
            self.stats,
            self.started.elapsed(),
        )
        .with_stages(self.stages.clone())
        .with_failure(failure);

        info!(
            seen = report.seen,
            duplicates = report.duplicates,
            inserted = report.inserted,
            errors = report.errors,
            elapsed_seconds = report.elapsed_seconds,
            throughput = report.throughput_per_second,
            "Session {}",
            report.state
        );

        if let Err(e) = self.store.log_session(&report.to_log()) {
            warn!("Could not write the session log: {}", e);
        }
        report
    }
}
