//! Offline extraction over saved HTML frames.
//!
//! Frames are the `*.html` files of a directory, in name order; each scroll
//! or "load more" click reveals the next one. Useful for checking a selector
//! catalog against captured pages without touching the live site.

use super::{CommandOutput, ScrapeCommand};
use crate::config::Config;
use crate::extract::{FieldExtractor, ParentContext, RecordKind, SelectorCatalog};
use crate::format::Formatter;
use crate::page::{PageDriver, SnapshotPage};
use crate::scroll::{ScrollDriver, ScrollSettings};
use crate::session::{LocationMode, Target};
use crate::store::SqliteStore;
use anyhow::{Context, Result};
use std::path::Path;
use tracing::info;

/// Elements whose click reveals the next frame.
const ADVANCE_SELECTOR: &str = "button, a";

/// Replay options beyond the frame directory.
#[derive(Debug, Clone, Default)]
pub struct ReplayOptions {
    /// Merchant the menu belongs to (menu-item replays).
    pub parent: Option<String>,
    /// Category the merchants are listed under (merchant replays).
    pub category: Option<String>,
    /// Print the extracted records instead of storing them.
    pub dry_run: bool,
}

pub struct ReplayCommand {
    config: Config,
}

impl ReplayCommand {
    pub fn new(config: Config) -> Self {
        Self { config }
    }

    fn target(&self, kind: RecordKind, opts: &ReplayOptions, url: &str) -> Result<Target> {
        Ok(match kind {
            RecordKind::Category => Target::Categories,
            RecordKind::Merchant => Target::Category {
                name: opts.category.clone().unwrap_or_else(|| "replay".to_string()),
                url: Some(url.to_string()),
            },
            RecordKind::MenuItem => Target::Merchant {
                name: opts
                    .parent
                    .clone()
                    .context("menu-item replays need --parent <merchant name>")?,
                url: url.to_string(),
            },
        })
    }

    fn parent(&self, kind: RecordKind, opts: &ReplayOptions) -> ParentContext {
        let base = ParentContext::city(self.config.city.clone());
        match kind {
            RecordKind::Category => base,
            RecordKind::Merchant => match &opts.category {
                Some(category) => base.with_category(category.clone()),
                None => base,
            },
            RecordKind::MenuItem => match &opts.parent {
                Some(merchant) => base.with_merchant(merchant.clone(), None),
                None => base,
            },
        }
    }

    pub async fn execute(
        &self,
        dir: &Path,
        kind: RecordKind,
        opts: &ReplayOptions,
    ) -> Result<CommandOutput> {
        let page = SnapshotPage::from_dir(dir)
            .with_context(|| format!("Failed to load frames from {}", dir.display()))?
            .advance_on_click(ADVANCE_SELECTOR)?;
        let catalog = SelectorCatalog::load(self.config.selectors.as_deref())
            .context("Failed to load the selector catalog")?;
        let url = format!("file://{}", dir.display());

        info!("Replaying {} as {} records", dir.display(), kind);

        if opts.dry_run {
            return self.extract_only(&page, &catalog, kind, opts, &url).await;
        }

        let target = self.target(kind, opts, &url)?;
        let store = SqliteStore::open(&self.config.database).with_context(|| {
            format!("Failed to open database {}", self.config.database.display())
        })?;
        ScrapeCommand::new(self.config.clone())
            .execute_with_page(&page, &store, &catalog, target, LocationMode::Skip)
            .await
    }

    /// Extraction without persistence: prints what the catalog finds.
    async fn extract_only(
        &self,
        page: &SnapshotPage,
        catalog: &SelectorCatalog,
        kind: RecordKind,
        opts: &ReplayOptions,
        url: &str,
    ) -> Result<CommandOutput> {
        page.navigate(url, self.config.wait_strategy).await?;

        let mut extractor =
            FieldExtractor::new(catalog.schema(kind).clone(), self.config.base_url.clone());
        if kind == RecordKind::Category {
            extractor = extractor.with_blocklist(&self.config.category_blocklist);
        }
        let settings = ScrollSettings::from_config(&self.config);
        let mut driver = ScrollDriver::new(page, &extractor, &catalog.controls, settings);
        let outcome = driver.run(&self.parent(kind, opts)).await;

        info!(
            "{} candidates after {} attempts, {} failed",
            outcome.candidates.len(),
            outcome.attempts,
            outcome.errors
        );

        let text = Formatter::new(self.config.format).format_records(&outcome.candidates);
        Ok(CommandOutput { text, failure: outcome.aborted.map(|e| e.to_string()) })
    }
}
