//! Live scraping against the storefront.

use super::CommandOutput;
use crate::config::Config;
use crate::extract::SelectorCatalog;
use crate::format::Formatter;
use crate::page::PageDriver;
use crate::session::{ExtractionSession, LocationMode, SessionError, Target};
use crate::store::{RecordStore, SqliteStore};
use anyhow::{Context, Result};
use tracing::{info, warn};

/// Runs one extraction session in a browser.
pub struct ScrapeCommand {
    config: Config,
}

impl ScrapeCommand {
    pub fn new(config: Config) -> Self {
        Self { config }
    }

    fn catalog(&self) -> Result<SelectorCatalog> {
        SelectorCatalog::load(self.config.selectors.as_deref())
            .context("Failed to load the selector catalog")
    }

    /// Launches Chrome, runs the session and always closes the browser.
    #[cfg(feature = "browser")]
    pub async fn execute(&self, target: Target) -> Result<CommandOutput> {
        use crate::page::ChromePage;

        let catalog = self.catalog()?;
        let store = SqliteStore::open(&self.config.database).with_context(|| {
            format!("Failed to open database {}", self.config.database.display())
        })?;
        let page = ChromePage::launch(&self.config).await.context("Failed to launch the browser")?;

        let output =
            self.execute_with_page(&page, &store, &catalog, target, LocationMode::Configure).await;

        if let Err(e) = page.close().await {
            warn!("Browser did not close cleanly: {}", e);
        }
        output
    }

    #[cfg(not(feature = "browser"))]
    pub async fn execute(&self, _target: Target) -> Result<CommandOutput> {
        anyhow::bail!("built without the `browser` feature; only `replay` is available")
    }

    /// Runs the session on a provided page and store (for testing and replay).
    ///
    /// Ctrl-C stops the session at its next suspension point; the partial
    /// report is still produced.
    pub async fn execute_with_page(
        &self,
        page: &dyn PageDriver,
        store: &dyn RecordStore,
        catalog: &SelectorCatalog,
        target: Target,
        location: LocationMode,
    ) -> Result<CommandOutput> {
        let mut session = ExtractionSession::new(&self.config, catalog, page, store, target)
            .with_location(location);

        let result = tokio::select! {
            result = session.run() => result,
            _ = tokio::signal::ctrl_c() => {
                warn!("Interrupted; writing a partial report");
                Err(SessionError::Interrupted)
            }
        };
        let report = session.finish(result);
        info!("{} new records", session.inserted().len());

        let formatter = Formatter::new(self.config.format);
        Ok(CommandOutput { text: formatter.format_report(&report), failure: report.failure })
    }
}
