//! End-to-end tests over saved storefront pages.

use async_trait::async_trait;
use menu_harvest::commands::replay::ReplayOptions;
use menu_harvest::commands::ReplayCommand;
use menu_harvest::config::{Config, OutputFormat, ScrollProfile};
use menu_harvest::extract::{FieldExtractor, ParentContext, RecordKind, SelectorCatalog};
use menu_harvest::page::{
    ElementHandle, PageDriver, PageError, Scope, ScrollMetrics, SnapshotPage, WaitStrategy,
};
use menu_harvest::scroll::{ConvergenceReason, ScrollDriver, ScrollSettings, ScrollState};
use menu_harvest::store::{RecordStore, SqliteStore};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU32, Ordering};

const BASE: &str = "https://www.ifood.com.br";
const FALLBACK_FIXTURE: &str = include_str!("fixtures/merchants_fallback.html");

fn fixture_dir(name: &str) -> PathBuf {
    Path::new(env!("CARGO_MANIFEST_DIR")).join("tests/fixtures").join(name)
}

fn test_config(dir: &tempfile::TempDir) -> Config {
    Config {
        city: "Birigui".to_string(),
        database: dir.path().join("harvest.db"),
        screenshot_dir: dir.path().join("debug"),
        settle_ms: 0,
        loading_wait_ms: 0,
        request_interval_ms: 0,
        request_jitter_ms: 0,
        selector_timeout_ms: 50,
        format: OutputFormat::Json,
        ..Config::default()
    }
}

fn json(text: &str) -> serde_json::Value {
    serde_json::from_str(text).unwrap()
}

fn merchant_card(name: &str) -> String {
    format!(
        r#"<a class="merchant-v2__link" href="/delivery/birigui-sp/{slug}">
             <div class="merchant-v2__header"><span>{name}</span></div>
             <div class="merchant-v2__info">4,5 • Pizza • 1,0 km</div>
           </a>"#,
        slug = name.to_lowercase().replace(' ', "-"),
        name = name
    )
}

fn merchant_frame(names: &[&str]) -> String {
    let cards: String = names.iter().map(|n| merchant_card(n)).collect();
    format!("<html><body><main>{}</main></body></html>", cards)
}

#[tokio::test]
async fn test_case_variants_are_one_merchant_across_runs() {
    let dir = tempfile::tempdir().unwrap();
    let config = test_config(&dir);
    let frames = fixture_dir("pizza_burger");
    let opts = ReplayOptions { category: Some("Pizza".into()), ..Default::default() };
    let cmd = ReplayCommand::new(config.clone());

    let first = cmd.execute(&frames, RecordKind::Merchant, &opts).await.unwrap();
    assert!(first.failure.is_none());
    let first = json(&first.text);
    assert_eq!(first["seen"], 3);
    assert_eq!(first["duplicates"], 1);
    assert_eq!(first["inserted"], 2);

    let second = json(&cmd.execute(&frames, RecordKind::Merchant, &opts).await.unwrap().text);
    assert_eq!(second["seen"], 3);
    assert_eq!(second["duplicates"], 3);
    assert_eq!(second["inserted"], 0);

    let store = SqliteStore::open(&config.database).unwrap();
    assert_eq!(store.count(RecordKind::Merchant).unwrap(), 2);
    assert_eq!(store.session_count().unwrap(), 2);
    assert_eq!(store.merchant_id("Pizza", "Birigui").unwrap(), Some(1));
    assert_eq!(store.merchant_id("Burger", "Birigui").unwrap(), Some(2));
}

#[tokio::test]
async fn test_load_more_list_is_fully_collected() {
    let dir = tempfile::tempdir().unwrap();
    let config = test_config(&dir);
    let opts = ReplayOptions { dry_run: true, ..Default::default() };

    let output = ReplayCommand::new(config)
        .execute(&fixture_dir("lazy_list"), RecordKind::Merchant, &opts)
        .await
        .unwrap();

    assert!(output.failure.is_none());
    let records = json(&output.text);
    let names: Vec<&str> =
        records.as_array().unwrap().iter().map(|r| r["name"].as_str().unwrap()).collect();
    assert_eq!(
        names,
        vec![
            "Forno Bom",
            "Massa Fina",
            "La Bella",
            "Pizzaria Central",
            "Nonna Pizza",
            "Forneria Paulista"
        ]
    );
    assert_eq!(records[1]["delivery_fee"], 0.0);
    assert_eq!(records[2]["rating"], serde_json::Value::Null);
    assert_eq!(records[2]["cuisine"], "Italiana");
    assert_eq!(records[5]["link"], format!("{}/delivery/birigui-sp/forneria-paulista", BASE));
}

#[tokio::test]
async fn test_menu_items_keep_their_section() {
    let dir = tempfile::tempdir().unwrap();
    let config = test_config(&dir);
    let opts = ReplayOptions {
        parent: Some("Forno Bom".into()),
        dry_run: true,
        ..Default::default()
    };

    let output = ReplayCommand::new(config)
        .execute(&fixture_dir("menu"), RecordKind::MenuItem, &opts)
        .await
        .unwrap();

    let records = json(&output.text);
    assert_eq!(records.as_array().unwrap().len(), 3);
    assert_eq!(records[0]["kind"], "menu-item");
    assert_eq!(records[0]["name"], "Margherita");
    assert_eq!(records[0]["category"], "Pizzas Salgadas");
    assert_eq!(records[0]["price"], 42.9);
    assert_eq!(records[0]["restaurant_name"], "Forno Bom");
    assert_eq!(records[2]["category"], "Bebidas");
    assert_eq!(records[2]["description"], serde_json::Value::Null);
}

#[tokio::test]
async fn test_cascade_falls_back_per_element() {
    let page = SnapshotPage::single(FALLBACK_FIXTURE);
    page.navigate(BASE, WaitStrategy::Load).await.unwrap();
    let catalog = SelectorCatalog::embedded().unwrap();
    let extractor = FieldExtractor::new(catalog.schema(RecordKind::Merchant).clone(), BASE);

    let records = extractor.extract_visible(&page, &ParentContext::city("Birigui")).await.unwrap();

    assert_eq!(records.len(), 2);
    assert_eq!(records[0].name(), "Sushi Zen");
    assert_eq!(records[0].source("name"), Some("css `h3`"));
    assert_eq!(records[1].name(), "Temaki Point");
    assert_eq!(records[1].source("name"), Some("css `h2`"));
    assert_eq!(records[1].text("cuisine"), Some("Japonesa"));
    assert_eq!(records[1].number("distance_km"), Some(4.0));
    assert_eq!(records[0].source("link"), Some("css `a`@href"));
}

#[tokio::test]
async fn test_visible_load_more_runs_to_the_profile_cap() {
    let dir = tempfile::tempdir().unwrap();
    let config = Config { profile: ScrollProfile::Fast, ..test_config(&dir) };
    let button = r#"<button class="cardstack-nextcontent__button">Ver mais</button>"#;
    let html = merchant_frame(&["Forno Bom"]).replace("</main>", &format!("{}</main>", button));
    let page = SnapshotPage::single(html);
    page.navigate(BASE, WaitStrategy::Load).await.unwrap();

    let catalog = SelectorCatalog::embedded().unwrap();
    let extractor = FieldExtractor::new(catalog.schema(RecordKind::Merchant).clone(), BASE);
    let settings = ScrollSettings::from_config(&config);
    let mut driver = ScrollDriver::new(&page, &extractor, &catalog.controls, settings);
    let outcome = driver.run(&ParentContext::city("Birigui")).await;

    assert_eq!(outcome.reason, Some(ConvergenceReason::AttemptCap));
    assert_eq!(outcome.state, ScrollState::AttemptCapReached);
    assert_eq!(outcome.attempts, config.max_scroll_attempts());
    assert_eq!(outcome.candidates.len(), 1);
}

/// Fails the `fail_on`-th scroll with a timeout, counts handle releases and
/// delegates everything else.
struct FlakyPage {
    inner: SnapshotPage,
    scrolls: AtomicU32,
    releases: AtomicU32,
    fail_on: u32,
}

#[async_trait]
impl PageDriver for FlakyPage {
    async fn navigate(&self, url: &str, wait: WaitStrategy) -> Result<(), PageError> {
        self.inner.navigate(url, wait).await
    }
    async fn query_selector(
        &self,
        scope: Scope,
        selector: &str,
    ) -> Result<Option<ElementHandle>, PageError> {
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
        let n = self.scrolls.fetch_add(1, Ordering::SeqCst) + 1;
        if n == self.fail_on {
            return Err(PageError::Timeout { what: "scroll".to_string(), timeout_ms: 10 });
        }
        self.inner.scroll_to_bottom().await
    }
    async fn scroll_metrics(&self) -> Result<ScrollMetrics, PageError> {
        self.inner.scroll_metrics().await
    }
    async fn release_handles(&self) {
        self.releases.fetch_add(1, Ordering::SeqCst);
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
async fn test_failed_scroll_is_counted_and_skipped() {
    let dir = tempfile::tempdir().unwrap();
    let config = test_config(&dir);
    let page = FlakyPage {
        inner: SnapshotPage::new().with_any(vec![
            merchant_frame(&["A one", "B two"]),
            merchant_frame(&["A one", "B two", "C three", "D four"]),
            merchant_frame(&["A one", "B two", "C three", "D four", "E five", "F six"]),
        ]),
        scrolls: AtomicU32::new(0),
        releases: AtomicU32::new(0),
        fail_on: 2,
    };
    page.navigate(BASE, WaitStrategy::Load).await.unwrap();

    let catalog = SelectorCatalog::embedded().unwrap();
    let extractor = FieldExtractor::new(catalog.schema(RecordKind::Merchant).clone(), BASE);
    let settings = ScrollSettings::from_config(&config);
    let mut driver = ScrollDriver::new(&page, &extractor, &catalog.controls, settings);
    let outcome = driver.run(&ParentContext::city("Birigui")).await;

    assert!(outcome.aborted.is_none());
    assert_eq!(outcome.errors, 1);
    assert_eq!(outcome.attempts, 4);
    assert_eq!(outcome.reason, Some(ConvergenceReason::Signals));
    assert_eq!(outcome.candidates.len(), 6);
    // Initial pass plus the three attempts whose scroll succeeded.
    assert_eq!(page.releases.load(Ordering::SeqCst), 4);
}

#[tokio::test]
async fn test_handles_from_a_previous_pass_are_detached() {
    let page = FlakyPage {
        inner: SnapshotPage::single(merchant_frame(&["A one", "B two"])),
        scrolls: AtomicU32::new(0),
        releases: AtomicU32::new(0),
        fail_on: 0,
    };
    page.navigate(BASE, WaitStrategy::Load).await.unwrap();
    let catalog = SelectorCatalog::embedded().unwrap();
    let extractor = FieldExtractor::new(catalog.schema(RecordKind::Merchant).clone(), BASE);
    let parent = ParentContext::city("Birigui");

    let stale = page.query_selector(Scope::Page, "a").await.unwrap().unwrap();
    assert!(page.text(stale).await.unwrap().contains("A one"));

    for _ in 0..3 {
        assert_eq!(extractor.extract_visible(&page, &parent).await.unwrap().len(), 2);
    }

    assert_eq!(page.releases.load(Ordering::SeqCst), 3);
    assert!(matches!(page.text(stale).await, Err(PageError::Detached)));
}
