//! Configuration management with TOML, environment variables, and CLI overrides.

use crate::page::WaitStrategy;
use crate::retry::RetryPolicy;
use crate::scroll::ConvergenceSettings;
use anyhow::{ensure, Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::debug;

/// Application configuration with layered loading.
///
/// Built once at startup and handed to each component; nothing reads it
/// from a global.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Storefront root URL
    #[serde(default = "default_base_url")]
    pub base_url: String,

    /// City the delivery address is set to
    #[serde(default = "default_city")]
    pub city: String,

    /// Known cities (informational; any city can be passed on the CLI)
    #[serde(default = "default_cities")]
    pub cities: Vec<String>,

    /// State abbreviation preferred when picking an address suggestion
    #[serde(default)]
    pub state_hint: Option<String>,

    /// Country names preferred when picking an address suggestion
    #[serde(default = "default_country_hints")]
    pub country_hints: Vec<String>,

    /// SQLite database file
    #[serde(default = "default_database")]
    pub database: PathBuf,

    /// Where diagnostic screenshots go
    #[serde(default = "default_screenshot_dir")]
    pub screenshot_dir: PathBuf,

    /// External selector catalog (the embedded one is used when unset)
    #[serde(default)]
    pub selectors: Option<PathBuf>,

    /// Active scroll profile
    #[serde(default)]
    pub profile: ScrollProfile,

    /// Attempt caps per scroll profile
    #[serde(default)]
    pub profiles: ProfilePresets,

    /// Delay after each scroll/click before re-extracting
    #[serde(default = "default_settle_ms")]
    pub settle_ms: u64,

    /// Extra wait when a loading indicator is visible
    #[serde(default = "default_loading_wait_ms")]
    pub loading_wait_ms: u64,

    /// Minimum delay between navigations
    #[serde(default = "default_request_interval_ms")]
    pub request_interval_ms: u64,

    /// Random jitter added to the navigation delay (0 to this value)
    #[serde(default = "default_request_jitter_ms")]
    pub request_jitter_ms: u64,

    /// Wait strategy used for navigations
    #[serde(default)]
    pub wait_strategy: WaitStrategy,

    /// Upper bound for a single navigation
    #[serde(default = "default_navigation_timeout_ms")]
    pub navigation_timeout_ms: u64,

    /// Per-call timeout for selector queries and element actions
    #[serde(default = "default_selector_timeout_ms")]
    pub selector_timeout_ms: u64,

    /// Retry policy for navigation and location setup
    #[serde(default)]
    pub retry: RetryPolicy,

    /// Convergence thresholds for the scroll loop
    #[serde(default)]
    pub convergence: ConvergenceSettings,

    /// How many times location setup is attempted
    #[serde(default = "default_location_attempts")]
    pub location_attempts: u32,

    /// Run the browser without a window
    #[serde(default = "default_headless")]
    pub headless: bool,

    /// Explicit Chrome/Chromium executable
    #[serde(default)]
    pub chrome_path: Option<PathBuf>,

    /// Proxy URL (e.g., socks5://host:port)
    #[serde(default)]
    pub proxy: Option<String>,

    /// User agent override
    #[serde(default = "default_user_agent")]
    pub user_agent: Option<String>,

    /// Words that mark a "category" tile as a merchant promotion
    #[serde(default = "default_category_blocklist")]
    pub category_blocklist: Vec<String>,

    /// Output format
    #[serde(default)]
    pub format: OutputFormat,
}

fn default_base_url() -> String {
    "https://www.ifood.com.br".to_string()
}

fn default_city() -> String {
    "São Paulo".to_string()
}

fn default_cities() -> Vec<String> {
    vec!["São Paulo".to_string(), "Rio de Janeiro".to_string()]
}

fn default_country_hints() -> Vec<String> {
    vec!["Brasil".to_string(), "Brazil".to_string()]
}

fn default_database() -> PathBuf {
    PathBuf::from("data/ifood_database.db")
}

fn default_screenshot_dir() -> PathBuf {
    PathBuf::from("data/debug")
}

fn default_settle_ms() -> u64 {
    1500
}

fn default_loading_wait_ms() -> u64 {
    1000
}

fn default_request_interval_ms() -> u64 {
    2000
}

fn default_request_jitter_ms() -> u64 {
    1000
}

fn default_navigation_timeout_ms() -> u64 {
    30_000
}

fn default_selector_timeout_ms() -> u64 {
    5000
}

fn default_location_attempts() -> u32 {
    3
}

fn default_headless() -> bool {
    true
}

fn default_user_agent() -> Option<String> {
    Some(
        "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 \
         (KHTML, like Gecko) Chrome/124.0.0.0 Safari/537.36"
            .to_string(),
    )
}

fn default_category_blocklist() -> Vec<String> {
    [
        "mcdonald", "méqui", "burger", "delivery", "drive", "moo", "house", "kibon", "açaí-",
        "gourmet", "best", "mccafé", "chickens", "sobremesas",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}

impl Default for Config {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
            city: default_city(),
            cities: default_cities(),
            state_hint: None,
            country_hints: default_country_hints(),
            database: default_database(),
            screenshot_dir: default_screenshot_dir(),
            selectors: None,
            profile: ScrollProfile::default(),
            profiles: ProfilePresets::default(),
            settle_ms: default_settle_ms(),
            loading_wait_ms: default_loading_wait_ms(),
            request_interval_ms: default_request_interval_ms(),
            request_jitter_ms: default_request_jitter_ms(),
            wait_strategy: WaitStrategy::default(),
            navigation_timeout_ms: default_navigation_timeout_ms(),
            selector_timeout_ms: default_selector_timeout_ms(),
            retry: RetryPolicy::default(),
            convergence: ConvergenceSettings::default(),
            location_attempts: default_location_attempts(),
            headless: default_headless(),
            chrome_path: None,
            proxy: None,
            user_agent: default_user_agent(),
            category_blocklist: default_category_blocklist(),
            format: OutputFormat::Table,
        }
    }
}

impl Config {
    /// Creates a new default configuration.
    pub fn new() -> Self {
        Self::default()
    }

    /// Loads configuration from a TOML file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        debug!("Loading config from: {}", path.display());

        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))
    }

    /// Loads configuration with fallback to default locations.
    pub fn load(explicit_path: Option<&Path>) -> Result<Self> {
        if let Some(path) = explicit_path {
            return Self::from_file(path);
        }

        let local_config = Path::new("menu-harvest.toml");
        if local_config.exists() {
            debug!("Found menu-harvest.toml in current directory");
            return Self::from_file(local_config);
        }

        if let Some(config_dir) = dirs::config_dir() {
            let xdg_config = config_dir.join("menu-harvest").join("config.toml");
            if xdg_config.exists() {
                debug!("Found config in XDG config directory");
                return Self::from_file(xdg_config);
            }
        }

        debug!("No config file found, using defaults");
        Ok(Self::default())
    }

    /// Applies environment variable overrides.
    pub fn with_env(mut self) -> Self {
        if let Ok(city) = std::env::var("HARVEST_CITY") {
            if !city.trim().is_empty() {
                self.city = city;
            }
        }

        if let Ok(db) = std::env::var("HARVEST_DB") {
            self.database = PathBuf::from(db);
        }

        if let Ok(profile) = std::env::var("HARVEST_PROFILE") {
            if let Ok(p) = profile.parse() {
                self.profile = p;
            }
        }

        if let Ok(proxy) = std::env::var("HARVEST_PROXY") {
            self.proxy = Some(proxy);
        }

        if let Ok(headless) = std::env::var("HARVEST_HEADLESS") {
            if let Ok(h) = headless.parse() {
                self.headless = h;
            }
        }

        self
    }

    /// Attempt cap of the active scroll profile.
    pub fn max_scroll_attempts(&self) -> u32 {
        self.profiles.cap(self.profile)
    }

    /// Rejects contract errors up front; these are never retried.
    pub fn validate(&self) -> Result<()> {
        ensure!(!self.city.trim().is_empty(), "city must not be empty");
        ensure!(
            self.base_url.starts_with("http://") || self.base_url.starts_with("https://"),
            "base_url must be an http(s) URL, got '{}'",
            self.base_url
        );
        ensure!(self.max_scroll_attempts() > 0, "scroll profile '{}' has a zero cap", self.profile);
        ensure!(self.location_attempts > 0, "location_attempts must be at least 1");
        ensure!(self.retry.max_attempts > 0, "retry.max_attempts must be at least 1");
        self.convergence.validate()?;
        Ok(())
    }
}

/// Scroll effort presets.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ScrollProfile {
    Fast,
    #[default]
    Medium,
    Thorough,
}

impl ScrollProfile {
    pub fn all() -> [ScrollProfile; 3] {
        [ScrollProfile::Fast, ScrollProfile::Medium, ScrollProfile::Thorough]
    }
}

impl std::str::FromStr for ScrollProfile {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "fast" => Ok(ScrollProfile::Fast),
            "medium" => Ok(ScrollProfile::Medium),
            "thorough" => Ok(ScrollProfile::Thorough),
            _ => Err(format!("Unknown profile: {}. Use: fast, medium, thorough", s)),
        }
    }
}

impl std::fmt::Display for ScrollProfile {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ScrollProfile::Fast => write!(f, "fast"),
            ScrollProfile::Medium => write!(f, "medium"),
            ScrollProfile::Thorough => write!(f, "thorough"),
        }
    }
}

/// Attempt caps for each scroll profile.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProfilePresets {
    #[serde(default = "default_fast")]
    pub fast: u32,
    #[serde(default = "default_medium")]
    pub medium: u32,
    #[serde(default = "default_thorough")]
    pub thorough: u32,
}

fn default_fast() -> u32 {
    5
}

fn default_medium() -> u32 {
    15
}

fn default_thorough() -> u32 {
    40
}

impl Default for ProfilePresets {
    fn default() -> Self {
        Self { fast: default_fast(), medium: default_medium(), thorough: default_thorough() }
    }
}

impl ProfilePresets {
    pub fn cap(&self, profile: ScrollProfile) -> u32 {
        match profile {
            ScrollProfile::Fast => self.fast,
            ScrollProfile::Medium => self.medium,
            ScrollProfile::Thorough => self.thorough,
        }
    }
}

/// Output format for reports and record listings.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputFormat {
    #[default]
    Table,
    Json,
    Markdown,
}

impl std::str::FromStr for OutputFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "table" => Ok(OutputFormat::Table),
            "json" => Ok(OutputFormat::Json),
            "markdown" | "md" => Ok(OutputFormat::Markdown),
            _ => Err(format!("Unknown format: {}. Use: table, json, markdown", s)),
        }
    }
}

impl std::fmt::Display for OutputFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            OutputFormat::Table => write!(f, "table"),
            OutputFormat::Json => write!(f, "json"),
            OutputFormat::Markdown => write!(f, "markdown"),
        }
    }
}
