//! menu-harvest - adaptive catalog extractor for delivery storefronts
//!
//! Drives a browser through categories, merchants and menus, and stores
//! what it finds in a local SQLite database without duplicates.

use anyhow::Result;
use clap::{Parser, Subcommand};
use menu_harvest::commands::replay::ReplayOptions;
use menu_harvest::commands::{CommandOutput, ReplayCommand, ScrapeCommand};
use menu_harvest::config::{Config, OutputFormat, ScrollProfile};
use menu_harvest::extract::RecordKind;
use menu_harvest::format::Formatter;
use menu_harvest::session::Target;
use std::path::PathBuf;
use tracing::Level;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(
    name = "menu-harvest",
    version,
    about = "Adaptive catalog extractor for delivery storefronts",
    long_about = "Extracts categories, merchants and menu items from a JavaScript-rendered \
                  storefront and stores them in a local SQLite database without duplicates."
)]
struct Cli {
    /// Path to config file
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// City used for the delivery location
    #[arg(long, global = true)]
    city: Option<String>,

    /// SQLite database path
    #[arg(long, global = true)]
    db: Option<PathBuf>,

    /// Scroll effort: fast, medium or thorough
    #[arg(short, long, global = true)]
    profile: Option<ScrollProfile>,

    /// Output format
    #[arg(short, long, global = true)]
    format: Option<OutputFormat>,

    /// Run the browser without a window
    #[arg(long, global = true)]
    headless: Option<bool>,

    /// Proxy URL (e.g., socks5://host:port)
    #[arg(long, global = true, env = "HARVEST_PROXY")]
    proxy: Option<String>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Extract categories from the home page
    #[command(alias = "c")]
    Categories,

    /// Extract merchants of one category, or of every stored category
    #[command(alias = "m")]
    Merchants {
        /// Category name
        #[arg(long, required_unless_present = "all", conflicts_with = "all")]
        category: Option<String>,

        /// Category page URL (defaults to the stored link)
        #[arg(long, requires = "category")]
        url: Option<String>,

        /// Every category stored for the city
        #[arg(long)]
        all: bool,
    },

    /// Extract the menu of one merchant
    Menu {
        /// Merchant name, as stored
        #[arg(long)]
        merchant: String,

        /// Merchant page URL
        #[arg(long)]
        url: String,
    },

    /// Run extraction over saved HTML frames, offline
    Replay {
        /// Directory of *.html frames, replayed in name order
        dir: PathBuf,

        /// What the frames list: category, merchant or menu-item
        #[arg(long)]
        kind: RecordKind,

        /// Merchant the menu belongs to
        #[arg(long)]
        parent: Option<String>,

        /// Category the merchants are listed under
        #[arg(long)]
        category: Option<String>,

        /// Print the records instead of storing them
        #[arg(long)]
        dry_run: bool,
    },

    /// List configured cities
    Cities,

    /// List scroll profiles
    Profiles,
}

fn finish(output: CommandOutput) -> Result<()> {
    println!("{}", output.text);
    match output.failure {
        Some(failure) => anyhow::bail!(failure),
        None => Ok(()),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    let filter = if cli.verbose {
        EnvFilter::new(Level::DEBUG.to_string())
    } else {
        EnvFilter::from_default_env().add_directive(Level::WARN.into())
    };

    tracing_subscriber::fmt().with_env_filter(filter).with_target(false).init();

    // Load config with layered overrides
    let mut config = Config::load(cli.config.as_deref())?.with_env();

    // Apply CLI overrides
    if let Some(city) = cli.city {
        config.city = city;
    }
    if let Some(db) = cli.db {
        config.database = db;
    }
    if let Some(profile) = cli.profile {
        config.profile = profile;
    }
    if let Some(format) = cli.format {
        config.format = format;
    }
    if let Some(headless) = cli.headless {
        config.headless = headless;
    }
    if let Some(proxy) = cli.proxy {
        config.proxy = Some(proxy);
    }

    config.validate()?;

    match cli.command {
        Commands::Categories => {
            finish(ScrapeCommand::new(config).execute(Target::Categories).await?)
        }

        Commands::Merchants { category, url, all } => {
            let target = match category {
                Some(name) if !all => Target::Category { name, url },
                _ => Target::AllCategories,
            };
            finish(ScrapeCommand::new(config).execute(target).await?)
        }

        Commands::Menu { merchant, url } => {
            let target = Target::Merchant { name: merchant, url };
            finish(ScrapeCommand::new(config).execute(target).await?)
        }

        Commands::Replay { dir, kind, parent, category, dry_run } => {
            let opts = ReplayOptions { parent, category, dry_run };
            finish(ReplayCommand::new(config).execute(&dir, kind, &opts).await?)
        }

        Commands::Cities => {
            println!("{}", Formatter::new(config.format).format_cities(&config));
            Ok(())
        }

        Commands::Profiles => {
            println!("{}", Formatter::new(config.format).format_profiles(&config));
            Ok(())
        }
    }
}
