//! menu-harvest - adaptive catalog extraction for JavaScript-rendered storefronts
//!
//! The pipeline: [`session`] sequences location setup and navigation,
//! [`scroll`] loads lazily rendered lists until they converge, [`extract`]
//! turns DOM elements into records through configurable selector cascades,
//! and [`dedup`] keeps [`store`] free of repeated entities.

pub mod commands;
pub mod config;
pub mod dedup;
pub mod extract;
pub mod format;
pub mod page;
pub mod retry;
pub mod scroll;
pub mod session;
pub mod store;

pub use config::Config;
pub use extract::{CandidateRecord, RecordKind, SelectorCatalog};
pub use session::{ExtractionSession, SessionReport, Target};
pub use store::{RecordStore, SqliteStore};
