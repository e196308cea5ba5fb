//! CLI command implementations.

pub mod replay;
pub mod scrape;

pub use replay::ReplayCommand;
pub use scrape::ScrapeCommand;

/// Text to print plus the failure, if the session did not complete.
///
/// The report is printed either way; the binary exits non-zero on failure.
#[derive(Debug, Clone, PartialEq)]
pub struct CommandOutput {
    pub text: String,
    pub failure: Option<String>,
}
