//! Output formatting for session reports and extracted records (table, JSON, markdown).

use crate::config::{Config, OutputFormat, ScrollProfile};
use crate::extract::{CandidateRecord, Record};
use crate::session::SessionReport;
use serde::Serialize;

/// Formats reports and records for output.
pub struct Formatter {
    format: OutputFormat,
}

/// Cuts `s` to at most `width` characters, marking the cut with `...`.
fn truncate(s: &str, width: usize) -> String {
    if s.chars().count() <= width {
        return s.to_string();
    }
    let kept: String = s.chars().take(width.saturating_sub(3)).collect();
    format!("{}...", kept)
}

fn or_na<T: ToString>(value: Option<T>) -> String {
    value.map(|v| v.to_string()).unwrap_or_else(|| "N/A".to_string())
}

fn money(value: Option<f64>) -> String {
    value.map(|v| format!("R$ {:.2}", v)).unwrap_or_else(|| "N/A".to_string())
}

/// Display columns shared by every record kind.
struct Row {
    kind: &'static str,
    name: String,
    scope: String,
    details: String,
}

impl Row {
    fn from_record(record: &Record) -> Self {
        match record {
            Record::Category(c) => Row {
                kind: "category",
                name: c.name.clone(),
                scope: c.city.clone(),
                details: c.link.clone().unwrap_or_default(),
            },
            Record::Merchant(m) => Row {
                kind: "merchant",
                name: m.name.clone(),
                scope: m.category.clone().unwrap_or_else(|| m.city.clone()),
                details: format!(
                    "rating {} | fee {} | {} min",
                    or_na(m.rating.map(|r| format!("{:.1}", r))),
                    money(m.delivery_fee),
                    or_na(m.delivery_time_min)
                ),
            },
            Record::MenuItem(item) => Row {
                kind: "menu-item",
                name: item.name.clone(),
                scope: match &item.category {
                    Some(section) => format!("{} / {}", item.restaurant_name, section),
                    None => item.restaurant_name.clone(),
                },
                details: money(item.price),
            },
        }
    }
}

#[derive(Serialize)]
struct ProfileView {
    name: String,
    max_attempts: u32,
    active: bool,
}

impl Formatter {
    pub fn new(format: OutputFormat) -> Self {
        Self { format }
    }

    /// Formats an end-of-session report.
    pub fn format_report(&self, report: &SessionReport) -> String {
        match self.format {
            OutputFormat::Json => {
                serde_json::to_string_pretty(report).unwrap_or_else(|_| "{}".to_string())
            }
            OutputFormat::Table => self.table_report(report),
            OutputFormat::Markdown => self.markdown_report(report),
        }
    }

    /// Formats extracted records. Candidates that fail range checks are left out.
    pub fn format_records(&self, candidates: &[CandidateRecord]) -> String {
        let records: Vec<Record> =
            candidates.iter().filter_map(|c| Record::from_candidate(c).ok()).collect();

        if records.is_empty() {
            return match self.format {
                OutputFormat::Json => "[]".to_string(),
                _ => "No records.".to_string(),
            };
        }

        match self.format {
            OutputFormat::Json => {
                serde_json::to_string_pretty(&records).unwrap_or_else(|_| "[]".to_string())
            }
            OutputFormat::Table => self.table_records(&records),
            OutputFormat::Markdown => self.markdown_records(&records),
        }
    }

    /// Known cities, marking the configured one.
    pub fn format_cities(&self, config: &Config) -> String {
        let mut cities = config.cities.clone();
        if !cities.iter().any(|c| c.eq_ignore_ascii_case(&config.city)) {
            cities.insert(0, config.city.clone());
        }

        match self.format {
            OutputFormat::Json => {
                serde_json::to_string_pretty(&cities).unwrap_or_else(|_| "[]".to_string())
            }
            OutputFormat::Table | OutputFormat::Markdown => {
                let bullet = if self.format == OutputFormat::Markdown { "- " } else { "" };
                cities
                    .iter()
                    .map(|c| {
                        let marker = if c == &config.city { " (active)" } else { "" };
                        format!("{}{}{}", bullet, c, marker)
                    })
                    .collect::<Vec<_>>()
                    .join("\n")
            }
        }
    }

    /// Scroll profiles and their attempt caps.
    pub fn format_profiles(&self, config: &Config) -> String {
        let views: Vec<ProfileView> = ScrollProfile::all()
            .into_iter()
            .map(|p| ProfileView {
                name: p.to_string(),
                max_attempts: config.profiles.cap(p),
                active: p == config.profile,
            })
            .collect();

        match self.format {
            OutputFormat::Json => {
                serde_json::to_string_pretty(&views).unwrap_or_else(|_| "[]".to_string())
            }
            OutputFormat::Table => {
                let mut lines = vec![format!("{:<10}  {:>8}  {}", "Profile", "Attempts", "")];
                lines.push(format!("{:-<10}  {:->8}", "", ""));
                for v in &views {
                    let marker = if v.active { "*" } else { "" };
                    lines.push(format!("{:<10}  {:>8}  {}", v.name, v.max_attempts, marker));
                }
                lines.join("\n")
            }
            OutputFormat::Markdown => {
                let mut lines = vec![
                    "| Profile | Attempts | Active |".to_string(),
                    "|---------|----------|--------|".to_string(),
                ];
                for v in &views {
                    let marker = if v.active { "✓" } else { "" };
                    lines.push(format!("| {} | {} | {} |", v.name, v.max_attempts, marker));
                }
                lines.join("\n")
            }
        }
    }

    // Table formatting

    fn table_report(&self, report: &SessionReport) -> String {
        let mut lines = Vec::new();

        lines.push(format!("Session:     {} ({})", report.target, report.city));
        lines.push(format!("Status:      {}", report.state));
        lines.push(format!("Seen:        {}", report.seen));
        lines.push(format!("Duplicates:  {}", report.duplicates));
        lines.push(format!("Inserted:    {}", report.inserted));
        lines.push(format!("Errors:      {}", report.errors));
        lines.push(format!("Attempts:    {}", report.scroll_attempts));
        lines.push(format!("Elapsed:     {:.1}s", report.elapsed_seconds));
        lines.push(format!("Throughput:  {:.2}/s", report.throughput_per_second));

        if let Some(failure) = &report.failure {
            lines.push(format!("Failure:     {}", failure));
        }

        lines.join("\n")
    }

    fn table_records(&self, records: &[Record]) -> String {
        let kind_width = 9;
        let name_width = 36;
        let scope_width = 28;

        let mut lines = Vec::new();

        lines.push(format!(
            "{:<kind_width$}  {:<name_width$}  {:<scope_width$}  {}",
            "Kind", "Name", "Scope", "Details"
        ));
        lines.push(format!(
            "{:-<kind_width$}  {:-<name_width$}  {:-<scope_width$}  {:-<20}",
            "", "", "", ""
        ));

        for record in records {
            let row = Row::from_record(record);
            lines.push(format!(
                "{:<kind_width$}  {:<name_width$}  {:<scope_width$}  {}",
                row.kind,
                truncate(&row.name, name_width),
                truncate(&row.scope, scope_width),
                row.details
            ));
        }

        lines.push(String::new());
        lines.push(format!("Total: {} records", records.len()));

        lines.join("\n")
    }

    // Markdown formatting

    fn markdown_report(&self, report: &SessionReport) -> String {
        let mut lines = Vec::new();

        lines.push(format!("## Session `{}` ({})", report.target, report.city));
        lines.push(String::new());
        lines.push("| Seen | Duplicates | Inserted | Errors | Elapsed | Throughput |".to_string());
        lines.push("|------|------------|----------|--------|---------|------------|".to_string());
        lines.push(format!(
            "| {} | {} | {} | {} | {:.1}s | {:.2}/s |",
            report.seen,
            report.duplicates,
            report.inserted,
            report.errors,
            report.elapsed_seconds,
            report.throughput_per_second
        ));
        lines.push(String::new());
        lines.push(format!("- **Status:** {}", report.state));

        if let Some(failure) = &report.failure {
            lines.push(format!("- **Failure:** {}", failure));
        }

        lines.join("\n")
    }

    fn markdown_records(&self, records: &[Record]) -> String {
        let mut lines = Vec::new();

        lines.push("| Kind | Name | Scope | Details |".to_string());
        lines.push("|------|------|-------|---------|".to_string());

        for record in records {
            let row = Row::from_record(record);
            lines.push(format!(
                "| {} | {} | {} | {} |",
                row.kind,
                truncate(&row.name, 40).replace('|', "\\|"),
                row.scope.replace('|', "\\|"),
                row.details.replace('|', "\\|")
            ));
        }

        lines.push(String::new());
        lines.push(format!("*{} records*", records.len()));

        lines.join("\n")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::extract::{FieldValue, ParentContext, RecordKind};
    use crate::session::{SessionState, SessionStats};
    use chrono::Utc;
    use std::time::Duration;

    fn make_report(failure: Option<&str>) -> SessionReport {
        let stats = SessionStats { seen: 3, duplicates: 1, inserted: 2, ..Default::default() };
        SessionReport::new(
            "category:Pizza".into(),
            "Birigui".into(),
            SessionState::Reported,
            Utc::now(),
            stats,
            Duration::from_secs(2),
        )
        .with_failure(failure.map(String::from))
    }

    fn make_records() -> Vec<CandidateRecord> {
        let parent = ParentContext::city("Birigui").with_category("Pizza");
        vec![
            CandidateRecord::named(RecordKind::Merchant, "Pizzaria São João", parent.clone())
                .with_value("rating", Some("4,7".into()), Some(FieldValue::Number(4.7)))
                .with_value("delivery_fee", Some("Grátis".into()), Some(FieldValue::Number(0.0))),
            CandidateRecord::named(
                RecordKind::MenuItem,
                "Calabresa",
                ParentContext::city("Birigui").with_merchant("Forno Bom", Some(1)),
            )
            .with_value("price", Some("R$ 40,00".into()), Some(FieldValue::Number(40.0))),
        ]
    }

    #[test]
    fn test_truncate_is_char_safe() {
        assert_eq!(truncate("short", 10), "short");
        assert_eq!(truncate("Pão de açúcar com manteiga", 10), "Pão de ...");
    }

    #[test]
    fn test_report_table() {
        let output = Formatter::new(OutputFormat::Table).format_report(&make_report(None));
        assert!(output.contains("Seen:        3"));
        assert!(output.contains("Duplicates:  1"));
        assert!(output.contains("Inserted:    2"));
        assert!(output.contains("1.50/s"));
        assert!(!output.contains("Failure"));
    }

    #[test]
    fn test_report_json() {
        let output = Formatter::new(OutputFormat::Json).format_report(&make_report(Some("boom")));
        let parsed: serde_json::Value = serde_json::from_str(&output).unwrap();
        assert_eq!(parsed["inserted"], 2);
        assert_eq!(parsed["state"], "reported");
        assert_eq!(parsed["failure"], "boom");
    }

    #[test]
    fn test_report_markdown() {
        let output = Formatter::new(OutputFormat::Markdown).format_report(&make_report(Some("x")));
        assert!(output.contains("## Session `category:Pizza` (Birigui)"));
        assert!(output.contains("| 3 | 1 | 2 | 0 |"));
        assert!(output.contains("**Failure:** x"));
    }

    #[test]
    fn test_records_table() {
        let output = Formatter::new(OutputFormat::Table).format_records(&make_records());
        assert!(output.contains("Pizzaria São João"));
        assert!(output.contains("rating 4.7 | fee R$ 0.00"));
        assert!(output.contains("Forno Bom"));
        assert!(output.contains("Total: 2 records"));
    }

    #[test]
    fn test_records_json_is_tagged() {
        let output = Formatter::new(OutputFormat::Json).format_records(&make_records());
        let parsed: serde_json::Value = serde_json::from_str(&output).unwrap();
        assert_eq!(parsed[0]["kind"], "merchant");
        assert_eq!(parsed[0]["category"], "Pizza");
        assert_eq!(parsed[1]["kind"], "menu-item");
        assert_eq!(parsed[1]["restaurant_id"], 1);
    }

    #[test]
    fn test_records_markdown_and_empty() {
        let output = Formatter::new(OutputFormat::Markdown).format_records(&make_records());
        assert!(output.contains("| merchant | Pizzaria São João | Pizza |"));
        assert!(output.contains("*2 records*"));

        assert_eq!(Formatter::new(OutputFormat::Json).format_records(&[]), "[]");
        assert_eq!(Formatter::new(OutputFormat::Table).format_records(&[]), "No records.");
    }

    #[test]
    fn test_profiles_and_cities() {
        let config = Config { city: "Birigui".into(), ..Config::default() };

        let profiles = Formatter::new(OutputFormat::Table).format_profiles(&config);
        assert!(profiles.contains("medium"));
        assert!(profiles.contains("40"));

        let cities = Formatter::new(OutputFormat::Table).format_cities(&config);
        assert!(cities.starts_with("Birigui (active)"));
        assert!(cities.contains("Rio de Janeiro"));
    }
}
