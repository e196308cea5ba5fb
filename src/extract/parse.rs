//! Text post-processing for extracted fields.
//!
//! The storefront renders numbers in Brazilian format ("R$ 1.234,56",
//! "4,7", "1,2 km"), so every parser accepts a comma decimal separator.

use regex_lite::Regex;
use std::sync::LazyLock;

static NUMBER: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"-?\d[\d.,]*").unwrap());

static RANGE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(\d+)\s*(?:-|–|a|até)\s*(\d+)").unwrap());

static DISTANCE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)(\d+(?:[.,]\d+)?)\s*(km|m)\b").unwrap());

const FREE_WORDS: &[&str] = &["grátis", "gratis", "free"];

/// Collapses runs of whitespace into single spaces and trims the ends.
pub fn normalize_whitespace(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Converts a number in either `1.234,56` or `1234.56` form.
fn parse_decimal(token: &str) -> Option<f64> {
    let token = token.trim_end_matches(['.', ',']);
    let normalized = if token.contains(',') {
        token.replace('.', "").replace(',', ".")
    } else if token.matches('.').count() > 1 || is_thousands_grouped(token) {
        token.replace('.', "")
    } else {
        token.to_string()
    };
    normalized.parse().ok()
}

/// "1.234" is one thousand two hundred thirty-four, not 1.234.
fn is_thousands_grouped(token: &str) -> bool {
    let digits = token.trim_start_matches('-');
    match digits.split_once('.') {
        Some((head, tail)) => !head.is_empty() && head.len() <= 3 && tail.len() == 3,
        None => false,
    }
}

/// Parses a currency string to a non-negative decimal.
///
/// "Grátis" and friends are zero. Negative or unparseable amounts are `None`.
pub fn parse_currency(text: &str) -> Option<f64> {
    let lower = text.trim().to_lowercase();
    if lower.is_empty() {
        return None;
    }
    if FREE_WORDS.iter().any(|w| lower.contains(w)) {
        return Some(0.0);
    }

    let token = NUMBER.find(&lower)?.as_str();
    let value = parse_decimal(token)?;
    (value >= 0.0 && value.is_finite()).then_some(value)
}

/// Parses a star rating in the 0-5 range ("4,7", "4.5 ★").
pub fn parse_rating(text: &str) -> Option<f64> {
    let token = NUMBER.find(text.trim())?.as_str();
    let value = parse_decimal(token)?;
    (0.0..=5.0).contains(&value).then_some(value)
}

/// Parses a delivery time to minutes.
///
/// Ranges collapse to their midpoint rounded half up ("30-45 min" is 38).
pub fn parse_minutes(text: &str) -> Option<u32> {
    if let Some(caps) = RANGE.captures(text) {
        let low: u32 = caps.get(1)?.as_str().parse().ok()?;
        let high: u32 = caps.get(2)?.as_str().parse().ok()?;
        let (low, high) = if low <= high { (low, high) } else { (high, low) };
        return u32::try_from((u64::from(low) + u64::from(high)).div_ceil(2)).ok();
    }

    let token = NUMBER.find(text)?.as_str();
    if token.starts_with('-') {
        return None;
    }
    token.trim_end_matches(['.', ',']).split(['.', ',']).next()?.parse().ok()
}

/// Parses a distance to kilometers ("1,2 km", "850 m").
pub fn parse_distance(text: &str) -> Option<f64> {
    let caps = DISTANCE.captures(text)?;
    let value = parse_decimal(caps.get(1)?.as_str())?;
    let unit = caps.get(2)?.as_str().to_lowercase();
    Some(if unit == "m" { value / 1000.0 } else { value })
}

/// Splits a delimited info line into exactly `parts` positional pieces.
///
/// Missing or blank pieces are `None`; extra pieces are ignored.
pub fn split_positional(text: &str, separator: &str, parts: usize) -> Vec<Option<String>> {
    let mut pieces = text.split(separator).map(normalize_whitespace);
    (0..parts).map(|_| pieces.next().filter(|p| !p.is_empty())).collect()
}

/// Resolves a possibly relative link against the site root.
pub fn resolve_url(base: &str, href: &str) -> String {
    let href = href.trim();
    if href.starts_with("http://") || href.starts_with("https://") {
        return href.to_string();
    }
    let base = base.trim_end_matches('/');
    if let Some(rest) = href.strip_prefix("//") {
        let scheme = base.split_once("://").map_or("https", |(s, _)| s);
        return format!("{}://{}", scheme, rest);
    }
    format!("{}/{}", base, href.trim_start_matches('/'))
}

/// Link used for a category tile that has no anchor of its own.
pub fn category_fallback_link(base: &str, name: &str) -> String {
    format!(
        "{}/categoria/{}",
        base.trim_end_matches('/'),
        urlencoding::encode(&name.trim().to_lowercase())
    )
}
