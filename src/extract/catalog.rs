//! Versioned selector catalog.
//!
//! Every cascade the pipeline uses lives in a TOML file so that markup drift
//! is fixed by editing data. The default catalog is compiled into the binary;
//! `Config::selectors` points at a replacement.

use super::models::RecordKind;
use regex_lite::Regex;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::debug;

/// Catalog shipped with the binary.
pub const EMBEDDED_CATALOG: &str = include_str!("../../selectors/catalog.toml");

/// The only catalog format this build understands.
pub const CATALOG_VERSION: u32 = 1;

#[derive(Debug, Error)]
pub enum CatalogError {
    #[error("failed to read selector catalog {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse selector catalog: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("unsupported selector catalog version {found} (expected {expected})")]
    UnsupportedVersion { found: u32, expected: u32 },

    #[error("invalid pattern `{pattern}` in {context}: {reason}")]
    Pattern { context: String, pattern: String, reason: String },

    #[error("invalid selector `{selector}` in {context}")]
    Selector { context: String, selector: String },

    #[error("{context}: {reason}")]
    Invalid { context: String, reason: String },
}

/// How a matched string is post-processed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FieldKind {
    #[default]
    Text,
    Currency,
    Rating,
    Minutes,
    Distance,
    Url,
    /// Delimited line split positionally into sub-fields.
    Split,
}

/// One way of locating a value.
#[derive(Debug, Clone)]
pub enum Strategy {
    /// Structural lookup. No selector means the scope element itself.
    Css { selector: Option<String>, attr: Option<String> },
    /// Text scan: the first candidate whose text matches `regex`.
    Pattern { regex: Regex, within: Option<String>, group: usize, max_len: Option<usize> },
}

impl Strategy {
    /// Short description used as `source` on extracted fields.
    pub fn label(&self) -> String {
        match self {
            Strategy::Css { selector: None, attr: None } => "self".to_string(),
            Strategy::Css { selector: None, attr: Some(a) } => format!("self@{}", a),
            Strategy::Css { selector: Some(s), attr: None } => format!("css `{}`", s),
            Strategy::Css { selector: Some(s), attr: Some(a) } => format!("css `{}`@{}", s, a),
            Strategy::Pattern { regex, within: None, .. } => {
                format!("pattern /{}/", regex.as_str())
            }
            Strategy::Pattern { regex, within: Some(w), .. } => {
                format!("pattern /{}/ in `{}`", regex.as_str(), w)
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartSpec {
    pub name: String,
    pub kind: FieldKind,
}

#[derive(Debug, Clone)]
pub struct SplitSpec {
    pub separator: String,
    pub parts: Vec<PartSpec>,
}

/// Cascade for one logical field.
#[derive(Debug, Clone)]
pub struct FieldSpec {
    pub name: String,
    pub kind: FieldKind,
    pub strategies: Vec<Strategy>,
    pub split: Option<SplitSpec>,
}

/// Extraction schema for one record kind.
#[derive(Debug, Clone)]
pub struct Schema {
    pub kind: RecordKind,
    /// Cascade locating record root elements; the first strategy that
    /// yields any element wins.
    pub items: Vec<Strategy>,
    /// Section containers (e.g. menu groups); items are searched inside each.
    pub groups: Vec<String>,
    pub group_name: Vec<Strategy>,
    /// Field that receives the section name.
    pub group_field: String,
    pub min_name_len: usize,
    pub fields: Vec<FieldSpec>,
}

/// Page controls the scroll loop and location setup interact with.
#[derive(Debug, Clone)]
pub struct Controls {
    pub load_more: Vec<Strategy>,
    pub loading: Vec<Strategy>,
    pub address_input: Vec<Strategy>,
    pub address_options: Vec<String>,
    pub confirm_buttons: Vec<Strategy>,
    pub restaurants_link: Vec<Strategy>,
}

#[derive(Debug, Clone)]
pub struct SelectorCatalog {
    pub version: u32,
    pub controls: Controls,
    pub category: Schema,
    pub merchant: Schema,
    pub menu_item: Schema,
}

#[derive(Deserialize)]
struct VersionHeader {
    version: u32,
}

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct RawCatalog {
    #[allow(dead_code)]
    version: u32,
    controls: RawControls,
    category: RawSchema,
    merchant: RawSchema,
    menu_item: RawSchema,
}

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct RawControls {
    #[serde(default)]
    load_more: Vec<RawStrategy>,
    #[serde(default)]
    loading: Vec<RawStrategy>,
    #[serde(default)]
    address_input: Vec<RawStrategy>,
    #[serde(default)]
    address_options: Vec<String>,
    #[serde(default)]
    confirm_buttons: Vec<RawStrategy>,
    #[serde(default)]
    restaurants_link: Vec<RawStrategy>,
}

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct RawSchema {
    items: Vec<RawStrategy>,
    #[serde(default)]
    groups: Vec<String>,
    #[serde(default)]
    group_name: Vec<RawStrategy>,
    #[serde(default = "default_group_field")]
    group_field: String,
    #[serde(default = "default_min_name_len")]
    min_name_len: usize,
    fields: Vec<RawField>,
}

fn default_group_field() -> String {
    "category".to_string()
}

fn default_min_name_len() -> usize {
    2
}

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct RawField {
    name: String,
    #[serde(default)]
    kind: FieldKind,
    strategies: Vec<RawStrategy>,
    #[serde(default)]
    separator: Option<String>,
    #[serde(default)]
    parts: Vec<RawPart>,
}

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct RawPart {
    name: String,
    #[serde(default)]
    kind: FieldKind,
}

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct RawStrategy {
    css: Option<String>,
    attr: Option<String>,
    pattern: Option<String>,
    within: Option<String>,
    group: Option<usize>,
    max_len: Option<usize>,
}

fn check_css(context: &str, selector: &str) -> Result<(), CatalogError> {
    scraper::Selector::parse(selector).map(|_| ()).map_err(|_| CatalogError::Selector {
        context: context.to_string(),
        selector: selector.to_string(),
    })
}

fn invalid(context: &str, reason: &str) -> CatalogError {
    CatalogError::Invalid { context: context.to_string(), reason: reason.to_string() }
}

fn compile_strategy(context: &str, raw: RawStrategy) -> Result<Strategy, CatalogError> {
    match raw.pattern {
        Some(pattern) => {
            if raw.css.is_some() || raw.attr.is_some() {
                return Err(invalid(context, "a pattern strategy cannot also set `css` or `attr`"));
            }
            if let Some(within) = &raw.within {
                check_css(context, within)?;
            }
            let regex = Regex::new(&pattern).map_err(|e| CatalogError::Pattern {
                context: context.to_string(),
                pattern: pattern.clone(),
                reason: e.to_string(),
            })?;
            let group = raw.group.unwrap_or(0);
            if group >= regex.captures_len() {
                return Err(invalid(context, "capture group index is out of range"));
            }
            Ok(Strategy::Pattern { regex, within: raw.within, group, max_len: raw.max_len })
        }
        None => {
            if raw.within.is_some() || raw.group.is_some() || raw.max_len.is_some() {
                return Err(invalid(context, "`within`, `group` and `max_len` need a `pattern`"));
            }
            if let Some(css) = &raw.css {
                check_css(context, css)?;
            }
            Ok(Strategy::Css { selector: raw.css, attr: raw.attr })
        }
    }
}

fn compile_list(context: &str, raw: Vec<RawStrategy>) -> Result<Vec<Strategy>, CatalogError> {
    raw.into_iter()
        .enumerate()
        .map(|(i, s)| compile_strategy(&format!("{}[{}]", context, i), s))
        .collect()
}

fn compile_field(context: &str, raw: RawField) -> Result<FieldSpec, CatalogError> {
    let context = format!("{}.{}", context, raw.name);
    if raw.strategies.is_empty() {
        return Err(invalid(&context, "field has no strategies"));
    }

    let split = match raw.kind {
        FieldKind::Split => {
            if raw.parts.is_empty() {
                return Err(invalid(&context, "split field needs `parts`"));
            }
            if raw.parts.iter().any(|p| p.kind == FieldKind::Split) {
                return Err(invalid(&context, "split parts cannot themselves be split"));
            }
            let parts =
                raw.parts.into_iter().map(|p| PartSpec { name: p.name, kind: p.kind }).collect();
            Some(SplitSpec { separator: raw.separator.unwrap_or_else(|| "•".to_string()), parts })
        }
        _ if !raw.parts.is_empty() || raw.separator.is_some() => {
            return Err(invalid(&context, "`parts` and `separator` only apply to split fields"));
        }
        _ => None,
    };

    Ok(FieldSpec {
        strategies: compile_list(&format!("{}.strategies", context), raw.strategies)?,
        name: raw.name,
        kind: raw.kind,
        split,
    })
}

fn compile_schema(kind: RecordKind, raw: RawSchema) -> Result<Schema, CatalogError> {
    let context = kind.to_string();
    if raw.items.is_empty() {
        return Err(invalid(&context, "schema has no item selectors"));
    }
    if !raw.fields.iter().any(|f| f.name == "name") {
        return Err(invalid(&context, "schema has no `name` field"));
    }
    for group in &raw.groups {
        check_css(&format!("{}.groups", context), group)?;
    }

    let fields = raw
        .fields
        .into_iter()
        .map(|f| compile_field(&format!("{}.fields", context), f))
        .collect::<Result<Vec<_>, _>>()?;

    Ok(Schema {
        kind,
        items: compile_list(&format!("{}.items", context), raw.items)?,
        groups: raw.groups,
        group_name: compile_list(&format!("{}.group_name", context), raw.group_name)?,
        group_field: raw.group_field,
        min_name_len: raw.min_name_len,
        fields,
    })
}

impl SelectorCatalog {
    /// Parses and validates a catalog document.
    pub fn from_toml(content: &str) -> Result<Self, CatalogError> {
        let header: VersionHeader = toml::from_str(content)?;
        if header.version != CATALOG_VERSION {
            return Err(CatalogError::UnsupportedVersion {
                found: header.version,
                expected: CATALOG_VERSION,
            });
        }

        let raw: RawCatalog = toml::from_str(content)?;
        for option in &raw.controls.address_options {
            check_css("controls.address_options", option)?;
        }

        let controls = Controls {
            load_more: compile_list("controls.load_more", raw.controls.load_more)?,
            loading: compile_list("controls.loading", raw.controls.loading)?,
            address_input: compile_list("controls.address_input", raw.controls.address_input)?,
            address_options: raw.controls.address_options,
            confirm_buttons: compile_list("controls.confirm_buttons", raw.controls.confirm_buttons)?,
            restaurants_link: compile_list(
                "controls.restaurants_link",
                raw.controls.restaurants_link,
            )?,
        };

        Ok(Self {
            version: header.version,
            controls,
            category: compile_schema(RecordKind::Category, raw.category)?,
            merchant: compile_schema(RecordKind::Merchant, raw.merchant)?,
            menu_item: compile_schema(RecordKind::MenuItem, raw.menu_item)?,
        })
    }

    /// The catalog compiled into the binary.
    pub fn embedded() -> Result<Self, CatalogError> {
        Self::from_toml(EMBEDDED_CATALOG)
    }

    pub fn from_file(path: &Path) -> Result<Self, CatalogError> {
        debug!("Loading selector catalog from {}", path.display());
        let content = std::fs::read_to_string(path)
            .map_err(|source| CatalogError::Read { path: path.to_path_buf(), source })?;
        Self::from_toml(&content)
    }

    /// Loads `path` when given, the embedded catalog otherwise.
    pub fn load(path: Option<&Path>) -> Result<Self, CatalogError> {
        match path {
            Some(p) => Self::from_file(p),
            None => Self::embedded(),
        }
    }

    pub fn schema(&self, kind: RecordKind) -> &Schema {
        match kind {
            RecordKind::Category => &self.category,
            RecordKind::Merchant => &self.merchant,
            RecordKind::MenuItem => &self.menu_item,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn minimal(extra_merchant_field: &str) -> String {
        format!(
            r#"
            version = 1
            [controls]
            [category]
            items = [{{ css = ".cat" }}]
            [[category.fields]]
            name = "name"
            strategies = [{{ css = ".t" }}]
            [merchant]
            items = [{{ css = ".m" }}]
            [[merchant.fields]]
            name = "name"
            strategies = [{{ css = "h3" }}]
            {}
            [menu_item]
            items = [{{ css = ".d" }}]
            [[menu_item.fields]]
            name = "name"
            strategies = [{{ css = "h4" }}]
            "#,
            extra_merchant_field
        )
    }

    #[test]
    fn test_embedded_catalog_loads() {
        let catalog = SelectorCatalog::embedded().unwrap();
        assert_eq!(catalog.version, CATALOG_VERSION);
        assert!(!catalog.controls.load_more.is_empty());
        assert!(!catalog.controls.address_options.is_empty());

        let merchant = catalog.schema(RecordKind::Merchant);
        assert_eq!(merchant.min_name_len, 3);
        let info = merchant.fields.iter().find(|f| f.name == "info").unwrap();
        let split = info.split.as_ref().unwrap();
        assert_eq!(split.separator, "•");
        assert_eq!(split.parts[0], PartSpec { name: "rating".into(), kind: FieldKind::Rating });

        let menu = catalog.schema(RecordKind::MenuItem);
        assert_eq!(menu.group_field, "category");
        assert!(!menu.groups.is_empty());
    }

    #[test]
    fn test_minimal_catalog_defaults() {
        let catalog = SelectorCatalog::from_toml(&minimal("")).unwrap();
        assert_eq!(catalog.category.min_name_len, 2);
        assert!(catalog.controls.load_more.is_empty());
        assert_eq!(catalog.merchant.fields[0].kind, FieldKind::Text);
    }

    #[test]
    fn test_unsupported_version() {
        let doc = minimal("").replace("version = 1", "version = 2");
        let err = SelectorCatalog::from_toml(&doc).unwrap_err();
        assert!(matches!(err, CatalogError::UnsupportedVersion { found: 2, expected: 1 }));
    }

    #[test]
    fn test_invalid_pattern_rejected() {
        let field = r#"
            [[merchant.fields]]
            name = "fee"
            strategies = [{ pattern = "(unclosed" }]
        "#;
        let err = SelectorCatalog::from_toml(&minimal(field)).unwrap_err();
        assert!(matches!(err, CatalogError::Pattern { .. }));
    }

    #[test]
    fn test_invalid_css_rejected() {
        let field = r#"
            [[merchant.fields]]
            name = "fee"
            strategies = [{ css = "span[" }]
        "#;
        let err = SelectorCatalog::from_toml(&minimal(field)).unwrap_err();
        assert!(err.to_string().contains("merchant.fields.fee"));
    }

    #[test]
    fn test_group_out_of_range_rejected() {
        let field = r#"
            [[merchant.fields]]
            name = "fee"
            strategies = [{ pattern = "R\\$ (\\d+)", group = 2 }]
        "#;
        let err = SelectorCatalog::from_toml(&minimal(field)).unwrap_err();
        assert!(err.to_string().contains("capture group"));
    }

    #[test]
    fn test_split_requires_parts() {
        let field = r#"
            [[merchant.fields]]
            name = "info"
            kind = "split"
            strategies = [{ css = ".info" }]
        "#;
        let err = SelectorCatalog::from_toml(&minimal(field)).unwrap_err();
        assert!(err.to_string().contains("parts"));
    }

    #[test]
    fn test_missing_name_field() {
        let doc = minimal("").replace(
            "name = \"name\"\n            strategies = [{ css = \"h4\" }]",
            "name = \"title\"\n            strategies = [{ css = \"h4\" }]",
        );
        let err = SelectorCatalog::from_toml(&doc).unwrap_err();
        assert!(err.to_string().contains("menu-item"));
    }

    #[test]
    fn test_unknown_key_rejected() {
        let field = r#"
            [[merchant.fields]]
            name = "fee"
            strategies = [{ selector = ".fee" }]
        "#;
        assert!(matches!(
            SelectorCatalog::from_toml(&minimal(field)),
            Err(CatalogError::Parse(_))
        ));
    }

    #[test]
    fn test_strategy_labels() {
        let css = Strategy::Css { selector: Some("h3".into()), attr: None };
        assert_eq!(css.label(), "css `h3`");
        let own = Strategy::Css { selector: None, attr: Some("href".into()) };
        assert_eq!(own.label(), "self@href");
        let pattern = Strategy::Pattern {
            regex: Regex::new("km").unwrap(),
            within: Some("div".into()),
            group: 0,
            max_len: None,
        };
        assert_eq!(pattern.label(), "pattern /km/ in `div`");
    }

    #[test]
    fn test_from_file_missing() {
        let err = SelectorCatalog::from_file(Path::new("/nonexistent/catalog.toml")).unwrap_err();
        assert!(matches!(err, CatalogError::Read { .. }));
    }
}
