//! Candidate records and the typed rows they become.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// What a record describes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RecordKind {
    Category,
    Merchant,
    MenuItem,
}

impl RecordKind {
    /// Backing table in the store.
    pub fn table(&self) -> &'static str {
        match self {
            RecordKind::Category => "categories",
            RecordKind::Merchant => "restaurants",
            RecordKind::MenuItem => "products",
        }
    }
}

impl std::str::FromStr for RecordKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().replace('_', "-").as_str() {
            "category" | "categories" => Ok(RecordKind::Category),
            "merchant" | "merchants" | "restaurant" => Ok(RecordKind::Merchant),
            "menu-item" | "item" | "product" => Ok(RecordKind::MenuItem),
            _ => Err(format!("Unknown kind: {}. Use: category, merchant, menu-item", s)),
        }
    }
}

impl fmt::Display for RecordKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RecordKind::Category => write!(f, "category"),
            RecordKind::Merchant => write!(f, "merchant"),
            RecordKind::MenuItem => write!(f, "menu-item"),
        }
    }
}

/// Post-processed value of a field.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FieldValue {
    Text(String),
    Number(f64),
    Minutes(u32),
}

impl FieldValue {
    pub fn as_text(&self) -> Option<&str> {
        match self {
            FieldValue::Text(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_number(&self) -> Option<f64> {
        match self {
            FieldValue::Number(n) => Some(*n),
            FieldValue::Minutes(m) => Some(f64::from(*m)),
            FieldValue::Text(_) => None,
        }
    }

    pub fn as_minutes(&self) -> Option<u32> {
        match self {
            FieldValue::Minutes(m) => Some(*m),
            _ => None,
        }
    }
}

/// Scope a record was extracted under.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ParentContext {
    pub city: String,
    /// Category a merchant was listed under.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub category: Option<String>,
    /// Merchant a menu item belongs to.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub merchant: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub merchant_id: Option<i64>,
}

impl ParentContext {
    pub fn city(city: impl Into<String>) -> Self {
        Self { city: city.into(), ..Self::default() }
    }

    pub fn with_category(mut self, category: impl Into<String>) -> Self {
        self.category = Some(category.into());
        self
    }

    pub fn with_merchant(mut self, merchant: impl Into<String>, id: Option<i64>) -> Self {
        self.merchant = Some(merchant.into());
        self.merchant_id = id;
        self
    }
}

/// An extracted, not yet deduplicated record.
///
/// Built once by the field extractor (or a test) and read-only afterwards.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CandidateRecord {
    kind: RecordKind,
    fields: BTreeMap<String, Option<String>>,
    values: BTreeMap<String, FieldValue>,
    sources: BTreeMap<String, String>,
    parent: ParentContext,
}

impl CandidateRecord {
    pub fn new(kind: RecordKind, parent: ParentContext) -> Self {
        Self {
            kind,
            fields: BTreeMap::new(),
            values: BTreeMap::new(),
            sources: BTreeMap::new(),
            parent,
        }
    }

    /// Shorthand for a record with just a name.
    pub fn named(kind: RecordKind, name: impl Into<String>, parent: ParentContext) -> Self {
        let name = name.into();
        Self::new(kind, parent).with_value("name", Some(name.clone()), Some(FieldValue::Text(name)))
    }

    /// Sets the raw text of a field and its parsed value.
    pub fn with_value(
        mut self,
        field: &str,
        raw: Option<String>,
        value: Option<FieldValue>,
    ) -> Self {
        self.fields.insert(field.to_string(), raw);
        match value {
            Some(v) => {
                self.values.insert(field.to_string(), v);
            }
            None => {
                self.values.remove(field);
            }
        }
        self
    }

    /// Records which strategy produced a field.
    pub fn with_source(mut self, field: &str, source: impl Into<String>) -> Self {
        self.sources.insert(field.to_string(), source.into());
        self
    }

    pub fn kind(&self) -> RecordKind {
        self.kind
    }

    pub fn parent(&self) -> &ParentContext {
        &self.parent
    }

    pub fn name(&self) -> &str {
        self.text("name").unwrap_or_default()
    }

    /// Raw extracted text, `None` when the field was missing.
    pub fn raw(&self, field: &str) -> Option<&str> {
        self.fields.get(field).and_then(|v| v.as_deref())
    }

    pub fn value(&self, field: &str) -> Option<&FieldValue> {
        self.values.get(field)
    }

    pub fn text(&self, field: &str) -> Option<&str> {
        self.value(field).and_then(FieldValue::as_text)
    }

    pub fn number(&self, field: &str) -> Option<f64> {
        self.value(field).and_then(FieldValue::as_number)
    }

    pub fn minutes(&self, field: &str) -> Option<u32> {
        self.value(field).and_then(FieldValue::as_minutes)
    }

    pub fn has_field(&self, field: &str) -> bool {
        self.fields.contains_key(field)
    }

    /// Selector that produced `field`, for diagnostics.
    pub fn source(&self, field: &str) -> Option<&str> {
        self.sources.get(field).map(String::as_str)
    }
}

/// A category row.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Category {
    pub name: String,
    pub link: Option<String>,
    pub city: String,
}

/// A merchant (restaurant) row.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Merchant {
    pub name: String,
    pub city: String,
    pub category: Option<String>,
    pub cuisine: Option<String>,
    pub rating: Option<f64>,
    pub distance_km: Option<f64>,
    pub delivery_fee: Option<f64>,
    pub delivery_time_min: Option<u32>,
    pub min_order: Option<f64>,
    pub link: Option<String>,
}

/// A menu item (product) row.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MenuItem {
    pub restaurant_id: Option<i64>,
    pub restaurant_name: String,
    pub city: String,
    pub name: String,
    pub category: Option<String>,
    pub description: Option<String>,
    pub price: Option<f64>,
}

/// Typed form of a candidate, ready to insert.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum Record {
    Category(Category),
    Merchant(Merchant),
    MenuItem(MenuItem),
}

impl Record {
    /// Converts a candidate and range-checks its typed fields.
    pub fn from_candidate(candidate: &CandidateRecord) -> Result<Self, String> {
        let parent = candidate.parent();
        let name = candidate.name().trim().to_string();
        if name.is_empty() {
            return Err("record has no name".to_string());
        }

        let owned = |field: &str| candidate.text(field).map(str::to_string);

        let record = match candidate.kind() {
            RecordKind::Category => Record::Category(Category {
                name,
                link: owned("link"),
                city: parent.city.clone(),
            }),
            RecordKind::Merchant => Record::Merchant(Merchant {
                name,
                city: parent.city.clone(),
                category: owned("category").or_else(|| parent.category.clone()),
                cuisine: owned("cuisine"),
                rating: candidate.number("rating"),
                distance_km: candidate.number("distance_km"),
                delivery_fee: candidate.number("delivery_fee"),
                delivery_time_min: candidate.minutes("delivery_time"),
                min_order: candidate.number("min_order"),
                link: owned("link"),
            }),
            RecordKind::MenuItem => Record::MenuItem(MenuItem {
                restaurant_id: parent.merchant_id,
                restaurant_name: parent.merchant.clone().unwrap_or_default(),
                city: parent.city.clone(),
                name,
                category: owned("category"),
                description: owned("description"),
                price: candidate.number("price"),
            }),
        };

        record.validate()?;
        Ok(record)
    }

    fn validate(&self) -> Result<(), String> {
        fn money(label: &str, v: Option<f64>) -> Result<(), String> {
            match v {
                Some(x) if !x.is_finite() || x < 0.0 => Err(format!("{} out of range: {}", label, x)),
                _ => Ok(()),
            }
        }

        match self {
            Record::Category(_) => Ok(()),
            Record::Merchant(m) => {
                if let Some(r) = m.rating {
                    if !(0.0..=5.0).contains(&r) {
                        return Err(format!("rating out of range: {}", r));
                    }
                }
                money("delivery fee", m.delivery_fee)?;
                money("minimum order", m.min_order)?;
                money("distance", m.distance_km)
            }
            Record::MenuItem(item) => money("price", item.price),
        }
    }
}
