//! Schema-driven record extraction.

use super::cascade;
use super::catalog::{FieldKind, FieldSpec, Schema};
use super::models::{CandidateRecord, FieldValue, ParentContext, RecordKind};
use super::parse;
use crate::page::{ElementHandle, PageDriver, PageError, Scope};
use tracing::{debug, trace};

/// Turns DOM elements into [`CandidateRecord`]s according to a [`Schema`].
pub struct FieldExtractor {
    schema: Schema,
    base_url: String,
    blocklist: Vec<String>,
}

/// Applies a field kind's post-processing to raw text.
pub fn parse_value(kind: FieldKind, raw: &str, base_url: &str) -> Option<FieldValue> {
    match kind {
        FieldKind::Text | FieldKind::Split => {
            let text = parse::normalize_whitespace(raw);
            (!text.is_empty()).then_some(FieldValue::Text(text))
        }
        FieldKind::Currency => parse::parse_currency(raw).map(FieldValue::Number),
        FieldKind::Rating => parse::parse_rating(raw).map(FieldValue::Number),
        FieldKind::Minutes => parse::parse_minutes(raw).map(FieldValue::Minutes),
        FieldKind::Distance => parse::parse_distance(raw).map(FieldValue::Number),
        FieldKind::Url => Some(FieldValue::Text(parse::resolve_url(base_url, raw))),
    }
}

impl FieldExtractor {
    pub fn new(schema: Schema, base_url: impl Into<String>) -> Self {
        Self { schema, base_url: base_url.into(), blocklist: Vec::new() }
    }

    /// Names containing any of these words (case-insensitive) are dropped.
    pub fn with_blocklist(mut self, words: &[String]) -> Self {
        self.blocklist =
            words.iter().map(|w| w.trim().to_lowercase()).filter(|w| !w.is_empty()).collect();
        self
    }

    pub fn kind(&self) -> RecordKind {
        self.schema.kind
    }

    fn apply(
        &self,
        mut record: CandidateRecord,
        field: &FieldSpec,
        raw: String,
    ) -> CandidateRecord {
        let value = parse_value(field.kind, &raw, &self.base_url);

        if let Some(split) = &field.split {
            let pieces = parse::split_positional(&raw, &split.separator, split.parts.len());
            for (part, piece) in split.parts.iter().zip(pieces) {
                if record.value(&part.name).is_some() {
                    continue;
                }
                let parsed =
                    piece.as_deref().and_then(|p| parse_value(part.kind, p, &self.base_url));
                record = record.with_value(&part.name, piece, parsed);
            }
        }

        record.with_value(&field.name, Some(raw), value)
    }

    fn rejects(&self, name: Option<&str>) -> Option<String> {
        let Some(name) = name else {
            return Some("no name".to_string());
        };
        if name.chars().count() < self.schema.min_name_len {
            return Some(format!("name `{}` is shorter than {}", name, self.schema.min_name_len));
        }
        let lower = name.to_lowercase();
        self.blocklist
            .iter()
            .find(|word| lower.contains(word.as_str()))
            .map(|word| format!("name `{}` contains blocklisted `{}`", name, word))
    }

    /// Extracts one record from `element`.
    ///
    /// Returns `Ok(None)` when the element has no usable name; that is
    /// logged, not reported.
    pub async fn extract(
        &self,
        page: &dyn PageDriver,
        element: ElementHandle,
        parent: &ParentContext,
        group: Option<&str>,
    ) -> Result<Option<CandidateRecord>, PageError> {
        let scope = Scope::Element(element);
        let mut record = CandidateRecord::new(self.schema.kind, parent.clone());

        for field in &self.schema.fields {
            match cascade::resolve(page, scope, &field.strategies).await? {
                Some(found) => {
                    record = self
                        .apply(record, field, found.value)
                        .with_source(&field.name, found.source);
                }
                None if record.value(&field.name).is_none() => {
                    record = record.with_value(&field.name, None, None);
                }
                None => {}
            }
        }

        if let Some(reason) = self.rejects(record.text("name")) {
            debug!("Skipping {} element: {}", self.schema.kind, reason);
            return Ok(None);
        }

        if let Some(group) = group {
            let field = self.schema.group_field.as_str();
            if record.value(field).is_none() {
                let value = parse_value(FieldKind::Text, group, "");
                record = record.with_value(field, Some(group.to_string()), value);
            }
        }

        if self.schema.kind == RecordKind::Category && record.text("link").is_none() {
            let link = parse::category_fallback_link(&self.base_url, record.name());
            record = record
                .with_value("link", None, Some(FieldValue::Text(link)))
                .with_source("link", "fallback");
        }

        Ok(Some(record))
    }

    /// Section containers and their names, when the schema declares groups.
    async fn groups(
        &self,
        page: &dyn PageDriver,
    ) -> Result<Vec<(ElementHandle, Option<String>)>, PageError> {
        for selector in &self.schema.groups {
            let found = match page.query_selector_all(Scope::Page, selector).await {
                Ok(found) if !found.is_empty() => found,
                Ok(_) => continue,
                Err(e) if e.is_transient() => {
                    debug!("group selector `{}` failed: {}", selector, e);
                    continue;
                }
                Err(e) => return Err(e),
            };

            let mut groups = Vec::with_capacity(found.len());
            for element in found {
                let name = cascade::resolve(page, Scope::Element(element), &self.schema.group_name)
                    .await?
                    .map(|m| parse::normalize_whitespace(&m.value));
                groups.push((element, name));
            }
            return Ok(groups);
        }
        Ok(Vec::new())
    }

    async fn extract_in(
        &self,
        page: &dyn PageDriver,
        scope: Scope,
        parent: &ParentContext,
        group: Option<&str>,
        out: &mut Vec<CandidateRecord>,
    ) -> Result<(), PageError> {
        let found = cascade::resolve_elements(page, scope, &self.schema.items).await?;
        let Some((elements, source)) = found else {
            trace!("no {} elements in scope", self.schema.kind);
            return Ok(());
        };
        trace!("{} {} elements via {}", elements.len(), self.schema.kind, source);

        for element in elements {
            match self.extract(page, element, parent, group).await {
                Ok(Some(record)) => out.push(record),
                Ok(None) => {}
                Err(e) if e.is_transient() => {
                    debug!("Skipping {} element: {}", self.schema.kind, e)
                }
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }

    /// One extraction pass over everything currently rendered, in document
    /// order. Records repeat across passes; callers deduplicate.
    pub async fn extract_visible(
        &self,
        page: &dyn PageDriver,
        parent: &ParentContext,
    ) -> Result<Vec<CandidateRecord>, PageError> {
        page.release_handles().await;
        let mut records = Vec::new();
        let groups = self.groups(page).await?;

        if groups.is_empty() {
            self.extract_in(page, Scope::Page, parent, None, &mut records).await?;
        } else {
            for (group, name) in groups {
                self.extract_in(page, Scope::Element(group), parent, name.as_deref(), &mut records)
                    .await?;
            }
        }

        debug!("Extracted {} {} records", records.len(), self.schema.kind);
        Ok(records)
    }
}
