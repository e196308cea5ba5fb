//! Adaptive extraction: selector catalog, cascades, and record building.

pub mod cascade;
pub mod catalog;
pub mod fields;
pub mod models;
pub mod parse;

pub use cascade::FieldMatch;
pub use catalog::{CatalogError, Controls, FieldKind, Schema, SelectorCatalog, Strategy};
pub use fields::FieldExtractor;
pub use models::{
    CandidateRecord, Category, FieldValue, MenuItem, Merchant, ParentContext, Record, RecordKind,
};
