use std::collections::BTreeMap;

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

use crate::schema::{FormSchema, PageSchema};

/// Ordered `field -> value` mapping for one page. `None` means the field was
/// not found in the model output.
pub type PageFields = IndexMap<String, Option<String>>;

/// Per-file extraction result keyed by page number.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExtractedRecord {
    pub pages: BTreeMap<u32, PageFields>,
}

impl ExtractedRecord {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert_page(&mut self, page_number: u32, fields: PageFields) {
        self.pages.insert(page_number, fields);
    }

    pub fn page(&self, page_number: u32) -> Option<&PageFields> {
        self.pages.get(&page_number)
    }

    /// Value of the schema's reference field, if any page produced one.
    pub fn reference(&self, schema: &FormSchema) -> Option<&str> {
        let reference_field = schema.reference_field();
        self.pages
            .values()
            .filter_map(|fields| fields.get(reference_field))
            .find_map(|value| value.as_deref())
            .filter(|value| !value.trim().is_empty())
    }
}

/// Page mapping with every schema field present and set to null.
pub fn empty_page(page: &PageSchema) -> PageFields {
    page.fields
        .iter()
        .map(|field| (field.clone(), None))
        .collect()
}
