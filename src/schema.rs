use std::collections::HashSet;
use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use indexmap::IndexSet;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::cli::BuiltinForm;
use crate::error::SchemaError;

const MEDICAL_REPORT_SCHEMA: &str = include_str!("../schema/medical_report.json");
const CONSENT_FORM_SCHEMA: &str = include_str!("../schema/consent_form.json");

/// Expected fields for one page of the source form.
///
/// Field names are used verbatim as record keys. For the questionnaire pages
/// they are the printed question text.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PageSchema {
    pub page_number: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub table: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context: Option<String>,
    pub fields: Vec<String>,
}

impl PageSchema {
    #[cfg(test)]
    pub fn new(page_number: u32, fields: &[&str]) -> Self {
        Self {
            page_number,
            table: None,
            context: None,
            fields: fields.iter().map(|field| (*field).to_string()).collect(),
        }
    }

    #[cfg(test)]
    pub fn with_table(mut self, table: &str) -> Self {
        self.table = Some(table.to_string());
        self
    }

    /// Table receiving this page's fields in grouped export.
    pub fn table_name(&self) -> String {
        self.table
            .clone()
            .unwrap_or_else(|| format!("page_{}", self.page_number))
    }

    pub fn contains(&self, field: &str) -> bool {
        self.fields.iter().any(|candidate| candidate == field)
    }
}

/// Ordered page/field registry. Validated on construction and never mutated
/// afterwards.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FormSchema {
    form_name: String,
    reference_field: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    wide_table: Option<String>,
    pages: Vec<PageSchema>,
}

impl FormSchema {
    #[cfg(test)]
    pub fn new(
        form_name: &str,
        reference_field: &str,
        pages: Vec<PageSchema>,
    ) -> Result<Self, SchemaError> {
        let schema = Self {
            form_name: form_name.to_string(),
            reference_field: reference_field.to_string(),
            wide_table: None,
            pages,
        };
        schema.validate()?;
        Ok(schema)
    }

    pub fn from_json_str(raw: &str) -> Result<Self, SchemaError> {
        let schema: Self = serde_json::from_str(raw)?;
        schema.validate()?;
        Ok(schema)
    }

    pub fn load(path: &Path) -> Result<Self> {
        let raw = fs::read_to_string(path)
            .with_context(|| format!("failed to read form schema {}", path.display()))?;
        Self::from_json_str(&raw)
            .with_context(|| format!("failed to load form schema {}", path.display()))
    }

    pub fn builtin(form: BuiltinForm) -> Result<Self, SchemaError> {
        let raw = match form {
            BuiltinForm::MedicalReport => MEDICAL_REPORT_SCHEMA,
            BuiltinForm::ConsentForm => CONSENT_FORM_SCHEMA,
        };
        Self::from_json_str(raw)
    }

    fn validate(&self) -> Result<(), SchemaError> {
        if self.pages.is_empty() {
            return Err(SchemaError::NoPages);
        }

        let mut previous: Option<u32> = None;
        for page in &self.pages {
            if let Some(previous) = previous {
                if page.page_number <= previous {
                    return Err(SchemaError::PageOrder {
                        previous,
                        page: page.page_number,
                    });
                }
            }
            previous = Some(page.page_number);

            let mut seen = HashSet::new();
            for field in &page.fields {
                if field.trim().is_empty() {
                    return Err(SchemaError::EmptyField(page.page_number));
                }
                if !seen.insert(field.as_str()) {
                    return Err(SchemaError::DuplicateField {
                        page: page.page_number,
                        field: field.clone(),
                    });
                }
            }
        }

        if self.owner_of(&self.reference_field).is_none() {
            return Err(SchemaError::MissingReferenceField(
                self.reference_field.clone(),
            ));
        }

        Ok(())
    }

    pub fn form_name(&self) -> &str {
        &self.form_name
    }

    pub fn reference_field(&self) -> &str {
        &self.reference_field
    }

    pub fn wide_table(&self) -> &str {
        self.wide_table.as_deref().unwrap_or(&self.form_name)
    }

    pub fn pages(&self) -> &[PageSchema] {
        &self.pages
    }

    pub fn page(&self, page_number: u32) -> Result<&PageSchema, SchemaError> {
        self.pages
            .iter()
            .find(|page| page.page_number == page_number)
            .ok_or(SchemaError::UnknownPage(page_number))
    }

    pub fn fields_for_page(&self, page_number: u32) -> Result<&[String], SchemaError> {
        self.page(page_number).map(|page| page.fields.as_slice())
    }

    /// First page declaring `field`.
    pub fn owner_of(&self, field: &str) -> Option<&PageSchema> {
        self.pages.iter().find(|page| page.contains(field))
    }

    /// Every field in page order, without repeats.
    pub fn all_fields(&self) -> Vec<&str> {
        let fields: IndexSet<&str> = self
            .pages
            .iter()
            .flat_map(|page| page.fields.iter().map(String::as_str))
            .collect();
        fields.into_iter().collect()
    }

    pub fn field_count(&self) -> usize {
        self.pages.iter().map(|page| page.fields.len()).sum()
    }
}

/// Resolves the schema for a command: an explicit file wins over the built-in
/// form.
pub fn load_schema(form: BuiltinForm, schema_path: Option<&Path>) -> Result<FormSchema> {
    let schema = match schema_path {
        Some(path) => FormSchema::load(path)?,
        None => FormSchema::builtin(form)
            .with_context(|| format!("built-in schema {} is invalid", form.as_str()))?,
    };

    info!(
        form = %schema.form_name(),
        pages = schema.pages().len(),
        fields = schema.field_count(),
        "loaded form schema"
    );

    Ok(schema)
}
