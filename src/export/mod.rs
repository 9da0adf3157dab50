//! Shapes an [`ExtractedRecord`] for output: one flat namespace for CSV and
//! wide tables, or one row per table for grouped storage.

use indexmap::IndexMap;

use crate::error::ExportError;
use crate::record::{ExtractedRecord, PageFields};
use crate::schema::FormSchema;

pub mod csv;
pub mod store;
#[cfg(test)]
mod tests;

/// Column name -> value, in output order.
pub type Row = IndexMap<String, Option<String>>;

/// Concatenates every page into one namespace, in page order. When a field
/// name appears on more than one page the later page's value wins.
pub fn to_record(record: &ExtractedRecord) -> PageFields {
    let mut flat = PageFields::new();
    for fields in record.pages.values() {
        for (field, value) in fields {
            flat.insert(field.clone(), value.clone());
        }
    }
    flat
}

/// Splits a flat mapping back into pages using the schema's field ownership.
/// Pages with none of their fields present are left out.
pub fn split_record(flat: &PageFields, schema: &FormSchema) -> ExtractedRecord {
    let mut record = ExtractedRecord::new();
    for page in schema.pages() {
        let fields: PageFields = page
            .fields
            .iter()
            .filter_map(|field| flat.get(field).map(|value| (field.clone(), value.clone())))
            .collect();
        if !fields.is_empty() {
            record.insert_page(page.page_number, fields);
        }
    }
    record
}

fn require_reference<'a>(
    record: &'a ExtractedRecord,
    schema: &FormSchema,
) -> Result<&'a str, ExportError> {
    record
        .reference(schema)
        .ok_or_else(|| ExportError::MissingReference(schema.reference_field().to_string()))
}

/// Single wide row: reference first, then every extracted field.
pub fn to_wide_row(record: &ExtractedRecord, schema: &FormSchema) -> Result<Row, ExportError> {
    let reference = require_reference(record, schema)?;
    let reference_field = schema.reference_field();

    let mut row = Row::new();
    row.insert(reference_field.to_string(), Some(reference.to_string()));
    row.extend(to_record(record));
    row.insert(reference_field.to_string(), Some(reference.to_string()));

    Ok(row)
}

/// One row per table named by the pages' `table` grouping. Only tables with at
/// least one extracted page get a row, and each row starts with the reference
/// value as its join key.
pub fn to_grouped_rows(
    record: &ExtractedRecord,
    schema: &FormSchema,
) -> Result<IndexMap<String, Row>, ExportError> {
    let reference = require_reference(record, schema)?;
    let reference_field = schema.reference_field();

    let mut tables: IndexMap<String, Row> = IndexMap::new();
    for page in schema.pages() {
        let Some(fields) = record.page(page.page_number) else {
            continue;
        };

        let row = tables.entry(page.table_name()).or_insert_with(|| {
            let mut row = Row::new();
            row.insert(reference_field.to_string(), Some(reference.to_string()));
            row
        });

        for (field, value) in fields {
            if field != reference_field {
                row.insert(field.clone(), value.clone());
            }
        }
    }

    Ok(tables)
}
