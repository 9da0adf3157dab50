use std::collections::HashSet;
use std::path::Path;
use std::sync::LazyLock;

use indexmap::IndexMap;
use regex::Regex;
use rusqlite::{Connection, params_from_iter};
use tracing::debug;

use super::Row;
use crate::error::ExportError;

const MAX_IDENTIFIER_LEN: usize = 63;
const SOURCE_FILE_COLUMN: &str = "source_file";
const EXTRACTED_AT_COLUMN: &str = "extracted_at";

static NON_IDENTIFIER: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"[^a-z0-9]+").expect("valid identifier regex"));

/// Provenance written next to every exported row.
#[derive(Debug, Clone)]
pub struct RowMetadata {
    pub source_file: String,
    pub extracted_at: String,
}

/// SQLite sink for extracted records. Every table is keyed by the form's
/// reference column and rows are upserted, so re-exporting a document
/// replaces its earlier values.
pub struct SqlStore {
    connection: Connection,
}

impl SqlStore {
    pub fn open(path: &Path) -> Result<Self, ExportError> {
        if let Some(parent) = path.parent().filter(|parent| !parent.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        let connection = Connection::open(path)?;
        configure_connection(&connection)?;
        debug!(path = %path.display(), "opened export database");
        Ok(Self { connection })
    }

    #[cfg(test)]
    pub fn in_memory() -> Result<Self, ExportError> {
        Ok(Self {
            connection: Connection::open_in_memory()?,
        })
    }

    #[cfg(test)]
    pub fn connection(&self) -> &Connection {
        &self.connection
    }

    /// Upserts one wide row into `table`.
    pub fn write_wide(
        &mut self,
        table: &str,
        row: &Row,
        reference_field: &str,
        metadata: &RowMetadata,
    ) -> Result<(), ExportError> {
        let tx = self.connection.transaction()?;
        upsert_row(&tx, table, row, reference_field, metadata)?;
        tx.commit()?;
        Ok(())
    }

    /// Upserts one row per table. Either every table is written or none is.
    pub fn write_grouped(
        &mut self,
        rows: &IndexMap<String, Row>,
        reference_field: &str,
        metadata: &RowMetadata,
    ) -> Result<usize, ExportError> {
        let tx = self.connection.transaction()?;
        for (table, row) in rows {
            upsert_row(&tx, table, row, reference_field, metadata)?;
        }
        tx.commit()?;
        Ok(rows.len())
    }
}

fn configure_connection(connection: &Connection) -> Result<(), ExportError> {
    connection.pragma_update(None, "journal_mode", "WAL")?;
    connection.pragma_update(None, "synchronous", "NORMAL")?;
    Ok(())
}

/// Lowercase `[a-z0-9_]` identifier of at most 63 characters.
pub fn column_name(field: &str) -> String {
    let lowered = field.to_lowercase();
    let replaced = NON_IDENTIFIER.replace_all(&lowered, "_");
    let trimmed = replaced.trim_matches('_');
    let truncated = &trimmed[..trimmed.len().min(MAX_IDENTIFIER_LEN)];
    let name = truncated.trim_end_matches('_');
    if name.is_empty() {
        "field".to_string()
    } else {
        name.to_string()
    }
}

/// Column names for `fields` in order. Names that collide after sanitizing
/// get `_2`, `_3`, ... suffixes; `reserved` names are never handed out.
pub fn column_names<'a>(
    fields: impl IntoIterator<Item = &'a str>,
    reserved: &[&str],
) -> Vec<String> {
    let mut used: HashSet<String> = reserved.iter().map(|name| (*name).to_string()).collect();
    let mut names = Vec::new();

    for field in fields {
        let base = column_name(field);
        let mut candidate = base.clone();
        let mut suffix = 2;
        while !used.insert(candidate.clone()) {
            candidate = format!("{base}_{suffix}");
            suffix += 1;
        }
        names.push(candidate);
    }

    names
}

fn quote(identifier: &str) -> String {
    format!("\"{}\"", identifier.replace('"', "\"\""))
}

fn ensure_table(
    connection: &Connection,
    table: &str,
    key_column: &str,
    columns: &[String],
) -> Result<(), ExportError> {
    let create_sql = format!(
        "CREATE TABLE IF NOT EXISTS {} ({} TEXT PRIMARY KEY, {} TEXT, {} TEXT)",
        quote(table),
        quote(key_column),
        quote(SOURCE_FILE_COLUMN),
        quote(EXTRACTED_AT_COLUMN),
    );
    connection.execute(&create_sql, [])?;

    for column in columns {
        ensure_column_exists(connection, table, column)?;
    }
    Ok(())
}

fn ensure_column_exists(
    connection: &Connection,
    table: &str,
    column: &str,
) -> Result<(), ExportError> {
    let pragma_sql = format!("PRAGMA table_info({})", quote(table));
    let mut statement = connection.prepare(&pragma_sql)?;

    let mut rows = statement.query([])?;
    while let Some(row) = rows.next()? {
        let existing_name: String = row.get(1)?;
        if existing_name == column {
            return Ok(());
        }
    }

    let alter_sql = format!(
        "ALTER TABLE {} ADD COLUMN {} TEXT",
        quote(table),
        quote(column)
    );
    connection.execute(&alter_sql, [])?;
    debug!(table, column, "added column");

    Ok(())
}

fn upsert_row(
    connection: &Connection,
    table: &str,
    row: &Row,
    reference_field: &str,
    metadata: &RowMetadata,
) -> Result<(), ExportError> {
    let reference = row
        .get(reference_field)
        .and_then(|value| value.as_deref())
        .filter(|value| !value.trim().is_empty())
        .ok_or_else(|| ExportError::MissingReference(reference_field.to_string()))?;

    let table = column_name(table);
    let key_column = column_name(reference_field);
    let other_fields = row
        .iter()
        .filter(|(field, _)| field.as_str() != reference_field);
    let columns = column_names(
        other_fields.clone().map(|(field, _)| field.as_str()),
        &[&key_column, SOURCE_FILE_COLUMN, EXTRACTED_AT_COLUMN],
    );

    ensure_table(connection, &table, &key_column, &columns)?;

    let mut insert_columns = vec![key_column.clone()];
    insert_columns.extend(columns.iter().cloned());
    insert_columns.push(SOURCE_FILE_COLUMN.to_string());
    insert_columns.push(EXTRACTED_AT_COLUMN.to_string());

    let mut values: Vec<Option<String>> = vec![Some(reference.to_string())];
    values.extend(other_fields.map(|(_, value)| value.clone()));
    values.push(Some(metadata.source_file.clone()));
    values.push(Some(metadata.extracted_at.clone()));

    let placeholders: Vec<String> = (1..=insert_columns.len())
        .map(|index| format!("?{index}"))
        .collect();
    let updates: Vec<String> = insert_columns
        .iter()
        .skip(1)
        .map(|column| format!("{0}=excluded.{0}", quote(column)))
        .collect();

    let sql = format!(
        "INSERT INTO {}({}) VALUES({}) ON CONFLICT({}) DO UPDATE SET {}",
        quote(&table),
        insert_columns
            .iter()
            .map(|column| quote(column))
            .collect::<Vec<_>>()
            .join(", "),
        placeholders.join(", "),
        quote(&key_column),
        updates.join(", "),
    );

    connection.execute(&sql, params_from_iter(values))?;
    debug!(table = %table, reference, "upserted row");

    Ok(())
}
