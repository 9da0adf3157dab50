use std::fs::File;
use std::io::{Read, Write};
use std::path::Path;

use super::{split_record, to_record};
use crate::error::ExportError;
use crate::record::{ExtractedRecord, PageFields};
use crate::schema::FormSchema;

/// Writes one row per record. Columns follow [`FormSchema::all_fields`] and
/// missing values are written as empty cells, so identical input always
/// produces identical bytes.
pub fn write_csv<W: Write>(
    writer: W,
    schema: &FormSchema,
    records: &[ExtractedRecord],
) -> Result<(), ExportError> {
    let columns = schema.all_fields();
    let mut csv_writer = csv::Writer::from_writer(writer);
    csv_writer.write_record(&columns)?;

    for record in records {
        let flat = to_record(record);
        let cells = columns
            .iter()
            .map(|column| flat.get(*column).and_then(|value| value.as_deref()).unwrap_or(""));
        csv_writer.write_record(cells)?;
    }

    csv_writer.flush()?;
    Ok(())
}

pub fn write_csv_file(
    path: &Path,
    schema: &FormSchema,
    records: &[ExtractedRecord],
) -> Result<(), ExportError> {
    if let Some(parent) = path.parent().filter(|parent| !parent.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)?;
    }
    let file = File::create(path)?;
    write_csv(file, schema, records)
}

/// Reads rows written by [`write_csv`] back into per-page records. Columns the
/// schema does not know are ignored and empty cells become nulls.
pub fn read_csv<R: Read>(reader: R, schema: &FormSchema) -> Result<Vec<ExtractedRecord>, ExportError> {
    let mut csv_reader = csv::Reader::from_reader(reader);
    let headers = csv_reader.headers()?.clone();

    let mut records = Vec::new();
    for row in csv_reader.records() {
        let row = row?;
        let flat: PageFields = headers
            .iter()
            .zip(row.iter())
            .map(|(header, cell)| {
                let value = (!cell.is_empty()).then(|| cell.to_string());
                (header.to_string(), value)
            })
            .collect();
        records.push(split_record(&flat, schema));
    }

    Ok(records)
}

pub fn read_csv_file(path: &Path, schema: &FormSchema) -> Result<Vec<ExtractedRecord>, ExportError> {
    let file = File::open(path)?;
    read_csv(file, schema)
}
