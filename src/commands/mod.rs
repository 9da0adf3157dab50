pub mod export;
pub mod process;
pub mod schema;

use anyhow::{Result, bail};
use tracing::{error, info, warn};

use crate::error::ExportError;
use crate::export::store::{RowMetadata, SqlStore};
use crate::export::{to_grouped_rows, to_wide_row};
use crate::model::{BatchSummary, ExportStatus};
use crate::record::ExtractedRecord;
use crate::schema::FormSchema;

/// Writes `record` to the store as one wide row or as grouped rows. Returns
/// the number of rows written.
pub fn write_record(
    store: &mut SqlStore,
    schema: &FormSchema,
    record: &ExtractedRecord,
    grouped: bool,
    metadata: &RowMetadata,
) -> Result<usize, ExportError> {
    if grouped {
        let rows = to_grouped_rows(record, schema)?;
        store.write_grouped(&rows, schema.reference_field(), metadata)
    } else {
        let row = to_wide_row(record, schema)?;
        store.write_wide(schema.wide_table(), &row, schema.reference_field(), metadata)?;
        Ok(1)
    }
}

/// [`write_record`] with the outcome folded into an [`ExportStatus`] and
/// logged. A missing store means export was not requested.
pub fn export_status(
    store: Option<&mut SqlStore>,
    schema: &FormSchema,
    record: &ExtractedRecord,
    grouped: bool,
    metadata: &RowMetadata,
) -> (ExportStatus, Option<String>) {
    let Some(store) = store else {
        return (ExportStatus::NotRequested, None);
    };

    match write_record(store, schema, record, grouped, metadata) {
        Ok(rows) => {
            info!(source = %metadata.source_file, rows, grouped, "exported record");
            (ExportStatus::Exported, None)
        }
        Err(err @ ExportError::MissingReference(_)) => {
            warn!(source = %metadata.source_file, error = %err, "skipping database export");
            (ExportStatus::MissingReference, Some(err.to_string()))
        }
        Err(err) => {
            error!(source = %metadata.source_file, error = %err, "database export failed");
            (ExportStatus::Failed, Some(err.to_string()))
        }
    }
}

fn finish_batch(summary: &BatchSummary, action: &str) -> Result<()> {
    info!(
        run_id = %summary.run_id,
        successful = summary.successful,
        failed = summary.failed,
        skipped = summary.skipped,
        "{action} finished"
    );

    if let Some(first) = summary.errors.first() {
        bail!("{action} could not finish: {first}");
    }
    if summary.has_failures() {
        bail!(
            "{} of {} files failed during {action}",
            summary.failed,
            summary.files.len()
        );
    }
    Ok(())
}
