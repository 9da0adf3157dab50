use std::path::Path;

use anyhow::{Context, Result, bail};
use chrono::Utc;
use tracing::{error, info, warn};

use super::{export_status, finish_batch};
use crate::cli::ExportArgs;
use crate::export::csv::{read_csv_file, write_csv_file};
use crate::export::store::{RowMetadata, SqlStore};
use crate::model::{BatchSummary, ExportStatus, ExtractionManifest, ExtractionStatus, FileSummary};
use crate::record::ExtractedRecord;
use crate::schema::{FormSchema, load_schema};
use crate::util::{now_utc_string, read_json, utc_compact_string};

/// A record loaded from disk together with where it came from.
#[derive(Debug)]
struct LoadedRecord {
    source_file: String,
    extracted_at: String,
    status: ExtractionStatus,
    record: ExtractedRecord,
}

pub fn run(args: ExportArgs) -> Result<()> {
    if !args.database.export_db && args.csv_path.is_none() {
        bail!("nothing to export: pass --export-db, --csv-path, or both");
    }

    let schema = load_schema(args.schema.form, args.schema.schema_path.as_deref())?;
    let run_id = format!("run-{}", utc_compact_string(Utc::now()));

    let mut store = if args.database.export_db {
        Some(SqlStore::open(&args.database.db_path).with_context(|| {
            format!(
                "failed to open export database {}",
                args.database.db_path.display()
            )
        })?)
    } else {
        None
    };

    let mut summary = BatchSummary::new(&run_id);
    let mut csv_records = Vec::new();

    for input in &args.inputs {
        let loaded = match load_input(input, &schema) {
            Ok(loaded) => loaded,
            Err(err) => {
                error!(input = %input.display(), error = %format!("{err:#}"), "failed to load input");
                summary.push(FileSummary {
                    source_file: input.display().to_string(),
                    status: ExtractionStatus::Failed,
                    manifest_path: None,
                    reference: None,
                    export: ExportStatus::NotRequested,
                    error: Some(format!("{err:#}")),
                });
                continue;
            }
        };

        for item in loaded {
            if item.status == ExtractionStatus::Failed {
                warn!(source = %item.source_file, "manifest has no extracted pages");
                summary.push(FileSummary {
                    source_file: item.source_file,
                    status: item.status,
                    manifest_path: Some(input.display().to_string()),
                    reference: None,
                    export: ExportStatus::NotRequested,
                    error: Some("extraction failed for every page".to_string()),
                });
                continue;
            }

            let metadata = RowMetadata {
                source_file: item.source_file.clone(),
                extracted_at: item.extracted_at.clone(),
            };
            let (export, export_error) = export_status(
                store.as_mut(),
                &schema,
                &item.record,
                args.database.grouped_tables,
                &metadata,
            );

            summary.push(FileSummary {
                source_file: item.source_file,
                status: item.status,
                manifest_path: Some(input.display().to_string()),
                reference: item.record.reference(&schema).map(ToOwned::to_owned),
                export,
                error: export_error,
            });
            csv_records.push(item.record);
        }
    }

    if let Some(csv_path) = &args.csv_path {
        match write_csv_file(csv_path, &schema, &csv_records) {
            Ok(()) => {
                info!(path = %csv_path.display(), records = csv_records.len(), "wrote csv export");
            }
            Err(err) => {
                error!(path = %csv_path.display(), error = %err, "csv export failed");
                summary.record_error(format!("failed to write {}: {err}", csv_path.display()));
            }
        }
    }

    finish_batch(&summary, "export")
}

fn load_input(path: &Path, schema: &FormSchema) -> Result<Vec<LoadedRecord>> {
    let is_csv = path
        .extension()
        .and_then(|ext| ext.to_str())
        .is_some_and(|ext| ext.eq_ignore_ascii_case("csv"));

    if is_csv {
        let records = read_csv_file(path, schema)
            .with_context(|| format!("failed to read {}", path.display()))?;
        let extracted_at = now_utc_string();
        info!(path = %path.display(), records = records.len(), "loaded csv records");
        return Ok(records
            .into_iter()
            .map(|record| LoadedRecord {
                source_file: path.display().to_string(),
                extracted_at: extracted_at.clone(),
                status: ExtractionStatus::Completed,
                record,
            })
            .collect());
    }

    let manifest: ExtractionManifest = read_json(path)?;
    if manifest.form_name != schema.form_name() {
        bail!(
            "manifest {} was extracted with form {} but the export schema is {}",
            path.display(),
            manifest.form_name,
            schema.form_name()
        );
    }

    Ok(vec![LoadedRecord {
        source_file: manifest.source_file,
        extracted_at: manifest.completed_at,
        status: manifest.status,
        record: manifest.record,
    }])
}

#[cfg(test)]
mod tests {
    use std::fs;

    use super::*;
    use crate::cli::BuiltinForm;
    use crate::model::{MANIFEST_VERSION, ModelInfo};
    use crate::record::empty_page;
    use crate::util::write_json_pretty;

    fn manifest(schema: &FormSchema, reference: Option<&str>) -> ExtractionManifest {
        let mut fields = empty_page(schema.page(0).unwrap());
        fields.insert(
            "reference_number".to_string(),
            reference.map(str::to_string),
        );
        fields.insert(
            "authority1_name".to_string(),
            Some("Dr Example".to_string()),
        );
        let mut record = ExtractedRecord::new();
        record.insert_page(0, fields);

        ExtractionManifest {
            manifest_version: MANIFEST_VERSION,
            run_id: "run-20260101T000000Z".to_string(),
            source_file: "consent.png".to_string(),
            source_sha256: "0".repeat(64),
            form_name: schema.form_name().to_string(),
            model: ModelInfo {
                backend: "local".to_string(),
                name: "llama3.2-vision".to_string(),
                endpoint: "http://localhost:11434".to_string(),
            },
            rasterizer: None,
            started_at: "2026-01-01T00:00:00Z".to_string(),
            completed_at: "2026-01-01T00:00:09Z".to_string(),
            status: ExtractionStatus::Completed,
            reference: reference.map(str::to_string),
            pages: Vec::new(),
            record,
            warnings: Vec::new(),
        }
    }

    #[test]
    fn loads_manifest_and_rejects_other_forms() {
        let dir = tempfile::tempdir().unwrap();
        let consent = FormSchema::builtin(BuiltinForm::ConsentForm).unwrap();
        let report = FormSchema::builtin(BuiltinForm::MedicalReport).unwrap();
        let path = dir.path().join("consent.json");
        write_json_pretty(&path, &manifest(&consent, Some("REF7"))).unwrap();

        let loaded = load_input(&path, &consent).unwrap();
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0].extracted_at, "2026-01-01T00:00:09Z");
        assert_eq!(loaded[0].record.reference(&consent), Some("REF7"));

        let err = load_input(&path, &report).unwrap_err();
        assert!(err.to_string().contains("medical_examiners_report"));
    }

    #[test]
    fn loads_csv_rows_as_records() {
        let dir = tempfile::tempdir().unwrap();
        let consent = FormSchema::builtin(BuiltinForm::ConsentForm).unwrap();
        let path = dir.path().join("batch.CSV");
        fs::write(
            &path,
            "reference_number,authority1_name\nREF1,Dr One\nREF2,\n",
        )
        .unwrap();

        let loaded = load_input(&path, &consent).unwrap();
        assert_eq!(loaded.len(), 2);
        assert_eq!(loaded[1].record.reference(&consent), Some("REF2"));
        assert_eq!(loaded[1].record.page(0).unwrap()["authority1_name"], None);
    }

    #[test]
    fn export_without_target_is_rejected() {
        let args = ExportArgs {
            inputs: vec!["x.json".into()],
            csv_path: None,
            database: crate::cli::DatabaseArgs {
                export_db: false,
                grouped_tables: false,
                db_path: "unused.sqlite".into(),
            },
            schema: crate::cli::SchemaSelection {
                form: BuiltinForm::ConsentForm,
                schema_path: None,
            },
        };
        assert!(run(args).is_err());
    }

    #[test]
    fn exports_manifests_to_database_and_csv() {
        let dir = tempfile::tempdir().unwrap();
        let consent = FormSchema::builtin(BuiltinForm::ConsentForm).unwrap();
        let good = dir.path().join("good.json");
        let unkeyed = dir.path().join("unkeyed.json");
        write_json_pretty(&good, &manifest(&consent, Some("REF1"))).unwrap();
        write_json_pretty(&unkeyed, &manifest(&consent, None)).unwrap();
        let db_path = dir.path().join("out").join("claims.sqlite");
        let csv_path = dir.path().join("out").join("claims.csv");

        let args = ExportArgs {
            inputs: vec![good, unkeyed],
            csv_path: Some(csv_path.clone()),
            database: crate::cli::DatabaseArgs {
                export_db: true,
                grouped_tables: false,
                db_path: db_path.clone(),
            },
            schema: crate::cli::SchemaSelection {
                form: BuiltinForm::ConsentForm,
                schema_path: None,
            },
        };
        run(args).unwrap();

        let connection = rusqlite::Connection::open(&db_path).unwrap();
        let authority: String = connection
            .query_row(
                "SELECT authority1_name FROM consent_forms WHERE reference_number = 'REF1'",
                [],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(authority, "Dr Example");
        let rows: i64 = connection
            .query_row("SELECT COUNT(*) FROM consent_forms", [], |row| row.get(0))
            .unwrap();
        assert_eq!(rows, 1);

        let csv = fs::read_to_string(&csv_path).unwrap();
        assert_eq!(csv.lines().count(), 3);
    }
}
