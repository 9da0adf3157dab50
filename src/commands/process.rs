use std::collections::HashSet;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::Utc;
use rayon::prelude::*;
use tracing::{debug, error, info, warn};

use super::{export_status, finish_batch};
use crate::cli::ProcessArgs;
use crate::export::csv::write_csv_file;
use crate::export::store::{RowMetadata, SqlStore};
use crate::llm::prompt::page_prompt;
use crate::llm::{ModelSettings, RetryPolicy, VisionModel, build_model, extract_with_retry};
use crate::model::{
    BatchSummary, ExportStatus, ExtractionManifest, ExtractionStatus, FileSummary,
    MANIFEST_VERSION, ModelInfo, PageOutcome,
};
use crate::parse::parse;
use crate::raster::{PageImage, RasterOptions, load_pages, pdftoppm_version};
use crate::record::ExtractedRecord;
use crate::schema::{FormSchema, load_schema};
use crate::util::{
    artifact_stem, ensure_directory, now_utc_string, sha256_file, utc_compact_string,
    write_json_pretty,
};

/// Per-run settings shared by every file in the batch.
pub struct ExtractContext<'a> {
    pub run_id: &'a str,
    pub schema: &'a FormSchema,
    pub model: &'a dyn VisionModel,
    pub settings: &'a ModelSettings,
    pub retry: RetryPolicy,
    pub raster: RasterOptions,
    pub only_page: Option<u32>,
    pub rasterizer: Option<&'a str>,
}

pub fn run(args: ProcessArgs) -> Result<()> {
    let schema = load_schema(args.schema.form, args.schema.schema_path.as_deref())?;
    if let Some(page) = args.page {
        schema.fields_for_page(page)?;
    }

    let settings = args.model.settings();
    let model = build_model(&settings).context("failed to configure vision model")?;
    let run_id = format!("run-{}", utc_compact_string(Utc::now()));

    let summary = process_batch(&args, &schema, model.as_ref(), &settings, &run_id)?;
    finish_batch(&summary, "processing")
}

/// Runs one batch and writes its artifacts under `<output_dir>/<run_id>/`: a
/// manifest per file and `summary.json`. A file whose manifest or export
/// cannot be written is counted as failed and the batch moves on.
pub fn process_batch(
    args: &ProcessArgs,
    schema: &FormSchema,
    model: &dyn VisionModel,
    settings: &ModelSettings,
    run_id: &str,
) -> Result<BatchSummary> {
    let rasterizer = pdftoppm_version();
    let run_dir = args.output_dir.join(run_id);
    ensure_directory(&run_dir)?;

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

    info!(
        run_id = %run_id,
        files = args.files.len(),
        workers = args.workers,
        backend = settings.backend.as_str(),
        model = %settings.model,
        output = %run_dir.display(),
        "processing started"
    );

    let context = ExtractContext {
        run_id,
        schema,
        model,
        settings,
        retry: args.model.retry_policy(),
        raster: RasterOptions {
            dpi: args.dpi,
            max_dimension: args.max_dimension,
        },
        only_page: args.page,
        rasterizer: rasterizer.as_deref(),
    };
    let outcomes = extract_batch(&args.files, args.workers, &context)?;

    let mut summary = BatchSummary::new(run_id);
    let mut csv_records = Vec::new();
    let mut used_stems = HashSet::new();

    for (path, outcome) in args.files.iter().zip(outcomes) {
        let manifest = match outcome {
            Ok(manifest) => manifest,
            Err(err) => {
                error!(file = %path.display(), error = %format!("{err:#}"), "extraction failed");
                summary.push(failed_file(path, None, &err));
                continue;
            }
        };

        let manifest_path = run_dir.join(format!("{}.json", unique_stem(path, &mut used_stems)));
        if let Err(err) = write_json_pretty(&manifest_path, &manifest) {
            error!(
                file = %path.display(),
                manifest = %manifest_path.display(),
                error = %format!("{err:#}"),
                "failed to write extraction manifest"
            );
            summary.push(failed_file(path, manifest.reference.clone(), &err));
            continue;
        }
        info!(
            file = %path.display(),
            status = manifest.status.as_str(),
            manifest = %manifest_path.display(),
            "wrote extraction manifest"
        );

        let (export, export_error) = if manifest.status == ExtractionStatus::Failed {
            (ExportStatus::NotRequested, None)
        } else {
            if args.csv_path.is_some() {
                csv_records.push(manifest.record.clone());
            }
            let metadata = RowMetadata {
                source_file: manifest.source_file.clone(),
                extracted_at: manifest.completed_at.clone(),
            };
            export_status(
                store.as_mut(),
                schema,
                &manifest.record,
                args.database.grouped_tables,
                &metadata,
            )
        };

        let page_error = manifest
            .pages
            .iter()
            .filter_map(|page| page.error.as_deref())
            .next()
            .map(ToOwned::to_owned);

        summary.push(FileSummary {
            source_file: manifest.source_file.clone(),
            status: manifest.status,
            manifest_path: Some(manifest_path.display().to_string()),
            reference: manifest.reference.clone(),
            export,
            error: export_error.or(page_error),
        });
    }

    if let Some(csv_path) = &args.csv_path {
        match write_csv_file(csv_path, schema, &csv_records) {
            Ok(()) => {
                info!(path = %csv_path.display(), records = csv_records.len(), "wrote csv export");
            }
            Err(err) => {
                error!(path = %csv_path.display(), error = %err, "csv export failed");
                summary.record_error(format!("failed to write {}: {err}", csv_path.display()));
            }
        }
    }

    let summary_path = run_dir.join("summary.json");
    write_json_pretty(&summary_path, &summary)?;
    info!(path = %summary_path.display(), "wrote batch summary");

    Ok(summary)
}

fn failed_file(path: &Path, reference: Option<String>, err: &anyhow::Error) -> FileSummary {
    FileSummary {
        source_file: path.display().to_string(),
        status: ExtractionStatus::Failed,
        manifest_path: None,
        reference,
        export: ExportStatus::NotRequested,
        error: Some(format!("{err:#}")),
    }
}

/// Extracts every file, `workers` at a time. Results keep the input order and
/// one file's failure never stops the others.
pub fn extract_batch(
    files: &[PathBuf],
    workers: usize,
    context: &ExtractContext<'_>,
) -> Result<Vec<Result<ExtractionManifest>>> {
    let workers = workers.clamp(1, files.len().max(1));
    if workers == 1 {
        return Ok(files
            .iter()
            .map(|path| extract_file(path, context))
            .collect());
    }

    let pool = rayon::ThreadPoolBuilder::new()
        .num_threads(workers)
        .build()
        .context("failed to start worker pool")?;

    Ok(pool.install(|| {
        files
            .par_iter()
            .map(|path| extract_file(path, context))
            .collect()
    }))
}

/// Rasterizes one file and extracts each of its pages.
pub fn extract_file(path: &Path, context: &ExtractContext<'_>) -> Result<ExtractionManifest> {
    let started_at = now_utc_string();
    info!(file = %path.display(), "processing file");

    let source_sha256 = sha256_file(path)?;
    let images = load_pages(path, context.only_page, context.raster)?;
    let extraction = extract_pages(context, &images);

    let status = extraction.status();
    let reference = extraction
        .record
        .reference(context.schema)
        .map(ToOwned::to_owned);
    if reference.is_none() && status != ExtractionStatus::Failed {
        warn!(
            file = %path.display(),
            field = %context.schema.reference_field(),
            "no reference value extracted"
        );
    }

    Ok(ExtractionManifest {
        manifest_version: MANIFEST_VERSION,
        run_id: context.run_id.to_string(),
        source_file: path.display().to_string(),
        source_sha256,
        form_name: context.schema.form_name().to_string(),
        model: ModelInfo {
            backend: context.settings.backend.as_str().to_string(),
            name: context.model.name().to_string(),
            endpoint: context.settings.endpoint.clone(),
        },
        rasterizer: context.rasterizer.map(ToOwned::to_owned),
        started_at,
        completed_at: now_utc_string(),
        status,
        reference,
        pages: extraction.pages,
        record: extraction.record,
        warnings: extraction.warnings,
    })
}

#[derive(Debug, Default)]
pub struct PageExtraction {
    pub record: ExtractedRecord,
    pub pages: Vec<PageOutcome>,
    pub warnings: Vec<String>,
}

impl PageExtraction {
    pub fn status(&self) -> ExtractionStatus {
        let failed = self.pages.iter().filter(|page| page.error.is_some()).count();
        if self.pages.is_empty() || failed == self.pages.len() {
            ExtractionStatus::Failed
        } else if failed > 0 {
            ExtractionStatus::Partial
        } else {
            ExtractionStatus::Completed
        }
    }
}

/// Sends each page to the model and parses the reply. Pages the schema does
/// not describe are skipped; a failed page is recorded and the rest continue.
pub fn extract_pages(context: &ExtractContext<'_>, images: &[PageImage]) -> PageExtraction {
    let mut extraction = PageExtraction::default();

    for image in images {
        let page = match context.schema.page(image.page_index) {
            Ok(page) => page,
            Err(err) => {
                warn!(page = image.page_index, error = %err, "skipping page");
                extraction.warnings.push(err.to_string());
                continue;
            }
        };

        let prompt = page_prompt(context.schema.form_name(), page);
        match extract_with_retry(context.model, image, &prompt, context.retry) {
            Ok(raw_text) => {
                let outcome = parse(&raw_text, page);
                debug!(
                    page = page.page_number,
                    mode = outcome.mode.as_str(),
                    matched = outcome.matched_fields(),
                    "parsed page"
                );
                if outcome.fallback_used() {
                    extraction.warnings.push(format!(
                        "page {} was not valid JSON; used line heuristic",
                        page.page_number
                    ));
                }
                extraction.pages.push(PageOutcome {
                    page_number: page.page_number,
                    parse_mode: Some(outcome.mode),
                    matched_fields: outcome.matched_fields(),
                    dropped_keys: outcome.dropped_keys,
                    error: None,
                });
                extraction.record.insert_page(page.page_number, outcome.fields);
            }
            Err(err) => {
                warn!(
                    page = page.page_number,
                    model = %context.model.name(),
                    error = %err,
                    "page extraction failed; continuing"
                );
                extraction.pages.push(PageOutcome {
                    page_number: page.page_number,
                    parse_mode: None,
                    matched_fields: 0,
                    dropped_keys: 0,
                    error: Some(err.to_string()),
                });
            }
        }
    }

    extraction
}

fn unique_stem(path: &Path, used: &mut HashSet<String>) -> String {
    let base = artifact_stem(path);
    let mut candidate = base.clone();
    let mut suffix = 2;
    while !used.insert(candidate.clone()) {
        candidate = format!("{base}_{suffix}");
        suffix += 1;
    }
    candidate
}
