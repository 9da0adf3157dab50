use serde::{Deserialize, Serialize};

use crate::parse::ParseMode;
use crate::record::ExtractedRecord;

pub const MANIFEST_VERSION: u32 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExtractionStatus {
    /// Every page produced a model response.
    Completed,
    /// Some pages failed; the record holds the rest.
    Partial,
    /// No page could be extracted.
    Failed,
}

impl ExtractionStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Completed => "completed",
            Self::Partial => "partial",
            Self::Failed => "failed",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExportStatus {
    NotRequested,
    Exported,
    /// Nothing to key the row on, so it was left out of the database.
    MissingReference,
    Failed,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PageOutcome {
    pub page_number: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parse_mode: Option<ParseMode>,
    pub matched_fields: usize,
    pub dropped_keys: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelInfo {
    pub backend: String,
    pub name: String,
    pub endpoint: String,
}

/// Everything `process` learned about one input file. Written before any
/// database export so `export` can replay it later.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExtractionManifest {
    pub manifest_version: u32,
    pub run_id: String,
    pub source_file: String,
    pub source_sha256: String,
    pub form_name: String,
    pub model: ModelInfo,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rasterizer: Option<String>,
    pub started_at: String,
    pub completed_at: String,
    pub status: ExtractionStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reference: Option<String>,
    pub pages: Vec<PageOutcome>,
    pub record: ExtractedRecord,
    #[serde(default)]
    pub warnings: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct FileSummary {
    pub source_file: String,
    pub status: ExtractionStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub manifest_path: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reference: Option<String>,
    pub export: ExportStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Batch-level report printed at the end of `process` and `export`.
#[derive(Debug, Clone, Default, Serialize)]
pub struct BatchSummary {
    pub run_id: String,
    pub successful: usize,
    pub failed: usize,
    pub skipped: usize,
    pub files: Vec<FileSummary>,
    /// Failures that belong to the batch rather than one file, such as the
    /// CSV export.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub errors: Vec<String>,
}

impl BatchSummary {
    pub fn new(run_id: &str) -> Self {
        Self {
            run_id: run_id.to_string(),
            ..Self::default()
        }
    }

    pub fn push(&mut self, file: FileSummary) {
        if file.status == ExtractionStatus::Failed || file.export == ExportStatus::Failed {
            self.failed += 1;
        } else if file.export == ExportStatus::MissingReference {
            self.skipped += 1;
        } else {
            self.successful += 1;
        }
        self.files.push(file);
    }

    pub fn record_error(&mut self, message: String) {
        self.errors.push(message);
    }

    pub fn has_failures(&self) -> bool {
        self.failed > 0 || !self.errors.is_empty()
    }
}
