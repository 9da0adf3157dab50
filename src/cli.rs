use std::path::PathBuf;
use std::time::Duration;

use clap::{Args, Parser, Subcommand, ValueEnum};

use crate::llm::{ModelSettings, RetryPolicy};

#[derive(Parser, Debug)]
#[command(
    name = "claimform",
    version,
    about = "Extract fields from scanned claim forms with a vision model"
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Extract fields from PDF or image files.
    Process(ProcessArgs),
    /// Load previously written manifests or CSV files into the database.
    Export(ExportArgs),
    /// Print the page/field schema.
    Schema(SchemaArgs),
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
pub enum ModelBackend {
    /// Ollama server on this machine.
    Local,
    /// Google Gemini API.
    Hosted,
}

impl ModelBackend {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Local => "local",
            Self::Hosted => "hosted",
        }
    }
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
pub enum BuiltinForm {
    MedicalReport,
    ConsentForm,
}

impl BuiltinForm {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::MedicalReport => "medical-report",
            Self::ConsentForm => "consent-form",
        }
    }
}

#[derive(Args, Debug, Clone)]
pub struct SchemaSelection {
    #[arg(long, value_enum, default_value_t = BuiltinForm::MedicalReport)]
    pub form: BuiltinForm,

    /// JSON schema file used instead of the built-in form.
    #[arg(long)]
    pub schema_path: Option<PathBuf>,
}

#[derive(Args, Debug, Clone)]
pub struct ModelArgs {
    #[arg(long = "model", env = "CLAIMFORM_MODEL", value_enum, default_value_t = ModelBackend::Local)]
    pub backend: ModelBackend,

    #[arg(long, env = "CLAIMFORM_OLLAMA_URL", default_value = "http://localhost:11434")]
    pub ollama_url: String,

    #[arg(long, env = "CLAIMFORM_OLLAMA_MODEL", default_value = "llama3.2-vision")]
    pub ollama_model: String,

    #[arg(
        long,
        env = "CLAIMFORM_GEMINI_URL",
        default_value = "https://generativelanguage.googleapis.com/v1beta"
    )]
    pub gemini_url: String,

    #[arg(long, env = "CLAIMFORM_GEMINI_MODEL", default_value = "gemini-2.0-flash")]
    pub gemini_model: String,

    #[arg(long, env = "GEMINI_API_KEY", hide_env_values = true)]
    pub api_key: Option<String>,

    #[arg(long, env = "CLAIMFORM_TIMEOUT_SECS", default_value_t = 300)]
    pub timeout_secs: u64,

    /// Extra attempts for connection failures, timeouts and 429/5xx replies.
    #[arg(long, default_value_t = 2)]
    pub max_retries: u32,

    #[arg(long, default_value_t = 1000)]
    pub retry_backoff_ms: u64,
}

impl ModelArgs {
    pub fn settings(&self) -> ModelSettings {
        let (endpoint, model) = match self.backend {
            ModelBackend::Local => (&self.ollama_url, &self.ollama_model),
            ModelBackend::Hosted => (&self.gemini_url, &self.gemini_model),
        };

        ModelSettings {
            backend: self.backend,
            endpoint: endpoint.clone(),
            model: model.clone(),
            api_key: self.api_key.clone(),
            timeout_secs: self.timeout_secs,
        }
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_retries: self.max_retries,
            backoff: Duration::from_millis(self.retry_backoff_ms),
        }
    }
}

#[derive(Args, Debug, Clone)]
pub struct DatabaseArgs {
    /// Write results to the SQLite database.
    #[arg(long, default_value_t = false)]
    pub export_db: bool,

    /// Split each record into the per-section tables instead of one wide row.
    #[arg(long, default_value_t = false)]
    pub grouped_tables: bool,

    #[arg(long, env = "CLAIMFORM_DB_PATH", default_value = "output/claimform.sqlite")]
    pub db_path: PathBuf,
}

#[derive(Args, Debug, Clone)]
pub struct ProcessArgs {
    /// PDF or image files to process.
    #[arg(required = true)]
    pub files: Vec<PathBuf>,

    /// Process a single zero-based page of each file.
    #[arg(long)]
    pub page: Option<u32>,

    /// Files processed concurrently.
    #[arg(long, default_value_t = 1)]
    pub workers: usize,

    /// Directory receiving one JSON manifest per file.
    #[arg(long, env = "CLAIMFORM_OUTPUT_DIR", default_value = "output")]
    pub output_dir: PathBuf,

    /// Also write every successful record to this CSV file.
    #[arg(long)]
    pub csv_path: Option<PathBuf>,

    #[arg(long, default_value_t = 200)]
    pub dpi: u32,

    /// Longest rendered side in pixels; 0 disables scaling.
    #[arg(long, default_value_t = 2048)]
    pub max_dimension: u32,

    #[command(flatten)]
    pub database: DatabaseArgs,

    #[command(flatten)]
    pub schema: SchemaSelection,

    #[command(flatten)]
    pub model: ModelArgs,
}

#[derive(Args, Debug, Clone)]
pub struct ExportArgs {
    /// Extraction manifests (.json) or CSV files written by `process`.
    #[arg(required = true)]
    pub inputs: Vec<PathBuf>,

    /// Write the loaded records to this CSV file.
    #[arg(long)]
    pub csv_path: Option<PathBuf>,

    #[command(flatten)]
    pub database: DatabaseArgs,

    #[command(flatten)]
    pub schema: SchemaSelection,
}

#[derive(Args, Debug, Clone)]
pub struct SchemaArgs {
    #[command(flatten)]
    pub schema: SchemaSelection,

    /// Print the schema document as JSON.
    #[arg(long, default_value_t = false)]
    pub json: bool,
}

#[cfg(test)]
mod tests {
    use clap::CommandFactory;

    use super::*;

    #[test]
    fn cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn hosted_settings_use_gemini_endpoint() {
        let cli = Cli::try_parse_from([
            "claimform",
            "process",
            "scan.pdf",
            "--model",
            "hosted",
            "--api-key",
            "k",
            "--gemini-model",
            "gemini-test",
            "--workers",
            "3",
            "--export-db",
            "--grouped-tables",
        ])
        .unwrap();

        let Commands::Process(args) = cli.command else {
            panic!("expected process command");
        };
        let settings = args.model.settings();
        assert_eq!(settings.backend, ModelBackend::Hosted);
        assert_eq!(settings.model, "gemini-test");
        assert!(settings.endpoint.starts_with("https://generativelanguage"));
        assert_eq!(settings.api_key.as_deref(), Some("k"));
        assert_eq!(args.workers, 3);
        assert!(args.database.export_db && args.database.grouped_tables);
    }

    #[test]
    fn process_requires_files() {
        assert!(Cli::try_parse_from(["claimform", "process"]).is_err());
    }
}
