use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;

use anyhow::{Context, Result, bail};
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;
use chrono::Utc;
use tracing::{debug, info};

use crate::util::ensure_directory;

/// One rasterized page, ready to attach to a model request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PageImage {
    /// Zero-based position in the source document.
    pub page_index: u32,
    pub mime_type: String,
    pub data: Vec<u8>,
}

impl PageImage {
    pub fn new(page_index: u32, mime_type: &str, data: Vec<u8>) -> Self {
        Self {
            page_index,
            mime_type: mime_type.to_string(),
            data,
        }
    }

    pub fn base64(&self) -> String {
        STANDARD.encode(&self.data)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceKind {
    Pdf,
    Image { mime_type: &'static str },
}

pub fn source_kind(path: &Path) -> Result<SourceKind> {
    let extension = path
        .extension()
        .and_then(|ext| ext.to_str())
        .map(str::to_ascii_lowercase)
        .with_context(|| format!("file has no extension: {}", path.display()))?;

    let kind = match extension.as_str() {
        "pdf" => SourceKind::Pdf,
        "png" => SourceKind::Image {
            mime_type: "image/png",
        },
        "jpg" | "jpeg" => SourceKind::Image {
            mime_type: "image/jpeg",
        },
        "gif" => SourceKind::Image {
            mime_type: "image/gif",
        },
        "webp" => SourceKind::Image {
            mime_type: "image/webp",
        },
        "tif" | "tiff" => SourceKind::Image {
            mime_type: "image/tiff",
        },
        "bmp" => SourceKind::Image {
            mime_type: "image/bmp",
        },
        other => bail!("unsupported file type .{other}: {}", path.display()),
    };

    Ok(kind)
}

#[derive(Debug, Clone, Copy)]
pub struct RasterOptions {
    pub dpi: u32,
    /// Longest side in pixels; 0 keeps the size implied by `dpi`.
    pub max_dimension: u32,
}

impl Default for RasterOptions {
    fn default() -> Self {
        Self {
            dpi: 200,
            max_dimension: 2048,
        }
    }
}

/// Loads the pages of `path` as images. `only_page` selects a single
/// zero-based page.
pub fn load_pages(
    path: &Path,
    only_page: Option<u32>,
    options: RasterOptions,
) -> Result<Vec<PageImage>> {
    match source_kind(path)? {
        SourceKind::Image { mime_type } => {
            if let Some(page) = only_page.filter(|page| *page != 0) {
                bail!(
                    "image files only have page 0, requested page {page}: {}",
                    path.display()
                );
            }
            let data =
                fs::read(path).with_context(|| format!("failed to read {}", path.display()))?;
            debug!(path = %path.display(), bytes = data.len(), "loaded image page");
            Ok(vec![PageImage::new(0, mime_type, data)])
        }
        SourceKind::Pdf => rasterize_pdf(path, only_page, options),
    }
}

fn rasterize_pdf(
    pdf_path: &Path,
    only_page: Option<u32>,
    options: RasterOptions,
) -> Result<Vec<PageImage>> {
    if !command_available("pdftoppm") {
        bail!("pdftoppm is required to rasterize PDF files (install poppler-utils)");
    }

    let output_dir = scratch_dir(pdf_path);
    ensure_directory(&output_dir)?;

    let pages = run_pdftoppm(pdf_path, only_page, options, &output_dir)
        .and_then(|()| collect_rendered_pages(&output_dir));
    let _ = fs::remove_dir_all(&output_dir);
    let pages = pages?;

    if pages.is_empty() {
        bail!("pdftoppm produced no pages for {}", pdf_path.display());
    }
    if let Some(page) = only_page {
        if pages.iter().all(|image| image.page_index != page) {
            bail!("page {page} not found in {}", pdf_path.display());
        }
    }

    info!(path = %pdf_path.display(), pages = pages.len(), "rasterized pdf");
    Ok(pages)
}

fn scratch_dir(pdf_path: &Path) -> PathBuf {
    let stem = pdf_path
        .file_stem()
        .and_then(|value| value.to_str())
        .unwrap_or("pdf");
    let safe_stem = stem
        .chars()
        .map(|character| {
            if character.is_ascii_alphanumeric() {
                character
            } else {
                '_'
            }
        })
        .collect::<String>();
    let stamp = Utc::now().timestamp_nanos_opt().unwrap_or_default();

    std::env::temp_dir().join(format!(
        "claimform_{}_{}_{}",
        safe_stem,
        std::process::id(),
        stamp
    ))
}

fn run_pdftoppm(
    pdf_path: &Path,
    only_page: Option<u32>,
    options: RasterOptions,
    output_dir: &Path,
) -> Result<()> {
    let mut command = Command::new("pdftoppm");
    command.arg("-png").arg("-r").arg(options.dpi.to_string());
    if options.max_dimension > 0 {
        command
            .arg("-scale-to")
            .arg(options.max_dimension.to_string());
    }
    if let Some(page) = only_page {
        let one_based = (page + 1).to_string();
        command.arg("-f").arg(&one_based).arg("-l").arg(&one_based);
    }
    command.arg(pdf_path).arg(output_dir.join("page"));

    let output = command
        .output()
        .with_context(|| format!("failed to execute pdftoppm for {}", pdf_path.display()))?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        bail!(
            "pdftoppm returned non-zero exit status for {}: {}",
            pdf_path.display(),
            stderr.trim()
        );
    }

    Ok(())
}

fn collect_rendered_pages(output_dir: &Path) -> Result<Vec<PageImage>> {
    let entries = fs::read_dir(output_dir)
        .with_context(|| format!("failed to read {}", output_dir.display()))?;

    let mut pages = Vec::new();
    for entry in entries {
        let entry =
            entry.with_context(|| format!("failed to read entry in {}", output_dir.display()))?;
        let path = entry.path();
        let Some(page_number) = path
            .file_name()
            .and_then(|name| name.to_str())
            .and_then(rendered_page_number)
        else {
            continue;
        };

        let data = fs::read(&path).with_context(|| format!("failed to read {}", path.display()))?;
        pages.push(PageImage::new(page_number - 1, "image/png", data));
    }

    pages.sort_by_key(|page| page.page_index);
    Ok(pages)
}

/// One-based page number from a pdftoppm output name such as `page-07.png`.
fn rendered_page_number(file_name: &str) -> Option<u32> {
    file_name
        .strip_prefix("page-")?
        .strip_suffix(".png")?
        .parse::<u32>()
        .ok()
        .filter(|number| *number > 0)
}

fn command_available(program: &str) -> bool {
    Command::new(program).arg("-v").output().is_ok()
}

/// First line of `pdftoppm -v`, when the tool is installed.
pub fn pdftoppm_version() -> Option<String> {
    let output = Command::new("pdftoppm").arg("-v").output().ok()?;

    let stdout = String::from_utf8_lossy(&output.stdout);
    let stderr = String::from_utf8_lossy(&output.stderr);
    let source = if stdout.trim().is_empty() {
        stderr.trim()
    } else {
        stdout.trim()
    };

    source
        .lines()
        .next()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .map(ToOwned::to_owned)
}
