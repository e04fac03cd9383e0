//! Turning source documents into page images.

use std::{collections::BTreeMap, sync::LazyLock};

use image::RgbImage;
use regex::Regex;
use tokio::process::Command;

use crate::{
    async_utils::{check_for_command_failure, spawn_blocking_propagating_panics},
    cpu_limit::with_cpu_semaphore,
    prelude::*,
    sources::{Source, SourceKind},
};

/// Lines of Poppler output which indicate a failure.
static ERROR_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)error").expect("failed to compile regex"));

/// Poppler complains about damaged xref tables even when it can reconstruct
/// them.
static DOWNGRADE_TO_WARNING_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)error: xref num").expect("failed to compile regex")
});

/// Does this line contain an error?
fn is_error_line(line: &str) -> bool {
    ERROR_REGEX.is_match(line) && !DOWNGRADE_TO_WARNING_REGEX.is_match(line)
}

/// Something that can rasterize a source document.
#[async_trait]
pub trait Rasterizer: Send + Sync + 'static {
    /// Rasterize every page of `source` at `dpi`, in page order.
    async fn rasterize(&self, source: &Source, dpi: u32) -> Result<Vec<RgbImage>>;
}

/// Rasterizes PDFs with Poppler's `pdftocairo`, and loads images directly.
pub struct PopplerRasterizer {
    /// Stop after this many pages.
    max_pages: Option<usize>,
}

impl PopplerRasterizer {
    /// Create a new rasterizer.
    pub fn new(max_pages: Option<usize>) -> Self {
        Self { max_pages }
    }

    /// Rasterize a PDF into a temporary directory of PNGs, one per page.
    #[instrument(level = "debug", skip_all, fields(path = %path.display(), dpi))]
    async fn rasterize_pdf(&self, path: &Path, dpi: u32) -> Result<Vec<RgbImage>> {
        // Count the number of pages in the PDF.
        let total_pages = get_pdf_page_count(path).await?;

        // Create a temporary directory to hold the PNG files. pdftocairo will
        // add zero-padded page numbers to `out_path`, so sorting the directory
        // gives us page order.
        let tmpdir = tempfile::TempDir::with_prefix("pages")?;
        let out_path = tmpdir.path().join("page");

        // We use `with_cpu_semaphore` because `pdftocairo` will use _at least_
        // 100% of a CPU.
        let mut cmd = Command::new("pdftocairo");
        cmd.arg("-png").arg("-r").arg(dpi.to_string());
        add_last_page_arg_if_needed(self.max_pages, total_pages, &mut cmd);
        let output = with_cpu_semaphore(|| async {
            cmd.arg(path).arg(&out_path).output().await.with_context(|| {
                format!("failed to run pdftocairo on {:?}", path.display())
            })
        })
        .await?;
        check_for_command_failure("pdftocairo", &output, None)?;
        let stderr = String::from_utf8_lossy(&output.stderr);
        if stderr.lines().any(is_error_line) {
            return Err(anyhow!("pdftocairo printed error output:\n{}", stderr));
        }

        let mut paths = tmpdir
            .path()
            .read_dir()
            .with_context(|| {
                format!(
                    "failed to read temporary directory {:?}",
                    tmpdir.path().display()
                )
            })?
            .map(|entry| Ok(entry?.path()))
            .collect::<Result<Vec<_>>>()?;
        paths.sort();

        let pages = spawn_blocking_propagating_panics(move || {
            let pages = paths
                .iter()
                .map(|path| load_rgb(path))
                .collect::<Result<Vec<_>>>();
            // Keep the directory alive until we've read every page.
            drop(tmpdir);
            pages
        })
        .await?;
        if pages.is_empty() {
            return Err(anyhow!("pdftocairo produced no pages for {:?}", path.display()));
        }
        Ok(pages)
    }
}

#[async_trait]
impl Rasterizer for PopplerRasterizer {
    async fn rasterize(&self, source: &Source, dpi: u32) -> Result<Vec<RgbImage>> {
        match source.kind {
            SourceKind::Pdf => self.rasterize_pdf(&source.path, dpi).await,
            // Images are already rasterized, whatever their nominal DPI.
            SourceKind::Image(_) => {
                let path = source.path.clone();
                let page = spawn_blocking_propagating_panics(move || load_rgb(&path)).await?;
                Ok(vec![page])
            }
        }
    }
}

/// Load an image file as 8-bit RGB.
fn load_rgb(path: &Path) -> Result<RgbImage> {
    Ok(image::open(path)
        .with_context(|| format!("failed to read image {:?}", path.display()))?
        .to_rgb8())
}

/// Get the number of pages in a PDF file.
#[instrument(level = "debug", skip_all, fields(path = %path.display()))]
pub async fn get_pdf_page_count(path: &Path) -> Result<usize> {
    // Run pdfinfo to get the number of pages.
    let output = Command::new("pdfinfo")
        .arg(path)
        .output()
        .await
        .with_context(|| format!("failed to run pdfinfo on {:?}", path.display()))?;
    check_for_command_failure("pdfinfo", &output, None)?;

    // Parse the output of pdfinfo into properties.
    let output =
        String::from_utf8(output.stdout).context("pdfinfo output was not valid UTF-8")?;
    let properties = output
        .lines()
        .filter_map(|line| line.split_once(':'))
        .map(|(key, value)| (key.trim(), value.trim()))
        .collect::<BTreeMap<_, _>>();

    // Get the number of pages from the properties.
    let page_count_str = properties
        .get("Pages")
        .ok_or_else(|| anyhow!("failed to find page count in pdfinfo output"))?;
    page_count_str.parse::<usize>().with_context(|| {
        format!(
            "failed to parse page count for {:?} from pdfinfo output",
            path.display()
        )
    })
}

/// Add a "last page" argument to a [`Command`].
fn add_last_page_arg_if_needed(
    max_pages: Option<usize>,
    total_pages: usize,
    cmd: &mut Command,
) {
    if let Some(max_pages) = max_pages
        && total_pages > max_pages
    {
        warn!(
            "only rasterizing {}/{} pages (because of --max-pages)",
            max_pages, total_pages
        );
        // Poppler uses 1-based, inclusive page numbers.
        cmd.arg("-l").arg(max_pages.to_string());
    }
}

#[cfg(test)]
mod tests {
    use image::{ImageFormat, Rgb};

    use super::*;
    use crate::encode::{DocumentEncoder as _, LopdfEncoder};

    #[test]
    fn is_error_line_ignores_xref_warnings() {
        assert!(is_error_line("Syntax Error: Couldn't find trailer dictionary"));
        assert!(!is_error_line(
            "Internal Error: xref num 1234 not found but needed, reconstruct aborted"
        ));
        assert!(!is_error_line("Warning: something is odd"));
    }

    #[tokio::test]
    async fn images_are_a_single_page() -> Result<()> {
        let dir = tempfile::TempDir::with_prefix("raster")?;
        let path = dir.path().join("scan.png");
        RgbImage::from_pixel(30, 20, Rgb([1, 2, 3])).save_with_format(&path, ImageFormat::Png)?;
        let source = Source {
            path,
            kind: SourceKind::Image(ImageFormat::Png),
        };
        let pages = PopplerRasterizer::new(None).rasterize(&source, 150).await?;
        assert_eq!(pages.len(), 1);
        assert_eq!(pages[0].dimensions(), (30, 20));
        Ok(())
    }

    #[tokio::test]
    #[ignore = "Requires poppler-utils to be installed"]
    async fn pdfs_rasterize_at_the_requested_dpi() -> Result<()> {
        // Two 1 x 0.5 inch pages.
        let pages = vec![RgbImage::from_pixel(150, 75, Rgb([255, 255, 255])); 2];
        let dir = tempfile::TempDir::with_prefix("raster")?;
        let path = dir.path().join("two.pdf");
        let bytes = LopdfEncoder::new()
            .encode(SourceKind::Pdf, pages, 150)
            .await?;
        std::fs::write(&path, bytes)?;
        let source = Source {
            path,
            kind: SourceKind::Pdf,
        };

        assert_eq!(get_pdf_page_count(&source.path).await?, 2);
        let rasterized = PopplerRasterizer::new(None).rasterize(&source, 72).await?;
        assert_eq!(rasterized.len(), 2);
        assert_eq!(rasterized[0].dimensions(), (72, 36));

        let capped = PopplerRasterizer::new(Some(1)).rasterize(&source, 72).await?;
        assert_eq!(capped.len(), 1);
        Ok(())
    }
}
