//! Source documents: what kind of file we were given.

use image::ImageFormat;

use crate::{
    error::{JobError, JobResult},
    prelude::*,
};

/// The kinds of document we can edit.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SourceKind {
    /// A PDF, which has a vector form we can read text colors from.
    Pdf,
    /// A single scanned page, re-encoded in its own format.
    Image(ImageFormat),
}

/// A source document on disk.
#[derive(Clone, Debug)]
pub struct Source {
    pub path: PathBuf,
    pub kind: SourceKind,
}

impl Source {
    /// Open a source document, checking that it exists and that we support its
    /// type.
    ///
    /// Nothing else touches the filesystem before this check passes.
    #[instrument(level = "debug", skip_all, fields(path = %path.display()))]
    pub async fn open(path: &Path) -> JobResult<Self> {
        let exists = tokio::fs::try_exists(path).await.unwrap_or(false);
        if !exists || !path.is_file() {
            return Err(JobError::SourceNotFound {
                path: path.to_owned(),
            });
        }
        let mime_type = get_mime_type(path).map_err(JobError::internal)?;
        let kind = match mime_type.as_str() {
            "application/pdf" => SourceKind::Pdf,
            "image/png" => SourceKind::Image(ImageFormat::Png),
            "image/jpeg" => SourceKind::Image(ImageFormat::Jpeg),
            other => {
                return Err(JobError::Internal(format!(
                    "unsupported MIME type {} for {:?} (supported: PDF, PNG, JPEG)",
                    other,
                    path.display()
                )));
            }
        };
        debug!(?kind, "detected source type");
        Ok(Self {
            path: path.to_owned(),
            kind,
        })
    }

    /// The file name of this source, for display.
    pub fn file_name(&self) -> String {
        self.path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_else(|| self.path.display().to_string())
    }
}

/// Get the MIME type of a file.
pub fn get_mime_type(path: &Path) -> Result<String> {
    Ok(infer::get_from_path(path)
        .with_context(|| format!("failed to get MIME type for {:?}", path.display()))?
        .ok_or_else(|| anyhow!("unknown MIME type for {:?}", path.display()))?
        .mime_type()
        .to_string())
}

/// Where to write the edited copy of `source`.
///
/// We insert `-edited` (plus `token`, if given) before the extension, so
/// `scan.pdf` becomes `scan-edited.pdf`. The result is never `source` itself.
pub fn edited_output_path(source: &Path, token: Option<&str>) -> PathBuf {
    let stem = source
        .file_stem()
        .map(|stem| stem.to_string_lossy().into_owned())
        .unwrap_or_default();
    let mut name = format!("{}-edited", stem);
    if let Some(token) = token {
        name.push('-');
        name.push_str(token);
    }
    if let Some(ext) = source.extension() {
        name.push('.');
        name.push_str(&ext.to_string_lossy());
    }
    source.with_file_name(name)
}

#[cfg(test)]
mod tests {
    use image::{Rgb, RgbImage};

    use super::*;

    #[test]
    fn output_path_inserts_suffix_before_extension() {
        assert_eq!(
            edited_output_path(Path::new("/data/uploads/scan.pdf"), None),
            PathBuf::from("/data/uploads/scan-edited.pdf")
        );
        assert_eq!(
            edited_output_path(Path::new("invoice.v2.png"), Some("abc123")),
            PathBuf::from("invoice.v2-edited-abc123.png")
        );
        assert_eq!(
            edited_output_path(Path::new("/tmp/README"), None),
            PathBuf::from("/tmp/README-edited")
        );
    }

    #[tokio::test]
    async fn missing_sources_are_reported_as_not_found() {
        let err = Source::open(Path::new("/nonexistent/scan.pdf"))
            .await
            .unwrap_err();
        assert!(matches!(err, JobError::SourceNotFound { .. }));
        assert_eq!(err.to_string(), "File not found");
    }

    #[tokio::test]
    async fn images_are_detected_by_content() -> Result<()> {
        let dir = tempfile::TempDir::with_prefix("sources")?;
        // Misleading extension on purpose.
        let path = dir.path().join("page.pdf");
        RgbImage::from_pixel(4, 4, Rgb([255, 255, 255]))
            .save_with_format(&path, ImageFormat::Png)?;
        let source = Source::open(&path).await?;
        assert_eq!(source.kind, SourceKind::Image(ImageFormat::Png));
        assert_eq!(source.file_name(), "page.pdf");
        Ok(())
    }

    #[tokio::test]
    async fn unknown_types_are_rejected() -> Result<()> {
        let dir = tempfile::TempDir::with_prefix("sources")?;
        let path = dir.path().join("notes.txt");
        std::fs::write(&path, "just some text")?;
        let err = Source::open(&path).await.unwrap_err();
        assert!(matches!(err, JobError::Internal(_)));
        Ok(())
    }
}
