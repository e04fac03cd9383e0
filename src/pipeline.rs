//! The document pipeline: extracting text blocks, and applying edits.
//!
//! The pipeline owns no global state. Every collaborator it talks to is passed
//! in, so tests can swap in fakes for the external tools.

use std::{collections::BTreeMap, sync::Arc};

use image::RgbImage;

use crate::{
    async_utils::{io::write_atomically, spawn_blocking_propagating_panics},
    color::inspect_block,
    compositor::TextCompositor,
    encode::DocumentEncoder,
    error::{Capability, JobError, JobResult},
    geometry::PixelRect,
    model::{ApplyResult, EditRequest, ExtractionResult, Page, TextBlock},
    ocr::OcrEngine,
    page_edit::apply_page_edits,
    prelude::*,
    raster::Rasterizer,
    sources::{Source, edited_output_path},
    vector::{VectorPage, VectorReader},
};

/// Default rasterization resolution.
pub const DEFAULT_DPI: u32 = 150;

/// Receives human-readable progress messages from a running pipeline.
pub trait Progress: Send + Sync {
    /// Report what we're doing now.
    fn report(&self, status: String);
}

/// The external capabilities the pipeline depends on.
#[derive(Clone)]
pub struct Collaborators {
    pub ocr: Arc<dyn OcrEngine>,
    pub rasterizer: Arc<dyn Rasterizer>,
    pub vector_reader: Arc<dyn VectorReader>,
    pub encoder: Arc<dyn DocumentEncoder>,
    pub compositor: Arc<TextCompositor>,
}

/// Extracts text from documents and applies edits to them.
#[derive(Clone)]
pub struct Pipeline {
    collaborators: Collaborators,
    /// Extraction and editing must use the same DPI, or edit coordinates
    /// won't line up with the page.
    dpi: u32,
}

impl Pipeline {
    /// Create a new pipeline.
    pub fn new(collaborators: Collaborators, dpi: u32) -> Self {
        Self { collaborators, dpi }
    }

    /// OCR every page of `source`, and guess each block's colors.
    #[instrument(level = "debug", skip_all, fields(source = %source.display()))]
    pub async fn extract(
        &self,
        source: &Path,
        progress: &dyn Progress,
    ) -> JobResult<ExtractionResult> {
        let source = Source::open(source).await?;
        progress.report("Initializing OCR engine...".to_owned());
        // Without vector text, every block gets the default colors.
        let vector_pages = match self.collaborators.vector_reader.open(&source).await {
            Ok(pages) => pages,
            Err(err) => {
                let err = JobError::ColorInspectionFailure(format!("{:#}", err));
                warn!("{}; using default colors", err);
                vec![]
            }
        };

        let images = self.rasterize(&source, progress).await?;
        let page_count = images.len();
        let mut pages = Vec::with_capacity(page_count);
        for (page_idx, image) in images.into_iter().enumerate() {
            progress.report(format!(
                "Processing page {} of {}...",
                page_idx + 1,
                page_count
            ));
            let page = self
                .extract_page(page_idx, &image, vector_pages.get(page_idx))
                .await?;
            pages.push(page);
        }
        info!(pages = page_count, "extracted text from {}", source.file_name());
        Ok(ExtractionResult {
            page_count,
            dpi: self.dpi,
            pages,
        })
    }

    /// OCR a single page.
    #[instrument(level = "debug", skip_all, fields(page = page_idx + 1))]
    async fn extract_page(
        &self,
        page_idx: usize,
        image: &RgbImage,
        vector_page: Option<&VectorPage>,
    ) -> JobResult<Page> {
        let detections = self
            .collaborators
            .ocr
            .recognize(image)
            .await
            .map_err(|err| JobError::external(Capability::Ocr, err))?;
        let (width, height) = image.dimensions();
        let text_blocks = detections
            .into_iter()
            .enumerate()
            .map(|(order, detection)| {
                let rect = PixelRect::bounding(&detection.polygon);
                let colors = inspect_block(&rect, (width, height), vector_page);
                TextBlock::from_detection(page_idx, order, detection, colors)
            })
            .collect::<Vec<_>>();
        debug!(blocks = text_blocks.len(), "found text blocks");
        Ok(Page {
            page_number: page_idx + 1,
            width,
            height,
            vector_width: vector_page.map(|page| page.width),
            vector_height: vector_page.map(|page| page.height),
            text_blocks,
        })
    }

    /// Apply `edits` to `source`, writing the result next to it.
    ///
    /// If `output_token` is given, it becomes part of the output file name so
    /// that concurrent jobs on one source don't overwrite each other.
    #[instrument(level = "debug", skip_all, fields(source = %source.display(), edits = edits.len()))]
    pub async fn apply_edits(
        &self,
        source: &Path,
        edits: Vec<EditRequest>,
        output_token: Option<&str>,
        progress: &dyn Progress,
    ) -> JobResult<ApplyResult> {
        let source = Source::open(source).await?;
        let images = self.rasterize(&source, progress).await?;
        let page_count = images.len();

        let (mut edits_by_page, skipped_edits) = group_edits(edits, page_count);
        let pages_edited = edits_by_page.len();

        let mut edited = Vec::with_capacity(page_count);
        for (page_idx, image) in images.into_iter().enumerate() {
            progress.report(format!(
                "Applying edits to page {} of {}...",
                page_idx + 1,
                page_count
            ));
            match edits_by_page.remove(&page_idx) {
                Some(page_edits) => {
                    let compositor = self.collaborators.compositor.clone();
                    let image = spawn_blocking_propagating_panics(move || {
                        apply_page_edits(image, &page_edits, &compositor)
                    })
                    .await;
                    edited.push(image);
                }
                None => edited.push(image),
            }
        }

        progress.report("Encoding output document...".to_owned());
        let bytes = self
            .collaborators
            .encoder
            .encode(source.kind, edited, self.dpi)
            .await
            .map_err(|err| JobError::external(Capability::Encoder, err))?;

        let output_path = edited_output_path(&source.path, output_token);
        write_atomically(&output_path, bytes)
            .await
            .map_err(JobError::internal)?;
        let filename = output_path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_default();
        info!(
            pages_edited,
            skipped_edits,
            "wrote {}",
            output_path.display()
        );
        Ok(ApplyResult {
            output_path,
            filename,
            pages_edited,
            skipped_edits,
        })
    }

    async fn rasterize(
        &self,
        source: &Source,
        progress: &dyn Progress,
    ) -> JobResult<Vec<RgbImage>> {
        progress.report("Converting PDF to images...".to_owned());
        self.collaborators
            .rasterizer
            .rasterize(source, self.dpi)
            .await
            .map_err(|err| JobError::external(Capability::Rasterizer, err))
    }
}

/// Group edits by 0-based page index, keeping their order within each page.
///
/// Edits for page 0, or for pages past the end of the document, are dropped
/// with a warning. Returns the groups and the number of dropped edits.
fn group_edits(
    edits: Vec<EditRequest>,
    page_count: usize,
) -> (BTreeMap<usize, Vec<EditRequest>>, usize) {
    let mut by_page = BTreeMap::<usize, Vec<EditRequest>>::new();
    let mut skipped = 0;
    for edit in edits {
        match edit.page_index() {
            Some(idx) if idx < page_count => by_page.entry(idx).or_default().push(edit),
            _ => {
                warn!(
                    "skipping edit for page {} (document has {} pages)",
                    edit.page, page_count
                );
                skipped += 1;
            }
        }
    }
    (by_page, skipped)
}

#[cfg(test)]
mod tests {
    use std::sync::{
        Mutex,
        atomic::{AtomicUsize, Ordering},
    };

    use image::{ImageFormat, Rgb};
    use serde_json::json;

    use super::*;
    use crate::{
        encode::LopdfEncoder,
        geometry::VectorRect,
        model::Detection,
        sources::SourceKind,
        vector::TextRun,
    };

    const PAPER: Rgb<u8> = Rgb([255, 255, 255]);

    /// Ignores progress.
    struct LogProgress;

    impl Progress for LogProgress {
        fn report(&self, status: String) {
            debug!("{}", status);
        }
    }

    /// Returns the same detections for every page.
    struct FakeOcr {
        detections: Vec<Detection>,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl OcrEngine for FakeOcr {
        async fn recognize(&self, _page: &RgbImage) -> Result<Vec<Detection>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(self.detections.clone())
        }
    }

    struct FailingOcr;

    #[async_trait]
    impl OcrEngine for FailingOcr {
        async fn recognize(&self, _page: &RgbImage) -> Result<Vec<Detection>> {
            Err(anyhow!("model weights missing"))
        }
    }

    /// Returns blank pages, ignoring the source's contents.
    struct FakeRasterizer {
        pages: Vec<RgbImage>,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl Rasterizer for FakeRasterizer {
        async fn rasterize(&self, _source: &Source, _dpi: u32) -> Result<Vec<RgbImage>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(self.pages.clone())
        }
    }

    struct FakeVectorReader {
        pages: Vec<VectorPage>,
    }

    #[async_trait]
    impl VectorReader for FakeVectorReader {
        async fn open(&self, _source: &Source) -> Result<Vec<VectorPage>> {
            Ok(self.pages.clone())
        }
    }

    struct FailingVectorReader;

    #[async_trait]
    impl VectorReader for FailingVectorReader {
        async fn open(&self, _source: &Source) -> Result<Vec<VectorPage>> {
            Err(anyhow!("mutool: not found"))
        }
    }

    /// Records progress messages.
    #[derive(Default)]
    struct RecordingProgress(Mutex<Vec<String>>);

    impl Progress for RecordingProgress {
        fn report(&self, status: String) {
            self.0.lock().expect("lock poisoned").push(status);
        }
    }

    impl RecordingProgress {
        fn messages(&self) -> Vec<String> {
            self.0.lock().expect("lock poisoned").clone()
        }
    }

    struct Fixture {
        pipeline: Pipeline,
        ocr: Arc<FakeOcr>,
        rasterizer: Arc<FakeRasterizer>,
    }

    fn fixture(pages: Vec<RgbImage>, detections: Vec<Detection>, vector: Vec<VectorPage>) -> Fixture {
        let ocr = Arc::new(FakeOcr {
            detections,
            calls: AtomicUsize::new(0),
        });
        let rasterizer = Arc::new(FakeRasterizer {
            pages,
            calls: AtomicUsize::new(0),
        });
        let collaborators = Collaborators {
            ocr: ocr.clone(),
            rasterizer: rasterizer.clone(),
            vector_reader: Arc::new(FakeVectorReader { pages: vector }),
            encoder: Arc::new(LopdfEncoder::new()),
            compositor: Arc::new(TextCompositor::from_fonts(None, None)),
        };
        Fixture {
            pipeline: Pipeline::new(collaborators, DEFAULT_DPI),
            ocr,
            rasterizer,
        }
    }

    /// Write a small PNG source document, and return its directory and path.
    fn png_source(image: &RgbImage) -> Result<(tempfile::TempDir, PathBuf)> {
        let dir = tempfile::TempDir::with_prefix("pipeline")?;
        let path = dir.path().join("scan.png");
        image.save_with_format(&path, ImageFormat::Png)?;
        Ok((dir, path))
    }

    fn detection(text: &str, polygon: [[i32; 2]; 4]) -> Detection {
        Detection {
            polygon,
            text: text.to_owned(),
            confidence: 0.9,
        }
    }

    #[tokio::test]
    async fn extracting_a_page_with_no_text() -> Result<()> {
        let page = RgbImage::from_pixel(120, 80, PAPER);
        let (_dir, path) = png_source(&page)?;
        let fx = fixture(vec![page], vec![], vec![]);
        let progress = RecordingProgress::default();

        let result = fx.pipeline.extract(&path, &progress).await?;
        assert_eq!(
            serde_json::to_value(&result)?,
            json!({
                "page_count": 1,
                "dpi": DEFAULT_DPI,
                "pages": [
                    { "page_number": 1, "width": 120, "height": 80, "text_blocks": [] }
                ],
            })
        );
        assert_eq!(
            progress.messages(),
            vec![
                "Initializing OCR engine...",
                "Converting PDF to images...",
                "Processing page 1 of 1...",
            ]
        );
        Ok(())
    }

    #[tokio::test]
    async fn extracted_blocks_take_colors_from_the_vector_page() -> Result<()> {
        let page = RgbImage::from_pixel(200, 100, PAPER);
        let (_dir, path) = png_source(&page)?;
        let detections = vec![
            detection("Total", [[20, 20], [80, 20], [80, 40], [20, 40]]),
            detection("Notes", [[20, 60], [80, 60], [80, 80], [20, 80]]),
        ];
        // Half-scale vector page with one red run under the first block.
        let vector = vec![VectorPage {
            width: 100.0,
            height: 50.0,
            runs: vec![TextRun {
                bbox: VectorRect {
                    x0: 10.0,
                    y0: 10.0,
                    x1: 40.0,
                    y1: 20.0,
                },
                color: "#cc0000".to_owned(),
            }],
        }];
        let fx = fixture(vec![page.clone(), page], detections, vector);

        let result = fx.pipeline.extract(&path, &LogProgress).await?;
        assert_eq!(result.page_count, 2);
        let first = &result.pages[0];
        assert_eq!(first.vector_width, Some(100.0));
        assert_eq!(first.text_blocks[0].id, "page1_block0");
        assert_eq!(first.text_blocks[0].fg_color, "#cc0000");
        assert_eq!(first.text_blocks[1].id, "page1_block1");
        assert_eq!(first.text_blocks[1].fg_color, "#000000");
        // The second page has no vector form, so everything is default.
        let second = &result.pages[1];
        assert_eq!(second.vector_width, None);
        assert_eq!(second.text_blocks[0].id, "page2_block0");
        assert_eq!(second.text_blocks[0].fg_color, "#000000");
        assert_eq!(second.text_blocks[0].bg_color, "#ffffff");
        assert_eq!(fx.ocr.calls.load(Ordering::SeqCst), 2);
        Ok(())
    }

    #[tokio::test]
    async fn ocr_failures_fail_the_extraction() -> Result<()> {
        let page = RgbImage::from_pixel(10, 10, PAPER);
        let (_dir, path) = png_source(&page)?;
        let mut fx = fixture(vec![page], vec![], vec![]);
        fx.pipeline.collaborators.ocr = Arc::new(FailingOcr);

        let err = fx.pipeline.extract(&path, &LogProgress).await.unwrap_err();
        assert!(matches!(
            err,
            JobError::ExternalCapabilityFailure {
                capability: Capability::Ocr,
                ..
            }
        ));
        assert_eq!(err.to_string(), "OCR failed: model weights missing");
        Ok(())
    }

    #[tokio::test]
    async fn vector_reader_failures_fall_back_to_default_colors() -> Result<()> {
        let page = RgbImage::from_pixel(200, 100, PAPER);
        let (_dir, path) = png_source(&page)?;
        let detections = vec![detection("Total", [[20, 20], [80, 20], [80, 40], [20, 40]])];
        let mut fx = fixture(vec![page], detections, vec![]);
        fx.pipeline.collaborators.vector_reader = Arc::new(FailingVectorReader);

        let result = fx.pipeline.extract(&path, &LogProgress).await?;
        assert_eq!(result.page_count, 1);
        let page = &result.pages[0];
        assert_eq!(page.vector_width, None);
        assert_eq!(page.text_blocks.len(), 1);
        assert_eq!(page.text_blocks[0].text, "Total");
        assert_eq!(page.text_blocks[0].fg_color, "#000000");
        assert_eq!(page.text_blocks[0].bg_color, "#ffffff");
        assert_eq!(fx.ocr.calls.load(Ordering::SeqCst), 1);
        Ok(())
    }

    #[tokio::test]
    async fn missing_sources_fail_before_any_other_work() {
        let fx = fixture(vec![], vec![], vec![]);
        let path = Path::new("/nonexistent/uploads/scan.pdf");

        let err = fx
            .pipeline
            .apply_edits(path, vec![], None, &LogProgress)
            .await
            .unwrap_err();
        assert_eq!(err.to_string(), "File not found");
        let err = fx.pipeline.extract(path, &LogProgress).await.unwrap_err();
        assert_eq!(err.to_string(), "File not found");

        assert_eq!(fx.rasterizer.calls.load(Ordering::SeqCst), 0);
        assert_eq!(fx.ocr.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn applying_edits_writes_a_new_file() -> Result<()> {
        let mut page = RgbImage::from_pixel(200, 60, PAPER);
        for y in 14..26 {
            for x in 12..90 {
                page.put_pixel(x, y, Rgb([0, 0, 0]));
            }
        }
        let (dir, path) = png_source(&page)?;
        let fx = fixture(vec![page.clone()], vec![], vec![]);
        let edits: Vec<EditRequest> = serde_json::from_value(json!([
            { "page": 1, "x": 10, "y": 10, "w": 100, "h": 20, "text": "", "font_size": 20 },
            { "page": 0, "x": 0, "y": 0, "w": 10, "h": 10 },
            { "page": 7, "x": 0, "y": 0, "w": 10, "h": 10 },
        ]))?;
        let progress = RecordingProgress::default();

        let result = fx
            .pipeline
            .apply_edits(&path, edits, None, &progress)
            .await?;
        assert_eq!(result.output_path, dir.path().join("scan-edited.png"));
        assert_eq!(result.filename, "scan-edited.png");
        assert_eq!(result.pages_edited, 1);
        assert_eq!(result.skipped_edits, 2);
        assert_eq!(
            progress.messages(),
            vec![
                "Converting PDF to images...",
                "Applying edits to page 1 of 1...",
                "Encoding output document...",
            ]
        );

        // The source is untouched, and the output has the ink erased.
        assert_eq!(image::open(&path)?.to_rgb8(), page);
        let output = image::open(&result.output_path)?.to_rgb8();
        assert!(output.pixels().all(|p| *p == PAPER));
        Ok(())
    }

    #[tokio::test]
    async fn pages_without_edits_pass_through() -> Result<()> {
        let page = RgbImage::from_pixel(40, 40, Rgb([200, 210, 220]));
        let (_dir, path) = png_source(&page)?;
        let fx = fixture(vec![page.clone()], vec![], vec![]);

        let result = fx
            .pipeline
            .apply_edits(&path, vec![], Some("job42"), &LogProgress)
            .await?;
        assert_eq!(result.filename, "scan-edited-job42.png");
        assert_eq!(result.pages_edited, 0);
        assert_eq!(image::open(&result.output_path)?.to_rgb8(), page);
        Ok(())
    }

    #[tokio::test]
    async fn pdf_sources_are_reencoded_as_pdfs() -> Result<()> {
        let pages = vec![RgbImage::from_pixel(150, 150, PAPER); 2];
        let dir = tempfile::TempDir::with_prefix("pipeline")?;
        let path = dir.path().join("contract.pdf");
        let bytes = LopdfEncoder::new()
            .encode(SourceKind::Pdf, pages.clone(), DEFAULT_DPI)
            .await?;
        std::fs::write(&path, bytes)?;
        let fx = fixture(pages, vec![], vec![]);
        let edits: Vec<EditRequest> =
            serde_json::from_value(json!([{ "page": 2, "x": 5, "y": 5, "w": 10, "h": 10 }]))?;

        let result = fx
            .pipeline
            .apply_edits(&path, edits, None, &LogProgress)
            .await?;
        assert_eq!(result.filename, "contract-edited.pdf");
        let written = std::fs::read(&result.output_path)?;
        let doc = lopdf::Document::load_mem(&written)?;
        assert_eq!(doc.get_pages().len(), 2);
        Ok(())
    }

    #[test]
    fn edits_are_grouped_in_order() -> Result<()> {
        let edits: Vec<EditRequest> = serde_json::from_value(json!([
            { "page": 2, "text": "a" },
            { "page": 1, "text": "b" },
            { "page": 2, "text": "c" },
            { "page": 3, "text": "d" },
        ]))?;
        let (groups, skipped) = group_edits(edits, 2);
        assert_eq!(skipped, 1);
        let texts = |idx: usize| groups[&idx].iter().map(|e| e.text.clone()).collect::<Vec<_>>();
        assert_eq!(texts(0), vec!["b"]);
        assert_eq!(texts(1), vec!["a", "c"]);
        Ok(())
    }
}
