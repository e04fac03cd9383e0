//! Tesseract OCR engine.

use image::{ImageFormat, RgbImage};
use tokio::process::Command;

use crate::{
    async_utils::{
        DEFAULT_ERROR_REGEX, check_for_command_failure, spawn_blocking_propagating_panics,
    },
    cpu_limit::with_cpu_semaphore,
    geometry::Polygon,
    model::Detection,
    prelude::*,
};

use super::OcrEngine;

/// Tesseract's TSV `level` for individual words.
const WORD_LEVEL: u32 = 5;

/// OCR engine wrapping the `tesseract` CLI tool.
pub struct TesseractOcrEngine {
    /// Tesseract language code(s), like `eng` or `eng+deu`.
    lang: String,
}

impl TesseractOcrEngine {
    /// Create a new `tesseract` engine.
    pub fn new(lang: impl Into<String>) -> Self {
        Self { lang: lang.into() }
    }
}

#[async_trait]
impl OcrEngine for TesseractOcrEngine {
    #[instrument(level = "debug", skip_all, fields(lang = %self.lang))]
    async fn recognize(&self, page: &RgbImage) -> Result<Vec<Detection>> {
        // Write our input to a temporary file.
        let tmpdir = tempfile::TempDir::with_prefix("tesseract")?;
        let input_path = tmpdir.path().join("input.png");
        let page = page.clone();
        let write_path = input_path.clone();
        spawn_blocking_propagating_panics(move || {
            page.save_with_format(&write_path, ImageFormat::Png)
                .context("cannot write tesseract input file")
        })
        .await?;

        // Run tesseract on the input file, asking for word boxes on stdout.
        let output = with_cpu_semaphore(|| async {
            Command::new("tesseract")
                .arg(&input_path)
                .arg("stdout")
                .arg("-l")
                .arg(&self.lang)
                .arg("tsv")
                .output()
                .await
                .context("cannot run tesseract")
        })
        .await?;
        check_for_command_failure("tesseract", &output, Some(&DEFAULT_ERROR_REGEX))?;

        let detections = parse_tsv(&output.stdout)?;
        debug!(count = detections.len(), "tesseract found lines");
        Ok(detections)
    }
}

/// One row of Tesseract's TSV output.
#[derive(Debug, Deserialize)]
struct TsvRow {
    level: u32,
    page_num: u32,
    block_num: u32,
    par_num: u32,
    line_num: u32,
    left: i32,
    top: i32,
    width: i32,
    height: i32,
    conf: f32,
    #[serde(default)]
    text: Option<String>,
}

impl TsvRow {
    fn line_key(&self) -> (u32, u32, u32, u32) {
        (self.page_num, self.block_num, self.par_num, self.line_num)
    }
}

/// Words on one line, as we accumulate them.
struct LineAccumulator {
    key: (u32, u32, u32, u32),
    words: Vec<String>,
    confidences: Vec<f32>,
    left: i32,
    top: i32,
    right: i32,
    bottom: i32,
}

impl LineAccumulator {
    fn new(row: &TsvRow) -> Self {
        Self {
            key: row.line_key(),
            words: vec![],
            confidences: vec![],
            left: row.left,
            top: row.top,
            right: row.left + row.width,
            bottom: row.top + row.height,
        }
    }

    fn add(&mut self, row: &TsvRow, word: &str) {
        if self.words.is_empty() {
            *self = Self::new(row);
        } else {
            self.left = self.left.min(row.left);
            self.top = self.top.min(row.top);
            self.right = self.right.max(row.left + row.width);
            self.bottom = self.bottom.max(row.top + row.height);
        }
        self.words.push(word.to_owned());
        self.confidences.push(row.conf.max(0.0));
    }

    fn finish(self) -> Option<Detection> {
        if self.words.is_empty() {
            return None;
        }
        let polygon: Polygon = [
            [self.left, self.top],
            [self.right, self.top],
            [self.right, self.bottom],
            [self.left, self.bottom],
        ];
        let mean = self.confidences.iter().sum::<f32>() / self.confidences.len() as f32;
        Some(Detection {
            polygon,
            text: self.words.join(" "),
            confidence: (mean / 100.0).clamp(0.0, 1.0),
        })
    }
}

/// Group Tesseract's word rows into line-level detections, in reading order.
fn parse_tsv(tsv: &[u8]) -> Result<Vec<Detection>> {
    let mut rdr = csv::ReaderBuilder::new()
        .delimiter(b'\t')
        .quoting(false)
        .flexible(true)
        .from_reader(tsv);

    let mut detections = vec![];
    let mut line: Option<LineAccumulator> = None;
    for row in rdr.deserialize::<TsvRow>() {
        let row = row.context("cannot parse tesseract TSV output")?;
        if row.level != WORD_LEVEL {
            continue;
        }
        let word = row.text.as_deref().unwrap_or_default().trim();
        if word.is_empty() {
            continue;
        }
        match line.as_mut() {
            Some(current) if current.key == row.line_key() => current.add(&row, word),
            _ => {
                if let Some(done) = line.take() {
                    detections.extend(done.finish());
                }
                let mut next = LineAccumulator::new(&row);
                next.add(&row, word);
                line = Some(next);
            }
        }
    }
    if let Some(done) = line {
        detections.extend(done.finish());
    }
    Ok(detections)
}

#[cfg(test)]
mod tests {
    use image::Rgb;

    use super::*;

    const TSV: &str = "level\tpage_num\tblock_num\tpar_num\tline_num\tword_num\tleft\ttop\twidth\theight\tconf\ttext
1\t1\t0\t0\t0\t0\t0\t0\t1275\t1650\t-1\t
2\t1\t1\t0\t0\t0\t100\t90\t400\t60\t-1\t
4\t1\t1\t1\t1\t0\t100\t90\t300\t25\t-1\t
5\t1\t1\t1\t1\t1\t100\t92\t120\t22\t96.5\tInvoice
5\t1\t1\t1\t1\t2\t230\t90\t170\t25\t91.5\t#1042
5\t1\t1\t1\t1\t3\t410\t90\t5\t25\t30\t
4\t1\t1\t1\t2\t0\t100\t125\t200\t25\t-1\t
5\t1\t1\t1\t2\t1\t100\t125\t200\t25\t12\t\"Total\"
";

    #[test]
    fn words_are_grouped_into_lines() -> Result<()> {
        let detections = parse_tsv(TSV.as_bytes())?;
        assert_eq!(detections.len(), 2);

        let first = &detections[0];
        assert_eq!(first.text, "Invoice #1042");
        assert_eq!(first.polygon, [[100, 90], [400, 90], [400, 115], [100, 115]]);
        assert!((first.confidence - 0.94).abs() < 1e-6);

        let second = &detections[1];
        assert_eq!(second.text, "\"Total\"");
        assert!((second.confidence - 0.12).abs() < 1e-6);
        Ok(())
    }

    #[test]
    fn empty_pages_have_no_detections() -> Result<()> {
        let tsv = "level\tpage_num\tblock_num\tpar_num\tline_num\tword_num\tleft\ttop\twidth\theight\tconf\ttext
1\t1\t0\t0\t0\t0\t0\t0\t100\t100\t-1\t
";
        assert!(parse_tsv(tsv.as_bytes())?.is_empty());
        Ok(())
    }

    #[tokio::test]
    #[ignore = "Requires tesseract to be installed"]
    async fn blank_pages_have_no_text() -> Result<()> {
        let page = RgbImage::from_pixel(200, 100, Rgb([255, 255, 255]));
        let detections = TesseractOcrEngine::new("eng").recognize(&page).await?;
        assert!(detections.is_empty());
        Ok(())
    }
}
