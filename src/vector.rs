//! Reading the vector text layer of a PDF.
//!
//! We only need enough of the vector layer to guess text colors: each page's
//! size in points, and runs of characters which share a color. We get these
//! from MuPDF's structured text output (`mutool draw -F stext`), which looks
//! roughly like this:
//!
//! ```xml
//! <document name="scan.pdf">
//! <page id="page1" width="612" height="792">
//! <block bbox="...">
//! <line bbox="..." wmode="0" dir="1 0">
//! <font name="Helvetica" size="12">
//! <char quad="72 70 79 70 72 84 79 84" x="72" y="82" color="#ff0000" c="H"/>
//! ```
//!
//! Coordinates have a top-left origin, like our pixel space.

use quick_xml::{
    Reader,
    events::{BytesStart, Event},
};
use tokio::process::Command;

use crate::{
    async_utils::check_for_command_failure,
    cpu_limit::with_cpu_semaphore,
    geometry::VectorRect,
    prelude::*,
    sources::{Source, SourceKind},
};

/// Color reported for characters with no `color` attribute.
const DEFAULT_RUN_COLOR: &str = "#000000";

/// A run of vector text drawn in a single color.
#[derive(Clone, Debug, PartialEq)]
pub struct TextRun {
    /// The area covered by the run, in points.
    pub bbox: VectorRect,
    /// The run's fill color, encoded as `#rrggbb` or a packed sRGB integer.
    pub color: String,
}

/// The vector form of one page.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct VectorPage {
    /// Page width, in points.
    pub width: f64,
    /// Page height, in points.
    pub height: f64,
    /// Text runs in document order.
    pub runs: Vec<TextRun>,
}

/// Something that can read the vector text layer of a source document.
#[async_trait]
pub trait VectorReader: Send + Sync + 'static {
    /// Read every page of `source`. Sources without a vector form return no
    /// pages.
    async fn open(&self, source: &Source) -> Result<Vec<VectorPage>>;
}

/// Reads vector text using MuPDF's `mutool`.
pub struct MutoolReader {
    /// Stop after this many pages.
    max_pages: Option<usize>,
}

impl MutoolReader {
    /// Create a new reader.
    pub fn new(max_pages: Option<usize>) -> Self {
        Self { max_pages }
    }
}

#[async_trait]
impl VectorReader for MutoolReader {
    #[instrument(level = "debug", skip_all, fields(path = %source.path.display()))]
    async fn open(&self, source: &Source) -> Result<Vec<VectorPage>> {
        if source.kind != SourceKind::Pdf {
            return Ok(vec![]);
        }

        let tmpdir = tempfile::TempDir::with_prefix("stext")?;
        let out_path = tmpdir.path().join("page.stext");
        let mut cmd = Command::new("mutool");
        cmd.arg("draw")
            .arg("-F")
            .arg("stext")
            .arg("-o")
            .arg(&out_path)
            .arg(&source.path);
        if let Some(max_pages) = self.max_pages {
            cmd.arg(format!("1-{}", max_pages.max(1)));
        }
        let output = with_cpu_semaphore(|| async {
            cmd.output().await.with_context(|| {
                format!("failed to run mutool on {:?}", source.path.display())
            })
        })
        .await?;
        check_for_command_failure("mutool", &output, None)?;

        let xml = tokio::fs::read_to_string(&out_path)
            .await
            .context("cannot read mutool output")?;
        let pages = parse_stext(&xml)?;
        debug!(pages = pages.len(), "read vector text");
        Ok(pages)
    }
}

/// Parse MuPDF structured text into pages of color runs.
///
/// Consecutive characters inside one `<font>` element that share a color form
/// a run. Runs never span lines.
pub fn parse_stext(xml: &str) -> Result<Vec<VectorPage>> {
    let mut reader = Reader::from_str(xml);
    reader.trim_text(true);

    let mut pages = vec![];
    let mut page: Option<VectorPage> = None;
    let mut run: Option<TextRun> = None;
    loop {
        let event = reader
            .read_event()
            .with_context(|| format!("malformed stext at byte {}", reader.buffer_position()))?;
        match event {
            Event::Start(e) if e.name().as_ref() == b"page" => {
                page = Some(VectorPage {
                    width: number_attr(&e, b"width")?.unwrap_or_default(),
                    height: number_attr(&e, b"height")?.unwrap_or_default(),
                    runs: vec![],
                });
            }
            Event::Start(e) | Event::Empty(e) if e.name().as_ref() == b"char" => {
                let Some(page) = page.as_mut() else {
                    continue;
                };
                let Some(bbox) = char_bbox(&e)? else {
                    continue;
                };
                let color = string_attr(&e, b"color")?
                    .unwrap_or_else(|| DEFAULT_RUN_COLOR.to_owned());
                match run.as_mut() {
                    Some(current) if current.color == color => {
                        current.bbox = current.bbox.union(&bbox);
                    }
                    _ => {
                        flush_run(page, &mut run);
                        run = Some(TextRun { bbox, color });
                    }
                }
            }
            Event::Start(e) if e.name().as_ref() == b"font" => {
                if let Some(page) = page.as_mut() {
                    flush_run(page, &mut run);
                }
            }
            Event::End(e) if matches!(e.name().as_ref(), b"font" | b"line") => {
                if let Some(page) = page.as_mut() {
                    flush_run(page, &mut run);
                }
            }
            Event::End(e) if e.name().as_ref() == b"page" => {
                if let Some(mut finished) = page.take() {
                    flush_run(&mut finished, &mut run);
                    pages.push(finished);
                }
            }
            Event::Eof => break,
            _ => {}
        }
    }
    Ok(pages)
}

fn flush_run(page: &mut VectorPage, run: &mut Option<TextRun>) {
    if let Some(run) = run.take() {
        page.runs.push(run);
    }
}

/// Get a character's bounding box from its `quad` (newer MuPDF) or `bbox`
/// (older MuPDF) attribute.
fn char_bbox(e: &BytesStart<'_>) -> Result<Option<VectorRect>> {
    let coords = match string_attr(e, b"quad")? {
        Some(quad) => quad,
        None => match string_attr(e, b"bbox")? {
            Some(bbox) => bbox,
            None => return Ok(None),
        },
    };
    let values = coords
        .split_whitespace()
        .map(|v| v.parse::<f64>())
        .collect::<std::result::Result<Vec<_>, _>>()
        .with_context(|| format!("bad character coordinates {:?}", coords))?;
    if values.len() != 4 && values.len() != 8 {
        return Err(anyhow!("bad character coordinates {:?}", coords));
    }
    let xs = values.iter().step_by(2);
    let ys = values.iter().skip(1).step_by(2);
    Ok(Some(VectorRect {
        x0: xs.clone().copied().fold(f64::INFINITY, f64::min),
        y0: ys.clone().copied().fold(f64::INFINITY, f64::min),
        x1: xs.copied().fold(f64::NEG_INFINITY, f64::max),
        y1: ys.copied().fold(f64::NEG_INFINITY, f64::max),
    }))
}

fn string_attr(e: &BytesStart<'_>, name: &[u8]) -> Result<Option<String>> {
    for attr in e.attributes() {
        let attr = attr.context("malformed stext attribute")?;
        if attr.key.as_ref() == name {
            let value = attr
                .unescape_value()
                .context("malformed stext attribute value")?;
            return Ok(Some(value.into_owned()));
        }
    }
    Ok(None)
}

fn number_attr(e: &BytesStart<'_>, name: &[u8]) -> Result<Option<f64>> {
    string_attr(e, name)?
        .map(|value| {
            value
                .parse::<f64>()
                .with_context(|| format!("bad number {:?} in stext", value))
        })
        .transpose()
}

#[cfg(test)]
mod tests {
    use super::*;

    const STEXT: &str = r##"<?xml version="1.0"?>
<document name="invoice.pdf">
<page id="page1" width="612" height="792">
<block bbox="72 70 200 84">
<line bbox="72 70 200 84" wmode="0" dir="1 0">
<font name="Helvetica-Bold" size="12">
<char quad="72 70 79 70 72 84 79 84" x="72" y="82" color="#ff0000" c="T"/>
<char quad="79 70 86 70 79 84 86 84" x="79" y="82" color="#ff0000" c="o"/>
<char quad="86 70 93 70 86 84 93 84" x="86" y="82" color="#0000ff" c="t"/>
</font>
<font name="Helvetica" size="12">
<char quad="93 70 100 70 93 84 100 84" x="93" y="82" color="#0000ff" c="a"/>
</font>
</line>
</block>
</page>
<page id="page2" width="595.28" height="841.89">
<block bbox="10 10 20 20">
<line bbox="10 10 20 20" wmode="0" dir="1 0">
<font name="Times" size="10">
<char bbox="10 10 15 20" x="10" y="18" c="&amp;"/>
<char bbox="15 10 20 20" x="15" y="18" c="x"/>
</font>
</line>
</block>
</page>
</document>
"##;

    #[test]
    fn runs_split_on_color_and_font_changes() -> Result<()> {
        let pages = parse_stext(STEXT)?;
        assert_eq!(pages.len(), 2);

        let first = &pages[0];
        assert_eq!((first.width, first.height), (612.0, 792.0));
        assert_eq!(
            first.runs,
            vec![
                TextRun {
                    bbox: VectorRect {
                        x0: 72.0,
                        y0: 70.0,
                        x1: 86.0,
                        y1: 84.0
                    },
                    color: "#ff0000".to_owned(),
                },
                TextRun {
                    bbox: VectorRect {
                        x0: 86.0,
                        y0: 70.0,
                        x1: 93.0,
                        y1: 84.0
                    },
                    color: "#0000ff".to_owned(),
                },
                TextRun {
                    bbox: VectorRect {
                        x0: 93.0,
                        y0: 70.0,
                        x1: 100.0,
                        y1: 84.0
                    },
                    color: "#0000ff".to_owned(),
                },
            ]
        );
        Ok(())
    }

    #[test]
    fn old_style_bboxes_and_missing_colors_are_accepted() -> Result<()> {
        let pages = parse_stext(STEXT)?;
        let second = &pages[1];
        assert_eq!(second.width, 595.28);
        assert_eq!(second.runs.len(), 1);
        assert_eq!(second.runs[0].color, DEFAULT_RUN_COLOR);
        assert_eq!(
            second.runs[0].bbox,
            VectorRect {
                x0: 10.0,
                y0: 10.0,
                x1: 20.0,
                y1: 20.0
            }
        );
        Ok(())
    }

    #[test]
    fn empty_documents_have_no_pages() -> Result<()> {
        assert!(parse_stext("<document name=\"x.pdf\"></document>")?.is_empty());
        Ok(())
    }

    #[test]
    fn bad_coordinates_are_errors() {
        let xml = r#"<document><page width="1" height="1"><char quad="1 2 x" c="a"/></page></document>"#;
        assert!(parse_stext(xml).is_err());
    }

    #[tokio::test]
    async fn images_have_no_vector_form() -> Result<()> {
        let source = Source {
            path: PathBuf::from("/nonexistent/scan.png"),
            kind: SourceKind::Image(image::ImageFormat::Png),
        };
        assert!(MutoolReader::new(None).open(&source).await?.is_empty());
        Ok(())
    }
}
