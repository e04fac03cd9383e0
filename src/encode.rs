//! Re-encoding edited page images into an output document.

use std::io::Cursor;

use image::{ImageFormat, RgbImage, codecs::jpeg::JpegEncoder};
use lopdf::{Dictionary, Document, Object, Stream, dictionary};

use crate::{
    async_utils::spawn_blocking_propagating_panics,
    prelude::*,
    sources::SourceKind,
};

/// JPEG quality for page images embedded in PDFs.
const JPEG_QUALITY: u8 = 90;

/// PDF points per inch.
const POINTS_PER_INCH: f32 = 72.0;

/// Something that can turn page images back into a document.
#[async_trait]
pub trait DocumentEncoder: Send + Sync + 'static {
    /// Encode `pages` (rasterized at `dpi`) as a document of the same kind as
    /// the source.
    async fn encode(&self, kind: SourceKind, pages: Vec<RgbImage>, dpi: u32) -> Result<Vec<u8>>;
}

/// Encodes PDFs with `lopdf`, and images with `image`.
///
/// Each PDF page is a single full-page JPEG, sized so that it prints at the
/// resolution it was rasterized at.
#[derive(Default)]
pub struct LopdfEncoder {}

impl LopdfEncoder {
    /// Create a new encoder.
    pub fn new() -> Self {
        Self {}
    }
}

#[async_trait]
impl DocumentEncoder for LopdfEncoder {
    #[instrument(level = "debug", skip_all, fields(pages = pages.len(), dpi))]
    async fn encode(&self, kind: SourceKind, pages: Vec<RgbImage>, dpi: u32) -> Result<Vec<u8>> {
        spawn_blocking_propagating_panics(move || match kind {
            SourceKind::Pdf => encode_pdf(&pages, dpi),
            SourceKind::Image(format) => encode_image(pages, format),
        })
        .await
    }
}

/// Build a PDF with one image per page.
fn encode_pdf(pages: &[RgbImage], dpi: u32) -> Result<Vec<u8>> {
    if pages.is_empty() {
        return Err(anyhow!("cannot encode a PDF with no pages"));
    }
    if dpi == 0 {
        return Err(anyhow!("cannot encode a PDF at 0 DPI"));
    }

    let mut doc = Document::with_version("1.5");
    let pages_id = doc.new_object_id();
    let mut kids = vec![];
    for page in pages {
        let (width, height) = page.dimensions();
        let mut jpeg = vec![];
        page.write_with_encoder(JpegEncoder::new_with_quality(&mut jpeg, JPEG_QUALITY))
            .context("cannot encode page as JPEG")?;
        let image_id = doc.add_object(Stream::new(
            dictionary! {
                "Type" => "XObject",
                "Subtype" => "Image",
                "Width" => i64::from(width),
                "Height" => i64::from(height),
                "ColorSpace" => "DeviceRGB",
                "BitsPerComponent" => 8_i64,
                "Filter" => "DCTDecode",
            },
            jpeg,
        ));

        let page_width = width as f32 * POINTS_PER_INCH / dpi as f32;
        let page_height = height as f32 * POINTS_PER_INCH / dpi as f32;
        let content = format!("q {} 0 0 {} 0 0 cm /Im0 Do Q", page_width, page_height);
        let content_id = doc.add_object(Stream::new(Dictionary::new(), content.into_bytes()));

        let page_id = doc.add_object(dictionary! {
            "Type" => "Page",
            "Parent" => pages_id,
            "MediaBox" => vec![
                Object::Integer(0),
                Object::Integer(0),
                Object::Real(page_width),
                Object::Real(page_height),
            ],
            "Contents" => content_id,
            "Resources" => dictionary! {
                "XObject" => dictionary! {
                    "Im0" => image_id,
                },
            },
        });
        kids.push(Object::Reference(page_id));
    }

    let page_count = kids.len() as i64;
    doc.objects.insert(
        pages_id,
        Object::Dictionary(dictionary! {
            "Type" => "Pages",
            "Kids" => kids,
            "Count" => page_count,
        }),
    );
    let catalog_id = doc.add_object(dictionary! {
        "Type" => "Catalog",
        "Pages" => pages_id,
    });
    doc.trailer.set("Root", catalog_id);

    let mut bytes = vec![];
    doc.save_to(&mut bytes).context("cannot write PDF")?;
    Ok(bytes)
}

/// Encode a single page in its original image format.
fn encode_image(mut pages: Vec<RgbImage>, format: ImageFormat) -> Result<Vec<u8>> {
    if pages.len() != 1 {
        return Err(anyhow!(
            "image documents have exactly one page, but we have {}",
            pages.len()
        ));
    }
    let page = pages.remove(0);
    let mut bytes = Cursor::new(vec![]);
    match format {
        ImageFormat::Jpeg => page
            .write_with_encoder(JpegEncoder::new_with_quality(&mut bytes, JPEG_QUALITY))
            .context("cannot encode page as JPEG")?,
        other => page
            .write_to(&mut bytes, other)
            .with_context(|| format!("cannot encode page as {:?}", other))?,
    }
    Ok(bytes.into_inner())
}
