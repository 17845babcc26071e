use std::io::Cursor;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use image::codecs::jpeg::JpegEncoder;
use image::ImageEncoder;
use pdfium_render::prelude::*;
use tracing::debug;

use super::error::RenderError;

/// Rasterizes one PDF page to a self-contained JPEG byte buffer. Rendering
/// is deterministic given `(pdf, page_index, dpi, quality)` and has no side
/// effects; it holds no state beyond the opened PDF handle.
#[async_trait]
pub trait Renderer: Send + Sync {
    async fn render(
        &self,
        pdf_path: &Path,
        page_index: usize,
        total_pages: usize,
        dpi: u32,
        jpeg_quality: u8,
    ) -> Result<Vec<u8>, RenderError>;

    /// Returns the page count of the PDF at `pdf_path`, used on upload to
    /// size the job's page map and on nothing else — rendering itself takes
    /// `total_pages` as an argument rather than re-deriving it per call.
    async fn page_count(&self, pdf_path: &Path) -> Result<usize, RenderError>;
}

pub struct PdfiumRenderer;

impl PdfiumRenderer {
    pub fn new() -> Self {
        Self
    }
}

impl Default for PdfiumRenderer {
    fn default() -> Self {
        Self::new()
    }
}

/// Rendering is CPU-bound and the pdfium C bindings are not safe to call
/// from an async context, so every call runs inside `spawn_blocking` on a
/// dedicated thread, never on the coordinating task.
#[async_trait]
impl Renderer for PdfiumRenderer {
    async fn render(
        &self,
        pdf_path: &Path,
        page_index: usize,
        total_pages: usize,
        dpi: u32,
        jpeg_quality: u8,
    ) -> Result<Vec<u8>, RenderError> {
        let path = pdf_path.to_path_buf();
        tokio::task::spawn_blocking(move || {
            render_blocking(&path, page_index, total_pages, dpi, jpeg_quality)
        })
        .await
        .map_err(|join_err| RenderError::DecodeFailed {
            page: page_index,
            detail: format!("render task panicked: {join_err}"),
        })?
    }

    async fn page_count(&self, pdf_path: &Path) -> Result<usize, RenderError> {
        let path = pdf_path.to_path_buf();
        tokio::task::spawn_blocking(move || {
            let pdfium = Pdfium::default();
            let document = pdfium.load_pdf_from_file(&path, None).map_err(|err| {
                RenderError::DecodeFailed {
                    page: 0,
                    detail: format!("load pdf: {err}"),
                }
            })?;
            Ok(document.pages().len() as usize)
        })
        .await
        .map_err(|join_err| RenderError::DecodeFailed {
            page: 0,
            detail: format!("page count task panicked: {join_err}"),
        })?
    }
}

fn render_blocking(
    pdf_path: &PathBuf,
    page_index: usize,
    total_pages: usize,
    dpi: u32,
    jpeg_quality: u8,
) -> Result<Vec<u8>, RenderError> {
    if page_index >= total_pages {
        return Err(RenderError::InvalidPageIndex {
            page: page_index,
            total: total_pages,
        });
    }

    let pdfium = Pdfium::default();
    let document = pdfium
        .load_pdf_from_file(pdf_path, None)
        .map_err(|err| RenderError::DecodeFailed {
            page: page_index,
            detail: format!("load pdf: {err}"),
        })?;

    let pages = document.pages();
    let page = pages
        .get(page_index as u16)
        .map_err(|err| RenderError::DecodeFailed {
            page: page_index,
            detail: format!("load page: {err}"),
        })?;

    // pdfium's render config takes a target pixel size, not a DPI; a US
    // Letter page (8.5in) at the configured DPI gives the longest edge.
    let target_px = ((8.5 * dpi as f64) as i32).max(1);
    let render_config = PdfRenderConfig::new()
        .set_target_width(target_px)
        .set_maximum_height(target_px)
        .rotate_if_landscape(PdfPageRenderRotation::None, true);

    let bitmap = page
        .render_with_config(&render_config)
        .map_err(|err| RenderError::DecodeFailed {
            page: page_index,
            detail: format!("render page: {err}"),
        })?;

    let image = bitmap.as_image().to_rgb8();
    debug!(page = page_index, width = image.width(), height = image.height(), "rendered page");

    let mut buffer = Cursor::new(Vec::new());
    JpegEncoder::new_with_quality(&mut buffer, jpeg_quality)
        .write_image(
            image.as_raw(),
            image.width(),
            image.height(),
            image::ExtendedColorType::Rgb8,
        )
        .map_err(|err| RenderError::DecodeFailed {
            page: page_index,
            detail: format!("jpeg encode: {err}"),
        })?;

    Ok(buffer.into_inner())
}

/// Tags fake "rendered" bytes with their page index so a `FakeOcrClient`
/// downstream of a `FakeRenderer` can tell which page it was asked to
/// recognize without any real image codec involved.
pub fn fake_page_marker(page_index: usize) -> Vec<u8> {
    format!("PAGE={page_index};").into_bytes()
}

pub fn parse_fake_page_marker(bytes: &[u8]) -> Option<usize> {
    let text = std::str::from_utf8(bytes).ok()?;
    let rest = text.strip_prefix("PAGE=")?;
    let end = rest.find(';')?;
    rest[..end].parse().ok()
}

/// A `Renderer` that never touches pdfium, used by the end-to-end test
/// suite (spec §9: "explicit capability interfaces ... makes the mock-based
/// scenarios in §8 trivial"). Not `cfg(test)`-gated so `tests/` (a separate
/// crate) can use it too.
pub struct FakeRenderer {
    pub jpeg_bytes: Vec<u8>,
    pub total_pages: usize,
}

#[async_trait]
impl Renderer for FakeRenderer {
    async fn render(
        &self,
        _pdf_path: &Path,
        page_index: usize,
        total_pages: usize,
        _dpi: u32,
        _jpeg_quality: u8,
    ) -> Result<Vec<u8>, RenderError> {
        if page_index >= total_pages {
            return Err(RenderError::InvalidPageIndex {
                page: page_index,
                total: total_pages,
            });
        }
        let mut bytes = fake_page_marker(page_index);
        bytes.extend_from_slice(&self.jpeg_bytes);
        Ok(bytes)
    }

    async fn page_count(&self, _pdf_path: &Path) -> Result<usize, RenderError> {
        Ok(self.total_pages)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn fake_renderer_rejects_out_of_range_index() {
        let renderer = FakeRenderer {
            jpeg_bytes: vec![0xFF, 0xD8],
            total_pages: 3,
        };
        let result = renderer
            .render(Path::new("unused.pdf"), 5, 3, 300, 85)
            .await;
        assert!(matches!(result, Err(RenderError::InvalidPageIndex { .. })));
    }
}
