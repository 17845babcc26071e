use std::io::Cursor;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use epub_builder::{EpubBuilder, EpubContent, ReferenceType, ZipLibrary};

use crate::models::Language;

use super::error::AssembleError;

const PLACEHOLDER_TEXT: &str = "[page could not be recognized]";

/// Assembles per-page text into a valid EPUB3 file. Runs off-thread; shares
/// no state with the pipeline.
#[async_trait]
pub trait Assembler: Send + Sync {
    async fn assemble(&self, input: AssembleInput, output_path: &Path) -> Result<(), AssembleError>;
}

pub struct AssembleInput {
    pub job_id: String,
    pub source_filename: String,
    pub language: Language,
    pub total_pages: usize,
    pub pages_per_chapter: usize,
    /// Page text in ascending page-index order; an empty string marks a
    /// page that never succeeded (failed or never processed).
    pub page_texts: Vec<String>,
}

pub struct EpubAssembler;

impl EpubAssembler {
    pub fn new() -> Self {
        Self
    }
}

impl Default for EpubAssembler {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Assembler for EpubAssembler {
    async fn assemble(
        &self,
        input: AssembleInput,
        output_path: &Path,
    ) -> Result<(), AssembleError> {
        let output_path = output_path.to_path_buf();
        tokio::task::spawn_blocking(move || assemble_blocking(input, &output_path))
            .await
            .map_err(|join_err| AssembleError::Build(format!("assemble task panicked: {join_err}")))?
    }
}

fn assemble_blocking(input: AssembleInput, output_path: &PathBuf) -> Result<(), AssembleError> {
    if let Some(parent) = output_path.parent() {
        std::fs::create_dir_all(parent)?;
    }

    let title = title_from_filename(&input.source_filename);
    let css = stylesheet_for(input.language);

    let mut epub = EpubBuilder::new(ZipLibrary::new().map_err(|err| AssembleError::Build(err.to_string()))?)
        .map_err(|err| AssembleError::Build(err.to_string()))?;
    epub.metadata("title", &title)
        .map_err(|err| AssembleError::Build(err.to_string()))?;
    epub.metadata("author", "Vision OCR")
        .map_err(|err| AssembleError::Build(err.to_string()))?;
    epub.metadata("lang", input.language.code())
        .map_err(|err| AssembleError::Build(err.to_string()))?;
    // epub-builder always mints its own dc:identifier and has no override
    // hook; the job id is carried in the description instead so it's still
    // recoverable from the artifact.
    epub.metadata("description", format!("job:{}", input.job_id))
        .map_err(|err| AssembleError::Build(err.to_string()))?;

    epub.add_resource("style.css", Cursor::new(css.into_bytes()), "text/css")
        .map_err(|err| AssembleError::Build(err.to_string()))?;

    let chapters = group_into_chapters(input.total_pages, input.pages_per_chapter);
    if chapters.is_empty() {
        // Zero-page edge case: still produce a minimal, valid EPUB.
        let xhtml = chapter_xhtml("Chapter 1", &[]);
        epub.add_content(
            EpubContent::new("chapter_1.xhtml", Cursor::new(xhtml))
                .title("Chapter 1")
                .reftype(ReferenceType::Text),
        )
        .map_err(|err| AssembleError::Build(err.to_string()))?;
    }

    for (chapter_index, range) in chapters.iter().enumerate() {
        let chapter_title = format!("Chapter {}", chapter_index + 1);
        let page_slice = &input.page_texts[range.clone()];
        let xhtml = chapter_xhtml(&chapter_title, page_slice);
        epub.add_content(
            EpubContent::new(format!("chapter_{}.xhtml", chapter_index + 1), Cursor::new(xhtml))
                .title(chapter_title)
                .reftype(ReferenceType::Text),
        )
        .map_err(|err| AssembleError::Build(err.to_string()))?;
    }

    let mut output = std::fs::OpenOptions::new()
        .create(true)
        .write(true)
        .truncate(true)
        .open(output_path)?;
    epub.generate(&mut output)
        .map_err(|err| AssembleError::Build(err.to_string()))?;

    Ok(())
}

fn title_from_filename(filename: &str) -> String {
    match filename.rfind('.') {
        Some(idx) if idx > 0 => filename[..idx].to_string(),
        _ => filename.to_string(),
    }
}

/// Chapter *k* covers pages `[k*N, min((k+1)*N, total))`, 0-indexed here and
/// rendered 1-indexed in the chapter title.
fn group_into_chapters(total_pages: usize, pages_per_chapter: usize) -> Vec<std::ops::Range<usize>> {
    if total_pages == 0 {
        return Vec::new();
    }
    let step = pages_per_chapter.max(1);
    let mut chapters = Vec::new();
    let mut start = 0;
    while start < total_pages {
        let end = (start + step).min(total_pages);
        chapters.push(start..end);
        start = end;
    }
    chapters
}

fn chapter_xhtml(title: &str, page_texts: &[String]) -> Vec<u8> {
    let mut body = String::new();
    for (idx, page_text) in page_texts.iter().enumerate() {
        if idx > 0 {
            body.push_str("<hr class=\"page-separator\"/>\n");
        }
        let text = if page_text.is_empty() {
            PLACEHOLDER_TEXT
        } else {
            page_text
        };
        for paragraph in text.split("\n\n") {
            let trimmed = paragraph.trim();
            if trimmed.is_empty() {
                continue;
            }
            body.push_str(&format!(
                "<p dir=\"auto\">{}</p>\n",
                escape_xhtml(trimmed)
            ));
        }
    }

    format!(
        "<?xml version=\"1.0\" encoding=\"UTF-8\"?>\n\
<!DOCTYPE html>\n\
<html xmlns=\"http://www.w3.org/1999/xhtml\">\n\
<head><title>{title}</title><link rel=\"stylesheet\" type=\"text/css\" href=\"style.css\"/></head>\n\
<body>\n<h1>{title}</h1>\n{body}</body>\n</html>\n",
        title = escape_xhtml(title),
        body = body,
    )
    .into_bytes()
}

fn escape_xhtml(text: &str) -> String {
    text.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
}

fn stylesheet_for(language: Language) -> String {
    if language.is_rtl() {
        "html, body { direction: rtl; font-family: 'Scheherazade New', 'Noto Naskh Arabic', serif; }\n\
         p { margin: 0 0 1em 0; }\n"
            .to_string()
    } else {
        "html, body { direction: ltr; font-family: Georgia, 'Times New Roman', serif; }\n\
         p { margin: 0 0 1em 0; }\n"
            .to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn one_page_produces_one_chapter() {
        let chapters = group_into_chapters(1, 20);
        assert_eq!(chapters, vec![0..1]);
    }

    #[test]
    fn chapters_split_on_pages_per_chapter_boundary() {
        let chapters = group_into_chapters(45, 20);
        assert_eq!(chapters, vec![0..20, 20..40, 40..45]);
    }

    #[test]
    fn zero_pages_yields_no_chapters() {
        let chapters = group_into_chapters(0, 20);
        assert!(chapters.is_empty());
    }

    #[test]
    fn title_strips_extension() {
        assert_eq!(title_from_filename("my-book.pdf"), "my-book");
        assert_eq!(title_from_filename("no_extension"), "no_extension");
    }

    #[test]
    fn rtl_languages_get_rtl_stylesheet() {
        assert!(stylesheet_for(Language::Fa).contains("direction: rtl"));
        assert!(stylesheet_for(Language::Ar).contains("direction: rtl"));
        assert!(stylesheet_for(Language::En).contains("direction: ltr"));
    }

    #[test]
    fn empty_page_text_renders_placeholder() {
        let xhtml = String::from_utf8(chapter_xhtml("Chapter 1", &[String::new()])).unwrap();
        assert!(xhtml.contains(PLACEHOLDER_TEXT));
    }

    #[test]
    fn paragraphs_split_on_blank_lines() {
        let xhtml = String::from_utf8(chapter_xhtml(
            "Chapter 1",
            &["first para.\n\nsecond para.".to_string()],
        ))
        .unwrap();
        assert_eq!(xhtml.matches("<p dir=\"auto\">").count(), 2);
    }
}
