//! Raw text extraction for binary document formats (PDF, OOXML).
//!
//! Byte-oriented: callers hand in file bytes, this module returns
//! structured plain text. Higher-level concerns (metadata, table geometry,
//! chunking) live in `loader`, `tables`, and `splitter`.

use std::io::Read;

use thiserror::Error;

/// Maximum decompressed bytes to read from a single ZIP entry (zip-bomb
/// protection).
const MAX_XML_ENTRY_BYTES: u64 = 50 * 1024 * 1024;

#[derive(Debug, Error)]
pub enum ExtractError {
    #[error("PDF extraction failed: {0}")]
    Pdf(String),
    #[error("OOXML extraction failed: {0}")]
    Ooxml(String),
}

/// Per-page PDF text, in page order (index 0 is page 1).
pub fn pdf_pages(bytes: &[u8]) -> Result<Vec<String>, ExtractError> {
    pdf_extract::extract_text_from_mem_by_pages(bytes).map_err(|e| ExtractError::Pdf(e.to_string()))
}

/// Ordered DOCX body content: contiguous paragraph runs and table cell grids.
///
/// Paragraph text accumulates into a buffer that is flushed whenever a table
/// interrupts the flow, so each entry of `text_blocks` is one contiguous run
/// of prose. Paragraphs styled as table-of-contents entries are skipped.
#[derive(Debug, Default)]
pub struct DocxContent {
    pub text_blocks: Vec<String>,
    pub tables: Vec<Vec<Vec<String>>>,
}

pub fn docx_content(bytes: &[u8]) -> Result<DocxContent, ExtractError> {
    let mut archive = zip::ZipArchive::new(std::io::Cursor::new(bytes))
        .map_err(|e| ExtractError::Ooxml(e.to_string()))?;
    let xml = read_zip_entry_bounded(&mut archive, "word/document.xml", MAX_XML_ENTRY_BYTES)?;
    walk_docx_body(&xml)
}

fn flush_paragraphs(buffer: &mut Vec<String>, text_blocks: &mut Vec<String>) {
    if buffer.is_empty() {
        return;
    }
    let text = buffer.join("\n");
    buffer.clear();
    if !text.trim().is_empty() {
        text_blocks.push(text);
    }
}

fn walk_docx_body(xml: &[u8]) -> Result<DocxContent, ExtractError> {
    let mut reader = quick_xml::Reader::from_reader(xml);
    reader.config_mut().trim_text(false);
    let mut buf = Vec::new();

    let mut content = DocxContent::default();
    let mut paragraph_buffer: Vec<String> = Vec::new();

    let mut tbl_depth = 0usize;
    let mut table_rows: Vec<Vec<String>> = Vec::new();
    let mut row: Vec<String> = Vec::new();
    let mut cell = String::new();
    let mut paragraph = String::new();
    let mut paragraph_is_toc = false;
    let mut in_text = false;

    loop {
        match reader.read_event_into(&mut buf) {
            Ok(quick_xml::events::Event::Start(e)) => match e.local_name().as_ref() {
                b"tbl" => {
                    tbl_depth += 1;
                    if tbl_depth == 1 {
                        flush_paragraphs(&mut paragraph_buffer, &mut content.text_blocks);
                        table_rows = Vec::new();
                    }
                }
                b"tr" if tbl_depth == 1 => row = Vec::new(),
                b"tc" if tbl_depth == 1 => cell.clear(),
                b"p" if tbl_depth == 0 => {
                    paragraph.clear();
                    paragraph_is_toc = false;
                }
                b"pStyle" if tbl_depth == 0 => {
                    paragraph_is_toc |= style_is_toc(&e);
                }
                b"t" => in_text = true,
                _ => {}
            },
            Ok(quick_xml::events::Event::Empty(e)) => {
                if e.local_name().as_ref() == b"pStyle" && tbl_depth == 0 {
                    paragraph_is_toc |= style_is_toc(&e);
                }
            }
            Ok(quick_xml::events::Event::Text(t)) if in_text => {
                let text = t.unescape().unwrap_or_default();
                if tbl_depth > 0 {
                    cell.push_str(&text);
                } else {
                    paragraph.push_str(&text);
                }
            }
            Ok(quick_xml::events::Event::End(e)) => match e.local_name().as_ref() {
                b"t" => in_text = false,
                b"p" if tbl_depth == 0 => {
                    let line = paragraph.trim();
                    if !paragraph_is_toc && !line.is_empty() {
                        paragraph_buffer.push(line.to_string());
                    }
                }
                b"tc" if tbl_depth == 1 => row.push(std::mem::take(&mut cell)),
                b"tr" if tbl_depth == 1 => table_rows.push(std::mem::take(&mut row)),
                b"tbl" => {
                    tbl_depth = tbl_depth.saturating_sub(1);
                    if tbl_depth == 0 && !table_rows.is_empty() {
                        content.tables.push(std::mem::take(&mut table_rows));
                    }
                }
                _ => {}
            },
            Ok(quick_xml::events::Event::Eof) => break,
            Err(e) => return Err(ExtractError::Ooxml(e.to_string())),
            _ => {}
        }
        buf.clear();
    }

    flush_paragraphs(&mut paragraph_buffer, &mut content.text_blocks);
    Ok(content)
}

fn style_is_toc(e: &quick_xml::events::BytesStart<'_>) -> bool {
    e.attributes().flatten().any(|a| {
        a.key.local_name().as_ref() == b"val"
            && String::from_utf8_lossy(&a.value).to_uppercase().contains("TOC")
    })
}

/// Slide texts in slide order.
pub fn pptx_slides(bytes: &[u8]) -> Result<Vec<String>, ExtractError> {
    let mut archive = zip::ZipArchive::new(std::io::Cursor::new(bytes))
        .map_err(|e| ExtractError::Ooxml(e.to_string()))?;
    let mut slide_names: Vec<String> = archive
        .file_names()
        .filter(|n| n.starts_with("ppt/slides/slide") && n.ends_with(".xml"))
        .map(|s| s.to_string())
        .collect();
    slide_names.sort_by_key(|name| {
        name.trim_start_matches("ppt/slides/slide")
            .trim_end_matches(".xml")
            .parse::<u32>()
            .unwrap_or(u32::MAX)
    });

    let mut slides = Vec::with_capacity(slide_names.len());
    for name in slide_names {
        let xml = read_zip_entry_bounded(&mut archive, &name, MAX_XML_ENTRY_BYTES)?;
        slides.push(slide_text(&xml)?);
    }
    Ok(slides)
}

fn slide_text(xml: &[u8]) -> Result<String, ExtractError> {
    let mut out = String::new();
    let mut reader = quick_xml::Reader::from_reader(xml);
    reader.config_mut().trim_text(true);
    let mut buf = Vec::new();
    let mut in_text = false;
    loop {
        match reader.read_event_into(&mut buf) {
            Ok(quick_xml::events::Event::Start(e)) => {
                if e.local_name().as_ref() == b"t" {
                    in_text = true;
                }
            }
            Ok(quick_xml::events::Event::Text(t)) if in_text => {
                if !out.is_empty() {
                    out.push(' ');
                }
                out.push_str(t.unescape().unwrap_or_default().as_ref());
            }
            Ok(quick_xml::events::Event::End(e)) => {
                if e.local_name().as_ref() == b"t" {
                    in_text = false;
                }
            }
            Ok(quick_xml::events::Event::Eof) => break,
            Err(e) => return Err(ExtractError::Ooxml(e.to_string())),
            _ => {}
        }
        buf.clear();
    }
    Ok(out)
}

fn read_zip_entry_bounded(
    archive: &mut zip::ZipArchive<std::io::Cursor<&[u8]>>,
    name: &str,
    max_bytes: u64,
) -> Result<Vec<u8>, ExtractError> {
    let entry = archive
        .by_name(name)
        .map_err(|e| ExtractError::Ooxml(e.to_string()))?;
    let mut out = Vec::new();
    entry
        .take(max_bytes)
        .read_to_end(&mut out)
        .map_err(|e| ExtractError::Ooxml(e.to_string()))?;
    if out.len() as u64 >= max_bytes {
        return Err(ExtractError::Ooxml(format!(
            "ZIP entry {} exceeds size limit ({} bytes)",
            name, max_bytes
        )));
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    const DOCX_BODY: &str = r#"<?xml version="1.0"?>
<w:document xmlns:w="http://schemas.openxmlformats.org/wordprocessingml/2006/main">
  <w:body>
    <w:p><w:pPr><w:pStyle w:val="TOC1"/></w:pPr><w:r><w:t>Contents entry</w:t></w:r></w:p>
    <w:p><w:r><w:t>Intro line one.</w:t></w:r></w:p>
    <w:p><w:r><w:t>Intro line two.</w:t></w:r></w:p>
    <w:tbl>
      <w:tr><w:tc><w:p><w:r><w:t>Name</w:t></w:r></w:p></w:tc><w:tc><w:p><w:r><w:t>Role</w:t></w:r></w:p></w:tc></w:tr>
      <w:tr><w:tc><w:p><w:r><w:t>Ada</w:t></w:r></w:p></w:tc><w:tc><w:p><w:r><w:t>Engineer</w:t></w:r></w:p></w:tc></w:tr>
    </w:tbl>
    <w:p><w:r><w:t>Closing line.</w:t></w:r></w:p>
  </w:body>
</w:document>"#;

    #[test]
    fn docx_walk_splits_text_on_tables_and_skips_toc() {
        let content = walk_docx_body(DOCX_BODY.as_bytes()).unwrap();

        assert_eq!(content.text_blocks.len(), 2);
        assert_eq!(content.text_blocks[0], "Intro line one.\nIntro line two.");
        assert_eq!(content.text_blocks[1], "Closing line.");
        assert!(!content.text_blocks.iter().any(|b| b.contains("Contents")));

        assert_eq!(content.tables.len(), 1);
        assert_eq!(content.tables[0].len(), 2);
        assert_eq!(content.tables[0][0], vec!["Name", "Role"]);
        assert_eq!(content.tables[0][1], vec!["Ada", "Engineer"]);
    }

    #[test]
    fn invalid_zip_is_an_ooxml_error() {
        assert!(matches!(
            docx_content(b"not a zip"),
            Err(ExtractError::Ooxml(_))
        ));
        assert!(matches!(
            pptx_slides(b"not a zip"),
            Err(ExtractError::Ooxml(_))
        ));
    }

    #[test]
    fn invalid_pdf_is_a_pdf_error() {
        assert!(matches!(pdf_pages(b"not a pdf"), Err(ExtractError::Pdf(_))));
    }

    #[test]
    fn slide_text_joins_runs_with_spaces() {
        let xml = r#"<p:sld xmlns:a="http://schemas.openxmlformats.org/drawingml/2006/main">
            <a:t>Title</a:t><a:t>Body</a:t></p:sld>"#;
        let text = slide_text(xml.as_bytes()).unwrap();
        assert_eq!(text, "Title Body");
    }
}
