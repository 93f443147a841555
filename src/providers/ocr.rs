//! Native text recognition: reads the text layer of PDFs, OOXML
//! documents, and plain text. Scanned images without a text layer are
//! rejected as malformed input rather than guessed at.
//!
//! Pages are counted per format: form feeds in plain text and PDF text
//! layers, slides in PPTX, worksheets in XLSX. DOCX has no stored page
//! layout and reports explicit page breaks plus one.

use std::io::Read;

use async_trait::async_trait;
use quick_xml::events::Event;

use docflow_core::primitives::{OcrProvider, RecognizedText};
use docflow_core::PipelineError;

pub const MIME_PDF: &str = "application/pdf";
pub const MIME_DOCX: &str =
    "application/vnd.openxmlformats-officedocument.wordprocessingml.document";
pub const MIME_PPTX: &str =
    "application/vnd.openxmlformats-officedocument.presentationml.presentation";
pub const MIME_XLSX: &str = "application/vnd.openxmlformats-officedocument.spreadsheetml.sheet";

const XLSX_MAX_SHEETS: usize = 100;
const XLSX_MAX_CELLS_PER_SHEET: usize = 100_000;
/// Zip-bomb guard for a single decompressed entry.
const MAX_XML_ENTRY_BYTES: u64 = 50 * 1024 * 1024;
const PAGE_BREAK: char = '\u{c}';

#[derive(Debug, thiserror::Error)]
pub enum ExtractError {
    #[error("unsupported content-type: {0}")]
    UnsupportedContentType(String),
    #[error("{0} has no text layer; native recognition cannot read images")]
    NoTextLayer(String),
    #[error("text is not valid UTF-8: {0}")]
    Encoding(#[from] std::str::Utf8Error),
    #[error("PDF extraction failed: {0}")]
    Pdf(String),
    #[error("OOXML extraction failed: {0}")]
    Ooxml(String),
}

impl From<ExtractError> for PipelineError {
    fn from(e: ExtractError) -> Self {
        PipelineError::MalformedInput(e.to_string())
    }
}

/// Extracted text plus the number of pages it spans.
#[derive(Debug, Clone, PartialEq)]
pub struct Extracted {
    pub text: String,
    pub page_count: u32,
}

pub fn extract_text(bytes: &[u8], mime_type: &str) -> Result<Extracted, ExtractError> {
    let essence = mime_type
        .split(';')
        .next()
        .unwrap_or_default()
        .trim()
        .to_ascii_lowercase();
    match essence.as_str() {
        MIME_PDF => extract_pdf(bytes),
        MIME_DOCX => extract_docx(bytes),
        MIME_PPTX => extract_pptx(bytes),
        MIME_XLSX => extract_xlsx(bytes),
        "application/json" | "application/xml" => extract_plain(bytes),
        t if t.starts_with("text/") => extract_plain(bytes),
        t if t.starts_with("image/") => Err(ExtractError::NoTextLayer(t.to_string())),
        _ => Err(ExtractError::UnsupportedContentType(mime_type.to_string())),
    }
}

/// Share of non-whitespace characters that decoded cleanly. Empty text
/// scores zero.
pub fn text_confidence(text: &str) -> f32 {
    let mut total = 0usize;
    let mut clean = 0usize;
    for c in text.chars().filter(|c| !c.is_whitespace()) {
        total += 1;
        if c != char::REPLACEMENT_CHARACTER && !c.is_control() {
            clean += 1;
        }
    }
    if total == 0 {
        0.0
    } else {
        clean as f32 / total as f32
    }
}

fn pages_by_form_feed(text: &str) -> u32 {
    text.matches(PAGE_BREAK).count() as u32 + 1
}

fn extract_plain(bytes: &[u8]) -> Result<Extracted, ExtractError> {
    let text = std::str::from_utf8(bytes)?;
    let text = text.strip_prefix('\u{feff}').unwrap_or(text).to_string();
    Ok(Extracted {
        page_count: pages_by_form_feed(&text),
        text,
    })
}

fn extract_pdf(bytes: &[u8]) -> Result<Extracted, ExtractError> {
    let raw =
        pdf_extract::extract_text_from_mem(bytes).map_err(|e| ExtractError::Pdf(e.to_string()))?;
    let page_count = pages_by_form_feed(raw.trim_end_matches(PAGE_BREAK));
    let text = raw.replace(PAGE_BREAK, "\n\n");
    Ok(Extracted { text, page_count })
}

type Archive<'a> = zip::ZipArchive<std::io::Cursor<&'a [u8]>>;

fn open_archive(bytes: &[u8]) -> Result<Archive<'_>, ExtractError> {
    zip::ZipArchive::new(std::io::Cursor::new(bytes)).map_err(|e| ExtractError::Ooxml(e.to_string()))
}

fn read_entry(archive: &mut Archive<'_>, name: &str) -> Result<Vec<u8>, ExtractError> {
    let entry = archive
        .by_name(name)
        .map_err(|e| ExtractError::Ooxml(format!("{}: {}", name, e)))?;
    let mut out = Vec::new();
    entry
        .take(MAX_XML_ENTRY_BYTES)
        .read_to_end(&mut out)
        .map_err(|e| ExtractError::Ooxml(e.to_string()))?;
    if out.len() as u64 >= MAX_XML_ENTRY_BYTES {
        return Err(ExtractError::Ooxml(format!(
            "ZIP entry {} exceeds size limit ({} bytes)",
            name, MAX_XML_ENTRY_BYTES
        )));
    }
    Ok(out)
}

/// Entries named `{prefix}{n}.xml`, in numeric order.
fn numbered_entries(archive: &Archive<'_>, prefix: &str) -> Vec<String> {
    let mut names: Vec<String> = archive
        .file_names()
        .filter(|n| n.starts_with(prefix) && n.ends_with(".xml"))
        .map(str::to_string)
        .collect();
    names.sort_by_key(|name| {
        name.trim_start_matches(prefix)
            .trim_end_matches(".xml")
            .parse::<u32>()
            .unwrap_or(u32::MAX)
    });
    names
}

/// Text of every `<t>` element (any namespace), with a newline after
/// each paragraph element `<p>`. Counts `<br type="page">` breaks.
fn collect_runs(xml: &[u8]) -> Result<(String, u32), ExtractError> {
    let mut out = String::new();
    let mut page_breaks = 0;
    let mut in_t = false;
    let mut reader = quick_xml::Reader::from_reader(xml);
    let mut buf = Vec::new();
    loop {
        match reader.read_event_into(&mut buf) {
            Ok(Event::Start(e)) if e.local_name().as_ref() == b"t" => in_t = true,
            Ok(Event::Empty(e)) if e.local_name().as_ref() == b"br" => {
                let is_page = e.attributes().flatten().any(|a| {
                    a.key.local_name().as_ref() == b"type" && a.value.as_ref() == b"page"
                });
                if is_page {
                    page_breaks += 1;
                }
            }
            Ok(Event::Text(te)) if in_t => {
                out.push_str(&te.unescape().unwrap_or_default());
            }
            Ok(Event::End(e)) => match e.local_name().as_ref() {
                b"t" => in_t = false,
                b"p" if !out.is_empty() && !out.ends_with('\n') => out.push('\n'),
                _ => {}
            },
            Ok(Event::Eof) => break,
            Err(e) => return Err(ExtractError::Ooxml(e.to_string())),
            _ => {}
        }
        buf.clear();
    }
    Ok((out.trim_end().to_string(), page_breaks))
}

fn extract_docx(bytes: &[u8]) -> Result<Extracted, ExtractError> {
    let mut archive = open_archive(bytes)?;
    let xml = read_entry(&mut archive, "word/document.xml")?;
    let (text, page_breaks) = collect_runs(&xml)?;
    Ok(Extracted {
        text,
        page_count: page_breaks + 1,
    })
}

fn extract_pptx(bytes: &[u8]) -> Result<Extracted, ExtractError> {
    let mut archive = open_archive(bytes)?;
    let slides = numbered_entries(&archive, "ppt/slides/slide");
    let mut parts = Vec::with_capacity(slides.len());
    for name in &slides {
        let xml = read_entry(&mut archive, name)?;
        let (text, _) = collect_runs(&xml)?;
        if !text.is_empty() {
            parts.push(text);
        }
    }
    Ok(Extracted {
        text: parts.join("\n\n"),
        page_count: slides.len().max(1) as u32,
    })
}

fn extract_xlsx(bytes: &[u8]) -> Result<Extracted, ExtractError> {
    let mut archive = open_archive(bytes)?;
    let shared = if archive.index_for_name("xl/sharedStrings.xml").is_some() {
        read_shared_strings(&read_entry(&mut archive, "xl/sharedStrings.xml")?)?
    } else {
        Vec::new()
    };
    let sheets = numbered_entries(&archive, "xl/worksheets/sheet");
    let mut parts = Vec::new();
    for name in sheets.iter().take(XLSX_MAX_SHEETS) {
        let xml = read_entry(&mut archive, name)?;
        let cells = sheet_cells(&xml, &shared)?;
        if !cells.is_empty() {
            parts.push(cells);
        }
    }
    Ok(Extracted {
        text: parts.join("\n\n"),
        page_count: sheets.len().clamp(1, XLSX_MAX_SHEETS) as u32,
    })
}

fn read_shared_strings(xml: &[u8]) -> Result<Vec<String>, ExtractError> {
    let mut strings = Vec::new();
    let mut current: Option<String> = None;
    let mut in_t = false;
    let mut reader = quick_xml::Reader::from_reader(xml);
    let mut buf = Vec::new();
    loop {
        match reader.read_event_into(&mut buf) {
            Ok(Event::Start(e)) => match e.local_name().as_ref() {
                b"si" => current = Some(String::new()),
                b"t" => in_t = true,
                _ => {}
            },
            Ok(Event::Text(te)) if in_t => {
                if let Some(s) = current.as_mut() {
                    s.push_str(&te.unescape().unwrap_or_default());
                }
            }
            Ok(Event::End(e)) => match e.local_name().as_ref() {
                b"t" => in_t = false,
                b"si" => strings.extend(current.take()),
                _ => {}
            },
            Ok(Event::Eof) => break,
            Err(e) => return Err(ExtractError::Ooxml(e.to_string())),
            _ => {}
        }
        buf.clear();
    }
    Ok(strings)
}

/// Cell values of one worksheet, one row per line, cells tab-separated.
/// Shared-string cells resolve through `shared`; inline numbers are kept.
fn sheet_cells(xml: &[u8], shared: &[String]) -> Result<String, ExtractError> {
    let mut rows: Vec<String> = Vec::new();
    let mut row: Vec<String> = Vec::new();
    let mut in_value = false;
    let mut shared_cell = false;
    let mut cells = 0usize;
    let mut reader = quick_xml::Reader::from_reader(xml);
    let mut buf = Vec::new();
    while cells < XLSX_MAX_CELLS_PER_SHEET {
        match reader.read_event_into(&mut buf) {
            Ok(Event::Start(e)) => match e.local_name().as_ref() {
                b"c" => {
                    shared_cell = e.attributes().flatten().any(|a| {
                        a.key.as_ref() == b"t" && a.value.as_ref() == b"s"
                    });
                }
                b"v" | b"t" => in_value = true,
                _ => {}
            },
            Ok(Event::Text(te)) if in_value => {
                let raw = te.unescape().unwrap_or_default();
                let value = raw.trim();
                if !value.is_empty() {
                    let resolved = if shared_cell {
                        value
                            .parse::<usize>()
                            .ok()
                            .and_then(|i| shared.get(i).cloned())
                    } else {
                        Some(value.to_string())
                    };
                    if let Some(v) = resolved {
                        row.push(v);
                        cells += 1;
                    }
                }
            }
            Ok(Event::End(e)) => match e.local_name().as_ref() {
                b"v" | b"t" => in_value = false,
                b"c" => shared_cell = false,
                b"row" if !row.is_empty() => rows.push(std::mem::take(&mut row).join("\t")),
                _ => {}
            },
            Ok(Event::Eof) => break,
            Err(e) => return Err(ExtractError::Ooxml(e.to_string())),
            _ => {}
        }
        buf.clear();
    }
    if !row.is_empty() {
        rows.push(row.join("\t"));
    }
    Ok(rows.join("\n"))
}

/// The `native` recognition method.
#[derive(Debug, Default)]
pub struct NativeTextOcr;

impl NativeTextOcr {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl OcrProvider for NativeTextOcr {
    fn method(&self) -> &str {
        "native"
    }

    async fn recognize(&self, bytes: &[u8], mime_type: &str) -> docflow_core::Result<RecognizedText> {
        let bytes = bytes.to_vec();
        let mime = mime_type.to_string();
        let extracted = tokio::task::spawn_blocking(move || extract_text(&bytes, &mime))
            .await
            .map_err(|e| PipelineError::TransientIo(format!("extraction task panicked: {}", e)))??;
        Ok(RecognizedText {
            confidence: text_confidence(&extracted.text),
            text: extracted.text,
            page_count: extracted.page_count,
            method: self.method().to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn zip_of(entries: &[(&str, &str)]) -> Vec<u8> {
        let mut writer = zip::ZipWriter::new(std::io::Cursor::new(Vec::new()));
        for (name, body) in entries {
            writer
                .start_file(*name, zip::write::SimpleFileOptions::default())
                .unwrap();
            writer.write_all(body.as_bytes()).unwrap();
        }
        writer.finish().unwrap().into_inner()
    }

    #[test]
    fn plain_text_pages_split_on_form_feed() {
        let out = extract_text(b"page one\x0cpage two", "text/plain; charset=utf-8").unwrap();
        assert_eq!(out.page_count, 2);
        assert!(out.text.starts_with("page one"));
    }

    #[test]
    fn unsupported_and_image_types_are_malformed_input() {
        let err: PipelineError = extract_text(b"foo", "application/octet-stream")
            .unwrap_err()
            .into();
        assert!(matches!(err, PipelineError::MalformedInput(_)));
        assert!(matches!(
            extract_text(b"\x89PNG", "image/png").unwrap_err(),
            ExtractError::NoTextLayer(_)
        ));
        assert!(matches!(
            extract_text(b"not a pdf", MIME_PDF).unwrap_err(),
            ExtractError::Pdf(_)
        ));
        assert!(matches!(
            extract_text(b"not a zip", MIME_DOCX).unwrap_err(),
            ExtractError::Ooxml(_)
        ));
    }

    #[test]
    fn docx_keeps_paragraphs_and_counts_page_breaks() {
        let xml = r#"<w:document xmlns:w="w"><w:body>
            <w:p><w:r><w:t>Invoice </w:t></w:r><w:r><w:t>INV-001</w:t></w:r></w:p>
            <w:p><w:r><w:br w:type="page"/><w:t>Total 1,250.00</w:t></w:r></w:p>
        </w:body></w:document>"#;
        let out = extract_text(&zip_of(&[("word/document.xml", xml)]), MIME_DOCX).unwrap();
        assert_eq!(out.text, "Invoice INV-001\nTotal 1,250.00");
        assert_eq!(out.page_count, 2);
    }

    #[test]
    fn xlsx_resolves_shared_strings_per_row() {
        let shared = r#"<sst><si><t>Vendor</t></si><si><t>Acme</t></si></sst>"#;
        let sheet = r#"<worksheet><sheetData>
            <row><c t="s"><v>0</v></c><c><v>42</v></c></row>
            <row><c t="s"><v>1</v></c></row>
        </sheetData></worksheet>"#;
        let bytes = zip_of(&[
            ("xl/sharedStrings.xml", shared),
            ("xl/worksheets/sheet1.xml", sheet),
        ]);
        let out = extract_text(&bytes, MIME_XLSX).unwrap();
        assert_eq!(out.text, "Vendor\t42\nAcme");
        assert_eq!(out.page_count, 1);
    }

    #[test]
    fn confidence_drops_with_replacement_characters() {
        assert_eq!(text_confidence(""), 0.0);
        assert_eq!(text_confidence("clean text"), 1.0);
        assert!(text_confidence("ab\u{fffd}\u{fffd}") < 0.6);
    }

    #[tokio::test]
    async fn recognize_reports_native_method() {
        let ocr = NativeTextOcr::new();
        let out = ocr.recognize(b"hello world", "text/markdown").await.unwrap();
        assert_eq!(out.method, "native");
        assert_eq!(out.page_count, 1);
        assert_eq!(out.confidence, 1.0);
    }
}
