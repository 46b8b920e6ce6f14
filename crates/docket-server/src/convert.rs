//! Uploaded documents to simple HTML: `<p>` paragraphs and
//! `<table><tr><td>` tables, which is what the client-side extractor reads.

use std::io::{Cursor, Read, Write};
use std::process::Stdio;

use anyhow::{Context, anyhow};
use regex::Regex;
use tempfile::NamedTempFile;
use tokio::process::Command;
use tracing::{debug, info, warn};

pub const DOCX_MIME: &str =
    "application/vnd.openxmlformats-officedocument.wordprocessingml.document";
pub const PDF_MIME: &str = "application/pdf";

const DOCUMENT_XML: &str = "word/document.xml";
/// Ceiling on the unpacked `word/document.xml`; the upload limit only
/// bounds the compressed archive.
const MAX_DOCUMENT_XML_BYTES: u64 = 50 * 1024 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DocumentKind {
    Docx,
    Pdf,
}

impl DocumentKind {
    pub fn from_mime(mime: &str) -> Option<Self> {
        let essence = mime.split(';').next().unwrap_or_default().trim();
        match essence {
            DOCX_MIME => Some(Self::Docx),
            PDF_MIME => Some(Self::Pdf),
            _ => None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct DocumentConverter {
    pdf_command: String,
}

impl DocumentConverter {
    pub fn new(pdf_command: impl Into<String>) -> Self {
        Self {
            pdf_command: pdf_command.into(),
        }
    }

    #[tracing::instrument(skip(self, bytes), fields(size = bytes.len()))]
    pub async fn convert(&self, kind: DocumentKind, bytes: Vec<u8>) -> anyhow::Result<String> {
        let html = match kind {
            DocumentKind::Docx => tokio::task::spawn_blocking(move || docx_to_html(&bytes))
                .await
                .context("docx conversion task failed")??,
            DocumentKind::Pdf => self.pdf_to_html(bytes).await?,
        };
        info!(?kind, html_len = html.len(), "document converted");
        Ok(html)
    }

    async fn pdf_to_html(&self, bytes: Vec<u8>) -> anyhow::Result<String> {
        // Held until the extractor exits; dropping it deletes the file.
        let input = tokio::task::spawn_blocking(move || {
            let mut input =
                NamedTempFile::new().context("failed to create temp file for pdf")?;
            input.write_all(&bytes)?;
            input.flush()?;
            anyhow::Ok(input)
        })
        .await
        .context("pdf staging task failed")??;

        debug!(command = %self.pdf_command, "running pdf text extractor");
        let output = Command::new(&self.pdf_command)
            .arg("-layout")
            .arg(input.path())
            .arg("-")
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output()
            .await
            .with_context(|| format!("failed to run pdf extractor {}", self.pdf_command))?;

        if !output.status.success() {
            return Err(anyhow!(
                "pdf extractor {} failed with status {}",
                self.pdf_command,
                output
                    .status
                    .code()
                    .map(|code| code.to_string())
                    .unwrap_or_else(|| "unknown".to_string())
            ));
        }

        let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
        if !stderr.is_empty() {
            warn!(command = %self.pdf_command, stderr = %stderr, "pdf extractor wrote stderr");
        }

        Ok(text_to_html(&String::from_utf8_lossy(&output.stdout)))
    }
}

pub fn docx_to_html(bytes: &[u8]) -> anyhow::Result<String> {
    let xml = read_document_xml(bytes, MAX_DOCUMENT_XML_BYTES)?;
    render_document_xml(&xml)
}

fn read_document_xml(bytes: &[u8], limit: u64) -> anyhow::Result<String> {
    let mut archive =
        zip::ZipArchive::new(Cursor::new(bytes)).context("document is not a valid docx archive")?;
    let entry = archive
        .by_name(DOCUMENT_XML)
        .context("docx archive has no word/document.xml")?;
    if entry.size() > limit {
        return Err(anyhow!(
            "word/document.xml declares {} bytes, over the {limit} byte limit",
            entry.size()
        ));
    }

    // The declared size can lie; cap the read itself as well.
    let mut xml = String::new();
    entry
        .take(limit + 1)
        .read_to_string(&mut xml)
        .context("failed to read word/document.xml")?;
    if xml.len() as u64 > limit {
        return Err(anyhow!("word/document.xml exceeds the {limit} byte limit"));
    }
    Ok(xml)
}

fn compile(pattern: &str) -> anyhow::Result<Regex> {
    Regex::new(pattern).map_err(|e| anyhow!("internal regex compile failure: {e}"))
}

struct WordPatterns {
    block: Regex,
    row: Regex,
    cell: Regex,
    paragraph: Regex,
    text: Regex,
}

impl WordPatterns {
    fn compile() -> anyhow::Result<Self> {
        Ok(Self {
            block: compile(r"(?s)<w:p\b[^>]*/>|<w:tbl\b.*?</w:tbl>|<w:p\b[^>]*>.*?</w:p>")?,
            row: compile(r"(?s)<w:tr\b[^>]*>(.*?)</w:tr>")?,
            cell: compile(r"(?s)<w:tc\b[^>]*>(.*?)</w:tc>")?,
            paragraph: compile(r"(?s)<w:p\b[^>]*>(.*?)</w:p>")?,
            text: compile(r"(?s)<w:t(?:\s[^>]*)?>([^<]*)</w:t>")?,
        })
    }

    fn text_of(&self, fragment: &str) -> String {
        self.text
            .captures_iter(fragment)
            .filter_map(|cap| cap.get(1))
            .map(|m| unescape_xml(m.as_str()))
            .collect()
    }
}

fn render_document_xml(xml: &str) -> anyhow::Result<String> {
    let patterns = WordPatterns::compile()?;
    let mut html = String::new();

    for block in patterns.block.find_iter(xml) {
        let block = block.as_str();
        if block.starts_with("<w:tbl") {
            html.push_str("<table>");
            for row in patterns.row.captures_iter(block) {
                let Some(row) = row.get(1) else { continue };
                html.push_str("<tr>");
                for cell in patterns.cell.captures_iter(row.as_str()) {
                    let Some(cell) = cell.get(1) else { continue };
                    let text = patterns
                        .paragraph
                        .captures_iter(cell.as_str())
                        .filter_map(|p| p.get(1))
                        .map(|p| patterns.text_of(p.as_str()))
                        .filter(|t| !t.trim().is_empty())
                        .collect::<Vec<_>>()
                        .join(" ");
                    html.push_str("<td>");
                    html.push_str(&escape_html(text.trim()));
                    html.push_str("</td>");
                }
                html.push_str("</tr>");
            }
            html.push_str("</table>");
        } else {
            let text = patterns.text_of(block);
            if !text.trim().is_empty() {
                html.push_str("<p>");
                html.push_str(&escape_html(text.trim()));
                html.push_str("</p>");
            }
        }
    }

    Ok(html)
}

/// Layout text: runs of lines split into two or more columns (separated by
/// at least two spaces) become a table, everything else a paragraph.
pub fn text_to_html(text: &str) -> String {
    let mut html = String::new();
    let mut in_table = false;

    for line in text.lines().map(str::trim_end) {
        if line.trim().is_empty() {
            continue;
        }
        let columns: Vec<&str> = line
            .trim()
            .split("  ")
            .map(str::trim)
            .filter(|c| !c.is_empty())
            .collect();

        if columns.len() >= 2 {
            if !in_table {
                html.push_str("<table>");
                in_table = true;
            }
            html.push_str("<tr>");
            for column in columns {
                html.push_str("<td>");
                html.push_str(&escape_html(column));
                html.push_str("</td>");
            }
            html.push_str("</tr>");
        } else {
            if in_table {
                html.push_str("</table>");
                in_table = false;
            }
            html.push_str("<p>");
            html.push_str(&escape_html(line.trim()));
            html.push_str("</p>");
        }
    }
    if in_table {
        html.push_str("</table>");
    }
    html
}

fn unescape_xml(raw: &str) -> String {
    raw.replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&apos;", "'")
        .replace("&amp;", "&")
}

fn escape_html(raw: &str) -> String {
    raw.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::{
        DocumentConverter, DocumentKind, docx_to_html, read_document_xml, render_document_xml,
        text_to_html,
    };

    const BODY: &str = r#"<w:document><w:body>
        <w:p><w:pPr/><w:r><w:t>Protocol 12</w:t></w:r></w:p>
        <w:p/>
        <w:tbl><w:tblPr/>
          <w:tr><w:tc><w:p><w:r><w:t>1</w:t></w:r></w:p></w:tc>
                <w:tc><w:p><w:r><w:t xml:space="preserve">Fix the </w:t></w:r><w:r><w:t>R&amp;D door</w:t></w:r></w:p></w:tc></w:tr>
        </w:tbl>
        </w:body></w:document>"#;

    #[test]
    fn word_xml_renders_paragraphs_and_tables() {
        let html = render_document_xml(BODY).expect("render");
        assert_eq!(
            html,
            "<p>Protocol 12</p><table><tr><td>1</td><td>Fix the R&amp;D door</td></tr></table>"
        );
    }

    #[test]
    fn docx_archive_is_unpacked() {
        let mut buffer = std::io::Cursor::new(Vec::new());
        {
            let mut writer = zip::ZipWriter::new(&mut buffer);
            writer
                .start_file("word/document.xml", zip::write::FileOptions::default())
                .expect("start file");
            writer.write_all(BODY.as_bytes()).expect("write");
            writer.finish().expect("finish");
        }
        let html = docx_to_html(buffer.get_ref()).expect("convert");
        assert!(html.contains("<td>1</td>"));

        assert!(docx_to_html(b"not a zip").is_err());
    }

    fn zipped_document(xml: &[u8]) -> Vec<u8> {
        let mut buffer = std::io::Cursor::new(Vec::new());
        {
            let mut writer = zip::ZipWriter::new(&mut buffer);
            writer
                .start_file(
                    "word/document.xml",
                    zip::write::FileOptions::default()
                        .compression_method(zip::CompressionMethod::Deflated),
                )
                .expect("start file");
            writer.write_all(xml).expect("write");
            writer.finish().expect("finish");
        }
        buffer.into_inner()
    }

    #[test]
    fn oversized_document_xml_is_refused() {
        let padding = vec![b' '; 64 * 1024];
        let archive = zipped_document(&padding);
        assert!(archive.len() < padding.len() / 10, "deflate shrinks padding");

        let err = read_document_xml(&archive, 16 * 1024).expect_err("over the limit");
        assert!(err.to_string().contains("limit"), "{err}");

        let xml = read_document_xml(&archive, padding.len() as u64).expect("at the limit");
        assert_eq!(xml.len(), padding.len());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn pdf_goes_through_the_external_extractor() {
        use std::os::unix::fs::PermissionsExt;

        let temp = tempfile::tempdir().expect("tempdir");
        let script = temp.path().join("fake-pdftotext");
        std::fs::write(&script, "#!/bin/sh\ncat \"$2\"\n").expect("write script");
        std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o755))
            .expect("chmod");

        let converter = DocumentConverter::new(script.display().to_string());
        let html = converter
            .convert(DocumentKind::Pdf, b"Agenda\n1   Budget   Dana\n".to_vec())
            .await
            .expect("convert");
        assert_eq!(
            html,
            "<p>Agenda</p><table><tr><td>1</td><td>Budget</td><td>Dana</td></tr></table>"
        );
    }

    #[test]
    fn layout_text_groups_columns_into_tables() {
        let html = text_to_html("Minutes\n1   Budget   Dana\n2   Venue    Lee\n\nEnd\n");
        assert_eq!(
            html,
            "<p>Minutes</p><table><tr><td>1</td><td>Budget</td><td>Dana</td></tr>\
             <tr><td>2</td><td>Venue</td><td>Lee</td></tr></table><p>End</p>"
        );
    }

    #[test]
    fn mime_types_select_the_converter() {
        assert_eq!(DocumentKind::from_mime("application/pdf"), Some(DocumentKind::Pdf));
        assert_eq!(
            DocumentKind::from_mime(super::DOCX_MIME),
            Some(DocumentKind::Docx)
        );
        assert_eq!(DocumentKind::from_mime("text/plain"), None);
    }
}
