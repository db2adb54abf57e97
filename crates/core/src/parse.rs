use std::io::{Cursor, Read, Write};
use std::path::Path;

use quick_xml::events::Event;
use quick_xml::Reader;
use tempfile::NamedTempFile;
use tracing::debug;
use ultradoc_index::Page;

use crate::error::{CoreError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InputKind {
    Text,
    Pdf,
    Docx,
}

impl InputKind {
    pub fn from_filename(name: &str) -> Option<Self> {
        let ext = Path::new(name)
            .extension()
            .and_then(|ext| ext.to_str())?
            .to_lowercase();
        match ext.as_str() {
            "txt" | "md" | "text" => Some(Self::Text),
            "pdf" => Some(Self::Pdf),
            "docx" => Some(Self::Docx),
            _ => None,
        }
    }
}

/// Turns uploaded bytes into 1-based, trimmed, non-empty pages.
pub fn parse_upload(filename: &str, bytes: &[u8]) -> Result<Vec<Page>> {
    let kind = InputKind::from_filename(filename)
        .ok_or_else(|| CoreError::UnsupportedInput(filename.to_string()))?;
    let raw_pages = match kind {
        InputKind::Text => text_to_pages(&String::from_utf8_lossy(bytes)),
        InputKind::Pdf => pdf_to_pages(filename, bytes)?,
        InputKind::Docx => vec![docx_to_text(filename, bytes)?],
    };
    let pages: Vec<Page> = raw_pages
        .into_iter()
        .enumerate()
        .filter_map(|(idx, text)| {
            let trimmed = text.trim();
            if trimmed.is_empty() {
                None
            } else {
                Some(Page::new(idx as u32 + 1, trimmed))
            }
        })
        .collect();
    debug!(filename, pages = pages.len(), "parsed upload");
    Ok(pages)
}

// form feeds separate pages in plain-text exports
fn text_to_pages(text: &str) -> Vec<String> {
    text.split('\u{c}').map(str::to_string).collect()
}

fn pdf_to_pages(filename: &str, bytes: &[u8]) -> Result<Vec<String>> {
    let mut tmp = NamedTempFile::new()?;
    tmp.write_all(bytes)?;
    tmp.flush()?;
    pdf_extract::extract_text_by_pages(tmp.path()).map_err(|err| CoreError::Parse {
        source_name: filename.to_string(),
        message: err.to_string(),
    })
}

const DOCX_BODY: &str = "word/document.xml";

/// Word documents have no reliable page breaks, so the non-blank paragraphs
/// become one page joined by newlines.
fn docx_to_text(filename: &str, bytes: &[u8]) -> Result<String> {
    let parse_err = |message: String| CoreError::Parse {
        source_name: filename.to_string(),
        message,
    };
    let mut archive =
        zip::ZipArchive::new(Cursor::new(bytes)).map_err(|err| parse_err(err.to_string()))?;
    let mut xml = String::new();
    archive
        .by_name(DOCX_BODY)
        .map_err(|err| parse_err(format!("{DOCX_BODY}: {err}")))?
        .read_to_string(&mut xml)?;

    let mut reader = Reader::from_str(&xml);
    let mut paragraphs = Vec::new();
    let mut current = String::new();
    let mut in_text = false;
    loop {
        match reader.read_event().map_err(|err| parse_err(err.to_string()))? {
            Event::Start(tag) if tag.local_name().as_ref() == b"t" => in_text = true,
            Event::End(tag) => match tag.local_name().as_ref() {
                b"t" => in_text = false,
                b"p" => paragraphs.push(std::mem::take(&mut current)),
                _ => {}
            },
            Event::Empty(tag) => match tag.local_name().as_ref() {
                b"tab" => current.push('\t'),
                b"br" | b"cr" => current.push('\n'),
                _ => {}
            },
            Event::Text(text) if in_text => {
                let text = text.unescape().map_err(|err| parse_err(err.to_string()))?;
                current.push_str(&text);
            }
            Event::Eof => break,
            _ => {}
        }
    }
    paragraphs.push(current);
    Ok(paragraphs
        .iter()
        .map(|paragraph| paragraph.trim())
        .filter(|paragraph| !paragraph.is_empty())
        .collect::<Vec<_>>()
        .join("\n"))
}
