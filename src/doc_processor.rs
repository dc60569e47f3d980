use std::io::Write;
use std::path::Path;
use tracing::debug;

#[derive(Debug, thiserror::Error)]
pub enum DocumentError {
    #[error("Processing error: {0}")]
    Processing(String),
    #[error("Temporary storage error: {0}")]
    Io(#[from] std::io::Error),
}

/// Turns a document on disk into the text of each of its pages.
pub trait PageExtractor: Send + Sync {
    fn extract_pages(&self, path: &Path) -> Result<Vec<String>, DocumentError>;
}

/// Page extraction backed by `pdf-extract`.
#[derive(Debug, Default, Clone, Copy)]
pub struct PdfExtractor;

impl PageExtractor for PdfExtractor {
    fn extract_pages(&self, path: &Path) -> Result<Vec<String>, DocumentError> {
        pdf_extract::extract_text_by_pages(path)
            .map_err(|e| DocumentError::Processing(format!("PDF parse error: {}", e)))
    }
}

/// Parsed document content
pub struct ParsedDocument {
    pub pages: Vec<String>,
}

/// Parse uploaded bytes into page texts, staging them in the system
/// temporary directory.
pub fn parse_bytes(
    extractor: &dyn PageExtractor,
    bytes: &[u8],
) -> Result<ParsedDocument, DocumentError> {
    parse_bytes_in(&std::env::temp_dir(), extractor, bytes)
}

/// Parse uploaded bytes into page texts.
///
/// The bytes are staged in a temporary file under `dir` for the extractor;
/// the file is removed when this returns, whether or not parsing succeeded.
/// Failing to create or write that file is a [`DocumentError::Io`].
pub fn parse_bytes_in(
    dir: &Path,
    extractor: &dyn PageExtractor,
    bytes: &[u8],
) -> Result<ParsedDocument, DocumentError> {
    let mut staged = tempfile::Builder::new()
        .prefix("health-bot-")
        .suffix(".pdf")
        .tempfile_in(dir)?;
    staged.write_all(bytes)?;
    staged.flush()?;

    let pages = extractor.extract_pages(staged.path())?;
    debug!(pages = pages.len(), bytes = bytes.len(), "extracted document text");
    Ok(ParsedDocument { pages })
}

/// Reads the staged file as UTF-8 and treats form feeds as page breaks.
#[cfg(test)]
pub(crate) struct PlainTextExtractor;

#[cfg(test)]
impl PageExtractor for PlainTextExtractor {
    fn extract_pages(&self, path: &Path) -> Result<Vec<String>, DocumentError> {
        let bytes = std::fs::read(path)?;
        let text = String::from_utf8(bytes)
            .map_err(|e| DocumentError::Processing(format!("not a text document: {}", e)))?;
        Ok(text.split('\x0c').map(str::to_string).collect())
    }
}
