use crate::chunker::TextChunker;
use crate::doc_processor::{self, DocumentError, PageExtractor, PdfExtractor};
use chrono::{DateTime, Local};
use serde::Serialize;
use std::path::PathBuf;
use tracing::{info, warn};

/// A span of document text. Never modified after the document is added.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Chunk {
    pub content: String,
    pub document_id: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DocumentInfo {
    pub id: String,
    pub name: String,
    pub upload_time: DateTime<Local>,
    pub chunk_count: usize,
}

struct DocumentRecord {
    info: DocumentInfo,
    chunks: Vec<Chunk>,
}

/// Uploaded documents and their chunks, kept in upload order.
///
/// Metadata and chunks live in the same record, so every listed document has
/// chunks and vice versa.
pub struct DocumentStore {
    records: Vec<DocumentRecord>,
    chunker: TextChunker,
    extractor: Box<dyn PageExtractor>,
    disambiguate_ids: bool,
    temp_dir: Option<PathBuf>,
}

impl Default for DocumentStore {
    fn default() -> Self {
        Self::new(TextChunker::default(), PdfExtractor)
    }
}

impl DocumentStore {
    pub fn new(chunker: TextChunker, extractor: impl PageExtractor + 'static) -> Self {
        Self {
            records: Vec::new(),
            chunker,
            extractor: Box::new(extractor),
            disambiguate_ids: false,
            temp_dir: None,
        }
    }

    /// Append `_2`, `_3`, ... to identifiers that would otherwise collide.
    /// Off by default: a same-second upload of the same name replaces the
    /// earlier document.
    pub fn with_disambiguated_ids(mut self, enabled: bool) -> Self {
        self.disambiguate_ids = enabled;
        self
    }

    /// Stage uploads under `dir` instead of the system temporary directory.
    pub fn with_temp_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.temp_dir = Some(dir.into());
        self
    }

    pub fn add(&mut self, name: &str, bytes: &[u8]) -> Result<String, DocumentError> {
        self.add_at(name, bytes, Local::now())
    }

    /// Process an upload and store it under `{YYYYMMDD_HHMMSS}_{name}`.
    /// The store is left untouched when processing fails.
    pub fn add_at(
        &mut self,
        name: &str,
        bytes: &[u8],
        upload_time: DateTime<Local>,
    ) -> Result<String, DocumentError> {
        let parsed = match &self.temp_dir {
            Some(dir) => doc_processor::parse_bytes_in(dir, self.extractor.as_ref(), bytes)?,
            None => doc_processor::parse_bytes(self.extractor.as_ref(), bytes)?,
        };
        let id = self.assign_id(name, &upload_time);

        let chunks: Vec<Chunk> = parsed
            .pages
            .iter()
            .flat_map(|page| self.chunker.split(page))
            .map(|content| Chunk {
                content,
                document_id: id.clone(),
            })
            .collect();
        let chunk_count = chunks.len();
        if chunk_count == 0 {
            warn!(document = %id, "document contains no extractable text");
        }

        let record = DocumentRecord {
            info: DocumentInfo {
                id: id.clone(),
                name: name.to_string(),
                upload_time,
                chunk_count,
            },
            chunks,
        };

        match self.position(&id) {
            Some(i) => {
                warn!(document = %id, "identifier collision, replacing earlier upload");
                self.records[i] = record;
            }
            None => self.records.push(record),
        }
        info!(document = %id, chunks = chunk_count, "document added");
        Ok(id)
    }

    /// Returns whether the document existed.
    pub fn remove(&mut self, id: &str) -> bool {
        match self.position(id) {
            Some(i) => {
                self.records.remove(i);
                info!(document = %id, "document removed");
                true
            }
            None => false,
        }
    }

    pub fn list(&self) -> Vec<DocumentInfo> {
        self.records.iter().map(|r| r.info.clone()).collect()
    }

    pub fn clear(&mut self) {
        if !self.records.is_empty() {
            info!(documents = self.records.len(), "clearing all documents");
        }
        self.records.clear();
    }

    pub fn get(&self, id: &str) -> Option<&DocumentInfo> {
        self.position(id).map(|i| &self.records[i].info)
    }

    pub fn document_chunks(&self, id: &str) -> Option<&[Chunk]> {
        self.position(id).map(|i| self.records[i].chunks.as_slice())
    }

    /// Every chunk, document by document, in upload then chunk order.
    pub fn chunks(&self) -> impl Iterator<Item = &Chunk> {
        self.records.iter().flat_map(|r| r.chunks.iter())
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    fn position(&self, id: &str) -> Option<usize> {
        self.records.iter().position(|r| r.info.id == id)
    }

    fn assign_id(&self, name: &str, upload_time: &DateTime<Local>) -> String {
        let base = format!("{}_{}", upload_time.format("%Y%m%d_%H%M%S"), name);
        if !self.disambiguate_ids || self.position(&base).is_none() {
            return base;
        }
        let mut n = 2;
        loop {
            let candidate = format!("{}_{}", base, n);
            if self.position(&candidate).is_none() {
                return candidate;
            }
            n += 1;
        }
    }
}
