use std::collections::BTreeMap;

use ultradoc_core::{Chunk, ChunkRecord, DocumentRecord, HashEmbedderConfig, Page, RowId, EMBEDDING_DIM};

use crate::error::{RagError, Result};

/// A search hit: the row and its squared L2 distance to the query.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Neighbor {
    pub row_id: RowId,
    pub distance: f32,
}

/// Append-only exact nearest-neighbour index with its chunk and document tables.
///
/// Row `n` of `vectors` and `chunks[n]` always describe the same chunk; rows are
/// never removed or renumbered. Re-ingesting a document bumps its revision so
/// the rows of older revisions drop out of [`VectorStore::search_live`].
#[derive(Debug, Clone)]
pub struct VectorStore {
    dimension: usize,
    embedder: HashEmbedderConfig,
    vectors: Vec<f32>,
    chunks: Vec<ChunkRecord>,
    documents: BTreeMap<String, DocumentRecord>,
    next_sequence: u64,
}

impl VectorStore {
    pub fn new(embedder: HashEmbedderConfig) -> Self {
        Self {
            dimension: EMBEDDING_DIM,
            embedder,
            vectors: Vec::new(),
            chunks: Vec::new(),
            documents: BTreeMap::new(),
            next_sequence: 0,
        }
    }

    /// Reassembles a store from persisted tables, rejecting anything that
    /// breaks the row/chunk/document invariants.
    pub(crate) fn from_parts(
        dimension: usize,
        embedder: HashEmbedderConfig,
        vectors: Vec<f32>,
        chunks: Vec<ChunkRecord>,
        documents: Vec<DocumentRecord>,
        next_sequence: u64,
    ) -> Result<Self> {
        if dimension != EMBEDDING_DIM {
            return Err(corruption(format!(
                "index dimension {dimension} does not match embedder dimension {EMBEDDING_DIM}"
            )));
        }
        if vectors.len() != chunks.len() * dimension {
            return Err(corruption(format!(
                "index holds {} rows but chunk table holds {}",
                vectors.len() / dimension,
                chunks.len()
            )));
        }
        let mut by_id = BTreeMap::new();
        for document in documents {
            if document.sequence >= next_sequence {
                return Err(corruption(format!(
                    "document {} has sequence {} beyond next sequence {next_sequence}",
                    document.document_id, document.sequence
                )));
            }
            let id = document.document_id.clone();
            if by_id.insert(id.clone(), document).is_some() {
                return Err(corruption(format!("document {id} is listed twice")));
            }
        }
        for (expected, record) in chunks.iter().enumerate() {
            if record.row_id != expected as RowId {
                return Err(corruption(format!(
                    "chunk table row {expected} carries row id {}",
                    record.row_id
                )));
            }
            let document = by_id.get(&record.chunk.document_id).ok_or_else(|| {
                corruption(format!(
                    "row {} references unknown document {}",
                    record.row_id, record.chunk.document_id
                ))
            })?;
            if record.revision > document.revision {
                return Err(corruption(format!(
                    "row {} has revision {} newer than document {} revision {}",
                    record.row_id, record.revision, document.document_id, document.revision
                )));
            }
        }
        Ok(Self {
            dimension,
            embedder,
            vectors,
            chunks,
            documents: by_id,
            next_sequence,
        })
    }

    pub fn dimension(&self) -> usize {
        self.dimension
    }

    pub fn embedder_config(&self) -> HashEmbedderConfig {
        self.embedder
    }

    pub fn len(&self) -> usize {
        self.chunks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.chunks.is_empty()
    }

    pub fn vectors(&self) -> &[f32] {
        &self.vectors
    }

    pub fn chunks(&self) -> &[ChunkRecord] {
        &self.chunks
    }

    pub fn next_sequence(&self) -> u64 {
        self.next_sequence
    }

    /// Registers a document or starts a new revision of an existing one.
    ///
    /// A new revision replaces the stored pages and source name but keeps the
    /// sequence of the first ingestion.
    pub fn upsert_document(
        &mut self,
        document_id: &str,
        source: &str,
        pages: Vec<Page>,
    ) -> Result<&DocumentRecord> {
        if document_id.trim().is_empty() {
            return Err(RagError::EmptyDocumentId);
        }
        let next_sequence = &mut self.next_sequence;
        let record = self
            .documents
            .entry(document_id.to_string())
            .and_modify(|existing| {
                existing.revision += 1;
                existing.source = source.to_string();
            })
            .or_insert_with(|| {
                let sequence = *next_sequence;
                *next_sequence += 1;
                DocumentRecord {
                    document_id: document_id.to_string(),
                    source: source.to_string(),
                    revision: 1,
                    sequence,
                    pages: Vec::new(),
                }
            });
        record.pages = pages;
        Ok(record)
    }

    pub fn document(&self, document_id: &str) -> Option<&DocumentRecord> {
        self.documents.get(document_id)
    }

    /// Documents in first-ingestion order.
    pub fn documents(&self) -> Vec<&DocumentRecord> {
        let mut documents: Vec<&DocumentRecord> = self.documents.values().collect();
        documents.sort_by_key(|document| document.sequence);
        documents
    }

    pub fn add(&mut self, vector: Vec<f32>, chunk: Chunk) -> Result<RowId> {
        let mut ids = self.add_batch(vec![(vector, chunk)])?;
        Ok(ids.remove(0))
    }

    /// Appends rows in order. Every entry is validated before the first one is
    /// written, so a failing batch leaves the store untouched.
    pub fn add_batch(&mut self, entries: Vec<(Vec<f32>, Chunk)>) -> Result<Vec<RowId>> {
        for (vector, chunk) in &entries {
            if vector.len() != self.dimension {
                return Err(RagError::DimensionMismatch {
                    expected: self.dimension,
                    actual: vector.len(),
                });
            }
            if !self.documents.contains_key(&chunk.document_id) {
                return Err(RagError::UnknownDocument(chunk.document_id.clone()));
            }
        }
        let mut ids = Vec::with_capacity(entries.len());
        for (vector, chunk) in entries {
            let row_id = self.chunks.len() as RowId;
            let revision = self
                .documents
                .get(&chunk.document_id)
                .map(|document| document.revision)
                .unwrap_or_default();
            self.vectors.extend_from_slice(&vector);
            self.chunks.push(ChunkRecord {
                row_id,
                revision,
                chunk,
            });
            ids.push(row_id);
        }
        Ok(ids)
    }

    pub fn chunk(&self, row_id: RowId) -> Option<&ChunkRecord> {
        self.chunks.get(usize::try_from(row_id).ok()?)
    }

    /// True when the row belongs to the current revision of its document.
    pub fn is_live(&self, record: &ChunkRecord) -> bool {
        self.documents
            .get(&record.chunk.document_id)
            .is_some_and(|document| document.revision == record.revision)
    }

    pub fn live_chunk_count(&self, document_id: &str) -> usize {
        self.chunks
            .iter()
            .filter(|record| record.chunk.document_id == document_id && self.is_live(record))
            .count()
    }

    /// Exact search over every row, nearest first. Ties keep insertion order.
    pub fn search(&self, query: &[f32], k: usize) -> Result<Vec<Neighbor>> {
        self.search_where(query, k, |_| true)
    }

    /// Exact search restricted to rows of current document revisions.
    pub fn search_live(&self, query: &[f32], k: usize) -> Result<Vec<Neighbor>> {
        self.search_where(query, k, |record| self.is_live(record))
    }

    pub fn search_where<F>(&self, query: &[f32], k: usize, keep: F) -> Result<Vec<Neighbor>>
    where
        F: Fn(&ChunkRecord) -> bool,
    {
        if query.len() != self.dimension {
            return Err(RagError::DimensionMismatch {
                expected: self.dimension,
                actual: query.len(),
            });
        }
        if k == 0 {
            return Ok(Vec::new());
        }
        let mut hits: Vec<Neighbor> = self
            .chunks
            .iter()
            .zip(self.vectors.chunks_exact(self.dimension))
            .filter(|(record, _)| keep(record))
            .map(|(record, row)| Neighbor {
                row_id: record.row_id,
                distance: squared_l2(query, row),
            })
            .collect();
        hits.sort_by(|a, b| {
            a.distance
                .total_cmp(&b.distance)
                .then(a.row_id.cmp(&b.row_id))
        });
        hits.truncate(k);
        Ok(hits)
    }
}

pub fn squared_l2(a: &[f32], b: &[f32]) -> f32 {
    a.iter()
        .zip(b.iter())
        .map(|(x, y)| {
            let diff = x - y;
            diff * diff
        })
        .sum()
}

fn corruption(message: String) -> RagError {
    RagError::IndexCorruption(message)
}
