use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};
use ultradoc_core::{
    Chunker, HashEmbedder, Page, StructuredExtractor, StructuredFields,
};

use crate::config::RagConfig;
use crate::error::{RagError, Result};
use crate::fields::FieldCache;
use crate::guardrails::{BlockReason, Evidence, Guardrails};
use crate::persist;
use crate::store::VectorStore;

pub const REFUSAL_ANSWER: &str = "Not found in document.";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AnswerOrigin {
    StructuredField,
    Retrieval,
    Refined,
    Refusal,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Source {
    pub document_id: Option<String>,
    pub page: Option<u32>,
    pub text: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AskResponse {
    pub answer: String,
    pub confidence: f32,
    pub blocked: bool,
    pub block_reason: Option<BlockReason>,
    pub sources: Vec<Source>,
    pub origin: AnswerOrigin,
}

impl AskResponse {
    pub fn refusal(reason: BlockReason) -> Self {
        Self {
            answer: REFUSAL_ANSWER.to_string(),
            confidence: 0.0,
            blocked: true,
            block_reason: Some(reason),
            sources: Vec::new(),
            origin: AnswerOrigin::Refusal,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IngestReport {
    pub document_id: String,
    pub revision: u32,
    pub pages: usize,
    pub chunks: usize,
    pub fields: StructuredFields,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DocumentSummary {
    pub document_id: String,
    pub source: String,
    pub revision: u32,
    pub pages: usize,
    pub live_chunks: usize,
}

#[derive(Debug, Clone)]
struct State {
    store: VectorStore,
    fields: FieldCache,
}

/// Upload, ask and extract flows over one vector store.
///
/// Readers take a snapshot `Arc` of the state, so they see a document either
/// fully indexed or not at all. Writers are serialized by `ingest_lock` and
/// publish a new state only after it has been persisted.
pub struct Orchestrator {
    config: RagConfig,
    chunker: Chunker,
    embedder: HashEmbedder,
    extractor: StructuredExtractor,
    guardrails: Guardrails,
    state: RwLock<Arc<State>>,
    ingest_lock: Mutex<()>,
}

impl Orchestrator {
    /// Builds the engine and loads the persisted store when `store_dir` is set.
    pub fn open(config: RagConfig) -> Result<Self> {
        config.validate()?;
        let chunker = Chunker::new(config.chunk)?;
        let embedder = HashEmbedder::new(config.embedder);
        let extractor = StructuredExtractor::new();
        let guardrails = Guardrails::new(config.guardrails.clone())?;

        let store = match &config.store_dir {
            Some(dir) => persist::load(dir, config.embedder)?,
            None => None,
        }
        .unwrap_or_else(|| VectorStore::new(config.embedder));

        let mut fields = FieldCache::default();
        for document in store.documents() {
            fields.insert(&document.document_id, extractor.extract(&document.full_text()));
        }
        info!(
            documents = fields.len(),
            rows = store.len(),
            "retrieval engine ready"
        );
        Ok(Self {
            config,
            chunker,
            embedder,
            extractor,
            guardrails,
            state: RwLock::new(Arc::new(State { store, fields })),
            ingest_lock: Mutex::new(()),
        })
    }

    pub fn in_memory(mut config: RagConfig) -> Result<Self> {
        config.store_dir = None;
        Self::open(config)
    }

    fn snapshot(&self) -> Arc<State> {
        Arc::clone(&self.state.read())
    }

    /// Chunks, embeds and indexes `pages` under `document_id`, refreshes the
    /// cached fields for that document and persists the result.
    ///
    /// Nothing becomes visible to readers unless every step succeeds.
    pub fn ingest(&self, document_id: &str, source: &str, pages: Vec<Page>) -> Result<IngestReport> {
        if document_id.trim().is_empty() {
            return Err(RagError::EmptyDocumentId);
        }
        let _guard = self.ingest_lock.lock();
        let mut next = State::clone(&self.snapshot());

        let chunks = self.chunker.chunk_pages(document_id, &pages);
        let vectors: Vec<Vec<f32>> = chunks
            .par_iter()
            .map(|chunk| self.embedder.embed_text(&chunk.text))
            .collect();
        let page_count = pages.len();
        let chunk_count = chunks.len();

        let record = next.store.upsert_document(document_id, source, pages)?;
        let revision = record.revision;
        let fields = self.extractor.extract(&record.full_text());
        next.store.add_batch(vectors.into_iter().zip(chunks).collect())?;
        next.fields.insert(document_id, fields.clone());

        if let Some(dir) = &self.config.store_dir {
            persist::save(&next.store, dir)?;
        }
        *self.state.write() = Arc::new(next);
        info!(
            document_id,
            revision,
            pages = page_count,
            chunks = chunk_count,
            fields_found = fields.found_count(),
            "ingested document"
        );
        Ok(IngestReport {
            document_id: document_id.to_string(),
            revision,
            pages: page_count,
            chunks: chunk_count,
            fields,
        })
    }

    /// Answers from cached fields when the question names one, otherwise from
    /// retrieval gated by the guardrails.
    pub fn ask(&self, question: &str) -> Result<AskResponse> {
        let question = question.trim();
        if question.is_empty() {
            return Err(RagError::EmptyQuestion);
        }
        let state = self.snapshot();
        let documents = state.store.documents();
        let order: Vec<&str> = documents
            .iter()
            .map(|document| document.document_id.as_str())
            .collect();

        if let Some(hit) = state.fields.lookup(question, order.iter().copied()) {
            debug!(field = hit.field.as_str(), document_id = %hit.document_id, "answered from cached fields");
            return Ok(AskResponse {
                answer: hit.value,
                confidence: 1.0,
                blocked: false,
                block_reason: None,
                sources: vec![Source {
                    document_id: Some(hit.document_id),
                    page: None,
                    text: format!("Extracted from {}", hit.field.as_str()),
                }],
                origin: AnswerOrigin::StructuredField,
            });
        }

        let retrieval = &self.config.retrieval;
        let query = self.embedder.embed_text(question);
        let neighbors = state.store.search_live(&query, retrieval.top_k)?;
        let top: Vec<_> = neighbors
            .iter()
            .take(retrieval.answer_sources)
            .filter_map(|neighbor| state.store.chunk(neighbor.row_id))
            .collect();
        let retrieved_text = top
            .iter()
            .map(|record| record.chunk.text.as_str())
            .collect::<Vec<_>>()
            .join("\n");
        let best_distance = neighbors.first().map(|neighbor| neighbor.distance);

        let verdict = self.guardrails.evaluate(&Evidence {
            question,
            best_distance,
            retrieved_text: &retrieved_text,
        });
        if let Some(reason) = verdict.reason {
            return Ok(AskResponse::refusal(reason));
        }
        let Some(best) = top.first() else {
            return Ok(AskResponse::refusal(BlockReason::LowRetrieval));
        };

        Ok(AskResponse {
            answer: truncate_chars(&best.chunk.text, retrieval.max_answer_chars),
            confidence: self.guardrails.scorer().score_best(best_distance),
            blocked: false,
            block_reason: None,
            sources: top
                .iter()
                .map(|record| Source {
                    document_id: Some(record.chunk.document_id.clone()),
                    page: Some(record.chunk.page_number),
                    text: truncate_chars(&record.chunk.text, retrieval.source_snippet_chars),
                })
                .collect(),
            origin: AnswerOrigin::Retrieval,
        })
    }

    /// Re-extracts every stored document and merges the results in ingestion
    /// order; a field found in an earlier document is never overwritten.
    pub fn extract_all(&self) -> StructuredFields {
        let state = self.snapshot();
        let documents = state.store.documents();
        let mut fresh = FieldCache::default();
        for document in &documents {
            fresh.insert(&document.document_id, self.extractor.extract(&document.full_text()));
        }
        fresh.merged(documents.iter().map(|document| document.document_id.as_str()))
    }

    pub fn cached_fields(&self, document_id: &str) -> Option<StructuredFields> {
        self.snapshot().fields.get(document_id).cloned()
    }

    pub fn documents(&self) -> Vec<DocumentSummary> {
        let state = self.snapshot();
        state
            .store
            .documents()
            .into_iter()
            .map(|document| DocumentSummary {
                document_id: document.document_id.clone(),
                source: document.source.clone(),
                revision: document.revision,
                pages: document.pages.len(),
                live_chunks: state.store.live_chunk_count(&document.document_id),
            })
            .collect()
    }

    /// Drops every document, row and cached field, persisting the empty store.
    pub fn reset(&self) -> Result<()> {
        let _guard = self.ingest_lock.lock();
        let empty = State {
            store: VectorStore::new(self.config.embedder),
            fields: FieldCache::default(),
        };
        if let Some(dir) = &self.config.store_dir {
            persist::save(&empty.store, dir)?;
        }
        *self.state.write() = Arc::new(empty);
        info!("reset retrieval engine");
        Ok(())
    }
}

fn truncate_chars(text: &str, max_chars: usize) -> String {
    match text.char_indices().nth(max_chars) {
        Some((idx, _)) => text[..idx].to_string(),
        None => text.to_string(),
    }
}
