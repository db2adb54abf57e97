pub mod confidence;
pub mod config;
pub mod error;
pub mod fields;
pub mod guardrails;
pub mod persist;
pub mod pipeline;
pub mod refine;
pub mod store;

pub use confidence::ConfidenceScorer;
pub use config::{RagConfig, RetrievalConfig};
pub use error::{RagError, Result};
pub use fields::{FieldAnswer, FieldCache, FIELD_KEYWORDS};
pub use guardrails::{BlockReason, Evidence, Guardrail, GuardrailConfig, GuardrailVerdict, Guardrails};
pub use persist::{Manifest, MANIFEST_FILE};
pub use pipeline::{
    AnswerOrigin, AskResponse, DocumentSummary, IngestReport, Orchestrator, Source, REFUSAL_ANSWER,
};
pub use refine::{refine_answer, LlmRefiner, Refiner};
pub use store::{Neighbor, VectorStore};
pub use ultradoc_core::{Field, Page, StructuredFields};
