mod chunk;
mod embedding;
mod error;
mod extract;
mod parse;

pub use chunk::{ChunkConfig, Chunker};
pub use embedding::{l2_normalize, HashEmbedder, HashEmbedderConfig, EMBEDDING_DIM};
pub use error::{CoreError, Result};
pub use extract::{Field, StructuredExtractor, StructuredFields};
pub use parse::{parse_upload, InputKind};
pub use ultradoc_index::{Chunk, ChunkRecord, DocumentRecord, Page, RowId};
