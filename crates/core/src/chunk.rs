use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use ultradoc_index::{Chunk, Page};

use crate::error::{CoreError, Result};

const CHUNK_VERSION: u32 = 1;

/// Window geometry in characters.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ChunkConfig {
    pub size: usize,
    pub overlap: usize,
}

impl Default for ChunkConfig {
    fn default() -> Self {
        Self {
            size: 500,
            overlap: 100,
        }
    }
}

impl ChunkConfig {
    pub fn validate(&self) -> Result<()> {
        if self.size == 0 || self.overlap >= self.size {
            return Err(CoreError::InvalidChunkConfig {
                size: self.size,
                overlap: self.overlap,
            });
        }
        Ok(())
    }

    pub fn stride(&self) -> usize {
        self.size - self.overlap
    }
}

/// Splits page text into fixed-stride overlapping windows.
///
/// Window `i` of a page always covers characters
/// `[i * stride, min(i * stride + size, len))`. Windows that contain only
/// whitespace are not emitted, but the surviving ones keep their window index.
#[derive(Debug, Clone)]
pub struct Chunker {
    config: ChunkConfig,
}

impl Chunker {
    pub fn new(config: ChunkConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self { config })
    }

    pub fn config(&self) -> ChunkConfig {
        self.config
    }

    pub fn chunk_pages(&self, document_id: &str, pages: &[Page]) -> Vec<Chunk> {
        pages
            .iter()
            .flat_map(|page| self.chunk_page(document_id, page.page_number, &page.text))
            .collect()
    }

    pub fn chunk_page(&self, document_id: &str, page_number: u32, text: &str) -> Vec<Chunk> {
        // byte offset of every char boundary, including the end of the string
        let boundaries: Vec<usize> = text
            .char_indices()
            .map(|(idx, _)| idx)
            .chain(std::iter::once(text.len()))
            .collect();
        let char_len = boundaries.len() - 1;
        let stride = self.config.stride();
        let mut chunks = Vec::new();
        let mut chunk_index = 0usize;
        let mut start = 0usize;
        while start < char_len {
            let end = (start + self.config.size).min(char_len);
            let slice = &text[boundaries[start]..boundaries[end]];
            if !slice.trim().is_empty() {
                chunks.push(Chunk {
                    chunk_id: stable_chunk_id(document_id, page_number, chunk_index, start, end),
                    document_id: document_id.to_string(),
                    page_number,
                    chunk_index,
                    char_start: start,
                    char_end: end,
                    text: slice.to_string(),
                });
            }
            if end == char_len {
                break;
            }
            start += stride;
            chunk_index += 1;
        }
        chunks
    }
}

fn stable_chunk_id(
    document_id: &str,
    page_number: u32,
    chunk_index: usize,
    char_start: usize,
    char_end: usize,
) -> String {
    let mut hasher = Sha256::new();
    hasher.update(document_id.as_bytes());
    hasher.update(CHUNK_VERSION.to_be_bytes());
    hasher.update(page_number.to_be_bytes());
    hasher.update((chunk_index as u64).to_be_bytes());
    hasher.update((char_start as u64).to_be_bytes());
    hasher.update((char_end as u64).to_be_bytes());
    hex::encode(hasher.finalize())
}
