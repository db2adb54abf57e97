use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Dimension of every vector the embedder produces and the index stores.
pub const EMBEDDING_DIM: usize = 128;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HashEmbedderConfig {
    pub seed: u64,
    /// When greater than one, a character's bucket also depends on its
    /// position modulo this window.
    pub position_window: u32,
}

impl Default for HashEmbedderConfig {
    fn default() -> Self {
        Self {
            seed: 1337,
            position_window: 0,
        }
    }
}

/// Bag-of-characters hash embedding.
///
/// Every lowercased character adds 1.0 to the bucket picked by a SHA-256 of
/// the seed and the character, and the accumulator is L2-normalised. The
/// output depends only on the input text and the config, so a persisted index
/// can be re-embedded and compared bit for bit.
#[derive(Debug, Clone)]
pub struct HashEmbedder {
    config: HashEmbedderConfig,
}

impl Default for HashEmbedder {
    fn default() -> Self {
        Self::new(HashEmbedderConfig::default())
    }
}

impl HashEmbedder {
    pub fn new(config: HashEmbedderConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> HashEmbedderConfig {
        self.config
    }

    pub fn embed_text(&self, text: &str) -> Vec<f32> {
        let mut vector = vec![0f32; EMBEDDING_DIM];
        for (position, ch) in text.chars().enumerate() {
            for lower in ch.to_lowercase() {
                vector[self.bucket_for(lower, position)] += 1.0;
            }
        }
        l2_normalize(&mut vector);
        vector
    }

    fn bucket_for(&self, ch: char, position: usize) -> usize {
        let mut utf8 = [0u8; 4];
        let mut hasher = Sha256::new();
        hasher.update(self.config.seed.to_le_bytes());
        hasher.update(ch.encode_utf8(&mut utf8).as_bytes());
        if self.config.position_window > 1 {
            let slot = (position % self.config.position_window as usize) as u32;
            hasher.update(slot.to_le_bytes());
        }
        let digest = hasher.finalize();
        let mut head = [0u8; 8];
        head.copy_from_slice(&digest[..8]);
        (u64::from_le_bytes(head) % EMBEDDING_DIM as u64) as usize
    }
}

/// Scales `vector` to unit length. A zero vector is left untouched.
pub fn l2_normalize(vector: &mut [f32]) {
    let norm = vector.iter().map(|v| v * v).sum::<f32>().sqrt();
    if norm == 0.0 {
        return;
    }
    for value in vector.iter_mut() {
        *value /= norm;
    }
}
