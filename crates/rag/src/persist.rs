use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::{info, warn};
use ultradoc_core::{ChunkRecord, DocumentRecord, HashEmbedderConfig};
use ultradoc_index::{read_jsonl, JsonlWriter};

use crate::error::{RagError, Result};
use crate::store::VectorStore;

pub const MANIFEST_FILE: &str = "MANIFEST.json";
pub const FORMAT_VERSION: u32 = 1;

const INDEX_MAGIC: &[u8; 4] = b"UDVI";
const INDEX_VERSION: u32 = 1;
const BYTE_ORDER_MARK: u32 = 0x0102_0304;
const HEADER_LEN: usize = 24;

/// Commit record naming the live generation of an on-disk store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Manifest {
    pub format_version: u32,
    pub generation: u64,
    pub dimension: usize,
    pub rows: u64,
    pub embedder: HashEmbedderConfig,
    pub next_sequence: u64,
    pub index_file: String,
    pub chunks_file: String,
    pub documents_file: String,
    pub index_blake3: String,
}

/// Writes `store` as a new generation under `dir` and commits it by renaming
/// the manifest into place. Files of older generations are removed afterwards.
pub fn save(store: &VectorStore, dir: &Path) -> Result<Manifest> {
    fs::create_dir_all(dir)?;
    let generation = latest_generation(dir)? + 1;
    let index_file = format!("index-{generation}.bin");
    let chunks_file = format!("chunks-{generation}.jsonl");
    let documents_file = format!("documents-{generation}.jsonl");

    let index_bytes = encode_index(store);
    write_synced(&dir.join(&index_file), &index_bytes)?;

    let mut chunks = JsonlWriter::new(Vec::new());
    for record in store.chunks() {
        chunks.write_record(record)?;
    }
    write_synced(&dir.join(&chunks_file), &chunks.into_inner())?;

    let mut documents = JsonlWriter::new(Vec::new());
    for document in store.documents() {
        documents.write_record(document)?;
    }
    write_synced(&dir.join(&documents_file), &documents.into_inner())?;

    let manifest = Manifest {
        format_version: FORMAT_VERSION,
        generation,
        dimension: store.dimension(),
        rows: store.len() as u64,
        embedder: store.embedder_config(),
        next_sequence: store.next_sequence(),
        index_file,
        chunks_file,
        documents_file,
        index_blake3: blake3::hash(&index_bytes).to_hex().to_string(),
    };
    let manifest_path = dir.join(MANIFEST_FILE);
    let tmp_path = dir.join(format!("{MANIFEST_FILE}.tmp"));
    write_synced(&tmp_path, &serde_json::to_vec_pretty(&manifest)?)?;
    fs::rename(&tmp_path, &manifest_path)?;
    if let Err(err) = sync_dir(dir) {
        warn!(dir = %dir.display(), error = %err, "failed to sync store directory after manifest rename");
    }

    remove_stale_generations(dir, generation);
    info!(
        dir = %dir.display(),
        generation,
        rows = manifest.rows,
        "persisted vector store"
    );
    Ok(manifest)
}

/// Loads the generation named by the manifest. `Ok(None)` means no store has
/// been committed yet; any inconsistency is an [`RagError::IndexCorruption`].
pub fn load(dir: &Path, embedder: HashEmbedderConfig) -> Result<Option<VectorStore>> {
    let manifest_path = dir.join(MANIFEST_FILE);
    if !manifest_path.exists() {
        return Ok(None);
    }
    let raw = fs::read(&manifest_path)?;
    let manifest: Manifest = serde_json::from_slice(&raw)
        .map_err(|err| corruption(format!("unreadable manifest: {err}")))?;
    if manifest.format_version != FORMAT_VERSION {
        return Err(corruption(format!(
            "unsupported format version {}",
            manifest.format_version
        )));
    }
    if manifest.embedder != embedder {
        return Err(corruption(format!(
            "index was built with embedder {:?}, configured embedder is {:?}",
            manifest.embedder, embedder
        )));
    }

    let index_path = dir.join(&manifest.index_file);
    let index_bytes = fs::read(&index_path)
        .map_err(|err| corruption(format!("cannot read {}: {err}", index_path.display())))?;
    let checksum = blake3::hash(&index_bytes).to_hex().to_string();
    if checksum != manifest.index_blake3 {
        return Err(corruption(format!(
            "checksum mismatch for {}",
            manifest.index_file
        )));
    }
    let (dimension, rows, vectors) = decode_index(&index_bytes)?;
    if dimension != manifest.dimension || rows != manifest.rows {
        return Err(corruption(format!(
            "index header ({rows} x {dimension}) disagrees with manifest ({} x {})",
            manifest.rows, manifest.dimension
        )));
    }

    let chunks: Vec<ChunkRecord> = read_table(&dir.join(&manifest.chunks_file))?;
    let documents: Vec<DocumentRecord> = read_table(&dir.join(&manifest.documents_file))?;
    let store = VectorStore::from_parts(
        dimension,
        manifest.embedder,
        vectors,
        chunks,
        documents,
        manifest.next_sequence,
    )?;
    info!(
        dir = %dir.display(),
        generation = manifest.generation,
        rows,
        "loaded vector store"
    );
    Ok(Some(store))
}

fn encode_index(store: &VectorStore) -> Vec<u8> {
    let body: &[u8] = bytemuck::cast_slice(store.vectors());
    let mut bytes = Vec::with_capacity(HEADER_LEN + body.len());
    bytes.extend_from_slice(INDEX_MAGIC);
    bytes.extend_from_slice(&INDEX_VERSION.to_ne_bytes());
    bytes.extend_from_slice(&BYTE_ORDER_MARK.to_ne_bytes());
    bytes.extend_from_slice(&(store.dimension() as u32).to_ne_bytes());
    bytes.extend_from_slice(&(store.len() as u64).to_ne_bytes());
    bytes.extend_from_slice(body);
    bytes
}

fn decode_index(bytes: &[u8]) -> Result<(usize, u64, Vec<f32>)> {
    if bytes.len() < HEADER_LEN || &bytes[..4] != INDEX_MAGIC {
        return Err(corruption("index file has no valid header".to_string()));
    }
    if read_u32(bytes, 8) != BYTE_ORDER_MARK {
        return Err(corruption(
            "index file was written with a foreign byte order".to_string(),
        ));
    }
    let version = read_u32(bytes, 4);
    if version != INDEX_VERSION {
        return Err(corruption(format!("unsupported index version {version}")));
    }
    let dimension = read_u32(bytes, 12) as usize;
    let mut rows_bytes = [0u8; 8];
    rows_bytes.copy_from_slice(&bytes[16..24]);
    let rows = u64::from_ne_bytes(rows_bytes);

    let body = &bytes[HEADER_LEN..];
    let expected = (rows as usize)
        .checked_mul(dimension)
        .and_then(|values| values.checked_mul(std::mem::size_of::<f32>()));
    if expected != Some(body.len()) {
        return Err(corruption(format!(
            "index body holds {} bytes, header promises {rows} rows of {dimension}",
            body.len()
        )));
    }
    Ok((dimension, rows, bytemuck::pod_collect_to_vec(body)))
}

fn read_u32(bytes: &[u8], offset: usize) -> u32 {
    let mut buf = [0u8; 4];
    buf.copy_from_slice(&bytes[offset..offset + 4]);
    u32::from_ne_bytes(buf)
}

fn read_table<T: serde::de::DeserializeOwned>(path: &Path) -> Result<Vec<T>> {
    read_jsonl(path).map_err(|err| corruption(format!("{err:#}")))
}

fn write_synced(path: &Path, bytes: &[u8]) -> Result<()> {
    let mut file = OpenOptions::new()
        .create(true)
        .truncate(true)
        .write(true)
        .open(path)?;
    file.write_all(bytes)?;
    file.sync_all()?;
    Ok(())
}

/// Highest generation number among the files already in `dir`.
fn latest_generation(dir: &Path) -> Result<u64> {
    let mut latest = 0;
    for entry in fs::read_dir(dir)? {
        let name = entry?.file_name();
        if let Some(generation) = name.to_str().and_then(generation_of) {
            latest = latest.max(generation);
        }
    }
    Ok(latest)
}

fn generation_of(name: &str) -> Option<u64> {
    let stem = name
        .strip_prefix("index-")
        .and_then(|rest| rest.strip_suffix(".bin"))
        .or_else(|| {
            name.strip_prefix("chunks-")
                .and_then(|rest| rest.strip_suffix(".jsonl"))
        })
        .or_else(|| {
            name.strip_prefix("documents-")
                .and_then(|rest| rest.strip_suffix(".jsonl"))
        })?;
    stem.parse().ok()
}

// makes the manifest rename itself durable
fn sync_dir(dir: &Path) -> std::io::Result<()> {
    File::open(dir)?.sync_all()
}

fn remove_stale_generations(dir: &Path, keep: u64) {
    let Ok(entries) = fs::read_dir(dir) else {
        return;
    };
    let stale: Vec<PathBuf> = entries
        .filter_map(|entry| entry.ok())
        .filter(|entry| {
            entry
                .file_name()
                .to_str()
                .and_then(generation_of)
                .is_some_and(|generation| generation != keep)
        })
        .map(|entry| entry.path())
        .collect();
    for path in stale {
        if let Err(err) = fs::remove_file(&path) {
            warn!(path = %path.display(), error = %err, "failed to remove stale generation file");
        }
    }
}

fn corruption(message: String) -> RagError {
    RagError::IndexCorruption(message)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn directory_sync_reports_failures() {
        let dir = tempfile::tempdir().unwrap();
        assert!(sync_dir(dir.path()).is_ok());
        assert!(sync_dir(&dir.path().join("gone")).is_err());
    }

    #[test]
    fn generation_names_parse() {
        assert_eq!(generation_of("index-12.bin"), Some(12));
        assert_eq!(generation_of("chunks-3.jsonl"), Some(3));
        assert_eq!(generation_of("documents-40.jsonl"), Some(40));
        assert_eq!(generation_of("MANIFEST.json"), None);
        assert_eq!(generation_of("index-x.bin"), None);
    }

    #[test]
    fn truncated_body_is_rejected() {
        let store = VectorStore::new(HashEmbedderConfig::default());
        let mut bytes = encode_index(&store);
        let (dimension, rows, vectors) = decode_index(&bytes).unwrap();
        assert_eq!((dimension, rows, vectors.len()), (128, 0, 0));

        bytes[16] = 1;
        assert!(matches!(decode_index(&bytes), Err(RagError::IndexCorruption(_))));
        assert!(matches!(decode_index(b"UDV"), Err(RagError::IndexCorruption(_))));
    }

    #[test]
    fn foreign_byte_order_is_reported() {
        let store = VectorStore::new(HashEmbedderConfig::default());
        let mut bytes = encode_index(&store);
        bytes[8..12].reverse();
        let err = decode_index(&bytes).unwrap_err();
        assert!(err.to_string().contains("byte order"));
    }
}
