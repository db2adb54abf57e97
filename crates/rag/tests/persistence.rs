use std::fs;
use std::path::Path;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tempfile::tempdir;
use ultradoc_core::{l2_normalize, ChunkConfig, Chunker, HashEmbedder, HashEmbedderConfig, Page, EMBEDDING_DIM};
use ultradoc_rag::persist::{load, save};
use ultradoc_rag::{Orchestrator, RagConfig, RagError, VectorStore, MANIFEST_FILE};

const PAGES: &[&str] = &[
    "Carrier Rate: 2500 USD\nShipment ID: SH-12345\nShipper: Acme Logistics",
    "Shipper: Acme Corp\nConsignee: Beta LLC\nWeight: 1200 lbs",
    "Driver must call dispatch one hour before arrival. Loading dock closes at 5pm.",
    "Beneficiary bank details are provided on request. Contact accounts payable.",
];

fn sample_store() -> VectorStore {
    let embedder = HashEmbedder::default();
    let chunker = Chunker::new(ChunkConfig { size: 40, overlap: 10 }).unwrap();
    let mut store = VectorStore::new(embedder.config());
    for (idx, text) in PAGES.iter().enumerate() {
        let document_id = format!("doc-{idx}.txt");
        let pages = vec![Page::new(1, *text), Page::new(2, text.to_uppercase())];
        let chunks = chunker.chunk_pages(&document_id, &pages);
        store.upsert_document(&document_id, &document_id, pages).unwrap();
        let entries = chunks
            .into_iter()
            .map(|chunk| (embedder.embed_text(&chunk.text), chunk))
            .collect();
        store.add_batch(entries).unwrap();
    }
    // a superseded revision keeps its rows on disk
    store
        .upsert_document("doc-0.txt", "doc-0.txt", vec![Page::new(1, "Carrier Rate: 2600 USD")])
        .unwrap();
    let chunk = chunker.chunk_page("doc-0.txt", 1, "Carrier Rate: 2600 USD").remove(0);
    store
        .add(embedder.embed_text(&chunk.text), chunk)
        .unwrap();
    store
}

fn random_query(rng: &mut StdRng) -> Vec<f32> {
    let mut query: Vec<f32> = (0..EMBEDDING_DIM).map(|_| rng.gen_range(-1.0..1.0)).collect();
    l2_normalize(&mut query);
    query
}

fn manifest_json(dir: &Path) -> serde_json::Value {
    serde_json::from_slice(&fs::read(dir.join(MANIFEST_FILE)).unwrap()).unwrap()
}

#[test]
fn reload_answers_queries_identically() {
    let dir = tempdir().unwrap();
    let store = sample_store();
    save(&store, dir.path()).unwrap();
    let loaded = load(dir.path(), HashEmbedderConfig::default())
        .unwrap()
        .expect("store was saved");

    assert_eq!(loaded.len(), store.len());
    assert_eq!(loaded.chunks(), store.chunks());
    assert_eq!(loaded.documents(), store.documents());
    let original_bits: Vec<u32> = store.vectors().iter().map(|v| v.to_bits()).collect();
    let loaded_bits: Vec<u32> = loaded.vectors().iter().map(|v| v.to_bits()).collect();
    assert_eq!(original_bits, loaded_bits);

    let mut rng = StdRng::seed_from_u64(7);
    for _ in 0..100 {
        let query = random_query(&mut rng);
        let k = rng.gen_range(1..store.len() + 3);
        assert_eq!(store.search(&query, k).unwrap(), loaded.search(&query, k).unwrap());
        assert_eq!(
            store.search_live(&query, k).unwrap(),
            loaded.search_live(&query, k).unwrap()
        );
    }
}

#[test]
fn missing_manifest_means_no_store() {
    let dir = tempdir().unwrap();
    assert!(load(dir.path(), HashEmbedderConfig::default()).unwrap().is_none());
}

#[test]
fn each_save_commits_a_new_generation_and_drops_the_old() {
    let dir = tempdir().unwrap();
    let store = sample_store();
    let first = save(&store, dir.path()).unwrap();
    let second = save(&store, dir.path()).unwrap();
    assert_eq!(second.generation, first.generation + 1);
    assert!(!dir.path().join(&first.index_file).exists());
    assert!(!dir.path().join(&first.chunks_file).exists());
    assert!(dir.path().join(&second.index_file).exists());
    assert!(!dir.path().join(format!("{MANIFEST_FILE}.tmp")).exists());
    assert_eq!(manifest_json(dir.path())["generation"], second.generation);
    assert_eq!(manifest_json(dir.path())["rows"], store.len() as u64);
}

#[test]
fn extra_chunk_row_is_corruption() {
    let dir = tempdir().unwrap();
    let manifest = save(&sample_store(), dir.path()).unwrap();
    let chunks_path = dir.path().join(&manifest.chunks_file);
    let contents = fs::read_to_string(&chunks_path).unwrap();
    let first_line = contents.lines().next().unwrap().to_string();
    fs::write(&chunks_path, format!("{contents}{first_line}\n")).unwrap();

    let err = load(dir.path(), HashEmbedderConfig::default()).unwrap_err();
    assert!(matches!(err, RagError::IndexCorruption(_)), "{err}");
}

#[test]
fn missing_chunk_row_is_corruption() {
    let dir = tempdir().unwrap();
    let manifest = save(&sample_store(), dir.path()).unwrap();
    let chunks_path = dir.path().join(&manifest.chunks_file);
    let contents = fs::read_to_string(&chunks_path).unwrap();
    let kept: Vec<&str> = contents.lines().skip(1).collect();
    fs::write(&chunks_path, kept.join("\n")).unwrap();

    assert!(matches!(
        load(dir.path(), HashEmbedderConfig::default()),
        Err(RagError::IndexCorruption(_))
    ));
}

#[test]
fn flipped_vector_byte_fails_checksum() {
    let dir = tempdir().unwrap();
    let manifest = save(&sample_store(), dir.path()).unwrap();
    let index_path = dir.path().join(&manifest.index_file);
    let mut bytes = fs::read(&index_path).unwrap();
    let last = bytes.len() - 1;
    bytes[last] ^= 0x40;
    fs::write(&index_path, bytes).unwrap();

    let err = load(dir.path(), HashEmbedderConfig::default()).unwrap_err();
    assert!(err.to_string().contains("checksum"), "{err}");
}

#[test]
fn unreadable_manifest_is_corruption() {
    let dir = tempdir().unwrap();
    save(&sample_store(), dir.path()).unwrap();
    fs::write(dir.path().join(MANIFEST_FILE), b"{ not json").unwrap();
    assert!(matches!(
        load(dir.path(), HashEmbedderConfig::default()),
        Err(RagError::IndexCorruption(_))
    ));
}

#[test]
fn embedder_change_is_corruption() {
    let dir = tempdir().unwrap();
    save(&sample_store(), dir.path()).unwrap();
    let other = HashEmbedderConfig {
        seed: 42,
        ..HashEmbedderConfig::default()
    };
    assert!(matches!(load(dir.path(), other), Err(RagError::IndexCorruption(_))));
}

#[test]
fn corrupt_store_refuses_to_open() {
    let dir = tempdir().unwrap();
    let manifest = save(&sample_store(), dir.path()).unwrap();
    fs::remove_file(dir.path().join(&manifest.documents_file)).unwrap();
    let config = RagConfig {
        store_dir: Some(dir.path().to_path_buf()),
        ..RagConfig::default()
    };
    assert!(matches!(
        Orchestrator::open(config),
        Err(RagError::IndexCorruption(_))
    ));
}

#[test]
fn engine_state_survives_restart() {
    let dir = tempdir().unwrap();
    let config = RagConfig {
        store_dir: Some(dir.path().to_path_buf()),
        ..RagConfig::default()
    };
    let before = {
        let engine = Orchestrator::open(config.clone()).unwrap();
        engine
            .ingest("rate.txt", "rate.txt", vec![Page::new(1, PAGES[0])])
            .unwrap();
        engine
            .ingest("notes.txt", "notes.txt", vec![Page::new(1, PAGES[2])])
            .unwrap();
        (engine.documents(), engine.ask("Loading dock hours").unwrap(), engine.extract_all())
    };

    let reopened = Orchestrator::open(config).unwrap();
    assert_eq!(reopened.documents(), before.0);
    assert_eq!(reopened.ask("Loading dock hours").unwrap(), before.1);
    assert_eq!(reopened.extract_all(), before.2);
    assert_eq!(
        reopened.cached_fields("rate.txt").unwrap().rate.as_deref(),
        Some("2500")
    );
}

#[test]
fn reset_persists_an_empty_store() {
    let dir = tempdir().unwrap();
    let config = RagConfig {
        store_dir: Some(dir.path().to_path_buf()),
        ..RagConfig::default()
    };
    let engine = Orchestrator::open(config.clone()).unwrap();
    engine
        .ingest("rate.txt", "rate.txt", vec![Page::new(1, PAGES[0])])
        .unwrap();
    engine.reset().unwrap();
    drop(engine);

    let reopened = Orchestrator::open(config).unwrap();
    assert!(reopened.documents().is_empty());
    assert_eq!(reopened.extract_all().found_count(), 0);
    assert_eq!(manifest_json(dir.path())["rows"], 0);
}
