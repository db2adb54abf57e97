use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{anyhow, bail, Context, Result};
use clap::{ArgAction, Parser, Subcommand};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;
use walkdir::WalkDir;

use ultradoc_core::{parse_upload, InputKind};
use ultradoc_rag::{refine_answer, LlmRefiner, Orchestrator, RagConfig};

#[derive(Parser, Debug)]
#[command(name = "ultradoc", version, about = "Grounded question answering over shipment documents")]
struct Cli {
    /// TOML config file; defaults to $ULTRADOC_CONFIG or ultradoc.toml
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    /// Index directory, overriding the configured store_dir
    #[arg(long, global = true)]
    store: Option<PathBuf>,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Parse and index files or directories of .txt, .md, .pdf and .docx documents
    Ingest {
        #[arg(required = true)]
        inputs: Vec<PathBuf>,
        /// Document id to use instead of the file name (single file only)
        #[arg(long)]
        id: Option<String>,
    },
    /// Ask a question against the indexed documents
    Ask {
        question: String,
        /// Rewrite the grounded answer with the configured refine provider
        #[arg(long, action = ArgAction::SetTrue)]
        refine: bool,
    },
    /// Structured shipment fields merged across all documents
    Extract,
    /// List indexed documents
    Documents,
    /// Remove every document from the index
    Reset,
}

fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();
    let config = resolve_config(cli.config.as_deref(), cli.store)?;
    if config.store_dir.is_none() {
        warn!("no store_dir configured, the index will not outlive this command");
    }
    let engine = Orchestrator::open(config)?;

    match cli.command {
        Commands::Ingest { inputs, id } => {
            let files = collect_inputs(&inputs)?;
            if id.is_some() && files.len() != 1 {
                bail!("--id needs exactly one input file, got {}", files.len());
            }
            let mut reports = Vec::with_capacity(files.len());
            for file in &files {
                let filename = file_name(file)?;
                let bytes =
                    fs::read(file).with_context(|| format!("failed to read {}", file.display()))?;
                let pages = parse_upload(&filename, &bytes)
                    .with_context(|| format!("failed to parse {}", file.display()))?;
                let document_id = id.clone().unwrap_or_else(|| filename.clone());
                reports.push(engine.ingest(&document_id, &filename, pages)?);
            }
            info!(documents = reports.len(), "ingest finished");
            print_json(&reports)?;
        }
        Commands::Ask { question, refine } => {
            let mut response = engine.ask(&question)?;
            if refine {
                let refiner = LlmRefiner::from_env()?
                    .ok_or_else(|| anyhow!("--refine needs ULTRADOC_REFINE_PROVIDER"))?;
                response = refine_answer(&refiner, &question, response);
            }
            print_json(&response)?;
        }
        Commands::Extract => print_json(&engine.extract_all())?,
        Commands::Documents => print_json(&engine.documents())?,
        Commands::Reset => {
            engine.reset()?;
            println!("index reset");
        }
    }
    Ok(())
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init();
}

fn resolve_config(path: Option<&Path>, store: Option<PathBuf>) -> Result<RagConfig> {
    let mut config = match path {
        Some(path) => {
            if !path.exists() {
                bail!("config file {} does not exist", path.display());
            }
            let mut config = RagConfig::load(path)?;
            config.apply_env();
            config
        }
        None => RagConfig::discover()?,
    };
    if let Some(store) = store {
        config.store_dir = Some(store);
    }
    config.validate()?;
    Ok(config)
}

/// Expands directories into the supported files below them, sorted by path.
fn collect_inputs(inputs: &[PathBuf]) -> Result<Vec<PathBuf>> {
    let mut files = Vec::new();
    for input in inputs {
        if input.is_dir() {
            let mut found: Vec<PathBuf> = WalkDir::new(input)
                .into_iter()
                .filter_map(|entry| entry.ok())
                .filter(|entry| entry.file_type().is_file())
                .map(|entry| entry.into_path())
                .filter(|path| {
                    path.file_name()
                        .and_then(|name| name.to_str())
                        .and_then(InputKind::from_filename)
                        .is_some()
                })
                .collect();
            found.sort();
            files.extend(found);
        } else if input.is_file() {
            files.push(input.clone());
        } else {
            bail!("input {} does not exist", input.display());
        }
    }
    Ok(files)
}

fn file_name(path: &Path) -> Result<String> {
    path.file_name()
        .and_then(|name| name.to_str())
        .map(str::to_string)
        .ok_or_else(|| anyhow!("{} has no usable file name", path.display()))
}

fn print_json<T: serde::Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn directories_expand_to_supported_files() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join("b.txt"), "Shipper: Acme").unwrap();
        fs::write(dir.path().join("a.md"), "Consignee: Beta").unwrap();
        fs::write(dir.path().join("photo.png"), [0u8; 4]).unwrap();
        fs::write(dir.path().join("old.doc"), b"legacy").unwrap();
        fs::write(dir.path().join("d.docx"), b"PK").unwrap();
        fs::create_dir(dir.path().join("nested")).unwrap();
        fs::write(dir.path().join("nested/c.pdf"), b"%PDF").unwrap();

        let files = collect_inputs(&[dir.path().to_path_buf()]).unwrap();
        let names: Vec<String> = files.iter().map(|f| file_name(f).unwrap()).collect();
        assert_eq!(names, vec!["a.md", "b.txt", "d.docx", "c.pdf"]);
        assert!(collect_inputs(&[dir.path().join("missing.txt")]).is_err());
    }

    #[test]
    fn store_flag_overrides_config() {
        let dir = tempdir().unwrap();
        let config_path = dir.path().join("ultradoc.toml");
        fs::write(&config_path, "store_dir = \"elsewhere\"\n[retrieval]\ntop_k = 3\n").unwrap();
        let config = resolve_config(Some(&config_path), Some(dir.path().join("index"))).unwrap();
        assert_eq!(config.store_dir, Some(dir.path().join("index")));
        assert!(resolve_config(Some(&dir.path().join("nope.toml")), None).is_err());
    }

    #[test]
    fn cli_parses_subcommands() {
        let cli = Cli::try_parse_from(["ultradoc", "--store", "idx", "ask", "What is the rate?", "--refine"])
            .unwrap();
        assert_eq!(cli.store, Some(PathBuf::from("idx")));
        assert!(matches!(cli.command, Commands::Ask { refine: true, .. }));
    }
}
