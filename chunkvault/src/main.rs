mod output;

use anyhow::{Context, Result};
use chunkvault_core::{Algorithm, ChunkIndex, Vault};
use clap::{Parser, Subcommand};
use output::{
    ChunkInfo, ChunkOutput, InitOutput, LsOutput, ObjectInfo, ObjectOutput, OutputWriter,
    RmOutput, StatOutput, VerifyOutput, id_list, result_code,
};
use std::fmt::Write as _;
use std::fs::File;
use std::io::{self, BufReader, Read};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

/// Chunkvault - A chunked, content-addressed object store
#[derive(Parser)]
#[command(name = "chunkvault")]
#[command(about = "Chunked, deduplicating object store", long_about = None)]
#[command(version)]
struct Cli {
    /// Vault root directory (defaults to CHUNKVAULT_ROOT env var or ./chunkvault)
    #[arg(short, long, global = true)]
    root: Option<PathBuf>,

    /// Print results as JSON
    #[arg(long, global = true)]
    json: bool,

    /// Increase log verbosity (-v info, -vv debug, -vvv trace)
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize a new vault
    Init {
        /// Hash algorithm to use (sha256 or blake3)
        #[arg(long, default_value = "sha256")]
        algo: String,
    },

    /// Store a file as a new object ("-" reads stdin)
    Put {
        /// File to store
        input: PathBuf,
    },

    /// Append a file to an existing object ("-" reads stdin)
    Append {
        /// Object id
        id: u64,

        /// File to append
        input: PathBuf,
    },

    /// Output object content to stdout
    Cat {
        /// Object id
        id: u64,
    },

    /// Show object metadata and its chunk sequence
    Stat {
        /// Object id
        id: u64,
    },

    /// List all objects
    Ls,

    /// Delete an object (chunk files are kept)
    Rm {
        /// Object id
        id: u64,
    },

    /// Show chunk metadata
    Chunk {
        /// Chunk id
        id: u64,
    },

    /// Compare the index with the chunk files on disk
    Verify {
        /// Remove orphan files and truncate unrecorded appends
        #[arg(long)]
        repair: bool,
    },
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    let output = OutputWriter::new(cli.json);
    match run(cli, &output) {
        Ok(code) => ExitCode::from(code),
        Err(err) => {
            output.write_error(&err, result_code::FAILURE);
            ExitCode::from(result_code::FAILURE)
        }
    }
}

fn init_logging(verbose: u8) {
    let default_level = match verbose {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| default_level.into()))
        .with(tracing_subscriber::fmt::layer().with_writer(io::stderr))
        .init();
}

fn run(cli: Cli, output: &OutputWriter) -> Result<u8> {
    // Determine vault root: CLI arg > CHUNKVAULT_ROOT env var > ./chunkvault default
    let root = cli
        .root
        .or_else(|| std::env::var("CHUNKVAULT_ROOT").ok().map(PathBuf::from))
        .unwrap_or_else(|| PathBuf::from("./chunkvault"));
    tracing::debug!(root = %root.display(), "resolved vault root");

    match cli.command {
        Commands::Init { algo } => cmd_init(&root, &algo, output),
        Commands::Put { input } => cmd_put(&root, &input, output),
        Commands::Append { id, input } => cmd_append(&root, id, &input, output),
        Commands::Cat { id } => cmd_cat(&root, id),
        Commands::Stat { id } => cmd_stat(&root, id, output),
        Commands::Ls => cmd_ls(&root, output),
        Commands::Rm { id } => cmd_rm(&root, id, output),
        Commands::Chunk { id } => cmd_chunk(&root, id, output),
        Commands::Verify { repair } => cmd_verify(&root, repair, output),
    }
}

fn parse_algorithm(algo: &str) -> Result<Algorithm> {
    match algo {
        "sha256" => Ok(Algorithm::Sha256),
        "blake3" => Ok(Algorithm::Blake3),
        _ => anyhow::bail!("Unsupported algorithm: {}", algo),
    }
}

fn open_vault(root: &Path) -> Result<Vault> {
    Vault::open(root).with_context(|| format!("Failed to open vault at {}", root.display()))
}

fn open_input(path: &Path) -> Result<Box<dyn Read>> {
    if path == Path::new("-") {
        return Ok(Box::new(io::stdin().lock()));
    }
    let file =
        File::open(path).with_context(|| format!("Failed to open input: {}", path.display()))?;
    Ok(Box::new(BufReader::new(file)))
}

fn object_text(object: &ObjectInfo) -> String {
    format!("{} {} bytes {}\n", object.id, object.size, object.hash)
}

fn cmd_init(root: &Path, algo: &str, output: &OutputWriter) -> Result<u8> {
    let algorithm = parse_algorithm(algo)?;

    Vault::init(root, algorithm)
        .with_context(|| format!("Failed to initialize vault at {}", root.display()))?;

    let data = InitOutput {
        success: true,
        result_code: result_code::SUCCESS,
        root: root.display().to_string(),
        algorithm: algorithm.as_str().to_string(),
    };
    output.write(&data, || {
        format!(
            "Initialized chunkvault at {}\nAlgorithm: {}\n",
            data.root, data.algorithm
        )
    })?;

    Ok(result_code::SUCCESS)
}

fn cmd_put(root: &Path, input: &Path, output: &OutputWriter) -> Result<u8> {
    let vault = open_vault(root)?;

    let object = vault
        .objects()
        .create_from_reader(open_input(input)?)
        .with_context(|| format!("Failed to store {}", input.display()))?;

    let data = ObjectOutput {
        success: true,
        result_code: result_code::SUCCESS,
        object: object.into(),
    };
    output.write(&data, || object_text(&data.object))?;

    Ok(result_code::SUCCESS)
}

fn cmd_append(root: &Path, id: u64, input: &Path, output: &OutputWriter) -> Result<u8> {
    let vault = open_vault(root)?;

    let object = vault
        .objects()
        .append_from_reader(id, open_input(input)?)
        .with_context(|| format!("Failed to append {} to object {}", input.display(), id))?;

    let data = ObjectOutput {
        success: true,
        result_code: result_code::SUCCESS,
        object: object.into(),
    };
    output.write(&data, || object_text(&data.object))?;

    Ok(result_code::SUCCESS)
}

fn cmd_cat(root: &Path, id: u64) -> Result<u8> {
    let vault = open_vault(root)?;

    let mut reader = vault
        .objects()
        .reader(id)
        .with_context(|| format!("Failed to open object {}", id))?;

    let stdout = io::stdout();
    let mut handle = stdout.lock();
    io::copy(&mut reader, &mut handle).with_context(|| format!("Failed to output object {}", id))?;

    Ok(result_code::SUCCESS)
}

fn cmd_stat(root: &Path, id: u64, output: &OutputWriter) -> Result<u8> {
    let vault = open_vault(root)?;

    let object = vault
        .objects()
        .get(id)
        .with_context(|| format!("Failed to read object {}", id))?;
    let chunks = vault
        .objects()
        .chunks(id)
        .with_context(|| format!("Failed to read chunks of object {}", id))?
        .iter()
        .map(|chunk| -> Result<ChunkInfo> {
            let path = vault.store().locator().path(chunk.id)?;
            Ok(ChunkInfo::new(chunk, path.display().to_string()))
        })
        .collect::<Result<Vec<_>>>()?;

    let data = StatOutput {
        success: true,
        result_code: result_code::SUCCESS,
        object: object.into(),
        chunks,
    };
    output.write(&data, || {
        let mut text = String::new();
        let _ = writeln!(text, "Object: {}", data.object.id);
        let _ = writeln!(text, "Size: {} bytes", data.object.size);
        let _ = writeln!(text, "Hash: {}", data.object.hash);
        let _ = writeln!(text, "Created: {}", data.object.created_at.to_rfc3339());
        let _ = writeln!(text, "Updated: {}", data.object.updated_at.to_rfc3339());
        let _ = writeln!(text, "Chunks: {}", data.chunks.len());
        for chunk in &data.chunks {
            let _ = writeln!(text, "  {} {} bytes {}", chunk.id, chunk.size, chunk.hash);
        }
        text
    })?;

    Ok(result_code::SUCCESS)
}

fn cmd_ls(root: &Path, output: &OutputWriter) -> Result<u8> {
    let vault = open_vault(root)?;

    let objects = vault
        .objects()
        .list()
        .with_context(|| "Failed to list objects")?;

    let data = LsOutput {
        success: true,
        result_code: result_code::SUCCESS,
        objects: objects.into_iter().map(ObjectInfo::from).collect(),
    };
    output.write(&data, || {
        if data.objects.is_empty() {
            "No objects (use 'chunkvault put' to create one)\n".to_string()
        } else {
            data.objects.iter().map(object_text).collect()
        }
    })?;

    Ok(result_code::SUCCESS)
}

fn cmd_rm(root: &Path, id: u64, output: &OutputWriter) -> Result<u8> {
    let vault = open_vault(root)?;

    vault
        .objects()
        .delete(id)
        .with_context(|| format!("Failed to delete object {}", id))?;

    let data = RmOutput {
        success: true,
        result_code: result_code::SUCCESS,
        id,
    };
    output.write(&data, || format!("Deleted object {}\n", id))?;

    Ok(result_code::SUCCESS)
}

fn cmd_chunk(root: &Path, id: u64, output: &OutputWriter) -> Result<u8> {
    let vault = open_vault(root)?;
    let store = vault.store();

    let chunk = store
        .get(id)
        .with_context(|| format!("Failed to read chunk {}", id))?;
    let path = store.locator().path(id)?;
    let references = store
        .index()
        .count_references(id)
        .with_context(|| format!("Failed to count references to chunk {}", id))?;

    let data = ChunkOutput {
        success: true,
        result_code: result_code::SUCCESS,
        chunk: ChunkInfo::new(&chunk, path.display().to_string()),
        references,
        created_at: chunk.created_at,
        updated_at: chunk.updated_at,
    };
    output.write(&data, || {
        format!(
            "Chunk: {}\nSize: {} bytes\nHash: {}\nReferences: {}\nPath: {}\n",
            data.chunk.id, data.chunk.size, data.chunk.hash, data.references, data.chunk.path
        )
    })?;

    Ok(result_code::SUCCESS)
}

fn cmd_verify(root: &Path, repair: bool, output: &OutputWriter) -> Result<u8> {
    let vault = open_vault(root)?;

    let report = vault
        .reconcile(repair)
        .with_context(|| "Failed to reconcile index with chunk files")?;

    let code = if report.is_clean() {
        result_code::SUCCESS
    } else {
        result_code::INCONSISTENT
    };

    let data = VerifyOutput {
        success: true,
        result_code: code,
        repair,
        report,
    };
    output.write(&data, || {
        let report = &data.report;
        let mut text = String::new();
        let _ = writeln!(text, "Checked {} chunks", report.chunks_checked);
        let findings = [
            ("Missing files", &report.missing),
            ("Size mismatches", &report.size_mismatch),
            ("Hash mismatches", &report.hash_mismatch),
            ("Orphan files", &report.orphans),
            ("Truncated", &report.truncated),
        ];
        for (label, ids) in findings {
            if !ids.is_empty() {
                let _ = writeln!(text, "{}: {}", label, id_list(ids));
            }
        }
        for path in &report.temp_files {
            let _ = writeln!(text, "Stale staging file: {}", path.display());
        }
        if data.repair {
            let _ = writeln!(text, "Removed {} orphan files", report.orphans_removed);
            let _ = writeln!(
                text,
                "Removed {} staging files",
                report.temp_files_removed
            );
            let _ = writeln!(text, "Freed {} bytes", report.bytes_freed);
        }
        let _ = writeln!(
            text,
            "{}",
            if report.is_clean() {
                "Vault is consistent"
            } else {
                "Vault has inconsistencies"
            }
        );
        text
    })?;

    Ok(code)
}
