//! Output formatting for CLI commands.
//!
//! Provides abstraction layer for outputting results in text or JSON format.

use anyhow::Result;
use chrono::{DateTime, Utc};
use chunkvault_core::{Chunk, Hash, Object, ReconcileReport};
use serde::Serialize;
use std::io::{self, Write};

/// Output format selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputFormat {
    Text,
    Json,
}

/// Writer for command output with format abstraction.
pub struct OutputWriter {
    format: OutputFormat,
    stdout: io::Stdout,
}

impl OutputWriter {
    /// Create a new OutputWriter.
    pub fn new(json: bool) -> Self {
        Self {
            format: if json {
                OutputFormat::Json
            } else {
                OutputFormat::Text
            },
            stdout: io::stdout(),
        }
    }

    /// Write output using the configured format.
    ///
    /// The `data` parameter must be a serializable struct that includes
    /// `success: bool` and `result_code: u8` fields.
    ///
    /// The `text_fn` closure is called only in text mode to generate the
    /// human-readable output.
    pub fn write<T: Serialize>(&self, data: &T, text_fn: impl FnOnce() -> String) -> Result<()> {
        match self.format {
            OutputFormat::Json => {
                let json = serde_json::to_string_pretty(data)?;
                writeln!(&self.stdout, "{}", json)?;
            }
            OutputFormat::Text => {
                let text = text_fn();
                if !text.is_empty() {
                    write!(&self.stdout, "{}", text)?;
                }
            }
        }
        Ok(())
    }

    /// Write an error message to stderr.
    ///
    /// In JSON mode, writes a JSON error object with success=false.
    /// In text mode, writes the error message with its context chain.
    pub fn write_error(&self, error: &anyhow::Error, result_code: u8) {
        match self.format {
            OutputFormat::Json => {
                let error_output = ErrorOutput {
                    success: false,
                    result_code,
                    error: format!("{:#}", error),
                };
                if let Ok(json) = serde_json::to_string_pretty(&error_output) {
                    let _ = writeln!(io::stderr(), "{}", json);
                }
            }
            OutputFormat::Text => {
                let _ = writeln!(io::stderr(), "Error: {:#}", error);
            }
        }
    }
}

/// Result codes shared by text and JSON mode.
pub mod result_code {
    pub const SUCCESS: u8 = 0;
    pub const FAILURE: u8 = 1;
    /// `verify` found inconsistencies it did not repair.
    pub const INCONSISTENT: u8 = 2;
}

// ============================================================================
// Data Transfer Objects (DTOs) for JSON output
// ============================================================================

/// Error output structure.
#[derive(Debug, Serialize)]
pub struct ErrorOutput {
    pub success: bool,
    pub result_code: u8,
    pub error: String,
}

/// Output for `init` command.
#[derive(Debug, Serialize)]
pub struct InitOutput {
    pub success: bool,
    pub result_code: u8,
    pub root: String,
    pub algorithm: String,
}

/// Object metadata as printed by `put`, `append`, `stat` and `ls`.
#[derive(Debug, Clone, Serialize)]
pub struct ObjectInfo {
    pub id: u64,
    pub size: u64,
    pub hash: Hash,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl From<Object> for ObjectInfo {
    fn from(object: Object) -> Self {
        Self {
            id: object.id,
            size: object.size,
            hash: object.hash,
            created_at: object.created_at,
            updated_at: object.updated_at,
        }
    }
}

/// Chunk metadata as printed by `stat` and `chunk`.
#[derive(Debug, Clone, Serialize)]
pub struct ChunkInfo {
    pub id: u64,
    pub size: usize,
    pub hash: Hash,
    pub path: String,
}

impl ChunkInfo {
    pub fn new(chunk: &Chunk, path: String) -> Self {
        Self {
            id: chunk.id,
            size: chunk.size,
            hash: chunk.hash,
            path,
        }
    }
}

/// Output for `put` and `append` commands.
#[derive(Debug, Serialize)]
pub struct ObjectOutput {
    pub success: bool,
    pub result_code: u8,
    #[serde(flatten)]
    pub object: ObjectInfo,
}

/// Output for `stat` command.
#[derive(Debug, Serialize)]
pub struct StatOutput {
    pub success: bool,
    pub result_code: u8,
    #[serde(flatten)]
    pub object: ObjectInfo,
    pub chunks: Vec<ChunkInfo>,
}

/// Output for `ls` command.
#[derive(Debug, Serialize)]
pub struct LsOutput {
    pub success: bool,
    pub result_code: u8,
    pub objects: Vec<ObjectInfo>,
}

/// Output for `rm` command.
#[derive(Debug, Serialize)]
pub struct RmOutput {
    pub success: bool,
    pub result_code: u8,
    pub id: u64,
}

/// Output for `chunk` command.
#[derive(Debug, Serialize)]
pub struct ChunkOutput {
    pub success: bool,
    pub result_code: u8,
    #[serde(flatten)]
    pub chunk: ChunkInfo,
    pub references: u64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Output for `verify` command.
#[derive(Debug, Serialize)]
pub struct VerifyOutput {
    pub success: bool,
    pub result_code: u8,
    pub repair: bool,
    #[serde(flatten)]
    pub report: ReconcileReport,
}

/// Render a list of ids for text output.
pub fn id_list(ids: &[u64]) -> String {
    ids.iter()
        .map(|id| id.to_string())
        .collect::<Vec<_>>()
        .join(", ")
}
