//! # tnflow - tumor/normal Mutect2 task-graph planner
//!
//! Resolves tumor/normal BAM pairs from a manifest, indexes precomputed
//! contamination artifacts and declares the per-chromosome Mutect2 task graph
//! that an external scheduler (GNU make, or anything reading the JSON plan)
//! executes.

pub mod artifacts;
pub mod bam;
pub mod command;
pub mod config;
pub mod export;
pub mod graph;
pub mod pairs;
pub mod sample;
pub mod utils;

use serde::Serialize;
use std::path::PathBuf;

pub use artifacts::ArtifactType;

/// Chromosomes every pair is called over, in canonical merge order.
pub const CHROMOSOMES: [&str; 25] = [
    "1", "2", "3", "4", "5", "6", "7", "8", "9", "10", "11", "12", "13", "14", "15", "16", "17",
    "18", "19", "20", "21", "22", "X", "Y", "MT",
];

/// A BAM file together with its resolved index
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BamFile {
    pub path: PathBuf,
    pub index: PathBuf,
}

impl BamFile {
    pub fn new(path: PathBuf, index: PathBuf) -> Self {
        Self { path, index }
    }

    pub fn file_name(&self) -> String {
        self.path
            .file_name()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_default()
    }
}

/// A tumor/normal pair taken from one manifest line
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SamplePair {
    pub tumor: String,
    pub normal: String,
    pub tumor_bam: BamFile,
    pub normal_bam: BamFile,
    /// 1-based position of the pair among the non-blank manifest lines
    pub line: usize,
}

impl SamplePair {
    /// Prefix shared by every output of this pair: `{tumor}_{normal}`.
    pub fn prefix(&self) -> String {
        format!("{}_{}", self.tumor, self.normal)
    }
}

/// Error types for the tnflow library
#[derive(Debug, thiserror::Error)]
pub enum TnflowError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("HTSlib error: {0}")]
    Htslib(#[from] rust_htslib::errors::Error),

    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Invalid glob pattern: {0}")]
    Pattern(#[from] glob::PatternError),

    #[error("File not found: {0}")]
    FileNotFound(String),

    #[error("BAM index not found for {bam}. Expected one of: {candidates}")]
    IndexNotFound { bam: String, candidates: String },

    #[error("Sample '{sample}' found twice: {first} and {second}")]
    DuplicateSample {
        sample: String,
        first: String,
        second: String,
    },

    #[error("No valid tumor/normal pairs in {0}")]
    NoValidPairs(String),

    #[error("No {artifact} manifest was loaded")]
    ArtifactManifestMissing { artifact: ArtifactType },

    #[error("No {artifact} entry for sample '{sample}'")]
    ArtifactNotFound {
        artifact: ArtifactType,
        sample: String,
    },

    #[error("Pair {pair}: {source}")]
    Pair {
        pair: String,
        #[source]
        source: Box<TnflowError>,
    },

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Invalid task graph: {0}")]
    InvalidGraph(String),
}

impl TnflowError {
    /// Attaches the responsible pair to an error.
    pub fn for_pair(pair: impl Into<String>, source: TnflowError) -> Self {
        TnflowError::Pair {
            pair: pair.into(),
            source: Box::new(source),
        }
    }
}

pub type TnflowResult<T> = Result<T, TnflowError>;
