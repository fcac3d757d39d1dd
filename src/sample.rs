//! Sample discovery and sample-name normalization

use crate::bam::open_bam_file;
use crate::config::Config;
use crate::utils::file_name_str;
use crate::{BamFile, TnflowError, TnflowResult};
use lazy_static::lazy_static;
use regex::Regex;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

lazy_static! {
    /// Trailing genome build token, e.g. `.b37`.
    static ref BUILD_SUFFIX: Regex = Regex::new(r"\.b[0-9]+$").unwrap();
}

/// Remove `suffix` from the end of `name`, if present.
pub fn strip_suffix<'a>(name: &'a str, suffix: &str) -> &'a str {
    name.strip_suffix(suffix).unwrap_or(name)
}

/// Remove a trailing `.b<digits>` token, if present.
pub fn strip_build_suffix(name: &str) -> &str {
    match BUILD_SUFFIX.find(name) {
        Some(m) => &name[..m.start()],
        None => name,
    }
}

/// Sample identifier of a BAM filename.
///
/// Strips `.bam`, then `.recal`, then `.b<digits>`, in that order.
/// `sample1.recal.b37.bam` becomes `sample1`.
pub fn sample_name(file_name: &str) -> String {
    let name = strip_suffix(file_name, ".bam");
    let name = strip_suffix(name, ".recal");
    strip_build_suffix(name).to_string()
}

/// Sample identifier of a BAM path
pub fn sample_name_from_path(path: &Path) -> String {
    sample_name(&file_name_str(path))
}

/// Maps sample identifiers to the BAM file they were discovered in
#[derive(Debug, Clone, Default)]
pub struct SampleIndex {
    samples: BTreeMap<String, PathBuf>,
}

impl SampleIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Scan every input directory, in configured order, for `*.bam` files
    /// whose filename contains the configured filter substring.
    pub fn discover(config: &Config) -> TnflowResult<Self> {
        let mut index = Self::new();

        for dir in &config.input_dirs {
            if !dir.is_dir() {
                log::warn!("Input directory {} does not exist, skipping", dir.display());
                continue;
            }
            let bams = list_bams(dir, &config.filter)?;
            log::info!("Found {} BAM files in {}", bams.len(), dir.display());
            for bam in bams {
                index.insert(sample_name_from_path(&bam), bam)?;
            }
        }

        if index.is_empty() {
            log::warn!("No BAM files found in the configured input directories");
        }
        Ok(index)
    }

    /// Register a BAM under a sample name. A name seen twice is an error.
    pub fn insert(&mut self, sample: String, bam: PathBuf) -> TnflowResult<()> {
        if let Some(first) = self.samples.get(&sample) {
            return Err(TnflowError::DuplicateSample {
                sample,
                first: first.display().to_string(),
                second: bam.display().to_string(),
            });
        }
        log::debug!("Sample {} -> {}", sample, bam.display());
        self.samples.insert(sample, bam);
        Ok(())
    }

    pub fn contains(&self, sample: &str) -> bool {
        self.samples.contains_key(sample)
    }

    pub fn path(&self, sample: &str) -> Option<&Path> {
        self.samples.get(sample).map(PathBuf::as_path)
    }

    /// BAM of a sample with its resolved index
    pub fn bam_file(&self, sample: &str) -> TnflowResult<BamFile> {
        let path = self
            .path(sample)
            .ok_or_else(|| TnflowError::FileNotFound(format!("BAM for sample '{}'", sample)))?;
        open_bam_file(path)
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }
}

/// Sorted `*.bam` files of a directory whose name contains `filter`
fn list_bams(dir: &Path, filter: &str) -> TnflowResult<Vec<PathBuf>> {
    let dir_str = dir.to_str().ok_or_else(|| {
        TnflowError::InvalidConfig(format!("Non UTF-8 input directory: {}", dir.display()))
    })?;
    let pattern = format!("{}/*.bam", glob::Pattern::escape(dir_str));

    let mut bams = Vec::new();
    for entry in glob::glob(&pattern)? {
        let path = entry.map_err(|e| TnflowError::Io(e.into_error()))?;
        if path.is_file() && file_name_str(&path).contains(filter) {
            bams.push(path);
        }
    }
    bams.sort();
    Ok(bams)
}
