//! Tumor/normal pair manifest loading

use crate::sample::SampleIndex;
use crate::utils::{read_nonblank_lines, validate_file_exists};
use crate::{SamplePair, TnflowError, TnflowResult};
use rayon::prelude::*;
use std::path::Path;

/// 1-based inclusive slice of manifest lines; `end: None` runs to the end of the file
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LineRange {
    pub start: usize,
    pub end: Option<usize>,
}

impl LineRange {
    pub fn new(start: usize, end: Option<usize>) -> TnflowResult<Self> {
        if start == 0 {
            return Err(TnflowError::InvalidConfig(
                "line range is 1-based, start must be at least 1".to_string(),
            ));
        }
        if let Some(end) = end {
            if end < start {
                return Err(TnflowError::InvalidConfig(format!(
                    "line range end {} is before start {}",
                    end, start
                )));
            }
        }
        Ok(Self { start, end })
    }

    pub fn contains(&self, line: usize) -> bool {
        line >= self.start && self.end.map_or(true, |end| line <= end)
    }
}

/// A manifest line that named two known samples
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PairEntry {
    pub line: usize,
    pub tumor: String,
    pub normal: String,
}

/// Split a manifest line into `(tumor, normal)`; `None` unless there are exactly two tokens.
pub fn parse_pair_line(line: &str) -> Option<(&str, &str)> {
    let mut tokens = line.split_whitespace();
    match (tokens.next(), tokens.next(), tokens.next()) {
        (Some(tumor), Some(normal), None) => Some((tumor, normal)),
        _ => None,
    }
}

/// Apply the line range and keep lines naming two known samples, in manifest order.
///
/// `lines` are the non-blank manifest lines; line numbers count from 1 over them.
pub fn select_pairs(
    lines: &[String],
    range: Option<&LineRange>,
    samples: &SampleIndex,
) -> Vec<PairEntry> {
    let mut entries = Vec::new();

    for (i, text) in lines.iter().enumerate() {
        let line = i + 1;
        if range.map_or(false, |r| !r.contains(line)) {
            continue;
        }

        let (tumor, normal) = match parse_pair_line(text) {
            Some(tokens) => tokens,
            None => {
                log::warn!(
                    "Skipping manifest line {}: expected 2 fields, got {} ({:?})",
                    line,
                    text.split_whitespace().count(),
                    text
                );
                continue;
            }
        };

        let missing: Vec<&str> = [tumor, normal]
            .into_iter()
            .filter(|s| !samples.contains(s))
            .collect();
        if !missing.is_empty() {
            log::warn!(
                "Skipping manifest line {}: no BAM for sample(s) {}",
                line,
                missing.join(", ")
            );
            continue;
        }

        entries.push(PairEntry {
            line,
            tumor: tumor.to_string(),
            normal: normal.to_string(),
        });
    }

    entries
}

/// Load the pair manifest and resolve both BAMs of every surviving pair.
///
/// A missing manifest and an empty result are both fatal.
pub fn load_pairs<P: AsRef<Path>>(
    manifest: P,
    range: Option<&LineRange>,
    samples: &SampleIndex,
) -> TnflowResult<Vec<SamplePair>> {
    let manifest = manifest.as_ref();
    validate_file_exists(manifest)?;

    let lines = read_nonblank_lines(manifest)?;
    log::info!("Read {} non-blank lines from {}", lines.len(), manifest.display());
    if let Some(range) = range {
        if range.start > lines.len() {
            log::warn!(
                "Line range starts at {} but the manifest has {} lines",
                range.start,
                lines.len()
            );
        }
    }

    let entries = select_pairs(&lines, range, samples);
    if entries.is_empty() {
        return Err(TnflowError::NoValidPairs(manifest.display().to_string()));
    }

    let pairs = entries
        .par_iter()
        .map(|entry| -> TnflowResult<SamplePair> {
            let prefix = format!("{}_{}", entry.tumor, entry.normal);
            let tumor_bam = samples
                .bam_file(&entry.tumor)
                .map_err(|e| TnflowError::for_pair(prefix.clone(), e))?;
            let normal_bam = samples
                .bam_file(&entry.normal)
                .map_err(|e| TnflowError::for_pair(prefix.clone(), e))?;
            Ok(SamplePair {
                tumor: entry.tumor.clone(),
                normal: entry.normal.clone(),
                tumor_bam,
                normal_bam,
                line: entry.line,
            })
        })
        .collect::<TnflowResult<Vec<_>>>()?;

    log::info!("Loaded {} tumor/normal pairs", pairs.len());
    Ok(pairs)
}
