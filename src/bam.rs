//! BAM index resolution and header checks

use crate::utils::append_path;
use crate::{BamFile, SamplePair, TnflowError, TnflowResult};
use rayon::prelude::*;
use rust_htslib::bam::{IndexedReader, Read};
use std::collections::{BTreeMap, HashSet};
use std::ffi::OsStr;
use std::path::{Path, PathBuf};

/// Index locations checked for a BAM, highest priority first:
/// `<path>.bai`, then `.bam` replaced by `.bai`, then `.bam` replaced by `.csi`.
pub fn index_candidates(bam_path: &Path) -> Vec<PathBuf> {
    let mut candidates = vec![append_path(bam_path, ".bai")];
    if bam_path.extension() == Some(OsStr::new("bam")) {
        candidates.push(bam_path.with_extension("bai"));
        candidates.push(bam_path.with_extension("csi"));
    }
    candidates
}

/// Find the index next to a BAM file. The first existing candidate wins.
pub fn resolve_bam_index<P: AsRef<Path>>(bam_path: P) -> TnflowResult<PathBuf> {
    let bam_path = bam_path.as_ref();
    let candidates = index_candidates(bam_path);

    if let Some(index) = candidates.iter().find(|c| c.is_file()) {
        log::debug!("Index for {}: {}", bam_path.display(), index.display());
        return Ok(index.clone());
    }

    Err(TnflowError::IndexNotFound {
        bam: bam_path.display().to_string(),
        candidates: candidates
            .iter()
            .map(|c| c.display().to_string())
            .collect::<Vec<_>>()
            .join(", "),
    })
}

/// Resolve the index of a BAM and bundle both paths
pub fn open_bam_file(bam_path: &Path) -> TnflowResult<BamFile> {
    let index = resolve_bam_index(bam_path)?;
    Ok(BamFile::new(bam_path.to_path_buf(), index))
}

/// Contigs from `expected` that are absent from the BAM header
pub fn missing_contigs(bam: &BamFile, expected: &[&str]) -> TnflowResult<Vec<String>> {
    let reader = IndexedReader::from_path_and_index(&bam.path, &bam.index)?;
    let present: HashSet<&[u8]> = reader.header().target_names().into_iter().collect();

    Ok(expected
        .iter()
        .filter(|contig| !present.contains(contig.as_bytes()))
        .map(|contig| contig.to_string())
        .collect())
}

/// Open every distinct BAM of the pairs and warn about absent contigs.
/// Returns the number of BAMs with at least one missing contig.
pub fn check_pair_contigs(pairs: &[SamplePair], expected: &[&str]) -> TnflowResult<usize> {
    let files: BTreeMap<&PathBuf, &BamFile> = pairs
        .iter()
        .flat_map(|p| [&p.tumor_bam, &p.normal_bam])
        .map(|b| (&b.path, b))
        .collect();
    let files: Vec<&BamFile> = files.into_values().collect();

    let missing: Vec<(&BamFile, Vec<String>)> = files
        .par_iter()
        .map(|bam| missing_contigs(bam, expected).map(|m| (*bam, m)))
        .collect::<TnflowResult<Vec<_>>>()?;

    let mut incomplete = 0;
    for (bam, contigs) in missing {
        if !contigs.is_empty() {
            incomplete += 1;
            log::warn!(
                "{} has no header entry for: {}",
                bam.path.display(),
                contigs.join(", ")
            );
        }
    }
    Ok(incomplete)
}
