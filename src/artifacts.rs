//! Precomputed contamination artifacts: discovery, path manifests and lookup

use crate::sample::strip_suffix;
use crate::utils::{append_path, ensure_parent_dirs, file_name_str, read_nonblank_lines};
use crate::{SamplePair, TnflowError, TnflowResult};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

/// Kinds of per-sample tables produced by the contamination stage
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ArtifactType {
    #[serde(rename = "getpileupsummaries")]
    PileupSummaries,
    #[serde(rename = "calculatecontamination")]
    Contamination,
    Segments,
}

impl ArtifactType {
    pub const ALL: [ArtifactType; 3] = [
        ArtifactType::PileupSummaries,
        ArtifactType::Contamination,
        ArtifactType::Segments,
    ];

    pub fn name(self) -> &'static str {
        match self {
            ArtifactType::PileupSummaries => "getpileupsummaries",
            ArtifactType::Contamination => "calculatecontamination",
            ArtifactType::Segments => "segments",
        }
    }

    /// Tables the filter reads for the tumor of each pair
    pub const FILTER_TABLES: [ArtifactType; 2] =
        [ArtifactType::Contamination, ArtifactType::Segments];

    /// Filename suffix of the table, e.g. `_segments.table`
    pub fn file_suffix(self) -> String {
        format!("_{}.table", self.name())
    }

    /// `<base>_<name>_paths.txt`
    pub fn manifest_path(self, base: &Path) -> PathBuf {
        append_path(base, format!("_{}_paths.txt", self.name()))
    }

    /// Table filename of a sample, e.g. `T1_segments.table`
    pub fn table_name(self, sample: &str) -> String {
        format!("{}{}", sample, self.file_suffix())
    }
}

impl fmt::Display for ArtifactType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Sample identifier of an artifact table, `None` if the filename lacks the type suffix.
pub fn sample_from_artifact_path(path: &Path, artifact: ArtifactType) -> Option<String> {
    let file_name = file_name_str(path);
    let suffix = artifact.file_suffix();
    let sample = strip_suffix(&file_name, &suffix);
    if sample.len() == file_name.len() || sample.is_empty() {
        None
    } else {
        Some(sample.to_string())
    }
}

/// (artifact type, sample) -> path, read once from the path manifests.
/// A type without an entry in `manifests` had no manifest file at load time.
#[derive(Debug, Clone, Default)]
pub struct PrecomputedArtifactIndex {
    manifests: HashMap<ArtifactType, BTreeMap<String, PathBuf>>,
}

impl PrecomputedArtifactIndex {
    /// Read `<base>_<type>_paths.txt` for every artifact type.
    /// Absent manifests are logged and leave that type unloaded.
    pub fn load<P: AsRef<Path>>(base: P) -> TnflowResult<Self> {
        let base = base.as_ref();
        let mut index = Self::default();

        for artifact in ArtifactType::ALL {
            let manifest = artifact.manifest_path(base);
            if !manifest.is_file() {
                log::warn!(
                    "No {} manifest at {}, continuing without it",
                    artifact,
                    manifest.display()
                );
                continue;
            }
            let paths = read_nonblank_lines(&manifest)?;
            index.insert_paths(artifact, paths.iter().map(PathBuf::from));
            log::info!(
                "Loaded {} {} entries from {}",
                index.len(artifact),
                artifact,
                manifest.display()
            );
        }

        Ok(index)
    }

    /// Mark `artifact` as loaded and index the given table paths by sample
    pub fn insert_paths<I>(&mut self, artifact: ArtifactType, paths: I)
    where
        I: IntoIterator<Item = PathBuf>,
    {
        let entries = self.manifests.entry(artifact).or_default();
        for path in paths {
            match sample_from_artifact_path(&path, artifact) {
                Some(sample) => {
                    if let Some(previous) = entries.insert(sample.clone(), path) {
                        log::warn!(
                            "Several {} tables for sample {}, ignoring {}",
                            artifact,
                            sample,
                            previous.display()
                        );
                    }
                }
                None => log::warn!(
                    "Skipping {}: filename does not end in {}",
                    path.display(),
                    artifact.file_suffix()
                ),
            }
        }
    }

    pub fn is_loaded(&self, artifact: ArtifactType) -> bool {
        self.manifests.contains_key(&artifact)
    }

    pub fn len(&self, artifact: ArtifactType) -> usize {
        self.manifests.get(&artifact).map_or(0, BTreeMap::len)
    }

    /// Path of the `artifact` table of `sample`.
    ///
    /// Distinguishes a type whose manifest never loaded from a sample missing in a loaded manifest.
    pub fn lookup(&self, sample: &str, artifact: ArtifactType) -> TnflowResult<&Path> {
        let entries = self
            .manifests
            .get(&artifact)
            .ok_or(TnflowError::ArtifactManifestMissing { artifact })?;
        entries
            .get(sample)
            .map(PathBuf::as_path)
            .ok_or_else(|| TnflowError::ArtifactNotFound {
                artifact,
                sample: sample.to_string(),
            })
    }

    /// Every filter table lookup that fails for `pairs`, as `(pair prefix, error)`
    pub fn missing_for_pairs(&self, pairs: &[SamplePair]) -> Vec<(String, TnflowError)> {
        pairs
            .iter()
            .flat_map(|pair| {
                ArtifactType::FILTER_TABLES
                    .into_iter()
                    .filter_map(move |artifact| self.lookup(&pair.tumor, artifact).err())
                    .map(move |e| (pair.prefix(), e))
            })
            .collect()
    }
}

/// Artifact tables found under a directory, sorted per type
#[derive(Debug, Clone, Default)]
pub struct ArtifactSearch {
    pub files: BTreeMap<ArtifactType, Vec<PathBuf>>,
}

/// Recursively find `*_<type>.table` files under `search_dir`
pub fn find_artifact_files<P: AsRef<Path>>(search_dir: P) -> TnflowResult<ArtifactSearch> {
    let search_dir = search_dir.as_ref();
    if !search_dir.is_dir() {
        return Err(TnflowError::FileNotFound(search_dir.display().to_string()));
    }
    let dir_str = search_dir.to_str().ok_or_else(|| {
        TnflowError::InvalidConfig(format!("Non UTF-8 directory: {}", search_dir.display()))
    })?;
    let escaped = glob::Pattern::escape(dir_str);

    let mut search = ArtifactSearch::default();
    for artifact in ArtifactType::ALL {
        let pattern = format!("{}/**/*{}", escaped, artifact.file_suffix());
        let mut found = Vec::new();
        for entry in glob::glob(&pattern)? {
            let path = entry.map_err(|e| TnflowError::Io(e.into_error()))?;
            if path.is_file() {
                found.push(path);
            }
        }
        found.sort();
        log::info!("Found {} {} files", found.len(), artifact);
        search.files.insert(artifact, found);
    }
    Ok(search)
}

impl ArtifactSearch {
    pub fn files(&self, artifact: ArtifactType) -> &[PathBuf] {
        self.files.get(&artifact).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Samples with at least one table of the given type
    pub fn samples(&self, artifact: ArtifactType) -> BTreeSet<String> {
        self.files(artifact)
            .iter()
            .filter_map(|p| sample_from_artifact_path(p, artifact))
            .collect()
    }

    pub fn all_samples(&self) -> BTreeSet<String> {
        ArtifactType::ALL
            .iter()
            .flat_map(|&a| self.samples(a))
            .collect()
    }

    /// For each sample lacking some artifact type, the types it lacks
    pub fn missing_by_sample(&self) -> BTreeMap<String, Vec<ArtifactType>> {
        let per_type: Vec<(ArtifactType, BTreeSet<String>)> = ArtifactType::ALL
            .iter()
            .map(|&a| (a, self.samples(a)))
            .collect();

        let mut missing = BTreeMap::new();
        for sample in self.all_samples() {
            let absent: Vec<ArtifactType> = per_type
                .iter()
                .filter(|(_, samples)| !samples.contains(&sample))
                .map(|(a, _)| *a)
                .collect();
            if !absent.is_empty() {
                missing.insert(sample, absent);
            }
        }
        missing
    }

    /// Write one path-per-line manifest per type, `<base>_<type>_paths.txt`, plus
    /// `<base>_all_paths.txt` with every type in a commented section.
    /// A trailing `.txt` or `.json` on `base` is dropped first.
    pub fn write_manifests<P: AsRef<Path>>(&self, base: P) -> TnflowResult<Vec<PathBuf>> {
        let base = manifest_base(base.as_ref());
        ensure_parent_dirs(&base)?;
        let mut written = Vec::new();

        for artifact in ArtifactType::ALL {
            let path = artifact.manifest_path(&base);
            let mut writer = BufWriter::new(File::create(&path)?);
            for file in self.files(artifact) {
                writeln!(writer, "{}", file.display())?;
            }
            writer.flush()?;
            log::info!(
                "Wrote {} {} paths to {}",
                self.files(artifact).len(),
                artifact,
                path.display()
            );
            written.push(path);
        }

        let all_path = append_path(&base, "_all_paths.txt");
        let mut writer = BufWriter::new(File::create(&all_path)?);
        writeln!(writer, "# All contamination files")?;
        for artifact in ArtifactType::ALL {
            writeln!(writer, "# {} FILES", artifact.name().to_uppercase())?;
            for file in self.files(artifact) {
                writeln!(writer, "{}", file.display())?;
            }
            writeln!(writer)?;
        }
        writer.flush()?;
        written.push(all_path);

        Ok(written)
    }

    /// Link every found table into `target_dir` by absolute path, replacing existing entries.
    /// Returns the number of links created.
    #[cfg(unix)]
    pub fn create_symlinks<P: AsRef<Path>>(&self, target_dir: P) -> TnflowResult<usize> {
        let target_dir = target_dir.as_ref();
        std::fs::create_dir_all(target_dir)?;

        let mut created = 0;
        for artifact in ArtifactType::ALL {
            for file in self.files(artifact) {
                let link = target_dir.join(file_name_str(file));
                if link.symlink_metadata().is_ok() {
                    std::fs::remove_file(&link)?;
                }
                let source = std::fs::canonicalize(file)?;
                std::os::unix::fs::symlink(&source, &link)?;
                log::debug!("Linked {} -> {}", link.display(), source.display());
                created += 1;
            }
        }
        Ok(created)
    }

    #[cfg(not(unix))]
    pub fn create_symlinks<P: AsRef<Path>>(&self, _target_dir: P) -> TnflowResult<usize> {
        Err(TnflowError::InvalidConfig(
            "symbolic links are only supported on unix".to_string(),
        ))
    }
}

fn manifest_base(base: &Path) -> PathBuf {
    let text = base.to_string_lossy();
    let text = strip_suffix(&text, ".txt");
    PathBuf::from(strip_suffix(text, ".json"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use std::io::Write;
    use tempfile::TempDir;

    fn write_manifest(path: &Path, lines: &[&str]) {
        let mut file = File::create(path).unwrap();
        for line in lines {
            writeln!(file, "{}", line).unwrap();
        }
    }

    #[test]
    fn test_artifact_names() {
        assert_eq!(ArtifactType::Segments.file_suffix(), "_segments.table");
        assert_eq!(
            ArtifactType::Contamination.manifest_path(Path::new("/run/files")),
            PathBuf::from("/run/files_calculatecontamination_paths.txt")
        );
        assert_eq!(
            ArtifactType::PileupSummaries.table_name("T1"),
            "T1_getpileupsummaries.table"
        );
    }

    #[test]
    fn test_sample_from_artifact_path() {
        assert_eq!(
            sample_from_artifact_path(
                Path::new("/x/T1_calculatecontamination.table"),
                ArtifactType::Contamination
            ),
            Some("T1".to_string())
        );
        assert_eq!(
            sample_from_artifact_path(Path::new("/x/T1_segments.table"), ArtifactType::Contamination),
            None
        );
        assert_eq!(
            sample_from_artifact_path(Path::new("/x/_segments.table"), ArtifactType::Segments),
            None
        );
    }

    #[test]
    fn test_load_and_lookup() {
        let dir = TempDir::new().unwrap();
        let base = dir.path().join("files");
        write_manifest(
            &ArtifactType::Contamination.manifest_path(&base),
            &[
                "/c/T1_calculatecontamination.table",
                "",
                "/c/T2_calculatecontamination.table",
                "/c/unrelated.txt",
            ],
        );
        write_manifest(
            &ArtifactType::Segments.manifest_path(&base),
            &["/c/T1_segments.table"],
        );

        let index = PrecomputedArtifactIndex::load(&base).unwrap();
        assert!(index.is_loaded(ArtifactType::Contamination));
        assert!(index.is_loaded(ArtifactType::Segments));
        assert!(!index.is_loaded(ArtifactType::PileupSummaries));
        assert_eq!(index.len(ArtifactType::Contamination), 2);

        assert_eq!(
            index.lookup("T2", ArtifactType::Contamination).unwrap(),
            Path::new("/c/T2_calculatecontamination.table")
        );
        assert_eq!(
            index.lookup("T1", ArtifactType::Segments).unwrap(),
            Path::new("/c/T1_segments.table")
        );
    }

    #[test]
    fn test_lookup_missing_manifest_vs_missing_sample() {
        let dir = TempDir::new().unwrap();
        let base = dir.path().join("files");
        write_manifest(
            &ArtifactType::Segments.manifest_path(&base),
            &["/c/T1_segments.table"],
        );
        let index = PrecomputedArtifactIndex::load(&base).unwrap();

        match index.lookup("T1", ArtifactType::Contamination) {
            Err(TnflowError::ArtifactManifestMissing { artifact }) => {
                assert_eq!(artifact, ArtifactType::Contamination)
            }
            other => panic!("Expected ArtifactManifestMissing, got {:?}", other),
        }
        match index.lookup("T9", ArtifactType::Segments) {
            Err(TnflowError::ArtifactNotFound { artifact, sample }) => {
                assert_eq!(artifact, ArtifactType::Segments);
                assert_eq!(sample, "T9");
            }
            other => panic!("Expected ArtifactNotFound, got {:?}", other),
        }
    }

    #[test]
    fn test_empty_manifest_is_loaded() {
        let dir = TempDir::new().unwrap();
        let base = dir.path().join("files");
        write_manifest(&ArtifactType::Segments.manifest_path(&base), &[]);

        let index = PrecomputedArtifactIndex::load(&base).unwrap();
        assert!(index.is_loaded(ArtifactType::Segments));
        assert!(matches!(
            index.lookup("T1", ArtifactType::Segments),
            Err(TnflowError::ArtifactNotFound { .. })
        ));
    }

    #[test]
    fn test_missing_for_pairs() {
        let dir = TempDir::new().unwrap();
        let base = dir.path().join("files");
        write_manifest(
            &ArtifactType::Contamination.manifest_path(&base),
            &["/c/T1_calculatecontamination.table", "/c/T2_calculatecontamination.table"],
        );
        write_manifest(
            &ArtifactType::Segments.manifest_path(&base),
            &["/c/T1_segments.table"],
        );
        let index = PrecomputedArtifactIndex::load(&base).unwrap();
        let pairs = vec![
            crate::graph::tests::pair("T1", "N1", 1),
            crate::graph::tests::pair("T2", "N2", 2),
        ];

        let missing = index.missing_for_pairs(&pairs);
        assert_eq!(missing.len(), 1);
        assert_eq!(missing[0].0, "T2_N2");
        assert!(matches!(
            missing[0].1,
            TnflowError::ArtifactNotFound {
                artifact: ArtifactType::Segments,
                ..
            }
        ));
    }

    fn populate(root: &Path) {
        let a = root.join("batch1/T1");
        let b = root.join("batch2");
        fs::create_dir_all(&a).unwrap();
        fs::create_dir_all(&b).unwrap();
        for name in [
            "T1_getpileupsummaries.table",
            "T1_calculatecontamination.table",
            "T1_segments.table",
        ] {
            File::create(a.join(name)).unwrap();
        }
        for name in ["T2_getpileupsummaries.table", "T2_segments.table", "T2.log"] {
            File::create(b.join(name)).unwrap();
        }
    }

    #[test]
    fn test_find_artifact_files() {
        let dir = TempDir::new().unwrap();
        populate(dir.path());

        let search = find_artifact_files(dir.path()).unwrap();
        assert_eq!(search.files(ArtifactType::PileupSummaries).len(), 2);
        assert_eq!(search.files(ArtifactType::Contamination).len(), 1);
        assert_eq!(search.files(ArtifactType::Segments).len(), 2);
        assert_eq!(
            search.all_samples().into_iter().collect::<Vec<_>>(),
            vec!["T1".to_string(), "T2".to_string()]
        );

        let missing = search.missing_by_sample();
        assert_eq!(missing.len(), 1);
        assert_eq!(missing["T2"], vec![ArtifactType::Contamination]);
    }

    #[test]
    fn test_find_artifact_files_missing_dir() {
        assert!(matches!(
            find_artifact_files("/nonexistent/contamination"),
            Err(TnflowError::FileNotFound(_))
        ));
    }

    #[test]
    fn test_written_manifests_load_back() {
        let dir = TempDir::new().unwrap();
        populate(dir.path());
        let search = find_artifact_files(dir.path()).unwrap();

        let out = dir.path().join("lists/contamination_files_list.txt");
        let written = search.write_manifests(&out).unwrap();
        assert_eq!(written.len(), 4);

        let base = dir.path().join("lists/contamination_files_list");
        let all = fs::read_to_string(append_path(&base, "_all_paths.txt")).unwrap();
        assert!(all.starts_with("# All contamination files\n"));
        assert!(all.contains("# SEGMENTS FILES\n"));

        let index = PrecomputedArtifactIndex::load(&base).unwrap();
        assert_eq!(index.len(ArtifactType::Segments), 2);
        let table = index.lookup("T1", ArtifactType::Contamination).unwrap();
        assert!(table.ends_with("batch1/T1/T1_calculatecontamination.table"));
        assert!(matches!(
            index.lookup("T2", ArtifactType::Contamination),
            Err(TnflowError::ArtifactNotFound { .. })
        ));
    }

    #[cfg(unix)]
    #[test]
    fn test_create_symlinks() {
        let dir = TempDir::new().unwrap();
        populate(dir.path());
        let search = find_artifact_files(dir.path()).unwrap();

        let links = dir.path().join("links");
        assert_eq!(search.create_symlinks(&links).unwrap(), 5);
        // Re-linking replaces the existing entries
        assert_eq!(search.create_symlinks(&links).unwrap(), 5);

        let link = links.join("T2_segments.table");
        assert!(link.symlink_metadata().unwrap().file_type().is_symlink());
        assert_eq!(
            fs::read_link(&link).unwrap(),
            fs::canonicalize(dir.path().join("batch2/T2_segments.table")).unwrap()
        );
    }
}
