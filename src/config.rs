//! Run configuration loaded from a YAML settings document

use crate::graph::UnitKind;
use crate::pairs::LineRange;
use crate::utils::validate_file_readable;
use crate::{TnflowError, TnflowResult};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

/// Immutable settings for one planning run
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// Directories scanned for BAM files, in priority order
    pub input_dirs: Vec<PathBuf>,
    pub output_dir: PathBuf,
    /// Only BAM files whose name contains this substring are used
    #[serde(default)]
    pub filter: String,
    pub reference: ReferenceConfig,
    pub pairs: PairsConfig,
    #[serde(default)]
    pub precomputed: PrecomputedConfig,
    #[serde(default)]
    pub resources: BTreeMap<UnitKind, ResourceOverride>,
    /// Command prefix used to submit each unit, e.g. to a batch queue
    #[serde(default)]
    pub launcher: Option<String>,
    #[serde(default)]
    pub tools: ToolPaths,
    #[serde(default)]
    pub check_bam_headers: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ReferenceConfig {
    pub genome: PathBuf,
    pub germline_resource: PathBuf,
    pub panel_of_normals: PathBuf,
    /// Biallelic common-variant sites, needed to estimate contamination in-graph
    #[serde(default)]
    pub common_variants: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PairsConfig {
    pub manifest: PathBuf,
    #[serde(default)]
    pub start: Option<usize>,
    #[serde(default)]
    pub end: Option<usize>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PrecomputedConfig {
    #[serde(default)]
    pub enabled: bool,
    /// Manifests are read from `<base>_<artifact>_paths.txt`
    #[serde(default)]
    pub base: Option<PathBuf>,
}

/// External executables, looked up on PATH unless given as paths
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ToolPaths {
    pub gatk: PathBuf,
    pub bcftools: PathBuf,
    pub tabix: PathBuf,
    pub tar: PathBuf,
}

impl Default for ToolPaths {
    fn default() -> Self {
        Self {
            gatk: PathBuf::from("gatk"),
            bcftools: PathBuf::from("bcftools"),
            tabix: PathBuf::from("tabix"),
            tar: PathBuf::from("tar"),
        }
    }
}

/// Resource request of one unit
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Resources {
    pub threads: u32,
    pub mem_mb: u64,
    /// Wall-clock limit in minutes
    pub runtime: u64,
    /// Named execution environment
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub env: Option<String>,
}

impl Resources {
    pub const fn new(threads: u32, mem_mb: u64, runtime: u64) -> Self {
        Self {
            threads,
            mem_mb,
            runtime,
            env: None,
        }
    }

    /// Java heap for GATK tools, leaving headroom for the JVM itself
    pub fn java_heap_mb(&self) -> u64 {
        (self.mem_mb / 5 * 4).max(256)
    }
}

/// Per-unit override of the default resources
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ResourceOverride {
    pub threads: Option<u32>,
    pub mem_mb: Option<u64>,
    pub runtime: Option<u64>,
    pub env: Option<String>,
}

impl ResourceOverride {
    pub fn apply(&self, base: Resources) -> Resources {
        Resources {
            threads: self.threads.unwrap_or(base.threads),
            mem_mb: self.mem_mb.unwrap_or(base.mem_mb),
            runtime: self.runtime.unwrap_or(base.runtime),
            env: self.env.clone().or(base.env),
        }
    }
}

/// Built-in resource request of each unit kind
pub fn default_resources(kind: UnitKind) -> Resources {
    match kind {
        UnitKind::PileupSummaries => Resources::new(1, 8000, 240),
        UnitKind::CalculateContamination => Resources::new(1, 4000, 60),
        UnitKind::Mutect2 => Resources::new(4, 16000, 1440),
        UnitKind::MergeVcfs => Resources::new(1, 4000, 60),
        UnitKind::MergeStats => Resources::new(1, 2000, 30),
        UnitKind::MergeF1r2 => Resources::new(1, 2000, 60),
        UnitKind::LearnOrientation => Resources::new(1, 16000, 240),
        UnitKind::Filter => Resources::new(1, 8000, 240),
    }
}

impl Config {
    /// Parse a YAML document without checking the filesystem
    pub fn from_yaml_str(text: &str) -> TnflowResult<Self> {
        Ok(serde_yaml::from_str(text)?)
    }

    /// Read, parse and validate a YAML settings file
    pub fn load<P: AsRef<Path>>(path: P) -> TnflowResult<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .map_err(|_| TnflowError::FileNotFound(path.to_string_lossy().to_string()))?;
        let config = Self::from_yaml_str(&text)?;
        config.validate()?;
        log::info!("Loaded configuration from {}", path.display());
        Ok(config)
    }

    /// Check everything that must hold before any unit is planned
    pub fn validate(&self) -> TnflowResult<()> {
        if self.input_dirs.is_empty() {
            return Err(TnflowError::InvalidConfig(
                "at least one input directory is required".to_string(),
            ));
        }
        if self.output_dir.as_os_str().is_empty() {
            return Err(TnflowError::InvalidConfig(
                "output_dir must not be empty".to_string(),
            ));
        }

        validate_file_readable(&self.reference.genome)?;
        validate_file_readable(&self.reference.germline_resource)?;
        validate_file_readable(&self.reference.panel_of_normals)?;

        if self.precomputed.enabled {
            if self.precomputed.base.is_none() {
                return Err(TnflowError::InvalidConfig(
                    "precomputed.base is required when precomputed mode is enabled".to_string(),
                ));
            }
        } else {
            match &self.reference.common_variants {
                Some(path) => validate_file_readable(path)?,
                None => {
                    return Err(TnflowError::InvalidConfig(
                        "reference.common_variants is required unless precomputed mode is enabled"
                            .to_string(),
                    ))
                }
            }
        }

        self.line_range()?;
        Ok(())
    }

    /// The manifest slice to process; `None` means every line
    pub fn line_range(&self) -> TnflowResult<Option<LineRange>> {
        match (self.pairs.start, self.pairs.end) {
            (None, None) => Ok(None),
            (start, end) => LineRange::new(start.unwrap_or(1), end).map(Some),
        }
    }

    /// Default resources of a unit kind with any configured override applied
    pub fn resources_for(&self, kind: UnitKind) -> Resources {
        let base = default_resources(kind);
        match self.resources.get(&kind) {
            Some(over) => over.apply(base),
            None => base,
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::fs::File;
    use tempfile::TempDir;

    /// Configuration rooted at `root` with existing, empty reference files
    pub(crate) fn test_config(root: &Path) -> Config {
        let reference = root.join("reference");
        std::fs::create_dir_all(&reference).unwrap();
        for name in ["genome.fa", "germline.vcf.gz", "pon.vcf.gz", "common.vcf.gz"] {
            File::create(reference.join(name)).unwrap();
        }
        Config {
            input_dirs: vec![root.join("bams")],
            output_dir: root.join("out"),
            filter: String::new(),
            reference: ReferenceConfig {
                genome: reference.join("genome.fa"),
                germline_resource: reference.join("germline.vcf.gz"),
                panel_of_normals: reference.join("pon.vcf.gz"),
                common_variants: Some(reference.join("common.vcf.gz")),
            },
            pairs: PairsConfig {
                manifest: root.join("pairs.txt"),
                start: None,
                end: None,
            },
            precomputed: PrecomputedConfig::default(),
            resources: BTreeMap::new(),
            launcher: None,
            tools: ToolPaths::default(),
            check_bam_headers: false,
        }
    }

    const YAML: &str = r#"
input_dirs:
  - /data/run1
  - /data/run2
output_dir: /results/mutect2
filter: recal
reference:
  genome: /ref/hs37d5.fa
  germline_resource: /ref/af-only-gnomad.vcf.gz
  panel_of_normals: /ref/pon.vcf.gz
pairs:
  manifest: /data/pairs.txt
  start: 2
  end: 3
precomputed:
  enabled: true
  base: /data/contamination_files_list
resources:
  mutect2:
    threads: 8
    env: gatk4
  filter:
    mem_mb: 12000
launcher: "bsub -K -n {threads} -M {mem_mb} -W {runtime}"
tools:
  gatk: /opt/gatk/gatk
"#;

    #[test]
    fn test_parse_yaml() {
        let config = Config::from_yaml_str(YAML).unwrap();
        assert_eq!(config.input_dirs.len(), 2);
        assert_eq!(config.filter, "recal");
        assert_eq!(config.pairs.start, Some(2));
        assert!(config.precomputed.enabled);
        assert_eq!(config.tools.gatk, PathBuf::from("/opt/gatk/gatk"));
        assert_eq!(config.tools.bcftools, PathBuf::from("bcftools"));
        assert!(config.reference.common_variants.is_none());
        assert!(!config.check_bam_headers);

        let range = config.line_range().unwrap().unwrap();
        assert_eq!((range.start, range.end), (2, Some(3)));
    }

    #[test]
    fn test_resources_override() {
        let config = Config::from_yaml_str(YAML).unwrap();

        let mutect = config.resources_for(UnitKind::Mutect2);
        assert_eq!(mutect.threads, 8);
        assert_eq!(mutect.mem_mb, default_resources(UnitKind::Mutect2).mem_mb);
        assert_eq!(mutect.env.as_deref(), Some("gatk4"));

        let filter = config.resources_for(UnitKind::Filter);
        assert_eq!(filter.mem_mb, 12000);
        assert_eq!(filter.threads, 1);

        assert_eq!(
            config.resources_for(UnitKind::MergeStats),
            default_resources(UnitKind::MergeStats)
        );
    }

    #[test]
    fn test_unknown_field_rejected() {
        let text = YAML.replace("filter: recal", "filtr: recal");
        assert!(matches!(
            Config::from_yaml_str(&text),
            Err(TnflowError::Yaml(_))
        ));
    }

    #[test]
    fn test_unknown_unit_rejected() {
        let text = YAML.replace("  filter:\n    mem_mb", "  filtering:\n    mem_mb");
        assert!(Config::from_yaml_str(&text).is_err());
    }

    #[test]
    fn test_validate() {
        let dir = TempDir::new().unwrap();
        let config = test_config(dir.path());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_missing_reference() {
        let dir = TempDir::new().unwrap();
        let mut config = test_config(dir.path());
        config.reference.panel_of_normals = dir.path().join("missing_pon.vcf.gz");
        assert!(matches!(config.validate(), Err(TnflowError::FileNotFound(_))));
    }

    #[test]
    fn test_validate_precomputed_requirements() {
        let dir = TempDir::new().unwrap();
        let mut config = test_config(dir.path());

        config.reference.common_variants = None;
        assert!(matches!(config.validate(), Err(TnflowError::InvalidConfig(_))));

        config.precomputed.enabled = true;
        assert!(matches!(config.validate(), Err(TnflowError::InvalidConfig(_))));

        config.precomputed.base = Some(dir.path().join("files"));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_line_range() {
        let dir = TempDir::new().unwrap();
        let mut config = test_config(dir.path());

        config.pairs.end = Some(4);
        assert_eq!(config.line_range().unwrap().unwrap().start, 1);

        config.pairs.start = Some(5);
        assert!(config.validate().is_err());

        config.pairs.start = Some(0);
        config.pairs.end = None;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_java_heap() {
        assert_eq!(Resources::new(1, 10000, 10).java_heap_mb(), 8000);
        assert_eq!(Resources::new(1, 100, 10).java_heap_mb(), 256);
        assert_eq!(
            Resources::new(1, u64::MAX, 10).java_heap_mb(),
            u64::MAX / 5 * 4
        );
    }
}
