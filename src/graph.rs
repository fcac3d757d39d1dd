//! Task graph: every unit of work, its input and output files, and the order they can run in

use crate::artifacts::{ArtifactType, PrecomputedArtifactIndex};
use crate::command::{self, FilterInputs, Mutect2Inputs, Script};
use crate::config::{Config, Resources};
use crate::utils::append_path;
use crate::{SamplePair, TnflowError, TnflowResult, CHROMOSOMES};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use std::fmt;
use std::path::{Path, PathBuf};

/// Kinds of work units, in pipeline order
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UnitKind {
    PileupSummaries,
    CalculateContamination,
    Mutect2,
    MergeVcfs,
    MergeStats,
    MergeF1r2,
    LearnOrientation,
    Filter,
}

impl UnitKind {
    pub const ALL: [UnitKind; 8] = [
        UnitKind::PileupSummaries,
        UnitKind::CalculateContamination,
        UnitKind::Mutect2,
        UnitKind::MergeVcfs,
        UnitKind::MergeStats,
        UnitKind::MergeF1r2,
        UnitKind::LearnOrientation,
        UnitKind::Filter,
    ];

    pub fn name(self) -> &'static str {
        match self {
            UnitKind::PileupSummaries => "pileup_summaries",
            UnitKind::CalculateContamination => "calculate_contamination",
            UnitKind::Mutect2 => "mutect2",
            UnitKind::MergeVcfs => "merge_vcfs",
            UnitKind::MergeStats => "merge_stats",
            UnitKind::MergeF1r2 => "merge_f1r2",
            UnitKind::LearnOrientation => "learn_orientation",
            UnitKind::Filter => "filter",
        }
    }
}

impl fmt::Display for UnitKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.name())
    }
}

/// Where every file of a run lives, relative to the output root
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutputLayout {
    root: PathBuf,
}

impl OutputLayout {
    pub const TEMP_DIR: &'static str = "temp_vcf";
    pub const FILTERED_DIR: &'static str = "Filtered_vcf";
    pub const CONTAMINATION_DIR: &'static str = "contamination";
    pub const LOG_DIR: &'static str = "logs";

    pub fn new<P: Into<PathBuf>>(root: P) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn temp_dir(&self) -> PathBuf {
        self.root.join(Self::TEMP_DIR)
    }

    pub fn filtered_dir(&self) -> PathBuf {
        self.root.join(Self::FILTERED_DIR)
    }

    pub fn contamination_dir(&self) -> PathBuf {
        self.root.join(Self::CONTAMINATION_DIR)
    }

    pub fn chrom_vcf(&self, prefix: &str, chrom: &str) -> PathBuf {
        self.temp_dir().join(format!("{}_{}.vcf.gz", prefix, chrom))
    }

    pub fn chrom_stats(&self, prefix: &str, chrom: &str) -> PathBuf {
        append_path(&self.chrom_vcf(prefix, chrom), ".stats")
    }

    pub fn chrom_f1r2(&self, prefix: &str, chrom: &str) -> PathBuf {
        self.temp_dir().join(format!("{}_{}.f1r2.tar.gz", prefix, chrom))
    }

    pub fn f1r2_scratch(&self, prefix: &str) -> PathBuf {
        self.temp_dir().join(format!("{}_f1r2", prefix))
    }

    pub fn merged_vcf(&self, prefix: &str) -> PathBuf {
        self.root.join(format!("{}.vcf.gz", prefix))
    }

    pub fn merged_vcf_index(&self, prefix: &str) -> PathBuf {
        append_path(&self.merged_vcf(prefix), ".tbi")
    }

    pub fn merged_stats(&self, prefix: &str) -> PathBuf {
        append_path(&self.merged_vcf(prefix), ".stats")
    }

    pub fn merged_f1r2(&self, prefix: &str) -> PathBuf {
        self.root.join(format!("{}.f1r2.tar.gz", prefix))
    }

    pub fn orientation_model(&self, prefix: &str) -> PathBuf {
        self.root.join(format!("{}.read-orientation-model.tar.gz", prefix))
    }

    pub fn filtered_vcf(&self, prefix: &str) -> PathBuf {
        self.filtered_dir().join(format!("{}.filtered.vcf.gz", prefix))
    }

    pub fn pileup_table(&self, sample: &str) -> PathBuf {
        self.contamination_dir()
            .join(ArtifactType::PileupSummaries.table_name(sample))
    }

    pub fn contamination_table(&self, prefix: &str) -> PathBuf {
        self.contamination_dir()
            .join(ArtifactType::Contamination.table_name(prefix))
    }

    pub fn segments_table(&self, prefix: &str) -> PathBuf {
        self.contamination_dir()
            .join(ArtifactType::Segments.table_name(prefix))
    }

    pub fn log(&self, kind: UnitKind, id: &str) -> PathBuf {
        self.root
            .join(Self::LOG_DIR)
            .join(kind.name())
            .join(format!("{}.log", id))
    }
}

/// One unit of work: a shell command reading `inputs` and writing `outputs`
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TaskUnit {
    pub id: String,
    pub kind: UnitKind,
    /// Pair prefix, or sample name for per-sample units
    pub scope: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub chromosome: Option<String>,
    pub inputs: Vec<PathBuf>,
    pub outputs: Vec<PathBuf>,
    pub log: PathBuf,
    pub resources: Resources,
    pub command: String,
}

/// The complete set of units for a run, with producers indexed by output path
#[derive(Debug, Clone)]
pub struct TaskGraph {
    layout: OutputLayout,
    units: Vec<TaskUnit>,
    by_id: HashMap<String, usize>,
    producers: HashMap<PathBuf, usize>,
}

/// Contamination and segmentation tables handed to the filter of one pair
struct FilterTables {
    contamination: PathBuf,
    segments: PathBuf,
}

impl TaskGraph {
    fn empty(layout: OutputLayout) -> Self {
        Self {
            layout,
            units: Vec::new(),
            by_id: HashMap::new(),
            producers: HashMap::new(),
        }
    }

    /// Declare every unit for the pairs.
    ///
    /// With precomputed mode enabled the filter reads contamination and segmentation tables
    /// from `artifacts`, keyed by tumor sample. Otherwise pileup and contamination units
    /// are added to the graph.
    pub fn build(
        config: &Config,
        pairs: &[SamplePair],
        artifacts: Option<&PrecomputedArtifactIndex>,
    ) -> TnflowResult<Self> {
        let mut graph = Self::empty(OutputLayout::new(&config.output_dir));
        let mut seen_pairs: HashMap<String, &SamplePair> = HashMap::new();

        for pair in pairs {
            let prefix = pair.prefix();
            if let Some(first) = seen_pairs.get(&prefix) {
                if first.tumor == pair.tumor && first.normal == pair.normal {
                    log::warn!(
                        "Pair {} listed again on manifest line {}, skipping",
                        prefix,
                        pair.line
                    );
                    continue;
                }
                return Err(TnflowError::for_pair(
                    prefix,
                    TnflowError::InvalidGraph(format!(
                        "tumor '{}' / normal '{}' (line {}) and tumor '{}' / normal '{}' \
                         (line {}) share the output prefix",
                        first.tumor, first.normal, first.line, pair.tumor, pair.normal, pair.line
                    )),
                ));
            }
            seen_pairs.insert(prefix.clone(), pair);

            let tables = if config.precomputed.enabled {
                let artifacts = artifacts.ok_or_else(|| {
                    TnflowError::InvalidConfig(
                        "precomputed mode is enabled but no artifact index was loaded".to_string(),
                    )
                })?;
                precomputed_tables(artifacts, pair)
                    .map_err(|e| TnflowError::for_pair(prefix.clone(), e))?
            } else {
                graph.add_contamination(config, pair)?
            };

            graph.add_pair(config, pair, &tables)?;
        }

        log::info!(
            "Task graph has {} units for {} pairs",
            graph.units.len(),
            seen_pairs.len()
        );
        Ok(graph)
    }

    fn push(&mut self, unit: TaskUnit) -> TnflowResult<()> {
        let index = self.units.len();
        if self.by_id.contains_key(&unit.id) {
            return Err(TnflowError::InvalidGraph(format!(
                "unit {} declared twice",
                unit.id
            )));
        }
        for output in &unit.outputs {
            if let Some(&other) = self.producers.get(output) {
                return Err(TnflowError::InvalidGraph(format!(
                    "{} is produced by both {} and {}",
                    output.display(),
                    self.units[other].id,
                    unit.id
                )));
            }
        }
        for output in &unit.outputs {
            self.producers.insert(output.clone(), index);
        }
        self.by_id.insert(unit.id.clone(), index);
        self.units.push(unit);
        Ok(())
    }

    fn unit_of(
        &self,
        config: &Config,
        kind: UnitKind,
        scope: &str,
        chromosome: Option<&str>,
        inputs: Vec<PathBuf>,
        outputs: Vec<PathBuf>,
        script: Script,
    ) -> TaskUnit {
        let id = match chromosome {
            Some(chrom) => format!("{}.{}.{}", kind, scope, chrom),
            None => format!("{}.{}", kind, scope),
        };
        TaskUnit {
            log: self.layout.log(kind, &id),
            id,
            kind,
            scope: scope.to_string(),
            chromosome: chromosome.map(str::to_string),
            inputs,
            outputs,
            resources: config.resources_for(kind),
            command: script.render(),
        }
    }

    /// Pileup units (one per sample, shared between pairs) and the contamination unit of a pair
    fn add_contamination(
        &mut self,
        config: &Config,
        pair: &SamplePair,
    ) -> TnflowResult<FilterTables> {
        let common = config.reference.common_variants.as_ref().ok_or_else(|| {
            TnflowError::InvalidConfig(
                "reference.common_variants is required to estimate contamination".to_string(),
            )
        })?;
        let prefix = pair.prefix();

        for (sample, bam) in [(&pair.tumor, &pair.tumor_bam), (&pair.normal, &pair.normal_bam)] {
            let table = self.layout.pileup_table(sample);
            if self.producers.contains_key(&table) {
                continue;
            }
            let resources = config.resources_for(UnitKind::PileupSummaries);
            let script = command::pileup_summaries(&config.tools, &bam.path, common, &table, &resources);
            let unit = self.unit_of(
                config,
                UnitKind::PileupSummaries,
                sample,
                None,
                vec![bam.path.clone(), bam.index.clone(), common.clone()],
                vec![table],
                script,
            );
            self.push(unit)?;
        }

        let tumor_table = self.layout.pileup_table(&pair.tumor);
        let normal_table = self.layout.pileup_table(&pair.normal);
        let tables = FilterTables {
            contamination: self.layout.contamination_table(&prefix),
            segments: self.layout.segments_table(&prefix),
        };
        let resources = config.resources_for(UnitKind::CalculateContamination);
        let script = command::calculate_contamination(
            &config.tools,
            &tumor_table,
            &normal_table,
            &tables.contamination,
            &tables.segments,
            &resources,
        );
        let unit = self.unit_of(
            config,
            UnitKind::CalculateContamination,
            &prefix,
            None,
            vec![tumor_table, normal_table],
            vec![tables.contamination.clone(), tables.segments.clone()],
            script,
        );
        self.push(unit)?;
        Ok(tables)
    }

    /// Chromosome calls, the three merges, orientation model and filter of a pair
    fn add_pair(
        &mut self,
        config: &Config,
        pair: &SamplePair,
        tables: &FilterTables,
    ) -> TnflowResult<()> {
        let prefix = pair.prefix();
        let reference = &config.reference;
        let layout = self.layout.clone();

        let mutect_inputs = Mutect2Inputs {
            genome: &reference.genome,
            germline_resource: &reference.germline_resource,
            panel_of_normals: &reference.panel_of_normals,
            tumor_bam: &pair.tumor_bam.path,
            normal_bam: &pair.normal_bam.path,
            normal_sample: &pair.normal,
        };
        let call_inputs = vec![
            pair.tumor_bam.path.clone(),
            pair.tumor_bam.index.clone(),
            pair.normal_bam.path.clone(),
            pair.normal_bam.index.clone(),
            reference.genome.clone(),
            reference.germline_resource.clone(),
            reference.panel_of_normals.clone(),
        ];
        let mutect_resources = config.resources_for(UnitKind::Mutect2);

        for chrom in CHROMOSOMES {
            let vcf = layout.chrom_vcf(&prefix, chrom);
            let f1r2 = layout.chrom_f1r2(&prefix, chrom);
            let script = command::mutect2(
                &config.tools,
                &mutect_inputs,
                chrom,
                &vcf,
                &f1r2,
                &mutect_resources,
            );
            let unit = self.unit_of(
                config,
                UnitKind::Mutect2,
                &prefix,
                Some(chrom),
                call_inputs.clone(),
                vec![vcf.clone(), layout.chrom_stats(&prefix, chrom), f1r2],
                script,
            );
            self.push(unit)?;
        }

        // Fan-in always follows the canonical chromosome order
        let chrom_vcfs: Vec<PathBuf> = CHROMOSOMES
            .iter()
            .map(|c| layout.chrom_vcf(&prefix, c))
            .collect();
        let chrom_stats: Vec<PathBuf> = CHROMOSOMES
            .iter()
            .map(|c| layout.chrom_stats(&prefix, c))
            .collect();
        let chrom_f1r2: Vec<(&str, PathBuf)> = CHROMOSOMES
            .iter()
            .map(|c| (*c, layout.chrom_f1r2(&prefix, c)))
            .collect();

        let merged_vcf = layout.merged_vcf(&prefix);
        let script = command::concat_vcfs(
            &config.tools,
            &chrom_vcfs,
            &merged_vcf,
            &config.resources_for(UnitKind::MergeVcfs),
        );
        let unit = self.unit_of(
            config,
            UnitKind::MergeVcfs,
            &prefix,
            None,
            chrom_vcfs,
            vec![merged_vcf.clone(), layout.merged_vcf_index(&prefix)],
            script,
        );
        self.push(unit)?;

        let merged_stats = layout.merged_stats(&prefix);
        let script = command::merge_stats(
            &config.tools,
            &chrom_stats,
            &merged_stats,
            &config.resources_for(UnitKind::MergeStats),
        );
        let unit = self.unit_of(
            config,
            UnitKind::MergeStats,
            &prefix,
            None,
            chrom_stats,
            vec![merged_stats.clone()],
            script,
        );
        self.push(unit)?;

        let merged_f1r2 = layout.merged_f1r2(&prefix);
        let script = command::merge_f1r2(
            &config.tools,
            &chrom_f1r2,
            &layout.f1r2_scratch(&prefix),
            &merged_f1r2,
        );
        let unit = self.unit_of(
            config,
            UnitKind::MergeF1r2,
            &prefix,
            None,
            chrom_f1r2.into_iter().map(|(_, path)| path).collect(),
            vec![merged_f1r2.clone()],
            script,
        );
        self.push(unit)?;

        let model = layout.orientation_model(&prefix);
        let script = command::learn_orientation(
            &config.tools,
            &merged_f1r2,
            &model,
            &config.resources_for(UnitKind::LearnOrientation),
        );
        let unit = self.unit_of(
            config,
            UnitKind::LearnOrientation,
            &prefix,
            None,
            vec![merged_f1r2],
            vec![model.clone()],
            script,
        );
        self.push(unit)?;

        let filtered = layout.filtered_vcf(&prefix);
        let filter_inputs = FilterInputs {
            genome: &reference.genome,
            vcf: &merged_vcf,
            stats: &merged_stats,
            orientation_model: &model,
            contamination: &tables.contamination,
            segments: &tables.segments,
        };
        let script = command::filter_calls(
            &config.tools,
            &filter_inputs,
            &filtered,
            &config.resources_for(UnitKind::Filter),
        );
        let unit = self.unit_of(
            config,
            UnitKind::Filter,
            &prefix,
            None,
            vec![
                merged_vcf.clone(),
                layout.merged_vcf_index(&prefix),
                merged_stats.clone(),
                model.clone(),
                reference.genome.clone(),
                tables.contamination.clone(),
                tables.segments.clone(),
            ],
            vec![filtered],
            script,
        );
        self.push(unit)
    }

    pub fn layout(&self) -> &OutputLayout {
        &self.layout
    }

    pub fn units(&self) -> &[TaskUnit] {
        &self.units
    }

    pub fn len(&self) -> usize {
        self.units.len()
    }

    pub fn is_empty(&self) -> bool {
        self.units.is_empty()
    }

    pub fn unit(&self, id: &str) -> Option<&TaskUnit> {
        self.by_id.get(id).map(|&i| &self.units[i])
    }

    pub fn units_of(&self, kind: UnitKind) -> impl Iterator<Item = &TaskUnit> {
        self.units.iter().filter(move |u| u.kind == kind)
    }

    /// Unit that writes `path`, if any
    pub fn producer(&self, path: &Path) -> Option<&TaskUnit> {
        self.producers.get(path).map(|&i| &self.units[i])
    }

    fn dependency_indices(&self, index: usize) -> Vec<usize> {
        let mut deps = Vec::new();
        for input in &self.units[index].inputs {
            if let Some(&producer) = self.producers.get(input) {
                if !deps.contains(&producer) {
                    deps.push(producer);
                }
            }
        }
        deps
    }

    /// Units producing any input of `id`, in input order
    pub fn dependencies(&self, id: &str) -> TnflowResult<Vec<&TaskUnit>> {
        let &index = self
            .by_id
            .get(id)
            .ok_or_else(|| TnflowError::InvalidGraph(format!("no unit {}", id)))?;
        Ok(self
            .dependency_indices(index)
            .into_iter()
            .map(|i| &self.units[i])
            .collect())
    }

    /// Inputs that no unit produces: BAMs, references, precomputed tables
    pub fn external_inputs(&self) -> BTreeSet<&Path> {
        self.units
            .iter()
            .flat_map(|u| u.inputs.iter())
            .filter(|p| !self.producers.contains_key(*p))
            .map(PathBuf::as_path)
            .collect()
    }

    /// Final per-pair outputs
    pub fn final_outputs(&self) -> Vec<&Path> {
        self.units_of(UnitKind::Filter)
            .flat_map(|u| u.outputs.iter().map(PathBuf::as_path))
            .collect()
    }

    /// Units ordered so that every unit follows all of its dependencies.
    /// Ties keep declaration order.
    pub fn topological_order(&self) -> TnflowResult<Vec<&TaskUnit>> {
        let n = self.units.len();
        let mut remaining = vec![0usize; n];
        let mut dependents: Vec<Vec<usize>> = vec![Vec::new(); n];
        for i in 0..n {
            let deps = self.dependency_indices(i);
            remaining[i] = deps.len();
            for d in deps {
                dependents[d].push(i);
            }
        }

        let mut queue: VecDeque<usize> = (0..n).filter(|&i| remaining[i] == 0).collect();
        let mut order = Vec::with_capacity(n);
        while let Some(i) = queue.pop_front() {
            order.push(&self.units[i]);
            for &j in &dependents[i] {
                remaining[j] -= 1;
                if remaining[j] == 0 {
                    queue.push_back(j);
                }
            }
        }

        if order.len() != n {
            let stuck: Vec<&str> = (0..n)
                .filter(|&i| remaining[i] > 0)
                .map(|i| self.units[i].id.as_str())
                .take(5)
                .collect();
            return Err(TnflowError::InvalidGraph(format!(
                "dependency cycle involving {}",
                stuck.join(", ")
            )));
        }
        Ok(order)
    }

    /// Number of units of each kind
    pub fn summary(&self) -> BTreeMap<UnitKind, usize> {
        let mut counts = BTreeMap::new();
        for unit in &self.units {
            *counts.entry(unit.kind).or_insert(0) += 1;
        }
        counts
    }
}

fn precomputed_tables(
    artifacts: &PrecomputedArtifactIndex,
    pair: &SamplePair,
) -> TnflowResult<FilterTables> {
    Ok(FilterTables {
        contamination: artifacts
            .lookup(&pair.tumor, ArtifactType::Contamination)?
            .to_path_buf(),
        segments: artifacts
            .lookup(&pair.tumor, ArtifactType::Segments)?
            .to_path_buf(),
    })
}
