//! Shell command templates for the external tools run by each unit

use crate::config::{Resources, ToolPaths};
use crate::utils::shell_quote;
use std::ffi::OsStr;
use std::path::{Path, PathBuf};

/// A single program invocation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandLine {
    words: Vec<String>,
}

impl CommandLine {
    pub fn new(program: impl AsRef<OsStr>) -> Self {
        Self {
            words: vec![program.as_ref().to_string_lossy().into_owned()],
        }
    }

    /// GATK tool invocation with the Java heap sized from the unit's memory
    pub fn gatk(tools: &ToolPaths, tool: &str, resources: &Resources) -> Self {
        Self::new(&tools.gatk)
            .arg("--java-options")
            .arg(format!("-Xmx{}m", resources.java_heap_mb()))
            .arg(tool)
    }

    pub fn arg(mut self, arg: impl AsRef<OsStr>) -> Self {
        self.words.push(arg.as_ref().to_string_lossy().into_owned());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<OsStr>,
    {
        for arg in args {
            self = self.arg(arg);
        }
        self
    }

    /// `flag value`
    pub fn opt(self, flag: &str, value: impl AsRef<OsStr>) -> Self {
        self.arg(flag).arg(value)
    }

    pub fn render(&self) -> String {
        self.words
            .iter()
            .map(|w| shell_quote(w))
            .collect::<Vec<_>>()
            .join(" ")
    }
}

/// Steps run in order, stopping at the first failure
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Script {
    steps: Vec<String>,
}

impl Script {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn then(mut self, command: CommandLine) -> Self {
        self.steps.push(command.render());
        self
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    pub fn render(&self) -> String {
        self.steps.join(" && ")
    }
}

/// Inputs shared by every Mutect2 invocation of a pair
pub struct Mutect2Inputs<'a> {
    pub genome: &'a Path,
    pub germline_resource: &'a Path,
    pub panel_of_normals: &'a Path,
    pub tumor_bam: &'a Path,
    pub normal_bam: &'a Path,
    pub normal_sample: &'a str,
}

/// Mutect2 restricted to one chromosome. Stats land next to the VCF as `<vcf>.stats`.
pub fn mutect2(
    tools: &ToolPaths,
    inputs: &Mutect2Inputs,
    chromosome: &str,
    vcf: &Path,
    f1r2: &Path,
    resources: &Resources,
) -> Script {
    Script::new().then(
        CommandLine::gatk(tools, "Mutect2", resources)
            .opt("-R", inputs.genome)
            .opt("-I", inputs.tumor_bam)
            .opt("-I", inputs.normal_bam)
            .opt("-normal", inputs.normal_sample)
            .opt("--germline-resource", inputs.germline_resource)
            .opt("--panel-of-normals", inputs.panel_of_normals)
            .opt("-L", chromosome)
            .opt("--native-pair-hmm-threads", resources.threads.to_string())
            .opt("--f1r2-tar-gz", f1r2)
            .opt("-O", vcf),
    )
}

/// Concatenate chromosome VCFs in the given order, then tabix-index the result
pub fn concat_vcfs(
    tools: &ToolPaths,
    inputs: &[PathBuf],
    output: &Path,
    resources: &Resources,
) -> Script {
    Script::new()
        .then(
            CommandLine::new(&tools.bcftools)
                .arg("concat")
                .opt("--threads", resources.threads.to_string())
                .opt("-O", "z")
                .opt("-o", output)
                .args(inputs),
        )
        .then(
            CommandLine::new(&tools.tabix)
                .arg("-f")
                .opt("-p", "vcf")
                .arg(output),
        )
}

pub fn merge_stats(
    tools: &ToolPaths,
    inputs: &[PathBuf],
    output: &Path,
    resources: &Resources,
) -> Script {
    let mut command = CommandLine::gatk(tools, "MergeMutectStats", resources);
    for input in inputs {
        command = command.opt("-stats", input);
    }
    Script::new().then(command.opt("-O", output))
}

/// Union of the per-chromosome F1R2 archives.
///
/// Each archive is unpacked into its own `<scratch>/<chromosome>` directory, so members
/// with equal names in different chromosomes stay distinct. On repacking, GNU tar renames
/// `<chromosome>/<member>` to `<chromosome>_<member>`, leaving every table at the top
/// level of the merged archive where LearnReadOrientationModel looks for it.
/// Member rename applied when repacking: `1/x.alt_histogram` -> `1_x.alt_histogram`.
/// Bare directory entries (`1/`) have nothing after the slash and keep their name.
const FLATTEN_MEMBERS: &str = r"--transform=s,^\([^/]*\)/\(.\),\1_\2,";

pub fn merge_f1r2(
    tools: &ToolPaths,
    archives: &[(&str, PathBuf)],
    scratch: &Path,
    output: &Path,
) -> Script {
    let mut script = Script::new()
        .then(CommandLine::new("rm").arg("-rf").arg(scratch))
        .then(
            CommandLine::new("mkdir")
                .arg("-p")
                .args(archives.iter().map(|(chrom, _)| scratch.join(chrom))),
        );
    for (chrom, archive) in archives {
        script = script.then(
            CommandLine::new(&tools.tar)
                .opt("-xzf", archive)
                .opt("-C", scratch.join(chrom)),
        );
    }
    script
        .then(
            CommandLine::new(&tools.tar)
                .opt("-czf", output)
                .opt("-C", scratch)
                .arg(FLATTEN_MEMBERS)
                .args(archives.iter().map(|(chrom, _)| chrom)),
        )
        .then(CommandLine::new("rm").arg("-rf").arg(scratch))
}

pub fn learn_orientation(
    tools: &ToolPaths,
    f1r2: &Path,
    output: &Path,
    resources: &Resources,
) -> Script {
    Script::new().then(
        CommandLine::gatk(tools, "LearnReadOrientationModel", resources)
            .opt("-I", f1r2)
            .opt("-O", output),
    )
}

/// Tables the filter consumes alongside the merged calls
pub struct FilterInputs<'a> {
    pub genome: &'a Path,
    pub vcf: &'a Path,
    pub stats: &'a Path,
    pub orientation_model: &'a Path,
    pub contamination: &'a Path,
    pub segments: &'a Path,
}

pub fn filter_calls(
    tools: &ToolPaths,
    inputs: &FilterInputs,
    output: &Path,
    resources: &Resources,
) -> Script {
    Script::new().then(
        CommandLine::gatk(tools, "FilterMutectCalls", resources)
            .opt("-R", inputs.genome)
            .opt("-V", inputs.vcf)
            .opt("--stats", inputs.stats)
            .opt("--ob-priors", inputs.orientation_model)
            .opt("--contamination-table", inputs.contamination)
            .opt("--tumor-segmentation", inputs.segments)
            .opt("-O", output),
    )
}

pub fn pileup_summaries(
    tools: &ToolPaths,
    bam: &Path,
    common_variants: &Path,
    output: &Path,
    resources: &Resources,
) -> Script {
    Script::new().then(
        CommandLine::gatk(tools, "GetPileupSummaries", resources)
            .opt("-I", bam)
            .opt("-V", common_variants)
            .opt("-L", common_variants)
            .opt("-O", output),
    )
}

pub fn calculate_contamination(
    tools: &ToolPaths,
    tumor_pileups: &Path,
    normal_pileups: &Path,
    contamination: &Path,
    segments: &Path,
    resources: &Resources,
) -> Script {
    Script::new().then(
        CommandLine::gatk(tools, "CalculateContamination", resources)
            .opt("-I", tumor_pileups)
            .opt("-matched", normal_pileups)
            .opt("--tumor-segmentation", segments)
            .opt("-O", contamination),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn res() -> Resources {
        Resources::new(2, 10000, 60)
    }

    #[test]
    fn test_command_line_render() {
        let command = CommandLine::new("tar")
            .opt("-xzf", "/tmp/a b.tar.gz")
            .arg("x");
        assert_eq!(command.render(), "tar -xzf '/tmp/a b.tar.gz' x");
    }

    #[test]
    fn test_script_joins_steps() {
        let script = Script::new()
            .then(CommandLine::new("true"))
            .then(CommandLine::new("echo").arg("done"));
        assert_eq!(script.len(), 2);
        assert_eq!(script.render(), "true && echo done");
        assert!(Script::new().is_empty());
    }

    #[test]
    fn test_mutect2_command() {
        let inputs = Mutect2Inputs {
            genome: Path::new("/ref/genome.fa"),
            germline_resource: Path::new("/ref/gnomad.vcf.gz"),
            panel_of_normals: Path::new("/ref/pon.vcf.gz"),
            tumor_bam: Path::new("/bams/T1.bam"),
            normal_bam: Path::new("/bams/N1.bam"),
            normal_sample: "N1",
        };
        let script = mutect2(
            &ToolPaths::default(),
            &inputs,
            "X",
            Path::new("/out/temp_vcf/T1_N1_X.vcf.gz"),
            Path::new("/out/temp_vcf/T1_N1_X.f1r2.tar.gz"),
            &res(),
        );
        let text = script.render();
        assert!(text.starts_with("gatk --java-options -Xmx8000m Mutect2 -R /ref/genome.fa"));
        assert!(text.contains("-I /bams/T1.bam -I /bams/N1.bam -normal N1"));
        assert!(text.contains("-L X"));
        assert!(text.contains("--native-pair-hmm-threads 2"));
        assert!(text.ends_with("-O /out/temp_vcf/T1_N1_X.vcf.gz"));
    }

    #[test]
    fn test_concat_keeps_input_order() {
        let inputs = vec![PathBuf::from("c1.vcf.gz"), PathBuf::from("c2.vcf.gz")];
        let script = concat_vcfs(&ToolPaths::default(), &inputs, Path::new("m.vcf.gz"), &res());
        assert_eq!(
            script.render(),
            "bcftools concat --threads 2 -O z -o m.vcf.gz c1.vcf.gz c2.vcf.gz && tabix -f -p vcf m.vcf.gz"
        );
    }

    #[test]
    fn test_merge_stats() {
        let inputs = vec![PathBuf::from("a.stats"), PathBuf::from("b.stats")];
        let text = merge_stats(&ToolPaths::default(), &inputs, Path::new("m.stats"), &res()).render();
        assert!(text.ends_with("MergeMutectStats -stats a.stats -stats b.stats -O m.stats"));
    }

    #[test]
    fn test_merge_f1r2_flattens_members() {
        let archives = vec![
            ("1", PathBuf::from("t/P_1.f1r2.tar.gz")),
            ("2", PathBuf::from("t/P_2.f1r2.tar.gz")),
        ];
        let script = merge_f1r2(
            &ToolPaths::default(),
            &archives,
            Path::new("t/P_f1r2"),
            Path::new("P.f1r2.tar.gz"),
        );
        assert_eq!(
            script.render(),
            "rm -rf t/P_f1r2 && mkdir -p t/P_f1r2/1 t/P_f1r2/2 \
             && tar -xzf t/P_1.f1r2.tar.gz -C t/P_f1r2/1 \
             && tar -xzf t/P_2.f1r2.tar.gz -C t/P_f1r2/2 \
             && tar -czf P.f1r2.tar.gz -C t/P_f1r2 '--transform=s,^\\([^/]*\\)/\\(.\\),\\1_\\2,' 1 2 \
             && rm -rf t/P_f1r2"
        );
    }

    #[test]
    fn test_filter_command() {
        let inputs = FilterInputs {
            genome: Path::new("g.fa"),
            vcf: Path::new("P.vcf.gz"),
            stats: Path::new("P.vcf.gz.stats"),
            orientation_model: Path::new("P.model.tar.gz"),
            contamination: Path::new("T_calculatecontamination.table"),
            segments: Path::new("T_segments.table"),
        };
        let text = filter_calls(&ToolPaths::default(), &inputs, Path::new("f.vcf.gz"), &res()).render();
        assert!(text.contains("--contamination-table T_calculatecontamination.table"));
        assert!(text.contains("--tumor-segmentation T_segments.table"));
        assert!(text.contains("--ob-priors P.model.tar.gz"));
    }

    #[test]
    fn test_contamination_commands() {
        let tools = ToolPaths::default();
        let pileup = pileup_summaries(
            &tools,
            Path::new("T.bam"),
            Path::new("common.vcf.gz"),
            Path::new("T_getpileupsummaries.table"),
            &res(),
        )
        .render();
        assert!(pileup.contains("GetPileupSummaries -I T.bam -V common.vcf.gz -L common.vcf.gz"));

        let contamination = calculate_contamination(
            &tools,
            Path::new("T_getpileupsummaries.table"),
            Path::new("N_getpileupsummaries.table"),
            Path::new("c.table"),
            Path::new("s.table"),
            &res(),
        )
        .render();
        assert!(contamination.contains("-matched N_getpileupsummaries.table"));
        assert!(contamination.ends_with("--tumor-segmentation s.table -O c.table"));
    }
}
