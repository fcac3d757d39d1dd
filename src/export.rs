//! Rendering a task graph for the external scheduler: a GNU Makefile, a JSON plan or a TSV table

use crate::graph::{TaskGraph, TaskUnit, UnitKind};
use crate::utils::shell_quote;
use crate::TnflowResult;
use serde::Serialize;
use std::collections::BTreeMap;
use std::io::Write;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum ExportFormat {
    /// GNU make 4.3+ (grouped targets), run with `make -j N -k`
    Makefile,
    Json,
    Tsv,
}

/// Write `graph` in the chosen format
pub fn write_graph<W: Write>(
    graph: &TaskGraph,
    format: ExportFormat,
    launcher: Option<&str>,
    writer: W,
) -> TnflowResult<()> {
    match format {
        ExportFormat::Makefile => write_makefile(graph, launcher, writer),
        ExportFormat::Json => write_json(graph, writer),
        ExportFormat::Tsv => write_tsv(graph, writer),
    }
}

/// Escape a path for use as a make target or prerequisite
fn make_path(path: &Path) -> String {
    let mut escaped = String::new();
    for c in path.to_string_lossy().chars() {
        match c {
            '$' => escaped.push_str("$$"),
            ' ' | '#' | ':' => {
                escaped.push('\\');
                escaped.push(c);
            }
            _ => escaped.push(c),
        }
    }
    escaped
}

/// Escape a shell line for a recipe
fn make_recipe(line: &str) -> String {
    line.replace('$', "$$")
}

fn join_paths<'a, I>(paths: I) -> String
where
    I: IntoIterator<Item = &'a PathBuf>,
{
    paths
        .into_iter()
        .map(|p| make_path(p))
        .collect::<Vec<_>>()
        .join(" ")
}

/// Fill `{threads}`, `{mem_mb}`, `{runtime}`, `{env}`, `{name}` and `{log}` in a launcher template
pub fn expand_launcher(template: &str, unit: &TaskUnit) -> String {
    template
        .replace("{threads}", &unit.resources.threads.to_string())
        .replace("{mem_mb}", &unit.resources.mem_mb.to_string())
        .replace("{runtime}", &unit.resources.runtime.to_string())
        .replace("{env}", unit.resources.env.as_deref().unwrap_or(""))
        .replace("{name}", &unit.id)
        .replace("{log}", &shell_quote(&unit.log.to_string_lossy()))
}

/// Shell line running one unit, stdout and stderr going to its log
pub fn unit_invocation(unit: &TaskUnit, launcher: Option<&str>) -> String {
    let log = shell_quote(&unit.log.to_string_lossy());
    match launcher {
        Some(template) => format!(
            "{} bash -c {} > {} 2>&1",
            expand_launcher(template, unit),
            shell_quote(&unit.command),
            log
        ),
        None => format!("( {} ) > {} 2>&1", unit.command, log),
    }
}

fn directories_of(unit: &TaskUnit) -> Vec<&Path> {
    let mut dirs: Vec<&Path> = unit
        .outputs
        .iter()
        .chain(std::iter::once(&unit.log))
        .filter_map(|p| p.parent())
        .collect();
    dirs.sort();
    dirs.dedup();
    dirs
}

/// Write the graph as a Makefile with one rule per unit.
///
/// Every unit becomes a grouped-target rule, so make runs it once for all of its outputs,
/// and `.DELETE_ON_ERROR` removes partial outputs of failed units.
pub fn write_makefile<W: Write>(
    graph: &TaskGraph,
    launcher: Option<&str>,
    mut writer: W,
) -> TnflowResult<()> {
    let order = graph.topological_order()?;

    writeln!(writer, "# Generated by tnflow; run with: make -j <N> -k -f <this file>")?;
    writeln!(writer, "SHELL := /bin/bash")?;
    writeln!(writer, ".SHELLFLAGS := -o pipefail -c")?;
    writeln!(writer, ".DELETE_ON_ERROR:")?;
    writeln!(writer, ".PHONY: all clean-temp")?;
    writeln!(writer)?;
    writeln!(
        writer,
        "all: {}",
        graph
            .final_outputs()
            .into_iter()
            .map(make_path)
            .collect::<Vec<_>>()
            .join(" ")
    )?;

    for unit in order {
        writeln!(writer)?;
        writeln!(writer, "# {}", unit.id)?;
        writeln!(
            writer,
            "{} &: {}",
            join_paths(&unit.outputs),
            join_paths(&unit.inputs)
        )?;
        let dirs = directories_of(unit)
            .into_iter()
            .map(|d| shell_quote(&d.to_string_lossy()))
            .collect::<Vec<_>>()
            .join(" ");
        writeln!(writer, "\t@mkdir -p {}", make_recipe(&dirs))?;
        writeln!(writer, "\t{}", make_recipe(&unit_invocation(unit, launcher)))?;
    }

    writeln!(writer)?;
    writeln!(writer, "clean-temp:")?;
    writeln!(
        writer,
        "\trm -rf {}",
        make_recipe(&shell_quote(&graph.layout().temp_dir().to_string_lossy()))
    )?;
    Ok(())
}

#[derive(Serialize)]
struct PlanUnit<'a> {
    #[serde(flatten)]
    unit: &'a TaskUnit,
    dependencies: Vec<&'a str>,
}

#[derive(Serialize)]
struct Plan<'a> {
    output_dir: &'a Path,
    summary: BTreeMap<UnitKind, usize>,
    final_outputs: Vec<&'a Path>,
    units: Vec<PlanUnit<'a>>,
}

/// Write the graph as a pretty-printed JSON plan, units in dependency order
pub fn write_json<W: Write>(graph: &TaskGraph, mut writer: W) -> TnflowResult<()> {
    let units = graph
        .topological_order()?
        .into_iter()
        .map(|unit| -> TnflowResult<PlanUnit> {
            let dependencies = graph
                .dependencies(&unit.id)?
                .into_iter()
                .map(|d| d.id.as_str())
                .collect();
            Ok(PlanUnit { unit, dependencies })
        })
        .collect::<TnflowResult<Vec<_>>>()?;

    let plan = Plan {
        output_dir: graph.layout().root(),
        summary: graph.summary(),
        final_outputs: graph.final_outputs(),
        units,
    };
    serde_json::to_writer_pretty(&mut writer, &plan)?;
    writeln!(writer)?;
    Ok(())
}

/// Write one tab-separated row per unit, in dependency order
pub fn write_tsv<W: Write>(graph: &TaskGraph, writer: W) -> TnflowResult<()> {
    let mut csv_writer = csv::WriterBuilder::new()
        .delimiter(b'\t')
        .from_writer(writer);

    csv_writer.write_record([
        "id",
        "kind",
        "scope",
        "chromosome",
        "threads",
        "mem_mb",
        "runtime",
        "env",
        "outputs",
        "dependencies",
    ])?;

    for unit in graph.topological_order()? {
        let outputs = unit
            .outputs
            .iter()
            .map(|p| p.to_string_lossy().into_owned())
            .collect::<Vec<_>>()
            .join(",");
        let dependencies = graph
            .dependencies(&unit.id)?
            .iter()
            .map(|d| d.id.as_str())
            .collect::<Vec<_>>()
            .join(",");
        let threads = unit.resources.threads.to_string();
        let mem_mb = unit.resources.mem_mb.to_string();
        let runtime = unit.resources.runtime.to_string();
        csv_writer.write_record([
            unit.id.as_str(),
            unit.kind.name(),
            unit.scope.as_str(),
            unit.chromosome.as_deref().unwrap_or("."),
            threads.as_str(),
            mem_mb.as_str(),
            runtime.as_str(),
            unit.resources.env.as_deref().unwrap_or("."),
            outputs.as_str(),
            dependencies.as_str(),
        ])?;
    }

    csv_writer.flush()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::tests::precomputed_graph;
    use tempfile::TempDir;

    fn makefile(graph: &TaskGraph, launcher: Option<&str>) -> String {
        let mut buffer = Vec::new();
        write_makefile(graph, launcher, &mut buffer).unwrap();
        String::from_utf8(buffer).unwrap()
    }

    #[test]
    fn test_make_path_escaping() {
        assert_eq!(make_path(Path::new("/a/b.vcf.gz")), "/a/b.vcf.gz");
        assert_eq!(make_path(Path::new("/a b/c$d")), "/a\\ b/c$$d");
        assert_eq!(make_recipe("echo '$HOME'"), "echo '$$HOME'");
    }

    #[test]
    fn test_makefile_rules() {
        let dir = TempDir::new().unwrap();
        let graph = precomputed_graph(dir.path());
        let text = makefile(&graph, None);
        let root = graph.layout().root();

        assert!(text.starts_with("# Generated by tnflow"));
        assert!(text.contains(".DELETE_ON_ERROR:"));
        let all = text.lines().find(|l| l.starts_with("all:")).unwrap();
        assert!(all.contains(&root.join("Filtered_vcf/T1_N1.filtered.vcf.gz").display().to_string()));
        assert!(all.contains("T2_N2.filtered.vcf.gz"));

        assert_eq!(text.matches(" &: ").count(), graph.len());
        assert_eq!(text.matches("\n# mutect2.").count(), 50);

        let merge_rule = text
            .lines()
            .find(|l| l.contains(" &: ") && l.contains("T1_N1.vcf.gz.tbi"))
            .unwrap();
        assert!(merge_rule.contains("T1_N1_1.vcf.gz"));
        assert!(merge_rule.contains("T1_N1_MT.vcf.gz"));

        assert!(text.contains("gatk --java-options -Xmx"));
        assert!(text.contains("logs/filter/filter.T2_N2.log 2>&1"));
        assert!(text.trim_end().ends_with(&format!(
            "rm -rf {}",
            root.join("temp_vcf").display()
        )));
        for line in text.lines().filter(|l| l.starts_with("\t(")) {
            assert!(line.ends_with("2>&1"));
        }
    }

    #[test]
    fn test_rules_follow_dependencies() {
        let dir = TempDir::new().unwrap();
        let graph = precomputed_graph(dir.path());
        let text = makefile(&graph, None);

        let position = |id: &str| text.find(&format!("# {}\n", id)).unwrap();
        assert!(position("mutect2.T1_N1.MT") < position("merge_vcfs.T1_N1"));
        assert!(position("merge_f1r2.T1_N1") < position("learn_orientation.T1_N1"));
        assert!(position("learn_orientation.T1_N1") < position("filter.T1_N1"));
    }

    #[test]
    fn test_launcher_expansion() {
        let dir = TempDir::new().unwrap();
        let graph = precomputed_graph(dir.path());
        let unit = graph.unit("mutect2.T1_N1.X").unwrap();

        let launcher = "bsub -K -n {threads} -M {mem_mb} -W {runtime} -J {name}";
        let line = unit_invocation(unit, Some(launcher));
        assert!(line.starts_with("bsub -K -n 4 -M 16000 -W 1440 -J mutect2.T1_N1.X bash -c '"));
        assert!(line.ends_with(" 2>&1"));

        let text = makefile(&graph, Some(launcher));
        assert_eq!(text.matches("\tbsub -K").count(), graph.len());
    }

    #[test]
    fn test_json_plan() {
        let dir = TempDir::new().unwrap();
        let graph = precomputed_graph(dir.path());
        let mut buffer = Vec::new();
        write_json(&graph, &mut buffer).unwrap();

        let plan: serde_json::Value = serde_json::from_slice(&buffer).unwrap();
        let units = plan["units"].as_array().unwrap();
        assert_eq!(units.len(), 60);
        assert_eq!(plan["summary"]["mutect2"], 50);
        assert_eq!(plan["final_outputs"].as_array().unwrap().len(), 2);

        let filter = units
            .iter()
            .find(|u| u["id"] == "filter.T1_N1")
            .unwrap();
        assert_eq!(filter["kind"], "filter");
        assert_eq!(filter["resources"]["mem_mb"], 8000);
        assert!(filter.get("chromosome").is_none());
        let deps: Vec<&str> = filter["dependencies"]
            .as_array()
            .unwrap()
            .iter()
            .map(|d| d.as_str().unwrap())
            .collect();
        assert_eq!(
            deps,
            vec!["merge_vcfs.T1_N1", "merge_stats.T1_N1", "learn_orientation.T1_N1"]
        );

        let call = units
            .iter()
            .find(|u| u["id"] == "mutect2.T1_N1.22")
            .unwrap();
        assert_eq!(call["chromosome"], "22");
    }

    #[test]
    fn test_tsv_table() {
        let dir = TempDir::new().unwrap();
        let graph = precomputed_graph(dir.path());
        let mut buffer = Vec::new();
        write_tsv(&graph, &mut buffer).unwrap();

        let mut reader = csv::ReaderBuilder::new()
            .delimiter(b'\t')
            .from_reader(buffer.as_slice());
        assert_eq!(reader.headers().unwrap().len(), 10);
        let records: Vec<csv::StringRecord> = reader.records().map(|r| r.unwrap()).collect();
        assert_eq!(records.len(), 60);

        let merge = records
            .iter()
            .find(|r| &r[0] == "merge_stats.T2_N2")
            .unwrap();
        assert_eq!(&merge[1], "merge_stats");
        assert_eq!(&merge[3], ".");
        assert_eq!(merge[9].split(',').count(), 25);
    }
}
