//! Plans the tumor/normal Mutect2 workflow and writes it for an external scheduler

use clap::Parser;
use env_logger::Env;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::PathBuf;
use tnflow_rs::{
    artifacts::PrecomputedArtifactIndex,
    bam::check_pair_contigs,
    config::Config,
    export::{write_graph, ExportFormat},
    graph::TaskGraph,
    pairs::load_pairs,
    sample::SampleIndex,
    utils::{ensure_parent_dirs, Timer},
    SamplePair, TnflowError, TnflowResult, CHROMOSOMES,
};

#[derive(Parser)]
#[command(name = "tnflow")]
#[command(about = "tnflow - tumor/normal Mutect2 task-graph planner")]
#[command(long_about = "
tnflow resolves tumor/normal BAM pairs and declares the somatic calling workflow
as a task graph, without running any of it.

For every pair listed in the manifest:
1. Mutect2 is run once per chromosome (1-22, X, Y, MT)
2. Chromosome VCFs, stats and F1R2 archives are merged in canonical order
3. A read-orientation model is learned from the merged F1R2 archive
4. Calls are filtered with contamination and segmentation tables, either
   precomputed or estimated in the graph

The default output is a Makefile; run it with `make -j N -k` so independent
units run concurrently and one failing unit does not stop the others.
The JSON plan and TSV table describe the same graph for other schedulers.
")]
struct Args {
    /// YAML configuration file
    #[arg(long, value_name = "FILE")]
    config: PathBuf,

    /// Output format
    #[arg(long, value_enum, default_value = "makefile")]
    format: ExportFormat,

    /// Output file, `-` for stdout
    #[arg(short, long, value_name = "FILE", default_value = "-")]
    output: PathBuf,

    /// First manifest line to process (1-based, overrides the configuration)
    #[arg(long)]
    start: Option<usize>,

    /// Last manifest line to process (inclusive, overrides the configuration)
    #[arg(long)]
    end: Option<usize>,

    /// Command prefix wrapping every unit, e.g. "bsub -K -n {threads} -M {mem_mb}"
    #[arg(long, value_name = "TEMPLATE")]
    launcher: Option<String>,

    /// Print the resolved pairs instead of the task graph
    #[arg(long)]
    list: bool,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    /// Enable debug logging
    #[arg(short, long)]
    debug: bool,

    /// Force overwrite of output file if it exists
    #[arg(short, long)]
    force: bool,
}

/// Configuration file with command-line overrides applied, validated
fn load_config(args: &Args) -> TnflowResult<Config> {
    let mut config = Config::load(&args.config)?;
    if args.start.is_some() || args.end.is_some() {
        config.pairs.start = args.start.or(config.pairs.start);
        config.pairs.end = args.end.or(config.pairs.end);
        config.line_range()?;
    }
    if args.launcher.is_some() {
        config.launcher = args.launcher.clone();
    }
    Ok(config)
}

/// Discover samples and resolve the manifest pairs
fn resolve_pairs(config: &Config) -> TnflowResult<Vec<SamplePair>> {
    let _timer = Timer::new("Resolving samples and pairs");
    let samples = SampleIndex::discover(config)?;
    log::info!(
        "Found {} samples in {} input directories",
        samples.len(),
        config.input_dirs.len()
    );

    let range = config.line_range()?;
    let pairs = load_pairs(&config.pairs.manifest, range.as_ref(), &samples)?;

    if config.check_bam_headers {
        let _timer = Timer::new("Checking BAM headers");
        let incomplete = check_pair_contigs(&pairs, &CHROMOSOMES)?;
        if incomplete > 0 {
            log::warn!("{} BAM files lack some chromosomes in their header", incomplete);
        }
    }
    Ok(pairs)
}

/// Build the task graph for resolved pairs
fn plan(config: &Config, pairs: &[SamplePair]) -> TnflowResult<TaskGraph> {
    let artifacts = if config.precomputed.enabled {
        let base = config.precomputed.base.as_ref().ok_or_else(|| {
            TnflowError::InvalidConfig(
                "precomputed.base is required when precomputed mode is enabled".to_string(),
            )
        })?;
        let index = PrecomputedArtifactIndex::load(base)?;
        for (pair, error) in index.missing_for_pairs(pairs) {
            log::warn!("Pair {}: {}", pair, error);
        }
        Some(index)
    } else {
        None
    };

    let _timer = Timer::new("Building task graph");
    let graph = TaskGraph::build(config, pairs, artifacts.as_ref())?;
    for (kind, count) in graph.summary() {
        log::info!("  {:<24} {}", kind, count);
    }
    log::info!("{} external inputs", graph.external_inputs().len());
    Ok(graph)
}

fn write_pairs<W: Write>(pairs: &[SamplePair], writer: W) -> TnflowResult<()> {
    let mut csv_writer = csv::WriterBuilder::new()
        .delimiter(b'\t')
        .from_writer(writer);
    csv_writer.write_record(["line", "tumor", "normal", "tumor_bam", "normal_bam"])?;
    for pair in pairs {
        let line = pair.line.to_string();
        let tumor_bam = pair.tumor_bam.path.to_string_lossy();
        let normal_bam = pair.normal_bam.path.to_string_lossy();
        csv_writer.write_record([
            line.as_str(),
            pair.tumor.as_str(),
            pair.normal.as_str(),
            tumor_bam.as_ref(),
            normal_bam.as_ref(),
        ])?;
    }
    csv_writer.flush()?;
    Ok(())
}

fn open_output(args: &Args) -> TnflowResult<Box<dyn Write>> {
    if args.output.as_os_str() == "-" {
        return Ok(Box::new(BufWriter::new(std::io::stdout().lock())));
    }

    if args.output.exists() && !args.force {
        return Err(TnflowError::Io(std::io::Error::new(
            std::io::ErrorKind::AlreadyExists,
            format!("Output file {:?} already exists. Use --force to overwrite.", args.output),
        )));
    }
    ensure_parent_dirs(&args.output)?;
    Ok(Box::new(BufWriter::new(File::create(&args.output)?)))
}

fn run() -> TnflowResult<()> {
    let args = Args::parse();

    let log_level = if args.debug {
        "debug"
    } else if args.verbose {
        "info"
    } else {
        "warn"
    };

    env_logger::Builder::from_env(Env::default().default_filter_or(log_level))
        .format_timestamp_secs()
        .init();

    log::info!("Starting tnflow");
    log::info!("Configuration: {:?}", args.config);

    let config = load_config(&args)?;
    log::info!("Output directory: {:?}", config.output_dir);
    if config.precomputed.enabled {
        log::info!("Using precomputed contamination tables");
    }

    let pairs = resolve_pairs(&config)?;

    let mut writer = open_output(&args)?;
    if args.list {
        write_pairs(&pairs, &mut writer)?;
    } else {
        let graph = plan(&config, &pairs)?;
        let _timer = Timer::new("Writing task graph");
        write_graph(&graph, args.format, config.launcher.as_deref(), &mut writer)?;
        log::info!(
            "Wrote {} units for {} pairs as {:?}",
            graph.len(),
            pairs.len(),
            args.format
        );
    }
    writer.flush()?;

    Ok(())
}

/// Handle application errors and provide user-friendly messages
fn handle_error(error: TnflowError) -> ! {
    match error {
        TnflowError::FileNotFound(path) => {
            eprintln!("Error: File not found: {}", path);
            eprintln!("Please check that the file exists and is readable.");
        }
        TnflowError::IndexNotFound { bam, candidates } => {
            eprintln!("Error: No index for BAM file {}", bam);
            eprintln!("Looked for: {}", candidates);
            eprintln!("Index the BAM with `samtools index` and rerun.");
        }
        TnflowError::DuplicateSample {
            sample,
            first,
            second,
        } => {
            eprintln!("Error: Sample '{}' has more than one BAM file:", sample);
            eprintln!("  {}", first);
            eprintln!("  {}", second);
            eprintln!("Narrow the input directories or set `filter` in the configuration.");
        }
        TnflowError::NoValidPairs(manifest) => {
            eprintln!("Error: No usable tumor/normal pairs in {}", manifest);
            eprintln!("Check the line range and that both samples of each line have a BAM file.");
        }
        TnflowError::ArtifactManifestMissing { artifact } => {
            eprintln!("Error: No {} manifest was found", artifact);
            eprintln!("Run find_contamination to write the manifests, or check precomputed.base.");
        }
        TnflowError::ArtifactNotFound { artifact, sample } => {
            eprintln!("Error: No {} table for sample '{}'", artifact, sample);
        }
        TnflowError::Pair { pair, source } => {
            eprintln!("Error: Pair {}: {}", pair, source);
            eprintln!("Fix or remove this pair in the manifest and rerun.");
        }
        TnflowError::InvalidConfig(msg) => {
            eprintln!("Error: Invalid configuration: {}", msg);
            eprintln!("Please check the YAML configuration file.");
        }
        TnflowError::Yaml(ref e) => {
            eprintln!("Error: Could not parse configuration: {}", e);
        }
        TnflowError::InvalidGraph(msg) => {
            eprintln!("Error: Invalid task graph: {}", msg);
            eprintln!("This is unexpected. Please report this issue.");
        }
        TnflowError::Htslib(ref e) => {
            eprintln!("Error: BAM processing error: {}", e);
            eprintln!("Please check that your BAM files are valid.");
        }
        TnflowError::Pattern(ref e) => {
            eprintln!("Error: Invalid input directory pattern: {}", e);
        }
        TnflowError::Io(ref e) => {
            eprintln!("Error: I/O error: {}", e);
            eprintln!("Please check file permissions and disk space.");
        }
        TnflowError::Csv(ref e) => {
            eprintln!("Error: Could not write table: {}", e);
        }
        TnflowError::Json(ref e) => {
            eprintln!("Error: Could not write JSON plan: {}", e);
        }
    }
    std::process::exit(1);
}

fn main() {
    if let Err(e) = run() {
        handle_error(e);
    }
}
