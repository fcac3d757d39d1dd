//! Finds contamination tables under a directory and writes the path manifests tnflow reads

use anyhow::{Context, Result};
use clap::Parser;
use env_logger::Env;
use std::path::{Path, PathBuf};
use tnflow_rs::{
    artifacts::{find_artifact_files, ArtifactSearch},
    utils::Timer,
    ArtifactType,
};

#[derive(Parser)]
#[command(name = "find_contamination")]
#[command(about = "Search for contamination analysis tables and write path manifests")]
#[command(long_about = "
Recursively searches DIR for pileup summary, contamination and segmentation
tables (*_getpileupsummaries.table, *_calculatecontamination.table,
*_segments.table) and writes one path-per-line manifest per type:

  <BASE>_getpileupsummaries_paths.txt
  <BASE>_calculatecontamination_paths.txt
  <BASE>_segments_paths.txt
  <BASE>_all_paths.txt

Point `precomputed.base` of the tnflow configuration at BASE to use them.
Samples lacking some of the tables are reported.
")]
struct Args {
    /// Directory to search in
    #[arg(value_name = "DIR")]
    directory: PathBuf,

    /// Output path prefix of the manifests (a trailing .txt or .json is dropped)
    #[arg(short, long, value_name = "BASE", default_value = "contamination_files_list")]
    output: PathBuf,

    /// Also link every table into this directory
    #[arg(long, value_name = "DIR")]
    symlink_dir: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,
}

/// Report per-type counts and samples lacking some table type.
/// Returns the number of incomplete samples.
fn report(search: &ArtifactSearch) -> usize {
    for artifact in ArtifactType::ALL {
        log::info!(
            "{}: {} files, {} samples",
            artifact,
            search.files(artifact).len(),
            search.samples(artifact).len()
        );
    }

    let missing = search.missing_by_sample();
    for (sample, types) in &missing {
        let names: Vec<&str> = types.iter().map(|t| t.name()).collect();
        log::warn!("Sample {} has no {} table", sample, names.join(", "));
    }
    if missing.is_empty() {
        log::info!(
            "All {} samples have every table type",
            search.all_samples().len()
        );
    }
    missing.len()
}

fn find_and_write(directory: &Path, output: &Path, symlink_dir: Option<&Path>) -> Result<usize> {
    let search = {
        let _timer = Timer::new("Searching for contamination tables");
        find_artifact_files(directory)
            .with_context(|| format!("Failed to search {}", directory.display()))?
    };
    let incomplete = report(&search);

    let written = search
        .write_manifests(output)
        .with_context(|| format!("Failed to write manifests for {}", output.display()))?;
    for path in &written {
        println!("{}", path.display());
    }

    if let Some(dir) = symlink_dir {
        let linked = search
            .create_symlinks(dir)
            .with_context(|| format!("Failed to create symlinks in {}", dir.display()))?;
        log::info!("Created {} symlinks in {}", linked, dir.display());
    }
    Ok(incomplete)
}

fn main() -> Result<()> {
    let args = Args::parse();

    let log_level = if args.verbose { "info" } else { "warn" };
    env_logger::Builder::from_env(Env::default().default_filter_or(log_level))
        .format_timestamp_secs()
        .init();

    log::info!("Searching {:?}", args.directory);
    let incomplete = find_and_write(&args.directory, &args.output, args.symlink_dir.as_deref())?;
    if incomplete > 0 {
        log::warn!("{} samples are missing some tables", incomplete);
    }
    Ok(())
}
