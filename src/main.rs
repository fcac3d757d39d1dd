fn main() {
    println!("tnflow-rs - Tumor/normal Mutect2 workflow planner");
    println!();
    println!("🔬 Plan the workflow for every pair in the manifest:");
    println!("  tnflow             - Config + BAMs + pair manifest → Makefile / JSON plan / TSV");
    println!();
    println!("📋 Prepare precomputed contamination tables:");
    println!("  find_contamination - Table directory → per-type path manifests");
    println!();
    println!("📖 For help with each tool:");
    println!("  cargo run --bin tnflow -- --help");
    println!("  cargo run --bin find_contamination -- --help");
    println!();
    println!("🚀 Quick start example:");
    println!("  cargo run --bin tnflow -- --config run.yaml -o workflow.mk -v");
    println!("  make -f workflow.mk -j 16 -k");
    println!();
    println!("💡 Add a launcher template (e.g. \"bsub -K -n {{threads}}\") to submit every unit to a batch queue.");
}
