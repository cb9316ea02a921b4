use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use common::exclusions::ExclusionTable;
use common::snapshot::HeapSnapshot;
use std::path::{Path, PathBuf};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;
use verifier::{SkipReason, VerificationSummary, VerifierConfig};

#[derive(Parser)]
#[command(name = "heapverify")]
#[command(version, about = "Checks archived heap snapshots for stale static references", long_about = None)]
struct Cli {
    /// Log filter (e.g. `warn`, `heap_verify=debug`).
    #[arg(long, global = true, default_value = "warn")]
    log_level: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Verify a heap snapshot (`.json` or `.rkyv`).
    Verify {
        /// Snapshot file.
        snapshot: PathBuf,
        #[command(flatten)]
        exclusions: ExclusionArgs,
        /// Maximum referrer hops rendered per trace.
        #[arg(long, default_value_t = verifier::DEFAULT_MAX_TRACE_DEPTH)]
        max_trace_depth: usize,
        /// Follow referrer chains without any depth limit.
        #[arg(long, conflicts_with = "max_trace_depth")]
        unbounded_trace: bool,
        /// Exit with an error if any problem is found.
        #[arg(long)]
        strict: bool,
    },
    /// Convert a JSON snapshot into the zero-copy `.rkyv` form.
    Bake {
        /// JSON snapshot to read.
        input: PathBuf,
        /// Destination `.rkyv` file.
        output: PathBuf,
    },
    /// Print the effective exclusion table.
    Exclusions {
        #[command(flatten)]
        exclusions: ExclusionArgs,
    },
}

#[derive(clap::Args)]
struct ExclusionArgs {
    /// Directory of JSON exclusion overlays, merged over the built-in table.
    #[arg(long)]
    exclusions: Option<PathBuf>,
    /// Start from an empty table instead of the built-in JDK list.
    #[arg(long)]
    no_builtin_exclusions: bool,
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let filter = EnvFilter::try_new(&cli.log_level).unwrap_or_else(|_| EnvFilter::new("warn"));
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .init();

    match &cli.command {
        Commands::Verify {
            snapshot,
            exclusions,
            max_trace_depth,
            unbounded_trace,
            strict,
        } => {
            let config = VerifierConfig {
                max_trace_depth: (!unbounded_trace).then_some(*max_trace_depth),
            };
            cmd_verify(snapshot, exclusions, config, *strict)?
        }
        Commands::Bake { input, output } => cmd_bake(input, output)?,
        Commands::Exclusions { exclusions } => cmd_exclusions(exclusions)?,
    }

    Ok(())
}

fn load_exclusions(args: &ExclusionArgs) -> anyhow::Result<ExclusionTable> {
    let mut table = if args.no_builtin_exclusions {
        ExclusionTable::empty()
    } else {
        ExclusionTable::builtin()
    };
    if let Some(dir) = &args.exclusions {
        let added = table
            .merge_dir(dir)
            .with_context(|| format!("Failed to load exclusions from {}", dir.display()))?;
        tracing::debug!(dir = %dir.display(), added, "merged exclusion overlays");
    }
    Ok(table)
}

// ---------------------------------------------------------------------------
// verify
// ---------------------------------------------------------------------------

fn cmd_verify(
    path: &Path,
    exclusions: &ExclusionArgs,
    config: VerifierConfig,
    strict: bool,
) -> anyhow::Result<()> {
    let exclusions = load_exclusions(exclusions)?;
    let snapshot = HeapSnapshot::open(path)
        .with_context(|| format!("Failed to read snapshot {}", path.display()))?;
    let heap = snapshot
        .load()
        .with_context(|| format!("Invalid snapshot {}", path.display()))?;
    tracing::debug!(
        classes = heap.class_count(),
        objects = heap.object_count(),
        archived = heap.archived_count(),
        "loaded snapshot"
    );

    let summary = verifier::verify_with(&heap, &heap, exclusions, config);
    for line in summary_box(&summary) {
        println!("{line}");
    }

    if summary.is_clean() {
        println!("No stale static references detected.");
        return Ok(());
    }

    println!("\nFLAGGED FIELDS:");
    for violation in &summary.violations {
        println!("  {} -> {}", violation.field_name(), violation.object);
    }

    if strict {
        bail!("{} problem(s) found", summary.problems);
    }
    Ok(())
}

fn summary_box(summary: &VerificationSummary) -> Vec<String> {
    const RULE: &str = "+------------------------------------------+";
    let stats = &summary.collect;
    let row = |label: &str, value: usize| format!("| {label:<15}: {value:>23} |");

    let mut lines = vec![
        RULE.to_string(),
        format!("| {:<40} |", "HEAP VERIFY"),
        RULE.to_string(),
        row("Classes", stats.classes),
        row("Subgraph roots", stats.subgraph_root_classes),
        row("Static refs", stats.static_references),
    ];
    for reason in SkipReason::ALL {
        lines.push(format!(
            "|   {:<16}: {:>20} |",
            reason.label(),
            stats.skipped_for(reason)
        ));
    }
    lines.push(row("Recorded fields", stats.recorded));
    lines.push(row("Live objects", summary.live_objects));
    lines.push(row("Archived", summary.archived_objects));
    lines.push(row("Problems", summary.problems));
    lines.push(RULE.to_string());
    lines
}

// ---------------------------------------------------------------------------
// bake
// ---------------------------------------------------------------------------

fn cmd_bake(input: &Path, output: &Path) -> anyhow::Result<()> {
    let snapshot = HeapSnapshot::open(input)
        .with_context(|| format!("Failed to read snapshot {}", input.display()))?;
    // Refuse to bake something the verifier would reject.
    snapshot
        .load()
        .with_context(|| format!("Invalid snapshot {}", input.display()))?;

    let bytes = snapshot.to_bytes()?;
    if let Some(parent) = output.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(output, &bytes)
        .with_context(|| format!("Failed to write {}", output.display()))?;

    println!(
        "Baked {} classes, {} objects, {} archived into {} ({} bytes).",
        snapshot.classes.len(),
        snapshot.objects.len(),
        snapshot.archive.len(),
        output.display(),
        bytes.len()
    );
    Ok(())
}

// ---------------------------------------------------------------------------
// exclusions
// ---------------------------------------------------------------------------

fn cmd_exclusions(args: &ExclusionArgs) -> anyhow::Result<()> {
    let table = load_exclusions(args)?;
    if table.is_empty() {
        println!("Exclusion table is empty.");
        return Ok(());
    }
    for (class, fields) in table.iter() {
        println!("{class}");
        for field in fields {
            println!("    {:<28} {}", field.name, field.rationale.label());
        }
    }
    Ok(())
}
