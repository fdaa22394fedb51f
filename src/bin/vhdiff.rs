//! # vhdiff CLI - Capture and replay disk image changes
//!
//! ## Usage
//! ```bash
//! # Capture what target.vhd changes relative to base.vhd
//! vhdiff create base.vhd target.vhd changes.vhd
//!
//! # Replay it onto a copy of the base
//! vhdiff apply changes.vhd base.vhd --copy-to patched.vhd
//!
//! # Compare two directories or two hive files on the host
//! vhdiff compare-dirs ./old ./new --style full
//! vhdiff compare-hives SOFTWARE.old SOFTWARE.new
//!
//! # Read or write a registry value inside an image
//! vhdiff reg get base.vhd 'SOFTWARE\Microsoft\Windows NT\CurrentVersion\ProductName'
//! vhdiff reg set base.vhd 'SYSTEM\Setup\Stage' REG_DWORD 1
//! ```

use anyhow::{anyhow, bail, Context};
use clap::{Args, Parser, Subcommand, ValueEnum};
use colored::*;
use humantime::format_duration;
use indicatif::{ProgressBar, ProgressStyle};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::EnvFilter;
use vhdiff::disk::DiskFormat;
use vhdiff::editor::OfflineEditor;
use vhdiff::fs::host::HostFileSystem;
use vhdiff::fs::SharedFileSystem;
use vhdiff::registry::{Hive, HiveComparator, RegValue, ValueType};
use vhdiff::{
    ApplyMode, ApplyReport, ComparisonStyle, CreateReport, PartitionSelection, ProgressCallback, Vhdiff,
    VhdiffBuilder, VhdiffConfig,
};

/// vhdiff - Diff and reapply virtual disk images
#[derive(Parser)]
#[command(name = "vhdiff")]
#[command(version)]
#[command(about = "Capture the difference between two disk images and replay it onto a base")]
#[command(long_about = None)]
struct Cli {
    /// Increase log verbosity (-v debug, -vv trace)
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Load settings from a JSON configuration file
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Number of worker threads
    #[arg(short = 'j', long, global = true)]
    workers: Option<usize>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create a diff image holding what TARGET changes relative to BASE
    Create {
        /// Base (old) image
        base: PathBuf,

        /// Target (new) image
        target: PathBuf,

        /// Diff image to write
        output: PathBuf,

        #[command(flatten)]
        compare: CompareArgs,

        /// Output image format
        #[arg(long, value_enum)]
        format: Option<FormatArg>,

        /// Block size of the output image in bytes
        #[arg(long)]
        block_size: Option<u32>,

        /// Diff a single partition pair, as INDEX or BASE:TARGET
        #[arg(long, value_parser = parse_pair)]
        partition: Option<(usize, usize)>,

        /// Overwrite the output if it exists
        #[arg(long)]
        force: bool,

        /// Print the report as JSON
        #[arg(long)]
        json: bool,
    },

    /// Apply a diff image to a base image
    Apply {
        /// Diff image written by `create`
        diff: PathBuf,

        /// Base image the diff was created against
        base: PathBuf,

        /// Apply to a copy of the base instead of the base itself
        #[arg(long, conflicts_with = "child")]
        copy_to: Option<PathBuf>,

        /// Apply to a new differencing VHD whose parent is the base
        #[arg(long)]
        child: Option<PathBuf>,

        /// Overwrite an existing copy or child
        #[arg(long)]
        force: bool,

        /// Print the report as JSON
        #[arg(long)]
        json: bool,
    },

    /// Compare two directories on the host
    CompareDirs {
        /// Left (base) directory
        left: PathBuf,

        /// Right (target) directory
        right: PathBuf,

        #[command(flatten)]
        compare: CompareArgs,

        /// List unchanged and left-only entries too
        #[arg(short, long)]
        all: bool,
    },

    /// Compare two hive files on the host
    CompareHives {
        /// Left (base) hive file
        left: PathBuf,

        /// Right (target) hive file
        right: PathBuf,
    },

    /// Read or write registry values inside an image
    #[command(subcommand)]
    Reg(RegCommand),

    /// Print a file from an image
    Cat {
        /// Disk image
        image: PathBuf,

        /// Path inside the partition
        path: String,

        /// Partition index
        #[arg(short, long, default_value_t = 0)]
        partition: usize,
    },

    /// Write a host file into an image
    Put {
        /// Disk image
        image: PathBuf,

        /// Path inside the partition
        path: String,

        /// Host file to copy in
        source: PathBuf,

        /// Partition index
        #[arg(short, long, default_value_t = 0)]
        partition: usize,
    },
}

#[derive(Subcommand)]
enum RegCommand {
    /// Print a value
    Get {
        /// Disk image
        image: PathBuf,

        /// Data path, e.g. SOFTWARE\Microsoft\Windows NT\CurrentVersion\ProductName
        path: String,

        /// Read from this user's hive instead of a machine hive
        #[arg(short, long)]
        user: Option<String>,
    },

    /// Set a value, creating missing keys
    Set {
        /// Disk image
        image: PathBuf,

        /// Data path; a trailing backslash names the default value
        path: String,

        /// Value type, e.g. REG_SZ or REG_DWORD
        value_type: String,

        /// Value text; numbers accept 0x hex, binary is hex, multi-string items are separated by |
        value: String,

        /// Write to this user's hive instead of a machine hive
        #[arg(short, long)]
        user: Option<String>,
    },
}

#[derive(Args)]
struct CompareArgs {
    /// How files present on both sides are compared
    #[arg(long, value_enum)]
    style: Option<StyleArg>,

    /// Additional exclusion globs
    #[arg(short, long)]
    exclude: Vec<String>,

    /// Do not apply the built-in exclusions
    #[arg(long)]
    no_default_excludes: bool,

    /// Show progress
    #[arg(long)]
    progress: bool,
}

#[derive(Copy, Clone, PartialEq, Eq, ValueEnum)]
enum StyleArg {
    Full,
    Name,
    Datetime,
    Binary,
}

impl From<StyleArg> for ComparisonStyle {
    fn from(style: StyleArg) -> Self {
        match style {
            StyleArg::Full => ComparisonStyle::Full,
            StyleArg::Name => ComparisonStyle::NameOnly,
            StyleArg::Datetime => ComparisonStyle::DateTimeOnly,
            StyleArg::Binary => ComparisonStyle::BinaryOnly,
        }
    }
}

#[derive(Copy, Clone, PartialEq, Eq, ValueEnum)]
enum FormatArg {
    Vhd,
    Raw,
}

impl From<FormatArg> for DiskFormat {
    fn from(format: FormatArg) -> Self {
        match format {
            FormatArg::Vhd => DiskFormat::Vhd,
            FormatArg::Raw => DiskFormat::Raw,
        }
    }
}

fn parse_pair(s: &str) -> Result<(usize, usize), String> {
    let parse = |v: &str| v.trim().parse::<usize>().map_err(|e| format!("invalid partition index '{}': {}", v, e));
    match s.split_once(':') {
        Some((l, r)) => Ok((parse(l)?, parse(r)?)),
        None => parse(s).map(|i| (i, i)),
    }
}

fn main() {
    let cli = Cli::parse();

    let level = match cli.verbose {
        0 => "warn",
        1 => "debug",
        _ => "trace",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    if std::env::var("NO_COLOR").is_ok() {
        colored::control::set_override(false);
    }

    if let Err(e) = run(cli) {
        eprintln!("{}: {:#}", "Error".red().bold(), e);
        std::process::exit(1);
    }
}

fn run(cli: Cli) -> anyhow::Result<()> {
    let config = match &cli.config {
        Some(path) => VhdiffConfig::from_file(path).with_context(|| format!("loading config {:?}", path))?,
        None => VhdiffConfig::default(),
    };
    let builder = VhdiffBuilder::from_config(config);
    let builder = match cli.workers {
        Some(n) => builder.parallel_workers(n),
        None => builder,
    };

    match cli.command {
        Commands::Create { base, target, output, compare, format, block_size, partition, force, json } => {
            let mut builder = configure_compare(builder, &compare).force(force);
            if let Some(format) = format {
                builder = builder.output_format(format.into());
            }
            if let Some(block_size) = block_size {
                builder = builder.block_size(block_size);
            }
            let selection = partition.map(PartitionSelection::from).unwrap_or_default();
            cmd_create(builder, &base, &target, &output, selection, compare.progress, json)
        }
        Commands::Apply { diff, base, copy_to, child, force, json } => {
            let mode = match (copy_to, child) {
                (Some(path), _) => ApplyMode::CopyTo(path),
                (None, Some(path)) => ApplyMode::DifferencingChild(path),
                (None, None) => ApplyMode::InPlace,
            };
            cmd_apply(builder.force(force), &diff, &base, mode, json)
        }
        Commands::CompareDirs { left, right, compare, all } => {
            cmd_compare_dirs(configure_compare(builder, &compare), &left, &right, all)
        }
        Commands::CompareHives { left, right } => cmd_compare_hives(&left, &right, cli.workers),
        Commands::Reg(RegCommand::Get { image, path, user }) => cmd_reg_get(&image, &path, user.as_deref()),
        Commands::Reg(RegCommand::Set { image, path, value_type, value, user }) => {
            cmd_reg_set(&image, &path, &value_type, &value, user.as_deref())
        }
        Commands::Cat { image, path, partition } => cmd_cat(&image, partition, &path),
        Commands::Put { image, path, source, partition } => cmd_put(&image, partition, &path, &source),
    }
}

fn configure_compare(builder: VhdiffBuilder, args: &CompareArgs) -> VhdiffBuilder {
    let mut builder = match args.style {
        Some(style) => builder.style(style.into()),
        None => builder,
    };
    if args.no_default_excludes || !args.exclude.is_empty() {
        let mut patterns = if args.no_default_excludes {
            Vec::new()
        } else {
            VhdiffConfig::default().exclude_patterns
        };
        patterns.extend(args.exclude.iter().cloned());
        builder = builder.exclude_patterns(patterns);
    }
    builder
}

fn spinner(message: &str) -> anyhow::Result<ProgressBar> {
    let pb = ProgressBar::new_spinner();
    pb.set_style(ProgressStyle::default_spinner().template("{spinner:.green} {msg}")?);
    pb.enable_steady_tick(Duration::from_millis(120));
    pb.set_message(message.to_string());
    Ok(pb)
}

fn progress_into(pb: &ProgressBar) -> ProgressCallback {
    let pb = pb.clone();
    Arc::new(move |info| {
        let item = info.current_item.unwrap_or_default();
        pb.set_message(format!("{}: {}", info.operation, item));
    })
}

/// Create a diff image
///
/// Changed files are copied verbatim; changed hives are stored as registry
/// diffs. The report lists anything that could not be read or written.
fn cmd_create(
    builder: VhdiffBuilder,
    base: &Path,
    target: &Path,
    output: &Path,
    selection: PartitionSelection,
    show_progress: bool,
    json: bool,
) -> anyhow::Result<()> {
    let progress = if show_progress { Some(spinner("Comparing images...")?) } else { None };
    let builder = match &progress {
        Some(pb) => builder.progress_callback(progress_into(pb)),
        None => builder,
    };
    let vhdiff = builder.build()?;

    if !json {
        println!("{}", "Creating diff...".blue().bold());
    }
    let report = vhdiff.create_diff_with(base, target, output, selection);
    if let Some(pb) = progress {
        pb.finish_and_clear();
    }
    let report = report?;

    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        print_create_report(&report);
    }
    if !report.is_complete() {
        bail!("diff created with {} failures", report.failures().count());
    }
    Ok(())
}

fn print_create_report(report: &CreateReport) {
    println!("{} Created {}", "✓".green().bold(), report.output.display().to_string().cyan());
    for part in &report.partitions {
        println!(
            "  Partition {} -> {} ({})",
            part.right_index,
            part.output_index,
            part.filesystem.cyan()
        );
        println!(
            "    Files: {} ({})",
            part.files_copied.to_string().cyan(),
            format_bytes(part.bytes_copied).cyan()
        );
        if !part.system_hives.is_empty() || !part.user_hives.is_empty() {
            println!(
                "    Hives: {} system, {} user",
                part.system_hives.len().to_string().cyan(),
                part.user_hives.len().to_string().cyan()
            );
        }
        for hive in &part.incomplete_hives {
            println!("    {} {} was only partly readable", "!".yellow().bold(), hive.yellow());
        }
        for failure in &part.failures {
            println!("    {} {}: {}", "✗".red().bold(), failure.path, failure.reason.red());
        }
    }
    println!("  Time: {}", format_duration(Duration::from_millis(report.duration_ms)).to_string().cyan());
}

/// Apply a diff image
fn cmd_apply(builder: VhdiffBuilder, diff: &Path, base: &Path, mode: ApplyMode, json: bool) -> anyhow::Result<()> {
    let vhdiff = builder.build()?;
    if !json {
        println!("{} {}", "Applying".blue().bold(), diff.display().to_string().yellow());
    }
    let report = vhdiff.apply_diff(diff, base, mode)?;
    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        print_apply_report(&report);
    }
    if !report.is_complete() {
        bail!("diff applied with failures");
    }
    Ok(())
}

fn print_apply_report(report: &ApplyReport) {
    println!("{} Applied to {}", "✓".green().bold(), report.target.display().to_string().cyan());
    println!("  Files written: {}", report.files_written().to_string().cyan());
    println!("  Registry values written: {}", report.values_written().to_string().cyan());
    for part in &report.partitions {
        if let Some(error) = &part.error {
            println!("  {} partition {}: {}", "✗".red().bold(), part.index, error.red());
        }
        for user in &part.users_skipped {
            println!("  {} user {} has no profile on the base", "-".yellow(), user.yellow());
        }
        for failure in &part.failures {
            println!("  {} {}: {}", "✗".red().bold(), failure.path, failure.reason.red());
        }
    }
    println!("  Time: {}", format_duration(Duration::from_millis(report.duration_ms)).to_string().cyan());
}

fn cmd_compare_dirs(builder: VhdiffBuilder, left: &Path, right: &Path, all: bool) -> anyhow::Result<()> {
    let vhdiff = builder.build()?;
    let left: SharedFileSystem = Arc::new(HostFileSystem::new(left)?.read_only());
    let right: SharedFileSystem = Arc::new(HostFileSystem::new(right)?.read_only());
    let comparison = vhdiff.compare_trees(&left, &right)?;

    for entry in &comparison.entries {
        if !all && !entry.condition.is_surfaced() {
            continue;
        }
        let label = match entry.condition {
            c if c.is_surfaced() => c.label().yellow(),
            c => c.label().normal(),
        };
        println!("{:<12} /{}", label, entry.path);
    }
    for failure in &comparison.failures {
        eprintln!("{} /{}: {}", "✗".red().bold(), failure.path, failure.reason);
    }
    let counts = &comparison.counts;
    println!(
        "{} files: {} same, {} changed, {} added, {} only left",
        counts.total(),
        counts.same,
        counts.diff + counts.newer_right + counts.newer_left,
        counts.only_right,
        counts.only_left
    );
    Ok(())
}

fn cmd_compare_hives(left: &Path, right: &Path, workers: Option<usize>) -> anyhow::Result<()> {
    let load = |path: &Path| -> anyhow::Result<Hive> {
        let bytes = std::fs::read(path).with_context(|| format!("reading {:?}", path))?;
        Hive::parse(&bytes).with_context(|| format!("parsing {:?}", path))
    };
    let (left, right) = (load(left)?, load(right)?);
    let comparator = match workers {
        Some(n) => HiveComparator::new().with_parallel_workers(n),
        None => HiveComparator::new(),
    };
    let comparison = comparator.compare(Some(left.root()), Some(right.root()))?;

    let mut changed = 0usize;
    for entry in comparison.changed() {
        changed += 1;
        let show = |v: Option<&RegValue>| match v {
            Some(v) => format!("{} {}", v.value_type, v),
            None => "-".to_string(),
        };
        println!(
            "{}::{}  {} -> {}",
            entry.key_path,
            entry.value_name,
            show(entry.left.as_ref()).red(),
            show(entry.right.as_ref()).green()
        );
    }
    for path in &comparison.incomplete_paths {
        eprintln!("{} {} could not be read", "!".yellow().bold(), path);
    }
    println!("{} of {} values differ", changed, comparison.entries.len());
    Ok(())
}

fn cmd_reg_get(image: &Path, path: &str, user: Option<&str>) -> anyhow::Result<()> {
    let backends = vhdiff::BackendRegistry::new();
    let editor = OfflineEditor::open(&backends, image, false)?;
    let value = match user {
        Some(user) => editor.read_user_value(user, path)?,
        None => editor.read_machine_value(path)?,
    };
    println!("{}", value);
    Ok(())
}

fn cmd_reg_set(image: &Path, path: &str, value_type: &str, text: &str, user: Option<&str>) -> anyhow::Result<()> {
    let value_type = ValueType::parse_name(value_type).ok_or_else(|| anyhow!("unknown value type '{}'", value_type))?;
    let value = RegValue::parse(value_type, text).ok_or_else(|| anyhow!("'{}' is not a valid {}", text, value_type))?;
    let backends = vhdiff::BackendRegistry::new();
    let editor = OfflineEditor::open(&backends, image, true)?;
    match user {
        Some(user) => editor.write_user_value(user, path, value)?,
        None => editor.write_machine_value(path, value)?,
    }
    println!("{} Set {}", "✓".green().bold(), path.cyan());
    Ok(())
}

fn cmd_cat(image: &Path, partition: usize, path: &str) -> anyhow::Result<()> {
    use std::io::Write;
    let backends = vhdiff::BackendRegistry::new();
    let editor = OfflineEditor::open(&backends, image, false)?;
    let data = editor.read_file(partition, path)?;
    std::io::stdout().write_all(&data)?;
    Ok(())
}

fn cmd_put(image: &Path, partition: usize, path: &str, source: &Path) -> anyhow::Result<()> {
    let data = std::fs::read(source).with_context(|| format!("reading {:?}", source))?;
    let backends = vhdiff::BackendRegistry::new();
    let editor = OfflineEditor::open(&backends, image, true)?;
    let written = editor.write_file(partition, path, &data)?;
    println!("{} Wrote {} to {}", "✓".green().bold(), format_bytes(written).cyan(), path.cyan());
    Ok(())
}

/// Format bytes in human-readable form
fn format_bytes(bytes: u64) -> String {
    const UNITS: &[&str] = &["B", "KB", "MB", "GB", "TB"];
    let mut size = bytes as f64;
    let mut unit = 0;
    while size >= 1024.0 && unit < UNITS.len() - 1 {
        size /= 1024.0;
        unit += 1;
    }
    if unit == 0 {
        format!("{} {}", bytes, UNITS[0])
    } else {
        format!("{:.2} {}", size, UNITS[unit])
    }
}
