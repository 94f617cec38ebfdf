use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use colored::Colorize;
use rayon::prelude::*;
use sigpatcher::{
    load_from_path, load_profiles_from_path, ApplicationReport, ApplyRequest, EngineConfig,
    ErrorKind, IntegrityGuard, PatchEngine, PatchSet, PatternMatcher, ProfileRegistry, RuleStatus,
    Signature,
};
use std::fs;
use std::path::{Path, PathBuf};
use tracing_subscriber::EnvFilter;
use walkdir::WalkDir;

#[derive(Parser)]
#[command(name = "sigpatcher")]
#[command(about = "Signature-based binary patcher for game clients", long_about = None)]
#[command(version)]
struct Cli {
    /// Increase log verbosity (-v info, -vv debug); RUST_LOG overrides
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Args)]
struct EngineArgs {
    /// Patch set file, or a directory of *.toml patch sets
    #[arg(short, long)]
    patches: PathBuf,

    /// Client build being patched (semver), checked against build_range
    #[arg(short, long)]
    build: Option<String>,

    /// Allow rules that change the file length
    #[arg(long)]
    allow_resize: bool,

    /// Suffix for backup files
    #[arg(long, default_value = "bak")]
    backup_suffix: String,

    /// Print reports as JSON
    #[arg(long)]
    json: bool,
}

impl EngineArgs {
    fn engine(&self) -> Result<PatchEngine> {
        Ok(PatchEngine::new(EngineConfig {
            safe_mode: !self.allow_resize,
            client_build: self.build.clone(),
            backup_suffix: self.backup_suffix.clone(),
        })?)
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Apply patch sets to one or more client files
    Apply {
        #[command(flatten)]
        engine: EngineArgs,

        /// Files to patch
        #[arg(short, long, required = true, num_args = 1..)]
        target: Vec<PathBuf>,

        /// Write the patched file here instead of in place (single target)
        #[arg(short, long)]
        output: Option<PathBuf>,

        /// Dry run - resolve and verify without writing anything
        #[arg(short = 'n', long)]
        dry_run: bool,
    },

    /// Check whether patch sets would apply, without touching files
    Check {
        #[command(flatten)]
        engine: EngineArgs,

        /// Files to check
        #[arg(short, long, required = true, num_args = 1..)]
        target: Vec<PathBuf>,
    },

    /// Print every offset where a signature matches
    Scan {
        file: PathBuf,

        /// Hex signature, `??` for wildcards
        #[arg(short, long, conflicts_with = "ascii", required_unless_present = "ascii")]
        signature: Option<String>,

        /// Literal ASCII text to search for
        #[arg(short, long)]
        ascii: Option<String>,

        /// Stop after the first match
        #[arg(long)]
        first: bool,
    },

    /// Identify a client build from known profiles and patch sets
    Identify {
        file: PathBuf,

        /// Profiles file ([[profiles]] entries)
        #[arg(long)]
        profiles: Option<PathBuf>,

        /// Patch sets to probe when no profile matches exactly
        #[arg(short, long)]
        patches: Option<PathBuf>,

        #[arg(long)]
        json: bool,
    },

    /// Print a profile entry for a file
    Fingerprint {
        file: PathBuf,

        /// Profile name (defaults to the file name)
        #[arg(long)]
        name: Option<String>,
    },

    /// Restore files from their backups
    Restore {
        #[arg(required = true)]
        files: Vec<PathBuf>,

        #[arg(long, default_value = "bak")]
        backup_suffix: String,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    match cli.command {
        Commands::Apply {
            engine,
            target,
            output,
            dry_run,
        } => cmd_apply(&engine, &target, output.as_deref(), dry_run),

        Commands::Check { engine, target } => cmd_check(&engine, &target),

        Commands::Scan {
            file,
            signature,
            ascii,
            first,
        } => cmd_scan(&file, signature.as_deref(), ascii.as_deref(), first),

        Commands::Identify {
            file,
            profiles,
            patches,
            json,
        } => cmd_identify(&file, profiles.as_deref(), patches.as_deref(), json),

        Commands::Fingerprint { file, name } => cmd_fingerprint(&file, name),

        Commands::Restore {
            files,
            backup_suffix,
        } => cmd_restore(&files, &backup_suffix),
    }
}

fn init_tracing(verbose: u8) {
    let default = match verbose {
        0 => "warn",
        1 => "info",
        _ => "debug",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();
}

/// Helper: Load one patch set file, or every *.toml in a directory.
fn load_patch_sets(path: &Path) -> Result<Vec<PatchSet>> {
    let files = if path.is_dir() {
        let mut files = Vec::new();
        for entry in WalkDir::new(path).max_depth(1) {
            let entry = entry?;
            if entry.file_type().is_file()
                && entry.path().extension().and_then(|s| s.to_str()) == Some("toml")
            {
                files.push(entry.path().to_path_buf());
            }
        }
        files.sort();
        if files.is_empty() {
            anyhow::bail!("No .toml patch files found in {}", path.display());
        }
        files
    } else {
        vec![path.to_path_buf()]
    };

    files
        .iter()
        .map(|file| {
            tracing::debug!(file = %file.display(), "loading patch set");
            let set = load_from_path(file)?;
            tracing::info!(set = %set.name(), rules = set.len(), "loaded patch set");
            Ok(set)
        })
        .collect()
}

fn cmd_apply(args: &EngineArgs, targets: &[PathBuf], output: Option<&Path>, dry_run: bool) -> Result<()> {
    if output.is_some() && targets.len() != 1 {
        anyhow::bail!("--output requires exactly one --target");
    }

    let engine = args.engine()?;
    let sets = load_patch_sets(&args.patches)?;
    // Every set reads the untouched target, so a shared output would keep only the last.
    if output.is_some() && sets.len() > 1 {
        anyhow::bail!(
            "--output takes a single patch set, but {} were loaded; write each set to its own output",
            sets.len()
        );
    }

    if dry_run && !args.json {
        println!("{}", "[DRY RUN - nothing will be written]".cyan());
    }

    let mut reports = Vec::new();
    for set in &sets {
        // Sets run one after another; targets of one set run in parallel.
        let batch: Vec<ApplicationReport> = targets
            .par_iter()
            .map(|target| {
                let mut request = ApplyRequest::new(target).dry_run(dry_run);
                if let Some(output) = output {
                    request = request.output(output);
                }
                let report = engine.apply_file(set, &request);
                tracing::info!(
                    set = %set.name(),
                    target = %target.display(),
                    success = report.success,
                    committed = report.committed,
                    "patch set finished"
                );
                report
            })
            .collect();
        reports.extend(batch);
    }

    finish(&reports, args.json, dry_run)
}

fn cmd_check(args: &EngineArgs, targets: &[PathBuf]) -> Result<()> {
    let engine = args.engine()?;
    let sets = load_patch_sets(&args.patches)?;

    let mut reports = Vec::new();
    for set in &sets {
        let batch: Result<Vec<ApplicationReport>> = targets
            .par_iter()
            .map(|target| {
                let bytes = fs::read(target)
                    .with_context(|| format!("failed to read {}", target.display()))?;
                let mut report = engine.check(set, &bytes);
                report.target = Some(target.clone());
                Ok(report)
            })
            .collect();
        reports.extend(batch?);
    }

    finish(&reports, args.json, true)
}

fn finish(reports: &[ApplicationReport], json: bool, dry_run: bool) -> Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(reports)?);
    } else {
        for report in reports {
            print_report(report, dry_run);
        }
        print_summary(reports);
    }

    let failed = reports.iter().any(|r| {
        !r.success
            && r.failure
                .as_ref()
                .is_some_and(|f| f.kind != ErrorKind::AlreadyPatched)
    });
    if failed {
        std::process::exit(1);
    }
    Ok(())
}

fn print_report(report: &ApplicationReport, dry_run: bool) {
    let target = report
        .target
        .as_ref()
        .map(|t| t.display().to_string())
        .unwrap_or_else(|| "<buffer>".to_string());
    println!("{} {} on {}", "Patch set".bold(), report.patch_set, target);

    for rule in &report.rules {
        let offsets = rule
            .offsets
            .iter()
            .map(|o| format!("{o:#x}"))
            .collect::<Vec<_>>()
            .join(", ");
        match &rule.status {
            RuleStatus::Applied if dry_run => {
                println!("{} {}: Would apply at {}", "✓".green(), rule.id, offsets)
            }
            RuleStatus::Applied => println!("{} {}: Applied at {}", "✓".green(), rule.id, offsets),
            RuleStatus::AlreadyApplied => {
                println!("{} {}: Already applied at {}", "⊙".yellow(), rule.id, offsets)
            }
            RuleStatus::Skipped { reason } => {
                println!("{} {}: Skipped ({})", "⊘".cyan(), rule.id, reason)
            }
            RuleStatus::Failed { reason } => {
                eprintln!("{} {}: Failed - {}", "✗".red(), rule.id, reason)
            }
        }
    }

    match &report.failure {
        None if report.committed => println!(
            "  {} checksum {} -> {}",
            "Committed".green(),
            report.original_checksum,
            report.checksum
        ),
        None => println!("  checksum {} -> {}", report.original_checksum, report.checksum),
        Some(failure) if failure.kind == ErrorKind::AlreadyPatched => {
            println!("  {}", failure.message.yellow())
        }
        Some(failure) => {
            eprintln!("  {}", failure.message.red());
            if failure.kind == ErrorKind::RollbackFailed {
                eprintln!("  {}", "CRITICAL: restore the target from its backup manually".red().bold());
            } else if report.rolled_back {
                eprintln!("  {}", "Target restored from snapshot".yellow());
            } else {
                eprintln!("  {}", "Target left unchanged".dimmed());
            }
        }
    }
    if report.length_delta != 0 {
        println!("  length changed by {:+} bytes", report.length_delta);
    }
    println!();
}

fn print_summary(reports: &[ApplicationReport]) {
    let applied: usize = reports.iter().map(|r| r.applied()).sum();
    let already: usize = reports.iter().map(|r| r.already_applied()).sum();
    let skipped: usize = reports.iter().map(|r| r.skipped()).sum();
    let failed = reports.iter().filter(|r| !r.success).count();

    println!("{}", "Summary:".bold());
    println!("  {} rules applied", format!("{}", applied).green());
    println!("  {} rules already applied", format!("{}", already).yellow());
    println!("  {} rules skipped", format!("{}", skipped).cyan());
    println!("  {} patch sets failed", format!("{}", failed).red());
}

fn cmd_scan(file: &Path, signature: Option<&str>, ascii: Option<&str>, first: bool) -> Result<()> {
    let signature = match (signature, ascii) {
        (Some(hex), _) => Signature::parse(hex)?,
        (None, Some(text)) => Signature::from_ascii(text)?,
        (None, None) => anyhow::bail!("either --signature or --ascii is required"),
    };
    let bytes = fs::read(file).with_context(|| format!("failed to read {}", file.display()))?;
    let matcher = PatternMatcher::new(&bytes);

    let offsets: Vec<usize> = if first {
        matcher.find_first(&signature).into_iter().collect()
    } else {
        matcher.find_all(&signature)
    };

    if offsets.is_empty() {
        println!("{} {} not found in {}", "⊘".cyan(), signature, file.display());
        std::process::exit(1);
    }
    for offset in &offsets {
        println!("{offset:#010x}");
    }
    println!("{} {} match(es) for {}", "✓".green(), offsets.len(), signature);
    Ok(())
}

fn cmd_identify(file: &Path, profiles: Option<&Path>, patches: Option<&Path>, json: bool) -> Result<()> {
    let registry = match profiles {
        Some(path) => ProfileRegistry::new(load_profiles_from_path(path)?),
        None => ProfileRegistry::default(),
    };
    let sets = match patches {
        Some(path) => load_patch_sets(path)?,
        None => Vec::new(),
    };
    let bytes = fs::read(file).with_context(|| format!("failed to read {}", file.display()))?;
    let engine = PatchEngine::new(EngineConfig::default())?;

    let found = registry.identify(&engine, &bytes, &sets);
    if json {
        println!("{}", serde_json::to_string_pretty(&found)?);
        return Ok(());
    }

    println!("File: {}", file.display());
    println!("Checksum: {}", found.checksum);
    let confidence = match found.confidence {
        sigpatcher::Confidence::Exact => found.confidence.to_string().green(),
        sigpatcher::Confidence::Compatible => found.confidence.to_string().yellow(),
        sigpatcher::Confidence::Unknown => found.confidence.to_string().red(),
    };
    println!("Confidence: {confidence}");
    if !found.candidate_profiles.is_empty() {
        println!("Profiles: {}", found.candidate_profiles.join(", "));
    }
    if !found.compatible_sets.is_empty() {
        println!("Patch sets: {}", found.compatible_sets.join(", "));
    }
    Ok(())
}

fn cmd_fingerprint(file: &Path, name: Option<String>) -> Result<()> {
    let bytes = fs::read(file).with_context(|| format!("failed to read {}", file.display()))?;
    let name = name.unwrap_or_else(|| {
        file.file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| file.display().to_string())
    });
    println!("{}", ProfileRegistry::fingerprint(&bytes, &name));
    Ok(())
}

fn cmd_restore(files: &[PathBuf], suffix: &str) -> Result<()> {
    let guard = IntegrityGuard::new(suffix);
    let mut failed = 0;

    for file in files {
        match guard.restore(file) {
            Ok(checksum) => {
                println!("{} Restored {} (checksum {})", "✓".green(), file.display(), checksum)
            }
            Err(e) => {
                eprintln!("{} {}: {}", "✗".red(), file.display(), e);
                failed += 1;
            }
        }
    }

    if failed > 0 {
        std::process::exit(1);
    }
    Ok(())
}
