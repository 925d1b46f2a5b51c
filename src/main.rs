use anyhow::{Context, Result};
use brave_patcher::engine::format_offsets;
use brave_patcher::{
    catalog, BackupStore, Catalog, DirectoryScan, ErrorKind, FixedPath, PatchEngine, PatchError,
    RuleOutcome, RuleSelection, Settings, TargetLocator, Verdict,
};
use clap::{Args, Parser, Subcommand};
use colored::Colorize;
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "brave-patcher")]
#[command(about = "Reversible byte patching for Brave's chrome.dll", long_about = None)]
#[command(version)]
struct Cli {
    /// Settings file (default: ./brave-patcher.toml, then ~/.brave-patcher.toml)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Increase log verbosity (-v info, -vv debug)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Args)]
struct TargetArgs {
    /// Module file to operate on
    #[arg(short, long, conflicts_with = "install_dir")]
    target: Option<PathBuf>,

    /// Directory to scan for the module (e.g. Brave's Application folder)
    #[arg(short = 'd', long)]
    install_dir: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Apply catalog rules to the module
    Patch {
        #[command(flatten)]
        target: TargetArgs,

        /// Pattern catalog (JSON)
        #[arg(long)]
        catalog: Option<PathBuf>,

        /// Rule id to apply; repeat for several (default: rules enabled in the catalog)
        #[arg(short, long = "enable", value_name = "RULE")]
        enable: Vec<String>,

        /// Apply every rule in the catalog
        #[arg(long, conflicts_with = "enable")]
        all: bool,
    },

    /// Restore the module from its backup
    Restore {
        #[command(flatten)]
        target: TargetArgs,

        /// Delete the backup after a successful restore
        #[arg(long)]
        discard: bool,
    },

    /// Show which rules are applied, pending or missing
    Status {
        #[command(flatten)]
        target: TargetArgs,

        /// Pattern catalog (JSON)
        #[arg(long)]
        catalog: Option<PathBuf>,
    },

    /// List rules in the catalog
    List {
        /// Pattern catalog (JSON)
        #[arg(long)]
        catalog: Option<PathBuf>,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    let settings = Settings::discover(cli.config.as_deref())?;

    match cli.command {
        Commands::Patch {
            target,
            catalog,
            enable,
            all,
        } => cmd_patch(&settings, target, catalog, enable, all),
        Commands::Restore { target, discard } => cmd_restore(&settings, target, discard),
        Commands::Status { target, catalog } => cmd_status(&settings, target, catalog),
        Commands::List { catalog } => cmd_list(&settings, catalog),
    }
}

fn init_logging(verbose: u8) {
    let level = match verbose {
        0 => "warn",
        1 => "info",
        _ => "debug",
    };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level))
        .format_timestamp(None)
        .init();
}

/// Resolve the target path: explicit flag, then scan of an install directory.
fn resolve_target(settings: &Settings, args: TargetArgs) -> Result<PathBuf> {
    if let Some(path) = args.target {
        return Ok(FixedPath(path).locate()?);
    }

    let Some(dir) = args.install_dir.or_else(|| settings.install_dir.clone()) else {
        anyhow::bail!(
            "{}\n{}\n  {}\n  {}",
            "No target module specified.".red(),
            "Try one of:".bold(),
            "1. Pass it explicitly: brave-patcher patch --target /path/to/chrome.dll",
            "2. Scan an install directory: brave-patcher patch --install-dir /path/to/Brave-Browser/Application"
        );
    };

    let path = DirectoryScan::new(&dir, &settings.module_name).locate()?;
    println!(
        "{}",
        format!("Found {}: {}", settings.module_name, path.display()).dimmed()
    );
    Ok(path)
}

fn load_catalog(settings: &Settings, flag: Option<PathBuf>) -> Result<Catalog> {
    let path = flag.or_else(|| settings.catalog.clone()).context(
        "no pattern catalog specified; pass --catalog or set `catalog` in brave-patcher.toml",
    )?;
    println!("Loading patterns from {}...", path.display());
    Ok(catalog::load_from_path(&path)?)
}

fn selection(settings: &Settings, enable: Vec<String>, all: bool) -> RuleSelection {
    if all {
        RuleSelection::All
    } else if !enable.is_empty() {
        RuleSelection::Only(enable)
    } else if let Some(enabled) = &settings.enabled {
        RuleSelection::Only(enabled.clone())
    } else {
        RuleSelection::CatalogDefaults
    }
}

/// Guidance for an error kind, for the user rather than the log.
fn advice(kind: ErrorKind) -> Option<&'static str> {
    match kind {
        ErrorKind::Locked => Some("Close the browser (all windows and background processes) and retry"),
        ErrorKind::Busy => Some("Another patch or restore is running on this file; wait for it to finish"),
        ErrorKind::NotFound => Some("The pattern catalog is probably outdated for this browser version"),
        ErrorKind::AmbiguousCount => Some("The signature is not unique in this build; the catalog rule needs a more specific pattern"),
        ErrorKind::BackupMissing => Some("No backup was recorded for this file; reinstall the browser to get a clean copy"),
        ErrorKind::BackupCorrupt => Some("The backup failed its checksum; it was left untouched for inspection"),
        ErrorKind::UnknownRule => Some("Run `brave-patcher list` to see available rule ids"),
        ErrorKind::InvalidTarget => Some("Point --target at the module file itself, not a directory"),
        ErrorKind::Catalog | ErrorKind::Io | ErrorKind::Edit => None,
    }
}

fn report_failure(action: &str, error: &PatchError) -> ! {
    eprintln!("{} {} failed: {}", "✗".red(), action, error);
    eprintln!("  Kind: {}", error.kind());
    if let Some(hint) = advice(error.kind()) {
        eprintln!("  {}", hint.yellow());
    }
    std::process::exit(1);
}

fn cmd_patch(
    settings: &Settings,
    target: TargetArgs,
    catalog: Option<PathBuf>,
    enable: Vec<String>,
    all: bool,
) -> Result<()> {
    let catalog = load_catalog(settings, catalog)?;
    let target = resolve_target(settings, target)?;
    let selection = selection(settings, enable, all);

    println!("Target: {}", target.display());
    println!();

    let engine = PatchEngine::new(catalog, BackupStore::new(&settings.backup_suffix));
    let report = match engine.patch(&target, &selection) {
        Ok(report) => report,
        Err(e) => report_failure("Patch", &e),
    };

    let mut applied = 0;
    let mut already = 0;
    let mut skipped = 0;
    for (rule_id, outcome) in &report.outcomes {
        match outcome {
            RuleOutcome::Applied { .. } => {
                println!("{} {}: {}", "✓".green(), rule_id, outcome);
                applied += 1;
            }
            RuleOutcome::AlreadyPatched { .. } => {
                println!("{} {}: {}", "⊙".yellow(), rule_id, outcome);
                already += 1;
            }
            RuleOutcome::Skipped => {
                println!("{} {}: {}", "⊘".cyan(), rule_id, outcome);
                skipped += 1;
            }
        }
    }

    if report.backup_created {
        println!(
            "{}",
            format!(
                "Backup written to {}",
                engine.backups().backup_path(&report.target).display()
            )
            .dimmed()
        );
    }

    println!();
    println!("{}", "Summary:".bold());
    println!("  {} applied", format!("{}", applied).green());
    println!("  {} already applied", format!("{}", already).yellow());
    println!("  {} skipped", format!("{}", skipped).cyan());
    println!("  {} bytes changed", report.bytes_changed);

    Ok(())
}

fn cmd_restore(settings: &Settings, target: TargetArgs, discard: bool) -> Result<()> {
    let target = resolve_target(settings, target)?;
    let engine = PatchEngine::new(Catalog::default(), BackupStore::new(&settings.backup_suffix));

    let result = if discard {
        engine.restore_and_discard(&target)
    } else {
        engine.restore(&target)
    };

    match result {
        Ok(report) => {
            println!(
                "{} Restored {} ({} bytes, xxh3 {:016x})",
                "✓".green(),
                report.target.display(),
                report.size,
                report.checksum
            );
            if report.backup_discarded {
                println!("{}", "Backup discarded".dimmed());
            }
            Ok(())
        }
        Err(e) => report_failure("Restore", &e),
    }
}

fn cmd_status(settings: &Settings, target: TargetArgs, catalog: Option<PathBuf>) -> Result<()> {
    let catalog = load_catalog(settings, catalog)?;
    let target = resolve_target(settings, target)?;
    let engine = PatchEngine::new(catalog, BackupStore::new(&settings.backup_suffix));

    let evaluation = match engine.evaluate(&target, &RuleSelection::All) {
        Ok(evaluation) => evaluation,
        Err(e) => report_failure("Status", &e),
    };

    println!("{}", "Patch Status Report".bold());
    println!("Target: {}", evaluation.target.display());
    println!(
        "Size: {} bytes, xxh3 {:016x}",
        evaluation.size, evaluation.checksum
    );
    match &evaluation.backup {
        Some(record) => {
            let created = chrono::DateTime::from_timestamp(record.created as i64, 0)
                .map(|t| t.format("%Y-%m-%d %H:%M:%S UTC").to_string())
                .unwrap_or_else(|| record.created.to_string());
            println!(
                "Backup: {} ({} bytes, created {})",
                record.backup.display(),
                record.size,
                created
            );
        }
        None => println!("Backup: {}", "none".dimmed()),
    }
    println!();

    for (rule_id, result) in &evaluation.results {
        let enabled = engine.catalog().get(rule_id).is_some_and(|r| r.enabled());
        let marker = if enabled { "" } else { " (disabled by default)" };
        match result.verdict {
            Verdict::AlreadyPatched => println!(
                "{} {}: applied at {}{}",
                "✓".green(),
                rule_id,
                format_offsets(&result.patched_offsets),
                marker.dimmed()
            ),
            Verdict::Satisfied if result.offsets.is_empty() => println!(
                "{} {}: no occurrences{}",
                "⊘".cyan(),
                rule_id,
                marker.dimmed()
            ),
            Verdict::Satisfied => println!(
                "{} {}: not applied, found at {}{}",
                "⊙".yellow(),
                rule_id,
                format_offsets(&result.offsets),
                marker.dimmed()
            ),
            Verdict::NotFound => println!(
                "{} {}: signature not found{}",
                "✗".red(),
                rule_id,
                marker.dimmed()
            ),
            Verdict::AmbiguousCount => println!(
                "{} {}: ambiguous, {} occurrences (expected {}){}",
                "✗".red(),
                rule_id,
                result.count(),
                engine
                    .catalog()
                    .get(rule_id)
                    .map(|r| r.expected().to_string())
                    .unwrap_or_default(),
                marker.dimmed()
            ),
        }
    }

    Ok(())
}

fn cmd_list(settings: &Settings, catalog: Option<PathBuf>) -> Result<()> {
    let catalog = load_catalog(settings, catalog)?;
    println!();

    for rule in catalog.iter() {
        let state = if rule.enabled() {
            "enabled".green()
        } else {
            "disabled".dimmed()
        };
        println!(
            "{} [{}] {} bytes, expects {}",
            rule.id().bold(),
            state,
            rule.len(),
            rule.expected()
        );
        if let Some(description) = rule.description() {
            println!("  {}", description);
        }
        println!("  pattern: {}", rule.pattern().to_string().dimmed());
    }

    println!();
    println!("{} rules", catalog.len());
    Ok(())
}
