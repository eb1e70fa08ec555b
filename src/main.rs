use clap::{Parser, Subcommand};
use colored::Colorize;
use indicatif::{ProgressBar, ProgressStyle};
use pkgsentry::coordinator::{self, ScoringService, SourceOverrides};
use pkgsentry::shared::config::{self, Config};
use pkgsentry::shared::models::{Ecosystem, PackageContext, PackageMetadata, SandboxTelemetry};
use pkgsentry::shared::schema::schema;
use pkgsentry::shared::scoring::{Label, Verdict};
use pkgsentry::shared::training::{self, TrainingConfig};
use pkgsentry::shared::{logging, output};
use rayon::prelude::*;
use serde::de::DeserializeOwned;
use std::path::{Path, PathBuf};
use std::process;

#[derive(Parser)]
#[command(name = "pkgsentry", version, about = "Malicious package detection for npm and PyPI")]
struct Cli {
    /// Debug logging on stderr (RUST_LOG takes precedence)
    #[arg(short = 'v', long, global = true)]
    verbose: bool,

    /// Emit logs as JSON lines
    #[arg(long, global = true)]
    log_json: bool,

    /// Output verdicts as JSON
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Scan package source trees or packed packages
    Scan {
        /// Package directories or packed packages (.tgz, .tar.gz, .zip, .whl)
        #[arg(required = true)]
        dirs: Vec<PathBuf>,

        /// Package name (defaults to the manifest name)
        #[arg(long)]
        name: Option<String>,

        /// Ecosystem: npm, pypi or other (defaults to manifest detection)
        #[arg(long)]
        ecosystem: Option<Ecosystem>,

        /// Package version (defaults to the manifest version)
        #[arg(long)]
        pkg_version: Option<String>,

        /// Registry metadata as JSON
        #[arg(long)]
        metadata: Option<PathBuf>,

        /// Sandbox telemetry as JSON
        #[arg(long)]
        telemetry: Option<PathBuf>,

        /// Model artifact (overrides config)
        #[arg(long)]
        model: Option<PathBuf>,

        /// Number of concurrent scan threads
        #[arg(long, default_value_t = 4)]
        jobs: usize,
    },
    /// Score a package by name alone
    Check {
        name: String,

        #[arg(long, default_value = "npm")]
        ecosystem: Ecosystem,

        #[arg(long)]
        pkg_version: Option<String>,

        /// Registry metadata as JSON
        #[arg(long)]
        metadata: Option<PathBuf>,

        #[arg(long)]
        model: Option<PathBuf>,
    },
    /// Scan a project and its declared and installed dependencies
    Project {
        dir: PathBuf,

        #[arg(long)]
        model: Option<PathBuf>,

        #[arg(long, default_value_t = 4)]
        jobs: usize,

        /// Show every package, not only flagged ones
        #[arg(short = 'a', long)]
        all: bool,
    },
    /// Train a model artifact from a labeled dataset
    Train {
        /// JSON array or JSON lines of {features, label, ecosystem}
        #[arg(long)]
        dataset: PathBuf,

        /// Output path; `.gz` compresses
        #[arg(long)]
        out: PathBuf,

        #[arg(long, default_value_t = 100)]
        trees: usize,

        #[arg(long, default_value_t = 10)]
        max_depth: usize,

        #[arg(long, default_value_t = 42)]
        seed: u64,
    },
    /// Print the feature columns in order
    Schema,
    /// Show the effective configuration, or write defaults with --init
    Config {
        #[arg(long)]
        init: bool,
    },
}

fn main() {
    let cli = Cli::parse();
    if cli.log_json {
        logging::init_tracing_json(cli.verbose);
    } else {
        logging::init_tracing(cli.verbose);
    }

    let json = cli.json;
    let verbose = cli.verbose;
    let exit_code = match cli.command {
        Commands::Scan {
            dirs,
            name,
            ecosystem,
            pkg_version,
            metadata,
            telemetry,
            model,
            jobs,
        } => {
            let overrides = Overrides {
                name,
                ecosystem,
                version: pkg_version,
                metadata,
                telemetry,
            };
            cmd_scan(&dirs, overrides, model, jobs, json, verbose)
        }
        Commands::Check {
            name,
            ecosystem,
            pkg_version,
            metadata,
            model,
        } => cmd_check(&name, ecosystem, pkg_version, metadata, model, json, verbose),
        Commands::Project {
            dir,
            model,
            jobs,
            all,
        } => cmd_project(&dir, model, jobs, all, json, verbose),
        Commands::Train {
            dataset,
            out,
            trees,
            max_depth,
            seed,
        } => cmd_train(&dataset, &out, trees, max_depth, seed),
        Commands::Schema => {
            for name in schema().names() {
                println!("{name}");
            }
            0
        }
        Commands::Config { init } => cmd_config(init),
    };

    process::exit(exit_code);
}

/// Scan-time overrides as given on the command line (files not yet read).
struct Overrides {
    name: Option<String>,
    ecosystem: Option<Ecosystem>,
    version: Option<String>,
    metadata: Option<PathBuf>,
    telemetry: Option<PathBuf>,
}

fn read_json<T: DeserializeOwned>(path: &Path) -> pkgsentry::Result<T> {
    let text = std::fs::read_to_string(path)?;
    Ok(serde_json::from_str(&text)?)
}

fn load_service(model: Option<PathBuf>) -> Result<(ScoringService, Config), String> {
    let mut config = config::load_config();
    if model.is_some() {
        config.model.path = model;
    }
    let service = ScoringService::from_config(&config).map_err(|e| e.to_string())?;
    if !service.has_model() {
        eprintln!(
            "{} no model artifact loaded; verdicts use rule matches only",
            "warning:".yellow().bold()
        );
    }
    Ok((service, config))
}

fn build_pool(jobs: usize) -> Result<rayon::ThreadPool, String> {
    rayon::ThreadPoolBuilder::new()
        .num_threads(jobs)
        .build()
        .map_err(|e| format!("Failed to build thread pool: {e}"))
}

fn progress_bar(total: usize) -> ProgressBar {
    let pb = ProgressBar::new(total as u64);
    let style = ProgressStyle::default_bar()
        .template("[{elapsed_precise}] {bar:40.cyan/blue} {pos}/{len} ({per_sec})")
        .unwrap_or_else(|_| ProgressStyle::default_bar())
        .progress_chars("##-");
    pb.set_style(style);
    pb
}

fn cmd_scan(
    dirs: &[PathBuf],
    overrides: Overrides,
    model: Option<PathBuf>,
    jobs: usize,
    json: bool,
    verbose: bool,
) -> i32 {
    let (service, config) = match load_service(model) {
        Ok(loaded) => loaded,
        Err(e) => {
            eprintln!("Error: {e}");
            return 1;
        }
    };

    let metadata = match overrides
        .metadata
        .as_deref()
        .map(read_json::<PackageMetadata>)
        .transpose()
    {
        Ok(m) => m,
        Err(e) => {
            eprintln!("Error reading metadata: {e}");
            return 1;
        }
    };
    let telemetry = match overrides
        .telemetry
        .as_deref()
        .map(read_json::<SandboxTelemetry>)
        .transpose()
    {
        Ok(t) => t,
        Err(e) => {
            eprintln!("Error reading telemetry: {e}");
            return 1;
        }
    };

    let context_for = |dir: &PathBuf| -> PackageContext {
        let source = SourceOverrides {
            name: overrides.name.clone(),
            ecosystem: overrides.ecosystem,
            version: overrides.version.clone(),
            metadata: metadata.clone(),
            telemetry: telemetry.clone(),
        };
        coordinator::input_context(dir, source, &config.limits)
    };

    let verdicts: Vec<Verdict> = if dirs.len() == 1 {
        dirs.iter().map(|d| service.score(&context_for(d))).collect()
    } else {
        let pool = match build_pool(jobs) {
            Ok(pool) => pool,
            Err(e) => {
                eprintln!("Error: {e}");
                return 1;
            }
        };
        let pb = progress_bar(dirs.len());
        let verdicts = pool.install(|| {
            dirs.par_iter()
                .map(|d| {
                    let verdict = service.score(&context_for(d));
                    pb.inc(1);
                    verdict
                })
                .collect()
        });
        pb.finish_and_clear();
        verdicts
    };

    report(&verdicts, json, verbose, true)
}

fn cmd_check(
    name: &str,
    ecosystem: Ecosystem,
    version: Option<String>,
    metadata: Option<PathBuf>,
    model: Option<PathBuf>,
    json: bool,
    verbose: bool,
) -> i32 {
    let (service, _) = match load_service(model) {
        Ok(loaded) => loaded,
        Err(e) => {
            eprintln!("Error: {e}");
            return 1;
        }
    };
    let mut ctx = coordinator::declared_context(name, ecosystem, version.as_deref());
    if let Some(path) = metadata {
        match read_json::<PackageMetadata>(&path) {
            Ok(meta) => ctx = ctx.with_metadata(meta),
            Err(e) => {
                eprintln!("Error reading metadata: {e}");
                return 1;
            }
        }
    }
    report(&[service.score(&ctx)], json, verbose, true)
}

fn cmd_project(dir: &Path, model: Option<PathBuf>, jobs: usize, all: bool, json: bool, verbose: bool) -> i32 {
    let (service, config) = match load_service(model) {
        Ok(loaded) => loaded,
        Err(e) => {
            eprintln!("Error: {e}");
            return 1;
        }
    };
    let pool = match build_pool(jobs) {
        Ok(pool) => pool,
        Err(e) => {
            eprintln!("Error: {e}");
            return 1;
        }
    };

    let contexts = coordinator::project_contexts(dir, &config.limits);
    eprintln!(
        "{}",
        format!("Scanning {} packages in {}...", contexts.len(), dir.display()).bold()
    );
    let pb = progress_bar(contexts.len());
    let verdicts: Vec<Verdict> = pool.install(|| {
        contexts
            .par_iter()
            .map(|ctx| {
                let verdict = service.score(ctx);
                pb.inc(1);
                verdict
            })
            .collect()
    });
    pb.finish_and_clear();

    report(&verdicts, json, verbose, all)
}

/// Print verdicts and a summary. Returns 1 if anything is SUSPICIOUS or worse.
fn report(verdicts: &[Verdict], json: bool, verbose: bool, all: bool) -> i32 {
    let flagged = verdicts.iter().any(|v| v.label >= Label::Suspicious);

    if json {
        if let Err(e) = output::print_json(verdicts) {
            eprintln!("Error serializing verdicts: {e}");
            return 1;
        }
        return i32::from(flagged);
    }

    for verdict in verdicts.iter().filter(|v| all || v.label >= Label::Suspicious) {
        output::print_text(verdict, verbose);
    }

    if verdicts.len() > 1 {
        let count = |label: Label| verdicts.iter().filter(|v| v.label == label).count();
        eprintln!();
        eprintln!("{}", "=== pkgsentry scan results ===".bold());
        eprintln!(
            "  Scanned: {}  SAFE: {}  SUSPICIOUS: {}  MALICIOUS: {}",
            verdicts.len(),
            count(Label::Safe),
            count(Label::Suspicious),
            count(Label::Malicious)
        );
        let degraded = verdicts.iter().filter(|v| v.is_degraded()).count();
        if degraded > 0 {
            eprintln!("  Rules-only verdicts: {degraded}");
        }
        if !flagged {
            eprintln!("{}", "All packages look clean.".green());
        }
    }

    i32::from(flagged)
}

fn cmd_train(dataset: &Path, out: &Path, trees: usize, max_depth: usize, seed: u64) -> i32 {
    let rows = match training::load_dataset(dataset) {
        Ok(rows) => rows,
        Err(e) => {
            eprintln!("Error loading dataset: {e}");
            return 1;
        }
    };
    let config = TrainingConfig {
        n_estimators: trees,
        max_depth,
        seed,
        ..TrainingConfig::default()
    };

    let artifact = match training::train(&rows, &config) {
        Ok(artifact) => artifact,
        Err(e) => {
            eprintln!("Error training model: {e}");
            return 1;
        }
    };
    if let Err(e) = artifact.save(out) {
        eprintln!("Error writing {}: {e}", out.display());
        return 1;
    }

    eprintln!("{} {}", "Saved model to".bold(), out.display());
    if let Some(ref m) = artifact.metrics {
        eprintln!(
            "  rows: {} train / {} test",
            m.train_rows, m.test_rows
        );
        eprintln!(
            "  accuracy {:.3}  precision {:.3}  recall {:.3}  f1 {:.3}  roc_auc {:.3}",
            m.accuracy, m.precision, m.recall, m.f1_score, m.roc_auc
        );
        eprintln!("  cv accuracy {:.3} +/- {:.3}", m.cv_mean, m.cv_std);
    }
    0
}

fn cmd_config(init: bool) -> i32 {
    let path = config::config_path();
    if init {
        if path.exists() {
            eprintln!("Config already exists at {}", path.display());
            return 1;
        }
        return match config::save_config(&Config::default(), &path) {
            Ok(()) => {
                eprintln!("Wrote default config to {}", path.display());
                0
            }
            Err(e) => {
                eprintln!("Error: {e}");
                1
            }
        };
    }

    let config = config::load_config();
    match toml::to_string_pretty(&config) {
        Ok(text) => {
            eprintln!("# {}", path.display());
            println!("{text}");
            0
        }
        Err(e) => {
            eprintln!("Error: {e}");
            1
        }
    }
}
