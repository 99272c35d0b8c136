//! ingest CLI: resumable, content-addressed uploads of study files.

mod config_file;

use std::collections::BTreeSet;
use std::fs::File;
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};

use clap::{Args, Parser, Subcommand};
use ingest_core::config::IngestConfig;
use ingest_core::location::{ObjectUri, Provider};
use ingest_core::manifest::{ManifestSchema, Variant};
use ingest_exec::imaging::CommandConverter;
use ingest_exec::interrupt::InterruptController;
use ingest_exec::{Engine, ExecError, RunInput, RunOutcome};
use ingest_io::lister::list_directory;
use ingest_io::storage::build_backends;
use ingest_io::tsv;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use crate::config_file::ConfigFile;

#[derive(Parser)]
#[command(name = "ingest")]
#[command(about = "Resumable content-addressed transfer of study files to S3 and GCS", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Validate, checksum and transfer every row of a manifest
    Run(RunArgs),

    /// Write a starter manifest from a directory walk
    Generate {
        #[arg(long)]
        directory: PathBuf,

        #[arg(long)]
        study_id: String,

        #[arg(long, default_value = "")]
        consent_group: String,

        /// Defaults to stdout
        #[arg(long)]
        output: Option<PathBuf>,
    },

    /// Split a manifest into FILE.1, FILE.2, ... of at most N rows each
    Split {
        #[arg(long)]
        tsv: PathBuf,

        #[arg(long)]
        lines: usize,
    },
}

#[derive(Args, Debug, Default)]
struct RunArgs {
    /// Input manifest
    #[arg(long, conflicts_with = "directory", required_unless_present = "directory")]
    tsv: Option<PathBuf>,

    /// List this directory instead of reading a manifest
    #[arg(long, requires = "study_id")]
    directory: Option<PathBuf>,

    #[arg(long)]
    study_id: Option<String>,

    #[arg(long, default_value = "")]
    consent_group: String,

    /// Directory that relative input paths resolve against (set by --directory)
    #[arg(long, conflicts_with = "directory")]
    source_root: Option<PathBuf>,

    /// Upload to Google Cloud Storage
    #[arg(long)]
    gs: bool,

    /// Upload to Amazon S3
    #[arg(long)]
    aws: bool,

    /// Fixed destination bucket instead of `{study_id}--{consent_group}`
    #[arg(long)]
    bucket: Option<String>,

    /// Validate sources and buckets, then exit
    #[arg(long)]
    test: bool,

    /// Keep computed columns and skip completed work
    #[arg(long)]
    resume: bool,

    /// Sets both checksum and upload worker counts
    #[arg(long)]
    threads: Option<usize>,

    #[arg(long, alias = "checksum_threads")]
    checksum_threads: Option<usize>,

    #[arg(long, alias = "upload_threads")]
    upload_threads: Option<usize>,

    /// Bytes per chunk (reads, multipart parts and the S3 tag)
    #[arg(long)]
    chunk_size: Option<usize>,

    /// Cross-provider objects below this many MB are staged locally
    #[arg(long)]
    max_download_size: Option<u64>,

    /// Manifest uses the imaging columns; DICOM slices are stacked
    #[arg(long)]
    imaging: bool,

    /// Converter invoked as `COMMAND OUTPUT SLICE..`
    #[arg(long, requires = "imaging")]
    imaging_command: Option<String>,

    #[arg(long)]
    staging_dir: Option<String>,

    #[arg(long)]
    no_receipt_upload: bool,

    /// Log integrity mismatches instead of failing the row
    #[arg(long)]
    lenient_integrity: bool,

    /// YAML configuration file
    #[arg(long)]
    config: Option<PathBuf>,

    #[arg(short, long)]
    verbose: bool,
}

fn main() {
    let cli = Cli::parse();

    let result = match cli.command {
        Commands::Run(args) => {
            init_tracing(args.verbose);
            run(args)
        }
        Commands::Generate {
            directory,
            study_id,
            consent_group,
            output,
        } => {
            init_tracing(false);
            generate(&directory, &study_id, &consent_group, output.as_deref())
        }
        Commands::Split { tsv, lines } => {
            init_tracing(false);
            split(&tsv, lines)
        }
    };
    if let Err(e) = result {
        eprintln!("Error: {}", e);
        std::process::exit(1);
    }
}

fn init_tracing(verbose: bool) {
    let fallback = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(fallback));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .init();
}

fn build_config(args: &RunArgs) -> Result<IngestConfig, Box<dyn std::error::Error>> {
    let mut config = IngestConfig::from_env();
    if let Some(path) = &args.config {
        ConfigFile::load(path)?.apply(&mut config)?;
    }
    apply_run_args(&mut config, args)?;
    Ok(config)
}

fn apply_run_args(config: &mut IngestConfig, args: &RunArgs) -> Result<(), Box<dyn std::error::Error>> {
    if args.gs || args.aws {
        config.targets.gcs = args.gs;
        config.targets.aws = args.aws;
    }
    if let Some(bucket) = &args.bucket {
        config.bucket = Some(bucket.clone());
    }
    if args.test {
        config.verify_only = true;
    }
    if args.resume {
        config.resume = true;
    }
    if let Some(n) = args.threads {
        config.checksum_threads = n;
        config.upload_threads = n;
    }
    if let Some(n) = args.checksum_threads {
        config.checksum_threads = n;
    }
    if let Some(n) = args.upload_threads {
        config.upload_threads = n;
    }
    if let Some(size) = args.chunk_size {
        config.chunk_size = size;
    }
    if let Some(mb) = args.max_download_size {
        config.max_download_size = mb
            .checked_mul(1_000_000)
            .ok_or_else(|| format!("--max-download-size {mb} MB is too large"))?;
    }
    if let Some(dir) = &args.staging_dir {
        config.staging_dir = Some(dir.clone());
    }
    if args.no_receipt_upload {
        config.upload_receipt = false;
    }
    if args.lenient_integrity {
        config.strict_integrity = false;
    }
    if let Some(root) = args.directory.as_ref().or(args.source_root.as_ref()) {
        // Listed rows carry paths relative to the directory.
        config.source_root = Some(root.display().to_string());
    }
    Ok(())
}

/// Arguments that pick up where a run left off.
fn resume_hint(receipt: &Path, source_root: Option<&str>) -> String {
    match source_root {
        Some(root) => format!("--resume --tsv {} --source-root {root}", receipt.display()),
        None => format!("--resume --tsv {}", receipt.display()),
    }
}

fn load_input(args: &RunArgs, variant: Variant) -> Result<RunInput, Box<dyn std::error::Error>> {
    if let Some(dir) = &args.directory {
        let study_id = args.study_id.as_deref().unwrap_or_default();
        let rows = list_directory(dir, study_id, &args.consent_group)?;
        info!(rows = rows.len(), directory = %dir.display(), "directory listed");
        return Ok(RunInput {
            schema: ManifestSchema::new(variant),
            rows,
            origin: dir.clone(),
        });
    }
    let path = args.tsv.as_ref().ok_or("either --tsv or --directory is required")?;
    let loaded = tsv::read_manifest(path, variant)?;
    if !loaded.repaired.is_empty() {
        warn!(rows = loaded.repaired.len(), "half-filled destinations discarded");
    }
    info!(rows = loaded.rows.len(), manifest = %path.display(), "manifest loaded");
    Ok(RunInput {
        schema: loaded.schema,
        rows: loaded.rows,
        origin: path.clone(),
    })
}

fn run(args: RunArgs) -> Result<(), Box<dyn std::error::Error>> {
    let config = build_config(&args)?;
    let variant = if args.imaging {
        Variant::Imaging
    } else {
        Variant::Standard
    };
    let input = load_input(&args, variant)?;

    // Remote sources need a client for their own provider too.
    let mut providers: BTreeSet<Provider> = config.targets.providers().into_iter().collect();
    for row in &input.rows {
        if row.input_file_path.contains("://") {
            if let Ok(uri) = ObjectUri::parse(&row.input_file_path) {
                providers.insert(uri.provider);
            }
        }
    }
    let providers: Vec<Provider> = providers.into_iter().collect();
    let backends = build_backends(&providers, |p| config.storage_config(p))?;
    let source_root = config.source_root.clone();

    let mut engine = Engine::new(config, backends);
    if let Some(command) = &args.imaging_command {
        let converter = CommandConverter::parse(command).ok_or("--imaging-command is empty")?;
        engine = engine.with_converter(Box::new(converter));
    }

    let hook = engine.shutdown_hook();
    let signal_root = source_root.clone();
    let _interrupts = InterruptController::install(engine.cancel_token(), move |signal| {
        match hook.flush() {
            Some(path) => eprintln!(
                "Interrupted by {signal}. Manifest saved to {}; rerun with {}",
                path.display(),
                resume_hint(&path, signal_root.as_deref())
            ),
            None => eprintln!("Interrupted by {signal} before any manifest was written"),
        }
        std::process::exit(1);
    })?;

    match engine.run(input) {
        Ok(RunOutcome::Verified { rows }) => {
            println!("✓ Validation passed for {rows} rows");
            Ok(())
        }
        Ok(RunOutcome::Completed(report)) => {
            println!("✓ Run complete");
            println!("  Manifest: {}", report.manifest_path.display());
            println!("  Rows: {}", report.rows);
            println!("  Incomplete: {}", report.incomplete);
            println!(
                "  Uploaded: {}  Copied: {}  Staged: {}  Streamed: {}  Deduplicated: {}  Skipped: {}",
                report.metrics.uploaded,
                report.metrics.copied,
                report.metrics.staged,
                report.metrics.streamed,
                report.metrics.deduplicated,
                report.metrics.skipped
            );
            for failed in &report.failures {
                println!(
                    "  Failed [{}]: {} ({})",
                    failed.failure.kind(),
                    failed.input_file_path,
                    failed.failure
                );
            }
            if report.incomplete > 0 {
                println!(
                    "  Rerun with {} to retry incomplete rows",
                    resume_hint(&report.manifest_path, source_root.as_deref())
                );
            }
            Ok(())
        }
        Err(ExecError::Interrupted(path)) => Err(format!(
            "run interrupted; rerun with {}",
            resume_hint(&path, source_root.as_deref())
        )
        .into()),
        Err(e) => Err(e.into()),
    }
}

fn generate(
    directory: &Path,
    study_id: &str,
    consent_group: &str,
    output: Option<&Path>,
) -> Result<(), Box<dyn std::error::Error>> {
    let rows = list_directory(directory, study_id, consent_group)?;
    let schema = ManifestSchema::new(Variant::Standard);
    match output {
        Some(path) => {
            let mut out = BufWriter::new(File::create(path)?);
            tsv::write_manifest(&mut out, &schema, &rows)?;
            out.flush()?;
            eprintln!("✓ Wrote {} rows to {}", rows.len(), path.display());
        }
        None => {
            let stdout = io::stdout();
            let mut out = stdout.lock();
            tsv::write_manifest(&mut out, &schema, &rows)?;
            out.flush()?;
        }
    }
    Ok(())
}

fn split(path: &Path, lines: usize) -> Result<(), Box<dyn std::error::Error>> {
    let parts = tsv::split_manifest(path, lines)?;
    for part in &parts {
        println!("{}", part.display());
    }
    Ok(())
}
