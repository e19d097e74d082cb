//! `dbcrypt` CLI tool for key management and maintenance jobs.

#![warn(clippy::pedantic, clippy::nursery)]

mod env_file;

use anyhow::{bail, Context, Result};
use base64::{engine::general_purpose::STANDARD, Engine as _};
use clap::{Parser, Subcommand};
use dbcrypt::cipher::{CipherEngine, KEY_SIZE};
use dbcrypt::config::{Config, ENV_KEY};
use dbcrypt::error::ErrorKind;
use dbcrypt::progress::Progress;
use dbcrypt::prune::{GroupStatus, OrphanPruner};
use dbcrypt::record::RecordId;
use dbcrypt::rotation::KeyRotation;
use dbcrypt::store::ScanFilter;
use dbcrypt_sqlite::SqliteStore;
use env_file::EnvFile;
use rand::{rngs::OsRng, RngCore};
use std::io::{IsTerminal, Write};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use tracing_subscriber::EnvFilter;
use zeroize::Zeroizing;

#[derive(Parser)]
#[command(name = "dbcrypt", version)]
#[command(about = "dbcrypt key management and maintenance CLI", long_about = None)]
struct Cli {
    /// SQLite database holding the encrypted attributes
    #[arg(long, global = true, default_value = "database.sqlite")]
    database: PathBuf,

    /// File read for settings missing from the environment
    #[arg(long, global = true, default_value = ".env")]
    env_file: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Generate a new base encryption key
    GenerateKey {
        /// Print the key instead of writing it to the env file
        #[arg(long)]
        show: bool,
        /// Overwrite an already configured key
        #[arg(long)]
        force: bool,
    },
    /// Re-encrypt stored attributes, optionally moving them to a new key
    ReEncrypt {
        /// Only records of this table
        #[arg(long, visible_alias = "model")]
        table: Option<String>,
        /// Only records of this attribute
        #[arg(long)]
        attribute: Option<String>,
        /// Records loaded per batch
        #[arg(long, default_value_t = dbcrypt::store::DEFAULT_BATCH_SIZE)]
        batch: usize,
        /// Decrypt every record but write nothing
        #[arg(long)]
        dry_run: bool,
        /// Variable holding the previous key to decrypt with
        #[arg(long, value_name = "VAR")]
        old_key_env: Option<String>,
    },
    /// Remove attributes whose host row no longer exists
    Prune {
        /// Only records of this table
        #[arg(long, visible_alias = "model")]
        table: Option<String>,
        /// Report orphans without deleting them
        #[arg(long)]
        dry_run: bool,
    },
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    match run(cli) {
        Ok(code) => code,
        Err(err) => {
            eprintln!("error: {err:#}");
            ExitCode::FAILURE
        }
    }
}

fn run(cli: Cli) -> Result<ExitCode> {
    let env = EnvFile::load(&cli.env_file)?;
    let config = Config::from_lookup(|name| env.lookup(name));
    init_tracing(&config);

    let span = tracing::info_span!("dbcrypt", indicator = %config.log_indicator);
    let _guard = span.enter();

    match cli.command {
        Commands::GenerateKey { show, force } => generate_key(&env, &config, show, force),
        Commands::ReEncrypt { table, attribute, batch, dry_run, old_key_env } => {
            let mut filter = ScanFilter::all();
            if let Some(table) = table {
                println!("Filtering by table: {table}");
                filter = filter.object_type(table);
            }
            if let Some(attribute) = attribute {
                filter = filter.attribute(attribute);
            }
            let job = KeyRotation::new().filter(filter).batch_size(batch).dry_run(dry_run);
            re_encrypt(&cli.database, &env, &config, &job, old_key_env.as_deref())
        }
        Commands::Prune { table, dry_run } => {
            let mut pruner = OrphanPruner::new().dry_run(dry_run);
            if let Some(table) = table {
                println!("Filtering by table: {table}");
                pruner = pruner.object_type(table);
            }
            prune(&cli.database, &config, &pruner)
        }
    }
}

fn init_tracing(config: &Config) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.log_directive()));
    tracing_subscriber::fmt().with_env_filter(filter).with_writer(std::io::stderr).init();
}

fn generate_key(env: &EnvFile, config: &Config, show: bool, force: bool) -> Result<ExitCode> {
    let mut bytes = Zeroizing::new([0u8; KEY_SIZE]);
    OsRng.fill_bytes(&mut bytes[..]);
    let key = Zeroizing::new(STANDARD.encode(&bytes[..]));

    if show {
        println!("{}", key.as_str());
        return Ok(ExitCode::SUCCESS);
    }

    if config.has_key() && !force {
        bail!(
            "an encryption key is already configured and replacing it invalidates all \
             stored data; pass --force to continue"
        );
    }
    env.write_var(ENV_KEY, &key)?;

    println!("Database encryption key generated successfully.");
    println!("The key has been set in your env file as {ENV_KEY}");
    Ok(ExitCode::SUCCESS)
}

fn re_encrypt(
    database: &Path,
    env: &EnvFile,
    config: &Config,
    job: &KeyRotation,
    old_key_env: Option<&str>,
) -> Result<ExitCode> {
    if !config.has_key() {
        bail!("no encryption key found; set {ENV_KEY} in the environment or env file");
    }
    let target = CipherEngine::from_config(config);
    let source = match old_key_env {
        Some(var) => {
            let old_key = env
                .lookup(var)
                .map(Zeroizing::new)
                .filter(|k| !k.trim().is_empty())
                .with_context(|| format!("{var} is not set"))?;
            CipherEngine::new(old_key.as_str())
        }
        None => target.clone(),
    };

    let store = SqliteStore::open(database, config.primary_key_format)
        .with_context(|| format!("failed to open {}", database.display()))?;

    println!("Starting re-encryption process...");
    let mut progress = Counter::default();
    let report = job.run(&source, &target, &store, &mut progress)?;

    if report.total == 0 {
        println!("No encrypted attributes found to re-encrypt.");
        return Ok(ExitCode::SUCCESS);
    }
    if report.dry_run {
        println!("DRY RUN: Would have processed {} record(s).", report.processed);
    } else {
        println!("Successfully re-encrypted {} record(s).", report.processed);
    }
    if report.already_rotated > 0 {
        println!("{} record(s) were already under the new key.", report.already_rotated);
    }

    if report.is_success() {
        Ok(ExitCode::SUCCESS)
    } else {
        eprintln!("Encountered {} error(s) during re-encryption.", report.errors());
        Ok(ExitCode::FAILURE)
    }
}

fn prune(database: &Path, config: &Config, pruner: &OrphanPruner) -> Result<ExitCode> {
    let store = SqliteStore::open(database, config.primary_key_format)
        .with_context(|| format!("failed to open {}", database.display()))?;

    println!("Scanning for orphaned encrypted attributes...");
    let mut progress = Counter::default();
    let report = pruner.run(&store, &store, &mut progress)?;

    for group in &report.groups {
        match &group.status {
            GroupStatus::Skipped(reason) => {
                eprintln!("Could not check table '{}': {reason}", group.object_type);
            }
            GroupStatus::DeleteFailed(kind) => {
                eprintln!("Failed to delete orphans in table '{}': {kind}", group.object_type);
            }
            GroupStatus::Checked if !group.orphans.is_empty() => {
                println!(
                    "Found {} orphaned record(s) in table '{}'",
                    group.orphans.len(),
                    group.object_type
                );
            }
            GroupStatus::Checked => {}
        }
    }

    match (report.orphans(), report.dry_run) {
        (0, _) => println!("No orphaned encrypted attributes found."),
        (n, true) => println!("DRY RUN: Would have deleted {n} orphaned record(s)."),
        (_, false) => println!("Successfully deleted {} orphaned record(s).", report.deleted()),
    }

    Ok(if report.is_success() { ExitCode::SUCCESS } else { ExitCode::FAILURE })
}

/// Progress line on stderr, drawn only when stderr is a terminal.
#[derive(Default)]
struct Counter {
    total: u64,
    done: u64,
    failed: u64,
}

impl Counter {
    fn draw(&self) {
        let mut stderr = std::io::stderr();
        if stderr.is_terminal() {
            let _ = write!(stderr, "\r{}/{} ({} failed)", self.done, self.total, self.failed);
            let _ = stderr.flush();
        }
    }
}

impl Progress for Counter {
    fn start(&mut self, total: u64) {
        self.total = total;
        self.draw();
    }

    fn advance(&mut self, count: u64) {
        self.done += count;
        self.draw();
    }

    fn record_failed(&mut self, record_id: RecordId, kind: ErrorKind) {
        self.failed += 1;
        eprintln!("\rRecord {record_id} failed: {kind}");
    }

    fn finish(&mut self) {
        if std::io::stderr().is_terminal() {
            eprintln!();
        }
    }
}
