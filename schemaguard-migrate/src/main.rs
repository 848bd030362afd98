//! Schemaguard Migration CLI Tool
//!
//! Offline companion for schemaguard: lists discovered scripts with their
//! checksums, shows how a script splits into statements, and scaffolds new
//! scripts. Applying migrations happens in-process through
//! `schemaguard::run_migrations`.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use colored::Colorize;
use schemaguard::migration::scanner::split_location;
use schemaguard::migration::{split_statements, DuplicateStrategy};
use schemaguard::MigrationConfig;
use schemaguard_migrate::{inspect, scaffold};
use std::fs;
use std::path::{Path, PathBuf};
use std::process;

#[derive(Parser)]
#[command(name = "schemaguard-migrate")]
#[command(about = "Inspect and scaffold schemaguard migration scripts")]
#[command(version = "0.1.0")]
struct Cli {
    /// Migration config file (TOML with a [migration] section)
    #[arg(long)]
    config: Option<PathBuf>,

    /// Script location, repeatable (overrides the config file)
    #[arg(long = "location")]
    locations: Vec<String>,

    /// Directory that locations are resolved against
    #[arg(long, default_value = ".")]
    base_dir: PathBuf,

    /// How to treat two scripts with the same version
    #[arg(long, value_enum)]
    duplicates: Option<Duplicates>,

    /// Verbose output
    #[arg(short, long)]
    verbose: bool,

    /// Quiet output (errors only)
    #[arg(short, long)]
    quiet: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Copy, ValueEnum)]
enum Duplicates {
    Fail,
    Ignore,
}

impl From<Duplicates> for DuplicateStrategy {
    fn from(value: Duplicates) -> Self {
        match value {
            Duplicates::Fail => DuplicateStrategy::FailOnDuplicates,
            Duplicates::Ignore => DuplicateStrategy::IgnoreDuplicates,
        }
    }
}

#[derive(Subcommand)]
enum Commands {
    /// List discovered scripts in version order
    List,

    /// Show the statements a script file splits into
    Lex {
        /// Script file
        file: PathBuf,
    },

    /// Create the next migration script
    New {
        /// Script name (e.g., "create_users_table")
        name: String,
    },
}

fn main() {
    dotenv::dotenv().ok();
    let cli = Cli::parse();

    let filter = if cli.quiet {
        "error"
    } else if cli.verbose {
        "debug"
    } else {
        "info"
    };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(filter)).init();

    if let Err(e) = run(&cli) {
        eprintln!("{} {e:#}", "error:".red().bold());
        process::exit(1);
    }
}

fn run(cli: &Cli) -> Result<()> {
    let (locations, strategy) = script_settings(cli)?;
    match &cli.command {
        Commands::List => handle_list(&cli.base_dir, &locations, strategy),
        Commands::Lex { file } => handle_lex(file),
        Commands::New { name } => handle_new(&cli.base_dir, &locations, name, cli.quiet),
    }
}

fn script_settings(cli: &Cli) -> Result<(Vec<String>, DuplicateStrategy)> {
    let (mut locations, mut strategy) = match &cli.config {
        Some(path) => {
            let config = MigrationConfig::load_from(path)
                .with_context(|| format!("loading {}", path.display()))?;
            (config.script_locations, config.duplicate_strategy)
        }
        None => (vec!["migrations".to_string()], DuplicateStrategy::default()),
    };
    if !cli.locations.is_empty() {
        locations = cli.locations.clone();
    }
    if let Some(duplicates) = cli.duplicates {
        strategy = duplicates.into();
    }
    Ok((locations, strategy))
}

fn handle_list(base_dir: &Path, locations: &[String], strategy: DuplicateStrategy) -> Result<()> {
    let scripts = inspect::summarize(base_dir, locations, strategy)?;
    if scripts.is_empty() {
        println!("No migration scripts found in {}", locations.join(", "));
        return Ok(());
    }

    println!("\n{}\n", "Migration scripts".bold());
    for script in &scripts {
        println!(
            "  {:>6}  {:<40} {}  {} statement(s)",
            script.version.to_string().cyan(),
            script.script_name,
            format!("{:08x}", script.checksum).dimmed(),
            script.statements
        );
        if script.never_applied {
            println!("          {}", "version 0 is never applied, renumber from 1".yellow());
        }
    }
    let latest = scripts.last().map_or(0, |s| s.version);
    println!("\n{} script(s), latest version {latest}", scripts.len());
    Ok(())
}

fn handle_lex(file: &Path) -> Result<()> {
    let content = fs::read_to_string(file).with_context(|| format!("reading {}", file.display()))?;
    let statements = split_statements(&content);
    for (i, statement) in statements.iter().enumerate() {
        println!("{} {statement}", format!("[{}]", i + 1).green());
    }
    println!("\n{} statement(s)", statements.len());
    Ok(())
}

fn handle_new(base_dir: &Path, locations: &[String], name: &str, quiet: bool) -> Result<()> {
    let location = locations.first().context("no script location configured")?;
    let (scheme, path) = split_location(location);
    anyhow::ensure!(
        scheme == schemaguard::migration::scanner::FILE_SCHEME,
        "cannot create scripts in non-filesystem location '{location}'"
    );
    let created = scaffold::create_script(&base_dir.join(path), name)?;
    if !quiet {
        println!("{} {}", "Created".green(), created.display());
    }
    Ok(())
}
