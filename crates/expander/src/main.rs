use std::{
    fs,
    io::{self, Write},
    path::{Path, PathBuf},
    process::ExitCode,
};

use anyhow::{Context, Result};
use clap::{ArgAction, Parser};
use expander::{EmbedSpec, Expander, config::Config, graph::ModuleGraph};
use log::{error, info};

/// Embed Python packages into a single script for offline judges
#[derive(Debug, Parser)]
#[command(name = "expander", version, about, long_about = None)]
struct Cli {
    /// Entry script to expand
    entry: PathBuf,

    /// Top-level package to embed (repeatable or comma-separated)
    #[arg(short = 'm', long = "module", value_delimiter = ',')]
    modules: Vec<String>,

    /// Output file; stdout when omitted
    #[arg(short, long)]
    output: Option<PathBuf>,

    /// Extra configuration file, applied after the project configuration
    #[arg(long)]
    config: Option<PathBuf>,

    /// Value of `sys.argv[-1]` that activates the embedded block
    #[arg(long)]
    marker: Option<String>,

    /// Top-level package to skip during import discovery
    #[arg(long, value_delimiter = ',')]
    exclude: Vec<String>,

    /// Additional site-packages directory to search
    #[arg(long = "site-packages")]
    site_packages: Vec<PathBuf>,

    /// Additional first-party source directory to search
    #[arg(long)]
    src: Vec<PathBuf>,

    /// Interpreter whose import path is searched when no virtual environment
    /// is found
    #[arg(long)]
    python: Option<String>,

    /// Print the resolved module graph instead of expanding
    #[arg(long)]
    list_modules: bool,

    /// Increase log verbosity (-v info, -vv debug, -vvv trace)
    #[arg(short, long, action = ArgAction::Count)]
    verbose: u8,
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    match run(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            error!("{err:#}");
            ExitCode::FAILURE
        }
    }
}

fn init_logging(verbose: u8) {
    let level = match verbose {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level))
        .format_timestamp(None)
        .init();
}

fn run(cli: Cli) -> Result<()> {
    let mut config = Config::load(cli.config.as_deref())?;
    config.src.extend(cli.src);
    config.site_packages.extend(cli.site_packages);
    config.exclude.extend(cli.exclude);
    if let Some(marker) = cli.marker {
        config.marker = marker;
    }
    if let Some(python) = cli.python {
        config.python = python;
    }

    let embed = EmbedSpec::new(
        config
            .modules
            .iter()
            .cloned()
            .chain(cli.modules)
            .filter(|module| !module.is_empty()),
    );
    let expander = Expander::new(config);

    if cli.list_modules {
        let graph = expander.module_graph(&cli.entry, &embed)?;
        return print_module_graph(&graph);
    }

    let expansion = expander.expand(&cli.entry, &embed)?;
    if !expansion.bundled.is_empty() {
        info!(
            "bundled {}",
            expansion.bundled.iter().cloned().collect::<Vec<_>>().join(", ")
        );
    }

    match &cli.output {
        Some(path) => write_atomically(path, &expansion.text),
        None => {
            let mut stdout = io::stdout().lock();
            stdout.write_all(expansion.text.as_bytes())?;
            stdout.flush()?;
            Ok(())
        }
    }
}

fn print_module_graph(graph: &ModuleGraph) -> Result<()> {
    let mut stdout = io::stdout().lock();
    for record in graph.modules().values() {
        let path = record
            .artifact
            .as_deref()
            .map(|path| path.display().to_string())
            .unwrap_or_default();
        writeln!(stdout, "{}\t{}\t{path}", record.name, record.kind)?;
    }
    for name in graph.excluded() {
        writeln!(stdout, "{name}\texcluded\t")?;
    }
    for name in graph.missing() {
        writeln!(stdout, "{name}\tmissing\t")?;
    }
    Ok(())
}

/// Write through a temporary file in the destination directory so a failed
/// run never leaves partial output behind. The result keeps the mode of an
/// existing destination; a new one gets the usual umask-derived mode.
fn write_atomically(path: &Path, text: &str) -> Result<()> {
    let dir = path
        .parent()
        .filter(|parent| !parent.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    let mut builder = tempfile::Builder::new();
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        builder.permissions(fs::Permissions::from_mode(0o666));
    }
    let mut file = builder
        .tempfile_in(dir)
        .with_context(|| format!("failed to create a temporary file in {}", dir.display()))?;
    file.write_all(text.as_bytes())?;
    if let Ok(metadata) = fs::metadata(path) {
        file.as_file()
            .set_permissions(metadata.permissions())
            .with_context(|| format!("failed to copy permissions of {}", path.display()))?;
    }
    file.persist(path)
        .with_context(|| format!("failed to write {}", path.display()))?;
    Ok(())
}
