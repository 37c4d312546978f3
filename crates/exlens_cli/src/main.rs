//! exlens: run, inspect and instrument exlens modules.
//!
//! ```bash
//! # Run a module and call one of its functions through the enrichment wrapper
//! exlens run foo_data.exa --entry subscr_binary
//!
//! # Show a listing with the bookkeeping instructions inserted
//! exlens dis foo_data.exa --instrument
//!
//! # Write an instrumented binary module
//! exlens instrument foo_data.exa -o foo_data.exb
//! ```

use std::fs;
use std::path::{Path, PathBuf};
use std::process::ExitCode;

use anyhow::{anyhow, Context, Result};
use clap::{Args, Parser, Subcommand};
use exlens_asm::disassemble;
use exlens_debug::{
    EnrichConfig, Enricher, ImportError, ImporterConfig, ModuleImporter, ModuleSource, SourceKind,
};
use exlens_ir::{instrument_with_stats, is_instrumented, Procedure};
use exlens_vm::{Exception, Value, Vm};
use serde::Deserialize;
use serde_json::json;
use tracing::{debug, info};
use tracing_subscriber::EnvFilter;

const LOG_ENV: &str = "EXLENS_LOG";

#[derive(Parser)]
#[command(
    name = "exlens",
    version,
    about = "Run instrumented modules with enriched failure messages"
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Output as JSON instead of human-readable format
    #[arg(long, global = true)]
    json: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Import a module and optionally call one of its functions
    Run(RunCmd),
    /// Print the listing of a module
    Dis(DisCmd),
    /// Write the instrumented binary form of a module
    Instrument(InstrumentCmd),
}

#[derive(Args)]
struct RunCmd {
    /// Module file (.exa listing or .exb binary)
    file: PathBuf,

    /// Function to call through the enrichment wrapper
    #[arg(long)]
    entry: Option<String>,

    /// Run bodies as loaded, without bookkeeping instructions
    #[arg(long)]
    no_instrument: bool,

    /// TOML file with [enrich] and [importer] tables
    #[arg(long)]
    config: Option<PathBuf>,

    /// Extra module search path (repeatable)
    #[arg(long = "path", short = 'I')]
    paths: Vec<PathBuf>,
}

#[derive(Args)]
struct DisCmd {
    file: PathBuf,

    /// Insert the bookkeeping instructions before printing
    #[arg(long)]
    instrument: bool,
}

#[derive(Args)]
struct InstrumentCmd {
    file: PathBuf,

    /// Output path for the binary module
    #[arg(short, long)]
    output: PathBuf,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct CliConfig {
    enrich: EnrichConfig,
    importer: ImporterConfig,
}

fn load_config(path: Option<&Path>) -> Result<CliConfig> {
    let Some(path) = path else {
        return Ok(CliConfig::default());
    };
    let text = fs::read_to_string(path)
        .with_context(|| format!("failed to read config {}", path.display()))?;
    let config = toml::from_str(&text)
        .with_context(|| format!("failed to parse config {}", path.display()))?;
    debug!(path = %path.display(), ?config, "loaded config");
    Ok(config)
}

fn init_logging() {
    let filter = EnvFilter::try_from_env(LOG_ENV).unwrap_or_else(|_| EnvFilter::new("warn"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

/// `ImportError` is not `Send`; only its text reaches `anyhow`.
fn import_error(err: ImportError) -> anyhow::Error {
    anyhow!("{err}")
}

fn read_procedure(path: &Path) -> Result<Procedure> {
    let loader = ModuleImporter::new(ImporterConfig {
        search_paths: Vec::new(),
        instrument: false,
    });
    let source = ModuleSource {
        name: module_name(path)?,
        path: path.to_path_buf(),
        kind: SourceKind::from_path(path),
        is_package: false,
    };
    loader.load_procedure(&source).map_err(import_error)
}

fn module_name(path: &Path) -> Result<String> {
    path.file_stem()
        .and_then(|stem| stem.to_str())
        .map(str::to_string)
        .with_context(|| format!("cannot derive a module name from {}", path.display()))
}

fn report_failure(exc: &Exception, json: bool) -> Result<ExitCode> {
    if json {
        let report = json!({
            "status": "error",
            "kind": exc.kind.name(),
            "message": exc.message(),
            "enriched": exc.enriched,
            "traceback": exc.traceback,
        });
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        eprintln!("{}", exc.render_traceback());
    }
    Ok(ExitCode::FAILURE)
}

fn run(cmd: RunCmd, json: bool) -> Result<ExitCode> {
    let config = load_config(cmd.config.as_deref())?;
    let mut importer_config = config.importer;
    if cmd.no_instrument {
        importer_config.instrument = false;
    }
    if let Some(dir) = cmd.file.parent() {
        let dir = if dir.as_os_str().is_empty() {
            PathBuf::from(".")
        } else {
            dir.to_path_buf()
        };
        importer_config.search_paths.insert(0, dir);
    }
    importer_config.search_paths.extend(cmd.paths);
    let importer = ModuleImporter::new(importer_config);
    let enricher = Enricher::new(config.enrich);
    let mut vm = Vm::new();

    let namespace = match importer.import_path(&mut vm, &cmd.file) {
        Ok(namespace) => namespace,
        Err(ImportError::Execution { exception, .. }) => {
            let exception = enricher.enrich(&vm, *exception);
            return report_failure(&exception, json);
        }
        Err(err) => return Err(import_error(err)),
    };

    let Some(entry) = cmd.entry else {
        if json {
            println!("{}", serde_json::to_string_pretty(&json!({ "status": "ok" }))?);
        }
        return Ok(ExitCode::SUCCESS);
    };
    let callable = namespace
        .get(&entry)
        .with_context(|| format!("module '{}' has no attribute '{entry}'", namespace.name))?;
    info!(module = %namespace.name, entry = %entry, "calling entry point");
    match enricher.call(&mut vm, &callable, Vec::new()) {
        Ok(result) => {
            if json {
                let report = json!({ "status": "ok", "result": result.repr() });
                println!("{}", serde_json::to_string_pretty(&report)?);
            } else if result != Value::None {
                println!("{}", result.repr());
            }
            Ok(ExitCode::SUCCESS)
        }
        Err(exc) => report_failure(&exc, json),
    }
}

fn dis(cmd: DisCmd) -> Result<ExitCode> {
    let mut procedure = read_procedure(&cmd.file)?;
    if cmd.instrument && !is_instrumented(&procedure) {
        procedure = instrument_with_stats(procedure).0;
    }
    print!("{}", disassemble(&procedure));
    Ok(ExitCode::SUCCESS)
}

fn instrument(cmd: InstrumentCmd, json: bool) -> Result<ExitCode> {
    let procedure = read_procedure(&cmd.file)?;
    let (procedure, guarded) = if is_instrumented(&procedure) {
        (procedure, 0)
    } else {
        let (procedure, stats) = instrument_with_stats(procedure);
        (procedure, stats.total())
    };
    let bytes = procedure.to_bytes()?;
    fs::write(&cmd.output, bytes)
        .with_context(|| format!("failed to write {}", cmd.output.display()))?;
    if json {
        let report = json!({
            "status": "ok",
            "output": cmd.output.display().to_string(),
            "guarded": guarded,
        });
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        println!(
            "wrote {} ({guarded} guarded operations)",
            cmd.output.display()
        );
    }
    Ok(ExitCode::SUCCESS)
}

fn main() -> Result<ExitCode> {
    init_logging();
    let Cli { command, json } = Cli::parse();
    match command {
        Commands::Run(cmd) => run(cmd, json),
        Commands::Dis(cmd) => dis(cmd),
        Commands::Instrument(cmd) => instrument(cmd, json),
    }
}
