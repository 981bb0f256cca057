//! capgate CLI - capability-gated execution of generated code
//!
//! Usage:
//!   capgate scan <file>                    - List capability declarations
//!   capgate check <file> --grant a.b,c.d   - Compare declarations with a grant
//!   capgate run <file> --grant ... -- cmd  - Run a worker behind a broker
//!   capgate catalog                        - List available operations
//!   capgate stubs --grant ...              - Render a typed wrapper for a grant

use anyhow::Context;
use capgate_core::mcp::connect_all;
use capgate_core::stubs::render_typed_wrapper;
use capgate_core::tools::register_builtins;
use capgate_core::{
    CapabilityCatalog, CapgateConfig, CatalogBuilder, DeclarationScanner, FindingStatus,
    PermissionCheck, PermissionSet, ScanReport,
};
use capgate_sandbox::{Execution, SandboxError, WorkerCommand};
use clap::{Parser, Subcommand};
use serde_json::json;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Parser)]
#[command(name = "capgate")]
#[command(version)]
#[command(about = "Capability-gated tool access for generated code", long_about = None)]
struct Cli {
    /// Config file (default: ~/.capgate/config.json)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// More log output (-v info, -vv debug, -vvv trace)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List the capability declarations in a source file
    Scan {
        file: PathBuf,

        #[arg(long)]
        json: bool,
    },

    /// Check a source file's declarations against a grant
    Check {
        file: PathBuf,

        /// Comma-separated permission ids, e.g. fs.read,http.fetch
        #[arg(long, default_value = "")]
        grant: String,

        #[arg(long)]
        json: bool,
    },

    /// Run a worker for a source file with brokered capabilities
    Run {
        file: PathBuf,

        #[arg(long, default_value = "")]
        grant: String,

        /// Wall-clock limit in seconds
        #[arg(long)]
        timeout: Option<u64>,

        /// Worker command line
        #[arg(last = true, required = true)]
        worker: Vec<String>,
    },

    /// List every operation the catalog offers
    Catalog {
        #[arg(long)]
        json: bool,
    },

    /// Print a typed wrapper exposing only the granted operations
    Stubs {
        #[arg(long, default_value = "")]
        grant: String,

        /// Write to a file instead of stdout
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<ExitCode> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    let config = CapgateConfig::load(cli.config.as_deref())?;

    match cli.command {
        Commands::Scan { file, json } => scan(&config, &file, json),
        Commands::Check { file, grant, json } => check(&config, &file, &grant, json),
        Commands::Run {
            file,
            grant,
            timeout,
            worker,
        } => run(config, &file, &grant, timeout, worker).await,
        Commands::Catalog { json } => catalog(&config, json).await,
        Commands::Stubs { grant, output } => stubs(&grant, output.as_deref()),
    }
}

fn init_tracing(verbose: u8) {
    let level = match verbose {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    // RUST_LOG wins over -v
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .with(filter)
        .init();
}

fn parse_grant(grant: &str) -> anyhow::Result<PermissionSet> {
    PermissionSet::parse_list(grant).with_context(|| format!("Invalid --grant '{}'", grant))
}

fn read_source(file: &Path) -> anyhow::Result<String> {
    std::fs::read_to_string(file).with_context(|| format!("Failed to read {}", file.display()))
}

async fn build_catalog(config: &CapgateConfig) -> anyhow::Result<Arc<CapabilityCatalog>> {
    let mut builder = CatalogBuilder::new();
    register_builtins(&mut builder, &config.shell)?;
    for server in connect_all(&config.mcp_servers).await {
        server
            .register(&mut builder)
            .with_context(|| format!("Failed to register MCP server '{}'", server.name()))?;
    }
    Ok(Arc::new(builder.build()))
}

fn scan(config: &CapgateConfig, file: &Path, json: bool) -> anyhow::Result<ExitCode> {
    let scanner = DeclarationScanner::new(config.scanner.clone());
    let report = scanner.scan_file(file)?;

    if json {
        println!("{}", serde_json::to_string_pretty(&report_json(&report))?);
    } else if report.findings.is_empty() {
        println!("No capability declarations in {}", file.display());
    } else {
        print_findings(&report);
        println!();
        println!("Declared: {}", report.permissions);
    }

    Ok(if report.rejected().next().is_some() {
        ExitCode::FAILURE
    } else {
        ExitCode::SUCCESS
    })
}

/// Scan and grant comparison only; starts no MCP server
fn offline_execution(config: &CapgateConfig) -> Execution {
    Execution::from_config(Arc::new(CatalogBuilder::new().build()), config)
}

fn check(config: &CapgateConfig, file: &Path, grant: &str, json: bool) -> anyhow::Result<ExitCode> {
    let grant = parse_grant(grant)?;
    let source = read_source(file)?;

    match offline_execution(config).preflight(&source, &grant) {
        Ok(preflight) => {
            if json {
                println!("{}", serde_json::to_string_pretty(&preflight.check)?);
            } else {
                println!("✓ {}", preflight.check.summary);
            }
            Ok(ExitCode::SUCCESS)
        }
        Err(SandboxError::PermissionDenied(check)) => {
            if json {
                println!("{}", serde_json::to_string_pretty(&check)?);
            } else {
                print_denial(&check);
            }
            Ok(ExitCode::FAILURE)
        }
        Err(e) => report_refusal(e, json),
    }
}

async fn run(
    mut config: CapgateConfig,
    file: &Path,
    grant: &str,
    timeout: Option<u64>,
    worker: Vec<String>,
) -> anyhow::Result<ExitCode> {
    let grant = parse_grant(grant)?;
    let source = read_source(file)?;
    if let Some(secs) = timeout {
        config.execution.timeout_secs = secs;
    }

    let Some((program, args)) = worker.split_first() else {
        anyhow::bail!("No worker command given");
    };

    // Refuse before any MCP server process is spawned
    match offline_execution(&config).preflight(&source, &grant) {
        Ok(_) => {}
        Err(SandboxError::PermissionDenied(check)) => {
            print_denial(&check);
            return Ok(ExitCode::FAILURE);
        }
        Err(e) => return report_refusal(e, false),
    }

    let catalog = build_catalog(&config).await?;
    let execution = Execution::from_config(catalog, &config);
    let command = WorkerCommand::new(program).args(args);

    match execution.run(&source, &grant, command).await {
        Ok(outcome) => Ok(match outcome.exit_code {
            Some(0) => ExitCode::SUCCESS,
            Some(code) => ExitCode::from(u8::try_from(code).unwrap_or(1)),
            None => {
                eprintln!("Worker was terminated by a signal");
                ExitCode::FAILURE
            }
        }),
        Err(SandboxError::PermissionDenied(check)) => {
            print_denial(&check);
            Ok(ExitCode::FAILURE)
        }
        Err(e) => report_refusal(e, false),
    }
}

async fn catalog(config: &CapgateConfig, json: bool) -> anyhow::Result<ExitCode> {
    let catalog = build_catalog(config).await?;
    let tools = catalog.tools();

    if json {
        println!("{}", serde_json::to_string_pretty(&tools)?);
        return Ok(ExitCode::SUCCESS);
    }

    for tool in &tools {
        match &tool.description {
            Some(description) => println!("{:<24} {}", tool.id, description),
            None => println!("{}", tool.id),
        }
    }
    Ok(ExitCode::SUCCESS)
}

fn stubs(grant: &str, output: Option<&Path>) -> anyhow::Result<ExitCode> {
    let grant = parse_grant(grant)?;
    let rendered = render_typed_wrapper(&grant);
    match output {
        Some(path) => std::fs::write(path, rendered)
            .with_context(|| format!("Failed to write {}", path.display()))?,
        None => print!("{}", rendered),
    }
    Ok(ExitCode::SUCCESS)
}

fn report_json(report: &ScanReport) -> serde_json::Value {
    json!({
        "outcome": report.outcome(),
        "permissions": report.permissions,
        "findings": report.findings,
    })
}

fn status_label(status: FindingStatus) -> &'static str {
    match status {
        FindingStatus::Trusted => "trusted",
        FindingStatus::AliasWarning => "alias",
        FindingStatus::Forgery => "FORGERY",
        FindingStatus::Untrusted => "UNTRUSTED",
    }
}

fn print_findings(report: &ScanReport) {
    for finding in &report.findings {
        println!(
            "{:>8}  {:<10} {}",
            finding.location.to_string(),
            status_label(finding.status),
            finding.declared_type
        );
        if !finding.permissions.is_empty() {
            let ids: Vec<&str> = finding.permissions.iter().map(|id| id.as_str()).collect();
            println!("{:>8}  {:<10} {}", "", "", ids.join(", "));
        }
        if !finding.reason.is_empty() {
            println!("{:>8}  {:<10} {}", "", "", finding.reason);
        }
    }
}

fn print_denial(check: &PermissionCheck) {
    eprintln!("✗ {}", check.summary);
    eprintln!();
    eprintln!("Missing:");
    for id in &check.missing {
        eprintln!("  {}", id);
    }
    if let Some(suggested) = check.suggested_grant_arg() {
        eprintln!();
        eprintln!("Re-run with: --grant {}", suggested);
    }
}

fn report_refusal(error: SandboxError, json: bool) -> anyhow::Result<ExitCode> {
    match error {
        SandboxError::DeclarationForgery { findings } => {
            if json {
                println!(
                    "{}",
                    serde_json::to_string_pretty(&json!({
                        "code": "DeclarationForgery",
                        "findings": findings,
                    }))?
                );
            } else {
                eprintln!("✗ Capability declaration rejected");
                for finding in findings.iter().filter(|f| !f.valid) {
                    eprintln!("  {} {}: {}", finding.location, finding.declared_type, finding.reason);
                }
            }
            Ok(ExitCode::FAILURE)
        }
        SandboxError::NoDeclaration => {
            eprintln!("✗ Source declares no capabilities (set execution.allow_undeclared to permit)");
            Ok(ExitCode::FAILURE)
        }
        other => {
            let code = other.code();
            Err(anyhow::Error::new(other).context(code))
        }
    }
}
