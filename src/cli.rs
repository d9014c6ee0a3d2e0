use crate::config::service::ServiceConfig;
use crate::config::types::{
    Action, ClientError, ClientStatus, CompileTarget, CrateType, Edition, ExecutionOutcome,
    LimitOverrides, Mode, Submission, SubmissionFlags,
};
use crate::config::validator::validate_service_config;
use crate::core::cancel::CancellationToken;
use crate::core::output::{OutputObserver, StreamKind};
use crate::core::runtime::{ContainerRuntime, DockerCli};
use crate::dispatch::{DispatchEngine, DispatchOptions};
use crate::lifecycle::Session;
use crate::registry::ToolchainRegistry;
use crate::signal;
use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use serde::Serialize;
use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

const EXIT_FAILED: i32 = 1;
const EXIT_CLIENT_ERROR: i32 = 2;

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Service configuration file (JSON)
    #[arg(long, global = true, env = "PLAYBOX_CONFIG")]
    config: Option<PathBuf>,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a snippet through a toolchain and print the result as JSON
    Execute {
        /// Toolchain identifier (stable, beta, nightly, formatter, linter, verifier, memory-sanitizer)
        #[arg(long)]
        toolchain: String,
        /// Action (run, compile, format, lint, verify)
        #[arg(long)]
        action: Action,
        /// Source code as string
        #[arg(long, conflicts_with = "file", required_unless_present = "file")]
        code: Option<String>,
        /// Read source code from a file
        #[arg(long)]
        file: Option<PathBuf>,
        #[arg(long, default_value = "2021")]
        edition: Edition,
        #[arg(long, default_value = "debug")]
        mode: Mode,
        #[arg(long, default_value = "bin")]
        crate_type: CrateType,
        /// Compile artifact (build, asm, llvm-ir, mir)
        #[arg(long, default_value = "build")]
        target: CompileTarget,
        /// Run the test harness instead of main
        #[arg(long)]
        tests: bool,
        /// Enable RUST_BACKTRACE inside the sandbox
        #[arg(long)]
        backtrace: bool,
        /// Tighten the wall-clock limit (seconds)
        #[arg(long)]
        timeout_secs: Option<u64>,
        /// Tighten the memory limit (MB)
        #[arg(long)]
        memory_mb: Option<u64>,
        /// Echo output to stderr while it is produced
        #[arg(long)]
        stream: bool,
    },
    /// List registered toolchains
    Toolchains,
    /// Check that the container runtime and every toolchain image are available
    CheckDeps,
}

/// Client-visible result printed by `execute`
#[derive(Serialize)]
struct ExecuteReport<'a> {
    status: ClientStatus,
    outcome: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    exit_code: Option<i32>,
    stdout: String,
    stderr: String,
}

#[derive(Serialize)]
struct ClientErrorReport {
    status: &'static str,
    error: String,
}

pub fn run() -> Result<()> {
    env_logger::init();

    let cli = Cli::parse();

    let config = match &cli.config {
        Some(path) => ServiceConfig::load_from_file(path)?,
        None => ServiceConfig::default(),
    };
    validate_service_config(&config)?;

    let registry = ToolchainRegistry::new().with_image_overrides(&config.images)?;
    let runtime = Arc::new(
        DockerCli::new(config.runtime_binary.clone()).with_cgroup_root(config.cgroup_root.clone()),
    );

    match cli.command {
        Commands::Execute {
            toolchain,
            action,
            code,
            file,
            edition,
            mode,
            crate_type,
            target,
            tests,
            backtrace,
            timeout_secs,
            memory_mb,
            stream,
        } => {
            let source = match (code, file) {
                (Some(code), _) => code,
                (None, Some(path)) => std::fs::read_to_string(&path)
                    .with_context(|| format!("failed to read {}", path.display()))?,
                (None, None) => bail!("either --code or --file is required"),
            };

            let submission = Submission::new(toolchain, action, source).with_flags(SubmissionFlags {
                edition,
                mode,
                crate_type,
                tests,
                backtrace,
                target,
            });

            let max_memory_bytes = match memory_override_bytes(memory_mb) {
                Ok(bytes) => bytes,
                Err(e) => {
                    print_json(&client_error_report(&e))?;
                    std::process::exit(EXIT_CLIENT_ERROR);
                }
            };
            let overrides = LimitOverrides {
                max_duration: timeout_secs.map(Duration::from_secs),
                max_memory_bytes,
            };

            let engine = DispatchEngine::new(Arc::new(registry), runtime, &config)?;
            let code = execute(&engine, &submission, overrides, stream)?;
            std::process::exit(code);
        }
        Commands::Toolchains => {
            for descriptor in registry.list() {
                let actions: Vec<_> = descriptor
                    .supported_actions()
                    .iter()
                    .map(|a| a.as_str())
                    .collect();
                println!(
                    "{:<18} {:<22} {:<28} {}",
                    descriptor.toolchain.id(),
                    descriptor.name,
                    descriptor.image,
                    actions.join(",")
                );
            }
            Ok(())
        }
        Commands::CheckDeps => {
            let ok = check_deps(runtime.as_ref(), &registry);
            if !ok {
                std::process::exit(EXIT_FAILED);
            }
            Ok(())
        }
    }
}

fn execute(
    engine: &DispatchEngine,
    submission: &Submission,
    overrides: LimitOverrides,
    stream: bool,
) -> Result<i32> {
    if let Err(e) = signal::install_handlers() {
        log::warn!("Could not install signal handlers: {}", e);
    }

    let cancel = CancellationToken::new();
    let watcher = signal::cancel_on_shutdown(cancel.clone());

    // Live output goes to stderr so stdout stays a single JSON document
    let observer: Option<OutputObserver> = stream.then(|| {
        Arc::new(|_kind: StreamKind, chunk: &[u8]| {
            let _ = std::io::stderr().lock().write_all(chunk);
        }) as OutputObserver
    });

    let session = Session::new();
    let result = session.run(
        engine,
        submission,
        DispatchOptions {
            overrides,
            cancel: cancel.clone(),
            observer,
        },
    );

    cancel.cancel();
    let _ = watcher.join();

    match result {
        Ok(outcome) => {
            print_json(&report(&outcome))?;
            Ok(match outcome.status() {
                ClientStatus::Succeeded => 0,
                ClientStatus::Failed => EXIT_FAILED,
            })
        }
        Err(e) => {
            print_json(&client_error_report(&e))?;
            Ok(EXIT_CLIENT_ERROR)
        }
    }
}

fn memory_override_bytes(memory_mb: Option<u64>) -> std::result::Result<Option<u64>, ClientError> {
    memory_mb
        .map(|mb| {
            mb.checked_mul(1024 * 1024).ok_or_else(|| {
                ClientError::InvalidOverride(format!("memory override of {mb} MB is too large"))
            })
        })
        .transpose()
}

fn report(outcome: &ExecutionOutcome) -> ExecuteReport<'_> {
    let rendered = outcome.render();
    let exit_code = match outcome {
        ExecutionOutcome::Success { exit_code, .. }
        | ExecutionOutcome::ToolFailure { exit_code, .. } => Some(*exit_code),
        _ => None,
    };
    ExecuteReport {
        status: outcome.status(),
        outcome: outcome.code(),
        exit_code,
        stdout: rendered.stdout,
        stderr: rendered.stderr,
    }
}

fn client_error_report(error: &ClientError) -> ClientErrorReport {
    ClientErrorReport {
        status: "client_error",
        error: error.to_string(),
    }
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    let json = serde_json::to_string_pretty(value)?;
    println!("{json}");
    Ok(())
}

fn check_deps(runtime: &dyn ContainerRuntime, registry: &ToolchainRegistry) -> bool {
    let mut ok = true;

    match runtime.version() {
        Ok(version) => println!("[ok]      {} {}", runtime.name(), version),
        Err(e) => {
            println!("[missing] {}: {}", runtime.name(), e);
            return false;
        }
    }

    for descriptor in registry.list() {
        match runtime.image_available(&descriptor.image) {
            Ok(true) => println!("[ok]      {:<18} {}", descriptor.toolchain.id(), descriptor.image),
            Ok(false) => {
                ok = false;
                println!("[missing] {:<18} {}", descriptor.toolchain.id(), descriptor.image);
            }
            Err(e) => {
                ok = false;
                println!("[error]   {:<18} {}: {}", descriptor.toolchain.id(), descriptor.image, e);
            }
        }
    }

    ok
}
