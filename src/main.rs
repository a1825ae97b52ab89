//! extract-core entry point.
//!
//! ## CLI Subcommands
//!
//! - `extract-core simulate` - Run a synthetic batch and print its summary
//! - `extract-core config show|defaults|validate` - Inspect configuration
//! - `extract-core version` - Print version
//!
//! `--config PATH` (or `EXTRACT_CORE_CONFIG`) selects a TOML config file.

use std::process::ExitCode;

use extract_core::cli::{self, config_cmd, SimulateArgs};
use extract_core::telemetry::{self, LogConfig};

#[tokio::main]
async fn main() -> ExitCode {
    let mut args: Vec<String> = std::env::args().collect();
    let config_path = cli::take_config_path(&mut args);
    let command = args.get(1).map(|s| s.as_str()).unwrap_or("help");

    match command {
        "simulate" => {
            let sim = match SimulateArgs::parse(&args[2..]) {
                Ok(sim) => sim,
                Err(e) => {
                    eprintln!("{e}");
                    print_command_help("simulate");
                    return ExitCode::FAILURE;
                }
            };
            let config = match cli::load_config(config_path.as_ref()) {
                Ok(config) => config,
                Err(e) => {
                    eprintln!("Configuration error: {e}");
                    return ExitCode::from(2u8);
                }
            };
            if let Err(e) = telemetry::init_logging(&LogConfig::from_env()) {
                eprintln!("Logging disabled: {e}");
            }
            telemetry::describe_metrics();

            match cli::run_simulate(config, &sim).await {
                Ok(results) => {
                    if let Err(e) = cli::print_results(&results, sim.include_items) {
                        eprintln!("Failed to encode results: {e}");
                        return ExitCode::FAILURE;
                    }
                    ExitCode::SUCCESS
                }
                Err(e) => {
                    eprintln!("Simulation failed: {e}");
                    ExitCode::FAILURE
                }
            }
        }
        "config" => {
            let subcommand = args.get(2).map(|s| s.as_str()).unwrap_or("show");
            match subcommand {
                "show" => ExitCode::from(config_cmd::run_show(config_path.as_ref()) as u8),
                "defaults" => {
                    config_cmd::run_defaults();
                    ExitCode::SUCCESS
                }
                "validate" => ExitCode::from(config_cmd::run_validate(config_path.as_ref()) as u8),
                _ => {
                    eprintln!("Unknown config subcommand: {}", subcommand);
                    print_command_help("config");
                    ExitCode::FAILURE
                }
            }
        }
        "help" | "--help" | "-h" => {
            if let Some(subcommand) = args.get(2) {
                print_command_help(subcommand);
            } else {
                print_usage();
            }
            ExitCode::SUCCESS
        }
        "version" | "--version" | "-V" => {
            println!("extract-core {}", env!("CARGO_PKG_VERSION"));
            ExitCode::SUCCESS
        }
        _ => {
            eprintln!("Unknown command: {}", command);
            print_usage();
            ExitCode::FAILURE
        }
    }
}

fn print_usage() {
    let version = env!("CARGO_PKG_VERSION");
    eprintln!(
        "extract-core - Batch extraction engine v{}

USAGE:
    extract-core [--config PATH] [COMMAND] [OPTIONS]

COMMANDS:
    simulate     Run a synthetic batch through a scripted extractor
    config       Inspect configuration (show, defaults, validate)
    version      Show version information
    help         Show this help message

OPTIONS:
    -h, --help       Show help for command
    -V, --version    Show version information
    --config PATH    Load configuration from a TOML file

EXAMPLES:
    extract-core simulate --items 50 --concurrency 4
    extract-core simulate --items 20 --distinct 5 --fail-every 4
    extract-core config validate
    extract-core --config engine.toml config show

ENVIRONMENT:
    EXTRACT_CORE_CONFIG        TOML config file (same as --config)
    EXTRACT_CORE_LOG_LEVEL     Log filter (falls back to RUST_LOG)
    EXTRACT_CORE_LOG_FORMAT    json or pretty
    EXTRACT_CORE_*             Engine settings, see `extract-core config defaults`

EXIT CODES:
    0  Success
    1  Failure / invalid configuration
    2  Configuration could not be loaded
",
        version
    );
}

/// Print detailed help for a specific command.
fn print_command_help(command: &str) {
    match command {
        "simulate" => {
            eprintln!(
                "extract-core simulate - Run a synthetic batch

USAGE:
    extract-core simulate [OPTIONS]

OPTIONS:
    --items N          Items in the batch (default: 20)
    --distinct N       Distinct subjects; fewer than items creates duplicates
    --concurrency N    Batch concurrency limit (default: 4)
    --rate R           Batch requests per second
    --priority P       low, normal, high or urgent (default: normal)
    --delay-ms MS      Simulated extractor latency (default: 25)
    --fail-every N     Every N-th subject fails permanently
    --flaky N          First N calls per subject fail transiently
    --items-detail     Include per-item results in the output

DESCRIPTION:
    Submits one batch to an in-process engine backed by a scripted
    extractor, waits for it to finish and prints the results as JSON.
    Ctrl+C shuts the engine down and reports what finished.
"
            );
        }
        "config" => {
            eprintln!(
                "extract-core config - Inspect configuration

USAGE:
    extract-core config [show|defaults|validate]

SUBCOMMANDS:
    show       Effective configuration (file, then environment)
    defaults   Built-in defaults
    validate   Exit 1 if the configuration is inconsistent
"
            );
        }
        _ => {
            eprintln!("No detailed help for '{}'.", command);
            print_usage();
        }
    }
}
