use std::path::PathBuf;
use std::process::ExitCode;

use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use nixd_lsp::{Config, ServerOptions};

enum Role {
    Controller,
    EvalWorker,
    OptionWorker,
}

#[tokio::main]
async fn main() -> ExitCode {
    let mut role = Role::Controller;
    let mut wait_workers = false;
    let mut config_path: Option<PathBuf> = None;

    let mut args = std::env::args().skip(1);
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--eval-worker" => role = Role::EvalWorker,
            "--option-worker" => role = Role::OptionWorker,
            "--wait-workers" => wait_workers = true,
            "--config" => {
                let Some(path) = args.next() else {
                    eprintln!("--config requires a file path");
                    return ExitCode::FAILURE;
                };
                config_path = Some(PathBuf::from(path));
            }
            "-h" | "--help" => {
                print_help();
                return ExitCode::SUCCESS;
            }
            "-V" | "--version" => {
                println!("nixd {}", env!("CARGO_PKG_VERSION"));
                return ExitCode::SUCCESS;
            }
            other => {
                eprintln!("unknown argument: {other}");
                print_help();
                return ExitCode::FAILURE;
            }
        }
    }

    init_tracing();

    match role {
        Role::EvalWorker => run_worker(nixd_lsp::run_eval_worker().await),
        Role::OptionWorker => run_worker(nixd_lsp::run_option_worker().await),
        Role::Controller => {
            let config = match load_config(config_path) {
                Ok(config) => config,
                Err(e) => {
                    eprintln!("{e:#}");
                    return ExitCode::FAILURE;
                }
            };
            nixd_lsp::run(ServerOptions {
                config,
                wait_workers,
            })
            .await;
            ExitCode::SUCCESS
        }
    }
}

fn run_worker(result: anyhow::Result<()>) -> ExitCode {
    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!("worker failed: {e:#}");
            ExitCode::FAILURE
        }
    }
}

fn load_config(explicit: Option<PathBuf>) -> anyhow::Result<Config> {
    if let Some(path) = explicit {
        return Config::load_file(&path);
    }
    let default = PathBuf::from(Config::FILE_NAME);
    if default.exists() {
        match Config::load_file(&default) {
            Ok(config) => return Ok(config),
            Err(e) => tracing::warn!("ignoring {}: {e:#}", default.display()),
        }
    }
    Ok(Config::default())
}

/// Logs must go to stderr only; stdout carries the protocol.
fn init_tracing() {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new("info"))
        .unwrap_or_else(|_| EnvFilter::default());
    tracing_subscriber::registry()
        .with(fmt::layer().with_ansi(false).with_writer(std::io::stderr))
        .with(filter)
        .init();
}

fn print_help() {
    println!(
        "nixd {} - language server for the Nix expression language

USAGE:
    nixd [OPTIONS]

OPTIONS:
    --config <FILE>    Read configuration from FILE instead of {}
    --wait-workers     Keep workers alive and drain them on shutdown
    --eval-worker      (internal) run as an evaluation worker
    --option-worker    (internal) run as an option worker
    -h, --help         Print this help
    -V, --version      Print the version",
        env!("CARGO_PKG_VERSION"),
        Config::FILE_NAME,
    );
}
