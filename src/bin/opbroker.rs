// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Broker daemon entry point. Takes no arguments in the covered core
// (spec §6 CLI surface); `--config <path>` overlays a TOML config file on
// the compiled-in defaults and `-v`/`--verbose` raises env_logger's
// default filter, both purely additive to the "no arguments" baseline.

use std::process::ExitCode;
use std::sync::atomic::Ordering;

use opbroker::{Broker, Config};

struct Args {
    config_path: Option<String>,
    verbose: bool,
}

fn parse_args() -> Result<Args, String> {
    let mut config_path = None;
    let mut verbose = false;
    let mut it = std::env::args().skip(1);
    while let Some(arg) = it.next() {
        match arg.as_str() {
            "--config" => {
                config_path = Some(it.next().ok_or("--config requires a path argument")?);
            }
            "-v" | "--verbose" => verbose = true,
            other => return Err(format!("unrecognized argument: {other}")),
        }
    }
    Ok(Args { config_path, verbose })
}

fn main() -> ExitCode {
    let args = match parse_args() {
        Ok(a) => a,
        Err(e) => {
            eprintln!("{e}");
            eprintln!("usage: opbroker [--config <path>] [-v|--verbose]");
            return ExitCode::FAILURE;
        }
    };

    let mut logger = env_logger::Builder::from_default_env();
    if args.verbose {
        logger.filter_level(log::LevelFilter::Debug);
    }
    logger.init();

    let cfg = match &args.config_path {
        Some(path) => match Config::load(path) {
            Ok(cfg) => cfg,
            Err(e) => {
                log::error!("loading config {path}: {e}");
                return ExitCode::FAILURE;
            }
        },
        None => Config::default(),
    };

    let shutdown = match opbroker::signals::install() {
        Ok(flag) => flag,
        Err(e) => {
            log::error!("installing signal handlers: {e}");
            return ExitCode::FAILURE;
        }
    };

    let mut broker = match Broker::new(cfg, shutdown.clone()) {
        Ok(b) => b,
        Err(e) => {
            log::error!("broker init failed: {e}");
            return ExitCode::FAILURE;
        }
    };

    log::info!("opbroker listening");
    if let Err(e) = broker.run() {
        log::error!("broker run loop exited with error: {e}");
        return ExitCode::FAILURE;
    }
    debug_assert!(shutdown.load(Ordering::Relaxed));
    log::info!("opbroker drained and exiting");
    ExitCode::SUCCESS
}
