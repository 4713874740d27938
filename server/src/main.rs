//
// Copyright 2017-2026 Hans W. Uhlig. All Rights Reserved.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//      http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.
//

//! `medovina` command line entry point

use clap::{Parser, Subcommand};
use medovina_server::{check, logging, run, settings, signals};
use medovina_service::HoneypotConfig;
use std::path::PathBuf;
use std::process::ExitCode;
use tracing::{error, info};

/// Multi-service honeypot host
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Configuration file
    #[arg(short, long, global = true, default_value = "medovina.toml")]
    config: PathBuf,

    /// Validate the configuration and exit (same as `check`)
    #[arg(long)]
    check: bool,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug, Clone, Copy, PartialEq, Eq)]
enum Command {
    /// Start all enabled plugins and serve until SIGINT or SIGTERM
    Run,
    /// Load and validate the configuration, then list the plugins
    Check,
    /// Print the configured plugins
    List {
        /// Print JSON instead of a table
        #[arg(long)]
        json: bool,
    },
}

fn print_plugins(config: &HoneypotConfig) {
    for plugin in &config.plugins {
        let summary = plugin.summary();
        println!(
            "{:<16} {:<8} {:<4} {:<22} {}",
            summary.name,
            summary.kind,
            summary.transport,
            summary.bind,
            if summary.enabled { "enabled" } else { "disabled" }
        );
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let config = match settings::load(&cli.config) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("{}", e);
            return ExitCode::FAILURE;
        }
    };

    let command = match cli.command {
        _ if cli.check => Command::Check,
        Some(command) => command,
        None => Command::Run,
    };

    match command {
        Command::Check => match check(&config) {
            Ok(_) => {
                print_plugins(&config);
                println!("{}: ok", cli.config.display());
                ExitCode::SUCCESS
            }
            Err(e) => {
                eprintln!("{}: {}", cli.config.display(), e);
                ExitCode::FAILURE
            }
        },
        Command::List { json } => {
            if json {
                let summaries: Vec<_> = config.plugins.iter().map(|d| d.summary()).collect();
                match serde_json::to_string_pretty(&summaries) {
                    Ok(text) => println!("{}", text),
                    Err(e) => {
                        eprintln!("{}", e);
                        return ExitCode::FAILURE;
                    }
                }
            } else {
                print_plugins(&config);
            }
            ExitCode::SUCCESS
        }
        Command::Run => {
            if let Err(e) = logging::init(&config.logging) {
                eprintln!("Failed to initialize logging: {}", e);
                return ExitCode::FAILURE;
            }
            info!(version = env!("CARGO_PKG_VERSION"), config = %cli.config.display(), "Starting medovina");

            let shutdown = async {
                if let Err(e) = signals::wait_for_shutdown().await {
                    error!(error = %e, "Signal handling unavailable, stopping");
                }
            };
            match run(config, shutdown).await {
                Ok(report) if report.is_clean() => ExitCode::SUCCESS,
                Ok(_) => {
                    error!("Some plugins did not stop cleanly");
                    ExitCode::FAILURE
                }
                Err(e) => {
                    error!(error = %e, fatal = e.is_fatal(), "Honeypot stopped");
                    ExitCode::FAILURE
                }
            }
        }
    }
}
