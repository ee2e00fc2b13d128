//! Grid engine binary
//!
//! Runs one grid against the paper exchange, replaying the price series
//! named in the settings file.
//!
//! ```bash
//! cargo run --bin grid_engine -- run grid.yaml --debug
//! ```
//!
//! Exit codes: 0 on a graceful stop, 1 on a configuration error, 2 when the
//! engine halted.

use perp_grid_engine::{grid::GridError, runner::EngineRunner};

const USAGE: &str = "usage: grid_engine run <config-path> [--debug]";

#[tokio::main]
async fn main() {
    // Load .env file; APP_* variables override the settings file
    dotenvy::dotenv().ok();

    let args: Vec<String> = std::env::args().skip(1).collect();
    let (config_path, debug) = match args.as_slice() {
        [cmd, path] if cmd == "run" => (path.clone(), false),
        [cmd, path, flag] if cmd == "run" && flag == "--debug" => (path.clone(), true),
        _ => {
            eprintln!("{}", USAGE);
            std::process::exit(1);
        }
    };
    if !std::path::Path::new(&config_path).exists() {
        eprintln!("Config file '{}' not found.", config_path);
        std::process::exit(1);
    }

    let runner = match EngineRunner::new(&config_path) {
        Ok(runner) => runner.with_debug(debug),
        Err(e) => {
            eprintln!("Invalid configuration: {}", e);
            std::process::exit(1);
        }
    };

    match runner.run().await {
        Ok(summary) => {
            println!(
                "{}",
                serde_json::to_string_pretty(&summary).unwrap_or_else(|e| e.to_string())
            );
        }
        Err(e @ GridError::FatalConfig(_)) => {
            eprintln!("Invalid configuration: {}", e);
            std::process::exit(1);
        }
        Err(e) => {
            eprintln!("Grid engine stopped: {}", e);
            std::process::exit(2);
        }
    }
}
