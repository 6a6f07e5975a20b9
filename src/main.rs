// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use colored::Colorize;
use indicatif::{ProgressBar, ProgressStyle};
use tracing_subscriber::EnvFilter;

use uricache::error::format_cache_error;
use uricache::{CacheConfig, CacheError, CacheManager, DownloadOptions, KeyPolicy, Progress};

const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Exit codes following sysexits.h conventions
mod exit_codes {
    pub const SUCCESS: i32 = 0;
    /// Command line usage error (bad URI, bad header)
    pub const USAGE: i32 = 64;
    /// Service unavailable (network failure)
    pub const UNAVAILABLE: i32 = 69;
    /// Cannot create or write output
    pub const CANT_CREATE: i32 = 73;
    /// Input/output error (cache root unreadable)
    pub const IO_ERROR: i32 = 74;
    /// Temporary failure, retry may succeed
    pub const TEMP_FAIL: i32 = 75;
}

/// uricache - fetch a URI once, serve it from disk afterwards.
#[derive(Parser)]
#[command(name = "uricache")]
#[command(version = VERSION)]
#[command(about = "Content-keyed local cache for remote resources.")]
#[command(propagate_version = true)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Cache root directory (overrides config and URICACHE_ROOT)
    #[arg(long, global = true)]
    root: Option<PathBuf>,

    /// Include request headers in cache keys
    #[arg(long, global = true)]
    key_headers: bool,

    /// Quiet mode: only print results and errors
    #[arg(short = 'q', long, global = true)]
    quiet: bool,

    /// Verbose mode: debug logging on stderr
    #[arg(short = 'v', long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Resolve a URI to a local file, downloading it if needed
    ///
    /// Examples:
    ///   uricache get https://example.com/photo.jpg
    ///   uricache get https://example.com/a.png -H "Authorization: Bearer x"
    Get {
        uri: String,
        /// Request header as "name: value" (repeatable)
        #[arg(short = 'H', long = "header")]
        headers: Vec<String>,
        /// Maximum transfer duration in seconds
        #[arg(long)]
        timeout: Option<u64>,
        /// Fetch again even if a local copy exists
        #[arg(long)]
        refresh: bool,
    },
    /// Print the key and path a URI maps to (no I/O)
    Path {
        uri: String,
        #[arg(short = 'H', long = "header")]
        headers: Vec<String>,
    },
    /// List cached entries
    Ls,
    /// Show total cache size
    Size,
    /// Delete every cached entry
    Clear,
    /// Delete the entry for one URI
    Rm {
        uri: String,
        #[arg(short = 'H', long = "header")]
        headers: Vec<String>,
    },
    /// Show the effective configuration
    Config {
        /// Persist the effective configuration to the config file
        #[arg(long)]
        save: bool,
    },
}

fn main() {
    let cli = Cli::parse();
    init_tracing(cli.verbose, cli.quiet);

    let code = match run(cli) {
        Ok(code) => code,
        Err(e) => {
            eprintln!("{} {:#}", "[✗]".red(), e);
            exit_codes::IO_ERROR
        }
    };
    std::process::exit(code);
}

fn init_tracing(verbose: bool, quiet: bool) {
    let default_level = if verbose {
        "uricache=debug"
    } else if quiet {
        "error"
    } else {
        "warn"
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn run(cli: Cli) -> Result<i32> {
    let mut config = CacheConfig::load()?;
    if let Some(root) = cli.root {
        config.root = root;
    }
    if cli.key_headers {
        config.key_policy = KeyPolicy::UriAndHeaders;
    }

    let runtime = tokio::runtime::Runtime::new().context("Failed to create Tokio runtime")?;
    runtime.block_on(run_command(cli.command, config, cli.quiet))
}

async fn run_command(command: Commands, config: CacheConfig, quiet: bool) -> Result<i32> {
    if let Commands::Config { save } = command {
        println!("{}", serde_json::to_string_pretty(&config)?);
        let path = CacheConfig::config_path();
        if save {
            config.save()?;
            if !quiet {
                println!("{} Saved to {}", "[✓]".green(), path.display());
            }
        } else {
            println!("{}", format!("config file: {}", path.display()).dimmed());
        }
        return Ok(exit_codes::SUCCESS);
    }

    let manager = match CacheManager::new(&config) {
        Ok(manager) => manager,
        Err(e) => return Ok(report_error("Could not initialize the cache", &e)),
    };

    match command {
        Commands::Get {
            uri,
            headers,
            timeout,
            refresh,
        } => {
            let mut options = match parse_headers(&headers) {
                Ok(options) => options,
                Err(code) => return Ok(code),
            };
            if let Some(secs) = timeout {
                options = options.timeout(Duration::from_secs(secs));
            }
            options = options.refresh(refresh);
            get(&manager, &uri, options, quiet).await
        }
        Commands::Path { uri, headers } => {
            let options = match parse_headers(&headers) {
                Ok(options) => options,
                Err(code) => return Ok(code),
            };
            let entry = manager.get(&uri, options);
            match (entry.key(), entry.target_path()) {
                (Some(key), Some(path)) => {
                    println!("key:  {}", key);
                    println!("path: {}", path.display());
                    Ok(exit_codes::SUCCESS)
                }
                _ => {
                    let err = entry
                        .get_path(|_| {})
                        .await
                        .err()
                        .unwrap_or_else(|| CacheError::invalid_uri(&uri, "unresolvable"));
                    Ok(report_error("Invalid URI", &err))
                }
            }
        }
        Commands::Ls => match manager.entries().await {
            Ok(entries) => {
                if entries.is_empty() && !quiet {
                    println!("{}", "No cached entries".dimmed());
                }
                for entry in entries {
                    let modified = entry
                        .modified
                        .map(|m| m.format("%Y-%m-%d %H:%M:%S").to_string())
                        .unwrap_or_else(|| "-".to_string());
                    println!("{:>10}  {}  {}", format_bytes(entry.size), modified, entry.file_name);
                }
                Ok(exit_codes::SUCCESS)
            }
            Err(e) => Ok(report_error("Could not list the cache", &e)),
        },
        Commands::Size => match manager.size().await {
            Ok(bytes) => {
                println!("{} ({} bytes) in {}", format_bytes(bytes), bytes, manager.root().display());
                Ok(exit_codes::SUCCESS)
            }
            Err(e) => Ok(report_error("Could not measure the cache", &e)),
        },
        Commands::Clear => match manager.clear().await {
            Ok(removed) => {
                if !quiet {
                    println!("{} Removed {} cached entries", "[✓]".green(), removed);
                }
                Ok(exit_codes::SUCCESS)
            }
            Err(e) => Ok(report_error("Could not clear the cache", &e)),
        },
        Commands::Rm { uri, headers } => {
            let options = match parse_headers(&headers) {
                Ok(options) => options,
                Err(code) => return Ok(code),
            };
            match manager.remove(&uri, &options).await {
                Ok(true) => {
                    if !quiet {
                        println!("{} Removed {}", "[✓]".green(), uri);
                    }
                    Ok(exit_codes::SUCCESS)
                }
                Ok(false) => {
                    if !quiet {
                        println!("{} Not cached: {}", "[!]".yellow(), uri);
                    }
                    Ok(exit_codes::SUCCESS)
                }
                Err(e) => Ok(report_error("Could not remove the entry", &e)),
            }
        }
        Commands::Config { .. } => Ok(exit_codes::SUCCESS),
    }
}

async fn get(manager: &CacheManager, uri: &str, options: DownloadOptions, quiet: bool) -> Result<i32> {
    let entry = manager.get(uri, options);

    let pb = if quiet {
        ProgressBar::hidden()
    } else {
        let pb = ProgressBar::new(100);
        pb.set_style(
            ProgressStyle::default_bar()
                .template("  {spinner:.green} [{bar:40.cyan/blue}] {pos:>3}% | {msg}")
                .unwrap_or_else(|_| ProgressStyle::default_bar())
                .progress_chars("█▓░"),
        );
        pb.enable_steady_tick(Duration::from_millis(100));
        pb.set_message("Resolving...");
        pb
    };

    let bar = pb.clone();
    let result = entry
        .get_path(move |progress: Progress| {
            match progress.fraction() {
                Some(f) => bar.set_position((f * 100.0) as u64),
                None => bar.tick(),
            }
            bar.set_message(match progress.bytes_expected {
                Some(total) => format!("{} / {}", format_bytes(progress.bytes_written), format_bytes(total)),
                None => format_bytes(progress.bytes_written),
            });
        })
        .await;
    pb.finish_and_clear();

    match result {
        Ok(path) => {
            println!("{}", path.display());
            Ok(exit_codes::SUCCESS)
        }
        Err(e) => Ok(report_error(&format!("Could not fetch {}", uri), &e)),
    }
}

fn parse_headers(raw: &[String]) -> std::result::Result<DownloadOptions, i32> {
    let mut options = DownloadOptions::new();
    for header in raw {
        match DownloadOptions::parse_header(header) {
            Some((name, value)) => options = options.header(name, value),
            None => {
                eprintln!("{} Malformed header {:?}, expected \"name: value\"", "[✗]".red(), header);
                return Err(exit_codes::USAGE);
            }
        }
    }
    Ok(options)
}

fn report_error(title: &str, err: &CacheError) -> i32 {
    eprintln!("{}", format_cache_error(title, err).red());
    match err {
        CacheError::InvalidUri { .. } => exit_codes::USAGE,
        CacheError::Network(_) if err.is_retryable() => exit_codes::TEMP_FAIL,
        CacheError::Network(_) => exit_codes::UNAVAILABLE,
        CacheError::Write(_) => exit_codes::CANT_CREATE,
        CacheError::StorageUnavailable(_) => exit_codes::IO_ERROR,
        CacheError::Cancelled => exit_codes::TEMP_FAIL,
    }
}

fn format_bytes(bytes: u64) -> String {
    if bytes >= 1_073_741_824 {
        format!("{:.1} GB", bytes as f64 / 1_073_741_824.0)
    } else if bytes >= 1_048_576 {
        format!("{:.1} MB", bytes as f64 / 1_048_576.0)
    } else if bytes >= 1024 {
        format!("{:.1} KB", bytes as f64 / 1024.0)
    } else {
        format!("{} B", bytes)
    }
}
