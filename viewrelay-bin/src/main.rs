//! `viewrelay` drives the `viewrelay-lib` core from the command line.
//!
//! Refresh the proxy pool and show what was found:
//! ```sh
//! viewrelay -vv refresh
//! ```
//!
//! Dispatch 20 views of a URL, about two seconds apart:
//! ```sh
//! viewrelay run https://example.com/watch -n 20 --duration-hint 2s
//! ```
//!
//! Keep the pool between runs:
//! ```sh
//! viewrelay --pool-cache pool.csv run https://example.com/watch
//! viewrelay --pool-cache pool.csv status
//! ```
//!
//! Results and reports are printed to stdout as JSON, logs go to stderr.
#![warn(clippy::all, clippy::pedantic)]
#![warn(
    absolute_paths_not_starting_with_crate,
    missing_copy_implementations,
    missing_debug_implementations,
    semicolon_in_expressions_from_macros,
    unreachable_pub,
    unused_extern_crates,
    clippy::missing_const_for_fn
)]
#![deny(anonymous_parameters, macro_use_extern_crate)]
#![deny(missing_docs)]

use std::fs;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result, bail};
use clap::{Parser, crate_version};
use log::{error, info, warn};
use tokio::sync::mpsc;
use viewrelay_lib::proxy::{HttpListSource, ProxySource, StaticSource};
use viewrelay_lib::{ClientBuilder, HttpRequester, ViewJob, ViewRelay};

mod commands;
mod logging;
mod options;
mod pool_cache;
mod verbosity;

use crate::logging::init_logging;
use crate::options::{Command, Config, VIEWRELAY_CONFIG_FILE, ViewRelayOptions};
use crate::pool_cache::{PoolSnapshot, StoreExt};

/// A C-like enum that can be cast to `i32` and used as process exit code.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ExitCode {
    Success = 0,
    // NOTE: exit code 1 is used for any `Result::Err` bubbled up to `main()`
    // using the `?` operator.
    #[allow(unused)]
    UnexpectedFailure = 1,
    JobFailure = 2,
    ConfigFile = 3,
    RateLimited = 4,
    PoolEmpty = 5,
}

fn main() -> Result<()> {
    // std::process::exit doesn't guarantee that all destructors will be run,
    // therefore we wrap the main code in another function to ensure that.
    let exit_code = run_main()?;
    std::process::exit(exit_code);
}

/// Merge all provided config options into one.
/// This includes a potential config file, command-line- and environment variables
fn load_config() -> Result<ViewRelayOptions> {
    let mut opts = ViewRelayOptions::parse();

    let config_file = match &opts.config_file {
        Some(path) => Some(path.clone()),
        None => Some(PathBuf::from(VIEWRELAY_CONFIG_FILE)).filter(|path| path.is_file()),
    };
    if let Some(path) = config_file {
        match Config::load_from_file(&path) {
            Ok(c) => opts.config.merge(c),
            Err(e) => {
                init_logging(&opts.config.verbose);
                bail!("Cannot load configuration file `{}`: {e:?}", path.display());
            }
        }
    }

    init_logging(&opts.config.verbose);

    opts.config
        .relay_config()
        .validate()
        .context("Invalid configuration")?;

    Ok(opts)
}

/// Set up runtime and call viewrelay entrypoint
fn run_main() -> Result<i32> {
    let opts = match load_config() {
        Ok(opts) => opts,
        Err(e) => {
            error!(
                "Error while loading config: {e:#}\n\
                See `viewrelay {} --help` for the available options",
                crate_version!()
            );
            return Ok(ExitCode::ConfigFile as i32);
        }
    };

    let runtime = match opts.config.threads {
        Some(threads) => {
            // We define our own runtime instead of the `tokio::main` attribute
            // since we want to make the number of threads configurable
            tokio::runtime::Builder::new_multi_thread()
                .worker_threads(threads)
                .enable_all()
                .build()?
        }
        None => tokio::runtime::Runtime::new()?,
    };

    let exit_code = runtime.block_on(run(&opts))?;
    Ok(exit_code as i32)
}

/// Build the proxy sources: the configured lists plus an optional local file
fn sources(
    cfg: &Config,
    relay_config: &viewrelay_lib::Config,
) -> Result<Vec<Box<dyn ProxySource>>> {
    let mut sources = relay_config
        .sources
        .iter()
        .map(|source| {
            HttpListSource::new(source).map(|source| Box::new(source) as Box<dyn ProxySource>)
        })
        .collect::<Result<Vec<_>, _>>()?;

    if let Some(path) = &cfg.proxy_file {
        let lines = fs::read_to_string(path)
            .with_context(|| format!("Cannot read proxy file `{}`", path.display()))?;
        let source =
            StaticSource::from_lines(path.display().to_string(), &lines, cfg.source_protocol);
        info!("Read {} proxies from `{}`", source.len(), path.display());
        sources.push(Box::new(source));
    }
    Ok(sources)
}

/// Load the pool snapshot, if there is one.
/// Starting without it is common, so a missing or broken file only warns
fn load_pool_cache(cfg: &Config) -> Option<PoolSnapshot> {
    let path = cfg.pool_cache.as_ref()?;
    if !path.is_file() {
        return None;
    }
    match PoolSnapshot::load(path) {
        Ok(snapshot) => Some(snapshot),
        Err(e) => {
            warn!("Error while loading pool cache: {e}. Continuing without.");
            None
        }
    }
}

/// Run the selected command
async fn run(opts: &ViewRelayOptions) -> Result<ExitCode> {
    let cfg = &opts.config;
    let relay_config = cfg.relay_config();

    let sources = sources(cfg, &relay_config)?;
    let requester = Arc::new(HttpRequester::new(
        ClientBuilder::builder()
            .timeout(relay_config.dispatcher.request_timeout)
            .build(),
    ));
    let (events, mut receiver) = mpsc::channel(relay_config.dispatcher.event_buffer.max(1));
    let relay = ViewRelay::with_parts(relay_config, sources, requester, Some(events))?;

    if let Some(snapshot) = load_pool_cache(cfg) {
        let ingested = relay.pool().ingest(snapshot);
        info!("Loaded {ingested} proxies from the pool cache");
    }

    let exit_code = match &opts.command {
        Command::Status => commands::status(&relay)?,
        Command::Refresh => commands::refresh(&relay).await?,
        Command::Run {
            target,
            count,
            actor,
            duration_hint,
            deadline,
        } => {
            let job = match duration_hint {
                Some(hint) => {
                    ViewJob::from_duration_hint(actor.as_str(), target.clone(), *count, *hint)
                }
                None => ViewJob::builder()
                    .actor(actor.as_str())
                    .target(target.clone())
                    .requested_count(*count)
                    .min_delay(relay.config().dispatcher.min_delay())
                    .max_delay(relay.config().dispatcher.max_delay())
                    .build(),
            };
            let job = match deadline {
                Some(deadline) => job.with_deadline(*deadline),
                None => job,
            };
            commands::run(&relay, &mut receiver, job).await?
        }
    };

    relay.shutdown(cfg.shutdown_grace).await;

    if let Some(path) = &cfg.pool_cache {
        let stored = pool_cache::snapshot(relay.pool())
            .store(path)
            .with_context(|| format!("Cannot store pool cache at `{}`", path.display()))?;
        info!("Stored {stored} proxies in the pool cache");
    }

    Ok(exit_code)
}
