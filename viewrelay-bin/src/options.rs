use std::path::{Path, PathBuf};
use std::{fs, time::Duration};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use const_format::{concatcp, formatcp};
use serde::Deserialize;
use url::Url;
use viewrelay_lib::dispatcher::{DEFAULT_ATTEMPT_RETRY_LIMIT, DEFAULT_MAX_WORKERS};
use viewrelay_lib::proxy::{
    DEFAULT_POOL_TARGET_SIZE, DEFAULT_SOURCE_LIMIT, DEFAULT_VALIDATION_CONCURRENCY, Protocol,
    SourceConfig, default_sources,
};
use viewrelay_lib::ratelimit::{
    DEFAULT_RATE_LIMIT_PER_DAY, DEFAULT_RATE_LIMIT_PER_HOUR, DEFAULT_RATE_LIMIT_PER_MINUTE,
    RateLimitConfig,
};
use viewrelay_lib::{DEFAULT_MAX_DELAY, DEFAULT_MIN_DELAY, DEFAULT_TIMEOUT, DEFAULT_VIEW_COUNT};

use crate::verbosity::Verbosity;

pub(crate) const VIEWRELAY_CONFIG_FILE: &str = "viewrelay.toml";

const DEFAULT_DEAD_GRACE_PERIOD: &str = "10m";
const DEFAULT_SHUTDOWN_GRACE: &str = "30s";
const DEFAULT_REQUEST_TIMEOUT: &str = "20s";

#[allow(clippy::cast_possible_truncation)]
const DEFAULT_MIN_DELAY_MS: u64 = DEFAULT_MIN_DELAY.as_millis() as u64;
#[allow(clippy::cast_possible_truncation)]
const DEFAULT_MAX_DELAY_MS: u64 = DEFAULT_MAX_DELAY.as_millis() as u64;

// clap wants `&str` defaults, serde wants functions
const PER_MINUTE_STR: &str = concatcp!(DEFAULT_RATE_LIMIT_PER_MINUTE);
const PER_HOUR_STR: &str = concatcp!(DEFAULT_RATE_LIMIT_PER_HOUR);
const PER_DAY_STR: &str = concatcp!(DEFAULT_RATE_LIMIT_PER_DAY);
const POOL_TARGET_SIZE_STR: &str = concatcp!(DEFAULT_POOL_TARGET_SIZE);
const MAX_WORKERS_STR: &str = concatcp!(DEFAULT_MAX_WORKERS);
const VALIDATION_CONCURRENCY_STR: &str = concatcp!(DEFAULT_VALIDATION_CONCURRENCY);
const ATTEMPT_RETRY_LIMIT_STR: &str = concatcp!(DEFAULT_ATTEMPT_RETRY_LIMIT);
const MIN_DELAY_MS_STR: &str = concatcp!(DEFAULT_MIN_DELAY_MS);
const MAX_DELAY_MS_STR: &str = concatcp!(DEFAULT_MAX_DELAY_MS);
const VIEW_COUNT_STR: &str = concatcp!(DEFAULT_VIEW_COUNT);
const SOURCE_LIMIT_STR: &str = concatcp!(DEFAULT_SOURCE_LIMIT);
const HELP_MSG_CONFIG_FILE: &str = formatcp!(
    "Configuration file to use\n\n[default: {}]",
    VIEWRELAY_CONFIG_FILE,
);

// Macro for generating default functions to be used by serde
macro_rules! default_function {
    ( $( $name:ident : $T:ty = $e:expr; )* ) => {
        $(
            #[allow(clippy::missing_const_for_fn)]
            fn $name() -> $T {
                $e
            }
        )*
    };
}

default_function! {
    rate_limit_per_minute: u32 = DEFAULT_RATE_LIMIT_PER_MINUTE;
    rate_limit_per_hour: u32 = DEFAULT_RATE_LIMIT_PER_HOUR;
    rate_limit_per_day: u32 = DEFAULT_RATE_LIMIT_PER_DAY;
    pool_target_size: usize = DEFAULT_POOL_TARGET_SIZE;
    max_workers: usize = DEFAULT_MAX_WORKERS;
    validation_concurrency: usize = DEFAULT_VALIDATION_CONCURRENCY;
    attempt_retry_limit: u32 = DEFAULT_ATTEMPT_RETRY_LIMIT;
    min_delay_ms: u64 = DEFAULT_MIN_DELAY_MS;
    max_delay_ms: u64 = DEFAULT_MAX_DELAY_MS;
    proxy_dead_grace_period: Duration = default_dead_grace_period();
    request_timeout: Duration = DEFAULT_TIMEOUT;
    shutdown_grace: Duration = default_shutdown_grace();
    source_limit: usize = DEFAULT_SOURCE_LIMIT;
    verbosity: Verbosity = Verbosity::default();
}

fn default_dead_grace_period() -> Duration {
    humantime::parse_duration(DEFAULT_DEAD_GRACE_PERIOD).unwrap_or(Duration::from_secs(600))
}

fn default_shutdown_grace() -> Duration {
    humantime::parse_duration(DEFAULT_SHUTDOWN_GRACE).unwrap_or(Duration::from_secs(30))
}

// Macro for merging configuration values
macro_rules! fold_in {
    ($cli:ident , $toml:ident ; $ty:ident { $(..$ignore:ident,)* $( $key:ident : $default:expr, )* } ) => {
        if (false) {
            #[allow(dead_code, unused, clippy::diverging_sub_expression)]
            let _check_fold_in_exhaustivity = $ty {
                $($key: unreachable!(), )*
                $($ignore: unreachable!(), )*
            };
        };
        $(
            if $cli.$key == $default && $toml.$key != $default {
                $cli.$key = $toml.$key;
            }
        )*
    };
}

/// viewrelay dispatches simulated views of a URL through a rotating pool of
/// third-party proxies, subject to per-actor rate limits.
///
/// Every option can also be set in the configuration file or through a
/// `VIEWRELAY_*` environment variable.
#[derive(Parser, Debug)]
#[command(version, about, next_display_order = None)]
pub(crate) struct ViewRelayOptions {
    /// Configuration file to use
    #[arg(short, long = "config", global = true)]
    #[arg(help = HELP_MSG_CONFIG_FILE)]
    pub(crate) config_file: Option<PathBuf>,

    #[clap(flatten)]
    pub(crate) config: Config,

    #[command(subcommand)]
    pub(crate) command: Command,
}

#[derive(Subcommand, Debug, Clone, PartialEq, Eq)]
pub(crate) enum Command {
    /// Refresh the proxy pool, run one view job and print its result as JSON
    Run {
        /// URL to request through the proxies
        target: Url,

        /// Number of views to dispatch
        #[arg(short = 'n', long, default_value = VIEW_COUNT_STR)]
        count: usize,

        /// Actor the job is charged to
        #[arg(short, long, default_value = "cli")]
        actor: String,

        /// Typical time between views; each delay is drawn from 80% to 120% of it.
        /// Without it, the configured minimum and maximum delay apply
        #[arg(long, value_parser = humantime::parse_duration)]
        duration_hint: Option<Duration>,

        /// Give up on views still pending after this time
        #[arg(long, value_parser = humantime::parse_duration)]
        deadline: Option<Duration>,
    },

    /// Print the pool status as JSON, without touching the network
    Status,

    /// Run one refresh cycle and print its report as JSON
    Refresh,
}

/// Settings shared by all commands
#[derive(Parser, Debug, Deserialize, Clone, PartialEq)]
#[serde(deny_unknown_fields)]
pub(crate) struct Config {
    /// Verbose program output
    #[clap(flatten)]
    #[serde(default = "verbosity")]
    pub(crate) verbose: Verbosity,

    /// Maximum jobs an actor may start per minute
    #[arg(long, global = true, env = "VIEWRELAY_RATE_LIMIT_PER_MINUTE", default_value = PER_MINUTE_STR)]
    #[serde(default = "rate_limit_per_minute")]
    pub(crate) rate_limit_per_minute: u32,

    /// Maximum jobs an actor may start per hour
    #[arg(long, global = true, env = "VIEWRELAY_RATE_LIMIT_PER_HOUR", default_value = PER_HOUR_STR)]
    #[serde(default = "rate_limit_per_hour")]
    pub(crate) rate_limit_per_hour: u32,

    /// Maximum jobs an actor may start per day
    #[arg(long, global = true, env = "VIEWRELAY_RATE_LIMIT_PER_DAY", default_value = PER_DAY_STR)]
    #[serde(default = "rate_limit_per_day")]
    pub(crate) rate_limit_per_day: u32,

    /// Number of usable proxies below which the pool is topped up from the sources
    #[arg(long, global = true, env = "VIEWRELAY_POOL_TARGET_SIZE", default_value = POOL_TARGET_SIZE_STR)]
    #[serde(default = "pool_target_size")]
    pub(crate) pool_target_size: usize,

    /// Maximum number of views in flight across all jobs
    #[arg(long, global = true, env = "VIEWRELAY_MAX_WORKERS", default_value = MAX_WORKERS_STR)]
    #[serde(default = "max_workers")]
    pub(crate) max_workers: usize,

    /// Maximum number of proxies probed at the same time
    #[arg(long, global = true, env = "VIEWRELAY_VALIDATION_CONCURRENCY", default_value = VALIDATION_CONCURRENCY_STR)]
    #[serde(default = "validation_concurrency")]
    pub(crate) validation_concurrency: usize,

    /// How often a failed view is retried through another proxy
    #[arg(long, global = true, env = "VIEWRELAY_ATTEMPT_RETRY_LIMIT", default_value = ATTEMPT_RETRY_LIMIT_STR)]
    #[serde(default = "attempt_retry_limit")]
    pub(crate) attempt_retry_limit: u32,

    /// Minimum delay before each view, in milliseconds
    #[arg(long, global = true, env = "VIEWRELAY_MIN_DELAY_MS", default_value = MIN_DELAY_MS_STR)]
    #[serde(default = "min_delay_ms")]
    pub(crate) min_delay_ms: u64,

    /// Maximum delay before each view, in milliseconds
    #[arg(long, global = true, env = "VIEWRELAY_MAX_DELAY_MS", default_value = MAX_DELAY_MS_STR)]
    #[serde(default = "max_delay_ms")]
    pub(crate) max_delay_ms: u64,

    /// How long a dead proxy is remembered, and kept out of the pool, before it is evicted
    #[arg(
        long,
        global = true,
        env = "VIEWRELAY_PROXY_DEAD_GRACE_PERIOD",
        value_parser = humantime::parse_duration,
        default_value = DEFAULT_DEAD_GRACE_PERIOD
    )]
    #[serde(default = "proxy_dead_grace_period", with = "humantime_serde")]
    pub(crate) proxy_dead_grace_period: Duration,

    /// Timeout of a single view request
    #[arg(
        long,
        global = true,
        env = "VIEWRELAY_REQUEST_TIMEOUT",
        value_parser = humantime::parse_duration,
        default_value = DEFAULT_REQUEST_TIMEOUT
    )]
    #[serde(default = "request_timeout", with = "humantime_serde")]
    pub(crate) request_timeout: Duration,

    /// How long running jobs may finish after the command is done
    #[arg(
        long,
        global = true,
        value_parser = humantime::parse_duration,
        default_value = DEFAULT_SHUTDOWN_GRACE
    )]
    #[serde(default = "shutdown_grace", with = "humantime_serde")]
    pub(crate) shutdown_grace: Duration,

    /// Plain-text proxy list to fetch, one `host:port` per line.
    /// Replaces the built-in lists; may be given several times
    #[arg(long = "source", global = true, value_name = "URL", verbatim_doc_comment)]
    #[serde(default)]
    pub(crate) sources: Vec<Url>,

    /// Protocol assumed for entries of `--source` lists without a scheme
    #[arg(long, global = true, default_value = "http")]
    #[serde(default)]
    pub(crate) source_protocol: Protocol,

    /// Maximum entries taken from each list per fetch
    #[arg(long, global = true, default_value = SOURCE_LIMIT_STR)]
    #[serde(default = "source_limit")]
    pub(crate) source_limit: usize,

    /// Local proxy list, one `host:port` or `scheme://host:port` per line
    #[arg(long, global = true, value_name = "PATH")]
    #[serde(default)]
    pub(crate) proxy_file: Option<PathBuf>,

    /// URL requested through a candidate to check that it works.
    /// May be given several times; tried in order
    #[arg(long = "probe-url", global = true, value_name = "URL", verbatim_doc_comment)]
    #[serde(default)]
    pub(crate) probe_urls: Vec<Url>,

    /// Load the pool from this CSV file at start and store it there at exit
    #[arg(long, global = true, env = "VIEWRELAY_POOL_CACHE", value_name = "PATH")]
    #[serde(default)]
    pub(crate) pool_cache: Option<PathBuf>,

    /// Number of threads to utilize.
    /// Defaults to number of cores available to the system
    #[arg(short = 'T', long, global = true, verbatim_doc_comment)]
    #[serde(default)]
    pub(crate) threads: Option<usize>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            verbose: verbosity(),
            rate_limit_per_minute: rate_limit_per_minute(),
            rate_limit_per_hour: rate_limit_per_hour(),
            rate_limit_per_day: rate_limit_per_day(),
            pool_target_size: pool_target_size(),
            max_workers: max_workers(),
            validation_concurrency: validation_concurrency(),
            attempt_retry_limit: attempt_retry_limit(),
            min_delay_ms: min_delay_ms(),
            max_delay_ms: max_delay_ms(),
            proxy_dead_grace_period: proxy_dead_grace_period(),
            request_timeout: request_timeout(),
            shutdown_grace: shutdown_grace(),
            sources: Vec::new(),
            source_protocol: Protocol::default(),
            source_limit: source_limit(),
            proxy_file: None,
            probe_urls: Vec::new(),
            pool_cache: None,
            threads: None,
        }
    }
}

impl Config {
    /// Load configuration from a file
    pub(crate) fn load_from_file(path: &Path) -> Result<Config> {
        let contents = fs::read_to_string(path)?;
        toml::from_str(&contents).with_context(|| "Failed to parse configuration file")
    }

    /// Merge the configuration from TOML into the CLI configuration.
    /// Values given on the command line or in the environment win.
    pub(crate) fn merge(&mut self, toml: Config) {
        // NOTE: if you see an error within this macro call, check to make sure that
        // that the fields provided to fold_in! match all the fields of the Config struct.
        fold_in! {
            // Destination and source configs
            self, toml;

            Config {
                // Keys with defaults to assign
                attempt_retry_limit: DEFAULT_ATTEMPT_RETRY_LIMIT,
                max_delay_ms: DEFAULT_MAX_DELAY_MS,
                max_workers: DEFAULT_MAX_WORKERS,
                min_delay_ms: DEFAULT_MIN_DELAY_MS,
                pool_cache: None,
                pool_target_size: DEFAULT_POOL_TARGET_SIZE,
                probe_urls: Vec::<Url>::new(),
                proxy_dead_grace_period: default_dead_grace_period(),
                proxy_file: None,
                rate_limit_per_day: DEFAULT_RATE_LIMIT_PER_DAY,
                rate_limit_per_hour: DEFAULT_RATE_LIMIT_PER_HOUR,
                rate_limit_per_minute: DEFAULT_RATE_LIMIT_PER_MINUTE,
                request_timeout: DEFAULT_TIMEOUT,
                shutdown_grace: default_shutdown_grace(),
                source_limit: DEFAULT_SOURCE_LIMIT,
                source_protocol: Protocol::default(),
                sources: Vec::<Url>::new(),
                threads: None,
                validation_concurrency: DEFAULT_VALIDATION_CONCURRENCY,
                verbose: Verbosity::default(),
            }
        }
    }

    /// Turn the flat options into the library's configuration
    pub(crate) fn relay_config(&self) -> viewrelay_lib::Config {
        let mut config = viewrelay_lib::Config::default();

        config.rate_limit = RateLimitConfig {
            per_minute: self.rate_limit_per_minute,
            per_hour: self.rate_limit_per_hour,
            per_day: self.rate_limit_per_day,
        };

        config.pool.target_size = self.pool_target_size;
        config.pool.dead_grace_period = self.proxy_dead_grace_period;

        config.validator.concurrency = self.validation_concurrency;
        if !self.probe_urls.is_empty() {
            config.validator.probe_urls.clone_from(&self.probe_urls);
        }

        config.dispatcher.max_workers = self.max_workers;
        config.dispatcher.attempt_retry_limit = self.attempt_retry_limit;
        config.dispatcher.min_delay_ms = self.min_delay_ms;
        config.dispatcher.max_delay_ms = self.max_delay_ms;
        config.dispatcher.request_timeout = self.request_timeout;

        config.sources = if self.sources.is_empty() {
            default_sources()
        } else {
            self.sources
                .iter()
                .map(|url| SourceConfig {
                    url: url.clone(),
                    protocol: self.source_protocol,
                    limit: self.source_limit,
                })
                .collect()
        };
        config
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn parse(args: &[&str]) -> ViewRelayOptions {
        ViewRelayOptions::parse_from(std::iter::once("viewrelay").chain(args.iter().copied()))
    }

    #[test]
    fn test_defaults_match_library() {
        let opts = parse(&["status"]);
        assert_eq!(opts.config, Config::default());
        assert_eq!(opts.command, Command::Status);

        let config = opts.config.relay_config();
        let library = viewrelay_lib::Config::default();
        assert_eq!(config.rate_limit, library.rate_limit);
        assert_eq!(config.dispatcher, library.dispatcher);
        assert_eq!(config.pool, library.pool);
        assert_eq!(config.sources, library.sources);
    }

    #[test]
    fn test_run_arguments() {
        let opts = parse(&[
            "run",
            "https://example.com/watch",
            "-n",
            "25",
            "--actor",
            "alice",
            "--duration-hint",
            "2s",
            "--max-workers",
            "4",
        ]);
        assert_eq!(
            opts.command,
            Command::Run {
                target: Url::parse("https://example.com/watch").unwrap(),
                count: 25,
                actor: "alice".to_string(),
                duration_hint: Some(Duration::from_secs(2)),
                deadline: None,
            }
        );
        assert_eq!(opts.config.max_workers, 4);
    }

    #[test]
    fn test_cli_wins_over_toml() {
        let toml: Config = toml::from_str(
            r#"
            rate_limit_per_minute = 5
            max_workers = 10
            proxy_dead_grace_period = "1h"
            verbose = "info"
            "#,
        )
        .unwrap();

        let mut cli = parse(&["--max-workers", "3", "status"]).config;
        cli.merge(toml);

        assert_eq!(cli.rate_limit_per_minute, 5);
        assert_eq!(cli.max_workers, 3);
        assert_eq!(cli.proxy_dead_grace_period, Duration::from_secs(3600));
        assert_eq!(cli.verbose.log_level(), log::Level::Info);
    }

    #[test]
    fn test_unknown_key_is_rejected() {
        assert!(toml::from_str::<Config>("max_wrokers = 3").is_err());
    }

    #[test]
    fn test_sources_replace_builtin_lists() {
        let config = Config {
            sources: vec![Url::parse("https://lists.test/socks.txt").unwrap()],
            source_protocol: Protocol::Socks5,
            source_limit: 5,
            probe_urls: vec![Url::parse("http://probe.test/").unwrap()],
            ..Config::default()
        }
        .relay_config();

        assert_eq!(config.sources.len(), 1);
        assert_eq!(config.sources[0].protocol, Protocol::Socks5);
        assert_eq!(config.sources[0].limit, 5);
        assert_eq!(config.validator.probe_urls.len(), 1);
    }

    #[test]
    fn test_swapped_delays_fail_validation() {
        let config = Config {
            min_delay_ms: 500,
            max_delay_ms: 100,
            ..Config::default()
        };
        assert!(config.relay_config().validate().is_err());
    }
}
