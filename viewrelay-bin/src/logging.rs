use std::io::Write;

use env_logger::{Builder, Env};
use log::LevelFilter;

use crate::verbosity::Verbosity;

/// Modules that are only worth hearing from at trace level
const NOISY_MODULES: &[&str] = &["hyper", "hyper_util", "reqwest", "rustls", "h2"];

/// Initialize the logging system with the given verbosity level.
///
/// `RUST_LOG` takes precedence over the command-line flags.
pub(crate) fn init_logging(verbose: &Verbosity) {
    let env = Env::default().filter_or("RUST_LOG", "warn");

    let mut builder = Builder::from_env(env);
    builder
        .format_timestamp(None)
        .format_module_path(false)
        .format_target(false);

    if std::env::var("RUST_LOG").is_err() {
        let level_filter = verbose.log_level_filter();

        builder
            .filter_level(LevelFilter::Warn.min(level_filter))
            .filter_module("viewrelay", level_filter)
            .filter_module("viewrelay_lib", level_filter);

        if level_filter < LevelFilter::Trace {
            for module in NOISY_MODULES {
                builder.filter_module(module, LevelFilter::Warn.min(level_filter));
            }
        }
    }

    // Logs go to stderr, so that stdout stays machine-readable
    builder.format(|buf, record| writeln!(buf, "[{}] {}", record.level(), record.args()));

    builder.init();
}
