pub(crate) mod pool;
pub(crate) mod run;

pub(crate) use pool::{refresh, status};
pub(crate) use run::run;

use std::io::{self, Write};

use anyhow::Result;
use serde::Serialize;

/// Write `value` to stdout as pretty-printed JSON, followed by a newline
pub(crate) fn print_json<T: Serialize>(value: &T) -> Result<()> {
    let mut stdout = io::stdout().lock();
    serde_json::to_writer_pretty(&mut stdout, value)?;
    writeln!(stdout)?;
    Ok(())
}
