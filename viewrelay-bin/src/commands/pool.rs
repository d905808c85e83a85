use anyhow::Result;
use log::info;
use serde::Serialize;
use viewrelay_lib::proxy::PoolStatus;
use viewrelay_lib::{RefreshReport, ViewRelay};

use super::print_json;
use crate::ExitCode;

#[derive(Debug, Serialize)]
struct RefreshOutput {
    report: RefreshReport,
    pool: PoolStatus,
}

/// Print the current pool status
pub(crate) fn status(relay: &ViewRelay) -> Result<ExitCode> {
    print_json(&relay.query_proxy_pool_status())?;
    Ok(ExitCode::Success)
}

/// Run one refresh cycle and print what it did
pub(crate) async fn refresh(relay: &ViewRelay) -> Result<ExitCode> {
    let report = relay.force_proxy_refresh().await;
    let pool = relay.query_proxy_pool_status();
    info!(
        "Refresh done: {} fetched, {} of {} validated proxies reachable",
        report.fetched, report.reachable, report.validated
    );
    print_json(&RefreshOutput { report, pool })?;

    if pool.usable() == 0 {
        return Ok(ExitCode::PoolEmpty);
    }
    Ok(ExitCode::Success)
}
