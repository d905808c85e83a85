use anyhow::{Context, Result};
use log::{debug, info, warn};
use tokio::sync::mpsc;
use viewrelay_lib::{DispatchEvent, ErrorKind, JobId, JobState, ViewJob, ViewRelay};

use super::print_json;
use crate::ExitCode;

/// Make sure the pool has proxies, run `job` to the end and print its result
pub(crate) async fn run(
    relay: &ViewRelay,
    events: &mut mpsc::Receiver<DispatchEvent>,
    job: ViewJob,
) -> Result<ExitCode> {
    if relay.query_proxy_pool_status().usable() == 0 {
        let report = relay.force_proxy_refresh().await;
        info!(
            "Pool refreshed: {} fetched, {} reachable",
            report.fetched, report.reachable
        );
    }
    if relay.query_proxy_pool_status().usable() == 0 {
        warn!("No usable proxy found; the job will be aborted");
    }

    let handle = match relay.submit(job) {
        Ok(handle) => handle,
        Err(ErrorKind::RateLimitExceeded { actor, retry_after }) => {
            warn!(
                "Actor `{actor}` is rate limited; retry in {}",
                humantime::format_duration(std::time::Duration::from_secs(retry_after.as_secs()))
            );
            return Ok(ExitCode::RateLimited);
        }
        Err(e) => return Err(e).context("Cannot submit view job"),
    };

    let id = handle.id();
    let (result, ()) = tokio::join!(handle.result(), log_events(events, id));
    let result = result.context("View job did not finish")?;

    print_json(&result)?;

    Ok(match result.state {
        JobState::Completed => ExitCode::Success,
        _ => ExitCode::JobFailure,
    })
}

/// Log the job's events until it finishes
async fn log_events(events: &mut mpsc::Receiver<DispatchEvent>, id: JobId) {
    while let Some(event) = events.recv().await {
        if event.job_id() != id {
            continue;
        }
        match event {
            DispatchEvent::StateChanged { state, actor, .. } => {
                info!("Job {id} of `{actor}` is {state}");
            }
            DispatchEvent::Attempt(telemetry) => match &telemetry.failure {
                None => debug!(
                    "Attempt {} via {} succeeded in {:?}",
                    telemetry.attempt, telemetry.proxy, telemetry.elapsed
                ),
                Some(failure) => debug!(
                    "Attempt {} try {} via {} failed: {failure:?}",
                    telemetry.attempt, telemetry.try_number, telemetry.proxy
                ),
            },
            DispatchEvent::Finished(result) => {
                info!(
                    "Job {id} finished: {} succeeded, {} failed, {} cancelled in {:?}",
                    result.succeeded_count,
                    result.failed_count,
                    result.cancelled_count,
                    result.elapsed
                );
                return;
            }
        }
    }
}
