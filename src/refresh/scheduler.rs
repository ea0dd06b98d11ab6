//! Periodic refresh trigger.

use std::sync::Arc;
use std::time::Duration;

use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use super::Refresher;

/// Run a refresh cycle immediately and then every `every`, until `shutdown`
/// is cancelled.
///
/// Failed cycles are already logged by [`Refresher::run_once`]; the next tick
/// is the only retry.  Cancellation also interrupts a cycle in progress.
pub async fn run_refresh_loop(
    refresher: Arc<Refresher>,
    every: Duration,
    shutdown: CancellationToken,
) {
    let mut ticker = tokio::time::interval(every);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    info!(interval_secs = every.as_secs(), "refresh scheduler started");

    loop {
        tokio::select! {
            biased;
            () = shutdown.cancelled() => break,
            _ = ticker.tick() => {}
        }

        tokio::select! {
            biased;
            () = shutdown.cancelled() => break,
            result = refresher.run_once() => {
                if let Ok(summary) = result {
                    if summary.elapsed > every {
                        warn!(
                            elapsed_ms = summary.elapsed.as_millis() as u64,
                            interval_secs = every.as_secs(),
                            "refresh cycle outlasted the refresh interval"
                        );
                    }
                }
            }
        }
    }

    info!("refresh scheduler stopped");
}
