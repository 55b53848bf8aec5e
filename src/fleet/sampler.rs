//! Per-container resource sampling tasks

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::types::DesiredState;

use super::manager::FleetManager;

/// Sampling loop for one running container.
///
/// Polls driver stats on the configured interval, folds samples into the
/// container record with exponential smoothing, and marks the container
/// Errored after three consecutive poll failures. Stat errors never drive
/// runner state transitions; the health check owns those.
pub(super) async fn run(
    mgr: Arc<FleetManager>,
    container_id: String,
    interval: Duration,
    token: CancellationToken,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = token.cancelled() => {
                debug!("sampler for {} stopping", container_id);
                return;
            }
            _ = ticker.tick() => {}
        }

        match mgr.driver().stats(&container_id).await {
            Ok(sample) => {
                mgr.update_container(&container_id, |record| {
                    record.record_sample(sample);
                });
            }
            Err(e) => {
                debug!("stats poll for {} failed: {}", container_id, e);

                let errored = mgr
                    .with_container(&container_id, |record| record.record_stat_failure())
                    .unwrap_or(false);

                if errored {
                    warn!(
                        "container {} marked errored after repeated stats failures",
                        container_id
                    );
                    return;
                }

                // A container that no longer exists has nothing to sample;
                // the health check will notice the crash.
                let gone = mgr
                    .with_container(&container_id, |record| {
                        record.desired == DesiredState::Removed
                    })
                    .unwrap_or(true);
                if gone {
                    return;
                }
            }
        }
    }
}
