use std::time::Duration;

use incremental_core::SOURCE_DROPPED_CHANNEL;
use sqlx::postgres::PgListener;
use sqlx::PgPool;
use tracing::{error, info, warn};

use crate::health::HealthHandle;
use crate::metrics::inc;
use crate::metrics_constants::*;

/// Accounts for a pipeline the drop trigger removed. Its definition and scheduled job are
/// already gone by the time the notification arrives.
pub fn pipeline_dropped(payload: &str) -> Option<&str> {
    let pipeline = payload.trim();
    if pipeline.is_empty() {
        return None;
    }

    info!("pipeline {} was dropped together with its source", pipeline);
    inc(PIPELINES_DROPPED, &[], 1);
    Some(pipeline)
}

/// Follows drop notifications until the connection cannot be re-established. The listener
/// wakes up at least every `heartbeat` to report liveness.
pub async fn listen_for_drops(
    pool: PgPool,
    liveness: HealthHandle,
    heartbeat: Duration,
) -> eyre::Result<()> {
    let mut listener = PgListener::connect_with(&pool).await?;
    listener.listen(SOURCE_DROPPED_CHANNEL).await?;
    info!("listening for dropped pipelines on {}", SOURCE_DROPPED_CHANNEL);

    loop {
        liveness.report_healthy().await;

        match tokio::time::timeout(heartbeat, listener.try_recv()).await {
            Err(_) => continue,
            Ok(Ok(Some(notification))) => {
                pipeline_dropped(notification.payload());
            }
            Ok(Ok(None)) => {
                // Cleanup happens in the database, only the log line is lost
                warn!("drop listener lost its connection, reconnecting");
            }
            Ok(Err(e)) => {
                error!("drop listener failed: {}", e);
                return Err(e.into());
            }
        }
    }
}
