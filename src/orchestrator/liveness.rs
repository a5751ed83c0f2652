use super::Orchestrator;
use chrono::Utc;
use tokio::sync::watch;
use tokio::time::{interval, Duration, MissedTickBehavior};

/// Periodically flip agents that stopped heart-beating to INACTIVE.
/// Runs until `shutdown` changes or its sender is dropped.
pub async fn liveness_monitor(orchestrator: Orchestrator, mut shutdown: watch::Receiver<bool>) {
    let check_interval = Duration::from_millis(orchestrator.config().liveness_check_interval_ms.max(1));
    let mut ticker = interval(check_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    tracing::info!(
        interval_ms = check_interval.as_millis() as u64,
        timeout_ms = orchestrator.config().liveness_timeout_ms,
        "Liveness monitor started"
    );

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let flipped = orchestrator.check_liveness(Utc::now()).await;
                for agent_id in &flipped {
                    tracing::warn!(agent_id = %agent_id.short(), "Agent missed its heartbeats, marked INACTIVE");
                }
            }
            _ = shutdown.changed() => {
                tracing::info!("Liveness monitor received shutdown signal");
                break;
            }
        }
    }
}
