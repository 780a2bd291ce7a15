use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio::time::MissedTickBehavior;
use tracing::debug;
use tracing::info;

use super::registry::Registry;

/// Sweeps the registry every `interval`, gracefully stopping Ready sessions
/// that have been idle past the threshold. Exits when the registry shuts
/// down or is dropped.
pub(super) fn spawn(registry: &Arc<Registry>, interval: Duration) -> JoinHandle<()> {
    let shutdown = registry.shutdown_token();
    let registry = Arc::downgrade(registry);
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval_at(Instant::now() + interval, interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                () = shutdown.cancelled() => break,
                _ = ticker.tick() => {}
            }
            let Some(registry) = registry.upgrade() else {
                break;
            };
            let reaped = registry.reap_idle(Instant::now());
            if reaped > 0 {
                info!(reaped, "idle sweep stopped sessions");
            }
        }
        debug!("idle reaper stopped");
    })
}
