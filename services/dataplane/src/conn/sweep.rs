//! Background expiration sweep.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info};

use crate::context::Context;

/// Run [`Context::sweep`] every `interval` until the context shuts down.
pub fn spawn_sweeper(ctx: Arc<Context>, interval: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        info!(interval_ms = interval.as_millis() as u64, "Connection sweeper started");

        loop {
            ticker.tick().await;
            if ctx.is_shut_down() {
                break;
            }
            let stats = ctx.sweep();
            if stats.busy > 0 {
                debug!(busy = stats.busy, "Due connections still referenced");
            }
        }

        info!("Connection sweeper stopped");
    })
}
