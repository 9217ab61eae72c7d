//! Heartbeat liveness monitor.
//!
//! Runs as its own task once the connection is established: every interval
//! it posts a ping and waits one probe window for the matching pong. Misses
//! accumulate; any pong for an outstanding ping — including one that lands
//! after its own window already closed — resets the count. Reaching the miss
//! threshold declares the connection lost and the monitor stops; pongs
//! arriving after that point find no receiver and are ignored.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;
use uuid::Uuid;

use crate::config::HeartbeatConfig;

/// The engine surface the monitor drives. Split out so miss/loss sequencing
/// is testable without a connection.
pub(crate) trait HeartbeatPort: Send + Sync {
    fn endpoint_alive(&self) -> bool;
    /// Post a ping frame; returns its id. `Err` means the endpoint is gone.
    fn post_ping(&self) -> Result<Uuid, ()>;
    fn on_missed(&self, misses: u32);
    fn on_lost(&self, misses: u32);
    fn on_detached(&self);
}

pub(crate) async fn run(
    port: Arc<dyn HeartbeatPort>,
    config: HeartbeatConfig,
    mut pong_rx: mpsc::UnboundedReceiver<Uuid>,
) {
    let probe_window = Duration::from_millis(config.timeout_ms);
    let mut ticker = tokio::time::interval(Duration::from_millis(config.interval_ms));
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    ticker.tick().await; // consume immediate first tick

    let mut outstanding: HashSet<Uuid> = HashSet::new();
    let mut misses: u32 = 0;

    loop {
        ticker.tick().await;

        // A pong that landed after its probe window closed still proves the
        // peer alive.
        while let Ok(id) = pong_rx.try_recv() {
            if outstanding.remove(&id) {
                misses = 0;
            }
        }

        if !port.endpoint_alive() {
            port.on_detached();
            return;
        }
        let Ok(ping_id) = port.post_ping() else {
            port.on_detached();
            return;
        };
        outstanding.insert(ping_id);

        let probe = tokio::time::sleep(probe_window);
        tokio::pin!(probe);
        let mut answered = false;
        loop {
            tokio::select! {
                _ = &mut probe => break,
                pong = pong_rx.recv() => match pong {
                    Some(id) => {
                        if outstanding.remove(&id) {
                            misses = 0;
                            answered = true;
                            break;
                        }
                        // Unknown correlation: not one of our pings.
                    }
                    // Engine tore the channel down; monitor is done.
                    None => return,
                },
            }
        }

        if answered {
            continue;
        }
        misses += 1;
        tracing::debug!(misses, max = config.max_misses, "heartbeat probe missed");
        port.on_missed(misses);
        if misses >= config.max_misses {
            port.on_lost(misses);
            return;
        }
    }
}
