use tokio::sync::watch;
use tracing::info;

use crate::app_state::AppState;

/// Spawn the router's background loops: the datastore refresh poll, the
/// tokenizer pool's health sweep, and the priority queue's rate-limited
/// drain. Each runs on its own task; `shutdown_rx` (shared by the first
/// two) and the queue's own `close()` are both driven from the same
/// signal so a single `ctrl_c` tears down everything.
pub fn spawn(state: AppState, shutdown_rx: watch::Receiver<bool>) {
    let datastore = state.datastore.clone();
    let datastore_period = state.config.datastore_refresh_period;
    let rx = shutdown_rx.clone();
    tokio::spawn(async move {
        info!("datastore refresh loop starting");
        datastore.run(datastore_period, rx).await;
        info!("datastore refresh loop stopped");
    });

    let tokenizer_pool = state.tokenizer_pool.clone();
    let health_period = state.config.tokenizer_health_check_period;
    let ttl = state.config.tokenizer_ttl;
    let rx = shutdown_rx.clone();
    tokio::spawn(async move {
        info!("tokenizer pool health loop starting");
        tokenizer_pool.run(health_period, ttl, rx).await;
        info!("tokenizer pool health loop stopped");
    });

    let queue = state.priority_queue.clone();
    let qps = state.config.queue_qps;
    let mut rx = shutdown_rx;
    tokio::spawn(async move {
        info!("priority queue drain loop starting");
        tokio::select! {
            _ = queue.run(qps) => {}
            _ = rx.changed() => {
                queue.close();
            }
        }
        info!("priority queue drain loop stopped");
    });
}
