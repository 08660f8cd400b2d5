use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use crate::sessions::{SessionLifecycleManager, SessionStore};

/// Handle to stop and join the sweep task.
#[derive(Debug)]
pub struct SweepHandle {
    shutdown: watch::Sender<bool>,
    join: Option<JoinHandle<()>>,
}

impl SweepHandle {
    /// Request graceful shutdown and wait for the worker to stop.
    ///
    /// An in-flight sweep finishes first.
    pub async fn shutdown(mut self) {
        let _ = self.shutdown.send(true);
        if let Some(join) = self.join.take() {
            if let Err(err) = join.await {
                warn!(error = %err, "session sweeper task ended abnormally");
            }
        }
    }
}

/// Periodic expiry sweep.
///
/// - One sweep at a time: a slow sweep delays the next tick instead of overlapping
/// - Takes no per-user lock
/// - Sweep failures are logged and retried on the next tick
#[derive(Debug)]
pub struct SweepWorker;

impl SweepWorker {
    /// Spawn the sweep loop on the current tokio runtime.
    pub fn spawn<S>(manager: Arc<SessionLifecycleManager<S>>, every: Duration) -> SweepHandle
    where
        S: SessionStore + 'static,
    {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let join = tokio::spawn(sweep_loop(manager, every, shutdown_rx));

        SweepHandle {
            shutdown: shutdown_tx,
            join: Some(join),
        }
    }
}

async fn sweep_loop<S>(
    manager: Arc<SessionLifecycleManager<S>>,
    every: Duration,
    mut shutdown: watch::Receiver<bool>,
) where
    S: SessionStore + 'static,
{
    let mut ticker = tokio::time::interval(every);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // The first tick completes immediately; start sweeping one period in.
    ticker.tick().await;

    info!(interval_secs = every.as_secs(), "session sweeper started");
    loop {
        tokio::select! {
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
            }
            _ = ticker.tick() => {
                match manager.sweep_expired().await {
                    Ok(swept) => debug!(swept, "sweep finished"),
                    Err(err) => warn!(error = %err, "session sweep failed"),
                }
            }
        }
    }
    info!("session sweeper stopped");
}
