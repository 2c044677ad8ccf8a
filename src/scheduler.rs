//! Cron-driven trigger loop plus startup recovery.
//!
//! The teacher has no cron dependency of its own; its closest analogue
//! is the `tokio::time::interval` polling loops spawned throughout
//! `main.rs` (e.g. the 60s wallet-analytics poll, the 45-minute expiry
//! sweep). This generalizes that pattern to a cron expression parsed
//! with the `cron` crate, since a fixed interval cannot express
//! "daily at 03:00".

use crate::sync::SyncManager;
use chrono::Utc;
use cron::Schedule;
use std::str::FromStr;
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{error, info};

/// Cron tick driver. Each tick's actual sync work is rebuilt per user by
/// the caller's `on_tick` closure (see `main.rs::run_sync`), since each
/// user carries its own Hardcover credentials and so needs its own
/// `SyncManager` — this type owns only the timing loop.
pub struct Scheduler {
    schedule: Schedule,
    shutdown: broadcast::Sender<()>,
}

impl Scheduler {
    pub fn new(cron_expr: &str) -> anyhow::Result<Self> {
        let schedule = Schedule::from_str(cron_expr)?;
        let (shutdown, _) = broadcast::channel(1);
        Ok(Self { schedule, shutdown })
    }

    pub fn shutdown_handle(&self) -> broadcast::Sender<()> {
        self.shutdown.clone()
    }

    /// Startup recovery: for every `(user_id, sync_manager)` pair, flush
    /// sessions older than `session_timeout` before the first scheduled
    /// run. Each user's own `sync_manager` must be passed in — it carries
    /// that user's Hardcover credentials, so reusing one across users
    /// would push writes under the wrong account. A no-op per user when
    /// delayed updates are disabled.
    pub async fn recover_sessions(&self, managers: &[(String, Arc<SyncManager>)]) {
        for (user_id, sync_manager) in managers {
            sync_manager.recover_expired_sessions(user_id).await;
        }
    }

    /// Runs forever, firing `run_once` at each cron tick until the
    /// shutdown signal fires.
    pub async fn run_forever<F, Fut>(&self, mut on_tick: F)
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = ()>,
    {
        let mut shutdown_rx = self.shutdown.subscribe();
        loop {
            let now = Utc::now();
            let Some(next) = self.schedule.after(&now).next() else {
                error!("cron schedule produced no next firing, stopping scheduler");
                return;
            };
            let delay = (next - now).to_std().unwrap_or(std::time::Duration::from_secs(1));

            tokio::select! {
                _ = tokio::time::sleep(delay) => {
                    info!(next = %next, "scheduler tick");
                    on_tick().await;
                }
                _ = shutdown_rx.recv() => {
                    info!("scheduler received shutdown signal, stopping");
                    return;
                }
            }
        }
    }
}
