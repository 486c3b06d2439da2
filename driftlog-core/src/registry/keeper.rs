use super::{LeaseRefresh, LeaseRegistry};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};

/// Background refresher for a lease held by this instance.
///
/// Refreshes every `interval` until stopped. The first refresh answered
/// `Lost`, or failing outright, marks the lease lost and ends the task;
/// holders must then stop acting on the lease.
pub struct LeaseKeeper {
    key: String,
    lost: watch::Receiver<bool>,
    stop: Option<oneshot::Sender<()>>,
    handle: Option<JoinHandle<()>>,
}

impl LeaseKeeper {
    pub fn start(
        registry: Arc<dyn LeaseRegistry>,
        key: String,
        value: String,
        ttl: Duration,
        interval: Duration,
    ) -> Self {
        let (lost_tx, lost_rx) = watch::channel(false);
        let (stop_tx, mut stop_rx) = oneshot::channel::<()>();

        let task_key = key.clone();
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(Instant::now() + interval, interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = &mut stop_rx => break,
                    _ = ticker.tick() => {
                        match registry.refresh(&task_key, &value, ttl).await {
                            Ok(LeaseRefresh::Refreshed) => {
                                tracing::trace!("refreshed lease {}", task_key);
                            }
                            Ok(LeaseRefresh::Lost) => {
                                tracing::warn!("lease {} was lost before refresh", task_key);
                                let _ = lost_tx.send(true);
                                break;
                            }
                            Err(error) => {
                                tracing::warn!("failed to refresh lease {}: {}", task_key, error);
                                let _ = lost_tx.send(true);
                                break;
                            }
                        }
                    }
                }
            }
        });

        Self {
            key,
            lost: lost_rx,
            stop: Some(stop_tx),
            handle: Some(handle),
        }
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn is_lost(&self) -> bool {
        *self.lost.borrow()
    }

    /// Resolves once the lease is lost. Never resolves for a lease that is
    /// held until the keeper stops.
    pub async fn lost(&self) {
        let mut lost = self.lost.clone();
        if lost.wait_for(|lost| *lost).await.is_err() {
            std::future::pending::<()>().await;
        }
    }

    /// Stop refreshing and wait for the refresh task to finish. Returns
    /// whether the lease was lost while held.
    pub async fn stop(mut self) -> bool {
        if let Some(stop) = self.stop.take() {
            let _ = stop.send(());
        }
        if let Some(handle) = self.handle.take() {
            if let Err(error) = handle.await {
                tracing::warn!("lease keeper for {} ended abnormally: {}", self.key, error);
                return true;
            }
        }
        self.is_lost()
    }
}

impl Drop for LeaseKeeper {
    fn drop(&mut self) {
        if let Some(handle) = self.handle.take() {
            handle.abort();
        }
    }
}
