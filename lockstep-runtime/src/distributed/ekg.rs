use std::sync::Arc;
use tokio::net::TcpStream;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{interval, timeout, Duration, MissedTickBehavior};
use tracing::debug;

use crate::distributed::master::MasterShared;

/// Heartbeat loop for the whole pool. One task multiplexes over every
/// live worker: each tick it dials them all, records successes, and
/// funnels dial failures into `mark_worker_failed` so a phase in
/// progress unblocks.
pub(crate) struct FailureDetector {
    shared: Arc<MasterShared>,
    period: Duration,
    shutdown: watch::Receiver<bool>,
}

impl FailureDetector {
    pub fn spawn(
        shared: Arc<MasterShared>,
        period: Duration,
        shutdown: watch::Receiver<bool>,
    ) -> JoinHandle<()> {
        let detector = Self {
            shared,
            period,
            shutdown,
        };
        tokio::spawn(detector.run())
    }

    async fn run(mut self) {
        let mut ticker = interval(self.period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = ticker.tick() => self.sweep().await,
                changed = self.shutdown.changed() => {
                    if changed.is_err() || *self.shutdown.borrow() {
                        return;
                    }
                }
            }
        }
    }

    async fn sweep(&self) {
        let targets = self.shared.live_workers().await;
        let dial_timeout = self.period;
        let checks = targets.into_iter().map(|host_port| async move {
            let result = timeout(dial_timeout, TcpStream::connect(&host_port)).await;
            let alive = matches!(result, Ok(Ok(_)));
            (host_port, alive)
        });
        for (host_port, alive) in futures::future::join_all(checks).await {
            if alive {
                debug!(worker = %host_port, "heartbeat ok");
                self.shared.record_heartbeat(&host_port).await;
            } else {
                self.shared
                    .mark_worker_failed(&host_port, "could not be dialed")
                    .await;
            }
        }
    }
}
