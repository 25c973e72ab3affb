//! Periodic health checking.
//!
//! The checker connects through the local proxies like any client would
//! and runs `replSetGetStatus`. Enough consecutive failures crash the
//! process so a supervisor can restart it with a clean slate.

use crate::direct::DirectClient;
use crate::error::TopologyError;
use crate::state::PROBE_TIMEOUT;
use async_trait::async_trait;
use bson::{doc, Document};
use mongobridge_protocol::command::command_ok;
use mongobridge_proxy::BackendTls;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};

/// Something the health checker can probe and, on repeated failure,
/// escalate against.
#[async_trait]
pub trait Checkable: Send + Sync {
    /// One probe, bounded by `timeout`.
    async fn check(&self, timeout: Duration) -> Result<(), TopologyError>;

    /// Invoked after the failure threshold is reached.
    fn handle_failure(&self);
}

/// Periodically probes a target and escalates after consecutive failures.
pub struct HealthChecker {
    pub interval: Duration,
    pub threshold: u32,
}

impl HealthChecker {
    pub fn new(interval: Duration, threshold: u32) -> Self {
        Self {
            interval,
            threshold,
        }
    }

    /// Runs until shutdown. Every tick pokes the synchronization trigger
    /// (dropped when the manager is busy) and probes the target.
    pub async fn run<T>(
        &self,
        target: &T,
        sync_trigger: &mpsc::Sender<()>,
        shutdown: &mut broadcast::Receiver<()>,
    ) where
        T: Checkable + ?Sized,
    {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        let mut consecutive_failures: u32 = 0;

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let _ = sync_trigger.try_send(());

                    match target.check(self.interval).await {
                        Ok(()) => consecutive_failures = 0,
                        Err(e) => {
                            consecutive_failures += 1;
                            tracing::warn!(
                                failures = consecutive_failures,
                                "health check failed: {}", e
                            );
                        }
                    }

                    if consecutive_failures >= self.threshold {
                        consecutive_failures = 0;
                        target.handle_failure();
                    }
                }
                _ = shutdown.recv() => return,
            }
        }
    }
}

/// Probes a set of addresses as a client would: the first one that
/// answers `replSetGetStatus` successfully wins.
pub(crate) async fn check_repl_set_status(
    addrs: &[String],
    set_name: &str,
    tls: Option<&BackendTls>,
) -> Result<(), TopologyError> {
    let mut last_error = None;
    for addr in addrs {
        let mut client = match DirectClient::connect(addr, tls, None, PROBE_TIMEOUT).await {
            Ok(client) => client,
            Err(e) => {
                last_error = Some(e);
                continue;
            }
        };

        match client
            .run_command::<Document>("admin", &doc! { "replSetGetStatus": 1 })
            .await
        {
            Ok(reply) if command_ok(&reply) => {
                if !set_name.is_empty() {
                    match reply.get_str("set") {
                        Ok(name) if name == set_name => {}
                        _ => {
                            last_error = Some(TopologyError::CommandFailed(
                                "replSetGetStatus".into(),
                                format!("unexpected replica set, wanted {:?}", set_name),
                            ));
                            continue;
                        }
                    }
                }
                return Ok(());
            }
            Ok(reply) => {
                last_error = Some(TopologyError::CommandFailed(
                    "replSetGetStatus".into(),
                    reply
                        .get_str("errmsg")
                        .unwrap_or("command returned ok: 0")
                        .to_string(),
                ));
            }
            Err(e) => last_error = Some(e),
        }
    }
    Err(last_error.unwrap_or_else(|| TopologyError::NoUsableSeeds(addrs.join(","))))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::Arc;

    struct FakeTarget {
        fail: AtomicBool,
        checks: AtomicUsize,
        failures_handled: AtomicUsize,
    }

    impl FakeTarget {
        fn new(fail: bool) -> Arc<Self> {
            Arc::new(Self {
                fail: AtomicBool::new(fail),
                checks: AtomicUsize::new(0),
                failures_handled: AtomicUsize::new(0),
            })
        }
    }

    #[async_trait]
    impl Checkable for FakeTarget {
        async fn check(&self, _timeout: Duration) -> Result<(), TopologyError> {
            self.checks.fetch_add(1, Ordering::SeqCst);
            if self.fail.load(Ordering::SeqCst) {
                Err(TopologyError::Timeout)
            } else {
                Ok(())
            }
        }

        fn handle_failure(&self) {
            self.failures_handled.fetch_add(1, Ordering::SeqCst);
        }
    }

    async fn run_for(
        target: Arc<FakeTarget>,
        interval: Duration,
        threshold: u32,
        duration: Duration,
    ) {
        let (sync_tx, _sync_rx) = mpsc::channel(1);
        let (shutdown_tx, mut shutdown_rx) = broadcast::channel(1);
        let handle = tokio::spawn(async move {
            let checker = HealthChecker::new(interval, threshold);
            checker.run(&*target, &sync_tx, &mut shutdown_rx).await;
        });
        tokio::time::sleep(duration).await;
        let _ = shutdown_tx.send(());
        let _ = handle.await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_handle_failure_called_after_threshold() {
        let target = FakeTarget::new(true);
        // Ticks at 0ms and 10ms reach the threshold of 2; the counter
        // resets, and the third tick at 20ms leaves it at 1 again.
        run_for(
            target.clone(),
            Duration::from_millis(10),
            2,
            Duration::from_millis(25),
        )
        .await;
        assert_eq!(target.failures_handled.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_handle_failure_not_called_when_healthy() {
        let target = FakeTarget::new(false);
        run_for(
            target.clone(),
            Duration::from_millis(10),
            2,
            Duration::from_millis(50),
        )
        .await;
        assert!(target.checks.load(Ordering::SeqCst) >= 2);
        assert_eq!(target.failures_handled.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_success_resets_counter() {
        let target = FakeTarget::new(true);
        let (sync_tx, _sync_rx) = mpsc::channel(1);
        let (shutdown_tx, mut shutdown_rx) = broadcast::channel(1);

        let runner = {
            let target = target.clone();
            tokio::spawn(async move {
                let checker = HealthChecker::new(Duration::from_millis(10), 3);
                checker.run(&*target, &sync_tx, &mut shutdown_rx).await;
            })
        };

        // Two failures, then recovery before the threshold of three.
        tokio::time::sleep(Duration::from_millis(15)).await;
        target.fail.store(false, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(50)).await;

        let _ = shutdown_tx.send(());
        let _ = runner.await;
        assert_eq!(target.failures_handled.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_sync_trigger_poked_each_tick() {
        let target = FakeTarget::new(false);
        let (sync_tx, mut sync_rx) = mpsc::channel(1);
        let (shutdown_tx, mut shutdown_rx) = broadcast::channel(1);

        let runner = {
            let target = target.clone();
            tokio::spawn(async move {
                let checker = HealthChecker::new(Duration::from_millis(10), 2);
                checker.run(&*target, &sync_tx, &mut shutdown_rx).await;
            })
        };

        tokio::time::sleep(Duration::from_millis(35)).await;
        let _ = shutdown_tx.send(());
        let _ = runner.await;

        // At least one trigger landed; extra ones were dropped, not
        // queued beyond the channel capacity.
        assert!(sync_rx.try_recv().is_ok());
        assert!(sync_rx.try_recv().is_err());
    }
}
