//! Scheduler module for scanning targets on a fixed interval.
//!
//! Each cycle takes a snapshot of all targets, runs guard + probe + insert
//! for every one of them, then sleeps. Targets are independent: a blocked
//! target, a failed probe or a failed insert never stops the rest of the
//! cycle, and no error short of a shutdown request stops the loop.

use crate::db::{CheckResult, CheckStore, DbError, TargetRef, TargetStore};
use crate::probe::{Guard, Prober, Verdict};

use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Semaphore};
use tokio::task::JoinHandle;

/// Scheduler tuning.
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Sleep between the end of one cycle and the start of the next.
    pub interval: Duration,
    /// Probes allowed in flight at once within a cycle.
    pub max_concurrent_probes: usize,
}

/// Tally of one completed cycle.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct CycleReport {
    pub targets: usize,
    pub reachable: usize,
    pub unreachable: usize,
    pub blocked: usize,
    pub write_failures: usize,
}

/// The long-running check scheduler.
pub struct Scheduler {
    targets: Arc<dyn TargetStore>,
    checks: Arc<dyn CheckStore>,
    guard: Arc<Guard>,
    prober: Arc<Prober>,
    config: SchedulerConfig,
    stop: watch::Sender<bool>,
}

impl Scheduler {
    pub fn new(
        targets: Arc<dyn TargetStore>,
        checks: Arc<dyn CheckStore>,
        guard: Guard,
        prober: Prober,
        config: SchedulerConfig,
    ) -> Self {
        let (stop, _) = watch::channel(false);
        Self {
            targets,
            checks,
            guard: Arc::new(guard),
            prober: Arc::new(prober),
            config,
            stop,
        }
    }

    /// Run cycles until `shutdown` is called.
    pub async fn run(&self) {
        let mut stop_rx = self.stop.subscribe();

        tracing::info!(
            "Scheduler: starting (interval={:?}, concurrency={})",
            self.config.interval,
            self.config.max_concurrent_probes
        );

        loop {
            if *stop_rx.borrow() {
                break;
            }

            tokio::select! {
                _ = stopped(&mut stop_rx) => break,
                result = self.run_cycle() => match result {
                    Ok(report) => tracing::info!(
                        "Scheduler: cycle done: {} targets, {} up, {} down, {} blocked, {} write failures",
                        report.targets,
                        report.reachable,
                        report.unreachable,
                        report.blocked,
                        report.write_failures
                    ),
                    Err(e) => tracing::error!("Scheduler: cycle skipped, failed to list targets: {}", e),
                },
            }

            tokio::select! {
                _ = stopped(&mut stop_rx) => break,
                _ = tokio::time::sleep(self.config.interval) => {}
            }
        }

        tracing::info!("Scheduler: stopped");
    }

    /// Ask `run` to return. Probes already in flight finish on their own timeout.
    ///
    /// The request sticks: a `run` that starts afterwards returns at once.
    pub fn shutdown(&self) {
        self.stop.send_replace(true);
    }

    /// Run one full pass over all targets.
    ///
    /// Fails only when the target snapshot cannot be taken. Every target in
    /// the snapshot gets exactly one insert attempt.
    pub async fn run_cycle(&self) -> Result<CycleReport, DbError> {
        let targets = self.targets.list_targets()?;

        let mut report = CycleReport {
            targets: targets.len(),
            ..Default::default()
        };
        if targets.is_empty() {
            tracing::debug!("Scheduler: no targets to check");
            return Ok(report);
        }

        let semaphore = Arc::new(Semaphore::new(self.config.max_concurrent_probes));
        let mut pending: Vec<(i64, JoinHandle<(CheckResult, bool)>)> = Vec::with_capacity(targets.len());

        for target in targets {
            let id = target.id;
            let guard = self.guard.clone();
            let prober = self.prober.clone();
            let semaphore = semaphore.clone();

            let handle = tokio::spawn(async move {
                // The semaphore is never closed.
                let _permit = semaphore.acquire_owned().await.ok();
                check_target(&guard, &prober, target).await
            });
            pending.push((id, handle));
        }

        for (target_id, handle) in pending {
            let (check, blocked) = match handle.await {
                Ok(done) => done,
                Err(e) => {
                    tracing::error!("Target {}: check task failed: {}", target_id, e);
                    let check =
                        CheckResult::failed(target_id, Utc::now(), format!("check task failed: {}", e));
                    (check, false)
                }
            };

            if blocked {
                report.blocked += 1;
            } else if check.reachable {
                report.reachable += 1;
            } else {
                report.unreachable += 1;
            }

            if let Err(e) = self.checks.insert_check(&check) {
                report.write_failures += 1;
                tracing::error!("Target {}: failed to record check: {}", target_id, e);
            }
        }

        Ok(report)
    }
}

/// Resolve once shutdown has been requested.
async fn stopped(rx: &mut watch::Receiver<bool>) {
    // The sender lives in the scheduler, so this only errors after it is gone.
    let _ = rx.wait_for(|stop| *stop).await;
}

/// Guard, then probe, one target. The flag is true when the guard refused it.
async fn check_target(guard: &Guard, prober: &Prober, target: TargetRef) -> (CheckResult, bool) {
    match guard.evaluate(&target.url).await {
        Verdict::Blocked(reason) => {
            tracing::info!("Target {} blocked (SSRF): {}", target.id, reason);
            (CheckResult::blocked(target.id, reason.to_string()), true)
        }
        Verdict::Allowed => {
            let check = CheckResult::from_probe(target.id, prober.probe(&target.url).await);
            tracing::info!(
                "Target {}: status={:?} latency={:?}ms up={} {}",
                target.id,
                check.status_code,
                check.latency_ms,
                check.reachable,
                check.error.as_deref().unwrap_or("")
            );
            (check, false)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Store;
    use crate::probe::{ProbeSettings, Resolve};
    use async_trait::async_trait;
    use std::net::{IpAddr, SocketAddr};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;
    use tempfile::NamedTempFile;

    /// Resolves every name to a documentation address outside the blocked ranges.
    struct PublicResolver;

    #[async_trait]
    impl Resolve for PublicResolver {
        async fn resolve(&self, _host: &str) -> std::io::Result<Vec<IpAddr>> {
            Ok(vec!["192.0.2.10".parse().unwrap()])
        }
    }

    struct FixedTargets(Vec<TargetRef>);

    impl TargetStore for FixedTargets {
        fn list_targets(&self) -> Result<Vec<TargetRef>, DbError> {
            Ok(self.0.clone())
        }
    }

    #[derive(Default)]
    struct BrokenTargets {
        calls: AtomicUsize,
    }

    impl TargetStore for BrokenTargets {
        fn list_targets(&self) -> Result<Vec<TargetRef>, DbError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Err(DbError::Poisoned)
        }
    }

    /// Records checks, refusing those for one target.
    struct FlakyChecks {
        reject: i64,
        attempts: AtomicUsize,
        stored: Mutex<Vec<CheckResult>>,
    }

    impl CheckStore for FlakyChecks {
        fn insert_check(&self, check: &CheckResult) -> Result<i64, DbError> {
            self.attempts.fetch_add(1, Ordering::SeqCst);
            if check.target_id == self.reject {
                return Err(DbError::NotFound);
            }
            let mut stored = self.stored.lock().unwrap();
            stored.push(check.clone());
            Ok(stored.len() as i64)
        }
    }

    fn target(id: i64, url: &str) -> TargetRef {
        TargetRef {
            id,
            url: url.to_string(),
        }
    }

    fn settings() -> ProbeSettings {
        ProbeSettings {
            timeout: Duration::from_secs(1),
            verify_tls: true,
        }
    }

    fn scheduler(
        targets: Arc<dyn TargetStore>,
        checks: Arc<dyn CheckStore>,
        interval: Duration,
    ) -> Scheduler {
        scheduler_with(targets, checks, interval, Prober::new(settings()).unwrap())
    }

    fn scheduler_with(
        targets: Arc<dyn TargetStore>,
        checks: Arc<dyn CheckStore>,
        interval: Duration,
        prober: Prober,
    ) -> Scheduler {
        Scheduler::new(
            targets,
            checks,
            Guard::with_resolver(Arc::new(PublicResolver)),
            prober,
            SchedulerConfig {
                interval,
                max_concurrent_probes: 2,
            },
        )
    }

    /// Local HTTP server answering 200 on `/`.
    async fn up_server() -> SocketAddr {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let router = axum::Router::new().route("/", axum::routing::get(|| async { "ok" }));
        tokio::spawn(async move {
            axum::serve(listener, router).await.unwrap();
        });
        addr
    }

    #[tokio::test]
    async fn test_cycle_records_one_check_per_target() {
        let tmp = NamedTempFile::new().unwrap();
        let store = Arc::new(Store::new(tmp.path()).unwrap());

        // The guard sees a public address for status.test; the prober dials
        // the local server instead.
        let addr = up_server().await;
        let prober = Prober::with_resolved_host(settings(), "status.test", addr).unwrap();
        let up_url = format!("http://status.test:{}/", addr.port());

        let urls = [
            up_url.as_str(),
            "http://169.254.169.254/",
            "http://localhost:8080/",
            "not a url",
            "http://10.0.0.1/admin",
            // Passes the guard, then fails to resolve when probed.
            "http://nowhere.invalid:9/",
        ];
        let mut up_id = 0;
        for url in urls {
            let t = store.add_target(url, None).unwrap();
            if url == up_url {
                up_id = t.id;
            }
        }

        let scheduler = scheduler_with(store.clone(), store.clone(), Duration::from_secs(300), prober);

        let report = scheduler.run_cycle().await.unwrap();
        assert_eq!(report.targets, urls.len());
        assert_eq!(report.reachable, 1);
        assert_eq!(report.blocked, 4);
        assert_eq!(report.unreachable, 1);
        assert_eq!(report.write_failures, 0);
        assert_eq!(store.count_checks().unwrap(), urls.len() as i64);

        scheduler.run_cycle().await.unwrap();
        assert_eq!(store.count_checks().unwrap(), 2 * urls.len() as i64);

        let statuses = store.latest_statuses().unwrap();
        assert_eq!(statuses.len(), urls.len());
        for status in statuses {
            assert!(status.checked_at.is_some());
            if status.id == up_id {
                assert!(status.reachable);
                assert_eq!(status.status_code, Some(200));
                assert!(status.latency_ms.unwrap() > 0);
                assert!(status.error.is_none());
            } else {
                assert!(!status.reachable);
                assert!(status.status_code.is_none());
                assert!(status.latency_ms.is_none());
                assert!(status.error.is_some());
            }
        }
    }

    #[tokio::test]
    async fn test_metadata_target_blocked_with_reason() {
        let tmp = NamedTempFile::new().unwrap();
        let store = Arc::new(Store::new(tmp.path()).unwrap());
        let t = store.add_target("http://169.254.169.254/", None).unwrap();

        scheduler(store.clone(), store.clone(), Duration::from_secs(300))
            .run_cycle()
            .await
            .unwrap();

        let checks = store.recent_checks(t.id, 10).unwrap();
        assert_eq!(checks.len(), 1);
        assert!(checks[0].error.as_deref().unwrap().contains("169.254.169.254"));
    }

    #[tokio::test]
    async fn test_insert_failure_does_not_stop_cycle() {
        let targets = Arc::new(FixedTargets(vec![
            target(1, "http://127.0.0.1/"),
            target(2, "http://192.168.0.1/"),
            target(3, "http://10.1.1.1/"),
        ]));
        let checks = Arc::new(FlakyChecks {
            reject: 2,
            attempts: AtomicUsize::new(0),
            stored: Mutex::new(Vec::new()),
        });

        let report = scheduler(targets, checks.clone(), Duration::from_secs(300))
            .run_cycle()
            .await
            .unwrap();

        assert_eq!(report.write_failures, 1);
        assert_eq!(checks.attempts.load(Ordering::SeqCst), 3);

        let mut stored: Vec<i64> = checks.stored.lock().unwrap().iter().map(|c| c.target_id).collect();
        stored.sort();
        assert_eq!(stored, vec![1, 3]);
    }

    #[tokio::test]
    async fn test_empty_snapshot_writes_nothing() {
        let checks = Arc::new(FlakyChecks {
            reject: 0,
            attempts: AtomicUsize::new(0),
            stored: Mutex::new(Vec::new()),
        });

        let report = scheduler(Arc::new(FixedTargets(Vec::new())), checks.clone(), Duration::from_secs(300))
            .run_cycle()
            .await
            .unwrap();

        assert_eq!(report, CycleReport::default());
        assert_eq!(checks.attempts.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_snapshot_failure_keeps_loop_alive() {
        let targets = Arc::new(BrokenTargets::default());
        let checks = Arc::new(FlakyChecks {
            reject: 0,
            attempts: AtomicUsize::new(0),
            stored: Mutex::new(Vec::new()),
        });
        let scheduler = Arc::new(scheduler(targets.clone(), checks, Duration::from_millis(10)));

        assert!(scheduler.run_cycle().await.is_err());

        let runner = scheduler.clone();
        let handle = tokio::spawn(async move { runner.run().await });

        tokio::time::sleep(Duration::from_millis(100)).await;
        scheduler.shutdown();
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .expect("scheduler did not stop")
            .unwrap();

        // One direct call plus several loop cycles.
        assert!(targets.calls.load(Ordering::SeqCst) >= 3);
    }

    #[tokio::test]
    async fn test_shutdown_before_run_returns() {
        let checks = Arc::new(FlakyChecks {
            reject: 0,
            attempts: AtomicUsize::new(0),
            stored: Mutex::new(Vec::new()),
        });
        let scheduler = scheduler(
            Arc::new(FixedTargets(vec![target(1, "http://10.0.0.1/")])),
            checks.clone(),
            Duration::from_secs(3600),
        );

        scheduler.shutdown();
        assert!(tokio::time::timeout(Duration::from_secs(1), scheduler.run()).await.is_ok());
        // Stopped before the first cycle.
        assert_eq!(checks.attempts.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_shutdown_interrupts_sleep() {
        let scheduler = Arc::new(scheduler(
            Arc::new(FixedTargets(Vec::new())),
            Arc::new(FlakyChecks {
                reject: 0,
                attempts: AtomicUsize::new(0),
                stored: Mutex::new(Vec::new()),
            }),
            Duration::from_secs(3600),
        ));

        let runner = scheduler.clone();
        let handle = tokio::spawn(async move { runner.run().await });

        tokio::time::sleep(Duration::from_millis(50)).await;
        scheduler.shutdown();
        assert!(tokio::time::timeout(Duration::from_secs(1), handle).await.is_ok());
    }
}
