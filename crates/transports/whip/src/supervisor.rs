//! Lifecycle supervisor
//!
//! The only component that forces timeout-driven transitions. Each sweep
//! fails sessions that stayed too long in `New`/`Connecting` or
//! `Disconnected` and reaps sessions that reached a terminal state without
//! being removed.

use crate::config::TimeoutPolicy;
use crate::registry::SessionRegistry;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info};

/// Outcome of one sweep
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepReport {
    /// Sessions inspected
    pub inspected: usize,
    /// Sessions forced to `Failed` by a timeout
    pub timed_out: usize,
    /// Terminal sessions reaped
    pub reaped: usize,
}

/// Periodic timeout enforcement over a [`SessionRegistry`]
pub struct LifecycleSupervisor {
    registry: Arc<SessionRegistry>,
    policy: TimeoutPolicy,
}

impl LifecycleSupervisor {
    pub fn new(registry: Arc<SessionRegistry>, policy: TimeoutPolicy) -> Self {
        Self { registry, policy }
    }

    /// Run one sweep against the clock reading `now`
    pub async fn sweep(&self, now: Instant) -> SweepReport {
        let mut report = SweepReport::default();

        for session in self.registry.sessions() {
            report.inspected += 1;
            if let Some(change) = session.expire(now, &self.policy) {
                report.timed_out += 1;
                // Reporting a terminal change removes the session
                self.registry.report(change).await;
            }
        }

        // Sessions whose terminal transition was not followed by a removal
        for id in self.registry.terminal_sessions() {
            if self.registry.remove(&id).await {
                report.reaped += 1;
            }
        }

        if report.timed_out > 0 || report.reaped > 0 {
            info!(
                inspected = report.inspected,
                timed_out = report.timed_out,
                reaped = report.reaped,
                "Lifecycle sweep"
            );
        } else {
            debug!(inspected = report.inspected, "Lifecycle sweep");
        }

        report
    }

    /// Run sweeps every `sweep_interval` until the handle is shut down
    pub fn spawn(self) -> SupervisorHandle {
        let (shutdown_tx, mut shutdown_rx) = mpsc::channel::<()>(1);
        let interval = self.policy.sweep_interval;

        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(Instant::now() + interval, interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            info!(interval_ms = interval.as_millis() as u64, "Lifecycle supervisor started");

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        self.sweep(Instant::now()).await;
                    }
                    _ = shutdown_rx.recv() => {
                        info!("Lifecycle supervisor shutting down");
                        break;
                    }
                }
            }
        });

        SupervisorHandle { shutdown_tx, task }
    }
}

/// Handle to a running supervisor task
pub struct SupervisorHandle {
    shutdown_tx: mpsc::Sender<()>,
    task: JoinHandle<()>,
}

impl SupervisorHandle {
    /// Stop the supervisor and wait for the current sweep to finish
    pub async fn shutdown(self) {
        let _ = self.shutdown_tx.send(()).await;
        let _ = self.task.await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::{ConnectionState, SessionEvent, SessionId};
    use std::time::Duration;

    fn policy() -> TimeoutPolicy {
        TimeoutPolicy {
            connecting_timeout: Duration::from_secs(15),
            disconnected_grace: Duration::from_secs(10),
            sweep_interval: Duration::from_secs(5),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_connecting_timeout() {
        let registry = Arc::new(SessionRegistry::new(8));
        let supervisor = LifecycleSupervisor::new(Arc::clone(&registry), policy());
        let id = SessionId::new();
        let session = registry.admit(id.clone(), vec![]).unwrap();
        session.apply(SessionEvent::GatheringStarted).unwrap();

        tokio::time::advance(Duration::from_secs(14)).await;
        assert_eq!(supervisor.sweep(Instant::now()).await.timed_out, 0);
        assert!(registry.get(&id).is_some());

        tokio::time::advance(Duration::from_secs(1)).await;
        let report = supervisor.sweep(Instant::now()).await;
        assert_eq!(report.timed_out, 1);
        assert_eq!(session.state(), ConnectionState::Failed);
        assert!(registry.get(&id).is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_connected_session_survives_sweeps() {
        let registry = Arc::new(SessionRegistry::new(8));
        let supervisor = LifecycleSupervisor::new(Arc::clone(&registry), policy());
        let session = registry.admit(SessionId::new(), vec![]).unwrap();
        session.apply(SessionEvent::GatheringStarted).unwrap();
        session.apply(SessionEvent::Connected).unwrap();

        tokio::time::advance(Duration::from_secs(120)).await;
        let report = supervisor.sweep(Instant::now()).await;
        assert_eq!(report, SweepReport { inspected: 1, timed_out: 0, reaped: 0 });
        assert_eq!(session.state(), ConnectionState::Connected);
    }

    #[tokio::test]
    async fn test_reaps_terminal_sessions() {
        let registry = Arc::new(SessionRegistry::new(8));
        let supervisor = LifecycleSupervisor::new(Arc::clone(&registry), policy());
        let id = SessionId::new();
        let session = registry.admit(id.clone(), vec![]).unwrap();
        // Transition applied without going through the registry
        session.apply(SessionEvent::TransportFailed("dtls".into())).unwrap();

        let report = supervisor.sweep(Instant::now()).await;
        assert_eq!(report.reaped, 1);
        assert!(registry.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_spawned_supervisor_sweeps_on_interval() {
        let registry = Arc::new(SessionRegistry::new(8));
        let handle = LifecycleSupervisor::new(Arc::clone(&registry), policy()).spawn();
        let id = SessionId::new();
        registry.admit(id.clone(), vec![]).unwrap();

        // 15s timeout is observed by the sweep at 15s
        tokio::time::sleep(Duration::from_secs(16)).await;
        assert!(registry.get(&id).is_none());

        handle.shutdown().await;
    }
}
