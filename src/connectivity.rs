use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use serde::Serialize;
use tokio::sync::{Notify, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Connectivity {
    Online,
    Offline,
}

impl Connectivity {
    pub fn from_reachable(reachable: bool) -> Self {
        if reachable { Connectivity::Online } else { Connectivity::Offline }
    }
}

/// Platform reachability signal, the equivalent of a navigator's `onLine` flag.
pub trait ReachabilityProbe: Send + Sync {
    fn is_reachable(&self) -> bool;
}

/// A probe driven by hand. Useful for hosts that push transport events.
#[derive(Debug, Default)]
pub struct ManualProbe {
    reachable: AtomicBool,
}

impl ManualProbe {
    pub fn new(reachable: bool) -> Self {
        Self { reachable: AtomicBool::new(reachable) }
    }

    pub fn set(&self, reachable: bool) {
        self.reachable.store(reachable, Ordering::SeqCst);
    }
}

impl ReachabilityProbe for ManualProbe {
    fn is_reachable(&self) -> bool {
        self.reachable.load(Ordering::SeqCst)
    }
}

/// Two-state online/offline machine fed by platform events and a periodic poll.
///
/// An `Offline -> Online` transition after an outage raises a reconcile
/// request. Requests are coalesced: any number of them before the consumer
/// wakes count as one.
pub struct ConnectivityMonitor {
    probe: Arc<dyn ReachabilityProbe>,
    state: watch::Sender<Connectivity>,
    was_offline: AtomicBool,
    reconcile: Notify,
}

impl ConnectivityMonitor {
    /// The initial state comes from the probe; nothing is assumed.
    pub fn new(probe: Arc<dyn ReachabilityProbe>) -> Self {
        let initial = Connectivity::from_reachable(probe.is_reachable());
        let (state, _) = watch::channel(initial);
        Self {
            probe,
            state,
            was_offline: AtomicBool::new(initial == Connectivity::Offline),
            reconcile: Notify::new(),
        }
    }

    pub fn current(&self) -> Connectivity {
        *self.state.borrow()
    }

    pub fn is_online(&self) -> bool {
        self.current() == Connectivity::Online
    }

    pub fn subscribe(&self) -> watch::Receiver<Connectivity> {
        self.state.subscribe()
    }

    /// Feed a platform signal (transport up/down). Returns the new state on a transition.
    pub fn report(&self, reachable: bool) -> Option<Connectivity> {
        let next = Connectivity::from_reachable(reachable);
        let changed = self.state.send_if_modified(|current| {
            if *current == next {
                false
            } else {
                *current = next;
                true
            }
        });
        if !changed {
            return None;
        }

        match next {
            Connectivity::Offline => {
                self.was_offline.store(true, Ordering::SeqCst);
                warn!("connectivity lost; changes will be queued");
            }
            Connectivity::Online => {
                if self.was_offline.swap(false, Ordering::SeqCst) {
                    info!("connectivity restored; requesting reconciliation");
                    self.reconcile.notify_one();
                }
            }
        }
        Some(next)
    }

    /// Re-read the probe.
    pub fn poll(&self) -> Option<Connectivity> {
        self.report(self.probe.is_reachable())
    }

    /// Ask for a reconciliation pass regardless of connectivity history.
    pub fn request_reconcile(&self) {
        self.reconcile.notify_one();
    }

    /// Resolves once per coalesced batch of reconcile requests.
    pub async fn reconcile_requested(&self) {
        self.reconcile.notified().await;
    }

    /// Poll the probe on `interval` until `cancel` fires.
    pub fn spawn_poll(
        self: &Arc<Self>,
        interval: Duration,
        cancel: CancellationToken,
    ) -> JoinHandle<()> {
        let monitor = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        monitor.poll();
                    }
                }
            }
            debug!("connectivity poll stopped");
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::time::timeout;

    #[test]
    fn initial_state_comes_from_the_probe() {
        let monitor = ConnectivityMonitor::new(Arc::new(ManualProbe::new(false)));
        assert_eq!(monitor.current(), Connectivity::Offline);
        let monitor = ConnectivityMonitor::new(Arc::new(ManualProbe::new(true)));
        assert!(monitor.is_online());
    }

    #[test]
    fn repeated_signals_are_not_transitions() {
        let monitor = ConnectivityMonitor::new(Arc::new(ManualProbe::new(true)));
        assert_eq!(monitor.report(true), None);
        assert_eq!(monitor.report(false), Some(Connectivity::Offline));
        assert_eq!(monitor.report(false), None);
        assert_eq!(monitor.report(true), Some(Connectivity::Online));
    }

    #[tokio::test]
    async fn reconnect_requests_one_coalesced_reconcile() {
        let monitor = ConnectivityMonitor::new(Arc::new(ManualProbe::new(true)));
        monitor.report(false);
        monitor.report(true);
        monitor.report(false);
        monitor.report(true);

        timeout(Duration::from_millis(50), monitor.reconcile_requested()).await.unwrap();
        assert!(timeout(Duration::from_millis(50), monitor.reconcile_requested()).await.is_err());
    }

    #[tokio::test]
    async fn staying_online_never_requests_reconcile() {
        let monitor = ConnectivityMonitor::new(Arc::new(ManualProbe::new(true)));
        monitor.report(true);
        assert!(timeout(Duration::from_millis(50), monitor.reconcile_requested()).await.is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn poll_picks_up_probe_changes_and_stops_on_cancel() {
        let probe = Arc::new(ManualProbe::new(false));
        let monitor = Arc::new(ConnectivityMonitor::new(probe.clone()));
        let cancel = CancellationToken::new();
        let handle = monitor.spawn_poll(Duration::from_secs(5), cancel.clone());
        let mut rx = monitor.subscribe();

        probe.set(true);
        timeout(Duration::from_secs(6), rx.changed()).await.unwrap().unwrap();
        assert_eq!(*rx.borrow(), Connectivity::Online);
        timeout(Duration::from_secs(1), monitor.reconcile_requested()).await.unwrap();

        cancel.cancel();
        handle.await.unwrap();
        probe.set(false);
        tokio::time::sleep(Duration::from_secs(10)).await;
        assert!(monitor.is_online());
    }
}
