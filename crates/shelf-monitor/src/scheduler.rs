//! Drives lifecycle passes on a tokio runtime.
//!
//! Objects ask for a pass through the reschedule hook, which feeds an
//! unbounded channel. The scheduler keeps one deadline per object and runs
//! due passes on the blocking pool, never two for the same object at once.
//! A request that arrives while an object's pass is running is kept and
//! honoured once that pass ends.
//!
//! ```text
//!   hook(id, delay) ──▶ requests ──▶ deadlines ──▶ spawn_blocking(crank)
//!                                        ▲                  │
//!                                        └──── finished ◀───┘
//!                              (RESCHEDULE delay or next timer deadline)
//! ```

use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use shelf_core::ObjectId;
use shelf_lifecycle::{LifecycleStatus, RescheduleHook};
use shelf_topology::{Topology, TopologyError};
use tokio::sync::mpsc;
use tokio::time::Instant;

/// A request for a pass of one object after a delay.
pub type RescheduleRequest = (ObjectId, Duration);

/// Build a reschedule hook and the receiver that collects its requests.
#[must_use]
pub fn reschedule_channel() -> (RescheduleHook, mpsc::UnboundedReceiver<RescheduleRequest>) {
    let (tx, rx) = mpsc::unbounded_channel();
    let hook: RescheduleHook = Arc::new(move |id, delay| {
        // The receiver is gone once the scheduler stopped.
        let _ = tx.send((id, delay));
    });
    (hook, rx)
}

/// What the scheduler did before it stopped.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SchedulerStats {
    /// Passes run.
    pub cranks: u64,
    /// Passes that returned an error.
    pub errors: u64,
}

type Finished = (ObjectId, Result<LifecycleStatus, TopologyError>);

/// Runs lifecycle passes for every object of a topology.
pub struct MonitorScheduler {
    topology: Arc<Topology>,
    requests: mpsc::UnboundedReceiver<RescheduleRequest>,
    finished_tx: mpsc::UnboundedSender<Finished>,
    finished_rx: mpsc::UnboundedReceiver<Finished>,
    deadlines: HashMap<ObjectId, Instant>,
    running: HashSet<ObjectId>,
    stats: SchedulerStats,
}

impl MonitorScheduler {
    /// Create a scheduler for `topology` fed by `requests`.
    #[must_use]
    pub fn new(
        topology: Arc<Topology>,
        requests: mpsc::UnboundedReceiver<RescheduleRequest>,
    ) -> Self {
        let (finished_tx, finished_rx) = mpsc::unbounded_channel();
        Self {
            topology,
            requests,
            finished_tx,
            finished_rx,
            deadlines: HashMap::new(),
            running: HashSet::new(),
            stats: SchedulerStats::default(),
        }
    }

    /// Run until `shutdown` resolves.
    ///
    /// Passes still running at shutdown finish on the blocking pool; their
    /// results are dropped.
    pub async fn run(mut self, shutdown: impl Future<Output = ()>) -> SchedulerStats {
        tokio::pin!(shutdown);
        tracing::info!("monitor scheduler started");

        loop {
            let wake = self.next_wake();
            tokio::select! {
                () = &mut shutdown => break,
                Some((id, delay)) = self.requests.recv() => {
                    self.request(id, Instant::now() + delay);
                }
                Some((id, result)) = self.finished_rx.recv() => {
                    self.finished(id, result);
                }
                () = sleep_until(wake), if wake.is_some() => self.dispatch_due(),
            }
        }

        tracing::info!(
            cranks = self.stats.cranks,
            errors = self.stats.errors,
            running = self.running.len(),
            "monitor scheduler stopped"
        );
        self.stats
    }

    /// Earliest deadline of an object that is not running.
    fn next_wake(&self) -> Option<Instant> {
        self.deadlines
            .iter()
            .filter(|(id, _)| !self.running.contains(id))
            .map(|(_, at)| *at)
            .min()
    }

    fn request(&mut self, id: ObjectId, at: Instant) {
        self.deadlines
            .entry(id)
            .and_modify(|current| *current = (*current).min(at))
            .or_insert(at);
    }

    fn dispatch_due(&mut self) {
        let now = Instant::now();
        let due: Vec<ObjectId> = self
            .deadlines
            .iter()
            .filter(|(id, at)| **at <= now && !self.running.contains(id))
            .map(|(id, _)| *id)
            .collect();

        for id in due {
            self.deadlines.remove(&id);
            self.running.insert(id);
            let topology = Arc::clone(&self.topology);
            let finished = self.finished_tx.clone();
            tokio::task::spawn_blocking(move || {
                let result = topology.crank(id);
                let _ = finished.send((id, result));
            });
        }
    }

    fn finished(&mut self, id: ObjectId, result: Result<LifecycleStatus, TopologyError>) {
        self.running.remove(&id);
        self.stats.cranks += 1;

        match result {
            Ok(LifecycleStatus::Reschedule(delay)) => self.request(id, Instant::now() + delay),
            Ok(LifecycleStatus::Done | LifecycleStatus::Pending) => {}
            Err(TopologyError::ObjectNotFound(_)) => {
                self.deadlines.remove(&id);
                return;
            }
            Err(e) => {
                self.stats.errors += 1;
                tracing::warn!(object_id = %id, error = %e, "lifecycle pass failed");
            }
        }

        match self.topology.next_deadline(id) {
            Some(deadline) => self.request(id, Instant::from_std(deadline)),
            None if self.topology.object(id).is_none() => {
                self.deadlines.remove(&id);
            }
            None => {}
        }
    }
}

impl std::fmt::Debug for MonitorScheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MonitorScheduler")
            .field("deadlines", &self.deadlines.len())
            .field("running", &self.running.len())
            .field("stats", &self.stats)
            .finish_non_exhaustive()
    }
}

async fn sleep_until(wake: Option<Instant>) {
    if let Some(at) = wake {
        tokio::time::sleep_until(at).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use shelf_core::{ClassId, LifecycleState};
    use shelf_topology::{
        AttributeStore, InMemoryAttributeStore, SlotStatus, TopologyConfig,
    };
    use tokio::sync::oneshot;

    use crate::scenario::Scenario;

    fn config() -> TopologyConfig {
        TopologyConfig {
            slot_poll_interval: Duration::from_millis(20),
            discovery_poll_interval: Duration::from_millis(50),
            corrective_retry: Duration::from_millis(50),
            ..TopologyConfig::default()
        }
    }

    fn setup(slots: Vec<SlotStatus>) -> (Arc<Topology>, Arc<InMemoryAttributeStore>, MonitorScheduler) {
        let store = Arc::new(InMemoryAttributeStore::new());
        Scenario {
            slots,
            events: Vec::new(),
        }
        .seed(store.as_ref())
        .unwrap();
        let (hook, requests) = reschedule_channel();
        let topology =
            Topology::new(config(), Arc::clone(&store) as Arc<dyn AttributeStore>, hook).unwrap();
        let scheduler = MonitorScheduler::new(Arc::clone(&topology), requests);
        (topology, store, scheduler)
    }

    async fn wait_for(topology: &Topology, check: impl Fn(&Topology) -> bool) -> bool {
        for _ in 0..200 {
            if check(topology) {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        false
    }

    fn all_ready(topology: &Topology, objects: usize) -> bool {
        let snapshot = topology.snapshot();
        snapshot.objects.len() == objects
            && snapshot
                .objects
                .iter()
                .all(|o| o.state == LifecycleState::Ready)
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn shelf_comes_up_under_the_scheduler() {
        let (topology, _store, scheduler) = setup(vec![SlotStatus::healthy(); 3]);
        let (stop, stopped) = oneshot::channel::<()>();
        let task = tokio::spawn(scheduler.run(async {
            let _ = stopped.await;
        }));

        let port = topology.create_port().unwrap();
        let port_object = topology.require(port).unwrap();
        topology
            .discover_child(&port_object, ClassId::Enclosure, 0)
            .unwrap();

        assert!(wait_for(&topology, |t| all_ready(t, 5)).await);

        stop.send(()).unwrap();
        let stats = task.await.unwrap();
        assert!(stats.cranks >= 5);
        assert_eq!(stats.errors, 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn slot_poll_timer_picks_up_removal() {
        let (topology, store, scheduler) = setup(vec![SlotStatus::healthy(); 2]);
        let (stop, stopped) = oneshot::channel::<()>();
        let task = tokio::spawn(scheduler.run(async {
            let _ = stopped.await;
        }));

        let port = topology.create_port().unwrap();
        let port_object = topology.require(port).unwrap();
        topology
            .discover_child(&port_object, ClassId::Enclosure, 0)
            .unwrap();
        assert!(wait_for(&topology, |t| all_ready(t, 4)).await);

        // Only the store changes; the enclosure's poll timer notices.
        for (key, value) in SlotStatus::empty().entries(1) {
            store.set(key, value).unwrap();
        }
        store.commit();
        assert!(wait_for(&topology, |t| all_ready(t, 3)).await);

        stop.send(()).unwrap();
        task.await.unwrap();
    }

    #[tokio::test]
    async fn shutdown_with_nothing_to_do() {
        let (_topology, _store, scheduler) = setup(Vec::new());
        let stats = scheduler.run(async {}).await;
        assert_eq!(stats, SchedulerStats::default());
    }
}
