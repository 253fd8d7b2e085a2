//! Scenario playback against a running scheduler.

use std::sync::Arc;
use std::time::Duration;

use shelf_core::{ClassId, LifecycleState, ObjectId};
use shelf_monitor::{
    reschedule_channel, MonitorConfig, MonitorScheduler, Scenario, ScenarioEvent, SlotChange,
};
use shelf_topology::{
    AttributeStore, ChangeReason, InMemoryAttributeStore, SlotStatus, Topology, TopologySnapshot,
};
use tokio::sync::oneshot;

struct Running {
    topology: Arc<Topology>,
    store: Arc<InMemoryAttributeStore>,
    enclosure: ObjectId,
    stop: oneshot::Sender<()>,
    scheduler: tokio::task::JoinHandle<shelf_monitor::SchedulerStats>,
}

fn config(scenario: Scenario) -> MonitorConfig {
    MonitorConfig {
        slot_poll_interval_ms: 500,
        discovery_poll_interval_ms: 500,
        corrective_retry_ms: 40,
        scenario,
        ..MonitorConfig::default()
    }
}

fn start(config: &MonitorConfig) -> Running {
    let store = Arc::new(InMemoryAttributeStore::new());
    config.scenario.seed(store.as_ref()).unwrap();

    let (hook, requests) = reschedule_channel();
    let topology = Topology::new(
        config.topology_config(),
        Arc::clone(&store) as Arc<dyn AttributeStore>,
        hook,
    )
    .unwrap();

    let (stop, stopped) = oneshot::channel::<()>();
    let scheduler = tokio::spawn(MonitorScheduler::new(Arc::clone(&topology), requests).run(
        async {
            let _ = stopped.await;
        },
    ));

    let port = topology.create_port().unwrap();
    let port_object = topology.require(port).unwrap();
    let enclosure = topology
        .discover_child(&port_object, ClassId::Enclosure, 0)
        .unwrap();

    Running {
        topology,
        store,
        enclosure,
        stop,
        scheduler,
    }
}

async fn eventually(topology: &Topology, check: impl Fn(&TopologySnapshot) -> bool) {
    for _ in 0..300 {
        if check(&topology.snapshot()) {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("topology never reached the expected shape: {:?}", topology.snapshot());
}

fn drive_states(snapshot: &TopologySnapshot) -> Vec<LifecycleState> {
    snapshot
        .objects
        .iter()
        .filter(|o| o.class == ClassId::Drive)
        .map(|o| o.state)
        .collect()
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn pulled_and_reinserted_drive_comes_back() {
    let scenario = Scenario {
        slots: vec![SlotStatus::healthy(); 2],
        events: vec![
            ScenarioEvent {
                at_ms: 20,
                slot: 1,
                change: SlotChange::Remove,
            },
            ScenarioEvent {
                at_ms: 200,
                slot: 1,
                change: SlotChange::Insert,
            },
        ],
    };
    let config = config(scenario);
    let running = start(&config);
    eventually(&running.topology, |s| drive_states(s) == vec![LifecycleState::Ready; 2]).await;

    let played = config
        .scenario
        .play(
            running.store.as_ref(),
            &running.topology,
            running.enclosure,
            Duration::from_secs(1),
        )
        .await
        .unwrap();
    assert_eq!(played, 2);

    eventually(&running.topology, |s| drive_states(s) == vec![LifecycleState::Ready; 2]).await;

    running.stop.send(()).unwrap();
    let stats = running.scheduler.await.unwrap();
    assert_eq!(stats.errors, 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn nonpersistent_bypass_is_undone_by_the_enclosure() {
    let scenario = Scenario {
        slots: vec![SlotStatus::healthy()],
        events: vec![ScenarioEvent {
            at_ms: 10,
            slot: 0,
            change: SlotChange::Bypass {
                reason: ChangeReason::NonPersistent,
            },
        }],
    };
    let config = config(scenario);
    let running = start(&config);
    eventually(&running.topology, |s| drive_states(s) == vec![LifecycleState::Ready]).await;

    config
        .scenario
        .play(
            running.store.as_ref(),
            &running.topology,
            running.enclosure,
            Duration::from_secs(1),
        )
        .await
        .unwrap();

    eventually(&running.topology, |_| {
        let snapshot = running.store.snapshot();
        SlotStatus::read(|key| snapshot.get(key), 0)
            .map(|status| status.phy_disabled.is_none())
            .unwrap_or(false)
    })
    .await;
    eventually(&running.topology, |s| drive_states(s) == vec![LifecycleState::Ready]).await;

    running.stop.send(()).unwrap();
    running.scheduler.await.unwrap();
}

#[tokio::test]
async fn events_past_the_run_time_are_not_played() {
    let scenario = Scenario {
        slots: vec![SlotStatus::healthy()],
        events: vec![ScenarioEvent {
            at_ms: 60_000,
            slot: 0,
            change: SlotChange::Remove,
        }],
    };
    let config = config(scenario);
    let running = start(&config);

    let played = config
        .scenario
        .play(
            running.store.as_ref(),
            &running.topology,
            running.enclosure,
            Duration::from_millis(10),
        )
        .await
        .unwrap();
    assert_eq!(played, 0);

    running.stop.send(()).unwrap();
    running.scheduler.await.unwrap();
}
