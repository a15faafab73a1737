use super::*;
use crate::backend::memory::MemoryBackend;
use crate::reducer::{ClientRegistry, MergeReducer};
use crate::snapshot::StoreState;
use serde_json::json;
use tokio::time::timeout;

const TTL: Duration = Duration::from_millis(1000);

async fn replica(backend: &MemoryBackend) -> ReplicatedQueue {
    replica_with_ttl(backend, TTL).await
}

async fn replica_with_ttl(backend: &MemoryBackend, ttl: Duration) -> ReplicatedQueue {
    ReplicatedQueue::connect(Backends::single(backend.clone()), Namespace::new("s"), ttl)
        .await
        .expect("connect")
}

/// Publish an entry as if another replica had drained it.
async fn publish_foreign(backend: &MemoryBackend, version: u64, action: Action) {
    let channel = BroadcastChannel::new(Arc::new(backend.clone()), Namespace::new("s"));
    let entry = Replicated { origin: Uuid::new_v4(), version, item: QueueItem::new(None, action) };
    channel.publish(ACTION_CHANNEL, &entry).await.unwrap();
}

async fn wait_for_buffered(queue: &ReplicatedQueue, len: usize) {
    timeout(Duration::from_secs(1), async {
        while lock_state(&queue.state).buffer.len() < len {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("broadcast should reach the buffer");
}

async fn persist(backend: &MemoryBackend, snapshot: &Snapshot) {
    backend
        .set("s:present", &serde_json::to_string(snapshot).unwrap())
        .await
        .unwrap();
}

fn reducer() -> ClientRegistry<MergeReducer> {
    ClientRegistry::new(MergeReducer::default())
}

fn ping(n: u32) -> Action {
    Action::new("PING", json!(n))
}

/// Poll `get_next` until an item shows up.
async fn next_within(queue: &ReplicatedQueue) -> QueueItem {
    timeout(Duration::from_secs(1), async {
        loop {
            if let Some(item) = queue.get_next().await.expect("get_next") {
                return item;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("item should arrive")
}

/// Leader `q1` and follower `q2`, both initialized.
async fn leader_and_follower(backend: &MemoryBackend) -> (ReplicatedQueue, ReplicatedQueue) {
    let q1 = replica(backend).await;
    let q2 = replica(backend).await;
    q1.init(&reducer()).await.unwrap();
    q2.init(&reducer()).await.unwrap();
    assert!(q1.is_leader());
    assert!(!q2.is_leader());
    (q1, q2)
}

#[tokio::test]
async fn init_from_scratch_persists_version_zero() {
    let backend = MemoryBackend::new();
    let q = replica(&backend).await;
    q.init(&reducer()).await.unwrap();

    assert_eq!(backend.write_count("s:present"), 1);
    let loaded = q.load_snapshot().await.unwrap();
    assert_eq!(loaded.version, 0);
    assert_eq!(loaded.state, reducer().initial_state());
}

#[tokio::test]
async fn init_adopts_persisted_snapshot_and_notifies_reducer() {
    struct Recording {
        restored: std::sync::Mutex<Vec<Action>>,
    }
    impl Reducer for Recording {
        fn initial_state(&self) -> StoreState {
            StoreState::default()
        }
        fn reduce(&self, state: &StoreState, _action: &Action) -> StoreState {
            state.clone()
        }
        fn restore(&self, action: &Action) {
            self.restored.lock().unwrap().push(action.clone());
        }
    }

    let backend = MemoryBackend::new();
    let persisted = Snapshot { version: 12, state: StoreState::new(json!({"title": "kept"})) };
    backend
        .set("s:present", &serde_json::to_string(&persisted).unwrap())
        .await
        .unwrap();

    let q = replica(&backend).await;
    let recording = Recording { restored: std::sync::Mutex::new(Vec::new()) };
    q.init(&recording).await.unwrap();

    assert_eq!(q.load_snapshot().await.unwrap(), persisted);
    let restored = recording.restored.lock().unwrap();
    assert_eq!(restored.len(), 1);
    assert_eq!(restored[0].kind, crate::action::PRESENT);
    assert_eq!(restored[0].payload["version"], json!(12));
    assert_eq!(backend.write_count("s:present"), 1, "adopting does not rewrite");
}

#[tokio::test]
async fn init_fails_when_store_fails() {
    let backend = MemoryBackend::new();
    let q = replica(&backend).await;
    backend.set_failing(true);
    assert!(matches!(q.init(&reducer()).await, Err(QueueError::Store(_))));
}

#[tokio::test]
async fn any_replica_enqueues_only_leader_drains() {
    let backend = MemoryBackend::new();
    let (q1, q2) = leader_and_follower(&backend).await;

    q2.enqueue(Some("c1".into()), ping(1)).await.unwrap();
    assert_eq!(backend.list_len("s:queue"), 1);

    assert!(q2.get_next().await.unwrap().is_none(), "follower never pops the log");
    assert_eq!(backend.list_len("s:queue"), 1);

    let item = q1.get_next().await.unwrap().expect("leader pops");
    assert_eq!(item.action, ping(1));
    assert_eq!(item.target_client.as_deref(), Some("c1"));
    assert_eq!(backend.list_len("s:queue"), 0);
}

#[tokio::test]
async fn follower_replays_leader_order_and_leader_ignores_echo() {
    let backend = MemoryBackend::new();
    let (q1, q2) = leader_and_follower(&backend).await;

    for n in 1..=3 {
        q2.enqueue(None, ping(n)).await.unwrap();
    }

    let mut leader_seen = Vec::new();
    for _ in 0..3 {
        let item = q1.get_next().await.unwrap().expect("leader item");
        let snapshot = q1.load_snapshot().await.unwrap();
        q1.save_snapshot(&snapshot.advance(snapshot.state.clone())).await.unwrap();
        leader_seen.push(item.action);
    }
    assert!(q1.get_next().await.unwrap().is_none(), "own echo is not buffered");

    let mut follower_seen = Vec::new();
    for _ in 0..3 {
        let item = next_within(&q2).await;
        let snapshot = q1.load_snapshot().await.unwrap();
        q2.save_snapshot(&Snapshot { version: follower_seen.len() as u64 + 1, state: snapshot.state })
            .await
            .unwrap();
        follower_seen.push(item.action);
    }
    assert_eq!(leader_seen, follower_seen);
}

#[tokio::test]
async fn follower_never_persists_snapshot() {
    let backend = MemoryBackend::new();
    let (_q1, q2) = leader_and_follower(&backend).await;
    let writes = backend.write_count("s:present");

    let local = Snapshot { version: 1, state: StoreState::new(json!({"local": true})) };
    q2.save_snapshot(&local).await.unwrap();

    assert_eq!(backend.write_count("s:present"), writes);
    let persisted: Snapshot = serde_json::from_str(&backend.get("s:present").await.unwrap().unwrap()).unwrap();
    assert_eq!(persisted.version, 0);
}

#[tokio::test]
async fn leader_save_then_load_round_trips() {
    let backend = MemoryBackend::new();
    let (q1, _q2) = leader_and_follower(&backend).await;

    let saved = Snapshot { version: 1, state: StoreState::new(json!({"n": 1})) };
    q1.save_snapshot(&saved).await.unwrap();
    assert_eq!(q1.load_snapshot().await.unwrap(), saved);
}

#[tokio::test]
async fn load_without_any_snapshot_is_an_error() {
    let backend = MemoryBackend::new();
    let q = replica(&backend).await;
    assert!(matches!(q.load_snapshot().await, Err(QueueError::NoSnapshot)));
}

#[tokio::test]
async fn stale_and_duplicate_broadcasts_are_skipped() {
    let backend = MemoryBackend::new();
    let (_q1, q2) = leader_and_follower(&backend).await;
    q2.save_snapshot(&Snapshot { version: 5, state: StoreState::default() })
        .await
        .unwrap();

    let channel = BroadcastChannel::new(Arc::new(backend.clone()), Namespace::new("s"));
    let foreign = Uuid::new_v4();
    for (version, n) in [(4, 0), (5, 0), (6, 6), (6, 6)] {
        let entry = Replicated { origin: foreign, version, item: QueueItem::new(None, ping(n)) };
        channel.publish(ACTION_CHANNEL, &entry).await.unwrap();
    }

    let item = next_within(&q2).await;
    assert_eq!(item.action, ping(6));
    q2.save_snapshot(&Snapshot { version: 6, state: StoreState::default() })
        .await
        .unwrap();
    assert!(q2.get_next().await.unwrap().is_none(), "duplicate of version 6 is dropped");
}

#[tokio::test]
async fn new_leader_drains_buffer_before_log() {
    let backend = MemoryBackend::new();
    let (q1, q2) = leader_and_follower(&backend).await;

    q1.enqueue(None, ping(1)).await.unwrap();
    q1.enqueue(None, ping(2)).await.unwrap();
    assert_eq!(q1.get_next().await.unwrap().map(|i| i.action), Some(ping(1)));

    // Wait for the broadcast to land in the follower buffer.
    timeout(Duration::from_secs(1), async {
        while lock_state(&q2.state).buffer.is_empty() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("broadcast should reach follower");

    q1.lease().release().await;

    let first = q2.get_next().await.unwrap().expect("buffered item");
    assert!(q2.is_leader());
    assert_eq!(first.action, ping(1));
    q2.save_snapshot(&Snapshot { version: 1, state: StoreState::default() })
        .await
        .unwrap();

    let second = q2.get_next().await.unwrap().expect("durable item");
    assert_eq!(second.action, ping(2));
}

#[tokio::test]
async fn enqueue_signals_notifier() {
    let backend = MemoryBackend::new();
    let q = replica(&backend).await;
    let notify = q.notifier();
    q.enqueue(None, ping(1)).await.unwrap();
    timeout(Duration::from_millis(100), notify.notified())
        .await
        .expect("enqueue should wake the dispatcher");
}

#[tokio::test]
async fn enqueue_failure_is_reported() {
    let backend = MemoryBackend::new();
    let q = replica(&backend).await;
    backend.set_failing(true);
    assert!(q.enqueue(None, ping(1)).await.is_err());
}

#[tokio::test]
async fn clean_drops_log_snapshot_and_lease() {
    let backend = MemoryBackend::new();
    let (q1, _q2) = leader_and_follower(&backend).await;
    q1.enqueue(None, ping(1)).await.unwrap();

    q1.clean().await.unwrap();
    assert_eq!(backend.list_len("s:queue"), 0);
    assert!(backend.get("s:present").await.unwrap().is_none());
    assert!(!q1.is_leader());
}

#[tokio::test]
async fn gapped_broadcast_is_held_until_resync() {
    let backend = MemoryBackend::new();
    let (_q1, q2) = leader_and_follower(&backend).await;

    publish_foreign(&backend, 2, ping(7)).await;
    wait_for_buffered(&q2, 1).await;

    assert!(q2.get_next().await.unwrap().is_none(), "version 2 must not follow version 0");
    assert!(q2.resync().await.unwrap().is_none(), "persisted snapshot does not cover the gap yet");
    assert!(q2.get_next().await.unwrap().is_none());

    let persisted = Snapshot { version: 1, state: StoreState::new(json!({"n": 6})) };
    persist(&backend, &persisted).await;

    assert_eq!(q2.resync().await.unwrap(), Some(persisted.clone()));
    assert_eq!(q2.load_snapshot().await.unwrap(), persisted);
    let item = q2.get_next().await.unwrap().expect("gap closed");
    assert_eq!(item.action, ping(7));
    assert!(q2.resync().await.unwrap().is_none(), "nothing left to resync");
}

#[tokio::test]
async fn resync_drops_items_the_persisted_snapshot_covers() {
    let backend = MemoryBackend::new();
    let (_q1, q2) = leader_and_follower(&backend).await;

    for (version, n) in [(3, 3), (4, 4), (5, 5)] {
        publish_foreign(&backend, version, ping(n)).await;
    }
    wait_for_buffered(&q2, 3).await;
    persist(&backend, &Snapshot { version: 4, state: StoreState::default() }).await;

    let adopted = q2.resync().await.unwrap().expect("newer snapshot");
    assert_eq!(adopted.version, 4);
    assert_eq!(next_within(&q2).await.action, ping(5));
    assert!(q2.get_next().await.unwrap().is_none());
}

#[tokio::test]
async fn leader_with_gapped_buffer_does_not_pop_the_log() {
    let backend = MemoryBackend::new();
    let (q1, _q2) = leader_and_follower(&backend).await;
    q1.enqueue(None, ping(1)).await.unwrap();

    publish_foreign(&backend, 3, ping(3)).await;
    wait_for_buffered(&q1, 1).await;

    assert!(q1.get_next().await.unwrap().is_none());
    assert_eq!(backend.list_len("s:queue"), 1, "stamping now would reuse a version");
}

#[tokio::test]
async fn deposed_leader_stops_draining_after_its_deadline() {
    let backend = MemoryBackend::new();
    let ttl = Duration::from_millis(60);
    let q1 = replica_with_ttl(&backend, ttl).await;
    let q2 = replica_with_ttl(&backend, ttl).await;
    q1.init(&reducer()).await.unwrap();
    q2.init(&reducer()).await.unwrap();
    assert!(q1.is_leader());

    for n in 1..=2 {
        q1.enqueue(None, ping(n)).await.unwrap();
    }
    backend.expire_lock("s:lock");
    let first = q2.get_next().await.unwrap().expect("new leader pops");
    assert_eq!(first.action, ping(1));
    assert!(q2.is_leader());

    tokio::time::sleep(ttl + Duration::from_millis(20)).await;
    assert!(!q1.is_leader());
    let replayed = q1.get_next().await.unwrap().expect("replay of the new leader's pop");
    assert_eq!(replayed.action, ping(1));
    assert!(q1.get_next().await.unwrap().is_none());
    assert_eq!(backend.list_len("s:queue"), 1, "old leader must not pop the log");
    assert!(q2.is_leader());
}
