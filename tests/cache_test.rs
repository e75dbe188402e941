//! Integration tests for the deduplicating enrichment cache.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use enrichq::cache::{CacheConfig, EnrichmentCache};
use enrichq::error::{Error, Result};
use enrichq::event::{Event, EventBus, EventKind, Publish};
use enrichq::model::{FetchState, Fingerprint, ItemId, ReactionEmoji, ReactionKind, User};
use enrichq::queue::{QueueConfig, SequentialQueue};
use tokio::sync::{broadcast, oneshot};

struct Harness {
    cache: EnrichmentCache<User>,
    queue: Arc<SequentialQueue>,
    events: broadcast::Receiver<Event>,
    calls: Arc<AtomicUsize>,
}

fn harness(config: CacheConfig) -> Harness {
    harness_with_queue(config, QueueConfig {
        cooldown: Duration::ZERO,
        max_pending: None,
    })
}

fn harness_with_queue(config: CacheConfig, queue_config: QueueConfig) -> Harness {
    let queue = Arc::new(SequentialQueue::new(queue_config).expect("failed to create queue"));
    let bus = Arc::new(EventBus::new(64));
    let events = bus.subscribe();
    let publisher: Arc<dyn Publish> = bus;
    Harness {
        cache: EnrichmentCache::new(Arc::clone(&queue), publisher, config),
        queue,
        events,
        calls: Arc::default(),
    }
}

impl Harness {
    /// Request `fp`, answering with `users` if this request schedules.
    fn request(&self, fp: &Fingerprint, users: Vec<User>) -> Vec<String> {
        let calls = Arc::clone(&self.calls);
        let snapshot = self.cache.get_or_schedule(fp, move || async move {
            calls.fetch_add(1, Ordering::SeqCst);
            Ok(users)
        });
        ids(snapshot.values())
    }

    fn request_failing(&self, fp: &Fingerprint) {
        let calls = Arc::clone(&self.calls);
        self.cache.get_or_schedule(fp, move || async move {
            calls.fetch_add(1, Ordering::SeqCst);
            Err::<Vec<User>, _>(Error::Fetch {
                status: 500,
                body: "upstream unavailable".to_string(),
            })
        });
    }

    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    async fn next_event(&mut self) -> Event {
        tokio::time::timeout(Duration::from_secs(2), self.events.recv())
            .await
            .expect("no event within 2s")
            .expect("event bus closed")
    }

    /// Wait until no population for `fp` is in flight.
    async fn settle(&self, fp: &Fingerprint) -> FetchState {
        tokio::time::timeout(Duration::from_secs(2), async {
            loop {
                match self.cache.state(fp) {
                    Some(FetchState::InFlight) => tokio::time::sleep(Duration::from_millis(1)).await,
                    Some(state) => return state,
                    None => panic!("entry for {fp} vanished"),
                }
            }
        })
        .await
        .expect("population did not settle within 2s")
    }

    fn assert_no_more_events(&mut self) {
        assert!(matches!(
            self.events.try_recv(),
            Err(broadcast::error::TryRecvError::Empty)
        ));
    }
}

fn item(message: &str) -> ItemId {
    ItemId::new("chan-1", message)
}

fn fingerprint(message: &str, emoji: &str) -> Fingerprint {
    Fingerprint::new(item(message), ReactionEmoji::unicode(emoji), ReactionKind::Normal).unwrap()
}

fn user(id: &str, name: &str) -> User {
    User {
        id: id.to_string(),
        username: name.to_string(),
        global_name: None,
        avatar: None,
        bot: false,
    }
}

fn ids<'a>(users: impl Iterator<Item = &'a User>) -> Vec<String> {
    let mut ids: Vec<String> = users.map(|u| u.id.clone()).collect();
    ids.sort();
    ids
}

// ---------------------------------------------------------------------------
// Deduplication
// ---------------------------------------------------------------------------

#[tokio::test]
async fn repeated_requests_before_resolution_schedule_once() {
    let mut h = harness(CacheConfig::default());
    let f1 = fingerprint("m1", "👍");

    // Three requests before any fetch can run.
    assert!(h.request(&f1, vec![user("u1", "ann"), user("u2", "bob")]).is_empty());
    assert!(h.request(&f1, vec![user("x", "never")]).is_empty());
    assert!(h.request(&f1, vec![user("y", "never")]).is_empty());
    assert_eq!(h.queue.len(), 1);
    assert_eq!(h.cache.state(&f1), Some(FetchState::InFlight));

    let event = h.next_event().await;
    assert_eq!(event.kind.item(), &item("m1"));
    assert!(matches!(
        &event.kind,
        EventKind::EnrichmentUpdated { fingerprint, records: 2, .. } if fingerprint == &f1
    ));
    assert_eq!(ids(h.cache.peek(&f1).values()), ["u1", "u2"]);
    assert_eq!(h.calls(), 1);

    // A fourth request is answered from cache with nothing queued.
    assert_eq!(h.request(&f1, vec![user("z", "never")]), ["u1", "u2"]);
    assert!(h.queue.is_empty());
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(h.calls(), 1);
    h.assert_no_more_events();
}

#[tokio::test]
async fn get_or_schedule_never_waits_for_the_fetch() {
    let h = harness(CacheConfig::default());
    let fp = fingerprint("m1", "🔥");

    let snapshot = h.cache.get_or_schedule(&fp, || futures::future::pending::<Result<Vec<User>>>());
    assert!(snapshot.is_empty());
    assert_eq!(h.cache.state(&fp), Some(FetchState::InFlight));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_requests_from_many_threads_schedule_once() {
    let h = harness(CacheConfig::default());
    let fp = fingerprint("m1", "🎉");
    let (release_tx, release_rx) = oneshot::channel::<()>();
    let release_rx = Arc::new(tokio::sync::Mutex::new(Some(release_rx)));

    let tasks: Vec<_> = (0..16)
        .map(|_| {
            let cache = h.cache.clone();
            let fp = fp.clone();
            let calls = Arc::clone(&h.calls);
            let release_rx = Arc::clone(&release_rx);
            tokio::spawn(async move {
                cache.get_or_schedule(&fp, move || async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    if let Some(rx) = release_rx.lock().await.take() {
                        let _ = rx.await;
                    }
                    Ok(vec![user("u1", "ann")])
                });
            })
        })
        .collect();
    for task in tasks {
        task.await.unwrap();
    }

    release_tx.send(()).unwrap();
    assert!(matches!(h.settle(&fp).await, FetchState::Done { .. }));
    assert_eq!(h.calls(), 1);
}

#[tokio::test]
async fn fingerprints_differing_only_in_kind_are_separate() {
    let mut h = harness(CacheConfig::default());
    let normal = fingerprint("m1", "👍");
    let burst = Fingerprint::new(item("m1"), ReactionEmoji::unicode("👍"), ReactionKind::Burst)
        .unwrap();

    h.request(&normal, vec![user("u1", "ann")]);
    h.request(&burst, vec![user("u2", "bob")]);
    assert_eq!(h.queue.len(), 2);

    h.next_event().await;
    h.next_event().await;
    assert_eq!(ids(h.cache.peek(&normal).values()), ["u1"]);
    assert_eq!(ids(h.cache.peek(&burst).values()), ["u2"]);
}

// ---------------------------------------------------------------------------
// Merge and events
// ---------------------------------------------------------------------------

#[tokio::test]
async fn refetching_the_same_record_keeps_one_entry_with_latest_value() {
    let mut h = harness(CacheConfig::default());
    let fp = fingerprint("m1", "👍");

    h.request(&fp, vec![user("u1", "old-name")]);
    h.next_event().await;

    assert!(h.cache.invalidate(&fp));
    h.request(&fp, vec![user("u1", "new-name")]);
    let event = h.next_event().await;

    let snapshot = h.cache.peek(&fp);
    assert_eq!(snapshot.len(), 1);
    assert_eq!(snapshot["u1"].username, "new-name");
    assert!(matches!(event.kind, EventKind::EnrichmentUpdated { records: 1, .. }));
    assert_eq!(h.calls(), 2);
}

#[tokio::test]
async fn failed_population_emits_nothing_and_is_not_retried() {
    let mut h = harness(CacheConfig::default());
    let fp = fingerprint("m1", "👎");

    h.request_failing(&fp);
    assert!(matches!(h.settle(&fp).await, FetchState::Failed { .. }));
    assert!(h.cache.peek(&fp).is_empty());
    h.assert_no_more_events();

    // Still marked fetched: no second attempt.
    h.request(&fp, vec![user("u1", "ann")]);
    assert!(h.queue.is_empty());
    assert_eq!(h.calls(), 1);
}

#[tokio::test]
async fn failed_population_is_retried_once_the_window_passes() {
    let mut h = harness(CacheConfig {
        capacity: None,
        retry_after: Some(Duration::ZERO),
    });
    let fp = fingerprint("m1", "👎");

    h.request_failing(&fp);
    assert!(matches!(h.settle(&fp).await, FetchState::Failed { .. }));

    h.request(&fp, vec![user("u1", "ann")]);
    let event = h.next_event().await;
    assert_eq!(event.kind.item(), fp.item());
    assert_eq!(h.calls(), 2);
    assert!(matches!(h.cache.state(&fp), Some(FetchState::Done { .. })));
}

#[tokio::test]
async fn invalidate_refuses_in_flight_entries() {
    let h = harness(CacheConfig::default());
    let fp = fingerprint("m1", "👍");
    assert!(!h.cache.invalidate(&fp));

    h.cache.get_or_schedule(&fp, || futures::future::pending::<Result<Vec<User>>>());
    assert!(!h.cache.invalidate(&fp));
}

#[tokio::test]
async fn peek_never_schedules() {
    let h = harness(CacheConfig::default());
    let fp = fingerprint("m1", "👍");

    assert!(h.cache.peek(&fp).is_empty());
    assert_eq!(h.cache.state(&fp), None);
    assert!(h.cache.is_empty());
    assert!(h.queue.is_empty());
}

// ---------------------------------------------------------------------------
// Bounded memory
// ---------------------------------------------------------------------------

#[tokio::test]
async fn capacity_evicts_least_recently_requested() {
    let mut h = harness(CacheConfig {
        capacity: Some(2),
        retry_after: None,
    });
    let (f1, f2, f3) = (
        fingerprint("m1", "👍"),
        fingerprint("m2", "👍"),
        fingerprint("m3", "👍"),
    );

    h.request(&f1, vec![user("u1", "ann")]);
    h.request(&f2, vec![user("u2", "bob")]);
    h.next_event().await;
    h.next_event().await;

    // Touch f1 so f2 becomes the oldest.
    h.request(&f1, vec![]);
    h.request(&f3, vec![user("u3", "cy")]);
    h.next_event().await;

    assert_eq!(h.cache.len(), 2);
    assert!(h.cache.state(&f2).is_none());
    assert_eq!(ids(h.cache.peek(&f1).values()), ["u1"]);
    assert_eq!(ids(h.cache.peek(&f3).values()), ["u3"]);
}

#[tokio::test]
async fn capacity_never_evicts_in_flight_entries() {
    let h = harness(CacheConfig {
        capacity: Some(1),
        retry_after: None,
    });
    let (f1, f2) = (fingerprint("m1", "👍"), fingerprint("m2", "👍"));

    h.cache.get_or_schedule(&f1, || futures::future::pending::<Result<Vec<User>>>());
    h.cache.get_or_schedule(&f2, || futures::future::pending::<Result<Vec<User>>>());

    assert_eq!(h.cache.len(), 2);
    assert_eq!(h.cache.state(&f1), Some(FetchState::InFlight));
}

#[tokio::test]
async fn population_dropped_by_the_queue_releases_its_claim() {
    let h = harness_with_queue(
        CacheConfig::default(),
        QueueConfig {
            cooldown: Duration::ZERO,
            max_pending: Some(1),
        },
    );
    let (f1, f2) = (fingerprint("m1", "👍"), fingerprint("m2", "👍"));

    h.request(&f1, vec![user("u1", "ann")]);
    // Pending list is full; pushing f2 to the head sheds f1's task.
    h.request(&f2, vec![user("u2", "bob")]);

    assert_eq!(h.cache.state(&f1), Some(FetchState::Unfetched));
    assert_eq!(h.cache.state(&f2), Some(FetchState::InFlight));
}
