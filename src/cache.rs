//! Deduplicating enrichment cache.
//!
//! Callers ask for a fingerprint and always get an answer right away: the
//! records known so far, possibly none. The first request for a fingerprint
//! claims it and schedules exactly one population task at the head of the
//! shared [`SequentialQueue`]; every later request before that task finishes
//! sees the same entry and schedules nothing. When population succeeds the
//! records are merged in and one [`EventKind::EnrichmentUpdated`] goes out so
//! views can re-render.
//!
//! Claiming happens under the entries mutex, so the check and the flip from
//! `Unfetched` to `InFlight` are one step even on a multi-threaded runtime.

use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use indexmap::IndexMap;
use opentelemetry::KeyValue;
use tracing::{Instrument, debug, info, warn};

use crate::error::Result;
use crate::event::{EventKind, Publish};
use crate::model::{FetchState, Fingerprint, Record, Snapshot};
use crate::queue::SequentialQueue;
use crate::telemetry::fetch::{record_fetch_outcome, start_population_span};
use crate::telemetry::metrics;

/// Configuration for an [`EnrichmentCache`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CacheConfig {
    /// Maximum number of entries. Least recently requested entries are
    /// evicted first; entries with a fetch in flight are never evicted.
    /// `None` keeps everything for the life of the cache.
    pub capacity: Option<usize>,
    /// How long a failed entry stays failed before a request may schedule
    /// it again. `None` never retries automatically.
    pub retry_after: Option<Duration>,
}

struct Entry<R> {
    state: FetchState,
    records: Snapshot<R>,
}

impl<R: Record> Entry<R> {
    fn new() -> Self {
        Self {
            state: FetchState::Unfetched,
            records: Snapshot::default(),
        }
    }

    /// Flip to `InFlight` if this request should schedule a population.
    fn claim(&mut self, retry_after: Option<Duration>, now: DateTime<Utc>) -> Option<&'static str> {
        let label = match self.state {
            FetchState::Unfetched => "scheduled",
            FetchState::Failed { at } if retry_due(at, retry_after, now) => "rescheduled",
            _ => return None,
        };
        self.state = FetchState::InFlight;
        Some(label)
    }
}

fn retry_due(failed_at: DateTime<Utc>, retry_after: Option<Duration>, now: DateTime<Utc>) -> bool {
    let Some(window) = retry_after else {
        return false;
    };
    now.signed_duration_since(failed_at)
        .to_std()
        .map(|age| age >= window)
        .unwrap_or(window.is_zero())
}

/// Insert-or-overwrite `records` into `target` by record id.
pub fn merge_records<R: Record>(target: &mut Snapshot<R>, records: Vec<R>) {
    let map = Arc::make_mut(target);
    for record in records {
        map.insert(record.record_id().to_owned(), record);
    }
}

type Entries<R> = Mutex<IndexMap<Fingerprint, Entry<R>>>;

fn lock<R>(entries: &Entries<R>) -> MutexGuard<'_, IndexMap<Fingerprint, Entry<R>>> {
    entries.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Keyed, fetch-at-most-once cache of enrichment records.
pub struct EnrichmentCache<R: Record> {
    entries: Arc<Entries<R>>,
    queue: Arc<SequentialQueue>,
    publisher: Arc<dyn Publish>,
    config: CacheConfig,
}

impl<R: Record> Clone for EnrichmentCache<R> {
    fn clone(&self) -> Self {
        Self {
            entries: Arc::clone(&self.entries),
            queue: Arc::clone(&self.queue),
            publisher: Arc::clone(&self.publisher),
            config: self.config.clone(),
        }
    }
}

impl<R: Record> EnrichmentCache<R> {
    pub fn new(
        queue: Arc<SequentialQueue>,
        publisher: Arc<dyn Publish>,
        config: CacheConfig,
    ) -> Self {
        Self {
            entries: Arc::new(Mutex::new(IndexMap::new())),
            queue,
            publisher,
            config,
        }
    }

    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    /// Return what is known for `fingerprint`, scheduling a population with
    /// `fetch` if nobody has yet. Never waits for the fetch.
    pub fn get_or_schedule<F, Fut>(&self, fingerprint: &Fingerprint, fetch: F) -> Snapshot<R>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<Vec<R>>> + Send + 'static,
    {
        let (snapshot, claimed) = {
            let mut entries = lock(&self.entries);
            let index = match entries.get_index_of(fingerprint) {
                // Recency only matters when there is a bound to enforce.
                Some(index) if self.config.capacity.is_some() => {
                    let last = entries.len() - 1;
                    entries.move_index(index, last);
                    last
                }
                Some(index) => index,
                None => {
                    self.evict_for_insert(&mut entries);
                    entries.insert_full(fingerprint.clone(), Entry::new()).0
                }
            };
            let entry = &mut entries[index];
            let claimed = entry.claim(self.config.retry_after, Utc::now());
            (Arc::clone(&entry.records), claimed)
        };

        metrics::cache_lookups().add(
            1,
            &[KeyValue::new("result", claimed.unwrap_or("hit"))],
        );

        if let Some(label) = claimed {
            debug!(%fingerprint, label, "population scheduled");
            let guard = ClaimGuard {
                entries: Arc::clone(&self.entries),
                fingerprint: fingerprint.clone(),
                started: false,
                armed: true,
            };
            let publisher = Arc::clone(&self.publisher);
            // Freshly requested items jump ahead of older pending ones.
            drop(self.queue.push_front(move || populate(guard, publisher, fetch)));
        }

        snapshot
    }

    /// Current records for `fingerprint` without scheduling anything.
    pub fn peek(&self, fingerprint: &Fingerprint) -> Snapshot<R> {
        lock(&self.entries)
            .get(fingerprint)
            .map(|entry| Arc::clone(&entry.records))
            .unwrap_or_default()
    }

    pub fn state(&self, fingerprint: &Fingerprint) -> Option<FetchState> {
        lock(&self.entries).get(fingerprint).map(|entry| entry.state)
    }

    /// Mark an entry for refetch on its next request, keeping its records.
    ///
    /// Returns `false` if the entry is unknown or a fetch is in flight.
    pub fn invalidate(&self, fingerprint: &Fingerprint) -> bool {
        let mut entries = lock(&self.entries);
        match entries.get_mut(fingerprint) {
            Some(entry) if entry.state != FetchState::InFlight => {
                entry.state = FetchState::Unfetched;
                true
            }
            _ => false,
        }
    }

    pub fn len(&self) -> usize {
        lock(&self.entries).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn evict_for_insert(&self, entries: &mut IndexMap<Fingerprint, Entry<R>>) {
        let Some(capacity) = self.config.capacity else {
            return;
        };
        while entries.len() >= capacity.max(1) {
            let Some(index) = entries
                .values()
                .position(|entry| entry.state != FetchState::InFlight)
            else {
                break;
            };
            if let Some((evicted, _)) = entries.shift_remove_index(index) {
                debug!(fingerprint = %evicted, "entry evicted");
            }
        }
    }
}

impl<R: Record> std::fmt::Debug for EnrichmentCache<R> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EnrichmentCache")
            .field("entries", &self.len())
            .field("config", &self.config)
            .finish()
    }
}

/// Owns a claim on an entry until its population finishes.
///
/// If the queue drops the task unrun, the entry goes back to `Unfetched`;
/// if the task dies mid-fetch, it is marked `Failed`.
struct ClaimGuard<R: Record> {
    entries: Arc<Entries<R>>,
    fingerprint: Fingerprint,
    started: bool,
    armed: bool,
}

impl<R: Record> ClaimGuard<R> {
    /// Record the outcome and release the claim.
    fn settle(&mut self, state: FetchState, records: Option<Vec<R>>) -> Option<usize> {
        self.armed = false;
        let mut entries = lock(&self.entries);
        let entry = entries.get_mut(&self.fingerprint)?;
        entry.state = state;
        if let Some(records) = records {
            merge_records(&mut entry.records, records);
        }
        Some(entry.records.len())
    }
}

impl<R: Record> Drop for ClaimGuard<R> {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        let mut entries = lock(&self.entries);
        if let Some(entry) = entries.get_mut(&self.fingerprint) {
            if entry.state == FetchState::InFlight {
                entry.state = if self.started {
                    FetchState::Failed { at: Utc::now() }
                } else {
                    FetchState::Unfetched
                };
                warn!(fingerprint = %self.fingerprint, state = %entry.state, "population abandoned");
            }
        }
    }
}

async fn populate<R, F, Fut>(mut guard: ClaimGuard<R>, publisher: Arc<dyn Publish>, fetch: F)
where
    R: Record,
    F: FnOnce() -> Fut,
    Fut: Future<Output = Result<Vec<R>>>,
{
    guard.started = true;
    let span = start_population_span(&guard.fingerprint);
    let started = Instant::now();
    let result = fetch().instrument(span.clone()).await;
    let duration_ms = started.elapsed().as_millis() as u64;

    match result {
        Ok(records) => {
            let fetched = records.len();
            record_fetch_outcome(&span, "ok", fetched);
            let settled = guard.settle(FetchState::Done { at: Utc::now() }, Some(records));
            let fingerprint = guard.fingerprint.clone();
            metrics::populations().add(1, &[KeyValue::new("outcome", "ok")]);

            match settled {
                Some(total) => {
                    info!(%fingerprint, fetched, total, duration_ms, "population completed");
                    publisher.publish(EventKind::EnrichmentUpdated {
                        item: fingerprint.item().clone(),
                        fingerprint,
                        records: total,
                    });
                }
                None => debug!(%fingerprint, "entry gone before population finished"),
            }
        }
        Err(e) => {
            record_fetch_outcome(&span, "error", 0);
            metrics::populations().add(1, &[KeyValue::new("outcome", "error")]);
            warn!(fingerprint = %guard.fingerprint, error = %e, duration_ms, "population failed");
            guard.settle(FetchState::Failed { at: Utc::now() }, None);
        }
    }
}
