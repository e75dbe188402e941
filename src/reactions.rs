//! "Who reacted" view model: the API a rendering layer talks to.
//!
//! A view asks for the users behind a reaction and renders whatever comes
//! back, possibly nothing yet. It also subscribes to updates for its message
//! and asks again when one arrives.

use std::sync::Arc;
use std::time::Duration;

use futures::{Stream, StreamExt};
use tokio::sync::broadcast;
use tokio_stream::wrappers::BroadcastStream;
use tracing::warn;

use crate::cache::{CacheConfig, EnrichmentCache};
use crate::client::{ReactionSource, is_rate_limited};
use crate::error::{Error, Result};
use crate::event::{Event, EventBus, Publish};
use crate::model::{FetchState, Fingerprint, ItemId, Snapshot, User};
use crate::queue::SequentialQueue;

/// Reactions with more distinct emoji than this are not worth enriching.
pub const MAX_ENRICHED_REACTIONS: usize = 10;

/// Entry point for views.
#[derive(Clone)]
pub struct WhoReacted {
    cache: EnrichmentCache<User>,
    source: Arc<dyn ReactionSource>,
    bus: Arc<EventBus>,
}

impl WhoReacted {
    pub fn new(
        source: Arc<dyn ReactionSource>,
        queue: Arc<SequentialQueue>,
        bus: Arc<EventBus>,
        config: CacheConfig,
    ) -> Self {
        let publisher: Arc<dyn Publish> = bus.clone();
        Self {
            cache: EnrichmentCache::new(queue, publisher, config),
            source,
            bus,
        }
    }

    /// Whether a message with `distinct_reactions` reactions should show users at all.
    pub fn should_enrich(distinct_reactions: usize) -> bool {
        distinct_reactions <= MAX_ENRICHED_REACTIONS
    }

    /// Users known for this reaction, scheduling a fetch on first sight.
    pub fn users(&self, fingerprint: &Fingerprint) -> Vec<User> {
        let source = Arc::clone(&self.source);
        let fp = fingerprint.clone();
        let snapshot = self.cache.get_or_schedule(fingerprint, move || async move {
            let result = source.fetch_reactors(&fp).await;
            if let Err(e) = &result {
                if is_rate_limited(e) {
                    warn!(fingerprint = %fp, "remote api is rate limiting reaction fetches");
                }
            }
            result
        });
        sorted(&snapshot)
    }

    /// Users known for this reaction. Never triggers a fetch.
    pub fn peek_users(&self, fingerprint: &Fingerprint) -> Vec<User> {
        sorted(&self.cache.peek(fingerprint))
    }

    pub fn state(&self, fingerprint: &Fingerprint) -> Option<FetchState> {
        self.cache.state(fingerprint)
    }

    /// Drop the "already fetched" mark so the next `users` call refetches.
    pub fn refresh(&self, fingerprint: &Fingerprint) -> bool {
        self.cache.invalidate(fingerprint)
    }

    pub fn cache(&self) -> &EnrichmentCache<User> {
        &self.cache
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.bus.subscribe()
    }

    /// Invalidations for one message, as a stream. Lagged events are skipped.
    pub fn updates_for(&self, item: ItemId) -> impl Stream<Item = Event> + Send + 'static {
        BroadcastStream::new(self.bus.subscribe()).filter_map(move |received| {
            let matched = match received {
                Ok(event) if event.kind.item() == &item => Some(event),
                Ok(_) => None,
                Err(e) => {
                    warn!(error = %e, "update stream lagged");
                    None
                }
            };
            std::future::ready(matched)
        })
    }

    /// Wait for the next update to `item`, up to `timeout`.
    pub async fn wait_for_update(&self, item: &ItemId, timeout: Duration) -> Result<Event> {
        let mut updates = Box::pin(self.updates_for(item.clone()));
        match tokio::time::timeout(timeout, updates.next()).await {
            Ok(Some(event)) => Ok(event),
            Ok(None) => Err(Error::Other("event bus closed".to_string())),
            Err(_) => Err(Error::Timeout(timeout)),
        }
    }
}

impl std::fmt::Debug for WhoReacted {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WhoReacted")
            .field("cache", &self.cache)
            .field("bus", &self.bus)
            .finish()
    }
}

fn sorted(snapshot: &Snapshot<User>) -> Vec<User> {
    let mut users: Vec<User> = snapshot.values().cloned().collect();
    users.sort_by(|a, b| a.id.cmp(&b.id));
    users
}

/// Tooltip text for users past the first `shown`: "a, b, c".
///
/// Names are display names (global name when set), not raw usernames, so the
/// tooltip reads the same as the rest of the view.
pub fn overflow_names(users: &[User], shown: usize) -> Option<String> {
    let rest = users.get(shown..).filter(|rest| !rest.is_empty())?;
    Some(
        rest.iter()
            .map(User::display_name)
            .collect::<Vec<_>>()
            .join(", "),
    )
}
