//! Span helpers for population fetches.

use tracing::Span;

use crate::model::Fingerprint;

/// Start a span covering one population fetch.
///
/// `fetch.outcome` and `fetch.records` are filled in by
/// [`record_fetch_outcome`].
pub fn start_population_span(fingerprint: &Fingerprint) -> Span {
    tracing::info_span!(
        "enrichment.populate",
        "item.channel_id" = %fingerprint.item().channel_id,
        "item.message_id" = %fingerprint.item().message_id,
        "reaction.emoji" = %fingerprint.emoji().api_key(),
        "reaction.kind" = %fingerprint.kind(),
        "fetch.outcome" = tracing::field::Empty,
        "fetch.records" = tracing::field::Empty,
    )
}

pub fn record_fetch_outcome(span: &Span, outcome: &str, records: usize) {
    span.record("fetch.outcome", outcome);
    span.record("fetch.records", records as u64);
}
