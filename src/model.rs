//! Core data model.
//!
//! A fingerprint names one enrichment request: which reaction, of which kind,
//! on which message. Records are what a population fetch brings back.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

// ---------------------------------------------------------------------------
// Item identity
// ---------------------------------------------------------------------------

/// Stable identity of the item being enriched: a message in a channel.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ItemId {
    pub channel_id: String,
    pub message_id: String,
}

impl ItemId {
    pub fn new(channel_id: impl Into<String>, message_id: impl Into<String>) -> Self {
        Self {
            channel_id: channel_id.into(),
            message_id: message_id.into(),
        }
    }
}

impl std::fmt::Display for ItemId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.channel_id, self.message_id)
    }
}

// ---------------------------------------------------------------------------
// Enrichment kind
// ---------------------------------------------------------------------------

/// The reaction an enrichment is about. Custom emoji carry an id.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ReactionEmoji {
    pub name: String,
    pub id: Option<String>,
}

impl ReactionEmoji {
    pub fn unicode(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            id: None,
        }
    }

    pub fn custom(name: impl Into<String>, id: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            id: Some(id.into()),
        }
    }

    /// Key used by the reactions endpoint: `name` or `name:id`.
    pub fn api_key(&self) -> String {
        match &self.id {
            Some(id) => format!("{}:{id}", self.name),
            None => self.name.clone(),
        }
    }
}

/// Sub-type qualifier for a reaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReactionKind {
    #[default]
    Normal,
    Burst,
}

impl ReactionKind {
    /// Numeric value sent as the `type` query parameter.
    pub fn wire_value(self) -> u8 {
        match self {
            ReactionKind::Normal => 0,
            ReactionKind::Burst => 1,
        }
    }
}

impl std::fmt::Display for ReactionKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ReactionKind::Normal => "normal",
            ReactionKind::Burst => "burst",
        };
        write!(f, "{s}")
    }
}

// ---------------------------------------------------------------------------
// Fingerprint
// ---------------------------------------------------------------------------

/// Composite key for one enrichment request.
///
/// Equality and hashing are structural over every component, so two
/// fingerprints that differ only in kind never collide. Fields are private;
/// the only way in is [`Fingerprint::new`], which rejects ill-formed input.
/// Deserialization goes through it as well.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "RawFingerprint")]
pub struct Fingerprint {
    item: ItemId,
    emoji: ReactionEmoji,
    kind: ReactionKind,
}

impl Fingerprint {
    pub fn new(item: ItemId, emoji: ReactionEmoji, kind: ReactionKind) -> Result<Self> {
        check_field("channel_id", &item.channel_id)?;
        check_field("message_id", &item.message_id)?;
        check_field("emoji name", &emoji.name)?;
        if let Some(id) = &emoji.id {
            check_field("emoji id", id)?;
        }
        Ok(Self { item, emoji, kind })
    }

    pub fn item(&self) -> &ItemId {
        &self.item
    }

    pub fn emoji(&self) -> &ReactionEmoji {
        &self.emoji
    }

    pub fn kind(&self) -> ReactionKind {
        self.kind
    }
}

impl std::fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}:{}:{}:{}",
            self.item.message_id,
            self.emoji.name,
            self.emoji.id.as_deref().unwrap_or(""),
            self.kind
        )
    }
}

#[derive(Deserialize)]
struct RawFingerprint {
    item: ItemId,
    emoji: ReactionEmoji,
    kind: ReactionKind,
}

impl TryFrom<RawFingerprint> for Fingerprint {
    type Error = Error;

    fn try_from(raw: RawFingerprint) -> Result<Self> {
        Fingerprint::new(raw.item, raw.emoji, raw.kind)
    }
}

fn check_field(field: &str, value: &str) -> Result<()> {
    if value.is_empty() {
        return Err(Error::InvalidFingerprint(format!("{field} is empty")));
    }
    if value.chars().any(char::is_control) {
        return Err(Error::InvalidFingerprint(format!(
            "{field} contains control characters"
        )));
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Records
// ---------------------------------------------------------------------------

/// Anything the cache can store: cloneable and identified by a string key.
pub trait Record: Clone + Send + Sync + 'static {
    fn record_id(&self) -> &str;
}

/// A user who added a reaction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct User {
    pub id: String,
    pub username: String,
    #[serde(default)]
    pub global_name: Option<String>,
    #[serde(default)]
    pub avatar: Option<String>,
    #[serde(default)]
    pub bot: bool,
}

impl User {
    /// Name to show in a tooltip: global name if set, else username.
    pub fn display_name(&self) -> &str {
        self.global_name.as_deref().unwrap_or(&self.username)
    }
}

impl Record for User {
    fn record_id(&self) -> &str {
        &self.id
    }
}

/// Immutable view of an entry's records at the moment it was taken.
pub type Snapshot<R> = Arc<HashMap<String, R>>;

// ---------------------------------------------------------------------------
// Fetch state
// ---------------------------------------------------------------------------

/// Population lifecycle of a cache entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum FetchState {
    /// Known but never scheduled (or explicitly invalidated).
    Unfetched,
    /// A population task is queued or running.
    InFlight,
    /// Last population succeeded.
    Done { at: DateTime<Utc> },
    /// Last population failed. Records may be partial or empty.
    Failed { at: DateTime<Utc> },
}

impl FetchState {
    /// Has population been scheduled at least once since the last reset?
    pub fn fetched(self) -> bool {
        !matches!(self, FetchState::Unfetched)
    }
}

impl std::fmt::Display for FetchState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            FetchState::Unfetched => "unfetched",
            FetchState::InFlight => "in_flight",
            FetchState::Done { .. } => "done",
            FetchState::Failed { .. } => "failed",
        };
        write!(f, "{s}")
    }
}
