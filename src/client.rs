//! Remote fetch contract: who added a given reaction to a message.
//!
//! One call returns at most `page_limit` users. Callers treat that page as
//! the whole answer; nothing here paginates.

use std::time::Instant;

use futures::FutureExt;
use futures::future::BoxFuture;
use opentelemetry::KeyValue;
use reqwest::header::{AUTHORIZATION, HeaderMap, HeaderValue};
use reqwest::{StatusCode, Url};
use secrecy::ExposeSecret;
use tracing::debug;

use crate::config::ApiConfig;
use crate::error::{Error, Result};
use crate::model::{Fingerprint, User};
use crate::telemetry::metrics;

/// Anything that can list the users behind a reaction.
pub trait ReactionSource: Send + Sync {
    fn fetch_reactors<'a>(&'a self, fingerprint: &'a Fingerprint) -> BoxFuture<'a, Result<Vec<User>>>;
}

/// HTTP client for the reactions endpoint.
#[derive(Debug, Clone)]
pub struct ReactionsClient {
    http: reqwest::Client,
    base_url: Url,
    page_limit: u32,
    timeout: std::time::Duration,
}

impl ReactionsClient {
    pub fn new(config: &ApiConfig) -> Result<Self> {
        let base_url = Url::parse(&config.base_url)
            .map_err(|e| Error::Config(format!("bad api base url {:?}: {e}", config.base_url)))?;
        if base_url.cannot_be_a_base() {
            return Err(Error::Config(format!(
                "api base url {:?} cannot carry a path",
                config.base_url
            )));
        }

        let mut headers = HeaderMap::new();
        if let Some(token) = &config.token {
            let mut value = HeaderValue::from_str(token.expose_secret())
                .map_err(|e| Error::Config(format!("api token is not a valid header: {e}")))?;
            value.set_sensitive(true);
            headers.insert(AUTHORIZATION, value);
        }

        let http = reqwest::Client::builder()
            .default_headers(headers)
            .timeout(config.request_timeout)
            .build()?;

        Ok(Self {
            http,
            base_url,
            page_limit: config.page_limit,
            timeout: config.request_timeout,
        })
    }

    /// `{base}/channels/{channel}/messages/{message}/reactions/{emoji}?limit=N&type=K`
    pub fn reactions_url(&self, fingerprint: &Fingerprint) -> Url {
        let mut url = self.base_url.clone();
        let item = fingerprint.item();
        let emoji = fingerprint.emoji().api_key();
        if let Ok(mut segments) = url.path_segments_mut() {
            segments.pop_if_empty().extend([
                "channels",
                item.channel_id.as_str(),
                "messages",
                item.message_id.as_str(),
                "reactions",
                emoji.as_str(),
            ]);
        }
        url.query_pairs_mut()
            .append_pair("limit", &self.page_limit.to_string())
            .append_pair("type", &fingerprint.kind().wire_value().to_string());
        url
    }

    /// Fetch one page of users for the reaction named by `fingerprint`.
    pub async fn fetch_page(&self, fingerprint: &Fingerprint) -> Result<Vec<User>> {
        let url = self.reactions_url(fingerprint);
        let started = Instant::now();

        let response = self.http.get(url).send().await.map_err(|e| self.map_send_error(e))?;
        let status = response.status();
        metrics::api_responses().add(1, &[KeyValue::new("status", i64::from(status.as_u16()))]);

        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(Error::Fetch {
                status: status.as_u16(),
                body,
            });
        }

        let bytes = response.bytes().await.map_err(|e| self.map_send_error(e))?;
        let users: Vec<User> =
            serde_json::from_slice(&bytes).map_err(|e| Error::Malformed(e.to_string()))?;

        let elapsed_ms = started.elapsed().as_secs_f64() * 1000.0;
        metrics::operation_duration_ms().record(elapsed_ms, &[KeyValue::new("operation", "fetch_reactors")]);
        debug!(
            %fingerprint,
            users = users.len(),
            truncated = users.len() as u32 >= self.page_limit,
            "reactions page fetched"
        );
        Ok(users)
    }

    fn map_send_error(&self, e: reqwest::Error) -> Error {
        if e.is_timeout() {
            Error::Timeout(self.timeout)
        } else {
            Error::Http(e)
        }
    }
}

impl ReactionSource for ReactionsClient {
    fn fetch_reactors<'a>(&'a self, fingerprint: &'a Fingerprint) -> BoxFuture<'a, Result<Vec<User>>> {
        self.fetch_page(fingerprint).boxed()
    }
}

/// Did the server say to slow down?
pub fn is_rate_limited(error: &Error) -> bool {
    matches!(error, Error::Fetch { status, .. } if *status == StatusCode::TOO_MANY_REQUESTS.as_u16())
}
