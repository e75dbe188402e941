//! Reactions client against a mock HTTP server.

use std::sync::Arc;
use std::time::Duration;

use enrichq::cache::CacheConfig;
use enrichq::client::{ReactionSource, ReactionsClient, is_rate_limited};
use enrichq::config::ApiConfig;
use enrichq::error::Error;
use enrichq::event::{EventBus, EventKind};
use enrichq::model::{FetchState, Fingerprint, ItemId, ReactionEmoji, ReactionKind};
use enrichq::queue::{QueueConfig, SequentialQueue};
use enrichq::reactions::WhoReacted;
use futures::StreamExt;
use mockito::{Matcher, Server};
use secrecy::SecretString;

const PATH: &str = "/channels/1/messages/2/reactions/blob:42";

fn fingerprint(kind: ReactionKind) -> Fingerprint {
    Fingerprint::new(ItemId::new("1", "2"), ReactionEmoji::custom("blob", "42"), kind).unwrap()
}

fn api_config(server: &Server) -> ApiConfig {
    let mut config = ApiConfig::new(server.url());
    config.token = Some(SecretString::from("test-token"));
    config.page_limit = 25;
    config
}

fn users_body() -> String {
    serde_json::json!([
        {"id": "10", "username": "ann", "global_name": "Ann", "avatar": null},
        {"id": "11", "username": "bob", "bot": true}
    ])
    .to_string()
}

#[tokio::test]
async fn fetch_sends_limit_kind_and_token() {
    let mut server = Server::new_async().await;
    let mock = server
        .mock("GET", PATH)
        .match_query(Matcher::AllOf(vec![
            Matcher::UrlEncoded("limit".into(), "25".into()),
            Matcher::UrlEncoded("type".into(), "1".into()),
        ]))
        .match_header("authorization", "test-token")
        .with_status(200)
        .with_header("content-type", "application/json")
        .with_body(users_body())
        .create_async()
        .await;

    let client = ReactionsClient::new(&api_config(&server)).unwrap();
    let users = client
        .fetch_reactors(&fingerprint(ReactionKind::Burst))
        .await
        .expect("fetch failed");

    mock.assert_async().await;
    assert_eq!(users.len(), 2);
    assert_eq!(users[0].display_name(), "Ann");
    assert!(users[1].bot);
}

#[tokio::test]
async fn non_success_status_is_a_fetch_error() {
    let mut server = Server::new_async().await;
    server
        .mock("GET", PATH)
        .match_query(Matcher::Any)
        .with_status(500)
        .with_body("upstream exploded")
        .create_async()
        .await;

    let client = ReactionsClient::new(&api_config(&server)).unwrap();
    let err = client
        .fetch_page(&fingerprint(ReactionKind::Normal))
        .await
        .unwrap_err();

    assert!(matches!(&err, Error::Fetch { status: 500, body } if body == "upstream exploded"));
    assert!(err.is_fetch_failure());
    assert!(!is_rate_limited(&err));
}

#[tokio::test]
async fn too_many_requests_is_recognized() {
    let mut server = Server::new_async().await;
    server
        .mock("GET", PATH)
        .match_query(Matcher::Any)
        .with_status(429)
        .with_body(r#"{"retry_after": 1.5}"#)
        .create_async()
        .await;

    let client = ReactionsClient::new(&api_config(&server)).unwrap();
    let err = client
        .fetch_page(&fingerprint(ReactionKind::Normal))
        .await
        .unwrap_err();
    assert!(is_rate_limited(&err));
}

#[tokio::test]
async fn unparseable_body_is_malformed() {
    let mut server = Server::new_async().await;
    server
        .mock("GET", PATH)
        .match_query(Matcher::Any)
        .with_status(200)
        .with_body(r#"{"not": "a list"}"#)
        .create_async()
        .await;

    let client = ReactionsClient::new(&api_config(&server)).unwrap();
    let err = client
        .fetch_page(&fingerprint(ReactionKind::Normal))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Malformed(_)));
}

#[tokio::test]
async fn who_reacted_end_to_end() {
    let mut server = Server::new_async().await;
    let mock = server
        .mock("GET", PATH)
        .match_query(Matcher::Any)
        .with_status(200)
        .with_body(users_body())
        .expect(1)
        .create_async()
        .await;

    let client = Arc::new(ReactionsClient::new(&api_config(&server)).unwrap());
    let queue = Arc::new(
        SequentialQueue::new(QueueConfig {
            cooldown: Duration::from_millis(5),
            max_pending: None,
        })
        .unwrap(),
    );
    let who = WhoReacted::new(client, queue, Arc::new(EventBus::default()), CacheConfig::default());
    let fp = fingerprint(ReactionKind::Normal);
    let item = fp.item().clone();

    // Subscribe before scheduling so the update cannot be missed.
    let mut updates = Box::pin(who.updates_for(item.clone()));

    assert!(who.users(&fp).is_empty());
    assert!(who.users(&fp).is_empty());

    let event = tokio::time::timeout(Duration::from_secs(5), updates.next())
        .await
        .expect("no update within 5s")
        .expect("update stream ended");
    assert!(matches!(event.kind, EventKind::EnrichmentUpdated { records: 2, .. }));
    assert_eq!(event.kind.item(), &item);

    let ids: Vec<_> = who.users(&fp).into_iter().map(|u| u.id).collect();
    assert_eq!(ids, ["10", "11"]);
    assert!(matches!(who.state(&fp), Some(FetchState::Done { .. })));
    mock.assert_async().await;
}
