use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use serde_json::Value;
use tokio::sync::mpsc;
use warp::http::header::CONTENT_TYPE;
use warp::http::StatusCode;

use super::*;
use crate::config::CleanerConfig;
use crate::config::HijackConfig;
use crate::config::HubConfig;
use crate::config::RouteConfig;
use crate::route::HijackMode;
use crate::route::RoutePolicy;
use crate::store::MemoryStore;
use crate::store::MockCoordinationStore;
use crate::store::StoreEvent;
use crate::test_utils::hub_with;
use crate::test_utils::new_hub;
use crate::test_utils::seed;
use crate::test_utils::watch_context;
use crate::tree::TreeHub;
use crate::StoreError;
use crate::WatchError;

const URI: &str = "/api/data/long_polling?life_span=1";

fn service(
    hub: Arc<TreeHub>,
    policy: RoutePolicy,
) -> Arc<LongPollService> {
    Arc::new(LongPollService::new(watch_context(hub, policy), Duration::from_secs(60)))
}

fn default_policy() -> RoutePolicy {
    RoutePolicy::new(RouteConfig::default(), HijackConfig::default())
}

fn lines(body: &[u8]) -> Vec<Value> {
    body.split(|b| *b == b'\n')
        .filter(|line| !line.is_empty())
        .map(|line| serde_json::from_slice(line).unwrap())
        .collect()
}

#[tokio::test]
async fn test_stream_is_ndjson_and_ends_with_life_span() {
    let store = Arc::new(MemoryStore::new());
    seed(&store, &[("/config/app/stable/DB_URL", "mysql://")]).await;
    let filter = routes(service(new_hub(store), default_policy()));

    let response = warp::test::request()
        .method("POST")
        .path(URI)
        .body(r#"{"config": {"app": []}}"#)
        .reply(&filter)
        .await;

    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(response.headers()[CONTENT_TYPE], "application/x-ndjson");
    assert_eq!(
        lines(response.body()),
        vec![json!({
            "message": "all",
            "body": {"config": {"app": {"stable": {"DB_URL": {"value": "mysql://"}}}}}
        })]
    );
}

#[tokio::test]
async fn test_trigger_false_skips_initial_dump() {
    let store = Arc::new(MemoryStore::new());
    seed(&store, &[("/config/app/stable/DB_URL", "mysql://")]).await;
    let filter = routes(service(new_hub(store), default_policy()));

    let response = warp::test::request()
        .method("POST")
        .path("/api/data/long_polling?life_span=1&trigger=false")
        .body(r#"{"config": {"app": ["stable"]}}"#)
        .reply(&filter)
        .await;

    assert_eq!(response.status(), StatusCode::OK);
    assert!(lines(response.body()).is_empty());
}

#[tokio::test]
async fn test_invalid_requests_are_rejected_before_any_holder_exists() {
    let hub = new_hub(Arc::new(MemoryStore::new()));
    let filter = routes(service(hub.clone(), default_policy()));

    for body in [
        "not json",
        r#"{"metrics": {"app": []}}"#,
        r#"{"config": {"../app": []}}"#,
        r#"{"config": {"app": ["a/b"]}}"#,
        "{}",
    ] {
        let response = warp::test::request()
            .method("POST")
            .path(URI)
            .body(body)
            .reply(&filter)
            .await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST, "body {body}");
    }

    let response = warp::test::request()
        .method("POST")
        .path(URI)
        .header("x-soa-mode", "sideways")
        .body(r#"{"config": {"app": []}}"#)
        .reply(&filter)
        .await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    let error: Value = serde_json::from_slice(response.body()).unwrap();
    assert!(error["error"].as_str().unwrap().contains("route mode"));

    assert_eq!(hub.stats().holder_count, 0);
}

#[tokio::test]
async fn test_init_timeout_maps_to_gateway_timeout() {
    let mut store = MockCoordinationStore::new();
    let (_tx, rx) = mpsc::unbounded_channel::<StoreEvent>();
    let mut rx = Some(rx);
    store
        .expect_watch_subtree()
        .returning(move |_| rx.take().ok_or_else(|| StoreError::SessionClosed.into()));
    let config = HubConfig {
        init_timeout_in_ms: 50,
        ..HubConfig::default()
    };
    let hub = hub_with(Arc::new(store), config, CleanerConfig::default());
    let filter = routes(service(hub, default_policy()));

    let response = warp::test::request()
        .method("POST")
        .path(URI)
        .body(r#"{"switch": {"app": []}}"#)
        .reply(&filter)
        .await;

    assert_eq!(response.status(), StatusCode::GATEWAY_TIMEOUT);
}

#[tokio::test]
async fn test_hijacked_caller_receives_intent_data_under_requested_name() {
    let store = Arc::new(MemoryStore::new());
    seed(
        &store,
        &[
            ("/service/src/main", r#"{"route": {"dest": "blue"}}"#),
            ("/service/dest/blue/10.0.0.1_80", "blue"),
            ("/service/dest/old/10.0.0.9_80", "old"),
        ],
    )
    .await;
    let hijack = HijackConfig {
        modes: BTreeMap::from([("src".to_string(), HijackMode::Enabled)]),
        ..HijackConfig::default()
    };
    let filter = routes(service(new_hub(store), RoutePolicy::new(RouteConfig::default(), hijack)));

    let response = warp::test::request()
        .method("POST")
        .path(URI)
        .header("x-application-name", "src")
        .header("x-cluster-name", "main")
        .body(r#"{"service": {"dest": ["old"]}}"#)
        .reply(&filter)
        .await;

    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(
        lines(response.body())[0]["body"],
        json!({"service": {"dest": {"old": {"10.0.0.1_80": {"value": "blue"}}}}})
    );
}

#[tokio::test]
async fn test_force_routing_pins_requested_cluster() {
    let store = Arc::new(MemoryStore::new());
    seed(
        &store,
        &[
            ("/service/app/stable/10.0.0.1_80", "stable"),
            ("/service/app/canary/10.0.0.2_80", "canary"),
        ],
    )
    .await;
    let hijack = HijackConfig {
        force_routing_enabled: true,
        force_routing_clusters: BTreeMap::from([("stable".to_string(), "canary".to_string())]),
        ..HijackConfig::default()
    };
    let filter = routes(service(new_hub(store), RoutePolicy::new(RouteConfig::default(), hijack)));

    let response = warp::test::request()
        .method("POST")
        .path(URI)
        .body(r#"{"service": {"app": ["stable"]}}"#)
        .reply(&filter)
        .await;

    assert_eq!(
        lines(response.body())[0]["body"],
        json!({"service": {"app": {"stable": {"10.0.0.2_80": {"value": "canary"}}}}})
    );
}

#[tokio::test]
async fn test_reloaded_policy_applies_to_new_sessions() {
    let store = Arc::new(MemoryStore::new());
    seed(
        &store,
        &[
            ("/service/app/stable/10.0.0.1_80", "stable"),
            ("/service/app/canary/10.0.0.2_80", "canary"),
        ],
    )
    .await;
    let context = watch_context(new_hub(store), default_policy());
    let filter = routes(Arc::new(LongPollService::new(context.clone(), Duration::from_secs(60))));
    let open = || {
        warp::test::request()
            .method("POST")
            .path(URI)
            .body(r#"{"service": {"app": ["stable"]}}"#)
            .reply(&filter)
    };

    assert_eq!(
        lines(open().await.body())[0]["body"],
        json!({"service": {"app": {"stable": {"10.0.0.1_80": {"value": "stable"}}}}})
    );

    let hijack = HijackConfig {
        force_routing_enabled: true,
        force_routing_clusters: BTreeMap::from([("stable".to_string(), "canary".to_string())]),
        ..HijackConfig::default()
    };
    RoutePolicy::reload(&context.policy, RouteConfig::default(), hijack);

    assert_eq!(
        lines(open().await.body())[0]["body"],
        json!({"service": {"app": {"stable": {"10.0.0.2_80": {"value": "canary"}}}}})
    );
}

#[tokio::test]
async fn test_only_post_is_routed() {
    let filter = routes(service(new_hub(Arc::new(MemoryStore::new())), default_policy()));

    assert!(!warp::test::request()
        .method("GET")
        .path(URI)
        .matches(&filter)
        .await);
}

#[test]
fn test_status_mapping() {
    let invalid: crate::Error = WatchError::InvalidSubscription("x".to_string()).into();
    let timeout: crate::Error = WatchError::HolderInitTimeout {
        application: "app".to_string(),
        tree_type: crate::tree::TreeType::Config,
        timeout: Duration::from_millis(1),
    }
    .into();
    let closed: crate::Error = StoreError::SessionClosed.into();

    assert_eq!(status_for(&invalid), StatusCode::BAD_REQUEST);
    assert_eq!(status_for(&timeout), StatusCode::GATEWAY_TIMEOUT);
    assert_eq!(status_for(&closed), StatusCode::INTERNAL_SERVER_ERROR);
}
