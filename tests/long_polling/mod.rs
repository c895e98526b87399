use std::time::Duration;

use arbor::server::routes;
use arbor::store::CoordinationStore;
use arbor::tree::TreeType;
use serde_json::json;
use serde_json::Value;
use warp::http::StatusCode;

use crate::common::lines;
use crate::common::start;
use crate::common::test_config;

const URI: &str = "/api/data/long_polling?life_span=1";

#[tokio::test]
async fn test_session_streams_initial_dump_and_changes_until_life_span_ends() {
    let server = start(test_config(), &[("/config/app/stable/DB_URL", "mysql://a")]).await;
    let filter = routes(server.service.clone());

    let store = server.store.clone();
    let writer = tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(200)).await;
        store.set("/config/app/stable/DB_URL", "mysql://b", None).await.unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
        store.delete("/config/app/stable/DB_URL", None, false).await.unwrap();
    });

    let response = warp::test::request()
        .method("POST")
        .path(URI)
        .body(r#"{"config": {"app": ["stable"]}}"#)
        .reply(&filter)
        .await;
    writer.await.unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(
        lines(response.body()),
        vec![
            json!({"message": "all", "body": {"config": {"app": {"stable": {"DB_URL": {"value": "mysql://a"}}}}}}),
            json!({"message": "update", "body": {"config": {"app": {"stable": {"DB_URL": {"value": "mysql://b"}}}}}}),
            json!({"message": "delete", "body": {"config": {"app": {"stable": {"DB_URL": {"value": null}}}}}}),
        ]
    );
}

#[tokio::test]
async fn test_concurrent_sessions_share_one_holder_and_release_it() {
    let server = start(test_config(), &[("/switch/app/stable/ON", "1")]).await;
    let filter = routes(server.service.clone());

    let request = || {
        warp::test::request()
            .method("POST")
            .path(URI)
            .body(r#"{"switch": {"app": []}}"#)
            .reply(&filter)
    };
    let (first, second) = tokio::join!(request(), request());

    assert_eq!(first.status(), StatusCode::OK);
    assert_eq!(first.body(), second.body());
    assert_eq!(server.hub.stats().holder_count, 1);

    let released = async {
        while server.hub.reference_count("app", TreeType::Switch) != Some(0) {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    };
    tokio::time::timeout(Duration::from_secs(2), released).await.unwrap();
}

#[tokio::test]
async fn test_routed_caller_has_dependency_recorded_on_target_cluster() {
    let mut config = test_config();
    config.dependency.enabled = true;
    let server = start(
        config,
        &[
            ("/service/src/main", ""),
            ("/service/dest/blue", r#"{"info": {"owner": "infra"}}"#),
            ("/service/dest/blue/10.0.0.1_80", "up"),
        ],
    )
    .await;
    let filter = routes(server.service.clone());

    let response = warp::test::request()
        .method("POST")
        .path(URI)
        .header("x-application-name", "src")
        .header("x-cluster-name", "main")
        .body(r#"{"service": {"dest": ["blue"]}}"#)
        .reply(&filter)
        .await;

    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(
        lines(response.body())[0]["body"],
        json!({"service": {"dest": {"blue": {"10.0.0.1_80": {"value": "up"}}}}})
    );

    let node = server.store.get("/service/dest/blue").await.unwrap().unwrap();
    let meta: Value = serde_json::from_str(&node.value).unwrap();
    assert_eq!(meta["dependency"], json!({"src": ["main"]}));
    assert_eq!(meta["info"], json!({"owner": "infra"}));
}

#[tokio::test]
async fn test_errors_are_reported_before_streaming() {
    let server = start(test_config(), &[]).await;
    let filter = routes(server.service.clone());

    let response = warp::test::request()
        .method("POST")
        .path(URI)
        .header("x-soa-mode", "route")
        .header("x-application-name", "bad/name")
        .header("x-cluster-name", "main")
        .body(r#"{"service": {"dest": []}}"#)
        .reply(&filter)
        .await;

    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    let error: Value = serde_json::from_slice(response.body()).unwrap();
    assert!(error["error"].is_string());
    assert_eq!(server.hub.stats().holder_count, 0);
}
