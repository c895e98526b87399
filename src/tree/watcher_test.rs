use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use tokio_stream::StreamExt;

use super::*;
use crate::config::HijackConfig;
use crate::dependency::Declaration;
use crate::dependency::MockDependencyRecorder;
use crate::route::RouteContext;
use crate::route::RouteMode;
use crate::store::CoordinationStore;
use crate::store::MemoryStore;
use crate::test_utils::new_hub;
use crate::test_utils::policy;
use crate::test_utils::route_config;
use crate::test_utils::seed;
use crate::test_utils::watch_context;
use crate::test_utils::TEST_TIMEOUT;
use crate::Error;
use crate::WatchError;

fn initial() -> WatcherOptions {
    WatcherOptions {
        with_initial: true,
        ..WatcherOptions::default()
    }
}

async fn setup(nodes: &[(&str, &str)]) -> (Arc<MemoryStore>, Arc<WatchContext>) {
    let store = Arc::new(MemoryStore::new());
    seed(&store, nodes).await;
    let hub = new_hub(store.clone());
    let context = watch_context(hub, policy(route_config(&[]), HijackConfig::default()));
    (store, context)
}

async fn next(stream: &mut WatchStream) -> WatchMessage {
    tokio::time::timeout(TEST_TIMEOUT, stream.next())
        .await
        .expect("no message in time")
        .expect("stream ended")
}

async fn ends(stream: &mut WatchStream) {
    let item = tokio::time::timeout(TEST_TIMEOUT, stream.next())
        .await
        .expect("stream did not end in time");
    assert!(item.is_none(), "unexpected message {item:?}");
}

#[tokio::test]
async fn test_initial_dump_then_key_update() {
    let (store, context) = setup(&[
        ("/config/app/stable/DB_URL", "mysql://a"),
        ("/config/app/foo", ""),
    ])
    .await;
    let mut watcher = TreeWatcher::new(context, initial());
    watcher.watch("app", SubscriptionType::Config).unwrap();
    let mut stream = watcher.start().await.unwrap();

    let all = next(&mut stream).await;
    assert_eq!(all.message, MessageType::All);
    assert_eq!(
        all.body,
        json!({"config": {"app": {
            "foo": {},
            "stable": {"DB_URL": {"value": "mysql://a"}}
        }}})
    );

    store.set("/config/app/stable/DB_URL", "mysql://b", None).await.unwrap();
    let update = next(&mut stream).await;
    assert_eq!(update.message, MessageType::Update);
    assert_eq!(
        update.body,
        json!({"config": {"app": {"stable": {"DB_URL": {"value": "mysql://b"}}}}})
    );

    store.delete("/config/app/stable/DB_URL", None, false).await.unwrap();
    let delete = next(&mut stream).await;
    assert_eq!(delete.message, MessageType::Delete);
    assert_eq!(
        delete.body,
        json!({"config": {"app": {"stable": {"DB_URL": {"value": null}}}}})
    );
}

#[tokio::test]
async fn test_limited_clusters_filter_updates() {
    let (store, context) = setup(&[("/switch/app/stable/ON", "1"), ("/switch/app/beta/ON", "0")]).await;
    let mut watcher = TreeWatcher::new(context, initial());
    watcher.limit_cluster_name("app", SubscriptionType::Switch, "stable").unwrap();
    watcher.limit_cluster_name("app", SubscriptionType::Switch, "missing").unwrap();
    let mut stream = watcher.start().await.unwrap();

    assert_eq!(
        next(&mut stream).await.body,
        json!({"switch": {"app": {"stable": {"ON": {"value": "1"}}, "missing": {}}}})
    );

    store.set("/switch/app/beta/ON", "1", None).await.unwrap();
    store.set("/switch/app/stable/ON", "2", None).await.unwrap();

    let update = next(&mut stream).await;
    assert_eq!(update.body, json!({"switch": {"app": {"stable": {"ON": {"value": "2"}}}}}));
}

#[tokio::test]
async fn test_updates_arrive_in_commit_order() {
    let (store, context) = setup(&[("/config/app/stable/N", "0")]).await;
    let mut watcher = TreeWatcher::new(context, WatcherOptions::default());
    watcher.watch("app", SubscriptionType::Config).unwrap();
    let mut stream = watcher.start().await.unwrap();

    for i in 1..=5 {
        store.set("/config/app/stable/N", &i.to_string(), None).await.unwrap();
    }

    for i in 1..=5 {
        let message = next(&mut stream).await;
        assert_eq!(message.message, MessageType::Update);
        assert_eq!(message.body["config"]["app"]["stable"]["N"]["value"], i.to_string());
    }
}

#[tokio::test]
async fn test_metadata_write_without_routing_change_keeps_key_updates() {
    let (store, context) = setup(&[("/config/app/stable", "")]).await;
    let mut watcher = TreeWatcher::new(context, WatcherOptions::default());
    watcher.watch("app", SubscriptionType::Config).unwrap();
    let mut stream = watcher.start().await.unwrap();

    store.set("/config/app/stable", r#"{"info": {"x": 1}}"#, None).await.unwrap();
    store.create("/config/app/stable/DB_URL", "mysql://", false).await.unwrap();

    let update = next(&mut stream).await;
    assert_eq!(update.message, MessageType::Update);
    assert_eq!(
        update.body,
        json!({"config": {"app": {"stable": {"DB_URL": {"value": "mysql://"}}}}})
    );
}

#[tokio::test]
async fn test_dependency_write_keeps_concurrent_instance_updates() {
    let (store, context) = setup(&[("/service/app/stable/10.0.0.1_80", "up")]).await;
    let mut watcher = TreeWatcher::new(context, WatcherOptions::default());
    watcher.watch("app", SubscriptionType::Service).unwrap();
    let mut stream = watcher.start().await.unwrap();

    store
        .set("/service/app/stable", r#"{"dependency": {"src": ["main"]}}"#, None)
        .await
        .unwrap();
    store.create("/service/app/stable/10.0.0.2_80", "up", false).await.unwrap();
    store.set("/service/app/stable/10.0.0.1_80", "down", None).await.unwrap();

    let created = next(&mut stream).await;
    assert_eq!(
        created.body,
        json!({"service": {"app": {"stable": {"10.0.0.2_80": {"value": "up"}}}}})
    );
    let updated = next(&mut stream).await;
    assert_eq!(
        updated.body,
        json!({"service": {"app": {"stable": {"10.0.0.1_80": {"value": "down"}}}}})
    );
}

#[tokio::test]
async fn test_symlink_removal_redumps_logical_cluster() {
    let (store, context) = setup(&[
        ("/service/app/stable", r#"{"link": ["bar"]}"#),
        ("/service/app/bar/10.0.0.1_80", "up"),
    ])
    .await;
    let mut watcher = TreeWatcher::new(context, initial());
    watcher.limit_cluster_name("app", SubscriptionType::Service, "stable").unwrap();
    let mut stream = watcher.start().await.unwrap();

    assert_eq!(
        next(&mut stream).await.body,
        json!({"service": {"app": {"stable": {"10.0.0.1_80": {"value": "up"}}}}})
    );

    store.set("/service/app/bar/10.0.0.1_80", "down", None).await.unwrap();
    let update = next(&mut stream).await;
    assert_eq!(update.message, MessageType::Update);
    assert_eq!(
        update.body,
        json!({"service": {"app": {"stable": {"10.0.0.1_80": {"value": "down"}}}}})
    );

    store.delete("/service/app/stable", None, false).await.unwrap();
    let redump = next(&mut stream).await;
    assert_eq!(redump.message, MessageType::All);
    assert_eq!(redump.body, json!({"service": {"app": {"stable": {}}}}));
}

#[tokio::test]
async fn test_route_mode_follows_source_route_changes() {
    let (store, context) = setup(&[
        ("/service/src/main", r#"{"route": {"dest": "blue"}}"#),
        ("/service/dest/blue/10.0.0.1_80", "b"),
        ("/service/dest/green/10.0.0.2_80", "g"),
    ])
    .await;
    let options = WatcherOptions {
        with_initial: true,
        source: Some(RouteContext::new("src", "main")),
        route_mode: RouteMode::Route,
        ..WatcherOptions::default()
    };
    let mut watcher = TreeWatcher::new(context, options);
    watcher.limit_cluster_name("dest", SubscriptionType::Service, "direct").unwrap();
    let mut stream = watcher.start().await.unwrap();

    assert_eq!(
        next(&mut stream).await.body,
        json!({"service": {"dest": {"direct": {"10.0.0.1_80": {"value": "b"}}}}})
    );

    store
        .set("/service/src/main", r#"{"route": {"dest": "green"}}"#, None)
        .await
        .unwrap();
    let redump = next(&mut stream).await;
    assert_eq!(redump.message, MessageType::All);
    assert_eq!(
        redump.body,
        json!({"service": {"dest": {"direct": {"10.0.0.2_80": {"value": "g"}}}}})
    );
}

#[tokio::test]
async fn test_pinned_cluster_bypasses_resolution() {
    let (_store, context) = setup(&[
        ("/service/app/stable", r#"{"link": ["bar"]}"#),
        ("/service/app/bar/10.0.0.1_80", "bar"),
        ("/service/app/canary/10.0.0.9_80", "canary"),
    ])
    .await;
    let mut watcher = TreeWatcher::new(context, initial());
    watcher
        .pin_cluster("app", SubscriptionType::Service, "stable", "canary")
        .unwrap();
    let mut stream = watcher.start().await.unwrap();

    assert_eq!(
        next(&mut stream).await.body,
        json!({"service": {"app": {"stable": {"10.0.0.9_80": {"value": "canary"}}}}})
    );
}

#[tokio::test]
async fn test_service_info_redumps_on_metadata_change() {
    let (store, context) = setup(&[("/service/app/stable", r#"{"info": {"owner": "infra"}}"#)]).await;
    let mut watcher = TreeWatcher::new(context, initial());
    watcher.watch("app", SubscriptionType::ServiceInfo).unwrap();
    let mut stream = watcher.start().await.unwrap();

    assert_eq!(
        next(&mut stream).await.body,
        json!({"service_info": {"app": {"stable": {"owner": "infra"}}}})
    );

    store
        .set("/service/app/stable", r#"{"info": {"owner": "search"}}"#, None)
        .await
        .unwrap();
    let redump = next(&mut stream).await;
    assert_eq!(redump.message, MessageType::All);
    assert_eq!(
        redump.body,
        json!({"service_info": {"app": {"stable": {"owner": "search"}}}})
    );
}

#[tokio::test]
async fn test_holder_close_ends_stream() {
    let (_store, context) = setup(&[("/config/app/stable/A", "1")]).await;
    let hub = context.hub.clone();
    let mut watcher = TreeWatcher::new(context, WatcherOptions::default());
    watcher.watch("app", SubscriptionType::Config).unwrap();
    let mut stream = watcher.start().await.unwrap();

    hub.holder("app", TreeType::Config).unwrap().close();

    ends(&mut stream).await;
}

#[tokio::test]
async fn test_life_span_ends_stream() {
    let (_store, context) = setup(&[("/config/app/stable/A", "1")]).await;
    let options = WatcherOptions {
        life_span: Some(Duration::from_millis(50)),
        ..initial()
    };
    let mut watcher = TreeWatcher::new(context, options);
    watcher.watch("app", SubscriptionType::Config).unwrap();
    let mut stream = watcher.start().await.unwrap();

    assert_eq!(next(&mut stream).await.message, MessageType::All);
    ends(&mut stream).await;
}

#[tokio::test]
async fn test_close_cancels_session() {
    let (_store, context) = setup(&[("/config/app/stable/A", "1")]).await;
    let mut watcher = TreeWatcher::new(context, WatcherOptions::default());
    watcher.watch("app", SubscriptionType::Config).unwrap();
    let mut stream = watcher.start().await.unwrap();

    watcher.close();

    ends(&mut stream).await;
    let err = watcher.watch("other", SubscriptionType::Config).unwrap_err();
    assert!(matches!(err, Error::Watch(WatchError::IllegalState("closed"))));
}

#[tokio::test]
async fn test_watchers_share_holder_and_release_on_drop() {
    let (_store, context) = setup(&[("/config/app/stable/A", "1")]).await;
    let hub = context.hub.clone();

    let mut first = TreeWatcher::new(context.clone(), WatcherOptions::default());
    first.watch("app", SubscriptionType::Config).unwrap();
    let first_stream = first.start().await.unwrap();
    let mut second = TreeWatcher::new(context, WatcherOptions::default());
    second.watch("app", SubscriptionType::Config).unwrap();
    let second_stream = second.start().await.unwrap();

    assert_ne!(first.id(), second.id());
    assert_eq!(hub.reference_count("app", TreeType::Config), Some(2));
    assert_eq!(hub.stats().holder_count, 1);

    drop(first_stream);
    drop(second_stream);
    tokio::time::timeout(TEST_TIMEOUT, async {
        while hub.reference_count("app", TreeType::Config) != Some(0) {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .unwrap();
}

#[tokio::test]
async fn test_start_rejects_empty_and_repeated_starts() {
    let (_store, context) = setup(&[]).await;
    let mut empty = TreeWatcher::new(context.clone(), WatcherOptions::default());
    let err = empty.start().await.unwrap_err();
    assert!(matches!(err, Error::Watch(WatchError::InvalidSubscription(_))));

    let mut watcher = TreeWatcher::new(context, WatcherOptions::default());
    watcher.watch("app", SubscriptionType::Config).unwrap();
    let _stream = watcher.start().await.unwrap();
    let err = watcher.start().await.unwrap_err();
    assert!(matches!(err, Error::Watch(WatchError::IllegalState("started"))));
}

#[tokio::test]
async fn test_apply_request_merges_parsed_body() {
    let (_store, context) = setup(&[("/config/app/stable/A", "1"), ("/switch/app/stable/ON", "1")]).await;
    let request = SubscriptionRequest::from_slice(br#"{"config": {"app": ["stable"]}, "switch": {"app": []}}"#).unwrap();
    let mut watcher = TreeWatcher::new(context, initial());
    watcher.apply_request(&request).unwrap();
    let mut stream = watcher.start().await.unwrap();

    assert_eq!(
        next(&mut stream).await.body,
        json!({
            "config": {"app": {"stable": {"A": {"value": "1"}}}},
            "switch": {"app": {"stable": {"ON": {"value": "1"}}}}
        })
    );
}

#[tokio::test]
async fn test_resolved_service_clusters_are_declared_as_dependencies() {
    let (_store, context) = setup(&[
        ("/service/src/main", r#"{"route": {"dest": "blue"}}"#),
        ("/service/dest/blue/10.0.0.1_80", "b"),
    ])
    .await;
    let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
    let mut recorder = MockDependencyRecorder::new();
    recorder
        .expect_declare()
        .returning(move |application, cluster, consumer_app, consumer_cluster| {
            tx.send(format!("{application}/{cluster} <- {consumer_app}/{consumer_cluster}"))
                .unwrap();
            Ok(Declaration::Recorded)
        });
    let context = Arc::new(WatchContext {
        hub: context.hub.clone(),
        policy: context.policy.clone(),
        config: context.config.clone(),
        dependency: Some(Arc::new(recorder)),
    });
    let options = WatcherOptions {
        source: Some(RouteContext::new("src", "main")),
        route_mode: RouteMode::Route,
        ..WatcherOptions::default()
    };
    let mut watcher = TreeWatcher::new(context, options);
    watcher.limit_cluster_name("dest", SubscriptionType::Service, "direct").unwrap();
    let _stream = watcher.start().await.unwrap();

    let declared = tokio::time::timeout(TEST_TIMEOUT, rx.recv()).await.unwrap().unwrap();
    assert_eq!(declared, "dest/blue <- src/main");
}
