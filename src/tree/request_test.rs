use super::*;
use crate::WatchError;

#[test]
fn test_parse_body() {
    let request = SubscriptionRequest::from_slice(
        br#"{"service": {"base.foo": ["stable", "direct"]}, "config": {"base.foo": []}}"#,
    )
    .unwrap();

    assert_eq!(request.len(), 2);
    let service = request.get(SubscriptionType::Service, "base.foo").unwrap();
    assert_eq!(
        service.clusters.iter().cloned().collect::<Vec<_>>(),
        vec!["direct".to_string(), "stable".to_string()]
    );
    assert!(request.get(SubscriptionType::Config, "base.foo").unwrap().is_all());
}

#[test]
fn test_parse_service_info() {
    let request = SubscriptionRequest::from_slice(br#"{"service_info": {"app": ["stable"]}}"#).unwrap();
    assert!(request.get(SubscriptionType::ServiceInfo, "app").is_some());
}

#[test]
fn test_rejects_unknown_type() {
    let err = SubscriptionRequest::from_slice(br#"{"secrets": {"app": []}}"#).unwrap_err();
    assert!(matches!(err, WatchError::InvalidSubscription(_)));
}

#[test]
fn test_rejects_malformed_body() {
    assert!(SubscriptionRequest::from_slice(b"[1, 2]").is_err());
    assert!(SubscriptionRequest::from_slice(br#"{"config": {"app": "stable"}}"#).is_err());
    assert!(SubscriptionRequest::from_slice(b"{}").is_err());
}

#[test]
fn test_rejects_path_like_names() {
    assert!(SubscriptionRequest::from_slice(br#"{"config": {"../etc": []}}"#).is_err());
    assert!(SubscriptionRequest::from_slice(br#"{"config": {"app": ["a/b"]}}"#).is_err());
    assert!(SubscriptionRequest::from_slice(br#"{"config": {"app": [""]}}"#).is_err());
}

#[test]
fn test_pin_cluster_adds_logical_name() {
    let mut request = SubscriptionRequest::new();
    request
        .pin_cluster(SubscriptionType::Service, "app", "alta1-stable", "altb1-stable")
        .unwrap();

    let selection = request.get(SubscriptionType::Service, "app").unwrap();
    assert!(selection.clusters.contains("alta1-stable"));
    assert!(selection.is_pinned("alta1-stable"));
    assert_eq!(selection.pinned["alta1-stable"], "altb1-stable");
}
