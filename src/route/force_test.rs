use std::collections::BTreeMap;

use super::*;
use crate::config::HijackConfig;
use crate::tree::SubscriptionRequest;
use crate::tree::SubscriptionType;

fn force_config() -> HijackConfig {
    HijackConfig {
        force_routing_enabled: true,
        force_routing_clusters: BTreeMap::from([
            ("stable".to_string(), "stable-pinned".to_string()),
            ("canary*".to_string(), "canary-pool".to_string()),
            ("canary-eu*".to_string(), "canary-eu-pool".to_string()),
        ]),
        force_routing_exclusions: BTreeMap::from([("legacy".to_string(), vec!["batch".to_string()])]),
        ..HijackConfig::default()
    }
}

#[test]
fn test_lookup_prefers_exact_then_longest_prefix() {
    let force = ForceRouting::from_config(&force_config());

    assert_eq!(force.lookup("stable"), Some("stable-pinned"));
    assert_eq!(force.lookup("stable-2"), None);
    assert_eq!(force.lookup("canary-us"), Some("canary-pool"));
    assert_eq!(force.lookup("canary-eu-1"), Some("canary-eu-pool"));
}

#[test]
fn test_apply_pins_service_clusters_only() {
    let force = ForceRouting::from_config(&force_config());
    let mut request = SubscriptionRequest::new();
    request.limit_cluster_name(SubscriptionType::Service, "app", "stable").unwrap();
    request.limit_cluster_name(SubscriptionType::Service, "app", "beta").unwrap();
    request.limit_cluster_name(SubscriptionType::Config, "app", "stable").unwrap();

    let pinned = force.apply(&mut request, Some("caller")).unwrap();

    assert_eq!(pinned, 1);
    let service = request.get(SubscriptionType::Service, "app").unwrap();
    assert_eq!(service.pinned.get("stable").map(String::as_str), Some("stable-pinned"));
    assert!(!service.is_pinned("beta"));
    assert!(request.get(SubscriptionType::Config, "app").unwrap().pinned.is_empty());
}

#[test]
fn test_excluded_source_is_left_alone() {
    let force = ForceRouting::from_config(&force_config());
    let mut request = SubscriptionRequest::new();
    request.limit_cluster_name(SubscriptionType::Service, "legacy", "stable").unwrap();

    assert_eq!(force.apply(&mut request, Some("batch")).unwrap(), 0);
    assert_eq!(force.apply(&mut request, None).unwrap(), 1);
    assert!(force.is_excluded("legacy", Some("batch")));
    assert!(!force.is_excluded("legacy", None));
}

#[test]
fn test_existing_pins_are_not_overridden() {
    let force = ForceRouting::from_config(&force_config());
    let mut request = SubscriptionRequest::new();
    request
        .pin_cluster(SubscriptionType::Service, "app", "stable", "manual")
        .unwrap();

    assert_eq!(force.apply(&mut request, None).unwrap(), 0);
    let selection = request.get(SubscriptionType::Service, "app").unwrap();
    assert_eq!(selection.pinned["stable"], "manual");
}

#[test]
fn test_policy_exposes_force_routing_only_when_enabled() {
    let disabled = HijackConfig {
        force_routing_enabled: false,
        ..force_config()
    };
    let policy = RoutePolicy::new(crate::config::RouteConfig::default(), disabled);
    assert!(policy.force_routing().is_none());

    let policy = RoutePolicy::new(crate::config::RouteConfig::default(), force_config());
    assert_eq!(policy.force_routing().unwrap().lookup("stable"), Some("stable-pinned"));
}
