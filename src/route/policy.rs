use std::sync::Arc;

use arc_swap::ArcSwap;
use tracing::info;

use super::ezone;
use super::ForceRouting;
use super::HijackMode;
use crate::config::HijackConfig;
use crate::config::RouteConfig;
use crate::constants::ROUTE_INTENT_SEPARATOR;

/// Routing policy shared by every session.
///
/// A reload is picked up by sessions opened afterwards and by the next
/// re-resolution of running sessions; running sessions are not re-dumped
/// and keep the hijack decisions taken when they opened.
pub type SharedPolicy = Arc<ArcSwap<RoutePolicy>>;

/// Runtime view of the route and hijack configuration
#[derive(Debug, Clone)]
pub struct RoutePolicy {
    route: RouteConfig,
    hijack: HijackConfig,
    force: ForceRouting,
}

impl RoutePolicy {
    pub fn new(
        route: RouteConfig,
        hijack: HijackConfig,
    ) -> Self {
        let force = ForceRouting::from_config(&hijack);
        Self { route, hijack, force }
    }

    pub fn shared(
        route: RouteConfig,
        hijack: HijackConfig,
    ) -> SharedPolicy {
        Arc::new(ArcSwap::from_pointee(Self::new(route, hijack)))
    }

    /// Replaces the policy behind `shared`
    pub fn reload(
        shared: &SharedPolicy,
        route: RouteConfig,
        hijack: HijackConfig,
    ) {
        shared.store(Arc::new(Self::new(route, hijack)));
        info!("Routing policy reloaded");
    }

    pub fn is_intent(
        &self,
        cluster: &str,
    ) -> bool {
        self.route.intents.iter().any(|intent| intent == cluster)
    }

    pub fn ezones(&self) -> &[String] {
        &self.route.ezones
    }

    /// (outermost ezone, bare name) of a cluster name
    pub fn split_ezone<'a>(
        &self,
        cluster: &'a str,
    ) -> (Option<&'a str>, &'a str) {
        ezone::split_ezone(&self.route.ezones, cluster)
    }

    /// Global default route for `intent`, prefixed with the caller's ezone
    pub fn default_policy(
        &self,
        intent: &str,
        ezone: Option<&str>,
    ) -> Option<String> {
        let cluster = self.route.default_policy.get(intent)?;
        Some(match ezone {
            Some(ezone) => ezone::with_ezone(ezone, cluster),
            None => cluster.clone(),
        })
    }

    pub fn max_resolve_depth(&self) -> usize {
        self.route.max_resolve_depth
    }

    /// Intent hijacked subscriptions are routed through
    pub fn hijack_intent(&self) -> &str {
        &self.hijack.intent
    }

    /// Mode configured for a source: `app@cluster`, then `app`, then the
    /// ezone default of the source cluster, else disabled.
    pub fn hijack_mode(
        &self,
        source_app: &str,
        source_cluster: Option<&str>,
    ) -> HijackMode {
        if let Some(cluster) = source_cluster {
            let scoped = format!("{source_app}{ROUTE_INTENT_SEPARATOR}{cluster}");
            if let Some(mode) = self.hijack.modes.get(&scoped) {
                return *mode;
            }
        }
        if let Some(mode) = self.hijack.modes.get(source_app) {
            return *mode;
        }
        source_cluster
            .and_then(|cluster| self.split_ezone(cluster).0)
            .and_then(|ezone| self.hijack.ezone_defaults.get(ezone))
            .copied()
            .unwrap_or(HijackMode::Disabled)
    }

    /// Whether standalone hijack skips `source_app` when it consumes `dest_app`
    pub fn standalone_excludes(
        &self,
        dest_app: &str,
        source_app: &str,
    ) -> bool {
        self.hijack
            .standalone_exclusions
            .get(dest_app)
            .map(|sources| sources.iter().any(|s| s == source_app))
            .unwrap_or(false)
    }

    /// Force-routing table, `None` while the global switch is off
    pub fn force_routing(&self) -> Option<&ForceRouting> {
        self.hijack.force_routing_enabled.then_some(&self.force)
    }
}
