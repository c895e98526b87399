//! Traffic hijack for cluster migration.
//!
//! A hijacked session keeps asking for its old physical clusters while the
//! data it receives comes from the cluster its route intent resolves to.
//! Per destination application the session is in one of four modes:
//!
//! - `Disabled`: requests and messages pass through untouched
//! - `Checking`: the intent is subscribed on the side and diagnosed, but
//!   clients never see it
//! - `Enabled`: the intent cluster's data is served under every requested
//!   physical name
//! - `Standalone`: like `Enabled`, unless the destination excludes the caller
//!
//! Diagnostics never fail the request.

use std::collections::BTreeMap;
use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;

use futures::Stream;
use futures::StreamExt;
use serde::Deserialize;
use serde::Serialize;
use serde_json::Value;
use tracing::debug;
use tracing::info;
use tracing::warn;

use super::ClusterResolver;
use super::ResolveOptions;
use super::RouteContext;
use super::RouteMode;
use super::RoutePolicy;
use super::SourceRoute;
use crate::metrics::HIJACK_DIAGNOSTICS;
use crate::tree::MessageType;
use crate::tree::MirrorTree;
use crate::tree::SubscriptionRequest;
use crate::tree::SubscriptionType;
use crate::tree::TreeHub;
use crate::tree::TreeType;
use crate::tree::WatchMessage;
use crate::Result;

/// Hijack mode codes; configuration accepts `D`/`C`/`E`/`S` or the full name
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum HijackMode {
    #[default]
    #[serde(rename = "D", alias = "disabled")]
    Disabled,
    #[serde(rename = "C", alias = "checking")]
    Checking,
    #[serde(rename = "E", alias = "enabled")]
    Enabled,
    #[serde(rename = "S", alias = "standalone")]
    Standalone,
}

impl HijackMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            HijackMode::Disabled => "disabled",
            HijackMode::Checking => "checking",
            HijackMode::Enabled => "enabled",
            HijackMode::Standalone => "standalone",
        }
    }

    /// Whether messages are rewritten onto the hijacked clusters
    pub fn rewrites(&self) -> bool {
        matches!(self, HijackMode::Enabled | HijackMode::Standalone)
    }
}

impl fmt::Display for HijackMode {
    fn fmt(
        &self,
        f: &mut fmt::Formatter<'_>,
    ) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Routing inconsistency found while preparing a destination
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HijackDiagnostic {
    /// Requested clusters do not resolve to exactly one physical cluster
    Unstable,
    /// Requested clusters resolve somewhere else than the intent
    Mismatch,
}

impl HijackDiagnostic {
    pub fn as_str(&self) -> &'static str {
        match self {
            HijackDiagnostic::Unstable => "unstable",
            HijackDiagnostic::Mismatch => "mismatch",
        }
    }
}

/// Hijack decision for one destination application
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DestinationHijack {
    pub mode: HijackMode,
    /// Requested clusters served from the intent cluster
    pub clusters: BTreeSet<String>,
    /// The client asked for the intent cluster itself
    pub intent_explicit: bool,
    pub diagnostics: Vec<HijackDiagnostic>,
}

/// Per-session hijack state
#[derive(Debug, Clone)]
pub struct RouteHijack {
    policy: Arc<RoutePolicy>,
    source: Option<RouteContext>,
    route_mode: RouteMode,
    intent: String,
    destinations: BTreeMap<String, DestinationHijack>,
}

impl RouteHijack {
    pub fn new(
        policy: Arc<RoutePolicy>,
        source: Option<RouteContext>,
        route_mode: RouteMode,
    ) -> Self {
        let intent = policy.hijack_intent().to_string();
        Self {
            policy,
            source,
            route_mode,
            intent,
            destinations: BTreeMap::new(),
        }
    }

    pub fn intent(&self) -> &str {
        &self.intent
    }

    pub fn destination(
        &self,
        application: &str,
    ) -> Option<&DestinationHijack> {
        self.destinations.get(application)
    }

    /// Whether any destination of this session is hijacked or checked
    pub fn is_active(&self) -> bool {
        self.destinations.values().any(|d| d.mode != HijackMode::Disabled)
    }

    /// Configured mode for `dest_app`, before diagnostics.
    ///
    /// Route-mode sessions already resolve intents themselves and sessions
    /// without a declared caller have nothing to route by.
    pub fn mode_for(
        &self,
        dest_app: &str,
    ) -> HijackMode {
        if self.route_mode == RouteMode::Route {
            return HijackMode::Disabled;
        }
        let Some(source) = &self.source else {
            return HijackMode::Disabled;
        };
        match self.policy.hijack_mode(&source.application, Some(&source.cluster)) {
            HijackMode::Standalone if self.policy.standalone_excludes(dest_app, &source.application) => {
                HijackMode::Disabled
            }
            mode => mode,
        }
    }

    /// Decides the mode of every service destination and diagnoses routing.
    ///
    /// Failures while loading trees disable hijack for that destination.
    pub async fn prepare(
        &mut self,
        hub: &Arc<TreeHub>,
        request: &SubscriptionRequest,
    ) {
        let Some(source) = self.source.clone() else {
            return;
        };

        for (sub_type, application, selection) in request.iter() {
            if sub_type != SubscriptionType::Service {
                continue;
            }
            let mode = self.mode_for(application);
            if mode == HijackMode::Disabled {
                continue;
            }
            let clusters: BTreeSet<String> = selection
                .clusters
                .iter()
                .filter(|c| !selection.is_pinned(c) && !self.policy.is_intent(c))
                .cloned()
                .collect();
            if clusters.is_empty() {
                continue;
            }

            let mut destination = DestinationHijack {
                mode,
                clusters,
                intent_explicit: selection.clusters.contains(&self.intent),
                diagnostics: Vec::new(),
            };

            match self.diagnose(hub, application, &source, &mut destination).await {
                Ok(()) => {
                    debug!(application, mode = %destination.mode, "Hijack prepared");
                    self.destinations.insert(application.to_string(), destination);
                }
                Err(e) => {
                    warn!(application, error = %e, "Hijack preparation failed, destination left untouched");
                }
            }
        }
    }

    async fn diagnose(
        &self,
        hub: &Arc<TreeHub>,
        application: &str,
        source: &RouteContext,
        destination: &mut DestinationHijack,
    ) -> Result<()> {
        let source_lease = hub.get_or_create(&source.application, TreeType::Service).await?;
        let dest_lease = hub.get_or_create(application, TreeType::Service).await?;

        let source_route = {
            let tree = source_lease.holder().read();
            SourceRoute::from_tree(&tree, &self.policy, &source.application, &source.cluster)
        };
        let tree = dest_lease.holder().read();
        self.diagnose_snapshot(application, &tree, &source_route, destination);
        Ok(())
    }

    fn diagnose_snapshot(
        &self,
        application: &str,
        tree: &MirrorTree,
        source: &SourceRoute,
        destination: &mut DestinationHijack,
    ) {
        let resolver = ClusterResolver::new(application, tree, &self.policy);
        let intent_target = resolver
            .resolve(
                &self.intent,
                ResolveOptions {
                    source: Some(source),
                    intent_routing: true,
                    ezone_prefix: false,
                },
            )
            .filter(|physical| !physical.is_empty());

        let Some(intent_target) = intent_target else {
            if destination.mode.rewrites() {
                warn!(
                    application,
                    source = %source.cluster,
                    intent = %self.intent,
                    "Intent does not resolve, hijack downgraded to checking"
                );
            }
            destination.mode = HijackMode::Checking;
            return;
        };

        let options = ResolveOptions {
            source: Some(source),
            intent_routing: false,
            ezone_prefix: self.route_mode == RouteMode::Prefix,
        };
        let mut physical: BTreeSet<String> = BTreeSet::new();
        let mut unresolved = false;
        for cluster in &destination.clusters {
            match resolver.resolve(cluster, options) {
                Some(names) => physical.extend(names),
                None => unresolved = true,
            }
        }

        let intent_set: BTreeSet<String> = intent_target.iter().cloned().collect();
        if unresolved || physical.len() != 1 {
            self.report(HijackDiagnostic::Unstable, application, source, destination, &physical, &intent_set);
        } else if physical != intent_set {
            self.report(HijackDiagnostic::Mismatch, application, source, destination, &physical, &intent_set);
        }
    }

    fn report(
        &self,
        diagnostic: HijackDiagnostic,
        application: &str,
        source: &SourceRoute,
        destination: &mut DestinationHijack,
        physical: &BTreeSet<String>,
        intent: &BTreeSet<String>,
    ) {
        HIJACK_DIAGNOSTICS
            .with_label_values(&[diagnostic.as_str(), destination.mode.as_str()])
            .inc();
        destination.diagnostics.push(diagnostic);

        if destination.mode.rewrites() {
            warn!(
                alert = true,
                kind = diagnostic.as_str(),
                mode = %destination.mode,
                application,
                source_application = %source.application,
                source_cluster = %source.cluster,
                ?physical,
                ?intent,
                "Hijacked route inconsistent"
            );
        } else {
            info!(
                kind = diagnostic.as_str(),
                mode = %destination.mode,
                application,
                source_cluster = %source.cluster,
                ?physical,
                ?intent,
                "Route inconsistency under check"
            );
        }
    }

    /// Adds the intent cluster to every hijacked service subscription.
    ///
    /// Explicitly requested clusters are never removed.
    pub fn hijack_request(
        &self,
        request: &mut SubscriptionRequest,
    ) -> Result<()> {
        for (application, destination) in &self.destinations {
            if destination.mode == HijackMode::Disabled {
                continue;
            }
            request.limit_cluster_name(SubscriptionType::Service, application, &self.intent)?;
            if let Some(selection) = request.get_mut(SubscriptionType::Service, application) {
                selection.intent_routing = true;
            }
        }
        Ok(())
    }

    /// Wraps a watch stream with [`Self::rewrite`]
    pub fn hijack_response<S>(
        self,
        stream: S,
    ) -> impl Stream<Item = WatchMessage> + Send + 'static
    where
        S: Stream<Item = WatchMessage> + Send + 'static,
    {
        stream.filter_map(move |message| futures::future::ready(self.rewrite(message)))
    }

    /// Projects one message; `None` when nothing is left to deliver
    pub fn rewrite(
        &self,
        mut message: WatchMessage,
    ) -> Option<WatchMessage> {
        if message.message == MessageType::Ping || !self.is_active() {
            return Some(message);
        }

        let kind = message.message;
        for (application, destination) in &self.destinations {
            if destination.mode == HijackMode::Disabled {
                continue;
            }
            let Some(clusters) = message.clusters_mut(SubscriptionType::Service, application) else {
                continue;
            };

            let intent_data: Option<Value> = if destination.intent_explicit {
                clusters.get(&self.intent).cloned()
            } else {
                clusters.remove(&self.intent)
            };

            if !destination.mode.rewrites() {
                continue;
            }
            match kind {
                MessageType::All => {
                    if let Some(data) = intent_data {
                        for cluster in &destination.clusters {
                            clusters.insert(cluster.clone(), data.clone());
                        }
                    }
                }
                _ => {
                    for cluster in &destination.clusters {
                        clusters.remove(cluster);
                    }
                    if let Some(data) = intent_data {
                        for cluster in &destination.clusters {
                            clusters.insert(cluster.clone(), data.clone());
                        }
                    }
                }
            }
        }

        if kind == MessageType::All {
            return Some(message);
        }
        message.prune_empty_sections();
        message.has_entries().then_some(message)
    }
}
