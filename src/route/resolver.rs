//! Cluster name resolution.
//!
//! A requested name is either an intent token, resolved through the caller's
//! route table and the destination's default routes, or a cluster name whose
//! `link` metadata is followed to the physical clusters serving it. The
//! resolver is a pure function of one tree snapshot and the policy; callers
//! re-run it whenever routing metadata changes instead of caching results.

use std::fmt;
use std::str::FromStr;

use tracing::debug;
use tracing::warn;

use super::ezone;
use super::ApplicationMeta;
use super::ClusterMeta;
use super::RoutePolicy;
use crate::tree::MirrorTree;
use crate::WatchError;

/// How the caller wants cluster names interpreted (`X-SOA-Mode`)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RouteMode {
    /// Names are taken literally, symlinks still apply
    #[default]
    Orig,
    /// Bare names are tried with the caller's ezone prefix first
    Prefix,
    /// Intent tokens are resolved through route tables
    Route,
}

impl RouteMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            RouteMode::Orig => "orig",
            RouteMode::Prefix => "prefix",
            RouteMode::Route => "route",
        }
    }
}

impl fmt::Display for RouteMode {
    fn fmt(
        &self,
        f: &mut fmt::Formatter<'_>,
    ) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RouteMode {
    type Err = WatchError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "" | "orig" => Ok(RouteMode::Orig),
            "prefix" => Ok(RouteMode::Prefix),
            "route" => Ok(RouteMode::Route),
            other => Err(WatchError::InvalidSubscription(format!("unknown route mode '{other}'"))),
        }
    }
}

/// Caller identity declared by request headers
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RouteContext {
    pub application: String,
    pub cluster: String,
}

impl RouteContext {
    pub fn new(
        application: impl Into<String>,
        cluster: impl Into<String>,
    ) -> Self {
        Self {
            application: application.into(),
            cluster: cluster.into(),
        }
    }
}

/// The caller's identity plus the routing metadata of its own cluster.
///
/// Extracted from the caller's service tree before any destination tree is
/// read, so resolution never holds two tree locks at once.
#[derive(Debug, Clone, PartialEq)]
pub struct SourceRoute {
    pub application: String,
    pub cluster: String,
    /// Known ezone prefixes of the caller cluster, outermost first
    pub ezones: Vec<String>,
    pub meta: ClusterMeta,
}

impl SourceRoute {
    pub fn new(
        policy: &RoutePolicy,
        application: &str,
        cluster: &str,
    ) -> Self {
        let ezones = ezone::ezone_chain(policy.ezones(), cluster)
            .into_iter()
            .map(str::to_string)
            .collect();
        Self {
            application: application.to_string(),
            cluster: cluster.to_string(),
            ezones,
            meta: ClusterMeta::default(),
        }
    }

    /// Reads the caller cluster's metadata from the caller's service tree
    pub fn from_tree(
        tree: &MirrorTree,
        policy: &RoutePolicy,
        application: &str,
        cluster: &str,
    ) -> Self {
        let mut source = Self::new(policy, application, cluster);
        if let Some(node) = tree.cluster(cluster) {
            let path = format!("{}/{}", tree.root(), cluster);
            source.meta = ClusterMeta::parse(node.value(), &path);
        }
        source
    }

    /// Outermost ezone of the caller cluster
    pub fn ezone(&self) -> Option<&str> {
        self.ezones.first().map(String::as_str)
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct ResolveOptions<'a> {
    pub source: Option<&'a SourceRoute>,
    /// Resolve intent tokens; otherwise they are treated as cluster names
    pub intent_routing: bool,
    /// Try `<source ezone>-<name>` before `<name>`
    pub ezone_prefix: bool,
}

/// Resolver over one destination application's service tree
pub struct ClusterResolver<'a> {
    application: &'a str,
    tree: &'a MirrorTree,
    policy: &'a RoutePolicy,
}

impl<'a> ClusterResolver<'a> {
    pub fn new(
        application: &'a str,
        tree: &'a MirrorTree,
        policy: &'a RoutePolicy,
    ) -> Self {
        Self {
            application,
            tree,
            policy,
        }
    }

    /// Physical clusters serving `cluster`, or `None` when there is no mapping.
    pub fn resolve(
        &self,
        cluster: &str,
        options: ResolveOptions<'_>,
    ) -> Option<Vec<String>> {
        if options.intent_routing && self.policy.is_intent(cluster) {
            let Some(source) = options.source else {
                debug!(application = self.application, intent = cluster, "Intent without caller context");
                return None;
            };
            let target = self.resolve_intent(cluster, source)?;
            return self.resolve_physical(&target);
        }

        if options.ezone_prefix {
            let ezone = options.source.and_then(SourceRoute::ezone);
            if let Some(ezone) = ezone {
                if self.policy.split_ezone(cluster).0.is_none() {
                    let candidate = ezone::with_ezone(ezone, cluster);
                    if self.tree.has_cluster(&candidate) {
                        return self.resolve_physical(&candidate);
                    }
                }
            }
        }

        self.resolve_physical(cluster)
    }

    /// Cluster an intent points at for this caller.
    ///
    /// Lookup order: the caller cluster's `route` table, the destination's
    /// `default_route` for each caller ezone then `overall`, the global
    /// default policy.
    pub fn resolve_intent(
        &self,
        intent: &str,
        source: &SourceRoute,
    ) -> Option<String> {
        if let Some(target) = source.meta.route_for(self.application, intent) {
            return Some(target.to_string());
        }

        let app_meta = ApplicationMeta::parse(self.tree.application_value(), self.tree.root());
        for ezone in &source.ezones {
            if let Some(target) = app_meta.default_route.get(ezone).and_then(|table| table.get(intent)) {
                return Some(target.clone());
            }
        }
        if let Some(target) = app_meta.default_route_for(None, intent) {
            return Some(target.to_string());
        }

        let target = self.policy.default_policy(intent, source.ezone());
        if target.is_none() {
            debug!(
                application = self.application,
                intent,
                source = %source.cluster,
                "Intent has no route"
            );
        }
        target
    }

    /// Follows `link` metadata down to physical clusters.
    ///
    /// A cluster without links is physical and resolves to itself; links
    /// are followed depth-first with duplicates removed. Cycles and chains
    /// longer than `max_resolve_depth` yield `None`.
    pub fn resolve_physical(
        &self,
        cluster: &str,
    ) -> Option<Vec<String>> {
        let mut stack = Vec::new();
        self.follow(cluster, &mut stack)
    }

    fn follow(
        &self,
        cluster: &str,
        stack: &mut Vec<String>,
    ) -> Option<Vec<String>> {
        if stack.iter().any(|seen| seen == cluster) {
            warn!(application = self.application, cluster, path = ?stack, "Symlink cycle");
            return None;
        }
        if stack.len() > self.policy.max_resolve_depth() {
            warn!(application = self.application, cluster, path = ?stack, "Symlink chain too deep");
            return None;
        }

        let links = self.cluster_meta(cluster).map(|meta| meta.link).unwrap_or_default();
        if links.is_empty() {
            return Some(vec![cluster.to_string()]);
        }

        stack.push(cluster.to_string());
        let mut physical: Vec<String> = Vec::new();
        for link in &links {
            for name in self.follow(link, stack)? {
                if !physical.contains(&name) {
                    physical.push(name);
                }
            }
        }
        stack.pop();
        Some(physical)
    }

    fn cluster_meta(
        &self,
        cluster: &str,
    ) -> Option<ClusterMeta> {
        let node = self.tree.cluster(cluster)?;
        let path = format!("{}/{}", self.tree.root(), cluster);
        Some(ClusterMeta::parse(node.value(), &path))
    }
}
