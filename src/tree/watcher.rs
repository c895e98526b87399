//! Long-poll watch sessions.
//!
//! A [`TreeWatcher`] collects subscriptions, then [`TreeWatcher::start`]
//! leases every holder it needs, waits for their first snapshots and builds
//! the initial `all` dump before returning. Nothing fails after that point:
//! the returned [`WatchStream`] is fed by a session task that follows the
//! holders' change logs and ends on cancellation, life-span expiry, client
//! disconnect or holder close.
//!
//! Ordering within one holder follows revision numbers. Each subscription
//! remembers the tree revision its last dump reflected and ignores older
//! changes. Changes to cluster or application nodes re-run resolution; a
//! subscription whose mapping moved gets a scoped `all` instead of
//! incremental updates that may reference stale physical clusters.

use std::collections::BTreeMap;
use std::collections::BTreeSet;
use std::pin::Pin;
use std::sync::Arc;
use std::task::Context;
use std::task::Poll;
use std::time::Duration;

use futures::future::try_join_all;
use futures::Stream;
use serde_json::Map;
use serde_json::Value;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_stream::wrappers::errors::BroadcastStreamRecvError;
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::wrappers::ReceiverStream;
use tokio_stream::StreamExt;
use tokio_stream::StreamMap;
use tokio_util::sync::CancellationToken;
use tokio_util::sync::DropGuard;
use tracing::debug;
use tracing::info;
use tracing::warn;

use super::message::value_entry;
use super::ClusterSelection;
use super::HolderEvent;
use super::HolderKey;
use super::HolderLease;
use super::MessageBody;
use super::MessageType;
use super::MirrorTree;
use super::NodeLevel;
use super::SubscriptionRequest;
use super::SubscriptionType;
use super::TreeChange;
use super::TreeHub;
use super::TreeType;
use super::WatchMessage;
use crate::config::WatcherConfig;
use crate::dependency::DependencyRecorder;
use crate::metrics::WATCHERS_GAUGE;
use crate::metrics::WATCH_MESSAGES;
use crate::metrics::WATCH_RESYNCS;
use crate::route::ClusterMeta;
use crate::route::ClusterResolver;
use crate::route::ResolveOptions;
use crate::route::RouteContext;
use crate::route::RouteMode;
use crate::route::RoutePolicy;
use crate::route::SharedPolicy;
use crate::route::SourceRoute;
use crate::utils::time::with_jitter;
use crate::Error;
use crate::Result;
use crate::WatchError;

/// Shared collaborators of every watch session
pub struct WatchContext {
    pub hub: Arc<TreeHub>,
    pub policy: SharedPolicy,
    pub config: WatcherConfig,
    /// Present only while passive dependency declaration is switched on
    pub dependency: Option<Arc<dyn DependencyRecorder>>,
}

impl std::fmt::Debug for WatchContext {
    fn fmt(
        &self,
        f: &mut std::fmt::Formatter<'_>,
    ) -> std::fmt::Result {
        f.debug_struct("WatchContext")
            .field("hub", &self.hub)
            .field("config", &self.config)
            .field("dependency", &self.dependency.is_some())
            .finish()
    }
}

#[derive(Debug, Clone, Default)]
pub struct WatcherOptions {
    /// Emit the initial `all` dump
    pub with_initial: bool,
    /// Requested life span, capped by `max_life_span_in_secs`
    pub life_span: Option<Duration>,
    /// Caller identity for routing and hijack
    pub source: Option<RouteContext>,
    pub route_mode: RouteMode,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum WatcherState {
    New,
    Started,
    Closed,
}

impl WatcherState {
    fn as_str(&self) -> &'static str {
        match self {
            WatcherState::New => "new",
            WatcherState::Started => "started",
            WatcherState::Closed => "closed",
        }
    }
}

pub struct TreeWatcher {
    id: String,
    context: Arc<WatchContext>,
    options: WatcherOptions,
    request: SubscriptionRequest,
    state: WatcherState,
    cancel: CancellationToken,
}

impl TreeWatcher {
    pub fn new(
        context: Arc<WatchContext>,
        options: WatcherOptions,
    ) -> Self {
        Self {
            id: nanoid::nanoid!(10),
            context,
            options,
            request: SubscriptionRequest::new(),
            state: WatcherState::New,
            cancel: CancellationToken::new(),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    fn ensure_new(&self) -> Result<()> {
        if self.state != WatcherState::New {
            return Err(WatchError::IllegalState(self.state.as_str()).into());
        }
        Ok(())
    }

    /// Subscribes to every cluster of `application`
    pub fn watch(
        &mut self,
        application: &str,
        sub_type: SubscriptionType,
    ) -> Result<()> {
        self.ensure_new()?;
        self.request.watch(sub_type, application)?;
        Ok(())
    }

    /// Restricts `application` to `cluster`; repeated calls add clusters
    pub fn limit_cluster_name(
        &mut self,
        application: &str,
        sub_type: SubscriptionType,
        cluster: &str,
    ) -> Result<()> {
        self.ensure_new()?;
        self.request.limit_cluster_name(sub_type, application, cluster)?;
        Ok(())
    }

    /// Serves `logical` straight from `physical`
    pub fn pin_cluster(
        &mut self,
        application: &str,
        sub_type: SubscriptionType,
        logical: &str,
        physical: &str,
    ) -> Result<()> {
        self.ensure_new()?;
        self.request.pin_cluster(sub_type, application, logical, physical)?;
        Ok(())
    }

    pub fn apply_request(
        &mut self,
        request: &SubscriptionRequest,
    ) -> Result<()> {
        self.ensure_new()?;
        self.request.merge(request);
        Ok(())
    }

    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Stops the session; leases are released by the session task
    pub fn close(&mut self) {
        self.state = WatcherState::Closed;
        self.cancel.cancel();
    }

    fn life_span(&self) -> Duration {
        let max = self.context.config.max_life_span();
        let base = self.options.life_span.map(|span| span.min(max)).unwrap_or(max);
        with_jitter(base, self.context.config.life_span_jitter())
    }

    /// Leases and initializes every holder, then returns the message stream.
    ///
    /// # Errors
    /// Every failure (validation, holder init timeout, store errors) is
    /// returned here; the stream itself never carries errors.
    pub async fn start(&mut self) -> Result<WatchStream> {
        self.ensure_new()?;
        if self.request.is_empty() {
            return Err(WatchError::InvalidSubscription("nothing to watch".to_string()).into());
        }
        self.state = WatcherState::Started;

        let route_mode = self.options.route_mode;
        let mut subscriptions: Vec<Subscription> = self
            .request
            .iter()
            .map(|(sub_type, application, selection)| Subscription::new(sub_type, application, selection.clone()))
            .collect();

        let source_key = self
            .options
            .source
            .as_ref()
            .filter(|_| subscriptions.iter().any(|s| s.needs_source(route_mode)))
            .map(|source| HolderKey::new(&source.application, TreeType::Service));

        let mut keys: BTreeSet<HolderKey> = subscriptions.iter().map(|s| s.holder.clone()).collect();
        keys.extend(source_key.clone());

        let hub = &self.context.hub;
        let leases = try_join_all(
            keys.iter()
                .map(|key| hub.get_or_create(&key.application, key.tree_type)),
        )
        .await?;
        let holders: BTreeMap<HolderKey, HolderLease> = leases
            .into_iter()
            .map(|lease| (lease.key().clone(), lease))
            .collect();

        // Follow the change logs before snapshotting so nothing falls in between.
        let mut streams = StreamMap::new();
        for (key, lease) in &holders {
            streams.insert(key.clone(), BroadcastStream::new(lease.holder().subscribe()));
        }

        let policy = self.context.policy.load_full();
        let (source_route, source_seen) = match (&source_key, &self.options.source) {
            (Some(key), Some(source)) => match holders.get(key) {
                Some(lease) => {
                    let tree = lease.holder().read();
                    let route = SourceRoute::from_tree(&tree, &policy, &source.application, &source.cluster);
                    (Some(route), tree.revision())
                }
                None => (None, 0),
            },
            _ => (None, 0),
        };

        let mut body = MessageBody::new();
        for subscription in &mut subscriptions {
            let Some(lease) = holders.get(&subscription.holder) else {
                continue;
            };
            let tree = lease.holder().read();
            subscription.refresh(&tree, &policy, source_route.as_ref(), route_mode);
            subscription.dump(&tree, &mut body);
        }

        let (sender, receiver) = mpsc::channel(self.context.config.channel_capacity);
        if self.options.with_initial {
            sender
                .send(WatchMessage::new(MessageType::All, body))
                .await
                .map_err(|_| Error::Fatal("watch channel closed before start".to_string()))?;
            WATCH_MESSAGES.with_label_values(&[MessageType::All.as_str()]).inc();
        }

        let life_span = self.life_span();
        let session = WatchSession {
            id: self.id.clone(),
            policy: self.context.policy.clone(),
            route_mode,
            source: self.options.source.clone(),
            source_key,
            source_route,
            source_seen,
            subscriptions,
            holders,
            sender,
            cancel: self.cancel.clone(),
        };
        session.declare_dependencies(self.context.dependency.clone());

        info!(
            watcher = %self.id,
            subscriptions = session.subscriptions.len(),
            holders = session.holders.len(),
            ?life_span,
            "Watch session started"
        );
        WATCHERS_GAUGE.inc();
        tokio::spawn(session.run(streams, Instant::now() + life_span));

        Ok(WatchStream {
            inner: ReceiverStream::new(receiver),
            _guard: self.cancel.clone().drop_guard(),
        })
    }
}

/// Message stream of one session; dropping it ends the session
pub struct WatchStream {
    inner: ReceiverStream<WatchMessage>,
    _guard: DropGuard,
}

impl std::fmt::Debug for WatchStream {
    fn fmt(
        &self,
        f: &mut std::fmt::Formatter<'_>,
    ) -> std::fmt::Result {
        f.debug_struct("WatchStream").finish_non_exhaustive()
    }
}

impl Stream for WatchStream {
    type Item = WatchMessage;

    fn poll_next(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<Self::Item>> {
        Pin::new(&mut self.inner).poll_next(cx)
    }
}

/// One `(type, application)` subscription inside a running session
#[derive(Debug, Clone)]
struct Subscription {
    sub_type: SubscriptionType,
    application: String,
    selection: ClusterSelection,
    holder: HolderKey,
    /// Logical cluster -> physical clusters serving it
    resolved: BTreeMap<String, Vec<String>>,
    /// Tree revision the last dump of this subscription reflected
    seen: u64,
}

impl Subscription {
    fn new(
        sub_type: SubscriptionType,
        application: &str,
        selection: ClusterSelection,
    ) -> Self {
        Self {
            sub_type,
            application: application.to_string(),
            selection,
            holder: HolderKey::new(application, sub_type.tree_type()),
            resolved: BTreeMap::new(),
            seen: 0,
        }
    }

    fn needs_source(
        &self,
        route_mode: RouteMode,
    ) -> bool {
        self.holder.tree_type.carries_routing() && (route_mode != RouteMode::Orig || self.selection.intent_routing)
    }

    fn resolve(
        &self,
        tree: &MirrorTree,
        policy: &RoutePolicy,
        source: Option<&SourceRoute>,
        route_mode: RouteMode,
    ) -> BTreeMap<String, Vec<String>> {
        let logical: Vec<String> = if self.selection.is_all() {
            tree.cluster_names().cloned().collect()
        } else {
            self.selection.clusters.iter().cloned().collect()
        };

        let resolver = ClusterResolver::new(&self.application, tree, policy);
        let options = ResolveOptions {
            source,
            intent_routing: route_mode == RouteMode::Route || self.selection.intent_routing,
            ezone_prefix: route_mode == RouteMode::Prefix,
        };

        logical
            .into_iter()
            .map(|name| {
                let physical = if let Some(pinned) = self.selection.pinned.get(&name) {
                    vec![pinned.clone()]
                } else if self.holder.tree_type.carries_routing() {
                    resolver.resolve(&name, options).unwrap_or_default()
                } else {
                    vec![name.clone()]
                };
                (name, physical)
            })
            .collect()
    }

    /// Re-resolves against `tree`; true when the mapping changed
    fn refresh(
        &mut self,
        tree: &MirrorTree,
        policy: &RoutePolicy,
        source: Option<&SourceRoute>,
        route_mode: RouteMode,
    ) -> bool {
        let resolved = self.resolve(tree, policy, source, route_mode);
        if resolved == self.resolved {
            return false;
        }
        self.resolved = resolved;
        true
    }

    /// Writes this subscription's full section into `body`. Changes up to
    /// the tree's revision are covered by the dump from here on.
    fn dump(
        &mut self,
        tree: &MirrorTree,
        body: &mut MessageBody,
    ) {
        self.seen = tree.revision();
        let section = body.section(self.sub_type, &self.application);
        for (logical, physical) in &self.resolved {
            let payload = match self.sub_type {
                SubscriptionType::ServiceInfo => merged_info(tree, physical),
                _ => merged_keys(tree, physical),
            };
            section.insert(logical.clone(), Value::Object(payload));
        }
    }
}

/// Keys of every physical cluster; the first cluster listing a key wins
fn merged_keys(
    tree: &MirrorTree,
    physical: &[String],
) -> Map<String, Value> {
    let mut keys = Map::new();
    for cluster in physical {
        if let Some(node) = tree.cluster(cluster) {
            for (key, data) in &node.keys {
                keys.entry(key.clone()).or_insert_with(|| value_entry(Some(&data.value)));
            }
        }
    }
    keys
}

fn merged_info(
    tree: &MirrorTree,
    physical: &[String],
) -> Map<String, Value> {
    let mut info = Map::new();
    for cluster in physical {
        if let Some(node) = tree.cluster(cluster) {
            let path = format!("{}/{}", tree.root(), cluster);
            for (field, value) in ClusterMeta::parse(node.value(), &path).info {
                info.entry(field).or_insert(value);
            }
        }
    }
    info
}

struct WatchSession {
    id: String,
    policy: SharedPolicy,
    route_mode: RouteMode,
    source: Option<RouteContext>,
    source_key: Option<HolderKey>,
    source_route: Option<SourceRoute>,
    source_seen: u64,
    subscriptions: Vec<Subscription>,
    holders: BTreeMap<HolderKey, HolderLease>,
    sender: mpsc::Sender<WatchMessage>,
    cancel: CancellationToken,
}

impl WatchSession {
    async fn run(
        mut self,
        mut streams: StreamMap<HolderKey, BroadcastStream<HolderEvent>>,
        deadline: Instant,
    ) {
        let reason = 'session: loop {
            let messages = tokio::select! {
                _ = self.cancel.cancelled() => break 'session "cancelled",
                _ = tokio::time::sleep_until(deadline) => break 'session "life span expired",
                _ = self.sender.closed() => break 'session "client disconnected",
                item = streams.next() => match item {
                    None => break 'session "change logs ended",
                    Some((key, Ok(HolderEvent::Changed(change)))) => self.on_change(&key, &change),
                    Some((key, Ok(HolderEvent::Connection(state)))) => {
                        debug!(watcher = %self.id, holder = %key, %state, "Holder connection state");
                        continue;
                    }
                    Some((key, Ok(HolderEvent::Closed))) => {
                        info!(watcher = %self.id, holder = %key, "Holder closed under session");
                        break 'session "holder closed";
                    }
                    Some((key, Err(BroadcastStreamRecvError::Lagged(skipped)))) => {
                        warn!(watcher = %self.id, holder = %key, skipped, "Session lagged behind change log, resyncing");
                        WATCH_RESYNCS.with_label_values(&["lagged"]).inc();
                        self.resync(&key)
                    }
                },
            };

            for message in messages {
                if !self.emit(message).await {
                    break 'session "client disconnected";
                }
            }
        };

        WATCHERS_GAUGE.dec();
        info!(watcher = %self.id, reason, "Watch session ended");
    }

    async fn emit(
        &self,
        message: WatchMessage,
    ) -> bool {
        let kind = message.message;
        if self.sender.send(message).await.is_err() {
            return false;
        }
        WATCH_MESSAGES.with_label_values(&[kind.as_str()]).inc();
        true
    }

    fn on_change(
        &mut self,
        key: &HolderKey,
        change: &TreeChange,
    ) -> Vec<WatchMessage> {
        match &change.level {
            NodeLevel::Key { cluster, key: name } => self.on_key_change(key, change, cluster, name),
            level => {
                let policy = self.policy.load_full();
                let messages = self.on_structural_change(key, change, level, &policy);
                if !messages.is_empty() {
                    WATCH_RESYNCS.with_label_values(&["structural"]).inc();
                }
                messages
            }
        }
    }

    fn on_key_change(
        &mut self,
        key: &HolderKey,
        change: &TreeChange,
        cluster: &str,
        name: &str,
    ) -> Vec<WatchMessage> {
        let Some(lease) = self.holders.get(key) else {
            return Vec::new();
        };
        let tree = lease.holder().read();

        let mut updates = MessageBody::new();
        let mut deletes = MessageBody::new();
        for subscription in &self.subscriptions {
            if subscription.holder != *key
                || subscription.sub_type == SubscriptionType::ServiceInfo
                || change.revision <= subscription.seen
            {
                continue;
            }
            for (logical, physical) in &subscription.resolved {
                if !physical.iter().any(|p| p == cluster) {
                    continue;
                }
                let value = if physical.len() == 1 {
                    change.value.clone()
                } else {
                    physical
                        .iter()
                        .find_map(|p| tree.key(p, name))
                        .map(|data| data.value.clone())
                };
                match value {
                    Some(value) => updates.put_key(
                        subscription.sub_type,
                        &subscription.application,
                        logical,
                        name,
                        Some(&value),
                    ),
                    None => deletes.put_key(subscription.sub_type, &subscription.application, logical, name, None),
                }
            }
        }

        let mut messages = Vec::new();
        if !updates.is_empty() {
            messages.push(WatchMessage::new(MessageType::Update, updates));
        }
        if !deletes.is_empty() {
            messages.push(WatchMessage::new(MessageType::Delete, deletes));
        }
        messages
    }

    fn on_structural_change(
        &mut self,
        key: &HolderKey,
        change: &TreeChange,
        level: &NodeLevel,
        policy: &RoutePolicy,
    ) -> Vec<WatchMessage> {
        let source_changed = self.source_key.as_ref() == Some(key)
            && change.revision > self.source_seen
            && match (level, &self.source) {
                (NodeLevel::Application, _) => true,
                (NodeLevel::Cluster { cluster }, Some(source)) => *cluster == source.cluster,
                _ => false,
            };
        if source_changed {
            self.refresh_source_route(policy);
        }

        let route_mode = self.route_mode;
        let mut body = MessageBody::new();
        for index in 0..self.subscriptions.len() {
            let subscription = &self.subscriptions[index];
            let bound = subscription.holder == *key && change.revision > subscription.seen;
            let via_source = source_changed && subscription.needs_source(route_mode);
            if !bound && !via_source {
                continue;
            }
            let Some(lease) = self.holders.get(&subscription.holder) else {
                continue;
            };
            let holder = lease.holder().clone();
            let tree = holder.read();

            let info_touched = bound
                && subscription.sub_type == SubscriptionType::ServiceInfo
                && match level {
                    NodeLevel::Cluster { cluster } => subscription
                        .resolved
                        .values()
                        .any(|physical| physical.iter().any(|p| p == cluster)),
                    _ => false,
                };

            let subscription = &mut self.subscriptions[index];
            let moved = subscription.refresh(&tree, policy, self.source_route.as_ref(), route_mode);
            if moved || info_touched {
                debug!(
                    watcher = %self.id,
                    sub_type = %subscription.sub_type,
                    application = %subscription.application,
                    revision = change.revision,
                    "Routing changed, redumping subscription"
                );
                subscription.dump(&tree, &mut body);
            } else if bound {
                // Key changes after this revision have not been delivered yet.
                subscription.seen = subscription.seen.max(change.revision);
            }
        }

        if body.is_empty() {
            return Vec::new();
        }
        vec![WatchMessage::new(MessageType::All, body)]
    }

    /// Redumps every subscription depending on `key` after the session lost events
    fn resync(
        &mut self,
        key: &HolderKey,
    ) -> Vec<WatchMessage> {
        let policy = self.policy.load_full();
        let source_lagged = self.source_key.as_ref() == Some(key);
        if source_lagged {
            self.refresh_source_route(&policy);
        }

        let route_mode = self.route_mode;
        let mut body = MessageBody::new();
        for index in 0..self.subscriptions.len() {
            let subscription = &self.subscriptions[index];
            if subscription.holder != *key && !(source_lagged && subscription.needs_source(route_mode)) {
                continue;
            }
            let Some(lease) = self.holders.get(&subscription.holder) else {
                continue;
            };
            let holder = lease.holder().clone();
            let tree = holder.read();
            let subscription = &mut self.subscriptions[index];
            subscription.refresh(&tree, &policy, self.source_route.as_ref(), route_mode);
            subscription.dump(&tree, &mut body);
        }

        if body.is_empty() {
            return Vec::new();
        }
        vec![WatchMessage::new(MessageType::All, body)]
    }

    fn refresh_source_route(
        &mut self,
        policy: &RoutePolicy,
    ) {
        let (Some(key), Some(source)) = (&self.source_key, &self.source) else {
            return;
        };
        let Some(lease) = self.holders.get(key) else {
            return;
        };
        let tree = lease.holder().read();
        self.source_route = Some(SourceRoute::from_tree(
            &tree,
            policy,
            &source.application,
            &source.cluster,
        ));
        self.source_seen = tree.revision();
    }

    /// Best-effort declaration of the caller as consumer of every resolved
    /// service cluster
    fn declare_dependencies(
        &self,
        recorder: Option<Arc<dyn DependencyRecorder>>,
    ) {
        let (Some(recorder), Some(source)) = (recorder, self.source.clone()) else {
            return;
        };

        let mut targets: BTreeSet<(String, String)> = BTreeSet::new();
        for subscription in &self.subscriptions {
            if subscription.sub_type != SubscriptionType::Service || subscription.application == source.application {
                continue;
            }
            for physical in subscription.resolved.values().flatten() {
                targets.insert((subscription.application.clone(), physical.clone()));
            }
        }
        if targets.is_empty() {
            return;
        }

        let watcher = self.id.clone();
        tokio::spawn(async move {
            for (application, cluster) in targets {
                if let Err(e) = recorder
                    .declare(&application, &cluster, &source.application, &source.cluster)
                    .await
                {
                    warn!(%watcher, %application, %cluster, error = %e, "Dependency declaration failed");
                }
            }
        });
    }
}
