use std::sync::Arc;

use async_trait::async_trait;
#[cfg(test)]
use mockall::automock;
use tracing::debug;
use tracing::info;
use tracing::warn;

use crate::config::DependencyConfig;
use crate::metrics::DEPENDENCY_DECLARATIONS;
use crate::route::ClusterMeta;
use crate::store::join_path;
use crate::store::CoordinationStore;
use crate::tree::TreeType;
use crate::Result;
use crate::StoreError;

/// Outcome of one declaration, also used as the metric label
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Declaration {
    Recorded,
    AlreadyPresent,
    /// The destination cluster node does not exist
    MissingCluster,
    /// The destination metadata is not valid JSON and is left alone
    Malformed,
}

impl Declaration {
    pub fn as_str(&self) -> &'static str {
        match self {
            Declaration::Recorded => "recorded",
            Declaration::AlreadyPresent => "present",
            Declaration::MissingCluster => "missing",
            Declaration::Malformed => "malformed",
        }
    }
}

#[cfg_attr(test, automock)]
#[async_trait]
pub trait DependencyRecorder: Send + Sync + 'static {
    /// Records `consumer_app`/`consumer_cluster` as a consumer of
    /// `application`/`cluster`
    async fn declare(
        &self,
        application: &str,
        cluster: &str,
        consumer_app: &str,
        consumer_cluster: &str,
    ) -> Result<Declaration>;
}

/// Writes declarations into service cluster nodes of the coordination store
pub struct StoreDependencyRecorder {
    store: Arc<dyn CoordinationStore>,
    max_retries: usize,
}

impl std::fmt::Debug for StoreDependencyRecorder {
    fn fmt(
        &self,
        f: &mut std::fmt::Formatter<'_>,
    ) -> std::fmt::Result {
        f.debug_struct("StoreDependencyRecorder")
            .field("max_retries", &self.max_retries)
            .finish()
    }
}

impl StoreDependencyRecorder {
    pub fn new(
        store: Arc<dyn CoordinationStore>,
        config: &DependencyConfig,
    ) -> Self {
        Self {
            store,
            max_retries: config.max_retries.max(1),
        }
    }

    /// A recorder when the switch is on, `None` otherwise
    pub fn from_config(
        store: Arc<dyn CoordinationStore>,
        config: &DependencyConfig,
    ) -> Option<Arc<dyn DependencyRecorder>> {
        if !config.enabled {
            return None;
        }
        Some(Arc::new(Self::new(store, config)))
    }

    async fn try_declare(
        &self,
        path: &str,
        consumer_app: &str,
        consumer_cluster: &str,
    ) -> Result<Declaration> {
        let Some(node) = self.store.get(path).await? else {
            return Ok(Declaration::MissingCluster);
        };

        let mut meta: ClusterMeta = if node.value.trim().is_empty() {
            ClusterMeta::default()
        } else {
            match serde_json::from_str(&node.value) {
                Ok(meta) => meta,
                Err(e) => {
                    warn!(path, error = %e, "Cluster metadata is malformed, dependency not recorded");
                    return Ok(Declaration::Malformed);
                }
            }
        };

        let consumers = meta.dependency.entry(consumer_app.to_string()).or_default();
        if consumers.iter().any(|c| c == consumer_cluster) {
            return Ok(Declaration::AlreadyPresent);
        }
        consumers.push(consumer_cluster.to_string());
        consumers.sort();

        let value = serde_json::to_string(&meta).map_err(|e| StoreError::Encode {
            path: path.to_string(),
            reason: e.to_string(),
        })?;
        self.store.set(path, &value, Some(node.stat.version)).await?;
        Ok(Declaration::Recorded)
    }
}

#[async_trait]
impl DependencyRecorder for StoreDependencyRecorder {
    async fn declare(
        &self,
        application: &str,
        cluster: &str,
        consumer_app: &str,
        consumer_cluster: &str,
    ) -> Result<Declaration> {
        let path = join_path(&[TreeType::Service.as_str(), application, cluster]);

        let mut attempt = 0;
        loop {
            attempt += 1;
            match self.try_declare(&path, consumer_app, consumer_cluster).await {
                Ok(outcome) => {
                    DEPENDENCY_DECLARATIONS.with_label_values(&[outcome.as_str()]).inc();
                    if outcome == Declaration::Recorded {
                        info!(path, consumer_app, consumer_cluster, "Dependency recorded");
                    }
                    return Ok(outcome);
                }
                Err(e) if e.is_version_conflict() && attempt < self.max_retries => {
                    debug!(path, attempt, "Concurrent metadata write, retrying dependency declaration");
                }
                Err(e) => {
                    let label = if e.is_version_conflict() { "conflict" } else { "failed" };
                    DEPENDENCY_DECLARATIONS.with_label_values(&[label]).inc();
                    return Err(e);
                }
            }
        }
    }
}
