use std::collections::BTreeMap;
use std::fmt;

use serde::Deserialize;
use serde::Serialize;
use serde_json::Map;
use serde_json::Value;

use super::SubscriptionType;
use crate::constants::MESSAGE_ALL;
use crate::constants::MESSAGE_DELETE;
use crate::constants::MESSAGE_PING;
use crate::constants::MESSAGE_UPDATE;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageType {
    All,
    Update,
    Delete,
    /// Transport keepalive, never produced by a watcher
    Ping,
}

impl MessageType {
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageType::All => MESSAGE_ALL,
            MessageType::Update => MESSAGE_UPDATE,
            MessageType::Delete => MESSAGE_DELETE,
            MessageType::Ping => MESSAGE_PING,
        }
    }
}

impl fmt::Display for MessageType {
    fn fmt(
        &self,
        f: &mut fmt::Formatter<'_>,
    ) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One event of a watch stream.
///
/// The body is nested `{type: {application: {cluster: payload}}}`. For
/// key-value types the payload is `{key: {"value": v}}` with `null` values
/// in deletes; for `service_info` it is the cluster's info map.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WatchMessage {
    pub message: MessageType,
    pub body: Value,
}

impl WatchMessage {
    pub fn new(
        message: MessageType,
        body: MessageBody,
    ) -> Self {
        Self {
            message,
            body: Value::Object(body.into_inner()),
        }
    }

    pub fn ping() -> Self {
        Self {
            message: MessageType::Ping,
            body: Value::Object(Map::new()),
        }
    }

    /// Cluster entries of one `(type, application)` section
    pub fn clusters(
        &self,
        sub_type: SubscriptionType,
        application: &str,
    ) -> Option<&Map<String, Value>> {
        self.body
            .get(sub_type.as_str())
            .and_then(|section| section.get(application))
            .and_then(Value::as_object)
    }

    pub fn clusters_mut(
        &mut self,
        sub_type: SubscriptionType,
        application: &str,
    ) -> Option<&mut Map<String, Value>> {
        self.body
            .get_mut(sub_type.as_str())
            .and_then(|section| section.get_mut(application))
            .and_then(Value::as_object_mut)
    }

    /// Whether any `(type, application)` section carries a cluster entry.
    ///
    /// An `all` with empty sections is still meaningful; incremental
    /// messages without entries are not.
    pub fn has_entries(&self) -> bool {
        let Some(types) = self.body.as_object() else {
            return false;
        };
        types
            .values()
            .filter_map(Value::as_object)
            .flat_map(|apps| apps.values())
            .filter_map(Value::as_object)
            .any(|clusters| !clusters.is_empty())
    }

    /// Drops application and type sections left without clusters
    pub fn prune_empty_sections(&mut self) {
        if let Some(types) = self.body.as_object_mut() {
            for apps in types.values_mut() {
                if let Some(apps) = apps.as_object_mut() {
                    apps.retain(|_, clusters| clusters.as_object().map(|c| !c.is_empty()).unwrap_or(true));
                }
            }
            types.retain(|_, apps| apps.as_object().map(|a| !a.is_empty()).unwrap_or(true));
        }
    }
}

/// Builder for message bodies
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MessageBody(BTreeMap<SubscriptionType, BTreeMap<String, Map<String, Value>>>);

impl MessageBody {
    pub fn new() -> Self {
        Self::default()
    }

    /// Ensures the `(type, application)` section exists and returns its cluster map
    pub fn section(
        &mut self,
        sub_type: SubscriptionType,
        application: &str,
    ) -> &mut Map<String, Value> {
        self.0
            .entry(sub_type)
            .or_default()
            .entry(application.to_string())
            .or_default()
    }

    /// Sets `key` of `cluster`; `None` encodes a deletion
    pub fn put_key(
        &mut self,
        sub_type: SubscriptionType,
        application: &str,
        cluster: &str,
        key: &str,
        value: Option<&str>,
    ) {
        let cluster = self
            .section(sub_type, application)
            .entry(cluster.to_string())
            .or_insert_with(|| Value::Object(Map::new()));
        if let Value::Object(keys) = cluster {
            keys.insert(key.to_string(), value_entry(value));
        }
    }

    /// Replaces the whole payload of `cluster`
    pub fn put_cluster(
        &mut self,
        sub_type: SubscriptionType,
        application: &str,
        cluster: &str,
        payload: Map<String, Value>,
    ) {
        self.section(sub_type, application)
            .insert(cluster.to_string(), Value::Object(payload));
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn into_inner(self) -> Map<String, Value> {
        self.0
            .into_iter()
            .map(|(sub_type, apps)| {
                let apps: Map<String, Value> = apps
                    .into_iter()
                    .map(|(application, clusters)| (application, Value::Object(clusters)))
                    .collect();
                (sub_type.as_str().to_string(), Value::Object(apps))
            })
            .collect()
    }
}

/// `{"value": v}`, or `{"value": null}` for deletions
pub fn value_entry(value: Option<&str>) -> Value {
    let mut entry = Map::new();
    entry.insert(
        "value".to_string(),
        value.map(|v| Value::String(v.to_string())).unwrap_or(Value::Null),
    );
    Value::Object(entry)
}
