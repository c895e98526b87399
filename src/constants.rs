// -
// Wire message types

pub const MESSAGE_ALL: &str = "all";
pub const MESSAGE_UPDATE: &str = "update";
pub const MESSAGE_DELETE: &str = "delete";
pub const MESSAGE_PING: &str = "ping";

// -
// Cluster routing

/// Ezone key of the catch-all default route table
pub(crate) const OVERALL_EZONE: &str = "overall";

/// Intent used when a route key does not carry `@intent`
pub const DEFAULT_INTENT: &str = "direct";

/// Separator between application and intent in route keys
pub(crate) const ROUTE_INTENT_SEPARATOR: char = '@';

/// Wildcard suffix for prefix matching in force-routing tables
pub(crate) const PREFIX_WILDCARD: char = '*';

// -
// HTTP headers

pub const HEADER_ROUTE_MODE: &str = "x-soa-mode";
pub const HEADER_CLUSTER_NAME: &str = "x-cluster-name";
pub const HEADER_APPLICATION_NAME: &str = "x-application-name";
