//! Arbor pushes configuration, switch and service-discovery data held in a
//! hierarchical coordination store to long-polling clients.
//!
//! One [`tree::TreeHolder`] mirrors each `(application, tree type)` subtree
//! and is shared by every session that needs it; [`tree::TreeWatcher`]
//! turns holder changes into `all`/`update`/`delete` messages after cluster
//! routing ([`route`]) has been applied.

pub mod config;
pub mod constants;
pub mod dependency;
mod errors;
pub mod metrics;
pub mod route;
pub mod server;
pub mod store;
pub mod tree;
pub mod utils;

pub use errors::*;

//-----------------------------------------------------------
// Test utils

#[cfg(test)]
pub(crate) mod test_utils;
