//! Passive dependency declaration.
//!
//! When switched on, every watch session records its caller as a consumer of
//! the service clusters it resolved to, in the `dependency` field of those
//! clusters' metadata. Writes are versioned and retried on conflict; any
//! failure is logged and never reaches the session.

mod recorder;
pub use recorder::*;
