//! HTTP boundary: the long-polling endpoint and its NDJSON framing.

mod keepalive;
mod long_polling;
pub use keepalive::*;
pub use long_polling::*;

#[cfg(test)]
mod long_polling_test;
