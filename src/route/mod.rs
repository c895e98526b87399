//! Routing overlay: cluster metadata, ezones, resolution, force routing and hijack.

mod ezone;
mod force;
mod hijack;
mod meta;
mod policy;
mod resolver;
pub use ezone::*;
pub use force::*;
pub use hijack::*;
pub use meta::*;
pub use policy::*;
pub use resolver::*;

#[cfg(test)]
mod force_test;
