//! Mirrored coordination-store subtrees and the watch sessions built on them.
//!
//! - [`TreeHolder`] keeps one `(application, type)` subtree in memory
//! - [`TreeHub`] shares holders between sessions and gates their startup
//! - [`TreeHolderCleaner`] evicts holders nobody has asked for in a while
//! - [`TreeWatcher`] turns holder changes into `all`/`update`/`delete` messages

mod cleaner;
mod holder;
mod hub;
mod message;
mod mirror;
mod request;
mod types;
mod watcher;

pub use cleaner::*;
pub use holder::*;
pub use hub::*;
pub use message::*;
pub use mirror::*;
pub use request::*;
pub use types::*;
pub use watcher::*;

#[cfg(test)]
mod request_test;
#[cfg(test)]
mod watcher_test;
