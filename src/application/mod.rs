//! Application layer: the account resolver cache and the progress tracker.
//!
//! Both are constructed explicitly around an injected store; neither spawns
//! background work, and they do not depend on each other.

pub mod clock;
pub mod coalesce;
pub mod resolver;
pub mod tracker;
