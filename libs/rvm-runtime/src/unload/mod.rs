//! Class unloading: deciding after a collection which classes are unreachable and evicting them.
mod coordinator;
mod event;
mod heap;
mod oracle;
mod stats;

pub use coordinator::*;
pub use event::*;
pub use heap::*;
pub use oracle::*;
pub use stats::*;
