//! Multi-domain heap driving the ephemeron operations: per-domain
//! nurseries, a shared tenured heap and an incremental major collector.

mod barrier;
mod domain;
mod heap;

pub use barrier::SenseBarrier;
pub use domain::Domain;
pub use heap::*;
