//! The cross-fork intersection engine: resolution, set primitives, narrowing, statistics.

pub(crate) mod accumulator;
mod histogram;
pub(crate) mod intersect;
mod resolver;

pub use accumulator::{
    merge_siblings, narrow_image, run_fork_pair, ForkPair, ImageError, ImageFailure, Narrowed,
    Outcome, RunError, RunReport,
};
pub use histogram::{residual_stats, ResidualStats};
pub use intersect::{intersect_addresses, merge_fork_sets, SiblingFold};
pub use resolver::{IndexAddressMap, IndexResolver, ResolveError};
