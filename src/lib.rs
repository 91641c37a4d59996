//! # shardgrid
//!
//! **2D process topology and padded shard/gather for distributed training on numr.**
//!
//! shardgrid decomposes a flat set of worker ranks into a tensor-parallel ×
//! data-parallel grid, creates and caches one communication group per grid row
//! and column, and splits tensor payloads evenly across the ranks of a group so
//! they can be reassembled losslessly with a single all-gather.
//!
//! ## Layout
//!
//! ```text
//!              tp index j →
//!            ┌──────┬──────┬──────┐
//!  dp row 0  │  r0  │  r1  │  r2  │   row group    = tensor-parallel peers
//!            ├──────┼──────┼──────┤
//!  dp row 1  │  r3  │  r4  │  r5  │   column group = data-parallel peers
//!            └──────┴──────┴──────┘
//! ```
//!
//! ## Design
//!
//! - **CommGroupCache**: explicit per-process context object; one group per
//!   `(backend, sorted ranks)`, created on first use, never evicted
//! - **ProcessTopology**: creates every row group then every column group in a
//!   fixed order, so every rank issues the same collective sequence
//! - **ShardedTensor**: `ceil(N / G)` chunks with virtual zero padding, gathered
//!   back and truncated to the original shape
//! - **Transport seam**: the wire-level collectives stay behind
//!   [`CollectiveTransport`](distributed::CollectiveTransport); [`LocalWorld`](distributed::LocalWorld)
//!   simulates N ranks in one process for tests

pub mod distributed;
pub mod error;

pub use distributed::{
    Backend, CollectiveTransport, CommGroupCache, DistributedRuntime, GroupHandle, LocalWorld,
    NoOpTransport, ParallelAxis, ProcessTopology, ShardState, ShardedTensor, TensorKind,
    TopologyConfig,
};
pub use error::{Error, Result};

// Re-export numr types that users will commonly need
pub use numr::dtype::DType;
pub use numr::runtime::{Runtime, RuntimeClient};
pub use numr::tensor::Tensor;
