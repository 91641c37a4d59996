//! shardgrid error types

/// shardgrid result type
pub type Result<T> = std::result::Result<T, Error>;

/// shardgrid errors
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Error from numr operations
    #[error("numr error: {0}")]
    Numr(#[from] numr::error::Error),

    /// Topology used without an active distributed runtime
    #[error("process topology is not initialized: the distributed runtime is not active")]
    NotInitialized,

    /// Tensor/data parallel degrees do not fit the world size
    #[error("degree mismatch: {reason}")]
    DegreeMismatch {
        /// Description of what went wrong
        reason: String,
    },

    /// CPU-backend group requested before `extend_cpu_groups`
    #[error("cpu groups not materialized: call extend_cpu_groups() first")]
    CpuGroupsNotMaterialized,

    /// `extend_cpu_groups` called on an uninitialized topology
    #[error("cannot extend cpu groups of an uninitialized process topology")]
    NotExtendable,

    /// Shard/gather length does not match the group layout
    #[error("shape mismatch: expected {expected} elements, got {got}")]
    ShapeMismatch {
        /// Expected element count
        expected: usize,
        /// Actual element count
        got: usize,
    },

    /// Invalid argument to an operation
    #[error("invalid argument '{arg}': {reason}")]
    InvalidArgument {
        /// Argument name
        arg: &'static str,
        /// Why it's invalid
        reason: String,
    },

    /// Configuration loading error
    #[error("config error: {reason}")]
    ConfigError {
        /// Description of what went wrong
        reason: String,
    },

    /// Distributed communication error
    #[error("distributed error: {reason}")]
    DistributedError {
        /// Description of what went wrong
        reason: String,
    },
}
