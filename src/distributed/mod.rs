pub mod comm_utils;
pub mod config;
pub mod group_cache;
pub mod local;
pub mod sharded_tensor;
pub mod topology;
pub mod transport;

pub use comm_utils::all_gather_tensor;
pub use config::{TopologyConfig, resolve_degrees};
pub use group_cache::{CommGroup, CommGroupCache, GroupHandle};
pub use local::{LocalTransport, LocalWorld};
pub use sharded_tensor::{ShardLayout, ShardState, ShardedTensor, TensorKind};
pub use topology::{ParallelAxis, ProcessTopology};
pub use transport::{Backend, CollectiveTransport, DistributedRuntime, GroupId, NoOpTransport};
