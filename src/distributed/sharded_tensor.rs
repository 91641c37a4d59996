//! Even sharding of a tensor payload across the ranks of a group.
//!
//! A payload of `N` elements is flattened and split into `G` chunks of
//! `ceil(N / G)` elements. The flat sequence is treated as if zero-padded to
//! `chunk * G`; the padding only ever lies in the tail, so at most the last
//! ranks' chunks contain zeros, and they are materialized only on those ranks.
//! Gathering all-gathers the chunks in rank order and keeps the first `N`
//! elements, which undoes the padding exactly.

use std::ops::Range;

use crate::distributed::comm_utils::all_gather_tensor;
use crate::distributed::group_cache::GroupHandle;
use crate::distributed::topology::{ParallelAxis, ProcessTopology};
use crate::distributed::transport::CollectiveTransport;
use crate::error::{Error, Result};
use numr::dtype::DType;
use numr::ops::ShapeOps;
use numr::runtime::{Runtime, RuntimeClient};
use numr::tensor::Tensor;
use tracing::debug;

/// What the wrapped payload holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TensorKind {
    /// Parameter data
    #[default]
    Data,
    /// Parameter gradient
    Grad,
}

/// Whether the payload is currently whole or this rank's shard.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShardState {
    Whole,
    Sharded,
}

/// Placement of one rank's chunk in the padded flat payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ShardLayout {
    numel: usize,
    group_world_size: usize,
    local_index: usize,
    chunk: usize,
}

impl ShardLayout {
    pub fn new(numel: usize, group_world_size: usize, local_index: usize) -> Result<Self> {
        if group_world_size == 0 {
            return Err(Error::InvalidArgument {
                arg: "group_world_size",
                reason: "group must have at least one rank".to_string(),
            });
        }
        if local_index >= group_world_size {
            return Err(Error::InvalidArgument {
                arg: "local_index",
                reason: format!("local index {local_index} >= group size {group_world_size}"),
            });
        }
        Ok(Self {
            numel,
            group_world_size,
            local_index,
            chunk: numel.div_ceil(group_world_size),
        })
    }

    /// Elements held by every rank while sharded.
    pub fn chunk(&self) -> usize {
        self.chunk
    }

    pub fn group_world_size(&self) -> usize {
        self.group_world_size
    }

    pub fn local_index(&self) -> usize {
        self.local_index
    }

    /// `chunk * group_world_size`, always `>= numel`.
    pub fn padded_len(&self) -> usize {
        self.chunk * self.group_world_size
    }

    /// Range of real (unpadded) elements in this rank's chunk.
    pub fn real_range(&self) -> Range<usize> {
        let start = (self.local_index * self.chunk).min(self.numel);
        let end = ((self.local_index + 1) * self.chunk).min(self.numel);
        start..end
    }

    /// Zero elements appended to this rank's chunk.
    pub fn padding(&self) -> usize {
        self.chunk - self.real_range().len()
    }
}

/// A tensor that can be split across a group and gathered back in place.
///
/// Starts whole. [`shard`](Self::shard) keeps only this rank's chunk;
/// [`gather`](Self::gather) reassembles the original shape from every rank's
/// chunk. Both are no-ops when the tensor is already in the target state.
pub struct ShardedTensor<R: Runtime> {
    payload: Tensor<R>,
    kind: TensorKind,
    original_shape: Vec<usize>,
    original_numel: usize,
    state: ShardState,
    layout: Option<ShardLayout>,
}

impl<R: Runtime<DType = DType>> ShardedTensor<R> {
    /// Wrap a whole tensor.
    pub fn new(payload: Tensor<R>, kind: TensorKind) -> Self {
        Self {
            original_shape: payload.shape().to_vec(),
            original_numel: payload.numel(),
            payload,
            kind,
            state: ShardState::Whole,
            layout: None,
        }
    }

    /// Current payload: the whole tensor or this rank's flat chunk.
    pub fn payload(&self) -> &Tensor<R> {
        &self.payload
    }

    pub fn into_payload(self) -> Tensor<R> {
        self.payload
    }

    pub fn kind(&self) -> TensorKind {
        self.kind
    }

    pub fn original_shape(&self) -> &[usize] {
        &self.original_shape
    }

    pub fn original_numel(&self) -> usize {
        self.original_numel
    }

    pub fn state(&self) -> ShardState {
        self.state
    }

    pub fn is_sharded(&self) -> bool {
        self.state == ShardState::Sharded
    }

    /// Layout of the current shard, `None` while whole.
    pub fn layout(&self) -> Option<ShardLayout> {
        self.layout
    }

    /// Keep only chunk `local_index` of `group_world_size`.
    ///
    /// Purely local; no communication.
    pub fn shard<C>(&mut self, client: &C, group_world_size: usize, local_index: usize) -> Result<()>
    where
        C: RuntimeClient<R> + ShapeOps<R>,
    {
        if self.state == ShardState::Sharded {
            return Ok(());
        }

        let layout = ShardLayout::new(self.original_numel, group_world_size, local_index)?;

        if !self.is_trivial(group_world_size) {
            let flat = self
                .payload
                .contiguous()
                .reshape(&[self.original_numel])?;
            let real = layout.real_range();
            let padding = layout.padding();
            let dtype = flat.dtype();

            self.payload = if padding == 0 {
                flat.narrow(0, real.start, real.len())?.contiguous()
            } else if real.is_empty() {
                Tensor::<R>::zeros(&[layout.chunk()], dtype, flat.device())
            } else {
                let head = flat.narrow(0, real.start, real.len())?.contiguous();
                let zeros = Tensor::<R>::zeros(&[padding], dtype, flat.device());
                client.cat(&[&head, &zeros], 0)?
            };
        }

        debug!(
            numel = self.original_numel,
            group_world_size,
            local_index,
            chunk = layout.chunk(),
            padding = layout.padding(),
            "sharded tensor"
        );
        self.layout = Some(layout);
        self.state = ShardState::Sharded;
        Ok(())
    }

    /// Reassemble the whole tensor from every member's chunk.
    ///
    /// Collective over `group`: every member must call `gather` with its own
    /// chunk. `local_index` must be this rank's position in `group`.
    pub fn gather(
        &mut self,
        transport: &dyn CollectiveTransport,
        group: &GroupHandle,
        group_world_size: usize,
        local_index: usize,
    ) -> Result<()> {
        if self.state == ShardState::Whole {
            return Ok(());
        }

        if group.size() != group_world_size {
            return Err(Error::InvalidArgument {
                arg: "group_world_size",
                reason: format!(
                    "group {group} has {} ranks, expected {group_world_size}",
                    group.size()
                ),
            });
        }
        if group.position(transport.rank()) != Some(local_index) {
            return Err(Error::InvalidArgument {
                arg: "local_index",
                reason: format!(
                    "rank {} is not at index {local_index} of {group}",
                    transport.rank()
                ),
            });
        }

        self.check_recorded_layout(group_world_size, local_index)?;

        if !self.is_trivial(group_world_size) {
            // Peers holding a different chunk length fail inside the collective.
            let gathered = all_gather_tensor(transport, &self.payload, group)?;
            self.payload = gathered
                .narrow(0, 0, self.original_numel)?
                .contiguous()
                .reshape(&self.original_shape)?;
        }

        debug!(
            numel = self.original_numel,
            group = %group,
            "gathered tensor"
        );
        self.layout = None;
        self.state = ShardState::Whole;
        Ok(())
    }

    /// Shard across this rank's group along `axis` of `topology`.
    pub fn shard_along<C>(
        &mut self,
        client: &C,
        topology: &ProcessTopology,
        axis: ParallelAxis,
    ) -> Result<()>
    where
        C: RuntimeClient<R> + ShapeOps<R>,
    {
        let size = topology.axis_size(axis)?;
        let index = topology.axis_index(axis)?;
        self.shard(client, size, index)
    }

    /// Gather across this rank's group along `axis` of `topology`.
    pub fn gather_along(&mut self, topology: &ProcessTopology, axis: ParallelAxis) -> Result<()> {
        let group = topology.group(axis)?;
        let size = topology.axis_size(axis)?;
        let index = topology.axis_index(axis)?;
        let transport = topology.cache().transport();
        self.gather(transport.as_ref(), &group, size, index)
    }

    /// The shard being gathered must be the one `shard` produced for this
    /// group size and index; a matching chunk length alone is not enough.
    fn check_recorded_layout(&self, group_world_size: usize, local_index: usize) -> Result<()> {
        let expected = ShardLayout::new(self.original_numel, group_world_size, local_index)?;
        let Some(recorded) = self.layout else {
            return Err(Error::ShapeMismatch {
                expected: expected.chunk(),
                got: self.payload.numel(),
            });
        };

        if recorded.group_world_size != group_world_size {
            return Err(Error::ShapeMismatch {
                expected: recorded.padded_len(),
                got: expected.padded_len(),
            });
        }
        if recorded.local_index != local_index {
            return Err(Error::InvalidArgument {
                arg: "local_index",
                reason: format!(
                    "shard holds chunk {} but gather was asked for chunk {local_index}",
                    recorded.local_index
                ),
            });
        }
        if self.payload.numel() != recorded.chunk {
            return Err(Error::ShapeMismatch {
                expected: recorded.chunk,
                got: self.payload.numel(),
            });
        }
        Ok(())
    }

    /// One rank, or nothing to split: the payload stays as it is.
    fn is_trivial(&self, group_world_size: usize) -> bool {
        group_world_size == 1 || self.original_numel == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::distributed::config::TopologyConfig;
    use crate::distributed::group_cache::CommGroupCache;
    use crate::distributed::local::LocalWorld;
    use crate::distributed::transport::{Backend, NoOpTransport};
    use crate::test_utils::cpu_setup;
    use numr::runtime::cpu::CpuRuntime;
    use std::sync::Arc;

    fn arange(n: usize, device: &<CpuRuntime as Runtime>::Device) -> Tensor<CpuRuntime> {
        let data: Vec<f32> = (0..n).map(|i| i as f32).collect();
        Tensor::<CpuRuntime>::from_slice(&data, &[n], device)
    }

    #[test]
    fn test_layout_ten_over_four() {
        let sizes: Vec<(Range<usize>, usize)> = (0..4)
            .map(|i| {
                let l = ShardLayout::new(10, 4, i).unwrap();
                assert_eq!(l.chunk(), 3);
                assert_eq!(l.padded_len(), 12);
                (l.real_range(), l.padding())
            })
            .collect();
        assert_eq!(
            sizes,
            vec![(0..3, 0), (3..6, 0), (6..9, 0), (9..10, 2)]
        );
    }

    #[test]
    fn test_layout_fewer_elements_than_ranks() {
        let l = ShardLayout::new(2, 4, 3).unwrap();
        assert_eq!(l.chunk(), 1);
        assert!(l.real_range().is_empty());
        assert_eq!(l.padding(), 1);
    }

    #[test]
    fn test_layout_rejects_bad_index() {
        assert!(ShardLayout::new(10, 0, 0).is_err());
        assert!(matches!(
            ShardLayout::new(10, 4, 4),
            Err(Error::InvalidArgument { arg: "local_index", .. })
        ));
    }

    #[test]
    fn test_shard_keeps_local_chunk() {
        let (client, device) = cpu_setup();
        let data: Vec<f32> = (0..10).map(|i| i as f32).collect();
        let t = Tensor::<CpuRuntime>::from_slice(&data, &[2, 5], &device);

        let mut s = ShardedTensor::new(t, TensorKind::Data);
        s.shard(&client, 4, 1).unwrap();
        assert!(s.is_sharded());
        assert_eq!(s.payload().shape(), &[3]);
        assert_eq!(s.payload().to_vec::<f32>(), vec![3.0, 4.0, 5.0]);
        assert_eq!(s.original_shape(), &[2, 5]);
        assert_eq!(s.layout().unwrap().chunk(), 3);
    }

    #[test]
    fn test_shard_pads_last_chunk() {
        let (client, device) = cpu_setup();
        let mut s = ShardedTensor::new(arange(10, &device), TensorKind::Grad);
        s.shard(&client, 4, 3).unwrap();
        assert_eq!(s.payload().to_vec::<f32>(), vec![9.0, 0.0, 0.0]);
        assert_eq!(s.kind(), TensorKind::Grad);
    }

    #[test]
    fn test_shard_all_padding_chunk() {
        let (client, device) = cpu_setup();
        let mut s = ShardedTensor::new(arange(2, &device), TensorKind::Data);
        s.shard(&client, 4, 2).unwrap();
        assert_eq!(s.payload().to_vec::<f32>(), vec![0.0]);
    }

    #[test]
    fn test_shard_is_idempotent() {
        let (client, device) = cpu_setup();
        let mut s = ShardedTensor::new(arange(8, &device), TensorKind::Data);
        s.shard(&client, 2, 1).unwrap();
        s.shard(&client, 4, 0).unwrap();
        assert_eq!(s.payload().to_vec::<f32>(), vec![4.0, 5.0, 6.0, 7.0]);
        assert_eq!(s.layout().unwrap().group_world_size(), 2);
    }

    #[test]
    fn test_single_rank_round_trip() {
        let (client, device) = cpu_setup();
        let cache = CommGroupCache::new(Arc::new(NoOpTransport::new()));
        let group = cache.get(&[0], Backend::Primary).unwrap();

        let t = Tensor::<CpuRuntime>::from_slice(&[1.0f32, 2.0, 3.0, 4.0], &[2, 2], &device);
        let mut s = ShardedTensor::new(t, TensorKind::Data);
        s.shard(&client, 1, 0).unwrap();
        assert_eq!(s.payload().shape(), &[2, 2]);

        s.gather(cache.transport().as_ref(), &group, 1, 0).unwrap();
        assert_eq!(s.state(), ShardState::Whole);
        assert_eq!(s.payload().shape(), &[2, 2]);
        assert_eq!(s.payload().to_vec::<f32>(), vec![1.0, 2.0, 3.0, 4.0]);
    }

    #[test]
    fn test_gather_when_whole_is_noop() {
        let (_client, device) = cpu_setup();
        let cache = CommGroupCache::new(Arc::new(NoOpTransport::new()));
        let group = cache.get(&[0], Backend::Primary).unwrap();

        let mut s = ShardedTensor::new(arange(3, &device), TensorKind::Data);
        s.gather(cache.transport().as_ref(), &group, 1, 0).unwrap();
        assert_eq!(s.payload().to_vec::<f32>(), vec![0.0, 1.0, 2.0]);
    }

    #[test]
    fn test_gather_with_mismatched_group_size() {
        let (client, device) = cpu_setup();
        let cache = CommGroupCache::new(Arc::new(NoOpTransport::new()));
        let group = cache.get(&[0], Backend::Primary).unwrap();

        let mut s = ShardedTensor::new(arange(10, &device), TensorKind::Data);
        s.shard(&client, 4, 0).unwrap();

        // Sharded for 4 ranks, gathered as if the group had 1
        let err = s
            .gather(cache.transport().as_ref(), &group, 1, 0)
            .unwrap_err();
        assert!(matches!(
            err,
            Error::ShapeMismatch {
                expected: 12,
                got: 10
            }
        ));
        assert!(s.is_sharded());

        assert!(matches!(
            s.gather(cache.transport().as_ref(), &group, 4, 0),
            Err(Error::InvalidArgument { .. })
        ));
    }

    #[test]
    fn test_gather_rejects_other_group_size_with_same_chunk() {
        let (client, device) = cpu_setup();
        let world = LocalWorld::new(5);
        let cache = CommGroupCache::new(Arc::new(world.endpoint(0).unwrap()));
        let group = cache.get(&[0, 1, 2, 3, 4], Backend::Primary).unwrap();

        // ceil(12 / 4) == ceil(12 / 5) == 3
        let mut s = ShardedTensor::new(arange(12, &device), TensorKind::Data);
        s.shard(&client, 4, 0).unwrap();
        assert_eq!(s.payload().numel(), 3);

        let err = s
            .gather(cache.transport().as_ref(), &group, 5, 0)
            .unwrap_err();
        assert!(matches!(
            err,
            Error::ShapeMismatch {
                expected: 12,
                got: 15
            }
        ));
        assert!(s.is_sharded());
        assert_eq!(s.payload().to_vec::<f32>(), vec![0.0, 1.0, 2.0]);
    }

    #[test]
    fn test_gather_rejects_other_chunk_index() {
        let (client, device) = cpu_setup();
        let world = LocalWorld::new(2);
        let cache = CommGroupCache::new(Arc::new(world.endpoint(1).unwrap()));
        let group = cache.get(&[0, 1], Backend::Primary).unwrap();

        // Rank 1 keeps chunk 0, then gathers as the rank it really is
        let mut s = ShardedTensor::new(arange(4, &device), TensorKind::Data);
        s.shard(&client, 2, 0).unwrap();

        let err = s
            .gather(cache.transport().as_ref(), &group, 2, 1)
            .unwrap_err();
        assert!(matches!(
            err,
            Error::InvalidArgument {
                arg: "local_index",
                ..
            }
        ));
        assert!(s.is_sharded());
        assert_eq!(s.layout().unwrap().local_index(), 0);
    }

    #[test]
    fn test_along_topology_single_process() {
        let (client, device) = cpu_setup();
        let cache = Arc::new(CommGroupCache::new(Arc::new(NoOpTransport::new())));
        let topo = ProcessTopology::new(cache, &TopologyConfig::default()).unwrap();

        let mut s = ShardedTensor::new(arange(5, &device), TensorKind::Data);
        s.shard_along(&client, &topo, ParallelAxis::Data).unwrap();
        s.gather_along(&topo, ParallelAxis::Data).unwrap();
        assert_eq!(s.payload().to_vec::<f32>(), vec![0.0, 1.0, 2.0, 3.0, 4.0]);
    }
}
