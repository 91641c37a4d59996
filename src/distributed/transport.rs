//! The seam between shardgrid and the collective-communication transport.
//!
//! shardgrid never moves bytes over the wire itself. It decides which groups
//! exist and when collectives are issued; the transport behind
//! [`CollectiveTransport`] performs them. Device buffers cross this seam as raw
//! pointers, the same convention numr's `Communicator` uses.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::distributed::group_cache::GroupHandle;
use crate::error::{Error, Result};
use numr::dtype::DType;
use serde::{Deserialize, Serialize};

/// Communication backend a group is created on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Backend {
    /// Device-side collectives (NCCL-like)
    Primary,
    /// Host-side collectives for CPU tensors and control traffic (Gloo-like)
    CpuFallback,
}

impl fmt::Display for Backend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Backend::Primary => write!(f, "primary"),
            Backend::CpuFallback => write!(f, "cpu_fallback"),
        }
    }
}

/// Transport-assigned identifier of a created group.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct GroupId(pub u64);

impl fmt::Display for GroupId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "group#{}", self.0)
    }
}

/// Identity queries answered by the distributed runtime.
pub trait DistributedRuntime: Send + Sync {
    /// Whether the runtime has been initialized for this process.
    fn is_active(&self) -> bool;
    /// Global rank of this process.
    fn rank(&self) -> usize;
    /// Number of processes in the world.
    fn world_size(&self) -> usize;
}

/// Collective primitives shardgrid orchestrates.
///
/// Every method is collective: all participating processes must issue the
/// matching call, in the same order, or the job stalls.
pub trait CollectiveTransport: DistributedRuntime {
    /// Create a group over `ranks` (ascending, distinct) on `backend`.
    ///
    /// Must be called by every process in the world, members or not.
    fn create_group(&self, ranks: &[usize], backend: Backend) -> Result<GroupId>;

    /// Gather `count` elements from every member of `group` into `recv_ptr`.
    ///
    /// The receive buffer holds `count * group.size()` elements, filled in
    /// group rank order.
    ///
    /// # Safety
    ///
    /// `send_ptr` must point to `count` valid elements of `dtype` and
    /// `recv_ptr` to `count * group.size()` writable elements of `dtype`, both
    /// on a device this transport can address.
    unsafe fn all_gather(
        &self,
        send_ptr: u64,
        recv_ptr: u64,
        count: usize,
        dtype: DType,
        group: &GroupHandle,
    ) -> Result<()>;

    /// Block until every process in the world reaches the barrier.
    fn barrier(&self) -> Result<()>;
}

/// Transport for a single process (rank 0 of a world of 1).
///
/// Group creation hands out sequential ids; all-gather over a one-member group
/// is a local copy. `NoOpTransport::inactive()` reports an uninitialized
/// runtime.
#[derive(Debug, Default)]
pub struct NoOpTransport {
    inactive: bool,
    next_group: AtomicU64,
}

impl NoOpTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// A transport whose runtime has not been started.
    pub fn inactive() -> Self {
        Self {
            inactive: true,
            next_group: AtomicU64::new(0),
        }
    }
}

impl DistributedRuntime for NoOpTransport {
    fn is_active(&self) -> bool {
        !self.inactive
    }

    fn rank(&self) -> usize {
        0
    }

    fn world_size(&self) -> usize {
        1
    }
}

impl CollectiveTransport for NoOpTransport {
    fn create_group(&self, ranks: &[usize], _backend: Backend) -> Result<GroupId> {
        if ranks != [0usize].as_slice() {
            return Err(Error::DistributedError {
                reason: format!("single-process transport cannot create group over {ranks:?}"),
            });
        }
        Ok(GroupId(self.next_group.fetch_add(1, Ordering::Relaxed)))
    }

    unsafe fn all_gather(
        &self,
        send_ptr: u64,
        recv_ptr: u64,
        count: usize,
        dtype: DType,
        group: &GroupHandle,
    ) -> Result<()> {
        if group.size() != 1 {
            return Err(Error::DistributedError {
                reason: format!(
                    "single-process transport cannot all_gather over {} ranks",
                    group.size()
                ),
            });
        }
        let bytes = count * dtype.size_in_bytes();
        // Safety: caller guarantees both buffers hold `count` elements of `dtype`
        unsafe {
            std::ptr::copy(send_ptr as *const u8, recv_ptr as *mut u8, bytes);
        }
        Ok(())
    }

    fn barrier(&self) -> Result<()> {
        Ok(())
    }
}
