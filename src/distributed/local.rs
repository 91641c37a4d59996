//! In-process simulated world of N ranks.
//!
//! Each rank gets a [`LocalTransport`] endpoint, meant to be driven from its
//! own thread the way a real job runs one process per rank. Buffers are host
//! memory, so this pairs with numr's CPU runtime.
//!
//! Group creation does not block. Instead the world keeps the global sequence
//! of creation calls and rejects any rank whose n-th call differs from what the
//! other ranks issued as their n-th call. On a real transport that divergence
//! hangs the job; here it surfaces as a `DistributedError`.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Barrier, Mutex, MutexGuard};

use crate::distributed::group_cache::GroupHandle;
use crate::distributed::transport::{Backend, CollectiveTransport, DistributedRuntime, GroupId};
use crate::error::{Error, Result};
use numr::dtype::DType;

/// Rendezvous state for all-gathers on one group.
struct GatherSlots {
    barrier: Barrier,
    slots: Mutex<Vec<Vec<u8>>>,
}

/// Shared state of a simulated world.
pub struct LocalWorld {
    world_size: usize,
    creations: Mutex<Vec<(Vec<usize>, Backend)>>,
    gathers: Mutex<HashMap<GroupId, Arc<GatherSlots>>>,
    world_barrier: Barrier,
}

impl LocalWorld {
    pub fn new(world_size: usize) -> Arc<Self> {
        Arc::new(Self {
            world_size,
            creations: Mutex::new(Vec::new()),
            gathers: Mutex::new(HashMap::new()),
            world_barrier: Barrier::new(world_size.max(1)),
        })
    }

    pub fn world_size(&self) -> usize {
        self.world_size
    }

    /// Endpoint for `rank`.
    pub fn endpoint(self: &Arc<Self>, rank: usize) -> Result<LocalTransport> {
        if rank >= self.world_size {
            return Err(Error::InvalidArgument {
                arg: "rank",
                reason: format!("rank {rank} >= world_size {}", self.world_size),
            });
        }
        Ok(LocalTransport {
            world: Arc::clone(self),
            rank,
            created: AtomicU64::new(0),
        })
    }

    /// One endpoint per rank, in rank order.
    pub fn endpoints(self: &Arc<Self>) -> Vec<LocalTransport> {
        (0..self.world_size)
            .map(|rank| LocalTransport {
                world: Arc::clone(self),
                rank,
                created: AtomicU64::new(0),
            })
            .collect()
    }

    /// Number of distinct groups created so far across the world.
    pub fn groups_created(&self) -> usize {
        lock(&self.creations).map(|c| c.len()).unwrap_or(0)
    }

    fn gather_slots(&self, group: &GroupHandle) -> Result<Arc<GatherSlots>> {
        let mut gathers = lock(&self.gathers)?;
        let slots = gathers.entry(group.id()).or_insert_with(|| {
            Arc::new(GatherSlots {
                barrier: Barrier::new(group.size()),
                slots: Mutex::new(vec![Vec::new(); group.size()]),
            })
        });
        Ok(Arc::clone(slots))
    }
}

/// One rank's view of a [`LocalWorld`].
pub struct LocalTransport {
    world: Arc<LocalWorld>,
    rank: usize,
    created: AtomicU64,
}

impl LocalTransport {
    pub fn world(&self) -> &Arc<LocalWorld> {
        &self.world
    }
}

impl DistributedRuntime for LocalTransport {
    fn is_active(&self) -> bool {
        true
    }

    fn rank(&self) -> usize {
        self.rank
    }

    fn world_size(&self) -> usize {
        self.world.world_size
    }
}

impl CollectiveTransport for LocalTransport {
    fn create_group(&self, ranks: &[usize], backend: Backend) -> Result<GroupId> {
        if let Some(&bad) = ranks.iter().find(|&&r| r >= self.world.world_size) {
            return Err(Error::DistributedError {
                reason: format!(
                    "rank {bad} outside world of size {}",
                    self.world.world_size
                ),
            });
        }

        let seq = self.created.fetch_add(1, Ordering::SeqCst);
        let mut creations = lock(&self.world.creations)?;
        match creations.get(seq as usize) {
            Some((expected_ranks, expected_backend))
                if expected_ranks.as_slice() != ranks || *expected_backend != backend =>
            {
                Err(Error::DistributedError {
                    reason: format!(
                        "rank {} diverged at group creation #{seq}: issued {ranks:?} on {backend}, \
                         other ranks issued {expected_ranks:?} on {expected_backend}",
                        self.rank
                    ),
                })
            }
            Some(_) => Ok(GroupId(seq)),
            None => {
                creations.push((ranks.to_vec(), backend));
                Ok(GroupId(seq))
            }
        }
    }

    unsafe fn all_gather(
        &self,
        send_ptr: u64,
        recv_ptr: u64,
        count: usize,
        dtype: DType,
        group: &GroupHandle,
    ) -> Result<()> {
        let pos = group
            .position(self.rank)
            .ok_or_else(|| Error::DistributedError {
                reason: format!("rank {} is not a member of {group}", self.rank),
            })?;
        let gather = self.world.gather_slots(group)?;
        let elem_size = dtype.size_in_bytes();
        let bytes = count * elem_size;

        // Safety: caller guarantees `send_ptr` holds `count` elements of `dtype`
        let local = unsafe { std::slice::from_raw_parts(send_ptr as *const u8, bytes) }.to_vec();
        let staged = lock(&gather.slots).map(|mut slots| slots[pos] = local);

        gather.barrier.wait();

        let outcome = staged.and_then(|()| {
            let slots = lock(&gather.slots)?;
            if let Some(bad) = slots.iter().find(|s| s.len() != bytes) {
                return Err(Error::ShapeMismatch {
                    expected: count,
                    got: bad.len() / elem_size.max(1),
                });
            }
            for (i, slot) in slots.iter().enumerate() {
                // Safety: caller guarantees `recv_ptr` holds `count * group.size()` elements
                unsafe {
                    std::ptr::copy_nonoverlapping(
                        slot.as_ptr(),
                        (recv_ptr as *mut u8).add(i * bytes),
                        bytes,
                    );
                }
            }
            Ok(())
        });

        // Nobody may restage until every member has read this round.
        gather.barrier.wait();

        outcome
    }

    fn barrier(&self) -> Result<()> {
        self.world.world_barrier.wait();
        Ok(())
    }
}

fn lock<T>(mutex: &Mutex<T>) -> Result<MutexGuard<'_, T>> {
    mutex.lock().map_err(|_| Error::DistributedError {
        reason: "local world state poisoned by a panicked rank".to_string(),
    })
}
