//! Process-wide cache of communication groups.
//!
//! Group creation is collective and expensive, so each `(backend, ranks)` pair
//! is created once and the handle is reused for the life of the process.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex};

use crate::distributed::transport::{Backend, CollectiveTransport, GroupId};
use crate::error::{Error, Result};
use tracing::{debug, info};

/// A created communication group.
#[derive(Debug, PartialEq, Eq)]
pub struct CommGroup {
    id: GroupId,
    backend: Backend,
    ranks: Vec<usize>,
}

/// Shared handle to a cached [`CommGroup`].
///
/// Clones point at the same group; use [`GroupHandle::ptr_eq`] to compare
/// identity rather than membership.
#[derive(Debug, Clone)]
pub struct GroupHandle(Arc<CommGroup>);

impl GroupHandle {
    /// Transport-assigned id.
    pub fn id(&self) -> GroupId {
        self.0.id
    }

    pub fn backend(&self) -> Backend {
        self.0.backend
    }

    /// Member ranks, ascending.
    pub fn ranks(&self) -> &[usize] {
        &self.0.ranks
    }

    /// Number of members.
    pub fn size(&self) -> usize {
        self.0.ranks.len()
    }

    pub fn contains(&self, rank: usize) -> bool {
        self.position(rank).is_some()
    }

    /// Index of `rank` within the group, i.e. its slot in an all-gather result.
    pub fn position(&self, rank: usize) -> Option<usize> {
        self.0.ranks.binary_search(&rank).ok()
    }

    /// Whether both handles refer to the same cached group.
    pub fn ptr_eq(&self, other: &GroupHandle) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

impl fmt::Display for GroupHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} [{}] {:?}", self.0.id, self.0.backend, self.0.ranks)
    }
}

type GroupKey = (Backend, Vec<usize>);

/// Maps `(backend, sorted ranks)` to the group created for it.
///
/// Owned by the caller (one per process) and shared with every topology via
/// `Arc`. Entries are only ever added. A miss issues a collective
/// `create_group` call, so every process must request keys in the same order;
/// [`ProcessTopology`](crate::distributed::ProcessTopology) takes care of that.
pub struct CommGroupCache {
    transport: Arc<dyn CollectiveTransport>,
    groups: Mutex<HashMap<GroupKey, GroupHandle>>,
}

impl CommGroupCache {
    pub fn new(transport: Arc<dyn CollectiveTransport>) -> Self {
        Self {
            transport,
            groups: Mutex::new(HashMap::new()),
        }
    }

    /// The transport groups are created on.
    pub fn transport(&self) -> &Arc<dyn CollectiveTransport> {
        &self.transport
    }

    /// Return the group for `ranks` on `backend`, creating it on first use.
    ///
    /// `ranks` may be given in any order. Blocks on a miss until every process
    /// in the world has issued the same creation call.
    pub fn get(&self, ranks: &[usize], backend: Backend) -> Result<GroupHandle> {
        let key = (backend, normalize_ranks(ranks)?);

        let mut groups = self.groups.lock().map_err(|_| Error::DistributedError {
            reason: "group cache lock poisoned".to_string(),
        })?;

        if let Some(handle) = groups.get(&key) {
            debug!("group cache hit: {} {:?}", backend, key.1);
            return Ok(handle.clone());
        }

        let id = self.transport.create_group(&key.1, backend)?;
        let handle = GroupHandle(Arc::new(CommGroup {
            id,
            backend,
            ranks: key.1.clone(),
        }));
        info!(rank = self.transport.rank(), "created communication group {handle}");
        groups.insert(key, handle.clone());

        Ok(handle)
    }

    /// Whether a group for `ranks` on `backend` has been created.
    pub fn contains(&self, ranks: &[usize], backend: Backend) -> bool {
        let Ok(ranks) = normalize_ranks(ranks) else {
            return false;
        };
        self.groups
            .lock()
            .map(|groups| groups.contains_key(&(backend, ranks)))
            .unwrap_or(false)
    }

    /// Number of cached groups.
    pub fn len(&self) -> usize {
        self.groups.lock().map(|groups| groups.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl fmt::Debug for CommGroupCache {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CommGroupCache")
            .field("rank", &self.transport.rank())
            .field("groups", &self.len())
            .finish()
    }
}

/// Sort ranks ascending, rejecting empty and duplicate rank lists.
fn normalize_ranks(ranks: &[usize]) -> Result<Vec<usize>> {
    if ranks.is_empty() {
        return Err(Error::InvalidArgument {
            arg: "ranks",
            reason: "group must contain at least one rank".to_string(),
        });
    }
    let mut sorted = ranks.to_vec();
    sorted.sort_unstable();
    if let Some(w) = sorted.windows(2).find(|w| w[0] == w[1]) {
        return Err(Error::InvalidArgument {
            arg: "ranks",
            reason: format!("rank {} appears more than once in {ranks:?}", w[0]),
        });
    }
    Ok(sorted)
}
