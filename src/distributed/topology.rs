//! 2D tensor-parallel × data-parallel process topology.
//!
//! The grid is laid out row-major over the sorted world ranks: row `i`
//! holds positions `[i * tp, (i + 1) * tp)` and column `j` holds positions
//! `{i * tp + j}`. A row is a tensor-parallel group, a column a data-parallel
//! group. With `ranks = [0, 1, 2, 3]`, `tp = 2`, `dp = 2`:
//!
//! ```text
//! row 0: {0, 1}    col 0: {0, 2}
//! row 1: {2, 3}    col 1: {1, 3}
//! ```
//!
//! Construction creates every row group, then every column group, in index
//! order. Group membership depends only on `ranks` and the degrees, which are
//! identical on every process, so all processes issue the same sequence of
//! collective creation calls.

use std::fmt;
use std::sync::Arc;

use crate::distributed::config::{TopologyConfig, resolve_degrees};
use crate::distributed::group_cache::{CommGroupCache, GroupHandle};
use crate::distributed::transport::Backend;
use crate::error::{Error, Result};
use tracing::{debug, info};

/// One of the two grid axes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ParallelAxis {
    /// Grid row: ranks holding different slices of the same layer
    Tensor,
    /// Grid column: ranks holding replicas of the same slice
    Data,
}

/// Resolved grid of an initialized topology.
#[derive(Debug, Clone)]
struct Grid {
    rank: usize,
    ranks: Vec<usize>,
    tp_degree: usize,
    dp_degree: usize,
    /// Position of `rank` within `ranks`
    position: usize,
    row_ranks: Vec<usize>,
    col_ranks: Vec<usize>,
    cpu_groups: bool,
}

impl Grid {
    fn row(&self, i: usize) -> Vec<usize> {
        row_members(&self.ranks, self.tp_degree, i)
    }

    fn col(&self, j: usize) -> Vec<usize> {
        col_members(&self.ranks, self.tp_degree, self.dp_degree, j)
    }
}

fn row_members(ranks: &[usize], tp_degree: usize, i: usize) -> Vec<usize> {
    ranks[i * tp_degree..(i + 1) * tp_degree].to_vec()
}

fn col_members(ranks: &[usize], tp_degree: usize, dp_degree: usize, j: usize) -> Vec<usize> {
    (0..dp_degree).map(|i| ranks[i * tp_degree + j]).collect()
}

/// Partition of the world into tensor-parallel rows and data-parallel columns.
///
/// Built once per job and shared afterwards; the only later mutation is the
/// one-time [`extend_cpu_groups`](Self::extend_cpu_groups). When the
/// distributed runtime is not active the topology is "uninitialized" and every
/// rank or group accessor returns [`Error::NotInitialized`].
pub struct ProcessTopology {
    grid: Option<Grid>,
    cache: Arc<CommGroupCache>,
}

impl ProcessTopology {
    /// Build the topology and create every row and column group.
    ///
    /// All validation happens before the first group is created, so a failed
    /// construction issues no collective calls.
    pub fn new(cache: Arc<CommGroupCache>, config: &TopologyConfig) -> Result<Self> {
        let runtime = Arc::clone(cache.transport());
        if !runtime.is_active() {
            debug!("distributed runtime inactive, building uninitialized topology");
            return Ok(Self::uninitialized(cache));
        }
        config.validate()?;

        let rank = config.rank.unwrap_or_else(|| runtime.rank());
        let mut ranks = config
            .ranks
            .clone()
            .unwrap_or_else(|| (0..runtime.world_size()).collect());
        ranks.sort_unstable();

        let position = ranks
            .binary_search(&rank)
            .map_err(|_| Error::InvalidArgument {
                arg: "rank",
                reason: format!("rank {rank} is not one of the grid ranks {ranks:?}"),
            })?;

        let world_size = ranks.len();
        let (tp_degree, dp_degree) =
            resolve_degrees(world_size, config.tp_degree, config.dp_degree)?;

        let row_ranks = row_members(&ranks, tp_degree, position / tp_degree);
        let col_ranks = col_members(&ranks, tp_degree, dp_degree, position % tp_degree);

        let grid = Grid {
            rank,
            ranks,
            tp_degree,
            dp_degree,
            position,
            row_ranks,
            col_ranks,
            cpu_groups: false,
        };
        register_groups(&cache, &grid, Backend::Primary)?;

        info!(
            rank,
            world_size, tp_degree, dp_degree, "process topology initialized"
        );
        Ok(Self {
            grid: Some(grid),
            cache,
        })
    }

    /// A topology for use before the distributed runtime starts.
    pub fn uninitialized(cache: Arc<CommGroupCache>) -> Self {
        Self { grid: None, cache }
    }

    /// Create every row and column group on the CPU backend as well.
    ///
    /// Idempotent: the second and later calls do nothing.
    pub fn extend_cpu_groups(&mut self) -> Result<()> {
        let grid = self.grid.as_mut().ok_or(Error::NotExtendable)?;
        if grid.cpu_groups {
            return Ok(());
        }
        register_groups(&self.cache, grid, Backend::CpuFallback)?;
        grid.cpu_groups = true;
        Ok(())
    }

    pub fn is_initialized(&self) -> bool {
        self.grid.is_some()
    }

    pub fn has_cpu_groups(&self) -> bool {
        self.grid.as_ref().is_some_and(|g| g.cpu_groups)
    }

    pub fn cache(&self) -> &Arc<CommGroupCache> {
        &self.cache
    }

    fn grid(&self) -> Result<&Grid> {
        self.grid.as_ref().ok_or(Error::NotInitialized)
    }

    /// Global rank of this process.
    pub fn rank(&self) -> Result<usize> {
        Ok(self.grid()?.rank)
    }

    /// All grid ranks, ascending.
    pub fn ranks(&self) -> Result<&[usize]> {
        Ok(&self.grid()?.ranks)
    }

    pub fn world_size(&self) -> Result<usize> {
        Ok(self.grid()?.ranks.len())
    }

    pub fn tp_degree(&self) -> Result<usize> {
        Ok(self.grid()?.tp_degree)
    }

    pub fn dp_degree(&self) -> Result<usize> {
        Ok(self.grid()?.dp_degree)
    }

    /// Tensor-parallel peers of this rank (its grid row), itself included.
    pub fn row_ranks(&self) -> Result<&[usize]> {
        Ok(&self.grid()?.row_ranks)
    }

    /// Data-parallel peers of this rank (its grid column), itself included.
    pub fn col_ranks(&self) -> Result<&[usize]> {
        Ok(&self.grid()?.col_ranks)
    }

    pub fn row_size(&self) -> Result<usize> {
        Ok(self.grid()?.row_ranks.len())
    }

    pub fn col_size(&self) -> Result<usize> {
        Ok(self.grid()?.col_ranks.len())
    }

    /// Index of this rank within its row (its tensor-parallel rank).
    pub fn local_row_index(&self) -> Result<usize> {
        let grid = self.grid()?;
        Ok(grid.position % grid.tp_degree)
    }

    /// Index of this rank within its column (its data-parallel rank).
    ///
    /// Both local indices come from the rank's position in the sorted grid
    /// ranks, so a grid over ranks `4..8` still yields indices from zero;
    /// for a `0..world_size` grid this equals `rank / tp_degree`.
    pub fn local_col_index(&self) -> Result<usize> {
        let grid = self.grid()?;
        Ok(grid.position / grid.tp_degree)
    }

    pub fn row_group(&self) -> Result<GroupHandle> {
        self.cache.get(self.row_ranks()?, Backend::Primary)
    }

    pub fn col_group(&self) -> Result<GroupHandle> {
        self.cache.get(self.col_ranks()?, Backend::Primary)
    }

    pub fn cpu_row_group(&self) -> Result<GroupHandle> {
        let ranks = self.row_ranks()?;
        self.require_cpu_groups()?;
        self.cache.get(ranks, Backend::CpuFallback)
    }

    pub fn cpu_col_group(&self) -> Result<GroupHandle> {
        let ranks = self.col_ranks()?;
        self.require_cpu_groups()?;
        self.cache.get(ranks, Backend::CpuFallback)
    }

    fn require_cpu_groups(&self) -> Result<()> {
        if self.has_cpu_groups() {
            Ok(())
        } else {
            Err(Error::CpuGroupsNotMaterialized)
        }
    }

    /// Ranks of this process's group along `axis`.
    pub fn axis_ranks(&self, axis: ParallelAxis) -> Result<&[usize]> {
        match axis {
            ParallelAxis::Tensor => self.row_ranks(),
            ParallelAxis::Data => self.col_ranks(),
        }
    }

    pub fn axis_size(&self, axis: ParallelAxis) -> Result<usize> {
        Ok(self.axis_ranks(axis)?.len())
    }

    /// Index of this rank within its group along `axis`.
    pub fn axis_index(&self, axis: ParallelAxis) -> Result<usize> {
        match axis {
            ParallelAxis::Tensor => self.local_row_index(),
            ParallelAxis::Data => self.local_col_index(),
        }
    }

    /// Primary-backend group along `axis`.
    pub fn group(&self, axis: ParallelAxis) -> Result<GroupHandle> {
        match axis {
            ParallelAxis::Tensor => self.row_group(),
            ParallelAxis::Data => self.col_group(),
        }
    }

    /// CPU-backend group along `axis`.
    pub fn cpu_group(&self, axis: ParallelAxis) -> Result<GroupHandle> {
        match axis {
            ParallelAxis::Tensor => self.cpu_row_group(),
            ParallelAxis::Data => self.cpu_col_group(),
        }
    }
}

/// Create all row groups, then all column groups, on `backend`.
fn register_groups(cache: &CommGroupCache, grid: &Grid, backend: Backend) -> Result<()> {
    for i in 0..grid.dp_degree {
        cache.get(&grid.row(i), backend)?;
    }
    for j in 0..grid.tp_degree {
        cache.get(&grid.col(j), backend)?;
    }
    debug!(
        "registered {} row and {} column groups on {backend}",
        grid.dp_degree, grid.tp_degree
    );
    Ok(())
}

impl PartialEq for ProcessTopology {
    fn eq(&self, other: &Self) -> bool {
        match (&self.grid, &other.grid) {
            (None, None) => true,
            (Some(a), Some(b)) => {
                a.rank == b.rank
                    && a.ranks == b.ranks
                    && a.row_ranks == b.row_ranks
                    && a.col_ranks == b.col_ranks
                    && a.tp_degree == b.tp_degree
                    && a.dp_degree == b.dp_degree
            }
            _ => false,
        }
    }
}

impl fmt::Display for ProcessTopology {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.grid {
            Some(g) => write!(
                f,
                "ProcessTopology: rank {}, world size {}, dp degree {}, tp degree {}, ranks {:?}",
                g.rank,
                g.ranks.len(),
                g.dp_degree,
                g.tp_degree,
                g.ranks
            ),
            None => write!(f, "ProcessTopology not initialized"),
        }
    }
}

impl fmt::Debug for ProcessTopology {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProcessTopology")
            .field("grid", &self.grid)
            .finish_non_exhaustive()
    }
}
