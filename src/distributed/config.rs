//! Process topology configuration.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Parameters of a [`ProcessTopology`](crate::distributed::ProcessTopology).
///
/// Every field is optional. Unset `rank` and `ranks` fall back to what the
/// distributed runtime reports; unset degrees are resolved from the world size.
///
/// ```yaml
/// tp_degree: 2
/// dp_degree: 4
/// ```
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TopologyConfig {
    /// Global rank of this process
    #[serde(default)]
    pub rank: Option<usize>,

    /// Ranks forming the grid (any order, sorted at construction)
    #[serde(default)]
    pub ranks: Option<Vec<usize>>,

    /// Tensor-parallel degree (row size)
    #[serde(default)]
    pub tp_degree: Option<usize>,

    /// Data-parallel degree (column size)
    #[serde(default)]
    pub dp_degree: Option<usize>,
}

impl TopologyConfig {
    pub fn with_rank(mut self, rank: usize) -> Self {
        self.rank = Some(rank);
        self
    }

    pub fn with_ranks(mut self, ranks: Vec<usize>) -> Self {
        self.ranks = Some(ranks);
        self
    }

    pub fn with_tp_degree(mut self, tp_degree: usize) -> Self {
        self.tp_degree = Some(tp_degree);
        self
    }

    pub fn with_dp_degree(mut self, dp_degree: usize) -> Self {
        self.dp_degree = Some(dp_degree);
        self
    }

    /// Checks that don't need the runtime: non-zero degrees, distinct ranks.
    pub fn validate(&self) -> Result<()> {
        if self.tp_degree == Some(0) {
            return Err(Error::DegreeMismatch {
                reason: "tp_degree must be > 0".into(),
            });
        }
        if self.dp_degree == Some(0) {
            return Err(Error::DegreeMismatch {
                reason: "dp_degree must be > 0".into(),
            });
        }
        if let Some(ranks) = &self.ranks {
            if ranks.is_empty() {
                return Err(Error::InvalidArgument {
                    arg: "ranks",
                    reason: "rank list must not be empty".into(),
                });
            }
            let mut sorted = ranks.clone();
            sorted.sort_unstable();
            if let Some(w) = sorted.windows(2).find(|w| w[0] == w[1]) {
                return Err(Error::InvalidArgument {
                    arg: "ranks",
                    reason: format!("rank {} listed more than once", w[0]),
                });
            }
        }
        Ok(())
    }

    pub fn load_yaml<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref()).map_err(|e| Error::ConfigError {
            reason: format!("IO error: {e}"),
        })?;
        let config: Self = serde_yaml::from_str(&content).map_err(|e| Error::ConfigError {
            reason: format!("YAML parse error: {e}"),
        })?;
        config.validate()?;
        Ok(config)
    }

    pub fn load_json<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref()).map_err(|e| Error::ConfigError {
            reason: format!("IO error: {e}"),
        })?;
        let config: Self = serde_json::from_str(&content).map_err(|e| Error::ConfigError {
            reason: format!("JSON parse error: {e}"),
        })?;
        config.validate()?;
        Ok(config)
    }
}

/// Resolve `(tp_degree, dp_degree)` for a grid of `world_size` ranks.
///
/// - neither given: `tp = 1`, `dp = world_size`
/// - one given: the other is `world_size / given`, which must divide evenly
/// - both given: their product must equal `world_size`
pub fn resolve_degrees(
    world_size: usize,
    tp_degree: Option<usize>,
    dp_degree: Option<usize>,
) -> Result<(usize, usize)> {
    match (tp_degree, dp_degree) {
        (Some(0), _) | (_, Some(0)) => Err(Error::DegreeMismatch {
            reason: "parallel degrees must be > 0".into(),
        }),
        (None, None) => Ok((1, world_size)),
        (None, Some(dp)) => {
            if world_size % dp != 0 {
                return Err(Error::DegreeMismatch {
                    reason: format!("dp_degree {dp} does not divide world size {world_size}"),
                });
            }
            Ok((world_size / dp, dp))
        }
        (Some(tp), None) => {
            if world_size % tp != 0 {
                return Err(Error::DegreeMismatch {
                    reason: format!("tp_degree {tp} does not divide world size {world_size}"),
                });
            }
            Ok((tp, world_size / tp))
        }
        (Some(tp), Some(dp)) => {
            if tp.checked_mul(dp) != Some(world_size) {
                return Err(Error::DegreeMismatch {
                    reason: format!(
                        "world size {world_size} != tp_degree {tp} * dp_degree {dp}"
                    ),
                });
            }
            Ok((tp, dp))
        }
    }
}
