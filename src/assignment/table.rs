//! Table shard-list assignment.
//!
//! Splits the shards of one table into a number of lists, e.g. to spread a bulk load or a
//! migration across workers.

use std::collections::BTreeMap;

use anyhow::{bail, Result};
use serde::{Deserialize, Serialize};

use crate::error::AppError;
use crate::models::ShardId;

/// The strategy used to split shards into lists.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ListStrategy {
    /// Round-robin by shard id.
    Num,
    /// Greedy balancing of the total shard size.
    Size,
    /// Greedy balancing of the total shard kps.
    Kps,
}

/// Observed load of one shard.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShardMetrics {
    #[serde(default)]
    pub size: u64,
    #[serde(default)]
    pub kps: u64,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShardList {
    pub shards: Vec<ShardId>,
    pub size_sum: u64,
    pub kps_sum: u64,
}

impl ShardList {
    fn push(&mut self, shard: ShardId, metrics: ShardMetrics) {
        self.shards.push(shard);
        self.size_sum += metrics.size;
        self.kps_sum += metrics.kps;
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShardListAssignment {
    pub total: ShardList,
    pub lists: Vec<ShardList>,
}

/// Split `shards` into `list_count` lists using the given strategy.
///
/// Every list's shard ids are ascending. Greedy strategies place the heaviest shard first into
/// the currently lightest list, the lowest list index wins ties.
pub fn assign_shard_lists(shards: &BTreeMap<ShardId, ShardMetrics>, list_count: u32, strategy: ListStrategy) -> Result<ShardListAssignment> {
    if list_count == 0 {
        bail!(AppError::InvalidInput("at least one shard list must be requested".into()));
    }
    if list_count as usize > shards.len() {
        bail!(AppError::InvalidInput(format!(
            "requested {} shard lists but the table only has {} shards",
            list_count,
            shards.len()
        )));
    }

    let mut lists = vec![ShardList::default(); list_count as usize];
    match strategy {
        ListStrategy::Num => {
            let count = lists.len();
            for (idx, (shard, metrics)) in shards.iter().enumerate() {
                lists[idx % count].push(*shard, *metrics);
            }
        }
        ListStrategy::Size | ListStrategy::Kps => {
            let weight = |metrics: &ShardMetrics| if strategy == ListStrategy::Size { metrics.size } else { metrics.kps };
            let mut ordered: Vec<(&ShardId, &ShardMetrics)> = shards.iter().collect();
            ordered.sort_by(|a, b| weight(b.1).cmp(&weight(a.1)).then(a.0.cmp(b.0)));
            for (shard, metrics) in ordered {
                let lightest = lists
                    .iter()
                    .enumerate()
                    .min_by_key(|(idx, list)| (if strategy == ListStrategy::Size { list.size_sum } else { list.kps_sum }, *idx))
                    .map(|(idx, _)| idx)
                    .unwrap_or(0);
                lists[lightest].push(*shard, *metrics);
            }
            for list in lists.iter_mut() {
                list.shards.sort_unstable();
            }
        }
    }

    let mut total = ShardList::default();
    for (shard, metrics) in shards.iter() {
        total.push(*shard, *metrics);
    }
    Ok(ShardListAssignment { total, lists })
}
