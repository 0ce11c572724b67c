use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Mutex;

use anyhow::{bail, Result};
use async_trait::async_trait;
use rand::prelude::*;

use crate::assignment::table::ShardMetrics;
use crate::models::{Cluster, DataCenter, Group, GroupId, JobState, Node, NodeId, NodeRole, NodeStatus, ShardId, Table};
use crate::orchestrator::{Runner, RunnerRequest, RunnerStatus};
use crate::topology::TopologyStore;
use crate::versions::{CoordinationStore, MemoryStore};

/// The id of the cluster created by `seed_topology`.
pub const CLUSTER_ID: u64 = 1;
/// The id of the data center created by `seed_topology`.
pub const DC_ID: u64 = 2;

/// A group of cluster 1 & data center 1 with no placed shards.
pub fn group(id: GroupId, shard_count: u32, replica_factor: u32) -> Group {
    Group {
        id,
        name: format!("group-{}", id),
        cluster_id: CLUSTER_ID,
        dc_id: DC_ID,
        shard_count,
        replica_factor,
        reduce_rate: 0,
        assignment_version: 0,
    }
}

/// An active, leader-capable node holding no shards.
pub fn node(id: NodeId, group_id: GroupId, weight: u32) -> Node {
    Node {
        id,
        group_id,
        host: format!("10.0.0.{}", id),
        port: 7000,
        weight,
        role: NodeRole::Leader,
        status: NodeStatus::Active,
        leader_shards: vec![],
        follower_shards: vec![],
        is_edge: false,
        ansible_config_id: None,
        config_id: None,
        description: String::new(),
        deleted: false,
    }
}

/// Nodes of the given group from `(id, weight, leader shards, follower shards)` tuples.
pub fn placed_nodes(group: &Group, specs: Vec<(NodeId, u32, Vec<ShardId>, Vec<ShardId>)>) -> Vec<Node> {
    specs
        .into_iter()
        .map(|(id, weight, leaders, followers)| {
            let mut node = node(id, group.id, weight);
            node.leader_shards = leaders;
            node.follower_shards = followers;
            node
        })
        .collect()
}

pub fn table(id: u64, group_id: GroupId, shard_count: u32) -> Table {
    Table {
        id,
        database: "db".into(),
        name: format!("table-{}", id),
        group_id,
        shard_count,
        ttl_seconds: 0,
        config_name: None,
        edge_flow_ratio: 0,
        bind_edge_nodes: vec![],
    }
}

/// Random size & kps metrics for `count` shards.
pub fn random_shard_metrics(count: u32) -> BTreeMap<ShardId, ShardMetrics> {
    let mut rng = rand::thread_rng();
    (0..count)
        .map(|shard| (shard, ShardMetrics { size: rng.gen_range(1..10_000), kps: rng.gen_range(1..500) }))
        .collect()
}

/// Create a cluster, a data center & one empty group, returning the group.
pub async fn seed_topology(store: &TopologyStore, shard_count: u32, replica_factor: u32) -> Result<Group> {
    store
        .transact(|tx| {
            let cluster_id = tx.next_id();
            let dc_id = tx.next_id();
            let group_id = tx.next_id();
            tx.put_cluster(Cluster { id: cluster_id, name: "cluster".into(), dc_ids: [dc_id].into_iter().collect() });
            tx.put_dc(DataCenter { id: dc_id, name: "dc".into(), cluster_id });
            let group = Group { id: group_id, ..group(group_id, shard_count, replica_factor) };
            tx.put_group(group.clone());
            Ok(group)
        })
        .await
}

/// A runner whose jobs only finish when a test says so.
#[derive(Default)]
pub struct FakeRunner {
    next_job: AtomicU64,
    unavailable: AtomicBool,
    jobs: Mutex<HashMap<String, (NodeId, RunnerStatus)>>,
    requests: Mutex<Vec<RunnerRequest>>,
    cancelled: Mutex<Vec<String>>,
}

impl FakeRunner {
    /// Make every subsequent submission fail, or succeed again.
    pub fn set_unavailable(&self, val: bool) {
        self.unavailable.store(val, Ordering::SeqCst);
    }

    /// Finish every running job with the given state.
    pub fn finish_all(&self, state: JobState) {
        let mut jobs = self.jobs.lock().unwrap();
        for (_, status) in jobs.values_mut().filter(|(_, status)| status.state == JobState::Running) {
            *status = RunnerStatus { state, detail: finished_detail(state) };
        }
    }

    /// Finish the running jobs of one node with the given state.
    pub fn finish_node(&self, node_id: NodeId, state: JobState) {
        let mut jobs = self.jobs.lock().unwrap();
        for (_, status) in jobs.values_mut().filter(|(node, status)| *node == node_id && status.state == JobState::Running) {
            *status = RunnerStatus { state, detail: finished_detail(state) };
        }
    }

    pub fn requests(&self) -> Vec<RunnerRequest> {
        self.requests.lock().unwrap().clone()
    }

    pub fn cancelled(&self) -> Vec<String> {
        self.cancelled.lock().unwrap().clone()
    }
}

fn finished_detail(state: JobState) -> String {
    match state {
        JobState::Succeeded => crate::orchestrator::LOG_DONE.into(),
        _ => crate::orchestrator::LOG_FAILED.into(),
    }
}

#[async_trait]
impl Runner for FakeRunner {
    async fn run(&self, request: &RunnerRequest) -> Result<String> {
        if self.unavailable.load(Ordering::SeqCst) {
            bail!("runner is unreachable");
        }
        let job_id = format!("job-{}", self.next_job.fetch_add(1, Ordering::SeqCst));
        let status = RunnerStatus { state: JobState::Running, detail: String::new() };
        self.jobs.lock().unwrap().insert(job_id.clone(), (request.target.node_id, status));
        self.requests.lock().unwrap().push(request.clone());
        Ok(job_id)
    }

    async fn status(&self, job_id: &str) -> Result<RunnerStatus> {
        match self.jobs.lock().unwrap().get(job_id) {
            Some((_, status)) => Ok(status.clone()),
            None => bail!("unknown job {}", job_id),
        }
    }

    async fn cancel(&self, job_id: &str) -> Result<()> {
        self.cancelled.lock().unwrap().push(job_id.to_string());
        Ok(())
    }
}

/// A coordination store which records every accepted put and can be made unreachable.
#[derive(Default)]
pub struct RecordingStore {
    inner: MemoryStore,
    unavailable: AtomicBool,
    history: Mutex<Vec<(String, Vec<u8>)>>,
}

impl RecordingStore {
    /// Make every subsequent put fail, or succeed again.
    pub fn set_unavailable(&self, val: bool) {
        self.unavailable.store(val, Ordering::SeqCst);
    }

    /// Every accepted put in order.
    pub fn history(&self) -> Vec<(String, Vec<u8>)> {
        self.history.lock().unwrap().clone()
    }
}

#[async_trait]
impl CoordinationStore for RecordingStore {
    async fn put(&self, key: &str, value: &[u8]) -> Result<()> {
        if self.unavailable.load(Ordering::SeqCst) {
            bail!("coordination store is unavailable");
        }
        self.inner.put(key, value).await?;
        self.history.lock().unwrap().push((key.to_string(), value.to_vec()));
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        self.inner.get(key).await
    }
}
