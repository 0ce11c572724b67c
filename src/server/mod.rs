//! The HTTP API server.

mod prom;

use std::collections::BTreeMap;
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::routing::{get, post, put};
use axum::{Json, Router};
use metrics_exporter_prometheus::PrometheusHandle;
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::net::TcpListener;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

use crate::assignment::table::{ListStrategy, ShardListAssignment, ShardMetrics};
use crate::config::Config;
use crate::controller::{
    BatchItem, ChangeHandle, Controller, GroupSettings, MutationOutcome, NewAnsibleConfig, NewGroup, NewNode, OperationReport, PendingChange,
};
use crate::error::{AppError, ServerResult};
use crate::models::{
    AnsibleConfig, Cluster, ClusterId, ConfigDomain, ConfigVersion, DataCenter, DiffEntry, Group, GroupId, Node, NodeId, NodeRole, NodeStatus,
    Operation, OperationId, ShardAssignment, ShardId, Table, TableId, Ticket, TicketId, VersionRef, VersionedPayload,
};
use crate::topology::TopologyDocument;
use crate::validator::{ConfigDrift, GroupReadiness};

/// The state shared by all handlers.
#[derive(Clone)]
pub struct ServerState {
    pub controller: Arc<Controller>,
    pub metrics: PrometheusHandle,
}

/// Spawn the HTTP server, which also serves the metrics endpoint.
///
/// The server triggers a graceful shutdown of the whole process when it stops.
pub fn spawn_server(config: &Config, state: ServerState, shutdown: broadcast::Sender<()>) -> JoinHandle<Result<()>> {
    let app = router(state);
    let port = config.http_port;
    let mut shutdown_rx = shutdown.subscribe();
    tokio::spawn(async move {
        let res = async move {
            let listener = TcpListener::bind(("0.0.0.0", port)).await.context("error binding HTTP listener")?;
            tracing::info!("HTTP server is listening at 0.0.0.0:{}", port);
            axum::serve(listener, app)
                .with_graceful_shutdown(async move {
                    let _res = shutdown_rx.recv().await;
                })
                .await
                .context("error from HTTP server")
        }
        .await;
        let _res = shutdown.send(());
        res
    })
}

/// Build the API router.
pub fn router(state: ServerState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/metrics", get(prom::prometheus_scrape))
        .route("/api/v1/topology", get(get_topology))
        .route("/api/v1/clusters", post(add_cluster))
        .route("/api/v1/clusters/:id/dcs", post(add_dc))
        .route("/api/v1/groups", post(add_group))
        .route("/api/v1/groups/:id", get(get_group).patch(update_group))
        .route("/api/v1/groups/:id/readiness", get(group_readiness))
        .route("/api/v1/groups/:id/rebalance", post(rebalance_group))
        .route("/api/v1/groups/:id/assignment", put(reassign_shards))
        .route("/api/v1/nodes", post(add_node))
        .route("/api/v1/nodes/batch", post(batch_store_nodes))
        .route("/api/v1/nodes/batch-delete", post(batch_delete_nodes))
        .route("/api/v1/nodes/:id", get(get_node).delete(remove_node))
        .route("/api/v1/nodes/:id/role", put(change_role))
        .route("/api/v1/nodes/:id/status", put(update_node_status))
        .route("/api/v1/nodes/:id/restart", post(restart_node))
        .route("/api/v1/tables", post(upsert_table))
        .route("/api/v1/tables/:id/shard-lists", post(assign_table_shard_lists))
        .route("/api/v1/ansible-configs", post(add_ansible_config))
        .route("/api/v1/operations", get(list_operations))
        .route("/api/v1/operations/:id", get(poll_operation))
        .route("/api/v1/operations/:id/cancel", post(cancel_operation))
        .route("/api/v1/operations/:id/recompute", post(recompute_change))
        .route("/api/v1/changes", get(pending_changes))
        .route("/api/v1/configs/:domain/versions", get(list_versions).post(snapshot_config))
        .route("/api/v1/configs/:domain/versions/:version", get(get_version))
        .route("/api/v1/configs/:domain/versions/:version/sync", post(sync_version))
        .route("/api/v1/configs/:domain/diff", get(diff_versions))
        .route("/api/v1/configs/:domain/rollback", post(rollback))
        .route("/api/v1/configs/:domain/sync", post(sync_pending))
        .route("/api/v1/configs/:domain/published", get(published))
        .route("/api/v1/configs/:domain/drift", get(config_drift))
        .route("/api/v1/tickets", get(list_tickets).post(create_ticket))
        .route("/api/v1/tickets/:id", get(get_ticket))
        .route("/api/v1/tickets/:id/start", post(start_ticket))
        .route("/api/v1/tickets/:id/link", post(link_ticket))
        .route("/api/v1/tickets/:id/complete", post(complete_ticket))
        .route("/api/v1/tickets/:id/reject", post(reject_ticket))
        .with_state(state)
}

/////////////////////////////////////////////////////////////////////////////
// Request bodies ///////////////////////////////////////////////////////////

#[derive(Deserialize)]
struct NameBody {
    name: String,
}

#[derive(Deserialize)]
struct RoleBody {
    role: NodeRole,
}

#[derive(Deserialize)]
struct StatusBody {
    status: NodeStatus,
}

#[derive(Deserialize)]
struct NodeIdsBody {
    node_ids: Vec<NodeId>,
}

#[derive(Deserialize)]
struct ShardListsBody {
    list_count: u32,
    strategy: ListStrategy,
    #[serde(default)]
    metrics: BTreeMap<ShardId, ShardMetrics>,
}

#[derive(Deserialize)]
struct SnapshotBody {
    #[serde(default)]
    payload: Option<Value>,
}

#[derive(Deserialize)]
struct RollbackBody {
    to_version: u64,
}

#[derive(Deserialize)]
struct DiffQuery {
    from: u64,
    to: u64,
}

#[derive(Deserialize)]
struct TicketBody {
    description: String,
}

#[derive(Deserialize)]
struct LinkBody {
    #[serde(default)]
    operations: Vec<OperationId>,
    #[serde(default)]
    versions: Vec<VersionRef>,
}

#[derive(Deserialize)]
struct RejectBody {
    reason: String,
}

/////////////////////////////////////////////////////////////////////////////
// Handlers /////////////////////////////////////////////////////////////////

async fn health() -> StatusCode {
    StatusCode::OK
}

async fn get_topology(State(state): State<ServerState>) -> Json<TopologyDocument> {
    Json(state.controller.topology().snapshot().topology_document())
}

async fn add_cluster(State(state): State<ServerState>, Json(body): Json<NameBody>) -> ServerResult<(StatusCode, Json<Cluster>)> {
    let cluster = state.controller.add_cluster(body.name).await?;
    Ok((StatusCode::CREATED, Json(cluster)))
}

async fn add_dc(
    State(state): State<ServerState>, Path(cluster_id): Path<ClusterId>, Json(body): Json<NameBody>,
) -> ServerResult<(StatusCode, Json<DataCenter>)> {
    let dc = state.controller.add_dc(cluster_id, body.name).await?;
    Ok((StatusCode::CREATED, Json(dc)))
}

async fn add_group(State(state): State<ServerState>, Json(body): Json<NewGroup>) -> ServerResult<(StatusCode, Json<Value>)> {
    let (group, outcome) = state.controller.add_group(body).await?;
    Ok((StatusCode::CREATED, Json(json!({"group": group, "outcome": outcome}))))
}

async fn get_group(State(state): State<ServerState>, Path(id): Path<GroupId>) -> ServerResult<Json<Value>> {
    let group: Group = state
        .controller
        .topology()
        .get_group(id)
        .ok_or_else(|| anyhow::Error::from(AppError::ResourceNotFound(format!("group {}", id))))?;
    let nodes = state.controller.topology().list_nodes(id);
    Ok(Json(json!({"group": group, "nodes": nodes})))
}

async fn update_group(
    State(state): State<ServerState>, Path(id): Path<GroupId>, Json(body): Json<GroupSettings>,
) -> ServerResult<Json<MutationOutcome>> {
    Ok(Json(state.controller.update_group(id, body).await?))
}

async fn group_readiness(State(state): State<ServerState>, Path(id): Path<GroupId>) -> ServerResult<Json<GroupReadiness>> {
    Ok(Json(state.controller.group_readiness(id)?))
}

async fn rebalance_group(State(state): State<ServerState>, Path(id): Path<GroupId>) -> ServerResult<Json<MutationOutcome>> {
    Ok(Json(state.controller.rebalance_group(id).await?))
}

async fn reassign_shards(
    State(state): State<ServerState>, Path(id): Path<GroupId>, Json(body): Json<ShardAssignment>,
) -> ServerResult<(StatusCode, Json<ChangeHandle>)> {
    Ok((StatusCode::ACCEPTED, Json(state.controller.reassign_shards(id, body).await?)))
}

async fn add_node(State(state): State<ServerState>, Json(body): Json<NewNode>) -> ServerResult<(StatusCode, Json<ChangeHandle>)> {
    Ok((StatusCode::ACCEPTED, Json(state.controller.add_node(body).await?)))
}

async fn batch_store_nodes(State(state): State<ServerState>, Json(body): Json<Vec<NewNode>>) -> Json<Vec<BatchItem>> {
    Json(state.controller.batch_store_nodes(body).await)
}

async fn batch_delete_nodes(State(state): State<ServerState>, Json(body): Json<NodeIdsBody>) -> Json<Vec<BatchItem>> {
    Json(state.controller.batch_delete_nodes(body.node_ids).await)
}

async fn get_node(State(state): State<ServerState>, Path(id): Path<NodeId>) -> ServerResult<Json<Node>> {
    let node = state
        .controller
        .topology()
        .get_node(id)
        .ok_or_else(|| anyhow::Error::from(AppError::ResourceNotFound(format!("node {}", id))))?;
    Ok(Json(node))
}

async fn remove_node(State(state): State<ServerState>, Path(id): Path<NodeId>) -> ServerResult<Json<ChangeHandle>> {
    Ok(Json(state.controller.remove_node(id).await?))
}

async fn change_role(State(state): State<ServerState>, Path(id): Path<NodeId>, Json(body): Json<RoleBody>) -> ServerResult<Json<ChangeHandle>> {
    Ok(Json(state.controller.change_role(id, body.role).await?))
}

async fn update_node_status(
    State(state): State<ServerState>, Path(id): Path<NodeId>, Json(body): Json<StatusBody>,
) -> ServerResult<Json<MutationOutcome>> {
    Ok(Json(state.controller.update_node_status(id, body.status).await?))
}

async fn restart_node(State(state): State<ServerState>, Path(id): Path<NodeId>) -> ServerResult<(StatusCode, Json<ChangeHandle>)> {
    Ok((StatusCode::ACCEPTED, Json(state.controller.restart_node(id).await?)))
}

async fn upsert_table(State(state): State<ServerState>, Json(body): Json<Table>) -> ServerResult<Json<Value>> {
    let (table, outcome) = state.controller.upsert_table(body).await?;
    Ok(Json(json!({"table": table, "outcome": outcome})))
}

async fn assign_table_shard_lists(
    State(state): State<ServerState>, Path(id): Path<TableId>, Json(body): Json<ShardListsBody>,
) -> ServerResult<Json<ShardListAssignment>> {
    Ok(Json(state.controller.assign_table_shard_lists(id, body.list_count, body.strategy, body.metrics)?))
}

async fn add_ansible_config(
    State(state): State<ServerState>, Json(body): Json<NewAnsibleConfig>,
) -> ServerResult<(StatusCode, Json<AnsibleConfig>)> {
    Ok((StatusCode::CREATED, Json(state.controller.add_ansible_config(body).await?)))
}

async fn list_operations(State(state): State<ServerState>) -> ServerResult<Json<Vec<Operation>>> {
    Ok(Json(state.controller.orchestrator().list().await?))
}

async fn poll_operation(State(state): State<ServerState>, Path(id): Path<OperationId>) -> ServerResult<Json<OperationReport>> {
    Ok(Json(state.controller.poll_operation(id).await?))
}

async fn cancel_operation(State(state): State<ServerState>, Path(id): Path<OperationId>) -> ServerResult<Json<OperationReport>> {
    Ok(Json(state.controller.cancel_operation(id).await?))
}

async fn recompute_change(State(state): State<ServerState>, Path(id): Path<OperationId>) -> ServerResult<Json<MutationOutcome>> {
    Ok(Json(state.controller.recompute_change(id).await?))
}

async fn pending_changes(State(state): State<ServerState>) -> Json<Vec<PendingChange>> {
    Json(state.controller.pending_changes().await)
}

async fn list_versions(State(state): State<ServerState>, Path(domain): Path<String>) -> ServerResult<Json<Vec<ConfigVersion>>> {
    Ok(Json(state.controller.versions().list(domain.parse()?).await?))
}

async fn snapshot_config(
    State(state): State<ServerState>, Path(domain): Path<String>, Json(body): Json<SnapshotBody>,
) -> ServerResult<(StatusCode, Json<ConfigVersion>)> {
    let version = state.controller.snapshot_config(domain.parse()?, body.payload).await?;
    Ok((StatusCode::CREATED, Json(version)))
}

async fn get_version(State(state): State<ServerState>, Path((domain, version)): Path<(String, u64)>) -> ServerResult<Json<ConfigVersion>> {
    Ok(Json(state.controller.versions().get(domain.parse()?, version).await?))
}

async fn sync_version(State(state): State<ServerState>, Path((domain, version)): Path<(String, u64)>) -> ServerResult<Json<Value>> {
    let synced = state.controller.sync(domain.parse()?, version).await?;
    Ok(Json(json!({ "synced": synced })))
}

async fn diff_versions(
    State(state): State<ServerState>, Path(domain): Path<String>, Query(query): Query<DiffQuery>,
) -> ServerResult<Json<Vec<DiffEntry>>> {
    Ok(Json(state.controller.versions().diff(domain.parse()?, query.from, query.to).await?))
}

async fn rollback(
    State(state): State<ServerState>, Path(domain): Path<String>, Json(body): Json<RollbackBody>,
) -> ServerResult<Json<MutationOutcome>> {
    Ok(Json(state.controller.rollback(domain.parse()?, body.to_version).await?))
}

async fn sync_pending(State(state): State<ServerState>, Path(domain): Path<String>) -> ServerResult<Json<Value>> {
    let pushed = state.controller.sync_pending(domain.parse()?).await?;
    Ok(Json(json!({ "pushed": pushed })))
}

async fn published(State(state): State<ServerState>, Path(domain): Path<String>) -> ServerResult<Json<Option<VersionedPayload>>> {
    let domain: ConfigDomain = domain.parse()?;
    Ok(Json(state.controller.published(domain).await?))
}

async fn config_drift(State(state): State<ServerState>, Path(domain): Path<String>) -> ServerResult<Json<ConfigDrift>> {
    let domain: ConfigDomain = domain.parse()?;
    Ok(Json(state.controller.drift(domain).await?))
}

async fn list_tickets(State(state): State<ServerState>) -> Json<Vec<Ticket>> {
    Json(state.controller.tickets().list().await)
}

async fn create_ticket(State(state): State<ServerState>, Json(body): Json<TicketBody>) -> ServerResult<(StatusCode, Json<Ticket>)> {
    Ok((StatusCode::CREATED, Json(state.controller.tickets().create(body.description).await?)))
}

async fn get_ticket(State(state): State<ServerState>, Path(id): Path<TicketId>) -> ServerResult<Json<Ticket>> {
    Ok(Json(state.controller.tickets().get(id).await?))
}

async fn start_ticket(State(state): State<ServerState>, Path(id): Path<TicketId>) -> ServerResult<Json<Ticket>> {
    Ok(Json(state.controller.tickets().start(id).await?))
}

async fn link_ticket(State(state): State<ServerState>, Path(id): Path<TicketId>, Json(body): Json<LinkBody>) -> ServerResult<Json<Ticket>> {
    Ok(Json(state.controller.tickets().link(id, body.operations, body.versions).await?))
}

async fn complete_ticket(State(state): State<ServerState>, Path(id): Path<TicketId>) -> ServerResult<Json<Ticket>> {
    Ok(Json(state.controller.tickets().complete(id).await?))
}

async fn reject_ticket(State(state): State<ServerState>, Path(id): Path<TicketId>, Json(body): Json<RejectBody>) -> ServerResult<Json<Ticket>> {
    Ok(Json(state.controller.tickets().reject(id, body.reason).await?))
}
