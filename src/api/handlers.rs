use std::collections::{BTreeMap, BTreeSet};

use axum::extract::rejection::JsonRejection;
use axum::extract::{Path, Query, State};
use axum::http::HeaderMap;
use axum::routing::{get, post, put};
use axum::{Json, Router};
use uuid::Uuid;

use super::views::*;
use super::{ApiError, ApiState, QueryOptions, REQUEST_ID_HEADER};
use crate::error::{StevedoreError, ValidationError};
use crate::model::{Allocation, HealthCheckResult, JobSpec};
use crate::registry::{self, ServiceInstance, ServiceQuery};
use crate::scheduler::{dispatch, dispatch_id};
use crate::state::{now_ms, Command};

type ApiResult<T> = Result<Json<T>, ApiError>;

pub(super) fn routes() -> Router<ApiState> {
    Router::new()
        .route("/status/leader", get(leader))
        .route("/status/peers", get(peers))
        .route("/status/health", get(health))
        .route("/nodes", get(list_nodes))
        .route("/node/{id}", get(get_node))
        .route("/jobs", get(list_jobs))
        .route("/job/{id}", put(submit_job).get(get_job).delete(stop_job))
        .route("/job/{id}/dispatch", post(dispatch_job))
        .route("/job/{id}/allocations", get(job_allocations))
        .route("/allocation/{id}", get(get_allocation))
        .route("/catalog/services", get(catalog_services))
        .route("/catalog/service/{name}", get(catalog_service))
        .route("/health/{check_id}", get(get_check))
}

fn request_id(headers: &HeaderMap) -> String {
    headers
        .get(REQUEST_ID_HEADER)
        .and_then(|v| v.to_str().ok())
        .filter(|v| !v.is_empty())
        .map(str::to_string)
        .unwrap_or_else(|| Uuid::new_v4().to_string())
}

fn body<T>(payload: Result<Json<T>, JsonRejection>) -> Result<T, ApiError> {
    payload
        .map(|Json(value)| value)
        .map_err(|rejection| ValidationError::Malformed(rejection.body_text()).into())
}

async fn leader(State(api): State<ApiState>) -> ApiResult<LeaderInfo> {
    let leader_id = api.raft.get_leader_id().await;
    let address = match leader_id {
        Some(id) => api.raft.peer_addr(id).await.unwrap_or_default(),
        None => String::new(),
    };
    let http_addr = match leader_id {
        Some(id) => api
            .store
            .snapshot()
            .await
            .nodes
            .get(&id)
            .map(|n| n.registration.http_addr.clone()),
        None => None,
    };
    Ok(Json(LeaderInfo {
        leader_id,
        address,
        http_addr,
    }))
}

async fn peers(State(api): State<ApiState>) -> ApiResult<Vec<PeerInfo>> {
    let peers = api
        .raft
        .voters()
        .await
        .into_iter()
        .map(|(node_id, address)| PeerInfo { node_id, address })
        .collect();
    Ok(Json(peers))
}

/// 0 healthy, 1 degraded, 2 critical.
pub fn health_code(
    applied_index: u64,
    leader_id: Option<u64>,
    is_leader: bool,
    last_contact: std::time::Duration,
    max_stale: std::time::Duration,
) -> u8 {
    if applied_index == 0 {
        2
    } else if leader_id.is_none() || (!is_leader && last_contact > max_stale) {
        1
    } else {
        0
    }
}

async fn health(State(api): State<ApiState>) -> ApiResult<HealthReport> {
    let leader_id = api.raft.get_leader_id().await;
    let last_contact = api.raft.last_contact().await;
    let applied_index = api.store.applied_index();
    let code = health_code(
        applied_index,
        leader_id,
        leader_id == Some(api.raft.id),
        last_contact,
        api.max_stale,
    );
    let status = match code {
        0 => "healthy",
        1 => "degraded",
        _ => "critical",
    };
    Ok(Json(HealthReport {
        status: status.to_string(),
        code,
        node_id: api.raft.id,
        leader_id,
        applied_index,
        last_contact_ms: last_contact.as_millis() as u64,
    }))
}

async fn list_nodes(
    State(api): State<ApiState>,
    Query(opts): Query<QueryOptions>,
) -> ApiResult<Vec<NodeSummary>> {
    let state = api.read(&opts).await?;
    Ok(Json(
        state
            .nodes
            .values()
            .map(|node| NodeSummary::new(&state, node))
            .collect(),
    ))
}

async fn get_node(
    State(api): State<ApiState>,
    Path(id): Path<u64>,
    Query(opts): Query<QueryOptions>,
) -> ApiResult<NodeDetail> {
    let state = api.read(&opts).await?;
    let node = state.nodes.get(&id).ok_or(StevedoreError::NodeNotFound(id))?;
    Ok(Json(NodeDetail {
        node: node.clone(),
        used: state.node_used(id),
        allocations: state.allocations_for_node(id).cloned().collect(),
    }))
}

async fn list_jobs(
    State(api): State<ApiState>,
    Query(opts): Query<QueryOptions>,
) -> ApiResult<Vec<JobSummary>> {
    let state = api.read(&opts).await?;
    Ok(Json(state.jobs.values().map(JobSummary::from).collect()))
}

async fn get_job(
    State(api): State<ApiState>,
    Path(id): Path<String>,
    Query(opts): Query<QueryOptions>,
) -> ApiResult<JobView> {
    let state = api.read(&opts).await?;
    let record = state.jobs.get(&id).ok_or(StevedoreError::JobNotFound(id))?;
    Ok(Json(JobView::from(record)))
}

async fn submit_job(
    State(api): State<ApiState>,
    Path(id): Path<String>,
    Query(opts): Query<QueryOptions>,
    headers: HeaderMap,
    payload: Result<Json<JobSpec>, JsonRejection>,
) -> ApiResult<WriteResponse> {
    let mut spec = body(payload)?;
    if spec.id.is_empty() {
        spec.id = id.clone();
    } else if spec.id != id {
        return Err(ValidationError::JobIdMismatch {
            path: id,
            body: spec.id,
        }
        .into());
    }
    let job = spec.into_job()?;

    let rid = request_id(&headers);
    let index = api
        .write(&rid, Command::SubmitJob { job, at_ms: now_ms() }, &opts)
        .await?;
    tracing::info!(job_id = %id, index, "Job submitted");
    Ok(Json(WriteResponse {
        job_id: id,
        index,
        request_id: rid,
    }))
}

async fn stop_job(
    State(api): State<ApiState>,
    Path(id): Path<String>,
    Query(opts): Query<QueryOptions>,
    headers: HeaderMap,
) -> ApiResult<WriteResponse> {
    // An unknown job is rejected when the entry applies.
    let rid = request_id(&headers);
    let command = Command::StopJob {
        job_id: id.clone(),
        at_ms: now_ms(),
    };
    let index = api.write(&rid, command, &opts).await?;
    tracing::info!(job_id = %id, index, "Job stopped");
    Ok(Json(WriteResponse {
        job_id: id,
        index,
        request_id: rid,
    }))
}

async fn dispatch_job(
    State(api): State<ApiState>,
    Path(id): Path<String>,
    Query(opts): Query<QueryOptions>,
    headers: HeaderMap,
    payload: Result<Json<DispatchRequest>, JsonRejection>,
) -> ApiResult<WriteResponse> {
    let request = body(payload)?;
    let rid = request_id(&headers);
    let child_id = dispatch_id(&id, Some(&rid));

    // Fail fast on bad meta when this node already has the template. The
    // authoritative check runs when the entry applies.
    let state = api.store.snapshot().await;
    if let Some(template) = state.jobs.get(&id).and_then(|r| r.job.as_template()) {
        dispatch(template, &request.meta, &child_id)?;
    }
    drop(state);

    let command = Command::DispatchJob {
        parent_id: id.clone(),
        child_id: child_id.clone(),
        meta: request.meta,
        at_ms: now_ms(),
    };
    let index = api.write(&rid, command, &opts).await?;
    tracing::info!(parent_id = %id, job_id = %child_id, index, "Job dispatched");
    Ok(Json(WriteResponse {
        job_id: child_id,
        index,
        request_id: rid,
    }))
}

async fn job_allocations(
    State(api): State<ApiState>,
    Path(id): Path<String>,
    Query(opts): Query<QueryOptions>,
) -> ApiResult<Vec<Allocation>> {
    let state = api.read(&opts).await?;
    if !state.jobs.contains_key(&id) {
        return Err(StevedoreError::JobNotFound(id).into());
    }
    Ok(Json(
        state
            .allocations_for_job(&id)
            .into_iter()
            .cloned()
            .collect(),
    ))
}

async fn get_allocation(
    State(api): State<ApiState>,
    Path(id): Path<String>,
    Query(opts): Query<QueryOptions>,
) -> ApiResult<Allocation> {
    let alloc_id = Uuid::parse_str(&id)
        .map_err(|_| ValidationError::Malformed(format!("invalid allocation id {:?}", id)))?;
    let state = api.read(&opts).await?;
    let alloc = state
        .allocations
        .get(&alloc_id)
        .ok_or(StevedoreError::AllocationNotFound(alloc_id))?;
    Ok(Json(alloc.clone()))
}

async fn catalog_services(
    State(api): State<ApiState>,
    Query(opts): Query<QueryOptions>,
) -> ApiResult<BTreeMap<String, BTreeSet<String>>> {
    let state = api.read(&opts).await?;
    Ok(Json(registry::catalog(&state)))
}

async fn catalog_service(
    State(api): State<ApiState>,
    Path(name): Path<String>,
    Query(opts): Query<QueryOptions>,
) -> ApiResult<Vec<ServiceInstance>> {
    let state = api.read(&opts).await?;
    let query = ServiceQuery {
        tag: opts.tag.clone(),
        passing: opts.flag(&opts.passing),
        all: opts.flag(&opts.all),
    };
    Ok(Json(registry::lookup(&state, &name, &query)))
}

async fn get_check(
    State(api): State<ApiState>,
    Path(check_id): Path<String>,
    Query(opts): Query<QueryOptions>,
) -> ApiResult<HealthCheckResult> {
    let state = api.read(&opts).await?;
    let check = state
        .checks
        .get(&check_id)
        .ok_or(StevedoreError::CheckNotFound(check_id))?;
    Ok(Json(check.clone()))
}
