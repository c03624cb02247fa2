//! HTTP/JSON control API.
//!
//! Reads are answered from the local applied state; non-leaders relay
//! everything except `?stale` reads and `/status/*` to the leader's HTTP
//! address. Writes go through the [`Proposer`] and return once the entry is
//! applied locally, so a follow-up read on the same node observes it.

pub mod client;
mod handlers;
pub mod views;

use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use axum::extract::{Request, State};
use axum::http::{HeaderMap, HeaderName, HeaderValue, Method, StatusCode};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::{Json, Router};
use serde::Deserialize;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::config::{AclConfig, AclPolicy, NodeConfig};
use crate::error::{StevedoreError, ValidationError};
use crate::grpc::Proposer;
use crate::raft::RaftNode;
use crate::state::{ApplyOutcome, ClusterState, Command, StateStore};

pub use client::ApiClient;
pub use views::*;

pub const INDEX_HEADER: &str = "x-stevedore-index";
pub const KNOWN_LEADER_HEADER: &str = "x-stevedore-known-leader";
pub const LAST_CONTACT_HEADER: &str = "x-stevedore-last-contact";
pub const FORWARDED_HEADER: &str = "x-stevedore-forwarded";
pub const TOKEN_HEADER: &str = "x-stevedore-token";
pub const REQUEST_ID_HEADER: &str = "x-request-id";

/// Largest request body relayed to the leader.
const MAX_RELAY_BODY: usize = 4 * 1024 * 1024;

/// Shared state behind every handler.
#[derive(Clone)]
pub struct ApiState {
    raft: Arc<RaftNode>,
    proposer: Arc<Proposer>,
    store: StateStore,
    acl: Arc<AclConfig>,
    request_timeout: Duration,
    max_stale: Duration,
    default_wait: Duration,
    max_wait: Duration,
    http: reqwest::Client,
}

impl ApiState {
    pub fn new(proposer: Arc<Proposer>, store: StateStore, config: &NodeConfig) -> Self {
        Self {
            raft: proposer.raft().clone(),
            proposer,
            store,
            acl: Arc::new(config.acl.clone()),
            request_timeout: config.request_timeout,
            max_stale: config.max_stale,
            default_wait: config.default_wait,
            max_wait: config.max_wait,
            http: reqwest::Client::new(),
        }
    }

    /// State for a read, honouring `?consistent` and blocking `?index`.
    async fn read(&self, opts: &QueryOptions) -> Result<Arc<ClusterState>, ApiError> {
        if opts.flag(&opts.consistent) {
            self.raft.confirm_leadership().await?;
        } else if !opts.flag(&opts.stale) && !self.raft.is_leader().await {
            // Not relayed because the leader has not registered yet: at least
            // catch up with everything this node knows to be committed.
            let commit = self.raft.commit_index().await;
            self.store.wait_for_index(commit, self.request_timeout).await;
        }
        match opts.index {
            Some(index) => {
                let wait = opts
                    .duration(&opts.wait)?
                    .unwrap_or(self.default_wait)
                    .min(self.max_wait);
                let (_, state) = self.store.wait_for_index(index, wait).await;
                Ok(state)
            }
            None => Ok(self.store.snapshot().await),
        }
    }

    /// Propose a command and wait until it is applied on this node.
    ///
    /// A command the state machine rejected is reported as an error.
    async fn write(
        &self,
        request_id: &str,
        command: Command,
        opts: &QueryOptions,
    ) -> Result<u64, ApiError> {
        let timeout = opts.duration(&opts.timeout)?.unwrap_or(self.request_timeout);
        let index = self
            .proposer
            .propose_with_retry(Some(request_id.to_string()), command, timeout)
            .await?;
        match self.store.wait_for_outcome(index, timeout).await {
            Some(ApplyOutcome::Rejected(rejection)) => Err(StevedoreError::from(rejection).into()),
            Some(_) => Ok(index),
            None => Err(StevedoreError::ProposalTimeout(timeout).into()),
        }
    }

    /// HTTP address of the leader when it is another node.
    async fn leader_route(&self) -> Result<Option<String>, StevedoreError> {
        let leader = self.raft.get_leader_id().await.ok_or(StevedoreError::NoLeader)?;
        if leader == self.raft.id {
            return Ok(None);
        }
        if self.raft.is_disconnected(leader).await {
            return Err(StevedoreError::NoLeader);
        }
        let state = self.store.snapshot().await;
        // Until the leader has registered, writes still reach it through the
        // proposer and reads wait for the local commit index.
        Ok(state
            .nodes
            .get(&leader)
            .map(|n| n.registration.http_addr.clone()))
    }

    async fn relay(&self, addr: &str, req: Request) -> Result<Response, StevedoreError> {
        let (parts, body) = req.into_parts();
        let body = axum::body::to_bytes(body, MAX_RELAY_BODY)
            .await
            .map_err(|e| ValidationError::Malformed(e.to_string()))?;
        let path = parts
            .uri
            .path_and_query()
            .map(|p| p.as_str())
            .unwrap_or("/");
        let url = format!("http://{}{}", addr, path);
        tracing::debug!(method = %parts.method, url = %url, "Forwarding request to leader");

        let mut builder = self
            .http
            .request(parts.method.clone(), url)
            .timeout(self.max_wait + self.request_timeout)
            .header(FORWARDED_HEADER, self.raft.id.to_string())
            .body(body);
        for name in [TOKEN_HEADER, REQUEST_ID_HEADER, "content-type"] {
            if let Some(value) = parts.headers.get(name) {
                builder = builder.header(name, value.clone());
            }
        }
        let resp = builder.send().await?;

        let status = resp.status();
        let headers = resp.headers().clone();
        let bytes = resp.bytes().await?;
        let mut out = Response::new(Body::from(bytes));
        *out.status_mut() = status;
        for (name, value) in headers.iter() {
            if name.as_str() == "content-type" || name.as_str().starts_with("x-stevedore-") {
                out.headers_mut().insert(name.clone(), value.clone());
            }
        }
        Ok(out)
    }
}

/// Options shared by every route; unused ones are ignored.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct QueryOptions {
    pub stale: Option<String>,
    pub consistent: Option<String>,
    pub index: Option<u64>,
    pub wait: Option<String>,
    pub timeout: Option<String>,
    pub passing: Option<String>,
    pub tag: Option<String>,
    pub all: Option<String>,
}

impl QueryOptions {
    /// `?flag` and `?flag=true` are set; `?flag=false` is not.
    fn flag(&self, value: &Option<String>) -> bool {
        matches!(value.as_deref(), Some(v) if v != "false" && v != "0")
    }

    fn duration(&self, value: &Option<String>) -> Result<Option<Duration>, ApiError> {
        value
            .as_deref()
            .map(|raw| {
                humantime::parse_duration(raw).map_err(|e| {
                    ApiError(
                        ValidationError::Malformed(format!("invalid duration {:?}: {}", raw, e))
                            .into(),
                    )
                })
            })
            .transpose()
    }
}

/// An error rendered as `{ code, message, retryable }`.
#[derive(Debug)]
pub struct ApiError(pub StevedoreError);

impl<E: Into<StevedoreError>> From<E> for ApiError {
    fn from(err: E) -> Self {
        ApiError(err.into())
    }
}

pub fn status_for(err: &StevedoreError) -> StatusCode {
    match err {
        StevedoreError::Validation(_)
        | StevedoreError::NotParameterized(_)
        | StevedoreError::Serialization(_) => StatusCode::BAD_REQUEST,
        StevedoreError::PermissionDenied => StatusCode::FORBIDDEN,
        StevedoreError::JobNotFound(_)
        | StevedoreError::AllocationNotFound(_)
        | StevedoreError::NodeNotFound(_)
        | StevedoreError::CheckNotFound(_) => StatusCode::NOT_FOUND,
        StevedoreError::ProposalTimeout(_) => StatusCode::GATEWAY_TIMEOUT,
        StevedoreError::Conflict(_) => StatusCode::CONFLICT,
        e if e.is_retryable() => StatusCode::SERVICE_UNAVAILABLE,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = status_for(&self.0);
        if status.is_server_error() {
            tracing::warn!(code = self.0.reason_code(), error = %self.0, "Request failed");
        }
        let body = ErrorBody {
            code: self.0.reason_code().to_string(),
            message: self.0.to_string(),
            retryable: self.0.is_retryable(),
        };
        (status, Json(body)).into_response()
    }
}

/// Decide whether a request may proceed under the ACL configuration.
pub fn authorize(
    acl: &AclConfig,
    method: &Method,
    path: &str,
    headers: &HeaderMap,
) -> Result<(), StevedoreError> {
    if !acl.enabled || path.starts_with("/status/") {
        return Ok(());
    }
    let token = headers.get(TOKEN_HEADER).and_then(|v| v.to_str().ok());
    if let (Some(token), Some(management)) = (token, acl.management_token.as_deref()) {
        if token == management {
            return Ok(());
        }
    }
    let is_read = *method == Method::GET || *method == Method::HEAD;
    if is_read && acl.default_policy == AclPolicy::Allow {
        Ok(())
    } else {
        Err(StevedoreError::PermissionDenied)
    }
}

async fn enforce_acl(State(api): State<ApiState>, req: Request, next: Next) -> Response {
    if let Err(e) = authorize(&api.acl, req.method(), req.uri().path(), req.headers()) {
        return ApiError(e).into_response();
    }
    next.run(req).await
}

fn wants_local(req: &Request) -> bool {
    if req.uri().path().starts_with("/status/") || req.headers().contains_key(FORWARDED_HEADER) {
        return true;
    }
    req.uri()
        .query()
        .map(|q| {
            q.split('&').any(|pair| {
                let mut kv = pair.splitn(2, '=');
                kv.next() == Some("stale") && !matches!(kv.next(), Some("false") | Some("0"))
            })
        })
        .unwrap_or(false)
}

async fn forward_to_leader(State(api): State<ApiState>, req: Request, next: Next) -> Response {
    if wants_local(&req) {
        return next.run(req).await;
    }
    match api.leader_route().await {
        Ok(Some(addr)) => match api.relay(&addr, req).await {
            Ok(resp) => resp,
            Err(e) => ApiError(e).into_response(),
        },
        Ok(None) => next.run(req).await,
        Err(e) => ApiError(e).into_response(),
    }
}

async fn consistency_headers(State(api): State<ApiState>, req: Request, next: Next) -> Response {
    let mut resp = next.run(req).await;
    let known_leader = api.raft.get_leader_id().await.is_some();
    let last_contact = api.raft.last_contact().await.as_millis() as u64;
    let headers = resp.headers_mut();
    for (name, value) in [
        (INDEX_HEADER, api.store.applied_index().to_string()),
        (KNOWN_LEADER_HEADER, known_leader.to_string()),
        (LAST_CONTACT_HEADER, last_contact.to_string()),
    ] {
        if let Ok(value) = HeaderValue::from_str(&value) {
            headers.insert(HeaderName::from_static(name), value);
        }
    }
    resp
}

/// Build the control API router.
pub fn router(state: ApiState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    handlers::routes()
        .layer(middleware::from_fn_with_state(state.clone(), consistency_headers))
        .layer(middleware::from_fn_with_state(state.clone(), forward_to_leader))
        .layer(middleware::from_fn_with_state(state.clone(), enforce_acl))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}

/// Serve the control API until `cancel` fires.
pub async fn serve(
    listener: TcpListener,
    state: ApiState,
    cancel: CancellationToken,
) -> std::io::Result<()> {
    if let Ok(addr) = listener.local_addr() {
        tracing::info!(addr = %addr, "Starting control API");
    }
    axum::serve(listener, router(state))
        .with_graceful_shutdown(cancel.cancelled_owned())
        .await
}
