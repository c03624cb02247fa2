//! Typed client for the control API, used by the CLI and by tests.

use std::collections::{BTreeMap, BTreeSet};
use std::time::Duration;

use reqwest::{Method, RequestBuilder};
use serde::de::DeserializeOwned;
use serde::Serialize;
use uuid::Uuid;

use super::views::*;
use super::{REQUEST_ID_HEADER, TOKEN_HEADER};
use crate::error::{Result, StevedoreError};
use crate::model::{Allocation, HealthCheckResult, JobSpec};
use crate::registry::{ServiceInstance, ServiceQuery};

#[derive(Clone)]
pub struct ApiClient {
    base: String,
    http: reqwest::Client,
    token: Option<String>,
    /// How long writes keep retrying transient failures.
    retry_for: Duration,
}

impl ApiClient {
    /// `addr` is `host:port` or a full `http://` URL.
    pub fn new(addr: &str) -> Self {
        let base = if addr.starts_with("http://") || addr.starts_with("https://") {
            addr.trim_end_matches('/').to_string()
        } else {
            format!("http://{}", addr)
        };
        Self {
            base,
            http: reqwest::Client::new(),
            token: None,
            retry_for: Duration::from_secs(15),
        }
    }

    pub fn with_token(mut self, token: Option<String>) -> Self {
        self.token = token;
        self
    }

    pub fn with_retry_for(mut self, retry_for: Duration) -> Self {
        self.retry_for = retry_for;
        self
    }

    fn request(&self, method: Method, path: &str) -> RequestBuilder {
        let mut builder = self
            .http
            .request(method, format!("{}{}", self.base, path))
            .timeout(Duration::from_secs(30));
        if let Some(token) = &self.token {
            builder = builder.header(TOKEN_HEADER, token);
        }
        builder
    }

    async fn send<T: DeserializeOwned>(builder: RequestBuilder) -> Result<T> {
        let resp = builder.send().await?;
        let status = resp.status();
        if status.is_success() {
            return Ok(resp.json().await?);
        }
        let text = resp.text().await.unwrap_or_default();
        Err(match serde_json::from_str::<ErrorBody>(&text) {
            Ok(body) => StevedoreError::Remote {
                code: body.code,
                message: body.message,
                retryable: body.retryable,
            },
            Err(_) => StevedoreError::Remote {
                code: format!("http_{}", status.as_u16()),
                message: text,
                retryable: status.is_server_error(),
            },
        })
    }

    async fn get<T: DeserializeOwned>(&self, path: &str) -> Result<T> {
        Self::send(self.request(Method::GET, path)).await
    }

    /// Send a write, retrying transient failures under one request id.
    async fn write<B: Serialize>(
        &self,
        method: Method,
        path: &str,
        body: Option<&B>,
        request_id: Option<String>,
    ) -> Result<WriteResponse> {
        let rid = request_id.unwrap_or_else(|| Uuid::new_v4().to_string());
        let deadline = tokio::time::Instant::now() + self.retry_for;
        let mut backoff = Duration::from_millis(100);
        loop {
            let mut builder = self
                .request(method.clone(), path)
                .header(REQUEST_ID_HEADER, &rid);
            if let Some(body) = body {
                builder = builder.json(body);
            }
            match Self::send(builder).await {
                Ok(resp) => return Ok(resp),
                Err(e) if e.is_retryable() && tokio::time::Instant::now() + backoff < deadline => {
                    tracing::debug!(path, error = %e, "Retrying write");
                    tokio::time::sleep(backoff).await;
                    backoff = (backoff * 2).min(Duration::from_secs(1));
                }
                Err(e) => return Err(e),
            }
        }
    }

    pub async fn leader(&self) -> Result<LeaderInfo> {
        self.get("/status/leader").await
    }

    pub async fn peers(&self) -> Result<Vec<PeerInfo>> {
        self.get("/status/peers").await
    }

    pub async fn health(&self) -> Result<HealthReport> {
        self.get("/status/health").await
    }

    pub async fn nodes(&self) -> Result<Vec<NodeSummary>> {
        self.get("/nodes").await
    }

    pub async fn node(&self, id: u64) -> Result<NodeDetail> {
        self.get(&format!("/node/{}", id)).await
    }

    pub async fn jobs(&self) -> Result<Vec<JobSummary>> {
        self.get("/jobs").await
    }

    pub async fn job(&self, id: &str) -> Result<JobView> {
        self.get(&format!("/job/{}", id)).await
    }

    pub async fn submit_job(&self, spec: &JobSpec, request_id: Option<String>) -> Result<WriteResponse> {
        self.write(Method::PUT, &format!("/job/{}", spec.id), Some(spec), request_id)
            .await
    }

    pub async fn stop_job(&self, id: &str) -> Result<WriteResponse> {
        self.write::<()>(Method::DELETE, &format!("/job/{}", id), None, None)
            .await
    }

    pub async fn dispatch(
        &self,
        id: &str,
        meta: BTreeMap<String, String>,
        request_id: Option<String>,
    ) -> Result<WriteResponse> {
        let body = DispatchRequest { meta };
        self.write(Method::POST, &format!("/job/{}/dispatch", id), Some(&body), request_id)
            .await
    }

    pub async fn allocations(&self, job_id: &str) -> Result<Vec<Allocation>> {
        self.get(&format!("/job/{}/allocations", job_id)).await
    }

    pub async fn allocation(&self, id: Uuid) -> Result<Allocation> {
        self.get(&format!("/allocation/{}", id)).await
    }

    pub async fn catalog_services(&self) -> Result<BTreeMap<String, BTreeSet<String>>> {
        self.get("/catalog/services").await
    }

    pub async fn catalog_service(&self, name: &str, query: &ServiceQuery) -> Result<Vec<ServiceInstance>> {
        let mut params: Vec<(&str, String)> = Vec::new();
        if let Some(tag) = &query.tag {
            params.push(("tag", tag.clone()));
        }
        if query.passing {
            params.push(("passing", "true".into()));
        }
        if query.all {
            params.push(("all", "true".into()));
        }
        let builder = self
            .request(Method::GET, &format!("/catalog/service/{}", name))
            .query(&params);
        Self::send(builder).await
    }

    pub async fn check(&self, check_id: &str) -> Result<HealthCheckResult> {
        self.get(&format!("/health/{}", check_id)).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_base_url_normalisation() {
        assert_eq!(ApiClient::new("127.0.0.1:4646").base, "http://127.0.0.1:4646");
        assert_eq!(ApiClient::new("http://agent:4646/").base, "http://agent:4646");
    }
}
