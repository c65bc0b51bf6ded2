use std::future::Future;
use std::ops::ControlFlow;
use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use reqwest::{Method, StatusCode};
use tokio_util::sync::CancellationToken;

use crate::cache::Cache;
use crate::config::{Config, ControlConfig, DirectorConfig};
use crate::error::{CpiError, Result};
use crate::model::{Document, Link, Task};
use crate::retry::RetryPolicy;
use crate::session::SessionManager;
use crate::transport::{
    classify_response, ApiRequest, ApiResponse, Credentials, HttpTransport, Payload,
    SessionToken, Transport,
};
use crate::waiter::{TaskSource, TaskWaiter};

/// Per-call options for [`ProtocolClient::invoke`] and friends.
#[derive(Debug, Clone, Default)]
pub struct InvokeOptions {
    pub payload: Option<Payload>,
    pub headers: Vec<(String, String)>,
    /// Return failed tasks instead of raising (`invoke_and_wait` only).
    pub accept_failure: bool,
}

impl InvokeOptions {
    pub fn json(body: &serde_json::Value) -> Self {
        Self {
            payload: Some(Payload::json(body)),
            ..Default::default()
        }
    }
}

/// Authenticated connection to the control plane used by business steps.
pub struct ProtocolClient {
    transport: Arc<dyn Transport>,
    sessions: SessionManager,
    retry: RetryPolicy,
    waiter: TaskWaiter,
    cache: Cache<Document>,
    organization: String,
    virtual_datacenter: Option<String>,
    cancel: CancellationToken,
}

impl ProtocolClient {
    pub fn new(config: &Config) -> anyhow::Result<Self> {
        let transport = HttpTransport::new(&config.director)?;
        Ok(Self::with_transport(
            Arc::new(transport),
            &config.director,
            &config.control,
        ))
    }

    pub fn with_transport(
        transport: Arc<dyn Transport>,
        director: &DirectorConfig,
        control: &ControlConfig,
    ) -> Self {
        Self {
            transport,
            sessions: SessionManager::new(
                Credentials::from_director(director),
                control.cookie_timeout(),
            ),
            retry: RetryPolicy::from_control(control),
            waiter: TaskWaiter::from_control(control),
            cache: Cache::new(),
            organization: director.organization.clone(),
            virtual_datacenter: director.virtual_datacenter.clone(),
            cancel: CancellationToken::new(),
        }
    }

    /// Replaces the token observed by every request, poll and backoff.
    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn cancellation_token(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn waiter(&self) -> &TaskWaiter {
        &self.waiter
    }

    pub fn retry_policy(&self) -> &RetryPolicy {
        &self.retry
    }

    pub fn login_count(&self) -> u64 {
        self.sessions.login_count()
    }

    fn check_cancelled(&self, operation: &str) -> Result<()> {
        if self.cancel.is_cancelled() {
            return Err(CpiError::Cancelled {
                operation: operation.to_string(),
            });
        }
        Ok(())
    }

    /// A renewed login drops every cached lookup. The first login has
    /// nothing cached to invalidate and lets in-flight lookups be stored.
    async fn session(&self) -> Result<SessionToken> {
        self.retry
            .call("login", &self.cancel, || {
                self.sessions.ensure(self.transport.as_ref(), || {
                    if self.sessions.login_count() > 1 {
                        self.cache.clear();
                    }
                })
            })
            .await
    }

    /// Runs `call` with a valid session under the retry policy, racing it
    /// against cancellation. A 401 drops the session and replays the call
    /// once after a new login.
    async fn dispatch<F, Fut>(&self, operation: &str, mut call: F) -> Result<ApiResponse>
    where
        F: FnMut(SessionToken) -> Fut,
        Fut: Future<Output = Result<ApiResponse>>,
    {
        self.check_cancelled(operation)?;

        let mut replayed = false;
        loop {
            let session = self.session().await?;
            let attempt = self
                .retry
                .call(operation, &self.cancel, || call(session.clone()));
            let response = tokio::select! {
                _ = self.cancel.cancelled() => {
                    return Err(CpiError::Cancelled {
                        operation: operation.to_string(),
                    });
                }
                response = attempt => response?,
            };
            if response.status == StatusCode::UNAUTHORIZED.as_u16() && !replayed {
                tracing::warn!("{} rejected the session, logging in again", operation);
                self.sessions.invalidate(&session).await;
                replayed = true;
                continue;
            }
            return classify_response(operation, response);
        }
    }

    /// Issues one request and returns the response without parsing it.
    ///
    /// A 401 drops the session and replays the request once after a new login.
    pub async fn invoke_raw(
        &self,
        method: Method,
        target: &str,
        options: &InvokeOptions,
    ) -> Result<ApiResponse> {
        let request = ApiRequest {
            method,
            target: target.to_string(),
            headers: options.headers.clone(),
            payload: options.payload.clone(),
        };
        let operation = request.describe();
        tracing::debug!("{}", operation);

        let transport = self.transport.as_ref();
        let request = &request;
        self.dispatch(&operation, |session| async move {
            transport.request(&session, request).await
        })
        .await
    }

    /// Issues one request and parses the body. Empty responses yield `None`.
    pub async fn invoke(
        &self,
        method: Method,
        target: &str,
        options: &InvokeOptions,
    ) -> Result<Option<Document>> {
        let operation = format!("{} {}", method, target);
        let response = self.invoke_raw(method, target, options).await?;
        if response.is_empty() {
            return Ok(None);
        }
        Document::parse(&operation, &response.body).map(Some)
    }

    /// Like [`invoke`](Self::invoke), then waits for the returned task, or
    /// for the tasks of the returned entity, to finish.
    pub async fn invoke_and_wait(
        &self,
        method: Method,
        target: &str,
        options: &InvokeOptions,
    ) -> Result<Option<Document>> {
        let Some(document) = self.invoke(method, target, options).await? else {
            return Ok(None);
        };

        if document.is_task() {
            let task = self
                .wait_task(document.to_task()?, options.accept_failure)
                .await?;
            let value = serde_json::to_value(&task)
                .map_err(|e| CpiError::invalid_response(&task.href, e))?;
            return Ok(Some(Document::new(value)));
        }

        self.wait_entity(&document, options.accept_failure)
            .await
            .map(Some)
    }

    /// GET that must return a body.
    pub async fn get(&self, target: &str) -> Result<Document> {
        self.invoke(Method::GET, target, &InvokeOptions::default())
            .await?
            .ok_or_else(|| CpiError::invalid_response(&format!("GET {}", target), "empty body"))
    }

    pub async fn resolve_link(&self, link: &Link) -> Result<Document> {
        self.get(&link.href).await
    }

    /// Memoized GET of `href`; invalidated by [`flush_cache`](Self::flush_cache)
    /// and by every new login.
    pub async fn resolve_cached(&self, href: &str) -> Result<Document> {
        self.cache.get(href, || self.get(href)).await
    }

    /// Looks an entity up by id through the entity resolver.
    pub async fn resolve_entity(&self, id: &str) -> Result<Document> {
        let not_found = || CpiError::NotFound {
            kind: "entity".to_string(),
            reference: id.to_string(),
        };

        let target = format!("/api/entity/{}", urlencoding::encode(id));
        let resolver = match self.get(&target).await {
            Ok(resolver) => resolver,
            Err(e) if e.is_not_found() => return Err(not_found()),
            Err(e) => return Err(e),
        };

        let link = resolver
            .link("alternate", None)
            .or_else(|| resolver.links().into_iter().next())
            .ok_or_else(not_found)?;
        tracing::debug!("Resolved entity {} to {}", id, link.href);

        match self.resolve_link(&link).await {
            Err(e) if e.is_not_found() => Err(not_found()),
            other => other,
        }
    }

    /// Fetches a fresh copy of `entity`, bypassing the cache.
    pub async fn reload(&self, entity: &Document) -> Result<Document> {
        let href = entity
            .href()
            .ok_or_else(|| CpiError::invalid_response("reload", "entity has no href"))?;
        self.get(href).await
    }

    /// Organization named in the configuration, cached.
    pub async fn organization(&self) -> Result<Document> {
        let key = format!("org:{}", self.organization);
        self.cache
            .get(&key, || async {
                let orgs = self.get("/api/org").await?;
                let link = orgs
                    .links()
                    .into_iter()
                    .find(|l| l.name.as_deref() == Some(self.organization.as_str()))
                    .ok_or_else(|| CpiError::NotFound {
                        kind: "organization".to_string(),
                        reference: self.organization.clone(),
                    })?;
                self.resolve_link(&link).await
            })
            .await
    }

    /// Virtual datacenter named in the configuration, cached.
    pub async fn virtual_datacenter(&self) -> Result<Document> {
        let name = self.virtual_datacenter.as_deref().ok_or_else(|| CpiError::NotFound {
            kind: "virtual datacenter".to_string(),
            reference: "<not configured>".to_string(),
        })?;
        let key = format!("vdc:{}", name);
        self.cache
            .get(&key, || async {
                let org = self.organization().await?;
                let link = org
                    .links()
                    .into_iter()
                    .find(|l| {
                        l.name.as_deref() == Some(name)
                            && l.media_type
                                .as_deref()
                                .map(|t| t.contains("vdc"))
                                .unwrap_or(false)
                    })
                    .ok_or_else(|| CpiError::NotFound {
                        kind: "virtual datacenter".to_string(),
                        reference: name.to_string(),
                    })?;
                self.resolve_link(&link).await
            })
            .await
    }

    pub async fn wait_task(&self, task: Task, accept_failure: bool) -> Result<Task> {
        self.waiter
            .wait_task(self, task, accept_failure, &self.cancel)
            .await
    }

    pub async fn wait_entity(&self, entity: &Document, accept_failure: bool) -> Result<Document> {
        self.waiter
            .wait_entity(self, entity, accept_failure, &self.cancel)
            .await
    }

    pub async fn timed_loop<F, Fut, T>(
        &self,
        operation: &str,
        raise_on_timeout: bool,
        block: F,
    ) -> Result<Option<T>>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<ControlFlow<T>>>,
    {
        self.waiter
            .timed_loop(operation, raise_on_timeout, &self.cancel, block)
            .await
    }

    /// Drops every cached lookup. Call after mutating a cached collection.
    pub fn flush_cache(&self) {
        self.cache.clear();
    }

    /// Streams a local file to an upload href handed out by the platform.
    pub async fn upload_stream(&self, target: &str, path: &Path, content_type: &str) -> Result<()> {
        let operation = format!("PUT {}", target);
        tracing::info!("Uploading {} to {}", path.display(), target);

        let transport = self.transport.as_ref();
        self.dispatch(&operation, |session| async move {
            transport.upload(&session, target, path, content_type).await
        })
        .await?;
        Ok(())
    }
}

#[async_trait]
impl TaskSource for ProtocolClient {
    async fn reload_task(&self, task: &Task) -> Result<Task> {
        self.get(&task.href).await?.to_task()
    }

    async fn reload_entity(&self, entity: &Document) -> Result<Document> {
        self.reload(entity).await
    }
}

#[cfg(test)]
#[path = "client_tests.rs"]
mod client_tests;
