//! Wire contract with the control plane and its reqwest implementation.

use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use reqwest::header::{ACCEPT, CONTENT_LENGTH, CONTENT_TYPE, COOKIE, SET_COOKIE};
use reqwest::{Client, Method, StatusCode};
use serde::Deserialize;
use tokio_util::io::ReaderStream;

use crate::config::DirectorConfig;
use crate::error::{CpiError, Result};
use crate::model::Document;

pub const AUTH_HEADER: &str = "x-vcloud-authorization";
const SESSION_COOKIE: &str = "vcloud-token";
const JSON_MEDIA_TYPE: &str = "application/json";

#[derive(Clone)]
pub struct Credentials {
    pub user: String,
    pub organization: String,
    pub password: String,
}

impl Credentials {
    pub fn from_director(director: &DirectorConfig) -> Self {
        Self {
            user: director.user.clone(),
            organization: director.organization.clone(),
            password: director.password.clone(),
        }
    }

    /// Login principal in `user@organization` form.
    pub fn principal(&self) -> String {
        format!("{}@{}", self.user, self.organization)
    }
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("user", &self.user)
            .field("organization", &self.organization)
            .finish_non_exhaustive()
    }
}

/// Token and cookie captured by a login exchange.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionToken {
    pub token: String,
    pub cookie: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Payload {
    pub content_type: String,
    pub body: String,
}

impl Payload {
    pub fn json(body: &serde_json::Value) -> Self {
        Self {
            content_type: JSON_MEDIA_TYPE.to_string(),
            body: body.to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApiRequest {
    pub method: Method,
    /// Absolute href or path relative to the director URL.
    pub target: String,
    pub headers: Vec<(String, String)>,
    pub payload: Option<Payload>,
}

impl ApiRequest {
    pub fn new(method: Method, target: impl Into<String>) -> Self {
        Self {
            method,
            target: target.into(),
            headers: Vec::new(),
            payload: None,
        }
    }

    pub fn describe(&self) -> String {
        format!("{} {}", self.method, self.target)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApiResponse {
    pub status: u16,
    /// Header names are lower-case.
    pub headers: HashMap<String, String>,
    pub body: String,
}

impl ApiResponse {
    pub fn new(status: u16, body: impl Into<String>) -> Self {
        Self {
            status,
            headers: HashMap::new(),
            body: body.into(),
        }
    }

    pub fn is_success(&self) -> bool {
        self.status < 400
    }

    pub fn is_empty(&self) -> bool {
        self.status == StatusCode::NO_CONTENT.as_u16() || self.body.trim().is_empty()
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(&name.to_ascii_lowercase()).map(String::as_str)
    }

    async fn read(operation: &str, response: reqwest::Response) -> Result<Self> {
        let status = response.status().as_u16();
        let mut headers = HashMap::new();
        for (name, value) in response.headers() {
            if let Ok(value) = value.to_str() {
                headers.insert(name.as_str().to_ascii_lowercase(), value.to_string());
            }
        }
        let body = response
            .text()
            .await
            .map_err(|e| transport_error(operation, e))?;
        Ok(Self {
            status,
            headers,
            body,
        })
    }
}

/// Remote platform contract consumed by the protocol client.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Performs the login exchange.
    async fn authenticate(&self, credentials: &Credentials) -> Result<SessionToken>;

    /// Issues one request. Non-2xx statuses are returned, not raised.
    async fn request(&self, session: &SessionToken, request: &ApiRequest) -> Result<ApiResponse>;

    /// Streams a local file to `target`.
    async fn upload(
        &self,
        session: &SessionToken,
        target: &str,
        path: &Path,
        content_type: &str,
    ) -> Result<ApiResponse>;
}

/// Maps a failed response onto the error taxonomy. Successful responses pass through.
pub fn classify_response(operation: &str, response: ApiResponse) -> Result<ApiResponse> {
    if response.is_success() {
        return Ok(response);
    }

    let error = Document::parse(operation, &response.body)
        .ok()
        .and_then(|doc| doc.error());
    let message = error
        .as_ref()
        .map(|e| e.message.clone())
        .filter(|m| !m.is_empty())
        .unwrap_or_else(|| response.body.trim().to_string());
    let minor_code = error.as_ref().and_then(|e| e.minor_error_code.clone());

    let duplicate = minor_code.as_deref() == Some("DUPLICATE_NAME")
        || message.to_ascii_lowercase().contains("already exists");
    if duplicate {
        return Err(CpiError::AlreadyExists { message });
    }

    if response.status == StatusCode::NOT_FOUND.as_u16() {
        return Err(CpiError::NotFound {
            kind: "entity".to_string(),
            reference: operation.to_string(),
        });
    }

    Err(CpiError::Protocol {
        operation: operation.to_string(),
        status: response.status,
        major_code: error.as_ref().and_then(|e| e.major_error_code),
        minor_code,
        message,
    })
}

fn transport_error(operation: &str, e: reqwest::Error) -> CpiError {
    if e.is_builder() {
        return CpiError::invalid_response(operation, format!("malformed request: {}", e));
    }
    // connect, timeout, TLS and body errors all surface here
    CpiError::Transient {
        operation: operation.to_string(),
        message: format!("{:#}", anyhow::Error::new(e)),
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct VersionsDocument {
    #[serde(default)]
    version_info: Vec<VersionInfo>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct VersionInfo {
    version: String,
    login_url: String,
    #[serde(default)]
    deprecated: bool,
}

/// HTTP transport speaking the JSON rendition of the control plane API.
pub struct HttpTransport {
    client: Client,
    base_url: String,
}

impl HttpTransport {
    pub fn new(director: &DirectorConfig) -> anyhow::Result<Self> {
        let client = Client::builder()
            .danger_accept_invalid_certs(!director.verify_ssl)
            .timeout(Duration::from_secs(director.request_timeout_secs))
            .build()
            .context("Failed to build HTTP client")?;

        Ok(Self {
            client,
            base_url: director.url.trim_end_matches('/').to_string(),
        })
    }

    fn url(&self, target: &str) -> String {
        if target.starts_with("http://") || target.starts_with("https://") {
            target.to_string()
        } else {
            format!("{}/{}", self.base_url, target.trim_start_matches('/'))
        }
    }

    async fn discover_login_url(&self) -> Result<String> {
        let operation = "GET /api/versions";
        let response = self
            .client
            .get(self.url("/api/versions"))
            .header(ACCEPT, JSON_MEDIA_TYPE)
            .send()
            .await
            .map_err(|e| transport_error(operation, e))?;
        let response = ApiResponse::read(operation, response).await?;
        let response = classify_response(operation, response)?;

        let versions: VersionsDocument = serde_json::from_str(&response.body)
            .map_err(|e| CpiError::invalid_response(operation, e))?;
        let latest = versions
            .version_info
            .into_iter()
            .filter(|v| !v.deprecated)
            .last()
            .ok_or_else(|| CpiError::invalid_response(operation, "no supported API version"))?;

        tracing::debug!("Using API version {} ({})", latest.version, latest.login_url);
        Ok(latest.login_url)
    }

    fn session_request(
        &self,
        method: Method,
        target: &str,
        session: &SessionToken,
    ) -> reqwest::RequestBuilder {
        self.client
            .request(method, self.url(target))
            .header(AUTH_HEADER, &session.token)
            .header(COOKIE, format!("{}={}", SESSION_COOKIE, session.cookie))
            .header(ACCEPT, JSON_MEDIA_TYPE)
    }
}

fn session_cookie(headers: &reqwest::header::HeaderMap) -> Option<String> {
    headers
        .get_all(SET_COOKIE)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .find_map(|cookie| {
            let pair = cookie.split(';').next()?.trim();
            let (name, value) = pair.split_once('=')?;
            (name == SESSION_COOKIE).then(|| value.to_string())
        })
}

#[async_trait]
impl Transport for HttpTransport {
    async fn authenticate(&self, credentials: &Credentials) -> Result<SessionToken> {
        let login_url = self.discover_login_url().await?;
        let operation = format!("POST {}", login_url);

        let response = self
            .client
            .post(self.url(&login_url))
            .basic_auth(credentials.principal(), Some(&credentials.password))
            .header(ACCEPT, JSON_MEDIA_TYPE)
            .send()
            .await
            .map_err(|e| transport_error(&operation, e))?;

        let cookie = session_cookie(response.headers());
        let response = ApiResponse::read(&operation, response).await?;
        let response = classify_response(&operation, response)?;

        let token = response
            .header(AUTH_HEADER)
            .map(str::to_string)
            .ok_or_else(|| {
                CpiError::invalid_response(&operation, format!("missing {} header", AUTH_HEADER))
            })?;
        let cookie = cookie.unwrap_or_else(|| token.clone());

        Ok(SessionToken { token, cookie })
    }

    async fn request(&self, session: &SessionToken, request: &ApiRequest) -> Result<ApiResponse> {
        let operation = request.describe();
        let mut builder = self.session_request(request.method.clone(), &request.target, session);
        for (name, value) in &request.headers {
            builder = builder.header(name.as_str(), value.as_str());
        }
        if let Some(payload) = &request.payload {
            builder = builder
                .header(CONTENT_TYPE, payload.content_type.as_str())
                .body(payload.body.clone());
        }

        let response = builder
            .send()
            .await
            .map_err(|e| transport_error(&operation, e))?;
        ApiResponse::read(&operation, response).await
    }

    async fn upload(
        &self,
        session: &SessionToken,
        target: &str,
        path: &Path,
        content_type: &str,
    ) -> Result<ApiResponse> {
        let operation = format!("PUT {}", target);
        let local_io = |source| CpiError::LocalIo {
            path: path.display().to_string(),
            source,
        };
        let file = tokio::fs::File::open(path).await.map_err(local_io)?;
        let size = file.metadata().await.map_err(local_io)?.len();

        tracing::debug!("Uploading {} ({} bytes) to {}", path.display(), size, target);
        let response = self
            .session_request(Method::PUT, target, session)
            .header(CONTENT_TYPE, content_type)
            .header(CONTENT_LENGTH, size)
            .body(reqwest::Body::wrap_stream(ReaderStream::new(file)))
            .send()
            .await
            .map_err(|e| transport_error(&operation, e))?;
        ApiResponse::read(&operation, response).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mockito::{Matcher, Server};

    fn director(url: &str) -> DirectorConfig {
        DirectorConfig {
            url: url.to_string(),
            user: "cpi-admin".to_string(),
            organization: "acme".to_string(),
            password: "s3cret".to_string(),
            verify_ssl: false,
            request_timeout_secs: 5,
            virtual_datacenter: None,
        }
    }

    fn credentials() -> Credentials {
        Credentials::from_director(&director("http://unused"))
    }

    fn session() -> SessionToken {
        SessionToken {
            token: "tok-1".to_string(),
            cookie: "cookie-1".to_string(),
        }
    }

    #[tokio::test]
    async fn test_authenticate_discovers_login_url() {
        let mut server = Server::new_async().await;
        let login_url = format!("{}/api/sessions", server.url());

        let _versions = server
            .mock("GET", "/api/versions")
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(format!(
                r#"{{"versionInfo":[
                    {{"version":"5.1","loginUrl":"{0}/old","deprecated":false}},
                    {{"version":"5.5","loginUrl":"{0}","deprecated":false}},
                    {{"version":"6.0","loginUrl":"{0}/beta","deprecated":true}}
                ]}}"#,
                login_url
            ))
            .create_async()
            .await;

        let login = server
            .mock("POST", "/api/sessions")
            .match_header("authorization", Matcher::Regex("^Basic ".to_string()))
            .with_status(200)
            .with_header("x-vcloud-authorization", "tok-1")
            .with_header("set-cookie", "vcloud-token=cookie-1; Secure; Path=/")
            .with_body(r#"{"href":"session"}"#)
            .expect(1)
            .create_async()
            .await;

        let transport = HttpTransport::new(&director(&server.url())).unwrap();
        let token = transport.authenticate(&credentials()).await.unwrap();

        assert_eq!(token, session());
        login.assert_async().await;
    }

    #[tokio::test]
    async fn test_authenticate_rejected() {
        let mut server = Server::new_async().await;
        let _versions = server
            .mock("GET", "/api/versions")
            .with_status(200)
            .with_body(format!(
                r#"{{"versionInfo":[{{"version":"5.5","loginUrl":"{}/api/sessions"}}]}}"#,
                server.url()
            ))
            .create_async()
            .await;
        let _login = server
            .mock("POST", "/api/sessions")
            .with_status(401)
            .with_body(r#"{"majorErrorCode":401,"minorErrorCode":"ACCESS_DENIED","message":"bad credentials"}"#)
            .create_async()
            .await;

        let transport = HttpTransport::new(&director(&server.url())).unwrap();
        let err = transport.authenticate(&credentials()).await.unwrap_err();

        match err {
            CpiError::Protocol {
                status, message, ..
            } => {
                assert_eq!(status, 401);
                assert_eq!(message, "bad credentials");
            }
            other => panic!("unexpected error: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_request_attaches_session() {
        let mut server = Server::new_async().await;
        let mock = server
            .mock("POST", "/api/vApp/vm-1/action/reconfigure")
            .match_header("x-vcloud-authorization", "tok-1")
            .match_header("cookie", "vcloud-token=cookie-1")
            .match_header("content-type", "application/json")
            .match_body(Matcher::Json(serde_json::json!({"memoryMb": 2048})))
            .with_status(202)
            .with_body(r#"{"href":"task-1","type":"application/vnd.vmware.vcloud.task+json"}"#)
            .expect(1)
            .create_async()
            .await;

        let transport = HttpTransport::new(&director(&server.url())).unwrap();
        let mut request = ApiRequest::new(Method::POST, "api/vApp/vm-1/action/reconfigure");
        request.payload = Some(Payload::json(&serde_json::json!({"memoryMb": 2048})));

        let response = transport.request(&session(), &request).await.unwrap();
        assert_eq!(response.status, 202);
        assert!(response.body.contains("task-1"));
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_request_returns_error_status_unraised() {
        let mut server = Server::new_async().await;
        let _mock = server
            .mock("GET", "/api/vApp/missing")
            .with_status(404)
            .create_async()
            .await;

        let transport = HttpTransport::new(&director(&server.url())).unwrap();
        let request = ApiRequest::new(Method::GET, format!("{}/api/vApp/missing", server.url()));
        let response = transport.request(&session(), &request).await.unwrap();
        assert_eq!(response.status, 404);
    }

    #[tokio::test]
    async fn test_connection_failure_is_transient() {
        let transport = HttpTransport::new(&director("http://127.0.0.1:1")).unwrap();
        let request = ApiRequest::new(Method::GET, "/api/org");
        let err = transport.request(&session(), &request).await.unwrap_err();
        assert!(err.is_transient(), "expected transient, got {:?}", err);
    }

    #[tokio::test]
    async fn test_upload_streams_file() {
        let mut server = Server::new_async().await;
        let mock = server
            .mock("PUT", "/transfer/disk-1.vmdk")
            .match_header("content-type", "application/octet-stream")
            .match_header("x-vcloud-authorization", "tok-1")
            .match_body("disk image bytes")
            .with_status(200)
            .expect(1)
            .create_async()
            .await;

        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("disk-1.vmdk");
        std::fs::write(&path, "disk image bytes").unwrap();

        let transport = HttpTransport::new(&director(&server.url())).unwrap();
        let response = transport
            .upload(&session(), "/transfer/disk-1.vmdk", &path, "application/octet-stream")
            .await
            .unwrap();
        assert!(response.is_empty());
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_upload_missing_file() {
        let transport = HttpTransport::new(&director("http://127.0.0.1:1")).unwrap();
        let err = transport
            .upload(
                &session(),
                "/transfer/x",
                Path::new("/nonexistent/stemcell.ova"),
                "application/octet-stream",
            )
            .await
            .unwrap_err();
        assert!(matches!(err, CpiError::LocalIo { .. }));
    }

    #[test]
    fn test_classify_duplicate_name() {
        let response = ApiResponse::new(
            400,
            r#"{"majorErrorCode":400,"minorErrorCode":"DUPLICATE_NAME","message":"The VCD entity vm-1 already exists."}"#,
        );
        let err = classify_response("POST /api/vdc/1/action/instantiate", response).unwrap_err();
        assert!(matches!(err, CpiError::AlreadyExists { .. }));
    }

    #[test]
    fn test_classify_not_found_and_protocol() {
        let err = classify_response("GET /api/vApp/vm-9", ApiResponse::new(404, "")).unwrap_err();
        assert!(err.is_not_found());

        let err = classify_response(
            "POST /api/vApp/vm-1/power/action/powerOn",
            ApiResponse::new(
                500,
                r#"{"majorErrorCode":500,"minorErrorCode":"INTERNAL_SERVER_ERROR","message":"boom"}"#,
            ),
        )
        .unwrap_err();
        match err {
            CpiError::Protocol {
                status,
                major_code,
                minor_code,
                message,
                ..
            } => {
                assert_eq!(status, 500);
                assert_eq!(major_code, Some(500));
                assert_eq!(minor_code.as_deref(), Some("INTERNAL_SERVER_ERROR"));
                assert_eq!(message, "boom");
            }
            other => panic!("unexpected error: {:?}", other),
        }
    }

    #[test]
    fn test_classify_passes_success() {
        let response = ApiResponse::new(204, "");
        let response = classify_response("DELETE /api/vApp/vm-1", response).unwrap();
        assert!(response.is_empty());
    }
}
